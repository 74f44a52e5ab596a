//! Portfolio Guard
//! Mission: Authoritative risk gate and position sizer
//!
//! Enforces the kill switch, the daily-loss limit, the open-position cap and
//! the per-trade contract cap. Every mutation is persisted so the state
//! (including the kill switch) survives restarts.

use crate::config::TradingConfig;
use crate::db::{now_iso, Db};
use crate::exchange::KalshiClient;
use crate::models::{LegSide, Opportunity, PortfolioState};
use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

pub struct Portfolio {
    db: Db,
    max_risk_per_trade_pct: f64,
    max_daily_loss: f64,
    max_open_positions: i64,
    max_contracts_per_trade: i64,

    balance: f64,
    daily_pnl: f64,
    open_positions: i64,
    kill_switch: bool,
    last_pnl_date: String,
}

impl Portfolio {
    /// Restore persisted state (kill switch included) and apply risk limits
    /// from config. A daily P&L recorded on a previous UTC date is dropped.
    pub fn new(db: Db, cfg: &TradingConfig) -> Result<Self> {
        let today = Utc::now().date_naive().to_string();
        let mut portfolio = Self {
            db,
            max_risk_per_trade_pct: cfg.max_risk_per_trade_pct,
            max_daily_loss: cfg.max_daily_loss,
            max_open_positions: cfg.max_open_positions,
            max_contracts_per_trade: cfg.max_contracts_per_trade,
            balance: 0.0,
            daily_pnl: 0.0,
            open_positions: 0,
            kill_switch: false,
            last_pnl_date: today.clone(),
        };

        if let Some(state) = portfolio.db.get_portfolio_state()? {
            portfolio.balance = state.balance;
            portfolio.open_positions = state.open_positions;
            portfolio.kill_switch = state.kill_switch;
            if state.last_updated.starts_with(&today) {
                portfolio.daily_pnl = state.daily_pnl;
            }
        }
        Ok(portfolio)
    }

    // -----------------------------------------------------------------
    // Sync with the exchange + store
    // -----------------------------------------------------------------

    /// Refresh balance and positions from the exchange, roll the daily P&L
    /// at the UTC midnight boundary, and reload the persisted kill switch.
    /// Individual fetch failures are logged and tolerated.
    pub async fn sync(&mut self, client: &KalshiClient) -> Result<()> {
        match client.get_balance().await {
            Ok(resp) => self.balance = resp.balance as f64 / 100.0,
            Err(e) => warn!("Failed to sync balance from exchange: {}", e),
        }

        match client.get_positions().await {
            Ok(resp) => self.open_positions = resp.market_positions.len() as i64,
            Err(e) => warn!("Failed to sync positions from exchange: {}", e),
        }

        let today = Utc::now().date_naive().to_string();
        if self.last_pnl_date != today {
            self.daily_pnl = 0.0;
            self.last_pnl_date = today;
        }

        if let Some(state) = self.db.get_portfolio_state()? {
            self.kill_switch = state.kill_switch;
        }

        self.save_state()?;

        info!(
            "Portfolio synced: balance=${:.2} daily_pnl=${:.2} positions={} kill={}",
            self.balance, self.daily_pnl, self.open_positions, self.kill_switch
        );
        Ok(())
    }

    fn save_state(&self) -> Result<()> {
        self.db.upsert_portfolio_state(&PortfolioState {
            balance: self.balance,
            daily_pnl: self.daily_pnl,
            open_positions: self.open_positions,
            kill_switch: self.kill_switch,
            last_updated: now_iso(),
        })
    }

    // -----------------------------------------------------------------
    // Risk checks
    // -----------------------------------------------------------------

    /// True only when every safety check passes.
    pub fn can_trade(&self) -> bool {
        if self.kill_switch {
            warn!("KILL SWITCH is active, no trading");
            return false;
        }
        if self.daily_pnl <= -self.max_daily_loss {
            warn!(
                "Daily loss limit reached (${:.2} <= -${:.2}), no trading",
                self.daily_pnl, self.max_daily_loss
            );
            return false;
        }
        if self.open_positions >= self.max_open_positions {
            warn!(
                "Max open positions reached ({} >= {}), no trading",
                self.open_positions, self.max_open_positions
            );
            return false;
        }
        true
    }

    /// Contracts to trade: min of the risk-based size, the shallowest leg
    /// depth, and the hard per-trade cap. Never negative.
    pub fn calculate_position_size(&self, opportunity: &Opportunity) -> i64 {
        if opportunity.magnitude <= 0.0 {
            return 0;
        }

        let max_risk = self.balance * self.max_risk_per_trade_pct;
        let risk_based = (max_risk / opportunity.magnitude).floor() as i64;

        let min_depth = opportunity
            .legs
            .iter()
            .map(|l| l.depth)
            .min()
            .unwrap_or(0);

        risk_based
            .min(min_depth)
            .min(self.max_contracts_per_trade)
            .max(0)
    }

    // -----------------------------------------------------------------
    // P&L tracking
    // -----------------------------------------------------------------

    /// Buys cost (price * count + fees); sells return (price * count - fees).
    pub fn record_fill(&mut self, action: LegSide, price: f64, count: i64, fees: f64) -> Result<()> {
        match action {
            LegSide::Sell => self.daily_pnl += price * count as f64 - fees,
            LegSide::Buy => self.daily_pnl -= price * count as f64 + fees,
        }
        self.save_state()
    }

    pub fn record_settlement(&mut self, payout: f64) -> Result<()> {
        self.daily_pnl += payout;
        self.save_state()
    }

    // -----------------------------------------------------------------
    // Kill switch
    // -----------------------------------------------------------------

    pub fn activate_kill_switch(&mut self) -> Result<()> {
        self.kill_switch = true;
        self.save_state()?;
        warn!("KILL SWITCH ACTIVATED");
        Ok(())
    }

    pub fn deactivate_kill_switch(&mut self) -> Result<()> {
        self.kill_switch = false;
        self.save_state()?;
        info!("Kill switch deactivated");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn daily_pnl(&self) -> f64 {
        self.daily_pnl
    }

    pub fn open_positions(&self) -> i64 {
        self.open_positions
    }

    pub fn kill_switch_active(&self) -> bool {
        self.kill_switch
    }

    pub fn summary(&self) -> PortfolioState {
        PortfolioState {
            balance: self.balance,
            daily_pnl: self.daily_pnl,
            open_positions: self.open_positions,
            kill_switch: self.kill_switch,
            last_updated: now_iso(),
        }
    }
}
