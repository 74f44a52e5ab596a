//! Signal Execution
//! Mission: Convert validated opportunities into exchange orders
//!
//! Moves each opportunity through DETECTED -> EXECUTING -> {FILLED | FAILED |
//! EXPIRED}, persisting every transition. Two-leg trades place the
//! harder-to-fill leg first, wait for its fill, then chase the second leg one
//! cent more aggressively. Partition trades place every leg simultaneously
//! and cancel stragglers. Dry-run mode walks the identical control flow with
//! synthetic order ids.
//!
//! When leg 2 of a two-leg trade cannot be filled, the directional residual
//! from leg 1 is accepted as-is; no compensating order is chased.

use crate::db::{now_iso, Db};
use crate::exchange::types::{ApiOrder, OrderRequest};
use crate::exchange::KalshiClient;
use crate::fees::taker_fee;
use crate::models::{Leg, LegSide, Opportunity, OpportunityStatus, Trade};
use crate::portfolio::Portfolio;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

const FILL_WAIT_SECS: u64 = 30;
const PARTITION_SETTLE_SECS: u64 = 5;
const ORDER_EXPIRY_SECS: i64 = 30;

pub struct Executor {
    db: Db,
    client: Arc<KalshiClient>,
    dry_run: bool,
}

impl Executor {
    pub fn new(db: Db, client: Arc<KalshiClient>, dry_run: bool) -> Self {
        Self {
            db,
            client,
            dry_run,
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    // -----------------------------------------------------------------
    // Public entry point
    // -----------------------------------------------------------------

    /// Execute an opportunity. Returns true on a complete fill. A safety
    /// refusal from the portfolio guard is a clean false with no side
    /// effects; re-running on an already-FILLED opportunity is a no-op.
    pub async fn execute(
        &self,
        portfolio: &mut Portfolio,
        opportunity: &Opportunity,
    ) -> Result<bool> {
        if let Some(stored) = self.db.get_opportunity(&opportunity.id)? {
            if stored.status == OpportunityStatus::Filled {
                info!("Opportunity {} already filled, nothing to do", opportunity.id);
                return Ok(true);
            }
        }

        if Utc::now() > opportunity.expires_at {
            self.db
                .update_opportunity_status(&opportunity.id, OpportunityStatus::Expired)?;
            info!("Opportunity {} expired before execution", opportunity.id);
            return Ok(false);
        }

        if opportunity.legs.is_empty() {
            warn!("Opportunity {} has no legs, skipping", opportunity.id);
            return Ok(false);
        }

        // Pre-flight: the guard refuses with no state change, no side effects
        if !portfolio.can_trade() {
            warn!("Portfolio safety check failed, skipping trade");
            return Ok(false);
        }
        let count = portfolio.calculate_position_size(opportunity);
        if count <= 0 {
            info!("Position size is 0, opportunity not worth trading");
            return Ok(false);
        }

        info!(
            "Executing opportunity {}: signal={} count={} dry_run={}",
            opportunity.id,
            opportunity.signal.label(),
            count,
            self.dry_run
        );

        self.db
            .update_opportunity_status(&opportunity.id, OpportunityStatus::Executing)?;

        let result = if opportunity.signal.is_partition() {
            self.execute_multi_leg(portfolio, opportunity, count).await
        } else {
            self.execute_two_leg(portfolio, opportunity, count).await
        };

        let success = match result {
            Ok(success) => success,
            Err(e) => {
                error!("Execution error for opportunity {}: {}", opportunity.id, e);
                false
            }
        };

        let final_status = if success {
            OpportunityStatus::Filled
        } else {
            OpportunityStatus::Failed
        };
        self.db
            .update_opportunity_status(&opportunity.id, final_status)?;
        Ok(success)
    }

    // -----------------------------------------------------------------
    // Two-leg execution (SUBSET, THRESHOLD, IMPLICATION)
    // -----------------------------------------------------------------

    async fn execute_two_leg(
        &self,
        portfolio: &mut Portfolio,
        opportunity: &Opportunity,
        count: i64,
    ) -> Result<bool> {
        if opportunity.legs.len() < 2 {
            error!(
                "Two-leg execution requires 2 legs, got {}",
                opportunity.legs.len()
            );
            return Ok(false);
        }
        let leg1 = &opportunity.legs[0];
        let leg2 = &opportunity.legs[1];

        let Some(order1) = self.place_leg(opportunity, leg1, count).await else {
            return Ok(false);
        };

        let filled_count = if self.dry_run {
            portfolio.record_fill(leg1.side, leg1.price, count, order1.fees)?;
            count
        } else {
            let Some(filled) = self.wait_for_fill(&order1.order_id, FILL_WAIT_SECS).await else {
                warn!("Leg 1 not filled, cancelling");
                self.cancel_order(&order1.order_id).await;
                return Ok(false);
            };
            let filled_count = filled.filled_count.unwrap_or(count);
            self.db
                .update_trade_status(&order1.order_id, &filled.status, Some(filled_count))?;
            portfolio.record_fill(leg1.side, leg1.price, filled_count, order1.fees)?;
            filled_count
        };

        // Leg 2 goes out one cent more aggressive in the trade direction,
        // sized to what leg 1 actually filled
        let mut price_cents = (leg2.price * 100.0).round() as i64;
        match leg2.side {
            LegSide::Buy => price_cents += 1,
            LegSide::Sell => price_cents = (price_cents - 1).max(1),
        }
        let leg2_adjusted = Leg {
            price: price_cents as f64 / 100.0,
            ..leg2.clone()
        };

        let Some(order2) = self
            .place_leg(opportunity, &leg2_adjusted, filled_count)
            .await
        else {
            warn!("Leg 2 placement failed, holding directional position from leg 1");
            return Ok(false);
        };

        if self.dry_run {
            portfolio.record_fill(
                leg2_adjusted.side,
                leg2_adjusted.price,
                filled_count,
                order2.fees,
            )?;
        } else {
            let Some(filled) = self.wait_for_fill(&order2.order_id, FILL_WAIT_SECS).await else {
                // Accept the residual; do not chase with a compensating order
                warn!("Leg 2 not filled, holding directional position");
                self.cancel_order(&order2.order_id).await;
                return Ok(false);
            };
            let filled2 = filled.filled_count.unwrap_or(filled_count);
            self.db
                .update_trade_status(&order2.order_id, &filled.status, Some(filled2))?;
            portfolio.record_fill(leg2_adjusted.side, leg2_adjusted.price, filled2, order2.fees)?;
        }

        info!(
            "Two-leg execution complete for opportunity {}",
            opportunity.id
        );
        Ok(true)
    }

    // -----------------------------------------------------------------
    // Multi-leg execution (PARTITION)
    // -----------------------------------------------------------------

    async fn execute_multi_leg(
        &self,
        portfolio: &mut Portfolio,
        opportunity: &Opportunity,
        count: i64,
    ) -> Result<bool> {
        let mut orders = Vec::new();
        for leg in &opportunity.legs {
            if let Some(order) = self.place_leg(opportunity, leg, count).await {
                orders.push((leg.clone(), order));
            }
        }
        if orders.is_empty() {
            return Ok(false);
        }

        if self.dry_run {
            for (leg, order) in &orders {
                portfolio.record_fill(leg.side, leg.price, count, order.fees)?;
            }
            info!("DRY RUN: would have placed {} partition legs", orders.len());
            return Ok(true);
        }

        // Give the orders a moment to match before polling
        sleep(Duration::from_secs(PARTITION_SETTLE_SECS)).await;

        let mut filled = 0usize;
        let mut unfilled = Vec::new();
        for (leg, order) in &orders {
            match self.check_order_status(&order.order_id).await {
                Some(status) if status.is_filled() => {
                    let filled_count = status.filled_count.unwrap_or(count);
                    self.db.update_trade_status(
                        &order.order_id,
                        &status.status,
                        Some(filled_count),
                    )?;
                    portfolio.record_fill(leg.side, leg.price, filled_count, order.fees)?;
                    filled += 1;
                }
                _ => unfilled.push(order.order_id.clone()),
            }
        }

        if !unfilled.is_empty() {
            warn!(
                "Partial fill on partition: {}/{} legs filled, cancelling rest",
                filled,
                orders.len()
            );
            for order_id in &unfilled {
                self.cancel_order(order_id).await;
            }
        }

        Ok(filled == orders.len())
    }

    // -----------------------------------------------------------------
    // Low-level order helpers
    // -----------------------------------------------------------------

    /// Place a single leg, recording its trade row before returning.
    /// Returns None when placement fails.
    async fn place_leg(&self, opportunity: &Opportunity, leg: &Leg, count: i64) -> Option<Trade> {
        let price_cents = (leg.price * 100.0).round() as i64;
        let fee = taker_fee(count, leg.price);

        if self.dry_run {
            let order_id = format!("DRY-{}", Utc::now().timestamp_millis());
            info!(
                "DRY RUN: {} {} x {} @ ${:.2} (fee ~${:.2}) [{}]",
                leg.side.as_str().to_uppercase(),
                count,
                leg.ticker,
                leg.price,
                fee,
                opportunity.signal.label()
            );
            let trade = Trade {
                id: Uuid::new_v4().to_string(),
                opportunity_id: Some(opportunity.id.clone()),
                ticker: leg.ticker.clone(),
                side: leg.contract,
                action: leg.side,
                price: leg.price,
                count,
                order_id,
                order_status: "dry_run".to_string(),
                filled_count: count,
                fees: fee,
                created_at: now_iso(),
                updated_at: now_iso(),
            };
            if let Err(e) = self.db.insert_trade(&trade) {
                error!("Failed to record dry-run trade: {}", e);
                return None;
            }
            return Some(trade);
        }

        let expiration_ts = Utc::now().timestamp() + ORDER_EXPIRY_SECS;
        let request = OrderRequest::for_leg(leg, count, price_cents, expiration_ts);

        match self.client.place_order(&request).await {
            Ok(order) => {
                let status = if order.status.is_empty() {
                    "pending".to_string()
                } else {
                    order.status.clone()
                };
                let trade = Trade {
                    id: Uuid::new_v4().to_string(),
                    opportunity_id: Some(opportunity.id.clone()),
                    ticker: leg.ticker.clone(),
                    side: leg.contract,
                    action: leg.side,
                    price: leg.price,
                    count,
                    order_id: order.order_id.clone(),
                    order_status: status,
                    filled_count: 0,
                    fees: fee,
                    created_at: now_iso(),
                    updated_at: now_iso(),
                };
                if let Err(e) = self.db.insert_trade(&trade) {
                    error!("Failed to record trade for {}: {}", leg.ticker, e);
                }
                info!(
                    "Placed order {}: {} {} x {} @ {} cents",
                    order.order_id,
                    leg.side.as_str(),
                    count,
                    leg.ticker,
                    price_cents
                );
                Some(trade)
            }
            Err(e) => {
                error!("Failed to place order for {}: {}", leg.ticker, e);
                None
            }
        }
    }

    /// Poll until the order fills, dies, or the window elapses.
    async fn wait_for_fill(&self, order_id: &str, timeout_secs: u64) -> Option<ApiOrder> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
        while tokio::time::Instant::now() < deadline {
            if let Some(order) = self.check_order_status(order_id).await {
                if order.is_filled() {
                    return Some(order);
                }
                if order.is_dead() {
                    return None;
                }
            }
            sleep(Duration::from_secs(1)).await;
        }
        None
    }

    async fn check_order_status(&self, order_id: &str) -> Option<ApiOrder> {
        match self.client.get_order(order_id).await {
            Ok(order) => Some(order),
            Err(e) => {
                warn!("Failed to check order {}: {}", order_id, e);
                None
            }
        }
    }

    /// Cancel an order and update its trade row. A failed cancellation is
    /// logged but not retried.
    async fn cancel_order(&self, order_id: &str) {
        match self.client.cancel_order(order_id).await {
            Ok(()) => {
                info!("Cancelled order {}", order_id);
                if let Err(e) = self.db.update_trade_status(order_id, "cancelled", None) {
                    warn!("Failed to update cancelled trade {}: {}", order_id, e);
                }
            }
            Err(e) => warn!("Failed to cancel order {}: {}", order_id, e),
        }
    }
}
