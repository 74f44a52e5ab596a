//! Orchestrator
//! Mission: One-second timing wheel driving the whole pipeline
//!
//! Cycle structure (declaration order, per tick):
//!   - Every 60s:  full market/event ingestion + portfolio sync
//!   - Every 24h:  relationship discovery, within-event pass (+ stale sweep)
//!   - Every 24h:  relationship discovery, within-category pass
//!   - Every 72h:  relationship discovery, cross-category pass
//!   - Every 15s:  violation scan + sequential execution
//!   - Every 24h:  daily summary alert
//!
//! Exactly one task runs at a time; a long task delays subsequent ticks and
//! that is acceptable. Task errors are logged and alerted, never fatal to
//! the loop. Termination clears the `running` flag and the current tick
//! completes before shutdown.

use crate::alerts::AlertSink;
use crate::config::Config;
use crate::db::Db;
use crate::detector;
use crate::exchange::KalshiClient;
use crate::executor::Executor;
use crate::ingestion;
use crate::market_cache::{self, MarketCache};
use crate::portfolio::Portfolio;
use crate::relationship::{DiscoveryPass, RelationshipMapper};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const CACHE_REFRESH_SECS: u64 = 30;

pub struct Orchestrator {
    config: Config,
    db: Db,
    client: Arc<KalshiClient>,
    portfolio: Portfolio,
    executor: Executor,
    mapper: RelationshipMapper,
    alerts: Arc<AlertSink>,
    cache: Arc<MarketCache>,
    running: Arc<AtomicBool>,

    last_ingest: DateTime<Utc>,
    last_scan: DateTime<Utc>,
    last_rel_event: DateTime<Utc>,
    last_rel_category: DateTime<Utc>,
    last_rel_cross: DateTime<Utc>,
    last_daily_summary: DateTime<Utc>,

    opportunities_today: u64,
    trades_today: u64,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        db: Db,
        client: Arc<KalshiClient>,
        portfolio: Portfolio,
        executor: Executor,
        mapper: RelationshipMapper,
        alerts: Arc<AlertSink>,
        cache: Arc<MarketCache>,
    ) -> Self {
        // Epoch start makes every task due on the first tick
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            config,
            db,
            client,
            portfolio,
            executor,
            mapper,
            alerts,
            cache,
            // Armed at construction so a termination signal delivered before
            // the loop starts is not lost
            running: Arc::new(AtomicBool::new(true)),
            last_ingest: epoch,
            last_scan: epoch,
            last_rel_event: epoch,
            last_rel_category: epoch,
            last_rel_cross: epoch,
            last_daily_summary: epoch,
            opportunities_today: 0,
            trades_today: 0,
        }
    }

    /// Handle for signal handlers: clearing it ends the loop after the
    /// current tick.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("=== Mispricing engine starting ===");
        info!("Dry run: {}", self.executor.dry_run());

        if let Err(e) = self.portfolio.sync(&self.client).await {
            warn!("Initial portfolio sync failed: {}", e);
        }
        self.alerts.startup().await;

        let refresher = market_cache::spawn_refresher(
            Arc::clone(&self.cache),
            self.db.clone(),
            Duration::from_secs(CACHE_REFRESH_SECS),
        );

        while self.running.load(Ordering::SeqCst) {
            let now = Utc::now();
            self.tick(now).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        info!("Shutting down...");
        refresher.abort();
        self.alerts.shutdown("normal").await;
        info!("Goodbye.");
        Ok(())
    }

    async fn tick(&mut self, now: DateTime<Utc>) {
        let scan_cfg = &self.config.scanning;
        let ingest_interval = ChronoDuration::seconds(scan_cfg.full_scan_interval_seconds as i64);
        let scan_interval = ChronoDuration::seconds(scan_cfg.opportunity_recheck_seconds as i64);
        let rel_interval = ChronoDuration::hours(scan_cfg.relationship_rescan_hours as i64);
        let cross_interval = ChronoDuration::hours(scan_cfg.relationship_rescan_hours as i64 * 3);

        // 1. Market ingestion, with portfolio sync piggybacked
        if now - self.last_ingest >= ingest_interval {
            match ingestion::ingest_all(&self.client, &self.db).await {
                Ok(summary) => {
                    info!(
                        "Ingestion complete: {} markets, {} events",
                        summary.markets, summary.events
                    );
                }
                Err(e) => {
                    error!("Ingestion failed: {}", e);
                    self.alerts.error("Ingestion failed", &e.to_string()).await;
                }
            }
            self.last_ingest = now;

            if let Err(e) = self.portfolio.sync(&self.client).await {
                warn!("Portfolio sync failed: {}", e);
            }
        }

        // 2. Relationship discovery: within-event pass + stale sweep
        if now - self.last_rel_event >= rel_interval {
            match self.mapper.discover(DiscoveryPass::Event).await {
                Ok(new) => info!("Event-pass relationship discovery: {} new", new),
                Err(e) => {
                    error!("Relationship event-pass failed: {}", e);
                    self.alerts
                        .error("Relationship discovery failed", &e.to_string())
                        .await;
                }
            }
            if let Err(e) = self.mapper.cleanup_stale() {
                warn!("Stale relationship cleanup failed: {}", e);
            }
            self.last_rel_event = now;
        }

        // 3. Relationship discovery: within-category pass
        if now - self.last_rel_category >= rel_interval {
            match self.mapper.discover(DiscoveryPass::Category).await {
                Ok(new) => info!("Category-pass relationship discovery: {} new", new),
                Err(e) => error!("Relationship category-pass failed: {}", e),
            }
            self.last_rel_category = now;
        }

        // 4. Relationship discovery: cross-category pass
        if now - self.last_rel_cross >= cross_interval {
            match self.mapper.discover(DiscoveryPass::Cross).await {
                Ok(new) => info!("Cross-pass relationship discovery: {} new", new),
                Err(e) => error!("Relationship cross-pass failed: {}", e),
            }
            self.last_rel_cross = now;
        }

        // 5. Violation detection + sequential execution
        if now - self.last_scan >= scan_interval {
            self.last_scan = now;
            if let Err(e) = self.detect_and_execute().await {
                error!("Detection/execution cycle failed: {}", e);
                self.alerts
                    .error("Detection cycle failed", &e.to_string())
                    .await;
            }
        }

        // 6. Daily summary
        if now - self.last_daily_summary >= ChronoDuration::hours(24) {
            self.alerts
                .daily_summary(
                    &self.portfolio.summary(),
                    self.opportunities_today,
                    self.trades_today,
                )
                .await;
            self.opportunities_today = 0;
            self.trades_today = 0;
            self.last_daily_summary = now;
        }
    }

    async fn detect_and_execute(&mut self) -> Result<()> {
        let trading = &self.config.trading;

        let mut opportunities = detector::scan_for_violations(
            &self.db,
            trading.min_score_threshold,
            trading.fee_safety_multiplier,
        )?;
        opportunities.extend(detector::scan_cached_two_sided(
            &self.db,
            &self.cache,
            trading.min_score_threshold,
            trading.fee_safety_multiplier,
        )?);

        // Strictly sequential: never more than one in-flight multi-leg trade
        for opportunity in &opportunities {
            self.opportunities_today += 1;
            self.alerts.opportunity(opportunity).await;

            match self
                .executor
                .execute(&mut self.portfolio, opportunity)
                .await
            {
                Ok(true) => {
                    self.trades_today += 1;
                    let trades = self.db.get_trades_for_opportunity(&opportunity.id)?;
                    for trade in &trades {
                        self.alerts.trade(trade, self.executor.dry_run()).await;
                    }
                }
                Ok(false) => {}
                Err(e) => error!(
                    "Executor error on opportunity {}: {}",
                    opportunity.id, e
                ),
            }
        }

        Ok(())
    }
}
