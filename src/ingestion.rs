//! Market Ingestion
//! Mission: Pull the full open-market universe and cache it durably
//!
//! Pages through all open markets and events, normalises cent prices to
//! dollars, and upserts in transactional batches. A price snapshot is
//! appended for every market quoting both a yes_ask and a yes_bid.
//!
//! Idempotent: two consecutive runs converge on the same market rows (only
//! `updated_at` and snapshot rows diverge). A page-level fetch failure aborts
//! the cycle; the next scheduled cycle retries from scratch, and batches
//! already committed stand on their own.

use crate::db::{now_iso, Db};
use crate::exchange::types::{ApiEvent, ApiMarket};
use crate::exchange::KalshiClient;
use crate::models::{Event, Market, MarketStatus};
use anyhow::Result;
use tracing::info;

const UPSERT_BATCH_SIZE: usize = 1_000;

#[derive(Debug, Clone, Copy)]
pub struct IngestSummary {
    pub markets: usize,
    pub events: usize,
}

/// Convert the exchange's integer-cent price to dollars in [0, 1].
pub fn cents_to_dollars(value: Option<i64>) -> Option<f64> {
    value.map(|cents| cents as f64 / 100.0)
}

pub fn api_market_to_market(m: ApiMarket) -> Market {
    let close_time = m.close_time.or(m.expiration_time);
    Market {
        ticker: m.ticker,
        event_ticker: m.event_ticker,
        title: m.title.unwrap_or_default(),
        subtitle: m.subtitle,
        category: m.category,
        status: m
            .status
            .as_deref()
            .map(MarketStatus::parse)
            .unwrap_or(MarketStatus::Unknown),
        yes_ask: cents_to_dollars(m.yes_ask),
        yes_bid: cents_to_dollars(m.yes_bid),
        no_ask: cents_to_dollars(m.no_ask),
        no_bid: cents_to_dollars(m.no_bid),
        volume: m.volume.unwrap_or(0),
        open_interest: m.open_interest.unwrap_or(0),
        close_time,
        rules_primary: m.rules_primary,
        updated_at: now_iso(),
    }
}

fn api_event_to_event(e: ApiEvent) -> Event {
    let market_tickers = e.markets.into_iter().map(|m| m.ticker).collect();
    Event {
        event_ticker: e.event_ticker,
        title: e.title.unwrap_or_default(),
        category: e.category,
        market_tickers,
    }
}

/// Pull all open markets and upsert them in batches.
pub async fn ingest_markets(client: &KalshiClient, db: &Db) -> Result<usize> {
    let api_markets = client.get_all_markets("open").await?;
    let markets: Vec<Market> = api_markets.into_iter().map(api_market_to_market).collect();

    let mut count = 0usize;
    for chunk in markets.chunks(UPSERT_BATCH_SIZE) {
        count += db.upsert_market_batch(chunk)?;
    }
    info!("Ingested {} markets", count);
    Ok(count)
}

/// Pull all open events and cache them.
pub async fn ingest_events(client: &KalshiClient, db: &Db) -> Result<usize> {
    let api_events = client.get_all_events("open").await?;
    let events: Vec<Event> = api_events.into_iter().map(api_event_to_event).collect();

    let mut count = 0usize;
    for chunk in events.chunks(UPSERT_BATCH_SIZE) {
        count += db.upsert_event_batch(chunk)?;
    }
    info!("Ingested {} events", count);
    Ok(count)
}

/// Full ingestion of markets and events.
pub async fn ingest_all(client: &KalshiClient, db: &Db) -> Result<IngestSummary> {
    let markets = ingest_markets(client, db).await?;
    let events = ingest_events(client, db).await?;
    Ok(IngestSummary { markets, events })
}
