//! In-Memory Market Cache
//! Mission: Lock-free price snapshots for the hot detection loop
//!
//! One writer, many readers. The refresher builds a complete map off to the
//! side and publishes it with a single atomic store, so a reader observes
//! either the whole old snapshot or the whole new one, never a mix.

use crate::db::Db;
use crate::models::Market;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct MarketCache {
    inner: ArcSwap<HashMap<String, Market>>,
}

impl Default for MarketCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketCache {
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Build the new map fully, then publish with one store.
    pub fn publish(&self, markets: Vec<Market>) {
        let mut map = HashMap::with_capacity(markets.len());
        for m in markets {
            map.insert(m.ticker.clone(), m);
        }
        self.inner.store(Arc::new(map));
    }

    /// Cheap pointer clone of the current complete snapshot.
    pub fn snapshot(&self) -> Arc<HashMap<String, Market>> {
        self.inner.load_full()
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Background refresher: periodically reloads open markets from the store
/// and swaps the snapshot. Runs until the returned handle is aborted.
pub fn spawn_refresher(
    cache: Arc<MarketCache>,
    db: Db,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match db.get_open_markets() {
                Ok(markets) => {
                    debug!("Market cache refreshed: {} open markets", markets.len());
                    cache.publish(markets);
                }
                Err(e) => warn!("Market cache refresh failed: {}", e),
            }
            tokio::time::sleep(period).await;
        }
    })
}
