//! Relationship Mapper
//! Mission: Batched discovery of durable cross-market constraints
//!
//! Three scheduling passes:
//!   1. Within-event: all markets of one event per batch
//!   2. Within-category: markets grouped by category, chunked to 40
//!   3. Cross-category: everything, chunked, run infrequently
//!
//! A category allow-list restricts the expensive passes to domains where
//! cross-market constraints plausibly exist; single-event partition-heavy
//! domains (sports, crypto, entertainment) are skipped.

use crate::db::Db;
use crate::models::{Market, Relationship, RelationshipKind};
use crate::relationship::oracle::{RawRelationship, RelationshipOracle};
use anyhow::Result;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_MARKETS_PER_BATCH: usize = 40;

/// Categories worth scanning for cross-market mispricings.
const HIGH_VALUE_CATEGORIES: &[&str] = &[
    "Economics",
    "Politics",
    "Elections",
    "Financials",
    "Climate and Weather",
    "World",
    "Companies",
    "Science and Technology",
    "Science & Technology",
    "Health",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPass {
    Event,
    Category,
    Cross,
}

impl DiscoveryPass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryPass::Event => "event",
            DiscoveryPass::Category => "category",
            DiscoveryPass::Cross => "cross",
        }
    }
}

pub struct RelationshipMapper {
    db: Db,
    oracle: Arc<dyn RelationshipOracle>,
}

impl RelationshipMapper {
    pub fn new(db: Db, oracle: Arc<dyn RelationshipOracle>) -> Self {
        Self { db, oracle }
    }

    /// Run one discovery pass. Returns the number of new relationships stored.
    pub async fn discover(&self, pass: DiscoveryPass) -> Result<usize> {
        let markets = self.db.get_open_markets()?;
        if markets.is_empty() {
            info!("No open markets, skipping relationship discovery");
            return Ok(0);
        }

        let markets = self.filter_high_value(markets)?;
        if markets.is_empty() {
            info!("No high-value markets after category filter, skipping");
            return Ok(0);
        }

        let batches = match pass {
            DiscoveryPass::Event => batch_by_event(&markets),
            DiscoveryPass::Category => batch_by_category(&markets),
            DiscoveryPass::Cross => markets
                .chunks(MAX_MARKETS_PER_BATCH)
                .filter(|c| c.len() >= 2)
                .map(|c| c.to_vec())
                .collect(),
        };

        info!(
            "Running {}-pass relationship discovery: {} batches",
            pass.as_str(),
            batches.len()
        );

        let mut total_new = 0usize;
        for (idx, batch) in batches.iter().enumerate() {
            debug!(
                "Processing batch {}/{} ({} markets)",
                idx + 1,
                batches.len(),
                batch.len()
            );
            // An oracle failure drops this batch and moves on
            let proposals = match self.oracle.propose(batch).await {
                Ok(p) => p,
                Err(e) => {
                    warn!("Oracle call failed for batch {}: {}", idx + 1, e);
                    continue;
                }
            };

            for raw in proposals {
                let Some(rel) = normalize_relationship(&raw) else {
                    continue;
                };
                if self.db.upsert_relationship(&rel)? {
                    total_new += 1;
                }
            }
        }

        info!(
            "Relationship discovery ({} pass) complete: {} new relationships",
            pass.as_str(),
            total_new
        );
        Ok(total_new)
    }

    /// Re-check one stored relationship against the oracle. Returns true and
    /// refreshes it when the same (kind, ticker set) is proposed again.
    pub async fn validate_relationship(&self, rel_id: &str) -> Result<bool> {
        let Some(rel) = self.db.get_relationship(rel_id)? else {
            return Ok(false);
        };

        let mut markets = Vec::new();
        for t in &rel.tickers {
            if let Some(m) = self.db.get_market(t)? {
                markets.push(m);
            }
        }
        if markets.len() < 2 {
            warn!(
                "Relationship {}: not enough active markets, treating as stale",
                rel_id
            );
            return Ok(false);
        }

        let proposals = self.oracle.propose(&markets).await?;
        let rel_set: HashSet<&str> = rel.tickers.iter().map(|s| s.as_str()).collect();

        for raw in proposals {
            let Some(candidate) = normalize_relationship(&raw) else {
                continue;
            };
            let candidate_set: HashSet<&str> =
                candidate.tickers.iter().map(|s| s.as_str()).collect();
            if candidate.kind == rel.kind && candidate_set == rel_set {
                self.db.refresh_relationship(rel_id, candidate.confidence)?;
                info!("Relationship {} re-validated successfully", rel_id);
                return Ok(true);
            }
        }

        warn!("Relationship {} could not be re-validated", rel_id);
        Ok(false)
    }

    /// Delete relationships none of whose markets remain open.
    pub fn cleanup_stale(&self) -> Result<usize> {
        self.db.cleanup_stale_relationships()
    }

    /// Keep only markets in high-value categories, resolving a missing market
    /// category through the events table.
    fn filter_high_value(&self, markets: Vec<Market>) -> Result<Vec<Market>> {
        let events = self.db.get_all_events()?;
        let event_categories: HashMap<String, String> = events
            .into_iter()
            .filter_map(|e| e.category.map(|c| (e.event_ticker, c)))
            .collect();

        let total = markets.len();
        let filtered: Vec<Market> = markets
            .into_iter()
            .filter_map(|mut m| {
                if m.category.is_none() {
                    m.category = m
                        .event_ticker
                        .as_ref()
                        .and_then(|et| event_categories.get(et).cloned());
                }
                let keep = m
                    .category
                    .as_deref()
                    .map(|c| HIGH_VALUE_CATEGORIES.contains(&c))
                    .unwrap_or(false);
                keep.then_some(m)
            })
            .collect();

        info!(
            "Category filter: {} / {} markets are high-value",
            filtered.len(),
            total
        );
        Ok(filtered)
    }
}

// ---------------------------------------------------------------------
// Batching strategies
// ---------------------------------------------------------------------

fn batch_by_event(markets: &[Market]) -> Vec<Vec<Market>> {
    let mut groups: HashMap<String, Vec<Market>> = HashMap::new();
    for m in markets {
        let key = m
            .event_ticker
            .clone()
            .unwrap_or_else(|| "__no_event__".to_string());
        groups.entry(key).or_default().push(m.clone());
    }
    // Single markets can't have internal relationships
    groups.into_values().filter(|g| g.len() >= 2).collect()
}

fn batch_by_category(markets: &[Market]) -> Vec<Vec<Market>> {
    let mut groups: HashMap<String, Vec<Market>> = HashMap::new();
    for m in markets {
        let key = m
            .category
            .clone()
            .unwrap_or_else(|| "__no_category__".to_string());
        groups.entry(key).or_default().push(m.clone());
    }

    let mut batches = Vec::new();
    for group in groups.into_values() {
        if group.len() < 2 {
            continue;
        }
        for chunk in group.chunks(MAX_MARKETS_PER_BATCH) {
            if chunk.len() >= 2 {
                batches.push(chunk.to_vec());
            }
        }
    }
    batches
}

// ---------------------------------------------------------------------
// Normalisation
// ---------------------------------------------------------------------

/// Convert a raw oracle proposal into a storable relationship. Malformed or
/// unrecognised proposals yield None and are dropped.
pub fn normalize_relationship(raw: &RawRelationship) -> Option<Relationship> {
    let confidence = raw.confidence.clamp(0.0, 1.0);
    let now = Utc::now();

    let (kind, tickers, description, formula) = match raw.kind.to_uppercase().as_str() {
        "SUBSET" => {
            let subset = raw.subset_ticker.clone()?;
            let superset = raw.superset_ticker.clone()?;
            if subset.is_empty() || superset.is_empty() || subset == superset {
                return None;
            }
            let desc = format!("P({}) <= P({})", subset, superset);
            (
                RelationshipKind::Subset,
                vec![subset, superset],
                desc.clone(),
                desc,
            )
        }
        "THRESHOLD" => {
            let tickers = raw.tickers_ascending.clone();
            if tickers.len() < 2 {
                return None;
            }
            let desc = tickers
                .iter()
                .map(|t| format!("P({})", t))
                .collect::<Vec<_>>()
                .join(" >= ");
            (RelationshipKind::Threshold, tickers, desc.clone(), desc)
        }
        "PARTITION" => {
            let tickers = raw.tickers.clone();
            if tickers.len() < 2 {
                return None;
            }
            let desc = format!("SUM(P({})) = 1.00", tickers.join(", "));
            (
                RelationshipKind::Partition,
                tickers,
                desc,
                "SUM_EQUALS_1".to_string(),
            )
        }
        "IMPLICATION" => {
            let if_ticker = raw.if_ticker.clone()?;
            let then_ticker = raw.then_ticker.clone()?;
            if if_ticker.is_empty() || then_ticker.is_empty() || if_ticker == then_ticker {
                return None;
            }
            let cond_prob = raw.estimated_conditional_prob.unwrap_or(0.8);
            let desc = format!(
                "P({}) implies P({}) with prob ~{}",
                if_ticker, then_ticker, cond_prob
            );
            let formula = format!("IMPLIES({},{},{})", if_ticker, then_ticker, cond_prob);
            (
                RelationshipKind::Implication,
                vec![if_ticker, then_ticker],
                desc,
                formula,
            )
        }
        other => {
            warn!("Unknown relationship type from oracle: {}", other);
            return None;
        }
    };

    Some(Relationship {
        id: Uuid::new_v4().to_string(),
        kind,
        tickers,
        constraint_description: description,
        constraint_formula: formula,
        confidence,
        reasoning: raw.reasoning.clone(),
        created_at: now,
        last_validated: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::now_iso;
    use crate::models::MarketStatus;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    fn market(ticker: &str, event: &str, category: Option<&str>) -> Market {
        Market {
            ticker: ticker.to_string(),
            event_ticker: Some(event.to_string()),
            title: format!("Market {}", ticker),
            subtitle: None,
            category: category.map(|c| c.to_string()),
            status: MarketStatus::Open,
            yes_ask: Some(0.40),
            yes_bid: Some(0.38),
            no_ask: Some(0.62),
            no_bid: Some(0.60),
            volume: 0,
            open_interest: 50,
            close_time: None,
            rules_primary: None,
            updated_at: now_iso(),
        }
    }

    struct ScriptedOracle {
        proposals: Vec<RawRelationship>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl RelationshipOracle for ScriptedOracle {
        async fn propose(&self, _markets: &[Market]) -> Result<Vec<RawRelationship>> {
            *self.calls.lock() += 1;
            Ok(self.proposals.clone())
        }
    }

    fn subset_raw(sub: &str, sup: &str) -> RawRelationship {
        RawRelationship {
            kind: "SUBSET".to_string(),
            subset_ticker: Some(sub.to_string()),
            superset_ticker: Some(sup.to_string()),
            confidence: 0.9,
            reasoning: "containment".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn normalize_each_variant() {
        let rel = normalize_relationship(&subset_raw("A", "B")).unwrap();
        assert_eq!(rel.kind, RelationshipKind::Subset);
        assert_eq!(rel.tickers, vec!["A", "B"]);

        let threshold = RawRelationship {
            kind: "THRESHOLD".to_string(),
            tickers_ascending: vec!["T3".to_string(), "T4".to_string(), "T5".to_string()],
            ..Default::default()
        };
        let rel = normalize_relationship(&threshold).unwrap();
        assert_eq!(rel.kind, RelationshipKind::Threshold);
        assert!(rel.constraint_formula.contains(">="));

        let partition = RawRelationship {
            kind: "PARTITION".to_string(),
            tickers: vec!["A".to_string(), "B".to_string()],
            ..Default::default()
        };
        let rel = normalize_relationship(&partition).unwrap();
        assert_eq!(rel.constraint_formula, "SUM_EQUALS_1");

        let implication = RawRelationship {
            kind: "IMPLICATION".to_string(),
            if_ticker: Some("IF".to_string()),
            then_ticker: Some("THEN".to_string()),
            estimated_conditional_prob: Some(0.85),
            ..Default::default()
        };
        let rel = normalize_relationship(&implication).unwrap();
        assert_eq!(rel.kind, RelationshipKind::Implication);
        assert!(rel.constraint_formula.contains("0.85"));
    }

    #[test]
    fn normalize_rejects_malformed() {
        // Unknown variant
        let unknown = RawRelationship {
            kind: "CORRELATION".to_string(),
            ..Default::default()
        };
        assert!(normalize_relationship(&unknown).is_none());

        // Missing superset
        let partial = RawRelationship {
            kind: "SUBSET".to_string(),
            subset_ticker: Some("A".to_string()),
            ..Default::default()
        };
        assert!(normalize_relationship(&partial).is_none());

        // Self-referential subset
        assert!(normalize_relationship(&subset_raw("A", "A")).is_none());

        // One-element partition
        let tiny = RawRelationship {
            kind: "PARTITION".to_string(),
            tickers: vec!["A".to_string()],
            ..Default::default()
        };
        assert!(normalize_relationship(&tiny).is_none());
    }

    #[test]
    fn batching_by_event_needs_pairs() {
        let markets = vec![
            market("A1", "EVT-A", Some("Economics")),
            market("A2", "EVT-A", Some("Economics")),
            market("B1", "EVT-B", Some("Economics")),
        ];
        let batches = batch_by_event(&markets);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[test]
    fn batching_by_category_chunks_large_groups() {
        let markets: Vec<Market> = (0..95)
            .map(|i| market(&format!("M{}", i), "EVT", Some("Politics")))
            .collect();
        let batches = batch_by_category(&markets);
        assert_eq!(batches.len(), 3); // 40 + 40 + 15
        assert!(batches.iter().all(|b| b.len() >= 2 && b.len() <= 40));
    }

    #[tokio::test]
    async fn discovery_dedups_and_counts_new() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("t.db").to_str().unwrap()).unwrap();
        db.upsert_market_batch(&[
            market("A", "EVT", Some("Economics")),
            market("B", "EVT", Some("Economics")),
        ])
        .unwrap();

        let oracle = Arc::new(ScriptedOracle {
            proposals: vec![subset_raw("A", "B"), subset_raw("B", "A")],
            calls: Mutex::new(0),
        });
        let mapper = RelationshipMapper::new(db.clone(), oracle.clone());

        // Two proposals with the same ticker set dedup to one new row
        let new = mapper.discover(DiscoveryPass::Event).await.unwrap();
        assert_eq!(new, 1);

        // Re-running rediscovers but creates nothing new
        let new = mapper.discover(DiscoveryPass::Event).await.unwrap();
        assert_eq!(new, 0);
        assert_eq!(db.get_active_relationships().unwrap().len(), 1);
        assert!(*oracle.calls.lock() >= 2);
    }

    #[tokio::test]
    async fn discovery_skips_low_value_categories() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("t.db").to_str().unwrap()).unwrap();
        db.upsert_market_batch(&[
            market("S1", "GAME", Some("Sports")),
            market("S2", "GAME", Some("Sports")),
        ])
        .unwrap();

        let oracle = Arc::new(ScriptedOracle {
            proposals: vec![subset_raw("S1", "S2")],
            calls: Mutex::new(0),
        });
        let mapper = RelationshipMapper::new(db, oracle.clone());

        let new = mapper.discover(DiscoveryPass::Event).await.unwrap();
        assert_eq!(new, 0);
        // Oracle never called: the whole batch was filtered out
        assert_eq!(*oracle.calls.lock(), 0);
    }
}
