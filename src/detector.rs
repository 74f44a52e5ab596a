//! Violation Detection
//! Mission: Turn live prices + stored constraints into scored opportunities
//!
//! On each cycle, every active relationship is evaluated against current
//! prices. Violations are scored by magnitude, confidence and liquidity,
//! gated by the fee hurdle, and persisted as opportunities. The detector is
//! stateless across cycles: a mispricing that stays in the book simply
//! re-emits; status transitions belong to the executor.

use crate::db::Db;
use crate::fees::is_profitable_after_fees;
use crate::market_cache::MarketCache;
use crate::models::{
    ContractSide, Leg, LegSide, Market, Opportunity, OpportunityStatus, Relationship,
    RelationshipKind, TradeSignal,
};
use anyhow::Result;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Minimum magnitude (dollars per contract) before a violation is considered.
pub const MIN_MAGNITUDE: f64 = 0.02;

/// Extra-wide threshold for the soft IMPLICATION constraint.
pub const SOFT_THRESHOLD: f64 = 0.08;

/// Minimum confidence required to trade an implication.
const IMPLICATION_MIN_CONFIDENCE: f64 = 0.7;

/// Liquidity factor fallback when depth data is unavailable.
pub const DEFAULT_DEPTH: i64 = 20;

const EXPIRY_MINUTES: i64 = 5;

fn depth_or_default(open_interest: i64) -> i64 {
    if open_interest > 0 {
        open_interest
    } else {
        DEFAULT_DEPTH
    }
}

fn liquidity_factor(depth: i64) -> f64 {
    (depth as f64 / 50.0).min(1.0)
}

fn round4(x: f64) -> f64 {
    (x * 1e4).round() / 1e4
}

fn round6(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

fn build_opportunity(
    relationship_id: Option<String>,
    signal: TradeSignal,
    magnitude: f64,
    confidence: f64,
    legs: Vec<Leg>,
) -> Opportunity {
    let depth = legs.iter().map(|l| l.depth).min().unwrap_or(DEFAULT_DEPTH);
    let score = round6(magnitude * confidence * liquidity_factor(depth));
    let now = Utc::now();
    Opportunity {
        id: Uuid::new_v4().to_string(),
        relationship_id,
        signal,
        magnitude: round4(magnitude),
        confidence,
        score,
        legs,
        status: OpportunityStatus::Detected,
        detected_at: now,
        expires_at: now + Duration::minutes(EXPIRY_MINUTES),
    }
}

// ---------------------------------------------------------------------
// Constraint checkers
// ---------------------------------------------------------------------

/// SUBSET: P(subset) <= P(superset). tickers = [subset, superset].
/// Violation: subset yes_ask > superset yes_bid. Trade: buy superset,
/// sell subset.
pub fn check_subset(
    rel: &Relationship,
    markets: &HashMap<String, Market>,
    safety: f64,
) -> Vec<Opportunity> {
    let (Some(sub_ticker), Some(sup_ticker)) = (rel.tickers.first(), rel.tickers.get(1)) else {
        return Vec::new();
    };
    let (Some(subset), Some(superset)) = (markets.get(sub_ticker), markets.get(sup_ticker)) else {
        return Vec::new();
    };

    let sub_ask = subset.yes_ask.unwrap_or(0.0);
    let sup_bid = superset.yes_bid.unwrap_or(0.0);

    let magnitude = sub_ask - sup_bid;
    if magnitude <= MIN_MAGNITUDE {
        return Vec::new();
    }
    if !is_profitable_after_fees(magnitude, 1, &[sub_ask, sup_bid], safety) {
        return Vec::new();
    }

    let depth = depth_or_default(subset.open_interest).min(depth_or_default(superset.open_interest));
    vec![build_opportunity(
        Some(rel.id.clone()),
        TradeSignal::BuySupersetSellSubset,
        magnitude,
        rel.confidence,
        vec![
            Leg {
                ticker: sup_ticker.clone(),
                side: LegSide::Buy,
                contract: ContractSide::Yes,
                price: sup_bid,
                depth,
            },
            Leg {
                ticker: sub_ticker.clone(),
                side: LegSide::Sell,
                contract: ContractSide::Yes,
                price: sub_ask,
                depth,
            },
        ],
    )]
}

/// THRESHOLD: for ascending cutoffs, probabilities must descend. Each
/// adjacent pair is checked independently.
pub fn check_threshold(
    rel: &Relationship,
    markets: &HashMap<String, Market>,
    safety: f64,
) -> Vec<Opportunity> {
    let mut opps = Vec::new();
    for pair in rel.tickers.windows(2) {
        let (lower_t, higher_t) = (&pair[0], &pair[1]);
        let (Some(lower), Some(higher)) = (markets.get(lower_t), markets.get(higher_t)) else {
            continue;
        };

        let lower_bid = lower.yes_bid.unwrap_or(0.0);
        let higher_ask = higher.yes_ask.unwrap_or(0.0);

        let magnitude = higher_ask - lower_bid;
        if magnitude <= MIN_MAGNITUDE {
            continue;
        }
        if !is_profitable_after_fees(magnitude, 1, &[lower_bid, higher_ask], safety) {
            continue;
        }

        let depth =
            depth_or_default(lower.open_interest).min(depth_or_default(higher.open_interest));
        opps.push(build_opportunity(
            Some(rel.id.clone()),
            TradeSignal::ThresholdPair {
                lower: lower_t.clone(),
                higher: higher_t.clone(),
            },
            magnitude,
            rel.confidence,
            vec![
                Leg {
                    ticker: lower_t.clone(),
                    side: LegSide::Buy,
                    contract: ContractSide::Yes,
                    price: lower_bid,
                    depth,
                },
                Leg {
                    ticker: higher_t.clone(),
                    side: LegSide::Sell,
                    contract: ContractSide::Yes,
                    price: higher_ask,
                    depth,
                },
            ],
        ));
    }
    opps
}

/// PARTITION: YES prices must sum to ~$1.00. Buy all when the asks sum
/// under, sell all when the bids sum over. A partition with any member
/// missing is invalid and skipped entirely.
pub fn check_partition(
    rel: &Relationship,
    markets: &HashMap<String, Market>,
    safety: f64,
) -> Vec<Opportunity> {
    let members: Vec<&Market> = rel
        .tickers
        .iter()
        .filter_map(|t| markets.get(t))
        .collect();
    if members.len() < rel.tickers.len() {
        return Vec::new();
    }

    let mut opps = Vec::new();
    let depth = members
        .iter()
        .map(|m| depth_or_default(m.open_interest))
        .min()
        .unwrap_or(DEFAULT_DEPTH);

    let total_ask: f64 = members.iter().map(|m| m.yes_ask.unwrap_or(0.0)).sum();
    let buy_magnitude = 1.00 - total_ask;
    if buy_magnitude > MIN_MAGNITUDE {
        let prices: Vec<f64> = members.iter().map(|m| m.yes_ask.unwrap_or(0.0)).collect();
        if is_profitable_after_fees(buy_magnitude, 1, &prices, safety) {
            opps.push(build_opportunity(
                Some(rel.id.clone()),
                TradeSignal::BuyAllPartition,
                buy_magnitude,
                rel.confidence,
                members
                    .iter()
                    .map(|m| Leg {
                        ticker: m.ticker.clone(),
                        side: LegSide::Buy,
                        contract: ContractSide::Yes,
                        price: m.yes_ask.unwrap_or(0.0),
                        depth,
                    })
                    .collect(),
            ));
        }
    }

    let total_bid: f64 = members.iter().map(|m| m.yes_bid.unwrap_or(0.0)).sum();
    let sell_magnitude = total_bid - 1.00;
    if sell_magnitude > MIN_MAGNITUDE {
        let prices: Vec<f64> = members.iter().map(|m| m.yes_bid.unwrap_or(0.0)).collect();
        if is_profitable_after_fees(sell_magnitude, 1, &prices, safety) {
            opps.push(build_opportunity(
                Some(rel.id.clone()),
                TradeSignal::SellAllPartition,
                sell_magnitude,
                rel.confidence,
                members
                    .iter()
                    .map(|m| Leg {
                        ticker: m.ticker.clone(),
                        side: LegSide::Sell,
                        contract: ContractSide::Yes,
                        price: m.yes_bid.unwrap_or(0.0),
                        depth,
                    })
                    .collect(),
            ));
        }
    }

    opps
}

/// IMPLICATION: soft constraint P(if) <= P(then). Only wide mispricings
/// with high relationship confidence are flagged.
pub fn check_implication(
    rel: &Relationship,
    markets: &HashMap<String, Market>,
    safety: f64,
) -> Vec<Opportunity> {
    let (Some(if_ticker), Some(then_ticker)) = (rel.tickers.first(), rel.tickers.get(1)) else {
        return Vec::new();
    };
    let (Some(if_market), Some(then_market)) =
        (markets.get(if_ticker), markets.get(then_ticker))
    else {
        return Vec::new();
    };

    let if_bid = if_market.yes_bid.unwrap_or(0.0);
    let then_ask = then_market.yes_ask.unwrap_or(0.0);

    let magnitude = if_bid - then_ask;
    if magnitude <= SOFT_THRESHOLD {
        return Vec::new();
    }
    if rel.confidence < IMPLICATION_MIN_CONFIDENCE {
        return Vec::new();
    }
    if !is_profitable_after_fees(magnitude, 1, &[if_bid, then_ask], safety) {
        return Vec::new();
    }

    let depth =
        depth_or_default(if_market.open_interest).min(depth_or_default(then_market.open_interest));
    vec![build_opportunity(
        Some(rel.id.clone()),
        TradeSignal::BuyThenSellIf,
        magnitude,
        rel.confidence,
        vec![
            Leg {
                ticker: then_ticker.clone(),
                side: LegSide::Buy,
                contract: ContractSide::Yes,
                price: then_ask,
                depth,
            },
            Leg {
                ticker: if_ticker.clone(),
                side: LegSide::Sell,
                contract: ContractSide::Yes,
                price: if_bid,
                depth,
            },
        ],
    )]
}

/// The degenerate single-market partition: YES ask + NO ask < $1.00 means
/// buying both sides locks in the difference at settlement.
pub fn check_two_sided(market: &Market, safety: f64) -> Option<Opportunity> {
    let yes_ask = market.yes_ask.filter(|&p| p > 0.0)?;
    let no_ask = market.no_ask.filter(|&p| p > 0.0)?;

    let magnitude = 1.00 - (yes_ask + no_ask);
    if magnitude <= MIN_MAGNITUDE {
        return None;
    }
    if !is_profitable_after_fees(magnitude, 1, &[yes_ask, no_ask], safety) {
        return None;
    }

    let depth = depth_or_default(market.open_interest);
    Some(build_opportunity(
        None,
        TradeSignal::BuyAllPartition,
        magnitude,
        // A price identity, not an inferred constraint
        1.0,
        vec![
            Leg {
                ticker: market.ticker.clone(),
                side: LegSide::Buy,
                contract: ContractSide::Yes,
                price: yes_ask,
                depth,
            },
            Leg {
                ticker: market.ticker.clone(),
                side: LegSide::Buy,
                contract: ContractSide::No,
                price: no_ask,
                depth,
            },
        ],
    ))
}

// ---------------------------------------------------------------------
// Cycle entry points
// ---------------------------------------------------------------------

/// Scan all active relationships for constraint violations. Emitted
/// opportunities are persisted and returned sorted by descending score.
pub fn scan_for_violations(db: &Db, min_score: f64, fee_safety: f64) -> Result<Vec<Opportunity>> {
    let relationships = db.get_active_relationships()?;
    let mut opportunities = Vec::new();

    for rel in &relationships {
        let mut markets: HashMap<String, Market> = HashMap::new();
        for t in &rel.tickers {
            if let Some(m) = db.get_market(t)? {
                markets.insert(t.clone(), m);
            }
        }
        if markets.len() < 2 {
            continue;
        }

        let found = match rel.kind {
            RelationshipKind::Subset => check_subset(rel, &markets, fee_safety),
            RelationshipKind::Threshold => check_threshold(rel, &markets, fee_safety),
            RelationshipKind::Partition => check_partition(rel, &markets, fee_safety),
            RelationshipKind::Implication => check_implication(rel, &markets, fee_safety),
        };

        for opp in found {
            if opp.score < min_score {
                debug!(
                    "Opportunity below score threshold ({:.4} < {:.4}), dropped",
                    opp.score, min_score
                );
                continue;
            }
            db.insert_opportunity(&opp)?;
            info!(
                "Opportunity detected: {} | score={:.4} mag={:.4} legs={}",
                opp.signal.label(),
                opp.score,
                opp.magnitude,
                opp.legs.len()
            );
            opportunities.push(opp);
        }
    }

    opportunities.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    info!("Scan complete: {} new opportunities", opportunities.len());
    Ok(opportunities)
}

/// Scan the in-memory snapshot for two-sided (YES+NO) mispricings. Reads
/// only the atomic cache, never the store; hits are persisted like any
/// other opportunity.
pub fn scan_cached_two_sided(
    db: &Db,
    cache: &MarketCache,
    min_score: f64,
    fee_safety: f64,
) -> Result<Vec<Opportunity>> {
    let snapshot = cache.snapshot();
    let mut opportunities = Vec::new();

    for market in snapshot.values() {
        if !market.status.is_open() {
            continue;
        }
        if let Some(opp) = check_two_sided(market, fee_safety) {
            if opp.score < min_score {
                continue;
            }
            db.insert_opportunity(&opp)?;
            info!(
                "Two-sided arb: {} YES={:.2} NO={:.2} profit/contract={:.4}",
                market.ticker,
                market.yes_ask.unwrap_or(0.0),
                market.no_ask.unwrap_or(0.0),
                opp.magnitude
            );
            opportunities.push(opp);
        }
    }

    opportunities.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    Ok(opportunities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::now_iso;
    use crate::models::MarketStatus;

    fn make_market(ticker: &str, yes_ask: f64, yes_bid: f64, open_interest: i64) -> Market {
        Market {
            ticker: ticker.to_string(),
            event_ticker: None,
            title: format!("Market {}", ticker),
            subtitle: None,
            category: None,
            status: MarketStatus::Open,
            yes_ask: Some(yes_ask),
            yes_bid: Some(yes_bid),
            no_ask: None,
            no_bid: None,
            volume: 0,
            open_interest,
            close_time: None,
            rules_primary: None,
            updated_at: now_iso(),
        }
    }

    fn make_rel(kind: RelationshipKind, tickers: &[&str], confidence: f64) -> Relationship {
        Relationship {
            id: "rel-1".to_string(),
            kind,
            tickers: tickers.iter().map(|t| t.to_string()).collect(),
            constraint_description: String::new(),
            constraint_formula: String::new(),
            confidence,
            reasoning: String::new(),
            created_at: Utc::now(),
            last_validated: Utc::now(),
        }
    }

    fn market_map(markets: Vec<Market>) -> HashMap<String, Market> {
        markets.into_iter().map(|m| (m.ticker.clone(), m)).collect()
    }

    #[test]
    fn subset_no_violation() {
        let rel = make_rel(RelationshipKind::Subset, &["SUB", "SUP"], 0.9);
        let markets = market_map(vec![
            make_market("SUB", 0.30, 0.28, 50),
            make_market("SUP", 0.60, 0.58, 50),
        ]);
        assert!(check_subset(&rel, &markets, 2.0).is_empty());
    }

    #[test]
    fn subset_violation_detected() {
        let rel = make_rel(RelationshipKind::Subset, &["SUB", "SUP"], 0.9);
        let markets = market_map(vec![
            make_market("SUB", 0.65, 0.63, 50),
            make_market("SUP", 0.52, 0.50, 50),
        ]);
        let opps = check_subset(&rel, &markets, 2.0);
        assert_eq!(opps.len(), 1);
        let opp = &opps[0];
        assert_eq!(opp.signal, TradeSignal::BuySupersetSellSubset);
        assert!((opp.magnitude - 0.15).abs() < 1e-9);
        assert_eq!(opp.legs.len(), 2);
        assert_eq!(opp.legs[0].ticker, "SUP");
        assert_eq!(opp.legs[0].side, LegSide::Buy);
        assert_eq!(opp.legs[0].price, 0.50);
        assert_eq!(opp.legs[1].ticker, "SUB");
        assert_eq!(opp.legs[1].side, LegSide::Sell);
        assert_eq!(opp.legs[1].price, 0.65);
        // score = 0.15 * 0.9 * min(50/50, 1)
        assert!((opp.score - 0.135).abs() < 1e-9);
    }

    #[test]
    fn subset_tiny_violation_killed_by_fees() {
        let rel = make_rel(RelationshipKind::Subset, &["A", "B"], 0.9);
        let markets = market_map(vec![
            make_market("A", 0.53, 0.52, 50),
            make_market("B", 0.51, 0.50, 50),
        ]);
        // 3c spread, fees 2c+2c with 2x safety -> 8c hurdle
        assert!(check_subset(&rel, &markets, 2.0).is_empty());
    }

    #[test]
    fn threshold_ordered_prices_are_quiet() {
        let rel = make_rel(RelationshipKind::Threshold, &["GT3", "GT4", "GT5"], 0.9);
        let markets = market_map(vec![
            make_market("GT3", 0.70, 0.68, 50),
            make_market("GT4", 0.50, 0.48, 50),
            make_market("GT5", 0.20, 0.18, 50),
        ]);
        assert!(check_threshold(&rel, &markets, 2.0).is_empty());
    }

    #[test]
    fn threshold_inversion_flags_adjacent_pair() {
        let rel = make_rel(RelationshipKind::Threshold, &["GT3", "GT4"], 0.9);
        let markets = market_map(vec![
            make_market("GT3", 0.40, 0.38, 50),
            make_market("GT4", 0.55, 0.53, 50),
        ]);
        let opps = check_threshold(&rel, &markets, 2.0);
        assert_eq!(opps.len(), 1);
        let label = opps[0].signal.label();
        assert!(label.contains("GT3") && label.contains("GT4"));
        // buy the lower cutoff, sell the higher
        assert_eq!(opps[0].legs[0].ticker, "GT3");
        assert_eq!(opps[0].legs[0].side, LegSide::Buy);
        assert_eq!(opps[0].legs[1].ticker, "GT4");
        assert_eq!(opps[0].legs[1].side, LegSide::Sell);
    }

    #[test]
    fn partition_buy_all() {
        let rel = make_rel(RelationshipKind::Partition, &["A", "B", "C"], 0.9);
        let markets = market_map(vec![
            make_market("A", 0.20, 0.18, 50),
            make_market("B", 0.20, 0.18, 50),
            make_market("C", 0.20, 0.18, 50),
        ]);
        let opps = check_partition(&rel, &markets, 2.0);
        let buys: Vec<_> = opps
            .iter()
            .filter(|o| o.signal == TradeSignal::BuyAllPartition)
            .collect();
        assert_eq!(buys.len(), 1);
        assert!((buys[0].magnitude - 0.40).abs() < 1e-9);
        assert_eq!(buys[0].legs.len(), 3);
        assert!(buys[0].legs.iter().all(|l| l.side == LegSide::Buy));
    }

    #[test]
    fn partition_sell_all() {
        let rel = make_rel(RelationshipKind::Partition, &["A", "B", "C"], 0.9);
        let markets = market_map(vec![
            make_market("A", 0.45, 0.43, 50),
            make_market("B", 0.45, 0.43, 50),
            make_market("C", 0.45, 0.43, 50),
        ]);
        let opps = check_partition(&rel, &markets, 2.0);
        let sells: Vec<_> = opps
            .iter()
            .filter(|o| o.signal == TradeSignal::SellAllPartition)
            .collect();
        assert_eq!(sells.len(), 1);
        assert!((sells[0].magnitude - 0.29).abs() < 1e-9);
        assert!(sells[0].legs.iter().all(|l| l.side == LegSide::Sell));
    }

    #[test]
    fn partition_with_missing_member_is_skipped() {
        let rel = make_rel(RelationshipKind::Partition, &["A", "B", "C"], 0.9);
        let markets = market_map(vec![
            make_market("A", 0.20, 0.18, 50),
            make_market("B", 0.20, 0.18, 50),
        ]);
        assert!(check_partition(&rel, &markets, 2.0).is_empty());
    }

    #[test]
    fn balanced_partition_is_quiet() {
        let rel = make_rel(RelationshipKind::Partition, &["A", "B", "C"], 0.9);
        let markets = market_map(vec![
            make_market("A", 0.35, 0.33, 50),
            make_market("B", 0.35, 0.33, 50),
            make_market("C", 0.30, 0.28, 50),
        ]);
        assert!(check_partition(&rel, &markets, 2.0).is_empty());
    }

    #[test]
    fn implication_violation_needs_confidence() {
        let markets = market_map(vec![
            make_market("IF", 0.75, 0.73, 50),
            make_market("THEN", 0.40, 0.38, 50),
        ]);

        let confident = make_rel(RelationshipKind::Implication, &["IF", "THEN"], 0.9);
        let opps = check_implication(&confident, &markets, 2.0);
        assert_eq!(opps.len(), 1);
        assert_eq!(opps[0].signal, TradeSignal::BuyThenSellIf);
        assert_eq!(opps[0].legs[0].ticker, "THEN");
        assert_eq!(opps[0].legs[0].side, LegSide::Buy);

        // Same spread, low confidence: skipped
        let doubtful = make_rel(RelationshipKind::Implication, &["IF", "THEN"], 0.3);
        assert!(check_implication(&doubtful, &markets, 2.0).is_empty());
    }

    #[test]
    fn implication_small_spread_under_soft_threshold() {
        let rel = make_rel(RelationshipKind::Implication, &["IF", "THEN"], 0.9);
        let markets = market_map(vec![
            make_market("IF", 0.48, 0.46, 50),
            make_market("THEN", 0.40, 0.38, 50),
        ]);
        // 6c inversion is under the 8c soft threshold
        assert!(check_implication(&rel, &markets, 2.0).is_empty());
    }

    #[test]
    fn two_sided_arb_detected() {
        let mut m = make_market("KXBTC-100K", 0.45, 0.43, 50);
        m.no_ask = Some(0.45);
        let opp = check_two_sided(&m, 2.0).unwrap();
        assert!((opp.magnitude - 0.10).abs() < 1e-9);
        assert_eq!(opp.signal, TradeSignal::BuyAllPartition);
        assert_eq!(opp.legs.len(), 2);
        assert_eq!(opp.legs[0].contract, ContractSide::Yes);
        assert_eq!(opp.legs[1].contract, ContractSide::No);
        assert!(opp.legs.iter().all(|l| l.side == LegSide::Buy));

        // Fairly priced book stays quiet
        let mut fair = make_market("FAIR", 0.50, 0.48, 50);
        fair.no_ask = Some(0.51);
        assert!(check_two_sided(&fair, 2.0).is_none());

        // A missing side disqualifies
        let mut one_sided = make_market("HALF", 0.30, 0.28, 50);
        one_sided.no_ask = None;
        assert!(check_two_sided(&one_sided, 2.0).is_none());
    }

    #[test]
    fn shallow_depth_drags_score_down() {
        let rel = make_rel(RelationshipKind::Subset, &["SUB", "SUP"], 0.9);
        let markets = market_map(vec![
            make_market("SUB", 0.65, 0.63, 10),
            make_market("SUP", 0.52, 0.50, 50),
        ]);
        let opps = check_subset(&rel, &markets, 2.0);
        assert_eq!(opps.len(), 1);
        // liquidity factor = 10/50
        assert!((opps[0].score - 0.15 * 0.9 * 0.2).abs() < 1e-9);
    }

    #[test]
    fn scan_persists_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("t.db").to_str().unwrap()).unwrap();
        db.upsert_market_batch(&[
            make_market("SUB", 0.65, 0.63, 50),
            make_market("SUP", 0.52, 0.50, 50),
            make_market("GT3", 0.40, 0.38, 10),
            make_market("GT4", 0.55, 0.53, 10),
        ])
        .unwrap();

        let sub_rel = make_rel(RelationshipKind::Subset, &["SUB", "SUP"], 0.9);
        let mut thr_rel = make_rel(RelationshipKind::Threshold, &["GT3", "GT4"], 0.9);
        thr_rel.id = "rel-2".to_string();
        db.upsert_relationship(&sub_rel).unwrap();
        db.upsert_relationship(&thr_rel).unwrap();

        let opps = scan_for_violations(&db, 0.01, 2.0).unwrap();
        assert_eq!(opps.len(), 2);
        // descending score: the deep subset beats the shallow threshold pair
        assert!(opps[0].score >= opps[1].score);
        assert_eq!(opps[0].signal, TradeSignal::BuySupersetSellSubset);

        // both persisted
        for opp in &opps {
            assert!(db.get_opportunity(&opp.id).unwrap().is_some());
        }
    }

    #[test]
    fn scan_honours_min_score() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("t.db").to_str().unwrap()).unwrap();
        db.upsert_market_batch(&[
            make_market("SUB", 0.65, 0.63, 1),
            make_market("SUP", 0.52, 0.50, 1),
        ])
        .unwrap();
        db.upsert_relationship(&make_rel(RelationshipKind::Subset, &["SUB", "SUP"], 0.9))
            .unwrap();

        // depth 1 -> liquidity 0.02 -> score 0.0027, under the 0.05 gate
        let opps = scan_for_violations(&db, 0.05, 2.0).unwrap();
        assert!(opps.is_empty());
    }
}
