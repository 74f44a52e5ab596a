use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Market lifecycle status as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatus {
    Open,
    Active,
    Closed,
    Settled,
    Unknown,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Open => "open",
            MarketStatus::Active => "active",
            MarketStatus::Closed => "closed",
            MarketStatus::Settled => "settled",
            MarketStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "open" => MarketStatus::Open,
            "active" => MarketStatus::Active,
            "closed" => MarketStatus::Closed,
            "settled" => MarketStatus::Settled,
            _ => MarketStatus::Unknown,
        }
    }

    /// Open and active markets are both tradeable.
    pub fn is_open(&self) -> bool {
        matches!(self, MarketStatus::Open | MarketStatus::Active)
    }
}

/// A single binary market. Prices are dollars in [0, 1]; `None` means the
/// exchange reported no resting orders on that side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub ticker: String,
    pub event_ticker: Option<String>,
    pub title: String,
    pub subtitle: Option<String>,
    pub category: Option<String>,
    pub status: MarketStatus,
    pub yes_ask: Option<f64>,
    pub yes_bid: Option<f64>,
    pub no_ask: Option<f64>,
    pub no_bid: Option<f64>,
    pub volume: i64,
    pub open_interest: i64,
    pub close_time: Option<String>,
    pub rules_primary: Option<String>,
    pub updated_at: String,
}

/// Event grouping of markets, used to batch relationship discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_ticker: String,
    pub title: String,
    pub category: Option<String>,
    pub market_tickers: Vec<String>,
}

/// Logical constraint variants relating market prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipKind {
    /// tickers = [subset, superset]; P(subset) <= P(superset)
    Subset,
    /// tickers ascending by threshold; P(t1) >= P(t2) >= ...
    Threshold,
    /// tickers mutually exclusive + exhaustive; sum P = 1
    Partition,
    /// tickers = [if, then]; soft P(if) <= P(then)
    Implication,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipKind::Subset => "SUBSET",
            RelationshipKind::Threshold => "THRESHOLD",
            RelationshipKind::Partition => "PARTITION",
            RelationshipKind::Implication => "IMPLICATION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUBSET" => Some(RelationshipKind::Subset),
            "THRESHOLD" => Some(RelationshipKind::Threshold),
            "PARTITION" => Some(RelationshipKind::Partition),
            "IMPLICATION" => Some(RelationshipKind::Implication),
            _ => None,
        }
    }
}

/// A discovered logical constraint between markets.
///
/// `tickers` preserves the variant's semantic order (e.g. [subset, superset]);
/// the dedup key is (kind, sorted tickers) and lives in its own DB column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub kind: RelationshipKind,
    pub tickers: Vec<String>,
    pub constraint_description: String,
    pub constraint_formula: String,
    pub confidence: f64,
    pub reasoning: String,
    pub created_at: DateTime<Utc>,
    pub last_validated: DateTime<Utc>,
}

impl Relationship {
    /// Sorted-ticker JSON used for dedup comparisons.
    pub fn dedup_key(&self) -> String {
        let mut sorted = self.tickers.clone();
        sorted.sort();
        serde_json::to_string(&sorted).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegSide {
    Buy,
    Sell,
}

impl LegSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegSide::Buy => "buy",
            LegSide::Sell => "sell",
        }
    }
}

/// Which side of the binary contract a leg trades. Almost always YES; the
/// degenerate one-market partition buys both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractSide {
    Yes,
    No,
}

impl ContractSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractSide::Yes => "yes",
            ContractSide::No => "no",
        }
    }
}

/// One order leg of an opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    pub ticker: String,
    pub side: LegSide,
    #[serde(default = "default_contract_side")]
    pub contract: ContractSide,
    pub price: f64,
    pub depth: i64,
}

fn default_contract_side() -> ContractSide {
    ContractSide::Yes
}

/// What kind of mispricing a detected opportunity captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeSignal {
    BuySupersetSellSubset,
    /// Adjacent threshold pair: buy the lower cutoff, sell the higher.
    ThresholdPair { lower: String, higher: String },
    BuyAllPartition,
    SellAllPartition,
    BuyThenSellIf,
}

impl TradeSignal {
    pub fn label(&self) -> String {
        match self {
            TradeSignal::BuySupersetSellSubset => "BUY_SUPERSET_SELL_SUBSET".to_string(),
            TradeSignal::ThresholdPair { lower, higher } => {
                format!("BUY_{}_SELL_{}", lower, higher)
            }
            TradeSignal::BuyAllPartition => "BUY_ALL_PARTITION".to_string(),
            TradeSignal::SellAllPartition => "SELL_ALL_PARTITION".to_string(),
            TradeSignal::BuyThenSellIf => "BUY_THEN_SELL_IF".to_string(),
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "BUY_SUPERSET_SELL_SUBSET" => Some(TradeSignal::BuySupersetSellSubset),
            "BUY_ALL_PARTITION" => Some(TradeSignal::BuyAllPartition),
            "SELL_ALL_PARTITION" => Some(TradeSignal::SellAllPartition),
            "BUY_THEN_SELL_IF" => Some(TradeSignal::BuyThenSellIf),
            other => {
                let rest = other.strip_prefix("BUY_")?;
                let (lower, higher) = rest.split_once("_SELL_")?;
                Some(TradeSignal::ThresholdPair {
                    lower: lower.to_string(),
                    higher: higher.to_string(),
                })
            }
        }
    }

    /// Partition signals place every leg simultaneously; the rest are two-leg.
    pub fn is_partition(&self) -> bool {
        matches!(
            self,
            TradeSignal::BuyAllPartition | TradeSignal::SellAllPartition
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpportunityStatus {
    Detected,
    Executing,
    Filled,
    Failed,
    Expired,
}

impl OpportunityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpportunityStatus::Detected => "DETECTED",
            OpportunityStatus::Executing => "EXECUTING",
            OpportunityStatus::Filled => "FILLED",
            OpportunityStatus::Failed => "FAILED",
            OpportunityStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DETECTED" => Some(OpportunityStatus::Detected),
            "EXECUTING" => Some(OpportunityStatus::Executing),
            "FILLED" => Some(OpportunityStatus::Filled),
            "FAILED" => Some(OpportunityStatus::Failed),
            "EXPIRED" => Some(OpportunityStatus::Expired),
            _ => None,
        }
    }
}

/// A scored constraint violation ready for execution.
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub id: String,
    pub relationship_id: Option<String>,
    pub signal: TradeSignal,
    /// Raw spread in dollars per contract, before fees.
    pub magnitude: f64,
    pub confidence: f64,
    pub score: f64,
    pub legs: Vec<Leg>,
    pub status: OpportunityStatus,
    pub detected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A single order sent to (or simulated against) the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub opportunity_id: Option<String>,
    pub ticker: String,
    pub side: ContractSide,
    pub action: LegSide,
    pub price: f64,
    pub count: i64,
    pub order_id: String,
    pub order_status: String,
    pub filled_count: i64,
    pub fees: f64,
    pub created_at: String,
    pub updated_at: String,
}

/// Singleton portfolio snapshot persisted after every mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioState {
    pub balance: f64,
    pub daily_pnl: f64,
    pub open_positions: i64,
    pub kill_switch: bool,
    pub last_updated: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_label_round_trip() {
        let signals = [
            TradeSignal::BuySupersetSellSubset,
            TradeSignal::ThresholdPair {
                lower: "INX-3".to_string(),
                higher: "INX-4".to_string(),
            },
            TradeSignal::BuyAllPartition,
            TradeSignal::SellAllPartition,
            TradeSignal::BuyThenSellIf,
        ];
        for s in signals {
            assert_eq!(TradeSignal::from_label(&s.label()), Some(s));
        }
    }

    #[test]
    fn dedup_key_ignores_order() {
        let mk = |tickers: &[&str]| Relationship {
            id: "r1".to_string(),
            kind: RelationshipKind::Subset,
            tickers: tickers.iter().map(|t| t.to_string()).collect(),
            constraint_description: String::new(),
            constraint_formula: String::new(),
            confidence: 0.9,
            reasoning: String::new(),
            created_at: Utc::now(),
            last_validated: Utc::now(),
        };
        assert_eq!(mk(&["B", "A"]).dedup_key(), mk(&["A", "B"]).dedup_key());
    }

    #[test]
    fn market_status_parse() {
        assert!(MarketStatus::parse("open").is_open());
        assert!(MarketStatus::parse("active").is_open());
        assert!(!MarketStatus::parse("settled").is_open());
        assert_eq!(MarketStatus::parse("???"), MarketStatus::Unknown);
    }
}
