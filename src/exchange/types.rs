//! Wire types for the exchange REST API.
//!
//! Prices cross the wire as integer cents; normalisation to dollars happens
//! at the ingestion boundary, not here.

use crate::models::{ContractSide, Leg, LegSide};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiMarket {
    pub ticker: String,
    #[serde(default)]
    pub event_ticker: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub yes_ask: Option<i64>,
    #[serde(default)]
    pub yes_bid: Option<i64>,
    #[serde(default)]
    pub no_ask: Option<i64>,
    #[serde(default)]
    pub no_bid: Option<i64>,
    #[serde(default)]
    pub volume: Option<i64>,
    #[serde(default)]
    pub open_interest: Option<i64>,
    #[serde(default)]
    pub close_time: Option<String>,
    #[serde(default)]
    pub expiration_time: Option<String>,
    #[serde(default)]
    pub rules_primary: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketsResponse {
    #[serde(default)]
    pub markets: Vec<ApiMarket>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketResponse {
    pub market: ApiMarket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEvent {
    pub event_ticker: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// The API may inline full market objects under the event.
    #[serde(default)]
    pub markets: Vec<ApiMarket>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsResponse {
    #[serde(default)]
    pub events: Vec<ApiEvent>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventResponse {
    pub event: ApiEvent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceResponse {
    /// Account balance in cents.
    #[serde(default)]
    pub balance: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiPosition {
    pub ticker: String,
    #[serde(default)]
    pub position: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionsResponse {
    #[serde(default)]
    pub market_positions: Vec<ApiPosition>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FillsResponse {
    #[serde(default)]
    pub fills: Vec<serde_json::Value>,
    #[serde(default)]
    pub cursor: Option<String>,
}

/// Limit/market order submission body.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub ticker: String,
    pub action: String,
    pub side: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yes_price: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_ts: Option<i64>,
}

impl OrderRequest {
    /// Build a limit order for one opportunity leg.
    ///
    /// This is the single place where the complementary-side conversion
    /// lives: a NO leg priced at `no_cents` is submitted as `side = no`
    /// with `yes_price = 100 - no_cents`.
    pub fn for_leg(leg: &Leg, count: i64, price_cents: i64, expiration_ts: i64) -> Self {
        let yes_price = match leg.contract {
            ContractSide::Yes => price_cents,
            ContractSide::No => 100 - price_cents,
        };
        Self {
            ticker: leg.ticker.clone(),
            action: match leg.side {
                LegSide::Buy => "buy".to_string(),
                LegSide::Sell => "sell".to_string(),
            },
            side: leg.contract.as_str().to_string(),
            order_type: "limit".to_string(),
            count,
            yes_price: Some(yes_price),
            expiration_ts: Some(expiration_ts),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiOrder {
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub filled_count: Option<i64>,
}

impl ApiOrder {
    pub fn is_filled(&self) -> bool {
        self.status == "filled" || self.status == "executed"
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.status.as_str(), "canceled" | "cancelled" | "expired")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    pub order: ApiOrder,
}
