//! Exchange API integration: signed client and wire types.

pub mod client;
pub mod types;

pub use client::KalshiClient;
pub use types::{ApiEvent, ApiMarket, ApiOrder, OrderRequest};
