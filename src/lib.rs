//! Cross-market mispricing engine for a binary prediction-market exchange.
//!
//! Five-layer pipeline: ingestion -> relationship mapping -> violation
//! detection -> execution, with a portfolio guard mediating every trade.

pub mod alerts;
pub mod config;
pub mod db;
pub mod detector;
pub mod exchange;
pub mod executor;
pub mod fees;
pub mod ingestion;
pub mod market_cache;
pub mod models;
pub mod orchestrator;
pub mod portfolio;
pub mod relationship;
