//! Configuration
//! Mission: YAML file merged over safe defaults; secrets from the environment
//!
//! The YAML file is optional. Every section and every field has a default, so
//! a partial file (e.g. just `trading: { dry_run: false }`) merges cleanly.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub trading: TradingConfig,
    pub scanning: ScanningConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trading: TradingConfig::default(),
            scanning: ScanningConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub dry_run: bool,
    pub max_risk_per_trade_pct: f64,
    pub max_daily_loss: f64,
    pub max_open_positions: i64,
    pub max_contracts_per_trade: i64,
    pub min_score_threshold: f64,
    pub fee_safety_multiplier: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            dry_run: true, // safe default
            max_risk_per_trade_pct: 0.02,
            max_daily_loss: 50.0,
            max_open_positions: 10,
            max_contracts_per_trade: 50,
            min_score_threshold: 0.05,
            fee_safety_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScanningConfig {
    pub full_scan_interval_seconds: u64,
    pub opportunity_recheck_seconds: u64,
    pub relationship_rescan_hours: u64,
}

impl Default for ScanningConfig {
    fn default() -> Self {
        Self {
            full_scan_interval_seconds: 60,
            opportunity_recheck_seconds: 15,
            relationship_rescan_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load config from a YAML file, falling back to defaults when the file
    /// is absent. Unknown keys are ignored; missing keys take defaults.
    pub fn load(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            info!("Config file {} not found, using defaults", path);
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path))?;
        Ok(config)
    }
}

/// Secrets and endpoints, read from the environment (.env supported).
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key_id: String,
    pub private_key_pem: String,
    pub base_url: String,
    pub database_path: String,
    pub webhook_url: Option<String>,
    pub oracle_api_key: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let api_key_id = std::env::var("KALSHI_API_KEY_ID")
            .context("KALSHI_API_KEY_ID environment variable is not set")?;

        // Handle escaped newlines when the PEM arrives through a .env file
        let private_key_pem = std::env::var("KALSHI_RSA_PRIVATE_KEY")
            .context("KALSHI_RSA_PRIVATE_KEY environment variable is not set")?
            .replace("\\n", "\n");

        let base_url = std::env::var("KALSHI_BASE_URL")
            .unwrap_or_else(|_| "https://demo-api.kalshi.co/trade-api/v2".to_string())
            .trim_end_matches('/')
            .to_string();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./edgebot.db".to_string());

        let webhook_url = std::env::var("DISCORD_WEBHOOK_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let oracle_api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Ok(Self {
            api_key_id,
            private_key_pem,
            base_url,
            database_path,
            webhook_url,
            oracle_api_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_safe() {
        let cfg = Config::default();
        assert!(cfg.trading.dry_run);
        assert_eq!(cfg.trading.max_contracts_per_trade, 50);
        assert_eq!(cfg.scanning.opportunity_recheck_seconds, 15);
        assert_eq!(cfg.logging.level, "INFO");
    }

    #[test]
    fn partial_yaml_merges_over_defaults() {
        let yaml = "trading:\n  dry_run: false\n  max_daily_loss: 25.0\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(!cfg.trading.dry_run);
        assert_eq!(cfg.trading.max_daily_loss, 25.0);
        // untouched fields keep defaults
        assert_eq!(cfg.trading.max_open_positions, 10);
        assert_eq!(cfg.scanning.full_scan_interval_seconds, 60);
    }

    #[test]
    fn empty_yaml_is_all_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.trading.min_score_threshold, 0.05);
        assert_eq!(cfg.scanning.relationship_rescan_hours, 24);
    }
}
