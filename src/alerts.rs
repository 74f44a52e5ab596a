//! Webhook Alerts
//! Mission: Best-effort operational notifications, never in the hot path
//!
//! Sends structured embeds for opportunities, trades, errors and the daily
//! summary. A client-side sliding window caps routine sends; startup,
//! shutdown and error alerts bypass the cap. A 429 from the sink triggers a
//! bounded sleep, never a retry storm.

use crate::models::{Opportunity, PortfolioState, Trade};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const COLOUR_GREEN: u32 = 0x2ECC71;
const COLOUR_RED: u32 = 0xE74C3C;
const COLOUR_BLUE: u32 = 0x3498DB;
const COLOUR_YELLOW: u32 = 0xF1C40F;
const COLOUR_ORANGE: u32 = 0xE67E22;

const FOOTER: &str = "edgebot";
const MAX_429_SLEEP_SECS: f64 = 3.0;

pub struct AlertSink {
    http: reqwest::Client,
    webhook_url: Option<String>,
    max_per_minute: usize,
    min_score: f64,
    sent: Mutex<VecDeque<Instant>>,
}

impl AlertSink {
    pub fn new(http: reqwest::Client, webhook_url: Option<String>) -> Self {
        let max_per_minute = std::env::var("ALERT_MAX_PER_MINUTE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let min_score = std::env::var("ALERT_MIN_SCORE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.1);
        Self {
            http,
            webhook_url,
            max_per_minute,
            min_score,
            sent: Mutex::new(VecDeque::new()),
        }
    }

    fn rate_limited(&self) -> bool {
        let mut sent = self.sent.lock();
        let now = Instant::now();
        while let Some(front) = sent.front() {
            if now.duration_since(*front) > Duration::from_secs(60) {
                sent.pop_front();
            } else {
                break;
            }
        }
        sent.len() >= self.max_per_minute
    }

    async fn send(&self, payload: Value, force: bool) {
        let Some(url) = &self.webhook_url else {
            debug!("Webhook URL not set, skipping alert");
            return;
        };
        if !force && self.rate_limited() {
            debug!(
                "Alert rate limit reached ({}/min), skipping",
                self.max_per_minute
            );
            return;
        }

        match self
            .http
            .post(url)
            .json(&payload)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(resp) => {
                self.sent.lock().push_back(Instant::now());
                if resp.status().as_u16() == 429 {
                    let retry_after = resp
                        .json::<Value>()
                        .await
                        .ok()
                        .and_then(|v| v.get("retry_after").and_then(|r| r.as_f64()))
                        .unwrap_or(1.0);
                    debug!("Webhook 429, backing off {:.1}s", retry_after);
                    tokio::time::sleep(Duration::from_secs_f64(
                        retry_after.min(MAX_429_SLEEP_SECS),
                    ))
                    .await;
                } else if !resp.status().is_success() {
                    warn!("Webhook returned {}", resp.status());
                }
            }
            Err(e) => warn!("Failed to send alert: {}", e),
        }
    }

    fn embed(title: String, description: String, colour: u32) -> Value {
        json!({
            "embeds": [{
                "title": title,
                "description": description,
                "color": colour,
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "footer": { "text": FOOTER },
            }]
        })
    }

    // -----------------------------------------------------------------
    // Alert types
    // -----------------------------------------------------------------

    /// Newly detected opportunity; low scores are skipped as noise.
    pub async fn opportunity(&self, opp: &Opportunity) {
        if opp.score < self.min_score {
            return;
        }
        let legs_text = opp
            .legs
            .iter()
            .map(|l| {
                format!(
                    "  {} {} @ ${:.2}",
                    l.side.as_str().to_uppercase(),
                    l.ticker,
                    l.price
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let description = format!(
            "**Magnitude:** ${:.4}\n**Confidence:** {:.2}\n**Score:** {:.4}\n\n**Legs:**\n```\n{}\n```",
            opp.magnitude, opp.confidence, opp.score, legs_text
        );
        self.send(
            Self::embed(
                format!("Opportunity: {}", opp.signal.label()),
                description,
                COLOUR_BLUE,
            ),
            false,
        )
        .await;
    }

    pub async fn trade(&self, trade: &Trade, dry_run: bool) {
        let prefix = if dry_run { "DRY RUN " } else { "" };
        let colour = if dry_run { COLOUR_YELLOW } else { COLOUR_GREEN };
        let description = format!(
            "**Side:** {}\n**Count:** {}\n**Price:** ${:.2}\n**Fees:** ${:.2}\n**Order ID:** `{}`\n**Status:** {}",
            trade.side.as_str(),
            trade.count,
            trade.price,
            trade.fees,
            trade.order_id,
            trade.order_status
        );
        self.send(
            Self::embed(
                format!(
                    "{}Trade: {} {}",
                    prefix,
                    trade.action.as_str().to_uppercase(),
                    trade.ticker
                ),
                description,
                colour,
            ),
            false,
        )
        .await;
    }

    /// Errors always go out, bypassing the rate cap.
    pub async fn error(&self, title: &str, error_msg: &str) {
        let truncated: String = error_msg.chars().take(1800).collect();
        self.send(
            Self::embed(
                format!("Error: {}", title),
                format!("```\n{}\n```", truncated),
                COLOUR_RED,
            ),
            true,
        )
        .await;
    }

    pub async fn daily_summary(
        &self,
        summary: &PortfolioState,
        opportunities_today: u64,
        trades_today: u64,
    ) {
        let colour = if summary.daily_pnl >= 0.0 {
            COLOUR_GREEN
        } else {
            COLOUR_RED
        };
        let description = format!(
            "**Balance:** ${:.2}\n**Daily P&L:** ${:+.2}\n**Open Positions:** {}\n**Kill Switch:** {}\n\n**Opportunities Detected:** {}\n**Trades Executed:** {}",
            summary.balance,
            summary.daily_pnl,
            summary.open_positions,
            if summary.kill_switch { "ON" } else { "OFF" },
            opportunities_today,
            trades_today
        );
        self.send(
            Self::embed("Daily Summary".to_string(), description, colour),
            true,
        )
        .await;
    }

    pub async fn startup(&self) {
        self.send(
            Self::embed(
                "Bot Started".to_string(),
                "Mispricing engine is online and scanning markets.".to_string(),
                COLOUR_GREEN,
            ),
            true,
        )
        .await;
    }

    pub async fn shutdown(&self, reason: &str) {
        self.send(
            Self::embed(
                "Bot Shutting Down".to_string(),
                format!("Reason: {}", reason),
                COLOUR_ORANGE,
            ),
            true,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(max_per_minute: usize) -> AlertSink {
        AlertSink {
            http: reqwest::Client::new(),
            webhook_url: None,
            max_per_minute,
            min_score: 0.1,
            sent: Mutex::new(VecDeque::new()),
        }
    }

    #[test]
    fn sliding_window_rate_limit() {
        let sink = sink(3);
        assert!(!sink.rate_limited());
        for _ in 0..3 {
            sink.sent.lock().push_back(Instant::now());
        }
        assert!(sink.rate_limited());
    }

    #[test]
    fn stale_timestamps_are_purged() {
        let sink = sink(1);
        sink.sent
            .lock()
            .push_back(Instant::now() - Duration::from_secs(120));
        assert!(!sink.rate_limited());
        assert!(sink.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn missing_webhook_is_a_silent_no_op() {
        let sink = sink(10);
        // Must not panic or attempt network I/O
        sink.error("boom", "details").await;
        sink.startup().await;
    }
}
