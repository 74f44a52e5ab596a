//! Relationship-Inference Oracle
//! Mission: Turn a batch of markets into logical constraint proposals
//!
//! The production oracle is an LLM behind a messages endpoint. Its replies
//! are text that must parse as a JSON array, so everything downstream goes
//! through a forgiving extractor: strip code fences, try a direct parse,
//! then fall back to the outermost `[...]` span.

use crate::models::Market;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;
const RULES_PREFIX_CHARS: usize = 500;

const SYSTEM_PROMPT: &str = "\
You are analyzing binary prediction markets to find logically related markets \
whose prices should be mathematically constrained relative to each other.

For each batch of markets, identify ALL pairs or groups where a logical or \
mathematical relationship exists. Classify each relationship as:

1. SUBSET: Market A's YES outcome is a strict subset of Market B's YES outcome.
   Output: { \"type\": \"SUBSET\", \"subset_ticker\": \"...\", \"superset_ticker\": \"...\",
   \"confidence\": 0.0-1.0, \"reasoning\": \"...\" }

2. THRESHOLD: Markets on the same underlying with ordered thresholds.
   Output: { \"type\": \"THRESHOLD\", \"tickers_ascending\": [\"...\", \"...\"],
   \"confidence\": 0.0-1.0, \"reasoning\": \"...\" }

3. PARTITION: Markets that should sum to ~100%.
   Output: { \"type\": \"PARTITION\", \"tickers\": [\"...\", \"...\"],
   \"confidence\": 0.0-1.0, \"reasoning\": \"...\" }

4. IMPLICATION: One event logically or empirically implies another.
   Output: { \"type\": \"IMPLICATION\", \"if_ticker\": \"...\", \"then_ticker\": \"...\",
   \"estimated_conditional_prob\": 0.0-1.0, \"confidence\": 0.0-1.0,
   \"reasoning\": \"...\" }

CRITICAL: Read the settlement rules carefully. Markets that LOOK related can \
have settlement criteria that break the logical link. Only flag relationships \
you are confident about. False positives waste money.

Return ONLY a valid JSON array of relationships. If none exist, return [].
Do not include any text outside the JSON array.";

/// A raw proposal as emitted by the oracle, before normalisation.
/// Every field is defaulted so a structurally odd proposal deserialises and
/// gets rejected downstream instead of poisoning the whole batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRelationship {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub subset_ticker: Option<String>,
    #[serde(default)]
    pub superset_ticker: Option<String>,
    #[serde(default)]
    pub tickers_ascending: Vec<String>,
    #[serde(default)]
    pub tickers: Vec<String>,
    #[serde(default)]
    pub if_ticker: Option<String>,
    #[serde(default)]
    pub then_ticker: Option<String>,
    #[serde(default)]
    pub estimated_conditional_prob: Option<f64>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

fn default_confidence() -> f64 {
    0.5
}

/// Seam for the external inference service, so discovery logic is testable
/// with a scripted oracle.
#[async_trait]
pub trait RelationshipOracle: Send + Sync {
    async fn propose(&self, markets: &[Market]) -> Result<Vec<RawRelationship>>;
}

// ---------------------------------------------------------------------
// Prompt formatting
// ---------------------------------------------------------------------

fn format_market(m: &Market) -> String {
    let mut parts = vec![
        format!("Ticker: {}", m.ticker),
        format!("  Title: {}", m.title),
    ];
    if let Some(subtitle) = &m.subtitle {
        if !subtitle.is_empty() {
            parts.push(format!("  Subtitle: {}", subtitle));
        }
    }
    parts.push(format!(
        "  Category: {}",
        m.category.as_deref().unwrap_or("N/A")
    ));
    parts.push(format!(
        "  YES ask: {}  YES bid: {}",
        m.yes_ask.map_or("N/A".to_string(), |p| format!("{:.2}", p)),
        m.yes_bid.map_or("N/A".to_string(), |p| format!("{:.2}", p)),
    ));
    if let Some(rules) = &m.rules_primary {
        if !rules.is_empty() {
            let prefix: String = rules.chars().take(RULES_PREFIX_CHARS).collect();
            parts.push(format!("  Settlement rules: {}", prefix));
        }
    }
    parts.join("\n")
}

pub fn build_batch_prompt(markets: &[Market]) -> String {
    let market_text = markets
        .iter()
        .map(format_market)
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "Analyze these {} markets for logical relationships:\n\n{}",
        markets.len(),
        market_text
    )
}

// ---------------------------------------------------------------------
// JSON array salvage
// ---------------------------------------------------------------------

/// Extract a JSON array from oracle output that may carry commentary or
/// markdown fences around it.
pub fn extract_json_array(text: &str) -> Option<Vec<Value>> {
    let mut text = text.trim();

    // Strip a ```...``` fence, tolerating a language tag on the first line
    if text.starts_with("```") {
        let inner = text.trim_start_matches("```");
        let inner = match inner.split_once('\n') {
            Some((_first_line, rest)) => rest,
            None => inner,
        };
        text = inner.trim_end().trim_end_matches("```").trim();
    }

    // Direct parse first
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text) {
        return Some(items);
    }

    // Walk from the first '[' to its matching ']'
    let bytes = text.as_bytes();
    let start = text.find('[')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    if let Ok(Value::Array(items)) =
                        serde_json::from_str::<Value>(&text[start..=i])
                    {
                        return Some(items);
                    }
                    return None;
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_proposals(text: &str) -> Vec<RawRelationship> {
    let Some(items) = extract_json_array(text) else {
        warn!(
            "Could not extract JSON array from oracle response (len={})",
            text.len()
        );
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|v| serde_json::from_value::<RawRelationship>(v).ok())
        .collect()
}

// ---------------------------------------------------------------------
// HTTP oracle
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<MessageBody<'a>>,
}

#[derive(Serialize)]
struct MessageBody<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

/// Messages-endpoint oracle client.
pub struct InferenceOracle {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl InferenceOracle {
    pub fn new(http: reqwest::Client, api_key: String) -> Self {
        let model = std::env::var("ORACLE_SCAN_MODEL")
            .unwrap_or_else(|_| "claude-sonnet-4-5".to_string());
        Self {
            http,
            api_key,
            model,
        }
    }

    pub fn from_env(http: reqwest::Client) -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .context("ANTHROPIC_API_KEY missing (set env var)")?;
        if api_key.trim().is_empty() {
            return Err(anyhow!("ANTHROPIC_API_KEY empty"));
        }
        Ok(Self::new(http, api_key))
    }

    async fn complete(&self, user_msg: String) -> Result<String> {
        let req = MessagesRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system: SYSTEM_PROMPT,
            messages: vec![MessageBody {
                role: "user",
                content: user_msg,
            }],
        };

        let resp = self
            .http
            .post(MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&req)
            .timeout(Duration::from_secs(120))
            .send()
            .await
            .context("Oracle request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Oracle returned {}: {}", status, text));
        }

        let body: MessagesResponse = resp.json().await.context("Oracle response not JSON")?;
        let text = body
            .content
            .first()
            .map(|c| c.text.trim().to_string())
            .unwrap_or_default();
        Ok(text)
    }
}

#[async_trait]
impl RelationshipOracle for InferenceOracle {
    async fn propose(&self, markets: &[Market]) -> Result<Vec<RawRelationship>> {
        info!(
            "Sending {} markets to {} for relationship analysis",
            markets.len(),
            self.model
        );
        let text = self.complete(build_batch_prompt(markets)).await?;
        let proposals = parse_proposals(&text);
        info!("Oracle proposed {} relationships in batch", proposals.len());
        Ok(proposals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::now_iso;
    use crate::models::MarketStatus;

    #[test]
    fn extracts_plain_array() {
        let items = extract_json_array(r#"[{"type": "SUBSET"}]"#).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn extracts_fenced_array() {
        let text = "```json\n[{\"type\": \"PARTITION\", \"tickers\": [\"A\", \"B\"]}]\n```";
        let items = extract_json_array(text).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn extracts_array_with_commentary() {
        let text = "Here are the relationships I found:\n\n[{\"type\": \"SUBSET\"}, {\"type\": \"THRESHOLD\"}]\n\nLet me know if you need more.";
        let items = extract_json_array(text).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn nested_arrays_do_not_truncate() {
        let text = "result: [{\"type\": \"THRESHOLD\", \"tickers_ascending\": [\"A\", \"B\", \"C\"]}]";
        let items = extract_json_array(text).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn brackets_inside_strings_are_ignored() {
        let text = r#"[{"type": "SUBSET", "reasoning": "see [1] and ]weird[ text"}]"#;
        let items = extract_json_array(text).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn garbage_yields_nothing() {
        assert!(extract_json_array("no array here").is_none());
        assert!(extract_json_array("[unclosed").is_none());
        assert!(parse_proposals("total garbage").is_empty());
    }

    #[test]
    fn malformed_items_are_dropped_not_fatal() {
        let text = r#"[{"type": "SUBSET", "subset_ticker": "A", "superset_ticker": "B"}, "just a string"]"#;
        let proposals = parse_proposals(text);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].kind, "SUBSET");
    }

    #[test]
    fn prompt_truncates_settlement_rules() {
        let m = Market {
            ticker: "T".to_string(),
            event_ticker: None,
            title: "Long rules".to_string(),
            subtitle: None,
            category: None,
            status: MarketStatus::Open,
            yes_ask: Some(0.5),
            yes_bid: Some(0.48),
            no_ask: None,
            no_bid: None,
            volume: 0,
            open_interest: 0,
            close_time: None,
            rules_primary: Some("x".repeat(2000)),
            updated_at: now_iso(),
        };
        let prompt = build_batch_prompt(&[m]);
        assert!(prompt.contains(&"x".repeat(500)));
        assert!(!prompt.contains(&"x".repeat(501)));
    }
}
