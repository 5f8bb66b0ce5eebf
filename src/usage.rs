use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::pricing::{self, PricingManifest, UsageAmounts};

/// Normalized token usage for one LLM call.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_5m_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_1h_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_storage_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn merge(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        for (mine, theirs) in [
            (&mut self.cached_tokens, other.cached_tokens),
            (&mut self.reasoning_tokens, other.reasoning_tokens),
            (&mut self.cache_5m_tokens, other.cache_5m_tokens),
            (&mut self.cache_1h_tokens, other.cache_1h_tokens),
            (&mut self.cache_creation_tokens, other.cache_creation_tokens),
            (&mut self.cache_storage_tokens, other.cache_storage_tokens),
        ] {
            if let Some(value) = theirs {
                *mine = Some(mine.unwrap_or(0) + value);
            }
        }
    }

    pub fn amounts(&self) -> UsageAmounts {
        UsageAmounts {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cached_tokens: self.cached_tokens.unwrap_or(0),
            cache_storage_tokens: self.cache_storage_tokens.unwrap_or(0),
            cache_5m_tokens: self.cache_5m_tokens.unwrap_or(0),
            cache_1h_tokens: self.cache_1h_tokens.unwrap_or(0),
        }
    }
}

fn as_u64(value: Option<&Value>) -> Option<u64> {
    value.and_then(Value::as_u64)
}

/// Extract a normalized usage record from a provider response payload.
///
/// Handles the three shapes the providers emit: OpenAI Response API
/// `usage_metadata` (with `input_token_details` / `output_token_details`),
/// OpenAI standard `response_metadata.token_usage` (with
/// `prompt_tokens_details` / `completion_tokens_details`) and Anthropic
/// `response_metadata.usage` (with `cache_read_input_tokens` and
/// `cache_creation` ephemeral breakdowns).
pub fn extract_token_usage(response: &Value) -> TokenUsage {
    let mut usage = TokenUsage::default();

    if let Some(meta) = response.get("usage_metadata").filter(|v| v.is_object()) {
        usage.input_tokens = as_u64(meta.get("input_tokens")).unwrap_or(0);
        usage.output_tokens = as_u64(meta.get("output_tokens")).unwrap_or(0);
        usage.total_tokens = as_u64(meta.get("total_tokens")).unwrap_or(0);

        if let Some(details) = meta.get("input_token_details") {
            if let Some(cache_read) = as_u64(details.get("cache_read")) {
                usage.cached_tokens = Some(cache_read);
            }
        }
        if let Some(details) = meta.get("output_token_details") {
            if let Some(reasoning) = as_u64(details.get("reasoning")) {
                usage.reasoning_tokens = Some(reasoning);
            }
        }
    }

    if let Some(token_usage) = response
        .get("response_metadata")
        .and_then(|m| m.get("token_usage"))
        .filter(|v| v.is_object())
    {
        if usage.input_tokens == 0 {
            usage.input_tokens = as_u64(token_usage.get("prompt_tokens")).unwrap_or(0);
            usage.output_tokens = as_u64(token_usage.get("completion_tokens")).unwrap_or(0);
            usage.total_tokens = as_u64(token_usage.get("total_tokens")).unwrap_or(0);
        }
        if let Some(details) = token_usage.get("prompt_tokens_details") {
            if let Some(cached) = as_u64(details.get("cached_tokens")) {
                usage.cached_tokens = Some(cached);
            }
        }
        if let Some(details) = token_usage.get("completion_tokens_details") {
            if let Some(reasoning) = as_u64(details.get("reasoning_tokens")) {
                usage.reasoning_tokens = Some(reasoning);
            }
        }
    }

    if let Some(provider_usage) = response
        .get("response_metadata")
        .and_then(|m| m.get("usage"))
        .filter(|v| v.is_object())
    {
        if usage.input_tokens == 0 {
            usage.input_tokens = as_u64(provider_usage.get("input_tokens")).unwrap_or(0);
            usage.output_tokens = as_u64(provider_usage.get("output_tokens")).unwrap_or(0);
            usage.total_tokens = usage.input_tokens + usage.output_tokens;
        }
        if let Some(cache_read) = as_u64(provider_usage.get("cache_read_input_tokens")) {
            usage.cached_tokens = Some(cache_read);
        }
        if let Some(creation) = provider_usage.get("cache_creation").filter(|v| v.is_object()) {
            if let Some(five) = as_u64(creation.get("ephemeral_5m_input_tokens")) {
                if five > 0 {
                    usage.cache_5m_tokens = Some(five);
                }
            }
            if let Some(hour) = as_u64(creation.get("ephemeral_1h_input_tokens")) {
                if hour > 0 {
                    usage.cache_1h_tokens = Some(hour);
                }
            }
        } else if let Some(creation) = as_u64(provider_usage.get("cache_creation_input_tokens")) {
            if creation > 0 {
                usage.cache_creation_tokens = Some(creation);
            }
        }
    }

    usage
}

/// One tracked LLM call.
#[derive(Debug, Clone, Serialize)]
pub struct TokenRecord {
    pub model_name: String,
    pub usage: TokenUsage,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct TrackerInner {
    records: Vec<TokenRecord>,
    model_totals: HashMap<String, TokenUsage>,
}

/// Thread-safe per-call capture plus per-model aggregation, installed into
/// every LLM call of a turn.
#[derive(Default)]
pub struct TokenTracker {
    inner: Mutex<TrackerInner>,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        model_name: &str,
        usage: TokenUsage,
        run_id: &str,
        parent_run_id: Option<&str>,
    ) {
        let mut inner = self.inner.lock().expect("token tracker lock poisoned");
        inner
            .model_totals
            .entry(model_name.to_string())
            .or_default()
            .merge(&usage);
        inner.records.push(TokenRecord {
            model_name: model_name.to_string(),
            usage,
            run_id: run_id.to_string(),
            parent_run_id: parent_run_id.map(str::to_string),
            timestamp: Utc::now(),
        });
    }

    pub fn records(&self) -> Vec<TokenRecord> {
        self.inner
            .lock()
            .expect("token tracker lock poisoned")
            .records
            .clone()
    }

    pub fn model_totals(&self) -> HashMap<String, TokenUsage> {
        self.inner
            .lock()
            .expect("token tracker lock poisoned")
            .model_totals
            .clone()
    }

    /// Aggregate usage and cost across every model seen this turn.
    pub fn summary(&self, manifest: &PricingManifest) -> UsageSummary {
        let totals = self.model_totals();

        let mut summary = UsageSummary::default();
        for (model, usage) in totals {
            summary.input_tokens += usage.input_tokens;
            summary.output_tokens += usage.output_tokens;
            summary.total_tokens += usage.total_tokens;

            let cost = pricing::find_model_pricing(manifest, &model, None)
                .map(|p| pricing::calculate_total_cost(usage.amounts(), p).total_cost)
                .unwrap_or(0.0);
            summary.total_cost += cost;
            summary.by_model.insert(model, ModelUsage { usage, cost });
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelUsage {
    #[serde(flatten)]
    pub usage: TokenUsage,
    pub cost: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageSummary {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub by_model: HashMap<String, ModelUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn openai_response_api_shape_is_extracted() {
        let response = json!({
            "usage_metadata": {
                "input_tokens": 1200,
                "output_tokens": 300,
                "total_tokens": 1500,
                "input_token_details": {"cache_read": 800},
                "output_token_details": {"reasoning": 120}
            }
        });
        let usage = extract_token_usage(&response);
        assert_eq!(usage.input_tokens, 1200);
        assert_eq!(usage.cached_tokens, Some(800));
        assert_eq!(usage.reasoning_tokens, Some(120));
    }

    #[test]
    fn openai_standard_shape_fills_missing_counts() {
        let response = json!({
            "response_metadata": {
                "token_usage": {
                    "prompt_tokens": 900,
                    "completion_tokens": 100,
                    "total_tokens": 1000,
                    "prompt_tokens_details": {"cached_tokens": 500},
                    "completion_tokens_details": {"reasoning_tokens": 40}
                }
            }
        });
        let usage = extract_token_usage(&response);
        assert_eq!(usage.input_tokens, 900);
        assert_eq!(usage.output_tokens, 100);
        assert_eq!(usage.cached_tokens, Some(500));
        assert_eq!(usage.reasoning_tokens, Some(40));
    }

    #[test]
    fn anthropic_shape_captures_cache_creation_breakdown() {
        let response = json!({
            "response_metadata": {
                "usage": {
                    "input_tokens": 2000,
                    "output_tokens": 400,
                    "cache_read_input_tokens": 1500,
                    "cache_creation": {
                        "ephemeral_5m_input_tokens": 300,
                        "ephemeral_1h_input_tokens": 0
                    }
                }
            }
        });
        let usage = extract_token_usage(&response);
        assert_eq!(usage.input_tokens, 2000);
        assert_eq!(usage.total_tokens, 2400);
        assert_eq!(usage.cached_tokens, Some(1500));
        assert_eq!(usage.cache_5m_tokens, Some(300));
        // Zero-valued breakdown entries are dropped.
        assert_eq!(usage.cache_1h_tokens, None);
    }

    #[test]
    fn anthropic_fallback_without_breakdown() {
        let response = json!({
            "response_metadata": {
                "usage": {
                    "input_tokens": 100,
                    "output_tokens": 10,
                    "cache_creation_input_tokens": 50
                }
            }
        });
        let usage = extract_token_usage(&response);
        assert_eq!(usage.cache_creation_tokens, Some(50));
    }

    #[test]
    fn tracker_aggregates_per_model() {
        let tracker = TokenTracker::new();
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 20,
            total_tokens: 120,
            cached_tokens: Some(50),
            ..Default::default()
        };
        tracker.record("gpt-5", usage.clone(), "run-1", None);
        tracker.record("gpt-5", usage, "run-2", Some("run-1"));

        let totals = tracker.model_totals();
        assert_eq!(totals["gpt-5"].input_tokens, 200);
        assert_eq!(totals["gpt-5"].cached_tokens, Some(100));
        assert_eq!(tracker.records().len(), 2);
    }
}
