use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const PER_MILLION: f64 = 1_000_000.0;

#[derive(Debug, Clone, Deserialize)]
pub struct PriceTier {
    /// Upper cumulative token bound for this tier; `null` means unbounded.
    pub max_tokens: Option<u64>,
    pub rate: f64,
    #[serde(default)]
    pub cached_input: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatrixEntry {
    pub input_max: Option<u64>,
    pub output_max: Option<u64>,
    pub input: f64,
    pub output: f64,
    #[serde(default)]
    pub cached_input: f64,
}

/// Pricing for one model. Rates are USD per 1M tokens.
///
/// Four shapes share this struct: flat (`input`/`output`), tiered
/// (`input_tiers`/`output_tiers`), input-dependent output
/// (`output_pricing_mode = "input_dependent"`) and full 2D matrices
/// (`pricing_mode = "2d_matrix"`).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Pricing {
    #[serde(default)]
    pub pricing_mode: Option<String>,
    #[serde(default)]
    pub output_pricing_mode: Option<String>,
    #[serde(default)]
    pub input: Option<f64>,
    #[serde(default)]
    pub output: Option<f64>,
    #[serde(default)]
    pub cached_input: Option<f64>,
    #[serde(default)]
    pub cache_hit: Option<f64>,
    #[serde(default)]
    pub cache_storage: Option<f64>,
    #[serde(default)]
    pub cache_5m: Option<f64>,
    #[serde(default)]
    pub cache_1h: Option<f64>,
    #[serde(default)]
    pub input_tiers: Option<Vec<PriceTier>>,
    #[serde(default)]
    pub output_tiers: Option<Vec<PriceTier>>,
    #[serde(default)]
    pub matrix: Option<Vec<MatrixEntry>>,
}

impl Pricing {
    fn is_2d_matrix(&self) -> bool {
        self.pricing_mode.as_deref() == Some("2d_matrix") && self.matrix.is_some()
    }

    fn is_input_dependent(&self) -> bool {
        self.output_pricing_mode.as_deref() == Some("input_dependent")
            && self.output_tiers.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    #[serde(default)]
    pub alias: Vec<String>,
    #[serde(default)]
    pub pricing: Option<Pricing>,
}

/// The model/pricing manifest, keyed by provider name.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PricingManifest {
    #[serde(default)]
    pub models: HashMap<String, Vec<ModelEntry>>,
}

impl PricingManifest {
    pub fn from_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Manifest loaded once per process: `PRICING_MANIFEST_PATH` when set, the
/// bundled table otherwise.
pub static MANIFEST: Lazy<PricingManifest> = Lazy::new(|| {
    if let Ok(path) = std::env::var("PRICING_MANIFEST_PATH") {
        match std::fs::read_to_string(&path).map_err(anyhow::Error::from).and_then(|raw| {
            PricingManifest::from_str(&raw).map_err(anyhow::Error::from)
        }) {
            Ok(manifest) => return manifest,
            Err(e) => {
                tracing::warn!(%path, error = %e, "failed to load pricing manifest, using bundled table");
            }
        }
    }
    PricingManifest::from_str(include_str!("../pricing/models.json"))
        .expect("bundled pricing manifest is valid")
});

static VERSION_DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-\d{4}(-\d{2}-\d{2})?$").expect("version date regex"));
static VERSION_LONG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-\d{6,8}$").expect("version long regex"));

/// Strip a trailing version suffix (`-MMDD`, `-YYYY-MM-DD`, `-YYMMDD`,
/// `-YYYYMMDD`). Returns the name unchanged when no pattern matches.
pub fn extract_base_model(model_name: &str) -> String {
    let stripped = VERSION_DATE_RE.replace(model_name, "");
    if stripped != model_name {
        return stripped.into_owned();
    }
    VERSION_LONG_RE.replace(model_name, "").into_owned()
}

/// Resolve pricing for a model name.
///
/// Lookup chain: provider-scoped (when given) then global; case-insensitive
/// exact id match; case-insensitive alias match; one recursion on the
/// version-stripped base name.
pub fn find_model_pricing<'a>(
    manifest: &'a PricingManifest,
    model_name: &str,
    provider: Option<&str>,
) -> Option<&'a Pricing> {
    let lowered = model_name.to_lowercase();

    let scope: Vec<(&String, &Vec<ModelEntry>)> = match provider {
        Some(p) if manifest.models.contains_key(p) => {
            vec![(manifest.models.get_key_value(p).unwrap().0, &manifest.models[p])]
        }
        _ => manifest.models.iter().collect(),
    };

    for (prov, models) in &scope {
        for model in models.iter() {
            if model.id.to_lowercase() == lowered {
                tracing::debug!(model = %model_name, provider = %prov, "pricing resolved by exact id");
                return model.pricing.as_ref();
            }
            if model
                .alias
                .iter()
                .any(|alias| alias.to_lowercase() == lowered)
            {
                tracing::debug!(model = %model_name, provider = %prov, "pricing resolved by alias");
                return model.pricing.as_ref();
            }
        }
    }

    let base = extract_base_model(model_name);
    if base != model_name {
        let pricing = find_model_pricing(manifest, &base, provider);
        if pricing.is_some() {
            tracing::warn!(
                model = %model_name,
                base = %base,
                "using base model pricing for snapshot version"
            );
            return pricing;
        }
    }

    tracing::warn!(model = %model_name, ?provider, "no pricing found for model");
    None
}

/// Cumulative tiered cost: each tier's rate applies to the tokens that fall
/// within its range.
pub fn calculate_tiered_cost(tokens: u64, tiers: &[PriceTier]) -> f64 {
    if tokens == 0 {
        return 0.0;
    }

    let mut total = 0.0;
    let mut remaining = tokens;
    let mut previous_max: u64 = 0;

    for tier in tiers {
        let tier_tokens = match tier.max_tokens {
            None => remaining,
            Some(max) => remaining.min(max.saturating_sub(previous_max)),
        };
        if tier_tokens == 0 {
            break;
        }
        total += tier_tokens as f64 / PER_MILLION * tier.rate;
        remaining -= tier_tokens;
        if let Some(max) = tier.max_tokens {
            previous_max = max;
        }
        if remaining == 0 {
            break;
        }
    }

    total
}

/// First matrix entry whose input and output bounds are both satisfied.
/// `null` bounds mean unbounded.
pub fn find_2d_rates<'a>(
    input_tokens: u64,
    output_tokens: u64,
    matrix: &'a [MatrixEntry],
) -> Option<&'a MatrixEntry> {
    matrix.iter().find(|entry| {
        entry.input_max.map_or(true, |max| input_tokens <= max)
            && entry.output_max.map_or(true, |max| output_tokens <= max)
    })
}

/// Input cost split into (regular, cached). `tokens` includes cached tokens.
pub fn input_cost(
    tokens: u64,
    pricing: &Pricing,
    cached_tokens: u64,
    output_tokens: u64,
) -> (f64, f64) {
    let regular_tokens = tokens.saturating_sub(cached_tokens);

    if pricing.is_2d_matrix() {
        let matrix = pricing.matrix.as_deref().unwrap_or_default();
        let Some(rates) = find_2d_rates(tokens, output_tokens, matrix) else {
            return (0.0, 0.0);
        };
        let regular = regular_tokens as f64 / PER_MILLION * rates.input;
        let cached = cached_tokens as f64 / PER_MILLION * rates.cached_input;
        return (regular, cached);
    }

    let regular = if regular_tokens == 0 {
        0.0
    } else if let Some(tiers) = &pricing.input_tiers {
        calculate_tiered_cost(regular_tokens, tiers)
    } else if let Some(rate) = pricing.input {
        regular_tokens as f64 / PER_MILLION * rate
    } else {
        0.0
    };

    // Cache-hit rate precedence: cache_hit, then pricing-level cached_input,
    // then the applicable tier's cached_input. Models without any cache rate
    // get no cache discount line at all.
    let cached = if cached_tokens == 0 {
        0.0
    } else if let Some(rate) = pricing.cache_hit {
        cached_tokens as f64 / PER_MILLION * rate
    } else if let Some(rate) = pricing.cached_input {
        cached_tokens as f64 / PER_MILLION * rate
    } else if let Some(tiers) = &pricing.input_tiers {
        let tier_rate = tiers
            .iter()
            .find(|tier| tier.max_tokens.map_or(true, |max| tokens <= max))
            .and_then(|tier| tier.cached_input);
        match tier_rate {
            Some(rate) => cached_tokens as f64 / PER_MILLION * rate,
            None => 0.0,
        }
    } else {
        0.0
    };

    (regular, cached)
}

/// Output cost across flat, tiered, input-dependent and 2D-matrix modes.
pub fn output_cost(tokens: u64, pricing: &Pricing, input_tokens: u64) -> f64 {
    if tokens == 0 {
        return 0.0;
    }

    if pricing.is_2d_matrix() {
        let matrix = pricing.matrix.as_deref().unwrap_or_default();
        return match find_2d_rates(input_tokens, tokens, matrix) {
            Some(rates) => tokens as f64 / PER_MILLION * rates.output,
            None => 0.0,
        };
    }

    if pricing.is_input_dependent() {
        // The tier is selected by the INPUT token count; its rate applies to
        // every output token, untiered.
        let tiers = pricing.output_tiers.as_deref().unwrap_or_default();
        let rate = tiers
            .iter()
            .find(|tier| tier.max_tokens.map_or(true, |max| input_tokens <= max))
            .or_else(|| tiers.last())
            .map(|tier| tier.rate)
            .unwrap_or(0.0);
        return tokens as f64 / PER_MILLION * rate;
    }

    if let Some(tiers) = &pricing.output_tiers {
        return calculate_tiered_cost(tokens, tiers);
    }
    if let Some(rate) = pricing.output {
        return tokens as f64 / PER_MILLION * rate;
    }
    0.0
}

fn cache_storage_cost(storage_tokens: u64, pricing: &Pricing) -> f64 {
    match pricing.cache_storage {
        Some(rate) if storage_tokens > 0 => storage_tokens as f64 / PER_MILLION * rate,
        _ => 0.0,
    }
}

fn cache_creation_cost(cache_5m: u64, cache_1h: u64, pricing: &Pricing) -> (f64, f64) {
    let five = match pricing.cache_5m {
        Some(rate) if cache_5m > 0 => cache_5m as f64 / PER_MILLION * rate,
        _ => 0.0,
    };
    let hour = match pricing.cache_1h {
        Some(rate) if cache_1h > 0 => cache_1h as f64 / PER_MILLION * rate,
        _ => 0.0,
    };
    (five, hour)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CostLine {
    pub tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct CostBreakdown {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<CostLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_input: Option<CostLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_storage: Option<CostLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_5m_creation: Option<CostLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_1h_creation: Option<CostLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<CostLine>,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UsageAmounts {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub cache_storage_tokens: u64,
    pub cache_5m_tokens: u64,
    pub cache_1h_tokens: u64,
}

/// Full cost breakdown for one usage record against one pricing entry.
pub fn calculate_total_cost(usage: UsageAmounts, pricing: &Pricing) -> CostBreakdown {
    let mut breakdown = CostBreakdown::default();
    let mut total = 0.0;

    let (regular_cost, cached_cost) = input_cost(
        usage.input_tokens,
        pricing,
        usage.cached_tokens,
        usage.output_tokens,
    );
    if regular_cost > 0.0 {
        breakdown.input = Some(CostLine {
            tokens: usage.input_tokens.saturating_sub(usage.cached_tokens),
            cost: regular_cost,
        });
        total += regular_cost;
    }
    if cached_cost > 0.0 {
        breakdown.cached_input = Some(CostLine {
            tokens: usage.cached_tokens,
            cost: cached_cost,
        });
        total += cached_cost;
    }

    let storage = cache_storage_cost(usage.cache_storage_tokens, pricing);
    if storage > 0.0 {
        breakdown.cache_storage = Some(CostLine {
            tokens: usage.cache_storage_tokens,
            cost: storage,
        });
        total += storage;
    }

    let (five, hour) = cache_creation_cost(usage.cache_5m_tokens, usage.cache_1h_tokens, pricing);
    if five > 0.0 {
        breakdown.cache_5m_creation = Some(CostLine {
            tokens: usage.cache_5m_tokens,
            cost: five,
        });
        total += five;
    }
    if hour > 0.0 {
        breakdown.cache_1h_creation = Some(CostLine {
            tokens: usage.cache_1h_tokens,
            cost: hour,
        });
        total += hour;
    }

    let out = output_cost(usage.output_tokens, pricing, usage.input_tokens);
    if out > 0.0 {
        breakdown.output = Some(CostLine {
            tokens: usage.output_tokens,
            cost: out,
        });
        total += out;
    }

    breakdown.total_cost = total;
    breakdown
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn approx(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn version_suffixes_strip_to_base_model() {
        assert_eq!(extract_base_model("gpt-5-0905"), "gpt-5");
        assert_eq!(extract_base_model("gpt-5-2025-08-07"), "gpt-5");
        assert_eq!(extract_base_model("claude-opus-4-1-20250805"), "claude-opus-4-1");
        assert_eq!(extract_base_model("doubao-seed-1-6-250615"), "doubao-seed-1-6");
        assert_eq!(extract_base_model("minimax-m2"), "minimax-m2");
    }

    fn manifest() -> PricingManifest {
        serde_json::from_value(json!({
            "models": {
                "openai": [
                    {"id": "gpt-5", "alias": ["gpt-5-latest"], "pricing": {"input": 1.25, "output": 10.0, "cached_input": 0.125}}
                ],
                "minimax": [
                    {"id": "minimax-m2", "pricing": {"input": 0.30, "output": 1.20}}
                ]
            }
        }))
        .unwrap()
    }

    #[test]
    fn pricing_lookup_matches_id_alias_and_version_fallback() {
        let m = manifest();
        assert!(find_model_pricing(&m, "gpt-5", None).is_some());
        // Case-insensitive id and alias matches.
        assert!(find_model_pricing(&m, "MiniMax-M2", Some("minimax")).is_some());
        assert!(find_model_pricing(&m, "GPT-5-LATEST", None).is_some());
        // Snapshot version falls back to the base model's pricing.
        let base = find_model_pricing(&m, "gpt-5", None).unwrap();
        let snap = find_model_pricing(&m, "gpt-5-20250101", None).unwrap();
        assert_eq!(base.input, snap.input);
        assert!(find_model_pricing(&m, "unknown-model", None).is_none());
    }

    #[test]
    fn tiered_cost_accumulates_across_thresholds() {
        let tiers: Vec<PriceTier> = serde_json::from_value(json!([
            {"max_tokens": 32000, "rate": 0.80},
            {"max_tokens": 128000, "rate": 1.20},
            {"max_tokens": null, "rate": 2.40}
        ]))
        .unwrap();

        // 32k at 0.80 plus 18k at 1.20.
        approx(calculate_tiered_cost(50_000, &tiers), 0.0256 + 0.0216);
        approx(calculate_tiered_cost(0, &tiers), 0.0);
        // Beyond the last bounded tier the unbounded rate applies.
        approx(
            calculate_tiered_cost(150_000, &tiers),
            32_000.0 / 1e6 * 0.80 + 96_000.0 / 1e6 * 1.20 + 22_000.0 / 1e6 * 2.40,
        );
    }

    #[test]
    fn two_d_matrix_selects_first_satisfied_entry() {
        let pricing: Pricing = serde_json::from_value(json!({
            "pricing_mode": "2d_matrix",
            "matrix": [
                {"input_max": 32000, "output_max": 200, "input": 0.29, "output": 1.14, "cached_input": 0.057},
                {"input_max": 32000, "output_max": null, "input": 0.43, "output": 2.00, "cached_input": 0.086},
                {"input_max": null, "output_max": null, "input": 0.57, "output": 2.29, "cached_input": 0.11}
            ]
        }))
        .unwrap();

        // input=20000, output=100 -> entry 1
        let (regular, _) = input_cost(20_000, &pricing, 0, 100);
        approx(regular, 20_000.0 / 1e6 * 0.29);
        approx(output_cost(100, &pricing, 20_000), 100.0 / 1e6 * 1.14);

        // input=20000, output=500 -> entry 2
        let (regular, _) = input_cost(20_000, &pricing, 0, 500);
        approx(regular, 20_000.0 / 1e6 * 0.43);
        approx(output_cost(500, &pricing, 20_000), 500.0 / 1e6 * 2.00);

        // input=50000, output=100 -> entry 3
        let (regular, _) = input_cost(50_000, &pricing, 0, 100);
        approx(regular, 50_000.0 / 1e6 * 0.57);
        approx(output_cost(100, &pricing, 50_000), 100.0 / 1e6 * 2.29);
    }

    #[test]
    fn input_dependent_output_uses_the_input_tier_rate_untiered() {
        let pricing: Pricing = serde_json::from_value(json!({
            "output_pricing_mode": "input_dependent",
            "output_tiers": [
                {"max_tokens": 32000, "rate": 1.14},
                {"max_tokens": 128000, "rate": 1.71},
                {"max_tokens": null, "rate": 2.29}
            ]
        }))
        .unwrap();

        // Input of 50k lands in the 32k-128k tier; its rate covers all output.
        approx(output_cost(10_000, &pricing, 50_000), 10_000.0 / 1e6 * 1.71);
        approx(output_cost(10_000, &pricing, 500_000), 10_000.0 / 1e6 * 2.29);
        approx(output_cost(10_000, &pricing, 1_000), 10_000.0 / 1e6 * 1.14);
    }

    #[test]
    fn cache_rate_precedence_and_absence() {
        // cache_hit wins over cached_input.
        let pricing: Pricing = serde_json::from_value(json!({
            "input": 1.0, "cache_hit": 0.1, "cached_input": 0.5
        }))
        .unwrap();
        let (_, cached) = input_cost(10_000, &pricing, 4_000, 0);
        approx(cached, 4_000.0 / 1e6 * 0.1);

        // Per-tier cached_input is selected by total input tokens.
        let pricing: Pricing = serde_json::from_value(json!({
            "input_tiers": [
                {"max_tokens": 32000, "rate": 0.8, "cached_input": 0.16},
                {"max_tokens": null, "rate": 1.2, "cached_input": 0.24}
            ]
        }))
        .unwrap();
        let (_, cached) = input_cost(40_000, &pricing, 5_000, 0);
        approx(cached, 5_000.0 / 1e6 * 0.24);

        // No cache pricing defined: cached tokens carry no cache line.
        let pricing: Pricing = serde_json::from_value(json!({"input": 1.0})).unwrap();
        let (_, cached) = input_cost(10_000, &pricing, 4_000, 0);
        approx(cached, 0.0);
    }

    #[test]
    fn total_cost_breakdown_includes_cache_creation() {
        let pricing: Pricing = serde_json::from_value(json!({
            "input": 3.0, "output": 15.0, "cached_input": 0.3,
            "cache_5m": 3.75, "cache_1h": 6.0
        }))
        .unwrap();

        let usage = UsageAmounts {
            input_tokens: 100_000,
            output_tokens: 5_000,
            cached_tokens: 40_000,
            cache_5m_tokens: 10_000,
            cache_1h_tokens: 2_000,
            ..Default::default()
        };
        let breakdown = calculate_total_cost(usage, &pricing);

        approx(breakdown.input.as_ref().unwrap().cost, 60_000.0 / 1e6 * 3.0);
        approx(breakdown.cached_input.as_ref().unwrap().cost, 40_000.0 / 1e6 * 0.3);
        approx(breakdown.cache_5m_creation.as_ref().unwrap().cost, 10_000.0 / 1e6 * 3.75);
        approx(breakdown.cache_1h_creation.as_ref().unwrap().cost, 2_000.0 / 1e6 * 6.0);
        approx(breakdown.output.as_ref().unwrap().cost, 5_000.0 / 1e6 * 15.0);

        let sum = breakdown.input.as_ref().unwrap().cost
            + breakdown.cached_input.as_ref().unwrap().cost
            + breakdown.cache_5m_creation.as_ref().unwrap().cost
            + breakdown.cache_1h_creation.as_ref().unwrap().cost
            + breakdown.output.as_ref().unwrap().cost;
        approx(breakdown.total_cost, sum);
    }

    #[test]
    fn bundled_manifest_parses() {
        assert!(!MANIFEST.models.is_empty());
    }
}
