use agenthost::pricing::{
    calculate_total_cost, find_model_pricing, input_cost, output_cost, UsageAmounts, MANIFEST,
};

fn approx(a: f64, b: f64) {
    assert!((a - b).abs() < 1e-9, "{a} != {b}");
}

#[test]
fn glm_matrix_rates_follow_both_dimensions() {
    let pricing = find_model_pricing(&MANIFEST, "glm-4.6", Some("zhipu")).expect("glm pricing");

    // Small input, short output: the first matrix entry.
    let (regular, _) = input_cost(20_000, pricing, 0, 100);
    approx(regular, 20_000.0 / 1e6 * 0.29);
    approx(output_cost(100, pricing, 20_000), 100.0 / 1e6 * 1.14);

    // Same input, longer output drops to the second entry.
    let (regular, _) = input_cost(20_000, pricing, 0, 500);
    approx(regular, 20_000.0 / 1e6 * 0.43);
    approx(output_cost(500, pricing, 20_000), 500.0 / 1e6 * 2.00);

    // Large input lands in the unbounded entry regardless of output.
    let (regular, _) = input_cost(50_000, pricing, 0, 100);
    approx(regular, 50_000.0 / 1e6 * 0.57);
    approx(output_cost(100, pricing, 50_000), 100.0 / 1e6 * 2.29);
}

#[test]
fn version_snapshots_inherit_base_model_pricing() {
    let base = find_model_pricing(&MANIFEST, "claude-sonnet-4-5", None).expect("base pricing");

    for versioned in [
        "claude-sonnet-4-5-20250929",
        "CLAUDE-SONNET-4-5-20250929",
        "gpt-5-2025-08-07",
        "gpt-5-0905",
        "doubao-seed-1-6-250615",
    ] {
        assert!(
            find_model_pricing(&MANIFEST, versioned, None).is_some(),
            "no pricing resolved for {versioned}"
        );
    }

    let snap = find_model_pricing(&MANIFEST, "claude-sonnet-4-5-20250929", None).unwrap();
    assert_eq!(base.input, snap.input);
    assert_eq!(base.output, snap.output);
}

#[test]
fn doubao_output_rate_depends_on_input_tier() {
    let pricing =
        find_model_pricing(&MANIFEST, "doubao-seed-1-6", Some("volcengine")).expect("pricing");

    // All output priced at the rate of the tier the INPUT falls into.
    approx(output_cost(10_000, pricing, 10_000), 10_000.0 / 1e6 * 1.14);
    approx(output_cost(10_000, pricing, 64_000), 10_000.0 / 1e6 * 1.71);
    approx(output_cost(10_000, pricing, 500_000), 10_000.0 / 1e6 * 2.29);
}

#[test]
fn anthropic_cache_creation_shows_in_the_breakdown() {
    let pricing = find_model_pricing(&MANIFEST, "claude-sonnet-4-5", None).expect("pricing");

    let usage = UsageAmounts {
        input_tokens: 200_000,
        output_tokens: 8_000,
        cached_tokens: 150_000,
        cache_5m_tokens: 20_000,
        cache_1h_tokens: 5_000,
        ..Default::default()
    };

    let breakdown = calculate_total_cost(usage, pricing);
    assert!(breakdown.cached_input.is_some());
    assert!(breakdown.cache_5m_creation.is_some());
    assert!(breakdown.cache_1h_creation.is_some());

    let total: f64 = [
        &breakdown.input,
        &breakdown.cached_input,
        &breakdown.cache_5m_creation,
        &breakdown.cache_1h_creation,
        &breakdown.output,
    ]
    .iter()
    .filter_map(|line| line.as_ref().map(|l| l.cost))
    .sum();
    approx(breakdown.total_cost, total);
}

#[test]
fn unknown_models_have_no_pricing() {
    assert!(find_model_pricing(&MANIFEST, "definitely-not-a-model", None).is_none());
}
