//! Property-based tests for the sub-ledger engine.
//!
//! These tests verify invariants hold for arbitrary inputs using proptest.
//!
//! Run with: cargo test --test `property_tests`

use dynamic_subledger::{
    build_plan, evaluate, extract_fields, resolve, try_evaluate, AccountKind, OverlapPolicy,
    PlanOptions,
};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

// ============================================================================
// Arbitrary generators
// ============================================================================

fn arb_field_name() -> impl Strategy<Value = String> {
    "[a-zA-Z_][a-zA-Z0-9_]{0,12}"
}

fn arb_field_list() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(arb_field_name(), 0..8)
}

fn arb_separator() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(" + ".to_string()),
        Just(" * ".to_string()),
        Just("_".to_string()),
        Just("".to_string()),
        Just("300".to_string()),
    ]
}

fn arb_policy() -> impl Strategy<Value = OverlapPolicy> {
    prop_oneof![
        Just(OverlapPolicy::Passthrough),
        Just(OverlapPolicy::Summed),
        Just(OverlapPolicy::Both),
    ]
}

fn dedup(names: &[String]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for name in names {
        if !seen.contains(name) {
            seen.push(name.clone());
        }
    }
    seen
}

fn template_of(names: &[String], separator: &str) -> String {
    names
        .iter()
        .map(|n| format!("[{}]", n))
        .collect::<Vec<_>>()
        .join(separator)
}

// ============================================================================
// Field extraction
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Re-injecting the extracted names yields the same list
    #[test]
    fn prop_extract_idempotent(template in ".{0,64}") {
        let first = extract_fields(&template);
        let reinjected = template_of(&first, " ");
        prop_assert_eq!(extract_fields(&reinjected), first);
    }

    /// Names come back in first-appearance order without duplicates
    #[test]
    fn prop_extract_order_preserving(names in arb_field_list(), sep in arb_separator()) {
        let template = template_of(&names, &sep);
        prop_assert_eq!(extract_fields(&template), dedup(&names));
    }

    /// Extracted names never contain brackets and are never empty
    #[test]
    fn prop_extract_names_are_clean(template in "[\\[\\]a-z ]{0,40}") {
        for name in extract_fields(&template) {
            prop_assert!(!name.is_empty());
            prop_assert!(!name.contains('['));
            prop_assert!(!name.contains(']'));
        }
    }
}

// ============================================================================
// Evaluation
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Arbitrary text never panics and always yields a finite number
    #[test]
    fn prop_evaluate_total(formula in ".{0,80}") {
        let row = Map::new();
        let _ = try_evaluate(&formula, &row);
        prop_assert!(evaluate(&formula, &row).is_finite());
    }

    /// Integer arithmetic over fields matches Rust arithmetic
    #[test]
    fn prop_field_arithmetic(a in -100_000i64..100_000, b in -100_000i64..100_000) {
        let mut row = Map::new();
        row.insert("a".to_string(), json!(a));
        row.insert("b".to_string(), json!(b));

        prop_assert_eq!(evaluate("[a] + [b]", &row), (a + b) as f64);
        prop_assert_eq!(evaluate("[a] - [b] * 2", &row), (a - b * 2) as f64);
        prop_assert_eq!(evaluate("[a] * -1", &row), -(a as f64));
        prop_assert_eq!(evaluate("ABS([a])", &row), a.abs() as f64);
    }

    /// Fields missing from the row count as zero
    #[test]
    fn prop_missing_fields_are_zero(name in arb_field_name(), k in -1000i64..1000) {
        let row: Map<String, Value> = Map::new();
        let formula = format!("[{}] + {}", name, k.abs());
        prop_assert_eq!(evaluate(&formula, &row), k.abs() as f64);
    }
}

// ============================================================================
// Accounts and plans
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Templates without field references resolve to themselves
    #[test]
    fn prop_static_account_unchanged(template in "[A-Z0-9_\\-]{1,20}") {
        let resolved = resolve(&template, &Map::new());
        prop_assert_eq!(resolved.kind, AccountKind::Static);
        prop_assert_eq!(resolved.account, template);
    }

    /// Summed and passthrough outputs never intersect, and base fields are never summed
    #[test]
    fn prop_plan_sets_disjoint(
        formula_fields in arb_field_list(),
        account_fields in arb_field_list(),
        overlap in arb_policy(),
    ) {
        let options = PlanOptions { overlap, ..PlanOptions::default() };
        let mut formula_fields = formula_fields;
        formula_fields.push("eagleEntityId".to_string());
        formula_fields.push("account".to_string());

        let plan = build_plan("t", "", &dedup(&formula_fields), &dedup(&account_fields), &options);

        for summed in &plan.summed {
            prop_assert!(plan.passthrough.iter().all(|p| p.output != summed.output));
        }
        prop_assert!(!plan.is_summed("eagleEntityId"));
        prop_assert!(!plan.is_summed("account"));
        prop_assert!(!plan.is_summed("valuationDt"));
        prop_assert_eq!(&plan.passthrough[0].field, "eagleEntityId");
    }
}
