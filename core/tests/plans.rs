//! Integration tests for the plan catalog
//!
//! 1. Malformed terms are rejected before anything is stored
//! 2. Deactivated plans disappear from listings but still resolve
//! 3. Deactivated plans refuse new investments
//! 4. Terms freeze once an investment references the plan

use ledger_core::{
    catalog::PlanSpec,
    clock::Clock,
    engine::LedgerEngine,
    error::LedgerError,
    types::{CapitalBackBasis, InterestType},
};
use rust_decimal::Decimal;

fn build() -> LedgerEngine {
    LedgerEngine::build_test(LedgerEngine::test_clock()).expect("build_test failed")
}

fn d(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn daily_plan(name: &str) -> PlanSpec {
    PlanSpec {
        name:               name.to_string(),
        minimum:            d("100"),
        maximum:            d("5000"),
        interest_rate:      d("2"),
        interest_type:      InterestType::Simple,
        cycle_secs:         86_400,
        capital_back:       true,
        capital_back_basis: CapitalBackBasis::Principal,
        hold_capital:       false,
        lifetime:           false,
        repeat_count:       Some(5),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: validation
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn malformed_plans_are_rejected() {
    let engine = build();

    let cases = vec![
        PlanSpec { minimum: d("6000"), ..daily_plan("min-over-max") },
        PlanSpec { minimum: d("0"), ..daily_plan("zero-min") },
        PlanSpec { interest_rate: d("0"), ..daily_plan("zero-rate") },
        PlanSpec { cycle_secs: 0, ..daily_plan("zero-cycle") },
        PlanSpec { repeat_count: None, ..daily_plan("no-repeat") },
        PlanSpec { repeat_count: Some(0), ..daily_plan("zero-repeat") },
        PlanSpec { lifetime: true, ..daily_plan("lifetime-with-repeat") },
        PlanSpec { lifetime: true, repeat_count: None, ..daily_plan("lifetime-capital-back") },
        PlanSpec { minimum: d("100.001"), ..daily_plan("sub-cent-limit") },
        PlanSpec { name: "  ".into(), ..daily_plan("") },
    ];

    for spec in cases {
        let name = spec.name.clone();
        let err = engine.create_plan(spec).unwrap_err();
        assert!(
            matches!(err, LedgerError::Validation(_)),
            "plan '{name}' should fail validation, got {err:?}"
        );
    }
    assert!(engine.catalog().list_all_plans().unwrap().is_empty());
}

#[test]
fn valid_plan_round_trips() {
    let engine = build();
    let spec = PlanSpec {
        lifetime:     true,
        repeat_count: None,
        capital_back: false,
        ..daily_plan("lifetime-daily")
    };
    let plan = engine.create_plan(spec.clone()).unwrap();

    let loaded = engine.get_plan(&plan.plan_id).unwrap();
    assert_eq!(loaded.terms, spec);
    assert!(loaded.active);
    assert_eq!(loaded.created_at, engine.clock().now());
}

#[test]
fn trailing_zero_limits_are_accepted() {
    let engine = build();
    let spec = PlanSpec {
        minimum: d("100.000"),
        maximum: d("5000.0000"),
        ..daily_plan("padded-limits")
    };
    let plan = engine.create_plan(spec).unwrap();
    assert_eq!(plan.terms.minimum, d("100"));
    assert!(plan.accepts(d("100")));
    assert!(!plan.accepts(d("99.99")));
}

#[test]
fn unknown_plan_is_not_found() {
    let engine = build();
    let err = engine.get_plan("no-such-plan").unwrap_err();
    assert!(matches!(err, LedgerError::NotFound { entity: "plan", .. }));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2 + 3: soft deactivation
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn deactivated_plan_is_hidden_but_resolvable() {
    let engine = build();
    let keep = engine.create_plan(daily_plan("keep")).unwrap();
    let retire = engine.create_plan(daily_plan("retire")).unwrap();

    engine.catalog().deactivate_plan(&retire.plan_id).unwrap();

    let active: Vec<_> = engine
        .list_active_plans()
        .unwrap()
        .into_iter()
        .map(|p| p.plan_id)
        .collect();
    assert_eq!(active, vec![keep.plan_id.clone()]);

    let retired = engine.get_plan(&retire.plan_id).unwrap();
    assert!(!retired.active);
    assert_eq!(engine.catalog().list_all_plans().unwrap().len(), 2);

    engine.catalog().activate_plan(&retire.plan_id).unwrap();
    assert_eq!(engine.list_active_plans().unwrap().len(), 2);
}

#[test]
fn deactivated_plan_refuses_new_investments() {
    let engine = build();
    let plan = engine.create_plan(daily_plan("retire")).unwrap();
    engine.deposit("alice", d("1000"), "dep-1").unwrap();
    engine.catalog().deactivate_plan(&plan.plan_id).unwrap();

    let err = engine.open_investment("alice", &plan.plan_id, d("500")).unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)), "got {err:?}");
    assert_eq!(engine.compute_balance("alice").unwrap(), d("1000"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: term immutability
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn terms_can_change_only_while_unreferenced() {
    let engine = build();
    let plan = engine.create_plan(daily_plan("tuned")).unwrap();

    let updated = engine
        .catalog()
        .update_plan(&plan.plan_id, PlanSpec { interest_rate: d("3"), ..daily_plan("tuned") })
        .unwrap();
    assert_eq!(updated.terms.interest_rate, d("3"));

    engine.deposit("alice", d("1000"), "dep-1").unwrap();
    let inv = engine.open_investment("alice", &plan.plan_id, d("1000")).unwrap();
    assert_eq!(inv.interest_rate, d("3"));

    let err = engine
        .catalog()
        .update_plan(&plan.plan_id, PlanSpec { interest_rate: d("9"), ..daily_plan("tuned") })
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)), "got {err:?}");
    assert_eq!(engine.get_plan(&plan.plan_id).unwrap().terms.interest_rate, d("3"));
}

#[test]
fn plan_changes_are_recorded_as_events() {
    let engine = build();
    let plan = engine.create_plan(daily_plan("audited")).unwrap();
    engine.catalog().deactivate_plan(&plan.plan_id).unwrap();

    assert_eq!(engine.store.events_of_type("plan_created").unwrap().len(), 1);
    assert_eq!(engine.store.events_of_type("plan_activation_changed").unwrap().len(), 1);
}
