//! Integration tests for concurrent workers on one database file
//!
//! Each worker owns its own connection, as separate scheduler processes
//! would. The ledger's unique idempotency keys are the only thing standing
//! between them and a double payout.
//!
//! 1. Many workers realising the same cycle produce exactly one credit
//! 2. Several processors ticking at once credit every cycle exactly once
//! 3. Racing opens against one wallet never overdraw it

use chrono::Duration;
use ledger_core::{
    catalog::PlanSpec,
    clock::{Clock, ManualClock},
    config::EngineConfig,
    engine::LedgerEngine,
    ledger::TransactionFilter,
    types::{CapitalBackBasis, InterestType, TransactionType},
};
use rust_decimal::Decimal;
use std::sync::{Arc, Barrier};
use std::thread;

const WORKERS: usize = 6;

fn config() -> EngineConfig {
    EngineConfig {
        storage_timeout_ms: 20_000,
        ..EngineConfig::default_test()
    }
}

fn d(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn daily(repeat: u32) -> PlanSpec {
    PlanSpec {
        name:               "daily".into(),
        minimum:            d("10"),
        maximum:            d("10000"),
        interest_rate:      d("1.5"),
        interest_type:      InterestType::Compounding,
        cycle_secs:         86_400,
        capital_back:       true,
        capital_back_basis: CapitalBackBasis::Principal,
        hold_capital:       false,
        lifetime:           false,
        repeat_count:       Some(repeat),
    }
}

/// A migrated database file plus the shared clock every worker reads.
fn setup() -> (tempfile::TempDir, String, Arc<ManualClock>, LedgerEngine) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ledger.db").to_string_lossy().into_owned();
    let clock = LedgerEngine::test_clock();
    let engine = LedgerEngine::open(&path, config(), clock.clone()).expect("open");
    (dir, path, clock, engine)
}

fn return_credits(engine: &LedgerEngine, user: &str) -> Vec<Decimal> {
    engine
        .list_for_user(user, TransactionFilter::of_type(TransactionType::ReturnCredit))
        .map(|r| r.unwrap().amount)
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: racing one cycle
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn racing_workers_credit_a_cycle_once() {
    let (_dir, path, clock, engine) = setup();
    let plan = engine.create_plan(daily(5)).unwrap();
    engine.deposit("alice", d("1000"), "dep-1").unwrap();
    let inv = engine.open_investment("alice", &plan.plan_id, d("1000")).unwrap();
    clock.advance(Duration::days(1));

    let barrier = Arc::new(Barrier::new(WORKERS));
    let handles: Vec<_> = (0..WORKERS)
        .map(|i| {
            let path = path.clone();
            let clock = clock.clone();
            let barrier = barrier.clone();
            let id = inv.investment_id.clone();
            thread::spawn(move || {
                let worker = LedgerEngine::open(&path, config(), clock)
                    .unwrap()
                    .with_worker_id(&format!("w{i}"));
                barrier.wait();
                worker.lifecycle().accrue_cycle(&id, 0).unwrap()
            })
        })
        .collect();

    let accruals: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let fresh = accruals.iter().filter(|a| !a.replayed).count();
    assert_eq!(fresh, 1, "exactly one worker writes the credit");
    let first_id = accruals[0].credit.id;
    assert!(accruals.iter().all(|a| a.credit.id == first_id));

    assert_eq!(return_credits(&engine, "alice"), vec![d("15")]);
    assert_eq!(engine.lifecycle().get(&inv.investment_id).unwrap().cycles_completed, 1);
    assert_eq!(engine.compute_balance("alice").unwrap(), d("15"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: racing processors
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn concurrent_processors_credit_each_cycle_once() {
    let (_dir, path, clock, engine) = setup();
    let plan = engine.create_plan(daily(10)).unwrap();
    let users: Vec<String> = (0..20).map(|i| format!("user-{i}")).collect();
    for (i, user) in users.iter().enumerate() {
        engine.deposit(user, d("500"), &format!("dep-{i}")).unwrap();
        engine.open_investment(user, &plan.plan_id, d("500")).unwrap();
    }
    clock.advance(Duration::days(2));

    let barrier = Arc::new(Barrier::new(WORKERS));
    let handles: Vec<_> = (0..WORKERS)
        .map(|i| {
            let path = path.clone();
            let clock = clock.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let worker = LedgerEngine::open(&path, config(), clock)
                    .unwrap()
                    .with_worker_id(&format!("proc-{i}"));
                barrier.wait();
                worker.tick().unwrap()
            })
        })
        .collect();

    let reports: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let credited: usize = reports.iter().map(|r| r.credited).sum();
    assert_eq!(credited, 40, "20 investments x 2 cycles, each credited once");
    assert!(reports.iter().all(|r| r.failed.is_empty()));

    for user in &users {
        assert_eq!(return_credits(&engine, user), vec![d("7.50"), d("7.61")], "{user}");
    }
    assert_eq!(engine.store.due_count(clock.now()).unwrap(), 0);
    assert!(engine.reconcile().unwrap().is_clean());
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: racing opens
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn racing_opens_never_overdraw() {
    let (_dir, path, clock, engine) = setup();
    let plan = engine.create_plan(daily(5)).unwrap();
    engine.deposit("alice", d("1000"), "dep-1").unwrap();

    let barrier = Arc::new(Barrier::new(WORKERS));
    let handles: Vec<_> = (0..WORKERS)
        .map(|_| {
            let path = path.clone();
            let clock = clock.clone();
            let barrier = barrier.clone();
            let plan_id = plan.plan_id.clone();
            thread::spawn(move || {
                let worker = LedgerEngine::open(&path, config(), clock).unwrap();
                barrier.wait();
                worker.open_investment("alice", &plan_id, d("300")).is_ok()
            })
        })
        .collect();

    let opened = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();

    assert_eq!(opened, 3);
    assert_eq!(engine.compute_balance("alice").unwrap(), d("100"));
}
