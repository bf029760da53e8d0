//! Integration tests for the scheduled return processor
//!
//! 1. One tick catches up every missed cycle of every due investment
//! 2. Paused and not-yet-due investments are left alone
//! 3. Investments leased to another worker are skipped until the lease lapses
//! 4. A raised shutdown flag stops the tick before the next batch
//! 5. Re-running a tick with nothing due changes nothing
//! 6. A failing investment is logged and skipped; the rest of the tick goes on

use chrono::Duration;
use ledger_core::{
    catalog::PlanSpec,
    clock::{Clock, ManualClock},
    config::EngineConfig,
    engine::LedgerEngine,
    error::LedgerError,
    ledger::TransactionFilter,
    types::{CapitalBackBasis, InterestType, InvestmentStatus, Timestamp, TransactionType},
};
use rusqlite::Connection;
use rust_decimal::Decimal;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

fn build() -> (LedgerEngine, Arc<ManualClock>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = LedgerEngine::test_clock();
    let engine = LedgerEngine::build_test(Arc::clone(&clock)).expect("build_test failed");
    (engine, clock)
}

fn d(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn daily(repeat: u32) -> PlanSpec {
    PlanSpec {
        name:               format!("daily-{repeat}"),
        minimum:            d("10"),
        maximum:            d("10000"),
        interest_rate:      d("1"),
        interest_type:      InterestType::Simple,
        cycle_secs:         86_400,
        capital_back:       true,
        capital_back_basis: CapitalBackBasis::Principal,
        hold_capital:       false,
        lifetime:           false,
        repeat_count:       Some(repeat),
    }
}

/// Fund `users` and open one 100.00 investment each. Returns investment ids.
fn open_many(engine: &LedgerEngine, plan_id: &str, users: usize) -> Vec<String> {
    (0..users)
        .map(|i| {
            let user = format!("user-{i}");
            engine.deposit(&user, d("100"), &format!("dep-{i}")).unwrap();
            engine.open_investment(&user, plan_id, d("100")).unwrap().investment_id
        })
        .collect()
}

fn credits_for(engine: &LedgerEngine, user: &str) -> usize {
    engine
        .list_for_user(user, TransactionFilter::of_type(TransactionType::ReturnCredit))
        .count()
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: catch-up
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn tick_catches_up_missed_cycles() {
    let (engine, clock) = build();
    let plan = engine.create_plan(daily(10)).unwrap();
    let ids = open_many(&engine, &plan.plan_id, 3);

    clock.advance(Duration::days(3));
    let report = engine.tick().unwrap();

    assert_eq!(report.credited, 9);
    assert_eq!(report.replayed, 0);
    assert!(report.failed.is_empty());
    assert_eq!(report.batches, 3);
    for (i, id) in ids.iter().enumerate() {
        let inv = engine.lifecycle().get(id).unwrap();
        assert_eq!(inv.cycles_completed, 3);
        assert_eq!(inv.next_due_at, clock.now() + Duration::days(1));
        assert_eq!(credits_for(&engine, &format!("user-{i}")), 3);
    }
    assert_eq!(engine.store.due_count(clock.now()).unwrap(), 0);
}

#[test]
fn tick_matures_exhausted_investments() {
    let (engine, clock) = build();
    let plan = engine.create_plan(daily(2)).unwrap();
    let ids = open_many(&engine, &plan.plan_id, 2);

    clock.advance(Duration::days(5));
    let report = engine.tick().unwrap();

    assert_eq!(report.credited, 4);
    assert_eq!(report.matured, 2);
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(engine.lifecycle().get(id).unwrap().status, InvestmentStatus::Matured);
        assert_eq!(engine.compute_balance(&format!("user-{i}")).unwrap(), d("102"));
    }
}

#[test]
fn batches_are_bounded() {
    let (engine, clock) = build();
    assert_eq!(engine.config.batch_size, 10);
    let plan = engine.create_plan(daily(10)).unwrap();
    open_many(&engine, &plan.plan_id, 25);

    clock.advance(Duration::days(1));
    let report = engine.tick().unwrap();

    assert_eq!(report.claimed, 25);
    assert_eq!(report.credited, 25);
    assert_eq!(report.batches, 3);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: not everything is due
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn paused_and_future_investments_are_not_touched() {
    let (engine, clock) = build();
    let plan = engine.create_plan(daily(10)).unwrap();
    let ids = open_many(&engine, &plan.plan_id, 2);
    engine.lifecycle().pause(&ids[0]).unwrap();

    clock.advance(Duration::days(1));
    engine.deposit("late", d("100"), "dep-late").unwrap();
    let late = engine.open_investment("late", &plan.plan_id, d("100")).unwrap();

    let report = engine.tick().unwrap();
    assert_eq!(report.credited, 1);
    assert_eq!(credits_for(&engine, "user-0"), 0);
    assert_eq!(credits_for(&engine, "user-1"), 1);
    assert_eq!(engine.lifecycle().get(&late.investment_id).unwrap().cycles_completed, 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: leases
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn leased_investments_wait_for_the_lease() {
    let (engine, clock) = build();
    let plan = engine.create_plan(daily(10)).unwrap();
    open_many(&engine, &plan.plan_id, 2);
    clock.advance(Duration::days(1));

    let now = clock.now();
    let held = engine
        .store
        .claim_due_batch("other-worker:lease", now, now + Duration::seconds(engine.config.lease_secs), 100)
        .unwrap();
    assert_eq!(held.len(), 2);

    let report = engine.tick().unwrap();
    assert_eq!(report.claimed, 0);
    assert_eq!(report.credited, 0);

    // The other worker vanished; its lease lapses.
    clock.advance(Duration::seconds(engine.config.lease_secs));
    let report = engine.tick().unwrap();
    assert_eq!(report.credited, 2);
}

#[test]
fn tick_leaves_no_claims_behind() {
    let (engine, clock) = build();
    let plan = engine.create_plan(daily(10)).unwrap();
    open_many(&engine, &plan.plan_id, 3);
    clock.advance(Duration::days(1));
    engine.tick().unwrap();

    clock.advance(Duration::days(1));
    let now = clock.now();
    let next = engine
        .store
        .claim_due_batch("observer", now, now + Duration::seconds(60), 100)
        .unwrap();
    assert_eq!(next.len(), 3, "every investment is claimable again");
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: shutdown
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn shutdown_flag_stops_the_tick() {
    let (engine, clock) = build();
    let plan = engine.create_plan(daily(10)).unwrap();
    open_many(&engine, &plan.plan_id, 3);
    clock.advance(Duration::days(1));

    let processor = engine.processor();
    processor.shutdown_handle().store(true, Ordering::SeqCst);
    let report = processor.tick().unwrap();

    assert!(report.stopped_early);
    assert_eq!(report.credited, 0);
    assert_eq!(engine.store.due_count(clock.now()).unwrap(), 3);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: idle ticks
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn idle_tick_writes_nothing() {
    let (engine, clock) = build();
    let plan = engine.create_plan(daily(10)).unwrap();
    open_many(&engine, &plan.plan_id, 2);
    clock.advance(Duration::days(1));
    engine.tick().unwrap();

    let rows_before = engine.store.transaction_count().unwrap();
    let report = engine.tick().unwrap();
    assert_eq!(report.claimed, 0);
    assert_eq!(report.batches, 0);
    assert_eq!(engine.store.transaction_count().unwrap(), rows_before);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: failures
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn overflowing_return_is_skipped_and_the_engine_stays_usable() {
    let (engine, clock) = build();
    let doubling = engine
        .create_plan(PlanSpec {
            name:          "doubling".into(),
            interest_rate: d("100"),
            interest_type: InterestType::Compounding,
            cycle_secs:    3_600,
            capital_back:  false,
            lifetime:      true,
            repeat_count:  None,
            ..daily(1)
        })
        .unwrap();
    let steady = engine
        .create_plan(PlanSpec {
            name:          "steady".into(),
            cycle_secs:    3_600,
            capital_back:  false,
            lifetime:      true,
            repeat_count:  None,
            ..daily(1)
        })
        .unwrap();
    engine.deposit("alice", d("1000"), "dep-alice").unwrap();
    let runaway = engine.open_investment("alice", &doubling.plan_id, d("1000")).unwrap();
    engine.deposit("bob", d("100"), "dep-bob").unwrap();
    engine.open_investment("bob", &steady.plan_id, d("100")).unwrap();

    let mut failing_tick = None;
    for _ in 0..200 {
        clock.advance(Duration::hours(1));
        let report = engine.tick().unwrap();
        if !report.failed.is_empty() {
            failing_tick = Some(report);
            break;
        }
    }
    let report = failing_tick.expect("the doubling base leaves the money range");

    assert_eq!(report.failed.len(), 1);
    let failure = &report.failed[0];
    assert_eq!(failure.investment_id, runaway.investment_id);
    assert_eq!(failure.attempts, 1, "not retryable");
    assert!(failure.error.contains("overflows"), "{}", failure.error);
    assert_eq!(report.credited, 1, "the steady investment is still paid");

    let stuck = engine.lifecycle().get(&runaway.investment_id).unwrap();
    assert_eq!(stuck.cycles_completed, failure.cycle);
    assert!(stuck.cycles_completed > 50);
    assert_eq!(
        credits_for(&engine, "alice"),
        stuck.cycles_completed as usize,
        "no partial row from the failed cycle"
    );

    let err = engine.lifecycle().accrue(&runaway.investment_id).unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)), "got {err:?}");

    // The connection is not left inside an open transaction.
    engine.deposit("carol", d("5"), "dep-carol").unwrap();
    assert_eq!(engine.compute_balance("carol").unwrap(), d("5"));
}

/// Manual clock that takes the database write lock from a second
/// connection on the `lock_at`-th reading and drops it on the `unlock_at`-th.
/// One tick with a single due investment reads the clock for the report,
/// for the claim, then once per accrual attempt, then for the next claim.
struct ContendedClock {
    inner:     ManualClock,
    path:      String,
    reads:     AtomicUsize,
    lock_at:   usize,
    unlock_at: usize,
    holder:    Mutex<Option<Connection>>,
}

impl ContendedClock {
    fn arm(&self) {
        self.reads.store(0, Ordering::SeqCst);
    }
}

impl Clock for ContendedClock {
    fn now(&self) -> Timestamp {
        let read = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        let mut holder = self.holder.lock().unwrap();
        if read == self.lock_at {
            let conn = Connection::open(&self.path).unwrap();
            conn.execute_batch("BEGIN IMMEDIATE").unwrap();
            *holder = Some(conn);
        } else if read == self.unlock_at {
            // Dropping the connection rolls its transaction back.
            holder.take();
        }
        self.inner.now()
    }
}

#[test]
fn locked_database_is_retried_then_left_for_the_next_tick() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db").to_string_lossy().into_owned();
    let config = EngineConfig {
        storage_timeout_ms: 20,
        max_attempts:       3,
        ..EngineConfig::default_test()
    };

    let clock = LedgerEngine::test_clock();
    let engine = LedgerEngine::open(&path, config.clone(), clock.clone()).unwrap();
    let plan = engine.create_plan(daily(10)).unwrap();
    engine.deposit("alice", d("100"), "dep-1").unwrap();
    let inv = engine.open_investment("alice", &plan.plan_id, d("100")).unwrap();
    clock.advance(Duration::days(1));

    // Same file, same clock time, but this engine's clock takes the lock
    // right before the first accrual attempt.
    let contended = Arc::new(ContendedClock {
        inner:     ManualClock::new(clock.now()),
        path:      path.clone(),
        // Disarmed until `arm`, so opening the engine cannot trip it.
        reads:     AtomicUsize::new(usize::MAX / 2),
        lock_at:   3,
        unlock_at: 3 + config.max_attempts as usize,
        holder:    Mutex::new(None),
    });
    let worker = LedgerEngine::open(&path, config.clone(), contended.clone()).unwrap();
    contended.arm();
    let report = worker.tick().unwrap();

    assert_eq!(report.claimed, 1);
    assert_eq!(report.batches, 1, "the failed claim is held for the rest of the tick");
    assert_eq!(report.credited, 0);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].investment_id, inv.investment_id);
    assert_eq!(report.failed[0].cycle, 0);
    assert_eq!(report.failed[0].attempts, config.max_attempts);
    assert!(report.failed[0].error.contains("Transient"), "{}", report.failed[0].error);

    // Nothing was written and the investment is still due.
    assert_eq!(credits_for(&engine, "alice"), 0);
    assert_eq!(engine.store.due_count(clock.now()).unwrap(), 1);

    // Claims were handed back at the end of the tick.
    let report = engine.tick().unwrap();
    assert_eq!(report.credited, 1);
    assert!(report.failed.is_empty());
    assert_eq!(engine.lifecycle().get(&inv.investment_id).unwrap().cycles_completed, 1);
}
