//! Engine facade, the one object the surrounding application holds.
//!
//! It owns the configuration, the store connection and the clock, and
//! hands out short-lived component views over them:
//!   - PlanCatalog       plan definitions
//!   - LifecycleManager  open / accrue / pause / resume / close
//!   - Ledger            append and list
//!   - BalanceService    derived balances and reconciliation
//!   - ReturnProcessor   the scheduled tick
//!
//! The engine keeps no timers. The scheduler calls `tick()`.

use crate::{
    balance::{BalanceService, ReconciliationReport},
    catalog::{Plan, PlanCatalog, PlanSpec},
    clock::{Clock, ManualClock},
    config::EngineConfig,
    error::{LedgerError, LedgerResult},
    keys,
    ledger::{Appended, Ledger, NewTransaction, TransactionCursor, TransactionFilter},
    lifecycle::{CloseOptions, Investment, LifecycleManager, OpenRequest},
    processor::{ReturnProcessor, TickReport},
    store::LedgerStore,
    types::{Money, TransactionType},
};
use chrono::{DateTime, Utc};
use std::sync::{atomic::AtomicBool, Arc};
use uuid::Uuid;

pub struct LedgerEngine {
    pub config: EngineConfig,
    pub store:  LedgerStore,
    clock:      Arc<dyn Clock>,
    worker_id:  String,
    shutdown:   Arc<AtomicBool>,
}

impl LedgerEngine {
    pub fn new(store: LedgerStore, config: EngineConfig, clock: Arc<dyn Clock>) -> LedgerResult<Self> {
        config.validate()?;
        store.set_busy_timeout(config.storage_timeout())?;
        let worker_id = format!("worker-{}", &Uuid::new_v4().to_string()[..8]);
        log::debug!(
            "engine[{worker_id}]: ready on {}",
            store.path().unwrap_or(":memory:")
        );
        Ok(Self {
            config,
            store,
            clock,
            worker_id,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Open (or create) the database at `path`, migrate it, and build an engine.
    pub fn open(path: &str, config: EngineConfig, clock: Arc<dyn Clock>) -> LedgerResult<Self> {
        let store = LedgerStore::open(path)?;
        store.migrate()?;
        Self::new(store, config, clock)
    }

    /// In-memory engine on a manual clock, for tests.
    pub fn build_test(clock: Arc<ManualClock>) -> LedgerResult<Self> {
        let store = LedgerStore::in_memory()?;
        store.migrate()?;
        Self::new(store, EngineConfig::default_test(), clock)
    }

    /// A manual clock at a fixed, readable instant.
    pub fn test_clock() -> Arc<ManualClock> {
        // 2024-01-01T00:00:00Z
        Arc::new(ManualClock::new(
            DateTime::<Utc>::from_timestamp(1_704_067_200, 0).unwrap_or_default(),
        ))
    }

    pub fn with_worker_id(mut self, worker_id: &str) -> Self {
        self.worker_id = worker_id.to_string();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    // ── Component views ────────────────────────────────────────

    pub fn catalog(&self) -> PlanCatalog<'_> {
        PlanCatalog::new(&self.store, &self.config, self.clock.as_ref())
    }

    pub fn ledger(&self) -> Ledger<'_> {
        Ledger::new(&self.store, &self.config, self.clock.as_ref())
    }

    pub fn lifecycle(&self) -> LifecycleManager<'_> {
        LifecycleManager::new(&self.store, &self.config, self.clock.as_ref())
    }

    pub fn balances(&self) -> BalanceService<'_> {
        BalanceService::new(&self.store, self.clock.as_ref())
    }

    pub fn processor(&self) -> ReturnProcessor<'_> {
        ReturnProcessor::new(&self.store, &self.config, self.clock.as_ref(), &self.worker_id)
            .with_shutdown(self.shutdown_handle())
    }

    // ── Admin surface ──────────────────────────────────────────

    pub fn create_plan(&self, spec: PlanSpec) -> LedgerResult<Plan> {
        self.catalog().create_plan(spec)
    }

    pub fn get_plan(&self, plan_id: &str) -> LedgerResult<Plan> {
        self.catalog().get_plan(plan_id)
    }

    pub fn list_active_plans(&self) -> LedgerResult<Vec<Plan>> {
        self.catalog().list_active_plans()
    }

    pub fn close(&self, investment_id: &str, reason: &str, options: CloseOptions) -> LedgerResult<Investment> {
        self.lifecycle().close(investment_id, reason, options)
    }

    // ── User surface ───────────────────────────────────────────

    pub fn open_investment(&self, user_id: &str, plan_id: &str, amount: Money) -> LedgerResult<Investment> {
        self.lifecycle().open(OpenRequest::new(user_id, plan_id, amount))
    }

    pub fn compute_balance(&self, user_id: &str) -> LedgerResult<Money> {
        self.balances().compute_balance(user_id)
    }

    pub fn list_for_user(&self, user_id: &str, filter: TransactionFilter) -> TransactionCursor<'_> {
        self.ledger().list_for_user(user_id, filter)
    }

    // ── Payment gateway surface ────────────────────────────────

    pub fn append(&self, txn: NewTransaction) -> LedgerResult<Appended> {
        self.ledger().append(txn)
    }

    /// Credit a settled gateway deposit. Re-delivery of the same reference
    /// returns the committed row.
    pub fn deposit(&self, user_id: &str, amount: Money, reference: &str) -> LedgerResult<Appended> {
        self.append(NewTransaction {
            user_id:         user_id.to_string(),
            investment_id:   None,
            wallet_scope:    self.config.default_wallet.clone(),
            amount,
            txn_type:        TransactionType::Deposit,
            idempotency_key: keys::gateway("deposit", reference),
            memo:            Some(format!("deposit {reference}")),
        })
    }

    /// Debit a gateway withdrawal. Unlike a raw append, refuses to take the
    /// wallet below zero.
    pub fn withdraw(&self, user_id: &str, amount: Money, reference: &str) -> LedgerResult<Appended> {
        let txn = NewTransaction {
            user_id:         user_id.to_string(),
            investment_id:   None,
            wallet_scope:    self.config.default_wallet.clone(),
            amount:          -amount,
            txn_type:        TransactionType::Withdrawal,
            idempotency_key: keys::gateway("withdrawal", reference),
            memo:            Some(format!("withdrawal {reference}")),
        };
        crate::ledger::validate(&txn, &self.config)?;
        let now = self.clock.now();
        self.store.atomically(|store| {
            if let Some(existing) = store.transaction_by_key(&txn.idempotency_key)? {
                return Ok(Appended::Existing(existing));
            }
            let available = store.sum_for_user(user_id, Some(txn.wallet_scope.as_str()))?;
            if available < amount {
                return Err(LedgerError::InsufficientFunds {
                    user_id:   user_id.to_string(),
                    wallet:    txn.wallet_scope.clone(),
                    required:  amount,
                    available,
                });
            }
            crate::ledger::append_within(store, &txn, now)
        })
    }

    // ── Scheduler surface ──────────────────────────────────────

    pub fn tick(&self) -> LedgerResult<TickReport> {
        self.processor().tick()
    }

    pub fn reconcile(&self) -> LedgerResult<ReconciliationReport> {
        self.balances().reconcile()
    }
}
