//! Scheduled return processor: a poller that holds no business state.
//!
//! Each tick:
//!   1. Claim a bounded batch of active investments with `next_due_at <= now`,
//!      oldest first, under a short lease.
//!   2. Accrue each one for the cycle it was claimed at. The idempotency key
//!      derives from (correlation key, cycles completed).
//!   3. Log and skip failures; the investment stays due and the next tick
//!      retries it with the same key.
//!   4. Repeat until nothing is due, the batch limit is hit, or shutdown is
//!      requested.
//!
//! Leases only avoid redundant work. Two workers that do claim the same
//! investment both call `accrue_cycle` for the same cycle, and the ledger
//! admits exactly one of them.

use crate::{
    clock::Clock,
    config::EngineConfig,
    error::{LedgerError, LedgerResult},
    lifecycle::{Accrual, Investment, LifecycleManager},
    store::LedgerStore,
    types::{EntityId, Timestamp},
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccrualFailure {
    pub investment_id: EntityId,
    pub cycle:         u32,
    pub attempts:      u32,
    pub error:         String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickReport {
    pub worker_id:     String,
    pub started_at:    Timestamp,
    pub batches:       usize,
    pub claimed:       usize,
    /// Cycles this worker realised.
    pub credited:      usize,
    /// Cycles another attempt had already realised.
    pub replayed:      usize,
    pub matured:       usize,
    /// Claimed but no longer accruable (paused, closed, or not yet due).
    pub skipped:       usize,
    pub failed:        Vec<AccrualFailure>,
    pub stopped_early: bool,
}

impl TickReport {
    fn new(worker_id: &str, started_at: Timestamp) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            started_at,
            batches: 0,
            claimed: 0,
            credited: 0,
            replayed: 0,
            matured: 0,
            skipped: 0,
            failed: Vec::new(),
            stopped_early: false,
        }
    }
}

pub struct ReturnProcessor<'a> {
    store:     &'a LedgerStore,
    config:    &'a EngineConfig,
    clock:     &'a dyn Clock,
    worker_id: String,
    shutdown:  Arc<AtomicBool>,
}

impl<'a> ReturnProcessor<'a> {
    pub fn new(store: &'a LedgerStore, config: &'a EngineConfig, clock: &'a dyn Clock, worker_id: &str) -> Self {
        Self {
            store,
            config,
            clock,
            worker_id: worker_id.to_string(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a shutdown flag. Once set, the tick finishes its current batch
    /// and returns.
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn tick(&self) -> LedgerResult<TickReport> {
        let mut report = TickReport::new(&self.worker_id, self.clock.now());
        let mut tokens = Vec::new();
        let lifecycle = LifecycleManager::new(self.store, self.config, self.clock);

        let result = self.run_batches(&lifecycle, &mut report, &mut tokens);

        // Failed investments kept their claim so this tick would not spin on
        // them. Hand them back for the next tick.
        for token in &tokens {
            if let Err(e) = self.store.release_all_claims(token) {
                log::warn!("processor[{}]: releasing claims of {token}: {e}", self.worker_id);
            }
        }
        result?;

        if report.claimed > 0 || !report.failed.is_empty() {
            log::info!(
                "processor[{}]: {} batch(es), credited={} replayed={} matured={} skipped={} failed={}",
                self.worker_id,
                report.batches,
                report.credited,
                report.replayed,
                report.matured,
                report.skipped,
                report.failed.len()
            );
        }
        Ok(report)
    }

    fn run_batches(
        &self,
        lifecycle: &LifecycleManager<'_>,
        report: &mut TickReport,
        tokens: &mut Vec<String>,
    ) -> LedgerResult<()> {
        for _ in 0..self.config.max_batches_per_tick {
            if self.shutdown.load(Ordering::SeqCst) {
                report.stopped_early = true;
                log::info!("processor[{}]: shutdown requested, stopping", self.worker_id);
                break;
            }

            let token = format!("{}:{}", self.worker_id, Uuid::new_v4());
            let batch = self.claim_batch(&token)?;
            if batch.is_empty() {
                break;
            }
            tokens.push(token.clone());
            report.batches += 1;
            report.claimed += batch.len();

            for inv in &batch {
                self.process_one(lifecycle, inv, &token, report);
            }
        }
        Ok(())
    }

    fn claim_batch(&self, token: &str) -> LedgerResult<Vec<Investment>> {
        self.with_retry(|| {
            let now = self.clock.now();
            let lease_until = now + Duration::seconds(self.config.lease_secs);
            self.store
                .claim_due_batch(token, now, lease_until, self.config.batch_size)
        })
        .map(|(batch, _)| batch)
        .map_err(|(e, _)| e)
    }

    fn process_one(
        &self,
        lifecycle: &LifecycleManager<'_>,
        inv: &Investment,
        token: &str,
        report: &mut TickReport,
    ) {
        let cycle = inv.cycles_completed;
        match self.with_retry(|| lifecycle.accrue_cycle(&inv.investment_id, cycle)) {
            Ok((accrual, _)) => {
                self.count(&accrual, report);
                self.release(inv, token);
            }
            Err((LedgerError::NotDue { .. } | LedgerError::InvalidTransition { .. }, _)) => {
                report.skipped += 1;
                self.release(inv, token);
            }
            Err((e, attempts)) => {
                log::warn!(
                    "processor[{}]: accrual of {} cycle {} failed after {attempts} attempt(s): {e}",
                    self.worker_id, inv.investment_id, cycle
                );
                report.failed.push(AccrualFailure {
                    investment_id: inv.investment_id.clone(),
                    cycle,
                    attempts,
                    error: e.to_string(),
                });
            }
        }
    }

    fn count(&self, accrual: &Accrual, report: &mut TickReport) {
        if accrual.replayed {
            report.replayed += 1;
            log::debug!(
                "processor[{}]: {} cycle already credited as #{}",
                self.worker_id, accrual.investment.investment_id, accrual.credit.id
            );
            return;
        }
        report.credited += 1;
        if accrual.matured() {
            report.matured += 1;
        }
    }

    fn release(&self, inv: &Investment, token: &str) {
        if let Err(e) = self.store.release_claim(&inv.investment_id, token) {
            // The lease expires on its own.
            log::warn!("processor[{}]: releasing {}: {e}", self.worker_id, inv.investment_id);
        }
    }

    /// Retry transient storage failures with exponential backoff.
    /// Returns the value and the attempts used, or the last error and the
    /// attempts used.
    fn with_retry<T>(
        &self,
        mut op: impl FnMut() -> LedgerResult<T>,
    ) -> Result<(T, u32), (LedgerError, u32)> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok((v, attempt)),
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = self.config.retry_backoff(attempt);
                    log::debug!(
                        "processor[{}]: transient failure (attempt {attempt}), retrying in {delay:?}: {e}",
                        self.worker_id
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }
}
