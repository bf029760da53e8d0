//! Balance reconciliation: balances are derived, never maintained.
//!
//! A user's balance is the signed sum of their ledger rows. The cache in
//! `balance_cache` exists only for fast reads: appends delete the user's
//! entry and the next read rebuilds it. `reconcile` checks every cached
//! value and every user's latest advisory `post_balance` against the
//! derived sum and reports any difference as drift.

use crate::{
    clock::Clock,
    error::LedgerResult,
    event::LedgerEvent,
    store::LedgerStore,
    types::{EntityId, Money},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriftSource {
    Cache,
    PostBalance,
}

impl DriftSource {
    fn as_str(&self) -> &'static str {
        match self {
            DriftSource::Cache       => "cache",
            DriftSource::PostBalance => "post_balance",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BalanceDrift {
    pub user_id: EntityId,
    pub source:  DriftSource,
    pub stored:  Money,
    pub derived: Money,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationReport {
    pub users_checked: usize,
    pub cache_entries_checked: usize,
    pub drifts: Vec<BalanceDrift>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.drifts.is_empty()
    }
}

pub struct BalanceService<'a> {
    store: &'a LedgerStore,
    clock: &'a dyn Clock,
}

impl<'a> BalanceService<'a> {
    pub fn new(store: &'a LedgerStore, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    /// Authoritative balance across all wallet scopes.
    pub fn compute_balance(&self, user_id: &str) -> LedgerResult<Money> {
        self.store.sum_for_user(user_id, None)
    }

    pub fn compute_wallet_balance(&self, user_id: &str, wallet_scope: &str) -> LedgerResult<Money> {
        self.store.sum_for_user(user_id, Some(wallet_scope))
    }

    /// Fast read for dashboards. On a miss the derived sum is computed and
    /// cached in one unit of work, so an append cannot land between the two.
    pub fn cached_balance(&self, user_id: &str) -> LedgerResult<Money> {
        if let Some((balance, _)) = self.store.cached_balance(user_id)? {
            return Ok(balance);
        }
        let now = self.clock.now();
        self.store.atomically(|store| {
            let derived = store.sum_for_user(user_id, None)?;
            store.put_cached_balance(user_id, derived, now)?;
            Ok(derived)
        })
    }

    /// Compare every cached balance and every latest `post_balance` with
    /// the derived sum. Drift is logged, recorded, and the cache entry is
    /// replaced by the derived value.
    pub fn reconcile(&self) -> LedgerResult<ReconciliationReport> {
        let now = self.clock.now();
        let mut report = ReconciliationReport::default();

        let cached = self.store.cached_balances()?;
        report.cache_entries_checked = cached.len();

        let mut users = self.store.ledger_users()?;
        for (user_id, _) in cached {
            if !users.contains(&user_id) {
                users.push(user_id);
            }
        }

        for user_id in &users {
            let drifts = self.store.atomically(|store| {
                let derived = store.sum_for_user(user_id, None)?;
                let mut found = Vec::new();

                if let Some((cached, _)) = store.cached_balance(user_id)? {
                    if cached != derived {
                        found.push(BalanceDrift {
                            user_id: user_id.clone(),
                            source:  DriftSource::Cache,
                            stored:  cached,
                            derived,
                        });
                        store.put_cached_balance(user_id, derived, now)?;
                    }
                }
                if let Some(post) = store.latest_post_balance(user_id)? {
                    if post != derived {
                        found.push(BalanceDrift {
                            user_id: user_id.clone(),
                            source:  DriftSource::PostBalance,
                            stored:  post,
                            derived,
                        });
                    }
                }

                for drift in &found {
                    store.record_event(
                        &LedgerEvent::BalanceDriftDetected {
                            user_id: drift.user_id.clone(),
                            source:  drift.source.as_str().to_string(),
                            stored:  drift.stored,
                            derived: drift.derived,
                        },
                        Some(user_id),
                        now,
                    )?;
                }
                Ok(found)
            })?;

            for d in &drifts {
                log::warn!(
                    "balance: drift for {} in {}: stored {} != derived {}",
                    d.user_id,
                    d.source.as_str(),
                    d.stored,
                    d.derived
                );
            }
            report.drifts.extend(drifts);
        }

        report.users_checked = users.len();
        log::info!(
            "balance: reconciled {} users, {} drift(s)",
            report.users_checked,
            report.drifts.len()
        );
        Ok(report)
    }
}
