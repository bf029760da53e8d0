//! Investment lifecycle: the state machine for one investment.
//!
//! States: active (initial), paused, matured (terminal), closed (terminal).
//!
//!   active  --accrue, cycles exhausted-->  matured
//!   active  --pause-->                     paused
//!   paused  --resume-->                    active
//!   active | paused  --close-->            closed
//!
//! RULES:
//!   - Every transition and the ledger rows it produces commit as one unit
//!     of work. A failure leaves no row and no moved `next_due_at`.
//!   - An investment copies the plan terms it needs when it is opened.
//!     Nothing here reads the plan after that.
//!   - Exactly-once payout rests on the ledger's idempotency keys, not on
//!     locking. A raced accrual finds its key committed and replays.

use crate::{
    catalog::Plan,
    clock::Clock,
    config::EngineConfig,
    error::{LedgerError, LedgerResult},
    event::LedgerEvent,
    keys,
    ledger::{self, Appended, NewTransaction, Transaction},
    store::LedgerStore,
    types::{CapitalBackBasis, EntityId, InterestType, InvestmentStatus, Money, Timestamp, TransactionType},
};
use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Investment {
    pub investment_id:      EntityId,
    pub user_id:            EntityId,
    pub plan_id:            EntityId,
    pub principal:          Money,
    /// Percent per cycle, copied from the plan at open.
    pub interest_rate:      Decimal,
    pub interest_type:      InterestType,
    pub cycle_secs:         i64,
    pub capital_back:       bool,
    pub capital_back_basis: CapitalBackBasis,
    pub hold_capital:       bool,
    /// Base for the next compounding return. Equals principal for simple plans.
    pub accrued_value:      Decimal,
    pub total_returned:     Money,
    pub next_due_at:        Timestamp,
    pub cycles_completed:   u32,
    /// None for lifetime investments.
    pub cycles_remaining:   Option<u32>,
    pub status:             InvestmentStatus,
    pub wallet_scope:       String,
    pub correlation_key:    String,
    pub opened_at:          Timestamp,
    pub closed_at:          Option<Timestamp>,
    pub close_reason:       Option<String>,
}

impl Investment {
    pub fn cycle_length(&self) -> Duration {
        Duration::seconds(self.cycle_secs)
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == InvestmentStatus::Active && self.next_due_at <= now
    }

    /// Unrounded return for the next cycle. A compounding base that has
    /// grown past the money range is an error, not a panic.
    pub fn raw_cycle_return(&self) -> LedgerResult<Decimal> {
        let base = match self.interest_type {
            InterestType::Simple      => self.principal,
            InterestType::Compounding => self.accrued_value,
        };
        base.checked_mul(self.interest_rate)
            .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
            .ok_or_else(|| LedgerError::overflow(&format!("return on {}", self.investment_id)))
    }

    /// What a capital-back credit pays for this investment.
    pub fn capital_back_amount(&self, config: &EngineConfig) -> Money {
        match self.capital_back_basis {
            CapitalBackBasis::Principal    => self.principal,
            CapitalBackBasis::AccruedValue => config.round(self.accrued_value),
        }
    }
}

/// A request to commit funds to a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRequest {
    pub user_id:      EntityId,
    pub plan_id:      EntityId,
    pub amount:       Money,
    /// Wallet debited and later credited. Defaults to the configured wallet.
    #[serde(default)]
    pub wallet_scope: Option<String>,
    /// Caller's key for this request. Re-submitting the same key returns the
    /// investment it already opened.
    #[serde(default)]
    pub request_key:  Option<String>,
}

impl OpenRequest {
    pub fn new(user_id: &str, plan_id: &str, amount: Money) -> Self {
        Self {
            user_id:      user_id.to_string(),
            plan_id:      plan_id.to_string(),
            amount,
            wallet_scope: None,
            request_key:  None,
        }
    }

    pub fn with_request_key(mut self, key: &str) -> Self {
        self.request_key = Some(key.to_string());
        self
    }

    pub fn with_wallet(mut self, wallet: &str) -> Self {
        self.wallet_scope = Some(wallet.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CloseOptions {
    /// Lets an administrator close a hold-capital investment early.
    #[serde(default)]
    pub admin_override: bool,
}

/// The rows one accrual produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Accrual {
    pub investment:   Investment,
    pub credit:       Transaction,
    pub capital_back: Option<Transaction>,
    /// True when this call found the cycle already realised and wrote nothing.
    pub replayed:     bool,
}

impl Accrual {
    pub fn matured(&self) -> bool {
        self.investment.status == InvestmentStatus::Matured
    }
}

pub struct LifecycleManager<'a> {
    store:  &'a LedgerStore,
    config: &'a EngineConfig,
    clock:  &'a dyn Clock,
}

impl<'a> LifecycleManager<'a> {
    pub fn new(store: &'a LedgerStore, config: &'a EngineConfig, clock: &'a dyn Clock) -> Self {
        Self { store, config, clock }
    }

    pub fn get(&self, investment_id: &str) -> LedgerResult<Investment> {
        self.store
            .get_investment(investment_id)?
            .ok_or_else(|| LedgerError::not_found("investment", investment_id))
    }

    pub fn list_for_user(&self, user_id: &str) -> LedgerResult<Vec<Investment>> {
        self.store.investments_for_user(user_id)
    }

    // ── Open ───────────────────────────────────────────────────

    pub fn open(&self, req: OpenRequest) -> LedgerResult<Investment> {
        let wallet = req
            .wallet_scope
            .clone()
            .unwrap_or_else(|| self.config.default_wallet.clone());
        if req.user_id.trim().is_empty() {
            return Err(LedgerError::Validation("user id must not be empty".into()));
        }
        if req.amount.normalize().scale() > self.config.currency_precision {
            return Err(LedgerError::Validation(format!(
                "amount {} has more than {} decimal places",
                req.amount, self.config.currency_precision
            )));
        }

        let correlation_key = match &req.request_key {
            Some(k) => keys::correlation_from_request(&req.user_id, k),
            None    => Uuid::new_v4().to_string(),
        };
        let now = self.clock.now();

        let investment = self.store.atomically(|store| {
            if let Some(existing) = store.investment_by_correlation(&correlation_key)? {
                log::debug!(
                    "lifecycle: open replayed for request key, investment {}",
                    existing.investment_id
                );
                return Ok(existing);
            }

            let plan = store
                .get_plan(&req.plan_id)?
                .ok_or_else(|| LedgerError::not_found("plan", &req.plan_id))?;
            check_open_terms(&plan, req.amount)?;

            // Authoritative funds check: derived from the ledger inside the
            // unit of work, never from a cached balance.
            let available = store.sum_for_user(&req.user_id, Some(wallet.as_str()))?;
            if available < req.amount {
                return Err(LedgerError::InsufficientFunds {
                    user_id:   req.user_id.clone(),
                    wallet:    wallet.clone(),
                    required:  req.amount,
                    available,
                });
            }

            let investment = Investment {
                investment_id:      Uuid::new_v4().to_string(),
                user_id:            req.user_id.clone(),
                plan_id:            plan.plan_id.clone(),
                principal:          req.amount,
                interest_rate:      plan.terms.interest_rate,
                interest_type:      plan.terms.interest_type,
                cycle_secs:         plan.terms.cycle_secs,
                capital_back:       plan.terms.capital_back,
                capital_back_basis: plan.terms.capital_back_basis,
                hold_capital:       plan.terms.hold_capital,
                accrued_value:      req.amount,
                total_returned:     Decimal::ZERO,
                next_due_at:        now + plan.terms.cycle_length(),
                cycles_completed:   0,
                cycles_remaining:   if plan.terms.lifetime { None } else { plan.terms.repeat_count },
                status:             InvestmentStatus::Active,
                wallet_scope:       wallet.clone(),
                correlation_key:    correlation_key.clone(),
                opened_at:          now,
                closed_at:          None,
                close_reason:       None,
            };
            store.insert_investment(&investment)?;

            let debit = NewTransaction {
                user_id:         investment.user_id.clone(),
                investment_id:   Some(investment.investment_id.clone()),
                wallet_scope:    wallet.clone(),
                amount:          -investment.principal,
                txn_type:        TransactionType::InvestmentDebit,
                idempotency_key: keys::investment_debit(&correlation_key),
                memo:            Some(format!("invest in {}", plan.terms.name)),
            };
            append_fresh(store, &debit, self.config, now)?;

            store.record_event(
                &LedgerEvent::InvestmentOpened {
                    investment_id: investment.investment_id.clone(),
                    user_id:       investment.user_id.clone(),
                    plan_id:       investment.plan_id.clone(),
                    principal:     investment.principal,
                    next_due_at:   investment.next_due_at,
                },
                Some(&investment.user_id),
                now,
            )?;
            Ok(investment)
        })?;

        log::info!(
            "lifecycle: opened {} for {} ({} in plan {})",
            investment.investment_id, investment.user_id, investment.principal, investment.plan_id
        );
        Ok(investment)
    }

    // ── Accrue ─────────────────────────────────────────────────

    /// Realise the investment's current due cycle.
    pub fn accrue(&self, investment_id: &str) -> LedgerResult<Transaction> {
        let current = self.get(investment_id)?;
        self.accrue_cycle(investment_id, current.cycles_completed)
            .map(|a| a.credit)
    }

    /// Realise the cycle that begins with `cycles_completed` cycles done.
    /// Calling this again for the same cycle, from any worker, writes
    /// nothing and returns the rows the first call committed.
    pub fn accrue_cycle(&self, investment_id: &str, cycles_completed: u32) -> LedgerResult<Accrual> {
        let now = self.clock.now();
        let outcome = self
            .store
            .atomically(|store| self.accrue_within(store, investment_id, cycles_completed, now));

        match outcome {
            Err(LedgerError::Duplicate { key }) => {
                log::debug!("lifecycle: cycle {cycles_completed} of {investment_id} raced, replaying");
                self.replay(investment_id, cycles_completed)?
                    .ok_or(LedgerError::Duplicate { key })
            }
            other => other,
        }
    }

    fn accrue_within(
        &self,
        store: &LedgerStore,
        investment_id: &str,
        cycles_completed: u32,
        now: Timestamp,
    ) -> LedgerResult<Accrual> {
        let mut inv = store
            .get_investment(investment_id)?
            .ok_or_else(|| LedgerError::not_found("investment", investment_id))?;

        let credit_key = keys::return_credit(&inv.correlation_key, cycles_completed);
        if let Some(credit) = store.transaction_by_key(&credit_key)? {
            let capital_back = replayed_capital_back(store, &inv, cycles_completed)?;
            return Ok(Accrual { investment: inv, credit, capital_back, replayed: true });
        }

        if inv.status != InvestmentStatus::Active {
            return Err(LedgerError::InvalidTransition {
                investment_id: inv.investment_id,
                from:          inv.status,
                action:        "accrue",
            });
        }
        if inv.cycles_completed != cycles_completed {
            return Err(LedgerError::Validation(format!(
                "investment {} is at cycle {}, not {}",
                inv.investment_id, inv.cycles_completed, cycles_completed
            )));
        }
        if inv.next_due_at > now {
            return Err(LedgerError::NotDue {
                investment_id: inv.investment_id,
                next_due_at:   inv.next_due_at,
            });
        }

        let raw_return = inv.raw_cycle_return()?;
        let amount = self.config.round(raw_return);
        let credit = append_fresh(
            store,
            &NewTransaction {
                user_id:         inv.user_id.clone(),
                investment_id:   Some(inv.investment_id.clone()),
                wallet_scope:    inv.wallet_scope.clone(),
                amount,
                txn_type:        TransactionType::ReturnCredit,
                idempotency_key: credit_key,
                memo:            Some(format!("return for cycle {}", cycles_completed + 1)),
            },
            self.config,
            now,
        )?;

        if inv.interest_type == InterestType::Compounding {
            inv.accrued_value = inv
                .accrued_value
                .checked_add(raw_return)
                .ok_or_else(|| LedgerError::overflow(&format!("accrued value of {}", inv.investment_id)))?
                .round_dp(self.config.accrual_scale);
        }
        inv.total_returned = inv
            .total_returned
            .checked_add(amount)
            .ok_or_else(|| LedgerError::overflow(&format!("total returned by {}", inv.investment_id)))?;
        inv.next_due_at += inv.cycle_length();
        inv.cycles_completed += 1;
        if let Some(remaining) = inv.cycles_remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }

        store.record_event(
            &LedgerEvent::ReturnCredited {
                investment_id: inv.investment_id.clone(),
                cycle:         inv.cycles_completed,
                amount,
            },
            Some(&inv.user_id),
            now,
        )?;

        let mut capital_back = None;
        if inv.cycles_remaining == Some(0) {
            inv.status = InvestmentStatus::Matured;
            inv.closed_at = Some(now);
            if inv.capital_back {
                let amount = inv.capital_back_amount(self.config);
                capital_back = Some(credit_capital(store, &inv, amount, self.config, now)?);
            }
            store.record_event(
                &LedgerEvent::InvestmentMatured {
                    investment_id:    inv.investment_id.clone(),
                    cycles_completed: inv.cycles_completed,
                },
                Some(&inv.user_id),
                now,
            )?;
        }

        store.update_investment_progress(&inv)?;

        if inv.status == InvestmentStatus::Matured {
            log::info!(
                "lifecycle: {} matured after {} cycles, returned {}",
                inv.investment_id, inv.cycles_completed, inv.total_returned
            );
        }
        Ok(Accrual { investment: inv, credit, capital_back, replayed: false })
    }

    fn replay(&self, investment_id: &str, cycles_completed: u32) -> LedgerResult<Option<Accrual>> {
        let inv = self.get(investment_id)?;
        let key = keys::return_credit(&inv.correlation_key, cycles_completed);
        let Some(credit) = self.store.transaction_by_key(&key)? else {
            return Ok(None);
        };
        let capital_back = replayed_capital_back(self.store, &inv, cycles_completed)?;
        Ok(Some(Accrual { investment: inv, credit, capital_back, replayed: true }))
    }

    // ── Pause / resume ─────────────────────────────────────────

    pub fn pause(&self, investment_id: &str) -> LedgerResult<Investment> {
        let now = self.clock.now();
        self.store.atomically(|store| {
            let mut inv = store
                .get_investment(investment_id)?
                .ok_or_else(|| LedgerError::not_found("investment", investment_id))?;
            if inv.status != InvestmentStatus::Active {
                return Err(LedgerError::InvalidTransition {
                    investment_id: inv.investment_id,
                    from:          inv.status,
                    action:        "pause",
                });
            }
            inv.status = InvestmentStatus::Paused;
            store.update_investment_progress(&inv)?;
            store.record_event(
                &LedgerEvent::InvestmentPaused { investment_id: inv.investment_id.clone() },
                Some(&inv.user_id),
                now,
            )?;
            Ok(inv)
        })
    }

    /// Paused time is not back-paid: an overdue schedule restarts one
    /// cycle from now.
    pub fn resume(&self, investment_id: &str) -> LedgerResult<Investment> {
        let now = self.clock.now();
        self.store.atomically(|store| {
            let mut inv = store
                .get_investment(investment_id)?
                .ok_or_else(|| LedgerError::not_found("investment", investment_id))?;
            if inv.status != InvestmentStatus::Paused {
                return Err(LedgerError::InvalidTransition {
                    investment_id: inv.investment_id,
                    from:          inv.status,
                    action:        "resume",
                });
            }
            inv.status = InvestmentStatus::Active;
            if inv.next_due_at < now {
                inv.next_due_at = now + inv.cycle_length();
            }
            store.update_investment_progress(&inv)?;
            store.record_event(
                &LedgerEvent::InvestmentResumed {
                    investment_id: inv.investment_id.clone(),
                    next_due_at:   inv.next_due_at,
                },
                Some(&inv.user_id),
                now,
            )?;
            Ok(inv)
        })
    }

    // ── Close ──────────────────────────────────────────────────

    /// Early termination. Capital-back investments get their principal
    /// refunded under the same key maturity would use. Returns already
    /// credited stay credited, so an accrued-value basis does not apply.
    pub fn close(&self, investment_id: &str, reason: &str, options: CloseOptions) -> LedgerResult<Investment> {
        let now = self.clock.now();
        let inv = self.store.atomically(|store| {
            let mut inv = store
                .get_investment(investment_id)?
                .ok_or_else(|| LedgerError::not_found("investment", investment_id))?;
            if inv.status.is_terminal() {
                return Err(LedgerError::InvalidTransition {
                    investment_id: inv.investment_id,
                    from:          inv.status,
                    action:        "close",
                });
            }
            if inv.hold_capital && !options.admin_override {
                return Err(LedgerError::CapitalLocked { investment_id: inv.investment_id });
            }

            if inv.capital_back {
                credit_capital(store, &inv, inv.principal, self.config, now)?;
            }
            inv.status = InvestmentStatus::Closed;
            inv.closed_at = Some(now);
            inv.close_reason = Some(reason.to_string());
            store.update_investment_progress(&inv)?;
            store.record_event(
                &LedgerEvent::InvestmentClosed {
                    investment_id:  inv.investment_id.clone(),
                    reason:         reason.to_string(),
                    admin_override: options.admin_override,
                },
                Some(&inv.user_id),
                now,
            )?;
            Ok(inv)
        })?;
        log::info!(
            "lifecycle: closed {} ({reason}){}",
            inv.investment_id,
            if options.admin_override { " by admin override" } else { "" }
        );
        Ok(inv)
    }
}

fn check_open_terms(plan: &Plan, amount: Money) -> LedgerResult<()> {
    if !plan.active {
        return Err(LedgerError::Validation(format!(
            "plan {} is not accepting investments",
            plan.plan_id
        )));
    }
    if !plan.accepts(amount) {
        return Err(LedgerError::Validation(format!(
            "amount {amount} outside plan limits [{}, {}]",
            plan.terms.minimum, plan.terms.maximum
        )));
    }
    Ok(())
}

/// Append a row that must be new. A committed key aborts the surrounding
/// unit of work with `Duplicate`, so nothing else in it is kept.
fn append_fresh(
    store: &LedgerStore,
    txn: &NewTransaction,
    config: &EngineConfig,
    now: Timestamp,
) -> LedgerResult<Transaction> {
    ledger::validate(txn, config)?;
    match ledger::append_within(store, txn, now)? {
        Appended::Fresh(t) => Ok(t),
        Appended::Existing(t) => Err(LedgerError::Duplicate { key: t.idempotency_key }),
    }
}

fn credit_capital(
    store: &LedgerStore,
    inv: &Investment,
    amount: Money,
    config: &EngineConfig,
    now: Timestamp,
) -> LedgerResult<Transaction> {
    let txn = append_fresh(
        store,
        &NewTransaction {
            user_id:         inv.user_id.clone(),
            investment_id:   Some(inv.investment_id.clone()),
            wallet_scope:    inv.wallet_scope.clone(),
            amount,
            txn_type:        TransactionType::CapitalBackCredit,
            idempotency_key: keys::capital_back(&inv.correlation_key),
            memo:            Some("capital back".into()),
        },
        config,
        now,
    )?;
    store.record_event(
        &LedgerEvent::CapitalReturned { investment_id: inv.investment_id.clone(), amount },
        Some(&inv.user_id),
        now,
    )?;
    Ok(txn)
}

/// The capital-back row belongs to a replayed accrual only if that accrual
/// was the maturing cycle.
fn replayed_capital_back(
    store: &LedgerStore,
    inv: &Investment,
    cycles_completed: u32,
) -> LedgerResult<Option<Transaction>> {
    let was_last_cycle = inv.status == InvestmentStatus::Matured
        && inv.cycles_completed == cycles_completed + 1;
    if !was_last_cycle {
        return Ok(None);
    }
    store.transaction_by_key(&keys::capital_back(&inv.correlation_key))
}
