//! Transaction ledger: the append-only record of every balance change.
//!
//! RULES:
//!   - `append` is the only way a row enters the ledger. Rows are never
//!     updated or deleted (enforced by storage triggers as well).
//!   - Every row carries a unique idempotency key. Appending a key that is
//!     already committed returns the committed row instead of a second one.
//!   - Amounts are signed from the user's perspective: credits positive,
//!     debits negative.
//!   - Every append invalidates the user's cached balance in the same unit
//!     of work.

use crate::{
    clock::Clock,
    config::EngineConfig,
    error::{LedgerError, LedgerResult},
    store::LedgerStore,
    types::{EntityId, Money, Timestamp, TransactionType},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A committed ledger row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id:              i64,
    pub user_id:         EntityId,
    pub investment_id:   Option<EntityId>,
    pub wallet_scope:    String,
    pub amount:          Money,
    pub txn_type:        TransactionType,
    pub idempotency_key: String,
    /// User balance right after this row. Advisory only.
    pub post_balance:    Money,
    pub memo:            Option<String>,
    pub created_at:      Timestamp,
}

/// A row to be appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTransaction {
    pub user_id:         EntityId,
    pub investment_id:   Option<EntityId>,
    pub wallet_scope:    String,
    pub amount:          Money,
    pub txn_type:        TransactionType,
    pub idempotency_key: String,
    #[serde(default)]
    pub memo:            Option<String>,
}

/// Outcome of an append.
#[derive(Debug, Clone, PartialEq)]
pub enum Appended {
    /// This call committed the row.
    Fresh(Transaction),
    /// The key was already committed; this is that row, unchanged.
    Existing(Transaction),
}

impl Appended {
    pub fn transaction(&self) -> &Transaction {
        match self {
            Appended::Fresh(t) | Appended::Existing(t) => t,
        }
    }

    pub fn into_transaction(self) -> Transaction {
        match self {
            Appended::Fresh(t) | Appended::Existing(t) => t,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Appended::Existing(_))
    }
}

/// Narrows a listing. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionFilter {
    #[serde(default)]
    pub types:         Vec<TransactionType>,
    pub investment_id: Option<EntityId>,
    pub wallet_scope:  Option<String>,
    /// Inclusive.
    pub since:         Option<Timestamp>,
    /// Exclusive.
    pub until:         Option<Timestamp>,
}

impl TransactionFilter {
    pub fn of_type(txn_type: TransactionType) -> Self {
        Self { types: vec![txn_type], ..Self::default() }
    }

    pub fn for_investment(investment_id: &str) -> Self {
        Self { investment_id: Some(investment_id.to_string()), ..Self::default() }
    }
}

pub struct Ledger<'a> {
    store:  &'a LedgerStore,
    config: &'a EngineConfig,
    clock:  &'a dyn Clock,
}

impl<'a> Ledger<'a> {
    pub fn new(store: &'a LedgerStore, config: &'a EngineConfig, clock: &'a dyn Clock) -> Self {
        Self { store, config, clock }
    }

    /// Append one row in its own unit of work.
    pub fn append(&self, txn: NewTransaction) -> LedgerResult<Appended> {
        validate(&txn, self.config)?;
        let now = self.clock.now();
        let appended = self.store.atomically(|store| append_within(store, &txn, now))?;
        match &appended {
            Appended::Fresh(t) => log::debug!(
                "ledger: committed #{} {} {} for {}",
                t.id, t.txn_type, t.amount, t.user_id
            ),
            Appended::Existing(t) => log::debug!(
                "ledger: key {} already committed as #{}",
                t.idempotency_key, t.id
            ),
        }
        Ok(appended)
    }

    /// Lazy, finite, restartable listing of a user's rows in commit order.
    pub fn list_for_user(&self, user_id: &str, filter: TransactionFilter) -> TransactionCursor<'a> {
        TransactionCursor::new(self.store, user_id, filter, self.config.page_size)
    }

    pub fn sum_for_user(&self, user_id: &str) -> LedgerResult<Money> {
        self.store.sum_for_user(user_id, None)
    }

    pub fn sum_for_wallet(&self, user_id: &str, wallet_scope: &str) -> LedgerResult<Money> {
        self.store.sum_for_user(user_id, Some(wallet_scope))
    }

    pub fn find_by_key(&self, idempotency_key: &str) -> LedgerResult<Option<Transaction>> {
        self.store.transaction_by_key(idempotency_key)
    }
}

/// Boundary checks applied to every externally supplied row.
pub(crate) fn validate(txn: &NewTransaction, config: &EngineConfig) -> LedgerResult<()> {
    if txn.user_id.trim().is_empty() {
        return Err(LedgerError::Validation("user id must not be empty".into()));
    }
    if txn.wallet_scope.trim().is_empty() {
        return Err(LedgerError::Validation("wallet scope must not be empty".into()));
    }
    if txn.idempotency_key.trim().is_empty() {
        return Err(LedgerError::Validation("idempotency key must not be empty".into()));
    }
    if txn.amount.is_zero() {
        return Err(LedgerError::Validation("amount must not be zero".into()));
    }
    if txn.amount.normalize().scale() > config.currency_precision {
        return Err(LedgerError::Validation(format!(
            "amount {} has more than {} decimal places",
            txn.amount, config.currency_precision
        )));
    }
    let negative = txn.amount < Decimal::ZERO;
    if negative != txn.txn_type.is_debit() {
        return Err(LedgerError::Validation(format!(
            "{} amount must be {} (got {})",
            txn.txn_type,
            if txn.txn_type.is_debit() { "negative" } else { "positive" },
            txn.amount
        )));
    }
    Ok(())
}

/// Append inside an already-open unit of work. The caller owns the
/// transaction boundary; on `Existing` nothing was written.
pub(crate) fn append_within(
    store: &LedgerStore,
    txn: &NewTransaction,
    now: Timestamp,
) -> LedgerResult<Appended> {
    if let Some(existing) = store.transaction_by_key(&txn.idempotency_key)? {
        return Ok(Appended::Existing(existing));
    }
    let prior = store.latest_post_balance(&txn.user_id)?.unwrap_or(Decimal::ZERO);
    let post_balance = prior
        .checked_add(txn.amount)
        .ok_or_else(|| LedgerError::overflow(&format!("balance of {}", txn.user_id)))?;
    match store.insert_transaction(txn, post_balance, now)? {
        Some(committed) => {
            store.invalidate_cached_balance(&txn.user_id)?;
            Ok(Appended::Fresh(committed))
        }
        // Lost a race on the unique key between the lookup and the insert.
        None => store
            .transaction_by_key(&txn.idempotency_key)?
            .map(Appended::Existing)
            .ok_or_else(|| LedgerError::Duplicate { key: txn.idempotency_key.clone() }),
    }
}

/// Pages through a user's ledger rows by id. Holds no database cursor
/// between pages, so it never blocks concurrent appends.
pub struct TransactionCursor<'a> {
    store:     &'a LedgerStore,
    user_id:   EntityId,
    filter:    TransactionFilter,
    page_size: usize,
    after_id:  i64,
    buffer:    std::collections::VecDeque<Transaction>,
    exhausted: bool,
}

impl<'a> TransactionCursor<'a> {
    fn new(store: &'a LedgerStore, user_id: &str, filter: TransactionFilter, page_size: usize) -> Self {
        Self {
            store,
            user_id: user_id.to_string(),
            filter,
            page_size: page_size.max(1),
            after_id: 0,
            buffer: Default::default(),
            exhausted: false,
        }
    }

    /// Start again from the first row. Rows appended since the previous
    /// pass are included.
    pub fn restart(&mut self) {
        self.after_id = 0;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn fill(&mut self) -> LedgerResult<()> {
        let page = self.store.transactions_page(
            &self.user_id,
            &self.filter,
            self.after_id,
            self.page_size,
        )?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.after_id = last.id;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for TransactionCursor<'_> {
    type Item = LedgerResult<Transaction>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
