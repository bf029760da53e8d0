use super::{decimal_col, enum_col, millis_col, to_millis, LedgerStore};
use crate::{
    error::{LedgerError, LedgerResult},
    ledger::{NewTransaction, Transaction, TransactionFilter},
    types::{Money, Timestamp, TransactionType},
};
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;

const TXN_COLUMNS: &str = "id, user_id, investment_id, wallet_scope, amount, txn_type,
     idempotency_key, post_balance, memo, created_at";

impl LedgerStore {
    // ── Ledger ─────────────────────────────────────────────────

    /// Insert a row unless its idempotency key is already committed.
    /// Returns None when the key existed and nothing was written.
    pub(crate) fn insert_transaction(
        &self,
        txn: &NewTransaction,
        post_balance: Money,
        now: Timestamp,
    ) -> LedgerResult<Option<Transaction>> {
        let inserted = self.conn.execute(
            "INSERT INTO ledger_transaction
                (user_id, investment_id, wallet_scope, amount, txn_type,
                 idempotency_key, post_balance, memo, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(idempotency_key) DO NOTHING",
            params![
                txn.user_id,
                txn.investment_id,
                txn.wallet_scope,
                txn.amount.to_string(),
                txn.txn_type.as_str(),
                txn.idempotency_key,
                post_balance.to_string(),
                txn.memo,
                to_millis(now),
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        let id = self.conn.last_insert_rowid();
        let row = self.conn.query_row(
            &format!("SELECT {TXN_COLUMNS} FROM ledger_transaction WHERE id = ?1"),
            params![id],
            map_transaction_row,
        )?;
        Ok(Some(row))
    }

    pub fn transaction_by_key(&self, idempotency_key: &str) -> LedgerResult<Option<Transaction>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {TXN_COLUMNS} FROM ledger_transaction WHERE idempotency_key = ?1"),
                params![idempotency_key],
                map_transaction_row,
            )
            .optional()?;
        Ok(row)
    }

    /// `post_balance` of the user's most recent row.
    pub fn latest_post_balance(&self, user_id: &str) -> LedgerResult<Option<Money>> {
        let balance = self
            .conn
            .query_row(
                "SELECT post_balance FROM ledger_transaction
                 WHERE user_id = ?1 ORDER BY id DESC LIMIT 1",
                params![user_id],
                |row| decimal_col(row, 0),
            )
            .optional()?;
        Ok(balance)
    }

    /// One page of a user's rows with id greater than `after_id`.
    pub fn transactions_page(
        &self,
        user_id: &str,
        filter: &TransactionFilter,
        after_id: i64,
        limit: usize,
    ) -> LedgerResult<Vec<Transaction>> {
        // Types are matched against a ",a,b," list so one statement serves
        // every filter shape.
        let types = if filter.types.is_empty() {
            None
        } else {
            let joined: Vec<&str> = filter.types.iter().map(TransactionType::as_str).collect();
            Some(format!(",{},", joined.join(",")))
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TXN_COLUMNS} FROM ledger_transaction
             WHERE user_id = ?1 AND id > ?2
               AND (?3 IS NULL OR instr(?3, ',' || txn_type || ',') > 0)
               AND (?4 IS NULL OR investment_id = ?4)
               AND (?5 IS NULL OR wallet_scope = ?5)
               AND (?6 IS NULL OR created_at >= ?6)
               AND (?7 IS NULL OR created_at < ?7)
             ORDER BY id ASC
             LIMIT ?8"
        ))?;
        let rows = stmt
            .query_map(
                params![
                    user_id,
                    after_id,
                    types,
                    filter.investment_id,
                    filter.wallet_scope,
                    filter.since.map(to_millis),
                    filter.until.map(to_millis),
                    limit as i64,
                ],
                map_transaction_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Exact signed sum of a user's rows, optionally for one wallet.
    pub fn sum_for_user(&self, user_id: &str, wallet_scope: Option<&str>) -> LedgerResult<Money> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT amount FROM ledger_transaction
             WHERE user_id = ?1 AND (?2 IS NULL OR wallet_scope = ?2)",
        )?;
        let mut rows = stmt.query(params![user_id, wallet_scope])?;
        let mut total = Decimal::ZERO;
        while let Some(row) = rows.next()? {
            total = total
                .checked_add(decimal_col(row, 0)?)
                .ok_or_else(|| LedgerError::overflow(&format!("balance of {user_id}")))?;
        }
        Ok(total)
    }

    pub fn ledger_users(&self) -> LedgerResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT user_id FROM ledger_transaction ORDER BY user_id ASC")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    }

    pub fn transactions_for_investment(&self, investment_id: &str) -> LedgerResult<Vec<Transaction>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TXN_COLUMNS} FROM ledger_transaction
             WHERE investment_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt
            .query_map(params![investment_id], map_transaction_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn transaction_count(&self) -> LedgerResult<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ledger_transaction", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn map_transaction_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id:              row.get(0)?,
        user_id:         row.get(1)?,
        investment_id:   row.get(2)?,
        wallet_scope:    row.get(3)?,
        amount:          decimal_col(row, 4)?,
        txn_type:        enum_col::<TransactionType>(row, 5)?,
        idempotency_key: row.get(6)?,
        post_balance:    decimal_col(row, 7)?,
        memo:            row.get(8)?,
        created_at:      millis_col(row, 9)?,
    })
}
