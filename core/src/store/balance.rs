use super::{decimal_col, millis_col, to_millis, LedgerStore};
use crate::{
    error::LedgerResult,
    types::{Money, Timestamp},
};
use rusqlite::{params, OptionalExtension};

impl LedgerStore {
    // ── Balance cache ──────────────────────────────────────────

    pub fn cached_balance(&self, user_id: &str) -> LedgerResult<Option<(Money, Timestamp)>> {
        let cached = self
            .conn
            .query_row(
                "SELECT balance, computed_at FROM balance_cache WHERE user_id = ?1",
                params![user_id],
                |row| Ok((decimal_col(row, 0)?, millis_col(row, 1)?)),
            )
            .optional()?;
        Ok(cached)
    }

    pub fn put_cached_balance(&self, user_id: &str, balance: Money, at: Timestamp) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO balance_cache (user_id, balance, computed_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                balance = excluded.balance,
                computed_at = excluded.computed_at",
            params![user_id, balance.to_string(), to_millis(at)],
        )?;
        Ok(())
    }

    pub fn invalidate_cached_balance(&self, user_id: &str) -> LedgerResult<()> {
        self.conn.execute(
            "DELETE FROM balance_cache WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(())
    }

    pub fn cached_balances(&self) -> LedgerResult<Vec<(String, Money)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id, balance FROM balance_cache ORDER BY user_id ASC")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, decimal_col(row, 1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
