use super::{bool_col, decimal_col, enum_col, millis_col, opt_millis_col, to_millis, LedgerStore};
use crate::{
    error::LedgerResult,
    lifecycle::Investment,
    types::{InvestmentStatus, Timestamp},
};
use rusqlite::{params, OptionalExtension, Row};

const INVESTMENT_COLUMNS: &str = "investment_id, user_id, plan_id, principal, interest_rate,
     interest_type, cycle_secs, capital_back, capital_back_basis, hold_capital,
     accrued_value, total_returned, next_due_at, cycles_completed, cycles_remaining,
     status, wallet_scope, correlation_key, opened_at, closed_at, close_reason";

impl LedgerStore {
    // ── Investment ─────────────────────────────────────────────

    pub fn insert_investment(&self, inv: &Investment) -> LedgerResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO investment ({INVESTMENT_COLUMNS})
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)"
            ),
            params![
                inv.investment_id,
                inv.user_id,
                inv.plan_id,
                inv.principal.to_string(),
                inv.interest_rate.to_string(),
                inv.interest_type.as_str(),
                inv.cycle_secs,
                inv.capital_back,
                inv.capital_back_basis.as_str(),
                inv.hold_capital,
                inv.accrued_value.to_string(),
                inv.total_returned.to_string(),
                to_millis(inv.next_due_at),
                inv.cycles_completed,
                inv.cycles_remaining,
                inv.status.as_str(),
                inv.wallet_scope,
                inv.correlation_key,
                to_millis(inv.opened_at),
                inv.closed_at.map(to_millis),
                inv.close_reason,
            ],
        )?;
        Ok(())
    }

    pub fn get_investment(&self, investment_id: &str) -> LedgerResult<Option<Investment>> {
        let inv = self
            .conn
            .query_row(
                &format!("SELECT {INVESTMENT_COLUMNS} FROM investment WHERE investment_id = ?1"),
                params![investment_id],
                map_investment_row,
            )
            .optional()?;
        Ok(inv)
    }

    pub fn investment_by_correlation(&self, correlation_key: &str) -> LedgerResult<Option<Investment>> {
        let inv = self
            .conn
            .query_row(
                &format!("SELECT {INVESTMENT_COLUMNS} FROM investment WHERE correlation_key = ?1"),
                params![correlation_key],
                map_investment_row,
            )
            .optional()?;
        Ok(inv)
    }

    pub fn investments_for_user(&self, user_id: &str) -> LedgerResult<Vec<Investment>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {INVESTMENT_COLUMNS} FROM investment
             WHERE user_id = ?1 ORDER BY opened_at ASC, investment_id ASC"
        ))?;
        let rows = stmt
            .query_map(params![user_id], map_investment_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn investment_count_by_status(&self, status: InvestmentStatus) -> LedgerResult<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM investment WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Persist everything a transition may change. Terms, owner and keys
    /// are immutable and never written here.
    pub fn update_investment_progress(&self, inv: &Investment) -> LedgerResult<()> {
        self.conn.execute(
            "UPDATE investment SET
                accrued_value = ?2, total_returned = ?3, next_due_at = ?4,
                cycles_completed = ?5, cycles_remaining = ?6, status = ?7,
                closed_at = ?8, close_reason = ?9
             WHERE investment_id = ?1",
            params![
                inv.investment_id,
                inv.accrued_value.to_string(),
                inv.total_returned.to_string(),
                to_millis(inv.next_due_at),
                inv.cycles_completed,
                inv.cycles_remaining,
                inv.status.as_str(),
                inv.closed_at.map(to_millis),
                inv.close_reason,
            ],
        )?;
        Ok(())
    }

    // ── Due-work claiming ──────────────────────────────────────

    /// Claim up to `limit` due, unclaimed (or lease-expired) active
    /// investments for `token`, oldest due first. The claim is a single
    /// compare-and-set UPDATE, so two workers never claim the same row
    /// while its lease holds.
    pub fn claim_due_batch(
        &self,
        token: &str,
        now: Timestamp,
        lease_until: Timestamp,
        limit: usize,
    ) -> LedgerResult<Vec<Investment>> {
        let now_ms = to_millis(now);
        self.conn.execute(
            "UPDATE investment SET claimed_by = ?1, claimed_until = ?2
             WHERE investment_id IN (
                 SELECT investment_id FROM investment
                 WHERE status = 'active' AND next_due_at <= ?3
                   AND (claimed_until IS NULL OR claimed_until <= ?3)
                 ORDER BY next_due_at ASC, investment_id ASC
                 LIMIT ?4
             )",
            params![token, to_millis(lease_until), now_ms, limit as i64],
        )?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {INVESTMENT_COLUMNS} FROM investment
             WHERE claimed_by = ?1 AND status = 'active' AND next_due_at <= ?2
             ORDER BY next_due_at ASC, investment_id ASC"
        ))?;
        let rows = stmt
            .query_map(params![token, now_ms], map_investment_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn release_claim(&self, investment_id: &str, token: &str) -> LedgerResult<()> {
        self.conn.execute(
            "UPDATE investment SET claimed_by = NULL, claimed_until = NULL
             WHERE investment_id = ?1 AND claimed_by = ?2",
            params![investment_id, token],
        )?;
        Ok(())
    }

    pub fn release_all_claims(&self, token: &str) -> LedgerResult<usize> {
        let released = self.conn.execute(
            "UPDATE investment SET claimed_by = NULL, claimed_until = NULL
             WHERE claimed_by = ?1",
            params![token],
        )?;
        Ok(released)
    }

    pub fn due_count(&self, now: Timestamp) -> LedgerResult<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM investment WHERE status = 'active' AND next_due_at <= ?1",
            params![to_millis(now)],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn map_investment_row(row: &Row<'_>) -> rusqlite::Result<Investment> {
    Ok(Investment {
        investment_id:      row.get(0)?,
        user_id:            row.get(1)?,
        plan_id:            row.get(2)?,
        principal:          decimal_col(row, 3)?,
        interest_rate:      decimal_col(row, 4)?,
        interest_type:      enum_col(row, 5)?,
        cycle_secs:         row.get(6)?,
        capital_back:       bool_col(row, 7)?,
        capital_back_basis: enum_col(row, 8)?,
        hold_capital:       bool_col(row, 9)?,
        accrued_value:      decimal_col(row, 10)?,
        total_returned:     decimal_col(row, 11)?,
        next_due_at:        millis_col(row, 12)?,
        cycles_completed:   row.get(13)?,
        cycles_remaining:   row.get(14)?,
        status:             enum_col(row, 15)?,
        wallet_scope:       row.get(16)?,
        correlation_key:    row.get(17)?,
        opened_at:          millis_col(row, 18)?,
        closed_at:          opt_millis_col(row, 19)?,
        close_reason:       row.get(20)?,
    })
}
