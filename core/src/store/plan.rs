use super::{bool_col, decimal_col, enum_col, millis_col, to_millis, LedgerStore};
use crate::{
    catalog::{Plan, PlanSpec},
    error::LedgerResult,
};
use rusqlite::{params, OptionalExtension, Row};

const PLAN_COLUMNS: &str = "plan_id, name, minimum, maximum, interest_rate, interest_type,
     cycle_secs, capital_back, capital_back_basis, hold_capital, lifetime,
     repeat_count, active, created_at";

impl LedgerStore {
    // ── Plan ───────────────────────────────────────────────────

    pub fn insert_plan(&self, plan: &Plan) -> LedgerResult<()> {
        let t = &plan.terms;
        self.conn.execute(
            &format!(
                "INSERT INTO plan ({PLAN_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                plan.plan_id,
                t.name,
                t.minimum.to_string(),
                t.maximum.to_string(),
                t.interest_rate.to_string(),
                t.interest_type.as_str(),
                t.cycle_secs,
                t.capital_back,
                t.capital_back_basis.as_str(),
                t.hold_capital,
                t.lifetime,
                t.repeat_count,
                plan.active,
                to_millis(plan.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_plan(&self, plan_id: &str) -> LedgerResult<Option<Plan>> {
        let plan = self
            .conn
            .query_row(
                &format!("SELECT {PLAN_COLUMNS} FROM plan WHERE plan_id = ?1"),
                params![plan_id],
                map_plan_row,
            )
            .optional()?;
        Ok(plan)
    }

    pub fn list_plans(&self, active_only: bool) -> LedgerResult<Vec<Plan>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PLAN_COLUMNS} FROM plan
             WHERE (?1 = 0 OR active = 1)
             ORDER BY created_at ASC, name ASC"
        ))?;
        let rows = stmt
            .query_map(params![active_only], map_plan_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_plan_terms(&self, plan: &Plan) -> LedgerResult<()> {
        let t = &plan.terms;
        self.conn.execute(
            "UPDATE plan SET name = ?2, minimum = ?3, maximum = ?4, interest_rate = ?5,
                    interest_type = ?6, cycle_secs = ?7, capital_back = ?8,
                    capital_back_basis = ?9, hold_capital = ?10, lifetime = ?11,
                    repeat_count = ?12
             WHERE plan_id = ?1",
            params![
                plan.plan_id,
                t.name,
                t.minimum.to_string(),
                t.maximum.to_string(),
                t.interest_rate.to_string(),
                t.interest_type.as_str(),
                t.cycle_secs,
                t.capital_back,
                t.capital_back_basis.as_str(),
                t.hold_capital,
                t.lifetime,
                t.repeat_count,
            ],
        )?;
        Ok(())
    }

    pub fn set_plan_active(&self, plan_id: &str, active: bool) -> LedgerResult<()> {
        self.conn.execute(
            "UPDATE plan SET active = ?1 WHERE plan_id = ?2",
            params![active, plan_id],
        )?;
        Ok(())
    }

    pub fn investment_count_for_plan(&self, plan_id: &str) -> LedgerResult<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM investment WHERE plan_id = ?1",
            params![plan_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn map_plan_row(row: &Row<'_>) -> rusqlite::Result<Plan> {
    Ok(Plan {
        plan_id: row.get(0)?,
        terms: PlanSpec {
            name:               row.get(1)?,
            minimum:            decimal_col(row, 2)?,
            maximum:            decimal_col(row, 3)?,
            interest_rate:      decimal_col(row, 4)?,
            interest_type:      enum_col(row, 5)?,
            cycle_secs:         row.get(6)?,
            capital_back:       bool_col(row, 7)?,
            capital_back_basis: enum_col(row, 8)?,
            hold_capital:       bool_col(row, 9)?,
            lifetime:           bool_col(row, 10)?,
            repeat_count:       row.get(11)?,
        },
        active:     bool_col(row, 12)?,
        created_at: millis_col(row, 13)?,
    })
}
