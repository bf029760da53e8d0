//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Components call store methods. They never execute SQL directly.
//!
//! Money is stored as decimal TEXT and summed in Rust, never by SQLite
//! (whose SUM is floating point). Timestamps are UTC epoch milliseconds.

mod balance;
mod investment;
mod ledger;
mod plan;

use crate::{
    error::{LedgerError, LedgerResult},
    event::{EventLogEntry, LedgerEvent},
    types::{Timestamp, UnknownVariant},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, Row};
use rust_decimal::Decimal;
use std::{str::FromStr, time::Duration};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LedgerStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl LedgerStore {
    pub fn open(path: &str) -> LedgerResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        // WAL: readers never wait on the writer.
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL;", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            return Err(LedgerError::Other(anyhow::anyhow!(
                "{path}: journal mode is {mode}, WAL required"
            )));
        }
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> LedgerResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Path of the database file; None for in-memory stores.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Bound every wait on a lock held by another connection.
    pub fn set_busy_timeout(&self, timeout: Duration) -> LedgerResult<()> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    /// Apply all schema migrations in order. Safe to run repeatedly.
    pub fn migrate(&self) -> LedgerResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_plans.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_investments.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_ledger.sql"))?;
        Ok(())
    }

    /// Run `f` as one serializable unit of work.
    ///
    /// `BEGIN IMMEDIATE` takes the write lock up front, so two units never
    /// interleave. Any error from `f` rolls everything back, and so does a
    /// panic unwinding out of `f`.
    pub fn atomically<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&Self) -> LedgerResult<T>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        let mut guard = RollbackOnDrop { store: self, armed: true };
        let value = f(self)?;
        guard.armed = false;
        if let Err(e) = self.conn.execute_batch("COMMIT") {
            self.rollback();
            return Err(e.into());
        }
        Ok(value)
    }

    fn rollback(&self) {
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            // Already rolled back by SQLite itself (e.g. after a busy COMMIT).
            log::debug!("store: rollback: {e}");
        }
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO event_log (investment_id, user_id, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.investment_id,
                entry.user_id,
                entry.event_type,
                entry.payload,
                to_millis(entry.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn record_event(
        &self,
        event: &LedgerEvent,
        user_id: Option<&str>,
        at: Timestamp,
    ) -> LedgerResult<()> {
        let entry = EventLogEntry::new(event, user_id, at)?;
        self.append_event(&entry)
    }

    pub fn events_for_investment(&self, investment_id: &str) -> LedgerResult<Vec<EventLogEntry>> {
        self.query_events(
            "SELECT id, investment_id, user_id, event_type, payload, created_at
             FROM event_log WHERE investment_id = ?1 ORDER BY id ASC",
            investment_id,
        )
    }

    pub fn events_of_type(&self, event_type: &str) -> LedgerResult<Vec<EventLogEntry>> {
        self.query_events(
            "SELECT id, investment_id, user_id, event_type, payload, created_at
             FROM event_log WHERE event_type = ?1 ORDER BY id ASC",
            event_type,
        )
    }

    fn query_events(&self, sql: &str, arg: &str) -> LedgerResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(sql)?;
        let entries = stmt
            .query_map(params![arg], |row| {
                Ok(EventLogEntry {
                    id:            Some(row.get(0)?),
                    investment_id: row.get(1)?,
                    user_id:       row.get(2)?,
                    event_type:    row.get(3)?,
                    payload:       row.get(4)?,
                    created_at:    millis_col(row, 5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Decode every logged event of one investment.
    pub fn decoded_events_for_investment(&self, investment_id: &str) -> LedgerResult<Vec<LedgerEvent>> {
        self.events_for_investment(investment_id)?
            .iter()
            .map(|e| serde_json::from_str(&e.payload).map_err(LedgerError::from))
            .collect()
    }
}

// ── Column codecs ──────────────────────────────────────────────

pub(crate) fn to_millis(t: Timestamp) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn millis_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Timestamp> {
    let ms: i64 = row.get(idx)?;
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

pub(crate) fn opt_millis_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Timestamp>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(ms) => DateTime::<Utc>::from_timestamp_millis(ms)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms)),
        None => Ok(None),
    }
}

pub(crate) fn decimal_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = UnknownVariant>,
{
    let text: String = row.get(idx)?;
    text.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Open unit of work. Dropped while armed (an error or a panic inside
/// `atomically`), it rolls the transaction back so the connection is
/// never left inside `BEGIN`.
struct RollbackOnDrop<'a> {
    store: &'a LedgerStore,
    armed: bool,
}

impl Drop for RollbackOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.store.rollback();
        }
    }
}

pub(crate) fn bool_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<bool> {
    Ok(row.get::<_, i64>(idx)? != 0)
}
