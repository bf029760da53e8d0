use crate::types::{InvestmentStatus, Money, Timestamp};
use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    /// Malformed plan, amount or request. Raised before any mutation.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Insufficient funds for {user_id} in wallet '{wallet}': need {required}, have {available}")]
    InsufficientFunds {
        user_id:   String,
        wallet:    String,
        required:  Money,
        available: Money,
    },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Investment '{investment_id}' holds capital until maturity")]
    CapitalLocked { investment_id: String },

    /// Idempotency key already committed. Callers treat this as success
    /// and read back the existing row.
    #[error("Idempotency key '{key}' already committed")]
    Duplicate { key: String },

    #[error("Cannot {action} investment '{investment_id}' while {from}")]
    InvalidTransition {
        investment_id: String,
        from:          InvestmentStatus,
        action:        &'static str,
    },

    #[error("Investment '{investment_id}' is not due until {next_due_at}")]
    NotDue {
        investment_id: String,
        next_due_at:   Timestamp,
    },

    /// Busy/locked database or an exhausted storage timeout. Retryable.
    #[error("Transient storage error: {0}")]
    TransientStorage(String),

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::TransientStorage(_))
    }

    pub(crate) fn not_found(entity: &'static str, id: &str) -> Self {
        LedgerError::NotFound { entity, id: id.to_string() }
    }

    /// A money value left the range `Decimal` can represent.
    pub(crate) fn overflow(what: &str) -> Self {
        LedgerError::Validation(format!("{what} overflows the money range"))
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                LedgerError::TransientStorage(e.to_string())
            }
            _ => LedgerError::Database(e),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
