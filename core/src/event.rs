//! The audit event log.
//!
//! RULE: Every state transition appends exactly the events describing it,
//! inside the same unit of work as the transition. Events are written for
//! audit and reporting only; no business decision ever reads them back.

use crate::types::{EntityId, Money, Timestamp};
use serde::{Deserialize, Serialize};

/// Variants are added over time, never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    // ── Plan catalog ───────────────────────────────
    PlanCreated {
        plan_id: EntityId,
        name:    String,
    },
    PlanUpdated {
        plan_id: EntityId,
    },
    PlanActivationChanged {
        plan_id: EntityId,
        active:  bool,
    },

    // ── Investment lifecycle ───────────────────────
    InvestmentOpened {
        investment_id: EntityId,
        user_id:       EntityId,
        plan_id:       EntityId,
        principal:     Money,
        next_due_at:   Timestamp,
    },
    ReturnCredited {
        investment_id: EntityId,
        cycle:         u32,
        amount:        Money,
    },
    CapitalReturned {
        investment_id: EntityId,
        amount:        Money,
    },
    InvestmentMatured {
        investment_id:    EntityId,
        cycles_completed: u32,
    },
    InvestmentPaused {
        investment_id: EntityId,
    },
    InvestmentResumed {
        investment_id: EntityId,
        next_due_at:   Timestamp,
    },
    InvestmentClosed {
        investment_id:  EntityId,
        reason:         String,
        admin_override: bool,
    },

    // ── Reconciliation ─────────────────────────────
    BalanceDriftDetected {
        user_id: EntityId,
        source:  String, // "cache" | "post_balance"
        stored:  Money,
        derived: Money,
    },
}

impl LedgerEvent {
    /// Stable name for the event_type column.
    pub fn type_name(&self) -> &'static str {
        match self {
            LedgerEvent::PlanCreated { .. }           => "plan_created",
            LedgerEvent::PlanUpdated { .. }           => "plan_updated",
            LedgerEvent::PlanActivationChanged { .. } => "plan_activation_changed",
            LedgerEvent::InvestmentOpened { .. }      => "investment_opened",
            LedgerEvent::ReturnCredited { .. }        => "return_credited",
            LedgerEvent::CapitalReturned { .. }       => "capital_returned",
            LedgerEvent::InvestmentMatured { .. }     => "investment_matured",
            LedgerEvent::InvestmentPaused { .. }      => "investment_paused",
            LedgerEvent::InvestmentResumed { .. }     => "investment_resumed",
            LedgerEvent::InvestmentClosed { .. }      => "investment_closed",
            LedgerEvent::BalanceDriftDetected { .. }  => "balance_drift_detected",
        }
    }

    pub fn investment_id(&self) -> Option<&str> {
        match self {
            LedgerEvent::InvestmentOpened { investment_id, .. }
            | LedgerEvent::ReturnCredited { investment_id, .. }
            | LedgerEvent::CapitalReturned { investment_id, .. }
            | LedgerEvent::InvestmentMatured { investment_id, .. }
            | LedgerEvent::InvestmentPaused { investment_id }
            | LedgerEvent::InvestmentResumed { investment_id, .. }
            | LedgerEvent::InvestmentClosed { investment_id, .. } => Some(investment_id),
            _ => None,
        }
    }
}

/// One persisted row of the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id:            Option<i64>,
    pub investment_id: Option<EntityId>,
    pub user_id:       Option<EntityId>,
    pub event_type:    String,
    pub payload:       String,
    pub created_at:    Timestamp,
}

impl EventLogEntry {
    pub fn new(event: &LedgerEvent, user_id: Option<&str>, at: Timestamp) -> serde_json::Result<Self> {
        Ok(Self {
            id:            None,
            investment_id: event.investment_id().map(str::to_string),
            user_id:       user_id.map(str::to_string),
            event_type:    event.type_name().to_string(),
            payload:       serde_json::to_string(event)?,
            created_at:    at,
        })
    }
}
