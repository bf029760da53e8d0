//! Plan catalog: definitions of investment offers.
//!
//! Plans are soft-deactivated, never deleted: historical investments must
//! always resolve their originating plan. A plan's terms are frozen as soon
//! as any investment references it; to change an offer, publish a new plan.

use crate::{
    clock::Clock,
    config::EngineConfig,
    error::{LedgerError, LedgerResult},
    event::LedgerEvent,
    store::LedgerStore,
    types::{CapitalBackBasis, EntityId, InterestType, Money, Timestamp},
};
use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The administrator-supplied terms of a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanSpec {
    pub name:          String,
    pub minimum:       Money,
    pub maximum:       Money,
    /// Percent of the base paid per cycle (2 means 2%).
    pub interest_rate: Decimal,
    pub interest_type: InterestType,
    /// Length of one accrual cycle.
    pub cycle_secs:    i64,
    #[serde(default)]
    pub capital_back: bool,
    #[serde(default)]
    pub capital_back_basis: CapitalBackBasis,
    #[serde(default)]
    pub hold_capital: bool,
    #[serde(default)]
    pub lifetime: bool,
    /// Cycles before maturity. None for lifetime plans.
    #[serde(default)]
    pub repeat_count: Option<u32>,
}

impl PlanSpec {
    pub fn validate(&self, config: &EngineConfig) -> LedgerResult<()> {
        let fail = |msg: String| Err(LedgerError::Validation(msg));

        if self.name.trim().is_empty() {
            return fail("plan name must not be empty".into());
        }
        if self.minimum <= Decimal::ZERO {
            return fail(format!("minimum must be positive (got {})", self.minimum));
        }
        if self.minimum > self.maximum {
            return fail(format!(
                "minimum ({}) must not exceed maximum ({})",
                self.minimum, self.maximum
            ));
        }
        if self.minimum.normalize().scale() > config.currency_precision
            || self.maximum.normalize().scale() > config.currency_precision
        {
            return fail(format!(
                "limits must have at most {} decimal places",
                config.currency_precision
            ));
        }
        if self.interest_rate <= Decimal::ZERO {
            return fail(format!("interest rate must be positive (got {})", self.interest_rate));
        }
        if self.cycle_secs <= 0 {
            return fail(format!("cycle length must be positive (got {}s)", self.cycle_secs));
        }
        match (self.lifetime, self.repeat_count) {
            (true, Some(_)) => return fail("lifetime plans cannot have a repeat count".into()),
            (false, None) | (false, Some(0)) => {
                return fail("non-lifetime plans need a positive repeat count".into())
            }
            _ => {}
        }
        if self.lifetime && self.capital_back {
            return fail("lifetime plans never mature, so cannot return capital".into());
        }
        Ok(())
    }

    pub fn cycle_length(&self) -> Duration {
        Duration::seconds(self.cycle_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub plan_id:    EntityId,
    #[serde(flatten)]
    pub terms:      PlanSpec,
    pub active:     bool,
    pub created_at: Timestamp,
}

impl Plan {
    pub fn accepts(&self, amount: Money) -> bool {
        amount >= self.terms.minimum && amount <= self.terms.maximum
    }
}

pub struct PlanCatalog<'a> {
    store:  &'a LedgerStore,
    config: &'a EngineConfig,
    clock:  &'a dyn Clock,
}

impl<'a> PlanCatalog<'a> {
    pub fn new(store: &'a LedgerStore, config: &'a EngineConfig, clock: &'a dyn Clock) -> Self {
        Self { store, config, clock }
    }

    pub fn create_plan(&self, spec: PlanSpec) -> LedgerResult<Plan> {
        spec.validate(self.config)?;
        let now = self.clock.now();
        let plan = Plan {
            plan_id:    Uuid::new_v4().to_string(),
            terms:      spec,
            active:     true,
            created_at: now,
        };
        self.store.atomically(|store| {
            store.insert_plan(&plan)?;
            store.record_event(
                &LedgerEvent::PlanCreated {
                    plan_id: plan.plan_id.clone(),
                    name:    plan.terms.name.clone(),
                },
                None,
                now,
            )
        })?;
        log::info!("catalog: published plan {} '{}'", plan.plan_id, plan.terms.name);
        Ok(plan)
    }

    pub fn get_plan(&self, plan_id: &str) -> LedgerResult<Plan> {
        self.store
            .get_plan(plan_id)?
            .ok_or_else(|| LedgerError::not_found("plan", plan_id))
    }

    pub fn list_active_plans(&self) -> LedgerResult<Vec<Plan>> {
        self.store.list_plans(true)
    }

    pub fn list_all_plans(&self) -> LedgerResult<Vec<Plan>> {
        self.store.list_plans(false)
    }

    /// Replace a plan's terms. Only legal while no investment references it.
    pub fn update_plan(&self, plan_id: &str, spec: PlanSpec) -> LedgerResult<Plan> {
        spec.validate(self.config)?;
        let now = self.clock.now();
        self.store.atomically(|store| {
            let mut plan = store
                .get_plan(plan_id)?
                .ok_or_else(|| LedgerError::not_found("plan", plan_id))?;
            let referenced = store.investment_count_for_plan(plan_id)?;
            if referenced > 0 {
                return Err(LedgerError::Validation(format!(
                    "plan {plan_id} is referenced by {referenced} investment(s) and is immutable"
                )));
            }
            plan.terms = spec;
            store.update_plan_terms(&plan)?;
            store.record_event(&LedgerEvent::PlanUpdated { plan_id: plan_id.to_string() }, None, now)?;
            Ok(plan)
        })
    }

    pub fn deactivate_plan(&self, plan_id: &str) -> LedgerResult<Plan> {
        self.set_active(plan_id, false)
    }

    pub fn activate_plan(&self, plan_id: &str) -> LedgerResult<Plan> {
        self.set_active(plan_id, true)
    }

    fn set_active(&self, plan_id: &str, active: bool) -> LedgerResult<Plan> {
        let now = self.clock.now();
        let plan = self.store.atomically(|store| {
            let mut plan = store
                .get_plan(plan_id)?
                .ok_or_else(|| LedgerError::not_found("plan", plan_id))?;
            if plan.active != active {
                store.set_plan_active(plan_id, active)?;
                store.record_event(
                    &LedgerEvent::PlanActivationChanged { plan_id: plan_id.to_string(), active },
                    None,
                    now,
                )?;
                plan.active = active;
            }
            Ok(plan)
        })?;
        log::info!("catalog: plan {plan_id} active={active}");
        Ok(plan)
    }
}
