//! Investment ledger and scheduled return engine.
//!
//! Data flow:
//!   PlanCatalog -> LifecycleManager::open -> Ledger (debit)
//!   ReturnProcessor::tick -> LifecycleManager::accrue_cycle -> Ledger (credit)
//!   BalanceService reads the ledger.

pub mod balance;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod keys;
pub mod ledger;
pub mod lifecycle;
pub mod processor;
pub mod store;
pub mod types;
