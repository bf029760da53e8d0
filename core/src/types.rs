//! Shared primitive types used across the entire engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Fixed-point money. Never floating point.
pub type Money = Decimal;

/// A stable, unique identifier for any entity in the ledger.
pub type EntityId = String;

/// Wall-clock instant, always UTC.
pub type Timestamp = DateTime<Utc>;

/// Returned when a stored enum column holds a value this build does not know.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind:  &'static str,
    pub value: String,
}

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum
/// stored as snake_case TEXT.
macro_rules! text_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(UnknownVariant { kind: $kind, value: other.to_string() }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InterestType {
    /// Every cycle pays `principal * rate`.
    Simple,
    /// Every cycle pays `accrued_value * rate`; the accrued value grows by
    /// each cycle's return.
    Compounding,
}

text_enum!(InterestType, "interest type", {
    Simple      => "simple",
    Compounding => "compounding",
});

/// What a capital-back credit returns at maturity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum CapitalBackBasis {
    #[default]
    Principal,
    AccruedValue,
}

text_enum!(CapitalBackBasis, "capital-back basis", {
    Principal    => "principal",
    AccruedValue => "accrued_value",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InvestmentStatus {
    Active,
    Paused,
    Matured,
    Closed,
}

text_enum!(InvestmentStatus, "investment status", {
    Active  => "active",
    Paused  => "paused",
    Matured => "matured",
    Closed  => "closed",
});

impl InvestmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvestmentStatus::Matured | InvestmentStatus::Closed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    InvestmentDebit,
    ReturnCredit,
    CapitalBackCredit,
    Bonus,
}

text_enum!(TransactionType, "transaction type", {
    Deposit           => "deposit",
    Withdrawal        => "withdrawal",
    InvestmentDebit   => "investment_debit",
    ReturnCredit      => "return_credit",
    CapitalBackCredit => "capital_back_credit",
    Bonus             => "bonus",
});

impl TransactionType {
    /// Debits carry negative amounts, everything else positive.
    pub fn is_debit(&self) -> bool {
        matches!(self, TransactionType::Withdrawal | TransactionType::InvestmentDebit)
    }
}
