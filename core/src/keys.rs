//! Idempotency key derivation.
//!
//! A key is a deterministic function of the logical event it guards, so a
//! retried or raced attempt at the same event always produces the same key
//! and the ledger's unique constraint admits it at most once.

use sha2::{Digest, Sha256};

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b":");
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Debit that funds an investment.
pub fn investment_debit(correlation_key: &str) -> String {
    digest(&["investment_debit", correlation_key])
}

/// Return credit for the cycle that starts with `cycles_completed` cycles done.
pub fn return_credit(correlation_key: &str, cycles_completed: u32) -> String {
    digest(&["return_credit", correlation_key, &cycles_completed.to_string()])
}

/// Capital returned to the user, whether at maturity or on early close.
/// One key per investment, so capital can come back at most once.
pub fn capital_back(correlation_key: &str) -> String {
    digest(&["capital_back_credit", correlation_key])
}

/// Deposit or withdrawal settled by a payment gateway, keyed by the
/// gateway's own reference.
pub fn gateway(kind: &str, reference: &str) -> String {
    digest(&["gateway", kind, reference])
}

/// Correlation key for an investment opened with a caller-supplied request key.
pub fn correlation_from_request(user_id: &str, request_key: &str) -> String {
    digest(&["open_request", user_id, request_key])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_deterministic_and_distinct_per_cycle() {
        assert_eq!(return_credit("abc", 3), return_credit("abc", 3));
        assert_ne!(return_credit("abc", 3), return_credit("abc", 4));
        assert_ne!(return_credit("abc", 0), capital_back("abc"));
        assert_eq!(investment_debit("abc").len(), 64);
    }
}
