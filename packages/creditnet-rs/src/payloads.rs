//! Signed payload shapes.
//!
//! Every mutating operation carries one of these, serialized canonically and
//! signed with the owner's Ed25519 key. Field sets are closed: unknown keys
//! in an incoming signed payload are a verification failure, not an
//! extension point.

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::types::{EquivalentCode, Pid, TrustPolicy};

/// Participant registration, signed with the key being registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterPayload {
    /// Base64 Ed25519 public key; the pid is derived from it, never supplied.
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Trust line creation, signed by the lender (`from`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustLinePayload {
    pub from: Pid,
    pub to: Pid,
    pub equivalent: EquivalentCode,
    pub limit: Amount,
    pub policy: TrustPolicy,
}

/// Trust line update, signed by the lender. Omitted fields keep their value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustLineUpdatePayload {
    pub from: Pid,
    pub to: Pid,
    pub equivalent: EquivalentCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Amount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<TrustPolicy>,
}

/// Trust line close, signed by the lender.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustLineClosePayload {
    pub from: Pid,
    pub to: Pid,
    pub equivalent: EquivalentCode,
}

/// Payment creation, signed by the sender (`from`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaymentPayload {
    pub from: Pid,
    pub to: Pid,
    pub equivalent: EquivalentCode,
    pub amount: Amount,
    /// Client-chosen replay guard, unique per sender.
    pub nonce: String,
    /// RFC 3339 issue time, recorded for audit.
    pub issued_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_payload_rejects_unknown_keys() {
        let ok = r#"{"from":"4Vho6nJKEN2qT6pUQ1DpSf8W2LH9uYtPyyQHKvPLBoSM",
                     "to":"8Z4ky1s3BNF4abnEGpRYyLRJT8W5C7vLFhH5wZaVQTtE",
                     "equivalent":"USD","amount":"50","nonce":"n-1",
                     "issued_at":"2024-01-01T00:00:00Z"}"#;
        assert!(serde_json::from_str::<PaymentPayload>(ok).is_ok());

        let extra = r#"{"from":"4Vho6nJKEN2qT6pUQ1DpSf8W2LH9uYtPyyQHKvPLBoSM",
                        "to":"8Z4ky1s3BNF4abnEGpRYyLRJT8W5C7vLFhH5wZaVQTtE",
                        "equivalent":"USD","amount":"50","nonce":"n-1",
                        "issued_at":"2024-01-01T00:00:00Z","fee":"1"}"#;
        assert!(serde_json::from_str::<PaymentPayload>(extra).is_err());
    }

    #[test]
    fn test_update_payload_partial_fields() {
        let v = r#"{"from":"4Vho6nJKEN2qT6pUQ1DpSf8W2LH9uYtPyyQHKvPLBoSM",
                    "to":"8Z4ky1s3BNF4abnEGpRYyLRJT8W5C7vLFhH5wZaVQTtE",
                    "equivalent":"USD","limit":"200"}"#;
        let p: TrustLineUpdatePayload = serde_json::from_str(v).unwrap();
        assert!(p.limit.is_some());
        assert!(p.policy.is_none());
    }
}
