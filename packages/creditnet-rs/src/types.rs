//! Core identifiers and status enums.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::GeoError;

/// Participant identifier: base58(sha256(public_key)).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pid(String);

impl Pid {
    /// Validate an externally supplied pid (base58 alphabet, sane length).
    pub fn parse(s: &str) -> Result<Self, GeoError> {
        if s.len() < 32 || s.len() > 50 {
            return Err(GeoError::Validation(format!("pid has bad length: {s:?}")));
        }
        if bs58::decode(s).into_vec().is_err() {
            return Err(GeoError::Validation(format!("pid is not base58: {s:?}")));
        }
        Ok(Pid(s.to_string()))
    }

    /// Derive the pid from the raw Ed25519 public key bytes.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        Pid(bs58::encode(digest).into_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unit-of-account code: `A-Z0-9_`, 1 to 16 chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EquivalentCode(String);

impl EquivalentCode {
    pub fn parse(s: &str) -> Result<Self, GeoError> {
        if s.is_empty() || s.len() > 16 {
            return Err(GeoError::Validation(format!(
                "equivalent code must be 1-16 chars: {s:?}"
            )));
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
        {
            return Err(GeoError::Validation(format!(
                "equivalent code must match [A-Z0-9_]: {s:?}"
            )));
        }
        Ok(EquivalentCode(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EquivalentCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Participant lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Active,
    Suspended,
    Left,
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantStatus::Active => "active",
            ParticipantStatus::Suspended => "suspended",
            ParticipantStatus::Left => "left",
        }
    }

    pub fn parse(s: &str) -> Result<Self, GeoError> {
        match s {
            "active" => Ok(ParticipantStatus::Active),
            "suspended" => Ok(ParticipantStatus::Suspended),
            "left" => Ok(ParticipantStatus::Left),
            other => Err(GeoError::Validation(format!(
                "unknown participant status: {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Trust line lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLineStatus {
    Pending,
    Active,
    Frozen,
    Closed,
}

impl TrustLineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLineStatus::Pending => "pending",
            TrustLineStatus::Active => "active",
            TrustLineStatus::Frozen => "frozen",
            TrustLineStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, GeoError> {
        match s {
            "pending" => Ok(TrustLineStatus::Pending),
            "active" => Ok(TrustLineStatus::Active),
            "frozen" => Ok(TrustLineStatus::Frozen),
            "closed" => Ok(TrustLineStatus::Closed),
            other => Err(GeoError::Validation(format!(
                "unknown trust line status: {other:?}"
            ))),
        }
    }
}

impl fmt::Display for TrustLineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transaction state machine.
///
/// Legal transitions: NEW -> PREPARED, PREPARED -> COMMITTED,
/// NEW -> ABORTED, PREPARED -> ABORTED. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxState {
    New,
    Prepared,
    Committed,
    Aborted,
}

impl TxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::New => "NEW",
            TxState::Prepared => "PREPARED",
            TxState::Committed => "COMMITTED",
            TxState::Aborted => "ABORTED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, GeoError> {
        match s {
            "NEW" => Ok(TxState::New),
            "PREPARED" => Ok(TxState::Prepared),
            "COMMITTED" => Ok(TxState::Committed),
            "ABORTED" => Ok(TxState::Aborted),
            other => Err(GeoError::Validation(format!(
                "unknown transaction state: {other:?}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Committed | TxState::Aborted)
    }

    pub fn can_transition_to(&self, next: TxState) -> bool {
        matches!(
            (self, next),
            (TxState::New, TxState::Prepared)
                | (TxState::New, TxState::Aborted)
                | (TxState::Prepared, TxState::Committed)
                | (TxState::Prepared, TxState::Aborted)
        )
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transaction kind. The column is open-ended in the store so further kinds
/// can be added without a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxType {
    Payment,
    Clearing,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::Payment => "PAYMENT",
            TxType::Clearing => "CLEARING",
        }
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Trust line policy document. Tagged record with a closed field set;
/// unknown fields in incoming documents are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustPolicy {
    #[serde(default = "default_true")]
    pub auto_clearing: bool,
    #[serde(default = "default_true")]
    pub can_be_intermediate: bool,
    #[serde(default)]
    pub blocked_participants: BTreeSet<Pid>,
}

fn default_true() -> bool {
    true
}

impl Default for TrustPolicy {
    fn default() -> Self {
        TrustPolicy {
            auto_clearing: true,
            can_be_intermediate: true,
            blocked_participants: BTreeSet::new(),
        }
    }
}

impl TrustPolicy {
    pub fn blocks(&self, pid: &Pid) -> bool {
        self.blocked_participants.contains(pid)
    }
}

/// A directed payment segment: the debtor owes the creditor in one
/// equivalent. Identity of the underlying credit relationship is direction
/// agnostic, which is what the fingerprint encodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentRef {
    pub debtor: Pid,
    pub creditor: Pid,
    pub equivalent: EquivalentCode,
}

impl SegmentRef {
    /// sha256 over (equivalent, sorted pid pair). Both directions of the same
    /// relationship map to the same fingerprint, so concurrent prepares on
    /// either direction serialize against each other.
    pub fn fingerprint(&self) -> [u8; 32] {
        let (lo, hi) = if self.debtor <= self.creditor {
            (&self.debtor, &self.creditor)
        } else {
            (&self.creditor, &self.debtor)
        };
        let mut hasher = Sha256::new();
        hasher.update(self.equivalent.as_str().as_bytes());
        hasher.update([0x1f]);
        hasher.update(lo.as_str().as_bytes());
        hasher.update([0x1f]);
        hasher.update(hi.as_str().as_bytes());
        hasher.finalize().into()
    }

    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint())
    }

    /// Advisory lock key: first 8 bytes of the fingerprint as a big-endian
    /// i64. A collision over-serializes two unrelated segments, which is
    /// harmless; it can never under-lock.
    pub fn advisory_key(&self) -> i64 {
        let fp = self.fingerprint();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&fp[..8]);
        i64::from_be_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(tag: u8) -> Pid {
        Pid::from_public_key(&[tag; 32])
    }

    #[test]
    fn test_pid_derivation_is_deterministic() {
        let a = Pid::from_public_key(&[1u8; 32]);
        let b = Pid::from_public_key(&[1u8; 32]);
        assert_eq!(a, b);
        assert_ne!(a, Pid::from_public_key(&[2u8; 32]));
        // Round-trips through validation
        assert!(Pid::parse(a.as_str()).is_ok());
    }

    #[test]
    fn test_pid_rejects_non_base58() {
        assert!(Pid::parse("0OIl+000000000000000000000000000000").is_err());
        assert!(Pid::parse("short").is_err());
    }

    #[test]
    fn test_equivalent_code_validation() {
        assert!(EquivalentCode::parse("USD").is_ok());
        assert!(EquivalentCode::parse("KWH_2024").is_ok());
        assert!(EquivalentCode::parse("").is_err());
        assert!(EquivalentCode::parse("usd").is_err());
        assert!(EquivalentCode::parse("TOO_LONG_CODE_ABC").is_err());
        assert!(EquivalentCode::parse("EU-RO").is_err());
    }

    #[test]
    fn test_tx_state_transitions() {
        assert!(TxState::New.can_transition_to(TxState::Prepared));
        assert!(TxState::New.can_transition_to(TxState::Aborted));
        assert!(TxState::Prepared.can_transition_to(TxState::Committed));
        assert!(TxState::Prepared.can_transition_to(TxState::Aborted));
        assert!(!TxState::New.can_transition_to(TxState::Committed));
        assert!(!TxState::Committed.can_transition_to(TxState::Aborted));
        assert!(!TxState::Aborted.can_transition_to(TxState::Prepared));
    }

    #[test]
    fn test_segment_fingerprint_direction_agnostic() {
        let usd = EquivalentCode::parse("USD").unwrap();
        let ab = SegmentRef {
            debtor: pid(1),
            creditor: pid(2),
            equivalent: usd.clone(),
        };
        let ba = SegmentRef {
            debtor: pid(2),
            creditor: pid(1),
            equivalent: usd.clone(),
        };
        assert_eq!(ab.fingerprint(), ba.fingerprint());
        assert_eq!(ab.advisory_key(), ba.advisory_key());

        let eur = EquivalentCode::parse("EUR").unwrap();
        let ab_eur = SegmentRef {
            debtor: pid(1),
            creditor: pid(2),
            equivalent: eur,
        };
        assert_ne!(ab.fingerprint(), ab_eur.fingerprint());
    }

    #[test]
    fn test_policy_rejects_unknown_fields() {
        let ok: Result<TrustPolicy, _> =
            serde_json::from_str(r#"{"auto_clearing": false, "can_be_intermediate": true}"#);
        assert!(ok.is_ok());
        assert!(!ok.unwrap().auto_clearing);

        let bad: Result<TrustPolicy, _> =
            serde_json::from_str(r#"{"auto_clearing": true, "max_per_day": "100"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_policy_defaults() {
        let p: TrustPolicy = serde_json::from_str("{}").unwrap();
        assert!(p.auto_clearing);
        assert!(p.can_be_intermediate);
        assert!(p.blocked_participants.is_empty());
    }
}
