//! The closed domain-error taxonomy.
//!
//! Domain errors are a stable, enumerable set surfaced to clients as a code
//! plus message. Infrastructure failures (connectivity, SQL) travel as
//! `Storage` so callers can distinguish them from protocol outcomes.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum GeoError {
    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("nonce has already been used")]
    ReplayNonce,

    #[error("participant {0} is not active")]
    InactiveParticipant(String),

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("equivalent {0} is not active")]
    EquivalentInactive(String),

    #[error("idempotency key reused with different parameters")]
    IdempotencyConflict,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl GeoError {
    /// Stable wire code for the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            GeoError::InsufficientCapacity(_) => "InsufficientCapacity",
            GeoError::InvalidSignature => "InvalidSignature",
            GeoError::ReplayNonce => "ReplayNonce",
            GeoError::InactiveParticipant(_) => "InactiveParticipant",
            GeoError::PolicyDenied(_) => "PolicyDenied",
            GeoError::Timeout(_) => "Timeout",
            GeoError::InvariantViolation(_) => "InvariantViolation",
            GeoError::EquivalentInactive(_) => "EquivalentInactive",
            GeoError::IdempotencyConflict => "IdempotencyConflict",
            GeoError::NotFound(_) => "NotFound",
            GeoError::Validation(_) => "Validation",
            GeoError::Storage(_) => "Storage",
        }
    }

    /// Signature, policy, and participant-status failures are final; the
    /// engine never retries them on behalf of the client.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            GeoError::InvalidSignature
                | GeoError::ReplayNonce
                | GeoError::InactiveParticipant(_)
                | GeoError::PolicyDenied(_)
                | GeoError::EquivalentInactive(_)
                | GeoError::IdempotencyConflict
                | GeoError::Validation(_)
        )
    }

    /// True for failures of the machinery rather than the protocol.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, GeoError::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            GeoError::InsufficientCapacity("x".into()).code(),
            "InsufficientCapacity"
        );
        assert_eq!(GeoError::InvalidSignature.code(), "InvalidSignature");
        assert_eq!(GeoError::ReplayNonce.code(), "ReplayNonce");
        assert_eq!(GeoError::Timeout("t".into()).code(), "Timeout");
    }

    #[test]
    fn test_permanent_classification() {
        assert!(GeoError::InvalidSignature.is_permanent());
        assert!(GeoError::PolicyDenied("blocked".into()).is_permanent());
        assert!(!GeoError::InsufficientCapacity("x".into()).is_permanent());
        assert!(!GeoError::Timeout("t".into()).is_permanent());
        assert!(!GeoError::Storage("db".into()).is_permanent());
    }
}
