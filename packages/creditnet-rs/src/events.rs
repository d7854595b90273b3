//! Events emitted by the hub after state-changing commits.
//!
//! Ordering within a single participant's stream is causal: events are
//! published from inside the committing call path, after the database
//! transaction has committed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{EquivalentCode, Pid};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HubEvent {
    #[serde(rename = "payment.committed")]
    PaymentCommitted {
        tx_id: Uuid,
        from: Pid,
        to: Pid,
        equivalent: EquivalentCode,
        amount: String,
        at: DateTime<Utc>,
    },
    #[serde(rename = "payment.aborted")]
    PaymentAborted {
        tx_id: Uuid,
        from: Pid,
        to: Pid,
        equivalent: EquivalentCode,
        amount: String,
        reason: String,
        at: DateTime<Utc>,
    },
    #[serde(rename = "clearing.committed")]
    ClearingCommitted {
        tx_id: Uuid,
        equivalent: EquivalentCode,
        cycle: Vec<Pid>,
        delta: String,
        at: DateTime<Utc>,
    },
    #[serde(rename = "trustline.updated")]
    TrustlineUpdated {
        audit_id: i64,
        from: Pid,
        to: Pid,
        equivalent: EquivalentCode,
        at: DateTime<Utc>,
    },
}

impl HubEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            HubEvent::PaymentCommitted { .. } => "payment.committed",
            HubEvent::PaymentAborted { .. } => "payment.aborted",
            HubEvent::ClearingCommitted { .. } => "clearing.committed",
            HubEvent::TrustlineUpdated { .. } => "trustline.updated",
        }
    }

    /// Participants whose streams this event belongs to.
    pub fn affected_pids(&self) -> Vec<&Pid> {
        match self {
            HubEvent::PaymentCommitted { from, to, .. }
            | HubEvent::PaymentAborted { from, to, .. }
            | HubEvent::TrustlineUpdated { from, to, .. } => vec![from, to],
            HubEvent::ClearingCommitted { cycle, .. } => cycle.iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pid;

    #[test]
    fn test_event_tag_names() {
        let e = HubEvent::PaymentCommitted {
            tx_id: Uuid::nil(),
            from: Pid::from_public_key(&[1; 32]),
            to: Pid::from_public_key(&[2; 32]),
            equivalent: EquivalentCode::parse("USD").unwrap(),
            amount: "50".into(),
            at: Utc::now(),
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "payment.committed");
        assert_eq!(e.kind(), "payment.committed");
        assert_eq!(e.affected_pids().len(), 2);
    }
}
