use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use creditnet_rs::types::{Pid, TrustPolicy};
use creditnet_rs::GeoError;

// Note: We use String for amount fields to avoid BigDecimal/sqlx version
// conflicts. The database stores amounts as NUMERIC(38,18). When inserting we
// cast text to NUMERIC in the SQL query ($1::NUMERIC); when reading, the
// SELECT lists cast NUMERIC back to TEXT.

/// A registered participant
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ParticipantRow {
    pub pid: String,
    pub public_key: Vec<u8>,
    pub display_name: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A unit of account
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EquivalentRow {
    pub code: String,
    pub precision: i16,
    pub description: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// A directed credit line from lender to borrower
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TrustLineRow {
    pub id: i64,
    pub from_participant: String,
    pub to_participant: String,
    pub equivalent: String,
    pub limit_amount: String,
    pub auto_clearing: bool,
    pub can_be_intermediate: bool,
    pub blocked_participants: serde_json::Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrustLineRow {
    /// Reassemble the policy document from its columns.
    pub fn policy(&self) -> Result<TrustPolicy, GeoError> {
        let blocked: std::collections::BTreeSet<Pid> =
            serde_json::from_value(self.blocked_participants.clone()).map_err(|e| {
                GeoError::Storage(format!(
                    "trust line {} has malformed blocked_participants: {e}",
                    self.id
                ))
            })?;
        Ok(TrustPolicy {
            auto_clearing: self.auto_clearing,
            can_be_intermediate: self.can_be_intermediate,
            blocked_participants: blocked,
        })
    }
}

/// A directed debt edge
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DebtRow {
    pub id: i64,
    pub debtor: String,
    pub creditor: String,
    pub equivalent: String,
    pub amount: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The audit record of a state-changing operation
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TransactionRow {
    pub tx_id: Uuid,
    pub tx_type: String,
    pub initiator: Option<String>,
    pub payload: serde_json::Value,
    pub signatures: serde_json::Value,
    pub state: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
}

/// A capacity reservation held between prepare and commit
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PrepareLockRow {
    pub id: i64,
    pub tx_id: Uuid,
    pub debtor: String,
    pub creditor: String,
    pub equivalent: String,
    pub amount: String,
    pub segment_key: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit entry
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AuditRow {
    pub id: i64,
    pub actor: Option<String>,
    pub action: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Per-equivalent aggregate for the balance summary endpoint
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BalanceRow {
    pub equivalent: String,
    pub total_debt: String,
    pub total_credit: String,
}
