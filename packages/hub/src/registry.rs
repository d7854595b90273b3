//! Participants and equivalents.

use serde_json::json;
use sqlx::PgPool;
use tracing::info;

use creditnet_rs::error::GeoError;
use creditnet_rs::payloads::RegisterPayload;
use creditnet_rs::signing;
use creditnet_rs::types::{EquivalentCode, ParticipantStatus, Pid};

use crate::db;

#[derive(Clone)]
pub struct RegistryService {
    pool: PgPool,
}

impl RegistryService {
    pub fn new(pool: PgPool) -> Self {
        RegistryService { pool }
    }

    /// Register a participant. The payload is signed with the key being
    /// registered, and the pid is derived from that key, never supplied.
    /// Re-registering the same key returns the existing record.
    pub async fn register_participant(
        &self,
        payload: RegisterPayload,
        signature: &str,
    ) -> Result<db::ParticipantRow, GeoError> {
        let key = signing::decode_public_key(&payload.public_key)?;
        signing::verify_payload(&key, &payload, signature)?;

        let pid = Pid::from_public_key(key.as_bytes());
        let inserted = db::insert_participant(
            &self.pool,
            pid.as_str(),
            key.as_bytes(),
            payload.display_name.as_deref(),
        )
        .await
        .map_err(storage)?;

        if inserted {
            db::insert_audit(
                &self.pool,
                Some(pid.as_str()),
                "participant.register",
                &json!({ "display_name": payload.display_name }),
            )
            .await
            .map_err(storage)?;
            info!(%pid, "participant registered");
        }

        db::get_participant(&self.pool, pid.as_str())
            .await
            .map_err(storage)?
            .ok_or_else(|| GeoError::Storage(format!("participant {pid} vanished after insert")))
    }

    /// Operator action: suspend, reactivate, or retire a participant.
    pub async fn set_participant_status(
        &self,
        pid: &Pid,
        status: ParticipantStatus,
        actor: Option<&str>,
    ) -> Result<(), GeoError> {
        let updated = db::set_participant_status(&self.pool, pid.as_str(), status.as_str())
            .await
            .map_err(storage)?;
        if !updated {
            return Err(GeoError::NotFound(format!("participant {pid}")));
        }
        db::insert_audit(
            &self.pool,
            actor,
            "participant.set_status",
            &json!({ "pid": pid, "status": status.as_str() }),
        )
        .await
        .map_err(storage)?;
        info!(%pid, status = status.as_str(), "participant status changed");
        Ok(())
    }

    /// Operator action: create an equivalent.
    pub async fn create_equivalent(
        &self,
        code: &EquivalentCode,
        precision: u32,
        description: Option<&str>,
        actor: Option<&str>,
    ) -> Result<db::EquivalentRow, GeoError> {
        if precision > 18 {
            return Err(GeoError::Validation(
                "precision must be between 0 and 18".into(),
            ));
        }
        let inserted = db::insert_equivalent(&self.pool, code.as_str(), precision as i16, description)
            .await
            .map_err(storage)?;
        if !inserted {
            return Err(GeoError::Validation(format!(
                "equivalent {code} already exists"
            )));
        }
        db::insert_audit(
            &self.pool,
            actor,
            "equivalent.create",
            &json!({ "code": code, "precision": precision }),
        )
        .await
        .map_err(storage)?;
        info!(%code, precision, "equivalent created");

        db::get_equivalent(&self.pool, code.as_str())
            .await
            .map_err(storage)?
            .ok_or_else(|| GeoError::Storage(format!("equivalent {code} vanished after insert")))
    }
}

fn storage(e: eyre::Report) -> GeoError {
    GeoError::Storage(format!("{e:#}"))
}
