//! Trust line lifecycle: create, update, close.
//!
//! Every change is signed by the lender. Limit reductions are checked
//! against the outstanding debt under a row lock so an update can never
//! leave a debt above its backing limit, and closing requires both
//! directions of debt between the pair to be zero.

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use tracing::info;

use creditnet_rs::amount::Amount;
use creditnet_rs::error::GeoError;
use creditnet_rs::events::HubEvent;
use creditnet_rs::payloads::{TrustLineClosePayload, TrustLinePayload, TrustLineUpdatePayload};
use creditnet_rs::signing;
use creditnet_rs::types::TrustPolicy;

use crate::db;
use crate::events::EventBus;

#[derive(Clone)]
pub struct TrustLineService {
    pool: PgPool,
    events: EventBus,
}

impl TrustLineService {
    pub fn new(pool: PgPool, events: EventBus) -> Self {
        TrustLineService { pool, events }
    }

    /// Create a trust line (signed by the lender). The line is active
    /// immediately; debts can flow against it from the next payment on.
    pub async fn create(
        &self,
        payload: TrustLinePayload,
        signature: &str,
    ) -> Result<db::TrustLineRow, GeoError> {
        if payload.from == payload.to {
            return Err(GeoError::Validation(
                "lender and borrower must differ".into(),
            ));
        }
        if payload.limit.is_negative() {
            return Err(GeoError::Validation("limit must be non-negative".into()));
        }

        let lender = self.active_participant(payload.from.as_str()).await?;
        self.active_participant(payload.to.as_str()).await?;
        let equivalent = db::get_equivalent(&self.pool, payload.equivalent.as_str())
            .await
            .map_err(storage)?
            .ok_or_else(|| GeoError::NotFound(format!("equivalent {}", payload.equivalent)))?;
        if !equivalent.active {
            return Err(GeoError::EquivalentInactive(payload.equivalent.to_string()));
        }
        payload.limit.check_precision(equivalent.precision as u32)?;

        let key = signing::public_key_from_bytes(&lender.public_key)?;
        signing::verify_payload(&key, &payload, signature)?;

        let blocked = serde_json::to_value(&payload.policy.blocked_participants)
            .map_err(|e| GeoError::Validation(format!("malformed policy: {e}")))?;
        let id = db::insert_trust_line(
            &self.pool,
            payload.from.as_str(),
            payload.to.as_str(),
            payload.equivalent.as_str(),
            &payload.limit.canonical(),
            payload.policy.auto_clearing,
            payload.policy.can_be_intermediate,
            &blocked,
        )
        .await
        .map_err(storage)?
        .ok_or_else(|| {
            GeoError::Validation(format!(
                "trust line {} -> {} in {} already exists",
                payload.from, payload.to, payload.equivalent
            ))
        })?;

        let audit_id = db::insert_audit(
            &self.pool,
            Some(payload.from.as_str()),
            "trustline.create",
            &json!({
                "to": payload.to,
                "equivalent": payload.equivalent,
                "limit": payload.limit,
            }),
        )
        .await
        .map_err(storage)?;

        info!(
            from = %payload.from,
            to = %payload.to,
            equivalent = %payload.equivalent,
            limit = %payload.limit,
            "trust line created"
        );
        self.events.emit(HubEvent::TrustlineUpdated {
            audit_id,
            from: payload.from.clone(),
            to: payload.to.clone(),
            equivalent: payload.equivalent.clone(),
            at: Utc::now(),
        });

        db::get_trust_line(
            &self.pool,
            payload.from.as_str(),
            payload.to.as_str(),
            payload.equivalent.as_str(),
        )
        .await
        .map_err(storage)?
        .ok_or_else(|| GeoError::Storage(format!("trust line {id} vanished after insert")))
    }

    /// Update limit and/or policy (signed by the lender). A limit below the
    /// outstanding borrower debt would break the trust-limit invariant and
    /// is rejected.
    pub async fn update(
        &self,
        payload: TrustLineUpdatePayload,
        signature: &str,
    ) -> Result<db::TrustLineRow, GeoError> {
        let lender = self.active_participant(payload.from.as_str()).await?;
        let key = signing::public_key_from_bytes(&lender.public_key)?;
        signing::verify_payload(&key, &payload, signature)?;

        let equivalent = db::get_equivalent(&self.pool, payload.equivalent.as_str())
            .await
            .map_err(storage)?
            .ok_or_else(|| GeoError::NotFound(format!("equivalent {}", payload.equivalent)))?;
        if let Some(limit) = &payload.limit {
            if limit.is_negative() {
                return Err(GeoError::Validation("limit must be non-negative".into()));
            }
            limit.check_precision(equivalent.precision as u32)?;
        }

        let mut dbtx = self.pool.begin().await.map_err(sql_storage)?;
        let line = db::get_trust_line(
            &mut *dbtx,
            payload.from.as_str(),
            payload.to.as_str(),
            payload.equivalent.as_str(),
        )
        .await
        .map_err(storage)?
        .ok_or_else(|| {
            GeoError::NotFound(format!(
                "trust line {} -> {} in {}",
                payload.from, payload.to, payload.equivalent
            ))
        })?;
        if line.status == "closed" {
            return Err(GeoError::Validation("trust line is closed".into()));
        }

        let new_limit = match &payload.limit {
            Some(limit) => limit.clone(),
            None => Amount::parse(&line.limit_amount)?,
        };
        let new_policy: TrustPolicy = match &payload.policy {
            Some(policy) => policy.clone(),
            None => line.policy()?,
        };

        // The borrower's outstanding debt bounds how far the limit may drop
        let outstanding = db::get_debt_for_update(
            &mut dbtx,
            payload.to.as_str(),
            payload.from.as_str(),
            payload.equivalent.as_str(),
        )
        .await
        .map_err(storage)?;
        if let Some(debt) = outstanding {
            let owed = Amount::parse(&debt.amount)?;
            if new_limit < owed {
                return Err(GeoError::Validation(format!(
                    "limit {} is below the outstanding debt {}",
                    new_limit.canonical(),
                    owed.canonical()
                )));
            }
        }

        let blocked = serde_json::to_value(&new_policy.blocked_participants)
            .map_err(|e| GeoError::Validation(format!("malformed policy: {e}")))?;
        db::update_trust_line(
            &mut *dbtx,
            line.id,
            &new_limit.canonical(),
            new_policy.auto_clearing,
            new_policy.can_be_intermediate,
            &blocked,
        )
        .await
        .map_err(storage)?;
        let audit_id = db::insert_audit(
            &mut *dbtx,
            Some(payload.from.as_str()),
            "trustline.update",
            &json!({
                "to": payload.to,
                "equivalent": payload.equivalent,
                "limit": new_limit.canonical(),
            }),
        )
        .await
        .map_err(storage)?;
        dbtx.commit().await.map_err(sql_storage)?;

        info!(
            from = %payload.from,
            to = %payload.to,
            equivalent = %payload.equivalent,
            limit = %new_limit,
            "trust line updated"
        );
        self.events.emit(HubEvent::TrustlineUpdated {
            audit_id,
            from: payload.from.clone(),
            to: payload.to.clone(),
            equivalent: payload.equivalent.clone(),
            at: Utc::now(),
        });

        db::get_trust_line(
            &self.pool,
            payload.from.as_str(),
            payload.to.as_str(),
            payload.equivalent.as_str(),
        )
        .await
        .map_err(storage)?
        .ok_or_else(|| GeoError::Storage("trust line vanished after update".into()))
    }

    /// Close a trust line (signed by the lender). Permitted only when both
    /// directions of debt between the pair are zero, which with deleted zero
    /// rows means: no row exists either way.
    pub async fn close(
        &self,
        payload: TrustLineClosePayload,
        signature: &str,
    ) -> Result<(), GeoError> {
        let lender = self.active_participant(payload.from.as_str()).await?;
        let key = signing::public_key_from_bytes(&lender.public_key)?;
        signing::verify_payload(&key, &payload, signature)?;

        let mut dbtx = self.pool.begin().await.map_err(sql_storage)?;
        let line = db::get_trust_line(
            &mut *dbtx,
            payload.from.as_str(),
            payload.to.as_str(),
            payload.equivalent.as_str(),
        )
        .await
        .map_err(storage)?
        .ok_or_else(|| {
            GeoError::NotFound(format!(
                "trust line {} -> {} in {}",
                payload.from, payload.to, payload.equivalent
            ))
        })?;
        if line.status == "closed" {
            return Ok(()); // already closed, idempotent
        }

        // Lock both directions so a concurrent commit cannot slip a debt in
        let forward = db::get_debt_for_update(
            &mut dbtx,
            payload.from.as_str(),
            payload.to.as_str(),
            payload.equivalent.as_str(),
        )
        .await
        .map_err(storage)?;
        let backward = db::get_debt_for_update(
            &mut dbtx,
            payload.to.as_str(),
            payload.from.as_str(),
            payload.equivalent.as_str(),
        )
        .await
        .map_err(storage)?;
        if forward.is_some() || backward.is_some() {
            return Err(GeoError::Validation(
                "trust line has outstanding debt and cannot be closed".into(),
            ));
        }

        db::close_trust_line(&mut *dbtx, line.id)
            .await
            .map_err(storage)?;
        let audit_id = db::insert_audit(
            &mut *dbtx,
            Some(payload.from.as_str()),
            "trustline.close",
            &json!({
                "to": payload.to,
                "equivalent": payload.equivalent,
            }),
        )
        .await
        .map_err(storage)?;
        dbtx.commit().await.map_err(sql_storage)?;

        info!(
            from = %payload.from,
            to = %payload.to,
            equivalent = %payload.equivalent,
            "trust line closed"
        );
        self.events.emit(HubEvent::TrustlineUpdated {
            audit_id,
            from: payload.from.clone(),
            to: payload.to.clone(),
            equivalent: payload.equivalent.clone(),
            at: Utc::now(),
        });

        Ok(())
    }

    async fn active_participant(&self, pid: &str) -> Result<db::ParticipantRow, GeoError> {
        let participant = db::get_participant(&self.pool, pid)
            .await
            .map_err(storage)?
            .ok_or_else(|| GeoError::NotFound(format!("participant {pid}")))?;
        if participant.status != "active" {
            return Err(GeoError::InactiveParticipant(pid.to_string()));
        }
        Ok(participant)
    }
}

fn storage(e: eyre::Report) -> GeoError {
    GeoError::Storage(format!("{e:#}"))
}

fn sql_storage(e: sqlx::Error) -> GeoError {
    GeoError::Storage(e.to_string())
}
