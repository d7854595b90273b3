//! The two-phase payment engine.
//!
//! A payment runs accept -> route -> prepare -> commit inside one handler
//! call. Prepare takes sorted advisory locks on every touched segment and
//! reserves capacity with TTL-bounded prepare_lock rows; commit retakes the
//! locks, applies the debt deltas with netting, and releases the
//! reservations. Both phases are single database transactions, so a plan
//! with N paths commits in full or not at all.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use creditnet_rs::amount::Amount;
use creditnet_rs::error::GeoError;
use creditnet_rs::events::HubEvent;
use creditnet_rs::payloads::PaymentPayload;
use creditnet_rs::signing;
use creditnet_rs::types::{EquivalentCode, Pid, SegmentRef, TxState, TxType};

use crate::clearing;
use crate::config::Config;
use crate::db;
use crate::events::EventBus;
use crate::invariants;
use crate::metrics;
use crate::router::{self, GraphSnapshot, RouteConstraints, RoutePlan};

/// Paths the benchmarking full-multipath mode may use.
const FULL_MULTIPATH_LIMIT: usize = 16;

/// A create-payment request as accepted from the surface.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePaymentRequest {
    pub payload: PaymentPayload,
    /// Detached base64 Ed25519 signature over the canonical payload.
    pub signature: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// One route of a recorded plan, as stored and as returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSummary {
    pub hops: Vec<String>,
    pub amount: String,
}

/// Error surfaced inside a terminal payment outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeError {
    pub code: String,
    pub message: String,
}

/// Terminal result of a payment operation.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentOutcome {
    pub tx_id: Uuid,
    pub status: String,
    pub routes: Vec<RouteSummary>,
    pub amount: String,
    pub created_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
}

/// One directed segment of a plan with its aggregate flow.
#[derive(Debug, Clone)]
struct PlannedSegment {
    seg: SegmentRef,
    flow: Amount,
    /// True when the segment's lender is a pass-through hop on any path.
    lender_is_intermediate: bool,
}

#[derive(Clone)]
pub struct PaymentEngine {
    pool: PgPool,
    config: Config,
    events: EventBus,
}

impl PaymentEngine {
    pub fn new(pool: PgPool, config: Config, events: EventBus) -> Self {
        PaymentEngine {
            pool,
            config,
            events,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Execute a payment end to end.
    ///
    /// Pre-acceptance failures (validation, signature, replay, idempotency
    /// conflict) return `Err`; failures after the transaction record exists
    /// surface as an `ABORTED` outcome with the recorded error.
    pub async fn create_payment(
        &self,
        req: CreatePaymentRequest,
    ) -> Result<PaymentOutcome, GeoError> {
        let started = Instant::now();
        let payload = &req.payload;

        if payload.from == payload.to {
            return Err(GeoError::Validation(
                "sender and receiver must differ".into(),
            ));
        }
        if !payload.amount.is_positive() {
            return Err(GeoError::Validation("amount must be positive".into()));
        }

        let sender = db::get_participant(&self.pool, payload.from.as_str())
            .await
            .map_err(storage)?
            .ok_or_else(|| GeoError::NotFound(format!("participant {}", payload.from)))?;
        if sender.status != "active" {
            return Err(GeoError::InactiveParticipant(payload.from.to_string()));
        }
        let receiver = db::get_participant(&self.pool, payload.to.as_str())
            .await
            .map_err(storage)?
            .ok_or_else(|| GeoError::NotFound(format!("participant {}", payload.to)))?;
        if receiver.status != "active" {
            return Err(GeoError::InactiveParticipant(payload.to.to_string()));
        }
        let equivalent = db::get_equivalent(&self.pool, payload.equivalent.as_str())
            .await
            .map_err(storage)?
            .ok_or_else(|| GeoError::NotFound(format!("equivalent {}", payload.equivalent)))?;
        if !equivalent.active {
            return Err(GeoError::EquivalentInactive(payload.equivalent.to_string()));
        }
        payload.amount.check_precision(equivalent.precision as u32)?;

        let key = signing::public_key_from_bytes(&sender.public_key)?;
        signing::verify_payload(&key, payload, &req.signature)?;

        // Idempotent replays return the recorded result before the nonce
        // guard gets a chance to reject the reused nonce.
        if let Some(idem_key) = req.idempotency_key.as_deref() {
            if let Some(existing) =
                db::find_transaction_by_idempotency(&self.pool, payload.from.as_str(), idem_key)
                    .await
                    .map_err(storage)?
            {
                if !payload_matches(&existing.payload, payload) {
                    return Err(GeoError::IdempotencyConflict);
                }
                return outcome_from_row(&existing);
            }
        }

        if !db::insert_nonce(&self.pool, payload.from.as_str(), &payload.nonce)
            .await
            .map_err(storage)?
        {
            return Err(GeoError::ReplayNonce);
        }

        // Route against a live snapshot. No plan, no transaction record:
        // capacity shortfalls at this stage still produce an auditable
        // ABORTED transaction below.
        let routing_started = Instant::now();
        let snapshot = self.load_snapshot(&payload.equivalent).await?;
        let constraints = self.route_constraints();
        let routed = router::find_routes(
            &snapshot,
            &payload.from,
            &payload.to,
            &payload.amount,
            &constraints,
        );
        metrics::ROUTING_DURATION.observe(routing_started.elapsed().as_secs_f64());

        let tx_id = Uuid::new_v4();
        let plan = match routed {
            Ok(plan) => plan,
            Err(err @ GeoError::InsufficientCapacity(_)) => {
                self.record_unroutable(tx_id, &req).await?;
                let outcome = self.finish_aborted(tx_id, payload, &err, started).await?;
                return Ok(outcome);
            }
            Err(other) => return Err(other),
        };

        if plan.timed_out {
            warn!(%tx_id, "route search hit its budget; using best plan found");
        }

        let stored_payload = stored_payload(payload, &plan);
        if let Err(insert_err) = db::insert_transaction(
            &self.pool,
            tx_id,
            TxType::Payment.as_str(),
            Some(payload.from.as_str()),
            &stored_payload,
            &json!([req.signature]),
            TxState::New.as_str(),
            req.idempotency_key.as_deref(),
        )
        .await
        {
            // A concurrent create with the same idempotency key can win the
            // unique index; resolve to its recorded result.
            if let Some(idem_key) = req.idempotency_key.as_deref() {
                if let Some(existing) = db::find_transaction_by_idempotency(
                    &self.pool,
                    payload.from.as_str(),
                    idem_key,
                )
                .await
                .map_err(storage)?
                {
                    if !payload_matches(&existing.payload, payload) {
                        return Err(GeoError::IdempotencyConflict);
                    }
                    return outcome_from_row(&existing);
                }
            }
            return Err(storage(insert_err));
        }

        let segments = planned_segments(&plan, &payload.to, &payload.equivalent);
        let result = timeout(
            self.config.protocol.transaction_deadline(),
            self.run_phases(tx_id, payload, &segments),
        )
        .await
        .unwrap_or_else(|_| Err(GeoError::Timeout("transaction deadline exceeded".into())));

        match result {
            Ok(affected) => {
                let committed_at = Utc::now();
                metrics::record_payment("COMMITTED", started.elapsed().as_secs_f64());
                metrics::ROUTES_PER_PAYMENT.observe(plan.paths.len() as f64);
                info!(
                    %tx_id,
                    from = %payload.from,
                    to = %payload.to,
                    equivalent = %payload.equivalent,
                    amount = %payload.amount,
                    paths = plan.paths.len(),
                    "payment committed"
                );
                self.events.emit(HubEvent::PaymentCommitted {
                    tx_id,
                    from: payload.from.clone(),
                    to: payload.to.clone(),
                    equivalent: payload.equivalent.clone(),
                    amount: payload.amount.canonical(),
                    at: committed_at,
                });
                clearing::spawn_trigger(
                    self.pool.clone(),
                    self.config.clone(),
                    self.events.clone(),
                    payload.equivalent.clone(),
                    affected,
                );
                Ok(PaymentOutcome {
                    tx_id,
                    status: TxState::Committed.as_str().to_string(),
                    routes: plan
                        .paths
                        .iter()
                        .map(|p| RouteSummary {
                            hops: p.hops.iter().map(|h| h.as_str().to_string()).collect(),
                            amount: p.amount.canonical(),
                        })
                        .collect(),
                    amount: payload.amount.canonical(),
                    created_at: Utc::now(),
                    committed_at: Some(committed_at),
                    error: None,
                })
            }
            Err(err) => {
                let outcome = self.finish_aborted(tx_id, payload, &err, started).await?;
                Ok(outcome)
            }
        }
    }

    /// Prepare then commit, each under its own phase deadline.
    async fn run_phases(
        &self,
        tx_id: Uuid,
        payload: &PaymentPayload,
        segments: &[PlannedSegment],
    ) -> Result<Vec<(Pid, Pid)>, GeoError> {
        timeout(
            self.config.protocol.prepare_deadline(),
            self.prepare(tx_id, payload, segments),
        )
        .await
        .unwrap_or_else(|_| Err(GeoError::Timeout("prepare deadline exceeded".into())))?;

        timeout(
            self.config.protocol.commit_deadline(),
            self.commit(tx_id, payload, segments),
        )
        .await
        .unwrap_or_else(|_| Err(GeoError::Timeout("commit deadline exceeded".into())))
    }

    /// Prepare phase: one database transaction that takes the segment
    /// advisory locks in sorted order, re-derives live capacity under those
    /// locks, and reserves it.
    async fn prepare(
        &self,
        tx_id: Uuid,
        payload: &PaymentPayload,
        segments: &[PlannedSegment],
    ) -> Result<(), GeoError> {
        let mut dbtx = self.pool.begin().await.map_err(sql_storage)?;

        let mut keys: Vec<i64> = segments.iter().map(|s| s.seg.advisory_key()).collect();
        keys.sort_unstable();
        keys.dedup();
        for key in keys {
            db::advisory_lock(&mut dbtx, key).await.map_err(storage)?;
        }

        let expires_at =
            Utc::now() + ChronoDuration::seconds(self.config.protocol.lock_ttl_seconds as i64);
        for ps in segments {
            let debtor = ps.seg.debtor.as_str();
            let creditor = ps.seg.creditor.as_str();
            let code = ps.seg.equivalent.as_str();

            let line = db::get_trust_line(&mut *dbtx, creditor, debtor, code)
                .await
                .map_err(storage)?
                .ok_or_else(|| {
                    GeoError::InsufficientCapacity(format!(
                        "no trust line backs segment {debtor} -> {creditor}"
                    ))
                })?;
            if line.status != "active" {
                return Err(GeoError::InsufficientCapacity(format!(
                    "trust line {creditor} -> {debtor} is {}",
                    line.status
                )));
            }
            let policy = line.policy()?;
            if ps.lender_is_intermediate && !policy.can_be_intermediate {
                return Err(GeoError::PolicyDenied(format!(
                    "{creditor} does not relay third-party payments"
                )));
            }
            if policy.blocks(&payload.from) || policy.blocks(&ps.seg.debtor) {
                return Err(GeoError::PolicyDenied(format!(
                    "{creditor} blocks a participant on this route"
                )));
            }

            // Capacity under the advisory lock: limit - forward debt +
            // opposite debt - everyone else's live reservations.
            let limit = Amount::parse(&line.limit_amount)?;
            let debt_fwd = match db::get_debt(&mut *dbtx, debtor, creditor, code)
                .await
                .map_err(storage)?
            {
                Some(d) => Amount::parse(&d.amount)?,
                None => Amount::zero(),
            };
            let debt_rev = match db::get_debt(&mut *dbtx, creditor, debtor, code)
                .await
                .map_err(storage)?
            {
                Some(d) => Amount::parse(&d.amount)?,
                None => Amount::zero(),
            };
            let reserved = Amount::parse(
                &db::sum_reserved_on_segment(&mut dbtx, debtor, creditor, code, tx_id)
                    .await
                    .map_err(storage)?,
            )?;
            let capacity = &(&(&limit - &debt_fwd) + &debt_rev) - &reserved;
            if capacity < ps.flow {
                return Err(GeoError::InsufficientCapacity(format!(
                    "segment {debtor} -> {creditor} has {} but the plan needs {}",
                    capacity.canonical(),
                    ps.flow
                )));
            }

            db::insert_prepare_lock(
                &mut dbtx,
                tx_id,
                debtor,
                creditor,
                code,
                &ps.flow.canonical(),
                &ps.seg.fingerprint_hex(),
                expires_at,
            )
            .await
            .map_err(storage)?;
        }

        if !db::transition_transaction(
            &mut *dbtx,
            tx_id,
            TxState::New.as_str(),
            TxState::Prepared.as_str(),
            None,
            None,
        )
        .await
        .map_err(storage)?
        {
            return Err(GeoError::Storage(format!(
                "transaction {tx_id} left NEW before prepare finished"
            )));
        }

        dbtx.commit().await.map_err(sql_storage)?;
        Ok(())
    }

    /// Commit phase: retake the advisory locks, refuse expired reservations,
    /// apply the debt deltas with netting, release the reservations, and
    /// re-check invariants before the transaction record goes terminal.
    async fn commit(
        &self,
        tx_id: Uuid,
        payload: &PaymentPayload,
        segments: &[PlannedSegment],
    ) -> Result<Vec<(Pid, Pid)>, GeoError> {
        let mut dbtx = self.pool.begin().await.map_err(sql_storage)?;

        let mut keys: Vec<i64> = segments.iter().map(|s| s.seg.advisory_key()).collect();
        keys.sort_unstable();
        keys.dedup();
        for key in keys {
            db::advisory_lock(&mut dbtx, key).await.map_err(storage)?;
        }

        let locks = db::get_locks_for_tx(&mut *dbtx, tx_id)
            .await
            .map_err(storage)?;
        if locks.is_empty() {
            return Err(GeoError::Timeout(
                "reservations were already released".into(),
            ));
        }
        let now = Utc::now();
        if locks.iter().any(|l| l.expires_at <= now) {
            return Err(GeoError::Timeout("prepare lock expired before commit".into()));
        }

        // Deltas apply in (debtor, creditor) order; combined with the sorted
        // advisory locks this keeps row acquisition deadlock-free.
        let mut ordered: Vec<&PlannedSegment> = segments.iter().collect();
        ordered.sort_by(|a, b| a.seg.cmp(&b.seg));
        let mut affected = Vec::with_capacity(ordered.len());
        for ps in ordered {
            apply_debt_delta(&mut dbtx, &ps.seg, &ps.flow).await?;
            affected.push((ps.seg.debtor.clone(), ps.seg.creditor.clone()));
        }

        db::delete_locks_for_tx(&mut *dbtx, tx_id)
            .await
            .map_err(storage)?;

        // Circuit breaker: unreachable under correct prepare, but a failed
        // check must roll the whole commit back.
        invariants::check_affected(&mut dbtx, &affected, &payload.equivalent).await?;

        if !db::transition_transaction(
            &mut *dbtx,
            tx_id,
            TxState::Prepared.as_str(),
            TxState::Committed.as_str(),
            None,
            None,
        )
        .await
        .map_err(storage)?
        {
            return Err(GeoError::Timeout(
                "transaction left PREPARED before commit".into(),
            ));
        }

        dbtx.commit().await.map_err(sql_storage)?;
        Ok(affected)
    }

    /// Abort from whatever non-terminal state the transaction is in,
    /// releasing reservations. Idempotent: a terminal transaction is left
    /// untouched and `false` comes back.
    pub async fn abort(
        &self,
        tx_id: Uuid,
        code: &str,
        message: &str,
    ) -> Result<bool, GeoError> {
        let mut dbtx = self.pool.begin().await.map_err(sql_storage)?;

        // Serialize against an in-flight commit on the same segments: the
        // reservation rows carry the fingerprints, and after prepare the
        // lock set only ever shrinks, so reading it before acquiring the
        // advisory locks is safe.
        let held = db::get_locks_for_tx(&mut *dbtx, tx_id)
            .await
            .map_err(storage)?;
        let mut keys: Vec<i64> = held
            .iter()
            .filter_map(|l| advisory_key_from_hex(&l.segment_key))
            .collect();
        keys.sort_unstable();
        keys.dedup();
        for key in keys {
            db::advisory_lock(&mut dbtx, key).await.map_err(storage)?;
        }

        let tx = db::get_transaction(&mut *dbtx, tx_id)
            .await
            .map_err(storage)?
            .ok_or_else(|| GeoError::NotFound(format!("transaction {tx_id}")))?;
        let state = TxState::parse(&tx.state)?;
        if state.is_terminal() {
            return Ok(false);
        }

        db::delete_locks_for_tx(&mut *dbtx, tx_id)
            .await
            .map_err(storage)?;
        let transitioned = db::transition_transaction(
            &mut *dbtx,
            tx_id,
            state.as_str(),
            TxState::Aborted.as_str(),
            Some(code),
            Some(message),
        )
        .await
        .map_err(storage)?;
        dbtx.commit().await.map_err(sql_storage)?;
        Ok(transitioned)
    }

    /// Record a transaction for a payment that never got a feasible plan, so
    /// the failure is auditable and idempotency keys resolve to it.
    async fn record_unroutable(
        &self,
        tx_id: Uuid,
        req: &CreatePaymentRequest,
    ) -> Result<(), GeoError> {
        let payload = stored_payload(
            &req.payload,
            &RoutePlan {
                paths: vec![],
                timed_out: false,
            },
        );
        db::insert_transaction(
            &self.pool,
            tx_id,
            TxType::Payment.as_str(),
            Some(req.payload.from.as_str()),
            &payload,
            &json!([req.signature]),
            TxState::New.as_str(),
            req.idempotency_key.as_deref(),
        )
        .await
        .map_err(storage)?;
        Ok(())
    }

    /// Drive a failed payment to ABORTED, emit the event, and build the
    /// terminal outcome.
    async fn finish_aborted(
        &self,
        tx_id: Uuid,
        payload: &PaymentPayload,
        err: &GeoError,
        started: Instant,
    ) -> Result<PaymentOutcome, GeoError> {
        if let Err(abort_err) = self.abort(tx_id, err.code(), &err.to_string()).await {
            warn!(%tx_id, error = %abort_err, "failed to abort payment after error");
        }
        metrics::record_payment("ABORTED", started.elapsed().as_secs_f64());
        metrics::record_abort_reason(err.code());
        info!(
            %tx_id,
            from = %payload.from,
            to = %payload.to,
            code = err.code(),
            "payment aborted"
        );
        self.events.emit(HubEvent::PaymentAborted {
            tx_id,
            from: payload.from.clone(),
            to: payload.to.clone(),
            equivalent: payload.equivalent.clone(),
            amount: payload.amount.canonical(),
            reason: err.code().to_string(),
            at: Utc::now(),
        });
        Ok(PaymentOutcome {
            tx_id,
            status: TxState::Aborted.as_str().to_string(),
            routes: vec![],
            amount: payload.amount.canonical(),
            created_at: Utc::now(),
            committed_at: None,
            error: Some(OutcomeError {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        })
    }

    fn route_constraints(&self) -> RouteConstraints {
        let max_paths = if self.config.features.full_multipath {
            FULL_MULTIPATH_LIMIT
        } else {
            self.config.routing.max_paths_per_payment as usize
        };
        RouteConstraints {
            max_hops: self.config.routing.max_path_length as usize,
            max_paths,
            budget: self.config.routing.path_finding_budget(),
        }
    }

    /// One-shot batch read of everything the router needs.
    pub async fn load_snapshot(
        &self,
        equivalent: &EquivalentCode,
    ) -> Result<GraphSnapshot, GeoError> {
        let code = equivalent.as_str();
        let lines = db::get_active_trust_lines(&self.pool, code)
            .await
            .map_err(storage)?;
        let debts = db::get_debts_for_equivalent(&self.pool, code)
            .await
            .map_err(storage)?;
        let reservations = db::get_reservations_for_equivalent(&self.pool, code)
            .await
            .map_err(storage)?;
        let inactive: HashSet<String> = db::get_inactive_participants(&self.pool)
            .await
            .map_err(storage)?
            .into_iter()
            .collect();
        GraphSnapshot::build(
            equivalent.clone(),
            &lines,
            &debts,
            &reservations,
            &inactive,
        )
    }
}

/// Apply one segment's flow with netting: an opposite debt shrinks first and
/// only the remainder grows the forward debt. Zero rows are deleted in place,
/// which is what keeps debts one-directional by construction.
async fn apply_debt_delta(
    dbtx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    seg: &SegmentRef,
    flow: &Amount,
) -> Result<(), GeoError> {
    let debtor = seg.debtor.as_str();
    let creditor = seg.creditor.as_str();
    let code = seg.equivalent.as_str();

    // Row locks in pid order, independent of flow direction.
    let (rev, _fwd) = if debtor <= creditor {
        let fwd = db::get_debt_for_update(&mut *dbtx, debtor, creditor, code)
            .await
            .map_err(storage)?;
        let rev = db::get_debt_for_update(&mut *dbtx, creditor, debtor, code)
            .await
            .map_err(storage)?;
        (rev, fwd)
    } else {
        let rev = db::get_debt_for_update(&mut *dbtx, creditor, debtor, code)
            .await
            .map_err(storage)?;
        let fwd = db::get_debt_for_update(&mut *dbtx, debtor, creditor, code)
            .await
            .map_err(storage)?;
        (rev, fwd)
    };

    match rev {
        Some(opposite) => {
            let opposite_amount = Amount::parse(&opposite.amount)?;
            if opposite_amount > *flow {
                let shrunk = &opposite_amount - flow;
                db::set_debt_amount(&mut **dbtx, opposite.id, &shrunk.canonical())
                    .await
                    .map_err(storage)?;
            } else {
                db::delete_debt(&mut **dbtx, opposite.id)
                    .await
                    .map_err(storage)?;
                let remainder = flow - &opposite_amount;
                if remainder.is_positive() {
                    db::upsert_debt(&mut **dbtx, debtor, creditor, code, &remainder.canonical())
                        .await
                        .map_err(storage)?;
                }
            }
        }
        None => {
            db::upsert_debt(&mut **dbtx, debtor, creditor, code, &flow.canonical())
                .await
                .map_err(storage)?;
        }
    }
    Ok(())
}

/// Fold a route plan into per-segment aggregate flows. Paths sharing a
/// segment merge; a lender counts as intermediate if any path passes through
/// them rather than ending on them.
fn planned_segments(
    plan: &RoutePlan,
    receiver: &Pid,
    equivalent: &EquivalentCode,
) -> Vec<PlannedSegment> {
    let mut merged: BTreeMap<(Pid, Pid), PlannedSegment> = BTreeMap::new();
    for path in &plan.paths {
        for pair in path.hops.windows(2) {
            let debtor = pair[0].clone();
            let creditor = pair[1].clone();
            let lender_is_intermediate = &creditor != receiver;
            let key = (debtor.clone(), creditor.clone());
            match merged.get_mut(&key) {
                Some(existing) => {
                    existing.flow = &existing.flow + &path.amount;
                    existing.lender_is_intermediate |= lender_is_intermediate;
                }
                None => {
                    merged.insert(
                        key,
                        PlannedSegment {
                            seg: SegmentRef {
                                debtor,
                                creditor,
                                equivalent: equivalent.clone(),
                            },
                            flow: path.amount.clone(),
                            lender_is_intermediate,
                        },
                    );
                }
            }
        }
    }
    merged.into_values().collect()
}

/// The self-describing payload persisted on the transaction record.
fn stored_payload(payload: &PaymentPayload, plan: &RoutePlan) -> serde_json::Value {
    json!({
        "version": 1,
        "from": payload.from,
        "to": payload.to,
        "equivalent": payload.equivalent,
        "amount": payload.amount,
        "nonce": payload.nonce,
        "issued_at": payload.issued_at,
        "routes": plan
            .paths
            .iter()
            .map(|p| {
                json!({
                    "hops": p.hops.iter().map(|h| h.as_str()).collect::<Vec<_>>(),
                    "amount": p.amount.canonical(),
                })
            })
            .collect::<Vec<_>>(),
    })
}

/// Whether a stored payload describes the same payment as an incoming one.
/// Used to distinguish idempotent replays from key reuse.
fn payload_matches(stored: &serde_json::Value, incoming: &PaymentPayload) -> bool {
    let incoming = match serde_json::to_value(incoming) {
        Ok(v) => v,
        Err(_) => return false,
    };
    ["from", "to", "equivalent", "amount", "nonce", "issued_at"]
        .iter()
        .all(|k| stored.get(k) == incoming.get(k))
}

/// Rebuild a terminal outcome from the stored transaction record.
pub fn outcome_from_row(row: &db::TransactionRow) -> Result<PaymentOutcome, GeoError> {
    let routes: Vec<RouteSummary> = row
        .payload
        .get("routes")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| GeoError::Storage(format!("transaction {} has malformed routes: {e}", row.tx_id)))?
        .unwrap_or_default();
    let amount = row
        .payload
        .get("amount")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let error = row.error_code.as_ref().map(|code| OutcomeError {
        code: code.clone(),
        message: row.error_message.clone().unwrap_or_default(),
    });
    Ok(PaymentOutcome {
        tx_id: row.tx_id,
        status: row.state.clone(),
        routes,
        amount,
        created_at: row.created_at,
        committed_at: row.committed_at,
        error,
    })
}

/// Recover the advisory key from a stored fingerprint (hex sha256).
fn advisory_key_from_hex(segment_key: &str) -> Option<i64> {
    let bytes = hex::decode(segment_key.trim()).ok()?;
    let head: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(i64::from_be_bytes(head))
}

fn storage(e: eyre::Report) -> GeoError {
    GeoError::Storage(format!("{e:#}"))
}

fn sql_storage(e: sqlx::Error) -> GeoError {
    GeoError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RoutePath;

    fn pid(tag: u8) -> Pid {
        Pid::from_public_key(&[tag; 32])
    }

    fn usd() -> EquivalentCode {
        EquivalentCode::parse("USD").unwrap()
    }

    fn path(hops: Vec<Pid>, amount: &str) -> RoutePath {
        RoutePath {
            hops,
            amount: Amount::parse(amount).unwrap(),
            capacity: Amount::parse(amount).unwrap(),
        }
    }

    #[test]
    fn test_planned_segments_merge_shared_edges() {
        let (a, b, c, d) = (pid(1), pid(2), pid(3), pid(4));
        // Both paths cross the a->b segment
        let plan = RoutePlan {
            paths: vec![
                path(vec![a.clone(), b.clone(), c.clone()], "30"),
                path(vec![a.clone(), b.clone(), d.clone(), c.clone()], "20"),
            ],
            timed_out: false,
        };
        let segments = planned_segments(&plan, &c, &usd());
        let ab = segments
            .iter()
            .find(|s| s.seg.debtor == a && s.seg.creditor == b)
            .unwrap();
        assert_eq!(ab.flow, Amount::parse("50").unwrap());
        // b is an intermediate on both paths
        assert!(ab.lender_is_intermediate);
    }

    #[test]
    fn test_planned_segments_terminal_hop_is_not_intermediate() {
        let (a, b, c) = (pid(1), pid(2), pid(3));
        let plan = RoutePlan {
            paths: vec![path(vec![a.clone(), b.clone(), c.clone()], "30")],
            timed_out: false,
        };
        let segments = planned_segments(&plan, &c, &usd());
        let bc = segments
            .iter()
            .find(|s| s.seg.debtor == b && s.seg.creditor == c)
            .unwrap();
        assert!(!bc.lender_is_intermediate);
        let ab = segments
            .iter()
            .find(|s| s.seg.debtor == a && s.seg.creditor == b)
            .unwrap();
        assert!(ab.lender_is_intermediate);
    }

    #[test]
    fn test_planned_segments_flow_sums_to_amount_per_terminal_edge() {
        let (a, b, c, d) = (pid(1), pid(2), pid(3), pid(4));
        let plan = RoutePlan {
            paths: vec![
                path(vec![a.clone(), c.clone(), b.clone()], "40"),
                path(vec![a.clone(), d.clone(), b.clone()], "30"),
            ],
            timed_out: false,
        };
        let segments = planned_segments(&plan, &b, &usd());
        let into_receiver: Amount = segments
            .iter()
            .filter(|s| s.seg.creditor == b)
            .fold(Amount::zero(), |acc, s| &acc + &s.flow);
        assert_eq!(into_receiver, Amount::parse("70").unwrap());
    }

    #[test]
    fn test_advisory_key_recovered_from_stored_fingerprint() {
        let seg = SegmentRef {
            debtor: pid(1),
            creditor: pid(2),
            equivalent: usd(),
        };
        assert_eq!(
            advisory_key_from_hex(&seg.fingerprint_hex()),
            Some(seg.advisory_key())
        );
        assert_eq!(advisory_key_from_hex("not-hex"), None);
    }

    #[test]
    fn test_payload_matches_ignores_routes() {
        let payload = PaymentPayload {
            from: pid(1),
            to: pid(2),
            equivalent: usd(),
            amount: Amount::parse("50").unwrap(),
            nonce: "n-1".into(),
            issued_at: "2024-01-01T00:00:00Z".into(),
        };
        let stored = stored_payload(
            &payload,
            &RoutePlan {
                paths: vec![path(vec![pid(1), pid(2)], "50")],
                timed_out: false,
            },
        );
        assert!(payload_matches(&stored, &payload));

        let mut different = payload.clone();
        different.amount = Amount::parse("51").unwrap();
        assert!(!payload_matches(&stored, &different));

        let mut different_nonce = payload.clone();
        different_nonce.nonce = "n-2".into();
        assert!(!payload_matches(&stored, &different_nonce));
    }

    #[test]
    fn test_outcome_from_row_roundtrip() {
        let payload = PaymentPayload {
            from: pid(1),
            to: pid(2),
            equivalent: usd(),
            amount: Amount::parse("50").unwrap(),
            nonce: "n-1".into(),
            issued_at: "2024-01-01T00:00:00Z".into(),
        };
        let stored = stored_payload(
            &payload,
            &RoutePlan {
                paths: vec![path(vec![pid(1), pid(2)], "50")],
                timed_out: false,
            },
        );
        let row = db::TransactionRow {
            tx_id: Uuid::new_v4(),
            tx_type: "PAYMENT".into(),
            initiator: Some(pid(1).as_str().to_string()),
            payload: stored,
            signatures: json!([]),
            state: "COMMITTED".into(),
            error_code: None,
            error_message: None,
            idempotency_key: Some("key-1".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            committed_at: Some(Utc::now()),
        };
        let outcome = outcome_from_row(&row).unwrap();
        assert_eq!(outcome.status, "COMMITTED");
        assert_eq!(outcome.amount, "50");
        assert_eq!(outcome.routes.len(), 1);
        assert_eq!(outcome.routes[0].hops.len(), 2);
        assert!(outcome.error.is_none());
    }
}
