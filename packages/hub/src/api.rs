//! HTTP surface.
//!
//! A thin request layer over the engines: deserialize, authorize, forward,
//! envelope. Identity resolution happens upstream; the resolved participant
//! arrives in the `x-geo-participant` header, and mutations authenticate
//! themselves a second time through their payload signatures. Domain errors
//! come back as `{"error": {"code", "message"}}`.

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use eyre::eyre;
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use creditnet_rs::amount::Amount;
use creditnet_rs::error::GeoError;
use creditnet_rs::payloads::{
    RegisterPayload, TrustLineClosePayload, TrustLinePayload, TrustLineUpdatePayload,
};
use creditnet_rs::types::{EquivalentCode, ParticipantStatus, Pid};

use crate::clearing;
use crate::config::Config;
use crate::db;
use crate::events::EventBus;
use crate::invariants;
use crate::metrics;
use crate::payments::{self, CreatePaymentRequest, PaymentEngine, PaymentOutcome};
use crate::registry::RegistryService;
use crate::router::RouteConstraints;
use crate::trustlines::TrustLineService;

/// Shared state for the HTTP server
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub engine: PaymentEngine,
    pub trustlines: TrustLineService,
    pub registry: RegistryService,
    pub events: EventBus,
}

/// Start the API server
pub async fn start_server(addr: SocketAddr, state: AppState) -> eyre::Result<()> {
    let app = Router::new()
        // participants & equivalents
        .route("/v1/participants", post(register_participant))
        .route("/v1/participants/{pid}/balance", get(balance_summary))
        .route("/v1/participants/{pid}/debts", get(list_debts))
        .route("/v1/participants/{pid}/status", post(set_participant_status))
        .route("/v1/equivalents", post(create_equivalent).get(list_equivalents))
        // trust lines
        .route("/v1/trustlines", post(create_trust_line))
        .route("/v1/trustlines/update", post(update_trust_line))
        .route("/v1/trustlines/close", post(close_trust_line))
        // payments
        .route("/v1/capacity", get(capacity_query))
        .route("/v1/payments", post(create_payment).get(list_payments))
        .route("/v1/payments/{tx_id}", get(read_payment))
        // privileged diagnostics
        .route("/v1/cycles", get(list_cycles))
        .route("/v1/clearing/run", post(run_clearing))
        .route("/v1/integrity", get(integrity_status))
        // ambient
        .route("/health", get(health))
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state);

    info!(%addr, "API server started");
    metrics::UP.set(1.0);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error envelope ============

struct ApiError(GeoError);

impl From<GeoError> for ApiError {
    fn from(e: GeoError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GeoError::Validation(_) => StatusCode::BAD_REQUEST,
            GeoError::InvalidSignature => StatusCode::UNAUTHORIZED,
            GeoError::PolicyDenied(_) => StatusCode::FORBIDDEN,
            GeoError::NotFound(_) => StatusCode::NOT_FOUND,
            GeoError::ReplayNonce | GeoError::IdempotencyConflict => StatusCode::CONFLICT,
            GeoError::InsufficientCapacity(_)
            | GeoError::InactiveParticipant(_)
            | GeoError::EquivalentInactive(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GeoError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GeoError::InvariantViolation(_) | GeoError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

fn storage(e: eyre::Report) -> ApiError {
    ApiError(GeoError::Storage(format!("{e:#}")))
}

// ============ Authorization helpers ============

/// The participant resolved by the identity collaborator upstream.
fn caller(headers: &HeaderMap) -> Result<Pid, ApiError> {
    let raw = headers
        .get("x-geo-participant")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError(GeoError::Validation("x-geo-participant header missing".into())))?;
    Pid::parse(raw).map_err(ApiError)
}

/// Privileged operations require the operator token when one is configured.
fn require_operator(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.config.server.admin_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected) {
        Ok(())
    } else {
        Err(ApiError(GeoError::PolicyDenied(
            "operator token required".into(),
        )))
    }
}

// ============ Participants ============

#[derive(Debug, Deserialize)]
struct SignedRequest<T> {
    payload: T,
    signature: String,
}

#[derive(Debug, Serialize)]
struct ParticipantView {
    pid: String,
    display_name: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
}

impl From<db::ParticipantRow> for ParticipantView {
    fn from(row: db::ParticipantRow) -> Self {
        ParticipantView {
            pid: row.pid,
            display_name: row.display_name,
            status: row.status,
            created_at: row.created_at,
        }
    }
}

async fn register_participant(
    State(state): State<AppState>,
    Json(req): Json<SignedRequest<RegisterPayload>>,
) -> Result<Json<ParticipantView>, ApiError> {
    let row = state
        .registry
        .register_participant(req.payload, &req.signature)
        .await?;
    Ok(Json(row.into()))
}

#[derive(Debug, Deserialize)]
struct StatusChangeRequest {
    status: String,
}

async fn set_participant_status(
    State(state): State<AppState>,
    Path(pid): Path<String>,
    headers: HeaderMap,
    Json(req): Json<StatusChangeRequest>,
) -> Result<StatusCode, ApiError> {
    require_operator(&state, &headers)?;
    let pid = Pid::parse(&pid).map_err(ApiError)?;
    let status = ParticipantStatus::parse(&req.status).map_err(ApiError)?;
    state
        .registry
        .set_participant_status(&pid, status, operator_actor(&headers))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

fn operator_actor(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-geo-participant").and_then(|v| v.to_str().ok())
}

#[derive(Debug, Serialize)]
struct BalanceEntry {
    equivalent: String,
    total_debt: String,
    total_credit: String,
    net_balance: String,
    available_to_spend: String,
    available_to_receive: String,
}

async fn balance_summary(
    State(state): State<AppState>,
    Path(pid): Path<String>,
) -> Result<Json<Vec<BalanceEntry>>, ApiError> {
    let pid = Pid::parse(&pid).map_err(ApiError)?;
    db::get_participant(&state.pool, pid.as_str())
        .await
        .map_err(storage)?
        .ok_or_else(|| ApiError(GeoError::NotFound(format!("participant {pid}"))))?;

    let balances = db::balance_summary(&state.pool, pid.as_str())
        .await
        .map_err(storage)?;
    let mut by_equivalent: std::collections::BTreeMap<String, (Amount, Amount)> = balances
        .into_iter()
        .map(|b| {
            let debt = Amount::parse(&b.total_debt).unwrap_or_else(|_| Amount::zero());
            let credit = Amount::parse(&b.total_credit).unwrap_or_else(|_| Amount::zero());
            (b.equivalent, (debt, credit))
        })
        .collect();

    // Equivalents where the participant only has trust lines still count
    for eq in db::list_equivalents(&state.pool).await.map_err(storage)? {
        by_equivalent.entry(eq.code).or_insert((Amount::zero(), Amount::zero()));
    }

    let mut entries = Vec::new();
    for (code, (debt, credit)) in by_equivalent {
        let equivalent = EquivalentCode::parse(&code).map_err(ApiError)?;
        let snapshot = state.engine.load_snapshot(&equivalent).await?;
        let spend = snapshot.outgoing_capacity(&pid);
        let receive = snapshot.incoming_capacity(&pid);
        if debt.is_zero() && credit.is_zero() && spend.is_zero() && receive.is_zero() {
            continue;
        }
        entries.push(BalanceEntry {
            equivalent: code,
            total_debt: debt.canonical(),
            total_credit: credit.canonical(),
            net_balance: (&credit - &debt).canonical(),
            available_to_spend: spend.canonical(),
            available_to_receive: receive.canonical(),
        });
    }
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
struct DebtsQuery {
    #[serde(default = "default_direction")]
    direction: String,
    equivalent: Option<String>,
}

fn default_direction() -> String {
    "outgoing".to_string()
}

#[derive(Debug, Serialize)]
struct DebtView {
    debtor: String,
    creditor: String,
    equivalent: String,
    amount: String,
    updated_at: DateTime<Utc>,
}

async fn list_debts(
    State(state): State<AppState>,
    Path(pid): Path<String>,
    Query(query): Query<DebtsQuery>,
) -> Result<Json<Vec<DebtView>>, ApiError> {
    let pid = Pid::parse(&pid).map_err(ApiError)?;
    if query.direction != "outgoing" && query.direction != "incoming" {
        return Err(ApiError(GeoError::Validation(
            "direction must be outgoing or incoming".into(),
        )));
    }
    let rows = db::list_debts(
        &state.pool,
        pid.as_str(),
        &query.direction,
        query.equivalent.as_deref(),
    )
    .await
    .map_err(storage)?;
    Ok(Json(
        rows.into_iter()
            .map(|d| DebtView {
                debtor: d.debtor,
                creditor: d.creditor,
                equivalent: d.equivalent,
                amount: canonical_amount(&d.amount),
                updated_at: d.updated_at,
            })
            .collect(),
    ))
}

/// NUMERIC columns come back with their full storage scale; client-facing
/// amounts are always the canonical form.
fn canonical_amount(raw: &str) -> String {
    Amount::parse(raw)
        .map(|a| a.canonical())
        .unwrap_or_else(|_| raw.to_string())
}

// ============ Equivalents ============

#[derive(Debug, Deserialize)]
struct CreateEquivalentRequest {
    code: String,
    precision: u32,
    description: Option<String>,
}

async fn create_equivalent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateEquivalentRequest>,
) -> Result<Json<db::EquivalentRow>, ApiError> {
    require_operator(&state, &headers)?;
    let code = EquivalentCode::parse(&req.code).map_err(ApiError)?;
    let row = state
        .registry
        .create_equivalent(
            &code,
            req.precision,
            req.description.as_deref(),
            operator_actor(&headers),
        )
        .await?;
    Ok(Json(row))
}

async fn list_equivalents(
    State(state): State<AppState>,
) -> Result<Json<Vec<db::EquivalentRow>>, ApiError> {
    Ok(Json(db::list_equivalents(&state.pool).await.map_err(storage)?))
}

// ============ Trust lines ============

#[derive(Debug, Serialize)]
struct TrustLineView {
    from: String,
    to: String,
    equivalent: String,
    limit: String,
    auto_clearing: bool,
    can_be_intermediate: bool,
    blocked_participants: serde_json::Value,
    status: String,
    updated_at: DateTime<Utc>,
}

impl From<db::TrustLineRow> for TrustLineView {
    fn from(row: db::TrustLineRow) -> Self {
        TrustLineView {
            from: row.from_participant,
            to: row.to_participant,
            equivalent: row.equivalent,
            limit: canonical_amount(&row.limit_amount),
            auto_clearing: row.auto_clearing,
            can_be_intermediate: row.can_be_intermediate,
            blocked_participants: row.blocked_participants,
            status: row.status,
            updated_at: row.updated_at,
        }
    }
}

async fn create_trust_line(
    State(state): State<AppState>,
    Json(req): Json<SignedRequest<TrustLinePayload>>,
) -> Result<Json<TrustLineView>, ApiError> {
    let row = state.trustlines.create(req.payload, &req.signature).await?;
    Ok(Json(row.into()))
}

async fn update_trust_line(
    State(state): State<AppState>,
    Json(req): Json<SignedRequest<TrustLineUpdatePayload>>,
) -> Result<Json<TrustLineView>, ApiError> {
    let row = state.trustlines.update(req.payload, &req.signature).await?;
    Ok(Json(row.into()))
}

async fn close_trust_line(
    State(state): State<AppState>,
    Json(req): Json<SignedRequest<TrustLineClosePayload>>,
) -> Result<StatusCode, ApiError> {
    state.trustlines.close(req.payload, &req.signature).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Payments ============

#[derive(Debug, Deserialize)]
struct CapacityQuery {
    from: String,
    to: String,
    equivalent: String,
    amount: Option<String>,
}

#[derive(Debug, Serialize)]
struct CapacityResponse {
    can_pay: bool,
    max_amount: String,
    routes_count: usize,
    estimated_hops: Option<usize>,
}

async fn capacity_query(
    State(state): State<AppState>,
    Query(query): Query<CapacityQuery>,
) -> Result<Json<CapacityResponse>, ApiError> {
    let from = Pid::parse(&query.from).map_err(ApiError)?;
    let to = Pid::parse(&query.to).map_err(ApiError)?;
    let equivalent = EquivalentCode::parse(&query.equivalent).map_err(ApiError)?;

    let snapshot = state.engine.load_snapshot(&equivalent).await?;
    let constraints = RouteConstraints {
        max_hops: state.config.routing.max_path_length as usize,
        max_paths: state.config.routing.max_paths_per_payment as usize,
        budget: state.config.routing.path_finding_budget(),
    };
    let (max_amount, routes_count, estimated_hops) =
        crate::router::estimate_capacity(&snapshot, &from, &to, &constraints)?;

    let can_pay = match &query.amount {
        Some(raw) => {
            let wanted = Amount::parse(raw).map_err(ApiError)?;
            wanted.is_positive() && wanted <= max_amount
        }
        None => max_amount.is_positive(),
    };
    Ok(Json(CapacityResponse {
        can_pay,
        max_amount: max_amount.canonical(),
        routes_count,
        estimated_hops,
    }))
}

async fn create_payment(
    State(state): State<AppState>,
    Json(req): Json<CreatePaymentRequest>,
) -> Result<Json<PaymentOutcome>, ApiError> {
    let outcome = state.engine.create_payment(req).await?;
    Ok(Json(outcome))
}

async fn read_payment(
    State(state): State<AppState>,
    Path(tx_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<PaymentOutcome>, ApiError> {
    let who = caller(&headers)?;
    let row = db::get_transaction(&state.pool, tx_id)
        .await
        .map_err(storage)?
        .ok_or_else(|| ApiError(GeoError::NotFound(format!("transaction {tx_id}"))))?;
    if row.tx_type != "PAYMENT" {
        return Err(ApiError(GeoError::NotFound(format!("payment {tx_id}"))));
    }
    if !payment_visible_to(&row, who.as_str()) {
        return Err(ApiError(GeoError::PolicyDenied(
            "requester is not a party to this payment".into(),
        )));
    }
    Ok(Json(payments::outcome_from_row(&row)?))
}

/// Payer, payee, and the intermediates recorded on the route may read a
/// payment. Authorization derives from the recorded plan, not the current
/// graph, so it stays stable after trust lines change.
fn payment_visible_to(row: &db::TransactionRow, pid: &str) -> bool {
    let is = |key: &str| row.payload.get(key).and_then(|v| v.as_str()) == Some(pid);
    if is("from") || is("to") {
        return true;
    }
    row.payload
        .get("routes")
        .and_then(|r| r.as_array())
        .map(|routes| {
            routes.iter().any(|route| {
                route
                    .get("hops")
                    .and_then(|h| h.as_array())
                    .map(|hops| hops.iter().any(|h| h.as_str() == Some(pid)))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

#[derive(Debug, Deserialize)]
struct PaymentsQuery {
    direction: Option<String>,
    equivalent: Option<String>,
    status: Option<String>,
    from_date: Option<DateTime<Utc>>,
    to_date: Option<DateTime<Utc>>,
    #[serde(default = "default_page_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_page_limit() -> i64 {
    50
}

async fn list_payments(
    State(state): State<AppState>,
    Query(query): Query<PaymentsQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<PaymentOutcome>>, ApiError> {
    let who = caller(&headers)?;
    let limit = query.limit.clamp(1, 200);
    let rows = db::list_payments(
        &state.pool,
        who.as_str(),
        query.direction.as_deref(),
        query.equivalent.as_deref(),
        query.status.as_deref(),
        query.from_date,
        query.to_date,
        limit,
        query.offset.max(0),
    )
    .await
    .map_err(storage)?;
    let outcomes = rows
        .iter()
        .map(payments::outcome_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(outcomes))
}

// ============ Privileged diagnostics ============

#[derive(Debug, Deserialize)]
struct CyclesQuery {
    equivalent: Option<String>,
}

async fn list_cycles(
    State(state): State<AppState>,
    Query(query): Query<CyclesQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<clearing::CycleCandidate>>, ApiError> {
    require_operator(&state, &headers)?;
    let mut all = Vec::new();
    let equivalents = match query.equivalent {
        Some(code) => vec![code],
        None => db::list_equivalents(&state.pool)
            .await
            .map_err(storage)?
            .into_iter()
            .map(|e| e.code)
            .collect(),
    };
    for code in equivalents {
        all.extend(
            clearing::list_candidates(&state.pool, &state.config, &code)
                .await
                .map_err(storage)?,
        );
    }
    Ok(Json(all))
}

#[derive(Debug, Deserialize)]
struct RunClearingRequest {
    equivalent: String,
}

async fn run_clearing(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RunClearingRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_operator(&state, &headers)?;
    let equivalent = EquivalentCode::parse(&req.equivalent).map_err(ApiError)?;
    let applied = clearing::run_batch(&state.pool, &state.config, &state.events, &equivalent)
        .await?;
    db::insert_audit(
        &state.pool,
        operator_actor(&headers),
        "clearing.run",
        &json!({ "equivalent": req.equivalent, "applied": applied }),
    )
    .await
    .map_err(storage)?;
    Ok(Json(json!({ "equivalent": req.equivalent, "applied": applied })))
}

async fn integrity_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<invariants::IntegrityReport>, ApiError> {
    require_operator(&state, &headers)?;
    let report = invariants::full_audit(&state.pool).await.map_err(storage)?;
    Ok(Json(report))
}

// ============ Ambient endpoints ============

/// Server start time for uptime calculation
static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    uptime_seconds: u64,
    queues: QueueStatus,
}

#[derive(Serialize)]
struct QueueStatus {
    prepared_transactions: i64,
    active_prepare_locks: i64,
    committed_transactions: i64,
    aborted_transactions: i64,
}

async fn health(State(state): State<AppState>) -> Json<StatusResponse> {
    let started = START.get_or_init(Instant::now);
    let queues = QueueStatus {
        prepared_transactions: db::count_transactions_in_state(&state.pool, "PREPARED")
            .await
            .unwrap_or(0),
        active_prepare_locks: db::count_active_locks(&state.pool).await.unwrap_or(0),
        committed_transactions: db::count_transactions_in_state(&state.pool, "COMMITTED")
            .await
            .unwrap_or(0),
        aborted_transactions: db::count_transactions_in_state(&state.pool, "ABORTED")
            .await
            .unwrap_or(0),
    };
    Json(StatusResponse {
        status: "ok".to_string(),
        uptime_seconds: started.elapsed().as_secs(),
        queues,
    })
}

/// Liveness probe (always returns OK if server is running)
async fn liveness() -> &'static str {
    "OK"
}

/// Readiness probe (checks the database is reachable)
async fn readiness(State(state): State<AppState>) -> Response {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => "OK".into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "NOT_READY").into_response(),
    }
}

/// Prometheus metrics endpoint
async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }
    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

/// Parse the configured bind address.
pub fn bind_address(config: &Config) -> eyre::Result<SocketAddr> {
    format!("{}:{}", config.server.bind_address, config.server.port)
        .parse()
        .map_err(|e| {
            eyre!(
                "Invalid bind address {}:{}: {}",
                config.server.bind_address,
                config.server.port,
                e
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payment_row(payload: serde_json::Value) -> db::TransactionRow {
        db::TransactionRow {
            tx_id: Uuid::new_v4(),
            tx_type: "PAYMENT".into(),
            initiator: None,
            payload,
            signatures: json!([]),
            state: "COMMITTED".into(),
            error_code: None,
            error_message: None,
            idempotency_key: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            committed_at: None,
        }
    }

    #[test]
    fn test_payment_visibility() {
        let row = payment_row(json!({
            "from": "alice",
            "to": "carol",
            "routes": [{"hops": ["alice", "bob", "carol"], "amount": "30"}],
        }));
        assert!(payment_visible_to(&row, "alice"));
        assert!(payment_visible_to(&row, "bob"));
        assert!(payment_visible_to(&row, "carol"));
        assert!(!payment_visible_to(&row, "mallory"));
    }

    #[test]
    fn test_payment_visibility_without_routes() {
        let row = payment_row(json!({"from": "alice", "to": "carol", "routes": []}));
        assert!(payment_visible_to(&row, "alice"));
        assert!(!payment_visible_to(&row, "bob"));
    }
}
