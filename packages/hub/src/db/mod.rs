use chrono::{DateTime, Duration, Utc};
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{PgConnection, PgExecutor, Row};
use tracing::error;
use uuid::Uuid;

pub mod models;

pub use models::*;

/// Create a database connection pool
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

/// Take a transaction-scoped advisory lock on a segment fingerprint key.
/// Released automatically at COMMIT/ROLLBACK. Callers must sort keys before
/// acquiring; that ordering is the deadlock-freedom argument for concurrent
/// multi-segment prepares.
pub async fn advisory_lock(conn: &mut PgConnection, key: i64) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(key)
        .execute(conn)
        .await
        .wrap_err_with(|| format!("Failed to acquire advisory lock {}", key))?;
    Ok(())
}

// ============ Participants ============

/// Insert a participant. Returns false when the pid (and therefore the
/// public key, of which the pid is a digest) is already registered.
pub async fn insert_participant(
    executor: impl PgExecutor<'_>,
    pid: &str,
    public_key: &[u8],
    display_name: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO participants (pid, public_key, display_name)
        VALUES ($1, $2, $3)
        ON CONFLICT (pid) DO NOTHING
        "#,
    )
    .bind(pid)
    .bind(public_key)
    .bind(display_name)
    .execute(executor)
    .await
    .wrap_err("Failed to insert participant")?;

    Ok(result.rows_affected() > 0)
}

/// Get a participant by pid
pub async fn get_participant(
    executor: impl PgExecutor<'_>,
    pid: &str,
) -> Result<Option<ParticipantRow>> {
    sqlx::query_as::<_, ParticipantRow>(
        r#"SELECT pid, public_key, display_name, status, created_at, updated_at
           FROM participants WHERE pid = $1"#,
    )
    .bind(pid)
    .fetch_optional(executor)
    .await
    .wrap_err("Failed to get participant")
}

/// Update a participant's status (operator action)
pub async fn set_participant_status(
    executor: impl PgExecutor<'_>,
    pid: &str,
    status: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"UPDATE participants SET status = $1, updated_at = NOW() WHERE pid = $2"#,
    )
    .bind(status)
    .bind(pid)
    .execute(executor)
    .await
    .wrap_err_with(|| format!("Failed to set participant {} status to {}", pid, status))?;

    Ok(result.rows_affected() > 0)
}

/// Pids of every participant that may not transact (router exclusion set)
pub async fn get_inactive_participants(executor: impl PgExecutor<'_>) -> Result<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as(r#"SELECT pid FROM participants WHERE status <> 'active'"#)
            .fetch_all(executor)
            .await
            .wrap_err("Failed to get inactive participants")?;

    Ok(rows.into_iter().map(|r| r.0).collect())
}

// ============ Equivalents ============

/// Insert an equivalent. Returns false if the code already exists.
pub async fn insert_equivalent(
    executor: impl PgExecutor<'_>,
    code: &str,
    precision: i16,
    description: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO equivalents (code, precision, description)
        VALUES ($1, $2, $3)
        ON CONFLICT (code) DO NOTHING
        "#,
    )
    .bind(code)
    .bind(precision)
    .bind(description)
    .execute(executor)
    .await
    .wrap_err("Failed to insert equivalent")?;

    Ok(result.rows_affected() > 0)
}

/// Get an equivalent by code
pub async fn get_equivalent(
    executor: impl PgExecutor<'_>,
    code: &str,
) -> Result<Option<EquivalentRow>> {
    sqlx::query_as::<_, EquivalentRow>(
        r#"SELECT code, precision, description, active, created_at
           FROM equivalents WHERE code = $1"#,
    )
    .bind(code)
    .fetch_optional(executor)
    .await
    .wrap_err("Failed to get equivalent")
}

/// List all equivalents
pub async fn list_equivalents(executor: impl PgExecutor<'_>) -> Result<Vec<EquivalentRow>> {
    sqlx::query_as::<_, EquivalentRow>(
        r#"SELECT code, precision, description, active, created_at
           FROM equivalents ORDER BY code"#,
    )
    .fetch_all(executor)
    .await
    .wrap_err("Failed to list equivalents")
}

// ============ Trust lines ============

/// SQL SELECT columns for trust_lines (casting NUMERIC to TEXT)
const TRUST_LINE_SELECT: &str = r#"id, from_participant, to_participant, equivalent,
    limit_amount::TEXT as limit_amount, auto_clearing, can_be_intermediate,
    blocked_participants, status, created_at, updated_at"#;

/// Insert a new trust line. Returns None when the (from, to, equivalent)
/// triple already exists.
#[allow(clippy::too_many_arguments)]
pub async fn insert_trust_line(
    executor: impl PgExecutor<'_>,
    from_participant: &str,
    to_participant: &str,
    equivalent: &str,
    limit_amount: &str,
    auto_clearing: bool,
    can_be_intermediate: bool,
    blocked_participants: &serde_json::Value,
) -> Result<Option<i64>> {
    let row = sqlx::query(
        r#"
        INSERT INTO trust_lines (from_participant, to_participant, equivalent, limit_amount,
            auto_clearing, can_be_intermediate, blocked_participants)
        VALUES ($1, $2, $3, $4::NUMERIC, $5, $6, $7)
        ON CONFLICT (from_participant, to_participant, equivalent) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(from_participant)
    .bind(to_participant)
    .bind(equivalent)
    .bind(limit_amount)
    .bind(auto_clearing)
    .bind(can_be_intermediate)
    .bind(blocked_participants)
    .fetch_optional(executor)
    .await
    .wrap_err("Failed to insert trust line")?;

    Ok(row.map(|r| r.get("id")))
}

/// Get a trust line by its identifying triple
pub async fn get_trust_line(
    executor: impl PgExecutor<'_>,
    from_participant: &str,
    to_participant: &str,
    equivalent: &str,
) -> Result<Option<TrustLineRow>> {
    let query = format!(
        "SELECT {} FROM trust_lines
         WHERE from_participant = $1 AND to_participant = $2 AND equivalent = $3",
        TRUST_LINE_SELECT
    );
    sqlx::query_as::<_, TrustLineRow>(&query)
        .bind(from_participant)
        .bind(to_participant)
        .bind(equivalent)
        .fetch_optional(executor)
        .await
        .wrap_err("Failed to get trust line")
}

/// Update limit and policy of a trust line
pub async fn update_trust_line(
    executor: impl PgExecutor<'_>,
    id: i64,
    limit_amount: &str,
    auto_clearing: bool,
    can_be_intermediate: bool,
    blocked_participants: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE trust_lines
        SET limit_amount = $1::NUMERIC, auto_clearing = $2, can_be_intermediate = $3,
            blocked_participants = $4, updated_at = NOW()
        WHERE id = $5
        "#,
    )
    .bind(limit_amount)
    .bind(auto_clearing)
    .bind(can_be_intermediate)
    .bind(blocked_participants)
    .bind(id)
    .execute(executor)
    .await
    .wrap_err_with(|| format!("Failed to update trust line {}", id))?;

    Ok(())
}

/// Mark a trust line closed
pub async fn close_trust_line(executor: impl PgExecutor<'_>, id: i64) -> Result<()> {
    sqlx::query(r#"UPDATE trust_lines SET status = 'closed', updated_at = NOW() WHERE id = $1"#)
        .bind(id)
        .execute(executor)
        .await
        .wrap_err_with(|| format!("Failed to close trust line {}", id))?;

    Ok(())
}

/// All active trust lines in one equivalent (router snapshot read)
pub async fn get_active_trust_lines(
    executor: impl PgExecutor<'_>,
    equivalent: &str,
) -> Result<Vec<TrustLineRow>> {
    let query = format!(
        "SELECT {} FROM trust_lines WHERE equivalent = $1 AND status = 'active'",
        TRUST_LINE_SELECT
    );
    sqlx::query_as::<_, TrustLineRow>(&query)
        .bind(equivalent)
        .fetch_all(executor)
        .await
        .wrap_err("Failed to get active trust lines")
}

// ============ Debts ============

/// SQL SELECT columns for debts (casting NUMERIC to TEXT)
const DEBT_SELECT: &str =
    r#"id, debtor, creditor, equivalent, amount::TEXT as amount, created_at, updated_at"#;

/// All positive debts in one equivalent (router snapshot / audit read)
pub async fn get_debts_for_equivalent(
    executor: impl PgExecutor<'_>,
    equivalent: &str,
) -> Result<Vec<DebtRow>> {
    let query = format!("SELECT {} FROM debts WHERE equivalent = $1", DEBT_SELECT);
    sqlx::query_as::<_, DebtRow>(&query)
        .bind(equivalent)
        .fetch_all(executor)
        .await
        .wrap_err("Failed to get debts for equivalent")
}

/// One directed debt row, locked FOR UPDATE
pub async fn get_debt_for_update(
    conn: &mut PgConnection,
    debtor: &str,
    creditor: &str,
    equivalent: &str,
) -> Result<Option<DebtRow>> {
    let query = format!(
        "SELECT {} FROM debts
         WHERE debtor = $1 AND creditor = $2 AND equivalent = $3 FOR UPDATE",
        DEBT_SELECT
    );
    sqlx::query_as::<_, DebtRow>(&query)
        .bind(debtor)
        .bind(creditor)
        .bind(equivalent)
        .fetch_optional(conn)
        .await
        .wrap_err("Failed to lock debt row")
}

/// One directed debt row without locking
pub async fn get_debt(
    executor: impl PgExecutor<'_>,
    debtor: &str,
    creditor: &str,
    equivalent: &str,
) -> Result<Option<DebtRow>> {
    let query = format!(
        "SELECT {} FROM debts WHERE debtor = $1 AND creditor = $2 AND equivalent = $3",
        DEBT_SELECT
    );
    sqlx::query_as::<_, DebtRow>(&query)
        .bind(debtor)
        .bind(creditor)
        .bind(equivalent)
        .fetch_optional(executor)
        .await
        .wrap_err("Failed to get debt")
}

/// Insert a debt or add to an existing one
pub async fn upsert_debt(
    executor: impl PgExecutor<'_>,
    debtor: &str,
    creditor: &str,
    equivalent: &str,
    delta: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO debts (debtor, creditor, equivalent, amount)
        VALUES ($1, $2, $3, $4::NUMERIC)
        ON CONFLICT (debtor, creditor, equivalent)
            DO UPDATE SET amount = debts.amount + EXCLUDED.amount, updated_at = NOW()
        "#,
    )
    .bind(debtor)
    .bind(creditor)
    .bind(equivalent)
    .bind(delta)
    .execute(executor)
    .await
    .wrap_err("Failed to upsert debt")?;

    Ok(())
}

/// Set a debt row to an exact amount
pub async fn set_debt_amount(executor: impl PgExecutor<'_>, id: i64, amount: &str) -> Result<()> {
    sqlx::query(r#"UPDATE debts SET amount = $1::NUMERIC, updated_at = NOW() WHERE id = $2"#)
        .bind(amount)
        .bind(id)
        .execute(executor)
        .await
        .wrap_err_with(|| format!("Failed to set debt {} amount", id))?;

    Ok(())
}

/// Delete a debt row (it reached zero)
pub async fn delete_debt(executor: impl PgExecutor<'_>, id: i64) -> Result<()> {
    sqlx::query(r#"DELETE FROM debts WHERE id = $1"#)
        .bind(id)
        .execute(executor)
        .await
        .wrap_err_with(|| format!("Failed to delete debt {}", id))?;

    Ok(())
}

/// Enumerate a participant's debts, optionally filtered by equivalent.
/// `direction` is "outgoing" (pid owes) or "incoming" (owed to pid).
pub async fn list_debts(
    pool: &PgPool,
    pid: &str,
    direction: &str,
    equivalent: Option<&str>,
) -> Result<Vec<DebtRow>> {
    let column = if direction == "incoming" {
        "creditor"
    } else {
        "debtor"
    };
    let query = match equivalent {
        Some(_) => format!(
            "SELECT {} FROM debts WHERE {} = $1 AND equivalent = $2 ORDER BY equivalent, debtor, creditor",
            DEBT_SELECT, column
        ),
        None => format!(
            "SELECT {} FROM debts WHERE {} = $1 ORDER BY equivalent, debtor, creditor",
            DEBT_SELECT, column
        ),
    };
    let mut q = sqlx::query_as::<_, DebtRow>(&query).bind(pid);
    if let Some(code) = equivalent {
        q = q.bind(code);
    }
    q.fetch_all(pool).await.wrap_err("Failed to list debts")
}

/// Per-equivalent debt and credit totals for one participant
pub async fn balance_summary(pool: &PgPool, pid: &str) -> Result<Vec<BalanceRow>> {
    sqlx::query_as::<_, BalanceRow>(
        r#"
        SELECT equivalent,
               COALESCE(SUM(amount) FILTER (WHERE debtor = $1), 0)::TEXT as total_debt,
               COALESCE(SUM(amount) FILTER (WHERE creditor = $1), 0)::TEXT as total_credit
        FROM debts
        WHERE debtor = $1 OR creditor = $1
        GROUP BY equivalent
        ORDER BY equivalent
        "#,
    )
    .bind(pid)
    .fetch_all(pool)
    .await
    .wrap_err("Failed to compute balance summary")
}

// ============ Transactions ============

const TRANSACTION_SELECT: &str = r#"tx_id, tx_type, initiator, payload, signatures, state,
    error_code, error_message, idempotency_key, created_at, updated_at, committed_at"#;

/// Persist a new transaction record
#[allow(clippy::too_many_arguments)]
pub async fn insert_transaction(
    executor: impl PgExecutor<'_>,
    tx_id: Uuid,
    tx_type: &str,
    initiator: Option<&str>,
    payload: &serde_json::Value,
    signatures: &serde_json::Value,
    state: &str,
    idempotency_key: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO transactions (tx_id, tx_type, initiator, payload, signatures, state, idempotency_key)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(tx_id)
    .bind(tx_type)
    .bind(initiator)
    .bind(payload)
    .bind(signatures)
    .bind(state)
    .bind(idempotency_key)
    .execute(executor)
    .await
    .map_err(|e| {
        error!(error = %e, %tx_id, "Database error inserting transaction");
        e
    })
    .wrap_err("Failed to insert transaction")?;

    Ok(())
}

/// Get a transaction by id
pub async fn get_transaction(
    executor: impl PgExecutor<'_>,
    tx_id: Uuid,
) -> Result<Option<TransactionRow>> {
    let query = format!(
        "SELECT {} FROM transactions WHERE tx_id = $1",
        TRANSACTION_SELECT
    );
    sqlx::query_as::<_, TransactionRow>(&query)
        .bind(tx_id)
        .fetch_optional(executor)
        .await
        .wrap_err("Failed to get transaction")
}

/// Find a payment by the client idempotency key
pub async fn find_transaction_by_idempotency(
    executor: impl PgExecutor<'_>,
    initiator: &str,
    idempotency_key: &str,
) -> Result<Option<TransactionRow>> {
    let query = format!(
        "SELECT {} FROM transactions WHERE initiator = $1 AND idempotency_key = $2",
        TRANSACTION_SELECT
    );
    sqlx::query_as::<_, TransactionRow>(&query)
        .bind(initiator)
        .bind(idempotency_key)
        .fetch_optional(executor)
        .await
        .wrap_err("Failed to look up idempotency key")
}

/// Guarded state transition: only applies when the row is still in
/// `expected_state`. Returns true when the transition happened.
pub async fn transition_transaction(
    executor: impl PgExecutor<'_>,
    tx_id: Uuid,
    expected_state: &str,
    new_state: &str,
    error_code: Option<&str>,
    error_message: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE transactions
        SET state = $1,
            error_code = $2,
            error_message = $3,
            committed_at = CASE WHEN $1 = 'COMMITTED' THEN NOW() ELSE committed_at END,
            updated_at = NOW()
        WHERE tx_id = $4 AND state = $5
        "#,
    )
    .bind(new_state)
    .bind(error_code)
    .bind(error_message)
    .bind(tx_id)
    .bind(expected_state)
    .execute(executor)
    .await
    .wrap_err_with(|| format!("Failed to transition transaction {} to {}", tx_id, new_state))?;

    Ok(result.rows_affected() > 0)
}

/// List payments with filters. `pid` matches the payer or payee recorded in
/// the payload; direction narrows to one of the two.
#[allow(clippy::too_many_arguments)]
pub async fn list_payments(
    pool: &PgPool,
    pid: &str,
    direction: Option<&str>,
    equivalent: Option<&str>,
    state: Option<&str>,
    from_date: Option<DateTime<Utc>>,
    to_date: Option<DateTime<Utc>>,
    limit: i64,
    offset: i64,
) -> Result<Vec<TransactionRow>> {
    let mut conditions = vec!["tx_type = 'PAYMENT'".to_string()];
    let mut arg_index = 2;

    match direction {
        Some("outgoing") => conditions.push("payload->>'from' = $1".to_string()),
        Some("incoming") => conditions.push("payload->>'to' = $1".to_string()),
        _ => conditions.push("(payload->>'from' = $1 OR payload->>'to' = $1)".to_string()),
    }
    if equivalent.is_some() {
        conditions.push(format!("payload->>'equivalent' = ${}", arg_index));
        arg_index += 1;
    }
    if state.is_some() {
        conditions.push(format!("state = ${}", arg_index));
        arg_index += 1;
    }
    if from_date.is_some() {
        conditions.push(format!("created_at >= ${}", arg_index));
        arg_index += 1;
    }
    if to_date.is_some() {
        conditions.push(format!("created_at <= ${}", arg_index));
        arg_index += 1;
    }

    let query = format!(
        "SELECT {} FROM transactions WHERE {} ORDER BY created_at DESC LIMIT ${} OFFSET ${}",
        TRANSACTION_SELECT,
        conditions.join(" AND "),
        arg_index,
        arg_index + 1
    );

    let mut q = sqlx::query_as::<_, TransactionRow>(&query).bind(pid);
    if let Some(code) = equivalent {
        q = q.bind(code.to_string());
    }
    if let Some(s) = state {
        q = q.bind(s.to_string());
    }
    if let Some(d) = from_date {
        q = q.bind(d);
    }
    if let Some(d) = to_date {
        q = q.bind(d);
    }
    q = q.bind(limit).bind(offset);

    q.fetch_all(pool).await.wrap_err("Failed to list payments")
}

/// Transactions still PREPARED whose reservations have expired
pub async fn stale_prepared_transactions(pool: &PgPool) -> Result<Vec<TransactionRow>> {
    let query = format!(
        "SELECT {} FROM transactions
         WHERE state = 'PREPARED' AND tx_id IN (
             SELECT tx_id FROM prepare_locks WHERE expires_at < NOW()
         )",
        TRANSACTION_SELECT
    );
    sqlx::query_as::<_, TransactionRow>(&query)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to find stale prepared transactions")
}

/// Transactions stuck in NEW past the grace period
pub async fn stale_new_transactions(
    pool: &PgPool,
    grace_seconds: i64,
) -> Result<Vec<TransactionRow>> {
    let query = format!(
        "SELECT {} FROM transactions
         WHERE state = 'NEW' AND created_at < NOW() - make_interval(secs => $1)",
        TRANSACTION_SELECT
    );
    sqlx::query_as::<_, TransactionRow>(&query)
        .bind(grace_seconds as f64)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to find stale new transactions")
}

/// Count transactions per state (health endpoint)
pub async fn count_transactions_in_state(pool: &PgPool, state: &str) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM transactions WHERE state = $1"#)
        .bind(state)
        .fetch_one(pool)
        .await
        .wrap_err("Failed to count transactions")?;

    Ok(row.0)
}

// ============ Prepare locks ============

const PREPARE_LOCK_SELECT: &str = r#"id, tx_id, debtor, creditor, equivalent,
    amount::TEXT as amount, segment_key, expires_at, created_at"#;

/// Insert a capacity reservation for one segment
#[allow(clippy::too_many_arguments)]
pub async fn insert_prepare_lock(
    conn: &mut PgConnection,
    tx_id: Uuid,
    debtor: &str,
    creditor: &str,
    equivalent: &str,
    amount: &str,
    segment_key: &str,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO prepare_locks (tx_id, debtor, creditor, equivalent, amount, segment_key, expires_at)
        VALUES ($1, $2, $3, $4, $5::NUMERIC, $6, $7)
        "#,
    )
    .bind(tx_id)
    .bind(debtor)
    .bind(creditor)
    .bind(equivalent)
    .bind(amount)
    .bind(segment_key)
    .bind(expires_at)
    .execute(conn)
    .await
    .wrap_err("Failed to insert prepare lock")?;

    Ok(())
}

/// All reservations held by one transaction
pub async fn get_locks_for_tx(
    executor: impl PgExecutor<'_>,
    tx_id: Uuid,
) -> Result<Vec<PrepareLockRow>> {
    let query = format!(
        "SELECT {} FROM prepare_locks WHERE tx_id = $1 ORDER BY debtor, creditor, equivalent",
        PREPARE_LOCK_SELECT
    );
    sqlx::query_as::<_, PrepareLockRow>(&query)
        .bind(tx_id)
        .fetch_all(executor)
        .await
        .wrap_err("Failed to get locks for transaction")
}

/// Drop every reservation held by one transaction
pub async fn delete_locks_for_tx(executor: impl PgExecutor<'_>, tx_id: Uuid) -> Result<u64> {
    let result = sqlx::query(r#"DELETE FROM prepare_locks WHERE tx_id = $1"#)
        .bind(tx_id)
        .execute(executor)
        .await
        .wrap_err("Failed to delete locks for transaction")?;

    Ok(result.rows_affected())
}

/// Sum of live reservations on one directed segment, excluding one
/// transaction's own locks
pub async fn sum_reserved_on_segment(
    conn: &mut PgConnection,
    debtor: &str,
    creditor: &str,
    equivalent: &str,
    exclude_tx: Uuid,
) -> Result<String> {
    let row: (String,) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(amount), 0)::TEXT FROM prepare_locks
        WHERE debtor = $1 AND creditor = $2 AND equivalent = $3
          AND tx_id <> $4 AND expires_at > NOW()
        "#,
    )
    .bind(debtor)
    .bind(creditor)
    .bind(equivalent)
    .bind(exclude_tx)
    .fetch_one(conn)
    .await
    .wrap_err("Failed to sum segment reservations")?;

    Ok(row.0)
}

/// Live reservations in one equivalent (router derating read)
pub async fn get_reservations_for_equivalent(
    executor: impl PgExecutor<'_>,
    equivalent: &str,
) -> Result<Vec<PrepareLockRow>> {
    let query = format!(
        "SELECT {} FROM prepare_locks WHERE equivalent = $1 AND expires_at > NOW()",
        PREPARE_LOCK_SELECT
    );
    sqlx::query_as::<_, PrepareLockRow>(&query)
        .bind(equivalent)
        .fetch_all(executor)
        .await
        .wrap_err("Failed to get reservations for equivalent")
}

/// Reservations whose TTL has lapsed (recovery sweep)
pub async fn get_expired_locks(pool: &PgPool) -> Result<Vec<PrepareLockRow>> {
    let query = format!(
        "SELECT {} FROM prepare_locks WHERE expires_at < NOW()",
        PREPARE_LOCK_SELECT
    );
    sqlx::query_as::<_, PrepareLockRow>(&query)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to get expired locks")
}

/// Delete locks whose parent transaction is already terminal. The FK prevents
/// true orphans; terminal parents are the leak the sweep closes.
pub async fn delete_orphan_locks(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM prepare_locks l
        USING transactions t
        WHERE t.tx_id = l.tx_id AND t.state IN ('COMMITTED', 'ABORTED')
        "#,
    )
    .execute(pool)
    .await
    .wrap_err("Failed to delete orphan locks")?;

    Ok(result.rows_affected())
}

/// Count live reservations (health endpoint)
pub async fn count_active_locks(pool: &PgPool) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as(r#"SELECT COUNT(*) FROM prepare_locks WHERE expires_at > NOW()"#)
            .fetch_one(pool)
            .await
            .wrap_err("Failed to count active locks")?;

    Ok(row.0)
}

// ============ Nonces ============

/// Record a payment nonce. Returns false when it was already seen (replay).
pub async fn insert_nonce(executor: impl PgExecutor<'_>, pid: &str, nonce: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO payment_nonces (pid, nonce)
        VALUES ($1, $2)
        ON CONFLICT (pid, nonce) DO NOTHING
        "#,
    )
    .bind(pid)
    .bind(nonce)
    .execute(executor)
    .await
    .wrap_err("Failed to insert nonce")?;

    Ok(result.rows_affected() > 0)
}

/// Prune nonces older than the retention window
pub async fn prune_nonces(pool: &PgPool, retention: Duration) -> Result<u64> {
    let cutoff = Utc::now() - retention;
    let result = sqlx::query(r#"DELETE FROM payment_nonces WHERE seen_at < $1"#)
        .bind(cutoff)
        .execute(pool)
        .await
        .wrap_err("Failed to prune nonces")?;

    Ok(result.rows_affected())
}

// ============ Audit log ============

/// Append an audit entry
pub async fn insert_audit(
    executor: impl PgExecutor<'_>,
    actor: Option<&str>,
    action: &str,
    details: &serde_json::Value,
) -> Result<i64> {
    let row = sqlx::query(
        r#"
        INSERT INTO audit_log (actor, action, details)
        VALUES ($1, $2, $3)
        RETURNING id
        "#,
    )
    .bind(actor)
    .bind(action)
    .bind(details)
    .fetch_one(executor)
    .await
    .wrap_err("Failed to insert audit entry")?;

    Ok(row.get("id"))
}
