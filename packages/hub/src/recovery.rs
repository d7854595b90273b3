//! Recovery loop.
//!
//! Periodic sweep that expires stale reservations and aborts timed-out
//! transactions, plus the startup reconciliation pass. The sweep is
//! idempotent against concurrent commits: commit holds the segment advisory
//! locks and deletes its reservations in the same database transaction, so
//! the sweep can never observe a lock mid-commit.

use std::time::{Duration, Instant};

use chrono::Utc;
use eyre::Result;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{info, warn};

use creditnet_rs::amount::Amount;
use creditnet_rs::events::HubEvent;
use creditnet_rs::types::{EquivalentCode, Pid};

use crate::config::Config;
use crate::db;
use crate::events::EventBus;
use crate::invariants;
use crate::metrics;
use crate::payments::PaymentEngine;

const NONCE_PRUNE_EVERY: Duration = Duration::from_secs(3600);

pub struct RecoveryWorker {
    engine: PaymentEngine,
    pool: PgPool,
    config: Config,
    events: EventBus,
}

impl RecoveryWorker {
    pub fn new(engine: PaymentEngine, pool: PgPool, config: Config, events: EventBus) -> Self {
        RecoveryWorker {
            engine,
            pool,
            config,
            events,
        }
    }

    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let interval = Duration::from_secs(self.config.recovery.interval_seconds);
        info!(
            interval_secs = self.config.recovery.interval_seconds,
            "Recovery worker started"
        );
        let mut last_prune = Instant::now();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "recovery sweep failed");
                    }
                    if last_prune.elapsed() >= NONCE_PRUNE_EVERY {
                        last_prune = Instant::now();
                        let retention = chrono::Duration::hours(
                            self.config.recovery.nonce_retention_hours as i64,
                        );
                        match db::prune_nonces(&self.pool, retention).await {
                            Ok(0) => {}
                            Ok(n) => info!(pruned = n, "pruned expired payment nonces"),
                            Err(e) => warn!(error = %e, "nonce prune failed"),
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Recovery worker shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// One sweep: abort PREPARED transactions whose reservations lapsed,
    /// abort NEW transactions past the grace period, drop leftover locks.
    async fn sweep(&self) -> Result<()> {
        let expired = db::get_expired_locks(&self.pool).await?;
        if !expired.is_empty() {
            metrics::RECOVERY_EXPIRED_LOCKS.inc_by(expired.len() as u64);
        }

        for tx in db::stale_prepared_transactions(&self.pool).await? {
            match self
                .engine
                .abort(tx.tx_id, "Timeout", "prepare lock expired")
                .await
            {
                Ok(true) => {
                    metrics::RECOVERY_ABORTED_TRANSACTIONS.inc();
                    warn!(tx_id = %tx.tx_id, "aborted expired prepared transaction");
                    if let Some(event) = aborted_event(&tx, "Timeout") {
                        self.events.emit(event);
                    }
                }
                Ok(false) => {} // commit or another sweep won the race
                Err(e) => warn!(tx_id = %tx.tx_id, error = %e, "failed to abort stale transaction"),
            }
        }

        let grace = self.config.recovery.new_grace_seconds as i64;
        for tx in db::stale_new_transactions(&self.pool, grace).await? {
            match self
                .engine
                .abort(tx.tx_id, "OrphanedPrepare", "transaction never left NEW")
                .await
            {
                Ok(true) => {
                    metrics::RECOVERY_ABORTED_TRANSACTIONS.inc();
                    warn!(tx_id = %tx.tx_id, "aborted orphaned transaction");
                    if let Some(event) = aborted_event(&tx, "OrphanedPrepare") {
                        self.events.emit(event);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(tx_id = %tx.tx_id, error = %e, "failed to abort orphaned transaction"),
            }
        }

        let orphans = db::delete_orphan_locks(&self.pool).await?;
        if orphans > 0 {
            warn!(deleted = orphans, "deleted reservations of terminal transactions");
        }

        let active = db::count_active_locks(&self.pool).await?;
        metrics::ACTIVE_PREPARE_LOCKS.set(active);

        Ok(())
    }
}

/// Startup reconciliation (one shot, before the workers start): the same
/// cleanup as a sweep, plus an optional full invariant audit.
pub async fn startup_reconcile(
    engine: &PaymentEngine,
    pool: &PgPool,
    config: &Config,
) -> Result<()> {
    let mut aborted = 0usize;
    for tx in db::stale_prepared_transactions(pool).await? {
        if engine
            .abort(tx.tx_id, "Timeout", "prepare lock expired before restart")
            .await
            .unwrap_or(false)
        {
            aborted += 1;
        }
    }
    for tx in db::stale_new_transactions(pool, config.recovery.new_grace_seconds as i64).await? {
        if engine
            .abort(tx.tx_id, "OrphanedPrepare", "transaction never left NEW")
            .await
            .unwrap_or(false)
        {
            aborted += 1;
        }
    }
    let orphan_locks = db::delete_orphan_locks(pool).await?;
    info!(
        aborted_transactions = aborted,
        orphan_locks, "startup reconciliation complete"
    );

    if config.recovery.audit_on_start {
        let report = invariants::full_audit(pool).await?;
        if report.is_clean() {
            info!(
                equivalents = report.equivalents_checked,
                debts = report.debts_checked,
                "startup invariant audit clean"
            );
        } else {
            for violation in &report.violations {
                tracing::error!(
                    invariant = violation.invariant,
                    equivalent = %violation.equivalent,
                    detail = %violation.detail,
                    "startup invariant audit violation"
                );
            }
            return Err(eyre::eyre!(
                "startup invariant audit found {} violation(s)",
                report.violations.len()
            ));
        }
    }

    Ok(())
}

/// Build the payment.aborted event from a stored payment record, when the
/// payload carries enough to attribute it.
fn aborted_event(tx: &db::TransactionRow, reason: &str) -> Option<HubEvent> {
    let from = Pid::parse(tx.payload.get("from")?.as_str()?).ok()?;
    let to = Pid::parse(tx.payload.get("to")?.as_str()?).ok()?;
    let equivalent = EquivalentCode::parse(tx.payload.get("equivalent")?.as_str()?).ok()?;
    let amount = Amount::parse(tx.payload.get("amount")?.as_str()?).ok()?;
    Some(HubEvent::PaymentAborted {
        tx_id: tx.tx_id,
        from,
        to,
        equivalent,
        amount: amount.canonical(),
        reason: reason.to_string(),
        at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn payment_row(payload: serde_json::Value) -> db::TransactionRow {
        db::TransactionRow {
            tx_id: Uuid::new_v4(),
            tx_type: "PAYMENT".into(),
            initiator: None,
            payload,
            signatures: json!([]),
            state: "PREPARED".into(),
            error_code: None,
            error_message: None,
            idempotency_key: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            committed_at: None,
        }
    }

    #[test]
    fn test_aborted_event_from_full_payload() {
        let from = Pid::from_public_key(&[1; 32]);
        let to = Pid::from_public_key(&[2; 32]);
        let row = payment_row(json!({
            "from": from.as_str(),
            "to": to.as_str(),
            "equivalent": "USD",
            "amount": "50",
        }));
        let event = aborted_event(&row, "Timeout").unwrap();
        assert_eq!(event.kind(), "payment.aborted");
    }

    #[test]
    fn test_aborted_event_tolerates_malformed_payload() {
        let row = payment_row(json!({"something": "else"}));
        assert!(aborted_event(&row, "Timeout").is_none());
    }
}
