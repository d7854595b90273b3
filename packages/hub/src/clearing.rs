//! The clearing engine.
//!
//! Finds cycles of positive debts in one equivalent and nets every edge down
//! by the cycle minimum, leaving all net balances unchanged. Triangles and
//! quadrilaterals are discovered with SQL self-joins (the on-demand path
//! after a payment commit); the periodic batch walks an in-memory snapshot
//! with a bounded DFS for longer cycles. Every candidate is re-validated
//! under FOR UPDATE row locks before anything is netted.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use eyre::{Result, WrapErr};
use serde::Serialize;
use serde_json::json;
use sqlx::{PgPool, Row};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use creditnet_rs::amount::Amount;
use creditnet_rs::error::GeoError;
use creditnet_rs::events::HubEvent;
use creditnet_rs::types::{EquivalentCode, Pid, TxState, TxType};

use crate::config::Config;
use crate::db;
use crate::events::EventBus;
use crate::invariants;
use crate::metrics;

/// Consecutive cycles one on-demand trigger may net before yielding.
const TRIGGER_SAFETY_BREAK: usize = 10;

/// A discovered cycle, not yet applied.
#[derive(Debug, Clone, Serialize)]
pub struct CycleCandidate {
    pub equivalent: String,
    /// Participants in debtor order: pids[i] owes pids[i+1], last owes first.
    pub pids: Vec<String>,
    /// Cycle minimum at discovery time; recomputed under locks on apply.
    pub delta: String,
}

/// Discover 3-cycles with a parameterized self-join. Only edges whose
/// backing trust line opted into auto-clearing qualify, and any live
/// reservation on an overlapping edge disqualifies the cycle.
pub async fn find_triangles(
    pool: &PgPool,
    equivalent: &str,
    limit: i64,
) -> Result<Vec<CycleCandidate>> {
    let rows = sqlx::query(
        r#"
        SELECT d1.debtor AS a, d1.creditor AS b, d2.creditor AS c,
               LEAST(d1.amount, d2.amount, d3.amount)::TEXT AS delta
        FROM debts d1
        JOIN debts d2
            ON d2.debtor = d1.creditor AND d2.equivalent = d1.equivalent
        JOIN debts d3
            ON d3.debtor = d2.creditor AND d3.creditor = d1.debtor
           AND d3.equivalent = d1.equivalent
        JOIN trust_lines t1
            ON t1.from_participant = d1.creditor AND t1.to_participant = d1.debtor
           AND t1.equivalent = d1.equivalent AND t1.auto_clearing AND t1.status = 'active'
        JOIN trust_lines t2
            ON t2.from_participant = d2.creditor AND t2.to_participant = d2.debtor
           AND t2.equivalent = d2.equivalent AND t2.auto_clearing AND t2.status = 'active'
        JOIN trust_lines t3
            ON t3.from_participant = d3.creditor AND t3.to_participant = d3.debtor
           AND t3.equivalent = d3.equivalent AND t3.auto_clearing AND t3.status = 'active'
        WHERE d1.equivalent = $1
          AND d1.debtor < d2.debtor AND d1.debtor < d3.debtor
          AND NOT EXISTS (
              SELECT 1 FROM prepare_locks l
              WHERE l.equivalent = d1.equivalent AND l.expires_at > NOW()
                AND ((l.debtor = d1.debtor AND l.creditor = d1.creditor)
                  OR (l.debtor = d1.creditor AND l.creditor = d1.debtor)
                  OR (l.debtor = d2.debtor AND l.creditor = d2.creditor)
                  OR (l.debtor = d2.creditor AND l.creditor = d2.debtor)
                  OR (l.debtor = d3.debtor AND l.creditor = d3.creditor)
                  OR (l.debtor = d3.creditor AND l.creditor = d3.debtor))
          )
        ORDER BY a, b, c
        LIMIT $2
        "#,
    )
    .bind(equivalent)
    .bind(limit)
    .fetch_all(pool)
    .await
    .wrap_err("Failed to discover triangles")?;

    Ok(rows
        .into_iter()
        .map(|row| CycleCandidate {
            equivalent: equivalent.to_string(),
            pids: vec![row.get("a"), row.get("b"), row.get("c")],
            delta: canonical_amount(row.get("delta")),
        })
        .collect())
}

/// NUMERIC comes back at storage scale; candidates report canonical form.
fn canonical_amount(raw: String) -> String {
    Amount::parse(&raw).map(|a| a.canonical()).unwrap_or(raw)
}

/// Discover 4-cycles, same qualification rules as [`find_triangles`].
pub async fn find_quadrilaterals(
    pool: &PgPool,
    equivalent: &str,
    limit: i64,
) -> Result<Vec<CycleCandidate>> {
    let rows = sqlx::query(
        r#"
        SELECT d1.debtor AS a, d1.creditor AS b, d2.creditor AS c, d3.creditor AS d,
               LEAST(d1.amount, d2.amount, d3.amount, d4.amount)::TEXT AS delta
        FROM debts d1
        JOIN debts d2
            ON d2.debtor = d1.creditor AND d2.equivalent = d1.equivalent
        JOIN debts d3
            ON d3.debtor = d2.creditor AND d3.equivalent = d1.equivalent
        JOIN debts d4
            ON d4.debtor = d3.creditor AND d4.creditor = d1.debtor
           AND d4.equivalent = d1.equivalent
        JOIN trust_lines t1
            ON t1.from_participant = d1.creditor AND t1.to_participant = d1.debtor
           AND t1.equivalent = d1.equivalent AND t1.auto_clearing AND t1.status = 'active'
        JOIN trust_lines t2
            ON t2.from_participant = d2.creditor AND t2.to_participant = d2.debtor
           AND t2.equivalent = d2.equivalent AND t2.auto_clearing AND t2.status = 'active'
        JOIN trust_lines t3
            ON t3.from_participant = d3.creditor AND t3.to_participant = d3.debtor
           AND t3.equivalent = d3.equivalent AND t3.auto_clearing AND t3.status = 'active'
        JOIN trust_lines t4
            ON t4.from_participant = d4.creditor AND t4.to_participant = d4.debtor
           AND t4.equivalent = d4.equivalent AND t4.auto_clearing AND t4.status = 'active'
        WHERE d1.equivalent = $1
          AND d1.debtor < d2.debtor AND d1.debtor < d3.debtor AND d1.debtor < d4.debtor
          AND d2.debtor <> d4.debtor
          AND NOT EXISTS (
              SELECT 1 FROM prepare_locks l
              WHERE l.equivalent = d1.equivalent AND l.expires_at > NOW()
                AND ((l.debtor = d1.debtor AND l.creditor = d1.creditor)
                  OR (l.debtor = d1.creditor AND l.creditor = d1.debtor)
                  OR (l.debtor = d2.debtor AND l.creditor = d2.creditor)
                  OR (l.debtor = d2.creditor AND l.creditor = d2.debtor)
                  OR (l.debtor = d3.debtor AND l.creditor = d3.creditor)
                  OR (l.debtor = d3.creditor AND l.creditor = d3.debtor)
                  OR (l.debtor = d4.debtor AND l.creditor = d4.creditor)
                  OR (l.debtor = d4.creditor AND l.creditor = d4.debtor))
          )
        ORDER BY a, b, c, d
        LIMIT $2
        "#,
    )
    .bind(equivalent)
    .bind(limit)
    .fetch_all(pool)
    .await
    .wrap_err("Failed to discover quadrilaterals")?;

    Ok(rows
        .into_iter()
        .map(|row| CycleCandidate {
            equivalent: equivalent.to_string(),
            pids: vec![row.get("a"), row.get("b"), row.get("c"), row.get("d")],
            delta: canonical_amount(row.get("delta")),
        })
        .collect())
}

/// Longer cycles for the periodic batch: DFS over a snapshot of the
/// equivalent's clearable edges. The snapshot can go stale; the locked
/// re-validation in [`apply_cycle`] is what makes that safe.
pub async fn find_cycles_dfs(
    pool: &PgPool,
    equivalent: &str,
    max_len: usize,
    max_cycles: usize,
) -> Result<Vec<CycleCandidate>> {
    let rows = sqlx::query(
        r#"
        SELECT d.debtor, d.creditor, d.amount::TEXT AS amount
        FROM debts d
        JOIN trust_lines t
            ON t.from_participant = d.creditor AND t.to_participant = d.debtor
           AND t.equivalent = d.equivalent AND t.auto_clearing AND t.status = 'active'
        WHERE d.equivalent = $1
          AND NOT EXISTS (
              SELECT 1 FROM prepare_locks l
              WHERE l.equivalent = d.equivalent AND l.expires_at > NOW()
                AND ((l.debtor = d.debtor AND l.creditor = d.creditor)
                  OR (l.debtor = d.creditor AND l.creditor = d.debtor))
          )
        "#,
    )
    .bind(equivalent)
    .fetch_all(pool)
    .await
    .wrap_err("Failed to load clearable edges")?;

    let mut edges: Vec<(String, String, String)> = Vec::with_capacity(rows.len());
    for row in rows {
        edges.push((row.get("debtor"), row.get("creditor"), row.get("amount")));
    }
    Ok(cycles_in_edges(equivalent, &edges, max_len, max_cycles))
}

/// Pure cycle search over an edge list. Cycles are canonicalized by starting
/// at their smallest pid; only nodes greater than the start are visited, so
/// each directed cycle appears exactly once.
fn cycles_in_edges(
    equivalent: &str,
    edges: &[(String, String, String)],
    max_len: usize,
    max_cycles: usize,
) -> Vec<CycleCandidate> {
    let mut adjacency: BTreeMap<&str, Vec<(&str, &str)>> = BTreeMap::new();
    for (debtor, creditor, amount) in edges {
        adjacency
            .entry(debtor.as_str())
            .or_default()
            .push((creditor.as_str(), amount.as_str()));
    }
    for nexts in adjacency.values_mut() {
        nexts.sort_unstable();
    }

    let mut found = Vec::new();
    let starts: Vec<&str> = adjacency.keys().copied().collect();
    for start in starts {
        if found.len() >= max_cycles {
            break;
        }
        let mut path: Vec<(&str, &str)> = vec![(start, "")];
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        visited.insert(start);
        dfs_cycles(
            &adjacency,
            start,
            start,
            max_len,
            &mut path,
            &mut visited,
            &mut found,
            max_cycles,
            equivalent,
        );
    }
    found
}

#[allow(clippy::too_many_arguments)]
fn dfs_cycles<'a>(
    adjacency: &BTreeMap<&'a str, Vec<(&'a str, &'a str)>>,
    start: &'a str,
    current: &'a str,
    hops_left: usize,
    path: &mut Vec<(&'a str, &'a str)>,
    visited: &mut BTreeSet<&'a str>,
    found: &mut Vec<CycleCandidate>,
    max_cycles: usize,
    equivalent: &str,
) {
    if found.len() >= max_cycles || hops_left == 0 {
        return;
    }
    let Some(nexts) = adjacency.get(current) else {
        return;
    };
    for &(next, amount) in nexts {
        if next == start {
            if path.len() >= 3 {
                let mut amounts: Vec<&str> = path.iter().skip(1).map(|&(_, a)| a).collect();
                amounts.push(amount);
                let delta = amounts
                    .iter()
                    .filter_map(|a| Amount::parse(a).ok())
                    .min()
                    .unwrap_or_else(Amount::zero);
                found.push(CycleCandidate {
                    equivalent: equivalent.to_string(),
                    pids: path.iter().map(|(p, _)| p.to_string()).collect(),
                    delta: delta.canonical(),
                });
                if found.len() >= max_cycles {
                    return;
                }
            }
            continue;
        }
        // Canonical start is the smallest pid in the cycle
        if next < start || visited.contains(next) {
            continue;
        }
        visited.insert(next);
        path.push((next, amount));
        dfs_cycles(
            adjacency, start, next, hops_left - 1, path, visited, found, max_cycles, equivalent,
        );
        path.pop();
        visited.remove(next);
    }
}

/// Net one cycle inside a single database transaction. Returns the clearing
/// transaction id, or None when the cycle no longer qualifies (an edge went
/// away, shrank to a different shape, lost its auto-clearing consent, or
/// picked up a reservation).
pub async fn apply_cycle(
    pool: &PgPool,
    events: &EventBus,
    equivalent: &EquivalentCode,
    pids: &[String],
) -> Result<Option<Uuid>, GeoError> {
    let code = equivalent.as_str();
    let n = pids.len();
    let mut dbtx = pool.begin().await.map_err(sql_storage)?;

    let cycle_pids: Vec<String> = pids.to_vec();
    let before = invariants::net_balances(&mut dbtx, &cycle_pids, code)
        .await
        .map_err(storage)?;

    // Lock the cycle's debt rows in (debtor, creditor) order, matching the
    // payment engine's row ordering.
    let mut edges: Vec<(String, String)> = (0..n)
        .map(|i| (pids[i].clone(), pids[(i + 1) % n].clone()))
        .collect();
    edges.sort();

    let mut locked = BTreeMap::new();
    for (debtor, creditor) in &edges {
        match db::get_debt_for_update(&mut dbtx, debtor, creditor, code)
            .await
            .map_err(storage)?
        {
            Some(row) => {
                locked.insert((debtor.clone(), creditor.clone()), row);
            }
            None => {
                debug!(%equivalent, ?edges, "cycle edge vanished before locking; skipping");
                metrics::record_clearing_skip("edge_gone");
                return Ok(None);
            }
        }
    }

    // Re-verify consent and reservations from the locked state
    for (debtor, creditor) in &edges {
        let line = db::get_trust_line(&mut *dbtx, creditor, debtor, code)
            .await
            .map_err(storage)?;
        let consents = matches!(&line, Some(l) if l.auto_clearing && l.status == "active");
        if !consents {
            metrics::record_clearing_skip("auto_clearing_off");
            return Ok(None);
        }
        let reserved = Amount::parse(
            &db::sum_reserved_on_segment(&mut dbtx, debtor, creditor, code, Uuid::nil())
                .await
                .map_err(storage)?,
        )?;
        let reserved_rev = Amount::parse(
            &db::sum_reserved_on_segment(&mut dbtx, creditor, debtor, code, Uuid::nil())
                .await
                .map_err(storage)?,
        )?;
        if reserved.is_positive() || reserved_rev.is_positive() {
            metrics::record_clearing_skip("reserved");
            return Ok(None);
        }
    }

    // Recompute the cycle minimum from the locked rows
    let mut delta: Option<Amount> = None;
    for row in locked.values() {
        let amount = Amount::parse(&row.amount)?;
        delta = Some(match delta {
            None => amount,
            Some(d) => d.min(amount),
        });
    }
    let delta = delta.unwrap_or_else(Amount::zero);
    if !delta.is_positive() {
        metrics::record_clearing_skip("zero_delta");
        return Ok(None);
    }

    // Uniform decrement; rows reaching zero are deleted in this transaction
    for row in locked.values() {
        let amount = Amount::parse(&row.amount)?;
        let rest = &amount - &delta;
        if rest.is_positive() {
            db::set_debt_amount(&mut *dbtx, row.id, &rest.canonical())
                .await
                .map_err(storage)?;
        } else {
            db::delete_debt(&mut *dbtx, row.id).await.map_err(storage)?;
        }
    }

    let tx_id = Uuid::new_v4();
    let payload = json!({
        "version": 1,
        "equivalent": code,
        "cycle": cycle_pids,
        "delta": delta.canonical(),
    });
    db::insert_transaction(
        &mut *dbtx,
        tx_id,
        TxType::Clearing.as_str(),
        None,
        &payload,
        &json!([]),
        TxState::Committed.as_str(),
        None,
    )
    .await
    .map_err(storage)?;

    // Structural checks over the touched pairs, then neutrality
    let pairs: Vec<(Pid, Pid)> = edges
        .iter()
        .map(|(d, c)| Ok((Pid::parse(d)?, Pid::parse(c)?)))
        .collect::<Result<_, GeoError>>()?;
    invariants::check_affected(&mut dbtx, &pairs, equivalent).await?;
    let after = invariants::net_balances(&mut dbtx, &cycle_pids, code)
        .await
        .map_err(storage)?;
    invariants::check_neutrality(equivalent, &before, &after)?;

    dbtx.commit().await.map_err(sql_storage)?;

    metrics::CLEARING_CYCLES_APPLIED.inc();
    info!(
        %tx_id,
        %equivalent,
        cycle_len = n,
        delta = %delta,
        "clearing committed"
    );
    events.emit(HubEvent::ClearingCommitted {
        tx_id,
        equivalent: equivalent.clone(),
        cycle: cycle_pids
            .iter()
            .map(|p| Pid::parse(p))
            .collect::<Result<_, _>>()?,
        delta: delta.canonical(),
        at: Utc::now(),
    });

    Ok(Some(tx_id))
}

/// On-demand trigger after a committed payment: look for short cycles that
/// include any of the touched participants, net them, and stop at the safety
/// break so one trigger cannot starve other work.
pub async fn trigger_after_payment(
    pool: &PgPool,
    config: &Config,
    events: &EventBus,
    equivalent: &EquivalentCode,
    touched: &[(Pid, Pid)],
) -> Result<usize, GeoError> {
    let touched_pids: BTreeSet<String> = touched
        .iter()
        .flat_map(|(a, b)| [a.as_str().to_string(), b.as_str().to_string()])
        .collect();

    let mut applied = 0usize;
    while applied < TRIGGER_SAFETY_BREAK {
        let mut candidates =
            find_triangles(pool, equivalent.as_str(), 32).await.map_err(storage)?;
        if config.clearing.trigger_cycles_max_len >= 4 {
            candidates.extend(
                find_quadrilaterals(pool, equivalent.as_str(), 32)
                    .await
                    .map_err(storage)?,
            );
        }
        let next = candidates
            .into_iter()
            .find(|c| c.pids.iter().any(|p| touched_pids.contains(p)));
        let Some(candidate) = next else { break };
        match apply_cycle(pool, events, equivalent, &candidate.pids).await? {
            Some(_) => applied += 1,
            // The candidate stopped qualifying between discovery and
            // locking; rediscovery would offer it again, so stop here and
            // let the periodic batch retry later.
            None => break,
        }
    }
    Ok(applied)
}

/// One full clearing pass over an equivalent, bounded by
/// `clearing.max_cycles_per_run`. Used by the periodic batch and the
/// privileged run-clearing operation.
pub async fn run_batch(
    pool: &PgPool,
    config: &Config,
    events: &EventBus,
    equivalent: &EquivalentCode,
) -> Result<usize, GeoError> {
    let max = config.clearing.max_cycles_per_run as usize;
    let mut applied = 0usize;
    let mut skipped_streak = 0usize;

    while applied < max {
        let mut candidates = find_triangles(pool, equivalent.as_str(), 64)
            .await
            .map_err(storage)?;
        candidates.extend(
            find_quadrilaterals(pool, equivalent.as_str(), 64)
                .await
                .map_err(storage)?,
        );
        if config.clearing.periodic_cycles_max_len > 4 {
            candidates.extend(
                find_cycles_dfs(
                    pool,
                    equivalent.as_str(),
                    config.clearing.periodic_cycles_max_len as usize,
                    64,
                )
                .await
                .map_err(storage)?,
            );
        }
        let Some(candidate) = candidates.into_iter().nth(skipped_streak) else {
            break;
        };
        match apply_cycle(pool, events, equivalent, &candidate.pids).await? {
            Some(_) => skipped_streak = 0,
            None => {
                skipped_streak += 1;
                continue;
            }
        }
        applied += 1;
    }
    Ok(applied)
}

/// Candidate cycles for the diagnostic endpoint; nothing is applied.
pub async fn list_candidates(
    pool: &PgPool,
    config: &Config,
    equivalent: &str,
) -> Result<Vec<CycleCandidate>> {
    let mut candidates = find_triangles(pool, equivalent, 100).await?;
    candidates.extend(find_quadrilaterals(pool, equivalent, 100).await?);
    if config.clearing.periodic_cycles_max_len > 4 {
        candidates.extend(
            find_cycles_dfs(
                pool,
                equivalent,
                config.clearing.periodic_cycles_max_len as usize,
                100,
            )
            .await?,
        );
    }
    Ok(candidates)
}

/// Fire the on-demand trigger in the background after a payment commit.
pub fn spawn_trigger(
    pool: PgPool,
    config: Config,
    events: EventBus,
    equivalent: EquivalentCode,
    touched: Vec<(Pid, Pid)>,
) {
    tokio::spawn(async move {
        match trigger_after_payment(&pool, &config, &events, &equivalent, &touched).await {
            Ok(0) => {}
            Ok(applied) => debug!(%equivalent, applied, "post-payment clearing netted cycles"),
            Err(e) => warn!(%equivalent, error = %e, "post-payment clearing failed"),
        }
    });
}

/// Periodic batch worker, one pass over every equivalent per interval.
pub struct ClearingWorker {
    pool: PgPool,
    config: Config,
    events: EventBus,
}

impl ClearingWorker {
    pub fn new(pool: PgPool, config: Config, events: EventBus) -> Self {
        ClearingWorker {
            pool,
            config,
            events,
        }
    }

    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let interval =
            std::time::Duration::from_secs(self.config.clearing.periodic_interval_min * 60);
        info!(interval_min = self.config.clearing.periodic_interval_min, "Clearing worker started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "periodic clearing sweep failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Clearing worker shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn sweep(&self) -> Result<()> {
        let equivalents = db::list_equivalents(&self.pool).await?;
        for eq in equivalents.iter().filter(|e| e.active) {
            let code = EquivalentCode::parse(&eq.code)
                .map_err(|e| eyre::eyre!("stored equivalent code is invalid: {e}"))?;
            match run_batch(&self.pool, &self.config, &self.events, &code).await {
                Ok(0) => {}
                Ok(applied) => info!(equivalent = %code, applied, "periodic clearing netted cycles"),
                Err(e) => warn!(equivalent = %code, error = %e, "periodic clearing failed"),
            }
        }
        Ok(())
    }
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

    fn edge(d: &str, c: &str, a: &str) -> (String, String, String) {
        (d.to_string(), c.to_string(), a.to_string())
    }

    #[test]
    fn test_triangle_found_once() {
        let edges = vec![edge("a", "b", "100"), edge("b", "c", "70"), edge("c", "a", "40")];
        let cycles = cycles_in_edges("USD", &edges, 6, 10);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].pids, vec!["a", "b", "c"]);
        assert_eq!(cycles[0].delta, "40");
    }

    #[test]
    fn test_no_cycle_in_acyclic_graph() {
        let edges = vec![edge("a", "b", "10"), edge("b", "c", "10"), edge("a", "c", "10")];
        assert!(cycles_in_edges("USD", &edges, 6, 10).is_empty());
    }

    #[test]
    fn test_two_hop_back_and_forth_is_not_a_cycle() {
        // A 2-edge loop would be a bidirectional debt, never a clearing target
        let edges = vec![edge("a", "b", "10"), edge("b", "a", "10")];
        assert!(cycles_in_edges("USD", &edges, 6, 10).is_empty());
    }

    #[test]
    fn test_max_len_bounds_search() {
        let edges = vec![
            edge("a", "b", "10"),
            edge("b", "c", "10"),
            edge("c", "d", "10"),
            edge("d", "e", "10"),
            edge("e", "a", "10"),
        ];
        assert!(cycles_in_edges("USD", &edges, 4, 10).is_empty());
        let cycles = cycles_in_edges("USD", &edges, 5, 10);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].pids.len(), 5);
    }

    #[test]
    fn test_delta_is_cycle_minimum() {
        let edges = vec![
            edge("a", "b", "25.5"),
            edge("b", "c", "12.25"),
            edge("c", "d", "100"),
            edge("d", "a", "30"),
        ];
        let cycles = cycles_in_edges("USD", &edges, 6, 10);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].delta, "12.25");
    }

    #[test]
    fn test_max_cycles_cap() {
        // Two disjoint triangles, cap at one
        let edges = vec![
            edge("a", "b", "10"),
            edge("b", "c", "10"),
            edge("c", "a", "10"),
            edge("x", "y", "10"),
            edge("y", "z", "10"),
            edge("z", "x", "10"),
        ];
        assert_eq!(cycles_in_edges("USD", &edges, 6, 1).len(), 1);
        assert_eq!(cycles_in_edges("USD", &edges, 6, 10).len(), 2);
    }
}
