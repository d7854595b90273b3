//! The invariant checker.
//!
//! Re-derives the structural properties of the debt graph and asserts them:
//! trust-limit respect, debt asymmetry, no self-debt, and clearing
//! neutrality. Zero-sum holds structurally (every debt row credits one
//! participant and debits the other by the same amount), so the full audit
//! checks the arithmetic around it instead: per-participant net balances
//! recomputed from the rows must agree with the store's own aggregation and
//! cancel overall. The checker never mutates state; a failed check inside a
//! commit aborts that commit. It can also audit the whole graph on demand.

use std::collections::BTreeMap;

use eyre::{Result, WrapErr};
use serde::Serialize;
use sqlx::{PgConnection, PgPool, Row};

use creditnet_rs::amount::Amount;
use creditnet_rs::error::GeoError;
use creditnet_rs::types::{EquivalentCode, Pid};

use crate::db;
use crate::metrics;

/// One detected violation, with the offending edges spelled out.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub invariant: &'static str,
    pub equivalent: String,
    pub detail: String,
}

/// Outcome of a full-graph audit.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub equivalents_checked: usize,
    pub debts_checked: usize,
    pub violations: Vec<Violation>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Verify trust limits, debt asymmetry, and self-debt for the affected
/// pairs, inside the caller's open transaction. Returns
/// `InvariantViolation` naming the offending edges; the caller rolls back.
pub async fn check_affected(
    conn: &mut PgConnection,
    pairs: &[(Pid, Pid)],
    equivalent: &EquivalentCode,
) -> Result<(), GeoError> {
    for (x, y) in pairs {
        if x == y {
            metrics::INVARIANT_VIOLATIONS.inc();
            return Err(GeoError::InvariantViolation(format!(
                "self-debt pair ({x}, {y}) in {equivalent}"
            )));
        }
        let fwd = db::get_debt(&mut *conn, x.as_str(), y.as_str(), equivalent.as_str())
            .await
            .map_err(storage)?;
        let rev = db::get_debt(&mut *conn, y.as_str(), x.as_str(), equivalent.as_str())
            .await
            .map_err(storage)?;

        // At most one direction of a pair may carry positive debt
        if fwd.is_some() && rev.is_some() {
            metrics::INVARIANT_VIOLATIONS.inc();
            return Err(GeoError::InvariantViolation(format!(
                "bidirectional debt between {x} and {y} in {equivalent}"
            )));
        }

        // Every debt is backed by the creditor's trust line
        for debt in [fwd, rev].into_iter().flatten() {
            let amount = Amount::parse(&debt.amount)?;
            let line = db::get_trust_line(
                &mut *conn,
                &debt.creditor,
                &debt.debtor,
                equivalent.as_str(),
            )
            .await
            .map_err(storage)?;
            let backed = match line {
                Some(line) if line.status != "closed" => {
                    Amount::parse(&line.limit_amount)? >= amount
                }
                _ => false,
            };
            if !backed {
                metrics::INVARIANT_VIOLATIONS.inc();
                return Err(GeoError::InvariantViolation(format!(
                    "debt {} -> {} of {} in {} exceeds or lacks the backing trust line",
                    debt.debtor, debt.creditor, debt.amount, equivalent
                )));
            }
        }
    }

    // Zero-sum needs no live check here: a debt row credits one participant
    // and debits the other by the same amount, so any sum over the table
    // cancels identically. The full audit cross-checks the arithmetic.
    Ok(())
}

/// Clearing must leave every touched participant's net balance unchanged.
pub fn check_neutrality(
    equivalent: &EquivalentCode,
    before: &BTreeMap<String, Amount>,
    after: &BTreeMap<String, Amount>,
) -> Result<(), GeoError> {
    for (pid, pre) in before {
        let post = after.get(pid).cloned().unwrap_or_else(Amount::zero);
        if *pre != post {
            metrics::INVARIANT_VIOLATIONS.inc();
            return Err(GeoError::InvariantViolation(format!(
                "clearing changed {pid} net balance in {equivalent}: {pre} -> {post}"
            )));
        }
    }
    Ok(())
}

/// Net balance (credits minus debts) per listed participant, on the
/// caller's connection. Participants with no debt rows net to zero.
pub async fn net_balances(
    conn: &mut PgConnection,
    pids: &[String],
    equivalent: &str,
) -> Result<BTreeMap<String, Amount>> {
    let rows = sqlx::query(
        r#"
        SELECT pid, COALESCE(SUM(delta), 0)::TEXT AS net
        FROM (
            SELECT creditor AS pid, amount AS delta
            FROM debts WHERE equivalent = $2 AND creditor = ANY($1)
            UNION ALL
            SELECT debtor AS pid, -amount AS delta
            FROM debts WHERE equivalent = $2 AND debtor = ANY($1)
        ) deltas
        GROUP BY pid
        "#,
    )
    .bind(pids)
    .bind(equivalent)
    .fetch_all(conn)
    .await
    .wrap_err("Failed to compute net balances")?;

    let mut balances: BTreeMap<String, Amount> = pids
        .iter()
        .map(|p| (p.clone(), Amount::zero()))
        .collect();
    for row in rows {
        let pid: String = row.get("pid");
        let net: String = row.get("net");
        balances.insert(pid, Amount::parse(&net).map_err(|e| eyre::eyre!("{e}"))?);
    }
    Ok(balances)
}

/// Per-participant net balances recomputed from debt rows, independent of
/// the store's aggregation.
fn recompute_nets(debts: &[db::DebtRow]) -> Result<BTreeMap<String, Amount>, GeoError> {
    let mut nets: BTreeMap<String, Amount> = BTreeMap::new();
    for debt in debts {
        let amount = Amount::parse(&debt.amount)?;
        let credit = nets
            .entry(debt.creditor.clone())
            .or_insert_with(Amount::zero);
        *credit = &*credit + &amount;
        let debit = nets.entry(debt.debtor.clone()).or_insert_with(Amount::zero);
        *debit = &*debit - &amount;
    }
    Ok(nets)
}

/// Full-graph audit: every invariant, every equivalent. Read-only.
pub async fn full_audit(pool: &PgPool) -> Result<IntegrityReport> {
    let mut violations = Vec::new();
    let mut debts_checked = 0usize;

    // Debts not backed by a live trust line with a sufficient limit
    let unbacked = sqlx::query(
        r#"
        SELECT d.debtor, d.creditor, d.equivalent, d.amount::TEXT AS amount
        FROM debts d
        LEFT JOIN trust_lines t
            ON t.from_participant = d.creditor
           AND t.to_participant = d.debtor
           AND t.equivalent = d.equivalent
           AND t.status <> 'closed'
        WHERE t.id IS NULL OR t.limit_amount < d.amount
        "#,
    )
    .fetch_all(pool)
    .await
    .wrap_err("Failed to audit trust limits")?;
    for row in unbacked {
        violations.push(Violation {
            invariant: "trust_limit",
            equivalent: row.get("equivalent"),
            detail: format!(
                "debt {} -> {} of {} exceeds or lacks its backing trust line",
                row.get::<String, _>("debtor"),
                row.get::<String, _>("creditor"),
                row.get::<String, _>("amount"),
            ),
        });
    }

    // Both directions positive for the same pair
    let bidirectional = sqlx::query(
        r#"
        SELECT a.debtor, a.creditor, a.equivalent
        FROM debts a
        JOIN debts b
            ON a.debtor = b.creditor AND a.creditor = b.debtor AND a.equivalent = b.equivalent
        WHERE a.debtor < a.creditor
        "#,
    )
    .fetch_all(pool)
    .await
    .wrap_err("Failed to audit debt asymmetry")?;
    for row in bidirectional {
        violations.push(Violation {
            invariant: "debt_asymmetry",
            equivalent: row.get("equivalent"),
            detail: format!(
                "bidirectional debt between {} and {}",
                row.get::<String, _>("debtor"),
                row.get::<String, _>("creditor"),
            ),
        });
    }

    // Self-debt (the CHECK constraint makes this unreachable; the audit
    // still looks, since the audit is the circuit breaker for the schema too)
    let self_debt = sqlx::query(r#"SELECT debtor, equivalent FROM debts WHERE debtor = creditor"#)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to audit self-debt")?;
    for row in self_debt {
        violations.push(Violation {
            invariant: "self_debt",
            equivalent: row.get("equivalent"),
            detail: format!("self-debt for {}", row.get::<String, _>("debtor")),
        });
    }

    // Zero-sum per equivalent. The sum over the table cancels by
    // construction, so the meaningful assertion is consistency: each
    // participant's net recomputed from the fetched rows must match the
    // store's own aggregation, and the recomputed nets must cancel.
    let equivalents = db::list_equivalents(pool).await?;
    let equivalents_checked = equivalents.len();
    for eq in &equivalents {
        let debts = db::get_debts_for_equivalent(pool, &eq.code).await?;
        debts_checked += debts.len();

        let recomputed = recompute_nets(&debts)?;
        let pids: Vec<String> = recomputed.keys().cloned().collect();
        let mut conn = pool.acquire().await.wrap_err("Failed to acquire connection")?;
        let aggregated = net_balances(&mut conn, &pids, &eq.code).await?;

        let mut total = Amount::zero();
        for (pid, net) in &recomputed {
            total = &total + net;
            let stored = aggregated.get(pid).cloned().unwrap_or_else(Amount::zero);
            if *net != stored {
                violations.push(Violation {
                    invariant: "zero_sum",
                    equivalent: eq.code.clone(),
                    detail: format!(
                        "net balance of {pid} disagrees: store aggregation says {stored}, row recomputation says {net}"
                    ),
                });
            }
        }
        if !total.is_zero() {
            violations.push(Violation {
                invariant: "zero_sum",
                equivalent: eq.code.clone(),
                detail: format!("recomputed net balances sum to {total}, not zero"),
            });
        }
    }

    Ok(IntegrityReport {
        equivalents_checked,
        debts_checked,
        violations,
    })
}

fn storage(e: eyre::Report) -> GeoError {
    GeoError::Storage(format!("{e:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn amounts(pairs: &[(&str, &str)]) -> BTreeMap<String, Amount> {
        pairs
            .iter()
            .map(|(pid, v)| (pid.to_string(), Amount::parse(v).unwrap()))
            .collect()
    }

    fn debt(debtor: &str, creditor: &str, amount: &str) -> db::DebtRow {
        db::DebtRow {
            id: 0,
            debtor: debtor.to_string(),
            creditor: creditor.to_string(),
            equivalent: "USD".to_string(),
            amount: amount.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_recomputed_nets_cancel() {
        let debts = vec![debt("a", "b", "100"), debt("b", "c", "70"), debt("c", "a", "40")];
        let nets = recompute_nets(&debts).unwrap();
        assert_eq!(nets["a"], Amount::parse("-60").unwrap());
        assert_eq!(nets["b"], Amount::parse("30").unwrap());
        assert_eq!(nets["c"], Amount::parse("30").unwrap());
        let total = nets.values().fold(Amount::zero(), |acc, n| &acc + n);
        assert!(total.is_zero());
    }

    #[test]
    fn test_recomputed_nets_handle_fractions() {
        let debts = vec![debt("a", "b", "0.10"), debt("b", "a", "0.25")];
        // Rows like this would violate asymmetry, but the arithmetic must
        // still net them exactly
        let nets = recompute_nets(&debts).unwrap();
        assert_eq!(nets["a"], Amount::parse("0.15").unwrap());
        assert_eq!(nets["b"], Amount::parse("-0.15").unwrap());
    }

    #[test]
    fn test_recomputed_nets_reject_malformed_amounts() {
        let debts = vec![debt("a", "b", "not-a-number")];
        assert!(recompute_nets(&debts).is_err());
    }

    #[test]
    fn test_neutrality_accepts_unchanged_balances() {
        let eq = EquivalentCode::parse("USD").unwrap();
        let before = amounts(&[("a", "-60"), ("b", "30"), ("c", "30")]);
        let after = amounts(&[("a", "-60"), ("b", "30"), ("c", "30")]);
        assert!(check_neutrality(&eq, &before, &after).is_ok());
    }

    #[test]
    fn test_neutrality_rejects_shifted_balances() {
        let eq = EquivalentCode::parse("USD").unwrap();
        let before = amounts(&[("a", "-60"), ("b", "30"), ("c", "30")]);
        let after = amounts(&[("a", "-50"), ("b", "20"), ("c", "30")]);
        let err = check_neutrality(&eq, &before, &after).unwrap_err();
        assert!(matches!(err, GeoError::InvariantViolation(_)));
    }

    #[test]
    fn test_neutrality_treats_missing_as_zero() {
        let eq = EquivalentCode::parse("USD").unwrap();
        // A participant whose last debt was cleared away disappears from the
        // post map; that is only neutral if they were at zero before.
        let before = amounts(&[("a", "0")]);
        let after = BTreeMap::new();
        assert!(check_neutrality(&eq, &before, &after).is_ok());

        let before = amounts(&[("a", "10")]);
        assert!(check_neutrality(&eq, &before, &after).is_err());
    }
}
