//! Route finding over the live capacity graph.
//!
//! The router is a pure function over a snapshot: the db layer loads active
//! trust lines, positive debts, and live reservations for one equivalent,
//! and everything after that is deterministic. Given identical snapshots and
//! constraints the same plan comes out, tie-broken by hop count, then
//! min-edge capacity, then canonical pid order along the path.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use creditnet_rs::amount::Amount;
use creditnet_rs::error::GeoError;
use creditnet_rs::types::{EquivalentCode, Pid};

use crate::db::models::{DebtRow, PrepareLockRow, TrustLineRow};

/// Hard cap on enumerated candidate paths; prevents pathological graphs from
/// starving the handler even inside the wall-clock budget.
const MAX_CANDIDATE_PATHS: usize = 512;

/// One directed segment of the capacity graph: `from` can move value to `to`.
#[derive(Debug, Clone)]
pub struct Segment {
    pub from: Pid,
    pub to: Pid,
    /// Live capacity: limit - debt(from->to) + debt(to->from) - reserved.
    pub capacity: Amount,
    /// Policy of the backing trust line (owned by `to`, the lender).
    pub lender_can_intermediate: bool,
    pub blocked: BTreeSet<Pid>,
}

/// Immutable view of one equivalent's graph at a point in time.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    pub equivalent: EquivalentCode,
    /// Adjacency by segment source, neighbors in canonical pid order.
    adjacency: BTreeMap<Pid, Vec<Segment>>,
}

impl GraphSnapshot {
    /// Assemble the capacity graph from store rows.
    ///
    /// A trust line `lender -> borrower` with limit L backs the directed
    /// segment `borrower -> lender`; flowing along it either grows the
    /// borrower's debt (bounded by L) or repays the lender's existing
    /// opposite debt. Non-active participants contribute no segments.
    pub fn build(
        equivalent: EquivalentCode,
        trust_lines: &[TrustLineRow],
        debts: &[DebtRow],
        reservations: &[PrepareLockRow],
        inactive: &HashSet<String>,
    ) -> Result<Self, GeoError> {
        let mut debt_map: HashMap<(String, String), Amount> = HashMap::new();
        for d in debts {
            debt_map.insert(
                (d.debtor.clone(), d.creditor.clone()),
                Amount::parse(&d.amount)?,
            );
        }
        let mut reserved: HashMap<(String, String), Amount> = HashMap::new();
        for r in reservations {
            let key = (r.debtor.clone(), r.creditor.clone());
            let add = Amount::parse(&r.amount)?;
            let entry = reserved.entry(key).or_insert_with(Amount::zero);
            *entry = &*entry + &add;
        }

        let mut adjacency: BTreeMap<Pid, Vec<Segment>> = BTreeMap::new();
        for line in trust_lines {
            if inactive.contains(&line.from_participant) || inactive.contains(&line.to_participant)
            {
                continue;
            }
            let lender = Pid::parse(&line.from_participant)?;
            let borrower = Pid::parse(&line.to_participant)?;
            let limit = Amount::parse(&line.limit_amount)?;
            let policy = line.policy()?;

            let fwd_key = (borrower.as_str().to_string(), lender.as_str().to_string());
            let rev_key = (lender.as_str().to_string(), borrower.as_str().to_string());
            let mut capacity = limit;
            if let Some(owed) = debt_map.get(&fwd_key) {
                capacity = &capacity - owed;
            }
            if let Some(owed_back) = debt_map.get(&rev_key) {
                capacity = &capacity + owed_back;
            }
            if let Some(held) = reserved.get(&fwd_key) {
                capacity = &capacity - held;
            }
            if !capacity.is_positive() {
                continue;
            }

            adjacency.entry(borrower.clone()).or_default().push(Segment {
                from: borrower,
                to: lender,
                capacity,
                lender_can_intermediate: policy.can_be_intermediate,
                blocked: policy.blocked_participants,
            });
        }
        for segments in adjacency.values_mut() {
            segments.sort_by(|a, b| a.to.cmp(&b.to));
        }

        Ok(GraphSnapshot {
            equivalent,
            adjacency,
        })
    }

    fn segments_from(&self, pid: &Pid) -> &[Segment] {
        self.adjacency.get(pid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Sum of direct outgoing segment capacities: what `pid` could spend
    /// into adjacent lines right now.
    pub fn outgoing_capacity(&self, pid: &Pid) -> Amount {
        self.segments_from(pid)
            .iter()
            .fold(Amount::zero(), |acc, s| &acc + &s.capacity)
    }

    /// Sum of direct incoming segment capacities: what adjacent participants
    /// could pay `pid` right now.
    pub fn incoming_capacity(&self, pid: &Pid) -> Amount {
        self.adjacency
            .values()
            .flatten()
            .filter(|s| &s.to == pid)
            .fold(Amount::zero(), |acc, s| &acc + &s.capacity)
    }
}

/// One feasible path with its assigned flow.
#[derive(Debug, Clone)]
pub struct RoutePath {
    /// Ordered participants, sender first, receiver last.
    pub hops: Vec<Pid>,
    /// Flow assigned to this path by the split.
    pub amount: Amount,
    /// Min-edge capacity at planning time.
    pub capacity: Amount,
}

/// A complete split plan for one payment.
#[derive(Debug, Clone)]
pub struct RoutePlan {
    pub paths: Vec<RoutePath>,
    /// True when the wall-clock budget expired before the search finished;
    /// the plan is the best set found so far.
    pub timed_out: bool,
}

impl RoutePlan {
    pub fn total(&self) -> Amount {
        self.paths
            .iter()
            .fold(Amount::zero(), |acc, p| &acc + &p.amount)
    }
}

/// Search constraints, shaped by configuration.
#[derive(Debug, Clone)]
pub struct RouteConstraints {
    pub max_hops: usize,
    pub max_paths: usize,
    pub budget: Duration,
}

/// Find up to `max_paths` paths whose combined capacity covers `amount`.
///
/// Returns `InsufficientCapacity` when the graph cannot carry the amount
/// within the constraints.
pub fn find_routes(
    snapshot: &GraphSnapshot,
    from: &Pid,
    to: &Pid,
    amount: &Amount,
    constraints: &RouteConstraints,
) -> Result<RoutePlan, GeoError> {
    if from == to {
        return Err(GeoError::Validation(
            "sender and receiver must differ".into(),
        ));
    }
    let started = Instant::now();
    let mut candidates = Vec::new();
    let mut truncated = false;
    enumerate_paths(
        snapshot,
        from,
        to,
        constraints.max_hops,
        started,
        constraints.budget,
        &mut candidates,
        &mut truncated,
    );

    // Shortest first; within one length class the fattest bottleneck wins;
    // canonical pid order settles exact ties so planning is reproducible.
    candidates.sort_by(|a, b| {
        a.hops
            .len()
            .cmp(&b.hops.len())
            .then_with(|| b.bottleneck.cmp(&a.bottleneck))
            .then_with(|| a.hops.cmp(&b.hops))
    });

    // Greedy split against residual capacities, so paths sharing a segment
    // never oversubscribe it.
    let mut residual: HashMap<(Pid, Pid), Amount> = HashMap::new();
    for segments in snapshot.adjacency.values() {
        for seg in segments {
            residual.insert((seg.from.clone(), seg.to.clone()), seg.capacity.clone());
        }
    }

    let mut remaining = amount.clone();
    let mut paths = Vec::new();
    for candidate in candidates {
        if remaining.is_zero() || paths.len() >= constraints.max_paths {
            break;
        }
        let mut bottleneck: Option<Amount> = None;
        for pair in candidate.hops.windows(2) {
            let cap = residual
                .get(&(pair[0].clone(), pair[1].clone()))
                .cloned()
                .unwrap_or_else(Amount::zero);
            bottleneck = Some(match bottleneck {
                None => cap,
                Some(b) => b.min(cap),
            });
        }
        let bottleneck = bottleneck.unwrap_or_else(Amount::zero);
        if !bottleneck.is_positive() {
            continue;
        }
        let flow = bottleneck.clone().min(remaining.clone());
        for pair in candidate.hops.windows(2) {
            let key = (pair[0].clone(), pair[1].clone());
            if let Some(cap) = residual.get_mut(&key) {
                *cap = &*cap - &flow;
            }
        }
        remaining = &remaining - &flow;
        paths.push(RoutePath {
            hops: candidate.hops,
            amount: flow,
            capacity: bottleneck,
        });
    }

    if !remaining.is_zero() {
        let covered = amount - &remaining;
        return Err(GeoError::InsufficientCapacity(format!(
            "requested {} but only {} is reachable over {} path(s) in {}",
            amount,
            covered.canonical(),
            paths.len(),
            snapshot.equivalent
        )));
    }

    Ok(RoutePlan {
        paths,
        timed_out: truncated,
    })
}

/// Best-effort estimate of how much `from` can move to `to`: greedy max-flow
/// over at most `max_paths` shortest paths. Used by the capacity query.
pub fn estimate_capacity(
    snapshot: &GraphSnapshot,
    from: &Pid,
    to: &Pid,
    constraints: &RouteConstraints,
) -> Result<(Amount, usize, Option<usize>), GeoError> {
    let started = Instant::now();
    let mut candidates = Vec::new();
    let mut truncated = false;
    enumerate_paths(
        snapshot,
        from,
        to,
        constraints.max_hops,
        started,
        constraints.budget,
        &mut candidates,
        &mut truncated,
    );
    candidates.sort_by(|a, b| {
        a.hops
            .len()
            .cmp(&b.hops.len())
            .then_with(|| b.bottleneck.cmp(&a.bottleneck))
            .then_with(|| a.hops.cmp(&b.hops))
    });

    let mut residual: HashMap<(Pid, Pid), Amount> = HashMap::new();
    for segments in snapshot.adjacency.values() {
        for seg in segments {
            residual.insert((seg.from.clone(), seg.to.clone()), seg.capacity.clone());
        }
    }

    let mut total = Amount::zero();
    let mut used = 0usize;
    let mut min_hops = None;
    for candidate in candidates {
        if used >= constraints.max_paths {
            break;
        }
        let mut bottleneck: Option<Amount> = None;
        for pair in candidate.hops.windows(2) {
            let cap = residual
                .get(&(pair[0].clone(), pair[1].clone()))
                .cloned()
                .unwrap_or_else(Amount::zero);
            bottleneck = Some(match bottleneck {
                None => cap,
                Some(b) => b.min(cap),
            });
        }
        let bottleneck = bottleneck.unwrap_or_else(Amount::zero);
        if !bottleneck.is_positive() {
            continue;
        }
        for pair in candidate.hops.windows(2) {
            let key = (pair[0].clone(), pair[1].clone());
            if let Some(cap) = residual.get_mut(&key) {
                *cap = &*cap - &bottleneck;
            }
        }
        total = &total + &bottleneck;
        used += 1;
        let hops = candidate.hops.len() - 1;
        min_hops = Some(match min_hops {
            None => hops,
            Some(m) if hops < m => hops,
            Some(m) => m,
        });
    }

    Ok((total, used, min_hops))
}

#[derive(Debug)]
struct CandidatePath {
    hops: Vec<Pid>,
    bottleneck: Amount,
}

/// Depth-first enumeration of simple paths, neighbors visited in canonical
/// order so the candidate list is deterministic.
#[allow(clippy::too_many_arguments)]
fn enumerate_paths(
    snapshot: &GraphSnapshot,
    from: &Pid,
    to: &Pid,
    max_hops: usize,
    started: Instant,
    budget: Duration,
    out: &mut Vec<CandidatePath>,
    truncated: &mut bool,
) {
    let mut path = vec![from.clone()];
    let mut visited: HashSet<Pid> = HashSet::new();
    visited.insert(from.clone());
    walk(
        snapshot, from, to, from, max_hops, started, budget, &mut path, &mut visited, None, out,
        truncated,
    );
}

#[allow(clippy::too_many_arguments)]
fn walk(
    snapshot: &GraphSnapshot,
    sender: &Pid,
    target: &Pid,
    current: &Pid,
    hops_left: usize,
    started: Instant,
    budget: Duration,
    path: &mut Vec<Pid>,
    visited: &mut HashSet<Pid>,
    bottleneck: Option<Amount>,
    out: &mut Vec<CandidatePath>,
    truncated: &mut bool,
) {
    if hops_left == 0 {
        return;
    }
    if out.len() >= MAX_CANDIDATE_PATHS || started.elapsed() > budget {
        *truncated = true;
        return;
    }
    for seg in snapshot.segments_from(current) {
        if visited.contains(&seg.to) {
            continue;
        }
        // The lender opted out of carrying third-party traffic: their
        // segment may only terminate a path, not pass through.
        if &seg.to != target && !seg.lender_can_intermediate {
            continue;
        }
        // The lender refuses traffic originated by blocked participants.
        if seg.blocked.contains(sender) {
            continue;
        }
        let next_bottleneck = match &bottleneck {
            None => seg.capacity.clone(),
            Some(b) => b.clone().min(seg.capacity.clone()),
        };
        if !next_bottleneck.is_positive() {
            continue;
        }
        path.push(seg.to.clone());
        if &seg.to == target {
            out.push(CandidatePath {
                hops: path.clone(),
                bottleneck: next_bottleneck.clone(),
            });
        } else {
            visited.insert(seg.to.clone());
            walk(
                snapshot,
                sender,
                target,
                &seg.to,
                hops_left - 1,
                started,
                budget,
                path,
                visited,
                Some(next_bottleneck),
                out,
                truncated,
            );
            visited.remove(&seg.to);
        }
        path.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn pid(tag: u8) -> Pid {
        Pid::from_public_key(&[tag; 32])
    }

    fn usd() -> EquivalentCode {
        EquivalentCode::parse("USD").unwrap()
    }

    fn trust_line(lender: &Pid, borrower: &Pid, limit: &str) -> TrustLineRow {
        TrustLineRow {
            id: 0,
            from_participant: lender.as_str().to_string(),
            to_participant: borrower.as_str().to_string(),
            equivalent: "USD".to_string(),
            limit_amount: limit.to_string(),
            auto_clearing: true,
            can_be_intermediate: true,
            blocked_participants: serde_json::json!([]),
            status: "active".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn debt(debtor: &Pid, creditor: &Pid, amount: &str) -> DebtRow {
        DebtRow {
            id: 0,
            debtor: debtor.as_str().to_string(),
            creditor: creditor.as_str().to_string(),
            equivalent: "USD".to_string(),
            amount: amount.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn reservation(debtor: &Pid, creditor: &Pid, amount: &str) -> PrepareLockRow {
        PrepareLockRow {
            id: 0,
            tx_id: uuid::Uuid::nil(),
            debtor: debtor.as_str().to_string(),
            creditor: creditor.as_str().to_string(),
            equivalent: "USD".to_string(),
            amount: amount.to_string(),
            segment_key: String::new(),
            expires_at: Utc::now(),
            created_at: Utc::now(),
        }
    }

    fn constraints() -> RouteConstraints {
        RouteConstraints {
            max_hops: 6,
            max_paths: 3,
            budget: Duration::from_millis(500),
        }
    }

    fn snapshot(
        lines: &[TrustLineRow],
        debts: &[DebtRow],
        reservations: &[PrepareLockRow],
    ) -> GraphSnapshot {
        GraphSnapshot::build(usd(), lines, debts, reservations, &HashSet::new()).unwrap()
    }

    #[test]
    fn test_direct_route() {
        let (a, b) = (pid(1), pid(2));
        // B trusts A for 100, so A can pay B up to 100
        let snap = snapshot(&[trust_line(&b, &a, "100")], &[], &[]);
        let plan = find_routes(&snap, &a, &b, &Amount::parse("50").unwrap(), &constraints())
            .unwrap();
        assert_eq!(plan.paths.len(), 1);
        assert_eq!(plan.paths[0].hops, vec![a.clone(), b.clone()]);
        assert_eq!(plan.paths[0].amount, Amount::parse("50").unwrap());
        assert_eq!(plan.total(), Amount::parse("50").unwrap());
    }

    #[test]
    fn test_transitive_route() {
        let (a, b, c) = (pid(1), pid(2), pid(3));
        let snap = snapshot(
            &[trust_line(&b, &a, "100"), trust_line(&c, &b, "100")],
            &[],
            &[],
        );
        let plan = find_routes(&snap, &a, &c, &Amount::parse("30").unwrap(), &constraints())
            .unwrap();
        assert_eq!(plan.paths.len(), 1);
        assert_eq!(plan.paths[0].hops, vec![a.clone(), b.clone(), c.clone()]);
    }

    #[test]
    fn test_multipath_split() {
        let (a, b, c, d) = (pid(1), pid(2), pid(3), pid(4));
        // Two disjoint 2-hop corridors A->C->B and A->D->B, 40 each
        let snap = snapshot(
            &[
                trust_line(&c, &a, "40"),
                trust_line(&d, &a, "40"),
                trust_line(&b, &c, "40"),
                trust_line(&b, &d, "40"),
            ],
            &[],
            &[],
        );
        let plan = find_routes(&snap, &a, &b, &Amount::parse("70").unwrap(), &constraints())
            .unwrap();
        assert_eq!(plan.paths.len(), 2);
        assert_eq!(plan.total(), Amount::parse("70").unwrap());
        // Greedy split never exceeds a path's bottleneck
        for p in &plan.paths {
            assert!(p.amount <= p.capacity);
        }
    }

    #[test]
    fn test_insufficient_capacity() {
        let (a, b) = (pid(1), pid(2));
        let snap = snapshot(&[trust_line(&b, &a, "100")], &[], &[]);
        let err = find_routes(
            &snap,
            &a,
            &b,
            &Amount::parse("100.01").unwrap(),
            &constraints(),
        )
        .unwrap_err();
        assert!(matches!(err, GeoError::InsufficientCapacity(_)));
    }

    #[test]
    fn test_existing_debt_reduces_capacity() {
        let (a, b) = (pid(1), pid(2));
        let snap = snapshot(&[trust_line(&b, &a, "100")], &[debt(&a, &b, "60")], &[]);
        assert!(find_routes(&snap, &a, &b, &Amount::parse("41").unwrap(), &constraints()).is_err());
        assert!(find_routes(&snap, &a, &b, &Amount::parse("40").unwrap(), &constraints()).is_ok());
    }

    #[test]
    fn test_opposite_debt_extends_capacity() {
        let (a, b) = (pid(1), pid(2));
        // B already owes A 30: paying B first repays that debt
        let snap = snapshot(&[trust_line(&b, &a, "100")], &[debt(&b, &a, "30")], &[]);
        let plan = find_routes(
            &snap,
            &a,
            &b,
            &Amount::parse("130").unwrap(),
            &constraints(),
        )
        .unwrap();
        assert_eq!(plan.total(), Amount::parse("130").unwrap());
    }

    #[test]
    fn test_reservations_derate_capacity() {
        let (a, b) = (pid(1), pid(2));
        let snap = snapshot(
            &[trust_line(&b, &a, "100")],
            &[],
            &[reservation(&a, &b, "70")],
        );
        assert!(find_routes(&snap, &a, &b, &Amount::parse("31").unwrap(), &constraints()).is_err());
        assert!(find_routes(&snap, &a, &b, &Amount::parse("30").unwrap(), &constraints()).is_ok());
    }

    #[test]
    fn test_intermediate_policy_blocks_pass_through() {
        let (a, b, c) = (pid(1), pid(2), pid(3));
        let mut via_b = trust_line(&b, &a, "100");
        via_b.can_be_intermediate = false;
        let snap = snapshot(&[via_b.clone(), trust_line(&c, &b, "100")], &[], &[]);
        // A -> B -> C needs B (lender of the first segment) as an
        // intermediate, which the policy forbids
        assert!(find_routes(&snap, &a, &c, &Amount::parse("10").unwrap(), &constraints()).is_err());
        // The direct hop A -> B still works: B is the receiver there
        assert!(find_routes(&snap, &a, &b, &Amount::parse("10").unwrap(), &constraints()).is_ok());
    }

    #[test]
    fn test_blocked_sender_is_routed_around() {
        let (a, b, c, d) = (pid(1), pid(2), pid(3), pid(4));
        let mut line_cb = trust_line(&c, &b, "100");
        line_cb.blocked_participants = serde_json::json!([a.as_str()]);
        let snap = snapshot(
            &[
                trust_line(&b, &a, "100"),
                line_cb,
                trust_line(&d, &b, "100"),
                trust_line(&c, &d, "100"),
            ],
            &[],
            &[],
        );
        // C blocked A on the B->C segment; the plan must detour via D
        let plan = find_routes(&snap, &a, &c, &Amount::parse("10").unwrap(), &constraints())
            .unwrap();
        assert_eq!(
            plan.paths[0].hops,
            vec![a.clone(), b.clone(), d.clone(), c.clone()]
        );
    }

    #[test]
    fn test_shorter_path_preferred() {
        let (a, b, c) = (pid(1), pid(2), pid(3));
        // Direct (thin) and 2-hop (fat) both reach B; 5 fits the direct hop
        let snap = snapshot(
            &[
                trust_line(&b, &a, "10"),
                trust_line(&c, &a, "100"),
                trust_line(&b, &c, "100"),
            ],
            &[],
            &[],
        );
        let plan = find_routes(&snap, &a, &b, &Amount::parse("5").unwrap(), &constraints())
            .unwrap();
        assert_eq!(plan.paths[0].hops.len(), 2);
    }

    #[test]
    fn test_determinism() {
        let (a, b, c, d) = (pid(1), pid(2), pid(3), pid(4));
        let lines = vec![
            trust_line(&c, &a, "40"),
            trust_line(&d, &a, "40"),
            trust_line(&b, &c, "40"),
            trust_line(&b, &d, "40"),
        ];
        let amount = Amount::parse("70").unwrap();
        let first = find_routes(
            &snapshot(&lines, &[], &[]),
            &a,
            &b,
            &amount,
            &constraints(),
        )
        .unwrap();
        for _ in 0..5 {
            let again = find_routes(
                &snapshot(&lines, &[], &[]),
                &a,
                &b,
                &amount,
                &constraints(),
            )
            .unwrap();
            let render = |p: &RoutePlan| {
                p.paths
                    .iter()
                    .map(|r| {
                        format!(
                            "{}:{}",
                            r.hops
                                .iter()
                                .map(|h| h.as_str())
                                .collect::<Vec<_>>()
                                .join(">"),
                            r.amount
                        )
                    })
                    .collect::<Vec<_>>()
            };
            assert_eq!(render(&first), render(&again));
        }
    }

    #[test]
    fn test_max_hops_respected() {
        let chain: Vec<Pid> = (1..=8).map(pid).collect();
        let mut lines = Vec::new();
        for w in chain.windows(2) {
            lines.push(trust_line(&w[1], &w[0], "100"));
        }
        let snap = snapshot(&lines, &[], &[]);
        // 7 hops end to end; the default cap is 6
        assert!(find_routes(
            &snap,
            &chain[0],
            &chain[7],
            &Amount::parse("1").unwrap(),
            &constraints()
        )
        .is_err());
        assert!(find_routes(
            &snap,
            &chain[0],
            &chain[6],
            &Amount::parse("1").unwrap(),
            &constraints()
        )
        .is_ok());
    }

    #[test]
    fn test_inactive_participant_excluded() {
        let (a, b, c) = (pid(1), pid(2), pid(3));
        let lines = vec![trust_line(&b, &a, "100"), trust_line(&c, &b, "100")];
        let mut inactive = HashSet::new();
        inactive.insert(b.as_str().to_string());
        let snap = GraphSnapshot::build(usd(), &lines, &[], &[], &inactive).unwrap();
        assert!(find_routes(&snap, &a, &c, &Amount::parse("1").unwrap(), &constraints()).is_err());
    }

    #[test]
    fn test_estimate_capacity() {
        let (a, b, c, d) = (pid(1), pid(2), pid(3), pid(4));
        let snap = snapshot(
            &[
                trust_line(&c, &a, "40"),
                trust_line(&d, &a, "40"),
                trust_line(&b, &c, "40"),
                trust_line(&b, &d, "40"),
            ],
            &[],
            &[],
        );
        let (total, routes, min_hops) = estimate_capacity(&snap, &a, &b, &constraints()).unwrap();
        assert_eq!(total, Amount::parse("80").unwrap());
        assert_eq!(routes, 2);
        assert_eq!(min_hops, Some(2));
    }
}
