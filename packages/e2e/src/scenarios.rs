//! Scenario flows against a running hub.
//!
//! Each scenario provisions its own participants and a fresh equivalent, so
//! runs are isolated and repeatable against the same deployment.

use eyre::{eyre, Result};
use rand::Rng;
use tracing::info;

use creditnet_rs::types::{EquivalentCode, TrustPolicy};

use crate::client::{Actor, HubClient};

/// A fresh equivalent code per scenario run.
fn fresh_equivalent() -> EquivalentCode {
    let tag: u32 = rand::thread_rng().gen_range(0..0xFFFF);
    EquivalentCode::parse(&format!("E2E{tag:04X}")).expect("generated code is valid")
}

fn assert_status(outcome: &serde_json::Value, expected: &str) -> Result<()> {
    let status = outcome["status"].as_str().unwrap_or("<missing>");
    if status != expected {
        return Err(eyre!(
            "expected payment status {expected}, got {status}: {outcome}"
        ));
    }
    Ok(())
}

/// Direct payment over one trust line, plus idempotent replay.
pub async fn direct_payment(client: &HubClient) -> Result<()> {
    let equivalent = fresh_equivalent();
    client.create_equivalent(equivalent.as_str(), 2).await?;

    let a = Actor::generate();
    let b = Actor::generate();
    client.register(&a).await?;
    client.register(&b).await?;
    client
        .open_trust_line(&b, &a.pid, &equivalent, "100.00", TrustPolicy::default())
        .await?;

    let outcome = client
        .pay(&a, &b.pid, &equivalent, "50.00", "n-1", Some("idem-1"))
        .await?;
    assert_status(&outcome, "COMMITTED")?;

    let debt = client.debt_between(&a, &b.pid, &equivalent).await?;
    if debt.as_deref() != Some("50") {
        return Err(eyre!("expected debt A->B of 50, got {debt:?}"));
    }
    if client.debt_between(&b, &a.pid, &equivalent).await?.is_some() {
        return Err(eyre!("no debt B->A may exist"));
    }

    // Same idempotency key returns the same transaction
    let replay = client
        .pay(&a, &b.pid, &equivalent, "50.00", "n-1", Some("idem-1"))
        .await?;
    if replay["tx_id"] != outcome["tx_id"] {
        return Err(eyre!(
            "idempotent replay created a second transaction: {} vs {}",
            replay["tx_id"],
            outcome["tx_id"]
        ));
    }

    info!("direct payment scenario passed");
    Ok(())
}

/// Transitive payment A -> B -> C.
pub async fn transitive_payment(client: &HubClient) -> Result<()> {
    let equivalent = fresh_equivalent();
    client.create_equivalent(equivalent.as_str(), 2).await?;

    let a = Actor::generate();
    let b = Actor::generate();
    let c = Actor::generate();
    for actor in [&a, &b, &c] {
        client.register(actor).await?;
    }
    client
        .open_trust_line(&b, &a.pid, &equivalent, "100", TrustPolicy::default())
        .await?;
    client
        .open_trust_line(&c, &b.pid, &equivalent, "100", TrustPolicy::default())
        .await?;

    let outcome = client
        .pay(&a, &c.pid, &equivalent, "30.00", "n-1", None)
        .await?;
    assert_status(&outcome, "COMMITTED")?;

    let hops = outcome["routes"][0]["hops"]
        .as_array()
        .ok_or_else(|| eyre!("missing route hops"))?;
    if hops.len() != 3 {
        return Err(eyre!("expected 3-hop route, got {hops:?}"));
    }

    if client.debt_between(&a, &b.pid, &equivalent).await?.as_deref() != Some("30") {
        return Err(eyre!("expected debt A->B of 30"));
    }
    if client.debt_between(&b, &c.pid, &equivalent).await?.as_deref() != Some("30") {
        return Err(eyre!("expected debt B->C of 30"));
    }

    info!("transitive payment scenario passed");
    Ok(())
}

/// Multipath split across two 2-hop corridors.
pub async fn multipath_split(client: &HubClient) -> Result<()> {
    let equivalent = fresh_equivalent();
    client.create_equivalent(equivalent.as_str(), 2).await?;

    let a = Actor::generate();
    let b = Actor::generate();
    let c = Actor::generate();
    let d = Actor::generate();
    for actor in [&a, &b, &c, &d] {
        client.register(actor).await?;
    }
    // Corridors A->C->B and A->D->B, 40 each
    client
        .open_trust_line(&c, &a.pid, &equivalent, "40", TrustPolicy::default())
        .await?;
    client
        .open_trust_line(&d, &a.pid, &equivalent, "40", TrustPolicy::default())
        .await?;
    client
        .open_trust_line(&b, &c.pid, &equivalent, "40", TrustPolicy::default())
        .await?;
    client
        .open_trust_line(&b, &d.pid, &equivalent, "40", TrustPolicy::default())
        .await?;

    let outcome = client
        .pay(&a, &b.pid, &equivalent, "70.00", "n-1", None)
        .await?;
    assert_status(&outcome, "COMMITTED")?;

    let routes = outcome["routes"]
        .as_array()
        .ok_or_else(|| eyre!("missing routes"))?;
    if routes.len() != 2 {
        return Err(eyre!("expected a 2-way split, got {} route(s)", routes.len()));
    }
    let total: f64 = routes
        .iter()
        .filter_map(|r| r["amount"].as_str())
        .filter_map(|s| s.parse::<f64>().ok())
        .sum();
    if (total - 70.0).abs() > 1e-9 {
        return Err(eyre!("split amounts must sum to 70, got {total}"));
    }

    info!("multipath split scenario passed");
    Ok(())
}

/// Netting: paying against an opposite debt shrinks it first.
pub async fn netting(client: &HubClient) -> Result<()> {
    let equivalent = fresh_equivalent();
    client.create_equivalent(equivalent.as_str(), 2).await?;

    let a = Actor::generate();
    let b = Actor::generate();
    client.register(&a).await?;
    client.register(&b).await?;
    // Both directions trust each other
    client
        .open_trust_line(&b, &a.pid, &equivalent, "100", TrustPolicy::default())
        .await?;
    client
        .open_trust_line(&a, &b.pid, &equivalent, "100", TrustPolicy::default())
        .await?;

    // Set up debt[A->B] = 30, then B pays A 50
    let outcome = client
        .pay(&a, &b.pid, &equivalent, "30", "n-1", None)
        .await?;
    assert_status(&outcome, "COMMITTED")?;
    let outcome = client
        .pay(&b, &a.pid, &equivalent, "50", "n-2", None)
        .await?;
    assert_status(&outcome, "COMMITTED")?;

    if client.debt_between(&a, &b.pid, &equivalent).await?.is_some() {
        return Err(eyre!("debt A->B must be fully netted away"));
    }
    if client.debt_between(&b, &a.pid, &equivalent).await?.as_deref() != Some("20") {
        return Err(eyre!("expected residual debt B->A of 20"));
    }

    info!("netting scenario passed");
    Ok(())
}

/// Triangular clearing: A->B->C->A nets by the cycle minimum.
pub async fn triangle_clearing(client: &HubClient) -> Result<()> {
    let equivalent = fresh_equivalent();
    client.create_equivalent(equivalent.as_str(), 2).await?;

    let a = Actor::generate();
    let b = Actor::generate();
    let c = Actor::generate();
    for actor in [&a, &b, &c] {
        client.register(actor).await?;
    }
    // Lender -> borrower lines backing each debt direction
    client
        .open_trust_line(&b, &a.pid, &equivalent, "200", TrustPolicy::default())
        .await?;
    client
        .open_trust_line(&c, &b.pid, &equivalent, "200", TrustPolicy::default())
        .await?;
    client
        .open_trust_line(&a, &c.pid, &equivalent, "200", TrustPolicy::default())
        .await?;

    // Seed the cycle with direct payments; pre-balances: A -60, B +30, C +30
    assert_status(
        &client.pay(&a, &b.pid, &equivalent, "100", "n-1", None).await?,
        "COMMITTED",
    )?;
    assert_status(
        &client.pay(&b, &c.pid, &equivalent, "70", "n-2", None).await?,
        "COMMITTED",
    )?;
    assert_status(
        &client.pay(&c, &a.pid, &equivalent, "40", "n-3", None).await?,
        "COMMITTED",
    )?;

    let balances_before = net_balances(client, &[&a, &b, &c], &equivalent).await?;

    // The post-commit trigger may have already cleared the triangle; the
    // explicit run is idempotent either way.
    client.run_clearing(&equivalent).await?;

    let ab = client.debt_between(&a, &b.pid, &equivalent).await?;
    let bc = client.debt_between(&b, &c.pid, &equivalent).await?;
    let ca = client.debt_between(&c, &a.pid, &equivalent).await?;
    if ab.as_deref() != Some("60") || bc.as_deref() != Some("30") || ca.is_some() {
        return Err(eyre!(
            "expected post-clearing debts 60/30/absent, got {ab:?}/{bc:?}/{ca:?}"
        ));
    }

    let balances_after = net_balances(client, &[&a, &b, &c], &equivalent).await?;
    if balances_before != balances_after {
        return Err(eyre!(
            "clearing changed net balances: {balances_before:?} -> {balances_after:?}"
        ));
    }

    info!("triangle clearing scenario passed");
    Ok(())
}

/// Two concurrent payments over one 100-limit line; exactly one commits.
pub async fn contention(client: &HubClient) -> Result<()> {
    let equivalent = fresh_equivalent();
    client.create_equivalent(equivalent.as_str(), 2).await?;

    let a = Actor::generate();
    let b = Actor::generate();
    client.register(&a).await?;
    client.register(&b).await?;
    client
        .open_trust_line(&b, &a.pid, &equivalent, "100", TrustPolicy::default())
        .await?;

    let first = client.pay(&a, &b.pid, &equivalent, "70", "n-1", None);
    let second = client.pay(&a, &b.pid, &equivalent, "70", "n-2", None);
    let (first, second) = tokio::join!(first, second);
    let first = first?;
    let second = second?;

    let committed = [&first, &second]
        .iter()
        .filter(|o| o["status"].as_str() == Some("COMMITTED"))
        .count();
    if committed != 1 {
        return Err(eyre!(
            "exactly one concurrent payment may commit, got {committed}: {first} / {second}"
        ));
    }
    let aborted = [&first, &second]
        .into_iter()
        .find(|o| o["status"].as_str() == Some("ABORTED"))
        .ok_or_else(|| eyre!("one payment must abort"))?;
    let code = aborted["error"]["code"].as_str().unwrap_or("<missing>");
    if code != "InsufficientCapacity" {
        return Err(eyre!("loser must abort with InsufficientCapacity, got {code}"));
    }

    // The line must not be over-drawn
    let debt = client.debt_between(&a, &b.pid, &equivalent).await?;
    if debt.as_deref() != Some("70") {
        return Err(eyre!("expected debt of exactly 70, got {debt:?}"));
    }

    info!("contention scenario passed");
    Ok(())
}

async fn net_balances(
    client: &HubClient,
    actors: &[&Actor],
    equivalent: &EquivalentCode,
) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for actor in actors {
        let balance = client.balance(&actor.pid).await?;
        let net = balance
            .as_array()
            .and_then(|rows| {
                rows.iter()
                    .find(|r| r["equivalent"].as_str() == Some(equivalent.as_str()))
            })
            .and_then(|r| r["net_balance"].as_str())
            .unwrap_or("0")
            .to_string();
        out.push(net);
    }
    Ok(out)
}
