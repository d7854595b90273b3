//! Integration tests for the hub store layer
//!
//! Run with: cargo test --test integration_test -- --nocapture
//!
//! Prerequisites for the #[ignore]d tests:
//! - Postgres running with the hub migrations applied
//! - DATABASE_URL set

use creditnet_rs::amount::Amount;
use creditnet_rs::canonical::canonical_bytes;
use creditnet_rs::signing;
use creditnet_rs::types::{EquivalentCode, Pid, SegmentRef};
use ed25519_dalek::SigningKey;

mod helpers {
    use std::time::Duration;

    /// Test configuration loaded from environment variables
    pub struct TestConfig {
        pub database_url: String,
    }

    impl TestConfig {
        /// Load test configuration from environment variables
        pub fn from_env() -> Option<Self> {
            Some(TestConfig {
                database_url: std::env::var("DATABASE_URL").ok()?,
            })
        }
    }

    /// Check database connectivity
    pub async fn check_database_connectivity(url: &str) -> bool {
        matches!(
            sqlx::postgres::PgPoolOptions::new()
                .max_connections(1)
                .acquire_timeout(Duration::from_secs(5))
                .connect(url)
                .await,
            Ok(_)
        )
    }

    pub async fn pool(url: &str) -> sqlx::PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(url)
            .await
            .expect("Failed to connect to database")
    }

    /// Register a throwaway participant directly in the store.
    pub async fn seed_participant(pool: &sqlx::PgPool, tag: u8) -> String {
        let key = [tag; 32];
        let pid = creditnet_rs::types::Pid::from_public_key(&key);
        sqlx::query(
            "INSERT INTO participants (pid, public_key) VALUES ($1, $2)
             ON CONFLICT (pid) DO NOTHING",
        )
        .bind(pid.as_str())
        .bind(key.as_slice())
        .execute(pool)
        .await
        .expect("Failed to seed participant");
        pid.as_str().to_string()
    }

    pub async fn seed_equivalent(pool: &sqlx::PgPool, code: &str, precision: i16) {
        sqlx::query(
            "INSERT INTO equivalents (code, precision) VALUES ($1, $2)
             ON CONFLICT (code) DO NOTHING",
        )
        .bind(code)
        .bind(precision)
        .execute(pool)
        .await
        .expect("Failed to seed equivalent");
    }
}

// ============================================================================
// Environment Tests (require running infrastructure)
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_environment_setup() {
    let config = helpers::TestConfig::from_env();
    assert!(
        config.is_some(),
        "Test configuration not found. Set DATABASE_URL"
    );

    let config = config.unwrap();
    assert!(
        helpers::check_database_connectivity(&config.database_url).await,
        "Failed to connect to database"
    );
    println!("Database OK");
}

#[tokio::test]
#[ignore]
async fn test_schema_rejects_zero_and_negative_debts() {
    let config = helpers::TestConfig::from_env().expect("DATABASE_URL required");
    let pool = helpers::pool(&config.database_url).await;

    let a = helpers::seed_participant(&pool, 201).await;
    let b = helpers::seed_participant(&pool, 202).await;
    helpers::seed_equivalent(&pool, "ITEST", 2).await;

    for bad in ["0", "-5"] {
        let result = sqlx::query(
            "INSERT INTO debts (debtor, creditor, equivalent, amount)
             VALUES ($1, $2, 'ITEST', $3::NUMERIC)",
        )
        .bind(&a)
        .bind(&b)
        .bind(bad)
        .execute(&pool)
        .await;
        assert!(result.is_err(), "amount {bad} must violate the CHECK");
    }
}

#[tokio::test]
#[ignore]
async fn test_schema_rejects_self_debt_and_duplicate_edges() {
    let config = helpers::TestConfig::from_env().expect("DATABASE_URL required");
    let pool = helpers::pool(&config.database_url).await;

    let a = helpers::seed_participant(&pool, 203).await;
    let b = helpers::seed_participant(&pool, 204).await;
    helpers::seed_equivalent(&pool, "ITEST", 2).await;

    let self_debt = sqlx::query(
        "INSERT INTO debts (debtor, creditor, equivalent, amount)
         VALUES ($1, $1, 'ITEST', 1::NUMERIC)",
    )
    .bind(&a)
    .execute(&pool)
    .await;
    assert!(self_debt.is_err(), "self-debt must violate the CHECK");

    sqlx::query("DELETE FROM debts WHERE debtor = $1 AND creditor = $2 AND equivalent = 'ITEST'")
        .bind(&a)
        .bind(&b)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO debts (debtor, creditor, equivalent, amount)
         VALUES ($1, $2, 'ITEST', 1::NUMERIC)",
    )
    .bind(&a)
    .bind(&b)
    .execute(&pool)
    .await
    .unwrap();
    let duplicate = sqlx::query(
        "INSERT INTO debts (debtor, creditor, equivalent, amount)
         VALUES ($1, $2, 'ITEST', 2::NUMERIC)",
    )
    .bind(&a)
    .bind(&b)
    .execute(&pool)
    .await;
    assert!(
        duplicate.is_err(),
        "duplicate (debtor, creditor, equivalent) must violate the unique index"
    );

    sqlx::query("DELETE FROM debts WHERE debtor = $1 AND creditor = $2 AND equivalent = 'ITEST'")
        .bind(&a)
        .bind(&b)
        .execute(&pool)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore]
async fn test_advisory_lock_serializes_two_sessions() {
    let config = helpers::TestConfig::from_env().expect("DATABASE_URL required");
    let pool = helpers::pool(&config.database_url).await;

    let seg = SegmentRef {
        debtor: Pid::from_public_key(&[205; 32]),
        creditor: Pid::from_public_key(&[206; 32]),
        equivalent: EquivalentCode::parse("ITEST").unwrap(),
    };
    let key = seg.advisory_key();

    let mut tx1 = pool.begin().await.unwrap();
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(key)
        .execute(&mut *tx1)
        .await
        .unwrap();

    // The second session must not get the lock while tx1 holds it
    let mut tx2 = pool.begin().await.unwrap();
    let contended: (bool,) = sqlx::query_as("SELECT pg_try_advisory_xact_lock($1)")
        .bind(key)
        .fetch_one(&mut *tx2)
        .await
        .unwrap();
    assert!(!contended.0, "advisory lock must be held by the first session");

    tx1.commit().await.unwrap();

    let mut tx3 = pool.begin().await.unwrap();
    let free: (bool,) = sqlx::query_as("SELECT pg_try_advisory_xact_lock($1)")
        .bind(key)
        .fetch_one(&mut *tx3)
        .await
        .unwrap();
    assert!(free.0, "advisory lock must be released at commit");
}

// ============================================================================
// Unit Tests (no infrastructure required)
// ============================================================================

#[test]
fn test_segment_fingerprint_is_direction_agnostic() {
    let usd = EquivalentCode::parse("USD").unwrap();
    let a = Pid::from_public_key(&[1; 32]);
    let b = Pid::from_public_key(&[2; 32]);

    let ab = SegmentRef {
        debtor: a.clone(),
        creditor: b.clone(),
        equivalent: usd.clone(),
    };
    let ba = SegmentRef {
        debtor: b,
        creditor: a,
        equivalent: usd,
    };
    assert_eq!(ab.fingerprint_hex(), ba.fingerprint_hex());
    assert_eq!(ab.advisory_key(), ba.advisory_key());
}

#[test]
fn test_advisory_keys_sort_deterministically() {
    let usd = EquivalentCode::parse("USD").unwrap();
    let pids: Vec<Pid> = (1u8..=6).map(|t| Pid::from_public_key(&[t; 32])).collect();
    let mut keys: Vec<i64> = pids
        .windows(2)
        .map(|w| {
            SegmentRef {
                debtor: w[0].clone(),
                creditor: w[1].clone(),
                equivalent: usd.clone(),
            }
            .advisory_key()
        })
        .collect();
    let mut again = keys.clone();
    keys.sort_unstable();
    again.sort_unstable();
    assert_eq!(keys, again);
    keys.dedup();
    assert_eq!(keys.len(), 5, "distinct segments should get distinct keys");
}

#[test]
fn test_canonical_bytes_stable_across_key_order() {
    let a: serde_json::Value = serde_json::from_str(
        r#"{"from":"x","to":"y","equivalent":"USD","amount":"50","nonce":"n","issued_at":"t"}"#,
    )
    .unwrap();
    let b: serde_json::Value = serde_json::from_str(
        r#"{"issued_at":"t","nonce":"n","amount":"50","equivalent":"USD","to":"y","from":"x"}"#,
    )
    .unwrap();
    assert_eq!(canonical_bytes(&a), canonical_bytes(&b));
}

#[test]
fn test_signature_survives_json_reordering() {
    let key = SigningKey::from_bytes(&[42; 32]);
    let payload: serde_json::Value =
        serde_json::from_str(r#"{"b": "2", "a": "1"}"#).unwrap();
    let sig = signing::sign_payload(&key, &payload).unwrap();

    let reordered: serde_json::Value =
        serde_json::from_str(r#"{"a": "1", "b": "2"}"#).unwrap();
    assert!(signing::verify_payload(&key.verifying_key(), &reordered, &sig).is_ok());
}

#[test]
fn test_amount_canonicalization_for_storage() {
    // The store writes canonical strings and reads NUMERIC casts; both forms
    // must parse back to the same value.
    for (input, canonical) in [
        ("50.00", "50"),
        ("0.50", "0.5"),
        ("100.250", "100.25"),
        ("7", "7"),
    ] {
        let amount = Amount::parse(input).unwrap();
        assert_eq!(amount.canonical(), canonical);
        assert_eq!(Amount::parse(canonical).unwrap(), amount);
    }
}

#[test]
fn test_pid_derivation_matches_registration_flow() {
    let key = SigningKey::from_bytes(&[9; 32]);
    let encoded = signing::encode_public_key(&key.verifying_key());
    let decoded = signing::decode_public_key(&encoded).unwrap();
    let pid = Pid::from_public_key(decoded.as_bytes());
    assert_eq!(pid, Pid::from_public_key(key.verifying_key().as_bytes()));
    assert!(Pid::parse(pid.as_str()).is_ok());
}
