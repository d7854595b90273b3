//! Minimal signing client for the hub API.

use ed25519_dalek::SigningKey;
use eyre::{eyre, Result, WrapErr};
use rand::rngs::OsRng;
use serde::Serialize;
use serde_json::{json, Value};

use creditnet_rs::amount::Amount;
use creditnet_rs::payloads::{PaymentPayload, TrustLinePayload};
use creditnet_rs::signing;
use creditnet_rs::types::{EquivalentCode, Pid, TrustPolicy};

/// One test participant: a keypair plus its derived pid.
pub struct Actor {
    pub key: SigningKey,
    pub pid: Pid,
}

impl Actor {
    pub fn generate() -> Self {
        let key = SigningKey::generate(&mut OsRng);
        let pid = Pid::from_public_key(key.verifying_key().as_bytes());
        Actor { key, pid }
    }
}

pub struct HubClient {
    base_url: String,
    admin_token: Option<String>,
    http: reqwest::Client,
}

impl HubClient {
    pub fn new(base_url: String, admin_token: Option<String>) -> Self {
        HubClient {
            base_url,
            admin_token,
            http: reqwest::Client::new(),
        }
    }

    async fn post_signed<T: Serialize>(
        &self,
        path: &str,
        payload: &T,
        key: &SigningKey,
    ) -> Result<Value> {
        let signature =
            signing::sign_payload(key, payload).map_err(|e| eyre!("signing failed: {e}"))?;
        let body = json!({
            "payload": payload,
            "signature": signature,
        });
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .wrap_err_with(|| format!("POST {path} failed"))?;
        let status = response.status();
        let value: Value = response.json().await.unwrap_or_else(|_| json!({}));
        if !status.is_success() && value.get("error").is_none() {
            return Err(eyre!("POST {path} returned {status}: {value}"));
        }
        Ok(value)
    }

    pub async fn register(&self, actor: &Actor) -> Result<Value> {
        let payload = json!({
            "public_key": signing::encode_public_key(&actor.key.verifying_key()),
        });
        self.post_signed("/v1/participants", &payload, &actor.key)
            .await
    }

    pub async fn create_equivalent(&self, code: &str, precision: u32) -> Result<Value> {
        let mut request = self
            .http
            .post(format!("{}/v1/equivalents", self.base_url))
            .json(&json!({ "code": code, "precision": precision }));
        if let Some(token) = &self.admin_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.wrap_err("create equivalent failed")?;
        let status = response.status();
        let value: Value = response.json().await.unwrap_or_else(|_| json!({}));
        if !status.is_success() {
            return Err(eyre!("create equivalent returned {status}: {value}"));
        }
        Ok(value)
    }

    /// Open a trust line lender -> borrower.
    pub async fn open_trust_line(
        &self,
        lender: &Actor,
        borrower: &Pid,
        equivalent: &EquivalentCode,
        limit: &str,
        policy: TrustPolicy,
    ) -> Result<Value> {
        let payload = TrustLinePayload {
            from: lender.pid.clone(),
            to: borrower.clone(),
            equivalent: equivalent.clone(),
            limit: Amount::parse(limit).map_err(|e| eyre!("{e}"))?,
            policy,
        };
        self.post_signed("/v1/trustlines", &payload, &lender.key)
            .await
    }

    /// Create a payment sender -> receiver and return the terminal outcome.
    pub async fn pay(
        &self,
        sender: &Actor,
        receiver: &Pid,
        equivalent: &EquivalentCode,
        amount: &str,
        nonce: &str,
        idempotency_key: Option<&str>,
    ) -> Result<Value> {
        let payload = PaymentPayload {
            from: sender.pid.clone(),
            to: receiver.clone(),
            equivalent: equivalent.clone(),
            amount: Amount::parse(amount).map_err(|e| eyre!("{e}"))?,
            nonce: nonce.to_string(),
            issued_at: chrono_now(),
        };
        let signature = signing::sign_payload(&sender.key, &payload)
            .map_err(|e| eyre!("signing failed: {e}"))?;
        let mut body = json!({
            "payload": payload,
            "signature": signature,
        });
        if let Some(key) = idempotency_key {
            body["idempotency_key"] = json!(key);
        }
        let response = self
            .http
            .post(format!("{}/v1/payments", self.base_url))
            .json(&body)
            .send()
            .await
            .wrap_err("create payment failed")?;
        let status = response.status();
        let value: Value = response.json().await.unwrap_or_else(|_| json!({}));
        if !status.is_success() && value.get("error").is_none() {
            return Err(eyre!("create payment returned {status}: {value}"));
        }
        Ok(value)
    }

    pub async fn debts(&self, pid: &Pid, direction: &str) -> Result<Value> {
        let response = self
            .http
            .get(format!(
                "{}/v1/participants/{}/debts?direction={}",
                self.base_url, pid, direction
            ))
            .send()
            .await
            .wrap_err("list debts failed")?;
        response.json().await.wrap_err("list debts body")
    }

    pub async fn balance(&self, pid: &Pid) -> Result<Value> {
        let response = self
            .http
            .get(format!("{}/v1/participants/{}/balance", self.base_url, pid))
            .send()
            .await
            .wrap_err("balance failed")?;
        response.json().await.wrap_err("balance body")
    }

    pub async fn run_clearing(&self, equivalent: &EquivalentCode) -> Result<Value> {
        let mut request = self
            .http
            .post(format!("{}/v1/clearing/run", self.base_url))
            .json(&json!({ "equivalent": equivalent.as_str() }));
        if let Some(token) = &self.admin_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.wrap_err("run clearing failed")?;
        let status = response.status();
        let value: Value = response.json().await.unwrap_or_else(|_| json!({}));
        if !status.is_success() {
            return Err(eyre!("run clearing returned {status}: {value}"));
        }
        Ok(value)
    }

    /// A directed debt amount, if the row exists.
    pub async fn debt_between(
        &self,
        debtor: &Actor,
        creditor: &Pid,
        equivalent: &EquivalentCode,
    ) -> Result<Option<String>> {
        let debts = self.debts(&debtor.pid, "outgoing").await?;
        let found = debts.as_array().and_then(|rows| {
            rows.iter()
                .find(|d| {
                    d["creditor"].as_str() == Some(creditor.as_str())
                        && d["equivalent"].as_str() == Some(equivalent.as_str())
                })
                .and_then(|d| d["amount"].as_str())
                .map(|s| s.to_string())
        });
        Ok(found)
    }
}

fn chrono_now() -> String {
    chrono::Utc::now().to_rfc3339()
}
