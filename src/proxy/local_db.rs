//! # Local DB proxy
//!
//! HTTP client to the on-device database service. Same scoping invariant as
//! [`super::cloud_db`] but no session-token refresh -- the local service is
//! reachable over the loopback interface and trusts the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::config::LocalDbConfig;

use super::scoping;
use super::{HealthState, Proxy, ProxyError, ProxyHealth, ProxyHealthDetails};

pub struct LocalDbProxy {
    config: LocalDbConfig,
    machine_id: String,
    client: Client,
    connected: AtomicBool,
    last_error: Mutex<Option<String>>,
    stop_tx: watch::Sender<bool>,
}

impl LocalDbProxy {
    pub fn new(config: LocalDbConfig, machine_id: String) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            machine_id,
            client: Client::new(),
            connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
            stop_tx,
        })
    }

    async fn probe(&self) -> Result<(), ProxyError> {
        let resp = self
            .client
            .get(format!("{}/health", self.config.endpoint))
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("local DB probe failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(ProxyError::Transport(format!(
                "local DB health endpoint returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    pub async fn get_item(&self, table: &str, query: Value) -> Result<Option<Value>, ProxyError> {
        let scoped = scoping::scope_query(query, &self.machine_id);
        let resp = self
            .client
            .post(format!("{}/tables/{table}/get", self.config.endpoint))
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

    pub async fn scan_items(&self, table: &str, query: Value) -> Result<Vec<Value>, ProxyError> {
        let scoped = scoping::scope_query(query, &self.machine_id);
        let resp = self
            .client
            .post(format!("{}/tables/{table}/scan", self.config.endpoint))
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

    pub async fn set_item(&self, table: &str, item: Value) -> Result<(), ProxyError> {
        let scoped = scoping::enforce_write_scope(item, &self.machine_id)?;
        let resp = self
            .client
            .post(format!("{}/tables/{table}/put", self.config.endpoint))
            .json(&scoped)
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("set_item failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(ProxyError::Transport(format!("set_item returned {}", resp.status())));
        }
        Ok(())
    }

    pub async fn update_item(&self, table: &str, query: Value, item: Value) -> Result<(), ProxyError> {
        let scoped_query = scoping::scope_query(query, &self.machine_id);
        let scoped_item = scoping::enforce_write_scope(item, &self.machine_id)?;
        let resp = self
            .client
            .post(format!("{}/tables/{table}/update", self.config.endpoint))
            .json(&serde_json::json!({ "query": scoped_query, "item": scoped_item }))
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("update_item failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(ProxyError::Transport(format!("update_item returned {}", resp.status())));
        }
        Ok(())
    }

    /// Resolves `(org_id, device_id)` for [`super::mqtt::OrgDeviceResolver`].
    /// The local DB is the source of truth for both ids once provisioned
    /// (spec §4.4).
    pub async fn org_device_ids(&self) -> Option<(String, String)> {
        let item = self
            .get_item("device_identity", serde_json::json!({"id": "self"}))
            .await
            .ok()??;
        let org_id = item.get("org_id")?.as_str()?.to_string();
        let device_id = item.get("device_id")?.as_str()?.to_string();
        Some((org_id, device_id))
    }
}

#[async_trait]
impl Proxy for LocalDbProxy {
    fn name(&self) -> &'static str {
        "local_db"
    }

    async fn start(&self) -> Result<(), ProxyError> {
        match self.probe().await {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                info!("local DB reachable at {}", self.config.endpoint);
            }
            Err(e) => {
                warn!("local DB not reachable yet: {e}");
                *self.last_error.lock().await = Some(e.to_string());
            }
        }

        let client = self.client.clone();
        let endpoint = self.config.endpoint.clone();
        let retry_interval = self.config.retry_interval;
        let mut stop_rx = self.stop_tx.subscribe();
        let _ = tokio::task::Builder::new().name("LocalDbProbe").spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => return,
                    _ = tokio::time::sleep(retry_interval) => {}
                }
                let _ = client.get(format!("{endpoint}/health")).send().await;
            }
        });

        Ok(())
    }

    async fn stop(&self) -> Result<(), ProxyError> {
        let _ = self.stop_tx.send(true);
        Ok(())
    }

    async fn health(&self) -> ProxyHealth {
        let connected = self.connected.load(Ordering::SeqCst);
        ProxyHealth {
            state: if connected {
                HealthState::Healthy
            } else {
                HealthState::Pending
            },
            last_error: self.last_error.lock().await.clone(),
            details: ProxyHealthDetails::LocalDb { connected },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> LocalDbConfig {
        LocalDbConfig {
            endpoint: "http://127.0.0.1:8090".to_string(),
            startup_timeout: std::time::Duration::from_secs(1),
            retry_interval: std::time::Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn set_item_rejects_foreign_machine_id() {
        let proxy = LocalDbProxy::new(test_config(), "M1".to_string());
        let err = proxy
            .set_item("telemetry", json!({"id": "x", "robot_instance_id": "M2"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Authorization(_)));
    }

    #[tokio::test]
    async fn health_is_pending_before_first_probe_succeeds() {
        let proxy = LocalDbProxy::new(test_config(), "M1".to_string());
        let health = proxy.health().await;
        assert_eq!(health.state, HealthState::Pending);
    }
}
