//! # Object store proxy
//!
//! HTTP client to the remote object store, sharing the session-token
//! refresh shape of [`super::cloud_db`] and adding upload-time content
//! validation for the closed set of flight-log formats spec §4.5 allows
//! through (ULog, ROS bag), identified by magic bytes rather than extension.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::config::CloudConfig;

use super::{HealthState, Proxy, ProxyError, ProxyHealth, ProxyHealthDetails};

const ULOG_MAGIC: &[u8] = b"ULog";
const ROSBAG_MAGIC: &[u8] = b"#ROSBAG";

/// The closed set of flight-log formats the object store accepts on upload
/// (spec §4.5). Anything else is a [`ProxyError::Validation`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    ULog,
    RosBag,
}

fn sniff_format(content: &[u8]) -> Option<LogFormat> {
    if content.starts_with(ULOG_MAGIC) {
        Some(LogFormat::ULog)
    } else if content.starts_with(ROSBAG_MAGIC) {
        Some(LogFormat::RosBag)
    } else {
        None
    }
}

pub struct ObjectStoreProxy {
    config: CloudConfig,
    machine_id: String,
    client: Client,
    session_token: Mutex<Option<String>>,
    token_valid: AtomicBool,
    last_error: Mutex<Option<String>>,
    stop_tx: watch::Sender<bool>,
}

impl ObjectStoreProxy {
    pub fn new(config: CloudConfig, machine_id: String) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            machine_id,
            client: Client::new(),
            session_token: Mutex::new(None),
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

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProxyError::Protocol(format!("malformed session token response: {e}")))?;
        let token = body
            .get("token")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ProxyError::Protocol("session token response missing `token`".to_string()))?
            .to_string();

        *self.session_token.lock().await = Some(token);
        self.token_valid.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn auto_key(&self, filename: &str) -> String {
        let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        format!("flight-logs/{}/{timestamp}_{filename}", self.machine_id)
    }

    /// Uploads `content` under `key` if given, otherwise an auto-generated
    /// key scoped to this machine. Rejects any payload that doesn't match a
    /// recognized flight-log magic byte sequence.
    pub async fn upload(
        &self,
        key: Option<String>,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<String, ProxyError> {
        let format = sniff_format(&content).ok_or_else(|| {
            ProxyError::Validation(
                "content does not match a recognized ULog or ROS bag magic header".to_string(),
            )
        })?;

        let key = key.unwrap_or_else(|| self.auto_key(filename));
        let url = format!(
            "{}/buckets/{}/objects/{key}",
            self.config.cloud_endpoint, self.config.s3_bucket_name
        );

        let mut builder = self.client.put(url).body(content);
        if let Some(token) = self.session_token.lock().await.clone() {
            builder = builder.bearer_auth(token);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("upload failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(ProxyError::Transport(format!("upload returned {}", resp.status())));
        }

        info!("uploaded {key} ({format:?}, {} bytes)", resp.content_length().unwrap_or(0));
        Ok(key)
    }

    pub async fn download(&self, key: &str) -> Result<Vec<u8>, ProxyError> {
        let url = format!(
            "{}/buckets/{}/objects/{key}",
            self.config.cloud_endpoint, self.config.s3_bucket_name
        );
        let mut builder = self.client.get(url);
        if let Some(token) = self.session_token.lock().await.clone() {
            builder = builder.bearer_auth(token);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("download failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(ProxyError::Transport(format!("download returned {}", resp.status())));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ProxyError::Transport(format!("download body read failed: {e}")))?;
        Ok(bytes.to_vec())
    }

    /// Copy-then-delete, since the backend exposes no native rename (spec
    /// §4.5). A failed delete after a successful copy leaves both objects
    /// present rather than losing data; the caller sees the error and may
    /// retry the delete.
    pub async fn move_file(&self, src: &str, dst: &str) -> Result<(), ProxyError> {
        let content = self.download(src).await?;
        let filename = dst.rsplit('/').next().unwrap_or(dst).to_string();
        self.upload(Some(dst.to_string()), &filename, content).await?;
        self.delete(src).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), ProxyError> {
        let url = format!(
            "{}/buckets/{}/objects/{key}",
            self.config.cloud_endpoint, self.config.s3_bucket_name
        );
        let mut builder = self.client.delete(url);
        if let Some(token) = self.session_token.lock().await.clone() {
            builder = builder.bearer_auth(token);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("delete failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(ProxyError::Transport(format!("delete returned {}", resp.status())));
        }
        Ok(())
    }
}

#[async_trait]
impl Proxy for ObjectStoreProxy {
    fn name(&self) -> &'static str {
        "object_store"
    }

    async fn start(&self) -> Result<(), ProxyError> {
        match self.refresh_session_token().await {
            Ok(()) => info!("object store session token acquired"),
            Err(e) => {
                warn!("object store initial token fetch failed: {e}; entering pending state");
                *self.last_error.lock().await = Some(e.to_string());
            }
        }

        let client = self.client.clone();
        let config = self.config.clone();
        let machine_id = self.machine_id.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        let _ = tokio::task::Builder::new().name("ObjectStoreTokenRefresh").spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => return,
                    _ = ticker.tick() => {
                        let _ = client
                            .post(&config.session_token_url)
                            .json(&serde_json::json!({ "machine_id": machine_id }))
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
            details: ProxyHealthDetails::ObjectStore { token_valid },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn sniffs_ulog_header() {
        let mut content = ULOG_MAGIC.to_vec();
        content.extend_from_slice(&[1, 2, 3]);
        assert_eq!(sniff_format(&content), Some(LogFormat::ULog));
    }

    #[test]
    fn sniffs_rosbag_header() {
        let mut content = ROSBAG_MAGIC.to_vec();
        content.extend_from_slice(b"V2.0\n");
        assert_eq!(sniff_format(&content), Some(LogFormat::RosBag));
    }

    #[test]
    fn rejects_unrecognized_content() {
        assert_eq!(sniff_format(b"not a flight log"), None);
    }

    #[tokio::test]
    async fn upload_rejects_invalid_magic_bytes() {
        let proxy = ObjectStoreProxy::new(test_config(), "M1".to_string());
        let err = proxy
            .upload(None, "test.bin", b"garbage".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Validation(_)));
    }

    #[tokio::test]
    async fn health_is_pending_before_token_acquired() {
        let proxy = ObjectStoreProxy::new(test_config(), "M1".to_string());
        let health = proxy.health().await;
        assert_eq!(health.state, HealthState::Pending);
    }
}
