//! # MQTT proxy
//!
//! PAM never opens a raw MQTT socket (spec §4.4): a sidecar bridge process
//! speaks MQTT to the cloud broker and HTTP to PAM. This proxy is the HTTP
//! client half of that relationship, plus a local ingress server the bridge
//! posts inbound commands to.
//!
//! Generalizes the teacher's `MQTTConnection<S: MQTTState>` lifecycle
//! (`mqtt::mqtt_handler`) one state at a time:
//! - `Initializing` no longer opens a broker socket; it polls for the
//!   organization id and device id the topic names are scoped by.
//! - `Configured` has nothing to subscribe to (there is no broker
//!   connection to subscribe on) -- it exists to keep the three-state shape
//!   the teacher's lifecycle uses, and as the natural place to bind the
//!   ingress listener.
//! - `Processing` drains the ingress queue instead of polling an
//!   `EventLoop`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use futures::future::BoxFuture;
use moka::sync::Cache;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statum::{machine, state};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;

use super::{HealthState, Proxy, ProxyError, ProxyHealth, ProxyHealthDetails};

/// Resolves `(org_id, device_id)` from wherever they actually live -- the
/// local DB proxy or an organization manager (spec §4.4). Injected at
/// construction so this proxy doesn't need a structural dependency on
/// `LocalDbProxy`.
pub type OrgDeviceResolver = Arc<dyn Fn() -> BoxFuture<'static, Option<(String, String)>> + Send + Sync>;

/// The single command handler registered via [`MqttProxy::register_handler`]
/// (spec §4.4: "exactly one handler may be registered").
pub type CommandHandler = Arc<dyn Fn(IncomingCommand) + Send + Sync>;

#[derive(Clone, Debug, Deserialize)]
pub struct IncomingCommand {
    pub command: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(default, rename = "waitResponse")]
    pub wait_response: bool,
    #[serde(default)]
    pub data: Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct CommandResponse {
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub success: bool,
    #[serde(flatten)]
    pub fields: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

struct Inner {
    config: MqttConfig,
    client: Client,
    org_device: RwLock<Option<(String, String)>>,
    handler: RwLock<Option<CommandHandler>>,
    next_subscription_id: std::sync::atomic::AtomicU64,
    dedup: Cache<String, ()>,
    dropped: AtomicU64,
    depth: AtomicUsize,
    last_error: tokio::sync::Mutex<Option<String>>,
}

/// Topic names are only ever built once org/device ids are known (spec
/// §4.4). Callers that need a topic before then get `None`.
fn topic(org_device: &Option<(String, String)>, suffix: &str) -> Option<String> {
    let (org, dev) = org_device.as_ref()?;
    Some(format!("org/{org}/device/{dev}/{suffix}"))
}

pub struct MqttProxy {
    inner: Arc<Inner>,
    resolver: OrgDeviceResolver,
    ingress_tx: mpsc::Sender<Value>,
    ingress_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Value>>>,
    stop_tx: watch::Sender<bool>,
}

const INGRESS_CAPACITY: usize = 1024;
const DEDUP_TTL: Duration = Duration::from_secs(60);
const WORKER_COUNT: usize = 4;

impl MqttProxy {
    pub fn new(config: MqttConfig, resolver: OrgDeviceResolver) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_CAPACITY);
        Arc::new(Self {
            inner: Arc::new(Inner {
                client: Client::new(),
                org_device: RwLock::new(None),
                handler: RwLock::new(None),
                next_subscription_id: std::sync::atomic::AtomicU64::new(1),
                dedup: Cache::builder().time_to_live(DEDUP_TTL).build(),
                dropped: AtomicU64::new(0),
                depth: AtomicUsize::new(0),
                last_error: tokio::sync::Mutex::new(None),
                config,
            }),
            resolver,
            ingress_tx,
            ingress_rx: tokio::sync::Mutex::new(Some(ingress_rx)),
            stop_tx,
        })
    }

    /// Registers the single master command handler (spec §4.4). Returns a
    /// subscription id callers can ignore -- there is nothing to
    /// unregister-by-id against since only one handler is ever active, but
    /// the id is returned for symmetry with the MAVLink/Redis registries.
    pub async fn register_handler(&self, cb: CommandHandler) -> u64 {
        *self.inner.handler.write().await = Some(cb);
        self.inner.next_subscription_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Publishes `response` to the `response` topic carrying `message_id`
    /// (spec §4.4, §4.7).
    pub async fn send_command_response(&self, message_id: &str, response: Value) -> bool {
        let org_device = self.inner.org_device.read().await.clone();
        let Some(topic) = topic(&org_device, "response") else {
            warn!("send_command_response({message_id}) dropped: org/device id not yet known");
            return false;
        };
        let body = CommandResponse {
            message_id: message_id.to_string(),
            timestamp: Utc::now(),
            success: response
                .get("success")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            fields: response,
        };
        self.post_bridge(&topic, serde_json::to_value(&body).unwrap_or(Value::Null), Qos::AtLeastOnce)
            .await
    }

    /// Publishes to `command/web` via the bridge's HTTP API (spec §4.4).
    pub async fn publish_message(&self, payload: Value, qos: Qos) -> bool {
        let org_device = self.inner.org_device.read().await.clone();
        let Some(topic) = topic(&org_device, "command/web") else {
            warn!("publish_message dropped: org/device id not yet known");
            return false;
        };
        self.post_bridge(&topic, payload, qos).await
    }

    async fn post_bridge(&self, topic: &str, payload: Value, qos: Qos) -> bool {
        let url = format!(
            "http://{}:{}/publish",
            self.inner.config.bridge_host, self.inner.config.bridge_port
        );
        let qos_n = match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
        };
        let body = serde_json::json!({ "topic": topic, "payload": payload, "qos": qos_n });
        match self.inner.client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!("bridge publish to {topic} returned {}", resp.status());
                false
            }
            Err(e) => {
                warn!("bridge publish to {topic} failed: {e}");
                *self.inner.last_error.lock().await = Some(e.to_string());
                false
            }
        }
    }

    pub async fn org_device_ids(&self) -> Option<(String, String)> {
        self.inner.org_device.read().await.clone()
    }

    fn ingress_router(tx: mpsc::Sender<Value>, inner: Arc<Inner>) -> Router {
        Router::new().route(
            "/mqtt-callback/callback",
            post(move |Json(body): Json<Value>| {
                let tx = tx.clone();
                let inner = inner.clone();
                async move {
                    if tx.try_send(body).is_err() {
                        inner.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!("MQTT ingress queue full, dropping newest message");
                    } else {
                        inner.depth.fetch_add(1, Ordering::Relaxed);
                    }
                    axum::http::StatusCode::ACCEPTED
                }
            }),
        )
    }
}

#[state]
#[derive(Debug, Clone, Copy)]
enum MqttLifecycle {
    Initializing,
    Configured,
    Processing,
}

#[machine]
struct MqttConnection<S: MqttLifecycle> {
    inner: Arc<Inner>,
    resolver: OrgDeviceResolver,
    ingress_rx: mpsc::Receiver<Value>,
    stop_rx: watch::Receiver<bool>,
}

impl MqttConnection<Initializing> {
    async fn discover_ids(mut self) -> MqttConnection<Configured> {
        loop {
            if *self.stop_rx.borrow() {
                break;
            }
            if let Some(ids) = (self.resolver)().await {
                info!("MQTT org/device id resolved: {}/{}", ids.0, ids.1);
                *self.inner.org_device.write().await = Some(ids);
                break;
            }
            tokio::select! {
                _ = self.stop_rx.changed() => break,
                _ = tokio::time::sleep(self.inner.config.org_id_poll_interval) => {}
            }
        }
        self.transition()
    }
}

impl MqttConnection<Configured> {
    fn activate(self) -> MqttConnection<Processing> {
        self.transition()
    }
}

impl MqttConnection<Processing> {
    /// Spawns the `MQTTWorker-n` pool that drains the ingress queue (spec
    /// §4.4/§5: a worker pool, not the HTTP handler itself, invokes
    /// handlers), then blocks until told to stop.
    async fn run(self) {
        let ingress_rx = Arc::new(tokio::sync::Mutex::new(self.ingress_rx));
        let mut stop_rx = self.stop_rx.clone();

        for worker_id in 0..WORKER_COUNT {
            let inner = self.inner.clone();
            let ingress_rx = ingress_rx.clone();
            let mut stop_rx = stop_rx.clone();
            let name = format!("MQTTWorker-{worker_id}");
            let _ = tokio::task::Builder::new().name(&name).spawn(async move {
                loop {
                    let maybe_msg = {
                        let mut rx = ingress_rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = stop_rx.changed() => return,
                            m = rx.recv() => m,
                        }
                    };
                    let Some(raw) = maybe_msg else { return };
                    inner.depth.fetch_sub(1, Ordering::Relaxed);
                    dispatch(&inner, raw).await;
                }
            });
        }

        let _ = stop_rx.changed().await;
    }
}

/// Deduplicates on `messageId` (spec §9 resolution: messageId only, not
/// topic) then hands the command to the single registered handler.
async fn dispatch(inner: &Inner, raw: Value) {
    if inner.org_device.read().await.is_none() {
        warn!("dropping inbound MQTT command: org/device id not yet known");
        return;
    }
    let command: IncomingCommand = match serde_json::from_value(raw) {
        Ok(c) => c,
        Err(e) => {
            warn!("dropping unparseable MQTT ingress message: {e}");
            return;
        }
    };
    if inner.dedup.get(&command.message_id).is_some() {
        debug!("dropping duplicate messageId {}", command.message_id);
        return;
    }
    inner.dedup.insert(command.message_id.clone(), ());

    let handler = inner.handler.read().await.clone();
    match handler {
        Some(cb) => cb(command),
        None => warn!("MQTT command {} received with no handler registered", command.command),
    }
}

#[async_trait]
impl Proxy for MqttProxy {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn start(&self) -> Result<(), ProxyError> {
        let Some(ingress_rx) = self.ingress_rx.lock().await.take() else {
            return Err(ProxyError::Internal("mqtt proxy started twice".to_string()));
        };

        let addr: std::net::SocketAddr = format!(
            "{}:{}",
            self.inner.config.callback_host, self.inner.config.callback_port
        )
        .parse()
        .map_err(|e| ProxyError::Configuration(format!("invalid MQTT callback address: {e}")))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| ProxyError::Transport(format!("creating MQTT ingress socket: {e}")))?;
        // TCP_NODELAY per spec §4.4, set before listen so every accepted
        // connection inherits it.
        socket
            .set_nodelay(true)
            .map_err(|e| ProxyError::Transport(format!("setting TCP_NODELAY: {e}")))?;
        socket
            .bind(addr)
            .map_err(|e| ProxyError::Transport(format!("binding MQTT ingress listener: {e}")))?;
        let listener: TcpListener = socket
            .listen(1024)
            .map_err(|e| ProxyError::Transport(format!("listening on MQTT ingress socket: {e}")))?;

        let router = Self::ingress_router(self.ingress_tx.clone(), self.inner.clone());
        let _ = tokio::task::Builder::new().name("MQTTIngress").spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!("MQTT ingress server exited: {e}");
            }
        });

        let inner = self.inner.clone();
        let resolver = self.resolver.clone();
        let stop_rx = self.stop_tx.subscribe();
        let _ = tokio::task::Builder::new().name("MQTTLifecycle").spawn(async move {
            let connection: MqttConnection<Initializing> =
                MqttConnection::new(inner, resolver, ingress_rx, stop_rx);
            let configured = connection.discover_ids().await;
            let processing = configured.activate();
            processing.run().await;
        });

        Ok(())
    }

    async fn stop(&self) -> Result<(), ProxyError> {
        let _ = self.stop_tx.send(true);
        Ok(())
    }

    async fn health(&self) -> ProxyHealth {
        let org_device = self.inner.org_device.read().await.clone();
        let (org_known, dev_known) = match &org_device {
            Some(_) => (true, true),
            None => (false, false),
        };
        ProxyHealth {
            state: if org_known {
                HealthState::Healthy
            } else {
                HealthState::Pending
            },
            last_error: self.inner.last_error.lock().await.clone(),
            details: ProxyHealthDetails::Mqtt {
                org_id_known: org_known,
                device_id_known: dev_known,
                ingress_depth: self.inner.depth.load(Ordering::Relaxed),
                dropped: self.inner.dropped.load(Ordering::Relaxed),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> MqttConfig {
        MqttConfig {
            bridge_host: "127.0.0.1".to_string(),
            bridge_port: 8088,
            callback_host: "127.0.0.1".to_string(),
            callback_port: 0,
            startup_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_millis(50),
            org_id_poll_interval: Duration::from_millis(10),
        }
    }

    fn no_ids_resolver() -> OrgDeviceResolver {
        Arc::new(|| Box::pin(async { None }))
    }

    #[test]
    fn topic_is_none_before_ids_known() {
        assert_eq!(topic(&None, "command"), None);
    }

    #[test]
    fn topic_formats_with_org_and_device() {
        let ids = Some(("acme".to_string(), "drone-1".to_string()));
        assert_eq!(
            topic(&ids, "command/web"),
            Some("org/acme/device/drone-1/command/web".to_string())
        );
    }

    #[tokio::test]
    async fn health_is_pending_until_ids_resolved() {
        let proxy = MqttProxy::new(test_config(), no_ids_resolver());
        let health = proxy.health().await;
        assert_eq!(health.state, HealthState::Pending);
    }

    #[tokio::test]
    async fn publish_without_ids_returns_false() {
        let proxy = MqttProxy::new(test_config(), no_ids_resolver());
        assert!(!proxy.publish_message(serde_json::json!({}), Qos::AtLeastOnce).await);
    }

    #[tokio::test]
    async fn dispatch_drops_inbound_command_before_ids_known() {
        let proxy = MqttProxy::new(test_config(), no_ids_resolver());
        let invoked = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let invoked_in_handler = invoked.clone();
        proxy
            .register_handler(Arc::new(move |_cmd: IncomingCommand| {
                invoked_in_handler.store(true, Ordering::Relaxed);
            }))
            .await;

        dispatch(
            &proxy.inner,
            serde_json::json!({
                "command": "petal-x/fast",
                "messageId": "m1",
                "waitResponse": false,
                "data": {}
            }),
        )
        .await;

        assert!(!invoked.load(Ordering::Relaxed));
    }
}
