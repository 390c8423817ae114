//! # Redis proxy
//!
//! Key/value operations plus pub/sub with per-channel and pattern callbacks,
//! dispatched through a worker pool so a slow callback never stalls the
//! reader task (spec §4.2).
//!
//! Generalizes the teacher's `MQTTConnection` "dedicated reader task +
//! watch/mpsc channel" shape (`mqtt::mqtt_handler::MQTTConnection<Processing>::run`)
//! to Redis pub/sub: one task owns the `PubSub` stream, a bounded channel
//! decouples it from a pool of `RedisWorker-n` tasks that actually invoke
//! subscriber callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use glob::Pattern;
use redis::aio::ConnectionManager;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::RedisConfig;

use super::{HealthState, Proxy, ProxyError, ProxyHealth, ProxyHealthDetails};

pub type RedisCallback = Arc<dyn Fn(String, String) + Send + Sync>;

/// Spawns the dedicated pub/sub reader task. Free function (not a method)
/// so both the initial connect and the reconnect monitor in `start()` can
/// call it without needing an `Arc<RedisProxy>` self-reference.
fn spawn_pubsub_reader(
    url: String,
    dispatch_tx: mpsc::Sender<(String, String)>,
    mut stop_rx: tokio::sync::watch::Receiver<bool>,
) {
    let task = async move {
        let client = match redis::Client::open(url) {
            Ok(c) => c,
            Err(e) => {
                error!("redis pubsub client build failed: {e}");
                return;
            }
        };
        let pubsub_conn = match client.get_async_pubsub().await {
            Ok(c) => c,
            Err(e) => {
                error!("redis pubsub connect failed: {e}");
                return;
            }
        };
        let mut stream = pubsub_conn.into_on_message();
        loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                msg = stream.next() => {
                    match msg {
                        Some(msg) => {
                            let channel: String = msg.get_channel_name().to_string();
                            let payload: String = match msg.get_payload() {
                                Ok(p) => p,
                                Err(e) => {
                                    warn!("non-utf8 redis payload on {channel}: {e}");
                                    continue;
                                }
                            };
                            if dispatch_tx.send((channel, payload)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    };
    let _ = tokio::task::Builder::new()
        .name("RedisPubSubReader")
        .spawn(task);
}

struct Subscriptions {
    exact: DashMap<String, Vec<(u64, RedisCallback)>>,
    patterns: DashMap<u64, (Pattern, RedisCallback)>,
    next_id: std::sync::atomic::AtomicU64,
}

impl Subscriptions {
    fn new() -> Self {
        Self {
            exact: DashMap::new(),
            patterns: DashMap::new(),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn next_handler_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// The mutable connection state, split out from `RedisProxy` so that both
/// `start()`'s initial connect and its background reconnect monitor can
/// hold an `Arc` to it without needing an `Arc<Self>` self-reference.
struct ConnState {
    conn: Mutex<Option<ConnectionManager>>,
    connected: AtomicBool,
    last_error: Mutex<Option<String>>,
}

pub struct RedisProxy {
    config: RedisConfig,
    state: Arc<ConnState>,
    subs: Arc<Subscriptions>,
    dispatch_tx: mpsc::Sender<(String, String)>,
    worker_count: usize,
    stop_tx: tokio::sync::watch::Sender<bool>,
}

impl RedisProxy {
    pub fn new(config: RedisConfig) -> Arc<Self> {
        let subs = Arc::new(Subscriptions::new());
        let (dispatch_tx, dispatch_rx) = mpsc::channel::<(String, String)>(4096);
        let (stop_tx, _stop_rx) = tokio::sync::watch::channel(false);

        let proxy = Arc::new(Self {
            worker_count: config.worker_threads.max(1),
            config,
            state: Arc::new(ConnState {
                conn: Mutex::new(None),
                connected: AtomicBool::new(false),
                last_error: Mutex::new(None),
            }),
            subs,
            dispatch_tx,
            stop_tx,
        });

        proxy.clone().spawn_workers(dispatch_rx);
        proxy
    }

    fn spawn_workers(self: Arc<Self>, dispatch_rx: mpsc::Receiver<(String, String)>) {
        let dispatch_rx = Arc::new(Mutex::new(dispatch_rx));
        for worker_id in 0..self.worker_count {
            let this = self.clone();
            let rx = dispatch_rx.clone();
            let mut stop_rx = this.stop_tx.subscribe();
            let name = format!("RedisWorker-{worker_id}");
            let task = async move {
                loop {
                    let next = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = stop_rx.changed() => None,
                            msg = rx.recv() => msg,
                        }
                    };
                    match next {
                        Some((channel, payload)) => this.dispatch_one(&channel, &payload),
                        None => break,
                    }
                }
            };
            let _ = tokio::task::Builder::new().name(&name).spawn(task);
        }
    }

    fn dispatch_one(&self, channel: &str, payload: &str) {
        if let Some(entry) = self.subs.exact.get(channel) {
            for (_, cb) in entry.value() {
                cb(channel.to_string(), payload.to_string());
            }
        }
        for entry in self.subs.patterns.iter() {
            let (pattern, cb) = entry.value();
            if pattern.matches(channel) {
                cb(channel.to_string(), payload.to_string());
            }
        }
    }

    async fn connection(&self) -> Result<ConnectionManager, ProxyError> {
        let guard = self.state.conn.lock().await;
        guard
            .clone()
            .ok_or_else(|| ProxyError::Transport("redis not connected".to_string()))
    }

    fn connection_url(&self) -> String {
        if let Some(path) = &self.config.unix_socket_path {
            format!("redis+unix://{}", path.display())
        } else {
            format!("redis://{}:{}", self.config.host, self.config.port)
        }
    }

    async fn connect_once(&self) -> Result<(), ProxyError> {
        let url = self.connection_url();
        let client = redis::Client::open(url.clone())
            .map_err(|e| ProxyError::Configuration(format!("invalid redis url {url}: {e}")))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| ProxyError::Transport(format!("redis connect failed: {e}")))?;
        *self.state.conn.lock().await = Some(manager);
        self.state.connected.store(true, Ordering::SeqCst);
        info!("connected to redis at {url}");
        spawn_pubsub_reader(url, self.dispatch_tx.clone(), self.stop_tx.subscribe());
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, ProxyError> {
        let mut conn = self.connection().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| ProxyError::Transport(format!("GET {key} failed: {e}")))
    }

    pub async fn set(&self, key: &str, value: &str, ex: Option<u64>) -> bool {
        let Ok(mut conn) = self.connection().await else {
            warn!("set({key}) skipped: redis not connected");
            return false;
        };
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ex) = ex {
            cmd.arg("EX").arg(ex);
        }
        match cmd.query_async::<_, ()>(&mut conn).await {
            Ok(()) => {
                debug!("set {key}");
                true
            }
            Err(e) => {
                warn!("set {key} failed: {e}");
                false
            }
        }
    }

    pub async fn del(&self, key: &str) -> Result<i64, ProxyError> {
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| ProxyError::Transport(format!("DEL {key} failed: {e}")))
    }

    pub async fn exists(&self, key: &str) -> Result<bool, ProxyError> {
        let mut conn = self.connection().await?;
        let count: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| ProxyError::Transport(format!("EXISTS {key} failed: {e}")))?;
        Ok(count > 0)
    }

    pub async fn publish(&self, channel: &str, message: &str) -> Result<i64, ProxyError> {
        let mut conn = self.connection().await?;
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await
            .map_err(|e| ProxyError::Transport(format!("PUBLISH {channel} failed: {e}")))
    }

    pub fn subscribe(&self, channel: &str, cb: RedisCallback) -> u64 {
        let id = self.subs.next_handler_id();
        self.subs
            .exact
            .entry(channel.to_string())
            .or_default()
            .push((id, cb));
        id
    }

    pub fn subscribe_pattern(&self, pattern: &str, cb: RedisCallback) -> Result<u64, ProxyError> {
        let compiled = Pattern::new(pattern)
            .map_err(|e| ProxyError::Validation(format!("invalid pattern {pattern}: {e}")))?;
        let id = self.subs.next_handler_id();
        self.subs.patterns.insert(id, (compiled, cb));
        Ok(id)
    }

    pub fn unsubscribe(&self, handler_id: u64) {
        for mut entry in self.subs.exact.iter_mut() {
            entry.value_mut().retain(|(id, _)| *id != handler_id);
        }
        self.subs.patterns.remove(&handler_id);
    }

    pub async fn scan_keys(&self, pattern: &str, count_hint: usize) -> Result<Vec<String>, ProxyError> {
        let mut conn = self.connection().await?;
        let keys: Vec<String> = redis::cmd("SCAN")
            .arg(0)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count_hint.max(1))
            .query_async::<_, (i64, Vec<String>)>(&mut conn)
            .await
            .map_err(|e| ProxyError::Transport(format!("SCAN {pattern} failed: {e}")))?
            .1;
        Ok(keys)
    }
}

#[async_trait]
impl Proxy for RedisProxy {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn start(&self) -> Result<(), ProxyError> {
        match self.connect_once().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("redis start: {e}; entering pending state, will retry");
                *self.state.last_error.lock().await = Some(e.to_string());
                let this_url = self.connection_url();
                let retry_interval = self.config.retry_interval;
                let conn_slot = {
                    // Spawn a reconnection monitor; `start()` itself still
                    // returns immediately (spec §4.1: "non-blocking"). On a
                    // successful reconnect this swaps the manager into the
                    // shared `ConnState` and (re)spawns the pubsub reader
                    // before exiting, instead of just probing reachability.
                    let state = self.state.clone();
                    let dispatch_tx = self.dispatch_tx.clone();
                    let mut stop_rx = self.stop_tx.subscribe();
                    let stop_rx_for_reader = self.stop_tx.subscribe();
                    async move {
                        loop {
                            tokio::select! {
                                biased;
                                _ = stop_rx.changed() => break,
                                _ = tokio::time::sleep(retry_interval) => {}
                            }
                            let Ok(client) = redis::Client::open(this_url.clone()) else {
                                continue;
                            };
                            match client.get_connection_manager().await {
                                Ok(manager) => {
                                    *state.conn.lock().await = Some(manager);
                                    state.connected.store(true, Ordering::SeqCst);
                                    *state.last_error.lock().await = None;
                                    info!("reconnected to redis at {this_url}");
                                    spawn_pubsub_reader(this_url.clone(), dispatch_tx, stop_rx_for_reader);
                                    break;
                                }
                                Err(e) => {
                                    warn!("redis reconnect attempt failed: {e}");
                                }
                            }
                        }
                    }
                };
                let _ = tokio::task::Builder::new()
                    .name("RedisReconnect")
                    .spawn(conn_slot);
                Ok(())
            }
        }
    }

    async fn stop(&self) -> Result<(), ProxyError> {
        let _ = self.stop_tx.send(true);
        *self.state.conn.lock().await = None;
        self.state.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn health(&self) -> ProxyHealth {
        let connected = self.state.connected.load(Ordering::SeqCst);
        ProxyHealth {
            state: if connected {
                HealthState::Healthy
            } else {
                HealthState::Pending
            },
            last_error: self.state.last_error.lock().await.clone(),
            details: ProxyHealthDetails::Redis {
                connected,
                worker_count: self.worker_count,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_url_prefers_unix_socket() {
        let config = RedisConfig {
            unix_socket_path: Some("/tmp/redis.sock".into()),
            host: "ignored".to_string(),
            port: 0,
            worker_threads: 1,
            startup_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_secs(1),
        };
        let proxy = RedisProxy::new(config);
        assert_eq!(proxy.connection_url(), "redis+unix:///tmp/redis.sock");
    }

    #[test]
    fn connection_url_falls_back_to_tcp() {
        let config = RedisConfig {
            unix_socket_path: None,
            host: "127.0.0.1".to_string(),
            port: 6379,
            worker_threads: 1,
            startup_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_secs(1),
        };
        let proxy = RedisProxy::new(config);
        assert_eq!(proxy.connection_url(), "redis://127.0.0.1:6379");
    }

    #[test]
    fn unsubscribe_removes_exact_and_pattern_handlers() {
        let config = RedisConfig {
            unix_socket_path: None,
            host: "127.0.0.1".to_string(),
            port: 6379,
            worker_threads: 1,
            startup_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_secs(1),
        };
        let proxy = RedisProxy::new(config);
        let id = proxy.subscribe("chan", Arc::new(|_, _| {}));
        assert_eq!(proxy.subs.exact.get("chan").unwrap().len(), 1);
        proxy.unsubscribe(id);
        assert_eq!(proxy.subs.exact.get("chan").unwrap().len(), 0);
    }
}
