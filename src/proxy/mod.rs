//! # Proxy subsystem
//!
//! A proxy is an owning component that multiplexes access to one external
//! system (MAVLink, Redis, the MQTT bridge, the cloud DB, the local DB, the
//! object store). Every proxy is created once at boot, lives for the
//! process lifetime, and exposes exactly three operations: `start`, `stop`,
//! `health` (spec §4.1). Petals hold only non-owning `Arc<dyn Proxy>`
//! references.
//!
//! Generalizes the teacher's per-subsystem state-machine-behind-a-handle
//! pattern (see `mqtt::mqtt_handler::MQTTHandle`) into a single trait object
//! so the petal loader and the control API can treat every proxy uniformly.

pub mod cloud_db;
pub mod local_db;
pub mod mavlink;
pub mod mqtt;
pub mod object_store;
pub mod redis;
pub mod scoping;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

/// Error taxonomy shared by every proxy operation (spec §7). Transport
/// failures never escape a proxy as a panic or an opaque exception -- they
/// come back as one of these variants, logged at the proxy's discretion.
#[derive(Debug, Error, Clone)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("dependency error: {0}")]
    Dependency(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("authorization error: {0}")]
    Authorization(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse-grained health state, as returned by every proxy's `health()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Pending,
}

/// Proxy-specific counters, one variant per proxy kind, attached to the
/// common [`ProxyHealth`] envelope (spec §3 "Health record").
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProxyHealthDetails {
    Mavlink {
        io_thread_alive: bool,
        worker_count: usize,
        workers_alive: usize,
        buffer_depth: usize,
        frames_dropped: u64,
        leaf_fc_connected: bool,
    },
    Redis {
        connected: bool,
        worker_count: usize,
    },
    Mqtt {
        org_id_known: bool,
        device_id_known: bool,
        ingress_depth: usize,
        dropped: u64,
    },
    CloudDb {
        token_valid: bool,
    },
    LocalDb {
        connected: bool,
    },
    ObjectStore {
        token_valid: bool,
    },
    None,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProxyHealth {
    pub state: HealthState,
    pub last_error: Option<String>,
    pub details: ProxyHealthDetails,
}

impl ProxyHealth {
    pub fn pending() -> Self {
        Self {
            state: HealthState::Pending,
            last_error: None,
            details: ProxyHealthDetails::None,
        }
    }
}

/// The base proxy contract (spec §4.1).
///
/// - `start`: non-blocking; must reach `Connected` or `Pending` and never
///   fail the process just because a remote is unreachable.
/// - `stop`: idempotent, bounded-time even against an unreachable remote.
/// - `health`: never blocks on the remote.
#[async_trait]
pub trait Proxy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn start(&self) -> Result<(), ProxyError>;
    async fn stop(&self) -> Result<(), ProxyError>;
    async fn health(&self) -> ProxyHealth;
}

/// The set of proxies known to the process, keyed by name, plus which of
/// them are currently enabled.
///
/// Reads return an immutable snapshot; the enabled set itself is guarded by
/// a single `RwLock` (spec §5: "read-copy-update under a mutex; reads
/// return an immutable snapshot").
pub struct ProxyRegistry {
    proxies: HashMap<&'static str, Arc<dyn Proxy>>,
    enabled: RwLock<HashMap<&'static str, bool>>,
}

impl ProxyRegistry {
    pub fn new(proxies: Vec<Arc<dyn Proxy>>, enabled_at_boot: &[String]) -> Self {
        let mut map = HashMap::new();
        let mut enabled = HashMap::new();
        for proxy in proxies {
            let name = proxy.name();
            enabled.insert(name, enabled_at_boot.iter().any(|e| e == name));
            map.insert(name, proxy);
        }
        Self {
            proxies: map,
            enabled: RwLock::new(enabled),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Proxy>> {
        self.proxies.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.proxies.keys().copied().collect()
    }

    pub async fn is_enabled(&self, name: &str) -> bool {
        *self.enabled.read().await.get(name).unwrap_or(&false)
    }

    pub async fn enabled_snapshot(&self) -> HashMap<&'static str, bool> {
        self.enabled.read().await.clone()
    }

    pub async fn set_enabled(&self, name: &'static str, enabled: bool) {
        self.enabled.write().await.insert(name, enabled);
    }

    pub async fn health_snapshot(&self) -> HashMap<&'static str, ProxyHealth> {
        let mut out = HashMap::new();
        for (name, proxy) in &self.proxies {
            out.insert(*name, proxy.health().await);
        }
        out
    }
}
