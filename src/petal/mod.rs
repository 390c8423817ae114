//! # Petal trait and lifecycle types
//!
//! A petal is a pluggable, name-prefixed module contributed by someone other
//! than the core PAM team; petal business logic itself is out of scope
//! (spec §1). PAM defines only the contract and a loader that works against
//! `Arc<dyn Petal>` -- the same non-owning trait-object pattern
//! [`crate::proxy::Proxy`] uses for the external systems a petal consumes.

pub mod actions;
pub mod registry;

use async_trait::async_trait;
use axum::Router;
use serde::Serialize;
use thiserror::Error;

pub use actions::{ActionError, MqttAction};

/// Load-bearing name prefix (spec §4.6: "several subsystems -- logger
/// routing, topic namespacing -- derive from it").
pub const PETAL_NAME_PREFIX: &str = "petal-";

#[derive(Clone, Debug, Error)]
pub enum PetalError {
    #[error("invalid petal name {0:?}: must start with \"petal-\"")]
    InvalidName(String),
    #[error("unmet proxy dependency: {0}")]
    DependencyUnmet(String),
    #[error("startup failed: {0}")]
    Startup(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Rust's explicit stand-in for the duck-typed lifecycle states the Python
/// original tracked implicitly (SPEC_FULL §3: "the one spec-silent lifecycle
/// detail ... made explicit here").
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PetalState {
    Unloaded,
    Loaded,
    Failed { reason: String },
    Enabled,
    Disabled,
}

/// The petal contract (spec §3, §4.6). A petal is created once when loaded
/// and destroyed at process shutdown; it holds only non-owning `Arc<dyn
/// Proxy>` references to the proxies it depends on (spec §9: "petals hold
/// non-owning references only").
#[async_trait]
pub trait Petal: Send + Sync {
    fn name(&self) -> &'static str;
    fn version(&self) -> &'static str;

    /// Proxies that must be enabled before this petal may load (spec §3
    /// invariant).
    fn required_proxies(&self) -> &'static [&'static str] {
        &[]
    }

    /// Proxies this petal uses opportunistically if present.
    fn optional_proxies(&self) -> &'static [&'static str] {
        &[]
    }

    /// HTTP/WebSocket surface, mounted under `/petals/{name}` by the loader
    /// (spec §4.6). Empty by default.
    fn http_router(&self) -> Router {
        Router::new()
    }

    /// Declarative MQTT command-action registrations (spec §4.7). Empty by
    /// default -- petals with no MQTT surface never touch the MQTT proxy.
    fn mqtt_actions(&self) -> Vec<MqttAction> {
        Vec::new()
    }

    /// Synchronous setup run before the petal is considered `loaded` (spec
    /// §4.6 phase 2).
    fn startup(&self) -> Result<(), PetalError> {
        Ok(())
    }

    /// Awaited setup scheduled after `startup()` returns.
    async fn async_startup(&self) -> Result<(), PetalError> {
        Ok(())
    }

    /// Best-effort teardown at process shutdown or petal disable.
    async fn shutdown(&self) {}
}

/// `inventory`-based discovery fallback (spec §4.6: "a process-wide
/// plugin-discovery mechanism keyed by a well-known group name"), tried only
/// when a petal has no direct-path entry in the YAML `petals:` map. An
/// appropriate Rust-native substitute for Python entry-point discovery,
/// since PAM has no `dlopen`-style dynamic loader.
pub struct PetalFactory {
    pub name: &'static str,
    pub factory: fn() -> std::sync::Arc<dyn Petal>,
}

inventory::collect!(PetalFactory);
