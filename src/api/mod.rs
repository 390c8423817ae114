//! # Control and health API (spec §4.8)
//!
//! The HTTP surface external tools and the admin UI consume: a
//! petal/proxy control plane under `/api/petal-proxies-control`, a health
//! surface under `/health`, and the SSE log-tail endpoint. Each petal's own
//! router is mounted separately by [`crate::petal::registry::PetalRegistry`]
//! callers under `/petals/{name}` -- this module owns only the core's own
//! surface.
//!
//! Generalizes the teacher's `api::router(state)` shape (one `AppState`,
//! one free function building the whole `Router`) from a single-purpose
//! telemetry API to PAM's multi-subsystem control plane.

pub mod control;
pub mod health;

use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::logging::ring::RingHandle;
use crate::petal::registry::{DependencyGraph, PetalRegistry};
use crate::proxy::ProxyRegistry;

pub const PAM_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state handed to every control/health handler.
#[derive(Clone)]
pub struct AppState {
    pub config_path: PathBuf,
    pub machine_id: String,
    pub proxies: Arc<ProxyRegistry>,
    pub petals: Arc<PetalRegistry>,
    pub dependency_graph: Arc<DependencyGraph>,
    pub log_ring: RingHandle,
}

/// Builds the core's router: control plane, health, and log stream (spec
/// §4.8). Petal routers and the `/admin` static UI are mounted by the
/// caller (`main.rs`), which also owns `/mqtt-callback/callback` (mounted
/// directly on [`crate::proxy::mqtt::MqttProxy`]'s own listener, not this
/// router -- see spec §4.4).
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/petal-proxies-control/status",
            get(control::status),
        )
        .route(
            "/api/petal-proxies-control/components/list",
            get(control::components_list),
        )
        .route(
            "/api/petal-proxies-control/petals/control",
            post(control::petals_control),
        )
        .route(
            "/api/petal-proxies-control/proxies/control",
            post(control::proxies_control),
        )
        .route(
            "/api/petal-proxies-control/restart-status",
            get(control::restart_status),
        )
        .route(
            "/api/petal-proxies-control/restart",
            post(control::restart),
        )
        .route(
            "/api/petal-proxies-control/logs/stream",
            get(health::log_stream),
        )
        .route("/health", get(health::liveness))
        .route("/health/overview", get(health::overview))
        .route("/health/detailed", get(health::detailed))
        .with_state(state)
}
