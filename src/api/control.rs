//! Petal/proxy control endpoints under `/api/petal-proxies-control` (spec
//! §4.8): status, component listing, enable/disable for both petals and
//! proxies (sharing one dependency-checked code path each), and the
//! persisted-vs-running restart status.

use std::collections::{HashMap, HashSet};

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::config::PersistedConfig;

use super::AppState;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlAction {
    On,
    Off,
}

/// Request body shared by `petals/control` and `proxies/control`. The
/// target-name field is literally called `petals` in both endpoints per
/// spec §8 scenario 4's example body (`POST proxies/control
/// {petals:["cloud"], action:"OFF"}`) -- preserved here rather than
/// "fixed" to a more consistent name, since external callers depend on it.
#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub petals: Vec<String>,
    pub action: ControlAction,
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub success: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub enabled_proxies: Vec<String>,
    pub enabled_petals: Vec<String>,
    pub petal_dependencies: HashMap<String, Vec<String>>,
    pub proxy_dependencies: HashMap<String, Vec<String>>,
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let enabled_proxies = enabled_proxy_names(&state).await;
    let enabled_petals = state.petals.names().await;
    let mut enabled_petals_filtered = Vec::new();
    for name in enabled_petals {
        if state.petals.is_enabled(&name).await {
            enabled_petals_filtered.push(name);
        }
    }

    Json(StatusResponse {
        enabled_proxies,
        enabled_petals: enabled_petals_filtered,
        petal_dependencies: state.dependency_graph.petal_dependencies().clone(),
        proxy_dependencies: state.dependency_graph.proxy_dependencies().clone(),
    })
}

#[derive(Debug, Serialize)]
pub struct ComponentInfo {
    pub name: String,
    pub kind: &'static str,
    pub enabled: bool,
    pub required_proxies: Vec<String>,
    pub reverse_dependents: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ComponentsListResponse {
    pub components: Vec<ComponentInfo>,
}

/// Every discovered petal and proxy with its enabled flag, dependencies,
/// and reverse dependencies (spec §4.8 `GET /components/list`).
pub async fn components_list(State(state): State<AppState>) -> Json<ComponentsListResponse> {
    let mut components = Vec::new();

    for proxy_name in state.proxies.names() {
        let enabled = state.proxies.is_enabled(proxy_name).await;
        let required = state.dependency_graph.proxy_required_proxies(proxy_name);
        let dependents = reverse_proxy_dependents(&state, proxy_name).await;
        components.push(ComponentInfo {
            name: proxy_name.to_string(),
            kind: "proxy",
            enabled,
            required_proxies: required,
            reverse_dependents: dependents,
        });
    }

    for petal_name in state.petals.names().await {
        let enabled = state.petals.is_enabled(&petal_name).await;
        let required = state.dependency_graph.petal_required_proxies(&petal_name);
        components.push(ComponentInfo {
            name: petal_name,
            kind: "petal",
            enabled,
            required_proxies: required,
            reverse_dependents: Vec::new(),
        });
    }

    Json(ComponentsListResponse { components })
}

async fn reverse_proxy_dependents(state: &AppState, proxy: &str) -> Vec<String> {
    let enabled_proxies = enabled_proxy_set(state).await;
    let mut dependents = Vec::new();
    for other in state.proxies.names() {
        if other == proxy || !enabled_proxies.contains(other) {
            continue;
        }
        if state
            .dependency_graph
            .proxy_required_proxies(other)
            .iter()
            .any(|d| d == proxy)
        {
            dependents.push(other.to_string());
        }
    }
    dependents
}

async fn enabled_proxy_names(state: &AppState) -> Vec<String> {
    let mut out = Vec::new();
    for name in state.proxies.names() {
        if state.proxies.is_enabled(name).await {
            out.push(name.to_string());
        }
    }
    out
}

async fn enabled_proxy_set(state: &AppState) -> HashSet<String> {
    enabled_proxy_names(state).await.into_iter().collect()
}

/// `POST /petals/control` (spec §4.8): validates each target's required
/// proxies are all enabled before enabling it; disabling never fails
/// (petals have no dependents in the graph -- only proxies do).
pub async fn petals_control(
    State(state): State<AppState>,
    Json(req): Json<ControlRequest>,
) -> Json<ControlResponse> {
    let enabled_proxies = enabled_proxy_set(&state).await;
    let mut errors = Vec::new();

    for name in &req.petals {
        match req.action {
            ControlAction::On => {
                let unmet = state
                    .dependency_graph
                    .unmet_proxies_for_petal(name, &enabled_proxies);
                if !unmet.is_empty() {
                    errors.push(format!(
                        "Cannot enable {name}: requires disabled proxies {unmet:?}"
                    ));
                    continue;
                }
                if let Err(e) = state.petals.enable(name).await {
                    errors.push(format!("Cannot enable {name}: {e}"));
                }
            }
            ControlAction::Off => {
                if let Err(e) = state.petals.disable(name).await {
                    errors.push(format!("Cannot disable {name}: {e}"));
                }
            }
        }
    }

    if errors.is_empty() {
        persist_current_state(&state).await;
    }

    Json(ControlResponse {
        success: errors.is_empty(),
        errors,
    })
}

/// `POST /proxies/control` (spec §4.8): rejects disabling a proxy that
/// still has enabled dependents, either other proxies or petals (spec §3
/// invariant (a), §8 scenario 4).
pub async fn proxies_control(
    State(state): State<AppState>,
    Json(req): Json<ControlRequest>,
) -> Json<ControlResponse> {
    let mut errors = Vec::new();

    for name in &req.petals {
        match req.action {
            ControlAction::Off => {
                let enabled_proxies = enabled_proxy_set(&state).await;
                let enabled_petal_deps = enabled_petal_dependencies(&state).await;
                let (blocking_petals, blocking_proxies) = state
                    .dependency_graph
                    .blockers_for_disabling_proxy(name, &enabled_petal_deps, &enabled_proxies);
                if !blocking_petals.is_empty() || !blocking_proxies.is_empty() {
                    errors.push(format!(
                        "Cannot disable {name}: required by proxies {blocking_proxies:?}; required by petals {blocking_petals:?}"
                    ));
                    continue;
                }
                let (Some(proxy), Some(static_name)) =
                    (state.proxies.get(name), static_proxy_name(&state, name))
                else {
                    errors.push(format!("unknown proxy {name}"));
                    continue;
                };
                if let Err(e) = proxy.stop().await {
                    errors.push(format!("Cannot disable {name}: {e}"));
                    continue;
                }
                state.proxies.set_enabled(static_name, false).await;
            }
            ControlAction::On => {
                let (Some(proxy), Some(static_name)) =
                    (state.proxies.get(name), static_proxy_name(&state, name))
                else {
                    errors.push(format!("unknown proxy {name}"));
                    continue;
                };
                if let Err(e) = proxy.start().await {
                    errors.push(format!("Cannot enable {name}: {e}"));
                    continue;
                }
                state.proxies.set_enabled(static_name, true).await;
            }
        }
    }

    if errors.is_empty() {
        persist_current_state(&state).await;
    }

    Json(ControlResponse {
        success: errors.is_empty(),
        errors,
    })
}

/// [`crate::proxy::ProxyRegistry`] keys its enabled map by `&'static str`
/// (one per proxy, fixed at registration time); recovers that static
/// instance for a caller-supplied `&str` so `set_enabled` has a key to
/// write through, instead of leaking a fresh allocation per request.
fn static_proxy_name(state: &AppState, name: &str) -> Option<&'static str> {
    state.proxies.names().into_iter().find(|n| *n == name)
}

async fn enabled_petal_dependencies(state: &AppState) -> HashMap<String, Vec<String>> {
    let mut out = HashMap::new();
    for name in state.petals.names().await {
        if state.petals.is_enabled(&name).await {
            let deps = state.dependency_graph.petal_required_proxies(&name);
            out.insert(name, deps);
        }
    }
    out
}

/// Rewrites only the enabled-petal/enabled-proxy fields, preserving
/// whatever dependency edges and direct petal paths are already on disk --
/// a control-API request never touches those.
async fn persist_current_state(state: &AppState) {
    let mut persisted = read_persisted(state).await;
    persisted.enabled_petals = {
        let mut out = Vec::new();
        for name in state.petals.names().await {
            if state.petals.is_enabled(&name).await {
                out.push(name);
            }
        }
        out
    };
    persisted.enabled_proxies = enabled_proxy_names(state).await;

    if let Err(e) = crate::config::persist_config(&state.config_path, &persisted).await {
        tracing::warn!("failed to persist control-API state change: {e}");
    }
}

#[derive(Debug, Serialize)]
pub struct RestartStatusResponse {
    pub matches_persisted: bool,
    pub running_enabled_proxies: Vec<String>,
    pub persisted_enabled_proxies: Vec<String>,
}

/// `GET /restart-status` (spec §4.8): whether the persisted config
/// diverges from the running state.
pub async fn restart_status(State(state): State<AppState>) -> Json<RestartStatusResponse> {
    let running = enabled_proxy_names(&state).await;
    let persisted = read_persisted(&state).await.enabled_proxies;

    let running_set: HashSet<_> = running.iter().cloned().collect();
    let persisted_set: HashSet<_> = persisted.iter().cloned().collect();

    Json(RestartStatusResponse {
        matches_persisted: running_set == persisted_set,
        running_enabled_proxies: running,
        persisted_enabled_proxies: persisted,
    })
}

#[derive(Debug, Serialize)]
pub struct RestartResponse {
    pub accepted: bool,
}

/// `POST /restart` (spec §4.8). PAM has no in-process supervisor to
/// re-exec itself; this persists the current running state (so the next
/// boot matches what's live now) and exits cleanly, relying on the
/// process supervisor (systemd, `restart: always` in compose) to bring a
/// fresh process back up -- see DESIGN.md for why a persist-then-exit was
/// chosen over an in-process reload.
pub async fn restart(State(state): State<AppState>) -> Json<RestartResponse> {
    persist_current_state(&state).await;
    tokio::spawn(async {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        std::process::exit(0);
    });
    Json(RestartResponse { accepted: true })
}

async fn read_persisted(state: &AppState) -> PersistedConfig {
    match tokio::fs::read_to_string(&state.config_path).await {
        Ok(contents) => serde_yaml::from_str(&contents).unwrap_or_default(),
        Err(_) => PersistedConfig::default(),
    }
}
