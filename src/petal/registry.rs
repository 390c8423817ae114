//! # Petal registry, discovery, and dependency graph
//!
//! The loader described in spec §4.6: petals are discovered (direct YAML
//! path first, `inventory` fallback second), instantiated once, checked
//! against their declared proxy dependencies, and walked through the two
//! load groups (`startup_petals` blocking, `enabled_petals` backgrounded one
//! at a time). [`DependencyGraph`] carries the enable/disable invariants of
//! spec §3 shared by both the petal and proxy halves of the control API
//! (§4.8), so there is exactly one place that decides whether a disable is
//! safe, mirroring [`crate::proxy::scoping`]'s "one code path, not three"
//! rationale for a different cross-cutting invariant.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::PamConfig;
use crate::proxy::ProxyRegistry;

use super::{Petal, PetalError, PetalState, PetalFactory, PETAL_NAME_PREFIX};

struct PetalEntry {
    petal: Arc<dyn Petal>,
    state: PetalState,
}

/// All petals known to the process, keyed by name, plus their current
/// lifecycle state. Reads are served from a snapshot; mutation goes through
/// `&self` methods serialized by the inner lock (spec §5 RCU discipline,
/// same shape as [`ProxyRegistry`]).
pub struct PetalRegistry {
    proxies: Arc<ProxyRegistry>,
    entries: RwLock<HashMap<String, PetalEntry>>,
    /// Names that failed `initialize()` before ever producing a live
    /// instance, with their reason. Kept separate from `entries` because
    /// `components/list` (spec §4.8) must report petals that never
    /// resolved to an `Arc<dyn Petal>` at all.
    failures: RwLock<HashMap<String, String>>,
}

impl PetalRegistry {
    pub fn new(proxies: Arc<ProxyRegistry>) -> Self {
        Self {
            proxies,
            entries: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves a petal factory for `name`. Direct path (the YAML `petals:`
    /// map) is tried first and is the fast path; the process-wide
    /// `inventory`-collected registry (spec §4.6's Rust-native substitute
    /// for entry-point discovery) is the fallback.
    fn resolve_factory(name: &str, direct_path: Option<&str>) -> Option<fn() -> Arc<dyn Petal>> {
        if let Some(path) = direct_path {
            if let Some(found) = inventory::iter::<PetalFactory>()
                .into_iter()
                .find(|f| f.name == path)
            {
                return Some(found.factory);
            }
            warn!("petal {name}: direct path {path:?} not found in factory registry, falling back to discovery");
        }
        inventory::iter::<PetalFactory>()
            .into_iter()
            .find(|f| f.name == name)
            .map(|f| f.factory)
    }

    /// Phase 1 (spec §4.6): instantiate `name`, validate its required
    /// proxies are all enabled, and record it as `Loaded` or `Failed`.
    /// Petals whose name doesn't start with `petal-` are rejected outright
    /// (spec §4.6 "naming invariant").
    pub async fn initialize(&self, name: &str, config: &PamConfig) -> Result<(), PetalError> {
        if !name.starts_with(PETAL_NAME_PREFIX) {
            let err = PetalError::InvalidName(name.to_string());
            self.record_failed(name, &err.to_string()).await;
            return Err(err);
        }

        let direct_path = config.petals.get(name).map(String::as_str);
        let Some(factory) = Self::resolve_factory(name, direct_path) else {
            let err = PetalError::Internal(format!("no factory registered for petal {name}"));
            self.record_failed(name, &err.to_string()).await;
            return Err(err);
        };

        let petal = factory();
        let unmet: Vec<&str> = futures::future::join_all(
            petal
                .required_proxies()
                .iter()
                .map(|p| async { (*p, self.proxies.is_enabled(p).await) }),
        )
        .await
        .into_iter()
        .filter(|(_, enabled)| !enabled)
        .map(|(p, _)| p)
        .collect();

        if !unmet.is_empty() {
            let err = PetalError::DependencyUnmet(format!(
                "petal {name} requires disabled proxies: {}",
                unmet.join(", ")
            ));
            self.record_failed(name, &err.to_string()).await;
            return Err(err);
        }

        self.entries.write().await.insert(
            name.to_string(),
            PetalEntry {
                petal,
                state: PetalState::Loaded,
            },
        );
        info!("petal {name} initialized");
        Ok(())
    }

    async fn record_failed(&self, name: &str, reason: &str) {
        warn!("petal {name} failed to initialize: {reason}");
        self.failures.write().await.insert(name.to_string(), reason.to_string());
    }

    /// `startup_petals`: loaded synchronously before the HTTP server accepts
    /// requests (spec §4.6). A failure here is logged, not fatal, per spec
    /// §7 ("configuration errors ... fatal only when they prevent loading
    /// any config at all").
    pub async fn load_startup_group(&self, config: &PamConfig) {
        for name in &config.startup_petals {
            if self.initialize(name, config).await.is_err() {
                continue;
            }
            self.run_startup_hooks(name).await;
        }
    }

    /// `enabled_petals`: loaded one at a time in the background after the
    /// HTTP server is listening, so boot latency is bounded by the slowest
    /// single petal rather than the sum of all of them blocking the listener
    /// (spec §4.6).
    pub async fn load_enabled_group(&self, config: &PamConfig) {
        for name in &config.enabled_petals {
            if self.initialize(name, config).await.is_err() {
                continue;
            }
            self.run_startup_hooks(name).await;
        }
    }

    async fn run_startup_hooks(&self, name: &str) {
        let petal = {
            let entries = self.entries.read().await;
            entries.get(name).map(|e| e.petal.clone())
        };
        let Some(petal) = petal else { return };

        if let Err(e) = petal.startup() {
            warn!("petal {name} startup() failed: {e}");
            self.set_state(name, PetalState::Failed { reason: e.to_string() }).await;
            return;
        }

        let async_petal = petal.clone();
        let async_name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = async_petal.async_startup().await {
                error!("petal {async_name} async_startup() failed: {e}");
            }
        });

        self.set_state(name, PetalState::Enabled).await;
    }

    async fn set_state(&self, name: &str, state: PetalState) {
        if let Some(entry) = self.entries.write().await.get_mut(name) {
            entry.state = state;
        }
    }

    /// Every successfully loaded petal, for mounting HTTP routers and
    /// building the MQTT command-action map (spec §4.6, §4.7).
    pub async fn loaded_petals(&self) -> Vec<Arc<dyn Petal>> {
        self.entries.read().await.values().map(|e| e.petal.clone()).collect()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Petal>> {
        self.entries.read().await.get(name).map(|e| e.petal.clone())
    }

    pub async fn state(&self, name: &str) -> Option<PetalState> {
        self.entries.read().await.get(name).map(|e| e.state.clone())
    }

    pub async fn names(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn is_enabled(&self, name: &str) -> bool {
        matches!(self.state(name).await, Some(PetalState::Enabled))
    }

    pub async fn failures(&self) -> HashMap<String, String> {
        self.failures.read().await.clone()
    }

    /// Disables `name` after dependency checks have already passed
    /// upstream; runs `shutdown()` and flips state (spec §4.8 `POST
    /// /petals/control`).
    pub async fn disable(&self, name: &str) -> Result<(), PetalError> {
        let petal = self.get(name).await.ok_or_else(|| {
            PetalError::Internal(format!("petal {name} is not loaded"))
        })?;
        petal.shutdown().await;
        self.set_state(name, PetalState::Disabled).await;
        Ok(())
    }

    /// Re-enables a previously disabled petal by re-running its startup
    /// hooks. Dependency validation is the caller's responsibility (it has
    /// the `DependencyGraph` and the live enabled-proxy snapshot).
    pub async fn enable(&self, name: &str) -> Result<(), PetalError> {
        if self.get(name).await.is_none() {
            return Err(PetalError::Internal(format!("petal {name} is not loaded")));
        }
        self.run_startup_hooks(name).await;
        Ok(())
    }
}

/// The petal→proxy and proxy→proxy dependency edges declared in config
/// (spec §3 "Dependency graph", §6 `petal_dependencies`/`proxy_dependencies`
/// YAML keys). Read-only once loaded; the control API consults it before
/// every enable/disable.
pub struct DependencyGraph {
    petal_dependencies: HashMap<String, Vec<String>>,
    proxy_dependencies: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn from_config(config: &PamConfig) -> Self {
        Self {
            petal_dependencies: config.petal_dependencies.clone(),
            proxy_dependencies: config.proxy_dependencies.clone(),
        }
    }

    /// Proxies `petal` declares required, per the config-supplied edges
    /// (used by the control API to build the "currently enabled petal ->
    /// its required proxies" map [`Self::blockers_for_disabling_proxy`]
    /// needs, spec §4.8).
    pub fn petal_required_proxies(&self, petal: &str) -> Vec<String> {
        self.petal_dependencies.get(petal).cloned().unwrap_or_default()
    }

    /// Proxies `proxy` itself declares required (spec §3 invariant (a)).
    pub fn proxy_required_proxies(&self, proxy: &str) -> Vec<String> {
        self.proxy_dependencies.get(proxy).cloned().unwrap_or_default()
    }

    /// Full petal -> required-proxies edge set, for `GET /status` (spec
    /// §4.8) to report the whole graph rather than just one entry at a time.
    pub fn petal_dependencies(&self) -> &HashMap<String, Vec<String>> {
        &self.petal_dependencies
    }

    /// Full proxy -> required-proxies edge set, for `GET /status`.
    pub fn proxy_dependencies(&self) -> &HashMap<String, Vec<String>> {
        &self.proxy_dependencies
    }

    /// Proxies required by `petal` that are not currently enabled (spec §3
    /// invariant (b): "enabling a petal is rejected while any of its
    /// required proxies is disabled").
    pub fn unmet_proxies_for_petal(&self, petal: &str, enabled_proxies: &HashSet<String>) -> Vec<String> {
        self.petal_dependencies
            .get(petal)
            .into_iter()
            .flatten()
            .filter(|p| !enabled_proxies.contains(p.as_str()))
            .cloned()
            .collect()
    }

    /// Everything that would break if `proxy` were disabled right now:
    /// enabled proxies that declare it required, and enabled petals that
    /// declare it required (spec §3 invariant (a), §8 scenario 4's exact
    /// response shape).
    pub fn blockers_for_disabling_proxy(
        &self,
        proxy: &str,
        enabled_petals: &HashMap<String, Vec<String>>,
        enabled_proxies: &HashSet<String>,
    ) -> (Vec<String>, Vec<String>) {
        let blocking_proxies: Vec<String> = self
            .proxy_dependencies
            .iter()
            .filter(|(name, deps)| {
                enabled_proxies.contains(name.as_str()) && deps.iter().any(|d| d == proxy)
            })
            .map(|(name, _)| name.clone())
            .collect();

        let blocking_petals: Vec<String> = enabled_petals
            .iter()
            .filter(|(_, deps)| deps.iter().any(|d| d == proxy))
            .map(|(name, _)| name.clone())
            .collect();

        (blocking_petals, blocking_proxies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn graph() -> DependencyGraph {
        let mut proxy_dependencies = Map::new();
        proxy_dependencies.insert("db".to_string(), vec!["cloud".to_string()]);
        let mut petal_dependencies = Map::new();
        petal_dependencies.insert("petal-flight-log".to_string(), vec!["cloud".to_string()]);
        DependencyGraph {
            petal_dependencies,
            proxy_dependencies,
        }
    }

    #[test]
    fn blockers_lists_both_dependent_proxies_and_petals() {
        let g = graph();
        let mut enabled_proxies = HashSet::new();
        enabled_proxies.insert("db".to_string());
        enabled_proxies.insert("cloud".to_string());
        let mut enabled_petals = Map::new();
        enabled_petals.insert("petal-flight-log".to_string(), vec!["cloud".to_string()]);

        let (petals, proxies) = g.blockers_for_disabling_proxy("cloud", &enabled_petals, &enabled_proxies);
        assert_eq!(petals, vec!["petal-flight-log".to_string()]);
        assert_eq!(proxies, vec!["db".to_string()]);
    }

    #[test]
    fn no_blockers_when_nothing_depends_on_it() {
        let g = graph();
        let enabled_proxies = HashSet::new();
        let enabled_petals = Map::new();
        let (petals, proxies) = g.blockers_for_disabling_proxy("redis", &enabled_petals, &enabled_proxies);
        assert!(petals.is_empty());
        assert!(proxies.is_empty());
    }

    #[test]
    fn unmet_proxies_lists_disabled_requirements() {
        let g = graph();
        let enabled = HashSet::new();
        let unmet = g.unmet_proxies_for_petal("petal-flight-log", &enabled);
        assert_eq!(unmet, vec!["cloud".to_string()]);
    }

    #[test]
    fn unmet_proxies_empty_when_all_enabled() {
        let g = graph();
        let mut enabled = HashSet::new();
        enabled.insert("cloud".to_string());
        let unmet = g.unmet_proxies_for_petal("petal-flight-log", &enabled);
        assert!(unmet.is_empty());
    }
}
