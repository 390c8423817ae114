//! PAM binary entry point: loads configuration, starts logging, builds the
//! proxy and petal registries, brings up the control/health HTTP surface,
//! and runs until a shutdown signal arrives.

use std::sync::Arc;

use color_eyre::eyre::Result;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use pam::api::{self, AppState};
use pam::config::PamConfig;
use pam::logging;
use pam::petal::actions;
use pam::petal::registry::{DependencyGraph, PetalRegistry};
use pam::proxy::cloud_db::CloudDbProxy;
use pam::proxy::local_db::LocalDbProxy;
use pam::proxy::mavlink::MavlinkProxy;
use pam::proxy::mqtt::MqttProxy;
use pam::proxy::object_store::ObjectStoreProxy;
use pam::proxy::redis::RedisProxy;
use pam::proxy::{Proxy, ProxyRegistry};

const CONTROL_PORT: u16 = 8080;
/// Channel the periodic health publisher posts to (spec §2 "Data flow": "A
/// periodic health task samples every proxy's status and publishes it on a
/// well-known Redis channel").
const HEALTH_CHANNEL: &str = "pam/health";
const HEALTH_PUBLISH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let config = PamConfig::load().await?;
    let ring = logging::init(&config.logging)?;

    info!("petal-app-manager starting, machine_id={}", config.machine_id);

    let local_db = LocalDbProxy::new(config.local_db.clone(), config.machine_id.clone());
    let resolver = {
        let local_db = local_db.clone();
        Arc::new(move || {
            let local_db = local_db.clone();
            Box::pin(async move { local_db.org_device_ids().await })
                as futures::future::BoxFuture<'static, Option<(String, String)>>
        })
    };

    let mavlink = MavlinkProxy::new(config.mavlink.clone());
    let redis = RedisProxy::new(config.redis.clone());
    let mqtt = MqttProxy::new(config.mqtt.clone(), resolver);
    let cloud_db = CloudDbProxy::new(config.cloud.clone(), config.machine_id.clone());
    let object_store = ObjectStoreProxy::new(config.cloud.clone(), config.machine_id.clone());

    let proxies: Vec<Arc<dyn Proxy>> = vec![
        mavlink.clone(),
        redis.clone(),
        mqtt.clone(),
        cloud_db.clone(),
        local_db.clone(),
        object_store.clone(),
    ];
    let proxy_registry = Arc::new(ProxyRegistry::new(proxies, &config.enabled_proxies));

    for name in proxy_registry.names() {
        if !proxy_registry.is_enabled(name).await {
            continue;
        }
        let Some(proxy) = proxy_registry.get(name) else {
            continue;
        };
        if let Err(e) = proxy.start().await {
            warn!("proxy {name} failed to start: {e}; continuing degraded per spec §4.1");
        }
    }

    let petal_registry = Arc::new(PetalRegistry::new(proxy_registry.clone()));
    let dependency_graph = Arc::new(DependencyGraph::from_config(&config));

    // startup_petals load synchronously, blocking the listener, so boot
    // never serves requests before its mandatory petals are up.
    petal_registry.load_startup_group(&config).await;

    let loaded = petal_registry.loaded_petals().await;
    let _cpu_heavy_executor = actions::install(&mqtt, &loaded).await;

    let app_state = AppState {
        config_path: config.config_path.clone(),
        machine_id: config.machine_id.clone(),
        proxies: proxy_registry.clone(),
        petals: petal_registry.clone(),
        dependency_graph: dependency_graph.clone(),
        log_ring: ring.clone(),
    };

    let mut router = api::router(app_state);
    for petal in &loaded {
        router = router.nest(&format!("/petals/{}", petal.name()), petal.http_router());
    }
    let router = router.layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{CONTROL_PORT}");
    let listener = TcpListener::bind(&addr).await?;
    info!("control/health API listening on {addr}");

    let server_petals = petal_registry.clone();
    let server = tokio::task::Builder::new()
        .name("ControlApiServer")
        .spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!("control API server exited: {e}");
            }
            let _ = &server_petals;
        })?;

    // enabled_petals load one at a time in the background, after the
    // listener is already accepting requests (spec §4.6).
    let background_registry = petal_registry.clone();
    let background_config = config.clone();
    let _ = tokio::task::Builder::new()
        .name("EnabledPetalLoader")
        .spawn(async move {
            background_registry.load_enabled_group(&background_config).await;
        });

    spawn_health_publisher(redis.clone(), proxy_registry.clone());

    shutdown_signal().await;
    info!("shutdown signal received, stopping proxies");

    for name in proxy_registry.names() {
        if let Some(proxy) = proxy_registry.get(name) {
            if let Err(e) = proxy.stop().await {
                warn!("proxy {name} failed to stop cleanly: {e}");
            }
        }
    }
    for petal in petal_registry.loaded_petals().await {
        petal.shutdown().await;
    }

    server.abort();
    Ok(())
}

/// Samples every proxy's health and republishes it on [`HEALTH_CHANNEL`]
/// every [`HEALTH_PUBLISH_INTERVAL`] (spec §2). Runs for the process
/// lifetime; publish failures are logged, never fatal -- a Redis outage is
/// exactly the condition this channel exists to report on.
fn spawn_health_publisher(redis: Arc<RedisProxy>, proxies: Arc<ProxyRegistry>) {
    let _ = tokio::task::Builder::new()
        .name("HealthPublisher")
        .spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_PUBLISH_INTERVAL);
            loop {
                interval.tick().await;
                let snapshot = proxies.health_snapshot().await;
                let payload = match serde_json::to_string(&snapshot) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("failed to serialize health snapshot: {e}");
                        continue;
                    }
                };
                if let Err(e) = redis.publish(HEALTH_CHANNEL, &payload).await {
                    warn!("failed to publish health snapshot to redis: {e}");
                }
            }
        });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl+c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
