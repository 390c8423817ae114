//! End-to-end exercise of the control API's dependency checks (spec §8
//! scenario 4: "Proxy disable rejected") and the companion allow-path,
//! driving the real `api::control` handlers and a real `PetalRegistry`
//! against fake proxies and a fake petal -- no network, no live MAVLink
//! link, no axum server.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::Json;

use pam::api::control::{self, ControlAction, ControlRequest};
use pam::api::AppState;
use pam::config::{
    CloudConfig, LocalDbConfig, LoggingConfig, MavlinkConfig, MavlinkEndpoint, MqttConfig,
    PamConfig, RedisConfig,
};
use pam::logging::ring::RingLayer;
use pam::petal::registry::{DependencyGraph, PetalRegistry};
use pam::petal::{Petal, PetalFactory};
use pam::proxy::{HealthState, Proxy, ProxyError, ProxyHealth, ProxyRegistry};

struct FakeProxy {
    name: &'static str,
}

#[async_trait]
impl Proxy for FakeProxy {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn start(&self) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn health(&self) -> ProxyHealth {
        ProxyHealth {
            state: HealthState::Healthy,
            last_error: None,
            details: pam::proxy::ProxyHealthDetails::None,
        }
    }
}

struct FlightLogPetal;

#[async_trait]
impl Petal for FlightLogPetal {
    fn name(&self) -> &'static str {
        "petal-flight-log"
    }

    fn version(&self) -> &'static str {
        "0.0.0-test"
    }

    fn required_proxies(&self) -> &'static [&'static str] {
        &["cloud"]
    }
}

inventory::submit! {
    PetalFactory {
        name: "petal-flight-log",
        factory: || Arc::new(FlightLogPetal) as Arc<dyn Petal>,
    }
}

fn test_config() -> PamConfig {
    let mut proxy_dependencies = HashMap::new();
    proxy_dependencies.insert("db".to_string(), vec!["cloud".to_string()]);

    let mut petal_dependencies = HashMap::new();
    petal_dependencies.insert("petal-flight-log".to_string(), vec!["cloud".to_string()]);

    PamConfig {
        machine_id: "M1".to_string(),
        mavlink: MavlinkConfig {
            endpoint: MavlinkEndpoint::Udp {
                host: "127.0.0.1".to_string(),
                port: 14550,
            },
            source_system_id: 1,
            source_component_id: 1,
            worker_threads: 1,
            heartbeat_send_frequency_hz: 1.0,
            buffer_capacity: 16,
            startup_timeout: std::time::Duration::from_secs(1),
            retry_interval: std::time::Duration::from_secs(1),
        },
        redis: RedisConfig {
            unix_socket_path: None,
            host: "127.0.0.1".to_string(),
            port: 6379,
            worker_threads: 1,
            startup_timeout: std::time::Duration::from_secs(1),
            retry_interval: std::time::Duration::from_secs(1),
        },
        mqtt: MqttConfig {
            bridge_host: "127.0.0.1".to_string(),
            bridge_port: 9001,
            callback_host: "127.0.0.1".to_string(),
            callback_port: 9002,
            startup_timeout: std::time::Duration::from_secs(1),
            retry_interval: std::time::Duration::from_secs(1),
            org_id_poll_interval: std::time::Duration::from_secs(1),
        },
        cloud: CloudConfig {
            cloud_endpoint: "https://example.invalid".to_string(),
            access_token_url: "https://example.invalid/token".to_string(),
            session_token_url: "https://example.invalid/session".to_string(),
            s3_bucket_name: "test-bucket".to_string(),
            startup_timeout: std::time::Duration::from_secs(1),
            retry_interval: std::time::Duration::from_secs(1),
        },
        local_db: LocalDbConfig {
            endpoint: "https://example.invalid/localdb".to_string(),
            startup_timeout: std::time::Duration::from_secs(1),
            retry_interval: std::time::Duration::from_secs(1),
        },
        logging: LoggingConfig {
            level: "info".to_string(),
            log_to_file: false,
            log_dir: PathBuf::from("/tmp"),
            ring_capacity: 1000,
            output_routing: HashMap::new(),
        },
        startup_petals: vec!["petal-flight-log".to_string()],
        enabled_petals: vec![],
        enabled_proxies: vec!["cloud".to_string(), "db".to_string()],
        petal_dependencies,
        proxy_dependencies,
        petals: HashMap::new(),
        config_path: PathBuf::from("/tmp/pam-test-config-nonexistent.yaml"),
    }
}

async fn build_state(config: &PamConfig) -> AppState {
    let proxies: Vec<Arc<dyn Proxy>> = vec![
        Arc::new(FakeProxy { name: "cloud" }),
        Arc::new(FakeProxy { name: "db" }),
    ];
    let proxy_registry = Arc::new(ProxyRegistry::new(proxies, &config.enabled_proxies));
    for name in proxy_registry.names() {
        if proxy_registry.is_enabled(name).await {
            proxy_registry.get(name).unwrap().start().await.unwrap();
        }
    }

    let petal_registry = Arc::new(PetalRegistry::new(proxy_registry.clone()));
    petal_registry.load_startup_group(config).await;
    assert!(petal_registry.failures().await.is_empty(), "petal-flight-log should have loaded");

    let dependency_graph = Arc::new(DependencyGraph::from_config(config));
    let (_layer, log_ring) = RingLayer::new(1000);

    AppState {
        config_path: config.config_path.clone(),
        machine_id: config.machine_id.clone(),
        proxies: proxy_registry,
        petals: petal_registry,
        dependency_graph,
        log_ring,
    }
}

#[tokio::test]
async fn disabling_cloud_is_rejected_while_db_and_petal_depend_on_it() {
    let config = test_config();
    let state = build_state(&config).await;

    let response = control::proxies_control(
        State(state.clone()),
        Json(ControlRequest {
            petals: vec!["cloud".to_string()],
            action: ControlAction::Off,
        }),
    )
    .await;

    assert!(!response.success);
    assert_eq!(response.errors.len(), 1);
    assert!(response.errors[0].contains("required by proxies"));
    assert!(response.errors[0].contains("db"));
    assert!(response.errors[0].contains("required by petals"));
    assert!(response.errors[0].contains("petal-flight-log"));

    // State is unchanged: cloud is still enabled.
    assert!(state.proxies.is_enabled("cloud").await);
}

#[tokio::test]
async fn disabling_db_succeeds_once_nothing_depends_on_it() {
    let config = test_config();
    let state = build_state(&config).await;

    let response = control::proxies_control(
        State(state.clone()),
        Json(ControlRequest {
            petals: vec!["db".to_string()],
            action: ControlAction::Off,
        }),
    )
    .await;

    assert!(response.success, "errors: {:?}", response.errors);
    assert!(!state.proxies.is_enabled("db").await);
}
