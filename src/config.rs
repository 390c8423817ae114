//! Configuration loading: environment variables (prefix `PETAL_`) layered
//! over a YAML file, producing a single immutable [`PamConfig`] for the
//! process lifetime.
//!
//! Mirrors the teacher's `config.rs` fallback-to-defaults philosophy: only
//! the MAVLink endpoint and the machine id are load-bearing enough to be
//! fatal if missing. Everything else degrades to a documented default.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::eyre::{eyre, Context, Result};
use fs4::tokio::AsyncFileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const ENV_PREFIX: &str = "PETAL_";
const DEFAULT_CONFIG_PATH: &str = "/etc/petal-app-manager/config.yaml";

/// Endpoint for the MAVLink link: either a UDP socket or a serial device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MavlinkEndpoint {
    Udp { host: String, port: u16 },
    Serial { path: String, baud: u32 },
}

impl MavlinkEndpoint {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.splitn(2, ':');
        let scheme = parts
            .next()
            .ok_or_else(|| eyre!("empty MAVLINK_ENDPOINT"))?;
        let rest = parts
            .next()
            .ok_or_else(|| eyre!("MAVLINK_ENDPOINT missing body: {raw}"))?;
        match scheme {
            "udp" => {
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| eyre!("udp endpoint must be udp:host:port, got {raw}"))?;
                Ok(MavlinkEndpoint::Udp {
                    host: host.to_string(),
                    port: port
                        .parse()
                        .with_context(|| format!("invalid udp port in {raw}"))?,
                })
            }
            "serial" => {
                let (path, baud) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| eyre!("serial endpoint must be serial:/path:baud, got {raw}"))?;
                Ok(MavlinkEndpoint::Serial {
                    path: path.to_string(),
                    baud: baud
                        .parse()
                        .with_context(|| format!("invalid baud rate in {raw}"))?,
                })
            }
            other => Err(eyre!("unknown MAVLINK_ENDPOINT scheme: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MavlinkConfig {
    pub endpoint: MavlinkEndpoint,
    pub source_system_id: u8,
    pub source_component_id: u8,
    pub worker_threads: usize,
    pub heartbeat_send_frequency_hz: f32,
    pub buffer_capacity: usize,
    pub startup_timeout: Duration,
    pub retry_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub unix_socket_path: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    pub worker_threads: usize,
    pub startup_timeout: Duration,
    pub retry_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct MqttConfig {
    pub bridge_host: String,
    pub bridge_port: u16,
    pub callback_host: String,
    pub callback_port: u16,
    pub startup_timeout: Duration,
    pub retry_interval: Duration,
    pub org_id_poll_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct CloudConfig {
    pub cloud_endpoint: String,
    pub access_token_url: String,
    pub session_token_url: String,
    pub s3_bucket_name: String,
    pub startup_timeout: Duration,
    pub retry_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct LocalDbConfig {
    pub endpoint: String,
    pub startup_timeout: Duration,
    pub retry_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
    pub log_dir: PathBuf,
    pub ring_capacity: usize,
    /// Per-level output routing, loaded from the `log-output.json` file
    /// described in spec §6. Keys are `DEBUG|INFO|WARNING|ERROR|CRITICAL`.
    pub output_routing: HashMap<String, Vec<String>>,
}

/// The complete, immutable, process-wide configuration record.
///
/// Built once in [`PamConfig::load`] and shared behind an `Arc` with every
/// proxy and petal, the same way the teacher threads `Arc<ConfigPortal>`
/// through `MQTTConnection`.
#[derive(Clone, Debug)]
pub struct PamConfig {
    pub machine_id: String,
    pub mavlink: MavlinkConfig,
    pub redis: RedisConfig,
    pub mqtt: MqttConfig,
    pub cloud: CloudConfig,
    pub local_db: LocalDbConfig,
    pub logging: LoggingConfig,

    /// Petals loaded synchronously before the HTTP server accepts requests.
    pub startup_petals: Vec<String>,
    /// Petals loaded in the background after the HTTP server is listening.
    pub enabled_petals: Vec<String>,
    /// Proxies enabled at boot.
    pub enabled_proxies: Vec<String>,
    /// petal -> required proxy names
    pub petal_dependencies: HashMap<String, Vec<String>>,
    /// proxy -> required proxy names
    pub proxy_dependencies: HashMap<String, Vec<String>>,
    /// petal-name -> direct import path (module.submodule:ClassName-style key,
    /// resolved here to an `inventory`-registered factory name instead).
    pub petals: HashMap<String, String>,

    /// Path the mutable parts of this config were loaded from / are persisted to.
    pub config_path: PathBuf,
}

/// On-disk representation of the mutable subset of [`PamConfig`], i.e. the
/// parts a control-API request can rewrite (spec §4.8, §6).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersistedConfig {
    #[serde(default)]
    pub startup_petals: Vec<String>,
    #[serde(default)]
    pub enabled_petals: Vec<String>,
    #[serde(default)]
    pub enabled_proxies: Vec<String>,
    #[serde(default)]
    pub petal_dependencies: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub proxy_dependencies: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub petals: HashMap<String, String>,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}")).ok()
}

fn env_var_or(key: &str, default: &str) -> String {
    env_var(key).unwrap_or_else(|| default.to_string())
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(
        env_var(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_secs),
    )
}

impl PamConfig {
    /// Loads configuration from `PETAL_*` environment variables layered
    /// over the YAML file at `config_path` (or [`DEFAULT_CONFIG_PATH`]).
    ///
    /// Only a missing/unparseable `PETAL_MAVLINK_ENDPOINT` or
    /// `PETAL_MACHINE_ID` is fatal -- every other field falls back to a
    /// default, per spec §7 ("configuration errors at startup are fatal
    /// only when they prevent loading any config at all").
    pub async fn load() -> Result<Self> {
        let config_path = env_var("CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let persisted = match load_persisted(&config_path).await {
            Ok(p) => p,
            Err(e) => {
                warn!(
                    "could not read persisted config at {}: {e}; starting with empty petal/proxy sets",
                    config_path.display()
                );
                PersistedConfig::default()
            }
        };

        let machine_id = env_var("MACHINE_ID")
            .ok_or_else(|| eyre!("PETAL_MACHINE_ID is required and was not set"))?;

        let mavlink_endpoint_raw = env_var("MAVLINK_ENDPOINT")
            .ok_or_else(|| eyre!("PETAL_MAVLINK_ENDPOINT is required and was not set"))?;
        let endpoint = MavlinkEndpoint::parse(&mavlink_endpoint_raw)?;

        let mavlink = MavlinkConfig {
            endpoint,
            source_system_id: env_var("SOURCE_SYSTEM_ID")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            source_component_id: env_var("SOURCE_COMPONENT_ID")
                .and_then(|v| v.parse().ok())
                .unwrap_or(191),
            worker_threads: env_var("MAVLINK_WORKER_THREADS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            heartbeat_send_frequency_hz: env_var("MAVLINK_HEARTBEAT_SEND_FREQUENCY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1.0),
            buffer_capacity: env_var("MAVLINK_BUFFER_CAPACITY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000),
            startup_timeout: env_duration_secs("MAVLINK_STARTUP_TIMEOUT", 10),
            retry_interval: env_duration_secs("MAVLINK_RETRY_INTERVAL", 5),
        };

        let redis = RedisConfig {
            unix_socket_path: env_var("REDIS_UNIX_SOCKET_PATH").map(PathBuf::from),
            host: env_var_or("REDIS_HOST", "127.0.0.1"),
            port: env_var("REDIS_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(6379),
            worker_threads: env_var("REDIS_WORKER_THREADS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            startup_timeout: env_duration_secs("REDIS_STARTUP_TIMEOUT", 5),
            retry_interval: env_duration_secs("REDIS_RETRY_INTERVAL", 5),
        };

        let mqtt = MqttConfig {
            bridge_host: env_var_or("TS_CLIENT_HOST", "127.0.0.1"),
            bridge_port: env_var("TS_CLIENT_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8088),
            callback_host: env_var_or("CALLBACK_HOST", "127.0.0.1"),
            callback_port: env_var("CALLBACK_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8089),
            startup_timeout: env_duration_secs("MQTT_STARTUP_TIMEOUT", 10),
            retry_interval: env_duration_secs("MQTT_RETRY_INTERVAL", 5),
            org_id_poll_interval: env_duration_secs("MQTT_ORG_ID_POLL_INTERVAL", 3),
        };

        let cloud = CloudConfig {
            cloud_endpoint: env_var_or("CLOUD_ENDPOINT", "https://api.example.invalid"),
            access_token_url: env_var_or(
                "ACCESS_TOKEN_URL",
                "https://api.example.invalid/oauth/token",
            ),
            session_token_url: env_var_or(
                "SESSION_TOKEN_URL",
                "https://api.example.invalid/session",
            ),
            s3_bucket_name: env_var_or("S3_BUCKET_NAME", "petal-app-manager"),
            startup_timeout: env_duration_secs("CLOUD_STARTUP_TIMEOUT", 10),
            retry_interval: env_duration_secs("CLOUD_RETRY_INTERVAL", 10),
        };

        let local_db = LocalDbConfig {
            endpoint: env_var_or("LOCAL_DB_ENDPOINT", "http://127.0.0.1:8090"),
            startup_timeout: env_duration_secs("LOCAL_DB_STARTUP_TIMEOUT", 5),
            retry_interval: env_duration_secs("LOCAL_DB_RETRY_INTERVAL", 5),
        };

        let logging = LoggingConfig {
            level: env_var_or("LOG_LEVEL", "info"),
            log_to_file: env_var("LOG_TO_FILE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            log_dir: env_var("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/log/petal-app-manager")),
            ring_capacity: env_var("LOG_RING_CAPACITY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            output_routing: load_log_output_routing(&config_path).unwrap_or_default(),
        };

        Ok(Self {
            machine_id,
            mavlink,
            redis,
            mqtt,
            cloud,
            local_db,
            logging,
            startup_petals: persisted.startup_petals,
            enabled_petals: persisted.enabled_petals,
            enabled_proxies: persisted.enabled_proxies,
            petal_dependencies: persisted.petal_dependencies,
            proxy_dependencies: persisted.proxy_dependencies,
            petals: persisted.petals,
            config_path,
        })
    }

    pub fn to_persisted(&self) -> PersistedConfig {
        PersistedConfig {
            startup_petals: self.startup_petals.clone(),
            enabled_petals: self.enabled_petals.clone(),
            enabled_proxies: self.enabled_proxies.clone(),
            petal_dependencies: self.petal_dependencies.clone(),
            proxy_dependencies: self.proxy_dependencies.clone(),
            petals: self.petals.clone(),
        }
    }

    /// Persists the mutable subset of this config back to [`Self::config_path`]
    /// under an exclusive file lock, so concurrent control-API requests are
    /// serialized the way spec §5 requires.
    pub async fn persist(&self) -> Result<()> {
        persist_config(&self.config_path, &self.to_persisted()).await
    }
}

async fn load_persisted(path: &Path) -> Result<PersistedConfig> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config file {}", path.display()))?;
    let parsed: PersistedConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing YAML config {}", path.display()))?;
    Ok(parsed)
}

/// Writes `persisted` to `path` under an exclusive advisory lock so two
/// concurrent control-API requests never interleave writes (spec §5: "The
/// config YAML is persisted under an exclusive file lock").
pub async fn persist_config(path: &Path, persisted: &PersistedConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await
        .with_context(|| format!("opening {} for write", path.display()))?;
    file.lock_exclusive()
        .await
        .with_context(|| format!("locking {}", path.display()))?;
    let yaml = serde_yaml::to_string(persisted).context("serializing config to YAML")?;
    tokio::fs::write(path, yaml)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    debug!("persisted config to {}", path.display());
    Ok(())
}

fn load_log_output_routing(config_path: &Path) -> Option<HashMap<String, Vec<String>>> {
    let log_output_path = config_path.with_file_name("log-output.json");
    let contents = std::fs::read_to_string(log_output_path).ok()?;
    serde_json::from_str(&contents).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_udp_endpoint() {
        let ep = MavlinkEndpoint::parse("udp:127.0.0.1:14550").unwrap();
        assert_eq!(
            ep,
            MavlinkEndpoint::Udp {
                host: "127.0.0.1".to_string(),
                port: 14550
            }
        );
    }

    #[test]
    fn parses_serial_endpoint() {
        let ep = MavlinkEndpoint::parse("serial:/dev/ttyACM0:115200").unwrap();
        assert_eq!(
            ep,
            MavlinkEndpoint::Serial {
                path: "/dev/ttyACM0".to_string(),
                baud: 115200
            }
        );
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(MavlinkEndpoint::parse("tcp:127.0.0.1:1").is_err());
    }

    #[tokio::test]
    async fn persist_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut persisted = PersistedConfig::default();
        persisted.enabled_proxies.push("redis".to_string());
        persist_config(&path, &persisted).await.unwrap();

        let loaded = load_persisted(&path).await.unwrap();
        assert_eq!(loaded.enabled_proxies, vec!["redis".to_string()]);
    }
}
