//! Health surface (spec §4.8): a plain liveness probe, a version overview,
//! a full per-proxy/per-petal detail report, and the SSE log tail.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::petal::PetalState;
use crate::proxy::ProxyHealth;

use super::{AppState, PAM_VERSION};

/// `GET /health`: a bare liveness probe. Never inspects a proxy -- a proxy
/// being unhealthy is a degraded-service condition, not a process-down one
/// (spec §4.1: health never blocks on the remote, and a dead remote must
/// never fail the process).
pub async fn liveness() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
pub struct PetalVersionInfo {
    pub name: String,
    pub version: Option<String>,
    pub state: Option<PetalState>,
}

#[derive(Debug, Serialize)]
pub struct OverviewResponse {
    pub pam_version: &'static str,
    pub machine_id: String,
    pub petals: Vec<PetalVersionInfo>,
}

/// `GET /health/overview` (spec §4.8): PAM's own version plus every known
/// petal's version, or `None` where a petal failed to load ("not
/// installed" in spec terms).
pub async fn overview(State(state): State<AppState>) -> Json<OverviewResponse> {
    let mut petals = Vec::new();

    for name in state.petals.names().await {
        let version = state
            .petals
            .get(&name)
            .await
            .map(|p| p.version().to_string());
        let petal_state = state.petals.state(&name).await;
        petals.push(PetalVersionInfo {
            name,
            version,
            state: petal_state,
        });
    }

    for (name, _reason) in state.petals.failures().await {
        petals.push(PetalVersionInfo {
            name,
            version: None,
            state: None,
        });
    }

    Json(OverviewResponse {
        pam_version: PAM_VERSION,
        machine_id: state.machine_id.clone(),
        petals,
    })
}

#[derive(Debug, Serialize)]
pub struct DetailedHealthResponse {
    pub proxies: HashMap<String, ProxyHealth>,
    pub petals: HashMap<String, PetalDetail>,
}

#[derive(Debug, Serialize)]
pub struct PetalDetail {
    pub state: PetalState,
    pub required_proxies: Vec<String>,
}

/// `GET /health/detailed` (spec §4.8): the full per-proxy health record
/// (spec §3 "Health record": state + last_error + proxy-kind-specific
/// counters) plus every loaded petal's lifecycle state.
pub async fn detailed(State(state): State<AppState>) -> Json<DetailedHealthResponse> {
    let proxy_snapshot = state.proxies.health_snapshot().await;
    let proxies = proxy_snapshot
        .into_iter()
        .map(|(name, health)| (name.to_string(), health))
        .collect();

    let mut petals = HashMap::new();
    for name in state.petals.names().await {
        if let Some(petal_state) = state.petals.state(&name).await {
            let required_proxies = state.dependency_graph.petal_required_proxies(&name);
            petals.insert(
                name,
                PetalDetail {
                    state: petal_state,
                    required_proxies,
                },
            );
        }
    }

    Json(DetailedHealthResponse { proxies, petals })
}

#[derive(Debug, Deserialize)]
pub struct LogStreamQuery {
    pub level: Option<String>,
}

/// `GET /logs/stream` (spec §4.8, §3): replays the in-memory ring then
/// tails new entries as server-sent events, optionally filtered by level.
/// Mirrors the teacher's `RingHandle::subscribe` + `BroadcastStream`
/// pattern for streaming telemetry over SSE.
pub async fn log_stream(
    State(state): State<AppState>,
    Query(query): Query<LogStreamQuery>,
) -> impl IntoResponse {
    let backlog = state.log_ring.snapshot(query.level.as_deref());
    let live = BroadcastStream::new(state.log_ring.subscribe());
    let level_filter = query.level;

    let backlog_stream = futures::stream::iter(backlog.into_iter());
    let live_stream = live.filter_map(move |item| match item {
        Ok(record) => match &level_filter {
            Some(lvl) if !record.level.eq_ignore_ascii_case(lvl) => None,
            _ => Some(record),
        },
        // A lagging receiver means the ring overtook the client; skip the
        // gap rather than tearing down the connection.
        Err(_lagged) => None,
    });

    let stream = backlog_stream.chain(live_stream).map(|record| {
        Event::default().json_data(&record).unwrap_or_else(|_| {
            Event::default().data("{\"error\":\"failed to serialize log record\"}")
        })
    });

    Sse::new(stream.map(Ok::<_, Infallible>)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn liveness_returns_ok() {
        assert_eq!(liveness().await, "ok");
    }
}
