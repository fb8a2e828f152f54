//! REST handlers and the router that ties the HTTP surface together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::auth::extract_token;
use crate::duration::parse_duration;
use crate::error::{AgentError, Result};
use crate::history::{HistoryKind, HistorySeries};
use crate::process::ProcessSnapshot;
use crate::security::{
    cors_layer, rate_limit, require_token, with_security_headers, RateLimiter,
};
use crate::state::AppState;
use crate::types::{
    AggregatedNetworkStatus, CpuInfo, CpuStatus, DirectoryInfo, DiskStatus, HistoryWindow,
    MemoryStatus, NetworkStatus, ProcessStatus,
};
use crate::ws::ws_handler;

pub const DEFAULT_HISTORY_WINDOW: &str = "10m";
const DASHBOARD_PROCESSES: usize = 5;
const DASHBOARD_DIRECTORIES: usize = 5;
const DASHBOARD_HISTORY: Duration = Duration::from_secs(600);

/// Per-IP limiters: one for the whole surface and a stricter one for `/auth/*`.
#[derive(Clone)]
pub struct Limiters {
    pub general: Arc<RateLimiter>,
    pub auth: Arc<RateLimiter>,
}

impl Limiters {
    pub fn new(rps: f64, burst: u32, max_clients: usize) -> Self {
        Self {
            general: Arc::new(RateLimiter::new(rps, burst, max_clients)),
            auth: Arc::new(RateLimiter::strict(max_clients)),
        }
    }
}

impl Default for Limiters {
    fn default() -> Self {
        Self::new(100.0, 200, 10_000)
    }
}

pub fn router(state: AppState, limiters: Limiters) -> Router {
    let protected = Router::new()
        .route("/metrics/", get(metrics_summary))
        .route("/metrics/cpu", get(cpu))
        .route("/metrics/cpu/info", get(cpu_info))
        .route("/metrics/memory", get(memory))
        .route("/metrics/disk", get(disk))
        .route("/metrics/network", get(network))
        .route("/metrics/network/aggregated", get(network_aggregated))
        .route("/metrics/history", get(history))
        .route("/metrics/history/all", get(history_all))
        .route("/dashboard", get(dashboard))
        .route("/processes", get(processes))
        .route("/processes/", get(processes))
        .route("/processes/status", get(process_status))
        .route_layer(middleware::from_fn_with_state(state.auth.clone(), require_token));

    let auth = Router::new()
        .route("/auth/status", get(auth_status))
        .route_layer(middleware::from_fn_with_state(limiters.auth, rate_limit));

    let cors = cors_layer(state.origins.clone());
    let app = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .merge(protected)
        .merge(auth)
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(limiters.general, rate_limit))
        .layer(cors);
    with_security_headers(app).with_state(state)
}

async fn not_found(uri: Uri) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("no route for {}", uri.path()) })),
    )
        .into_response()
}

async fn health(State(s): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": s.started.elapsed().as_secs(),
        "clients": s.hub.client_count().await,
    }))
}

// ---------- current metrics ----------

async fn cpu(State(s): State<AppState>) -> Result<Json<CpuStatus>> {
    s.cache.cpu().await.map(Json)
}

async fn cpu_info(State(s): State<AppState>) -> Result<Json<CpuInfo>> {
    s.cache.cpu_info().await.map(Json)
}

async fn memory(State(s): State<AppState>) -> Result<Json<MemoryStatus>> {
    s.cache.memory().await.map(Json)
}

async fn disk(State(s): State<AppState>) -> Result<Json<DiskStatus>> {
    s.cache.disk().await.map(Json)
}

async fn network(State(s): State<AppState>) -> Result<Json<Vec<NetworkStatus>>> {
    s.cache.interfaces().await.map(Json)
}

async fn network_aggregated(State(s): State<AppState>) -> Result<Json<AggregatedNetworkStatus>> {
    s.cache.network().await.map(Json)
}

#[derive(Debug, Serialize)]
struct NetworkTotals {
    bytes_sent: u64,
    bytes_recv: u64,
}

#[derive(Debug, Serialize)]
struct Summary {
    cpu: Option<f64>,
    memory: Option<f64>,
    disk: Option<f64>,
    network: Option<NetworkTotals>,
}

async fn metrics_summary(State(s): State<AppState>) -> Json<Summary> {
    let (cpu, memory, disk, network) =
        tokio::join!(s.cache.cpu(), s.cache.memory(), s.cache.disk(), s.cache.network());
    Json(Summary {
        cpu: cpu.ok().map(|c| c.usage_percent),
        memory: memory.ok().map(|m| m.usage_percent),
        disk: disk.ok().map(|d| d.usage_percent),
        network: network.ok().map(|n| NetworkTotals {
            bytes_sent: n.bytes_sent,
            bytes_recv: n.bytes_recv,
        }),
    })
}

// ---------- history ----------

#[derive(Debug, Serialize)]
struct HistoryResponse {
    metric: &'static str,
    duration: String,
    data: HistorySeries,
}

fn window_param(q: &HashMap<String, String>) -> Result<(String, Duration)> {
    let raw = q
        .get("duration")
        .cloned()
        .unwrap_or_else(|| DEFAULT_HISTORY_WINDOW.to_string());
    let d = parse_duration(&raw)?;
    Ok((raw, d))
}

async fn history(
    State(s): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Json<HistoryResponse>> {
    let kind: HistoryKind = q.get("metric").map(String::as_str).unwrap_or("cpu").parse()?;
    let (duration, window) = window_param(&q)?;
    Ok(Json(HistoryResponse {
        metric: kind.as_str(),
        duration,
        data: s.history.history(kind, window),
    }))
}

#[derive(Debug, Serialize)]
struct HistoryAllResponse {
    duration: String,
    data: HistoryWindow,
}

async fn history_all(
    State(s): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Json<HistoryAllResponse>> {
    let (duration, window) = window_param(&q)?;
    Ok(Json(HistoryAllResponse {
        duration,
        data: s.history.window(window),
    }))
}

// ---------- dashboard ----------

#[derive(Debug, Serialize)]
struct DashboardCpu {
    usage_percent: f64,
    core_count: usize,
}

#[derive(Debug, Serialize)]
struct DashboardMemory {
    used_gb: f64,
    available_gb: f64,
    usage_percent: f64,
}

#[derive(Debug, Serialize)]
struct DashboardDisk {
    used_gb: f64,
    total_gb: f64,
    usage_percent: f64,
}

#[derive(Debug, Serialize)]
struct DashboardNetwork {
    bytes_sent: u64,
    bytes_recv: u64,
    bytes_sent_rate: f64,
    bytes_recv_rate: f64,
}

#[derive(Debug, Serialize)]
struct ProcessTotals {
    total_cpu: f64,
    total_mem: f64,
}

#[derive(Debug, Serialize)]
struct Current {
    cpu: Option<DashboardCpu>,
    memory: Option<DashboardMemory>,
    disk: Option<DashboardDisk>,
    network: Option<DashboardNetwork>,
    top_processes: Vec<ProcessStatus>,
    process_totals: ProcessTotals,
}

#[derive(Debug, Serialize)]
struct Dashboard {
    current: Current,
    disk_partitions: Vec<DiskStatus>,
    top_directories: Vec<DirectoryInfo>,
    history: HistoryWindow,
    timestamp: DateTime<Utc>,
}

/// Every kind is fetched independently; a failed one is null (or empty) in the payload.
async fn dashboard(State(s): State<AppState>) -> Json<Dashboard> {
    let (cpu, memory, disk, network, partitions, dirs) = tokio::join!(
        s.cache.cpu(),
        s.cache.memory(),
        s.cache.disk(),
        s.cache.network(),
        s.cache.partitions(),
        s.cache.top_directories(DASHBOARD_DIRECTORIES),
    );
    let procs = s.processes.latest();

    Json(Dashboard {
        current: Current {
            cpu: cpu.ok().map(|c| DashboardCpu {
                usage_percent: c.usage_percent,
                core_count: c.core_count,
            }),
            memory: memory.ok().map(|m| DashboardMemory {
                used_gb: m.used_gb,
                available_gb: m.available_gb,
                usage_percent: m.usage_percent,
            }),
            disk: disk.ok().map(|d| DashboardDisk {
                used_gb: d.used_gb,
                total_gb: d.total_gb,
                usage_percent: d.usage_percent,
            }),
            network: network.ok().map(|n| DashboardNetwork {
                bytes_sent: n.bytes_sent,
                bytes_recv: n.bytes_recv,
                bytes_sent_rate: n.bytes_sent_rate,
                bytes_recv_rate: n.bytes_recv_rate,
            }),
            top_processes: procs.processes.iter().take(DASHBOARD_PROCESSES).cloned().collect(),
            process_totals: ProcessTotals {
                total_cpu: procs.total_cpu,
                total_mem: procs.total_mem,
            },
        },
        disk_partitions: partitions.unwrap_or_default(),
        top_directories: dirs.unwrap_or_default(),
        history: s.history.window(DASHBOARD_HISTORY),
        timestamp: Utc::now(),
    })
}

// ---------- processes ----------

async fn processes(State(s): State<AppState>) -> Json<ProcessSnapshot> {
    Json(ProcessSnapshot::clone(&s.processes.latest()))
}

async fn process_status(State(s): State<AppState>) -> Json<serde_json::Value> {
    let snap = s.processes.latest();
    Json(json!({
        "total_processes": snap.total_count,
        "updated_at": snap.updated_at,
    }))
}

// ---------- auth ----------

/// Validates an existing token. No endpoint issues tokens.
async fn auth_status(State(s): State<AppState>, headers: HeaderMap, uri: Uri) -> Response {
    let Some(token) = extract_token(&headers, &uri) else {
        warn!("token status requested without a token");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "token required in Authorization header or query parameter" })),
        )
            .into_response();
    };
    match s.auth.validate(&token) {
        Ok(claims) => {
            info!(server = %claims.server_name, "token status: valid");
            Json(json!({
                "valid": true,
                "server": claims.server_name,
                "expires_at": claims.expires_at(),
                "issued_at": claims.issued_at(),
            }))
            .into_response()
        }
        Err(e) => {
            warn!("token status: {e}");
            AgentError::InvalidToken("invalid token".into()).into_response()
        }
    }
}
