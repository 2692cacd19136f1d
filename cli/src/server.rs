//! Read-only status API.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use datapath::{IpCacheStore, IpSetStore, Route, RouteTable};
use node_manager::health::HealthStatus;
use node_manager::labels::Labels;
use node_manager::{HealthReporter, Identity, Manager, Node, Source};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub health: Arc<HealthReporter>,
    pub ipcache: Arc<IpCacheStore>,
    pub ipset: Arc<IpSetStore>,
    pub routes: Arc<RouteTable>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    healthy: bool,
    scopes: BTreeMap<String, HealthStatus>,
}

#[derive(Debug, Serialize)]
pub struct PrefixResponse {
    prefix: String,
    source: Source,
    labels: Labels,
    tunnel_peer: Option<std::net::IpAddr>,
    encrypt_key: u8,
    overridden: bool,
}

#[derive(Debug, Serialize)]
pub struct DatapathResponse {
    ipcache_revision: u64,
    ipcache: Vec<PrefixResponse>,
    ipsets: BTreeMap<String, usize>,
    routes: Vec<Route>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/nodes", get(nodes))
        .route("/nodes/identities", get(identities))
        .route("/datapath", get(datapath))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Status API listening");
    axum::serve(listener, routes(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let healthy = state.health.is_healthy();
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthResponse {
            healthy,
            scopes: state.health.snapshot(),
        }),
    )
}

async fn nodes(State(state): State<AppState>) -> Json<Vec<Node>> {
    let mut nodes: Vec<Node> = state.manager.get_nodes().into_values().collect();
    nodes.sort_by_key(|n| n.identity());
    Json(nodes)
}

async fn identities(State(state): State<AppState>) -> Json<Vec<Identity>> {
    let mut ids = state.manager.get_node_identities();
    ids.sort();
    Json(ids)
}

async fn datapath(State(state): State<AppState>) -> Json<DatapathResponse> {
    let ipcache = state
        .ipcache
        .dump()
        .into_iter()
        .map(|(prefix, resolved)| PrefixResponse {
            prefix: prefix.to_string(),
            source: resolved.source,
            labels: resolved.labels,
            tunnel_peer: resolved.tunnel_peer,
            encrypt_key: resolved.encrypt_key,
            overridden: resolved.overridden,
        })
        .collect();

    Json(DatapathResponse {
        ipcache_revision: state.ipcache.revision(),
        ipcache,
        ipsets: state.ipset.summary(),
        routes: state.routes.routes(),
    })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.manager.metrics().to_prometheus(),
    )
}
