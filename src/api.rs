use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::aggregate::RelayAggregate;
use crate::capability::Capability;
use crate::engine::{DiscoveryEngine, EngineStatus};
use crate::parser::MonitorAnnouncement;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DiscoveryEngine>,
    /// Sources used by `POST /admin/fetch`.
    pub bootstrap_relays: Arc<Vec<String>>,
    pub trusted_monitors: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(engine: Arc<DiscoveryEngine>, bootstrap: Vec<String>, trusted: Vec<String>) -> Self {
        Self {
            engine,
            bootstrap_relays: Arc::new(bootstrap),
            trusted_monitors: Arc::new(trusted),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/relays", get(list_relays))
        .route("/relay", get(get_relay))
        .route("/relays/capability/{cap}", get(relays_by_capability))
        .route("/monitors", get(list_monitors))
        .route("/status", get(status))
        .route("/admin/fetch", post(admin_fetch))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Alias kept for callers that build the router by its short name.
pub fn router(state: AppState) -> Router {
    create_router(state)
}

fn sorted(mut v: Vec<RelayAggregate>) -> Vec<RelayAggregate> {
    v.sort_by(|a, b| a.key.cmp(&b.key));
    v
}

async fn list_relays(State(state): State<AppState>) -> Json<Vec<RelayAggregate>> {
    let reg = state.engine.registry();
    Json(sorted(reg.values().cloned().collect()))
}

#[derive(serde::Deserialize)]
struct RelayQuery {
    url: String,
}

async fn get_relay(
    State(state): State<AppState>,
    Query(q): Query<RelayQuery>,
) -> Result<Json<RelayAggregate>, StatusCode> {
    state.engine.get(&q.url).map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn relays_by_capability(
    State(state): State<AppState>,
    Path(cap): Path<String>,
) -> Result<Json<Vec<RelayAggregate>>, StatusCode> {
    let cap = Capability::parse(&cap).ok_or(StatusCode::BAD_REQUEST)?;
    Ok(Json(sorted(state.engine.by_capability(cap))))
}

async fn list_monitors(State(state): State<AppState>) -> Json<Vec<MonitorAnnouncement>> {
    Json(state.engine.monitors().as_ref().clone())
}

#[derive(serde::Serialize)]
struct StatusOut {
    #[serde(flatten)]
    status: EngineStatus,
    relays: usize,
    monitors: usize,
}

async fn status(State(state): State<AppState>) -> Json<StatusOut> {
    Json(StatusOut {
        status: state.engine.status(),
        relays: state.engine.registry().len(),
        monitors: state.engine.monitors().len(),
    })
}

/// Start a discovery cycle in the background; returns immediately.
async fn admin_fetch(State(state): State<AppState>) -> StatusCode {
    let engine = state.engine.clone();
    let sources = state.bootstrap_relays.clone();
    let trusted = state.trusted_monitors.clone();
    tokio::spawn(async move {
        let outcome = engine.trigger_fetch(&sources, &trusted).await;
        tracing::info!(target: "discovery", ?outcome, "admin fetch finished");
    });
    StatusCode::ACCEPTED
}
