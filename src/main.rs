//! Relay Discovery Service: binary entrypoint.
//! Loads config, restores the cached registry, starts the first collection cycles
//! and serves the read API.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use relay_discovery::api::{create_router, AppState};
use relay_discovery::config::EngineConfig;
use relay_discovery::engine::DiscoveryEngine;
use relay_discovery::metrics::Metrics;
use relay_discovery::transport::{FixtureTransport, Transport};

/// Compact logs by default; DISCOVERY_LOG_JSON=1 for one JSON object per line.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("relay_discovery=info,discovery=info,warn"));
    let json = std::env::var("DISCOVERY_LOG_JSON").is_ok_and(|v| v == "1");

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer().compact()))
        .init();
}

fn build_transport(cfg: &EngineConfig) -> anyhow::Result<Arc<dyn Transport>> {
    let transport = match &cfg.fixture_path {
        Some(p) => FixtureTransport::from_json_file(p)?,
        None => {
            tracing::warn!(target: "discovery", "no fixture_path configured; transport serves nothing");
            FixtureTransport::default()
        }
    };
    Ok(Arc::new(transport))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = EngineConfig::load_default().context("loading discovery config")?;
    let metrics = Metrics::init(cfg.cache_ttl_secs)?;

    let transport = build_transport(&cfg)?;
    let engine = Arc::new(DiscoveryEngine::new(
        transport,
        cfg.cache_store(),
        cfg.engine_options(),
    ));

    {
        let engine = engine.clone();
        let sources = cfg.bootstrap_relays.clone();
        let trusted = cfg.trusted_monitors.clone();
        tokio::spawn(async move {
            let (relays, monitors) = tokio::join!(
                engine.trigger_fetch(&sources, &trusted),
                engine.trigger_monitor_fetch(&sources),
            );
            tracing::info!(target: "discovery", ?relays, ?monitors, "startup cycles finished");
        });
    }

    let state = AppState::new(
        engine,
        cfg.bootstrap_relays.clone(),
        cfg.trusted_monitors.clone(),
    );
    let app = create_router(state).merge(metrics.router());

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.listen_addr))?;
    tracing::info!(target: "discovery", addr = %cfg.listen_addr, "listening");
    axum::serve(listener, app).await.context("serving http")?;
    Ok(())
}
