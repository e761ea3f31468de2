/**
 * PROCMON SERVER - Entry point of the process snapshot service
 *
 * ROLE : wires config, storage, fan-out hub and the HTTP/WebSocket surface.
 * Agents push snapshots over REST, dashboards watch hosts over WebSocket.
 *
 * ARCHITECTURE : SQLite store + local or MQTT fan-out + axum router.
 */

mod auth;
mod config;
mod error;
mod http;
mod hub;
mod keys;
mod models;
mod state;
mod store;
mod ws;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{HubConf, ServerConfig};
use crate::hub::{LocalHub, MqttHub, SharedHub};
use crate::state::AppState;
use crate::store::SnapshotStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("procmon_server=info")))
        .init();

    let cfg = ServerConfig::load().await.context("loading server config")?;
    if cfg.onboarding_key.is_none() {
        warn!("PROC_MONITOR_API_KEY unset: hosts without a key cannot ingest");
    }
    if cfg.admin_key.is_none() {
        warn!("SUPER_ADMIN_KEY unset: key rotation and host deletion are disabled");
    }

    let store = SnapshotStore::open(&cfg.database)
        .await
        .with_context(|| format!("opening database {}", cfg.database.display()))?;

    let hub: SharedHub = match &cfg.hub {
        HubConf::Local => Arc::new(LocalHub::new()),
        HubConf::Mqtt(conf) => Arc::new(MqttHub::connect(conf)),
    };
    info!(backend = hub.backend(), "Fan-out hub ready");

    let app = http::build_router(AppState::new(store.clone(), hub, &cfg));

    let listener = TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("binding {}", cfg.bind))?;
    info!("Listening on http://{}", cfg.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    store.close().await;
    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
