//! Procmon Agent - samples the local process table and ships it to procmon-server
//!
//! - One-shot by default: collect, upload, exit (non-zero on failure)
//! - Periodic when `interval_secs` is configured: failures are logged and the
//!   next tick tries again

mod config;
mod error;
mod sampler;
mod transport;

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::sampler::{ProcessTable, Sampler};
use crate::transport::Transport;

async fn upload_once<T: ProcessTable>(
    sampler: &mut Sampler<T>,
    transport: &Transport,
    hostname: &str,
) -> Result<serde_json::Value, AgentError> {
    let processes = sampler.collect().await;
    transport.send(hostname, &processes).await
}

async fn run_periodic<T: ProcessTable>(
    mut sampler: Sampler<T>,
    transport: Transport,
    hostname: &str,
    period: Duration,
) {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                match upload_once(&mut sampler, &transport, hostname).await {
                    Ok(answer) => info!(snapshot_id = %answer["id"], "Uploaded snapshot"),
                    Err(e) => error!(error = %e, "Upload failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping agent");
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("procmon_agent=info")))
        .init();

    let cfg = AgentConfig::load().await.context("Failed to load agent config")?;
    let transport = Transport::new(&cfg.endpoint, &cfg.api_key).context("Failed to build HTTP client")?;
    let mut sampler = Sampler::system();

    info!(hostname = %cfg.hostname, endpoint = %cfg.endpoint, "Procmon agent starting");

    match cfg.interval {
        Some(period) => run_periodic(sampler, transport, &cfg.hostname, period).await,
        None => {
            let answer = upload_once(&mut sampler, &transport, &cfg.hostname)
                .await
                .context("Snapshot upload failed")?;
            info!(snapshot_id = %answer["id"], "Uploaded snapshot");
        }
    }

    Ok(())
}
