mod config;
mod policy;
mod protocol;
mod relay;
mod scheduler;
mod sensor;
mod state;
mod store;
mod transport;

use anyhow::Result;
use std::{env, path::Path, sync::Arc, time::Duration};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relay::RelayController;
use scheduler::Engine;
use state::SystemState;
use store::JobStore;
use transport::TransportMux;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "fertigation.toml".to_string());
    let store_path = env::var("JOBSTORE_PATH").unwrap_or_else(|_| "jobs.db".to_string());

    // ── Config file ─────────────────────────────────────────────────
    let cfg = config::load(&config_path)?;
    info!(
        sensors = cfg.sensors.len(),
        loops = cfg.loops.len(),
        relays = cfg.relay.channels.len(),
        "config loaded"
    );

    // ── Job store (walks the recovery ladder if needed) ─────────────
    let store = JobStore::open(Path::new(&store_path)).await?;
    if !store.is_durable() {
        warn!("job store is non-durable; schedules will not survive a restart");
    }

    // ── Serial transport + relay board ──────────────────────────────
    let mux = TransportMux::new(cfg.ports.clone());
    let mut relays = RelayController::new(mux.clone(), &cfg.relay);
    // Fail-safe: reach a known all-off state before any scheduling.
    if let Err(e) = relays.all_off().await {
        warn!("startup all-off failed: {e:#}");
    }
    let relays = Arc::new(Mutex::new(relays));

    // ── Shared state ────────────────────────────────────────────────
    let channels: Vec<(String, u8)> = cfg
        .relay
        .channels
        .iter()
        .map(|(name, &ch)| (name.clone(), ch))
        .collect();
    let shared = state::shared(SystemState::new(&channels));
    shared
        .write()
        .await
        .record_system("controller started".to_string());

    // ── Sensor polling ──────────────────────────────────────────────
    let poll_interval = Duration::from_secs(cfg.ports.poll_interval_secs);
    sensor::spawn_poll_task(mux.clone(), cfg.sensors.clone(), poll_interval, shared.clone());

    // ── Config watcher ──────────────────────────────────────────────
    let (reload_tx, reload_rx) = mpsc::channel(4);
    config::spawn_watcher(config_path.clone(), reload_tx);

    info!(config = %config_path, store = %store_path, "fertigation controller started");

    // ── Schedule engine (runs forever) ──────────────────────────────
    Engine::new(store, relays, shared, cfg, reload_rx).run().await;
    Ok(())
}
