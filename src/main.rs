//! # relay
//!
//! Relay server binary: loads settings, connects the bus and history store,
//! and serves WebSocket sessions until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use relay_bus::{MemoryBus, MessageBus};
use relay_server::settings::{load_settings, load_settings_from_path};
use relay_server::{shutdown_signal, RelayDeps, RelaySettings, ShutdownCoordinator, DEFAULT_SHUTDOWN_TIMEOUT};
use relay_store::HistoryStore;
use relay_telemetry::TelemetryConfig;

/// Real-time message relay.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Real-time WebSocket message relay")]
struct Cli {
    /// Settings file (defaults to `~/.relay/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,
}

impl Cli {
    fn settings(&self) -> Result<RelaySettings> {
        let mut settings = match &self.config {
            Some(path) => load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => load_settings().context("Failed to load settings")?,
        };
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        Ok(settings)
    }
}

async fn connect_bus(settings: &RelaySettings) -> Option<Arc<dyn MessageBus>> {
    if !settings.bus.enabled {
        info!("bus disabled, relaying within this process only");
        return Some(Arc::new(MemoryBus::new()));
    }
    match relay_bus::connect_with_retry(&settings.bus.connect_config()).await {
        Ok(bus) => Some(Arc::new(bus)),
        Err(e) => {
            warn!(error = %e, "bus unavailable, cross-instance delivery disabled");
            None
        }
    }
}

async fn connect_store(settings: &RelaySettings) -> Option<HistoryStore> {
    if !settings.store.enabled {
        info!("history store disabled");
        return None;
    }
    match relay_store::connect_with_retry(&settings.store.connect_config()).await {
        Ok(store) => Some(store),
        Err(e) => {
            warn!(error = %e, "history store unavailable, persistence disabled");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings()?;

    let telemetry = TelemetryConfig::from_names(
        &settings.telemetry.level,
        &settings.telemetry.module_level_pairs(),
        settings.telemetry.json,
    )
    .context("Invalid telemetry settings")?;
    relay_telemetry::init_telemetry(&telemetry).context("Failed to initialize logging")?;
    let metrics = match relay_telemetry::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics recorder not installed");
            None
        }
    };

    let bus = connect_bus(&settings).await;
    let store = connect_store(&settings).await;
    if bus.is_none() && store.is_none() {
        warn!("running without bus and history store");
    }

    let shutdown = ShutdownCoordinator::new();
    let handle = relay_server::start(&settings, RelayDeps { bus, store, metrics }, &shutdown)
        .await
        .with_context(|| format!("Failed to bind {}", settings.server.bind_addr()))?;
    info!(port = handle.port(), "relay ready");

    shutdown_signal().await;
    shutdown.graceful_shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await;
    info!("relay stopped");
    Ok(())
}
