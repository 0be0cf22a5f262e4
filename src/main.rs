//! kilnwatch - Ceramic workshop monitoring
//!
//! Polls the workshop controllers, stores decoded sensor readings and serves
//! per-device daily reports.

mod codec;
mod config;
mod db;
mod fieldbus;
mod layout;
mod poller;
mod report;
mod web;

use config::ServerConfig;
use db::Store;
use fieldbus::SimulatedBus;
use layout::{LayoutHandle, LayoutTable, PlantConfig};
use poller::{Poller, PollerHandles};
use report::Aggregator;
use web::{AppState, Server};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("kilnwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting kilnwatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Load plant layout
    let plant = match &cfg.plant_path {
        Some(path) => {
            tracing::info!("Loading plant layout from {}", path);
            PlantConfig::from_file(path)?
        }
        None => {
            tracing::info!("No plant file configured, using the built-in workshop layout");
            PlantConfig::workshop()
        }
    };
    let layout = LayoutHandle::new(LayoutTable::build(plant)?);

    // Initialize database
    let store = Arc::new(Store::new(
        &cfg.db_path,
        Duration::from_secs_f64(cfg.query_timeout_secs),
    )?);
    tracing::info!("Database initialized successfully");

    let handles = PollerHandles::new();
    let (layout_version, mut layout_changes) = watch::channel(0u64);

    // Start poller
    let poller = if cfg.simulate {
        tracing::info!(
            "Polling simulated controllers (error rate {})",
            cfg.sim_error_rate
        );
        let bus = Arc::new(SimulatedBus::new(layout.clone(), cfg.sim_error_rate));
        let poller = Arc::new(Poller::new(
            bus,
            store.clone(),
            layout.clone(),
            cfg.poller_config(),
            handles.clone(),
        ));
        poller.start().await;

        let syncing = poller.clone();
        tokio::spawn(async move {
            while layout_changes.changed().await.is_ok() {
                syncing.sync_controllers().await;
            }
        });
        Some(poller)
    } else {
        tracing::warn!(
            "No field-bus driver available; polling disabled (set KILNWATCH_SIMULATE=true)"
        );
        None
    };

    let aggregator = Arc::new(Aggregator::new(
        store.clone(),
        layout.clone(),
        cfg.report_settings(),
    ));

    // Start web server
    let server = Server::new(AppState {
        config: cfg,
        store,
        layout,
        aggregator,
        poller: handles,
        layout_version,
    });

    server.start().await?;

    if let Some(poller) = poller {
        poller.stop().await;
    }

    Ok(())
}
