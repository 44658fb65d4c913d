//! FlowSpace bridge server.
//!
//! Loads configuration, opens the FlowSpace store (seeding it from the
//! bootstrap file when empty), runs the mutation controller until Ctrl-C and
//! then drains it.

use bridge::{open_store, BridgeError, FlowSpaceRuntime, FlowSpaceStore, FlowVisorConfig};
use log::{error, info, warn};
use std::process::exit;
use tracing_subscriber::filter::LevelFilter;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!("flowvisor-bridge error: {}", err);
        eprintln!("flowvisor-bridge error: {err}");
        exit(1);
    }
}

async fn run() -> Result<(), BridgeError> {
    let config = FlowVisorConfig::resolve(std::env::args().nth(1))?;

    let level: LevelFilter = config
        .log_level
        .parse()
        .map_err(|_| BridgeError::Config(format!("unknown log level '{}'", config.log_level)))?;
    tracing_subscriber::fmt().with_max_level(level).init();

    let store = open_store(&config.storage)?;
    seed_store(&config, store.as_ref())?;

    let runtime = FlowSpaceRuntime::start(store, &config.controller)?;
    info!("FlowSpace loaded: {} entries", runtime.api().len());

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Shutdown requested, draining controller");
    runtime.shutdown().await
}

/// Imports the bootstrap records when the store is empty.
fn seed_store(config: &FlowVisorConfig, store: &dyn FlowSpaceStore) -> Result<(), BridgeError> {
    let Some(path) = &config.bootstrap_path else {
        return Ok(());
    };
    if !store.load()?.is_empty() {
        info!("Store already populated, ignoring bootstrap file {}", path.display());
        return Ok(());
    }

    let text = std::fs::read_to_string(path)
        .map_err(|e| BridgeError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    let records = flowspace::parse_records(&text)?;
    for record in &records {
        store.insert(record)?;
    }
    info!("Seeded store with {} entries from {}", records.len(), path.display());
    Ok(())
}
