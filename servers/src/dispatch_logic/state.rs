use crate::dispatch_logic::config::ServerConfig;
use crate::dispatch_logic::model::FleetSeed;
use anyhow::{Context, Result};
use lib_dispatch::{
    AssignmentManager, DispatchPolicy, DispatchStore, FleetRegistry, GeoPoint, MemoryStore,
    PostgresStore, ResponderHub,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<AssignmentManager>,
    pub hub: ResponderHub,
    // Sockets listen on this so they close when the server stops
    pub shutdown: broadcast::Sender<()>,
}

impl AppState {
    /// Wires a store into the hub and the lifecycle manager.
    pub fn new<S: DispatchStore + 'static>(
        store: Arc<S>,
        policy: DispatchPolicy,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        let fleet: Arc<dyn FleetRegistry> = store.clone();
        let hub = ResponderHub::spawn(fleet);
        let manager = Arc::new(AssignmentManager::new(store, Arc::new(hub.clone()), policy));
        Self { manager, hub, shutdown }
    }
}

/// Picks PostgreSQL when a database URL is configured, the in-memory store otherwise.
pub async fn build_state(
    config: &ServerConfig,
    policy: DispatchPolicy,
    shutdown: broadcast::Sender<()>,
) -> Result<AppState> {
    match &config.database_url {
        Some(url) => {
            let store = PostgresStore::connect(url, config.db_max_connections)?;
            if let Err(e) = store.ping().await {
                warn!("Database not reachable at startup: {}. Requests will retry.", e);
            }
            info!("Using PostgreSQL dispatch store");
            Ok(AppState::new(Arc::new(store), policy, shutdown))
        }
        None => {
            let store = MemoryStore::new();
            if let Some(path) = &config.fleet_path {
                let seeded = seed_fleet(&store, path)?;
                info!("Seeded {} ambulances from {}", seeded, path.display());
            }
            warn!("No DATABASE_URL configured; using the in-memory store (state is lost on restart)");
            Ok(AppState::new(Arc::new(store), policy, shutdown))
        }
    }
}

/// Loads a JSON5 array of drivers and their ambulances into the memory store.
pub fn seed_fleet(store: &MemoryStore, path: &Path) -> Result<usize> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let seeds: Vec<FleetSeed> =
        json5::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    for seed in &seeds {
        let location = GeoPoint::new(seed.latitude, seed.longitude)
            .with_context(|| format!("driver {} location", seed.driver_id))?;
        store.add_driver(seed.driver_id, seed.ambulance_id, location);
    }
    Ok(seeds.len())
}
