//! # Ambulance Dispatch Server
//!
//! HTTP and WebSocket front for `lib_dispatch`.
//!
//! ## Key Features:
//! - **Report intake**: `POST /api/report/create` matches a report to the nearest
//!   available ambulance and answers 409 with an actionable message when none is free.
//! - **Driver actions**: accept, cancel and complete over `POST /api/driver/assignment/{id}`,
//!   plus `GET /api/driver/pending` for polling clients.
//! - **Live channel**: responders connect on `/ws`, stream `updateLocation` pings and
//!   receive `newReport` pushes.
//! - **Storage**: PostgreSQL through `deadpool_postgres` when `DATABASE_URL` is set,
//!   otherwise an in-memory store optionally seeded from a JSON5 fleet file.
//! - **Sweeper**: cancels and rematches unanswered assignments when the policy sets
//!   `response_timeout_secs`, and rematches Pending reports a failed rematch left
//!   without an assignment.

use anyhow::Result;
use lib_dispatch::DispatchPolicy;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

mod dispatch_logic;
use dispatch_logic::{config, downstream, logger, state, sweeper};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config()?;
    let _log_guard = logger::setup_logging(&config.log_dir, &config.log_level)?;

    let policy = match &config.policy_path {
        Some(path) => DispatchPolicy::load(path)?,
        None => DispatchPolicy::default(),
    };
    info!("Dispatch policy: {:?}", policy);

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let app_state = state::build_state(&config, policy.clone(), shutdown_tx.clone()).await?;

    let sweeper_handle = tokio::spawn(sweeper::run(
        app_state.manager.clone(),
        Duration::from_secs(config.sweep_interval_secs),
        shutdown_tx.subscribe(),
    ));

    let mut downstream_handle = tokio::spawn(downstream::run(
        config.clone(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal, or for the server to stop on its own
    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received, initiating shutdown.");
        }
        result = &mut downstream_handle => {
            match result {
                Ok(Err(e)) => error!("Dispatch server failed: {:#}", e),
                Err(e) => error!("Dispatch server task panicked: {}", e),
                Ok(Ok(())) => {}
            }
            let _ = shutdown_tx.send(());
            let _ = sweeper_handle.await;
            return Ok(());
        }
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    if let Ok(Err(e)) = downstream_handle.await {
        error!("Dispatch server stopped with error: {:#}", e);
    }
    let _ = sweeper_handle.await;

    info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    // Handler for CTRL+C
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    // Handler for SIGTERM (on UNIX systems)
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    // On non-UNIX systems, `terminate` is a future that never completes.
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
