use chrono::Utc;
use lib_dispatch::{ActionOutcome, AssignmentManager};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

/// Periodically cancels assignments nobody answered within the response
/// timeout, and rematches Pending reports a failed rematch left without one.
pub async fn run(manager: Arc<AssignmentManager>, every: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Assignment sweeper running every {:?}", every);

    loop {
        tokio::select! {
            _ = ticker.tick() => sweep_once(&manager).await,
            _ = shutdown.recv() => {
                info!("Sweeper shutting down.");
                break;
            }
        }
    }
}

async fn sweep_once(manager: &AssignmentManager) {
    match manager.expire_stale(Utc::now()).await {
        Ok(expired) => {
            for (assignment_id, outcome) in expired {
                log_outcome("Assignment", assignment_id, "timed out", &outcome);
            }
        }
        Err(e) => error!("Response-timeout sweep failed: {}", e),
    }

    match manager.recover_stranded(Utc::now()).await {
        Ok(recovered) => {
            for (report_id, outcome) in recovered {
                log_outcome("Report", report_id, "was stranded", &outcome);
            }
        }
        Err(e) => error!("Stranded-report sweep failed: {}", e),
    }
}

fn log_outcome(what: &str, id: impl Display, cause: &str, outcome: &ActionOutcome) {
    match outcome {
        ActionOutcome::Reassigned { assignment } => {
            info!("{} {} {}, reassigned as {}", what, id, cause, assignment.id)
        }
        ActionOutcome::Exhausted { attempts } => {
            info!("{} {} {}, report given up after {} attempts", what, id, cause, attempts)
        }
        ActionOutcome::Unassignable => {
            info!("{} {} {}, no ambulance left to reassign", what, id, cause)
        }
        ActionOutcome::Accepted { .. } => {}
    }
}
