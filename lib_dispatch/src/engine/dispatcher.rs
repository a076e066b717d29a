//! # Responder Hub
//!
//! The live notification channel. A single task owns the
//! [`ResponderRegistry`] and reads typed [`HubCommand`]s from one queue:
//!
//! - `Connect` registers a connection's sender (superseding an older one),
//! - `Notify` / `Broadcast` push a [`ResponderEvent`] to the matching connection(s),
//! - `Disconnect` removes the entry if it still belongs to that connection.
//!
//! Every command from every caller goes through the same FIFO queue, so a
//! notify enqueued before a disconnect is always delivered before the entry
//! is removed. Callers never block: all public methods only enqueue.
//!
//! Location pings never enter that queue. They land in a per-driver
//! latest-value buffer drained by a separate writer task, so a slow
//! [`FleetRegistry`] delays neither notifications nor connects, and a burst of
//! pings from one driver collapses to the newest position.
//!
//! The [`ResponderHub`] handle is cheap to clone and is injected into both the
//! socket handlers and the [`AssignmentManager`](crate::engine::lifecycle::AssignmentManager)
//! (through the [`Notifier`] trait).

use crate::engine::fleet::FleetRegistry;
use crate::engine::geo::GeoPoint;
use crate::engine::model::{ConnectionId, DriverId, ReportSummary, Role};
use crate::engine::registry::ResponderRegistry;
use crate::errors::{DispatchError, DispatchResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Events pushed to a responder connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResponderEvent {
    /// A report the responder should look at.
    NewReport(ReportSummary),
}

/// Delivery seam used by the lifecycle manager. Implementations must not block.
pub trait Notifier: Send + Sync {
    /// Pushes `summary` to one driver's connection, if connected.
    fn notify(&self, driver_id: DriverId, summary: ReportSummary);

    /// Pushes `summary` to every connected responder.
    fn broadcast(&self, summary: ReportSummary);
}

/// Commands processed by the hub task, in arrival order.
enum HubCommand {
    Connect {
        driver_id: DriverId,
        connection_id: ConnectionId,
        sender: mpsc::UnboundedSender<ResponderEvent>,
    },
    Notify {
        driver_id: DriverId,
        event: ResponderEvent,
    },
    Broadcast {
        event: ResponderEvent,
    },
    Disconnect {
        driver_id: DriverId,
        connection_id: ConnectionId,
    },
    ConnectedDrivers {
        reply: oneshot::Sender<Vec<DriverId>>,
    },
}

/// One accepted responder connection.
///
/// `events` yields everything pushed to this connection and ends when the
/// connection is disconnected or superseded by a newer one for the same driver.
#[derive(Debug)]
pub struct ResponderSession {
    /// The driver this connection belongs to.
    pub driver_id: DriverId,
    /// Identity used to disconnect exactly this connection.
    pub connection_id: ConnectionId,
    /// Events for this connection.
    pub events: mpsc::UnboundedReceiver<ResponderEvent>,
}

/// Newest unwritten position per driver.
#[derive(Default)]
struct LatestLocations {
    pending: Mutex<HashMap<DriverId, GeoPoint>>,
}

impl LatestLocations {
    fn put(&self, driver_id: DriverId, location: GeoPoint) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(driver_id, location);
    }

    fn take(&self) -> HashMap<DriverId, GeoPoint> {
        mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Handle to the hub task.
#[derive(Clone)]
pub struct ResponderHub {
    commands: mpsc::UnboundedSender<HubCommand>,
    next_connection: Arc<AtomicU64>,
    locations: Arc<LatestLocations>,
    // capacity 1: a queued wake-up already covers every later ping
    location_wake: mpsc::Sender<()>,
}

impl ResponderHub {
    /// Spawns the hub task and the location writer on the current tokio runtime.
    ///
    /// Both stop once every handle has been dropped.
    pub fn spawn(fleet: Arc<dyn FleetRegistry>) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (location_wake, wake_receiver) = mpsc::channel(1);
        let locations = Arc::new(LatestLocations::default());
        tokio::spawn(run_hub(receiver));
        tokio::spawn(run_location_writer(Arc::clone(&locations), wake_receiver, fleet));
        Self {
            commands,
            next_connection: Arc::new(AtomicU64::new(1)),
            locations,
            location_wake,
        }
    }

    /// Registers a live connection for `driver_id`.
    ///
    /// Only the `Responder` role may connect; the role claim must already
    /// have been verified by the transport.
    pub fn connect(&self, driver_id: DriverId, role: Role) -> DispatchResult<ResponderSession> {
        if role != Role::Responder {
            return Err(DispatchError::Forbidden(role));
        }
        let connection_id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let (sender, events) = mpsc::unbounded_channel();
        self.send(HubCommand::Connect {
            driver_id,
            connection_id,
            sender,
        })?;
        Ok(ResponderSession {
            driver_id,
            connection_id,
            events,
        })
    }

    /// Removes the connection, unless a newer one replaced it.
    pub fn disconnect(&self, driver_id: DriverId, connection_id: ConnectionId) -> DispatchResult<()> {
        self.send(HubCommand::Disconnect {
            driver_id,
            connection_id,
        })
    }

    /// Records a location ping for the writer. Invalid coordinates are rejected
    /// here; a newer ping for the same driver replaces an unwritten one.
    pub fn update_location(&self, driver_id: DriverId, latitude: f64, longitude: f64) -> DispatchResult<()> {
        let location = GeoPoint::new(latitude, longitude)?;
        self.locations.put(driver_id, location);
        match self.location_wake.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => Err(DispatchError::HubClosed),
        }
    }

    /// Drivers connected once every previously queued command has been applied.
    pub async fn connected_drivers(&self) -> DispatchResult<Vec<DriverId>> {
        let (reply, response) = oneshot::channel();
        self.send(HubCommand::ConnectedDrivers { reply })?;
        response.await.map_err(|_| DispatchError::HubClosed)
    }

    fn send(&self, command: HubCommand) -> DispatchResult<()> {
        self.commands.send(command).map_err(|_| DispatchError::HubClosed)
    }
}

impl Notifier for ResponderHub {
    fn notify(&self, driver_id: DriverId, summary: ReportSummary) {
        let event = ResponderEvent::NewReport(summary);
        if self.send(HubCommand::Notify { driver_id, event }).is_err() {
            warn!(%driver_id, "Responder hub closed; notification dropped");
        }
    }

    fn broadcast(&self, summary: ReportSummary) {
        let event = ResponderEvent::NewReport(summary);
        if self.send(HubCommand::Broadcast { event }).is_err() {
            warn!("Responder hub closed; broadcast dropped");
        }
    }
}

async fn run_hub(mut receiver: mpsc::UnboundedReceiver<HubCommand>) {
    let mut registry = ResponderRegistry::new();
    info!("Responder hub started");

    while let Some(command) = receiver.recv().await {
        match command {
            HubCommand::Connect {
                driver_id,
                connection_id,
                sender,
            } => {
                registry.register(driver_id, connection_id, sender);
            }
            HubCommand::Notify { driver_id, event } => {
                if !registry.send_to(driver_id, event) {
                    debug!(%driver_id, "Driver not connected; no live push");
                }
            }
            HubCommand::Broadcast { event } => {
                let delivered = registry.broadcast(&event);
                debug!(delivered, "Broadcast new report");
            }
            HubCommand::Disconnect {
                driver_id,
                connection_id,
            } => {
                registry.remove(driver_id, connection_id);
            }
            HubCommand::ConnectedDrivers { reply } => {
                let _ = reply.send(registry.drivers());
            }
        }
    }

    info!(remaining = registry.len(), "Responder hub stopped");
}

async fn run_location_writer(
    locations: Arc<LatestLocations>,
    mut wake: mpsc::Receiver<()>,
    fleet: Arc<dyn FleetRegistry>,
) {
    while wake.recv().await.is_some() {
        for (driver_id, location) in locations.take() {
            if let Err(e) = fleet.update_location(driver_id, location).await {
                warn!(%driver_id, error = %e, "Failed to record driver location");
            }
        }
    }
    debug!("Location writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fleet::{Availability, FleetCandidate};
    use crate::engine::model::{ReportId, ReportKind};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    #[derive(Default)]
    struct RecordingFleet {
        pings: Mutex<Vec<(DriverId, GeoPoint)>>,
        write_delay: Duration,
    }

    #[async_trait]
    impl FleetRegistry for RecordingFleet {
        async fn available_fleet(&self) -> DispatchResult<Vec<FleetCandidate>> {
            Ok(Vec::new())
        }

        async fn update_location(&self, driver_id: DriverId, location: GeoPoint) -> DispatchResult<()> {
            sleep(self.write_delay).await;
            self.pings.lock().unwrap().push((driver_id, location));
            Ok(())
        }

        async fn set_availability(&self, _driver_id: DriverId, _status: Availability) -> DispatchResult<()> {
            Ok(())
        }
    }

    /// Waits until the fleet has recorded at least `count` pings.
    async fn recorded_pings(fleet: &RecordingFleet, count: usize) -> Vec<(DriverId, GeoPoint)> {
        for _ in 0..50 {
            if fleet.pings.lock().unwrap().len() >= count {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        fleet.pings.lock().unwrap().clone()
    }

    fn summary(id: i64) -> ReportSummary {
        ReportSummary {
            report_id: ReportId(id),
            kind: ReportKind::Sos,
            latitude: 12.9,
            longitude: 77.6,
            photo_url: Some("/uploads/p.jpg".into()),
            description: None,
        }
    }

    #[tokio::test]
    async fn public_role_cannot_connect() {
        let hub = ResponderHub::spawn(Arc::new(RecordingFleet::default()));
        let result = hub.connect(DriverId(1), Role::Public);
        assert!(matches!(result, Err(DispatchError::Forbidden(Role::Public))));
    }

    #[tokio::test]
    async fn notify_queued_before_disconnect_is_delivered() {
        let hub = ResponderHub::spawn(Arc::new(RecordingFleet::default()));
        let mut session = hub.connect(DriverId(7), Role::Responder).unwrap();

        hub.notify(DriverId(7), summary(1));
        hub.notify(DriverId(7), summary(2));
        hub.disconnect(DriverId(7), session.connection_id).unwrap();

        assert_eq!(session.events.recv().await, Some(ResponderEvent::NewReport(summary(1))));
        assert_eq!(session.events.recv().await, Some(ResponderEvent::NewReport(summary(2))));
        assert_eq!(session.events.recv().await, None);
        assert!(hub.connected_drivers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconnect_supersedes_previous_connection() {
        let hub = ResponderHub::spawn(Arc::new(RecordingFleet::default()));
        let mut first = hub.connect(DriverId(3), Role::Responder).unwrap();
        let mut second = hub.connect(DriverId(3), Role::Responder).unwrap();
        assert_ne!(first.connection_id, second.connection_id);

        // the old socket's late disconnect must not drop the new connection
        hub.disconnect(DriverId(3), first.connection_id).unwrap();
        hub.notify(DriverId(3), summary(4));

        assert_eq!(first.events.recv().await, None);
        assert_eq!(second.events.recv().await, Some(ResponderEvent::NewReport(summary(4))));
        assert_eq!(hub.connected_drivers().await.unwrap(), vec![DriverId(3)]);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_responder() {
        let hub = ResponderHub::spawn(Arc::new(RecordingFleet::default()));
        let mut a = hub.connect(DriverId(1), Role::Responder).unwrap();
        let mut b = hub.connect(DriverId(2), Role::Responder).unwrap();

        hub.broadcast(summary(8));

        assert_eq!(a.events.recv().await, Some(ResponderEvent::NewReport(summary(8))));
        assert_eq!(b.events.recv().await, Some(ResponderEvent::NewReport(summary(8))));
    }

    #[tokio::test]
    async fn location_updates_reach_the_fleet() {
        let fleet = Arc::new(RecordingFleet::default());
        let hub = ResponderHub::spawn(fleet.clone());

        hub.update_location(DriverId(5), 12.95, 77.65).unwrap();
        assert!(hub.update_location(DriverId(5), 120.0, 0.0).is_err());

        let pings = recorded_pings(&fleet, 1).await;
        assert_eq!(pings, vec![(DriverId(5), GeoPoint { latitude: 12.95, longitude: 77.65 })]);
    }

    #[tokio::test]
    async fn slow_location_writes_do_not_hold_up_notifications() {
        let fleet = Arc::new(RecordingFleet {
            write_delay: Duration::from_millis(500),
            ..RecordingFleet::default()
        });
        let hub = ResponderHub::spawn(fleet.clone());
        let mut session = hub.connect(DriverId(2), Role::Responder).unwrap();

        for step in 0..5 {
            hub.update_location(DriverId(9), 12.9 + f64::from(step) * 0.001, 77.6).unwrap();
        }
        hub.notify(DriverId(2), summary(3));

        let event = timeout(Duration::from_millis(100), session.events.recv()).await;
        assert_eq!(event.ok().flatten(), Some(ResponderEvent::NewReport(summary(3))));
        assert_eq!(hub.connected_drivers().await.unwrap(), vec![DriverId(2)]);
    }

    #[tokio::test]
    async fn pings_arriving_during_a_write_collapse_to_the_newest() {
        let fleet = Arc::new(RecordingFleet {
            write_delay: Duration::from_millis(50),
            ..RecordingFleet::default()
        });
        let hub = ResponderHub::spawn(fleet.clone());

        hub.update_location(DriverId(4), 12.90, 77.6).unwrap();
        // let the writer pick up the first ping before the burst arrives
        sleep(Duration::from_millis(10)).await;
        for latitude in [12.91, 12.92, 12.93] {
            hub.update_location(DriverId(4), latitude, 77.6).unwrap();
        }

        let pings = recorded_pings(&fleet, 2).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(*fleet.pings.lock().unwrap(), pings);
        let latitudes: Vec<f64> = pings.iter().map(|(_, p)| p.latitude).collect();
        assert_eq!(latitudes, vec![12.90, 12.93]);
    }

    #[test]
    fn new_report_event_wire_shape() {
        let text = serde_json::to_string(&ResponderEvent::NewReport(summary(11))).unwrap();
        assert_eq!(text.matches("\"type\"").count(), 1, "{text}");

        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "newReport");
        assert_eq!(json["reportType"], "SOS");
        assert_eq!(json["reportId"], 11);
        assert_eq!(json["photoUrl"], "/uploads/p.jpg");

        let parsed: ResponderEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, ResponderEvent::NewReport(summary(11)));
    }
}
