//! # Responder Registry
//!
//! Connection table keyed by driver identity. The table is owned by the
//! [`ResponderHub`](crate::engine::dispatcher::ResponderHub) task, so every
//! add/remove/lookup is serialized through that task's command queue and no
//! lock is held here.
//!
//! Each entry carries the sending half of the connection's unbounded channel.
//! A failed send means the receiving half was dropped (the socket task ended),
//! and the entry is pruned on the spot.

use crate::engine::dispatcher::ResponderEvent;
use crate::engine::model::{ConnectionId, DriverId};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

struct ResponderHandle {
    connection_id: ConnectionId,
    sender: mpsc::UnboundedSender<ResponderEvent>,
}

/// Driver identity to live connection.
#[derive(Default)]
pub struct ResponderRegistry {
    connections: HashMap<DriverId, ResponderHandle>,
}

impl ResponderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection for `driver_id`, replacing any previous one.
    ///
    /// Returns the superseded connection, if there was one. Dropping its sender
    /// closes the old receiver, which ends the old socket's event stream.
    pub fn register(
        &mut self,
        driver_id: DriverId,
        connection_id: ConnectionId,
        sender: mpsc::UnboundedSender<ResponderEvent>,
    ) -> Option<ConnectionId> {
        let previous = self
            .connections
            .insert(driver_id, ResponderHandle { connection_id, sender })
            .map(|old| old.connection_id);
        match previous {
            Some(old) => info!(%driver_id, %connection_id, superseded = %old, "Responder reconnected"),
            None => info!(%driver_id, %connection_id, "Responder connected"),
        }
        previous
    }

    /// Removes the driver's entry only if it still belongs to `connection_id`.
    ///
    /// A disconnect from a superseded connection is a no-op.
    pub fn remove(&mut self, driver_id: DriverId, connection_id: ConnectionId) -> bool {
        match self.connections.get(&driver_id) {
            Some(handle) if handle.connection_id == connection_id => {
                self.connections.remove(&driver_id);
                info!(%driver_id, %connection_id, "Responder disconnected");
                true
            }
            Some(_) => {
                debug!(%driver_id, %connection_id, "Ignoring disconnect from superseded connection");
                false
            }
            None => false,
        }
    }

    /// Delivers an event to one driver. Returns false when nobody received it.
    pub fn send_to(&mut self, driver_id: DriverId, event: ResponderEvent) -> bool {
        let Some(handle) = self.connections.get(&driver_id) else {
            return false;
        };
        if handle.sender.send(event).is_ok() {
            return true;
        }
        info!(%driver_id, "Responder channel closed. Removing from registry.");
        self.connections.remove(&driver_id);
        false
    }

    /// Delivers an event to every connected driver, pruning closed channels.
    ///
    /// Returns how many connections received it.
    pub fn broadcast(&mut self, event: &ResponderEvent) -> usize {
        let mut delivered = 0;
        self.connections.retain(|driver_id, handle| match handle.sender.send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => {
                info!(%driver_id, "Responder channel closed. Removing from registry.");
                false
            }
        });
        delivered
    }

    /// Connected drivers in ascending identity order.
    pub fn drivers(&self) -> Vec<DriverId> {
        let mut drivers: Vec<DriverId> = self.connections.keys().copied().collect();
        drivers.sort();
        drivers
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// True when no responder is connected.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
