//! # Fleet Registry
//!
//! The view of ambulances and drivers used as the matching universe. An
//! ambulance is a candidate only when both the ambulance and its driver are
//! `Available`; an empty fleet is a legitimate "no capacity" answer, not a fault.

use crate::engine::geo::GeoPoint;
use crate::engine::model::{AmbulanceId, DriverId};
use crate::errors::DispatchResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Availability of an ambulance or a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Availability {
    /// Free to take a job.
    Available,
    /// On a job.
    Busy,
    /// Off duty.
    Offline,
}

impl Availability {
    /// Stable label, matching the persisted value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Busy => "Busy",
            Self::Offline => "Offline",
        }
    }
}

/// An ambulance, bound to exactly one driver while on duty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ambulance {
    /// Ambulance identity.
    pub id: AmbulanceId,
    /// The driver who owns it.
    pub driver_id: DriverId,
    /// Last known location.
    pub location: GeoPoint,
    /// Ambulance availability.
    pub status: Availability,
    /// When the location was last reported.
    pub last_updated: DateTime<Utc>,
}

/// A driver; availability mirrors the ambulance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    /// Driver identity.
    pub id: DriverId,
    /// Driver availability.
    pub status: Availability,
}

/// One matchable (ambulance, driver, location) triple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FleetCandidate {
    /// Candidate ambulance.
    pub ambulance_id: AmbulanceId,
    /// Driver of that ambulance.
    pub driver_id: DriverId,
    /// Last known location.
    pub location: GeoPoint,
}

/// Read side of the fleet plus the high-frequency location write.
#[async_trait]
pub trait FleetRegistry: Send + Sync {
    /// Ambulances whose own status and whose driver's status are both Available.
    async fn available_fleet(&self) -> DispatchResult<Vec<FleetCandidate>>;

    /// Updates the last known location of the driver's ambulance.
    async fn update_location(&self, driver_id: DriverId, location: GeoPoint) -> DispatchResult<()>;

    /// Sets both the driver's and their ambulance's availability.
    async fn set_availability(&self, driver_id: DriverId, status: Availability) -> DispatchResult<()>;
}
