//! # Dispatch Data Model
//!
//! Reports, assignments and the identifiers that tie them to drivers and
//! ambulances. Reports are retained indefinitely; only the lifecycle manager
//! mutates their status.

use crate::engine::geo::GeoPoint;
use crate::errors::{DispatchError, DispatchResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

numeric_id!(
    /// Identity of a report.
    ReportId
);
numeric_id!(
    /// Identity of an assignment (one match attempt).
    AssignmentId
);
numeric_id!(
    /// Identity of a driver.
    DriverId
);
numeric_id!(
    /// Identity of an ambulance.
    AmbulanceId
);
numeric_id!(
    /// Identity of a dispatch record.
    DispatchId
);
numeric_id!(
    /// Identity of the user who filed a report.
    UserId
);

/// Identity of one live responder connection. A reconnecting driver gets a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Kind of report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportKind {
    /// Emergency report; requires a photo.
    #[serde(rename = "SOS")]
    Sos,
    /// Scheduled ambulance request; requires a destination.
    Booking,
}

impl ReportKind {
    /// Stable label, matching the persisted value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sos => "SOS",
            Self::Booking => "Booking",
        }
    }

    /// Parses the persisted label.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SOS" => Some(Self::Sos),
            "Booking" => Some(Self::Booking),
            _ => None,
        }
    }
}

/// Report-level lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportStatus {
    /// Waiting for a driver to accept.
    Pending,
    /// A driver accepted; terminal.
    Assigned,
    /// Withdrawn outside the matcher, e.g. by an operator; terminal.
    Cancelled,
    /// No ambulance was available, or the cancellation cap was reached; terminal.
    Unassignable,
}

impl ReportStatus {
    /// Terminal statuses admit no further transitions.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Stable label, matching the persisted value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Assigned => "Assigned",
            Self::Cancelled => "Cancelled",
            Self::Unassignable => "Unassignable",
        }
    }

    /// Parses the persisted label.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Pending" => Some(Self::Pending),
            "Assigned" => Some(Self::Assigned),
            "Cancelled" => Some(Self::Cancelled),
            "Unassignable" => Some(Self::Unassignable),
            _ => None,
        }
    }
}

/// Assignment-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentStatus {
    /// Waiting for the driver's response.
    Pending,
    /// The driver accepted.
    Accepted,
    /// The driver cancelled, or the response timed out.
    Cancelled,
    /// The accepted job is finished and the driver is back in the fleet.
    Completed,
}

impl AssignmentStatus {
    /// Pending and Accepted assignments are active; at most one per report.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Accepted)
    }

    /// Stable label, matching the persisted value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Accepted => "Accepted",
            Self::Cancelled => "Cancelled",
            Self::Completed => "Completed",
        }
    }

    /// Parses the persisted label.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Pending" => Some(Self::Pending),
            "Accepted" => Some(Self::Accepted),
            "Cancelled" => Some(Self::Cancelled),
            "Completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Caller role, as verified by the excluded authentication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Member of the public filing reports.
    Public,
    /// Ambulance driver.
    Responder,
}

impl Role {
    /// Parses the role claim carried by the transport.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Public" => Some(Self::Public),
            "Responder" => Some(Self::Responder),
            _ => None,
        }
    }
}

/// Driver response to a Pending assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverAction {
    /// Take the job.
    Accept,
    /// Decline the job; the report is rematched unless the cap is reached.
    Cancel,
}

/// Input for `createReport`, after the transport validated its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReport {
    /// User filing the report.
    pub reporter_id: UserId,
    /// SOS or Booking.
    pub kind: ReportKind,
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Optional free text.
    pub description: Option<String>,
    /// Destination; required for Booking.
    pub destination: Option<String>,
    /// Uploaded photo reference; required for SOS.
    pub photo_ref: Option<String>,
}

impl NewReport {
    /// Checks the per-kind requirements and returns the validated location.
    pub fn validate(&self) -> DispatchResult<GeoPoint> {
        let location = GeoPoint::new(self.latitude, self.longitude)?;
        match self.kind {
            ReportKind::Sos if is_blank(self.photo_ref.as_deref()) => Err(
                DispatchError::InvalidReport("Photo required for SOS".to_string()),
            ),
            ReportKind::Booking if is_blank(self.destination.as_deref()) => Err(
                DispatchError::InvalidReport("Destination required for Booking".to_string()),
            ),
            _ => Ok(location),
        }
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

/// A persisted report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Report identity.
    pub id: ReportId,
    /// User who filed it.
    pub reporter_id: UserId,
    /// SOS or Booking.
    pub kind: ReportKind,
    /// Where the ambulance is needed.
    pub location: GeoPoint,
    /// Photo reference, SOS only.
    pub photo_ref: Option<String>,
    /// Free text.
    pub description: Option<String>,
    /// Destination, Booking only.
    pub destination: Option<String>,
    /// Lifecycle status.
    pub status: ReportStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Report {
    /// The public fields pushed to responders.
    pub fn summary(&self) -> ReportSummary {
        ReportSummary {
            report_id: self.id,
            kind: self.kind,
            latitude: self.location.latitude,
            longitude: self.location.longitude,
            photo_url: match self.kind {
                ReportKind::Sos => self.photo_ref.clone(),
                ReportKind::Booking => None,
            },
            description: self.description.clone(),
        }
    }
}

/// Public report fields delivered to responders. The photo is only exposed for SOS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    /// Report identity.
    pub report_id: ReportId,
    /// SOS or Booking. Sent as `reportType`; `type` is the event tag.
    #[serde(rename = "reportType")]
    pub kind: ReportKind,
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Photo reference, present only for SOS.
    pub photo_url: Option<String>,
    /// Free text.
    pub description: Option<String>,
}

/// One match attempt binding a report to a driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    /// Assignment identity.
    pub id: AssignmentId,
    /// Report being served.
    pub report_id: ReportId,
    /// Driver asked to respond.
    pub driver_id: DriverId,
    /// Ambulance the driver was matched with.
    pub ambulance_id: AmbulanceId,
    /// Lifecycle status.
    pub status: AssignmentStatus,
    /// When the match was made.
    pub created_at: DateTime<Utc>,
    /// Set on any terminal transition.
    pub responded_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sos() -> NewReport {
        NewReport {
            reporter_id: UserId(7),
            kind: ReportKind::Sos,
            latitude: 12.9,
            longitude: 77.6,
            description: Some("collision".into()),
            destination: None,
            photo_ref: Some("/uploads/1_crash.jpg".into()),
        }
    }

    #[test]
    fn sos_requires_photo() {
        let mut report = sos();
        assert!(report.validate().is_ok());
        report.photo_ref = Some("  ".into());
        assert!(matches!(report.validate(), Err(DispatchError::InvalidReport(_))));
    }

    #[test]
    fn booking_requires_destination() {
        let mut report = sos();
        report.kind = ReportKind::Booking;
        report.photo_ref = None;
        assert!(report.validate().is_err());
        report.destination = Some("City Hospital".into());
        assert!(report.validate().is_ok());
    }

    #[test]
    fn summary_hides_photo_for_bookings() {
        let mut report = Report {
            id: ReportId(3),
            reporter_id: UserId(7),
            kind: ReportKind::Booking,
            location: GeoPoint { latitude: 1.0, longitude: 2.0 },
            photo_ref: Some("/uploads/x.png".into()),
            description: None,
            destination: Some("Clinic".into()),
            status: ReportStatus::Pending,
            created_at: Utc::now(),
        };
        assert_eq!(report.summary().photo_url, None);
        report.kind = ReportKind::Sos;
        assert_eq!(report.summary().photo_url.as_deref(), Some("/uploads/x.png"));
    }

    #[test]
    fn summary_wire_shape() {
        let summary = ReportSummary {
            report_id: ReportId(9),
            kind: ReportKind::Sos,
            latitude: 1.5,
            longitude: 2.5,
            photo_url: None,
            description: Some("help".into()),
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["reportId"], 9);
        assert_eq!(json["reportType"], "SOS");
        assert!(json["photoUrl"].is_null());
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!ReportStatus::Pending.is_terminal());
        assert!(ReportStatus::Assigned.is_terminal());
        assert!(ReportStatus::Cancelled.is_terminal());
        assert!(ReportStatus::Unassignable.is_terminal());
    }
}
