//! # lib_dispatch
//!
//! Matching, assignment lifecycle and live fan-out for the Respondr ambulance
//! dispatch service.
//!
//! A new report flows through the crate like this:
//!
//! 1. the [`store::DispatchStore`] (which is also the [`engine::fleet::FleetRegistry`])
//!    lists the ambulances whose ambulance and driver are both available,
//! 2. [`engine::selector::select_nearest`] picks the closest one by haversine distance,
//! 3. [`engine::lifecycle::AssignmentManager`] records a Pending assignment and asks
//!    its [`engine::dispatcher::Notifier`] to push the report to responders,
//! 4. the driver accepts (dispatch record written) or cancels (rematch until the
//!    cancellation cap is reached).
//!
//! The HTTP/WebSocket surface lives in the `servers` package; this crate carries
//! no transport code.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Policy configuration loaded from JSON5.
pub mod configs;
/// Domain components: geometry, fleet, selector, lifecycle, ledger, live channel.
pub mod engine;
/// The error taxonomy shared by every component.
pub mod errors;
/// Persistence seam and its in-memory and PostgreSQL implementations.
pub mod store;

// --- Public API Re-exports ---
pub use configs::{DispatchPolicy, NotifyMode, PolicyError};
pub use engine::dispatcher::{Notifier, ResponderEvent, ResponderHub, ResponderSession};
pub use engine::geo::GeoPoint;
pub use engine::fleet::{Availability, FleetCandidate, FleetRegistry};
pub use engine::ledger::DispatchRecord;
pub use engine::lifecycle::{ActionOutcome, AssignmentManager, PendingAssignment, ReportCreated};
pub use engine::model::*;
pub use errors::{DispatchError, DispatchResult};
pub use store::{DispatchStore, MemoryStore};
#[cfg(feature = "postgres")]
pub use store::PostgresStore;
