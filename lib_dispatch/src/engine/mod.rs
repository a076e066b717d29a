//! # Dispatch Engine Module
//!
//! The components that turn a report into a dispatched ambulance.
//!
//! ## Core Components:
//!
//! - **`fleet`**: the read-only view of ambulances whose vehicle and driver are
//!   both available. This is the input universe for matching.
//!
//! - **`selector`**: a pure nearest-match function over that universe. Ties go
//!   to the first candidate encountered, so results are reproducible.
//!
//! - **`lifecycle`**: the assignment state machine. Owns accept, cancel, the
//!   bounded rematch loop and escalation to Unassignable. Transitions on one
//!   report are serialized; different reports proceed in parallel.
//!
//! - **`registry`** and **`dispatcher`**: the live notification channel. The
//!   dispatcher loop owns the registry of connected responders and processes
//!   typed commands in arrival order, so a disconnect never overtakes a notify
//!   queued before it.
//!
//! - **`ledger`**: the append-only record of ambulances actually sent.

/// Live fan-out loop and the `Notifier` seam used by the lifecycle manager.
pub mod dispatcher;
/// Ambulances, drivers and the `FleetRegistry` contract.
pub mod fleet;
/// Coordinates and great-circle distance.
pub mod geo;
/// Append-only dispatch records.
pub mod ledger;
/// The assignment lifecycle state machine.
pub mod lifecycle;
/// Identifiers, reports, assignments and their statuses.
pub mod model;
/// Connection table keyed by driver identity.
pub mod registry;
/// Nearest-candidate selection.
pub mod selector;

// --- Public API Re-exports ---
pub use dispatcher::{Notifier, ResponderHub};
pub use fleet::{Ambulance, Availability, Driver, FleetCandidate, FleetRegistry};
pub use geo::GeoPoint;
pub use ledger::{DispatchLedger, DispatchRecord, DispatchStatus};
pub use lifecycle::AssignmentManager;
pub use registry::ResponderRegistry;
pub use selector::select_nearest;
