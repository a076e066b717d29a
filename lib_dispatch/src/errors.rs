//! # Dispatch Errors
//!
//! One taxonomy for the whole dispatch core. Capacity problems (`NoCapacity`,
//! `CapacityExhausted`) are expected outcomes that callers surface to the end
//! user; only `TransientStoreFailure` and `HubClosed` indicate a fault.

use crate::engine::model::{AssignmentId, AssignmentStatus, ReportId, Role};
use thiserror::Error;

/// Result alias used across the crate.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Custom error types for dispatch operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    /// The report failed input validation; nothing was written.
    #[error("Invalid report: {0}")]
    InvalidReport(String),

    /// No ambulance was available when the report was matched.
    #[error("No available ambulances for report {report_id}")]
    NoCapacity {
        /// Report that could not be matched. It is now Unassignable.
        report_id: ReportId,
    },

    /// The assignment is no longer in the state the action requires.
    #[error("Assignment {assignment_id} is {status:?}; the action no longer applies")]
    StaleAssignment {
        /// Assignment the caller acted on.
        assignment_id: AssignmentId,
        /// Status observed under the report lock.
        status: AssignmentStatus,
    },

    /// The assignment does not exist or belongs to another driver.
    #[error("Assignment {assignment_id} not found")]
    Unauthorized {
        /// Assignment the caller acted on.
        assignment_id: AssignmentId,
    },

    /// The report hit the cancellation cap and will not be rematched.
    #[error("Report {report_id} exhausted {attempts} match attempts")]
    CapacityExhausted {
        /// Report that became unassignable.
        report_id: ReportId,
        /// Number of assignments created for the report.
        attempts: u32,
    },

    /// Another Pending or Accepted assignment already exists for the report.
    #[error("Report {report_id} already has an active assignment")]
    ActiveAssignmentExists {
        /// Report that already has an active assignment.
        report_id: ReportId,
    },

    /// A referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller's role may not perform the operation.
    #[error("Role {0:?} may not perform this operation")]
    Forbidden(Role),

    /// The persistence layer failed; the transition was not applied.
    #[error("Store failure: {0}")]
    TransientStoreFailure(String),

    /// The responder hub task has stopped.
    #[error("Responder hub is closed")]
    HubClosed,
}

impl DispatchError {
    /// Returns true for failures worth retrying at the transition boundary.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStoreFailure(_))
    }

    /// Returns true when the error means "no ambulance can take this report".
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::NoCapacity { .. } | Self::CapacityExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_failures_are_transient() {
        assert!(DispatchError::TransientStoreFailure("io".into()).is_transient());
        assert!(!DispatchError::NoCapacity { report_id: ReportId(1) }.is_transient());
        assert!(!DispatchError::HubClosed.is_transient());
    }

    #[test]
    fn capacity_errors_are_grouped() {
        assert!(DispatchError::NoCapacity { report_id: ReportId(4) }.is_capacity());
        assert!(DispatchError::CapacityExhausted { report_id: ReportId(4), attempts: 3 }.is_capacity());
        assert!(!DispatchError::Unauthorized { assignment_id: AssignmentId(2) }.is_capacity());
    }
}
