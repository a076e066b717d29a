//! # Dispatch Store
//!
//! Persistence seam for reports, assignments and the dispatch ledger. The
//! store also serves the fleet view, so every implementation is a
//! [`FleetRegistry`] as well.
//!
//! ## Atomicity contract
//!
//! - `create_assignment` checks that the report has no active assignment and
//!   inserts the new one as a single step, failing with
//!   [`DispatchError::ActiveAssignmentExists`](crate::errors::DispatchError::ActiveAssignmentExists).
//! - `commit_acceptance` applies assignment Accepted, report Assigned, ledger
//!   append and driver/ambulance Busy all together or not at all. A failure
//!   leaves the assignment Pending.
//! - `cancel_assignment` only moves a Pending assignment.
//! - `complete_assignment` moves an Accepted assignment to Completed and frees
//!   its driver and ambulance in one step, so a job can be completed once.
//!
//! The lifecycle manager serializes transitions per report on top of this, but
//! these checks are what keep a multi-process deployment correct.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

use crate::engine::fleet::{FleetCandidate, FleetRegistry};
use crate::engine::geo::GeoPoint;
use crate::engine::ledger::DispatchRecord;
use crate::engine::model::{
    Assignment, AssignmentId, DriverId, NewReport, Report, ReportId, ReportStatus,
};
use crate::errors::DispatchResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable state behind the lifecycle manager.
#[async_trait]
pub trait DispatchStore: FleetRegistry {
    /// Persists a validated report in `Pending`.
    async fn insert_report(&self, report: &NewReport, location: GeoPoint, now: DateTime<Utc>) -> DispatchResult<Report>;

    /// Looks a report up.
    async fn report(&self, report_id: ReportId) -> DispatchResult<Option<Report>>;

    /// Moves a Pending report to `status`. Returns false if it was already terminal.
    async fn close_report(&self, report_id: ReportId, status: ReportStatus) -> DispatchResult<bool>;

    /// Atomically checks for an active assignment and creates a Pending one.
    async fn create_assignment(
        &self,
        report_id: ReportId,
        candidate: &FleetCandidate,
        now: DateTime<Utc>,
    ) -> DispatchResult<Assignment>;

    /// Looks an assignment up.
    async fn assignment(&self, assignment_id: AssignmentId) -> DispatchResult<Option<Assignment>>;

    /// Every assignment ever created for the report, oldest first.
    async fn assignments_for_report(&self, report_id: ReportId) -> DispatchResult<Vec<Assignment>>;

    /// Pending assignments addressed to the driver, oldest first.
    async fn pending_assignments_for_driver(&self, driver_id: DriverId) -> DispatchResult<Vec<Assignment>>;

    /// Pending assignments created at or before `cutoff`, oldest first.
    async fn pending_assignments_before(&self, cutoff: DateTime<Utc>) -> DispatchResult<Vec<Assignment>>;

    /// Moves a Pending assignment to Cancelled and stamps the response time.
    async fn cancel_assignment(&self, assignment_id: AssignmentId, now: DateTime<Utc>) -> DispatchResult<Assignment>;

    /// The all-or-nothing acceptance commit.
    async fn commit_acceptance(&self, assignment_id: AssignmentId, now: DateTime<Utc>) -> DispatchResult<DispatchRecord>;

    /// Moves an Accepted assignment to Completed and marks its driver and
    /// ambulance Available.
    async fn complete_assignment(&self, assignment_id: AssignmentId) -> DispatchResult<Assignment>;

    /// Pending reports created at or before `cutoff` with no Pending or
    /// Accepted assignment, oldest first. A failed rematch leaves reports here.
    async fn stranded_reports(&self, cutoff: DateTime<Utc>) -> DispatchResult<Vec<ReportId>>;

    /// Ledger entries for the report.
    async fn dispatch_records_for_report(&self, report_id: ReportId) -> DispatchResult<Vec<DispatchRecord>>;

    /// Match attempts so far, i.e. assignments ever created for the report.
    async fn count_assignments(&self, report_id: ReportId) -> DispatchResult<u32> {
        Ok(self.assignments_for_report(report_id).await?.len() as u32)
    }
}
