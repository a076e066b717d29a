//! In-process [`DispatchStore`]. All state sits behind one mutex, so every
//! method is a single all-or-nothing step. Used by the server when no database
//! is configured, and by the tests (with fault injection).

use super::DispatchStore;
use crate::engine::fleet::{Ambulance, Availability, Driver, FleetCandidate, FleetRegistry};
use crate::engine::geo::GeoPoint;
use crate::engine::ledger::{DispatchLedger, DispatchRecord};
use crate::engine::model::{
    AmbulanceId, Assignment, AssignmentId, AssignmentStatus, DriverId, NewReport, Report,
    ReportId, ReportStatus,
};
use crate::errors::{DispatchError, DispatchResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct MemoryState {
    reports: HashMap<ReportId, Report>,
    assignments: BTreeMap<AssignmentId, Assignment>,
    drivers: BTreeMap<DriverId, Driver>,
    ambulances: BTreeMap<AmbulanceId, Ambulance>,
    ledger: DispatchLedger,
    next_report: i64,
    next_assignment: i64,
    commit_failures: u32,
    fleet_failures: u32,
}

impl MemoryState {
    fn ambulance_of_mut(&mut self, driver_id: DriverId) -> Option<&mut Ambulance> {
        self.ambulances.values_mut().find(|a| a.driver_id == driver_id)
    }
}

/// Mutex-guarded in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Creates an empty store with no fleet.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an on-duty driver with their ambulance, both Available.
    pub fn add_driver(&self, driver_id: DriverId, ambulance_id: AmbulanceId, location: GeoPoint) {
        let mut state = self.state();
        state.drivers.insert(
            driver_id,
            Driver {
                id: driver_id,
                status: Availability::Available,
            },
        );
        state.ambulances.insert(
            ambulance_id,
            Ambulance {
                id: ambulance_id,
                driver_id,
                location,
                status: Availability::Available,
                last_updated: Utc::now(),
            },
        );
    }

    /// Makes the next `count` acceptance commits fail with a transient error.
    pub fn inject_commit_failures(&self, count: u32) {
        self.state().commit_failures = count;
    }

    /// Makes the next `count` fleet reads fail with a transient error.
    pub fn inject_fleet_failures(&self, count: u32) {
        self.state().fleet_failures = count;
    }

    /// Current availability of a driver.
    pub fn driver_status(&self, driver_id: DriverId) -> Option<Availability> {
        self.state().drivers.get(&driver_id).map(|d| d.status)
    }

    /// Every ledger entry, oldest first.
    pub fn dispatch_records(&self) -> Vec<DispatchRecord> {
        self.state().ledger.records().to_vec()
    }
}

#[async_trait]
impl FleetRegistry for MemoryStore {
    async fn available_fleet(&self) -> DispatchResult<Vec<FleetCandidate>> {
        let mut state = self.state();
        if state.fleet_failures > 0 {
            state.fleet_failures -= 1;
            return Err(DispatchError::TransientStoreFailure(
                "injected fleet read failure".to_string(),
            ));
        }
        Ok(state
            .ambulances
            .values()
            .filter(|a| a.status == Availability::Available)
            .filter(|a| {
                state
                    .drivers
                    .get(&a.driver_id)
                    .is_some_and(|d| d.status == Availability::Available)
            })
            .map(|a| FleetCandidate {
                ambulance_id: a.id,
                driver_id: a.driver_id,
                location: a.location,
            })
            .collect())
    }

    async fn update_location(&self, driver_id: DriverId, location: GeoPoint) -> DispatchResult<()> {
        let mut state = self.state();
        let ambulance = state
            .ambulance_of_mut(driver_id)
            .ok_or_else(|| DispatchError::NotFound(format!("ambulance for driver {driver_id}")))?;
        ambulance.location = location;
        ambulance.last_updated = Utc::now();
        Ok(())
    }

    async fn set_availability(&self, driver_id: DriverId, status: Availability) -> DispatchResult<()> {
        let mut state = self.state();
        let driver = state
            .drivers
            .get_mut(&driver_id)
            .ok_or_else(|| DispatchError::NotFound(format!("driver {driver_id}")))?;
        driver.status = status;
        if let Some(ambulance) = state.ambulance_of_mut(driver_id) {
            ambulance.status = status;
        }
        Ok(())
    }
}

#[async_trait]
impl DispatchStore for MemoryStore {
    async fn insert_report(&self, report: &NewReport, location: GeoPoint, now: DateTime<Utc>) -> DispatchResult<Report> {
        let mut state = self.state();
        state.next_report += 1;
        let stored = Report {
            id: ReportId(state.next_report),
            reporter_id: report.reporter_id,
            kind: report.kind,
            location,
            photo_ref: report.photo_ref.clone(),
            description: report.description.clone(),
            destination: report.destination.clone(),
            status: ReportStatus::Pending,
            created_at: now,
        };
        state.reports.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn report(&self, report_id: ReportId) -> DispatchResult<Option<Report>> {
        Ok(self.state().reports.get(&report_id).cloned())
    }

    async fn close_report(&self, report_id: ReportId, status: ReportStatus) -> DispatchResult<bool> {
        let mut state = self.state();
        let report = state
            .reports
            .get_mut(&report_id)
            .ok_or_else(|| DispatchError::NotFound(format!("report {report_id}")))?;
        if report.status.is_terminal() {
            return Ok(false);
        }
        report.status = status;
        Ok(true)
    }

    async fn create_assignment(
        &self,
        report_id: ReportId,
        candidate: &FleetCandidate,
        now: DateTime<Utc>,
    ) -> DispatchResult<Assignment> {
        let mut state = self.state();
        if !state.reports.contains_key(&report_id) {
            return Err(DispatchError::NotFound(format!("report {report_id}")));
        }
        let active = state
            .assignments
            .values()
            .any(|a| a.report_id == report_id && a.status.is_active());
        if active {
            return Err(DispatchError::ActiveAssignmentExists { report_id });
        }
        state.next_assignment += 1;
        let assignment = Assignment {
            id: AssignmentId(state.next_assignment),
            report_id,
            driver_id: candidate.driver_id,
            ambulance_id: candidate.ambulance_id,
            status: AssignmentStatus::Pending,
            created_at: now,
            responded_at: None,
        };
        state.assignments.insert(assignment.id, assignment.clone());
        Ok(assignment)
    }

    async fn assignment(&self, assignment_id: AssignmentId) -> DispatchResult<Option<Assignment>> {
        Ok(self.state().assignments.get(&assignment_id).cloned())
    }

    async fn assignments_for_report(&self, report_id: ReportId) -> DispatchResult<Vec<Assignment>> {
        Ok(self
            .state()
            .assignments
            .values()
            .filter(|a| a.report_id == report_id)
            .cloned()
            .collect())
    }

    async fn pending_assignments_for_driver(&self, driver_id: DriverId) -> DispatchResult<Vec<Assignment>> {
        Ok(self
            .state()
            .assignments
            .values()
            .filter(|a| a.driver_id == driver_id && a.status == AssignmentStatus::Pending)
            .cloned()
            .collect())
    }

    async fn pending_assignments_before(&self, cutoff: DateTime<Utc>) -> DispatchResult<Vec<Assignment>> {
        Ok(self
            .state()
            .assignments
            .values()
            .filter(|a| a.status == AssignmentStatus::Pending && a.created_at <= cutoff)
            .cloned()
            .collect())
    }

    async fn cancel_assignment(&self, assignment_id: AssignmentId, now: DateTime<Utc>) -> DispatchResult<Assignment> {
        let mut state = self.state();
        let assignment = state
            .assignments
            .get_mut(&assignment_id)
            .ok_or_else(|| DispatchError::NotFound(format!("assignment {assignment_id}")))?;
        if assignment.status != AssignmentStatus::Pending {
            return Err(DispatchError::StaleAssignment {
                assignment_id,
                status: assignment.status,
            });
        }
        assignment.status = AssignmentStatus::Cancelled;
        assignment.responded_at = Some(now);
        Ok(assignment.clone())
    }

    async fn commit_acceptance(&self, assignment_id: AssignmentId, now: DateTime<Utc>) -> DispatchResult<DispatchRecord> {
        let mut state = self.state();
        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            return Err(DispatchError::TransientStoreFailure(
                "injected commit failure".to_string(),
            ));
        }

        // validate everything before touching anything
        let assignment = state
            .assignments
            .get(&assignment_id)
            .cloned()
            .ok_or_else(|| DispatchError::NotFound(format!("assignment {assignment_id}")))?;
        if assignment.status != AssignmentStatus::Pending {
            return Err(DispatchError::StaleAssignment {
                assignment_id,
                status: assignment.status,
            });
        }
        let report_pending = state
            .reports
            .get(&assignment.report_id)
            .is_some_and(|r| r.status == ReportStatus::Pending);
        if !report_pending {
            return Err(DispatchError::StaleAssignment {
                assignment_id,
                status: assignment.status,
            });
        }

        if let Some(stored) = state.assignments.get_mut(&assignment_id) {
            stored.status = AssignmentStatus::Accepted;
            stored.responded_at = Some(now);
        }
        if let Some(report) = state.reports.get_mut(&assignment.report_id) {
            report.status = ReportStatus::Assigned;
        }
        if let Some(driver) = state.drivers.get_mut(&assignment.driver_id) {
            driver.status = Availability::Busy;
        }
        if let Some(ambulance) = state.ambulances.get_mut(&assignment.ambulance_id) {
            ambulance.status = Availability::Busy;
        }
        Ok(state
            .ledger
            .append(assignment.ambulance_id, assignment.report_id, assignment_id, now))
    }

    async fn complete_assignment(&self, assignment_id: AssignmentId) -> DispatchResult<Assignment> {
        let mut state = self.state();
        let assignment = state
            .assignments
            .get_mut(&assignment_id)
            .ok_or_else(|| DispatchError::NotFound(format!("assignment {assignment_id}")))?;
        if assignment.status != AssignmentStatus::Accepted {
            return Err(DispatchError::StaleAssignment {
                assignment_id,
                status: assignment.status,
            });
        }
        assignment.status = AssignmentStatus::Completed;
        let completed = assignment.clone();

        if let Some(driver) = state.drivers.get_mut(&completed.driver_id) {
            driver.status = Availability::Available;
        }
        if let Some(ambulance) = state.ambulances.get_mut(&completed.ambulance_id) {
            ambulance.status = Availability::Available;
        }
        Ok(completed)
    }

    async fn stranded_reports(&self, cutoff: DateTime<Utc>) -> DispatchResult<Vec<ReportId>> {
        let state = self.state();
        let mut stranded: Vec<&Report> = state
            .reports
            .values()
            .filter(|r| r.status == ReportStatus::Pending && r.created_at <= cutoff)
            .filter(|r| {
                !state
                    .assignments
                    .values()
                    .any(|a| a.report_id == r.id && a.status.is_active())
            })
            .collect();
        stranded.sort_by_key(|r| r.id);
        Ok(stranded.into_iter().map(|r| r.id).collect())
    }

    async fn dispatch_records_for_report(&self, report_id: ReportId) -> DispatchResult<Vec<DispatchRecord>> {
        Ok(self.state().ledger.for_report(report_id))
    }
}
