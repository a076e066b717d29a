//! # Assignment Lifecycle Manager
//!
//! Owns the per-report state machine:
//!
//! ```text
//! create ──► no candidate ──────────────────────────────► Unassignable
//!        └─► Pending assignment ─ accept ─► Accepted ───► report Assigned (+ dispatch record)
//!                                └ cancel / timeout ─► Cancelled
//!                                     ├─ attempts >= cap ─► report Unassignable
//!                                     ├─ no candidate ────► report Unassignable
//!                                     └─ new Pending assignment
//! Accepted ─ complete ─► Completed (driver and ambulance Available again)
//! ```
//!
//! Transitions on one report are serialized by a per-report async mutex;
//! different reports proceed in parallel. The store re-checks every
//! precondition inside its own atomic step, so the lock only keeps callers
//! from racing each other into stale errors.
//!
//! Notifications are queued after the state change is committed and never
//! affect its outcome.
//!
//! Matching and rematching are retried as whole steps on transient store
//! failures. A report whose retries all failed stays Pending with no active
//! assignment; [`AssignmentManager::recover_stranded`] picks it up later.

use crate::configs::{DispatchPolicy, NotifyMode};
use crate::engine::dispatcher::Notifier;
use crate::engine::fleet::Availability;
use crate::engine::ledger::DispatchRecord;
use crate::engine::model::{
    Assignment, AssignmentId, AssignmentStatus, DriverAction, DriverId, NewReport, Report,
    ReportId, ReportStatus, ReportSummary,
};
use crate::engine::selector::select_nearest_excluding;
use crate::errors::{DispatchError, DispatchResult};
use crate::store::DispatchStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Age a Pending report must reach before recovery treats it as stranded.
/// Covers the gap between inserting a report and matching it.
const STRANDED_GRACE_SECS: i64 = 10;

/// Result of a successful `create_report`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCreated {
    /// The new report.
    pub report_id: ReportId,
    /// Its first assignment.
    pub assignment_id: AssignmentId,
    /// Driver the report was matched to.
    pub driver_id: DriverId,
}

/// What a driver action (or a timeout) led to.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// The driver accepted; the ambulance is dispatched.
    Accepted {
        /// The ledger entry written by the acceptance.
        dispatch: DispatchRecord,
    },
    /// The report was matched again after a cancellation or a recovery sweep.
    Reassigned {
        /// The new Pending assignment.
        assignment: Assignment,
    },
    /// The assignment was cancelled and the report hit the cancellation cap.
    Exhausted {
        /// Assignments created for the report.
        attempts: u32,
    },
    /// The assignment was cancelled and nobody else is available.
    Unassignable,
}

/// A Pending assignment together with the report it asks about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAssignment {
    /// The assignment to accept or cancel.
    pub assignment_id: AssignmentId,
    /// Public report fields.
    #[serde(flatten)]
    pub report: ReportSummary,
}

#[derive(Default)]
struct ReportLocks {
    locks: StdMutex<HashMap<ReportId, Arc<Mutex<()>>>>,
}

impl ReportLocks {
    async fn acquire(&self, report_id: ReportId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(report_id).or_default())
        };
        lock.lock_owned().await
    }

    /// Drops the entry once the report is terminal; later callers fail in the store.
    fn release(&self, report_id: ReportId) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&report_id);
    }
}

/// The state machine driver. Cheap to share behind an `Arc`.
pub struct AssignmentManager {
    store: Arc<dyn DispatchStore>,
    notifier: Arc<dyn Notifier>,
    policy: DispatchPolicy,
    locks: ReportLocks,
}

impl AssignmentManager {
    /// Wires the manager to its store and notification channel.
    pub fn new(store: Arc<dyn DispatchStore>, notifier: Arc<dyn Notifier>, policy: DispatchPolicy) -> Self {
        Self {
            store,
            notifier,
            policy,
            locks: ReportLocks::default(),
        }
    }

    /// The active policy.
    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn DispatchStore> {
        &self.store
    }

    /// Validates and persists a report, then matches it to the nearest
    /// available ambulance.
    ///
    /// With no candidate the report is left `Unassignable` and the caller gets
    /// [`DispatchError::NoCapacity`].
    pub async fn create_report(&self, new_report: NewReport) -> DispatchResult<ReportCreated> {
        let location = new_report.validate()?;
        let report = self.store.insert_report(&new_report, location, Utc::now()).await?;
        info!(report_id = %report.id, kind = report.kind.as_str(), "Report created");

        let _guard = self.locks.acquire(report.id).await;
        match self.with_retry("match_report", || self.match_report(&report, &[])).await {
            Ok(assignment) => Ok(ReportCreated {
                report_id: report.id,
                assignment_id: assignment.id,
                driver_id: assignment.driver_id,
            }),
            Err(e) => {
                if e.is_capacity() {
                    self.locks.release(report.id);
                }
                Err(e)
            }
        }
    }

    /// Applies a driver's accept or cancel to one of their Pending assignments.
    pub async fn driver_action(
        &self,
        driver_id: DriverId,
        assignment_id: AssignmentId,
        action: DriverAction,
    ) -> DispatchResult<ActionOutcome> {
        let report_id = self.owned_assignment(driver_id, assignment_id).await?.report_id;
        let _guard = self.locks.acquire(report_id).await;

        let current = self.owned_assignment(driver_id, assignment_id).await?;
        if current.status != AssignmentStatus::Pending {
            return Err(DispatchError::StaleAssignment {
                assignment_id,
                status: current.status,
            });
        }

        match action {
            DriverAction::Accept => {
                let dispatch = self
                    .with_retry("commit_acceptance", || {
                        self.store.commit_acceptance(assignment_id, Utc::now())
                    })
                    .await?;
                self.locks.release(report_id);
                info!(
                    %report_id, %assignment_id, %driver_id,
                    ambulance_id = %dispatch.ambulance_id,
                    "Assignment accepted, ambulance dispatched"
                );
                Ok(ActionOutcome::Accepted { dispatch })
            }
            DriverAction::Cancel => {
                self.with_retry("cancel_assignment", || {
                    self.store.cancel_assignment(assignment_id, Utc::now())
                })
                .await?;
                info!(%report_id, %assignment_id, %driver_id, "Assignment cancelled by driver");
                if self.policy.release_on_cancel {
                    // the cancel is committed; the rematch must run either way
                    match self
                        .with_retry("set_availability", || {
                            self.store.set_availability(driver_id, Availability::Offline)
                        })
                        .await
                    {
                        Ok(()) => debug!(%driver_id, "Cancelling driver marked Offline"),
                        Err(e) => warn!(%driver_id, error = %e, "Failed to mark cancelling driver Offline"),
                    }
                }
                self.after_cancellation(report_id).await
            }
        }
    }

    /// Closes an accepted job and returns its driver to the available fleet.
    ///
    /// Only an Accepted assignment can be completed, once; a replay fails with
    /// [`DispatchError::StaleAssignment`] and leaves the fleet untouched.
    pub async fn complete(&self, driver_id: DriverId, assignment_id: AssignmentId) -> DispatchResult<()> {
        let report_id = self.owned_assignment(driver_id, assignment_id).await?.report_id;
        let guard = self.locks.acquire(report_id).await;
        let result = self
            .with_retry("complete_assignment", || self.store.complete_assignment(assignment_id))
            .await;
        drop(guard);
        // the report was already terminal; nothing else will take this lock
        self.locks.release(report_id);

        let completed = result?;
        info!(
            %driver_id, %assignment_id,
            report_id = %completed.report_id,
            "Job completed, driver available"
        );
        Ok(())
    }

    /// Pending assignments for the driver whose report still waits for an answer.
    pub async fn pending_for_driver(&self, driver_id: DriverId) -> DispatchResult<Vec<PendingAssignment>> {
        let mut pending = Vec::new();
        for assignment in self.store.pending_assignments_for_driver(driver_id).await? {
            match self.store.report(assignment.report_id).await? {
                Some(report) if report.status == ReportStatus::Pending => pending.push(PendingAssignment {
                    assignment_id: assignment.id,
                    report: report.summary(),
                }),
                _ => {}
            }
        }
        Ok(pending)
    }

    /// Cancels Pending assignments that outlived the response timeout and
    /// rematches their reports exactly as a driver cancellation would.
    ///
    /// Does nothing when no timeout is configured.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> DispatchResult<Vec<(AssignmentId, ActionOutcome)>> {
        let Some(timeout) = self.policy.response_timeout() else {
            return Ok(Vec::new());
        };
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return Ok(Vec::new());
        };
        let cutoff = now - timeout;

        let mut expired = Vec::new();
        for candidate in self.store.pending_assignments_before(cutoff).await? {
            let _guard = self.locks.acquire(candidate.report_id).await;

            // a driver may have answered while we waited for the lock
            match self.store.cancel_assignment(candidate.id, now).await {
                Ok(_) => {}
                Err(DispatchError::StaleAssignment { .. }) => continue,
                Err(e) => return Err(e),
            }
            warn!(
                report_id = %candidate.report_id,
                assignment_id = %candidate.id,
                driver_id = %candidate.driver_id,
                "Assignment timed out without a response"
            );
            let outcome = self.after_cancellation(candidate.report_id).await?;
            expired.push((candidate.id, outcome));
        }
        Ok(expired)
    }

    /// Rematches Pending reports left without an active assignment, typically
    /// by a rematch whose store retries all failed.
    ///
    /// Reports younger than a short grace period are skipped so a creation in
    /// progress is never raced. Cap and exclusion rules apply as after a
    /// cancellation.
    pub async fn recover_stranded(&self, now: DateTime<Utc>) -> DispatchResult<Vec<(ReportId, ActionOutcome)>> {
        let cutoff = now - chrono::Duration::seconds(STRANDED_GRACE_SECS);

        let mut recovered = Vec::new();
        for report_id in self.store.stranded_reports(cutoff).await? {
            let _guard = self.locks.acquire(report_id).await;

            // another caller may have matched or closed it meanwhile
            let Some(report) = self.store.report(report_id).await? else {
                continue;
            };
            if report.status != ReportStatus::Pending {
                continue;
            }
            let history = self.store.assignments_for_report(report_id).await?;
            if history.iter().any(|a| a.status.is_active()) {
                continue;
            }

            warn!(%report_id, attempts = history.len(), "Pending report has no live assignment, rematching");
            let outcome = self.after_cancellation(report_id).await?;
            recovered.push((report_id, outcome));
        }
        Ok(recovered)
    }

    /// Matches a Pending report against the current fleet and records the assignment.
    async fn match_report(&self, report: &Report, excluded: &[DriverId]) -> DispatchResult<Assignment> {
        let fleet = self.store.available_fleet().await?;
        let Some(candidate) = select_nearest_excluding(&report.location, &fleet, excluded) else {
            self.store.close_report(report.id, ReportStatus::Unassignable).await?;
            warn!(report_id = %report.id, fleet = fleet.len(), "No available ambulance, report unassignable");
            return Err(DispatchError::NoCapacity { report_id: report.id });
        };

        let assignment = self.store.create_assignment(report.id, &candidate, Utc::now()).await?;
        info!(
            report_id = %report.id,
            assignment_id = %assignment.id,
            driver_id = %assignment.driver_id,
            ambulance_id = %assignment.ambulance_id,
            distance_km = report.location.distance_km(&candidate.location),
            "Report matched"
        );
        self.notify(report, &assignment);
        Ok(assignment)
    }

    /// Counts attempts after a cancellation and either gives up or rematches.
    async fn after_cancellation(&self, report_id: ReportId) -> DispatchResult<ActionOutcome> {
        match self.with_retry("rematch", || self.rematch(report_id)).await {
            Ok(assignment) => Ok(ActionOutcome::Reassigned { assignment }),
            Err(DispatchError::CapacityExhausted { attempts, .. }) => {
                self.locks.release(report_id);
                Ok(ActionOutcome::Exhausted { attempts })
            }
            Err(DispatchError::NoCapacity { .. }) => {
                self.locks.release(report_id);
                Ok(ActionOutcome::Unassignable)
            }
            Err(e) => Err(e),
        }
    }

    async fn rematch(&self, report_id: ReportId) -> DispatchResult<Assignment> {
        let history = self.store.assignments_for_report(report_id).await?;
        let attempts = history.len() as u32;
        if attempts >= self.policy.cancellation_cap {
            self.store.close_report(report_id, ReportStatus::Unassignable).await?;
            warn!(%report_id, attempts, "Cancellation cap reached, report given up");
            return Err(DispatchError::CapacityExhausted { report_id, attempts });
        }

        let report = self
            .store
            .report(report_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("report {report_id}")))?;
        let excluded: Vec<DriverId> = if self.policy.exclude_cancelled_drivers {
            history
                .iter()
                .filter(|a| a.status == AssignmentStatus::Cancelled)
                .map(|a| a.driver_id)
                .collect()
        } else {
            Vec::new()
        };
        debug!(%report_id, attempts, excluded = excluded.len(), "Rematching report");
        self.match_report(&report, &excluded).await
    }

    fn notify(&self, report: &Report, assignment: &Assignment) {
        let summary = report.summary();
        match self.policy.notify_mode {
            NotifyMode::AssignedDriver => self.notifier.notify(assignment.driver_id, summary),
            NotifyMode::Broadcast => self.notifier.broadcast(summary),
        }
    }

    /// Loads an assignment, hiding other drivers' assignments as not found.
    async fn owned_assignment(&self, driver_id: DriverId, assignment_id: AssignmentId) -> DispatchResult<Assignment> {
        match self.store.assignment(assignment_id).await? {
            Some(assignment) if assignment.driver_id == driver_id => Ok(assignment),
            _ => Err(DispatchError::Unauthorized { assignment_id }),
        }
    }

    /// Runs a whole store step again after transient failures, with backoff.
    async fn with_retry<T, F, Fut>(&self, step: &'static str, mut run: F) -> DispatchResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DispatchResult<T>>,
    {
        let attempts = self.policy.store_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match run().await {
                Err(e) if e.is_transient() && attempt < attempts => {
                    let backoff = self.policy.retry_backoff(attempt);
                    warn!(step, attempt, error = %e, backoff_ms = backoff.as_millis() as u64, "Transient store failure, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}
