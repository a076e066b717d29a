//! # PostgreSQL Dispatch Store
//!
//! Durable [`DispatchStore`] over a `deadpool_postgres` pool. Transitions that
//! touch more than one row run inside a single transaction; dropping the
//! transaction on an early return rolls it back.
//!
//! Expected tables (created and migrated outside this crate):
//!
//! ```text
//! reports            (report_id BIGSERIAL, user_id BIGINT, type TEXT, latitude FLOAT8,
//!                     longitude FLOAT8, photo_url TEXT, description TEXT,
//!                     destination TEXT, status TEXT, created_at TIMESTAMPTZ)
//! report_assignments (assignment_id BIGSERIAL, report_id BIGINT, driver_id BIGINT,
//!                     ambulance_id BIGINT, status TEXT, created_at TIMESTAMPTZ,
//!                     response_time TIMESTAMPTZ NULL)
//! drivers            (driver_id BIGINT, status TEXT)
//! ambulances         (ambulance_id BIGINT, driver_id BIGINT, latitude FLOAT8,
//!                     longitude FLOAT8, status TEXT, last_updated TIMESTAMPTZ)
//! dispatch_records   (dispatch_id BIGSERIAL, ambulance_id BIGINT, report_id BIGINT,
//!                     assignment_id BIGINT, dispatch_status TEXT, dispatched_at TIMESTAMPTZ)
//! ```

use super::DispatchStore;
use crate::engine::fleet::{Availability, FleetCandidate, FleetRegistry};
use crate::engine::geo::GeoPoint;
use crate::engine::ledger::{DispatchRecord, DispatchStatus};
use crate::engine::model::{
    AmbulanceId, Assignment, AssignmentId, AssignmentStatus, DispatchId, DriverId, NewReport,
    Report, ReportId, ReportKind, ReportStatus, UserId,
};
use crate::errors::{DispatchError, DispatchResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config as DeadpoolConfig, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use std::fmt::Display;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};

const REPORT_COLUMNS: &str =
    "report_id, user_id, type, latitude, longitude, photo_url, description, destination, status, created_at";
const ASSIGNMENT_COLUMNS: &str =
    "assignment_id, report_id, driver_id, ambulance_id, status, created_at, response_time";
const DISPATCH_COLUMNS: &str =
    "dispatch_id, ambulance_id, report_id, assignment_id, dispatch_status, dispatched_at";

fn store_err<E: Display>(e: E) -> DispatchError {
    DispatchError::TransientStoreFailure(e.to_string())
}

fn label<T>(value: &str, parsed: Option<T>) -> DispatchResult<T> {
    parsed.ok_or_else(|| DispatchError::TransientStoreFailure(format!("unknown status label '{value}'")))
}

fn report_from_row(row: &Row) -> DispatchResult<Report> {
    let kind: String = row.try_get("type").map_err(store_err)?;
    let status: String = row.try_get("status").map_err(store_err)?;
    Ok(Report {
        id: ReportId(row.try_get("report_id").map_err(store_err)?),
        reporter_id: UserId(row.try_get("user_id").map_err(store_err)?),
        kind: label(&kind, ReportKind::parse(&kind))?,
        location: GeoPoint {
            latitude: row.try_get("latitude").map_err(store_err)?,
            longitude: row.try_get("longitude").map_err(store_err)?,
        },
        photo_ref: row.try_get("photo_url").map_err(store_err)?,
        description: row.try_get("description").map_err(store_err)?,
        destination: row.try_get("destination").map_err(store_err)?,
        status: label(&status, ReportStatus::parse(&status))?,
        created_at: row.try_get("created_at").map_err(store_err)?,
    })
}

fn assignment_from_row(row: &Row) -> DispatchResult<Assignment> {
    let status: String = row.try_get("status").map_err(store_err)?;
    Ok(Assignment {
        id: AssignmentId(row.try_get("assignment_id").map_err(store_err)?),
        report_id: ReportId(row.try_get("report_id").map_err(store_err)?),
        driver_id: DriverId(row.try_get("driver_id").map_err(store_err)?),
        ambulance_id: AmbulanceId(row.try_get("ambulance_id").map_err(store_err)?),
        status: label(&status, AssignmentStatus::parse(&status))?,
        created_at: row.try_get("created_at").map_err(store_err)?,
        responded_at: row.try_get("response_time").map_err(store_err)?,
    })
}

fn dispatch_from_row(row: &Row) -> DispatchResult<DispatchRecord> {
    Ok(DispatchRecord {
        id: DispatchId(row.try_get("dispatch_id").map_err(store_err)?),
        ambulance_id: AmbulanceId(row.try_get("ambulance_id").map_err(store_err)?),
        report_id: ReportId(row.try_get("report_id").map_err(store_err)?),
        assignment_id: AssignmentId(row.try_get("assignment_id").map_err(store_err)?),
        status: DispatchStatus::Dispatched,
        dispatched_at: row.try_get("dispatched_at").map_err(store_err)?,
    })
}

/// A pooled PostgreSQL store.
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Creates the connection pool. Connections are opened lazily.
    pub fn connect(database_url: &str, max_connections: usize) -> DispatchResult<Self> {
        let mut config = DeadpoolConfig::new();
        config.url = Some(database_url.to_string());
        config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        config.pool = Some(PoolConfig::new(max_connections));
        let pool = config.create_pool(Some(Runtime::Tokio1), NoTls).map_err(store_err)?;
        info!(max_connections, "PostgreSQL dispatch store pool created");
        Ok(Self { pool })
    }

    /// Checks connectivity with a trivial query.
    pub async fn ping(&self) -> DispatchResult<()> {
        let client = self.pool.get().await.map_err(store_err)?;
        client.simple_query("SELECT 1").await.map_err(store_err)?;
        Ok(())
    }

    async fn assignment_status(&self, assignment_id: AssignmentId) -> DispatchResult<AssignmentStatus> {
        self.assignment(assignment_id)
            .await?
            .map(|a| a.status)
            .ok_or_else(|| DispatchError::NotFound(format!("assignment {assignment_id}")))
    }

    async fn assignments_where(&self, predicate: &str, param: &(dyn tokio_postgres::types::ToSql + Sync)) -> DispatchResult<Vec<Assignment>> {
        let client = self.pool.get().await.map_err(store_err)?;
        let sql = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM report_assignments WHERE {predicate} ORDER BY assignment_id"
        );
        let rows = client.query(sql.as_str(), &[param]).await.map_err(store_err)?;
        rows.iter().map(assignment_from_row).collect()
    }
}

#[async_trait]
impl FleetRegistry for PostgresStore {
    async fn available_fleet(&self) -> DispatchResult<Vec<FleetCandidate>> {
        let client = self.pool.get().await.map_err(store_err)?;
        let rows = client
            .query(
                "SELECT a.ambulance_id, a.driver_id, a.latitude, a.longitude
                 FROM ambulances a
                 JOIN drivers d ON a.driver_id = d.driver_id
                 WHERE a.status = 'Available' AND d.status = 'Available'
                 ORDER BY a.ambulance_id",
                &[],
            )
            .await
            .map_err(store_err)?;
        rows.iter()
            .map(|row| {
                Ok(FleetCandidate {
                    ambulance_id: AmbulanceId(row.try_get("ambulance_id").map_err(store_err)?),
                    driver_id: DriverId(row.try_get("driver_id").map_err(store_err)?),
                    location: GeoPoint {
                        latitude: row.try_get("latitude").map_err(store_err)?,
                        longitude: row.try_get("longitude").map_err(store_err)?,
                    },
                })
            })
            .collect()
    }

    async fn update_location(&self, driver_id: DriverId, location: GeoPoint) -> DispatchResult<()> {
        let client = self.pool.get().await.map_err(store_err)?;
        let updated = client
            .execute(
                "UPDATE ambulances SET latitude = $2, longitude = $3, last_updated = NOW() WHERE driver_id = $1",
                &[&driver_id.0, &location.latitude, &location.longitude],
            )
            .await
            .map_err(store_err)?;
        if updated == 0 {
            return Err(DispatchError::NotFound(format!("ambulance for driver {driver_id}")));
        }
        Ok(())
    }

    async fn set_availability(&self, driver_id: DriverId, status: Availability) -> DispatchResult<()> {
        let mut client = self.pool.get().await.map_err(store_err)?;
        let tx = client.transaction().await.map_err(store_err)?;
        let updated = tx
            .execute(
                "UPDATE drivers SET status = $2 WHERE driver_id = $1",
                &[&driver_id.0, &status.as_str()],
            )
            .await
            .map_err(store_err)?;
        if updated == 0 {
            return Err(DispatchError::NotFound(format!("driver {driver_id}")));
        }
        tx.execute(
            "UPDATE ambulances SET status = $2 WHERE driver_id = $1",
            &[&driver_id.0, &status.as_str()],
        )
        .await
        .map_err(store_err)?;
        tx.commit().await.map_err(store_err)
    }
}

#[async_trait]
impl DispatchStore for PostgresStore {
    async fn insert_report(&self, report: &NewReport, location: GeoPoint, now: DateTime<Utc>) -> DispatchResult<Report> {
        let client = self.pool.get().await.map_err(store_err)?;
        let sql = format!(
            "INSERT INTO reports (user_id, type, latitude, longitude, photo_url, description, destination, status, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'Pending', $8)
             RETURNING {REPORT_COLUMNS}"
        );
        let row = client
            .query_one(
                sql.as_str(),
                &[
                    &report.reporter_id.0,
                    &report.kind.as_str(),
                    &location.latitude,
                    &location.longitude,
                    &report.photo_ref,
                    &report.description,
                    &report.destination,
                    &now,
                ],
            )
            .await
            .map_err(store_err)?;
        report_from_row(&row)
    }

    async fn report(&self, report_id: ReportId) -> DispatchResult<Option<Report>> {
        let client = self.pool.get().await.map_err(store_err)?;
        let sql = format!("SELECT {REPORT_COLUMNS} FROM reports WHERE report_id = $1");
        let row = client.query_opt(sql.as_str(), &[&report_id.0]).await.map_err(store_err)?;
        row.as_ref().map(report_from_row).transpose()
    }

    async fn close_report(&self, report_id: ReportId, status: ReportStatus) -> DispatchResult<bool> {
        let client = self.pool.get().await.map_err(store_err)?;
        let updated = client
            .execute(
                "UPDATE reports SET status = $2 WHERE report_id = $1 AND status = 'Pending'",
                &[&report_id.0, &status.as_str()],
            )
            .await
            .map_err(store_err)?;
        Ok(updated == 1)
    }

    async fn create_assignment(
        &self,
        report_id: ReportId,
        candidate: &FleetCandidate,
        now: DateTime<Utc>,
    ) -> DispatchResult<Assignment> {
        let mut client = self.pool.get().await.map_err(store_err)?;
        let tx = client.transaction().await.map_err(store_err)?;

        // the report row lock serializes concurrent creators for the same report
        let locked = tx
            .query_opt("SELECT report_id FROM reports WHERE report_id = $1 FOR UPDATE", &[&report_id.0])
            .await
            .map_err(store_err)?;
        if locked.is_none() {
            return Err(DispatchError::NotFound(format!("report {report_id}")));
        }
        let active: i64 = tx
            .query_one(
                "SELECT COUNT(*) FROM report_assignments
                 WHERE report_id = $1 AND status IN ('Pending', 'Accepted')",
                &[&report_id.0],
            )
            .await
            .map_err(store_err)?
            .try_get(0)
            .map_err(store_err)?;
        if active > 0 {
            return Err(DispatchError::ActiveAssignmentExists { report_id });
        }

        let sql = format!(
            "INSERT INTO report_assignments (report_id, driver_id, ambulance_id, status, created_at)
             VALUES ($1, $2, $3, 'Pending', $4)
             RETURNING {ASSIGNMENT_COLUMNS}"
        );
        let row = tx
            .query_one(
                sql.as_str(),
                &[&report_id.0, &candidate.driver_id.0, &candidate.ambulance_id.0, &now],
            )
            .await
            .map_err(store_err)?;
        let assignment = assignment_from_row(&row)?;
        tx.commit().await.map_err(store_err)?;
        Ok(assignment)
    }

    async fn assignment(&self, assignment_id: AssignmentId) -> DispatchResult<Option<Assignment>> {
        let client = self.pool.get().await.map_err(store_err)?;
        let sql = format!("SELECT {ASSIGNMENT_COLUMNS} FROM report_assignments WHERE assignment_id = $1");
        let row = client.query_opt(sql.as_str(), &[&assignment_id.0]).await.map_err(store_err)?;
        row.as_ref().map(assignment_from_row).transpose()
    }

    async fn assignments_for_report(&self, report_id: ReportId) -> DispatchResult<Vec<Assignment>> {
        self.assignments_where("report_id = $1", &report_id.0).await
    }

    async fn pending_assignments_for_driver(&self, driver_id: DriverId) -> DispatchResult<Vec<Assignment>> {
        self.assignments_where("driver_id = $1 AND status = 'Pending'", &driver_id.0).await
    }

    async fn pending_assignments_before(&self, cutoff: DateTime<Utc>) -> DispatchResult<Vec<Assignment>> {
        self.assignments_where("status = 'Pending' AND created_at <= $1", &cutoff).await
    }

    async fn cancel_assignment(&self, assignment_id: AssignmentId, now: DateTime<Utc>) -> DispatchResult<Assignment> {
        let client = self.pool.get().await.map_err(store_err)?;
        let sql = format!(
            "UPDATE report_assignments SET status = 'Cancelled', response_time = $2
             WHERE assignment_id = $1 AND status = 'Pending'
             RETURNING {ASSIGNMENT_COLUMNS}"
        );
        let row = client.query_opt(sql.as_str(), &[&assignment_id.0, &now]).await.map_err(store_err)?;
        match row {
            Some(row) => assignment_from_row(&row),
            None => Err(DispatchError::StaleAssignment {
                assignment_id,
                status: self.assignment_status(assignment_id).await?,
            }),
        }
    }

    async fn commit_acceptance(&self, assignment_id: AssignmentId, now: DateTime<Utc>) -> DispatchResult<DispatchRecord> {
        let mut client = self.pool.get().await.map_err(store_err)?;
        let tx = client.transaction().await.map_err(store_err)?;

        let accepted = tx
            .query_opt(
                "UPDATE report_assignments SET status = 'Accepted', response_time = $2
                 WHERE assignment_id = $1 AND status = 'Pending'
                 RETURNING report_id, driver_id, ambulance_id",
                &[&assignment_id.0, &now],
            )
            .await
            .map_err(store_err)?;
        let Some(accepted) = accepted else {
            drop(tx);
            return Err(DispatchError::StaleAssignment {
                assignment_id,
                status: self.assignment_status(assignment_id).await?,
            });
        };
        let report_id: i64 = accepted.try_get("report_id").map_err(store_err)?;
        let driver_id: i64 = accepted.try_get("driver_id").map_err(store_err)?;
        let ambulance_id: i64 = accepted.try_get("ambulance_id").map_err(store_err)?;

        let assigned = tx
            .execute(
                "UPDATE reports SET status = 'Assigned' WHERE report_id = $1 AND status = 'Pending'",
                &[&report_id],
            )
            .await
            .map_err(store_err)?;
        if assigned == 0 {
            return Err(DispatchError::StaleAssignment {
                assignment_id,
                status: AssignmentStatus::Pending,
            });
        }

        tx.execute("UPDATE drivers SET status = 'Busy' WHERE driver_id = $1", &[&driver_id])
            .await
            .map_err(store_err)?;
        tx.execute("UPDATE ambulances SET status = 'Busy' WHERE ambulance_id = $1", &[&ambulance_id])
            .await
            .map_err(store_err)?;

        let sql = format!(
            "INSERT INTO dispatch_records (ambulance_id, report_id, assignment_id, dispatch_status, dispatched_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {DISPATCH_COLUMNS}"
        );
        let row = tx
            .query_one(
                sql.as_str(),
                &[
                    &ambulance_id,
                    &report_id,
                    &assignment_id.0,
                    &DispatchStatus::Dispatched.as_str(),
                    &now,
                ],
            )
            .await
            .map_err(store_err)?;
        let record = dispatch_from_row(&row)?;
        tx.commit().await.map_err(store_err)?;
        debug!(%assignment_id, report_id, "Acceptance committed");
        Ok(record)
    }

    async fn complete_assignment(&self, assignment_id: AssignmentId) -> DispatchResult<Assignment> {
        let mut client = self.pool.get().await.map_err(store_err)?;
        let tx = client.transaction().await.map_err(store_err)?;

        let sql = format!(
            "UPDATE report_assignments SET status = 'Completed'
             WHERE assignment_id = $1 AND status = 'Accepted'
             RETURNING {ASSIGNMENT_COLUMNS}"
        );
        let row = tx.query_opt(sql.as_str(), &[&assignment_id.0]).await.map_err(store_err)?;
        let Some(row) = row else {
            drop(tx);
            return Err(DispatchError::StaleAssignment {
                assignment_id,
                status: self.assignment_status(assignment_id).await?,
            });
        };
        let completed = assignment_from_row(&row)?;

        tx.execute(
            "UPDATE drivers SET status = 'Available' WHERE driver_id = $1",
            &[&completed.driver_id.0],
        )
        .await
        .map_err(store_err)?;
        tx.execute(
            "UPDATE ambulances SET status = 'Available' WHERE ambulance_id = $1",
            &[&completed.ambulance_id.0],
        )
        .await
        .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        debug!(%assignment_id, "Completion committed");
        Ok(completed)
    }

    async fn stranded_reports(&self, cutoff: DateTime<Utc>) -> DispatchResult<Vec<ReportId>> {
        let client = self.pool.get().await.map_err(store_err)?;
        let rows = client
            .query(
                "SELECT r.report_id FROM reports r
                 WHERE r.status = 'Pending' AND r.created_at <= $1
                   AND NOT EXISTS (
                       SELECT 1 FROM report_assignments a
                       WHERE a.report_id = r.report_id AND a.status IN ('Pending', 'Accepted'))
                 ORDER BY r.report_id",
                &[&cutoff],
            )
            .await
            .map_err(store_err)?;
        rows.iter()
            .map(|row| Ok(ReportId(row.try_get("report_id").map_err(store_err)?)))
            .collect()
    }

    async fn dispatch_records_for_report(&self, report_id: ReportId) -> DispatchResult<Vec<DispatchRecord>> {
        let client = self.pool.get().await.map_err(store_err)?;
        let sql = format!(
            "SELECT {DISPATCH_COLUMNS} FROM dispatch_records WHERE report_id = $1 ORDER BY dispatch_id"
        );
        let rows = client.query(sql.as_str(), &[&report_id.0]).await.map_err(store_err)?;
        rows.iter().map(dispatch_from_row).collect()
    }

    async fn count_assignments(&self, report_id: ReportId) -> DispatchResult<u32> {
        let client = self.pool.get().await.map_err(store_err)?;
        let count: i64 = client
            .query_one("SELECT COUNT(*) FROM report_assignments WHERE report_id = $1", &[&report_id.0])
            .await
            .map_err(store_err)?
            .try_get(0)
            .map_err(store_err)?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}
