//! # Dispatch Ledger
//!
//! Append-only history of ambulances actually sent. A record is written exactly
//! once per report, as part of the acceptance commit, and is never updated or
//! deleted.

use crate::engine::model::{AmbulanceId, AssignmentId, DispatchId, ReportId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status stamped on a dispatch record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchStatus {
    /// The ambulance was sent.
    Dispatched,
}

impl DispatchStatus {
    /// Stable label, matching the persisted value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dispatched => "Dispatched",
        }
    }
}

/// One audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    /// Record identity.
    pub id: DispatchId,
    /// Ambulance sent.
    pub ambulance_id: AmbulanceId,
    /// Report served.
    pub report_id: ReportId,
    /// The accepted assignment.
    pub assignment_id: AssignmentId,
    /// Dispatch status.
    pub status: DispatchStatus,
    /// When the record was appended.
    pub dispatched_at: DateTime<Utc>,
}

/// In-process append-only ledger. It exposes no way to change or remove entries.
#[derive(Debug, Default)]
pub struct DispatchLedger {
    records: Vec<DispatchRecord>,
}

impl DispatchLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record, assigning the next identity.
    pub fn append(
        &mut self,
        ambulance_id: AmbulanceId,
        report_id: ReportId,
        assignment_id: AssignmentId,
        dispatched_at: DateTime<Utc>,
    ) -> DispatchRecord {
        let record = DispatchRecord {
            id: DispatchId(self.records.len() as i64 + 1),
            ambulance_id,
            report_id,
            assignment_id,
            status: DispatchStatus::Dispatched,
            dispatched_at,
        };
        self.records.push(record.clone());
        record
    }

    /// Records referencing `report_id`, oldest first.
    pub fn for_report(&self, report_id: ReportId) -> Vec<DispatchRecord> {
        self.records
            .iter()
            .filter(|record| record.report_id == report_id)
            .cloned()
            .collect()
    }

    /// Every record, oldest first.
    pub fn records(&self) -> &[DispatchRecord] {
        &self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_assigns_sequential_ids() {
        let mut ledger = DispatchLedger::new();
        let now = Utc::now();
        let first = ledger.append(AmbulanceId(1), ReportId(10), AssignmentId(100), now);
        let second = ledger.append(AmbulanceId(2), ReportId(11), AssignmentId(101), now);
        assert_eq!(first.id, DispatchId(1));
        assert_eq!(second.id, DispatchId(2));
        assert_eq!(ledger.records().len(), 2);
        assert_eq!(ledger.for_report(ReportId(11)), vec![second]);
        assert!(ledger.for_report(ReportId(99)).is_empty());
    }
}
