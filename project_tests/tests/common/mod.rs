#![allow(dead_code)]

use lib_dispatch::{
    AmbulanceId, AssignmentManager, DispatchPolicy, DriverId, GeoPoint, MemoryStore, NewReport,
    Notifier, ReportId, ReportKind, ReportSummary, UserId,
};
use std::sync::{Arc, Mutex};

/// Captures every push the manager asks for: `Some(driver)` for a targeted
/// notify, `None` for a broadcast.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(Option<DriverId>, ReportId)>>,
}

impl RecordingNotifier {
    pub fn targets(&self) -> Vec<Option<DriverId>> {
        self.sent.lock().unwrap().iter().map(|(d, _)| *d).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, driver_id: DriverId, summary: ReportSummary) {
        self.sent.lock().unwrap().push((Some(driver_id), summary.report_id));
    }

    fn broadcast(&self, summary: ReportSummary) {
        self.sent.lock().unwrap().push((None, summary.report_id));
    }
}

pub fn point(latitude: f64, longitude: f64) -> GeoPoint {
    GeoPoint { latitude, longitude }
}

/// Report filed at (12.9, 77.6).
pub fn sos_report() -> NewReport {
    NewReport {
        reporter_id: UserId(500),
        kind: ReportKind::Sos,
        latitude: 12.9,
        longitude: 77.6,
        description: Some("two-wheeler collision".into()),
        destination: None,
        photo_ref: Some("/uploads/500_scene.jpg".into()),
    }
}

pub fn booking_report() -> NewReport {
    NewReport {
        reporter_id: UserId(501),
        kind: ReportKind::Booking,
        latitude: 12.9,
        longitude: 77.6,
        description: None,
        destination: Some("St. John's Hospital".into()),
        photo_ref: None,
    }
}

/// Store with drivers 1..=n, driver `i` owning ambulance `100 + i`, each a
/// little further from the report location than the last.
pub fn fleet_of(n: i64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for i in 1..=n {
        store.add_driver(
            DriverId(i),
            AmbulanceId(100 + i),
            point(12.9 + 0.01 * i as f64, 77.6 + 0.01 * i as f64),
        );
    }
    store
}

pub fn manager(
    store: &Arc<MemoryStore>,
    policy: DispatchPolicy,
) -> (Arc<RecordingNotifier>, Arc<AssignmentManager>) {
    let notifier = Arc::new(RecordingNotifier::default());
    let manager = AssignmentManager::new(store.clone(), notifier.clone(), policy);
    (notifier, Arc::new(manager))
}
