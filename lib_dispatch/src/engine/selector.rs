//! # Nearest-Match Selector
//!
//! Pure selection over a candidate list. No shared state is read or written, so
//! the same inputs always produce the same answer.

use crate::engine::fleet::FleetCandidate;
use crate::engine::geo::GeoPoint;
use crate::engine::model::DriverId;

/// Returns the candidate closest to `report_location`.
///
/// Distances use the haversine formula. On a tie the first candidate in the
/// slice wins. An empty slice yields `None`; the caller decides whether that is
/// a failure.
pub fn select_nearest(report_location: &GeoPoint, candidates: &[FleetCandidate]) -> Option<FleetCandidate> {
    select_nearest_excluding(report_location, candidates, &[])
}

/// Like [`select_nearest`], skipping candidates driven by anyone in `excluded`.
pub fn select_nearest_excluding(
    report_location: &GeoPoint,
    candidates: &[FleetCandidate],
    excluded: &[DriverId],
) -> Option<FleetCandidate> {
    let mut best: Option<(FleetCandidate, f64)> = None;
    for candidate in candidates.iter().filter(|c| !excluded.contains(&c.driver_id)) {
        let distance = report_location.distance_km(&candidate.location);
        // strict comparison keeps the earlier candidate on ties
        if best.map_or(true, |(_, best_distance)| distance < best_distance) {
            best = Some((*candidate, distance));
        }
    }
    best.map(|(candidate, _)| candidate)
}
