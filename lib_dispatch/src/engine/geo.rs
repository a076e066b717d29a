//! # Geographic Coordinates
//!
//! Latitude/longitude pairs and the haversine great-circle distance used by the
//! nearest-match selector.

use crate::errors::{DispatchError, DispatchResult};
use serde::{Deserialize, Serialize};

/// Mean Earth radius used by the haversine formula.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A point on the Earth's surface in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude, -90..=90.
    pub latitude: f64,
    /// Longitude, -180..=180.
    pub longitude: f64,
}

impl GeoPoint {
    /// Builds a point, rejecting non-finite or out-of-range coordinates.
    pub fn new(latitude: f64, longitude: f64) -> DispatchResult<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(DispatchError::InvalidReport(format!(
                "latitude {latitude} outside -90..=90"
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(DispatchError::InvalidReport(format!(
                "longitude {longitude} outside -180..=180"
            )));
        }
        Ok(Self { latitude, longitude })
    }

    /// Great-circle distance to `other` in kilometres (haversine formula).
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let delta_lat = (other.latitude - self.latitude).to_radians();
        let delta_lon = (other.longitude - self.longitude).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().asin();

        EARTH_RADIUS_KM * c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(GeoPoint::new(90.5, 0.0).is_err());
        assert!(GeoPoint::new(0.0, -180.1).is_err());
        assert!(GeoPoint::new(f64::NAN, 0.0).is_err());
        assert!(GeoPoint::new(-90.0, 180.0).is_ok());
    }

    #[test]
    fn distance_matches_known_values() {
        let report = GeoPoint::new(12.9, 77.6).unwrap();
        let near = GeoPoint::new(12.91, 77.61).unwrap();
        let far = GeoPoint::new(13.0, 77.7).unwrap();

        let near_km = report.distance_km(&near);
        let far_km = report.distance_km(&far);
        assert!((near_km - 1.5).abs() < 0.2, "near was {near_km}");
        assert!((far_km - 15.3).abs() < 1.5, "far was {far_km}");
        assert_eq!(report.distance_km(&report), 0.0);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = GeoPoint::new(51.5, -0.12).unwrap();
        let b = GeoPoint::new(48.85, 2.35).unwrap();
        assert!((a.distance_km(&b) - b.distance_km(&a)).abs() < 1e-9);
    }
}
