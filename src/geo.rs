//! Observer location and great-circle distance.

use serde::{Deserialize, Serialize};

/// Where the probes originate from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observer {
    pub latitude: f64,
    pub longitude: f64,
    /// ISO country code, compared case-insensitively
    pub country_code: String,
}

impl Observer {
    pub fn new(latitude: f64, longitude: f64, country_code: impl Into<String>) -> Self {
        Self {
            latitude,
            longitude,
            country_code: country_code.into(),
        }
    }

    /// Angular distance in radians from the observer to a coordinate
    pub fn distance_to(&self, latitude: f64, longitude: f64) -> f64 {
        angular_distance(self.latitude, self.longitude, latitude, longitude)
    }
}

/// Central angle between two points on a sphere, in radians (haversine).
///
/// A result of `PI` is the antipode; multiply by the sphere radius for
/// a surface distance.
pub fn angular_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();

    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * a.sqrt().min(1.0).asin()
}
