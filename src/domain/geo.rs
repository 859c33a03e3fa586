//! Geographic primitives: coordinates and great-circle distance.

use serde::{Deserialize, Serialize};

use super::DomainError;

/// Mean Earth radius in kilometres (IUGG).
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

/// A WGS-84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees, `-90..=90`.
    pub lat: f64,
    /// Longitude in degrees, `-180..=180`.
    pub lon: f64,
}

impl GeoPoint {
    /// Creates a validated coordinate.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::InvalidCoordinates`] when either component is
    /// not finite or out of range.
    pub fn new(lat: f64, lon: f64) -> Result<Self, DomainError> {
        if !lat.is_finite() || !lon.is_finite() || lat.abs() > 90.0 || lon.abs() > 180.0 {
            return Err(DomainError::InvalidCoordinates { lat, lon });
        }
        Ok(Self { lat, lon })
    }

    /// Great-circle distance to `other` in kilometres.
    #[must_use]
    pub fn distance_km(&self, other: &Self) -> f64 {
        haversine_km(self, other)
    }

    /// Parses `"lat,lon"` free text (as users sometimes type coordinates).
    #[must_use]
    pub fn parse_pair(text: &str) -> Option<Self> {
        let (lat, lon) = text.split_once(',')?;
        let lat = lat.trim().parse().ok()?;
        let lon = lon.trim().parse().ok()?;
        Self::new(lat, lon).ok()
    }

    /// Returns the latitude/longitude box that encloses every point within
    /// `radius_km` of `self`. Used to narrow candidate sets before the exact
    /// haversine check.
    ///
    /// The longitude half-width is `asin(sin(d/R) / cos φ)`, the offset of
    /// the circle's tangent meridians. A circle that reaches a pole spans
    /// every longitude.
    #[must_use]
    pub fn bounding_box(&self, radius_km: f64) -> BoundingBox {
        let angular = radius_km.max(0.0) / EARTH_RADIUS_KM;
        let lat_delta = angular.to_degrees();
        let (min_lat, max_lat) = ((self.lat - lat_delta).max(-90.0), (self.lat + lat_delta).min(90.0));

        let ratio = angular.sin() / self.lat.to_radians().cos().abs();
        let reaches_pole = min_lat <= -90.0 || max_lat >= 90.0;
        if reaches_pole || angular >= std::f64::consts::FRAC_PI_2 || ratio.is_nan() || ratio >= 1.0 {
            return BoundingBox {
                min_lat,
                max_lat,
                min_lon: -180.0,
                max_lon: 180.0,
            };
        }
        let lon_delta = ratio.asin().to_degrees();
        BoundingBox {
            min_lat,
            max_lat,
            min_lon: self.lon - lon_delta,
            max_lon: self.lon + lon_delta,
        }
    }
}

/// An axis-aligned latitude/longitude rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    /// Southern edge.
    pub min_lat: f64,
    /// Northern edge.
    pub max_lat: f64,
    /// Western edge (may be below -180 near the antimeridian).
    pub min_lon: f64,
    /// Eastern edge (may exceed 180 near the antimeridian).
    pub max_lon: f64,
}

impl BoundingBox {
    /// Returns `true` if `point` lies inside the box.
    #[must_use]
    pub fn contains(&self, point: &GeoPoint) -> bool {
        if point.lat < self.min_lat || point.lat > self.max_lat {
            return false;
        }
        let lon = point.lon;
        (self.min_lon..=self.max_lon).contains(&lon)
            || (self.min_lon..=self.max_lon).contains(&(lon + 360.0))
            || (self.min_lon..=self.max_lon).contains(&(lon - 360.0))
    }
}

/// Haversine great-circle distance in kilometres.
///
/// `d = 2R · asin(√(hav(Δφ) + cos φ1 · cos φ2 · hav(Δλ)))`
#[must_use]
pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let d_phi = (b.lat - a.lat).to_radians();
    let d_lambda = (b.lon - a.lon).to_radians();

    let hav = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Rounding can push `hav` a hair above 1 for antipodal points.
    2.0 * EARTH_RADIUS_KM * hav.clamp(0.0, 1.0).sqrt().asin()
}
