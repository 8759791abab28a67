//! Spherical geometry and motion primitives
//!
//! Pure functions over [`GeoPoint`]s on a spherical earth of radius
//! [`EARTH_RADIUS_KM`].  Used by the statistics aggregator and the
//! simplification engine.

use crate::measure::{Degrees, Hours, Kilometers, KilometersPerHour, Meters, Seconds};
use crate::types::GeoPoint;

/// Mean earth radius used for all great-circle computations.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Segment speed below which a segment counts as stopped.
pub const DEFAULT_STOPPED_THRESHOLD: KilometersPerHour<f64> = KilometersPerHour(1.0);

/// Great-circle distance between two points, by the haversine formula.
pub fn haversine_distance(a: &GeoPoint, b: &GeoPoint) -> Kilometers<f64> {
    let lat1 = a.lat().0.to_radians();
    let lat2 = b.lat().0.to_radians();
    let dlat = (lat2 - lat1).abs();
    let dlon = (b.lon().0 - a.lon().0).abs().to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    // Rounding can push h slightly past 1 for antipodal points.
    let c = 2.0 * h.clamp(0.0, 1.0).sqrt().asin();
    Kilometers(EARTH_RADIUS_KM * c)
}

/// Elevation change between two consecutive samples.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct ElevationDelta {
    pub gain: Meters<f64>,
    pub loss: Meters<f64>,
}

/// Splits the change from `prev` to `curr` into gain and loss.
///
/// Missing elevation at either end contributes nothing; no value is
/// interpolated.
pub fn elevation_delta(prev: Option<Meters<f64>>, curr: Option<Meters<f64>>) -> ElevationDelta {
    match (prev, curr) {
        (Some(prev), Some(curr)) => {
            let diff = curr.0 - prev.0;
            ElevationDelta {
                gain: Meters(diff.max(0.0)),
                loss: Meters((-diff).max(0.0)),
            }
        }
        _ => ElevationDelta::default(),
    }
}

/// Average speed over a segment.
///
/// Returns zero when `dt` is not positive, which rejects out-of-order and
/// duplicate timestamps.
pub fn segment_speed(distance: Kilometers<f64>, dt: Seconds<f64>) -> KilometersPerHour<f64> {
    if dt.0 <= 0.0 || !dt.0.is_finite() {
        return KilometersPerHour(0.0);
    }
    distance / Hours::from(dt)
}

/// Classifies a segment as moving when its speed exceeds the stopped
/// threshold.
pub fn is_moving(speed: KilometersPerHour<f64>, stopped_threshold: KilometersPerHour<f64>) -> bool {
    speed > stopped_threshold
}

/// Initial great-circle bearing from `a` towards `b`, in `[0, 360)` degrees
/// clockwise from true north.
pub fn bearing(a: &GeoPoint, b: &GeoPoint) -> Degrees<f64> {
    let lat1 = a.lat().0.to_radians();
    let lat2 = b.lat().0.to_radians();
    let dlon = (b.lon().0 - a.lon().0).to_radians();

    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    Degrees(y.atan2(x).to_degrees().rem_euclid(360.0))
}
