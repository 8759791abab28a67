use approx::{AbsDiffEq, RelativeEq, abs_diff_eq, relative_eq};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::measure::{Degrees, Meters};

#[derive(Error, Debug)]
pub enum TypeError {
    #[error("geographic point invariant: invalid value {1:?} for {0:?}")]
    GeoPointInvariant(GeoPointDimension, Degrees<f64>),
    #[error("a track must contain at least one point")]
    EmptyTrack,
}

type Result<T> = std::result::Result<T, TypeError>;

/// A position on the surface of the earth.
///
/// Enforces finite latitude and longitude within their geographic ranges as
/// type invariants.
#[derive(Clone, Copy, PartialEq, Debug, Serialize)]
pub struct GeoPoint {
    longitude: Degrees<f64>,
    latitude: Degrees<f64>,
}

#[derive(Debug)]
pub enum GeoPointDimension {
    Latitude,
    Longitude,
}

impl GeoPoint {
    pub fn new(lat: Degrees<f64>, lon: Degrees<f64>) -> Result<GeoPoint> {
        if !lat.0.is_finite() || lat.0 < -90.0 || lat.0 > 90.0 {
            return Err(TypeError::GeoPointInvariant(
                GeoPointDimension::Latitude,
                lat,
            ));
        }
        if !lon.0.is_finite() || lon.0 < -180.0 || lon.0 > 180.0 {
            return Err(TypeError::GeoPointInvariant(
                GeoPointDimension::Longitude,
                lon,
            ));
        }
        Ok(Self {
            longitude: lon,
            latitude: lat,
        })
    }

    /// Get point latitude
    pub fn lat(&self) -> Degrees<f64> {
        self.latitude
    }

    /// Get point longitude
    pub fn lon(&self) -> Degrees<f64> {
        self.longitude
    }
}

impl AbsDiffEq for GeoPoint {
    type Epsilon = f64;

    fn default_epsilon() -> Self::Epsilon {
        f64::EPSILON
    }

    fn abs_diff_eq(&self, other: &Self, epsilon: Self::Epsilon) -> bool {
        abs_diff_eq!(self.latitude.0, other.latitude.0, epsilon = epsilon)
            && abs_diff_eq!(self.longitude.0, other.longitude.0, epsilon = epsilon)
    }
}

impl RelativeEq for GeoPoint {
    fn default_max_relative() -> Self::Epsilon {
        0.000_000_000_000_001
    }

    fn relative_eq(
        &self,
        other: &Self,
        epsilon: Self::Epsilon,
        max_relative: Self::Epsilon,
    ) -> bool {
        relative_eq!(
            self.lat().0,
            other.lat().0,
            epsilon = epsilon,
            max_relative = max_relative
        ) && relative_eq!(
            self.lon().0,
            other.lon().0,
            epsilon = epsilon,
            max_relative = max_relative
        )
    }
}

/// One GPS fix of a parsed track.
///
/// `index` is the fix's position in the emitted track, after any points that
/// failed coordinate extraction were dropped.
#[derive(Clone, Copy, PartialEq, Debug, Serialize)]
pub struct Trackpoint {
    pub index: usize,
    #[serde(flatten)]
    pub point: GeoPoint,
    pub elevation: Option<Meters<f64>>,
    pub time: Option<DateTime<Utc>>,
}

impl Trackpoint {
    pub fn new(
        index: usize,
        point: GeoPoint,
        elevation: Option<Meters<f64>>,
        time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            index,
            point,
            elevation,
            time,
        }
    }
}

/// An ordered, non-empty sequence of trackpoints recorded during one
/// activity.
///
/// Points are kept in recording order, which is not guaranteed to be
/// monotonic in time.
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct Track {
    name: Option<String>,
    points: Vec<Trackpoint>,
}

impl Track {
    pub fn new(name: Option<String>, points: Vec<Trackpoint>) -> Result<Track> {
        if points.is_empty() {
            return Err(TypeError::EmptyTrack);
        }
        Ok(Self { name, points })
    }

    /// The track's name, if the source file provided one.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn points(&self) -> &[Trackpoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always false, since a track holds at least one point.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> &Trackpoint {
        &self.points[0]
    }

    pub fn last(&self) -> &Trackpoint {
        &self.points[self.points.len() - 1]
    }

    /// Checks whether any point carries elevation data.
    pub fn has_elevation(&self) -> bool {
        self.points.iter().any(|p| p.elevation.is_some())
    }

    /// Checks whether any point carries a timestamp.
    pub fn has_timestamps(&self) -> bool {
        self.points.iter().any(|p| p.time.is_some())
    }
}

/// Instantiate a `GeoPoint` with a tuple-like syntax.
#[macro_export]
macro_rules! geo_point {
    ( $lat:expr, $lon:expr ) => {
        $crate::GeoPoint::new($crate::measure::Degrees($lat), $crate::measure::Degrees($lon))?
    };
}

/// Instantiate a `Track` from `(lat, lon, elevation, time)` tuples, where the
/// elevation is an `Option<f64>` in meters and the time an
/// `Option<DateTime<Utc>>`.
#[macro_export]
macro_rules! track {
    ( $( ( $lat:expr, $lon:expr, $ele:expr, $time:expr $(,)? ) ),* $(,)? ) => {{
        let points: ::std::vec::Vec<(f64, f64, ::std::option::Option<f64>, _)> =
            vec![ $( ($lat, $lon, $ele, $time) ),* ];
        let mut trackpoints = ::std::vec::Vec::with_capacity(points.len());
        for (index, (lat, lon, ele, time)) in points.into_iter().enumerate() {
            trackpoints.push($crate::Trackpoint::new(
                index,
                $crate::geo_point!(lat, lon),
                ele.map($crate::measure::Meters),
                time,
            ));
        }
        $crate::Track::new(None, trackpoints)?
    }};
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::{TimeZone, Utc};

    use super::{GeoPoint, Track, TypeError};
    use crate::measure::Degrees;

    #[test]
    fn test_geo_point_ranges() {
        assert!(GeoPoint::new(Degrees(90.0), Degrees(-180.0)).is_ok());
        assert!(matches!(
            GeoPoint::new(Degrees(90.5), Degrees(0.0)),
            Err(TypeError::GeoPointInvariant(..))
        ));
        assert!(matches!(
            GeoPoint::new(Degrees(0.0), Degrees(180.01)),
            Err(TypeError::GeoPointInvariant(..))
        ));
        assert!(GeoPoint::new(Degrees(f64::NAN), Degrees(0.0)).is_err());
    }

    #[test]
    fn test_empty_track_rejected() {
        assert!(matches!(Track::new(None, vec![]), Err(TypeError::EmptyTrack)));
    }

    #[test]
    fn test_track_macro() -> Result<()> {
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        let track = track![
            (46.0, 7.0, Some(1200.0), Some(t0)),
            (46.001, 7.0, None, None),
        ];
        assert_eq!(track.len(), 2);
        assert_eq!(track.last().index, 1);
        assert!(track.has_elevation());
        assert!(track.has_timestamps());
        Ok(())
    }

    #[test]
    fn test_trackpoint_serialization() -> Result<()> {
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        let track = track![(46.5, 7.25, Some(1200.0), Some(t0))];
        let json = serde_json::to_value(track.first())?;
        assert_eq!(
            json,
            serde_json::json!({
                "index": 0,
                "longitude": 7.25,
                "latitude": 46.5,
                "elevation": 1200.0,
                "time": "2024-06-01T08:00:00Z",
            })
        );
        Ok(())
    }
}
