//! GeoJSON output types
//!
//! A minimal subset of RFC 7946 sufficient to describe one simplified track:
//! a `FeatureCollection` holding a single `LineString` (or `Point`, for a
//! single-fix track) feature.  Feature properties carry the enrichments map
//! clients rely on, notably `coordTimes`, which runs parallel to the
//! geometry's coordinates.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::simplify::SimplificationLevel;
use crate::types::Trackpoint;

/// A GeoJSON position: `[longitude, latitude]` or
/// `[longitude, latitude, elevation]`.
pub type Position = Vec<f64>;

/// Enhanced GeoJSON for a track, as produced by the simplification engine.
pub type EnhancedGeoJson = FeatureCollection;

#[derive(Clone, PartialEq, Debug, Serialize)]
#[serde(tag = "type")]
pub struct FeatureCollection {
    pub features: Vec<Feature>,
}

#[derive(Clone, PartialEq, Debug, Serialize)]
#[serde(tag = "type")]
pub struct Feature {
    pub geometry: Geometry,
    pub properties: FeatureProperties,
}

#[derive(Clone, PartialEq, Debug, Serialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point { coordinates: Position },
    LineString { coordinates: Vec<Position> },
}

impl Geometry {
    /// Number of positions in the geometry.
    pub fn len(&self) -> usize {
        match self {
            Geometry::Point { .. } => 1,
            Geometry::LineString { coordinates } => coordinates.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn first(&self) -> Option<&Position> {
        match self {
            Geometry::Point { coordinates } => Some(coordinates),
            Geometry::LineString { coordinates } => coordinates.first(),
        }
    }

    pub fn last(&self) -> Option<&Position> {
        match self {
            Geometry::Point { coordinates } => Some(coordinates),
            Geometry::LineString { coordinates } => coordinates.last(),
        }
    }
}

#[derive(Clone, PartialEq, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub simplification_level: SimplificationLevel,
    /// Douglas-Peucker tolerance that produced the geometry, or `None` when
    /// the track was passed through unsimplified.
    pub tolerance_meters: Option<f64>,
    pub source_point_count: usize,
    pub point_count: usize,
    /// `Trackpoint::index` of each retained position.
    pub source_indices: Vec<usize>,
    /// Timestamps parallel to a `LineString`'s coordinates.  Present only
    /// when the source track had timestamps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coord_times: Option<Vec<Option<DateTime<Utc>>>>,
}

impl FeatureCollection {
    /// The track feature.  Collections built by this crate always hold
    /// exactly one.
    pub fn track_feature(&self) -> Option<&Feature> {
        self.features.first()
    }
}

/// Builds the feature for the trackpoints retained at `level`.
///
/// Elevation becomes the third coordinate only when every retained point
/// has one, so that all positions share a dimension.
pub(crate) fn track_feature(
    name: Option<&str>,
    source_point_count: usize,
    retained: &[&Trackpoint],
    level: SimplificationLevel,
    tolerance_meters: Option<f64>,
) -> Feature {
    let with_elevation = retained.iter().all(|p| p.elevation.is_some());
    let position = |p: &Trackpoint| -> Position {
        let mut pos = vec![p.point.lon().0, p.point.lat().0];
        if let (true, Some(ele)) = (with_elevation, p.elevation) {
            pos.push(ele.0);
        }
        pos
    };

    let (geometry, coord_times) = match retained {
        [only] => (
            Geometry::Point {
                coordinates: position(*only),
            },
            None,
        ),
        _ => {
            let coord_times: Option<Vec<_>> = retained
                .iter()
                .any(|p| p.time.is_some())
                .then(|| retained.iter().map(|p| p.time).collect());
            (
                Geometry::LineString {
                    coordinates: retained.iter().map(|p| position(*p)).collect(),
                },
                coord_times,
            )
        }
    };

    Feature {
        properties: FeatureProperties {
            name: name.map(str::to_owned),
            simplification_level: level,
            tolerance_meters,
            source_point_count,
            point_count: geometry.len(),
            source_indices: retained.iter().map(|p| p.index).collect(),
            coord_times,
        },
        geometry,
    }
}
