//! Tiered track simplification
//!
//! Reduces a track to a render-ready [`EnhancedGeoJson`] at one of four
//! [`SimplificationLevel`]s.  Reduction is Douglas-Peucker line
//! simplification with perpendicular distances measured in meters on a
//! local equirectangular projection.
//!
//! Each level starts from a tolerance on a shared ladder (2.5 m doubling per
//! step) and escalates up the ladder until the result fits the level's
//! point cap.  Douglas-Peucker picks the same split vertex at every
//! tolerance, so a larger tolerance retains a subset of the points a smaller
//! one does.  Together with the shared ladder this keeps the retained point
//! counts ordered `high >= medium >= low` for any input.

use std::convert::Infallible;

use serde::Serialize;
use strum::{Display, EnumIter, EnumString};
use tracing::debug;

use crate::checkpoint::{Cancelled, Checkpoint};
use crate::geojson::{EnhancedGeoJson, FeatureCollection, track_feature};
use crate::geomath::EARTH_RADIUS_KM;
use crate::types::{GeoPoint, Track, Trackpoint};

/// Smallest tolerance on the ladder.
const BASE_TOLERANCE_METERS: f64 = 2.5;

/// Largest ladder step.  At this step the tolerance exceeds any distance on
/// earth, leaving only the endpoints.
const MAX_STEP: u32 = 24;

const METERS_PER_DEGREE: f64 = EARTH_RADIUS_KM * 1000.0 * std::f64::consts::PI / 180.0;

/// A named simplification tier.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Display, EnumString, EnumIter, Serialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum SimplificationLevel {
    /// Least reduction, highest fidelity.
    High,
    #[default]
    Medium,
    /// Most reduction.
    Low,
    /// Every point retained.
    None,
}

impl SimplificationLevel {
    /// First ladder step tried, or `None` for pass-through.
    fn start_step(self) -> Option<u32> {
        match self {
            SimplificationLevel::High => Some(0),
            SimplificationLevel::Medium => Some(2),
            SimplificationLevel::Low => Some(4),
            SimplificationLevel::None => None,
        }
    }

    /// Upper bound on retained points, when the ladder allows reaching it.
    pub fn max_points(self) -> Option<usize> {
        match self {
            SimplificationLevel::High => Some(20_000),
            SimplificationLevel::Medium => Some(5_000),
            SimplificationLevel::Low => Some(1_000),
            SimplificationLevel::None => None,
        }
    }
}

fn tolerance_at(step: u32) -> f64 {
    BASE_TOLERANCE_METERS * f64::from(1u32 << step)
}

/// Perpendicular distance in meters from `p` to the line through `a` and `b`,
/// on an equirectangular projection centered on the segment's mean latitude.
fn perpendicular_distance(p: &GeoPoint, a: &GeoPoint, b: &GeoPoint) -> f64 {
    let cos_lat = ((a.lat().0 + b.lat().0) / 2.0).to_radians().cos();
    let project = |g: &GeoPoint| {
        (
            g.lon().0 * METERS_PER_DEGREE * cos_lat,
            g.lat().0 * METERS_PER_DEGREE,
        )
    };
    let (ax, ay) = project(a);
    let (bx, by) = project(b);
    let (px, py) = project(p);

    let (dx, dy) = (bx - ax, by - ay);
    let len_sq = dx * dx + dy * dy;
    if len_sq < 1e-12 {
        // Degenerate segment, as on a loop that returns to its start.
        return ((px - ax).powi(2) + (py - ay).powi(2)).sqrt();
    }
    ((px - ax) * dy - (py - ay) * dx).abs() / len_sq.sqrt()
}

/// Computes, for every point, the largest tolerance at which Douglas-Peucker
/// would still retain it.
///
/// A point is retained at tolerance `t` exactly when its significance is
/// greater than `t`.  Endpoints have infinite significance.  The recursion
/// runs on an explicit stack so that long tracks cannot overflow the call
/// stack.  `tick` is called once per split with the number of splits so far.
fn significance<E>(
    points: &[Trackpoint],
    mut tick: impl FnMut(usize) -> Result<(), E>,
) -> Result<Vec<f64>, E> {
    let n = points.len();
    let mut sig = vec![0.0; n];
    if n == 0 {
        return Ok(sig);
    }
    sig[0] = f64::INFINITY;
    sig[n - 1] = f64::INFINITY;

    let mut splits = 0;
    let mut stack = vec![(0, n - 1, f64::INFINITY)];
    while let Some((first, last, bound)) = stack.pop() {
        if last <= first + 1 {
            continue;
        }

        let (a, b) = (&points[first].point, &points[last].point);
        let mut max_dist = -1.0;
        let mut max_idx = first + 1;
        for (i, p) in points.iter().enumerate().take(last).skip(first + 1) {
            let dist = perpendicular_distance(&p.point, a, b);
            // Strict comparison keeps the earliest of equally distant points.
            if dist > max_dist {
                max_dist = dist;
                max_idx = i;
            }
        }

        // A vertex survives only as long as every enclosing split does.
        let s = max_dist.min(bound);
        sig[max_idx] = s;
        stack.push((max_idx, last, s));
        stack.push((first, max_idx, s));

        splits += 1;
        tick(splits)?;
    }
    Ok(sig)
}

fn retained_count(sig: &[f64], tolerance: f64) -> usize {
    sig.iter().filter(|&&s| s > tolerance).count()
}

fn simplify_impl<E>(
    track: &Track,
    level: SimplificationLevel,
    tick: impl FnMut(usize) -> Result<(), E>,
) -> Result<EnhancedGeoJson, E> {
    let points = track.points();

    let (retained, tolerance) = match (level.start_step(), level.max_points()) {
        (Some(start), Some(max_points)) if points.len() > 2 => {
            let sig = significance(points, tick)?;
            let mut step = start;
            while step < MAX_STEP && retained_count(&sig, tolerance_at(step)) > max_points {
                step += 1;
            }
            let tolerance = tolerance_at(step);
            let retained = points
                .iter()
                .zip(&sig)
                .filter_map(|(p, &s)| (s > tolerance).then_some(p))
                .collect::<Vec<_>>();
            (retained, Some(tolerance))
        }
        (Some(start), _) => (points.iter().collect(), Some(tolerance_at(start))),
        _ => (points.iter().collect(), None),
    };

    debug!(
        "Simplified {} points to {} at {:?} m",
        points.len(),
        retained.len(),
        tolerance
    );
    Ok(FeatureCollection {
        features: vec![track_feature(
            track.name(),
            points.len(),
            &retained,
            level,
            tolerance,
        )],
    })
}

/// Simplifies a track to `level`.
pub fn simplify(track: &Track, level: SimplificationLevel) -> EnhancedGeoJson {
    let Ok(geojson) = simplify_impl(track, level, |_| Ok::<(), Infallible>(()));
    geojson
}

/// Simplifies a track to `level`, observing `checkpoint` every bounded
/// number of vertices.
#[tracing::instrument(level = "debug", skip_all, fields(points = track.len(), %level))]
pub fn simplify_with(
    track: &Track,
    level: SimplificationLevel,
    checkpoint: &Checkpoint,
) -> Result<EnhancedGeoJson, Cancelled> {
    let n = track.len() as f64;
    let mut ticker = checkpoint.ticker();
    let geojson = simplify_impl(track, level, |splits| {
        ticker.tick(|| splits as f64 / n)
    })?;
    checkpoint.check(Some(1.0))?;
    Ok(geojson)
}
