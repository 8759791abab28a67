//! Track statistics aggregation
//!
//! [`aggregate`] walks consecutive point pairs of a [`Track`] once and
//! produces an immutable [`TrackStatistics`] snapshot: distance, elevation
//! gain and loss, elevation range, elapsed and moving time, and speeds.
//!
//! Degraded input is reported rather than rejected unless the caller asks
//! otherwise: a single-point track yields zeroed distance and speed fields,
//! a track with missing timestamps yields zeroed moving time and speeds with
//! `has_complete_timestamps` unset, and a track without elevation data
//! yields a zero elevation range with `has_elevation_data` unset.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::checkpoint::{Cancelled, Checkpoint};
use crate::geomath::{
    DEFAULT_STOPPED_THRESHOLD, elevation_delta, haversine_distance, is_moving, segment_speed,
};
use crate::measure::{Hours, Kilometers, KilometersPerHour, Meters, Seconds};
use crate::types::{Track, Trackpoint};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    #[error("insufficient data: track has {points} point(s), at least 2 are required")]
    InsufficientData { points: usize },
    #[error("missing timestamps on {count} of {total} points")]
    MissingTimestamps { count: usize, total: usize },
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

type Result<T> = std::result::Result<T, StatsError>;

/// Parameters of a statistics computation.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct StatsOptions {
    stopped_threshold: KilometersPerHour<f64>,
    require_timestamps: bool,
    require_segments: bool,
    elevation_hysteresis: Option<Meters<f64>>,
}

impl Default for StatsOptions {
    fn default() -> Self {
        Self {
            stopped_threshold: DEFAULT_STOPPED_THRESHOLD,
            require_timestamps: false,
            require_segments: false,
            elevation_hysteresis: None,
        }
    }
}

impl StatsOptions {
    /// Sets the segment speed at or below which a segment counts as stopped.
    pub fn with_stopped_threshold(self, stopped_threshold: KilometersPerHour<f64>) -> Self {
        Self {
            stopped_threshold,
            ..self
        }
    }

    /// Fail with [`StatsError::MissingTimestamps`] instead of reporting zero
    /// moving time when any point lacks a timestamp.
    pub fn with_require_timestamps(self, require_timestamps: bool) -> Self {
        Self {
            require_timestamps,
            ..self
        }
    }

    /// Fail with [`StatsError::InsufficientData`] instead of reporting zeroed
    /// statistics for a single-point track.
    pub fn with_require_segments(self, require_segments: bool) -> Self {
        Self {
            require_segments,
            ..self
        }
    }

    /// Only accumulate elevation change once it exceeds `threshold` relative
    /// to the last counted elevation, suppressing GPS altitude jitter.
    pub fn with_elevation_hysteresis(self, threshold: Meters<f64>) -> Self {
        Self {
            elevation_hysteresis: Some(threshold),
            ..self
        }
    }

    pub fn stopped_threshold(&self) -> KilometersPerHour<f64> {
        self.stopped_threshold
    }
}

/// A summary of a track's motion.
#[derive(Clone, PartialEq, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackStatistics {
    pub total_distance: Kilometers<f64>,
    pub elevation_gain: Meters<f64>,
    pub elevation_loss: Meters<f64>,
    pub max_elevation: Meters<f64>,
    pub min_elevation: Meters<f64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub moving_time: Seconds<f64>,
    pub total_time: Seconds<f64>,
    pub average_speed: KilometersPerHour<f64>,
    pub max_speed: KilometersPerHour<f64>,
    /// Whether any point carried an elevation.  When unset, the elevation
    /// fields are zero for lack of data, not measured.
    pub has_elevation_data: bool,
    /// Whether every point carried a timestamp.  When unset, moving time and
    /// speeds are zero for lack of data.
    pub has_complete_timestamps: bool,
    pub point_count: usize,
}

/// Accumulates gain and loss, optionally with a hysteresis band.
struct ElevationAccumulator {
    hysteresis: Option<Meters<f64>>,
    anchor: Option<Meters<f64>>,
    gain: Meters<f64>,
    loss: Meters<f64>,
}

impl ElevationAccumulator {
    fn new(hysteresis: Option<Meters<f64>>) -> Self {
        Self {
            hysteresis,
            anchor: None,
            gain: Meters(0.0),
            loss: Meters(0.0),
        }
    }

    fn add(&mut self, prev: Option<Meters<f64>>, curr: Option<Meters<f64>>) {
        let Some(threshold) = self.hysteresis else {
            let delta = elevation_delta(prev, curr);
            self.gain += delta.gain;
            self.loss += delta.loss;
            return;
        };

        // A gap in elevation data restarts the band.
        let (Some(prev), Some(curr)) = (prev, curr) else {
            self.anchor = None;
            return;
        };
        let anchor = *self.anchor.get_or_insert(prev);
        if (curr.0 - anchor.0).abs() > threshold.0 {
            let delta = elevation_delta(Some(anchor), Some(curr));
            self.gain += delta.gain;
            self.loss += delta.loss;
            self.anchor = Some(curr);
        }
    }
}

fn seconds_between(a: DateTime<Utc>, b: DateTime<Utc>) -> Seconds<f64> {
    Seconds((b - a).num_milliseconds() as f64 / 1000.0)
}

fn elevation_range(points: &[Trackpoint]) -> Option<(Meters<f64>, Meters<f64>)> {
    points
        .iter()
        .filter_map(|p| p.elevation)
        .fold(None, |range, e| match range {
            None => Some((e, e)),
            Some((min, max)) => Some((
                if e < min { e } else { min },
                if e > max { e } else { max },
            )),
        })
}

/// Computes statistics over a track with default options.
pub fn aggregate(track: &Track, options: &StatsOptions) -> Result<TrackStatistics> {
    aggregate_with(track, options, &Checkpoint::unbounded())
}

/// Computes statistics over a track, observing `checkpoint` every bounded
/// number of segments.
#[tracing::instrument(level = "debug", skip_all, fields(points = track.len()))]
pub fn aggregate_with(
    track: &Track,
    options: &StatsOptions,
    checkpoint: &Checkpoint,
) -> Result<TrackStatistics> {
    let points = track.points();
    if points.len() < 2 && options.require_segments {
        return Err(StatsError::InsufficientData {
            points: points.len(),
        });
    }

    let num_missing_times = points.iter().filter(|p| p.time.is_none()).count();
    if num_missing_times > 0 && options.require_timestamps {
        return Err(StatsError::MissingTimestamps {
            count: num_missing_times,
            total: points.len(),
        });
    }
    let has_complete_timestamps = num_missing_times == 0;

    let mut total_distance = Kilometers(0.0);
    let mut elevation = ElevationAccumulator::new(options.elevation_hysteresis);
    let mut moving_time = Seconds(0.0);
    let mut max_speed = KilometersPerHour(0.0);
    let mut ticker = checkpoint.ticker();
    let num_segments = points.len().saturating_sub(1);

    for (i, pair) in points.windows(2).enumerate() {
        let (a, b) = (&pair[0], &pair[1]);
        let distance = haversine_distance(&a.point, &b.point);
        total_distance += distance;
        elevation.add(a.elevation, b.elevation);

        if let (true, Some(t1), Some(t2)) = (has_complete_timestamps, a.time, b.time) {
            let dt = seconds_between(t1, t2);
            let speed = segment_speed(distance, dt);
            if speed > max_speed {
                max_speed = speed;
            }
            if is_moving(speed, options.stopped_threshold) {
                moving_time += dt;
            }
        }

        ticker.tick(|| (i + 1) as f64 / num_segments as f64)?;
    }

    let start_time = points.iter().find_map(|p| p.time);
    let end_time = points.iter().rev().find_map(|p| p.time);
    let total_time = match (start_time, end_time) {
        (Some(start), Some(end)) => Seconds(seconds_between(start, end).0.max(0.0)),
        _ => Seconds(0.0),
    };

    // Out-of-order timestamps can make the moving segments sum past the
    // elapsed time.
    if moving_time > total_time {
        moving_time = total_time;
    }
    if !has_complete_timestamps {
        moving_time = Seconds(0.0);
    }

    // Distance covered across zero-duration segments counts toward the
    // average but not the maximum.
    let average_speed = if moving_time.0 > 0.0 {
        let avg = total_distance / Hours::from(moving_time);
        if avg > max_speed { max_speed } else { avg }
    } else {
        KilometersPerHour(0.0)
    };

    checkpoint.check(Some(1.0))?;

    let range = elevation_range(points);
    let (min_elevation, max_elevation) = range.unwrap_or((Meters(0.0), Meters(0.0)));

    let stats = TrackStatistics {
        total_distance,
        elevation_gain: elevation.gain,
        elevation_loss: elevation.loss,
        max_elevation,
        min_elevation,
        start_time,
        end_time,
        moving_time,
        total_time,
        average_speed,
        max_speed,
        has_elevation_data: range.is_some(),
        has_complete_timestamps,
        point_count: points.len(),
    };
    debug!(
        "Aggregated {} points: {} over {} moving",
        stats.point_count, stats.total_distance, stats.moving_time
    );
    Ok(stats)
}
