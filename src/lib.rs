//! A library and CLI tool for processing GPS track files.
//!
//! Validates and parses GPX, KML, TCX and FIT files into a normalized
//! [`Track`], then derives motion statistics and a simplified GeoJSON
//! geometry for map display.
//!
//! See [`pipeline::run_pipeline`] for the synchronous entry point and
//! [`worker::Processor`] for running files on background tasks of a tokio
//! runtime with progress reporting and cancellation.  The [`api`] module
//! gives the results their external response shapes.
//!
//! # Feature flags
//!
//! - `cli` enables the additional dependencies needed by the CLI
//! - `rayon` (default) runs simplification and statistics for a track in
//!   parallel

pub mod api;
pub mod checkpoint;
pub mod fit;
pub mod geojson;
pub mod geomath;
pub mod gpx;
pub mod kml;
pub mod measure;
pub mod parse;
pub mod pipeline;
pub mod simplify;
pub mod stats;
pub mod tcx;
mod types;
pub mod validate;
pub mod worker;

use serde::Serialize;
use strum::Display;
use thiserror::Error;

pub use crate::parse::ParseError;
pub use crate::pipeline::{ProcessState, ProcessingContext, TrackRequest};
pub use crate::simplify::SimplificationLevel;
pub use crate::stats::{StatsError, TrackStatistics};
pub use crate::types::{GeoPoint, Track, Trackpoint, TypeError};
pub use crate::validate::{FileType, ValidationError};

#[derive(Error, Debug)]
pub enum TrackPipeError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("statistics failed: {0}")]
    Stats(#[from] StatsError),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot start background worker: {0}")]
    WorkerInit(String),
    #[error("background worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, TrackPipeError>;

/// A machine-checkable classification of a [`TrackPipeError`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedFormat,
    SizeExceeded,
    MalformedContent,
    ParseError,
    InsufficientData,
    MissingTimestamps,
    InvalidQuery,
    IoError,
    WorkerInitError,
    WorkerFailed,
    Cancelled,
}

impl TrackPipeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackPipeError::Validation(ValidationError::UnsupportedFormat(_)) => {
                ErrorKind::UnsupportedFormat
            }
            TrackPipeError::Validation(ValidationError::SizeExceeded { .. }) => {
                ErrorKind::SizeExceeded
            }
            TrackPipeError::Validation(ValidationError::MalformedContent(_)) => {
                ErrorKind::MalformedContent
            }
            TrackPipeError::Parse(err) if err.is_cancelled() => ErrorKind::Cancelled,
            TrackPipeError::Parse(_) => ErrorKind::ParseError,
            TrackPipeError::Stats(StatsError::InsufficientData { .. }) => {
                ErrorKind::InsufficientData
            }
            TrackPipeError::Stats(StatsError::MissingTimestamps { .. }) => {
                ErrorKind::MissingTimestamps
            }
            TrackPipeError::Stats(StatsError::Cancelled(_)) => ErrorKind::Cancelled,
            TrackPipeError::InvalidQuery(_) => ErrorKind::InvalidQuery,
            TrackPipeError::Io(_) => ErrorKind::IoError,
            TrackPipeError::WorkerInit(_) => ErrorKind::WorkerInitError,
            TrackPipeError::Worker(_) => ErrorKind::WorkerFailed,
        }
    }

    /// The pipeline state in which the error arose, if it arose in the
    /// pipeline.
    pub fn phase(&self) -> Option<ProcessState> {
        match self {
            TrackPipeError::Validation(_) => Some(ProcessState::Validating),
            TrackPipeError::Parse(_) => Some(ProcessState::Parsing),
            TrackPipeError::Stats(_) => Some(ProcessState::Analyzing),
            TrackPipeError::WorkerInit(_) => Some(ProcessState::Idle),
            TrackPipeError::InvalidQuery(_) | TrackPipeError::Io(_) | TrackPipeError::Worker(_) => {
                None
            }
        }
    }
}
