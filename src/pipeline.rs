//! The validate, parse and analyze pipeline for one file
//!
//! [`run_pipeline`] drives a single file through the [`ProcessState`]
//! machine, reporting state changes and a monotonic percentage to an
//! [`Observer`].  Once a track is parsed, simplification and statistics run
//! side by side over the same immutable [`Track`], on the rayon pool when the
//! `rayon` feature is enabled.
//!
//! Cancellation is cooperative: the pipeline checks its [`CancelFlag`] on
//! every state change and at bounded intervals inside each stage, and never
//! calls the observer again once the flag is set.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use strum::Display;
use thiserror::Error;
use tracing::{debug, warn};

use crate::TrackPipeError;
use crate::checkpoint::{CancelFlag, Cancelled, Checkpoint, DEFAULT_CHECK_INTERVAL};
use crate::geojson::EnhancedGeoJson;
use crate::parse::{ParseError, parse_track};
use crate::simplify::{SimplificationLevel, simplify_with};
use crate::stats::{StatsError, StatsOptions, TrackStatistics, aggregate_with};
use crate::types::Track;
use crate::validate::{FileType, ValidationError, ValidationOptions, validate};

/// The lifecycle of one file in the pipeline.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Idle,
    Validating,
    Parsing,
    /// Simplifying and aggregating statistics, concurrently.
    Analyzing,
    Complete,
    Errored,
    Cancelled,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Complete | ProcessState::Errored | ProcessState::Cancelled
        )
    }

    /// Whether the pipeline may move from `self` to `next`.
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        match (self, next) {
            (Idle, Validating) | (Validating, Parsing) | (Parsing, Analyzing) => true,
            (Analyzing, Complete) => true,
            (from, Errored | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Receives a pipeline's state changes and progress.
///
/// Called from the pipeline's own threads, including from the rayon pool
/// during analysis.
pub trait Observer: Sync {
    fn on_state(&self, _state: ProcessState) {}

    /// A completion percentage in `0..=100`, never lower than one previously
    /// reported.
    fn on_progress(&self, _percent: u8) {}
}

/// An observer that ignores everything.
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Settings shared by every file processed in one session.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct ProcessingContext {
    validation: ValidationOptions,
    stats: StatsOptions,
    check_interval: usize,
}

impl Default for ProcessingContext {
    fn default() -> Self {
        Self {
            validation: ValidationOptions::default(),
            stats: StatsOptions::default(),
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

impl ProcessingContext {
    pub fn with_validation(self, validation: ValidationOptions) -> Self {
        Self { validation, ..self }
    }

    pub fn with_stats(self, stats: StatsOptions) -> Self {
        Self { stats, ..self }
    }

    /// Sets the number of points processed between cancellation checks.
    pub fn with_check_interval(self, check_interval: usize) -> Self {
        Self {
            check_interval: check_interval.max(1),
            ..self
        }
    }

    pub fn validation(&self) -> &ValidationOptions {
        &self.validation
    }

    pub fn stats(&self) -> &StatsOptions {
        &self.stats
    }

    pub fn check_interval(&self) -> usize {
        self.check_interval
    }
}

/// One file submitted for processing.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TrackRequest {
    /// Opaque key identifying the activity or journey the file belongs to.
    pub correlation_id: String,
    /// The declared file name, whose extension selects the format.
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub level: SimplificationLevel,
}

impl TrackRequest {
    pub fn new(
        correlation_id: impl Into<String>,
        file_name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            file_name: file_name.into(),
            bytes,
            level: SimplificationLevel::default(),
        }
    }

    pub fn with_level(self, level: SimplificationLevel) -> Self {
        Self { level, ..self }
    }

    fn extension(&self) -> &str {
        Path::new(&self.file_name)
            .extension()
            .and_then(OsStr::to_str)
            .unwrap_or_default()
    }
}

/// The result of a completed pipeline.  The GeoJSON and statistics are
/// computed from the same parsed track.
#[derive(Clone, PartialEq, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutput {
    pub correlation_id: String,
    pub file_type: FileType,
    pub level: SimplificationLevel,
    /// Points dropped because their coordinates could not be read.
    pub skipped_points: usize,
    pub geojson: EnhancedGeoJson,
    pub stats: TrackStatistics,
    #[serde(skip)]
    pub track: Track,
}

/// Why a pipeline produced no output.
#[derive(Error, Debug)]
pub enum PipelineFailure {
    #[error("processing was cancelled")]
    Cancelled,
    #[error(transparent)]
    Failed(#[from] TrackPipeError),
}

impl From<Cancelled> for PipelineFailure {
    fn from(_: Cancelled) -> Self {
        PipelineFailure::Cancelled
    }
}

impl From<ValidationError> for PipelineFailure {
    fn from(err: ValidationError) -> Self {
        PipelineFailure::Failed(err.into())
    }
}

impl From<ParseError> for PipelineFailure {
    fn from(err: ParseError) -> Self {
        if err.is_cancelled() {
            PipelineFailure::Cancelled
        } else {
            PipelineFailure::Failed(err.into())
        }
    }
}

impl From<StatsError> for PipelineFailure {
    fn from(err: StatsError) -> Self {
        match err {
            StatsError::Cancelled(_) => PipelineFailure::Cancelled,
            err => PipelineFailure::Failed(err.into()),
        }
    }
}

/// Relays state and progress to an observer, enforcing monotonic progress
/// and silence after cancellation.
struct Reporter<'a> {
    observer: &'a dyn Observer,
    cancel: &'a CancelFlag,
    last_percent: Mutex<Option<u8>>,
}

impl<'a> Reporter<'a> {
    fn new(observer: &'a dyn Observer, cancel: &'a CancelFlag) -> Self {
        Self {
            observer,
            cancel,
            last_percent: Mutex::new(None),
        }
    }

    fn progress(&self, percent: u8) {
        let percent = percent.min(100);
        // Held across the callback so concurrent stages cannot deliver out
        // of order.
        let mut last = self
            .last_percent
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last.is_some_and(|last| percent <= last) || self.cancel.is_cancelled() {
            return;
        }
        *last = Some(percent);
        self.observer.on_progress(percent);
    }

    /// Reports progress within a stage spanning `base..base + span` percent.
    fn stage_progress(&self, base: u8, span: u8, fraction: f64) {
        let offset = (f64::from(span) * fraction.clamp(0.0, 1.0)).floor() as u8;
        self.progress(base.saturating_add(offset));
    }

    fn enter(
        &self,
        state: &mut ProcessState,
        next: ProcessState,
    ) -> Result<(), PipelineFailure> {
        self.cancel.check()?;
        debug_assert!(state.can_transition_to(next), "{state} -> {next}");
        debug!("{} -> {}", state, next);
        *state = next;
        self.observer.on_state(next);
        Ok(())
    }

    /// Enters a terminal failure state.  Cancellation is never reported.
    fn fail(&self, state: &mut ProcessState, failure: &PipelineFailure) {
        let next = match failure {
            PipelineFailure::Cancelled => ProcessState::Cancelled,
            PipelineFailure::Failed(_) => ProcessState::Errored,
        };
        debug!("{} -> {}", state, next);
        *state = next;
        if next == ProcessState::Errored && !self.cancel.is_cancelled() {
            self.observer.on_state(next);
        }
    }
}

#[cfg(feature = "rayon")]
fn join<A, B, RA, RB>(a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA + Send,
    B: FnOnce() -> RB + Send,
    RA: Send,
    RB: Send,
{
    rayon::join(a, b)
}

#[cfg(not(feature = "rayon"))]
fn join<A, B, RA, RB>(a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA + Send,
    B: FnOnce() -> RB + Send,
    RA: Send,
    RB: Send,
{
    (a(), b())
}

fn run_stages(
    request: &TrackRequest,
    context: &ProcessingContext,
    reporter: &Reporter,
    state: &mut ProcessState,
) -> Result<ProcessOutput, PipelineFailure> {
    let cancel = reporter.cancel;

    reporter.enter(state, ProcessState::Validating)?;
    reporter.progress(0);
    let file = validate(&request.bytes, request.extension(), &context.validation).into_result()?;
    reporter.progress(10);

    reporter.enter(state, ProcessState::Parsing)?;
    let parse_progress = |fraction: f64| reporter.stage_progress(10, 40, fraction);
    let checkpoint =
        Checkpoint::new(cancel, context.check_interval).with_progress(&parse_progress);
    let parsed = parse_track(file.file_type, &request.bytes, &checkpoint)?;
    let track = parsed.track;
    reporter.progress(50);

    reporter.enter(state, ProcessState::Analyzing)?;
    let simplify_progress = |fraction: f64| reporter.stage_progress(50, 45, fraction);
    let simplify_checkpoint =
        Checkpoint::new(cancel, context.check_interval).with_progress(&simplify_progress);
    let stats_checkpoint = Checkpoint::new(cancel, context.check_interval);
    let (geojson, stats) = join(
        || simplify_with(&track, request.level, &simplify_checkpoint),
        || aggregate_with(&track, &context.stats, &stats_checkpoint),
    );
    let geojson = geojson?;
    let stats = stats?;
    reporter.progress(95);

    cancel.check()?;
    Ok(ProcessOutput {
        correlation_id: request.correlation_id.clone(),
        file_type: file.file_type,
        level: request.level,
        skipped_points: parsed.skipped_points,
        geojson,
        stats,
        track,
    })
}

/// Runs one file through validation, parsing, simplification and statistics.
///
/// Returns [`PipelineFailure::Cancelled`] if `cancel` was set before the
/// pipeline completed, in which case the observer has heard nothing since.
#[tracing::instrument(
    level = "debug",
    skip_all,
    fields(correlation_id = %request.correlation_id, file = %request.file_name)
)]
pub fn run_pipeline(
    request: &TrackRequest,
    context: &ProcessingContext,
    observer: &dyn Observer,
    cancel: &CancelFlag,
) -> Result<ProcessOutput, PipelineFailure> {
    let reporter = Reporter::new(observer, cancel);
    let mut state = ProcessState::Idle;

    match run_stages(request, context, &reporter, &mut state) {
        Ok(output) => {
            reporter.progress(100);
            reporter.enter(&mut state, ProcessState::Complete)?;
            Ok(output)
        }
        Err(failure) => {
            if let PipelineFailure::Failed(err) = &failure {
                warn!("Processing {} failed in {}: {}", request.file_name, state, err);
            }
            reporter.fail(&mut state, &failure);
            Err(failure)
        }
    }
}

/// Processes a file in the calling thread, without observation or
/// cancellation.
pub fn process_bytes(
    file_name: &str,
    bytes: Vec<u8>,
    level: SimplificationLevel,
    context: &ProcessingContext,
) -> Result<ProcessOutput, PipelineFailure> {
    let request = TrackRequest::new(file_name, file_name, bytes).with_level(level);
    run_pipeline(&request, context, &NoopObserver, &CancelFlag::new())
}
