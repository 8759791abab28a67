//! Cooperative cancellation and progress reporting
//!
//! Long-running stages (parsing, statistics, simplification) accept a
//! [`Checkpoint`] and call into it at bounded intervals of work.  A checkpoint
//! observes an optional [`CancelFlag`], shared with whoever may abort the job,
//! and forwards fractional progress to an optional callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

/// Number of work items between cancellation checks, unless overridden.
pub const DEFAULT_CHECK_INTERVAL: usize = 4096;

/// The job observed a cancellation request and stopped early.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("processing was cancelled")]
pub struct Cancelled;

/// A shareable, idempotent cancellation request.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.  Calling this more than once has no further
    /// effect.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

type ProgressFn<'a> = &'a (dyn Fn(f64) + Sync);

/// A point at which a stage may observe cancellation and report progress.
#[derive(Clone, Copy)]
pub struct Checkpoint<'a> {
    cancel: Option<&'a CancelFlag>,
    progress: Option<ProgressFn<'a>>,
    interval: usize,
}

impl<'a> Checkpoint<'a> {
    /// A checkpoint that can never be cancelled and reports nowhere.
    pub fn unbounded() -> Self {
        Self {
            cancel: None,
            progress: None,
            interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    pub fn new(cancel: &'a CancelFlag, interval: usize) -> Self {
        Self {
            cancel: Some(cancel),
            progress: None,
            interval: interval.max(1),
        }
    }

    /// Attaches a callback receiving the stage's completed fraction, in
    /// `[0, 1]`.
    pub fn with_progress(self, progress: ProgressFn<'a>) -> Self {
        Self {
            progress: Some(progress),
            ..self
        }
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    /// Observes cancellation, then reports `fraction` if one is given.
    pub fn check(&self, fraction: Option<f64>) -> Result<(), Cancelled> {
        if let Some(cancel) = self.cancel {
            cancel.check()?;
        }
        if let (Some(progress), Some(fraction)) = (self.progress, fraction) {
            progress(fraction.clamp(0.0, 1.0));
        }
        Ok(())
    }

    /// Returns a ticker that calls [`Checkpoint::check`] once every
    /// `interval` ticks.
    pub fn ticker(&self) -> Ticker<'a> {
        Ticker {
            checkpoint: *self,
            count: 0,
            next_check: self.interval,
        }
    }
}

impl Default for Checkpoint<'_> {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Counts units of work against a [`Checkpoint`]'s interval.
pub struct Ticker<'a> {
    checkpoint: Checkpoint<'a>,
    count: usize,
    next_check: usize,
}

impl Ticker<'_> {
    /// Records one unit of work.  `fraction` is only evaluated when a check is
    /// due.
    pub fn tick<F>(&mut self, fraction: F) -> Result<(), Cancelled>
    where
        F: FnOnce() -> f64,
    {
        self.count += 1;
        if self.count >= self.next_check {
            self.next_check = self.count + self.checkpoint.interval;
            self.checkpoint.check(Some(fraction()))?;
        }
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::{CancelFlag, Cancelled, Checkpoint};

    #[test]
    fn test_cancel_is_idempotent() {
        let flag = CancelFlag::new();
        assert_eq!(flag.check(), Ok(()));
        flag.cancel();
        flag.cancel();
        assert!(flag.is_cancelled());
        assert_eq!(flag.check(), Err(Cancelled));
    }

    #[test]
    fn test_cancel_shared_between_clones() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        other.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_ticker_checks_at_interval() {
        let flag = CancelFlag::new();
        let reports = Mutex::new(vec![]);
        let report = |f: f64| reports.lock().unwrap().push(f);
        let checkpoint = Checkpoint::new(&flag, 3).with_progress(&report);

        let mut ticker = checkpoint.ticker();
        for i in 1..=7 {
            ticker.tick(|| i as f64 / 10.0).unwrap();
        }
        assert_eq!(*reports.lock().unwrap(), vec![0.3, 0.6]);

        flag.cancel();
        ticker.tick(|| 0.8).unwrap();
        assert_eq!(ticker.tick(|| 0.9), Err(Cancelled));
    }

    #[test]
    fn test_unbounded_never_cancels() {
        let checkpoint = Checkpoint::unbounded();
        let mut ticker = checkpoint.ticker();
        for _ in 0..10_000 {
            assert!(ticker.tick(|| 0.0).is_ok());
        }
        assert_eq!(ticker.count(), 10_000);
    }

    #[test]
    fn test_progress_is_clamped() {
        let reports = Mutex::new(vec![]);
        let report = |f: f64| reports.lock().unwrap().push(f);
        let checkpoint = Checkpoint::unbounded().with_progress(&report);
        checkpoint.check(Some(1.5)).unwrap();
        checkpoint.check(Some(-0.5)).unwrap();
        checkpoint.check(None).unwrap();
        assert_eq!(*reports.lock().unwrap(), vec![1.0, 0.0]);
    }
}
