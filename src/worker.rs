//! Background processing on the tokio runtime
//!
//! A [`Processor`] runs each submitted file through the pipeline on its own
//! blocking task, so that CPU-bound parsing and analysis never stall the
//! async threads serving interactive requests.  The task and its caller
//! share nothing but the moved-in request: the caller receives a stream of
//! [`ProcessEvent`]s over a channel, ending in exactly one
//! [`ProcessEvent::Finished`] unless the job was cancelled.
//!
//! Dropping or cancelling a [`ProcessHandle`] sets the job's cancel flag,
//! which the pipeline observes at its next checkpoint.  No event is
//! delivered through a handle after it is cancelled.

use std::path::Path;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::TrackPipeError;
use crate::checkpoint::CancelFlag;
use crate::pipeline::{
    Observer, PipelineFailure, ProcessOutput, ProcessState, ProcessingContext, TrackRequest,
    run_pipeline,
};
use crate::simplify::SimplificationLevel;

/// A message from a worker to its caller.
#[derive(Debug)]
pub enum ProcessEvent {
    State(ProcessState),
    /// Percentage complete, non-decreasing over the life of a job.
    Progress(u8),
    /// The terminal result.  Always the last event of a job.
    Finished(Result<Box<ProcessOutput>, TrackPipeError>),
}

/// Forwards pipeline observations into the job's channel.
struct ChannelObserver<'a> {
    events: &'a UnboundedSender<ProcessEvent>,
    cancel: &'a CancelFlag,
}

impl ChannelObserver<'_> {
    fn send(&self, event: ProcessEvent) {
        // A closed channel means the caller has gone away.
        if self.events.send(event).is_err() {
            self.cancel.cancel();
        }
    }
}

impl Observer for ChannelObserver<'_> {
    fn on_state(&self, state: ProcessState) {
        self.send(ProcessEvent::State(state));
    }

    fn on_progress(&self, percent: u8) {
        self.send(ProcessEvent::Progress(percent));
    }
}

/// Submits files for background processing with a shared context.
#[derive(Clone, Debug, Default)]
pub struct Processor {
    context: Arc<ProcessingContext>,
}

impl Processor {
    pub fn new(context: ProcessingContext) -> Self {
        Self {
            context: Arc::new(context),
        }
    }

    pub fn context(&self) -> &ProcessingContext {
        &self.context
    }

    /// Starts processing `request` on a blocking task of the current tokio
    /// runtime.
    ///
    /// Fails with [`TrackPipeError::WorkerInit`] when called outside a
    /// runtime.
    pub fn submit(&self, request: TrackRequest) -> Result<ProcessHandle, TrackPipeError> {
        let runtime = Handle::try_current().map_err(|e| TrackPipeError::WorkerInit(e.to_string()))?;
        let (tx, rx) = unbounded_channel();
        let cancel = CancelFlag::new();
        let correlation_id = request.correlation_id.clone();

        let context = Arc::clone(&self.context);
        let worker_cancel = cancel.clone();
        let task = runtime.spawn_blocking(move || {
            let observer = ChannelObserver {
                events: &tx,
                cancel: &worker_cancel,
            };
            let result = match run_pipeline(&request, &context, &observer, &worker_cancel) {
                Ok(output) => Ok(Box::new(output)),
                Err(PipelineFailure::Failed(err)) => Err(err),
                Err(PipelineFailure::Cancelled) => {
                    debug!("Job {} cancelled", request.correlation_id);
                    return;
                }
            };
            if !worker_cancel.is_cancelled() {
                observer.send(ProcessEvent::Finished(result));
            }
        });

        info!("Submitted {} for processing", correlation_id);
        Ok(ProcessHandle {
            correlation_id,
            events: rx,
            cancel,
            task: Some(task),
        })
    }

    /// Reads `path` asynchronously, then submits it for processing.  The
    /// file name selects the format.
    pub async fn submit_path(
        &self,
        path: impl AsRef<Path>,
        correlation_id: impl Into<String>,
        level: SimplificationLevel,
    ) -> Result<ProcessHandle, TrackPipeError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.submit(TrackRequest::new(correlation_id, file_name, bytes).with_level(level))
    }
}

/// The caller's side of one background job.
#[derive(Debug)]
pub struct ProcessHandle {
    correlation_id: String,
    events: UnboundedReceiver<ProcessEvent>,
    cancel: CancelFlag,
    task: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Receives the job's next event, or `None` once the job has ended
    /// without a further event or has been cancelled.
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let event = self.events.recv().await;
        if self.cancel.is_cancelled() {
            return None;
        }
        event
    }

    /// Abandons the job.  The worker stops at its next checkpoint and
    /// nothing further is delivered through this handle.
    pub fn cancel(&mut self) {
        debug!("Cancelling job {}", self.correlation_id);
        self.cancel.cancel();
        self.events.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits for the job's result, discarding intermediate events.
    pub async fn wait(mut self) -> Result<ProcessOutput, PipelineFailure> {
        while let Some(event) = self.next_event().await {
            if let ProcessEvent::Finished(result) = event {
                return result.map(|output| *output).map_err(PipelineFailure::Failed);
            }
        }

        // The channel closed without a result: either the job was cancelled
        // or the worker panicked.
        if let Some(task) = self.task.take() {
            task.await.map_err(TrackPipeError::Worker)?;
        }
        Err(PipelineFailure::Cancelled)
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
