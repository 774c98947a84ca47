//! Worker harnesses: the peer processes of a stage that execute user logic.
//!
//! The pull-push flavor handles one request at a time and may emit any
//! number of responses per request; the collate flavor buffers its whole
//! input and emits a single aggregated response. Both account with exactly
//! one `EndOfTask` per unit of work — per request for pull-push, per run for
//! collate — so downstream scaffolds can close their counts even when user
//! code fails.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, WorkerError};
use crate::message::Message;
use crate::scaffold::{LifecycleCallback, DEFAULT_SETTLE};
use crate::socket::{PullSocket, PushSocket, RetryPolicy, SubSocket};

/// Per-message user logic for a pull-push stage.
///
/// `init` runs once inside the worker process, after spawn, so
/// resource-heavy state (models, file handles) is constructed post-fork.
#[async_trait]
pub trait Worker: Send {
    async fn init(&mut self) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Handle one request, yielding zero or more responses.
    async fn handle(&mut self, request: Message) -> Result<Vec<Message>, WorkerError>;
}

/// Accumulating user logic for a collate stage: the whole input of the stage
/// is folded into one response (e.g. merging batch artifacts).
#[async_trait]
pub trait CollateWorker: Send {
    async fn init(&mut self) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Fold every buffered request into a single response.
    async fn collate(&mut self, requests: Vec<Message>) -> Result<Message, WorkerError>;
}

/// A value that may be expensive to build and therefore is deferred until
/// the worker process is running: either the value itself or a builder the
/// harness-side `init` resolves exactly once.
pub enum Deferred<T> {
    Ready(T),
    Builder(Box<dyn FnOnce() -> Result<T, WorkerError> + Send>),
}

impl<T> Deferred<T> {
    pub fn builder<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<T, WorkerError> + Send + 'static,
    {
        Deferred::Builder(Box::new(f))
    }

    pub fn resolve(self) -> Result<T, WorkerError> {
        match self {
            Deferred::Ready(value) => Ok(value),
            Deferred::Builder(build) => build(),
        }
    }
}

/// The three ports a worker connects to: the preceding scaffold's data push,
/// the succeeding scaffold's data pull, and the control channel carrying its
/// shutdown broadcast.
#[derive(Debug, Clone, Copy)]
pub struct WorkerEndpoints {
    pub pull_port: u16,
    pub push_port: u16,
    pub control_port: u16,
}

pub type RequestCallback = Box<dyn Fn(&Message) + Send>;
pub type FailureCallback = Box<dyn Fn(&WorkerError) + Send>;

pub struct WorkerOptions {
    pub settle: Duration,
    /// Wall-clock bound on the whole run; `None` waits for `EndOfProcess`.
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub on_startup: Option<LifecycleCallback>,
    pub on_request: Option<RequestCallback>,
    pub on_failure: Option<FailureCallback>,
    pub on_closure: Option<LifecycleCallback>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            settle: DEFAULT_SETTLE,
            timeout: None,
            retry: RetryPolicy::default(),
            on_startup: None,
            on_request: None,
            on_failure: None,
            on_closure: None,
        }
    }
}

/// Final accounting of one worker run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    /// Requests pulled and dispatched to user logic.
    pub handled: u64,
    /// Responses pushed downstream.
    pub responses: u64,
    /// User-logic failures reported to `on_failure`.
    pub failures: u64,
}

async fn wait_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Run a pull-push worker until `EndOfProcess`, timeout, or a fatal
/// envelope/transport error.
///
/// The worker itself is built by `factory` inside this call, after the
/// hosting process/task exists. A failing `handle` is reported to
/// `on_failure` and still accounted with an `EndOfTask`, so downstream
/// counts close; there is no retry.
pub async fn run_worker<W, F>(
    factory: F,
    endpoints: WorkerEndpoints,
    options: WorkerOptions,
) -> Result<WorkerSummary, PipelineError>
where
    W: Worker,
    F: FnOnce() -> W + Send,
{
    if let Some(cb) = &options.on_startup {
        cb();
    }

    let mut worker = factory();
    worker.init().await.map_err(PipelineError::from)?;

    let mut pull = PullSocket::connect(endpoints.pull_port, &options.retry).await?;
    let mut push = PushSocket::connect(endpoints.push_port, &options.retry).await?;
    let mut control = SubSocket::connect(endpoints.control_port, &options.retry).await?;
    tokio::time::sleep(options.settle).await;

    let deadline = options.timeout.map(|t| tokio::time::Instant::now() + t);
    let mut summary = WorkerSummary::default();
    let mut pull_open = true;

    loop {
        tokio::select! {
            item = pull.recv(), if pull_open => match item {
                Some(Ok(request)) => {
                    if let Some(cb) = &options.on_request {
                        cb(&request);
                    }
                    summary.handled += 1;
                    match worker.handle(request).await {
                        Ok(responses) => {
                            for response in &responses {
                                push.send(response).await?;
                                summary.responses += 1;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "worker task failed");
                            summary.failures += 1;
                            if let Some(cb) = &options.on_failure {
                                cb(&e);
                            }
                        }
                    }
                    push.send(&Message::end_of_task()).await?;
                }
                Some(Err(e)) => return Err(e),
                None => {
                    debug!("upstream closed the data stream");
                    pull_open = false;
                }
            },
            item = control.recv() => match item {
                Some(Ok(msg)) if msg.is_end_of_process() => {
                    debug!("end of process received");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
                None => {
                    debug!("control channel closed");
                    break;
                }
            },
            _ = wait_deadline(deadline) => {
                info!("worker timed out");
                break;
            }
        }
    }

    if let Some(cb) = &options.on_closure {
        cb();
    }
    info!(
        handled = summary.handled,
        responses = summary.responses,
        failures = summary.failures,
        "worker finished"
    );
    Ok(summary)
}

/// Run a collate worker: buffer every inbound request until the data stream
/// reaches EOF, then fold the buffer into one response and account with a
/// single `EndOfTask`.
///
/// The *upstream* scaffold's `EndOfProcess` marks end-of-input, but nothing
/// is folded on it alone: the pull stream is always drained to EOF (the
/// scaffold closes its push socket right after broadcasting), so a request
/// still in flight is never discarded. The wall-clock timeout is the only
/// other way out of the drain loop.
///
/// The scaffold upstream of a collate stage announces a fixed count (one per
/// collate worker) downstream, so the single `EndOfTask` closes the
/// accounting exactly.
pub async fn run_collate_worker<W, F>(
    factory: F,
    endpoints: WorkerEndpoints,
    options: WorkerOptions,
) -> Result<WorkerSummary, PipelineError>
where
    W: CollateWorker,
    F: FnOnce() -> W + Send,
{
    if let Some(cb) = &options.on_startup {
        cb();
    }

    let mut worker = factory();
    worker.init().await.map_err(PipelineError::from)?;

    let mut pull = PullSocket::connect(endpoints.pull_port, &options.retry).await?;
    let mut push = PushSocket::connect(endpoints.push_port, &options.retry).await?;
    let mut control = SubSocket::connect(endpoints.control_port, &options.retry).await?;
    tokio::time::sleep(options.settle).await;

    let deadline = options.timeout.map(|t| tokio::time::Instant::now() + t);
    let mut summary = WorkerSummary::default();
    let mut buffer: Vec<Message> = Vec::new();
    let mut input_done = false;

    loop {
        tokio::select! {
            item = pull.recv() => match item {
                Some(Ok(msg)) if msg.is_end_of_task() => {}
                Some(Ok(msg)) => {
                    if let Some(cb) = &options.on_request {
                        cb(&msg);
                    }
                    summary.handled += 1;
                    buffer.push(msg);
                }
                Some(Err(e)) => return Err(e),
                None => {
                    debug!(buffered = buffer.len(), "data stream drained");
                    break;
                }
            },
            item = control.recv(), if !input_done => match item {
                Some(Ok(msg)) if msg.is_end_of_process() => {
                    debug!("upstream finished; draining remaining input to EOF");
                    input_done = true;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
                None => {
                    input_done = true;
                }
            },
            _ = wait_deadline(deadline) => {
                info!(buffered = buffer.len(), "collate worker timed out");
                break;
            }
        }
    }

    if !buffer.is_empty() {
        let buffered = buffer.len() as u64;
        match worker.collate(buffer).await {
            Ok(response) => {
                push.send(&response).await?;
                summary.responses += 1;
                info!(buffered, "collated");
            }
            Err(e) => {
                warn!(error = %e, "collate failed");
                summary.failures += 1;
                if let Some(cb) = &options.on_failure {
                    cb(&e);
                }
            }
        }
    }
    push.send(&Message::end_of_task()).await?;

    if let Some(cb) = &options.on_closure {
        cb();
    }
    Ok(summary)
}
