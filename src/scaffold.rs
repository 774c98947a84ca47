//! Scaffold runtimes: the coordinator process of each pipeline stage.
//!
//! A ventilator seeds the pipeline from an input sequence, collators
//! transform-and-forward between worker stages, a parallel scaffold
//! broadcasts into K branches, and a sink drains the tail. All of them share
//! the same termination protocol: count `EndOfTask` tokens until the
//! upstream's announced total is reached, then announce their own total
//! downstream and broadcast `EndOfProcess` to the workers feeding them.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{ConfigError, EnvelopeError, PipelineError, ScaffoldError};
use crate::flow::{Announcement, FlowControl};
use crate::message::{Message, FILE_PATH_KEY};
use crate::socket::{PairSocket, PubSocket, PullSocket, PushSocket, RetryPolicy};

/// Post-bind settling interval before a scaffold emits traffic (and before a
/// worker starts reading). Connects are retried with backoff regardless, so
/// this only smooths startup on slow nodes.
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(5);

/// Hook invoked at scaffold/worker startup or closure.
pub type LifecycleCallback = Box<dyn Fn() + Send>;

/// Options shared by every scaffold runtime.
pub struct ScaffoldOptions {
    pub settle: Duration,
    pub retry: RetryPolicy,
    /// What to announce downstream once accounting closes.
    pub announce: Announcement,
    pub on_startup: Option<LifecycleCallback>,
    pub on_closure: Option<LifecycleCallback>,
}

impl Default for ScaffoldOptions {
    fn default() -> Self {
        Self {
            settle: DEFAULT_SETTLE,
            retry: RetryPolicy::default(),
            announce: Announcement::Emitted,
            on_startup: None,
            on_closure: None,
        }
    }
}

impl ScaffoldOptions {
    fn startup(&self) {
        if let Some(cb) = &self.on_startup {
            cb();
        }
    }

    fn closure(&self) {
        if let Some(cb) = &self.on_closure {
            cb();
        }
    }
}

/// Final accounting of one scaffold run, for callers and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScaffoldSummary {
    /// Data messages this scaffold emitted on its push socket(s).
    pub emitted: u64,
    /// `EndOfTask` tokens received on the data pull socket.
    pub end_of_tasks: u64,
    /// Count announced downstream via `ExpectedNItems`.
    pub announced: u64,
}

/// Source scaffold: turns an input sequence into one request per element,
/// then announces the total on the scaffold pair channel.
///
/// An error from `request_fn` aborts the stage; no partial count is
/// announced.
pub async fn run_ventilator<I, F>(
    input: I,
    mut request_fn: F,
    push_port: u16,
    pair_port: u16,
    options: ScaffoldOptions,
) -> Result<ScaffoldSummary, PipelineError>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Result<Message, ScaffoldError>,
{
    options.startup();

    let mut push = PushSocket::bind(push_port).await?;
    let mut pair_out = PairSocket::bind(pair_port).await?;
    tokio::time::sleep(options.settle).await;

    let mut flow = FlowControl::new();
    for element in input {
        let msg = request_fn(element)?;
        push.send(&msg).await?;
        flow.record_emitted();
    }

    let announced = flow.announced(options.announce);
    pair_out.send(&Message::expected_n_items(announced)).await?;
    info!(emitted = flow.emitted(), announced, "ventilator finished");

    options.closure();
    Ok(ScaffoldSummary {
        emitted: flow.emitted(),
        end_of_tasks: 0,
        announced,
    })
}

/// Transform scaffold: pulls worker output, applies `transform`, pushes the
/// result to the next stage, and keeps the fan-in/fan-out accounting.
pub async fn run_collator<F>(
    mut transform: F,
    pull_port: u16,
    push_port: u16,
    control_port: u16,
    pair_in_port: u16,
    pair_out_port: u16,
    options: ScaffoldOptions,
) -> Result<ScaffoldSummary, PipelineError>
where
    F: FnMut(&str, Option<i64>, Message) -> Result<Message, ScaffoldError>,
{
    options.startup();

    let mut pull = PullSocket::bind(pull_port).await?;
    let mut push = PushSocket::bind(push_port).await?;
    let mut control = PubSocket::bind(control_port).await?;
    let mut pair_out = PairSocket::bind(pair_out_port).await?;
    let mut pair_in = PairSocket::connect(pair_in_port, &options.retry).await?;
    tokio::time::sleep(options.settle).await;

    let mut flow = FlowControl::new();
    let mut pair_open = true;
    while !flow.closed() {
        tokio::select! {
            item = pull.recv() => match item {
                Some(Ok(msg)) if msg.is_end_of_task() => flow.record_end_of_task(),
                Some(Ok(msg)) => {
                    let file_path = match msg.file_path() {
                        Some(p) => p.to_owned(),
                        None => {
                            let _ = control.publish(&Message::end_of_process()).await;
                            return Err(EnvelopeError::MissingField(FILE_PATH_KEY).into());
                        }
                    };
                    let batch_id = msg.batch_id();
                    match transform(&file_path, batch_id, msg) {
                        Ok(out) => {
                            push.send(&out).await?;
                            flow.record_emitted();
                        }
                        Err(e) => {
                            let _ = control.publish(&Message::end_of_process()).await;
                            return Err(e.into());
                        }
                    }
                }
                Some(Err(e)) => {
                    let _ = control.publish(&Message::end_of_process()).await;
                    return Err(e);
                }
                None => {
                    let _ = control.publish(&Message::end_of_process()).await;
                    return Err(ScaffoldError::DataPlaneClosed.into());
                }
            },
            item = pair_in.recv(), if pair_open => match item {
                Some(Ok(msg)) if msg.is_expected_n_items() => {
                    if let Some(n) = msg.n_items() {
                        debug!(expected = n, "upstream announced total");
                        flow.set_expected(n);
                    }
                }
                Some(Ok(msg)) => {
                    warn!(?msg, "unexpected message on scaffold pair");
                }
                Some(Err(e)) => {
                    let _ = control.publish(&Message::end_of_process()).await;
                    return Err(e);
                }
                None => {
                    pair_open = false;
                    if flow.expected().is_none() {
                        let _ = control.publish(&Message::end_of_process()).await;
                        return Err(ScaffoldError::DataPlaneClosed.into());
                    }
                }
            },
        }
    }

    let announced = flow.announced(options.announce);
    pair_out.send(&Message::expected_n_items(announced)).await?;
    control.publish(&Message::end_of_process()).await?;
    info!(
        end_of_tasks = flow.end_of_tasks(),
        emitted = flow.emitted(),
        announced,
        "collator finished"
    );

    options.closure();
    Ok(ScaffoldSummary {
        emitted: flow.emitted(),
        end_of_tasks: flow.end_of_tasks(),
        announced,
    })
}

/// Broadcast scaffold: forwards every data message, unchanged, to each of K
/// branch push sockets, and announces its count to each branch's scaffold
/// independently.
pub async fn run_parallel(
    pull_port: u16,
    push_ports: Vec<u16>,
    control_port: u16,
    pair_in_port: u16,
    pair_out_ports: Vec<u16>,
    options: ScaffoldOptions,
) -> Result<ScaffoldSummary, PipelineError> {
    if push_ports.len() != pair_out_ports.len() || push_ports.is_empty() {
        return Err(ConfigError::BranchMismatch {
            pushes: push_ports.len(),
            pairs: pair_out_ports.len(),
        }
        .into());
    }

    options.startup();

    let mut pull = PullSocket::bind(pull_port).await?;
    let mut control = PubSocket::bind(control_port).await?;
    let mut pushes = Vec::with_capacity(push_ports.len());
    for &port in &push_ports {
        pushes.push(PushSocket::bind(port).await?);
    }
    let mut pair_outs = Vec::with_capacity(pair_out_ports.len());
    for &port in &pair_out_ports {
        pair_outs.push(PairSocket::bind(port).await?);
    }
    let mut pair_in = PairSocket::connect(pair_in_port, &options.retry).await?;
    tokio::time::sleep(options.settle).await;

    let mut flow = FlowControl::new();
    let mut pair_open = true;
    while !flow.closed() {
        tokio::select! {
            item = pull.recv() => match item {
                Some(Ok(msg)) if msg.is_end_of_task() => flow.record_end_of_task(),
                Some(Ok(msg)) => {
                    for push in &mut pushes {
                        push.send(&msg).await?;
                    }
                    flow.record_emitted();
                }
                Some(Err(e)) => {
                    let _ = control.publish(&Message::end_of_process()).await;
                    return Err(e);
                }
                None => {
                    let _ = control.publish(&Message::end_of_process()).await;
                    return Err(ScaffoldError::DataPlaneClosed.into());
                }
            },
            item = pair_in.recv(), if pair_open => match item {
                Some(Ok(msg)) if msg.is_expected_n_items() => {
                    if let Some(n) = msg.n_items() {
                        flow.set_expected(n);
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = control.publish(&Message::end_of_process()).await;
                    return Err(e);
                }
                None => {
                    pair_open = false;
                    if flow.expected().is_none() {
                        let _ = control.publish(&Message::end_of_process()).await;
                        return Err(ScaffoldError::DataPlaneClosed.into());
                    }
                }
            },
        }
    }

    let announced = flow.announced(options.announce);
    for pair_out in &mut pair_outs {
        pair_out.send(&Message::expected_n_items(announced)).await?;
    }
    control.publish(&Message::end_of_process()).await?;
    info!(
        end_of_tasks = flow.end_of_tasks(),
        branches = pushes.len(),
        announced,
        "parallel finished"
    );

    options.closure();
    Ok(ScaffoldSummary {
        emitted: flow.emitted(),
        end_of_tasks: flow.end_of_tasks(),
        announced,
    })
}

/// Terminal scaffold: counts `EndOfTask` arrivals until the announced total
/// is reached, then broadcasts `EndOfProcess` and exits. Data responses
/// reaching the sink are dropped; workers of the last stage are expected to
/// have written their artifacts themselves.
pub async fn run_sink(
    pull_port: u16,
    control_port: u16,
    pair_in_port: u16,
    options: ScaffoldOptions,
) -> Result<ScaffoldSummary, PipelineError> {
    options.startup();

    let mut pull = PullSocket::bind(pull_port).await?;
    let mut control = PubSocket::bind(control_port).await?;
    let mut pair_in = PairSocket::connect(pair_in_port, &options.retry).await?;
    tokio::time::sleep(options.settle).await;

    let mut flow = FlowControl::new();
    let mut pair_open = true;
    while !flow.closed() {
        tokio::select! {
            item = pull.recv() => match item {
                Some(Ok(msg)) if msg.is_end_of_task() => flow.record_end_of_task(),
                Some(Ok(msg)) => {
                    debug!(file_path = msg.file_path(), "sink drained response");
                }
                Some(Err(e)) => {
                    let _ = control.publish(&Message::end_of_process()).await;
                    return Err(e);
                }
                None => {
                    let _ = control.publish(&Message::end_of_process()).await;
                    return Err(ScaffoldError::DataPlaneClosed.into());
                }
            },
            item = pair_in.recv(), if pair_open => match item {
                Some(Ok(msg)) if msg.is_expected_n_items() => {
                    if let Some(n) = msg.n_items() {
                        flow.set_expected(n);
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = control.publish(&Message::end_of_process()).await;
                    return Err(e);
                }
                None => {
                    pair_open = false;
                    if flow.expected().is_none() {
                        let _ = control.publish(&Message::end_of_process()).await;
                        return Err(ScaffoldError::DataPlaneClosed.into());
                    }
                }
            },
        }
    }

    control.publish(&Message::end_of_process()).await?;
    info!(end_of_tasks = flow.end_of_tasks(), "sink finished");

    options.closure();
    Ok(ScaffoldSummary {
        emitted: 0,
        end_of_tasks: flow.end_of_tasks(),
        announced: 0,
    })
}
