/// Errors from the message envelope codec.
///
/// All of these are fatal to the receiving process: a peer that emits a
/// malformed envelope cannot be resynchronised with.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("bad frame count: metadata declares {declared} arrays but {got} frames followed")]
    BadFrameCount { declared: usize, got: usize },
    #[error("unknown element type: {0:?}")]
    UnknownElementType(String),
    #[error("array {field}: metadata declares {declared} bytes but frame carries {got}")]
    SizeMismatch {
        field: String,
        declared: usize,
        got: usize,
    },
    #[error("unknown request tag: {0:?}")]
    UnknownTag(String),
    #[error("message has no {0} field")]
    MissingField(&'static str),
    #[error("array shapes disagree: {0:?} vs {1:?}")]
    ShapeMismatch(Vec<usize>, Vec<usize>),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from the loopback-TCP socket fabric.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to 127.0.0.1:{port} failed after {attempts} attempt(s): {source}")]
    ConnectFailed {
        port: u16,
        attempts: u32,
        source: std::io::Error,
    },
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
    #[error("peer closed mid-message")]
    TruncatedMessage,
    #[error("socket closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while assembling a pipeline, before any process spawns.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("expected {expected} {list} entries for {stages} stage(s), got {got}")]
    PortCountMismatch {
        list: &'static str,
        expected: usize,
        got: usize,
        stages: usize,
    },
    #[error("parallel scaffold has {pushes} push port(s) but {pairs} pair-out port(s)")]
    BranchMismatch { pushes: usize, pairs: usize },
    #[error("pipeline has no stages")]
    EmptyStages,
    #[error("stage {0} has zero workers")]
    ZeroWorkers(usize),
    #[error("stage 0 cannot be a collate stage: the ventilator has no control channel")]
    CollateAtHead,
    #[error("unknown filter constraint {constraint:?} in filter {key:?} (expected min_* or max_*)")]
    UnknownFilterConstraint { key: String, constraint: String },
    #[error("fluorescence input requested but no fluorescence keys configured")]
    FluorescenceWithoutKeys,
    #[error("options with prefix {prefix:?} did not deserialize: {source}")]
    Demux {
        prefix: String,
        source: serde_json::Error,
    },
}

/// Errors from a worker process.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker init failed: {0}")]
    Init(String),
    #[error("task failed: {0}")]
    Task(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
}

/// Errors from a scaffold process.
#[derive(Debug, thiserror::Error)]
pub enum ScaffoldError {
    #[error("transform failed for {file_path:?}: {reason}")]
    Transform { file_path: String, reason: String },
    #[error("request function failed: {0}")]
    Request(String),
    #[error("data plane closed before accounting finished")]
    DataPlaneClosed,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
}

/// Top-level pipeline error.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
    #[error("scaffold error: {0}")]
    Scaffold(#[from] ScaffoldError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, PipelineError>;
