pub mod config;
pub mod envelope;
pub mod error;
pub mod flow;
pub mod message;
pub mod pipeline;
pub mod scaffold;
pub mod socket;
pub mod worker;

pub use config::{
    collator_prefix, demux, subset, validate_worker_options, ExtractionConfig, FilterBound,
    InferenceConfig, MergeConfig, Options, RecordFilter, StageConfig, ToCsvConfig, TrainConfig,
    TuningOverrides, EXTRACTION_WORKER_PREFIX, INFERENCE_WORKER_PREFIX, MERGE_WORKER_PREFIX,
    SINK_PREFIX, TOCSV_WORKER_PREFIX, TRAIN_WORKER_PREFIX, VENTILATOR_PREFIX,
};
pub use error::{
    ConfigError, EnvelopeError, PipelineError, Result, ScaffoldError, TransportError, WorkerError,
};
pub use flow::{Announcement, FlowControl};
pub use message::{
    body_key, header_key, ElementType, Message, NdArray, RequestTag, ATTRIBUTE_SEP, BATCH_ID_KEY,
    BODY_KEY, FILE_PATH_KEY, HEADER_KEY, KEY_SEP, N_ITEMS_KEY, REQUEST_TYPE_KEY,
};
pub use pipeline::{
    Pipeline, PipelineHandles, PipelineOptions, PipelineReport, RequestFn, StageKind, StageSpec,
    TransformFn,
};
pub use scaffold::{
    run_collator, run_parallel, run_sink, run_ventilator, LifecycleCallback, ScaffoldOptions,
    ScaffoldSummary, DEFAULT_SETTLE,
};
pub use socket::{PairSocket, PubSocket, PullSocket, PushSocket, RetryPolicy, SubSocket};
pub use worker::{
    run_collate_worker, run_worker, CollateWorker, Deferred, Worker, WorkerEndpoints,
    WorkerOptions, WorkerSummary,
};
