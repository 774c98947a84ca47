//! Linear pipeline factory.
//!
//! Assembles a ventilator, one collator per inter-stage boundary, a sink,
//! and the requested number of workers per stage, wired over three parallel
//! port lists:
//!
//! - `ports[0..2S-1]` — even indices are scaffold-to-worker data push ports,
//!   odd indices are worker-to-next-scaffold data pull ports;
//! - `c_ports[0..S-1]` — the control publish port of each scaffold that
//!   receives from workers (collators and the sink);
//! - `s_ports[0..S-1]` — the pair channel from each scaffold to the next.
//!
//! Everything that can be mis-specified is rejected here, before a single
//! task spawns. `run` is fire-and-forget: it spawns all scaffolds and
//! workers and returns their join handles; joining and exit-code policy are
//! the caller's concern.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{
    collator_prefix, demux, validate_worker_options, Options, StageConfig, TuningOverrides,
    SINK_PREFIX, VENTILATOR_PREFIX,
};
use crate::error::{ConfigError, PipelineError, ScaffoldError};
use crate::flow::Announcement;
use crate::message::Message;
use crate::scaffold::{
    run_collator, run_sink, run_ventilator, ScaffoldOptions, ScaffoldSummary, DEFAULT_SETTLE,
};
use crate::socket::RetryPolicy;
use crate::worker::{
    run_collate_worker, run_worker, CollateWorker, Worker, WorkerEndpoints, WorkerOptions,
    WorkerSummary,
};

/// How a stage's workers consume their input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// One request at a time, any number of responses per request.
    Stream,
    /// Buffer the stage's whole input, emit one aggregated response.
    Collate,
}

type WorkerLauncher =
    Box<dyn FnMut(WorkerEndpoints, WorkerOptions) -> JoinHandle<Result<WorkerSummary, PipelineError>> + Send>;

type ConfigCheck = fn(&Options) -> Result<(), ConfigError>;

fn check_config<C: StageConfig>(options: &Options) -> Result<(), ConfigError> {
    demux::<C>(options, C::PREFIX)?.validate()
}

/// One worker stage of the pipeline: a kind, a worker count, and a factory
/// that builds a fresh worker inside each spawned worker task.
pub struct StageSpec {
    name: String,
    count: usize,
    kind: StageKind,
    launcher: WorkerLauncher,
    config_check: Option<ConfigCheck>,
}

impl StageSpec {
    pub fn stream<W, F>(name: impl Into<String>, count: usize, factory: F) -> Self
    where
        W: Worker + 'static,
        F: Fn() -> W + Clone + Send + Sync + 'static,
    {
        let launcher: WorkerLauncher = Box::new(move |endpoints, options| {
            let factory = factory.clone();
            tokio::spawn(run_worker(factory, endpoints, options))
        });
        Self {
            name: name.into(),
            count,
            kind: StageKind::Stream,
            launcher,
            config_check: None,
        }
    }

    pub fn collate<W, F>(name: impl Into<String>, count: usize, factory: F) -> Self
    where
        W: CollateWorker + 'static,
        F: Fn() -> W + Clone + Send + Sync + 'static,
    {
        let launcher: WorkerLauncher = Box::new(move |endpoints, options| {
            let factory = factory.clone();
            tokio::spawn(run_collate_worker(factory, endpoints, options))
        });
        Self {
            name: name.into(),
            count,
            kind: StageKind::Collate,
            launcher,
            config_check: None,
        }
    }

    /// Bind this stage to a typed worker config. The pipeline demuxes the
    /// config's prefix from the option map and validates it at assembly, so
    /// a missing or invalid config is rejected before anything spawns.
    pub fn with_config<C: StageConfig>(mut self) -> Self {
        self.config_check = Some(check_config::<C>);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Maps one input element to the pipeline's initial request message.
pub type RequestFn<T> = Box<dyn FnMut(T) -> Result<Message, ScaffoldError> + Send>;

/// Transform applied by the collator between two stages:
/// `(file_path, batch_id, response) -> next request`.
pub type TransformFn =
    Box<dyn FnMut(&str, Option<i64>, Message) -> Result<Message, ScaffoldError> + Send>;

/// Pipeline-wide tuning, overridable per scaffold via `__v_...`/`__cK_...`/
/// `__s_...` options.
pub struct PipelineOptions {
    pub settle: Duration,
    pub worker_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            settle: DEFAULT_SETTLE,
            worker_timeout: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// A validated pipeline, ready to run over an input sequence of `T`.
pub struct Pipeline<T> {
    request_fn: RequestFn<T>,
    stages: Vec<StageSpec>,
    transforms: Vec<TransformFn>,
    ports: Vec<u16>,
    c_ports: Vec<u16>,
    s_ports: Vec<u16>,
    options: PipelineOptions,
    scaffold_settles: Vec<Duration>,
}

impl<T: Send + 'static> Pipeline<T> {
    /// Validate and assemble a pipeline. Configuration errors (mismatched
    /// port lists, collate head stage, bad overrides) surface here, before
    /// any process spawns.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request_fn: RequestFn<T>,
        stages: Vec<StageSpec>,
        transforms: Vec<TransformFn>,
        ports: Vec<u16>,
        c_ports: Vec<u16>,
        s_ports: Vec<u16>,
        options: PipelineOptions,
        extras: Options,
    ) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::EmptyStages);
        }
        let num_stages = stages.len();
        if ports.len() != 2 * num_stages {
            return Err(ConfigError::PortCountMismatch {
                list: "ports",
                expected: 2 * num_stages,
                got: ports.len(),
                stages: num_stages,
            });
        }
        if c_ports.len() != num_stages {
            return Err(ConfigError::PortCountMismatch {
                list: "c_ports",
                expected: num_stages,
                got: c_ports.len(),
                stages: num_stages,
            });
        }
        if s_ports.len() != num_stages {
            return Err(ConfigError::PortCountMismatch {
                list: "s_ports",
                expected: num_stages,
                got: s_ports.len(),
                stages: num_stages,
            });
        }
        if transforms.len() != num_stages - 1 {
            return Err(ConfigError::PortCountMismatch {
                list: "transforms",
                expected: num_stages - 1,
                got: transforms.len(),
                stages: num_stages,
            });
        }
        for (idx, stage) in stages.iter().enumerate() {
            if stage.count == 0 {
                return Err(ConfigError::ZeroWorkers(idx));
            }
        }
        if stages[0].kind == StageKind::Collate {
            return Err(ConfigError::CollateAtHead);
        }

        // Worker configs: every config a stage bound via `with_config`, plus
        // any standard worker prefix present in the option map, is demuxed
        // and validated now, before anything spawns.
        for stage in &stages {
            if let Some(check) = stage.config_check {
                check(&extras)?;
            }
        }
        validate_worker_options(&extras)?;

        // Per-scaffold settle overrides: ventilator, collators 1..S-1, sink.
        let mut scaffold_settles = Vec::with_capacity(num_stages + 1);
        let ventilator: TuningOverrides = demux(&extras, VENTILATOR_PREFIX)?;
        scaffold_settles.push(ventilator.settle().unwrap_or(options.settle));
        for k in 1..num_stages {
            let collator: TuningOverrides = demux(&extras, &collator_prefix(k))?;
            scaffold_settles.push(collator.settle().unwrap_or(options.settle));
        }
        let sink: TuningOverrides = demux(&extras, SINK_PREFIX)?;
        scaffold_settles.push(sink.settle().unwrap_or(options.settle));

        Ok(Self {
            request_fn,
            stages,
            transforms,
            ports,
            c_ports,
            s_ports,
            options,
            scaffold_settles,
        })
    }

    fn scaffold_options(&self, scaffold_idx: usize, announce: Announcement) -> ScaffoldOptions {
        ScaffoldOptions {
            settle: self.scaffold_settles[scaffold_idx],
            retry: self.options.retry.clone(),
            announce,
            on_startup: None,
            on_closure: None,
        }
    }

    /// What the scaffold feeding the given stage must announce downstream: a
    /// collate stage sends one `EndOfTask` per worker regardless of traffic.
    fn announcement_for(stage: &StageSpec) -> Announcement {
        match stage.kind {
            StageKind::Stream => Announcement::Emitted,
            StageKind::Collate => Announcement::Fixed(stage.count as u64),
        }
    }

    /// Spawn every scaffold and worker and return immediately.
    pub fn run(mut self, input: Vec<T>) -> PipelineHandles {
        let num_stages = self.stages.len();
        let mut scaffolds = Vec::with_capacity(num_stages + 1);

        // Ventilator.
        let announce = Self::announcement_for(&self.stages[0]);
        let opts = self.scaffold_options(0, announce);
        let request_fn = self.request_fn;
        let (push_port, pair_port) = (self.ports[0], self.s_ports[0]);
        scaffolds.push(tokio::spawn(run_ventilator(
            input, request_fn, push_port, pair_port, opts,
        )));

        // Collators between stage j-1 and stage j.
        for (j, transform) in self.transforms.into_iter().enumerate() {
            let j = j + 1;
            let announce = Self::announcement_for(&self.stages[j]);
            let opts = ScaffoldOptions {
                settle: self.scaffold_settles[j],
                retry: self.options.retry.clone(),
                announce,
                on_startup: None,
                on_closure: None,
            };
            scaffolds.push(tokio::spawn(run_collator(
                transform,
                self.ports[2 * j - 1],
                self.ports[2 * j],
                self.c_ports[j - 1],
                self.s_ports[j - 1],
                self.s_ports[j],
                opts,
            )));
        }

        // Sink.
        let opts = ScaffoldOptions {
            settle: self.scaffold_settles[num_stages],
            retry: self.options.retry.clone(),
            announce: Announcement::Emitted,
            on_startup: None,
            on_closure: None,
        };
        scaffolds.push(tokio::spawn(run_sink(
            self.ports[2 * num_stages - 1],
            self.c_ports[num_stages - 1],
            self.s_ports[num_stages - 1],
            opts,
        )));

        // Workers. A stream stage listens to the control channel of the
        // scaffold it pushes into; a collate stage listens to the scaffold
        // it pulls from, whose EndOfProcess marks end-of-input.
        let worker_settle = self.options.settle;
        let worker_timeout = self.options.worker_timeout;
        let retry = self.options.retry.clone();
        let mut workers = Vec::new();
        for (k, stage) in self.stages.iter_mut().enumerate() {
            let control_port = match stage.kind {
                StageKind::Stream => self.c_ports[k],
                StageKind::Collate => self.c_ports[k - 1],
            };
            let endpoints = WorkerEndpoints {
                pull_port: self.ports[2 * k],
                push_port: self.ports[2 * k + 1],
                control_port,
            };
            info!(
                stage = stage.name.as_str(),
                count = stage.count,
                ?endpoints,
                "spawning stage workers"
            );
            for _ in 0..stage.count {
                let options = WorkerOptions {
                    settle: worker_settle,
                    timeout: worker_timeout,
                    retry: retry.clone(),
                    ..WorkerOptions::default()
                };
                workers.push((stage.launcher)(endpoints, options));
            }
        }

        PipelineHandles { scaffolds, workers }
    }
}

/// Join handles of everything a pipeline run spawned.
pub struct PipelineHandles {
    pub scaffolds: Vec<JoinHandle<Result<ScaffoldSummary, PipelineError>>>,
    pub workers: Vec<JoinHandle<Result<WorkerSummary, PipelineError>>>,
}

/// Aggregated accounting of a finished run. Scaffold summaries are in
/// topology order: ventilator, collators, sink.
#[derive(Debug, Default)]
pub struct PipelineReport {
    pub scaffolds: Vec<ScaffoldSummary>,
    pub workers: Vec<WorkerSummary>,
}

impl PipelineHandles {
    /// Await every process and collect their summaries. The first error
    /// encountered is returned; joining is otherwise the caller's policy.
    pub async fn join(self) -> Result<PipelineReport, PipelineError> {
        let mut report = PipelineReport::default();
        for handle in self.scaffolds {
            report.scaffolds.push(handle.await??);
        }
        for handle in self.workers {
            report.workers.push(handle.await??);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToCsvConfig;
    use crate::error::WorkerError;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Worker for Echo {
        async fn handle(&mut self, request: Message) -> Result<Vec<Message>, WorkerError> {
            Ok(vec![request])
        }
    }

    struct Fold;

    #[async_trait]
    impl CollateWorker for Fold {
        async fn collate(&mut self, _requests: Vec<Message>) -> Result<Message, WorkerError> {
            Ok(Message::merge_response("merged"))
        }
    }

    fn request_fn() -> RequestFn<String> {
        Box::new(|path: String| Ok(Message::extraction_request(&path)))
    }

    fn identity_transform() -> TransformFn {
        Box::new(|_, _, msg| Ok(msg))
    }

    fn build(
        stages: Vec<StageSpec>,
        transforms: Vec<TransformFn>,
        ports: Vec<u16>,
        c_ports: Vec<u16>,
        s_ports: Vec<u16>,
    ) -> Result<Pipeline<String>, ConfigError> {
        build_with_extras(stages, transforms, ports, c_ports, s_ports, Options::new())
    }

    fn build_with_extras(
        stages: Vec<StageSpec>,
        transforms: Vec<TransformFn>,
        ports: Vec<u16>,
        c_ports: Vec<u16>,
        s_ports: Vec<u16>,
        extras: Options,
    ) -> Result<Pipeline<String>, ConfigError> {
        Pipeline::new(
            request_fn(),
            stages,
            transforms,
            ports,
            c_ports,
            s_ports,
            PipelineOptions::default(),
            extras,
        )
    }

    #[test]
    fn accepts_well_formed_two_stage_pipeline() {
        let result = build(
            vec![
                StageSpec::stream("extract", 2, || Echo),
                StageSpec::stream("serialize", 2, || Echo),
            ],
            vec![identity_transform()],
            vec![5000, 5001, 5002, 5003],
            vec![6000, 6001],
            vec![6010, 6011],
        );
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_wrong_port_count() {
        let result = build(
            vec![StageSpec::stream("extract", 1, || Echo)],
            vec![],
            vec![5000, 5001, 5002],
            vec![6000],
            vec![6010],
        );
        assert!(matches!(
            result,
            Err(ConfigError::PortCountMismatch {
                list: "ports",
                expected: 2,
                got: 3,
                ..
            })
        ));
    }

    #[test]
    fn rejects_wrong_scaffold_port_counts() {
        let result = build(
            vec![StageSpec::stream("extract", 1, || Echo)],
            vec![],
            vec![5000, 5001],
            vec![],
            vec![6010],
        );
        assert!(matches!(
            result,
            Err(ConfigError::PortCountMismatch { list: "c_ports", .. })
        ));
    }

    #[test]
    fn rejects_zero_workers() {
        let result = build(
            vec![StageSpec::stream("extract", 0, || Echo)],
            vec![],
            vec![5000, 5001],
            vec![6000],
            vec![6010],
        );
        assert!(matches!(result, Err(ConfigError::ZeroWorkers(0))));
    }

    #[test]
    fn rejects_collate_head_stage() {
        let result = build(
            vec![StageSpec::collate("merge", 1, || Fold)],
            vec![],
            vec![5000, 5001],
            vec![6000],
            vec![6010],
        );
        assert!(matches!(result, Err(ConfigError::CollateAtHead)));
    }

    #[test]
    fn rejects_missing_transform() {
        let result = build(
            vec![
                StageSpec::stream("extract", 1, || Echo),
                StageSpec::stream("serialize", 1, || Echo),
            ],
            vec![],
            vec![5000, 5001, 5002, 5003],
            vec![6000, 6001],
            vec![6010, 6011],
        );
        assert!(matches!(
            result,
            Err(ConfigError::PortCountMismatch {
                list: "transforms",
                ..
            })
        ));
    }

    #[test]
    fn rejects_empty_pipeline() {
        let result = build(vec![], vec![], vec![], vec![], vec![]);
        assert!(matches!(result, Err(ConfigError::EmptyStages)));
    }

    #[test]
    fn rejects_unknown_filter_constraint_before_spawn() {
        let extras = Options::from([(
            "exw_filters".to_string(),
            serde_json::json!({"near_area": 625.0}),
        )]);
        let result = build_with_extras(
            vec![StageSpec::stream("extract", 1, || Echo)],
            vec![],
            vec![5000, 5001],
            vec![6000],
            vec![6010],
            extras,
        );
        assert!(matches!(
            result,
            Err(ConfigError::UnknownFilterConstraint { constraint, .. }) if constraint == "near"
        ));
    }

    #[test]
    fn rejects_fluorescence_without_keys_before_spawn() {
        let extras = Options::from([("inw_batch_size".to_string(), serde_json::json!(64))]);
        let result = build_with_extras(
            vec![StageSpec::stream("infer", 1, || Echo)],
            vec![],
            vec![5000, 5001],
            vec![6000],
            vec![6010],
            extras,
        );
        assert!(matches!(result, Err(ConfigError::FluorescenceWithoutKeys)));
    }

    #[test]
    fn stage_bound_config_is_demanded_at_assembly() {
        // ToCsvConfig has a required field, so a stage that binds it fails
        // assembly when the option map does not carry it.
        let result = build_with_extras(
            vec![StageSpec::stream("serialize", 1, || Echo).with_config::<ToCsvConfig>()],
            vec![],
            vec![5000, 5001],
            vec![6000],
            vec![6010],
            Options::new(),
        );
        assert!(matches!(result, Err(ConfigError::Demux { .. })));

        let extras = Options::from([(
            "tocsvw_output_directory".to_string(),
            serde_json::json!("./out"),
        )]);
        let result = build_with_extras(
            vec![StageSpec::stream("serialize", 1, || Echo).with_config::<ToCsvConfig>()],
            vec![],
            vec![5000, 5001],
            vec![6000],
            vec![6010],
            extras,
        );
        assert!(result.is_ok());
    }
}
