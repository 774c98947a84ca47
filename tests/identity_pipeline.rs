use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use pollen_pipeline::{
    Message, Pipeline, PipelineOptions, StageSpec, Worker, WorkerError,
};

/// Identity worker that records the correlation key of every request it
/// handles before forwarding it unchanged.
struct Recorder {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Worker for Recorder {
    async fn handle(&mut self, request: Message) -> Result<Vec<Message>, WorkerError> {
        let path = request
            .file_path()
            .ok_or_else(|| WorkerError::Task("request without file_path".into()))?
            .to_string();
        self.seen.lock().unwrap().push(path);
        Ok(vec![request])
    }
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init()
            .ok();
    });
}

fn test_options() -> PipelineOptions {
    PipelineOptions {
        settle: Duration::from_millis(100),
        worker_timeout: Some(Duration::from_secs(30)),
        ..PipelineOptions::default()
    }
}

/// Three inputs through ventilator -> identity stage -> collator -> identity
/// stage -> sink: every scaffold announces 3, the sink counts 3 EndOfTask
/// tokens, and each input's file_path reaches the last stage exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identity_three_stage_pipeline() {
    init_tracing();
    let first_stage = Arc::new(Mutex::new(Vec::new()));
    let last_stage = Arc::new(Mutex::new(Vec::new()));

    let first = first_stage.clone();
    let last = last_stage.clone();
    let pipeline = Pipeline::new(
        Box::new(|path: String| Ok(Message::extraction_request(&path))),
        vec![
            StageSpec::stream("extract", 2, move || Recorder { seen: first.clone() }),
            StageSpec::stream("serialize", 1, move || Recorder { seen: last.clone() }),
        ],
        vec![Box::new(|file_path: &str, batch_id, response| {
            Ok(Message::tocsv_request(file_path, batch_id, &response))
        })],
        vec![45000, 45001, 45002, 45003],
        vec![45010, 45011],
        vec![45020, 45021],
        test_options(),
        Default::default(),
    )
    .unwrap();

    let report = pipeline
        .run(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        .join()
        .await
        .unwrap();

    // Scaffolds in topology order: ventilator, collator, sink.
    let [ventilator, collator, sink] = &report.scaffolds[..] else {
        panic!("expected 3 scaffolds, got {}", report.scaffolds.len());
    };
    assert_eq!(ventilator.emitted, 3);
    assert_eq!(ventilator.announced, 3);
    assert_eq!(collator.end_of_tasks, 3);
    assert_eq!(collator.emitted, 3);
    assert_eq!(collator.announced, 3);
    assert_eq!(sink.end_of_tasks, 3);

    // Work is split across the stage's workers without loss or duplication.
    let handled: u64 = report.workers.iter().map(|w| w.handled).sum();
    assert_eq!(handled, 6); // 3 per stage
    assert_eq!(report.workers.iter().map(|w| w.failures).sum::<u64>(), 0);

    for seen in [first_stage, last_stage] {
        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c"]);
    }
}
