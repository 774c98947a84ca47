//! Pipeline options and their demultiplexing.
//!
//! A whole pipeline is parameterised by one flat map of option name to JSON
//! value. Each name carries a prefix — a worker-stage prefix (`exw_...`,
//! `inw_...`) or a scaffold prefix (`__v_...`, `__c1_...`, `__s_...`) — and
//! the demux step extracts a prefix's subset, strips the prefix, and
//! deserializes the remainder into the stage's typed config. Everything is
//! validated before any process spawns.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::ConfigError;
use crate::message::ATTRIBUTE_SEP;

pub const EXTRACTION_WORKER_PREFIX: &str = "exw";
pub const INFERENCE_WORKER_PREFIX: &str = "inw";
pub const MERGE_WORKER_PREFIX: &str = "mew";
pub const TOCSV_WORKER_PREFIX: &str = "tocsvw";
pub const TRAIN_WORKER_PREFIX: &str = "trw";

pub const VENTILATOR_PREFIX: &str = "__v";
pub const SINK_PREFIX: &str = "__s";

/// Prefix for the k-th collator's options (1-based, `__c1`, `__c2`, ...).
pub fn collator_prefix(k: usize) -> String {
    format!("__c{k}")
}

/// The flat option map a pipeline is constructed from.
pub type Options = BTreeMap<String, Value>;

/// Extract the subset of options carrying `prefix`, stripping
/// `prefix` + separator from the keys.
pub fn subset(options: &Options, prefix: &str) -> Options {
    let full_prefix = format!("{prefix}{ATTRIBUTE_SEP}");
    options
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(&full_prefix)
                .map(|stripped| (stripped.to_string(), value.clone()))
        })
        .collect()
}

/// Demux one prefix's options into a typed config.
pub fn demux<T>(options: &Options, prefix: &str) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned,
{
    let map: serde_json::Map<String, Value> = subset(options, prefix).into_iter().collect();
    serde_json::from_value(Value::Object(map)).map_err(|source| ConfigError::Demux {
        prefix: prefix.to_string(),
        source,
    })
}

/// A typed per-stage worker config: demuxed from the flat option map by its
/// prefix and validated when the pipeline is assembled, before any process
/// spawns.
pub trait StageConfig: serde::de::DeserializeOwned {
    /// The option prefix this config is demuxed from.
    const PREFIX: &'static str;

    /// Construction-time validation; a failure aborts pipeline assembly.
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

fn prefix_present(options: &Options, prefix: &str) -> bool {
    let full_prefix = format!("{prefix}{ATTRIBUTE_SEP}");
    options.keys().any(|key| key.starts_with(&full_prefix))
}

/// Demux and validate every standard worker-prefixed subset present in the
/// option map. Absent prefixes are skipped; a stage that requires its config
/// binds it explicitly on its stage spec instead.
pub fn validate_worker_options(options: &Options) -> Result<(), ConfigError> {
    if prefix_present(options, EXTRACTION_WORKER_PREFIX) {
        demux::<ExtractionConfig>(options, EXTRACTION_WORKER_PREFIX)?.validate()?;
    }
    if prefix_present(options, INFERENCE_WORKER_PREFIX) {
        demux::<InferenceConfig>(options, INFERENCE_WORKER_PREFIX)?.validate()?;
    }
    if prefix_present(options, MERGE_WORKER_PREFIX) {
        demux::<MergeConfig>(options, MERGE_WORKER_PREFIX)?.validate()?;
    }
    if prefix_present(options, TOCSV_WORKER_PREFIX) {
        demux::<ToCsvConfig>(options, TOCSV_WORKER_PREFIX)?.validate()?;
    }
    if prefix_present(options, TRAIN_WORKER_PREFIX) {
        demux::<TrainConfig>(options, TRAIN_WORKER_PREFIX)?.validate()?;
    }
    Ok(())
}

/// Settle/timeout overrides carried under a scaffold or worker prefix.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TuningOverrides {
    pub settle_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

impl TuningOverrides {
    pub fn settle(&self) -> Option<Duration> {
        self.settle_ms.map(Duration::from_millis)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Which side of an order constraint a filter enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterBound {
    Min,
    Max,
}

/// One record-property filter, parsed from a `min_*`/`max_*` option key.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFilter {
    pub field: String,
    pub bound: FilterBound,
    pub threshold: f64,
}

impl RecordFilter {
    /// Whether a record with this property value passes the filter.
    /// Bounds are strict, matching the archive-side convention.
    pub fn admits(&self, value: f64) -> bool {
        match self.bound {
            FilterBound::Min => self.threshold < value,
            FilterBound::Max => self.threshold > value,
        }
    }
}

fn parse_filters(filters: &BTreeMap<String, f64>) -> Result<Vec<RecordFilter>, ConfigError> {
    filters
        .iter()
        .map(|(key, &threshold)| {
            let (constraint, field) =
                key.split_once(ATTRIBUTE_SEP)
                    .ok_or_else(|| ConfigError::UnknownFilterConstraint {
                        key: key.clone(),
                        constraint: key.clone(),
                    })?;
            let bound = match constraint {
                "min" => FilterBound::Min,
                "max" => FilterBound::Max,
                other => {
                    return Err(ConfigError::UnknownFilterConstraint {
                        key: key.clone(),
                        constraint: other.to_string(),
                    })
                }
            };
            Ok(RecordFilter {
                field: field.to_string(),
                bound,
                threshold,
            })
        })
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_rec_shape() -> (usize, usize) {
    (200, 200)
}

fn default_rec_precision() -> u32 {
    16
}

fn default_batch_size() -> usize {
    1024
}

/// Configuration of the archive-extraction stage.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default = "default_true")]
    pub keep_metadata: bool,
    #[serde(default = "default_true")]
    pub keep_fluorescence: bool,
    #[serde(default = "default_true")]
    pub keep_rec_properties: bool,
    #[serde(default = "default_true")]
    pub keep_rec: bool,
    #[serde(default)]
    pub keep_metadata_keys: Vec<String>,
    #[serde(default)]
    pub keep_fluorescence_keys: Vec<String>,
    #[serde(default)]
    pub keep_rec_properties_keys: Vec<String>,
    /// Order constraints on record properties, keyed `min_<field>` or
    /// `max_<field>` (e.g. `max_area: 625.0`).
    #[serde(default)]
    pub filters: BTreeMap<String, f64>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            batch_size: None,
            keep_metadata: true,
            keep_fluorescence: true,
            keep_rec_properties: true,
            keep_rec: true,
            keep_metadata_keys: Vec::new(),
            keep_fluorescence_keys: Vec::new(),
            keep_rec_properties_keys: Vec::new(),
            filters: BTreeMap::new(),
        }
    }
}

impl ExtractionConfig {
    /// Parse the filter constraints into their typed form.
    pub fn filters(&self) -> Result<Vec<RecordFilter>, ConfigError> {
        parse_filters(&self.filters)
    }
}

impl StageConfig for ExtractionConfig {
    const PREFIX: &'static str = EXTRACTION_WORKER_PREFIX;

    fn validate(&self) -> Result<(), ConfigError> {
        self.filters().map(|_| ())
    }
}

/// Configuration of the inference stage.
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_true")]
    pub from_rec0: bool,
    #[serde(default = "default_true")]
    pub from_rec1: bool,
    #[serde(default = "default_true")]
    pub from_fluorescence: bool,
    #[serde(default)]
    pub from_fluorescence_keys: Vec<String>,
    #[serde(default = "default_rec_shape")]
    pub rec_shape: (usize, usize),
    #[serde(default = "default_rec_precision")]
    pub rec_precision: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            from_rec0: true,
            from_rec1: true,
            from_fluorescence: true,
            from_fluorescence_keys: Vec::new(),
            rec_shape: default_rec_shape(),
            rec_precision: default_rec_precision(),
            batch_size: default_batch_size(),
        }
    }
}

impl StageConfig for InferenceConfig {
    const PREFIX: &'static str = INFERENCE_WORKER_PREFIX;

    fn validate(&self) -> Result<(), ConfigError> {
        if self.from_fluorescence && self.from_fluorescence_keys.is_empty() {
            return Err(ConfigError::FluorescenceWithoutKeys);
        }
        Ok(())
    }
}

/// Configuration of the merge stage.
#[derive(Debug, Clone, Deserialize)]
pub struct MergeConfig {
    #[serde(default = "MergeConfig::default_output_file")]
    pub output_file: PathBuf,
}

impl MergeConfig {
    fn default_output_file() -> PathBuf {
        PathBuf::from("./merged.spt")
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            output_file: Self::default_output_file(),
        }
    }
}

impl StageConfig for MergeConfig {
    const PREFIX: &'static str = MERGE_WORKER_PREFIX;
}

/// Configuration of the CSV-serialization stage.
#[derive(Debug, Clone, Deserialize)]
pub struct ToCsvConfig {
    pub output_directory: PathBuf,
}

impl StageConfig for ToCsvConfig {
    const PREFIX: &'static str = TOCSV_WORKER_PREFIX;
}

/// Configuration of the training stage.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_true")]
    pub from_rec0: bool,
    #[serde(default = "default_true")]
    pub from_rec1: bool,
    #[serde(default = "default_true")]
    pub from_fluorescence: bool,
    #[serde(default)]
    pub from_fluorescence_keys: Vec<String>,
    #[serde(default = "default_rec_shape")]
    pub rec_shape: (usize, usize),
    #[serde(default = "default_rec_precision")]
    pub rec_precision: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "TrainConfig::default_n_epochs")]
    pub n_epochs: usize,
    #[serde(default = "TrainConfig::default_output_directory")]
    pub output_directory: PathBuf,
}

impl TrainConfig {
    fn default_n_epochs() -> usize {
        1
    }

    fn default_output_directory() -> PathBuf {
        PathBuf::from("./")
    }
}

impl StageConfig for TrainConfig {
    const PREFIX: &'static str = TRAIN_WORKER_PREFIX;

    fn validate(&self) -> Result<(), ConfigError> {
        if self.from_fluorescence && self.from_fluorescence_keys.is_empty() {
            return Err(ConfigError::FluorescenceWithoutKeys);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options() -> Options {
        BTreeMap::from([
            ("exw_batch_size".to_string(), json!(1024)),
            ("exw_keep_fluorescence_keys".to_string(), json!(["average_std"])),
            ("exw_filters".to_string(), json!({"max_area": 625.0})),
            ("inw_batch_size".to_string(), json!(256)),
            ("inw_from_fluorescence".to_string(), json!(false)),
            ("tocsvw_output_directory".to_string(), json!("./tmp")),
            ("__v_settle_ms".to_string(), json!(50)),
            ("__c1_settle_ms".to_string(), json!(75)),
        ])
    }

    #[test]
    fn subset_strips_prefix() {
        let sub = subset(&options(), EXTRACTION_WORKER_PREFIX);
        assert_eq!(sub.len(), 3);
        assert!(sub.contains_key("batch_size"));
        assert!(sub.contains_key("filters"));
        assert!(!sub.contains_key("exw_batch_size"));
    }

    #[test]
    fn demux_builds_typed_configs() {
        let opts = options();
        let exw: ExtractionConfig = demux(&opts, EXTRACTION_WORKER_PREFIX).unwrap();
        assert_eq!(exw.batch_size, Some(1024));
        assert!(exw.keep_metadata);
        assert_eq!(exw.keep_fluorescence_keys, vec!["average_std"]);

        let inw: InferenceConfig = demux(&opts, INFERENCE_WORKER_PREFIX).unwrap();
        assert_eq!(inw.batch_size, 256);
        assert!(!inw.from_fluorescence);
        assert_eq!(inw.rec_shape, (200, 200));

        let tocsvw: ToCsvConfig = demux(&opts, TOCSV_WORKER_PREFIX).unwrap();
        assert_eq!(tocsvw.output_directory, PathBuf::from("./tmp"));
    }

    #[test]
    fn scaffold_prefixes_demux_tuning() {
        let opts = options();
        let v: TuningOverrides = demux(&opts, VENTILATOR_PREFIX).unwrap();
        assert_eq!(v.settle(), Some(Duration::from_millis(50)));
        let c1: TuningOverrides = demux(&opts, &collator_prefix(1)).unwrap();
        assert_eq!(c1.settle(), Some(Duration::from_millis(75)));
        let s: TuningOverrides = demux(&opts, SINK_PREFIX).unwrap();
        assert_eq!(s.settle(), None);
    }

    #[test]
    fn filters_parse_min_and_max() {
        let config = ExtractionConfig {
            filters: BTreeMap::from([
                ("max_area".to_string(), 625.0),
                ("min_solidity".to_string(), 0.9),
            ]),
            ..ExtractionConfig::default()
        };
        let filters = config.filters().unwrap();
        assert_eq!(filters.len(), 2);

        let max_area = filters.iter().find(|f| f.field == "area").unwrap();
        assert_eq!(max_area.bound, FilterBound::Max);
        assert!(max_area.admits(600.0));
        assert!(!max_area.admits(625.0));

        let min_solidity = filters.iter().find(|f| f.field == "solidity").unwrap();
        assert!(min_solidity.admits(0.95));
        assert!(!min_solidity.admits(0.9));
    }

    #[test]
    fn unknown_filter_constraint_is_rejected() {
        let config = ExtractionConfig {
            filters: BTreeMap::from([("near_area".to_string(), 1.0)]),
            ..ExtractionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownFilterConstraint { constraint, .. }) if constraint == "near"
        ));
    }

    #[test]
    fn fluorescence_without_keys_is_rejected() {
        let config = InferenceConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::FluorescenceWithoutKeys)
        ));

        let config = InferenceConfig {
            from_fluorescence: false,
            ..InferenceConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_required_option_fails_demux() {
        let opts = Options::new();
        let result: Result<ToCsvConfig, _> = demux(&opts, TOCSV_WORKER_PREFIX);
        assert!(matches!(result, Err(ConfigError::Demux { .. })));
    }

    #[test]
    fn stage_config_prefixes_match_constants() {
        assert_eq!(ExtractionConfig::PREFIX, EXTRACTION_WORKER_PREFIX);
        assert_eq!(InferenceConfig::PREFIX, INFERENCE_WORKER_PREFIX);
        assert_eq!(MergeConfig::PREFIX, MERGE_WORKER_PREFIX);
        assert_eq!(ToCsvConfig::PREFIX, TOCSV_WORKER_PREFIX);
        assert_eq!(TrainConfig::PREFIX, TRAIN_WORKER_PREFIX);
    }

    #[test]
    fn worker_options_validate_every_present_prefix() {
        assert!(validate_worker_options(&options()).is_ok());
        assert!(validate_worker_options(&Options::new()).is_ok());

        let bad_filter = BTreeMap::from([(
            "exw_filters".to_string(),
            json!({"near_area": 625.0}),
        )]);
        assert!(matches!(
            validate_worker_options(&bad_filter),
            Err(ConfigError::UnknownFilterConstraint { .. })
        ));

        // Any inw_ option requests the default fluorescence input, which is
        // invalid without keys.
        let no_keys = BTreeMap::from([("inw_batch_size".to_string(), json!(64))]);
        assert!(matches!(
            validate_worker_options(&no_keys),
            Err(ConfigError::FluorescenceWithoutKeys)
        ));

        let with_keys = BTreeMap::from([
            ("inw_batch_size".to_string(), json!(64)),
            ("inw_from_fluorescence_keys".to_string(), json!(["average_std"])),
        ]);
        assert!(validate_worker_options(&with_keys).is_ok());
    }
}
