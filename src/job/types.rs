use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BUCKET_SPAN_SECS: i64 = 300;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_QUERY_DELAY_SECS: i64 = 60;
pub const DEFAULT_SCROLL_SIZE: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Closed,
    Running,
    Closing,
    Deleting,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Closed => "CLOSED",
            JobStatus::Running => "RUNNING",
            JobStatus::Closing => "CLOSING",
            JobStatus::Deleting => "DELETING",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Closed, Running)
                | (Closed, Deleting)
                | (Failed, Running)
                | (Failed, Closed)
                | (Failed, Deleting)
                | (Running, Closing)
                | (Running, Failed)
                | (Closing, Closed)
                | (Closing, Failed)
                | (Deleting, Closed)
        )
    }

    /// No analytics worker is attached in these states.
    pub fn is_closed(&self) -> bool {
        matches!(self, JobStatus::Closed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl SchedulerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerState::Stopped => "STOPPED",
            SchedulerState::Starting => "STARTING",
            SchedulerState::Started => "STARTED",
            SchedulerState::Stopping => "STOPPING",
        }
    }

    pub fn can_transition_to(&self, next: SchedulerState) -> bool {
        use SchedulerState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Started)
                | (Starting, Stopped)
                | (Started, Stopping)
                | (Stopping, Stopped)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IgnoreDowntime {
    Never,
    Once,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorFunction {
    Count,
    HighCount,
    LowCount,
    NonZeroCount,
    LowNonZeroCount,
    HighNonZeroCount,
    DistinctCount,
    Rare,
    FreqRare,
    Metric,
    Mean,
    Min,
    Max,
    Sum,
    Median,
    HighMean,
    LowMean,
    HighSum,
    LowSum,
    InfoContent,
    Varp,
    TimeOfDay,
    TimeOfWeek,
}

/// Which deviations from typical a function reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Both,
    High,
    Low,
}

impl DetectorFunction {
    pub fn parse(name: &str) -> Option<Self> {
        use DetectorFunction::*;
        let function = match name {
            "count" => Count,
            "high_count" => HighCount,
            "low_count" => LowCount,
            "non_zero_count" | "nzc" => NonZeroCount,
            "low_non_zero_count" | "low_nzc" => LowNonZeroCount,
            "high_non_zero_count" | "high_nzc" => HighNonZeroCount,
            "distinct_count" | "dc" => DistinctCount,
            "rare" => Rare,
            "freq_rare" => FreqRare,
            "metric" => Metric,
            "mean" | "avg" => Mean,
            "min" => Min,
            "max" => Max,
            "sum" => Sum,
            "median" => Median,
            "high_mean" | "high_avg" => HighMean,
            "low_mean" | "low_avg" => LowMean,
            "high_sum" => HighSum,
            "low_sum" => LowSum,
            "info_content" => InfoContent,
            "varp" => Varp,
            "time_of_day" => TimeOfDay,
            "time_of_week" => TimeOfWeek,
            _ => return None,
        };
        Some(function)
    }

    pub fn is_count(&self) -> bool {
        use DetectorFunction::*;
        matches!(
            self,
            Count | HighCount | LowCount | NonZeroCount | LowNonZeroCount | HighNonZeroCount
        )
    }

    pub fn is_non_zero_count(&self) -> bool {
        use DetectorFunction::*;
        matches!(self, NonZeroCount | LowNonZeroCount | HighNonZeroCount)
    }

    pub fn is_time(&self) -> bool {
        matches!(self, DetectorFunction::TimeOfDay | DetectorFunction::TimeOfWeek)
    }

    pub fn is_rare(&self) -> bool {
        matches!(self, DetectorFunction::Rare | DetectorFunction::FreqRare)
    }

    /// Functions that aggregate the values of `fieldName`.
    pub fn requires_field(&self) -> bool {
        use DetectorFunction::*;
        matches!(
            self,
            DistinctCount
                | Metric
                | Mean
                | Min
                | Max
                | Sum
                | Median
                | HighMean
                | LowMean
                | HighSum
                | LowSum
                | InfoContent
                | Varp
        )
    }

    pub fn side(&self) -> Side {
        use DetectorFunction::*;
        match self {
            HighCount | HighNonZeroCount | HighMean | HighSum => Side::High,
            LowCount | LowNonZeroCount | LowMean | LowSum => Side::Low,
            _ => Side::Both,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    #[default]
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    Match,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connective {
    #[default]
    Or,
    And,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleConditionType {
    Categorical,
    NumericalActual,
    NumericalTypical,
    NumericalDiffAbs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    pub condition_type: RuleConditionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_list: Option<Vec<String>>,
}

/// Suppresses results whose conditions match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionRule {
    #[serde(default)]
    pub conditions_connective: Connective,
    pub rule_conditions: Vec<RuleCondition>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detector_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_field_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub over_field_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_field_name: Option<String>,
    #[serde(default)]
    pub use_null: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_frequent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detector_rules: Vec<DetectionRule>,
}

impl Detector {
    pub fn new(function: &str) -> Self {
        Self {
            function: Some(function.to_string()),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, field_name: &str) -> Self {
        self.field_name = Some(field_name.to_string());
        self
    }

    pub fn with_by(mut self, by_field_name: &str) -> Self {
        self.by_field_name = Some(by_field_name.to_string());
        self
    }

    /// The function name after defaulting: `metric` with a field, `count` without.
    pub fn function_name(&self) -> &str {
        match (&self.function, &self.field_name) {
            (Some(function), _) => function.as_str(),
            (None, Some(_)) => "metric",
            (None, None) => "count",
        }
    }

    pub fn parsed_function(&self) -> Option<DetectorFunction> {
        DetectorFunction::parse(self.function_name())
    }

    pub fn description(&self) -> String {
        if let Some(description) = &self.detector_description {
            return description.clone();
        }
        let mut text = match &self.field_name {
            Some(field) => format!("{}({})", self.function_name(), field),
            None => self.function_name().to_string(),
        };
        if let Some(by) = &self.by_field_name {
            text.push_str(&format!(" by {by}"));
        }
        if let Some(over) = &self.over_field_name {
            text.push_str(&format!(" over {over}"));
        }
        if let Some(partition) = &self.partition_field_name {
            text.push_str(&format!(" partitionfield={partition}"));
        }
        text
    }

    pub fn referenced_fields(&self) -> impl Iterator<Item = &str> {
        [
            self.field_name.as_deref(),
            self.by_field_name.as_deref(),
            self.over_field_name.as_deref(),
            self.partition_field_name.as_deref(),
        ]
        .into_iter()
        .flatten()
    }
}

fn default_bucket_span() -> i64 {
    DEFAULT_BUCKET_SPAN_SECS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisConfig {
    #[serde(default = "default_bucket_span")]
    pub bucket_span: i64,
    #[serde(default)]
    pub latency: i64,
    #[serde(default)]
    pub detectors: Vec<Detector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub influencers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categorization_field_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categorization_filters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_count_field_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlapping_buckets: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multivariate_by_fields: Option<bool>,
    #[serde(default)]
    pub use_per_partition_normalization: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            bucket_span: DEFAULT_BUCKET_SPAN_SECS,
            latency: 0,
            detectors: Vec::new(),
            influencers: Vec::new(),
            categorization_field_name: None,
            categorization_filters: Vec::new(),
            summary_count_field_name: None,
            overlapping_buckets: None,
            multivariate_by_fields: None,
            use_per_partition_normalization: false,
        }
    }
}

impl AnalysisConfig {
    /// Input fields each record must carry to be analysed.
    pub fn required_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if !fields.iter().any(|f| f == name) {
                fields.push(name.to_string());
            }
        };
        for detector in &self.detectors {
            for field in detector.referenced_fields() {
                push(field);
            }
        }
        if let Some(field) = &self.summary_count_field_name {
            push(field);
        }
        if let Some(field) = &self.categorization_field_name {
            push(field);
        }
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_memory_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categorization_examples_limit: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataFormat {
    #[default]
    Delimited,
    Json,
    SingleLine,
}

fn default_time_field() -> String {
    "time".to_string()
}

fn default_time_format() -> String {
    "epoch".to_string()
}

fn default_delimiter() -> char {
    '\t'
}

fn default_quote() -> char {
    '"'
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataDescription {
    #[serde(default)]
    pub format: DataFormat,
    #[serde(default = "default_time_field")]
    pub time_field: String,
    #[serde(default = "default_time_format")]
    pub time_format: String,
    #[serde(default = "default_delimiter")]
    pub field_delimiter: char,
    #[serde(default = "default_quote")]
    pub quote_character: char,
}

impl Default for DataDescription {
    fn default() -> Self {
        Self {
            format: DataFormat::Delimited,
            time_field: default_time_field(),
            time_format: default_time_format(),
            field_delimiter: default_delimiter(),
            quote_character: default_quote(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformType {
    Exclude,
    Split,
    Concat,
    Extract,
    Lowercase,
    Uppercase,
    Trim,
}

impl TransformType {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "exclude" => Some(TransformType::Exclude),
            "split" => Some(TransformType::Split),
            "concat" => Some(TransformType::Concat),
            "extract" => Some(TransformType::Extract),
            "lowercase" => Some(TransformType::Lowercase),
            "uppercase" => Some(TransformType::Uppercase),
            "trim" => Some(TransformType::Trim),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformConfig {
    pub transform: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl TransformConfig {
    pub fn transform_type(&self) -> Option<TransformType> {
        TransformType::parse(&self.transform)
    }

    /// Outputs written by this transform; single-input in-place transforms
    /// write back to their input when no outputs are named.
    pub fn effective_outputs(&self) -> Vec<String> {
        if !self.outputs.is_empty() {
            return self.outputs.clone();
        }
        match self.transform_type() {
            Some(TransformType::Lowercase | TransformType::Uppercase | TransformType::Trim) => {
                self.inputs.clone()
            }
            Some(TransformType::Concat) => vec![self.inputs.concat()],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSource {
    File,
    Elasticsearch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    pub data_source: DataSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_delay: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail_file: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregations: Option<serde_json::Value>,
}

impl SchedulerConfig {
    pub fn file(path: &str) -> Self {
        Self {
            data_source: DataSource::File,
            query_delay: None,
            frequency: None,
            file_path: Some(path.to_string()),
            tail_file: None,
            base_url: None,
            indexes: None,
            types: None,
            query: None,
            scroll_size: None,
            aggregations: None,
        }
    }

    pub fn query_delay_secs(&self) -> i64 {
        self.query_delay.unwrap_or(DEFAULT_QUERY_DELAY_SECS)
    }

    /// Poll frequency; defaults to the bucket span clamped to [60s, 600s].
    pub fn frequency_secs(&self, bucket_span: i64) -> i64 {
        self.frequency.unwrap_or_else(|| bucket_span.clamp(60, 600))
    }

    pub fn scroll_size(&self) -> u32 {
        self.scroll_size
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(DEFAULT_SCROLL_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataCounts {
    pub bucket_count: u64,
    pub processed_record_count: u64,
    pub processed_field_count: u64,
    pub input_bytes: u64,
    pub input_field_count: u64,
    pub input_record_count: u64,
    pub invalid_date_count: u64,
    pub missing_field_count: u64,
    pub out_of_order_time_stamp_count: u64,
    pub excluded_record_count: u64,
    pub failed_transform_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_record_time_stamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub earliest_record_time_stamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_data_time_stamp: Option<DateTime<Utc>>,
}

impl DataCounts {
    /// Adds the tallies of one upload to the job totals.
    pub fn merge(&mut self, other: &DataCounts) {
        self.bucket_count += other.bucket_count;
        self.processed_record_count += other.processed_record_count;
        self.processed_field_count += other.processed_field_count;
        self.input_bytes += other.input_bytes;
        self.input_field_count += other.input_field_count;
        self.input_record_count += other.input_record_count;
        self.invalid_date_count += other.invalid_date_count;
        self.missing_field_count += other.missing_field_count;
        self.out_of_order_time_stamp_count += other.out_of_order_time_stamp_count;
        self.excluded_record_count += other.excluded_record_count;
        self.failed_transform_count += other.failed_transform_count;
        self.latest_record_time_stamp =
            max_option(self.latest_record_time_stamp, other.latest_record_time_stamp);
        self.earliest_record_time_stamp = match (
            self.earliest_record_time_stamp,
            other.earliest_record_time_stamp,
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.last_data_time_stamp =
            max_option(self.last_data_time_stamp, other.last_data_time_stamp);
    }

    pub fn is_conserved(&self) -> bool {
        self.processed_record_count
            + self.invalid_date_count
            + self.missing_field_count
            + self.excluded_record_count
            == self.input_record_count
    }
}

fn max_option(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Client payload describing a job to create.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub analysis_config: AnalysisConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_limits: Option<AnalysisLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_description: Option<DataDescription>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<TransformConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_config: Option<SchedulerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renormalization_window_days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_snapshot_retention_days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_persist_interval: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_retention_days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_settings: Option<serde_json::Value>,
}

/// The persisted job document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_status: Option<SchedulerState>,
    pub create_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_data_time: Option<DateTime<Utc>>,
    pub analysis_config: AnalysisConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_limits: Option<AnalysisLimits>,
    pub data_description: DataDescription,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<TransformConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_config: Option<SchedulerConfig>,
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renormalization_window_days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_snapshot_retention_days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_persist_interval: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_retention_days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_settings: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_debug_config: Option<serde_json::Value>,
    #[serde(default)]
    pub counts: DataCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_downtime: Option<IgnoreDowntime>,
}

impl Job {
    pub fn from_config(id: String, config: JobConfig, default_timeout: u64, now: DateTime<Utc>) -> Self {
        let scheduler_status = config
            .scheduler_config
            .as_ref()
            .map(|_| SchedulerState::Stopped);
        Self {
            id,
            description: config.description,
            status: JobStatus::Closed,
            scheduler_status,
            create_time: now,
            finished_time: None,
            last_data_time: None,
            analysis_config: config.analysis_config,
            analysis_limits: config.analysis_limits,
            data_description: config.data_description.unwrap_or_default(),
            transforms: config.transforms,
            scheduler_config: config.scheduler_config,
            timeout: config.timeout.unwrap_or(default_timeout),
            renormalization_window_days: config.renormalization_window_days,
            model_snapshot_retention_days: config.model_snapshot_retention_days,
            background_persist_interval: config.background_persist_interval,
            results_retention_days: config.results_retention_days,
            custom_settings: config.custom_settings,
            model_debug_config: None,
            counts: DataCounts::default(),
            model_snapshot_id: None,
            ignore_downtime: None,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduler_config.is_some()
    }

    pub fn scheduler_state(&self) -> Option<SchedulerState> {
        self.scheduler_config
            .as_ref()
            .map(|_| self.scheduler_status.unwrap_or(SchedulerState::Stopped))
    }

    pub fn bucket_span(&self) -> i64 {
        self.analysis_config.bucket_span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_transitions_follow_lifecycle() {
        assert!(JobStatus::Closed.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Closing));
        assert!(JobStatus::Closing.can_transition_to(JobStatus::Closed));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Deleting));
        assert!(!JobStatus::Closed.can_transition_to(JobStatus::Closing));
        assert!(!JobStatus::Deleting.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn scheduler_state_requires_stopping_before_stopped() {
        assert!(SchedulerState::Started.can_transition_to(SchedulerState::Stopping));
        assert!(!SchedulerState::Started.can_transition_to(SchedulerState::Stopped));
        assert!(!SchedulerState::Stopped.can_transition_to(SchedulerState::Started));
    }

    #[test]
    fn detector_function_defaults_and_aliases() {
        let detector = Detector::default();
        assert_eq!(detector.function_name(), "count");
        let metric = Detector::default().with_field("responsetime");
        assert_eq!(metric.function_name(), "metric");
        assert_eq!(DetectorFunction::parse("avg"), Some(DetectorFunction::Mean));
        assert_eq!(DetectorFunction::parse("nzc"), Some(DetectorFunction::NonZeroCount));
        assert_eq!(DetectorFunction::parse("bogus"), None);
        assert_eq!(
            Detector::new("mean").with_field("responsetime").with_by("airline").description(),
            "mean(responsetime) by airline"
        );
    }

    #[test]
    fn job_config_parses_camel_case() {
        let config: JobConfig = serde_json::from_str(
            r#"{
                "id": "farm-power",
                "analysisConfig": {
                    "bucketSpan": 3600,
                    "detectors": [{"function": "mean", "fieldName": "responsetime", "byFieldName": "airline"}]
                },
                "dataDescription": {"format": "DELIMITED", "fieldDelimiter": ",", "timeFormat": "yyyy-MM-dd"},
                "schedulerConfig": {"dataSource": "FILE", "filePath": "/tmp/data.json"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.analysis_config.bucket_span, 3600);
        assert_eq!(config.analysis_config.latency, 0);
        let data = config.data_description.as_ref().unwrap();
        assert_eq!(data.field_delimiter, ',');
        assert_eq!(data.time_field, "time");
        let scheduler = config.scheduler_config.as_ref().unwrap();
        assert_eq!(scheduler.query_delay_secs(), 60);
        assert_eq!(scheduler.frequency_secs(3600), 600);
        assert_eq!(scheduler.scroll_size(), 1000);

        let job = Job::from_config("farm-power".into(), config, 600, Utc::now());
        assert_eq!(job.scheduler_state(), Some(SchedulerState::Stopped));
        assert_eq!(job.analysis_config.required_fields(), vec!["responsetime", "airline"]);
    }

    #[test]
    fn counts_merge_keeps_extreme_timestamps() {
        let early = DateTime::from_timestamp(1_000, 0).unwrap();
        let late = DateTime::from_timestamp(2_000, 0).unwrap();
        let mut total = DataCounts {
            input_record_count: 2,
            processed_record_count: 2,
            latest_record_time_stamp: Some(early),
            earliest_record_time_stamp: Some(early),
            ..Default::default()
        };
        total.merge(&DataCounts {
            input_record_count: 3,
            processed_record_count: 1,
            invalid_date_count: 1,
            excluded_record_count: 1,
            latest_record_time_stamp: Some(late),
            earliest_record_time_stamp: Some(late),
            ..Default::default()
        });
        assert_eq!(total.input_record_count, 5);
        assert_eq!(total.latest_record_time_stamp, Some(late));
        assert_eq!(total.earliest_record_time_stamp, Some(early));
        assert!(total.is_conserved());
    }
}
