//! Pure validation of job configurations.
//!
//! Every check reports `InvalidValue` with a message naming the offending
//! setting; nothing here performs I/O.

use std::collections::{HashMap, HashSet};

use regex::Regex;

use crate::error::{EngineError, Result};
use crate::job::types::{
    AnalysisConfig, AnalysisLimits, Condition, DataDescription, DataFormat, DataSource,
    DetectionRule, Detector, DetectorFunction, JobConfig, Operator, RuleConditionType,
    SchedulerConfig, TransformConfig, TransformType,
};

pub const MAX_JOB_ID_LENGTH: usize = 64;
pub const MIN_BACKGROUND_PERSIST_INTERVAL: i64 = 3600;

/// Validates a job configuration before it is created.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(&self, config: &JobConfig) -> Result<()> {
        if let Some(id) = &config.id {
            validate_job_id(id)?;
        }
        validate_analysis_config(&config.analysis_config)?;
        if let Some(limits) = &config.analysis_limits {
            validate_analysis_limits(limits)?;
        }
        let data = config.data_description.clone().unwrap_or_default();
        validate_data_description(&data)?;
        validate_transforms(&config.transforms)?;
        if let Some(scheduler) = &config.scheduler_config {
            validate_scheduler_config(scheduler, &config.analysis_config, &data)?;
        }
        validate_non_negative("renormalizationWindowDays", config.renormalization_window_days)?;
        validate_non_negative("modelSnapshotRetentionDays", config.model_snapshot_retention_days)?;
        validate_non_negative("resultsRetentionDays", config.results_retention_days)?;
        validate_background_persist_interval(config.background_persist_interval)?;
        if config.timeout == Some(0) {
            return Err(invalid("timeout must be greater than 0"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::invalid_value(message)
}

pub fn validate_job_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_JOB_ID_LENGTH {
        return Err(invalid(format!(
            "Invalid job id '{id}': the id must be between 1 and {MAX_JOB_ID_LENGTH} characters long"
        )));
    }
    let valid_chars = id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    let alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    if !valid_chars || !alnum(id.chars().next()) || !alnum(id.chars().last()) {
        return Err(invalid(format!(
            "Invalid job id '{id}': the id may contain lowercase letters, digits, hyphens or \
             underscores and must start and end with a letter or digit"
        )));
    }
    Ok(())
}

pub fn validate_non_negative(name: &str, value: Option<i64>) -> Result<()> {
    match value {
        Some(v) if v < 0 => Err(invalid(format!(
            "{name} cannot be less than 0. Value = {v}"
        ))),
        _ => Ok(()),
    }
}

pub fn validate_background_persist_interval(value: Option<i64>) -> Result<()> {
    match value {
        Some(v) if v < MIN_BACKGROUND_PERSIST_INTERVAL => Err(invalid(format!(
            "backgroundPersistInterval cannot be less than {MIN_BACKGROUND_PERSIST_INTERVAL}. Value = {v}"
        ))),
        _ => Ok(()),
    }
}

pub fn validate_analysis_limits(limits: &AnalysisLimits) -> Result<()> {
    if let Some(limit) = limits.model_memory_limit {
        if limit < 1 {
            return Err(invalid(format!(
                "modelMemoryLimit must be at least 1 MiB. Value = {limit}"
            )));
        }
    }
    validate_non_negative("categorizationExamplesLimit", limits.categorization_examples_limit)
}

pub fn validate_analysis_config(config: &AnalysisConfig) -> Result<()> {
    if config.bucket_span <= 0 {
        return Err(invalid(format!(
            "bucketSpan must be greater than 0. Value = {}",
            config.bucket_span
        )));
    }
    if config.latency < 0 {
        return Err(invalid(format!(
            "latency cannot be less than 0. Value = {}",
            config.latency
        )));
    }
    if config.detectors.is_empty() {
        return Err(invalid("No detectors configured"));
    }
    for detector in &config.detectors {
        validate_detector(detector)?;
    }
    if config.use_per_partition_normalization
        && config
            .detectors
            .iter()
            .any(|d| d.partition_field_name.is_none())
    {
        return Err(invalid(
            "usePerPartitionNormalization requires every detector to have a partitionFieldName",
        ));
    }
    for influencer in &config.influencers {
        validate_field_name("influencers", influencer)?;
    }
    if !config.categorization_filters.is_empty() {
        validate_categorization_filters(config, &config.categorization_filters)?;
    }
    Ok(())
}

pub fn validate_categorization_filters(config: &AnalysisConfig, filters: &[String]) -> Result<()> {
    if config.categorization_field_name.is_none() {
        return Err(invalid(
            "categorizationFilters require setting categorizationFieldName",
        ));
    }
    let mut seen = HashSet::new();
    for filter in filters {
        if filter.is_empty() {
            return Err(invalid("categorizationFilters cannot contain empty strings"));
        }
        if !seen.insert(filter) {
            return Err(invalid("categorizationFilters contain duplicates"));
        }
        if Regex::new(filter).is_err() {
            return Err(invalid(format!(
                "categorizationFilters contains invalid regular expression '{filter}'"
            )));
        }
    }
    Ok(())
}

fn validate_field_name(setting: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(invalid(format!("{setting} cannot be an empty string")));
    }
    if name.contains('"') || name.contains('\\') {
        return Err(invalid(format!(
            "Invalid {setting} value '{name}': field names cannot contain '\"' or '\\'"
        )));
    }
    Ok(())
}

pub fn validate_detector(detector: &Detector) -> Result<()> {
    let name = detector.function_name();
    let Some(function) = DetectorFunction::parse(name) else {
        return Err(invalid(format!("Unknown function '{name}'")));
    };
    for field in detector.referenced_fields() {
        validate_field_name("field", field)?;
    }

    if detector.function.is_none()
        && detector.field_name.is_none()
        && (detector.by_field_name.is_some() || detector.over_field_name.is_some())
    {
        return Err(invalid(
            "Unless the function is 'count' one of fieldName, byFieldName or overFieldName must be set",
        ));
    }
    if function.requires_field() && detector.field_name.is_none() {
        return Err(invalid(format!(
            "The fieldName must be set when the '{name}' function is used"
        )));
    }
    if (function.is_count() || function.is_rare() || function.is_time())
        && detector.field_name.is_some()
    {
        return Err(invalid(format!(
            "The fieldName must not be set when the '{name}' function is used"
        )));
    }
    if function == DetectorFunction::Rare && detector.by_field_name.is_none() {
        return Err(invalid("The byFieldName must be set when the 'rare' function is used"));
    }
    if function == DetectorFunction::FreqRare
        && (detector.by_field_name.is_none() || detector.over_field_name.is_none())
    {
        return Err(invalid(
            "The byFieldName and overFieldName must be set when the 'freq_rare' function is used",
        ));
    }
    if function.is_non_zero_count() && detector.over_field_name.is_some() {
        return Err(invalid(format!(
            "The overFieldName cannot be used with the '{name}' function"
        )));
    }
    if let Some(exclude) = &detector.exclude_frequent {
        if !matches!(exclude.as_str(), "all" | "none" | "by" | "over" | "true" | "false") {
            return Err(invalid(format!("Invalid excludeFrequent value '{exclude}'")));
        }
    }
    for rule in &detector.detector_rules {
        validate_rule(detector, rule)?;
    }
    Ok(())
}

pub fn validate_rule(detector: &Detector, rule: &DetectionRule) -> Result<()> {
    if rule.rule_conditions.is_empty() {
        return Err(invalid("Invalid detector rule: at least one ruleCondition is required"));
    }
    for condition in &rule.rule_conditions {
        match condition.condition_type {
            RuleConditionType::Categorical => {
                if condition.value_list.as_ref().map_or(true, Vec::is_empty) {
                    return Err(invalid(
                        "Invalid detector rule: a categorical ruleCondition requires a valueList",
                    ));
                }
                if condition.condition.is_some() {
                    return Err(invalid(
                        "Invalid detector rule: a categorical ruleCondition does not support condition",
                    ));
                }
            }
            _ => {
                let Some(inner) = &condition.condition else {
                    return Err(invalid(
                        "Invalid detector rule: a numerical ruleCondition requires condition to be set",
                    ));
                };
                validate_numeric_condition(inner)?;
            }
        }
        if let Some(field) = &condition.field_name {
            let known = detector.referenced_fields().any(|f| f == field.as_str());
            if !known {
                return Err(invalid(format!(
                    "Invalid detector rule: fieldName '{field}' is not used by the detector"
                )));
            }
            if condition.field_value.is_none() {
                return Err(invalid(
                    "Invalid detector rule: fieldValue must be set when fieldName is set",
                ));
            }
        }
    }
    Ok(())
}

fn validate_numeric_condition(condition: &Condition) -> Result<()> {
    if condition.operator == Operator::Match {
        return Err(invalid(
            "Invalid detector rule: a numerical condition cannot use the 'match' operator",
        ));
    }
    match condition.value.as_deref().map(str::parse::<f64>) {
        Some(Ok(_)) => Ok(()),
        _ => Err(invalid(format!(
            "Invalid condition value: cannot parse a double from string '{}'",
            condition.value.as_deref().unwrap_or("")
        ))),
    }
}

pub fn validate_data_description(data: &DataDescription) -> Result<()> {
    if data.time_field.trim().is_empty() {
        return Err(invalid("timeField cannot be empty"));
    }
    match data.time_format.as_str() {
        "epoch" | "epoch_ms" => {}
        pattern => {
            if !pattern.contains('%') {
                return Err(invalid(format!(
                    "Invalid timeFormat '{pattern}': expected 'epoch', 'epoch_ms' or a strftime pattern"
                )));
            }
        }
    }
    if data.format == DataFormat::Delimited && data.field_delimiter == data.quote_character {
        return Err(invalid("fieldDelimiter and quoteCharacter must differ"));
    }
    Ok(())
}

fn transform_arity(kind: TransformType) -> (std::ops::RangeInclusive<usize>, std::ops::RangeInclusive<usize>, std::ops::RangeInclusive<usize>) {
    // (inputs, arguments, outputs)
    match kind {
        TransformType::Exclude => (1..=1, 0..=0, 0..=0),
        TransformType::Split => (1..=1, 1..=1, 1..=usize::MAX),
        TransformType::Concat => (1..=usize::MAX, 0..=1, 0..=1),
        TransformType::Extract => (1..=1, 1..=1, 1..=usize::MAX),
        TransformType::Lowercase | TransformType::Uppercase | TransformType::Trim => {
            (1..=1, 0..=0, 0..=1)
        }
    }
}

pub fn validate_transforms(transforms: &[TransformConfig]) -> Result<()> {
    let mut written: HashMap<String, usize> = HashMap::new();
    for (index, transform) in transforms.iter().enumerate() {
        let Some(kind) = transform.transform_type() else {
            return Err(invalid(format!("Unknown transform type '{}'", transform.transform)));
        };
        let (inputs, arguments, outputs) = transform_arity(kind);
        if !inputs.contains(&transform.inputs.len()) {
            return Err(invalid(format!(
                "Transform '{}' has {} input(s), which is not allowed",
                transform.transform,
                transform.inputs.len()
            )));
        }
        if !arguments.contains(&transform.arguments.len()) {
            return Err(invalid(format!(
                "Transform '{}' has {} argument(s), which is not allowed",
                transform.transform,
                transform.arguments.len()
            )));
        }
        if !outputs.contains(&transform.outputs.len()) {
            return Err(invalid(format!(
                "Transform '{}' has {} output(s), which is not allowed",
                transform.transform,
                transform.outputs.len()
            )));
        }
        match kind {
            TransformType::Split | TransformType::Extract => {
                let pattern = &transform.arguments[0];
                if Regex::new(pattern).is_err() {
                    return Err(invalid(format!(
                        "Transform '{}' has an invalid regular expression '{pattern}'",
                        transform.transform
                    )));
                }
            }
            TransformType::Exclude => {
                let Some(condition) = &transform.condition else {
                    return Err(invalid("Transform 'exclude' requires a condition"));
                };
                validate_exclude_condition(condition)?;
            }
            _ => {}
        }
        for output in transform.effective_outputs() {
            validate_field_name("transform output", &output)?;
            if let Some(previous) = written.insert(output.clone(), index) {
                if previous != index {
                    return Err(invalid(format!(
                        "Transform output '{output}' is written by more than one transform"
                    )));
                }
            }
        }
    }
    ensure_transforms_acyclic(transforms, &written)
}

fn validate_exclude_condition(condition: &Condition) -> Result<()> {
    let Some(value) = condition.value.as_deref() else {
        return Err(invalid("Exclude condition requires a value"));
    };
    match condition.operator {
        Operator::Match => Regex::new(value).map(|_| ()).map_err(|_| {
            invalid(format!("Exclude condition has an invalid regular expression '{value}'"))
        }),
        Operator::Eq => Ok(()),
        _ => value.parse::<f64>().map(|_| ()).map_err(|_| {
            invalid(format!(
                "Invalid condition value: cannot parse a double from string '{value}'"
            ))
        }),
    }
}

/// Rejects transforms whose outputs feed back into their own inputs.
fn ensure_transforms_acyclic(
    transforms: &[TransformConfig],
    writers: &HashMap<String, usize>,
) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    fn visit(
        index: usize,
        transforms: &[TransformConfig],
        writers: &HashMap<String, usize>,
        marks: &mut [Mark],
    ) -> Result<()> {
        match marks[index] {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                return Err(invalid(format!(
                    "Transform '{}' is part of a dependency cycle",
                    transforms[index].transform
                )))
            }
            Mark::Unvisited => {}
        }
        marks[index] = Mark::InProgress;
        for input in &transforms[index].inputs {
            if let Some(&writer) = writers.get(input) {
                if writer != index {
                    visit(writer, transforms, writers, marks)?;
                }
            }
        }
        marks[index] = Mark::Done;
        Ok(())
    }

    let mut marks = vec![Mark::Unvisited; transforms.len()];
    for index in 0..transforms.len() {
        visit(index, transforms, writers, &mut marks)?;
    }
    Ok(())
}

pub fn validate_scheduler_config(
    scheduler: &SchedulerConfig,
    analysis: &AnalysisConfig,
    data: &DataDescription,
) -> Result<()> {
    if let Some(delay) = scheduler.query_delay {
        if delay < 0 {
            return Err(invalid(format!(
                "Invalid queryDelay value {delay}: must be greater than or equal to 0"
            )));
        }
    }
    if let Some(frequency) = scheduler.frequency {
        if frequency <= 0 {
            return Err(invalid(format!(
                "Invalid frequency value {frequency}: must be greater than 0"
            )));
        }
    }
    if let Some(scroll) = scheduler.scroll_size {
        if scroll <= 0 || scroll > i64::from(u32::MAX) {
            return Err(invalid(format!(
                "Invalid scrollSize value {scroll}: must be greater than 0"
            )));
        }
    }
    match scheduler.data_source {
        DataSource::File => {
            if scheduler.file_path.as_deref().map_or(true, str::is_empty) {
                return Err(invalid("A FILE scheduler requires filePath"));
            }
            if scheduler.base_url.is_some() || scheduler.indexes.is_some() {
                return Err(invalid(
                    "A FILE scheduler does not support baseUrl or indexes",
                ));
            }
        }
        DataSource::Elasticsearch => {
            if scheduler.base_url.as_deref().map_or(true, str::is_empty) {
                return Err(invalid("An ELASTICSEARCH scheduler requires baseUrl"));
            }
            if scheduler.indexes.as_ref().map_or(true, Vec::is_empty) {
                return Err(invalid("An ELASTICSEARCH scheduler requires indexes"));
            }
            if scheduler.file_path.is_some() || scheduler.tail_file.is_some() {
                return Err(invalid(
                    "An ELASTICSEARCH scheduler does not support filePath or tailFile",
                ));
            }
        }
    }
    if data.format != DataFormat::Json {
        return Err(invalid("A scheduled job requires dataDescription.format JSON"));
    }
    if analysis.latency != 0 {
        return Err(invalid("A scheduled job cannot have latency"));
    }
    Ok(())
}
