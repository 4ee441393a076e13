//! Two-phase job updates.
//!
//! Each supported key owns an [`Updater`] that turns its JSON value into a
//! [`Mutation`] without touching the job. [`UpdateRegistry::prepare`] runs
//! every updater of a payload first; only a fully validated [`UpdatePlan`] is
//! ever committed, so a multi-key update applies all of its keys or none.

use std::collections::BTreeMap;

use serde_json::Value;

use super::types::{
    AnalysisLimits, DetectionRule, IgnoreDowntime, Job, SchedulerConfig, SchedulerState,
};
use crate::error::{EngineError, Result};
use crate::validation;

/// A validated change to one part of a job document.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Description(Option<String>),
    Detectors(Vec<DetectorPatch>),
    ModelDebugConfig(Option<Value>),
    RenormalizationWindowDays(Option<i64>),
    ModelSnapshotRetentionDays(Option<i64>),
    ResultsRetentionDays(Option<i64>),
    BackgroundPersistInterval(Option<i64>),
    CustomSettings(Option<Value>),
    AnalysisLimits(AnalysisLimits),
    SchedulerConfig(SchedulerConfig),
    CategorizationFilters(Vec<String>),
    IgnoreDowntime(IgnoreDowntime),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorPatch {
    pub index: usize,
    pub description: Option<String>,
    pub detector_rules: Option<Vec<DetectionRule>>,
}

impl Mutation {
    pub fn apply(self, job: &mut Job) {
        match self {
            Mutation::Description(description) => job.description = description,
            Mutation::Detectors(patches) => {
                for patch in patches {
                    if let Some(detector) = job.analysis_config.detectors.get_mut(patch.index) {
                        if let Some(description) = patch.description {
                            detector.detector_description = Some(description);
                        }
                        if let Some(rules) = patch.detector_rules {
                            detector.detector_rules = rules;
                        }
                    }
                }
            }
            Mutation::ModelDebugConfig(config) => job.model_debug_config = config,
            Mutation::RenormalizationWindowDays(days) => job.renormalization_window_days = days,
            Mutation::ModelSnapshotRetentionDays(days) => job.model_snapshot_retention_days = days,
            Mutation::ResultsRetentionDays(days) => job.results_retention_days = days,
            Mutation::BackgroundPersistInterval(secs) => job.background_persist_interval = secs,
            Mutation::CustomSettings(settings) => job.custom_settings = settings,
            Mutation::AnalysisLimits(limits) => job.analysis_limits = Some(limits),
            Mutation::SchedulerConfig(config) => job.scheduler_config = Some(config),
            Mutation::CategorizationFilters(filters) => {
                job.analysis_config.categorization_filters = filters
            }
            Mutation::IgnoreDowntime(ignore) => job.ignore_downtime = Some(ignore),
        }
    }
}

/// Validates the value of one update key against the current job.
pub trait Updater: Send + Sync {
    fn validate(&self, job: &Job, value: &Value) -> Result<Mutation>;
}

impl<F> Updater for F
where
    F: Fn(&Job, &Value) -> Result<Mutation> + Send + Sync,
{
    fn validate(&self, job: &Job, value: &Value) -> Result<Mutation> {
        self(job, value)
    }
}

/// Mutations accepted for every key of one payload.
#[derive(Debug, Default)]
pub struct UpdatePlan {
    mutations: Vec<(String, Mutation)>,
}

impl UpdatePlan {
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.mutations.iter().map(|(key, _)| key.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn commit(self, job: &mut Job) {
        for (_, mutation) in self.mutations {
            mutation.apply(job);
        }
    }
}

pub struct UpdateRegistry {
    updaters: BTreeMap<String, Box<dyn Updater>>,
}

impl Default for UpdateRegistry {
    fn default() -> Self {
        let mut registry = Self {
            updaters: BTreeMap::new(),
        };
        registry.register("description", update_description);
        registry.register("detectors", update_detectors);
        registry.register("modelDebugConfig", update_model_debug_config);
        registry.register("renormalizationWindowDays", |_: &Job, v: &Value| {
            days("renormalizationWindowDays", v).map(Mutation::RenormalizationWindowDays)
        });
        registry.register("modelSnapshotRetentionDays", |_: &Job, v: &Value| {
            days("modelSnapshotRetentionDays", v).map(Mutation::ModelSnapshotRetentionDays)
        });
        registry.register("resultsRetentionDays", |_: &Job, v: &Value| {
            days("resultsRetentionDays", v).map(Mutation::ResultsRetentionDays)
        });
        registry.register("backgroundPersistInterval", update_background_persist_interval);
        registry.register("customSettings", update_custom_settings);
        registry.register("analysisLimits", update_analysis_limits);
        registry.register("schedulerConfig", update_scheduler_config);
        registry.register("categorizationFilters", update_categorization_filters);
        registry.register("ignoreDowntime", update_ignore_downtime);
        registry
    }
}

impl UpdateRegistry {
    pub fn register(&mut self, key: &str, updater: impl Updater + 'static) {
        self.updaters.insert(key.to_string(), Box::new(updater));
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.updaters.keys().map(String::as_str)
    }

    /// Validates every key of `payload` against `job`.
    pub fn prepare(&self, job: &Job, payload: &Value) -> Result<UpdatePlan> {
        let Some(fields) = payload.as_object() else {
            return Err(EngineError::invalid_value(
                "Update requires JSON that defines an object of key-value pairs",
            ));
        };
        let mut plan = UpdatePlan::default();
        for (key, value) in fields {
            let Some(updater) = self.updaters.get(key) else {
                return Err(EngineError::InvalidUpdateKey { key: key.clone() });
            };
            let mutation = updater.validate(job, value)?;
            plan.mutations.push((key.clone(), mutation));
        }
        Ok(plan)
    }
}

fn shown(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn invalid_update(key: &str, reason: impl std::fmt::Display) -> EngineError {
    EngineError::invalid_value(format!("Invalid update value for {key}: {reason}"))
}

fn update_description(_: &Job, value: &Value) -> Result<Mutation> {
    match value {
        Value::Null => Ok(Mutation::Description(None)),
        Value::String(s) => Ok(Mutation::Description(Some(s.clone()))),
        other => Err(invalid_update(
            "description",
            format!("string expected; actual was: {}", shown(other)),
        )),
    }
}

fn update_detectors(job: &Job, value: &Value) -> Result<Mutation> {
    const REQUIRES: &str = "requires [index] and at least one of [description, detectorRules]";
    let Some(items) = value.as_array() else {
        return Err(invalid_update("detectors", "value must be an array"));
    };

    let detector_count = job.analysis_config.detectors.len();
    let mut patches = Vec::with_capacity(items.len());
    for item in items {
        let Some(fields) = item.as_object() else {
            return Err(invalid_update("detectors", REQUIRES));
        };
        let has_index = fields.contains_key("index");
        let has_change = fields.contains_key("description") || fields.contains_key("detectorRules");
        let only_known = fields
            .keys()
            .all(|k| matches!(k.as_str(), "index" | "description" | "detectorRules"));
        if !has_index || !has_change || !only_known {
            return Err(invalid_update("detectors", REQUIRES));
        }

        let raw_index = &fields["index"];
        let Some(index) = raw_index.as_i64() else {
            return Err(EngineError::invalid_value(format!(
                "Invalid index: integer expected; actual was: {}",
                shown(raw_index)
            )));
        };
        if index < 0 || index as usize >= detector_count {
            return Err(EngineError::invalid_value(format!(
                "Invalid index: valid range is [0, {}]; actual was: {index}",
                detector_count as i64 - 1
            )));
        }
        let index = index as usize;

        let description = match fields.get("description") {
            None => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(EngineError::invalid_value(format!(
                    "Invalid description: string expected; actual was: {}",
                    shown(other)
                )))
            }
        };

        let detector_rules = match fields.get("detectorRules") {
            None => None,
            Some(raw) => {
                let rules: Vec<DetectionRule> =
                    serde_json::from_value(raw.clone()).map_err(|err| {
                        EngineError::invalid_value(format!("Invalid detectorRules: {err}"))
                    })?;
                let detector = &job.analysis_config.detectors[index];
                for rule in &rules {
                    validation::validate_rule(detector, rule)?;
                }
                Some(rules)
            }
        };

        patches.push(DetectorPatch {
            index,
            description,
            detector_rules,
        });
    }
    Ok(Mutation::Detectors(patches))
}

fn update_model_debug_config(_: &Job, value: &Value) -> Result<Mutation> {
    match value {
        Value::Null => Ok(Mutation::ModelDebugConfig(None)),
        Value::Object(_) => Ok(Mutation::ModelDebugConfig(Some(value.clone()))),
        other => Err(invalid_update(
            "modelDebugConfig",
            format!("object expected; actual was: {}", shown(other)),
        )),
    }
}

fn update_custom_settings(_: &Job, value: &Value) -> Result<Mutation> {
    match value {
        Value::Null => Ok(Mutation::CustomSettings(None)),
        Value::Object(_) => Ok(Mutation::CustomSettings(Some(value.clone()))),
        other => Err(invalid_update(
            "customSettings",
            format!("object expected; actual was: {}", shown(other)),
        )),
    }
}

fn days(key: &str, value: &Value) -> Result<Option<i64>> {
    if value.is_null() {
        return Ok(None);
    }
    match value.as_i64() {
        Some(days) if days >= 0 => Ok(Some(days)),
        _ => Err(invalid_update(
            key,
            format!("value must be an integer >= 0; actual was: {}", shown(value)),
        )),
    }
}

fn update_background_persist_interval(_: &Job, value: &Value) -> Result<Mutation> {
    if value.is_null() {
        return Ok(Mutation::BackgroundPersistInterval(None));
    }
    match value.as_i64() {
        Some(secs) if secs >= validation::MIN_BACKGROUND_PERSIST_INTERVAL => {
            Ok(Mutation::BackgroundPersistInterval(Some(secs)))
        }
        _ => Err(invalid_update(
            "backgroundPersistInterval",
            format!(
                "value must be an integer >= {}; actual was: {}",
                validation::MIN_BACKGROUND_PERSIST_INTERVAL,
                shown(value)
            ),
        )),
    }
}

fn update_analysis_limits(job: &Job, value: &Value) -> Result<Mutation> {
    let limits: AnalysisLimits = serde_json::from_value(value.clone())
        .map_err(|err| invalid_update("analysisLimits", err))?;
    validation::validate_analysis_limits(&limits)?;
    if !job.status.is_closed() {
        return Err(invalid_update(
            "analysisLimits",
            format!("job must be closed; it is {}", job.status.as_str()),
        ));
    }
    let existing = job
        .analysis_limits
        .as_ref()
        .and_then(|limits| limits.model_memory_limit);
    if let (Some(existing), Some(requested)) = (existing, limits.model_memory_limit) {
        if requested < existing {
            return Err(invalid_update(
                "analysisLimits",
                format!(
                    "modelMemoryLimit cannot be decreased; existing is {existing}, update had {requested}"
                ),
            ));
        }
    }
    Ok(Mutation::AnalysisLimits(limits))
}

fn update_scheduler_config(job: &Job, value: &Value) -> Result<Mutation> {
    let Some(current) = &job.scheduler_config else {
        return Err(EngineError::NoSuchScheduledJob {
            job_id: job.id.clone(),
        });
    };
    let state = job.scheduler_state().unwrap_or(SchedulerState::Stopped);
    if state != SchedulerState::Stopped {
        return Err(invalid_update(
            "schedulerConfig",
            format!("the scheduler must be STOPPED; it is {}", state.as_str()),
        ));
    }
    let config: SchedulerConfig = serde_json::from_value(value.clone())
        .map_err(|err| invalid_update("schedulerConfig", err))?;
    if config.data_source != current.data_source {
        return Err(invalid_update(
            "schedulerConfig",
            format!(
                "dataSource cannot be changed; existing is {:?}, update had {:?}",
                current.data_source, config.data_source
            ),
        ));
    }
    validation::validate_scheduler_config(&config, &job.analysis_config, &job.data_description)?;
    Ok(Mutation::SchedulerConfig(config))
}

fn update_categorization_filters(job: &Job, value: &Value) -> Result<Mutation> {
    let filters: Vec<String> = serde_json::from_value(value.clone()).map_err(|_| {
        invalid_update(
            "categorizationFilters",
            format!("array of strings expected; actual was: {}", shown(value)),
        )
    })?;
    validation::validate_categorization_filters(&job.analysis_config, &filters)?;
    Ok(Mutation::CategorizationFilters(filters))
}

fn update_ignore_downtime(_: &Job, value: &Value) -> Result<Mutation> {
    serde_json::from_value::<IgnoreDowntime>(value.clone())
        .map(Mutation::IgnoreDowntime)
        .map_err(|_| {
            invalid_update(
                "ignoreDowntime",
                format!("expected NEVER, ONCE or ALWAYS; actual was: {}", shown(value)),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::job::types::{AnalysisConfig, Detector, JobConfig, JobStatus};
    use chrono::Utc;
    use serde_json::json;

    fn job_with_detectors(n: usize) -> Job {
        let config = JobConfig {
            analysis_config: AnalysisConfig {
                detectors: (0..n).map(|_| Detector::new("count")).collect(),
                categorization_field_name: Some("message".into()),
                ..Default::default()
            },
            analysis_limits: Some(AnalysisLimits {
                model_memory_limit: Some(42),
                categorization_examples_limit: None,
            }),
            ..Default::default()
        };
        Job::from_config("farm".into(), config, 600, Utc::now())
    }

    fn message(job: &Job, payload: Value) -> String {
        UpdateRegistry::default()
            .prepare(job, &payload)
            .unwrap_err()
            .to_string()
    }

    #[test]
    fn detector_payload_shape_errors() {
        let job = job_with_detectors(3);
        let requires = "Invalid update value for detectors: requires [index] and at least one of [description, detectorRules]";
        assert_eq!(
            message(&job, json!({"detectors": {"index": 0, "description": "haha"}})),
            "Invalid update value for detectors: value must be an array"
        );
        for bad in [
            json!([1, 2, 3]),
            json!([{"index": 1}]),
            json!([{"description": "bar", "detectorRules": []}]),
            json!([{"index": "1", "unknown": []}]),
            json!([{}]),
        ] {
            assert_eq!(message(&job, json!({ "detectors": bad })), requires);
        }
        assert_eq!(
            message(&job, json!({"detectors": [{"index": "a string", "description": "bar"}]})),
            "Invalid index: integer expected; actual was: a string"
        );
        assert_eq!(
            message(&job, json!({"detectors": [{"index": 0, "description": 1}]})),
            "Invalid description: string expected; actual was: 1"
        );
        assert_eq!(
            message(&job, json!({"detectors": [{"index": 3, "description": "bar"}]})),
            "Invalid index: valid range is [0, 2]; actual was: 3"
        );
        assert_eq!(
            message(&job_with_detectors(2), json!({"detectors": [{"index": -1, "description": "bar"}]})),
            "Invalid index: valid range is [0, 1]; actual was: -1"
        );
    }

    #[test]
    fn second_invalid_patch_rejects_whole_update() {
        let mut job = job_with_detectors(3);
        let payload = json!({
            "description": "changed",
            "detectors": [{"index": 1, "description": "Ipanema"}, {"index": 4, "description": "A Train"}]
        });
        let err = UpdateRegistry::default().prepare(&job, &payload).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidValue);
        assert_eq!(err.to_string(), "Invalid index: valid range is [0, 2]; actual was: 4");
        assert!(job.description.is_none());

        let payload = json!({"detectors": [{"index": 1, "description": "Ipanema"}], "renormalizationWindowDays": 7});
        let plan = UpdateRegistry::default().prepare(&job, &payload).unwrap();
        plan.commit(&mut job);
        assert_eq!(
            job.analysis_config.detectors[1].detector_description.as_deref(),
            Some("Ipanema")
        );
        assert_eq!(job.renormalization_window_days, Some(7));
    }

    #[test]
    fn unknown_key_and_non_object_payload() {
        let job = job_with_detectors(1);
        let err = UpdateRegistry::default()
            .prepare(&job, &json!({"description": "x", "bogus": 1}))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidUpdateKey);
        let err = UpdateRegistry::default().prepare(&job, &json!([1])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidValue);
    }

    #[test]
    fn model_memory_limit_only_grows_while_closed() {
        let mut job = job_with_detectors(1);
        assert_eq!(
            message(&job, json!({"analysisLimits": {"modelMemoryLimit": 41}})),
            "Invalid update value for analysisLimits: modelMemoryLimit cannot be decreased; existing is 42, update had 41"
        );
        UpdateRegistry::default()
            .prepare(&job, &json!({"analysisLimits": {"modelMemoryLimit": 100}}))
            .unwrap();

        job.status = JobStatus::Running;
        assert!(message(&job, json!({"analysisLimits": {"modelMemoryLimit": 100}})).contains("closed"));
    }

    #[test]
    fn scalar_keys_validate_ranges() {
        let job = job_with_detectors(1);
        assert!(message(&job, json!({"resultsRetentionDays": -1})).contains("resultsRetentionDays"));
        assert!(message(&job, json!({"backgroundPersistInterval": 10})).contains("3600"));
        assert!(message(&job, json!({"ignoreDowntime": "SOMETIMES"})).contains("ignoreDowntime"));
        assert!(message(&job, json!({"categorizationFilters": ["("]})).contains("("));

        let mut job = job;
        UpdateRegistry::default()
            .prepare(&job, &json!({"ignoreDowntime": "ALWAYS", "customSettings": {"owner": "ops"}}))
            .unwrap()
            .commit(&mut job);
        assert_eq!(job.ignore_downtime, Some(IgnoreDowntime::Always));
        assert_eq!(job.custom_settings, Some(json!({"owner": "ops"})));
    }

    #[test]
    fn scheduler_config_requires_stopped_scheduler_and_same_source() {
        let mut job = job_with_detectors(1);
        job.data_description.format = crate::job::types::DataFormat::Json;
        let err = UpdateRegistry::default()
            .prepare(&job, &json!({"schedulerConfig": {"dataSource": "FILE", "filePath": "/x"}}))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoSuchScheduledJob);

        job.scheduler_config = Some(SchedulerConfig::file("/var/data/a.json"));
        UpdateRegistry::default()
            .prepare(&job, &json!({"schedulerConfig": {"dataSource": "FILE", "filePath": "/var/data/b.json"}}))
            .unwrap();
        assert!(message(
            &job,
            json!({"schedulerConfig": {"dataSource": "ELASTICSEARCH", "baseUrl": "http://es:9200", "indexes": ["a"]}})
        )
        .contains("dataSource cannot be changed"));

        job.scheduler_status = Some(SchedulerState::Started);
        assert!(message(
            &job,
            json!({"schedulerConfig": {"dataSource": "FILE", "filePath": "/var/data/b.json"}})
        )
        .contains("STOPPED"));
    }
}
