//! Deterministic in-process analytics model.
//!
//! Stands in for the external analytics engine. Each detector tracks one
//! series per (partition, by, over) value combination; every finalized bucket
//! value is scored against the series' running mean and variance and then
//! folded into it. The whole state serializes into model snapshots, so a
//! restored model continues exactly where the snapshot left off.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AnalyticsModel, FlushParams, InputRecord, ModelFactory, ModelOutput};
use crate::error::{EngineError, Result};
use crate::job::types::{
    Connective, DetectionRule, Detector, DetectorFunction, Job, Operator, RuleCondition,
    RuleConditionType, Side,
};
use crate::normalizer::{self, CEILING_FLOOR};
use crate::results::{
    epoch_to_datetime, AnomalyRecord, Bucket, Influencer, ModelSnapshot, RecordInfluence,
};

/// Buckets of history a series needs before its values are scored.
const MIN_HISTORY: u64 = 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalModelFactory;

impl ModelFactory for LocalModelFactory {
    fn create(&self, job: &Job, snapshot: Option<&ModelSnapshot>) -> Result<Box<dyn AnalyticsModel>> {
        let mut model = LocalModel::new(job)?;
        if let Some(snapshot) = snapshot {
            model.restore(snapshot)?;
        }
        Ok(Box::new(model))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct SeriesIdentity {
    detector_index: usize,
    partition: Option<String>,
    by: Option<String>,
    over: Option<String>,
}

impl SeriesIdentity {
    fn key(&self) -> String {
        format!(
            "{}/{:?}/{:?}/{:?}",
            self.detector_index, self.partition, self.by, self.over
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SeriesModel {
    identity: SeriesIdentity,
    observations: u64,
    mean: f64,
    m2: f64,
}

impl SeriesModel {
    fn new(identity: SeriesIdentity) -> Self {
        Self {
            identity,
            observations: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }

    fn observe(&mut self, value: f64) {
        self.observations += 1;
        let delta = value - self.mean;
        self.mean += delta / self.observations as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn std_dev(&self) -> f64 {
        if self.observations < 2 {
            return 0.0;
        }
        (self.m2 / (self.observations - 1) as f64).max(0.0).sqrt()
    }

    /// `(typical, probability)` of `value` under the model.
    fn score(&self, value: f64, side: Side) -> (f64, f64) {
        if self.observations < MIN_HISTORY {
            return (value, 1.0);
        }
        let typical = self.mean;
        let in_direction = match side {
            Side::Both => true,
            Side::High => value > typical,
            Side::Low => value < typical,
        };
        if !in_direction {
            return (typical, 1.0);
        }
        let spread = self.std_dev().max(0.01 * typical.abs().max(1.0));
        let z = (value - typical).abs() / spread;
        let probability = erfc(z / std::f64::consts::SQRT_2).min(1.0);
        (typical, probability)
    }
}

/// Complementary error function, fractional error below 1.2e-7.
fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    let r = t * poly.exp();
    if x >= 0.0 {
        r
    } else {
        2.0 - r
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SeriesAccumulator {
    identity: SeriesIdentity,
    count: u64,
    values: Vec<f64>,
    distinct: BTreeSet<String>,
    influences: BTreeMap<String, BTreeSet<String>>,
}

impl SeriesAccumulator {
    fn new(identity: SeriesIdentity) -> Self {
        Self {
            identity,
            count: 0,
            values: Vec::new(),
            distinct: BTreeSet::new(),
            influences: BTreeMap::new(),
        }
    }

    /// The bucket statistic `function` reports, if it has one.
    fn aggregate(&self, function: DetectorFunction) -> Option<f64> {
        use DetectorFunction::*;
        let values = &self.values;
        let sum: f64 = values.iter().sum();
        let mean = || (!values.is_empty()).then(|| sum / values.len() as f64);
        match function {
            Count | HighCount | LowCount | Rare | FreqRare => Some(self.count as f64),
            NonZeroCount | LowNonZeroCount | HighNonZeroCount => {
                (self.count > 0).then_some(self.count as f64)
            }
            DistinctCount => (!self.distinct.is_empty()).then_some(self.distinct.len() as f64),
            InfoContent => (!self.distinct.is_empty())
                .then(|| self.distinct.iter().map(|v| v.len() as f64).sum()),
            Metric | Mean | HighMean | LowMean | TimeOfDay | TimeOfWeek => mean(),
            Min => values.iter().copied().reduce(f64::min),
            Max => values.iter().copied().reduce(f64::max),
            Sum | HighSum | LowSum => (!values.is_empty()).then_some(sum),
            Median => {
                if values.is_empty() {
                    return None;
                }
                let mut sorted = values.clone();
                sorted.sort_by(|a, b| a.total_cmp(b));
                let mid = sorted.len() / 2;
                Some(if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                })
            }
            Varp => {
                let mean = mean()?;
                Some(values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64)
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BucketAccumulator {
    event_count: u64,
    series: BTreeMap<String, SeriesAccumulator>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelState {
    series: BTreeMap<String, SeriesModel>,
    open: BTreeMap<i64, BucketAccumulator>,
    /// First epoch not yet finalized.
    next_epoch: Option<i64>,
    first_epoch: Option<i64>,
    latest_record_time: Option<i64>,
    /// Epoch of the newest finalized bucket.
    latest_result_time: Option<i64>,
    ceiling: f64,
    last_persist_time: Option<i64>,
}

struct DetectorPlan {
    detector: Detector,
    function: DetectorFunction,
}

pub struct LocalModel {
    job_id: String,
    bucket_span: i64,
    latency: i64,
    detectors: Vec<DetectorPlan>,
    influencers: Vec<String>,
    summary_count_field: Option<String>,
    persist_interval: Option<i64>,
    state: ModelState,
}

impl LocalModel {
    pub fn new(job: &Job) -> Result<Self> {
        let detectors = job
            .analysis_config
            .detectors
            .iter()
            .map(|detector| {
                detector
                    .parsed_function()
                    .map(|function| DetectorPlan {
                        detector: detector.clone(),
                        function,
                    })
                    .ok_or_else(|| {
                        EngineError::worker(
                            &job.id,
                            format!("unknown function '{}'", detector.function_name()),
                        )
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            job_id: job.id.clone(),
            bucket_span: job.bucket_span().max(1),
            latency: job.analysis_config.latency.max(0),
            detectors,
            influencers: job.analysis_config.influencers.clone(),
            summary_count_field: job.analysis_config.summary_count_field_name.clone(),
            persist_interval: job.background_persist_interval,
            state: ModelState {
                ceiling: CEILING_FLOOR,
                ..Default::default()
            },
        })
    }

    pub fn restore(&mut self, snapshot: &ModelSnapshot) -> Result<()> {
        self.state = serde_json::from_value(snapshot.state.clone()).map_err(|err| {
            EngineError::worker(
                &self.job_id,
                format!("cannot restore model snapshot {}: {err}", snapshot.snapshot_id),
            )
        })?;
        Ok(())
    }

    fn align(&self, time: i64) -> i64 {
        time.div_euclid(self.bucket_span) * self.bucket_span
    }

    fn accumulate(&mut self, record: &InputRecord) {
        let epoch = self.align(record.time);
        let weight = self
            .summary_count_field
            .as_ref()
            .and_then(|field| record.fields.get(field))
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(1);
        let bucket = self.state.open.entry(epoch).or_default();
        bucket.event_count += weight;

        for (index, plan) in self.detectors.iter().enumerate() {
            let detector = &plan.detector;
            let value_of = |name: &Option<String>| {
                name.as_ref()
                    .and_then(|field| record.fields.get(field).cloned())
            };
            let identity = SeriesIdentity {
                detector_index: index,
                partition: value_of(&detector.partition_field_name),
                by: value_of(&detector.by_field_name),
                over: value_of(&detector.over_field_name),
            };
            let series = bucket
                .series
                .entry(identity.key())
                .or_insert_with(|| SeriesAccumulator::new(identity));
            series.count += weight;

            match plan.function {
                DetectorFunction::TimeOfDay => {
                    series.values.push(record.time.rem_euclid(86_400) as f64);
                }
                DetectorFunction::TimeOfWeek => {
                    let at = epoch_to_datetime(record.time);
                    let weekday = i64::from(at.weekday().num_days_from_monday());
                    let seconds = i64::from(at.num_seconds_from_midnight());
                    series.values.push((weekday * 86_400 + seconds) as f64);
                }
                DetectorFunction::DistinctCount | DetectorFunction::InfoContent => {
                    if let Some(value) = value_of(&detector.field_name) {
                        series.distinct.insert(value);
                    }
                }
                function if function.requires_field() => {
                    if let Some(value) = value_of(&detector.field_name)
                        .and_then(|v| v.trim().parse::<f64>().ok())
                        .filter(|v| v.is_finite())
                    {
                        series.values.push(value);
                    }
                }
                _ => {}
            }

            for influencer in &self.influencers {
                if let Some(value) = record.fields.get(influencer) {
                    series
                        .influences
                        .entry(influencer.clone())
                        .or_default()
                        .insert(value.clone());
                }
            }
        }
    }

    /// Finalizes every bucket with an epoch at or before `limit`, emitting
    /// empty buckets for gaps after the last finalized one.
    fn finalize_through(&mut self, limit: i64, output: &mut ModelOutput) -> Result<()> {
        let Some(mut next) = self.state.next_epoch else {
            return Ok(());
        };
        let reopened: Vec<i64> = self
            .state
            .open
            .range(..next)
            .map(|(epoch, _)| *epoch)
            .filter(|epoch| *epoch <= limit)
            .collect();
        for epoch in reopened {
            let accumulator = self.state.open.remove(&epoch).unwrap_or_default();
            let bucket = self.finalize_bucket(epoch, accumulator, output);
            output.buckets.push(bucket);
        }
        while next <= limit {
            let accumulator = self.state.open.remove(&next).unwrap_or_default();
            let bucket = self.finalize_bucket(next, accumulator, output);
            output.buckets.push(bucket);
            next += self.bucket_span;
        }
        self.state.next_epoch = Some(next);
        self.maybe_background_persist(output)
    }

    fn finalize_bucket(
        &mut self,
        epoch: i64,
        accumulator: BucketAccumulator,
        output: &mut ModelOutput,
    ) -> Bucket {
        let observations = self.bucket_values(&accumulator);
        let mut bucket = self.build_bucket(epoch, &accumulator, &observations, false);

        for (identity, value) in observations {
            self.state
                .series
                .entry(identity.key())
                .or_insert_with(|| SeriesModel::new(identity))
                .observe(value);
        }

        if bucket.unnormalized_score > self.state.ceiling {
            self.state.ceiling = bucket.unnormalized_score;
            output.ceiling = Some(self.state.ceiling);
        }
        let score = normalizer::anomaly_score(bucket.unnormalized_score, self.state.ceiling);
        bucket.set_anomaly_score(score);
        bucket.initial_anomaly_score = score;
        self.state.latest_result_time = Some(
            self.state
                .latest_result_time
                .map_or(epoch, |latest| latest.max(epoch)),
        );
        bucket
    }

    /// Per-series bucket values, including zero counts for count series
    /// that have history but no data in this bucket.
    fn bucket_values(&self, accumulator: &BucketAccumulator) -> Vec<(SeriesIdentity, f64)> {
        let mut values: Vec<(SeriesIdentity, f64)> = Vec::new();
        for series in accumulator.series.values() {
            let function = self.detectors[series.identity.detector_index].function;
            if let Some(value) = series.aggregate(function) {
                values.push((series.identity.clone(), value));
            }
        }
        for (key, model) in &self.state.series {
            let function = self.detectors[model.identity.detector_index].function;
            let zero_fill = function.is_count() && !function.is_non_zero_count();
            if zero_fill && !accumulator.series.contains_key(key) {
                values.push((model.identity.clone(), 0.0));
            }
        }
        values.sort_by(|a, b| a.0.cmp(&b.0));
        values
    }

    fn build_bucket(
        &self,
        epoch: i64,
        accumulator: &BucketAccumulator,
        observations: &[(SeriesIdentity, f64)],
        is_interim: bool,
    ) -> Bucket {
        let timestamp = epoch_to_datetime(epoch);
        let mut records = Vec::new();
        let mut unnormalized: f64 = 0.0;

        for (identity, value) in observations {
            let plan = &self.detectors[identity.detector_index];
            let detector = &plan.detector;
            let (typical, probability) = match self.state.series.get(&identity.key()) {
                Some(model) => model.score(*value, plan.function.side()),
                None => (*value, 1.0),
            };
            if suppressed(&detector.detector_rules, detector, identity, *value, typical) {
                continue;
            }
            unnormalized = unnormalized.max(normalizer::excess_surprise(probability));
            let influencers = accumulator
                .series
                .get(&identity.key())
                .map(|series| {
                    series
                        .influences
                        .iter()
                        .map(|(name, values)| RecordInfluence {
                            influencer_field_name: name.clone(),
                            influencer_field_values: values.iter().cloned().collect(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            records.push(AnomalyRecord {
                job_id: self.job_id.clone(),
                timestamp,
                bucket_span: self.bucket_span,
                detector_index: identity.detector_index,
                function: detector.function_name().to_string(),
                field_name: detector.field_name.clone(),
                by_field_name: detector.by_field_name.clone(),
                by_field_value: identity.by.clone(),
                over_field_name: detector.over_field_name.clone(),
                over_field_value: identity.over.clone(),
                partition_field_name: detector.partition_field_name.clone(),
                partition_field_value: identity.partition.clone(),
                actual: vec![*value],
                typical: vec![typical],
                probability,
                normalized_probability: normalizer::normalized_probability(probability),
                anomaly_score: 0.0,
                is_interim,
                influencers,
                sequence: 0,
            });
        }

        let max_normalized_probability = records
            .iter()
            .map(|r| r.normalized_probability)
            .fold(0.0_f64, f64::max);
        let influencers = bucket_influencers(&self.job_id, timestamp, &records, is_interim);
        let score = normalizer::anomaly_score(unnormalized, self.state.ceiling);
        let mut bucket = Bucket {
            job_id: self.job_id.clone(),
            timestamp,
            bucket_span: self.bucket_span,
            anomaly_score: 0.0,
            initial_anomaly_score: score,
            unnormalized_score: unnormalized,
            max_normalized_probability,
            event_count: accumulator.event_count,
            record_count: records.len(),
            is_interim,
            records,
            influencers,
        };
        bucket.set_anomaly_score(score);
        bucket
    }

    fn maybe_background_persist(&mut self, output: &mut ModelOutput) -> Result<()> {
        let (Some(interval), Some(latest)) = (self.persist_interval, self.state.latest_result_time)
        else {
            return Ok(());
        };
        match self.state.last_persist_time {
            None => self.state.last_persist_time = Some(latest),
            Some(last) if latest - last >= interval => {
                self.state.last_persist_time = Some(latest);
                let snapshot = self.snapshot("State persisted due to background persist")?;
                output.snapshots.push(snapshot);
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn snapshot(&self, reason: &str) -> Result<ModelSnapshot> {
        let state = serde_json::to_value(&self.state).map_err(|err| {
            EngineError::worker(&self.job_id, format!("cannot serialize model state: {err}"))
        })?;
        let model_size_bytes = state.to_string().len() as u64;
        let latest_record = self.state.latest_record_time;
        Ok(ModelSnapshot {
            job_id: self.job_id.clone(),
            snapshot_id: Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
            description: Some(format!("{reason} at {}", Utc::now().to_rfc3339())),
            restore_priority: latest_record.unwrap_or(0),
            snapshot_doc_count: 1,
            model_size_bytes,
            latest_record_time_stamp: latest_record.map(epoch_to_datetime),
            latest_result_time_stamp: self.state.latest_result_time.map(epoch_to_datetime),
            state,
        })
    }
}

impl AnalyticsModel for LocalModel {
    fn process(&mut self, records: &[InputRecord]) -> Result<ModelOutput> {
        let mut output = ModelOutput::default();
        for record in records {
            let epoch = self.align(record.time);
            match self.state.next_epoch {
                Some(next) if epoch < next && !self.state.open.contains_key(&epoch) => {
                    output.late_records += 1;
                    continue;
                }
                Some(_) => {}
                None => {
                    self.state.next_epoch = Some(epoch);
                    self.state.first_epoch = Some(epoch);
                }
            }
            self.accumulate(record);
            self.state.latest_record_time = Some(
                self.state
                    .latest_record_time
                    .map_or(record.time, |latest| latest.max(record.time)),
            );
        }

        if let Some(latest) = self.state.latest_record_time {
            let limit = self.align(latest - self.bucket_span - self.latency);
            self.finalize_through(limit, &mut output)?;
        }
        Ok(output)
    }

    fn flush(&mut self, params: &FlushParams) -> Result<ModelOutput> {
        let mut output = ModelOutput::default();
        if let Some(time) = params.skip_time {
            let target = self.align(time);
            if self.state.next_epoch.map_or(true, |next| next < target) {
                self.state.open = self.state.open.split_off(&target);
                self.state.next_epoch = Some(target);
                self.state.first_epoch.get_or_insert(target);
                tracing::info!(job_id = %self.job_id, skip_to = target, "skipped model time");
            }
        }
        if let Some(time) = params.advance_time {
            if self.state.next_epoch.is_none() {
                self.state.next_epoch = Some(self.align(time));
            }
            self.finalize_through(self.align(time) - self.bucket_span, &mut output)?;
        }
        if params.calc_interim {
            let start = params.start.unwrap_or(i64::MIN);
            let end = params.end.unwrap_or(i64::MAX);
            let interim = self
                .state
                .open
                .iter()
                .filter(|(epoch, bucket)| **epoch >= start && **epoch < end && bucket.event_count > 0)
                .map(|(epoch, bucket)| {
                    let observations = self.bucket_values(bucket);
                    self.build_bucket(*epoch, bucket, &observations, true)
                })
                .collect();
            output.interim = Some(interim);
        }
        Ok(output)
    }

    fn reset_buckets(&mut self, start: i64, end: i64) -> Result<()> {
        let first = self.align(start);
        let stale: Vec<i64> = self
            .state
            .open
            .range(first..end.max(first))
            .map(|(epoch, _)| *epoch)
            .collect();
        for epoch in stale {
            self.state.open.remove(&epoch);
        }
        if let (Some(next), Some(first_seen)) = (self.state.next_epoch, self.state.first_epoch) {
            let mut epoch = first.max(first_seen);
            while epoch < end.min(next) {
                self.state.open.insert(epoch, BucketAccumulator::default());
                epoch += self.bucket_span;
            }
        }
        tracing::debug!(job_id = %self.job_id, start, end, "reset buckets");
        Ok(())
    }

    fn close(&mut self) -> Result<ModelOutput> {
        let mut output = ModelOutput {
            interim: Some(Vec::new()),
            ..Default::default()
        };
        if let Some(last) = self.state.open.keys().next_back().copied() {
            self.finalize_through(last, &mut output)?;
        }
        output.snapshots.push(self.snapshot("State persisted due to job close")?);
        Ok(output)
    }
}

fn field_value<'a>(detector: &Detector, identity: &'a SeriesIdentity, field: &str) -> Option<&'a str> {
    let matches = |name: &Option<String>| name.as_deref() == Some(field);
    if matches(&detector.by_field_name) {
        identity.by.as_deref()
    } else if matches(&detector.over_field_name) {
        identity.over.as_deref()
    } else if matches(&detector.partition_field_name) {
        identity.partition.as_deref()
    } else {
        None
    }
}

fn condition_matches(
    condition: &RuleCondition,
    detector: &Detector,
    identity: &SeriesIdentity,
    actual: f64,
    typical: f64,
) -> bool {
    if condition.condition_type == RuleConditionType::Categorical {
        let Some(field) = &condition.field_name else {
            return false;
        };
        let Some(value) = field_value(detector, identity, field) else {
            return false;
        };
        return condition
            .value_list
            .as_ref()
            .is_some_and(|list| list.iter().any(|v| v == value));
    }

    if let (Some(field), Some(expected)) = (&condition.field_name, &condition.field_value) {
        if field_value(detector, identity, field) != Some(expected.as_str()) {
            return false;
        }
    }
    let Some(inner) = &condition.condition else {
        return false;
    };
    let Some(threshold) = inner.value.as_deref().and_then(|v| v.parse::<f64>().ok()) else {
        return false;
    };
    let x = match condition.condition_type {
        RuleConditionType::NumericalActual => actual,
        RuleConditionType::NumericalTypical => typical,
        _ => (actual - typical).abs(),
    };
    match inner.operator {
        Operator::Eq => x == threshold,
        Operator::Gt => x > threshold,
        Operator::Gte => x >= threshold,
        Operator::Lt => x < threshold,
        Operator::Lte => x <= threshold,
        Operator::Match => false,
    }
}

fn suppressed(
    rules: &[DetectionRule],
    detector: &Detector,
    identity: &SeriesIdentity,
    actual: f64,
    typical: f64,
) -> bool {
    rules.iter().any(|rule| {
        let mut results = rule
            .rule_conditions
            .iter()
            .map(|c| condition_matches(c, detector, identity, actual, typical));
        match rule.conditions_connective {
            Connective::Or => results.any(|m| m),
            Connective::And => !rule.rule_conditions.is_empty() && results.all(|m| m),
        }
    })
}

fn bucket_influencers(
    job_id: &str,
    timestamp: chrono::DateTime<Utc>,
    records: &[AnomalyRecord],
    is_interim: bool,
) -> Vec<Influencer> {
    let mut by_value: BTreeMap<(String, String), (f64, f64)> = BTreeMap::new();
    for record in records {
        for influence in &record.influencers {
            for value in &influence.influencer_field_values {
                let entry = by_value
                    .entry((influence.influencer_field_name.clone(), value.clone()))
                    .or_insert((1.0, 0.0));
                entry.0 = entry.0.min(record.probability);
                entry.1 = entry.1.max(record.normalized_probability);
            }
        }
    }
    by_value
        .into_iter()
        .map(|((name, value), (probability, score))| Influencer {
            job_id: job_id.to_string(),
            timestamp,
            influencer_field_name: name,
            influencer_field_value: value,
            probability,
            anomaly_score: score,
            initial_anomaly_score: score,
            is_interim,
        })
        .collect()
}
