//! Result documents produced by the analytics worker and read back by clients.

pub mod query;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use query::{BucketQuery, InfluencerQuery, QueryPage, RecordQuery, RecordSortField};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordInfluence {
    pub influencer_field_name: String,
    pub influencer_field_values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyRecord {
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    pub bucket_span: i64,
    pub detector_index: usize,
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_field_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_field_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub over_field_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub over_field_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_field_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_field_value: Option<String>,
    pub actual: Vec<f64>,
    pub typical: Vec<f64>,
    pub probability: f64,
    pub normalized_probability: f64,
    pub anomaly_score: f64,
    pub is_interim: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub influencers: Vec<RecordInfluence>,
    /// Insertion order assigned by the store.
    #[serde(default)]
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Influencer {
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    pub influencer_field_name: String,
    pub influencer_field_value: String,
    pub probability: f64,
    pub anomaly_score: f64,
    pub initial_anomaly_score: f64,
    pub is_interim: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    pub bucket_span: i64,
    pub anomaly_score: f64,
    pub initial_anomaly_score: f64,
    /// Raw score before normalization against the job's ceiling.
    pub unnormalized_score: f64,
    pub max_normalized_probability: f64,
    pub event_count: u64,
    pub record_count: usize,
    pub is_interim: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<AnomalyRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub influencers: Vec<Influencer>,
}

impl Bucket {
    pub fn epoch(&self) -> i64 {
        self.timestamp.timestamp()
    }

    /// Sets the bucket-level score and copies it onto every record.
    pub fn set_anomaly_score(&mut self, score: f64) {
        self.anomaly_score = score;
        for record in &mut self.records {
            record.anomaly_score = score;
        }
    }

    /// Checks the score invariants between a bucket and its records.
    pub fn is_consistent(&self) -> bool {
        if self.records.len() != self.record_count {
            return false;
        }
        if self
            .records
            .iter()
            .any(|r| r.anomaly_score != self.anomaly_score || r.is_interim != self.is_interim)
        {
            return false;
        }
        let max = self
            .records
            .iter()
            .map(|r| r.normalized_probability)
            .fold(0.0_f64, f64::max);
        max == self.max_normalized_probability
    }

    /// Copy without embedded records, as returned by unexpanded reads.
    pub fn without_records(&self) -> Bucket {
        Bucket {
            records: Vec::new(),
            influencers: Vec::new(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSnapshot {
    pub job_id: String,
    pub snapshot_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub restore_priority: i64,
    pub snapshot_doc_count: u64,
    pub model_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_record_time_stamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_result_time_stamp: Option<DateTime<Utc>>,
    /// Opaque worker state.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub state: serde_json::Value,
}

impl ModelSnapshot {
    /// Snapshots order by the newest record folded into them.
    pub fn order_key(&self) -> (Option<DateTime<Utc>>, i64) {
        (self.latest_record_time_stamp, self.restore_priority)
    }

    pub fn without_state(&self) -> ModelSnapshot {
        ModelSnapshot {
            state: serde_json::Value::Null,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: u64,
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub kind: String,
    pub payload: serde_json::Value,
}

pub(crate) fn epoch_to_datetime(epoch: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(epoch, 0).unwrap_or_default()
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;

    #[test]
    fn set_anomaly_score_keeps_bucket_consistent() {
        let mut bucket = bucket("j", 600, vec![record("j", 600, "aal", 40.0), record("j", 600, "ual", 70.0)], 10.0);
        assert!(bucket.is_consistent());
        bucket.set_anomaly_score(55.5);
        assert!(bucket.records.iter().all(|r| r.anomaly_score == 55.5));
        assert!(bucket.is_consistent());

        bucket.records[0].normalized_probability = 90.0;
        assert!(!bucket.is_consistent());
    }

    #[test]
    fn without_records_keeps_counts() {
        let bucket = bucket("j", 600, vec![record("j", 600, "aal", 40.0)], 10.0);
        let bare = bucket.without_records();
        assert!(bare.records.is_empty());
        assert_eq!(bare.record_count, 1);
        assert_eq!(bare.epoch(), 600);
    }
}
