//! Long-poll for the first result that crosses a threshold.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::error::{EngineError, Result};
use crate::ingest::IngestionPipeline;
use crate::job::JobRegistry;
use crate::results::Bucket;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRequest {
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub probability: Option<f64>,
    pub timeout_secs: u64,
    #[serde(default)]
    pub include_interim: bool,
}

impl AlertRequest {
    fn validate(&self) -> Result<()> {
        if self.score.is_none() && self.probability.is_none() {
            return Err(EngineError::InvalidThresholdArgument {
                message: "Either score or probability must be specified".to_string(),
            });
        }
        for (name, value) in [("score", self.score), ("probability", self.probability)] {
            if let Some(value) = value {
                if !(0.0..=100.0).contains(&value) {
                    return Err(EngineError::InvalidThresholdArgument {
                        message: format!("Invalid alert parameter {name} = {value}: must be in the range [0, 100]"),
                    });
                }
            }
        }
        Ok(())
    }

    fn fires_on(&self, bucket: &Bucket) -> bool {
        if bucket.is_interim && !self.include_interim {
            return false;
        }
        let by_score = self.score.is_some_and(|score| bucket.anomaly_score >= score);
        let by_probability = self.probability.is_some_and(|probability| {
            bucket
                .records
                .iter()
                .any(|record| record.normalized_probability >= probability)
        });
        by_score || by_probability
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub timeout: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<Bucket>,
}

pub struct AlertWatcher {
    registry: Arc<JobRegistry>,
    pipeline: Arc<IngestionPipeline>,
    max_timeout: Duration,
}

impl AlertWatcher {
    pub fn new(registry: Arc<JobRegistry>, pipeline: Arc<IngestionPipeline>, max_timeout: Duration) -> Self {
        Self {
            registry,
            pipeline,
            max_timeout,
        }
    }

    /// Waits for the next persisted bucket that crosses either threshold.
    /// Only results produced after the call are considered.
    pub async fn wait_for_alert(&self, job_id: &str, request: AlertRequest) -> Result<Alert> {
        request.validate()?;
        self.registry.get(job_id).await?;
        let Some(mut results) = self.pipeline.subscribe(job_id) else {
            return Err(EngineError::JobNotRunning {
                job_id: job_id.to_string(),
            });
        };

        let timeout = Duration::from_secs(request.timeout_secs).min(self.max_timeout);
        let wait = async {
            loop {
                match results.recv().await {
                    Ok(bucket) if request.fires_on(&bucket) => return Some(bucket),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(job_id, skipped, "alert waiter fell behind");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        };
        let bucket = tokio::time::timeout(timeout, wait).await.ok().flatten();
        if let Some(bucket) = &bucket {
            tracing::info!(
                job_id,
                epoch = bucket.epoch(),
                anomaly_score = bucket.anomaly_score,
                "alert fired"
            );
        }
        Ok(Alert {
            timeout: bucket.is_none(),
            bucket,
        })
    }
}
