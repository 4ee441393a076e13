//! Periodic pruning of results and snapshots past a job's retention.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::job::types::Job;
use crate::job::JobRegistry;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub buckets: u64,
    pub snapshots: u64,
}

pub struct RetentionService {
    registry: Arc<JobRegistry>,
    interval: Duration,
}

impl RetentionService {
    pub fn new(registry: Arc<JobRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    pub fn start(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.sweep().await {
                            tracing::warn!(error = %err, "retention sweep failed");
                        }
                    }
                }
            }
        });
    }

    pub async fn sweep(&self) -> Result<SweepSummary> {
        let mut total = SweepSummary::default();
        for job in self.registry.list().await? {
            let summary = self.sweep_job(&job).await?;
            if summary != SweepSummary::default() {
                tracing::info!(
                    job_id = %job.id,
                    buckets = summary.buckets,
                    snapshots = summary.snapshots,
                    "pruned expired results"
                );
            }
            total.buckets += summary.buckets;
            total.snapshots += summary.snapshots;
        }
        Ok(total)
    }

    /// Retention is measured back from the job's newest data, not the wall
    /// clock, so replayed historical data is not pruned on arrival.
    async fn sweep_job(&self, job: &Job) -> Result<SweepSummary> {
        let mut summary = SweepSummary::default();
        let Some(newest) = job.counts.latest_record_time_stamp.map(|t| t.timestamp()) else {
            return Ok(summary);
        };
        let store = self.registry.store();

        if let Some(days) = job.results_retention_days.filter(|d| *d > 0) {
            let cutoff = newest - days * SECONDS_PER_DAY;
            summary.buckets = store
                .delete_results_in_range(&job.id, i64::MIN, cutoff)
                .await?;
        }

        if let Some(days) = job.model_snapshot_retention_days.filter(|d| *d > 0) {
            let cutoff = newest - days * SECONDS_PER_DAY;
            for snapshot in store.list_snapshots(&job.id).await? {
                let expired = snapshot.timestamp.timestamp() < cutoff
                    && snapshot
                        .latest_record_time_stamp
                        .map_or(true, |t| t.timestamp() < cutoff);
                if expired && job.model_snapshot_id.as_deref() != Some(snapshot.snapshot_id.as_str()) {
                    if store.delete_snapshot(&job.id, &snapshot.snapshot_id).await? {
                        summary.snapshots += 1;
                    }
                }
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::types::{AnalysisConfig, Detector, JobConfig};
    use crate::results::epoch_to_datetime;
    use crate::results::fixtures::bucket;
    use crate::results::ModelSnapshot;
    use crate::store::{InMemoryResultStore, ResultStore};

    fn snapshot(job_id: &str, id: &str, epoch: i64) -> ModelSnapshot {
        ModelSnapshot {
            job_id: job_id.to_string(),
            snapshot_id: id.to_string(),
            timestamp: epoch_to_datetime(epoch),
            description: None,
            restore_priority: epoch,
            snapshot_doc_count: 1,
            model_size_bytes: 0,
            latest_record_time_stamp: Some(epoch_to_datetime(epoch)),
            latest_result_time_stamp: None,
            state: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn prunes_by_data_time_and_keeps_active_snapshot() -> anyhow::Result<()> {
        let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());
        let registry = Arc::new(JobRegistry::new(store.clone(), 600));
        registry
            .create(JobConfig {
                id: Some("farm".into()),
                analysis_config: AnalysisConfig {
                    bucket_span: 3_600,
                    detectors: vec![Detector::new("count")],
                    ..Default::default()
                },
                results_retention_days: Some(1),
                model_snapshot_retention_days: Some(1),
                ..Default::default()
            })
            .await?;
        let day = SECONDS_PER_DAY;
        for epoch in [0, day / 2, day * 2, day * 3] {
            store.put_bucket("farm", bucket("farm", epoch, Vec::new(), 0.0)).await?;
        }
        for (id, epoch) in [("old", 0), ("active", day / 2), ("new", day * 3)] {
            store.put_snapshot(snapshot("farm", id, epoch)).await?;
        }
        registry
            .mutate("farm", |job| {
                job.counts.latest_record_time_stamp = Some(epoch_to_datetime(day * 3));
                job.model_snapshot_id = Some("active".into());
                Ok(())
            })
            .await?;

        let service = RetentionService::new(registry, Duration::from_secs(3_600));
        let summary = service.sweep().await?;
        assert_eq!(summary, SweepSummary { buckets: 2, snapshots: 1 });

        let left: Vec<i64> = store
            .get_buckets_by_range("farm", None, None)
            .await?
            .iter()
            .map(|b| b.epoch())
            .collect();
        assert_eq!(left, vec![day * 2, day * 3]);
        let ids: Vec<String> = store
            .list_snapshots("farm")
            .await?
            .into_iter()
            .map(|s| s.snapshot_id)
            .collect();
        assert_eq!(ids, vec!["active".to_string(), "new".to_string()]);
        Ok(())
    }
}
