//! Writes model output to the result store.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::ModelOutput;
use crate::error::Result;
use crate::normalizer;
use crate::results::Bucket;
use crate::store::ResultStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PersistSummary {
    pub final_buckets: u64,
    pub interim_buckets: u64,
    pub snapshots: u64,
    pub rescaled: u64,
}

pub struct ResultsPersister {
    job_id: String,
    store: Arc<dyn ResultStore>,
    renormalization_window_days: Option<i64>,
}

impl ResultsPersister {
    pub fn new(
        job_id: &str,
        store: Arc<dyn ResultStore>,
        renormalization_window_days: Option<i64>,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            store,
            renormalization_window_days,
        }
    }

    /// Persists final buckets, then renormalizes, then replaces the interim
    /// set. Stored interim buckets are dropped before a new interim set lands,
    /// so a bucket that has become final is never shadowed by a stale one.
    pub async fn persist(
        &self,
        output: ModelOutput,
        notify: &broadcast::Sender<Bucket>,
    ) -> Result<PersistSummary> {
        let mut summary = PersistSummary::default();

        if output.interim.is_some() {
            self.store.delete_interim_results(&self.job_id).await?;
        }

        for bucket in output.buckets {
            let _ = notify.send(bucket.clone());
            self.store.put_bucket(&self.job_id, bucket).await?;
            summary.final_buckets += 1;
        }

        if let Some(ceiling) = output.ceiling {
            summary.rescaled = normalizer::renormalize(
                self.store.as_ref(),
                &self.job_id,
                ceiling,
                self.renormalization_window_days,
            )
            .await? as u64;
        }

        for bucket in output.interim.unwrap_or_default() {
            let _ = notify.send(bucket.clone());
            self.store.put_bucket(&self.job_id, bucket).await?;
            summary.interim_buckets += 1;
        }

        for snapshot in output.snapshots {
            tracing::info!(
                snapshot_id = %snapshot.snapshot_id,
                latest_record_time = ?snapshot.latest_record_time_stamp,
                "persisted model snapshot"
            );
            self.store.put_snapshot(snapshot).await?;
            summary.snapshots += 1;
        }

        if summary.final_buckets > 0 || summary.interim_buckets > 0 {
            tracing::debug!(
                final_buckets = summary.final_buckets,
                interim_buckets = summary.interim_buckets,
                rescaled = summary.rescaled,
                "persisted results"
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::fixtures::{bucket, record};
    use crate::store::InMemoryResultStore;

    #[tokio::test]
    async fn interim_set_is_replaced_and_final_bucket_wins() -> anyhow::Result<()> {
        let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());
        let persister = ResultsPersister::new("farm", store.clone(), None);
        let (tx, mut rx) = broadcast::channel(16);

        let mut interim = bucket("farm", 300, vec![record("farm", 300, "aal", 10.0)], 1.0);
        interim.is_interim = true;
        interim.records[0].is_interim = true;
        let mut stale = interim.clone();
        stale.timestamp = crate::results::epoch_to_datetime(600);
        persister
            .persist(
                ModelOutput {
                    interim: Some(vec![interim, stale]),
                    ..Default::default()
                },
                &tx,
            )
            .await?;
        assert_eq!(store.get_buckets_by_range("farm", None, None).await?.len(), 2);

        let summary = persister
            .persist(
                ModelOutput {
                    buckets: vec![bucket("farm", 300, vec![record("farm", 300, "aal", 20.0)], 4.0)],
                    interim: Some(Vec::new()),
                    ..Default::default()
                },
                &tx,
            )
            .await?;
        assert_eq!(summary.final_buckets, 1);

        let stored = store.get_buckets_by_range("farm", None, None).await?;
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].is_interim);
        assert_eq!(stored[0].max_normalized_probability, 20.0);

        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 3);
        Ok(())
    }
}
