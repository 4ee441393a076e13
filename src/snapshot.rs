//! Model snapshot listing, editing and rollback.

use std::fmt;
use std::sync::Arc;

use serde_json::json;

use crate::error::{EngineError, Result};
use crate::job::types::IgnoreDowntime;
use crate::job::JobRegistry;
use crate::lease::{Action, WriteExclusivityGuard};
use crate::results::{epoch_to_datetime, ModelSnapshot};

/// Picks the snapshot a revert returns to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotSelector {
    Id(String),
    Description(String),
    /// The newest snapshot whose latest record is at or before this epoch.
    Time(i64),
}

impl SnapshotSelector {
    /// An id wins over a description, which wins over a time.
    pub fn from_parts(time: Option<i64>, snapshot_id: Option<String>, description: Option<String>) -> Result<Self> {
        match (snapshot_id, description, time) {
            (Some(id), _, _) => Ok(SnapshotSelector::Id(id)),
            (None, Some(description), _) => Ok(SnapshotSelector::Description(description)),
            (None, None, Some(time)) => Ok(SnapshotSelector::Time(time)),
            (None, None, None) => Err(EngineError::invalid_value(
                "Cannot revert to a model snapshot as no parameters were specified",
            )),
        }
    }

    fn pick<'a>(&self, snapshots: &'a [ModelSnapshot]) -> Option<&'a ModelSnapshot> {
        match self {
            SnapshotSelector::Id(id) => snapshots.iter().find(|s| &s.snapshot_id == id),
            SnapshotSelector::Description(description) => snapshots
                .iter()
                .rev()
                .find(|s| s.description.as_deref() == Some(description.as_str())),
            SnapshotSelector::Time(time) => {
                let cutoff = epoch_to_datetime(*time);
                snapshots
                    .iter()
                    .rev()
                    .find(|s| s.latest_record_time_stamp.is_some_and(|t| t <= cutoff))
            }
        }
    }
}

impl fmt::Display for SnapshotSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotSelector::Id(id) => write!(f, "id '{id}'"),
            SnapshotSelector::Description(description) => write!(f, "description '{description}'"),
            SnapshotSelector::Time(time) => write!(f, "time {time}"),
        }
    }
}

pub struct SnapshotManager {
    registry: Arc<JobRegistry>,
    lease: Arc<WriteExclusivityGuard>,
}

impl SnapshotManager {
    pub fn new(registry: Arc<JobRegistry>, lease: Arc<WriteExclusivityGuard>) -> Self {
        Self { registry, lease }
    }

    /// Snapshots ordered by latest record time, without their model state.
    pub async fn list(&self, job_id: &str) -> Result<Vec<ModelSnapshot>> {
        self.registry.get(job_id).await?;
        let mut snapshots = self.registry.store().list_snapshots(job_id).await?;
        snapshots.sort_by_key(|s| s.order_key());
        Ok(snapshots.iter().map(ModelSnapshot::without_state).collect())
    }

    async fn find(&self, job_id: &str, selector: &SnapshotSelector) -> Result<ModelSnapshot> {
        let mut snapshots = self.registry.store().list_snapshots(job_id).await?;
        snapshots.sort_by_key(|s| s.order_key());
        selector
            .pick(&snapshots)
            .cloned()
            .ok_or_else(|| EngineError::UnknownSnapshot {
                job_id: job_id.to_string(),
                selector: selector.to_string(),
            })
    }

    /// Points the job at an earlier snapshot. The next worker start restores
    /// it. With `delete_intervening_results` every result after the
    /// snapshot's last result is deleted and the job's record watermark moves
    /// back, so the same data can be fed again.
    pub async fn revert(
        &self,
        job_id: &str,
        selector: SnapshotSelector,
        delete_intervening_results: bool,
    ) -> Result<ModelSnapshot> {
        self.registry.get(job_id).await?;
        let snapshot = self.find(job_id, &selector).await?;
        let ticket = self.lease.acquire(job_id, Action::Reverting).await?;
        let outcome = self
            .apply_revert(job_id, &snapshot, delete_intervening_results)
            .await;
        if let Err(err) = self.lease.release(&ticket).await {
            tracing::warn!(job_id, error = %err, "failed to release lease after revert");
        }
        let deleted = outcome?;

        tracing::info!(
            job_id,
            snapshot_id = %snapshot.snapshot_id,
            delete_intervening_results,
            deleted,
            "reverted to model snapshot"
        );
        self.registry
            .record_event(
                job_id,
                "reverted",
                json!({
                    "snapshot_id": snapshot.snapshot_id,
                    "description": snapshot.description,
                    "deleted_buckets": deleted,
                }),
            )
            .await;
        Ok(snapshot.without_state())
    }

    async fn apply_revert(&self, job_id: &str, snapshot: &ModelSnapshot, delete_results: bool) -> Result<u64> {
        let mut deleted = 0;
        if delete_results {
            let after = snapshot
                .latest_result_time_stamp
                .map_or(i64::MIN, |t| t.timestamp());
            let store = self.registry.store();
            deleted = store.delete_results_after(job_id, after).await?;
            store.delete_interim_results(job_id).await?;
        }
        self.registry
            .mutate(job_id, |job| {
                job.model_snapshot_id = Some(snapshot.snapshot_id.clone());
                if delete_results {
                    job.ignore_downtime = Some(IgnoreDowntime::Never);
                    job.counts.latest_record_time_stamp = snapshot.latest_record_time_stamp;
                    job.last_data_time = snapshot.latest_record_time_stamp;
                } else {
                    job.ignore_downtime = Some(IgnoreDowntime::Once);
                }
                Ok(())
            })
            .await?;
        Ok(deleted)
    }

    /// Descriptions stay unique per job.
    pub async fn update_description(
        &self,
        job_id: &str,
        snapshot_id: &str,
        description: &str,
    ) -> Result<ModelSnapshot> {
        self.registry.get(job_id).await?;
        let snapshots = self.registry.store().list_snapshots(job_id).await?;
        let Some(snapshot) = snapshots.iter().find(|s| s.snapshot_id == snapshot_id) else {
            return Err(EngineError::UnknownSnapshot {
                job_id: job_id.to_string(),
                selector: format!("id '{snapshot_id}'"),
            });
        };
        let clash = snapshots.iter().any(|s| {
            s.snapshot_id != snapshot_id && s.description.as_deref() == Some(description)
        });
        if clash {
            return Err(EngineError::invalid_value(format!(
                "Model snapshot with description '{description}' already exists for job '{job_id}'"
            )));
        }
        let mut updated = snapshot.clone();
        updated.description = Some(description.to_string());
        self.registry.store().put_snapshot(updated.clone()).await?;
        tracing::info!(job_id, snapshot_id, description, "updated model snapshot description");
        Ok(updated.without_state())
    }

    /// Deletes a snapshot other than the job's active one.
    pub async fn delete(&self, job_id: &str, snapshot_id: &str) -> Result<bool> {
        let job = self.registry.get(job_id).await?;
        if job.model_snapshot_id.as_deref() == Some(snapshot_id) {
            return Err(EngineError::invalid_value(format!(
                "Model snapshot '{snapshot_id}' is the active snapshot for job '{job_id}', so cannot be deleted"
            )));
        }
        if !self.registry.store().delete_snapshot(job_id, snapshot_id).await? {
            return Err(EngineError::UnknownSnapshot {
                job_id: job_id.to_string(),
                selector: format!("id '{snapshot_id}'"),
            });
        }
        tracing::info!(job_id, snapshot_id, "deleted model snapshot");
        Ok(true)
    }
}
