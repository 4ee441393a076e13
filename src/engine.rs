//! One API node: every component wired around a shared store and lease
//! backend.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::alerts::{Alert, AlertRequest, AlertWatcher};
use crate::config::{EngineConfig, LeaseBackendKind};
use crate::error::{EngineError, Result};
use crate::ingest::{IngestionPipeline, MultiUploadOutcome, UploadOptions};
use crate::job::types::{DataCounts, Job, JobConfig, JobStatus, SchedulerState};
use crate::job::JobRegistry;
use crate::lease::{Action, FileLeaseBackend, InMemoryLeaseBackend, LeaseBackend, WriteExclusivityGuard};
use crate::results::query::{BucketQuery, InfluencerQuery, QueryPage, RecordQuery};
use crate::results::{AnomalyRecord, AuditEvent, Bucket, Influencer, ModelSnapshot};
use crate::retention::RetentionService;
use crate::scheduler::{ExtractorFactory, SchedulerController, SourceExtractorFactory};
use crate::snapshot::{SnapshotManager, SnapshotSelector};
use crate::store::ResultStore;
use crate::validation::ConfigValidator;
use crate::worker::{FlushAck, FlushParams, LocalModelFactory, ModelFactory};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3_600);

pub fn lease_backend_for(config: &EngineConfig) -> Arc<dyn LeaseBackend> {
    match config.lease_backend {
        LeaseBackendKind::Memory => Arc::new(InMemoryLeaseBackend::new()),
        LeaseBackendKind::File => Arc::new(FileLeaseBackend::new(config.lease_dir.clone())),
    }
}

pub struct Engine {
    config: EngineConfig,
    registry: Arc<JobRegistry>,
    lease: Arc<WriteExclusivityGuard>,
    pipeline: Arc<IngestionPipeline>,
    scheduler: Arc<SchedulerController>,
    snapshots: SnapshotManager,
    alerts: AlertWatcher,
    cancel: CancellationToken,
}

impl Engine {
    /// A node running the local analytics model and the configured data
    /// sources.
    pub fn new(config: EngineConfig, store: Arc<dyn ResultStore>, leases: Arc<dyn LeaseBackend>) -> Self {
        Self::with_components(
            config,
            store,
            leases,
            Arc::new(LocalModelFactory),
            Arc::new(SourceExtractorFactory::default()),
        )
    }

    pub fn with_components(
        config: EngineConfig,
        store: Arc<dyn ResultStore>,
        leases: Arc<dyn LeaseBackend>,
        models: Arc<dyn ModelFactory>,
        extractors: Arc<dyn ExtractorFactory>,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new(store, config.default_idle_timeout_secs));
        let lease = Arc::new(WriteExclusivityGuard::new(config.node_id.clone(), leases));
        let pipeline = Arc::new(IngestionPipeline::new(
            registry.clone(),
            lease.clone(),
            models,
            config.max_running_jobs,
            config.worker_queue_depth,
        ));
        let scheduler = Arc::new(SchedulerController::new(
            registry.clone(),
            pipeline.clone(),
            lease.clone(),
            extractors,
            config.scheduler_empty_warn_count,
        ));
        let snapshots = SnapshotManager::new(registry.clone(), lease.clone());
        let alerts = AlertWatcher::new(registry.clone(), pipeline.clone(), config.alert_max_timeout());
        Self {
            config,
            registry,
            lease,
            pipeline,
            scheduler,
            snapshots,
            alerts,
            cancel: CancellationToken::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        self.lease.node_id()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<IngestionPipeline> {
        &self.pipeline
    }

    pub fn scheduler(&self) -> &Arc<SchedulerController> {
        &self.scheduler
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    /// Starts the node's background services.
    pub fn start(&self) {
        RetentionService::new(self.registry.clone(), RETENTION_SWEEP_INTERVAL).start(self.cancel.clone());
    }

    pub async fn create_job(&self, config: JobConfig) -> Result<Job> {
        self.registry.create(config).await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        self.registry.get(job_id).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.registry.list().await
    }

    pub async fn update_job(&self, job_id: &str, payload: &Value) -> Result<Job> {
        self.registry.update(job_id, payload).await
    }

    pub async fn events(&self, job_id: &str, after: u64, limit: usize) -> Result<Vec<AuditEvent>> {
        self.registry.get(job_id).await?;
        self.registry.events(job_id, after, limit).await
    }

    pub async fn upload<S>(&self, job_id: &str, stream: S, options: UploadOptions) -> Result<DataCounts>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.pipeline.upload(job_id, stream, options).await
    }

    pub async fn upload_bytes(&self, job_id: &str, body: Bytes) -> Result<DataCounts> {
        self.pipeline.upload_bytes(job_id, body).await
    }

    pub async fn upload_many(&self, job_ids: &[String], body: Bytes) -> MultiUploadOutcome {
        self.pipeline.upload_many(job_ids, body).await
    }

    pub async fn flush(&self, job_id: &str, params: FlushParams) -> Result<FlushAck> {
        self.pipeline.flush(job_id, params).await
    }

    pub async fn close(&self, job_id: &str) -> Result<bool> {
        self.pipeline.close(job_id).await
    }

    pub async fn start_scheduler(&self, job_id: &str, start: Option<i64>, end: Option<i64>) -> Result<bool> {
        self.scheduler.start(job_id, start, end).await
    }

    pub async fn stop_scheduler(&self, job_id: &str) -> Result<bool> {
        self.scheduler.stop(job_id).await
    }

    pub async fn scheduler_status(&self, job_id: &str) -> Result<SchedulerState> {
        self.scheduler.status(job_id).await
    }

    pub async fn buckets(&self, job_id: &str, query: &BucketQuery) -> Result<QueryPage<Bucket>> {
        let buckets = self.stored_buckets(job_id, query.start, query.end).await?;
        Ok(query.apply(buckets))
    }

    /// The bucket starting at `epoch`, with its records when `expand` is set.
    pub async fn bucket(&self, job_id: &str, epoch: i64, expand: bool) -> Result<Option<Bucket>> {
        let buckets = self
            .stored_buckets(job_id, Some(epoch), epoch.checked_add(1))
            .await?;
        Ok(buckets
            .into_iter()
            .find(|b| b.epoch() == epoch)
            .map(|b| if expand { b } else { b.without_records() }))
    }

    pub async fn records(&self, job_id: &str, query: &RecordQuery) -> Result<QueryPage<AnomalyRecord>> {
        let buckets = self.stored_buckets(job_id, query.start, query.end).await?;
        Ok(query.apply(buckets))
    }

    pub async fn influencers(&self, job_id: &str, query: &InfluencerQuery) -> Result<QueryPage<Influencer>> {
        let buckets = self.stored_buckets(job_id, query.start, query.end).await?;
        Ok(query.apply(buckets))
    }

    async fn stored_buckets(&self, job_id: &str, start: Option<i64>, end: Option<i64>) -> Result<Vec<Bucket>> {
        self.registry.get(job_id).await?;
        self.registry
            .store()
            .get_buckets_by_range(job_id, start, end)
            .await
    }

    pub async fn list_snapshots(&self, job_id: &str) -> Result<Vec<ModelSnapshot>> {
        self.snapshots.list(job_id).await
    }

    pub async fn revert_snapshot(
        &self,
        job_id: &str,
        selector: SnapshotSelector,
        delete_intervening_results: bool,
    ) -> Result<ModelSnapshot> {
        self.snapshots
            .revert(job_id, selector, delete_intervening_results)
            .await
    }

    pub async fn update_snapshot_description(
        &self,
        job_id: &str,
        snapshot_id: &str,
        description: &str,
    ) -> Result<ModelSnapshot> {
        self.snapshots
            .update_description(job_id, snapshot_id, description)
            .await
    }

    pub async fn delete_snapshot(&self, job_id: &str, snapshot_id: &str) -> Result<bool> {
        self.snapshots.delete(job_id, snapshot_id).await
    }

    pub async fn wait_for_alert(&self, job_id: &str, request: AlertRequest) -> Result<Alert> {
        self.alerts.wait_for_alert(job_id, request).await
    }

    /// Deletes the job with all of its results. A session this node holds is
    /// closed first; a job held elsewhere is refused.
    pub async fn delete_job(&self, job_id: &str) -> Result<bool> {
        let job = self.registry.get(job_id).await?;
        if let Some(state) = job.scheduler_state() {
            if state != SchedulerState::Stopped {
                return Err(EngineError::CannotDeleteScheduledJob {
                    job_id: job_id.to_string(),
                    scheduler_state: state.as_str().to_string(),
                });
            }
        }
        if self.pipeline.close_if_open(job_id).await? {
            tracing::info!(job_id, "closed job before deletion");
        }

        let ticket = self.lease.acquire(job_id, Action::Deleting).await?;
        let outcome = self.remove_job(job_id).await;
        if let Err(err) = self.lease.release(&ticket).await {
            tracing::warn!(job_id, error = %err, "failed to release lease after delete");
        }
        if let Err(err) = &outcome {
            tracing::error!(job_id, error = %err, "job deletion failed");
            if let Err(restore_err) = self.registry.transition(job_id, JobStatus::Closed).await {
                tracing::warn!(job_id, error = %restore_err, "failed to restore job status");
            }
        }
        outcome
    }

    async fn remove_job(&self, job_id: &str) -> Result<bool> {
        let job = self.registry.get(job_id).await?;
        self.pipeline.settle_orphaned(job_id, job.status).await?;
        self.registry.transition(job_id, JobStatus::Deleting).await?;
        self.registry.store().delete_all_results(job_id).await?;
        let removed = self.registry.remove(job_id).await?;
        tracing::info!(job_id, node_id = %self.node_id(), "job deleted");
        Ok(removed)
    }

    /// Creates a job for every `*.json` config in `dir` whose id is not
    /// already taken. Unreadable or invalid files are logged and skipped.
    pub async fn load_jobs(&self, dir: &Path) -> anyhow::Result<usize> {
        if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
            tracing::info!(dir = %dir.display(), "no jobs directory; nothing to load");
            return Ok(0);
        }
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let config = match read_job_config(&path).await {
                Ok(config) => config,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping job config");
                    continue;
                }
            };
            if let Some(id) = &config.id {
                if self.registry.exists(id).await? {
                    tracing::debug!(job_id = %id, "job already exists");
                    continue;
                }
            }
            match self.registry.create(config).await {
                Ok(job) => {
                    tracing::info!(job_id = %job.id, path = %path.display(), "loaded job");
                    loaded += 1;
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to create job");
                }
            }
        }
        Ok(loaded)
    }

    /// Starts the scheduler of every scheduled job that is not running on
    /// another node.
    pub async fn start_schedulers(&self) -> Result<usize> {
        let mut started = 0;
        for job in self.registry.list().await? {
            if !job.is_scheduled() || self.scheduler.is_running(&job.id) {
                continue;
            }
            match self.scheduler.start(&job.id, None, None).await {
                Ok(_) => started += 1,
                Err(err) if err.is_job_in_use() => {
                    tracing::info!(job_id = %job.id, "scheduler runs on another node");
                }
                Err(err) => {
                    tracing::warn!(job_id = %job.id, error = %err, "failed to start scheduler");
                }
            }
        }
        Ok(started)
    }

    /// Stops schedulers and closes sessions run by this node, then releases
    /// any lease it still holds.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let schedulers = self.scheduler.shutdown().await;
        let sessions = self.pipeline.shutdown().await;
        let leases = self.lease.release_all().await?;
        tracing::info!(
            node_id = %self.node_id(),
            schedulers,
            sessions,
            leases,
            "engine shut down"
        );
        Ok(())
    }
}

async fn read_job_config(path: &Path) -> anyhow::Result<JobConfig> {
    use anyhow::Context;
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: JobConfig =
        serde_json::from_str(&text).with_context(|| format!("invalid job config in {}", path.display()))?;
    ConfigValidator.validate(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::job::types::{AnalysisConfig, DataDescription, Detector};
    use crate::store::InMemoryResultStore;

    fn engine(store: Arc<dyn ResultStore>, leases: Arc<dyn LeaseBackend>, node_id: &str) -> Engine {
        let config = EngineConfig {
            node_id: node_id.to_string(),
            ..Default::default()
        };
        Engine::new(config, store, leases)
    }

    fn job(id: &str) -> JobConfig {
        JobConfig {
            id: Some(id.to_string()),
            analysis_config: AnalysisConfig {
                bucket_span: 100,
                detectors: vec![Detector::new("count").with_by("host")],
                ..Default::default()
            },
            data_description: Some(DataDescription {
                field_delimiter: ',',
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn delete_closes_local_session_and_refuses_remote() -> anyhow::Result<()> {
        let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());
        let leases: Arc<dyn LeaseBackend> = Arc::new(InMemoryLeaseBackend::new());
        let a = engine(store.clone(), leases.clone(), "node-a");
        let b = engine(store, leases, "node-b");
        a.create_job(job("farm")).await?;
        a.upload_bytes("farm", Bytes::from("time,host\n10,a\n150,b\n")).await?;

        let err = b.delete_job("farm").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NativeProcessConcurrentUse);
        assert!(a.get_job("farm").await.is_ok());

        assert!(a.delete_job("farm").await?);
        let err = b.get_job("farm").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingJobError);
        let err = a.buckets("farm", &BucketQuery::default()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingJobError);
        a.create_job(job("farm")).await?;
        assert!(a.buckets("farm", &BucketQuery::default()).await?.documents.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn delete_settles_a_status_left_running_by_a_lost_worker() -> anyhow::Result<()> {
        let e = engine(
            Arc::new(InMemoryResultStore::new()),
            Arc::new(InMemoryLeaseBackend::new()),
            "node-a",
        );
        e.create_job(job("farm")).await?;
        e.registry()
            .mutate("farm", |job| {
                job.status = JobStatus::Running;
                Ok(())
            })
            .await?;

        assert!(e.delete_job("farm").await?);
        let err = e.get_job("farm").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingJobError);
        Ok(())
    }

    #[tokio::test]
    async fn deleted_job_leaves_no_audit_events_behind() -> anyhow::Result<()> {
        let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());
        let e = engine(store.clone(), Arc::new(InMemoryLeaseBackend::new()), "node-a");
        e.create_job(job("farm")).await?;
        assert!(!store.list_events("farm", 0, 10).await?.is_empty());

        e.delete_job("farm").await?;
        assert!(store.list_events("farm", 0, 10).await?.is_empty());

        e.create_job(job("farm")).await?;
        let kinds: Vec<String> = e.events("farm", 0, 10).await?.into_iter().map(|ev| ev.kind).collect();
        assert_eq!(kinds, vec!["created".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn bucket_lookup_by_epoch() -> anyhow::Result<()> {
        let e = engine(
            Arc::new(InMemoryResultStore::new()),
            Arc::new(InMemoryLeaseBackend::new()),
            "node-a",
        );
        e.create_job(job("farm")).await?;
        e.upload_bytes("farm", Bytes::from("time,host\n10,a\n20,b\n110,a\n")).await?;
        e.close("farm").await?;

        let bucket = e.bucket("farm", 0, true).await?;
        assert!(bucket.as_ref().is_some_and(|b| b.event_count == 2 && !b.records.is_empty()));
        let bare = e.bucket("farm", 0, false).await?;
        assert!(bare.is_some_and(|b| b.records.is_empty() && b.record_count > 0));
        assert!(e.bucket("farm", 50, true).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn jobs_load_from_directory_once() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join("farm.json"),
            r#"{"id": "farm", "analysisConfig": {"bucketSpan": 300, "detectors": [{"function": "count"}]}}"#,
        )?;
        std::fs::write(dir.path().join("broken.json"), "{not json")?;
        std::fs::write(
            dir.path().join("invalid.json"),
            r#"{"id": "Bad Id", "analysisConfig": {"detectors": [{"function": "count"}]}}"#,
        )?;
        std::fs::write(dir.path().join("notes.txt"), "ignored")?;

        let e = engine(
            Arc::new(InMemoryResultStore::new()),
            Arc::new(InMemoryLeaseBackend::new()),
            "node-a",
        );
        assert_eq!(e.load_jobs(dir.path()).await?, 1);
        assert_eq!(e.load_jobs(dir.path()).await?, 0);
        assert_eq!(e.get_job("farm").await?.bucket_span(), 300);
        assert_eq!(e.load_jobs(&dir.path().join("missing")).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_releases_every_lease() -> anyhow::Result<()> {
        let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());
        let leases: Arc<dyn LeaseBackend> = Arc::new(InMemoryLeaseBackend::new());
        let a = engine(store.clone(), leases.clone(), "node-a");
        let b = engine(store, leases, "node-b");
        a.create_job(job("farm")).await?;
        a.upload_bytes("farm", Bytes::from("time,host\n10,a\n")).await?;

        a.shutdown().await?;
        assert_eq!(a.get_job("farm").await?.status, JobStatus::Closed);
        b.upload_bytes("farm", Bytes::from("time,host\n20,a\n")).await?;
        b.close("farm").await?;
        Ok(())
    }
}
