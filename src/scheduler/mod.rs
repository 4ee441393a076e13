//! Continuous pull scheduler for jobs with a `schedulerConfig`.
//!
//! A started scheduler owns the job's writer session. Its loop extracts the
//! window after the watermark on every tick, uploads it, and only then moves
//! the watermark, so a failed poll is retried over the same window.

pub mod extractor;

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{poison_err, EngineError, Result};
use crate::ingest::{IngestionPipeline, SessionOrigin, UploadOptions};
use crate::job::types::{Job, SchedulerState};
use crate::job::JobRegistry;
use crate::lease::{Action, WriteExclusivityGuard};
use crate::worker::FlushParams;

pub use extractor::{
    DataExtractor, ElasticsearchExtractor, ExtractorFactory, FileExtractor, InMemoryExtractor,
    SourceExtractorFactory, TimeField,
};

struct Run {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// What one scheduler run covers.
#[derive(Debug, Clone, Copy)]
struct RunPlan {
    start: i64,
    end: Option<i64>,
    query_delay: i64,
    frequency: Duration,
    latest_record: Option<i64>,
}

impl RunPlan {
    fn new(job: &Job, start: Option<i64>, end: Option<i64>) -> Result<Self> {
        let Some(config) = &job.scheduler_config else {
            return Err(EngineError::NoSuchScheduledJob {
                job_id: job.id.clone(),
            });
        };
        let latest_record = job.counts.latest_record_time_stamp.map(|t| t.timestamp());
        let watermark = latest_record.map(|t| t + 1);
        let start = match (start, watermark) {
            (Some(start), Some(watermark)) => start.max(watermark),
            (start, watermark) => start.or(watermark).unwrap_or(0),
        };
        let frequency = config.frequency_secs(job.bucket_span()).max(1);
        Ok(Self {
            start,
            end,
            query_delay: config.query_delay_secs(),
            frequency: Duration::from_secs(frequency as u64),
            latest_record,
        })
    }

    fn window_end(&self) -> i64 {
        self.end
            .unwrap_or_else(|| Utc::now().timestamp() - self.query_delay)
    }
}

pub struct SchedulerController {
    registry: Arc<JobRegistry>,
    pipeline: Arc<IngestionPipeline>,
    lease: Arc<WriteExclusivityGuard>,
    extractors: Arc<dyn ExtractorFactory>,
    empty_warn_count: u32,
    runs: Mutex<HashMap<String, Run>>,
    /// Signalled whenever a run leaves `runs`.
    run_ended: Notify,
}

impl SchedulerController {
    pub fn new(
        registry: Arc<JobRegistry>,
        pipeline: Arc<IngestionPipeline>,
        lease: Arc<WriteExclusivityGuard>,
        extractors: Arc<dyn ExtractorFactory>,
        empty_warn_count: u32,
    ) -> Self {
        Self {
            registry,
            pipeline,
            lease,
            extractors,
            empty_warn_count: empty_warn_count.max(1),
            runs: Mutex::new(HashMap::new()),
            run_ended: Notify::new(),
        }
    }

    pub async fn status(&self, job_id: &str) -> Result<SchedulerState> {
        let job = self.registry.get(job_id).await?;
        job.scheduler_state()
            .ok_or_else(|| EngineError::NoSuchScheduledJob {
                job_id: job_id.to_string(),
            })
    }

    /// Whether this node runs the job's scheduler loop.
    pub fn is_running(&self, job_id: &str) -> bool {
        self.runs
            .lock()
            .map(|runs| runs.contains_key(job_id))
            .unwrap_or(false)
    }

    /// Starts pulling data for the job. With `end` the run covers
    /// `[start, end)` and stops on its own; otherwise it keeps polling until
    /// stopped.
    pub async fn start(self: &Arc<Self>, job_id: &str, start: Option<i64>, end: Option<i64>) -> Result<bool> {
        let job = self.registry.get(job_id).await?;
        let state = job.scheduler_state().ok_or_else(|| EngineError::NoSuchScheduledJob {
            job_id: job_id.to_string(),
        })?;
        if let (Some(start), Some(end)) = (start, end) {
            if end <= start {
                return Err(EngineError::invalid_value(format!(
                    "Invalid time range: end ({end}) must be after start ({start})"
                )));
            }
        }

        let cancel = CancellationToken::new();
        {
            let mut runs = self.runs.lock().map_err(poison_err)?;
            if runs.contains_key(job_id) {
                return Err(self.lease.in_use(job_id, Action::Scheduling, None));
            }
            runs.insert(
                job_id.to_string(),
                Run {
                    cancel: cancel.clone(),
                    task: None,
                },
            );
        }

        match self.launch(&job, state, start, end, cancel).await {
            Ok(task) => {
                if let Some(run) = self.runs.lock().map_err(poison_err)?.get_mut(job_id) {
                    run.task = Some(task);
                }
                Ok(true)
            }
            Err(err) => {
                self.runs.lock().map_err(poison_err)?.remove(job_id);
                self.run_ended.notify_waiters();
                Err(err)
            }
        }
    }

    async fn launch(
        self: &Arc<Self>,
        job: &Job,
        state: SchedulerState,
        start: Option<i64>,
        end: Option<i64>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let job_id = job.id.as_str();
        if state != SchedulerState::Stopped {
            self.lease
                .ensure_not_held_elsewhere(job_id, Action::Scheduling)
                .await?;
            self.repair_stale_state(job_id, state).await?;
        }
        let extractor = self.extractors.create(job)?;
        self.pipeline.open_for_scheduler(job_id).await?;

        let started = async {
            self.registry
                .set_scheduler_state(job_id, SchedulerState::Starting)
                .await?;
            // The session may have replayed a revert; plan from the fresh document.
            let job = self.registry.get(job_id).await?;
            let plan = RunPlan::new(&job, start, end)?;
            self.registry
                .set_scheduler_state(job_id, SchedulerState::Started)
                .await?;
            Ok::<_, EngineError>(plan)
        }
        .await;
        let plan = match started {
            Ok(plan) => plan,
            Err(err) => {
                tracing::error!(job_id, error = %err, "scheduler failed to start");
                self.finish(job_id).await;
                return Err(err);
            }
        };

        tracing::info!(
            job_id,
            start = plan.start,
            end = ?plan.end,
            frequency_secs = plan.frequency.as_secs(),
            "scheduler started"
        );
        self.registry
            .record_event(
                job_id,
                "scheduler_started",
                json!({ "start": plan.start, "end": plan.end, "node_id": self.lease.node_id() }),
            )
            .await;

        let controller = self.clone();
        let job_id = job_id.to_string();
        let span = tracing::info_span!("scheduler", job_id = %job_id);
        Ok(tokio::spawn(
            async move {
                controller.run(&job_id, extractor, plan, cancel).await;
                controller.finish(&job_id).await;
            }
            .instrument(span),
        ))
    }

    /// Brings a scheduler state left behind by a node that died back to
    /// STOPPED.
    async fn repair_stale_state(&self, job_id: &str, state: SchedulerState) -> Result<()> {
        tracing::warn!(job_id, state = state.as_str(), "resetting stale scheduler state");
        if state == SchedulerState::Started {
            self.registry
                .set_scheduler_state(job_id, SchedulerState::Stopping)
                .await?;
        }
        self.registry
            .set_scheduler_state(job_id, SchedulerState::Stopped)
            .await?;
        Ok(())
    }

    async fn run(
        &self,
        job_id: &str,
        extractor: Arc<dyn DataExtractor>,
        plan: RunPlan,
        cancel: CancellationToken,
    ) {
        let mut watermark = plan.start;
        let mut latest_record = plan.latest_record;
        let mut empty_polls = 0u32;
        let mut ticker = tokio::time::interval(plan.frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let window_end = plan.window_end();
            if window_end <= watermark && plan.end.is_some() {
                break;
            }

            let body = if window_end <= watermark {
                Ok(Bytes::new())
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    body = extractor.extract(watermark, window_end) => body,
                }
            };
            let body = match body {
                Ok(body) => body,
                Err(err) => {
                    tracing::warn!(start = watermark, end = window_end, error = %err, "extraction failed; will retry");
                    continue;
                }
            };

            if body.is_empty() {
                empty_polls += 1;
                tracing::debug!(start = watermark, end = window_end, empty_polls, "no new data");
                if empty_polls == self.empty_warn_count {
                    tracing::warn!(empty_polls, "scheduler has seen no data");
                    self.registry
                        .record_event(
                            job_id,
                            "scheduler_no_data",
                            json!({ "empty_polls": empty_polls, "since": watermark }),
                        )
                        .await;
                }
            } else {
                let stream = futures::stream::iter([Ok::<_, io::Error>(body)]);
                let counts = match self
                    .pipeline
                    .upload_from(job_id, SessionOrigin::Scheduler, stream, UploadOptions::default())
                    .await
                {
                    Ok(counts) => counts,
                    Err(err) => {
                        tracing::warn!(start = watermark, end = window_end, error = %err, "upload failed");
                        if !self.pipeline.is_running(job_id) {
                            break;
                        }
                        continue;
                    }
                };
                empty_polls = 0;
                if let Some(latest) = counts.latest_record_time_stamp {
                    latest_record = Some(latest_record.map_or(latest.timestamp(), |t| t.max(latest.timestamp())));
                }
                tracing::debug!(
                    start = watermark,
                    end = window_end,
                    records = counts.input_record_count,
                    "polled data"
                );
            }

            // Finalize only as far as the data reaches, so a quiet source does
            // not produce a run of empty buckets up to the wall clock.
            if plan.end.is_none() {
                if let Some(latest) = latest_record {
                    let params = FlushParams {
                        calc_interim: true,
                        advance_time: Some((latest + 1).min(window_end)),
                        ..Default::default()
                    };
                    if let Err(err) = self.pipeline.flush(job_id, params).await {
                        tracing::warn!(error = %err, "interim flush failed");
                    }
                }
            }

            watermark = watermark.max(window_end);
            if plan.end.is_some_and(|end| watermark >= end) {
                tracing::info!(watermark, "lookback complete");
                break;
            }
        }
    }

    /// Closes the run's session and moves the scheduler to STOPPED.
    async fn finish(&self, job_id: &str) {
        if let Err(err) = self
            .registry
            .set_scheduler_state(job_id, SchedulerState::Stopping)
            .await
        {
            tracing::debug!(job_id, error = %err, "scheduler was not started");
        }
        if let Err(err) = self
            .pipeline
            .close_as(job_id, SessionOrigin::Scheduler)
            .await
        {
            tracing::error!(job_id, error = %err, "failed to close scheduled job");
        }
        if let Err(err) = self
            .registry
            .set_scheduler_state(job_id, SchedulerState::Stopped)
            .await
        {
            tracing::error!(job_id, error = %err, "failed to mark scheduler stopped");
        }
        tracing::info!(job_id, "scheduler stopped");
        self.registry
            .record_event(job_id, "scheduler_stopped", json!({ "node_id": self.lease.node_id() }))
            .await;
        if let Ok(mut runs) = self.runs.lock() {
            runs.remove(job_id);
        }
        self.run_ended.notify_waiters();
    }

    /// Stops the scheduler, cancelling any in-flight extraction, and closes
    /// the job. Stopping a stopped scheduler succeeds.
    pub async fn stop(&self, job_id: &str) -> Result<bool> {
        let job = self.registry.get(job_id).await?;
        let state = job.scheduler_state().ok_or_else(|| EngineError::NoSuchScheduledJob {
            job_id: job_id.to_string(),
        })?;

        let task = {
            let mut runs = self.runs.lock().map_err(poison_err)?;
            match runs.get_mut(job_id) {
                Some(run) => {
                    run.cancel.cancel();
                    Some(run.task.take())
                }
                None => None,
            }
        };
        match task {
            Some(Some(task)) => {
                if let Err(err) = task.await {
                    tracing::error!(job_id, error = %err, "scheduler task panicked");
                    self.finish(job_id).await;
                }
            }
            Some(None) => {
                // Another caller is already waiting on the run.
                loop {
                    let mut ended = std::pin::pin!(self.run_ended.notified());
                    ended.as_mut().enable();
                    if !self.is_running(job_id) {
                        break;
                    }
                    ended.await;
                }
            }
            None if state == SchedulerState::Stopped => {}
            None => {
                self.lease
                    .ensure_not_held_elsewhere(job_id, Action::Scheduling)
                    .await?;
                self.repair_stale_state(job_id, state).await?;
            }
        }
        Ok(true)
    }

    /// Stops every scheduler running on this node.
    pub async fn shutdown(&self) -> usize {
        let jobs: Vec<String> = self
            .runs
            .lock()
            .map(|runs| runs.keys().cloned().collect())
            .unwrap_or_default();
        let mut stopped = 0;
        for job_id in jobs {
            match self.stop(&job_id).await {
                Ok(_) => stopped += 1,
                Err(err) => tracing::warn!(job_id, error = %err, "failed to stop scheduler"),
            }
        }
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::error::ErrorCode;
    use crate::job::types::{
        AnalysisConfig, DataDescription, DataFormat, Detector, JobConfig, JobStatus, SchedulerConfig,
    };
    use crate::lease::{InMemoryLeaseBackend, LeaseBackend};
    use crate::store::{InMemoryResultStore, ResultStore};
    use crate::worker::LocalModelFactory;

    struct Node {
        registry: Arc<JobRegistry>,
        scheduler: Arc<SchedulerController>,
    }

    fn node(
        store: Arc<dyn ResultStore>,
        leases: Arc<dyn LeaseBackend>,
        name: &str,
        extractor: Arc<dyn DataExtractor>,
    ) -> Node {
        let registry = Arc::new(JobRegistry::new(store, 600));
        let lease = Arc::new(WriteExclusivityGuard::new(name, leases));
        let pipeline = Arc::new(IngestionPipeline::new(
            registry.clone(),
            lease.clone(),
            Arc::new(LocalModelFactory),
            4,
            8,
        ));
        let factory = move |_: &Job| -> Result<Arc<dyn DataExtractor>> { Ok(extractor.clone()) };
        let scheduler = Arc::new(SchedulerController::new(
            registry.clone(),
            pipeline,
            lease,
            Arc::new(factory),
            3,
        ));
        Node { registry, scheduler }
    }

    fn single(extractor: Arc<dyn DataExtractor>) -> Node {
        node(
            Arc::new(InMemoryResultStore::new()),
            Arc::new(InMemoryLeaseBackend::new()),
            "node-a",
            extractor,
        )
    }

    fn scheduled_job(id: &str) -> JobConfig {
        let mut scheduler = SchedulerConfig::file("/data/feed.json");
        scheduler.frequency = Some(60);
        scheduler.query_delay = Some(0);
        JobConfig {
            id: Some(id.to_string()),
            analysis_config: AnalysisConfig {
                bucket_span: 60,
                detectors: vec![Detector::new("count")],
                ..Default::default()
            },
            data_description: Some(DataDescription {
                format: DataFormat::Json,
                ..Default::default()
            }),
            scheduler_config: Some(scheduler),
            ..Default::default()
        }
    }

    fn documents(times: impl IntoIterator<Item = i64>) -> Vec<Value> {
        times
            .into_iter()
            .map(|t| serde_json::json!({ "time": t, "host": "a" }))
            .collect()
    }

    async fn wait_stopped(scheduler: &SchedulerController, job_id: &str) -> anyhow::Result<()> {
        for _ in 0..100 {
            if !scheduler.is_running(job_id) && scheduler.status(job_id).await? == SchedulerState::Stopped {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        anyhow::bail!("scheduler for {job_id} did not stop")
    }

    /// Never returns data; used to check that stop does not wait for it.
    struct StalledExtractor;

    #[async_trait]
    impl DataExtractor for StalledExtractor {
        async fn extract(&self, _start: i64, _end: i64) -> Result<Bytes> {
            futures::future::pending().await
        }
    }

    /// Fails its first call, then serves the wrapped extractor.
    struct FlakyExtractor {
        calls: AtomicUsize,
        inner: InMemoryExtractor,
    }

    #[async_trait]
    impl DataExtractor for FlakyExtractor {
        async fn extract(&self, start: i64, end: i64) -> Result<Bytes> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(EngineError::Io(io::Error::other("connection reset")));
            }
            self.inner.extract(start, end).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lookback_run_counts_every_record_once() -> anyhow::Result<()> {
        let source = Arc::new(InMemoryExtractor::new(TimeField::named("time", "epoch")));
        source.push(documents((0..120).map(|i| 1_000 + i * 10)))?;
        let node = single(source.clone());
        node.registry.create(scheduled_job("feed")).await?;

        assert!(node.scheduler.start("feed", None, Some(10_000)).await?);
        wait_stopped(&node.scheduler, "feed").await?;

        let job = node.registry.get("feed").await?;
        assert_eq!(job.counts.input_record_count, 120);
        assert_eq!(job.counts.processed_record_count, 120);
        assert_eq!(job.status, JobStatus::Closed);
        assert_eq!(job.scheduler_status, Some(SchedulerState::Stopped));

        // A second run resumes after the newest record and finds nothing new.
        source.push(documents([3_000, 3_010]))?;
        assert!(node.scheduler.start("feed", None, Some(10_000)).await?);
        wait_stopped(&node.scheduler, "feed").await?;
        let job = node.registry.get("feed").await?;
        assert_eq!(job.counts.input_record_count, 122);
        assert_eq!(job.counts.processed_record_count, 122);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_is_retried_over_same_window() -> anyhow::Result<()> {
        let inner = InMemoryExtractor::new(TimeField::named("time", "epoch"));
        inner.push(documents((0..30).map(|i| 500 + i * 20)))?;
        let source = Arc::new(FlakyExtractor {
            calls: AtomicUsize::new(0),
            inner,
        });
        let node = single(source.clone());
        node.registry.create(scheduled_job("feed")).await?;

        node.scheduler.start("feed", Some(0), Some(5_000)).await?;
        wait_stopped(&node.scheduler, "feed").await?;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        let job = node.registry.get("feed").await?;
        assert_eq!(job.counts.input_record_count, 30);
        assert_eq!(job.counts.processed_record_count, 30);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_in_flight_poll() -> anyhow::Result<()> {
        let node = single(Arc::new(StalledExtractor));
        node.registry.create(scheduled_job("feed")).await?;

        node.scheduler.start("feed", None, None).await?;
        assert_eq!(node.scheduler.status("feed").await?, SchedulerState::Started);
        assert_eq!(node.registry.get("feed").await?.status, JobStatus::Running);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(5), node.scheduler.stop("feed")).await;
        assert!(matches!(stopped, Ok(Ok(true))));
        assert_eq!(node.scheduler.status("feed").await?, SchedulerState::Stopped);
        assert_eq!(node.registry.get("feed").await?.status, JobStatus::Closed);
        assert!(node.scheduler.stop("feed").await?);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_stops_both_wait_for_the_run() -> anyhow::Result<()> {
        let node = single(Arc::new(StalledExtractor));
        node.registry.create(scheduled_job("feed")).await?;
        node.scheduler.start("feed", None, None).await?;

        let (first, second) = tokio::time::timeout(
            Duration::from_secs(5),
            async { tokio::join!(node.scheduler.stop("feed"), node.scheduler.stop("feed")) },
        )
        .await?;
        assert!(first?);
        assert!(second?);
        assert!(!node.scheduler.is_running("feed"));
        assert_eq!(node.scheduler.status("feed").await?, SchedulerState::Stopped);
        assert_eq!(node.registry.get("feed").await?.status, JobStatus::Closed);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_fails_on_either_node() -> anyhow::Result<()> {
        let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());
        let leases: Arc<dyn LeaseBackend> = Arc::new(InMemoryLeaseBackend::new());
        let a = node(store.clone(), leases.clone(), "node-a", Arc::new(StalledExtractor));
        let b = node(store, leases, "node-b", Arc::new(StalledExtractor));
        a.registry.create(scheduled_job("feed")).await?;

        a.scheduler.start("feed", None, None).await?;
        let again = a.scheduler.start("feed", None, None).await.unwrap_err();
        assert_eq!(again.code(), ErrorCode::NativeProcessConcurrentUse);
        let elsewhere = b.scheduler.start("feed", None, None).await.unwrap_err();
        assert_eq!(elsewhere.code(), ErrorCode::NativeProcessConcurrentUse);
        let stop_elsewhere = b.scheduler.stop("feed").await.unwrap_err();
        assert_eq!(stop_elsewhere.code(), ErrorCode::NativeProcessConcurrentUse);
        assert_eq!(b.scheduler.status("feed").await?, SchedulerState::Started);

        a.scheduler.stop("feed").await?;
        b.scheduler.start("feed", None, None).await?;
        assert_eq!(a.scheduler.status("feed").await?, SchedulerState::Started);
        b.scheduler.stop("feed").await?;
        assert_eq!(a.scheduler.status("feed").await?, SchedulerState::Stopped);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn empty_source_warns_once() -> anyhow::Result<()> {
        let source = Arc::new(InMemoryExtractor::new(TimeField::named("time", "epoch")));
        let node = single(source);
        node.registry.create(scheduled_job("feed")).await?;

        node.scheduler.start("feed", None, None).await?;
        tokio::time::sleep(Duration::from_secs(60 * 6 + 1)).await;
        node.scheduler.stop("feed").await?;

        let events = node.registry.events("feed", 0, 100).await?;
        let warnings = events.iter().filter(|e| e.kind == "scheduler_no_data").count();
        assert_eq!(warnings, 1);
        assert!(events.iter().any(|e| e.kind == "scheduler_started"));
        assert!(events.iter().any(|e| e.kind == "scheduler_stopped"));
        Ok(())
    }

    #[tokio::test]
    async fn unscheduled_job_is_rejected() -> anyhow::Result<()> {
        let node = single(Arc::new(StalledExtractor));
        let mut config = scheduled_job("plain");
        config.scheduler_config = None;
        node.registry.create(config).await?;
        let err = node.scheduler.start("plain", None, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoSuchScheduledJob);
        let err = node.scheduler.status("missing").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingJobError);
        Ok(())
    }
}
