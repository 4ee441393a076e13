//! Streams uploads into a job's analytics worker.
//!
//! A job's first upload (or its scheduler start) opens a writer session: the
//! node takes the job's lease, starts the worker and moves the job to
//! RUNNING. Later uploads reuse the session until the job is closed, the
//! idle timeout fires, or the worker dies. Only one operation at a time runs
//! against a session; a concurrent one on the same node is refused the same
//! way as one from another node.

pub mod reader;
pub mod transform;

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{poison_err, ApiError, EngineError, Result};
use crate::job::types::{DataCounts, IgnoreDowntime, Job, JobStatus};
use crate::job::JobRegistry;
use crate::lease::{Action, LeaseTicket, WriteExclusivityGuard};
use crate::results::{epoch_to_datetime, Bucket};
use crate::worker::{AnalyticsWorkerHandle, FlushAck, FlushParams, InputRecord, ModelFactory};

pub use reader::{ParsedRecord, RecordReader, TimeParser};
pub use transform::{TransformOutcome, TransformPipeline};

const WRITE_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    Upload,
    Scheduler,
}

impl SessionOrigin {
    fn action(self) -> Action {
        match self {
            SessionOrigin::Upload => Action::Writing,
            SessionOrigin::Scheduler => Action::Scheduling,
        }
    }
}

/// `[start, end)` in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn contains(&self, time: i64) -> bool {
        time >= self.start && time < self.end
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadOptions {
    /// Replaces the results of this window: stored results in it are deleted,
    /// the worker reopens its buckets, and records inside it are never
    /// treated as out of order.
    pub reset: Option<TimeRange>,
}

impl UploadOptions {
    pub fn reset(start: i64, end: i64) -> Self {
        Self {
            reset: Some(TimeRange { start, end }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobUploadResult {
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<DataCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultiUploadOutcome {
    /// Set when any job's upload failed.
    pub error: bool,
    pub results: Vec<JobUploadResult>,
}

/// Per-node record of the operation currently running against each job.
#[derive(Debug, Default)]
pub struct ActionGuard {
    busy: Mutex<HashMap<String, Action>>,
}

pub struct ActionPermit<'a> {
    guard: &'a ActionGuard,
    job_id: String,
}

impl ActionGuard {
    /// Marks `job_id` busy, or returns the action already running.
    pub fn begin(&self, job_id: &str, action: Action) -> Result<std::result::Result<ActionPermit<'_>, Action>> {
        let mut busy = self.busy.lock().map_err(poison_err)?;
        if let Some(current) = busy.get(job_id) {
            return Ok(Err(*current));
        }
        busy.insert(job_id.to_string(), action);
        Ok(Ok(ActionPermit {
            guard: self,
            job_id: job_id.to_string(),
        }))
    }

    pub fn current(&self, job_id: &str) -> Option<Action> {
        self.busy.lock().ok().and_then(|busy| busy.get(job_id).copied())
    }
}

impl Drop for ActionPermit<'_> {
    fn drop(&mut self) {
        if let Ok(mut busy) = self.guard.busy.lock() {
            busy.remove(&self.job_id);
        }
    }
}

struct Progress {
    latest_record_time: Option<i64>,
    skip_downtime: bool,
}

/// An open writer session: the node's lease on the job plus its worker.
pub struct Session {
    job_id: String,
    origin: SessionOrigin,
    handle: AnalyticsWorkerHandle,
    task: Mutex<Option<JoinHandle<()>>>,
    ticket: LeaseTicket,
    cancel: CancellationToken,
    last_activity: Mutex<Instant>,
    progress: tokio::sync::Mutex<Progress>,
    /// One of the node's `max_running_jobs` slots, returned when the session
    /// is removed.
    slot: Mutex<Option<OwnedSemaphorePermit>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("job_id", &self.job_id)
            .field("origin", &self.origin)
            .field("ticket", &self.ticket)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn origin(&self) -> SessionOrigin {
        self.origin
    }

    pub fn handle(&self) -> &AnalyticsWorkerHandle {
        &self.handle
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    fn idle_deadline(&self, timeout: Duration) -> Instant {
        let last = self
            .last_activity
            .lock()
            .map(|last| *last)
            .unwrap_or_else(|_| Instant::now());
        last + timeout
    }
}

/// Turns parsed input into analysable records and tallies what it drops.
struct RecordFilter {
    transforms: TransformPipeline,
    time_field: String,
    time_parser: TimeParser,
    required: Vec<String>,
    latency: i64,
    reset: Option<TimeRange>,
}

impl RecordFilter {
    fn new(job: &Job, reset: Option<TimeRange>) -> Result<Self> {
        Ok(Self {
            transforms: TransformPipeline::compile(&job.transforms)?,
            time_field: job.data_description.time_field.clone(),
            time_parser: TimeParser::new(&job.data_description.time_format),
            required: job.analysis_config.required_fields(),
            latency: job.analysis_config.latency.max(0),
            reset,
        })
    }

    fn admit(
        &self,
        parsed: ParsedRecord,
        latest: &mut Option<i64>,
        counts: &mut DataCounts,
    ) -> Option<InputRecord> {
        counts.input_record_count += 1;
        let ParsedRecord::Fields(mut fields) = parsed else {
            counts.missing_field_count += 1;
            return None;
        };
        counts.input_field_count += fields.len() as u64;

        match self.transforms.apply(&mut fields) {
            TransformOutcome::Exclude => {
                counts.excluded_record_count += 1;
                return None;
            }
            TransformOutcome::Keep { failed } => counts.failed_transform_count += failed,
        }

        let Some(time) = fields
            .get(&self.time_field)
            .and_then(|text| self.time_parser.parse(text))
        else {
            counts.invalid_date_count += 1;
            return None;
        };
        if self.required.iter().any(|field| !fields.contains_key(field)) {
            counts.missing_field_count += 1;
            return None;
        }
        let overriding = self.reset.is_some_and(|range| range.contains(time));
        if let Some(previous) = *latest {
            if !overriding && time < previous - self.latency {
                counts.out_of_order_time_stamp_count += 1;
                counts.excluded_record_count += 1;
                return None;
            }
        }

        *latest = Some(latest.map_or(time, |previous| previous.max(time)));
        counts.processed_record_count += 1;
        counts.processed_field_count += self.required.len() as u64 + 1;
        let stamp = epoch_to_datetime(time);
        counts.latest_record_time_stamp = Some(counts.latest_record_time_stamp.map_or(stamp, |t| t.max(stamp)));
        counts.earliest_record_time_stamp =
            Some(counts.earliest_record_time_stamp.map_or(stamp, |t| t.min(stamp)));
        Some(InputRecord { time, fields })
    }
}

pub struct IngestionPipeline {
    registry: Arc<JobRegistry>,
    lease: Arc<WriteExclusivityGuard>,
    factory: Arc<dyn ModelFactory>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    actions: ActionGuard,
    slots: Arc<Semaphore>,
    max_running_jobs: usize,
    queue_depth: usize,
}

impl IngestionPipeline {
    pub fn new(
        registry: Arc<JobRegistry>,
        lease: Arc<WriteExclusivityGuard>,
        factory: Arc<dyn ModelFactory>,
        max_running_jobs: usize,
        queue_depth: usize,
    ) -> Self {
        Self {
            registry,
            lease,
            factory,
            sessions: Mutex::new(HashMap::new()),
            actions: ActionGuard::default(),
            slots: Arc::new(Semaphore::new(max_running_jobs.max(1))),
            max_running_jobs: max_running_jobs.max(1),
            queue_depth,
        }
    }

    pub fn session(&self, job_id: &str) -> Result<Option<Arc<Session>>> {
        Ok(self.sessions.lock().map_err(poison_err)?.get(job_id).cloned())
    }

    /// Whether this node runs a worker for the job.
    pub fn is_running(&self, job_id: &str) -> bool {
        self.session(job_id).ok().flatten().is_some()
    }

    pub fn running_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .lock()
            .map(|sessions| sessions.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Buckets persisted by the job's worker on this node.
    pub fn subscribe(&self, job_id: &str) -> Option<broadcast::Receiver<Bucket>> {
        self.session(job_id)
            .ok()
            .flatten()
            .map(|session| session.handle.subscribe())
    }

    fn begin(&self, job_id: &str, action: Action) -> Result<ActionPermit<'_>> {
        match self.actions.begin(job_id, action)? {
            Ok(permit) => Ok(permit),
            Err(running) => {
                tracing::debug!(job_id, running = running.as_str(), "job busy on this node");
                Err(self.lease.in_use(job_id, action, None))
            }
        }
    }

    pub async fn upload<S>(self: &Arc<Self>, job_id: &str, stream: S, options: UploadOptions) -> Result<DataCounts>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.upload_from(job_id, SessionOrigin::Upload, stream, options)
            .await
    }

    pub async fn upload_bytes(self: &Arc<Self>, job_id: &str, body: Bytes) -> Result<DataCounts> {
        let stream = futures::stream::iter([Ok::<_, io::Error>(body)]);
        self.upload(job_id, stream, UploadOptions::default()).await
    }

    /// Uploads the same body to every job, reporting each outcome.
    pub async fn upload_many(self: &Arc<Self>, job_ids: &[String], body: Bytes) -> MultiUploadOutcome {
        let mut results = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            let result = match self.upload_bytes(job_id, body.clone()).await {
                Ok(counts) => JobUploadResult {
                    job_id: job_id.clone(),
                    counts: Some(counts),
                    error: None,
                },
                Err(err) => JobUploadResult {
                    job_id: job_id.clone(),
                    counts: None,
                    error: Some(err.to_api_error()),
                },
            };
            results.push(result);
        }
        MultiUploadOutcome {
            error: results.iter().any(|r| r.error.is_some()),
            results,
        }
    }

    pub(crate) async fn upload_from<S>(
        self: &Arc<Self>,
        job_id: &str,
        origin: SessionOrigin,
        stream: S,
        options: UploadOptions,
    ) -> Result<DataCounts>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let job = self.registry.get(job_id).await?;
        if let Some(session) = self.session(job_id)? {
            if session.origin != origin {
                return Err(self.lease.in_use(job_id, Action::Writing, None));
            }
        }
        let _permit = self.begin(job_id, Action::Writing)?;
        let session = self.open(&job, origin).await?;

        let mut counts = DataCounts {
            last_data_time_stamp: Some(Utc::now()),
            ..Default::default()
        };
        let outcome = self
            .stream_into(&session, &job, stream, options, &mut counts)
            .await;
        // A failed scheduler poll is retried over the same window, so only an
        // upload keeps the counts of the records it got through.
        if outcome.is_ok() || origin == SessionOrigin::Upload {
            self.registry.merge_counts(job_id, &counts).await?;
        }
        match outcome {
            Ok(()) => {
                tracing::info!(
                    job_id,
                    input = counts.input_record_count,
                    processed = counts.processed_record_count,
                    invalid_dates = counts.invalid_date_count,
                    missing_fields = counts.missing_field_count,
                    out_of_order = counts.out_of_order_time_stamp_count,
                    excluded = counts.excluded_record_count,
                    "upload complete"
                );
                Ok(counts)
            }
            Err(err) => {
                tracing::warn!(job_id, error = %err, "upload failed");
                self.fail_if_worker_died(&session, &err).await;
                Err(err)
            }
        }
    }

    async fn stream_into<S>(
        &self,
        session: &Session,
        job: &Job,
        stream: S,
        options: UploadOptions,
        counts: &mut DataCounts,
    ) -> Result<()>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let mut progress = session.progress.lock().await;
        let resume_from = progress.latest_record_time;
        let outcome = self
            .feed(session, job, stream, options, counts, &mut progress)
            .await;
        if outcome.is_err() && session.origin == SessionOrigin::Scheduler {
            progress.latest_record_time = resume_from;
        }
        outcome
    }

    async fn feed<S>(
        &self,
        session: &Session,
        job: &Job,
        stream: S,
        options: UploadOptions,
        counts: &mut DataCounts,
        progress: &mut Progress,
    ) -> Result<()>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let filter = RecordFilter::new(job, options.reset)?;
        let mut reader = RecordReader::new(&job.data_description);

        if let Some(range) = options.reset {
            let deleted = self
                .registry
                .store()
                .delete_results_in_range(&job.id, range.start, range.end)
                .await?;
            session.handle.reset_buckets(range.start, range.end).await?;
            tracing::info!(job_id = %job.id, start = range.start, end = range.end, deleted, "reset buckets for upload");
        }

        let mut stream = std::pin::pin!(stream);
        let mut batch = Vec::with_capacity(WRITE_BATCH_SIZE);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            counts.input_bytes += chunk.len() as u64;
            session.touch();
            for parsed in reader.push(&chunk)? {
                if let Some(record) = filter.admit(parsed, &mut progress.latest_record_time, counts) {
                    batch.push(record);
                }
                if batch.len() >= WRITE_BATCH_SIZE {
                    self.write_batch(session, progress, &mut batch, counts)
                        .await?;
                }
            }
        }
        for parsed in reader.finish()? {
            if let Some(record) = filter.admit(parsed, &mut progress.latest_record_time, counts) {
                batch.push(record);
            }
        }
        self.write_batch(session, progress, &mut batch, counts)
            .await?;
        session.touch();
        Ok(())
    }

    async fn write_batch(
        &self,
        session: &Session,
        progress: &mut Progress,
        batch: &mut Vec<InputRecord>,
        counts: &mut DataCounts,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if progress.skip_downtime {
            let first = batch.iter().map(|r| r.time).min();
            session
                .handle
                .flush(FlushParams {
                    skip_time: first,
                    ..Default::default()
                })
                .await?;
            progress.skip_downtime = false;
            self.registry
                .mutate(&session.job_id, |job| {
                    if job.ignore_downtime == Some(IgnoreDowntime::Once) {
                        job.ignore_downtime = None;
                    }
                    Ok(())
                })
                .await?;
        }

        let records = std::mem::take(batch);
        let ack = session.handle.write(records).await?;
        if ack.late_records > 0 {
            tracing::debug!(job_id = %session.job_id, late = ack.late_records, "worker dropped late records");
        }
        counts.processed_record_count = counts.processed_record_count.saturating_sub(ack.late_records);
        counts.out_of_order_time_stamp_count += ack.late_records;
        counts.excluded_record_count += ack.late_records;
        counts.bucket_count += ack.buckets;
        Ok(())
    }

    /// Opens a writer session for a scheduler run. Fails if any session is
    /// already open for the job on this node.
    pub(crate) async fn open_for_scheduler(self: &Arc<Self>, job_id: &str) -> Result<Arc<Session>> {
        let job = self.registry.get(job_id).await?;
        if self.session(job_id)?.is_some() {
            return Err(self.lease.in_use(job_id, Action::Scheduling, None));
        }
        let _permit = self.begin(job_id, Action::Scheduling)?;
        self.open(&job, SessionOrigin::Scheduler).await
    }

    async fn open(self: &Arc<Self>, job: &Job, origin: SessionOrigin) -> Result<Arc<Session>> {
        if let Some(session) = self.session(&job.id)? {
            return Ok(session);
        }
        let slot = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| EngineError::TooManyJobs {
                job_id: job.id.clone(),
                limit: self.max_running_jobs,
            })?;
        let ticket = self.lease.acquire(&job.id, origin.action()).await?;
        match self.start_session(&job.id, origin, ticket.clone(), slot).await {
            Ok(session) => Ok(session),
            Err(err) => {
                tracing::error!(job_id = %job.id, error = %err, "failed to open job");
                if let Err(release_err) = self.lease.release(&ticket).await {
                    tracing::warn!(job_id = %job.id, error = %release_err, "failed to release lease");
                }
                Err(err)
            }
        }
    }

    async fn start_session(
        self: &Arc<Self>,
        job_id: &str,
        origin: SessionOrigin,
        ticket: LeaseTicket,
        slot: OwnedSemaphorePermit,
    ) -> Result<Arc<Session>> {
        // Another node may have written the job while we did not hold the lease.
        let job = self.registry.get(job_id).await?;
        let (handle, task) = AnalyticsWorkerHandle::start(
            &job,
            self.factory.as_ref(),
            self.registry.store(),
            self.queue_depth,
        )
        .await?;
        if let Err(err) = self.registry.transition(job_id, JobStatus::Running).await {
            let _ = handle.close().await;
            return Err(err);
        }

        let skip_downtime = matches!(
            job.ignore_downtime,
            Some(IgnoreDowntime::Once | IgnoreDowntime::Always)
        );
        let session = Arc::new(Session {
            job_id: job_id.to_string(),
            origin,
            handle,
            task: Mutex::new(Some(task)),
            ticket,
            cancel: CancellationToken::new(),
            last_activity: Mutex::new(Instant::now()),
            progress: tokio::sync::Mutex::new(Progress {
                latest_record_time: job.counts.latest_record_time_stamp.map(|t| t.timestamp()),
                skip_downtime,
            }),
            slot: Mutex::new(Some(slot)),
        });
        self.sessions
            .lock()
            .map_err(poison_err)?
            .insert(job_id.to_string(), session.clone());

        if origin == SessionOrigin::Upload && job.timeout > 0 {
            self.spawn_idle_watch(&session, Duration::from_secs(job.timeout));
        }
        tracing::info!(job_id, origin = ?origin, node_id = %self.lease.node_id(), "job opened");
        self.registry
            .record_event(
                job_id,
                "opened",
                json!({ "node_id": self.lease.node_id(), "origin": origin }),
            )
            .await;
        Ok(session)
    }

    fn spawn_idle_watch(self: &Arc<Self>, session: &Arc<Session>, timeout: Duration) {
        let pipeline: Weak<Self> = Arc::downgrade(self);
        let session = session.clone();
        let span = tracing::info_span!("idle_timeout", job_id = %session.job_id);
        tokio::spawn(
            async move {
                loop {
                    let deadline = session.idle_deadline(timeout);
                    tokio::select! {
                        _ = session.cancel.cancelled() => return,
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                    if session.idle_deadline(timeout) > Instant::now() {
                        continue;
                    }
                    let Some(pipeline) = pipeline.upgrade() else {
                        return;
                    };
                    let Ok(permit) = pipeline.begin(&session.job_id, Action::Closing) else {
                        session.touch();
                        continue;
                    };
                    tracing::info!(timeout_secs = timeout.as_secs(), "closing idle job");
                    if let Err(err) = pipeline.close_session(&session).await {
                        tracing::warn!(error = %err, "idle close failed");
                    }
                    drop(permit);
                    return;
                }
            }
            .instrument(span),
        );
    }

    pub async fn flush(&self, job_id: &str, params: FlushParams) -> Result<FlushAck> {
        self.registry.get(job_id).await?;
        let Some(session) = self.session(job_id)? else {
            self.lease
                .ensure_not_held_elsewhere(job_id, Action::Flushing)
                .await?;
            return Err(EngineError::JobNotRunning {
                job_id: job_id.to_string(),
            });
        };
        let _permit = self.begin(job_id, Action::Flushing)?;
        session.touch();
        let ack = match session.handle.flush(params).await {
            Ok(ack) => ack,
            Err(err) => {
                self.fail_if_worker_died(&session, &err).await;
                return Err(err);
            }
        };
        if ack.buckets > 0 {
            self.registry
                .mutate(job_id, |job| {
                    job.counts.bucket_count += ack.buckets;
                    Ok(())
                })
                .await?;
        }
        self.registry
            .record_event(
                job_id,
                "flushed",
                json!({
                    "calc_interim": params.calc_interim,
                    "advance_time": params.advance_time,
                    "buckets": ack.buckets,
                    "interim_buckets": ack.interim_buckets,
                }),
            )
            .await;
        Ok(ack)
    }

    /// Finalizes the job's results and stops its worker. Closing a job that
    /// is not running anywhere is a successful no-op.
    pub async fn close(&self, job_id: &str) -> Result<bool> {
        self.close_as(job_id, SessionOrigin::Upload).await
    }

    pub(crate) async fn close_as(&self, job_id: &str, origin: SessionOrigin) -> Result<bool> {
        let job = self.registry.get(job_id).await?;
        let Some(session) = self.session(job_id)? else {
            self.lease
                .ensure_not_held_elsewhere(job_id, Action::Closing)
                .await?;
            self.settle_orphaned(job_id, job.status).await?;
            return Ok(true);
        };
        if session.origin != origin {
            return Err(self.lease.in_use(job_id, Action::Closing, None));
        }
        let _permit = self.begin(job_id, Action::Closing)?;
        self.close_session(&session).await
    }

    /// Moves a job left RUNNING or CLOSING by a worker that no longer exists
    /// to CLOSED. Callers must already know no node has a session open.
    pub(crate) async fn settle_orphaned(&self, job_id: &str, status: JobStatus) -> Result<()> {
        if matches!(status, JobStatus::Running | JobStatus::Closing) {
            tracing::warn!(job_id, status = status.as_str(), "closing job without a worker");
            self.registry.transition(job_id, JobStatus::Closing).await?;
            self.registry.transition(job_id, JobStatus::Closed).await?;
        }
        Ok(())
    }

    /// Closes the job's session on this node, if it has one.
    pub(crate) async fn close_if_open(&self, job_id: &str) -> Result<bool> {
        let Some(session) = self.session(job_id)? else {
            return Ok(false);
        };
        let _permit = self.begin(job_id, Action::Closing)?;
        self.close_session(&session).await
    }

    async fn close_session(&self, session: &Arc<Session>) -> Result<bool> {
        let job_id = session.job_id.as_str();
        self.remove_session(session)?;
        session.cancel.cancel();
        self.registry.transition(job_id, JobStatus::Closing).await?;

        let outcome = session.handle.close().await;
        let task = session.task.lock().map_err(poison_err)?.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::error!(job_id, error = %err, "analytics worker task panicked");
            }
        }

        let ack = match outcome {
            Ok(ack) => ack,
            Err(err) => {
                self.mark_failed(session, &err).await;
                return Err(err);
            }
        };
        self.registry
            .mutate(job_id, |job| {
                job.counts.bucket_count += ack.buckets;
                if let Some(snapshot_id) = &ack.snapshot_id {
                    job.model_snapshot_id = Some(snapshot_id.clone());
                }
                Ok(())
            })
            .await?;
        self.registry.transition(job_id, JobStatus::Closed).await?;
        self.lease.release(&session.ticket).await?;
        tracing::info!(job_id, snapshot_id = ?ack.snapshot_id, "job closed");
        self.registry
            .record_event(
                job_id,
                "closed",
                json!({ "buckets": ack.buckets, "snapshot_id": ack.snapshot_id }),
            )
            .await;
        Ok(true)
    }

    fn remove_session(&self, session: &Arc<Session>) -> Result<bool> {
        let mut sessions = self.sessions.lock().map_err(poison_err)?;
        if sessions
            .get(&session.job_id)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(&session.job_id);
            session.slot.lock().map_err(poison_err)?.take();
            return Ok(true);
        }
        Ok(false)
    }

    async fn fail_if_worker_died(&self, session: &Arc<Session>, err: &EngineError) {
        // Workers stop after any error they report.
        if matches!(err, EngineError::Worker { .. }) || !session.handle.is_alive() {
            self.mark_failed(session, err).await;
        }
    }

    /// Drops a session whose worker died: the job goes FAILED and the lease
    /// is released so the job can be reopened.
    async fn mark_failed(&self, session: &Arc<Session>, err: &EngineError) {
        let job_id = session.job_id.as_str();
        tracing::error!(job_id, error = %err, "analytics worker failed");
        if let Err(remove_err) = self.remove_session(session) {
            tracing::warn!(job_id, error = %remove_err, "failed to drop session");
        }
        session.cancel.cancel();
        if let Err(transition_err) = self.registry.transition(job_id, JobStatus::Failed).await {
            tracing::warn!(job_id, error = %transition_err, "failed to mark job failed");
        }
        if let Err(release_err) = self.lease.release(&session.ticket).await {
            tracing::warn!(job_id, error = %release_err, "failed to release lease");
        }
        self.registry
            .record_event(job_id, "failed", json!({ "error": err.to_string() }))
            .await;
    }

    /// Closes every session this node runs. Called on shutdown.
    pub async fn shutdown(&self) -> usize {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default();
        let mut closed = 0;
        for session in sessions {
            match self.close_session(&session).await {
                Ok(_) => closed += 1,
                Err(err) => {
                    tracing::warn!(job_id = %session.job_id, error = %err, "failed to close job on shutdown");
                }
            }
        }
        closed
    }
}
