//! Analytics worker sessions.
//!
//! Each open job owns one worker task that is the only code touching the
//! job's [`AnalyticsModel`]. Callers talk to it through an
//! [`AnalyticsWorkerHandle`], which queues commands on a bounded channel and
//! waits for the worker's acknowledgement, so `flush` and `close` return only
//! after their results are persisted.

pub mod local;
pub mod persist;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::{EngineError, Result};
use crate::job::Job;
use crate::results::{Bucket, ModelSnapshot};
use crate::store::ResultStore;

pub use local::{LocalModel, LocalModelFactory};
pub use persist::ResultsPersister;

const RESULT_CHANNEL_CAPACITY: usize = 256;

/// One parsed input record: its time in epoch seconds and its field values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InputRecord {
    pub time: i64,
    pub fields: HashMap<String, String>,
}

impl InputRecord {
    pub fn new(time: i64, fields: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            time,
            fields: fields.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushParams {
    pub calc_interim: bool,
    /// Interim window start (inclusive), epoch seconds.
    pub start: Option<i64>,
    /// Interim window end (exclusive), epoch seconds.
    pub end: Option<i64>,
    /// Finalizes every bucket that ends at or before this time.
    pub advance_time: Option<i64>,
    /// Jumps the model forward to this time without emitting the buckets in
    /// between, discarding whatever they had accumulated.
    pub skip_time: Option<i64>,
}

impl FlushParams {
    pub fn interim() -> Self {
        Self {
            calc_interim: true,
            ..Default::default()
        }
    }
}

/// Everything a model emits for one command.
#[derive(Debug, Default)]
pub struct ModelOutput {
    /// Newly finalized buckets in epoch order.
    pub buckets: Vec<Bucket>,
    /// `Some` when the interim set was recomputed; replaces every stored
    /// interim bucket, so `Some(vec![])` clears them.
    pub interim: Option<Vec<Bucket>>,
    pub snapshots: Vec<ModelSnapshot>,
    /// New normalization ceiling when it grew.
    pub ceiling: Option<f64>,
    /// Records that fell in an already finalized bucket.
    pub late_records: u64,
}

/// The statistical engine behind a worker. Implementations are driven from a
/// single task and need not be thread-safe.
pub trait AnalyticsModel: Send {
    fn process(&mut self, records: &[InputRecord]) -> Result<ModelOutput>;

    fn flush(&mut self, params: &FlushParams) -> Result<ModelOutput>;

    /// Discards accumulated data for `[start, end)` so the window can be fed again.
    fn reset_buckets(&mut self, start: i64, end: i64) -> Result<()>;

    /// Finalizes every open bucket and persists a snapshot.
    fn close(&mut self) -> Result<ModelOutput>;
}

pub trait ModelFactory: Send + Sync {
    /// Builds a model for `job`, restored from `snapshot` when given.
    fn create(&self, job: &Job, snapshot: Option<&ModelSnapshot>) -> Result<Box<dyn AnalyticsModel>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteAck {
    pub late_records: u64,
    pub buckets: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushAck {
    pub buckets: u64,
    pub interim_buckets: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseAck {
    pub buckets: u64,
    pub snapshot_id: Option<String>,
}

#[derive(Debug)]
pub enum WorkerCommand {
    Write {
        records: Vec<InputRecord>,
        reply: oneshot::Sender<Result<WriteAck>>,
    },
    Flush {
        params: FlushParams,
        reply: oneshot::Sender<Result<FlushAck>>,
    },
    ResetBuckets {
        start: i64,
        end: i64,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<Result<CloseAck>>,
    },
}

#[derive(Clone)]
pub struct AnalyticsWorkerHandle {
    job_id: String,
    tx: mpsc::Sender<WorkerCommand>,
    results: broadcast::Sender<Bucket>,
}

impl AnalyticsWorkerHandle {
    /// Starts a worker for `job`, restoring the job's active snapshot if it has one.
    pub async fn start(
        job: &Job,
        factory: &dyn ModelFactory,
        store: Arc<dyn ResultStore>,
        queue_depth: usize,
    ) -> Result<(Self, JoinHandle<()>)> {
        let snapshot = match &job.model_snapshot_id {
            Some(snapshot_id) => {
                let snapshots = store.list_snapshots(&job.id).await?;
                let found = snapshots
                    .into_iter()
                    .find(|s| &s.snapshot_id == snapshot_id);
                if found.is_none() {
                    tracing::warn!(job_id = %job.id, snapshot_id = %snapshot_id, "active model snapshot is missing; starting empty");
                }
                found
            }
            None => None,
        };
        let model = factory.create(job, snapshot.as_ref())?;
        if let Some(snapshot) = &snapshot {
            tracing::info!(job_id = %job.id, snapshot_id = %snapshot.snapshot_id, "restored model snapshot");
        }
        let persister = ResultsPersister::new(&job.id, store, job.renormalization_window_days);
        Ok(Self::spawn(&job.id, model, persister, queue_depth))
    }

    pub fn spawn(
        job_id: &str,
        model: Box<dyn AnalyticsModel>,
        persister: ResultsPersister,
        queue_depth: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let (results, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        let task = tokio::spawn(
            run_worker(model, rx, persister, results.clone())
                .instrument(tracing::info_span!("worker", job_id = %job_id)),
        );
        let handle = Self {
            job_id: job_id.to_string(),
            tx,
            results,
        };
        (handle, task)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Whether the worker task is still accepting commands.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Buckets as they are persisted, final and interim.
    pub fn subscribe(&self) -> broadcast::Receiver<Bucket> {
        self.results.subscribe()
    }

    pub async fn write(&self, records: Vec<InputRecord>) -> Result<WriteAck> {
        self.request(|reply| WorkerCommand::Write { records, reply })
            .await
    }

    pub async fn flush(&self, params: FlushParams) -> Result<FlushAck> {
        self.request(|reply| WorkerCommand::Flush { params, reply })
            .await
    }

    pub async fn reset_buckets(&self, start: i64, end: i64) -> Result<()> {
        self.request(|reply| WorkerCommand::ResetBuckets { start, end, reply })
            .await
    }

    pub async fn close(&self) -> Result<CloseAck> {
        self.request(|reply| WorkerCommand::Close { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> WorkerCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(command(reply)).await.is_err() {
            return Err(self.exited());
        }
        rx.await.map_err(|_| self.exited())?
    }

    fn exited(&self) -> EngineError {
        EngineError::worker(&self.job_id, "analytics worker has exited")
    }
}

async fn run_worker(
    mut model: Box<dyn AnalyticsModel>,
    mut rx: mpsc::Receiver<WorkerCommand>,
    persister: ResultsPersister,
    results: broadcast::Sender<Bucket>,
) {
    tracing::info!("analytics worker started");
    while let Some(command) = rx.recv().await {
        let keep_running = match command {
            WorkerCommand::Write { records, reply } => {
                let outcome = match model.process(&records) {
                    Ok(output) => {
                        let late_records = output.late_records;
                        persister
                            .persist(output, &results)
                            .await
                            .map(|summary| WriteAck {
                                late_records,
                                buckets: summary.final_buckets,
                            })
                    }
                    Err(err) => Err(err),
                };
                respond(reply, outcome)
            }
            WorkerCommand::Flush { params, reply } => {
                let outcome = match model.flush(&params) {
                    Ok(output) => persister.persist(output, &results).await.map(|summary| FlushAck {
                        buckets: summary.final_buckets,
                        interim_buckets: summary.interim_buckets,
                    }),
                    Err(err) => Err(err),
                };
                respond(reply, outcome)
            }
            WorkerCommand::ResetBuckets { start, end, reply } => {
                respond(reply, model.reset_buckets(start, end))
            }
            WorkerCommand::Close { reply } => {
                let outcome = match model.close() {
                    Ok(output) => {
                        let snapshot_id = output.snapshots.last().map(|s| s.snapshot_id.clone());
                        persister.persist(output, &results).await.map(|summary| CloseAck {
                            buckets: summary.final_buckets,
                            snapshot_id,
                        })
                    }
                    Err(err) => Err(err),
                };
                respond(reply, outcome);
                false
            }
        };
        if !keep_running {
            break;
        }
    }
    tracing::info!("analytics worker stopped");
}

/// Sends the outcome back; an error stops the worker.
fn respond<T>(reply: oneshot::Sender<Result<T>>, outcome: Result<T>) -> bool {
    let ok = outcome.is_ok();
    if let Err(err) = &outcome {
        tracing::error!(error = %err, "analytics worker failed");
    }
    let _ = reply.send(outcome);
    ok
}
