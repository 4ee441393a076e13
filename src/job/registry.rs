//! Authoritative job table backed by the shared [`ResultStore`].
//!
//! Every status transition goes through [`JobRegistry::transition`], which
//! rejects moves the lifecycle does not allow. Read-modify-write cycles on a
//! job document are serialized within the node; across nodes, only the lease
//! holder mutates a job's status and counts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::types::{DataCounts, Job, JobConfig, JobStatus, SchedulerState};
use super::update::UpdateRegistry;
use crate::error::{EngineError, Result};
use crate::results::AuditEvent;
use crate::store::ResultStore;
use crate::validation::ConfigValidator;

pub struct JobRegistry {
    store: Arc<dyn ResultStore>,
    validator: ConfigValidator,
    updates: UpdateRegistry,
    default_timeout: u64,
    id_sequence: AtomicU64,
    write_lock: Mutex<()>,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn ResultStore>, default_timeout: u64) -> Self {
        Self {
            store,
            validator: ConfigValidator,
            updates: UpdateRegistry::default(),
            default_timeout,
            id_sequence: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> Arc<dyn ResultStore> {
        self.store.clone()
    }

    /// `yyyyMMddHHmmss-NNNNN` from the UTC clock and a per-process sequence.
    pub fn generate_id(&self) -> String {
        let seq = self.id_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{:05}", Utc::now().format("%Y%m%d%H%M%S"), seq % 100_000)
    }

    pub async fn create(&self, config: JobConfig) -> Result<Job> {
        self.validator.validate(&config)?;
        let id = match &config.id {
            Some(id) => id.clone(),
            None => self.generate_id(),
        };
        let job = Job::from_config(id.clone(), config, self.default_timeout, Utc::now());
        if !self.store.create_job(&job).await? {
            return Err(EngineError::JobAlreadyExists { job_id: id });
        }
        tracing::info!(job_id = %job.id, "job created");
        self.record_event(&job.id, "created", json!({ "status": job.status.as_str() }))
            .await;
        Ok(job)
    }

    pub async fn find(&self, job_id: &str) -> Result<Option<Job>> {
        self.store.get_job(job_id).await
    }

    pub async fn get(&self, job_id: &str) -> Result<Job> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| EngineError::missing_job(job_id))
    }

    pub async fn exists(&self, job_id: &str) -> Result<bool> {
        Ok(self.store.get_job(job_id).await?.is_some())
    }

    pub async fn list(&self) -> Result<Vec<Job>> {
        self.store.list_jobs().await
    }

    /// Applies `f` to the stored job and writes the result back.
    pub async fn mutate<F>(&self, job_id: &str, f: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> Result<()>,
    {
        let _guard = self.write_lock.lock().await;
        let mut job = self.get(job_id).await?;
        f(&mut job)?;
        self.store.put_job(&job).await?;
        Ok(job)
    }

    /// Moves the job to `to`. Moving to the current status is a no-op.
    pub async fn transition(&self, job_id: &str, to: JobStatus) -> Result<Job> {
        let mut from = to;
        let job = self
            .mutate(job_id, |job| {
                from = job.status;
                if job.status == to {
                    return Ok(());
                }
                if !job.status.can_transition_to(to) {
                    return Err(EngineError::InvalidTransition {
                        job_id: job.id.clone(),
                        from: job.status.as_str().to_string(),
                        to: to.as_str().to_string(),
                    });
                }
                job.status = to;
                if to == JobStatus::Closed && from == JobStatus::Closing {
                    job.finished_time = Some(Utc::now());
                }
                Ok(())
            })
            .await?;
        if from != to {
            tracing::info!(job_id, from = from.as_str(), to = to.as_str(), "job status changed");
        }
        Ok(job)
    }

    pub async fn set_scheduler_state(&self, job_id: &str, to: SchedulerState) -> Result<Job> {
        let mut from = to;
        let job = self
            .mutate(job_id, |job| {
                let Some(current) = job.scheduler_state() else {
                    return Err(EngineError::NoSuchScheduledJob {
                        job_id: job.id.clone(),
                    });
                };
                from = current;
                if current == to {
                    return Ok(());
                }
                if !current.can_transition_to(to) {
                    return Err(EngineError::InvalidTransition {
                        job_id: job.id.clone(),
                        from: current.as_str().to_string(),
                        to: to.as_str().to_string(),
                    });
                }
                job.scheduler_status = Some(to);
                Ok(())
            })
            .await?;
        if from != to {
            tracing::info!(job_id, from = from.as_str(), to = to.as_str(), "scheduler status changed");
        }
        Ok(job)
    }

    /// Adds one upload's tallies to the job totals.
    pub async fn merge_counts(&self, job_id: &str, counts: &DataCounts) -> Result<Job> {
        self.mutate(job_id, |job| {
            job.counts.merge(counts);
            job.last_data_time = Some(Utc::now());
            Ok(())
        })
        .await
    }

    /// Validates every key of `payload` and commits them together.
    pub async fn update(&self, job_id: &str, payload: &Value) -> Result<Job> {
        let mut keys = Vec::new();
        let job = self
            .mutate(job_id, |job| {
                let plan = self.updates.prepare(job, payload)?;
                keys = plan.keys().map(str::to_string).collect();
                plan.commit(job);
                Ok(())
            })
            .await?;
        tracing::info!(job_id, keys = ?keys, "job updated");
        self.record_event(job_id, "updated", json!({ "keys": keys })).await;
        Ok(job)
    }

    pub async fn remove(&self, job_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        self.store.delete_job(job_id).await
    }

    /// Appends an audit event; failures are logged, never surfaced.
    pub async fn record_event(&self, job_id: &str, kind: &str, payload: Value) {
        if let Err(err) = self.store.append_event(job_id, kind, payload).await {
            tracing::warn!(job_id, kind, error = %err, "failed to record job event");
        }
    }

    pub async fn events(&self, job_id: &str, after: u64, limit: usize) -> Result<Vec<AuditEvent>> {
        self.store.list_events(job_id, after, limit).await
    }
}
