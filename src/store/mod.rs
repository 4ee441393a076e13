//! Persistence contract for job documents, results, snapshots and audit events.
//!
//! The store is a generic document store: point lookups by id, range reads by
//! bucket epoch and bulk delete-by-range. Every node of a deployment shares the
//! same store; [`memory::InMemoryResultStore`] is the reference implementation.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::job::Job;
use crate::results::{AuditEvent, Bucket, ModelSnapshot};

pub use memory::InMemoryResultStore;

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Inserts a new job document; returns `false` when the id is taken.
    async fn create_job(&self, job: &Job) -> Result<bool>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    async fn put_job(&self, job: &Job) -> Result<()>;

    async fn delete_job(&self, job_id: &str) -> Result<bool>;

    async fn list_jobs(&self) -> Result<Vec<Job>>;

    /// Upserts a bucket keyed by its epoch, replacing any earlier version
    /// (and its records) at that epoch.
    async fn put_bucket(&self, job_id: &str, bucket: Bucket) -> Result<()>;

    /// Buckets with `start <= epoch < end`, ascending by epoch.
    async fn get_buckets_by_range(
        &self,
        job_id: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<Bucket>>;

    /// Deletes every bucket with an epoch strictly after `epoch`.
    async fn delete_results_after(&self, job_id: &str, epoch: i64) -> Result<u64>;

    async fn delete_results_in_range(&self, job_id: &str, start: i64, end: i64) -> Result<u64>;

    async fn delete_interim_results(&self, job_id: &str) -> Result<u64>;

    /// Drops every result, snapshot and event of the job.
    async fn delete_all_results(&self, job_id: &str) -> Result<()>;

    /// Upserts a snapshot keyed by its id.
    async fn put_snapshot(&self, snapshot: ModelSnapshot) -> Result<()>;

    /// Snapshots ordered by `latestRecordTimeStamp`.
    async fn list_snapshots(&self, job_id: &str) -> Result<Vec<ModelSnapshot>>;

    async fn delete_snapshot(&self, job_id: &str, snapshot_id: &str) -> Result<bool>;

    async fn append_event(&self, job_id: &str, kind: &str, payload: Value) -> Result<()>;

    async fn list_events(&self, job_id: &str, after: u64, limit: usize) -> Result<Vec<AuditEvent>>;
}
