//! Shared in-process document store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::ResultStore;
use crate::error::{poison_err, Result};
use crate::job::Job;
use crate::results::{AuditEvent, Bucket, ModelSnapshot};

#[derive(Debug, Default)]
struct JobResults {
    buckets: BTreeMap<i64, Bucket>,
    snapshots: Vec<ModelSnapshot>,
    events: Vec<AuditEvent>,
}

#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    jobs: RwLock<HashMap<String, Job>>,
    results: RwLock<HashMap<String, JobResults>>,
    sequence: AtomicU64,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn create_job(&self, job: &Job) -> Result<bool> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        if jobs.contains_key(&job.id) {
            return Ok(false);
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(true)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let jobs = self.jobs.read().map_err(poison_err)?;
        Ok(jobs.get(job_id).cloned())
    }

    async fn put_job(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn delete_job(&self, job_id: &str) -> Result<bool> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        Ok(jobs.remove(job_id).is_some())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().map_err(poison_err)?;
        let mut list: Vec<Job> = jobs.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    async fn put_bucket(&self, job_id: &str, mut bucket: Bucket) -> Result<()> {
        for record in &mut bucket.records {
            record.sequence = self.next_sequence();
        }
        let mut results = self.results.write().map_err(poison_err)?;
        let entry = results.entry(job_id.to_string()).or_default();
        entry.buckets.insert(bucket.epoch(), bucket);
        Ok(())
    }

    async fn get_buckets_by_range(
        &self,
        job_id: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<Bucket>> {
        let results = self.results.read().map_err(poison_err)?;
        let Some(entry) = results.get(job_id) else {
            return Ok(Vec::new());
        };
        let start = start.unwrap_or(i64::MIN);
        let end = end.unwrap_or(i64::MAX);
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(entry
            .buckets
            .range(start..end)
            .map(|(_, bucket)| bucket.clone())
            .collect())
    }

    async fn delete_results_after(&self, job_id: &str, epoch: i64) -> Result<u64> {
        let mut results = self.results.write().map_err(poison_err)?;
        let Some(entry) = results.get_mut(job_id) else {
            return Ok(0);
        };
        let Some(first) = epoch.checked_add(1) else {
            return Ok(0);
        };
        let removed = entry.buckets.split_off(&first);
        Ok(removed.len() as u64)
    }

    async fn delete_results_in_range(&self, job_id: &str, start: i64, end: i64) -> Result<u64> {
        let mut results = self.results.write().map_err(poison_err)?;
        let Some(entry) = results.get_mut(job_id) else {
            return Ok(0);
        };
        let before = entry.buckets.len();
        entry
            .buckets
            .retain(|epoch, _| *epoch < start || *epoch >= end);
        Ok((before - entry.buckets.len()) as u64)
    }

    async fn delete_interim_results(&self, job_id: &str) -> Result<u64> {
        let mut results = self.results.write().map_err(poison_err)?;
        let Some(entry) = results.get_mut(job_id) else {
            return Ok(0);
        };
        let before = entry.buckets.len();
        entry.buckets.retain(|_, bucket| !bucket.is_interim);
        Ok((before - entry.buckets.len()) as u64)
    }

    async fn delete_all_results(&self, job_id: &str) -> Result<()> {
        let mut results = self.results.write().map_err(poison_err)?;
        results.remove(job_id);
        Ok(())
    }

    async fn put_snapshot(&self, snapshot: ModelSnapshot) -> Result<()> {
        let mut results = self.results.write().map_err(poison_err)?;
        let entry = results.entry(snapshot.job_id.clone()).or_default();
        entry
            .snapshots
            .retain(|existing| existing.snapshot_id != snapshot.snapshot_id);
        entry.snapshots.push(snapshot);
        entry.snapshots.sort_by_key(|s| s.order_key());
        Ok(())
    }

    async fn list_snapshots(&self, job_id: &str) -> Result<Vec<ModelSnapshot>> {
        let results = self.results.read().map_err(poison_err)?;
        Ok(results
            .get(job_id)
            .map(|entry| entry.snapshots.clone())
            .unwrap_or_default())
    }

    async fn delete_snapshot(&self, job_id: &str, snapshot_id: &str) -> Result<bool> {
        let mut results = self.results.write().map_err(poison_err)?;
        let Some(entry) = results.get_mut(job_id) else {
            return Ok(false);
        };
        let before = entry.snapshots.len();
        entry.snapshots.retain(|s| s.snapshot_id != snapshot_id);
        Ok(entry.snapshots.len() != before)
    }

    async fn append_event(&self, job_id: &str, kind: &str, payload: Value) -> Result<()> {
        let id = self.next_sequence();
        let mut results = self.results.write().map_err(poison_err)?;
        let entry = results.entry(job_id.to_string()).or_default();
        entry.events.push(AuditEvent {
            id,
            job_id: job_id.to_string(),
            created_at: Utc::now(),
            kind: kind.to_string(),
            payload,
        });
        Ok(())
    }

    async fn list_events(&self, job_id: &str, after: u64, limit: usize) -> Result<Vec<AuditEvent>> {
        let results = self.results.read().map_err(poison_err)?;
        Ok(results
            .get(job_id)
            .map(|entry| {
                entry
                    .events
                    .iter()
                    .filter(|event| event.id > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
