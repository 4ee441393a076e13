//! Cluster-wide single-writer leases.
//!
//! At most one analytics worker session may be open for a job across every
//! node sharing a [`LeaseBackend`]. The [`WriteExclusivityGuard`] is the only
//! way the rest of the engine touches leases, so swapping the backend (lock
//! files, an in-process table, an external consensus store) changes nothing
//! upstream.
//!
//! Acquisition never blocks: a contended lease is reported immediately and
//! surfaced as [`EngineError::JobInUse`], whichever operation asked for it.

pub mod file;
pub mod memory;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{poison_err, EngineError, Result};

pub use file::FileLeaseBackend;
pub use memory::InMemoryLeaseBackend;

/// What a lease holder is doing with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Writing,
    Flushing,
    Closing,
    Deleting,
    Reverting,
    Scheduling,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Writing => "writing",
            Action::Flushing => "flushing",
            Action::Closing => "closing",
            Action::Deleting => "deleting",
            Action::Reverting => "reverting",
            Action::Scheduling => "scheduling",
        }
    }

    /// Verb used in contention messages: "Cannot <verb> job ...".
    pub fn verb(&self) -> &'static str {
        match self {
            Action::Writing => "write to",
            Action::Flushing => "flush",
            Action::Closing => "close",
            Action::Deleting => "delete",
            Action::Reverting => "revert",
            Action::Scheduling => "start the scheduler for",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseHolder {
    pub node_id: String,
    pub token: String,
    pub action: Action,
    pub acquired_at: DateTime<Utc>,
    /// Host the holding process runs on; with `pid` it lets a lock file
    /// outlive a crash only as long as the process does.
    #[serde(default)]
    pub host: String,
    pub pid: u32,
}

impl LeaseHolder {
    pub fn describe(&self) -> String {
        format!("{} ({})", self.node_id, self.action.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired,
    AlreadyHeld(Option<LeaseHolder>),
}

/// Storage for leases. Implementations must make `try_acquire` atomic: two
/// callers racing for the same job never both see `Acquired`.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    async fn try_acquire(&self, job_id: &str, holder: &LeaseHolder) -> Result<LeaseOutcome>;

    /// Releases the lease if `token` still owns it.
    async fn release(&self, job_id: &str, token: &str) -> Result<bool>;

    async fn holder(&self, job_id: &str) -> Result<Option<LeaseHolder>>;
}

/// Proof that this node holds a job's lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseTicket {
    pub job_id: String,
    pub token: String,
    pub action: Action,
}

#[derive(Debug)]
pub enum Acquisition {
    Acquired(LeaseTicket),
    AlreadyHeld(Option<LeaseHolder>),
}

pub struct WriteExclusivityGuard {
    node_id: String,
    host: String,
    backend: Arc<dyn LeaseBackend>,
    owned: Mutex<HashMap<String, LeaseHolder>>,
}

impl WriteExclusivityGuard {
    pub fn new(node_id: impl Into<String>, backend: Arc<dyn LeaseBackend>) -> Self {
        Self {
            node_id: node_id.into(),
            host: sysinfo::System::host_name().unwrap_or_default(),
            backend,
            owned: Mutex::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn try_acquire(&self, job_id: &str, action: Action) -> Result<Acquisition> {
        if let Some(existing) = self.owned_holder(job_id)? {
            return Ok(Acquisition::AlreadyHeld(Some(existing)));
        }
        let holder = LeaseHolder {
            node_id: self.node_id.clone(),
            token: Uuid::new_v4().to_string(),
            action,
            acquired_at: Utc::now(),
            host: self.host.clone(),
            pid: std::process::id(),
        };
        match self.backend.try_acquire(job_id, &holder).await? {
            LeaseOutcome::Acquired => {
                let ticket = LeaseTicket {
                    job_id: job_id.to_string(),
                    token: holder.token.clone(),
                    action,
                };
                self.owned
                    .lock()
                    .map_err(poison_err)?
                    .insert(job_id.to_string(), holder);
                tracing::info!(job_id, node_id = %self.node_id, action = action.as_str(), "lease acquired");
                Ok(Acquisition::Acquired(ticket))
            }
            LeaseOutcome::AlreadyHeld(current) => Ok(Acquisition::AlreadyHeld(current)),
        }
    }

    /// Acquires the lease or fails with `JobInUse`.
    pub async fn acquire(&self, job_id: &str, action: Action) -> Result<LeaseTicket> {
        match self.try_acquire(job_id, action).await? {
            Acquisition::Acquired(ticket) => Ok(ticket),
            Acquisition::AlreadyHeld(holder) => Err(self.in_use(job_id, action, holder.as_ref())),
        }
    }

    pub async fn release(&self, ticket: &LeaseTicket) -> Result<bool> {
        {
            let mut owned = self.owned.lock().map_err(poison_err)?;
            if owned
                .get(&ticket.job_id)
                .is_some_and(|holder| holder.token == ticket.token)
            {
                owned.remove(&ticket.job_id);
            }
        }
        let released = self.backend.release(&ticket.job_id, &ticket.token).await?;
        if released {
            tracing::info!(job_id = %ticket.job_id, node_id = %self.node_id, "lease released");
        } else {
            tracing::warn!(job_id = %ticket.job_id, node_id = %self.node_id, "lease was no longer held at release");
        }
        Ok(released)
    }

    /// Releases whatever lease this node holds for the job.
    pub async fn release_job(&self, job_id: &str) -> Result<bool> {
        let holder = self.owned.lock().map_err(poison_err)?.remove(job_id);
        match holder {
            Some(holder) => self.backend.release(job_id, &holder.token).await,
            None => Ok(false),
        }
    }

    /// Whether any node holds the job's lease.
    pub async fn is_held(&self, job_id: &str) -> Result<bool> {
        Ok(self.backend.holder(job_id).await?.is_some())
    }

    pub async fn holder(&self, job_id: &str) -> Result<Option<LeaseHolder>> {
        self.backend.holder(job_id).await
    }

    /// Whether this node holds the job's lease.
    pub fn holds(&self, job_id: &str) -> bool {
        self.owned
            .lock()
            .map(|owned| owned.contains_key(job_id))
            .unwrap_or(false)
    }

    /// Fails with `JobInUse` when another node holds the job's lease.
    pub async fn ensure_not_held_elsewhere(&self, job_id: &str, action: Action) -> Result<()> {
        if self.holds(job_id) {
            return Ok(());
        }
        match self.backend.holder(job_id).await? {
            Some(holder) => Err(self.in_use(job_id, action, Some(&holder))),
            None => Ok(()),
        }
    }

    /// Releases every lease this node owns. Called on shutdown.
    pub async fn release_all(&self) -> Result<usize> {
        let owned: Vec<(String, LeaseHolder)> = {
            let mut owned = self.owned.lock().map_err(poison_err)?;
            owned.drain().collect()
        };
        let mut released = 0;
        for (job_id, holder) in owned {
            match self.backend.release(&job_id, &holder.token).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(job_id = %job_id, error = %err, "failed to release lease on teardown");
                }
            }
        }
        Ok(released)
    }

    pub fn in_use(&self, job_id: &str, action: Action, holder: Option<&LeaseHolder>) -> EngineError {
        tracing::warn!(
            job_id,
            node_id = %self.node_id,
            action = action.as_str(),
            holder = ?holder.map(|h| h.node_id.as_str()),
            "job is in use"
        );
        EngineError::JobInUse {
            job_id: job_id.to_string(),
            holder: holder.map(LeaseHolder::describe),
            action: action.verb().to_string(),
        }
    }

    fn owned_holder(&self, job_id: &str) -> Result<Option<LeaseHolder>> {
        Ok(self.owned.lock().map_err(poison_err)?.get(job_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (WriteExclusivityGuard, WriteExclusivityGuard) {
        let backend: Arc<dyn LeaseBackend> = Arc::new(InMemoryLeaseBackend::new());
        (
            WriteExclusivityGuard::new("node-a", backend.clone()),
            WriteExclusivityGuard::new("node-b", backend),
        )
    }

    #[tokio::test]
    async fn second_node_gets_job_in_use_for_every_action() -> Result<()> {
        let (a, b) = pair();
        let ticket = a.acquire("farm", Action::Writing).await?;
        assert!(a.holds("farm"));
        assert!(b.is_held("farm").await?);

        for action in [
            Action::Writing,
            Action::Flushing,
            Action::Closing,
            Action::Deleting,
            Action::Scheduling,
        ] {
            let err = b.acquire("farm", action).await.unwrap_err();
            assert_eq!(err.code(), crate::error::ErrorCode::NativeProcessConcurrentUse);
        }

        assert!(a.release(&ticket).await?);
        assert!(!b.is_held("farm").await?);
        let ticket = b.acquire("farm", Action::Scheduling).await?;
        assert_eq!(ticket.action, Action::Scheduling);
        Ok(())
    }

    #[tokio::test]
    async fn holder_node_cannot_acquire_twice() -> Result<()> {
        let (a, _) = pair();
        let _ticket = a.acquire("farm", Action::Scheduling).await?;
        let err = a.acquire("farm", Action::Scheduling).await.unwrap_err();
        assert!(err.is_job_in_use());
        assert!(err.to_string().contains("node-a"));
        Ok(())
    }

    #[tokio::test]
    async fn release_all_frees_owned_leases() -> Result<()> {
        let (a, b) = pair();
        a.acquire("one", Action::Writing).await?;
        a.acquire("two", Action::Writing).await?;
        assert_eq!(a.release_all().await?, 2);
        assert!(!a.holds("one"));
        b.acquire("one", Action::Writing).await?;
        Ok(())
    }

    #[tokio::test]
    async fn stale_ticket_does_not_release_new_holder() -> Result<()> {
        let (a, b) = pair();
        let old = a.acquire("farm", Action::Writing).await?;
        assert!(a.release(&old).await?);
        let _new = b.acquire("farm", Action::Writing).await?;
        assert!(!a.release(&old).await?);
        assert!(b.holds("farm"));
        assert!(a.ensure_not_held_elsewhere("farm", Action::Closing).await.is_err());
        assert!(b.ensure_not_held_elsewhere("farm", Action::Closing).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn racing_nodes_only_one_wins() -> Result<()> {
        let backend: Arc<dyn LeaseBackend> = Arc::new(InMemoryLeaseBackend::new());
        let mut tasks = Vec::new();
        for i in 0..8 {
            let guard = WriteExclusivityGuard::new(format!("node-{i}"), backend.clone());
            tasks.push(tokio::spawn(async move {
                matches!(
                    guard.try_acquire("farm", Action::Writing).await,
                    Ok(Acquisition::Acquired(_))
                )
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap_or(false) {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        Ok(())
    }
}
