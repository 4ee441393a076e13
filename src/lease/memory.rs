//! In-process lease table.
//!
//! Nodes that share one `Arc<InMemoryLeaseBackend>` see each other's leases,
//! which is how tests model several API nodes inside one process.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{LeaseBackend, LeaseHolder, LeaseOutcome};
use crate::error::{poison_err, Result};

#[derive(Debug, Default)]
pub struct InMemoryLeaseBackend {
    leases: RwLock<HashMap<String, LeaseHolder>>,
}

impl InMemoryLeaseBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseBackend for InMemoryLeaseBackend {
    async fn try_acquire(&self, job_id: &str, holder: &LeaseHolder) -> Result<LeaseOutcome> {
        let mut leases = self.leases.write().map_err(poison_err)?;
        if let Some(current) = leases.get(job_id) {
            return Ok(LeaseOutcome::AlreadyHeld(Some(current.clone())));
        }
        leases.insert(job_id.to_string(), holder.clone());
        Ok(LeaseOutcome::Acquired)
    }

    async fn release(&self, job_id: &str, token: &str) -> Result<bool> {
        let mut leases = self.leases.write().map_err(poison_err)?;
        if leases.get(job_id).is_some_and(|h| h.token == token) {
            leases.remove(job_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn holder(&self, job_id: &str) -> Result<Option<LeaseHolder>> {
        let leases = self.leases.read().map_err(poison_err)?;
        Ok(leases.get(job_id).cloned())
    }
}
