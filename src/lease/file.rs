//! Lock-file leases.
//!
//! A lease is a `<job>.lock` file created with `create_new`, so the operating
//! system arbitrates races between processes sharing the directory. The file
//! holds the holder as JSON so contention errors can name it.
//!
//! A process that exits without releasing leaves its file behind. Such a file
//! is reclaimed when its holder ran on this host and that pid is gone, or when
//! it was never written and is older than [`UNWRITTEN_GRACE`].

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::io::AsyncWriteExt;

use super::{LeaseBackend, LeaseHolder, LeaseOutcome};
use crate::error::{EngineError, Result};

/// How long a lock file may stay empty before its creator counts as dead.
pub const UNWRITTEN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct FileLeaseBackend {
    dir: PathBuf,
}

impl FileLeaseBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self, job_id: &str) -> PathBuf {
        let safe: String = job_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.lock"))
    }

    async fn read_holder(path: &Path) -> Result<Option<LeaseHolder>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(holder) => Ok(Some(holder)),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "unreadable lease file");
                    Ok(None)
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_holder(file: &mut tokio::fs::File, holder: &LeaseHolder) -> Result<()> {
        let body = serde_json::to_vec(holder).map_err(|err| EngineError::store(err.to_string()))?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Whether the file left at `path` belongs to a holder that can no longer
    /// release it.
    async fn is_abandoned(path: &Path, current: Option<&LeaseHolder>, claimant: &LeaseHolder) -> bool {
        match current {
            Some(current) => {
                let same_host = if current.host.is_empty() {
                    current.node_id == claimant.node_id
                } else {
                    current.host == claimant.host
                };
                same_host && current.pid != 0 && !process_alive(current.pid)
            }
            None => match tokio::fs::metadata(path).await.and_then(|meta| meta.modified()) {
                Ok(modified) => modified.elapsed().is_ok_and(|age| age >= UNWRITTEN_GRACE),
                Err(_) => false,
            },
        }
    }
}

fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing(),
    );
    system.process(pid).is_some()
}

#[async_trait]
impl LeaseBackend for FileLeaseBackend {
    async fn try_acquire(&self, job_id: &str, holder: &LeaseHolder) -> Result<LeaseOutcome> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.lock_path(job_id);
        let mut reclaimed = false;
        let mut file = loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => break file,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let current = Self::read_holder(&path).await?;
                    if reclaimed || !Self::is_abandoned(&path, current.as_ref(), holder).await {
                        return Ok(LeaseOutcome::AlreadyHeld(current));
                    }
                    tracing::warn!(
                        job_id,
                        path = %path.display(),
                        previous = %current.as_ref().map(LeaseHolder::describe).unwrap_or_default(),
                        "reclaiming lease left by an exited process"
                    );
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => {}
                        Err(err) if err.kind() == ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                    reclaimed = true;
                }
                Err(err) => return Err(err.into()),
            }
        };
        if let Err(err) = Self::write_holder(&mut file, holder).await {
            drop(file);
            if let Err(remove_err) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), error = %remove_err, "failed to remove unwritten lease file");
            }
            return Err(err);
        }
        Ok(LeaseOutcome::Acquired)
    }

    async fn release(&self, job_id: &str, token: &str) -> Result<bool> {
        let path = self.lock_path(job_id);
        match Self::read_holder(&path).await? {
            Some(holder) if holder.token == token => {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => Ok(true),
                    Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
                    Err(err) => Err(err.into()),
                }
            }
            _ => Ok(false),
        }
    }

    async fn holder(&self, job_id: &str) -> Result<Option<LeaseHolder>> {
        let path = self.lock_path(job_id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        match Self::read_holder(&path).await? {
            Some(holder) => Ok(Some(holder)),
            // Present but not yet written by its creator: still held.
            None => Ok(Some(LeaseHolder {
                node_id: "unknown".to_string(),
                token: String::new(),
                action: super::Action::Writing,
                acquired_at: chrono::Utc::now(),
                host: String::new(),
                pid: 0,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::{Action, WriteExclusivityGuard};
    use std::sync::Arc;

    #[tokio::test]
    async fn lock_files_exclude_second_process() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let a = WriteExclusivityGuard::new("node-a", Arc::new(FileLeaseBackend::new(dir.path())));
        let b = WriteExclusivityGuard::new("node-b", Arc::new(FileLeaseBackend::new(dir.path())));

        let ticket = a.acquire("power-usage", Action::Writing).await?;
        assert!(dir.path().join("power-usage.lock").exists());

        let err = b.acquire("power-usage", Action::Flushing).await.unwrap_err();
        assert!(err.is_job_in_use());
        assert!(err.to_string().contains("node-a (writing)"));

        let holder = b.holder("power-usage").await?.expect("holder");
        assert_eq!(holder.node_id, "node-a");

        assert!(a.release(&ticket).await?);
        assert!(!dir.path().join("power-usage.lock").exists());
        assert!(!b.is_held("power-usage").await?);
        b.acquire("power-usage", Action::Flushing).await?;
        Ok(())
    }

    fn stale_holder(node_id: &str, host: &str, pid: u32) -> LeaseHolder {
        LeaseHolder {
            node_id: node_id.to_string(),
            token: "previous-run".to_string(),
            action: Action::Writing,
            acquired_at: chrono::Utc::now(),
            host: host.to_string(),
            pid,
        }
    }

    #[tokio::test]
    async fn lock_left_by_an_exited_process_is_reclaimed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let body = serde_json::json!({
            "node_id": "node-a",
            "token": "previous-run",
            "action": "writing",
            "acquired_at": "2026-01-01T00:00:00Z",
            "pid": 3_999_999,
        });
        std::fs::write(dir.path().join("farm.lock"), serde_json::to_vec(&body)?)?;

        let guard = WriteExclusivityGuard::new("node-a", Arc::new(FileLeaseBackend::new(dir.path())));
        let ticket = guard.acquire("farm", Action::Writing).await?;
        let holder = guard.holder("farm").await?.expect("holder");
        assert_eq!(holder.token, ticket.token);
        assert_eq!(holder.pid, std::process::id());
        Ok(())
    }

    #[tokio::test]
    async fn lock_of_a_live_process_is_not_reclaimed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let host = System::host_name().unwrap_or_default();
        let live = stale_holder("node-b", &host, std::process::id());
        std::fs::write(dir.path().join("farm.lock"), serde_json::to_vec(&live)?)?;

        let guard = WriteExclusivityGuard::new("node-a", Arc::new(FileLeaseBackend::new(dir.path())));
        let err = guard.acquire("farm", Action::Writing).await.unwrap_err();
        assert!(err.is_job_in_use());
        assert!(err.to_string().contains("node-b (writing)"));
        Ok(())
    }

    #[tokio::test]
    async fn lock_from_another_host_is_never_reclaimed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let remote = stale_holder("node-b", "some-other-host.invalid", 3_999_999);
        std::fs::write(dir.path().join("farm.lock"), serde_json::to_vec(&remote)?)?;

        let guard = WriteExclusivityGuard::new("node-a", Arc::new(FileLeaseBackend::new(dir.path())));
        assert!(guard.acquire("farm", Action::Writing).await.unwrap_err().is_job_in_use());
        Ok(())
    }

    #[tokio::test]
    async fn freshly_created_empty_lock_counts_as_held() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("farm.lock"), b"")?;

        let guard = WriteExclusivityGuard::new("node-a", Arc::new(FileLeaseBackend::new(dir.path())));
        assert!(guard.acquire("farm", Action::Writing).await.unwrap_err().is_job_in_use());
        assert!(dir.path().join("farm.lock").exists());
        Ok(())
    }

    #[tokio::test]
    async fn release_with_foreign_token_keeps_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = FileLeaseBackend::new(dir.path());
        let guard = WriteExclusivityGuard::new("node-a", Arc::new(backend.clone()));
        guard.acquire("farm", Action::Writing).await?;
        assert!(!backend.release("farm", "not-the-token").await?);
        assert!(backend.holder("farm").await?.is_some());
        Ok(())
    }
}
