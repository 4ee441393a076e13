use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseBackendKind {
    Memory,
    File,
}

impl LeaseBackendKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" | "in_memory" | "in-memory" => Some(LeaseBackendKind::Memory),
            "file" | "lockfile" => Some(LeaseBackendKind::File),
            _ => None,
        }
    }
}

fn setup_config_path() -> Option<PathBuf> {
    for key in ["ENGINE_SETUP_CONFIG_PATH", "ENGINE_STATE_DIR"] {
        if let Ok(path) = env::var(key) {
            let trimmed = path.trim();
            if trimmed.is_empty() {
                continue;
            }
            let path = PathBuf::from(trimmed);
            if key == "ENGINE_STATE_DIR" {
                return Some(path.join("config.json"));
            }
            return Some(path);
        }
    }
    None
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    node_id: Option<String>,
    #[serde(default)]
    jobs_dir: Option<String>,
    #[serde(default)]
    lease_backend: Option<String>,
    #[serde(default)]
    lease_dir: Option<String>,
    #[serde(default)]
    max_running_jobs: Option<usize>,
    #[serde(default)]
    worker_queue_depth: Option<usize>,
    #[serde(default)]
    idle_timeout_secs: Option<u64>,
    #[serde(default)]
    scheduler_empty_warn_count: Option<u32>,
    #[serde(default)]
    alert_max_timeout_secs: Option<u64>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path()?;
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "anomaly-engine failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "anomaly-engine failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn env_is_set(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .is_some()
}

fn apply_setup_overrides(config: &mut EngineConfig, overrides: &SetupConfigOverrides) {
    let env_allows = |key: &str| !env_is_set(key);

    if env_allows("ENGINE_NODE_ID") {
        if let Some(node_id) = overrides
            .node_id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.node_id = node_id.to_string();
        }
    }
    if env_allows("ENGINE_JOBS_DIR") {
        if let Some(dir) = overrides
            .jobs_dir
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.jobs_dir = PathBuf::from(dir);
        }
    }
    if env_allows("ENGINE_LEASE_BACKEND") {
        if let Some(kind) = overrides
            .lease_backend
            .as_deref()
            .and_then(LeaseBackendKind::parse)
        {
            config.lease_backend = kind;
        }
    }
    if env_allows("ENGINE_LEASE_DIR") {
        if let Some(dir) = overrides
            .lease_dir
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.lease_dir = PathBuf::from(dir);
        }
    }
    if env_allows("ENGINE_MAX_RUNNING_JOBS") {
        if let Some(value) = overrides.max_running_jobs.filter(|v| *v != 0) {
            config.max_running_jobs = value;
        }
    }
    if env_allows("ENGINE_WORKER_QUEUE_DEPTH") {
        if let Some(value) = overrides.worker_queue_depth.filter(|v| *v != 0) {
            config.worker_queue_depth = value;
        }
    }
    if env_allows("ENGINE_IDLE_TIMEOUT_SECS") {
        if let Some(value) = overrides.idle_timeout_secs.filter(|v| *v != 0) {
            config.default_idle_timeout_secs = value;
        }
    }
    if env_allows("ENGINE_SCHEDULER_EMPTY_WARN_COUNT") {
        if let Some(value) = overrides.scheduler_empty_warn_count.filter(|v| *v != 0) {
            config.scheduler_empty_warn_count = value;
        }
    }
    if env_allows("ENGINE_ALERT_MAX_TIMEOUT_SECS") {
        if let Some(value) = overrides.alert_max_timeout_secs.filter(|v| *v != 0) {
            config.alert_max_timeout_secs = value;
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub node_id: String,
    pub jobs_dir: PathBuf,
    pub lease_backend: LeaseBackendKind,
    pub lease_dir: PathBuf,
    pub max_running_jobs: usize,
    pub worker_queue_depth: usize,
    pub default_idle_timeout_secs: u64,
    pub scheduler_empty_warn_count: u32,
    pub alert_max_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: format!("engine-{}", std::process::id()),
            jobs_dir: PathBuf::from("./jobs"),
            lease_backend: LeaseBackendKind::File,
            lease_dir: env::temp_dir().join("anomaly-engine").join("leases"),
            max_running_jobs: 10,
            worker_queue_depth: 64,
            default_idle_timeout_secs: 600,
            scheduler_empty_warn_count: 10,
            alert_max_timeout_secs: 300,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();
        let defaults = Self::default();

        let node_id = env::var("ENGINE_NODE_ID")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or(defaults.node_id);
        let jobs_dir = env::var("ENGINE_JOBS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.jobs_dir);
        let lease_backend = match env::var("ENGINE_LEASE_BACKEND") {
            Ok(value) => LeaseBackendKind::parse(&value)
                .with_context(|| format!("ENGINE_LEASE_BACKEND must be 'memory' or 'file', got '{value}'"))?,
            Err(_) => defaults.lease_backend,
        };
        let lease_dir = env::var("ENGINE_LEASE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.lease_dir);
        let max_running_jobs = env::var("ENGINE_MAX_RUNNING_JOBS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.max_running_jobs);
        let worker_queue_depth = env::var("ENGINE_WORKER_QUEUE_DEPTH")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.worker_queue_depth);
        let default_idle_timeout_secs = env::var("ENGINE_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.default_idle_timeout_secs);
        let scheduler_empty_warn_count = env::var("ENGINE_SCHEDULER_EMPTY_WARN_COUNT")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults.scheduler_empty_warn_count);
        let alert_max_timeout_secs = env::var("ENGINE_ALERT_MAX_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.alert_max_timeout_secs);

        let mut config = Self {
            node_id,
            jobs_dir,
            lease_backend,
            lease_dir,
            max_running_jobs: max_running_jobs.max(1),
            worker_queue_depth: worker_queue_depth.max(1),
            default_idle_timeout_secs,
            scheduler_empty_warn_count,
            alert_max_timeout_secs,
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides);
        }

        Ok(config)
    }

    pub fn default_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.default_idle_timeout_secs)
    }

    pub fn alert_max_timeout(&self) -> Duration {
        Duration::from_secs(self.alert_max_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_backend_kind_parses_aliases() {
        assert_eq!(LeaseBackendKind::parse("Memory"), Some(LeaseBackendKind::Memory));
        assert_eq!(LeaseBackendKind::parse(" lockfile "), Some(LeaseBackendKind::File));
        assert_eq!(LeaseBackendKind::parse("etcd"), None);
    }

    #[test]
    fn overrides_fill_unset_fields() {
        let mut config = EngineConfig::default();
        let overrides: SetupConfigOverrides = serde_json::from_str(
            r#"{"max_running_jobs": 3, "lease_backend": "memory", "jobs_dir": " /srv/jobs "}"#,
        )
        .unwrap();
        apply_setup_overrides(&mut config, &overrides);
        assert_eq!(config.max_running_jobs, 3);
        assert_eq!(config.lease_backend, LeaseBackendKind::Memory);
        assert_eq!(config.jobs_dir, PathBuf::from("/srv/jobs"));
    }

    #[test]
    fn zero_overrides_are_ignored() {
        let mut config = EngineConfig::default();
        let overrides = SetupConfigOverrides {
            worker_queue_depth: Some(0),
            ..Default::default()
        };
        apply_setup_overrides(&mut config, &overrides);
        assert_eq!(config.worker_queue_depth, 64);
    }
}
