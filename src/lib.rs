//! Control plane for a streaming anomaly-detection service.
//!
//! Jobs wrap one long-lived analytics worker each. The [`engine::Engine`]
//! wires the components of one API node together: the [`job::JobRegistry`],
//! the cluster-wide [`lease::WriteExclusivityGuard`], the
//! [`ingest::IngestionPipeline`], the [`scheduler::SchedulerController`] and
//! the [`snapshot::SnapshotManager`]. Nodes share a [`store::ResultStore`] and a
//! [`lease::LeaseBackend`].

pub mod alerts;
pub mod config;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod job;
pub mod lease;
pub mod normalizer;
pub mod results;
pub mod retention;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod validation;
pub mod worker;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{ApiError, EngineError, ErrorCode, Result};
