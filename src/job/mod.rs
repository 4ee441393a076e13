pub mod registry;
pub mod types;
pub mod update;

pub use registry::JobRegistry;
pub use types::{
    AnalysisConfig, AnalysisLimits, DataCounts, DataDescription, DataFormat, DataSource, Detector,
    IgnoreDowntime, Job, JobConfig, JobStatus, SchedulerConfig, SchedulerState, TransformConfig,
};
pub use update::{Mutation, UpdatePlan, UpdateRegistry, Updater};
