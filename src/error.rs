use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::PoisonError;

/// Stable machine-readable error codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MissingJobError,
    NativeProcessConcurrentUse,
    InvalidValue,
    InvalidUpdateKey,
    InvalidThresholdArgument,
    NoSuchScheduledJob,
    JobNotRunning,
    TooManyJobsRunningConcurrently,
    JobIdAlreadyExists,
    NoSuchModelSnapshot,
    CannotDeleteJobScheduler,
    UnexpectedJobState,
    DataParseError,
    DataReadError,
    DatastoreError,
    NativeProcessError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MissingJobError => "MISSING_JOB_ERROR",
            ErrorCode::NativeProcessConcurrentUse => "NATIVE_PROCESS_CONCURRENT_USE",
            ErrorCode::InvalidValue => "INVALID_VALUE",
            ErrorCode::InvalidUpdateKey => "INVALID_UPDATE_KEY",
            ErrorCode::InvalidThresholdArgument => "INVALID_THRESHOLD_ARGUMENT",
            ErrorCode::NoSuchScheduledJob => "NO_SUCH_SCHEDULED_JOB",
            ErrorCode::JobNotRunning => "JOB_NOT_RUNNING",
            ErrorCode::TooManyJobsRunningConcurrently => "TOO_MANY_JOBS_RUNNING_CONCURRENTLY",
            ErrorCode::JobIdAlreadyExists => "JOB_ID_ALREADY_EXISTS",
            ErrorCode::NoSuchModelSnapshot => "NO_SUCH_MODEL_SNAPSHOT",
            ErrorCode::CannotDeleteJobScheduler => "CANNOT_DELETE_JOB_SCHEDULER",
            ErrorCode::UnexpectedJobState => "UNEXPECTED_JOB_STATE",
            ErrorCode::DataParseError => "DATA_PARSE_ERROR",
            ErrorCode::DataReadError => "DATA_READ_ERROR",
            ErrorCode::DatastoreError => "DATASTORE_ERROR",
            ErrorCode::NativeProcessError => "NATIVE_PROCESS_ERROR",
        }
    }

    /// Contention errors the caller may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::NativeProcessConcurrentUse | ErrorCode::TooManyJobsRunningConcurrently
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("No known job with id '{job_id}'")]
    MissingJob { job_id: String },

    #[error("{}", job_in_use_message(.job_id, .holder.as_deref(), .action))]
    JobInUse {
        job_id: String,
        holder: Option<String>,
        action: String,
    },

    #[error("{message}")]
    InvalidValue { message: String },

    #[error("Invalid update key '{key}'")]
    InvalidUpdateKey { key: String },

    #[error("{message}")]
    InvalidThresholdArgument { message: String },

    #[error("There is no job '{job_id}' with a scheduler configured")]
    NoSuchScheduledJob { job_id: String },

    #[error("Job '{job_id}' has no running analytics worker on this node")]
    JobNotRunning { job_id: String },

    #[error("Cannot open job '{job_id}': {limit} jobs are already running on this node")]
    TooManyJobs { job_id: String, limit: usize },

    #[error("The job cannot be created with the id '{job_id}'. The id is already used.")]
    JobAlreadyExists { job_id: String },

    #[error("No model snapshot matching {selector} exists for job '{job_id}'")]
    UnknownSnapshot { job_id: String, selector: String },

    #[error("Cannot delete job '{job_id}' while its scheduler is {scheduler_state}")]
    CannotDeleteScheduledJob {
        job_id: String,
        scheduler_state: String,
    },

    #[error("Job '{job_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("Failed to parse input data: {message}")]
    DataParse { message: String },

    #[error("Failed to read input data: {0}")]
    Io(#[from] std::io::Error),

    #[error("Result store error: {message}")]
    Store { message: String },

    #[error("Analytics worker for job '{job_id}' failed: {message}")]
    Worker { job_id: String, message: String },
}

fn job_in_use_message(job_id: &str, holder: Option<&str>, action: &str) -> String {
    match holder {
        Some(holder) => format!(
            "Cannot {action} job '{job_id}' while another connection ({holder}) is using it"
        ),
        None => format!("Cannot {action} job '{job_id}' while another connection is using it"),
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

impl EngineError {
    pub fn missing_job(job_id: impl Into<String>) -> Self {
        EngineError::MissingJob {
            job_id: job_id.into(),
        }
    }

    pub fn invalid_value(message: impl Into<String>) -> Self {
        EngineError::InvalidValue {
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        EngineError::Store {
            message: message.into(),
        }
    }

    pub fn worker(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Worker {
            job_id: job_id.into(),
            message: message.into(),
        }
    }

    pub fn data_parse(message: impl Into<String>) -> Self {
        EngineError::DataParse {
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::MissingJob { .. } => ErrorCode::MissingJobError,
            EngineError::JobInUse { .. } => ErrorCode::NativeProcessConcurrentUse,
            EngineError::InvalidValue { .. } => ErrorCode::InvalidValue,
            EngineError::InvalidUpdateKey { .. } => ErrorCode::InvalidUpdateKey,
            EngineError::InvalidThresholdArgument { .. } => ErrorCode::InvalidThresholdArgument,
            EngineError::NoSuchScheduledJob { .. } => ErrorCode::NoSuchScheduledJob,
            EngineError::JobNotRunning { .. } => ErrorCode::JobNotRunning,
            EngineError::TooManyJobs { .. } => ErrorCode::TooManyJobsRunningConcurrently,
            EngineError::JobAlreadyExists { .. } => ErrorCode::JobIdAlreadyExists,
            EngineError::UnknownSnapshot { .. } => ErrorCode::NoSuchModelSnapshot,
            EngineError::CannotDeleteScheduledJob { .. } => ErrorCode::CannotDeleteJobScheduler,
            EngineError::InvalidTransition { .. } => ErrorCode::UnexpectedJobState,
            EngineError::DataParse { .. } => ErrorCode::DataParseError,
            EngineError::Io(_) => ErrorCode::DataReadError,
            EngineError::Store { .. } => ErrorCode::DatastoreError,
            EngineError::Worker { .. } => ErrorCode::NativeProcessError,
        }
    }

    pub fn is_job_in_use(&self) -> bool {
        matches!(self, EngineError::JobInUse { .. })
    }

    pub fn to_api_error(&self) -> ApiError {
        let details = match self {
            EngineError::JobInUse {
                job_id,
                holder,
                action,
            } => Some(serde_json::json!({
                "job_id": job_id,
                "holder": holder,
                "action": action,
            })),
            EngineError::InvalidUpdateKey { key } => Some(serde_json::json!({ "key": key })),
            EngineError::TooManyJobs { limit, .. } => {
                Some(serde_json::json!({ "max_running_jobs": limit }))
            }
            _ => None,
        };
        ApiError {
            code: self.code(),
            message: self.to_string(),
            details,
        }
    }
}

/// Converts a lock poison error to a store error.
pub(crate) fn poison_err<T>(_: PoisonError<T>) -> EngineError {
    EngineError::store("lock poisoned")
}

/// Error envelope returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&EngineError> for ApiError {
    fn from(err: &EngineError) -> Self {
        err.to_api_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_in_use_maps_to_concurrent_use_code() {
        let err = EngineError::JobInUse {
            job_id: "farm-1".to_string(),
            holder: Some("node-b".to_string()),
            action: "flush".to_string(),
        };
        assert_eq!(err.code(), ErrorCode::NativeProcessConcurrentUse);
        assert!(err.code().is_retryable());
        assert!(err.to_string().contains("node-b"));

        let api = err.to_api_error();
        let json = serde_json::to_value(&api).unwrap();
        assert_eq!(json["code"], "NATIVE_PROCESS_CONCURRENT_USE");
        assert_eq!(json["details"]["action"], "flush");
    }

    #[test]
    fn codes_serialize_like_as_str() {
        for code in [
            ErrorCode::MissingJobError,
            ErrorCode::InvalidUpdateKey,
            ErrorCode::InvalidThresholdArgument,
            ErrorCode::NoSuchScheduledJob,
            ErrorCode::TooManyJobsRunningConcurrently,
        ] {
            let json = serde_json::to_value(code).unwrap();
            assert_eq!(json, serde_json::Value::String(code.as_str().to_string()));
        }
    }

    #[test]
    fn validation_errors_are_not_retryable() {
        let err = EngineError::invalid_value("bucketSpan must be positive");
        assert_eq!(err.code(), ErrorCode::InvalidValue);
        assert!(!err.code().is_retryable());
        assert!(err.to_api_error().details.is_none());
    }
}
