//! Job-scoped error types.
//!
//! None of these abort a run; the orchestrator records them in the job's
//! `BuildResult`.

/// Errors reported by an environment backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("environment '{0}' does not exist")]
    NotFound(String),

    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("failed to start '{program}' in '{environment}': {reason}")]
    Spawn {
        environment: String,
        program: String,
        reason: String,
    },

    #[error("command timed out after {timeout_ms}ms in '{environment}'")]
    Timeout { environment: String, timeout_ms: u64 },

    #[error("file transfer failed: {0}")]
    Transfer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// An environment could not be made available.
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("failed to provision {key}: {source}")]
    Backend {
        key: String,
        #[source]
        source: BackendError,
    },

    #[error("stale environment reconciliation failed: {0}")]
    Reconcile(#[source] BackendError),
}

pub type ProvisioningResult<T> = std::result::Result<T, ProvisioningError>;

/// The external lifecycle step failed.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("lifecycle exited with status {exit_code}: {detail}")]
    Failed { exit_code: i32, detail: String },

    #[error("lifecycle interrupted: run cancelled")]
    Cancelled,

    #[error("invalid lifecycle command: {0}")]
    InvalidCommand(String),

    #[error("failed to prepare lifecycle inputs: {0}")]
    Prepare(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;

/// A primed tree could not be turned into an artifact.
#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    #[error("invalid artifact name '{0}'")]
    InvalidName(String),

    #[error("failed to archive primed tree: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("failed to walk primed tree: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("collector task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CollectionResult<T> = std::result::Result<T, CollectionError>;
