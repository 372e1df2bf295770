//! Error taxonomy for planning: schema validation and plan resolution.
//!
//! Both kinds are fatal for a run: they surface before any environment is
//! provisioned.

/// A malformed or contradictory project declaration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid project at '{path}': {message}")]
pub struct SchemaError {
    /// Dotted key path of the offending value, e.g. `platforms.arm.build-for[0]`.
    pub path: String,
    pub message: String,
}

impl SchemaError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Errors produced while expanding a validated spec into jobs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("platform '{label}' targets interim release {base} but no build-base is set")]
    MissingBuildBase { label: String, base: String },

    #[error("internal resolver invariant violated for platform '{label}': {detail}")]
    Internal { label: String, detail: String },
}

/// Anything that can stop a build plan from being produced.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("no platform named '{0}' in the build plan")]
    UnknownPlatform(String),

    #[error("failed to read project file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for planning operations.
pub type Result<T> = std::result::Result<T, PlanError>;
