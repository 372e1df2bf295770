//! multipack build library
//!
//! Takes resolved [`BuildJob`](multipack_core::BuildJob)s and turns them into
//! artifacts: provisions one isolated environment per build-on key, runs the
//! packaging lifecycle inside it and archives the primed tree.

pub mod backend;
pub mod capability;
pub mod collector;
pub mod error;
pub mod fakes;
pub mod lifecycle;
pub mod naming;
pub mod orchestrator;
pub mod provisioner;
pub mod report;

pub use backend::{
    environment_name, EnvironmentBackend, EnvironmentHandle, EnvironmentKey, EnvironmentRecord,
    ExecCommand, ExecOutput, HostBackend, STATE_DIR_NAME,
};
pub use capability::{Capability, HostCapabilities, NativeCapabilities};
pub use collector::{ArtifactCollector, CollectedArtifact};
pub use error::{
    BackendError, BackendResult, CollectionError, CollectionResult, LifecycleError,
    LifecycleResult, ProvisioningError, ProvisioningResult,
};
pub use lifecycle::{
    CommandLifecycleRunner, EnvironmentSession, LifecycleRunner, LifecycleTarget, PrimedTree,
};
pub use naming::{artifact_names, artifact_names_with_extension};
pub use orchestrator::{
    ConcurrencyPolicy, ExecuteOptions, FailurePolicy, JobPhase, Orchestrator, OrchestratorConfig,
    RetryPolicy, RunCancellation,
};
pub use provisioner::{EnvironmentCache, EnvironmentLease, EnvironmentState, RetentionPolicy};
pub use report::{BuildResult, BuildStage, JobOutcome, OutcomeCounts, RunReport, RunStatus};
