//! multipack core library
//!
//! Project model, validation and build plan resolution. Nothing in this crate
//! performs builds; see `multipack-build` for execution.

pub mod error;
pub mod model;
pub mod obs;
pub mod plan;
pub mod resolver;
pub mod telemetry;
pub mod validate;

pub use error::{PlanError, ResolutionError, Result, SchemaError};
pub use model::{
    Architecture, Base, BuildForDeclaration, BuildJob, BuildPlatform, JobId, PartDefinitions,
    PlatformDeclaration, PlatformEntry, PlatformItem, ProjectSpec, TargetArch, TargetPlatform,
    ALL_ARCHITECTURES,
};
pub use plan::{duplicate_groups, BuildPlan, ExecutionGroup, PlanFilter};
pub use resolver::resolve;
pub use telemetry::init_tracing;
pub use validate::{load_project, parse_project, PROJECT_FILE};
