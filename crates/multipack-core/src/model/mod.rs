//! Domain model for multipack.
//!
//! Canonical definitions for the core entities:
//! - `Architecture` / `TargetArch`: known CPU architectures and the wildcard
//! - `Base` / `BuildPlatform`: operating-system bases and build-on pairs
//! - `PlatformEntry` / `ProjectSpec`: the validated platform declaration
//! - `BuildJob`: one resolved unit of work

pub mod arch;
pub mod base;
pub mod job;
pub mod platform;

pub use arch::{Architecture, TargetArch, UnknownArchitecture, ALL_ARCHITECTURES};
pub use base::{Base, BuildPlatform, InvalidBase};
pub use job::{BuildJob, JobId, TargetPlatform};
pub use platform::{
    BuildForDeclaration, PartDefinitions, PlatformDeclaration, PlatformEntry, PlatformItem,
    ProjectSpec,
};
