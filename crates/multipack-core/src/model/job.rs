//! Concrete build jobs produced by the resolver.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::arch::TargetArch;
use super::base::{Base, BuildPlatform};

/// The build-for side of a job: a base and a concrete or wildcard architecture.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetPlatform {
    pub base: Base,
    pub arch: TargetArch,
}

impl TargetPlatform {
    pub fn new(base: Base, arch: impl Into<TargetArch>) -> Self {
        Self {
            base,
            arch: arch.into(),
        }
    }

    pub fn all(base: Base) -> Self {
        Self {
            base,
            arch: TargetArch::All,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.arch.is_wildcard()
    }

    /// `ubuntu-24.04-riscv64` or `ubuntu-24.04-all`
    pub fn slug(&self) -> String {
        format!("{}-{}", self.base.slug(), self.arch)
    }
}

impl fmt::Display for TargetPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.base, self.arch)
    }
}

/// Stable identity of a job within one plan: `label#sequence_index`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId {
    pub label: String,
    pub sequence_index: usize,
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.label, self.sequence_index)
    }
}

/// One concrete unit of work. Immutable once created by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildJob {
    /// Label of the platform entry this job came from.
    pub platform_label: String,
    /// Host environment the job runs in.
    pub build_on: BuildPlatform,
    /// Target the artifact is for.
    pub build_for: TargetPlatform,
    /// Emission index among the jobs sharing `platform_label`.
    pub sequence_index: usize,
    /// Set when build-on and build-for name different concrete architectures.
    pub cross_compile: bool,
}

impl BuildJob {
    pub fn id(&self) -> JobId {
        JobId {
            label: self.platform_label.clone(),
            sequence_index: self.sequence_index,
        }
    }

    /// The environment key this job must be provisioned on.
    pub fn environment_key(&self) -> &BuildPlatform {
        &self.build_on
    }
}
