//! Platform declarations and the validated project model.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::arch::Architecture;
use super::base::Base;

/// One architecture entry in a `build-on` or `build-for` list.
///
/// `base` is only ever set under multi-base syntax (`ubuntu@22.04:amd64`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformItem {
    pub base: Option<Base>,
    pub arch: Architecture,
}

impl PlatformItem {
    pub fn arch(arch: Architecture) -> Self {
        Self { base: None, arch }
    }

    pub fn with_base(base: Base, arch: Architecture) -> Self {
        Self {
            base: Some(base),
            arch,
        }
    }
}

impl fmt::Display for PlatformItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.base {
            Some(base) => write!(f, "{}:{}", base, self.arch),
            None => write!(f, "{}", self.arch),
        }
    }
}

/// The `build-for` side of an explicit declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildForDeclaration {
    /// Architecture-independent output. May carry a base in multi-base form.
    AllArchitectures { base: Option<Base> },
    /// Non-empty list of concrete targets.
    Targets(Vec<PlatformItem>),
}

/// How a platform was declared in the project file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformDeclaration {
    /// No `build-on`/`build-for`: the label itself names the architecture.
    Shorthand,
    Explicit {
        build_on: Vec<PlatformItem>,
        build_for: BuildForDeclaration,
    },
}

/// One named platform declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformEntry {
    pub label: String,
    pub base_override: Option<Base>,
    pub declaration: PlatformDeclaration,
}

impl PlatformEntry {
    pub fn shorthand(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            base_override: None,
            declaration: PlatformDeclaration::Shorthand,
        }
    }

    pub fn explicit(
        label: impl Into<String>,
        build_on: Vec<PlatformItem>,
        build_for: BuildForDeclaration,
    ) -> Self {
        Self {
            label: label.into(),
            base_override: None,
            declaration: PlatformDeclaration::Explicit {
                build_on,
                build_for,
            },
        }
    }

    pub fn with_base_override(mut self, base: Base) -> Self {
        self.base_override = Some(base);
        self
    }

    /// Whether this entry uses multi-base syntax.
    pub fn is_multi_base(&self) -> bool {
        if self.base_override.is_some() {
            return true;
        }
        match &self.declaration {
            PlatformDeclaration::Shorthand => false,
            PlatformDeclaration::Explicit {
                build_on,
                build_for,
            } => {
                let for_has_base = match build_for {
                    BuildForDeclaration::AllArchitectures { base } => base.is_some(),
                    BuildForDeclaration::Targets(items) => items.iter().any(|i| i.base.is_some()),
                };
                for_has_base || build_on.iter().any(|i| i.base.is_some())
            }
        }
    }
}

/// Part definitions handed verbatim to the lifecycle runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartDefinitions(pub serde_json::Value);

impl PartDefinitions {
    pub fn empty() -> Self {
        Self(serde_json::Value::Object(Default::default()))
    }
}

/// Validated top-level project declaration. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSpec {
    pub name: String,
    pub top_level_base: Option<Base>,
    pub top_level_build_base: Option<Base>,
    /// Declaration order is preserved and is the default output order.
    pub platforms: Vec<PlatformEntry>,
    pub parts: PartDefinitions,
}

impl ProjectSpec {
    pub fn platform(&self, label: &str) -> Option<&PlatformEntry> {
        self.platforms.iter().find(|p| p.label == label)
    }

    /// Whether every platform entry carries its own base.
    pub fn is_multi_base(&self) -> bool {
        !self.platforms.is_empty() && self.platforms.iter().all(PlatformEntry::is_multi_base)
    }
}
