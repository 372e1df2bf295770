//! Operating-system bases (`distro@release`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::arch::Architecture;

/// A `(distribution, release)` pair, written `distro@release`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Base {
    pub distribution: String,
    pub release: String,
}

/// Error returned when a base string is not `distro@release`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid base '{0}': expected '<distribution>@<release>'")]
pub struct InvalidBase(pub String);

impl Base {
    pub fn new(distribution: impl Into<String>, release: impl Into<String>) -> Self {
        Self {
            distribution: distribution.into(),
            release: release.into(),
        }
    }

    /// Whether this release has a short support window.
    ///
    /// Ubuntu releases other than LTS (`YY.04` with an even `YY`) are interim,
    /// as is the rolling `devel` release. Other distributions are never interim.
    pub fn is_interim(&self) -> bool {
        if self.distribution != "ubuntu" {
            return false;
        }
        if self.release == "devel" {
            return true;
        }
        match self.release.split_once('.') {
            Some((year, month)) => match year.parse::<u32>() {
                Ok(year) => !(year % 2 == 0 && month == "04"),
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Filesystem- and name-safe rendering: `ubuntu-24.04`.
    pub fn slug(&self) -> String {
        format!("{}-{}", self.distribution, self.release)
    }
}

impl fmt::Display for Base {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.distribution, self.release)
    }
}

impl FromStr for Base {
    type Err = InvalidBase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid_part = |part: &str| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        };
        match s.split_once('@') {
            Some((distro, release)) if valid_part(distro) && valid_part(release) => {
                Ok(Base::new(distro, release))
            }
            _ => Err(InvalidBase(s.to_string())),
        }
    }
}

impl From<Base> for String {
    fn from(base: Base) -> Self {
        base.to_string()
    }
}

impl TryFrom<String> for Base {
    type Error = InvalidBase;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// The build-on side of a job: a concrete base and architecture.
///
/// This pair is also the identity of an execution environment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BuildPlatform {
    pub base: Base,
    pub arch: Architecture,
}

impl BuildPlatform {
    pub fn new(base: Base, arch: Architecture) -> Self {
        Self { base, arch }
    }

    /// `ubuntu-24.04-amd64`
    pub fn slug(&self) -> String {
        format!("{}-{}", self.base.slug(), self.arch)
    }
}

impl fmt::Display for BuildPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.base, self.arch)
    }
}
