//! CPU architectures a platform may build on or build for.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Token used in `build-for` to declare an architecture-independent artifact.
pub const ALL_ARCHITECTURES: &str = "all";

/// Known CPU architectures, named the way Debian-family distributions name them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Amd64,
    Arm64,
    Armhf,
    I386,
    Ppc64el,
    Riscv64,
    S390x,
}

impl Architecture {
    /// Every known architecture, in canonical order.
    pub const ALL: [Architecture; 7] = [
        Architecture::Amd64,
        Architecture::Arm64,
        Architecture::Armhf,
        Architecture::I386,
        Architecture::Ppc64el,
        Architecture::Riscv64,
        Architecture::S390x,
    ];

    /// Returns the lowercase identifier for this architecture.
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
            Architecture::Armhf => "armhf",
            Architecture::I386 => "i386",
            Architecture::Ppc64el => "ppc64el",
            Architecture::Riscv64 => "riscv64",
            Architecture::S390x => "s390x",
        }
    }

    /// Map a Rust target architecture name (`std::env::consts::ARCH`).
    pub fn from_rust_arch(arch: &str) -> Option<Self> {
        match arch {
            "x86_64" => Some(Architecture::Amd64),
            "aarch64" => Some(Architecture::Arm64),
            "arm" => Some(Architecture::Armhf),
            "x86" => Some(Architecture::I386),
            "powerpc64" => Some(Architecture::Ppc64el),
            "riscv64" => Some(Architecture::Riscv64),
            "s390x" => Some(Architecture::S390x),
            _ => None,
        }
    }

    /// Detect the architecture of the running host.
    ///
    /// Returns `None` if the host architecture is not a known one.
    pub fn host() -> Option<Self> {
        Self::from_rust_arch(std::env::consts::ARCH)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string names no known architecture.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown architecture '{0}'")]
pub struct UnknownArchitecture(pub String);

impl FromStr for Architecture {
    type Err = UnknownArchitecture;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Architecture::ALL
            .iter()
            .copied()
            .find(|arch| arch.as_str() == s)
            .ok_or_else(|| UnknownArchitecture(s.to_string()))
    }
}

/// Architecture on the build-for side: concrete, or the wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TargetArch {
    Arch(Architecture),
    All,
}

impl TargetArch {
    /// The concrete architecture, if this is not the wildcard.
    pub fn concrete(&self) -> Option<Architecture> {
        match self {
            TargetArch::Arch(arch) => Some(*arch),
            TargetArch::All => None,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, TargetArch::All)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetArch::Arch(arch) => arch.as_str(),
            TargetArch::All => ALL_ARCHITECTURES,
        }
    }
}

impl fmt::Display for TargetArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Architecture> for TargetArch {
    fn from(arch: Architecture) -> Self {
        TargetArch::Arch(arch)
    }
}

impl FromStr for TargetArch {
    type Err = UnknownArchitecture;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == ALL_ARCHITECTURES {
            return Ok(TargetArch::All);
        }
        s.parse().map(TargetArch::Arch)
    }
}

impl From<TargetArch> for String {
    fn from(target: TargetArch) -> Self {
        target.as_str().to_string()
    }
}

impl TryFrom<String> for TargetArch {
    type Error = UnknownArchitecture;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
