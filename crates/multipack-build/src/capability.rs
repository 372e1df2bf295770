//! Host capability queries.
//!
//! Before a job is dispatched the orchestrator asks whether its build-on key
//! can be provisioned at all. Rejected jobs are skipped with the reason
//! instead of failing in the provisioner.

use async_trait::async_trait;
use multipack_core::{Architecture, Base};
use serde::{Deserialize, Serialize};

use crate::backend::EnvironmentKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "capability", rename_all = "snake_case")]
pub enum Capability {
    Supported,
    Unsupported { reason: String },
}

impl Capability {
    pub fn is_supported(&self) -> bool {
        matches!(self, Capability::Supported)
    }
}

#[async_trait]
pub trait HostCapabilities: Send + Sync {
    async fn check(&self, key: &EnvironmentKey) -> Capability;
}

/// Capabilities of [`crate::backend::HostBackend`]: only the host's own base
/// and architecture can be built on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCapabilities {
    pub arch: Option<Architecture>,
    pub base: Option<Base>,
}

impl NativeCapabilities {
    /// Inspect the running host.
    pub fn detect() -> Self {
        let base = std::fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|text| parse_os_release(&text));
        Self {
            arch: Architecture::host(),
            base,
        }
    }
}

#[async_trait]
impl HostCapabilities for NativeCapabilities {
    async fn check(&self, key: &EnvironmentKey) -> Capability {
        match self.arch {
            Some(arch) if arch == key.arch => {}
            Some(arch) => {
                return Capability::Unsupported {
                    reason: format!("host architecture is {arch}, cannot build on {}", key.arch),
                }
            }
            None => {
                return Capability::Unsupported {
                    reason: format!(
                        "host architecture '{}' is not supported",
                        std::env::consts::ARCH
                    ),
                }
            }
        }
        match &self.base {
            Some(base) if base == &key.base => Capability::Supported,
            Some(base) => Capability::Unsupported {
                reason: format!("host base is {base}, cannot build on {}", key.base),
            },
            None => Capability::Unsupported {
                reason: "could not determine the host base from /etc/os-release".to_string(),
            },
        }
    }
}

/// Extract `ID@VERSION_ID` from an os-release file.
pub fn parse_os_release(text: &str) -> Option<Base> {
    let mut id = None;
    let mut version = None;
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'');
        match key.trim() {
            "ID" => id = Some(value.to_string()),
            "VERSION_ID" => version = Some(value.to_string()),
            _ => {}
        }
    }
    match (id, version) {
        (Some(id), Some(version)) if !id.is_empty() && !version.is_empty() => {
            Some(Base::new(id, version))
        }
        _ => None,
    }
}
