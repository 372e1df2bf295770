//! The parts lifecycle as seen by the orchestrator.
//!
//! A [`LifecycleRunner`] takes a leased environment, the project's part
//! definitions and one job's target, and leaves a primed file tree inside the
//! environment. [`CommandLifecycleRunner`] drives an external program through
//! the environment backend.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use multipack_core::{BuildJob, BuildPlatform, JobId, PartDefinitions, TargetPlatform};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{EnvironmentBackend, EnvironmentHandle, ExecCommand, ExecOutput};
use crate::error::{BackendResult, LifecycleError, LifecycleResult};
use crate::naming::sanitize;

/// Remote directory the project tree is pushed to.
pub const PROJECT_DIR: &str = "project";
/// Remote file holding the part definitions as JSON.
pub const PARTS_FILE: &str = "parts.json";

/// A leased environment together with the backend that owns it.
#[derive(Clone, Copy)]
pub struct EnvironmentSession<'a> {
    backend: &'a dyn EnvironmentBackend,
    handle: &'a EnvironmentHandle,
}

impl<'a> EnvironmentSession<'a> {
    pub fn new(backend: &'a dyn EnvironmentBackend, handle: &'a EnvironmentHandle) -> Self {
        Self { backend, handle }
    }

    pub fn handle(&self) -> &EnvironmentHandle {
        self.handle
    }

    pub async fn exec(&self, command: &ExecCommand) -> BackendResult<ExecOutput> {
        self.backend.exec(self.handle, command).await
    }

    pub async fn push(&self, local: &Path, remote: &str) -> BackendResult<()> {
        self.backend.push(self.handle, local, remote).await
    }

    pub async fn pull(&self, remote: &str, local: &Path) -> BackendResult<()> {
        self.backend.pull(self.handle, remote, local).await
    }
}

/// What one lifecycle run should produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleTarget {
    pub job: JobId,
    pub build_on: BuildPlatform,
    pub build_for: TargetPlatform,
    pub cross_compile: bool,
    /// Local project directory pushed into the environment.
    pub project_dir: PathBuf,
}

impl LifecycleTarget {
    pub fn for_job(job: &BuildJob, project_dir: &Path) -> Self {
        Self {
            job: job.id(),
            build_on: job.build_on.clone(),
            build_for: job.build_for.clone(),
            cross_compile: job.cross_compile,
            project_dir: project_dir.to_path_buf(),
        }
    }

    /// Per-job prime directory inside the environment, e.g. `prime/amd64-0`.
    pub fn prime_dir(&self) -> String {
        format!("prime/{}-{}", sanitize(&self.job.label), self.job.sequence_index)
    }
}

/// Location of a primed tree inside an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimedTree {
    pub remote_path: String,
}

#[async_trait]
pub trait LifecycleRunner: Send + Sync {
    async fn run_lifecycle(
        &self,
        session: &EnvironmentSession<'_>,
        parts: &PartDefinitions,
        target: &LifecycleTarget,
    ) -> LifecycleResult<PrimedTree>;
}

/// Runs an external lifecycle program inside the environment.
///
/// The program is started in the environment root with:
///
/// | variable                  | value                                  |
/// |---------------------------|----------------------------------------|
/// | `MULTIPACK_PROJECT_DIR`   | pushed project tree (`project`)        |
/// | `MULTIPACK_PARTS`         | part definitions as JSON (`parts.json`)|
/// | `MULTIPACK_PRIME_DIR`     | where primed files must be written     |
/// | `MULTIPACK_BUILD_ON`      | e.g. `ubuntu@24.04:amd64`              |
/// | `MULTIPACK_BUILD_FOR`     | e.g. `ubuntu@24.04:riscv64` or `:all`  |
/// | `MULTIPACK_CROSS_COMPILE` | `1` or `0`                             |
#[derive(Debug, Clone)]
pub struct CommandLifecycleRunner {
    argv: Vec<String>,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
}

impl CommandLifecycleRunner {
    pub fn new(argv: Vec<String>) -> LifecycleResult<Self> {
        if argv.is_empty() {
            return Err(LifecycleError::InvalidCommand(
                "lifecycle command is empty".to_string(),
            ));
        }
        Ok(Self {
            argv,
            env: BTreeMap::new(),
            timeout: None,
        })
    }

    /// Split a command line on whitespace.
    pub fn parse(command_line: &str) -> LifecycleResult<Self> {
        Self::new(command_line.split_whitespace().map(str::to_string).collect())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn command(&self, target: &LifecycleTarget) -> ExecCommand {
        let mut command = ExecCommand::new(self.argv.clone())
            .env("MULTIPACK_PROJECT_DIR", PROJECT_DIR)
            .env("MULTIPACK_PARTS", PARTS_FILE)
            .env("MULTIPACK_PRIME_DIR", target.prime_dir())
            .env("MULTIPACK_BUILD_ON", target.build_on.to_string())
            .env("MULTIPACK_BUILD_FOR", target.build_for.to_string())
            .env(
                "MULTIPACK_CROSS_COMPILE",
                if target.cross_compile { "1" } else { "0" },
            );
        for (key, value) in &self.env {
            command = command.env(key.clone(), value.clone());
        }
        if let Some(timeout) = self.timeout {
            command = command.timeout(timeout);
        }
        command
    }
}

#[async_trait]
impl LifecycleRunner for CommandLifecycleRunner {
    async fn run_lifecycle(
        &self,
        session: &EnvironmentSession<'_>,
        parts: &PartDefinitions,
        target: &LifecycleTarget,
    ) -> LifecycleResult<PrimedTree> {
        let prepare = |e: &dyn std::fmt::Display| LifecycleError::Prepare(e.to_string());

        session.push(&target.project_dir, PROJECT_DIR).await?;

        let scratch = tempfile::tempdir().map_err(|e| prepare(&e))?;
        let parts_path = scratch.path().join(PARTS_FILE);
        let parts_json = serde_json::to_vec_pretty(parts).map_err(|e| prepare(&e))?;
        tokio::fs::write(&parts_path, parts_json)
            .await
            .map_err(|e| prepare(&e))?;
        session.push(&parts_path, PARTS_FILE).await?;

        let prime_dir = target.prime_dir();
        let empty = scratch.path().join("prime");
        tokio::fs::create_dir_all(&empty)
            .await
            .map_err(|e| prepare(&e))?;
        session.push(&empty, &prime_dir).await?;

        debug!(job = %target.job, program = %self.argv[0], "starting lifecycle");
        let output = session.exec(&self.command(target)).await?;
        if !output.success() {
            return Err(LifecycleError::Failed {
                exit_code: output.exit_code,
                detail: tail(&output.stderr, 20),
            });
        }
        info!(
            job = %target.job,
            environment = %session.handle().name,
            duration_ms = output.duration_ms,
            "lifecycle completed"
        );
        Ok(PrimedTree {
            remote_path: prime_dir,
        })
    }
}

/// Last `lines` lines of `text`, trimmed.
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
