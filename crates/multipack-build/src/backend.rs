//! Environment backends: where build jobs actually run.
//!
//! An [`EnvironmentBackend`] creates an isolated environment for one build-on
//! `(base, architecture)` key, runs commands inside it, and copies files in and
//! out. [`HostBackend`] is the built-in implementation: every environment is a
//! directory on the build host and commands run natively.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use multipack_core::BuildPlatform;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{BackendError, BackendResult};
use crate::naming::sanitize;

/// Identity of an environment: the build-on side of a job.
pub type EnvironmentKey = BuildPlatform;

/// Prefix shared by every environment name.
pub const ENVIRONMENT_PREFIX: &str = "multipack-";

/// Deterministic environment name for a key: `multipack-ubuntu-24.04-amd64`.
pub fn environment_name(key: &EnvironmentKey) -> String {
    format!("{ENVIRONMENT_PREFIX}{}", sanitize(&key.slug()))
}

/// Opaque reference to a live environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentHandle {
    pub name: String,
    pub key: EnvironmentKey,
}

impl EnvironmentHandle {
    pub fn for_key(key: &EnvironmentKey) -> Self {
        Self {
            name: environment_name(key),
            key: key.clone(),
        }
    }
}

/// A command to run inside an environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecCommand {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Working directory relative to the environment root.
    pub cwd: Option<String>,
    pub timeout: Option<Duration>,
}

impl ExecCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Captured result of an [`ExecCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An environment the backend knows about, as reported by [`EnvironmentBackend::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub name: String,
    /// `None` when creation stopped before the key was recorded.
    pub key: Option<EnvironmentKey>,
    /// Whether creation ran to completion.
    pub complete: bool,
}

/// Provider of isolated build environments.
///
/// Remote paths are relative to the environment root and may not escape it.
#[async_trait]
pub trait EnvironmentBackend: Send + Sync {
    /// Create a fresh environment for `key`, replacing any leftover one.
    async fn create(&self, key: &EnvironmentKey) -> BackendResult<EnvironmentHandle>;

    async fn exec(
        &self,
        handle: &EnvironmentHandle,
        command: &ExecCommand,
    ) -> BackendResult<ExecOutput>;

    /// Copy a local file or directory tree into the environment.
    async fn push(&self, handle: &EnvironmentHandle, local: &Path, remote: &str)
        -> BackendResult<()>;

    /// Copy a file or directory tree out of the environment.
    async fn pull(&self, handle: &EnvironmentHandle, remote: &str, local: &Path)
        -> BackendResult<()>;

    /// Destroy an environment by name. Destroying a missing environment is not an error.
    async fn destroy(&self, name: &str) -> BackendResult<()>;

    /// Every environment this backend currently holds.
    async fn list(&self) -> BackendResult<Vec<EnvironmentRecord>>;
}

/// Conventional state directory inside a project; never copied into environments.
pub const STATE_DIR_NAME: &str = ".multipack";

const READY_MARKER: &str = ".multipack-ready";
const KEY_FILE: &str = ".multipack-key.json";

/// Environments as directories under `<state_dir>/environments/`.
///
/// Commands run on the host itself, so only keys matching the host's own base
/// and architecture are meaningful (see `capability::NativeCapabilities`).
#[derive(Debug, Clone)]
pub struct HostBackend {
    root: PathBuf,
}

impl HostBackend {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            root: state_dir.as_ref().join("environments"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn environment_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    async fn existing_dir(&self, handle: &EnvironmentHandle) -> BackendResult<PathBuf> {
        let dir = self.environment_dir(&handle.name);
        if tokio::fs::try_exists(dir.join(READY_MARKER)).await? {
            Ok(dir)
        } else {
            Err(BackendError::NotFound(handle.name.clone()))
        }
    }
}

#[async_trait]
impl EnvironmentBackend for HostBackend {
    async fn create(&self, key: &EnvironmentKey) -> BackendResult<EnvironmentHandle> {
        let handle = EnvironmentHandle::for_key(key);
        let dir = self.environment_dir(&handle.name);
        if tokio::fs::try_exists(&dir).await? {
            debug!(environment = %handle.name, "removing leftover environment directory");
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;

        let key_json = serde_json::to_vec_pretty(key).map_err(io::Error::from)?;
        tokio::fs::write(dir.join(KEY_FILE), key_json).await?;
        // marker last: its presence means creation completed
        tokio::fs::write(dir.join(READY_MARKER), b"").await?;
        Ok(handle)
    }

    async fn exec(
        &self,
        handle: &EnvironmentHandle,
        command: &ExecCommand,
    ) -> BackendResult<ExecOutput> {
        let dir = self.existing_dir(handle).await?;
        let cwd = match &command.cwd {
            Some(cwd) => resolve_remote(&dir, cwd)?,
            None => dir,
        };
        let Some((program, args)) = command.argv.split_first() else {
            return Err(BackendError::Spawn {
                environment: handle.name.clone(),
                program: String::new(),
                reason: "empty command".to_string(),
            });
        };

        let start = Instant::now();
        let child = Command::new(program)
            .args(args)
            .envs(&command.env)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::Spawn {
                environment: handle.name.clone(),
                program: program.clone(),
                reason: e.to_string(),
            })?;

        let output = match command.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| BackendError::Timeout {
                    environment: handle.name.clone(),
                    timeout_ms: limit.as_millis() as u64,
                })??,
            None => child.wait_with_output().await?,
        };

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn push(
        &self,
        handle: &EnvironmentHandle,
        local: &Path,
        remote: &str,
    ) -> BackendResult<()> {
        let dir = self.existing_dir(handle).await?;
        let dest = resolve_remote(&dir, remote)?;
        let src = local.to_path_buf();
        let copied = tokio::task::spawn_blocking(move || copy_tree(&src, &dest, true))
            .await
            .map_err(|e| BackendError::Transfer(e.to_string()))??;
        debug!(environment = %handle.name, remote = %remote, files = copied, "pushed");
        Ok(())
    }

    async fn pull(
        &self,
        handle: &EnvironmentHandle,
        remote: &str,
        local: &Path,
    ) -> BackendResult<()> {
        let dir = self.existing_dir(handle).await?;
        let src = resolve_remote(&dir, remote)?;
        if !tokio::fs::try_exists(&src).await? {
            return Err(BackendError::Transfer(format!(
                "'{remote}' does not exist in '{}'",
                handle.name
            )));
        }
        let dest = local.to_path_buf();
        let copied = tokio::task::spawn_blocking(move || copy_tree(&src, &dest, false))
            .await
            .map_err(|e| BackendError::Transfer(e.to_string()))??;
        debug!(environment = %handle.name, remote = %remote, files = copied, "pulled");
        Ok(())
    }

    async fn destroy(&self, name: &str) -> BackendResult<()> {
        match tokio::fs::remove_dir_all(self.environment_dir(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> BackendResult<Vec<EnvironmentRecord>> {
        let mut records = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(ENVIRONMENT_PREFIX) || !entry.file_type().await?.is_dir() {
                continue;
            }
            let dir = entry.path();
            let key = match tokio::fs::read(dir.join(KEY_FILE)).await {
                Ok(bytes) => serde_json::from_slice::<EnvironmentKey>(&bytes).ok(),
                Err(_) => None,
            };
            let complete = key.is_some() && tokio::fs::try_exists(dir.join(READY_MARKER)).await?;
            records.push(EnvironmentRecord {
                name,
                key,
                complete,
            });
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}

/// Join a remote path onto an environment root, refusing anything that escapes it.
pub(crate) fn resolve_remote(root: &Path, remote: &str) -> BackendResult<PathBuf> {
    let relative = Path::new(remote);
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(BackendError::InvalidPath {
                    path: remote.to_string(),
                    reason: "must be relative and stay inside the environment".to_string(),
                })
            }
        }
    }
    Ok(root.join(relative))
}

/// Copy a file or a directory tree. Returns the number of files copied.
///
/// When `dst` lies inside `src` the destination subtree is not descended into.
/// With `skip_state`, a top-level [`STATE_DIR_NAME`] directory in `src` is left out.
pub(crate) fn copy_tree(src: &Path, dst: &Path, skip_state: bool) -> io::Result<u64> {
    if fs::metadata(src)?.is_file() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst)?;
        return Ok(1);
    }

    fs::create_dir_all(dst)?;
    let src = src.canonicalize()?;
    let skip = dst.canonicalize()?;

    let mut copied = 0;
    let walker = WalkDir::new(&src)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let state_dir = skip_state && e.depth() == 1 && e.file_name() == STATE_DIR_NAME;
            e.depth() == 0 || (e.path() != skip && !state_dir)
        });
    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(&src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.path().is_file() {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}
