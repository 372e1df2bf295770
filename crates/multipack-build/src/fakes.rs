//! In-memory fakes for the collaborator traits (testing only).
//!
//! `MemoryBackend`, `ScriptedLifecycle` and `StaticCapabilities` satisfy the
//! trait contracts without touching the host, and record enough about their
//! calls for tests to assert on ordering and exclusivity.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use multipack_core::{JobId, PartDefinitions};
use walkdir::WalkDir;

use crate::backend::{
    environment_name, EnvironmentBackend, EnvironmentHandle, EnvironmentKey, EnvironmentRecord,
    ExecCommand, ExecOutput,
};
use crate::capability::{Capability, HostCapabilities};
use crate::error::{BackendError, BackendResult, LifecycleError, LifecycleResult};
use crate::lifecycle::{EnvironmentSession, LifecycleRunner, LifecycleTarget, PrimedTree};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// MemoryBackend
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryEnvironment {
    key: Option<EnvironmentKey>,
    complete: bool,
    files: BTreeMap<String, Vec<u8>>,
}

/// Environments as in-memory file maps.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    environments: Mutex<BTreeMap<String, MemoryEnvironment>>,
    create_failures: Mutex<HashMap<EnvironmentKey, u32>>,
    creates: AtomicUsize,
    destroyed: Mutex<Vec<String>>,
    exec_log: Mutex<Vec<(String, Vec<String>)>>,
    create_delay: Option<Duration>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every `create`.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Make the next `times` creates for `key` fail.
    pub fn fail_create(&self, key: &EnvironmentKey, times: u32) {
        lock(&self.create_failures).insert(key.clone(), times);
    }

    /// Leave an environment whose creation never completed.
    pub fn seed_stale(&self, name: &str) {
        lock(&self.environments).insert(name.to_string(), MemoryEnvironment::default());
    }

    /// Successful creates so far.
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Names of environments that currently exist, sorted.
    pub fn live_environments(&self) -> Vec<String> {
        lock(&self.environments).keys().cloned().collect()
    }

    pub fn destroyed(&self) -> Vec<String> {
        lock(&self.destroyed).clone()
    }

    pub fn exec_log(&self) -> Vec<(String, Vec<String>)> {
        lock(&self.exec_log).clone()
    }

    /// Read one file from an environment.
    pub fn read_file(&self, environment: &str, remote: &str) -> Option<Vec<u8>> {
        lock(&self.environments)
            .get(environment)
            .and_then(|env| env.files.get(&normalize(remote)).cloned())
    }

    fn with_env<T>(
        &self,
        handle: &EnvironmentHandle,
        f: impl FnOnce(&mut MemoryEnvironment) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let mut envs = lock(&self.environments);
        match envs.get_mut(&handle.name) {
            Some(env) if env.complete => f(env),
            _ => Err(BackendError::NotFound(handle.name.clone())),
        }
    }
}

fn normalize(remote: &str) -> String {
    remote
        .trim_start_matches("./")
        .trim_end_matches('/')
        .to_string()
}

#[async_trait]
impl EnvironmentBackend for MemoryBackend {
    async fn create(&self, key: &EnvironmentKey) -> BackendResult<EnvironmentHandle> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        {
            let mut failures = lock(&self.create_failures);
            if let Some(remaining) = failures.get_mut(key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BackendError::Unavailable(format!("no image for {key}")));
                }
            }
        }
        let name = environment_name(key);
        lock(&self.environments).insert(
            name.clone(),
            MemoryEnvironment {
                key: Some(key.clone()),
                complete: true,
                files: BTreeMap::new(),
            },
        );
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(EnvironmentHandle {
            name,
            key: key.clone(),
        })
    }

    async fn exec(
        &self,
        handle: &EnvironmentHandle,
        command: &ExecCommand,
    ) -> BackendResult<ExecOutput> {
        self.with_env(handle, |_| Ok(()))?;
        lock(&self.exec_log).push((handle.name.clone(), command.argv.clone()));
        Ok(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
        })
    }

    async fn push(
        &self,
        handle: &EnvironmentHandle,
        local: &Path,
        remote: &str,
    ) -> BackendResult<()> {
        let remote = normalize(remote);
        let mut files = Vec::new();
        if local.is_file() {
            files.push((remote.clone(), std::fs::read(local)?));
        } else {
            for entry in WalkDir::new(local).min_depth(1) {
                let entry = entry.map_err(|e| BackendError::Transfer(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(local)
                    .map_err(|e| BackendError::Transfer(e.to_string()))?
                    .to_string_lossy()
                    .replace('\\', "/");
                let path = if remote.is_empty() {
                    relative
                } else {
                    format!("{remote}/{relative}")
                };
                files.push((path, std::fs::read(entry.path())?));
            }
        }
        self.with_env(handle, |env| {
            env.files.extend(files);
            Ok(())
        })
    }

    async fn pull(
        &self,
        handle: &EnvironmentHandle,
        remote: &str,
        local: &Path,
    ) -> BackendResult<()> {
        let remote = normalize(remote);
        let prefix = format!("{remote}/");
        let files: Vec<(String, Vec<u8>)> = self.with_env(handle, |env| {
            Ok(env
                .files
                .iter()
                .filter(|(path, _)| **path == remote || path.starts_with(&prefix))
                .map(|(path, data)| (path.clone(), data.clone()))
                .collect())
        })?;

        if files.is_empty() {
            // an empty directory pushed earlier leaves no entries behind
            return Err(BackendError::Transfer(format!(
                "'{remote}' does not exist in '{}'",
                handle.name
            )));
        }
        for (path, data) in files {
            let target = if path == remote {
                local.to_path_buf()
            } else {
                local.join(&path[prefix.len()..])
            };
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, data)?;
        }
        Ok(())
    }

    async fn destroy(&self, name: &str) -> BackendResult<()> {
        if lock(&self.environments).remove(name).is_some() {
            lock(&self.destroyed).push(name.to_string());
        }
        Ok(())
    }

    async fn list(&self) -> BackendResult<Vec<EnvironmentRecord>> {
        Ok(lock(&self.environments)
            .iter()
            .map(|(name, env)| EnvironmentRecord {
                name: name.clone(),
                key: env.key.clone(),
                complete: env.complete,
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// ScriptedLifecycle
// ---------------------------------------------------------------------------

/// One recorded lifecycle invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleCall {
    pub job: JobId,
    pub environment: String,
}

/// Lifecycle runner whose behavior is scripted per platform label.
///
/// By default every run succeeds and writes `artifact.txt` naming the target
/// into the job's prime directory.
#[derive(Debug, Default)]
pub struct ScriptedLifecycle {
    failures: HashMap<String, String>,
    hangs: HashSet<String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<LifecycleCall>>,
    active: Mutex<HashMap<String, usize>>,
    max_active_per_environment: AtomicUsize,
}

impl ScriptedLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs of `label` fail with `reason`.
    pub fn fail_label(mut self, label: &str, reason: &str) -> Self {
        self.failures.insert(label.to_string(), reason.to_string());
        self
    }

    /// Jobs of `label` never finish on their own.
    pub fn hang_label(mut self, label: &str) -> Self {
        self.hangs.insert(label.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<LifecycleCall> {
        lock(&self.calls).clone()
    }

    /// Highest number of simultaneous runs seen in any single environment.
    pub fn max_concurrent_per_environment(&self) -> usize {
        self.max_active_per_environment.load(Ordering::SeqCst)
    }

    async fn script(
        &self,
        session: &EnvironmentSession<'_>,
        target: &LifecycleTarget,
    ) -> LifecycleResult<PrimedTree> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.hangs.contains(&target.job.label) {
            std::future::pending::<()>().await;
        }
        if let Some(reason) = self.failures.get(&target.job.label) {
            return Err(LifecycleError::Failed {
                exit_code: 1,
                detail: reason.clone(),
            });
        }

        let scratch = tempfile::tempdir().map_err(|e| LifecycleError::Prepare(e.to_string()))?;
        let file = scratch.path().join("artifact.txt");
        std::fs::write(&file, format!("{}\n", target.build_for))
            .map_err(|e| LifecycleError::Prepare(e.to_string()))?;
        let prime_dir = target.prime_dir();
        session.push(&file, &format!("{prime_dir}/artifact.txt")).await?;
        Ok(PrimedTree {
            remote_path: prime_dir,
        })
    }
}

/// Decrements the per-environment counter even when the run is cancelled.
struct ActiveGuard<'a> {
    active: &'a Mutex<HashMap<String, usize>>,
    environment: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Some(count) = lock(self.active).get_mut(&self.environment) {
            *count = count.saturating_sub(1);
        }
    }
}

#[async_trait]
impl LifecycleRunner for ScriptedLifecycle {
    async fn run_lifecycle(
        &self,
        session: &EnvironmentSession<'_>,
        _parts: &PartDefinitions,
        target: &LifecycleTarget,
    ) -> LifecycleResult<PrimedTree> {
        let environment = session.handle().name.clone();
        lock(&self.calls).push(LifecycleCall {
            job: target.job.clone(),
            environment: environment.clone(),
        });
        let now_active = {
            let mut active = lock(&self.active);
            let count = active.entry(environment.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.max_active_per_environment
            .fetch_max(now_active, Ordering::SeqCst);
        let _guard = ActiveGuard {
            active: &self.active,
            environment,
        };

        self.script(session, target).await
    }
}

// ---------------------------------------------------------------------------
// StaticCapabilities
// ---------------------------------------------------------------------------

/// Capability answers fixed at construction.
#[derive(Debug, Default, Clone)]
pub struct StaticCapabilities {
    rejected: HashMap<EnvironmentKey, String>,
}

impl StaticCapabilities {
    /// Every key is supported.
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn reject(mut self, key: EnvironmentKey, reason: &str) -> Self {
        self.rejected.insert(key, reason.to_string());
        self
    }
}

#[async_trait]
impl HostCapabilities for StaticCapabilities {
    async fn check(&self, key: &EnvironmentKey) -> Capability {
        match self.rejected.get(key) {
            Some(reason) => Capability::Unsupported {
                reason: reason.clone(),
            },
            None => Capability::Supported,
        }
    }
}
