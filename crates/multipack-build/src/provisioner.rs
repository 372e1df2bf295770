//! Environment cache: one live environment per build-on key, leased to one job
//! at a time.
//!
//! Each key owns a slot guarded by an async mutex. [`EnvironmentCache::acquire`]
//! locks the slot and hands the owned guard to the caller inside an
//! [`EnvironmentLease`], so a second job needing the same key waits until the
//! lease is released, invalidated or dropped. Slots are never removed from the
//! map; an invalidated slot keeps its handle only for teardown and is
//! re-provisioned in place on its next acquire. Environment names are
//! deterministic per key, so re-provisioning replaces the old environment.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use multipack_core::obs;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::backend::{EnvironmentBackend, EnvironmentHandle, EnvironmentKey};
use crate::error::{ProvisioningError, ProvisioningResult};

/// Lifecycle of a cached environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    Provisioning,
    Ready,
    InUse,
    Failed,
    Destroyed,
}

/// What happens to environments when a run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionPolicy {
    /// Destroy everything.
    #[default]
    Never,
    /// Keep environments in which a job failed.
    OnFailure,
    /// Keep everything.
    Always,
}

impl RetentionPolicy {
    fn retains(self, failed: bool) -> bool {
        match self {
            RetentionPolicy::Never => false,
            RetentionPolicy::OnFailure => failed,
            RetentionPolicy::Always => true,
        }
    }
}

#[derive(Debug)]
struct Slot {
    state: EnvironmentState,
    handle: Option<EnvironmentHandle>,
    failed_build: bool,
}

impl Slot {
    fn empty() -> Self {
        Self {
            state: EnvironmentState::Destroyed,
            handle: None,
            failed_build: false,
        }
    }
}

/// Exclusive borrow of one environment.
#[derive(Debug)]
pub struct EnvironmentLease {
    slot: OwnedMutexGuard<Slot>,
    handle: EnvironmentHandle,
    attempt: u32,
}

impl EnvironmentLease {
    pub fn handle(&self) -> &EnvironmentHandle {
        &self.handle
    }

    pub fn key(&self) -> &EnvironmentKey {
        &self.handle.key
    }

    /// Whether this lease required a fresh environment.
    pub fn freshly_provisioned(&self) -> bool {
        self.attempt > 0
    }
}

/// Keyed pool of environments backed by an [`EnvironmentBackend`].
pub struct EnvironmentCache {
    backend: Arc<dyn EnvironmentBackend>,
    slots: Mutex<HashMap<EnvironmentKey, Arc<tokio::sync::Mutex<Slot>>>>,
}

impl EnvironmentCache {
    pub fn new(backend: Arc<dyn EnvironmentBackend>) -> Self {
        Self {
            backend,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn EnvironmentBackend> {
        &self.backend
    }

    fn slot(&self, key: &EnvironmentKey) -> Arc<tokio::sync::Mutex<Slot>> {
        lock(&self.slots)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Slot::empty())))
            .clone()
    }

    /// Lease the environment for `key`, creating it if needed.
    ///
    /// Waits while another lease for the same key is outstanding. Provisioning
    /// failures are returned as-is; retrying is the caller's decision.
    pub async fn acquire(&self, key: &EnvironmentKey) -> ProvisioningResult<EnvironmentLease> {
        let mut slot = self.slot(key).lock_owned().await;

        match (slot.state, slot.handle.clone()) {
            (EnvironmentState::Ready, Some(handle)) => {
                debug!(environment = %handle.name, "reusing environment");
                slot.state = EnvironmentState::InUse;
                return Ok(EnvironmentLease {
                    slot,
                    handle,
                    attempt: 0,
                });
            }
            (EnvironmentState::InUse, Some(handle)) => {
                // previous holder dropped its lease mid-job; contents are unknown
                warn!(environment = %handle.name, "environment was abandoned in use, re-provisioning");
            }
            _ => {}
        }

        slot.state = EnvironmentState::Provisioning;
        slot.handle = None;
        slot.failed_build = false;
        match self.backend.create(key).await {
            Ok(handle) => {
                obs::emit_environment_provisioned(&handle.name, &key.to_string(), 1);
                slot.handle = Some(handle.clone());
                slot.state = EnvironmentState::InUse;
                Ok(EnvironmentLease {
                    slot,
                    handle,
                    attempt: 1,
                })
            }
            Err(source) => {
                slot.state = EnvironmentState::Failed;
                Err(ProvisioningError::Backend {
                    key: key.to_string(),
                    source,
                })
            }
        }
    }

    /// Return a healthy environment to the pool.
    pub fn release(&self, mut lease: EnvironmentLease) {
        lease.slot.state = EnvironmentState::Ready;
        debug!(environment = %lease.handle.name, "released");
    }

    /// Take an environment out of service; the next acquire re-provisions.
    ///
    /// The environment counts as failed for [`RetentionPolicy::OnFailure`].
    pub fn invalidate(&self, mut lease: EnvironmentLease) {
        lease.slot.state = EnvironmentState::Failed;
        lease.slot.failed_build = true;
        info!(environment = %lease.handle.name, "invalidated");
    }

    /// Record that a job failed in this environment, for retention purposes.
    pub fn mark_failed_build(&self, lease: &mut EnvironmentLease) {
        lease.slot.failed_build = true;
    }

    /// Current state of the slot for `key`, if one exists. Leased slots
    /// report `InUse`.
    pub fn state(&self, key: &EnvironmentKey) -> Option<EnvironmentState> {
        let slot = lock(&self.slots).get(key).cloned()?;
        let state = match slot.try_lock() {
            Ok(slot) => slot.state,
            Err(_) => EnvironmentState::InUse,
        };
        Some(state)
    }

    /// Destroy environments whose creation never completed.
    ///
    /// Returns the names that were discarded.
    pub async fn reconcile_stale(&self) -> ProvisioningResult<Vec<String>> {
        let records = self
            .backend
            .list()
            .await
            .map_err(ProvisioningError::Reconcile)?;
        let mut discarded = Vec::new();
        for record in records.into_iter().filter(|r| !r.complete) {
            match self.backend.destroy(&record.name).await {
                Ok(()) => {
                    info!(environment = %record.name, "discarded stale environment");
                    discarded.push(record.name);
                }
                Err(e) => warn!(environment = %record.name, error = %e, "failed to discard stale environment"),
            }
        }
        Ok(discarded)
    }

    /// Destroy or keep every environment this cache created.
    ///
    /// Destruction is best-effort: failures are logged and the environment is
    /// reported as retained. Returns the names of retained environments.
    pub async fn teardown(&self, policy: RetentionPolicy) -> Vec<String> {
        let slots: Vec<Arc<tokio::sync::Mutex<Slot>>> =
            lock(&self.slots).values().cloned().collect();
        let mut candidates: Vec<(EnvironmentHandle, bool)> = Vec::new();

        for slot in slots {
            let mut slot = slot.lock().await;
            if let Some(handle) = slot.handle.take() {
                candidates.push((handle, slot.failed_build));
            }
            slot.state = EnvironmentState::Destroyed;
            slot.failed_build = false;
        }
        candidates.sort_by(|a, b| a.0.name.cmp(&b.0.name));

        let mut retained = Vec::new();
        for (handle, failed) in candidates {
            let name = handle.name;
            if policy.retains(failed) {
                obs::emit_environment_destroyed(&name, true);
                retained.push(name);
                continue;
            }
            match self.backend.destroy(&name).await {
                Ok(()) => obs::emit_environment_destroyed(&name, false),
                Err(e) => {
                    warn!(environment = %name, error = %e, "failed to destroy environment");
                    retained.push(name);
                }
            }
        }
        retained
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
