//! Build orchestration: drive resolved jobs through provisioning, the
//! lifecycle and collection.
//!
//! Jobs are grouped into lanes, one per build-on key, in plan order. Lanes run
//! concurrently up to `ConcurrencyPolicy::max_workers`; inside a lane jobs run
//! one after another, which keeps same-key jobs in emission order on top of
//! the environment cache's single-owner rule. Jobs with an identical
//! `(build_on, build_for)` pair execute once and the others receive a copy of
//! the result.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use multipack_core::{duplicate_groups, obs, BuildJob, JobId, PartDefinitions};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::backend::{EnvironmentBackend, EnvironmentKey};
use crate::capability::{Capability, HostCapabilities};
use crate::collector::ArtifactCollector;
use crate::error::LifecycleError;
use crate::lifecycle::{EnvironmentSession, LifecycleRunner, LifecycleTarget};
use crate::naming::{self, sanitize};
use crate::provisioner::{EnvironmentCache, EnvironmentLease, RetentionPolicy};
use crate::report::{BuildResult, BuildStage, JobOutcome, RunReport};

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Upper bound on jobs running at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyPolicy {
    pub max_workers: usize,
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

/// What a failed job does to the rest of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Keep going; failures are recorded per job.
    #[default]
    BestEffort,
    /// Skip every job that has not started once one job fails.
    FailFast,
}

/// Provisioning retries with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 0 = single attempt.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_base_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// Everything the caller decides about a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteOptions {
    pub concurrency: ConcurrencyPolicy,
    pub failure: FailurePolicy,
    pub retention: RetentionPolicy,
    pub retry: RetryPolicy,
}

// ---------------------------------------------------------------------------
// Job state machine
// ---------------------------------------------------------------------------

/// Per-job state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Pending,
    Provisioning,
    Executing,
    Collecting,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid job transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: JobPhase,
    pub to: JobPhase,
}

impl JobPhase {
    fn rank(self) -> u8 {
        match self {
            JobPhase::Pending => 0,
            JobPhase::Provisioning => 1,
            JobPhase::Executing => 2,
            JobPhase::Collecting => 3,
            JobPhase::Succeeded | JobPhase::Failed | JobPhase::Skipped => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 4
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Pending => "pending",
            JobPhase::Provisioning => "provisioning",
            JobPhase::Executing => "executing",
            JobPhase::Collecting => "collecting",
            JobPhase::Succeeded => "succeeded",
            JobPhase::Failed => "failed",
            JobPhase::Skipped => "skipped",
        }
    }

    /// `Skipped` is only reachable from `Pending` and `Succeeded` only from
    /// `Collecting`; `Failed` from any non-terminal phase.
    pub fn advance(self, to: JobPhase) -> Result<JobPhase, InvalidTransition> {
        let allowed = !self.is_terminal()
            && match to {
                JobPhase::Skipped => self == JobPhase::Pending,
                JobPhase::Succeeded => self == JobPhase::Collecting,
                JobPhase::Failed => true,
                _ => to.rank() > self.rank(),
            };
        if allowed {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }
}

/// Tracks one job's phase and emits transition events.
struct JobTracker {
    id: String,
    phase: JobPhase,
    started: Instant,
}

impl JobTracker {
    fn new(job: &BuildJob) -> Self {
        Self {
            id: job.id().to_string(),
            phase: JobPhase::Pending,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, to: JobPhase) {
        match self.phase.advance(to) {
            Ok(next) => {
                obs::emit_job_transition(&self.id, self.phase.as_str(), next.as_str());
                self.phase = next;
            }
            Err(e) => error!(job = %self.id, error = %e, "rejected job transition"),
        }
    }

    fn finish(mut self, job: &BuildJob, outcome: JobOutcome, attempts: u32) -> BuildResult {
        let terminal = match &outcome {
            JobOutcome::Succeeded { .. } => JobPhase::Succeeded,
            JobOutcome::Failed { .. } => JobPhase::Failed,
            JobOutcome::Skipped { .. } => JobPhase::Skipped,
        };
        self.advance(terminal);
        let duration_ms = self.started.elapsed().as_millis() as u64;
        if let JobOutcome::Failed { stage, reason } = &outcome {
            obs::emit_job_failed(&self.id, stage.as_str(), reason);
        }
        obs::emit_job_finished(&self.id, outcome.as_str(), duration_ms);
        BuildResult {
            job: job.clone(),
            outcome,
            duration_ms,
            attempts,
        }
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Run-level cancellation signal. Clones share one flag.
#[derive(Debug, Clone)]
pub struct RunCancellation {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for RunCancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl RunCancellation {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Project-level inputs shared by every job of a run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub project: String,
    pub project_dir: PathBuf,
    pub output_dir: PathBuf,
    pub parts: PartDefinitions,
}

/// State shared by the lanes of one run.
struct RunState {
    jobs: Vec<BuildJob>,
    names: BTreeMap<JobId, String>,
    options: ExecuteOptions,
    collector: ArtifactCollector,
    results: Mutex<Vec<Option<BuildResult>>>,
    workers: Semaphore,
    failed: watch::Sender<bool>,
}

impl RunState {
    fn record(&self, index: usize, result: BuildResult) {
        lock(&self.results)[index] = Some(result);
    }

    fn artifact_name(&self, job: &BuildJob) -> String {
        self.names.get(&job.id()).cloned().unwrap_or_else(|| {
            format!(
                "{}_{}.{}",
                sanitize(&job.platform_label),
                job.sequence_index,
                naming::DEFAULT_EXTENSION
            )
        })
    }

    fn fail_fast_tripped(&self) -> bool {
        self.options.failure == FailurePolicy::FailFast && *self.failed.borrow()
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    cache: Arc<EnvironmentCache>,
    runner: Arc<dyn LifecycleRunner>,
    capabilities: Arc<dyn HostCapabilities>,
    cancellation: RunCancellation,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        backend: Arc<dyn EnvironmentBackend>,
        runner: Arc<dyn LifecycleRunner>,
        capabilities: Arc<dyn HostCapabilities>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            cache: Arc::new(EnvironmentCache::new(backend)),
            runner,
            capabilities,
            cancellation: RunCancellation::new(),
        }
    }

    pub fn with_cancellation(mut self, cancellation: RunCancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn cancellation(&self) -> RunCancellation {
        self.cancellation.clone()
    }

    pub fn cache(&self) -> &EnvironmentCache {
        &self.cache
    }

    /// Run `jobs` to completion and report every job's outcome, in plan order.
    ///
    /// Job-level failures never surface as `Err`; they are part of the report.
    pub async fn execute(&self, jobs: &[BuildJob], options: &ExecuteOptions) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = obs::run_span(&run_id.to_string());
        self.execute_run(run_id, jobs, options).instrument(span).await
    }

    async fn execute_run(
        &self,
        run_id: Uuid,
        jobs: &[BuildJob],
        options: &ExecuteOptions,
    ) -> RunReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        obs::emit_run_started(&run_id.to_string(), &self.config.project, jobs.len());

        match self.cache.reconcile_stale().await {
            Ok(discarded) if !discarded.is_empty() => {
                info!(count = discarded.len(), "discarded stale environments")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "stale environment reconciliation failed"),
        }

        let (failed, _) = watch::channel(false);
        let run = Arc::new(RunState {
            jobs: jobs.to_vec(),
            names: naming::artifact_names(&self.config.project, jobs),
            options: *options,
            collector: ArtifactCollector::new(&self.config.output_dir),
            results: Mutex::new(vec![None; jobs.len()]),
            workers: Semaphore::new(options.concurrency.max_workers.max(1)),
            failed,
        });

        let lanes = self.plan_lanes(&run).await;
        let tasks = lanes.into_iter().map(|(key, groups)| {
            let orchestrator = self.clone();
            let run = run.clone();
            tokio::spawn(
                async move { orchestrator.run_lane(&run, &key, groups).await }
                    .instrument(tracing::Span::current()),
            )
        });
        for joined in join_all(tasks).await {
            if let Err(e) = joined {
                error!(error = %e, "build lane task failed");
            }
        }

        let retained_environments = self.cache.teardown(options.retention).await;

        let collected = std::mem::take(&mut *lock(&run.results));
        let results: Vec<BuildResult> = collected
            .into_iter()
            .zip(&run.jobs)
            .map(|(result, job)| {
                result.unwrap_or_else(|| BuildResult {
                    job: job.clone(),
                    outcome: JobOutcome::Failed {
                        stage: BuildStage::Execution,
                        reason: "build worker stopped unexpectedly".to_string(),
                    },
                    duration_ms: 0,
                    attempts: 0,
                })
            })
            .collect();

        let cancelled = self.cancellation.is_cancelled();
        let report = RunReport {
            run_id,
            project: self.config.project.clone(),
            started_at,
            finished_at: Utc::now(),
            status: RunReport::status_for(&results, cancelled),
            cancelled,
            results,
            retained_environments,
        };
        let counts = report.counts();
        obs::emit_run_finished(
            &run_id.to_string(),
            clock.elapsed().as_millis() as u64,
            counts.succeeded,
            counts.failed,
            counts.skipped,
        );
        report
    }

    /// Skip groups the host cannot build, and bucket the rest into per-key
    /// lanes in first-seen order.
    async fn plan_lanes(&self, run: &RunState) -> Vec<(EnvironmentKey, Vec<Vec<usize>>)> {
        let mut verdicts: HashMap<EnvironmentKey, Capability> = HashMap::new();
        let mut lanes: Vec<(EnvironmentKey, Vec<Vec<usize>>)> = Vec::new();

        for group in duplicate_groups(&run.jobs) {
            let key = run.jobs[group[0]].build_on.clone();
            let verdict = match verdicts.get(&key) {
                Some(verdict) => verdict.clone(),
                None => {
                    let verdict = self.capabilities.check(&key).await;
                    verdicts.insert(key.clone(), verdict.clone());
                    verdict
                }
            };
            if let Capability::Unsupported { reason } = verdict {
                info!(key = %key, reason = %reason, "host cannot build on this platform");
                self.skip_group(run, &group, &reason);
                continue;
            }
            match lanes.iter_mut().find(|(k, _)| *k == key) {
                Some((_, groups)) => groups.push(group),
                None => lanes.push((key, vec![group])),
            }
        }
        lanes
    }

    fn skip_group(&self, run: &RunState, group: &[usize], reason: &str) {
        for &index in group {
            let job = &run.jobs[index];
            let result = JobTracker::new(job).finish(
                job,
                JobOutcome::Skipped {
                    reason: reason.to_string(),
                },
                0,
            );
            run.record(index, result);
        }
    }

    async fn run_lane(&self, run: &RunState, key: &EnvironmentKey, groups: Vec<Vec<usize>>) {
        for group in groups {
            if let Some(reason) = self.stop_reason(run) {
                self.skip_group(run, &group, reason);
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => None,
                permit = run.workers.acquire() => permit.ok(),
            };
            let Some(permit) = permit else {
                self.skip_group(run, &group, "run cancelled");
                continue;
            };
            if let Some(reason) = self.stop_reason(run) {
                drop(permit);
                self.skip_group(run, &group, reason);
                continue;
            }

            let failed = self.run_group(run, &group).await;
            drop(permit);
            if failed && run.options.failure == FailurePolicy::FailFast {
                warn!(key = %key, "job failed, skipping jobs that have not started");
                run.failed.send_replace(true);
            }
        }
    }

    fn stop_reason(&self, run: &RunState) -> Option<&'static str> {
        if self.cancellation.is_cancelled() {
            Some("run cancelled")
        } else if run.fail_fast_tripped() {
            Some("an earlier job failed (fail-fast)")
        } else {
            None
        }
    }

    /// Run a group's leader, then hand its outcome to the followers.
    /// Returns whether any job of the group failed.
    async fn run_group(&self, run: &RunState, group: &[usize]) -> bool {
        let leader = &run.jobs[group[0]];
        let leader_result = self.run_job(run, leader).await;
        let mut failed = leader_result.is_failed();

        for &index in &group[1..] {
            let follower = &run.jobs[index];
            let result = self.follow(run, follower, &leader_result).await;
            failed |= result.is_failed();
            run.record(index, result);
        }
        run.record(group[0], leader_result);
        failed
    }

    async fn follow(&self, run: &RunState, job: &BuildJob, leader: &BuildResult) -> BuildResult {
        let mut tracker = JobTracker::new(job);
        let outcome = match &leader.outcome {
            JobOutcome::Succeeded { artifact } => {
                tracker.advance(JobPhase::Collecting);
                match run
                    .collector
                    .duplicate(artifact, &run.artifact_name(job))
                    .await
                {
                    Ok(artifact) => JobOutcome::Succeeded { artifact },
                    Err(e) => JobOutcome::Failed {
                        stage: BuildStage::Collection,
                        reason: e.to_string(),
                    },
                }
            }
            JobOutcome::Failed { stage, reason } => JobOutcome::Failed {
                stage: *stage,
                reason: format!("identical job {} failed: {reason}", leader.job.id()),
            },
            JobOutcome::Skipped { reason } => JobOutcome::Skipped {
                reason: reason.clone(),
            },
        };
        tracker.finish(job, outcome, 0)
    }

    async fn run_job(&self, run: &RunState, job: &BuildJob) -> BuildResult {
        let span = obs::job_span(&job.id().to_string(), &job.build_on.to_string());
        self.run_job_inner(run, job).instrument(span).await
    }

    async fn run_job_inner(&self, run: &RunState, job: &BuildJob) -> BuildResult {
        let mut tracker = JobTracker::new(job);

        tracker.advance(JobPhase::Provisioning);
        let (mut lease, attempts) = match self.provision(&run.options.retry, job).await {
            Ok(acquired) => acquired,
            Err((attempts, reason)) => {
                let outcome = JobOutcome::Failed {
                    stage: BuildStage::Provisioning,
                    reason,
                };
                return tracker.finish(job, outcome, attempts);
            }
        };

        debug!(
            environment = %lease.handle().name,
            fresh = lease.freshly_provisioned(),
            "environment leased"
        );
        tracker.advance(JobPhase::Executing);
        let target = LifecycleTarget::for_job(job, &self.config.project_dir);
        let lifecycle = {
            let session = EnvironmentSession::new(self.cache.backend().as_ref(), lease.handle());
            tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => Err(LifecycleError::Cancelled),
                result = self.runner.run_lifecycle(&session, &self.config.parts, &target) => result,
            }
        };
        let tree = match lifecycle {
            Ok(tree) => tree,
            Err(LifecycleError::Cancelled) => {
                self.cache.invalidate(lease);
                let outcome = JobOutcome::Failed {
                    stage: BuildStage::Execution,
                    reason: "run cancelled".to_string(),
                };
                return tracker.finish(job, outcome, attempts);
            }
            Err(e) => {
                self.cache.mark_failed_build(&mut lease);
                self.cache.release(lease);
                let outcome = JobOutcome::Failed {
                    stage: BuildStage::Execution,
                    reason: e.to_string(),
                };
                return tracker.finish(job, outcome, attempts);
            }
        };

        tracker.advance(JobPhase::Collecting);
        let collected = {
            let session = EnvironmentSession::new(self.cache.backend().as_ref(), lease.handle());
            run.collector
                .collect(&session, &tree, job, &run.artifact_name(job))
                .await
        };
        let outcome = match collected {
            Ok(artifact) => {
                self.cache.release(lease);
                JobOutcome::Succeeded { artifact }
            }
            Err(e) => {
                self.cache.mark_failed_build(&mut lease);
                self.cache.release(lease);
                JobOutcome::Failed {
                    stage: BuildStage::Collection,
                    reason: e.to_string(),
                }
            }
        };
        tracker.finish(job, outcome, attempts)
    }

    /// Acquire the job's environment, retrying per `retry`.
    ///
    /// On failure returns the attempts made and the last error.
    async fn provision(
        &self,
        retry: &RetryPolicy,
        job: &BuildJob,
    ) -> Result<(EnvironmentLease, u32), (u32, String)> {
        let key = job.environment_key();
        let max_attempts = retry.max_retries.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let acquired = tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => return Err((attempt, "run cancelled".to_string())),
                acquired = self.cache.acquire(key) => acquired,
            };
            match acquired {
                Ok(lease) => return Ok((lease, attempt)),
                Err(e) => {
                    last_error = e.to_string();
                    if attempt == max_attempts {
                        break;
                    }
                    let delay = retry.delay(attempt);
                    warn!(
                        job = %job.id(),
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "provisioning failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancellation.cancelled() => return Err((attempt, "run cancelled".to_string())),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        Err((max_attempts, last_error))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
