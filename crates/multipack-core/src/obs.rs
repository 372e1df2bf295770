//! Structured observability hooks for build runs.
//!
//! Run and job scoped spans via [`run_span`] and [`job_span`], plus one
//! emission function per lifecycle event. All events are `info!` except
//! failures, which are `warn!`.

use tracing::{info, warn};

/// Span for one run; attach with `tracing::Instrument`.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("multipack.run", run_id = %run_id)
}

pub fn job_span(job_id: &str, build_on: &str) -> tracing::Span {
    tracing::info_span!("multipack.job", job_id = %job_id, build_on = %build_on)
}

/// Emit event: run started.
///
/// ```ignore
/// emit_run_started("3f1c...", "hello", 4);
/// // logs: event=run.started run_id=3f1c... project=hello jobs=4
/// ```
pub fn emit_run_started(run_id: &str, project: &str, jobs: usize) {
    info!(event = "run.started", run_id = %run_id, project = %project, jobs = jobs);
}

/// Emit event: run finished.
pub fn emit_run_finished(
    run_id: &str,
    duration_ms: u64,
    succeeded: usize,
    failed: usize,
    skipped: usize,
) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        succeeded = succeeded,
        failed = failed,
        skipped = skipped,
    );
}

/// Emit event: a job moved to a new phase.
pub fn emit_job_transition(job_id: &str, from: &str, to: &str) {
    info!(event = "job.transition", job_id = %job_id, from = %from, to = %to);
}

/// Emit event: a job reached a terminal outcome.
pub fn emit_job_finished(job_id: &str, outcome: &str, duration_ms: u64) {
    info!(
        event = "job.finished",
        job_id = %job_id,
        outcome = %outcome,
        duration_ms = duration_ms,
    );
}

/// Emit event: a job failed (warning level).
pub fn emit_job_failed(job_id: &str, stage: &str, reason: &dyn std::fmt::Display) {
    warn!(event = "job.failed", job_id = %job_id, stage = %stage, reason = %reason);
}

pub fn emit_environment_provisioned(name: &str, key: &str, attempt: u32) {
    info!(
        event = "environment.provisioned",
        environment = %name,
        key = %key,
        attempt = attempt,
    );
}

pub fn emit_environment_destroyed(name: &str, retained: bool) {
    info!(event = "environment.destroyed", environment = %name, retained = retained);
}
