//! Orchestrator behavior against the in-memory fakes and the host backend.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use multipack_build::fakes::{MemoryBackend, ScriptedLifecycle, StaticCapabilities};
use multipack_build::{
    environment_name, BuildStage, CommandLifecycleRunner, ConcurrencyPolicy, ExecuteOptions,
    FailurePolicy, HostBackend, JobOutcome, Orchestrator, OrchestratorConfig, RetentionPolicy,
    RetryPolicy, RunStatus,
};
use multipack_core::{
    parse_project, Architecture, Base, BuildJob, BuildPlan, BuildPlatform, PartDefinitions,
};

fn plan(yaml: &str) -> BuildPlan {
    BuildPlan::resolve(&parse_project(yaml).expect("valid project")).expect("resolvable")
}

fn key(arch: Architecture) -> BuildPlatform {
    BuildPlatform::new(Base::new("ubuntu", "24.04"), arch)
}

fn config(project_dir: &Path, output_dir: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        project: "demo".to_string(),
        project_dir: project_dir.to_path_buf(),
        output_dir: output_dir.to_path_buf(),
        parts: PartDefinitions::empty(),
    }
}

struct Harness {
    backend: Arc<MemoryBackend>,
    lifecycle: Arc<ScriptedLifecycle>,
    orchestrator: Orchestrator,
    output: tempfile::TempDir,
    _project: tempfile::TempDir,
}

fn harness(lifecycle: ScriptedLifecycle, capabilities: StaticCapabilities) -> Harness {
    harness_with_backend(MemoryBackend::new(), lifecycle, capabilities)
}

fn harness_with_backend(
    backend: MemoryBackend,
    lifecycle: ScriptedLifecycle,
    capabilities: StaticCapabilities,
) -> Harness {
    let project = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let backend = Arc::new(backend);
    let lifecycle = Arc::new(lifecycle);
    let orchestrator = Orchestrator::new(
        config(project.path(), output.path()),
        backend.clone(),
        lifecycle.clone(),
        Arc::new(capabilities),
    );
    Harness {
        backend,
        lifecycle,
        orchestrator,
        output,
        _project: project,
    }
}

const CROSS_PROJECT: &str = "name: demo
base: ubuntu@24.04
platforms:
  amd64:
  riscv64-cross:
    build-on: [amd64]
    build-for: [riscv64]
";

#[tokio::test]
async fn failed_cross_build_does_not_abort_native_build() {
    let h = harness(
        ScriptedLifecycle::new().fail_label("riscv64-cross", "linker not found"),
        StaticCapabilities::allow_all(),
    );
    let plan = plan(CROSS_PROJECT);

    let report = h
        .orchestrator
        .execute(&plan.jobs, &ExecuteOptions::default())
        .await;

    assert_eq!(report.results.len(), 2);
    assert_eq!(report.status, RunStatus::Failed);
    assert!(!report.cancelled);

    let native = &report.results[0];
    assert_eq!(native.job.platform_label, "amd64");
    let artifact = native.artifact().expect("native build produced an artifact");
    assert_eq!(artifact.file_name, "demo_amd64.zip");
    assert!(h.output.path().join("demo_amd64.zip").is_file());

    let cross = &report.results[1];
    assert_eq!(cross.job.platform_label, "riscv64-cross");
    match &cross.outcome {
        JobOutcome::Failed { stage, reason } => {
            assert_eq!(*stage, BuildStage::Execution);
            assert!(reason.contains("linker not found"), "{reason}");
        }
        other => panic!("expected failure, got {other:?}"),
    }

    // both jobs shared the single amd64 environment, in plan order
    assert_eq!(h.backend.create_count(), 1);
    let order: Vec<String> = h
        .lifecycle
        .calls()
        .into_iter()
        .map(|c| c.job.label)
        .collect();
    assert_eq!(order, vec!["amd64", "riscv64-cross"]);
    assert!(h.backend.live_environments().is_empty());
}

#[tokio::test]
async fn environments_are_never_shared_concurrently() {
    let h = harness_with_backend(
        MemoryBackend::new().with_create_delay(Duration::from_millis(10)),
        ScriptedLifecycle::new().with_delay(Duration::from_millis(15)),
        StaticCapabilities::allow_all(),
    );
    let plan = plan(
        "name: demo
base: ubuntu@24.04
platforms:
  amd64:
  arm64:
  riscv64-cross:
    build-on: [amd64]
    build-for: [riscv64]
  s390x-cross:
    build-on: [amd64]
    build-for: [s390x]
  armhf-cross:
    build-on: [arm64]
    build-for: [armhf]
  ppc64el-cross:
    build-on: [amd64]
    build-for: [ppc64el]
",
    );
    let options = ExecuteOptions {
        concurrency: ConcurrencyPolicy { max_workers: 8 },
        ..Default::default()
    };

    let report = h.orchestrator.execute(&plan.jobs, &options).await;

    assert!(report.succeeded(), "{:?}", report.summary_lines());
    assert_eq!(report.counts().succeeded, 6);
    assert_eq!(h.lifecycle.max_concurrent_per_environment(), 1);
    assert_eq!(h.backend.create_count(), 2);

    let amd64_env = environment_name(&key(Architecture::Amd64));
    let amd64_order: Vec<String> = h
        .lifecycle
        .calls()
        .into_iter()
        .filter(|c| c.environment == amd64_env)
        .map(|c| c.job.label)
        .collect();
    assert_eq!(
        amd64_order,
        vec!["amd64", "riscv64-cross", "s390x-cross", "ppc64el-cross"]
    );

    let labels: Vec<&str> = report
        .results
        .iter()
        .map(|r| r.job.platform_label.as_str())
        .collect();
    assert_eq!(labels, plan.labels());
}

#[tokio::test]
async fn fail_fast_skips_jobs_not_yet_started() {
    let h = harness(
        ScriptedLifecycle::new().fail_label("amd64", "compile error"),
        StaticCapabilities::allow_all(),
    );
    let plan = plan(
        "name: demo
base: ubuntu@24.04
platforms:
  amd64:
  riscv64-cross:
    build-on: [amd64]
    build-for: [riscv64]
  s390x-cross:
    build-on: [amd64]
    build-for: [s390x]
",
    );
    let options = ExecuteOptions {
        failure: FailurePolicy::FailFast,
        ..Default::default()
    };

    let report = h.orchestrator.execute(&plan.jobs, &options).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.results[0].is_failed());
    assert!(report.results[1].is_skipped());
    assert!(report.results[2].is_skipped());
    assert_eq!(h.lifecycle.calls().len(), 1);
}

#[tokio::test]
async fn best_effort_runs_everything_after_a_failure() {
    let h = harness(
        ScriptedLifecycle::new().fail_label("amd64", "compile error"),
        StaticCapabilities::allow_all(),
    );
    let plan = plan(CROSS_PROJECT);

    let report = h
        .orchestrator
        .execute(&plan.jobs, &ExecuteOptions::default())
        .await;

    assert!(report.results[0].is_failed());
    assert!(report.results[1].is_succeeded());
    assert_eq!(h.lifecycle.calls().len(), 2);
}

#[tokio::test]
async fn unsupported_build_on_is_skipped_not_failed() {
    let h = harness(
        ScriptedLifecycle::new(),
        StaticCapabilities::allow_all().reject(key(Architecture::S390x), "host is amd64"),
    );
    let plan = plan(
        "name: demo
base: ubuntu@24.04
platforms:
  amd64:
  s390x:
",
    );

    let report = h
        .orchestrator
        .execute(&plan.jobs, &ExecuteOptions::default())
        .await;

    assert!(report.succeeded());
    assert!(report.results[0].is_succeeded());
    match &report.results[1].outcome {
        JobOutcome::Skipped { reason } => assert_eq!(reason, "host is amd64"),
        other => panic!("expected skip, got {other:?}"),
    }
    assert_eq!(h.backend.create_count(), 1);
}

#[tokio::test]
async fn identical_jobs_execute_once() {
    let h = harness(ScriptedLifecycle::new(), StaticCapabilities::allow_all());
    let plan = plan(
        "name: demo
base: ubuntu@24.04
platforms:
  amd64:
  native:
    build-on: [amd64]
    build-for: [amd64]
",
    );

    let report = h
        .orchestrator
        .execute(&plan.jobs, &ExecuteOptions::default())
        .await;

    assert!(report.succeeded());
    assert_eq!(h.lifecycle.calls().len(), 1);

    let first = report.results[0].artifact().unwrap();
    let second = report.results[1].artifact().unwrap();
    assert_eq!(first.file_name, "demo_amd64.zip");
    assert_eq!(second.file_name, "demo_native.zip");
    assert_eq!(first.sha256, second.sha256);
    assert_eq!(second.produced_by, plan.jobs[0].id());
    assert!(h.output.path().join("demo_native.zip").is_file());
}

#[tokio::test]
async fn provisioning_is_retried_with_backoff() {
    let backend = MemoryBackend::new();
    backend.fail_create(&key(Architecture::Amd64), 2);
    let h = harness_with_backend(
        backend,
        ScriptedLifecycle::new(),
        StaticCapabilities::allow_all(),
    );
    let plan = plan(
        "name: demo
base: ubuntu@24.04
platforms:
  amd64:
",
    );
    let options = ExecuteOptions {
        retry: RetryPolicy {
            max_retries: 2,
            backoff_base_ms: 1,
        },
        ..Default::default()
    };

    let report = h.orchestrator.execute(&plan.jobs, &options).await;

    assert!(report.succeeded(), "{:?}", report.summary_lines());
    assert_eq!(report.results[0].attempts, 3);
}

#[tokio::test]
async fn exhausted_retries_fail_during_provisioning() {
    let backend = MemoryBackend::new();
    backend.fail_create(&key(Architecture::Amd64), 5);
    let h = harness_with_backend(
        backend,
        ScriptedLifecycle::new(),
        StaticCapabilities::allow_all(),
    );
    let plan = plan(CROSS_PROJECT);
    let options = ExecuteOptions {
        retry: RetryPolicy {
            max_retries: 1,
            backoff_base_ms: 1,
        },
        ..Default::default()
    };

    let report = h.orchestrator.execute(&plan.jobs, &options).await;

    assert_eq!(report.status, RunStatus::Failed);
    let first = &report.results[0];
    assert!(matches!(
        first.outcome,
        JobOutcome::Failed {
            stage: BuildStage::Provisioning,
            ..
        }
    ));
    assert_eq!(first.attempts, 2);
    assert!(h.lifecycle.calls().is_empty());
}

#[tokio::test]
async fn failed_environments_retained_on_failure() {
    let h = harness(
        ScriptedLifecycle::new().fail_label("arm64", "test suite failed"),
        StaticCapabilities::allow_all(),
    );
    let plan = plan(
        "name: demo
base: ubuntu@24.04
platforms:
  amd64:
  arm64:
",
    );
    let options = ExecuteOptions {
        retention: RetentionPolicy::OnFailure,
        ..Default::default()
    };

    let report = h.orchestrator.execute(&plan.jobs, &options).await;

    let arm64_env = environment_name(&key(Architecture::Arm64));
    assert_eq!(report.retained_environments, vec![arm64_env.clone()]);
    assert_eq!(h.backend.live_environments(), vec![arm64_env]);
    assert_eq!(
        h.backend.destroyed(),
        vec![environment_name(&key(Architecture::Amd64))]
    );
}

#[tokio::test]
async fn stale_environments_are_discarded_before_the_run() {
    let backend = MemoryBackend::new();
    backend.seed_stale("multipack-leftover");
    let h = harness_with_backend(
        backend,
        ScriptedLifecycle::new(),
        StaticCapabilities::allow_all(),
    );
    let plan = plan(
        "name: demo
base: ubuntu@24.04
platforms:
  amd64:
",
    );

    let report = h
        .orchestrator
        .execute(&plan.jobs, &ExecuteOptions::default())
        .await;

    assert!(report.succeeded());
    assert!(h
        .backend
        .destroyed()
        .contains(&"multipack-leftover".to_string()));
}

#[tokio::test]
async fn cancellation_fails_running_and_skips_pending() {
    let h = harness(
        ScriptedLifecycle::new().hang_label("amd64"),
        StaticCapabilities::allow_all(),
    );
    let plan = plan(CROSS_PROJECT);
    let cancellation = h.orchestrator.cancellation();

    let orchestrator = h.orchestrator.clone();
    let jobs: Vec<BuildJob> = plan.jobs.clone();
    let run = tokio::spawn(async move {
        orchestrator
            .execute(&jobs, &ExecuteOptions::default())
            .await
    });

    while h.lifecycle.calls().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancellation.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run finished after cancellation")
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.status, RunStatus::Failed);
    match &report.results[0].outcome {
        JobOutcome::Failed { stage, reason } => {
            assert_eq!(*stage, BuildStage::Execution);
            assert_eq!(reason, "run cancelled");
        }
        other => panic!("expected cancelled failure, got {other:?}"),
    }
    assert!(report.results[1].is_skipped());
    assert!(h.backend.live_environments().is_empty());
}

#[tokio::test]
async fn host_backend_runs_lifecycle_command() {
    let state = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    std::fs::write(project.path().join("hello.txt"), "hello").unwrap();

    let runner = CommandLifecycleRunner::new(vec![
        "sh".to_string(),
        "-c".to_string(),
        "cp $MULTIPACK_PROJECT_DIR/hello.txt $MULTIPACK_PRIME_DIR/".to_string(),
    ])
    .unwrap();
    let orchestrator = Orchestrator::new(
        config(project.path(), output.path()),
        Arc::new(HostBackend::new(state.path())),
        Arc::new(runner),
        Arc::new(StaticCapabilities::allow_all()),
    );
    let plan = plan(CROSS_PROJECT);

    let report = orchestrator
        .execute(&plan.jobs, &ExecuteOptions::default())
        .await;

    assert!(report.succeeded(), "{:?}", report.summary_lines());
    for result in &report.results {
        let artifact = result.artifact().unwrap();
        let file = std::fs::File::open(&artifact.path).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        assert!(archive.by_name("hello.txt").is_ok());
    }
}
