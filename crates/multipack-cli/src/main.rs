//! multipack - multi-platform artifact packaging CLI
//!
//! ## Commands
//!
//! - `plan`: Resolve `multipack.yaml` into build jobs without running them
//! - `pack`: Resolve, build every job on the host and collect artifacts
//! - `clean`: Destroy every environment left in the state directory

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use multipack_build::{
    CommandLifecycleRunner, ConcurrencyPolicy, EnvironmentBackend, ExecuteOptions, FailurePolicy,
    HostBackend, NativeCapabilities, Orchestrator, OrchestratorConfig, RetentionPolicy,
    RetryPolicy, RunReport, STATE_DIR_NAME,
};
use multipack_core::validate::platform_labels;
use multipack_core::{
    load_project, Architecture, BuildPlan, PlanFilter, ProjectSpec, PROJECT_FILE,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "multipack")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build one project for many platforms", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved build plan without building anything
    Plan {
        #[command(flatten)]
        project: ProjectArgs,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Build every selected job and collect its artifact
    Pack {
        #[command(flatten)]
        project: ProjectArgs,

        /// Directory receiving artifacts (default: project directory)
        #[arg(short, long, env = "MULTIPACK_OUTPUT_DIR")]
        output_dir: Option<PathBuf>,

        /// Maximum number of jobs running at once
        #[arg(short, long, env = "MULTIPACK_WORKERS", default_value_t = 4)]
        workers: usize,

        /// Skip remaining jobs after the first failure
        #[arg(long)]
        fail_fast: bool,

        /// Which environments survive the run
        #[arg(long, value_enum, default_value_t = Retain::Never)]
        retain: Retain,

        /// Lifecycle command run inside each environment
        #[arg(long, env = "MULTIPACK_LIFECYCLE")]
        lifecycle: String,

        /// Kill a lifecycle run after this many seconds (0 = no limit)
        #[arg(long, default_value_t = 0)]
        lifecycle_timeout: u64,

        /// Provisioning retries per job
        #[arg(long, default_value_t = 0)]
        retries: u32,

        /// Environment state directory (default: <project-dir>/.multipack)
        #[arg(long, env = "MULTIPACK_STATE_DIR")]
        state_dir: Option<PathBuf>,

        /// Write the run report as JSON to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Destroy every environment in the state directory
    Clean {
        /// Project directory
        #[arg(short, long, default_value = ".")]
        project_dir: PathBuf,

        /// Environment state directory (default: <project-dir>/.multipack)
        #[arg(long, env = "MULTIPACK_STATE_DIR")]
        state_dir: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ProjectArgs {
    /// Project directory
    #[arg(short, long, default_value = ".")]
    project_dir: PathBuf,

    /// Project file (default: <project-dir>/multipack.yaml)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Only build these platform labels
    #[arg(long = "platform")]
    platforms: Vec<String>,

    /// Only build jobs targeting these architectures
    #[arg(long)]
    build_for: Vec<Architecture>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Retain {
    Never,
    OnFailure,
    Always,
}

impl From<Retain> for RetentionPolicy {
    fn from(retain: Retain) -> Self {
        match retain {
            Retain::Never => RetentionPolicy::Never,
            Retain::OnFailure => RetentionPolicy::OnFailure,
            Retain::Always => RetentionPolicy::Always,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    multipack_core::init_tracing(cli.log_json, level);

    match cli.command {
        Commands::Plan { project, json } => cmd_plan(&project, json),
        Commands::Pack {
            project,
            output_dir,
            workers,
            fail_fast,
            retain,
            lifecycle,
            lifecycle_timeout,
            retries,
            state_dir,
            report,
        } => {
            let options = ExecuteOptions {
                concurrency: ConcurrencyPolicy {
                    max_workers: workers,
                },
                failure: if fail_fast {
                    FailurePolicy::FailFast
                } else {
                    FailurePolicy::BestEffort
                },
                retention: retain.into(),
                retry: RetryPolicy {
                    max_retries: retries,
                    ..Default::default()
                },
            };
            let mut runner =
                CommandLifecycleRunner::parse(&lifecycle).context("Invalid lifecycle command")?;
            if lifecycle_timeout > 0 {
                runner = runner.with_timeout(Duration::from_secs(lifecycle_timeout));
            }
            cmd_pack(
                &project,
                output_dir.as_deref(),
                runner,
                state_dir.as_deref(),
                report.as_deref(),
                &options,
            )
            .await
        }
        Commands::Clean {
            project_dir,
            state_dir,
        } => cmd_clean(&project_dir, state_dir.as_deref()).await,
    }
}

/// Load, resolve and filter the project.
fn load_plan(args: &ProjectArgs) -> Result<(ProjectSpec, BuildPlan)> {
    let file = args
        .file
        .clone()
        .unwrap_or_else(|| args.project_dir.join(PROJECT_FILE));
    let spec = load_project(&file).with_context(|| format!("Failed to load {}", file.display()))?;
    let plan = BuildPlan::resolve(&spec).context("Failed to resolve build plan")?;
    let filter = PlanFilter {
        platforms: args.platforms.clone(),
        build_for: args.build_for.clone(),
    };
    let plan = plan.select(&filter).context("Invalid platform selection")?;
    Ok((spec, plan))
}

fn state_dir_for(project_dir: &Path, state_dir: Option<&Path>) -> PathBuf {
    state_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| project_dir.join(STATE_DIR_NAME))
}

fn cmd_plan(args: &ProjectArgs, json: bool) -> Result<()> {
    let (spec, plan) = load_plan(args)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("Project: {}", plan.project);
    println!("Platforms: {}", platform_labels(&spec).join(", "));
    println!("Jobs: {}", plan.len());
    println!();
    for job in &plan.jobs {
        let cross = if job.cross_compile { " (cross)" } else { "" };
        println!(
            "  {}  build-on {}  build-for {}{}",
            job.id(),
            job.build_on,
            job.build_for,
            cross
        );
    }
    for group in plan.execution_groups() {
        if let [leader, followers @ ..] = group.jobs.as_slice() {
            if !followers.is_empty() {
                let ids: Vec<String> = followers.iter().map(|j| j.id().to_string()).collect();
                println!("  {} also produces {}", leader.id(), ids.join(", "));
            }
        }
    }
    println!();
    println!(
        "Environments: {}",
        plan.environment_keys()
            .iter()
            .map(|k| k.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

async fn cmd_pack(
    args: &ProjectArgs,
    output_dir: Option<&Path>,
    runner: CommandLifecycleRunner,
    state_dir: Option<&Path>,
    report_path: Option<&Path>,
    options: &ExecuteOptions,
) -> Result<()> {
    let (spec, plan) = load_plan(args)?;
    if plan.is_empty() {
        anyhow::bail!("No jobs selected");
    }

    let state_dir = state_dir_for(&args.project_dir, state_dir);
    let output_dir = output_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| args.project_dir.clone());

    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            project: spec.name.clone(),
            project_dir: args.project_dir.clone(),
            output_dir,
            parts: spec.parts.clone(),
        },
        Arc::new(HostBackend::new(&state_dir)),
        Arc::new(runner),
        Arc::new(NativeCapabilities::detect()),
    );

    let cancellation = orchestrator.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            cancellation.cancel();
        }
    });

    info!(project = %plan.project, jobs = plan.len(), "starting run");
    let report = orchestrator.execute(&plan.jobs, options).await;

    print_report(&report);
    if let Some(path) = report_path {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        println!("Report: {}", path.display());
    }

    if report.succeeded() {
        Ok(())
    } else if report.cancelled {
        anyhow::bail!("Run cancelled")
    } else {
        anyhow::bail!("{} job(s) failed", report.counts().failed)
    }
}

fn print_report(report: &RunReport) {
    println!("Run ID: {}", report.run_id);
    println!();
    for (label, results) in report.by_label() {
        println!("{label}:");
        for result in results {
            println!("  {}", result.summary_line());
        }
    }
    let counts = report.counts();
    println!();
    println!(
        "Summary: {} succeeded, {} failed, {} skipped",
        counts.succeeded, counts.failed, counts.skipped
    );
    if !report.retained_environments.is_empty() {
        println!("Retained: {}", report.retained_environments.join(", "));
    }
}

async fn cmd_clean(project_dir: &Path, state_dir: Option<&Path>) -> Result<()> {
    let backend = HostBackend::new(state_dir_for(project_dir, state_dir));
    let records = backend
        .list()
        .await
        .context("Failed to list environments")?;
    if records.is_empty() {
        println!("No environments to remove");
        return Ok(());
    }
    for record in records {
        backend
            .destroy(&record.name)
            .await
            .with_context(|| format!("Failed to destroy {}", record.name))?;
        println!("Removed {}", record.name);
    }
    Ok(())
}
