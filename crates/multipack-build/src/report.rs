//! Per-job results and the run report.

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use multipack_core::BuildJob;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::collector::CollectedArtifact;

/// Stage at which a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStage {
    Provisioning,
    Execution,
    Collection,
}

impl BuildStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStage::Provisioning => "provisioning",
            BuildStage::Execution => "execution",
            BuildStage::Collection => "collection",
        }
    }
}

/// Terminal outcome of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded { artifact: CollectedArtifact },
    Failed { stage: BuildStage, reason: String },
    Skipped { reason: String },
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Succeeded { .. } => "succeeded",
            JobOutcome::Failed { .. } => "failed",
            JobOutcome::Skipped { .. } => "skipped",
        }
    }
}

/// Result of one [`BuildJob`]. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub job: BuildJob,
    pub outcome: JobOutcome,
    pub duration_ms: u64,
    /// Provisioning attempts made; 0 when the job never reached provisioning.
    pub attempts: u32,
}

impl BuildResult {
    pub fn is_succeeded(&self) -> bool {
        matches!(self.outcome, JobOutcome::Succeeded { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, JobOutcome::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, JobOutcome::Skipped { .. })
    }

    pub fn artifact(&self) -> Option<&CollectedArtifact> {
        match &self.outcome {
            JobOutcome::Succeeded { artifact } => Some(artifact),
            _ => None,
        }
    }

    pub fn summary_line(&self) -> String {
        let id = self.job.id();
        let target = &self.job.build_for;
        match &self.outcome {
            JobOutcome::Succeeded { artifact } if artifact.reused => format!(
                "{id} ({target}): succeeded -> {} (shared)",
                artifact.file_name
            ),
            JobOutcome::Succeeded { artifact } => {
                format!("{id} ({target}): succeeded -> {}", artifact.file_name)
            }
            JobOutcome::Failed { stage, reason } => format!(
                "{id} ({target}): failed during {}: {reason}",
                stage.as_str()
            ),
            JobOutcome::Skipped { reason } => format!("{id} ({target}): skipped: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// Every job's terminal result for one run, in plan order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub project: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub cancelled: bool,
    pub results: Vec<BuildResult>,
    /// Environments left in place by the retention policy.
    pub retained_environments: Vec<String>,
}

/// Succeeded/failed/skipped tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunReport {
    /// A run fails when any job failed or the run was cancelled.
    pub fn status_for(results: &[BuildResult], cancelled: bool) -> RunStatus {
        if cancelled || results.iter().any(BuildResult::is_failed) {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for result in &self.results {
            match result.outcome {
                JobOutcome::Succeeded { .. } => counts.succeeded += 1,
                JobOutcome::Failed { .. } => counts.failed += 1,
                JobOutcome::Skipped { .. } => counts.skipped += 1,
            }
        }
        counts
    }

    /// Results grouped by platform label, labels in first-seen order.
    pub fn by_label(&self) -> Vec<(&str, Vec<&BuildResult>)> {
        let mut groups: Vec<(&str, Vec<&BuildResult>)> = Vec::new();
        for result in &self.results {
            let label = result.job.platform_label.as_str();
            match groups.iter_mut().find(|(l, _)| *l == label) {
                Some((_, results)) => results.push(result),
                None => groups.push((label, vec![result])),
            }
        }
        groups
    }

    /// One human-readable line per job.
    pub fn summary_lines(&self) -> Vec<String> {
        self.results.iter().map(BuildResult::summary_line).collect()
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Write the report as JSON, atomically.
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multipack_core::{Architecture, Base, BuildPlatform, JobId, TargetPlatform};
    use std::path::PathBuf;

    fn job(label: &str) -> BuildJob {
        let base = Base::new("ubuntu", "24.04");
        BuildJob {
            platform_label: label.to_string(),
            build_on: BuildPlatform::new(base.clone(), Architecture::Amd64),
            build_for: TargetPlatform::new(base, Architecture::Amd64),
            sequence_index: 0,
            cross_compile: false,
        }
    }

    fn succeeded(label: &str) -> BuildResult {
        BuildResult {
            job: job(label),
            outcome: JobOutcome::Succeeded {
                artifact: CollectedArtifact {
                    path: PathBuf::from(format!("out/demo_{label}.zip")),
                    file_name: format!("demo_{label}.zip"),
                    sha256: "00".repeat(32),
                    produced_by: JobId {
                        label: label.to_string(),
                        sequence_index: 0,
                    },
                    reused: false,
                },
            },
            duration_ms: 10,
            attempts: 1,
        }
    }

    fn skipped(label: &str, reason: &str) -> BuildResult {
        BuildResult {
            job: job(label),
            outcome: JobOutcome::Skipped {
                reason: reason.to_string(),
            },
            duration_ms: 0,
            attempts: 0,
        }
    }

    fn report(results: Vec<BuildResult>) -> RunReport {
        let status = RunReport::status_for(&results, false);
        RunReport {
            run_id: Uuid::new_v4(),
            project: "demo".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            status,
            cancelled: false,
            results,
            retained_environments: vec![],
        }
    }

    #[test]
    fn test_any_failure_fails_run() {
        let failed = BuildResult {
            job: job("b"),
            outcome: JobOutcome::Failed {
                stage: BuildStage::Execution,
                reason: "boom".to_string(),
            },
            duration_ms: 5,
            attempts: 1,
        };
        let report = report(vec![succeeded("a"), failed]);
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(
            report.counts(),
            OutcomeCounts {
                succeeded: 1,
                failed: 1,
                skipped: 0
            }
        );
    }

    #[test]
    fn test_skips_do_not_fail_run() {
        let report = report(vec![succeeded("a"), skipped("b", "host")]);
        assert!(report.succeeded());
        assert_eq!(RunReport::status_for(&report.results, true), RunStatus::Failed);
    }

    #[test]
    fn test_summary_and_grouping() {
        let report = report(vec![succeeded("a"), skipped("b", "host")]);
        let lines = report.summary_lines();
        assert_eq!(lines[0], "a#0 (ubuntu@24.04:amd64): succeeded -> demo_a.zip");
        assert_eq!(lines[1], "b#0 (ubuntu@24.04:amd64): skipped: host");
        let labels: Vec<&str> = report.by_label().into_iter().map(|(l, _)| l).collect();
        assert_eq!(labels, vec!["a", "b"]);
    }

    #[test]
    fn test_json_shape() {
        let report = report(vec![succeeded("a")]);
        let value: serde_json::Value = serde_json::from_str(&report.to_json_pretty().unwrap()).unwrap();
        assert_eq!(value["status"], "succeeded");
        assert_eq!(value["results"][0]["outcome"]["status"], "succeeded");
        assert_eq!(
            value["results"][0]["outcome"]["artifact"]["file_name"],
            "demo_a.zip"
        );
        assert_eq!(value["results"][0]["job"]["build_for"]["arch"], "amd64");
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/run.json");
        let report = report(vec![succeeded("a")]);
        report.write_json(&path).unwrap();
        let back: RunReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, report);
    }
}
