//! Resolved build plans: grouping, environment keys, and selection.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{PlanError, Result};
use crate::model::{Architecture, BuildJob, BuildPlatform, ProjectSpec, TargetArch, TargetPlatform};
use crate::resolver;

/// Restricts a plan to some platform labels and/or build-for architectures.
///
/// Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFilter {
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub build_for: Vec<Architecture>,
}

impl PlanFilter {
    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty() && self.build_for.is_empty()
    }

    fn matches(&self, job: &BuildJob) -> bool {
        let label_ok =
            self.platforms.is_empty() || self.platforms.iter().any(|p| p == &job.platform_label);
        let arch_ok = self.build_for.is_empty()
            || match job.build_for.arch {
                TargetArch::Arch(arch) => self.build_for.contains(&arch),
                // architecture-independent output is wanted by every target
                TargetArch::All => true,
            };
        label_ok && arch_ok
    }
}

/// Jobs sharing one `(build_on, build_for)` pair. Only the first one needs to
/// run; the rest are interchangeable with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionGroup<'a> {
    pub build_on: &'a BuildPlatform,
    pub build_for: &'a TargetPlatform,
    pub jobs: Vec<&'a BuildJob>,
}

impl<'a> ExecutionGroup<'a> {
    pub fn leader(&self) -> &'a BuildJob {
        self.jobs[0]
    }
}

/// Indices of jobs sharing one `(build_on, build_for)` pair, groups in
/// first-seen order. The first index of each group is its leader.
pub fn duplicate_groups(jobs: &[BuildJob]) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (index, job) in jobs.iter().enumerate() {
        let existing = groups.iter_mut().find(|group| {
            let leader = &jobs[group[0]];
            leader.build_on == job.build_on && leader.build_for == job.build_for
        });
        match existing {
            Some(group) => group.push(index),
            None => groups.push(vec![index]),
        }
    }
    groups
}

/// An ordered, resolved list of jobs for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub project: String,
    pub jobs: Vec<BuildJob>,
}

impl BuildPlan {
    /// Resolve `spec` into a plan.
    pub fn resolve(spec: &ProjectSpec) -> Result<Self> {
        let jobs = resolver::resolve(spec)?;
        Ok(Self {
            project: spec.name.clone(),
            jobs,
        })
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Labels in first-seen order.
    pub fn labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = Vec::new();
        for job in &self.jobs {
            if !labels.contains(&job.platform_label.as_str()) {
                labels.push(&job.platform_label);
            }
        }
        labels
    }

    /// Group identical `(build_on, build_for)` pairs, in first-seen order.
    pub fn execution_groups(&self) -> Vec<ExecutionGroup<'_>> {
        duplicate_groups(&self.jobs)
            .into_iter()
            .map(|indices| {
                let leader = &self.jobs[indices[0]];
                ExecutionGroup {
                    build_on: &leader.build_on,
                    build_for: &leader.build_for,
                    jobs: indices.into_iter().map(|i| &self.jobs[i]).collect(),
                }
            })
            .collect()
    }

    /// Distinct environment keys the plan needs.
    pub fn environment_keys(&self) -> BTreeSet<BuildPlatform> {
        self.jobs.iter().map(|j| j.build_on.clone()).collect()
    }

    /// Keep only the jobs `filter` matches. Unknown labels are an error.
    pub fn select(&self, filter: &PlanFilter) -> Result<BuildPlan> {
        let labels = self.labels();
        if let Some(unknown) = filter
            .platforms
            .iter()
            .find(|p| !labels.contains(&p.as_str()))
        {
            return Err(PlanError::UnknownPlatform(unknown.clone()));
        }
        Ok(BuildPlan {
            project: self.project.clone(),
            jobs: self
                .jobs
                .iter()
                .filter(|j| filter.matches(j))
                .cloned()
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::parse_project;

    fn plan(yaml: &str) -> BuildPlan {
        BuildPlan::resolve(&parse_project(yaml).unwrap()).unwrap()
    }

    const DUPLICATES: &str = "name: demo
base: ubuntu@24.04
platforms:
  amd64:
  native:
    build-on: [amd64]
    build-for: [amd64]
  riscv64-cross:
    build-on: [amd64]
    build-for: [riscv64]
";

    #[test]
    fn test_execution_groups_merge_duplicates() {
        let plan = plan(DUPLICATES);
        let groups = plan.execution_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].jobs.len(), 2);
        assert_eq!(groups[0].leader().platform_label, "amd64");
        assert_eq!(groups[0].jobs[1].platform_label, "native");
        assert_eq!(groups[1].leader().platform_label, "riscv64-cross");
    }

    #[test]
    fn test_environment_keys_deduplicated() {
        let plan = plan(DUPLICATES);
        let keys = plan.environment_keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys.iter().next().unwrap().to_string(), "ubuntu@24.04:amd64");
    }

    #[test]
    fn test_select_by_label() {
        let plan = plan(DUPLICATES);
        let selected = plan
            .select(&PlanFilter {
                platforms: vec!["riscv64-cross".to_string()],
                build_for: vec![],
            })
            .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected.labels(), vec!["riscv64-cross"]);
    }

    #[test]
    fn test_select_by_build_for_keeps_wildcards() {
        let plan = plan(
            "name: demo
base: ubuntu@24.04
platforms:
  arm64:
  amd64:
  docs:
    build-on: [amd64]
    build-for: [all]
",
        );
        let selected = plan
            .select(&PlanFilter {
                platforms: vec![],
                build_for: vec![Architecture::Amd64],
            })
            .unwrap();
        assert_eq!(selected.labels(), vec!["amd64", "docs"]);
    }

    #[test]
    fn test_select_unknown_label() {
        let plan = plan(DUPLICATES);
        let err = plan
            .select(&PlanFilter {
                platforms: vec!["s390x".to_string()],
                build_for: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, PlanError::UnknownPlatform(label) if label == "s390x"));
    }

    #[test]
    fn test_empty_filter_selects_all() {
        let plan = plan(DUPLICATES);
        let filter = PlanFilter::default();
        assert!(filter.is_empty());
        assert_eq!(plan.select(&filter).unwrap(), plan);
    }
}
