//! Deterministic artifact names.
//!
//! A label whose jobs all target one platform gets `<project>_<label>.zip`;
//! wildcard targets and interchangeable build-on hosts therefore collapse to a
//! single name. Labels that fan out to several targets get the target slug
//! appended: `<project>_<label>_ubuntu-24.04-riscv64.zip`.
//! Jobs with different targets never end up sharing a name.

use std::collections::BTreeMap;

use multipack_core::{BuildJob, JobId, TargetPlatform};

pub const DEFAULT_EXTENSION: &str = "zip";

/// Replace every character outside `[A-Za-z0-9._-]` with `-`.
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Artifact file name for every job, with the default extension.
pub fn artifact_names(project: &str, jobs: &[BuildJob]) -> BTreeMap<JobId, String> {
    artifact_names_with_extension(project, jobs, DEFAULT_EXTENSION)
}

pub fn artifact_names_with_extension(
    project: &str,
    jobs: &[BuildJob],
    extension: &str,
) -> BTreeMap<JobId, String> {
    let mut targets_by_label: BTreeMap<&str, Vec<&TargetPlatform>> = BTreeMap::new();
    for job in jobs {
        let targets = targets_by_label.entry(&job.platform_label).or_default();
        if !targets.contains(&&job.build_for) {
            targets.push(&job.build_for);
        }
    }

    let mut stems: Vec<String> = jobs
        .iter()
        .map(|job| {
            let single_target = targets_by_label
                .get(job.platform_label.as_str())
                .map_or(true, |targets| targets.len() == 1);
            let stem = if single_target {
                format!("{}_{}", project, job.platform_label)
            } else {
                format!("{}_{}_{}", project, job.platform_label, job.build_for.slug())
            };
            sanitize(&stem)
        })
        .collect();
    disambiguate(jobs, &mut stems);

    jobs.iter()
        .zip(stems)
        .map(|(job, stem)| (job.id(), format!("{stem}.{extension}")))
        .collect()
}

/// Names shared by jobs that build for different targets.
fn clashes<'a>(
    jobs: &'a [BuildJob],
    stems: &[String],
) -> BTreeMap<String, Vec<&'a TargetPlatform>> {
    let mut by_name: BTreeMap<String, Vec<&TargetPlatform>> = BTreeMap::new();
    for (job, stem) in jobs.iter().zip(stems) {
        let targets = by_name.entry(stem.clone()).or_default();
        if !targets.contains(&&job.build_for) {
            targets.push(&job.build_for);
        }
    }
    by_name.retain(|_, targets| targets.len() > 1);
    by_name
}

/// Labels may contain `_`, so `<project>_<label>` for one label can equal
/// `<project>_<label>_<slug>` for another. Jobs sharing a name must build the
/// same target: clashing names first get the target slug appended, then a
/// per-target ordinal until every name is unambiguous.
fn disambiguate(jobs: &[BuildJob], stems: &mut [String]) {
    let clashing = clashes(jobs, stems);
    for (job, stem) in jobs.iter().zip(stems.iter_mut()) {
        if clashing.contains_key(stem.as_str()) {
            *stem = format!("{stem}_{}", sanitize(&job.build_for.slug()));
        }
    }

    for _ in 0..jobs.len() {
        let clashing = clashes(jobs, stems);
        if clashing.is_empty() {
            return;
        }
        for (job, stem) in jobs.iter().zip(stems.iter_mut()) {
            let ordinal = clashing
                .get(stem.as_str())
                .and_then(|targets| targets.iter().position(|t| **t == job.build_for));
            if let Some(ordinal) = ordinal.filter(|&o| o > 0) {
                *stem = format!("{stem}_{ordinal}");
            }
        }
    }
}
