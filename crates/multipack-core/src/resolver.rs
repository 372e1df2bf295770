//! Build plan resolution: a validated [`ProjectSpec`] into ordered [`BuildJob`]s.
//!
//! Pure and deterministic. Resolving the same spec twice yields identical job
//! lists. Host capability is not considered here; jobs the host cannot run are
//! skipped by the orchestrator.

use tracing::debug;

use crate::error::ResolutionError;
use crate::model::{
    Architecture, Base, BuildForDeclaration, BuildJob, BuildPlatform, PlatformDeclaration,
    PlatformEntry, PlatformItem, ProjectSpec, TargetArch, TargetPlatform,
};

/// Canonical explicit form of one platform entry after shorthand expansion.
struct Canonical<'a> {
    build_on: Vec<PlatformItem>,
    build_for: CanonicalTargets<'a>,
}

enum CanonicalTargets<'a> {
    All(Option<&'a Base>),
    Items(Vec<PlatformItem>),
}

/// Expand every platform of `spec` into build jobs, in declaration order.
pub fn resolve(spec: &ProjectSpec) -> Result<Vec<BuildJob>, ResolutionError> {
    let mut jobs = Vec::new();
    for entry in &spec.platforms {
        let before = jobs.len();
        resolve_entry(spec, entry, &mut jobs)?;
        if jobs.len() == before {
            return Err(ResolutionError::Internal {
                label: entry.label.clone(),
                detail: "platform produced no jobs".to_string(),
            });
        }
        debug!(
            platform = %entry.label,
            jobs = jobs.len() - before,
            "resolved platform"
        );
    }
    Ok(jobs)
}

fn resolve_entry(
    spec: &ProjectSpec,
    entry: &PlatformEntry,
    jobs: &mut Vec<BuildJob>,
) -> Result<(), ResolutionError> {
    let canonical = canonicalize(entry)?;
    let (run_base, build_base) = entry_bases(spec, entry)?;

    let mut sequence_index = 0;
    for on in &canonical.build_on {
        let on_base = match &on.base {
            Some(base) => base.clone(),
            None => base_or_internal(build_base.or(run_base), entry)?.clone(),
        };
        let build_on = BuildPlatform::new(on_base, on.arch);

        let targets: Vec<TargetPlatform> = match &canonical.build_for {
            CanonicalTargets::All(base) => {
                let base = match base {
                    Some(base) => (*base).clone(),
                    None => base_or_internal(run_base, entry)?.clone(),
                };
                vec![TargetPlatform::all(base)]
            }
            CanonicalTargets::Items(items) => items
                .iter()
                .map(|item| {
                    let base = match &item.base {
                        Some(base) => base.clone(),
                        None => base_or_internal(run_base, entry)?.clone(),
                    };
                    Ok(TargetPlatform::new(base, item.arch))
                })
                .collect::<Result<_, ResolutionError>>()?,
        };

        for build_for in targets {
            let cross_compile = match build_for.arch {
                TargetArch::Arch(arch) => arch != build_on.arch,
                TargetArch::All => false,
            };
            jobs.push(BuildJob {
                platform_label: entry.label.clone(),
                build_on: build_on.clone(),
                build_for,
                sequence_index,
                cross_compile,
            });
            sequence_index += 1;
        }
    }
    Ok(())
}

/// Shorthand entries become `build_on = build_for = {label}`.
fn canonicalize(entry: &PlatformEntry) -> Result<Canonical<'_>, ResolutionError> {
    match &entry.declaration {
        PlatformDeclaration::Shorthand => {
            let arch = entry.label.parse::<Architecture>().map_err(|e| {
                ResolutionError::Internal {
                    label: entry.label.clone(),
                    detail: format!("shorthand label is not an architecture: {e}"),
                }
            })?;
            Ok(Canonical {
                build_on: vec![PlatformItem::arch(arch)],
                build_for: CanonicalTargets::Items(vec![PlatformItem::arch(arch)]),
            })
        }
        PlatformDeclaration::Explicit {
            build_on,
            build_for,
        } => {
            if build_on.is_empty() {
                return Err(ResolutionError::Internal {
                    label: entry.label.clone(),
                    detail: "empty build-on".to_string(),
                });
            }
            let build_for = match build_for {
                BuildForDeclaration::AllArchitectures { base } => {
                    CanonicalTargets::All(base.as_ref())
                }
                BuildForDeclaration::Targets(items) if items.is_empty() => {
                    return Err(ResolutionError::Internal {
                        label: entry.label.clone(),
                        detail: "empty build-for".to_string(),
                    })
                }
                BuildForDeclaration::Targets(items) => CanonicalTargets::Items(items.clone()),
            };
            Ok(Canonical {
                build_on: build_on.clone(),
                build_for,
            })
        }
    }
}

/// The run base for targets and the base used on the build-on side.
///
/// `base_override` wins over the top-level base. In single-base form an
/// interim top-level base requires `build-base`, which then becomes the
/// build-on base.
fn entry_bases<'a>(
    spec: &'a ProjectSpec,
    entry: &'a PlatformEntry,
) -> Result<(Option<&'a Base>, Option<&'a Base>), ResolutionError> {
    if let Some(base) = &entry.base_override {
        return Ok((Some(base), None));
    }
    let run_base = spec.top_level_base.as_ref();
    let build_base = spec.top_level_build_base.as_ref();
    if let Some(base) = run_base {
        if base.is_interim() && build_base.is_none() && !entry_is_fully_prefixed(entry) {
            return Err(ResolutionError::MissingBuildBase {
                label: entry.label.clone(),
                base: base.to_string(),
            });
        }
    }
    Ok((run_base, build_base))
}

/// Every item carries its own base, so no top-level base is consulted.
fn entry_is_fully_prefixed(entry: &PlatformEntry) -> bool {
    match &entry.declaration {
        PlatformDeclaration::Shorthand => false,
        PlatformDeclaration::Explicit {
            build_on,
            build_for,
        } => {
            let for_prefixed = match build_for {
                BuildForDeclaration::AllArchitectures { base } => base.is_some(),
                BuildForDeclaration::Targets(items) => items.iter().all(|i| i.base.is_some()),
            };
            for_prefixed && build_on.iter().all(|i| i.base.is_some())
        }
    }
}

fn base_or_internal<'a>(
    base: Option<&'a Base>,
    entry: &PlatformEntry,
) -> Result<&'a Base, ResolutionError> {
    base.ok_or_else(|| ResolutionError::Internal {
        label: entry.label.clone(),
        detail: "no effective base".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PartDefinitions;

    fn noble() -> Base {
        Base::new("ubuntu", "24.04")
    }

    fn single_base(platforms: Vec<PlatformEntry>) -> ProjectSpec {
        ProjectSpec {
            name: "demo".to_string(),
            top_level_base: Some(noble()),
            top_level_build_base: None,
            platforms,
            parts: PartDefinitions::empty(),
        }
    }

    #[test]
    fn test_shorthand_expands_to_native_job() {
        let jobs = resolve(&single_base(vec![PlatformEntry::shorthand("arm64")])).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].build_on, BuildPlatform::new(noble(), Architecture::Arm64));
        assert_eq!(jobs[0].build_for, TargetPlatform::new(noble(), Architecture::Arm64));
        assert!(!jobs[0].cross_compile);
    }

    #[test]
    fn test_sequence_index_per_label() {
        let spec = single_base(vec![
            PlatformEntry::explicit(
                "multi",
                vec![
                    PlatformItem::arch(Architecture::Amd64),
                    PlatformItem::arch(Architecture::Arm64),
                ],
                BuildForDeclaration::Targets(vec![
                    PlatformItem::arch(Architecture::Amd64),
                    PlatformItem::arch(Architecture::S390x),
                ]),
            ),
            PlatformEntry::shorthand("riscv64"),
        ]);
        let jobs = resolve(&spec).unwrap();
        let indices: Vec<(&str, usize)> = jobs
            .iter()
            .map(|j| (j.platform_label.as_str(), j.sequence_index))
            .collect();
        assert_eq!(
            indices,
            vec![("multi", 0), ("multi", 1), ("multi", 2), ("multi", 3), ("riscv64", 0)]
        );
        // build_on is the outer loop
        assert_eq!(jobs[1].build_on.arch, Architecture::Amd64);
        assert_eq!(jobs[1].build_for.arch, TargetArch::Arch(Architecture::S390x));
        assert_eq!(jobs[2].build_on.arch, Architecture::Arm64);
    }

    #[test]
    fn test_interim_base_without_build_base_fails() {
        let mut spec = single_base(vec![PlatformEntry::shorthand("amd64")]);
        spec.top_level_base = Some(Base::new("ubuntu", "24.10"));
        let err = resolve(&spec).unwrap_err();
        assert_eq!(
            err,
            ResolutionError::MissingBuildBase {
                label: "amd64".to_string(),
                base: "ubuntu@24.10".to_string(),
            }
        );
    }

    #[test]
    fn test_build_base_used_for_build_on_side() {
        let mut spec = single_base(vec![PlatformEntry::shorthand("amd64")]);
        spec.top_level_base = Some(Base::new("ubuntu", "24.10"));
        spec.top_level_build_base = Some(Base::new("ubuntu", "devel"));
        let jobs = resolve(&spec).unwrap();
        assert_eq!(jobs[0].build_on.base, Base::new("ubuntu", "devel"));
        assert_eq!(jobs[0].build_for.base, Base::new("ubuntu", "24.10"));
    }

    #[test]
    fn test_base_override_applies_to_both_sides() {
        let spec = ProjectSpec {
            name: "demo".to_string(),
            top_level_base: None,
            top_level_build_base: None,
            platforms: vec![PlatformEntry::shorthand("amd64")
                .with_base_override(Base::new("ubuntu", "22.04"))],
            parts: PartDefinitions::empty(),
        };
        let jobs = resolve(&spec).unwrap();
        assert_eq!(jobs[0].build_on.base, Base::new("ubuntu", "22.04"));
        assert_eq!(jobs[0].build_for.base, Base::new("ubuntu", "22.04"));
    }

    #[test]
    fn test_item_prefix_wins() {
        let spec = ProjectSpec {
            name: "demo".to_string(),
            top_level_base: None,
            top_level_build_base: None,
            platforms: vec![PlatformEntry::explicit(
                "jammy-on-noble",
                vec![PlatformItem::with_base(noble(), Architecture::Amd64)],
                BuildForDeclaration::Targets(vec![PlatformItem::with_base(
                    Base::new("ubuntu", "22.04"),
                    Architecture::Amd64,
                )]),
            )],
            parts: PartDefinitions::empty(),
        };
        let jobs = resolve(&spec).unwrap();
        assert_eq!(jobs[0].build_on.base, noble());
        assert_eq!(jobs[0].build_for.base, Base::new("ubuntu", "22.04"));
        assert!(!jobs[0].cross_compile);
    }

    #[test]
    fn test_missing_base_is_internal_error() {
        let mut spec = single_base(vec![PlatformEntry::shorthand("amd64")]);
        spec.top_level_base = None;
        assert!(matches!(
            resolve(&spec).unwrap_err(),
            ResolutionError::Internal { .. }
        ));
    }
}
