//! Project file validation: raw YAML into a [`ProjectSpec`].
//!
//! Only the fields that drive build planning are interpreted here (`name`,
//! `base`, `build-base`, `platforms`, `parts`); everything else in the project
//! file is left to other tools. Errors carry the dotted key path of the
//! offending value.

use std::path::Path;

use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::error::{PlanError, SchemaError};
use crate::model::{
    Architecture, Base, BuildForDeclaration, PartDefinitions, PlatformDeclaration, PlatformEntry,
    PlatformItem, ProjectSpec, TargetArch,
};

/// Default project file name.
pub const PROJECT_FILE: &str = "multipack.yaml";

const DOCUMENT: &str = "<document>";
const PLATFORM_KEYS: [&str; 3] = ["base", "build-on", "build-for"];

type SchemaResult<T> = std::result::Result<T, SchemaError>;

/// Read and validate a project file from disk.
pub fn load_project(path: &Path) -> crate::error::Result<ProjectSpec> {
    let text = std::fs::read_to_string(path).map_err(|source| PlanError::Io {
        path: path.display().to_string(),
        source,
    })?;
    debug!(path = %path.display(), "loaded project file");
    Ok(parse_project(&text)?)
}

/// Parse and validate project YAML.
pub fn parse_project(yaml: &str) -> SchemaResult<ProjectSpec> {
    let value: Value =
        serde_yaml::from_str(yaml).map_err(|e| SchemaError::new(DOCUMENT, e.to_string()))?;
    from_value(&value)
}

/// Validate an already-parsed YAML document.
pub fn from_value(value: &Value) -> SchemaResult<ProjectSpec> {
    let root = value
        .as_mapping()
        .ok_or_else(|| SchemaError::new(DOCUMENT, "expected a mapping at the top level"))?;

    let name = match root.get("name") {
        Some(Value::String(name)) if is_valid_name(name) => name.clone(),
        Some(Value::String(name)) => {
            return Err(SchemaError::new(
                "name",
                format!("'{name}' may only contain letters, digits, '.', '_' and '-'"),
            ))
        }
        Some(_) => return Err(SchemaError::new("name", "expected a string")),
        None => return Err(SchemaError::new("name", "required")),
    };

    let top_level_base = optional_base(root, "base", "base")?;
    let top_level_build_base = optional_base(root, "build-base", "build-base")?;

    let platforms_map = match root.get("platforms") {
        Some(Value::Mapping(map)) => map,
        Some(_) => return Err(SchemaError::new("platforms", "expected a mapping")),
        None => {
            return Err(SchemaError::new(
                "platforms",
                "required: declare at least one platform",
            ))
        }
    };
    if platforms_map.is_empty() {
        return Err(SchemaError::new(
            "platforms",
            "declare at least one platform",
        ));
    }

    let mut platforms = Vec::with_capacity(platforms_map.len());
    for (key, value) in platforms_map {
        let label = match key {
            Value::String(label) if is_valid_name(label) => label.clone(),
            Value::String(label) => {
                return Err(SchemaError::new(
                    format!("platforms.{label}"),
                    "platform labels may only contain letters, digits, '.', '_' and '-'",
                ))
            }
            _ => return Err(SchemaError::new("platforms", "platform labels must be strings")),
        };
        platforms.push(parse_entry(&label, value)?);
    }

    check_base_form(&platforms, top_level_base.as_ref(), top_level_build_base.as_ref())?;

    let parts = match root.get("parts") {
        None | Some(Value::Null) => PartDefinitions::empty(),
        Some(value @ Value::Mapping(_)) => serde_json::to_value(value)
            .map(PartDefinitions)
            .map_err(|e| SchemaError::new("parts", e.to_string()))?,
        Some(_) => return Err(SchemaError::new("parts", "expected a mapping")),
    };

    Ok(ProjectSpec {
        name,
        top_level_base,
        top_level_build_base,
        platforms,
        parts,
    })
}

/// Enforce "every entry multi-base, or none" and the top-level base rules.
fn check_base_form(
    platforms: &[PlatformEntry],
    base: Option<&Base>,
    build_base: Option<&Base>,
) -> SchemaResult<()> {
    let Some(first) = platforms.first() else {
        return Ok(());
    };
    let multi_base = first.is_multi_base();
    if let Some(odd) = platforms.iter().find(|p| p.is_multi_base() != multi_base) {
        return Err(SchemaError::new(
            format!("platforms.{}", odd.label),
            "mixes multi-base and single-base platform declarations; either every platform \
             declares its base or none does",
        ));
    }

    if multi_base {
        if base.is_some() {
            return Err(SchemaError::new(
                "base",
                "must not be set when every platform declares its own base",
            ));
        }
        if build_base.is_some() {
            return Err(SchemaError::new(
                "build-base",
                "only valid with a top-level base",
            ));
        }
    } else if base.is_none() {
        return Err(SchemaError::new(
            "base",
            "required when platforms do not declare their own base",
        ));
    }
    Ok(())
}

fn parse_entry(label: &str, value: &Value) -> SchemaResult<PlatformEntry> {
    let path = format!("platforms.{label}");
    let map = match value {
        Value::Null => return shorthand(label, &path, None),
        Value::Mapping(map) => map,
        _ => return Err(SchemaError::new(path, "expected a mapping or nothing")),
    };

    for key in map.keys() {
        match key.as_str() {
            Some(k) if PLATFORM_KEYS.contains(&k) => {}
            Some(k) => return Err(SchemaError::new(format!("{path}.{k}"), "unknown key")),
            None => return Err(SchemaError::new(path, "keys must be strings")),
        }
    }

    let base_override = optional_base(map, "base", &format!("{path}.base"))?;
    let build_on = map.get("build-on");
    let build_for = map.get("build-for");

    match (build_on, build_for) {
        (None, None) => shorthand(label, &path, base_override),
        (Some(_), None) => Err(SchemaError::new(
            format!("{path}.build-for"),
            "required when build-on is set",
        )),
        (None, Some(_)) => Err(SchemaError::new(
            format!("{path}.build-on"),
            "required when build-for is set",
        )),
        (Some(on), Some(target)) => {
            let on_path = format!("{path}.build-on");
            let mut build_on = Vec::new();
            for (i, raw) in string_list(on, &on_path)?.iter().enumerate() {
                let item_path = format!("{on_path}[{i}]");
                let (base, arch) = parse_item(raw, &item_path)?;
                let arch = arch.concrete().ok_or_else(|| {
                    SchemaError::new(&item_path, "'all' is only valid in build-for")
                })?;
                push_unique(&mut build_on, PlatformItem { base, arch }, &item_path)?;
            }

            let build_for = parse_build_for(target, &format!("{path}.build-for"))?;

            let entry = PlatformEntry {
                label: label.to_string(),
                base_override,
                declaration: PlatformDeclaration::Explicit {
                    build_on,
                    build_for,
                },
            };
            check_items_have_base(&entry, &path)?;
            Ok(entry)
        }
    }
}

/// A multi-base entry without a `base` key must prefix every item, or
/// some build would have no base to run on.
fn check_items_have_base(entry: &PlatformEntry, path: &str) -> SchemaResult<()> {
    if entry.base_override.is_some() || !entry.is_multi_base() {
        return Ok(());
    }
    let PlatformDeclaration::Explicit {
        build_on,
        build_for,
    } = &entry.declaration
    else {
        return Ok(());
    };
    const MISSING: &str = "needs a base prefix when other items in this platform declare one \
                           and no platform base is set";
    if let Some(i) = build_on.iter().position(|item| item.base.is_none()) {
        return Err(SchemaError::new(format!("{path}.build-on[{i}]"), MISSING));
    }
    let unprefixed = match build_for {
        BuildForDeclaration::AllArchitectures { base } => base.is_none().then_some(0),
        BuildForDeclaration::Targets(items) => items.iter().position(|item| item.base.is_none()),
    };
    match unprefixed {
        Some(i) => Err(SchemaError::new(format!("{path}.build-for[{i}]"), MISSING)),
        None => Ok(()),
    }
}

fn shorthand(label: &str, path: &str, base_override: Option<Base>) -> SchemaResult<PlatformEntry> {
    label.parse::<Architecture>().map_err(|_| {
        SchemaError::new(
            path,
            format!(
                "'{label}' is not a known architecture; declare build-on and build-for explicitly"
            ),
        )
    })?;
    Ok(PlatformEntry {
        label: label.to_string(),
        base_override,
        declaration: PlatformDeclaration::Shorthand,
    })
}

fn parse_build_for(value: &Value, path: &str) -> SchemaResult<BuildForDeclaration> {
    let raw = string_list(value, path)?;
    let mut targets = Vec::new();
    let mut wildcard: Option<Option<Base>> = None;

    for (i, item) in raw.iter().enumerate() {
        let item_path = format!("{path}[{i}]");
        let (base, arch) = parse_item(item, &item_path)?;
        match arch {
            TargetArch::All => wildcard = Some(base),
            TargetArch::Arch(arch) => push_unique(&mut targets, PlatformItem { base, arch }, &item_path)?,
        }
    }

    match wildcard {
        Some(_) if raw.len() > 1 => Err(SchemaError::new(
            path,
            "'all' cannot be combined with other build-for targets",
        )),
        Some(base) => Ok(BuildForDeclaration::AllArchitectures { base }),
        None => Ok(BuildForDeclaration::Targets(targets)),
    }
}

/// `amd64`, `all`, or `ubuntu@22.04:amd64`.
fn parse_item(raw: &str, path: &str) -> SchemaResult<(Option<Base>, TargetArch)> {
    let (base, arch) = match raw.rsplit_once(':') {
        Some((base, arch)) => {
            let base = base
                .parse::<Base>()
                .map_err(|e| SchemaError::new(path, e.to_string()))?;
            (Some(base), arch)
        }
        None => (None, raw),
    };
    let arch = arch
        .parse::<TargetArch>()
        .map_err(|e| SchemaError::new(path, e.to_string()))?;
    Ok((base, arch))
}

/// A non-empty list of strings; a lone string is accepted as a one-element list.
fn string_list(value: &Value, path: &str) -> SchemaResult<Vec<String>> {
    let items = match value {
        Value::String(s) => vec![s.clone()],
        Value::Sequence(seq) => seq
            .iter()
            .enumerate()
            .map(|(i, v)| match v {
                Value::String(s) => Ok(s.clone()),
                _ => Err(SchemaError::new(format!("{path}[{i}]"), "expected a string")),
            })
            .collect::<SchemaResult<Vec<_>>>()?,
        _ => return Err(SchemaError::new(path, "expected a list of strings")),
    };
    if items.is_empty() {
        return Err(SchemaError::new(path, "must not be empty"));
    }
    Ok(items)
}

fn push_unique(items: &mut Vec<PlatformItem>, item: PlatformItem, path: &str) -> SchemaResult<()> {
    if items.contains(&item) {
        return Err(SchemaError::new(path, format!("duplicate entry '{item}'")));
    }
    items.push(item);
    Ok(())
}

fn optional_base(map: &Mapping, key: &str, path: &str) -> SchemaResult<Option<Base>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => s
            .parse::<Base>()
            .map(Some)
            .map_err(|e| SchemaError::new(path, e.to_string())),
        Some(_) => Err(SchemaError::new(path, "expected a string like 'ubuntu@24.04'")),
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Platform labels in declaration order.
pub fn platform_labels(spec: &ProjectSpec) -> Vec<&str> {
    spec.platforms.iter().map(|p| p.label.as_str()).collect()
}
