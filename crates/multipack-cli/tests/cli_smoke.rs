//! Smoke tests for the `multipack` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

const PROJECT: &str = "name: hello
base: ubuntu@24.04
platforms:
  amd64:
  riscv64-cross:
    build-on: [amd64]
    build-for: [riscv64]
parts:
  hello:
    plugin: nil
";

fn project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("multipack.yaml"), PROJECT).unwrap();
    dir
}

fn multipack() -> Command {
    let mut cmd = Command::cargo_bin("multipack").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn plan_lists_resolved_jobs() {
    let dir = project();
    multipack()
        .args(["plan", "--project-dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Jobs: 2"))
        .stdout(predicate::str::contains(
            "amd64#0  build-on ubuntu@24.04:amd64  build-for ubuntu@24.04:amd64",
        ))
        .stdout(predicate::str::contains(
            "riscv64-cross#0  build-on ubuntu@24.04:amd64  build-for ubuntu@24.04:riscv64 (cross)",
        ));
}

#[test]
fn plan_json_is_parseable() {
    let dir = project();
    let output = multipack()
        .args(["plan", "--json", "--platform", "riscv64-cross", "--project-dir"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(plan["project"], "hello");
    assert_eq!(plan["jobs"].as_array().unwrap().len(), 1);
    assert_eq!(plan["jobs"][0]["cross_compile"], true);
}

#[test]
fn plan_rejects_unknown_platform() {
    let dir = project();
    multipack()
        .args(["plan", "--platform", "s390x", "--project-dir"])
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("s390x"));
}

#[test]
fn plan_reports_schema_error_path() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("multipack.yaml"),
        "name: hello\nbase: ubuntu@24.04\nplatforms:\n  amd64:\n    build-on: [amd64]\n",
    )
    .unwrap();
    multipack()
        .args(["plan", "--project-dir"])
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("platforms.amd64"));
}

#[test]
fn missing_project_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    multipack()
        .args(["plan", "--project-dir"])
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("multipack.yaml"));
}

#[test]
fn clean_with_no_environments() {
    let dir = tempfile::tempdir().unwrap();
    multipack()
        .args(["clean", "--project-dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("No environments to remove"));
}
