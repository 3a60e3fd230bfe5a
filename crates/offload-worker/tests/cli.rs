//! Command-line behaviour of the worker binary outside a host.

use assert_cmd::Command;
use predicates::prelude::*;

fn worker() -> Command {
    let mut cmd = Command::cargo_bin("offload-worker").unwrap();
    cmd.env_remove("OFFLOAD_CHANNEL_FD");
    cmd
}

#[test]
fn test_requires_a_target() {
    worker()
        .assert()
        .failure()
        .stderr(predicate::str::contains("<TARGET>"));
}

#[test]
fn test_refuses_to_run_without_a_channel() {
    worker()
        .arg("./libunit.so")
        .assert()
        .failure()
        .stderr(predicate::str::contains("OFFLOAD_CHANNEL_FD"));
}

#[test]
fn test_missing_preload_aborts_before_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("libhooks.so");

    worker()
        .arg("./libunit.so")
        .arg(missing.to_str().unwrap())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Cannot find module"))
        .stderr(predicate::str::contains("OFFLOAD_CHANNEL_FD").not());
}

#[test]
fn test_broken_preload_is_reported_as_init_failure() {
    let dir = tempfile::tempdir().unwrap();
    let not_a_library = dir.path().join("libhooks.so");
    std::fs::write(&not_a_library, "not a shared object").unwrap();

    worker()
        .arg("./libunit.so")
        .arg(not_a_library.to_str().unwrap())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to preload"));
}
