//! Command-line surface checks

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_the_backend_and_uninstall_flags() {
    Command::cargo_bin("modelstack")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--backend"))
        .stdout(predicate::str::contains("--distro"))
        .stdout(predicate::str::contains("--uninstall"))
        .stdout(predicate::str::contains("compat-layer"))
        .stdout(predicate::str::contains("isolated-runtime"));
}

#[test]
fn version_flag_succeeds() {
    Command::cargo_bin("modelstack")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("modelstack"));
}

#[test]
fn unknown_backend_values_are_rejected_before_any_work() {
    Command::cargo_bin("modelstack")
        .unwrap()
        .args(["--backend", "mainframe"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn unknown_flags_are_rejected() {
    Command::cargo_bin("modelstack")
        .unwrap()
        .arg("--frobnicate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unexpected argument"));
}
