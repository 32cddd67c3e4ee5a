//! End-to-end tests for the `bus` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn bus() -> Command {
    let mut cmd = Command::cargo_bin("bus").unwrap();
    cmd.env_remove("BUS_CONFIG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn send_reports_messages_that_did_not_fit() {
    bus()
        .args(["send", "--queue", "orders", "-n", "4", "--max-batch-count", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Sent 3 message(s) in 1 batch(es) to orders",
        ))
        .stdout(predicate::str::contains("Message 3 did not fit in the batch"));
}

#[test]
fn process_prints_seeded_messages() {
    bus()
        .args([
            "process",
            "--queue",
            "orders",
            "--seed",
            "2",
            "--stop-after",
            "2",
            "--duration",
            "10",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Received: This a message - 0"))
        .stdout(predicate::str::contains("Processed 2 message(s), 0 failed"));
}

#[test]
fn config_show_renders_defaults() {
    bus()
        .args(["config", "--show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("concurrency_limit"))
        .stdout(predicate::str::contains("memory://local"));
}

#[test]
fn invalid_configuration_exits_with_configuration_code() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[client.batch]\nmax_batch_count = 0").unwrap();

    bus()
        .arg("--config")
        .arg(file.path())
        .arg("config")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn environment_overrides_configuration() {
    bus()
        .env("BUS__PROCESSOR__CONCURRENCY_LIMIT", "7")
        .args(["config", "--show", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"concurrency_limit\": 7"));
}

#[test]
fn send_requires_a_target() {
    bus().arg("send").assert().failure();
}
