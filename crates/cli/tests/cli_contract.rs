use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;

const CONFIG_ENV: [&str; 8] = [
    "BGPROC_ADMIN_WORKERS",
    "BGPROC_USER_WORKERS",
    "BGPROC_ALLOW_OVERFLOW",
    "BGPROC_OVERFLOW_RESERVE",
    "BGPROC_CANCEL_GRACE_MS",
    "BGPROC_POLL_INTERVAL_MS",
    "BGPROC_HISTORY_LIMIT",
    "BGPROC_HISTORY_TTL_MS",
];

/// Binary with no configuration leaking in from the caller's environment
fn bgproc() -> Command {
    let mut cmd = cargo_bin_cmd!("bgproc");
    for key in CONFIG_ENV {
        cmd.env_remove(key);
    }
    cmd.env_remove("RUST_LOG");
    cmd
}

fn stdout_json(cmd: &mut Command) -> Value {
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).expect("stdout should contain valid json")
}

#[test]
fn config_emits_stable_json_contract() {
    let value = stdout_json(bgproc().arg("config"));

    insta::assert_json_snapshot!("cli_config_defaults", value);
}

#[test]
fn config_applies_environment_overrides() {
    let value = stdout_json(
        bgproc()
            .arg("config")
            .env("BGPROC_ADMIN_WORKERS", "3")
            .env("BGPROC_HISTORY_LIMIT", "0"),
    );

    assert_eq!(value["admin_workers"], 3);
    assert_eq!(value["history_limit"], Value::Null);
}

#[test]
fn config_fails_for_malformed_environment() {
    bgproc()
        .arg("config")
        .env("BGPROC_USER_WORKERS", "many")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid environment override"))
        .stderr(predicate::str::contains("BGPROC_USER_WORKERS"));
}

#[test]
fn config_fails_for_invalid_values() {
    bgproc()
        .arg("config")
        .env("BGPROC_ADMIN_WORKERS", "0")
        .assert()
        .failure()
        .stderr(predicate::str::contains("admin pool needs at least one worker"));
}

#[test]
fn config_file_is_saved_to_data_dir() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let config_path = temp.path().join("custom.json");
    let data_dir = temp.path().join("data");
    fs::write(&config_path, r#"{ "admin_workers": 5, "allow_overflow": false }"#).unwrap();

    let value = stdout_json(
        bgproc()
            .arg("config")
            .arg("--config")
            .arg(&config_path)
            .arg("--data-dir")
            .arg(&data_dir)
            .arg("--save"),
    );
    assert_eq!(value["admin_workers"], 5);
    assert_eq!(value["allow_overflow"], false);
    assert!(data_dir.join("scheduler.json").exists());

    let stored = stdout_json(bgproc().arg("config").arg("--data-dir").arg(&data_dir));
    assert_eq!(stored, value);
}

#[test]
fn config_fails_for_missing_file() {
    bgproc()
        .arg("config")
        .arg("--config")
        .arg("does-not-exist.json")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn run_reports_every_process() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let history = temp.path().join("history.jsonl");

    let value = stdout_json(
        bgproc()
            .arg("run")
            .args(["--job", "quota_refresh:high:20"])
            .args(["--job", "mass_backup:normal:20:fail"])
            .args(["--job", "cleanup:normal"])
            .args(["--job", "integrity_check:high"])
            .args(["--admin-workers", "1", "--user-workers", "1"])
            .arg("--history")
            .arg(&history),
    );

    assert_eq!(value["system_info"]["admin_workers"], 1);
    assert_eq!(value["system_info"]["total_requests_processed"], 4);
    assert_eq!(value["stats"]["completed"], 3);
    assert_eq!(value["stats"]["failed"], 1);
    assert_eq!(value["queue_status"]["processing_count"], 0);

    let processes = value["processes"].as_array().expect("processes should be an array");
    let statuses: Vec<&str> = processes.iter().map(|p| p["status"].as_str().unwrap()).collect();
    assert_eq!(statuses, vec!["COMPLETED", "FAILED", "COMPLETED", "COMPLETED"]);
    assert_eq!(processes[0]["priority"], "HIGH");
    assert_eq!(processes[0]["worker_tier"], "admin");
    assert_eq!(processes[1]["priority"], "NORMAL");
    assert_eq!(processes[1]["error_message"], "simulated mass_backup failure");
    assert_eq!(processes[3]["admin_initiated"], true);

    let stored = stdout_json(bgproc().arg("history").arg("--file").arg(&history));
    assert_eq!(stored.as_array().map(Vec::len), Some(4));
}

#[test]
fn run_cancels_remaining_processes_on_timeout() {
    let assert = bgproc()
        .arg("run")
        .args(["--job", "mass_backup:normal:3000"])
        .args(["--job", "cleanup:normal:3000"])
        .args(["--admin-workers", "1", "--user-workers", "1"])
        .args(["--timeout-secs", "0"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("timed out after 0s"));

    let value: Value = serde_json::from_slice(&assert.get_output().stdout)
        .expect("report should still be printed on timeout");
    let processes = value["processes"].as_array().expect("processes should be an array");
    let statuses: Vec<&str> = processes.iter().map(|p| p["status"].as_str().unwrap()).collect();
    assert_eq!(statuses, vec!["CANCELLED", "CANCELLED"]);
    assert_eq!(value["stats"]["cancelled"], 2);
    assert_eq!(value["queue_status"]["processing_count"], 0);
}

#[test]
fn run_fails_for_invalid_priority() {
    bgproc()
        .arg("run")
        .args(["--job", "cleanup:urgent"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid --job"))
        .stderr(predicate::str::contains("invalid priority"));
}

#[test]
fn run_fails_for_unknown_process_type() {
    bgproc()
        .arg("run")
        .args(["--job", "defragment:normal"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown process type"));
}

#[test]
fn run_requires_a_job() {
    bgproc().arg("run").assert().failure();
}

#[test]
fn history_fails_for_missing_file() {
    let temp = tempfile::tempdir().expect("temp dir should be created");

    bgproc()
        .arg("history")
        .arg("--file")
        .arg(temp.path().join("missing.jsonl"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read history"));
}

#[test]
fn version_prints_package_version() {
    bgproc()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}
