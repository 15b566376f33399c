#![cfg(unix)]

use assert_cmd::cargo::cargo_bin_cmd;

#[test]
fn help_lists_supervision_flags() {
    let mut cmd = cargo_bin_cmd!("warden");
    cmd.arg("--help");
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");

    assert!(stdout.contains("--enable-heartbeat"));
    assert!(stdout.contains("--max-restarts"));
    assert!(stdout.contains("--grace-period"));
}

#[test]
fn missing_command_fails() {
    let mut cmd = cargo_bin_cmd!("warden");
    cmd.arg("--timeout").arg("5");
    cmd.assert().failure().code(1);
}

#[test]
fn clean_child_exit_ends_supervision_with_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let heartbeat = dir.path().join("hb.txt");

    let mut cmd = cargo_bin_cmd!("warden");
    cmd.arg("--poll-interval")
        .arg("1")
        .arg("--heartbeat-file")
        .arg(&heartbeat)
        .arg("sh")
        .arg("-c")
        .arg(format!("touch {}; exit 0", heartbeat.display()));
    let out = cmd.assert().success();
    let stderr = String::from_utf8(out.get_output().stderr.clone()).expect("utf8");

    assert!(stderr.contains("event=supervisor.child.launched"));
    assert!(stderr.contains("event=supervisor.exited"));
    assert!(!heartbeat.exists(), "heartbeat file should be removed on exit");
}

#[test]
fn exhausted_restart_budget_exits_one() {
    let mut cmd = cargo_bin_cmd!("warden");
    cmd.args([
        "--poll-interval",
        "1",
        "--max-restarts",
        "0",
        "sh",
        "-c",
        "exit 3",
    ]);
    let out = cmd.assert().failure().code(1);
    let stderr = String::from_utf8(out.get_output().stderr.clone()).expect("utf8");

    assert!(stderr.contains("event=supervisor.restart_budget_exhausted"));
}

#[test]
fn missing_heartbeat_terminates_child_and_logs_to_jsonl() {
    let dir = tempfile::tempdir().expect("tempdir");
    let heartbeat = dir.path().join("never-written.txt");
    let log_file = dir.path().join("warden.jsonl");

    let mut cmd = cargo_bin_cmd!("warden");
    cmd.arg("--enable-heartbeat")
        .arg("--timeout")
        .arg("1")
        .arg("--poll-interval")
        .arg("1")
        .arg("--grace-period")
        .arg("1")
        .arg("--max-restarts")
        .arg("0")
        .arg("--heartbeat-file")
        .arg(&heartbeat)
        .arg("--log-file")
        .arg(&log_file)
        .args(["sleep", "30"]);
    let out = cmd.assert().failure().code(1);
    let stderr = String::from_utf8(out.get_output().stderr.clone()).expect("utf8");

    assert!(stderr.contains("event=heartbeat.missing"));
    assert!(stderr.contains("event=termination.signal_sent"));

    let jsonl = std::fs::read_to_string(&log_file).expect("log file");
    let events = jsonl
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).expect("json line"))
        .collect::<Vec<_>>();
    assert!(events
        .iter()
        .any(|event| event.to_string().contains("supervisor.heartbeat_lost")));
}
