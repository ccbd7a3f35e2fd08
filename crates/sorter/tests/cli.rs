//! CLI smoke tests for the `sorter` binary.
//!
//! Runs every subcommand against temp files so no real config is touched.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

#[allow(deprecated)]
fn sorter_cmd() -> Command {
    let mut cmd = Command::cargo_bin("sorter").expect("sorter binary should be built");
    cmd.env_remove("SORTER_CONFIG");
    cmd.env_remove("RUST_LOG");
    cmd.args(["--log-level", "warn"]);
    cmd
}

fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn json_lines(stdout: &[u8]) -> Vec<serde_json::Value> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("stdout line is JSON"))
        .collect()
}

// =============================================================================
// registry / check-config
// =============================================================================

#[test]
fn registry_lists_builtin_commands() {
    sorter_cmd()
        .arg("registry")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"token\": \"self_stop\""))
        .stdout(predicate::str::contains("\"token\": \"start_aa\""))
        .stdout(predicate::str::contains("SERVICE_MODE"));
}

#[test]
fn check_config_without_file_uses_defaults() {
    sorter_cmd()
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("config ok: built-in defaults"))
        .stdout(predicate::str::contains("machine_id: MACHINE001"));
}

#[test]
fn check_config_reads_file_from_env() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = write(
        tmp.path(),
        "sorter.toml",
        "[general]\nmachine_id = \"LINE-3\"\n\n[intake]\npanel_echo_window_secs = 15\n",
    );
    sorter_cmd()
        .env("SORTER_CONFIG", &path)
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("machine_id: LINE-3"))
        .stdout(predicate::str::contains("panel_echo_window_secs: 15"));
}

#[test]
fn invalid_config_fails_with_remediation() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = write(
        tmp.path(),
        "sorter.toml",
        "[[commands]]\ntoken = \"stop\"\nactuator_command = \"ALL_STOP\"\npanel_class = \"off\"\nmode = \"operational\"\n",
    );
    sorter_cmd()
        .arg("--config")
        .arg(&path)
        .arg("check-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("self_stop"));
}

#[test]
fn missing_config_file_fails() {
    sorter_cmd()
        .args(["--config", "/nonexistent/sorter.toml", "check-config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

// =============================================================================
// replay
// =============================================================================

const FAULT_SCENARIO: &str = r#"{"steps": [
    {"action": "register"},
    {"action": "panel", "class": "aa"},
    {"action": "process"},
    {"action": "fault", "node_name": "camera", "message": "no frames", "advance_secs": 5},
    {"action": "process"}
]}"#;

#[test]
fn replay_prints_one_report_per_step_and_final_state() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = write(tmp.path(), "fault.json", FAULT_SCENARIO);
    let output = sorter_cmd()
        .arg("replay")
        .arg(&path)
        .args(["--start", "2024-03-01T08:00:00Z"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let lines = json_lines(&output.stdout);
    assert_eq!(lines.len(), 6);
    assert_eq!(lines[0]["report"]["result"], "flag_recorded");
    assert_eq!(lines[2]["report"]["evaluations"][0]["verdict"]["verdict"], "accept");
    assert_eq!(lines[3]["at"], "2024-03-01T08:00:05Z");
    assert_eq!(lines[3]["report"]["result"], "fault");

    let state = &lines[5]["final"];
    assert_eq!(state["current"]["command"]["definition"]["token"], "self_stop");
    assert_eq!(state["stats"]["accepted"], 2);
    assert_eq!(state["pending"], 0);
}

#[test]
fn replay_of_malformed_scenario_fails() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = write(tmp.path(), "bad.json", r#"{"steps": [{"action": "warp"}]}"#);
    sorter_cmd()
        .arg("replay")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load scenario"));
}

// =============================================================================
// run
// =============================================================================

#[test]
fn run_processes_stdin_actions() {
    let input = [
        r#"{"action": "register"}"#,
        r#"{"action": "panel", "class": "b"}"#,
        "",
        "not json",
        r#"{"action": "panel", "class": "a"}"#,
    ]
    .join("\n");

    let output = sorter_cmd()
        .arg("run")
        .write_stdin(input)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let lines = json_lines(&output.stdout);
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[1]["evaluations"][0]["verdict"]["verdict"], "accept");
    assert_eq!(lines[1]["evaluations"][0]["token"], "panel_b");
    assert_eq!(lines[2]["line"], 4);
    assert!(lines[2]["error"].is_string());
    // Grade change mid-run: rejected, then the machine stops itself.
    assert_eq!(lines[3]["evaluations"][0]["verdict"]["reason"], "local_mid_run");
    assert_eq!(lines[3]["evaluations"][1]["token"], "self_stop");
}

// =============================================================================
// Bundled examples
// =============================================================================

fn repo_root() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[test]
fn example_config_is_valid() {
    sorter_cmd()
        .arg("--config")
        .arg(repo_root().join("sorter.example.toml"))
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("config ok"));
}

#[test]
fn bundled_scenarios_replay() {
    for name in ["remote_session.json", "disable_and_fault.json"] {
        let output = sorter_cmd()
            .arg("replay")
            .arg(repo_root().join("scenarios").join(name))
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "{name}: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        let lines = json_lines(&output.stdout);
        assert!(lines.last().unwrap().get("final").is_some(), "{name}");
    }
}
