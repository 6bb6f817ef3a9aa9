//! CLI exit-code contract.
//!
//! These run the built binary and only exercise commands that never reach
//! the executor or the issue tracker.

use std::fs;
use std::process::Command;

use conveyor::exit_codes;
use tempfile::TempDir;

fn conveyor(temp: &TempDir) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_conveyor"));
    cmd.arg("--root").arg(temp.path()).env_remove("RUST_LOG");
    cmd
}

#[test]
fn usage_error_exits_with_config_code() {
    let temp = TempDir::new().expect("tempdir");
    let status = conveyor(&temp).arg("frobnicate").status().expect("spawn");
    assert_eq!(status.code(), Some(exit_codes::CONFIG));

    let status = conveyor(&temp).arg("run").status().expect("spawn");
    assert_eq!(status.code(), Some(exit_codes::CONFIG));
}

#[test]
fn help_exits_ok() {
    let temp = TempDir::new().expect("tempdir");
    let output = conveyor(&temp).arg("--help").output().expect("spawn");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&output.stdout).contains("resume"));
}

#[test]
fn init_writes_config_and_schemas() {
    let temp = TempDir::new().expect("tempdir");
    let output = conveyor(&temp).arg("init").output().expect("spawn");
    assert_eq!(output.status.code(), Some(exit_codes::OK));

    let config = temp.path().join(".conveyor/config.toml");
    assert!(config.exists());
    let schemas = temp.path().join(".conveyor/schemas");
    for name in ["intake", "stage", "review", "test_run", "test_validation", "publish"] {
        assert!(schemas.join(format!("{name}.schema.json")).exists(), "{name}");
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.lines().all(|line| line.starts_with("init: wrote ")));

    // A second init keeps what is there.
    fs::write(&config, "[executor]\ncommand = [\"my-agent\"]\n").expect("edit config");
    let output = conveyor(&temp).arg("init").output().expect("spawn");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(output.stdout.is_empty());
    assert!(
        fs::read_to_string(&config)
            .expect("config")
            .contains("my-agent")
    );
}

#[test]
fn status_without_state_fails() {
    let temp = TempDir::new().expect("tempdir");
    let output = conveyor(&temp).arg("status").output().expect("spawn");
    assert_eq!(output.status.code(), Some(exit_codes::FAILED));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no run state"));
}

#[test]
fn resume_without_state_is_rejected() {
    let temp = TempDir::new().expect("tempdir");
    let status = conveyor(&temp).arg("resume").status().expect("spawn");
    assert_eq!(status.code(), Some(exit_codes::CONFIG));
}

#[test]
fn invalid_config_exits_with_config_code() {
    let temp = TempDir::new().expect("tempdir");
    let dir = temp.path().join(".conveyor");
    fs::create_dir_all(&dir).expect("mkdir");
    fs::write(dir.join("config.toml"), "[loops]\ntest_max_iterations = 0\n").expect("write");

    let output = conveyor(&temp).arg("status").output().expect("spawn");
    assert_eq!(output.status.code(), Some(exit_codes::CONFIG));
    assert!(String::from_utf8_lossy(&output.stderr).contains("test_max_iterations"));

    fs::write(dir.join("config.toml"), "not = [valid").expect("write");
    let status = conveyor(&temp).args(["run", "7"]).status().expect("spawn");
    assert_eq!(status.code(), Some(exit_codes::CONFIG));
}
