//! CLI integration tests
//!
//! Tests the padre CLI using assert_cmd.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn padre() -> Command {
    Command::cargo_bin("padre")
        .expect("Failed to locate padre binary - ensure it's built before running tests")
}

#[test]
fn test_cli_help() {
    padre()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("padre"))
        .stdout(predicate::str::contains("radiopadre"));
}

#[test]
fn test_cli_version() {
    padre()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("padre"));
}

#[test]
fn test_cli_kill_help() {
    padre()
        .args(["kill", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("all"));
}

#[test]
fn test_cli_kill_requires_target() {
    padre().arg("kill").assert().failure();
}

#[test]
fn test_cli_unknown_backend() {
    padre()
        .args(["--backend", "carrier-pigeon", "ps"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown backend"));
}

#[test]
fn test_cli_ps_unsupported_on_venv() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.toml");
    padre()
        .args(["--config", config.to_str().unwrap(), "config", "init"])
        .assert()
        .success();

    padre()
        .args(["--config", config.to_str().unwrap(), "--backend", "venv", "ps"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not supported by the venv backend"));
}

#[test]
fn test_cli_missing_config_file() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("nope.toml");
    padre()
        .args(["--config", config.to_str().unwrap(), "ps"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_cli_config_init_and_show() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("sub").join("config.toml");

    padre()
        .args(["--config", config.to_str().unwrap(), "config", "init"])
        .assert()
        .success();
    assert!(config.exists());

    padre()
        .args(["--config", config.to_str().unwrap(), "config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("num_ports = 5"));

    padre()
        .args(["--config", config.to_str().unwrap(), "config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn test_cli_bad_remote_ports() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.toml");
    padre()
        .args(["--config", config.to_str().unwrap(), "config", "init"])
        .assert()
        .success();

    padre()
        .args([
            "--config",
            config.to_str().unwrap(),
            "--backend",
            "venv",
            "--remote",
            "1:2",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("expected 5 ports"));
}

#[cfg(unix)]
#[test]
fn test_cli_missing_runscript_prints_remediation() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.toml");
    std::fs::write(
        &config,
        "runscript = \"no-such-runscript-padre\"\nbackends = [\"venv\"]\n",
    )
    .unwrap();

    padre()
        .env("HOME", dir.path())
        .current_dir(dir.path())
        .args(["--config", config.to_str().unwrap(), "--browser", "none"])
        .write_stdin("")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("binary not found"))
        .stdout(predicate::str::contains("PATH"));
}

#[test]
fn test_cli_recent_without_history() {
    let dir = TempDir::new().unwrap();
    padre()
        .env("HOME", dir.path())
        .arg("recent")
        .assert()
        .success()
        .stdout(predicate::str::contains("No recent radiopadre sessions"));

    padre()
        .env("HOME", dir.path())
        .arg("#0")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no recent radiopadre sessions"));
}

#[cfg(unix)]
#[test]
fn test_cli_recent_session_is_rerun() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.toml");
    std::fs::write(
        &config,
        "runscript = \"no-such-runscript-padre\"\nbackends = [\"venv\"]\n",
    )
    .unwrap();

    padre()
        .env("HOME", dir.path())
        .current_dir(dir.path())
        .args(["--config", config.to_str().unwrap(), "--browser", "none", "obs.ipynb", "--auto-init"])
        .write_stdin("")
        .assert()
        .code(1);
    assert!(dir.path().join(".radiopadre").join("padre.sessions.recent").exists());

    padre()
        .env("HOME", dir.path())
        .arg("recent")
        .assert()
        .success()
        .stdout(predicate::str::contains("Your most recent radiopadre sessions are:"))
        .stdout(predicate::str::contains("[#0] --config"))
        .stdout(predicate::str::contains("obs.ipynb"))
        .stdout(predicate::str::contains("--auto-init").not());

    padre()
        .env("HOME", dir.path())
        .current_dir(dir.path())
        .arg("#0")
        .write_stdin("")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Rerunning session #0"))
        .stderr(predicate::str::contains("binary not found"));

    padre()
        .env("HOME", dir.path())
        .arg("#3")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no recent session #3"));
}
