/// End-to-end tests for the visionweaver binary
use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Command isolated from the user's configuration and credentials
fn visionweaver(home: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("visionweaver");
    cmd.current_dir(home)
        .env("VISIONWEAVER_DATA_DIR", home)
        .env_remove("VISIONWEAVER_CONFIG")
        .env_remove("VISIONWEAVER_LLM_API_KEY")
        .env_remove("OPENAI_API_KEY")
        .env_remove("RUST_LOG");
    cmd
}

fn write_sqlite_config(dir: &Path) -> PathBuf {
    let path = dir.join("config.toml");
    let db = dir.join("visionweaver.db");
    let content = format!(
        "[gate]\nbackend = \"sqlite\"\ndb_path = {db:?}\n\n[tasks]\nbackend = \"sqlite\"\ndb_path = {db:?}\n",
        db = db.display().to_string()
    );
    fs::write(&path, content).expect("write config");
    path
}

#[test]
fn test_help_lists_commands() {
    let home = TempDir::new().unwrap();
    visionweaver(home.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("submit"))
        .stdout(predicate::str::contains("lease"));
}

#[test]
fn test_check_allows_safe_prompt() {
    let home = TempDir::new().unwrap();
    visionweaver(home.path())
        .args(["check", "a watercolor cat on a windowsill"])
        .assert()
        .success()
        .stdout(predicate::str::contains("allowed"));
}

#[test]
fn test_check_rejects_unsafe_prompt() {
    let home = TempDir::new().unwrap();
    visionweaver(home.path())
        .args(["check", "a poster for an online casino"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("prohibited"));
}

#[test]
fn test_config_masks_api_key() {
    let home = TempDir::new().unwrap();
    visionweaver(home.path())
        .env("VISIONWEAVER_LLM_API_KEY", "sk-very-secret")
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[gate]"))
        .stdout(predicate::str::contains("sk-very-secret").not());
}

#[test]
fn test_missing_config_file_fails() {
    let home = TempDir::new().unwrap();
    visionweaver(home.path())
        .args(["--config", "does-not-exist.toml", "config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Config file not found"));
}

#[test]
fn test_run_without_api_key_fails() {
    let home = TempDir::new().unwrap();
    visionweaver(home.path())
        .args(["run", "Generate a cute cartoon cat"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("API key"));
}

#[test]
fn test_lease_show_on_memory_backend() {
    let home = TempDir::new().unwrap();
    visionweaver(home.path())
        .args(["lease", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("nothing to inspect"));
}

#[test]
fn test_lease_show_and_release_on_sqlite() {
    let home = TempDir::new().unwrap();
    let config = write_sqlite_config(home.path());

    visionweaver(home.path())
        .arg("--config")
        .arg(&config)
        .args(["lease", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Lease is free"));

    visionweaver(home.path())
        .arg("--config")
        .arg(&config)
        .args(["lease", "release"])
        .assert()
        .success()
        .stdout(predicate::str::contains("not held"));
}

#[test]
fn test_status_of_unknown_request_fails() {
    let home = TempDir::new().unwrap();
    let config = write_sqlite_config(home.path());

    visionweaver(home.path())
        .arg("--config")
        .arg(&config)
        .args(["status", "gen_000000000000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No task found"));
}

#[test]
fn test_status_requires_sqlite_backend() {
    let home = TempDir::new().unwrap();
    visionweaver(home.path())
        .args(["status", "gen_000000000000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("tasks.backend"));
}
