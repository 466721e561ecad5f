//! CLI Integration Tests
//!
//! These tests run the `swarmlink` binary end-to-end against a temporary
//! data directory.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

/// Create a CLI command with a temporary data directory
fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("swarmlink").expect("Failed to find swarmlink binary");
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

/// Extract the account id from `identity` output ("Account ID: <hex>")
fn extract_account_id(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Account ID: "))
        .map(|id| id.trim().to_string())
}

// ============================================================================
// Info Command Tests
// ============================================================================

#[test]
fn test_info_command() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("swarmlink v0.1.0"))
        .stdout(predicate::str::contains("Identity:"))
        .stdout(predicate::str::contains("(not initialized)"))
        .stdout(predicate::str::contains("Snode pool: 0 node(s)"));
}

#[test]
fn test_info_shows_data_directory() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains(data_dir.path().display().to_string()));
}

// ============================================================================
// Identity Command Tests
// ============================================================================

#[test]
fn test_identity_show_without_identity_fails() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["identity", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("identity generate"));
}

#[test]
fn test_identity_persists_across_runs() {
    let data_dir = TempDir::new().unwrap();

    let output = cli_cmd(&data_dir)
        .args(["identity", "generate"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let generated = extract_account_id(&String::from_utf8_lossy(&output)).unwrap();
    assert_eq!(generated.len(), 66);
    assert!(generated.starts_with("05"));

    let output = cli_cmd(&data_dir)
        .args(["identity", "show"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let shown = extract_account_id(&String::from_utf8_lossy(&output)).unwrap();
    assert_eq!(generated, shown);

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("Account ID: {}", generated)));
}

#[test]
fn test_identity_generate_requires_force() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir).args(["identity", "generate"]).assert().success();
    cli_cmd(&data_dir)
        .args(["identity", "generate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
    cli_cmd(&data_dir)
        .args(["identity", "generate", "--force"])
        .assert()
        .success();
}

#[test]
fn test_blinded_id_differs_from_account_id() {
    let data_dir = TempDir::new().unwrap();
    cli_cmd(&data_dir).args(["identity", "generate"]).assert().success();

    let server_key = "ab".repeat(32);
    let output = cli_cmd(&data_dir)
        .args(["identity", "blinded", &server_key])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let output = String::from_utf8_lossy(&output);
    let blinded = output.trim().strip_prefix("Blinded ID: ").unwrap();
    assert!(blinded.starts_with("15"));

    cli_cmd(&data_dir)
        .args(["identity", "blinded", "abcd"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("32 bytes"));
}

// ============================================================================
// Config Command Tests
// ============================================================================

#[test]
fn test_config_init_and_show() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
    assert!(data_dir.path().join("config.toml").exists());

    cli_cmd(&data_dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("max_retry_count = 6"))
        .stdout(predicate::str::contains("batch_size = 512"));

    cli_cmd(&data_dir)
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_invalid_config_file_is_reported() {
    let data_dir = TempDir::new().unwrap();
    std::fs::write(data_dir.path().join("config.toml"), "max_retry_count = \"many\"").unwrap();

    cli_cmd(&data_dir)
        .args(["config", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
}

// ============================================================================
// Swarm Inspection Tests
// ============================================================================

#[test]
fn test_swarm_rejects_invalid_account() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["swarm", "not-an-account"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid account id"));
}

#[test]
fn test_swarm_and_cursors_empty() {
    let data_dir = TempDir::new().unwrap();
    let account = format!("05{}", "11".repeat(32));

    cli_cmd(&data_dir)
        .args(["swarm", &account])
        .assert()
        .success()
        .stdout(predicate::str::contains("No cached swarm"));

    cli_cmd(&data_dir)
        .args(["cursors", &account])
        .assert()
        .success()
        .stdout(predicate::str::contains("No cursors"));

    cli_cmd(&data_dir)
        .arg("pool")
        .assert()
        .success()
        .stdout(predicate::str::contains("Snode pool is empty."));
}

// ============================================================================
// Simulation Tests
// ============================================================================

#[test]
fn test_simulate_delivers_and_kicks() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["simulate", "--nodes", "12", "--swarm-size", "4", "--messages", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Alice sent 2 message(s)"))
        .stdout(predicate::str::contains("Bob received 2 message(s)"))
        .stdout(predicate::str::contains("Bob joined \"Simulated group\""))
        .stdout(predicate::str::contains("Bob was removed from the group"));
}

#[test]
fn test_simulate_rejects_tiny_network() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["simulate", "--nodes", "2"])
        .assert()
        .failure();
}
