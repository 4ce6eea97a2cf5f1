//! Integration tests for the gatekeeper CLI.
//!
//! These drive the built binary through its offline modes: config
//! verification, flattening, build-db management and failure simulation.
//! Nothing here touches the network.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a gatekeeper Command
fn gatekeeper() -> Command {
    cargo_bin_cmd!("gatekeeper")
}

const CONFIG: &str = r#"{
    "http://master.example/": [
        {
            "closing_steps": ["compile"],
            "tree_notify": ["a@x.org"],
            "status_template": "Build %(builder_name)s failed: %(unsatisfied)s"
        }
    ]
}"#;

/// Write a config file into a fresh temp dir.
fn setup_config(content: &str) -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gatekeeper.json");
    fs::write(&path, content).unwrap();
    (dir, path)
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        gatekeeper().arg("--help").assert().success();
    }

    #[test]
    fn test_version() {
        gatekeeper().arg("--version").assert().success();
    }

    #[test]
    fn test_masters_required_outside_verify_modes() {
        gatekeeper().assert().failure();
    }
}

mod verify_mode {
    use super::*;

    #[test]
    fn test_verify_accepts_valid_config() {
        let (_dir, config) = setup_config(CONFIG);
        gatekeeper()
            .arg("--verify")
            .arg("--json")
            .arg(&config)
            .assert()
            .success();
    }

    #[test]
    fn test_verify_rejects_malformed_config_with_exit_1() {
        let (_dir, config) = setup_config(r#"{"http://m": [{"closing_steps": ["*"]}]}"#);
        gatekeeper()
            .arg("--verify")
            .arg("--json")
            .arg(&config)
            .assert()
            .code(1);
    }

    #[test]
    fn test_verify_rejects_unparseable_json_with_exit_1() {
        let (_dir, config) = setup_config("{not json");
        gatekeeper()
            .arg("--verify")
            .arg("--json")
            .arg(&config)
            .assert()
            .code(1);
    }

    #[test]
    fn test_missing_config_file_is_a_config_error() {
        gatekeeper()
            .arg("--verify")
            .arg("--json")
            .arg("/nonexistent/gatekeeper.json")
            .assert()
            .code(1);
    }
}

mod flatten_mode {
    use super::*;

    #[test]
    fn test_flatten_output_is_deterministic_and_hashed() {
        let (_dir, config) = setup_config(CONFIG);

        let first = gatekeeper()
            .arg("--flatten-json")
            .arg("--json")
            .arg(&config)
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let second = gatekeeper()
            .arg("--flatten-json")
            .arg("--json")
            .arg(&config)
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        assert_eq!(first, second);

        let parsed: serde_json::Value = serde_json::from_slice(&first).unwrap();
        let section = &parsed["http://master.example"][0];
        assert!(!section["hash"].as_str().unwrap().is_empty());
        // Defaults were applied during expansion
        assert_eq!(section["close_tree"], serde_json::json!(true));
    }

    #[test]
    fn test_flatten_no_hashes_omits_hash_field() {
        let (_dir, config) = setup_config(CONFIG);
        gatekeeper()
            .arg("--flatten-json")
            .arg("--no-hashes")
            .arg("--json")
            .arg(&config)
            .assert()
            .success()
            .stdout(predicate::str::contains("\"hash\"").not());
    }
}

mod pipeline {
    use super::*;

    #[test]
    fn test_unknown_master_exits_1() {
        let (dir, config) = setup_config(CONFIG);
        gatekeeper()
            .current_dir(dir.path())
            .arg("http://other.example")
            .arg("--json")
            .arg(&config)
            .assert()
            .code(1);
    }

    #[test]
    fn test_clear_build_db_writes_empty_db() {
        let (dir, config) = setup_config(CONFIG);
        let db_path = dir.path().join("build_db.json");
        // Simulation keeps the run offline; --clear-build-db still writes
        // the empty db up front.
        gatekeeper()
            .current_dir(dir.path())
            .arg("http://master.example")
            .arg("--json")
            .arg(&config)
            .arg("--build-db")
            .arg(&db_path)
            .arg("--clear-build-db")
            .arg("--simulate-master")
            .arg("http://master.example")
            .arg("--simulate-builder")
            .arg("B")
            .arg("--simulate-step")
            .arg("compile")
            .assert()
            .success();

        let db: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&db_path).unwrap()).unwrap();
        // Simulation never persists classification results.
        assert_eq!(db["masters"], serde_json::json!({}));
    }

    #[test]
    fn test_simulation_requires_steps() {
        let (dir, config) = setup_config(CONFIG);
        gatekeeper()
            .current_dir(dir.path())
            .arg("http://master.example")
            .arg("--json")
            .arg(&config)
            .arg("--simulate-master")
            .arg("http://master.example")
            .arg("--simulate-builder")
            .arg("B")
            .assert()
            .code(1);
    }

    #[test]
    fn test_simulation_run_succeeds_offline() {
        let (dir, config) = setup_config(CONFIG);
        gatekeeper()
            .current_dir(dir.path())
            .arg("http://master.example")
            .arg("--json")
            .arg(&config)
            .arg("--simulate-master")
            .arg("http://master.example")
            .arg("--simulate-builder")
            .arg("B")
            .arg("--simulate-step")
            .arg("compile")
            .assert()
            .success();
        // No db was written: simulation suppresses the save.
        assert!(!dir.path().join("build_db.json").exists());
    }

    #[test]
    fn test_status_write_flags_require_password_file() {
        let (dir, config) = setup_config(CONFIG);
        gatekeeper()
            .current_dir(dir.path())
            .arg("http://master.example")
            .arg("--json")
            .arg(&config)
            .arg("--set-status")
            .arg("--status-url")
            .arg("http://tree.example")
            .arg("--simulate-master")
            .arg("http://master.example")
            .arg("--simulate-builder")
            .arg("B")
            .arg("--simulate-step")
            .arg("compile")
            .assert()
            .code(1);
    }
}
