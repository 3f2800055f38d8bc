//! CLI integration tests for foreman
//!
//! These exercise the commands that need no tmux session or assistant.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn foreman() -> Command {
    cargo_bin_cmd!("foreman")
}

fn write_manifest(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

const DIAMOND_JSON: &str = r#"{
  "project": { "name": "Shop Front" },
  "workers": [
    { "id": "db", "role": "database", "owned_paths": ["migrations/"],
      "token_budget": { "low": 5000, "high": 20000 } },
    { "id": "api", "role": "backend", "dependencies": ["db"], "owned_paths": ["src/api/"] },
    { "id": "ui", "role": "frontend", "dependencies": ["db"], "owned_paths": ["web/"] },
    { "id": "e2e", "role": "tests", "dependencies": ["api", "ui"] }
  ]
}"#;

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        foreman()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("waves"));
    }

    #[test]
    fn test_version() {
        foreman().arg("--version").assert().success();
    }
}

// =============================================================================
// Manifest validation and waves
// =============================================================================

mod manifests {
    use super::*;

    #[test]
    fn test_validate_json_manifest() {
        let dir = TempDir::new().unwrap();
        let manifest = write_manifest(&dir, "workers.json", DIAMOND_JSON);

        foreman()
            .arg("validate")
            .arg(&manifest)
            .assert()
            .success()
            .stdout(predicate::str::contains("Manifest valid"))
            .stdout(predicate::str::contains("4 worker(s) in 3 wave(s)"))
            .stdout(predicate::str::contains("shop-front"));
    }

    #[test]
    fn test_validate_yaml_manifest() {
        let dir = TempDir::new().unwrap();
        let manifest = write_manifest(
            &dir,
            "workers.yaml",
            r#"
workers:
  - id: core
    role: library
  - id: cli
    role: frontend
    dependencies: [core]
"#,
        );

        foreman()
            .arg("validate")
            .arg(&manifest)
            .assert()
            .success()
            .stdout(predicate::str::contains("2 worker(s) in 2 wave(s)"));
    }

    #[test]
    fn test_waves_text() {
        let dir = TempDir::new().unwrap();
        let manifest = write_manifest(&dir, "workers.json", DIAMOND_JSON);

        foreman()
            .arg("waves")
            .arg(&manifest)
            .assert()
            .success()
            .stdout(predicate::str::contains("Wave 1:"))
            .stdout(predicate::str::contains("- e2e [tests] (after api, ui)"));
    }

    #[test]
    fn test_waves_json() {
        let dir = TempDir::new().unwrap();
        let manifest = write_manifest(&dir, "workers.json", DIAMOND_JSON);

        let output = foreman()
            .arg("waves")
            .arg("--json")
            .arg(&manifest)
            .output()
            .unwrap();
        assert!(output.status.success());

        let waves: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        let waves = waves.as_array().unwrap();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0]["workers"], serde_json::json!(["db"]));
        assert_eq!(waves[2]["workers"], serde_json::json!(["e2e"]));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let dir = TempDir::new().unwrap();
        let manifest = write_manifest(
            &dir,
            "workers.json",
            r#"{ "workers": [
                { "id": "a", "role": "x", "dependencies": ["b"] },
                { "id": "b", "role": "y", "dependencies": ["a"] }
            ] }"#,
        );

        foreman()
            .arg("validate")
            .arg(&manifest)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Dependency cycle detected"));
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let dir = TempDir::new().unwrap();
        let manifest = write_manifest(
            &dir,
            "workers.json",
            r#"{ "workers": [ { "id": "a", "role": "x", "dependencies": ["ghost"] } ] }"#,
        );

        foreman()
            .arg("waves")
            .arg(&manifest)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown dependency 'ghost'"));
    }

    #[test]
    fn test_missing_manifest() {
        foreman()
            .arg("validate")
            .arg("/nonexistent/workers.json")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to read"));
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_init_then_show() {
        let dir = TempDir::new().unwrap();

        foreman()
            .arg("--project-dir")
            .arg(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));
        assert!(dir.path().join(".foreman/foreman.toml").exists());

        foreman()
            .arg("--project-dir")
            .arg(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_concurrent = 4"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".foreman")).unwrap();
        fs::write(
            dir.path().join(".foreman/foreman.toml"),
            "[orchestrator]\nmax_concurrent = 0\n",
        )
        .unwrap();

        foreman()
            .arg("--project-dir")
            .arg(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_concurrent is 0"));
    }

    #[test]
    fn test_config_validate_without_file() {
        let dir = TempDir::new().unwrap();

        foreman()
            .arg("--project-dir")
            .arg(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using defaults"));
    }
}

// =============================================================================
// Archive
// =============================================================================

mod archive {
    use super::*;

    #[test]
    fn test_archive_list_empty() {
        let dir = TempDir::new().unwrap();

        foreman()
            .arg("--project-dir")
            .arg(dir.path())
            .args(["archive", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No sealed phases"));
    }

    #[test]
    fn test_archive_show_missing() {
        let dir = TempDir::new().unwrap();

        foreman()
            .arg("--project-dir")
            .arg(dir.path())
            .args(["archive", "show", "3"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No sealed phase 3"));
    }

    #[test]
    fn test_carry_over_without_archive() {
        let dir = TempDir::new().unwrap();

        foreman()
            .arg("--project-dir")
            .arg(dir.path())
            .env("FOREMAN_LOG", "error")
            .args(["run", "--carry-over"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No archived phase to carry over from"));
    }
}
