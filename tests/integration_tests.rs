//! Integration tests for phasegate
//!
//! The CLI is driven as a subprocess; the library is exercised end to end
//! against file-backed stores that the CLI then reads back.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn phasegate() -> Command {
    cargo_bin_cmd!("phasegate")
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

/// Command rooted in `dir` with environment overrides cleared.
fn phasegate_in(dir: &Path) -> Command {
    let mut cmd = phasegate();
    cmd.current_dir(dir)
        .env_remove("PHASEGATE_STATE_DIR")
        .env_remove("PHASEGATE_MAX_RETRIES")
        .env_remove("PHASEGATE_LOG");
    cmd
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        phasegate()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("review"))
            .stdout(predicate::str::contains("approve"));
    }

    #[test]
    fn test_version() {
        phasegate()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("phasegate"));
    }

    #[test]
    fn test_review_requires_files() {
        phasegate().arg("review").assert().failure();
    }
}

// =============================================================================
// Session Commands
// =============================================================================

mod session_commands {
    use super::*;

    #[test]
    fn test_init_then_status() {
        let dir = create_temp_project();
        phasegate_in(dir.path())
            .args(["init", "demo"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized session demo"));

        assert!(
            dir.path()
                .join(".phasegate/sessions/demo/session.json")
                .exists()
        );

        phasegate_in(dir.path())
            .args(["status", "demo"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Requirement Analysis").or(
                predicate::str::contains("requirement"),
            ))
            .stdout(predicate::str::contains("IN_PROGRESS"));
    }

    #[test]
    fn test_init_twice_fails() {
        let dir = create_temp_project();
        phasegate_in(dir.path()).args(["init", "demo"]).assert().success();
        phasegate_in(dir.path())
            .args(["init", "demo"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_status_unknown_session_fails() {
        let dir = create_temp_project();
        phasegate_in(dir.path())
            .args(["status", "missing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("does not exist"));
    }

    #[test]
    fn test_invalid_session_id_rejected() {
        let dir = create_temp_project();
        phasegate_in(dir.path())
            .args(["init", "../escape"])
            .assert()
            .failure();
    }

    #[test]
    fn test_state_dir_flag() {
        let dir = create_temp_project();
        phasegate_in(dir.path())
            .args(["--state-dir", "custom", "init", "demo"])
            .assert()
            .success();
        assert!(dir.path().join("custom/demo/session.json").exists());
    }

    /// Fail the first gate of `session` so it sits at an INCOMPLETE checkpoint.
    fn fail_first_gate(project: &Path, session: &str) {
        use phasegate::config::PhasegateConfig;
        use phasegate::lifecycle::LifecycleController;
        use phasegate::session::{FileSessionStore, PhaseStatus};
        use std::sync::Arc;

        let store = FileSessionStore::new(project.join(".phasegate/sessions"));
        let mut controller = LifecycleController::new(Arc::new(store), &PhasegateConfig::default());
        controller.resume(session).unwrap();
        controller
            .complete_current_phase(None, PhaseStatus::Completed)
            .unwrap_err();
    }

    #[test]
    fn test_approve_incomplete_session_with_yes() {
        let dir = create_temp_project();
        phasegate_in(dir.path()).args(["init", "demo"]).assert().success();
        fail_first_gate(dir.path(), "demo");

        phasegate_in(dir.path())
            .args(["status", "demo"])
            .assert()
            .success()
            .stdout(predicate::str::contains("INCOMPLETE"))
            .stdout(predicate::str::contains("halted"));

        phasegate_in(dir.path())
            .args(["approve", "demo", "--yes", "--approver", "alex"])
            .assert()
            .success()
            .stdout(predicate::str::contains("approved for demo by alex"));

        phasegate_in(dir.path())
            .args(["status", "demo"])
            .assert()
            .success()
            .stdout(predicate::str::contains("continuation approved"))
            .stdout(predicate::str::contains("may proceed"));
    }

    #[test]
    fn test_approve_refused_while_in_progress() {
        let dir = create_temp_project();
        phasegate_in(dir.path()).args(["init", "demo"]).assert().success();
        phasegate_in(dir.path())
            .args(["approve", "demo", "--yes"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("only an INCOMPLETE checkpoint can be approved"));
    }

    #[test]
    fn test_report_writes_file() {
        let dir = create_temp_project();
        phasegate_in(dir.path()).args(["init", "demo"]).assert().success();
        phasegate_in(dir.path())
            .args(["report", "demo"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"overall_status\": \"IN_PROGRESS\""));
        assert!(
            dir.path()
                .join(".phasegate/sessions/demo/report.json")
                .exists()
        );
    }

    #[test]
    fn test_verify_unsealed_session_fails() {
        let dir = create_temp_project();
        phasegate_in(dir.path()).args(["init", "demo"]).assert().success();
        phasegate_in(dir.path())
            .args(["verify", "demo"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("no sealed evidence index"));
    }

    #[test]
    fn test_inventory_lists_missing_operations() {
        let dir = create_temp_project();
        phasegate_in(dir.path()).args(["init", "demo"]).assert().success();
        phasegate_in(dir.path())
            .args(["inventory", "demo", "--operations", "build,test"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Missing evidence (2)"))
            .stdout(predicate::str::contains("build"))
            .stdout(predicate::str::contains("test"));
    }
}

// =============================================================================
// Review Command
// =============================================================================

mod review_command {
    use super::*;

    #[test]
    fn test_review_passes_clean_file() {
        let dir = create_temp_project();
        fs::write(dir.path().join("lib.rs"), "pub fn one() -> u32 {\n    1\n}\n").unwrap();
        phasegate_in(dir.path())
            .args(["review", "lib.rs", "--evidence", "ev-1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Verdict: PASS"));
    }

    #[test]
    fn test_review_rejects_omission_marker() {
        let dir = create_temp_project();
        fs::write(
            dir.path().join("lib.rs"),
            "pub fn one() -> u32 {\n    1\n}\n// rest omitted\n",
        )
        .unwrap();
        phasegate_in(dir.path())
            .args(["review", "lib.rs", "--evidence", "ev-1"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("Verdict: REJECT"))
            .stdout(predicate::str::contains("Q3"));
    }

    #[test]
    fn test_review_rejects_missing_evidence_and_file() {
        let dir = create_temp_project();
        phasegate_in(dir.path())
            .args(["review", "missing.rs"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("Q1"))
            .stdout(predicate::str::contains("Q5"));
    }

    #[test]
    fn test_review_reads_response_file() {
        let dir = create_temp_project();
        fs::write(dir.path().join("lib.rs"), "pub fn one() -> u32 {\n    1\n}\n").unwrap();
        fs::write(
            dir.path().join("response.txt"),
            "Due to length limits I stopped here.",
        )
        .unwrap();
        phasegate_in(dir.path())
            .args([
                "review",
                "lib.rs",
                "--evidence",
                "ev-1",
                "--response",
                "response.txt",
            ])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("Q6"));
    }
}

// =============================================================================
// Config Command
// =============================================================================

mod config_command {
    use super::*;

    #[test]
    fn test_config_init_and_validate() {
        let dir = create_temp_project();
        phasegate_in(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created phasegate.toml"));
        assert!(dir.path().join(".phasegate/phasegate.toml").exists());

        phasegate_in(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();
        phasegate_in(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("l2_capacity = 4"))
            .stdout(predicate::str::contains("l1_capacity = 9"));
    }

    #[test]
    fn test_config_validate_rejects_zero_capacity() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".phasegate")).unwrap();
        fs::write(
            dir.path().join(".phasegate/phasegate.toml"),
            "[pools]\nl2_capacity = 0\n",
        )
        .unwrap();
        phasegate_in(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("pools.l2_capacity must be at least 1"));

        // other commands refuse to start with it
        phasegate_in(dir.path())
            .args(["init", "demo"])
            .assert()
            .failure();
    }

    #[test]
    fn test_config_warns_on_oversized_l2() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".phasegate")).unwrap();
        fs::write(
            dir.path().join(".phasegate/phasegate.toml"),
            "[pools]\nl2_capacity = 6\n",
        )
        .unwrap();
        phasegate_in(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration warnings:"));
    }
}

// =============================================================================
// End to End
// =============================================================================

mod end_to_end {
    use super::*;
    use phasegate::config::PhasegateConfig;
    use phasegate::evidence::{EvidenceLedger, FileEvidenceStore};
    use phasegate::executor::ScriptedExecutor;
    use phasegate::lifecycle::LifecycleController;
    use phasegate::orchestrator::{Orchestrator, TaskSpec};
    use phasegate::review::Verdict;
    use phasegate::session::{FileSessionStore, OverallStatus, PhaseStatus};
    use phasegate::tracer::JsonlTracer;
    use serde_json::json;
    use std::sync::Arc;

    fn orchestrator(project: &Path, executor: ScriptedExecutor) -> Orchestrator {
        let state_dir = project.join(".phasegate/sessions");
        let config = PhasegateConfig::default();
        let mut lifecycle =
            LifecycleController::new(Arc::new(FileSessionStore::new(&state_dir)), &config);
        lifecycle.initialize("e2e").unwrap();
        for evidence in [
            json!({"requirements": ["greet the user"]}),
            json!({"tasks": ["greet"]}),
            json!({"plan": "single write task"}),
        ] {
            lifecycle
                .complete_current_phase(Some(&evidence), PhaseStatus::Completed)
                .unwrap();
        }
        let ledger = EvidenceLedger::new(Arc::new(FileEvidenceStore::new(&state_dir)));
        let tracer = JsonlTracer::new(&state_dir.join("e2e")).unwrap();
        Orchestrator::new(&config, project, lifecycle, ledger, Arc::new(executor))
            .unwrap()
            .with_tracer(Arc::new(tracer))
    }

    #[tokio::test]
    async fn test_full_session_then_cli_reads_it_back() {
        let dir = create_temp_project();
        let executor = ScriptedExecutor::new(dir.path())
            .then_write(
                &[("src/greet.rs", "pub fn greet() {\n    // ...\n}\n")],
                "first pass",
            )
            .then_write(
                &[("src/greet.rs", "pub fn greet() -> &'static str {\n    \"hi\"\n}\n")],
                "fixed",
            );
        let o = orchestrator(dir.path(), executor);

        let outcome = o
            .run_write_task(
                TaskSpec::new("greet", "write greet")
                    .lock("src/greet.rs")
                    .scope("src/**")
                    .require("src/greet.rs"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.verdict, Verdict::Pass);
        assert_eq!(outcome.attempts, 2);
        let evidence_id = outcome.evidence_id.unwrap();

        o.advance(&json!({"evidence_ids": [evidence_id]})).unwrap();
        o.advance(&json!({"review_verdict": "PASS"})).unwrap();
        let integrity = o.seal_evidence().unwrap();
        assert_eq!(integrity.items_verified, 1);
        o.advance(&json!({"integrity_verified": true})).unwrap();
        let (_, path) = o.final_report().unwrap();
        o.advance(&json!({"report_path": path})).unwrap();
        assert_eq!(
            o.lifecycle()
                .lock()
                .unwrap()
                .session()
                .unwrap()
                .overall_status(),
            OverallStatus::Complete
        );

        let trace = fs::read_to_string(dir.path().join(".phasegate/sessions/e2e/conversation.jsonl"))
            .unwrap();
        assert!(trace.contains("\"event\":\"rejection_detail\""));
        assert!(trace.contains("\"event\":\"final_summary\""));

        phasegate_in(dir.path())
            .args(["status", "e2e"])
            .assert()
            .success()
            .stdout(predicate::str::contains("COMPLETE"));
        phasegate_in(dir.path())
            .args(["verify", "e2e"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Items verified: 1"));
        phasegate_in(dir.path())
            .args(["inventory", "e2e", "--operations", "greet"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Every registered operation has evidence"));
    }

    #[tokio::test]
    async fn test_tampered_index_fails_cli_verify() {
        let dir = create_temp_project();
        let executor = ScriptedExecutor::new(dir.path())
            .then_write(&[("src/a.rs", "pub fn a() {}\n")], "done");
        let o = orchestrator(dir.path(), executor);
        o.run_write_task(TaskSpec::new("a", "write a").require("src/a.rs"))
            .await
            .unwrap();
        o.seal_evidence().unwrap();

        let index = dir
            .path()
            .join(".phasegate/sessions/e2e/evidence_index.json");
        let mut content = fs::read_to_string(&index).unwrap();
        content.push(' ');
        fs::write(&index, content).unwrap();

        phasegate_in(dir.path())
            .args(["verify", "e2e"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("failed verification"));
    }
}
