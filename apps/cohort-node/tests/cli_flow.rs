use std::path::Path;

use cohort_kernel::{Kernel, TaskStatus, TicketStatus};
use predicates::prelude::*;
use serde_json::Value;
use tempfile::tempdir;

fn bin(state: &Path, occurrence: &str) -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("cohort-node").expect("binary");
    cmd.env_remove("COHORT_OCCURRENCE_ID")
        .env_remove("COHORT_STATE_DIR")
        .env("RUST_LOG", "warn")
        .arg("--state-dir")
        .arg(state)
        .arg("--occurrence")
        .arg(occurrence);
    cmd
}

fn tickets_json(state: &Path) -> Vec<Value> {
    let out = bin(state, "occ-1")
        .args(["tickets", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&out).expect("tickets json")
}

#[test]
fn schema_prints_without_a_store() {
    let mut cmd = assert_cmd::Command::cargo_bin("cohort-node").expect("binary");
    cmd.arg("schema")
        .assert()
        .success()
        .stdout(predicate::str::contains("early_adopter_percent"));
}

#[test]
fn submitted_ticket_is_claimed_and_closed() {
    let tmp = tempdir().expect("tmpdir");
    let state = tmp.path();

    bin(state, "occ-1")
        .args(["submit", "T-100", "--kind", "research", "--priority", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Submitted T-100"));
    let tickets = tickets_json(state);
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0]["status"], "pending");
    assert_eq!(tickets[0]["owner"], "__shared__");

    let out = bin(state, "occ-1")
        .args(["run", "--rounds", "1", "--interval-ms", "10", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: Value = serde_json::from_slice(&out).expect("round report");
    assert_eq!(report["claimed"], 1);

    // A second occurrence finds nothing left to claim.
    let out = bin(state, "occ-2")
        .args(["run", "--rounds", "1", "--interval-ms", "10", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: Value = serde_json::from_slice(&out).expect("round report");
    assert_eq!(report["claimed"], 0);

    bin(state, "occ-1")
        .args(["transition", "T-100", "in_progress"])
        .assert()
        .success()
        .stdout(predicate::str::contains("in_progress"));
    bin(state, "occ-1")
        .args(["transition", "T-100", "pending"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));

    let kernel = Kernel::open(state).expect("kernel");
    let task = kernel
        .tasks()
        .active_for_correlation("T-100")
        .expect("query")
        .expect("active task");
    assert_eq!(task.owner.as_str(), "occ-1");
    bin(state, "occ-1")
        .args(["complete", &task.task_id, "--notes", "summarised"])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed"));
    let closed = kernel.tasks().get(&task.task_id).expect("query").expect("task");
    assert_eq!(closed.status, TaskStatus::Completed);
    let ticket = kernel.tickets().get("T-100").expect("query").expect("ticket");
    assert_eq!(ticket.status, TicketStatus::InProgress);
}

#[test]
fn members_lists_static_waves() {
    let tmp = tempdir().expect("tmpdir");
    let cfg = tmp.path().join("cohort.toml");
    std::fs::write(
        &cfg,
        "[occurrence]\nmembers = [\"occ-1\", \"occ-2\", \"occ-3\", \"occ-4\"]\n",
    )
    .expect("write config");
    let out = bin(tmp.path(), "occ-1")
        .arg("--config")
        .arg(&cfg)
        .args(["members", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let waves: Vec<Value> = serde_json::from_slice(&out).expect("waves json");
    let sizes: Vec<usize> = waves
        .iter()
        .map(|w| w["members"].as_array().map(Vec::len).unwrap_or(0))
        .collect();
    assert_eq!(sizes, vec![1, 1, 2]);
    assert_eq!(waves[0]["name"], "explorer");
}

#[test]
fn missing_occurrence_id_is_reported() {
    let tmp = tempdir().expect("tmpdir");
    let mut cmd = assert_cmd::Command::cargo_bin("cohort-node").expect("binary");
    cmd.env_remove("COHORT_OCCURRENCE_ID")
        .env_remove("HOSTNAME")
        .env_remove("COMPUTERNAME")
        .arg("--state-dir")
        .arg(tmp.path())
        .arg("tickets")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no occurrence id"));
}

#[test]
fn zero_round_interval_is_rejected() {
    let tmp = tempdir().expect("tmpdir");
    bin(tmp.path(), "occ-1")
        .args(["run", "--rounds", "1", "--interval-ms", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--interval-ms"));
}
