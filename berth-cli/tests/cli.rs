use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::process::{Command, Stdio};

use assert_cmd::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

fn berth_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("berth"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env_remove("RUST_LOG");
    cmd
}

fn add_session(home: &Path, id: &str, project: &Path) {
    berth_cmd(home)
        .args(["session", "add", id, "--project"])
        .arg(project)
        .assert()
        .success()
        .stdout(contains(format!("Added session '{id}'")));
}

fn json_stdout(cmd: &mut Command) -> serde_json::Value {
    let output = cmd.output().expect("run berth");
    assert!(
        output.status.success(),
        "berth failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

#[test]
fn session_lifecycle_through_default_store() {
    let home = TempDir::new().expect("home");
    let project = TempDir::new().expect("project");

    add_session(home.path(), "001", project.path());
    assert!(home.path().join(".berth").join("registry.db").exists());

    berth_cmd(home.path())
        .args(["session", "add", "001", "--project", "/elsewhere"])
        .assert()
        .failure()
        .stderr(contains("already exists"));

    let listed = json_stdout(berth_cmd(home.path()).args(["session", "list", "--json"]));
    let rows = listed.as_array().expect("array");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["session_id"], "001");
    assert_eq!(rows[0]["mode"], "docker");

    berth_cmd(home.path())
        .args(["session", "next-id"])
        .assert()
        .success()
        .stdout(contains("002"));

    berth_cmd(home.path())
        .args(["session", "destroy", "001"])
        .assert()
        .success()
        .stdout(contains("Destroyed session '001'"));

    berth_cmd(home.path())
        .args(["session", "list"])
        .assert()
        .success()
        .stdout(contains("No active sessions."));

    berth_cmd(home.path())
        .args(["session", "purge"])
        .assert()
        .success()
        .stdout(contains("Purged 1"));
}

#[test]
fn purge_flag_removes_already_destroyed_session() {
    let home = TempDir::new().expect("home");
    let project = TempDir::new().expect("project");
    add_session(home.path(), "001", project.path());

    berth_cmd(home.path())
        .args(["session", "destroy", "001"])
        .assert()
        .success()
        .stdout(contains("Destroyed session '001'"));
    berth_cmd(home.path())
        .args(["session", "destroy", "001", "--purge"])
        .assert()
        .success()
        .stdout(contains("Removed session '001'"));

    berth_cmd(home.path())
        .args(["session", "purge"])
        .assert()
        .success()
        .stdout(contains("Purged 0"));
    berth_cmd(home.path())
        .args(["session", "destroy", "001", "--purge"])
        .assert()
        .success()
        .stdout(contains("No session '001'."));
}

#[test]
fn add_without_id_takes_next_free_one() {
    let home = TempDir::new().expect("home");
    let project = TempDir::new().expect("project");
    add_session(home.path(), "001", project.path());

    let row = json_stdout(
        berth_cmd(home.path())
            .args(["session", "add", "--mode", "native", "--json", "--project"])
            .arg(project.path()),
    );
    assert_eq!(row["session_id"], "002");
    assert_eq!(row["mode"], "native");
}

#[test]
fn allocate_show_and_release_ports() {
    let home = TempDir::new().expect("home");
    let project = TempDir::new().expect("project");
    add_session(home.path(), "001", project.path());

    let ports = json_stdout(berth_cmd(home.path()).args([
        "ports", "allocate", "001", "postgres", "app", "--json",
    ]));
    let postgres = ports["postgres"].as_u64().expect("postgres port");
    let app = ports["app"].as_u64().expect("app port");
    assert_ne!(postgres, app);

    // A second call returns the same bindings.
    let again = json_stdout(berth_cmd(home.path()).args([
        "ports", "allocate", "001", "app", "--json",
    ]));
    assert_eq!(again["app"].as_u64(), Some(app));

    let detail = json_stdout(berth_cmd(home.path()).args(["session", "show", "001", "--json"]));
    assert_eq!(detail["session_id"], "001");
    assert_eq!(detail["ports"].as_array().map(Vec::len), Some(2));

    berth_cmd(home.path())
        .args(["session", "destroy", "001"])
        .assert()
        .success();
    let remaining = json_stdout(berth_cmd(home.path()).args(["ports", "list", "--json"]));
    assert_eq!(remaining.as_array().map(Vec::len), Some(0));
}

#[test]
fn allocate_for_unknown_session_fails() {
    let home = TempDir::new().expect("home");
    berth_cmd(home.path())
        .args(["ports", "allocate", "404", "app"])
        .assert()
        .failure()
        .stderr(contains("no active session '404'"));
}

#[test]
fn reservations_round_through_cli() {
    let home = TempDir::new().expect("home");
    let store = home.path().join("custom").join("berth.db");

    berth_cmd(home.path())
        .args(["reserve", "add", "5432", "--reason", "local postgres", "--store"])
        .arg(&store)
        .assert()
        .success()
        .stdout(contains("Reserved port 5432"));
    assert!(store.exists());
    assert!(!home.path().join(".berth").join("registry.db").exists());

    let listed = json_stdout(
        berth_cmd(home.path())
            .args(["reserve", "list", "--json", "--store"])
            .arg(&store),
    );
    assert_eq!(listed[0]["port"], 5432);
    assert_eq!(listed[0]["reason"], "local postgres");

    berth_cmd(home.path())
        .args(["reserve", "remove", "5432", "--store"])
        .arg(&store)
        .assert()
        .success()
        .stdout(contains("Released port 5432"));
    berth_cmd(home.path())
        .args(["reserve", "remove", "5432", "--store"])
        .arg(&store)
        .assert()
        .success()
        .stdout(contains("was not reserved"));
}

#[test]
fn concurrent_processes_get_distinct_ports() {
    const PROCESSES: usize = 6;
    let home = TempDir::new().expect("home");
    let project = TempDir::new().expect("project");
    let ids: Vec<String> = (1..=PROCESSES).map(|n| format!("{n:03}")).collect();
    for id in &ids {
        add_session(home.path(), id, project.path());
    }

    let mut pending: Vec<String> = ids.clone();
    let mut results: BTreeMap<String, BTreeMap<String, u16>> = BTreeMap::new();
    // A process that loses both commit races exits non-zero; run it again.
    for _round in 0..5 {
        if pending.is_empty() {
            break;
        }
        let children: Vec<_> = pending
            .iter()
            .map(|id| {
                let child = berth_cmd(home.path())
                    .args(["ports", "allocate", id, "app", "db", "--json"])
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
                    .expect("spawn berth");
                (id.clone(), child)
            })
            .collect();

        pending.clear();
        for (id, child) in children {
            let output = child.wait_with_output().expect("wait berth");
            if output.status.success() {
                let ports: BTreeMap<String, u16> =
                    serde_json::from_slice(&output.stdout).expect("stdout is JSON");
                results.insert(id, ports);
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                assert!(stderr.contains("conflicted"), "unexpected failure for {id}: {stderr}");
                pending.push(id);
            }
        }
    }

    assert!(pending.is_empty(), "still conflicting after retries: {pending:?}");
    let mut seen = BTreeSet::new();
    for (id, ports) in &results {
        assert_eq!(ports.len(), 2, "session {id}");
        for port in ports.values() {
            assert!(seen.insert(*port), "port {port} handed out twice");
        }
    }
    assert_eq!(seen.len(), PROCESSES * 2);
}
