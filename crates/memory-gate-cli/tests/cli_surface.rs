use std::path::{Path, PathBuf};

use clap::Parser;
use memory_gate_cli::{run_cli, Cli};
use memory_gate_core::{GovernanceRuleset, TaskStatus};
use memory_gate_store_sqlite::SqliteMemoryStore;
use ulid::Ulid;

fn temp_db() -> PathBuf {
    std::env::temp_dir().join(format!("memory-gate-cli-{}.sqlite3", Ulid::new()))
}

fn run(db: &Path, args: &[&str]) -> anyhow::Result<()> {
    let db_str = db.to_string_lossy().into_owned();
    let mut full = vec!["mg", "--db", db_str.as_str()];
    full.extend_from_slice(args);
    run_cli(Cli::parse_from(full))
}

fn open(db: &Path) -> SqliteMemoryStore {
    match SqliteMemoryStore::open(db) {
        Ok(store) => store,
        Err(err) => panic!("failed to open store: {err}"),
    }
}

fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err}"),
    }
}

#[test]
fn migrate_then_turn_persists_an_audited_episode() {
    let db = temp_db();
    must_ok(run(&db, &["migrate"]));
    must_ok(run(&db, &["turn", "--user", "Help me plan a balanced week."]));

    let store = open(&db);
    assert_eq!(must_ok(store.count_episodes()), 1);
    let decisions = must_ok(store.list_decisions(10));
    assert_eq!(decisions.len(), 1);

    let report = must_ok(store.integrity_check());
    assert!(report.healthy, "issues: {:?}", report.issues);
    let _ = std::fs::remove_file(&db);
}

#[test]
fn task_commands_round_trip_with_audit_events() {
    let db = temp_db();
    must_ok(run(&db, &["tasks", "add", "--title", "renew contract"]));

    let store = open(&db);
    let tasks = must_ok(store.list_tasks(true));
    assert_eq!(tasks.len(), 1);
    let task_id = tasks[0].task_id;
    drop(store);

    must_ok(run(
        &db,
        &[
            "tasks",
            "set-status",
            "--task-id",
            &task_id.to_string(),
            "--status",
            "done",
        ],
    ));

    let store = open(&db);
    let task = match must_ok(store.get_task(task_id)) {
        Some(task) => task,
        None => panic!("task missing after status update"),
    };
    assert_eq!(task.status, TaskStatus::Done);
    let events = must_ok(store.task_events(task_id));
    assert_eq!(events.len(), 2);
    drop(store);

    must_ok(run(&db, &["tasks", "reset"]));
    let store = open(&db);
    assert_eq!(must_ok(store.count_tasks()), 0);
    let _ = std::fs::remove_file(&db);
}

#[test]
fn turn_with_explicit_task_prefix_creates_task() {
    let db = temp_db();
    must_ok(run(&db, &["turn", "--user", "add task: renew contract"]));

    let store = open(&db);
    let tasks = must_ok(store.list_tasks(true));
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].title, "renew contract");
    assert_eq!(must_ok(store.count_beliefs()), 0);
    let _ = std::fs::remove_file(&db);
}

#[test]
fn belief_commands_list_and_delete() {
    let db = temp_db();
    must_ok(run(&db, &["turn", "--user", "Please be concise from here on."]));
    must_ok(run(&db, &["beliefs", "decay"]));

    let store = open(&db);
    assert_eq!(must_ok(store.count_beliefs()), 1);
    let beliefs = must_ok(store.list_beliefs(
        10,
        true,
        memory_gate_core::now_utc(),
        &GovernanceRuleset::v1(),
    ));
    assert_eq!(beliefs[0].key, "pref.format.verbosity");
    drop(store);

    must_ok(run(&db, &["beliefs", "delete", "--pattern", "verbosity"]));
    let store = open(&db);
    assert_eq!(must_ok(store.count_beliefs()), 0);
    let _ = std::fs::remove_file(&db);
}

#[test]
fn check_command_passes_on_a_consistent_database() {
    let db = temp_db();
    must_ok(run(&db, &["turn", "--user", "Hello there."]));
    must_ok(run(&db, &["check"]));
    let _ = std::fs::remove_file(&db);
}

#[test]
fn suite_refuses_to_run_without_the_env_gate() {
    std::env::remove_var(memory_gate_engine::UNSAFE_DRAFTS_ENV);
    let db = temp_db();
    let result = run(&db, &["suite"]);
    assert!(result.is_err());
    let _ = std::fs::remove_file(&db);
}
