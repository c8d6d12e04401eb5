//! Recovery integration tests.
//!
//! These tests verify that tasks survive a restart, that malformed records
//! are skipped rather than failing the load, and that runs cut short by a
//! crash are marked interrupted.

use crony::config::{EngineConfig, StorageConfig};
use crony::storage::{JsonFileStorage, Storage};
use crony::{Engine, EngineError, LastResult, StorageError, TaskDraft, TaskId};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{json_config, offline_engine};

fn record(id: &str, name: &str, command: &str) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "schedule": null,
        "command": command,
        "enabled": true,
        "last_run_at": null,
        "last_result": null,
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": "2024-01-01T00:00:00Z"
    })
}

/// Test: Tasks created in one engine are visible after reopening.
#[tokio::test]
async fn test_tasks_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let engine = offline_engine(json_config(dir.path())).await;
    let first = engine
        .create_task(TaskDraft::new("first", "echo 1").with_schedule("0 3 * * *"))
        .await
        .unwrap()
        .task;
    tokio::time::sleep(Duration::from_millis(2)).await;
    let second = engine
        .create_task(TaskDraft::new("second", "echo 2").with_enabled(false))
        .await
        .unwrap()
        .task;
    engine.shutdown().await;
    drop(engine);

    assert!(dir.path().join("tasks.json").exists());

    let reopened = offline_engine(json_config(dir.path())).await;
    let tasks = reopened.list_tasks().await;
    assert_eq!(tasks, vec![first, second]);
    reopened.shutdown().await;
}

/// Test: Malformed records are skipped and the rest load.
#[tokio::test]
async fn test_malformed_records_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let document = json!({
        "good": record("good", "Good", "echo ok"),
        "blank-name": record("blank-name", "  ", "echo"),
        "blank-command": record("blank-command", "n", ""),
        "mismatch": record("other-id", "Mismatch", "echo"),
        "garbage": {"name": 5},
        "also-good": record("also-good", "Also good", "echo ok")
    });
    std::fs::write(
        dir.path().join("tasks.json"),
        serde_json::to_vec_pretty(&document).unwrap(),
    )
    .unwrap();

    let engine = offline_engine(json_config(dir.path())).await;
    let mut ids: Vec<_> = engine
        .list_tasks()
        .await
        .into_iter()
        .map(|t| t.id.to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["also-good".to_string(), "good".to_string()]);
    engine.shutdown().await;
}

/// Test: Backend load reports how many records were skipped.
#[tokio::test]
async fn test_load_reports_skipped_count() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.json");
    let document = json!([
        record("a", "A", "echo"),
        record("a", "Duplicate", "echo"),
        {"id": "broken"}
    ]);
    std::fs::write(&path, serde_json::to_vec(&document).unwrap()).unwrap();

    let loaded = JsonFileStorage::new(&path).load().await.unwrap();
    assert_eq!(loaded.tasks.len(), 1);
    assert_eq!(loaded.tasks[0].name, "A");
    assert_eq!(loaded.skipped, 2);
}

/// Test: A run left in the running state by a crash is marked interrupted,
/// and the rewrite is persisted.
#[tokio::test]
async fn test_stale_running_becomes_interrupted() {
    let dir = tempfile::tempdir().unwrap();
    let mut stale = record("stale", "Stale", "sleep 100");
    stale["last_run_at"] = json!("2024-01-02T03:04:05Z");
    stale["last_result"] = json!({"status": "running"});
    std::fs::write(
        dir.path().join("tasks.json"),
        serde_json::to_vec(&json!({ "stale": stale })).unwrap(),
    )
    .unwrap();

    let engine = offline_engine(json_config(dir.path())).await;
    let task = engine.get_task(&TaskId::new("stale")).await.unwrap();
    assert_eq!(task.last_result, Some(LastResult::Interrupted));
    assert!(task.last_run_at.is_some());
    assert!(!engine.is_running(&task.id));
    engine.shutdown().await;
    drop(engine);

    let on_disk: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("tasks.json")).unwrap()).unwrap();
    assert_eq!(on_disk["stale"]["last_result"]["status"], "interrupted");
}

/// Test: A missing file is an empty store; an unusable one fails to open.
#[tokio::test]
async fn test_missing_and_corrupt_files() {
    let dir = tempfile::tempdir().unwrap();
    let engine = offline_engine(json_config(dir.path())).await;
    assert!(engine.list_tasks().await.is_empty());
    engine.shutdown().await;

    let corrupt = tempfile::tempdir().unwrap();
    std::fs::write(corrupt.path().join("tasks.json"), "{ not json").unwrap();
    let result = Engine::builder(json_config(corrupt.path()))
        .without_scheduler()
        .build()
        .await;
    assert!(matches!(
        result,
        Err(EngineError::Storage(StorageError::SerializationError(_)))
    ));

    let scalar = tempfile::tempdir().unwrap();
    std::fs::write(scalar.path().join("tasks.json"), "42").unwrap();
    let result = Engine::builder(json_config(scalar.path()))
        .without_scheduler()
        .build()
        .await;
    assert!(matches!(result, Err(EngineError::Storage(_))));
}

/// Test: Restarting recomputes next triggers from now and replays nothing.
#[tokio::test]
async fn test_restart_does_not_replay_missed_triggers() {
    let dir = tempfile::tempdir().unwrap();
    let mut minutely = record("minutely", "Minutely", "echo tick");
    minutely["schedule"] = json!("* * * * *");
    minutely["last_run_at"] = json!("2020-01-01T00:00:00Z");
    minutely["last_result"] = json!({"status": "success", "output": "tick\n"});
    std::fs::write(
        dir.path().join("tasks.json"),
        serde_json::to_vec(&json!({ "minutely": minutely })).unwrap(),
    )
    .unwrap();

    let before = chrono::Local::now();
    let engine = Engine::open(json_config(dir.path())).await.unwrap();
    let id = TaskId::new("minutely");

    let next = engine.next_trigger(&id).await.unwrap().unwrap();
    assert!(next > before);
    assert!(next <= before + chrono::Duration::minutes(1));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let task = engine.get_task(&id).await.unwrap();
    let ran_at = task.last_run_at.unwrap();
    // Either untouched, or fired for a minute boundary crossed during the test.
    assert!(
        ran_at.to_rfc3339().starts_with("2020-01-01")
            || ran_at >= before.with_timezone(&chrono::Utc)
    );

    engine.shutdown().await;
}

/// Test: An explicitly configured backend is used instead of the configured path.
#[tokio::test]
async fn test_builder_storage_override() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custom.json");
    let storage: Arc<dyn Storage> = Arc::new(JsonFileStorage::new(&path));

    let engine = Engine::builder(EngineConfig {
        storage: StorageConfig::Memory,
        ..EngineConfig::default()
    })
    .storage(storage)
    .without_scheduler()
    .build()
    .await
    .unwrap();
    engine.create_task(TaskDraft::new("n", "echo")).await.unwrap();
    engine.shutdown().await;

    assert!(path.exists());
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;

    fn sqlite_config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            data_dir: Some(dir.to_path_buf()),
            storage: StorageConfig::Sqlite { path: None },
            ..EngineConfig::default()
        }
    }

    /// Test: Tasks and results persist in SQLite across restarts.
    #[tokio::test]
    async fn test_sqlite_tasks_survive_restart() {
        let dir = tempfile::tempdir().unwrap();

        let engine = offline_engine(sqlite_config(dir.path())).await;
        let task = engine
            .create_task(TaskDraft::new("db", "echo").with_schedule("@weekly"))
            .await
            .unwrap()
            .task;
        engine.shutdown().await;
        drop(engine);

        assert!(dir.path().join("tasks.db").exists());

        let reopened = offline_engine(sqlite_config(dir.path())).await;
        assert_eq!(reopened.list_tasks().await, vec![task]);
        reopened.shutdown().await;
    }
}
