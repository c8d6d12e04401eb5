//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use crony::config::{EngineConfig, StorageConfig};
use crony::{Engine, LastResult, TaskId};
use std::path::Path;
use std::time::Duration;

/// Engine config storing tasks as JSON under `dir`.
pub fn json_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        data_dir: Some(dir.to_path_buf()),
        storage: StorageConfig::Json { path: None },
        stop_grace_ms: 500,
        ..EngineConfig::default()
    }
}

/// Open an engine over `config` with the scheduler loop off.
pub async fn offline_engine(config: EngineConfig) -> Engine {
    Engine::builder(config)
        .without_scheduler()
        .build()
        .await
        .unwrap()
}

/// Wait for a task's stored result to leave the running state.
///
/// Polls the engine every 10ms.
///
/// # Panics
///
/// Panics if the timeout is reached first.
pub async fn wait_for_result(engine: &Engine, task_id: &TaskId, timeout: Duration) -> LastResult {
    let start = tokio::time::Instant::now();
    loop {
        let task = engine.get_task(task_id).await.unwrap();
        if let Some(result) = task.last_result.clone() {
            if !result.is_running() && !engine.is_running(task_id) {
                return result;
            }
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for task {} to finish, current result: {:?}",
                task_id, task.last_result
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until no run of `task_id` is live.
pub async fn wait_until_idle(engine: &Engine, task_id: &TaskId, timeout: Duration) {
    let start = tokio::time::Instant::now();
    while engine.is_running(task_id) {
        if start.elapsed() > timeout {
            panic!("Timeout waiting for task {} to become idle", task_id);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
