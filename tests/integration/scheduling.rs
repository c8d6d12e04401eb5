//! Scheduler integration tests.
//!
//! These tests verify that the scheduler loop follows task edits, honours
//! pause and resume, and leaves manual runs working while paused.

use crony::config::EngineConfig;
use crony::{Engine, SchedulerState, TaskDraft};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn engine() -> Engine {
    Engine::open(EngineConfig {
        max_nap_secs: 1,
        ..EngineConfig::ephemeral()
    })
    .await
    .unwrap()
}

/// Poll the scheduler's working set until `check` accepts it.
async fn wait_for_triggers<F>(engine: &Engine, check: F)
where
    F: Fn(&[crony::NextTrigger]) -> bool,
{
    let scheduler = engine.scheduler().unwrap();
    let start = tokio::time::Instant::now();
    loop {
        let triggers = scheduler.next_triggers().await.unwrap();
        if check(&triggers) {
            return;
        }
        if start.elapsed() > TIMEOUT {
            panic!("scheduler never reached expected state: {:?}", triggers);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Test: Creating, editing, disabling and deleting tasks updates the
/// scheduler's working set without a restart.
#[tokio::test]
async fn test_edits_take_effect_without_restart() {
    let engine = engine().await;

    let saved = engine
        .create_task(TaskDraft::new("nightly", "true").with_schedule("30 2 * * *"))
        .await
        .unwrap();
    let id = saved.task.id.clone();
    engine
        .create_task(TaskDraft::new("manual", "true"))
        .await
        .unwrap();

    wait_for_triggers(&engine, |t| t.len() == 1 && t[0].expression == "30 2 * * *").await;
    let next = engine.next_trigger(&id).await.unwrap().unwrap();
    assert_eq!(next.format("%H:%M").to_string(), "02:30");

    engine
        .update_task(&id, TaskDraft::new("nightly", "true").with_schedule("45 4 * * *"))
        .await
        .unwrap();
    wait_for_triggers(&engine, |t| t.len() == 1 && t[0].expression == "45 4 * * *").await;
    let next = engine.next_trigger(&id).await.unwrap().unwrap();
    assert_eq!(next.format("%H:%M").to_string(), "04:45");

    engine
        .update_task(
            &id,
            TaskDraft::new("nightly", "true")
                .with_schedule("45 4 * * *")
                .with_enabled(false),
        )
        .await
        .unwrap();
    wait_for_triggers(&engine, |t| t.is_empty()).await;
    assert_eq!(engine.next_trigger(&id).await.unwrap(), None);

    engine
        .update_task(&id, TaskDraft::new("nightly", "true").with_schedule("@hourly"))
        .await
        .unwrap();
    wait_for_triggers(&engine, |t| t.len() == 1).await;

    engine.delete_task(&id).await.unwrap();
    wait_for_triggers(&engine, |t| t.is_empty()).await;

    engine.shutdown().await;
}

/// Test: Tasks whose schedule cannot be used are saved but never scheduled.
#[tokio::test]
async fn test_invalid_schedule_is_saved_but_not_scheduled() {
    let engine = engine().await;

    let bad = engine
        .create_task(TaskDraft::new("bad", "true").with_schedule("*/0 * * * *"))
        .await
        .unwrap();
    assert!(bad.schedule_error.is_some());
    engine
        .create_task(TaskDraft::new("good", "true").with_schedule("@daily"))
        .await
        .unwrap();

    wait_for_triggers(&engine, |t| t.len() == 1 && t[0].expression == "@daily").await;
    assert_eq!(engine.next_trigger(&bad.task.id).await.unwrap(), None);
    assert_eq!(engine.list_tasks().await.len(), 2);

    engine.shutdown().await;
}

/// Test: Pausing stops automatic triggering but manual runs still work;
/// resuming recomputes from now.
#[tokio::test]
async fn test_pause_resume_and_manual_runs() {
    let engine = engine().await;
    let scheduler = engine.scheduler().unwrap().clone();
    assert_eq!(scheduler.state().await, SchedulerState::Running);

    let saved = engine
        .create_task(TaskDraft::new("daily", "echo manual").with_schedule("@daily"))
        .await
        .unwrap();
    let id = saved.task.id;

    scheduler.pause().await.unwrap();
    assert_eq!(scheduler.state().await, SchedulerState::Paused);

    engine.run_task(&id).await.unwrap();
    let result = crate::common::wait_for_result(&engine, &id, TIMEOUT).await;
    assert!(matches!(result, crony::LastResult::Success { .. }));

    scheduler.resume().await.unwrap();
    assert_eq!(scheduler.state().await, SchedulerState::Running);
    wait_for_triggers(&engine, |t| t.len() == 1).await;
    let next = engine.next_trigger(&id).await.unwrap().unwrap();
    assert!(next > chrono::Local::now());

    engine.shutdown().await;
    assert_eq!(scheduler.state().await, SchedulerState::Stopped);
}
