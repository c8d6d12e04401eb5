//! Run lifecycle integration tests.
//!
//! These tests drive real shell commands through the engine and check the
//! events, stored results and single-run guarantee.

#![cfg(unix)]

use crony::config::EngineConfig;
use crony::testing::{EventRecorder, wait_for_result as wait_for_event_result};
use crony::{EngineError, Event, LastResult, OutputStream, TaskDraft};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::common::{offline_engine, wait_for_result, wait_until_idle};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Test: A command writing "a", sleeping, then writing "b" produces exactly
/// running, chunk "a", chunk "b", success.
#[tokio::test]
async fn test_event_sequence_for_successful_run() {
    let engine = offline_engine(EngineConfig::ephemeral()).await;
    let saved = engine
        .create_task(TaskDraft::new("ab", "printf a; sleep 0.3; printf b"))
        .await
        .unwrap();
    let task_id = saved.task.id;

    let (recorder, _handler) = EventRecorder::attach(engine.events());
    let mut subscription = engine.subscribe();
    let run_id = engine.run_task(&task_id).await.unwrap();

    let result = wait_for_event_result(&mut subscription, &task_id, TIMEOUT).await;
    assert_eq!(result, Some(LastResult::Success { output: "ab".into() }));
    assert!(recorder.wait_until(TIMEOUT, |events| events.len() == 4).await);

    let events = recorder.events();
    assert_eq!(
        events,
        vec![
            Event::state_changed(task_id.clone(), run_id.clone(), LastResult::Running),
            Event::output_chunk(task_id.clone(), run_id.clone(), OutputStream::Stdout, "a"),
            Event::output_chunk(task_id.clone(), run_id.clone(), OutputStream::Stdout, "b"),
            Event::state_changed(
                task_id.clone(),
                run_id.clone(),
                LastResult::Success { output: "ab".into() }
            ),
        ]
    );

    let task = engine.get_task(&task_id).await.unwrap();
    assert!(task.last_run_at.is_some());
    assert_eq!(task.last_result, Some(LastResult::Success { output: "ab".into() }));

    engine.shutdown().await;
}

/// Test: A failing command records an error with its exit code and output.
#[tokio::test]
async fn test_failed_run_records_error() {
    let engine = offline_engine(EngineConfig::ephemeral()).await;
    let saved = engine
        .create_task(TaskDraft::new("fail", "echo oops >&2; exit 3"))
        .await
        .unwrap();

    engine.run_task(&saved.task.id).await.unwrap();
    let result = wait_for_result(&engine, &saved.task.id, TIMEOUT).await;

    match result {
        LastResult::Error { message, output } => {
            assert!(message.contains("exit code 3"), "message was {message}");
            assert_eq!(output, "oops\n");
        }
        other => panic!("expected error, got {:?}", other),
    }

    engine.shutdown().await;
}

/// Test: Running a task that is already running is refused and starts no
/// second process.
#[tokio::test]
async fn test_second_run_is_already_running() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("starts");
    let command = format!("echo started >> '{}'; sleep 1", marker.display());

    let engine = offline_engine(EngineConfig::ephemeral()).await;
    let saved = engine.create_task(TaskDraft::new("slow", command)).await.unwrap();
    let task_id = saved.task.id;

    let first = engine.run_task(&task_id).await.unwrap();
    let second = engine.run_task(&task_id).await;
    assert!(matches!(second, Err(EngineError::AlreadyRunning(_))));

    let running = engine.running();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].run_id, first);

    wait_for_result(&engine, &task_id, TIMEOUT).await;
    let starts = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(starts.lines().count(), 1);

    engine.shutdown().await;
}

/// Test: Simultaneous run requests for one task start exactly one process.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_runs_start_one_process() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("starts");
    let command = format!("echo started >> '{}'; sleep 1", marker.display());

    let engine = Arc::new(offline_engine(EngineConfig::ephemeral()).await);
    let saved = engine.create_task(TaskDraft::new("racy", command)).await.unwrap();
    let task_id = saved.task.id;

    let mut set = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let engine = engine.clone();
        let task_id = task_id.clone();
        set.spawn(async move { engine.run_task(&task_id).await });
    }

    let mut started = 0;
    let mut refused = 0;
    while let Some(result) = set.join_next().await {
        match result.unwrap() {
            Ok(_) => started += 1,
            Err(EngineError::AlreadyRunning(_)) => refused += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(started, 1);
    assert_eq!(refused, 9);

    wait_for_result(&engine, &task_id, TIMEOUT).await;
    let starts = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(starts.lines().count(), 1);

    engine.shutdown().await;
}

/// Test: Stopping a long-running command ends it within the grace window
/// and records cancellation, not failure.
#[tokio::test]
async fn test_stop_yields_cancelled_within_grace() {
    let config = EngineConfig {
        stop_grace_ms: 300,
        ..EngineConfig::ephemeral()
    };
    let engine = offline_engine(config).await;
    let saved = engine
        .create_task(TaskDraft::new("forever", "echo begin; sleep 60"))
        .await
        .unwrap();
    let task_id = saved.task.id;

    let (recorder, _handler) = EventRecorder::attach(engine.events());
    let run_id = engine.run_task(&task_id).await.unwrap();
    assert!(
        recorder
            .wait_until(TIMEOUT, |events| events
                .iter()
                .any(|e| matches!(e, Event::TaskOutputChunk { .. })))
            .await
    );

    let stop_started = Instant::now();
    engine.stop_task(&task_id).await.unwrap();
    let result = wait_for_result(&engine, &task_id, TIMEOUT).await;

    assert!(stop_started.elapsed() < Duration::from_secs(5));
    assert_eq!(result, LastResult::Cancelled { output: "begin\n".into() });
    assert_eq!(
        recorder.states(&task_id).last(),
        Some(&LastResult::Cancelled { output: "begin\n".into() })
    );
    assert_eq!(recorder.output(&run_id), "begin\n");

    engine.shutdown().await;
}

/// Test: A process that ignores SIGTERM is killed once the grace expires.
#[tokio::test]
async fn test_stop_escalates_when_term_is_ignored() {
    let config = EngineConfig {
        stop_grace_ms: 200,
        ..EngineConfig::ephemeral()
    };
    let engine = offline_engine(config).await;
    let saved = engine
        .create_task(TaskDraft::new(
            "stubborn",
            "trap '' TERM; echo ready; sleep 30",
        ))
        .await
        .unwrap();
    let task_id = saved.task.id;

    engine.run_task(&task_id).await.unwrap();
    let start = Instant::now();
    while engine.live_output(&task_id).is_none_or(|out| !out.contains("ready")) {
        assert!(start.elapsed() < TIMEOUT, "command never became ready");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stop_started = Instant::now();
    engine.stop_task(&task_id).await.unwrap();
    let result = wait_for_result(&engine, &task_id, TIMEOUT).await;

    assert!(matches!(result, LastResult::Cancelled { .. }));
    assert!(stop_started.elapsed() < Duration::from_secs(5));

    engine.shutdown().await;
}

/// Test: Stop still ends the run when the shell has exited but a background
/// child keeps the output pipes open.
#[tokio::test]
async fn test_stop_kills_background_child_of_exited_shell() {
    let config = EngineConfig {
        stop_grace_ms: 300,
        ..EngineConfig::ephemeral()
    };
    let engine = offline_engine(config).await;
    let saved = engine
        .create_task(TaskDraft::new("daemonish", "echo up; sleep 60 &"))
        .await
        .unwrap();
    let task_id = saved.task.id;

    engine.run_task(&task_id).await.unwrap();
    let start = Instant::now();
    while engine.live_output(&task_id).is_none_or(|out| !out.contains("up")) {
        assert!(start.elapsed() < TIMEOUT, "command never printed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(engine.is_running(&task_id));

    let stop_started = Instant::now();
    engine.stop_task(&task_id).await.unwrap();
    let result = wait_for_result(&engine, &task_id, TIMEOUT).await;

    assert_eq!(result, LastResult::Cancelled { output: "up\n".into() });
    assert!(stop_started.elapsed() < Duration::from_secs(5));

    engine.shutdown().await;
}

/// Test: Deleting a task mid-run lets the run finish and discards its result.
#[tokio::test]
async fn test_delete_mid_run_discards_result() {
    let engine = offline_engine(EngineConfig::ephemeral()).await;
    let saved = engine
        .create_task(TaskDraft::new("doomed", "sleep 0.3; echo done"))
        .await
        .unwrap();
    let task_id = saved.task.id;

    let mut subscription = engine.subscribe();
    engine.run_task(&task_id).await.unwrap();
    engine.delete_task(&task_id).await.unwrap();

    // The run is detached, not killed.
    assert!(engine.is_running(&task_id));
    let result = wait_for_event_result(&mut subscription, &task_id, TIMEOUT).await;
    assert_eq!(result, Some(LastResult::Success { output: "done\n".into() }));

    wait_until_idle(&engine, &task_id, TIMEOUT).await;
    assert!(matches!(
        engine.get_task(&task_id).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(engine.list_tasks().await.is_empty());

    engine.shutdown().await;
}

/// Test: Editing a task mid-run keeps the run going and applies its result.
#[tokio::test]
async fn test_update_mid_run_applies_result() {
    let engine = offline_engine(EngineConfig::ephemeral()).await;
    let saved = engine
        .create_task(TaskDraft::new("edited", "sleep 0.3; echo old"))
        .await
        .unwrap();
    let task_id = saved.task.id;

    engine.run_task(&task_id).await.unwrap();
    engine
        .update_task(&task_id, TaskDraft::new("renamed", "echo new"))
        .await
        .unwrap();

    let result = wait_for_result(&engine, &task_id, TIMEOUT).await;
    assert_eq!(result, LastResult::Success { output: "old\n".into() });

    let task = engine.get_task(&task_id).await.unwrap();
    assert_eq!(task.name, "renamed");
    assert_eq!(task.command, "echo new");

    engine.shutdown().await;
}

/// Test: Runs of different tasks proceed concurrently.
#[tokio::test]
async fn test_different_tasks_run_concurrently() {
    let engine = offline_engine(EngineConfig::ephemeral()).await;
    let mut ids = Vec::new();
    for i in 0..3 {
        let saved = engine
            .create_task(TaskDraft::new(format!("t{i}"), "sleep 0.5"))
            .await
            .unwrap();
        ids.push(saved.task.id);
    }

    let started = Instant::now();
    for id in &ids {
        engine.run_task(id).await.unwrap();
    }
    assert_eq!(engine.running().len(), 3);

    for id in &ids {
        let result = wait_for_result(&engine, id, TIMEOUT).await;
        assert!(matches!(result, LastResult::Success { .. }));
    }
    assert!(started.elapsed() < Duration::from_millis(1400));

    engine.shutdown().await;
}

/// Test: Large output is tail-truncated in the stored result.
#[tokio::test]
async fn test_large_output_is_truncated() {
    let config = EngineConfig {
        max_result_bytes: 64,
        ..EngineConfig::ephemeral()
    };
    let engine = offline_engine(config).await;
    let saved = engine
        .create_task(TaskDraft::new("chatty", "seq 1 1000"))
        .await
        .unwrap();

    engine.run_task(&saved.task.id).await.unwrap();
    let result = wait_for_result(&engine, &saved.task.id, TIMEOUT).await;

    let output = result.output().unwrap().to_string();
    assert!(output.starts_with("... [output truncated, "));
    assert!(output.ends_with("999\n1000\n"));

    engine.shutdown().await;
}

/// Test: A shell that cannot be spawned records a start failure.
#[tokio::test]
async fn test_missing_shell_records_start_failure() {
    let config = EngineConfig {
        shell: Some(crony::execution::Shell::new(
            "/nonexistent/crony-shell",
            ["-c"],
        )),
        ..EngineConfig::ephemeral()
    };
    let engine = offline_engine(config).await;
    let saved = engine.create_task(TaskDraft::new("t", "true")).await.unwrap();

    engine.run_task(&saved.task.id).await.unwrap();
    let result = wait_for_result(&engine, &saved.task.id, TIMEOUT).await;

    match result {
        LastResult::Error { message, .. } => assert!(message.starts_with("failed to start")),
        other => panic!("expected start failure, got {:?}", other),
    }

    engine.shutdown().await;
}
