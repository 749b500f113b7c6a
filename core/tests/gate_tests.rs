//! Execution gate behaviour under contention, and the gated pipeline.

mod common;

use chrono::Duration;
use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tempfile::TempDir;
use tokio::sync::Barrier;
use visionweaver_core::{
    Backoff, ExecutionGate, GateError, KeywordFilter, LeaseStore, MemoryLeaseStore, Pipeline,
    SafetyGate, SqliteLeaseStore, Stage,
};

const KEY: &str = "visionweaver:request_lock";

fn memory_gate(ttl: Duration) -> Arc<ExecutionGate> {
    Arc::new(ExecutionGate::new(Arc::new(MemoryLeaseStore::new()), KEY, ttl))
}

/// Race `contenders` acquisitions and return the holders that won.
async fn race(gate: &Arc<ExecutionGate>, contenders: usize, round: &str) -> Vec<String> {
    let barrier = Arc::new(Barrier::new(contenders));
    let mut handles = Vec::new();
    for i in 0..contenders {
        let gate = gate.clone();
        let barrier = barrier.clone();
        let holder = format!("{}_{}", round, i);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            gate.acquire(&holder).await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(permit) => {
                winners.push(permit.holder().to_string());
                // Dropping a permit leaves the lease in place.
                drop(permit);
            }
            Err(GateError::Busy {
                retry_after_secs, ..
            }) => assert!(retry_after_secs >= 1),
            Err(e) => panic!("unexpected gate error: {}", e),
        }
    }
    winners
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_concurrent_acquisition_wins() {
    let gate = memory_gate(Duration::seconds(60));

    let winners = race(&gate, 16, "first").await;
    assert_eq!(winners.len(), 1);

    let current = gate.current().await.unwrap().unwrap();
    assert_eq!(current.holder, winners[0]);

    assert!(gate.force_release().await.unwrap());
    let winners = race(&gate, 16, "second").await;
    assert_eq!(winners.len(), 1);
    assert!(winners[0].starts_with("second_"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_concurrent_acquisition_wins_on_sqlite() {
    let dir = TempDir::new().unwrap();
    let store = SqliteLeaseStore::open(dir.path().join("gate.db")).await.unwrap();
    let gate = Arc::new(ExecutionGate::new(Arc::new(store), KEY, Duration::seconds(60)));

    let winners = race(&gate, 8, "sqlite").await;
    assert_eq!(winners.len(), 1);
}

#[tokio::test]
async fn test_expired_lease_admits_exactly_one_waiter() {
    let store = Arc::new(MemoryLeaseStore::new());
    let gate = ExecutionGate::new(store.clone(), KEY, Duration::seconds(60));

    assert!(store
        .try_acquire(KEY, "stale", Duration::milliseconds(50))
        .await
        .unwrap());
    assert!(matches!(
        gate.acquire("early").await,
        Err(GateError::Busy { .. })
    ));

    tokio::time::sleep(StdDuration::from_millis(80)).await;

    let permit = gate.acquire("late").await.unwrap();
    assert!(gate.acquire("later").await.is_err());

    // The stale holder cannot remove its successor's lease.
    assert!(!store.release(KEY, "stale").await.unwrap());
    assert_eq!(gate.current().await.unwrap().unwrap().holder, "late");
    assert!(gate.release(permit).await);
}

#[tokio::test]
async fn test_busy_gate_rejects_before_any_work() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(dir.path(), ScriptedLlm::image_flow());
    let engine = Arc::new(harness.engine(&test_config(dir.path())));
    let gate = memory_gate(Duration::seconds(300));
    let pipeline = Pipeline::new(SafetyGate::disabled(), gate.clone(), engine);

    let held = gate.acquire("gen_other").await.unwrap();

    let err = pipeline
        .run("Generate a cute cartoon cat", None, Vec::new())
        .await
        .unwrap_err();
    match err {
        GateError::Busy {
            holder,
            retry_after_secs,
        } => {
            assert_eq!(holder.as_deref(), Some("gen_other"));
            assert!(retry_after_secs > 0 && retry_after_secs <= 300);
        }
        other => panic!("expected busy, got {}", other),
    }
    assert!(harness.llm.calls().is_empty());
    assert_eq!(harness.generator.calls.load(Ordering::SeqCst), 0);

    assert!(gate.release(held).await);
    let response = pipeline
        .run("Generate a cute cartoon cat", None, Vec::new())
        .await
        .unwrap();
    assert_eq!(response.stage, Stage::Complete);
    assert!(gate.current().await.unwrap().is_none());
}

#[tokio::test]
async fn test_lease_is_released_after_a_failed_run() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(dir.path(), ScriptedLlm::new());
    let engine = Arc::new(harness.engine(&test_config(dir.path())));
    let gate = memory_gate(Duration::seconds(300));
    let pipeline = Pipeline::new(SafetyGate::disabled(), gate.clone(), engine);

    // No scripted assessment reply: the run ends in Error.
    let response = pipeline.run("Draw a fox", None, Vec::new()).await.unwrap();
    assert_eq!(response.stage, Stage::Error);
    assert!(gate.current().await.unwrap().is_none());
}

#[tokio::test]
async fn test_unsafe_prompt_never_touches_the_lease() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(dir.path(), ScriptedLlm::image_flow());
    let engine = Arc::new(harness.engine(&test_config(dir.path())));
    let gate = memory_gate(Duration::seconds(300));
    let safety = SafetyGate::new(Arc::new(KeywordFilter::default()));
    let pipeline = Pipeline::new(safety, gate.clone(), engine);

    let held = gate.acquire("gen_other").await.unwrap();
    let err = pipeline
        .run("a poster of a casino night", None, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::Rejected { .. }));
    assert!(!err.is_retryable());
    assert_eq!(gate.current().await.unwrap().unwrap().holder, "gen_other");
    assert!(gate.release(held).await);
}

#[tokio::test]
async fn test_backoff_waits_for_the_lease() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(dir.path(), ScriptedLlm::image_flow());
    let engine = Arc::new(harness.engine(&test_config(dir.path())));
    let gate = memory_gate(Duration::seconds(300));
    let pipeline = Pipeline::new(SafetyGate::disabled(), gate.clone(), engine).with_backoff(
        Backoff::new(20, StdDuration::from_millis(10), StdDuration::from_millis(40)),
    );

    let held = gate.acquire("gen_other").await.unwrap();
    let releaser = {
        let gate = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(100)).await;
            gate.release(held).await
        })
    };

    let response = pipeline
        .run_with_backoff("Generate a cute cartoon cat", None, Vec::new())
        .await
        .unwrap();
    assert!(releaser.await.unwrap());
    assert_eq!(response.stage, Stage::Complete);
}

#[tokio::test]
async fn test_backoff_gives_up_when_attempts_run_out() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(dir.path(), ScriptedLlm::image_flow());
    let engine = Arc::new(harness.engine(&test_config(dir.path())));
    let gate = memory_gate(Duration::seconds(300));
    let pipeline = Pipeline::new(SafetyGate::disabled(), gate.clone(), engine).with_backoff(
        Backoff::new(3, StdDuration::from_millis(5), StdDuration::from_millis(10)),
    );

    let held = gate.acquire("gen_other").await.unwrap();
    let err = pipeline
        .run_with_backoff("Generate a cute cartoon cat", None, Vec::new())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(harness.llm.calls().is_empty());
    assert!(gate.release(held).await);
}
