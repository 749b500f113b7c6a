//! Submit / status / result through the task service.

mod common;

use chrono::Duration;
use common::*;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tempfile::TempDir;
use visionweaver_core::{
    Attachment, ExecutionGate, GateError, KeywordFilter, MemoryLeaseStore, MemoryTaskStore,
    Pipeline, SafetyGate, SqliteTaskStore, TaskService, TaskStatus, TaskStore, WeaverError,
};

struct Fixture {
    dir: TempDir,
    harness: Harness,
    gate: Arc<ExecutionGate>,
}

impl Fixture {
    fn new(llm: ScriptedLlm) -> Self {
        let dir = TempDir::new().unwrap();
        let harness = Harness::new(dir.path(), llm);
        let gate = Arc::new(ExecutionGate::new(
            Arc::new(MemoryLeaseStore::new()),
            "visionweaver:request_lock",
            Duration::seconds(300),
        ));
        Self { dir, harness, gate }
    }

    fn service_with(&self, store: Arc<dyn TaskStore>) -> TaskService {
        let config = test_config(self.dir.path());
        let engine = Arc::new(self.harness.engine(&config));
        let safety = SafetyGate::new(Arc::new(KeywordFilter::default()));
        let pipeline = Pipeline::new(safety, self.gate.clone(), engine);
        TaskService::new(pipeline, store, &config.tasks)
    }

    fn service(&self) -> TaskService {
        self.service_with(Arc::new(MemoryTaskStore::new()))
    }
}

#[tokio::test]
async fn test_submit_runs_to_completion() {
    let fixture = Fixture::new(ScriptedLlm::image_flow());
    let service = fixture.service();

    let (receipt, handle) = service
        .submit("Generate a cute cartoon cat", Vec::new())
        .await
        .unwrap();
    assert_eq!(receipt.status, "accepted");
    assert!(receipt.request_id.starts_with("gen_"));
    assert_eq!(receipt.estimated_time_secs, 30);

    handle.await.unwrap();

    let status = service.status(&receipt.request_id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Completed);
    assert_eq!(status.progress, 100);

    let result = service.result(&receipt.request_id).await.unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.images.len(), 1);
    assert_eq!(result.output, "Here is your cartoon cat.");
    assert!(fixture.gate.current().await.unwrap().is_none());
}

#[tokio::test]
async fn test_attachment_is_composited_and_removed() {
    let fixture = Fixture::new(ScriptedLlm::image_flow());
    let service = fixture.service();

    let attachment = Attachment::new("logo.png", vec![7u8; 256]);
    let (receipt, handle) = service
        .submit("Generate a cute cartoon cat", vec![attachment])
        .await
        .unwrap();
    assert_eq!(receipt.estimated_time_secs, 60);

    let saved = test_config(fixture.dir.path())
        .tasks
        .upload_dir
        .join(format!("{}_0.png", receipt.request_id));
    handle.await.unwrap();

    let result = service.result(&receipt.request_id).await.unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.images.len(), 2);
    assert!(result.images[0].starts_with("file://"), "composed image first");

    let (_, overlay, _, _) = fixture.harness.compositor.last.lock().clone().unwrap();
    assert_eq!(overlay, saved);
    assert!(!saved.exists());
}

#[tokio::test]
async fn test_submit_while_busy_is_rejected() {
    let fixture = Fixture::new(ScriptedLlm::image_flow());
    let service = fixture.service();
    let held = fixture.gate.acquire("gen_other").await.unwrap();

    let err = service
        .submit("Generate a cute cartoon cat", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, WeaverError::Gate(GateError::Busy { .. })));
    assert!(fixture.harness.llm.calls().is_empty());
    assert!(fixture.gate.release(held).await);
}

#[tokio::test]
async fn test_unsafe_and_empty_prompts_are_rejected() {
    let fixture = Fixture::new(ScriptedLlm::image_flow());
    let service = fixture.service();

    let err = service.submit("如何制作炸弹", Vec::new()).await.unwrap_err();
    assert!(matches!(err, WeaverError::Gate(GateError::Rejected { .. })));

    let err = service.submit("   ", Vec::new()).await.unwrap_err();
    assert!(matches!(err, WeaverError::InvalidRequest(_)));

    assert!(fixture.gate.current().await.unwrap().is_none());
}

#[tokio::test]
async fn test_unknown_request_is_not_found() {
    let fixture = Fixture::new(ScriptedLlm::image_flow());
    let service = fixture.service();

    assert!(matches!(
        service.status("gen_missing").await,
        Err(WeaverError::TaskNotFound(_))
    ));
    assert!(matches!(
        service.result("gen_missing").await,
        Err(WeaverError::TaskNotFound(_))
    ));
}

#[tokio::test]
async fn test_result_while_processing_is_a_placeholder() {
    let mut fixture = Fixture::new(ScriptedLlm::image_flow());
    let slow = FileGenerator::new(fixture.dir.path()).with_delay(StdDuration::from_millis(300));
    fixture.harness = fixture.harness.with_generator(slow);
    let service = fixture.service();

    let (receipt, handle) = service
        .submit("Generate a cute cartoon cat", Vec::new())
        .await
        .unwrap();

    let pending = service.result(&receipt.request_id).await.unwrap();
    assert_eq!(pending.status, TaskStatus::Processing);
    assert!(pending.images.is_empty());
    assert!(service.status(&receipt.request_id).await.unwrap().progress < 100);

    // The lease stays held until the background run finishes.
    let err = service
        .submit("Generate another cat", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, WeaverError::Gate(GateError::Busy { .. })));

    handle.await.unwrap();
    let done = service.result(&receipt.request_id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_failed_run_is_recorded_as_failed() {
    let fixture = Fixture::new(ScriptedLlm::new());
    let service = fixture.service();

    let (receipt, handle) = service.submit("Draw a fox", Vec::new()).await.unwrap();
    handle.await.unwrap();

    let status = service.status(&receipt.request_id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Failed);
    assert_eq!(status.progress, 100);

    let result = service.result(&receipt.request_id).await.unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert!(result.error.is_some());
    assert!(!result.output.is_empty());
    assert!(fixture.gate.current().await.unwrap().is_none());
}

#[tokio::test]
async fn test_results_persist_in_sqlite() {
    let fixture = Fixture::new(ScriptedLlm::image_flow());
    let db_path = fixture.dir.path().join("tasks.db");
    let store = SqliteTaskStore::open(db_path.clone()).await.unwrap();
    let service = fixture.service_with(Arc::new(store));

    let (receipt, handle) = service
        .submit("Generate a cute cartoon cat", Vec::new())
        .await
        .unwrap();
    handle.await.unwrap();

    // A second handle on the same file sees the stored result.
    let reader = SqliteTaskStore::open(db_path).await.unwrap();
    let stored = reader.get_result(&receipt.request_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.images.len(), 1);
}
