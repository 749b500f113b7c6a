//! Asynchronous task submission with persisted status and results.
//!
//! `submit` checks the prompt and takes the execution lease before returning,
//! so callers see rejections and busy signals directly. The workflow then runs
//! in a spawned task that records progress, releases the lease and stores the
//! result under the request id.

use crate::config::{Backend, TasksConfig, WeaverConfig};
use crate::engine::{new_request_id, WorkflowEngine, WorkflowResponse};
use crate::errors::{StoreResult, WeaverError, WeaverResult};
use crate::gate::ExecutionGate;
use crate::pipeline::Pipeline;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

/// Lifecycle of a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Answer to a status poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusRecord {
    pub request_id: String,
    pub status: TaskStatus,
    /// 0, 10, 90 or 100
    pub progress: u8,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

/// Stored outcome of a finished request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub request_id: String,
    pub status: TaskStatus,
    /// Composed image first, then the generated one
    pub images: Vec<String>,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TaskResult {
    fn from_response(response: &WorkflowResponse) -> Self {
        Self {
            request_id: response.request_id.clone(),
            status: if response.is_success() {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            },
            images: response.image_urls(),
            output: response.output.clone(),
            error: response.error.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Returned by a successful submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    /// Always "accepted"
    pub status: String,
    pub request_id: String,
    pub estimated_time_secs: u64,
    pub created_at: DateTime<Utc>,
}

/// A file attached to a submission.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Original file name; only its extension is kept
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
        }
    }

    /// Read an attachment from disk.
    pub async fn from_path(path: &Path) -> WeaverResult<Self> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self { file_name, bytes })
    }

    fn extension(&self) -> String {
        Path::new(&self.file_name)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_else(|| ".png".to_string())
    }
}

/// Status and result persistence with expiry.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn put_status(&self, record: &TaskStatusRecord, ttl: Duration) -> StoreResult<()>;

    /// Unexpired status, if any.
    async fn get_status(&self, request_id: &str) -> StoreResult<Option<TaskStatusRecord>>;

    async fn put_result(&self, result: &TaskResult, ttl: Duration) -> StoreResult<()>;

    /// Unexpired result, if any.
    async fn get_result(&self, request_id: &str) -> StoreResult<Option<TaskResult>>;

    /// Drop expired records. Returns how many were removed.
    async fn purge_expired(&self) -> StoreResult<u64>;
}

/// In-process task store.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    statuses: DashMap<String, (TaskStatusRecord, DateTime<Utc>)>,
    results: DashMap<String, (TaskResult, DateTime<Utc>)>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn put_status(&self, record: &TaskStatusRecord, ttl: Duration) -> StoreResult<()> {
        self.statuses
            .insert(record.request_id.clone(), (record.clone(), Utc::now() + ttl));
        Ok(())
    }

    async fn get_status(&self, request_id: &str) -> StoreResult<Option<TaskStatusRecord>> {
        Ok(self
            .statuses
            .get(request_id)
            .filter(|entry| entry.1 > Utc::now())
            .map(|entry| entry.0.clone()))
    }

    async fn put_result(&self, result: &TaskResult, ttl: Duration) -> StoreResult<()> {
        self.results
            .insert(result.request_id.clone(), (result.clone(), Utc::now() + ttl));
        Ok(())
    }

    async fn get_result(&self, request_id: &str) -> StoreResult<Option<TaskResult>> {
        Ok(self
            .results
            .get(request_id)
            .filter(|entry| entry.1 > Utc::now())
            .map(|entry| entry.0.clone()))
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        let now = Utc::now();
        let before = self.statuses.len() + self.results.len();
        self.statuses.retain(|_, entry| entry.1 > now);
        self.results.retain(|_, entry| entry.1 > now);
        Ok((before - self.statuses.len() - self.results.len()) as u64)
    }
}

/// SQLite-backed task store, readable from other processes.
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Open (creating if needed) the database and its tables.
    pub async fn open(db_path: PathBuf) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let connect_options = SqliteConnectOptions::from_str(db_path.to_string_lossy().as_ref())?
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(connect_options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_status (
                request_id TEXT PRIMARY KEY NOT NULL,
                body TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_results (
                request_id TEXT PRIMARY KEY NOT NULL,
                body TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    async fn put<T: Serialize>(&self, table: &str, request_id: &str, value: &T, ttl: Duration) -> StoreResult<()> {
        let body = serde_json::to_string(value)?;
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {} (request_id, body, expires_at) VALUES (?, ?, ?)",
            table
        ))
        .bind(request_id)
        .bind(body)
        .bind((Utc::now() + ttl).timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, table: &str, request_id: &str) -> StoreResult<Option<T>> {
        let row = sqlx::query(&format!(
            "SELECT body FROM {} WHERE request_id = ? AND expires_at > ?",
            table
        ))
        .bind(request_id)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let body: String = row.get("body");
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn put_status(&self, record: &TaskStatusRecord, ttl: Duration) -> StoreResult<()> {
        self.put("task_status", &record.request_id, record, ttl).await
    }

    async fn get_status(&self, request_id: &str) -> StoreResult<Option<TaskStatusRecord>> {
        self.get("task_status", request_id).await
    }

    async fn put_result(&self, result: &TaskResult, ttl: Duration) -> StoreResult<()> {
        self.put("task_results", &result.request_id, result, ttl).await
    }

    async fn get_result(&self, request_id: &str) -> StoreResult<Option<TaskResult>> {
        self.get("task_results", request_id).await
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        let now = Utc::now().timestamp_millis();
        let mut removed = 0;
        for table in ["task_status", "task_results"] {
            removed += sqlx::query(&format!("DELETE FROM {} WHERE expires_at <= ?", table))
                .bind(now)
                .execute(&self.pool)
                .await?
                .rows_affected();
        }
        Ok(removed)
    }
}

/// Submit, poll and fetch requests.
pub struct TaskService {
    pipeline: Pipeline,
    store: Arc<dyn TaskStore>,
    ttl: Duration,
    upload_dir: PathBuf,
}

impl TaskService {
    pub fn new(pipeline: Pipeline, store: Arc<dyn TaskStore>, config: &TasksConfig) -> Self {
        Self {
            pipeline,
            store,
            ttl: Duration::hours(config.ttl_hours.min(24 * 365) as i64),
            upload_dir: config.upload_dir.clone(),
        }
    }

    pub async fn from_config(config: &WeaverConfig) -> WeaverResult<Self> {
        let pipeline = Pipeline::from_config(config).await?;
        let store: Arc<dyn TaskStore> = match config.tasks.backend {
            Backend::Memory => Arc::new(MemoryTaskStore::new()),
            Backend::Sqlite => Arc::new(SqliteTaskStore::open(config.tasks.db_path.clone()).await?),
        };
        Ok(Self::new(pipeline, store, &config.tasks))
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Accept a request and start it in the background.
    ///
    /// Fails with `GateError::Rejected` for unsafe prompts and `GateError::Busy`
    /// while another request holds the lease. The returned handle completes once
    /// the result is stored.
    pub async fn submit(
        &self,
        prompt: &str,
        attachments: Vec<Attachment>,
    ) -> WeaverResult<(SubmitReceipt, JoinHandle<()>)> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(WeaverError::InvalidRequest("prompt must not be empty".to_string()));
        }

        self.pipeline.safety().check(prompt)?;

        let request_id = new_request_id();
        let gate = self.pipeline.gate().clone();
        let permit = gate.acquire(&request_id).await?;

        let saved = match self.save_attachments(&request_id, &attachments).await {
            Ok(saved) => saved,
            Err(e) => {
                gate.release(permit).await;
                return Err(e);
            }
        };

        let accepted = self
            .record_status(&request_id, TaskStatus::Processing, 0, "Request accepted")
            .await;
        if let Err(e) = accepted {
            gate.release(permit).await;
            remove_files(&saved).await;
            return Err(e);
        }

        let receipt = SubmitReceipt {
            status: "accepted".to_string(),
            request_id: request_id.clone(),
            estimated_time_secs: if saved.is_empty() { 30 } else { 60 },
            created_at: Utc::now(),
        };
        info!(request_id = %request_id, attachments = saved.len(), "Request accepted");

        let job = Job {
            request_id: request_id.clone(),
            prompt: prompt.to_string(),
            images: saved,
            engine: self.pipeline.engine().clone(),
            gate,
            store: self.store.clone(),
            ttl: self.ttl,
        };
        let span = tracing::info_span!("task", request_id = %request_id);
        let handle = tokio::spawn(job.run(permit).instrument(span));

        Ok((receipt, handle))
    }

    /// Current status of a request.
    pub async fn status(&self, request_id: &str) -> WeaverResult<TaskStatusRecord> {
        self.store
            .get_status(request_id)
            .await?
            .ok_or_else(|| WeaverError::TaskNotFound(request_id.to_string()))
    }

    /// Stored result, or a processing placeholder while the request runs.
    pub async fn result(&self, request_id: &str) -> WeaverResult<TaskResult> {
        if let Some(result) = self.store.get_result(request_id).await? {
            return Ok(result);
        }

        let status = self.status(request_id).await?;
        Ok(TaskResult {
            request_id: status.request_id,
            status: status.status,
            images: Vec::new(),
            output: status.message,
            error: None,
            created_at: status.updated_at,
        })
    }

    async fn save_attachments(
        &self,
        request_id: &str,
        attachments: &[Attachment],
    ) -> WeaverResult<Vec<PathBuf>> {
        if attachments.is_empty() {
            return Ok(Vec::new());
        }

        tokio::fs::create_dir_all(&self.upload_dir).await?;
        let mut saved = Vec::with_capacity(attachments.len());
        for (i, attachment) in attachments.iter().enumerate() {
            let path = self
                .upload_dir
                .join(format!("{}_{}{}", request_id, i, attachment.extension()));
            if let Err(e) = tokio::fs::write(&path, &attachment.bytes).await {
                remove_files(&saved).await;
                return Err(e.into());
            }
            saved.push(path);
        }
        Ok(saved)
    }

    async fn record_status(
        &self,
        request_id: &str,
        status: TaskStatus,
        progress: u8,
        message: &str,
    ) -> WeaverResult<()> {
        put_status(self.store.as_ref(), request_id, status, progress, message, self.ttl).await?;
        Ok(())
    }
}

/// Everything the background run owns.
struct Job {
    request_id: String,
    prompt: String,
    images: Vec<PathBuf>,
    engine: Arc<WorkflowEngine>,
    gate: Arc<ExecutionGate>,
    store: Arc<dyn TaskStore>,
    ttl: Duration,
}

impl Job {
    async fn run(self, permit: crate::gate::Permit) {
        self.progress(TaskStatus::Processing, 10, "Generating").await;

        let outcome = AssertUnwindSafe(self.engine.run_with_id(
            self.request_id.clone(),
            &self.prompt,
            None,
            self.images.clone(),
        ))
        .catch_unwind()
        .await;

        self.gate.release(permit).await;
        remove_files(&self.images).await;
        self.progress(TaskStatus::Processing, 90, "Storing the result").await;

        let result = match outcome {
            Ok(response) => TaskResult::from_response(&response),
            Err(_) => {
                error!("Workflow panicked");
                TaskResult {
                    request_id: self.request_id.clone(),
                    status: TaskStatus::Failed,
                    images: Vec::new(),
                    output: "Internal error while processing the request".to_string(),
                    error: Some("workflow panicked".to_string()),
                    created_at: Utc::now(),
                }
            }
        };

        if let Err(e) = self.store.put_result(&result, self.ttl).await {
            error!("Failed to store result: {}", e);
            self.progress(TaskStatus::Failed, 100, "The result could not be stored").await;
            return;
        }

        match result.status {
            TaskStatus::Completed => {
                self.progress(TaskStatus::Completed, 100, "Request completed")
                    .await
            }
            _ => {
                let message = result.error.as_deref().unwrap_or("Request failed");
                self.progress(TaskStatus::Failed, 100, message).await
            }
        }
        info!(status = %result.status, "Task finished");
    }

    async fn progress(&self, status: TaskStatus, progress: u8, message: &str) {
        let stored = put_status(
            self.store.as_ref(),
            &self.request_id,
            status,
            progress,
            message,
            self.ttl,
        )
        .await;
        if let Err(e) = stored {
            warn!("Failed to record progress {}: {}", progress, e);
        }
    }
}

async fn put_status(
    store: &dyn TaskStore,
    request_id: &str,
    status: TaskStatus,
    progress: u8,
    message: &str,
    ttl: Duration,
) -> StoreResult<()> {
    let record = TaskStatusRecord {
        request_id: request_id.to_string(),
        status,
        progress,
        message: message.to_string(),
        updated_at: Utc::now(),
    };
    store.put_status(&record, ttl).await
}

async fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {:?}: {}", path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> TaskStatusRecord {
        TaskStatusRecord {
            request_id: id.to_string(),
            status: TaskStatus::Processing,
            progress: 10,
            message: "Generating".to_string(),
            updated_at: Utc::now(),
        }
    }

    fn result(id: &str) -> TaskResult {
        TaskResult {
            request_id: id.to_string(),
            status: TaskStatus::Completed,
            images: vec!["https://cdn.example.com/a.png".to_string()],
            output: "done".to_string(),
            error: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_expiry() {
        let store = MemoryTaskStore::new();
        store.put_status(&record("live"), Duration::hours(24)).await.unwrap();
        store.put_status(&record("stale"), Duration::seconds(-1)).await.unwrap();

        assert!(store.get_status("live").await.unwrap().is_some());
        assert!(store.get_status("stale").await.unwrap().is_none());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_store_round_trip_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteTaskStore::open(dir.path().join("tasks.db")).await.unwrap();

        store.put_status(&record("gen_a"), Duration::hours(24)).await.unwrap();
        store.put_result(&result("gen_a"), Duration::hours(24)).await.unwrap();
        store.put_result(&result("gen_old"), Duration::seconds(-1)).await.unwrap();

        assert_eq!(store.get_status("gen_a").await.unwrap().unwrap().progress, 10);
        assert_eq!(
            store.get_result("gen_a").await.unwrap().unwrap().images[0],
            "https://cdn.example.com/a.png"
        );
        assert!(store.get_result("gen_old").await.unwrap().is_none());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_value(record("gen_a")).unwrap();
        assert_eq!(json["status"], "processing");
    }

    #[test]
    fn test_attachment_extension() {
        assert_eq!(Attachment::new("Logo.PNG", Vec::new()).extension(), ".png");
        assert_eq!(Attachment::new("qr.jpeg", Vec::new()).extension(), ".jpeg");
        assert_eq!(Attachment::new("blob", Vec::new()).extension(), ".png");
    }
}
