//! The workflow engine: drives a fresh `WorkflowState` through the stage
//! handlers until a terminal stage is reached.
//!
//! The engine is plain configuration (collaborators, prompts, limits). Nothing
//! in it is specific to one request, so a single instance can serve any number
//! of runs.

use crate::collaborators::Collaborators;
use crate::config::{EngineConfig, WeaverConfig};
use crate::errors::{WeaverError, WeaverResult};
use crate::event_fields;
use crate::memory::{
    render_history, Checkpoint, ConversationMemory, InMemoryConversationMemory, DEFAULT_MAX_TURNS,
};
use crate::messages::Messages;
use crate::observe::{DesignObserver, KeywordOverlap};
use crate::prompts::PromptSet;
use crate::providers::build_collaborators;
use crate::router::{self, Route};
use crate::stages::{self, StageContext};
use crate::state::{DesignBrief, EventKind, ImageResult, Stage, WorkflowEvent, WorkflowState};
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Checkpoints of the same conversation replayed into prompts.
const HISTORY_TURNS: usize = 5;

/// Fields extracted from the final state of a run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResponse {
    pub request_id: String,
    pub conversation_id: String,
    pub stage: Stage,
    pub output: String,
    pub events: Vec<WorkflowEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub design_result: Option<DesignBrief>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_result: Option<ImageResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub composed_image_result: Option<ImageResult>,
}

impl WorkflowResponse {
    pub fn is_success(&self) -> bool {
        self.stage == Stage::Complete
    }

    /// Image URLs, composed image first.
    pub fn image_urls(&self) -> Vec<String> {
        [&self.composed_image_result, &self.image_result]
            .into_iter()
            .flatten()
            .filter_map(|image| image.url.clone())
            .collect()
    }

    /// Stages that emitted a `stage_start` event, in order.
    pub fn visited_stages(&self) -> Vec<Stage> {
        self.events
            .iter()
            .filter(|e| e.kind == EventKind::StageStart)
            .filter_map(|e| e.extra.get("stage"))
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect()
    }
}

impl From<WorkflowState> for WorkflowResponse {
    fn from(state: WorkflowState) -> Self {
        Self {
            request_id: state.request_id,
            conversation_id: state.conversation_id,
            stage: state.stage,
            output: state.output.unwrap_or_default(),
            events: state.events,
            error: state.error,
            design_result: state.design_result,
            image_result: state.image_result,
            composed_image_result: state.composed_image_result,
        }
    }
}

/// New request identifier, `gen_` followed by 12 hex digits.
pub fn new_request_id() -> String {
    format!("gen_{}", &Uuid::new_v4().simple().to_string()[..12])
}

/// Stateless workflow engine.
pub struct WorkflowEngine {
    collaborators: Collaborators,
    prompts: PromptSet,
    messages: Messages,
    config: EngineConfig,
    image_size: String,
    observer: Option<Arc<dyn DesignObserver>>,
    memory: Arc<dyn ConversationMemory>,
}

impl WorkflowEngine {
    /// Build an engine around explicit collaborators.
    pub fn new(collaborators: Collaborators, config: &WeaverConfig) -> WeaverResult<Self> {
        if config.engine.max_steps == 0 {
            return Err(WeaverError::ConfigError(
                "engine.max_steps must be greater than 0".to_string(),
            ));
        }

        let observer: Option<Arc<dyn DesignObserver>> = if config.engine.relevance_check {
            Some(Arc::new(KeywordOverlap::default()))
        } else {
            None
        };

        Ok(Self {
            collaborators,
            prompts: PromptSet::load(config.engine.prompts_dir.as_deref()),
            messages: Messages::new(config.engine.locale),
            config: config.engine.clone(),
            image_size: config.image.size.clone(),
            observer,
            memory: Arc::new(InMemoryConversationMemory::with_capacity(
                DEFAULT_MAX_TURNS,
                config.engine.max_conversations,
            )),
        })
    }

    /// Build an engine with the production adapters.
    ///
    /// Fails when the configuration is incomplete, e.g. without an API key.
    pub fn from_config(config: &WeaverConfig) -> WeaverResult<Self> {
        config.validate()?;
        let prompts = PromptSet::load(config.engine.prompts_dir.as_deref());
        let collaborators = build_collaborators(config, &prompts)?;
        Self::new(collaborators, config)
    }

    pub fn with_observer(mut self, observer: Arc<dyn DesignObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn ConversationMemory>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_prompts(mut self, prompts: PromptSet) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn memory(&self) -> &Arc<dyn ConversationMemory> {
        &self.memory
    }

    /// Run a request under a freshly generated request id.
    pub async fn run(
        &self,
        input: &str,
        conversation_id: Option<&str>,
        input_images: Vec<PathBuf>,
    ) -> WorkflowResponse {
        self.run_with_id(new_request_id(), input, conversation_id, input_images)
            .await
    }

    /// Run a request. Business failures end in `Stage::Error`; this never fails.
    pub async fn run_with_id(
        &self,
        request_id: String,
        input: &str,
        conversation_id: Option<&str>,
        input_images: Vec<PathBuf>,
    ) -> WorkflowResponse {
        let conversation_id = conversation_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = info_span!(
            "workflow",
            request_id = %request_id,
            conversation_id = %conversation_id
        );

        async move {
            info!("Workflow started");
            let state = self.prepare(request_id, conversation_id, input, input_images);
            let ctx = self.context();
            let ctx = &ctx;
            let mut state = self
                .drive(state, move |state| stages::dispatch(ctx, state))
                .await;

            self.checkpoint(&state);
            cleanup_temp_files(&mut state).await;

            info!(
                stage = %state.stage,
                events = state.events.len(),
                elapsed = state.elapsed_seconds(),
                "Workflow finished"
            );
            WorkflowResponse::from(state)
        }
        .instrument(span)
        .await
    }

    fn context(&self) -> StageContext<'_> {
        StageContext {
            collaborators: &self.collaborators,
            prompts: &self.prompts,
            messages: self.messages,
            engine: &self.config,
            image_size: &self.image_size,
            observer: self.observer.as_deref(),
        }
    }

    /// Fresh state with validated images and the conversation history attached.
    fn prepare(
        &self,
        request_id: String,
        conversation_id: String,
        input: &str,
        input_images: Vec<PathBuf>,
    ) -> WorkflowState {
        let (valid, invalid): (Vec<PathBuf>, Vec<PathBuf>) =
            input_images.into_iter().partition(|p| p.is_file());

        let mut state = WorkflowState::new(request_id, conversation_id, input, valid);

        for path in invalid {
            warn!("Ignoring input image {:?}: not a readable file", path);
            state.record_with(
                EventKind::Warning,
                format!("Ignoring input image {}: file not found", path.display()),
                event_fields! { "path" => path.display().to_string() },
            );
        }

        if !state.input_images.is_empty() {
            let paths: Vec<String> = state
                .input_images
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            state.record_with(
                EventKind::InputImagesAdded,
                format!("{} input image(s) attached", paths.len()),
                event_fields! { "count" => paths.len(), "paths" => paths },
            );
        }

        let history = self.memory.recent(&state.conversation_id, HISTORY_TURNS);
        state.history = render_history(&history);
        state
    }

    /// Drive `state` through `handler` until the router reports a terminal stage.
    async fn drive<H, Fut>(&self, mut state: WorkflowState, handler: H) -> WorkflowState
    where
        H: Fn(WorkflowState) -> Fut,
        Fut: Future<Output = WorkflowState>,
    {
        let mut steps = 0usize;

        while let Route::Next(stage) = router::route(state.stage) {
            if steps >= self.config.max_steps {
                error!(max_steps = self.config.max_steps, %stage, "Step limit exceeded");
                state.fail(
                    self.messages.internal_error(),
                    format!(
                        "step limit of {} exceeded while in stage {}",
                        self.config.max_steps, stage
                    ),
                );
                break;
            }
            steps += 1;
            debug!(step = steps, %stage, "Running stage handler");

            let snapshot = state.clone();
            match AssertUnwindSafe(handler(state)).catch_unwind().await {
                Ok(next) => {
                    state = next;
                    if state.stage != stage && !router::is_valid_handoff(stage, state.stage) {
                        error!(from = %stage, to = %state.stage, "Invalid stage hand-off");
                        let detail = format!("invalid transition from {} to {}", stage, state.stage);
                        state.stage = stage;
                        state.fail(self.messages.internal_error(), detail);
                    }
                }
                Err(panic) => {
                    let detail = panic_message(panic.as_ref());
                    error!(%stage, "Stage handler panicked: {}", detail);
                    state = snapshot;
                    state.fail(
                        self.messages.internal_error(),
                        format!("stage {} panicked: {}", stage, detail),
                    );
                }
            }
        }

        if state.output.as_deref().map_or(true, |o| o.trim().is_empty()) {
            warn!(stage = %state.stage, "Workflow ended without output");
            let detail = state
                .error
                .clone()
                .unwrap_or_else(|| "workflow ended without output".to_string());
            state.fail(self.messages.internal_error(), detail);
        }

        state
    }

    fn checkpoint(&self, state: &WorkflowState) {
        self.memory.append(
            &state.conversation_id,
            Checkpoint {
                request_id: state.request_id.clone(),
                input: state.input_text.clone(),
                output: state.output.clone().unwrap_or_default(),
                stage: state.stage,
                at: Utc::now(),
            },
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Best-effort removal of per-request scratch files.
async fn cleanup_temp_files(state: &mut WorkflowState) {
    for path in state.temp_files.take() {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("Removed temp file {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove temp file {:?}: {}", path, e),
        }
    }
}
