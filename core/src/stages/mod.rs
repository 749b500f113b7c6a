//! Stage handlers.
//!
//! Every handler takes the state by value and returns it with the successor
//! stage set. Failures never escape a handler: they become `Stage::Error` with
//! a user-facing `output` and the raw detail in `error`.

pub mod assessment;
pub mod composition;
pub mod design;
pub mod generation;

use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::errors::{CollaboratorError, CollaboratorResult};
use crate::event_fields;
use crate::messages::Messages;
use crate::observe::DesignObserver;
use crate::prompts::PromptSet;
use crate::reply_parser::is_language_drift;
use crate::state::{EventKind, Stage, WorkflowState};
use std::future::Future;
use std::time::Instant;

/// Everything a handler may use besides the state itself.
pub struct StageContext<'a> {
    pub collaborators: &'a Collaborators,
    pub prompts: &'a PromptSet,
    pub messages: Messages,
    pub engine: &'a EngineConfig,
    /// Requested image size, "WIDTHxHEIGHT"
    pub image_size: &'a str,
    pub observer: Option<&'a dyn DesignObserver>,
}

/// A handler's single attempt failed.
#[derive(Debug)]
pub(crate) struct StageFailure {
    pub user_message: String,
    pub detail: String,
}

impl StageFailure {
    pub fn new(user_message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            detail: detail.into(),
        }
    }

    /// Reported errors are embedded in `rejected`; anything else gets the generic `failed` text.
    pub fn from_collaborator(
        err: &CollaboratorError,
        rejected: impl FnOnce(&str) -> String,
        failed: impl FnOnce() -> String,
    ) -> Self {
        let user_message = match err.reported_detail() {
            Some(detail) => rejected(detail),
            None => failed(),
        };
        Self::new(user_message, err.to_string())
    }
}

/// Run the handler for `stage`. Terminal stages are returned untouched.
pub async fn dispatch(ctx: &StageContext<'_>, state: WorkflowState) -> WorkflowState {
    match state.stage {
        Stage::Assessment => assessment::run(ctx, state).await,
        Stage::Design => design::run(ctx, state).await,
        Stage::Generation => generation::run(ctx, state).await,
        Stage::Composition => composition::run(ctx, state).await,
        Stage::Complete | Stage::Error => state,
    }
}

/// Resolve a handler's inner result into the returned state.
pub(crate) fn settle(
    mut state: WorkflowState,
    result: Result<(), StageFailure>,
) -> WorkflowState {
    if let Err(failure) = result {
        state.fail(failure.user_message, failure.detail);
    }
    state
}

/// Call a collaborator, bracketing it with tool events.
pub(crate) async fn call_tool<T, F>(
    state: &mut WorkflowState,
    tool: &str,
    message: &str,
    call: F,
) -> CollaboratorResult<T>
where
    F: Future<Output = CollaboratorResult<T>>,
{
    state.record_with(EventKind::ToolStart, message, event_fields! { "tool" => tool });

    let started = Instant::now();
    let result = call.await;
    let duration = started.elapsed().as_secs_f64();

    match &result {
        Ok(_) => state.record_with(
            EventKind::ToolEnd,
            format!("{} finished", tool),
            event_fields! { "tool" => tool, "success" => true, "duration_seconds" => duration },
        ),
        Err(e) => state.record_with(
            EventKind::ToolEnd,
            format!("{} failed", tool),
            event_fields! {
                "tool" => tool,
                "success" => false,
                "duration_seconds" => duration,
                "error" => e.to_string(),
            },
        ),
    }

    result
}

/// Ask the model for the user-facing reply.
///
/// An empty reply is replaced by `notice`; a reply in the wrong language keeps
/// `notice` in front of it. A failed call is returned to the handler.
pub(crate) async fn draft_reply(
    ctx: &StageContext<'_>,
    state: &mut WorkflowState,
    system: &str,
    input: &str,
    message: &str,
    notice: String,
) -> CollaboratorResult<String> {
    let text = call_tool(
        state,
        "language_model",
        message,
        ctx.collaborators.llm.ask(system, input),
    )
    .await?;

    let text = text.trim();
    if text.is_empty() {
        return Ok(notice);
    }
    if is_language_drift(text, ctx.messages.locale()) {
        state.record(
            EventKind::Warning,
            "Reply drifted from the configured language, prepending a localized notice",
        );
        return Ok(format!("{}\n\n{}", notice, text));
    }
    Ok(text.to_string())
}

/// System prompt with conversation history appended, when there is any.
pub(crate) fn with_history(system: &str, history: Option<&str>) -> String {
    match history {
        Some(history) if !history.trim().is_empty() => {
            format!("{}\n\nEarlier in this conversation:\n{}", system, history)
        }
        _ => system.to_string(),
    }
}
