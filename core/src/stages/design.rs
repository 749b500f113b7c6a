//! Design brief drafting.

use super::{call_tool, settle, StageContext, StageFailure};
use crate::event_fields;
use crate::state::{EventKind, Stage, WorkflowState};
use serde_json::Value;
use tracing::info;

pub async fn run(ctx: &StageContext<'_>, mut state: WorkflowState) -> WorkflowState {
    state.record_with(
        EventKind::StageStart,
        "Designing the image",
        event_fields! { "stage" => Stage::Design },
    );
    let result = design(ctx, &mut state).await;
    settle(state, result)
}

async fn design(ctx: &StageContext<'_>, state: &mut WorkflowState) -> Result<(), StageFailure> {
    let demand = state.input_text.clone();
    let brief = call_tool(
        state,
        "design_analyzer",
        "Drafting the design brief",
        ctx.collaborators.designer.analyze(&demand),
    )
    .await
    .map_err(|e| {
        StageFailure::from_collaborator(
            &e,
            |detail| ctx.messages.design_rejected(detail),
            || ctx.messages.design_failed(),
        )
    })?;

    // Analyzers that speak the map protocol signal failure with an "error" field.
    if let Some(error) = brief.get("error").filter(|v| !v.is_null()) {
        let detail = match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Err(StageFailure::new(ctx.messages.design_rejected(&detail), detail));
    }

    info!(fields = brief.len(), "Design brief ready");
    state.design_result = Some(brief);
    state.record_with(
        EventKind::StageTransition,
        "Design brief ready, moving on to generation",
        event_fields! { "from" => Stage::Design, "to" => Stage::Generation },
    );
    state.stage = Stage::Generation;
    Ok(())
}
