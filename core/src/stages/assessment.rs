//! Intent classification: does the request need an image at all?

use super::{call_tool, settle, with_history, StageContext, StageFailure};
use crate::event_fields;
use crate::prompts::render;
use crate::reply_parser::parse_assessment;
use crate::state::{preview, EventKind, Stage, WorkflowState};
use tracing::{info, warn};

pub async fn run(ctx: &StageContext<'_>, mut state: WorkflowState) -> WorkflowState {
    state.record_with(
        EventKind::StageStart,
        "Analyzing the request",
        event_fields! { "stage" => Stage::Assessment },
    );
    let result = assess(ctx, &mut state).await;
    settle(state, result)
}

async fn assess(ctx: &StageContext<'_>, state: &mut WorkflowState) -> Result<(), StageFailure> {
    if state.input_text.trim().is_empty() {
        return Err(StageFailure::new(
            ctx.messages.assessment_failed(),
            "request text is empty",
        ));
    }

    let system = with_history(
        &render(
            &ctx.prompts.assessment,
            &[("language_rule", ctx.messages.language_rule())],
        ),
        state.history.as_deref(),
    );
    let user = state.input_text.clone();

    let reply = call_tool(
        state,
        "language_model",
        "Classifying the request",
        ctx.collaborators.llm.ask(&system, &user),
    )
    .await
    .map_err(|e| StageFailure::new(ctx.messages.assessment_failed(), e.to_string()))?;

    let assessment = parse_assessment(&reply);
    if !assessment.parsed {
        warn!("Assessment reply was not parseable, assuming an image is required");
        state.record_with(
            EventKind::Warning,
            "Assessment reply could not be parsed; assuming an image is required",
            event_fields! { "reply" => preview(&reply, 200) },
        );
    }

    info!(requires_image = assessment.requires_image, "Assessment complete");
    state.record_with(
        EventKind::AssessmentComplete,
        format!("Image required: {}", assessment.requires_image),
        event_fields! {
            "requires_image" => assessment.requires_image,
            "explanation" => assessment.explanation,
        },
    );

    if assessment.requires_image {
        state.record_with(
            EventKind::StageTransition,
            "Moving on to design",
            event_fields! { "from" => Stage::Assessment, "to" => Stage::Design },
        );
        state.stage = Stage::Design;
    } else {
        let answer = if assessment.response.trim().is_empty() {
            ctx.messages.no_image_needed()
        } else {
            assessment.response
        };
        state.output = Some(answer);
        state.record(EventKind::WorkflowEnd, "No image required, answered directly");
        state.stage = Stage::Complete;
    }

    Ok(())
}
