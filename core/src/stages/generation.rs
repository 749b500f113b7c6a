//! Prompt synthesis, image generation and the user-facing summary.

use super::{call_tool, draft_reply, settle, with_history, StageContext, StageFailure};
use crate::event_fields;
use crate::prompts::render;
use crate::reply_parser::strip_overlay_instructions;
use crate::state::{preview, DesignBrief, EventKind, ImageResult, Stage, WorkflowState};
use tracing::{debug, info, warn};

pub async fn run(ctx: &StageContext<'_>, mut state: WorkflowState) -> WorkflowState {
    state.record_with(
        EventKind::StageStart,
        "Generating the image",
        event_fields! { "stage" => Stage::Generation },
    );
    let result = generate(ctx, &mut state).await;
    settle(state, result)
}

async fn generate(ctx: &StageContext<'_>, state: &mut WorkflowState) -> Result<(), StageFailure> {
    let design = state.design_result.clone().ok_or_else(|| {
        StageFailure::new(ctx.messages.missing_design(), "design_result is missing")
    })?;

    let request = strip_overlay_instructions(&state.input_text);
    if request != state.input_text {
        debug!(filtered = %request, "Removed overlay instructions from the request");
    }

    if ctx.engine.relevance_check {
        if let Some(observer) = ctx.observer {
            if let Some(warning) = observer.observe(&request, &design) {
                state.record_with(
                    EventKind::Warning,
                    warning,
                    event_fields! { "check" => "design_relevance" },
                );
            }
        }
    }

    let prompt = build_prompt(ctx, state, &request, &design).await?;

    let mut image = call_tool(
        state,
        "image_generator",
        "Generating the image",
        ctx.collaborators.generator.generate(&prompt, ctx.image_size),
    )
    .await
    .map_err(|e| {
        StageFailure::from_collaborator(
            &e,
            |detail| ctx.messages.generation_rejected(detail),
            || ctx.messages.generation_failed(),
        )
    })?;

    if !image.is_addressable() {
        return Err(StageFailure::new(
            ctx.messages.generation_failed(),
            "image generator returned neither a url nor a local path",
        ));
    }
    image.ensure_url();
    info!(url = ?image.url, "Image generated");
    state.image_result = Some(image.clone());

    let output = summarize(ctx, state, &request, &prompt, &image).await?;
    state.output = Some(output);

    if state.input_images.is_empty() {
        state.record(EventKind::WorkflowEnd, "Image generated");
        state.stage = Stage::Complete;
    } else {
        let overlay_count = state.input_images.len();
        state.record_with(
            EventKind::StageTransition,
            "Image generated, moving on to composition",
            event_fields! {
                "from" => Stage::Generation,
                "to" => Stage::Composition,
                "overlay_count" => overlay_count,
            },
        );
        state.stage = Stage::Composition;
    }
    Ok(())
}

async fn build_prompt(
    ctx: &StageContext<'_>,
    state: &mut WorkflowState,
    request: &str,
    design: &DesignBrief,
) -> Result<String, StageFailure> {
    let brief = serde_json::to_string_pretty(design).unwrap_or_default();
    let input = format!("User request:\n{}\n\nDesign brief:\n{}", request, brief);

    let reply = call_tool(
        state,
        "language_model",
        "Writing the generation prompt",
        ctx.collaborators.llm.ask(&ctx.prompts.prompt_builder, &input),
    )
    .await
    .map_err(|e| StageFailure::new(ctx.messages.generation_failed(), e.to_string()))?;

    let prompt = match reply.trim() {
        "" => {
            warn!("Prompt builder returned nothing, using the request itself");
            request.trim().to_string()
        }
        text => text.to_string(),
    };

    state.record_with(
        EventKind::PromptCreated,
        "Generation prompt ready",
        event_fields! { "prompt" => preview(&prompt, 200) },
    );
    Ok(prompt)
}

async fn summarize(
    ctx: &StageContext<'_>,
    state: &mut WorkflowState,
    request: &str,
    prompt: &str,
    image: &ImageResult,
) -> Result<String, StageFailure> {
    let system = with_history(
        &render(
            &ctx.prompts.generation_summary,
            &[("language_rule", ctx.messages.language_rule())],
        ),
        state.history.as_deref(),
    );
    let input = format!(
        "User request:\n{}\n\nGeneration prompt:\n{}\n\nImage URL: {}\nLocal path: {}",
        request,
        prompt,
        image.url.as_deref().unwrap_or("-"),
        image
            .local_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string()),
    );

    let notice = ctx.messages.image_ready_notice(image);
    draft_reply(ctx, state, &system, &input, "Writing the reply", notice)
        .await
        .map_err(|e| StageFailure::new(ctx.messages.generation_failed(), e.to_string()))
}
