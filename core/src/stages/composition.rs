//! Overlay compositing onto the generated image.

use super::{call_tool, draft_reply, settle, with_history, StageContext, StageFailure};
use crate::event_fields;
use crate::prompts::render;
use crate::reply_parser::parse_placement;
use crate::state::{EventKind, ImageResult, Placement, Stage, WorkflowState};
use std::path::{Path, PathBuf};
use tracing::info;

pub async fn run(ctx: &StageContext<'_>, mut state: WorkflowState) -> WorkflowState {
    state.record_with(
        EventKind::StageStart,
        "Compositing the overlay",
        event_fields! { "stage" => Stage::Composition },
    );
    let result = compose(ctx, &mut state).await;
    settle(state, result)
}

async fn compose(ctx: &StageContext<'_>, state: &mut WorkflowState) -> Result<(), StageFailure> {
    let overlay = state.input_images.first().cloned().ok_or_else(|| {
        StageFailure::new(ctx.messages.missing_overlay(), "no overlay images supplied")
    })?;
    let generated = state.image_result.clone().ok_or_else(|| {
        StageFailure::new(ctx.messages.missing_generated_image(), "image_result is missing")
    })?;

    let base = resolve_base(ctx, state, &generated).await?;
    let placement = choose_placement(ctx, state, &base).await?;
    info!(
        position = %placement.position,
        size_ratio = placement.size_ratio,
        "Placement chosen"
    );

    let mut composed = call_tool(
        state,
        "compositor",
        &format!(
            "Placing the overlay at {} ({:.0}%)",
            placement.position,
            placement.size_ratio * 100.0
        ),
        ctx.collaborators.compositor.compose(
            &base,
            &overlay,
            placement.position,
            placement.size_ratio,
        ),
    )
    .await
    .map_err(|e| {
        StageFailure::from_collaborator(
            &e,
            |detail| ctx.messages.composition_rejected(detail),
            || ctx.messages.composition_failed(),
        )
    })?;

    if !composed.is_addressable() {
        return Err(StageFailure::new(
            ctx.messages.composition_failed(),
            "compositor returned neither a url nor a local path",
        ));
    }
    composed.ensure_url();
    composed.placement.get_or_insert(placement);
    state.composed_image_result = Some(composed.clone());

    let output = summarize(ctx, state, &generated, &composed).await?;
    state.output = Some(output);
    state.record(EventKind::WorkflowEnd, "Composition complete");
    state.stage = Stage::Complete;
    Ok(())
}

/// Local file of the generated image, downloading it when only a URL exists.
async fn resolve_base(
    ctx: &StageContext<'_>,
    state: &mut WorkflowState,
    generated: &ImageResult,
) -> Result<PathBuf, StageFailure> {
    if let Some(path) = generated.local_path.as_ref().filter(|p| p.exists()) {
        return Ok(path.clone());
    }

    let url = generated.remote_url().map(str::to_string).ok_or_else(|| {
        StageFailure::new(
            ctx.messages.missing_generated_image(),
            "generated image has neither a local file nor a remote url",
        )
    })?;

    let destination = ctx
        .engine
        .temp_dir
        .join(format!("{}_base{}", state.request_id, url_extension(&url)));
    state.temp_files.register(destination.clone());

    call_tool(
        state,
        "image_fetcher",
        "Downloading the generated image",
        ctx.collaborators.fetcher.fetch(&url, &destination),
    )
    .await
    .map_err(|e| StageFailure::new(ctx.messages.download_failed(), e.to_string()))?;

    Ok(destination)
}

/// Extension of the url's last path segment, ".png" when it has none.
fn url_extension(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            Path::new(parsed.path())
                .extension()
                .and_then(|ext| ext.to_str())
                .filter(|ext| !ext.is_empty() && ext.len() <= 5)
                .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        })
        .unwrap_or_else(|| ".png".to_string())
}

/// Ask the model for a placement. Unreadable replies fall back to the default placement.
async fn choose_placement(
    ctx: &StageContext<'_>,
    state: &mut WorkflowState,
    base: &Path,
) -> Result<Placement, StageFailure> {
    let overlays: Vec<String> = state
        .input_images
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    let input = format!(
        "User request:\n{}\n\nGenerated image: {}\nOverlay images: {}",
        state.input_text,
        base.display(),
        overlays.join(", ")
    );

    let reply = call_tool(
        state,
        "language_model",
        "Choosing the overlay placement",
        ctx.collaborators.llm.ask(&ctx.prompts.composition, &input),
    )
    .await
    .map_err(|e| StageFailure::new(ctx.messages.composition_failed(), e.to_string()))?;

    Ok(parse_placement(&reply))
}

async fn summarize(
    ctx: &StageContext<'_>,
    state: &mut WorkflowState,
    generated: &ImageResult,
    composed: &ImageResult,
) -> Result<String, StageFailure> {
    let system = with_history(
        &render(
            &ctx.prompts.final_summary,
            &[("language_rule", ctx.messages.language_rule())],
        ),
        state.history.as_deref(),
    );
    let direction = state
        .design_result
        .as_ref()
        .and_then(|d| d.get("design_direction"))
        .and_then(|v| v.as_str())
        .unwrap_or("-")
        .to_string();
    let input = format!(
        "User request:\n{}\n\nDesign direction: {}\nGenerated image: {}\nComposed image: {}",
        state.input_text,
        direction,
        generated.url.as_deref().unwrap_or("-"),
        composed.url.as_deref().unwrap_or("-"),
    );

    let notice = ctx.messages.image_ready_notice(composed);
    draft_reply(ctx, state, &system, &input, "Writing the final reply", notice)
        .await
        .map_err(|e| StageFailure::new(ctx.messages.composition_failed(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_extension() {
        assert_eq!(url_extension("https://cdn.example.com/a/b/cat.JPG?sig=1"), ".jpg");
        assert_eq!(url_extension("https://cdn.example.com/a/b/cat.webp"), ".webp");
        assert_eq!(url_extension("https://cdn.example.com/render"), ".png");
        assert_eq!(url_extension("not a url"), ".png");
    }
}
