use super::{gate_rejection, stage_colored};
use anyhow::Result;
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;
use visionweaver_core::{Pipeline, WeaverConfig, WorkflowResponse};

pub struct RunOptions<'a> {
    pub conversation: Option<&'a str>,
    pub wait: bool,
    pub json: bool,
    pub events: bool,
}

pub async fn execute(
    config: &WeaverConfig,
    prompt: &str,
    images: Vec<PathBuf>,
    options: RunOptions<'_>,
) -> Result<()> {
    let pipeline = Pipeline::from_config(config).await?;
    info!(wait = options.wait, images = images.len(), "Running request");

    let outcome = if options.wait {
        pipeline
            .run_with_backoff(prompt, options.conversation, images)
            .await
    } else {
        pipeline.run(prompt, options.conversation, images).await
    };
    let response = outcome.map_err(gate_rejection)?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_response(&response, options.events);
    }

    if !response.is_success() {
        anyhow::bail!(
            "request {} ended in error: {}",
            response.request_id,
            response.error.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}

fn print_response(response: &WorkflowResponse, show_events: bool) {
    println!(
        "\n{} {}  {} {}",
        "Request".bold(),
        response.request_id.cyan(),
        "stage".bold(),
        stage_colored(response.stage)
    );
    println!("{}", "─".repeat(60).dimmed());
    println!("{}", response.output);

    let urls = response.image_urls();
    if !urls.is_empty() {
        println!("\n{}", "Images".bold());
        for url in urls {
            println!("  {}", url.cyan());
        }
    }

    if let Some(error) = &response.error {
        println!("\n{} {}", "Error:".red().bold(), error);
    }

    if show_events {
        println!("\n{}", "Events".bold());
        for event in &response.events {
            println!(
                "  {:>7.2}s  {:<20} {}",
                event.elapsed_seconds,
                event.kind.to_string().dimmed(),
                event.message
            );
        }
    }
}
