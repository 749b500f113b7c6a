use super::{service_rejection, status_colored};
use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;
use visionweaver_core::{
    Attachment, Backend, SqliteTaskStore, TaskResult, TaskService, TaskStatus, TaskStore,
    WeaverConfig,
};

pub async fn submit(config: &WeaverConfig, prompt: &str, images: &[PathBuf]) -> Result<()> {
    let mut attachments = Vec::with_capacity(images.len());
    for path in images {
        let attachment = Attachment::from_path(path)
            .await
            .with_context(|| format!("Failed to read attachment {}", path.display()))?;
        attachments.push(attachment);
    }

    let service = TaskService::from_config(config).await?;
    let (receipt, handle) = service
        .submit(prompt, attachments)
        .await
        .map_err(service_rejection)?;

    println!(
        "{} request {} (about {}s)",
        "Accepted".green().bold(),
        receipt.request_id.cyan(),
        receipt.estimated_time_secs
    );

    // The run lives in this process, so wait for it before exiting.
    handle.await.context("Background run did not finish")?;

    let result = service.result(&receipt.request_id).await?;
    print_result(&result);
    if result.status == TaskStatus::Failed {
        anyhow::bail!("request {} failed", result.request_id);
    }
    Ok(())
}

pub async fn status(config: &WeaverConfig, request_id: &str, json: bool) -> Result<()> {
    let store = open_store(config).await?;
    let Some(status) = store.get_status(request_id).await? else {
        anyhow::bail!("No task found for {}", request_id);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!(
        "{} {}  {} ({}%)",
        "Request".bold(),
        status.request_id.cyan(),
        status_colored(status.status),
        status.progress
    );
    println!("  {}", status.message);
    println!(
        "  {}",
        format!("updated {}", status.updated_at.format("%Y-%m-%d %H:%M:%S UTC")).dimmed()
    );
    Ok(())
}

pub async fn result(config: &WeaverConfig, request_id: &str, json: bool) -> Result<()> {
    let store = open_store(config).await?;
    let result = match store.get_result(request_id).await? {
        Some(result) => result,
        None => match store.get_status(request_id).await? {
            Some(status) => {
                println!(
                    "{} still {} ({}%)",
                    request_id.cyan(),
                    status_colored(status.status),
                    status.progress
                );
                return Ok(());
            }
            None => anyhow::bail!("No task found for {}", request_id),
        },
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(())
}

/// Task records are only readable across processes from the SQLite store.
async fn open_store(config: &WeaverConfig) -> Result<SqliteTaskStore> {
    if config.tasks.backend != Backend::Sqlite {
        anyhow::bail!(
            "Task records are kept in memory by this configuration; set tasks.backend = \"sqlite\" to query them"
        );
    }
    Ok(SqliteTaskStore::open(config.tasks.db_path.clone()).await?)
}

fn print_result(result: &TaskResult) {
    println!(
        "\n{} {}  {}",
        "Request".bold(),
        result.request_id.cyan(),
        status_colored(result.status)
    );
    println!("{}", "─".repeat(60).dimmed());
    println!("{}", result.output);

    for url in &result.images {
        println!("  {}", url.cyan());
    }
    if let Some(error) = &result.error {
        println!("{} {}", "Error:".red().bold(), error);
    }
}
