use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use visionweaver_core::{Backend, ExecutionGate, WeaverConfig};

#[derive(Subcommand)]
pub enum LeaseCommands {
    /// Show who holds the execution lease
    Show,

    /// Delete the execution lease regardless of its holder
    Release,
}

pub async fn execute(config: &WeaverConfig, cmd: &LeaseCommands) -> Result<()> {
    if config.gate.backend != Backend::Sqlite {
        println!(
            "{}",
            "The lease lives in process memory with gate.backend = \"memory\"; nothing to inspect"
                .yellow()
        );
        return Ok(());
    }

    let gate = ExecutionGate::from_config(&config.gate).await?;
    match cmd {
        LeaseCommands::Show => match gate.current().await? {
            Some(lease) => {
                println!("{} {}", "Key:".bold(), lease.key);
                println!("{} {}", "Holder:".bold(), lease.holder.cyan());
                println!(
                    "{} {}",
                    "Acquired:".bold(),
                    lease.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
                println!(
                    "{} {}s",
                    "Expires in:".bold(),
                    lease.retry_after_secs()
                );
            }
            None => println!("{}", "Lease is free".green()),
        },
        LeaseCommands::Release => {
            if gate.force_release().await? {
                println!("{}", "Lease released".green());
            } else {
                println!("{}", "Lease was not held".yellow());
            }
        }
    }
    Ok(())
}
