/// VisionWeaver CLI - run, submit and inspect image requests
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use visionweaver_core::{ConfigManager, WeaverConfig};

mod commands;

use commands::{check, config, lease, run, tasks};

/// Load configuration from the given path or default location, then apply env overrides
fn load_config(config_path: Option<&Path>) -> anyhow::Result<WeaverConfig> {
    let mut manager = ConfigManager::load(config_path)?;
    manager.load_from_env();
    Ok(manager.into_config())
}

/// Install the tracing subscriber; `RUST_LOG` wins over the configured level
fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[derive(Parser)]
#[command(name = "visionweaver")]
#[command(about = "Staged image-request workflow orchestrator", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (defaults to ./.visionweaver/config.toml, then ~/.visionweaver/config.toml)
    #[arg(long, global = true, env = "VISIONWEAVER_CONFIG")]
    config: Option<PathBuf>,

    /// Override log level
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one request in the foreground and print the response
    Run {
        /// What to generate, or a question
        prompt: String,

        /// Overlay image to composite onto the result (repeatable)
        #[arg(short, long = "image")]
        images: Vec<PathBuf>,

        /// Conversation id for follow-up requests
        #[arg(long)]
        conversation: Option<String>,

        /// Wait with backoff while another request holds the lease
        #[arg(short, long)]
        wait: bool,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,

        /// Show the event trail
        #[arg(short, long)]
        events: bool,
    },

    /// Submit a request through the task service and wait for its result
    Submit {
        prompt: String,

        /// Attachment to upload with the request (repeatable)
        #[arg(short, long = "image")]
        images: Vec<PathBuf>,
    },

    /// Show the status of a submitted request
    Status {
        request_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Show the result of a submitted request
    #[command(name = "result")]
    Outcome {
        request_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Run a prompt through the content filter only
    Check { prompt: String },

    /// Inspect or clear the execution lease
    #[command(subcommand)]
    Lease(lease::LeaseCommands),

    /// Print the effective configuration (API keys masked)
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&log_level, config.logging.json);

    match args.command {
        Commands::Run {
            prompt,
            images,
            conversation,
            wait,
            json,
            events,
        } => {
            let options = run::RunOptions {
                conversation: conversation.as_deref(),
                wait,
                json,
                events,
            };
            run::execute(&config, &prompt, images, options).await?;
        }

        Commands::Submit { prompt, images } => {
            tasks::submit(&config, &prompt, &images).await?;
        }

        Commands::Status { request_id, json } => {
            tasks::status(&config, &request_id, json).await?;
        }

        Commands::Outcome { request_id, json } => {
            tasks::result(&config, &request_id, json).await?;
        }

        Commands::Check { prompt } => {
            check::execute(&config, &prompt)?;
        }

        Commands::Lease(cmd) => {
            lease::execute(&config, &cmd).await?;
        }

        Commands::Config => {
            config::execute(&config)?;
        }
    }

    Ok(())
}
