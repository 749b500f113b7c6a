pub mod check;
pub mod config;
pub mod lease;
pub mod run;
pub mod tasks;

use colored::{ColoredString, Colorize};
use visionweaver_core::{GateError, Stage, TaskStatus, WeaverError};

pub(crate) fn stage_colored(stage: Stage) -> ColoredString {
    let name = stage.to_string();
    match stage {
        Stage::Complete => name.green(),
        Stage::Error => name.red(),
        _ => name.yellow(),
    }
}

pub(crate) fn status_colored(status: TaskStatus) -> ColoredString {
    let name = status.to_string();
    match status {
        TaskStatus::Completed => name.green(),
        TaskStatus::Failed => name.red(),
        TaskStatus::Processing => name.yellow(),
    }
}

/// Print a gate rejection the way a user should read it, and turn it into an error.
pub(crate) fn gate_rejection(err: GateError) -> anyhow::Error {
    match &err {
        GateError::Busy {
            holder,
            retry_after_secs,
        } => {
            println!(
                "{} another request ({}) is running, retry in {}s",
                "Busy:".yellow().bold(),
                holder.as_deref().unwrap_or("unknown"),
                retry_after_secs
            );
        }
        GateError::Rejected { reason } => {
            println!("{} {}", "Rejected:".red().bold(), reason);
        }
        GateError::Store(e) => {
            println!("{} {}", "Lease store unavailable:".red().bold(), e);
        }
    }
    err.into()
}

/// Same as [`gate_rejection`] for errors surfaced by the task service.
pub(crate) fn service_rejection(err: WeaverError) -> anyhow::Error {
    match err {
        WeaverError::Gate(gate) => gate_rejection(gate),
        other => other.into(),
    }
}
