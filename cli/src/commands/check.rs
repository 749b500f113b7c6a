use anyhow::Result;
use colored::Colorize;
use visionweaver_core::{GateError, SafetyGate, WeaverConfig};

pub fn execute(config: &WeaverConfig, prompt: &str) -> Result<()> {
    let gate = SafetyGate::from_config(&config.safety)?;
    if !gate.is_enabled() {
        println!("{}", "Content filter is disabled".yellow());
    }

    match gate.check(prompt) {
        Ok(()) => {
            println!("{} prompt is allowed", "✓".green().bold());
            Ok(())
        }
        Err(GateError::Rejected { reason }) => {
            println!("{} {}", "✗".red().bold(), reason);
            anyhow::bail!("prompt rejected")
        }
        Err(e) => Err(e.into()),
    }
}
