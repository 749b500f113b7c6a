/// System prompts for every language-model call the workflow makes.
///
/// Each template ships embedded in the binary; a file with the same name in
/// the configured prompts directory replaces it.
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use tracing::{debug, warn};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{[^}]+\}\}").unwrap());

/// Template file names paired with their embedded defaults.
pub const DEFAULT_PROMPTS: [(&str, &str); 6] = [
    ("assessment.md", include_str!("../prompts/assessment.md")),
    ("designer.md", include_str!("../prompts/designer.md")),
    ("prompt_builder.md", include_str!("../prompts/prompt_builder.md")),
    ("generation_summary.md", include_str!("../prompts/generation_summary.md")),
    ("composition.md", include_str!("../prompts/composition.md")),
    ("final_summary.md", include_str!("../prompts/final_summary.md")),
];

/// Loaded prompt templates.
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub assessment: String,
    pub designer: String,
    pub prompt_builder: String,
    pub generation_summary: String,
    pub composition: String,
    pub final_summary: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self::load(None)
    }
}

impl PromptSet {
    /// Load templates, preferring files in `dir` over the embedded copies.
    pub fn load(dir: Option<&Path>) -> Self {
        let read = |name: &str| -> String {
            let embedded = DEFAULT_PROMPTS
                .iter()
                .find(|(file, _)| *file == name)
                .map(|(_, body)| *body)
                .unwrap_or_default();

            let Some(dir) = dir else {
                return embedded.to_string();
            };

            let path = dir.join(name);
            if !path.exists() {
                return embedded.to_string();
            }

            match std::fs::read_to_string(&path) {
                Ok(body) => {
                    debug!("Loaded prompt override {:?}", path);
                    body
                }
                Err(e) => {
                    warn!("Failed to read prompt {:?}, using built-in: {}", path, e);
                    embedded.to_string()
                }
            }
        };

        Self {
            assessment: read("assessment.md"),
            designer: read("designer.md"),
            prompt_builder: read("prompt_builder.md"),
            generation_summary: read("generation_summary.md"),
            composition: read("composition.md"),
            final_summary: read("final_summary.md"),
        }
    }
}

/// Substitute `{{key}}` placeholders and drop any that remain unset.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut output = template.to_string();
    for (key, value) in vars {
        output = output.replace(&format!("{{{{{}}}}}", key), value);
    }
    PLACEHOLDER.replace_all(&output, "").trim().to_string()
}
