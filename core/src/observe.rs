//! Non-blocking diagnostics over the design brief.
//!
//! Observers see the filtered request and the brief once the Generation stage
//! starts. They can log or record metrics but never change the outcome.

use crate::state::DesignBrief;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Hook invoked with the request text and the design brief.
pub trait DesignObserver: Send + Sync {
    /// Returns a warning message when something looks off.
    fn observe(&self, request: &str, design: &DesignBrief) -> Option<String>;
}

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "onto", "your", "you",
    "are", "was", "were", "will", "should", "would", "could", "can", "please", "make",
    "create", "generate", "image", "picture", "photo", "draw", "design", "some", "very",
    "more", "have", "has", "about", "which", "what", "like", "want", "need",
];

/// Warns when the user's top keywords never appear among the brief's keywords.
#[derive(Debug, Clone)]
pub struct KeywordOverlap {
    top_k: usize,
}

impl Default for KeywordOverlap {
    fn default() -> Self {
        Self { top_k: 5 }
    }
}

impl KeywordOverlap {
    pub fn new(top_k: usize) -> Self {
        Self { top_k: top_k.max(1) }
    }
}

impl DesignObserver for KeywordOverlap {
    fn observe(&self, request: &str, design: &DesignBrief) -> Option<String> {
        let design_text = brief_text(design);
        let user_keywords = extract_keywords(request, self.top_k);
        let design_keywords = extract_keywords(&design_text, self.top_k * 4);

        debug!(
            user = ?user_keywords,
            design = ?design_keywords,
            "Keyword overlap check"
        );

        if user_keywords.len() < 2 || design_keywords.is_empty() {
            return None;
        }

        let design_set: HashSet<&str> = design_keywords.iter().map(String::as_str).collect();
        let shared = user_keywords
            .iter()
            .filter(|k| design_set.contains(k.as_str()))
            .count();

        if shared == 0 {
            let message = format!(
                "design brief may not match the request: no shared keywords among {:?}",
                user_keywords
            );
            warn!("{}", message);
            Some(message)
        } else {
            None
        }
    }
}

/// Most frequent keywords of a text: Latin words and CJK bigrams.
pub fn extract_keywords(text: &str, top_k: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut first_seen: HashMap<String, usize> = HashMap::new();
    let mut order = 0usize;

    let mut bump = |token: String| {
        first_seen.entry(token.clone()).or_insert_with(|| {
            order += 1;
            order
        });
        *counts.entry(token).or_default() += 1;
    };

    let lowered = text.to_lowercase();
    for word in lowered.split(|c: char| !c.is_ascii_alphanumeric()) {
        if word.len() >= 3 && !STOP_WORDS.contains(&word) && !word.chars().all(|c| c.is_ascii_digit()) {
            bump(word.to_string());
        }
    }

    let cjk: Vec<char> = text.chars().collect();
    for pair in cjk.windows(2) {
        if pair.iter().all(|c| is_cjk(*c)) {
            bump(pair.iter().collect());
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|(a, ca), (b, cb)| cb.cmp(ca).then_with(|| first_seen[a].cmp(&first_seen[b])));
    ranked.into_iter().take(top_k).map(|(token, _)| token).collect()
}

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fa5}').contains(&c)
}

/// Flatten every string value of the brief into one text.
fn brief_text(design: &DesignBrief) -> String {
    fn collect(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
            Value::Object(map) => map.values().for_each(|v| collect(v, out)),
            _ => {}
        }
    }

    let mut parts = Vec::new();
    design.values().for_each(|v| collect(v, &mut parts));
    parts.join("\n")
}
