//! Conversation checkpoints.
//!
//! Each finished run appends a checkpoint under its conversation id. Later runs
//! in the same conversation read the rendered history as extra context for the
//! language model; they never share a `WorkflowState`.

use crate::state::{preview, Stage};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Summary of one finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub request_id: String,
    pub input: String,
    pub output: String,
    pub stage: Stage,
    pub at: DateTime<Utc>,
}

/// Per-conversation checkpoint store.
pub trait ConversationMemory: Send + Sync {
    /// Append a checkpoint to a conversation.
    fn append(&self, conversation_id: &str, checkpoint: Checkpoint);

    /// Most recent checkpoints, oldest first.
    fn recent(&self, conversation_id: &str, limit: usize) -> Vec<Checkpoint>;

    /// Forget a conversation. Returns true if it existed.
    fn clear(&self, conversation_id: &str) -> bool;

    /// Number of conversations currently held.
    fn conversation_count(&self) -> usize;
}

pub const DEFAULT_MAX_TURNS: usize = 20;
pub const DEFAULT_MAX_CONVERSATIONS: usize = 1000;

/// Checkpoints kept in process memory.
///
/// Bounded twice: turns per conversation, and the number of conversations.
/// Past the second bound the conversation with the oldest last turn is dropped.
#[derive(Debug)]
pub struct InMemoryConversationMemory {
    conversations: DashMap<String, Vec<Checkpoint>>,
    max_turns: usize,
    max_conversations: usize,
}

impl Default for InMemoryConversationMemory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_TURNS, DEFAULT_MAX_CONVERSATIONS)
    }
}

impl InMemoryConversationMemory {
    /// Keep at most `max_turns` checkpoints per conversation.
    pub fn new(max_turns: usize) -> Self {
        Self::with_capacity(max_turns, DEFAULT_MAX_CONVERSATIONS)
    }

    pub fn with_capacity(max_turns: usize, max_conversations: usize) -> Self {
        Self {
            conversations: DashMap::new(),
            max_turns: max_turns.max(1),
            max_conversations: max_conversations.max(1),
        }
    }

    fn evict_stale(&self, keep: &str) {
        while self.conversations.len() > self.max_conversations {
            let oldest = self
                .conversations
                .iter()
                .filter(|entry| entry.key() != keep)
                .min_by_key(|entry| entry.value().last().map(|c| c.at))
                .map(|entry| entry.key().clone());

            match oldest {
                Some(id) => {
                    debug!(conversation_id = %id, "Evicting conversation history");
                    self.conversations.remove(&id);
                }
                None => break,
            }
        }
    }
}

impl ConversationMemory for InMemoryConversationMemory {
    fn append(&self, conversation_id: &str, checkpoint: Checkpoint) {
        let mut turns = self
            .conversations
            .entry(conversation_id.to_string())
            .or_default();
        turns.push(checkpoint);
        if turns.len() > self.max_turns {
            let excess = turns.len() - self.max_turns;
            turns.drain(..excess);
        }
        drop(turns);

        self.evict_stale(conversation_id);
    }

    fn recent(&self, conversation_id: &str, limit: usize) -> Vec<Checkpoint> {
        self.conversations
            .get(conversation_id)
            .map(|turns| {
                let skip = turns.len().saturating_sub(limit);
                turns.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    fn clear(&self, conversation_id: &str) -> bool {
        self.conversations.remove(conversation_id).is_some()
    }

    fn conversation_count(&self) -> usize {
        self.conversations.len()
    }
}

/// Render checkpoints as plain-text dialogue for a prompt.
pub fn render_history(checkpoints: &[Checkpoint]) -> Option<String> {
    if checkpoints.is_empty() {
        return None;
    }

    let lines: Vec<String> = checkpoints
        .iter()
        .map(|c| format!("User: {}\nAssistant: {}", c.input, preview(&c.output, 300)))
        .collect();
    Some(lines.join("\n\n"))
}
