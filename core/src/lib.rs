// VisionWeaver: staged image-request workflow orchestration
// Core library providing the workflow engine, gates, collaborators and task service

pub mod collaborators;
pub mod config;
pub mod engine;
pub mod errors;
pub mod gate;
pub mod lease;
pub mod lease_manager;
pub mod memory;
pub mod messages;
pub mod observe;
pub mod pipeline;
pub mod prompts;
pub mod providers;
pub mod reply_parser;
pub mod router;
pub mod safety;
pub mod stages;
pub mod state;
pub mod tasks;

// Re-export commonly used types
pub use errors::{
    CollaboratorError, CollaboratorResult, GateError, GateResult, StoreError, StoreResult,
    WeaverError, WeaverResult,
};

pub use config::{
    Backend, ConfigManager, EngineConfig, GateConfig, Locale, LoggingConfig, SafetyConfig,
    TasksConfig, WeaverConfig,
};

pub use state::{
    DesignBrief, EventKind, ImageResult, OverlayPosition, Placement, ScratchFiles, Stage, UrlKind,
    WorkflowEvent, WorkflowState,
};

pub use collaborators::{
    Collaborators, Compositor, DesignAnalyzer, ImageFetcher, ImageGenerator, LanguageModel,
    ObjectStorage,
};

pub use providers::{
    build_collaborators, CommandCompositor, HttpImageFetcher, HttpImageGenerator,
    LlmDesignAnalyzer, LocalObjectStorage, OpenAiChatModel,
};

pub use engine::{new_request_id, WorkflowEngine, WorkflowResponse};

pub use router::{is_valid_handoff, route, Route};

pub use lease::{Lease, LeaseStore, MemoryLeaseStore};

pub use lease_manager::SqliteLeaseStore;

pub use gate::{Backoff, ExecutionGate, Permit};

pub use safety::{ContentFilter, KeywordFilter, SafetyGate, Verdict};

pub use pipeline::Pipeline;

pub use tasks::{
    Attachment, MemoryTaskStore, SqliteTaskStore, SubmitReceipt, TaskResult, TaskService,
    TaskStatus, TaskStatusRecord, TaskStore,
};

pub use memory::{Checkpoint, ConversationMemory, InMemoryConversationMemory};

pub use observe::{DesignObserver, KeywordOverlap};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
