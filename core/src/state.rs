//! Per-invocation workflow state and the event trail it carries.
//!
//! A [`WorkflowState`] is created fresh for every run, threaded through the
//! stage handlers by value, and dropped once the engine has extracted the
//! response fields.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

/// Structured design brief produced by the Design stage.
pub type DesignBrief = Map<String, Value>;

/// A node of the workflow state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Assessment,
    Design,
    Generation,
    Composition,
    Complete,
    Error,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Assessment => write!(f, "assessment"),
            Stage::Design => write!(f, "design"),
            Stage::Generation => write!(f, "generation"),
            Stage::Composition => write!(f, "composition"),
            Stage::Complete => write!(f, "complete"),
            Stage::Error => write!(f, "error"),
        }
    }
}

impl Stage {
    /// Stages a handler running in `self` may hand off to.
    pub fn successors(self) -> &'static [Stage] {
        match self {
            Stage::Assessment => &[Stage::Design, Stage::Complete, Stage::Error],
            Stage::Design => &[Stage::Generation, Stage::Error],
            Stage::Generation => &[Stage::Composition, Stage::Complete, Stage::Error],
            Stage::Composition => &[Stage::Complete, Stage::Error],
            Stage::Complete | Stage::Error => &[],
        }
    }

    /// Check if this stage allows a transition to another stage
    pub fn can_transition_to(self, target: Stage) -> bool {
        self.successors().contains(&target)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete | Stage::Error)
    }
}

/// Kind of entry in the event trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StageStart,
    ToolStart,
    ToolEnd,
    PromptCreated,
    AssessmentComplete,
    StageTransition,
    InputImagesAdded,
    Warning,
    WorkflowEnd,
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::StageStart => "stage_start",
            EventKind::ToolStart => "tool_start",
            EventKind::ToolEnd => "tool_end",
            EventKind::PromptCreated => "prompt_created",
            EventKind::AssessmentComplete => "assessment_complete",
            EventKind::StageTransition => "stage_transition",
            EventKind::InputImagesAdded => "input_images_added",
            EventKind::Warning => "warning",
            EventKind::WorkflowEnd => "workflow_end",
            EventKind::Error => "error",
        };
        f.write_str(name)
    }
}

/// One entry of the append-only event trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub elapsed_seconds: f64,
    pub message: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Where an overlay is anchored on the base image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverlayPosition {
    TopLeft,
    TopRight,
    BottomLeft,
    #[default]
    BottomRight,
    Center,
}

impl OverlayPosition {
    pub const ALL: [OverlayPosition; 5] = [
        OverlayPosition::TopLeft,
        OverlayPosition::TopRight,
        OverlayPosition::BottomLeft,
        OverlayPosition::BottomRight,
        OverlayPosition::Center,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OverlayPosition::TopLeft => "top_left",
            OverlayPosition::TopRight => "top_right",
            OverlayPosition::BottomLeft => "bottom_left",
            OverlayPosition::BottomRight => "bottom_right",
            OverlayPosition::Center => "center",
        }
    }
}

impl fmt::Display for OverlayPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverlayPosition {
    type Err = String;

    /// Accepts `top_left`, `top-left` and `top left` spellings, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        OverlayPosition::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| format!("Unknown overlay position: {}", s))
    }
}

/// Placement parameters used for a composition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub position: OverlayPosition,
    /// Overlay width as a fraction of the base image width, in (0, 1]
    pub size_ratio: f64,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            position: OverlayPosition::BottomRight,
            size_ratio: 0.2,
        }
    }
}

/// How the `url` of an image result can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlKind {
    Remote,
    Local,
}

/// Addressable image produced by generation or composition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_kind: Option<UrlKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,

    /// "WIDTHxHEIGHT" as requested from or reported by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// Set on composed images only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<Placement>,

    /// Backend-specific metadata
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ImageResult {
    pub fn is_addressable(&self) -> bool {
        self.url.is_some() || self.local_path.is_some()
    }

    /// Gives results that only have a local file a `file://` URL.
    pub fn ensure_url(&mut self) {
        if self.url.is_none() {
            if let Some(path) = &self.local_path {
                self.url = Some(format!("file://{}", path.display()));
                self.url_kind = Some(UrlKind::Local);
            }
        } else if self.url_kind.is_none() {
            self.url_kind = Some(UrlKind::Remote);
        }
    }

    /// Remote URL, if the image has one.
    pub fn remote_url(&self) -> Option<&str> {
        match self.url_kind {
            Some(UrlKind::Local) => None,
            _ => self.url.as_deref().filter(|u| !u.starts_with("file://")),
        }
    }
}

/// Scratch files registered during one run.
///
/// Clones share the same list, so a copy of the state taken before a stage
/// still sees files the stage registered before it panicked.
#[derive(Debug, Clone, Default)]
pub struct ScratchFiles(Arc<Mutex<Vec<PathBuf>>>);

impl ScratchFiles {
    pub fn register(&self, path: PathBuf) {
        self.0.lock().push(path);
    }

    /// Every registered path, leaving the list empty.
    pub fn take(&self) -> Vec<PathBuf> {
        std::mem::take(&mut *self.0.lock())
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The single mutable record threaded through all stages of one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowState {
    pub conversation_id: String,
    pub request_id: String,
    pub stage: Stage,
    pub input_text: String,
    pub input_images: Vec<PathBuf>,
    /// Earlier turns of the same conversation, rendered for the language model
    #[serde(skip)]
    pub history: Option<String>,
    pub design_result: Option<DesignBrief>,
    pub image_result: Option<ImageResult>,
    pub composed_image_result: Option<ImageResult>,
    pub events: Vec<WorkflowEvent>,
    pub output: Option<String>,
    pub error: Option<String>,
    /// Scratch files to remove once the run is over
    #[serde(skip)]
    pub temp_files: ScratchFiles,
    #[serde(skip)]
    start_time: Instant,
}

impl WorkflowState {
    pub fn new(
        request_id: impl Into<String>,
        conversation_id: impl Into<String>,
        input_text: impl Into<String>,
        input_images: Vec<PathBuf>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            request_id: request_id.into(),
            stage: Stage::Assessment,
            input_text: input_text.into(),
            input_images,
            history: None,
            design_result: None,
            image_result: None,
            composed_image_result: None,
            events: Vec::new(),
            output: None,
            error: None,
            temp_files: ScratchFiles::default(),
            start_time: Instant::now(),
        }
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// Append an event to the trail.
    pub fn record(&mut self, kind: EventKind, message: impl Into<String>) {
        self.record_with(kind, message, Map::new());
    }

    /// Append an event carrying extra fields.
    pub fn record_with(
        &mut self,
        kind: EventKind,
        message: impl Into<String>,
        extra: Map<String, Value>,
    ) {
        let elapsed = self.elapsed_seconds();
        // Instant is monotonic, but keep the trail ordered even if rounding ever disagrees.
        let elapsed_seconds = self
            .events
            .last()
            .map_or(elapsed, |last| elapsed.max(last.elapsed_seconds));

        self.events.push(WorkflowEvent {
            kind,
            timestamp: Utc::now(),
            elapsed_seconds,
            message: message.into(),
            extra,
        });
    }

    /// Terminate the run with a user-facing message and a diagnostic detail.
    pub fn fail(&mut self, output: impl Into<String>, detail: impl Into<String>) {
        let detail = detail.into();
        let mut extra = Map::new();
        extra.insert("error".to_string(), Value::String(detail.clone()));
        extra.insert("stage".to_string(), Value::String(self.stage.to_string()));
        self.record_with(EventKind::Error, detail.clone(), extra);

        self.output = Some(output.into());
        self.error = Some(detail);
        self.stage = Stage::Error;
    }
}

/// Builds the `extra` map of an event.
#[macro_export]
macro_rules! event_fields {
    ($($key:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut map = serde_json::Map::new();
        $( map.insert($key.to_string(), serde_json::json!($value)); )*
        map
    }};
}

/// Shortens long text for event payloads.
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let head: String = text.chars().take(max_chars).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}
