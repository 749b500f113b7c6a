//! Scripted collaborators shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use visionweaver_core::prompts::PromptSet;
use visionweaver_core::{
    CollaboratorError, CollaboratorResult, Collaborators, Compositor, DesignAnalyzer,
    DesignBrief, ImageFetcher, ImageGenerator, ImageResult, LanguageModel, Locale,
    OverlayPosition, Placement, UrlKind, WeaverConfig, WorkflowEngine,
};

/// Prompts with a marker per call site so the scripted model can tell them apart.
pub fn marked_prompts() -> PromptSet {
    PromptSet {
        assessment: "[assessment] {{language_rule}}".to_string(),
        designer: "[designer]".to_string(),
        prompt_builder: "[prompt_builder]".to_string(),
        generation_summary: "[generation_summary] {{language_rule}}".to_string(),
        composition: "[composition]".to_string(),
        final_summary: "[final_summary] {{language_rule}}".to_string(),
    }
}

/// Language model answering by prompt marker.
pub struct ScriptedLlm {
    replies: Vec<(&'static str, Result<String, String>)>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            replies: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(mut self, marker: &'static str, text: &str) -> Self {
        self.replies.push((marker, Ok(text.to_string())));
        self
    }

    pub fn fail(mut self, marker: &'static str, error: &str) -> Self {
        self.replies.push((marker, Err(error.to_string())));
        self
    }

    /// Defaults for an image request that ends in composition.
    pub fn image_flow() -> Self {
        Self::new()
            .reply(
                "[assessment]",
                r#"{"requiresImage": true, "explanation": "the user wants a picture"}"#,
            )
            .reply("[prompt_builder]", "A cute cartoon cat, soft pastel colors")
            .reply("[generation_summary]", "Here is your cartoon cat.")
            .reply("[composition]", "Position: top_left\nSize: 25%")
            .reply("[final_summary]", "Your cat now carries the logo.")
    }

    /// Calls made so far as (system, user) pairs.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, marker: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(system, _)| system.contains(marker))
            .count()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn ask(&self, system: &str, user: &str) -> CollaboratorResult<String> {
        self.calls.lock().push((system.to_string(), user.to_string()));
        match self.replies.iter().find(|(marker, _)| system.contains(marker)) {
            Some((_, Ok(text))) => Ok(text.clone()),
            Some((_, Err(error))) => Err(CollaboratorError::ApiError(error.clone())),
            None => Err(CollaboratorError::ApiError(format!(
                "no scripted reply for prompt {:?}",
                system
            ))),
        }
    }
}

/// Design analyzer returning a fixed brief.
pub struct StaticDesigner {
    brief: Map<String, Value>,
    pub calls: AtomicUsize,
}

impl StaticDesigner {
    pub fn new(brief: Value) -> Self {
        let brief = match brief {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            brief,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn cat() -> Self {
        Self::new(json!({
            "design_direction": "playful cartoon cat",
            "analysis": "a cute cartoon cat illustration",
            "style": "cartoon"
        }))
    }
}

#[async_trait]
impl DesignAnalyzer for StaticDesigner {
    async fn analyze(&self, _demand: &str) -> CollaboratorResult<DesignBrief> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.brief.clone())
    }
}

/// Generator writing a small file into a directory.
pub struct FileGenerator {
    dir: PathBuf,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl FileGenerator {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ImageGenerator for FileGenerator {
    async fn generate(&self, _prompt: &str, size: &str) -> CollaboratorResult<ImageResult> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let path = self.dir.join(format!("generated_{}.png", n));
        tokio::fs::write(&path, vec![0u8; 256]).await?;
        Ok(ImageResult {
            url: Some(format!("https://cdn.example.com/generated_{}.png", n)),
            url_kind: Some(UrlKind::Remote),
            local_path: Some(path),
            size: Some(size.to_string()),
            ..Default::default()
        })
    }
}

/// Compositor that records its arguments and writes an output file.
pub struct RecordingCompositor {
    dir: PathBuf,
    pub last: Mutex<Option<(PathBuf, PathBuf, OverlayPosition, f64)>>,
}

impl RecordingCompositor {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Compositor for RecordingCompositor {
    async fn compose(
        &self,
        base: &Path,
        overlay: &Path,
        position: OverlayPosition,
        size_ratio: f64,
    ) -> CollaboratorResult<ImageResult> {
        *self.last.lock() = Some((base.to_path_buf(), overlay.to_path_buf(), position, size_ratio));
        let path = self.dir.join("composed.png");
        tokio::fs::write(&path, vec![1u8; 256]).await?;
        Ok(ImageResult {
            local_path: Some(path),
            placement: Some(Placement {
                position,
                size_ratio,
            }),
            ..Default::default()
        })
    }
}

/// Fetcher writing a placeholder file at the destination.
#[derive(Default)]
pub struct StubFetcher {
    pub calls: AtomicUsize,
}

#[async_trait]
impl ImageFetcher for StubFetcher {
    async fn fetch(&self, _url: &str, destination: &Path) -> CollaboratorResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(destination, vec![2u8; 256]).await?;
        Ok(())
    }
}

/// English-locale configuration rooted in a scratch directory.
pub fn test_config(dir: &Path) -> WeaverConfig {
    let mut config = WeaverConfig::default();
    config.engine.locale = Locale::En;
    config.engine.temp_dir = dir.join("tmp");
    config.tasks.upload_dir = dir.join("uploads");
    config
}

pub struct Harness {
    pub llm: Arc<ScriptedLlm>,
    pub designer: Arc<dyn DesignAnalyzer>,
    pub generator: Arc<FileGenerator>,
    pub compositor: Arc<RecordingCompositor>,
    pub fetcher: Arc<StubFetcher>,
}

impl Harness {
    pub fn new(dir: &Path, llm: ScriptedLlm) -> Self {
        Self {
            llm: Arc::new(llm),
            designer: Arc::new(StaticDesigner::cat()),
            generator: Arc::new(FileGenerator::new(dir)),
            compositor: Arc::new(RecordingCompositor::new(dir)),
            fetcher: Arc::new(StubFetcher::default()),
        }
    }

    pub fn with_designer(mut self, designer: impl DesignAnalyzer + 'static) -> Self {
        self.designer = Arc::new(designer);
        self
    }

    pub fn with_generator(mut self, generator: FileGenerator) -> Self {
        self.generator = Arc::new(generator);
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            llm: self.llm.clone(),
            designer: self.designer.clone(),
            generator: self.generator.clone(),
            compositor: self.compositor.clone(),
            fetcher: self.fetcher.clone(),
        }
    }

    pub fn engine(&self, config: &WeaverConfig) -> WorkflowEngine {
        WorkflowEngine::new(self.collaborators(), config)
            .expect("engine")
            .with_prompts(marked_prompts())
    }
}

/// Write an overlay image and return its path.
pub fn overlay_file(dir: &Path) -> PathBuf {
    let path = dir.join("logo.png");
    std::fs::write(&path, vec![3u8; 256]).expect("write overlay");
    path
}
