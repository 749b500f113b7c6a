/// Narrow interfaces to the external systems the workflow depends on.
///
/// The engine only ever talks to these traits; concrete adapters live in
/// `providers` and test doubles implement them directly.
use crate::errors::CollaboratorResult;
use crate::state::{DesignBrief, ImageResult, OverlayPosition};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Text-in, text-out chat model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Get the model name
    fn name(&self) -> &str;

    /// Ask a single question with a system instruction.
    async fn ask(&self, system: &str, user: &str) -> CollaboratorResult<String>;

    /// Ask with an explicit sampling temperature.
    ///
    /// Backends without temperature control ignore the hint.
    async fn ask_with_temperature(
        &self,
        system: &str,
        user: &str,
        temperature: f32,
    ) -> CollaboratorResult<String> {
        let _ = temperature;
        self.ask(system, user).await
    }
}

/// Turns a raw demand into a structured design brief.
#[async_trait]
pub trait DesignAnalyzer: Send + Sync {
    async fn analyze(&self, demand: &str) -> CollaboratorResult<DesignBrief>;
}

/// Produces an image from a prompt.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// `size` is "WIDTHxHEIGHT".
    async fn generate(&self, prompt: &str, size: &str) -> CollaboratorResult<ImageResult>;
}

/// Places an overlay image onto a base image.
#[async_trait]
pub trait Compositor: Send + Sync {
    async fn compose(
        &self,
        base: &Path,
        overlay: &Path,
        position: OverlayPosition,
        size_ratio: f64,
    ) -> CollaboratorResult<ImageResult>;
}

/// Publishes a local file and returns its URL.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, local_path: &Path, folder_hint: &str) -> CollaboratorResult<String>;
}

/// Downloads a remote image to a local file.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, destination: &Path) -> CollaboratorResult<()>;
}

/// The set of collaborators a workflow run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub llm: Arc<dyn LanguageModel>,
    pub designer: Arc<dyn DesignAnalyzer>,
    pub generator: Arc<dyn ImageGenerator>,
    pub compositor: Arc<dyn Compositor>,
    pub fetcher: Arc<dyn ImageFetcher>,
}
