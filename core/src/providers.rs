/// Concrete collaborator adapters.
///
/// - `OpenAiChatModel`: OpenAI-compatible chat completions
/// - `LlmDesignAnalyzer`: design briefs drafted by a language model
/// - `HttpImageGenerator`: OpenAI-compatible image generation
/// - `CommandCompositor`: overlay compositing through ImageMagick
/// - `LocalObjectStorage`: directory-backed object store
/// - `HttpImageFetcher`: remote image download
use crate::collaborators::{
    Collaborators, Compositor, DesignAnalyzer, ImageFetcher, ImageGenerator, LanguageModel,
    ObjectStorage,
};
use crate::config::{CompositorConfig, ImageConfig, LlmConfig, StorageConfig, WeaverConfig};
use crate::prompts::PromptSet;
use crate::errors::{CollaboratorError, CollaboratorResult, WeaverError, WeaverResult};
use crate::reply_parser;
use crate::state::{preview, DesignBrief, ImageResult, OverlayPosition, Placement, UrlKind};
use async_trait::async_trait;
use base64::Engine as _;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shortest demand or prompt the adapters accept.
pub const MIN_DESCRIPTION_CHARS: usize = 5;

/// Files smaller than this are treated as corrupt downloads.
const MIN_IMAGE_BYTES: usize = 100;

static SIZE_FORMAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+x\d+$").unwrap());
static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w一-龥]").unwrap());

fn build_client(timeout_secs: u64) -> WeaverResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| WeaverError::ConfigError(format!("Failed to build HTTP client: {}", e)))
}

/// Pull `error.message` out of an OpenAI-style error body.
fn api_error_message(body: &str) -> Option<String> {
    serde_json::from_str::<Value>(body).ok().and_then(|v| {
        v.get("error")
            .and_then(|e| e.get("message").or(Some(e)))
            .and_then(Value::as_str)
            .map(str::to_string)
    })
}

// ============================================================================
// Language model
// ============================================================================

/// OpenAI-compatible chat completion backend.
pub struct OpenAiChatModel {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: usize,
}

impl OpenAiChatModel {
    /// Create a new chat model client.
    pub fn new(api_key: String, endpoint: Option<String>, model: String) -> Self {
        let endpoint = endpoint.unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            model,
            temperature: 0.7,
            max_tokens: 2048,
        }
    }

    pub fn from_config(config: &LlmConfig) -> WeaverResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| WeaverError::ConfigError("llm.api_key is not set".to_string()))?;

        let mut model = Self::new(api_key, Some(config.endpoint.clone()), config.model.clone());
        model.client = build_client(config.timeout_secs)?;
        model.temperature = config.temperature;
        model.max_tokens = config.max_tokens;
        Ok(model)
    }

    async fn chat(&self, system: &str, user: &str, temperature: f32) -> CollaboratorResult<String> {
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "max_tokens": self.max_tokens,
            "temperature": temperature,
        });

        debug!(model = %self.model, "Sending chat completion request");
        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::ApiError(format!(
                "API request failed with status {}: {}",
                status,
                api_error_message(&body).unwrap_or(body)
            )));
        }

        let body = response.json::<Value>().await?;
        body.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                CollaboratorError::InvalidResponse("missing choices[0].message.content".to_string())
            })
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn ask(&self, system: &str, user: &str) -> CollaboratorResult<String> {
        self.chat(system, user, self.temperature).await
    }

    async fn ask_with_temperature(
        &self,
        system: &str,
        user: &str,
        temperature: f32,
    ) -> CollaboratorResult<String> {
        self.chat(system, user, temperature).await
    }
}

// ============================================================================
// Design analyzer
// ============================================================================

const CREATIVE_KEYWORDS: &[&str] = &[
    "创意", "想象", "梦幻", "奇幻", "抽象", "艺术", "独特", "新颖", "超现实", "creative",
    "imaginative", "dreamy", "fantasy", "abstract", "artistic", "surreal", "whimsical",
];

const PRECISE_KEYWORDS: &[&str] = &[
    "精确", "写实", "照片级", "详细", "准确", "技术", "精细", "专业", "真实", "precise",
    "realistic", "photorealistic", "detailed", "accurate", "technical", "professional",
];

/// Sampling temperature matched to the tone of the demand.
pub fn tune_temperature(demand: &str) -> f32 {
    let lowered = demand.to_lowercase();
    let score = |words: &[&str]| words.iter().filter(|w| lowered.contains(*w)).count();
    let creative = score(CREATIVE_KEYWORDS);
    let precise = score(PRECISE_KEYWORDS);

    match creative.cmp(&precise) {
        std::cmp::Ordering::Greater => 0.8,
        std::cmp::Ordering::Less => 0.4,
        std::cmp::Ordering::Equal => 0.7,
    }
}

/// Design analyzer backed by a language model.
pub struct LlmDesignAnalyzer {
    llm: Arc<dyn LanguageModel>,
    system_prompt: String,
}

impl LlmDesignAnalyzer {
    pub fn new(llm: Arc<dyn LanguageModel>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
        }
    }

    /// Brief used when the model's reply is not valid JSON.
    fn unstructured_brief(reply: &str) -> DesignBrief {
        let summary = preview(reply.trim(), 500);
        let brief = json!({
            "analysis": {
                "subject": "unparsed",
                "visual_style": "unparsed",
                "composition": "unparsed",
                "color_scheme": "unparsed",
                "lighting": "unparsed",
            },
            "design_direction": summary,
            "proposal_one": {"title": "unformatted", "description": summary},
            "proposal_two": {"title": "unformatted", "description": "retry with a more detailed description"},
        });
        match brief {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

#[async_trait]
impl DesignAnalyzer for LlmDesignAnalyzer {
    async fn analyze(&self, demand: &str) -> CollaboratorResult<DesignBrief> {
        let demand = demand.trim();
        if demand.chars().count() < MIN_DESCRIPTION_CHARS {
            return Err(CollaboratorError::Reported(format!(
                "please describe the image in at least {} characters",
                MIN_DESCRIPTION_CHARS
            )));
        }

        let temperature = tune_temperature(demand);
        info!(temperature, "Analyzing design request");

        let reply = self
            .llm
            .ask_with_temperature(&self.system_prompt, demand, temperature)
            .await?;

        match reply_parser::extract_json_object(&reply) {
            Some(brief) => Ok(brief),
            None => {
                warn!("Design reply was not JSON, keeping it as an unstructured brief");
                Ok(Self::unstructured_brief(&reply))
            }
        }
    }
}

// ============================================================================
// Image generation
// ============================================================================

/// Storage folder derived from the first characters of a prompt.
pub fn folder_hint(prompt: &str) -> String {
    let head: String = prompt.trim().chars().take(10).collect();
    let hint = NON_WORD.replace_all(&head, "_").to_string();
    if hint.trim_matches('_').is_empty() {
        "images".to_string()
    } else {
        hint
    }
}

/// OpenAI-compatible `/images/generations` backend.
pub struct HttpImageGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    output_dir: PathBuf,
    storage: Option<Arc<dyn ObjectStorage>>,
}

impl HttpImageGenerator {
    pub fn new(
        api_key: String,
        endpoint: String,
        model: String,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            model,
            output_dir,
            storage: None,
        }
    }

    pub fn from_config(config: &ImageConfig, api_key: Option<&str>, timeout_secs: u64) -> WeaverResult<Self> {
        let api_key = api_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| WeaverError::ConfigError("image.api_key is not set".to_string()))?;

        let mut generator = Self::new(
            api_key.to_string(),
            config.endpoint.clone(),
            config.model.clone(),
            config.output_dir.clone(),
        );
        generator.client = build_client(timeout_secs)?;
        Ok(generator)
    }

    /// Upload every generated image through `storage`.
    pub fn with_storage(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    async fn save(&self, bytes: &[u8]) -> CollaboratorResult<PathBuf> {
        if bytes.len() < MIN_IMAGE_BYTES {
            return Err(CollaboratorError::Reported(format!(
                "the generated image is only {} bytes and looks corrupt",
                bytes.len()
            )));
        }

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let file_name = format!(
            "generated_{}_{}.png",
            chrono::Utc::now().format("%Y%m%d%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let path = self.output_dir.join(file_name);
        tokio::fs::write(&path, bytes).await?;
        info!("Saved generated image to {:?} ({} bytes)", path, bytes.len());
        Ok(path)
    }

    async fn download(&self, url: &str) -> CollaboratorResult<Vec<u8>> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(CollaboratorError::ApiError(format!(
                "image download failed with status {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl ImageGenerator for HttpImageGenerator {
    async fn generate(&self, prompt: &str, size: &str) -> CollaboratorResult<ImageResult> {
        let prompt = prompt.trim();
        if prompt.chars().count() < MIN_DESCRIPTION_CHARS {
            return Err(CollaboratorError::Reported(format!(
                "please describe the image in at least {} characters",
                MIN_DESCRIPTION_CHARS
            )));
        }
        if !SIZE_FORMAT.is_match(size) {
            return Err(CollaboratorError::Reported(format!(
                "invalid image size '{}', expected WIDTHxHEIGHT such as 1024x1024",
                size
            )));
        }

        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "size": size,
            "n": 1,
        });

        info!(model = %self.model, size, "Requesting image generation");
        let response = self
            .client
            .post(format!("{}/images/generations", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return match (status.is_client_error(), api_error_message(&body)) {
                (true, Some(message)) => Err(CollaboratorError::Reported(message)),
                (_, message) => Err(CollaboratorError::ApiError(format!(
                    "image generation failed with status {}: {}",
                    status,
                    message.unwrap_or(body)
                ))),
            };
        }

        let body = response.json::<Value>().await?;
        let item = body
            .get("data")
            .and_then(|d| d.get(0))
            .cloned()
            .unwrap_or(Value::Null);

        let (bytes, source, backend_url) =
            if let Some(b64) = item.get("b64_json").and_then(Value::as_str) {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(b64.trim())
                    .map_err(|e| CollaboratorError::InvalidResponse(format!("bad b64_json: {}", e)))?;
                (bytes, "b64_json", None)
            } else if let Some(url) = item.get("url").and_then(Value::as_str) {
                (self.download(url).await?, "url", Some(url.to_string()))
            } else {
                return Err(CollaboratorError::Reported(
                    "the image backend returned no image data".to_string(),
                ));
            };

        let local_path = self.save(&bytes).await?;

        let mut url = backend_url;
        if let Some(storage) = &self.storage {
            match storage.upload(&local_path, &folder_hint(prompt)).await {
                Ok(uploaded) => url = Some(uploaded),
                Err(e) => warn!("Upload of generated image failed: {}", e),
            }
        }

        let mut metadata = Map::new();
        metadata.insert("model".to_string(), json!(self.model));
        metadata.insert("source".to_string(), json!(source));
        metadata.insert("prompt".to_string(), json!(preview(prompt, 200)));
        if let Some(revised) = item.get("revised_prompt") {
            metadata.insert("revised_prompt".to_string(), revised.clone());
        }

        Ok(ImageResult {
            url_kind: url.as_ref().map(|_| UrlKind::Remote),
            url,
            local_path: Some(local_path),
            size: Some(size.to_string()),
            placement: None,
            metadata,
        })
    }
}

// ============================================================================
// Compositing
// ============================================================================

/// ImageMagick gravity for an overlay position.
fn gravity(position: OverlayPosition) -> &'static str {
    match position {
        OverlayPosition::TopLeft => "NorthWest",
        OverlayPosition::TopRight => "NorthEast",
        OverlayPosition::BottomLeft => "SouthWest",
        OverlayPosition::BottomRight => "SouthEast",
        OverlayPosition::Center => "Center",
    }
}

/// Composites overlays by running ImageMagick.
pub struct CommandCompositor {
    program: String,
    margin: u32,
    output_dir: PathBuf,
    storage: Option<Arc<dyn ObjectStorage>>,
}

impl CommandCompositor {
    pub fn new(program: impl Into<String>, margin: u32, output_dir: PathBuf) -> Self {
        Self {
            program: program.into(),
            margin,
            output_dir,
            storage: None,
        }
    }

    pub fn from_config(config: &CompositorConfig) -> Self {
        Self::new(config.program.clone(), config.margin, config.output_dir.clone())
    }

    pub fn with_storage(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Arguments of the compositing command.
    pub fn compose_args(
        &self,
        base: &Path,
        overlay: &Path,
        position: OverlayPosition,
        overlay_width: u32,
        output: &Path,
    ) -> Vec<String> {
        let geometry = match position {
            OverlayPosition::Center => "+0+0".to_string(),
            _ => format!("+{}+{}", self.margin, self.margin),
        };

        vec![
            base.display().to_string(),
            "(".to_string(),
            overlay.display().to_string(),
            "-resize".to_string(),
            format!("{}x", overlay_width),
            ")".to_string(),
            "-gravity".to_string(),
            gravity(position).to_string(),
            "-geometry".to_string(),
            geometry,
            "-composite".to_string(),
            output.display().to_string(),
        ]
    }

    async fn image_width(&self, path: &Path) -> CollaboratorResult<u32> {
        let output = Command::new(&self.program)
            .arg("identify")
            .arg("-format")
            .arg("%w")
            .arg(path)
            .output()
            .await?;

        if !output.status.success() {
            return Err(CollaboratorError::ProcessError(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<u32>()
            .map_err(|e| CollaboratorError::InvalidResponse(format!("unreadable image width: {}", e)))
    }
}

#[async_trait]
impl Compositor for CommandCompositor {
    async fn compose(
        &self,
        base: &Path,
        overlay: &Path,
        position: OverlayPosition,
        size_ratio: f64,
    ) -> CollaboratorResult<ImageResult> {
        if !base.exists() {
            return Err(CollaboratorError::Reported(format!(
                "base image not found: {}",
                base.display()
            )));
        }
        if !overlay.exists() {
            return Err(CollaboratorError::Reported(format!(
                "overlay image not found: {}",
                overlay.display()
            )));
        }
        if !(size_ratio > 0.0 && size_ratio <= 1.0) {
            return Err(CollaboratorError::Reported(format!(
                "overlay size ratio {} is outside (0, 1]",
                size_ratio
            )));
        }

        let base_width = self.image_width(base).await?;
        let overlay_width = ((base_width as f64 * size_ratio).round() as u32).max(1);

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let output_path = self
            .output_dir
            .join(format!("composed_{}.png", Uuid::new_v4().simple()));

        let args = self.compose_args(base, overlay, position, overlay_width, &output_path);
        debug!(program = %self.program, ?args, "Running compositor");
        let output = Command::new(&self.program).args(&args).output().await?;

        if !output.status.success() {
            return Err(CollaboratorError::ProcessError(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        info!("Composed image written to {:?}", output_path);

        let mut url = None;
        if let Some(storage) = &self.storage {
            match storage.upload(&output_path, "composed").await {
                Ok(uploaded) => url = Some(uploaded),
                Err(e) => warn!("Upload of composed image failed: {}", e),
            }
        }

        let mut metadata = Map::new();
        metadata.insert("base_image".to_string(), json!(base.display().to_string()));
        metadata.insert("overlay_image".to_string(), json!(overlay.display().to_string()));
        metadata.insert("overlay_width".to_string(), json!(overlay_width));

        Ok(ImageResult {
            url_kind: url.as_ref().map(|_| UrlKind::Remote),
            url,
            local_path: Some(output_path),
            size: None,
            placement: Some(Placement {
                position,
                size_ratio,
            }),
            metadata,
        })
    }
}

// ============================================================================
// Storage and download
// ============================================================================

/// Object store backed by a local directory.
pub struct LocalObjectStorage {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl LocalObjectStorage {
    pub fn new(root: PathBuf, public_base_url: Option<String>) -> Self {
        Self {
            root,
            public_base_url,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.root.clone(), config.public_base_url.clone())
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn upload(&self, local_path: &Path, folder_hint: &str) -> CollaboratorResult<String> {
        let file_name = local_path
            .file_name()
            .ok_or_else(|| CollaboratorError::Reported(format!("not a file: {}", local_path.display())))?;
        if !local_path.exists() {
            return Err(CollaboratorError::Reported(format!(
                "file not found: {}",
                local_path.display()
            )));
        }

        let folder = folder_hint_or_default(folder_hint);
        let destination_dir = self.root.join(&folder);
        tokio::fs::create_dir_all(&destination_dir).await?;
        let destination = destination_dir.join(file_name);
        tokio::fs::copy(local_path, &destination).await?;

        let file_name = file_name.to_string_lossy();
        Ok(match &self.public_base_url {
            Some(base) => format!("{}/{}/{}", base.trim_end_matches('/'), folder, file_name),
            None => format!("file://{}", destination.display()),
        })
    }
}

fn folder_hint_or_default(hint: &str) -> String {
    let cleaned = NON_WORD.replace_all(hint.trim(), "_").to_string();
    if cleaned.trim_matches('_').is_empty() {
        "uploads".to_string()
    } else {
        cleaned
    }
}

/// Downloads images over HTTP; `file://` URLs are copied.
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl Default for HttpImageFetcher {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl HttpImageFetcher {
    pub fn with_timeout(timeout_secs: u64) -> WeaverResult<Self> {
        Ok(Self {
            client: build_client(timeout_secs)?,
        })
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str, destination: &Path) -> CollaboratorResult<()> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Some(path) = url.strip_prefix("file://") {
            tokio::fs::copy(path, destination).await?;
            return Ok(());
        }

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(CollaboratorError::ApiError(format!(
                "download failed with HTTP status {}",
                response.status()
            )));
        }

        let bytes = response.bytes().await?;
        tokio::fs::write(destination, &bytes).await?;
        debug!("Downloaded {} bytes to {:?}", bytes.len(), destination);
        Ok(())
    }
}

/// Wire the production adapters from configuration.
pub fn build_collaborators(
    config: &WeaverConfig,
    prompts: &PromptSet,
) -> WeaverResult<Collaborators> {
    let llm: Arc<dyn LanguageModel> = Arc::new(OpenAiChatModel::from_config(&config.llm)?);
    let designer = Arc::new(LlmDesignAnalyzer::new(llm.clone(), prompts.designer.clone()));

    let mut generator = HttpImageGenerator::from_config(
        &config.image,
        config.image_api_key(),
        config.llm.timeout_secs,
    )?;
    let mut compositor = CommandCompositor::from_config(&config.compositor);
    if config.image.auto_upload {
        let storage: Arc<dyn ObjectStorage> =
            Arc::new(LocalObjectStorage::from_config(&config.storage));
        generator = generator.with_storage(storage.clone());
        compositor = compositor.with_storage(storage);
    }

    Ok(Collaborators {
        llm,
        designer,
        generator: Arc::new(generator),
        compositor: Arc::new(compositor),
        fetcher: Arc::new(HttpImageFetcher::with_timeout(config.llm.timeout_secs)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoModel;

    #[async_trait]
    impl LanguageModel for EchoModel {
        fn name(&self) -> &str {
            "echo"
        }

        async fn ask(&self, _system: &str, user: &str) -> CollaboratorResult<String> {
            Ok(user.to_string())
        }
    }

    #[test]
    fn test_tune_temperature() {
        assert_eq!(tune_temperature("一幅梦幻的超现实艺术作品"), 0.8);
        assert_eq!(tune_temperature("a photorealistic, detailed product shot"), 0.4);
        assert_eq!(tune_temperature("a cat on a sofa"), 0.7);
    }

    #[test]
    fn test_folder_hint() {
        assert_eq!(folder_hint("a cat, sitting on a mat"), "a_cat__sit");
        assert_eq!(folder_hint("中秋节海报"), "中秋节海报");
        assert_eq!(folder_hint("!!!"), "images");
    }

    #[tokio::test]
    async fn test_design_analyzer_rejects_short_demand() {
        let analyzer = LlmDesignAnalyzer::new(Arc::new(EchoModel), "system");
        let err = analyzer.analyze("cat").await.unwrap_err();
        assert!(err.reported_detail().unwrap().contains("at least 5"));
    }

    #[tokio::test]
    async fn test_design_analyzer_parses_json_reply() {
        let analyzer = LlmDesignAnalyzer::new(Arc::new(EchoModel), "system");
        let brief = analyzer
            .analyze(r#"{"design_direction": "pastel cartoon"}"#)
            .await
            .unwrap();
        assert_eq!(brief["design_direction"], "pastel cartoon");
    }

    #[tokio::test]
    async fn test_design_analyzer_keeps_unstructured_reply() {
        let analyzer = LlmDesignAnalyzer::new(Arc::new(EchoModel), "system");
        let brief = analyzer.analyze("a cute cartoon cat please").await.unwrap();
        assert_eq!(brief["design_direction"], "a cute cartoon cat please");
        assert!(brief.contains_key("proposal_one"));
    }

    #[test]
    fn test_compose_args() {
        let compositor = CommandCompositor::new("magick", 20, PathBuf::from("/out"));
        let args = compositor.compose_args(
            Path::new("/in/base.png"),
            Path::new("/in/logo.png"),
            OverlayPosition::TopRight,
            205,
            Path::new("/out/composed.png"),
        );
        assert_eq!(args[0], "/in/base.png");
        assert!(args.contains(&"205x".to_string()));
        assert!(args.contains(&"NorthEast".to_string()));
        assert!(args.contains(&"+20+20".to_string()));
        assert_eq!(args.last().unwrap(), "/out/composed.png");
    }

    #[tokio::test]
    async fn test_compositor_validates_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.png");
        std::fs::write(&base, b"png").unwrap();

        let compositor = CommandCompositor::new("magick", 20, dir.path().join("out"));
        let missing = compositor
            .compose(&base, &dir.path().join("nope.png"), OverlayPosition::Center, 0.2)
            .await
            .unwrap_err();
        assert!(missing.reported_detail().unwrap().contains("overlay image not found"));

        let oversized = compositor
            .compose(&base, &base, OverlayPosition::Center, 1.5)
            .await
            .unwrap_err();
        assert!(oversized.reported_detail().is_some());
    }

    #[tokio::test]
    async fn test_image_generator_validates_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let generator = HttpImageGenerator::new(
            "sk-test".to_string(),
            "http://127.0.0.1:9".to_string(),
            "test-model".to_string(),
            dir.path().to_path_buf(),
        );

        let short = generator.generate("cat", "1024x1024").await.unwrap_err();
        assert!(short.reported_detail().is_some());

        let bad_size = generator.generate("a cute cat", "large").await.unwrap_err();
        assert!(bad_size.reported_detail().unwrap().contains("WIDTHxHEIGHT"));
    }

    #[tokio::test]
    async fn test_local_storage_upload() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("cat.png");
        std::fs::write(&source, b"image-bytes").unwrap();

        let storage = LocalObjectStorage::new(
            dir.path().join("objects"),
            Some("https://cdn.example.com/".to_string()),
        );
        let url = storage.upload(&source, "cats").await.unwrap();
        assert_eq!(url, "https://cdn.example.com/cats/cat.png");
        assert!(dir.path().join("objects/cats/cat.png").exists());

        let local = LocalObjectStorage::new(dir.path().join("objects"), None);
        let url = local.upload(&source, "").await.unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("uploads/cat.png"));
    }

    #[test]
    fn test_build_collaborators_requires_api_key() {
        let mut config = WeaverConfig::default();
        config.llm.api_key = None;
        assert!(build_collaborators(&config, &PromptSet::default()).is_err());

        config.llm.api_key = Some("sk-test".to_string());
        let collaborators = build_collaborators(&config, &PromptSet::default()).unwrap();
        assert_eq!(collaborators.llm.name(), "gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_fetcher_copies_file_urls() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("remote.png");
        std::fs::write(&source, b"image-bytes").unwrap();
        let destination = dir.path().join("nested/copy.png");

        HttpImageFetcher::default()
            .fetch(&format!("file://{}", source.display()), &destination)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&destination).unwrap(), b"image-bytes");
    }
}
