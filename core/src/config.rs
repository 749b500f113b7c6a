/// Configuration management for VisionWeaver.
/// Handles loading, environment overrides and validation of .visionweaver/config.toml
use crate::errors::{WeaverError, WeaverResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Top-level configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeaverConfig {
    /// Language model settings
    #[serde(default)]
    pub llm: LlmConfig,

    /// Image generation backend settings
    #[serde(default)]
    pub image: ImageConfig,

    /// External compositing tool settings
    #[serde(default)]
    pub compositor: CompositorConfig,

    /// Object storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Workflow engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Execution gate (single-flight lease) settings
    #[serde(default)]
    pub gate: GateConfig,

    /// Content filter settings
    #[serde(default)]
    pub safety: SafetyConfig,

    /// Task status/result persistence
    #[serde(default)]
    pub tasks: TasksConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// OpenAI-compatible chat completion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_openai_endpoint")]
    pub endpoint: String,

    /// API key (prefer the environment over the config file)
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_openai_endpoint(),
            api_key: None,
            model: default_llm_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout(),
        }
    }
}

fn default_openai_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> usize {
    2048
}

fn default_timeout() -> u64 {
    120
}

/// Image generation backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_openai_endpoint")]
    pub endpoint: String,

    /// Falls back to the LLM key when unset
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_image_model")]
    pub model: String,

    /// Requested image size, "WIDTHxHEIGHT"
    #[serde(default = "default_image_size")]
    pub size: String,

    /// Where generated images are written
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Upload generated and composed images through object storage
    #[serde(default)]
    pub auto_upload: bool,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            endpoint: default_openai_endpoint(),
            api_key: None,
            model: default_image_model(),
            size: default_image_size(),
            output_dir: default_output_dir(),
            auto_upload: false,
        }
    }
}

fn default_image_model() -> String {
    "gpt-image-1".to_string()
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("generated_images")
}

/// External compositing tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositorConfig {
    /// ImageMagick executable
    #[serde(default = "default_magick")]
    pub program: String,

    /// Distance in pixels between the overlay and the image edge
    #[serde(default = "default_margin")]
    pub margin: u32,

    #[serde(default = "default_composed_dir")]
    pub output_dir: PathBuf,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            program: default_magick(),
            margin: default_margin(),
            output_dir: default_composed_dir(),
        }
    }
}

fn default_magick() -> String {
    "magick".to_string()
}

fn default_margin() -> u32 {
    20
}

fn default_composed_dir() -> PathBuf {
    PathBuf::from("composed_images")
}

/// Object storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory that backs the object store
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,

    /// Public URL prefix; `file://` URLs are returned when unset
    #[serde(default)]
    pub public_base_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            public_base_url: None,
        }
    }
}

fn default_storage_root() -> PathBuf {
    data_dir().join("objects")
}

/// Reply language the engine expects from the language model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    Zh,
    En,
}

/// Workflow engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard ceiling on handler executions per run
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    #[serde(default)]
    pub locale: Locale,

    /// Per-request scratch files (downloaded base images)
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Optional directory overriding the embedded prompt templates
    #[serde(default)]
    pub prompts_dir: Option<PathBuf>,

    /// Log a warning when the design brief shares no keywords with the request
    #[serde(default = "default_true")]
    pub relevance_check: bool,

    /// Conversations kept in memory; the least recently used is forgotten first
    #[serde(default = "default_max_conversations")]
    pub max_conversations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            locale: Locale::default(),
            temp_dir: default_temp_dir(),
            prompts_dir: None,
            relevance_check: true,
            max_conversations: default_max_conversations(),
        }
    }
}

fn default_max_steps() -> usize {
    25
}

fn default_max_conversations() -> usize {
    1000
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("visionweaver")
}

fn default_true() -> bool {
    true
}

/// Storage backend for leases and task records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    Sqlite,
}

/// Execution gate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub backend: Backend,

    /// Name of the single global lease
    #[serde(default = "default_lock_key")]
    pub key: String,

    #[serde(default = "default_lease_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Admit requests when the lease store itself is failing
    #[serde(default)]
    pub fail_open: bool,

    /// Caller-side retry policy for busy rejections
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            key: default_lock_key(),
            ttl_secs: default_lease_ttl(),
            db_path: default_db_path(),
            fail_open: false,
            backoff: BackoffConfig::default(),
        }
    }
}

fn default_lock_key() -> String {
    "visionweaver:request_lock".to_string()
}

fn default_lease_ttl() -> u64 {
    300
}

fn default_db_path() -> PathBuf {
    data_dir().join("visionweaver.db")
}

/// Exponential backoff for busy rejections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Content filter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Extra terms, one per line
    #[serde(default)]
    pub word_list: Option<PathBuf>,

    #[serde(default)]
    pub extra_words: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            word_list: None,
            extra_words: Vec::new(),
        }
    }
}

/// Task status/result persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    #[serde(default)]
    pub backend: Backend,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Expiry of status and result records
    #[serde(default = "default_task_ttl_hours")]
    pub ttl_hours: u64,

    /// Where submitted attachments are written
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            db_path: default_db_path(),
            ttl_hours: default_task_ttl_hours(),
            upload_dir: default_upload_dir(),
        }
    }
}

fn default_task_ttl_hours() -> u64 {
    24
}

fn default_upload_dir() -> PathBuf {
    std::env::temp_dir().join("visionweaver").join("uploads")
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Base directory for local state (~/.visionweaver unless overridden)
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("VISIONWEAVER_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .map(|home| home.join(".visionweaver"))
        .unwrap_or_else(|| PathBuf::from(".visionweaver"))
}

/// Configuration manager
pub struct ConfigManager {
    config: WeaverConfig,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Load configuration from file or use defaults
    pub fn load(config_path: Option<&Path>) -> WeaverResult<Self> {
        let path = match config_path {
            Some(p) => p.to_path_buf(),
            None => {
                let local = PathBuf::from(".visionweaver/config.toml");
                if local.exists() {
                    local
                } else {
                    data_dir().join("config.toml")
                }
            }
        };

        let config = if path.exists() {
            info!("Loading config from {:?}", path);
            let content = std::fs::read_to_string(&path).map_err(|e| {
                WeaverError::ConfigError(format!("Failed to read config file: {}", e))
            })?;
            Self::parse(&content)?
        } else {
            if config_path.is_some() {
                return Err(WeaverError::ConfigError(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            warn!("Config file not found at {:?}, using defaults", path);
            WeaverConfig::default()
        };

        debug!("Configuration loaded successfully");
        Ok(ConfigManager {
            config,
            config_path: path,
        })
    }

    /// Parse a TOML document into a configuration
    pub fn parse(content: &str) -> WeaverResult<WeaverConfig> {
        toml::from_str(content)
            .map_err(|e| WeaverError::ConfigError(format!("Failed to parse config file: {}", e)))
    }

    /// Wrap an in-memory configuration
    pub fn from_config(config: WeaverConfig) -> Self {
        Self {
            config,
            config_path: data_dir().join("config.toml"),
        }
    }

    pub fn config(&self) -> &WeaverConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut WeaverConfig {
        &mut self.config
    }

    pub fn into_config(self) -> WeaverConfig {
        self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration overrides from environment variables
    pub fn load_from_env(&mut self) {
        self.apply_env(|name| std::env::var(name).ok());
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("VISIONWEAVER_LLM_API_KEY").or_else(|| lookup("OPENAI_API_KEY"))
        {
            self.config.llm.api_key = Some(key);
        }

        if let Some(endpoint) = lookup("VISIONWEAVER_LLM_ENDPOINT") {
            self.config.llm.endpoint = endpoint;
        }

        if let Some(model) = lookup("VISIONWEAVER_LLM_MODEL") {
            self.config.llm.model = model;
        }

        if let Some(key) = lookup("VISIONWEAVER_IMAGE_API_KEY") {
            self.config.image.api_key = Some(key);
        }

        if let Some(endpoint) = lookup("VISIONWEAVER_IMAGE_ENDPOINT") {
            self.config.image.endpoint = endpoint;
        }

        if let Some(level) = lookup("VISIONWEAVER_LOG_LEVEL") {
            self.config.logging.level = level;
        }

        debug!("Configuration overrides applied from environment");
    }

    /// Validate configuration
    pub fn validate(&self) -> WeaverResult<()> {
        self.config.validate()
    }
}

impl WeaverConfig {
    /// Checks everything the engine needs before it accepts a request
    pub fn validate(&self) -> WeaverResult<()> {
        if self.llm.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(WeaverError::ConfigError(
                "Language model API key is not configured (set VISIONWEAVER_LLM_API_KEY)"
                    .to_string(),
            ));
        }

        if self.llm.temperature < 0.0 || self.llm.temperature > 2.0 {
            return Err(WeaverError::ConfigError(
                "Temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        if self.engine.max_steps == 0 {
            return Err(WeaverError::ConfigError(
                "engine.max_steps must be greater than 0".to_string(),
            ));
        }

        if self.gate.ttl_secs == 0 {
            return Err(WeaverError::ConfigError(
                "gate.ttl_secs must be greater than 0".to_string(),
            ));
        }

        if self.gate.key.trim().is_empty() {
            return Err(WeaverError::ConfigError("gate.key must not be empty".to_string()));
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    /// API key used for the image backend
    pub fn image_api_key(&self) -> Option<&str> {
        self.image.api_key.as_deref().or(self.llm.api_key.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = WeaverConfig::default();
        assert_eq!(config.engine.max_steps, 25);
        assert_eq!(config.gate.ttl_secs, 300);
        assert_eq!(config.gate.key, "visionweaver:request_lock");
        assert_eq!(config.tasks.ttl_hours, 24);
        assert_eq!(config.image.size, "1024x1024");
        assert_eq!(config.engine.locale, Locale::Zh);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = ConfigManager::parse(
            r#"
            [llm]
            api_key = "sk-test"
            model = "local-model"

            [gate]
            backend = "sqlite"
            ttl_secs = 60

            [engine]
            locale = "en"
            "#,
        )
        .unwrap();

        assert_eq!(config.llm.model, "local-model");
        assert_eq!(config.gate.backend, Backend::Sqlite);
        assert_eq!(config.gate.ttl_secs, 60);
        assert_eq!(config.engine.locale, Locale::En);
        assert_eq!(config.llm.endpoint, "https://api.openai.com/v1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_api_key() {
        let config = WeaverConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("API key"));
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let mut config = WeaverConfig::default();
        config.llm.api_key = Some("sk-test".to_string());
        config.gate.ttl_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("OPENAI_API_KEY", "sk-env"),
            ("VISIONWEAVER_LLM_MODEL", "env-model"),
            ("VISIONWEAVER_IMAGE_ENDPOINT", "http://localhost:9000/v1"),
        ]
        .into_iter()
        .collect();

        let mut manager = ConfigManager::from_config(WeaverConfig::default());
        manager.apply_env(|name| env.get(name).map(|v| v.to_string()));

        let config = manager.config();
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-env"));
        assert_eq!(config.llm.model, "env-model");
        assert_eq!(config.image.endpoint, "http://localhost:9000/v1");
        assert_eq!(config.image_api_key(), Some("sk-env"));
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(ConfigManager::load(Some(&missing)).is_err());
    }
}
