//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/chatclass/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/chatclass/` (~/.config/chatclass/)
//! - Data: `$XDG_DATA_HOME/chatclass/` (~/.local/share/chatclass/)
//! - State/Logs: `$XDG_STATE_HOME/chatclass/` (~/.local/state/chatclass/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Model endpoint configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Label set the classifier must choose from
    #[serde(default)]
    pub taxonomy: TaxonomyConfig,

    /// Where instruction text comes from
    #[serde(default)]
    pub instructions: InstructionsConfig,

    /// Pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Retry/backoff policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Database location override
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// LLM provider configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// Provider type
    #[serde(default = "default_provider")]
    pub provider: LlmProvider,
    /// Model (or Azure deployment) to use
    #[serde(default = "default_model")]
    pub model: String,
    /// API endpoint (optional, uses default for provider)
    pub endpoint: Option<String>,
    /// API key (can also use env var)
    pub api_key: Option<String>,
    /// API version query parameter (Azure OpenAI only)
    pub api_version: Option<String>,
    /// Per-request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Max output tokens per call
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature
    #[serde(default)]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            endpoint: None,
            api_key: None,
            api_version: None,
            timeout_secs: default_llm_timeout(),
            max_tokens: default_max_tokens(),
            temperature: 0.0,
        }
    }
}

impl LlmConfig {
    /// Resolve the API key from config or environment.
    ///
    /// `CHATCLASS_API_KEY` wins over the provider-specific variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            return Some(key.clone());
        }
        if let Ok(key) = std::env::var("CHATCLASS_API_KEY") {
            return Some(key);
        }
        self.provider
            .api_key_env()
            .and_then(|var| std::env::var(var).ok())
    }
}

fn default_provider() -> LlmProvider {
    LlmProvider::OpenAI
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_timeout() -> u64 {
    60
}

fn default_max_tokens() -> u32 {
    256
}

/// Supported LLM providers
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    Ollama,
    Claude,
    #[serde(rename = "openai")]
    OpenAI,
    #[serde(rename = "azure_openai")]
    AzureOpenAI,
}

impl LlmProvider {
    /// Returns the default endpoint for this provider
    pub fn default_endpoint(&self) -> Option<&'static str> {
        match self {
            LlmProvider::Ollama => Some("http://localhost:11434"),
            LlmProvider::Claude => Some("https://api.anthropic.com"),
            LlmProvider::OpenAI => Some("https://api.openai.com"),
            // Azure endpoints are per-resource
            LlmProvider::AzureOpenAI => None,
        }
    }

    /// Environment variable consulted for the API key
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            LlmProvider::Ollama => None,
            LlmProvider::Claude => Some("ANTHROPIC_API_KEY"),
            LlmProvider::OpenAI => Some("OPENAI_API_KEY"),
            LlmProvider::AzureOpenAI => Some("AZURE_OPENAI_API_KEY"),
        }
    }

    pub fn requires_api_key(&self) -> bool {
        !matches!(self, LlmProvider::Ollama)
    }
}

/// Category taxonomy
#[derive(Debug, Deserialize, Clone)]
pub struct TaxonomyConfig {
    /// Allowed labels
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    /// Label used when there is nothing to classify
    #[serde(default = "default_fallback_category")]
    pub fallback_category: String,
}

impl Default for TaxonomyConfig {
    fn default() -> Self {
        Self {
            categories: default_categories(),
            fallback_category: default_fallback_category(),
        }
    }
}

fn default_categories() -> Vec<String> {
    ["billing", "technical_support", "account", "feedback", "other"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_fallback_category() -> String {
    "other".to_string()
}

/// Instruction source selection
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstructionSource {
    #[default]
    File,
    Http,
}

/// Instruction text configuration
#[derive(Debug, Deserialize, Clone)]
pub struct InstructionsConfig {
    #[serde(default)]
    pub source: InstructionSource,
    /// Session instructions file (source = "file")
    #[serde(default = "default_session_instructions_path")]
    pub session_path: PathBuf,
    /// Message instructions file (source = "file")
    #[serde(default = "default_message_instructions_path")]
    pub message_path: PathBuf,
    /// Container URL (source = "http")
    pub base_url: Option<String>,
    /// Blob name for session instructions (source = "http")
    #[serde(default = "default_session_blob")]
    pub session_blob: String,
    /// Blob name for message instructions (source = "http")
    #[serde(default = "default_message_blob")]
    pub message_blob: String,
    /// Optional SAS token appended as the query string
    pub sas_token: Option<String>,
    /// Request timeout in seconds (source = "http")
    #[serde(default = "default_instructions_timeout")]
    pub timeout_secs: u64,
}

impl Default for InstructionsConfig {
    fn default() -> Self {
        Self {
            source: InstructionSource::default(),
            session_path: default_session_instructions_path(),
            message_path: default_message_instructions_path(),
            base_url: None,
            session_blob: default_session_blob(),
            message_blob: default_message_blob(),
            sas_token: None,
            timeout_secs: default_instructions_timeout(),
        }
    }
}

fn default_session_instructions_path() -> PathBuf {
    Config::config_dir().join("session_instructions.md")
}

fn default_message_instructions_path() -> PathBuf {
    Config::config_dir().join("message_instructions.md")
}

fn default_session_blob() -> String {
    "session_instructions.md".to_string()
}

fn default_message_blob() -> String {
    "message_instructions.md".to_string()
}

fn default_instructions_timeout() -> u64 {
    30
}

/// Pipeline tuning that is not exposed as CLI flags
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Roles included in the session transcript; empty means all roles
    #[serde(default)]
    pub session_roles: Vec<String>,
    /// Per-message character cap before sending to the model
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,
    /// Marker after which the first user message's real content starts
    pub first_user_split_marker: Option<String>,
    /// Number of sessions processed concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            session_roles: vec![],
            max_content_chars: default_max_content_chars(),
            first_user_split_marker: None,
            workers: default_workers(),
        }
    }
}

fn default_max_content_chars() -> usize {
    4000
}

fn default_workers() -> usize {
    1
}

/// Retry/backoff configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Total attempts for transient classifier failures
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff ceiling
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the computed delay (0.0 - 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Total attempts for store reads/writes inside a session
    #[serde(default = "default_store_max_attempts")]
    pub store_max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            store_max_attempts: default_store_max_attempts(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    20_000
}

fn default_jitter() -> f64 {
    0.25
}

fn default_store_max_attempts() -> u32 {
    3
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level for the log file (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Database configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DatabaseConfig {
    /// Override for the SQLite file location
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.taxonomy.categories.is_empty() {
            return Err(Error::Config(
                "taxonomy.categories must not be empty".to_string(),
            ));
        }
        if !self
            .taxonomy
            .categories
            .contains(&self.taxonomy.fallback_category)
        {
            return Err(Error::Config(format!(
                "taxonomy.fallback_category '{}' is not one of taxonomy.categories",
                self.taxonomy.fallback_category
            )));
        }
        if self.retry.max_attempts == 0 || self.retry.store_max_attempts == 0 {
            return Err(Error::Config(
                "retry attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(Error::Config(
                "retry.jitter must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.pipeline.workers == 0 {
            return Err(Error::Config(
                "pipeline.workers must be at least 1".to_string(),
            ));
        }
        if self.llm.provider == LlmProvider::AzureOpenAI && self.llm.endpoint.is_none() {
            return Err(Error::Config(
                "llm.endpoint is required for azure_openai".to_string(),
            ));
        }
        if self.instructions.source == InstructionSource::Http
            && self.instructions.base_url.is_none()
        {
            return Err(Error::Config(
                "instructions.base_url is required when instructions.source = \"http\""
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the configuration directory
    ///
    /// `$XDG_CONFIG_HOME/chatclass/` (~/.config/chatclass/)
    pub fn config_dir() -> PathBuf {
        xdg_config_home().join("chatclass")
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/chatclass/config.toml` (~/.config/chatclass/config.toml)
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/chatclass/` (~/.local/share/chatclass/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("chatclass")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/chatclass/` (~/.local/state/chatclass/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("chatclass")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/chatclass/data.db` (~/.local/share/chatclass/data.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("data.db")
    }

    /// Database path after applying the `[database]` override
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(Self::database_path)
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/chatclass/chatclass.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("chatclass.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
