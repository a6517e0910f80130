//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use crate::Result;
use crate::error::Error;
use crate::agent::llm::{ToolMode, Vendor};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Vendor connection settings
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Loop bounds and timeouts
    #[serde(default)]
    pub orchestration: OrchestrationConfig,

    /// Root folder of the notes the built-in tools may read
    #[serde(default = "default_notes_dir")]
    pub notes_dir: PathBuf,

    /// Answer language; `None` follows the language of the question
    #[serde(default)]
    pub language: Option<String>,

    /// Base system instruction
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

/// Vendor selection and credentials. Immutable for one exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub vendor: Vendor,

    /// Base URL override (OpenAI-compatible gateways, remote Ollama, ...)
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub api_key: String,

    /// Model name; empty selects the vendor default
    #[serde(default)]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Character budget for injected source documents; `None` uses the vendor default
    #[serde(default)]
    pub context_window_chars: Option<usize>,

    /// Force native or in-text tool calls instead of the vendor default
    #[serde(default)]
    pub tool_mode: Option<ToolMode>,

    /// Message appended after tool results; `None` uses the vendor default
    #[serde(default)]
    pub continuation_prompt: Option<String>,

    /// Log every wire frame at debug level
    #[serde(default)]
    pub debug_wire: bool,
}

impl ProviderConfig {
    /// Configured model, or the vendor default when unset.
    pub fn model_name(&self) -> &str {
        if self.model.is_empty() {
            self.vendor.default_model()
        } else {
            &self.model
        }
    }

    /// Configured endpoint with any trailing slash removed, or the vendor default.
    pub fn endpoint_url(&self) -> String {
        self.endpoint
            .as_deref()
            .unwrap_or_else(|| self.vendor.default_endpoint())
            .trim_end_matches('/')
            .to_string()
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            vendor: Vendor::default(),
            endpoint: None,
            api_key: String::new(),
            model: String::new(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            context_window_chars: None,
            tool_mode: None,
            continuation_prompt: None,
            debug_wire: false,
        }
    }
}

/// Bounds on one exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Maximum streaming rounds per exchange
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,

    /// Ceiling for a single round's network operation
    #[serde(default = "default_round_timeout_secs")]
    pub round_timeout_secs: u64,

    /// Hard ceiling for the whole exchange
    #[serde(default = "default_exchange_timeout_secs")]
    pub exchange_timeout_secs: u64,

    /// Cap on a formatted tool result before truncation
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,

    /// Hits returned by `search_knowledge_base`
    #[serde(default = "default_max_search_results")]
    pub max_search_results: usize,
}

impl OrchestrationConfig {
    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.round_timeout_secs)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_secs)
    }
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            round_timeout_secs: default_round_timeout_secs(),
            exchange_timeout_secs: default_exchange_timeout_secs(),
            max_result_chars: default_max_result_chars(),
            max_search_results: default_max_search_results(),
        }
    }
}

fn default_notes_dir() -> PathBuf {
    config_dir().join("notes")
}

fn default_system_prompt() -> String {
    "You are a helpful assistant inside a note-taking app. Answer from the user's notes when \
     they are relevant, cite the note you used, and be concise."
        .to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_output_tokens() -> u32 {
    4096
}

fn default_max_rounds() -> usize {
    20
}

fn default_round_timeout_secs() -> u64 {
    120
}

fn default_exchange_timeout_secs() -> u64 {
    300
}

fn default_max_result_chars() -> usize {
    8000
}

fn default_max_search_results() -> usize {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            orchestration: OrchestrationConfig::default(),
            notes_dir: default_notes_dir(),
            language: None,
            system_prompt: default_system_prompt(),
        }
    }
}

/// Get the config directory path
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".quill")
}

/// Get the config file path
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Load configuration from file
pub fn load() -> Result<Config> {
    let path = config_path();

    if !path.exists() {
        return Err(Error::Config(format!(
            "Config not found at {:?}. Run 'quill init' first.",
            path
        )));
    }

    let content = std::fs::read_to_string(&path)?;
    let config: Config = serde_json::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save(config: &Config) -> Result<()> {
    let path = config_path();

    // Create parent directory
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, content)?;
    Ok(())
}

/// Write a default configuration and create the notes folder.
///
/// An existing config file is left untouched.
pub fn init() -> Result<Config> {
    let path = config_path();
    let config = if path.exists() {
        load()?
    } else {
        let config = Config::default();
        save(&config)?;
        config
    };
    std::fs::create_dir_all(&config.notes_dir)?;
    Ok(config)
}
