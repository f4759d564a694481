//! TOML Configuration File Support
//!
//! Configuration for the relay, loaded from `~/.config/relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8765"
//! read_timeout_secs = 300
//!
//! [ollama]
//! enabled = true
//! host = "localhost"
//! port = 11434
//!
//! [openai]
//! api_key = "sk-..."
//! base_url = "https://api.openai.com/v1"
//! models = [{ id = "gpt-4o", name = "GPT-4o" }]
//!
//! [broadcast]
//! mailbox_capacity = 64
//! write_timeout_ms = 5000
//!
//! [generation]
//! timeout_secs = 300
//! title_timeout_secs = 60
//! generate_titles = true
//! system_prompt = "You are a helpful assistant."
//!
//! [service]
//! name = "relay"
//! environment = "production"
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broadcast::BroadcasterConfig;
use crate::tasks::ServiceInfo;

/// Default listen address
pub const DEFAULT_BIND: &str = "127.0.0.1:8765";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Provider Sections
// =============================================================================

/// `[ollama]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    /// Register the Ollama provider
    pub enabled: bool,
    /// Host (default `localhost`)
    pub host: Option<String>,
    /// Port (default 11434)
    pub port: Option<u16>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: None,
            port: None,
        }
    }
}

/// A model offered by a provider with a static model list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredModel {
    /// Backend model id
    pub id: String,
    /// Display name (defaults to the id)
    #[serde(default)]
    pub name: Option<String>,
}

/// `[openai]` section
///
/// The provider is registered only when an API key is set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    /// Bearer token
    pub api_key: Option<String>,
    /// API base URL
    pub base_url: Option<String>,
    /// Models to offer
    pub models: Vec<ConfiguredModel>,
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[server]` section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listen address
    pub bind: Option<String>,
    /// Idle read timeout for connections in seconds
    pub read_timeout_secs: Option<u64>,
}

/// `[broadcast]` section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastToml {
    /// Messages queued per connection
    pub mailbox_capacity: Option<usize>,
    /// Write timeout in milliseconds
    pub write_timeout_ms: Option<u64>,
}

/// `[generation]` section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationToml {
    /// Bound on one reply generation in seconds
    pub timeout_secs: Option<u64>,
    /// Bound on one title generation in seconds
    pub title_timeout_secs: Option<u64>,
    /// Whether to generate conversation titles
    pub generate_titles: Option<bool>,
    /// Model used for titles (defaults to the conversation's model)
    pub title_model: Option<String>,
    /// System prompt sent first in every reply prompt
    pub system_prompt: Option<String>,
}

/// `[service]` section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceToml {
    /// Service name
    pub name: Option<String>,
    /// Deployment environment
    pub environment: Option<String>,
}

/// Complete TOML configuration file structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Server settings
    pub server: ServerToml,
    /// Ollama provider
    pub ollama: OllamaConfig,
    /// OpenAI-compatible provider
    pub openai: OpenAiConfig,
    /// Broadcaster settings
    pub broadcast: BroadcastToml,
    /// Generation settings
    pub generation: GenerationToml,
    /// Service identity
    pub service: ServiceToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Generation settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationConfig {
    /// Bound on one reply generation
    pub timeout: Duration,
    /// Bound on one title generation
    pub title_timeout: Duration,
    /// Whether to generate conversation titles
    pub generate_titles: bool,
    /// Model used for titles; `None` uses the conversation's model
    pub title_model: Option<String>,
    /// System prompt sent first in every reply prompt
    pub system_prompt: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            title_timeout: Duration::from_secs(60),
            generate_titles: true,
            title_model: None,
            system_prompt: None,
        }
    }
}

/// Resolved relay configuration
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Listen address
    pub bind: String,
    /// Idle read timeout for connections
    pub read_timeout: Duration,
    /// Ollama provider
    pub ollama: OllamaConfig,
    /// OpenAI-compatible provider
    pub openai: OpenAiConfig,
    /// Broadcaster settings
    pub broadcast: BroadcasterConfig,
    /// Generation settings
    pub generation: GenerationConfig,
    /// Service identity
    pub service: ServiceInfo,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Source of configuration values
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            read_timeout: Duration::from_secs(300),
            ollama: OllamaConfig::default(),
            openai: OpenAiConfig::default(),
            broadcast: BroadcasterConfig::default(),
            generation: GenerationConfig::default(),
            service: ServiceInfo::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Check values that would make the relay unusable
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for an unparsable bind address, a zero
    /// capacity or timeout, or a generation timeout that does not exceed the
    /// broadcast write timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "server.bind is not a socket address: {}",
                self.bind
            )));
        }
        let zero_checks = [
            ("broadcast.mailbox_capacity", self.broadcast.mailbox_capacity == 0),
            ("broadcast.write_timeout_ms", self.broadcast.write_timeout.is_zero()),
            ("server.read_timeout_secs", self.read_timeout.is_zero()),
            ("generation.timeout_secs", self.generation.timeout.is_zero()),
            (
                "generation.title_timeout_secs",
                self.generation.title_timeout.is_zero(),
            ),
        ];
        if let Some((name, _)) = zero_checks.iter().find(|(_, is_zero)| *is_zero) {
            return Err(ConfigError::ValidationError(format!(
                "{name} must be greater than zero"
            )));
        }

        // Every broadcast waits up to write_timeout on a slow subscriber
        let write_timeout = self.broadcast.write_timeout;
        let bounded = [
            ("generation.timeout_secs", self.generation.timeout),
            ("generation.title_timeout_secs", self.generation.title_timeout),
        ];
        if let Some((name, _)) = bounded.iter().find(|(_, limit)| *limit <= write_timeout) {
            return Err(ConfigError::ValidationError(format!(
                "{name} must exceed broadcast.write_timeout_ms ({}ms)",
                write_timeout.as_millis()
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/relay/relay.toml` or
/// `~/.config/relay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("relay").join("relay.toml"))
}

/// Load configuration from the default path
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then apply the environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    let mut config = RelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RelayConfig, toml: RelayToml) {
    if let Some(bind) = toml.server.bind {
        config.bind = bind;
    }
    if let Some(secs) = toml.server.read_timeout_secs {
        config.read_timeout = Duration::from_secs(secs);
    }

    config.ollama = toml.ollama;
    config.openai = toml.openai;

    if let Some(capacity) = toml.broadcast.mailbox_capacity {
        config.broadcast.mailbox_capacity = capacity;
    }
    if let Some(ms) = toml.broadcast.write_timeout_ms {
        config.broadcast.write_timeout = Duration::from_millis(ms);
    }

    let generation = toml.generation;
    if let Some(secs) = generation.timeout_secs {
        config.generation.timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = generation.title_timeout_secs {
        config.generation.title_timeout = Duration::from_secs(secs);
    }
    if let Some(enabled) = generation.generate_titles {
        config.generation.generate_titles = enabled;
    }
    if generation.title_model.is_some() {
        config.generation.title_model = generation.title_model;
    }
    if generation.system_prompt.is_some() {
        config.generation.system_prompt = generation.system_prompt;
    }

    if let Some(name) = toml.service.name {
        config.service.name = name;
    }
    if let Some(environment) = toml.service.environment {
        config.service.environment = environment;
    }
}

/// Apply environment variables, read through `lookup`
fn apply_env_config<F>(config: &mut RelayConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut touched = false;

    if let Some(bind) = lookup("RELAY_BIND") {
        config.bind = bind;
        touched = true;
    }
    if let Some(host) = lookup("OLLAMA_HOST") {
        config.ollama.host = Some(host);
        touched = true;
    }
    if let Some(port) = lookup("OLLAMA_PORT").and_then(|p| p.parse::<u16>().ok()) {
        config.ollama.port = Some(port);
        touched = true;
    }
    if let Some(key) = lookup("OPENAI_API_KEY") {
        config.openai.api_key = Some(key);
        touched = true;
    }
    if let Some(url) = lookup("OPENAI_BASE_URL") {
        config.openai.base_url = Some(url);
        touched = true;
    }
    if let Some(environment) = lookup("RELAY_ENVIRONMENT") {
        config.service.environment = environment;
        touched = true;
    }

    if touched {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Overrides
// =============================================================================

/// Configuration overrides from CLI arguments
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen address override
    pub bind: Option<String>,

    /// Ollama host override
    pub ollama_host: Option<String>,

    /// Ollama port override
    pub ollama_port: Option<u16>,

    /// Title generation override
    pub generate_titles: Option<bool>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listen address override
    #[must_use]
    pub fn with_bind(mut self, bind: String) -> Self {
        self.bind = Some(bind);
        self
    }

    /// Set Ollama host override
    #[must_use]
    pub fn with_ollama_host(mut self, host: String) -> Self {
        self.ollama_host = Some(host);
        self
    }

    /// Set Ollama port override
    #[must_use]
    pub fn with_ollama_port(mut self, port: u16) -> Self {
        self.ollama_port = Some(port);
        self
    }

    /// Set title generation override
    #[must_use]
    pub fn with_generate_titles(mut self, enabled: bool) -> Self {
        self.generate_titles = Some(enabled);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RelayConfig) {
        if self.bind.is_some()
            || self.ollama_host.is_some()
            || self.ollama_port.is_some()
            || self.generate_titles.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref bind) = self.bind {
            config.bind = bind.clone();
        }
        if let Some(ref host) = self.ollama_host {
            config.ollama.host = Some(host.clone());
        }
        if let Some(port) = self.ollama_port {
            config.ollama.port = Some(port);
        }
        if let Some(enabled) = self.generate_titles {
            config.generation.generate_titles = enabled;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
