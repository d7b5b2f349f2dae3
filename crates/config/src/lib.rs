//! Configuration loading and validation for Krait.
//!
//! Loads a single `config.toml`, expands `${ENV_VAR}` references in
//! credential fields, and validates the pieces the orchestrator depends on
//! (default provider present, API key configured). Secrets never appear in
//! `Debug` output.

pub mod mask;

pub use mask::mask_secrets;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Environment variable not set: {0}")]
    MissingEnv(String),
}

/// The root configuration, mapped from `config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    /// Provider configurations, keyed by name.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Dedicated model for session title generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub titles: Option<TitlesConfig>,

    /// Delegated-CLI runner configurations, keyed by name.
    #[serde(default)]
    pub runners: HashMap<String, RunnerConfig>,

    /// Remote tool server descriptors.
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,

    /// History slimming policy.
    #[serde(default)]
    pub slim: SlimConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default provider name (must exist in `[providers]`).
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Rounds of history replayed to the model; non-positive means
    /// "current user turn only".
    #[serde(default = "default_context_rounds")]
    pub context_rounds: i64,

    /// Number of memories recalled into the system prompt.
    #[serde(default = "default_recall_k")]
    pub memory_recall_k: usize,

    /// Data directory (database, run artifacts).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Default working directory for delegated tasks.
    #[serde(default = "default_workspace")]
    pub workspace_dir: PathBuf,

    /// IANA timezone stamped into the system prompt.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_provider() -> String {
    "anthropic".into()
}
fn default_context_rounds() -> i64 {
    50
}
fn default_recall_k() -> usize {
    5
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}
fn default_timezone() -> String {
    "UTC".into()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            context_rounds: default_context_rounds(),
            memory_recall_k: default_recall_k(),
            data_dir: default_data_dir(),
            workspace_dir: default_workspace(),
            timezone: default_timezone(),
        }
    }
}

/// One model provider entry.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,

    #[serde(default)]
    pub default_model: String,

    /// Model allow-list for `/model` switching.
    #[serde(default)]
    pub models: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl ProviderConfig {
    /// A key like `sk-...` from a config template does not count.
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_key.ends_with("...")
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_base", &self.api_base)
            .field("default_model", &self.default_model)
            .field("models", &self.models)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

/// Dedicated title-generation model.
#[derive(Clone, Serialize, Deserialize)]
pub struct TitlesConfig {
    #[serde(default)]
    pub api_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,

    pub model: String,

    #[serde(default = "default_title_tokens")]
    pub max_tokens: u32,
}

fn default_title_tokens() -> u32 {
    100
}

impl std::fmt::Debug for TitlesConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TitlesConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .finish()
    }
}

/// How a runner's final reply is captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Read the reply from stdout (stderr as fallback).
    #[default]
    Stdout,
    /// The runner gets a designated reply file appended to its arguments
    /// and the file is preferred over stdout.
    ReplyFile,
}

/// One delegated-CLI runner entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Executable name or path; resolved on PATH at spawn time.
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub capture: CaptureMode,

    /// Flag appended before the reply file path in `reply_file` capture mode.
    #[serde(default = "default_reply_flag")]
    pub reply_flag: String,

    /// Wall-clock budget per task, seconds.
    #[serde(default = "default_runner_timeout")]
    pub timeout_secs: u64,
}

fn default_reply_flag() -> String {
    "--output-last-message".to_string()
}

fn default_runner_timeout() -> u64 {
    600
}

/// Remote tool server transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpTransport {
    Http,
    Stdio,
}

/// One remote tool server descriptor.
#[derive(Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,

    pub transport: McpTransport,

    /// HTTP endpoint; required for `transport = "http"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Command + args; required for `transport = "stdio"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl std::fmt::Debug for McpServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServerConfig")
            .field("name", &self.name)
            .field("transport", &self.transport)
            .field("url", &self.url)
            .field("command", &self.command)
            .field("headers", &if self.headers.is_empty() { "{}" } else { "[REDACTED]" })
            .finish()
    }
}

/// History slimming policy (the thresholds are policy, not contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlimConfig {
    /// Tool-result payloads longer than this get summarized.
    #[serde(default = "default_slim_threshold")]
    pub threshold: usize,

    /// Characters of raw text kept in a fallback preview.
    #[serde(default = "default_slim_preview")]
    pub preview: usize,
}

fn default_slim_threshold() -> usize {
    200
}
fn default_slim_preview() -> usize {
    80
}

impl Default for SlimConfig {
    fn default() -> Self {
        Self {
            threshold: default_slim_threshold(),
            preview: default_slim_preview(),
        }
    }
}

fn redact(s: &str) -> &'static str {
    if s.is_empty() {
        "\"\""
    } else {
        "[REDACTED]"
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("general", &self.general)
            .field("providers", &self.providers)
            .field("titles", &self.titles)
            .field("runners", &self.runners)
            .field("mcp_servers", &self.mcp_servers)
            .field("slim", &self.slim)
            .finish()
    }
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    /// Parse from TOML text, expand env references, and validate.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(raw)?;
        for provider in config.providers.values_mut() {
            provider.api_key = expand_env(&provider.api_key)?;
            for value in provider.headers.values_mut() {
                *value = expand_env(value)?;
            }
        }
        if let Some(titles) = &mut config.titles {
            titles.api_key = expand_env(&titles.api_key)?;
        }
        for server in &mut config.mcp_servers {
            for value in server.headers.values_mut() {
                *value = expand_env(value)?;
            }
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let name = &self.general.default_provider;
        let Some(provider) = self.providers.get(name) else {
            return Err(ConfigError::Invalid(format!(
                "default provider '{name}' not found in [providers]"
            )));
        };
        if !provider.has_credentials() {
            return Err(ConfigError::Invalid(format!(
                "API key for default provider '{name}' is required"
            )));
        }
        for server in &self.mcp_servers {
            match server.transport {
                McpTransport::Http if server.url.is_none() => {
                    return Err(ConfigError::Invalid(format!(
                        "mcp server '{}' uses http transport but has no url",
                        server.name
                    )));
                }
                McpTransport::Stdio if server.command.is_none() => {
                    return Err(ConfigError::Invalid(format!(
                        "mcp server '{}' uses stdio transport but has no command",
                        server.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Providers that have usable credentials.
    pub fn available_providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .providers
            .iter()
            .filter(|(_, p)| p.has_credentials())
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }
}

/// Expand `${ENV_VAR}` references in a config value.
fn expand_env(value: &str) -> Result<String, ConfigError> {
    if !value.contains("${") {
        return Ok(value.to_string());
    }
    let re = regex::Regex::new(r"\$\{(\w+)\}").expect("static regex");
    let mut out = String::new();
    let mut last = 0;
    for caps in re.captures_iter(value) {
        let whole = caps.get(0).expect("match");
        let name = &caps[1];
        let resolved =
            std::env::var(name).map_err(|_| ConfigError::MissingEnv(name.to_string()))?;
        out.push_str(&value[last..whole.start()]);
        out.push_str(&resolved);
        last = whole.end();
    }
    out.push_str(&value[last..]);
    Ok(out)
}
