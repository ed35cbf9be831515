//! Configuration system (layered: env > config file > defaults).

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{AicliError, Result};
use crate::provider::ProviderKind;
use crate::tunnel::TunnelSpec;

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "AICLI_CONFIG";

pub const DEFAULT_CLAUDE_MODEL: &str = "claude-3-5-sonnet-20241022";
pub const DEFAULT_CHATGPT_MODEL: &str = "gpt-4-turbo-preview";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama2";
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Top-level configuration, persisted as TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub default_provider: ProviderKind,
    pub providers: ProvidersConfig,
    pub agent: AgentSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub claude: ClaudeConfig,
    pub chatgpt: ChatGptConfig,
    pub ollama: OllamaConfig,
}

/// An MCP server descriptor. Stored and listed; never started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaudeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<McpServerConfig>,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_CLAUDE_MODEL.to_string(),
            max_tokens: 4096,
            base_url: None,
            system_prompt: None,
            mcp_servers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatGptConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for ChatGptConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_CHATGPT_MODEL.to_string(),
            max_tokens: 4096,
            temperature: 0.7,
            base_url: None,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    /// Bounds the wait for response headers and each gap between streamed
    /// chunks, never the whole generation.
    pub timeout_secs: u64,
    /// Passed through verbatim as the request's `options` object.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelSpec>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OLLAMA_BASE_URL.to_string(),
            model: DEFAULT_OLLAMA_MODEL.to_string(),
            timeout_secs: 120,
            options: BTreeMap::new(),
            system_prompt: None,
            tunnel: None,
        }
    }
}

/// Limits applied by the conversation loop and the built-in tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_tool_iterations: usize,
    pub command_timeout_secs: u64,
    pub max_search_results: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_tool_iterations: 20,
            command_timeout_secs: 30,
            max_search_results: 200,
        }
    }
}

impl AppConfig {
    /// Default config file path (~/.aicli/config.toml).
    pub fn default_path() -> PathBuf {
        default_aicli_dir().join("config.toml")
    }

    /// Pick the config path: explicit flag, then `AICLI_CONFIG`, then the default.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => Self::default_path(),
        }
    }

    /// Load the file at the resolved path and apply environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let path = Self::resolve_path(explicit);
        let mut config = Self::load_from_path(&path)?;
        config.apply_env();
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load a config file. A missing file yields the defaults.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(AicliError::Io(err)),
        };
        Ok(toml::from_str(&raw)?)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok().filter(|v| !v.is_empty()));
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let providers = &mut self.providers;
        if let Some(key) = lookup("ANTHROPIC_API_KEY") {
            providers.claude.api_key = Some(key);
        }
        if let Some(url) = lookup("ANTHROPIC_BASE_URL") {
            providers.claude.base_url = Some(url);
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            providers.chatgpt.api_key = Some(key);
        }
        if let Some(url) = lookup("OPENAI_BASE_URL") {
            providers.chatgpt.base_url = Some(url);
        }
        if let Some(url) = lookup("OLLAMA_BASE_URL") {
            providers.ollama.base_url = url;
        }
    }

    /// Save to a specific path with owner-only permissions.
    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let serialized = toml::to_string_pretty(self)
            .map_err(|e| AicliError::Configuration(format!("failed to serialize config: {e}")))?;
        atomic_write(path.as_ref(), serialized.as_bytes())
    }

    /// Whether the provider has what it needs to attempt a request.
    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        match kind {
            ProviderKind::Claude => self.providers.claude.api_key.is_some(),
            ProviderKind::ChatGpt => self.providers.chatgpt.api_key.is_some(),
            ProviderKind::Ollama => true,
        }
    }

    /// The configured model for a provider.
    pub fn model_for(&self, kind: ProviderKind) -> &str {
        match kind {
            ProviderKind::Claude => &self.providers.claude.model,
            ProviderKind::ChatGpt => &self.providers.chatgpt.model,
            ProviderKind::Ollama => &self.providers.ollama.model,
        }
    }

    /// Override the model for a provider (e.g. from `--model`).
    pub fn set_model(&mut self, kind: ProviderKind, model: impl Into<String>) {
        let model = model.into();
        match kind {
            ProviderKind::Claude => self.providers.claude.model = model,
            ProviderKind::ChatGpt => self.providers.chatgpt.model = model,
            ProviderKind::Ollama => self.providers.ollama.model = model,
        }
    }
}

fn default_aicli_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".aicli"))
        .unwrap_or_else(|| PathBuf::from(".aicli"))
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file_name = path.file_name().ok_or_else(|| {
        AicliError::Configuration(format!("Config path {} has no file name", path.display()))
    })?;

    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let temp_path = path.with_file_name(format!(
        ".{}.tmp-{}-{nonce}",
        file_name.to_string_lossy(),
        std::process::id()
    ));

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let write_result = (|| -> std::io::Result<()> {
        let mut temp_file = options.open(&temp_path)?;
        temp_file.write_all(data)?;
        temp_file.sync_all()?;
        Ok(())
    })();

    if let Err(err) = write_result.and_then(|_| fs::rename(&temp_path, path)) {
        let _ = fs::remove_file(&temp_path);
        return Err(AicliError::Io(err));
    }

    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

    Ok(())
}
