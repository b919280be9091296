use crate::defaults;
use crate::error::{Result, VoxError};
use crate::refine::client::Provider;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub refine: RefineConfig,
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
    /// Where the model name and endpoint came from.
    #[serde(skip)]
    pub sources: ConfigSources,
}

/// Model backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: Provider,
    /// Base URL (or full API URL) of the backend.
    pub endpoint: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// JSON pointer to the refined text in the response body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_pointer: Option<String>,
    /// Output format named in the instructions.
    pub format: String,
}

/// Refinement pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RefineConfig {
    pub enabled: bool,
    pub max_chunk_size: usize,
    pub overlap_size: usize,
    pub concurrency_limit: usize,
    pub max_retry_attempts: u32,
    pub request_timeout_ms: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub strict_continuity: bool,
    pub partial_on_failure: bool,
    pub continuity_tail_chars: usize,
    pub min_overlap_chars: usize,
    pub max_overlap_chars: usize,
    /// Fraction of boundary words allowed to differ when matching overlap.
    pub fuzzy_overlap_ratio: f32,
}

/// Refine cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_size: usize,
    pub ttl_ms: u64,
}

/// Preference memory configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    /// JSONL file with preference and glossary items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub max_items: usize,
}

/// Origin of resolved values: `default`, `config`, an env var name, or `flag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSources {
    pub model: String,
    pub endpoint: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Ollama,
            endpoint: defaults::DEFAULT_ENDPOINT.to_string(),
            model: defaults::DEFAULT_MODEL.to_string(),
            api_key: None,
            response_pointer: None,
            format: defaults::DEFAULT_FORMAT.to_string(),
        }
    }
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_chunk_size: defaults::MAX_CHUNK_SIZE,
            overlap_size: defaults::OVERLAP_SIZE,
            concurrency_limit: defaults::CONCURRENCY_LIMIT,
            max_retry_attempts: defaults::MAX_RETRY_ATTEMPTS,
            request_timeout_ms: defaults::REQUEST_TIMEOUT_MS,
            retry_base_delay_ms: defaults::RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: defaults::RETRY_MAX_DELAY_MS,
            strict_continuity: false,
            partial_on_failure: false,
            continuity_tail_chars: defaults::CONTINUITY_TAIL_CHARS,
            min_overlap_chars: defaults::MIN_OVERLAP_CHARS,
            max_overlap_chars: defaults::MAX_OVERLAP_CHARS,
            fuzzy_overlap_ratio: defaults::FUZZY_OVERLAP_RATIO,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: defaults::CACHE_MAX_SIZE,
            ttl_ms: defaults::CACHE_TTL_MS,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_items: defaults::MEMORY_MAX_ITEMS,
        }
    }
}

impl Default for ConfigSources {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            endpoint: "default".to_string(),
        }
    }
}

/// Values that switch a feature off: `0`, `false`, `no`, `off`.
fn is_falsy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file is missing or contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VoxError::ConfigFileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                VoxError::Io(e)
            }
        })?;
        let table: toml::Table = toml::from_str(&contents)?;
        let mut config: Config = toml::Value::Table(table.clone()).try_into()?;

        let model_section = table.get("model").and_then(toml::Value::as_table);
        if model_section.is_some_and(|m| m.contains_key("model")) {
            config.sources.model = "config".to_string();
        }
        if model_section.is_some_and(|m| m.contains_key("endpoint")) {
            config.sources.endpoint = "config".to_string();
        }
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(VoxError::ConfigFileNotFound { .. }) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - AI_AGENT_MODEL → model.model
    /// - AI_AGENT_URL → model.endpoint (takes precedence over OLLAMA_HOST)
    /// - OLLAMA_HOST → model.endpoint
    /// - VOX_API_KEY → model.api_key
    /// - VOX_REFINE=0|false|no|off → refine.enabled = false
    /// - VOX_CACHE_ENABLED=1 → cache.enabled = true
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(model) = non_empty_env("AI_AGENT_MODEL") {
            self.model.model = model;
            self.sources.model = "AI_AGENT_MODEL".to_string();
        }

        if let Some(url) = non_empty_env("AI_AGENT_URL") {
            self.model.endpoint = url;
            self.sources.endpoint = "AI_AGENT_URL".to_string();
        } else if let Some(host) = non_empty_env("OLLAMA_HOST") {
            self.model.endpoint = if host.contains("://") {
                host
            } else {
                format!("http://{}", host)
            };
            self.sources.endpoint = "OLLAMA_HOST".to_string();
        }

        if let Some(key) = non_empty_env("VOX_API_KEY") {
            self.model.api_key = Some(key);
        }

        if let Ok(refine) = std::env::var("VOX_REFINE") {
            self.refine.enabled = !is_falsy(&refine);
        }

        if let Ok(cache) = std::env::var("VOX_CACHE_ENABLED")
            && matches!(cache.trim(), "1" | "true")
        {
            self.cache.enabled = true;
        }

        self
    }

    /// Check value ranges before any network call.
    pub fn validate(&self) -> Result<()> {
        if self.model.model.trim().is_empty() {
            return Err(VoxError::config("model.model", "must not be empty"));
        }
        let endpoint = self.model.endpoint.trim();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(VoxError::config(
                "model.endpoint",
                format!("must be an http(s) URL, got '{}'", self.model.endpoint),
            ));
        }
        if let Some(pointer) = &self.model.response_pointer
            && !pointer.is_empty()
            && !pointer.starts_with('/')
        {
            return Err(VoxError::config(
                "model.response_pointer",
                format!("must be a JSON pointer starting with '/', got '{}'", pointer),
            ));
        }
        if self.model.format.trim().is_empty() {
            return Err(VoxError::config("model.format", "must not be empty"));
        }

        let refine = &self.refine;
        if refine.max_chunk_size == 0 {
            return Err(VoxError::config(
                "refine.max_chunk_size",
                "must be greater than 0",
            ));
        }
        if refine.overlap_size >= refine.max_chunk_size {
            return Err(VoxError::config(
                "refine.overlap_size",
                format!(
                    "must be smaller than max_chunk_size ({} >= {})",
                    refine.overlap_size, refine.max_chunk_size
                ),
            ));
        }
        if refine.concurrency_limit == 0 {
            return Err(VoxError::config(
                "refine.concurrency_limit",
                "must be at least 1",
            ));
        }
        if refine.max_retry_attempts == 0 {
            return Err(VoxError::config(
                "refine.max_retry_attempts",
                "must be at least 1",
            ));
        }
        if refine.request_timeout_ms == 0 {
            return Err(VoxError::config(
                "refine.request_timeout_ms",
                "must be greater than 0",
            ));
        }
        if refine.retry_base_delay_ms > refine.retry_max_delay_ms {
            return Err(VoxError::config(
                "refine.retry_base_delay_ms",
                "must not exceed retry_max_delay_ms",
            ));
        }
        if !(0.0..=1.0).contains(&refine.fuzzy_overlap_ratio) {
            return Err(VoxError::config(
                "refine.fuzzy_overlap_ratio",
                format!(
                    "must be between 0.0 and 1.0, got {}",
                    refine.fuzzy_overlap_ratio
                ),
            ));
        }

        if self.cache.enabled && self.cache.max_size == 0 {
            return Err(VoxError::config(
                "cache.max_size",
                "must be greater than 0 when the cache is enabled",
            ));
        }
        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/voxcompose/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("voxcompose")
            .join("config.toml")
    }

    fn to_toml_value(&self) -> Result<toml::Value> {
        toml::Value::try_from(self)
            .map_err(|e| VoxError::Other(format!("Failed to serialize config: {}", e)))
    }

    /// Read a value by dotted key (e.g. `refine.max_chunk_size`).
    pub fn get_value_by_path(&self, key: &str) -> Result<String> {
        let root = self.to_toml_value()?;
        let mut current = &root;
        for part in key.split('.') {
            current = current
                .get(part)
                .ok_or_else(|| VoxError::config(key, "unknown or unset key"))?;
        }
        Ok(match current {
            toml::Value::String(s) => s.clone(),
            toml::Value::Table(t) => toml::to_string_pretty(t)
                .map_err(|e| VoxError::Other(e.to_string()))?
                .trim_end()
                .to_string(),
            other => other.to_string(),
        })
    }

    /// Write a value by dotted key into the config file, creating it if needed.
    ///
    /// The value is parsed according to the type of the setting, and the
    /// resulting file must still be a valid configuration.
    pub fn set_value_by_path(path: &Path, key: &str, value: &str) -> Result<()> {
        let template = Self::key_template()?;
        let mut expected = &template;
        for part in key.split('.') {
            expected = expected
                .get(part)
                .ok_or_else(|| VoxError::config(key, "unknown key"))?;
        }
        let parsed = parse_typed(key, value, expected)?;

        let mut table: toml::Table = if path.exists() {
            toml::from_str(&fs::read_to_string(path)?)?
        } else {
            toml::Table::new()
        };

        let parts: Vec<&str> = key.split('.').collect();
        let Some((leaf, sections)) = parts.split_last() else {
            return Err(VoxError::config(key, "empty key"));
        };
        let mut current = &mut table;
        for section in sections {
            current = current
                .entry(section.to_string())
                .or_insert_with(|| toml::Value::Table(toml::Table::new()))
                .as_table_mut()
                .ok_or_else(|| VoxError::config(key, format!("'{}' is not a section", section)))?;
        }
        current.insert(leaf.to_string(), parsed);

        let config: Config = toml::Value::Table(table.clone()).try_into()?;
        config.validate()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(&table)
            .map_err(|e| VoxError::Other(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Every settable key with a value of its type.
    fn key_template() -> Result<toml::Value> {
        let mut config = Config::default();
        config.model.api_key = Some(String::new());
        config.model.response_pointer = Some(String::new());
        config.memory.path = Some(PathBuf::new());
        config.to_toml_value()
    }

    /// Full configuration as TOML, with the API key masked.
    pub fn to_display_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if shown.model.api_key.is_some() {
            shown.model.api_key = Some("********".to_string());
        }
        let mut out = toml::to_string_pretty(&shown)
            .map_err(|e| VoxError::Other(format!("Failed to serialize config: {}", e)))?;
        out.push_str(&format!(
            "\n# model source: {}\n# endpoint source: {}\n",
            self.sources.model, self.sources.endpoint
        ));
        Ok(out)
    }

    /// One section as TOML (e.g. `refine`).
    pub fn display_section(&self, section: &str) -> Result<String> {
        if section == "model" && self.model.api_key.is_some() {
            let mut shown = self.clone();
            shown.model.api_key = Some("********".to_string());
            return shown.get_value_by_path(section);
        }
        self.get_value_by_path(section)
    }

    /// Commented configuration template.
    pub fn dump_template() -> &'static str {
        CONFIG_TEMPLATE
    }
}

fn parse_typed(key: &str, value: &str, expected: &toml::Value) -> Result<toml::Value> {
    let invalid = |kind: &str| VoxError::config(key, format!("expected {}, got '{}'", kind, value));
    Ok(match expected {
        toml::Value::Boolean(_) => match value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => toml::Value::Boolean(true),
            "false" | "0" | "no" | "off" => toml::Value::Boolean(false),
            _ => return Err(invalid("a boolean")),
        },
        toml::Value::Integer(_) => {
            let n: i64 = value.trim().parse().map_err(|_| invalid("an integer"))?;
            if n < 0 {
                return Err(invalid("a non-negative integer"));
            }
            toml::Value::Integer(n)
        }
        toml::Value::Float(_) => {
            toml::Value::Float(value.trim().parse().map_err(|_| invalid("a number"))?)
        }
        toml::Value::String(_) => toml::Value::String(value.to_string()),
        _ => return Err(VoxError::config(key, "is a section, not a value")),
    })
}

const CONFIG_TEMPLATE: &str = r#"# voxcompose configuration
# Location: ~/.config/voxcompose/config.toml

[model]
# Backend dialect: "ollama" or "openai"
provider = "ollama"
# Base URL; /api/generate or /v1/chat/completions is appended
endpoint = "http://127.0.0.1:11434"
model = "llama3.1"
# Bearer token for OpenAI-compatible backends (or set VOX_API_KEY)
# api_key = ""
# JSON pointer to the refined text in the response
# response_pointer = "/response"
format = "markdown"

[refine]
enabled = true
# Chunk size and overlap in characters
max_chunk_size = 6000
overlap_size = 300
concurrency_limit = 4
# Total attempts per chunk, including the first
max_retry_attempts = 3
request_timeout_ms = 60000
retry_base_delay_ms = 500
retry_max_delay_ms = 8000
# Send chunks one at a time with the previous refined fragment as context
strict_continuity = false
# Emit a document with placeholders when chunks fail
partial_on_failure = false
continuity_tail_chars = 400
min_overlap_chars = 12
max_overlap_chars = 2000
# Fraction of words that may differ in a boundary match (0 disables fuzzy matching)
fuzzy_overlap_ratio = 0.15

[cache]
enabled = false
max_size = 100
ttl_ms = 3600000

[memory]
# JSONL file of preferences and glossary items ({"text": "..."} per line)
# path = "~/.config/voxcompose/memory.jsonl"
max_items = 20
"#;
