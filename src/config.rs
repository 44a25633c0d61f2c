// Engine configuration.
//
// Loaded in order of precedence:
// 1. Environment variables (highest priority)
// 2. Config file (~/.config/subcaster/config.toml)
// 3. Built-in defaults (lowest priority)

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::domain::DisplayMode;
use crate::engine::OverwritePolicy;
use crate::governor::GovernorLimits;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Per-provider connection settings: base URL plus an optional
/// API-key-file path (the key itself is never stored in the config
/// file, matching the teacher's refusal to persist secrets inline).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_file: Option<PathBuf>,
    pub max_req_per_min: u32,
    pub max_tok_per_min: u32,
    pub fallback_models: Vec<String>,
    /// HTTP deadlines, in seconds: connect (TCP/TLS handshake), read
    /// (response body once headers arrive), and total (ceiling on the
    /// whole request).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_total_timeout_secs")]
    pub total_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_total_timeout_secs() -> u64 {
    60
}

impl ProviderSettings {
    fn local_http_default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            api_key_file: None,
            max_req_per_min: u32::MAX,
            max_tok_per_min: u32::MAX,
            fallback_models: Vec::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            total_timeout_secs: default_total_timeout_secs(),
        }
    }

    fn cloud_openai_default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key_file: Some(PathBuf::from("~/.config/subcaster/openai.key")),
            max_req_per_min: 500,
            max_tok_per_min: 90_000,
            fallback_models: Vec::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            total_timeout_secs: default_total_timeout_secs(),
        }
    }

    pub fn governor_limits(&self) -> GovernorLimits {
        GovernorLimits {
            max_req_per_min: self.max_req_per_min,
            max_tok_per_min: self.max_tok_per_min,
        }
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.read_timeout_secs)
    }

    pub fn total_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.total_timeout_secs)
    }
}

/// Translation run defaults, overridable per-invocation by CLI flags.
/// Field names mirror the CLI flag names (minus dashes) so
/// `EngineConfig::apply_cli_overrides` can stay declarative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    pub parallelism: usize,
    pub display_mode: DisplayMode,
    pub context_window: usize,
    pub preserve_punctuation: bool,
    pub use_cache: bool,
    pub glossary_names: Vec<String>,
    pub overwrite_policy: OverwritePolicyConfig,
    pub output_dir: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            parallelism: 4,
            display_mode: DisplayMode::default(),
            context_window: 3,
            preserve_punctuation: true,
            use_cache: true,
            glossary_names: Vec::new(),
            overwrite_policy: OverwritePolicyConfig::Ask,
            output_dir: None,
        }
    }
}

/// Serializable mirror of `engine::OverwritePolicy` (kept separate so
/// the engine module doesn't need a `serde` dependency on its own
/// enum for an unrelated reason).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicyConfig {
    Ask,
    Overwrite,
    Rename,
    Skip,
}

impl From<OverwritePolicyConfig> for OverwritePolicy {
    fn from(value: OverwritePolicyConfig) -> Self {
        match value {
            OverwritePolicyConfig::Ask => OverwritePolicy::Ask,
            OverwritePolicyConfig::Overwrite => OverwritePolicy::Overwrite,
            OverwritePolicyConfig::Rename => OverwritePolicy::Rename,
            OverwritePolicyConfig::Skip => OverwritePolicy::Skip,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Root configuration object. Cheap to clone; the CLI loads one copy
/// per invocation and hands `Arc`-wrapped pieces of it to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub default_provider: String,
    pub default_model: String,
    pub providers: HashMap<String, ProviderSettings>,
    pub options: Options,
    pub logging: LoggingConfig,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub max_batch_size: usize,
    /// `last_used` cutoff, in days, for the cache's lazy daily sweep.
    #[serde(default = "default_cache_retention_days")]
    pub cache_retention_days: u32,
}

fn default_cache_retention_days() -> u32 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert("local_http".to_string(), ProviderSettings::local_http_default());
        providers.insert("cloud_openai".to_string(), ProviderSettings::cloud_openai_default());

        Self {
            data_dir: default_data_dir(),
            default_provider: "local_http".to_string(),
            default_model: "llama3".to_string(),
            providers,
            options: Options::default(),
            logging: LoggingConfig::default(),
            min_concurrency: 1,
            max_concurrency: 16,
            max_batch_size: 50,
            cache_retention_days: 30,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("subcaster")
}

impl EngineConfig {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("subcaster").join("config.toml"))
    }

    /// Environment variables take precedence over the file, which
    /// takes precedence over built-in defaults.
    pub fn from_env() -> Self {
        let mut config = Self::config_path()
            .filter(|p| p.exists())
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|raw| toml::from_str(&raw).ok())
            .unwrap_or_default();

        if let Ok(dir) = std::env::var("SUBCASTER_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(provider) = std::env::var("SUBCASTER_PROVIDER") {
            config.default_provider = provider;
        }
        if let Ok(model) = std::env::var("SUBCASTER_MODEL") {
            config.default_model = model;
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            config.logging.level = level;
        }

        config
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };
        if path.exists() {
            return;
        }
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(&path, Self::default().to_toml());
    }

    pub fn provider_settings(&self, provider: &str) -> Option<&ProviderSettings> {
        self.providers.get(provider)
    }
}
