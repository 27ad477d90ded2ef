//! Server configuration
//!
//! [`LocalLabConfig`] is assembled once at startup and passed explicitly into
//! each component's constructor. It can be read from any format the `config`
//! crate supports (YAML, TOML, JSON, INI, RON, JSON5).
//!
//! ## Sources, lowest precedence first
//!
//! - Built-in defaults
//! - The configuration file, after `${VAR}` / `$VAR` substitution
//! - `LOCALLAB_`-prefixed environment variables (`__` separates nested keys),
//!   e.g. `LOCALLAB_MAX_CONCURRENT_REQUESTS=4`

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use config::{Config as Cfg, Environment, File};
use error_stack::{Report, ResultExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::InferenceError;
use crate::types::{GenerationParams, ModelDescriptor, OptimizationConfig, QuantizationType};

pub use config::FileFormat;

/// Prefix of environment variables that override file settings
pub const ENV_PREFIX: &str = "LOCALLAB";

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for InferenceError {
    fn from(err: ConfigError) -> Self {
        InferenceError::Config(err.to_string())
    }
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Config result carrying the loading context (file path, source)
pub type ConfigReport<T> = Result<T, Report<ConfigError>>;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Configuration consumed by the inference core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalLabConfig {
    // --- model selection ---
    /// Model used when a request names none. Unset: most capable feasible model.
    pub default_model: Option<String>,
    /// Substitute a smaller model when the requested one cannot run
    pub allow_model_fallback: bool,
    /// Number of resident model instances (1 = single-model mode)
    pub max_loaded_models: usize,
    /// Unload models unused for this long. Unset: never.
    pub model_idle_timeout_secs: Option<u64>,
    pub idle_check_interval_secs: u64,
    pub load_retry_base_ms: u64,
    pub load_retry_max_ms: u64,

    // --- optimizations ---
    pub quantization_type: QuantizationType,
    pub enable_flash_attention: bool,
    pub enable_attention_slicing: bool,
    pub enable_cpu_offloading: bool,
    pub enable_better_transformer: bool,

    // --- scheduling ---
    pub max_concurrent_requests: usize,
    pub enable_dynamic_batching: bool,
    pub max_batch_size: usize,
    pub batch_timeout_ms: u64,
    /// Requests allowed to wait for a concurrency slot. 0: refuse immediately.
    pub queue_capacity: usize,
    pub queue_timeout_ms: u64,

    // --- response cache ---
    pub enable_cache: bool,
    pub cache_ttl_seconds: u64,
    pub cache_max_entries: usize,
    pub cache_sweep_interval_secs: u64,

    // --- resources ---
    /// Safety margin kept free on top of a model's requirements (MB)
    pub min_free_memory_mb: u64,
    pub resource_refresh_interval_ms: u64,
    /// Per-token KV-cache estimate used for request admission (KB)
    pub kv_cache_kb_per_token: u64,

    // --- generation defaults ---
    pub default_max_tokens: usize,
    pub default_temperature: f32,
    pub default_top_p: f32,

    // --- logging ---
    pub log_level: String,
    pub log_format: LogFormat,

    /// Model registry table
    pub models: Vec<ModelDescriptor>,
}

impl Default for LocalLabConfig {
    fn default() -> Self {
        Self {
            default_model: None,
            allow_model_fallback: false,
            max_loaded_models: 1,
            model_idle_timeout_secs: None,
            idle_check_interval_secs: 60,
            load_retry_base_ms: 1000,
            load_retry_max_ms: 60_000,
            quantization_type: QuantizationType::None,
            enable_flash_attention: false,
            enable_attention_slicing: false,
            enable_cpu_offloading: false,
            enable_better_transformer: false,
            max_concurrent_requests: 10,
            enable_dynamic_batching: true,
            max_batch_size: 8,
            batch_timeout_ms: 50,
            queue_capacity: 0,
            queue_timeout_ms: 5000,
            enable_cache: true,
            cache_ttl_seconds: 3600,
            cache_max_entries: 1000,
            cache_sweep_interval_secs: 60,
            min_free_memory_mb: 2048,
            resource_refresh_interval_ms: 1000,
            kv_cache_kb_per_token: 128,
            default_max_tokens: 512,
            default_temperature: 0.7,
            default_top_p: 0.9,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            models: Vec::new(),
        }
    }
}

impl LocalLabConfig {
    /// Load from a file, with `LOCALLAB_` environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigReport<Self> {
        Self::from_file_with_prefix(path, ENV_PREFIX)
    }

    /// Load from a file, with environment overrides under `env_prefix`.
    pub fn from_file_with_prefix(path: impl AsRef<Path>, env_prefix: &str) -> ConfigReport<Self> {
        let path = path.as_ref();
        let location = format!("config file: {}", path.display());

        let format = detect_format(path).attach(location.clone())?;
        let content = std::fs::read_to_string(path)
            .map_err(ConfigError::from)
            .attach(location.clone())?;

        let substituted = substitute_env_vars(&content);
        let config: Self = Cfg::builder()
            .add_source(File::from_str(&substituted, format))
            .add_source(env_source(env_prefix))
            .build()
            .and_then(Cfg::try_deserialize)
            .map_err(|e| ConfigError::Parse(e.to_string()))
            .attach(location.clone())?;

        config.validate().attach(location)?;
        debug!(
            path = %path.display(),
            models = config.models.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse an in-memory document. No environment overrides are applied.
    pub fn parse(content: &str, format: FileFormat) -> ConfigReport<Self> {
        let substituted = substitute_env_vars(content);
        let config: Self = Cfg::builder()
            .add_source(File::from_str(&substituted, format))
            .build()
            .and_then(Cfg::try_deserialize)
            .map_err(|e| ConfigError::Parse(e.to_string()))
            .attach("inline config document")?;

        config.validate().attach("inline config document")?;
        Ok(config)
    }

    /// Defaults plus `LOCALLAB_` environment overrides.
    pub fn from_env() -> ConfigReport<Self> {
        let config: Self = Cfg::builder()
            .add_source(env_source(ENV_PREFIX))
            .build()
            .and_then(Cfg::try_deserialize)
            .map_err(|e| ConfigError::Parse(e.to_string()))
            .attach("environment")?;

        config.validate().attach("environment")?;
        Ok(config)
    }

    /// Reject settings the core cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent_requests == 0 {
            return Err(invalid("max_concurrent_requests must be > 0"));
        }
        if self.max_batch_size == 0 {
            return Err(invalid("max_batch_size must be > 0"));
        }
        if self.max_loaded_models == 0 {
            return Err(invalid("max_loaded_models must be > 0"));
        }
        if self.enable_cache && self.cache_max_entries == 0 {
            return Err(invalid("cache_max_entries must be > 0 when the cache is enabled"));
        }
        if self.resource_refresh_interval_ms == 0 {
            return Err(invalid("resource_refresh_interval_ms must be > 0"));
        }
        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(invalid("default_temperature must be between 0.0 and 2.0"));
        }
        if !(self.default_top_p > 0.0 && self.default_top_p <= 1.0) {
            return Err(invalid("default_top_p must be in (0.0, 1.0]"));
        }
        if self.load_retry_base_ms > self.load_retry_max_ms {
            return Err(invalid("load_retry_base_ms must not exceed load_retry_max_ms"));
        }

        let mut seen = HashSet::new();
        for model in &self.models {
            if !seen.insert(model.id.as_str()) {
                return Err(invalid(format!("duplicate model id in registry: {}", model.id)));
            }
        }
        Ok(())
    }

    /// Optimization flags forwarded to the lifecycle manager.
    pub fn optimization_config(&self) -> OptimizationConfig {
        OptimizationConfig {
            quantization: self.quantization_type,
            flash_attention: self.enable_flash_attention,
            attention_slicing: self.enable_attention_slicing,
            cpu_offload: self.enable_cpu_offloading,
            better_transformer: self.enable_better_transformer,
        }
    }

    /// Sampling defaults for requests that do not override them.
    pub fn default_params(&self) -> GenerationParams {
        GenerationParams {
            max_tokens: Some(self.default_max_tokens),
            temperature: self.default_temperature,
            top_p: self.default_top_p,
            stop: Vec::new(),
        }
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs.max(1))
    }

    pub fn resource_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.resource_refresh_interval_ms)
    }

    pub fn model_idle_timeout(&self) -> Option<Duration> {
        self.model_idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs.max(1))
    }

    pub fn load_retry_base(&self) -> Duration {
        Duration::from_millis(self.load_retry_base_ms)
    }

    pub fn load_retry_max(&self) -> Duration {
        Duration::from_millis(self.load_retry_max_ms)
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

fn env_source(prefix: &str) -> Environment {
    Environment::with_prefix(prefix)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

/// Detect configuration format from file extension
///
/// # Supported Extensions
///
/// - YAML: `.yaml`, `.yml`
/// - TOML: `.toml`
/// - JSON: `.json`
/// - INI: `.ini`
/// - RON: `.ron`
/// - JSON5: `.json5`
pub fn detect_format(path: &Path) -> ConfigResult<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        "ini" => Ok(FileFormat::Ini),
        "ron" => Ok(FileFormat::Ron),
        "json5" => Ok(FileFormat::Json5),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

static BRACED_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("braced env var pattern is valid")
});

static SIMPLE_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").expect("simple env var pattern is valid")
});

/// Substitute environment variables in a string
///
/// Supports both `${VAR_NAME}` and `$VAR_NAME`. References to unset
/// variables are left untouched.
pub fn substitute_env_vars(content: &str) -> String {
    let braced = BRACED_VAR.replace_all(content, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    });

    SIMPLE_VAR
        .replace_all(&braced, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}
