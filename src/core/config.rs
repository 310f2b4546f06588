//! # Configuration
//!
//! Centralizes all settings with a clear override hierarchy:
//! defaults → config file → env vars → CLI flags.
//!
//! Config lives at `~/.konexion/config.toml`. If missing on first run, a
//! commented-out default is generated so users can discover all options.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::inference::providers::groq::DEFAULT_GROQ_BASE_URL;
use crate::inference::providers::ollama::{DEFAULT_OLLAMA_BASE_URL, DEFAULT_OLLAMA_MAX_TOKENS};

// ============================================================================
// Config Structs (all fields Option<T> for sparse TOML)
// ============================================================================

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct KonexionConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub groq: GroqConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub vision: VisionSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub cors_origins: Option<String>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct GroqConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct OllamaConfig {
    pub base_url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct VisionSection {
    /// Comma-separated model id keywords.
    pub models: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub file: Option<String>,
}

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_CORS_ORIGINS: &str = "*";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
pub const DEFAULT_GROQ_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_OLLAMA_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_VISION_MODELS: &str =
    "gemma3,llava,scout,maverick,vision,llama-3.2-11b-vision-preview,llama-3.2-90b-vision-preview";

// ============================================================================
// Resolved Config (concrete values, no Options)
// ============================================================================

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub system_prompt: String,
    pub groq_api_key: Option<String>,
    pub groq_base_url: String,
    pub groq_timeout: Duration,
    pub ollama_base_url: String,
    pub ollama_timeout: Duration,
    pub ollama_max_tokens: u32,
    pub vision_models: Vec<String>,
    pub log_level: String,
    pub log_file: Option<String>,
}

/// Values supplied on the command line. `None` = flag not given.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config I/O error: {e}"),
            ConfigError::Parse(e) => write!(f, "config parse error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Loading
// ============================================================================

/// Returns the path to `~/.konexion/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".konexion").join("config.toml"))
}

/// Load config from `explicit` or `~/.konexion/config.toml`.
///
/// A missing default file is generated (commented out) and yields
/// `KonexionConfig::default()`. A missing explicit file is an I/O error.
/// A malformed file returns `ConfigError::Parse`.
pub fn load_config(explicit: Option<&Path>) -> Result<KonexionConfig, ConfigError> {
    if let Some(path) = explicit {
        return read_config(path);
    }

    let path = match config_path() {
        Some(p) => p,
        None => {
            warn!("Could not determine home directory, using default config");
            return Ok(KonexionConfig::default());
        }
    };

    if !path.exists() {
        info!("No config file found, generating default at {}", path.display());
        generate_default_config(&path);
        return Ok(KonexionConfig::default());
    }

    read_config(&path)
}

fn read_config(path: &Path) -> Result<KonexionConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(ConfigError::Io)?;
    let config: KonexionConfig = toml::from_str(&contents).map_err(ConfigError::Parse)?;
    info!("Loaded config from {}", path.display());
    debug!("Config: {:?}", redacted(&config));
    Ok(config)
}

/// Debug view of the config with the API key masked.
fn redacted(config: &KonexionConfig) -> String {
    let shown = format!("{:?}", config);
    match config.groq.api_key.as_deref() {
        Some(key) if !key.is_empty() => shown.replace(key, "<redacted>"),
        _ => shown,
    }
}

/// Generates a commented-out default config file at the given path.
fn generate_default_config(path: &Path) {
    let default_content = r#"# Konexion Configuration
# All settings are optional. Defaults are used for anything not specified.
# Override hierarchy: defaults → this file → env vars → CLI flags.

# [server]
# host = "0.0.0.0"                   # Or SERVER_HOST / --host
# port = 8000                        # Or SERVER_PORT / --port
# cors_origins = "*"                 # Comma-separated, or CORS_ORIGINS
# system_prompt = "You are a helpful assistant."

# [groq]
# api_key = "gsk_..."                # Or set GROQ_API_KEY env var
# base_url = "https://api.groq.com/openai/v1"
# timeout_secs = 30

# [ollama]
# base_url = "http://localhost:11434"  # Or OLLAMA_URL
# timeout_secs = 30
# max_tokens = 2048

# [vision]
# models = "gemma3,llava,scout,maverick,vision"

# [logging]
# level = "info"                     # "off", "error", "warn", "info", "debug", "trace"
# file = "konexion.log"
"#;

    if let Some(parent) = path.parent()
        && let Err(e) = fs::create_dir_all(parent)
    {
        warn!("Failed to create config directory: {}", e);
        return;
    }
    if let Err(e) = fs::write(path, default_content) {
        warn!("Failed to write default config: {}", e);
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Resolve the final config from the process environment.
pub fn resolve(config: &KonexionConfig, cli: &CliOverrides) -> ResolvedConfig {
    resolve_with(config, cli, |key| std::env::var(key).ok())
}

/// Resolve the final config by collapsing: defaults → config file → env → CLI.
///
/// `lookup` reads one environment variable; blank values count as unset.
pub fn resolve_with<F>(config: &KonexionConfig, cli: &CliOverrides, lookup: F) -> ResolvedConfig
where
    F: Fn(&str) -> Option<String>,
{
    let env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let env_parsed = |key: &str| -> Option<u64> {
        let raw = env(key)?;
        match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring {key}={raw}: not a number");
                None
            }
        }
    };

    let host = cli
        .host
        .clone()
        .or_else(|| env("SERVER_HOST"))
        .or_else(|| config.server.host.clone())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = cli
        .port
        .or_else(|| env_parsed("SERVER_PORT").and_then(|p| u16::try_from(p).ok()))
        .or(config.server.port)
        .unwrap_or(DEFAULT_PORT);

    let cors_origins = split_list(
        &env("CORS_ORIGINS")
            .or_else(|| config.server.cors_origins.clone())
            .unwrap_or_else(|| DEFAULT_CORS_ORIGINS.to_string()),
        false,
    );

    let system_prompt = env("SYSTEM_PROMPT")
        .or_else(|| config.server.system_prompt.clone())
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

    // Groq API key: env → config. Blank keys mean "not configured".
    let groq_api_key = env("GROQ_API_KEY")
        .or_else(|| config.groq.api_key.clone())
        .filter(|key| !key.trim().is_empty());

    let groq_base_url = env("GROQ_BASE_URL")
        .or_else(|| config.groq.base_url.clone())
        .unwrap_or_else(|| DEFAULT_GROQ_BASE_URL.to_string());

    let groq_timeout = Duration::from_secs(
        env_parsed("GROQ_TIMEOUT")
            .or(config.groq.timeout_secs)
            .unwrap_or(DEFAULT_GROQ_TIMEOUT_SECS),
    );

    let ollama_base_url = env("OLLAMA_URL")
        .or_else(|| config.ollama.base_url.clone())
        .unwrap_or_else(|| DEFAULT_OLLAMA_BASE_URL.to_string());

    let ollama_timeout = Duration::from_secs(
        env_parsed("OLLAMA_TIMEOUT")
            .or(config.ollama.timeout_secs)
            .unwrap_or(DEFAULT_OLLAMA_TIMEOUT_SECS),
    );

    let ollama_max_tokens = env_parsed("OLLAMA_MAX_TOKENS")
        .and_then(|v| u32::try_from(v).ok())
        .or(config.ollama.max_tokens)
        .unwrap_or(DEFAULT_OLLAMA_MAX_TOKENS);

    let vision_models = split_list(
        &env("VISION_MODELS")
            .or_else(|| config.vision.models.clone())
            .unwrap_or_else(|| DEFAULT_VISION_MODELS.to_string()),
        true,
    );

    let log_level = cli
        .log_level
        .clone()
        .or_else(|| env("LOG_LEVEL"))
        .or_else(|| config.logging.level.clone())
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

    let log_file = env("LOG_FILE").or_else(|| config.logging.file.clone());

    ResolvedConfig {
        host,
        port,
        cors_origins,
        system_prompt,
        groq_api_key,
        groq_base_url,
        groq_timeout,
        ollama_base_url,
        ollama_timeout,
        ollama_max_tokens,
        vision_models,
        log_level,
        log_file,
    }
}

/// Splits a comma-separated list, trimming entries and dropping empty ones.
fn split_list(raw: &str, lowercase: bool) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| if lowercase { s.to_lowercase() } else { s.to_string() })
        .collect()
}
