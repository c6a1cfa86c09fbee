//! Configuration loading and validation for ark-relay.
//!
//! Settings come from three layers, highest precedence first:
//! an optional TOML file (with `${VAR}` expansion in upstream values),
//! the `ARK_*` environment variables, and built-in defaults.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};
use std::path::Path;

/// Environment variable holding the upstream API credential.
pub const API_KEY_VAR: &str = "ARK_API_KEY";
/// Environment variable holding the upstream model (endpoint) identifier.
pub const MODEL_ID_VAR: &str = "ARK_MODEL_ID";
/// Environment variable overriding the upstream base URL.
pub const BASE_URL_VAR: &str = "ARK_BASE_URL";

/// Upstream base URL used when neither the file nor the environment sets one.
pub const DEFAULT_BASE_URL: &str = "https://ark.cn-beijing.volces.com/api/v3";

/// Root configuration structure.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub cors: CorsConfig,
    pub upstream: UpstreamConfig,
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "0.0.0.0:5000")
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "0.0.0.0:5000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Cross-origin policy: a single exact origin is allowed.
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    /// Origin permitted to call the relay (must match exactly)
    #[serde(default = "default_allowed_origin")]
    pub allowed_origin: String,
    /// How long browsers may cache a preflight result
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

fn default_allowed_origin() -> String {
    "http://localhost:8080".to_string()
}

fn default_max_age_secs() -> u64 {
    3600
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origin: default_allowed_origin(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// The raw value is only reachable through `.expose_secret()`.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value. Every call site is auditable via `grep expose_secret`.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// Upstream chat-completion provider settings.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Bearer credential; absence is tolerated until a request needs it
    pub api_key: Option<ApiKey>,
    /// Base URL; `/chat/completions` is appended per call
    pub base_url: String,
    /// Model or endpoint identifier; absence is tolerated until a request needs it
    pub model_id: Option<String>,
    /// Whole-request timeout. `None` waits on the provider indefinitely.
    pub timeout_secs: Option<u64>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model_id: None,
            timeout_secs: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "ark_relay=info,tower_http=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for setting '{setting}': {message}")]
    EnvVar {
        var: String,
        setting: String,
        message: String,
    },
}

/// Raw upstream table as written in TOML; values may still contain `${VAR}`.
#[derive(Default, Deserialize)]
pub struct RawUpstreamConfig {
    api_key: Option<String>,
    base_url: Option<String>,
    model_id: Option<String>,
    timeout_secs: Option<u64>,
}

/// Raw configuration deserialized directly from TOML.
#[derive(Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    cors: CorsConfig,
    #[serde(default)]
    upstream: RawUpstreamConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string (e.g., `${SCHEME}://${HOST}/v3`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, setting: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            setting: setting.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                setting: setting.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            setting: setting.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced in '{}')",
                var_name, setting
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Resolve one upstream string setting.
///
/// A value from the file wins (after `${VAR}` expansion); otherwise the
/// named environment variable is consulted. Empty values count as unset.
fn resolve_setting<F>(
    file_value: Option<String>,
    setting: &str,
    env_var: &str,
    lookup: &F,
) -> Result<Option<String>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = match file_value {
        Some(raw) => Some(expand_env_vars_with(&raw, setting, lookup)?),
        None => lookup(env_var),
    };
    Ok(value.filter(|v| !v.trim().is_empty()))
}

impl Config {
    /// Build configuration from the process environment and defaults only.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_raw_with(RawConfig::default(), |name| std::env::var(name).ok())
    }

    /// Load configuration from a TOML file, overlaying the process environment.
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        let raw: RawConfig = toml::from_str(&content).map_err(ConfigError::Parse)?;
        Self::from_raw_with(raw, |name| std::env::var(name).ok())
    }

    /// Load from `path` when given, otherwise from the environment alone.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file_with_env(path),
            None => Self::from_env(),
        }
    }

    /// Convert raw (deserialized) config to final config.
    ///
    /// The closure-based lookup keeps this testable without touching global env state.
    pub fn from_raw_with<F>(raw: RawConfig, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let upstream = raw.upstream;

        let api_key = resolve_setting(upstream.api_key, "upstream.api_key", API_KEY_VAR, &lookup)?
            .map(ApiKey::from);
        let model_id =
            resolve_setting(upstream.model_id, "upstream.model_id", MODEL_ID_VAR, &lookup)?;
        let base_url =
            resolve_setting(upstream.base_url, "upstream.base_url", BASE_URL_VAR, &lookup)?
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let config = Config {
            server: raw.server,
            cors: raw.cors,
            upstream: UpstreamConfig {
                api_key,
                base_url,
                model_id,
                timeout_secs: upstream.timeout_secs,
            },
            logging: raw.logging,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        let base_url = &self.upstream.base_url;
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::Validation(format!(
                "upstream.base_url must be an http(s) URL, got '{}'",
                base_url
            )));
        }

        if self.upstream.timeout_secs == Some(0) {
            return Err(ConfigError::Validation(
                "upstream.timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.cors.allowed_origin.is_empty()
            || axum::http::HeaderValue::from_str(&self.cors.allowed_origin).is_err()
        {
            return Err(ConfigError::Validation(format!(
                "cors.allowed_origin is not a valid origin: '{}'",
                self.cors.allowed_origin
            )));
        }

        Ok(())
    }

    /// Names of required upstream settings that are absent.
    ///
    /// Missing settings are not fatal; requests fail individually later.
    pub fn missing_settings(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.upstream.api_key.is_none() {
            missing.push(API_KEY_VAR);
        }
        if self.upstream.model_id.is_none() {
            missing.push(MODEL_ID_VAR);
        }
        missing
    }

    /// Log which upstream settings are present.
    pub fn log_presence(&self) {
        tracing::info!(
            api_key_present = self.upstream.api_key.is_some(),
            model_id_present = self.upstream.model_id.is_some(),
            base_url = %self.upstream.base_url,
            "Upstream settings loaded"
        );

        for setting in self.missing_settings() {
            tracing::warn!(
                setting,
                "Required upstream setting is not set - completion requests will fail"
            );
        }
    }
}
