//! Gateway configuration — deserialization, env overrides, and validation.

use crate::error::GatewayError;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// Strip an env var reference to its variable name.
///
/// Accepts `${VAR_NAME}` syntax only. Returns `None` if the value is not a
/// valid env-var reference.
pub fn parse_env_ref(value: &str) -> Option<&str> {
    value.strip_prefix("${").and_then(|s| s.strip_suffix('}'))
}

/// Resolve a map of env-var references to their actual values.
///
/// Each value must be `${VAR}`. Unknown variables resolve to the empty string
/// (same as shell `${UNSET-}`).
pub fn resolve_env_vars(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            let resolved = match parse_env_ref(v) {
                Some(var_name) => std::env::var(var_name).unwrap_or_default(),
                None => v.clone(), // caught by validate(), but handle gracefully
            };
            (k.clone(), resolved)
        })
        .collect()
}

/// Resolve a single optional `${VAR}` reference, passing literals through.
pub fn resolve_env_ref(value: &str) -> String {
    match parse_env_ref(value) {
        Some(var_name) => std::env::var(var_name).unwrap_or_default(),
        None => value.to_string(),
    }
}

/// Top-level gateway configuration, parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
}

/// Listener and surface-wide settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token guarding admin routes. `${VAR}` references are resolved.
    pub bearer_token: Option<String>,
    /// Permitted CORS origins; `*` allows any.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Health-monitor probe interval in seconds.
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        GatewaySettings {
            host: default_host(),
            port: default_port(),
            bearer_token: None,
            cors_origins: Vec::new(),
            probe_interval_secs: default_probe_interval_secs(),
        }
    }
}

impl GatewaySettings {
    /// Apply `FMCP_*` environment overrides on top of file values.
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("FMCP_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("FMCP_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(token) = std::env::var("FMCP_BEARER_TOKEN") {
            self.bearer_token = Some(token);
        }
        if let Ok(origins) = std::env::var("FMCP_CORS_ORIGINS") {
            self.cors_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    /// Bearer token with any `${VAR}` reference resolved.
    pub fn resolved_bearer_token(&self) -> Option<String> {
        self.bearer_token
            .as_deref()
            .map(resolve_env_ref)
            .filter(|t| !t.is_empty())
    }
}

/// Restart policy for a supervised child process.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart automatically; manual restart is always permitted.
    No,
    /// Restart on abnormal exit, up to `max_restarts` attempts.
    #[default]
    OnFailure,
    /// Restart on any exit.
    Always,
}

/// Restart policy parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct RestartConfig {
    #[serde(default)]
    pub policy: RestartPolicy,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        RestartConfig {
            policy: RestartPolicy::OnFailure,
            max_restarts: default_max_restarts(),
            base_delay_secs: default_base_delay_secs(),
        }
    }
}

/// Configuration for a single supervised MCP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub install_path: Option<PathBuf>,
    /// Informational only; stdio children do not bind ports.
    pub port: Option<u16>,
    /// Optional HTTP health probe URL, checked by the monitor in addition to
    /// process liveness.
    pub probe_url: Option<String>,
    #[serde(default)]
    pub restart: RestartConfig,
    /// Substrings scanned for in stderr (e.g. OOM markers).
    #[serde(default = "default_stderr_markers")]
    pub stderr_markers: Vec<String>,
    /// Seconds to wait after the graceful shutdown request before killing.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Default JSON-RPC call deadline in seconds.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Per-stream deadline for SSE sessions in seconds.
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
    /// Lines retained in the stderr ring buffer.
    #[serde(default = "default_stderr_capacity")]
    pub stderr_capacity: usize,
}

/// Provider kinds for LLM model records.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Local OpenAI-compatible inference engine reached over HTTP.
    LocalEngine,
    /// Replicate-style asynchronous prediction API.
    Replicate,
}

impl ProviderKind {
    /// Label value for per-model telemetry series.
    pub fn label(&self) -> &'static str {
        match self {
            ProviderKind::LocalEngine => "local_engine",
            ProviderKind::Replicate => "replicate",
        }
    }
}

/// Modality tags a model may advertise.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Text,
    Vision,
    TextToImage,
    TextToVideo,
    ImageToVideo,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Text => "text",
            Capability::Vision => "vision",
            Capability::TextToImage => "text-to-image",
            Capability::TextToVideo => "text-to-video",
            Capability::ImageToVideo => "image-to-video",
        }
    }
}

/// Response-cache settings for one model.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

/// Token-bucket limiter settings for one model.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens per second.
    pub rate: f64,
    /// Burst capacity.
    pub capacity: f64,
    /// Wait (bounded) for a token instead of failing fast.
    #[serde(default)]
    pub wait: bool,
    #[serde(default = "default_limiter_wait_secs")]
    pub wait_timeout_secs: u64,
}

/// Retry-engine settings for one model.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: default_max_retries(),
            base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

/// Configuration for one LLM model record.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub provider: ProviderKind,
    /// Base URL of the provider (e.g. `http://127.0.0.1:8000` for a local
    /// engine, `https://api.replicate.com` for predictions).
    pub endpoint: String,
    /// Credential reference, `${VAR}` syntax (e.g. `${REPLICATE_API_TOKEN}`).
    pub api_token: Option<String>,
    /// Provider-side model identifier (e.g. Replicate `owner/name:version`).
    pub provider_model: Option<String>,
    /// Optional command for a gateway-supervised local engine process.
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub install_path: Option<PathBuf>,
    #[serde(default = "default_text_capabilities")]
    pub capabilities: Vec<Capability>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub cache: Option<CacheConfig>,
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Overall deadline for asynchronous predictions, seconds.
    #[serde(default = "default_prediction_deadline_secs")]
    pub prediction_deadline_secs: u64,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default = "default_stderr_markers")]
    pub stderr_markers: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8099
}

fn default_probe_interval_secs() -> u64 {
    10
}

fn default_max_restarts() -> u32 {
    3
}

fn default_base_delay_secs() -> u64 {
    1
}

fn default_stderr_markers() -> Vec<String> {
    vec!["cuda out of memory".to_string()]
}

fn default_grace_period_secs() -> u64 {
    5
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_stream_timeout_secs() -> u64 {
    300
}

fn default_stderr_capacity() -> usize {
    10_000
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_limiter_wait_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_prediction_deadline_secs() -> u64 {
    300
}

fn default_text_capabilities() -> Vec<Capability> {
    vec![Capability::Text]
}

/// Check an id: non-empty, alphanumeric plus `-` and `_`.
fn valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}

impl GatewayConfig {
    /// Parse a TOML document into a config without validating it.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| GatewayError::InvalidConfig("config".to_string(), e.to_string()))
    }

    /// Validate the config, failing fast on misconfigurations before any
    /// child is spawned.
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen: HashSet<&str> = HashSet::new();

        for config in self.servers.values() {
            if !seen.insert(config.id.as_str()) {
                return Err(GatewayError::DuplicateId(config.id.clone()));
            }
            if !config.enabled {
                continue;
            }
            let id = &config.id;

            if !valid_id(id) {
                return Err(GatewayError::InvalidConfig(
                    id.clone(),
                    "id must be non-empty alphanumeric with hyphens or underscores".to_string(),
                ));
            }
            if config.command.is_empty() {
                return Err(GatewayError::InvalidConfig(
                    id.clone(),
                    "server requires non-empty 'command' field".to_string(),
                ));
            }
            validate_env_refs(id, &config.env)?;
        }

        for config in self.models.values() {
            if !seen.insert(config.id.as_str()) {
                return Err(GatewayError::DuplicateId(config.id.clone()));
            }
            if !config.enabled {
                continue;
            }
            let id = &config.id;

            if !valid_id(id) {
                return Err(GatewayError::InvalidConfig(
                    id.clone(),
                    "id must be non-empty alphanumeric with hyphens or underscores".to_string(),
                ));
            }
            if config.endpoint.is_empty() {
                return Err(GatewayError::InvalidConfig(
                    id.clone(),
                    "model requires non-empty 'endpoint' field".to_string(),
                ));
            }
            match config.provider {
                ProviderKind::Replicate => {
                    if config.api_token.is_none() {
                        return Err(GatewayError::InvalidConfig(
                            id.clone(),
                            "replicate provider requires 'api_token' field".to_string(),
                        ));
                    }
                    if config.provider_model.is_none() {
                        return Err(GatewayError::InvalidConfig(
                            id.clone(),
                            "replicate provider requires 'provider_model' field".to_string(),
                        ));
                    }
                    if config.command.is_some() {
                        return Err(GatewayError::InvalidConfig(
                            id.clone(),
                            "replicate provider should not have 'command' field".to_string(),
                        ));
                    }
                }
                ProviderKind::LocalEngine => {}
            }
            if let Some(token) = &config.api_token {
                if parse_env_ref(token).is_none() {
                    return Err(GatewayError::InvalidConfig(
                        id.clone(),
                        format!("api_token must be a ${{VAR}} reference, got '{}'", token),
                    ));
                }
            }
            if let Some(rl) = &config.rate_limit {
                if rl.rate <= 0.0 || rl.capacity <= 0.0 {
                    return Err(GatewayError::InvalidConfig(
                        id.clone(),
                        "rate_limit rate and capacity must be positive".to_string(),
                    ));
                }
            }
            if let Some(cache) = &config.cache {
                if cache.enabled && (cache.ttl_secs == 0 || cache.capacity == 0) {
                    return Err(GatewayError::InvalidConfig(
                        id.clone(),
                        "cache ttl_secs and capacity must be positive".to_string(),
                    ));
                }
            }
            validate_env_refs(id, &config.env)?;
        }

        Ok(())
    }
}

/// Secrets in child env maps must be `${VAR}` references, never literals.
fn validate_env_refs(id: &str, env: &HashMap<String, String>) -> crate::Result<()> {
    for (key, value) in env {
        if parse_env_ref(value).is_none() {
            return Err(GatewayError::InvalidConfig(
                id.to_string(),
                format!(
                    "env value for key '{}' must be a ${{VAR}} reference, got '{}'",
                    key, value
                ),
            ));
        }
    }
    Ok(())
}
