//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream realtime model settings.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Knowledge-search index settings.
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Relay behavior settings.
    #[serde(default)]
    pub relay: RelaySettings,

    /// Event log settings.
    #[serde(default)]
    pub events: EventsConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Upstream realtime model configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamConfig {
    /// WebSocket URL of the realtime endpoint.
    #[serde(default)]
    pub url: String,

    /// API key sent as the `api-key` header, if required.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Voice used for synthesized speech.
    #[serde(default)]
    pub voice: Option<String>,

    /// Server-enforced system prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Knowledge-search index configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    /// Base URL of the search service.
    #[serde(default)]
    pub endpoint: String,

    /// Name of the index to query.
    #[serde(default)]
    pub index: String,

    /// API key for the search service.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Passages requested per search.
    #[serde(default = "default_search_top")]
    pub top: usize,
}

/// Relay behavior knobs. These are policy defaults, not fixed semantics.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySettings {
    /// Bound on one retrieval round-trip, in seconds.
    #[serde(default = "default_retrieval_timeout_secs")]
    pub retrieval_timeout_secs: u64,

    /// Consecutive malformed frames tolerated before a session is closed.
    #[serde(default = "default_malformed_threshold")]
    pub malformed_frame_threshold: u32,

    /// Whether audio arriving before the upstream handshake is buffered.
    #[serde(default = "default_true")]
    pub buffer_while_connecting: bool,
}

/// Event log knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Retained events before oldest-first eviction.
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,

    /// Serialized payload size cap in bytes.
    #[serde(default = "default_payload_cap")]
    pub max_payload_bytes: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "parley_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8765
}

fn default_search_top() -> usize {
    5
}

fn default_retrieval_timeout_secs() -> u64 {
    10
}

fn default_malformed_threshold() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_event_capacity() -> usize {
    1000
}

fn default_payload_cap() -> usize {
    16 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            index: String::new(),
            api_key: None,
            top: default_search_top(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            retrieval_timeout_secs: default_retrieval_timeout_secs(),
            malformed_frame_threshold: default_malformed_threshold(),
            buffer_while_connecting: default_true(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
            max_payload_bytes: default_payload_cap(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `PARLEY_HOST` overrides `server.host`
/// - `PARLEY_PORT` overrides `server.port`
/// - `PARLEY_UPSTREAM_URL` overrides `upstream.url`
/// - `PARLEY_UPSTREAM_API_KEY` overrides `upstream.api_key`
/// - `PARLEY_VOICE` overrides `upstream.voice`
/// - `PARLEY_SEARCH_ENDPOINT` overrides `retrieval.endpoint`
/// - `PARLEY_SEARCH_INDEX` overrides `retrieval.index`
/// - `PARLEY_SEARCH_API_KEY` overrides `retrieval.api_key`
/// - `PARLEY_LOG_LEVEL` overrides `logging.level`
/// - `PARLEY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    // Environment variable overrides
    if let Ok(host) = std::env::var("PARLEY_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("PARLEY_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(url) = std::env::var("PARLEY_UPSTREAM_URL") {
        config.upstream.url = url;
    }
    if let Ok(key) = std::env::var("PARLEY_UPSTREAM_API_KEY") {
        config.upstream.api_key = Some(key);
    }
    if let Ok(voice) = std::env::var("PARLEY_VOICE") {
        config.upstream.voice = Some(voice);
    }
    if let Ok(endpoint) = std::env::var("PARLEY_SEARCH_ENDPOINT") {
        config.retrieval.endpoint = endpoint;
    }
    if let Ok(index) = std::env::var("PARLEY_SEARCH_INDEX") {
        config.retrieval.index = index;
    }
    if let Ok(key) = std::env::var("PARLEY_SEARCH_API_KEY") {
        config.retrieval.api_key = Some(key);
    }
    if let Ok(level) = std::env::var("PARLEY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("PARLEY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}
