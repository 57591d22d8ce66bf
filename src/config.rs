use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{GatewayError, Result};

const DEFAULT_KEYS_FILE: &str = "config/config.json";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Upstream and key pool configuration
    pub upstream: UpstreamConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port for the gateway (default: 8124)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpstreamConfig {
    /// Virtual token -> ordered pool of real upstream keys
    pub keys: HashMap<String, Vec<String>>,
    /// Explicit base URL override
    pub base_url: Option<String>,
    /// Telemetry relay credential; enables the relay endpoint and headers
    pub relay_key: Option<String>,
    /// Connect timeout for the upstream call
    pub connect_timeout: Duration,
    /// Maximum wait between two upstream body reads
    pub idle_timeout: Duration,
    /// How the response body is split into flush units
    pub flush: FlushGranularity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushGranularity {
    /// One frame per decoded character
    #[default]
    Char,
    /// One frame per upstream read, trimmed to a character boundary
    Chunk,
}

impl FlushGranularity {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "char" | "character" | "" => Ok(Self::Char),
            "chunk" => Ok(Self::Chunk),
            other => Err(GatewayError::InvalidConfig(format!(
                "STREAM_FLUSH must be 'char' or 'chunk', got '{}'",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Char => "char",
            Self::Chunk => "chunk",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

/// On-disk key file layout
#[derive(Debug, Default, Deserialize)]
struct KeyFile {
    #[serde(default)]
    keys: HashMap<String, Vec<String>>,
    #[serde(default)]
    base_url: String,
    #[serde(default)]
    helicone: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let key_file = load_key_file()?;

        let base_url = non_empty(get_env_or("UPSTREAM_BASE_URL", &key_file.base_url));
        let relay_key = non_empty(get_env_or("TELEMETRY_RELAY_KEY", &key_file.helicone));

        let config = Config {
            server: ServerConfig {
                port: get_env_or("PROXY_PORT", "8124").parse().map_err(|_| {
                    GatewayError::InvalidConfig("PROXY_PORT must be a valid port number".into())
                })?,
                host: get_env_or("PROXY_HOST", "0.0.0.0"),
            },
            upstream: UpstreamConfig {
                keys: key_file.keys,
                base_url,
                relay_key,
                connect_timeout: Duration::from_secs(parse_secs("UPSTREAM_CONNECT_TIMEOUT", 10)?),
                idle_timeout: Duration::from_secs(parse_secs("UPSTREAM_IDLE_TIMEOUT", 300)?),
                flush: FlushGranularity::from_str(&get_env_or("STREAM_FLUSH", "char"))?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        };

        config.upstream.validate()?;
        Ok(config)
    }

    /// Get the listener address
    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl UpstreamConfig {
    /// Reject pools that could never hand out a key and malformed overrides
    pub fn validate(&self) -> Result<()> {
        if let Some((token, _)) = self.keys.iter().find(|(_, pool)| pool.is_empty()) {
            return Err(GatewayError::InvalidConfig(format!(
                "key pool for '{}' must not be empty",
                redact(token)
            )));
        }

        if let Some(base_url) = &self.base_url {
            let url = Url::parse(base_url).map_err(|e| {
                GatewayError::InvalidConfig(format!("UPSTREAM_BASE_URL must be a valid URL: {}", e))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(GatewayError::InvalidConfig(format!(
                    "UPSTREAM_BASE_URL has unsupported scheme: {}",
                    url.scheme()
                )));
            }
        }

        Ok(())
    }
}

fn load_key_file() -> Result<KeyFile> {
    let explicit = env::var("PROXY_KEYS_FILE").ok().filter(|p| !p.trim().is_empty());
    let path = explicit.clone().unwrap_or_else(|| DEFAULT_KEYS_FILE.to_string());

    if explicit.is_none() && !Path::new(&path).exists() {
        return Ok(KeyFile::default());
    }

    let raw = std::fs::read_to_string(&path).map_err(|e| {
        GatewayError::InvalidConfig(format!("failed to read key file {}: {}", path, e))
    })?;

    serde_json::from_str(&raw).map_err(|e| {
        GatewayError::InvalidConfig(format!("failed to parse key file {}: {}", path, e))
    })
}

fn parse_secs(key: &str, default: u64) -> Result<u64> {
    let raw = get_env_or(key, &default.to_string());
    raw.trim()
        .parse()
        .map_err(|_| GatewayError::InvalidConfig(format!("{} must be a number of seconds", key)))
}

fn non_empty(value: String) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Keep enough of a token to identify it in logs
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{}***", prefix)
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
