//! Upstream endpoint selection

use crate::config::UpstreamConfig;

/// Provider endpoint used when nothing else is configured
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Telemetry relay endpoint, used when a relay credential is configured
pub const RELAY_BASE_URL: &str = "https://oai.hconeai.com";

/// Choose the base URL: explicit override, then the relay, then the default.
pub fn resolve_base_url(config: &UpstreamConfig) -> &str {
    if let Some(base_url) = config.base_url.as_deref().filter(|u| !u.is_empty()) {
        return base_url.trim_end_matches('/');
    }

    if config.relay_key.as_deref().is_some_and(|k| !k.is_empty()) {
        return RELAY_BASE_URL;
    }

    DEFAULT_BASE_URL
}
