//! Bearer credential parsing
//!
//! Classifies the client's `Authorization` header into a virtual token
//! (backed by a key pool) or a direct token (forwarded as-is).

use hyper::header::{HeaderValue, AUTHORIZATION};
use hyper::HeaderMap;
use tracing::warn;

use crate::error::GatewayError;

const BEARER_PREFIX: &str = "Bearer ";

/// Marker prefix for tokens resolved through a key pool
pub const VIRTUAL_TOKEN_PREFIX: &str = "genai-";

/// A parsed client credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Indexes a server-side key pool
    Virtual(String),
    /// Sent upstream unchanged
    Direct(String),
}

impl Credential {
    fn classify(token: &str) -> Self {
        if token.starts_with(VIRTUAL_TOKEN_PREFIX) {
            Credential::Virtual(token.to_string())
        } else {
            Credential::Direct(token.to_string())
        }
    }
}

/// Result of parsing the authentication header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Missing,
    Malformed,
    Valid(Credential),
}

impl AuthOutcome {
    /// Parse a raw header value
    pub fn from_header(value: Option<&HeaderValue>) -> Self {
        let Some(value) = value else {
            return AuthOutcome::Missing;
        };
        if value.is_empty() {
            return AuthOutcome::Missing;
        }

        let Ok(raw) = value.to_str() else {
            return AuthOutcome::Malformed;
        };

        match raw.strip_prefix(BEARER_PREFIX) {
            Some(token) if !token.is_empty() => AuthOutcome::Valid(Credential::classify(token)),
            _ => AuthOutcome::Malformed,
        }
    }

    /// Parse the `Authorization` header out of a header map
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self::from_header(headers.get(AUTHORIZATION))
    }

    /// Turn a failed outcome into the matching client error
    pub fn into_credential(self) -> Result<Credential, GatewayError> {
        match self {
            AuthOutcome::Valid(credential) => Ok(credential),
            AuthOutcome::Missing => {
                warn!("Authorization header is missing");
                Err(GatewayError::MissingAuthHeader)
            }
            AuthOutcome::Malformed => {
                warn!("Invalid Authorization header format");
                Err(GatewayError::InvalidAuthHeader)
            }
        }
    }
}
