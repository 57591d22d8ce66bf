use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use thiserror::Error;

use crate::proxy::relay::RelayBody;

/// Body sent to clients presenting an unregistered virtual token
pub const INVALID_TOKEN_BODY: &str = r#"{"error":{"message":"Invalid Token","code":403}}"#;

/// Unified error type for the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    // Authentication errors
    #[error("Authorization header is missing")]
    MissingAuthHeader,

    #[error("Invalid Authorization header format")]
    InvalidAuthHeader,

    #[error("Invalid Token")]
    UnknownToken,

    #[error("Key pool for virtual token {token} is empty")]
    EmptyKeyPool { token: String },

    // Upstream errors
    #[error("Error creating proxy request: {0}")]
    UpstreamRequestBuild(String),

    #[error("Error sending proxy request: {0}")]
    UpstreamCall(#[from] reqwest::Error),

    #[error("Error reading upstream response: {0}")]
    StreamRead(String),

    #[error("Upstream went idle")]
    IdleTimeout,

    #[error("Client disconnected")]
    ClientDisconnected,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            GatewayError::MissingAuthHeader | GatewayError::InvalidAuthHeader => {
                StatusCode::BAD_REQUEST
            }

            // 403 Forbidden
            GatewayError::UnknownToken => StatusCode::FORBIDDEN,

            // 504 Gateway Timeout
            GatewayError::IdleTimeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            GatewayError::EmptyKeyPool { .. }
            | GatewayError::UpstreamRequestBuild(_)
            | GatewayError::UpstreamCall(_)
            | GatewayError::StreamRead(_)
            | GatewayError::ClientDisconnected
            | GatewayError::InvalidConfig(_)
            | GatewayError::Io(_)
            | GatewayError::Http(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Message written to the client. Server faults get a generic line; the
    /// detail stays in the logs.
    pub fn client_message(&self) -> &'static str {
        match self {
            GatewayError::MissingAuthHeader => "Authorization header is missing",
            GatewayError::InvalidAuthHeader => "Invalid Authorization header format",
            GatewayError::UnknownToken => INVALID_TOKEN_BODY,
            GatewayError::UpstreamRequestBuild(_) | GatewayError::EmptyKeyPool { .. } => {
                "Error creating proxy request"
            }
            GatewayError::UpstreamCall(_) => "Error sending proxy request",
            GatewayError::StreamRead(_) | GatewayError::IdleTimeout => {
                "Error reading upstream response"
            }
            _ => "Internal server error",
        }
    }

    /// Render this error as a client-facing response
    pub fn into_response(self) -> Response<RelayBody> {
        let content_type = match self {
            GatewayError::UnknownToken => "application/json",
            _ => "text/plain; charset=utf-8",
        };

        let body = Full::new(Bytes::from_static(self.client_message().as_bytes()))
            .map_err(|never| match never {})
            .boxed_unsync();

        let mut response = Response::new(body);
        *response.status_mut() = self.status_code();
        response.headers_mut().insert(
            CONTENT_TYPE,
            hyper::header::HeaderValue::from_static(content_type),
        );
        response
    }
}
