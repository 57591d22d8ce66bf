//! Request-side middleware: credential parsing and header sanitization

mod auth;
mod sanitize;

pub use auth::{AuthOutcome, Credential, VIRTUAL_TOKEN_PREFIX};
pub use sanitize::{client_ip, sanitize, DENYLIST};
