//! GenAI Gateway - Streaming API gateway
//!
//! Forwards HTTP requests to a remote API provider while rewriting
//! credentials.
//!
//! ## Features
//!
//! - Virtual tokens backed by pools of real upstream keys, drawn round-robin
//! - Direct tokens passed through unchanged
//! - Optional telemetry relay with caller attribution headers
//! - Client and edge-network header stripping
//! - Character-safe incremental streaming with disconnect propagation

pub mod config;
pub mod error;
pub mod proxy;

pub use config::Config;
pub use error::{GatewayError, Result};
