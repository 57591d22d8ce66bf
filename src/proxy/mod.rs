//! Gateway pipeline
//!
//! This module provides the forwarding functionality including:
//! - Bearer credential parsing and virtual token classification
//! - Per-token round-robin rotation over upstream key pools
//! - Upstream endpoint selection and header sanitization
//! - Incremental streaming of upstream responses

pub mod cancel;
pub mod forwarder;
pub mod handler;
pub mod middleware;
pub mod relay;
pub mod rotation;
pub mod server;
pub mod upstream;

pub use cancel::{cancellation, Cancellation};
pub use forwarder::Forwarder;
pub use handler::ProxyHandler;
pub use relay::{RelayBody, StreamingRelay};
pub use rotation::{InMemoryRotationTable, KeyRotator, RotationStore};
pub use server::ProxyServer;
