//! Upstream key rotation
//!
//! Virtual tokens index a pool of real upstream keys. Each request draws the
//! next key from its token's pool in round-robin order; the draw position is
//! held by a [`RotationStore`] injected into the pipeline.

mod table;

pub use table::InMemoryRotationTable;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::redact;
use crate::error::{GatewayError, Result};
use crate::proxy::middleware::Credential;

/// Backing store for per-token rotation indices
///
/// `take_next` must be linearizable per token: two concurrent callers never
/// observe the same pre-increment index for the same draw.
#[async_trait]
pub trait RotationStore: Send + Sync {
    /// Return the index to use for this call and advance the token's cursor
    /// to `(index + 1) % pool_size`. Unseen tokens start at 0.
    async fn take_next(&self, token: &str, pool_size: usize) -> Result<usize>;

    /// Number of distinct tokens seen so far
    fn tracked_tokens(&self) -> usize;
}

/// Whether a credential went through a key pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenClass {
    Virtual,
    Direct,
}

impl TokenClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Virtual => "virtual",
            Self::Direct => "direct",
        }
    }
}

/// Credential to present upstream, resolved once per request
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamCredential {
    pub class: TokenClass,
    /// Position in the pool the key was drawn from (virtual tokens only)
    pub key_index: Option<usize>,
    key: String,
}

impl UpstreamCredential {
    /// Value for the outbound `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.key)
    }
}

// Keys never reach the logs.
impl std::fmt::Debug for UpstreamCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamCredential")
            .field("class", &self.class)
            .field("key_index", &self.key_index)
            .finish_non_exhaustive()
    }
}

/// Resolves client credentials into upstream credentials
#[derive(Clone)]
pub struct KeyRotator {
    pools: Arc<HashMap<String, Vec<String>>>,
    store: Arc<dyn RotationStore>,
}

impl KeyRotator {
    pub fn new(pools: HashMap<String, Vec<String>>, store: Arc<dyn RotationStore>) -> Self {
        Self {
            pools: Arc::new(pools),
            store,
        }
    }

    /// Draw the key for a virtual token, or pass a direct token through
    pub async fn resolve(&self, credential: &Credential) -> Result<UpstreamCredential> {
        match credential {
            Credential::Direct(token) => Ok(UpstreamCredential {
                class: TokenClass::Direct,
                key_index: None,
                key: token.clone(),
            }),
            Credential::Virtual(token) => {
                let pool = self.pools.get(token).ok_or(GatewayError::UnknownToken)?;
                let index = self.store.take_next(token, pool.len()).await?;
                let key = pool.get(index).cloned().ok_or_else(|| GatewayError::EmptyKeyPool {
                    token: redact(token),
                })?;

                debug!(
                    token = %redact(token),
                    key_index = index,
                    pool_size = pool.len(),
                    "Drew upstream key"
                );

                Ok(UpstreamCredential {
                    class: TokenClass::Virtual,
                    key_index: Some(index),
                    key,
                })
            }
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &Arc<dyn RotationStore> {
        &self.store
    }
}
