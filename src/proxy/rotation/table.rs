//! In-process rotation table

use async_trait::async_trait;
use dashmap::DashMap;

use super::RotationStore;
use crate::config::redact;
use crate::error::{GatewayError, Result};

/// Per-token round-robin cursors held in process memory
///
/// The `DashMap` entry guard holds the shard lock across the read and the
/// write, so each draw is a single critical section per token. State is
/// volatile and lost on restart; replicas do not share cursors.
#[derive(Debug, Default)]
pub struct InMemoryRotationTable {
    cursors: DashMap<String, usize>,
}

impl InMemoryRotationTable {
    pub fn new() -> Self {
        Self {
            cursors: DashMap::new(),
        }
    }

    /// Synchronous draw; the async trait method delegates here
    pub fn draw(&self, token: &str, pool_size: usize) -> Result<usize> {
        if pool_size == 0 {
            return Err(GatewayError::EmptyKeyPool {
                token: redact(token),
            });
        }

        let mut cursor = self.cursors.entry(token.to_string()).or_insert(0);
        let current = *cursor % pool_size;
        *cursor = (current + 1) % pool_size;
        Ok(current)
    }

    /// Current cursor for a token, if it has been drawn from
    #[cfg(test)]
    pub fn peek(&self, token: &str) -> Option<usize> {
        self.cursors.get(token).map(|c| *c)
    }
}

#[async_trait]
impl RotationStore for InMemoryRotationTable {
    async fn take_next(&self, token: &str, pool_size: usize) -> Result<usize> {
        self.draw(token, pool_size)
    }

    fn tracked_tokens(&self) -> usize {
        self.cursors.len()
    }
}
