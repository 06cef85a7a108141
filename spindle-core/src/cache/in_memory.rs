//! The manager-owned [`Cache`] implementation.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use super::{Cache, CacheRef};
use crate::error::{BrokerError, Result};

/// An in-memory [`Cache`].
///
/// Clones share the same entries. Entries live until removed explicitly; the
/// cache grows for the lifetime of the manager.
#[derive(Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<DashMap<CacheRef, Bytes>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn contains(&self, key: &CacheRef) -> Result<bool> {
        Ok(self.entries.contains_key(key))
    }

    async fn add(&self, key: &CacheRef, value: Bytes) -> Result<()> {
        debug!(key = %key, size = value.len(), "added cache item");
        self.entries.insert(key.clone(), value);
        Ok(())
    }

    async fn get(&self, key: &CacheRef) -> Result<Bytes> {
        self.entries
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BrokerError::NotFound(key.clone()))
    }

    async fn remove(&self, key: &CacheRef) -> Result<()> {
        if let Some((_, value)) = self.entries.remove(key) {
            debug!(key = %key, size = value.len(), "removed cache item");
        }
        Ok(())
    }
}
