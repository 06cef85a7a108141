//! Named boolean flags shared through the manager.
//!
//! Every runtime registers its own closing flag, and the spawner and workers
//! it started observe that flag. A client shutting down therefore stops its
//! own workers without touching the host's.
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

/// A store of named flags. Unknown names read as unset.
#[async_trait]
pub trait Flags: Send + Sync {
    async fn get(&self, name: &str) -> Result<bool>;

    async fn set(&self, name: &str, value: bool) -> Result<()>;

    /// Forget a flag. It reads as unset afterwards.
    async fn remove(&self, name: &str) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct InMemoryFlags {
    values: Arc<DashMap<String, bool>>,
}

impl InMemoryFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of flags currently stored, set or not.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl Flags for InMemoryFlags {
    async fn get(&self, name: &str) -> Result<bool> {
        Ok(self.values.get(name).map_or(false, |value| *value))
    }

    async fn set(&self, name: &str, value: bool) -> Result<()> {
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.values.remove(name);
        Ok(())
    }
}

/// A handle to one named flag.
#[derive(Clone)]
pub struct Flag {
    flags: Arc<dyn Flags>,
    name: String,
}

impl Flag {
    pub fn new(flags: Arc<dyn Flags>, name: impl Into<String>) -> Self {
        Self {
            flags,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn is_set(&self) -> Result<bool> {
        self.flags.get(&self.name).await
    }

    pub async fn set(&self) -> Result<()> {
        self.flags.set(&self.name, true).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.flags.set(&self.name, false).await
    }

    /// Drop the flag from the store once nobody observes it anymore.
    pub async fn remove(&self) -> Result<()> {
        self.flags.remove(&self.name).await
    }
}

impl std::fmt::Debug for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Flag").field(&self.name).finish()
    }
}
