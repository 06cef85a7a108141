//! Worker-side storage for large, immutable task inputs.
//!
//! A model that many tasks share (a triangle mesh, a tool description) is
//! encoded and stored once under a [`CacheRef`]. Tasks then carry only the
//! reference, and workers fetch the payload on first use.
//!
//! Types opt into this by implementing [`Cacheable`]; only arguments passed as
//! [`Arg::shared`](crate::task::Arg::shared) are substituted.
//!
//! ```
//! use spindle::cache::{CacheRef, Cacheable};
//!
//! struct Mesh {
//!     id: String,
//!     triangles: Vec<[[f64; 3]; 3]>,
//! }
//!
//! impl Cacheable for Mesh {
//!     fn cache_ref(&self) -> CacheRef {
//!         CacheRef::new(&self.id)
//!     }
//! }
//!
//! let mesh = Mesh { id: "part-17".into(), triangles: vec![] };
//! assert_eq!(mesh.cache_ref(), CacheRef::new("part-17"));
//! ```

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// A typed handle for a cached payload.
///
/// Equality, ordering and hashing are those of the wrapped identifier, so two
/// references to the same identifier are interchangeable as map keys.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub struct CacheRef(String);

impl CacheRef {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self(identifier.into())
    }

    /// The wrapped identifier.
    pub fn identifier(&self) -> &str {
        &self.0
    }
}

impl From<Uuid> for CacheRef {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CacheRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capability of a value to be cached at the worker side.
///
/// The reference must be stable for the lifetime of the value's contents: two
/// values with different contents must never share a reference.
pub trait Cacheable {
    fn cache_ref(&self) -> CacheRef;
}

/// A key/value store for encoded payloads, shared by every process attached
/// to a manager.
///
/// There is no ordering between an `add` and a concurrent `get` of the same
/// key: submitters add entries before enqueueing any task that references
/// them.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn contains(&self, key: &CacheRef) -> Result<bool>;

    /// Store a payload. An existing entry is overwritten.
    async fn add(&self, key: &CacheRef, value: Bytes) -> Result<()>;

    /// Fetch a payload, failing with
    /// [`BrokerError::NotFound`](crate::error::BrokerError::NotFound) if absent.
    async fn get(&self, key: &CacheRef) -> Result<Bytes>;

    /// Drop a payload. Removing an absent key is a no-op.
    async fn remove(&self, key: &CacheRef) -> Result<()>;
}

pub mod in_memory;
