//! Errors raised by the broker resources.
//!
//! Queue, cache, statistics and flag handles all return [`Result`], whether
//! they are backed by in-memory structures or proxied over a connection to a
//! remote manager. Callers match on the variants that carry a recovery
//! strategy ([`BrokerError::Timeout`], [`BrokerError::NotFound`]) and
//! propagate the rest.

use thiserror::Error;

use crate::cache::CacheRef;

#[derive(Error, Debug)]
pub enum BrokerError {
    /// Options that cannot be combined.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A bounded `get` found the queue empty for its whole timeout.
    #[error("timed out waiting for a queue item")]
    Timeout,

    /// The cache has no entry for the reference.
    #[error("cache entry not found: {0}")]
    NotFound(CacheRef),

    /// The manager refused the presented credentials.
    #[error("manager rejected the connection credentials")]
    Rejected,

    /// The connection to the manager is gone.
    #[error("connection to the manager was lost")]
    Disconnected,

    /// The manager failed to serve a request.
    #[error("manager error: {0}")]
    Remote(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BrokerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(value: std::io::Error) -> Self {
        Self::Other(value.into())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
