//! Encoding of everything that crosses a process boundary.
//!
//! Tasks, results, cached payloads and wire frames are all encoded with the
//! same [`Serializer`], chosen once in the [`Config`] and carried inside every
//! [`Task`](crate::task::Task) so a worker decodes arguments with the format
//! the submitter used.
//!
//! # Examples
//!
//! ```rust
//! use spindle::serializer::Serializer;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Segment {
//!    start: (f64, f64),
//!    end: (f64, f64),
//! }
//!
//! let segment = Segment { start: (0.0, 0.0), end: (1.0, 2.5) };
//! let bytes = Serializer::Cbor.to_bytes(&segment).unwrap();
//! let decoded: Segment = Serializer::Cbor.from_bytes(&bytes).unwrap();
//! assert_eq!(segment, decoded);
//! ```

use anyhow::Result;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::instrument;

use crate::config::{self, Config};

/// Shorthand for values that can be shipped to another process.
///
/// The `Send + Sync + 'static` bounds let these values move freely between
/// tokio tasks and the blocking pool.
pub trait Serializable: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}
impl<T> Serializable for T where T: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}

/// Binary encoding used for tasks, results, cache entries and wire frames.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}

impl std::fmt::Display for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postcard => write!(f, "postcard"),
            Self::Cbor => write!(f, "cbor"),
        }
    }
}

impl Serializer {
    /// Serializes the given value into binary data using the specified format.
    #[instrument(skip(value), level = "trace")]
    pub fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        match self {
            Self::Postcard => Ok(postcard::to_allocvec(value)?.into()),
            Self::Cbor => {
                let mut result = Vec::new();
                ciborium::into_writer(value, &mut result)?;
                Ok(result.into())
            }
        }
    }

    /// Deserializes the given binary data into a value of the specified type
    /// using the specified format.
    #[instrument(skip(bytes), level = "trace")]
    pub fn from_bytes<T: for<'a> Deserialize<'a>>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Postcard => Ok(postcard::from_bytes(bytes)?),
            Self::Cbor => Ok(ciborium::from_reader(bytes)?),
        }
    }
}

impl From<config::Serializer> for Serializer {
    fn from(serializer: config::Serializer) -> Self {
        match serializer {
            config::Serializer::Postcard => Self::Postcard,
            config::Serializer::Cbor => Self::Cbor,
        }
    }
}

impl From<&Config> for Serializer {
    fn from(config: &Config) -> Self {
        config.serializer.into()
    }
}
