//! Task and TaskResult types.
//!
//! A [`Task`] is one invocation of a registered
//! [`Operation`](crate::operation::Operation): the serialized operation, its
//! encoded arguments, and the [`JobId`] of the submission it belongs to. A
//! [`TaskResult`] carries the outcome back, tagged with the same [`JobId`] so
//! the submitter can pick its own results out of the shared result queue.
use std::fmt;

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    cache::{CacheRef, Cacheable},
    serializer::Serializer,
};

/// Identifies one submission batch. Every task of the batch shares it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
pub struct JobId(Uuid);

impl JobId {
    /// A fresh, never reused identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A task argument as it travels to a worker.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum Argument {
    /// The encoded value itself.
    Value(Bytes),
    /// A payload the worker fetches from the manager's cache.
    Cached(CacheRef),
}

/// Object-safe encoding, so a batch can mix argument types.
pub trait Encode: Sync {
    fn encode(&self, serializer: Serializer) -> Result<Bytes>;
}

impl<T: Serialize + Sync> Encode for T {
    fn encode(&self, serializer: Serializer) -> Result<Bytes> {
        serializer.to_bytes(self)
    }
}

/// An [`Encode`] value that may be stored in the worker-side cache.
pub trait SharedEncode: Encode {
    fn cache_ref(&self) -> CacheRef;
}

impl<T: Serialize + Cacheable + Sync> SharedEncode for T {
    fn cache_ref(&self) -> CacheRef {
        Cacheable::cache_ref(self)
    }
}

/// A caller-side argument for
/// [`Runtime::run_in_parallel`](crate::runtime::Runtime::run_in_parallel).
///
/// ```
/// use serde::Serialize;
/// use spindle::{cache::{CacheRef, Cacheable}, task::Arg};
///
/// #[derive(Serialize)]
/// struct Mesh { id: u64, heights: Vec<f64> }
///
/// impl Cacheable for Mesh {
///     fn cache_ref(&self) -> CacheRef {
///         CacheRef::new(format!("mesh-{}", self.id))
///     }
/// }
///
/// let mesh = Mesh { id: 3, heights: vec![0.5; 1024] };
/// let x = 12.5_f64;
/// // The mesh is uploaded to the cache once per batch; `x` is sent inline.
/// let tuple = vec![Arg::shared(&mesh), Arg::value(&x)];
/// assert_eq!(tuple.len(), 2);
/// ```
#[derive(Clone, Copy)]
pub enum Arg<'a> {
    /// Send the value with every task.
    Value(&'a dyn Encode),
    /// Upload the value to the cache once and send its reference.
    Shared(&'a dyn SharedEncode),
}

impl<'a> Arg<'a> {
    pub fn value<T: Serialize + Sync>(value: &'a T) -> Self {
        Self::Value(value)
    }

    pub fn shared<T: Serialize + Cacheable + Sync>(value: &'a T) -> Self {
        Self::Shared(value)
    }

    /// Encode the value inline, ignoring any cache capability.
    pub fn encode(&self, serializer: Serializer) -> Result<Bytes> {
        match self {
            Self::Value(value) => value.encode(serializer),
            Self::Shared(value) => value.encode(serializer),
        }
    }
}

impl fmt::Debug for Arg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(_) => f.write_str("Arg::Value"),
            Self::Shared(value) => write!(f, "Arg::Shared({})", value.cache_ref()),
        }
    }
}

/// A serialized invocation of a registered operation.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Task {
    /// The submission this task belongs to.
    pub job_id: JobId,
    /// Position of the argument tuple within its submission.
    pub index: usize,
    /// Registered name of the operation, see
    /// [`RemoteExecute::NAME`](crate::operation::RemoteExecute::NAME).
    pub operation: String,
    /// The serialized operation value.
    pub op: Bytes,
    pub args: Vec<Argument>,
    /// The [`Serializer`] used for `op`, the arguments and the output.
    pub serializer: Serializer,
}

/// A serializable `Result` for task outputs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok(Bytes),
    Err(String),
}

/// The result of executing one [`Task`].
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TaskResult {
    pub job_id: JobId,
    pub index: usize,
    pub outcome: Outcome,
    /// How many times a submitter that did not own this result has put it
    /// back on the result queue.
    pub requeues: u32,
}

impl TaskResult {
    pub fn new(task: &Task, outcome: Outcome) -> Self {
        Self {
            job_id: task.job_id,
            index: task.index,
            outcome,
            requeues: 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Serialize)]
    struct Tool {
        radius: f64,
    }

    impl Cacheable for Tool {
        fn cache_ref(&self) -> CacheRef {
            CacheRef::new(format!("tool-{}", self.radius))
        }
    }

    #[test]
    fn job_ids_are_unique() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn shared_and_inline_encodings_agree() {
        let tool = Tool { radius: 1.5 };
        let serializer = Serializer::Postcard;

        let shared = Arg::shared(&tool);
        let inline = Arg::value(&tool);

        assert_eq!(
            shared.encode(serializer).unwrap(),
            inline.encode(serializer).unwrap()
        );
        assert_eq!(format!("{shared:?}"), "Arg::Shared(tool-1.5)");
    }

    #[test]
    fn tasks_survive_the_wire() {
        let serializer = Serializer::Cbor;
        let task = Task {
            job_id: JobId::new(),
            index: 3,
            operation: "demo::Op".into(),
            op: Bytes::new(),
            args: vec![
                Argument::Value(Bytes::from_static(&[1, 2])),
                Argument::Cached(CacheRef::new("mesh")),
            ],
            serializer,
        };

        let decoded: Task = serializer
            .from_bytes(&serializer.to_bytes(&task).unwrap())
            .unwrap();
        assert_eq!(decoded.job_id, task.job_id);
        assert_eq!(decoded.args, task.args);
    }
}
