//! Frames exchanged between a manager and its clients.
//!
//! A connection carries length-delimited frames, each one a value encoded
//! with the connection's [`Serializer`]. The client opens with a
//! [`Handshake::Hello`] and the host answers [`Handshake::Welcome`] or
//! [`Handshake::Rejected`]. After that every frame is an [`Envelope`]: the
//! client sends requests, the host answers each with a response carrying the
//! same id. Responses may arrive in any order.
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{
    cache::CacheRef,
    error::{BrokerError, Result},
    serializer::Serializer,
    task::{Task, TaskResult},
};

/// Upper bound for a single frame. Cached meshes are the largest payloads.
pub const MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum Handshake {
    Hello { credentials: String },
    Welcome,
    Rejected,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Envelope<T> {
    pub id: u64,
    pub body: T,
}

/// The two queues a manager owns.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueName {
    Tasks,
    Results,
}

/// Items that travel through one of the manager's queues.
pub trait Routed: Serialize + DeserializeOwned + Send + Sync + 'static {
    const QUEUE: QueueName;
}

impl Routed for Task {
    const QUEUE: QueueName = QueueName::Tasks;
}

impl Routed for TaskResult {
    const QUEUE: QueueName = QueueName::Results;
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub enum TimeKind {
    Transfer,
    Process,
    Queueing,
}

#[derive(Serialize, Deserialize, Debug)]
pub enum Request {
    Put { queue: QueueName, item: Bytes },
    Get { queue: QueueName, timeout: Duration },
    Empty(QueueName),
    Size(QueueName),
    CacheContains(CacheRef),
    CacheAdd(CacheRef, Bytes),
    CacheGet(CacheRef),
    CacheRemove(CacheRef),
    AddTime { kind: TimeKind, name: String, elapsed: Duration },
    GetStats,
    GetFlag(String),
    SetFlag(String, bool),
    RemoveFlag(String),
}

#[derive(Serialize, Deserialize, Debug)]
pub enum Response {
    Done,
    /// An item taken off `queue`. Carries the queue so a client that no
    /// longer waits for it can put it back.
    Item { queue: QueueName, item: Bytes },
    Bool(bool),
    Size(u64),
    Payload(Bytes),
    Stats(String),
    Timeout,
    NotFound(CacheRef),
    Error(String),
}

impl Response {
    /// Split failure responses off into their [`BrokerError`].
    pub fn into_result(self) -> Result<Self> {
        match self {
            Self::Timeout => Err(BrokerError::Timeout),
            Self::NotFound(key) => Err(BrokerError::NotFound(key)),
            Self::Error(message) => Err(BrokerError::Remote(message)),
            response => Ok(response),
        }
    }
}

impl From<BrokerError> for Response {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Timeout => Self::Timeout,
            BrokerError::NotFound(key) => Self::NotFound(key),
            err => Self::Error(err.to_string()),
        }
    }
}

pub fn unexpected(response: Response) -> BrokerError {
    BrokerError::Remote(format!("unexpected response: {response:?}"))
}

pub type Transport<S> = Framed<S, LengthDelimitedCodec>;

pub fn framed<S: AsyncRead + AsyncWrite>(stream: S) -> Transport<S> {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_framed(stream)
}

/// Encode and send one frame.
pub async fn send<T, S>(sink: &mut S, serializer: Serializer, value: &T) -> Result<()>
where
    T: Serialize,
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    let frame = serializer.to_bytes(value)?;
    sink.send(frame).await?;
    Ok(())
}

/// Receive and decode one frame. `None` once the peer closed the connection.
pub async fn recv<T, S>(stream: &mut S, serializer: Serializer) -> Result<Option<T>>
where
    T: DeserializeOwned,
    S: Stream<Item = std::io::Result<bytes::BytesMut>> + Unpin,
{
    match stream.next().await {
        Some(frame) => {
            let frame = frame?;
            let value = serializer
                .from_bytes(&frame)
                .context("malformed frame")?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}
