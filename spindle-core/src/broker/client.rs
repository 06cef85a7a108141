//! The client side of a manager connection and the resource proxies built on
//! it.
//!
//! One TCP connection carries every call a process makes. Calls are tagged
//! with an id and may complete out of order, so a worker blocked in a long
//! `get` does not hold up a submitter's `put` on the same connection.
use std::{
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{
    flag::Flags,
    protocol::{
        framed, recv, send, unexpected, Envelope, Handshake, Request, Response, Routed, TimeKind,
    },
};
use crate::{
    cache::{Cache, CacheRef},
    config::RemoteAddress,
    error::{BrokerError, Result},
    queue::Queue,
    serializer::Serializer,
    statistics::Statistics,
};

struct Inner {
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<Response>>,
    outgoing: mpsc::UnboundedSender<Envelope<Request>>,
    token: CancellationToken,
}

impl Inner {
    /// Send a request nobody waits for.
    fn enqueue(&self, body: Request) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if self.outgoing.send(Envelope { id, body }).is_err() {
            warn!("connection closed, dropping request");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// An authenticated, multiplexed connection to a manager.
///
/// Clones share the connection. It closes when the last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
    serializer: Serializer,
}

impl Connection {
    /// Connect and authenticate. There is no retry: an unreachable manager or
    /// refused credentials are reported to the caller.
    #[instrument(skip(address, credentials), fields(%address), level = "debug")]
    pub async fn connect(
        address: &RemoteAddress,
        credentials: &str,
        serializer: Serializer,
    ) -> Result<Self> {
        let stream = TcpStream::connect((address.host.as_str(), address.port))
            .await
            .with_context(|| format!("failed to connect to manager at {address}"))?;
        stream.set_nodelay(true)?;
        let mut transport = framed(stream);

        let hello = Handshake::Hello {
            credentials: credentials.to_string(),
        };
        send(&mut transport, serializer, &hello).await?;
        match recv::<Handshake, _>(&mut transport, serializer).await? {
            Some(Handshake::Welcome) => {}
            Some(Handshake::Rejected) => return Err(BrokerError::Rejected),
            Some(other) => {
                return Err(BrokerError::Remote(format!(
                    "unexpected handshake reply: {other:?}"
                )))
            }
            None => return Err(BrokerError::Disconnected),
        }
        debug!("connected to manager");

        let (sink, stream) = transport.split();
        let (outgoing, requests) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let inner = Arc::new(Inner {
            next_id: AtomicU64::new(0),
            pending: DashMap::new(),
            outgoing,
            token: token.clone(),
        });

        tokio::spawn(write_loop(sink, requests, serializer, token.clone()));
        tokio::spawn(read_loop(stream, Arc::downgrade(&inner), serializer, token));

        Ok(Self { inner, serializer })
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    /// Issue one request and wait for its response.
    ///
    /// Dropping the returned future abandons the call. An item the manager
    /// dequeued for an abandoned call is put back on its queue.
    pub async fn call(&self, body: Request) -> Result<Response> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);

        // Checked after inserting: the reader clears `pending` only after
        // cancelling the token.
        if self.inner.token.is_cancelled() || self.inner.outgoing.send(Envelope { id, body }).is_err()
        {
            self.inner.pending.remove(&id);
            return Err(BrokerError::Disconnected);
        }

        rx.await
            .map_err(|_| BrokerError::Disconnected)?
            .into_result()
    }

    async fn call_done(&self, body: Request) -> Result<()> {
        match self.call(body).await? {
            Response::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn call_bool(&self, body: Request) -> Result<bool> {
        match self.call(body).await? {
            Response::Bool(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }
}

async fn write_loop<S>(
    mut sink: S,
    mut requests: mpsc::UnboundedReceiver<Envelope<Request>>,
    serializer: Serializer,
    token: CancellationToken,
) where
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    loop {
        let envelope = tokio::select! {
            _ = token.cancelled() => break,
            envelope = requests.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };

        if let Err(err) = send(&mut sink, serializer, &envelope).await {
            warn!(%err, "failed to send request to manager");
            token.cancel();
            break;
        }
    }

    let _ = sink.close().await;
}

async fn read_loop<S>(
    mut stream: S,
    connection: Weak<Inner>,
    serializer: Serializer,
    token: CancellationToken,
) where
    S: Stream<Item = std::io::Result<BytesMut>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = recv::<Envelope<Response>, _>(&mut stream, serializer) => frame,
        };

        let Envelope { id, body } = match frame {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                debug!("manager closed the connection");
                break;
            }
            Err(err) => {
                warn!(%err, "connection to manager failed");
                break;
            }
        };

        let Some(inner) = connection.upgrade() else { break };
        let Some((_, waiter)) = inner.pending.remove(&id) else {
            continue;
        };
        if let Err(Response::Item { queue, item }) = waiter.send(body) {
            debug!(?queue, "returning an item to the manager after its call was dropped");
            inner.enqueue(Request::Put { queue, item });
        }
    }

    token.cancel();
    if let Some(inner) = connection.upgrade() {
        // Wakes every waiter with `Disconnected`.
        inner.pending.clear();
    }
}

/// A [`Queue`] on a remote manager.
pub struct RemoteQueue<T> {
    connection: Connection,
    _item: PhantomData<fn() -> T>,
}

impl<T> RemoteQueue<T> {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            _item: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Routed> Queue<T> for RemoteQueue<T> {
    async fn put(&self, item: T) -> Result<()> {
        let item = self.connection.serializer.to_bytes(&item)?;
        self.connection
            .call_done(Request::Put {
                queue: T::QUEUE,
                item,
            })
            .await
    }

    async fn get(&self, timeout: Duration) -> Result<T> {
        let request = Request::Get {
            queue: T::QUEUE,
            timeout,
        };
        match self.connection.call(request).await? {
            Response::Item { item, .. } => Ok(self.connection.serializer.from_bytes(&item)?),
            other => Err(unexpected(other)),
        }
    }

    async fn empty(&self) -> Result<bool> {
        self.connection.call_bool(Request::Empty(T::QUEUE)).await
    }

    async fn qsize(&self) -> Result<usize> {
        match self.connection.call(Request::Size(T::QUEUE)).await? {
            Response::Size(size) => Ok(size as usize),
            other => Err(unexpected(other)),
        }
    }
}

/// A [`Cache`] on a remote manager.
pub struct RemoteCache {
    connection: Connection,
}

impl RemoteCache {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl Cache for RemoteCache {
    async fn contains(&self, key: &CacheRef) -> Result<bool> {
        self.connection
            .call_bool(Request::CacheContains(key.clone()))
            .await
    }

    async fn add(&self, key: &CacheRef, value: Bytes) -> Result<()> {
        self.connection
            .call_done(Request::CacheAdd(key.clone(), value))
            .await
    }

    async fn get(&self, key: &CacheRef) -> Result<Bytes> {
        match self.connection.call(Request::CacheGet(key.clone())).await? {
            Response::Payload(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn remove(&self, key: &CacheRef) -> Result<()> {
        self.connection
            .call_done(Request::CacheRemove(key.clone()))
            .await
    }
}

/// A [`Statistics`] collector on a remote manager.
pub struct RemoteStatistics {
    connection: Connection,
}

impl RemoteStatistics {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    async fn add_time(&self, kind: TimeKind, name: &str, elapsed: Duration) -> Result<()> {
        self.connection
            .call_done(Request::AddTime {
                kind,
                name: name.to_string(),
                elapsed,
            })
            .await
    }
}

#[async_trait]
impl Statistics for RemoteStatistics {
    async fn add_transfer_time(&self, name: &str, elapsed: Duration) -> Result<()> {
        self.add_time(TimeKind::Transfer, name, elapsed).await
    }

    async fn add_process_time(&self, name: &str, elapsed: Duration) -> Result<()> {
        self.add_time(TimeKind::Process, name, elapsed).await
    }

    async fn add_queueing_time(&self, name: &str, elapsed: Duration) -> Result<()> {
        self.add_time(TimeKind::Queueing, name, elapsed).await
    }

    async fn get_stats(&self) -> Result<String> {
        match self.connection.call(Request::GetStats).await? {
            Response::Stats(stats) => Ok(stats),
            other => Err(unexpected(other)),
        }
    }
}

/// The named flags of a remote manager.
pub struct RemoteFlags {
    connection: Connection,
}

impl RemoteFlags {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl Flags for RemoteFlags {
    async fn get(&self, name: &str) -> Result<bool> {
        self.connection
            .call_bool(Request::GetFlag(name.to_string()))
            .await
    }

    async fn set(&self, name: &str, value: bool) -> Result<()> {
        self.connection
            .call_done(Request::SetFlag(name.to_string(), value))
            .await
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.connection
            .call_done(Request::RemoveFlag(name.to_string()))
            .await
    }
}
