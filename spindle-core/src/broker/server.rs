//! The listening side of a hosted manager.
use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use futures::StreamExt;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use super::{
    flag::Flags,
    protocol::{framed, recv, send, Envelope, Handshake, QueueName, Request, Response, TimeKind},
    Resources,
};
use crate::{
    cache::Cache,
    config::RemoteAddress,
    error::Result,
    queue::Queue,
    serializer::Serializer,
    statistics::Statistics,
};

struct Shared {
    credentials: String,
    serializer: Serializer,
    resources: Resources,
}

/// A running accept loop. Connections are served until
/// [`shutdown`](Self::shutdown).
pub struct Server {
    local_addr: SocketAddr,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Server {
    #[instrument(skip(address, credentials, resources), fields(%address), level = "debug")]
    pub(crate) async fn bind(
        address: &RemoteAddress,
        credentials: &str,
        serializer: Serializer,
        resources: Resources,
    ) -> Result<Self> {
        let listener = TcpListener::bind((address.host.as_str(), address.port))
            .await
            .with_context(|| format!("failed to bind manager to {address}"))?;
        let local_addr = listener.local_addr()?;
        let token = CancellationToken::new();

        let shared = Arc::new(Shared {
            credentials: credentials.to_string(),
            serializer,
            resources,
        });
        let handle = tokio::spawn(accept_loop(listener, shared, token.clone()));
        info!(%local_addr, %serializer, "manager listening");

        Ok(Self {
            local_addr,
            token,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close every open connection.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(err) = self.handle.await {
            warn!(%err, "manager accept loop ended abnormally");
        }
        info!(local_addr = %self.local_addr, "manager stopped");
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, token: CancellationToken) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let shared = shared.clone();
                    let token = token.child_token();
                    connections.spawn(
                        async move {
                            if let Err(err) = serve_connection(stream, &shared, token).await {
                                warn!(%err, "connection failed");
                            }
                        }
                        .instrument(info_span!("connection", %peer)),
                    );
                }
                Err(err) => warn!(%err, "failed to accept connection"),
            },
        }
    }

    connections.shutdown().await;
}

async fn serve_connection(
    stream: TcpStream,
    shared: &Shared,
    token: CancellationToken,
) -> Result<()> {
    let serializer = shared.serializer;
    stream.set_nodelay(true)?;
    let mut transport = framed(stream);

    match recv::<Handshake, _>(&mut transport, serializer).await? {
        Some(Handshake::Hello { credentials }) if credentials == shared.credentials => {
            send(&mut transport, serializer, &Handshake::Welcome).await?;
        }
        Some(_) => {
            warn!("rejected client credentials");
            send(&mut transport, serializer, &Handshake::Rejected).await?;
            return Ok(());
        }
        None => return Ok(()),
    }
    debug!("client connected");

    let (mut sink, mut stream) = transport.split();
    let (responses, mut outgoing) = mpsc::unbounded_channel::<Envelope<Response>>();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outgoing.recv().await {
            send(&mut sink, serializer, &envelope).await?;
        }
        Ok::<_, crate::error::BrokerError>(())
    });

    let mut handlers = JoinSet::new();
    let outcome = loop {
        tokio::select! {
            _ = token.cancelled() => break Ok(()),
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            frame = recv::<Envelope<Request>, _>(&mut stream, serializer) => match frame {
                Ok(Some(Envelope { id, body })) => {
                    let resources = shared.resources.clone();
                    let responses = responses.clone();
                    handlers.spawn(async move {
                        let body = handle(&resources, serializer, body).await;
                        // The writer is gone only once the connection is.
                        let _ = responses.send(Envelope { id, body });
                    });
                }
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            },
        }
    };

    handlers.shutdown().await;
    drop(responses);
    if token.is_cancelled() {
        writer.abort();
    } else if let Ok(Err(err)) = writer.await {
        debug!(%err, "failed to flush responses");
    }
    debug!("client disconnected");

    outcome
}

async fn handle(resources: &Resources, serializer: Serializer, request: Request) -> Response {
    dispatch(resources, serializer, request)
        .await
        .unwrap_or_else(Response::from)
}

async fn dispatch(
    resources: &Resources,
    serializer: Serializer,
    request: Request,
) -> Result<Response> {
    let response = match request {
        Request::Put { queue, item } => {
            match queue {
                QueueName::Tasks => resources.tasks.put(serializer.from_bytes(&item)?).await?,
                QueueName::Results => {
                    resources.results.put(serializer.from_bytes(&item)?).await?
                }
            }
            Response::Done
        }
        Request::Get { queue, timeout } => {
            let item = match queue {
                QueueName::Tasks => serializer.to_bytes(&resources.tasks.get(timeout).await?)?,
                QueueName::Results => {
                    serializer.to_bytes(&resources.results.get(timeout).await?)?
                }
            };
            Response::Item { queue, item }
        }
        Request::Empty(queue) => Response::Bool(match queue {
            QueueName::Tasks => resources.tasks.empty().await?,
            QueueName::Results => resources.results.empty().await?,
        }),
        Request::Size(queue) => {
            let size = match queue {
                QueueName::Tasks => resources.tasks.qsize().await?,
                QueueName::Results => resources.results.qsize().await?,
            };
            Response::Size(size as u64)
        }
        Request::CacheContains(key) => Response::Bool(resources.cache.contains(&key).await?),
        Request::CacheAdd(key, value) => {
            resources.cache.add(&key, value).await?;
            Response::Done
        }
        Request::CacheGet(key) => Response::Payload(resources.cache.get(&key).await?),
        Request::CacheRemove(key) => {
            resources.cache.remove(&key).await?;
            Response::Done
        }
        Request::AddTime {
            kind,
            name,
            elapsed,
        } => {
            let statistics = &resources.statistics;
            match kind {
                TimeKind::Transfer => statistics.add_transfer_time(&name, elapsed).await?,
                TimeKind::Process => statistics.add_process_time(&name, elapsed).await?,
                TimeKind::Queueing => statistics.add_queueing_time(&name, elapsed).await?,
            }
            Response::Done
        }
        Request::GetStats => Response::Stats(resources.statistics.get_stats().await?),
        Request::GetFlag(name) => Response::Bool(resources.flags.get(&name).await?),
        Request::SetFlag(name, value) => {
            resources.flags.set(&name, value).await?;
            Response::Done
        }
        Request::RemoveFlag(name) => {
            resources.flags.remove(&name).await?;
            Response::Done
        }
    };

    Ok(response)
}
