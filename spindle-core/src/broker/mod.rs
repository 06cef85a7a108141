//! The manager: the shared home of the task queue, the result queue, the cache,
//! the statistics and the closing flags.
//!
//! A [`Manager`] comes in three shapes:
//! - [`Manager::host`] owns in-memory resources and serves them to
//!   authenticated clients over TCP;
//! - [`Manager::connect`] joins a hosting manager and proxies every call over
//!   one multiplexed connection;
//! - [`Manager::local`] owns in-memory resources and serves nobody.
//!
//! All three hand out the same trait objects, so the spawner, the workers and
//! the submission API do not know which one they talk to.
//!
//! ```
//! use spindle::{broker::Manager, config::RemoteAddress, serializer::Serializer};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let address = RemoteAddress { host: "127.0.0.1".into(), port: 0 };
//! let host = Manager::host(&address, "secret", Serializer::Postcard).await?;
//!
//! let port = host.local_addr().map(|addr| addr.port()).unwrap_or_default();
//! let address = RemoteAddress { port, ..address };
//! let client = Manager::connect(&address, "secret", Serializer::Postcard).await?;
//!
//! client.flag("client-a").set().await?;
//! assert!(host.flag("client-a").is_set().await?);
//!
//! host.shutdown().await;
//! # Ok(())
//! # }
//! ```
use std::{net::SocketAddr, sync::Arc};

use tracing::info;

use self::{
    client::{Connection, RemoteCache, RemoteFlags, RemoteQueue, RemoteStatistics},
    flag::{Flag, Flags, InMemoryFlags},
    server::Server,
};
use crate::{
    cache::{in_memory::InMemoryCache, Cache},
    config::RemoteAddress,
    error::Result,
    queue::{in_memory::InMemoryQueue, Queue},
    serializer::Serializer,
    statistics::{InMemoryStatistics, Statistics},
    task::{Task, TaskResult},
};

pub mod client;
pub mod flag;
pub mod protocol;
pub mod server;

/// The resources a hosting or local manager owns.
#[derive(Clone, Default)]
pub(crate) struct Resources {
    pub(crate) tasks: InMemoryQueue<Task>,
    pub(crate) results: InMemoryQueue<TaskResult>,
    pub(crate) cache: InMemoryCache,
    pub(crate) statistics: InMemoryStatistics,
    pub(crate) flags: InMemoryFlags,
}

enum Role {
    Local,
    Host(Server),
    Client(RemoteAddress),
}

/// The resources a worker needs, cheap to clone.
#[derive(Clone)]
pub struct Handles {
    pub tasks: Arc<dyn Queue<Task>>,
    pub results: Arc<dyn Queue<TaskResult>>,
    pub cache: Arc<dyn Cache>,
    pub statistics: Arc<dyn Statistics>,
}

/// Handles to the shared resources, plus the listener when hosting.
pub struct Manager {
    handles: Handles,
    flags: Arc<dyn Flags>,
    role: Role,
}

impl Manager {
    fn from_resources(resources: Resources, role: Role) -> Self {
        Self {
            handles: Handles {
                tasks: Arc::new(resources.tasks),
                results: Arc::new(resources.results),
                cache: Arc::new(resources.cache),
                statistics: Arc::new(resources.statistics),
            },
            flags: Arc::new(resources.flags),
            role,
        }
    }

    /// A manager that lives in this process only.
    pub fn local() -> Self {
        Self::from_resources(Resources::default(), Role::Local)
    }

    /// Create the resources and serve them on `address`. A bind failure is
    /// returned to the caller.
    pub async fn host(
        address: &RemoteAddress,
        credentials: &str,
        serializer: Serializer,
    ) -> Result<Self> {
        let resources = Resources::default();
        let server = Server::bind(address, credentials, serializer, resources.clone()).await?;
        Ok(Self::from_resources(resources, Role::Host(server)))
    }

    /// Join the manager hosted at `address`.
    pub async fn connect(
        address: &RemoteAddress,
        credentials: &str,
        serializer: Serializer,
    ) -> Result<Self> {
        let connection = Connection::connect(address, credentials, serializer).await?;
        info!(%address, "joined remote manager");

        Ok(Self {
            handles: Handles {
                tasks: Arc::new(RemoteQueue::new(connection.clone())),
                results: Arc::new(RemoteQueue::new(connection.clone())),
                cache: Arc::new(RemoteCache::new(connection.clone())),
                statistics: Arc::new(RemoteStatistics::new(connection.clone())),
            },
            flags: Arc::new(RemoteFlags::new(connection)),
            role: Role::Client(address.clone()),
        })
    }

    pub fn handles(&self) -> Handles {
        self.handles.clone()
    }

    pub fn tasks(&self) -> Arc<dyn Queue<Task>> {
        self.handles.tasks.clone()
    }

    pub fn results(&self) -> Arc<dyn Queue<TaskResult>> {
        self.handles.results.clone()
    }

    pub fn cache(&self) -> Arc<dyn Cache> {
        self.handles.cache.clone()
    }

    pub fn statistics(&self) -> Arc<dyn Statistics> {
        self.handles.statistics.clone()
    }

    pub fn flag(&self, name: impl Into<String>) -> Flag {
        Flag::new(self.flags.clone(), name)
    }

    /// The bound address, when hosting.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.role {
            Role::Host(server) => Some(server.local_addr()),
            _ => None,
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self.role, Role::Host(_))
    }

    /// The address of the joined manager, when connected as a client.
    pub fn remote_address(&self) -> Option<&RemoteAddress> {
        match &self.role {
            Role::Client(address) => Some(address),
            _ => None,
        }
    }

    /// Stop serving, when hosting. A client never shuts down the manager it
    /// joined; dropping its handles closes the connection.
    pub async fn shutdown(self) {
        if let Role::Host(server) = self.role {
            server.shutdown().await;
        }
    }
}
