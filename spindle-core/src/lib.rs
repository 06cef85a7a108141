#![cfg_attr(docsrs, feature(doc_cfg))]

//! Task distribution for CPU-bound kernels.
//!
//! Spindle offloads pure, CPU-heavy computations (the numeric geometry
//! kernels of a toolpath generator, say) onto a pool of worker processes.
//! Workers may run on the same machine or on remote hosts that joined a
//! shared manager. Spindle takes care of three things:
//!
//! - **Distribution**: independent tasks are spread over parallel workers, and
//!   every result finds its way back to the submission that produced it.
//! - **Caching**: large immutable inputs (a triangle mesh shared by thousands
//!   of tasks) are transferred once and referenced by identifier afterwards.
//! - **Cancellation**: a caller can abandon a batch early without disturbing
//!   other submissions sharing the same queues.
//!
//! # How to use Spindle
//!
//! Computations are [`Operation`](crate::operation::Operation)s: serializable
//! values with an `execute` method. Deriving
//! [`RemoteExecute`] registers the operation under a stable name so a worker
//! in another process can resolve and run it.
//!
//! ```
//! use futures::TryStreamExt;
//! use serde::{Deserialize, Serialize};
//! use spindle::{
//!     config::Config,
//!     operation::{Operation, Result},
//!     runtime::{RunOptions, Runtime},
//!     task::Arg,
//!     RemoteExecute,
//! };
//!
//! /// Lift a point by a fixed stock allowance.
//! #[derive(Serialize, Deserialize, RemoteExecute)]
//! struct Allowance(f64);
//!
//! impl Operation for Allowance {
//!     type Input = (f64,);
//!     type Output = f64;
//!
//!     fn execute(&self, (z,): Self::Input) -> Result<Self::Output> {
//!         Ok(z + self.0)
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let runtime = Runtime::init(&Config::default()).await?;
//!
//! let heights = [1.0, 2.0, 3.0];
//! let batches = heights.iter().map(|z| vec![Arg::value(z)]);
//! let lifted: Vec<f64> = runtime
//!     .run_in_parallel(&Allowance(0.25), batches, RunOptions::default())
//!     .await?
//!     .try_collect()
//!     .await?;
//!
//! assert_eq!(lifted, [1.25, 2.25, 3.25]);
//! runtime.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Deployment shapes
//!
//! A [`Runtime`](crate::runtime::Runtime) is built from a
//! [`Config`](crate::config::Config):
//!
//! - With no server options, work runs on an in-process pool sized to the
//!   number of cores, or sequentially when parallelism is disabled.
//! - With `enable_server`, the process hosts a
//!   [`Manager`](crate::broker::Manager) that owns the task and result queues,
//!   the cache and the statistics, and a spawner that launches local workers
//!   whenever tasks are pending.
//! - With `enable_server` and `remote_address`, the process joins another
//!   host's manager instead and contributes its own workers.
//! - With `run_as_server_only`, the process only hosts the manager and waits
//!   for clients.
//!
//! Binaries that launch workers as OS processes must link every crate that
//! defines an operation, so that the operation registry of the worker binary
//! knows the names submitters send.
pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod operation;
pub mod queue;
pub mod runtime;
pub mod serializer;
pub mod statistics;
pub mod task;

pub use async_trait::async_trait;
pub use futures;
pub use spindle_derive::RemoteExecute;
pub use tracing;

#[doc(hidden)]
pub mod __private {
    pub use linkme;

    use crate::operation::OperationEntry;

    /// Every operation deriving [`RemoteExecute`](crate::RemoteExecute)
    /// linked into the binary.
    #[linkme::distributed_slice]
    pub static OPERATIONS: [OperationEntry];
}
