//! FIFO channels shared by every producer and consumer attached to a manager.
//!
//! Two queues exist per manager: one carrying pending
//! [`Task`](crate::task::Task)s and one carrying completed
//! [`TaskResult`](crate::task::TaskResult)s. Both expose the same minimal
//! interface, whether the caller holds the queue in memory or reaches it
//! through a remote manager connection.
//!
//! Every blocking operation is bounded by a timeout so that loops built on top
//! of a queue can poll their shutdown flags in between.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// A FIFO queue with atomic enqueue and dequeue.
#[async_trait]
pub trait Queue<T>: Send + Sync {
    /// Append an item.
    async fn put(&self, item: T) -> Result<()>;

    /// Remove the oldest item, waiting up to `timeout` for one to appear.
    ///
    /// Fails with [`BrokerError::Timeout`](crate::error::BrokerError::Timeout)
    /// if the queue stays empty.
    async fn get(&self, timeout: Duration) -> Result<T>;

    async fn empty(&self) -> Result<bool>;

    /// Number of items at the time of the call.
    async fn qsize(&self) -> Result<usize>;
}

pub mod in_memory;
