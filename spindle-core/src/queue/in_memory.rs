//! An in-memory implementation of [`Queue`].
//!
//! This is the queue a hosted manager owns. Remote processes reach it through
//! the manager's connection, local ones hold a clone directly.
use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::lock::Mutex;
use tokio::sync::Semaphore;

use super::Queue;
use crate::error::{BrokerError, Result};

/// An in-memory implementation of [`Queue`].
///
/// Cloning the queue creates a new handle that points to the same items and
/// synchronization state.
///
/// # Design
/// Items live behind a mutex, and a semaphore holds one permit per item. A
/// consumer first acquires a permit (waiting at most its timeout), then pops
/// under the lock and forgets the permit. A permit therefore always
/// guarantees an item, and two consumers can never receive the same item.
pub struct InMemoryQueue<T> {
    items: Arc<Mutex<VecDeque<T>>>,
    available: Arc<Semaphore>,
}

impl<T> Clone for InMemoryQueue<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            available: self.available.clone(),
        }
    }
}

impl<T> Default for InMemoryQueue<T> {
    fn default() -> Self {
        Self {
            items: Default::default(),
            available: Arc::new(Semaphore::new(0)),
        }
    }
}

impl<T> InMemoryQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<T: Send + 'static> Queue<T> for InMemoryQueue<T> {
    async fn put(&self, item: T) -> Result<()> {
        let mut lock = self.items.lock().await;
        lock.push_back(item);
        self.available.add_permits(1);

        Ok(())
    }

    async fn get(&self, timeout: Duration) -> Result<T> {
        let permit = match tokio::time::timeout(timeout, self.available.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(BrokerError::Disconnected),
            Err(_) => return Err(BrokerError::Timeout),
        };

        let mut lock = self.items.lock().await;
        let item = lock.pop_front();
        // The item is gone, so its permit must not return to the pool.
        permit.forget();
        drop(lock);

        match item {
            Some(item) => Ok(item),
            // Permits correspond 1:1 to items.
            None => unreachable!("permit was acquired, but no item was available"),
        }
    }

    async fn empty(&self) -> Result<bool> {
        Ok(self.items.lock().await.is_empty())
    }

    async fn qsize(&self) -> Result<usize> {
        Ok(self.items.lock().await.len())
    }
}
