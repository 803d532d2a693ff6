//! Publisher channel pool.
//!
//! Broker channels are not safe for concurrent publishing, so the pool
//! hands each caller an exclusive lease over one channel bound to the
//! supervising connection. Returning a lease puts the channel back in the
//! idle set; a broken channel or a disposed pool discards it instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::error::{ClientError, Result};
use crate::transport::{Channel, Connection};

/// Classification of pooled channels. Publishers are the only class today;
/// the slot exists so flagged channels (e.g. confirm-mode) can join later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelClass {
    /// Plain publisher channel.
    Publisher,
}

struct PoolInner {
    idle: HashMap<ChannelClass, Vec<Arc<dyn Channel>>>,
    disposed: bool,
}

/// Borrow/return pool of channels over a single connection.
pub struct ChannelPool {
    connection: Arc<dyn Connection>,
    inner: Mutex<PoolInner>,
    /// Self-handle for leases to return through.
    weak: Weak<ChannelPool>,
}

impl ChannelPool {
    /// Create an empty pool bound to a connection.
    pub fn new(connection: Arc<dyn Connection>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            connection,
            inner: Mutex::new(PoolInner {
                idle: HashMap::new(),
                disposed: false,
            }),
            weak: weak.clone(),
        })
    }

    /// Borrow a channel of the given class, opening a new one on demand.
    pub async fn get(&self, class: ChannelClass) -> Result<ChannelLease> {
        loop {
            let candidate = {
                let mut inner = self.inner.lock().unwrap();
                if inner.disposed {
                    return Err(ClientError::Disposed);
                }
                inner.idle.get_mut(&class).and_then(Vec::pop)
            };
            match candidate {
                Some(channel) if channel.is_open() => {
                    return Ok(ChannelLease {
                        channel,
                        pool: self.weak.clone(),
                        class,
                        returned: false,
                    });
                }
                Some(channel) => {
                    // Stale idle channel; discard and keep looking.
                    channel.close().await;
                }
                None => break,
            }
        }

        let channel = self.connection.open_channel().await?;
        Ok(ChannelLease {
            channel,
            pool: self.weak.clone(),
            class,
            returned: false,
        })
    }

    /// Close all idle channels and refuse further borrows. Outstanding
    /// leases are not forcibly closed; they are discarded on release.
    pub async fn dispose(&self) {
        let idle: Vec<Arc<dyn Channel>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.disposed = true;
            inner.idle.drain().flat_map(|(_, v)| v).collect()
        };
        for channel in idle {
            channel.close().await;
        }
        debug!("channel pool disposed");
    }

    fn try_return(&self, class: ChannelClass, channel: Arc<dyn Channel>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.disposed || !channel.is_open() {
            return false;
        }
        inner.idle.entry(class).or_default().push(channel);
        true
    }
}

/// An exclusively borrowed channel.
///
/// Either held by exactly one caller or present in the pool, never both.
/// Prefer [`release`](ChannelLease::release); dropping a lease returns the
/// channel to the pool when healthy but cannot close a broken one.
pub struct ChannelLease {
    channel: Arc<dyn Channel>,
    pool: Weak<ChannelPool>,
    class: ChannelClass,
    returned: bool,
}

impl std::fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLease")
            .field("class", &self.class)
            .field("returned", &self.returned)
            .finish_non_exhaustive()
    }
}

impl ChannelLease {
    /// The leased channel.
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Return the channel to the pool, or close and discard it if the pool
    /// is gone or the channel is no longer usable.
    pub async fn release(mut self) {
        self.returned = true;
        let channel = self.channel.clone();
        let returned = self
            .pool
            .upgrade()
            .is_some_and(|pool| pool.try_return(self.class, channel.clone()));
        if !returned {
            channel.close().await;
        }
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.try_return(self.class, self.channel.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connector, MemoryBroker};

    async fn pool() -> (MemoryBroker, Arc<ChannelPool>) {
        let broker = MemoryBroker::new();
        let connection = broker.connector().connect().await.unwrap();
        (broker, ChannelPool::new(connection))
    }

    #[tokio::test]
    async fn test_released_channel_is_reused() {
        let (_broker, pool) = pool().await;
        let lease = pool.get(ChannelClass::Publisher).await.unwrap();
        let first = Arc::as_ptr(lease.channel()) as *const ();
        lease.release().await;

        let lease = pool.get(ChannelClass::Publisher).await.unwrap();
        let second = Arc::as_ptr(lease.channel()) as *const ();
        assert_eq!(first, second);
        lease.release().await;
    }

    #[tokio::test]
    async fn test_concurrent_leases_get_distinct_channels() {
        let (_broker, pool) = pool().await;
        let a = pool.get(ChannelClass::Publisher).await.unwrap();
        let b = pool.get(ChannelClass::Publisher).await.unwrap();
        assert_ne!(
            Arc::as_ptr(a.channel()) as *const (),
            Arc::as_ptr(b.channel()) as *const ()
        );
        a.release().await;
        b.release().await;
    }

    #[tokio::test]
    async fn test_broken_channel_not_returned() {
        let (_broker, pool) = pool().await;
        let lease = pool.get(ChannelClass::Publisher).await.unwrap();
        lease.channel().close().await;
        lease.release().await;

        let lease = pool.get(ChannelClass::Publisher).await.unwrap();
        assert!(lease.channel().is_open());
        lease.release().await;
    }

    #[tokio::test]
    async fn test_disposed_pool_refuses_borrows_and_discards_releases() {
        let (_broker, pool) = pool().await;
        let outstanding = pool.get(ChannelClass::Publisher).await.unwrap();
        pool.dispose().await;

        let err = pool.get(ChannelClass::Publisher).await.unwrap_err();
        assert!(matches!(err, ClientError::Disposed));

        // The outstanding lease becomes discard-only on release.
        let channel = outstanding.channel().clone();
        outstanding.release().await;
        assert!(!channel.is_open());
    }
}
