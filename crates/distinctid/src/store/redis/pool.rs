use super::connection::Connection;
use crate::StoreError;
use core::{
    future::Future,
    ops::{Deref, DerefMut},
    time::Duration,
};
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Connection pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections opened, handshakes included.
    pub connections_created: u64,
    /// Connections closed because they failed, went stale or were reset.
    pub connections_discarded: u64,
    /// Connections currently idle in the pool.
    pub idle_connections: u64,
}

#[derive(Debug, Default)]
struct PoolMetrics {
    connections_created: AtomicU64,
    connections_discarded: AtomicU64,
}

#[derive(Debug)]
struct Idle {
    conn: Connection,
    generation: u64,
}

/// A bounded pool of connections to the current primary.
///
/// At most `max_connections` connections are checked out at once; further
/// callers wait up to `acquire_timeout` for a permit. A connection only
/// returns to the pool through [`Lease::release`], so a lease dropped
/// mid-command (an error, a timeout or a cancelled future) closes its socket
/// instead of handing a half-read stream to the next caller.
#[derive(Debug)]
pub(crate) struct Pool {
    idle: Mutex<VecDeque<Idle>>,
    permits: Arc<Semaphore>,
    generation: AtomicU64,
    idle_timeout: Duration,
    acquire_timeout: Duration,
    metrics: PoolMetrics,
}

impl Pool {
    pub(crate) fn new(
        max_connections: usize,
        idle_timeout: Duration,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
            generation: AtomicU64::new(0),
            idle_timeout,
            acquire_timeout,
            metrics: PoolMetrics::default(),
        }
    }

    /// Checks out an idle connection, or opens one with `connect`.
    pub(crate) async fn get<F, Fut>(&self, connect: F) -> Result<Lease<'_>, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Connection, StoreError>>,
    {
        let permit = tokio::time::timeout(self.acquire_timeout, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(|_| StoreError::PoolClosed)?;

        let generation = self.generation.load(Ordering::Acquire);
        let conn = match self.pop_idle(generation) {
            Some(conn) => conn,
            None => {
                let conn = connect().await?;
                self.metrics
                    .connections_created
                    .fetch_add(1, Ordering::Relaxed);
                conn
            }
        };

        Ok(Lease {
            pool: self,
            conn: Some(conn),
            generation,
            _permit: permit,
        })
    }

    fn pop_idle(&self, generation: u64) -> Option<Connection> {
        let mut idle = self.idle.lock();
        while let Some(entry) = idle.pop_front() {
            let stale = !self.idle_timeout.is_zero()
                && entry.conn.last_used.elapsed() > self.idle_timeout;
            if entry.generation == generation && !stale {
                return Some(entry.conn);
            }
            self.metrics
                .connections_discarded
                .fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Closes every idle connection and marks checked out ones so they are
    /// closed instead of returned.
    pub(crate) fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let drained = {
            let mut idle = self.idle.lock();
            core::mem::take(&mut *idle)
        };
        self.metrics
            .connections_discarded
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
    }

    pub(crate) fn close(&self) {
        self.permits.close();
        self.clear();
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            connections_created: self.metrics.connections_created.load(Ordering::Relaxed),
            connections_discarded: self.metrics.connections_discarded.load(Ordering::Relaxed),
            idle_connections: self.idle.lock().len() as u64,
        }
    }
}

/// A checked out connection.
#[derive(Debug)]
pub(crate) struct Lease<'a> {
    pool: &'a Pool,
    conn: Option<Connection>,
    generation: u64,
    _permit: OwnedSemaphorePermit,
}

impl Lease<'_> {
    /// Returns the connection to the pool. Call only after a command
    /// completed successfully.
    pub(crate) fn release(mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.generation == self.pool.generation.load(Ordering::Acquire) {
            self.pool.idle.lock().push_back(Idle {
                conn,
                generation: self.generation,
            });
        } else {
            self.pool
                .metrics
                .connections_discarded
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            self.pool
                .metrics
                .connections_discarded
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Deref for Lease<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // `conn` is only `None` inside `release` and `drop`.
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for Lease<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}
