//! Bounded connection pool for the remote store.
//!
//! Built on `deadpool-redis`: `max_active` is the pool's `max_size` and a
//! caller waits up to the configured pool wait timeout when every connection
//! is checked out. Released connections are kept for reuse up to `max_idle`;
//! any surplus is detached from the pool and closed.
//!
//! A checkout starts out unhealthy. Callers mark it healthy once a reply has
//! been read in full, so a connection whose command was abandoned mid-flight
//! (a dropped future around a blocking pop, say) is closed instead of being
//! handed to the next borrower with a reply still pending on the wire.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Manager, Pool, PoolError, Runtime};
use redis::aio::MultiplexedConnection;
use tracing::debug;

use crate::config::{ConfigError, StoreConfig};
use crate::error::StoreError;

use super::monitor::Redial;

/// Snapshot of pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections parked for reuse.
    pub idle: usize,
    /// Connections currently checked out.
    pub active: usize,
    /// Upper bound on checked-out connections.
    pub max_active: usize,
}

pub(crate) struct ConnectionPool {
    inner: Pool,
    client: redis::Client,
    address: String,
    max_idle: usize,
    wait_timeout: Duration,
    connect_timeout: Duration,
}

fn invalid_url(message: String) -> StoreError {
    StoreError::Config(ConfigError::InvalidValue {
        key: "store url".to_string(),
        message,
    })
}

impl ConnectionPool {
    pub(crate) fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let url = config.url();
        let client = redis::Client::open(url.as_str()).map_err(|e| invalid_url(e.to_string()))?;
        let manager = Manager::new(url.as_str()).map_err(|e| invalid_url(e.to_string()))?;

        let inner = Pool::builder(manager)
            .max_size(config.pool_max_active)
            .wait_timeout(Some(config.pool_wait_timeout))
            .create_timeout(Some(config.connect_timeout))
            .recycle_timeout(Some(config.connect_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| invalid_url(e.to_string()))?;

        Ok(Self {
            inner,
            client,
            address: format!("{}:{}", config.host, config.port),
            max_idle: config.pool_max_idle,
            wait_timeout: config.pool_wait_timeout,
            connect_timeout: config.connect_timeout,
        })
    }

    /// Checks out a connection, reusing an idle one when available.
    pub(crate) async fn get(self: &Arc<Self>) -> Result<PooledConnection, StoreError> {
        let conn = self.inner.get().await.map_err(|e| match e {
            PoolError::Timeout(_) => StoreError::Connectivity(format!(
                "connection pool exhausted: {} connections busy for {:?}",
                self.inner.status().max_size,
                self.wait_timeout
            )),
            PoolError::Closed => {
                StoreError::Connectivity("connection pool is closed".to_string())
            }
            other => StoreError::Connectivity(format!(
                "failed to dial {}: {}",
                self.address, other
            )),
        })?;

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            healthy: false,
        })
    }

    /// Opens a standalone connection, outside the pool, within the dial timeout.
    pub(crate) async fn dial(&self) -> Result<MultiplexedConnection, StoreError> {
        match tokio::time::timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(StoreError::Connectivity(format!(
                "failed to dial {}: {}",
                self.address, e
            ))),
            Err(_) => Err(StoreError::Connectivity(format!(
                "dialing {} timed out after {:?}",
                self.address, self.connect_timeout
            ))),
        }
    }

    fn idle_full(&self) -> bool {
        self.inner.status().available >= self.max_idle
    }

    /// Drops every idle connection. Returns how many were closed.
    pub(crate) fn flush_idle(&self) -> usize {
        let before = self.inner.status().available;
        self.inner.retain(|_, _| false);
        before.saturating_sub(self.inner.status().available)
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let status = self.inner.status();
        PoolStats {
            idle: status.available,
            active: status.size.saturating_sub(status.available),
            max_active: status.max_size,
        }
    }
}

#[async_trait]
impl Redial for ConnectionPool {
    /// Dials a fresh connection and PINGs it. On success the idle set is
    /// flushed since those connections predate the outage.
    async fn redial(&self) -> Result<(), StoreError> {
        let mut conn = self.dial().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        let flushed = self.flush_idle();
        debug!(address = %self.address, flushed, "Store redial succeeded");
        Ok(())
    }
}

/// A connection checked out of the pool.
///
/// Returned to the pool when dropped only if [`mark_healthy`](Self::mark_healthy)
/// was called after the last reply was read; otherwise it is closed.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
    healthy: bool,
}

impl PooledConnection {
    /// Marks the connection reusable: no reply is pending on it.
    pub fn mark_healthy(&mut self) {
        self.healthy = true;
    }

    /// Marks the connection unusable so it is closed instead of reused.
    pub fn discard(&mut self) {
        self.healthy = false;
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if !self.healthy || self.pool.idle_full() {
            // Detached from the pool, the connection closes here and its
            // slot frees up for a fresh dial.
            drop(Connection::take(conn));
        }
    }
}
