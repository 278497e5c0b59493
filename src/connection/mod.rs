//! Resilient connection management for the remote store.
//!
//! [`ConnectionManager`] owns the bounded pool and the single reconnect
//! monitor task. Every checkout reports its outcome to the monitor over a
//! bounded channel with `try_send`, so a slow or stalled monitor never holds
//! up a request: when the channel is full the notification is dropped.
//!
//! # Example
//!
//! ```rust,ignore
//! use dispatchq::config::StoreConfig;
//! use dispatchq::connection::ConnectionManager;
//!
//! let manager = ConnectionManager::connect(StoreConfig::from_env()?).await?;
//! let mut conn = manager.get_connection().await?;
//! let pong: String = redis::cmd("PING").query_async(&mut *conn).await?;
//! // Unmarked connections are closed on drop instead of reused.
//! conn.mark_healthy();
//! ```

mod monitor;
mod pool;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::metrics;

pub use monitor::{
    run_retry_sequence, LinkEvent, LinkState, MonitorAction, ReconnectMachine, Redial,
    RetryOutcome,
};
pub use pool::{PoolStats, PooledConnection};

use monitor::Monitor;
use pool::ConnectionPool;

/// Owns the connection pool and the reconnect monitor.
///
/// Construct one per store and share it behind an `Arc`.
pub struct ConnectionManager {
    pool: Arc<ConnectionPool>,
    events: mpsc::Sender<LinkEvent>,
    status: watch::Receiver<LinkState>,
    shutdown_tx: broadcast::Sender<()>,
    monitor: Mutex<Option<JoinHandle<Result<(), StoreError>>>>,
    default_ttl: Duration,
    max_attempts: u32,
}

impl ConnectionManager {
    /// Validates the configuration, pings the store once and starts the
    /// monitor task.
    ///
    /// An unreachable store does not fail construction: the manager starts
    /// in the degraded state and the monitor begins reconnecting right away.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Config` if the configuration is invalid.
    pub async fn connect(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let pool = Arc::new(ConnectionPool::new(&config)?);

        let initial = match pool.redial().await {
            Ok(()) => LinkState::Connected,
            Err(e) => {
                warn!(address = %pool.address(), error = %e, "Initial store connection failed");
                LinkState::Degraded
            }
        };

        let (events_tx, events_rx) = mpsc::channel(config.notify_capacity);
        let (status_tx, status_rx) = watch::channel(initial);
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        let monitor = Monitor::new(
            config.reconnect.clone(),
            initial,
            events_rx,
            status_tx,
            Arc::clone(&pool),
            shutdown_tx.subscribe(),
        );
        let handle = tokio::spawn(monitor.run());

        let manager = Self {
            pool,
            events: events_tx,
            status: status_rx,
            shutdown_tx,
            monitor: Mutex::new(Some(handle)),
            default_ttl: config.default_ttl,
            max_attempts: config.reconnect.max_attempts,
        };

        if initial != LinkState::Connected {
            manager.notify(LinkEvent::Failure);
        }

        info!(
            address = %manager.pool.address(),
            state = %initial,
            max_idle = config.pool_max_idle,
            max_active = config.pool_max_active,
            "Store connection manager started"
        );

        Ok(manager)
    }

    /// Checks out a connection from the pool.
    ///
    /// Blocks only as long as the pool's wait policy allows when every
    /// connection is busy.
    ///
    /// # Errors
    ///
    /// - `StoreError::Unrecoverable` once the monitor has given up
    /// - `StoreError::Connectivity` on dial failure or pool exhaustion
    pub async fn get_connection(&self) -> Result<PooledConnection, StoreError> {
        if self.status() == LinkState::Unrecoverable {
            return Err(StoreError::Unrecoverable {
                attempts: self.max_attempts,
            });
        }

        match self.pool.get().await {
            Ok(conn) => {
                self.notify(LinkEvent::Success);
                metrics::record_connection(true);
                Ok(conn)
            }
            Err(e) => {
                self.notify(LinkEvent::Failure);
                metrics::record_connection(false);
                warn!(error = %e, "Failed to get store connection from pool");
                Err(e)
            }
        }
    }

    /// Classifies a command error. Transport failures discard the connection
    /// and notify the monitor; server-side errors leave it reusable since the
    /// error reply was read in full.
    pub fn fail(&self, conn: &mut PooledConnection, err: redis::RedisError) -> StoreError {
        let err = StoreError::from(err);
        if err.is_connectivity() {
            conn.discard();
            self.notify(LinkEvent::Failure);
            warn!(error = %err, "Store connection failed mid-command");
        } else {
            conn.mark_healthy();
        }
        err
    }

    /// Round-trips a PING on a pooled connection.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let reply: String = match redis::cmd("PING").query_async(&mut *conn).await {
            Ok(reply) => {
                conn.mark_healthy();
                reply
            }
            Err(e) => return Err(self.fail(&mut conn, e)),
        };
        debug!(reply = %reply, "Store ping");
        Ok(())
    }

    /// Current link state as last published by the monitor.
    pub fn status(&self) -> LinkState {
        *self.status.borrow()
    }

    /// Subscribes to link state changes.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.status.clone()
    }

    /// TTL applied to structured records.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Stops the monitor and returns how it ended.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unrecoverable` if the monitor had already given
    /// up on the store.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        // Ignore send error - the monitor may have already stopped
        let _ = self.shutdown_tx.send(());

        let handle = self.monitor.lock().expect("monitor handle lock poisoned").take();
        let Some(handle) = handle else {
            return Ok(());
        };

        let result = handle.await.map_err(|e| {
            StoreError::Operation(format!("connection monitor task failed: {}", e))
        })?;
        self.pool.flush_idle();
        info!("Store connection manager stopped");
        result
    }

    fn notify(&self, event: LinkEvent) {
        // Full or closed channel: drop the notification.
        let _ = self.events.try_send(event);
    }
}
