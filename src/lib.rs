//! dispatchq: reliability layer for a priority task dispatcher.
//!
//! This library sits between a dispatch service and a redis-compatible
//! store. It provides resilient pooled connections with a reconnect
//! monitor, atomic queue primitives, try-once distributed locks and
//! priority-ordered waiting positions.

pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod position;
pub mod queue;
pub mod store;
pub mod task;

pub use config::{ConfigError, ReconnectPolicy, StoreConfig};
pub use connection::{ConnectionManager, LinkState};
pub use error::{FaultKind, StoreError, StoreOp, StoreResult};
pub use lock::{new_owner_token, DistributedLock};
pub use position::PositionTracker;
pub use queue::QueuePrimitives;
pub use store::{FaultPolicy, KeyValueStore, KeyValueStoreExt, MemoryStore, RedisStore};
pub use task::{QueueInfo, Task, TaskError, TaskIdGenerator};
