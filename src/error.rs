//! Error types for store operations.
//!
//! Every store-facing operation returns [`StoreError`]. The variants fall into
//! four classes that callers are expected to treat differently:
//! - expected outcomes (`NotFound`, `LockHeld`, `EmptyQueue`) that are part of
//!   normal control flow and should not be logged as failures
//! - retryable connectivity problems (`Connectivity`)
//! - data-shape defects (`Operation`, `Serialization`) that retrying will not fix
//! - the fatal `Unrecoverable` condition raised once the reconnect budget is spent

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur while talking to the key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Dial failure, pool exhaustion or a connection dropped mid-command.
    #[error("Store connectivity error: {0}")]
    Connectivity(String),

    /// Key or member is absent.
    #[error("'{0}' not found")]
    NotFound(String),

    /// Malformed reply, type mismatch or script failure reported by the store.
    #[error("Store operation failed: {0}")]
    Operation(String),

    /// Lock key is already held by some owner.
    #[error("Lock '{key}' is already held")]
    LockHeld { key: String },

    /// Non-blocking pop or peek found nothing.
    #[error("Queue '{0}' is empty")]
    EmptyQueue(String),

    /// The reconnect monitor gave up after spending its retry budget.
    #[error("Store unreachable after {attempts} reconnect attempts")]
    Unrecoverable { attempts: u32 },

    /// Failure forced by an injected [`FaultPolicy`](crate::store::FaultPolicy).
    #[error("Injected {kind} on {op} for '{key}'")]
    Fault {
        kind: FaultKind,
        op: StoreOp,
        key: String,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Failed to (de)serialize a structured record.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true for outcomes that are part of normal control flow.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_) | StoreError::LockHeld { .. } | StoreError::EmptyQueue(_)
        )
    }

    /// Returns true when retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Connectivity(_) => true,
            StoreError::Fault { kind, .. } => *kind == FaultKind::Unreachable,
            _ => false,
        }
    }

    /// Returns true when the store should be considered permanently lost.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Unrecoverable { .. })
    }

    /// Returns true when the error means the transport is unusable, so the
    /// connection that produced it must not go back to the pool.
    pub(crate) fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Connectivity(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            StoreError::Connectivity(err.to_string())
        } else {
            StoreError::Operation(err.to_string())
        }
    }
}

/// Store operations, used to scope injected faults and to label errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Set,
    Delete,
    Exists,
    Expire,
    Keys,
    HashGet,
    HashSet,
    HashDelete,
    HashKeys,
    HashExists,
    HashLen,
    Increment,
    ListPush,
    ListPop,
    ListPeek,
    ListRemove,
    BlockingPop,
    PopAndMove,
    SortedSetAdd,
    SortedSetRemove,
    SortedSetRank,
    SortedSetRange,
    LockAcquire,
    LockRelease,
}

impl StoreOp {
    /// Returns true for operations that write to the store.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            StoreOp::Set
                | StoreOp::Expire
                | StoreOp::HashSet
                | StoreOp::Increment
                | StoreOp::ListPush
                | StoreOp::SortedSetAdd
                | StoreOp::LockAcquire
        )
    }

    /// Returns true for operations that delete data.
    pub fn is_delete(self) -> bool {
        matches!(
            self,
            StoreOp::Delete
                | StoreOp::HashDelete
                | StoreOp::ListRemove
                | StoreOp::SortedSetRemove
                | StoreOp::LockRelease
        )
    }

    /// Returns true for operations that only read.
    pub fn is_read(self) -> bool {
        !self.is_write() && !self.is_delete()
    }
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Forced outcome classes for injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    SetFailure,
    GetFailure,
    DeleteFailure,
    GenericFailure,
    /// Behaves like a lost connection and is classified retryable.
    Unreachable,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::SetFailure => "set failure",
            FaultKind::GetFailure => "get failure",
            FaultKind::DeleteFailure => "delete failure",
            FaultKind::GenericFailure => "generic failure",
            FaultKind::Unreachable => "unreachable store",
        };
        f.write_str(name)
    }
}

/// Convenience alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;
