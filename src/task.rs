//! Task and queue records, plus task identifier generation.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::KeyValueStore;

/// Counter key used by [`TaskIdGenerator::Sequenced`] unless overridden.
pub const DEFAULT_SEQUENCE_KEY: &str = "task:sequence";

/// Errors raised by the task model.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Priority exceeds the queue's maximum.
    #[error("Priority {priority} exceeds queue maximum {max_priority}")]
    InvalidPriority { priority: u8, max_priority: u8 },

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub priority: u8,
    pub queue_id: String,
    pub call_data: HashMap<String, String>,
    /// 1-based waiting position, filled in on submission.
    #[serde(default)]
    pub position: u64,
}

impl Task {
    pub fn new(queue_id: impl Into<String>, priority: u8) -> Self {
        Self {
            task_id: String::new(),
            priority,
            queue_id: queue_id.into(),
            call_data: HashMap::new(),
            position: 0,
        }
    }

    pub fn with_call_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.call_data.insert(key.into(), value.into());
        self
    }
}

/// A named queue with its priority ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub queue_id: String,
    pub queue_name: String,
    pub max_priority: u8,
}

impl QueueInfo {
    /// Ranking score for `priority`: higher priorities get lower scores and
    /// therefore rank first.
    pub fn score_for(&self, priority: u8) -> Result<i64, TaskError> {
        inverted_score(priority, self.max_priority)
    }
}

/// `max_priority - priority`, rejecting priorities above the ceiling.
pub fn inverted_score(priority: u8, max_priority: u8) -> Result<i64, TaskError> {
    if priority > max_priority {
        return Err(TaskError::InvalidPriority {
            priority,
            max_priority,
        });
    }
    Ok(i64::from(max_priority) - i64::from(priority))
}

/// Produces task identifiers.
///
/// Tasks with equal scores rank by identifier. `Random` identifiers make that
/// order arbitrary. `Sequenced` identifiers start with a zero-padded counter,
/// so equal-score tasks rank in submission order.
#[derive(Clone)]
pub enum TaskIdGenerator {
    Random,
    Sequenced {
        store: Arc<dyn KeyValueStore>,
        counter_key: String,
    },
}

impl TaskIdGenerator {
    pub fn sequenced(store: Arc<dyn KeyValueStore>) -> Self {
        Self::Sequenced {
            store,
            counter_key: DEFAULT_SEQUENCE_KEY.to_string(),
        }
    }

    pub async fn next_id(&self) -> Result<String, TaskError> {
        match self {
            Self::Random => Ok(Uuid::new_v4().to_string()),
            Self::Sequenced { store, counter_key } => {
                match store.atomic_increment(counter_key).await? {
                    Some(n) => Ok(format!("{:020}-{}", n, Uuid::new_v4())),
                    // Backend has no counters
                    None => Ok(Uuid::new_v4().to_string()),
                }
            }
        }
    }
}

impl std::fmt::Debug for TaskIdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Random => f.write_str("Random"),
            Self::Sequenced { counter_key, .. } => f
                .debug_struct("Sequenced")
                .field("counter_key", counter_key)
                .finish_non_exhaustive(),
        }
    }
}
