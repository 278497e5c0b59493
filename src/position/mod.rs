//! Priority-ordered waiting positions.
//!
//! Pending task ids live in one sorted set scored `max_priority - priority`,
//! so higher priorities rank first. Equal scores rank by task id, which is
//! lexicographic and not submission order unless ids come from
//! [`TaskIdGenerator::Sequenced`](crate::task::TaskIdGenerator).
//!
//! The tracker owns its key: creating one clears whatever was stored there,
//! so rankings do not survive a restart.

use std::sync::Arc;

use tracing::debug;

use crate::error::StoreResult;
use crate::store::KeyValueStore;
use crate::task::{inverted_score, TaskError};

/// Ranks pending tasks in one sorted set.
pub struct PositionTracker {
    store: Arc<dyn KeyValueStore>,
    set_key: String,
}

impl PositionTracker {
    /// Creates a tracker over `set_key`, deleting any existing ranking.
    pub async fn new(
        store: Arc<dyn KeyValueStore>,
        set_key: impl Into<String>,
    ) -> StoreResult<Self> {
        let set_key = set_key.into();
        store.delete_key(&set_key).await?;
        debug!(key = %set_key, "Position tracker reset");
        Ok(Self { store, set_key })
    }

    /// Creates the tracker for one queue, keyed `position:{queue_id}`.
    pub async fn for_queue(store: Arc<dyn KeyValueStore>, queue_id: &str) -> StoreResult<Self> {
        Self::new(store, format!("position:{}", queue_id)).await
    }

    pub fn key(&self) -> &str {
        &self.set_key
    }

    /// Inserts `task_id` with `score`, or re-scores it if present.
    pub async fn add_item(&self, task_id: &str, score: i64) -> StoreResult<()> {
        self.store.add_sorted_set(&self.set_key, score, task_id).await
    }

    /// Inserts a task scored by its priority. Returns its zero-based rank.
    pub async fn add_task(
        &self,
        task_id: &str,
        priority: u8,
        max_priority: u8,
    ) -> Result<u64, TaskError> {
        let score = inverted_score(priority, max_priority)?;
        self.add_item(task_id, score).await?;
        Ok(self.get_position(task_id).await?)
    }

    /// Zero-based rank of `task_id`.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` once the task was removed or dispatched.
    pub async fn get_position(&self, task_id: &str) -> StoreResult<u64> {
        self.store.get_rank_sorted_set(&self.set_key, task_id).await
    }

    /// 1-based position as shown to submitters.
    pub async fn display_position(&self, task_id: &str) -> StoreResult<u64> {
        Ok(self.get_position(task_id).await? + 1)
    }

    pub async fn remove_item(&self, task_id: &str) -> StoreResult<()> {
        self.store.remove_sorted_set(&self.set_key, task_id).await
    }

    /// All pending task ids, first in line first.
    pub async fn pending(&self) -> StoreResult<Vec<String>> {
        self.store.get_all_items_sorted_set(&self.set_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryStore;

    async fn tracker() -> PositionTracker {
        PositionTracker::new(Arc::new(MemoryStore::new()), "p_set")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_higher_priority_ranks_first_with_id_tie_break() {
        let tracker = tracker().await;
        tracker.add_task("A", 5, 5).await.unwrap();
        tracker.add_task("B", 3, 5).await.unwrap();
        tracker.add_task("C", 5, 5).await.unwrap();

        assert_eq!(tracker.get_position("A").await.unwrap(), 0);
        assert_eq!(tracker.get_position("C").await.unwrap(), 1);
        assert_eq!(tracker.get_position("B").await.unwrap(), 2);
        assert_eq!(tracker.display_position("B").await.unwrap(), 3);
        assert_eq!(tracker.pending().await.unwrap(), vec!["A", "C", "B"]);
    }

    #[tokio::test]
    async fn test_removal_never_raises_other_ranks() {
        let tracker = tracker().await;
        tracker.add_item("A", 0).await.unwrap();
        tracker.add_item("B", 2).await.unwrap();
        tracker.add_item("C", 0).await.unwrap();
        tracker.add_item("D", 4).await.unwrap();

        let before: Vec<u64> = vec![
            tracker.get_position("A").await.unwrap(),
            tracker.get_position("C").await.unwrap(),
            tracker.get_position("D").await.unwrap(),
        ];

        tracker.remove_item("B").await.unwrap();

        let after: Vec<u64> = vec![
            tracker.get_position("A").await.unwrap(),
            tracker.get_position("C").await.unwrap(),
            tracker.get_position("D").await.unwrap(),
        ];
        for (b, a) in before.iter().zip(&after) {
            assert!(a <= b);
        }
        assert_eq!(after, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_missing_task_is_not_found() {
        let tracker = tracker().await;
        tracker.add_item("A", 0).await.unwrap();
        tracker.remove_item("A").await.unwrap();

        assert!(matches!(
            tracker.get_position("A").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            tracker.get_position("never-added").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_new_tracker_clears_previous_ranking() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let first = PositionTracker::for_queue(Arc::clone(&store), "q1")
            .await
            .unwrap();
        first.add_item("A", 0).await.unwrap();
        assert_eq!(first.key(), "position:q1");

        let second = PositionTracker::for_queue(store, "q1").await.unwrap();
        assert!(second.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_task_rejects_priority_above_max() {
        let tracker = tracker().await;
        let err = tracker.add_task("A", 9, 5).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidPriority { .. }));
        assert!(tracker.pending().await.unwrap().is_empty());
    }
}
