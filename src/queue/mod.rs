//! Reliable queue primitives over the store's lists.
//!
//! Queues are lists of opaque byte payloads, pushed on the left and popped
//! on the right, so each list is FIFO. A *control queue* holds the names of
//! data queues that have work; [`QueuePrimitives::double_push`] enqueues a
//! payload and announces its data queue in one atomic step.
//!
//! # Timeouts
//!
//! Blocking operations wait at most `timeout`, rounded down to whole seconds
//! and never less than one second, and return `Ok(None)` when it expires.
//! Non-blocking `peek` and `pop` return `StoreError::EmptyQueue` instead.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{StoreError, StoreOp, StoreResult};
use crate::store::{MemoryStore, RedisStore};

/// Whole seconds a blocking operation may wait.
pub fn block_secs(timeout: Duration) -> u64 {
    timeout.as_secs().max(1)
}

/// List operations used to hand work between producers and dispatchers.
#[async_trait]
pub trait QueuePrimitives: Send + Sync {
    /// Pushes `payload` onto `data_queue`, then pushes the name of
    /// `data_queue` onto `control`. Either both become visible or neither.
    async fn double_push(&self, control: &str, data_queue: &str, payload: &[u8])
        -> StoreResult<()>;

    /// Pushes `payload` onto `queue`.
    async fn simple_push(&self, queue: &str, payload: &[u8]) -> StoreResult<()>;

    /// Waits for the next element of `control`. `Ok(None)` on timeout.
    async fn blocking_pop(&self, control: &str, timeout: Duration)
        -> StoreResult<Option<Vec<u8>>>;

    /// Returns the element `pop` would return, without removing it.
    async fn peek(&self, queue: &str) -> StoreResult<Vec<u8>>;

    /// Removes and returns the oldest element.
    async fn pop(&self, queue: &str) -> StoreResult<Vec<u8>>;

    /// Atomically moves the oldest element of `src` to the newest end of
    /// `dst`, waiting for one to arrive. `Ok(None)` on timeout.
    async fn pop_and_move(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> StoreResult<Option<Vec<u8>>>;

    /// Removes every occurrence of `payload`. Returns how many were removed.
    async fn remove_item(&self, queue: &str, payload: &[u8]) -> StoreResult<u64>;
}

#[async_trait]
impl QueuePrimitives for RedisStore {
    async fn double_push(
        &self,
        control: &str,
        data_queue: &str,
        payload: &[u8],
    ) -> StoreResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LPUSH")
            .arg(data_queue)
            .arg(payload)
            .ignore()
            .cmd("LPUSH")
            .arg(control)
            .arg(data_queue)
            .ignore();
        self.run_pipeline(&pipe).await?;

        debug!(control = %control, data_queue = %data_queue, "Double-pushed payload");
        Ok(())
    }

    async fn simple_push(&self, queue: &str, payload: &[u8]) -> StoreResult<()> {
        let _: u64 = self.run(redis::cmd("LPUSH").arg(queue).arg(payload)).await?;
        Ok(())
    }

    async fn blocking_pop(
        &self,
        control: &str,
        timeout: Duration,
    ) -> StoreResult<Option<Vec<u8>>> {
        // BRPOP replies with (list name, element), or nil on timeout
        let reply: Option<(String, Vec<u8>)> = self
            .run(redis::cmd("BRPOP").arg(control).arg(block_secs(timeout)))
            .await?;
        Ok(reply.map(|(_, element)| element))
    }

    async fn peek(&self, queue: &str) -> StoreResult<Vec<u8>> {
        let tail: Vec<Vec<u8>> = self
            .run(redis::cmd("LRANGE").arg(queue).arg(-1).arg(-1))
            .await?;
        tail.into_iter()
            .next()
            .ok_or_else(|| StoreError::EmptyQueue(queue.to_string()))
    }

    async fn pop(&self, queue: &str) -> StoreResult<Vec<u8>> {
        let popped: Option<Vec<u8>> = self.run(redis::cmd("RPOP").arg(queue)).await?;
        popped.ok_or_else(|| StoreError::EmptyQueue(queue.to_string()))
    }

    async fn pop_and_move(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> StoreResult<Option<Vec<u8>>> {
        self.run(
            redis::cmd("BRPOPLPUSH")
                .arg(src)
                .arg(dst)
                .arg(block_secs(timeout)),
        )
        .await
    }

    async fn remove_item(&self, queue: &str, payload: &[u8]) -> StoreResult<u64> {
        self.run(redis::cmd("LREM").arg(queue).arg(0).arg(payload))
            .await
    }
}

impl MemoryStore {
    /// Waits on the push notifier until `attempt` yields an element or the
    /// deadline passes.
    async fn wait_for_element<F>(&self, timeout: Duration, mut attempt: F)
        -> StoreResult<Option<Vec<u8>>>
    where
        F: FnMut(&Self) -> StoreResult<Option<Vec<u8>>> + Send,
    {
        let deadline = Instant::now() + Duration::from_secs(block_secs(timeout));
        loop {
            let notified = self.pushed().notified();
            tokio::pin!(notified);
            // Register before checking so a push in between is not missed.
            notified.as_mut().enable();

            let found = attempt(self)?;
            if found.is_some() {
                return Ok(found);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[async_trait]
impl QueuePrimitives for MemoryStore {
    async fn double_push(
        &self,
        control: &str,
        data_queue: &str,
        payload: &[u8],
    ) -> StoreResult<()> {
        self.check(StoreOp::ListPush, data_queue)?;
        self.check(StoreOp::ListPush, control)?;
        {
            let mut keyspace = self.keyspace();
            // Type-check both lists before touching either.
            keyspace.list(data_queue)?;
            keyspace.list(control)?;
            keyspace
                .list_or_create(data_queue)?
                .push_front(payload.to_vec());
            keyspace
                .list_or_create(control)?
                .push_front(data_queue.as_bytes().to_vec());
        }
        self.notify_pushed();

        debug!(control = %control, data_queue = %data_queue, "Double-pushed payload");
        Ok(())
    }

    async fn simple_push(&self, queue: &str, payload: &[u8]) -> StoreResult<()> {
        self.check(StoreOp::ListPush, queue)?;
        self.keyspace()
            .list_or_create(queue)?
            .push_front(payload.to_vec());
        self.notify_pushed();
        Ok(())
    }

    async fn blocking_pop(
        &self,
        control: &str,
        timeout: Duration,
    ) -> StoreResult<Option<Vec<u8>>> {
        self.check(StoreOp::BlockingPop, control)?;
        self.wait_for_element(timeout, |store| store.keyspace().pop_right(control))
            .await
    }

    async fn peek(&self, queue: &str) -> StoreResult<Vec<u8>> {
        self.check(StoreOp::ListPeek, queue)?;
        let tail = self
            .keyspace()
            .list(queue)?
            .and_then(|list| list.back().cloned());
        tail.ok_or_else(|| StoreError::EmptyQueue(queue.to_string()))
    }

    async fn pop(&self, queue: &str) -> StoreResult<Vec<u8>> {
        self.check(StoreOp::ListPop, queue)?;
        let popped = self.keyspace().pop_right(queue)?;
        popped.ok_or_else(|| StoreError::EmptyQueue(queue.to_string()))
    }

    async fn pop_and_move(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> StoreResult<Option<Vec<u8>>> {
        self.check(StoreOp::PopAndMove, src)?;
        self.check(StoreOp::PopAndMove, dst)?;

        let moved = self
            .wait_for_element(timeout, |store| {
                let mut keyspace = store.keyspace();
                keyspace.list(dst)?;
                let Some(item) = keyspace.pop_right(src)? else {
                    return Ok(None);
                };
                keyspace.list_or_create(dst)?.push_front(item.clone());
                Ok(Some(item))
            })
            .await?;

        if moved.is_some() {
            self.notify_pushed();
        }
        Ok(moved)
    }

    async fn remove_item(&self, queue: &str, payload: &[u8]) -> StoreResult<u64> {
        self.check(StoreOp::ListRemove, queue)?;
        self.keyspace().remove_all(queue, payload)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::FaultKind;
    use crate::store::{FaultPolicy, KeyValueStore};

    #[test]
    fn test_block_secs_never_zero() {
        assert_eq!(block_secs(Duration::ZERO), 1);
        assert_eq!(block_secs(Duration::from_millis(1500)), 1);
        assert_eq!(block_secs(Duration::from_secs(5)), 5);
    }

    #[tokio::test]
    async fn test_push_then_pop_is_fifo() {
        let store = MemoryStore::new();
        store.simple_push("q", b"first").await.unwrap();
        store.simple_push("q", b"second").await.unwrap();

        assert_eq!(store.peek("q").await.unwrap(), b"first");
        assert_eq!(store.pop("q").await.unwrap(), b"first");
        assert_eq!(store.pop("q").await.unwrap(), b"second");

        assert!(matches!(
            store.pop("q").await,
            Err(StoreError::EmptyQueue(_))
        ));
        assert!(matches!(
            store.peek("q").await,
            Err(StoreError::EmptyQueue(_))
        ));
    }

    #[tokio::test]
    async fn test_double_push_publishes_both_lists() {
        let store = MemoryStore::new();
        store
            .double_push("control", "data:a", b"payload")
            .await
            .unwrap();

        assert_eq!(store.peek("data:a").await.unwrap(), b"payload");
        assert_eq!(store.peek("control").await.unwrap(), b"data:a");

        let name = store
            .blocking_pop("control", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some(&b"data:a"[..]));
        assert_eq!(store.pop("data:a").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_double_push_fault_leaves_nothing_visible() {
        let store = MemoryStore::with_faults(FaultPolicy::new().fail_op_on_key(
            StoreOp::ListPush,
            "control",
            FaultKind::SetFailure,
        ));

        let err = store
            .double_push("control", "data:a", b"payload")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Fault { .. }));

        store.clear_faults();
        assert_eq!(store.key_exists("data:a").await.unwrap(), 0);
        assert_eq!(store.key_exists("control").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_double_push_wrong_type_leaves_nothing_visible() {
        let store = MemoryStore::new();
        store.set("control", "not a list").await.unwrap();

        let err = store
            .double_push("control", "data:a", b"payload")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Operation(_)));
        assert_eq!(store.key_exists("data:a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blocking_pop_times_out_with_none() {
        let store = MemoryStore::new();
        let started = Instant::now();

        let popped = store
            .blocking_pop("control", Duration::ZERO)
            .await
            .unwrap();

        assert!(popped.is_none());
        // A zero timeout still waits the one-second floor.
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_blocking_pop_wakes_on_push() {
        let store = Arc::new(MemoryStore::new());

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.blocking_pop("control", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.double_push("control", "data:b", b"x").await.unwrap();

        let popped = waiter.await.unwrap().unwrap();
        assert_eq!(popped.as_deref(), Some(&b"data:b"[..]));
    }

    #[tokio::test]
    async fn test_pop_and_move_relocates_oldest() {
        let store = MemoryStore::new();
        store.simple_push("src", b"a").await.unwrap();
        store.simple_push("src", b"b").await.unwrap();
        store.simple_push("dst", b"z").await.unwrap();

        let moved = store
            .pop_and_move("src", "dst", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(moved.as_deref(), Some(&b"a"[..]));

        // "a" is now the newest element of dst, so "z" pops first.
        assert_eq!(store.pop("dst").await.unwrap(), b"z");
        assert_eq!(store.pop("dst").await.unwrap(), b"a");
        assert_eq!(store.pop("src").await.unwrap(), b"b");
    }

    #[tokio::test]
    async fn test_pop_and_move_single_item_leaves_source_empty() {
        let store = MemoryStore::new();
        store.simple_push("src", b"p").await.unwrap();

        let moved = store
            .pop_and_move("src", "dst", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(moved.as_deref(), Some(&b"p"[..]));

        assert_eq!(store.peek("dst").await.unwrap(), b"p");
        assert!(matches!(
            store.peek("src").await,
            Err(StoreError::EmptyQueue(_))
        ));
    }

    #[tokio::test]
    async fn test_pop_and_move_times_out_on_empty_source() {
        let store = MemoryStore::new();
        let moved = store
            .pop_and_move("src", "dst", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(moved.is_none());
        assert_eq!(store.key_exists("dst").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_item_counts_then_zero() {
        let store = MemoryStore::new();
        store.simple_push("q", b"dup").await.unwrap();
        store.simple_push("q", b"keep").await.unwrap();
        store.simple_push("q", b"dup").await.unwrap();

        assert_eq!(store.remove_item("q", b"dup").await.unwrap(), 2);
        assert_eq!(store.remove_item("q", b"dup").await.unwrap(), 0);
        assert_eq!(store.pop("q").await.unwrap(), b"keep");
        assert_eq!(store.remove_item("q", b"keep").await.unwrap(), 0);
    }
}
