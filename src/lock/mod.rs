//! Advisory locks with a time-to-live.
//!
//! A lock is a key holding an owner token. Acquisition never waits or
//! retries: if the key exists the caller gets `StoreError::LockHeld`.
//! Release deletes the key only when it still holds the caller's token, so a
//! holder whose lock expired and was taken by someone else cannot free the
//! new holder's lock.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreOp, StoreResult};
use crate::metrics;
use crate::store::{MemoryStore, RedisStore};

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Returns a fresh random owner token.
pub fn new_owner_token() -> String {
    Uuid::new_v4().to_string()
}

/// Try-once mutual exclusion keyed by name.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Takes the lock for `owner` for at most `ttl`.
    ///
    /// # Errors
    ///
    /// `StoreError::LockHeld` if any owner holds it.
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<()>;

    /// Frees the lock if `owner` holds it. A no-op otherwise.
    async fn release(&self, key: &str, owner: &str) -> StoreResult<()>;
}

fn record_acquire(key: &str, result: &StoreResult<()>) {
    match result {
        Ok(()) => {
            metrics::record_lock("acquire", "acquired");
            debug!(key = %key, "Lock acquired");
        }
        Err(StoreError::LockHeld { .. }) => {
            metrics::record_lock("acquire", "held");
            debug!(key = %key, "Lock already held");
        }
        Err(e) => {
            metrics::record_lock("acquire", "error");
            warn!(key = %key, error = %e, "Lock acquire failed");
        }
    }
}

fn record_release(key: &str, released: bool) {
    let outcome = if released { "released" } else { "not_owner" };
    metrics::record_lock("release", outcome);
    debug!(key = %key, released, "Lock release");
}

#[async_trait]
impl DistributedLock for RedisStore {
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<()> {
        let reply: StoreResult<Option<String>> = self
            .run(
                redis::cmd("SET")
                    .arg(key)
                    .arg(owner)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl.as_secs().max(1)),
            )
            .await;

        // SET NX replies OK when written and nil when the key exists
        let result = match reply {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(StoreError::LockHeld {
                key: key.to_string(),
            }),
            Err(e) => Err(e),
        };
        record_acquire(key, &result);
        result
    }

    async fn release(&self, key: &str, owner: &str) -> StoreResult<()> {
        let script = redis::Script::new(RELEASE_SCRIPT);
        let mut conn = self.manager().get_connection().await?;

        let deleted: u64 = match script.key(key).arg(owner).invoke_async(&mut *conn).await {
            Ok(deleted) => {
                conn.mark_healthy();
                deleted
            }
            Err(e) => {
                let err = self.manager().fail(&mut conn, e);
                metrics::record_lock("release", "error");
                warn!(key = %key, error = %err, "Lock release failed");
                return Err(err);
            }
        };

        record_release(key, deleted > 0);
        Ok(())
    }
}

#[async_trait]
impl DistributedLock for MemoryStore {
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<()> {
        let result = self.check(StoreOp::LockAcquire, key).and_then(|()| {
            if self.keyspace().set_if_absent(key, owner, ttl) {
                Ok(())
            } else {
                Err(StoreError::LockHeld {
                    key: key.to_string(),
                })
            }
        });
        record_acquire(key, &result);
        result
    }

    async fn release(&self, key: &str, owner: &str) -> StoreResult<()> {
        self.check(StoreOp::LockRelease, key)?;
        let released = self.keyspace().delete_if_equals(key, owner);
        record_release(key, released);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::FaultKind;
    use crate::store::{FaultPolicy, KeyValueStore};

    #[test]
    fn test_owner_tokens_are_unique() {
        assert_ne!(new_owner_token(), new_owner_token());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();

        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .acquire("lock:job", &new_owner_token(), Duration::from_secs(30))
                    .await
            }));
        }

        let mut acquired = 0;
        let mut held = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => acquired += 1,
                Err(StoreError::LockHeld { .. }) => held += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(acquired, 1);
        assert_eq!(held, 15);
    }

    #[tokio::test]
    async fn test_release_by_other_owner_is_noop() {
        let store = MemoryStore::new();
        store
            .acquire("lock:a", "owner-1", Duration::from_secs(30))
            .await
            .unwrap();

        store.release("lock:a", "owner-2").await.unwrap();
        assert_eq!(store.get("lock:a").await.unwrap(), "owner-1");

        store.release("lock:a", "owner-1").await.unwrap();
        assert_eq!(store.key_exists("lock:a").await.unwrap(), 0);

        // Releasing a lock nobody holds is fine too.
        store.release("lock:a", "owner-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_reacquired() {
        let store = MemoryStore::new();
        store
            .acquire("lock:b", "owner-1", Duration::from_millis(30))
            .await
            .unwrap();

        let err = store
            .acquire("lock:b", "owner-2", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(err.is_expected());

        tokio::time::sleep(Duration::from_millis(60)).await;
        store
            .acquire("lock:b", "owner-2", Duration::from_secs(30))
            .await
            .unwrap();

        // The first owner's late release must not free the new holder.
        store.release("lock:b", "owner-1").await.unwrap();
        assert_eq!(store.get("lock:b").await.unwrap(), "owner-2");
    }

    #[tokio::test]
    async fn test_acquire_fault_surfaces_as_error() {
        let store = MemoryStore::with_faults(
            FaultPolicy::new().fail_op(StoreOp::LockAcquire, FaultKind::Unreachable),
        );
        let err = store
            .acquire("lock:c", "owner", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
