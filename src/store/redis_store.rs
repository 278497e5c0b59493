//! Remote store backend over the redis protocol.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::FromRedisValue;
use tracing::debug;

use crate::connection::ConnectionManager;
use crate::error::{StoreError, StoreResult};

use super::KeyValueStore;

/// [`KeyValueStore`] backed by a redis-compatible server.
///
/// Each operation checks out one pooled connection. It goes back to the pool
/// only after its reply has been read; transport failures and abandoned
/// commands close it instead.
#[derive(Clone)]
pub struct RedisStore {
    manager: Arc<ConnectionManager>,
    expire_secs: u64,
}

impl RedisStore {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        let expire_secs = manager.default_ttl().as_secs().max(1);
        Self {
            manager,
            expire_secs,
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub(crate) async fn run<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> StoreResult<T> {
        let mut conn = self.manager.get_connection().await?;
        match cmd.query_async(&mut *conn).await {
            Ok(value) => {
                conn.mark_healthy();
                Ok(value)
            }
            Err(e) => Err(self.manager.fail(&mut conn, e)),
        }
    }

    pub(crate) async fn run_pipeline(&self, pipe: &redis::Pipeline) -> StoreResult<()> {
        let mut conn = self.manager.get_connection().await?;
        match pipe.query_async::<_, ()>(&mut *conn).await {
            Ok(()) => {
                conn.mark_healthy();
                Ok(())
            }
            Err(e) => Err(self.manager.fail(&mut conn, e)),
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<String> {
        let value: Option<String> = self.run(redis::cmd("GET").arg(key)).await?;
        value.ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.run(redis::cmd("SET").arg(key).arg(value)).await
    }

    async fn get_struct(&self, key: &str) -> StoreResult<String> {
        self.get(key).await
    }

    async fn set_struct(&self, key: &str, value: &str) -> StoreResult<()> {
        self.run(redis::cmd("SETEX").arg(key).arg(self.expire_secs).arg(value))
            .await
    }

    async fn delete_key(&self, key: &str) -> StoreResult<()> {
        let _: u64 = self.run(redis::cmd("DEL").arg(key)).await?;
        Ok(())
    }

    async fn key_exists(&self, key: &str) -> StoreResult<u64> {
        self.run(redis::cmd("EXISTS").arg(key)).await
    }

    async fn set_expire_time(&self, key: &str, seconds: u64) -> StoreResult<()> {
        let _: u64 = self.run(redis::cmd("EXPIRE").arg(key).arg(seconds)).await?;
        Ok(())
    }

    async fn get_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = self.run(redis::cmd("KEYS").arg(pattern)).await?;
        keys.sort();
        debug!(pattern = %pattern, count = keys.len(), "Listed store keys");
        Ok(keys)
    }

    async fn get_hash_key_count(&self, key: &str) -> StoreResult<u64> {
        self.run(redis::cmd("HLEN").arg(key)).await
    }

    async fn get_struct_from_hash(&self, key: &str, field: &str) -> StoreResult<String> {
        let value: Option<String> = self.run(redis::cmd("HGET").arg(key).arg(field)).await?;
        value.ok_or_else(|| StoreError::NotFound(format!("{}/{}", key, field)))
    }

    async fn set_struct_in_hash(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(self.expire_secs)
            .ignore();
        self.run_pipeline(&pipe).await
    }

    async fn get_keys_from_hash(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut fields: Vec<String> = self.run(redis::cmd("HKEYS").arg(key)).await?;
        fields.sort();
        Ok(fields)
    }

    async fn delete_struct_from_hash(&self, key: &str, field: &str) -> StoreResult<()> {
        let _: u64 = self.run(redis::cmd("HDEL").arg(key).arg(field)).await?;
        Ok(())
    }

    async fn key_exists_in_hash(&self, key: &str, field: &str) -> StoreResult<u64> {
        self.run(redis::cmd("HEXISTS").arg(key).arg(field)).await
    }

    async fn atomic_increment(&self, key: &str) -> StoreResult<Option<i64>> {
        let value: i64 = self.run(redis::cmd("INCR").arg(key)).await?;
        Ok(Some(value))
    }

    async fn set_multi_struct_in_hash(
        &self,
        key: &str,
        entries: &HashMap<String, String>,
    ) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut hset = redis::cmd("HSET");
        hset.arg(key);
        for (field, value) in entries {
            hset.arg(field).arg(value);
        }

        let mut pipe = redis::pipe();
        pipe.atomic()
            .add_command(hset)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(self.expire_secs)
            .ignore();
        self.run_pipeline(&pipe).await
    }

    async fn del_multi_key_from_hash(&self, key: &str, fields: &[String]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let _: u64 = self.run(redis::cmd("HDEL").arg(key).arg(fields)).await?;
        Ok(())
    }

    async fn queue_push(&self, key: &str, values: &[String]) -> StoreResult<()> {
        if values.is_empty() {
            return Ok(());
        }
        let _: u64 = self.run(redis::cmd("RPUSH").arg(key).arg(values)).await?;
        Ok(())
    }

    async fn queue_pop(&self, key: &str) -> StoreResult<String> {
        let value: Option<String> = self.run(redis::cmd("LPOP").arg(key)).await?;
        value.ok_or_else(|| StoreError::EmptyQueue(key.to_string()))
    }

    async fn queue_peek(&self, key: &str) -> StoreResult<String> {
        let value: Option<String> = self.run(redis::cmd("LINDEX").arg(key).arg(0)).await?;
        value.ok_or_else(|| StoreError::EmptyQueue(key.to_string()))
    }

    async fn queue_peek_index(&self, key: &str, index: i64) -> StoreResult<String> {
        let value: Option<String> = self.run(redis::cmd("LINDEX").arg(key).arg(index)).await?;
        value.ok_or_else(|| StoreError::NotFound(format!("{}[{}]", key, index)))
    }

    async fn add_sorted_set(&self, key: &str, score: i64, member: &str) -> StoreResult<()> {
        let _: u64 = self
            .run(redis::cmd("ZADD").arg(key).arg(score).arg(member))
            .await?;
        Ok(())
    }

    async fn remove_sorted_set(&self, key: &str, member: &str) -> StoreResult<()> {
        let _: u64 = self.run(redis::cmd("ZREM").arg(key).arg(member)).await?;
        Ok(())
    }

    async fn get_rank_sorted_set(&self, key: &str, member: &str) -> StoreResult<u64> {
        let rank: Option<u64> = self.run(redis::cmd("ZRANK").arg(key).arg(member)).await?;
        rank.ok_or_else(|| StoreError::NotFound(member.to_string()))
    }

    async fn get_all_items_sorted_set(&self, key: &str) -> StoreResult<Vec<String>> {
        self.run(redis::cmd("ZRANGE").arg(key).arg(0).arg(-1)).await
    }
}
