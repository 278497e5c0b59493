//! Key-value store capability.
//!
//! [`KeyValueStore`] covers scalar, hash, list and sorted-set operations.
//! Two backends implement it:
//!
//! - [`RedisStore`]: the remote redis-compatible store, through a
//!   [`ConnectionManager`](crate::connection::ConnectionManager)
//! - [`MemoryStore`]: an in-process store for tests, with TTL support and an
//!   injectable [`FaultPolicy`]
//!
//! # Missing data
//!
//! Reads of absent keys, fields or members return `StoreError::NotFound`.
//! Pops and peeks on an empty list return `StoreError::EmptyQueue`.

mod fault;
mod memory;
mod redis_store;

use std::collections::HashMap;

use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreResult;

pub use fault::{FaultPolicy, FaultRule};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Operations offered by every store backend.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads a scalar.
    async fn get(&self, key: &str) -> StoreResult<String>;

    /// Writes a scalar with no expiry.
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Reads a serialized record.
    async fn get_struct(&self, key: &str) -> StoreResult<String>;

    /// Writes a serialized record with the configured default TTL.
    async fn set_struct(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Deletes a key of any type. Deleting an absent key is not an error.
    async fn delete_key(&self, key: &str) -> StoreResult<()>;

    /// Returns 1 if the key exists, 0 otherwise.
    async fn key_exists(&self, key: &str) -> StoreResult<u64>;

    /// Sets a key's time-to-live in seconds.
    async fn set_expire_time(&self, key: &str, seconds: u64) -> StoreResult<()>;

    /// Lists keys matching a glob pattern: `*`, `?`, `[...]` classes and `\`
    /// escapes, as the remote store's KEYS command reads them.
    ///
    /// Walks the whole keyspace; meant for diagnostics only.
    async fn get_keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Number of fields in a hash. 0 for an absent key.
    async fn get_hash_key_count(&self, key: &str) -> StoreResult<u64>;

    async fn get_struct_from_hash(&self, key: &str, field: &str) -> StoreResult<String>;

    /// Writes one hash field and refreshes the hash's TTL.
    async fn set_struct_in_hash(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    async fn get_keys_from_hash(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn delete_struct_from_hash(&self, key: &str, field: &str) -> StoreResult<()>;

    /// Returns 1 if the field exists in the hash, 0 otherwise.
    async fn key_exists_in_hash(&self, key: &str, field: &str) -> StoreResult<u64>;

    /// Atomically increments an integer scalar.
    ///
    /// Returns the new value, or `None` on backends without store-side
    /// increments. [`MemoryStore`] is such a backend: the call is a no-op.
    async fn atomic_increment(&self, key: &str) -> StoreResult<Option<i64>>;

    /// Writes several hash fields and refreshes the hash's TTL.
    async fn set_multi_struct_in_hash(
        &self,
        key: &str,
        entries: &HashMap<String, String>,
    ) -> StoreResult<()>;

    async fn del_multi_key_from_hash(&self, key: &str, fields: &[String]) -> StoreResult<()>;

    /// Appends values to the tail of a list.
    async fn queue_push(&self, key: &str, values: &[String]) -> StoreResult<()>;

    /// Removes and returns the head of a list.
    async fn queue_pop(&self, key: &str) -> StoreResult<String>;

    /// Returns the head of a list without removing it.
    async fn queue_peek(&self, key: &str) -> StoreResult<String>;

    /// Returns the element at `index`; negative indexes count from the tail.
    async fn queue_peek_index(&self, key: &str, index: i64) -> StoreResult<String>;

    /// Inserts or re-scores a sorted-set member.
    async fn add_sorted_set(&self, key: &str, score: i64, member: &str) -> StoreResult<()>;

    /// Removes a sorted-set member. Removing an absent member is not an error.
    async fn remove_sorted_set(&self, key: &str, member: &str) -> StoreResult<()>;

    /// Zero-based rank by ascending score; equal scores order by member.
    async fn get_rank_sorted_set(&self, key: &str, member: &str) -> StoreResult<u64>;

    /// All members in rank order.
    async fn get_all_items_sorted_set(&self, key: &str) -> StoreResult<Vec<String>>;
}

/// JSON helpers on top of [`KeyValueStore::get_struct`] and
/// [`KeyValueStore::set_struct`].
#[async_trait]
pub trait KeyValueStoreExt: KeyValueStore {
    /// Reads and deserializes a record.
    async fn get_json<T>(&self, key: &str) -> StoreResult<T>
    where
        T: DeserializeOwned,
    {
        let raw = self.get_struct(key).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Serializes and writes a record with the default TTL.
    async fn set_json<T>(&self, key: &str, value: &T) -> StoreResult<()>
    where
        T: Serialize + Sync,
    {
        let raw = serde_json::to_string(value)?;
        self.set_struct(key, &raw).await
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

/// Compiles a redis-style glob into an anchored regex.
///
/// Supports `*`, `?`, `[...]` classes with `^` negation and `a-z` ranges, and
/// `\` escapes. An unterminated or empty class is matched literally.
pub(crate) fn glob_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("(?s)^");

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' if i + 1 < chars.len() => {
                i += 1;
                out.push_str(&escape_char(chars[i]));
            }
            '[' => match class_end(&chars, i + 1) {
                Some(end) => {
                    out.push_str(&translate_class(&chars[i + 1..end]));
                    i = end;
                }
                None => out.push_str(r"\["),
            },
            c => out.push_str(&escape_char(c)),
        }
        i += 1;
    }

    out.push('$');
    Regex::new(&out)
}

fn escape_char(c: char) -> String {
    regex::escape(c.encode_utf8(&mut [0; 4]))
}

/// Index of the `]` closing a class whose body starts at `start`, if the
/// class is terminated and non-empty.
fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let body_start = if chars.get(start) == Some(&'^') {
        start + 1
    } else {
        start
    };

    let mut j = body_start;
    while j < chars.len() {
        match chars[j] {
            '\\' => j += 2,
            ']' if j > body_start => return Some(j),
            ']' => return None,
            _ => j += 1,
        }
    }
    None
}

fn translate_class(body: &[char]) -> String {
    let mut out = String::from("[");
    let mut j = 0;
    if body.first() == Some(&'^') {
        out.push('^');
        j = 1;
    }

    while j < body.len() {
        let mut c = body[j];
        if c == '\\' && j + 1 < body.len() {
            j += 1;
            c = body[j];
        }

        if j + 2 < body.len() && body[j + 1] == '-' {
            // Reversed ranges match like their ordered form
            let (lo, hi) = if c <= body[j + 2] {
                (c, body[j + 2])
            } else {
                (body[j + 2], c)
            };
            out.push_str(&escape_char(lo));
            out.push('-');
            out.push_str(&escape_char(hi));
            j += 3;
        } else {
            out.push_str(&escape_char(c));
            j += 1;
        }
    }

    out.push(']');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        count: u32,
    }

    fn glob_match(pattern: &str, key: &str) -> bool {
        glob_regex(pattern).expect("pattern compiles").is_match(key)
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("task:*", "task:42"));
        assert!(glob_match("task:?", "task:4"));
        assert!(!glob_match("task:?", "task:42"));
        assert!(glob_match("*:lock", "queue:a:lock"));
        assert!(glob_match("q*ue*", "queue"));
        assert!(!glob_match("task:*", "queue:1"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
        assert!(glob_match("a.b", "a.b"));
        assert!(!glob_match("a.b", "axb"));
    }

    #[test]
    fn test_glob_classes_and_escapes() {
        assert!(glob_match("h[ae]llo", "hallo"));
        assert!(!glob_match("h[ae]llo", "hillo"));
        assert!(glob_match("h[^e]llo", "hallo"));
        assert!(!glob_match("h[^e]llo", "hello"));
        assert!(glob_match("q[0-9]", "q7"));
        assert!(glob_match("q[9-0]", "q7"));
        assert!(!glob_match("q[0-9]", "qx"));
        assert!(glob_match(r"lit\*", "lit*"));
        assert!(!glob_match(r"lit\*", "literal"));
        assert!(glob_match(r"[\]]", "]"));
        // Unterminated and empty classes are literal
        assert!(glob_match("a[b", "a[b"));
        assert!(glob_match("a[]", "a[]"));
    }

    #[tokio::test]
    async fn test_json_helpers_roundtrip_through_set_struct() {
        let store = MemoryStore::new();
        let record = Record {
            name: "sales".to_string(),
            count: 3,
        };

        store.set_json("record:1", &record).await.expect("write");
        let back: Record = store.get_json("record:1").await.expect("read");
        assert_eq!(back, record);
    }

    #[tokio::test]
    async fn test_json_helpers_report_malformed_records() {
        let store = MemoryStore::new();
        store.set_struct("record:bad", "{not json").await.expect("write");

        let result: StoreResult<Record> = store.get_json("record:bad").await;
        assert!(matches!(
            result,
            Err(crate::error::StoreError::Serialization(_))
        ));
    }
}
