//! In-process store backend for tests and local runs.
//!
//! Mirrors the remote store's observable behavior: lists are ordered left to
//! right, empty containers disappear, expired keys are invisible, and using a
//! key as the wrong type is an error. Every operation consults the
//! [`FaultPolicy`] first; a matching rule fails the call before any state is
//! touched.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{StoreError, StoreOp, StoreResult};

use super::fault::FaultPolicy;
use super::{glob_regex, KeyValueStore};

const DEFAULT_TTL: Duration = Duration::from_secs(86_400);

#[derive(Debug, Default)]
pub(crate) struct SortedSet {
    ordered: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
}

impl SortedSet {
    fn insert(&mut self, score: i64, member: &str) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => self.ordered.remove(&(score, member.to_string())),
            None => false,
        }
    }

    fn rank(&self, member: &str) -> Option<u64> {
        let score = *self.scores.get(member)?;
        Some(self.ordered.range(..(score, member.to_string())).count() as u64)
    }

    fn members(&self) -> Vec<String> {
        self.ordered.iter().map(|(_, m)| m.clone()).collect()
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

#[derive(Debug)]
pub(crate) enum Value {
    Scalar(String),
    Hash(HashMap<String, String>),
    List(VecDeque<Vec<u8>>),
    Sorted(SortedSet),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Scalar(_) => false,
            Value::Hash(h) => h.is_empty(),
            Value::List(l) => l.is_empty(),
            Value::Sorted(s) => s.is_empty(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// The keyspace. Expired entries are purged on access.
#[derive(Debug, Default)]
pub(crate) struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, e| !e.is_expired(now));
    }

    fn remove(&mut self, key: &str) -> bool {
        self.live(key);
        self.entries.remove(key).is_some()
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(|e| e.value.is_empty()) {
            self.entries.remove(key);
        }
    }

    fn set_scalar(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Scalar(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        match self.live(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }
    }

    fn scalar(&mut self, key: &str) -> StoreResult<Option<&String>> {
        match self.live(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Scalar(s)) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash(&mut self, key: &str) -> StoreResult<Option<&mut HashMap<String, String>>> {
        match self.live(key).map(|e| &mut e.value) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(Some(h)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash_or_create(&mut self, key: &str) -> StoreResult<&mut HashMap<String, String>> {
        if self.hash(key)?.is_none() {
            self.entries
                .insert(key.to_string(), Entry::new(Value::Hash(HashMap::new())));
        }
        match self.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Hash(h)) => Ok(h),
            _ => Err(wrong_type(key)),
        }
    }

    pub(crate) fn list(&mut self, key: &str) -> StoreResult<Option<&mut VecDeque<Vec<u8>>>> {
        match self.live(key).map(|e| &mut e.value) {
            None => Ok(None),
            Some(Value::List(l)) => Ok(Some(l)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    pub(crate) fn list_or_create(&mut self, key: &str) -> StoreResult<&mut VecDeque<Vec<u8>>> {
        if self.list(key)?.is_none() {
            self.entries
                .insert(key.to_string(), Entry::new(Value::List(VecDeque::new())));
        }
        match self.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::List(l)) => Ok(l),
            _ => Err(wrong_type(key)),
        }
    }

    fn sorted(&mut self, key: &str) -> StoreResult<Option<&mut SortedSet>> {
        match self.live(key).map(|e| &mut e.value) {
            None => Ok(None),
            Some(Value::Sorted(s)) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    /// Pops the rightmost element and drops the list once it is empty.
    pub(crate) fn pop_right(&mut self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let popped = match self.list(key)? {
            Some(list) => list.pop_back(),
            None => None,
        };
        self.drop_if_empty(key);
        Ok(popped)
    }

    /// Removes every element equal to `value`. Returns how many were removed.
    pub(crate) fn remove_all(&mut self, key: &str, value: &[u8]) -> StoreResult<u64> {
        let removed = match self.list(key)? {
            Some(list) => {
                let before = list.len();
                list.retain(|item| item.as_slice() != value);
                (before - list.len()) as u64
            }
            None => 0,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    /// `SET NX` semantics: writes only when the key is absent.
    pub(crate) fn set_if_absent(&mut self, key: &str, value: &str, ttl: Duration) -> bool {
        if self.live(key).is_some() {
            return false;
        }
        self.set_scalar(key, value, Some(ttl));
        true
    }

    /// Deletes `key` only when it holds exactly `value`.
    pub(crate) fn delete_if_equals(&mut self, key: &str, value: &str) -> bool {
        let matches = matches!(
            self.live(key).map(|e| &e.value),
            Some(Value::Scalar(current)) if current == value
        );
        if matches {
            self.entries.remove(key);
        }
        matches
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Operation(format!(
        "WRONGTYPE operation against '{}' holding the wrong kind of value",
        key
    ))
}

fn decode(key: &str, bytes: Vec<u8>) -> StoreResult<String> {
    String::from_utf8(bytes)
        .map_err(|e| StoreError::Operation(format!("list '{}' holds non-UTF-8 data: {}", key, e)))
}

/// In-memory [`KeyValueStore`] with TTLs and injectable faults.
///
/// `atomic_increment` is a no-op on this backend and returns `Ok(None)`.
#[derive(Debug)]
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    pushed: Notify,
    faults: RwLock<FaultPolicy>,
    default_ttl: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            pushed: Notify::new(),
            faults: RwLock::new(FaultPolicy::default()),
            default_ttl: DEFAULT_TTL,
        }
    }

    /// Creates a store that applies `policy` to every operation.
    pub fn with_faults(policy: FaultPolicy) -> Self {
        let store = Self::new();
        store.set_fault_policy(policy);
        store
    }

    /// Sets the TTL applied by `set_struct` and the hash writes.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Replaces the fault policy. Takes effect for the next operation.
    pub fn set_fault_policy(&self, policy: FaultPolicy) {
        *self.faults.write().expect("fault policy lock poisoned") = policy;
    }

    pub fn clear_faults(&self) {
        self.set_fault_policy(FaultPolicy::default());
    }

    pub(crate) fn check(&self, op: StoreOp, key: &str) -> StoreResult<()> {
        let result = self
            .faults
            .read()
            .expect("fault policy lock poisoned")
            .check(op, key);
        if let Err(ref e) = result {
            debug!(error = %e, "Injected store fault");
        }
        result
    }

    pub(crate) fn keyspace(&self) -> MutexGuard<'_, Keyspace> {
        self.keyspace.lock().expect("keyspace lock poisoned")
    }

    /// Wakes blocked list readers after a push.
    pub(crate) fn notify_pushed(&self) {
        self.pushed.notify_waiters();
    }

    pub(crate) fn pushed(&self) -> &Notify {
        &self.pushed
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<String> {
        self.check(StoreOp::Get, key)?;
        self.keyspace()
            .scalar(key)?
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.check(StoreOp::Set, key)?;
        self.keyspace().set_scalar(key, value, None);
        Ok(())
    }

    async fn get_struct(&self, key: &str) -> StoreResult<String> {
        self.get(key).await
    }

    async fn set_struct(&self, key: &str, value: &str) -> StoreResult<()> {
        self.check(StoreOp::Set, key)?;
        self.keyspace()
            .set_scalar(key, value, Some(self.default_ttl));
        Ok(())
    }

    async fn delete_key(&self, key: &str) -> StoreResult<()> {
        self.check(StoreOp::Delete, key)?;
        self.keyspace().remove(key);
        Ok(())
    }

    async fn key_exists(&self, key: &str) -> StoreResult<u64> {
        self.check(StoreOp::Exists, key)?;
        Ok(u64::from(self.keyspace().live(key).is_some()))
    }

    async fn set_expire_time(&self, key: &str, seconds: u64) -> StoreResult<()> {
        self.check(StoreOp::Expire, key)?;
        let mut keyspace = self.keyspace();
        if seconds == 0 {
            keyspace.remove(key);
        } else {
            keyspace.expire(key, Duration::from_secs(seconds));
        }
        Ok(())
    }

    async fn get_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.check(StoreOp::Keys, pattern)?;
        let matcher = glob_regex(pattern).map_err(|e| {
            StoreError::Operation(format!("invalid key pattern {}: {}", pattern, e))
        })?;
        let mut keyspace = self.keyspace();
        keyspace.purge_expired();
        let mut keys: Vec<String> = keyspace
            .entries
            .keys()
            .filter(|k| matcher.is_match(k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get_hash_key_count(&self, key: &str) -> StoreResult<u64> {
        self.check(StoreOp::HashLen, key)?;
        Ok(self.keyspace().hash(key)?.map_or(0, |h| h.len() as u64))
    }

    async fn get_struct_from_hash(&self, key: &str, field: &str) -> StoreResult<String> {
        self.check(StoreOp::HashGet, key)?;
        self.keyspace()
            .hash(key)?
            .and_then(|h| h.get(field).cloned())
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", key, field)))
    }

    async fn set_struct_in_hash(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.check(StoreOp::HashSet, key)?;
        let mut keyspace = self.keyspace();
        keyspace
            .hash_or_create(key)?
            .insert(field.to_string(), value.to_string());
        keyspace.expire(key, self.default_ttl);
        Ok(())
    }

    async fn get_keys_from_hash(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check(StoreOp::HashKeys, key)?;
        let mut fields: Vec<String> = self
            .keyspace()
            .hash(key)?
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        fields.sort();
        Ok(fields)
    }

    async fn delete_struct_from_hash(&self, key: &str, field: &str) -> StoreResult<()> {
        self.check(StoreOp::HashDelete, key)?;
        let mut keyspace = self.keyspace();
        if let Some(hash) = keyspace.hash(key)? {
            hash.remove(field);
        }
        keyspace.drop_if_empty(key);
        Ok(())
    }

    async fn key_exists_in_hash(&self, key: &str, field: &str) -> StoreResult<u64> {
        self.check(StoreOp::HashExists, key)?;
        let exists = self
            .keyspace()
            .hash(key)?
            .is_some_and(|h| h.contains_key(field));
        Ok(u64::from(exists))
    }

    async fn atomic_increment(&self, key: &str) -> StoreResult<Option<i64>> {
        self.check(StoreOp::Increment, key)?;
        Ok(None)
    }

    async fn set_multi_struct_in_hash(
        &self,
        key: &str,
        entries: &HashMap<String, String>,
    ) -> StoreResult<()> {
        self.check(StoreOp::HashSet, key)?;
        if entries.is_empty() {
            return Ok(());
        }
        let mut keyspace = self.keyspace();
        let hash = keyspace.hash_or_create(key)?;
        for (field, value) in entries {
            hash.insert(field.clone(), value.clone());
        }
        keyspace.expire(key, self.default_ttl);
        Ok(())
    }

    async fn del_multi_key_from_hash(&self, key: &str, fields: &[String]) -> StoreResult<()> {
        self.check(StoreOp::HashDelete, key)?;
        let mut keyspace = self.keyspace();
        if let Some(hash) = keyspace.hash(key)? {
            for field in fields {
                hash.remove(field);
            }
        }
        keyspace.drop_if_empty(key);
        Ok(())
    }

    async fn queue_push(&self, key: &str, values: &[String]) -> StoreResult<()> {
        self.check(StoreOp::ListPush, key)?;
        if values.is_empty() {
            return Ok(());
        }
        {
            let mut keyspace = self.keyspace();
            let list = keyspace.list_or_create(key)?;
            list.extend(values.iter().map(|v| v.as_bytes().to_vec()));
        }
        self.notify_pushed();
        Ok(())
    }

    async fn queue_pop(&self, key: &str) -> StoreResult<String> {
        self.check(StoreOp::ListPop, key)?;
        let mut keyspace = self.keyspace();
        let popped = match keyspace.list(key)? {
            Some(list) => list.pop_front(),
            None => None,
        };
        keyspace.drop_if_empty(key);
        match popped {
            Some(bytes) => decode(key, bytes),
            None => Err(StoreError::EmptyQueue(key.to_string())),
        }
    }

    async fn queue_peek(&self, key: &str) -> StoreResult<String> {
        self.check(StoreOp::ListPeek, key)?;
        let head = self
            .keyspace()
            .list(key)?
            .and_then(|list| list.front().cloned());
        match head {
            Some(bytes) => decode(key, bytes),
            None => Err(StoreError::EmptyQueue(key.to_string())),
        }
    }

    async fn queue_peek_index(&self, key: &str, index: i64) -> StoreResult<String> {
        self.check(StoreOp::ListPeek, key)?;
        let item = self.keyspace().list(key)?.and_then(|list| {
            let len = list.len() as i64;
            let pos = if index < 0 { len + index } else { index };
            if (0..len).contains(&pos) {
                list.get(pos as usize).cloned()
            } else {
                None
            }
        });
        match item {
            Some(bytes) => decode(key, bytes),
            None => Err(StoreError::NotFound(format!("{}[{}]", key, index))),
        }
    }

    async fn add_sorted_set(&self, key: &str, score: i64, member: &str) -> StoreResult<()> {
        self.check(StoreOp::SortedSetAdd, key)?;
        let mut keyspace = self.keyspace();
        if keyspace.sorted(key)?.is_none() {
            keyspace
                .entries
                .insert(key.to_string(), Entry::new(Value::Sorted(SortedSet::default())));
        }
        if let Some(set) = keyspace.sorted(key)? {
            set.insert(score, member);
        }
        Ok(())
    }

    async fn remove_sorted_set(&self, key: &str, member: &str) -> StoreResult<()> {
        self.check(StoreOp::SortedSetRemove, key)?;
        let mut keyspace = self.keyspace();
        if let Some(set) = keyspace.sorted(key)? {
            set.remove(member);
        }
        keyspace.drop_if_empty(key);
        Ok(())
    }

    async fn get_rank_sorted_set(&self, key: &str, member: &str) -> StoreResult<u64> {
        self.check(StoreOp::SortedSetRank, key)?;
        self.keyspace()
            .sorted(key)?
            .and_then(|set| set.rank(member))
            .ok_or_else(|| StoreError::NotFound(member.to_string()))
    }

    async fn get_all_items_sorted_set(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check(StoreOp::SortedSetRange, key)?;
        Ok(self
            .keyspace()
            .sorted(key)?
            .map(|set| set.members())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultKind;

    #[tokio::test]
    async fn test_scalar_set_get_delete() {
        let store = MemoryStore::new();

        assert!(matches!(
            store.get("missing").await,
            Err(StoreError::NotFound(_))
        ));

        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), "v");
        assert_eq!(store.key_exists("k").await.unwrap(), 1);

        store.delete_key("k").await.unwrap();
        assert_eq!(store.key_exists("k").await.unwrap(), 0);
        // Deleting again is fine.
        store.delete_key("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_set_struct_expires_after_default_ttl() {
        let store = MemoryStore::new().with_default_ttl(Duration::from_millis(30));

        store.set_struct("record", "{}").await.unwrap();
        assert_eq!(store.get_struct("record").await.unwrap(), "{}");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(
            store.get_struct("record").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.get_keys("*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_expire_time_zero_deletes() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        store.set_expire_time("k", 0).await.unwrap();
        assert_eq!(store.key_exists("k").await.unwrap(), 0);

        // Expiring a missing key is a no-op.
        store.set_expire_time("absent", 10).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_keys_glob() {
        let store = MemoryStore::new();
        store.set("task:1", "a").await.unwrap();
        store.set("task:22", "b").await.unwrap();
        store.set("queue:1", "c").await.unwrap();

        assert_eq!(
            store.get_keys("task:*").await.unwrap(),
            vec!["task:1".to_string(), "task:22".to_string()]
        );
        assert_eq!(store.get_keys("task:?").await.unwrap(), vec!["task:1"]);
        assert_eq!(store.get_keys("*").await.unwrap().len(), 3);
        assert_eq!(store.get_keys("[tq]*:1").await.unwrap(), vec!["queue:1", "task:1"]);
        assert_eq!(store.get_keys("task:[^1]*").await.unwrap(), vec!["task:22"]);
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let store = MemoryStore::new();

        assert_eq!(store.get_hash_key_count("h").await.unwrap(), 0);
        store.set_struct_in_hash("h", "a", "1").await.unwrap();

        let mut many = HashMap::new();
        many.insert("b".to_string(), "2".to_string());
        many.insert("c".to_string(), "3".to_string());
        store.set_multi_struct_in_hash("h", &many).await.unwrap();
        store
            .set_multi_struct_in_hash("h", &HashMap::new())
            .await
            .unwrap();

        assert_eq!(store.get_hash_key_count("h").await.unwrap(), 3);
        assert_eq!(store.get_struct_from_hash("h", "b").await.unwrap(), "2");
        assert_eq!(store.key_exists_in_hash("h", "c").await.unwrap(), 1);
        assert_eq!(store.key_exists_in_hash("h", "z").await.unwrap(), 0);
        assert_eq!(store.get_keys_from_hash("h").await.unwrap(), vec!["a", "b", "c"]);

        store.delete_struct_from_hash("h", "a").await.unwrap();
        assert!(matches!(
            store.get_struct_from_hash("h", "a").await,
            Err(StoreError::NotFound(_))
        ));

        store
            .del_multi_key_from_hash("h", &["b".to_string(), "c".to_string()])
            .await
            .unwrap();
        // The emptied hash is gone.
        assert_eq!(store.key_exists("h").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_hash_write_refreshes_ttl() {
        let store = MemoryStore::new().with_default_ttl(Duration::from_millis(30));
        store.set_struct_in_hash("h", "a", "1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get_hash_key_count("h").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_atomic_increment_is_noop() {
        let store = MemoryStore::new();
        assert_eq!(store.atomic_increment("counter").await.unwrap(), None);
        assert_eq!(store.key_exists("counter").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_as_queue() {
        let store = MemoryStore::new();

        assert!(matches!(
            store.queue_pop("q").await,
            Err(StoreError::EmptyQueue(_))
        ));
        assert!(matches!(
            store.queue_peek("q").await,
            Err(StoreError::EmptyQueue(_))
        ));

        store
            .queue_push("q", &["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();

        assert_eq!(store.queue_peek("q").await.unwrap(), "a");
        assert_eq!(store.queue_peek_index("q", 1).await.unwrap(), "b");
        assert_eq!(store.queue_peek_index("q", -1).await.unwrap(), "c");
        assert!(matches!(
            store.queue_peek_index("q", 3).await,
            Err(StoreError::NotFound(_))
        ));

        assert_eq!(store.queue_pop("q").await.unwrap(), "a");
        assert_eq!(store.queue_pop("q").await.unwrap(), "b");
        assert_eq!(store.queue_pop("q").await.unwrap(), "c");
        assert_eq!(store.key_exists("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sorted_set_rank_breaks_ties_by_member() {
        let store = MemoryStore::new();
        store.add_sorted_set("z", 0, "C").await.unwrap();
        store.add_sorted_set("z", 2, "B").await.unwrap();
        store.add_sorted_set("z", 0, "A").await.unwrap();

        assert_eq!(store.get_rank_sorted_set("z", "A").await.unwrap(), 0);
        assert_eq!(store.get_rank_sorted_set("z", "C").await.unwrap(), 1);
        assert_eq!(store.get_rank_sorted_set("z", "B").await.unwrap(), 2);
        assert_eq!(
            store.get_all_items_sorted_set("z").await.unwrap(),
            vec!["A", "C", "B"]
        );

        // Re-scoring moves the member.
        store.add_sorted_set("z", -1, "B").await.unwrap();
        assert_eq!(store.get_rank_sorted_set("z", "B").await.unwrap(), 0);

        store.remove_sorted_set("z", "B").await.unwrap();
        store.remove_sorted_set("z", "B").await.unwrap();
        assert!(matches!(
            store.get_rank_sorted_set("z", "B").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_type_is_operation_error() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();

        let err = store.queue_pop("k").await.unwrap_err();
        assert!(matches!(err, StoreError::Operation(_)));
        assert!(!err.is_expected());

        // SET replaces any type.
        store.add_sorted_set("z", 1, "m").await.unwrap();
        store.set("z", "plain").await.unwrap();
        assert_eq!(store.get("z").await.unwrap(), "plain");
    }

    #[tokio::test]
    async fn test_fault_policy_blocks_without_touching_state() {
        let store = MemoryStore::with_faults(FaultPolicy::marker_substrings());

        let err = store.set("user:fail-set", "v").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Fault {
                kind: FaultKind::SetFailure,
                op: StoreOp::Set,
                ..
            }
        ));

        store.clear_faults();
        assert_eq!(store.key_exists("user:fail-set").await.unwrap(), 0);
        store.set("user:fail-set", "v").await.unwrap();

        store.set_fault_policy(FaultPolicy::new().fail_op(StoreOp::Delete, FaultKind::Unreachable));
        let err = store.delete_key("user:fail-set").await.unwrap_err();
        assert!(err.is_retryable());
        store.clear_faults();
        assert_eq!(store.get("user:fail-set").await.unwrap(), "v");
    }
}
