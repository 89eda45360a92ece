//! Bounded recency cache of dead-letter records.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::RwLock;

use runrelay_core::RunId;
use runrelay_events::DeadLetterRecord;

/// Least-recently-inserted cache with a fixed capacity.
///
/// - last write wins per key; a re-insert also makes the key the most recent
/// - once the capacity is exceeded the least recently inserted key is evicted
/// - eviction order is a strict insertion sequence, so ties cannot happen
#[derive(Debug, Clone)]
pub struct RecencyCache<K, V> {
    capacity: usize,
    next_seq: u64,
    order: BTreeMap<u64, K>,
    entries: HashMap<K, (u64, V)>,
}

impl<K, V> RecencyCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_seq: 0,
            order: BTreeMap::new(),
            entries: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert or replace; returns the keys evicted to stay within capacity.
    pub fn insert(&mut self, key: K, value: V) -> Vec<K> {
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some((old_seq, _)) = self.entries.insert(key.clone(), (seq, value)) {
            self.order.remove(&old_seq);
        }
        self.order.insert(seq, key);

        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            evicted.push(oldest);
        }
        evicted
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|(_, value)| value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys from least to most recently inserted.
    pub fn keys_by_recency(&self) -> Vec<K> {
        self.order.values().cloned().collect()
    }
}

/// Dead-letter lookup failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DlqLookupError {
    #[error("no dead letter cached for run {0}")]
    NotFound(RunId),
}

/// Shared dead-letter cache keyed by run.
#[derive(Debug, Clone)]
pub struct DlqCache {
    inner: Arc<RwLock<RecencyCache<RunId, DeadLetterRecord>>>,
}

impl Default for DlqCache {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl DlqCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RecencyCache::new(capacity))),
        }
    }

    /// Cache `record` under its run; returns evicted runs.
    pub async fn insert(&self, record: DeadLetterRecord) -> Vec<RunId> {
        let run_id = record.run_id.clone();
        self.inner.write().await.insert(run_id, record)
    }

    pub async fn get(&self, run_id: &RunId) -> Option<DeadLetterRecord> {
        self.inner.read().await.get(run_id).cloned()
    }

    pub async fn lookup(&self, run_id: &RunId) -> Result<DeadLetterRecord, DlqLookupError> {
        self.get(run_id)
            .await
            .ok_or_else(|| DlqLookupError::NotFound(run_id.clone()))
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
