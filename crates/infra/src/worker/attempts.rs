//! Attempt counters scoped to `(run, generation)`.

use std::collections::HashMap;

use runrelay_core::RunId;

/// Key of one attempt budget.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttemptKey {
    pub run_id: RunId,
    pub replay_seq: u64,
}

impl AttemptKey {
    pub fn new(run_id: RunId, replay_seq: u64) -> Self {
        Self { run_id, replay_seq }
    }
}

impl std::fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.run_id, self.replay_seq)
    }
}

/// Per-generation attempt counters.
///
/// Owned by a single worker; only one attempt is ever in flight per worker,
/// so no locking is needed. A counter exists only while its generation is
/// neither succeeded nor dead-lettered.
#[derive(Debug, Default)]
pub struct AttemptTracker {
    counts: HashMap<AttemptKey, u32>,
}

impl AttemptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more dequeue of `key`; returns the new attempt number.
    pub fn begin(&mut self, key: &AttemptKey) -> u32 {
        let count = self.counts.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn current(&self, key: &AttemptKey) -> Option<u32> {
        self.counts.get(key).copied()
    }

    /// Forget `key` (terminal success or dead-lettering).
    pub fn clear(&mut self, key: &AttemptKey) {
        self.counts.remove(key);
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
