//! Volatile run registry.
//!
//! Maps run identifiers to their metadata. Entries are never deleted; the
//! registry lives exactly as long as the process (rebuildable from the event
//! stream in principle, not persisted).

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use runrelay_core::{DomainError, DomainResult, RunId, Step};
use runrelay_events::now_ms;

/// Run metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Run {
    pub run_id: RunId,
    pub workflow: String,
    pub input: JsonValue,
    /// Failure-injection point chosen at creation. Replays override it per
    /// execution but never rewrite it.
    pub fail_at: Option<Step>,
    /// Replay generation; 0 at creation, +1 per replay.
    pub replay_seq: u64,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

impl Run {
    pub fn new(workflow: impl Into<String>, input: JsonValue, fail_at: Option<Step>) -> Self {
        Self {
            run_id: RunId::new(),
            workflow: workflow.into(),
            input,
            fail_at,
            replay_seq: 0,
            created_at: now_ms(),
        }
    }
}

/// Shared, cloneable handle to the run table.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    runs: Arc<RwLock<HashMap<RunId, Run>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, run: Run) {
        self.runs.write().await.insert(run.run_id.clone(), run);
    }

    pub async fn get(&self, run_id: &RunId) -> Option<Run> {
        self.runs.read().await.get(run_id).cloned()
    }

    pub async fn contains(&self, run_id: &RunId) -> bool {
        self.runs.read().await.contains_key(run_id)
    }

    /// Advance the replay generation by exactly one.
    ///
    /// Returns a snapshot taken under the same write lock, so concurrent
    /// replays of one run always observe distinct generations.
    pub async fn begin_replay(&self, run_id: &RunId) -> DomainResult<Run> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(run_id).ok_or_else(DomainError::not_found)?;
        run.replay_seq += 1;
        Ok(run.clone())
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}
