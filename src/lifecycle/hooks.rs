//! Index-control and reindex-scheduling hooks.
//!
//! The lifecycle pauses index side effects for the body of a version
//! transaction and schedules reindexing only after commit. Both seams are
//! traits so callers can plug in a search backend and a task queue.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::types::{ResourceId, ResourceKind};

/// Suspends and resumes index-update side effects.
pub trait IndexControl: Send + Sync {
    /// Stop applying index updates.
    fn pause_indexing(&self);

    /// Resume applying index updates.
    fn resume_indexing(&self);
}

/// Schedules asynchronous reindexing of a resource row.
pub trait ReindexScheduler: Send + Sync {
    /// Queue a reindex. Called strictly after commit.
    fn schedule_reindex(&self, kind: ResourceKind, id: ResourceId);
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpIndexer;

impl IndexControl for NoOpIndexer {
    fn pause_indexing(&self) {}

    fn resume_indexing(&self) {}
}

impl ReindexScheduler for NoOpIndexer {
    fn schedule_reindex(&self, _kind: ResourceKind, _id: ResourceId) {}
}

/// RAII pause: pauses on creation, resumes on drop.
///
/// Resumption runs on every exit path, including errors and panics.
pub struct IndexingPause {
    control: Arc<dyn IndexControl>,
}

impl IndexingPause {
    /// Pause indexing until the guard is dropped.
    pub fn new(control: Arc<dyn IndexControl>) -> Self {
        control.pause_indexing();
        Self { control }
    }
}

impl Drop for IndexingPause {
    fn drop(&mut self) {
        self.control.resume_indexing();
    }
}

/// Event observed by [`RecordingIndexer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IndexEvent {
    /// Indexing paused.
    Paused,
    /// Indexing resumed.
    Resumed,
    /// Reindex scheduled.
    Reindex {
        /// Resource kind.
        kind: ResourceKind,
        /// Row id.
        id: ResourceId,
    },
}

/// Test double that records every hook call in order.
#[derive(Debug, Default)]
pub struct RecordingIndexer {
    events: Mutex<Vec<IndexEvent>>,
}

impl RecordingIndexer {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events so far.
    pub fn events(&self) -> Vec<IndexEvent> {
        self.events.lock().clone()
    }

    /// Row ids scheduled for reindex, in order.
    pub fn reindexed(&self) -> Vec<ResourceId> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                IndexEvent::Reindex { id, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// True if every pause has a matching resume.
    pub fn is_balanced(&self) -> bool {
        let events = self.events.lock();
        let paused = events.iter().filter(|e| **e == IndexEvent::Paused).count();
        let resumed = events.iter().filter(|e| **e == IndexEvent::Resumed).count();
        paused == resumed
    }

    /// Forget recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl IndexControl for RecordingIndexer {
    fn pause_indexing(&self) {
        self.events.lock().push(IndexEvent::Paused);
    }

    fn resume_indexing(&self) {
        self.events.lock().push(IndexEvent::Resumed);
    }
}

impl ReindexScheduler for RecordingIndexer {
    fn schedule_reindex(&self, kind: ResourceKind, id: ResourceId) {
        self.events.lock().push(IndexEvent::Reindex { kind, id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_guard_resumes_on_drop() {
        let recorder = Arc::new(RecordingIndexer::new());
        {
            let _pause = IndexingPause::new(recorder.clone());
            assert_eq!(recorder.events(), vec![IndexEvent::Paused]);
            assert!(!recorder.is_balanced());
        }
        assert_eq!(recorder.events(), vec![IndexEvent::Paused, IndexEvent::Resumed]);
        assert!(recorder.is_balanced());
    }

    #[test]
    fn test_reindex_recorded() {
        let recorder = RecordingIndexer::new();
        let id = ResourceId::generate();
        recorder.schedule_reindex(ResourceKind::Mapping, id);
        assert_eq!(recorder.reindexed(), vec![id]);
        recorder.clear();
        assert!(recorder.events().is_empty());
    }
}
