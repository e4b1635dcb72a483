//! Change tracking: the local intents that still have to be pushed.
//!
//! One pending modification per path, last write wins. Renames are split into a
//! create of the new path and a delete of the old one at record time, so the
//! pending set never holds a standalone rename.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// A local intent for a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    Create { path: String },
    Update { path: String },
    Delete { path: String },
    Rename { path: String, previous_path: String },
}

impl Modification {
    pub fn path(&self) -> &str {
        match self {
            Modification::Create { path }
            | Modification::Update { path }
            | Modification::Delete { path }
            | Modification::Rename { path, .. } => path,
        }
    }
}

/// Kind of change reported by the host for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
    Rename { previous_path: String },
}

/// Pending modifications keyed by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChangeSet {
    changes: BTreeMap<String, Modification>,
}

impl PendingChangeSet {
    pub fn get(&self, path: &str) -> Option<&Modification> {
        self.changes.get(path)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Modifications in path order.
    pub fn iter(&self) -> impl Iterator<Item = &Modification> {
        self.changes.values()
    }

    fn insert(&mut self, modification: Modification) {
        self.changes
            .insert(modification.path().to_string(), modification);
    }
}

impl IntoIterator for PendingChangeSet {
    type Item = Modification;
    type IntoIter = std::collections::btree_map::IntoValues<String, Modification>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_values()
    }
}

/// Records local intents since the last push.
///
/// Cloning shares the underlying set.
#[derive(Clone, Default)]
pub struct ChangeTracker {
    pending: Arc<Mutex<PendingChangeSet>>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_create(&self, path: &str) {
        self.insert(Modification::Create {
            path: path.to_string(),
        });
    }

    pub fn record_update(&self, path: &str) {
        self.insert(Modification::Update {
            path: path.to_string(),
        });
    }

    pub fn record_delete(&self, path: &str) {
        self.insert(Modification::Delete {
            path: path.to_string(),
        });
    }

    /// Record a move from `previous_path` to `path`.
    pub fn record_rename(&self, path: &str, previous_path: &str) {
        self.record_create(path);
        self.record_delete(previous_path);
    }

    /// Dispatch a host-reported change.
    pub fn record(&self, path: &str, kind: &ChangeKind) {
        match kind {
            ChangeKind::Create => self.record_create(path),
            ChangeKind::Update => self.record_update(path),
            ChangeKind::Delete => self.record_delete(path),
            ChangeKind::Rename { previous_path } => self.record_rename(path, previous_path),
        }
    }

    /// Take the current set, leaving an empty one behind.
    pub fn drain(&self) -> PendingChangeSet {
        std::mem::take(&mut *self.lock())
    }

    /// Copy of the current set.
    pub fn peek(&self) -> PendingChangeSet {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn insert(&self, modification: Modification) {
        tracing::trace!("Recording {:?}", modification);
        self.lock().insert(modification);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingChangeSet> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_update_coalesces() {
        let tracker = ChangeTracker::new();
        tracker.record_update("note.md");
        tracker.record_update("note.md");

        let pending = tracker.drain();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending.get("note.md"),
            Some(&Modification::Update {
                path: "note.md".into()
            })
        );
    }

    #[test]
    fn test_last_write_wins() {
        let tracker = ChangeTracker::new();
        tracker.record_create("note.md");
        tracker.record_delete("note.md");

        let pending = tracker.drain();
        assert_eq!(pending.len(), 1);
        assert!(matches!(
            pending.get("note.md"),
            Some(Modification::Delete { .. })
        ));
    }

    #[test]
    fn test_rename_splits_into_create_and_delete() {
        let tracker = ChangeTracker::new();
        tracker.record_rename("new.md", "old.md");

        let pending = tracker.drain();
        assert_eq!(pending.len(), 2);
        assert_eq!(
            pending.get("new.md"),
            Some(&Modification::Create {
                path: "new.md".into()
            })
        );
        assert_eq!(
            pending.get("old.md"),
            Some(&Modification::Delete {
                path: "old.md".into()
            })
        );
        assert!(
            !pending
                .iter()
                .any(|m| matches!(m, Modification::Rename { .. }))
        );
    }

    #[test]
    fn test_drain_clears_and_peek_does_not() {
        let tracker = ChangeTracker::new();
        tracker.record_update("a.md");

        assert_eq!(tracker.peek().len(), 1);
        assert_eq!(tracker.len(), 1);

        let drained = tracker.drain();
        assert_eq!(drained.len(), 1);
        assert!(tracker.is_empty());
        assert!(tracker.drain().is_empty());
    }

    #[test]
    fn test_record_dispatches_kinds() {
        let tracker = ChangeTracker::new();
        tracker.record("a.md", &ChangeKind::Create);
        tracker.record("b.md", &ChangeKind::Update);
        tracker.record(
            "c.md",
            &ChangeKind::Rename {
                previous_path: "b.md".into(),
            },
        );

        let pending = tracker.drain();
        let paths: Vec<_> = pending.iter().map(|m| m.path().to_string()).collect();
        assert_eq!(paths, vec!["a.md", "b.md", "c.md"]);
        assert!(matches!(pending.get("b.md"), Some(Modification::Delete { .. })));
    }
}
