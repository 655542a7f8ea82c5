//! Coalescing of file changes within one dispatch window.
//!
//! Editors and build tools often touch the same file several times in quick
//! succession. Changes are collected per client and normalized so a client
//! sees the net effect for each uri, in the order uris first appeared.

use indexmap::IndexMap;

use super::protocol::{FileChange, FileChangeType};

/// Pending changes for one client, keyed by uri.
#[derive(Debug, Default)]
pub struct ChangeCollection {
    pending: IndexMap<String, FileChangeType>,
}

impl ChangeCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change, merging it with any pending change for the same uri.
    pub fn push(&mut self, change: FileChange) {
        let Some(current) = self.pending.get(&change.uri).copied() else {
            self.pending.insert(change.uri, change.kind);
            return;
        };

        match normalize(current, change.kind) {
            Some(kind) => {
                self.pending.insert(change.uri, kind);
            }
            None => {
                // Created and deleted within the window: nothing to report.
                self.pending.shift_remove(&change.uri);
            }
        }
    }

    /// Take all pending changes in first-seen order.
    pub fn drain(&mut self) -> Vec<FileChange> {
        self.pending
            .drain(..)
            .map(|(uri, kind)| FileChange { uri, kind })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

fn normalize(current: FileChangeType, next: FileChangeType) -> Option<FileChangeType> {
    use FileChangeType::*;

    match (current, next) {
        (Added, Deleted) => None,
        (Deleted, Added) => Some(Updated),
        (Added, _) => Some(Added),
        (_, next) => Some(next),
    }
}
