//! Native watch engine abstraction.
//!
//! The server owns exactly one engine. Engines start and stop recursive
//! watches and push [`EngineEvent`]s into the channel handed out at
//! construction time. Engine callbacks never wait on the server: when the
//! event queue is full the dropped batch is remembered and the watches it
//! belonged to are failed once the server drains the queue.

mod manual;
mod native;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use super::filter::IgnoreFilter;
use super::protocol::FileChangeType;
use super::WatchError;

pub use manual::{ManualController, ManualEngine};
pub use native::NotifyEngine;

/// Identifier of one native watch inside an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineWatchId(pub u64);

impl fmt::Display for EngineWatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A change reported by the engine, before routing to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    pub path: PathBuf,
    pub kind: FileChangeType,
}

impl RawChange {
    pub fn new(path: impl Into<PathBuf>, kind: FileChangeType) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Events pushed by an engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Changes observed under one native watch, in observation order.
    Changes {
        watch: EngineWatchId,
        changes: Vec<RawChange>,
    },
    /// The engine can no longer serve a watch. `None` means every watch.
    Fatal {
        watch: Option<EngineWatchId>,
        reason: String,
    },
}

const OVERFLOW_REASON: &str = "event queue overflowed, changes were dropped";

/// Watches whose events were dropped on a full queue.
#[derive(Debug, Default)]
struct Overflow {
    all: bool,
    watches: BTreeSet<EngineWatchId>,
}

impl Overflow {
    fn record(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::Changes { watch, .. } | EngineEvent::Fatal { watch: Some(watch), .. } => {
                self.watches.insert(*watch);
            }
            EngineEvent::Fatal { watch: None, .. } => self.all = true,
        }
    }
}

/// Sending half of the engine event queue.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<EngineEvent>,
    overflow: Arc<Mutex<Overflow>>,
}

impl EventSink {
    /// Queue `event` without blocking. Returns `false` once the server is gone.
    pub(crate) fn send(&self, event: EngineEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                let mut overflow = self.overflow.lock();
                if !overflow.all && overflow.watches.is_empty() {
                    tracing::warn!("[engine] event queue full, dropping changes");
                }
                overflow.record(&event);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queue `event`, waiting for room.
    pub(crate) async fn send_wait(&self, event: EngineEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

/// Receiving half of the engine event queue, owned by the server.
#[derive(Debug)]
pub struct EngineEvents {
    rx: mpsc::Receiver<EngineEvent>,
    overflow: Arc<Mutex<Overflow>>,
}

impl EngineEvents {
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }

    /// Next queued event, if one is ready.
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Fatal events for every watch that lost events since the last call.
    pub fn take_overflow(&self) -> Vec<EngineEvent> {
        let overflow = std::mem::take(&mut *self.overflow.lock());
        if overflow.all {
            return vec![EngineEvent::Fatal {
                watch: None,
                reason: OVERFLOW_REASON.to_string(),
            }];
        }
        overflow
            .watches
            .into_iter()
            .map(|watch| EngineEvent::Fatal {
                watch: Some(watch),
                reason: OVERFLOW_REASON.to_string(),
            })
            .collect()
    }
}

/// Create a bounded engine event queue.
pub(crate) fn event_channel(capacity: usize) -> (EventSink, EngineEvents) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let overflow = Arc::new(Mutex::new(Overflow::default()));
    (
        EventSink {
            tx,
            overflow: overflow.clone(),
        },
        EngineEvents { rx, overflow },
    )
}

/// Native file-event engine.
///
/// Calls may block on OS work, so the server runs them on the blocking pool.
pub trait WatchEngine: Send + 'static {
    /// Start a recursive watch on `path`, skipping paths matched by `excludes`.
    fn start(&mut self, path: &Path, excludes: &[String]) -> Result<EngineWatchId, WatchError>;

    /// Stop a watch. Unknown ids are ignored.
    fn stop(&mut self, watch: EngineWatchId) -> Result<(), WatchError>;
}

/// Active watches of an engine, used to attribute raw paths to watch ids.
#[derive(Debug, Default)]
pub(crate) struct WatchTable {
    watches: HashMap<EngineWatchId, (PathBuf, IgnoreFilter)>,
    next_id: u64,
}

impl WatchTable {
    pub(crate) fn insert(&mut self, root: &Path, excludes: &[String]) -> Result<EngineWatchId, WatchError> {
        let filter = IgnoreFilter::new(root, excludes)?;
        self.next_id += 1;
        let id = EngineWatchId(self.next_id);
        self.watches.insert(id, (root.to_path_buf(), filter));
        Ok(id)
    }

    pub(crate) fn remove(&mut self, id: EngineWatchId) -> Option<PathBuf> {
        self.watches.remove(&id).map(|(root, _)| root)
    }

    /// Whether any other watch still uses `root`.
    pub(crate) fn has_root(&self, root: &Path) -> bool {
        self.watches.values().any(|(r, _)| r == root)
    }

    /// Watches whose root contains `path` and whose excludes let it through.
    pub(crate) fn route(&self, path: &Path) -> Vec<EngineWatchId> {
        let mut ids: Vec<EngineWatchId> = self
            .watches
            .iter()
            .filter(|(_, (root, filter))| path.starts_with(root) && !filter.is_ignored(path))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Watches whose root lies at or below `path`.
    pub(crate) fn below(&self, path: &Path) -> Vec<EngineWatchId> {
        let mut ids: Vec<EngineWatchId> = self
            .watches
            .iter()
            .filter(|(_, (root, _))| root.starts_with(path))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Watches whose root lies at or below any of `paths`, or contains one.
    pub(crate) fn affected_by(&self, paths: &[PathBuf]) -> Vec<EngineWatchId> {
        let mut ids: Vec<EngineWatchId> = self
            .watches
            .iter()
            .filter(|(_, (root, _))| {
                paths
                    .iter()
                    .any(|p| p.starts_with(root) || root.starts_with(p))
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub(crate) fn len(&self) -> usize {
        self.watches.len()
    }
}

/// Group raw changes by the watches that should see them, keeping order.
pub(crate) fn route_changes(
    table: &WatchTable,
    changes: impl IntoIterator<Item = RawChange>,
) -> Vec<EngineEvent> {
    let mut grouped: Vec<(EngineWatchId, Vec<RawChange>)> = Vec::new();

    for change in changes {
        for id in table.route(&change.path) {
            match grouped.iter_mut().find(|(watch, _)| *watch == id) {
                Some((_, list)) => list.push(change.clone()),
                None => grouped.push((id, vec![change.clone()])),
            }
        }
    }

    grouped
        .into_iter()
        .map(|(watch, changes)| EngineEvent::Changes { watch, changes })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_respects_roots_and_excludes() {
        let mut table = WatchTable::default();
        let all = table.insert(Path::new("/work"), &[]).unwrap();
        let filtered = table
            .insert(Path::new("/work"), &["**/target".to_string()])
            .unwrap();
        let other = table.insert(Path::new("/elsewhere"), &[]).unwrap();

        assert_eq!(table.route(Path::new("/work/src/lib.rs")), vec![all, filtered]);
        assert_eq!(table.route(Path::new("/work/target/debug")), vec![all]);
        assert_eq!(table.route(Path::new("/elsewhere/a")), vec![other]);
        assert!(table.route(Path::new("/nowhere")).is_empty());
    }

    #[test]
    fn test_has_root_tracks_shared_roots() {
        let mut table = WatchTable::default();
        let a = table.insert(Path::new("/work"), &[]).unwrap();
        let b = table.insert(Path::new("/work"), &["*.log".to_string()]).unwrap();

        table.remove(a);
        assert!(table.has_root(Path::new("/work")));
        table.remove(b);
        assert!(!table.has_root(Path::new("/work")));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_route_changes_groups_per_watch() {
        let mut table = WatchTable::default();
        let a = table.insert(Path::new("/a"), &[]).unwrap();
        let b = table.insert(Path::new("/b"), &[]).unwrap();

        let events = route_changes(
            &table,
            vec![
                RawChange::new("/a/1", FileChangeType::Added),
                RawChange::new("/b/1", FileChangeType::Added),
                RawChange::new("/a/2", FileChangeType::Updated),
            ],
        );

        assert_eq!(events.len(), 2);
        match &events[0] {
            EngineEvent::Changes { watch, changes } => {
                assert_eq!(*watch, a);
                assert_eq!(changes.len(), 2);
                assert_eq!(changes[1].path, PathBuf::from("/a/2"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &events[1] {
            EngineEvent::Changes { watch, changes } => {
                assert_eq!(*watch, b);
                assert_eq!(changes.len(), 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_affected_by() {
        let mut table = WatchTable::default();
        let a = table.insert(Path::new("/work/a"), &[]).unwrap();
        table.insert(Path::new("/other"), &[]).unwrap();

        assert_eq!(table.affected_by(&[PathBuf::from("/work")]), vec![a]);
        assert_eq!(table.affected_by(&[PathBuf::from("/work/a/deep")]), vec![a]);
    }

    fn changes_for(watch: u64) -> EngineEvent {
        EngineEvent::Changes {
            watch: EngineWatchId(watch),
            changes: vec![RawChange::new("/w/a", FileChangeType::Added)],
        }
    }

    #[tokio::test]
    async fn test_full_queue_fails_dropped_watches() {
        let (sink, mut events) = event_channel(1);

        assert!(sink.send(changes_for(1)));
        assert!(sink.send(changes_for(2)));
        assert!(sink.send(changes_for(2)));

        assert!(matches!(
            events.recv().await,
            Some(EngineEvent::Changes { watch: EngineWatchId(1), .. })
        ));
        assert!(events.try_recv().is_none());

        match events.take_overflow().as_slice() {
            [EngineEvent::Fatal { watch: Some(EngineWatchId(2)), .. }] => {}
            other => panic!("expected one fatal event, got {other:?}"),
        }
        assert!(events.take_overflow().is_empty());
    }

    #[test]
    fn test_dropped_global_failure_stays_global() {
        let (sink, events) = event_channel(1);
        sink.send(changes_for(1));
        sink.send(EngineEvent::Fatal {
            watch: None,
            reason: "limit".to_string(),
        });

        match events.take_overflow().as_slice() {
            [EngineEvent::Fatal { watch: None, .. }] => {}
            other => panic!("expected a global fatal event, got {other:?}"),
        }
    }

    #[test]
    fn test_send_reports_closed_queue() {
        let (sink, events) = event_channel(4);
        drop(events);
        assert!(!sink.send(changes_for(1)));
    }

    #[test]
    fn test_below_selects_nested_roots() {
        let mut table = WatchTable::default();
        let outer = table.insert(Path::new("/w"), &[]).unwrap();
        let inner = table.insert(Path::new("/w/a"), &[]).unwrap();

        assert_eq!(table.below(Path::new("/w")), vec![outer, inner]);
        assert_eq!(table.below(Path::new("/w/a")), vec![inner]);
    }
}
