//! `notify`-backed watch engine.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;

use super::{
    EngineEvent, EngineEvents, EngineWatchId, EventSink, RawChange, WatchEngine, WatchTable,
    event_channel, route_changes,
};
use crate::watcher::WatchError;
use crate::watcher::protocol::FileChangeType;

/// OS registrations of the shared `RecommendedWatcher`.
///
/// Overlapping recursive watches share per-directory descriptors on inotify,
/// so removing a nested registration also drops it from its ancestors. A root
/// already covered by a registered ancestor is therefore never registered,
/// and ancestors overlapping a removed registration are registered again.
#[derive(Debug, Default)]
struct Registrations {
    /// Live watches per root.
    roots: HashMap<PathBuf, usize>,
    /// Paths currently registered with the OS.
    registered: BTreeSet<PathBuf>,
}

/// OS work needed after a watch is released.
#[derive(Debug, Default, PartialEq, Eq)]
struct Release {
    unwatch: Vec<PathBuf>,
    rewatch: Vec<PathBuf>,
}

impl Registrations {
    /// Whether a registered path already reports events for `root`.
    fn covers(&self, root: &Path) -> bool {
        self.registered.iter().any(|path| root.starts_with(path))
    }

    fn acquire(&mut self, root: &Path, registered: bool) {
        *self.roots.entry(root.to_path_buf()).or_insert(0) += 1;
        if registered {
            self.registered.insert(root.to_path_buf());
        }
    }

    fn release(&mut self, root: &Path) -> Release {
        match self.roots.get_mut(root) {
            Some(count) if *count > 1 => {
                *count -= 1;
                return Release::default();
            }
            Some(_) => {
                self.roots.remove(root);
            }
            None => return Release::default(),
        }

        // A registration is needed while some live root lies at or below it.
        let unwatch: Vec<PathBuf> = self
            .registered
            .iter()
            .filter(|path| !self.roots.keys().any(|live| live.starts_with(path)))
            .cloned()
            .collect();
        for path in &unwatch {
            self.registered.remove(path);
        }

        let rewatch = self
            .registered
            .iter()
            .filter(|path| unwatch.iter().any(|gone| gone.starts_with(path)))
            .cloned()
            .collect();

        Release { unwatch, rewatch }
    }
}

/// Watch engine using the platform's recommended `notify` backend.
///
/// One `RecommendedWatcher` serves every watch. Roots shared by several
/// watches are registered with the OS once and released with the last one.
pub struct NotifyEngine {
    watcher: RecommendedWatcher,
    table: Arc<RwLock<WatchTable>>,
    registrations: Registrations,
    sink: EventSink,
}

impl NotifyEngine {
    /// Create the engine and the queue its events are pushed into.
    pub fn new(capacity: usize) -> Result<(Self, EngineEvents), WatchError> {
        let (sink, events) = event_channel(capacity);
        let table = Arc::new(RwLock::new(WatchTable::default()));
        let callback_table = table.clone();
        let callback_sink = sink.clone();

        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let events = match res {
                Ok(event) => translate(&callback_table.read(), event),
                Err(e) => fatal_events(&callback_table.read(), e),
            };

            for event in events {
                // Closed means the server shut down.
                if !callback_sink.send(event) {
                    break;
                }
            }
        })?;

        Ok((
            Self {
                watcher,
                table,
                registrations: Registrations::default(),
                sink,
            },
            events,
        ))
    }

    fn rewatch(&mut self, path: &Path) {
        match self.watcher.watch(path, RecursiveMode::Recursive) {
            Ok(()) => crate::debug_event!("engine", "rewatched", "{}", path.display()),
            Err(e) => {
                tracing::error!("[engine] failed to restore watch on {}: {e}", path.display());
                let reason = e.to_string();
                for watch in self.table.read().below(path) {
                    self.sink.send(EngineEvent::Fatal {
                        watch: Some(watch),
                        reason: reason.clone(),
                    });
                }
            }
        }
    }
}

impl WatchEngine for NotifyEngine {
    fn start(&mut self, path: &Path, excludes: &[String]) -> Result<EngineWatchId, WatchError> {
        if !path.exists() {
            return Err(WatchError::EngineStart {
                path: path.to_path_buf(),
                reason: "path does not exist".to_string(),
            });
        }

        let id = self.table.write().insert(path, excludes)?;

        let register = !self.registrations.covers(path);
        if register {
            if let Err(e) = self.watcher.watch(path, RecursiveMode::Recursive) {
                self.table.write().remove(id);
                return Err(WatchError::EngineStart {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                });
            }
            crate::debug_event!("engine", "watching", "{}", path.display());
        }
        self.registrations.acquire(path, register);

        Ok(id)
    }

    fn stop(&mut self, watch: EngineWatchId) -> Result<(), WatchError> {
        let Some(root) = self.table.write().remove(watch) else {
            return Ok(());
        };

        let release = self.registrations.release(&root);
        for path in &release.unwatch {
            match self.watcher.unwatch(path) {
                Ok(()) => crate::debug_event!("engine", "unwatched", "{}", path.display()),
                // The root may already be gone (deleted directory).
                Err(e) => tracing::debug!("[engine] unwatch {} failed: {e}", path.display()),
            }
        }
        for path in &release.rewatch {
            self.rewatch(path);
        }
        Ok(())
    }
}

/// Translate a notify event into per-watch engine events.
fn translate(table: &WatchTable, event: Event) -> Vec<EngineEvent> {
    let changes = classify(event);
    if changes.is_empty() {
        return Vec::new();
    }
    route_changes(table, changes)
}

fn classify(event: Event) -> Vec<RawChange> {
    let kind = match event.kind {
        EventKind::Create(_) => FileChangeType::Added,
        EventKind::Remove(_) => FileChangeType::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => FileChangeType::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => FileChangeType::Added,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            let mut changes = Vec::new();
            if let Some(from) = paths.next() {
                changes.push(RawChange::new(from, FileChangeType::Deleted));
            }
            if let Some(to) = paths.next() {
                changes.push(RawChange::new(to, FileChangeType::Added));
            }
            return changes;
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            return event
                .paths
                .into_iter()
                .map(|path| {
                    let kind = if path.exists() {
                        FileChangeType::Added
                    } else {
                        FileChangeType::Deleted
                    };
                    RawChange::new(path, kind)
                })
                .collect();
        }
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => FileChangeType::Updated,
        EventKind::Access(_) => return Vec::new(),
    };

    event
        .paths
        .into_iter()
        .map(|path| RawChange::new(path, kind))
        .collect()
}

/// Fatal events for the watches a notify error ends.
fn fatal_events(table: &WatchTable, error: notify::Error) -> Vec<EngineEvent> {
    match error.kind {
        notify::ErrorKind::MaxFilesWatch => vec![EngineEvent::Fatal {
            watch: None,
            reason: error.to_string(),
        }],
        notify::ErrorKind::WatchNotFound | notify::ErrorKind::PathNotFound
            if !error.paths.is_empty() =>
        {
            let reason = error.to_string();
            table
                .affected_by(&error.paths)
                .into_iter()
                .map(|watch| EngineEvent::Fatal {
                    watch: Some(watch),
                    reason: reason.clone(),
                })
                .collect()
        }
        _ => {
            tracing::error!("[engine] file watch error: {error}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    #[test]
    fn test_classify_basic_kinds() {
        let created = classify(event(EventKind::Create(CreateKind::Folder), &["/w/foo"]));
        assert_eq!(created, vec![RawChange::new("/w/foo", FileChangeType::Added)]);

        let removed = classify(event(EventKind::Remove(RemoveKind::File), &["/w/a"]));
        assert_eq!(removed, vec![RawChange::new("/w/a", FileChangeType::Deleted)]);

        let modified = classify(event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/w/a"],
        ));
        assert_eq!(modified, vec![RawChange::new("/w/a", FileChangeType::Updated)]);
    }

    #[test]
    fn test_classify_ignores_access() {
        let accessed = classify(event(
            EventKind::Access(notify::event::AccessKind::Read),
            &["/w/a"],
        ));
        assert!(accessed.is_empty());
    }

    #[test]
    fn test_classify_rename_both() {
        let renamed = classify(event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/w/old", "/w/new"],
        ));
        assert_eq!(
            renamed,
            vec![
                RawChange::new("/w/old", FileChangeType::Deleted),
                RawChange::new("/w/new", FileChangeType::Added),
            ]
        );
    }

    #[test]
    fn test_handle_limit_is_fatal_for_all_watches() {
        let table = WatchTable::default();
        let error = notify::Error::new(notify::ErrorKind::MaxFilesWatch);

        match fatal_events(&table, error).as_slice() {
            [EngineEvent::Fatal { watch: None, .. }] => {}
            other => panic!("expected global fatal event, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_path_fails_every_overlapping_watch() {
        let mut table = WatchTable::default();
        let outer = table.insert(Path::new("/w"), &[]).unwrap();
        let inner = table.insert(Path::new("/w/a"), &[]).unwrap();
        table.insert(Path::new("/elsewhere"), &[]).unwrap();

        let error = notify::Error::path_not_found().add_path(PathBuf::from("/w/a/x"));
        let failed: Vec<Option<EngineWatchId>> = fatal_events(&table, error)
            .into_iter()
            .map(|event| match event {
                EngineEvent::Fatal { watch, .. } => watch,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();

        assert_eq!(failed, vec![Some(outer), Some(inner)]);
    }

    #[test]
    fn test_generic_error_is_not_fatal() {
        let table = WatchTable::default();
        let error = notify::Error::generic("transient hiccup");
        assert!(fatal_events(&table, error).is_empty());
    }

    #[test]
    fn test_nested_root_under_registered_parent_is_not_registered() {
        let mut registrations = Registrations::default();
        let parent = Path::new("/w");
        let child = Path::new("/w/sub");

        assert!(!registrations.covers(parent));
        registrations.acquire(parent, true);
        assert!(registrations.covers(child));
        registrations.acquire(child, false);

        // Dropping the nested watch must not touch the parent registration.
        assert_eq!(registrations.release(child), Release::default());
        assert_eq!(
            registrations.release(parent),
            Release {
                unwatch: vec![parent.to_path_buf()],
                rewatch: Vec::new(),
            }
        );
    }

    #[test]
    fn test_releasing_nested_registration_restores_parent() {
        let mut registrations = Registrations::default();
        let parent = Path::new("/w");
        let child = Path::new("/w/sub");

        registrations.acquire(child, true);
        assert!(!registrations.covers(parent));
        registrations.acquire(parent, true);

        assert_eq!(
            registrations.release(child),
            Release {
                unwatch: vec![child.to_path_buf()],
                rewatch: vec![parent.to_path_buf()],
            }
        );
    }

    #[test]
    fn test_parent_registration_kept_while_child_lives() {
        let mut registrations = Registrations::default();
        let parent = Path::new("/w");
        let child = Path::new("/w/sub");

        registrations.acquire(child, true);
        registrations.acquire(parent, true);
        registrations.acquire(parent, true);

        assert_eq!(registrations.release(parent), Release::default());
        assert_eq!(registrations.release(parent), Release::default());
        assert_eq!(
            registrations.release(child),
            Release {
                unwatch: vec![parent.to_path_buf(), child.to_path_buf()],
                rewatch: Vec::new(),
            }
        );
    }

    #[test]
    fn test_start_missing_path_fails() {
        let (mut engine, _events) = NotifyEngine::new(8).unwrap();
        let result = engine.start(Path::new("/definitely/not/here/watchmux"), &[]);
        assert!(matches!(result, Err(WatchError::EngineStart { .. })));
    }
}
