//! In-memory engine driven by hand, for deterministic tests and embedding.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    EngineEvent, EngineEvents, EngineWatchId, EventSink, RawChange, WatchEngine, WatchTable,
    event_channel, route_changes,
};
use crate::watcher::WatchError;
use crate::watcher::protocol::FileChangeType;

#[derive(Debug, Default)]
struct ManualState {
    table: WatchTable,
    rejected: HashSet<PathBuf>,
    starts: usize,
    stops: usize,
}

/// Engine that only reports the changes its [`ManualController`] emits.
pub struct ManualEngine {
    state: Arc<Mutex<ManualState>>,
}

/// Test-side handle of a [`ManualEngine`].
#[derive(Clone)]
pub struct ManualController {
    state: Arc<Mutex<ManualState>>,
    events: EventSink,
}

impl ManualEngine {
    pub fn new(capacity: usize) -> (Self, ManualController, EngineEvents) {
        let (tx, rx) = event_channel(capacity);
        let state = Arc::new(Mutex::new(ManualState::default()));

        (
            Self {
                state: state.clone(),
            },
            ManualController { state, events: tx },
            rx,
        )
    }
}

impl WatchEngine for ManualEngine {
    fn start(&mut self, path: &Path, excludes: &[String]) -> Result<EngineWatchId, WatchError> {
        let mut state = self.state.lock();
        if state.rejected.contains(path) {
            return Err(WatchError::EngineStart {
                path: path.to_path_buf(),
                reason: "path does not exist".to_string(),
            });
        }
        state.starts += 1;
        state.table.insert(path, excludes)
    }

    fn stop(&mut self, watch: EngineWatchId) -> Result<(), WatchError> {
        let mut state = self.state.lock();
        if state.table.remove(watch).is_some() {
            state.stops += 1;
        }
        Ok(())
    }
}

impl ManualController {
    /// Make future starts on `path` fail.
    pub fn reject(&self, path: impl Into<PathBuf>) {
        self.state.lock().rejected.insert(path.into());
    }

    /// Emit one change to every watch covering `path`.
    pub async fn emit(&self, path: impl Into<PathBuf>, kind: FileChangeType) -> usize {
        self.emit_batch(vec![RawChange::new(path, kind)]).await
    }

    /// Emit changes as one engine batch. Returns the number of watch events sent.
    pub async fn emit_batch(&self, changes: Vec<RawChange>) -> usize {
        let events = {
            let state = self.state.lock();
            route_changes(&state.table, changes)
        };

        let count = events.len();
        for event in events {
            if !self.events.send_wait(event).await {
                return 0;
            }
        }
        count
    }

    /// Report a fatal failure for the watches touching `path`, or all of them.
    pub async fn fail(&self, path: Option<&Path>, reason: &str) {
        let watches: Vec<Option<EngineWatchId>> = match path {
            None => vec![None],
            Some(path) => {
                let state = self.state.lock();
                state
                    .table
                    .affected_by(&[path.to_path_buf()])
                    .into_iter()
                    .map(Some)
                    .collect()
            }
        };

        for watch in watches {
            let event = EngineEvent::Fatal {
                watch,
                reason: reason.to_string(),
            };
            if !self.events.send_wait(event).await {
                return;
            }
        }
    }

    /// Number of native watches currently running.
    pub fn active_watches(&self) -> usize {
        self.state.lock().table.len()
    }

    /// Whether a native watch is running for `root`.
    pub fn is_watching(&self, root: &Path) -> bool {
        self.state.lock().table.has_root(root)
    }

    pub fn start_count(&self) -> usize {
        self.state.lock().starts
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().stops
    }
}
