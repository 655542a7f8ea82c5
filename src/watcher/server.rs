//! Multiplexing watcher server.
//!
//! One server task owns the watch registry, the client dispatcher and the
//! native engine. Everything else talks to it through a cloneable
//! [`WatcherServerHandle`], so no state is shared behind locks.
//!
//! ```text
//! WatcherServerHandle ──requests──▶ WatcherServer ◀──events── WatchEngine
//!                                      │
//!                                      ├─ WatchRegistry (handles)
//!                                      ├─ native watches (one per root path)
//!                                      └─ ClientDispatcher ──▶ WatcherClient
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep_until};

use crate::config::WatcherConfig;

use super::collection::ChangeCollection;
use super::dispatcher::{ClientDispatcher, WatcherClient};
use super::engine::{
    EngineEvent, EngineEvents, EngineWatchId, NotifyEngine, RawChange, WatchEngine,
};
use super::filter::IgnoreFilter;
use super::protocol::{
    ClientId, FileChange, FileSystemWatcherErrorParams, WatchOptions, WatcherHandle, path_to_uri,
    uri_to_path,
};
use super::registry::WatchRegistry;
use super::WatchError;

/// Identity of one server instance.
///
/// Two handles with equal epochs talk to the same server, which means watch
/// handles obtained from one are still valid through the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerEpoch {
    process: u32,
    instance: u64,
}

impl ServerEpoch {
    /// Epoch for `instance` within this process.
    pub fn new(instance: u64) -> Self {
        Self {
            process: std::process::id(),
            instance,
        }
    }

    /// Epoch keyed on the current wall-clock time.
    pub fn started_now() -> Self {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Self::new(nanos.unsigned_abs())
    }
}

/// Lifecycle of a native watch. Idle watches are simply absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeState {
    Watching,
    Stopped,
}

#[derive(Debug)]
struct NativeWatch {
    root: PathBuf,
    state: NativeState,
    handles: BTreeSet<WatcherHandle>,
}

/// Snapshot of server bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Live watch requests.
    pub requests: usize,
    /// Native watches currently delivering events.
    pub watching: usize,
    /// Native watches stopped by an engine failure but still referenced.
    pub stopped: usize,
    /// Clients with a registered callback.
    pub clients: usize,
}

enum ServerRequest {
    Watch {
        client: ClientId,
        uri: String,
        options: WatchOptions,
        reply: oneshot::Sender<Result<WatcherHandle, WatchError>>,
    },
    Unwatch {
        handle: WatcherHandle,
        reply: oneshot::Sender<()>,
    },
    RegisterClient {
        client: ClientId,
        callback: Arc<dyn WatcherClient>,
        reply: oneshot::Sender<()>,
    },
    UnregisterClient {
        client: ClientId,
        reply: oneshot::Sender<bool>,
    },
    DisposeClient {
        client: ClientId,
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<ServerStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running [`WatcherServer`].
#[derive(Clone)]
pub struct WatcherServerHandle {
    requests: mpsc::Sender<ServerRequest>,
    next_client_id: Arc<AtomicU64>,
    epoch: ServerEpoch,
}

impl WatcherServerHandle {
    /// Allocate a client id for a new frontend connection.
    pub fn next_client_id(&self) -> ClientId {
        ClientId(self.next_client_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn epoch(&self) -> ServerEpoch {
        self.epoch
    }

    /// Start watching `uri` on behalf of `client`.
    ///
    /// Fails if the engine cannot start a watch for the path.
    pub async fn watch_file_changes2(
        &self,
        client: ClientId,
        uri: &str,
        options: Option<WatchOptions>,
    ) -> Result<WatcherHandle, WatchError> {
        let uri = uri.to_string();
        let options = options.unwrap_or_default();
        self.call(|reply| ServerRequest::Watch {
            client,
            uri,
            options,
            reply,
        })
        .await?
    }

    /// Stop a watch. Unknown or already released handles are a no-op.
    pub async fn unwatch_file_changes2(&self, handle: WatcherHandle) -> Result<(), WatchError> {
        self.call(|reply| ServerRequest::Unwatch { handle, reply })
            .await
    }

    /// Release `handle` without waiting for the server.
    pub fn unwatch_detached(&self, handle: WatcherHandle) {
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(e) = server.unwatch_file_changes2(handle).await {
                crate::debug_event!("server", "detached unwatch failed", "{handle}: {e}");
            }
        });
    }

    /// Route notifications for `client` to `callback`. Last registration wins.
    pub async fn register_client(
        &self,
        client: ClientId,
        callback: Arc<dyn WatcherClient>,
    ) -> Result<(), WatchError> {
        self.call(|reply| ServerRequest::RegisterClient {
            client,
            callback,
            reply,
        })
        .await
    }

    pub async fn unregister_client(&self, client: ClientId) -> Result<bool, WatchError> {
        self.call(|reply| ServerRequest::UnregisterClient { client, reply })
            .await
    }

    /// Unregister `client` and release every request it owns.
    ///
    /// Returns the number of released requests.
    pub async fn dispose_client(&self, client: ClientId) -> Result<usize, WatchError> {
        self.call(|reply| ServerRequest::DisposeClient { client, reply })
            .await
    }

    pub async fn stats(&self) -> Result<ServerStats, WatchError> {
        self.call(|reply| ServerRequest::Stats { reply }).await
    }

    /// Stop every native watch and end the server task.
    pub async fn shutdown(&self) -> Result<(), WatchError> {
        self.call(|reply| ServerRequest::Shutdown { reply }).await
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> ServerRequest,
    ) -> Result<T, WatchError> {
        let (tx, rx) = oneshot::channel();
        self.requests.send(request(tx)).await?;
        Ok(rx.await?)
    }
}

/// The server task state.
pub struct WatcherServer<E: WatchEngine> {
    /// Only touched from the blocking pool.
    engine: Arc<Mutex<E>>,
    registry: WatchRegistry,
    dispatcher: ClientDispatcher,
    natives: HashMap<EngineWatchId, NativeWatch>,
    /// Running native watch per root path.
    by_root: HashMap<PathBuf, EngineWatchId>,
    /// Native watch serving each request.
    request_native: HashMap<WatcherHandle, EngineWatchId>,
    pending: BTreeMap<ClientId, ChangeCollection>,
    flush_at: Option<Instant>,
    coalesce: Duration,
    default_ignored: Vec<String>,
    requests: mpsc::Receiver<ServerRequest>,
    events: EngineEvents,
}

impl WatcherServer<NotifyEngine> {
    /// Spawn a server backed by the platform file-event engine.
    pub fn spawn_native(
        config: &WatcherConfig,
    ) -> Result<(WatcherServerHandle, JoinHandle<()>), WatchError> {
        let (engine, events) = NotifyEngine::new(config.event_capacity)?;
        Ok(WatcherServer::builder(engine, events).config(config).spawn())
    }
}

impl<E: WatchEngine> WatcherServer<E> {
    pub fn builder(engine: E, events: EngineEvents) -> WatcherServerBuilder<E> {
        WatcherServerBuilder::new(engine, events)
    }

    /// Serve requests and engine events until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        crate::log_event!("server", "started");

        loop {
            let flush_at = self.flush_at;

            tokio::select! {
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        self.stop_all().await;
                        break;
                    };
                    if self.handle_request(request).await.is_break() {
                        break;
                    }
                }

                Some(event) = self.events.recv() => self.on_engine_event(event),

                _ = sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                    self.flush();
                }
            }
        }

        crate::log_event!("server", "stopped");
    }

    async fn handle_request(&mut self, request: ServerRequest) -> ControlFlow<()> {
        match request {
            ServerRequest::Watch {
                client,
                uri,
                options,
                reply,
            } => {
                let result = self.watch(client, uri, options).await;
                let _ = reply.send(result);
            }
            ServerRequest::Unwatch { handle, reply } => {
                self.unwatch(handle).await;
                let _ = reply.send(());
            }
            ServerRequest::RegisterClient {
                client,
                callback,
                reply,
            } => {
                self.dispatcher.register_client(client, callback);
                let _ = reply.send(());
            }
            ServerRequest::UnregisterClient { client, reply } => {
                let removed = self.dispatcher.unregister_client(client);
                let _ = reply.send(removed);
            }
            ServerRequest::DisposeClient { client, reply } => {
                let released = self.dispose_client(client).await;
                let _ = reply.send(released);
            }
            ServerRequest::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            ServerRequest::Shutdown { reply } => {
                self.stop_all().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Run `op` against the engine on the blocking pool.
    ///
    /// Engine events keep being routed while the call is in flight.
    async fn with_engine<T, F>(&mut self, op: F) -> Result<T, WatchError>
    where
        T: Send + 'static,
        F: FnOnce(&mut E) -> Result<T, WatchError> + Send + 'static,
    {
        let engine = self.engine.clone();
        let mut call = tokio::task::spawn_blocking(move || op(&mut *engine.lock()));

        loop {
            tokio::select! {
                result = &mut call => {
                    return match result {
                        Ok(result) => result,
                        Err(e) => Err(WatchError::EngineFatal { reason: e.to_string() }),
                    };
                }
                Some(event) = self.events.recv() => self.on_engine_event(event),
            }
        }
    }

    /// Stop a native watch without waiting for the engine.
    fn stop_detached(&self, id: EngineWatchId) {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = engine.lock().stop(id) {
                tracing::debug!("[server] stop of {id} failed: {e}");
            }
        });
    }

    /// Handle `event` and everything queued behind it as one dispatch cycle.
    fn on_engine_event(&mut self, event: EngineEvent) {
        self.handle_engine_event(event);
        while let Some(event) = self.events.try_recv() {
            self.handle_engine_event(event);
        }
        for event in self.events.take_overflow() {
            self.handle_engine_event(event);
        }

        if self.coalesce.is_zero() {
            self.flush();
        } else if self.flush_at.is_none() && !self.pending.is_empty() {
            self.flush_at = Some(Instant::now() + self.coalesce);
        }
    }

    async fn watch(
        &mut self,
        client: ClientId,
        uri: String,
        options: WatchOptions,
    ) -> Result<WatcherHandle, WatchError> {
        let requested = uri_to_path(&uri)?;
        let root = tokio::fs::canonicalize(&requested)
            .await
            .unwrap_or(requested);

        let mut ignored = options.ignored.clone();
        ignored.extend(self.default_ignored.iter().cloned());
        ignored.sort();
        ignored.dedup();
        let filter = IgnoreFilter::new(&root, &ignored)?;

        let native = match self.by_root.get(&root) {
            Some(id) => *id,
            None => {
                let path = root.clone();
                let excludes = self.default_ignored.clone();
                let id = self
                    .with_engine(move |engine| engine.start(&path, &excludes))
                    .await?;
                crate::log_event!("server", "watching", "{}", root.display());
                self.by_root.insert(root.clone(), id);
                self.natives.insert(
                    id,
                    NativeWatch {
                        root: root.clone(),
                        state: NativeState::Watching,
                        handles: BTreeSet::new(),
                    },
                );
                id
            }
        };

        let handle = self.registry.allocate(uri, root, options, filter, client);
        self.request_native.insert(handle, native);
        if let Some(watch) = self.natives.get_mut(&native) {
            watch.handles.insert(handle);
        }

        crate::debug_event!("server", "allocated", "handle {handle} for client {client} on {native}");
        Ok(handle)
    }

    async fn unwatch(&mut self, handle: WatcherHandle) -> bool {
        let Some(request) = self.registry.release(handle) else {
            crate::debug_event!("server", "unwatch ignored", "unknown handle {handle}");
            return false;
        };
        crate::debug_event!("server", "released", "handle {handle} of client {}", request.owner);

        let Some(native_id) = self.request_native.remove(&handle) else {
            return true;
        };

        let unreferenced = match self.natives.get_mut(&native_id) {
            Some(native) => {
                native.handles.remove(&handle);
                native.handles.is_empty()
            }
            None => false,
        };

        if unreferenced {
            if let Some(native) = self.natives.remove(&native_id) {
                if native.state == NativeState::Watching {
                    self.by_root.remove(&native.root);
                    if let Err(e) = self.with_engine(move |engine| engine.stop(native_id)).await {
                        tracing::warn!("[server] failed to stop {}: {e}", native.root.display());
                    }
                    crate::log_event!("server", "stopped watching", "{}", native.root.display());
                }
            }
        }

        true
    }

    async fn dispose_client(&mut self, client: ClientId) -> usize {
        self.dispatcher.unregister_client(client);
        self.pending.remove(&client);

        let handles: Vec<WatcherHandle> = self
            .registry
            .requests_for_client(client)
            .iter()
            .map(|request| request.handle)
            .collect();

        let mut released = 0;
        for handle in handles {
            if self.unwatch(handle).await {
                released += 1;
            }
        }

        crate::log_event!("server", "disposed", "client {client}, released {released} watches");
        released
    }

    fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Changes { watch, changes } => self.route_changes(watch, changes),
            EngineEvent::Fatal { watch, reason } => self.handle_fatal(watch, &reason),
        }
    }

    /// Queue each change for every client with a covering request on `watch`.
    fn route_changes(&mut self, watch: EngineWatchId, changes: Vec<RawChange>) {
        let Some(native) = self.natives.get(&watch) else {
            crate::debug_event!("server", "dropped", "{} changes for released watch {watch}", changes.len());
            return;
        };
        if native.state == NativeState::Stopped {
            return;
        }

        for change in changes {
            let clients: BTreeSet<ClientId> = native
                .handles
                .iter()
                .filter_map(|handle| self.registry.lookup(*handle))
                .filter(|request| request.covers(&change.path))
                .map(|request| request.owner)
                .collect();

            if clients.is_empty() {
                continue;
            }

            let file_change = FileChange::new(&change.path, change.kind);
            for client in clients {
                self.pending
                    .entry(client)
                    .or_default()
                    .push(file_change.clone());
            }
        }
    }

    fn handle_fatal(&mut self, watch: Option<EngineWatchId>, reason: &str) {
        let affected: Vec<EngineWatchId> = match watch {
            Some(id) => vec![id],
            None => self.natives.keys().copied().collect(),
        };

        for id in affected {
            let Some(native) = self.natives.get_mut(&id) else {
                continue;
            };
            if native.state == NativeState::Stopped {
                continue;
            }
            native.state = NativeState::Stopped;
            let root = native.root.clone();

            let clients: BTreeSet<ClientId> = native
                .handles
                .iter()
                .filter_map(|handle| self.registry.lookup(*handle))
                .map(|request| request.owner)
                .collect();

            self.by_root.remove(&root);
            self.stop_detached(id);

            let error = WatchError::EngineFatal {
                reason: reason.to_string(),
            };
            tracing::error!("[server] {}: {error}", root.display());

            self.dispatcher.notify_error(FileSystemWatcherErrorParams {
                clients: clients.into_iter().collect(),
                uri: path_to_uri(&root),
            });
        }
    }

    fn flush(&mut self) {
        self.flush_at = None;
        if self.pending.is_empty() {
            return;
        }

        let batch: BTreeMap<ClientId, Vec<FileChange>> = std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(client, mut collection)| (client, collection.drain()))
            .collect();

        let report = self.dispatcher.fan_out(batch);
        crate::debug_event!(
            "server",
            "flushed",
            "{} delivered, {} dropped, {} failed",
            report.delivered,
            report.dropped,
            report.failed
        );
    }

    fn stats(&self) -> ServerStats {
        let watching = self
            .natives
            .values()
            .filter(|native| native.state == NativeState::Watching)
            .count();

        ServerStats {
            requests: self.registry.len(),
            watching,
            stopped: self.natives.len() - watching,
            clients: self.dispatcher.client_count(),
        }
    }

    async fn stop_all(&mut self) {
        self.flush();
        let natives: Vec<(EngineWatchId, NativeWatch)> = self.natives.drain().collect();
        for (id, native) in natives {
            if native.state == NativeState::Watching {
                if let Err(e) = self.with_engine(move |engine| engine.stop(id)).await {
                    tracing::debug!("[server] stop {} failed: {e}", native.root.display());
                }
            }
        }
        self.by_root.clear();
        self.request_native.clear();
    }
}

/// Builder for a [`WatcherServer`].
pub struct WatcherServerBuilder<E: WatchEngine> {
    engine: E,
    events: EngineEvents,
    epoch: Option<ServerEpoch>,
    coalesce_ms: u64,
    request_capacity: usize,
    default_ignored: Vec<String>,
}

impl<E: WatchEngine> WatcherServerBuilder<E> {
    pub fn new(engine: E, events: EngineEvents) -> Self {
        let defaults = WatcherConfig::default();
        Self {
            engine,
            events,
            epoch: None,
            coalesce_ms: defaults.coalesce_ms,
            request_capacity: defaults.request_capacity,
            default_ignored: defaults.default_ignored,
        }
    }

    /// Apply every setting from the watcher configuration section.
    pub fn config(mut self, config: &WatcherConfig) -> Self {
        self.coalesce_ms = config.coalesce_ms;
        self.request_capacity = config.request_capacity;
        self.default_ignored = config.default_ignored.clone();
        self
    }

    /// Window for merging changes before dispatch. Zero dispatches every engine batch.
    pub fn coalesce_ms(mut self, ms: u64) -> Self {
        self.coalesce_ms = ms;
        self
    }

    pub fn request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = capacity;
        self
    }

    /// Identity reported to clients. Defaults to [`ServerEpoch::started_now`].
    pub fn epoch(mut self, epoch: ServerEpoch) -> Self {
        self.epoch = Some(epoch);
        self
    }

    /// Globs ignored for every request.
    pub fn default_ignored(mut self, patterns: Vec<String>) -> Self {
        self.default_ignored = patterns;
        self
    }

    /// Build the server without starting it.
    pub fn build(self) -> (WatcherServer<E>, WatcherServerHandle) {
        let (tx, rx) = mpsc::channel(self.request_capacity.max(1));

        let server = WatcherServer {
            engine: Arc::new(Mutex::new(self.engine)),
            registry: WatchRegistry::new(),
            dispatcher: ClientDispatcher::new(),
            natives: HashMap::new(),
            by_root: HashMap::new(),
            request_native: HashMap::new(),
            pending: BTreeMap::new(),
            flush_at: None,
            coalesce: Duration::from_millis(self.coalesce_ms),
            default_ignored: self.default_ignored,
            requests: rx,
            events: self.events,
        };

        let handle = WatcherServerHandle {
            requests: tx,
            next_client_id: Arc::new(AtomicU64::new(1)),
            epoch: self.epoch.unwrap_or_else(ServerEpoch::started_now),
        };

        (server, handle)
    }

    /// Build the server and run it on a new task.
    pub fn spawn(self) -> (WatcherServerHandle, JoinHandle<()>) {
        let (server, handle) = self.build();
        let task = tokio::spawn(server.run());
        (handle, task)
    }
}
