//! Watch bookkeeping that survives connection loss.
//!
//! [`ReconnectingWatcher`] hands out local handles that stay valid across
//! reconnects. Every live request is recorded so it can be replayed against a
//! fresh server session. When the new connection belongs to the same session
//! the server kept its state, and nothing is replayed.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU64;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::client::{FileSystemWatcher, SessionKey};
use super::dispatcher::WatcherClient;
use super::protocol::{WatchOptions, WatcherHandle};
use super::WatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
}

/// Parameters of one watch call, kept for replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchParams {
    pub uri: String,
    pub options: WatchOptions,
}

/// Outcome of [`ReconnectingWatcher::connection_restored`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    /// The server kept the previous session, so existing mappings were reused.
    pub retained: bool,
    pub replayed: usize,
    pub failed: usize,
}

struct Inner {
    state: ConnectionState,
    remote: Option<Arc<dyn FileSystemWatcher>>,
    session: Option<SessionKey>,
    client: Option<Arc<dyn WatcherClient>>,
    watch_params: BTreeMap<WatcherHandle, WatchParams>,
    local_to_remote: HashMap<WatcherHandle, WatcherHandle>,
    next_local: NonZeroU64,
}

/// Frontend-side watcher that replays its requests after reconnecting.
pub struct ReconnectingWatcher {
    inner: Mutex<Inner>,
}

impl Default for ReconnectingWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectingWatcher {
    /// Start disconnected. Watches made before the first connection are replayed on it.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::Reconnecting,
                remote: None,
                session: None,
                client: None,
                watch_params: BTreeMap::new(),
                local_to_remote: HashMap::new(),
                next_local: NonZeroU64::MIN,
            }),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Remote handle currently backing `local`, if any.
    pub async fn remote_handle(&self, local: WatcherHandle) -> Option<WatcherHandle> {
        self.inner.lock().await.local_to_remote.get(&local).copied()
    }

    /// Number of requests that would be replayed on a fresh session.
    pub async fn tracked(&self) -> usize {
        self.inner.lock().await.watch_params.len()
    }

    /// Record a watch and forward it when connected.
    ///
    /// While reconnecting the local handle is returned immediately and the
    /// request is sent once the connection is restored.
    pub async fn watch_file_changes(
        &self,
        uri: &str,
        options: WatchOptions,
    ) -> Result<WatcherHandle, WatchError> {
        let mut inner = self.inner.lock().await;

        let local = WatcherHandle::from(inner.next_local);
        inner.next_local = inner.next_local.saturating_add(1);

        let params = WatchParams {
            uri: uri.to_string(),
            options,
        };

        if let (ConnectionState::Connected, Some(remote)) = (inner.state, inner.remote.clone()) {
            let remote_handle = remote
                .watch_file_changes(&params.uri, params.options.clone())
                .await?;
            inner.local_to_remote.insert(local, remote_handle);
        }

        inner.watch_params.insert(local, params);
        Ok(local)
    }

    /// Forget a watch and release its remote handle. Unknown handles are a no-op.
    pub async fn unwatch_file_changes(&self, local: WatcherHandle) -> Result<(), WatchError> {
        let mut inner = self.inner.lock().await;

        inner.watch_params.remove(&local);
        let Some(remote_handle) = inner.local_to_remote.remove(&local) else {
            return Ok(());
        };

        match (inner.state, inner.remote.clone()) {
            (ConnectionState::Connected, Some(remote)) => {
                remote.unwatch_file_changes(remote_handle).await
            }
            _ => Ok(()),
        }
    }

    /// Set the callback, forwarding it now if connected and again after every restore.
    pub async fn set_client(
        &self,
        client: Option<Arc<dyn WatcherClient>>,
    ) -> Result<(), WatchError> {
        let mut inner = self.inner.lock().await;
        inner.client = client.clone();

        match (inner.state, inner.remote.clone()) {
            (ConnectionState::Connected, Some(remote)) => remote.set_client(client).await,
            _ => Ok(()),
        }
    }

    /// The transport dropped. Requests are kept for replay.
    pub async fn connection_lost(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::Reconnecting {
            return;
        }
        inner.state = ConnectionState::Reconnecting;
        inner.remote = None;
        crate::log_event!("reconnect", "connection lost", "{} watches tracked", inner.watch_params.len());
    }

    /// Adopt a new connection and bring its watches up to date.
    ///
    /// If `remote` continues the previous session, existing mappings are kept
    /// and only requests made while disconnected are sent. Otherwise every
    /// tracked request is replayed and remapped. Replay failures are logged
    /// and counted; the request stays tracked for the next restore.
    pub async fn connection_restored(
        &self,
        remote: Arc<dyn FileSystemWatcher>,
    ) -> Result<ReplayReport, WatchError> {
        let mut inner = self.inner.lock().await;

        let key = remote.session_key();
        let retained = inner.session == Some(key);
        if !retained {
            inner.local_to_remote.clear();
        }

        if let Some(client) = inner.client.clone() {
            remote.set_client(Some(client)).await?;
        }

        let pending: Vec<(WatcherHandle, WatchParams)> = inner
            .watch_params
            .iter()
            .filter(|(local, _)| !inner.local_to_remote.contains_key(*local))
            .map(|(local, params)| (*local, params.clone()))
            .collect();

        let mut report = ReplayReport {
            retained,
            ..ReplayReport::default()
        };

        for (local, params) in pending {
            match remote
                .watch_file_changes(&params.uri, params.options.clone())
                .await
            {
                Ok(remote_handle) => {
                    inner.local_to_remote.insert(local, remote_handle);
                    report.replayed += 1;
                }
                Err(e) => {
                    tracing::warn!("[reconnect] failed to restore watch on {}: {e}", params.uri);
                    report.failed += 1;
                }
            }
        }

        inner.session = Some(key);
        inner.remote = Some(remote);
        inner.state = ConnectionState::Connected;

        crate::log_event!(
            "reconnect",
            "connection restored",
            "retained={}, replayed={}, failed={}",
            report.retained,
            report.replayed,
            report.failed
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::client::ClientProxy;
    use crate::watcher::engine::{ManualController, ManualEngine};
    use crate::watcher::server::{ServerEpoch, WatcherServer, WatcherServerHandle};
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, Ordering};

    static SERVERS: AtomicU64 = AtomicU64::new(1);

    fn spawn() -> (WatcherServerHandle, ManualController) {
        let (engine, controller, events) = ManualEngine::new(64);
        let (handle, _task) = WatcherServer::builder(engine, events)
            .epoch(ServerEpoch::new(SERVERS.fetch_add(1, Ordering::Relaxed)))
            .coalesce_ms(0)
            .spawn();
        (handle, controller)
    }

    #[tokio::test]
    async fn test_watch_while_disconnected_is_replayed() {
        let (server, controller) = spawn();
        let watcher = ReconnectingWatcher::new();

        let local = watcher
            .watch_file_changes("/r/a", WatchOptions::default())
            .await
            .unwrap();
        assert_eq!(watcher.remote_handle(local).await, None);

        let report = watcher
            .connection_restored(Arc::new(ClientProxy::new(server)))
            .await
            .unwrap();

        assert!(!report.retained);
        assert_eq!(report.replayed, 1);
        assert!(watcher.remote_handle(local).await.is_some());
        assert!(controller.is_watching(Path::new("/r/a")));
        assert_eq!(watcher.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_same_session_is_not_replayed() {
        let (server, controller) = spawn();
        let proxy: Arc<dyn FileSystemWatcher> = Arc::new(ClientProxy::new(server));
        let watcher = ReconnectingWatcher::new();
        watcher.connection_restored(proxy.clone()).await.unwrap();

        let local = watcher
            .watch_file_changes("/r/a", WatchOptions::default())
            .await
            .unwrap();
        let before = watcher.remote_handle(local).await;

        watcher.connection_lost().await;
        assert_eq!(watcher.state().await, ConnectionState::Reconnecting);

        let report = watcher.connection_restored(proxy).await.unwrap();
        assert!(report.retained);
        assert_eq!(report.replayed, 0);
        assert_eq!(watcher.remote_handle(local).await, before);
        assert_eq!(controller.start_count(), 1);
    }

    #[tokio::test]
    async fn test_new_server_gets_every_watch_replayed() {
        let (first, _first_engine) = spawn();
        let watcher = ReconnectingWatcher::new();
        watcher
            .connection_restored(Arc::new(ClientProxy::new(first)))
            .await
            .unwrap();

        let a = watcher
            .watch_file_changes("/r/a", WatchOptions::default())
            .await
            .unwrap();
        let b = watcher
            .watch_file_changes("/r/b", WatchOptions::ignoring(["*.tmp"]))
            .await
            .unwrap();
        watcher.unwatch_file_changes(a).await.unwrap();

        watcher.connection_lost().await;
        let (second, second_engine) = spawn();
        let report = watcher
            .connection_restored(Arc::new(ClientProxy::new(second)))
            .await
            .unwrap();

        assert!(!report.retained);
        assert_eq!(report.replayed, 1);
        assert_eq!(watcher.tracked().await, 1);
        assert!(watcher.remote_handle(a).await.is_none());
        assert!(watcher.remote_handle(b).await.is_some());
        assert!(second_engine.is_watching(Path::new("/r/b")));
        assert!(!second_engine.is_watching(Path::new("/r/a")));
    }

    #[tokio::test]
    async fn test_failed_replay_keeps_request_tracked() {
        let (server, controller) = spawn();
        controller.reject("/r/missing");
        let watcher = ReconnectingWatcher::new();

        watcher
            .watch_file_changes("/r/missing", WatchOptions::default())
            .await
            .unwrap();
        let report = watcher
            .connection_restored(Arc::new(ClientProxy::new(server)))
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(watcher.tracked().await, 1);
    }
}
