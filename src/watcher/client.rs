//! Per-connection view of the watcher server.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::dispatcher::WatcherClient;
use super::protocol::{ClientId, WatchOptions, WatcherHandle};
use super::server::{ServerEpoch, WatcherServerHandle};
use super::WatchError;

/// Identity of a client session on a particular server instance.
///
/// A reconnecting frontend compares keys to tell whether its watches survived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub epoch: ServerEpoch,
    pub client: ClientId,
}

/// Watch operations available to a frontend connection.
#[async_trait]
pub trait FileSystemWatcher: Send + Sync {
    /// Watch `uri` recursively. The returned handle is owned by this connection.
    async fn watch_file_changes(
        &self,
        uri: &str,
        options: WatchOptions,
    ) -> Result<WatcherHandle, WatchError>;

    /// Release a handle returned by [`watch_file_changes`](Self::watch_file_changes).
    async fn unwatch_file_changes(&self, handle: WatcherHandle) -> Result<(), WatchError>;

    /// Set or clear the callback receiving this connection's notifications.
    async fn set_client(&self, client: Option<Arc<dyn WatcherClient>>) -> Result<(), WatchError>;

    fn session_key(&self) -> SessionKey;
}

/// Connection-scoped proxy that tags every request with its client id.
///
/// [`dispose`](Self::dispose) unregisters the client and releases every
/// handle it still owns.
pub struct ClientProxy {
    server: WatcherServerHandle,
    client_id: ClientId,
    owned: Mutex<HashSet<WatcherHandle>>,
    disposed: AtomicBool,
}

impl ClientProxy {
    /// Create a proxy with a freshly allocated client id.
    pub fn new(server: WatcherServerHandle) -> Self {
        let client_id = server.next_client_id();
        crate::debug_event!("client", "created", "client {client_id}");
        Self {
            server,
            client_id,
            owned: Mutex::new(HashSet::new()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Handles currently owned by this connection.
    pub fn owned_handles(&self) -> Vec<WatcherHandle> {
        let mut handles: Vec<_> = self.owned.lock().iter().copied().collect();
        handles.sort();
        handles
    }

    /// Unregister the client and release its watches. Later calls return 0.
    pub async fn dispose(&self) -> Result<usize, WatchError> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }
        self.owned.lock().clear();
        let released = self.server.dispose_client(self.client_id).await?;
        crate::log_event!("client", "disposed", "client {}", self.client_id);
        Ok(released)
    }
}

#[async_trait]
impl FileSystemWatcher for ClientProxy {
    async fn watch_file_changes(
        &self,
        uri: &str,
        options: WatchOptions,
    ) -> Result<WatcherHandle, WatchError> {
        if self.is_disposed() {
            return Err(WatchError::Disposed);
        }

        let handle = self
            .server
            .watch_file_changes2(self.client_id, uri, Some(options))
            .await?;

        // Disposed while the request was in flight.
        if self.is_disposed() {
            self.server.unwatch_detached(handle);
            return Err(WatchError::Disposed);
        }

        self.owned.lock().insert(handle);
        Ok(handle)
    }

    async fn unwatch_file_changes(&self, handle: WatcherHandle) -> Result<(), WatchError> {
        if self.is_disposed() {
            return Ok(());
        }
        self.owned.lock().remove(&handle);
        self.server.unwatch_file_changes2(handle).await
    }

    async fn set_client(&self, client: Option<Arc<dyn WatcherClient>>) -> Result<(), WatchError> {
        if self.is_disposed() {
            return Err(WatchError::Disposed);
        }
        match client {
            Some(callback) => self.server.register_client(self.client_id, callback).await,
            None => self.server.unregister_client(self.client_id).await.map(|_| ()),
        }
    }

    fn session_key(&self) -> SessionKey {
        SessionKey {
            epoch: self.server.epoch(),
            client: self.client_id,
        }
    }
}
