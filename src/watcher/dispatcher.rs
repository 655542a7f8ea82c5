//! Routing of change notifications to registered clients.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::protocol::{ClientId, DidFilesChangedParams, FileChange, FileSystemWatcherErrorParams};
use super::WatchError;

/// Result of a client callback.
pub type ClientResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Receiver side of the watcher protocol, implemented by each frontend.
///
/// Callbacks run synchronously on the server loop and must not block.
pub trait WatcherClient: Send + Sync {
    /// Changes under one of the client's watched uris.
    fn on_did_files_changed(&self, event: DidFilesChangedParams) -> ClientResult;

    /// A watch stopped because the engine failed.
    fn on_error(&self, event: FileSystemWatcherErrorParams) -> ClientResult;
}

/// Notification forwarded by a [`ChannelClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientNotification {
    FilesChanged(DidFilesChangedParams),
    Error(FileSystemWatcherErrorParams),
}

/// Client that forwards every notification into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelClient {
    sender: mpsc::UnboundedSender<ClientNotification>,
}

impl ChannelClient {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientNotification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl WatcherClient for ChannelClient {
    fn on_did_files_changed(&self, event: DidFilesChangedParams) -> ClientResult {
        self.sender
            .send(ClientNotification::FilesChanged(event))
            .map_err(|_| WatchError::ChannelClosed.into())
    }

    fn on_error(&self, event: FileSystemWatcherErrorParams) -> ClientResult {
        self.sender
            .send(ClientNotification::Error(event))
            .map_err(|_| WatchError::ChannelClosed.into())
    }
}

/// Outcome of one fan-out cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Clients whose callback completed.
    pub delivered: usize,
    /// Clients with changes but no registered callback.
    pub dropped: usize,
    /// Clients whose callback returned an error.
    pub failed: usize,
}

/// Maps client ids to their callbacks.
#[derive(Default)]
pub struct ClientDispatcher {
    clients: HashMap<ClientId, Arc<dyn WatcherClient>>,
}

impl ClientDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for `client`, replacing any previous one.
    pub fn register_client(&mut self, client: ClientId, callback: Arc<dyn WatcherClient>) {
        if self.clients.insert(client, callback).is_some() {
            crate::debug_event!("dispatcher", "replaced", "client {client}");
        } else {
            crate::debug_event!("dispatcher", "registered", "client {client}");
        }
    }

    /// Remove the callback for `client`. Returns whether one was registered.
    pub fn unregister_client(&mut self, client: ClientId) -> bool {
        let removed = self.clients.remove(&client).is_some();
        if removed {
            crate::debug_event!("dispatcher", "unregistered", "client {client}");
        }
        removed
    }

    pub fn is_registered(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Deliver each client its own change list, once per cycle.
    ///
    /// A failing callback is logged and does not stop delivery to the others.
    pub fn fan_out(&self, changes_by_client: BTreeMap<ClientId, Vec<FileChange>>) -> DispatchReport {
        let mut report = DispatchReport::default();

        for (client, changes) in changes_by_client {
            if changes.is_empty() {
                continue;
            }

            let Some(callback) = self.clients.get(&client) else {
                crate::debug_event!(
                    "dispatcher",
                    "dropped",
                    "{} changes for unregistered client {client}",
                    changes.len()
                );
                report.dropped += 1;
                continue;
            };

            let count = changes.len();
            let event = DidFilesChangedParams {
                clients: vec![client],
                changes,
            };

            match callback.on_did_files_changed(event) {
                Ok(()) => {
                    crate::debug_event!("dispatcher", "delivered", "{count} changes to client {client}");
                    report.delivered += 1;
                }
                Err(e) => {
                    let error = WatchError::ClientCallback {
                        client,
                        reason: e.to_string(),
                    };
                    tracing::warn!("[dispatcher] {error}");
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Report an engine failure to every named client that is still registered.
    pub fn notify_error(&self, event: FileSystemWatcherErrorParams) -> DispatchReport {
        let mut report = DispatchReport::default();

        for client in &event.clients {
            let Some(callback) = self.clients.get(client) else {
                report.dropped += 1;
                continue;
            };

            let single = FileSystemWatcherErrorParams {
                clients: vec![*client],
                uri: event.uri.clone(),
            };

            match callback.on_error(single) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        "[dispatcher] client {client} failed to handle error for {}: {e}",
                        event.uri
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }
}
