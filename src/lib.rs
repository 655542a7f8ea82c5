//! Multiplexing file watcher.
//!
//! One native watch engine serves any number of clients, each with its own
//! handles, ignore globs and notification callback. See [`watcher`] for the
//! architecture and [`rpc`] for the stdio transport.

pub mod cli;
pub mod config;
pub mod logging;
pub mod rpc;
pub mod watcher;

pub use config::Settings;
pub use watcher::{
    ClientId, ClientProxy, FileChange, FileChangeType, FileSystemWatcher, ReconnectingWatcher,
    WatchError, WatchOptions, WatcherHandle, WatcherServer, WatcherServerHandle,
};
