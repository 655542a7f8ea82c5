//! Error types for the watcher multiplexing system.

use std::path::PathBuf;
use thiserror::Error;

use super::protocol::ClientId;

/// Errors from watcher operations.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to initialize watcher: {reason}")]
    InitFailed { reason: String },

    #[error("Cannot watch path {path}: {reason}")]
    EngineStart { path: PathBuf, reason: String },

    #[error("Watch engine failure: {reason}")]
    EngineFatal { reason: String },

    #[error("Invalid ignore pattern '{pattern}': {reason}")]
    InvalidGlob { pattern: String, reason: String },

    #[error("Invalid uri '{uri}'")]
    InvalidUri { uri: String },

    #[error("Client {client} failed to handle notification: {reason}")]
    ClientCallback { client: ClientId, reason: String },

    #[error("Watcher connection was disposed")]
    Disposed,

    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

impl From<notify::Error> for WatchError {
    fn from(e: notify::Error) -> Self {
        WatchError::InitFailed {
            reason: e.to_string(),
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for WatchError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        WatchError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for WatchError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        WatchError::ChannelClosed
    }
}
