//! Newline-delimited JSON transport for one frontend connection.
//!
//! Each line on the input is a request:
//!
//! ```text
//! {"id": 1, "method": "watchFileChanges2", "params": {"clientId": 7, "uri": "file:///src"}}
//! {"id": 2, "method": "unwatchFileChanges2", "params": {"watcherId": 1}}
//! ```
//!
//! Responses carry the request id. Push notifications (`onDidFilesChanged2`,
//! `onError2`) have a method and no id. One connection may use any number of
//! client ids; all of them are disposed when the input reaches EOF.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::watcher::dispatcher::{ClientResult, WatcherClient};
use crate::watcher::protocol::{
    ClientId, DidFilesChangedParams, FileSystemWatcherErrorParams, UnwatchFileChangesParams,
    WatchFileChangesParams, WatcherHandle,
};
use crate::watcher::{WatchError, WatcherServerHandle};

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const ENGINE_START_FAILED: i64 = -32000;
pub const WATCHER_ERROR: i64 = -32001;

pub const WATCH_FILE_CHANGES: &str = "watchFileChanges2";
pub const UNWATCH_FILE_CHANGES: &str = "unwatchFileChanges2";
pub const ON_DID_FILES_CHANGED: &str = "onDidFilesChanged2";
pub const ON_ERROR: &str = "onError2";

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug)]
struct RpcFailure {
    code: i64,
    message: String,
}

impl RpcFailure {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<WatchError> for RpcFailure {
    fn from(error: WatchError) -> Self {
        let code = match error {
            WatchError::EngineStart { .. } => ENGINE_START_FAILED,
            WatchError::InvalidUri { .. } | WatchError::InvalidGlob { .. } => INVALID_PARAMS,
            _ => WATCHER_ERROR,
        };
        Self::new(code, error.to_string())
    }
}

/// Forwards a client's notifications onto the connection's output.
struct ConnectionClient {
    output: mpsc::UnboundedSender<String>,
}

impl ConnectionClient {
    fn push(&self, method: &str, params: Value) -> ClientResult {
        let line = json!({ "method": method, "params": params }).to_string();
        self.output
            .send(line)
            .map_err(|_| WatchError::ChannelClosed.into())
    }
}

impl WatcherClient for ConnectionClient {
    fn on_did_files_changed(&self, event: DidFilesChangedParams) -> ClientResult {
        self.push(ON_DID_FILES_CHANGED, serde_json::to_value(event)?)
    }

    fn on_error(&self, event: FileSystemWatcherErrorParams) -> ClientResult {
        self.push(ON_ERROR, serde_json::to_value(event)?)
    }
}

/// Summary of a finished connection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub requests: usize,
    pub clients: usize,
    pub released: usize,
}

struct Connection {
    server: WatcherServerHandle,
    output: mpsc::UnboundedSender<String>,
    clients: BTreeSet<ClientId>,
    requests: usize,
}

impl Connection {
    async fn handle_line(&mut self, line: &str) -> String {
        let request: RpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                let failure = RpcFailure::new(PARSE_ERROR, e.to_string());
                return error_line(Value::Null, failure);
            }
        };
        self.requests += 1;

        crate::debug_event!("rpc", "request", "{} id={}", request.method, request.id);

        let id = request.id.clone();
        match self.dispatch(request).await {
            Ok(result) => json!({ "id": id, "result": result }).to_string(),
            Err(failure) => error_line(id, failure),
        }
    }

    async fn dispatch(&mut self, request: RpcRequest) -> Result<Value, RpcFailure> {
        match request.method.as_str() {
            WATCH_FILE_CHANGES => {
                let params: WatchFileChangesParams = parse_params(request.params)?;
                self.ensure_client(params.client_id).await?;
                let handle = self
                    .server
                    .watch_file_changes2(params.client_id, &params.uri, params.options)
                    .await?;
                Ok(json!(handle))
            }
            UNWATCH_FILE_CHANGES => {
                let params: UnwatchFileChangesParams = parse_params(request.params)?;
                // Zero is the no-op handle.
                if let Some(handle) = WatcherHandle::new(params.watcher_id) {
                    self.server.unwatch_file_changes2(handle).await?;
                }
                Ok(Value::Null)
            }
            other => Err(RpcFailure::new(
                METHOD_NOT_FOUND,
                format!("unknown method: {other}"),
            )),
        }
    }

    /// Register a forwarding callback the first time a client id shows up.
    async fn ensure_client(&mut self, client: ClientId) -> Result<(), WatchError> {
        if self.clients.contains(&client) {
            return Ok(());
        }
        let callback = Arc::new(ConnectionClient {
            output: self.output.clone(),
        });
        self.server.register_client(client, callback).await?;
        self.clients.insert(client);
        Ok(())
    }

    async fn dispose(&mut self) -> usize {
        let mut released = 0;
        for client in std::mem::take(&mut self.clients) {
            match self.server.dispose_client(client).await {
                Ok(count) => released += count,
                Err(e) => tracing::warn!("[rpc] failed to dispose client {client}: {e}"),
            }
        }
        released
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcFailure> {
    serde_json::from_value(params).map_err(|e| RpcFailure::new(INVALID_PARAMS, e.to_string()))
}

fn error_line(id: Value, failure: RpcFailure) -> String {
    json!({
        "id": id,
        "error": { "code": failure.code, "message": failure.message },
    })
    .to_string()
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Serve one connection until `reader` reaches EOF.
///
/// Responses are written in request order. Notifications are interleaved as
/// they arrive.
pub async fn serve<R, W>(
    server: WatcherServerHandle,
    reader: R,
    mut writer: W,
) -> std::io::Result<ConnectionSummary>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (output, mut pushes) = mpsc::unbounded_channel::<String>();
    let mut connection = Connection {
        server,
        output,
        clients: BTreeSet::new(),
        requests: 0,
    };
    let mut lines = BufReader::new(reader).lines();

    crate::log_event!("rpc", "connected");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let response = connection.handle_line(line).await;
                write_line(&mut writer, &response).await?;
            }
            Some(push) = pushes.recv() => {
                write_line(&mut writer, &push).await?;
            }
        }
    }

    let summary = ConnectionSummary {
        requests: connection.requests,
        clients: connection.clients.len(),
        released: connection.dispose().await,
    };

    // Deliver whatever was already queued before disposal.
    while let Ok(push) = pushes.try_recv() {
        write_line(&mut writer, &push).await?;
    }

    crate::log_event!(
        "rpc",
        "disconnected",
        "{} requests, {} clients, {} watches released",
        summary.requests,
        summary.clients,
        summary.released
    );
    Ok(summary)
}
