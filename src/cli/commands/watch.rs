//! Watch command - print changes under the given paths.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde_json::json;

use crate::config::Settings;
use crate::watcher::{
    ChannelClient, ClientNotification, ClientProxy, FileSystemWatcher, WatchOptions, WatcherServer,
};

/// Arguments for the watch command.
pub struct WatchArgs {
    pub paths: Vec<PathBuf>,
    pub ignore: Vec<String>,
    pub json: bool,
}

/// Watch until Ctrl-C, printing every delivered batch.
pub async fn run(args: WatchArgs, config: &Settings) -> anyhow::Result<()> {
    let (server, task) = WatcherServer::spawn_native(&config.watcher)
        .context("failed to start the native watcher")?;

    let proxy = ClientProxy::new(server.clone());
    let (client, mut notifications) = ChannelClient::new();
    proxy.set_client(Some(Arc::new(client))).await?;

    for path in &args.paths {
        let handle = proxy
            .watch_file_changes(
                &path.to_string_lossy(),
                WatchOptions::ignoring(args.ignore.iter().cloned()),
            )
            .await
            .with_context(|| format!("cannot watch {}", path.display()))?;
        eprintln!("Watching {} (handle {handle})", path.display());
    }

    loop {
        tokio::select! {
            notification = notifications.recv() => {
                let Some(notification) = notification else {
                    break;
                };
                for line in format_notification(&notification, args.json)? {
                    println!("{line}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Stopping");
                break;
            }
        }
    }

    proxy.dispose().await?;
    server.shutdown().await?;
    task.await?;
    Ok(())
}

/// Render a notification as output lines.
fn format_notification(
    notification: &ClientNotification,
    as_json: bool,
) -> anyhow::Result<Vec<String>> {
    let lines = match (notification, as_json) {
        (ClientNotification::FilesChanged(event), true) => vec![serde_json::to_string(event)?],
        (ClientNotification::Error(event), true) => {
            vec![json!({ "error": "watch stopped", "uri": event.uri }).to_string()]
        }
        (ClientNotification::FilesChanged(event), false) => event
            .changes
            .iter()
            .map(|change| format!("{:<8} {}", change.kind, change.uri))
            .collect(),
        (ClientNotification::Error(event), false) => {
            vec![format!("error    watch on {} stopped", event.uri)]
        }
    };
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::{
        ClientId, DidFilesChangedParams, FileChange, FileChangeType, FileSystemWatcherErrorParams,
    };

    fn changed() -> ClientNotification {
        ClientNotification::FilesChanged(DidFilesChangedParams {
            clients: vec![ClientId(1)],
            changes: vec![
                FileChange {
                    uri: "file:///w/a".to_string(),
                    kind: FileChangeType::Added,
                },
                FileChange {
                    uri: "file:///w/b".to_string(),
                    kind: FileChangeType::Deleted,
                },
            ],
        })
    }

    #[test]
    fn test_text_output_has_one_line_per_change() {
        let lines = format_notification(&changed(), false).unwrap();
        assert_eq!(lines, vec!["added    file:///w/a", "deleted  file:///w/b"]);
    }

    #[test]
    fn test_json_output_is_one_line_per_batch() {
        let lines = format_notification(&changed(), true).unwrap();
        assert_eq!(lines.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(value["changes"][1]["type"], 2);
    }

    #[test]
    fn test_error_output() {
        let error = ClientNotification::Error(FileSystemWatcherErrorParams {
            clients: vec![ClientId(1)],
            uri: "file:///w".to_string(),
        });
        assert_eq!(
            format_notification(&error, false).unwrap(),
            vec!["error    watch on file:///w stopped"]
        );
    }
}
