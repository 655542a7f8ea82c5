//! Wire types shared by the watcher server and its clients.
//!
//! Field names follow the camelCase JSON shape used by frontends
//! (`watchFileChanges2`, `onDidFilesChanged2`, `onError2`).

use std::fmt;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::WatchError;

/// Opaque identifier of one watch request.
///
/// Handles are never zero, so "no handle" is always `Option::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatcherHandle(NonZeroU64);

impl WatcherHandle {
    pub fn new(value: u64) -> Option<Self> {
        NonZeroU64::new(value).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl From<NonZeroU64> for WatcherHandle {
    fn from(value: NonZeroU64) -> Self {
        Self(value)
    }
}

impl fmt::Display for WatcherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one frontend client of the watcher server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a file change. Serialized as an integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FileChangeType {
    Updated,
    Added,
    Deleted,
}

impl From<FileChangeType> for u8 {
    fn from(kind: FileChangeType) -> u8 {
        match kind {
            FileChangeType::Updated => 0,
            FileChangeType::Added => 1,
            FileChangeType::Deleted => 2,
        }
    }
}

impl TryFrom<u8> for FileChangeType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FileChangeType::Updated),
            1 => Ok(FileChangeType::Added),
            2 => Ok(FileChangeType::Deleted),
            other => Err(format!("unknown file change type {other}")),
        }
    }
}

impl fmt::Display for FileChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileChangeType::Updated => "updated",
            FileChangeType::Added => "added",
            FileChangeType::Deleted => "deleted",
        };
        f.pad(name)
    }
}

/// A single change observed by the watch engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub uri: String,
    #[serde(rename = "type")]
    pub kind: FileChangeType,
}

impl FileChange {
    pub fn new(path: &Path, kind: FileChangeType) -> Self {
        Self {
            uri: path_to_uri(path),
            kind,
        }
    }
}

/// Options attached to a watch request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchOptions {
    /// Glob patterns whose matches are never reported.
    #[serde(default)]
    pub ignored: Vec<String>,
}

impl WatchOptions {
    pub fn ignoring<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ignored: patterns.into_iter().map(Into::into).collect(),
        }
    }
}

/// Parameters of `watchFileChanges2`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchFileChangesParams {
    pub client_id: ClientId,
    pub uri: String,
    #[serde(default)]
    pub options: Option<WatchOptions>,
}

/// Parameters of `unwatchFileChanges2`.
///
/// A zero or unknown id is accepted and treated as a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnwatchFileChangesParams {
    pub watcher_id: u64,
}

/// Push notification `onDidFilesChanged2`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidFilesChangedParams {
    /// Clients to route the changes to.
    pub clients: Vec<ClientId>,
    pub changes: Vec<FileChange>,
}

/// Push notification `onError2`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystemWatcherErrorParams {
    /// Clients whose watches were affected.
    pub clients: Vec<ClientId>,
    /// The uri that originated the error.
    pub uri: String,
}

const FILE_SCHEME: &str = "file://";

/// Convert a `file://` uri or a plain path into an absolute path.
pub fn uri_to_path(uri: &str) -> Result<PathBuf, WatchError> {
    let raw = uri.strip_prefix(FILE_SCHEME).unwrap_or(uri);
    if raw.is_empty() || raw.contains("://") {
        return Err(WatchError::InvalidUri {
            uri: uri.to_string(),
        });
    }

    let path = PathBuf::from(raw);
    if path.is_absolute() {
        return Ok(path);
    }

    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|_| WatchError::InvalidUri {
            uri: uri.to_string(),
        })
}

/// Format an absolute path as a `file://` uri.
pub fn path_to_uri(path: &Path) -> String {
    format!("{FILE_SCHEME}{}", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_rejects_zero() {
        assert!(WatcherHandle::new(0).is_none());
        assert_eq!(WatcherHandle::new(7).map(WatcherHandle::get), Some(7));
    }

    #[test]
    fn test_change_serializes_type_as_integer() {
        let change = FileChange::new(Path::new("/tmp/a.txt"), FileChangeType::Deleted);
        let json = serde_json::to_value(&change).unwrap();

        assert_eq!(json["uri"], "file:///tmp/a.txt");
        assert_eq!(json["type"], 2);
    }

    #[test]
    fn test_unknown_change_type_is_rejected() {
        let result: Result<FileChange, _> =
            serde_json::from_str(r#"{"uri":"file:///a","type":9}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_watch_params_camel_case() {
        let params: WatchFileChangesParams = serde_json::from_str(
            r#"{"clientId":3,"uri":"file:///work","options":{"ignored":["**/target"]}}"#,
        )
        .unwrap();

        assert_eq!(params.client_id, ClientId(3));
        assert_eq!(params.options.unwrap().ignored, vec!["**/target"]);
    }

    #[test]
    fn test_watch_params_without_options() {
        let params: WatchFileChangesParams =
            serde_json::from_str(r#"{"clientId":1,"uri":"/work"}"#).unwrap();
        assert!(params.options.is_none());
    }

    #[test]
    fn test_uri_to_path() {
        assert_eq!(
            uri_to_path("file:///home/user/project").unwrap(),
            PathBuf::from("/home/user/project")
        );
        assert_eq!(uri_to_path("/plain/path").unwrap(), PathBuf::from("/plain/path"));
        assert!(uri_to_path("http://example.com/x").is_err());
        assert!(uri_to_path("").is_err());
        assert!(uri_to_path("relative/dir").unwrap().is_absolute());
    }
}
