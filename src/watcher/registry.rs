//! Registry of live watch requests keyed by handle.
//!
//! Handles are allocated from a counter owned by the registry. They start at 1,
//! only ever increase, and are never handed out twice in one process.

use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};

use super::filter::IgnoreFilter;
use super::protocol::{ClientId, WatchOptions, WatcherHandle};

/// One client's request to watch a path.
#[derive(Debug, Clone)]
pub struct WatchRequest {
    pub handle: WatcherHandle,
    pub owner: ClientId,
    /// Uri as sent by the client.
    pub uri: String,
    /// Resolved absolute path covered by the request.
    pub path: PathBuf,
    pub options: WatchOptions,
    pub filter: IgnoreFilter,
}

impl WatchRequest {
    /// Whether a change at `path` should reach the owner of this request.
    pub fn covers(&self, path: &Path) -> bool {
        path.starts_with(&self.path) && !self.filter.is_ignored(path)
    }
}

/// Handle to request mapping.
#[derive(Debug)]
pub struct WatchRegistry {
    requests: BTreeMap<WatcherHandle, WatchRequest>,
    next_handle: NonZeroU64,
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self {
            requests: BTreeMap::new(),
            next_handle: NonZeroU64::MIN,
        }
    }

    /// Store a request and return its freshly allocated handle.
    pub fn allocate(
        &mut self,
        uri: String,
        path: PathBuf,
        options: WatchOptions,
        filter: IgnoreFilter,
        owner: ClientId,
    ) -> WatcherHandle {
        let handle = WatcherHandle::from(self.next_handle);
        self.next_handle = self.next_handle.saturating_add(1);

        self.requests.insert(
            handle,
            WatchRequest {
                handle,
                owner,
                uri,
                path,
                options,
                filter,
            },
        );
        handle
    }

    /// Remove a request. Returns `None` if it was unknown or already removed.
    pub fn release(&mut self, handle: WatcherHandle) -> Option<WatchRequest> {
        self.requests.remove(&handle)
    }

    pub fn lookup(&self, handle: WatcherHandle) -> Option<&WatchRequest> {
        self.requests.get(&handle)
    }

    /// All live requests owned by `client`, in handle order.
    pub fn requests_for_client(&self, client: ClientId) -> Vec<&WatchRequest> {
        self.requests
            .values()
            .filter(|request| request.owner == client)
            .collect()
    }

    /// Clients that currently own at least one request.
    pub fn clients(&self) -> BTreeSet<ClientId> {
        self.requests.values().map(|request| request.owner).collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocate(registry: &mut WatchRegistry, path: &str, owner: u64) -> WatcherHandle {
        let path = PathBuf::from(path);
        let filter = IgnoreFilter::new(&path, &[]).unwrap();
        registry.allocate(
            format!("file://{}", path.display()),
            path,
            WatchOptions::default(),
            filter,
            ClientId(owner),
        )
    }

    #[test]
    fn test_handles_start_at_one_and_increase() {
        let mut registry = WatchRegistry::new();

        let first = allocate(&mut registry, "/project/src", 1);
        let second = allocate(&mut registry, "/project/src", 1);
        let third = allocate(&mut registry, "/project/docs", 2);

        assert_eq!(first.get(), 1);
        assert_eq!(second.get(), 2);
        assert_eq!(third.get(), 3);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut registry = WatchRegistry::new();
        let handle = allocate(&mut registry, "/project", 1);

        assert!(registry.release(handle).is_some());
        assert!(registry.release(handle).is_none());
        assert!(registry.lookup(handle).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handles_not_reused_after_release() {
        let mut registry = WatchRegistry::new();
        let first = allocate(&mut registry, "/project", 1);
        registry.release(first);

        let second = allocate(&mut registry, "/project", 1);
        assert_ne!(first, second);
        assert!(second > first);
    }

    #[test]
    fn test_requests_for_client() {
        let mut registry = WatchRegistry::new();
        let a1 = allocate(&mut registry, "/a", 1);
        allocate(&mut registry, "/b", 2);
        let a2 = allocate(&mut registry, "/c", 1);

        let owned: Vec<WatcherHandle> = registry
            .requests_for_client(ClientId(1))
            .iter()
            .map(|r| r.handle)
            .collect();

        assert_eq!(owned, vec![a1, a2]);
        assert!(registry.requests_for_client(ClientId(9)).is_empty());
        assert_eq!(registry.clients().len(), 2);
    }

    #[test]
    fn test_request_covers_descendants_only() {
        let mut registry = WatchRegistry::new();
        let handle = allocate(&mut registry, "/project/src", 1);
        let request = registry.lookup(handle).unwrap();

        assert!(request.covers(Path::new("/project/src")));
        assert!(request.covers(Path::new("/project/src/lib.rs")));
        assert!(!request.covers(Path::new("/project/srcs/lib.rs")));
        assert!(!request.covers(Path::new("/project/README.md")));
    }
}
