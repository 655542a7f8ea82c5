//! Ignore-glob matching for watch requests.

use std::path::{Path, PathBuf};

use glob::Pattern;

use super::WatchError;

/// Compiled set of ignore globs for one watched root.
///
/// A path is ignored when the path itself or any of its ancestors below the
/// root matches a pattern, either as an absolute path or relative to the root.
/// So `**/foo*` hides `root/foo` and everything created inside it.
#[derive(Debug, Clone, Default)]
pub struct IgnoreFilter {
    root: PathBuf,
    patterns: Vec<Pattern>,
}

impl IgnoreFilter {
    /// Compile `patterns` for the watched `root`.
    pub fn new(root: &Path, patterns: &[String]) -> Result<Self, WatchError> {
        let patterns = patterns
            .iter()
            .map(|raw| {
                Pattern::new(raw).map_err(|e| WatchError::InvalidGlob {
                    pattern: raw.clone(),
                    reason: e.msg.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            root: root.to_path_buf(),
            patterns,
        })
    }

    /// Check whether `path` is hidden by any ignore pattern.
    pub fn is_ignored(&self, path: &Path) -> bool {
        if self.patterns.is_empty() {
            return false;
        }

        let mut current = Some(path);
        while let Some(candidate) = current {
            if candidate == self.root || !candidate.starts_with(&self.root) {
                break;
            }
            if self.matches(candidate) {
                return true;
            }
            current = candidate.parent();
        }

        false
    }

    fn matches(&self, candidate: &Path) -> bool {
        let relative = candidate.strip_prefix(&self.root).ok();
        self.patterns.iter().any(|pattern| {
            pattern.matches_path(candidate)
                || relative.is_some_and(|rel| pattern.matches_path(rel))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
