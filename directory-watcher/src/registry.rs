//! Registry of watched roots.
//!
//! The registry only records which roots are watched and in which state.
//! Subscription handles live with the event loop; the registry never holds
//! one, so reading it never waits on native subscription setup.

use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WatcherError};

/// Process-unique identifier of one registration of a root.
///
/// Unwatching and re-watching the same path yields a new id, so events
/// belonging to the old registration can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch#{}", self.0)
    }
}

/// Lifecycle of a watched root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchStatus {
    /// Registered; native subscription not confirmed yet.
    Pending,

    /// Subscription confirmed, events are flowing.
    Active,

    /// Subscription failed or the root disappeared.
    Failed,
}

impl WatchStatus {
    /// Pending and active roots are reported as watched.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }
}

/// Outcome of a successful `watch()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchResult {
    /// A new registration was created.
    Watching,

    /// The root was already pending or active; nothing changed.
    AlreadyWatching,
}

/// A registered root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedPath {
    /// Registration id.
    pub id: WatchId,

    /// Normalized root path.
    pub path: PathBuf,

    /// Current status.
    pub status: WatchStatus,
}

/// Result of [`PathRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A pending entry was created.
    New(WatchId),

    /// A pending or active entry already exists.
    Existing(WatchId),
}

/// Watched roots in registration order.
#[derive(Debug, Default)]
pub struct PathRegistry {
    entries: IndexMap<PathBuf, WatchedPath>,
    next_id: u64,
}

impl PathRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a normalized root.
    ///
    /// A failed entry for the same root is replaced by a fresh pending one.
    pub fn register(&mut self, path: PathBuf) -> Registration {
        let key = registry_key(&path);

        if let Some(existing) = self.entries.get(&key).filter(|e| e.status.is_live()) {
            return Registration::Existing(existing.id);
        }

        self.next_id += 1;
        let id = WatchId(self.next_id);
        self.entries.insert(
            key,
            WatchedPath {
                id,
                path,
                status: WatchStatus::Pending,
            },
        );
        Registration::New(id)
    }

    /// Remove a root, returning its entry.
    pub fn remove(&mut self, path: &Path) -> Option<WatchedPath> {
        self.entries.shift_remove(&registry_key(path))
    }

    /// Update the status of a registration. Returns false if the id is no
    /// longer registered.
    pub fn set_status(&mut self, id: WatchId, status: WatchStatus) -> bool {
        match self.entries.values_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    /// Look up a root.
    pub fn get(&self, path: &Path) -> Option<&WatchedPath> {
        self.entries.get(&registry_key(path))
    }

    /// Look up a registration by id.
    pub fn get_by_id(&self, id: WatchId) -> Option<&WatchedPath> {
        self.entries.values().find(|e| e.id == id)
    }

    /// Pending and active roots, in registration order.
    pub fn snapshot(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.status.is_live())
            .map(|e| e.path.display().to_string())
            .collect()
    }

    /// Number of pending or active roots.
    pub fn live_count(&self) -> usize {
        self.entries.values().filter(|e| e.status.is_live()).count()
    }

    /// All entries, including failed ones.
    pub fn entries(&self) -> impl Iterator<Item = &WatchedPath> {
        self.entries.values()
    }

    /// Remove every entry.
    pub fn drain(&mut self) -> Vec<WatchedPath> {
        self.entries.drain(..).map(|(_, entry)| entry).collect()
    }
}

/// Normalize a root passed to `watch()`.
///
/// The path must exist and be a directory. Symlinks and relative components
/// are resolved; Windows verbatim prefixes are stripped.
pub fn normalize_root(path: &Path) -> Result<PathBuf> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(WatcherError::invalid_path(path, "does not exist"));
        }
        Err(e) => return Err(WatcherError::invalid_path(path, e.to_string())),
    };

    if !metadata.is_dir() {
        return Err(WatcherError::invalid_path(path, "not a directory"));
    }

    dunce::canonicalize(path).map_err(|e| WatcherError::invalid_path(path, e.to_string()))
}

/// Normalize a path passed to `unwatch()`. The root may no longer exist, so
/// this falls back to a lexically absolute path.
pub fn normalize_lenient(path: &Path) -> PathBuf {
    dunce::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(any(windows, target_os = "macos"))]
fn registry_key(path: &Path) -> PathBuf {
    PathBuf::from(path.to_string_lossy().to_lowercase())
}

#[cfg(not(any(windows, target_os = "macos")))]
fn registry_key(path: &Path) -> PathBuf {
    path.to_path_buf()
}
