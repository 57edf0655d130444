//! Configuration types for directory watching.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wildmatch::WildMatch;

use crate::error::{Result, WatcherError};

/// Default quiescence window in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// Default capacity of the dispatch queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default polling interval for the polling backend.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Configuration for a directory watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Quiescence window: buffered changes for a path are flushed once no
    /// new notification arrived for this long.
    pub debounce_ms: u64,

    /// Maximum number of undelivered events held for the callback.
    pub queue_capacity: usize,

    /// Which notification mechanism to use.
    pub backend: Backend,

    /// Scan interval for the polling backend.
    pub poll_interval_ms: u64,

    /// Whether subdirectories of a root are watched too.
    pub recursive: bool,

    /// Wildcard patterns (`*`, `?`) matched against full paths. Matching
    /// paths produce no events and are never subscribed.
    pub exclude_patterns: Vec<String>,

    /// Maximum number of roots one watcher accepts (None = unlimited).
    pub max_roots: Option<usize>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            backend: Backend::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            recursive: true,
            exclude_patterns: Vec::new(),
            max_roots: None,
        }
    }
}

impl WatcherConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Set the quiescence window.
    pub fn with_debounce_ms(mut self, ms: u64) -> Self {
        self.debounce_ms = ms;
        self
    }

    /// Set the dispatch queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the backend.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the polling interval.
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Only watch the root directory itself.
    pub fn non_recursive(mut self) -> Self {
        self.recursive = false;
        self
    }

    /// Add an exclude pattern.
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_patterns.push(pattern.into());
        self
    }

    /// Limit the number of watched roots.
    pub fn with_max_roots(mut self, limit: usize) -> Self {
        self.max_roots = Some(limit);
        self
    }

    /// The quiescence window as a duration.
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// The polling interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.debounce_ms == 0 {
            return Err(WatcherError::Config(
                "debounce_ms must be greater than zero".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(WatcherError::Config(
                "queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(WatcherError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_roots == Some(0) {
            return Err(WatcherError::Config(
                "max_roots must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Compile the exclude patterns.
    pub fn exclusions(&self) -> Exclusions {
        Exclusions {
            patterns: self
                .exclude_patterns
                .iter()
                .map(|p| WildMatch::new(p))
                .collect(),
        }
    }
}

/// Which notification mechanism backs the subscriptions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// The platform's native mechanism (inotify, FSEvents,
    /// ReadDirectoryChangesW).
    #[default]
    Native,

    /// Periodic scans. Works on network mounts and pseudo filesystems
    /// where native notifications are unavailable.
    Poll,
}

/// Compiled exclude patterns.
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    patterns: Vec<WildMatch>,
}

impl Exclusions {
    /// Check if a path should be excluded.
    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let path_str = path.to_string_lossy();
        self.patterns.iter().any(|p| p.matches(&path_str))
    }
}
