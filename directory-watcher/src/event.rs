//! Raw notifications and the semantic events delivered to callbacks.

use std::path::PathBuf;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

bitflags! {
    /// Change bits carried by a raw notification.
    ///
    /// Several bits may be merged into one buffer while a path is being
    /// debounced.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct ChangeKind: u8 {
        /// The path came into existence.
        const CREATED = 1 << 0;
        /// The path ceased to exist.
        const REMOVED = 1 << 1;
        /// File contents changed.
        const CONTENT = 1 << 2;
        /// Permissions, timestamps, ownership or other metadata changed.
        const METADATA = 1 << 3;
        /// The path was the old name of a rename.
        const RENAMED_FROM = 1 << 4;
        /// The path was the new name of a rename.
        const RENAMED_TO = 1 << 5;

        const EXISTENCE = Self::CREATED.bits() | Self::REMOVED.bits();
        const NAME = Self::RENAMED_FROM.bits() | Self::RENAMED_TO.bits();
    }
}

/// A change notification as reported by an event source, before debouncing.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNotification {
    /// Path affected.
    pub path: PathBuf,

    /// What changed.
    pub kind: ChangeKind,

    /// The other side of a rename, when the source could correlate both.
    pub linked: Option<PathBuf>,

    /// When the source observed the change.
    pub timestamp: DateTime<Utc>,
}

impl RawNotification {
    /// Create a notification stamped with the current time.
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            linked: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the counterpart path of a rename.
    pub fn linked_to(mut self, other: impl Into<PathBuf>) -> Self {
        self.linked = Some(other.into());
        self
    }
}

/// Kind of event delivered to the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Path was created.
    Created,

    /// Contents or metadata changed.
    Modified,

    /// Path was removed.
    Removed,

    /// Path was renamed (old name).
    RenamedFrom,

    /// Path was renamed (new name).
    RenamedTo,

    /// Subscribing to a watched root failed, or the root went away.
    WatchError,

    /// Subscribing to a subdirectory of a watched root failed.
    SubWatchError,

    /// The callback fell behind and queued events were dropped.
    Backpressure,

    /// The callback returned an error or panicked.
    CallbackError,
}

impl EventKind {
    /// Whether this kind reports on the watcher itself rather than on a
    /// filesystem change.
    pub fn is_diagnostic(self) -> bool {
        matches!(
            self,
            Self::WatchError | Self::SubWatchError | Self::Backpressure | Self::CallbackError
        )
    }
}

/// The unit delivered to the callback, serialized as a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticEvent {
    /// The kind of event.
    pub kind: EventKind,

    /// Path the event is about. Serialized lossily: bytes that are not
    /// valid UTF-8 become U+FFFD.
    #[serde(with = "lossy_path")]
    pub path: PathBuf,

    /// Seconds since the Unix epoch.
    #[serde(with = "epoch_seconds")]
    pub timestamp: DateTime<Utc>,

    /// Detail for diagnostic events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SemanticEvent {
    /// Create a new event stamped with the current time.
    pub fn new(kind: EventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            timestamp: Utc::now(),
            error: None,
        }
    }

    /// Create a diagnostic event with a detail message.
    pub fn diagnostic(kind: EventKind, path: impl Into<PathBuf>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(kind, path)
        }
    }

    /// Override the timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Serialize to the JSON payload handed to callbacks.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

mod epoch_seconds {
    use chrono::{DateTime, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(ts.timestamp_micros() as f64 / 1_000_000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        let micros = (secs * 1_000_000.0).round() as i64;
        DateTime::from_timestamp_micros(micros)
            .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {secs}")))
    }
}

mod lossy_path {
    use std::path::{Path, PathBuf};

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(path: &Path, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&path.to_string_lossy())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PathBuf, D::Error> {
        String::deserialize(deserializer).map(PathBuf::from)
    }
}
