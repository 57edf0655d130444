//! # Directory Watcher
//!
//! Watches directory trees and reports debounced, coalesced changes to a
//! single callback.
//!
//! ## Features
//!
//! - **Recursive Watching**: Whole trees, including directories created later
//! - **Debouncing**: A burst of writes to one path becomes one event
//! - **Rename Pairing**: Moves inside a root arrive as `RenamedFrom`/`RenamedTo`
//! - **Isolated Delivery**: The callback runs on its own thread; its failures
//!   and slowness are reported, never propagated
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Directory Watcher                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  watch() ──► PathRegistry          EventSource (notify)         │
//! │                                         │                       │
//! │                                         ▼ RawNotification       │
//! │                                    Debouncer                    │
//! │                                         │                       │
//! │                                         ▼ SemanticEvent         │
//! │                                    DispatchQueue ──► callback   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! # async fn demo() -> dirwatch::Result<()> {
//! use dirwatch::DirectoryWatcher;
//!
//! let watcher = DirectoryWatcher::new(|root: &str, json: &str| {
//!     println!("{root}: {json}");
//!     Ok(())
//! })?;
//! watcher.watch("/tmp/project").await?;
//! # watcher.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod debounce;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod registry;
pub mod source;
pub mod watcher;

pub use config::{Backend, WatcherConfig};
pub use error::{Result, WatcherError};
pub use event::{ChangeKind, EventKind, RawNotification, SemanticEvent};
pub use registry::{WatchId, WatchResult, WatchStatus};
pub use source::{EventSource, NotifySource, SourceMessage, SourceSender, Subscription};
pub use watcher::{DirectoryWatcher, WatcherStats};
