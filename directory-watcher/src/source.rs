//! Event sources: the seam between the engine and native notification
//! mechanisms.
//!
//! An [`EventSource`] turns a root directory into a [`Subscription`] whose
//! notifications are pushed, normalized to [`RawNotification`], into a
//! channel owned by the watcher's event loop. Dropping the subscription
//! releases every native handle it holds.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{Backend, Exclusions, WatcherConfig};
use crate::error::Result;
use crate::event::{ChangeKind, RawNotification};
use crate::registry::WatchId;

/// Channel end handed to subscriptions.
pub type SourceSender = mpsc::UnboundedSender<SourceMessage>;

/// A message from a subscription to the event loop.
#[derive(Debug)]
pub struct SourceMessage {
    /// Registration the subscription belongs to.
    pub watch: WatchId,

    /// What happened.
    pub payload: SourcePayload,
}

impl SourceMessage {
    pub fn notification(watch: WatchId, notification: RawNotification) -> Self {
        Self {
            watch,
            payload: SourcePayload::Notification(notification),
        }
    }
}

/// Payload of a [`SourceMessage`].
#[derive(Debug)]
pub enum SourcePayload {
    /// A filesystem change.
    Notification(RawNotification),

    /// The native mechanism reported an error after setup.
    Error {
        path: Option<PathBuf>,
        message: String,
    },
}

/// Directories attached while growing a subscription.
#[derive(Debug, Default)]
pub struct AttachReport {
    /// Directories that now have a native watch.
    pub attached: Vec<PathBuf>,

    /// Entries found inside newly attached directories. They may have been
    /// created before the watch existed, so the engine reports them as
    /// created.
    pub discovered: Vec<PathBuf>,

    /// Directories that could not be attached, with the reason.
    pub failures: Vec<(PathBuf, String)>,
}

/// A live subscription for one watched root.
pub trait Subscription: Send {
    /// The root this subscription covers.
    fn root(&self) -> &Path;

    /// Whether new subdirectories must be attached by the engine.
    fn tracks_directories(&self) -> bool;

    /// Attach a directory that appeared under the root, along with any
    /// directories nested in it.
    fn attach(&mut self, dir: &Path) -> AttachReport;

    /// Forget a directory (and everything below it) that went away.
    fn detach(&mut self, dir: &Path);

    /// Number of native watches held.
    fn handle_count(&self) -> usize;
}

/// Result of subscribing to a root.
pub struct SubscriptionSetup {
    /// The subscription handle.
    pub subscription: Box<dyn Subscription>,

    /// Subdirectories that could not be attached during setup.
    pub failures: Vec<(PathBuf, String)>,
}

impl fmt::Debug for SubscriptionSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionSetup")
            .field("root", &self.subscription.root())
            .field("failures", &self.failures)
            .finish()
    }
}

/// Something that can subscribe to filesystem changes under a root.
///
/// `subscribe` may block (it walks the tree and registers native watches);
/// the watcher calls it from a blocking task.
pub trait EventSource: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Subscribe to `root`. Notifications must be sent to `sink` tagged
    /// with `watch`.
    fn subscribe(&self, watch: WatchId, root: &Path, sink: SourceSender)
    -> Result<SubscriptionSetup>;
}

/// Event source backed by the `notify` crate.
#[derive(Debug, Clone)]
pub struct NotifySource {
    backend: Backend,
    poll_interval: Duration,
    recursive: bool,
    exclusions: Exclusions,
}

impl NotifySource {
    /// Build a source from the watcher configuration.
    pub fn from_config(config: &WatcherConfig) -> Self {
        Self {
            backend: config.backend,
            poll_interval: config.poll_interval(),
            recursive: config.recursive,
            exclusions: config.exclusions(),
        }
    }
}

impl EventSource for NotifySource {
    fn name(&self) -> &'static str {
        match self.backend {
            Backend::Native => "native",
            Backend::Poll => "poll",
        }
    }

    fn subscribe(
        &self,
        watch: WatchId,
        root: &Path,
        sink: SourceSender,
    ) -> Result<SubscriptionSetup> {
        let handler = forward_events(watch, sink);

        match self.backend {
            Backend::Native => {
                let watcher = notify::recommended_watcher(handler)?;
                let mut subscription = DirectorySubscription {
                    root: root.to_path_buf(),
                    watcher,
                    directories: BTreeSet::new(),
                    recursive: self.recursive,
                    exclusions: self.exclusions.clone(),
                };

                subscription
                    .watcher
                    .watch(root, RecursiveMode::NonRecursive)?;
                subscription.directories.insert(root.to_path_buf());

                let failures = if self.recursive {
                    subscription.attach_below(root).failures
                } else {
                    Vec::new()
                };

                debug!(
                    "Subscribed {} with {} native watches",
                    root.display(),
                    subscription.directories.len()
                );

                Ok(SubscriptionSetup {
                    subscription: Box::new(subscription),
                    failures,
                })
            }
            Backend::Poll => {
                // Same-size rewrites within one mtime tick are only visible
                // by hashing contents.
                let config = notify::Config::default()
                    .with_poll_interval(self.poll_interval)
                    .with_compare_contents(true);
                let mut watcher = PollWatcher::new(handler, config)?;
                let mode = if self.recursive {
                    RecursiveMode::Recursive
                } else {
                    RecursiveMode::NonRecursive
                };
                watcher.watch(root, mode)?;

                debug!(
                    "Polling {} every {:?}",
                    root.display(),
                    self.poll_interval
                );

                Ok(SubscriptionSetup {
                    subscription: Box::new(PolledSubscription {
                        root: root.to_path_buf(),
                        _watcher: watcher,
                    }),
                    failures: Vec::new(),
                })
            }
        }
    }
}

/// Native subscription holding one non-recursive watch per directory.
struct DirectorySubscription {
    root: PathBuf,
    watcher: RecommendedWatcher,
    directories: BTreeSet<PathBuf>,
    recursive: bool,
    exclusions: Exclusions,
}

impl DirectorySubscription {
    /// Walk `dir` and attach every directory below it (not `dir` itself).
    fn attach_below(&mut self, dir: &Path) -> AttachReport {
        self.walk(dir, 1)
    }

    fn walk(&mut self, dir: &Path, min_depth: usize) -> AttachReport {
        let mut report = AttachReport::default();
        let exclusions = self.exclusions.clone();

        let walker = WalkDir::new(dir)
            .follow_links(false)
            .min_depth(min_depth)
            .into_iter()
            .filter_entry(|e| !exclusions.is_excluded(e.path()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().unwrap_or(dir).to_path_buf();
                    report.failures.push((path, e.to_string()));
                    continue;
                }
            };

            let path = entry.path();
            if entry.depth() > 0 {
                report.discovered.push(path.to_path_buf());
            }

            if !entry.file_type().is_dir() || self.directories.contains(path) {
                continue;
            }

            match self.watcher.watch(path, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    self.directories.insert(path.to_path_buf());
                    report.attached.push(path.to_path_buf());
                }
                Err(e) => {
                    warn!("Failed to watch subdirectory {}: {e}", path.display());
                    report.failures.push((path.to_path_buf(), e.to_string()));
                }
            }
        }

        report
    }
}

impl Subscription for DirectorySubscription {
    fn root(&self) -> &Path {
        &self.root
    }

    fn tracks_directories(&self) -> bool {
        self.recursive
    }

    fn attach(&mut self, dir: &Path) -> AttachReport {
        if !self.recursive || !dir.starts_with(&self.root) {
            return AttachReport::default();
        }
        self.walk(dir, 0)
    }

    fn detach(&mut self, dir: &Path) {
        let gone: Vec<PathBuf> = self
            .directories
            .iter()
            .filter(|d| d.starts_with(dir) && d.as_path() != self.root)
            .cloned()
            .collect();

        for path in gone {
            // The kernel usually dropped the watch with the directory.
            let _ = self.watcher.unwatch(&path);
            self.directories.remove(&path);
        }
    }

    fn handle_count(&self) -> usize {
        self.directories.len()
    }
}

/// Polling subscription; the poller covers new subdirectories by itself.
struct PolledSubscription {
    root: PathBuf,
    _watcher: PollWatcher,
}

impl Subscription for PolledSubscription {
    fn root(&self) -> &Path {
        &self.root
    }

    fn tracks_directories(&self) -> bool {
        false
    }

    fn attach(&mut self, _dir: &Path) -> AttachReport {
        AttachReport::default()
    }

    fn detach(&mut self, _dir: &Path) {}

    fn handle_count(&self) -> usize {
        1
    }
}

/// Rename sources remembered while waiting for their destination.
const MAX_PENDING_RENAMES: usize = 1024;

/// Build the notify callback that forwards normalized notifications.
///
/// Rename halves reported separately but sharing a tracker cookie are
/// linked, so the destination knows where it came from.
fn forward_events(
    watch: WatchId,
    sink: SourceSender,
) -> impl FnMut(notify::Result<notify::Event>) + Send + 'static {
    let mut rename_sources: HashMap<usize, PathBuf> = HashMap::new();

    move |res| match res {
        Ok(event) => {
            if event.need_rescan() {
                warn!("{watch}: native event queue overflowed, some changes may be missing");
            }

            let tracker = event.attrs.tracker();
            let mode = match event.kind {
                notify::EventKind::Modify(ModifyKind::Name(mode)) => Some(mode),
                _ => None,
            };
            let mut source = None;
            if let Some(cookie) = tracker {
                match mode {
                    Some(RenameMode::From) => {
                        // Moves out of the tree never report a destination.
                        if rename_sources.len() >= MAX_PENDING_RENAMES {
                            rename_sources.clear();
                        }
                        if let Some(path) = event.paths.first() {
                            rename_sources.insert(cookie, path.clone());
                        }
                    }
                    Some(RenameMode::To) => source = rename_sources.remove(&cookie),
                    _ => {}
                }
            }

            for mut notification in normalize(event) {
                if notification.linked.is_none() {
                    notification.linked = source.clone();
                }
                if sink
                    .send(SourceMessage::notification(watch, notification))
                    .is_err()
                {
                    return;
                }
            }
        }
        Err(e) => {
            let _ = sink.send(SourceMessage {
                watch,
                payload: SourcePayload::Error {
                    path: e.paths.first().cloned(),
                    message: e.to_string(),
                },
            });
        }
    }
}

/// Map a notify event onto the shared change bitmask.
pub fn normalize(event: notify::Event) -> Vec<RawNotification> {
    use notify::EventKind as Kind;

    let simple = |paths: Vec<PathBuf>, kind: ChangeKind| -> Vec<RawNotification> {
        paths
            .into_iter()
            .map(|path| RawNotification::new(path, kind))
            .collect()
    };

    match event.kind {
        Kind::Create(_) => simple(event.paths, ChangeKind::CREATED),
        Kind::Remove(_) => simple(event.paths, ChangeKind::REMOVED),
        Kind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => simple(event.paths, ChangeKind::RENAMED_FROM),
            RenameMode::To => simple(event.paths, ChangeKind::RENAMED_TO),
            RenameMode::Both if event.paths.len() == 2 => {
                let from = event.paths[0].clone();
                let to = event.paths[1].clone();
                vec![
                    RawNotification::new(from.clone(), ChangeKind::RENAMED_FROM).linked_to(to.clone()),
                    RawNotification::new(to, ChangeKind::RENAMED_TO).linked_to(from),
                ]
            }
            // Backends that cannot tell the sides apart: decide by existence.
            _ => event
                .paths
                .into_iter()
                .map(|path| {
                    let kind = if path.exists() {
                        ChangeKind::RENAMED_TO
                    } else {
                        ChangeKind::RENAMED_FROM
                    };
                    RawNotification::new(path, kind)
                })
                .collect(),
        },
        Kind::Modify(ModifyKind::Metadata(_)) => simple(event.paths, ChangeKind::METADATA),
        Kind::Modify(_) => simple(event.paths, ChangeKind::CONTENT),
        Kind::Access(_) | Kind::Any | Kind::Other => Vec::new(),
    }
}
