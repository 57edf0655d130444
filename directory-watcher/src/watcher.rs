//! The public watcher handle and the event loop behind it.
//!
//! `DirectoryWatcher` owns three moving parts:
//!
//! - the registry, shared with the event loop behind a `RwLock`;
//! - an event loop task that owns every native subscription, feeds raw
//!   notifications through the debouncer and pushes flushed events to the
//!   dispatcher;
//! - the dispatch thread, which is the only place the callback runs.
//!
//! Subscribing to a root walks its tree, so it happens on a blocking task and
//! `watch()` returns as soon as the root is registered.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{Exclusions, WatcherConfig};
use crate::debounce::Debouncer;
use crate::dispatch::{DispatchQueue, Dispatcher, Envelope, EventCallback};
use crate::error::{Result, WatcherError};
use crate::event::{ChangeKind, EventKind, RawNotification, SemanticEvent};
use crate::registry::{
    PathRegistry, Registration, WatchId, WatchResult, WatchStatus, normalize_lenient,
    normalize_root,
};
use crate::source::{
    EventSource, NotifySource, SourceMessage, SourcePayload, SourceSender, Subscription,
    SubscriptionSetup,
};

/// Point-in-time counters describing a watcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatcherStats {
    /// Registered roots, including failed ones.
    pub total: usize,
    pub pending: usize,
    pub active: usize,
    pub failed: usize,

    /// Events waiting for the callback.
    pub queued: usize,

    /// Callback invocations that completed.
    pub delivered: u64,

    /// Events dropped because the callback fell behind.
    pub dropped: u64,

    /// Callback invocations that returned an error or panicked.
    pub callback_errors: u64,
}

enum Command {
    Subscribe {
        watch: WatchId,
        root: PathBuf,
    },
    Unsubscribe {
        watch: WatchId,
        done: oneshot::Sender<()>,
    },
    Shutdown {
        done: Option<oneshot::Sender<()>>,
    },
}

/// Watches directory trees and reports debounced changes to a callback.
///
/// The callback receives the watched root and a JSON-encoded event. It runs
/// on a dedicated thread, one event at a time, and may call back into the
/// watcher.
pub struct DirectoryWatcher {
    /// Watched roots.
    registry: Arc<RwLock<PathRegistry>>,

    /// Commands for the event loop.
    commands: mpsc::UnboundedSender<Command>,

    /// Delivery thread.
    dispatcher: Dispatcher,

    config: WatcherConfig,

    closed: AtomicBool,
}

impl DirectoryWatcher {
    /// Create a watcher with the default configuration.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<F>(callback: F) -> Result<Self>
    where
        F: Fn(&str, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::with_config(callback, WatcherConfig::default())
    }

    /// Create a watcher backed by `notify`.
    pub fn with_config<F>(callback: F, config: WatcherConfig) -> Result<Self>
    where
        F: Fn(&str, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let source = Arc::new(NotifySource::from_config(&config));
        Self::with_source(callback, config, source)
    }

    /// Create a watcher fed by a custom event source.
    pub fn with_source<F>(
        callback: F,
        config: WatcherConfig,
        source: Arc<dyn EventSource>,
    ) -> Result<Self>
    where
        F: Fn(&str, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        config.validate()?;

        let handle = Handle::try_current().map_err(|_| {
            WatcherError::Config("DirectoryWatcher must be created inside a tokio runtime".into())
        })?;

        let callback: EventCallback = Arc::new(callback);
        let dispatcher = Dispatcher::spawn(callback, config.queue_capacity)?;
        let registry = Arc::new(RwLock::new(PathRegistry::new()));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (source_tx, source_rx) = mpsc::unbounded_channel();

        info!(
            "Directory watcher started ({} source, {}ms debounce)",
            source.name(),
            config.debounce_ms
        );

        let event_loop = EventLoop {
            registry: registry.clone(),
            queue: dispatcher.queue().clone(),
            source,
            exclusions: config.exclusions(),
            debouncer: Debouncer::new(config.debounce_window()),
            roots: HashMap::new(),
            setups: JoinSet::new(),
            commands: commands_rx,
            source_tx,
            source_rx,
        };
        handle.spawn(event_loop.run());

        Ok(Self {
            registry,
            commands: commands_tx,
            dispatcher,
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Start watching a directory tree.
    ///
    /// Returns once the root is registered; the native subscription is
    /// confirmed in the background. A subscription failure is reported
    /// through the callback as a `WatchError` event.
    pub async fn watch(&self, path: impl AsRef<Path>) -> Result<WatchResult> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WatcherError::Closed);
        }

        let root = normalize_root(path.as_ref())?;

        let watch = {
            let mut registry = self.registry.write().await;

            if let Some(existing) = registry.get(&root).filter(|e| e.status.is_live()) {
                debug!("Already watching {} ({})", root.display(), existing.id);
                return Ok(WatchResult::AlreadyWatching);
            }

            if let Some(limit) = self.config.max_roots {
                if registry.live_count() >= limit {
                    return Err(WatcherError::WatchLimitExceeded { limit });
                }
            }

            match registry.register(root.clone()) {
                Registration::New(id) => id,
                Registration::Existing(_) => return Ok(WatchResult::AlreadyWatching),
            }
        };

        info!("Watching {} ({watch})", root.display());

        if self
            .commands
            .send(Command::Subscribe {
                watch,
                root: root.clone(),
            })
            .is_err()
        {
            self.registry.write().await.remove(&root);
            return Err(WatcherError::Closed);
        }

        Ok(WatchResult::Watching)
    }

    /// Stop watching a root.
    ///
    /// Returns false if the path was not registered. Once this returns, the
    /// callback receives no further events for the root, and changes still
    /// being debounced are discarded.
    pub async fn unwatch(&self, path: impl AsRef<Path>) -> bool {
        let root = normalize_lenient(path.as_ref());

        let Some(entry) = self.registry.write().await.remove(&root) else {
            debug!("Not watching {}", root.display());
            return false;
        };

        let retired = self.dispatcher.queue().retire(entry.id);
        if retired > 0 {
            debug!("Discarded {retired} queued events for {}", entry.path.display());
        }

        let (done, wait) = oneshot::channel();
        if self
            .commands
            .send(Command::Unsubscribe {
                watch: entry.id,
                done,
            })
            .is_ok()
        {
            let _ = wait.await;
        }
        self.dispatcher.queue().release(entry.id);

        info!("Stopped watching {}", entry.path.display());
        true
    }

    /// Roots currently pending or active, in registration order.
    pub async fn watched_paths(&self) -> Vec<String> {
        self.registry.read().await.snapshot()
    }

    /// Status of a root, if it is registered.
    pub async fn status(&self, path: impl AsRef<Path>) -> Option<WatchStatus> {
        let root = normalize_lenient(path.as_ref());
        self.registry.read().await.get(&root).map(|e| e.status)
    }

    /// Current counters.
    pub async fn stats(&self) -> WatcherStats {
        let mut stats = WatcherStats::default();

        for entry in self.registry.read().await.entries() {
            stats.total += 1;
            match entry.status {
                WatchStatus::Pending => stats.pending += 1,
                WatchStatus::Active => stats.active += 1,
                WatchStatus::Failed => stats.failed += 1,
            }
        }

        let queue = self.dispatcher.queue();
        let counters = queue.counters();
        stats.queued = queue.len();
        stats.delivered = counters.delivered();
        stats.dropped = counters.dropped();
        stats.callback_errors = counters.callback_errors();
        stats
    }

    /// Tear the watcher down.
    ///
    /// Every native subscription is released before this returns. Pending
    /// debounced changes are discarded and no further events are delivered.
    /// Calling it again is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (done, wait) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { done: Some(done) })
            .is_ok()
        {
            let _ = wait.await;
        }

        self.dispatcher.queue().close();
        let drained = self.registry.write().await.drain();
        info!("Directory watcher closed ({} roots released)", drained.len());
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(Command::Shutdown { done: None });
        }
    }
}

struct RootState {
    path: PathBuf,
    label: Arc<str>,
    subscription: Option<Box<dyn Subscription>>,
}

type SetupOutcome = (WatchId, std::result::Result<SubscriptionSetup, String>);

/// Owns the subscriptions and the debouncer. Every method takes `&mut self`
/// so the task stays `Send` even though subscriptions are not `Sync`.
struct EventLoop {
    registry: Arc<RwLock<PathRegistry>>,
    queue: Arc<DispatchQueue>,
    source: Arc<dyn EventSource>,
    exclusions: Exclusions,
    debouncer: Debouncer,
    roots: HashMap<WatchId, RootState>,
    setups: JoinSet<SetupOutcome>,
    commands: mpsc::UnboundedReceiver<Command>,
    source_tx: SourceSender,
    source_rx: mpsc::UnboundedReceiver<SourceMessage>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            let deadline = self
                .debouncer
                .next_deadline()
                .map(tokio::time::Instant::from_std);
            let flush_at =
                tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now));

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Subscribe { watch, root }) => self.subscribe(watch, root),
                    Some(Command::Unsubscribe { watch, done }) => {
                        self.unsubscribe(watch);
                        let _ = done.send(());
                    }
                    Some(Command::Shutdown { done }) => {
                        self.shutdown().await;
                        if let Some(done) = done {
                            let _ = done.send(());
                        }
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(joined) = self.setups.join_next(), if !self.setups.is_empty() => {
                    self.finish_setup(joined).await;
                }
                Some(message) = self.source_rx.recv() => self.handle_source(message).await,
                () = flush_at, if deadline.is_some() => self.flush(),
            }
        }

        debug!("Event loop stopped");
    }

    fn subscribe(&mut self, watch: WatchId, root: PathBuf) {
        let label: Arc<str> = Arc::from(root.display().to_string());
        self.roots.insert(
            watch,
            RootState {
                path: root.clone(),
                label,
                subscription: None,
            },
        );

        let source = self.source.clone();
        let sink = self.source_tx.clone();
        self.setups.spawn_blocking(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| source.subscribe(watch, &root, sink)));
            let result = match result {
                Ok(Ok(setup)) => Ok(setup),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("subscription setup panicked".to_string()),
            };
            (watch, result)
        });
    }

    async fn finish_setup(&mut self, joined: std::result::Result<SetupOutcome, JoinError>) {
        let (watch, result) = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Subscription task failed: {e}");
                return;
            }
        };

        let Some((path, label)) = self
            .roots
            .get(&watch)
            .map(|state| (state.path.clone(), state.label.clone()))
        else {
            debug!("Dropping subscription for retired {watch}");
            return;
        };

        match result {
            Ok(setup) => {
                if !self.registry.write().await.set_status(watch, WatchStatus::Active) {
                    self.roots.remove(&watch);
                    return;
                }

                info!(
                    "Subscribed to {} ({} native watches)",
                    path.display(),
                    setup.subscription.handle_count()
                );

                let SubscriptionSetup {
                    subscription,
                    failures,
                } = setup;
                if let Some(state) = self.roots.get_mut(&watch) {
                    state.subscription = Some(subscription);
                }
                for (dir, reason) in failures {
                    warn!("Could not watch {}: {reason}", dir.display());
                    self.emit(
                        watch,
                        &label,
                        SemanticEvent::diagnostic(EventKind::SubWatchError, dir, reason),
                    );
                }
            }
            Err(reason) => {
                warn!("Failed to watch {}: {reason}", path.display());
                self.roots.remove(&watch);
                self.registry.write().await.set_status(watch, WatchStatus::Failed);
                self.emit(
                    watch,
                    &label,
                    SemanticEvent::diagnostic(EventKind::WatchError, path, reason),
                );
            }
        }
    }

    fn unsubscribe(&mut self, watch: WatchId) {
        if let Some(state) = self.roots.remove(&watch) {
            let handles = state
                .subscription
                .as_deref()
                .map_or(0, Subscription::handle_count);
            debug!("Released {handles} native watches for {}", state.path.display());
        }

        let discarded = self.debouncer.discard_watch(watch);
        if discarded > 0 {
            debug!("Discarded {discarded} pending changes for {watch}");
        }
    }

    async fn handle_source(&mut self, message: SourceMessage) {
        let SourceMessage { watch, payload } = message;

        let notification = match payload {
            SourcePayload::Notification(notification) => notification,
            SourcePayload::Error { path, message } => {
                match path {
                    Some(path) => warn!("Watch error on {}: {message}", path.display()),
                    None => warn!("Watch error for {watch}: {message}"),
                }
                return;
            }
        };

        if self.exclusions.is_excluded(&notification.path) {
            return;
        }

        let Some(state) = self.roots.get_mut(&watch) else {
            return;
        };

        if notification.path == state.path {
            if notification
                .kind
                .intersects(ChangeKind::REMOVED | ChangeKind::RENAMED_FROM)
            {
                self.fail_root(watch, "watched root was removed").await;
            }
            return;
        }

        let mut discovered = Vec::new();
        let mut failures = Vec::new();

        if let Some(subscription) = state
            .subscription
            .as_mut()
            .filter(|subscription| subscription.tracks_directories())
        {
            if notification
                .kind
                .intersects(ChangeKind::CREATED | ChangeKind::RENAMED_TO)
                && notification.path.is_dir()
            {
                let report = subscription.attach(&notification.path);
                if !report.attached.is_empty() {
                    debug!(
                        "Attached {} directories under {}",
                        report.attached.len(),
                        notification.path.display()
                    );
                }
                // Entries of a directory moved within the root are covered
                // by the rename itself.
                let moved_within_root = notification.kind.contains(ChangeKind::RENAMED_TO)
                    && notification
                        .linked
                        .as_deref()
                        .is_some_and(|from| from.starts_with(&state.path));
                if !moved_within_root {
                    discovered = report.discovered;
                }
                failures = report.failures;
            } else if notification
                .kind
                .intersects(ChangeKind::REMOVED | ChangeKind::RENAMED_FROM)
            {
                subscription.detach(&notification.path);
            }
        }

        let label = state.label.clone();
        let now = std::time::Instant::now();
        self.debouncer.record(watch, notification, now);
        for path in discovered {
            self.debouncer
                .record(watch, RawNotification::new(path, ChangeKind::CREATED), now);
        }
        for (dir, reason) in failures {
            warn!("Could not watch {}: {reason}", dir.display());
            self.emit(
                watch,
                &label,
                SemanticEvent::diagnostic(EventKind::SubWatchError, dir, reason),
            );
        }
    }

    /// The root itself went away: deliver what was buffered for it, then
    /// report the failure and release the subscription.
    async fn fail_root(&mut self, watch: WatchId, reason: &str) {
        let Some(state) = self.roots.remove(&watch) else {
            return;
        };
        drop(state.subscription);

        for flushed in self.debouncer.flush_watch(watch) {
            self.emit(flushed.watch, &state.label, flushed.event);
        }

        warn!("{}: {reason}", state.path.display());
        self.registry.write().await.set_status(watch, WatchStatus::Failed);
        self.emit(
            watch,
            &state.label,
            SemanticEvent::diagnostic(EventKind::WatchError, state.path, reason),
        );
    }

    fn flush(&mut self) {
        let ready = self.debouncer.take_ready(std::time::Instant::now());

        for flushed in ready {
            let Some(label) = self.roots.get(&flushed.watch).map(|s| s.label.clone()) else {
                continue;
            };
            self.emit(flushed.watch, &label, flushed.event);
        }
    }

    fn emit(&self, watch: WatchId, root: &Arc<str>, event: SemanticEvent) {
        debug!("{:?} {}", event.kind, event.path.display());
        self.queue.push(Envelope {
            watch,
            root: root.clone(),
            event,
        });
    }

    async fn shutdown(&mut self) {
        let released = self.roots.len();
        self.roots.clear();

        // Subscriptions still being set up are released as they complete.
        while let Some(joined) = self.setups.join_next().await {
            drop(joined);
        }

        let discarded = self.debouncer.pending_count();
        debug!("Released {released} subscriptions, discarded {discarded} pending changes");
    }
}
