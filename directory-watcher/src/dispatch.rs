//! Delivery of events to the user callback.
//!
//! Events are queued in a bounded FIFO and handed to the callback one at a
//! time on a dedicated thread, so a slow callback never stalls the event
//! loop. When the queue is full the oldest queued event for the same path
//! (or else the oldest queued event) is dropped, and a single `Backpressure`
//! event is delivered for the episode. The episode ends once the queue has
//! drained.

use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::event::{EventKind, SemanticEvent};
use crate::registry::WatchId;

/// The user callback: `(watched root, serialized event)`.
///
/// Errors and panics are caught and reported back through the callback as
/// `CallbackError` events.
pub type EventCallback = Arc<dyn Fn(&str, &str) -> anyhow::Result<()> + Send + Sync>;

/// An event on its way to the callback.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub watch: WatchId,
    pub root: Arc<str>,
    pub event: SemanticEvent,
}

/// What happened to a pushed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued for delivery.
    Queued,
    /// Queued, but an older event had to be dropped to make room.
    Displaced,
    /// Not queued: the registration was retired or the queue is closed.
    Rejected,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Envelope>,
    retired: HashSet<WatchId>,
    /// Retired ids to forget once their in-flight delivery finishes.
    releasing: HashSet<WatchId>,
    /// Registration of the envelope the dispatch thread is delivering.
    in_flight: Option<WatchId>,
    overflowing: bool,
    backpressure: Option<Envelope>,
    closed: bool,
}

/// Delivery counters.
#[derive(Debug, Default)]
pub struct DispatchCounters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    callback_errors: AtomicU64,
}

impl DispatchCounters {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn callback_errors(&self) -> u64 {
        self.callback_errors.load(Ordering::Relaxed)
    }
}

/// Bounded queue between the event loop and the dispatch thread.
#[derive(Debug)]
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    capacity: usize,
    counters: DispatchCounters,
}

impl DispatchQueue {
    /// Create a queue holding at most `capacity` undelivered events.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            capacity: capacity.max(1),
            counters: DispatchCounters::default(),
        }
    }

    /// Queue an envelope for delivery.
    pub fn push(&self, envelope: Envelope) -> PushOutcome {
        let mut state = self.state.lock();
        if state.closed || state.retired.contains(&envelope.watch) {
            return PushOutcome::Rejected;
        }

        let mut outcome = PushOutcome::Queued;
        if state.items.len() >= self.capacity {
            let index = state
                .items
                .iter()
                .position(|e| e.watch == envelope.watch && e.event.path == envelope.event.path)
                .unwrap_or(0);

            if let Some(dropped) = state.items.remove(index) {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Dispatch queue full, dropped {:?} for {}",
                    dropped.event.kind,
                    dropped.event.path.display()
                );

                if !state.overflowing {
                    state.overflowing = true;
                    warn!(
                        "Callback is falling behind; dropping events (queue capacity {})",
                        self.capacity
                    );
                    state.backpressure = Some(Envelope {
                        watch: dropped.watch,
                        root: dropped.root.clone(),
                        event: SemanticEvent::diagnostic(
                            EventKind::Backpressure,
                            dropped.root.as_ref(),
                            format!(
                                "dispatch queue full ({} events); dropped {:?} for {}",
                                self.capacity,
                                dropped.event.kind,
                                dropped.event.path.display()
                            ),
                        ),
                    });
                }
            }
            outcome = PushOutcome::Displaced;
        }

        state.items.push_back(envelope);
        self.ready.notify_one();
        outcome
    }

    /// Block until an envelope is available. Returns `None` once closed.
    ///
    /// The envelope counts as in flight until [`DispatchQueue::finish`].
    pub fn pop_blocking(&self) -> Option<Envelope> {
        let mut state = self.state.lock();
        loop {
            if let Some(envelope) = Self::try_pop_locked(&mut state) {
                state.in_flight = Some(envelope.watch);
                return Some(envelope);
            }
            if state.closed {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    /// Take the next envelope without blocking.
    pub fn try_pop(&self) -> Option<Envelope> {
        let mut state = self.state.lock();
        Self::try_pop_locked(&mut state)
    }

    fn try_pop_locked(state: &mut QueueState) -> Option<Envelope> {
        if state.closed {
            return None;
        }
        if let Some(backpressure) = state.backpressure.take() {
            return Some(backpressure);
        }
        let next = state.items.pop_front();
        if state.items.is_empty() {
            state.overflowing = false;
        }
        next
    }

    /// Stop delivering anything for a registration; queued events for it
    /// are discarded.
    pub fn retire(&self, watch: WatchId) -> usize {
        let mut state = self.state.lock();
        state.retired.insert(watch);

        let before = state.items.len();
        state.items.retain(|e| e.watch != watch);
        if state.backpressure.as_ref().is_some_and(|e| e.watch == watch) {
            state.backpressure = None;
        }
        before - state.items.len()
    }

    /// Forget a retired registration once nothing can push for it any more.
    ///
    /// If the dispatch thread is still delivering one of its events, the id
    /// stays retired until that delivery finishes, so a `CallbackError` for
    /// it is still rejected.
    pub fn release(&self, watch: WatchId) {
        let mut state = self.state.lock();
        if state.in_flight == Some(watch) {
            state.releasing.insert(watch);
        } else {
            state.retired.remove(&watch);
        }
    }

    /// Mark the in-flight delivery as done.
    pub fn finish(&self, watch: WatchId) {
        let mut state = self.state.lock();
        state.in_flight = None;
        if state.releasing.remove(&watch) {
            state.retired.remove(&watch);
        }
    }

    /// Close the queue, discarding undelivered events and waking the
    /// dispatch thread.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.retired.clear();
        state.releasing.clear();
        state.items.clear();
        state.backpressure = None;
        self.ready.notify_all();
    }

    /// Number of queued envelopes.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivery counters.
    pub fn counters(&self) -> &DispatchCounters {
        &self.counters
    }
}

/// Owns the dispatch thread.
pub struct Dispatcher {
    queue: Arc<DispatchQueue>,
}

impl Dispatcher {
    /// Start the dispatch thread.
    pub fn spawn(callback: EventCallback, capacity: usize) -> Result<Self> {
        let queue = Arc::new(DispatchQueue::new(capacity));
        let worker_queue = queue.clone();

        thread::Builder::new()
            .name("dirwatch-dispatch".to_string())
            .spawn(move || run(&worker_queue, callback.as_ref()))?;

        Ok(Self { queue })
    }

    /// The queue feeding the dispatch thread.
    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.queue.close();
    }
}

fn run(queue: &DispatchQueue, callback: &(dyn Fn(&str, &str) -> anyhow::Result<()> + Send + Sync)) {
    while let Some(envelope) = queue.pop_blocking() {
        let watch = envelope.watch;
        deliver(queue, callback, envelope);
        queue.finish(watch);
    }
    debug!("Dispatch thread stopped");
}

fn deliver(
    queue: &DispatchQueue,
    callback: &(dyn Fn(&str, &str) -> anyhow::Result<()> + Send + Sync),
    envelope: Envelope,
) {
    let json = match envelope.event.to_json() {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize event: {e}");
            return;
        }
    };

    let message = match panic::catch_unwind(AssertUnwindSafe(|| callback(&*envelope.root, &json))) {
        Ok(Ok(())) => {
            queue.counters.delivered.fetch_add(1, Ordering::Relaxed);
            return;
        }
        Ok(Err(e)) => format!("{e:#}"),
        Err(payload) => format!("callback panicked: {}", panic_message(payload.as_ref())),
    };

    queue.counters.callback_errors.fetch_add(1, Ordering::Relaxed);

    if envelope.event.kind == EventKind::CallbackError {
        warn!("Callback failed while handling a callback error: {message}");
        return;
    }

    warn!(
        "Callback failed for {:?} on {}: {message}",
        envelope.event.kind,
        envelope.event.path.display()
    );
    queue.push(Envelope {
        event: SemanticEvent::diagnostic(
            EventKind::CallbackError,
            envelope.event.path.clone(),
            message,
        ),
        ..envelope
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PathRegistry, Registration};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::sync::mpsc;
    use std::time::Duration;

    fn watch_id(registry: &mut PathRegistry, root: &str) -> WatchId {
        match registry.register(PathBuf::from(root)) {
            Registration::New(id) | Registration::Existing(id) => id,
        }
    }

    fn envelope(watch: WatchId, path: &str, kind: EventKind) -> Envelope {
        Envelope {
            watch,
            root: Arc::from("/w"),
            event: SemanticEvent::new(kind, path),
        }
    }

    fn drain(queue: &DispatchQueue) -> Vec<(EventKind, PathBuf)> {
        std::iter::from_fn(|| queue.try_pop())
            .map(|e| (e.event.kind, e.event.path))
            .collect()
    }

    #[test]
    fn test_queue_is_fifo() {
        let mut registry = PathRegistry::new();
        let w = watch_id(&mut registry, "/w");
        let queue = DispatchQueue::new(8);

        queue.push(envelope(w, "/w/a", EventKind::Created));
        queue.push(envelope(w, "/w/b", EventKind::Modified));

        assert_eq!(
            drain(&queue),
            vec![
                (EventKind::Created, PathBuf::from("/w/a")),
                (EventKind::Modified, PathBuf::from("/w/b")),
            ]
        );
    }

    #[test]
    fn test_overflow_drops_oldest_for_same_path_and_reports_once() {
        let mut registry = PathRegistry::new();
        let w = watch_id(&mut registry, "/w");
        let queue = DispatchQueue::new(2);

        assert_eq!(queue.push(envelope(w, "/w/a", EventKind::Created)), PushOutcome::Queued);
        assert_eq!(queue.push(envelope(w, "/w/b", EventKind::Created)), PushOutcome::Queued);
        // Displaces /w/b (same path), not /w/a.
        assert_eq!(queue.push(envelope(w, "/w/b", EventKind::Removed)), PushOutcome::Displaced);
        // No queued event for /w/c: the oldest (/w/a) goes.
        assert_eq!(queue.push(envelope(w, "/w/c", EventKind::Created)), PushOutcome::Displaced);

        assert_eq!(queue.counters().dropped(), 2);
        assert_eq!(
            drain(&queue),
            vec![
                (EventKind::Backpressure, PathBuf::from("/w")),
                (EventKind::Removed, PathBuf::from("/w/b")),
                (EventKind::Created, PathBuf::from("/w/c")),
            ]
        );
    }

    #[test]
    fn test_new_overflow_episode_after_drain() {
        let mut registry = PathRegistry::new();
        let w = watch_id(&mut registry, "/w");
        let queue = DispatchQueue::new(1);

        queue.push(envelope(w, "/w/a", EventKind::Created));
        queue.push(envelope(w, "/w/b", EventKind::Created));
        queue.push(envelope(w, "/w/c", EventKind::Created));
        let first: Vec<_> = drain(&queue).into_iter().map(|(k, _)| k).collect();
        assert_eq!(first, vec![EventKind::Backpressure, EventKind::Created]);

        queue.push(envelope(w, "/w/d", EventKind::Created));
        queue.push(envelope(w, "/w/e", EventKind::Created));
        let second: Vec<_> = drain(&queue).into_iter().map(|(k, _)| k).collect();
        assert_eq!(second, vec![EventKind::Backpressure, EventKind::Created]);
    }

    #[test]
    fn test_retire_discards_and_rejects() {
        let mut registry = PathRegistry::new();
        let a = watch_id(&mut registry, "/a");
        let b = watch_id(&mut registry, "/b");
        let queue = DispatchQueue::new(8);

        queue.push(envelope(a, "/a/1", EventKind::Created));
        queue.push(envelope(b, "/b/1", EventKind::Created));
        queue.push(envelope(a, "/a/2", EventKind::Created));

        assert_eq!(queue.retire(a), 2);
        assert_eq!(queue.push(envelope(a, "/a/3", EventKind::Created)), PushOutcome::Rejected);
        assert_eq!(drain(&queue), vec![(EventKind::Created, PathBuf::from("/b/1"))]);
    }

    #[test]
    fn test_release_forgets_retired_ids() {
        let mut registry = PathRegistry::new();
        let a = watch_id(&mut registry, "/a");
        let queue = DispatchQueue::new(8);

        queue.retire(a);
        queue.release(a);
        assert!(queue.state.lock().retired.is_empty());
    }

    #[test]
    fn test_release_waits_for_in_flight_delivery() {
        let mut registry = PathRegistry::new();
        let a = watch_id(&mut registry, "/a");
        let queue = DispatchQueue::new(8);

        queue.push(envelope(a, "/a/1", EventKind::Created));
        let delivering = queue.pop_blocking().unwrap();
        queue.retire(a);
        queue.release(a);

        // A callback error raised by the in-flight delivery is still rejected.
        assert_eq!(
            queue.push(envelope(a, "/a/1", EventKind::CallbackError)),
            PushOutcome::Rejected
        );

        queue.finish(delivering.watch);
        let state = queue.state.lock();
        assert!(state.retired.is_empty());
        assert!(state.releasing.is_empty());
    }

    #[test]
    fn test_close_unblocks_and_discards() {
        let mut registry = PathRegistry::new();
        let w = watch_id(&mut registry, "/w");
        let queue = Arc::new(DispatchQueue::new(8));

        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop_blocking().is_none())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(waiter.join().unwrap());

        assert_eq!(queue.push(envelope(w, "/w/a", EventKind::Created)), PushOutcome::Rejected);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_callback_errors_are_reported_once() {
        let mut registry = PathRegistry::new();
        let w = watch_id(&mut registry, "/w");
        let (tx, rx) = mpsc::channel::<String>();

        let callback: EventCallback = Arc::new(move |_root: &str, json: &str| -> anyhow::Result<()> {
            tx.send(json.to_string())?;
            anyhow::bail!("handler refused")
        });
        let dispatcher = Dispatcher::spawn(callback, 8).unwrap();
        dispatcher.queue().push(envelope(w, "/w/a", EventKind::Created));

        let first: SemanticEvent =
            serde_json::from_str(&rx.recv_timeout(Duration::from_secs(2)).unwrap()).unwrap();
        let second: SemanticEvent =
            serde_json::from_str(&rx.recv_timeout(Duration::from_secs(2)).unwrap()).unwrap();

        assert_eq!(first.kind, EventKind::Created);
        assert_eq!(second.kind, EventKind::CallbackError);
        assert_eq!(second.path, PathBuf::from("/w/a"));
        assert_eq!(second.error.as_deref(), Some("handler refused"));
        // The failing CallbackError delivery is not re-reported.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(dispatcher.queue().counters().callback_errors(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_paths_are_delivered() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let mut registry = PathRegistry::new();
        let w = watch_id(&mut registry, "/w");
        let (tx, rx) = mpsc::channel::<SemanticEvent>();

        let callback: EventCallback = Arc::new(move |_root: &str, json: &str| -> anyhow::Result<()> {
            tx.send(serde_json::from_str(json)?)?;
            Ok(())
        });
        let dispatcher = Dispatcher::spawn(callback, 8).unwrap();
        dispatcher.queue().push(Envelope {
            watch: w,
            root: Arc::from("/w"),
            event: SemanticEvent::new(EventKind::Created, OsStr::from_bytes(b"/w/caf\xe9.txt")),
        });

        let delivered = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(delivered.kind, EventKind::Created);
        assert_eq!(delivered.path, PathBuf::from("/w/caf\u{FFFD}.txt"));
    }

    #[test]
    fn test_callback_panics_are_caught() {
        let mut registry = PathRegistry::new();
        let w = watch_id(&mut registry, "/w");
        let (tx, rx) = mpsc::channel::<SemanticEvent>();

        let callback: EventCallback = Arc::new(move |_root: &str, json: &str| -> anyhow::Result<()> {
            let event: SemanticEvent = serde_json::from_str(json)?;
            if event.kind == EventKind::Created {
                panic!("boom");
            }
            tx.send(event)?;
            Ok(())
        });
        let dispatcher = Dispatcher::spawn(callback, 8).unwrap();
        dispatcher.queue().push(envelope(w, "/w/a", EventKind::Created));

        let reported = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(reported.kind, EventKind::CallbackError);
        assert_eq!(reported.error.as_deref(), Some("callback panicked: boom"));
        assert_eq!(dispatcher.queue().counters().callback_errors(), 1);
    }
}
