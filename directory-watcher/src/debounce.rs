//! Per-path debouncing and coalescing of raw notifications.
//!
//! Each (watch, path) pair gets a buffer and a quiescence deadline. Every
//! notification for the pair merges into the buffer and pushes the deadline
//! out by one window. Once the deadline passes the buffer collapses into at
//! most one [`SemanticEvent`].
//!
//! This is a pure data structure: callers pass the current instant in, which
//! keeps it deterministic under test.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::event::{ChangeKind, EventKind, RawNotification, SemanticEvent};
use crate::registry::WatchId;

/// An event ready for dispatch, tagged with the registration it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Flushed {
    pub watch: WatchId,
    pub event: SemanticEvent,
}

/// Existence change of a path, with the rename counterpart if known.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Transition {
    Appeared { from: Option<PathBuf> },
    Disappeared { to: Option<PathBuf> },
}

impl Transition {
    fn same_direction(&self, other: &Transition) -> bool {
        matches!(
            (self, other),
            (Self::Appeared { .. }, Self::Appeared { .. })
                | (Self::Disappeared { .. }, Self::Disappeared { .. })
        )
    }

    /// Keep a known counterpart when a duplicate report arrives without one.
    fn absorb(&mut self, other: Transition) {
        match (self, other) {
            (Self::Appeared { from }, Self::Appeared { from: Some(f) }) => *from = Some(f),
            (Self::Disappeared { to }, Self::Disappeared { to: Some(t) }) => *to = Some(t),
            _ => {}
        }
    }
}

#[derive(Debug)]
struct PendingChange {
    transitions: Vec<Transition>,
    modified: bool,
    timestamp: DateTime<Utc>,
    deadline: Instant,
    seq: u64,
}

impl PendingChange {
    fn push(&mut self, transition: Transition) {
        match self.transitions.last_mut() {
            Some(last) if last.same_direction(&transition) => last.absorb(transition),
            _ => self.transitions.push(transition),
        }
    }

    fn outcome(&self) -> Outcome {
        let (Some(first), Some(last)) = (self.transitions.first(), self.transitions.last()) else {
            return if self.modified {
                Outcome::Emit(EventKind::Modified)
            } else {
                Outcome::Nothing
            };
        };

        match (first, last) {
            // Came and went inside one window.
            (Transition::Appeared { .. }, Transition::Disappeared { .. }) => Outcome::Nothing,
            (_, Transition::Disappeared { to: Some(to) }) => Outcome::RenameOut(to.clone()),
            (_, Transition::Disappeared { to: None }) => Outcome::Emit(EventKind::Removed),
            // Existed before, was removed and came back: replaced in place.
            (Transition::Disappeared { .. }, Transition::Appeared { .. }) => {
                Outcome::Emit(EventKind::Modified)
            }
            (_, Transition::Appeared { from: Some(from) }) => Outcome::RenameIn(from.clone()),
            (_, Transition::Appeared { from: None }) => Outcome::Emit(EventKind::Created),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Nothing,
    Emit(EventKind),
    RenameOut(PathBuf),
    RenameIn(PathBuf),
}

/// Debounces raw notifications per (watch, path).
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<(WatchId, PathBuf), PendingChange>,
    seq: u64,
}

impl Debouncer {
    /// Create a debouncer with the given quiescence window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
            seq: 0,
        }
    }

    /// The quiescence window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Merge a notification into the buffer for its path and reset the
    /// path's deadline.
    pub fn record(&mut self, watch: WatchId, notification: RawNotification, now: Instant) {
        let RawNotification {
            path,
            kind,
            linked,
            timestamp,
        } = notification;

        if kind.is_empty() {
            return;
        }

        self.seq += 1;
        let seq = self.seq;
        let deadline = now + self.window;

        let change = self
            .pending
            .entry((watch, path))
            .or_insert_with(|| PendingChange {
                transitions: Vec::new(),
                modified: false,
                timestamp,
                deadline,
                seq,
            });

        if kind.contains(ChangeKind::CREATED) {
            change.push(Transition::Appeared { from: None });
        }
        if kind.contains(ChangeKind::RENAMED_TO) {
            change.push(Transition::Appeared {
                from: linked.clone(),
            });
        }
        if kind.intersects(ChangeKind::CONTENT | ChangeKind::METADATA) {
            change.modified = true;
        }
        if kind.contains(ChangeKind::RENAMED_FROM) {
            change.push(Transition::Disappeared { to: linked });
        }
        if kind.contains(ChangeKind::REMOVED) {
            change.push(Transition::Disappeared { to: None });
        }

        change.timestamp = change.timestamp.max(timestamp);
        change.deadline = deadline;
        change.seq = seq;
    }

    /// Earliest deadline among pending buffers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|c| c.deadline).min()
    }

    /// Flush every buffer whose deadline has passed.
    ///
    /// Events come out ordered by deadline, then by arrival. When both sides
    /// of a linked rename are buffered they flush together as a
    /// `RenamedFrom`/`RenamedTo` pair, whichever side arrived first. An
    /// unmatched side degrades to `Removed` or `Created`.
    pub fn take_ready(&mut self, now: Instant) -> Vec<Flushed> {
        self.take_matching(|_, change| change.deadline <= now)
    }

    /// Flush every buffer of one registration immediately, regardless of
    /// deadlines.
    pub fn flush_watch(&mut self, watch: WatchId) -> Vec<Flushed> {
        self.take_matching(|(w, _), _| *w == watch)
    }

    fn take_matching<F>(&mut self, matches: F) -> Vec<Flushed>
    where
        F: Fn(&(WatchId, PathBuf), &PendingChange) -> bool,
    {
        let mut ready_keys: Vec<(WatchId, PathBuf)> = self
            .pending
            .iter()
            .filter(|(key, change)| matches(key, change))
            .map(|(key, _)| key.clone())
            .collect();

        if ready_keys.is_empty() {
            return Vec::new();
        }

        // A linked rename flushes with its counterpart even if the other
        // side is still inside its window.
        let mut selected: HashSet<(WatchId, PathBuf)> = ready_keys.iter().cloned().collect();
        let counterparts: Vec<(WatchId, PathBuf)> = ready_keys
            .iter()
            .filter_map(|key| self.counterpart(key))
            .collect();
        for key in counterparts {
            if selected.insert(key.clone()) {
                ready_keys.push(key);
            }
        }

        let mut ready: Vec<((WatchId, PathBuf), PendingChange)> = ready_keys
            .into_iter()
            .filter_map(|key| self.pending.remove_entry(&key))
            .collect();
        ready.sort_by_key(|(_, change)| (change.deadline, change.seq));

        let outcomes: Vec<(WatchId, PathBuf, Outcome, DateTime<Utc>)> = ready
            .into_iter()
            .map(|((watch, path), change)| {
                let outcome = change.outcome();
                (watch, path, outcome, change.timestamp)
            })
            .collect();

        // (watch, new path, old path) for every rename-in in this flush.
        let rename_ins: HashSet<(WatchId, &PathBuf, &PathBuf)> = outcomes
            .iter()
            .filter_map(|(watch, path, outcome, _)| match outcome {
                Outcome::RenameIn(from) => Some((*watch, path, from)),
                _ => None,
            })
            .collect();
        // (watch, old path, new path) for every rename-out in this flush.
        let rename_outs: HashSet<(WatchId, &PathBuf, &PathBuf)> = outcomes
            .iter()
            .filter_map(|(watch, path, outcome, _)| match outcome {
                Outcome::RenameOut(to) => Some((*watch, path, to)),
                _ => None,
            })
            .collect();

        let mut flushed = Vec::with_capacity(outcomes.len());

        for (watch, path, outcome, timestamp) in &outcomes {
            match outcome {
                Outcome::Nothing => {}
                Outcome::Emit(kind) => flushed.push(Flushed {
                    watch: *watch,
                    event: SemanticEvent::new(*kind, path.clone()).at(*timestamp),
                }),
                Outcome::RenameOut(to) => {
                    if rename_ins.contains(&(*watch, to, path)) {
                        let to_timestamp = outcomes
                            .iter()
                            .find(|(w, p, _, _)| w == watch && p == to)
                            .map_or(*timestamp, |(_, _, _, ts)| *ts);
                        flushed.push(Flushed {
                            watch: *watch,
                            event: SemanticEvent::new(EventKind::RenamedFrom, path.clone())
                                .at(*timestamp),
                        });
                        flushed.push(Flushed {
                            watch: *watch,
                            event: SemanticEvent::new(EventKind::RenamedTo, to.clone())
                                .at(to_timestamp),
                        });
                    } else {
                        flushed.push(Flushed {
                            watch: *watch,
                            event: SemanticEvent::new(EventKind::Removed, path.clone())
                                .at(*timestamp),
                        });
                    }
                }
                // Paired renames are emitted from the rename-out side.
                Outcome::RenameIn(from) => {
                    if !rename_outs.contains(&(*watch, from, path)) {
                        flushed.push(Flushed {
                            watch: *watch,
                            event: SemanticEvent::new(EventKind::Created, path.clone())
                                .at(*timestamp),
                        });
                    }
                }
            }
        }

        flushed
    }

    /// The pending buffer on the other side of a linked rename, if both
    /// sides agree on the link.
    fn counterpart(&self, key: &(WatchId, PathBuf)) -> Option<(WatchId, PathBuf)> {
        let (watch, path) = key;
        let (other, expected) = match self.pending.get(key)?.outcome() {
            Outcome::RenameOut(to) => (to, Outcome::RenameIn(path.clone())),
            Outcome::RenameIn(from) => (from, Outcome::RenameOut(path.clone())),
            Outcome::Nothing | Outcome::Emit(_) => return None,
        };
        let other = (*watch, other);
        let change = self.pending.get(&other)?;
        (change.outcome() == expected).then_some(other)
    }

    /// Drop every buffer belonging to a registration without flushing.
    pub fn discard_watch(&mut self, watch: WatchId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|(w, _), _| *w != watch);
        before - self.pending.len()
    }

    /// Number of buffered paths.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PathRegistry, Registration};
    use pretty_assertions::assert_eq;

    const WINDOW: Duration = Duration::from_millis(100);

    fn watch_id(registry: &mut PathRegistry, root: &str) -> WatchId {
        match registry.register(PathBuf::from(root)) {
            Registration::New(id) | Registration::Existing(id) => id,
        }
    }

    fn kinds(flushed: &[Flushed]) -> Vec<(EventKind, PathBuf)> {
        flushed
            .iter()
            .map(|f| (f.event.kind, f.event.path.clone()))
            .collect()
    }

    fn raw(path: &str, kind: ChangeKind) -> RawNotification {
        RawNotification::new(path, kind)
    }

    #[test]
    fn test_nothing_flushes_before_window() {
        let mut registry = PathRegistry::new();
        let w = watch_id(&mut registry, "/w");
        let mut debouncer = Debouncer::new(WINDOW);
        let now = Instant::now();

        debouncer.record(w, raw("/w/a.txt", ChangeKind::CONTENT), now);

        assert!(debouncer.take_ready(now + WINDOW / 2).is_empty());
        assert_eq!(debouncer.pending_count(), 1);
        assert_eq!(debouncer.next_deadline(), Some(now + WINDOW));
    }

    #[test]
    fn test_rapid_modifications_yield_one_modified() {
        let mut registry = PathRegistry::new();
        let w = watch_id(&mut registry, "/w");
        let mut debouncer = Debouncer::new(WINDOW);
        let start = Instant::now();

        for i in 0..20 {
            let kind = if i % 2 == 0 {
                ChangeKind::CONTENT
            } else {
                ChangeKind::METADATA
            };
            debouncer.record(w, raw("/w/a.txt", kind), start + Duration::from_millis(i * 10));
        }

        // The last notification arrived at +190ms; the window runs from there.
        assert!(debouncer.take_ready(start + Duration::from_millis(250)).is_empty());

        let flushed = debouncer.take_ready(start + Duration::from_millis(290));
        assert_eq!(
            kinds(&flushed),
            vec![(EventKind::Modified, PathBuf::from("/w/a.txt"))]
        );
        assert!(debouncer.is_empty());
    }

    #[test]
    fn test_created_then_modified_is_created() {
        let mut registry = PathRegistry::new();
        let w = watch_id(&mut registry, "/w");
        let mut debouncer = Debouncer::new(WINDOW);
        let now = Instant::now();

        debouncer.record(w, raw("/w/a.txt", ChangeKind::CREATED), now);
        debouncer.record(w, raw("/w/a.txt", ChangeKind::CONTENT), now);

        let flushed = debouncer.take_ready(now + WINDOW);
        assert_eq!(
            kinds(&flushed),
            vec![(EventKind::Created, PathBuf::from("/w/a.txt"))]
        );
    }

    #[test]
    fn test_created_then_removed_is_net_zero() {
        let mut registry = PathRegistry::new();
        let w = watch_id(&mut registry, "/w");
        let mut debouncer = Debouncer::new(WINDOW);
        let now = Instant::now();

        debouncer.record(w, raw("/w/tmp", ChangeKind::CREATED), now);
        debouncer.record(w, raw("/w/tmp", ChangeKind::CONTENT), now);
        debouncer.record(w, raw("/w/tmp", ChangeKind::REMOVED), now);

        assert!(debouncer.take_ready(now + WINDOW).is_empty());
        assert!(debouncer.is_empty());
    }

    #[test]
    fn test_modified_then_removed_is_removed() {
        let mut registry = PathRegistry::new();
        let w = watch_id(&mut registry, "/w");
        let mut debouncer = Debouncer::new(WINDOW);
        let now = Instant::now();

        debouncer.record(w, raw("/w/a.txt", ChangeKind::CONTENT), now);
        debouncer.record(w, raw("/w/a.txt", ChangeKind::REMOVED), now);

        let flushed = debouncer.take_ready(now + WINDOW);
        assert_eq!(
            kinds(&flushed),
            vec![(EventKind::Removed, PathBuf::from("/w/a.txt"))]
        );
    }

    #[test]
    fn test_removed_then_recreated_is_modified() {
        let mut registry = PathRegistry::new();
        let w = watch_id(&mut registry, "/w");
        let mut debouncer = Debouncer::new(WINDOW);
        let now = Instant::now();

        debouncer.record(w, raw("/w/a.txt", ChangeKind::REMOVED), now);
        debouncer.record(w, raw("/w/a.txt", ChangeKind::CREATED), now);

        let flushed = debouncer.take_ready(now + WINDOW);
        assert_eq!(
            kinds(&flushed),
            vec![(EventKind::Modified, PathBuf::from("/w/a.txt"))]
        );
    }

    #[test]
    fn test_linked_rename_is_paired() {
        let mut registry = PathRegistry::new();
        let w = watch_id(&mut registry, "/w");
        let mut debouncer = Debouncer::new(WINDOW);
        let now = Instant::now();

        // Sources may report each side on its own before the linked report.
        debouncer.record(w, raw("/w/old.txt", ChangeKind::RENAMED_FROM), now);
        debouncer.record(w, raw("/w/new.txt", ChangeKind::RENAMED_TO), now);
        debouncer.record(
            w,
            raw("/w/old.txt", ChangeKind::RENAMED_FROM).linked_to("/w/new.txt"),
            now,
        );
        debouncer.record(
            w,
            raw("/w/new.txt", ChangeKind::RENAMED_TO).linked_to("/w/old.txt"),
            now,
        );

        let flushed = debouncer.take_ready(now + WINDOW);
        assert_eq!(
            kinds(&flushed),
            vec![
                (EventKind::RenamedFrom, PathBuf::from("/w/old.txt")),
                (EventKind::RenamedTo, PathBuf::from("/w/new.txt")),
            ]
        );
    }

    #[test]
    fn test_unlinked_rename_degrades() {
        let mut registry = PathRegistry::new();
        let w = watch_id(&mut registry, "/w");
        let mut debouncer = Debouncer::new(WINDOW);
        let now = Instant::now();

        debouncer.record(w, raw("/w/old.txt", ChangeKind::RENAMED_FROM), now);
        debouncer.record(w, raw("/w/new.txt", ChangeKind::RENAMED_TO), now);

        let flushed = debouncer.take_ready(now + WINDOW);
        assert_eq!(
            kinds(&flushed),
            vec![
                (EventKind::Removed, PathBuf::from("/w/old.txt")),
                (EventKind::Created, PathBuf::from("/w/new.txt")),
            ]
        );
    }

    #[test]
    fn test_rename_pairs_when_new_side_arrives_first() {
        let mut registry = PathRegistry::new();
        let w = watch_id(&mut registry, "/w");
        let mut debouncer = Debouncer::new(WINDOW);
        let now = Instant::now();

        debouncer.record(
            w,
            raw("/w/new.txt", ChangeKind::RENAMED_TO).linked_to("/w/old.txt"),
            now,
        );
        debouncer.record(
            w,
            raw("/w/old.txt", ChangeKind::RENAMED_FROM).linked_to("/w/new.txt"),
            now,
        );

        let flushed = debouncer.take_ready(now + WINDOW);
        assert_eq!(
            kinds(&flushed),
            vec![
                (EventKind::RenamedFrom, PathBuf::from("/w/old.txt")),
                (EventKind::RenamedTo, PathBuf::from("/w/new.txt")),
            ]
        );
        assert!(debouncer.is_empty());
    }

    #[test]
    fn test_rename_counterpart_flushes_early() {
        let mut registry = PathRegistry::new();
        let w = watch_id(&mut registry, "/w");
        let mut debouncer = Debouncer::new(WINDOW);
        let now = Instant::now();

        debouncer.record(
            w,
            raw("/w/old.txt", ChangeKind::RENAMED_FROM).linked_to("/w/new.txt"),
            now,
        );
        debouncer.record(
            w,
            raw("/w/new.txt", ChangeKind::RENAMED_TO).linked_to("/w/old.txt"),
            now,
        );
        // A write to the new name keeps its buffer open past the old one.
        let later = now + Duration::from_millis(60);
        debouncer.record(w, raw("/w/new.txt", ChangeKind::CONTENT), later);

        let flushed = debouncer.take_ready(now + WINDOW);
        assert_eq!(
            kinds(&flushed),
            vec![
                (EventKind::RenamedFrom, PathBuf::from("/w/old.txt")),
                (EventKind::RenamedTo, PathBuf::from("/w/new.txt")),
            ]
        );
        assert!(debouncer.take_ready(later + WINDOW).is_empty());
    }

    #[test]
    fn test_one_sided_link_degrades() {
        let mut registry = PathRegistry::new();
        let w = watch_id(&mut registry, "/w");
        let mut debouncer = Debouncer::new(WINDOW);
        let now = Instant::now();

        debouncer.record(
            w,
            raw("/w/old.txt", ChangeKind::RENAMED_FROM).linked_to("/w/new.txt"),
            now,
        );
        // The new name was removed again before the window closed.
        let later = now + Duration::from_millis(60);
        debouncer.record(w, raw("/w/new.txt", ChangeKind::CREATED), later);
        debouncer.record(w, raw("/w/new.txt", ChangeKind::REMOVED), later);

        let flushed = debouncer.take_ready(now + WINDOW);
        assert_eq!(
            kinds(&flushed),
            vec![(EventKind::Removed, PathBuf::from("/w/old.txt"))]
        );
        assert_eq!(debouncer.pending_count(), 1);
    }

    #[test]
    fn test_flush_order_follows_deadlines() {
        let mut registry = PathRegistry::new();
        let w = watch_id(&mut registry, "/w");
        let mut debouncer = Debouncer::new(WINDOW);
        let now = Instant::now();

        debouncer.record(w, raw("/w/b", ChangeKind::CONTENT), now);
        debouncer.record(w, raw("/w/a", ChangeKind::CONTENT), now + Duration::from_millis(5));
        debouncer.record(w, raw("/w/c", ChangeKind::CREATED), now + Duration::from_millis(10));

        let flushed = debouncer.take_ready(now + Duration::from_millis(200));
        assert_eq!(
            kinds(&flushed),
            vec![
                (EventKind::Modified, PathBuf::from("/w/b")),
                (EventKind::Modified, PathBuf::from("/w/a")),
                (EventKind::Created, PathBuf::from("/w/c")),
            ]
        );
    }

    #[test]
    fn test_same_path_under_two_roots_flushes_twice() {
        let mut registry = PathRegistry::new();
        let outer = watch_id(&mut registry, "/w");
        let inner = watch_id(&mut registry, "/w/sub");
        let mut debouncer = Debouncer::new(WINDOW);
        let now = Instant::now();

        debouncer.record(outer, raw("/w/sub/a", ChangeKind::CONTENT), now);
        debouncer.record(inner, raw("/w/sub/a", ChangeKind::CONTENT), now);

        let flushed = debouncer.take_ready(now + WINDOW);
        assert_eq!(flushed.len(), 2);
        assert!(flushed.iter().any(|f| f.watch == outer));
        assert!(flushed.iter().any(|f| f.watch == inner));
    }

    #[test]
    fn test_discard_watch() {
        let mut registry = PathRegistry::new();
        let a = watch_id(&mut registry, "/a");
        let b = watch_id(&mut registry, "/b");
        let mut debouncer = Debouncer::new(WINDOW);
        let now = Instant::now();

        debouncer.record(a, raw("/a/x", ChangeKind::CONTENT), now);
        debouncer.record(a, raw("/a/y", ChangeKind::CONTENT), now);
        debouncer.record(b, raw("/b/x", ChangeKind::CONTENT), now);

        assert_eq!(debouncer.discard_watch(a), 2);
        let flushed = debouncer.take_ready(now + WINDOW);
        assert_eq!(kinds(&flushed), vec![(EventKind::Modified, PathBuf::from("/b/x"))]);
    }

    #[test]
    fn test_flush_watch_ignores_deadlines() {
        let mut registry = PathRegistry::new();
        let a = watch_id(&mut registry, "/a");
        let b = watch_id(&mut registry, "/b");
        let mut debouncer = Debouncer::new(WINDOW);
        let now = Instant::now();

        debouncer.record(a, raw("/a/x", ChangeKind::REMOVED), now);
        debouncer.record(b, raw("/b/x", ChangeKind::CONTENT), now);

        let flushed = debouncer.flush_watch(a);
        assert_eq!(kinds(&flushed), vec![(EventKind::Removed, PathBuf::from("/a/x"))]);
        assert_eq!(debouncer.pending_count(), 1);
    }

    #[test]
    fn test_empty_notification_is_ignored() {
        let mut registry = PathRegistry::new();
        let w = watch_id(&mut registry, "/w");
        let mut debouncer = Debouncer::new(WINDOW);

        debouncer.record(w, raw("/w/a", ChangeKind::empty()), Instant::now());
        assert!(debouncer.is_empty());
        assert_eq!(debouncer.next_deadline(), None);
    }
}
