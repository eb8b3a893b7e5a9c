//! Buffers for updates that arrived before their predecessors.
//!
//! There is one [`GapQueue`] per ordering class (`seq`, `pts`, `qts`) and one
//! per channel.  Updates are kept sorted by ordering key; whenever a
//! predecessor arrives the queue is drained from the head for as long as the
//! head applies.  A queue that makes no progress for the configured wait
//! window is given up on: the caller clears it and fetches the difference
//! instead, so the buffer never grows without bound under persistent loss.

use std::time::Duration;

use tokio::time::Instant;

use crate::sequence::{ApplyOutcome, SequenceKind, SequenceState};

/// A buffered item with its ordering key.
#[derive(Clone, Debug)]
pub struct Pending<T> {
    /// Counter value after applying the item.
    pub key:   i32,
    /// How far the item advances the counter.
    pub count: i32,
    pub item:  T,
}

/// Result of one [`GapQueue::pop_ready`] step.
#[derive(Debug)]
pub enum Ready<T> {
    /// The head applied; the counter has already advanced.
    Item(T),
    /// The head was already applied and has been dropped.
    Stale,
    /// Empty, or the head still has a gap in front of it.
    Blocked,
}

// ─── GapQueue ─────────────────────────────────────────────────────────────────

pub struct GapQueue<T> {
    kind:          SequenceKind,
    buffer:        Vec<Pending<T>>,
    first_seen_at: Option<Instant>,
    /// Restarted whenever the queue makes progress.
    wait_started:  Option<Instant>,
}

impl<T> GapQueue<T> {
    pub fn new(kind: SequenceKind) -> Self {
        Self { kind, buffer: Vec::new(), first_seen_at: None, wait_started: None }
    }

    pub fn kind(&self) -> SequenceKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// When the oldest still-buffered gap was first observed.
    pub fn first_seen_at(&self) -> Option<Instant> {
        self.first_seen_at
    }

    /// Ordering keys currently buffered, head first.
    pub fn keys(&self) -> impl Iterator<Item = i32> + '_ {
        self.buffer.iter().map(|p| p.key)
    }

    /// Insert in key order.  Returns `false` (and drops `item`) if an entry
    /// with the same key and count is already buffered.
    pub fn push(&mut self, key: i32, count: i32, item: T, now: Instant) -> bool {
        let idx = self.buffer.partition_point(|p| (p.key, p.count) < (key, count));
        if self.buffer.get(idx).is_some_and(|p| p.key == key && p.count == count) {
            return false;
        }
        self.buffer.insert(idx, Pending { key, count, item });
        if self.first_seen_at.is_none() {
            self.first_seen_at = Some(now);
            self.wait_started  = Some(now);
        }
        true
    }

    /// Lowest-keyed buffered item.
    pub fn peek(&self) -> Option<&Pending<T>> {
        self.buffer.first()
    }

    /// Remove the head without touching any counter.
    pub fn pop_front(&mut self) -> Option<Pending<T>> {
        if self.buffer.is_empty() {
            return None;
        }
        let head = self.buffer.remove(0);
        if self.buffer.is_empty() {
            self.reset_timers();
        }
        Some(head)
    }

    /// Pop the head if it is next in sequence, advancing `state`.
    pub fn pop_ready(&mut self, state: &mut SequenceState, now: Instant) -> Ready<T> {
        let Some(head) = self.buffer.first() else {
            return Ready::Blocked;
        };
        match state.apply(self.kind, head.key, head.count) {
            ApplyOutcome::Applied => {
                let pending = self.buffer.remove(0);
                self.on_progress(now);
                Ready::Item(pending.item)
            }
            ApplyOutcome::Stale => {
                self.buffer.remove(0);
                if self.buffer.is_empty() {
                    self.reset_timers();
                }
                Ready::Stale
            }
            ApplyOutcome::Gap { .. } => Ready::Blocked,
        }
    }

    /// `true` if items are buffered and nothing progressed for `window`.
    pub fn is_expired(&self, now: Instant, window: Duration) -> bool {
        match self.wait_started {
            Some(started) if !self.buffer.is_empty() => now.saturating_duration_since(started) >= window,
            _ => false,
        }
    }

    /// Drop everything buffered.  Returns how many items were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.buffer.len();
        self.buffer.clear();
        self.reset_timers();
        n
    }

    fn on_progress(&mut self, now: Instant) {
        if self.buffer.is_empty() {
            self.reset_timers();
        } else {
            self.wait_started = Some(now);
        }
    }

    fn reset_timers(&mut self) {
        self.first_seen_at = None;
        self.wait_started  = None;
    }
}
