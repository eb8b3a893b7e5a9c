//! Update sequence counters and gap detection.
//!
//! The server assigns a monotonically-increasing sequence number called
//! **pts** to every message-affecting event (one account-wide counter plus one
//! per channel), **qts** to secret-chat events and **seq** to update
//! containers.  If the client misses updates (due to a disconnect, lag, or
//! packet loss) a counter jumps forward.  [`SequenceState`] tracks every
//! counter, tells the caller whether an incoming value applies, is a gap, or
//! was already seen, and writes each advance through to [`Storage`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::storage::Storage;
use crate::types::CounterSnapshot;

// ─── SequenceKind ─────────────────────────────────────────────────────────────

/// Which counter an [`SequenceState::apply`] call refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SequenceKind {
    /// Combined updates sequence.
    Seq,
    /// Account-wide message counter.
    Pts,
    /// Secret-chat counter.
    Qts,
    /// Per-channel message counter.
    Channel(i64),
}

/// Result of checking an incoming counter value against local state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// In order; the counter advanced.
    Applied,
    /// A predecessor is missing.  `expected` is `None` when the counter has
    /// never been initialised (a channel seen for the first time).
    Gap { expected: Option<i32>, got: i32 },
    /// Already applied; discard.
    Stale,
}

// ─── SequenceState ────────────────────────────────────────────────────────────

/// Tracks update sequence numbers so we can detect and fill update gaps.
pub struct SequenceState {
    counters: CounterSnapshot,
    channels: HashMap<i64, i32>,
    storage:  Arc<dyn Storage>,
}

impl SequenceState {
    /// Empty state, nothing loaded yet.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { counters: CounterSnapshot::default(), channels: HashMap::new(), storage }
    }

    /// Restore the global counters persisted by a previous session.
    pub fn load(storage: Arc<dyn Storage>) -> Self {
        let counters = match storage.load_counters() {
            Ok(Some(c)) => c,
            Ok(None) => CounterSnapshot::default(),
            Err(e) => {
                tracing::warn!("[layer-sync] loading counters from {} failed: {e}", storage.name());
                CounterSnapshot::default()
            }
        };
        Self { counters, channels: HashMap::new(), storage }
    }

    /// Current global counters.
    pub fn counters(&self) -> CounterSnapshot {
        self.counters
    }

    /// `false` until the first server state has been received.
    pub fn is_initialized(&self) -> bool {
        self.counters.pts != 0
    }

    /// Current value of a counter, hydrating channel counters from storage on
    /// first reference.
    pub fn current(&mut self, kind: SequenceKind) -> Option<i32> {
        match kind {
            SequenceKind::Seq => Some(self.counters.seq),
            SequenceKind::Pts => Some(self.counters.pts),
            SequenceKind::Qts => Some(self.counters.qts),
            SequenceKind::Channel(id) => self.channel_pts(id),
        }
    }

    /// Known pts of a channel, loading it from storage the first time.
    pub fn channel_pts(&mut self, channel_id: i64) -> Option<i32> {
        if let Some(&pts) = self.channels.get(&channel_id) {
            return Some(pts);
        }
        match self.storage.load_channel_pts(channel_id) {
            Ok(Some(pts)) => {
                self.channels.insert(channel_id, pts);
                Some(pts)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("[layer-sync] loading pts of channel {channel_id} failed: {e}");
                None
            }
        }
    }

    /// Classify `new_value` without changing anything.
    ///
    /// `count` is ignored for [`SequenceKind::Seq`], where the expected value is
    /// always `current + 1`.
    pub fn check(&mut self, kind: SequenceKind, new_value: i32, count: i32) -> ApplyOutcome {
        let Some(current) = self.current(kind) else {
            return ApplyOutcome::Gap { expected: None, got: new_value };
        };
        let expected = match kind {
            SequenceKind::Seq => current + 1,
            _ => current + count,
        };
        if new_value == expected {
            ApplyOutcome::Applied
        } else if new_value <= current {
            ApplyOutcome::Stale
        } else {
            ApplyOutcome::Gap { expected: Some(expected), got: new_value }
        }
    }

    /// Check `new_value` and advance the counter if it applies.
    pub fn apply(&mut self, kind: SequenceKind, new_value: i32, count: i32) -> ApplyOutcome {
        let outcome = self.check(kind, new_value, count);
        if outcome == ApplyOutcome::Applied {
            self.advance(kind, new_value);
        }
        outcome
    }

    /// Move a counter forward (never backwards) and persist it.
    pub fn advance(&mut self, kind: SequenceKind, value: i32) {
        match kind {
            SequenceKind::Seq => {
                if value <= self.counters.seq { return; }
                self.counters.seq = value;
            }
            SequenceKind::Pts => {
                if value <= self.counters.pts { return; }
                self.counters.pts = value;
            }
            SequenceKind::Qts => {
                if value <= self.counters.qts { return; }
                self.counters.qts = value;
            }
            SequenceKind::Channel(id) => {
                let slot = self.channels.entry(id).or_insert(0);
                if value <= *slot { return; }
                *slot = value;
                self.persist_channel(id, value);
                return;
            }
        }
        self.persist_counters();
    }

    /// Record the date of the latest applied container.
    pub fn advance_date(&mut self, date: i32) {
        if date > self.counters.date {
            self.counters.date = date;
            self.persist_counters();
        }
    }

    /// Atomically replace all global counters (after a difference or reset).
    pub fn replace(&mut self, snapshot: CounterSnapshot) {
        tracing::debug!(
            "[layer-sync] counters replaced: pts={}, qts={}, seq={}, date={}",
            snapshot.pts, snapshot.qts, snapshot.seq, snapshot.date
        );
        self.counters = snapshot;
        self.persist_counters();
    }

    /// Move every global counter forward to `snapshot` where it is ahead.
    /// Live updates applied while a difference was in flight may already be
    /// past the difference's state; those counters stay where they are.
    pub fn fast_forward(&mut self, snapshot: CounterSnapshot) {
        let merged = CounterSnapshot {
            pts:  self.counters.pts.max(snapshot.pts),
            qts:  self.counters.qts.max(snapshot.qts),
            date: self.counters.date.max(snapshot.date),
            seq:  self.counters.seq.max(snapshot.seq),
        };
        if merged != self.counters {
            self.replace(merged);
        }
    }

    /// Overwrite a channel's pts, even backwards (per-channel rebuild).
    pub fn set_channel(&mut self, channel_id: i64, pts: i32) {
        self.channels.insert(channel_id, pts);
        self.persist_channel(channel_id, pts);
    }

    /// Drop cached channel counters (session teardown).
    pub fn clear_channels(&mut self) {
        self.channels.clear();
    }

    fn persist_counters(&self) {
        if let Err(e) = self.storage.persist_counters(self.counters) {
            tracing::warn!("[layer-sync] persisting counters to {} failed: {e}", self.storage.name());
        }
    }

    fn persist_channel(&self, channel_id: i64, pts: i32) {
        if let Err(e) = self.storage.persist_channel_pts(channel_id, pts) {
            tracing::warn!("[layer-sync] persisting pts of channel {channel_id} failed: {e}");
        }
    }
}
