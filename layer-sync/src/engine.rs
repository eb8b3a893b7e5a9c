//! The engine state machine.
//!
//! [`SyncEngine`] owns every piece of mutable state: counters, gap queues,
//! dialogs, message pointers and filters.  It performs no I/O.  Each entry
//! point takes an input (an inbound batch, a fetch result, a tick, a user
//! action), mutates state, and returns the [`Job`]s the caller must run;
//! events produced by the step are collected with
//! [`take_events`](SyncEngine::take_events).
//!
//! [`crate::SyncHandle`] runs one engine on a single task and spawns the jobs,
//! but the engine can be driven by hand just as well, which is what the tests
//! do.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::time::Instant;

use crate::applier::{self, ChangeSet, UpdateApplier};
use crate::config::SyncConfig;
use crate::dialogs::{DialogListSnapshot, DialogStore};
use crate::difference::{DifferenceFetcher, FetchState, FetchToken};
use crate::entities::EntityDirectory;
use crate::errors::{InvocationError, Scope, SyncError};
use crate::events::Event;
use crate::filters::{DialogFilter, FilterEngine};
use crate::gap_queue::{GapQueue, Ready};
use crate::message_index::MessageIndex;
use crate::sequence::{ApplyOutcome, SequenceKind, SequenceState};
use crate::storage::Storage;
use crate::transport::{
    ChannelDifference, ChannelDifferenceRequest, DialogsSnapshot, DifferenceRequest, GlobalDifference,
    ResolvedEntities,
};
use crate::types::{CounterSnapshot, DialogId, MessageId, Peer};
use crate::update::{classify, Inbound, OrderingClass, Payload, UpdateBatch, UpdateEnvelope};

// ─── Jobs ─────────────────────────────────────────────────────────────────────

/// Work the engine asks its driver to perform.
#[derive(Clone, Debug, PartialEq)]
pub enum Job {
    GlobalDifference { token: FetchToken, request: DifferenceRequest },
    ChannelDifference { token: FetchToken, request: ChannelDifferenceRequest },
    /// Fetch the dialog list, the pinned list and the server state together.
    Reset { token: FetchToken, dialogs_limit: i32 },
    ResolveEntities { ticket: u64, peers: Vec<Peer> },
    DeleteDialog { dialog_id: DialogId },
}

/// Everything a [`Job::Reset`] fetched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Baseline {
    pub dialogs: DialogsSnapshot,
    pub pinned:  DialogsSnapshot,
    pub state:   CounterSnapshot,
}

/// Result of a [`Job`], fed back through [`SyncEngine::handle_outcome`].
#[derive(Debug)]
pub enum JobOutcome {
    GlobalDifference { token: FetchToken, result: Result<GlobalDifference, InvocationError> },
    ChannelDifference { channel_id: i64, token: FetchToken, result: Result<ChannelDifference, InvocationError> },
    Reset { token: FetchToken, result: Result<Baseline, InvocationError> },
    Entities { ticket: u64, result: Result<ResolvedEntities, InvocationError> },
    DialogDeleted { dialog_id: DialogId, result: Result<(), InvocationError> },
}

pub(crate) fn unix_now() -> i32 {
    chrono::Utc::now().timestamp() as i32
}

// ─── SyncEngine ───────────────────────────────────────────────────────────────

pub struct SyncEngine {
    pub(crate) config:         SyncConfig,
    pub(crate) storage:        Arc<dyn Storage>,
    pub(crate) directory:      Arc<dyn EntityDirectory>,
    pub(crate) sequence:       SequenceState,
    pub(crate) seq_queue:      GapQueue<UpdateBatch>,
    pub(crate) pts_queue:      GapQueue<UpdateEnvelope>,
    pub(crate) qts_queue:      GapQueue<UpdateEnvelope>,
    pub(crate) channel_queues: HashMap<i64, GapQueue<UpdateEnvelope>>,
    pub(crate) fetcher:        DifferenceFetcher,
    pub(crate) dialogs:        DialogStore,
    pub(crate) messages:       MessageIndex,
    pub(crate) filters:        FilterEngine,
    /// Envelopes waiting for an entity load, by ticket.
    parked:                    HashMap<u64, Vec<UpdateEnvelope>>,
    next_ticket:               u64,
    /// Batches received before the first server state.
    pub(crate) waiting:        Vec<UpdateBatch>,
    generation:                u64,
    pub(crate) changes:        ChangeSet,
    pub(crate) jobs:           Vec<Job>,
    events:                    Vec<Event>,
}

impl SyncEngine {
    /// Build an engine, restoring counters and dialogs from `storage`.
    pub fn new(config: SyncConfig, storage: Arc<dyn Storage>, directory: Arc<dyn EntityDirectory>) -> Self {
        let sequence = SequenceState::load(Arc::clone(&storage));
        let mut dialogs = DialogStore::new();
        match storage.load_dialogs() {
            Ok(list) => {
                for d in list {
                    dialogs.upsert(d);
                }
            }
            Err(e) => tracing::warn!("[layer-sync] loading dialogs from {} failed: {e}", storage.name()),
        }
        dialogs.resort(true, unix_now());
        Self {
            config,
            storage,
            directory,
            sequence,
            seq_queue:      GapQueue::new(SequenceKind::Seq),
            pts_queue:      GapQueue::new(SequenceKind::Pts),
            qts_queue:      GapQueue::new(SequenceKind::Qts),
            channel_queues: HashMap::new(),
            fetcher:        DifferenceFetcher::new(),
            dialogs,
            messages:       MessageIndex::new(),
            filters:        FilterEngine::new(),
            parked:         HashMap::new(),
            next_ticket:    0,
            waiting:        Vec::new(),
            generation:     0,
            changes:        ChangeSet::default(),
            jobs:           Vec::new(),
            events:         Vec::new(),
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Bumped by [`reset_session`](Self::reset_session); results dispatched
    /// under an older generation are discarded.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.sequence.counters()
    }

    pub fn channel_pts(&mut self, channel_id: i64) -> Option<i32> {
        self.sequence.channel_pts(channel_id)
    }

    pub fn dialogs(&self) -> &DialogStore {
        &self.dialogs
    }

    pub fn messages(&self) -> &MessageIndex {
        &self.messages
    }

    pub fn filters(&self) -> &FilterEngine {
        &self.filters
    }

    pub fn fetch_state(&self, scope: Scope) -> FetchState {
        self.fetcher.state(scope)
    }

    /// Number of difference fetches dispatched so far, follow-ups included.
    pub fn fetches_dispatched(&self) -> u64 {
        self.fetcher.dispatched()
    }

    /// Ordering keys buffered for a scope.  The global scope reports the pts
    /// queue.
    pub fn queued(&self, scope: Scope) -> Vec<i32> {
        match scope {
            Scope::Global => self.pts_queue.keys().collect(),
            Scope::Channel(id) => self.channel_queues.get(&id).map(|q| q.keys().collect()).unwrap_or_default(),
        }
    }

    pub fn queued_batches(&self) -> usize {
        self.seq_queue.len()
    }

    pub fn snapshot(&self) -> DialogListSnapshot {
        self.dialogs.snapshot(self.filters.lists())
    }

    /// Events produced since the last call.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    // ── Entry points ─────────────────────────────────────────────────────────

    /// First step after construction: catch up from persisted counters, or
    /// load a full baseline if there are none.
    pub fn start(&mut self, now: Instant) -> Vec<Job> {
        if self.sequence.is_initialized() {
            let c = self.sequence.counters();
            tracing::info!("[layer-sync] resuming from pts={}, qts={}, seq={}", c.pts, c.qts, c.seq);
        } else {
            tracing::info!("[layer-sync] no persisted state; loading baseline");
        }
        self.trigger_global(now);
        if !self.dialogs.is_empty() {
            self.events.push(Event::DialogsChanged(Arc::new(self.snapshot())));
        }
        self.finish(now)
    }

    /// Feed something the transport pushed.
    pub fn handle_inbound(&mut self, inbound: Inbound, now: Instant) -> Vec<Job> {
        match inbound {
            Inbound::TooLong => {
                tracing::info!("[layer-sync] updates too long; fetching difference");
                self.trigger_global(now);
            }
            Inbound::Batch(batch) => self.handle_batch(batch, now),
        }
        self.finish(now)
    }

    /// Periodic maintenance: expire stalled gap queues and abandon fetches
    /// whose response never came.
    pub fn tick(&mut self, now: Instant) -> Vec<Job> {
        for scope in self.fetcher.abandon_expired(now, self.config.fetch_timeout) {
            tracing::warn!("[layer-sync] {scope} fetch timed out; scope re-armed");
        }

        let window = self.config.gap_wait;
        let global_stalled = self.seq_queue.is_expired(now, window)
            || self.pts_queue.is_expired(now, window)
            || self.qts_queue.is_expired(now, window);
        if global_stalled {
            let n = self.clear_global_queues();
            tracing::info!(
                "[layer-sync] global gap not filled within {window:?}; dropped {n} update(s), fetching difference"
            );
            self.trigger_global(now);
        }

        let stalled: Vec<i64> = self
            .channel_queues
            .iter()
            .filter(|(_, q)| q.is_expired(now, window))
            .map(|(id, _)| *id)
            .collect();
        for channel_id in stalled {
            if let Some(q) = self.channel_queues.get_mut(&channel_id) {
                let n = q.clear();
                tracing::info!(
                    "[layer-sync] channel {channel_id} gap not filled within {window:?}; dropped {n} update(s)"
                );
            }
            self.trigger_channel(channel_id, None, now);
        }
        self.channel_queues.retain(|_, q| !q.is_empty());

        // Updates that arrived before any state was known re-arm the baseline
        // load if a previous attempt failed.
        if !self.sequence.is_initialized() && !self.waiting.is_empty() {
            self.trigger_global(now);
        }
        self.finish(now)
    }

    /// Feed the result of a job.  Results from an older generation are
    /// dropped.
    pub fn handle_outcome(&mut self, generation: u64, outcome: JobOutcome, now: Instant) -> Vec<Job> {
        if generation != self.generation {
            tracing::debug!(
                "[layer-sync] dropping result from generation {generation} (current {})",
                self.generation
            );
            return Vec::new();
        }
        match outcome {
            JobOutcome::GlobalDifference { token, result } => self.on_global_difference(token, result, now),
            JobOutcome::ChannelDifference { channel_id, token, result } =>
                self.on_channel_difference(channel_id, token, result, now),
            JobOutcome::Reset { token, result } => self.on_reset(token, result, now),
            JobOutcome::Entities { ticket, result } => self.on_entities(ticket, result, now),
            JobOutcome::DialogDeleted { dialog_id, result } => self.on_dialog_deleted(dialog_id, result),
        }
        self.finish(now)
    }

    /// Drop every in-flight request and buffered update.  Counters and
    /// dialogs are kept; call [`start`](Self::start) again to catch up.
    pub fn reset_session(&mut self) {
        self.generation += 1;
        tracing::info!("[layer-sync] session reset; generation {}", self.generation);
        self.fetcher.clear();
        self.clear_global_queues();
        self.channel_queues.clear();
        self.parked.clear();
        self.sequence.clear_channels();
        let pending: Vec<DialogId> = self
            .dialogs
            .iter()
            .map(|d| d.id)
            .filter(|id| self.dialogs.is_pending_deletion(*id))
            .collect();
        for id in pending {
            self.dialogs.cancel_pending_deletion(id);
        }
    }

    // ── User actions ─────────────────────────────────────────────────────────

    pub fn pin_dialog(&mut self, dialog_id: DialogId, pinned: bool, now: Instant) -> Vec<Job> {
        let folder_id = self.dialogs.get(dialog_id).map(|d| d.folder_id).unwrap_or(0);
        self.applier().pin(dialog_id, pinned, folder_id);
        self.finish(now)
    }

    /// Replace a folder's pinned order, top first.
    pub fn reorder_pinned(&mut self, folder_id: i32, order: &[DialogId], now: Instant) -> Vec<Job> {
        self.applier().pinned_order(folder_id, order);
        self.finish(now)
    }

    pub fn move_to_folder(&mut self, dialog_id: DialogId, folder_id: i32, now: Instant) -> Vec<Job> {
        self.applier().move_to_folder(dialog_id, folder_id);
        self.finish(now)
    }

    pub fn set_draft(&mut self, dialog_id: DialogId, date: Option<i32>, now: Instant) -> Vec<Job> {
        self.applier().apply(Payload::DraftMessage { dialog_id, date });
        self.finish(now)
    }

    pub fn mark_unread(&mut self, dialog_id: DialogId, unread: bool, now: Instant) -> Vec<Job> {
        self.applier().apply(Payload::DialogUnreadMark { dialog_id, unread });
        self.finish(now)
    }

    /// Local read of a dialog's history up to `max_id`.
    pub fn read_history(&mut self, dialog_id: DialogId, max_id: MessageId, now: Instant) -> Vec<Job> {
        self.applier().read_inbox(dialog_id, max_id, None);
        self.finish(now)
    }

    /// Hide a dialog and ask the transport to delete it.  The dialog is
    /// removed when the deletion succeeds and shown again if it fails.
    pub fn delete_dialog(&mut self, dialog_id: DialogId, now: Instant) -> Vec<Job> {
        if self.dialogs.mark_pending_deletion(dialog_id) {
            self.changes.dialogs.insert(dialog_id);
            self.changes.membership = true;
            self.jobs.push(Job::DeleteDialog { dialog_id });
        } else {
            tracing::debug!("[layer-sync] delete of unknown or already pending dialog {dialog_id}");
        }
        self.finish(now)
    }

    pub fn set_filter(&mut self, filter: DialogFilter, now: Instant) -> Vec<Job> {
        self.filters.set_filter(filter);
        self.finish(now)
    }

    pub fn remove_filter(&mut self, id: i32, now: Instant) -> Vec<Job> {
        if self.filters.remove_filter(id) {
            self.dialogs.mark_dirty();
        }
        self.finish(now)
    }

    // ── Inbound processing ───────────────────────────────────────────────────

    pub(crate) fn handle_batch(&mut self, batch: UpdateBatch, now: Instant) {
        self.applier().put_entities(&batch.users, &batch.chats);

        if !self.sequence.is_initialized() {
            tracing::debug!("[layer-sync] no state yet; holding batch of {} update(s)", batch.updates.len());
            self.waiting.push(batch);
            self.trigger_global(now);
            return;
        }

        if !batch.is_sequenced() {
            self.apply_batch_updates(batch, now);
            return;
        }

        match self.sequence.check(SequenceKind::Seq, batch.seq_start, 1) {
            ApplyOutcome::Applied => {
                self.sequence.advance(SequenceKind::Seq, batch.seq_start);
                self.apply_sequenced_batch(batch, now);
                self.drain_seq_queue(now);
            }
            ApplyOutcome::Stale => {
                let current = self.sequence.counters().seq;
                self.log_error(SyncError::StaleUpdate { scope: Scope::Global, current, got: batch.seq_start });
            }
            ApplyOutcome::Gap { expected, got } => {
                self.log_error(SyncError::OrderingGap {
                    scope: Scope::Global,
                    expected: expected.unwrap_or_default(),
                    got,
                });
                let seq_start = batch.seq_start;
                self.seq_queue.push(seq_start, 1, batch, now);
            }
        }
    }

    fn apply_sequenced_batch(&mut self, batch: UpdateBatch, now: Instant) {
        let (seq, date) = (batch.seq, batch.date);
        self.apply_batch_updates(batch, now);
        self.sequence.advance(SequenceKind::Seq, seq);
        self.sequence.advance_date(date);
    }

    fn apply_batch_updates(&mut self, batch: UpdateBatch, now: Instant) {
        for env in batch.updates {
            self.process_envelope(env, true, now);
        }
    }

    fn drain_seq_queue(&mut self, now: Instant) {
        loop {
            match self.seq_queue.pop_ready(&mut self.sequence, now) {
                Ready::Item(batch) => self.apply_sequenced_batch(batch, now),
                Ready::Stale => {}
                Ready::Blocked => break,
            }
        }
    }

    /// Route one envelope by its ordering class.  With `check_entities` an
    /// envelope that references unknown peers is parked until they load.
    pub(crate) fn process_envelope(&mut self, env: UpdateEnvelope, check_entities: bool, now: Instant) {
        let c = classify(env);
        let kind = match c.class {
            OrderingClass::Unsequenced => {
                match c.envelope {
                    UpdateEnvelope::StateOnly => {
                        tracing::debug!("[layer-sync] state-only update; fetching difference");
                        self.trigger_global(now);
                    }
                    env => {
                        if check_entities && self.park_if_unresolved(&env) {
                            return;
                        }
                        if let Some(p) = env.into_payload() {
                            self.applier().apply(p);
                        }
                    }
                }
                return;
            }
            OrderingClass::Seq => return,
            OrderingClass::Pts => SequenceKind::Pts,
            OrderingClass::Qts => SequenceKind::Qts,
            OrderingClass::Channel(id) => SequenceKind::Channel(id),
        };

        match self.sequence.check(kind, c.key, c.count) {
            ApplyOutcome::Applied => {
                if check_entities && self.park_if_unresolved(&c.envelope) {
                    return;
                }
                self.sequence.advance(kind, c.key);
                self.apply_envelope(c.envelope);
                self.drain_queue(kind, now);
            }
            ApplyOutcome::Stale => {
                let current = self.sequence.current(kind).unwrap_or_default();
                self.log_error(SyncError::StaleUpdate { scope: scope_of(kind), current, got: c.key });
            }
            ApplyOutcome::Gap { expected: None, got } => {
                // First sighting of a channel: let the server tell us where it is.
                let SequenceKind::Channel(channel_id) = kind else { return };
                tracing::info!("[layer-sync] channel {channel_id} has no known pts (got {got}); fetching difference");
                self.trigger_channel(channel_id, Some(got - c.count), now);
            }
            ApplyOutcome::Gap { expected: Some(expected), got } => {
                self.log_error(SyncError::OrderingGap { scope: scope_of(kind), expected, got });
                if let Some(q) = self.queue_mut(kind) {
                    if !q.push(c.key, c.count, c.envelope, now) {
                        tracing::trace!("[layer-sync] {kind:?} update {got} already buffered");
                    }
                }
            }
        }
    }

    /// Apply whatever became applicable in a queue, resolving entities for
    /// each drained envelope first.
    fn drain_queue(&mut self, kind: SequenceKind, now: Instant) {
        loop {
            let directory = &*self.directory;
            let Some((key, count, unresolved)) = self.queue(kind).and_then(|q| q.peek()).map(|head| {
                let unresolved = head
                    .item
                    .payload()
                    .is_some_and(|p| !applier::unresolved_peers(directory, p).is_empty());
                (head.key, head.count, unresolved)
            }) else {
                return;
            };

            if unresolved && self.sequence.check(kind, key, count) == ApplyOutcome::Applied {
                // The counter must not move before the payload is applied.
                if let Some(pending) = self.queue_mut(kind).and_then(|q| q.pop_front()) {
                    self.park_if_unresolved(&pending.item);
                }
                return;
            }

            let sequence = &mut self.sequence;
            let ready = match kind {
                SequenceKind::Pts => self.pts_queue.pop_ready(sequence, now),
                SequenceKind::Qts => self.qts_queue.pop_ready(sequence, now),
                SequenceKind::Channel(id) => match self.channel_queues.get_mut(&id) {
                    Some(q) => q.pop_ready(sequence, now),
                    None => return,
                },
                SequenceKind::Seq => return,
            };
            match ready {
                Ready::Item(env) => self.apply_envelope(env),
                Ready::Stale => {}
                Ready::Blocked => return,
            }
        }
    }

    pub(crate) fn drain_global(&mut self, now: Instant) {
        self.drain_seq_queue(now);
        self.drain_queue(SequenceKind::Pts, now);
        self.drain_queue(SequenceKind::Qts, now);
    }

    pub(crate) fn drain_channel(&mut self, channel_id: i64, now: Instant) {
        self.drain_queue(SequenceKind::Channel(channel_id), now);
    }

    fn apply_envelope(&mut self, env: UpdateEnvelope) {
        if let Some(p) = env.into_payload() {
            self.applier().apply(p);
        }
    }

    /// Park `env` and request its entities if any referenced peer is unknown.
    fn park_if_unresolved(&mut self, env: &UpdateEnvelope) -> bool {
        let Some(payload) = env.payload() else { return false };
        let peers = applier::unresolved_peers(&*self.directory, payload);
        let Some(first) = peers.first() else { return false };
        self.log_error(SyncError::UnknownScope { dialog_id: first.dialog_id() });
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.parked.insert(ticket, vec![env.clone()]);
        self.jobs.push(Job::ResolveEntities { ticket, peers });
        true
    }

    pub(crate) fn on_entities(&mut self, ticket: u64, result: Result<ResolvedEntities, InvocationError>, now: Instant) {
        let Some(envelopes) = self.parked.remove(&ticket) else { return };
        match result {
            Ok(entities) => {
                self.applier().put_entities(&entities.users, &entities.chats);
                for env in envelopes {
                    // Submit once more without the check so a peer the server
                    // could not resolve does not park the update forever.
                    self.process_envelope(env, false, now);
                }
            }
            Err(e) => {
                tracing::warn!("[layer-sync] entity load failed: {e}; falling back to difference");
                for env in &envelopes {
                    match classify(env.clone()).class {
                        OrderingClass::Channel(id) => self.trigger_channel(id, None, now),
                        _ => self.trigger_global(now),
                    }
                }
            }
        }
    }

    fn on_dialog_deleted(&mut self, dialog_id: DialogId, result: Result<(), InvocationError>) {
        match result {
            Ok(()) => {
                if self.dialogs.remove(dialog_id).is_some() {
                    self.messages.remove_dialog(dialog_id);
                    self.filters.forget(dialog_id);
                    if let Err(e) = self.storage.delete_dialogs(&[dialog_id]) {
                        self.log_error(SyncError::Storage(e));
                    }
                    self.changes.record_new(dialog_id);
                    tracing::info!("[layer-sync] dialog {dialog_id} deleted");
                }
            }
            Err(e) => {
                tracing::warn!("[layer-sync] deleting dialog {dialog_id} failed: {e}; restoring it");
                if self.dialogs.cancel_pending_deletion(dialog_id) {
                    self.changes.record_new(dialog_id);
                }
            }
        }
    }

    // ── Fetch triggers ───────────────────────────────────────────────────────

    /// Catch up the global scope: a difference if counters are known, a full
    /// baseline otherwise.  No-op while a global fetch is in flight.
    pub(crate) fn trigger_global(&mut self, now: Instant) {
        let Some(token) = self.fetcher.begin(Scope::Global, now) else {
            tracing::trace!("[layer-sync] global fetch already in flight");
            return;
        };
        if self.sequence.is_initialized() {
            let request = self.difference_request();
            tracing::info!(
                "[layer-sync] getDifference (pts={}, qts={}, date={})",
                request.pts, request.qts, request.date
            );
            self.jobs.push(Job::GlobalDifference { token, request });
        } else {
            self.jobs.push(Job::Reset { token, dialogs_limit: self.config.dialogs_page_limit });
        }
    }

    /// Catch up one channel.  `hint` is the pts to start from when the channel
    /// has no known pts.
    pub(crate) fn trigger_channel(&mut self, channel_id: i64, hint: Option<i32>, now: Instant) {
        let scope = Scope::Channel(channel_id);
        if self.fetcher.is_fetching(scope) {
            tracing::trace!("[layer-sync] {scope} fetch already in flight");
            return;
        }
        let (pts, force) = match self.sequence.channel_pts(channel_id) {
            Some(pts) => (pts, false),
            None => (hint.unwrap_or(1).max(1), true),
        };
        let Some(token) = self.fetcher.begin(scope, now) else { return };
        tracing::info!("[layer-sync] getChannelDifference (channel={channel_id}, pts={pts}, force={force})");
        self.jobs.push(Job::ChannelDifference {
            token,
            request: ChannelDifferenceRequest {
                channel_id,
                pts,
                limit: self.config.channel_difference_limit,
                force,
            },
        });
    }

    fn difference_request(&self) -> DifferenceRequest {
        let c = self.sequence.counters();
        DifferenceRequest { pts: c.pts, date: c.date, qts: c.qts, pts_total_limit: self.config.difference_pts_limit }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    pub(crate) fn applier(&mut self) -> UpdateApplier<'_> {
        UpdateApplier {
            dialogs:      &mut self.dialogs,
            messages:     &mut self.messages,
            directory:    &*self.directory,
            storage:      &*self.storage,
            changes:      &mut self.changes,
            self_user_id: self.config.self_user_id,
            now:          unix_now(),
        }
    }

    fn queue(&self, kind: SequenceKind) -> Option<&GapQueue<UpdateEnvelope>> {
        match kind {
            SequenceKind::Pts => Some(&self.pts_queue),
            SequenceKind::Qts => Some(&self.qts_queue),
            SequenceKind::Channel(id) => self.channel_queues.get(&id),
            SequenceKind::Seq => None,
        }
    }

    fn queue_mut(&mut self, kind: SequenceKind) -> Option<&mut GapQueue<UpdateEnvelope>> {
        match kind {
            SequenceKind::Pts => Some(&mut self.pts_queue),
            SequenceKind::Qts => Some(&mut self.qts_queue),
            SequenceKind::Channel(id) => Some(
                self.channel_queues
                    .entry(id)
                    .or_insert_with(|| GapQueue::new(SequenceKind::Channel(id))),
            ),
            SequenceKind::Seq => None,
        }
    }

    /// Drop every buffered global update.  Returns how many were dropped.
    pub(crate) fn clear_global_queues(&mut self) -> usize {
        self.seq_queue.clear() + self.pts_queue.clear() + self.qts_queue.clear()
    }

    pub(crate) fn log_error(&self, err: SyncError) {
        if err.is_noise() {
            tracing::debug!("[layer-sync] {err}");
        } else {
            tracing::warn!("[layer-sync] {err}");
        }
    }

    /// Close the step: schedule requested channel fetches, re-sort, refresh
    /// filters, persist and emit events.
    fn finish(&mut self, now: Instant) -> Vec<Job> {
        let changes = std::mem::take(&mut self.changes);
        for (channel_id, pts) in &changes.channel_fetches {
            self.trigger_channel(*channel_id, *pts, now);
        }

        if changes.membership {
            self.filters.invalidate();
        }
        self.resolve_deleted_tops(&changes.dialogs);
        let pruned = self.messages.prune(self.config.pointers_per_dialog);
        if pruned > 0 {
            tracing::trace!("[layer-sync] pruned {pruned} read message pointer(s)");
        }
        let now_unix = unix_now();
        let resorted = self.dialogs.resort(false, now_unix);
        let filters_changed = self.filters.refresh(&self.dialogs, &*self.directory, now_unix);

        if self.config.persist_dialogs && !changes.dialogs.is_empty() {
            let changed: Vec<_> = changes
                .dialogs
                .iter()
                .filter_map(|id| self.dialogs.get(*id).cloned())
                .collect();
            if !changed.is_empty() {
                if let Err(e) = self.storage.persist_dialogs(&changed) {
                    self.log_error(SyncError::Storage(e));
                }
            }
        }

        if resorted || filters_changed || !changes.dialogs.is_empty() {
            self.events.push(Event::DialogsChanged(Arc::new(self.snapshot())));
        }
        for (dialog_id, messages) in changes.received {
            self.events.push(Event::MessagesReceived { dialog_id, messages });
        }
        for dialog_id in changes.read {
            if let Some(d) = self.dialogs.get(dialog_id) {
                self.events.push(Event::ReadStateChanged {
                    dialog_id,
                    read_inbox_max:  d.read_inbox_max,
                    read_outbox_max: d.read_outbox_max,
                    unread_count:    d.unread_count,
                });
            }
        }
        for dialog_id in changes.reactions {
            if let Some(d) = self.dialogs.get(dialog_id) {
                self.events.push(Event::UnreadReactionsChanged { dialog_id, count: d.unread_reactions_count });
            }
        }
        for (dialog_id, user_id) in changes.typing {
            self.events.push(Event::Typing { dialog_id, user_id });
        }
        std::mem::take(&mut self.jobs)
    }
}

impl SyncEngine {
    /// Point dialogs whose top message was deleted at the newest message
    /// still known; dialogs with none left keep the flag until one arrives.
    fn resolve_deleted_tops(&mut self, touched: &std::collections::BTreeSet<DialogId>) {
        for &id in touched {
            let Some(ordering) = self.dialogs.get(id).filter(|d| d.top_message_deleted).map(|d| d.top_ordering())
            else {
                continue;
            };
            let Some(top) = self.messages.latest(id, ordering).copied() else { continue };
            if let Some(d) = self.dialogs.get_mut(id) {
                d.top_message_id      = top.message_id;
                d.last_message_date   = top.date;
                d.top_message_deleted = false;
            }
        }
    }
}

pub(crate) fn scope_of(kind: SequenceKind) -> Scope {
    match kind {
        SequenceKind::Channel(id) => Scope::Channel(id),
        _ => Scope::Global,
    }
}
