//! Catch-up fetches (`getDifference` / `getChannelDifference`) and the
//! application of their responses.
//!
//! [`DifferenceFetcher`] is the in-flight bookkeeping: at most one fetch per
//! scope, each identified by a [`FetchToken`] so a response that arrives after
//! its fetch was abandoned is recognised and dropped.  Failures are never
//! retried here; the scope simply goes back to idle and the next tick or
//! update triggers it again.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::engine::{Baseline, Job, SyncEngine};
use crate::errors::{InvocationError, Scope, SyncError};
use crate::sequence::SequenceKind;
use crate::transport::{ChannelDifference, GlobalDifference};
use crate::types::{Chat, DialogId, Message, User};
use crate::update::{Payload, UpdateEnvelope};

/// Identifies one dispatched fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FetchToken(u64);

/// What a scope is doing right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    FetchingGlobal,
    FetchingChannel(i64),
}

#[derive(Clone, Copy, Debug)]
struct InFlight {
    token:   FetchToken,
    started: Instant,
}

// ─── DifferenceFetcher ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct DifferenceFetcher {
    in_flight:  HashMap<Scope, InFlight>,
    next_token: u64,
    dispatched: u64,
}

impl DifferenceFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `scope` as fetching.  Returns `None` if a fetch is already in
    /// flight for it.
    pub fn begin(&mut self, scope: Scope, now: Instant) -> Option<FetchToken> {
        if self.in_flight.contains_key(&scope) {
            return None;
        }
        let token = FetchToken(self.next_token);
        self.next_token += 1;
        self.dispatched += 1;
        self.in_flight.insert(scope, InFlight { token, started: now });
        Some(token)
    }

    /// Close the fetch identified by `token`.  Returns `false` if the scope
    /// has no such fetch in flight (abandoned, or superseded).
    pub fn finish(&mut self, scope: Scope, token: FetchToken) -> bool {
        match self.in_flight.get(&scope) {
            Some(f) if f.token == token => {
                self.in_flight.remove(&scope);
                true
            }
            _ => false,
        }
    }

    pub fn is_fetching(&self, scope: Scope) -> bool {
        self.in_flight.contains_key(&scope)
    }

    pub fn state(&self, scope: Scope) -> FetchState {
        match scope {
            _ if !self.is_fetching(scope) => FetchState::Idle,
            Scope::Global => FetchState::FetchingGlobal,
            Scope::Channel(id) => FetchState::FetchingChannel(id),
        }
    }

    /// Forget fetches started more than `timeout` ago and return their scopes.
    pub fn abandon_expired(&mut self, now: Instant, timeout: Duration) -> Vec<Scope> {
        let expired: Vec<Scope> = self
            .in_flight
            .iter()
            .filter(|(_, f)| now.saturating_duration_since(f.started) >= timeout)
            .map(|(s, _)| *s)
            .collect();
        for scope in &expired {
            self.in_flight.remove(scope);
        }
        expired
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
    }

    /// Total fetches started since construction.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }
}

// ─── Response application ─────────────────────────────────────────────────────

impl SyncEngine {
    pub(crate) fn on_global_difference(
        &mut self,
        token:  FetchToken,
        result: Result<GlobalDifference, InvocationError>,
        now:    Instant,
    ) {
        if !self.fetcher.finish(Scope::Global, token) {
            tracing::debug!("[layer-sync] dropping superseded getDifference response");
            return;
        }
        let diff = match result {
            Ok(d) => d,
            Err(source) => {
                // The server no longer accepts our state; only a full reload helps.
                let state_invalid = source.is("PERSISTENT_TIMESTAMP_*") && !source.is("*_OUTDATED");
                self.log_error(SyncError::FetchFailure { scope: Scope::Global, source });
                if state_invalid {
                    tracing::warn!("[layer-sync] server rejected local state; reloading dialogs");
                    if let Some(token) = self.fetcher.begin(Scope::Global, now) {
                        self.jobs.push(Job::Reset { token, dialogs_limit: self.config.dialogs_page_limit });
                    }
                }
                return;
            }
        };

        match diff {
            GlobalDifference::Empty { date, seq } => {
                tracing::debug!("[layer-sync] getDifference: empty (seq={seq})");
                let mut c = self.sequence.counters();
                c.date = date;
                c.seq  = seq;
                self.sequence.fast_forward(c);
                self.settle_global_queues(now);
            }
            GlobalDifference::Slice { new_messages, other_updates, users, chats, intermediate_state } => {
                tracing::info!(
                    "[layer-sync] getDifference slice: {} messages, {} updates",
                    new_messages.len(), other_updates.len()
                );
                self.apply_difference(new_messages, other_updates, &users, &chats, true, now);
                self.sequence.fast_forward(intermediate_state);
                self.trigger_global(now);
            }
            GlobalDifference::Full { new_messages, other_updates, users, chats, state } => {
                tracing::info!(
                    "[layer-sync] getDifference: {} messages, {} updates",
                    new_messages.len(), other_updates.len()
                );
                self.apply_difference(new_messages, other_updates, &users, &chats, true, now);
                self.sequence.fast_forward(state);
                self.settle_global_queues(now);
            }
            GlobalDifference::TooLong { pts } => {
                tracing::warn!("[layer-sync] getDifference: too long (pts={pts}); reloading dialogs");
                self.log_error(SyncError::TooLong { scope: Scope::Global });
                if let Some(token) = self.fetcher.begin(Scope::Global, now) {
                    self.jobs.push(Job::Reset { token, dialogs_limit: self.config.dialogs_page_limit });
                }
            }
        }
    }

    pub(crate) fn on_channel_difference(
        &mut self,
        channel_id: i64,
        token:      FetchToken,
        result:     Result<ChannelDifference, InvocationError>,
        now:        Instant,
    ) {
        let scope = Scope::Channel(channel_id);
        if !self.fetcher.finish(scope, token) {
            tracing::debug!("[layer-sync] dropping superseded getChannelDifference response for {channel_id}");
            return;
        }
        let diff = match result {
            Ok(d) => d,
            Err(source) => {
                let gone = source.is("CHANNEL_PRIVATE") || source.is("CHANNEL_INVALID");
                self.log_error(SyncError::FetchFailure { scope, source });
                if gone {
                    // Left, banned or deleted: nothing buffered for it will ever apply.
                    let dropped = self.channel_queues.remove(&channel_id).map_or(0, |mut q| q.clear());
                    tracing::info!("[layer-sync] channel {channel_id} unavailable; dropped {dropped} buffered update(s)");
                }
                return;
            }
        };

        match diff {
            ChannelDifference::Delta { pts, new_messages, other_updates, users, chats, is_final } => {
                tracing::debug!(
                    "[layer-sync] channel {channel_id} difference: pts={pts}, {} messages, final={is_final}",
                    new_messages.len()
                );
                // The delta's pts covers every update in it, so none of them
                // is sequenced again.
                self.apply_difference(new_messages, other_updates, &users, &chats, false, now);
                let kind = SequenceKind::Channel(channel_id);
                match self.sequence.channel_pts(channel_id) {
                    Some(_) => self.sequence.advance(kind, pts),
                    None => self.sequence.set_channel(channel_id, pts),
                }
                if is_final {
                    self.settle_channel_queue(channel_id, now);
                } else {
                    self.trigger_channel(channel_id, None, now);
                }
            }
            ChannelDifference::TooLong { dialog, messages, users, chats } => {
                self.log_error(SyncError::TooLong { scope });
                let pts = dialog.pts;
                let dropped = self.messages.remove_dialog(dialog.id);
                tracing::info!(
                    "[layer-sync] rebuilding channel {channel_id} at pts={pts}; dropped {dropped} message pointer(s)"
                );
                let mut applier = self.applier();
                applier.put_entities(&users, &chats);
                applier.replace_dialog(dialog, &messages);
                self.sequence.set_channel(channel_id, pts);
                if let Some(mut q) = self.channel_queues.remove(&channel_id) {
                    q.clear();
                }
            }
        }
    }

    pub(crate) fn on_reset(&mut self, token: FetchToken, result: Result<Baseline, InvocationError>, now: Instant) {
        if !self.fetcher.finish(Scope::Global, token) {
            tracing::debug!("[layer-sync] dropping superseded baseline");
            return;
        }
        let Baseline { dialogs, pinned, state } = match result {
            Ok(b) => b,
            Err(source) => {
                self.log_error(SyncError::FetchFailure { scope: Scope::Global, source });
                return;
            }
        };
        tracing::info!(
            "[layer-sync] baseline: {} dialogs, {} pinned, pts={}, qts={}, seq={}",
            dialogs.dialogs.len(), pinned.dialogs.len(), state.pts, state.qts, state.seq
        );

        let pinned_order: Vec<DialogId> = pinned.dialogs.iter().map(|d| d.id).collect();
        let mut channel_pts = Vec::new();
        {
            let mut applier = self.applier();
            applier.put_entities(&dialogs.users, &dialogs.chats);
            applier.put_entities(&pinned.users, &pinned.chats);
            // The pinned list is authoritative for the dialogs it carries.
            for d in dialogs.dialogs.into_iter().filter(|d| !pinned_order.contains(&d.id)) {
                if d.pts > 0 {
                    channel_pts.push((-d.id.0, d.pts));
                }
                applier.replace_dialog(d, &dialogs.messages);
            }
            for d in pinned.dialogs {
                if d.pts > 0 {
                    channel_pts.push((-d.id.0, d.pts));
                }
                applier.replace_dialog(d, &pinned.messages);
            }
            applier.pinned_order(0, &pinned_order);
        }

        self.sequence.replace(state);
        self.sequence.clear_channels();
        for (channel_id, pts) in channel_pts {
            self.sequence.set_channel(channel_id, pts);
        }
        let dropped = self.clear_global_queues()
            + self.channel_queues.drain().map(|(_, mut q)| q.clear()).sum::<usize>();
        if dropped > 0 {
            tracing::info!("[layer-sync] baseline superseded {dropped} buffered update(s)");
        }

        for batch in std::mem::take(&mut self.waiting) {
            self.handle_batch(batch, now);
        }
    }

    /// Apply the content of a difference.  Counters are left to the caller:
    /// the response's state covers every update in it.  With
    /// `sequence_channels`, channel-scoped updates (which a global difference
    /// may carry for channels it does not cover) go through their channel's
    /// own sequencing instead.
    fn apply_difference(
        &mut self,
        new_messages:      Vec<Message>,
        other_updates:     Vec<UpdateEnvelope>,
        users:             &[User],
        chats:             &[Chat],
        sequence_channels: bool,
        now:               Instant,
    ) {
        self.applier().put_entities(users, chats);
        for m in new_messages {
            self.applier().apply(Payload::NewMessage(m));
        }
        for env in other_updates {
            match env {
                UpdateEnvelope::ChannelScoped { .. } if sequence_channels => self.process_envelope(env, false, now),
                UpdateEnvelope::StateOnly => {}
                other => {
                    if let Some(p) = other.into_payload() {
                        self.applier().apply(p);
                    }
                }
            }
        }
    }

    /// After a complete global difference: apply what the new counters made
    /// applicable, then drop whatever is still waiting.
    fn settle_global_queues(&mut self, now: Instant) {
        self.drain_global(now);
        let dropped = self.clear_global_queues();
        if dropped > 0 {
            tracing::debug!("[layer-sync] difference superseded {dropped} buffered update(s)");
        }
    }

    fn settle_channel_queue(&mut self, channel_id: i64, now: Instant) {
        self.drain_channel(channel_id, now);
        if let Some(mut q) = self.channel_queues.remove(&channel_id) {
            let dropped = q.clear();
            if dropped > 0 {
                tracing::debug!("[layer-sync] channel {channel_id} difference superseded {dropped} update(s)");
            }
        }
    }
}
