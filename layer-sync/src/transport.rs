//! The request side of the network, as seen by the engine.
//!
//! Wire encoding, sessions and retries live behind [`Transport`]; the engine
//! only issues the handful of catch-up and entity requests below and expects
//! already-decoded responses.  Every future must be `Send` because requests
//! run on spawned tasks, off the sequencer.

use std::future::Future;

use crate::errors::InvocationError;
use crate::types::{Chat, CounterSnapshot, Dialog, DialogId, Message, Peer, User};
use crate::update::UpdateEnvelope;

// ─── Requests ─────────────────────────────────────────────────────────────────

/// Parameters of `updates.getDifference`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DifferenceRequest {
    pub pts:             i32,
    pub date:            i32,
    pub qts:             i32,
    pub pts_total_limit: Option<i32>,
}

/// Parameters of `updates.getChannelDifference`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelDifferenceRequest {
    pub channel_id: i64,
    pub pts:        i32,
    pub limit:      i32,
    /// Set when the channel was never seen before; the server should return
    /// at least the latest state even if `pts` is unknown to it.
    pub force:      bool,
}

// ─── Responses ────────────────────────────────────────────────────────────────

/// Response to a global difference request.
#[derive(Clone, Debug, PartialEq)]
pub enum GlobalDifference {
    /// Nothing happened; only `date` and `seq` moved.
    Empty { date: i32, seq: i32 },
    /// Part of the difference; apply it and fetch again from `intermediate_state`.
    Slice {
        new_messages:       Vec<Message>,
        other_updates:      Vec<UpdateEnvelope>,
        users:              Vec<User>,
        chats:              Vec<Chat>,
        intermediate_state: CounterSnapshot,
    },
    /// The complete difference.
    Full {
        new_messages:  Vec<Message>,
        other_updates: Vec<UpdateEnvelope>,
        users:         Vec<User>,
        chats:         Vec<Chat>,
        state:         CounterSnapshot,
    },
    /// Too much happened; drop local state and reload dialogs.
    TooLong { pts: i32 },
}

/// Response to a channel difference request.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelDifference {
    /// New channel pts plus the deltas since the requested pts.
    Delta {
        pts:           i32,
        new_messages:  Vec<Message>,
        other_updates: Vec<UpdateEnvelope>,
        users:         Vec<User>,
        chats:         Vec<Chat>,
        /// `false` if more deltas are pending; fetch again.
        is_final:      bool,
    },
    /// The channel moved too far; rebuild it from this snapshot.  The new
    /// channel pts is `dialog.pts`.
    TooLong {
        dialog:   Dialog,
        messages: Vec<Message>,
        users:    Vec<User>,
        chats:    Vec<Chat>,
    },
}

/// A page of dialogs with the top messages and entities they reference.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DialogsSnapshot {
    pub dialogs:  Vec<Dialog>,
    pub messages: Vec<Message>,
    pub users:    Vec<User>,
    pub chats:    Vec<Chat>,
}

/// Entities returned by a one-off entity load.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedEntities {
    pub users: Vec<User>,
    pub chats: Vec<Chat>,
}

// ─── Trait ────────────────────────────────────────────────────────────────────

/// Requests the engine issues.  Implementations own encoding, retries of
/// their own, flood handling and session management.
pub trait Transport: Send + Sync + 'static {
    /// Current server counters (`updates.getState`).
    fn get_state(&self) -> impl Future<Output = Result<CounterSnapshot, InvocationError>> + Send;

    fn get_difference(
        &self,
        req: DifferenceRequest,
    ) -> impl Future<Output = Result<GlobalDifference, InvocationError>> + Send;

    fn get_channel_difference(
        &self,
        req: ChannelDifferenceRequest,
    ) -> impl Future<Output = Result<ChannelDifference, InvocationError>> + Send;

    /// First page of the dialog list.
    fn get_dialogs(&self, limit: i32) -> impl Future<Output = Result<DialogsSnapshot, InvocationError>> + Send;

    /// Pinned dialogs of a folder, highest rank first.
    fn get_pinned_dialogs(
        &self,
        folder_id: i32,
    ) -> impl Future<Output = Result<DialogsSnapshot, InvocationError>> + Send;

    /// Load entities for peers the directory does not know.
    fn resolve_entities(
        &self,
        peers: Vec<Peer>,
    ) -> impl Future<Output = Result<ResolvedEntities, InvocationError>> + Send;

    /// Delete a dialog's history server-side.
    fn delete_dialog(&self, dialog_id: DialogId) -> impl Future<Output = Result<(), InvocationError>> + Send;
}
