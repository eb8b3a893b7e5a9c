//! Notifications for the presentation side.
//!
//! Events are produced only after a mutation batch completes and carry owned
//! data or `Arc` snapshots, never references into engine state.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::dialogs::DialogListSnapshot;
use crate::types::{DialogId, Message, MessageId};

/// What changed after a batch.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// The dialog list or a filter's derived list changed.
    DialogsChanged(Arc<DialogListSnapshot>),
    /// New incoming messages for a dialog, oldest first.  Messages sent by the
    /// local account are never included.
    MessagesReceived { dialog_id: DialogId, messages: Vec<Message> },
    ReadStateChanged {
        dialog_id:       DialogId,
        read_inbox_max:  MessageId,
        read_outbox_max: MessageId,
        unread_count:    i32,
    },
    UnreadReactionsChanged { dialog_id: DialogId, count: i32 },
    Typing { dialog_id: DialogId, user_id: i64 },
}

// ─── EventStream ──────────────────────────────────────────────────────────────

/// Receiving end of the engine's events.
pub struct EventStream {
    pub(crate) rx: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    /// Wait for the next event.  Returns `None` once the sequencer stopped.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_next(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}
