//! Turns validated, in-order payloads into dialog and message-index mutations.
//!
//! The applier never looks at counters: by the time a payload gets here its
//! envelope has been sequenced.  It records what it touched in a
//! [`ChangeSet`], which the engine turns into one re-sort, one filter refresh
//! and one round of events per batch.

use std::collections::{BTreeMap, BTreeSet};

use crate::dialogs::DialogStore;
use crate::entities::{self, EntityDirectory};
use crate::filters;
use crate::message_index::MessageIndex;
use crate::storage::Storage;
use crate::types::{Chat, Dialog, DialogId, Message, MessageId, MessagePointer, Peer, TopOrdering, User};
use crate::update::Payload;

// ─── ChangeSet ────────────────────────────────────────────────────────────────

/// Everything a batch of payloads touched.
#[derive(Debug, Default)]
pub struct ChangeSet {
    /// Dialogs whose stored value changed.
    pub dialogs:         BTreeSet<DialogId>,
    /// Incoming messages to fan out, per dialog, in apply order.
    pub received:        BTreeMap<DialogId, Vec<Message>>,
    /// Dialogs whose read markers or unread count changed.
    pub read:            BTreeSet<DialogId>,
    pub reactions:       BTreeSet<DialogId>,
    pub typing:          Vec<(DialogId, i64)>,
    /// Some filter may need a full recompute.
    pub membership:      bool,
    /// Channels the server told us to catch up on, with the pts it hinted.
    pub channel_fetches: Vec<(i64, Option<i32>)>,
}

impl ChangeSet {
    /// Record the difference between two values of the same dialog.
    pub fn record(&mut self, before: &Dialog, after: &Dialog, now: i32) {
        if before == after {
            return;
        }
        self.dialogs.insert(after.id);
        if before.read_inbox_max != after.read_inbox_max
            || before.read_outbox_max != after.read_outbox_max
            || before.unread_count != after.unread_count
        {
            self.read.insert(after.id);
        }
        if before.unread_reactions_count != after.unread_reactions_count {
            self.reactions.insert(after.id);
        }
        if filters::membership_relevant(before, after, now) {
            self.membership = true;
        }
    }

    /// Record a dialog that did not exist before.
    pub fn record_new(&mut self, id: DialogId) {
        self.dialogs.insert(id);
        self.membership = true;
    }
}

/// Referenced peers missing from the directory.
pub fn unresolved_peers(dir: &dyn EntityDirectory, payload: &Payload) -> Vec<Peer> {
    payload
        .referenced_peers()
        .into_iter()
        .filter(|p| !entities::is_resolved(dir, *p))
        .collect()
}

// ─── UpdateApplier ────────────────────────────────────────────────────────────

/// Borrowed view over the mutable state one payload may touch.
pub struct UpdateApplier<'a> {
    pub dialogs:      &'a mut DialogStore,
    pub messages:     &'a mut MessageIndex,
    pub directory:    &'a dyn EntityDirectory,
    pub storage:      &'a dyn Storage,
    pub changes:      &'a mut ChangeSet,
    pub self_user_id: i64,
    /// Unix time used for mute evaluation.
    pub now:          i32,
}

impl UpdateApplier<'_> {
    /// Store entities shipped alongside a batch or difference.
    pub fn put_entities(&mut self, users: &[User], chats: &[Chat]) {
        for u in users {
            self.directory.put_user(u.clone());
        }
        for c in chats {
            self.directory.put_chat(c.clone());
        }
    }

    pub fn apply(&mut self, payload: Payload) {
        match payload {
            Payload::NewMessage(m) => self.new_message(m),
            Payload::EditMessage(m) => self.edit_message(m),
            Payload::DeleteMessages { channel_id, ids } => self.delete_messages(channel_id, &ids),
            Payload::ReadInbox { peer, max_id, still_unread_count } =>
                self.read_inbox(peer.dialog_id(), max_id, still_unread_count),
            Payload::ReadOutbox { peer, max_id } => self.read_outbox(peer.dialog_id(), max_id),
            Payload::Typing { peer, user_id } => self.changes.typing.push((peer.dialog_id(), user_id)),
            Payload::ChatMeta(chat) => self.chat_meta(chat),
            Payload::UserMeta(user) => {
                self.directory.put_user(user);
                self.changes.membership = true;
            }
            Payload::MessageIdAssigned { random_id, id } => self.message_id_assigned(random_id, id),
            Payload::DialogPinned { dialog_id, pinned, folder_id } =>
                self.pin(dialog_id, pinned, folder_id),
            Payload::PinnedDialogs { folder_id, order: Some(order) } => self.pinned_order(folder_id, &order),
            Payload::PinnedDialogs { folder_id, order: None } => {
                tracing::debug!("[layer-sync] pinned order of folder {folder_id} not sent; keeping local order");
            }
            Payload::FolderPeers(moves) => {
                for (id, folder_id) in moves {
                    self.move_to_folder(id, folder_id);
                }
            }
            Payload::NotifySettings { dialog_id, settings } => {
                self.touch(dialog_id, |d| d.notify_settings = settings);
            }
            Payload::DraftMessage { dialog_id, date } => {
                self.touch(dialog_id, |d| d.draft_date = date);
            }
            Payload::DialogUnreadMark { dialog_id, unread } => {
                self.touch(dialog_id, |d| d.unread_mark = unread);
            }
            Payload::MessageReactions { dialog_id, message_id, unread_reactions } => {
                tracing::trace!("[layer-sync] reactions on {dialog_id}/{message_id}");
                self.touch(dialog_id, |d| d.unread_reactions_count = unread_reactions.max(0));
            }
            Payload::ReadMentions { dialog_id } => {
                self.touch(dialog_id, |d| d.unread_mentions_count = 0);
            }
            Payload::ChannelTooLong { channel_id, pts } => self.changes.channel_fetches.push((channel_id, pts)),
            Payload::Empty => {}
        }
    }

    // ── Messages ─────────────────────────────────────────────────────────────

    /// Whether a message was sent by the logged-in account.
    pub fn is_self_origin(&self, message: &Message) -> bool {
        message.out || (self.self_user_id != 0 && message.from_id == Some(self.self_user_id))
    }

    fn new_message(&mut self, message: Message) {
        let Some(dialog_id) = message.dialog_id() else {
            tracing::debug!("[layer-sync] message {} without peer ignored", message.id);
            return;
        };
        let own = self.is_self_origin(&message);
        self.ensure_dialog(dialog_id);

        let Some(dialog) = self.dialogs.get(dialog_id) else { return };
        let unread = !own && message.id > dialog.read_inbox_max;
        let ptr = MessagePointer {
            dialog_id,
            message_id: message.id,
            random_id:  message.random_id,
            date:       message.date,
            out:        own,
            unread,
        };
        let account_wide = !matches!(message.peer, Some(Peer::Channel(_)));
        if !self.messages.insert(ptr, account_wide) {
            tracing::trace!("[layer-sync] duplicate message {dialog_id}/{} ignored", message.id);
            return;
        }

        let id = message.id;
        let date = message.date;
        let mentioned = message.mentioned;
        self.touch(dialog_id, |d| {
            let newer = match d.top_ordering() {
                TopOrdering::ById   => id > d.top_message_id,
                TopOrdering::ByDate => date >= d.last_message_date,
            };
            if newer || d.top_message_deleted || d.top_message_id == 0 {
                d.top_message_id      = id;
                d.last_message_date   = date;
                d.top_message_deleted = false;
            }
            if unread {
                d.unread_count += 1;
                if mentioned {
                    d.unread_mentions_count += 1;
                }
            }
        });

        if !own {
            self.changes.received.entry(dialog_id).or_default().push(message);
        }
    }

    fn edit_message(&mut self, message: Message) {
        let Some(dialog_id) = message.dialog_id() else { return };
        if self.messages.get(dialog_id, message.id).is_none() {
            tracing::trace!("[layer-sync] edit of unknown message {dialog_id}/{} ignored", message.id);
            return;
        }
        if self.dialogs.get(dialog_id).is_some_and(|d| d.top_message_id == message.id) {
            // The row preview shows the top message's text.
            self.changes.dialogs.insert(dialog_id);
        }
    }

    fn delete_messages(&mut self, channel_id: Option<i64>, ids: &[MessageId]) {
        for &id in ids {
            let removed = match channel_id {
                Some(c) => self.messages.remove(DialogId::channel(c), id),
                None    => self.messages.remove_global(id),
            };
            let dialog_id = match (removed, channel_id) {
                (Some(ptr), _) => ptr.dialog_id,
                (None, Some(c)) => DialogId::channel(c),
                (None, None) => continue,
            };
            self.touch(dialog_id, |d| {
                if removed.is_some_and(|p| p.unread && !p.out) {
                    d.unread_count = (d.unread_count - 1).max(0);
                }
                if d.top_message_id == id {
                    d.top_message_deleted = true;
                }
            });
        }
    }

    fn message_id_assigned(&mut self, random_id: i64, id: MessageId) {
        let Some(old) = self.messages.get_by_random_id(random_id).copied() else {
            tracing::trace!("[layer-sync] no pending message with random id {random_id}");
            return;
        };
        if self.messages.rebind(random_id, id).is_none() {
            return;
        }
        self.touch(old.dialog_id, |d| {
            if d.top_message_id == old.message_id {
                d.top_message_id = id;
            }
        });
    }

    // ── Read state ───────────────────────────────────────────────────────────

    /// Advance the inbox read marker.  Markers never move backwards.
    pub fn read_inbox(&mut self, dialog_id: DialogId, max_id: MessageId, still_unread: Option<i32>) {
        let Some(current) = self.dialogs.get(dialog_id).map(|d| d.read_inbox_max) else {
            tracing::debug!("[layer-sync] read inbox for unknown dialog {dialog_id}");
            return;
        };
        if max_id <= current {
            return;
        }
        let delta = self.messages.mark_read(dialog_id, max_id);
        self.touch(dialog_id, |d| {
            d.read_inbox_max = max_id;
            d.unread_count = if max_id >= d.top_message_id {
                0
            } else if let Some(n) = still_unread {
                n.max(0)
            } else {
                (d.unread_count - delta).max(0)
            };
        });
    }

    pub fn read_outbox(&mut self, dialog_id: DialogId, max_id: MessageId) {
        self.touch(dialog_id, |d| d.read_outbox_max = d.read_outbox_max.max(max_id));
    }

    // ── Dialog state ─────────────────────────────────────────────────────────

    fn chat_meta(&mut self, chat: Chat) {
        if let Some(target) = chat.migrated_to {
            self.touch(DialogId::channel(target), |d| d.migrated = true);
        }
        self.directory.put_chat(chat);
        self.changes.membership = true;
    }

    /// Pin or unpin a dialog.  A newly pinned dialog goes on top of its folder.
    pub fn pin(&mut self, dialog_id: DialogId, pinned: bool, folder_id: i32) {
        let rank = self.dialogs.max_pinned_num(folder_id) + 1;
        self.touch(dialog_id, |d| {
            if pinned && !d.pinned {
                d.pinned     = true;
                d.pinned_num = rank;
            } else if !pinned {
                d.pinned     = false;
                d.pinned_num = 0;
            }
        });
    }

    /// Replace a folder's pinned order; `order` is top first.
    pub fn pinned_order(&mut self, folder_id: i32, order: &[DialogId]) {
        let unpin: Vec<DialogId> = self
            .dialogs
            .iter()
            .filter(|d| d.pinned && d.folder_id == folder_id && !order.contains(&d.id))
            .map(|d| d.id)
            .collect();
        for id in unpin {
            self.touch(id, |d| {
                d.pinned     = false;
                d.pinned_num = 0;
            });
        }
        let n = order.len() as i32;
        for (i, id) in order.iter().enumerate() {
            self.touch(*id, |d| {
                d.pinned     = true;
                d.pinned_num = n - i as i32;
            });
        }
    }

    /// Move a dialog between folders.  Moving unpins it.
    pub fn move_to_folder(&mut self, dialog_id: DialogId, folder_id: i32) {
        self.touch(dialog_id, |d| {
            if d.folder_id != folder_id {
                d.folder_id  = folder_id;
                d.pinned     = false;
                d.pinned_num = 0;
            }
        });
    }

    // ── Snapshots ────────────────────────────────────────────────────────────

    /// Replace a dialog with a server-provided value and re-index the
    /// messages that came with it.
    pub fn replace_dialog(&mut self, dialog: Dialog, messages: &[Message]) {
        let id = dialog.id;
        match self.dialogs.upsert(dialog.clone()) {
            Some(before) => self.changes.record(&before, &dialog, self.now),
            None => self.changes.record_new(id),
        }
        for m in messages.iter().filter(|m| m.dialog_id() == Some(id)) {
            self.index_message(m, &dialog);
        }
    }

    /// Index a message that arrived as part of a snapshot; dialog counters
    /// come from the snapshot and are not touched.
    fn index_message(&mut self, message: &Message, dialog: &Dialog) {
        let own = self.is_self_origin(message);
        let ptr = MessagePointer {
            dialog_id:  dialog.id,
            message_id: message.id,
            random_id:  message.random_id,
            date:       message.date,
            out:        own,
            unread:     !own && message.id > dialog.read_inbox_max,
        };
        let account_wide = !matches!(message.peer, Some(Peer::Channel(_)));
        self.messages.insert(ptr, account_wide);
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    /// Create a dialog on first reference, hydrating its read markers from
    /// storage.
    fn ensure_dialog(&mut self, id: DialogId) {
        if self.dialogs.contains(id) {
            return;
        }
        let mut dialog = Dialog::new(id);
        dialog.read_inbox_max  = self.stored_read_max(false, id);
        dialog.read_outbox_max = self.stored_read_max(true, id);
        self.dialogs.upsert(dialog);
        self.changes.record_new(id);
    }

    fn stored_read_max(&self, outbound: bool, id: DialogId) -> MessageId {
        match self.storage.read_dialog_read_max(outbound, id) {
            Ok(v) => v.unwrap_or(0),
            Err(e) => {
                tracing::warn!("[layer-sync] reading read marker of {id} failed: {e}");
                0
            }
        }
    }

    /// Mutate an existing dialog and record what changed.  Returns `false` if
    /// the dialog is unknown.
    fn touch(&mut self, id: DialogId, f: impl FnOnce(&mut Dialog)) -> bool {
        let now = self.now;
        let Some(d) = self.dialogs.get_mut(id) else {
            tracing::trace!("[layer-sync] update for unknown dialog {id} skipped");
            return false;
        };
        let before = d.clone();
        f(d);
        self.changes.record(&before, d, now);
        true
    }
}
