//! Message pointers with their alternate indexes.
//!
//! Only the fields needed for de-duplication, unread accounting and top
//! message resolution are kept; message bodies are owned by the caller.
//! Outside channels message ids are account-wide, so deletions that carry no
//! dialog are resolved through a global id index.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::types::{DialogId, MessageId, MessagePointer, TopOrdering};

#[derive(Default)]
pub struct MessageIndex {
    by_dialog:    HashMap<DialogId, BTreeMap<MessageId, MessagePointer>>,
    /// Non-channel message id → dialog.
    by_global_id: HashMap<MessageId, DialogId>,
    by_random_id: HashMap<i64, (DialogId, MessageId)>,
    /// Dialogs that gained pointers since the last prune.
    grown:        HashSet<DialogId>,
}

impl MessageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_dialog.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_dialog.values().all(BTreeMap::is_empty)
    }

    /// Index a pointer.  `account_wide` is `true` for every message outside
    /// channels.  Returns `false` if the id or random id is already known, in
    /// which case nothing changes.
    pub fn insert(&mut self, ptr: MessagePointer, account_wide: bool) -> bool {
        if self.get(ptr.dialog_id, ptr.message_id).is_some() {
            return false;
        }
        if let Some(random_id) = ptr.random_id {
            if self.by_random_id.contains_key(&random_id) {
                return false;
            }
            self.by_random_id.insert(random_id, (ptr.dialog_id, ptr.message_id));
        }
        if account_wide {
            self.by_global_id.insert(ptr.message_id, ptr.dialog_id);
        }
        self.by_dialog.entry(ptr.dialog_id).or_default().insert(ptr.message_id, ptr);
        self.grown.insert(ptr.dialog_id);
        true
    }

    pub fn get(&self, dialog_id: DialogId, id: MessageId) -> Option<&MessagePointer> {
        self.by_dialog.get(&dialog_id)?.get(&id)
    }

    pub fn get_by_random_id(&self, random_id: i64) -> Option<&MessagePointer> {
        let (dialog_id, id) = self.by_random_id.get(&random_id)?;
        self.get(*dialog_id, *id)
    }

    /// Dialog of a non-channel message.
    pub fn locate(&self, id: MessageId) -> Option<DialogId> {
        self.by_global_id.get(&id).copied()
    }

    /// Remove a pointer and every alternate index entry that refers to it.
    pub fn remove(&mut self, dialog_id: DialogId, id: MessageId) -> Option<MessagePointer> {
        let messages = self.by_dialog.get_mut(&dialog_id)?;
        let ptr = messages.remove(&id)?;
        if messages.is_empty() {
            self.by_dialog.remove(&dialog_id);
        }
        self.unlink(&ptr);
        Some(ptr)
    }

    /// Remove a non-channel message by its account-wide id.
    pub fn remove_global(&mut self, id: MessageId) -> Option<MessagePointer> {
        let dialog_id = self.locate(id)?;
        self.remove(dialog_id, id)
    }

    /// Forget every pointer of a dialog.  Returns how many were dropped.
    pub fn remove_dialog(&mut self, dialog_id: DialogId) -> usize {
        let Some(messages) = self.by_dialog.remove(&dialog_id) else {
            return 0;
        };
        for ptr in messages.values() {
            self.unlink(ptr);
        }
        messages.len()
    }

    /// Move a locally-sent message to the id the server assigned it.
    pub fn rebind(&mut self, random_id: i64, new_id: MessageId) -> Option<MessagePointer> {
        let (dialog_id, old_id) = *self.by_random_id.get(&random_id)?;
        if old_id == new_id {
            return self.get(dialog_id, new_id).copied();
        }
        let account_wide = self.by_global_id.get(&old_id) == Some(&dialog_id);
        let mut ptr = self.remove(dialog_id, old_id)?;
        ptr.message_id = new_id;
        self.insert(ptr, account_wide);
        Some(ptr)
    }

    /// Mark incoming messages up to `max_id` as read.  Returns how many
    /// pointers flipped from unread to read.
    pub fn mark_read(&mut self, dialog_id: DialogId, max_id: MessageId) -> i32 {
        let Some(messages) = self.by_dialog.get_mut(&dialog_id) else {
            return 0;
        };
        let mut flipped = 0;
        for ptr in messages.range_mut(..=max_id).map(|(_, p)| p) {
            if ptr.unread && !ptr.out {
                ptr.unread = false;
                flipped += 1;
            }
        }
        flipped
    }

    /// Newest known message of a dialog under its ordering rule.
    pub fn latest(&self, dialog_id: DialogId, ordering: TopOrdering) -> Option<&MessagePointer> {
        let messages = self.by_dialog.get(&dialog_id)?;
        match ordering {
            TopOrdering::ById   => messages.values().next_back(),
            TopOrdering::ByDate => messages.values().max_by_key(|p| (p.date, p.message_id)),
        }
    }

    /// Trim every dialog that grew since the last call down to its unread
    /// pointers plus the `keep` newest ones.  Returns how many were dropped.
    pub fn prune(&mut self, keep: usize) -> usize {
        let mut dropped = Vec::new();
        for dialog_id in std::mem::take(&mut self.grown) {
            let Some(messages) = self.by_dialog.get_mut(&dialog_id) else { continue };
            if messages.len() <= keep {
                continue;
            }
            let old: Vec<MessageId> = messages
                .iter()
                .rev()
                .skip(keep)
                .filter(|(_, p)| !p.unread)
                .map(|(id, _)| *id)
                .collect();
            for id in old {
                if let Some(ptr) = messages.remove(&id) {
                    dropped.push(ptr);
                }
            }
        }
        for ptr in &dropped {
            self.unlink(ptr);
        }
        dropped.len()
    }

    fn unlink(&mut self, ptr: &MessagePointer) {
        if let Some(random_id) = ptr.random_id {
            if self.by_random_id.get(&random_id) == Some(&(ptr.dialog_id, ptr.message_id)) {
                self.by_random_id.remove(&random_id);
            }
        }
        if self.by_global_id.get(&ptr.message_id) == Some(&ptr.dialog_id) {
            self.by_global_id.remove(&ptr.message_id);
        }
    }
}
