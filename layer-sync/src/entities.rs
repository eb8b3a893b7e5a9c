//! Directory of users and chats referenced by updates.
//!
//! Updates only carry ids; before an update is applied every peer it
//! references must be resolvable here.  Batches and difference responses put
//! their entities into the directory first, so in practice only the first
//! update of a never-seen chat needs a one-off entity load.

use std::collections::HashMap;
use std::sync::{RwLock, PoisonError};

use crate::types::{Chat, ChatKind, DialogId, Peer, PeerKind, User};

/// Lookup and caching of user/chat entities.
pub trait EntityDirectory: Send + Sync {
    fn resolve_user(&self, id: i64) -> Option<User>;

    fn resolve_chat(&self, id: i64) -> Option<Chat>;

    fn put_user(&self, user: User);

    fn put_chat(&self, chat: Chat);
}

/// Whether the entity behind `peer` is known.  Secret chats are resolved by
/// the encryption layer and always count as known here.
pub fn is_resolved(dir: &dyn EntityDirectory, peer: Peer) -> bool {
    match peer {
        Peer::User(id) => dir.resolve_user(id).is_some(),
        Peer::Chat(id) | Peer::Channel(id) => dir.resolve_chat(id).is_some(),
        Peer::Secret(_) => true,
    }
}

/// Category of a dialog's peer for folder predicates.
pub fn peer_kind(dir: &dyn EntityDirectory, dialog_id: DialogId) -> PeerKind {
    if dialog_id.is_user() {
        return match dir.resolve_user(dialog_id.0) {
            Some(u) if u.bot     => PeerKind::Bot,
            Some(u) if u.contact => PeerKind::Contact,
            Some(_)              => PeerKind::NonContact,
            None                 => PeerKind::Unknown,
        };
    }
    if dialog_id.is_secret() {
        // Secret chats inherit the category of the other participant, which
        // this directory does not track; they are always person-to-person.
        return PeerKind::NonContact;
    }
    if dialog_id.is_chat() {
        return match dir.resolve_chat(-dialog_id.0).map(|c| c.kind) {
            Some(ChatKind::Channel { megagroup: false }) => PeerKind::Channel,
            Some(_) => PeerKind::Group,
            None    => PeerKind::Unknown,
        };
    }
    PeerKind::Unknown
}

// ─── InMemoryDirectory ────────────────────────────────────────────────────────

/// Simple map-backed directory.
#[derive(Default)]
pub struct InMemoryDirectory {
    users: RwLock<HashMap<i64, User>>,
    chats: RwLock<HashMap<i64, Chat>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(self, users: impl IntoIterator<Item = User>) -> Self {
        for u in users { self.put_user(u); }
        self
    }

    pub fn with_chats(self, chats: impl IntoIterator<Item = Chat>) -> Self {
        for c in chats { self.put_chat(c); }
        self
    }
}

impl EntityDirectory for InMemoryDirectory {
    fn resolve_user(&self, id: i64) -> Option<User> {
        self.users.read().unwrap_or_else(PoisonError::into_inner).get(&id).cloned()
    }

    fn resolve_chat(&self, id: i64) -> Option<Chat> {
        self.chats.read().unwrap_or_else(PoisonError::into_inner).get(&id).cloned()
    }

    fn put_user(&self, user: User) {
        self.users.write().unwrap_or_else(PoisonError::into_inner).insert(user.id, user);
    }

    fn put_chat(&self, chat: Chat) {
        self.chats.write().unwrap_or_else(PoisonError::into_inner).insert(chat.id, chat);
    }
}
