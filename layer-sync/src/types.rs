//! Plain data model shared by every layer of the engine.
//!
//! All values here are already decoded: the engine never sees wire bytes.
//! Dialog identifiers follow the classic client encoding: users are
//! positive, groups and channels negative, and two high bits tag folder
//! pseudo-dialogs and secret chats.

use std::fmt;

// ─── Identifiers ──────────────────────────────────────────────────────────────

/// Message identifier, unique per dialog (and account-wide outside channels).
pub type MessageId = i32;

const FOLDER_BIT:    i64 = 0x2000_0000_0000_0000;
const ENCRYPTED_BIT: i64 = 0x4000_0000_0000_0000;

/// Folder that holds archived dialogs.
pub const ARCHIVE_FOLDER_ID: i32 = 1;

/// Identifier of a dialog row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DialogId(pub i64);

impl DialogId {
    pub fn user(user_id: i64) -> Self { Self(user_id) }

    pub fn chat(chat_id: i64) -> Self { Self(-chat_id) }

    pub fn channel(channel_id: i64) -> Self { Self(-channel_id) }

    pub fn folder(folder_id: i32) -> Self { Self(FOLDER_BIT | folder_id as i64) }

    pub fn secret(chat_id: i32) -> Self { Self(ENCRYPTED_BIT | (chat_id as i64 & 0xffff_ffff)) }

    /// `true` for the synthetic rows that stand for a whole folder.
    pub fn is_folder(self) -> bool {
        self.0 & FOLDER_BIT != 0 && self.0 >= 0
    }

    pub fn is_secret(self) -> bool {
        self.0 & ENCRYPTED_BIT != 0 && self.0 >= 0
    }

    pub fn is_user(self) -> bool {
        !self.is_secret() && !self.is_folder() && self.0 > 0
    }

    /// Basic group or channel.
    pub fn is_chat(self) -> bool {
        !self.is_secret() && !self.is_folder() && self.0 < 0
    }

    /// Folder id encoded in a folder pseudo-dialog.
    pub fn folder_id(self) -> Option<i32> {
        self.is_folder().then_some(self.0 as i32)
    }

    pub fn secret_chat_id(self) -> Option<i32> {
        self.is_secret().then_some(self.0 as i32)
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Peer ─────────────────────────────────────────────────────────────────────

/// The conversation a message or read marker belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Peer {
    User(i64),
    Chat(i64),
    Channel(i64),
    /// End-to-end encrypted chat.
    Secret(i32),
}

impl Peer {
    pub fn dialog_id(self) -> DialogId {
        match self {
            Self::User(id)    => DialogId::user(id),
            Self::Chat(id)    => DialogId::chat(id),
            Self::Channel(id) => DialogId::channel(id),
            Self::Secret(id)  => DialogId::secret(id),
        }
    }

    pub fn channel_id(self) -> Option<i64> {
        match self {
            Self::Channel(id) => Some(id),
            _ => None,
        }
    }
}

// ─── Counters ─────────────────────────────────────────────────────────────────

/// Server-side update state as returned by `getState` / difference responses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CounterSnapshot {
    pub pts:  i32,
    pub qts:  i32,
    pub date: i32,
    pub seq:  i32,
}

// ─── NotifySettings ───────────────────────────────────────────────────────────

/// Per-dialog notification settings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NotifySettings {
    /// Unix time until which the dialog is muted. `i32::MAX` mutes forever.
    pub mute_until:    Option<i32>,
    pub silent:        bool,
    pub show_previews: bool,
}

impl NotifySettings {
    pub fn is_muted(&self, now: i32) -> bool {
        self.mute_until.is_some_and(|until| until > now)
    }
}

// ─── Dialog ───────────────────────────────────────────────────────────────────

/// How a dialog decides whether a message is "newer" than its top message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopOrdering {
    /// Normal and channel dialogs: server ids grow monotonically.
    ById,
    /// Secret chats and migrated groups: ids are not comparable, dates are.
    ByDate,
}

/// A conversation summary used for list rendering and unread tracking.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Dialog {
    pub id:                     DialogId,
    pub top_message_id:         MessageId,
    pub last_message_date:      i32,
    pub read_inbox_max:         MessageId,
    pub read_outbox_max:        MessageId,
    pub unread_count:           i32,
    pub unread_mentions_count:  i32,
    pub unread_reactions_count: i32,
    pub pinned:                 bool,
    /// Pin rank; higher sorts first.
    pub pinned_num:             i32,
    pub folder_id:              i32,
    pub notify_settings:        NotifySettings,
    pub unread_mark:            bool,
    /// The cached top message was deleted and a replacement is not yet known.
    pub top_message_deleted:    bool,
    /// Date of the saved draft, if any.
    pub draft_date:             Option<i32>,
    /// Group that was upgraded to a supergroup; its ids stop being monotonic.
    pub migrated:               bool,
    /// Channel pts as reported with the dialog, 0 when not a channel.
    pub pts:                    i32,
}

impl Dialog {
    pub fn new(id: DialogId) -> Self {
        Self { id, ..Default::default() }
    }

    /// Synthetic row standing for a folder in the main list.
    pub fn folder(folder_id: i32) -> Self {
        Self { id: DialogId::folder(folder_id), ..Default::default() }
    }

    pub fn top_ordering(&self) -> TopOrdering {
        if self.id.is_secret() || self.migrated {
            TopOrdering::ByDate
        } else {
            TopOrdering::ById
        }
    }

    /// Later of the last message date and the draft date.
    pub fn effective_date(&self) -> i32 {
        match self.draft_date {
            Some(d) if d >= self.last_message_date => d,
            _ => self.last_message_date,
        }
    }

    /// Whether the row counts as unread for the "exclude read" filter flag.
    pub fn has_unread(&self) -> bool {
        self.unread_count > 0 || self.unread_mark || self.unread_mentions_count > 0
    }
}

// ─── Message ──────────────────────────────────────────────────────────────────

/// A decoded message, as carried by new/edit payloads and difference deltas.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Message {
    pub id:           MessageId,
    pub peer:         Option<Peer>,
    /// Sender user id, `None` for anonymous channel posts.
    pub from_id:      Option<i64>,
    pub random_id:    Option<i64>,
    pub date:         i32,
    /// Sent by the logged-in account.
    pub out:          bool,
    pub mentioned:    bool,
    pub media_unread: bool,
    pub edit_date:    Option<i32>,
    pub text:         String,
}

impl Message {
    pub fn dialog_id(&self) -> Option<DialogId> {
        self.peer.map(Peer::dialog_id)
    }
}

/// Lightweight reference to a message; the full payload lives elsewhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MessagePointer {
    pub dialog_id:  DialogId,
    pub message_id: MessageId,
    pub random_id:  Option<i64>,
    pub date:       i32,
    pub out:        bool,
    /// Incoming and above the read-inbox marker when it was indexed.
    pub unread:     bool,
}

// ─── Entities ─────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct User {
    pub id:      i64,
    /// The logged-in account.
    pub is_self: bool,
    pub contact: bool,
    pub bot:     bool,
    pub deleted: bool,
    pub name:    String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChatKind {
    Group,
    Channel { megagroup: bool },
    /// Kicked or banned; no further updates will arrive.
    Forbidden,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Chat {
    pub id:          i64,
    pub kind:        ChatKind,
    pub title:       String,
    /// Supergroup this basic group was upgraded to.
    pub migrated_to: Option<i64>,
    pub left:        bool,
}

/// Category of a dialog's peer, used by folder predicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerKind {
    Contact,
    NonContact,
    Bot,
    Group,
    Channel,
    /// Entity not in the directory yet.
    Unknown,
}
