//! Update envelopes and their ordering classification.
//!
//! The transport hands the engine already-decoded [`UpdateBatch`]es.  Every
//! [`UpdateEnvelope`] inside is classified exactly once into an
//! [`OrderingClass`] and an ordering key; from then on nothing re-inspects the
//! payload to decide which counter it belongs to.

use crate::types::{Chat, DialogId, Message, MessageId, NotifySettings, Peer, User};

// ─── Payload ──────────────────────────────────────────────────────────────────

/// What an update changes, independent of how it is sequenced.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// A new message (private chat, group, channel or secret chat).
    NewMessage(Message),
    /// An existing message was edited.
    EditMessage(Message),
    /// Messages were deleted.  Outside channels ids are account-wide, so no
    /// dialog is given.
    DeleteMessages { channel_id: Option<i64>, ids: Vec<MessageId> },
    /// Our inbox was read up to `max_id` (possibly on another device).
    ReadInbox { peer: Peer, max_id: MessageId, still_unread_count: Option<i32> },
    /// The other side read our messages up to `max_id`.
    ReadOutbox { peer: Peer, max_id: MessageId },
    /// Someone is typing.
    Typing { peer: Peer, user_id: i64 },
    /// A group or channel changed (title, migration, kick, …).
    ChatMeta(Chat),
    /// A user changed in a way that matters to folders (contact state, bot flag).
    UserMeta(User),
    /// Binds the client-generated random id of a sent message to its server id.
    MessageIdAssigned { random_id: i64, id: MessageId },
    /// A dialog was pinned or unpinned.
    DialogPinned { dialog_id: DialogId, pinned: bool, folder_id: i32 },
    /// Full pinned order of a folder, highest rank first.  `None` means
    /// "refetch"; the engine then keeps its local order.
    PinnedDialogs { folder_id: i32, order: Option<Vec<DialogId>> },
    /// Dialogs moved between folders.
    FolderPeers(Vec<(DialogId, i32)>),
    NotifySettings { dialog_id: DialogId, settings: NotifySettings },
    /// A draft was saved (`Some(date)`) or cleared (`None`).
    DraftMessage { dialog_id: DialogId, date: Option<i32> },
    DialogUnreadMark { dialog_id: DialogId, unread: bool },
    /// Unread reaction count for a dialog after a reaction change.
    MessageReactions { dialog_id: DialogId, message_id: MessageId, unread_reactions: i32 },
    /// All mentions in a dialog were read.
    ReadMentions { dialog_id: DialogId },
    /// The server has too many channel updates to push; fetch the difference.
    ChannelTooLong { channel_id: i64, pts: Option<i32> },
    /// Counter-only acknowledgement (e.g. of a message we sent ourselves).
    Empty,
}

impl Payload {
    /// The dialog this payload touches, when it is tied to exactly one.
    pub fn dialog_id(&self) -> Option<DialogId> {
        match self {
            Self::NewMessage(m) | Self::EditMessage(m) => m.dialog_id(),
            Self::DeleteMessages { channel_id, .. } => channel_id.map(DialogId::channel),
            Self::ReadInbox { peer, .. }
            | Self::ReadOutbox { peer, .. }
            | Self::Typing { peer, .. } => Some(peer.dialog_id()),
            Self::ChatMeta(chat) => Some(DialogId::chat(chat.id)),
            Self::UserMeta(user) => Some(DialogId::user(user.id)),
            Self::DialogPinned { dialog_id, .. }
            | Self::NotifySettings { dialog_id, .. }
            | Self::DraftMessage { dialog_id, .. }
            | Self::DialogUnreadMark { dialog_id, .. }
            | Self::MessageReactions { dialog_id, .. }
            | Self::ReadMentions { dialog_id } => Some(*dialog_id),
            Self::ChannelTooLong { channel_id, .. } => Some(DialogId::channel(*channel_id)),
            Self::MessageIdAssigned { .. }
            | Self::PinnedDialogs { .. }
            | Self::FolderPeers(_)
            | Self::Empty => None,
        }
    }

    /// Peers whose entities must be known before the payload can be applied.
    pub fn referenced_peers(&self) -> Vec<Peer> {
        match self {
            Self::NewMessage(m) | Self::EditMessage(m) => {
                let mut peers: Vec<Peer> = m.peer.into_iter().collect();
                if let Some(from) = m.from_id {
                    if m.peer != Some(Peer::User(from)) {
                        peers.push(Peer::User(from));
                    }
                }
                peers
            }
            Self::ReadInbox { peer, .. } | Self::ReadOutbox { peer, .. } => vec![*peer],
            _ => Vec::new(),
        }
    }
}

// ─── UpdateEnvelope ───────────────────────────────────────────────────────────

/// A single update together with the counter that sequences it.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateEnvelope {
    /// Not sequenced by any counter (typing, chat meta, notify settings, …).
    Plain(Payload),
    /// Sequenced by the account-wide `pts`.
    GlobalScoped { pts: i32, pts_count: i32, payload: Payload },
    /// Sequenced by a channel's own `pts`.
    ChannelScoped { channel_id: i64, pts: i32, pts_count: i32, payload: Payload },
    /// Sequenced by `qts` (secret chats).
    QtsScoped { qts: i32, payload: Payload },
    /// The server says our counters changed without telling us how.
    StateOnly,
}

impl UpdateEnvelope {
    /// Wrap a new message under the counter its peer uses.
    pub fn new_message(message: Message, pts: i32, pts_count: i32) -> Self {
        Self::scoped(Payload::NewMessage(message), pts, pts_count)
    }

    /// Wrap a payload under the channel counter if it belongs to a channel,
    /// the global counter otherwise.
    pub fn scoped(payload: Payload, pts: i32, pts_count: i32) -> Self {
        let channel = match &payload {
            Payload::NewMessage(m) | Payload::EditMessage(m) => m.peer.and_then(Peer::channel_id),
            Payload::DeleteMessages { channel_id, .. } => *channel_id,
            Payload::ReadInbox { peer, .. } | Payload::ReadOutbox { peer, .. } => peer.channel_id(),
            _ => None,
        };
        match channel {
            Some(channel_id) => Self::ChannelScoped { channel_id, pts, pts_count, payload },
            None => Self::GlobalScoped { pts, pts_count, payload },
        }
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Self::Plain(p)
            | Self::GlobalScoped { payload: p, .. }
            | Self::ChannelScoped { payload: p, .. }
            | Self::QtsScoped { payload: p, .. } => Some(p),
            Self::StateOnly => None,
        }
    }

    pub fn into_payload(self) -> Option<Payload> {
        match self {
            Self::Plain(p)
            | Self::GlobalScoped { payload: p, .. }
            | Self::ChannelScoped { payload: p, .. }
            | Self::QtsScoped { payload: p, .. } => Some(p),
            Self::StateOnly => None,
        }
    }
}

// ─── UpdateBatch ──────────────────────────────────────────────────────────────

/// Made-up value meaning "this container carries no `seq`".
pub const NO_SEQ: i32 = 0;

/// A container of updates as delivered by the transport, together with the
/// entities the updates reference.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateBatch {
    pub updates:   Vec<UpdateEnvelope>,
    pub users:     Vec<User>,
    pub chats:     Vec<Chat>,
    pub date:      i32,
    /// `seq` after the first update of the container, [`NO_SEQ`] if unsequenced.
    pub seq_start: i32,
    /// `seq` after the whole container, [`NO_SEQ`] if unsequenced.
    pub seq:       i32,
}

impl UpdateBatch {
    /// An unsequenced batch with a single update.
    pub fn single(update: UpdateEnvelope) -> Self {
        Self { updates: vec![update], ..Default::default() }
    }

    /// An unsequenced batch.
    pub fn of(updates: Vec<UpdateEnvelope>) -> Self {
        Self { updates, ..Default::default() }
    }

    pub fn with_seq(mut self, seq_start: i32, seq: i32, date: i32) -> Self {
        self.seq_start = seq_start;
        self.seq       = seq;
        self.date      = date;
        self
    }

    pub fn with_entities(mut self, users: Vec<User>, chats: Vec<Chat>) -> Self {
        self.users = users;
        self.chats = chats;
        self
    }

    pub fn is_sequenced(&self) -> bool {
        self.seq_start != NO_SEQ
    }
}

/// Everything the transport may push.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Batch(UpdateBatch),
    /// Too many updates are pending server-side; fetch them manually.
    TooLong,
}

impl From<UpdateBatch> for Inbound {
    fn from(b: UpdateBatch) -> Self { Self::Batch(b) }
}

// ─── Classification ───────────────────────────────────────────────────────────

/// The counter an update is ordered by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OrderingClass {
    Unsequenced,
    /// Whole containers, ordered by `seq`.
    Seq,
    Pts,
    Qts,
    Channel(i64),
}

/// An envelope with its ordering class and key computed once.
#[derive(Clone, Debug, PartialEq)]
pub struct Classified {
    pub class:    OrderingClass,
    /// Counter value after applying the update.
    pub key:      i32,
    /// How far the update advances the counter.
    pub count:    i32,
    pub envelope: UpdateEnvelope,
}

/// Assign an envelope its ordering class and key.
pub fn classify(envelope: UpdateEnvelope) -> Classified {
    let (class, key, count) = match &envelope {
        UpdateEnvelope::Plain(_) | UpdateEnvelope::StateOnly => (OrderingClass::Unsequenced, 0, 0),
        UpdateEnvelope::GlobalScoped { pts, pts_count, .. } => (OrderingClass::Pts, *pts, *pts_count),
        UpdateEnvelope::ChannelScoped { channel_id, pts, pts_count, .. } =>
            (OrderingClass::Channel(*channel_id), *pts, *pts_count),
        UpdateEnvelope::QtsScoped { qts, .. } => (OrderingClass::Qts, *qts, 1),
    };
    Classified { class, key, count, envelope }
}
