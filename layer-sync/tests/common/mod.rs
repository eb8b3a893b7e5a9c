#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use layer_sync::{
    ChannelDifference, ChannelDifferenceRequest, Chat, ChatKind, CounterSnapshot, Dialog, DialogId,
    DialogsSnapshot, DifferenceRequest, FetchToken, GlobalDifference, InMemoryDirectory, InMemoryStorage,
    InvocationError, Job, Message, MessageId, Payload, Peer, ResolvedEntities, RpcError, Storage, SyncConfig,
    SyncEngine, Transport, UpdateBatch, UpdateEnvelope, User,
};

pub const CHANNEL: i64 = 77;

pub fn user(id: i64) -> User {
    User { id, name: format!("user{id}"), ..Default::default() }
}

pub fn channel(id: i64) -> Chat {
    Chat {
        id,
        kind: ChatKind::Channel { megagroup: false },
        title: format!("channel{id}"),
        migrated_to: None,
        left: false,
    }
}

/// Directory knowing users 1..=20 and channel [`CHANNEL`].
pub fn directory() -> Arc<InMemoryDirectory> {
    Arc::new(
        InMemoryDirectory::new()
            .with_users((1..=20).map(user))
            .with_chats([channel(CHANNEL)]),
    )
}

pub fn counters(pts: i32) -> CounterSnapshot {
    CounterSnapshot { pts, qts: 1, date: 1, seq: 1 }
}

/// Engine whose persisted global pts is `pts`.
pub fn engine_at(pts: i32) -> SyncEngine {
    engine_with(Arc::new(InMemoryStorage::new().with_counters(counters(pts))))
}

pub fn engine_with(storage: Arc<InMemoryStorage>) -> SyncEngine {
    SyncEngine::new(SyncConfig::default().self_user(1), storage, directory())
}

/// Storage holding `dialogs` and counters at `pts`.
pub fn storage_with(pts: i32, dialogs: &[Dialog]) -> Arc<InMemoryStorage> {
    let storage = InMemoryStorage::new().with_counters(counters(pts));
    storage.persist_dialogs(dialogs).expect("in-memory write");
    Arc::new(storage)
}

/// Incoming private message from `from` (who is also the peer).
pub fn msg(from: i64, id: MessageId) -> Message {
    Message {
        id,
        peer: Some(Peer::User(from)),
        from_id: Some(from),
        date: 1000 + id,
        text: format!("m{id}"),
        ..Default::default()
    }
}

pub fn channel_msg(channel_id: i64, id: MessageId) -> Message {
    Message { id, peer: Some(Peer::Channel(channel_id)), date: 1000 + id, ..Default::default() }
}

/// A pts-sequenced new message, alone in an unsequenced container.
pub fn pts_update(message: Message, pts: i32, count: i32) -> UpdateBatch {
    UpdateBatch::single(UpdateEnvelope::new_message(message, pts, count))
}

pub fn read_inbox(peer: i64, max_id: MessageId, pts: i32) -> UpdateBatch {
    UpdateBatch::single(UpdateEnvelope::GlobalScoped {
        pts,
        pts_count: 1,
        payload: Payload::ReadInbox { peer: Peer::User(peer), max_id, still_unread_count: None },
    })
}

pub fn global_token(jobs: &[Job]) -> Option<(FetchToken, DifferenceRequest)> {
    jobs.iter().find_map(|j| match j {
        Job::GlobalDifference { token, request } => Some((*token, *request)),
        _ => None,
    })
}

pub fn channel_token(jobs: &[Job]) -> Option<(FetchToken, ChannelDifferenceRequest)> {
    jobs.iter().find_map(|j| match j {
        Job::ChannelDifference { token, request } => Some((*token, *request)),
        _ => None,
    })
}

pub fn reset_token(jobs: &[Job]) -> Option<FetchToken> {
    jobs.iter().find_map(|j| match j {
        Job::Reset { token, .. } => Some(*token),
        _ => None,
    })
}

pub fn dialog(id: i64, top: MessageId, date: i32) -> Dialog {
    Dialog { top_message_id: top, last_message_date: date, ..Dialog::new(DialogId(id)) }
}

// ─── MockTransport ────────────────────────────────────────────────────────────

/// Scripted transport: every request pops the next canned response and is
/// recorded in `calls`.
#[derive(Default)]
pub struct MockTransport {
    pub state:               Mutex<CounterSnapshot>,
    pub dialogs:             Mutex<DialogsSnapshot>,
    pub pinned:              Mutex<DialogsSnapshot>,
    pub differences:         Mutex<VecDeque<GlobalDifference>>,
    pub channel_differences: Mutex<VecDeque<ChannelDifference>>,
    pub fail_delete:         Mutex<bool>,
    pub calls:               Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new(state: CounterSnapshot) -> Self {
        Self { state: Mutex::new(state), ..Default::default() }
    }

    pub fn with_dialogs(self, dialogs: Vec<Dialog>) -> Self {
        self.dialogs.lock().unwrap().dialogs = dialogs;
        self
    }

    pub fn queue_difference(&self, diff: GlobalDifference) {
        self.differences.lock().unwrap().push_back(diff);
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.as_str() == name).count()
    }

    fn record(&self, name: &str) {
        self.calls.lock().unwrap().push(name.to_string());
    }
}

impl Transport for MockTransport {
    fn get_state(&self) -> impl Future<Output = Result<CounterSnapshot, InvocationError>> + Send {
        self.record("get_state");
        let state = *self.state.lock().unwrap();
        async move { Ok(state) }
    }

    fn get_difference(
        &self,
        _req: DifferenceRequest,
    ) -> impl Future<Output = Result<GlobalDifference, InvocationError>> + Send {
        self.record("get_difference");
        let next = self.differences.lock().unwrap().pop_front();
        let state = *self.state.lock().unwrap();
        async move { Ok(next.unwrap_or(GlobalDifference::Empty { date: state.date, seq: state.seq })) }
    }

    fn get_channel_difference(
        &self,
        req: ChannelDifferenceRequest,
    ) -> impl Future<Output = Result<ChannelDifference, InvocationError>> + Send {
        self.record("get_channel_difference");
        let next = self.channel_differences.lock().unwrap().pop_front();
        async move {
            next.ok_or_else(|| InvocationError::Rpc(RpcError::from_server(400, &format!("CHANNEL_{}_UNKNOWN", req.channel_id))))
        }
    }

    fn get_dialogs(&self, _limit: i32) -> impl Future<Output = Result<DialogsSnapshot, InvocationError>> + Send {
        self.record("get_dialogs");
        let dialogs = self.dialogs.lock().unwrap().clone();
        async move { Ok(dialogs) }
    }

    fn get_pinned_dialogs(
        &self,
        _folder_id: i32,
    ) -> impl Future<Output = Result<DialogsSnapshot, InvocationError>> + Send {
        self.record("get_pinned_dialogs");
        let pinned = self.pinned.lock().unwrap().clone();
        async move { Ok(pinned) }
    }

    fn resolve_entities(
        &self,
        peers: Vec<Peer>,
    ) -> impl Future<Output = Result<ResolvedEntities, InvocationError>> + Send {
        self.record("resolve_entities");
        let users = peers
            .iter()
            .filter_map(|p| match p {
                Peer::User(id) => Some(user(*id)),
                _ => None,
            })
            .collect();
        async move { Ok(ResolvedEntities { users, chats: Vec::new() }) }
    }

    fn delete_dialog(&self, _dialog_id: DialogId) -> impl Future<Output = Result<(), InvocationError>> + Send {
        self.record("delete_dialog");
        let fail = *self.fail_delete.lock().unwrap();
        async move {
            if fail {
                Err(InvocationError::Rpc(RpcError::from_server(400, "PEER_ID_INVALID")))
            } else {
                Ok(())
            }
        }
    }
}
