//! Engine behaviour driven by hand: inbound batches, ticks and fetch results.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use layer_sync::{
    Baseline, ChannelDifference, CounterSnapshot, Dialog, DialogFilter, DialogId, DialogsSnapshot, Event,
    FetchState, GlobalDifference, InMemoryStorage, Inbound, InvocationError, Job, JobOutcome, Payload, Peer,
    ResolvedEntities, RpcError, Scope, SyncConfig, SyncEngine, UpdateBatch, UpdateEnvelope,
};
use layer_sync::filters::flags;
use tokio::time::Instant;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

// ── Global pts sequencing ────────────────────────────────────────────────────

#[test]
fn buffered_update_drains_once_predecessor_arrives() {
    let t0 = Instant::now();
    let mut e = engine_at(100);

    let jobs = e.handle_inbound(pts_update(msg(5, 2), 105, 2).into(), t0);
    assert!(jobs.is_empty());
    assert_eq!(e.counters().pts, 100);
    assert_eq!(e.queued(Scope::Global), vec![105]);

    let jobs = e.handle_inbound(pts_update(msg(5, 1), 103, 3).into(), t0 + ms(200));
    assert!(jobs.is_empty(), "no fetch when the gap fills itself");
    assert_eq!(e.counters().pts, 105);
    assert!(e.queued(Scope::Global).is_empty());

    let d = e.dialogs().get(DialogId::user(5)).expect("dialog created");
    assert_eq!(d.top_message_id, 2);
    assert_eq!(d.unread_count, 2);
    assert_eq!(e.fetches_dispatched(), 0);
}

#[test]
fn redelivered_update_changes_nothing() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    e.handle_inbound(pts_update(msg(5, 1), 101, 1).into(), t0);
    let before = e.dialogs().get(DialogId::user(5)).cloned();
    e.take_events();

    e.handle_inbound(pts_update(msg(5, 1), 101, 1).into(), t0);
    assert_eq!(e.counters().pts, 101);
    assert_eq!(e.dialogs().get(DialogId::user(5)).cloned(), before);
    assert!(e.take_events().is_empty());
}

#[test]
fn duplicate_gap_entries_are_buffered_once() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    e.handle_inbound(pts_update(msg(5, 3), 110, 1).into(), t0);
    e.handle_inbound(pts_update(msg(5, 3), 110, 1).into(), t0);
    assert_eq!(e.queued(Scope::Global), vec![110]);
}

#[test]
fn stalled_gap_triggers_exactly_one_difference() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    e.handle_inbound(pts_update(msg(5, 1), 105, 1).into(), t0);

    assert!(e.tick(t0 + ms(1000)).is_empty(), "still inside the wait window");

    let jobs = e.tick(t0 + ms(1500));
    let (_, request) = global_token(&jobs).expect("difference after the window");
    assert_eq!(request.pts, 100);
    assert!(e.queued(Scope::Global).is_empty(), "queue dropped in favour of the difference");
    assert_eq!(e.fetch_state(Scope::Global), FetchState::FetchingGlobal);

    // More gaps while the fetch is in flight do not start another one.
    e.handle_inbound(pts_update(msg(5, 2), 108, 1).into(), t0 + ms(1600));
    assert!(e.tick(t0 + ms(3200)).is_empty());
    assert_eq!(e.fetches_dispatched(), 1);
}

#[test]
fn progress_restarts_the_wait_window() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    e.handle_inbound(pts_update(msg(5, 2), 102, 1).into(), t0);
    e.handle_inbound(pts_update(msg(5, 4), 104, 1).into(), t0);

    e.handle_inbound(pts_update(msg(5, 1), 101, 1).into(), t0 + ms(1000));
    assert_eq!(e.counters().pts, 102);
    assert!(e.tick(t0 + ms(2000)).is_empty());
    assert!(global_token(&e.tick(t0 + ms(2500))).is_some());
}

#[test]
fn full_difference_fills_the_gap() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    e.handle_inbound(pts_update(msg(5, 3), 103, 1).into(), t0);
    let (token, _) = global_token(&e.tick(t0 + ms(1500))).expect("difference");

    let diff = GlobalDifference::Full {
        new_messages:  vec![msg(5, 1), msg(5, 2), msg(5, 3)],
        other_updates: vec![],
        users:         vec![],
        chats:         vec![],
        state:         CounterSnapshot { pts: 103, qts: 1, date: 50, seq: 1 },
    };
    let jobs = e.handle_outcome(e.generation(), JobOutcome::GlobalDifference { token, result: Ok(diff) }, t0 + ms(1600));
    assert!(jobs.is_empty());
    assert_eq!(e.counters().pts, 103);
    assert_eq!(e.counters().date, 50);
    assert_eq!(e.fetch_state(Scope::Global), FetchState::Idle);
    let d = e.dialogs().get(DialogId::user(5)).expect("dialog");
    assert_eq!((d.top_message_id, d.unread_count), (3, 3));
}

#[test]
fn difference_slice_fetches_again_from_intermediate_state() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    let (token, _) = global_token(&e.handle_inbound(Inbound::TooLong, t0)).expect("difference");

    let slice = GlobalDifference::Slice {
        new_messages:       vec![msg(5, 1)],
        other_updates:      vec![],
        users:              vec![],
        chats:              vec![],
        intermediate_state: counters(150),
    };
    let jobs = e.handle_outcome(0, JobOutcome::GlobalDifference { token, result: Ok(slice) }, t0);
    let (next, request) = global_token(&jobs).expect("follow-up fetch");
    assert_eq!(request.pts, 150);

    let jobs = e.handle_outcome(
        0,
        JobOutcome::GlobalDifference { token: next, result: Ok(GlobalDifference::Empty { date: 9, seq: 4 }) },
        t0,
    );
    assert!(jobs.is_empty());
    assert_eq!(e.counters(), CounterSnapshot { pts: 150, qts: 1, date: 9, seq: 4 });
}

#[test]
fn difference_never_moves_counters_backwards() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    let (token, _) = global_token(&e.handle_inbound(Inbound::TooLong, t0)).expect("difference");
    // A live update lands while the fetch is in flight.
    e.handle_inbound(pts_update(msg(5, 1), 101, 1).into(), t0);

    let diff = GlobalDifference::Full {
        new_messages: vec![], other_updates: vec![], users: vec![], chats: vec![],
        state: counters(100),
    };
    e.handle_outcome(0, JobOutcome::GlobalDifference { token, result: Ok(diff) }, t0);
    assert_eq!(e.counters().pts, 101);
}

#[test]
fn failed_difference_rearms_on_next_trigger() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    let (token, _) = global_token(&e.handle_inbound(Inbound::TooLong, t0)).expect("difference");
    e.handle_outcome(0, JobOutcome::GlobalDifference { token, result: Err(InvocationError::Timeout) }, t0);
    assert_eq!(e.fetch_state(Scope::Global), FetchState::Idle);
    assert!(global_token(&e.handle_inbound(Inbound::TooLong, t0)).is_some());
}

#[test]
fn hung_fetch_is_abandoned_after_timeout() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    let (old, _) = global_token(&e.handle_inbound(Inbound::TooLong, t0)).expect("difference");
    e.handle_inbound(pts_update(msg(5, 1), 105, 1).into(), t0 + ms(29_000));

    let jobs = e.tick(t0 + ms(31_000));
    let (fresh, _) = global_token(&jobs).expect("re-armed");
    assert_ne!(old, fresh);

    // The late answer to the abandoned fetch is ignored.
    let late = GlobalDifference::Full {
        new_messages: vec![], other_updates: vec![], users: vec![], chats: vec![],
        state: counters(500),
    };
    e.handle_outcome(0, JobOutcome::GlobalDifference { token: old, result: Ok(late) }, t0 + ms(31_100));
    assert_eq!(e.counters().pts, 100);
}

// ── Reset ────────────────────────────────────────────────────────────────────

fn baseline(pts: i32) -> Baseline {
    let mut channel_dialog = dialog(-CHANNEL, 30, 900);
    channel_dialog.pts = 40;
    Baseline {
        dialogs: DialogsSnapshot {
            dialogs: vec![dialog(5, 10, 800), channel_dialog, dialog(6, 11, 700)],
            ..Default::default()
        },
        pinned: DialogsSnapshot {
            dialogs: vec![Dialog { pinned: true, ..dialog(6, 11, 700) }],
            ..Default::default()
        },
        state: counters(pts),
    }
}

#[test]
fn too_long_difference_resets_from_baseline() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    e.handle_inbound(pts_update(msg(5, 1), 110, 1).into(), t0);
    let (token, _) = global_token(&e.handle_inbound(Inbound::TooLong, t0)).expect("difference");

    let jobs = e.handle_outcome(
        0,
        JobOutcome::GlobalDifference { token, result: Ok(GlobalDifference::TooLong { pts: 900 }) },
        t0,
    );
    let reset = reset_token(&jobs).expect("baseline requested");

    e.handle_outcome(0, JobOutcome::Reset { token: reset, result: Ok(baseline(900)) }, t0);
    assert_eq!(e.counters().pts, 900);
    assert!(e.queued(Scope::Global).is_empty());
    assert_eq!(e.channel_pts(CHANNEL), Some(40));

    let snapshot = e.snapshot();
    assert_eq!(snapshot.main_list()[0], DialogId(6), "pinned dialog on top");
    assert_eq!(snapshot.main_list().len(), 3);
    assert!(snapshot.get(DialogId(6)).is_some_and(|d| d.pinned && d.pinned_num == 1));
}

#[test]
fn updates_before_any_state_wait_for_the_baseline() {
    let t0 = Instant::now();
    let mut e = engine_with(Arc::new(InMemoryStorage::new()));
    let jobs = e.start(t0);
    let reset = reset_token(&jobs).expect("cold start loads a baseline");

    assert!(e.handle_inbound(pts_update(msg(5, 12), 901, 1).into(), t0).is_empty());
    assert_eq!(e.counters().pts, 0);

    e.handle_outcome(0, JobOutcome::Reset { token: reset, result: Ok(baseline(900)) }, t0);
    assert_eq!(e.counters().pts, 901);
    assert_eq!(e.dialogs().get(DialogId(5)).map(|d| d.top_message_id), Some(12));
}

#[test]
fn stale_generation_results_are_dropped() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    let (token, _) = global_token(&e.start(t0)).expect("catch-up difference");
    let old_generation = e.generation();

    e.reset_session();
    let diff = GlobalDifference::Full {
        new_messages: vec![msg(5, 1)], other_updates: vec![], users: vec![], chats: vec![],
        state: counters(200),
    };
    let jobs = e.handle_outcome(old_generation, JobOutcome::GlobalDifference { token, result: Ok(diff) }, t0);
    assert!(jobs.is_empty());
    assert_eq!(e.counters().pts, 100);
    assert!(e.dialogs().get(DialogId(5)).is_none());
}

// ── Channels ─────────────────────────────────────────────────────────────────

fn channel_update(id: i32, pts: i32) -> UpdateBatch {
    pts_update(channel_msg(CHANNEL, id), pts, 1)
}

#[test]
fn unknown_channel_fetches_its_difference() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    let jobs = e.handle_inbound(channel_update(7, 51).into(), t0);

    let (token, request) = channel_token(&jobs).expect("channel difference");
    assert_eq!(request.channel_id, CHANNEL);
    assert_eq!(request.pts, 50);
    assert!(request.force);
    assert!(e.dialogs().get(DialogId::channel(CHANNEL)).is_none(), "not applied before the fetch");

    let delta = ChannelDifference::Delta {
        pts: 51,
        new_messages: vec![channel_msg(CHANNEL, 7)],
        other_updates: vec![],
        users: vec![],
        chats: vec![],
        is_final: true,
    };
    e.handle_outcome(0, JobOutcome::ChannelDifference { channel_id: CHANNEL, token, result: Ok(delta) }, t0);
    assert_eq!(e.channel_pts(CHANNEL), Some(51));
    assert_eq!(e.dialogs().get(DialogId::channel(CHANNEL)).map(|d| d.top_message_id), Some(7));
    assert_eq!(e.counters().pts, 100, "channel updates leave the global pts alone");
}

#[test]
fn channel_gap_is_independent_of_global_pts() {
    let t0 = Instant::now();
    let mut e = engine_with(Arc::new(
        InMemoryStorage::new().with_counters(counters(100)).with_channel_pts(CHANNEL, 10),
    ));
    e.handle_inbound(channel_update(2, 12).into(), t0);
    assert_eq!(e.queued(Scope::Channel(CHANNEL)), vec![12]);

    e.handle_inbound(pts_update(msg(5, 1), 101, 1).into(), t0);
    assert_eq!(e.counters().pts, 101);

    e.handle_inbound(channel_update(1, 11).into(), t0);
    assert_eq!(e.channel_pts(CHANNEL), Some(12));
    assert!(e.queued(Scope::Channel(CHANNEL)).is_empty());
}

#[test]
fn channel_too_long_rebuilds_the_dialog() {
    let t0 = Instant::now();
    let mut e = engine_with(Arc::new(
        InMemoryStorage::new().with_counters(counters(100)).with_channel_pts(CHANNEL, 10),
    ));
    e.handle_inbound(channel_update(3, 11).into(), t0);
    e.handle_inbound(channel_update(9, 15).into(), t0);

    let (token, request) = channel_token(&e.tick(t0 + ms(1500))).expect("channel difference");
    assert_eq!((request.pts, request.force), (11, false));

    let mut rebuilt = dialog(-CHANNEL, 39, 5000);
    rebuilt.pts = 40;
    rebuilt.unread_count = 4;
    let diff = ChannelDifference::TooLong {
        dialog:   rebuilt,
        messages: vec![channel_msg(CHANNEL, 39)],
        users:    vec![],
        chats:    vec![],
    };
    e.handle_outcome(0, JobOutcome::ChannelDifference { channel_id: CHANNEL, token, result: Ok(diff) }, t0);

    assert_eq!(e.channel_pts(CHANNEL), Some(40));
    assert!(e.queued(Scope::Channel(CHANNEL)).is_empty());
    assert!(e.messages().get(DialogId::channel(CHANNEL), 3).is_none(), "old pointers dropped");
    assert!(e.messages().get(DialogId::channel(CHANNEL), 39).is_some());
    let d = e.dialogs().get(DialogId::channel(CHANNEL)).expect("dialog");
    assert_eq!((d.top_message_id, d.unread_count), (39, 4));
}

#[test]
fn channel_too_long_payload_requests_a_fetch() {
    let t0 = Instant::now();
    let mut e = engine_with(Arc::new(
        InMemoryStorage::new().with_counters(counters(100)).with_channel_pts(CHANNEL, 10),
    ));
    let batch = UpdateBatch::single(UpdateEnvelope::Plain(Payload::ChannelTooLong { channel_id: CHANNEL, pts: None }));
    let (_, request) = channel_token(&e.handle_inbound(batch.into(), t0)).expect("channel difference");
    assert_eq!(request.pts, 10);
}

fn channel_delete(pts: i32, ids: Vec<i32>) -> UpdateEnvelope {
    UpdateEnvelope::ChannelScoped {
        channel_id: CHANNEL,
        pts,
        pts_count: 1,
        payload: Payload::DeleteMessages { channel_id: Some(CHANNEL), ids },
    }
}

#[test]
fn channel_delta_applies_its_deletions_directly() {
    let t0 = Instant::now();
    let mut e = engine_with(Arc::new(
        InMemoryStorage::new().with_counters(counters(100)).with_channel_pts(CHANNEL, 10),
    ));
    let batch = UpdateBatch::single(UpdateEnvelope::Plain(Payload::ChannelTooLong { channel_id: CHANNEL, pts: None }));
    let (token, _) = channel_token(&e.handle_inbound(batch.into(), t0)).expect("channel difference");

    let delta = ChannelDifference::Delta {
        pts: 13,
        new_messages: vec![channel_msg(CHANNEL, 11), channel_msg(CHANNEL, 12)],
        other_updates: vec![channel_delete(13, vec![11])],
        users: vec![],
        chats: vec![],
        is_final: true,
    };
    let jobs = e.handle_outcome(0, JobOutcome::ChannelDifference { channel_id: CHANNEL, token, result: Ok(delta) }, t0);
    assert!(jobs.is_empty());
    assert_eq!(e.channel_pts(CHANNEL), Some(13));
    assert!(e.queued(Scope::Channel(CHANNEL)).is_empty());
    assert!(e.messages().get(DialogId::channel(CHANNEL), 11).is_none(), "deletion applied");
    let d = e.dialogs().get(DialogId::channel(CHANNEL)).expect("dialog");
    assert_eq!((d.top_message_id, d.unread_count), (12, 1));
}

#[test]
fn first_channel_delta_does_not_fetch_again() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    let (token, _) = channel_token(&e.handle_inbound(channel_update(7, 51).into(), t0)).expect("channel difference");

    let delta = ChannelDifference::Delta {
        pts: 52,
        new_messages: vec![channel_msg(CHANNEL, 7), channel_msg(CHANNEL, 8)],
        other_updates: vec![channel_delete(52, vec![7])],
        users: vec![],
        chats: vec![],
        is_final: true,
    };
    let jobs = e.handle_outcome(0, JobOutcome::ChannelDifference { channel_id: CHANNEL, token, result: Ok(delta) }, t0);
    assert!(jobs.is_empty(), "unexpected jobs: {jobs:?}");
    assert_eq!(e.fetches_dispatched(), 1);
    assert_eq!(e.channel_pts(CHANNEL), Some(52));
    assert_eq!(e.fetch_state(Scope::Channel(CHANNEL)), FetchState::Idle);
    assert_eq!(e.dialogs().get(DialogId::channel(CHANNEL)).map(|d| d.top_message_id), Some(8));
}

#[test]
fn private_channel_drops_its_buffered_updates() {
    let t0 = Instant::now();
    let mut e = engine_with(Arc::new(
        InMemoryStorage::new().with_counters(counters(100)).with_channel_pts(CHANNEL, 10),
    ));
    e.handle_inbound(channel_update(3, 12).into(), t0);
    let (token, _) = channel_token(&e.tick(t0 + ms(1500))).expect("channel difference");
    e.handle_inbound(channel_update(5, 14).into(), t0 + ms(1600));

    let denied = InvocationError::Rpc(RpcError::from_server(400, "CHANNEL_PRIVATE"));
    let jobs = e.handle_outcome(
        0,
        JobOutcome::ChannelDifference { channel_id: CHANNEL, token, result: Err(denied) },
        t0 + ms(1700),
    );
    assert!(jobs.is_empty());
    assert!(e.queued(Scope::Channel(CHANNEL)).is_empty());
    assert!(channel_token(&e.tick(t0 + ms(5000))).is_none(), "nothing left to catch up on");
}

// ── Fetch failures ───────────────────────────────────────────────────────────

#[test]
fn rejected_local_state_reloads_the_baseline() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    let (token, _) = global_token(&e.handle_inbound(Inbound::TooLong, t0)).expect("difference");

    let rejected = InvocationError::Rpc(RpcError::from_server(400, "PERSISTENT_TIMESTAMP_INVALID"));
    let jobs = e.handle_outcome(0, JobOutcome::GlobalDifference { token, result: Err(rejected) }, t0);
    assert!(reset_token(&jobs).is_some());
    assert_eq!(e.fetch_state(Scope::Global), FetchState::FetchingGlobal);
}

#[test]
fn outdated_timestamp_only_rearms() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    let (token, _) = global_token(&e.handle_inbound(Inbound::TooLong, t0)).expect("difference");

    let outdated = InvocationError::Rpc(RpcError::from_server(500, "PERSISTENT_TIMESTAMP_OUTDATED"));
    let jobs = e.handle_outcome(0, JobOutcome::GlobalDifference { token, result: Err(outdated) }, t0);
    assert!(jobs.is_empty());
    assert_eq!(e.fetch_state(Scope::Global), FetchState::Idle);
}

// ── Deletions ────────────────────────────────────────────────────────────────

fn delete(pts: i32, ids: Vec<i32>) -> UpdateEnvelope {
    UpdateEnvelope::GlobalScoped { pts, pts_count: 1, payload: Payload::DeleteMessages { channel_id: None, ids } }
}

#[test]
fn deleting_the_top_falls_back_to_the_previous_message() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    e.handle_inbound(pts_update(msg(5, 1), 101, 1).into(), t0);
    e.handle_inbound(pts_update(msg(5, 2), 102, 1).into(), t0);

    e.handle_inbound(UpdateBatch::single(delete(103, vec![2])).into(), t0);
    assert_eq!(e.counters().pts, 103);
    let d = e.dialogs().get(DialogId::user(5)).expect("dialog");
    assert_eq!((d.top_message_id, d.last_message_date), (1, 1001));
    assert!(!d.top_message_deleted);
    assert_eq!(d.unread_count, 1);
}

#[test]
fn difference_deletions_apply_after_its_messages() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    e.handle_inbound(pts_update(msg(5, 1), 101, 1).into(), t0);
    e.handle_inbound(pts_update(msg(5, 2), 102, 1).into(), t0);
    let (token, _) = global_token(&e.handle_inbound(Inbound::TooLong, t0)).expect("difference");

    let diff = GlobalDifference::Full {
        new_messages:  vec![msg(5, 3)],
        other_updates: vec![delete(104, vec![2, 3])],
        users:         vec![],
        chats:         vec![],
        state:         counters(104),
    };
    let jobs = e.handle_outcome(0, JobOutcome::GlobalDifference { token, result: Ok(diff) }, t0);
    assert!(jobs.is_empty());
    assert_eq!(e.counters().pts, 104);
    assert!(e.messages().get(DialogId::user(5), 2).is_none());
    assert!(e.messages().get(DialogId::user(5), 3).is_none());
    let d = e.dialogs().get(DialogId::user(5)).expect("dialog");
    assert_eq!((d.top_message_id, d.last_message_date, d.unread_count), (1, 1001, 1));
    assert!(!d.top_message_deleted);
}

// ── Message pointers ─────────────────────────────────────────────────────────

#[test]
fn read_pointers_are_trimmed_per_dialog() {
    let t0 = Instant::now();
    let storage = Arc::new(InMemoryStorage::new().with_counters(counters(100)));
    let config = SyncConfig::default().self_user(1).pointers_per_dialog(2);
    let mut e = SyncEngine::new(config, storage, directory());

    for id in 1..=6 {
        e.handle_inbound(pts_update(msg(5, id), 100 + id, 1).into(), t0);
    }
    e.handle_inbound(read_inbox(5, 6, 107).into(), t0);
    e.handle_inbound(pts_update(msg(5, 7), 108, 1).into(), t0);

    assert_eq!(e.messages().len(), 2);
    assert!(e.messages().get(DialogId::user(5), 7).is_some());
    assert!(e.messages().get(DialogId::user(5), 6).is_some());
    assert!(e.messages().get(DialogId::user(5), 1).is_none());
    assert_eq!(e.dialogs().get(DialogId::user(5)).map(|d| d.unread_count), Some(1));
}

// ── Seq containers ───────────────────────────────────────────────────────────

#[test]
fn seq_containers_apply_in_order() {
    let t0 = Instant::now();
    let mut e = engine_at(100);

    let later = UpdateBatch::of(vec![UpdateEnvelope::new_message(msg(5, 2), 102, 1)]).with_seq(3, 3, 70);
    e.handle_inbound(later.into(), t0);
    assert_eq!(e.queued_batches(), 1);
    assert_eq!(e.counters().seq, 1);

    let first = UpdateBatch::of(vec![UpdateEnvelope::new_message(msg(5, 1), 101, 1)]).with_seq(2, 2, 60);
    e.handle_inbound(first.into(), t0);
    assert_eq!(e.queued_batches(), 0);
    assert_eq!(e.counters(), CounterSnapshot { pts: 102, qts: 1, date: 70, seq: 3 });
}

// ── Secret chats ─────────────────────────────────────────────────────────────

fn secret_message(id: i32, date: i32, qts: i32) -> UpdateBatch {
    let m = layer_sync::Message {
        id,
        peer: Some(Peer::Secret(9)),
        from_id: Some(5),
        date,
        ..Default::default()
    };
    UpdateBatch::single(UpdateEnvelope::QtsScoped { qts, payload: Payload::NewMessage(m) })
}

#[test]
fn secret_chat_messages_follow_qts_and_date_order() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    e.handle_inbound(secret_message(10, 60, 3).into(), t0);
    assert_eq!(e.counters().qts, 1, "qts 3 waits for qts 2");

    e.handle_inbound(secret_message(900, 50, 2).into(), t0);
    assert_eq!(e.counters().qts, 3);
    assert_eq!(e.counters().pts, 100);

    // Ids are not comparable in secret chats; the later date wins.
    let d = e.dialogs().get(DialogId::secret(9)).expect("secret dialog");
    assert_eq!((d.top_message_id, d.last_message_date), (10, 60));
}

// ── Read state ───────────────────────────────────────────────────────────────

#[test]
fn read_inbox_up_to_top_clears_unread() {
    let t0 = Instant::now();
    let stored = Dialog { unread_count: 10, ..dialog(5, 50, 900) };
    let mut e = engine_with(storage_with(100, &[stored]));

    e.handle_inbound(read_inbox(5, 50, 101).into(), t0);
    let d = e.dialogs().get(DialogId(5)).expect("dialog");
    assert_eq!((d.read_inbox_max, d.unread_count), (50, 0));

    let events = e.take_events();
    assert!(events.iter().any(|ev| matches!(
        ev,
        Event::ReadStateChanged { dialog_id, read_inbox_max: 50, unread_count: 0, .. } if *dialog_id == DialogId(5)
    )));
}

#[test]
fn read_markers_never_move_backwards() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    for id in 1..=4 {
        e.handle_inbound(pts_update(msg(5, id), 100 + id, 1).into(), t0);
    }
    e.handle_inbound(read_inbox(5, 3, 105).into(), t0);
    e.handle_inbound(read_inbox(5, 2, 106).into(), t0);

    let d = e.dialogs().get(DialogId(5)).expect("dialog");
    assert_eq!(d.read_inbox_max, 3);
    assert_eq!(d.unread_count, 1);
}

#[test]
fn own_messages_never_count_as_unread() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    let mut mine = msg(5, 1);
    mine.from_id = Some(1);
    e.handle_inbound(pts_update(mine, 101, 1).into(), t0);

    assert_eq!(e.dialogs().get(DialogId(5)).map(|d| d.unread_count), Some(0));
    assert!(!e.take_events().iter().any(|ev| matches!(ev, Event::MessagesReceived { .. })));
}

// ── Entities ─────────────────────────────────────────────────────────────────

#[test]
fn unknown_sender_parks_the_update_until_resolved() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    let jobs = e.handle_inbound(pts_update(msg(99, 1), 101, 1).into(), t0);

    let (ticket, peers) = jobs
        .iter()
        .find_map(|j| match j {
            Job::ResolveEntities { ticket, peers } => Some((*ticket, peers.clone())),
            _ => None,
        })
        .expect("entity load requested");
    assert_eq!(peers, vec![Peer::User(99)]);
    assert_eq!(e.counters().pts, 100, "counter held until the payload applies");

    let resolved = ResolvedEntities { users: vec![user(99)], chats: vec![] };
    e.handle_outcome(0, JobOutcome::Entities { ticket, result: Ok(resolved) }, t0);
    assert_eq!(e.counters().pts, 101);
    assert!(e.dialogs().get(DialogId(99)).is_some());
}

#[test]
fn failed_entity_load_falls_back_to_difference() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    let jobs = e.handle_inbound(pts_update(msg(99, 1), 101, 1).into(), t0);
    let ticket = jobs
        .iter()
        .find_map(|j| match j {
            Job::ResolveEntities { ticket, .. } => Some(*ticket),
            _ => None,
        })
        .expect("entity load requested");

    let jobs = e.handle_outcome(0, JobOutcome::Entities { ticket, result: Err(InvocationError::Dropped) }, t0);
    assert!(global_token(&jobs).is_some());
}

// ── Unsequenced ──────────────────────────────────────────────────────────────

#[test]
fn typing_is_forwarded_without_touching_counters() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    let batch = UpdateBatch::single(UpdateEnvelope::Plain(Payload::Typing { peer: Peer::User(5), user_id: 5 }));
    e.handle_inbound(batch.into(), t0);

    assert_eq!(e.counters().pts, 100);
    assert!(e
        .take_events()
        .contains(&Event::Typing { dialog_id: DialogId(5), user_id: 5 }));
}

#[test]
fn state_only_update_fetches_difference() {
    let t0 = Instant::now();
    let mut e = engine_at(100);
    let jobs = e.handle_inbound(UpdateBatch::single(UpdateEnvelope::StateOnly).into(), t0);
    assert!(global_token(&jobs).is_some());
}

// ── Dialog actions ───────────────────────────────────────────────────────────

#[test]
fn deletion_hides_then_removes() {
    let t0 = Instant::now();
    let mut e = engine_with(storage_with(100, &[dialog(5, 1, 900), dialog(6, 1, 800)]));
    let jobs = e.delete_dialog(DialogId(5), t0);
    assert_eq!(jobs, vec![Job::DeleteDialog { dialog_id: DialogId(5) }]);
    assert_eq!(e.snapshot().main_list(), &[DialogId(6)]);

    e.handle_outcome(0, JobOutcome::DialogDeleted { dialog_id: DialogId(5), result: Ok(()) }, t0);
    assert!(e.dialogs().get(DialogId(5)).is_none());
}

#[test]
fn failed_deletion_restores_the_dialog() {
    let t0 = Instant::now();
    let mut e = engine_with(storage_with(100, &[dialog(5, 1, 900), dialog(6, 1, 800)]));
    e.delete_dialog(DialogId(5), t0);
    e.handle_outcome(
        0,
        JobOutcome::DialogDeleted { dialog_id: DialogId(5), result: Err(InvocationError::Timeout) },
        t0,
    );
    assert_eq!(e.snapshot().main_list(), &[DialogId(5), DialogId(6)]);
}

#[test]
fn pin_and_draft_reorder_the_list() {
    let t0 = Instant::now();
    let mut e = engine_with(storage_with(100, &[dialog(5, 1, 900), dialog(6, 1, 800), dialog(7, 1, 700)]));

    e.set_draft(DialogId(7), Some(1000), t0);
    assert_eq!(e.snapshot().main_list(), &[DialogId(7), DialogId(5), DialogId(6)]);

    e.pin_dialog(DialogId(6), true, t0);
    assert_eq!(e.snapshot().main_list(), &[DialogId(6), DialogId(7), DialogId(5)]);
}

#[test]
fn archived_dialogs_collapse_into_a_folder_row() {
    let t0 = Instant::now();
    let mut e = engine_with(storage_with(100, &[dialog(5, 1, 900), dialog(6, 1, 800)]));
    e.move_to_folder(DialogId(6), 1, t0);

    let snapshot = e.snapshot();
    assert_eq!(snapshot.main_list(), &[DialogId::folder(1), DialogId(5)]);
    assert_eq!(snapshot.folders.get(&1), Some(&vec![DialogId(6)]));
}

#[test]
fn filter_list_follows_membership_changes() {
    let t0 = Instant::now();
    let mut e = engine_with(storage_with(100, &[dialog(5, 1, 900), dialog(6, 1, 800)]));
    e.set_filter(DialogFilter::new(3, "unread", flags::NON_CONTACTS | flags::EXCLUDE_READ), t0);
    assert!(e.filters().derived(3).is_empty());

    e.handle_inbound(pts_update(msg(6, 2), 101, 1).into(), t0);
    assert_eq!(e.filters().derived(3), &[DialogId(6)]);
    assert_eq!(e.snapshot().filters.get(&3), Some(&vec![DialogId(6)]));

    e.read_history(DialogId(6), 2, t0);
    assert!(e.filters().derived(3).is_empty());
}

#[test]
fn changed_dialogs_are_persisted() {
    let t0 = Instant::now();
    let storage = Arc::new(InMemoryStorage::new().with_counters(counters(100)));
    let mut e = engine_with(Arc::clone(&storage));
    e.handle_inbound(pts_update(msg(5, 1), 101, 1).into(), t0);
    assert_eq!(storage.dialog(DialogId(5)).map(|d| d.top_message_id), Some(1));
}
