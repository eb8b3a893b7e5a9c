//! layer-sync-app: watch the engine converge over a lossy update stream.
//!
//! A simulated server produces private and channel messages, then pushes
//! them through a "network" that drops, delays and duplicates updates.
//! The engine buffers what it can, fetches differences for the rest, and
//! ends up in the same state as the server.
//!
//!   RUST_LOG=layer_sync=debug cargo run -p layer-sync-app

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use layer_sync::{
    ChannelDifference, ChannelDifferenceRequest, Chat, ChatKind, CounterSnapshot, DialogId, DialogsSnapshot,
    DifferenceRequest, Event, GlobalDifference, InMemoryDirectory, Inbound, InMemoryStorage, InvocationError, Message,
    Peer, ResolvedEntities, SyncConfig, SyncHandle, Transport, UpdateBatch, UpdateEnvelope, User,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ── Simulation knobs ──────────────────────────────────────────────────────────
const RUN_FOR:      Duration = Duration::from_secs(8);
const SEND_EVERY:   Duration = Duration::from_millis(80);
const DROP_RATE:    f64 = 0.10;
const DELAY_RATE:   f64 = 0.20;
const DUP_RATE:     f64 = 0.05;
const CHANNEL_RATE: f64 = 0.30;
const SELF_ID:      i64 = 1;
const CHANNEL_ID:   i64 = 77;
const CONTACTS:     [i64; 4] = [2, 3, 4, 5];
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("layer_sync=info")).init();

    let seed = std::env::args().nth(1).and_then(|s| s.parse().ok()).unwrap_or(7);
    if let Err(e) = run(seed).await {
        eprintln!("\n✗ {e}");
        std::process::exit(1);
    }
}

async fn run(seed: u64) -> Result<(), Box<dyn std::error::Error>> {
    let server = Arc::new(SimServer::new());
    let directory = Arc::new(
        InMemoryDirectory::new()
            .with_users(std::iter::once(user(SELF_ID)).chain(CONTACTS.iter().map(|&id| user(id))))
            .with_chats([channel()]),
    );
    let (handle, mut events) = SyncHandle::start(
        Arc::clone(&server),
        Arc::new(InMemoryStorage::new()),
        directory,
        SyncConfig::default().self_user(SELF_ID),
    );

    println!("🛰  seed={seed}: dropping {:.0}%, delaying {:.0}% of updates\n", DROP_RATE * 100.0, DELAY_RATE * 100.0);
    let producer = tokio::spawn(produce(Arc::clone(&server), handle.clone(), seed));

    let deadline = tokio::time::sleep(RUN_FOR);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            ev = events.next() => match ev {
                Some(ev) => print_event(&ev),
                None => break,
            },
        }
    }
    producer.abort();

    // Updates lost at the very end leave no gap behind them; ask for a
    // difference so the tail is fetched too.
    handle.push_updates(Inbound::TooLong)?;
    tokio::time::sleep(Duration::from_secs(3)).await;
    let local = handle.counters().await?;
    let remote = server.counters();
    let list = handle.snapshot().await?;
    handle.shutdown();

    println!("\n── Final dialog list ──");
    for d in &list.dialogs {
        println!("  {:>6}  top={:<4} unread={}", d.id.to_string(), d.top_message_id, d.unread_count);
    }
    println!("\nserver pts={}, local pts={}", remote.pts, local.pts);
    if local.pts == remote.pts {
        println!("✅ converged");
    } else {
        println!("⚠️  still catching up");
    }
    Ok(())
}

fn print_event(ev: &Event) {
    let at = chrono::Local::now().format("%H:%M:%S%.3f");
    match ev {
        Event::MessagesReceived { dialog_id, messages } => {
            let ids: Vec<i32> = messages.iter().map(|m| m.id).collect();
            println!("{at} 📨 {dialog_id}: {ids:?}");
        }
        Event::ReadStateChanged { dialog_id, unread_count, .. } => {
            println!("{at} 👀 {dialog_id}: unread={unread_count}");
        }
        Event::DialogsChanged(list) => {
            let top: Vec<String> = list.main_list().iter().take(3).map(|id| id.to_string()).collect();
            println!("{at} 📋 v{} top: {}", list.version, top.join(", "));
        }
        _ => {}
    }
}

// ── Producer ─────────────────────────────────────────────────────────────────

async fn produce(server: Arc<SimServer>, handle: SyncHandle, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut held: Vec<UpdateBatch> = Vec::new();
    let mut ticker = tokio::time::interval(SEND_EVERY);
    loop {
        ticker.tick().await;
        let batch = if rng.gen_bool(CHANNEL_RATE) {
            server.channel_post()
        } else {
            let from = CONTACTS[rng.gen_range(0..CONTACTS.len())];
            server.private_message(from)
        };

        let mut out = Vec::new();
        if rng.gen_bool(DROP_RATE) {
            // lost
        } else if rng.gen_bool(DELAY_RATE) {
            held.push(batch);
        } else {
            if rng.gen_bool(DUP_RATE) {
                out.push(batch.clone());
            }
            out.push(batch);
        }
        if !held.is_empty() && rng.gen_bool(0.3) {
            out.extend(held.drain(..).rev());
        }
        for b in out {
            if handle.push_updates(b).is_err() {
                return;
            }
        }
    }
}

// ── SimServer ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct World {
    pts:          i32,
    date:         i32,
    next_id:      i32,
    log:          Vec<(i32, Message)>,
    channel_pts:  i32,
    next_post_id: i32,
    channel_log:  Vec<(i32, Message)>,
}

/// In-process stand-in for the server: the source of truth for every update.
struct SimServer {
    world: Mutex<World>,
}

impl SimServer {
    fn new() -> Self {
        Self { world: Mutex::new(World { pts: 1, date: 1, channel_pts: 1, ..Default::default() }) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn counters(&self) -> CounterSnapshot {
        let w = self.lock();
        CounterSnapshot { pts: w.pts, qts: 1, date: w.date, seq: 1 }
    }

    fn private_message(&self, from: i64) -> UpdateBatch {
        let mut w = self.lock();
        w.pts += 1;
        w.next_id += 1;
        w.date = chrono::Utc::now().timestamp() as i32;
        let m = Message {
            id:      w.next_id,
            peer:    Some(Peer::User(from)),
            from_id: Some(from),
            date:    w.date,
            text:    format!("hello #{}", w.next_id),
            ..Default::default()
        };
        let pts = w.pts;
        w.log.push((pts, m.clone()));
        UpdateBatch::single(UpdateEnvelope::new_message(m, pts, 1))
    }

    fn channel_post(&self) -> UpdateBatch {
        let mut w = self.lock();
        w.channel_pts += 1;
        w.next_post_id += 1;
        let m = Message {
            id:   w.next_post_id,
            peer: Some(Peer::Channel(CHANNEL_ID)),
            date: chrono::Utc::now().timestamp() as i32,
            text: format!("post #{}", w.next_post_id),
            ..Default::default()
        };
        let pts = w.channel_pts;
        w.channel_log.push((pts, m.clone()));
        UpdateBatch::single(UpdateEnvelope::new_message(m, pts, 1))
    }
}

fn since(log: &[(i32, Message)], pts: i32) -> Vec<Message> {
    log.iter().filter(|(p, _)| *p > pts).map(|(_, m)| m.clone()).collect()
}

impl Transport for SimServer {
    fn get_state(&self) -> impl Future<Output = Result<CounterSnapshot, InvocationError>> + Send {
        let state = self.counters();
        async move { Ok(state) }
    }

    fn get_difference(
        &self,
        req: DifferenceRequest,
    ) -> impl Future<Output = Result<GlobalDifference, InvocationError>> + Send {
        let diff = {
            let w = self.lock();
            let state = CounterSnapshot { pts: w.pts, qts: 1, date: w.date, seq: 1 };
            if req.pts >= w.pts {
                GlobalDifference::Empty { date: w.date, seq: 1 }
            } else {
                GlobalDifference::Full {
                    new_messages:  since(&w.log, req.pts),
                    other_updates: Vec::new(),
                    users:         Vec::new(),
                    chats:         Vec::new(),
                    state,
                }
            }
        };
        async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            Ok(diff)
        }
    }

    fn get_channel_difference(
        &self,
        req: ChannelDifferenceRequest,
    ) -> impl Future<Output = Result<ChannelDifference, InvocationError>> + Send {
        let diff = {
            let w = self.lock();
            ChannelDifference::Delta {
                pts:           w.channel_pts,
                new_messages:  since(&w.channel_log, req.pts),
                other_updates: Vec::new(),
                users:         Vec::new(),
                chats:         vec![channel()],
                is_final:      true,
            }
        };
        async move { Ok(diff) }
    }

    fn get_dialogs(&self, _limit: i32) -> impl Future<Output = Result<DialogsSnapshot, InvocationError>> + Send {
        async move { Ok(DialogsSnapshot::default()) }
    }

    fn get_pinned_dialogs(
        &self,
        _folder_id: i32,
    ) -> impl Future<Output = Result<DialogsSnapshot, InvocationError>> + Send {
        async move { Ok(DialogsSnapshot::default()) }
    }

    fn resolve_entities(
        &self,
        peers: Vec<Peer>,
    ) -> impl Future<Output = Result<ResolvedEntities, InvocationError>> + Send {
        let users = peers
            .into_iter()
            .filter_map(|p| match p {
                Peer::User(id) => Some(user(id)),
                _ => None,
            })
            .collect();
        async move { Ok(ResolvedEntities { users, chats: vec![channel()] }) }
    }

    fn delete_dialog(&self, dialog_id: DialogId) -> impl Future<Output = Result<(), InvocationError>> + Send {
        println!("🗑  server: delete {dialog_id}");
        async move { Ok(()) }
    }
}

fn user(id: i64) -> User {
    User { id, is_self: id == SELF_ID, contact: id != SELF_ID, name: format!("user{id}"), ..Default::default() }
}

fn channel() -> Chat {
    Chat {
        id:          CHANNEL_ID,
        kind:        ChatKind::Channel { megagroup: false },
        title:       "news".into(),
        migrated_to: None,
        left:        false,
    }
}
