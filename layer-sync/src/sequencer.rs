//! The single-writer task that owns a [`SyncEngine`].
//!
//! Inbound batches, user actions, fetch results and the periodic tick all
//! arrive as commands on one channel and are handled strictly one at a time,
//! so no engine structure is ever read while it is being mutated.  Fetches run
//! on spawned tasks and post their results back onto the same channel, tagged
//! with the generation they were dispatched under.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::dialogs::DialogListSnapshot;
use crate::engine::{Baseline, Job, JobOutcome, SyncEngine};
use crate::entities::EntityDirectory;
use crate::errors::InvocationError;
use crate::events::{Event, EventStream};
use crate::filters::DialogFilter;
use crate::storage::Storage;
use crate::transport::Transport;
use crate::types::{CounterSnapshot, DialogId, MessageId};
use crate::update::Inbound;

enum Command {
    Inbound(Inbound),
    Pin { dialog_id: DialogId, pinned: bool },
    ReorderPinned { folder_id: i32, order: Vec<DialogId> },
    MoveToFolder { dialog_id: DialogId, folder_id: i32 },
    SetDraft { dialog_id: DialogId, date: Option<i32> },
    MarkUnread { dialog_id: DialogId, unread: bool },
    ReadHistory { dialog_id: DialogId, max_id: MessageId },
    DeleteDialog(DialogId),
    SetFilter(DialogFilter),
    RemoveFilter(i32),
    Snapshot(oneshot::Sender<Arc<DialogListSnapshot>>),
    Counters(oneshot::Sender<CounterSnapshot>),
    ResetSession,
}

/// A fetch result on its way back to the sequencer.
struct Completed {
    generation: u64,
    outcome:    JobOutcome,
}

// ─── SyncHandle ───────────────────────────────────────────────────────────────

/// Cheap, cloneable entry point into a running sequencer.
#[derive(Clone)]
pub struct SyncHandle {
    tx:       mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
}

impl SyncHandle {
    /// Spawn the sequencer on the current tokio runtime.
    ///
    /// Counters and dialogs are restored from `storage`; the sequencer then
    /// catches up on its own (difference if counters exist, full baseline
    /// otherwise).  The sequencer stops on [`shutdown`](Self::shutdown) or
    /// once every handle is dropped.
    pub fn start<T: Transport>(
        transport: Arc<T>,
        storage:   Arc<dyn Storage>,
        directory: Arc<dyn EntityDirectory>,
        config:    SyncConfig,
    ) -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let engine = SyncEngine::new(config, storage, directory);
        tokio::spawn(run(engine, transport, rx, event_tx, shutdown.clone()));
        (Self { tx, shutdown }, EventStream { rx: event_rx })
    }

    /// Deliver whatever the transport received.
    pub fn push_updates(&self, inbound: impl Into<Inbound>) -> Result<(), InvocationError> {
        self.send(Command::Inbound(inbound.into()))
    }

    pub fn pin_dialog(&self, dialog_id: DialogId, pinned: bool) -> Result<(), InvocationError> {
        self.send(Command::Pin { dialog_id, pinned })
    }

    /// Replace a folder's pinned order, top first.
    pub fn reorder_pinned(&self, folder_id: i32, order: Vec<DialogId>) -> Result<(), InvocationError> {
        self.send(Command::ReorderPinned { folder_id, order })
    }

    pub fn move_to_folder(&self, dialog_id: DialogId, folder_id: i32) -> Result<(), InvocationError> {
        self.send(Command::MoveToFolder { dialog_id, folder_id })
    }

    pub fn set_draft(&self, dialog_id: DialogId, date: Option<i32>) -> Result<(), InvocationError> {
        self.send(Command::SetDraft { dialog_id, date })
    }

    pub fn mark_unread(&self, dialog_id: DialogId, unread: bool) -> Result<(), InvocationError> {
        self.send(Command::MarkUnread { dialog_id, unread })
    }

    pub fn read_history(&self, dialog_id: DialogId, max_id: MessageId) -> Result<(), InvocationError> {
        self.send(Command::ReadHistory { dialog_id, max_id })
    }

    /// Hide the dialog at once and delete it server-side; it comes back if
    /// the deletion fails.
    pub fn delete_dialog(&self, dialog_id: DialogId) -> Result<(), InvocationError> {
        self.send(Command::DeleteDialog(dialog_id))
    }

    pub fn set_filter(&self, filter: DialogFilter) -> Result<(), InvocationError> {
        self.send(Command::SetFilter(filter))
    }

    pub fn remove_filter(&self, id: i32) -> Result<(), InvocationError> {
        self.send(Command::RemoveFilter(id))
    }

    /// Drop in-flight fetches and buffered updates, then catch up again.
    pub fn reset_session(&self) -> Result<(), InvocationError> {
        self.send(Command::ResetSession)
    }

    /// Current dialog list, after every command sent before this one.
    pub async fn snapshot(&self) -> Result<Arc<DialogListSnapshot>, InvocationError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| InvocationError::Dropped)
    }

    pub async fn counters(&self) -> Result<CounterSnapshot, InvocationError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Counters(tx))?;
        rx.await.map_err(|_| InvocationError::Dropped)
    }

    /// Stop the sequencer.  In-flight fetches finish but their results are
    /// ignored.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, cmd: Command) -> Result<(), InvocationError> {
        self.tx.send(cmd).map_err(|_| InvocationError::Dropped)
    }
}

// ─── Sequencer loop ───────────────────────────────────────────────────────────

async fn run<T: Transport>(
    mut engine: SyncEngine,
    transport:  Arc<T>,
    mut rx:     mpsc::UnboundedReceiver<Command>,
    events:     mpsc::UnboundedSender<Event>,
    shutdown:   CancellationToken,
) {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completed>();
    let mut ticker = tokio::time::interval(engine.config().tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let jobs = engine.start(Instant::now());
    dispatch(&engine, &transport, &done_tx, jobs);
    publish(&mut engine, &events);

    loop {
        let jobs = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => engine.tick(Instant::now()),
            Some(done) = done_rx.recv() => engine.handle_outcome(done.generation, done.outcome, Instant::now()),
            cmd = rx.recv() => match cmd {
                Some(cmd) => handle(&mut engine, cmd),
                None => break,
            },
        };
        dispatch(&engine, &transport, &done_tx, jobs);
        publish(&mut engine, &events);
    }
    tracing::info!("[layer-sync] sequencer stopped");
}

fn handle(engine: &mut SyncEngine, cmd: Command) -> Vec<Job> {
    let now = Instant::now();
    match cmd {
        Command::Inbound(inbound) => engine.handle_inbound(inbound, now),
        Command::Pin { dialog_id, pinned } => engine.pin_dialog(dialog_id, pinned, now),
        Command::ReorderPinned { folder_id, order } => engine.reorder_pinned(folder_id, &order, now),
        Command::MoveToFolder { dialog_id, folder_id } => engine.move_to_folder(dialog_id, folder_id, now),
        Command::SetDraft { dialog_id, date } => engine.set_draft(dialog_id, date, now),
        Command::MarkUnread { dialog_id, unread } => engine.mark_unread(dialog_id, unread, now),
        Command::ReadHistory { dialog_id, max_id } => engine.read_history(dialog_id, max_id, now),
        Command::DeleteDialog(dialog_id) => engine.delete_dialog(dialog_id, now),
        Command::SetFilter(filter) => engine.set_filter(filter, now),
        Command::RemoveFilter(id) => engine.remove_filter(id, now),
        Command::Snapshot(reply) => {
            let _ = reply.send(Arc::new(engine.snapshot()));
            Vec::new()
        }
        Command::Counters(reply) => {
            let _ = reply.send(engine.counters());
            Vec::new()
        }
        Command::ResetSession => {
            engine.reset_session();
            engine.start(now)
        }
    }
}

fn publish(engine: &mut SyncEngine, events: &mpsc::UnboundedSender<Event>) {
    for event in engine.take_events() {
        // Nobody listening is fine; the engine keeps running.
        let _ = events.send(event);
    }
}

fn dispatch<T: Transport>(
    engine:    &SyncEngine,
    transport: &Arc<T>,
    done:      &mpsc::UnboundedSender<Completed>,
    jobs:      Vec<Job>,
) {
    let generation = engine.generation();
    let timeout = engine.config().fetch_timeout;
    for job in jobs {
        let transport = Arc::clone(transport);
        let done = done.clone();
        tokio::spawn(async move {
            let outcome = run_job(&*transport, job, timeout).await;
            let _ = done.send(Completed { generation, outcome });
        });
    }
}

async fn run_job<T: Transport>(transport: &T, job: Job, timeout: Duration) -> JobOutcome {
    match job {
        Job::GlobalDifference { token, request } => JobOutcome::GlobalDifference {
            token,
            result: bounded(timeout, transport.get_difference(request)).await,
        },
        Job::ChannelDifference { token, request } => JobOutcome::ChannelDifference {
            channel_id: request.channel_id,
            token,
            result: bounded(timeout, transport.get_channel_difference(request)).await,
        },
        Job::Reset { token, dialogs_limit } => {
            let fetch = async {
                let (dialogs, pinned, state) = tokio::try_join!(
                    transport.get_dialogs(dialogs_limit),
                    transport.get_pinned_dialogs(0),
                    transport.get_state(),
                )?;
                Ok::<_, InvocationError>(Baseline { dialogs, pinned, state })
            };
            JobOutcome::Reset { token, result: bounded(timeout, fetch).await }
        }
        Job::ResolveEntities { ticket, peers } => JobOutcome::Entities {
            ticket,
            result: bounded(timeout, transport.resolve_entities(peers)).await,
        },
        Job::DeleteDialog { dialog_id } => JobOutcome::DialogDeleted {
            dialog_id,
            result: bounded(timeout, transport.delete_dialog(dialog_id)).await,
        },
    }
}

async fn bounded<R>(
    limit: Duration,
    fut:   impl Future<Output = Result<R, InvocationError>>,
) -> Result<R, InvocationError> {
    tokio::time::timeout(limit, fut).await.unwrap_or(Err(InvocationError::Timeout))
}
