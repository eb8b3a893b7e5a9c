//! # layer-sync
//!
//! Client-side update reconciliation and dialog synchronization.
//!
//! The server pushes a best-effort stream of updates: they can arrive out of
//! order, twice, or not at all.  This crate keeps a local dialog list and
//! message-pointer index consistent with the server anyway.
//!
//! ## Features
//! - `pts` / `qts` / `seq` and per-channel `pts` tracking with gap detection
//! - Per-scope gap queues that replay buffered updates once predecessors arrive
//! - Bounded wait before a forced `getDifference` / `getChannelDifference`
//! - Full reset on `TooLong` (dialogs + pinned dialogs + state, fetched together)
//! - Unread accounting, read markers, top-message tracking and de-duplication
//! - Canonical dialog ordering with folders, pins and drafts
//! - Dialog filters with include/exclude lists and category flags
//! - Single-writer sequencer task; stale responses dropped by generation
//! - Pluggable storage ([`InMemoryStorage`], `SqliteStorage` behind
//!   `sqlite-storage`) and entity directory
//!
//! ## Example
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use layer_sync::*;
//! # async fn demo<T: Transport>(transport: Arc<T>) {
//! let (handle, mut events) = SyncHandle::start(
//!     transport,
//!     Arc::new(InMemoryStorage::new()),
//!     Arc::new(InMemoryDirectory::new()),
//!     SyncConfig::default().self_user(42),
//! );
//! while let Some(event) = events.next().await {
//!     if let Event::DialogsChanged(list) = event {
//!         println!("{} dialogs", list.dialogs.len());
//!     }
//! }
//! # handle.shutdown();
//! # }
//! ```

#![deny(unsafe_code)]

mod applier;
mod config;
mod difference;
mod engine;
mod errors;
mod sequencer;
pub mod dialogs;
pub mod entities;
pub mod events;
pub mod filters;
pub mod gap_queue;
pub mod message_index;
pub mod sequence;
pub mod sorter;
pub mod storage;
pub mod transport;
pub mod types;
pub mod update;

pub use applier::{ChangeSet, UpdateApplier, unresolved_peers};
pub use config::SyncConfig;
pub use dialogs::{DialogListSnapshot, DialogStore};
pub use difference::{DifferenceFetcher, FetchState, FetchToken};
pub use engine::{Baseline, Job, JobOutcome, SyncEngine};
pub use entities::{EntityDirectory, InMemoryDirectory};
pub use errors::{InvocationError, RpcError, Scope, SyncError};
pub use events::{Event, EventStream};
pub use filters::{DialogFilter, FilterEngine};
pub use gap_queue::GapQueue;
pub use message_index::MessageIndex;
pub use sequence::{ApplyOutcome, SequenceKind, SequenceState};
pub use sequencer::SyncHandle;
pub use sorter::DialogSorter;
pub use storage::{InMemoryStorage, Storage};
#[cfg(feature = "sqlite-storage")]
pub use storage::SqliteStorage;
pub use transport::{
    ChannelDifference, ChannelDifferenceRequest, DialogsSnapshot, DifferenceRequest, GlobalDifference,
    ResolvedEntities, Transport,
};
pub use types::{
    ARCHIVE_FOLDER_ID, Chat, ChatKind, CounterSnapshot, Dialog, DialogId, Message, MessageId, MessagePointer,
    NotifySettings, Peer, PeerKind, TopOrdering, User,
};
pub use update::{Inbound, Payload, UpdateBatch, UpdateEnvelope};
