//! Pluggable durable storage for counters and dialogs.
//!
//! The [`Storage`] trait abstracts over persistence so that callers can swap
//! in an SQLite store, the application's own database, an in-memory store, or
//! anything else.  The engine writes counters through on every advance, so
//! implementations should be cheap for small writes.
//!
//! Two built-in backends are provided:
//! * [`InMemoryStorage`]: nothing survives the process (default, tests).
//! * [`SqliteStorage`]: SQLite (requires the `sqlite-storage` Cargo feature).

use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, PoisonError};

use crate::types::{CounterSnapshot, Dialog, DialogId, MessageId};

// ─── Trait ────────────────────────────────────────────────────────────────────

/// Where and how engine state is persisted between sessions.
pub trait Storage: Send + Sync {
    /// Persist (insert or replace) the given dialogs.
    fn persist_dialogs(&self, dialogs: &[Dialog]) -> io::Result<()>;

    /// Forget dialogs whose deletion completed.
    fn delete_dialogs(&self, ids: &[DialogId]) -> io::Result<()>;

    /// Every persisted dialog, used to warm the store on cold start.
    fn load_dialogs(&self) -> io::Result<Vec<Dialog>>;

    /// Persist the global counters.
    fn persist_counters(&self, counters: CounterSnapshot) -> io::Result<()>;

    /// Previously persisted global counters, or `None` on first run.
    fn load_counters(&self) -> io::Result<Option<CounterSnapshot>>;

    fn persist_channel_pts(&self, channel_id: i64, pts: i32) -> io::Result<()>;

    /// `None` if this channel's pts was never persisted.
    fn load_channel_pts(&self, channel_id: i64) -> io::Result<Option<i32>>;

    /// Persisted read marker for a dialog; `outbound` selects the outbox one.
    fn read_dialog_read_max(&self, outbound: bool, dialog_id: DialogId) -> io::Result<Option<MessageId>>;

    /// Human-readable name of this backend (for log messages).
    fn name(&self) -> &str;
}

// ─── InMemoryStorage ──────────────────────────────────────────────────────────

/// An ephemeral backend that stores nothing on disk.
///
/// Useful for testing or for clients that always start with a full sync.
#[derive(Default)]
pub struct InMemoryStorage {
    data: Mutex<MemoryData>,
}

#[derive(Default)]
struct MemoryData {
    counters:    Option<CounterSnapshot>,
    channel_pts: HashMap<i64, i32>,
    dialogs:     HashMap<DialogId, Dialog>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed a channel pts, as if persisted by an earlier session.
    pub fn with_channel_pts(self, channel_id: i64, pts: i32) -> Self {
        self.lock().channel_pts.insert(channel_id, pts);
        self
    }

    /// Pre-seed the global counters.
    pub fn with_counters(self, counters: CounterSnapshot) -> Self {
        self.lock().counters = Some(counters);
        self
    }

    /// Number of persisted dialogs.
    pub fn dialog_count(&self) -> usize {
        self.lock().dialogs.len()
    }

    /// Persisted copy of a dialog.
    pub fn dialog(&self, id: DialogId) -> Option<Dialog> {
        self.lock().dialogs.get(&id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Storage for InMemoryStorage {
    fn persist_dialogs(&self, dialogs: &[Dialog]) -> io::Result<()> {
        let mut data = self.lock();
        for d in dialogs {
            data.dialogs.insert(d.id, d.clone());
        }
        Ok(())
    }

    fn delete_dialogs(&self, ids: &[DialogId]) -> io::Result<()> {
        let mut data = self.lock();
        for id in ids {
            data.dialogs.remove(id);
        }
        Ok(())
    }

    fn load_dialogs(&self) -> io::Result<Vec<Dialog>> {
        Ok(self.lock().dialogs.values().cloned().collect())
    }

    fn persist_counters(&self, counters: CounterSnapshot) -> io::Result<()> {
        self.lock().counters = Some(counters);
        Ok(())
    }

    fn load_counters(&self) -> io::Result<Option<CounterSnapshot>> {
        Ok(self.lock().counters)
    }

    fn persist_channel_pts(&self, channel_id: i64, pts: i32) -> io::Result<()> {
        self.lock().channel_pts.insert(channel_id, pts);
        Ok(())
    }

    fn load_channel_pts(&self, channel_id: i64) -> io::Result<Option<i32>> {
        Ok(self.lock().channel_pts.get(&channel_id).copied())
    }

    fn read_dialog_read_max(&self, outbound: bool, dialog_id: DialogId) -> io::Result<Option<MessageId>> {
        Ok(self.lock().dialogs.get(&dialog_id).map(|d| {
            if outbound { d.read_outbox_max } else { d.read_inbox_max }
        }))
    }

    fn name(&self) -> &str { "in-memory" }
}

// ─── SqliteStorage ────────────────────────────────────────────────────────────

#[cfg(feature = "sqlite-storage")]
pub use sqlite_storage::SqliteStorage;

#[cfg(feature = "sqlite-storage")]
mod sqlite_storage {
    use super::*;
    use std::path::PathBuf;
    use rusqlite::{Connection, OptionalExtension, params};

    use crate::types::NotifySettings;

    fn to_io(e: rusqlite::Error) -> io::Error {
        io::Error::new(io::ErrorKind::Other, e)
    }

    /// Add columns introduced after the first schema to an existing file.
    fn migrate(conn: &Connection) -> io::Result<()> {
        let mut stmt = conn.prepare("PRAGMA table_info(dialogs)").map_err(to_io)?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get(1))
            .map_err(to_io)?
            .collect::<Result<_, _>>()
            .map_err(to_io)?;
        for (name, ddl) in [
            ("silent", "ALTER TABLE dialogs ADD COLUMN silent INTEGER NOT NULL DEFAULT 0"),
            ("show_previews", "ALTER TABLE dialogs ADD COLUMN show_previews INTEGER NOT NULL DEFAULT 1"),
        ] {
            if !columns.iter().any(|c| c == name) {
                tracing::info!("[layer-sync] sqlite: adding dialogs.{name}");
                conn.execute(ddl, []).map_err(to_io)?;
            }
        }
        Ok(())
    }

    /// SQLite-backed store.
    ///
    /// Creates three tables (`counters`, `channel_pts` and `dialogs`) if they
    /// do not exist.
    ///
    /// Enable with the `sqlite-storage` Cargo feature:
    /// ```toml
    /// [dependencies]
    /// layer-sync = { version = "*", features = ["sqlite-storage"] }
    /// ```
    pub struct SqliteStorage {
        path: PathBuf,
    }

    impl SqliteStorage {
        pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
            let path = path.into();
            // Open and initialise the schema immediately so errors surface early.
            let conn = Connection::open(&path).map_err(to_io)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS counters (
                    id   INTEGER PRIMARY KEY CHECK (id = 0),
                    pts  INTEGER NOT NULL,
                    qts  INTEGER NOT NULL,
                    date INTEGER NOT NULL,
                    seq  INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS channel_pts (
                    channel_id INTEGER PRIMARY KEY,
                    pts        INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS dialogs (
                    id                     INTEGER PRIMARY KEY,
                    top_message_id         INTEGER NOT NULL,
                    last_message_date      INTEGER NOT NULL,
                    read_inbox_max         INTEGER NOT NULL,
                    read_outbox_max        INTEGER NOT NULL,
                    unread_count           INTEGER NOT NULL,
                    unread_mentions_count  INTEGER NOT NULL,
                    unread_reactions_count INTEGER NOT NULL,
                    pinned_num             INTEGER NOT NULL,
                    folder_id              INTEGER NOT NULL,
                    mute_until             INTEGER,
                    silent                 INTEGER NOT NULL DEFAULT 0,
                    show_previews          INTEGER NOT NULL DEFAULT 1,
                    unread_mark            INTEGER NOT NULL,
                    draft_date             INTEGER,
                    migrated               INTEGER NOT NULL,
                    pts                    INTEGER NOT NULL
                );",
            ).map_err(to_io)?;
            migrate(&conn)?;
            Ok(Self { path })
        }

        fn open(&self) -> io::Result<Connection> {
            Connection::open(&self.path).map_err(to_io)
        }
    }

    impl Storage for SqliteStorage {
        fn persist_dialogs(&self, dialogs: &[Dialog]) -> io::Result<()> {
            let mut conn = self.open()?;
            let tx = conn.transaction().map_err(to_io)?;
            for d in dialogs {
                tx.execute(
                    "INSERT OR REPLACE INTO dialogs
                        (id, top_message_id, last_message_date, read_inbox_max, read_outbox_max,
                         unread_count, unread_mentions_count, unread_reactions_count, pinned_num,
                         folder_id, mute_until, silent, show_previews, unread_mark, draft_date, migrated, pts)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                    params![
                        d.id.0,
                        d.top_message_id,
                        d.last_message_date,
                        d.read_inbox_max,
                        d.read_outbox_max,
                        d.unread_count,
                        d.unread_mentions_count,
                        d.unread_reactions_count,
                        if d.pinned { d.pinned_num } else { 0 },
                        d.folder_id,
                        d.notify_settings.mute_until,
                        d.notify_settings.silent,
                        d.notify_settings.show_previews,
                        d.unread_mark,
                        d.draft_date,
                        d.migrated,
                        d.pts,
                    ],
                ).map_err(to_io)?;
            }
            tx.commit().map_err(to_io)
        }

        fn delete_dialogs(&self, ids: &[DialogId]) -> io::Result<()> {
            let conn = self.open()?;
            for id in ids {
                conn.execute("DELETE FROM dialogs WHERE id = ?1", params![id.0]).map_err(to_io)?;
            }
            Ok(())
        }

        fn load_dialogs(&self) -> io::Result<Vec<Dialog>> {
            let conn = self.open()?;
            let mut stmt = conn.prepare(
                "SELECT id, top_message_id, last_message_date, read_inbox_max, read_outbox_max,
                        unread_count, unread_mentions_count, unread_reactions_count, pinned_num,
                        folder_id, mute_until, silent, show_previews, unread_mark, draft_date, migrated, pts
                 FROM dialogs",
            ).map_err(to_io)?;
            let dialogs = stmt
                .query_map([], |row| {
                    let pinned_num: i32 = row.get(8)?;
                    Ok(Dialog {
                        id:                     DialogId(row.get(0)?),
                        top_message_id:         row.get(1)?,
                        last_message_date:      row.get(2)?,
                        read_inbox_max:         row.get(3)?,
                        read_outbox_max:        row.get(4)?,
                        unread_count:           row.get(5)?,
                        unread_mentions_count:  row.get(6)?,
                        unread_reactions_count: row.get(7)?,
                        pinned:                 pinned_num != 0,
                        pinned_num,
                        folder_id:              row.get(9)?,
                        notify_settings:        NotifySettings {
                            mute_until:    row.get(10)?,
                            silent:        row.get(11)?,
                            show_previews: row.get(12)?,
                        },
                        unread_mark:            row.get(13)?,
                        top_message_deleted:    false,
                        draft_date:             row.get(14)?,
                        migrated:               row.get(15)?,
                        pts:                    row.get(16)?,
                    })
                })
                .map_err(to_io)?
                .filter_map(|r| match r {
                    Ok(d) => Some(d),
                    Err(e) => {
                        tracing::warn!("[layer-sync] sqlite: skipping unreadable dialog row: {e}");
                        None
                    }
                })
                .collect();
            Ok(dialogs)
        }

        fn persist_counters(&self, c: CounterSnapshot) -> io::Result<()> {
            self.open()?.execute(
                "INSERT OR REPLACE INTO counters (id, pts, qts, date, seq) VALUES (0, ?1, ?2, ?3, ?4)",
                params![c.pts, c.qts, c.date, c.seq],
            ).map_err(to_io)?;
            Ok(())
        }

        fn load_counters(&self) -> io::Result<Option<CounterSnapshot>> {
            self.open()?
                .query_row("SELECT pts, qts, date, seq FROM counters WHERE id = 0", [], |row| {
                    Ok(CounterSnapshot {
                        pts:  row.get(0)?,
                        qts:  row.get(1)?,
                        date: row.get(2)?,
                        seq:  row.get(3)?,
                    })
                })
                .optional()
                .map_err(to_io)
        }

        fn persist_channel_pts(&self, channel_id: i64, pts: i32) -> io::Result<()> {
            self.open()?.execute(
                "INSERT OR REPLACE INTO channel_pts (channel_id, pts) VALUES (?1, ?2)",
                params![channel_id, pts],
            ).map_err(to_io)?;
            Ok(())
        }

        fn load_channel_pts(&self, channel_id: i64) -> io::Result<Option<i32>> {
            self.open()?
                .query_row(
                    "SELECT pts FROM channel_pts WHERE channel_id = ?1",
                    params![channel_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(to_io)
        }

        fn read_dialog_read_max(&self, outbound: bool, dialog_id: DialogId) -> io::Result<Option<MessageId>> {
            let sql = if outbound {
                "SELECT read_outbox_max FROM dialogs WHERE id = ?1"
            } else {
                "SELECT read_inbox_max FROM dialogs WHERE id = ?1"
            };
            self.open()?
                .query_row(sql, params![dialog_id.0], |row| row.get(0))
                .optional()
                .map_err(to_io)
        }

        fn name(&self) -> &str { "sqlite" }
    }
}
