//! Engine tuning knobs.
//!
//! The defaults mirror what the official clients ship with.  Only one thing
//! is a hard requirement: a bounded wait precedes every forced catch-up fetch.

use std::time::Duration;

/// Configuration for [`crate::SyncHandle::start`] and [`crate::SyncEngine::new`].
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// How long a gap queue may stall before it is dropped in favour of a
    /// difference fetch.
    pub gap_wait:                 Duration,
    /// Period of the single cooperative timer.
    pub tick_interval:            Duration,
    /// In-flight fetches older than this are abandoned so the scope re-arms.
    pub fetch_timeout:            Duration,
    /// `pts_total_limit` sent with global difference requests.
    pub difference_pts_limit:     Option<i32>,
    /// `limit` sent with channel difference requests.
    pub channel_difference_limit: i32,
    /// Page size for the dialog reload performed on a global `TooLong`.
    pub dialogs_page_limit:       i32,
    /// Id of the logged-in account; messages from it never count as unread.
    pub self_user_id:             i64,
    /// Write the changed dialogs to storage after every mutation batch.
    pub persist_dialogs:          bool,
    /// Read message pointers kept per dialog beyond the unread ones.
    pub pointers_per_dialog:      usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            gap_wait:                 Duration::from_millis(1500),
            tick_interval:            Duration::from_millis(500),
            fetch_timeout:            Duration::from_secs(30),
            difference_pts_limit:     None,
            channel_difference_limit: 100,
            dialogs_page_limit:       100,
            self_user_id:             0,
            persist_dialogs:          true,
            pointers_per_dialog:      200,
        }
    }
}

impl SyncConfig {
    /// Set the logged-in account id.
    pub fn self_user(mut self, id: i64) -> Self {
        self.self_user_id = id; self
    }

    /// Override the gap wait window.
    pub fn gap_wait(mut self, d: Duration) -> Self {
        self.gap_wait = d; self
    }

    /// Override the tick period.
    pub fn tick_interval(mut self, d: Duration) -> Self {
        self.tick_interval = d; self
    }

    /// Override the in-flight fetch timeout.
    pub fn fetch_timeout(mut self, d: Duration) -> Self {
        self.fetch_timeout = d; self
    }

    /// Override how many read message pointers each dialog keeps.
    pub fn pointers_per_dialog(mut self, n: usize) -> Self {
        self.pointers_per_dialog = n; self
    }
}
