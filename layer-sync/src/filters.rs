//! Dialog folders ("filters") and their derived lists.
//!
//! A filter's membership is decided per dialog in strict priority order:
//!
//! 1. explicit always-include (and the filter's own pinned dialogs),
//! 2. explicit never-include,
//! 3. the exclude-archived flag,
//! 4. the exclude-muted and exclude-read flags,
//! 5. the peer category flags.
//!
//! Membership is recomputed from scratch when a filter definition changes or a
//! dialog changed in a way that can flip membership.  Any other refresh only
//! re-orders the cached members and evaluates dialogs the filter has not seen.

use std::collections::{BTreeMap, HashSet};

use crate::dialogs::DialogStore;
use crate::entities::{self, EntityDirectory};
use crate::types::{Dialog, DialogId, PeerKind, ARCHIVE_FOLDER_ID};

/// Filter flag values.
pub mod flags {
    pub const CONTACTS:         u32 = 1;
    pub const NON_CONTACTS:     u32 = 1 << 1;
    pub const GROUPS:           u32 = 1 << 2;
    pub const CHANNELS:         u32 = 1 << 3;
    pub const BOTS:             u32 = 1 << 4;
    pub const EXCLUDE_MUTED:    u32 = 1 << 5;
    pub const EXCLUDE_READ:     u32 = 1 << 6;
    pub const EXCLUDE_ARCHIVED: u32 = 1 << 7;

    pub const ALL_CATEGORIES: u32 = CONTACTS | NON_CONTACTS | GROUPS | CHANNELS | BOTS;
}

// ─── DialogFilter ─────────────────────────────────────────────────────────────

/// User-defined filter definition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DialogFilter {
    pub id:             i32,
    pub name:           String,
    /// Bitwise OR of [`flags`] values.
    pub flags:          u32,
    pub always_include: HashSet<DialogId>,
    pub never_include:  HashSet<DialogId>,
    /// Dialogs pinned inside this filter, first one on top.
    pub pinned:         Vec<DialogId>,
}

impl DialogFilter {
    pub fn new(id: i32, name: impl Into<String>, flags: u32) -> Self {
        Self { id, name: name.into(), flags, ..Default::default() }
    }

    pub fn include(mut self, id: DialogId) -> Self {
        self.always_include.insert(id);
        self
    }

    pub fn exclude(mut self, id: DialogId) -> Self {
        self.never_include.insert(id);
        self
    }

    pub fn pin(mut self, id: DialogId) -> Self {
        if !self.pinned.contains(&id) {
            self.pinned.push(id);
        }
        self
    }

    fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Whether `dialog` belongs to this filter.  `now` is the unix time used
    /// to evaluate temporary mutes.
    pub fn includes(&self, dialog: &Dialog, kind: PeerKind, now: i32) -> bool {
        if self.always_include.contains(&dialog.id) || self.pinned.contains(&dialog.id) {
            return true;
        }
        if self.never_include.contains(&dialog.id) {
            return false;
        }
        if self.has(flags::EXCLUDE_ARCHIVED) && dialog.folder_id == ARCHIVE_FOLDER_ID {
            return false;
        }
        if self.has(flags::EXCLUDE_MUTED) && dialog.notify_settings.is_muted(now) {
            return false;
        }
        if self.has(flags::EXCLUDE_READ) && !dialog.has_unread() {
            return false;
        }
        let category = match kind {
            PeerKind::Contact    => flags::CONTACTS,
            PeerKind::NonContact => flags::NON_CONTACTS,
            PeerKind::Bot        => flags::BOTS,
            PeerKind::Group      => flags::GROUPS,
            PeerKind::Channel    => flags::CHANNELS,
            PeerKind::Unknown    => 0,
        };
        self.has(category)
    }
}

/// `true` if going from `old` to `new` can change a dialog's membership in
/// some filter.
pub fn membership_relevant(old: &Dialog, new: &Dialog, now: i32) -> bool {
    old.folder_id != new.folder_id
        || old.notify_settings.is_muted(now) != new.notify_settings.is_muted(now)
        || old.has_unread() != new.has_unread()
}

// ─── FilterEngine ─────────────────────────────────────────────────────────────

struct FilterState {
    def:       DialogFilter,
    members:   HashSet<DialogId>,
    /// Every dialog evaluated since the last full recompute.
    evaluated: HashSet<DialogId>,
    derived:   Vec<DialogId>,
    stale:     bool,
}

impl FilterState {
    fn new(def: DialogFilter) -> Self {
        Self {
            def,
            members:   HashSet::new(),
            evaluated: HashSet::new(),
            derived:   Vec::new(),
            stale:     true,
        }
    }
}

#[derive(Default)]
pub struct FilterEngine {
    filters:      BTreeMap<i32, FilterState>,
    /// Store version the derived lists were last built from.
    seen_version: Option<u64>,
}

impl FilterEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Add or replace a filter definition.  Its list is rebuilt on the next
    /// [`refresh`](Self::refresh).
    pub fn set_filter(&mut self, def: DialogFilter) {
        tracing::debug!("[layer-sync] filter {} ({}) updated", def.id, def.name);
        self.filters.insert(def.id, FilterState::new(def));
    }

    pub fn remove_filter(&mut self, id: i32) -> bool {
        self.filters.remove(&id).is_some()
    }

    pub fn filter(&self, id: i32) -> Option<&DialogFilter> {
        self.filters.get(&id).map(|f| &f.def)
    }

    /// Force a full recompute of every filter on the next refresh.
    pub fn invalidate(&mut self) {
        for f in self.filters.values_mut() {
            f.stale = true;
        }
    }

    /// Forget that `id` was evaluated so the next incremental refresh looks at
    /// it again.
    pub fn forget(&mut self, id: DialogId) {
        for f in self.filters.values_mut() {
            f.evaluated.remove(&id);
            f.members.remove(&id);
        }
    }

    /// Bring every derived list in line with the store's current order.
    /// Does nothing if neither the store nor any filter changed since the
    /// last call.  Returns `true` if any derived list changed.
    pub fn refresh(&mut self, store: &DialogStore, dir: &dyn EntityDirectory, now: i32) -> bool {
        let stale = self.filters.values().any(|f| f.stale);
        if self.filters.is_empty() || (!stale && self.seen_version == Some(store.version())) {
            return false;
        }
        self.seen_version = Some(store.version());
        let ordered = store.sorted();
        let mut changed = false;
        for f in self.filters.values_mut() {
            if f.stale {
                f.members.clear();
                f.evaluated.clear();
                f.stale = false;
            }
            f.members.retain(|id| store.is_visible(*id));
            for id in ordered {
                if !f.evaluated.insert(*id) {
                    continue;
                }
                let Some(dialog) = store.get(*id) else { continue };
                if f.def.includes(dialog, entities::peer_kind(dir, *id), now) {
                    f.members.insert(*id);
                }
            }

            let mut derived: Vec<DialogId> = f
                .def
                .pinned
                .iter()
                .copied()
                .filter(|id| f.members.contains(id))
                .collect();
            derived.extend(
                ordered
                    .iter()
                    .copied()
                    .filter(|id| f.members.contains(id) && !f.def.pinned.contains(id)),
            );
            if derived != f.derived {
                f.derived = derived;
                changed = true;
            }
        }
        changed
    }

    /// Derived list of a filter as of the last refresh.
    pub fn derived(&self, id: i32) -> &[DialogId] {
        self.filters.get(&id).map(|f| f.derived.as_slice()).unwrap_or(&[])
    }

    /// Every derived list, keyed by filter id.
    pub fn lists(&self) -> BTreeMap<i32, Vec<DialogId>> {
        self.filters.iter().map(|(id, f)| (*id, f.derived.clone())).collect()
    }
}
