//! The authoritative in-memory dialog table and its sorted views.
//!
//! Mutations only mark the store dirty; [`DialogStore::resort`] rebuilds the
//! derived lists once per mutation batch.  Dialogs pending deletion stay in
//! the table (so a failed deletion can be rolled back) but never appear in a
//! sorted list or snapshot.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::sorter::DialogSorter;
use crate::types::{Dialog, DialogId};

/// Read-only copy of the dialog list handed to the presentation side.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DialogListSnapshot {
    /// Increments on every resort.
    pub version: u64,
    /// Visible dialogs, folder 0 list first then the other folders, each in
    /// canonical order.  Folder pseudo-dialogs are included.
    pub dialogs: Vec<Dialog>,
    /// Folder id → dialog ids in canonical order.
    pub folders: BTreeMap<i32, Vec<DialogId>>,
    /// Filter id → derived dialog ids.
    pub filters: BTreeMap<i32, Vec<DialogId>>,
}

impl DialogListSnapshot {
    pub fn get(&self, id: DialogId) -> Option<&Dialog> {
        self.dialogs.iter().find(|d| d.id == id)
    }

    /// Dialog ids of the main list.
    pub fn main_list(&self) -> &[DialogId] {
        self.folders.get(&0).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ─── DialogStore ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct DialogStore {
    dialogs:          HashMap<DialogId, Dialog>,
    pending_deletion: HashSet<DialogId>,
    /// Synthetic rows for non-empty folders other than 0.
    folder_rows:      HashMap<i32, Dialog>,
    /// Folder id → visible dialogs in canonical order.
    sorted:           BTreeMap<i32, Vec<DialogId>>,
    /// Every visible real dialog in canonical order, across folders.
    all_sorted:       Vec<DialogId>,
    dirty:            bool,
    version:          u64,
}

impl DialogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }

    /// Insert or replace a dialog.  Returns the previous value.
    pub fn upsert(&mut self, dialog: Dialog) -> Option<Dialog> {
        self.dirty = true;
        self.dialogs.insert(dialog.id, dialog)
    }

    /// Remove a dialog outright, completing any pending deletion.
    pub fn remove(&mut self, id: DialogId) -> Option<Dialog> {
        self.pending_deletion.remove(&id);
        let old = self.dialogs.remove(&id);
        if old.is_some() {
            self.dirty = true;
        }
        old
    }

    pub fn get(&self, id: DialogId) -> Option<&Dialog> {
        self.dialogs.get(&id)
    }

    /// Mutable access; marks the store dirty.
    pub fn get_mut(&mut self, id: DialogId) -> Option<&mut Dialog> {
        let d = self.dialogs.get_mut(&id)?;
        self.dirty = true;
        Some(d)
    }

    pub fn contains(&self, id: DialogId) -> bool {
        self.dialogs.contains_key(&id)
    }

    /// Snapshot of every stored dialog, including those pending deletion.
    pub fn all(&self) -> Vec<Dialog> {
        let mut all: Vec<Dialog> = self.dialogs.values().cloned().collect();
        all.sort_by_key(|d| d.id);
        all
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dialog> {
        self.dialogs.values()
    }

    /// Hide a dialog until its deletion completes.  Returns `false` if unknown.
    pub fn mark_pending_deletion(&mut self, id: DialogId) -> bool {
        if !self.dialogs.contains_key(&id) {
            return false;
        }
        self.dirty = true;
        self.pending_deletion.insert(id)
    }

    /// Deletion failed; show the dialog again.
    pub fn cancel_pending_deletion(&mut self, id: DialogId) -> bool {
        let was = self.pending_deletion.remove(&id);
        if was {
            self.dirty = true;
        }
        was
    }

    pub fn is_pending_deletion(&self, id: DialogId) -> bool {
        self.pending_deletion.contains(&id)
    }

    /// Dialogs that would appear in a sorted list.
    pub fn is_visible(&self, id: DialogId) -> bool {
        self.dialogs.contains_key(&id) && !self.pending_deletion.contains(&id)
    }

    /// Highest pin rank in a folder, 0 if nothing is pinned.
    pub fn max_pinned_num(&self, folder_id: i32) -> i32 {
        self.dialogs
            .values()
            .filter(|d| d.pinned && d.folder_id == folder_id)
            .map(|d| d.pinned_num)
            .max()
            .unwrap_or(0)
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Rebuild folder rows and every sorted list if anything changed since
    /// the last call (or unconditionally with `force`).  `now` is the unix
    /// time used to decide which dialogs are muted.  Returns whether a sort
    /// happened.
    pub fn resort(&mut self, force: bool, now: i32) -> bool {
        if !self.dirty && !force {
            return false;
        }
        self.rebuild_folder_rows(now);

        let mut visible: Vec<&Dialog> = self
            .dialogs
            .values()
            .filter(|d| !self.pending_deletion.contains(&d.id))
            .collect();
        DialogSorter::sort(&mut visible);
        self.all_sorted = visible.iter().map(|d| d.id).collect();

        let mut by_folder: BTreeMap<i32, Vec<&Dialog>> = BTreeMap::new();
        by_folder.entry(0).or_default();
        for d in visible {
            by_folder.entry(d.folder_id).or_default().push(d);
        }
        if let Some(main) = by_folder.get_mut(&0) {
            main.extend(self.folder_rows.values());
        }

        self.sorted = by_folder
            .into_iter()
            .map(|(folder_id, mut list)| {
                DialogSorter::sort(&mut list);
                (folder_id, list.into_iter().map(|d| d.id).collect())
            })
            .collect();
        self.dirty = false;
        self.version += 1;
        true
    }

    /// Sorted ids of a folder as of the last resort.  Folder 0 is the main
    /// list and starts with the folder pseudo-dialogs.
    pub fn folder(&self, folder_id: i32) -> &[DialogId] {
        self.sorted.get(&folder_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every visible real dialog in canonical order, across folders, as of
    /// the last resort.
    pub fn sorted(&self) -> &[DialogId] {
        &self.all_sorted
    }

    /// Synthetic folder row, if the folder is non-empty.
    pub fn folder_row(&self, folder_id: i32) -> Option<&Dialog> {
        self.folder_rows.get(&folder_id)
    }

    /// Copy of the current lists for the presentation side.
    pub fn snapshot(&self, filters: BTreeMap<i32, Vec<DialogId>>) -> DialogListSnapshot {
        let mut dialogs = Vec::new();
        for ids in self.sorted.values() {
            for id in ids {
                let row = self.dialogs.get(id).or_else(|| {
                    id.folder_id().and_then(|f| self.folder_rows.get(&f))
                });
                if let Some(d) = row {
                    dialogs.push(d.clone());
                }
            }
        }
        DialogListSnapshot {
            version: self.version,
            dialogs,
            folders: self.sorted.clone(),
            filters,
        }
    }

    fn rebuild_folder_rows(&mut self, now: i32) {
        let mut rows: HashMap<i32, Dialog> = HashMap::new();
        for d in self.dialogs.values() {
            if d.folder_id == 0 || self.pending_deletion.contains(&d.id) {
                continue;
            }
            let row = rows.entry(d.folder_id).or_insert_with(|| Dialog::folder(d.folder_id));
            row.last_message_date = row.last_message_date.max(d.effective_date());
            if !d.notify_settings.is_muted(now) {
                row.unread_count += d.unread_count;
            }
            row.unread_mentions_count += d.unread_mentions_count;
        }
        self.folder_rows = rows;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NotifySettings;

    fn dialog(id: i64, date: i32) -> Dialog {
        Dialog { last_message_date: date, ..Dialog::new(DialogId(id)) }
    }

    #[test]
    fn pending_deletion_hidden_but_retained() {
        let mut store = DialogStore::new();
        store.upsert(dialog(1, 10));
        store.upsert(dialog(2, 20));
        assert!(store.mark_pending_deletion(DialogId(2)));
        store.resort(false, 0);
        assert_eq!(store.folder(0), &[DialogId(1)]);
        assert!(store.get(DialogId(2)).is_some());

        store.cancel_pending_deletion(DialogId(2));
        store.resort(false, 0);
        assert_eq!(store.folder(0), &[DialogId(2), DialogId(1)]);
    }

    #[test]
    fn archived_dialogs_surface_as_folder_row() {
        let mut store = DialogStore::new();
        store.upsert(dialog(1, 10));
        store.upsert(Dialog { folder_id: 1, unread_count: 3, ..dialog(2, 50) });
        store.resort(false, 0);
        assert_eq!(store.folder(0), &[DialogId::folder(1), DialogId(1)]);
        assert_eq!(store.folder(1), &[DialogId(2)]);
        let row = store.folder_row(1).expect("folder row");
        assert_eq!(row.last_message_date, 50);
        assert_eq!(row.unread_count, 3);
    }

    #[test]
    fn folder_row_counts_dialogs_whose_mute_expired() {
        let mut store = DialogStore::new();
        let mute = |until| NotifySettings { mute_until: Some(until), ..Default::default() };
        store.upsert(Dialog { folder_id: 1, unread_count: 3, notify_settings: mute(1), ..dialog(2, 50) });
        store.upsert(Dialog { folder_id: 1, unread_count: 5, notify_settings: mute(i32::MAX), ..dialog(3, 40) });
        store.resort(false, 1_000);
        assert_eq!(store.folder_row(1).map(|r| r.unread_count), Some(3));
    }

    #[test]
    fn resort_only_when_dirty() {
        let mut store = DialogStore::new();
        store.upsert(dialog(1, 10));
        assert!(store.resort(false, 0));
        assert!(!store.resort(false, 0));
        assert!(store.resort(true, 0));
        assert_eq!(store.version(), 2);
    }
}
