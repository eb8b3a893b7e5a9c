//! Canonical dialog ordering.
//!
//! Evaluated top to bottom:
//! 1. folder pseudo-dialogs,
//! 2. pinned dialogs by descending pin rank,
//! 3. everything else by descending effective date (last message or draft).
//!
//! Ties fall back to the dialog id so the order is total: sorting the same
//! set twice always yields the same sequence.

use std::cmp::Ordering;

use crate::types::Dialog;

pub struct DialogSorter;

impl DialogSorter {
    pub fn compare(a: &Dialog, b: &Dialog) -> Ordering {
        b.id.is_folder().cmp(&a.id.is_folder())
            .then_with(|| b.pinned.cmp(&a.pinned))
            .then_with(|| {
                if a.pinned && b.pinned {
                    b.pinned_num.cmp(&a.pinned_num)
                } else {
                    Ordering::Equal
                }
            })
            .then_with(|| b.effective_date().cmp(&a.effective_date()))
            .then_with(|| b.id.cmp(&a.id))
    }

    /// Sort in place, O(n log n).
    pub fn sort(dialogs: &mut [&Dialog]) {
        dialogs.sort_unstable_by(|a, b| Self::compare(a, b));
    }
}
