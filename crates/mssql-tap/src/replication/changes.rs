//! Net-change fold over a change tracking feed.
//!
//! Several changes to one primary key inside a sync window collapse into
//! a single net change: a delete anywhere in the window wins, otherwise the
//! highest version wins. Output is ordered by the winning version.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use serde_json::Value;

use crate::core::{ChangeOperation, ChangeRow};

/// Collapse a change feed to one net change per primary key.
///
/// An insert or update whose row image is missing (the row was deleted
/// after the change was recorded) is treated as a delete. Deletes never
/// carry a row image.
pub fn collapse(changes: impl IntoIterator<Item = ChangeRow>) -> Vec<ChangeRow> {
    let mut net: HashMap<String, ChangeRow> = HashMap::new();

    for mut change in changes {
        if change.data.is_none() {
            change.operation = ChangeOperation::Delete;
        }
        if change.operation == ChangeOperation::Delete {
            change.data = None;
        }

        match net.entry(Value::Array(change.key.clone()).to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(change);
            }
            Entry::Occupied(mut slot) => {
                if supersedes(&change, slot.get()) {
                    slot.insert(change);
                }
            }
        }
    }

    let mut out: Vec<(String, ChangeRow)> = net.into_iter().collect();
    out.sort_by(|(ka, a), (kb, b)| a.version.cmp(&b.version).then_with(|| ka.cmp(kb)));
    out.into_iter().map(|(_, change)| change).collect()
}

fn is_delete(change: &ChangeRow) -> bool {
    change.operation == ChangeOperation::Delete
}

fn supersedes(candidate: &ChangeRow, current: &ChangeRow) -> bool {
    match (is_delete(current), is_delete(candidate)) {
        (true, false) => false,
        (false, true) => true,
        _ => candidate.version >= current.version,
    }
}
