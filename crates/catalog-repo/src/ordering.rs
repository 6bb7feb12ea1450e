//! Relative re-ordering of a collection's ordering list.

use std::collections::HashSet;

/// Apply a requested order to the current ordering list.
///
/// Ids named in `requested` that exist in `current` come first, in the
/// requested sequence (a repeated id keeps its first position). Every
/// existing id not mentioned keeps trailing in its prior relative order.
/// Requested ids that no longer exist are dropped.
pub fn reorder(current: &[String], requested: &[String]) -> Vec<String> {
    let existing: HashSet<&str> = current.iter().map(String::as_str).collect();
    let mut placed: HashSet<&str> = HashSet::with_capacity(requested.len());
    let mut order = Vec::with_capacity(current.len());

    for id in requested {
        if existing.contains(id.as_str()) && placed.insert(id.as_str()) {
            order.push(id.clone());
        }
    }
    for id in current {
        if placed.insert(id.as_str()) {
            order.push(id.clone());
        }
    }
    order
}
