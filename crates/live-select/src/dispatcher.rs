//! Routing of change events to mirrors and query caches.

use std::collections::BTreeMap;

use sync_core::ChangeEvent;

use crate::mirror::TableMirror;
use crate::query_cache::{EntryId, QueryCache};

/// Feed `event` to every mirror, then return the caches it invalidates.
///
/// A cache whose refresh timer is already armed is skipped without
/// evaluating conditions unless `check_condition_when_queued` is set; the
/// queued refresh will observe the change anyway.
pub(crate) fn dispatch(
    event: &ChangeEvent,
    mirrors: &[TableMirror],
    entries: &BTreeMap<EntryId, QueryCache>,
    check_condition_when_queued: bool,
    default_schema: Option<&str>,
) -> Vec<EntryId> {
    for mirror in mirrors {
        mirror.apply(event);
    }

    entries
        .values()
        .filter(|entry| check_condition_when_queued || entry.timer.is_none())
        .filter(|entry| entry.matches(event, default_schema))
        .map(|entry| entry.id)
        .collect()
}
