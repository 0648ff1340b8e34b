//! Structural diff between two keyed snapshots.
//!
//! [`diff`] and [`apply_diff`] are inverse: applying `diff(a, b)` to a copy
//! of `a` yields exactly `b`.

use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::values::{Row, Snapshot, Value};

/// New state of one field inside a changed row.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    /// Field now holds this value.
    Set(Value),
    /// Field no longer exists in the row.
    Removed,
}

/// Serialised as the bare value for `Set` and as `{"$removed": true}` for
/// `Removed`, so a field set to `null` stays distinguishable from a dropped one.
impl Serialize for FieldChange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldChange::Set(value) => value.serialize(serializer),
            FieldChange::Removed => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("$removed", &true)?;
                map.end()
            }
        }
    }
}

/// Changed fields of one row.
pub type RowDelta = BTreeMap<String, FieldChange>;

/// Delta between two snapshots.
///
/// A key appears in at most one of the three maps. `changed` and `removed`
/// are `None` (rather than empty) only on notifications that carry a whole
/// snapshot in `added`: the first update of an empty result and the catch-up
/// update a late subscriber receives.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Diff {
    pub added: Option<Snapshot>,
    pub changed: Option<BTreeMap<String, RowDelta>>,
    pub removed: Option<BTreeMap<String, bool>>,
}

impl Diff {
    /// A diff that introduces `snapshot` wholesale.
    pub fn initial(snapshot: Snapshot) -> Self {
        Self {
            added: Some(snapshot),
            changed: None,
            removed: None,
        }
    }

    /// `true` when applying the diff would change nothing.
    pub fn is_empty(&self) -> bool {
        self.added.as_ref().map_or(true, BTreeMap::is_empty)
            && self.changed.as_ref().map_or(true, BTreeMap::is_empty)
            && self.removed.as_ref().map_or(true, BTreeMap::is_empty)
    }
}

/// Compute the diff that turns `old` into `new`.
pub fn diff(old: &Snapshot, new: &Snapshot) -> Diff {
    let mut added = Snapshot::new();
    let mut changed = BTreeMap::new();
    let mut removed = BTreeMap::new();

    for key in old.keys() {
        if !new.contains_key(key) {
            removed.insert(key.clone(), true);
        }
    }

    for (key, new_row) in new {
        match old.get(key) {
            None => {
                added.insert(key.clone(), new_row.clone());
            }
            Some(old_row) => {
                let delta = diff_row(old_row, new_row);
                if !delta.is_empty() {
                    changed.insert(key.clone(), delta);
                }
            }
        }
    }

    Diff {
        added: Some(added),
        changed: Some(changed),
        removed: Some(removed),
    }
}

fn diff_row(old: &Row, new: &Row) -> RowDelta {
    let mut delta = RowDelta::new();

    for field in old.keys() {
        if !new.contains_key(field) {
            delta.insert(field.clone(), FieldChange::Removed);
        }
    }

    for (field, value) in new {
        if old.get(field) != Some(value) {
            delta.insert(field.clone(), FieldChange::Set(value.clone()));
        }
    }

    delta
}

/// Apply `diff` to `data` in place.
///
/// Removals run first, then additions, then field deltas. A `changed` entry
/// for a key missing from `data` is ignored.
pub fn apply_diff(data: &mut Snapshot, diff: &Diff) {
    if let Some(removed) = &diff.removed {
        for key in removed.keys() {
            data.remove(key);
        }
    }

    if let Some(added) = &diff.added {
        for (key, row) in added {
            data.insert(key.clone(), row.clone());
        }
    }

    if let Some(changed) = &diff.changed {
        for (key, delta) in changed {
            let Some(row) = data.get_mut(key) else {
                continue;
            };
            for (field, change) in delta {
                match change {
                    FieldChange::Removed => {
                        row.remove(field);
                    }
                    FieldChange::Set(value) => {
                        row.insert(field.clone(), value.clone());
                    }
                }
            }
        }
    }
}
