//! Latest-version resolution over the rows of one reconciliation window.

use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use ccdb_core::{EntityId, EntityVersion};
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct ResolvedVersions {
    pub latest: HashMap<EntityId, EntityVersion>,
    /// Entities whose maximum `update_stamp` was shared by more than one row, sorted.
    pub ties: Vec<EntityId>,
}

impl ResolvedVersions {
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

/// Keeps exactly one row per entity: the one with the greatest `update_stamp`.
///
/// Rows sharing the maximum stamp are ordered by state (a full version beats a
/// tombstone, then payloads compare field by field) and then by `received_at`,
/// so the winner does not depend on the order rows came back from the store.
pub fn resolve_latest(rows: impl IntoIterator<Item = EntityVersion>) -> ResolvedVersions {
    let mut latest: HashMap<EntityId, EntityVersion> = HashMap::new();
    let mut tied: HashSet<EntityId> = HashSet::new();

    for row in rows {
        match latest.entry(row.entity_id) {
            Entry::Vacant(slot) => {
                slot.insert(row);
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                match row.update_stamp.cmp(&current.update_stamp) {
                    Ordering::Greater => {
                        tied.remove(&row.entity_id);
                        slot.insert(row);
                    }
                    Ordering::Equal => {
                        tied.insert(row.entity_id);
                        if (&row.state, row.received_at) > (&current.state, current.received_at) {
                            slot.insert(row);
                        }
                    }
                    Ordering::Less => {}
                }
            }
        }
    }

    let mut ties: Vec<EntityId> = tied.into_iter().collect();
    ties.sort_unstable();
    for entity_id in &ties {
        if let Some(winner) = latest.get(entity_id) {
            warn!(
                complaint_id = entity_id,
                update_stamp = %winner.update_stamp,
                tombstone = winner.is_tombstone(),
                "several versions share the latest update_stamp; applied deterministic tie-break"
            );
        }
    }

    ResolvedVersions { latest, ties }
}
