//! Three-way change classification of a snapshot against resolved prior state.

use std::collections::HashMap;

use ccdb_core::{Disposition, EntityId, EntityVersion, PendingVersion, SnapshotRecord, VersionState};
use serde::Serialize;

/// Disposition of one entity, plus the version to append when it needs one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub entity_id: EntityId,
    pub disposition: Disposition,
    /// NEW because the latest prior version was a tombstone.
    pub reactivated: bool,
    pub pending: Option<PendingVersion>,
}

impl Classification {
    fn unchanged(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            disposition: Disposition::Unchanged,
            reactivated: false,
            pending: None,
        }
    }

    fn with_snapshot(disposition: Disposition, reactivated: bool, record: SnapshotRecord) -> Self {
        Self {
            entity_id: record.entity_id,
            disposition,
            reactivated,
            pending: Some(PendingVersion {
                entity_id: record.entity_id,
                received_at: record.received_at,
                state: VersionState::Full(record.payload),
            }),
        }
    }

    fn removed(prior: &EntityVersion) -> Self {
        Self {
            entity_id: prior.entity_id,
            disposition: Disposition::Removed,
            reactivated: false,
            pending: Some(PendingVersion {
                entity_id: prior.entity_id,
                received_at: prior.received_at,
                state: VersionState::Tombstone,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispositionCounts {
    pub new: usize,
    pub removed: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub reactivated: usize,
}

impl DispositionCounts {
    pub fn tally(classifications: &[Classification]) -> Self {
        let mut counts = Self::default();
        for c in classifications {
            match c.disposition {
                Disposition::New => counts.new += 1,
                Disposition::Removed => counts.removed += 1,
                Disposition::Changed => counts.changed += 1,
                Disposition::Unchanged => counts.unchanged += 1,
            }
            if c.reactivated {
                counts.reactivated += 1;
            }
        }
        counts
    }

    pub fn writes(&self) -> usize {
        self.new + self.removed + self.changed
    }

    pub fn total(&self) -> usize {
        self.writes() + self.unchanged
    }
}

/// Assigns every entity in `snapshot ∪ prior` exactly one disposition, sorted by entity id.
///
/// A prior tombstone that is still absent stays UNCHANGED; a prior tombstone that
/// reappears is NEW. `received_at` takes part in change detection alongside the payload.
pub fn classify(
    snapshot: HashMap<EntityId, SnapshotRecord>,
    prior: &HashMap<EntityId, EntityVersion>,
) -> Vec<Classification> {
    let mut out = Vec::with_capacity(snapshot.len().max(prior.len()));

    for (entity_id, version) in prior {
        if snapshot.contains_key(entity_id) {
            continue;
        }
        out.push(if version.is_tombstone() {
            Classification::unchanged(*entity_id)
        } else {
            Classification::removed(version)
        });
    }

    for (entity_id, record) in snapshot {
        let classification = match prior.get(&entity_id).map(|v| (v, &v.state)) {
            None => Classification::with_snapshot(Disposition::New, false, record),
            Some((_, VersionState::Tombstone)) => {
                Classification::with_snapshot(Disposition::New, true, record)
            }
            Some((version, VersionState::Full(payload)))
                if *payload == record.payload && version.received_at == record.received_at =>
            {
                Classification::unchanged(entity_id)
            }
            Some(_) => Classification::with_snapshot(Disposition::Changed, false, record),
        };
        out.push(classification);
    }

    out.sort_unstable_by_key(|c| c.entity_id);
    out
}
