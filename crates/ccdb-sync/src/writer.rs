//! Versioned writer: stamps pending versions and appends them in one atomic batch.

use std::collections::{HashMap, HashSet};

use ccdb_core::{EntityId, EntityVersion};
use ccdb_storage::{StoreError, VersionStore};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use crate::classify::Classification;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("complaint {entity_id} would receive two versions at {update_stamp}")]
    DuplicateInRun {
        entity_id: EntityId,
        update_stamp: DateTime<Utc>,
    },
    #[error("complaint {entity_id} already has a version at {prior_stamp}, not older than run stamp {update_stamp}")]
    ClockRegression {
        entity_id: EntityId,
        prior_stamp: DateTime<Utc>,
        update_stamp: DateTime<Utc>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Rows one run is about to append, all carrying the run's stamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePlan {
    pub update_stamp: DateTime<Utc>,
    pub versions: Vec<EntityVersion>,
}

impl WritePlan {
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// Stamps every non-UNCHANGED classification, refusing plans that would break
/// per-entity stamp ordering or write an entity twice.
pub fn plan_writes(
    classifications: &[Classification],
    prior: &HashMap<EntityId, EntityVersion>,
    update_stamp: DateTime<Utc>,
) -> Result<WritePlan, WriteError> {
    let mut seen = HashSet::new();
    let mut versions = Vec::new();

    for classification in classifications {
        let Some(pending) = &classification.pending else {
            continue;
        };
        if !seen.insert(pending.entity_id) {
            return Err(WriteError::DuplicateInRun {
                entity_id: pending.entity_id,
                update_stamp,
            });
        }
        if let Some(previous) = prior.get(&pending.entity_id) {
            if previous.update_stamp >= update_stamp {
                return Err(WriteError::ClockRegression {
                    entity_id: pending.entity_id,
                    prior_stamp: previous.update_stamp,
                    update_stamp,
                });
            }
        }
        versions.push(pending.clone().stamped(update_stamp));
    }

    Ok(WritePlan {
        update_stamp,
        versions,
    })
}

/// Append-only front of a [`VersionStore`]. Never issues updates or deletes.
pub struct VersionedWriter<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S> VersionedWriter<'a, S>
where
    S: VersionStore + ?Sized,
{
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub async fn append(&self, plan: &WritePlan) -> Result<usize, WriteError> {
        if plan.is_empty() {
            return Ok(0);
        }
        let written = self.store.append(&plan.versions).await?;
        info!(rows = written, update_stamp = %plan.update_stamp, "appended versions");
        Ok(written)
    }
}
