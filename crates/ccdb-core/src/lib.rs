//! Core domain model for the complaint version ledger.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Months, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ccdb-core";

pub type EntityId = i64;

pub const ENTITY_ID_COLUMN: &str = "complaint_id";
pub const RECEIVED_AT_COLUMN: &str = "date_received";
pub const UPDATE_STAMP_COLUMN: &str = "update_stamp";
pub const TOMBSTONE_COLUMN: &str = "tombstone";

/// Columns that identify a version row and are never part of the business payload.
pub const KEY_COLUMNS: &[&str] = &[
    ENTITY_ID_COLUMN,
    RECEIVED_AT_COLUMN,
    UPDATE_STAMP_COLUMN,
    TOMBSTONE_COLUMN,
];

/// Business fields of the published complaints CSV after header normalization.
pub const CFPB_BUSINESS_FIELDS: &[&str] = &[
    "product",
    "sub-product",
    "issue",
    "sub-issue",
    "consumer_complaint_narrative",
    "company_public_response",
    "company",
    "state",
    "zip_code",
    "tags",
    "consumer_consent_provided",
    "submitted_via",
    "date_sent_to_company",
    "company_response_to_consumer",
    "timely_response",
    "consumer_disputed",
];

/// Ordered mapping of business field name to value. A `None` value is a SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload {
    fields: BTreeMap<String, Option<String>>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields<K, V>(fields: impl IntoIterator<Item = (K, Option<V>)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.map(Into::into)))
                .collect(),
        }
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Option<String>) {
        self.fields.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(|v| v.as_deref())
    }

    pub fn contains_field(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

// `Tombstone < Full`; the latest-version tie-break relies on variant order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum VersionState {
    Tombstone,
    Full(Payload),
}

impl VersionState {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, VersionState::Tombstone)
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            VersionState::Full(payload) => Some(payload),
            VersionState::Tombstone => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityVersion {
    pub entity_id: EntityId,
    pub received_at: DateTime<Utc>,
    pub update_stamp: DateTime<Utc>,
    pub state: VersionState,
}

impl EntityVersion {
    pub fn is_tombstone(&self) -> bool {
        self.state.is_tombstone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub entity_id: EntityId,
    pub received_at: DateTime<Utc>,
    pub payload: Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    New,
    Removed,
    Changed,
    Unchanged,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::New => "new",
            Disposition::Removed => "removed",
            Disposition::Changed => "changed",
            Disposition::Unchanged => "unchanged",
        }
    }

    pub fn requires_write(self) -> bool {
        !matches!(self, Disposition::Unchanged)
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingVersion {
    pub entity_id: EntityId,
    pub received_at: DateTime<Utc>,
    pub state: VersionState,
}

impl PendingVersion {
    pub fn stamped(self, update_stamp: DateTime<Utc>) -> EntityVersion {
        EntityVersion {
            entity_id: self.entity_id,
            received_at: self.received_at,
            update_stamp,
            state: self.state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileWindow {
    pub run_time: DateTime<Utc>,
    pub cutoff: DateTime<Utc>,
    pub update_stamp: DateTime<Utc>,
}

impl ReconcileWindow {
    pub fn ending_at(run_time: DateTime<Utc>, lookback_months: u32) -> Self {
        let update_stamp = run_stamp(run_time);
        let cutoff = update_stamp
            .checked_sub_months(Months::new(lookback_months))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self {
            run_time,
            cutoff,
            update_stamp,
        }
    }

    /// The lower bound is exclusive.
    pub fn contains(&self, received_at: DateTime<Utc>) -> bool {
        received_at_in_window(received_at, self.cutoff)
    }
}

pub fn received_at_in_window(received_at: DateTime<Utc>, cutoff: DateTime<Utc>) -> bool {
    received_at > cutoff
}

/// Stamp precision is capped at microseconds so a stamp survives a Postgres round trip.
pub fn run_stamp(now: DateTime<Utc>) -> DateTime<Utc> {
    now.trunc_subsecs(6)
}
