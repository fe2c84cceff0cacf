//! Snapshot sources: chunked reader for the published complaints CSV and fixture-backed sources.

use std::collections::{BTreeSet, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Context;
use ccdb_core::{EntityId, Payload, SnapshotRecord, ENTITY_ID_COLUMN, KEY_COLUMNS, RECEIVED_AT_COLUMN};
use ccdb_storage::{sha256_hex, sha256_reader_hex, validate_identifier};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "ccdb-snapshot";

/// Rows per chunk when streaming the full export.
pub const DEFAULT_CHUNK_SIZE: usize = 200_000;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot source {path} unreachable: {source}")]
    Unreachable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("snapshot row {line}: {message}")]
    Row { line: u64, message: String },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Business columns carried by a snapshot, after header normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSchema {
    business_fields: Vec<String>,
}

/// Fields present on one side only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaDiff {
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

impl SnapshotSchema {
    pub fn new(business_fields: impl IntoIterator<Item = impl Into<String>>) -> Result<Self, SnapshotError> {
        let business_fields: Vec<String> = business_fields.into_iter().map(Into::into).collect();
        let mut seen = BTreeSet::new();
        for field in &business_fields {
            validate_identifier(field).map_err(|err| SnapshotError::SchemaMismatch(err.to_string()))?;
            if KEY_COLUMNS.contains(&field.as_str()) {
                return Err(SnapshotError::SchemaMismatch(format!(
                    "{field} cannot be a business field"
                )));
            }
            if !seen.insert(field.as_str()) {
                return Err(SnapshotError::SchemaMismatch(format!(
                    "column {field} appears twice"
                )));
            }
        }
        Ok(Self { business_fields })
    }

    pub fn business_fields(&self) -> &[String] {
        &self.business_fields
    }

    /// Compares against the fields the store expects; order is ignored.
    pub fn diff(&self, expected: &[String]) -> SchemaDiff {
        let ours: BTreeSet<&str> = self.business_fields.iter().map(String::as_str).collect();
        let theirs: BTreeSet<&str> = expected.iter().map(String::as_str).collect();
        SchemaDiff {
            missing: theirs.difference(&ours).map(|s| s.to_string()).collect(),
            unexpected: ours.difference(&theirs).map(|s| s.to_string()).collect(),
        }
    }
}

/// One bounded batch of snapshot rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotChunk {
    pub index: usize,
    pub records: Vec<SnapshotRecord>,
}

/// A finite sequence of chunks sharing one column schema.
pub trait SnapshotSource: Send {
    fn schema(&self) -> &SnapshotSchema;

    /// Content digest used to recognize a replay of the same snapshot.
    fn fingerprint(&self) -> Option<&str>;

    fn next_chunk(&mut self) -> Result<Option<SnapshotChunk>, SnapshotError>;
}

/// Lowercase, spaces to underscores, question marks dropped.
pub fn normalize_column_name(raw: &str) -> String {
    raw.trim().replace(' ', "_").to_lowercase().replace('?', "")
}

pub fn parse_received_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    // chrono's %Y also takes two digits, so the slash format follows the year width.
    let format = match raw.rsplit_once('/') {
        Some((_, year)) if year.len() == 2 => "%m/%d/%y",
        Some((_, year)) if year.len() == 4 => "%m/%d/%Y",
        Some(_) => return None,
        None => "%Y-%m-%d",
    };
    NaiveDate::parse_from_str(raw, format)
        .ok()
        .map(|date| Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)))
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[derive(Debug, Clone)]
struct HeaderLayout {
    entity_id: usize,
    received_at: usize,
    /// (column index, field name) for every business column.
    fields: Vec<(usize, String)>,
}

fn layout_from_header<'a>(
    header: impl IntoIterator<Item = &'a str>,
) -> Result<(HeaderLayout, SnapshotSchema), SnapshotError> {
    let mut entity_id = None;
    let mut received_at = None;
    let mut fields = Vec::new();

    for (index, raw) in header.into_iter().enumerate() {
        let name = normalize_column_name(raw);
        match name.as_str() {
            ENTITY_ID_COLUMN => entity_id = Some(index),
            RECEIVED_AT_COLUMN => received_at = Some(index),
            _ => fields.push((index, name)),
        }
    }

    let entity_id = entity_id.ok_or_else(|| {
        SnapshotError::SchemaMismatch(format!("header has no {ENTITY_ID_COLUMN} column"))
    })?;
    let received_at = received_at.ok_or_else(|| {
        SnapshotError::SchemaMismatch(format!("header has no {RECEIVED_AT_COLUMN} column"))
    })?;
    let schema = SnapshotSchema::new(fields.iter().map(|(_, name)| name.clone()))?;

    Ok((
        HeaderLayout {
            entity_id,
            received_at,
            fields,
        },
        schema,
    ))
}

/// Streams the complaints export in fixed-size chunks.
pub struct CsvSnapshotSource {
    path: PathBuf,
    reader: csv::Reader<File>,
    layout: HeaderLayout,
    schema: SnapshotSchema,
    chunk_size: usize,
    chunks_read: usize,
    digest: String,
    record: csv::StringRecord,
}

impl CsvSnapshotSource {
    pub fn open(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self, SnapshotError> {
        let path = path.as_ref();
        let unreachable = |source| SnapshotError::Unreachable {
            path: path.display().to_string(),
            source,
        };

        let digest = sha256_reader_hex(File::open(path).map_err(unreachable)?)
            .map_err(unreachable)?;
        let file = File::open(path).map_err(unreachable)?;
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);
        let header = reader.headers()?.clone();
        let (layout, schema) = layout_from_header(header.iter())?;

        debug!(
            path = %path.display(),
            fields = schema.business_fields().len(),
            %digest,
            "opened csv snapshot"
        );

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            layout,
            schema,
            chunk_size: chunk_size.max(1),
            chunks_read: 0,
            digest,
            record: csv::StringRecord::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record_to_snapshot(&self) -> Result<SnapshotRecord, SnapshotError> {
        let line = self.record.position().map(|p| p.line()).unwrap_or_default();
        let cell = |index: usize| self.record.get(index).unwrap_or_default();

        let raw_id = cell(self.layout.entity_id).trim();
        let entity_id: EntityId = raw_id.parse().map_err(|_| SnapshotError::Row {
            line,
            message: format!("invalid {ENTITY_ID_COLUMN} {raw_id:?}"),
        })?;
        let raw_received = cell(self.layout.received_at);
        let received_at = parse_received_at(raw_received).ok_or_else(|| SnapshotError::Row {
            line,
            message: format!("invalid {RECEIVED_AT_COLUMN} {raw_received:?}"),
        })?;

        let payload = Payload::from_fields(
            self.layout
                .fields
                .iter()
                .map(|(index, name)| (name.clone(), non_empty(cell(*index)))),
        );

        Ok(SnapshotRecord {
            entity_id,
            received_at,
            payload,
        })
    }
}

impl SnapshotSource for CsvSnapshotSource {
    fn schema(&self) -> &SnapshotSchema {
        &self.schema
    }

    fn fingerprint(&self) -> Option<&str> {
        Some(&self.digest)
    }

    fn next_chunk(&mut self) -> Result<Option<SnapshotChunk>, SnapshotError> {
        let mut records = Vec::with_capacity(self.chunk_size.min(DEFAULT_CHUNK_SIZE));
        while records.len() < self.chunk_size {
            if !self.reader.read_record(&mut self.record)? {
                break;
            }
            records.push(self.record_to_snapshot()?);
        }

        if records.is_empty() {
            return Ok(None);
        }
        let index = self.chunks_read;
        self.chunks_read += 1;
        debug!(chunk = index, rows = records.len(), "read snapshot chunk");
        Ok(Some(SnapshotChunk { index, records }))
    }
}

/// Snapshot held in memory, used by fixtures and tests.
#[derive(Debug, Clone)]
pub struct StaticSnapshotSource {
    schema: SnapshotSchema,
    pending: VecDeque<Vec<SnapshotRecord>>,
    fingerprint: String,
    chunks_read: usize,
}

impl StaticSnapshotSource {
    /// Records missing a schema field get it as NULL; extra fields are a schema mismatch.
    pub fn new(
        schema: SnapshotSchema,
        records: Vec<SnapshotRecord>,
        chunk_size: usize,
    ) -> Result<Self, SnapshotError> {
        let mut normalized = Vec::with_capacity(records.len());
        for mut record in records {
            if let Some(extra) = record
                .payload
                .field_names()
                .find(|name| !schema.business_fields.iter().any(|f| f == name))
            {
                return Err(SnapshotError::SchemaMismatch(format!(
                    "complaint {} carries unknown field {extra}",
                    record.entity_id
                )));
            }
            for field in &schema.business_fields {
                if !record.payload.contains_field(field) {
                    record.payload.insert(field.clone(), None);
                }
            }
            normalized.push(record);
        }

        let fingerprint = sha256_hex(
            &serde_json::to_vec(&(&schema, &normalized)).context("serializing snapshot for digest")?,
        );
        let pending = normalized
            .chunks(chunk_size.max(1))
            .map(<[SnapshotRecord]>::to_vec)
            .collect();

        Ok(Self {
            schema,
            pending,
            fingerprint,
            chunks_read: 0,
        })
    }

    pub fn from_json_file(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self, SnapshotError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SnapshotError::Unreachable {
            path: path.display().to_string(),
            source,
        })?;
        let fixture: SnapshotFixture = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        fixture.into_source(chunk_size)
    }
}

impl SnapshotSource for StaticSnapshotSource {
    fn schema(&self) -> &SnapshotSchema {
        &self.schema
    }

    fn fingerprint(&self) -> Option<&str> {
        Some(&self.fingerprint)
    }

    fn next_chunk(&mut self) -> Result<Option<SnapshotChunk>, SnapshotError> {
        Ok(self.pending.pop_front().map(|records| {
            let index = self.chunks_read;
            self.chunks_read += 1;
            SnapshotChunk { index, records }
        }))
    }
}

/// On-disk fixture format for hand-written snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFixture {
    pub business_fields: Vec<String>,
    pub records: Vec<FixtureRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureRecord {
    pub complaint_id: EntityId,
    pub date_received: String,
    #[serde(default)]
    pub fields: std::collections::BTreeMap<String, Option<String>>,
}

impl SnapshotFixture {
    pub fn into_source(self, chunk_size: usize) -> Result<StaticSnapshotSource, SnapshotError> {
        let schema = SnapshotSchema::new(self.business_fields)?;
        let records = self
            .records
            .into_iter()
            .enumerate()
            .map(|(index, record)| {
                let received_at = parse_received_at(&record.date_received).ok_or_else(|| {
                    SnapshotError::Row {
                        line: index as u64 + 1,
                        message: format!("invalid date_received {:?}", record.date_received),
                    }
                })?;
                Ok(SnapshotRecord {
                    entity_id: record.complaint_id,
                    received_at,
                    payload: Payload::from_fields(record.fields),
                })
            })
            .collect::<Result<Vec<_>, SnapshotError>>()?;
        StaticSnapshotSource::new(schema, records, chunk_size)
    }
}
