//! Per-run reports: markdown summary, JSON delta, parquet export and manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use ccdb_core::EntityId;
use ccdb_storage::sha256_hex;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use tokio::fs;

use crate::classify::Classification;
use crate::RunSummary;

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// One appended row as it appears in the run delta.
#[derive(Debug, Clone, Serialize)]
pub struct DeltaEntry {
    pub complaint_id: EntityId,
    pub disposition: ccdb_core::Disposition,
    pub reactivated: bool,
    pub received_at: String,
}

pub fn delta_entries(classifications: &[Classification]) -> Vec<DeltaEntry> {
    classifications
        .iter()
        .filter_map(|c| {
            c.pending.as_ref().map(|pending| DeltaEntry {
                complaint_id: c.entity_id,
                disposition: c.disposition,
                reactivated: c.reactivated,
                received_at: pending.received_at.to_rfc3339(),
            })
        })
        .collect()
}

/// Writes `<reports_root>/<run_id>/` and returns that directory.
pub async fn write_run_reports(
    reports_root: &Path,
    summary: &RunSummary,
    classifications: &[Classification],
) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let entries = delta_entries(classifications);

    fs::write(run_dir.join("run_summary.md"), render_run_summary(summary))
        .await
        .context("writing run_summary.md")?;

    let delta_json = serde_json::to_vec_pretty(&serde_json::json!({
        "summary": summary,
        "changes": entries,
    }))
    .context("serializing run delta")?;
    fs::write(run_dir.join("delta.json"), delta_json)
        .await
        .context("writing delta.json")?;

    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;
    let versions_path = snapshot_dir.join("versions_delta.parquet");
    write_versions_delta_parquet(&versions_path, summary, &entries)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("versions_delta", &run_dir, &versions_path)?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(run_dir)
}

fn render_run_summary(summary: &RunSummary) -> String {
    let c = &summary.counts;
    format!(
        "# Complaint Reconciliation Run\n\n\
         - Run ID: `{}`\n\
         - Table: `{}`\n\
         - Run time: {}\n\
         - Window cutoff (exclusive): {}\n\
         - Update stamp: {}\n\
         - Resumed from checkpoint: {}\n\n\
         ## Inputs\n\
         - Snapshot rows read: {}\n\
         - Snapshot complaints in window: {}\n\
         - Duplicate snapshot rows replaced: {}\n\
         - Stored versions in window: {}\n\
         - Latest-version ties: {}\n\n\
         ## Dispositions\n\
         - new: {} (reactivated: {})\n\
         - changed: {}\n\
         - removed: {}\n\
         - unchanged: {}\n\
         - versions written: {}\n",
        summary.run_id,
        summary.table,
        summary.window.run_time,
        summary.window.cutoff,
        summary.window.update_stamp,
        summary.resumed_checkpoint,
        summary.snapshot_rows_read,
        summary.snapshot_entities,
        summary.snapshot_duplicates,
        summary.prior_versions_read,
        summary.tie_breaks,
        c.new,
        c.reactivated,
        c.changed,
        c.removed,
        c.unchanged,
        summary.versions_written,
    )
}

fn write_versions_delta_parquet(path: &Path, summary: &RunSummary, entries: &[DeltaEntry]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("complaint_id", DataType::Int64, false),
        ArrowField::new("disposition", DataType::Utf8, false),
        ArrowField::new("reactivated", DataType::Boolean, false),
        ArrowField::new("received_at", DataType::Utf8, false),
        ArrowField::new("update_stamp", DataType::Utf8, false),
    ]));

    let ids = Int64Array::from(entries.iter().map(|e| e.complaint_id).collect::<Vec<_>>());
    let dispositions = StringArray::from(
        entries
            .iter()
            .map(|e| Some(e.disposition.as_str()))
            .collect::<Vec<_>>(),
    );
    let reactivated = BooleanArray::from(entries.iter().map(|e| e.reactivated).collect::<Vec<_>>());
    let received = StringArray::from(
        entries
            .iter()
            .map(|e| Some(e.received_at.as_str()))
            .collect::<Vec<_>>(),
    );
    let stamp = summary.window.update_stamp.to_rfc3339();
    let stamps = StringArray::from(
        entries
            .iter()
            .map(|_| Some(stamp.as_str()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(dispositions),
            Arc::new(reactivated),
            Arc::new(received),
            Arc::new(stamps),
        ],
    )
    .context("building versions_delta record batch")?;
    write_parquet(path, batch)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

/// Markdown digest of the most recent `runs` report directories, newest first.
pub fn report_daily_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Complaint Reconciliation Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let delta_path = dir.path().join("delta.json");
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        let delta: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&delta_path)
                .with_context(|| format!("reading {}", delta_path.display()))?,
        )
        .with_context(|| format!("parsing {}", delta_path.display()))?;
        let summary = delta.get("summary");
        let count = |key: &str| {
            summary
                .and_then(|s| s.get("counts"))
                .and_then(|c| c.get(key))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        let stamp = summary
            .and_then(|s| s.get("window"))
            .and_then(|w| w.get("update_stamp"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- update stamp: {stamp}"));
        lines.push(format!(
            "- new: {}, changed: {}, removed: {}, unchanged: {}",
            count("new"),
            count("changed"),
            count("removed"),
            count("unchanged")
        ));
        lines.push(format!("- delta: `{}`", delta_path.display()));
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
