use std::path::PathBuf;

use ccdb_core::{Disposition, VersionState};
use ccdb_snapshot::{CsvSnapshotSource, SnapshotSource, StaticSnapshotSource};
use ccdb_storage::{
    CheckpointStatus, CheckpointStore, MemoryVersionStore, StoreSchema, VersionStore,
};
use ccdb_sync::{report_daily_markdown, ReconcileConfig, ReconcileError, Reconciler, RunOutcome};
use chrono::{DateTime, TimeZone, Utc};

const FIELDS: [&str; 5] = ["product", "issue", "company", "state", "company_response_to_consumer"];

fn fixture(name: &str) -> StaticSnapshotSource {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/snapshots")
        .join(name);
    StaticSnapshotSource::from_json_file(path, 2).expect("fixture snapshot")
}

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, day, hour, 0, 0).single().unwrap()
}

fn quiet_config() -> ReconcileConfig {
    ReconcileConfig {
        reports_dir: None,
        checkpoint_path: None,
        ..ReconcileConfig::default()
    }
}

fn reconciler(config: ReconcileConfig) -> Reconciler<MemoryVersionStore> {
    let schema = StoreSchema::new(FIELDS).expect("schema");
    Reconciler::new(config, MemoryVersionStore::with_schema(schema))
}

#[tokio::test]
async fn first_run_inserts_window_and_second_run_classifies_each_change() {
    let reconciler = reconciler(quiet_config());

    let first = reconciler
        .run_at(&mut fixture("run1.json"), at(1, 0))
        .await
        .expect("first run");
    assert_eq!(first.window.cutoff, Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
    assert_eq!(first.counts.new, 3);
    assert_eq!(first.versions_written, 3);
    assert!(reconciler.store().versions_of(90).await.is_empty());

    let second = reconciler
        .run_at(&mut fixture("run2.json"), at(1, 12))
        .await
        .expect("second run");
    assert_eq!(second.counts.new, 1);
    assert_eq!(second.counts.changed, 1);
    assert_eq!(second.counts.removed, 1);
    assert_eq!(second.counts.unchanged, 1);
    assert_eq!(second.versions_written, 3);
    assert_eq!(reconciler.store().len().await, 6);

    let history = reconciler.store().versions_of(102).await;
    assert_eq!(history.len(), 2);
    assert_eq!(
        history[1].state.payload().and_then(|p| p.get("company_response_to_consumer")),
        Some("Closed with explanation")
    );
    assert!(history.iter().all(|v| v.update_stamp <= second.window.update_stamp));
}

#[tokio::test]
async fn removed_complaint_tombstone_keeps_received_at() {
    let reconciler = reconciler(quiet_config());
    reconciler.run_at(&mut fixture("run1.json"), at(1, 0)).await.unwrap();
    let second = reconciler.run_at(&mut fixture("run2.json"), at(1, 12)).await.unwrap();

    let history = reconciler.store().versions_of(103).await;
    assert_eq!(history.len(), 2);
    let tombstone = &history[1];
    assert_eq!(tombstone.state, VersionState::Tombstone);
    assert_eq!(tombstone.received_at, history[0].received_at);
    assert_eq!(tombstone.update_stamp, second.window.update_stamp);
}

#[tokio::test]
async fn rerunning_the_same_snapshot_writes_nothing() {
    let reconciler = reconciler(quiet_config());
    reconciler.run_at(&mut fixture("run1.json"), at(1, 0)).await.unwrap();
    reconciler.run_at(&mut fixture("run2.json"), at(1, 12)).await.unwrap();
    let before = reconciler.store().len().await;

    let replay = reconciler
        .run_at(&mut fixture("run2.json"), at(1, 18))
        .await
        .expect("replay");
    assert_eq!(replay.versions_written, 0);
    assert_eq!(replay.counts.writes(), 0);
    // 101, 102 and 104 present plus the tombstoned 103.
    assert_eq!(replay.counts.unchanged, 4);
    assert_eq!(reconciler.store().len().await, before);
}

#[tokio::test]
async fn tombstoned_complaint_that_reappears_is_reactivated() {
    let reconciler = reconciler(quiet_config());
    reconciler.run_at(&mut fixture("run1.json"), at(1, 0)).await.unwrap();
    reconciler.run_at(&mut fixture("run2.json"), at(1, 12)).await.unwrap();

    let third = reconciler
        .run_at(&mut fixture("run1.json"), at(1, 20))
        .await
        .expect("third run");
    assert_eq!(third.counts.new, 1);
    assert_eq!(third.counts.reactivated, 1);
    assert_eq!(third.counts.changed, 1);
    assert_eq!(third.counts.removed, 1);

    let history = reconciler.store().versions_of(103).await;
    assert_eq!(history.len(), 3);
    assert!(!history[2].is_tombstone());
}

#[tokio::test]
async fn each_complaint_has_at_most_one_version_per_stamp() {
    let reconciler = reconciler(quiet_config());
    for (name, time) in [
        ("run1.json", at(1, 0)),
        ("run2.json", at(1, 12)),
        ("run1.json", at(1, 20)),
        ("run2.json", at(1, 22)),
    ] {
        reconciler.run_at(&mut fixture(name), time).await.unwrap();
    }

    let rows = reconciler.store().rows().await;
    let mut keys: Vec<_> = rows.iter().map(|v| (v.entity_id, v.update_stamp)).collect();
    keys.sort();
    let total = keys.len();
    keys.dedup();
    assert_eq!(keys.len(), total);
}

#[tokio::test]
async fn second_run_sharing_a_stamp_aborts_before_writing() {
    let reconciler = reconciler(quiet_config());
    reconciler.run_at(&mut fixture("run1.json"), at(1, 0)).await.unwrap();

    let err = reconciler
        .run_at(&mut fixture("run2.json"), at(1, 0))
        .await
        .expect_err("same stamp");
    assert!(matches!(err, ReconcileError::ClockRegression { .. }));
    assert_eq!(err.cutoff(), Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()));
    assert_eq!(reconciler.store().len().await, 3);
}

#[tokio::test]
async fn interrupted_run_resumes_with_checkpointed_stamp() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint_path = dir.path().join("checkpoint.json");
    let reconciler = reconciler(ReconcileConfig {
        checkpoint_path: Some(checkpoint_path.clone()),
        ..quiet_config()
    });

    let first = reconciler.run_at(&mut fixture("run1.json"), at(1, 0)).await.unwrap();
    let checkpoints = CheckpointStore::new(&checkpoint_path);
    let mut saved = checkpoints.load().await.unwrap().expect("checkpoint");
    assert_eq!(saved.status, CheckpointStatus::Committed);
    assert_eq!(saved.update_stamp, first.window.update_stamp);

    // Crash after the append committed but before the checkpoint was finalized.
    saved.status = CheckpointStatus::Started;
    checkpoints.save(&saved).await.unwrap();

    let resumed = reconciler
        .run_at(&mut fixture("run1.json"), at(3, 0))
        .await
        .expect("resumed run");
    assert!(resumed.resumed_checkpoint);
    assert_eq!(resumed.window.update_stamp, first.window.update_stamp);
    assert_eq!(resumed.window.cutoff, first.window.cutoff);
    assert_eq!(resumed.versions_written, 0);
    assert_eq!(resumed.counts.unchanged, 3);
    assert_eq!(reconciler.store().len().await, 3);

    let finalized = checkpoints.load().await.unwrap().expect("checkpoint");
    assert_eq!(finalized.status, CheckpointStatus::Committed);
}

#[tokio::test]
async fn checkpoint_for_another_snapshot_is_not_reused() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint_path = dir.path().join("checkpoint.json");
    let reconciler = reconciler(ReconcileConfig {
        checkpoint_path: Some(checkpoint_path.clone()),
        ..quiet_config()
    });

    reconciler.run_at(&mut fixture("run1.json"), at(1, 0)).await.unwrap();
    let checkpoints = CheckpointStore::new(&checkpoint_path);
    let mut saved = checkpoints.load().await.unwrap().unwrap();
    saved.status = CheckpointStatus::Started;
    checkpoints.save(&saved).await.unwrap();

    let next = reconciler.run_at(&mut fixture("run2.json"), at(1, 12)).await.unwrap();
    assert!(!next.resumed_checkpoint);
    assert_eq!(next.versions_written, 3);
}

#[tokio::test]
async fn schema_mismatch_fails_before_any_write() {
    let schema = StoreSchema::new(["product", "issue", "tags"]).unwrap();
    let reconciler = Reconciler::new(quiet_config(), MemoryVersionStore::with_schema(schema));

    let err = reconciler
        .run_at(&mut fixture("run1.json"), at(1, 0))
        .await
        .expect_err("mismatch");
    match &err {
        ReconcileError::SchemaMismatch { detail, cutoff } => {
            assert!(detail.contains("tags"));
            assert!(cutoff.is_some());
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(reconciler.store().is_empty().await);
}

#[tokio::test]
async fn unreachable_store_aborts_with_cutoff() {
    let reconciler = reconciler(quiet_config());
    reconciler.store().set_unreachable(true).await;

    let err = reconciler
        .run_at(&mut fixture("run1.json"), at(1, 0))
        .await
        .expect_err("unreachable");
    assert!(matches!(err, ReconcileError::StoreUnreachable { .. }));
    assert!(err.to_string().contains("2024-05-01"));
}

#[tokio::test]
async fn missing_table_is_bulk_loaded_then_reconciled() {
    let reconciler = Reconciler::new(quiet_config(), MemoryVersionStore::new());

    let outcome = reconciler
        .sync(&mut fixture("run1.json"), at(1, 0))
        .await
        .expect("bootstrap");
    let load = match outcome {
        RunOutcome::Bootstrapped(load) => load,
        other => panic!("expected bulk load, got {other:?}"),
    };
    assert_eq!(load.rows_read, 4);
    assert_eq!(load.versions_written, 4);
    assert_eq!(load.chunks, 2);
    assert_eq!(reconciler.store().versions_of(90).await.len(), 1);

    let outcome = reconciler
        .sync(&mut fixture("run2.json"), at(1, 12))
        .await
        .expect("reconcile");
    let summary = match outcome {
        RunOutcome::Reconciled(summary) => summary,
        other => panic!("expected reconcile, got {other:?}"),
    };
    assert_eq!(summary.counts.changed, 1);
    assert_eq!(summary.counts.removed, 1);
    assert_eq!(summary.counts.new, 1);
    // 90 sits outside the window; its changed response is never seen.
    assert_eq!(reconciler.store().versions_of(90).await.len(), 1);

    let err = reconciler
        .bootstrap(&mut fixture("run1.json"), at(2, 0))
        .await
        .expect_err("table exists");
    assert!(matches!(err, ReconcileError::TableExists { .. }));
}

#[tokio::test]
async fn reconcile_without_table_reports_missing_table() {
    let reconciler = Reconciler::new(quiet_config(), MemoryVersionStore::new());
    let err = reconciler
        .run_at(&mut fixture("run1.json"), at(1, 0))
        .await
        .expect_err("missing table");
    assert!(matches!(err, ReconcileError::MissingTable { .. }));
}

#[tokio::test]
async fn run_reports_are_written_per_run() {
    let dir = tempfile::tempdir().unwrap();
    let reconciler = reconciler(ReconcileConfig {
        reports_dir: Some(dir.path().to_path_buf()),
        ..quiet_config()
    });

    let mut source = fixture("run1.json");
    assert!(source.fingerprint().is_some());
    let summary = reconciler.run_at(&mut source, at(1, 0)).await.unwrap();

    let run_dir = PathBuf::from(summary.reports_dir.as_deref().expect("reports dir"));
    assert!(run_dir.join("run_summary.md").exists());
    assert!(run_dir.join("snapshots/versions_delta.parquet").exists());
    assert!(run_dir.join("snapshots/manifest.json").exists());

    let delta: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(run_dir.join("delta.json")).unwrap()).unwrap();
    let changes = delta["changes"].as_array().expect("changes");
    assert_eq!(changes.len(), 3);
    assert!(changes
        .iter()
        .all(|c| c["disposition"] == Disposition::New.as_str()));
    assert_eq!(delta["summary"]["counts"]["new"], 3);

    let digest = report_daily_markdown(5, dir.path()).unwrap();
    assert!(digest.contains(&summary.run_id.to_string()));
    assert!(digest.contains("new: 3"));
}

#[tokio::test]
async fn two_digit_year_export_stays_in_window_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("complaints.csv");
    std::fs::write(
        &path,
        "Date received,Product,Company,Complaint ID\n\
         05/10/24,Mortgage,ACME BANK,501\n\
         05/20/24,Credit card,ACME CARD,502\n",
    )
    .unwrap();

    let schema = StoreSchema::new(["product", "company"]).unwrap();
    let reconciler = Reconciler::new(quiet_config(), MemoryVersionStore::with_schema(schema));

    let first = reconciler
        .run_at(&mut CsvSnapshotSource::open(&path, 10).unwrap(), at(1, 0))
        .await
        .expect("first run");
    assert_eq!(first.snapshot_entities, 2);
    assert_eq!(first.counts.new, 2);

    let second = reconciler
        .run_at(&mut CsvSnapshotSource::open(&path, 10).unwrap(), at(1, 12))
        .await
        .expect("second run");
    assert_eq!(second.counts.removed, 0);
    assert_eq!(second.counts.unchanged, 2);
    assert_eq!(second.versions_written, 0);
    assert_eq!(
        reconciler.store().versions_of(501).await[0].received_at,
        Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap()
    );
}

#[tokio::test]
async fn migrated_empty_table_accepts_full_history_load() {
    let reconciler = Reconciler::new(quiet_config(), MemoryVersionStore::new());
    let fields: Vec<String> = FIELDS.iter().map(|f| f.to_string()).collect();
    assert!(reconciler.create_table(&fields).await.unwrap());

    let load = reconciler
        .bootstrap(&mut fixture("run1.json"), at(1, 0))
        .await
        .expect("bulk load into migrated table");
    assert_eq!(load.versions_written, 4);
    assert_eq!(reconciler.store().versions_of(90).await.len(), 1);

    let err = reconciler
        .bootstrap(&mut fixture("run1.json"), at(2, 0))
        .await
        .expect_err("populated table");
    assert!(matches!(err, ReconcileError::TableExists { rows: 4, .. }));
}

#[tokio::test]
async fn sync_bulk_loads_a_migrated_empty_table() {
    let reconciler = reconciler(quiet_config());
    let outcome = reconciler
        .sync(&mut fixture("run1.json"), at(1, 0))
        .await
        .expect("sync");
    assert!(matches!(outcome, RunOutcome::Bootstrapped(_)));
    assert_eq!(reconciler.store().row_count().await.unwrap(), 4);
}

#[tokio::test]
async fn bulk_load_refuses_empty_table_with_other_columns() {
    let schema = StoreSchema::new(["product", "tags"]).unwrap();
    let reconciler = Reconciler::new(quiet_config(), MemoryVersionStore::with_schema(schema));
    let err = reconciler
        .bootstrap(&mut fixture("run1.json"), at(1, 0))
        .await
        .expect_err("column mismatch");
    assert!(matches!(err, ReconcileError::SchemaMismatch { cutoff: None, .. }));
    assert!(reconciler.store().is_empty().await);
}

#[tokio::test]
async fn report_failure_after_commit_still_returns_summary() {
    let dir = tempfile::tempdir().unwrap();
    let not_a_dir = dir.path().join("reports");
    std::fs::write(&not_a_dir, b"occupied").unwrap();
    let reconciler = reconciler(ReconcileConfig {
        reports_dir: Some(not_a_dir),
        ..quiet_config()
    });

    let summary = reconciler
        .run_at(&mut fixture("run1.json"), at(1, 0))
        .await
        .expect("committed run");
    assert_eq!(summary.versions_written, 3);
    assert!(summary.reports_dir.is_none());
    assert_eq!(reconciler.store().len().await, 3);
}
