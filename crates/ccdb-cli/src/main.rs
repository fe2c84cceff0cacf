use anyhow::{bail, Context, Result};
use ccdb_sync::{ReconcileConfig, ReconcileError, RunOutcome};
use clap::{Parser, Subcommand};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "ccdb-cli")]
#[command(about = "Consumer complaint version ledger")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the snapshot against the store, bulk loading if the table is missing.
    Sync,
    /// Create the versioned table from the snapshot header.
    Migrate,
    /// Load the full snapshot into a new table.
    BulkLoad,
    /// Run `sync` on the configured cron until interrupted.
    Schedule,
    /// Print a digest of recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn log_failure(err: ReconcileError) -> anyhow::Error {
    error!(error = %err, cutoff = ?err.cutoff(), "run aborted");
    err.into()
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = ReconcileConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => match ccdb_sync::run_once_from_env()
            .await
            .map_err(log_failure)?
        {
            RunOutcome::Bootstrapped(load) => println!(
                "bulk load complete: run_id={} table={} rows={} written={} skipped={}",
                load.run_id, load.table, load.rows_read, load.versions_written, load.duplicates_skipped
            ),
            RunOutcome::Reconciled(summary) => println!(
                "sync complete: run_id={} cutoff={} stamp={} new={} changed={} removed={} unchanged={} written={} reports={}",
                summary.run_id,
                summary.window.cutoff,
                summary.window.update_stamp,
                summary.counts.new,
                summary.counts.changed,
                summary.counts.removed,
                summary.counts.unchanged,
                summary.versions_written,
                summary.reports_dir.as_deref().unwrap_or("-")
            ),
        },
        Commands::Migrate => {
            let created = ccdb_sync::migrate_from_config(&config)
                .await
                .map_err(log_failure)?;
            if created {
                println!("created table {}", config.table);
            } else {
                println!("table {} already exists", config.table);
            }
        }
        Commands::BulkLoad => {
            let load = ccdb_sync::bulk_load_from_config(&config)
                .await
                .map_err(log_failure)?;
            println!(
                "bulk load complete: run_id={} table={} chunks={} written={} skipped={}",
                load.run_id, load.table, load.chunks, load.versions_written, load.duplicates_skipped
            );
        }
        Commands::Schedule => {
            let config = ReconcileConfig {
                scheduler_enabled: true,
                ..config
            };
            let Some(mut sched) = ccdb_sync::maybe_build_scheduler(&config).await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            let Some(root) = config.reports_dir.as_deref() else {
                bail!("CCDB_REPORTS_DIR is empty; no reports to summarize");
            };
            println!("{}", ccdb_sync::report_daily_markdown(runs, root)?);
        }
    }

    Ok(())
}
