use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use query_processor::config::Args;
use query_processor::export::Exporter;
use query_processor::flag::ShutdownFlag;
use query_processor::lifecycle::LifecycleRecorder;
use query_processor::reaper::Reaper;
use query_processor::scheduler::AdmissionScheduler;
use query_processor::store::Store;
use query_processor::transfer::{TmpRoot, TransferService};

/// Refuse to start rather than silently running against a stale schema.
/// Unlike `Migrator::run`, this never applies anything; it only compares
/// the migrations bundled into this binary against what the `_sqlx_migrations`
/// bookkeeping table in `pool` already records as applied.
async fn ensure_migrations_applied(
    migrator: &sqlx::migrate::Migrator,
    pool: &sqlx::PgPool,
) -> anyhow::Result<()> {
    let applied: Vec<i64> = sqlx::query_scalar(
        "SELECT version FROM _sqlx_migrations WHERE success ORDER BY version",
    )
    .fetch_all(pool)
    .await
    .unwrap_or_default();

    let pending: Vec<_> = migrator
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .collect();

    if !pending.is_empty() {
        anyhow::bail!(
            "{} pending migration(s) are not applied to this database; \
             pass --auto-migrate to apply them automatically",
            pending.len()
        );
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    let args = Args::parse();

    let pool = sqlx::PgPool::connect(&args.database_url)
        .await
        .context("failed to connect to the durable store")?;

    let migrator = sqlx::migrate!("./migrations");
    if args.auto_migrate {
        migrator
            .run(&pool)
            .await
            .context("failed to apply pending migrations")?;
    } else {
        ensure_migrations_applied(&migrator, &pool).await?;
    }

    let store = Store::new(pool);
    let lifecycle = LifecycleRecorder::new(store.clone());

    tracing::info!("running startup reaper sweep");
    let reaper = Reaper::new(store.clone(), lifecycle.clone());
    let reaped = reaper
        .reconcile_on_startup()
        .await
        .context("startup reaper sweep failed")?;
    if reaped > 0 {
        tracing::warn!(reaped, "failed queries left running by a prior process");
    }

    TmpRoot::new(args.export.tmp_export_location.clone())
        .ensure()
        .await
        .context("failed to prepare the tmp export directory")?;

    let transfer = Arc::new(TransferService::new(args.ssh.clone()));
    let exporter = Arc::new(Exporter::new());
    let shutdown = ShutdownFlag::new();

    let mut scheduler = AdmissionScheduler::new(
        args.scheduler.clone(),
        args.export.clone(),
        store,
        lifecycle,
        transfer,
        exporter,
        shutdown.clone(),
        std::time::Duration::from_secs(args.shutdown_deadline_seconds),
    );
    scheduler.seed().await.context("failed to seed the admission ledger")?;

    tokio::task::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal, draining outstanding queries");
        shutdown.raise();
    });

    tracing::info!("query-processor starting up");

    // Runs until `shutdown` is raised; the deadline bounds only the
    // post-signal drain, never the steady-state tick loop.
    scheduler.run().await?;

    Ok(())
}
