use std::time::Duration;

use calbridge_app::{driver, status};
use calbridge_core::config::load_config;
use calbridge_db::db::connection::create_pool;
use calbridge_db::db::migrate::run_migrations;
use calbridge_service::adapter::caldav::CalDavAdapter;
use calbridge_service::adapter::google::GoogleAdapter;
use calbridge_service::pairing::materialize_pairs;
use calbridge_service::retry::RetryPolicy;
use calbridge_service::store::pg::PgStore;
use calbridge_service::sync::{EngineOptions, SyncEngine};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt};

enum Mode {
    SyncOnce,
    Daemon,
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (filter_layer, filter_handle) = reload::Layer::new(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .init();

    tracing::info!("Starting calbridge calendar sync");

    let mut mode = Mode::SyncOnce;
    let mut dry_run = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "sync" => mode = Mode::SyncOnce,
            "daemon" => mode = Mode::Daemon,
            "status" => mode = Mode::Status,
            "--dry-run" => dry_run = true,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    let config = load_config()?;

    if let Ok(filter) = EnvFilter::try_new(config.logging.level.as_str()) {
        if let Err(e) = filter_handle.modify(|current| *current = filter) {
            tracing::warn!(error = %e, "Failed to update log filter from config");
        }
    } else {
        tracing::warn!(level = %config.logging.level, "Invalid log level in config, keeping debug");
    }

    {
        let database_url = config.database.url.clone();
        tokio::task::spawn_blocking(move || run_migrations(&database_url)).await??;
    }

    let pool = create_pool(
        &config.database.url,
        u32::from(config.database.max_connections),
    )
    .await?;

    if matches!(mode, Mode::Status) {
        return status::print_recent_sessions(&pool, 5).await;
    }

    let retry = RetryPolicy::new(
        config.sync.retry_attempts,
        config.sync.retry_backoff_seconds,
    );
    let google = GoogleAdapter::from_token_file(&config.google.token_path, retry)?;
    let caldav = CalDavAdapter::new(
        config.caldav.server_url.clone(),
        config.caldav.resolve_username()?,
        config.caldav.resolve_password()?,
        retry,
    )?;
    let store = PgStore::new(pool);

    let pairs = materialize_pairs(&google, &caldav, &store, &config.sync).await?;
    tracing::info!(pair_count = pairs.len(), "Calendar pairs ready");

    let options = EngineOptions::from_config(&config.sync, dry_run);
    let engine = SyncEngine::new(google, caldav, store, options);

    match mode {
        Mode::Status => unreachable!("handled above"),
        Mode::Daemon => {
            let trigger = driver::Trigger::new();
            driver::run_loop(
                &engine,
                trigger,
                Duration::from_secs(config.sync.poll_interval_seconds),
            )
            .await?;
            Ok(())
        }
        Mode::SyncOnce => {
            let report = engine.run_session().await?;
            tracing::info!(
                operations = report.total_operations(),
                conflicts = report.conflicts.len(),
                errors = report.errors.len(),
                "One-shot pass finished"
            );
            if report.made_progress() {
                Ok(())
            } else {
                anyhow::bail!("sync session failed: {}", report.errors.join("; "))
            }
        }
    }
}
