use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use plexbridge::config::ConfigStore;
use plexbridge::db;
use plexbridge::db::Repository;
use plexbridge::epg::EpgIngester;
use plexbridge::events::EventBus;
use plexbridge::metrics::Metrics;
use plexbridge::scheduler::EpgScheduler;
use plexbridge::server::{start_server, AppState};
use plexbridge::ssdp::run_ssdp;
use plexbridge::stream::SessionManager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Database: resolve path, run migrations, build the pool.
    let db_path = db::get_db_path()?;
    let database_url = db_path.to_string_lossy().to_string();
    tracing::info!(path = %database_url, "opening database");

    let mut conn = db::establish_connection(&database_url)
        .map_err(|e| format!("Failed to connect to database: {}", e))?;
    db::run_migrations(&mut conn).map_err(|e| format!("Failed to run migrations: {}", e))?;
    drop(conn);

    let pool = db::create_pool(&database_url)?;
    let repo = Repository::new(pool.clone());

    // Shared infrastructure.
    let events = EventBus::new();
    let metrics = Arc::new(Metrics::new());
    let config = Arc::new(ConfigStore::load(repo.clone(), events.clone())?);

    let settings = config.get();
    tracing::info!(
        device_id = %settings.device_id,
        friendly_name = %settings.friendly_name,
        base_url = %settings.base_url(),
        "tuner identity ready"
    );

    let ffmpeg_path = std::env::var("PLEXBRIDGE_FFMPEG").unwrap_or_else(|_| "ffmpeg".to_string());
    let sessions = SessionManager::new(
        Arc::clone(&config),
        repo.clone(),
        events.clone(),
        Arc::clone(&metrics),
        ffmpeg_path,
    );
    sessions.spawn_background_tasks();

    // EPG: one refresh at startup, then per-source scheduled jobs.
    let ingester = EpgIngester::new(repo.clone(), Arc::clone(&metrics));
    let scheduler = EpgScheduler::new(repo.clone(), ingester.clone());
    {
        let scheduler = scheduler.clone();
        let ingester = ingester.clone();
        tokio::spawn(async move {
            ingester.refresh_all().await;
            if let Err(e) = scheduler.start().await {
                tracing::error!(error = %e, "failed to start EPG scheduler; automatic refresh disabled");
                return;
            }
            if let Err(e) = scheduler.sync_jobs().await {
                tracing::error!(error = %e, "failed to schedule EPG refresh jobs");
            }
        });
    }

    // SSDP responder with its own shutdown signal so byebye goes out first.
    let (ssdp_shutdown_tx, ssdp_shutdown_rx) = watch::channel(false);
    let ssdp_task = tokio::spawn(run_ssdp(Arc::clone(&config), ssdp_shutdown_rx));

    let state = AppState::new(
        pool,
        repo,
        Arc::clone(&config),
        Arc::clone(&sessions),
        events,
        metrics,
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
        tracing::info!("shutdown signal received");
    };

    start_server(state, shutdown).await?;

    // Orderly teardown: announce departure, stop refresh jobs, drain sessions.
    let _ = ssdp_shutdown_tx.send(true);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), ssdp_task).await;
    if let Err(e) = scheduler.stop().await {
        tracing::warn!(error = %e, "EPG scheduler stop failed");
    }
    sessions.shutdown_all().await;

    tracing::info!("shutdown complete");
    Ok(())
}
