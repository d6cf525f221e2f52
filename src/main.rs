use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use valwatch::config::Config;
use valwatch::dashboard::{self, DashboardState};
use valwatch::detector::DeltaDetector;
use valwatch::engine::Reconciler;
use valwatch::lookup::Lookup;
use valwatch::metrics::CycleMetrics;
use valwatch::notify::{Dispatcher, LogNotifier, Notifier, TelegramNotifier};
use valwatch::snapshot::{FileSource, HttpSource, SnapshotCache, SnapshotSource};
use valwatch::store::open_store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Load config
    let config = if Path::new("valwatch.toml").exists() {
        Config::load(Path::new("valwatch.toml"))?
    } else {
        Config::from_env()
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("valwatch v{} starting", env!("CARGO_PKG_VERSION"));

    // --- Snapshot Source ---
    let load_timeout = Duration::from_millis(config.source.load_timeout_ms);
    let source: Arc<dyn SnapshotSource> = if !config.source.url.is_empty() {
        Arc::new(HttpSource::new(config.source.url.clone(), load_timeout)?)
    } else {
        Arc::new(FileSource::new(&config.source.path))
    };
    info!(source = %source.describe(), ttl_secs = config.source.ttl_secs, "snapshot source configured");

    let cache = Arc::new(SnapshotCache::new(
        source,
        Duration::from_secs(config.source.ttl_secs),
        load_timeout,
    ));

    // --- Baseline Store ---
    let store = open_store(&config.store, config.alerts.default_skip_limit).await?;

    // --- Notifier ---
    let notifier: Arc<dyn Notifier> = if config.has_telegram() {
        if config.telegram.public_channel_id.is_empty() {
            warn!("no telegram.public_channel_id set, public alerts will fail to deliver");
        }
        info!("telegram notifier enabled");
        Arc::new(TelegramNotifier::new(
            config.telegram.api_url.clone(),
            config.telegram.bot_token.clone(),
            config.telegram.public_channel_id.clone(),
            config.alerts.unit_scale,
            Duration::from_millis(config.telegram.send_timeout_ms),
        )?)
    } else {
        warn!("no TELEGRAM_BOT_TOKEN set, alerts will only be logged");
        Arc::new(LogNotifier)
    };

    // --- Reconciler ---
    let metrics = Arc::new(Mutex::new(CycleMetrics::new()));
    let reconciler = Arc::new(Reconciler::new(
        cache.clone(),
        store,
        DeltaDetector::new(config.alerts.detector_config()),
        Dispatcher::new(notifier, Duration::from_millis(config.telegram.send_timeout_ms)),
        Duration::from_secs(config.schedule.cycle_timeout_secs),
        metrics.clone(),
    ));
    info!(
        whale_threshold = config.alerts.whale_threshold,
        whale_policy = ?config.alerts.whale_policy,
        "alert engine configured"
    );
    let engine_task = reconciler.spawn(
        Duration::from_secs(config.schedule.interval_secs),
        Duration::from_secs(config.schedule.warmup_secs),
    );

    // --- Dashboard ---
    if config.dashboard.enabled {
        let dash_state = DashboardState {
            metrics: metrics.clone(),
            lookup: Lookup::new(cache.clone()),
        };
        let bind = config.dashboard.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = dashboard::serve(dash_state, &bind).await {
                error!(error = %e, "dashboard server error");
            }
        });
    } else {
        info!("dashboard disabled (set dashboard.enabled=true in config)");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down...");
    engine_task.abort();
    cache.clear().await;
    metrics.lock().await.log_summary();

    Ok(())
}
