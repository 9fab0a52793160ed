// channelcast engine
//
// One process, one channel:
//   - SQLite catalog / queue / schedule / history
//   - a long-lived ffmpeg writing HLS into the output directory
//   - a small JSON API plus a WebSocket for "now playing"
//
// Run behind a reverse proxy for anything beyond loopback.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use channelcast_engine::api::{build_router, AppState};
use channelcast_engine::config::Config;
use channelcast_engine::db::Store;
use channelcast_engine::feeder::Feeder;
use channelcast_engine::hub::WsHub;
use channelcast_engine::library::{scan_directory, ScanMode};
use channelcast_engine::player::{Coordinator, PlayoutSettings};
use channelcast_engine::probe::probe_file;

const HUB_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The hub exists before logging so every line can be mirrored to /api/ws.
    let hub = WsHub::new(HUB_CAPACITY);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .with(tracing_subscriber::fmt::layer())
        .with(hub.log_layer())
        .init();

    let cfg = Config::from_env()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        db = %cfg.db_path.display(),
        output_dir = %cfg.output_dir.display(),
        "channelcast engine starting"
    );

    let store = Store::open(&cfg.db_path)
        .with_context(|| format!("opening database {}", cfg.db_path.display()))?;

    // Optional library scan before playout starts, so a fresh install has
    // something to schedule.
    if let Some(dir) = cfg.video_dir.clone() {
        let ffprobe = cfg.ffprobe.clone();
        let result = store
            .run(move |s| {
                scan_directory(s, &dir, &[], ScanMode::CatalogOnly, |p| probe_file(&ffprobe, p))
            })
            .await;
        match result {
            Ok(report) => info!(cataloged = report.cataloged, "startup scan finished"),
            Err(e) => warn!("startup scan failed: {e}"),
        }
    }

    let feeder = Arc::new(Feeder::new(cfg.feeder()));
    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        feeder,
        Arc::new(hub.clone()),
        PlayoutSettings::default(),
    ));

    // Keep serving even if ffmpeg is missing; status surfaces the error and
    // /api/stream/start can retry.
    if let Err(e) = coordinator.start().await {
        error!("playout did not start: {e}");
    }

    let state = AppState {
        store,
        coordinator: coordinator.clone(),
        hub,
        ffprobe: cfg.ffprobe.clone(),
    };
    let app = build_router(state, &cfg.output_dir);

    info!("channelcast engine listening on http://{}", cfg.bind);

    let listener = tokio::net::TcpListener::bind(cfg.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    match coordinator.stop().await {
        Ok(()) => {}
        Err(e) => info!("playout already stopped: {e}"),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
