//! # Kismet → TAK Bridge Server
//!
//! Polls a Kismet server, keeps the diffed device picture, pushes batched events to dashboard
//! WebSocket clients and broadcasts located devices as Cursor-on-Target to a TAK target.
//!
//! ## Functionality:
//! - **Configuration**: `.env` files, then env/CLI flags, then the JSON5 engine file named by
//!   `--config-path`.
//! - **Logging**: console plus daily-rolling JSON files through `lib_bridge::loggers`.
//! - **Dashboard**: axum server with `/ws`, `/health`, `/status`, device queries and control
//!   endpoints.
//! - **Graceful Shutdown**: `tokio-graceful` stops the bridge actor and the server on
//!   Ctrl-C/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_graceful::Shutdown;
use tracing::{error, info};

use lib_bridge::core::SystemClock;
use lib_bridge::ingestors::KismetPollingSource;
use lib_bridge::loggers::{setup_logging, LogOptions};
use lib_bridge::tak::NetConnector;
use lib_bridge::BridgeManager;

mod bridge_logic;
use bridge_logic::{config, downstream};

/// Loads `.env` and then the platform file, before clap reads the environment.
fn load_dotenv() {
    let dotenv_os: &str = if cfg!(target_os = "windows") { ".env.windows" } else { ".env.linux" };
    dotenvy::dotenv().ok();
    dotenvy::from_filename(dotenv_os).ok();
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    let config = config::load_config();

    let log_options = LogOptions {
        level: config.log_level.clone().unwrap_or_else(|| "info".to_string()),
        dir: config.log_dir.clone().unwrap_or_else(|| "./logs".into()),
        file_prefix: "server_bridge".to_string(),
        console: true,
    };
    let _log_guard = setup_logging(&log_options).context("initializing logging")?;

    let bridge_config = config.bridge_config()?;
    info!(
        kismet = %bridge_config.source.api_url,
        poll_ms = bridge_config.source.poll_interval_ms,
        tak_enabled = bridge_config.tak.enabled,
        "Starting bridge"
    );

    let source = KismetPollingSource::new(&bridge_config.source).context("building Kismet source")?;
    let (manager, handle) = BridgeManager::new(
        bridge_config,
        Arc::new(source),
        Arc::new(NetConnector),
        Arc::new(SystemClock),
    )
    .context("building bridge")?;

    // Ctrl-C/SIGTERM, or the bridge stopping on its own (e.g. the server failed to bind).
    let stopped = handle.clone();
    let shutdown: Shutdown = Shutdown::new(async move {
        tokio::select! {
            _ = tokio_graceful::default_signal() => {}
            _ = stopped.stopped() => {}
        }
    });

    shutdown.spawn_task(manager.run());

    let watcher = handle.clone();
    shutdown.spawn_task_fn(move |guard| async move {
        guard.cancelled().await;
        info!("Signal received: stopping bridge");
        watcher.shutdown();
    });

    let server_config = config.clone();
    shutdown.spawn_task_fn(move |guard| downstream::run(server_config, handle, guard));

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => {
            info!("shutdown: gracefully {}s after shutdown signal received", elapsed.as_secs_f64());
        }
        Err(e) => {
            error!("shutdown: forcefully due to timeout: {}", e);
        }
    }

    info!("Bye!");
    Ok(())
}
