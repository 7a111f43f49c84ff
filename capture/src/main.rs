//! Doorwatch – records doorbell cameras and posts motion clips to a chat
//! webhook.
//!
//! This binary:
//! 1. Reads configuration from `.env` (or the path given as first argument)
//! 2. Starts one ffmpeg segment recorder per camera
//! 3. Runs the HTTP ingress the cloud bridge posts session signals to
//! 4. Moves the segment matching each motion signal into `motion/` and
//!    sends it to the webhook

mod capture;
mod correlator;
mod dispatch;
mod notifier;
mod server;
mod session;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::capture::SegmentOptions;
use crate::correlator::Correlator;
use crate::dispatch::Dispatcher;
use crate::notifier::Notifier;
use crate::session::Session;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| doorwatch_common::config::Config::default_path().to_string());
    let config = doorwatch_common::config::load(&PathBuf::from(&config_path))
        .context("Config load failed")?;

    info!(
        "Doorwatch starting (location={}, output={})",
        config.location_id,
        config.output_dir.display()
    );

    std::fs::create_dir_all(config.motion_dir()).context("Cannot create motion directory")?;

    // ── session ──────────────────────────────────────────────────────
    let (session, events) = Session::new(&config);
    let locations = session.locations();
    if locations.is_empty() {
        info!("No locations found");
        return Ok(());
    }

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        on_signal.cancel();
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── correlation ──────────────────────────────────────────────────
    let notifier = match &config.webhook_url {
        Some(url) => Some(Notifier::new(url)?),
        None => {
            warn!("WEBHOOK_URL not set – motion clips will be kept but not sent");
            None
        }
    };
    let correlator = Arc::new(Correlator::new(
        &config.output_dir,
        config.motion_window(),
        notifier,
    ));

    // ── start recording ──────────────────────────────────────────────
    let mut dispatcher = Dispatcher::new(
        session.clone(),
        correlator,
        SegmentOptions::from_config(&config),
        shutdown.clone(),
    );
    for location in &locations {
        for camera in &location.cameras {
            if let Err(e) = dispatcher.start_camera(location, camera) {
                error!("Cannot record camera {}: {e:#}", camera.id);
            }
        }
    }
    info!("Listening for motion and doorbell presses on your cameras.");

    // ── start HTTP ingress ───────────────────────────────────────────
    let listen_addr = config.bridge_listen_addr.clone();
    let server_session = session.clone();
    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::run(server_session, &listen_addr, server_shutdown.clone()).await {
            error!("HTTP server error: {e:#}");
            server_shutdown.cancel();
        }
    });

    // Runs until shutdown
    dispatcher.run(events).await;

    shutdown.cancel();
    let _ = server_handle.await;
    info!("Doorwatch stopped");

    Ok(())
}
