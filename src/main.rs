//! camsource: camera capture with hot-pluggable USB cameras and video filters
//!
//! Reads control commands from stdin:
//! `front`, `back`, `external`, `blur on|off`, `pixelate on|off`, `start`, `stop`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use camsource::capture::V4l2DeviceFactory;
use camsource::controller::CameraIdentity;
use camsource::filters::{FilterKind, SharedFilter, VideoFilters};
use camsource::hotplug::{AccessPermissionRequester, HotplugEvent, V4l2HotplugMonitor};
use camsource::pipeline::FrameSink;
use camsource::session::SessionManager;
use camsource::{CameraSourceController, Config, Frame};
use color_eyre::{eyre::eyre, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const PUBLISHER_ID: &str = "local";

/// Stand-in for the encoder: counts frames and reports throughput
struct FrameStats {
    started: Instant,
    frames: AtomicU64,
}

impl FrameSink for FrameStats {
    fn on_frame(&self, frame: &Frame) {
        metrics::histogram!("camsource_frame_latency_ms")
            .record(frame.timestamp.elapsed().as_secs_f64() * 1000.0);

        let frames = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if frames % 300 == 0 {
            let fps = frames as f64 / self.started.elapsed().as_secs_f64();
            info!(
                frames,
                fps = %format!("{fps:.1}"),
                width = frame.width(),
                height = frame.height(),
                format = %frame.format(),
                mirrored = frame.meta.mirrored,
                "Frame throughput"
            );
        }
    }
}

fn apply_command(controller: &CameraSourceController, line: &str) -> camsource::CameraResult<()> {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        ["start"] => controller.start(),
        ["stop"] => controller.stop(),
        [position @ ("front" | "back" | "external")] => controller
            .select_camera(CameraIdentity::from_position(position))
            .map(|identity| info!(%identity, "Active camera")),
        [kind @ ("blur" | "pixelate"), state @ ("on" | "off")] => {
            let kind = if *kind == "blur" {
                FilterKind::BackgroundBlur
            } else {
                FilterKind::PixelatedFace
            };
            controller.set_filter_enabled(kind, *state == "on")
        }
        [] => Ok(()),
        _ => {
            warn!(command = line, "Unknown command");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("camsource launching...");

    let (hotplug_tx, hotplug_rx) = flume::unbounded::<HotplugEvent>();

    let controller = CameraSourceController::new(
        Arc::new(V4l2DeviceFactory::new(&config.capture)),
        Arc::new(AccessPermissionRequester::new(hotplug_tx.clone())),
        SharedFilter::new(VideoFilters::new()),
        Arc::new(FrameStats {
            started: Instant::now(),
            frames: AtomicU64::new(0),
        }),
        config.capture.profiles.clone(),
    )
    .with_default_facing(config.capture.default_facing);

    let sessions = Arc::new(Mutex::new(SessionManager::new()));
    let publisher = sessions
        .lock()
        .map_err(|_| eyre!("session table poisoned"))?
        .create_publisher(PUBLISHER_ID, controller)?;

    // Camera events for the application layer
    let events = publisher.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            info!(?event, "Camera event");
        }
    });

    // Hotplug: poll devices, then feed events to every publisher
    let monitor = V4l2HotplugMonitor::new(
        &config.hotplug,
        &[config.capture.front_device.as_str(), config.capture.back_device.as_str()],
    );
    tokio::spawn(monitor.run(hotplug_tx));

    let dispatch_sessions = Arc::clone(&sessions);
    tokio::spawn(async move {
        while let Ok(event) = hotplug_rx.recv_async().await {
            let sessions = Arc::clone(&dispatch_sessions);
            let dispatched = tokio::task::spawn_blocking(move || {
                sessions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .dispatch_hotplug(&event);
            })
            .await;
            if let Err(e) = dispatched {
                error!("Hotplug dispatch failed: {}", e);
            }
        }
    });

    let starter = Arc::clone(&publisher);
    if let Err(e) = tokio::task::spawn_blocking(move || starter.start()).await? {
        error!("Failed to start capture: {}", e);
    }

    // Control commands until Ctrl-C or end of input
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let sessions = Arc::clone(&sessions);
                let result = tokio::task::spawn_blocking(move || -> Result<()> {
                    let controller = sessions
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .publisher(PUBLISHER_ID)?;
                    apply_command(&controller, &line)?;
                    Ok(())
                })
                .await?;
                if let Err(e) = result {
                    error!("Command failed: {}", e);
                }
            }
        }
    }

    // Stop on a blocking thread: stopping joins capture workers
    tokio::task::spawn_blocking(move || {
        sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown();
    })
    .await?;

    info!("camsource shutting down");
    Ok(())
}
