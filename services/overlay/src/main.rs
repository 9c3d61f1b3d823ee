//! Overlay monitor for Nier camera sessions
//!
//! Connects to the detection service the way an overlay session does,
//! subscribes every configured camera, and reports what arrives. A `test`
//! command is sent per camera on each health check.
//!
//! # Architecture
//!
//! ```text
//! Detection Service <-> MessageChannel -> per-camera activity -> stats logs
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with OVERLAY_)

use anyhow::Context;
use nier_overlay::channel::{ChannelError, MessageChannel, Subscription, WebSocketConnector};
use nier_overlay::config::{LoggingConfig, OverlayConfig};
use nier_overlay::model::{CameraId, FrameBatch, FrameId};
use nier_overlay::protocol::{ObjectEvent, OutboundCommand};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// What has arrived for one camera.
#[derive(Debug, Default, Clone)]
struct CameraActivity {
    batches: u64,
    boxes: u64,
    tracked_boxes: u64,
    last_frame_id: Option<FrameId>,
}

impl CameraActivity {
    fn record(&mut self, batch: &FrameBatch) {
        self.batches += 1;
        self.boxes += batch.boxes.len() as u64;
        self.tracked_boxes += batch.boxes.iter().filter(|b| b.is_tracked()).count() as u64;
        self.last_frame_id = Some(batch.frame_id);
    }
}

type ActivityMap = Arc<RwLock<HashMap<CameraId, CameraActivity>>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "nier-overlay",
        version = env!("CARGO_PKG_VERSION"),
        url = %config.channel.url,
        cameras = config.cameras.len(),
        "Starting overlay monitor"
    );

    // Validate configuration
    config.validate()?;

    if config.metrics.enabled {
        init_metrics(config.metrics.port)?;
    }

    run_monitor(config).await
}

/// Load configuration, falling back to the environment alone.
fn load_config() -> anyhow::Result<OverlayConfig> {
    let config = OverlayConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        OverlayConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("nier_overlay={}", level).parse()?)
        .add_directive("tokio_tungstenite=info".parse()?)
        .add_directive("tungstenite=info".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);
    let layer = fmt::layer()
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    if config.format == "json" {
        subscriber.with(layer.json()).init();
    } else {
        subscriber.with(layer.pretty()).init();
    }

    Ok(())
}

/// Initialize the Prometheus metrics exporter.
fn init_metrics(port: u16) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");
    Ok(())
}

/// Run the monitor until a shutdown signal arrives.
async fn run_monitor(config: OverlayConfig) -> anyhow::Result<()> {
    let connector = Arc::new(WebSocketConnector::new(config.channel.bearer_token.clone()));
    let channel = MessageChannel::new(config.channel.url.clone(), connector);
    let activity: ActivityMap = Arc::new(RwLock::new(HashMap::new()));
    let token = CancellationToken::new();

    let camera_ids: Vec<CameraId> = config
        .cameras
        .iter()
        .map(|camera| CameraId::new(camera.id.clone()))
        .collect();

    // Subscribe before connecting so no early batch goes unrouted
    let subscriptions: Vec<Subscription> = config
        .cameras
        .iter()
        .zip(&camera_ids)
        .map(|(camera, camera_id)| {
            info!(
                camera_id = %camera_id,
                stream_url = camera.stream_url.as_deref().unwrap_or("-"),
                "Subscribing camera"
            );
            subscribe_camera(&channel, camera_id.clone(), activity.clone())
        })
        .collect();

    let object_handle = tokio::spawn(log_object_events(channel.object_events(), token.clone()));
    let state_handle = tokio::spawn(log_state_changes(channel.clone(), token.clone()));

    channel.connect();

    let health_handle = tokio::spawn(run_health_monitor(
        channel.clone(),
        camera_ids,
        config.channel.health_check_interval(),
        activity.clone(),
        token.clone(),
    ));

    shutdown_signal().await;
    info!("Initiating graceful shutdown...");

    token.cancel();
    for (name, handle) in [
        ("health monitor", health_handle),
        ("object events", object_handle),
        ("state watcher", state_handle),
    ] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Monitor task failed");
        }
    }

    drop(subscriptions);
    channel.close().await;

    log_final_stats(&channel, &activity);

    info!("Shutdown complete");
    Ok(())
}

fn subscribe_camera(
    channel: &MessageChannel,
    camera_id: CameraId,
    activity: ActivityMap,
) -> Subscription {
    let key = camera_id.clone();
    channel.subscribe(camera_id, move |batch| {
        debug!(
            camera_id = %batch.camera_id,
            frame_id = batch.frame_id,
            boxes = batch.boxes.len(),
            "Received detection batch"
        );
        activity.write().entry(key.clone()).or_default().record(&batch);
    })
}

async fn log_object_events(mut events: broadcast::Receiver<ObjectEvent>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => match event {
                Ok(ObjectEvent::Announced { object_id, image }) => {
                    info!(object_id, image_bytes = image.len(), "Tracking started");
                }
                Ok(ObjectEvent::Stopped { object_id }) => {
                    info!(object_id, "Tracking stopped");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Object notices lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn log_state_changes(channel: MessageChannel, token: CancellationToken) {
    let mut states = channel.state_receiver();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                info!(state = state.as_str(), "Detection service connection state");
            }
        }
    }
}

/// Run the health monitoring loop.
async fn run_health_monitor(
    channel: MessageChannel,
    camera_ids: Vec<CameraId>,
    interval: Duration,
    activity: ActivityMap,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for camera_id in &camera_ids {
            let command = OutboundCommand::Test {
                camera_id: camera_id.to_string(),
            };
            match channel.send(&command) {
                Ok(()) => debug!(camera_id = %camera_id, "Health check sent"),
                Err(ChannelError::NotOpen(state)) => {
                    warn!(
                        camera_id = %camera_id,
                        state = state.as_str(),
                        "Skipping health check, channel not open"
                    );
                }
                Err(e) => error!(camera_id = %camera_id, error = %e, "Health check failed"),
            }
        }

        let stats = channel.stats();
        info!(
            state = channel.state().as_str(),
            messages_received = stats.messages_received,
            batches_dispatched = stats.batches_dispatched,
            batches_unrouted = stats.batches_unrouted,
            invalid_messages = stats.invalid_messages,
            commands_sent = stats.commands_sent,
            "Channel stats"
        );

        for (camera_id, camera) in activity.read().iter() {
            info!(
                camera_id = %camera_id,
                batches = camera.batches,
                boxes = camera.boxes,
                tracked_boxes = camera.tracked_boxes,
                last_frame_id = ?camera.last_frame_id,
                "Camera stats"
            );
        }
    }
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

/// Log final statistics on shutdown.
fn log_final_stats(channel: &MessageChannel, activity: &ActivityMap) {
    info!("=== Final Statistics ===");

    let stats = channel.stats();
    info!(
        messages_received = stats.messages_received,
        batches_dispatched = stats.batches_dispatched,
        batches_unrouted = stats.batches_unrouted,
        object_events = stats.object_events,
        invalid_messages = stats.invalid_messages,
        commands_sent = stats.commands_sent,
        connections_opened = stats.connections_opened,
        "Channel final stats"
    );

    for (camera_id, camera) in activity.read().iter() {
        info!(
            camera_id = %camera_id,
            batches = camera.batches,
            boxes = camera.boxes,
            last_frame_id = ?camera.last_frame_id,
            "Camera final stats"
        );
    }
}
