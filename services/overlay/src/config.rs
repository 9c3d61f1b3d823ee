//! Configuration management for the overlay engine.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the overlay engine.
#[derive(Debug, Clone, Deserialize)]
pub struct OverlayConfig {
    /// Detection service connection
    pub channel: ChannelConfig,

    /// Playback clock tuning
    #[serde(default)]
    pub playback: PlaybackConfig,

    /// Delivery queue tuning
    #[serde(default)]
    pub queue: QueueConfig,

    /// Tracked object notifications
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Cameras shown in the session
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics export
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Detection service connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// WebSocket URL (e.g., "ws://detector:8765/ws")
    pub url: String,

    /// Bearer credential presented during the handshake
    #[serde(default)]
    pub bearer_token: Option<String>,

    /// Interval between `test` health checks in seconds
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
}

/// Playback clock configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackConfig {
    /// Fixed duration of every stream segment in seconds
    #[serde(default = "default_segment_duration")]
    pub segment_duration_secs: f64,

    /// Segment container extension, without the dot
    #[serde(default = "default_container_extension")]
    pub container_extension: String,

    /// Poll interval while waiting for the first segment
    #[serde(default = "default_segment_poll_interval_ms")]
    pub segment_poll_interval_ms: u64,

    /// Display ticks per second
    #[serde(default = "default_display_fps")]
    pub display_fps: f64,

    /// Detector frames per second; converts stream seconds to frame ids
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f64,

    /// Fixed lead added to the computed playback time
    #[serde(default = "default_lead_correction_ms")]
    pub lead_correction_ms: i64,

    /// Time without playback progress before the source is reloaded
    #[serde(default = "default_buffering_threshold_ms")]
    pub buffering_threshold_ms: u64,
}

/// Delivery queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Queue depth above which a backlog warning is logged
    #[serde(default = "default_backlog_warn_threshold")]
    pub backlog_warn_threshold: usize,
}

/// Object lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Silence after which a tracked object counts as gone
    #[serde(default = "default_reappear_window_ms")]
    pub reappear_window_ms: u64,

    /// How long a camera stays highlighted after opening a notification
    #[serde(default = "default_highlight_duration_ms")]
    pub highlight_duration_ms: u64,
}

/// One camera in the session.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Camera identifier used by the detection service
    pub id: String,

    /// Playlist URL of the camera's live stream
    #[serde(default)]
    pub stream_url: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Whether to include source code location
    #[serde(default)]
    pub include_location: bool,
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics export
    #[serde(default)]
    pub enabled: bool,

    /// Port for the Prometheus scrape endpoint
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_health_check_interval() -> u64 {
    30
}
fn default_segment_duration() -> f64 {
    2.0
}
fn default_container_extension() -> String {
    crate::segment::DEFAULT_CONTAINER_EXTENSION.to_string()
}
fn default_segment_poll_interval_ms() -> u64 {
    200
}
fn default_display_fps() -> f64 {
    24.0
}
fn default_frame_rate() -> f64 {
    24.0
}
fn default_lead_correction_ms() -> i64 {
    50
}
fn default_buffering_threshold_ms() -> u64 {
    5000
}
fn default_backlog_warn_threshold() -> usize {
    4
}
fn default_reappear_window_ms() -> u64 {
    3000
}
fn default_highlight_duration_ms() -> u64 {
    2000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            segment_duration_secs: default_segment_duration(),
            container_extension: default_container_extension(),
            segment_poll_interval_ms: default_segment_poll_interval_ms(),
            display_fps: default_display_fps(),
            frame_rate: default_frame_rate(),
            lead_correction_ms: default_lead_correction_ms(),
            buffering_threshold_ms: default_buffering_threshold_ms(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backlog_warn_threshold: default_backlog_warn_threshold(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            reappear_window_ms: default_reappear_window_ms(),
            highlight_duration_ms: default_highlight_duration_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_location: false,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl OverlayConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with OVERLAY_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g., OVERLAY_CHANNEL__URL
            .add_source(
                Environment::with_prefix("OVERLAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("OVERLAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.channel.url.is_empty() {
            return Err(ConfigValidationError::MissingField("channel.url".to_string()));
        }
        if !self.channel.url.starts_with("ws://") && !self.channel.url.starts_with("wss://") {
            return Err(ConfigValidationError::InvalidValue {
                field: "channel.url".to_string(),
                message: "URL must start with ws:// or wss://".to_string(),
            });
        }

        if self.channel.health_check_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "channel.health_check_interval_secs".to_string(),
                message: "Health check interval must be greater than 0".to_string(),
            });
        }

        let positive = [
            ("playback.segment_duration_secs", self.playback.segment_duration_secs),
            ("playback.display_fps", self.playback.display_fps),
            ("playback.frame_rate", self.playback.frame_rate),
        ];
        for (field, value) in positive {
            // NaN fails the comparison
            if !(value > 0.0) || !value.is_finite() {
                return Err(ConfigValidationError::InvalidValue {
                    field: field.to_string(),
                    message: format!("Must be a finite value greater than 0, got {}", value),
                });
            }
        }

        if self.playback.container_extension.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "playback.container_extension".to_string(),
            ));
        }

        for (index, camera) in self.cameras.iter().enumerate() {
            if camera.id.is_empty() {
                return Err(ConfigValidationError::MissingField(format!(
                    "cameras[{}].id",
                    index
                )));
            }
            if self.cameras[..index].iter().any(|c| c.id == camera.id) {
                return Err(ConfigValidationError::InvalidValue {
                    field: format!("cameras[{}].id", index),
                    message: format!("Duplicate camera id {}", camera.id),
                });
            }
        }

        Ok(())
    }
}

impl ChannelConfig {
    /// Get health check interval as Duration.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

impl PlaybackConfig {
    /// Get segment poll interval as Duration.
    pub fn segment_poll_interval(&self) -> Duration {
        Duration::from_millis(self.segment_poll_interval_ms)
    }

    /// Get display tick interval as Duration.
    pub fn display_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.display_fps)
    }

    /// Get buffering threshold as Duration.
    pub fn buffering_threshold(&self) -> Duration {
        Duration::from_millis(self.buffering_threshold_ms)
    }
}

impl TrackerConfig {
    /// Get reappearance window as Duration.
    pub fn reappear_window(&self) -> Duration {
        Duration::from_millis(self.reappear_window_ms)
    }

    /// Get highlight duration as Duration.
    pub fn highlight_duration(&self) -> Duration {
        Duration::from_millis(self.highlight_duration_ms)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
