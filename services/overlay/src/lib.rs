//! Nier Overlay - video-synchronized bounding box overlays for live cameras
//!
//! Detections for a camera arrive over a single shared WebSocket connection,
//! usually ahead of the video frame they describe. This library holds them
//! back until the camera's playback has caught up and then draws them over
//! the view. It handles:
//!
//! - Calibrating a live player's position against absolute stream time from
//!   segment file names
//! - Routing detection batches to per-camera delivery queues
//! - Tracked objects, reappearance notifications and camera highlights
//! - Start/stop tracking commands raised from operator clicks
//!
//! # Architecture
//!
//! ```text
//! Detection service -> MessageChannel -> DeliveryQueue (per camera) -> OverlaySink
//!                            |                 ^
//!                            v                 |
//!                      ObjectTracker     PlaybackClock <- MediaElement
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use nier_overlay::prelude::*;
//! use std::sync::Arc;
//!
//! # fn sink() -> Box<dyn OverlaySink> { unimplemented!() }
//! # fn player() -> Arc<dyn MediaElement> { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = OverlayConfig::load()?;
//!     let channel = MessageChannel::new(
//!         config.channel.url.clone(),
//!         Arc::new(WebSocketConnector::new(config.channel.bearer_token.clone())),
//!     );
//!     channel.connect();
//!
//!     let mut engine = OverlayEngine::new(channel, &config, sink());
//!     engine.add_camera(CameraId::new("dock-1"), player())?;
//!
//!     let (_inputs, rx) = tokio::sync::mpsc::channel(64);
//!     engine.run(rx, CancellationToken::new()).await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod clock;
pub mod config;
pub mod engine;
pub mod model;
pub mod protocol;
pub mod queue;
pub mod segment;
pub mod tracker;

// Re-export main types
pub use channel::{
    ChannelError, ChannelStats, ConnectionState, Connector, MessageChannel, Subscription,
    WebSocketConnector,
};
pub use clock::{ClockError, ClockSettings, MediaElement, PlaybackClock};
pub use config::{ConfigValidationError, OverlayConfig};
pub use engine::{
    EngineError, EngineInput, MediaEvent, OverlayEngine, OverlaySink, RenderedBox, RenderedFrame,
};
pub use model::{BoundingBox, CameraId, FrameBatch, FrameId, ObjectId, Rect, ViewportTransform};
pub use protocol::{InboundMessage, ObjectEvent, OutboundCommand, ProtocolError};
pub use queue::DeliveryQueue;
pub use segment::{SegmentError, SegmentResolver, SegmentStart};
pub use tracker::{ConfirmationPrompt, Notification, ObjectTracker};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::channel::{MessageChannel, WebSocketConnector};
    pub use crate::clock::MediaElement;
    pub use crate::config::OverlayConfig;
    pub use crate::engine::{EngineInput, MediaEvent, OverlayEngine, OverlaySink};
    pub use crate::model::CameraId;
    pub use crate::tracker::ConfirmationPrompt;
    pub use tokio_util::sync::CancellationToken;
}
