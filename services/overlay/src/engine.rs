//! Overlay engine
//!
//! Owns one [`CameraOverlay`] per camera view (clock plus delivery queue),
//! the session-wide [`ObjectTracker`], and a handle to the shared
//! [`MessageChannel`]. Every display tick it advances each clock, releases
//! the batches playback has caught up with and hands them to the
//! [`OverlaySink`].

use crate::channel::{ChannelError, MessageChannel, Subscription};
use crate::clock::{ClockError, ClockSettings, MediaElement, PlaybackClock};
use crate::config::{OverlayConfig, QueueConfig};
use crate::model::{
    BoxId, CameraId, FrameBatch, FrameId, ObjectId, PixelRect, ViewportTransform,
};
use crate::protocol::{ObjectEvent, OutboundCommand};
use crate::queue::DeliveryQueue;
use crate::tracker::{ConfirmationPrompt, Notification, ObjectTracker};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown camera: {0}")]
    UnknownCamera(CameraId),

    #[error("Camera already attached: {0}")]
    DuplicateCamera(CameraId),

    #[error("Box {box_id} is not displayed on camera {camera_id}")]
    BoxNotDisplayed { camera_id: CameraId, box_id: BoxId },

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Playback events reported by a camera's media element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaEvent {
    Play,
    Pause,
    Waiting,
    Seeked,
    SourceChanged,
}

impl MediaEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaEvent::Play => "play",
            MediaEvent::Pause => "pause",
            MediaEvent::Waiting => "waiting",
            MediaEvent::Seeked => "seeked",
            MediaEvent::SourceChanged => "source_changed",
        }
    }
}

/// One box positioned in view pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedBox {
    pub box_id: BoxId,
    pub object_type: String,
    pub object_id: Option<ObjectId>,
    pub pixels: PixelRect,
}

/// Everything drawn over one camera view for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedFrame {
    pub camera_id: CameraId,
    pub frame_id: FrameId,
    pub boxes: Vec<RenderedBox>,
}

/// Presentation layer the engine draws through.
pub trait OverlaySink: Send {
    /// Replace the boxes shown over a camera view.
    fn render(&mut self, frame: &RenderedFrame);

    /// Show a reappearance notification.
    fn notify(&mut self, notification: &Notification);

    /// Turn the highlight of a camera view on or off.
    fn highlight(&mut self, camera_id: &CameraId, active: bool);

    /// Bring a camera view on screen.
    fn scroll_into_view(&mut self, camera_id: &CameraId);
}

/// Reply channel for a box click sent through [`EngineInput`].
pub type ClickReply = oneshot::Sender<Result<Option<OutboundCommand>, EngineError>>;

/// Operator and media input delivered to a running engine.
pub enum EngineInput {
    Media {
        camera_id: CameraId,
        event: MediaEvent,
    },
    ClickBox {
        camera_id: CameraId,
        box_id: BoxId,
        prompt: Box<dyn ConfirmationPrompt + Send>,
        reply: ClickReply,
    },
    OpenNotification(Uuid),
    DismissNotification(Uuid),
    Resize {
        camera_id: CameraId,
        width: f64,
        height: f64,
    },
}

/// Per-camera overlay state.
pub struct CameraOverlay {
    camera_id: CameraId,
    clock: PlaybackClock,
    queue: Arc<Mutex<DeliveryQueue>>,
    subscription: Option<Subscription>,
    view_size: (f64, f64),
    displayed: Option<FrameBatch>,
}

impl CameraOverlay {
    pub fn camera_id(&self) -> &CameraId {
        &self.camera_id
    }

    pub fn clock(&self) -> &PlaybackClock {
        &self.clock
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// The batch currently drawn over this view.
    pub fn displayed(&self) -> Option<&FrameBatch> {
        self.displayed.as_ref()
    }

    fn transform(&self) -> ViewportTransform {
        ViewportTransform::fit(self.clock.media().intrinsic_size(), self.view_size)
    }

    fn render(&self, batch: &FrameBatch) -> RenderedFrame {
        let transform = self.transform();
        RenderedFrame {
            camera_id: batch.camera_id.clone(),
            frame_id: batch.frame_id,
            boxes: batch
                .boxes
                .iter()
                .map(|b| RenderedBox {
                    box_id: b.box_id,
                    object_type: b.object_type.clone(),
                    object_id: b.object_id,
                    pixels: transform.apply(&b.rect),
                })
                .collect(),
        }
    }
}

/// Engine counters.
#[derive(Debug, Default, Clone)]
pub struct EngineStats {
    pub ticks: u64,
    pub frames_rendered: u64,
    pub stalls: u64,
    pub commands_sent: u64,
}

/// Video-synchronized overlay for a set of camera views.
pub struct OverlayEngine {
    channel: MessageChannel,
    clock_settings: ClockSettings,
    queue_config: QueueConfig,
    display_interval: Duration,
    cameras: BTreeMap<CameraId, CameraOverlay>,
    tracker: ObjectTracker,
    object_events: broadcast::Receiver<ObjectEvent>,
    sink: Box<dyn OverlaySink>,
    stats: EngineStats,
}

impl OverlayEngine {
    pub fn new(
        channel: MessageChannel,
        config: &OverlayConfig,
        sink: Box<dyn OverlaySink>,
    ) -> Self {
        let object_events = channel.object_events();

        Self {
            channel,
            clock_settings: ClockSettings::from(&config.playback),
            queue_config: config.queue.clone(),
            display_interval: config.playback.display_interval(),
            cameras: BTreeMap::new(),
            tracker: ObjectTracker::new(&config.tracker),
            object_events,
            sink,
            stats: EngineStats::default(),
        }
    }

    pub fn channel(&self) -> &MessageChannel {
        &self.channel
    }

    pub fn tracker(&self) -> &ObjectTracker {
        &self.tracker
    }

    pub fn camera(&self, camera_id: &CameraId) -> Option<&CameraOverlay> {
        self.cameras.get(camera_id)
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.clone()
    }

    /// Attach a camera view and subscribe to its batches.
    pub fn add_camera(
        &mut self,
        camera_id: CameraId,
        media: Arc<dyn MediaElement>,
    ) -> Result<(), EngineError> {
        if self.cameras.contains_key(&camera_id) {
            return Err(EngineError::DuplicateCamera(camera_id));
        }

        let queue = Arc::new(Mutex::new(DeliveryQueue::new(
            camera_id.clone(),
            &self.queue_config,
        )));
        let intake = queue.clone();
        let subscription = self.channel.subscribe(camera_id.clone(), move |batch| {
            intake.lock().enqueue(batch);
        });

        info!(camera_id = %camera_id, "Camera overlay attached");
        self.cameras.insert(
            camera_id.clone(),
            CameraOverlay {
                camera_id,
                clock: PlaybackClock::new(media, self.clock_settings.clone()),
                queue,
                subscription: Some(subscription),
                view_size: (1.0, 1.0),
                displayed: None,
            },
        );
        Ok(())
    }

    /// Detach a camera view, unsubscribing and dropping anything queued.
    pub fn remove_camera(&mut self, camera_id: &CameraId) -> Result<(), EngineError> {
        let mut overlay = self
            .cameras
            .remove(camera_id)
            .ok_or_else(|| EngineError::UnknownCamera(camera_id.clone()))?;

        overlay.subscription.take();
        overlay.queue.lock().clear();
        info!(camera_id = %camera_id, "Camera overlay detached");
        Ok(())
    }

    /// Set the pixel size of a camera view.
    pub fn resize(
        &mut self,
        camera_id: &CameraId,
        width: f64,
        height: f64,
    ) -> Result<(), EngineError> {
        let overlay = self.overlay_mut(camera_id)?;
        overlay.view_size = (width, height);
        let frame = overlay.displayed.as_ref().map(|batch| overlay.render(batch));
        if let Some(frame) = frame {
            self.sink.render(&frame);
        }
        Ok(())
    }

    /// Apply a media element event to a camera's clock and queue.
    pub fn on_media_event(
        &mut self,
        camera_id: &CameraId,
        event: MediaEvent,
        now: Instant,
    ) -> Result<(), EngineError> {
        let overlay = self.overlay_mut(camera_id)?;
        debug!(camera_id = %camera_id, event = event.as_str(), "Media event");

        match event {
            MediaEvent::Play => {
                overlay.clock.on_play(now);
                overlay.queue.lock().set_accepting(true);
            }
            MediaEvent::Pause => {
                overlay.clock.on_pause();
                overlay.queue.lock().set_accepting(false);
            }
            MediaEvent::Waiting => overlay.clock.on_waiting(now),
            MediaEvent::Seeked => overlay.clock.on_seeked(now),
            MediaEvent::SourceChanged => {
                overlay.clock.replace_source();
                {
                    let mut queue = overlay.queue.lock();
                    queue.set_accepting(false);
                    queue.clear();
                }
                overlay.displayed = None;
            }
        }
        Ok(())
    }

    /// One display tick.
    pub fn tick(&mut self, now: Instant) {
        self.stats.ticks += 1;
        self.drain_object_events(now);

        for overlay in self.cameras.values_mut() {
            let frame_time = match overlay.clock.tick(now) {
                Ok(frame_time) => frame_time,
                Err(ClockError::PlaybackStalled { stalled_for }) => {
                    self.stats.stalls += 1;
                    warn!(
                        camera_id = %overlay.camera_id,
                        stalled_ms = stalled_for.as_millis() as u64,
                        "Camera stalled, overlay waits for recalibration"
                    );
                    None
                }
            };

            let released = overlay.queue.lock().release(frame_time);
            for batch in released {
                for notification in self.tracker.observe(&batch, now) {
                    self.sink.notify(&notification);
                }
                let frame = overlay.render(&batch);
                self.sink.render(&frame);
                self.stats.frames_rendered += 1;
                overlay.displayed = Some(batch);
            }
        }

        self.tracker.sweep(now);
        for camera_id in self.tracker.expire_highlights(now) {
            self.sink.highlight(&camera_id, false);
        }
    }

    /// Handle an operator click on a displayed box.
    ///
    /// Returns the command sent, or `None` if the operator declined.
    pub fn click_box(
        &mut self,
        camera_id: &CameraId,
        box_id: BoxId,
        prompt: &dyn ConfirmationPrompt,
    ) -> Result<Option<OutboundCommand>, EngineError> {
        let state = self.channel.state();
        if !self.channel.is_open() {
            return Err(ChannelError::NotOpen(state).into());
        }

        let overlay = self
            .cameras
            .get(camera_id)
            .ok_or_else(|| EngineError::UnknownCamera(camera_id.clone()))?;
        let batch = overlay
            .displayed
            .as_ref()
            .ok_or_else(|| EngineError::BoxNotDisplayed {
                camera_id: camera_id.clone(),
                box_id,
            })?;
        let bbox = batch.find_box(box_id).ok_or_else(|| EngineError::BoxNotDisplayed {
            camera_id: camera_id.clone(),
            box_id,
        })?;

        let media = overlay.clock.media().clone();
        let command = self.tracker.command_for_click(
            camera_id,
            batch.frame_id,
            bbox,
            prompt,
            |rect| media.capture_cutout(rect),
        );

        let Some(command) = command else {
            debug!(camera_id = %camera_id, box_id, "Operator declined tracking change");
            return Ok(None);
        };

        self.channel.send(&command)?;
        self.stats.commands_sent += 1;
        if let OutboundCommand::Stop { object_id } = command {
            self.tracker.forget(object_id);
        }

        info!(camera_id = %camera_id, box_id, command = command.kind(), "Tracking command sent");
        Ok(Some(command))
    }

    /// Open a reappearance notification: dismiss it, highlight its camera
    /// and bring that camera into view.
    pub fn open_notification(&mut self, id: Uuid, now: Instant) -> Option<CameraId> {
        let camera_id = self.tracker.open_notification(id, now)?;
        self.sink.highlight(&camera_id, true);
        self.sink.scroll_into_view(&camera_id);
        Some(camera_id)
    }

    pub fn dismiss_notification(&mut self, id: Uuid) -> bool {
        self.tracker.dismiss_notification(id)
    }

    /// Drive the engine at the display rate until `token` is cancelled,
    /// applying inputs as they arrive. Tears everything down on exit.
    pub async fn run(&mut self, mut inputs: mpsc::Receiver<EngineInput>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.display_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            cameras = self.cameras.len(),
            interval_ms = self.display_interval.as_millis() as u64,
            "Overlay engine running"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Overlay engine received shutdown signal");
                    break;
                }
                _ = ticker.tick() => self.tick(Instant::now()),
                input = inputs.recv() => match input {
                    Some(input) => self.apply(input),
                    None => {
                        debug!("Engine input closed");
                        break;
                    }
                },
            }
        }

        self.shutdown().await;
    }

    fn apply(&mut self, input: EngineInput) {
        let now = Instant::now();
        let result = match input {
            EngineInput::Media { camera_id, event } => self.on_media_event(&camera_id, event, now),
            EngineInput::ClickBox {
                camera_id,
                box_id,
                prompt,
                reply,
            } => {
                let result = self.click_box(&camera_id, box_id, prompt.as_ref());
                // The requester may have gone away
                let _ = reply.send(result);
                Ok(())
            }
            EngineInput::OpenNotification(id) => {
                self.open_notification(id, now);
                Ok(())
            }
            EngineInput::DismissNotification(id) => {
                self.dismiss_notification(id);
                Ok(())
            }
            EngineInput::Resize {
                camera_id,
                width,
                height,
            } => self.resize(&camera_id, width, height),
        };

        if let Err(e) = result {
            warn!(error = %e, "Failed to apply engine input");
        }
    }

    /// Unsubscribe every camera, cancel pending notifications and the
    /// highlight, and close the channel.
    pub async fn shutdown(&mut self) {
        info!("Shutting down overlay engine");

        for overlay in self.cameras.values_mut() {
            overlay.subscription.take();
            overlay.queue.lock().clear();
        }
        self.tracker.clear_pending();
        self.channel.close().await;

        info!(
            ticks = self.stats.ticks,
            frames_rendered = self.stats.frames_rendered,
            "Overlay engine stopped"
        );
    }

    fn drain_object_events(&mut self, now: Instant) {
        loop {
            match self.object_events.try_recv() {
                Ok(ObjectEvent::Announced { object_id, image }) => {
                    self.tracker.announce(object_id, image, now);
                }
                Ok(ObjectEvent::Stopped { object_id }) => {
                    self.tracker.forget(object_id);
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    error!(skipped, "Object notices lagged, tracker may be out of date");
                }
                Err(_) => break,
            }
        }
    }

    fn overlay_mut(&mut self, camera_id: &CameraId) -> Result<&mut CameraOverlay, EngineError> {
        self.cameras
            .get_mut(camera_id)
            .ok_or_else(|| EngineError::UnknownCamera(camera_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::MemoryConnector;
    use crate::channel::ConnectionState;
    use crate::clock::fake::FakeMedia;
    use crate::config::{ChannelConfig, OverlayConfig};
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio_test::assert_ok;

    #[derive(Default)]
    struct Recorded {
        frames: Vec<RenderedFrame>,
        notifications: Vec<Notification>,
        highlights: Vec<(CameraId, bool)>,
        scrolled: Vec<CameraId>,
    }

    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Recorded>>);

    impl OverlaySink for RecordingSink {
        fn render(&mut self, frame: &RenderedFrame) {
            self.0.lock().frames.push(frame.clone());
        }

        fn notify(&mut self, notification: &Notification) {
            self.0.lock().notifications.push(notification.clone());
        }

        fn highlight(&mut self, camera_id: &CameraId, active: bool) {
            self.0.lock().highlights.push((camera_id.clone(), active));
        }

        fn scroll_into_view(&mut self, camera_id: &CameraId) {
            self.0.lock().scrolled.push(camera_id.clone());
        }
    }

    fn test_config() -> OverlayConfig {
        OverlayConfig {
            channel: ChannelConfig {
                url: "ws://detector/ws".to_string(),
                bearer_token: None,
                health_check_interval_secs: 30,
            },
            playback: Default::default(),
            queue: Default::default(),
            tracker: Default::default(),
            cameras: vec![],
            logging: Default::default(),
            metrics: Default::default(),
        }
    }

    fn engine_with_camera(
        channel: MessageChannel,
    ) -> (OverlayEngine, Arc<FakeMedia>, RecordingSink, CameraId) {
        let sink = RecordingSink::default();
        let mut engine = OverlayEngine::new(channel, &test_config(), Box::new(sink.clone()));
        let media = Arc::new(FakeMedia::default());
        let camera = CameraId::new("cam-1");
        assert_ok!(engine.add_camera(camera.clone(), media.clone()));
        (engine, media, sink, camera)
    }

    /// Walk the clock through both calibration phases and start playing.
    fn calibrate_and_play(engine: &mut OverlayEngine, media: &FakeMedia, camera: &CameraId) {
        let start = Instant::now();
        media.set_segment("live_V01.ts");
        engine.tick(start);
        media.set_segment("live_V02.ts");
        let boundary = start + Duration::from_millis(40);
        engine.tick(boundary);
        assert_ok!(engine.on_media_event(camera, MediaEvent::Play, boundary));
        assert!(engine.camera(camera).map_or(false, |c| c.clock().is_calibrated()));
    }

    fn boxes_message(frame_id: u64, object_id: Option<u64>) -> String {
        camera_boxes_message("cam-1", frame_id, object_id)
    }

    fn camera_boxes_message(camera_id: &str, frame_id: u64, object_id: Option<u64>) -> String {
        let mut wire_box = json!({ "boxId": 1, "rect": [0.2, 0.2, 0.8, 0.8], "objectType": "x" });
        if let Some(object_id) = object_id {
            wire_box["objectId"] = json!(object_id);
        }
        json!({
            "type": "boundingBoxes",
            "cameraId": camera_id,
            "frameId": frame_id,
            "boxes": [wire_box]
        })
        .to_string()
    }

    async fn wait_open(channel: &MessageChannel) {
        let mut rx = channel.state_receiver();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == ConnectionState::Open))
            .await
            .expect("timed out waiting for open channel")
            .expect("state sender dropped");
    }

    #[tokio::test]
    async fn test_end_to_end_render_and_start_tracking() {
        let connector = Arc::new(MemoryConnector::default());
        let channel = MessageChannel::new("ws://detector/ws", connector.clone());
        let (mut engine, media, sink, camera) = engine_with_camera(channel.clone());
        *media.cutout.lock() = Some("cutout".to_string());

        channel.connect();
        wait_open(&channel).await;
        let mut server = connector.take_server().expect("no connection made");

        calibrate_and_play(&mut engine, &media, &camera);

        assert_ok!(server.to_client.send(Ok(boxes_message(0, None))).await);
        tokio::time::timeout(Duration::from_secs(2), async {
            while engine.camera(&camera).map_or(0, |c| c.queued()) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("batch never reached the queue");

        engine.tick(Instant::now());

        {
            let recorded = sink.0.lock();
            assert_eq!(recorded.frames.len(), 1);
            let frame = &recorded.frames[0];
            assert_eq!(frame.frame_id, 0);
            assert_eq!(frame.boxes.len(), 1);
            assert_eq!(frame.boxes[0].box_id, 1);
            assert_eq!(frame.boxes[0].object_type, "x");
        }

        let command = assert_ok!(engine.click_box(&camera, 1, &|_: &str| true));
        assert_eq!(
            command,
            Some(OutboundCommand::Start {
                camera_id: "cam-1".to_string(),
                frame_id: 0,
                box_id: 1,
                image: Some("cutout".to_string()),
            })
        );

        let sent = tokio::time::timeout(Duration::from_secs(2), server.from_client.next())
            .await
            .expect("timed out waiting for command")
            .expect("connection closed");
        let sent: serde_json::Value = assert_ok!(serde_json::from_str(&sent));
        assert_eq!(sent["type"], "start");
        assert_eq!(sent["boxId"], 1);
        assert_eq!(sent["frameId"], 0);

        engine.shutdown().await;
        assert!(!channel.has_listener(&camera));
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_nothing_rendered_before_calibration() {
        let channel = MessageChannel::new("ws://detector/ws", Arc::new(MemoryConnector::default()));
        let (mut engine, _media, sink, camera) = engine_with_camera(channel.clone());

        assert_ok!(engine.on_media_event(&camera, MediaEvent::Play, Instant::now()));
        channel.handle_inbound(&boxes_message(0, None));
        engine.tick(Instant::now());

        assert!(sink.0.lock().frames.is_empty());
        assert_eq!(engine.camera(&camera).map(|c| c.queued()), Some(1));
    }

    #[test]
    fn test_paused_camera_drops_batches() {
        let channel = MessageChannel::new("ws://detector/ws", Arc::new(MemoryConnector::default()));
        let (mut engine, media, sink, camera) = engine_with_camera(channel.clone());
        calibrate_and_play(&mut engine, &media, &camera);

        assert_ok!(engine.on_media_event(&camera, MediaEvent::Pause, Instant::now()));
        channel.handle_inbound(&boxes_message(0, None));
        engine.tick(Instant::now());

        assert!(sink.0.lock().frames.is_empty());
        assert_eq!(engine.camera(&camera).map(|c| c.queued()), Some(0));
    }

    #[test]
    fn test_render_maps_to_view_pixels() {
        let channel = MessageChannel::new("ws://detector/ws", Arc::new(MemoryConnector::default()));
        let (mut engine, media, sink, camera) = engine_with_camera(channel.clone());
        calibrate_and_play(&mut engine, &media, &camera);

        // 1920x1080 video in a 960x540 view: no letterbox, half scale
        assert_ok!(engine.resize(&camera, 960.0, 540.0));
        channel.handle_inbound(&boxes_message(0, None));
        engine.tick(Instant::now());

        let recorded = sink.0.lock();
        let pixels = recorded.frames[0].boxes[0].pixels;
        assert!((pixels.left - 192.0).abs() < 1e-9);
        assert!((pixels.top - 108.0).abs() < 1e-9);
        assert!((pixels.width - 576.0).abs() < 1e-9);
        assert!((pixels.height - 324.0).abs() < 1e-9);
    }

    #[test]
    fn test_reappearance_notification_opens_highlight() {
        let channel = MessageChannel::new("ws://detector/ws", Arc::new(MemoryConnector::default()));
        let (mut engine, media, sink, camera) = engine_with_camera(channel.clone());
        calibrate_and_play(&mut engine, &media, &camera);

        channel.handle_inbound(r#"{"type":"newObject","objectId":8,"image":"img-8"}"#);
        let start = Instant::now();
        engine.tick(start);
        assert_eq!(engine.tracker().len(), 1);

        channel.handle_inbound(&boxes_message(0, Some(8)));
        engine.tick(start + Duration::from_secs(4));

        let notification = {
            let recorded = sink.0.lock();
            assert_eq!(recorded.notifications.len(), 1);
            recorded.notifications[0].clone()
        };
        assert_eq!(notification.cutout.as_deref(), Some("img-8"));

        media.set_position(6.0);
        let opened_at = start + Duration::from_secs(5);
        assert_eq!(engine.open_notification(notification.id, opened_at), Some(camera.clone()));
        engine.tick(opened_at + Duration::from_secs(3));

        let recorded = sink.0.lock();
        assert_eq!(recorded.scrolled, vec![camera.clone()]);
        assert_eq!(
            recorded.highlights,
            vec![(camera.clone(), true), (camera, false)]
        );
    }

    #[test]
    fn test_highlights_on_two_cameras_both_clear() {
        let channel = MessageChannel::new("ws://detector/ws", Arc::new(MemoryConnector::default()));
        let (mut engine, media, sink, first) = engine_with_camera(channel.clone());
        let second_media = Arc::new(FakeMedia::default());
        let second = CameraId::new("cam-2");
        assert_ok!(engine.add_camera(second.clone(), second_media.clone()));
        // Both views acquire their first segment on the same poll
        second_media.set_segment("live_V01.ts");
        calibrate_and_play(&mut engine, &media, &first);
        calibrate_and_play(&mut engine, &second_media, &second);

        channel.handle_inbound(r#"{"type":"newObject","objectId":8,"image":"img-8"}"#);
        channel.handle_inbound(r#"{"type":"newObject","objectId":9,"image":"img-9"}"#);
        let start = Instant::now();
        engine.tick(start);

        channel.handle_inbound(&camera_boxes_message("cam-1", 0, Some(8)));
        channel.handle_inbound(&camera_boxes_message("cam-2", 0, Some(9)));
        engine.tick(start + Duration::from_secs(4));

        let notifications = sink.0.lock().notifications.clone();
        assert_eq!(notifications.len(), 2);
        let id_for = |camera: &CameraId| {
            notifications
                .iter()
                .find(|n| &n.camera_id == camera)
                .map(|n| n.id)
                .expect("notification for camera")
        };

        let opened_at = start + Duration::from_secs(5);
        assert_eq!(engine.open_notification(id_for(&first), opened_at), Some(first.clone()));
        let later = opened_at + Duration::from_millis(500);
        assert_eq!(engine.open_notification(id_for(&second), later), Some(second.clone()));

        engine.tick(opened_at + Duration::from_secs(10));

        let recorded = sink.0.lock();
        assert!(recorded.highlights.contains(&(first.clone(), false)));
        assert!(recorded.highlights.contains(&(second.clone(), false)));
        assert_eq!(recorded.highlights.iter().filter(|(_, active)| !active).count(), 2);
    }

    #[test]
    fn test_click_requires_open_channel() {
        let channel = MessageChannel::new("ws://detector/ws", Arc::new(MemoryConnector::default()));
        let (mut engine, _media, _sink, camera) = engine_with_camera(channel);

        let result = engine.click_box(&camera, 1, &|_: &str| true);
        assert!(matches!(
            result,
            Err(EngineError::Channel(ChannelError::NotOpen(
                ConnectionState::Disconnected
            )))
        ));
    }

    #[tokio::test]
    async fn test_click_tracked_box_sends_stop_and_forgets() {
        let connector = Arc::new(MemoryConnector::default());
        let channel = MessageChannel::new("ws://detector/ws", connector.clone());
        let (mut engine, media, _sink, camera) = engine_with_camera(channel.clone());
        channel.connect();
        wait_open(&channel).await;
        calibrate_and_play(&mut engine, &media, &camera);

        channel.handle_inbound(&boxes_message(0, Some(21)));
        engine.tick(Instant::now());
        assert!(engine.tracker().get(21).is_some());

        let command = assert_ok!(engine.click_box(&camera, 1, &|_: &str| true));
        assert_eq!(command, Some(OutboundCommand::Stop { object_id: 21 }));
        assert!(engine.tracker().get(21).is_none());

        let missing = engine.click_box(&camera, 99, &|_: &str| true);
        assert!(matches!(missing, Err(EngineError::BoxNotDisplayed { box_id: 99, .. })));

        engine.shutdown().await;
    }

    #[test]
    fn test_duplicate_and_unknown_cameras() {
        let channel = MessageChannel::new("ws://detector/ws", Arc::new(MemoryConnector::default()));
        let (mut engine, media, _sink, camera) = engine_with_camera(channel.clone());

        assert!(matches!(
            engine.add_camera(camera.clone(), media),
            Err(EngineError::DuplicateCamera(_))
        ));
        assert!(matches!(
            engine.on_media_event(&CameraId::new("cam-9"), MediaEvent::Play, Instant::now()),
            Err(EngineError::UnknownCamera(_))
        ));

        assert_ok!(engine.remove_camera(&camera));
        assert!(!channel.has_listener(&camera));
    }

    #[test]
    fn test_source_change_resets_camera() {
        let channel = MessageChannel::new("ws://detector/ws", Arc::new(MemoryConnector::default()));
        let (mut engine, media, _sink, camera) = engine_with_camera(channel.clone());
        calibrate_and_play(&mut engine, &media, &camera);

        channel.handle_inbound(&boxes_message(0, None));
        engine.tick(Instant::now());
        assert!(engine.camera(&camera).and_then(|c| c.displayed()).is_some());

        assert_ok!(engine.on_media_event(&camera, MediaEvent::SourceChanged, Instant::now()));
        let overlay = engine.camera(&camera).expect("camera attached");
        assert!(!overlay.clock().is_calibrated());
        assert!(overlay.displayed().is_none());

        // Batches for the old source are dropped until playback restarts
        channel.handle_inbound(&boxes_message(1, None));
        engine.tick(Instant::now());
        assert_eq!(engine.camera(&camera).map(|c| c.queued()), Some(0));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let channel = MessageChannel::new("ws://detector/ws", Arc::new(MemoryConnector::default()));
        let (mut engine, _media, _sink, camera) = engine_with_camera(channel.clone());
        let (tx, rx) = mpsc::channel(8);
        let token = CancellationToken::new();

        assert_ok!(
            tx.send(EngineInput::Media {
                camera_id: camera.clone(),
                event: MediaEvent::Play,
            })
            .await
        );

        let stopper = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.cancel();
        });

        tokio::time::timeout(Duration::from_secs(2), engine.run(rx, token))
            .await
            .expect("engine did not stop");

        assert!(engine.stats().ticks > 0);
        assert!(engine.camera(&camera).map_or(false, |c| c.clock().is_playing()));
        assert!(!channel.has_listener(&camera));
    }
}
