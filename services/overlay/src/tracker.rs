//! Tracked-object lifecycle: visibility, reappearance notifications,
//! camera highlights and the start/stop commands raised by clicking a box.

use crate::config::TrackerConfig;
use crate::model::{BoundingBox, CameraId, FrameBatch, FrameId, ObjectId, Rect};
use crate::protocol::OutboundCommand;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};
use uuid::Uuid;

/// Visibility of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Unseen,
    Visible,
}

/// What the overlay remembers about one tracked object.
#[derive(Debug, Clone)]
pub struct TrackedObjectState {
    pub object_id: ObjectId,
    pub visibility: Visibility,
    pub last_seen_at: Option<Instant>,
    pub last_seen_frame: Option<FrameId>,
    pub camera_id: Option<CameraId>,
    /// Captured once, when tracking was confirmed
    pub cutout: Option<String>,
}

impl TrackedObjectState {
    fn unseen(object_id: ObjectId) -> Self {
        Self {
            object_id,
            visibility: Visibility::Unseen,
            last_seen_at: None,
            last_seen_frame: None,
            camera_id: None,
            cutout: None,
        }
    }
}

/// A pending "object reappeared" notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: Uuid,
    pub object_id: ObjectId,
    pub camera_id: CameraId,
    pub frame_id: FrameId,
    pub cutout: Option<String>,
    pub raised_at: Instant,
}

/// Asks the operator to confirm a tracking change.
pub trait ConfirmationPrompt {
    fn confirm(&self, question: &str) -> bool;
}

impl<F> ConfirmationPrompt for F
where
    F: Fn(&str) -> bool,
{
    fn confirm(&self, question: &str) -> bool {
        self(question)
    }
}

/// Tracker counters.
#[derive(Debug, Default, Clone)]
pub struct TrackerStats {
    pub announced: u64,
    pub forgotten: u64,
    pub reappearances: u64,
    pub highlights_restarted: u64,
}

/// Per-session state machine over tracked-object identifiers.
///
/// An object is `Visible` while it keeps showing up in batches at most
/// `reappear_window` apart. Showing up again after a longer silence (or for
/// the first time without an announcement) raises exactly one
/// [`Notification`].
pub struct ObjectTracker {
    reappear_window: Duration,
    highlight_duration: Duration,
    objects: HashMap<ObjectId, TrackedObjectState>,
    notifications: Vec<Notification>,
    /// Highlight deadline per camera view
    highlights: HashMap<CameraId, Instant>,
    stats: TrackerStats,
}

impl ObjectTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            reappear_window: config.reappear_window(),
            highlight_duration: config.highlight_duration(),
            objects: HashMap::new(),
            notifications: Vec::new(),
            highlights: HashMap::new(),
            stats: TrackerStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, object_id: ObjectId) -> Option<&TrackedObjectState> {
        self.objects.get(&object_id)
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats.clone()
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    /// Tracking was confirmed for `object_id`. The object starts out visible
    /// since the operator just clicked it.
    pub fn announce(&mut self, object_id: ObjectId, cutout: String, now: Instant) {
        let state = self
            .objects
            .entry(object_id)
            .or_insert_with(|| TrackedObjectState::unseen(object_id));
        state.visibility = Visibility::Visible;
        state.last_seen_at = Some(now);
        state.cutout = Some(cutout);

        self.stats.announced += 1;
        info!(object_id, "Tracking started");
    }

    /// Tracking ended for `object_id`. Returns whether it was known.
    pub fn forget(&mut self, object_id: ObjectId) -> bool {
        self.notifications.retain(|n| n.object_id != object_id);
        let known = self.objects.remove(&object_id).is_some();
        if known {
            self.stats.forgotten += 1;
            info!(object_id, "Tracking stopped");
        }
        known
    }

    /// Record the tracked objects in a displayed batch and return the
    /// notifications raised by it.
    pub fn observe(&mut self, batch: &FrameBatch, now: Instant) -> Vec<Notification> {
        let mut raised = Vec::new();
        let mut seen = HashSet::new();

        for object_id in batch.object_ids() {
            if !seen.insert(object_id) {
                continue;
            }

            let window = self.reappear_window;
            let state = self
                .objects
                .entry(object_id)
                .or_insert_with(|| TrackedObjectState::unseen(object_id));

            let silent = match (state.visibility, state.last_seen_at) {
                (Visibility::Visible, Some(last)) => {
                    now.saturating_duration_since(last) > window
                }
                _ => true,
            };

            state.visibility = Visibility::Visible;
            state.last_seen_at = Some(now);
            state.last_seen_frame = Some(batch.frame_id);
            state.camera_id = Some(batch.camera_id.clone());

            if !silent {
                trace!(object_id, frame_id = batch.frame_id, "Object still visible");
                continue;
            }

            let notification = Notification {
                id: Uuid::new_v4(),
                object_id,
                camera_id: batch.camera_id.clone(),
                frame_id: batch.frame_id,
                cutout: state.cutout.clone(),
                raised_at: now,
            };

            self.stats.reappearances += 1;
            metrics::counter!("overlay.tracker.reappearances").increment(1);
            info!(
                object_id,
                camera_id = %batch.camera_id,
                frame_id = batch.frame_id,
                notification_id = %notification.id,
                "Tracked object reappeared"
            );

            // At most one pending notification per object
            self.notifications.retain(|n| n.object_id != object_id);
            self.notifications.push(notification.clone());
            raised.push(notification);
        }

        raised
    }

    /// Mark objects silent for longer than the window as unseen. Returns how
    /// many changed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let window = self.reappear_window;
        let mut changed = 0;

        for state in self.objects.values_mut() {
            if state.visibility != Visibility::Visible {
                continue;
            }
            let expired = state
                .last_seen_at
                .map_or(true, |last| now.saturating_duration_since(last) > window);
            if expired {
                state.visibility = Visibility::Unseen;
                changed += 1;
                debug!(object_id = state.object_id, "Tracked object left view");
            }
        }

        changed
    }

    /// Remove a notification without acting on it.
    pub fn dismiss_notification(&mut self, id: Uuid) -> bool {
        let before = self.notifications.len();
        self.notifications.retain(|n| n.id != id);
        self.notifications.len() != before
    }

    /// Open a notification: dismiss it and highlight its camera. Returns the
    /// camera to bring into view.
    pub fn open_notification(&mut self, id: Uuid, now: Instant) -> Option<CameraId> {
        let index = self.notifications.iter().position(|n| n.id == id)?;
        let notification = self.notifications.remove(index);

        self.highlight(notification.camera_id.clone(), now);
        Some(notification.camera_id)
    }

    /// Highlight `camera_id` for the configured duration. A pending
    /// highlight on the same camera restarts its countdown.
    pub fn highlight(&mut self, camera_id: CameraId, now: Instant) {
        let expires_at = now + self.highlight_duration;
        if let Some(previous) = self.highlights.insert(camera_id.clone(), expires_at) {
            if previous > now {
                self.stats.highlights_restarted += 1;
                debug!(camera_id = %camera_id, "Restarting pending highlight");
            }
        }
    }

    /// Whether `camera_id` is highlighted at `now`.
    pub fn is_highlighted(&self, camera_id: &CameraId, now: Instant) -> bool {
        self.highlights
            .get(camera_id)
            .map_or(false, |expires_at| *expires_at > now)
    }

    /// Clear every highlight that is due and return the cameras they were on.
    pub fn expire_highlights(&mut self, now: Instant) -> Vec<CameraId> {
        let mut expired: Vec<CameraId> = self
            .highlights
            .iter()
            .filter(|(_, expires_at)| **expires_at <= now)
            .map(|(camera_id, _)| camera_id.clone())
            .collect();
        expired.sort();

        for camera_id in &expired {
            self.highlights.remove(camera_id);
        }
        expired
    }

    /// Drop pending notifications and highlights.
    pub fn clear_pending(&mut self) {
        self.notifications.clear();
        self.highlights.clear();
    }

    /// Build the command for an operator click on `bbox`.
    ///
    /// An untracked box asks to start tracking and carries a cutout taken at
    /// confirmation; a tracked box asks to stop. Returns `None` if the
    /// operator declines.
    pub fn command_for_click<C>(
        &self,
        camera_id: &CameraId,
        frame_id: FrameId,
        bbox: &BoundingBox,
        prompt: &dyn ConfirmationPrompt,
        capture: C,
    ) -> Option<OutboundCommand>
    where
        C: FnOnce(&Rect) -> Option<String>,
    {
        match bbox.object_id {
            Some(object_id) => {
                if !prompt.confirm(&format!("Stop tracking object {}?", object_id)) {
                    return None;
                }
                Some(OutboundCommand::Stop { object_id })
            }
            None => {
                if !prompt.confirm(&format!("Start tracking this {}?", bbox.object_type)) {
                    return None;
                }
                Some(OutboundCommand::Start {
                    camera_id: camera_id.to_string(),
                    frame_id,
                    box_id: bbox.box_id,
                    image: capture(&bbox.rect),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ObjectTracker {
        ObjectTracker::new(&TrackerConfig::default())
    }

    fn batch(frame_id: FrameId, object_ids: &[ObjectId]) -> FrameBatch {
        FrameBatch {
            camera_id: CameraId::new("cam-1"),
            frame_id,
            boxes: object_ids
                .iter()
                .enumerate()
                .map(|(i, id)| {
                    BoundingBox::new(i as u64 + 1, [0.1, 0.1, 0.3, 0.3], "person", Some(*id))
                })
                .collect(),
        }
    }

    #[test]
    fn test_reappearance_after_silence() {
        let mut tracker = tracker();
        let start = Instant::now();
        tracker.announce(7, "cutout-7".to_string(), start);

        // Seen right away: still the same sighting
        let soon = start + Duration::from_millis(500);
        assert!(tracker.observe(&batch(1, &[7]), soon).is_empty());

        // Silent for more than 3 s, then back
        let back = start + Duration::from_millis(4000);
        let raised = tracker.observe(&batch(100, &[7]), back);
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].object_id, 7);
        assert_eq!(raised[0].cutout.as_deref(), Some("cutout-7"));
        assert_eq!(raised[0].camera_id, CameraId::new("cam-1"));

        // Seen again within 3 s: no new notification
        let again = back + Duration::from_secs(2);
        assert!(tracker.observe(&batch(101, &[7]), again).is_empty());
        assert_eq!(tracker.notifications().len(), 1);
        assert_eq!(tracker.stats().reappearances, 1);
    }

    #[test]
    fn test_unannounced_object_raises_once() {
        let mut tracker = tracker();
        let now = Instant::now();

        // Duplicate boxes for one object in a batch count once
        let raised = tracker.observe(&batch(1, &[9, 9]), now);
        assert_eq!(raised.len(), 1);
        assert!(raised[0].cutout.is_none());
        assert!(tracker.observe(&batch(2, &[9]), now + Duration::from_millis(40)).is_empty());
    }

    #[test]
    fn test_sweep_marks_silent_objects_unseen() {
        let mut tracker = tracker();
        let start = Instant::now();
        tracker.announce(1, "a".to_string(), start);
        tracker.announce(2, "b".to_string(), start);
        tracker.observe(&batch(10, &[2]), start + Duration::from_secs(2));

        assert_eq!(tracker.sweep(start + Duration::from_millis(3500)), 1);
        assert_eq!(tracker.get(1).map(|s| s.visibility), Some(Visibility::Unseen));
        assert_eq!(tracker.get(2).map(|s| s.visibility), Some(Visibility::Visible));

        // Coming back from Unseen raises a notification
        let raised = tracker.observe(&batch(11, &[1]), start + Duration::from_millis(3600));
        assert_eq!(raised.len(), 1);
    }

    #[test]
    fn test_state_count_bounded_by_distinct_objects() {
        let mut tracker = tracker();
        let start = Instant::now();

        for i in 0..1_000u64 {
            let now = start + Duration::from_millis(i * 40);
            tracker.observe(&batch(i, &[1, 2, 3]), now);
            tracker.sweep(now);
        }
        assert_eq!(tracker.len(), 3);

        assert!(tracker.forget(2));
        assert!(!tracker.forget(2));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_forget_drops_pending_notifications() {
        let mut tracker = tracker();
        tracker.observe(&batch(1, &[5]), Instant::now());
        assert_eq!(tracker.notifications().len(), 1);

        tracker.forget(5);
        assert!(tracker.notifications().is_empty());
    }

    #[test]
    fn test_unopened_notifications_kept_once_per_object() {
        let mut tracker = tracker();
        let start = Instant::now();

        // Object 5 keeps leaving and coming back without anyone opening
        // its notification
        for i in 0..100u64 {
            let now = start + Duration::from_secs(i * 4);
            tracker.observe(&batch(i, &[5, 6]), now);
        }

        assert_eq!(tracker.stats().reappearances, 200);
        assert_eq!(tracker.notifications().len(), 2);
        assert!(tracker
            .notifications()
            .iter()
            .any(|n| n.object_id == 5 && n.frame_id == 99));
    }

    #[test]
    fn test_open_notification_highlights_camera() {
        let mut tracker = tracker();
        let now = Instant::now();
        let id = tracker.observe(&batch(1, &[5]), now)[0].id;

        assert_eq!(tracker.open_notification(id, now), Some(CameraId::new("cam-1")));
        assert!(tracker.notifications().is_empty());
        assert!(tracker.is_highlighted(&CameraId::new("cam-1"), now));

        // Already dismissed
        assert!(tracker.open_notification(id, now).is_none());
    }

    #[test]
    fn test_second_highlight_restarts_countdown() {
        let mut tracker = tracker();
        let start = Instant::now();
        let camera = CameraId::new("cam-1");

        tracker.highlight(camera.clone(), start);
        tracker.highlight(camera.clone(), start + Duration::from_millis(1500));

        // The first countdown would have ended at 2 s
        let first_deadline = start + Duration::from_secs(2);
        assert!(tracker.expire_highlights(first_deadline).is_empty());
        assert!(tracker.is_highlighted(&camera, first_deadline));

        let second_deadline = start + Duration::from_millis(3500);
        assert_eq!(tracker.expire_highlights(second_deadline), vec![camera.clone()]);
        assert!(tracker.expire_highlights(second_deadline).is_empty());
        assert!(!tracker.is_highlighted(&camera, second_deadline));
        assert_eq!(tracker.stats().highlights_restarted, 1);
    }

    #[test]
    fn test_highlights_on_two_cameras_expire_independently() {
        let mut tracker = tracker();
        let start = Instant::now();
        let cam_a = CameraId::new("cam-a");
        let cam_b = CameraId::new("cam-b");

        tracker.highlight(cam_a.clone(), start);
        tracker.highlight(cam_b.clone(), start + Duration::from_millis(500));
        assert_eq!(tracker.stats().highlights_restarted, 0);

        let a_due = start + Duration::from_secs(2);
        assert_eq!(tracker.expire_highlights(a_due), vec![cam_a.clone()]);
        assert!(tracker.is_highlighted(&cam_b, a_due));

        let later = start + Duration::from_secs(10);
        assert_eq!(tracker.expire_highlights(later), vec![cam_b]);
        assert!(!tracker.is_highlighted(&cam_a, later));
    }

    #[test]
    fn test_due_highlights_expire_together() {
        let mut tracker = tracker();
        let start = Instant::now();

        tracker.highlight(CameraId::new("cam-b"), start);
        tracker.highlight(CameraId::new("cam-a"), start + Duration::from_millis(500));

        let expired = tracker.expire_highlights(start + Duration::from_secs(10));
        assert_eq!(expired, vec![CameraId::new("cam-a"), CameraId::new("cam-b")]);
    }

    #[test]
    fn test_click_untracked_box_starts_tracking() {
        let tracker = tracker();
        let camera = CameraId::new("cam-1");
        let bbox = BoundingBox::new(3, [0.2, 0.2, 0.8, 0.8], "person", None);

        let confirm = |_: &str| true;
        let command = tracker.command_for_click(&camera, 12, &bbox, &confirm, |_| {
            Some("cutout".to_string())
        });
        assert_eq!(
            command,
            Some(OutboundCommand::Start {
                camera_id: "cam-1".to_string(),
                frame_id: 12,
                box_id: 3,
                image: Some("cutout".to_string()),
            })
        );
    }

    #[test]
    fn test_click_tracked_box_stops_tracking() {
        let tracker = tracker();
        let camera = CameraId::new("cam-1");
        let bbox = BoundingBox::new(3, [0.2, 0.2, 0.8, 0.8], "person", Some(44));

        let confirm = |question: &str| question.contains("44");
        let command = tracker.command_for_click(&camera, 12, &bbox, &confirm, |_| None);
        assert_eq!(command, Some(OutboundCommand::Stop { object_id: 44 }));
    }

    #[test]
    fn test_declined_click_captures_nothing() {
        let tracker = tracker();
        let camera = CameraId::new("cam-1");
        let bbox = BoundingBox::new(3, [0.2, 0.2, 0.8, 0.8], "person", None);

        let decline = |_: &str| false;
        let command = tracker.command_for_click(&camera, 12, &bbox, &decline, |_| {
            panic!("cutout captured without confirmation")
        });
        assert!(command.is_none());
    }
}
