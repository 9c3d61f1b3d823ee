//! Frame-ordered delivery of detection batches.
//!
//! Detections usually arrive ahead of the video frame they describe. Each
//! camera keeps its batches here until the playback clock reaches their frame
//! identifier, then releases them front-first so display order never goes
//! backwards.

use crate::config::QueueConfig;
use crate::model::{CameraId, FrameBatch, FrameId};
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// Statistics for one delivery queue.
#[derive(Debug, Default, Clone)]
pub struct QueueStats {
    pub enqueued: u64,
    pub released: u64,
    pub dropped_paused: u64,
    pub max_depth: usize,
}

/// Per-camera FIFO of batches waiting for playback to catch up.
pub struct DeliveryQueue {
    camera_id: CameraId,
    pending: VecDeque<FrameBatch>,
    accepting: bool,
    backlog_warn_threshold: usize,
    backlogged: bool,
    last_enqueued: Option<FrameId>,
    stats: QueueStats,
}

impl DeliveryQueue {
    pub fn new(camera_id: CameraId, config: &QueueConfig) -> Self {
        Self {
            camera_id,
            pending: VecDeque::new(),
            accepting: false,
            backlog_warn_threshold: config.backlog_warn_threshold,
            backlogged: false,
            last_enqueued: None,
            stats: QueueStats::default(),
        }
    }

    pub fn camera_id(&self) -> &CameraId {
        &self.camera_id
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.clone()
    }

    pub fn front_frame_id(&self) -> Option<FrameId> {
        self.pending.front().map(|batch| batch.frame_id)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Accept new batches only while the overlay is playing.
    pub fn set_accepting(&mut self, accepting: bool) {
        if self.accepting != accepting {
            debug!(camera_id = %self.camera_id, accepting, "Delivery queue intake changed");
        }
        self.accepting = accepting;
    }

    /// Queue a batch. Returns `false` if it was dropped because playback is
    /// paused.
    pub fn enqueue(&mut self, batch: FrameBatch) -> bool {
        if !self.accepting {
            self.stats.dropped_paused += 1;
            let camera = self.camera_id.to_string();
            metrics::counter!("overlay.queue.dropped_paused", "camera" => camera).increment(1);
            trace!(
                camera_id = %self.camera_id,
                frame_id = batch.frame_id,
                "Playback paused, dropping batch"
            );
            return false;
        }

        if let Some(last) = self.last_enqueued {
            if batch.frame_id < last {
                debug!(
                    camera_id = %self.camera_id,
                    frame_id = batch.frame_id,
                    previous = last,
                    "Batch arrived out of order"
                );
            }
        }
        self.last_enqueued = Some(batch.frame_id);

        self.pending.push_back(batch);
        self.stats.enqueued += 1;
        self.stats.max_depth = self.stats.max_depth.max(self.pending.len());
        self.report_depth();
        true
    }

    /// Release every batch at or before `frame_time`, oldest first.
    ///
    /// Nothing is released while the clock is uncalibrated (`None`).
    pub fn release(&mut self, frame_time: Option<FrameId>) -> Vec<FrameBatch> {
        let Some(now) = frame_time else {
            return Vec::new();
        };

        let mut released = Vec::new();
        while let Some(front) = self.pending.front() {
            if front.frame_id > now {
                break;
            }
            if let Some(batch) = self.pending.pop_front() {
                released.push(batch);
            }
        }

        if !released.is_empty() {
            self.stats.released += released.len() as u64;
            metrics::counter!("overlay.queue.released", "camera" => self.camera_id.to_string())
                .increment(released.len() as u64);
            self.report_depth();
        }

        released
    }

    /// Drop everything pending.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.last_enqueued = None;
        self.report_depth();
    }

    fn report_depth(&mut self) {
        let depth = self.pending.len();
        metrics::gauge!("overlay.queue.depth", "camera" => self.camera_id.to_string())
            .set(depth as f64);

        if depth > self.backlog_warn_threshold {
            if !self.backlogged {
                warn!(
                    camera_id = %self.camera_id,
                    depth,
                    front_frame_id = ?self.front_frame_id(),
                    "Delivery queue backlog, playback clock may be stalled"
                );
                self.backlogged = true;
            }
        } else {
            self.backlogged = false;
        }
    }
}
