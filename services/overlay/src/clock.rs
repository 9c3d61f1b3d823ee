//! Playback clock calibration.
//!
//! A live stream's media element only reports its position within the
//! segments it currently holds, which says nothing about where that is in the
//! stream as a whole. The clock waits for the element to cross a segment
//! boundary, resolves the new segment's start time from its name, and from
//! then on reports
//!
//! ```text
//! segment_start + (position - position_at_boundary) + lead_correction
//! ```
//!
//! Calibration is a two-phase poll: first slowly until any segment is
//! active, then at display rate until a *different* segment becomes active.

use crate::config::PlaybackConfig;
use crate::model::FrameId;
use crate::segment::{SegmentResolver, SegmentStart};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised by the playback clock.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClockError {
    #[error("Playback stalled for {stalled_for:?}, source reloaded")]
    PlaybackStalled { stalled_for: Duration },
}

/// The media-playback collaborator the clock samples.
pub trait MediaElement: Send + Sync {
    /// Position in seconds on the element's own timeline.
    fn current_position(&self) -> f64;

    /// Name or URL of the segment currently playing, once known.
    fn active_segment(&self) -> Option<String>;

    /// Intrinsic video dimensions, once metadata has loaded.
    fn intrinsic_size(&self) -> Option<(u32, u32)>;

    /// Drop buffered media and load the current source from scratch.
    fn reload_source(&self);

    /// Encode the region of the displayed frame covered by `rect` as an
    /// image (data URL or base64).
    fn capture_cutout(&self, rect: &crate::model::Rect) -> Option<String>;
}

/// Tuning for the clock, derived from [`PlaybackConfig`].
#[derive(Debug, Clone)]
pub struct ClockSettings {
    pub segment_duration: f64,
    pub container_extension: String,
    pub segment_poll_interval: Duration,
    pub frame_rate: f64,
    pub lead_correction: f64,
    pub buffering_threshold: Duration,
}

impl From<&PlaybackConfig> for ClockSettings {
    fn from(config: &PlaybackConfig) -> Self {
        Self {
            segment_duration: config.segment_duration_secs,
            container_extension: config.container_extension.clone(),
            segment_poll_interval: config.segment_poll_interval(),
            frame_rate: config.frame_rate,
            lead_correction: config.lead_correction_ms as f64 / 1000.0,
            buffering_threshold: config.buffering_threshold(),
        }
    }
}

impl Default for ClockSettings {
    fn default() -> Self {
        ClockSettings::from(&PlaybackConfig::default())
    }
}

/// Calibration phase.
#[derive(Debug, Clone, PartialEq)]
pub enum Calibration {
    /// Waiting for the element to report any active segment
    AwaitingSegment,
    /// Waiting for the element to move past `initial`
    AwaitingBoundary { initial: String },
    Calibrated {
        segment_start: f64,
        captured_position: f64,
    },
}

/// Mutable playback state, reset whenever the media source changes.
#[derive(Debug, Clone)]
pub struct PlaybackState {
    pub calibration: Calibration,
    pub playing: bool,
    pub buffering: bool,
    last_position: Option<f64>,
    last_progress_at: Option<Instant>,
    /// Last computed absolute time; held while paused
    current: Option<f64>,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            calibration: Calibration::AwaitingSegment,
            playing: false,
            buffering: false,
            last_position: None,
            last_progress_at: None,
            current: None,
        }
    }
}

/// Clock counters.
#[derive(Debug, Default, Clone)]
pub struct ClockStats {
    pub calibrations: u64,
    pub stalls: u64,
}

/// Maps a media element's position onto absolute stream time.
pub struct PlaybackClock {
    media: Arc<dyn MediaElement>,
    resolver: SegmentResolver,
    settings: ClockSettings,
    state: PlaybackState,
    next_segment_poll: Option<Instant>,
    stats: ClockStats,
}

impl PlaybackClock {
    pub fn new(media: Arc<dyn MediaElement>, settings: ClockSettings) -> Self {
        let resolver = SegmentResolver::new(settings.segment_duration)
            .with_extension(settings.container_extension.clone());

        Self {
            media,
            resolver,
            settings,
            state: PlaybackState::default(),
            next_segment_poll: None,
            stats: ClockStats::default(),
        }
    }

    pub fn media(&self) -> &Arc<dyn MediaElement> {
        &self.media
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn stats(&self) -> ClockStats {
        self.stats.clone()
    }

    pub fn is_calibrated(&self) -> bool {
        matches!(self.state.calibration, Calibration::Calibrated { .. })
    }

    pub fn is_playing(&self) -> bool {
        self.state.playing
    }

    /// Absolute stream time in seconds, or `None` while uncalibrated.
    pub fn current_time(&self) -> Option<f64> {
        if self.is_calibrated() {
            self.state.current
        } else {
            None
        }
    }

    /// Current time expressed as a frame identifier.
    pub fn frame_time(&self) -> Option<FrameId> {
        self.current_time()
            .filter(|secs| *secs >= 0.0)
            .map(|secs| (secs * self.settings.frame_rate).floor() as FrameId)
    }

    /// Advance the clock by one display tick.
    ///
    /// Returns the current frame time, `Ok(None)` while uncalibrated, or
    /// [`ClockError::PlaybackStalled`] after the source had to be reloaded.
    pub fn tick(&mut self, now: Instant) -> Result<Option<FrameId>, ClockError> {
        self.advance_calibration(now);

        if self.state.playing {
            self.check_progress(now)?;
        }

        self.sample();
        Ok(self.frame_time())
    }

    fn advance_calibration(&mut self, now: Instant) {
        let next = match &self.state.calibration {
            Calibration::AwaitingSegment => {
                if matches!(self.next_segment_poll, Some(at) if now < at) {
                    return;
                }
                self.next_segment_poll = Some(now + self.settings.segment_poll_interval);

                match self.media.active_segment() {
                    Some(segment) => {
                        debug!(
                            segment = %segment,
                            "Initial segment acquired, waiting for boundary"
                        );
                        Calibration::AwaitingBoundary { initial: segment }
                    }
                    None => return,
                }
            }
            Calibration::AwaitingBoundary { initial } => {
                let current = match self.media.active_segment() {
                    Some(segment) if segment != *initial => segment,
                    _ => return,
                };

                match self.resolver.resolve(&current) {
                    SegmentStart::Known(segment_start) => {
                        let captured_position = self.media.current_position();
                        self.stats.calibrations += 1;
                        info!(
                            segment = %current,
                            segment_start,
                            captured_position,
                            "Playback clock calibrated"
                        );
                        self.state.current = None;
                        Calibration::Calibrated {
                            segment_start,
                            captured_position,
                        }
                    }
                    SegmentStart::Unknown => Calibration::AwaitingBoundary { initial: current },
                }
            }
            Calibration::Calibrated { .. } => return,
        };

        self.state.calibration = next;
    }

    fn check_progress(&mut self, now: Instant) -> Result<(), ClockError> {
        let position = self.media.current_position();

        match self.state.last_position {
            Some(last) if position <= last => {
                let since = *self.state.last_progress_at.get_or_insert(now);
                let stalled_for = now.saturating_duration_since(since);
                if stalled_for >= self.settings.buffering_threshold {
                    return Err(self.stall(stalled_for));
                }
            }
            _ => {
                if self.state.buffering {
                    debug!(position, "Playback resumed after buffering");
                    self.state.buffering = false;
                }
                self.state.last_position = Some(position);
                self.state.last_progress_at = Some(now);
            }
        }

        Ok(())
    }

    fn stall(&mut self, stalled_for: Duration) -> ClockError {
        warn!(
            stalled_ms = stalled_for.as_millis() as u64,
            "Playback stalled, reloading source"
        );
        self.stats.stalls += 1;
        metrics::counter!("overlay.clock.stalls").increment(1);

        self.media.reload_source();

        let playing = self.state.playing;
        self.reset();
        self.state.playing = playing;

        ClockError::PlaybackStalled { stalled_for }
    }

    fn sample(&mut self) {
        let Calibration::Calibrated {
            segment_start,
            captured_position,
        } = self.state.calibration
        else {
            return;
        };

        if self.state.playing || self.state.current.is_none() {
            let position = self.media.current_position();
            let elapsed = position - captured_position;
            self.state.current = Some(segment_start + elapsed + self.settings.lead_correction);
        }
    }

    /// The element started or resumed playing. Calibration is kept.
    pub fn on_play(&mut self, now: Instant) {
        self.state.playing = true;
        self.rebase_progress(now);
    }

    /// The element paused; the clock holds its current value.
    pub fn on_pause(&mut self) {
        self.state.playing = false;
    }

    /// The element ran out of buffered media.
    pub fn on_waiting(&mut self, now: Instant) {
        if !self.state.buffering {
            debug!("Media element is buffering");
            self.state.buffering = true;
        }
        self.state.last_progress_at.get_or_insert(now);
    }

    /// The element jumped to a new position.
    pub fn on_seeked(&mut self, now: Instant) {
        self.rebase_progress(now);
        self.state.current = None;
    }

    /// A new source was loaded into the element; calibration starts over.
    pub fn replace_source(&mut self) {
        info!("Media source replaced, clock reset");
        self.reset();
    }

    fn rebase_progress(&mut self, now: Instant) {
        self.state.last_position = Some(self.media.current_position());
        self.state.last_progress_at = Some(now);
    }

    fn reset(&mut self) {
        self.state = PlaybackState::default();
        self.next_segment_poll = None;
    }
}
