//! Stream resynchronization detector.
//!
//! The server keeps one continuous encoded stream open across spoken turns and
//! never says when a new turn begins. The detector watches every incoming unit
//! plus decode and playback progress and decides when the decoder and jitter
//! buffer must be reset before the unit is decoded.
//!
//! Checks, in priority order, once playback of the current turn has started:
//! 1. the unit is an Ogg page with the beginning-of-stream flag
//! 2. the user stopped speaking within the trailing window
//! 3. no non-silent audio was decoded for longer than the gap threshold
//! 4. playback stalled for longer than the stall threshold while data keeps arriving

use std::time::{Duration, Instant};

use voice_playback_types::ResetReason;

use crate::config::ResyncConfig;

const OGG_CAPTURE_PATTERN: &[u8; 4] = b"OggS";
const OGG_PAGE_HEADER_LEN: usize = 27;
const OGG_HEADER_TYPE_OFFSET: usize = 5;
const OGG_BOS_FLAG: u8 = 0x02;

/// `true` if `unit` starts with an Ogg page header flagged beginning-of-stream.
pub fn is_stream_start(unit: &[u8]) -> bool {
    unit.len() >= OGG_PAGE_HEADER_LEN
        && unit.starts_with(OGG_CAPTURE_PATTERN)
        && unit[OGG_HEADER_TYPE_OFFSET] & OGG_BOS_FLAG != 0
}

/// Result of inspecting one unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResyncDecision {
    Continue,
    /// Reset the engine and reinitialize the decoder before decoding this unit.
    Reset(ResetReason),
}

/// Timing signals tracked between boundaries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamBoundaryState {
    pub started: bool,
    pub last_non_silent: Option<Instant>,
    pub last_progress: Option<Instant>,
    pub stalled_since: Option<Instant>,
    pub user_stopped: Option<Instant>,
    pub units: u64,
    /// Last observed real-audio sample count of the current turn.
    pub played_samples: u64,
}

#[derive(Clone, Debug)]
pub struct ResyncDetector {
    cfg: ResyncConfig,
    state: StreamBoundaryState,
}

impl ResyncDetector {
    pub fn new(cfg: ResyncConfig) -> Self {
        Self {
            cfg,
            state: StreamBoundaryState::default(),
        }
    }

    pub fn state(&self) -> &StreamBoundaryState {
        &self.state
    }

    pub fn has_started(&self) -> bool {
        self.state.started
    }

    /// Inspect one incoming unit before it is submitted for decoding.
    pub fn observe_unit(&mut self, unit: &[u8], now: Instant) -> ResyncDecision {
        self.state.units += 1;
        if !self.state.started {
            return ResyncDecision::Continue;
        }
        if is_stream_start(unit) {
            return ResyncDecision::Reset(ResetReason::StreamStart);
        }
        if self.cfg.honor_user_stop && within(self.state.user_stopped, now, self.cfg.user_stop_window)
        {
            return ResyncDecision::Reset(ResetReason::UserStoppedSpeaking);
        }
        if exceeded(self.state.last_non_silent, now, self.cfg.silence_gap) {
            return ResyncDecision::Reset(ResetReason::SilenceGap);
        }
        if exceeded(self.state.stalled_since, now, self.cfg.stall_threshold) {
            return ResyncDecision::Reset(ResetReason::PlaybackStalled);
        }
        ResyncDecision::Continue
    }

    /// Record a decoded frame's level. Silence does not refresh the gap timer.
    pub fn note_decoded(&mut self, level: f32, now: Instant) {
        if level >= self.cfg.silence_rms {
            self.state.last_non_silent = Some(now);
        }
    }

    /// Record the engine's real-audio sample count for the current turn.
    pub fn note_playback(&mut self, played_samples: u64, now: Instant) {
        if played_samples > self.state.played_samples {
            self.state.played_samples = played_samples;
            self.state.started = true;
            self.state.last_progress = Some(now);
            self.state.stalled_since = None;
            return;
        }
        if self.state.started
            && self.state.stalled_since.is_none()
            && exceeded(self.state.last_progress, now, self.cfg.stall_grace)
        {
            self.state.stalled_since = Some(now);
            tracing::debug!("playback stalled");
        }
    }

    pub fn note_user_stopped_speaking(&mut self, now: Instant) {
        self.state.user_stopped = Some(now);
    }

    /// Forget everything observed so far (boundary handled or new connection).
    pub fn clear(&mut self) {
        self.state = StreamBoundaryState::default();
    }
}

fn elapsed(since: Instant, now: Instant) -> Duration {
    now.saturating_duration_since(since)
}

fn within(at: Option<Instant>, now: Instant, window: Duration) -> bool {
    at.is_some_and(|t| elapsed(t, now) < window)
}

fn exceeded(at: Option<Instant>, now: Instant, limit: Duration) -> bool {
    at.is_some_and(|t| elapsed(t, now) > limit)
}
