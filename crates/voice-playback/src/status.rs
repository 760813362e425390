//! Caller-facing playback statistics.

use std::time::Instant;

use voice_playback_types::AudioStats;

use crate::config::CriticalDelayConfig;
use crate::engine::EngineStats;

/// Build an [`AudioStats`] snapshot from engine metrics and session counters.
///
/// `uplink_seconds` is the duration of captured microphone audio; the delay
/// estimate is how far the playback position trails it.
pub fn assemble(
    engine: &EngineStats,
    total_audio_messages: u64,
    resets: u64,
    uplink_seconds: f64,
) -> AudioStats {
    let total = engine.total_output_seconds();
    let played = engine.actual_audio_seconds();
    AudioStats {
        played_audio_seconds: played,
        missed_audio_seconds: (total - played).max(0.0),
        total_output_seconds: total,
        total_audio_messages,
        delay_seconds: uplink_seconds - engine.time_in_stream_seconds(),
        min_playback_delay_seconds: engine.min_backlog_seconds(),
        max_playback_delay_seconds: engine.max_backlog_seconds(),
        backlog_seconds: engine.backlog_seconds(),
        underruns: engine.underruns,
        drop_passes: engine.drop_passes,
        resets,
        thresholds: engine.thresholds,
        critical_delay: false,
    }
}

/// Raises a condition when too much output has been silence for too long.
#[derive(Clone, Debug)]
pub struct CriticalDelayMonitor {
    cfg: CriticalDelayConfig,
    critical_since: Option<Instant>,
    raised: bool,
}

impl CriticalDelayMonitor {
    pub fn new(cfg: CriticalDelayConfig) -> Self {
        Self {
            cfg,
            critical_since: None,
            raised: false,
        }
    }

    pub fn is_raised(&self) -> bool {
        self.raised
    }

    /// Feed the latest totals. Returns whether the condition is raised.
    pub fn observe(&mut self, total_seconds: f64, missed_seconds: f64, now: Instant) -> bool {
        let critical = total_seconds >= self.cfg.min_total_seconds
            && total_seconds > 0.0
            && missed_seconds / total_seconds >= self.cfg.missed_ratio;
        if !critical {
            self.reset();
            return false;
        }
        let since = *self.critical_since.get_or_insert(now);
        self.raised = now.saturating_duration_since(since) >= self.cfg.sustain;
        self.raised
    }

    pub fn reset(&mut self) {
        self.critical_since = None;
        self.raised = false;
    }
}
