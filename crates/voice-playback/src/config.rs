use std::time::Duration;

/// Tuning for every stage of the playback path.
#[derive(Clone, Debug, Default)]
pub struct PlaybackConfig {
    pub buffer: BufferConfig,
    pub render: RenderConfig,
    pub decode: DecodeConfig,
    pub resync: ResyncConfig,
    pub critical_delay: CriticalDelayConfig,
}

/// Jitter buffer targets, in milliseconds of audio at the active output rate.
#[derive(Clone, Debug)]
pub struct BufferConfig {
    /// Backlog required before the first output of a turn.
    pub initial_ms: f32,
    /// Headroom required before resumed output is audible (also its floor).
    pub partial_ms: f32,
    /// Growth applied to `partial` on every underrun.
    pub partial_increment_ms: f32,
    /// Upper bound for `partial` growth.
    pub partial_max_ms: f32,
    /// Extra backlog tolerated beyond `initial + partial` before dropping (also its floor).
    pub max_headroom_ms: f32,
    /// Growth applied to `max_headroom` after every drop pass.
    pub max_headroom_increment_ms: f32,
    /// Upper bound for `max_headroom` growth.
    pub max_headroom_max_ms: f32,
    /// Fraction (0.0..=1.0) of accrued growth discarded when a turn is reset.
    ///
    /// `0.0` keeps growth for the whole session.
    pub growth_decay: f32,
}

impl Default for BufferConfig {
    /// Defaults tuned for WAN links with 250-400ms RTT and noticeable jitter.
    fn default() -> Self {
        Self {
            initial_ms: 450.0,
            partial_ms: 120.0,
            partial_increment_ms: 40.0,
            partial_max_ms: 500.0,
            max_headroom_ms: 1500.0,
            max_headroom_increment_ms: 150.0,
            max_headroom_max_ms: 2500.0,
            growth_decay: 0.0,
        }
    }
}

/// Render-side sizing.
#[derive(Clone, Debug)]
pub struct RenderConfig {
    /// Samples produced per render quantum.
    pub quantum_samples: usize,
    /// Nominal fade-in/fade-out length in samples.
    pub fade_samples: usize,
    /// Maximum number of frames the engine queue holds.
    ///
    /// Must cover the largest drop threshold (`initial + partial_max +
    /// max_headroom_max`) in frames of the smallest decoded size. A full queue
    /// evicts its oldest frame on enqueue, before any drop pass can run.
    pub queue_frames: usize,
    /// Capacity of the decoded-frame channel feeding the render node.
    pub frame_capacity: usize,
    /// Capacity of the stats channel leaving the render node.
    pub stats_capacity: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            quantum_samples: 128,
            fade_samples: 128,
            queue_frames: 2048,
            frame_capacity: 512,
            stats_capacity: 4,
        }
    }
}

/// Decode worker sizing.
#[derive(Clone, Debug)]
pub struct DecodeConfig {
    /// Compressed units that may wait for the decode worker.
    pub unit_capacity: usize,
    /// Worker events that may wait for the control context.
    pub event_capacity: usize,
    /// Resampler input chunk size in frames (used only when rates differ).
    pub resample_chunk_frames: usize,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            unit_capacity: 256,
            event_capacity: 1024,
            resample_chunk_frames: 480,
        }
    }
}

/// Heuristics used to detect a new server turn on a continuous stream.
#[derive(Clone, Debug)]
pub struct ResyncConfig {
    /// Honor the "user stopped speaking" signal at all.
    pub honor_user_stop: bool,
    /// How long after the user stops speaking arriving audio is treated as a new turn.
    pub user_stop_window: Duration,
    /// Gap since the last non-silent decoded audio that marks a new turn.
    pub silence_gap: Duration,
    /// Time without playback progress before playback counts as stalled.
    pub stall_grace: Duration,
    /// Time a stall must persist, while data keeps arriving, before resetting.
    pub stall_threshold: Duration,
    /// RMS level below which a decoded frame counts as silence.
    pub silence_rms: f32,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            honor_user_stop: true,
            user_stop_window: Duration::from_millis(3000),
            silence_gap: Duration::from_millis(2000),
            stall_grace: Duration::from_millis(500),
            stall_threshold: Duration::from_millis(1000),
            silence_rms: 0.001,
        }
    }
}

/// Policy for raising the "critical delay" condition.
#[derive(Clone, Debug)]
pub struct CriticalDelayConfig {
    /// Missed/total output ratio considered critical.
    pub missed_ratio: f64,
    /// How long the ratio must stay critical before the condition is raised.
    pub sustain: Duration,
    /// Minimum output (seconds) before the ratio is meaningful.
    pub min_total_seconds: f64,
}

impl Default for CriticalDelayConfig {
    fn default() -> Self {
        Self {
            missed_ratio: 0.5,
            sustain: Duration::from_secs(5),
            min_total_seconds: 2.0,
        }
    }
}

/// Convert a latency in milliseconds into a sample count at `rate_hz`.
///
/// Negative and non-finite inputs map to zero.
pub fn ms_to_samples(ms: f32, rate_hz: u32) -> usize {
    if !ms.is_finite() || ms <= 0.0 {
        return 0;
    }
    (f64::from(ms) * f64::from(rate_hz) / 1000.0).round() as usize
}

/// Convert a sample count at `rate_hz` into milliseconds.
pub fn samples_to_ms(samples: usize, rate_hz: u32) -> f64 {
    if rate_hz == 0 {
        return 0.0;
    }
    samples as f64 * 1000.0 / f64::from(rate_hz)
}
