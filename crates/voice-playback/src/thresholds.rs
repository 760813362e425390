//! Adaptive jitter-buffer thresholds.
//!
//! Three sample counts drive the engine:
//! - `initial`: backlog required before a turn starts playing (never grows)
//! - `partial`: headroom required before resumed output is audible (grows on underrun)
//! - `max_headroom`: backlog tolerated beyond `initial + partial` before dropping (grows after a drop)
//!
//! Growth is sticky: a turn reset only re-applies the floors (and the optional
//! decay), so a session that saw bursty delivery keeps its wider margins.

use voice_playback_types::ThresholdSnapshot;

use crate::config::{BufferConfig, ms_to_samples, samples_to_ms};

/// Floor, step and ceiling for one growable threshold (all in samples).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Growth {
    pub floor: usize,
    pub increment: usize,
    pub cap: usize,
}

impl Growth {
    /// A cap below the floor is raised to the floor.
    pub fn new(floor: usize, increment: usize, cap: usize) -> Self {
        Self {
            floor,
            increment,
            cap: cap.max(floor),
        }
    }

    fn grow(&self, value: usize) -> usize {
        value.saturating_add(self.increment).min(self.cap).max(value)
    }

    fn decay(&self, value: usize, decay: f64) -> usize {
        let value = value.max(self.floor);
        if decay <= 0.0 {
            return value;
        }
        let accrued = (value - self.floor) as f64;
        self.floor + (accrued * (1.0 - decay)).floor() as usize
    }
}

/// The engine's adaptive thresholds.
#[derive(Clone, Debug, PartialEq)]
pub struct BufferThresholds {
    rate_hz: u32,
    initial: usize,
    partial: usize,
    partial_growth: Growth,
    max_headroom: usize,
    headroom_growth: Growth,
    growth_decay: f64,
}

impl BufferThresholds {
    /// Convert the millisecond targets in `cfg` into sample counts at `rate_hz`.
    pub fn from_config(cfg: &BufferConfig, rate_hz: u32) -> Self {
        let partial_growth = Growth::new(
            ms_to_samples(cfg.partial_ms, rate_hz),
            ms_to_samples(cfg.partial_increment_ms, rate_hz),
            ms_to_samples(cfg.partial_max_ms, rate_hz),
        );
        let headroom_growth = Growth::new(
            ms_to_samples(cfg.max_headroom_ms, rate_hz),
            ms_to_samples(cfg.max_headroom_increment_ms, rate_hz),
            ms_to_samples(cfg.max_headroom_max_ms, rate_hz),
        );
        let growth_decay = if cfg.growth_decay.is_finite() {
            f64::from(cfg.growth_decay.clamp(0.0, 1.0))
        } else {
            0.0
        };
        Self {
            rate_hz,
            initial: ms_to_samples(cfg.initial_ms, rate_hz),
            partial: partial_growth.floor,
            partial_growth,
            max_headroom: headroom_growth.floor,
            headroom_growth,
            growth_decay,
        }
    }

    /// Build thresholds directly from sample counts.
    pub fn from_samples(rate_hz: u32, initial: usize, partial: Growth, max_headroom: Growth) -> Self {
        Self {
            rate_hz,
            initial,
            partial: partial.floor,
            partial_growth: partial,
            max_headroom: max_headroom.floor,
            headroom_growth: max_headroom,
            growth_decay: 0.0,
        }
    }

    /// Replace the decay fraction applied on turn resets.
    pub fn with_growth_decay(mut self, decay: f64) -> Self {
        self.growth_decay = if decay.is_finite() { decay.clamp(0.0, 1.0) } else { 0.0 };
        self
    }

    pub fn rate_hz(&self) -> u32 {
        self.rate_hz
    }

    pub fn initial(&self) -> usize {
        self.initial
    }

    pub fn partial(&self) -> usize {
        self.partial
    }

    pub fn max_headroom(&self) -> usize {
        self.max_headroom
    }

    pub fn partial_growth(&self) -> Growth {
        self.partial_growth
    }

    pub fn headroom_growth(&self) -> Growth {
        self.headroom_growth
    }

    /// Backlog at which the engine runs a drop pass.
    pub fn drop_threshold(&self) -> usize {
        self.initial
            .saturating_add(self.partial)
            .saturating_add(self.max_headroom)
    }

    /// Backlog left behind by a drop pass.
    pub fn drop_target(&self) -> usize {
        self.initial.saturating_add(self.partial)
    }

    /// Widen resume headroom after an underrun. Returns `true` if the value changed.
    pub fn grow_partial(&mut self) -> bool {
        let next = self.partial_growth.grow(self.partial);
        let changed = next != self.partial;
        self.partial = next;
        changed
    }

    /// Widen drop tolerance after a drop pass. Returns `true` if the value changed.
    pub fn grow_max_headroom(&mut self) -> bool {
        let next = self.headroom_growth.grow(self.max_headroom);
        let changed = next != self.max_headroom;
        self.max_headroom = next;
        changed
    }

    /// Re-apply the floors at a turn reset.
    ///
    /// Accrued growth survives unless a decay is configured and `decay` is set.
    pub fn enforce_floors(&mut self, decay: bool) {
        let fraction = if decay { self.growth_decay } else { 0.0 };
        self.partial = self.partial_growth.decay(self.partial, fraction);
        self.max_headroom = self.headroom_growth.decay(self.max_headroom, fraction);
    }

    /// Discard all growth (new connection).
    pub fn restore_floors(&mut self) {
        self.partial = self.partial_growth.floor;
        self.max_headroom = self.headroom_growth.floor;
    }

    pub fn snapshot(&self) -> ThresholdSnapshot {
        ThresholdSnapshot {
            initial_ms: samples_to_ms(self.initial, self.rate_hz),
            partial_ms: samples_to_ms(self.partial, self.rate_hz),
            max_headroom_ms: samples_to_ms(self.max_headroom, self.rate_hz),
        }
    }
}
