//! Configuration loading and resolution.
//!
//! The optional TOML file mirrors the library config sections; every field is
//! optional and overrides the library default when present. CLI flags win over
//! the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use voice_playback::config::PlaybackConfig;

/// Default stream buffer size requested from the device, in frames.
pub const DEFAULT_BUFFER_FRAMES: u32 = 512;

/// Top-level client configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub output: Option<OutputSection>,
    pub buffer: Option<BufferSection>,
    pub render: Option<RenderSection>,
    pub decode: Option<DecodeSection>,
    pub resync: Option<ResyncSection>,
    pub critical_delay: Option<CriticalDelaySection>,
}

/// Output device preferences.
#[derive(Debug, Default, Deserialize)]
pub struct OutputSection {
    /// Output device substring match.
    pub device: Option<String>,
    /// Preferred output sample rate (defaults to the source rate).
    pub sample_rate: Option<u32>,
    /// Requested device buffer size in frames.
    pub buffer_frames: Option<u32>,
}

/// Jitter buffer targets in milliseconds.
#[derive(Debug, Default, Deserialize)]
pub struct BufferSection {
    pub initial_ms: Option<f32>,
    pub partial_ms: Option<f32>,
    pub partial_increment_ms: Option<f32>,
    pub partial_max_ms: Option<f32>,
    pub max_headroom_ms: Option<f32>,
    pub max_headroom_increment_ms: Option<f32>,
    pub max_headroom_max_ms: Option<f32>,
    pub growth_decay: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RenderSection {
    pub quantum_samples: Option<usize>,
    pub fade_samples: Option<usize>,
    pub queue_frames: Option<usize>,
    pub frame_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DecodeSection {
    pub unit_capacity: Option<usize>,
    pub resample_chunk_frames: Option<usize>,
}

/// Turn boundary heuristics; durations in milliseconds.
#[derive(Debug, Default, Deserialize)]
pub struct ResyncSection {
    pub honor_user_stop: Option<bool>,
    pub user_stop_window_ms: Option<u64>,
    pub silence_gap_ms: Option<u64>,
    pub stall_grace_ms: Option<u64>,
    pub stall_threshold_ms: Option<u64>,
    pub silence_rms: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CriticalDelaySection {
    pub missed_ratio: Option<f64>,
    pub sustain_ms: Option<u64>,
    pub min_total_seconds: Option<f64>,
}

impl FileConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::parse(&raw).with_context(|| format!("parse config {:?}", path))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str::<FileConfig>(raw)?)
    }

    /// Library config with every present field applied over the defaults.
    pub fn playback_config(&self) -> PlaybackConfig {
        let mut cfg = PlaybackConfig::default();

        if let Some(b) = &self.buffer {
            let buf = &mut cfg.buffer;
            set(&mut buf.initial_ms, b.initial_ms);
            set(&mut buf.partial_ms, b.partial_ms);
            set(&mut buf.partial_increment_ms, b.partial_increment_ms);
            set(&mut buf.partial_max_ms, b.partial_max_ms);
            set(&mut buf.max_headroom_ms, b.max_headroom_ms);
            set(&mut buf.max_headroom_increment_ms, b.max_headroom_increment_ms);
            set(&mut buf.max_headroom_max_ms, b.max_headroom_max_ms);
            set(&mut buf.growth_decay, b.growth_decay);
        }
        if let Some(r) = &self.render {
            set(&mut cfg.render.quantum_samples, r.quantum_samples);
            set(&mut cfg.render.fade_samples, r.fade_samples);
            set(&mut cfg.render.queue_frames, r.queue_frames);
            set(&mut cfg.render.frame_capacity, r.frame_capacity);
        }
        if let Some(d) = &self.decode {
            set(&mut cfg.decode.unit_capacity, d.unit_capacity);
            set(&mut cfg.decode.resample_chunk_frames, d.resample_chunk_frames);
        }
        if let Some(r) = &self.resync {
            let resync = &mut cfg.resync;
            set(&mut resync.honor_user_stop, r.honor_user_stop);
            set(&mut resync.user_stop_window, r.user_stop_window_ms.map(Duration::from_millis));
            set(&mut resync.silence_gap, r.silence_gap_ms.map(Duration::from_millis));
            set(&mut resync.stall_grace, r.stall_grace_ms.map(Duration::from_millis));
            set(&mut resync.stall_threshold, r.stall_threshold_ms.map(Duration::from_millis));
            set(&mut resync.silence_rms, r.silence_rms);
        }
        if let Some(c) = &self.critical_delay {
            set(&mut cfg.critical_delay.missed_ratio, c.missed_ratio);
            set(&mut cfg.critical_delay.sustain, c.sustain_ms.map(Duration::from_millis));
            set(&mut cfg.critical_delay.min_total_seconds, c.min_total_seconds);
        }
        cfg
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

/// Everything `play` needs, resolved from CLI flags and the optional file.
#[derive(Clone, Debug)]
pub struct ClientPlayConfig {
    pub paths: Vec<PathBuf>,
    pub device: Option<String>,
    pub sample_rate: Option<u32>,
    pub buffer_frames: u32,
    pub playback: PlaybackConfig,
    /// Packets released at once by the simulated transport.
    pub burst: usize,
    /// Silence inserted between files.
    pub turn_gap: Duration,
    /// Signal "user stopped speaking" at each file boundary.
    pub signal_user_stop: bool,
    /// Periodic stats interval; zero disables periodic reports.
    pub stats_interval: Duration,
    pub json: bool,
}

impl ClientPlayConfig {
    pub fn resolve(args: &crate::cli::PlayArgs, device: Option<String>, file: &FileConfig) -> Self {
        let output = file.output.as_ref();
        Self {
            paths: args.paths.clone(),
            device: normalize_device_name(
                device.or_else(|| output.and_then(|o| o.device.clone())),
            ),
            sample_rate: args.sample_rate.or_else(|| output.and_then(|o| o.sample_rate)),
            buffer_frames: output
                .and_then(|o| o.buffer_frames)
                .unwrap_or(DEFAULT_BUFFER_FRAMES),
            playback: file.playback_config(),
            burst: args.burst.max(1),
            turn_gap: Duration::from_millis(args.turn_gap_ms),
            signal_user_stop: args.signal_user_stop,
            stats_interval: Duration::from_millis(args.stats_interval_ms),
            json: args.json,
        }
    }
}

pub fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
