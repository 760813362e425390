//! Session wiring: resync detector + decode coordinator + render node.
//!
//! [`build`] returns a [`ServerAudio`] session for the control context and the
//! [`RenderNode`] the host audio callback drives. The session:
//! - inspects each transport unit with the resync detector before submitting it
//! - forwards decoded frames straight from the decode worker to the render node
//! - turns engine stats published by the render node into playback signals for
//!   the detector, log lines and the caller-facing [`AudioStats`]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{Receiver, TrySendError};
use voice_playback_types::{AudioStats, ResetReason, ThresholdSnapshot};

use crate::codec::DecoderFactory;
use crate::config::PlaybackConfig;
use crate::decode::{CoordinatorStats, DecodeCoordinator, DecodeEvent, SubmitOutcome};
use crate::engine::{EngineStats, PlaybackEngine};
use crate::render::{RenderNode, TurnControl};
use crate::resync::{ResyncDecision, ResyncDetector};
use crate::status::CriticalDelayMonitor;
use crate::thresholds::BufferThresholds;

/// Time source for the control context.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Build a playback session producing audio at `output_rate`.
pub fn build(
    config: PlaybackConfig,
    factory: DecoderFactory,
    output_rate: u32,
    clock: Arc<dyn Clock>,
) -> Result<(ServerAudio, RenderNode)> {
    let thresholds = BufferThresholds::from_config(&config.buffer, output_rate);
    let floors = thresholds.snapshot();
    let engine = PlaybackEngine::new(thresholds, &config.render);

    let control = Arc::new(TurnControl::new());
    let (frames, frame_rx) = crossbeam_channel::bounded(config.render.frame_capacity.max(1));
    let (stats_tx, stats) = crossbeam_channel::bounded(config.render.stats_capacity.max(1));
    let node = RenderNode::new(
        engine,
        control.clone(),
        frame_rx,
        stats_tx,
        config.render.quantum_samples,
        config.render.frame_capacity,
    );

    let coordinator = DecodeCoordinator::spawn(
        factory,
        output_rate,
        &config.decode,
        config.resync.silence_rms,
    )?;
    coordinator.on_decoded(move |decoded| {
        let len = decoded.frame.len();
        if let Err(TrySendError::Full(_)) = frames.try_send(decoded) {
            tracing::warn!(samples = len, "render frame channel full; decoded frame dropped");
        }
    });

    let session = ServerAudio {
        detector: ResyncDetector::new(config.resync.clone()),
        monitor: CriticalDelayMonitor::new(config.critical_delay.clone()),
        coordinator,
        control,
        stats,
        engine: node.stats(),
        floors,
        output_rate,
        uplink_seconds: 0.0,
        clock,
    };
    Ok((session, node))
}

/// Control-context half of the playback path.
pub struct ServerAudio {
    detector: ResyncDetector,
    monitor: CriticalDelayMonitor,
    coordinator: DecodeCoordinator,
    control: Arc<TurnControl>,
    stats: Receiver<EngineStats>,
    /// Latest engine snapshot for the current generation.
    engine: EngineStats,
    floors: ThresholdSnapshot,
    output_rate: u32,
    uplink_seconds: f64,
    clock: Arc<dyn Clock>,
}

impl ServerAudio {
    /// Handle one compressed unit from the transport.
    ///
    /// A detected turn boundary resets the engine and decoder before the unit
    /// is submitted; the unit is then dropped because no decoder is ready yet.
    pub fn handle_audio(&mut self, unit: Vec<u8>) -> SubmitOutcome {
        self.poll();
        let now = self.clock.now();
        if let ResyncDecision::Reset(reason) = self.detector.observe_unit(&unit, now) {
            self.resync(reason);
        }
        let outcome = self.coordinator.submit(unit);
        match outcome {
            SubmitOutcome::Queued | SubmitOutcome::DroppedNotReady => {}
            SubmitOutcome::DroppedFull => tracing::warn!("decode queue full; unit dropped"),
            SubmitOutcome::DroppedClosed => tracing::warn!("decoder closed; unit dropped"),
        }
        outcome
    }

    /// The user finished speaking; audio arriving shortly after starts a new turn.
    pub fn user_stopped_speaking(&mut self) {
        let now = self.clock.now();
        self.detector.note_user_stopped_speaking(now);
    }

    /// The transport (re)connected: reset everything, thresholds back to their floors.
    pub fn connection_established(&mut self) {
        let generation = self.coordinator.reinitialize(self.output_rate);
        self.coordinator.clear_stats();
        self.control.reinitialize(generation);
        self.detector.clear();
        self.monitor.reset();
        self.engine = self.cleared_engine(generation, self.floors);
        tracing::info!(
            reason = ResetReason::ConnectionEstablished.as_str(),
            generation,
            "connection established; playback reinitialized"
        );
    }

    /// Duration of captured microphone audio, used for the delay estimate.
    pub fn set_uplink_seconds(&mut self, seconds: f64) {
        self.uplink_seconds = seconds;
    }

    /// Drain decode events and engine stats. Call regularly from the control loop.
    pub fn poll(&mut self) {
        let now = self.clock.now();
        for event in self.coordinator.poll() {
            match event {
                DecodeEvent::Decoded { level, .. } => self.detector.note_decoded(level, now),
                DecodeEvent::Ready {
                    generation,
                    sample_rate,
                } => tracing::debug!(generation, sample_rate, "decoder ready"),
                DecodeEvent::Failed { generation, error } => {
                    tracing::warn!(generation, error = %error, "decoder unavailable; dropping units")
                }
                DecodeEvent::DecodeError { .. } => {}
            }
        }

        let generation = self.coordinator.generation();
        while let Ok(stats) = self.stats.try_recv() {
            if stats.generation != generation {
                continue;
            }
            self.observe_engine(stats, now);
        }
    }

    pub fn stats(&mut self) -> AudioStats {
        self.poll();
        let mut stats = self.coordinator.audio_stats(&self.engine, self.uplink_seconds);
        stats.critical_delay = self.monitor.is_raised();
        stats
    }

    pub fn engine_stats(&self) -> EngineStats {
        self.engine
    }

    pub fn coordinator_stats(&self) -> CoordinatorStats {
        self.coordinator.stats()
    }

    pub fn generation(&self) -> u64 {
        self.coordinator.generation()
    }

    pub fn is_decoder_ready(&self) -> bool {
        self.coordinator.is_ready()
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Stop the decode worker. The render node keeps producing silence.
    pub fn shutdown(&mut self) {
        self.coordinator.shutdown();
    }

    fn resync(&mut self, reason: ResetReason) {
        let before = self.engine;
        let generation = self.coordinator.reinitialize(self.output_rate);
        self.control.reset(generation);
        self.detector.clear();
        self.monitor.reset();
        self.engine = self.cleared_engine(generation, before.thresholds);
        tracing::info!(
            reason = reason.as_str(),
            generation,
            played_s = before.actual_audio_seconds(),
            total_s = before.total_output_seconds(),
            "new turn detected; resetting playback"
        );
    }

    fn observe_engine(&mut self, stats: EngineStats, now: Instant) {
        let prev = self.engine;
        if stats.started && !prev.started {
            tracing::debug!(
                generation = stats.generation,
                backlog_s = stats.backlog_seconds(),
                "playback started"
            );
        }
        if stats.underruns > prev.underruns {
            tracing::debug!(
                underruns = stats.underruns,
                partial_ms = stats.thresholds.partial_ms,
                "playback underrun"
            );
        }
        if stats.drop_passes > prev.drop_passes {
            tracing::info!(
                dropped_samples = stats.dropped_samples.saturating_sub(prev.dropped_samples),
                max_headroom_ms = stats.thresholds.max_headroom_ms,
                "dropped excess backlog"
            );
        }

        self.detector.note_playback(stats.actual_audio_samples, now);
        let total = stats.total_output_seconds();
        let missed = total - stats.actual_audio_seconds();
        let was_raised = self.monitor.is_raised();
        if self.monitor.observe(total, missed, now) && !was_raised {
            tracing::warn!(
                missed_s = missed,
                total_s = total,
                "critical playback delay"
            );
        }
        self.engine = stats;
    }

    /// Per-turn view right after a reset, before the render node reports back.
    fn cleared_engine(&self, generation: u64, thresholds: ThresholdSnapshot) -> EngineStats {
        EngineStats {
            generation,
            sample_rate: self.output_rate,
            thresholds,
            ..EngineStats::default()
        }
    }
}

impl Drop for ServerAudio {
    fn drop(&mut self) {
        self.shutdown();
    }
}
