//! Decode pipeline coordinator.
//!
//! The coordinator lives on the control context and owns one decode worker
//! thread. Compressed units go to the worker over a bounded channel; decoded
//! frames leave through a sink installed with [`DecodeCoordinator::on_decoded`]
//! and lifecycle events come back on a second bounded channel.
//!
//! ## Generations
//! Every decoder instance has a generation number. [`reinitialize`] bumps the
//! generation and publishes it through a shared atomic before asking the
//! worker for a fresh instance, so the worker can skip `Init`s that were
//! already superseded, drop units queued for an older instance and discard
//! output that went stale while it was being decoded.
//!
//! [`reinitialize`]: DecodeCoordinator::reinitialize

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TryRecvError, TrySendError};
use voice_playback_types::AudioStats;

use crate::codec::{Decoder, DecoderFactory};
use crate::config::DecodeConfig;
use crate::engine::EngineStats;
use crate::queue::Frame;
use crate::resample::StreamResampler;
use crate::status;

const LIFECYCLE_RETRY: Duration = Duration::from_millis(50);

/// One decoded block handed to the frame sink.
#[derive(Debug)]
pub struct DecodedFrame {
    pub generation: u64,
    pub frame: Frame,
}

/// Receives every decoded frame on the worker thread.
pub type FrameSink = Box<dyn FnMut(DecodedFrame) + Send>;

/// Worker lifecycle and progress events.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodeEvent {
    /// A decoder instance for `generation` is ready to accept units.
    Ready { generation: u64, sample_rate: u32 },
    /// Building the decoder for `generation` failed; units keep being dropped.
    Failed { generation: u64, error: String },
    /// A unit produced `samples` output samples with RMS `level`.
    Decoded {
        generation: u64,
        samples: usize,
        level: f32,
    },
    /// A unit could not be decoded and was dropped.
    DecodeError { generation: u64 },
}

impl DecodeEvent {
    pub fn generation(&self) -> u64 {
        match self {
            DecodeEvent::Ready { generation, .. }
            | DecodeEvent::Failed { generation, .. }
            | DecodeEvent::Decoded { generation, .. }
            | DecodeEvent::DecodeError { generation } => *generation,
        }
    }
}

/// What happened to a submitted unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// No ready decoder (startup or reinitialize in flight).
    DroppedNotReady,
    /// The worker queue is full.
    DroppedFull,
    /// The worker has exited.
    DroppedClosed,
}

/// Counters kept by the coordinator.
///
/// Decode progress (`frames_decoded`, `decoded_seconds`, `non_silent_seconds`)
/// is per decoder generation; the rest spans the whole connection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CoordinatorStats {
    pub units_received: u64,
    pub dropped_not_ready: u64,
    pub dropped_full: u64,
    /// Units refused because the decode worker has exited.
    pub dropped_closed: u64,
    pub frames_decoded: u64,
    pub decoded_seconds: f64,
    pub non_silent_seconds: f64,
    pub decode_errors: u64,
    pub reinitializations: u64,
}

enum WorkerCommand {
    Sink(FrameSink),
    Init { generation: u64, output_rate: u32 },
    Decode { generation: u64, unit: Vec<u8> },
    Shutdown,
}

/// Owns the decoder lifecycle from the control context.
pub struct DecodeCoordinator {
    commands: Sender<WorkerCommand>,
    events: Receiver<DecodeEvent>,
    latest: Arc<AtomicU64>,
    generation: u64,
    ready: bool,
    decoder_rate: Option<u32>,
    output_rate: u32,
    silence_rms: f32,
    stats: CoordinatorStats,
    worker: Option<JoinHandle<()>>,
}

impl DecodeCoordinator {
    /// Spawn the decode worker and request the first decoder instance (generation 0).
    pub fn spawn(
        factory: DecoderFactory,
        output_rate: u32,
        cfg: &DecodeConfig,
        silence_rms: f32,
    ) -> Result<Self> {
        let (commands, worker_commands) = crossbeam_channel::bounded(cfg.unit_capacity.max(1));
        let (worker_events, events) = crossbeam_channel::bounded(cfg.event_capacity.max(1));
        let latest = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            factory,
            latest: latest.clone(),
            events: worker_events,
            chunk_frames: cfg.resample_chunk_frames,
            sink: None,
            active: None,
        };
        let handle = thread::Builder::new()
            .name("voice-decode".into())
            .spawn(move || worker.run(worker_commands))
            .context("spawn decode worker")?;

        let coordinator = Self {
            commands,
            events,
            latest,
            generation: 0,
            ready: false,
            decoder_rate: None,
            output_rate,
            silence_rms,
            stats: CoordinatorStats::default(),
            worker: Some(handle),
        };
        coordinator.send_control(WorkerCommand::Init {
            generation: 0,
            output_rate,
        });
        Ok(coordinator)
    }

    /// Install the callback receiving decoded frames (runs on the worker thread).
    pub fn on_decoded<F>(&self, sink: F)
    where
        F: FnMut(DecodedFrame) + Send + 'static,
    {
        self.send_control(WorkerCommand::Sink(Box::new(sink)));
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Rate reported by the current decoder instance, once ready.
    pub fn decoder_rate(&self) -> Option<u32> {
        self.decoder_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Queue one compressed unit for decoding. Never blocks.
    pub fn submit(&mut self, unit: Vec<u8>) -> SubmitOutcome {
        self.stats.units_received += 1;
        if !self.ready {
            self.stats.dropped_not_ready += 1;
            return SubmitOutcome::DroppedNotReady;
        }
        let cmd = WorkerCommand::Decode {
            generation: self.generation,
            unit,
        };
        match self.commands.try_send(cmd) {
            Ok(()) => SubmitOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                self.stats.dropped_full += 1;
                SubmitOutcome::DroppedFull
            }
            Err(TrySendError::Disconnected(_)) => {
                self.stats.dropped_closed += 1;
                SubmitOutcome::DroppedClosed
            }
        }
    }

    /// Drain worker events, update readiness and counters.
    ///
    /// Returns the events that belong to the current generation.
    pub fn poll(&mut self) -> Vec<DecodeEvent> {
        let mut current = Vec::new();
        loop {
            let event = match self.events.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };
            if event.generation() != self.generation {
                continue;
            }
            match &event {
                DecodeEvent::Ready { sample_rate, .. } => {
                    self.ready = true;
                    self.decoder_rate = Some(*sample_rate);
                }
                DecodeEvent::Failed { .. } => {
                    self.ready = false;
                    self.decoder_rate = None;
                }
                DecodeEvent::Decoded { samples, level, .. } => {
                    let seconds = if self.output_rate == 0 {
                        0.0
                    } else {
                        *samples as f64 / f64::from(self.output_rate)
                    };
                    self.stats.frames_decoded += 1;
                    self.stats.decoded_seconds += seconds;
                    if *level >= self.silence_rms {
                        self.stats.non_silent_seconds += seconds;
                    }
                }
                DecodeEvent::DecodeError { .. } => {
                    self.stats.decode_errors += 1;
                }
            }
            current.push(event);
        }
        current
    }

    /// Tear down the decoder and build a fresh instance producing `output_rate` samples.
    ///
    /// Units are dropped until the new instance reports ready. Returns the new generation.
    pub fn reinitialize(&mut self, output_rate: u32) -> u64 {
        self.generation += 1;
        self.latest.store(self.generation, Ordering::Release);
        self.ready = false;
        self.decoder_rate = None;
        self.output_rate = output_rate;
        self.stats.reinitializations += 1;
        self.stats.frames_decoded = 0;
        self.stats.decoded_seconds = 0.0;
        self.stats.non_silent_seconds = 0.0;
        self.send_control(WorkerCommand::Init {
            generation: self.generation,
            output_rate,
        });
        self.generation
    }

    /// Clear connection-scoped counters (new connection).
    pub fn clear_stats(&mut self) {
        self.stats = CoordinatorStats::default();
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats.clone()
    }

    /// Caller-facing snapshot combining engine metrics with coordinator counters.
    pub fn audio_stats(&self, engine: &EngineStats, uplink_seconds: f64) -> AudioStats {
        status::assemble(
            engine,
            self.stats.units_received,
            self.stats.reinitializations,
            uplink_seconds,
        )
    }

    /// Stop the worker and wait for it to exit.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        self.ready = false;
        // Supersede anything still queued so the worker reaches Shutdown quickly.
        self.latest.store(u64::MAX, Ordering::Release);
        let _ = self.commands.send(WorkerCommand::Shutdown);
        if handle.join().is_err() {
            tracing::warn!("decode worker panicked");
        }
    }

    /// Control commands may wait for queue space; units never do.
    fn send_control(&self, cmd: WorkerCommand) {
        if self.commands.send(cmd).is_err() {
            tracing::warn!("decode worker is gone; control command dropped");
        }
    }
}

impl Drop for DecodeCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ActiveDecoder {
    generation: u64,
    decoder: Box<dyn Decoder>,
    resampler: Option<StreamResampler>,
}

struct Worker {
    factory: DecoderFactory,
    latest: Arc<AtomicU64>,
    events: Sender<DecodeEvent>,
    chunk_frames: usize,
    sink: Option<FrameSink>,
    active: Option<ActiveDecoder>,
}

impl Worker {
    fn run(mut self, commands: Receiver<WorkerCommand>) {
        while let Ok(cmd) = commands.recv() {
            match cmd {
                WorkerCommand::Sink(sink) => self.sink = Some(sink),
                WorkerCommand::Init {
                    generation,
                    output_rate,
                } => self.init(generation, output_rate),
                WorkerCommand::Decode { generation, unit } => self.decode(generation, &unit),
                WorkerCommand::Shutdown => break,
            }
        }
        tracing::debug!("decode worker exiting");
    }

    fn is_stale(&self, generation: u64) -> bool {
        generation < self.latest.load(Ordering::Acquire)
    }

    fn init(&mut self, generation: u64, output_rate: u32) {
        self.active = None;
        if self.is_stale(generation) {
            tracing::debug!(generation, "skipping superseded decoder init");
            return;
        }
        match build_decoder(&self.factory, output_rate, self.chunk_frames) {
            Ok((decoder, resampler)) => {
                let sample_rate = decoder.sample_rate();
                tracing::info!(
                    generation,
                    sample_rate,
                    output_rate,
                    resampling = resampler.is_some(),
                    "decoder ready"
                );
                self.active = Some(ActiveDecoder {
                    generation,
                    decoder,
                    resampler,
                });
                self.emit_lifecycle(
                    generation,
                    DecodeEvent::Ready {
                        generation,
                        sample_rate,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(generation, "decoder init failed: {e:#}");
                self.emit_lifecycle(
                    generation,
                    DecodeEvent::Failed {
                        generation,
                        error: format!("{e:#}"),
                    },
                );
            }
        }
    }

    fn decode(&mut self, generation: u64, unit: &[u8]) {
        if self.is_stale(generation) {
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.generation != generation {
            return;
        }

        let decoded = match active.decoder.decode(unit) {
            Ok(samples) => samples,
            Err(e) => {
                tracing::debug!(generation, len = unit.len(), "decode error: {e:#}");
                self.emit(DecodeEvent::DecodeError { generation });
                return;
            }
        };
        if decoded.is_empty() {
            return;
        }
        let level = rms(&decoded);

        let samples = match active.resampler.as_mut() {
            Some(resampler) => {
                let mut out = Vec::with_capacity(decoded.len() * 2);
                if let Err(e) = resampler.process(&decoded, &mut out) {
                    tracing::warn!(generation, "resample failed: {e:#}");
                    self.emit(DecodeEvent::DecodeError { generation });
                    return;
                }
                out
            }
            None => decoded,
        };

        if self.is_stale(generation) {
            return;
        }
        self.emit(DecodeEvent::Decoded {
            generation,
            samples: samples.len(),
            level,
        });
        if samples.is_empty() {
            return;
        }
        if let Some(sink) = self.sink.as_mut() {
            sink(DecodedFrame {
                generation,
                frame: Frame::new(samples),
            });
        }
    }

    /// Ready/Failed must not be lost, but give up once the generation is superseded.
    fn emit_lifecycle(&self, generation: u64, mut event: DecodeEvent) {
        loop {
            match self.events.send_timeout(event, LIFECYCLE_RETRY) {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(back)) if !self.is_stale(generation) => event = back,
                Err(_) => return,
            }
        }
    }

    fn emit(&self, event: DecodeEvent) {
        if let Err(TrySendError::Full(_)) = self.events.try_send(event) {
            tracing::warn!("decode event queue full; event dropped");
        }
    }
}

fn build_decoder(
    factory: &DecoderFactory,
    output_rate: u32,
    chunk_frames: usize,
) -> Result<(Box<dyn Decoder>, Option<StreamResampler>)> {
    let decoder = factory().context("create decoder")?;
    let src_rate = decoder.sample_rate();
    let resampler = if src_rate == output_rate {
        None
    } else {
        Some(StreamResampler::new(src_rate, output_rate, chunk_frames)?)
    };
    Ok((decoder, resampler))
}

/// Root-mean-square level of `samples` (0 for an empty slice).
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}
