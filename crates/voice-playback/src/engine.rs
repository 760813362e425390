//! Jitter-buffered playback engine.
//!
//! The engine owns the decoded frame queue and decides, once per render quantum,
//! whether to play queued audio, pad with silence, or (on enqueue) drop excess
//! backlog. It is single-threaded and allocation-free on the render path; the
//! [`crate::render::RenderNode`] wraps it for use inside an audio callback.
//!
//! Per quantum:
//! - not playable (not started, empty queue, or resume headroom still counting down): silence
//! - playable: copy queued samples, fading in after a (re)start
//! - queue exhausted mid-quantum: fade out, pad with silence, widen `partial`

use voice_playback_types::ThresholdSnapshot;

use crate::config::RenderConfig;
use crate::queue::{Frame, FrameQueue};
use crate::thresholds::BufferThresholds;

/// Per-turn playback state and metrics. Counts are in samples.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlaybackState {
    pub started: bool,
    /// Fade-in pending for the next audible quantum.
    pub resuming: bool,
    /// Countdown gating audible output after a start.
    pub remaining_partial_samples: i64,
    /// Stream position: samples played or dropped.
    pub time_in_stream_samples: u64,
    /// Output rendered since any real audio was first played.
    pub total_output_samples: u64,
    /// Real audio rendered.
    pub actual_audio_samples: u64,
    pub min_backlog_samples: Option<usize>,
    pub max_backlog_samples: Option<usize>,
    pub underruns: u64,
    pub drop_passes: u64,
    pub dropped_samples: u64,
}

/// What a call to [`PlaybackEngine::enqueue`] did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// Playback started on this call.
    pub started: bool,
    /// Samples removed by a drop pass.
    pub dropped: usize,
    /// Samples evicted because the queue was at frame capacity.
    pub evicted: usize,
}

/// What a call to [`PlaybackEngine::render_quantum`] produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderOutcome {
    Silence,
    Played { copied: usize },
    Underrun { copied: usize },
}

/// Snapshot published from the render context.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EngineStats {
    /// Turn generation the engine was on when the snapshot was taken.
    pub generation: u64,
    pub sample_rate: u32,
    pub started: bool,
    pub backlog_samples: usize,
    pub total_output_samples: u64,
    pub actual_audio_samples: u64,
    pub time_in_stream_samples: u64,
    pub min_backlog_samples: Option<usize>,
    pub max_backlog_samples: Option<usize>,
    pub underruns: u64,
    pub drop_passes: u64,
    pub dropped_samples: u64,
    pub thresholds: ThresholdSnapshot,
}

impl EngineStats {
    fn seconds(&self, samples: u64) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        samples as f64 / f64::from(self.sample_rate)
    }

    pub fn total_output_seconds(&self) -> f64 {
        self.seconds(self.total_output_samples)
    }

    pub fn actual_audio_seconds(&self) -> f64 {
        self.seconds(self.actual_audio_samples)
    }

    pub fn time_in_stream_seconds(&self) -> f64 {
        self.seconds(self.time_in_stream_samples)
    }

    pub fn backlog_seconds(&self) -> f64 {
        self.seconds(self.backlog_samples as u64)
    }

    pub fn min_backlog_seconds(&self) -> Option<f64> {
        self.min_backlog_samples.map(|s| self.seconds(s as u64))
    }

    pub fn max_backlog_seconds(&self) -> Option<f64> {
        self.max_backlog_samples.map(|s| self.seconds(s as u64))
    }
}

/// Adaptive jitter buffer producing fixed-size output quanta.
#[derive(Debug)]
pub struct PlaybackEngine {
    queue: FrameQueue,
    thresholds: BufferThresholds,
    state: PlaybackState,
    fade_samples: usize,
    /// Set once the current turn has received audio; gates threshold decay.
    dirty: bool,
}

impl PlaybackEngine {
    /// Create an engine around an injected threshold set.
    ///
    /// The thresholds are owned by the engine from here on; their growth is
    /// sticky across [`reset`](Self::reset) and discarded only by
    /// [`reinitialize`](Self::reinitialize).
    pub fn new(thresholds: BufferThresholds, render: &RenderConfig) -> Self {
        Self {
            queue: FrameQueue::with_capacity(render.queue_frames),
            thresholds,
            state: PlaybackState::default(),
            fade_samples: render.fade_samples,
            dirty: false,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.thresholds.rate_hz()
    }

    pub fn thresholds(&self) -> &BufferThresholds {
        &self.thresholds
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn queue(&self) -> &FrameQueue {
        &self.queue
    }

    pub fn backlog(&self) -> usize {
        self.queue.backlog()
    }

    pub fn can_play(&self) -> bool {
        self.state.started && !self.queue.is_empty() && self.state.remaining_partial_samples <= 0
    }

    /// Queue a decoded frame, starting playback or dropping backlog as needed.
    pub fn enqueue(&mut self, frame: Frame) -> EnqueueOutcome {
        let mut outcome = EnqueueOutcome::default();
        if frame.is_empty() {
            return outcome;
        }
        self.dirty = true;

        if self.queue.is_full() {
            let evicted = self.queue.evict_head();
            self.account_discarded(evicted);
            outcome.evicted = evicted;
        }
        if let Err(rejected) = self.queue.push(frame) {
            self.account_discarded(rejected.len());
            outcome.evicted += rejected.len();
            return outcome;
        }

        let backlog = self.queue.backlog();
        if !self.state.started && backlog >= self.thresholds.initial() {
            self.start();
            outcome.started = true;
        }
        if backlog >= self.thresholds.drop_threshold() {
            outcome.dropped = self.drop_backlog();
        }
        outcome
    }

    /// Fill `out` with the next quantum of audio.
    pub fn render_quantum(&mut self, out: &mut [f32]) -> RenderOutcome {
        let n = out.len();
        let backlog = self.queue.backlog();

        if !self.can_play() {
            out.fill(0.0);
            if self.state.actual_audio_samples > 0 {
                self.state.total_output_samples += n as u64;
            }
            self.state.remaining_partial_samples =
                self.state.remaining_partial_samples.saturating_sub(n as i64);
            return RenderOutcome::Silence;
        }

        let copied = self.queue.copy_into(out);

        if self.state.resuming {
            fade_in(&mut out[..copied], self.fade_samples);
            self.state.resuming = false;
        }

        let outcome = if copied < n {
            fade_out(&mut out[..copied], self.fade_samples);
            out[copied..].fill(0.0);
            self.thresholds.grow_partial();
            self.state.underruns += 1;
            self.state.resuming = true;
            RenderOutcome::Underrun { copied }
        } else {
            RenderOutcome::Played { copied }
        };

        self.state.total_output_samples += n as u64;
        self.state.actual_audio_samples += copied as u64;
        self.state.time_in_stream_samples += copied as u64;

        self.state.min_backlog_samples = Some(
            self.state
                .min_backlog_samples
                .map_or(backlog, |min| min.min(backlog)),
        );
        self.state.max_backlog_samples = Some(
            self.state
                .max_backlog_samples
                .map_or(backlog, |max| max.max(backlog)),
        );

        outcome
    }

    /// Start a new turn: clear the queue and per-turn metrics, keep threshold growth.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.state = PlaybackState::default();
        self.thresholds.enforce_floors(self.dirty);
        self.dirty = false;
    }

    /// Reset and return thresholds to their floors (new connection).
    pub fn reinitialize(&mut self) {
        self.reset();
        self.thresholds.restore_floors();
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            generation: 0,
            sample_rate: self.thresholds.rate_hz(),
            started: self.state.started,
            backlog_samples: self.queue.backlog(),
            total_output_samples: self.state.total_output_samples,
            actual_audio_samples: self.state.actual_audio_samples,
            time_in_stream_samples: self.state.time_in_stream_samples,
            min_backlog_samples: self.state.min_backlog_samples,
            max_backlog_samples: self.state.max_backlog_samples,
            underruns: self.state.underruns,
            drop_passes: self.state.drop_passes,
            dropped_samples: self.state.dropped_samples,
            thresholds: self.thresholds.snapshot(),
        }
    }

    fn start(&mut self) {
        self.state.started = true;
        self.state.remaining_partial_samples = self.thresholds.partial() as i64;
        self.state.resuming = true;
    }

    fn drop_backlog(&mut self) -> usize {
        let excess = self
            .queue
            .backlog()
            .saturating_sub(self.thresholds.drop_target());
        let dropped = self.queue.discard(excess);
        self.account_discarded(dropped);
        self.state.drop_passes += 1;
        self.thresholds.grow_max_headroom();
        dropped
    }

    /// Discarded audio still advances the stream clock.
    fn account_discarded(&mut self, samples: usize) {
        self.state.time_in_stream_samples += samples as u64;
        self.state.dropped_samples += samples as u64;
    }
}

/// Ramp the first `nominal` samples (clamped to the slice) from 0 up to 1.
fn fade_in(samples: &mut [f32], nominal: usize) {
    let len = nominal.min(samples.len());
    if len == 0 {
        return;
    }
    for (i, s) in samples[..len].iter_mut().enumerate() {
        *s *= i as f32 / len as f32;
    }
}

/// Ramp the last `nominal` samples (clamped to the slice) from 1 down towards 0.
fn fade_out(samples: &mut [f32], nominal: usize) {
    let len = nominal.min(samples.len());
    if len == 0 {
        return;
    }
    let start = samples.len() - len;
    for (i, s) in samples[start..].iter_mut().enumerate() {
        *s *= (len - i) as f32 / len as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thresholds::Growth;

    const QUANTUM: usize = 32;

    fn engine() -> PlaybackEngine {
        let thresholds = BufferThresholds::from_samples(
            1_000,
            100,
            Growth::new(50, 20, 90),
            Growth::new(200, 100, 450),
        );
        let render = RenderConfig {
            quantum_samples: QUANTUM,
            fade_samples: 4,
            queue_frames: 64,
            ..RenderConfig::default()
        };
        PlaybackEngine::new(thresholds, &render)
    }

    fn ones(len: usize) -> Frame {
        Frame::new(vec![1.0; len])
    }

    fn render(engine: &mut PlaybackEngine) -> ([f32; QUANTUM], RenderOutcome) {
        let mut out = [7.0f32; QUANTUM];
        let outcome = engine.render_quantum(&mut out);
        assert!(engine.state().actual_audio_samples <= engine.state().total_output_samples);
        (out, outcome)
    }

    /// Start playback and burn through the resume countdown.
    fn started_and_primed(engine: &mut PlaybackEngine) {
        engine.enqueue(ones(100));
        while engine.state().remaining_partial_samples > 0 {
            render(engine);
        }
    }

    #[test]
    fn starts_exactly_when_backlog_reaches_initial() {
        let mut e = engine();
        let first = e.enqueue(ones(60));
        assert!(!first.started);
        assert!(!e.state().started);

        let second = e.enqueue(ones(40));
        assert!(second.started);
        assert!(e.state().started);
        assert!(e.state().resuming);
        assert_eq!(e.state().remaining_partial_samples, 50);
    }

    #[test]
    fn empty_frames_are_ignored() {
        let mut e = engine();
        let outcome = e.enqueue(Frame::new(Vec::new()));
        assert_eq!(outcome, EnqueueOutcome::default());
        assert_eq!(e.backlog(), 0);
    }

    #[test]
    fn resume_countdown_outputs_silence_and_decrements() {
        let mut e = engine();
        e.enqueue(ones(100));
        let (out, outcome) = render(&mut e);
        assert_eq!(outcome, RenderOutcome::Silence);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(e.state().remaining_partial_samples, 50 - QUANTUM as i64);
        assert_eq!(e.backlog(), 100);
        assert_eq!(e.state().total_output_samples, 0);
    }

    #[test]
    fn countdown_continues_with_empty_queue() {
        let mut e = engine();
        e.enqueue(ones(100));
        e.queue.clear();
        let before = e.state().remaining_partial_samples;
        let (out, outcome) = render(&mut e);
        assert_eq!(outcome, RenderOutcome::Silence);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(e.state().remaining_partial_samples, before - QUANTUM as i64);
    }

    #[test]
    fn first_audible_quantum_fades_in_monotonically() {
        let mut e = engine();
        started_and_primed(&mut e);
        let (out, outcome) = render(&mut e);
        assert_eq!(outcome, RenderOutcome::Played { copied: QUANTUM });
        assert_eq!(out[0], 0.0);
        for pair in out[..5].windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert_eq!(out[4], 1.0);
        assert!(!e.state().resuming);

        let (out, _) = render(&mut e);
        assert!(out.iter().all(|s| *s == 1.0));
    }

    #[test]
    fn underrun_fades_out_pads_and_widens_partial() {
        let mut e = engine();
        started_and_primed(&mut e);
        render(&mut e);
        render(&mut e);
        render(&mut e);
        assert_eq!(e.backlog(), 4);

        let (out, outcome) = render(&mut e);
        assert_eq!(outcome, RenderOutcome::Underrun { copied: 4 });
        assert_eq!(&out[..4], &[1.0, 0.75, 0.5, 0.25]);
        assert!(out[4..].iter().all(|s| *s == 0.0));
        assert_eq!(e.thresholds().partial(), 70);
        assert_eq!(e.state().underruns, 1);
        assert!(e.state().resuming);
        assert_eq!(e.state().actual_audio_samples, 100);
        assert_eq!(e.state().total_output_samples, 4 * QUANTUM as u64);
    }

    #[test]
    fn empty_queue_after_start_yields_silence_without_progress() {
        let mut e = engine();
        started_and_primed(&mut e);
        while e.backlog() > 0 {
            render(&mut e);
        }
        let actual = e.state().actual_audio_samples;
        let total = e.state().total_output_samples;
        for _ in 0..3 {
            let (out, outcome) = render(&mut e);
            assert_eq!(outcome, RenderOutcome::Silence);
            assert!(out.iter().all(|s| *s == 0.0));
        }
        assert_eq!(e.state().actual_audio_samples, actual);
        assert_eq!(e.state().total_output_samples, total + 3 * QUANTUM as u64);
    }

    #[test]
    fn resumed_audio_fades_in_after_underrun() {
        let mut e = engine();
        started_and_primed(&mut e);
        while e.backlog() > 0 {
            render(&mut e);
        }
        e.enqueue(ones(64));
        let (out, outcome) = render(&mut e);
        assert_eq!(outcome, RenderOutcome::Played { copied: QUANTUM });
        assert_eq!(out[0], 0.0);
        assert_eq!(out[4], 1.0);
    }

    #[test]
    fn one_sample_over_drop_threshold_runs_single_drop_pass() {
        let mut e = engine();
        e.enqueue(ones(300));
        assert_eq!(e.state().drop_passes, 0);

        let outcome = e.enqueue(ones(51));
        assert_eq!(outcome.dropped, 201);
        assert_eq!(e.backlog(), 150);
        assert_eq!(e.state().drop_passes, 1);
        assert_eq!(e.thresholds().max_headroom(), 300);
        assert_eq!(e.state().time_in_stream_samples, 201);
        assert_eq!(e.state().actual_audio_samples, 0);
    }

    #[test]
    fn drop_pass_lands_exactly_on_target_from_mid_frame() {
        let mut e = engine();
        e.enqueue(ones(90));
        e.enqueue(ones(410));
        assert_eq!(e.backlog(), 150);
        assert_eq!(e.queue().len_frames(), 1);
        assert_eq!(e.queue().offset(), 260);
        assert_eq!(e.state().dropped_samples, 350);
    }

    #[test]
    fn drop_threshold_growth_is_capped() {
        let mut e = engine();
        for _ in 0..10 {
            let threshold = e.thresholds().drop_threshold();
            e.enqueue(ones(threshold));
        }
        assert_eq!(e.thresholds().max_headroom(), 450);
    }

    #[test]
    fn full_queue_evicts_oldest_frame() {
        let thresholds = BufferThresholds::from_samples(
            1_000,
            1_000,
            Growth::new(0, 0, 0),
            Growth::new(10_000, 0, 10_000),
        );
        let render = RenderConfig {
            queue_frames: 2,
            ..RenderConfig::default()
        };
        let mut e = PlaybackEngine::new(thresholds, &render);
        e.enqueue(ones(10));
        e.enqueue(ones(10));
        let outcome = e.enqueue(ones(10));
        assert_eq!(outcome.evicted, 10);
        assert_eq!(e.backlog(), 20);
        assert_eq!(e.state().time_in_stream_samples, 10);
    }

    #[test]
    fn reset_clears_turn_state_but_keeps_growth() {
        let mut e = engine();
        started_and_primed(&mut e);
        while e.backlog() > 0 {
            render(&mut e);
        }
        assert_eq!(e.thresholds().partial(), 70);

        e.reset();
        assert_eq!(*e.state(), PlaybackState::default());
        assert_eq!(e.backlog(), 0);
        assert_eq!(e.thresholds().partial(), 70);
        assert_eq!(e.stats().actual_audio_samples, 0);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut e = engine();
        started_and_primed(&mut e);
        e.enqueue(ones(400));
        render(&mut e);

        e.reset();
        let state = e.state().clone();
        let thresholds = e.thresholds().clone();
        e.reset();
        assert_eq!(*e.state(), state);
        assert_eq!(*e.thresholds(), thresholds);
        assert!(e.queue().is_empty());
    }

    #[test]
    fn reinitialize_returns_thresholds_to_floors() {
        let mut e = engine();
        e.enqueue(ones(400));
        assert_eq!(e.thresholds().max_headroom(), 300);
        e.reinitialize();
        assert_eq!(e.thresholds().max_headroom(), 200);
        assert_eq!(e.thresholds().partial(), 50);
    }

    #[test]
    fn backlog_extremes_tracked_only_while_playable() {
        let mut e = engine();
        e.enqueue(ones(100));
        render(&mut e);
        assert!(e.state().min_backlog_samples.is_none());

        started_and_primed(&mut e);
        render(&mut e);
        render(&mut e);
        let stats = e.stats();
        assert_eq!(stats.max_backlog_samples, Some(200));
        assert_eq!(stats.min_backlog_samples, Some(200 - QUANTUM));
    }

    #[test]
    fn stats_convert_samples_to_seconds() {
        let mut e = engine();
        started_and_primed(&mut e);
        render(&mut e);
        let stats = e.stats();
        assert_eq!(stats.sample_rate, 1_000);
        assert!((stats.actual_audio_seconds() - 0.032).abs() < 1e-9);
        assert!(stats.actual_audio_seconds() <= stats.total_output_seconds());
    }

    #[test]
    fn fades_clamp_to_available_samples() {
        let mut short = [1.0f32; 2];
        fade_in(&mut short, 128);
        assert_eq!(short, [0.0, 0.5]);

        let mut short = [1.0f32; 2];
        fade_out(&mut short, 128);
        assert_eq!(short, [1.0, 0.5]);

        let mut empty: [f32; 0] = [];
        fade_in(&mut empty, 4);
        fade_out(&mut empty, 4);
    }
}
