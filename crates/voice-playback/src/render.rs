//! Render-context side of the playback path.
//!
//! [`RenderNode`] owns the [`PlaybackEngine`] and is moved into the audio
//! callback. Decoded frames arrive on a bounded channel; turn resets are
//! published through a shared [`TurnControl`] so they can never be lost to a
//! full frame channel. [`EngineStats`] go back on another bounded channel. The
//! node only ever uses atomics and `try_recv`/`try_send`, so the callback never
//! blocks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::decode::DecodedFrame;
use crate::engine::{EngineStats, PlaybackEngine};

/// Latest turn requested by the control context.
///
/// `generation` is the newest turn; `reinitialized` is the newest turn that
/// also returns thresholds to their floors. Both only move forward, so a burst
/// of requests between two callbacks collapses into one.
#[derive(Debug, Default)]
pub struct TurnControl {
    generation: AtomicU64,
    reinitialized: AtomicU64,
}

impl TurnControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start turn `generation`; frames from older generations are discarded from now on.
    pub fn reset(&self, generation: u64) {
        self.generation.fetch_max(generation, Ordering::AcqRel);
    }

    /// New connection: reset and return thresholds to their floors.
    pub fn reinitialize(&self, generation: u64) {
        // Published before the generation so the node never sees a bare reset for it.
        self.reinitialized.fetch_max(generation, Ordering::AcqRel);
        self.generation.fetch_max(generation, Ordering::AcqRel);
    }

    /// Newest requested generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn reinitialized(&self) -> u64 {
        self.reinitialized.load(Ordering::Acquire)
    }
}

/// Drives a [`PlaybackEngine`] from inside the audio callback.
pub struct RenderNode {
    engine: PlaybackEngine,
    control: Arc<TurnControl>,
    frames: Receiver<DecodedFrame>,
    stats_tx: Sender<EngineStats>,
    generation: u64,
    quantum: usize,
    max_frames: usize,
}

impl RenderNode {
    /// `max_frames` bounds how many queued frames one callback may take.
    pub fn new(
        engine: PlaybackEngine,
        control: Arc<TurnControl>,
        frames: Receiver<DecodedFrame>,
        stats_tx: Sender<EngineStats>,
        quantum: usize,
        max_frames: usize,
    ) -> Self {
        Self {
            engine,
            control,
            frames,
            stats_tx,
            generation: 0,
            quantum: quantum.max(1),
            max_frames: max_frames.max(1),
        }
    }

    pub fn engine(&self) -> &PlaybackEngine {
        &self.engine
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn sample_rate(&self) -> u32 {
        self.engine.sample_rate()
    }

    /// Render `out.len()` mono samples.
    ///
    /// Pending resets and frames are applied first, then the buffer is produced
    /// as successive render quanta (the last one may be shorter), then a stats
    /// snapshot is offered to the control side.
    pub fn process(&mut self, out: &mut [f32]) {
        self.apply_pending();
        for quantum in out.chunks_mut(self.quantum) {
            self.engine.render_quantum(quantum);
        }
        self.publish_stats();
    }

    /// Apply a pending reset and queued frames without rendering.
    ///
    /// Returns `false` once every frame sender is gone.
    pub fn apply_pending(&mut self) -> bool {
        self.apply_control();
        for _ in 0..self.max_frames {
            match self.frames.try_recv() {
                Ok(decoded) => self.accept(decoded),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
        true
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            generation: self.generation,
            ..self.engine.stats()
        }
    }

    fn apply_control(&mut self) {
        let generation = self.control.generation();
        if generation <= self.generation {
            return;
        }
        if self.control.reinitialized() > self.generation {
            self.engine.reinitialize();
        } else {
            self.engine.reset();
        }
        self.generation = generation;
    }

    fn accept(&mut self, decoded: DecodedFrame) {
        if decoded.generation < self.generation {
            return;
        }
        if decoded.generation > self.generation {
            self.apply_control();
        }
        if decoded.generation > self.generation {
            // Control has not caught up with the decoder yet.
            self.generation = decoded.generation;
            self.engine.reset();
        }
        self.engine.enqueue(decoded.frame);
    }

    fn publish_stats(&self) {
        // A full channel means the control side is behind; it will catch up on the next snapshot.
        let _ = self.stats_tx.try_send(self.stats());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderConfig;
    use crate::queue::Frame;
    use crate::thresholds::{BufferThresholds, Growth};

    struct Harness {
        node: RenderNode,
        control: Arc<TurnControl>,
        frames: Sender<DecodedFrame>,
        stats: Receiver<EngineStats>,
    }

    fn harness() -> Harness {
        let thresholds = BufferThresholds::from_samples(
            1_000,
            64,
            Growth::new(0, 16, 64),
            Growth::new(1_000, 0, 1_000),
        );
        let engine = PlaybackEngine::new(thresholds, &RenderConfig::default());
        let control = Arc::new(TurnControl::new());
        let (frame_tx, frame_rx) = crossbeam_channel::bounded(16);
        let (stats_tx, stats_rx) = crossbeam_channel::bounded(1);
        Harness {
            node: RenderNode::new(engine, control.clone(), frame_rx, stats_tx, 32, 8),
            control,
            frames: frame_tx,
            stats: stats_rx,
        }
    }

    fn frame(generation: u64, len: usize) -> DecodedFrame {
        DecodedFrame {
            generation,
            frame: Frame::new(vec![0.5; len]),
        }
    }

    #[test]
    fn process_renders_whole_buffer_in_quanta() {
        let mut h = harness();
        h.frames.send(frame(0, 100)).unwrap();

        let mut out = vec![1.0f32; 80];
        h.node.process(&mut out);

        let stats = h.stats.try_recv().unwrap();
        assert!(stats.started);
        assert_eq!(stats.actual_audio_samples, 80);
        assert_eq!(stats.backlog_samples, 20);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[79], 0.5);
    }

    #[test]
    fn stale_frames_are_discarded_after_reset() {
        let mut h = harness();
        h.frames.send(frame(0, 40)).unwrap();
        h.node.apply_pending();
        h.control.reset(1);
        h.frames.send(frame(0, 40)).unwrap();
        h.frames.send(frame(1, 10)).unwrap();

        assert!(h.node.apply_pending());
        assert_eq!(h.node.generation(), 1);
        assert_eq!(h.node.engine().backlog(), 10);
    }

    #[test]
    fn reset_applies_without_any_frame() {
        let mut h = harness();
        h.frames.send(frame(0, 400)).unwrap();
        let mut out = vec![0.0f32; 64];
        h.node.process(&mut out);
        assert!(h.node.engine().backlog() > 0);

        h.control.reset(1);
        h.node.process(&mut out);
        assert_eq!(h.node.generation(), 1);
        assert_eq!(h.node.engine().backlog(), 0);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn repeated_resets_collapse() {
        let mut h = harness();
        h.frames.send(frame(0, 40)).unwrap();
        h.node.apply_pending();
        h.control.reset(2);
        h.control.reset(1);
        h.node.apply_pending();
        assert_eq!(h.node.generation(), 2);
        assert_eq!(h.control.generation(), 2);
        assert_eq!(h.node.engine().backlog(), 0);
    }

    #[test]
    fn reinitialize_restores_floors_even_when_followed_by_reset() {
        let mut h = harness();
        // Underruns grow the partial threshold past its floor.
        h.frames.send(frame(0, 100)).unwrap();
        let mut out = vec![0.0f32; 256];
        h.node.process(&mut out);
        h.frames.send(frame(0, 100)).unwrap();
        h.node.process(&mut out);
        let floor = BufferThresholds::from_samples(
            1_000,
            64,
            Growth::new(0, 16, 64),
            Growth::new(1_000, 0, 1_000),
        )
        .snapshot();
        assert!(h.node.stats().thresholds.partial_ms > floor.partial_ms);

        h.control.reinitialize(1);
        h.control.reset(2);
        h.node.apply_pending();
        assert_eq!(h.node.generation(), 2);
        assert_eq!(h.node.stats().thresholds, floor);
    }

    #[test]
    fn newer_frame_implies_reset() {
        let mut h = harness();
        h.frames.send(frame(0, 40)).unwrap();
        h.frames.send(frame(3, 10)).unwrap();
        h.node.apply_pending();
        assert_eq!(h.node.generation(), 3);
        assert_eq!(h.node.engine().backlog(), 10);

        h.control.reset(3);
        h.node.apply_pending();
        assert_eq!(h.node.engine().backlog(), 10);
    }

    #[test]
    fn frame_budget_limits_work_per_callback() {
        let mut h = harness();
        for _ in 0..10 {
            h.frames.send(frame(0, 1)).unwrap();
        }
        h.node.apply_pending();
        assert_eq!(h.node.engine().backlog(), 8);
        h.node.apply_pending();
        assert_eq!(h.node.engine().backlog(), 10);
    }

    #[test]
    fn reports_disconnect_when_senders_dropped() {
        let mut h = harness();
        drop(h.frames);
        assert!(!h.node.apply_pending());
    }

    #[test]
    fn full_stats_channel_never_blocks() {
        let mut h = harness();
        let mut out = vec![0.0f32; 32];
        h.node.process(&mut out);
        h.node.process(&mut out);
        assert_eq!(h.stats.len(), 1);
    }
}
