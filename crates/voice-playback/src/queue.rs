//! Decoded frame queue owned by the playback engine.
//!
//! Frames are kept whole; a cursor into the head frame tracks how much of it
//! has already been consumed. The queue is pre-sized and bounded by frame
//! count, and keeps a running sample total so backlog queries never scan.

use std::collections::VecDeque;

/// Immutable block of decoded mono PCM samples.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    samples: Box<[f32]>,
}

impl Frame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples: samples.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }
}

impl From<Vec<f32>> for Frame {
    fn from(samples: Vec<f32>) -> Self {
        Self::new(samples)
    }
}

/// Bounded FIFO of frames plus a cursor into the head frame.
///
/// Invariant: `offset < frames[0].len()` whenever the queue is non-empty, and
/// `offset == 0` when it is empty.
#[derive(Debug)]
pub struct FrameQueue {
    frames: VecDeque<Frame>,
    offset: usize,
    queued_samples: usize,
    capacity: usize,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames (minimum one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            offset: 0,
            queued_samples: 0,
            capacity,
        }
    }

    pub fn len_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.capacity
    }

    /// Samples of the head frame already consumed.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Buffered-but-unplayed samples.
    pub fn backlog(&self) -> usize {
        self.queued_samples - self.offset
    }

    /// Append a frame. Empty frames are accepted and ignored.
    ///
    /// Returns the frame back when the queue is full.
    pub fn push(&mut self, frame: Frame) -> Result<(), Frame> {
        if frame.is_empty() {
            return Ok(());
        }
        if self.is_full() {
            return Err(frame);
        }
        self.queued_samples += frame.len();
        self.frames.push_back(frame);
        Ok(())
    }

    /// Copy queued samples into `out`, consuming them. Returns the count copied.
    pub fn copy_into(&mut self, out: &mut [f32]) -> usize {
        let mut written = 0;
        while written < out.len() {
            let Some(head) = self.frames.front() else {
                break;
            };
            let take = (head.len() - self.offset).min(out.len() - written);
            out[written..written + take]
                .copy_from_slice(&head.samples()[self.offset..self.offset + take]);
            written += take;
            self.advance(take);
        }
        written
    }

    /// Discard up to `count` samples from the head. Returns the count discarded.
    pub fn discard(&mut self, count: usize) -> usize {
        let mut discarded = 0;
        while discarded < count {
            let Some(head) = self.frames.front() else {
                break;
            };
            let take = (head.len() - self.offset).min(count - discarded);
            discarded += take;
            self.advance(take);
        }
        discarded
    }

    /// Drop the unplayed remainder of the head frame. Returns the samples dropped.
    pub fn evict_head(&mut self) -> usize {
        match self.frames.front() {
            Some(head) => {
                let remaining = head.len() - self.offset;
                self.advance(remaining);
                remaining
            }
            None => 0,
        }
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.offset = 0;
        self.queued_samples = 0;
    }

    fn advance(&mut self, count: usize) {
        let Some(head_len) = self.frames.front().map(Frame::len) else {
            return;
        };
        self.offset += count;
        if self.offset >= head_len {
            self.queued_samples -= head_len;
            self.offset = 0;
            self.frames.pop_front();
        }
    }
}
