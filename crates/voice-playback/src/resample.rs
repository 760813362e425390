//! Incremental mono resampler for decoded frames.
//!
//! Uses Rubato to convert decoder output from the codec rate to the output
//! device rate. Input arrives in arbitrarily sized frames; it is accumulated
//! and fed to the sinc resampler in fixed-size chunks. A fresh instance is
//! built for every decoder generation, so no state leaks across turns.

use anyhow::{Context, Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

/// Streaming single-channel resampler with internal input buffering.
pub struct StreamResampler {
    resampler: Box<dyn Resampler<f32> + Send>,
    chunk_frames: usize,
    pending: Vec<f32>,
    out_scratch: Vec<f32>,
}

impl StreamResampler {
    /// Build a resampler converting `src_rate` to `dst_rate`, consuming `chunk_frames` per step.
    pub fn new(src_rate: u32, dst_rate: u32, chunk_frames: usize) -> Result<Self> {
        if src_rate == 0 || dst_rate == 0 {
            return Err(anyhow!("invalid resample rates {src_rate} -> {dst_rate}"));
        }
        let chunk_frames = chunk_frames.max(1);
        let f_ratio = f64::from(dst_rate) / f64::from(src_rate);

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };

        let resampler = Async::<f32>::new_sinc(
            f_ratio,
            1.1,
            &params,
            chunk_frames,
            1,
            FixedAsync::Input,
        )
        .with_context(|| format!("create resampler {src_rate} -> {dst_rate}"))?;

        let out_capacity = (chunk_frames as f64 * f_ratio * 1.2).ceil() as usize + 32;

        Ok(Self {
            resampler: Box::new(resampler),
            chunk_frames,
            pending: Vec::with_capacity(chunk_frames * 2),
            out_scratch: vec![0.0; out_capacity],
        })
    }

    /// Samples buffered while waiting for a full input chunk.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed `input` and append every completed output sample to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<()> {
        self.pending.extend_from_slice(input);

        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len: None,
        };

        let mut consumed = 0;
        while self.pending.len() - consumed >= self.chunk_frames {
            let chunk = &self.pending[consumed..consumed + self.chunk_frames];
            let input_adapter = InterleavedSlice::new(chunk, 1, self.chunk_frames)
                .map_err(|e| anyhow!("interleaved slice (input) error: {e}"))?;

            let out_capacity = self.out_scratch.len();
            let mut output_adapter = InterleavedSlice::new_mut(&mut self.out_scratch, 1, out_capacity)
                .map_err(|e| anyhow!("interleaved slice (output) error: {e}"))?;

            let (_nbr_in, nbr_out) = self
                .resampler
                .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
                .context("resampler process")?;

            out.extend_from_slice(&self.out_scratch[..nbr_out]);
            consumed += self.chunk_frames;
        }
        self.pending.drain(..consumed);
        Ok(())
    }
}
