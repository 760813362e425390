//! Playback stage (CPAL output stream).
//!
//! Builds the CPAL output stream and moves a [`RenderNode`] into the real-time
//! callback. Each callback:
//! - renders one mono sample per output frame through the node
//! - duplicates the mono signal across every device channel
//! - converts `f32` samples to the device sample format

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;

use crate::render::RenderNode;

/// Initial size of the callback's mono scratch buffer, in frames.
const SCRATCH_FRAMES: usize = 8_192;

/// Build a CPAL output stream driven by `node`.
///
/// `node` must have been built for `config.sample_rate`. The callback never
/// blocks: commands are drained with `try_recv` and stats are offered with
/// `try_send`. The scratch buffer only grows if the device asks for more than
/// [`SCRATCH_FRAMES`] frames at once.
pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    node: RenderNode,
) -> Result<cpal::Stream> {
    if node.sample_rate() != config.sample_rate {
        return Err(anyhow!(
            "render node rate {} does not match stream rate {}",
            node.sample_rate(),
            config.sample_rate
        ));
    }
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, node),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, node),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, node),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, node),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

/// Type-specialized stream builder for CPAL sample formats.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut node: RenderNode,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = (config.channels as usize).max(1);
    let mut mono = vec![0.0f32; SCRATCH_FRAMES];

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let frames = data.len() / channels_out;
            if mono.len() < frames {
                mono.resize(frames, 0.0);
            }
            let mono = &mut mono[..frames];
            node.process(mono);
            write_interleaved(data, mono, channels_out);
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Copy each mono sample to every channel of the interleaved output frame.
///
/// Trailing samples that do not form a whole frame are silenced.
fn write_interleaved<T>(data: &mut [T], mono: &[f32], channels: usize)
where
    T: cpal::Sample + cpal::FromSample<f32>,
{
    let mut frames = data.chunks_exact_mut(channels);
    for (frame, &sample) in (&mut frames).zip(mono) {
        frame.fill(<T as cpal::Sample>::from_sample::<f32>(sample));
    }
    frames
        .into_remainder()
        .fill(<T as cpal::Sample>::from_sample::<f32>(0.0));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_is_duplicated_across_channels() {
        let mut data = [0.0f32; 6];
        write_interleaved(&mut data, &[0.1, 0.2, 0.3], 2);
        assert_eq!(data, [0.1, 0.1, 0.2, 0.2, 0.3, 0.3]);
    }

    #[test]
    fn partial_trailing_frame_is_silenced() {
        let mut data = [1.0f32; 5];
        write_interleaved(&mut data, &[0.5, 0.25], 2);
        assert_eq!(data, [0.5, 0.5, 0.25, 0.25, 0.0]);
    }

    #[test]
    fn converts_to_integer_formats() {
        let mut data = [0i16; 2];
        write_interleaved(&mut data, &[1.0, 0.0], 1);
        assert_eq!(data[0], i16::MAX);
        assert_eq!(data[1], 0);
    }
}
