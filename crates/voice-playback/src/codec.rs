//! Decoders turning compressed units into mono `f32` PCM.
//!
//! The decode worker only sees the [`Decoder`] trait. A fresh instance is
//! produced by a [`DecoderFactory`] for every generation, since tearing the
//! decoder down is the only way to clear its internal state.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, DecoderOptions};
use symphonia::core::formats::Packet;

/// Opaque mapping from one compressed unit to decoded mono samples.
pub trait Decoder: Send {
    /// Rate of the samples returned by [`decode`](Self::decode).
    fn sample_rate(&self) -> u32;

    /// Decode one unit. An empty result is valid (e.g. header-only units).
    fn decode(&mut self, unit: &[u8]) -> Result<Vec<f32>>;
}

/// Builds a fresh decoder instance.
pub type DecoderFactory = Arc<dyn Fn() -> Result<Box<dyn Decoder>> + Send + Sync>;

/// Symphonia codec decoder fed with raw codec packets.
pub struct SymphoniaDecoder {
    inner: Box<dyn symphonia::core::codecs::Decoder>,
    sample_rate: u32,
    ts: u64,
}

impl SymphoniaDecoder {
    pub fn new(params: &CodecParameters) -> Result<Self> {
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| anyhow!("Unknown sample rate"))?;
        let inner = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .with_context(|| format!("create decoder for codec {:?}", params.codec))?;
        Ok(Self {
            inner,
            sample_rate,
            ts: 0,
        })
    }

    /// Factory producing a new decoder for `params` on every call.
    pub fn factory(params: CodecParameters) -> DecoderFactory {
        Arc::new(move || Ok(Box::new(SymphoniaDecoder::new(&params)?) as Box<dyn Decoder>))
    }
}

impl Decoder for SymphoniaDecoder {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn decode(&mut self, unit: &[u8]) -> Result<Vec<f32>> {
        let packet = Packet::new_from_slice(0, self.ts, 0, unit);
        let decoded = self.inner.decode(&packet).context("decode packet")?;
        let frames = decoded.frames();
        if frames == 0 {
            return Ok(Vec::new());
        }
        let spec = *decoded.spec();
        let mut sample_buf = SampleBuffer::<f32>::new(frames as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);
        self.ts += frames as u64;
        Ok(downmix_to_mono(sample_buf.samples(), spec.channels.count()))
    }
}

/// Raw signed 16-bit little-endian mono PCM.
#[derive(Clone, Debug)]
pub struct PcmDecoder {
    sample_rate: u32,
}

impl PcmDecoder {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    pub fn factory(sample_rate: u32) -> DecoderFactory {
        Arc::new(move || Ok(Box::new(PcmDecoder::new(sample_rate)) as Box<dyn Decoder>))
    }
}

impl Decoder for PcmDecoder {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn decode(&mut self, unit: &[u8]) -> Result<Vec<f32>> {
        if unit.len() % 2 != 0 {
            return Err(anyhow!("odd pcm unit length {}", unit.len()));
        }
        Ok(unit
            .chunks_exact(2)
            .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32_768.0)
            .collect())
    }
}

/// Encode mono samples as s16le, the inverse of [`PcmDecoder`].
pub fn encode_pcm_s16le(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|s| {
            let v = (s.clamp(-1.0, 1.0) * 32_767.0).round() as i16;
            v.to_le_bytes()
        })
        .collect()
}

/// Average interleaved channels into one.
pub fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let scale = 1.0 / channels as f32;
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() * scale)
        .collect()
}

/// Best-effort codec label for logs.
pub fn codec_label(params: &CodecParameters) -> Option<&'static str> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use symphonia::core::codecs::*;

    #[test]
    fn pcm_decoder_maps_full_scale() {
        let mut d = PcmDecoder::new(16_000);
        let unit = [0x00, 0x80, 0x00, 0x00, 0x00, 0x40];
        let out = d.decode(&unit).unwrap();
        assert_eq!(out, vec![-1.0, 0.0, 0.5]);
        assert_eq!(d.sample_rate(), 16_000);
    }

    #[test]
    fn pcm_decoder_rejects_odd_length() {
        let mut d = PcmDecoder::new(16_000);
        assert!(d.decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn pcm_encode_then_decode_is_close() {
        let samples = [0.25f32, -0.5, 0.0];
        let mut d = PcmDecoder::new(8_000);
        let out = d.decode(&encode_pcm_s16le(&samples)).unwrap();
        for (a, b) in samples.iter().zip(&out) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn factory_builds_independent_instances() {
        let factory = PcmDecoder::factory(24_000);
        let a = factory().unwrap();
        let b = factory().unwrap();
        assert_eq!(a.sample_rate(), 24_000);
        assert_eq!(b.sample_rate(), 24_000);
    }

    #[test]
    fn downmix_averages_channels() {
        assert_eq!(downmix_to_mono(&[1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
        assert_eq!(downmix_to_mono(&[0.3, 0.4], 1), vec![0.3, 0.4]);
    }

    #[test]
    fn symphonia_decoder_requires_sample_rate() {
        let mut params = CodecParameters::new();
        params.codec = CODEC_TYPE_FLAC;
        assert!(SymphoniaDecoder::new(&params).is_err());
    }

    #[test]
    fn symphonia_decoder_rejects_unknown_codec() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(48_000);
        assert!(SymphoniaDecoder::new(&params).is_err());
    }

    #[test]
    fn codec_label_maps_known_codecs() {
        let mut params = CodecParameters::new();
        params.codec = CODEC_TYPE_FLAC;
        assert_eq!(codec_label(&params), Some("FLAC"));
        params.codec = CODEC_TYPE_PCM_S16LE;
        assert_eq!(codec_label(&params), Some("PCM_S16"));
        assert!(codec_label(&CodecParameters::new()).is_none());
    }
}
