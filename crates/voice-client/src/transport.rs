//! Simulated server transport.
//!
//! Reads encoded packets from local files and releases them in real time, the
//! way a voice server pushes a continuous stream over a socket. Each file is one
//! server turn; packets can be released in bursts to mimic network jitter.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::Sender;
use symphonia::core::codecs::CodecParameters;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// What the transport delivers to the control loop.
#[derive(Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// One encoded unit (a codec packet).
    Unit(Vec<u8>),
    /// The local user finished an utterance; the next turn follows.
    UserStoppedSpeaking,
    /// Every file has been sent.
    Finished,
}

#[derive(Clone, Debug)]
pub struct TransportOptions {
    pub burst: usize,
    pub turn_gap: Duration,
    pub signal_user_stop: bool,
}

/// Open `path` and return its reader, default track id and codec parameters.
pub fn probe(path: &Path) -> Result<(Box<dyn FormatReader>, u32, CodecParameters)> {
    let file = File::open(path).with_context(|| format!("open {:?}", path))?;

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .with_context(|| format!("probe {:?}", path))?;

    let format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("No default audio track in {:?}", path))?;
    let track_id = track.id;
    let params = track.codec_params.clone();
    Ok((format, track_id, params))
}

/// Probe every file and return the shared codec parameters.
///
/// One decoder configuration serves the whole session, so all files must use
/// the same codec, rate and channel layout.
pub fn probe_sources(paths: &[PathBuf]) -> Result<CodecParameters> {
    let (first_path, rest) = paths
        .split_first()
        .ok_or_else(|| anyhow!("No input files"))?;
    let (_, _, first) = probe(first_path)?;
    if first.sample_rate.is_none() {
        return Err(anyhow!("Unknown sample rate in {:?}", first_path));
    }
    for path in rest {
        let (_, _, params) = probe(path)?;
        ensure_compatible(&first, &params).with_context(|| format!("{:?}", path))?;
    }
    Ok(first)
}

pub fn ensure_compatible(first: &CodecParameters, other: &CodecParameters) -> Result<()> {
    if first.codec != other.codec {
        return Err(anyhow!(
            "codec {:?} differs from first file ({:?})",
            other.codec,
            first.codec
        ));
    }
    if first.sample_rate != other.sample_rate {
        return Err(anyhow!(
            "sample rate {:?} differs from first file ({:?})",
            other.sample_rate,
            first.sample_rate
        ));
    }
    if first.channels != other.channels {
        return Err(anyhow!("channel layout differs from first file"));
    }
    Ok(())
}

/// Media duration of a packet spanning `dur` timestamp units.
pub fn packet_duration(params: &CodecParameters, dur: u64) -> Duration {
    if let Some(tb) = params.time_base {
        let t = tb.calc_time(dur);
        return Duration::from_secs(t.seconds) + Duration::from_secs_f64(t.frac);
    }
    match params.sample_rate {
        Some(rate) if rate > 0 => Duration::from_secs_f64(dur as f64 / f64::from(rate)),
        _ => Duration::ZERO,
    }
}

/// Start streaming `paths` into `tx` on a background thread.
///
/// The thread exits early once the receiver is dropped.
pub fn spawn(
    paths: Vec<PathBuf>,
    opts: TransportOptions,
    tx: Sender<TransportEvent>,
) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("voice-transport".to_string())
        .spawn(move || {
            if let Err(e) = stream_files(&paths, &opts, &tx) {
                tracing::warn!("transport error: {e:#}");
            }
            let _ = tx.send(TransportEvent::Finished);
        })
        .context("spawn transport thread")
}

fn stream_files(paths: &[PathBuf], opts: &TransportOptions, tx: &Sender<TransportEvent>) -> Result<()> {
    for (turn, path) in paths.iter().enumerate() {
        if turn > 0 {
            thread::sleep(opts.turn_gap);
            if opts.signal_user_stop && tx.send(TransportEvent::UserStoppedSpeaking).is_err() {
                return Ok(());
            }
        }
        let Some(sent) = stream_file(path, opts.burst.max(1), tx)? else {
            return Ok(());
        };
        tracing::info!(path = ?path, turn, media_s = sent.as_secs_f64(), "turn sent");
    }
    Ok(())
}

/// Send one file's packets, paced against the media clock.
///
/// Returns the media duration sent, or `None` once the receiver is gone.
fn stream_file(path: &Path, burst: usize, tx: &Sender<TransportEvent>) -> Result<Option<Duration>> {
    let (mut format, track_id, params) = probe(path)?;
    let started = Instant::now();
    let mut media = Duration::ZERO;
    let mut in_burst = 0usize;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => {
                tracing::warn!(path = ?path, "read packet: {e}");
                break;
            }
        };
        if packet.track_id() != track_id {
            continue;
        }

        media += packet_duration(&params, packet.dur);
        if tx.send(TransportEvent::Unit(packet.data.to_vec())).is_err() {
            return Ok(None);
        }

        in_burst += 1;
        if in_burst >= burst {
            in_burst = 0;
            let due = started + media;
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }
    }
    Ok(Some(media))
}

#[cfg(test)]
mod tests {
    use super::*;
    use symphonia::core::audio::Channels;
    use symphonia::core::codecs::{CODEC_TYPE_FLAC, CODEC_TYPE_MP3};
    use symphonia::core::units::TimeBase;

    fn params(rate: u32) -> CodecParameters {
        let mut p = CodecParameters::new();
        p.for_codec(CODEC_TYPE_FLAC)
            .with_sample_rate(rate)
            .with_channels(Channels::FRONT_LEFT);
        p
    }

    fn write_wav(dir: &Path, name: &str, rate: u32, samples: &[i16]) -> PathBuf {
        let path = dir.join(format!("{name}.wav"));
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn packet_duration_uses_time_base() {
        let mut p = params(48_000);
        p.with_time_base(TimeBase::new(1, 48_000));
        assert_eq!(packet_duration(&p, 960), Duration::from_millis(20));
    }

    #[test]
    fn packet_duration_falls_back_to_sample_rate() {
        assert_eq!(packet_duration(&params(16_000), 160), Duration::from_millis(10));
        assert_eq!(packet_duration(&CodecParameters::new(), 160), Duration::ZERO);
    }

    #[test]
    fn ensure_compatible_rejects_mismatches() {
        assert!(ensure_compatible(&params(48_000), &params(48_000)).is_ok());
        assert!(ensure_compatible(&params(48_000), &params(44_100)).is_err());

        let mut mp3 = params(48_000);
        mp3.for_codec(CODEC_TYPE_MP3);
        assert!(ensure_compatible(&params(48_000), &mp3).is_err());

        let mut stereo = params(48_000);
        stereo.with_channels(Channels::FRONT_LEFT | Channels::FRONT_RIGHT);
        assert!(ensure_compatible(&params(48_000), &stereo).is_err());
    }

    #[test]
    fn probe_sources_requires_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_wav(dir.path(), "a", 16_000, &[0; 160]);
        let b = write_wav(dir.path(), "b", 16_000, &[0; 320]);
        let c = write_wav(dir.path(), "c", 8_000, &[0; 160]);

        let shared = probe_sources(&[a.clone(), b]).unwrap();
        assert_eq!(shared.sample_rate, Some(16_000));
        assert!(probe_sources(&[a, c]).is_err());
        assert!(probe_sources(&[]).is_err());
    }

    #[test]
    fn streams_turns_in_order_then_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_wav(dir.path(), "turn-a", 16_000, &[1_000; 800]);
        let b = write_wav(dir.path(), "turn-b", 16_000, &[1_000; 800]);
        let (tx, rx) = crossbeam_channel::unbounded();
        let opts = TransportOptions {
            burst: 64,
            turn_gap: Duration::from_millis(1),
            signal_user_stop: true,
        };
        let handle = spawn(vec![a, b], opts, tx).unwrap();
        handle.join().unwrap();

        let events: Vec<TransportEvent> = rx.try_iter().collect();
        assert_eq!(events.last(), Some(&TransportEvent::Finished));
        let stop_at = events
            .iter()
            .position(|e| *e == TransportEvent::UserStoppedSpeaking)
            .unwrap();
        assert!(matches!(events[0], TransportEvent::Unit(_)));
        assert!(matches!(events[stop_at + 1], TransportEvent::Unit(_)));

        let bytes: usize = events
            .iter()
            .map(|e| match e {
                TransportEvent::Unit(u) => u.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(bytes, 2 * 800 * 2);
    }

    #[test]
    fn missing_file_still_finishes() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let opts = TransportOptions {
            burst: 1,
            turn_gap: Duration::ZERO,
            signal_user_stop: false,
        };
        spawn(vec![PathBuf::from("/nonexistent/voice.wav")], opts, tx)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![TransportEvent::Finished]);
    }
}
