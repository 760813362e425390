//! Client runtime.
//!
//! Provides device enumeration and the `play` loop that feeds transport units
//! through the voice playback session while CPAL renders them.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::Receiver;
use voice_playback::codec::{SymphoniaDecoder, codec_label};
use voice_playback::pipeline::{self, ServerAudio, SystemClock};
use voice_playback::{device, playback};
use voice_playback_types::AudioStats;

use crate::config::ClientPlayConfig;
use crate::transport::{self, TransportEvent, TransportOptions};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const UNIT_CHANNEL_CAPACITY: usize = 64;
/// Backlog must stay unchanged this long before draining counts as done.
const DRAIN_QUIET: Duration = Duration::from_millis(500);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    device::list_devices(&host)
}

/// Stream the configured files through the playback path until they drain.
pub fn run_play(config: ClientPlayConfig, install_ctrlc: bool) -> Result<()> {
    let params = transport::probe_sources(&config.paths)?;
    let source_rate = params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate"))?;
    tracing::info!(
        codec = codec_label(&params).unwrap_or("unknown"),
        rate_hz = source_rate,
        turns = config.paths.len(),
        "source"
    );

    let host = cpal::default_host();
    let device = device::pick_device(&host, config.device.as_deref())?;
    tracing::info!(device = %device.description()?, "output device");

    let supported =
        device::pick_output_config(&device, Some(config.sample_rate.unwrap_or(source_rate)))?;
    let mut stream_config = supported.config();
    if let Some(buf) = device::pick_buffer_size(&supported, config.buffer_frames) {
        stream_config.buffer_size = buf;
    }
    tracing::info!(
        source_rate_hz = source_rate,
        output_rate_hz = stream_config.sample_rate,
        channels = stream_config.channels,
        buffer_size = ?stream_config.buffer_size,
        "device output config"
    );

    let (mut audio, node) = pipeline::build(
        config.playback.clone(),
        SymphoniaDecoder::factory(params),
        stream_config.sample_rate,
        Arc::new(SystemClock),
    )?;
    let stream =
        playback::build_output_stream(&device, &stream_config, supported.sample_format(), node)?;
    stream.play().context("start output stream")?;

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    if install_ctrlc {
        let stop_tx = stop_tx.clone();
        ctrlc::set_handler(move || {
            let _ = stop_tx.try_send(());
        })
        .context("install Ctrl-C handler")?;
    }

    let (unit_tx, unit_rx) = crossbeam_channel::bounded(UNIT_CHANNEL_CAPACITY);
    transport::spawn(
        config.paths.clone(),
        TransportOptions {
            burst: config.burst,
            turn_gap: config.turn_gap,
            signal_user_stop: config.signal_user_stop,
        },
        unit_tx,
    )?;

    let stats = drive(&mut audio, &unit_rx, &stop_rx, config.stats_interval);
    let decode = audio.coordinator_stats();
    tracing::info!(
        frames = decode.frames_decoded,
        decode_errors = decode.decode_errors,
        dropped_not_ready = decode.dropped_not_ready,
        dropped_full = decode.dropped_full,
        dropped_closed = decode.dropped_closed,
        "decode summary"
    );
    audio.shutdown();
    drop(stream);
    drop(stop_tx);

    if config.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print!("{}", format_summary(&stats));
    }
    Ok(())
}

/// Control loop: hand units to the session, poll it, report, and stop once drained.
fn drive(
    audio: &mut ServerAudio,
    units: &Receiver<TransportEvent>,
    stop: &Receiver<()>,
    stats_interval: Duration,
) -> AudioStats {
    let ticker = crossbeam_channel::tick(POLL_INTERVAL);
    let idle = crossbeam_channel::never::<TransportEvent>();
    let started = Instant::now();
    let mut last_report = started;
    let mut drain: Option<Drain> = None;

    loop {
        let source = if drain.is_some() { &idle } else { units };
        crossbeam_channel::select! {
            recv(source) -> event => match event {
                Ok(TransportEvent::Unit(unit)) => {
                    audio.handle_audio(unit);
                }
                Ok(TransportEvent::UserStoppedSpeaking) => {
                    tracing::info!("user stopped speaking");
                    audio.user_stopped_speaking();
                }
                Ok(TransportEvent::Finished) | Err(_) => {
                    tracing::info!("transport finished; draining");
                    drain = Some(Drain::new(Instant::now()));
                }
            },
            recv(ticker) -> _ => {
                // No microphone here: the uplink runs for as long as the session does.
                audio.set_uplink_seconds(started.elapsed().as_secs_f64());
                audio.poll();
                let now = Instant::now();
                if !stats_interval.is_zero() && now.duration_since(last_report) >= stats_interval {
                    log_stats(&audio.stats());
                    last_report = now;
                }
                if let Some(d) = drain.as_mut() {
                    if d.observe(audio.engine_stats().backlog_samples, now) {
                        break;
                    }
                }
            },
            recv(stop) -> _ => {
                tracing::info!("interrupted");
                break;
            },
        }
    }
    audio.stats()
}

/// Tracks the end-of-input drain.
#[derive(Clone, Copy, Debug)]
struct Drain {
    since: Instant,
    backlog: Option<usize>,
    changed_at: Instant,
}

impl Drain {
    fn new(now: Instant) -> Self {
        Self {
            since: now,
            backlog: None,
            changed_at: now,
        }
    }

    /// `true` once the backlog stopped moving for [`DRAIN_QUIET`] or the timeout hit.
    fn observe(&mut self, backlog: usize, now: Instant) -> bool {
        if self.backlog != Some(backlog) {
            self.backlog = Some(backlog);
            self.changed_at = now;
        }
        now.duration_since(self.changed_at) >= DRAIN_QUIET
            || now.duration_since(self.since) >= DRAIN_TIMEOUT
    }
}

fn log_stats(stats: &AudioStats) {
    tracing::info!(
        played_s = stats.played_audio_seconds,
        missed_s = stats.missed_audio_seconds,
        backlog_s = stats.backlog_seconds,
        delay_s = stats.delay_seconds,
        units = stats.total_audio_messages,
        underruns = stats.underruns,
        drops = stats.drop_passes,
        resets = stats.resets,
        partial_ms = stats.thresholds.partial_ms,
        max_headroom_ms = stats.thresholds.max_headroom_ms,
        critical = stats.critical_delay,
        "playback stats"
    );
}

/// Human-readable final report.
pub fn format_summary(stats: &AudioStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "units received:   {}", stats.total_audio_messages);
    let _ = writeln!(out, "turn resets:      {}", stats.resets);
    let _ = writeln!(
        out,
        "last turn:        {:.2}s played, {:.2}s missed of {:.2}s output",
        stats.played_audio_seconds, stats.missed_audio_seconds, stats.total_output_seconds
    );
    let _ = writeln!(
        out,
        "underruns/drops:  {}/{}",
        stats.underruns, stats.drop_passes
    );
    let _ = writeln!(
        out,
        "backlog range:    {}",
        match (
            stats.min_playback_delay_seconds,
            stats.max_playback_delay_seconds
        ) {
            (Some(min), Some(max)) => format!("{:.3}s..{:.3}s", min, max),
            _ => "n/a".to_string(),
        }
    );
    let _ = writeln!(
        out,
        "thresholds:       initial {:.0}ms, partial {:.0}ms, headroom {:.0}ms",
        stats.thresholds.initial_ms, stats.thresholds.partial_ms, stats.thresholds.max_headroom_ms
    );
    if stats.critical_delay {
        let _ = writeln!(out, "critical delay:   raised");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use voice_playback_types::ThresholdSnapshot;

    #[test]
    fn drain_finishes_after_backlog_settles() {
        let t0 = Instant::now();
        let mut d = Drain::new(t0);
        assert!(!d.observe(960, t0));
        assert!(!d.observe(480, t0 + Duration::from_millis(300)));
        assert!(!d.observe(0, t0 + Duration::from_millis(600)));
        assert!(!d.observe(0, t0 + Duration::from_millis(900)));
        assert!(d.observe(0, t0 + Duration::from_millis(1_100)));
    }

    #[test]
    fn drain_finishes_on_stuck_tail() {
        let t0 = Instant::now();
        let mut d = Drain::new(t0);
        assert!(!d.observe(120, t0));
        assert!(d.observe(120, t0 + DRAIN_QUIET));
    }

    #[test]
    fn drain_times_out_while_backlog_keeps_moving() {
        let t0 = Instant::now();
        let mut d = Drain::new(t0);
        assert!(!d.observe(1, t0));
        assert!(d.observe(2, t0 + DRAIN_TIMEOUT));
    }

    #[test]
    fn summary_reports_turn_and_session_counters() {
        let stats = AudioStats {
            played_audio_seconds: 1.5,
            missed_audio_seconds: 0.25,
            total_output_seconds: 1.75,
            total_audio_messages: 42,
            resets: 2,
            underruns: 1,
            min_playback_delay_seconds: Some(0.1),
            max_playback_delay_seconds: Some(0.5),
            thresholds: ThresholdSnapshot {
                initial_ms: 450.0,
                partial_ms: 160.0,
                max_headroom_ms: 1500.0,
            },
            ..AudioStats::default()
        };
        let text = format_summary(&stats);
        assert!(text.contains("units received:   42"));
        assert!(text.contains("turn resets:      2"));
        assert!(text.contains("1.50s played, 0.25s missed of 1.75s output"));
        assert!(text.contains("0.100s..0.500s"));
        assert!(text.contains("partial 160ms"));
        assert!(!text.contains("critical"));
    }

    #[test]
    fn summary_without_backlog_extremes() {
        let text = format_summary(&AudioStats {
            critical_delay: true,
            ..AudioStats::default()
        });
        assert!(text.contains("backlog range:    n/a"));
        assert!(text.contains("critical delay:   raised"));
    }
}
