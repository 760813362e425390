use serde::{Deserialize, Serialize};

/// Why the playback path was resynchronized.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    /// The unit carried an explicit beginning-of-stream marker.
    StreamStart,
    /// The user stopped speaking shortly before audio kept arriving.
    UserStoppedSpeaking,
    /// No non-silent audio was decoded for longer than the gap threshold.
    SilenceGap,
    /// Playback made no progress for longer than the stall threshold.
    PlaybackStalled,
    /// The transport connection was (re)established.
    ConnectionEstablished,
}

impl ResetReason {
    /// Short label used in log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetReason::StreamStart => "stream_start",
            ResetReason::UserStoppedSpeaking => "user_stopped_speaking",
            ResetReason::SilenceGap => "silence_gap",
            ResetReason::PlaybackStalled => "playback_stalled",
            ResetReason::ConnectionEstablished => "connection_established",
        }
    }
}

/// Current adaptive buffer thresholds, expressed in milliseconds.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ThresholdSnapshot {
    /// Backlog required before the first output of a turn.
    pub initial_ms: f64,
    /// Headroom required before resumed output becomes audible.
    pub partial_ms: f64,
    /// Extra backlog tolerated beyond `initial + partial` before dropping.
    pub max_headroom_ms: f64,
}

/// Playback statistics for the current turn plus session-wide counters.
///
/// Durations are seconds unless the field name says otherwise.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AudioStats {
    /// Non-silent audio actually rendered this turn.
    pub played_audio_seconds: f64,
    /// Output time spent padding with silence after playback began.
    pub missed_audio_seconds: f64,
    /// Total output time rendered since playback began this turn.
    pub total_output_seconds: f64,
    /// Audio units received from the transport since the connection was established.
    pub total_audio_messages: u64,
    /// Uplink duration minus the current stream position.
    pub delay_seconds: f64,
    /// Smallest backlog observed while playable, if any.
    pub min_playback_delay_seconds: Option<f64>,
    /// Largest backlog observed while playable, if any.
    pub max_playback_delay_seconds: Option<f64>,
    /// Audio currently buffered and not yet played.
    pub backlog_seconds: f64,
    /// Underruns padded with silence this turn.
    pub underruns: u64,
    /// Backlog drop passes this turn.
    pub drop_passes: u64,
    /// Resynchronizations since the connection was established.
    pub resets: u64,
    /// Thresholds currently in effect.
    pub thresholds: ThresholdSnapshot,
    /// `true` while the missed/total ratio has stayed above the configured limit.
    pub critical_delay: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_reason_serializes_snake_case() {
        let json = serde_json::to_string(&ResetReason::UserStoppedSpeaking).unwrap();
        assert_eq!(json, "\"user_stopped_speaking\"");
        assert_eq!(ResetReason::PlaybackStalled.as_str(), "playback_stalled");
    }

    #[test]
    fn log_labels_match_serialized_names() {
        for reason in [
            ResetReason::StreamStart,
            ResetReason::UserStoppedSpeaking,
            ResetReason::SilenceGap,
            ResetReason::PlaybackStalled,
            ResetReason::ConnectionEstablished,
        ] {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason.as_str()));
        }
    }

    #[test]
    fn audio_stats_default_has_no_backlog_extremes() {
        let stats = AudioStats::default();
        assert!(stats.min_playback_delay_seconds.is_none());
        assert!(stats.max_playback_delay_seconds.is_none());
        assert!(!stats.critical_delay);
    }
}
