use std::path::PathBuf;

use clap::{Parser, Subcommand};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "voice-client", version = VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Use a specific output device by substring match
    #[arg(long, global = true)]
    pub device: Option<String>,

    /// TOML file overriding playback tuning
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream encoded files through the voice playback path as if a server sent them
    Play(PlayArgs),

    /// List output devices and exit
    ListDevices,
}

#[derive(clap::Args, Debug, Clone)]
pub struct PlayArgs {
    /// Files to stream; each one is a server turn
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Packets delivered at once (simulates bursty network arrival)
    #[arg(long, default_value_t = 1)]
    pub burst: usize,

    /// Pause between turns in milliseconds
    #[arg(long, default_value_t = 0)]
    pub turn_gap_ms: u64,

    /// Signal "user stopped speaking" right before each turn after the first
    #[arg(long)]
    pub signal_user_stop: bool,

    /// Periodic stats interval in milliseconds (0 disables)
    #[arg(long, default_value_t = 1000)]
    pub stats_interval_ms: u64,

    /// Preferred output sample rate (defaults to the source rate)
    #[arg(long)]
    pub sample_rate: Option<u32>,

    /// Print the final stats as JSON
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn play_parses_flags_and_globals() {
        let args = Args::try_parse_from([
            "voice-client",
            "play",
            "a.flac",
            "b.flac",
            "--burst",
            "4",
            "--turn-gap-ms",
            "2500",
            "--device",
            "USB",
        ])
        .unwrap();
        assert_eq!(args.device.as_deref(), Some("USB"));
        match args.cmd {
            Command::Play(play) => {
                assert_eq!(play.paths.len(), 2);
                assert_eq!(play.burst, 4);
                assert_eq!(play.turn_gap_ms, 2_500);
                assert_eq!(play.stats_interval_ms, 1_000);
                assert!(!play.json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn play_requires_a_path() {
        assert!(Args::try_parse_from(["voice-client", "play"]).is_err());
    }

    #[test]
    fn list_devices_takes_no_paths() {
        let args = Args::try_parse_from(["voice-client", "list-devices"]).unwrap();
        assert!(matches!(args.cmd, Command::ListDevices));
    }
}
