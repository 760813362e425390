//! Voice client: plays a server's continuous voice stream through an adaptive
//! jitter buffer.
//!
//! The `play` command stands in for a live connection: it streams encoded files
//! packet by packet in real time, one file per server turn, and the playback
//! session detects each new turn on its own.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use voice_client::{cli, config, runtime};

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,voice_client=info,voice_playback=info")
        }))
        .with_writer(std::io::stderr)
        .init();

    match args.cmd {
        cli::Command::ListDevices => runtime::list_devices(),
        cli::Command::Play(play) => {
            let file = match &args.config {
                Some(path) => config::FileConfig::load(path)?,
                None => config::FileConfig::default(),
            };
            let cfg = config::ClientPlayConfig::resolve(&play, args.device.clone(), &file);
            runtime::run_play(cfg, true)
        }
    }
}
