//! fft-player: plays a queue of local files through a copy-then-play engine
//! and can draw a live spectrum meter.
//!
//! ## Modes
//! - `play`: queue files and control playback from stdin (`g`, `s`, `n`, `p`,
//!   `seek <0..1>`, `status`, `q`).
//! - `devices`: list output devices.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use fft_player_cli::{cli, config, runtime};

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,fft_player=info")
        }))
        .with_writer(std::io::stderr)
        .init();

    match args.cmd {
        cli::Command::Devices => runtime::list_devices(),
        cli::Command::Play {
            paths,
            random,
            circle,
            bars,
            cache_dir,
        } => {
            let player =
                config::resolve_player_config(args.config.as_deref(), args.device, cache_dir)?;
            runtime::run_play(
                config::PlayOptions {
                    assets: config::assets_from_paths(&paths),
                    random,
                    circle,
                    bars,
                    player,
                },
                true,
            )
        }
    }
}
