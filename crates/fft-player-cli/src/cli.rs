use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "fft-player", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Optional player config file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Use a specific output device by substring match
    #[arg(long, global = true)]
    pub device: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play a list of local files, reading commands from stdin
    Play {
        /// Audio files, played in order
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Jump to a random track on next/previous
        #[arg(long)]
        random: bool,

        /// Wrap around at either end of the queue
        #[arg(long)]
        circle: bool,

        /// Spectrum bars printed while playing (0 disables the meter)
        #[arg(long, default_value_t = 0)]
        bars: usize,

        /// Directory for local copies (overrides the config file)
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },

    /// List output devices and exit
    Devices,
}
