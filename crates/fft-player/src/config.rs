//! Player configuration.
//!
//! Every section has defaults, so an empty TOML file (or no file at all) is valid.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level player configuration loaded from TOML.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Output device substring match; `None` selects the host default.
    pub device: Option<String>,
    pub playback: PlaybackConfig,
    pub acquire: AcquireConfig,
    pub spectrum: SpectrumConfig,
}

/// Playback tuning parameters shared by decode/resample/playback stages.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Decoder/resampler chunk size in frames.
    pub chunk_frames: usize,
    /// Max frames pulled per output callback refill.
    pub refill_max_frames: usize,
    /// Target buffer duration for queue sizing.
    pub buffer_seconds: f32,
}

impl Default for PlaybackConfig {
    /// Defaults tuned for low-risk playback across common devices.
    fn default() -> Self {
        Self {
            chunk_frames: 1024,
            refill_max_frames: 4096,
            buffer_seconds: 2.0,
        }
    }
}

/// Asset copy settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AcquireConfig {
    /// Directory holding local copies. Defaults to `<tmp>/fft-player-cache`.
    pub cache_dir: PathBuf,
    /// Bytes copied per read.
    pub copy_chunk_bytes: usize,
    /// Minimum progress increase between two progress events.
    pub progress_step: f32,
    /// Completed copies kept on disk before the oldest is evicted.
    pub retain_copies: usize,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("fft-player-cache"),
            copy_chunk_bytes: 64 * 1024,
            progress_step: 0.01,
            retain_copies: 8,
        }
    }
}

/// Spectrum analysis settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SpectrumConfig {
    /// Mono frames kept for analysis (rounded up to a power of two by the analyzer).
    pub fft_size: usize,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self { fft_size: 2048 }
    }
}

impl PlayerConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::parse(&raw).with_context(|| format!("parse config {:?}", path))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(raw: &str) -> Result<Self> {
        let cfg = toml::from_str::<PlayerConfig>(raw)?;
        Ok(cfg.sanitized())
    }

    /// Replace out-of-range values with their defaults.
    pub fn sanitized(mut self) -> Self {
        let playback = PlaybackConfig::default();
        if self.playback.chunk_frames == 0 {
            self.playback.chunk_frames = playback.chunk_frames;
        }
        if self.playback.refill_max_frames == 0 {
            self.playback.refill_max_frames = playback.refill_max_frames;
        }
        if !(self.playback.buffer_seconds.is_finite() && self.playback.buffer_seconds > 0.0) {
            self.playback.buffer_seconds = playback.buffer_seconds;
        }
        let acquire = AcquireConfig::default();
        if self.acquire.copy_chunk_bytes == 0 {
            self.acquire.copy_chunk_bytes = acquire.copy_chunk_bytes;
        }
        if !(self.acquire.progress_step.is_finite() && self.acquire.progress_step >= 0.0) {
            self.acquire.progress_step = acquire.progress_step;
        }
        self.acquire.retain_copies = self.acquire.retain_copies.max(1);
        if self.spectrum.fft_size < 64 {
            self.spectrum.fft_size = SpectrumConfig::default().fft_size;
        }
        self.device = self
            .device
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        self
    }
}
