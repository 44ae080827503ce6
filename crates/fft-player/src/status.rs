use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use fft_player_types::{AssetDescriptor, EngineState, PlaybackEndReason, PlayerStatus};

/// Shared engine status, written by the engine worker and output sessions.
#[derive(Debug, Default)]
pub struct EngineStatusState {
    pub state: EngineState,
    /// Output has started for the current session.
    pub played: bool,
    /// Asset under the queue cursor.
    pub current: Option<AssetDescriptor>,
    /// Last requested seek position.
    pub seek_position: f32,
    /// Progress of the in-flight copy.
    pub acquisition_progress: Option<f32>,
    /// Effective output sample rate in Hz.
    pub sample_rate: Option<u32>,
    /// Total track duration in milliseconds when known.
    pub duration_ms: Option<u64>,
    /// Source codec name (for example, FLAC/MP3).
    pub source_codec: Option<String>,
    /// Counter updated by the output callback, including the seek offset.
    pub played_frames: Option<Arc<AtomicU64>>,
    pub random: bool,
    pub circle: bool,
    pub queue_len: usize,
    /// Terminal reason of the last output session.
    pub end_reason: Option<PlaybackEndReason>,
}

pub type SharedStatus = Arc<Mutex<EngineStatusState>>;

impl EngineStatusState {
    /// Create a shared, mutex-protected status store.
    pub fn shared() -> SharedStatus {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn snapshot(&self) -> PlayerStatus {
        let elapsed_ms = match (self.played_frames.as_ref(), self.sample_rate) {
            (Some(frames), Some(sr)) if sr > 0 => {
                let frames = frames.load(Ordering::Relaxed);
                let elapsed = frames.saturating_mul(1000) / sr as u64;
                Some(self.duration_ms.map_or(elapsed, |total| elapsed.min(total)))
            }
            _ => None,
        };
        PlayerStatus {
            state: self.state,
            played: self.played,
            current: self.current.clone(),
            seek_position: self.seek_position,
            acquisition_progress: self.acquisition_progress,
            elapsed_ms,
            duration_ms: self.duration_ms,
            source_codec: self.source_codec.clone(),
            sample_rate: self.sample_rate,
            random: self.random,
            circle: self.circle,
            queue_len: self.queue_len,
            end_reason: self.end_reason,
        }
    }

    /// Clear session-specific fields when output is torn down.
    pub fn clear_playback(&mut self) {
        self.played = false;
        self.sample_rate = None;
        self.duration_ms = None;
        self.source_codec = None;
        self.played_frames = None;
    }
}

/// Starting value of the played-frames counter for a session that begins at `start_ms`.
pub fn played_frames_from_seek(start_ms: u64, duration_ms: Option<u64>, sample_rate_hz: u32) -> u64 {
    let target_ms = duration_ms.map_or(start_ms, |total| start_ms.min(total));
    target_ms.saturating_mul(sample_rate_hz as u64) / 1000
}
