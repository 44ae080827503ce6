use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identity of a media asset as handed out by the library collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(pub String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A media item that can be queued for playback.
///
/// Descriptors are immutable once handed out and compared by [`AssetId`] only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssetDescriptor {
    /// Identity used for queue lookups and acquisition coalescing.
    pub id: AssetId,
    /// Display title.
    pub title: String,
    /// Display artist, when known.
    pub artist: Option<String>,
    /// Where the raw bytes live (a filesystem path for the default reader).
    pub locator: String,
    /// `true` when the library reports the item as copy-protected.
    #[serde(default)]
    pub drm_protected: bool,
}

impl AssetDescriptor {
    pub fn new(id: impl Into<String>, title: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            id: AssetId::new(id),
            title: title.into(),
            artist: None,
            locator: locator.into(),
            drm_protected: false,
        }
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = Some(artist.into());
        self
    }

    pub fn with_drm(mut self, drm_protected: bool) -> Self {
        self.drm_protected = drm_protected;
        self
    }

    /// "Artist - Title", or just the title when the artist is unknown.
    pub fn display_name(&self) -> String {
        match self.artist.as_deref() {
            Some(artist) if !artist.is_empty() => format!("{artist} - {}", self.title),
            _ => self.title.clone(),
        }
    }
}

impl PartialEq for AssetDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for AssetDescriptor {}

/// Engine lifecycle state.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No session and no acquisition.
    #[default]
    Idle,
    /// A copy of the current asset is in flight.
    Acquiring,
    /// Output is flowing for the current asset.
    Playing,
    /// A session existed and was torn down by a command.
    Stopped,
}

/// Reason why an output session ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Natural end of stream/file.
    Eof,
    /// Decoder or output error interrupted playback.
    Error,
    /// Playback was explicitly stopped by a command.
    Stopped,
}

/// Lifecycle notifications published by the engine.
///
/// For one acquisition, progress values never decrease and exactly one of
/// `DrmBlocked`, `CopyStopped` or `CopyFailed` closes the sequence.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlayerEvent {
    DrmBlocked { asset: AssetDescriptor },
    CopyStarted { asset: AssetDescriptor },
    CopyProgress { asset: AssetDescriptor, progress: f32 },
    CopyStopped { asset: AssetDescriptor },
    CopyFailed { asset: AssetDescriptor, error: String },
    StateChanged { state: EngineState },
}

/// Bars returned by a spectrum query. The caller owns the buffer.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SpectrumBars {
    /// Exactly the requested number of magnitudes.
    pub bars: Vec<f32>,
    /// `false` when no live frame window backed the computation.
    pub valid: bool,
}

/// Point-in-time engine status.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerStatus {
    /// Current lifecycle state.
    pub state: EngineState,
    /// `true` once output has started and until it is torn down.
    pub played: bool,
    /// Asset under the queue cursor.
    pub current: Option<AssetDescriptor>,
    /// Last requested seek position in `[0.0, 1.0]`.
    pub seek_position: f32,
    /// Progress of the in-flight copy, if any.
    pub acquisition_progress: Option<f32>,
    /// Elapsed playback time in milliseconds.
    pub elapsed_ms: Option<u64>,
    /// Total media duration in milliseconds.
    pub duration_ms: Option<u64>,
    /// Source codec label (for example `FLAC`).
    pub source_codec: Option<String>,
    /// Output sample rate (Hz).
    pub sample_rate: Option<u32>,
    /// Whether traversal picks random assets.
    pub random: bool,
    /// Whether traversal wraps around the queue ends.
    pub circle: bool,
    /// Number of queued assets.
    pub queue_len: usize,
    /// How the last output session ended.
    pub end_reason: Option<PlaybackEndReason>,
}
