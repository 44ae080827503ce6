pub mod acquire;
pub mod config;
pub mod decode;
pub mod device;
pub mod engine;
pub mod events;
pub mod frames;
pub mod output;
pub mod pipeline;
pub mod playback;
pub mod queue;
pub mod resample;
pub mod sample_queue;
pub mod spectrum;
pub mod status;

pub use acquire::{AcquireError, AssetAcquirer, AssetReader, FileAssetReader};
pub use config::PlayerConfig;
pub use engine::PlaybackEngine;
pub use output::{CpalOutput, OutputBackend};
pub use queue::PlaybackQueue;

pub use fft_player_types::{
    AssetDescriptor, AssetId, EngineState, PlaybackEndReason, PlayerEvent, PlayerStatus,
    SpectrumBars,
};
