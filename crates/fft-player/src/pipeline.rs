//! Playback pipeline wiring: decoder queue → optional resampler → output stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use cpal::traits::StreamTrait;

use crate::config::PlaybackConfig;
use crate::decode::DecodeStream;
use crate::frames::FrameWindow;
use crate::{playback, resample};

/// How a pipeline run ended without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineEnd {
    /// Every decoded sample reached the device.
    Drained,
    /// The session was cancelled before the end.
    Cancelled,
}

/// Counters and taps the session exposes to the engine.
pub struct SessionTaps {
    pub played_frames: Arc<AtomicU64>,
    pub frames: Arc<FrameWindow>,
    pub cancel: Arc<AtomicBool>,
}

/// Wire up the resampler and output stream, then block until playback drains or is cancelled.
///
/// A resampler stage is inserted when the source rate differs from the stream rate.
pub fn play_decoded_source(
    device: &cpal::Device,
    config: &cpal::SupportedStreamConfig,
    stream_config: &cpal::StreamConfig,
    playback: &PlaybackConfig,
    decoded: &DecodeStream,
    taps: SessionTaps,
) -> Result<PipelineEnd> {
    let dst_rate = stream_config.sample_rate;
    let dstq = if decoded.spec.rate == dst_rate {
        tracing::info!(rate_hz = dst_rate, "resample skipped");
        decoded.queue.clone()
    } else {
        tracing::info!(from_hz = decoded.spec.rate, to_hz = dst_rate, "resampling");
        resample::start_resampler(
            decoded.queue.clone(),
            decoded.spec,
            dst_rate,
            resample::ResampleConfig {
                chunk_frames: playback.chunk_frames,
                buffer_seconds: playback.buffer_seconds,
            },
        )?
    };

    let stream_failed = Arc::new(AtomicBool::new(false));
    let stream = playback::build_output_stream(
        device,
        stream_config,
        config.sample_format(),
        &dstq,
        playback::OutputTaps {
            refill_max_frames: playback.refill_max_frames,
            played_frames: taps.played_frames.clone(),
            frames: taps.frames.clone(),
            stream_failed: stream_failed.clone(),
            cancel_on_error: taps.cancel.clone(),
        },
    )?;
    stream.play()?;

    let drained = dstq.wait_drained_or_cancel(&taps.cancel);
    if !drained {
        decoded.queue.close();
        dstq.close();
    }
    if stream_failed.load(Ordering::Relaxed) {
        return Err(anyhow!("output stream failed"));
    }
    if !drained {
        return Ok(PipelineEnd::Cancelled);
    }

    // Let the device play out what it already buffered.
    thread::sleep(Duration::from_millis(100));
    Ok(PipelineEnd::Drained)
}
