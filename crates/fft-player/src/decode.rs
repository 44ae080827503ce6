//! Streaming decode stage.
//!
//! Probes a local copy with Symphonia, optionally seeks, and decodes packets
//! into interleaved `f32` samples pushed into a bounded [`SampleQueue`] from a
//! background thread. The queue is closed on EOF, on error, or when a consumer
//! closes it first.

use std::fs::File;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use crate::acquire::LocalSource;
use crate::sample_queue::{SampleQueue, capacity_for};

/// A running decoder and what was learned while probing.
pub struct DecodeStream {
    pub spec: SignalSpec,
    pub queue: Arc<SampleQueue>,
    pub duration_ms: Option<u64>,
    /// Position decoding actually starts from.
    pub start_ms: u64,
    pub codec: Option<String>,
    /// Set when the decoder thread stopped on an unrecoverable error.
    pub failed: Arc<AtomicBool>,
}

/// Open `source` and start decoding at `position` (fraction of the duration).
///
/// A position is ignored when the container reports no duration.
pub fn start_decode(source: &LocalSource, position: f32, buffer_seconds: f32) -> Result<DecodeStream> {
    let file = File::open(&source.path).with_context(|| format!("open {:?}", source.path))?;
    let mut hint = Hint::new();
    if let Some(ext) = source.extension.as_deref() {
        hint.with_extension(ext);
    }

    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .with_context(|| format!("probe {:?}", source.path))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("No default audio track"))?;
    let codec_params: CodecParameters = track.codec_params.clone();
    let channels = codec_params
        .channels
        .ok_or_else(|| anyhow!("Unknown channels"))?;
    let rate = codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate"))?;
    let spec = SignalSpec::new(rate, channels);
    let duration_ms = duration_ms_from_codec_params(&codec_params);

    let mut start_ms = seek_target_ms(position, duration_ms);
    if start_ms > 0 {
        let time = Time::new(start_ms / 1000, (start_ms % 1000) as f64 / 1000.0);
        if let Err(e) = format.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time,
                track_id: None,
            },
        ) {
            tracing::warn!(seek_ms = start_ms, error = %e, "seek failed, decoding from start");
            start_ms = 0;
        }
    }

    let queue = Arc::new(SampleQueue::new(
        channels.count(),
        capacity_for(rate, channels.count(), buffer_seconds),
    ));
    let failed = Arc::new(AtomicBool::new(false));
    let codec = codec_name_from_params(&codec_params);

    let queue_for_thread = queue.clone();
    let failed_for_thread = failed.clone();
    thread::spawn(move || {
        if let Err(e) = decode_loop(format, &codec_params, &queue_for_thread) {
            tracing::error!("decoder thread error: {e:#}");
            failed_for_thread.store(true, Ordering::Relaxed);
        }
        queue_for_thread.close();
    });

    Ok(DecodeStream {
        spec,
        queue,
        duration_ms,
        start_ms,
        codec,
        failed,
    })
}

/// Decode every packet into `queue` until EOF or until the queue is closed.
fn decode_loop(
    mut format: Box<dyn FormatReader>,
    codec_params: &CodecParameters,
    queue: &SampleQueue,
) -> Result<()> {
    let mut decoder = symphonia::default::get_codecs()
        .make(codec_params, &DecoderOptions::default())
        .context("create decoder")?;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e).context("read packet"),
        };

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::debug!(error = %e, "skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(e).context("decode packet"),
        };

        let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
        sample_buf.copy_interleaved_ref(decoded);
        if !queue.push_blocking(sample_buf.samples()) {
            break;
        }
    }
    Ok(())
}

/// Millisecond offset for a fractional position; `0` when the duration is unknown.
pub fn seek_target_ms(position: f32, duration_ms: Option<u64>) -> u64 {
    let Some(total) = duration_ms else {
        return 0;
    };
    if !position.is_finite() {
        return 0;
    }
    (position.clamp(0.0, 1.0) as f64 * total as f64) as u64
}

/// Best-effort duration in milliseconds from codec metadata.
fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

/// Best-effort codec label used for status payloads.
fn codec_name_from_params(params: &CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name.to_string())
}
