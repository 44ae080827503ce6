//! Output stage: the CPAL stream and its real-time callback.
//!
//! The callback refills a small local buffer from the queue without blocking,
//! maps channels, converts to the device sample format, and taps the mapped
//! samples into the [`FrameWindow`] so spectrum queries see exactly what is
//! being heard.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;

use crate::frames::FrameWindow;
use crate::sample_queue::{SampleQueue, Take};

/// Wiring between the output callback and the rest of the session.
#[derive(Clone)]
pub struct OutputTaps {
    /// Maximum frames pulled from the queue per refill.
    pub refill_max_frames: usize,
    /// Incremented by the number of frames handed to the device.
    pub played_frames: Arc<AtomicU64>,
    /// Receives a mono mix of every frame handed to the device.
    pub frames: Arc<FrameWindow>,
    /// Set when the stream reports an error.
    pub stream_failed: Arc<AtomicBool>,
    /// Also set on stream error so waiters on the session wake up.
    pub cancel_on_error: Arc<AtomicBool>,
}

/// Build a CPAL output stream that plays interleaved `f32` from `queue`.
///
/// `queue` must already be at the stream sample rate. Underruns are filled with silence.
pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: &Arc<SampleQueue>,
    taps: OutputTaps,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, queue, taps),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, queue, taps),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, queue, taps),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, queue, taps),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<SampleQueue>,
    taps: OutputTaps,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = (config.channels as usize).max(1);
    let mut st = CallbackState {
        mixer: ChannelMapper::new(queue.channels(), channels_out),
        scratch: Vec::new(),
    };
    let queue_cb = queue.clone();
    let refill_max_frames = taps.refill_max_frames.max(1);
    let played_frames = taps.played_frames.clone();
    let frames_tap = taps.frames.clone();
    let failed = taps.stream_failed.clone();
    let cancel_on_error = taps.cancel_on_error.clone();

    let err_fn = move |err| {
        tracing::warn!("stream error: {err}");
        failed.store(true, Ordering::Relaxed);
        cancel_on_error.store(true, Ordering::Relaxed);
    };

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            st.scratch.clear();

            let frames = data.len() / channels_out;
            for _ in 0..frames {
                if !st.mixer.has_frame() {
                    match queue_cb.pop(Take::Available {
                        max_frames: refill_max_frames,
                    }) {
                        Some(chunk) => st.mixer.refill(chunk),
                        None => break,
                    }
                }
                st.mixer.next_frame(&mut st.scratch);
            }

            for (out, sample) in data.iter_mut().zip(st.scratch.iter()) {
                *out = <T as cpal::Sample>::from_sample::<f32>(*sample);
            }
            for out in data.iter_mut().skip(st.scratch.len()) {
                *out = <T as cpal::Sample>::from_sample::<f32>(0.0);
            }

            let filled = st.scratch.len() / channels_out;
            if filled > 0 {
                played_frames.fetch_add(filled as u64, Ordering::Relaxed);
                frames_tap.push_interleaved(&st.scratch, channels_out);
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

struct CallbackState {
    mixer: ChannelMapper,
    /// Mapped `f32` output for the current callback, reused across callbacks.
    scratch: Vec<f32>,
}

/// Maps source frames onto the device channel layout.
///
/// - mono → N: duplicate channel 0
/// - stereo → mono: average L/R
/// - otherwise: pass matching channels, repeat the last source channel
struct ChannelMapper {
    src_channels: usize,
    dst_channels: usize,
    src: Vec<f32>,
    pos: usize,
}

impl ChannelMapper {
    fn new(src_channels: usize, dst_channels: usize) -> Self {
        Self {
            src_channels: src_channels.max(1),
            dst_channels: dst_channels.max(1),
            src: Vec::new(),
            pos: 0,
        }
    }

    fn has_frame(&self) -> bool {
        self.pos + self.src_channels <= self.src.len()
    }

    fn refill(&mut self, chunk: Vec<f32>) {
        self.src = chunk;
        self.pos = 0;
    }

    /// Append one mapped output frame to `out` and advance.
    fn next_frame(&mut self, out: &mut Vec<f32>) {
        if !self.has_frame() {
            return;
        }
        let frame = &self.src[self.pos..self.pos + self.src_channels];
        match (self.src_channels, self.dst_channels) {
            (2, 1) => out.push(0.5 * (frame[0] + frame[1])),
            (src, dst) => {
                for ch in 0..dst {
                    out.push(frame[ch.min(src - 1)]);
                }
            }
        }
        self.pos += self.src_channels;
    }
}
