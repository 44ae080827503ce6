//! Streaming resample stage.
//!
//! Converts decoded interleaved `f32` audio from the source rate to the
//! output device rate with Rubato's sinc resampler, on a background thread.

use std::sync::Arc;
use std::thread;

use anyhow::{Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};
use symphonia::core::audio::SignalSpec;

use crate::sample_queue::{SampleQueue, Take, capacity_for};

/// Configuration for the streaming resampler stage.
#[derive(Clone, Copy, Debug)]
pub struct ResampleConfig {
    /// Input chunk size in frames for the steady-state loop.
    pub chunk_frames: usize,
    /// Target buffering (seconds) for the output queue.
    pub buffer_seconds: f32,
}

/// Start a resampler thread reading `srcq` at `src_spec.rate` and writing `dst_rate` audio.
///
/// The returned queue closes once `srcq` is closed and drained. Closing the
/// returned queue early also closes `srcq`, which stops the decoder.
pub fn start_resampler(
    srcq: Arc<SampleQueue>,
    src_spec: SignalSpec,
    dst_rate: u32,
    cfg: ResampleConfig,
) -> Result<Arc<SampleQueue>> {
    let channels = src_spec.channels.count();
    let chunk_frames = cfg.chunk_frames.max(1);
    let dstq = Arc::new(SampleQueue::new(
        channels,
        capacity_for(dst_rate, channels, cfg.buffer_seconds),
    ));

    let window = WindowFunction::BlackmanHarris2;
    let sinc_len = 128;
    let params = SincInterpolationParameters {
        sinc_len,
        f_cutoff: calculate_cutoff(sinc_len, window),
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window,
    };
    let ratio = dst_rate as f64 / src_spec.rate as f64;

    let dstq_thread = dstq.clone();
    thread::spawn(move || {
        let resampler = match Async::<f32>::new_sinc(
            ratio,
            1.1,
            &params,
            chunk_frames,
            channels,
            FixedAsync::Input,
        ) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("resampler init error: {e:#}");
                srcq.close();
                dstq_thread.close();
                return;
            }
        };
        let mut stage = ResampleStage {
            resampler: Box::new(resampler),
            channels,
            ratio,
            out: vec![0.0f32; channels * chunk_frames * 3],
        };
        if let Err(e) = stage.run(&srcq, &dstq_thread, chunk_frames) {
            tracing::error!("resampler error: {e:#}");
        }
        srcq.close();
        dstq_thread.close();
    });

    Ok(dstq)
}

struct ResampleStage {
    resampler: Box<dyn Resampler<f32>>,
    channels: usize,
    ratio: f64,
    out: Vec<f32>,
}

impl ResampleStage {
    fn run(&mut self, srcq: &SampleQueue, dstq: &SampleQueue, chunk_frames: usize) -> Result<()> {
        while let Some(chunk) = srcq.pop(Take::Exact { frames: chunk_frames }) {
            if !self.process(&chunk, None, dstq)? {
                return Ok(());
            }
        }
        // Fewer than `chunk_frames` frames remain once the source closes.
        while let Some(tail) = srcq.pop(Take::UpTo { max_frames: chunk_frames }) {
            let tail_frames = tail.len() / self.channels;
            if !self.process(&tail, Some(tail_frames), dstq)? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Resample one chunk into `dstq`. Returns `false` when `dstq` was closed.
    fn process(&mut self, input: &[f32], partial_len: Option<usize>, dstq: &SampleQueue) -> Result<bool> {
        let channels = self.channels;
        let input_frames = input.len() / channels;
        let input_adapter = InterleavedSlice::new(input, channels, input_frames)
            .map_err(|e| anyhow!("interleaved input: {e}"))?;
        let out_frames = self.out.len() / channels;
        let mut output_adapter = InterleavedSlice::new_mut(&mut self.out, channels, out_frames)
            .map_err(|e| anyhow!("interleaved output: {e}"))?;

        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len,
        };
        let (_consumed, mut produced) = self
            .resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
            .map_err(|e| anyhow!("resample: {e}"))?;
        // A partial chunk is zero-padded to a full one; drop the padding's output.
        if let Some(frames) = partial_len {
            produced = produced.min(tail_output_frames(frames, self.ratio));
        }

        let produced_samples = produced * channels;
        if produced_samples == 0 {
            return Ok(true);
        }
        Ok(dstq.push_blocking(&self.out[..produced_samples]))
    }
}

/// Output frames that correspond to `input_frames` real input frames.
fn tail_output_frames(input_frames: usize, ratio: f64) -> usize {
    (input_frames as f64 * ratio).ceil() as usize
}
