//! Magnitude bars from a mono frame window.
//!
//! Hann window → forward FFT → `|X| / N` over the positive bins → log-spaced
//! bands, one bar per band. Identical input always produces identical bars.

use std::sync::{Arc, Mutex};

use rustfft::{Fft, FftPlanner, num_complex::Complex};

const MIN_FFT_SIZE: usize = 64;

/// Computes spectrum bars; safe to share between threads.
pub struct SpectrumAnalyzer {
    max_fft_size: usize,
    planner: Mutex<FftPlanner<f32>>,
}

impl SpectrumAnalyzer {
    /// `max_fft_size` bounds how many of the most recent samples are analysed.
    pub fn new(max_fft_size: usize) -> Self {
        Self {
            max_fft_size: max_fft_size.max(MIN_FFT_SIZE).next_power_of_two(),
            planner: Mutex::new(FftPlanner::new()),
        }
    }

    /// Compute `bars_count` magnitudes for `window`.
    ///
    /// Returns zeros when the window is missing or empty.
    pub fn compute_bars(&self, window: Option<&[f32]>, bars_count: usize) -> Vec<f32> {
        let mut bars = vec![0.0f32; bars_count];
        let Some(window) = window.filter(|w| !w.is_empty()) else {
            return bars;
        };
        if bars_count == 0 {
            return bars;
        }

        let fft_size = window
            .len()
            .next_power_of_two()
            .clamp(MIN_FFT_SIZE, self.max_fft_size);
        let recent = &window[window.len().saturating_sub(fft_size)..];
        let fft = self.plan(fft_size);

        let taper = hann(recent.len());
        let mut buffer: Vec<Complex<f32>> = recent
            .iter()
            .zip(taper.iter())
            .map(|(sample, w)| Complex::new(sample * w, 0.0))
            .collect();
        buffer.resize(fft_size, Complex::new(0.0, 0.0));
        fft.process(&mut buffer);

        let num_bins = fft_size / 2;
        let magnitudes: Vec<f32> = buffer[..num_bins]
            .iter()
            .map(|c| c.norm() / fft_size as f32)
            .collect();

        for (bar, (lo, hi)) in bars.iter_mut().zip(band_edges(num_bins, bars_count)) {
            let band = &magnitudes[lo..hi];
            *bar = band.iter().sum::<f32>() / band.len() as f32;
        }
        bars
    }

    fn plan(&self, size: usize) -> Arc<dyn Fft<f32>> {
        self.planner.lock().unwrap().plan_fft_forward(size)
    }
}

fn hann(len: usize) -> Vec<f32> {
    if len < 2 {
        return vec![1.0; len];
    }
    (0..len)
        .map(|i| {
            let phase = 2.0 * std::f32::consts::PI * i as f32 / (len - 1) as f32;
            0.5 - 0.5 * phase.cos()
        })
        .collect()
}

/// Split bins `1..num_bins` (DC excluded) into `bands` log-spaced `[lo, hi)` ranges.
///
/// Each range holds at least one bin. When there are more bands than bins,
/// neighbouring bands share bins.
fn band_edges(num_bins: usize, bands: usize) -> Vec<(usize, usize)> {
    debug_assert!(num_bins >= 2);
    let span = num_bins as f32;
    (0..bands)
        .map(|i| {
            let start = span.powf(i as f32 / bands as f32);
            let end = span.powf((i + 1) as f32 / bands as f32);
            let lo = (start.floor() as usize).clamp(1, num_bins - 1);
            let hi = (end.floor() as usize).clamp(lo + 1, num_bins);
            (lo, hi)
        })
        .collect()
}
