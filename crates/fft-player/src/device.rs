//! Output device discovery and selection.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Output device metadata for the `devices` listing.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub min_rate: u32,
    pub max_rate: u32,
    pub is_default: bool,
}

/// Pick the first output device whose name contains `needle` (case-insensitive),
/// or the host default device.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let found = host
            .output_devices()
            .context("No output devices")?
            .find(|d| {
                d.description()
                    .map(|desc| matches_device_name(&desc.name(), needle))
                    .unwrap_or(false)
            });
        return found.ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose the output config closest to `target_rate`.
///
/// Prefers the highest supported rate that is not above the target, then the
/// lowest rate above it; among equal rates, prefers float formats.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
) -> Result<cpal::SupportedStreamConfig> {
    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;
    for range in device.supported_output_configs()? {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let candidate = Candidate {
            below: target_rate.is_none_or(|t| rate <= t),
            rate,
            format_rank: sample_format_rank(range.sample_format()),
        };
        if best.as_ref().is_none_or(|(b, _)| candidate.is_better_than(b)) {
            best = Some((candidate, range.with_sample_rate(rate)));
        }
    }
    best.map(|(_, cfg)| cfg)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Largest fixed buffer the device advertises, capped at 16384 frames.
///
/// Returns `None` when the device only supports its default buffer size.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    const MAX_FRAMES: u32 = 16_384;
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            Some(cpal::BufferSize::Fixed((*max).min(MAX_FRAMES).max(*min)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Output devices of `host` with their supported rate span.
pub fn list_devices(host: &cpal::Host) -> Result<Vec<DeviceInfo>> {
    let default_name = host
        .default_output_device()
        .and_then(|d| d.description().ok())
        .map(|d| d.name().to_string());
    let mut out = Vec::new();
    for device in host.output_devices().context("No output devices")? {
        let name = device.description()?.name().to_string();
        let (mut min_rate, mut max_rate) = (u32::MAX, 0u32);
        if let Ok(ranges) = device.supported_output_configs() {
            for r in ranges {
                min_rate = min_rate.min(r.min_sample_rate());
                max_rate = max_rate.max(r.max_sample_rate());
            }
        }
        if max_rate == 0 {
            match device.default_output_config() {
                Ok(cfg) => {
                    min_rate = cfg.sample_rate();
                    max_rate = cfg.sample_rate();
                }
                Err(e) => {
                    tracing::debug!(device = %name, error = %e, "skipping device without configs");
                    continue;
                }
            }
        }
        out.push(DeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            min_rate,
            max_rate,
        });
    }
    Ok(out)
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    below: bool,
    rate: u32,
    format_rank: u8,
}

impl Candidate {
    fn is_better_than(&self, other: &Candidate) -> bool {
        if self.below != other.below {
            self.below
        } else if self.rate != other.rate {
            if self.below {
                self.rate > other.rate
            } else {
                self.rate < other.rate
            }
        } else {
            self.format_rank < other.format_rank
        }
    }
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(target) => target.clamp(min, max.max(min)),
        None => max,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
