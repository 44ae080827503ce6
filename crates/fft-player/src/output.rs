//! Output sessions: decode + play one local copy on a background thread.
//!
//! [`OutputBackend`] is the seam between the engine and the audio device. The
//! engine opens one session per play/seek and tears it down on stop; the
//! session reports its natural end (or failure) through an [`EndNotifier`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;

use fft_player_types::PlaybackEndReason;

use crate::acquire::LocalSource;
use crate::config::PlaybackConfig;
use crate::frames::FrameWindow;
use crate::pipeline::{self, PipelineEnd, SessionTaps};
use crate::status::{SharedStatus, played_frames_from_seek};
use crate::{decode, device};

/// End-of-session message delivered to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionEnd {
    pub session: u64,
    pub reason: PlaybackEndReason,
}

/// Reports how a session ended, tagged with its id.
#[derive(Clone)]
pub struct EndNotifier {
    session: u64,
    tx: Sender<SessionEnd>,
}

impl EndNotifier {
    pub fn new(session: u64, tx: Sender<SessionEnd>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn notify(&self, reason: PlaybackEndReason) {
        let _ = self.tx.send(SessionEnd {
            session: self.session,
            reason,
        });
    }
}

/// Publishes session details into the engine status while the session is current.
#[derive(Clone)]
pub struct SessionProgress {
    session: u64,
    active: Arc<AtomicU64>,
    status: SharedStatus,
}

impl SessionProgress {
    pub fn new(session: u64, active: Arc<AtomicU64>, status: SharedStatus) -> Self {
        Self {
            session,
            active,
            status,
        }
    }

    pub fn is_current(&self) -> bool {
        self.active.load(Ordering::Relaxed) == self.session
    }

    /// Record stream details once output is wired up.
    pub fn started(
        &self,
        sample_rate: u32,
        duration_ms: Option<u64>,
        codec: Option<String>,
        played_frames: Arc<AtomicU64>,
    ) {
        if !self.is_current() {
            return;
        }
        let mut s = self.status.lock().unwrap();
        s.sample_rate = Some(sample_rate);
        s.duration_ms = duration_ms;
        s.source_codec = codec;
        s.played_frames = Some(played_frames);
    }
}

/// Everything a session needs from the engine.
pub struct OutputContext {
    /// Receives the mono mix of what is being output.
    pub frames: Arc<FrameWindow>,
    pub progress: SessionProgress,
    pub end: EndNotifier,
}

/// A live output session.
pub trait OutputSession: Send {
    /// Stop output and wait until the device is released.
    fn stop(self: Box<Self>);
}

/// Opens output sessions for local copies.
pub trait OutputBackend: Send + 'static {
    /// Start playing `source` from `position` (fraction of the duration).
    ///
    /// Returns once the session is running; failures after that are reported
    /// through `ctx.end` as [`PlaybackEndReason::Error`].
    fn open(
        &mut self,
        source: &LocalSource,
        position: f32,
        ctx: OutputContext,
    ) -> Result<Box<dyn OutputSession>>;
}

/// CPAL/Symphonia output on a selectable device.
pub struct CpalOutput {
    device: Option<String>,
    playback: PlaybackConfig,
}

impl CpalOutput {
    pub fn new(device: Option<String>, playback: PlaybackConfig) -> Self {
        Self { device, playback }
    }
}

struct CpalSession {
    cancel: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl OutputSession for CpalSession {
    fn stop(mut self: Box<Self>) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl OutputBackend for CpalOutput {
    fn open(
        &mut self,
        source: &LocalSource,
        position: f32,
        ctx: OutputContext,
    ) -> Result<Box<dyn OutputSession>> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_for_thread = cancel.clone();
        let device_name = self.device.clone();
        let playback = effective_playback_for_seek(&self.playback, position);
        let source = source.clone();

        let join = std::thread::Builder::new()
            .name(format!("fft-output-{}", ctx.end.session()))
            .spawn(move || {
                let session = ctx.end.session();
                let result = play_session(
                    device_name.as_deref(),
                    &playback,
                    &source,
                    position,
                    &ctx,
                    cancel_for_thread,
                );
                match result {
                    Ok(PipelineEnd::Drained) => ctx.end.notify(PlaybackEndReason::Eof),
                    Ok(PipelineEnd::Cancelled) => {
                        tracing::debug!(session, "output session cancelled");
                    }
                    Err(e) => {
                        tracing::warn!(session, "playback error: {e:#}");
                        ctx.end.notify(PlaybackEndReason::Error);
                    }
                }
            })
            .context("spawn output thread")?;

        Ok(Box::new(CpalSession {
            cancel,
            join: Some(join),
        }))
    }
}

/// Decode and play `source` on the selected device until it drains or is cancelled.
fn play_session(
    device_name: Option<&str>,
    playback: &PlaybackConfig,
    source: &LocalSource,
    position: f32,
    ctx: &OutputContext,
    cancel: Arc<AtomicBool>,
) -> Result<PipelineEnd> {
    let decoded = decode::start_decode(source, position, playback.buffer_seconds)
        .with_context(|| format!("decode {:?}", source.path))?;

    let host = cpal::default_host();
    let device = device::pick_device(&host, device_name)?;
    let config = device::pick_output_config(&device, Some(decoded.spec.rate))?;
    let mut stream_config: cpal::StreamConfig = config.clone().into();
    if let Some(buf) = device::pick_buffer_size(&config) {
        stream_config.buffer_size = buf;
    }

    let played_frames = Arc::new(AtomicU64::new(played_frames_from_seek(
        decoded.start_ms,
        decoded.duration_ms,
        stream_config.sample_rate,
    )));
    ctx.frames.reset();
    ctx.progress.started(
        stream_config.sample_rate,
        decoded.duration_ms,
        decoded.codec.clone(),
        played_frames.clone(),
    );
    tracing::info!(
        asset = %source.asset_id,
        start_ms = decoded.start_ms,
        duration_ms = ?decoded.duration_ms,
        src_rate = decoded.spec.rate,
        out_rate = stream_config.sample_rate,
        "output session started"
    );

    let end = pipeline::play_decoded_source(
        &device,
        &config,
        &stream_config,
        playback,
        &decoded,
        SessionTaps {
            played_frames,
            frames: ctx.frames.clone(),
            cancel,
        },
    )?;
    if end == PipelineEnd::Drained && decoded.failed.load(Ordering::Relaxed) {
        anyhow::bail!("decoder stopped early");
    }
    Ok(end)
}

/// Smaller buffers after a seek so output resumes quickly.
fn effective_playback_for_seek(playback: &PlaybackConfig, position: f32) -> PlaybackConfig {
    let mut eff = playback.clone();
    if position > 0.0 {
        eff.buffer_seconds = eff.buffer_seconds.min(1.0);
        eff.refill_max_frames = eff.refill_max_frames.min(2048);
        eff.chunk_frames = eff.chunk_frames.min(1024);
    }
    eff
}
