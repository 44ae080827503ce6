//! Player runtime helpers.
//!
//! Provides device enumeration and the interactive `play` loop: commands come
//! from stdin, engine events are logged, and an optional spectrum meter is
//! redrawn while output is flowing.

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, never, select, tick};

use fft_player::{AssetAcquirer, CpalOutput, FileAssetReader, PlaybackEngine, device};
use fft_player_types::{EngineState, PlayerEvent};

use crate::config::PlayOptions;

const METER_INTERVAL: Duration = Duration::from_millis(100);
const METER_LEVELS: &[char] = &[' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
/// Meter scale floor so near-silence does not fill the bars.
const METER_MIN_PEAK: f32 = 0.01;

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    for dev in device::list_devices(&host)? {
        let marker = if dev.is_default { "*" } else { " " };
        if dev.min_rate == dev.max_rate {
            println!("{marker} {} ({} Hz)", dev.name, dev.max_rate);
        } else {
            println!("{marker} {} ({}-{} Hz)", dev.name, dev.min_rate, dev.max_rate);
        }
    }
    Ok(())
}

/// Commands accepted on stdin while playing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UserCommand {
    Play,
    Stop,
    Next,
    Previous,
    Seek(f32),
    Status,
    Quit,
}

/// Parse one stdin line; `None` for blank or unknown input.
pub fn parse_command(line: &str) -> Option<UserCommand> {
    let mut parts = line.split_whitespace();
    let cmd = parts.next()?;
    let command = match cmd {
        "g" | "play" => UserCommand::Play,
        "s" | "stop" => UserCommand::Stop,
        "n" | "next" => UserCommand::Next,
        "p" | "prev" | "previous" => UserCommand::Previous,
        "i" | "status" => UserCommand::Status,
        "q" | "quit" => UserCommand::Quit,
        "seek" => {
            let position = parts.next()?.parse::<f32>().ok()?;
            UserCommand::Seek(position)
        }
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(command)
}

/// Play the queued assets until the queue finishes, `q` is read, or Ctrl-C.
pub fn run_play(opts: PlayOptions, install_ctrlc: bool) -> Result<()> {
    let acquirer = AssetAcquirer::new(Arc::new(FileAssetReader), opts.player.acquire.clone())?;
    let output = CpalOutput::new(opts.player.device.clone(), opts.player.playback.clone());
    let engine = PlaybackEngine::new(acquirer, Box::new(output), &opts.player.spectrum);
    let events = engine.subscribe();

    let (quit_tx, quit_rx) = crossbeam_channel::bounded::<()>(1);
    if install_ctrlc {
        ctrlc::set_handler(move || {
            let _ = quit_tx.try_send(());
        })
        .context("install Ctrl-C handler")?;
    }

    tracing::info!(
        tracks = opts.assets.len(),
        random = opts.random,
        circle = opts.circle,
        cache_dir = ?opts.player.acquire.cache_dir,
        "starting playback"
    );
    engine.set_random(opts.random);
    engine.set_circle(opts.circle);
    engine.set_queue(opts.assets);
    engine.play();

    let mut lines = spawn_stdin_reader();
    let meter = if opts.bars > 0 {
        tick(METER_INTERVAL)
    } else {
        never()
    };

    loop {
        select! {
            recv(quit_rx) -> _ => {
                tracing::info!("interrupted");
                break;
            }
            recv(lines) -> line => match line {
                Ok(line) => match parse_command(&line) {
                    Some(UserCommand::Quit) => break,
                    Some(command) => apply(&engine, command),
                    None if line.trim().is_empty() => {}
                    None => eprintln!("unknown command: {}", line.trim()),
                },
                Err(_) => {
                    tracing::debug!("stdin closed; playing until the queue ends");
                    lines = never();
                }
            },
            recv(events) -> event => {
                let Ok(event) = event else {
                    break;
                };
                log_event(&event);
                if queue_finished(&engine, &event) {
                    tracing::info!("queue finished");
                    break;
                }
            }
            recv(meter) -> _ => {
                let spectrum = engine.compute_spectrum_bars(opts.bars);
                if spectrum.valid {
                    let mut out = std::io::stdout().lock();
                    let _ = write!(out, "\r{}", render_bars(&spectrum.bars));
                    let _ = out.flush();
                }
            }
        }
    }

    if opts.bars > 0 {
        println!();
    }
    engine.shutdown();
    Ok(())
}

fn apply(engine: &PlaybackEngine, command: UserCommand) {
    match command {
        UserCommand::Play => engine.play(),
        UserCommand::Stop => engine.stop(),
        UserCommand::Next => engine.next(),
        UserCommand::Previous => engine.previous(),
        UserCommand::Seek(position) => engine.seek(position),
        UserCommand::Status => match serde_json::to_string_pretty(&engine.status()) {
            Ok(json) => println!("{json}"),
            Err(e) => tracing::warn!("status encode failed: {e}"),
        },
        UserCommand::Quit => {}
    }
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn log_event(event: &PlayerEvent) {
    match event {
        PlayerEvent::DrmBlocked { asset } => {
            tracing::warn!(asset = %asset.display_name(), "copy-protected; skipped")
        }
        PlayerEvent::CopyStarted { asset } => {
            tracing::info!(asset = %asset.display_name(), "copying")
        }
        PlayerEvent::CopyProgress { asset, progress } => {
            tracing::debug!(asset = %asset.id, progress, "copy progress")
        }
        PlayerEvent::CopyStopped { asset } => {
            tracing::info!(asset = %asset.display_name(), "copy stopped")
        }
        PlayerEvent::CopyFailed { asset, error } => {
            tracing::warn!(asset = %asset.display_name(), %error, "copy failed")
        }
        PlayerEvent::StateChanged { state } => tracing::info!(?state, "state"),
    }
}

/// The engine went idle because the cursor ran off the end of the queue.
fn queue_finished(engine: &PlaybackEngine, event: &PlayerEvent) -> bool {
    matches!(
        event,
        PlayerEvent::StateChanged {
            state: EngineState::Idle
        }
    ) && engine.current_item().is_none()
}

/// One block character per bar, scaled to the loudest bar.
fn render_bars(bars: &[f32]) -> String {
    let peak = bars.iter().copied().fold(METER_MIN_PEAK, f32::max);
    let top = METER_LEVELS.len() - 1;
    bars.iter()
        .map(|bar| {
            let level = (bar / peak).clamp(0.0, 1.0);
            METER_LEVELS[(level * top as f32).round() as usize]
        })
        .collect()
}
