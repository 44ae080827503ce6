//! Playback engine: queue traversal, acquisition, and output sessions.
//!
//! Every public operation is sent to a single worker thread and acknowledged,
//! so operations are applied one at a time in call order. The worker also
//! listens to the in-flight acquisition and to output end notifications.
//! Spectrum queries run on the caller's thread against a snapshot of the
//! frame window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, never, select};

use fft_player_types::{
    AssetDescriptor, EngineState, PlaybackEndReason, PlayerEvent, PlayerStatus, SpectrumBars,
};

use crate::acquire::{AcquisitionEvent, AcquisitionHandle, AssetAcquirer, LocalSource};
use crate::config::SpectrumConfig;
use crate::events::EventBus;
use crate::frames::FrameWindow;
use crate::output::{
    EndNotifier, OutputBackend, OutputContext, OutputSession, SessionEnd, SessionProgress,
};
use crate::queue::PlaybackQueue;
use crate::spectrum::SpectrumAnalyzer;
use crate::status::{EngineStatusState, SharedStatus};

#[derive(Debug)]
enum Command {
    SetQueue(Vec<AssetDescriptor>),
    SetRandom(bool),
    SetCircle(bool),
    Play,
    Stop,
    Next,
    Previous,
    Seek(f32),
    Shutdown,
}

struct Request {
    command: Command,
    ack: Sender<()>,
}

/// Handle to the playback engine. Dropping it shuts the engine down.
pub struct PlaybackEngine {
    cmd_tx: Sender<Request>,
    status: SharedStatus,
    frames: Arc<FrameWindow>,
    analyzer: SpectrumAnalyzer,
    events: EventBus,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackEngine {
    pub fn new(
        acquirer: AssetAcquirer,
        backend: Box<dyn OutputBackend>,
        spectrum: &SpectrumConfig,
    ) -> Self {
        Self::with_queue(acquirer, backend, spectrum, PlaybackQueue::new())
    }

    /// Engine with a caller-provided queue (for example a seeded one).
    pub fn with_queue(
        acquirer: AssetAcquirer,
        backend: Box<dyn OutputBackend>,
        spectrum: &SpectrumConfig,
        queue: PlaybackQueue,
    ) -> Self {
        let status = EngineStatusState::shared();
        let frames = Arc::new(FrameWindow::new(spectrum.fft_size));
        let events = EventBus::new();
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (end_tx, end_rx) = crossbeam_channel::unbounded();

        {
            let mut s = status.lock().unwrap();
            s.random = queue.is_random();
            s.circle = queue.is_circle();
            s.queue_len = queue.len();
            s.current = queue.current().cloned();
        }

        let worker = Worker {
            queue,
            acquirer,
            backend,
            status: status.clone(),
            frames: frames.clone(),
            events: events.clone(),
            acquisition: None,
            session: None,
            active_session: Arc::new(AtomicU64::new(0)),
            last_session: 0,
            end_tx,
            state: EngineState::Idle,
            played: false,
            seek_position: 0.0,
        };
        let join = std::thread::spawn(move || worker.run(cmd_rx, end_rx));

        Self {
            cmd_tx,
            status,
            frames,
            analyzer: SpectrumAnalyzer::new(spectrum.fft_size),
            events,
            worker: Mutex::new(Some(join)),
        }
    }

    /// Replace the queue; the cursor moves to the first asset.
    pub fn set_queue(&self, assets: Vec<AssetDescriptor>) {
        self.request(Command::SetQueue(assets));
    }

    pub fn set_random(&self, random: bool) {
        self.request(Command::SetRandom(random));
    }

    pub fn set_circle(&self, circle: bool) {
        self.request(Command::SetCircle(circle));
    }

    /// Play the current asset, acquiring a local copy first when needed.
    pub fn play(&self) {
        self.request(Command::Play);
    }

    pub fn stop(&self) {
        self.request(Command::Stop);
    }

    pub fn next(&self) {
        self.request(Command::Next);
    }

    pub fn previous(&self) {
        self.request(Command::Previous);
    }

    /// Restart output at `position` (clamped to `[0.0, 1.0]`); ignored unless playing.
    pub fn seek(&self, position: f32) {
        self.request(Command::Seek(position));
    }

    pub fn current_item(&self) -> Option<AssetDescriptor> {
        self.status.lock().unwrap().current.clone()
    }

    pub fn is_played(&self) -> bool {
        self.status.lock().unwrap().played
    }

    pub fn is_random(&self) -> bool {
        self.status.lock().unwrap().random
    }

    pub fn is_circle(&self) -> bool {
        self.status.lock().unwrap().circle
    }

    pub fn state(&self) -> EngineState {
        self.status.lock().unwrap().state
    }

    pub fn status(&self) -> PlayerStatus {
        self.status.lock().unwrap().snapshot()
    }

    /// Subscribe to engine events published from now on.
    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    /// `bars_count` magnitudes of the audio currently being output.
    ///
    /// `valid` is false (and the bars are zero) unless output is flowing.
    pub fn compute_spectrum_bars(&self, bars_count: usize) -> SpectrumBars {
        let window = if self.state() == EngineState::Playing {
            self.frames.snapshot()
        } else {
            None
        };
        SpectrumBars {
            valid: bars_count > 0 && window.is_some(),
            bars: self.analyzer.compute_bars(window.as_deref(), bars_count),
        }
    }

    /// Stop everything and join the worker. Later operations are no-ops.
    pub fn shutdown(&self) {
        self.request(Command::Shutdown);
        if let Some(join) = self.worker.lock().unwrap().take() {
            let _ = join.join();
        }
    }

    fn request(&self, command: Command) {
        let (ack, done) = crossbeam_channel::bounded(1);
        if self.cmd_tx.send(Request { command, ack }).is_err() {
            return;
        }
        let _ = done.recv();
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ActiveSession {
    id: u64,
    asset: AssetDescriptor,
    source: LocalSource,
    output: Box<dyn OutputSession>,
}

struct Worker {
    queue: PlaybackQueue,
    acquirer: AssetAcquirer,
    backend: Box<dyn OutputBackend>,
    status: SharedStatus,
    frames: Arc<FrameWindow>,
    events: EventBus,
    acquisition: Option<AcquisitionHandle>,
    session: Option<ActiveSession>,
    /// Id of the live session, `0` when none; read by session threads.
    active_session: Arc<AtomicU64>,
    last_session: u64,
    end_tx: Sender<SessionEnd>,
    state: EngineState,
    played: bool,
    seek_position: f32,
}

impl Worker {
    fn run(mut self, cmd_rx: Receiver<Request>, end_rx: Receiver<SessionEnd>) {
        loop {
            let acquisition_rx = self
                .acquisition
                .as_ref()
                .map(|h| h.events().clone())
                .unwrap_or_else(never);
            select! {
                recv(cmd_rx) -> msg => {
                    let Ok(Request { command, ack }) = msg else {
                        break;
                    };
                    let shutdown = matches!(command, Command::Shutdown);
                    self.handle(command);
                    self.publish_status();
                    let _ = ack.send(());
                    if shutdown {
                        break;
                    }
                }
                recv(acquisition_rx) -> event => {
                    match event {
                        Ok(event) => self.on_acquisition_event(event),
                        Err(_) => self.on_acquisition_lost(),
                    }
                    self.publish_status();
                }
                recv(end_rx) -> end => {
                    if let Ok(end) = end {
                        self.on_session_end(end);
                        self.publish_status();
                    }
                }
            }
        }
        tracing::debug!("engine worker exiting");
    }

    fn handle(&mut self, command: Command) {
        tracing::debug!(?command, state = ?self.state, "engine command");
        match command {
            Command::SetQueue(assets) => self.set_queue(assets),
            Command::SetRandom(random) => self.queue.set_random(random),
            Command::SetCircle(circle) => self.queue.set_circle(circle),
            Command::Play => self.play(),
            Command::Stop => self.stop(),
            Command::Next => self.step(true),
            Command::Previous => self.step(false),
            Command::Seek(position) => self.seek(position),
            Command::Shutdown => {
                self.cancel_acquisition();
                self.teardown_session(PlaybackEndReason::Stopped);
                self.played = false;
            }
        }
    }

    fn set_queue(&mut self, assets: Vec<AssetDescriptor>) {
        self.queue.set_assets(assets);
        let current = self.queue.current().cloned();
        if self
            .acquisition
            .as_ref()
            .is_some_and(|h| Some(h.asset()) != current.as_ref())
        {
            self.cancel_acquisition();
            self.set_state(EngineState::Idle);
        }
        if self
            .session
            .as_ref()
            .is_some_and(|s| Some(&s.asset) != current.as_ref())
        {
            self.teardown_session(PlaybackEndReason::Stopped);
            self.played = false;
            self.set_state(EngineState::Stopped);
        }
    }

    fn play(&mut self) {
        if matches!(self.state, EngineState::Playing | EngineState::Acquiring) {
            tracing::debug!(state = ?self.state, "play ignored");
            return;
        }
        let Some(asset) = self.queue.current().cloned() else {
            tracing::debug!("play ignored: nothing queued");
            return;
        };
        self.start_asset(asset);
    }

    fn stop(&mut self) {
        if !matches!(self.state, EngineState::Playing | EngineState::Acquiring) {
            tracing::debug!(state = ?self.state, "stop ignored");
            return;
        }
        self.cancel_acquisition();
        self.teardown_session(PlaybackEndReason::Stopped);
        self.played = false;
        self.set_state(EngineState::Stopped);
    }

    /// `next` (forward) or `previous` (backward).
    fn step(&mut self, forward: bool) {
        self.cancel_acquisition();
        self.teardown_session(PlaybackEndReason::Stopped);
        self.played = false;
        let target = if forward {
            self.queue.advance().cloned()
        } else {
            self.queue.retreat().cloned()
        };
        match target {
            Some(asset) => self.start_asset(asset),
            None => {
                tracing::info!("queue exhausted");
                self.set_state(EngineState::Idle);
            }
        }
    }

    fn seek(&mut self, position: f32) {
        if self.state != EngineState::Playing {
            tracing::debug!(state = ?self.state, "seek ignored");
            return;
        }
        let Some(session) = self.session.take() else {
            return;
        };
        let position = if position.is_finite() {
            position.clamp(0.0, 1.0)
        } else {
            0.0
        };
        tracing::info!(asset = %session.asset.id, position, "seek");
        self.active_session.store(0, Ordering::Relaxed);
        session.output.stop();
        self.seek_position = position;
        self.start_output(session.asset, session.source, position);
    }

    /// Play `asset` from its local copy, or start acquiring one.
    fn start_asset(&mut self, asset: AssetDescriptor) {
        self.seek_position = 0.0;
        if let Some(local) = self.acquirer.local_copy(&asset) {
            self.start_output(asset, local, 0.0);
            return;
        }
        tracing::info!(asset = %asset.id, title = %asset.display_name(), "acquiring");
        self.acquisition = Some(self.acquirer.acquire(&asset));
        self.set_state(EngineState::Acquiring);
    }

    fn start_output(&mut self, asset: AssetDescriptor, source: LocalSource, position: f32) {
        self.last_session += 1;
        let id = self.last_session;
        self.active_session.store(id, Ordering::Relaxed);
        self.frames.reset();
        let ctx = OutputContext {
            frames: self.frames.clone(),
            progress: SessionProgress::new(id, self.active_session.clone(), self.status.clone()),
            end: EndNotifier::new(id, self.end_tx.clone()),
        };
        match self.backend.open(&source, position, ctx) {
            Ok(output) => {
                tracing::info!(asset = %asset.id, session = id, position, "playing");
                self.session = Some(ActiveSession {
                    id,
                    asset,
                    source,
                    output,
                });
                self.played = true;
                self.status.lock().unwrap().end_reason = None;
                self.set_state(EngineState::Playing);
            }
            Err(e) => {
                tracing::warn!(asset = %asset.id, "output open failed: {e:#}");
                self.active_session.store(0, Ordering::Relaxed);
                self.played = false;
                self.status.lock().unwrap().end_reason = Some(PlaybackEndReason::Error);
                self.set_state(EngineState::Stopped);
            }
        }
    }

    fn on_acquisition_event(&mut self, event: AcquisitionEvent) {
        let Some(asset) = self.acquisition.as_ref().map(|h| h.asset().clone()) else {
            return;
        };
        match event {
            AcquisitionEvent::Started => {
                self.status.lock().unwrap().acquisition_progress = Some(0.0);
                self.events.copy_started(&asset);
            }
            AcquisitionEvent::Progress(progress) => {
                self.status.lock().unwrap().acquisition_progress = Some(progress);
                self.events.copy_progress(&asset, progress);
            }
            AcquisitionEvent::Succeeded(local) => {
                self.finish_acquisition();
                self.events.copy_stopped(&asset);
                self.start_output(asset, local, 0.0);
            }
            AcquisitionEvent::FailedDrm => {
                self.finish_acquisition();
                self.events.drm_blocked(&asset);
                self.played = false;
                self.set_state(EngineState::Idle);
            }
            AcquisitionEvent::Failed(error) => {
                self.finish_acquisition();
                self.events.copy_failed(&asset, error);
                self.played = false;
                self.set_state(EngineState::Idle);
            }
        }
    }

    /// The acquisition channel closed without a terminal event.
    fn on_acquisition_lost(&mut self) {
        if let Some(handle) = self.acquisition.take() {
            tracing::warn!(asset = %handle.asset().id, "acquisition ended without outcome");
            self.status.lock().unwrap().acquisition_progress = None;
            self.events.copy_stopped(handle.asset());
            self.set_state(EngineState::Idle);
        }
    }

    fn on_session_end(&mut self, end: SessionEnd) {
        if self.session.as_ref().map(|s| s.id) != Some(end.session) {
            tracing::debug!(session = end.session, "ignoring stale session end");
            return;
        }
        tracing::info!(session = end.session, reason = ?end.reason, "output session ended");
        self.teardown_session(end.reason);
        self.played = false;
        match end.reason {
            PlaybackEndReason::Eof => self.step(true),
            PlaybackEndReason::Error | PlaybackEndReason::Stopped => {
                self.set_state(EngineState::Stopped);
            }
        }
    }

    fn finish_acquisition(&mut self) {
        self.acquisition = None;
        self.status.lock().unwrap().acquisition_progress = None;
    }

    fn cancel_acquisition(&mut self) {
        if let Some(handle) = self.acquisition.take() {
            tracing::info!(asset = %handle.asset().id, "acquisition cancelled");
            self.status.lock().unwrap().acquisition_progress = None;
            self.events.copy_stopped(handle.asset());
            handle.cancel();
        }
    }

    fn teardown_session(&mut self, reason: PlaybackEndReason) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.active_session.store(0, Ordering::Relaxed);
        session.output.stop();
        self.frames.reset();
        let mut s = self.status.lock().unwrap();
        s.clear_playback();
        s.end_reason = Some(reason);
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state == state {
            return;
        }
        tracing::info!(from = ?self.state, to = ?state, "engine state");
        self.state = state;
        self.status.lock().unwrap().state = state;
        self.events.state_changed(state);
    }

    fn publish_status(&self) {
        let mut s = self.status.lock().unwrap();
        s.state = self.state;
        s.played = self.played;
        s.current = self.queue.current().cloned();
        s.seek_position = self.seek_position;
        s.random = self.queue.is_random();
        s.circle = self.queue.is_circle();
        s.queue_len = self.queue.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::{AcquireError, AssetReader, OpenedAsset};
    use crate::config::AcquireConfig;
    use std::io::{Cursor, Read};
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(5);

    /// Serves `len` bytes per asset; with a gate, one chunk per permit.
    struct TestReader {
        len: usize,
        gate: Option<Receiver<()>>,
    }

    struct GatedRead {
        inner: Cursor<Vec<u8>>,
        gate: Option<Receiver<()>>,
    }

    impl Read for GatedRead {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if let Some(gate) = &self.gate {
                let _ = gate.recv();
            }
            self.inner.read(buf)
        }
    }

    impl AssetReader for TestReader {
        fn open(&self, asset: &AssetDescriptor) -> Result<OpenedAsset, AcquireError> {
            if asset.drm_protected {
                return Err(AcquireError::DrmBlocked(asset.id.clone()));
            }
            Ok(OpenedAsset {
                reader: Box::new(GatedRead {
                    inner: Cursor::new(vec![0u8; self.len]),
                    gate: self.gate.clone(),
                }),
                byte_len: Some(self.len as u64),
            })
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Opened {
        asset: String,
        position: f32,
    }

    /// Records opens/stops and lets tests end the live session.
    #[derive(Clone, Default)]
    struct FakeOutput {
        opened: Arc<Mutex<Vec<Opened>>>,
        stops: Arc<AtomicU64>,
        notifiers: Arc<Mutex<Vec<EndNotifier>>>,
        fail_open: Arc<std::sync::atomic::AtomicBool>,
    }

    struct FakeSession {
        stops: Arc<AtomicU64>,
    }

    impl OutputSession for FakeSession {
        fn stop(self: Box<Self>) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl OutputBackend for FakeOutput {
        fn open(
            &mut self,
            source: &LocalSource,
            position: f32,
            ctx: OutputContext,
        ) -> anyhow::Result<Box<dyn OutputSession>> {
            if self.fail_open.load(Ordering::SeqCst) {
                anyhow::bail!("no device");
            }
            let tone: Vec<f32> = (0..512)
                .map(|i| (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / 48_000.0).sin())
                .collect();
            ctx.frames.push_interleaved(&tone, 1);
            self.opened.lock().unwrap().push(Opened {
                asset: source.asset_id.as_str().to_string(),
                position,
            });
            self.notifiers.lock().unwrap().push(ctx.end);
            Ok(Box::new(FakeSession {
                stops: self.stops.clone(),
            }))
        }
    }

    impl FakeOutput {
        fn opened(&self) -> Vec<Opened> {
            self.opened.lock().unwrap().clone()
        }

        fn end_latest(&self, reason: PlaybackEndReason) {
            let notifiers = self.notifiers.lock().unwrap();
            notifiers.last().unwrap().notify(reason);
        }
    }

    struct Harness {
        engine: PlaybackEngine,
        output: FakeOutput,
        events: Receiver<PlayerEvent>,
        permits: Option<Sender<()>>,
        _dir: tempfile::TempDir,
    }

    fn harness(gated: bool) -> Harness {
        let (permits, gate) = if gated {
            let (tx, rx) = crossbeam_channel::unbounded();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        harness_with(Arc::new(TestReader { len: 100, gate }), permits)
    }

    fn harness_with(reader: Arc<dyn AssetReader>, permits: Option<Sender<()>>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let acquirer = AssetAcquirer::new(
            reader,
            AcquireConfig {
                cache_dir: dir.path().to_path_buf(),
                copy_chunk_bytes: 10,
                progress_step: 0.0,
                retain_copies: 8,
            },
        )
        .unwrap();
        let output = FakeOutput::default();
        let engine = PlaybackEngine::with_queue(
            acquirer,
            Box::new(output.clone()),
            &SpectrumConfig { fft_size: 512 },
            PlaybackQueue::with_seed(11),
        );
        let events = engine.subscribe();
        Harness {
            engine,
            output,
            events,
            permits,
            _dir: dir,
        }
    }

    fn assets(ids: &[&str]) -> Vec<AssetDescriptor> {
        ids.iter()
            .map(|id| AssetDescriptor::new(*id, format!("Track {id}"), format!("/music/{id}.flac")))
            .collect()
    }

    fn wait_for_state(engine: &PlaybackEngine, state: EngineState) {
        let deadline = Instant::now() + WAIT;
        while engine.state() != state {
            assert!(Instant::now() < deadline, "state {:?} never reached", state);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Collect events until `stop` matches (inclusive).
    fn events_until(rx: &Receiver<PlayerEvent>, stop: impl Fn(&PlayerEvent) -> bool) -> Vec<PlayerEvent> {
        let mut out = Vec::new();
        loop {
            let event = rx.recv_timeout(WAIT).expect("event expected");
            let done = stop(&event);
            out.push(event);
            if done {
                return out;
            }
        }
    }

    fn is_state(state: EngineState) -> impl Fn(&PlayerEvent) -> bool {
        move |e| matches!(e, PlayerEvent::StateChanged { state: s } if *s == state)
    }

    #[test]
    fn empty_queue_play_is_noop() {
        let h = harness(false);
        h.engine.play();
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert!(h.engine.current_item().is_none());
        assert!(!h.engine.is_played());
        let bars = h.engine.compute_spectrum_bars(8);
        assert_eq!(bars.bars, vec![0.0; 8]);
        assert!(!bars.valid);
        assert!(h.events.try_recv().is_err());
    }

    #[test]
    fn play_acquires_then_plays() {
        let h = harness(false);
        h.engine.set_queue(assets(&["a", "b"]));
        h.engine.play();
        let events = events_until(&h.events, is_state(EngineState::Playing));

        assert!(matches!(events[0], PlayerEvent::StateChanged { state: EngineState::Acquiring }));
        assert!(matches!(&events[1], PlayerEvent::CopyStarted { asset } if asset.id.as_str() == "a"));
        let progress: Vec<f32> = events
            .iter()
            .filter_map(|e| match e {
                PlayerEvent::CopyProgress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last(), Some(&1.0));
        assert!(events.iter().any(|e| matches!(e, PlayerEvent::CopyStopped { .. })));

        assert!(h.engine.is_played());
        assert_eq!(h.engine.current_item().unwrap().id.as_str(), "a");
        assert_eq!(
            h.output.opened(),
            vec![Opened {
                asset: "a".into(),
                position: 0.0
            }]
        );
    }

    #[test]
    fn play_is_idempotent() {
        let h = harness(false);
        h.engine.set_queue(assets(&["a"]));
        h.engine.play();
        wait_for_state(&h.engine, EngineState::Playing);
        h.engine.play();
        h.engine.play();
        assert_eq!(h.output.opened().len(), 1);
        assert_eq!(h.engine.state(), EngineState::Playing);
    }

    #[test]
    fn play_while_acquiring_is_noop() {
        let h = harness(true);
        h.engine.set_queue(assets(&["a"]));
        h.engine.play();
        h.engine.play();
        assert_eq!(h.engine.state(), EngineState::Acquiring);
        drop(h.permits);
        wait_for_state(&h.engine, EngineState::Playing);
        assert_eq!(h.output.opened().len(), 1);
    }

    #[test]
    fn stop_is_idempotent() {
        let h = harness(false);
        h.engine.set_queue(assets(&["a"]));
        h.engine.play();
        wait_for_state(&h.engine, EngineState::Playing);
        h.engine.stop();
        h.engine.stop();
        assert_eq!(h.engine.state(), EngineState::Stopped);
        assert!(!h.engine.is_played());
        assert_eq!(h.output.stops.load(Ordering::SeqCst), 1);
        assert_eq!(h.engine.status().end_reason, Some(PlaybackEndReason::Stopped));
        let stopped = h
            .events
            .try_iter()
            .filter(|e| is_state(EngineState::Stopped)(e))
            .count();
        assert_eq!(stopped, 1);
    }

    #[test]
    fn stop_from_idle_is_noop() {
        let h = harness(false);
        h.engine.set_queue(assets(&["a"]));
        h.engine.stop();
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert!(h.events.try_recv().is_err());
    }

    #[test]
    fn sequential_queue_exhausts_to_idle() {
        let h = harness(false);
        h.engine.set_queue(assets(&["a", "b", "c"]));
        h.engine.play();
        wait_for_state(&h.engine, EngineState::Playing);
        for expected in ["b", "c"] {
            h.engine.next();
            wait_for_state(&h.engine, EngineState::Playing);
            assert_eq!(h.engine.current_item().unwrap().id.as_str(), expected);
        }
        h.engine.next();
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert!(h.engine.current_item().is_none());
        assert!(!h.engine.is_played());
        let ids: Vec<String> = h.output.opened().into_iter().map(|o| o.asset).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn previous_replays_from_local_copy() {
        let h = harness(false);
        h.engine.set_queue(assets(&["a", "b"]));
        h.engine.play();
        wait_for_state(&h.engine, EngineState::Playing);
        h.engine.next();
        wait_for_state(&h.engine, EngineState::Playing);
        h.engine.previous();
        // "a" is already local, so output starts without acquiring.
        assert_eq!(h.engine.state(), EngineState::Playing);
        assert_eq!(h.engine.current_item().unwrap().id.as_str(), "a");
        assert_eq!(h.output.opened().len(), 3);
    }

    #[test]
    fn drm_asset_is_blocked_and_never_plays() {
        let h = harness(false);
        h.engine
            .set_queue(vec![AssetDescriptor::new("p", "Protected", "/music/p.m4p").with_drm(true)]);
        h.engine.play();
        let events = events_until(&h.events, is_state(EngineState::Idle));
        assert!(events.iter().any(|e| matches!(e, PlayerEvent::DrmBlocked { asset } if asset.id.as_str() == "p")));
        assert!(!events.iter().any(|e| is_state(EngineState::Playing)(e)));
        assert!(!events.iter().any(|e| matches!(e, PlayerEvent::CopyStopped { .. })));
        assert!(!h.engine.is_played());
        assert!(h.output.opened().is_empty());
        // Retry is allowed and fails the same way.
        h.engine.play();
        let events = events_until(&h.events, is_state(EngineState::Idle));
        assert!(events.iter().any(|e| matches!(e, PlayerEvent::DrmBlocked { .. })));
    }

    #[test]
    fn stop_during_acquisition_cancels_copy() {
        let h = harness(true);
        let permits = h.permits.clone().unwrap();
        h.engine.set_queue(assets(&["a"]));
        h.engine.play();
        for _ in 0..4 {
            permits.send(()).unwrap();
        }
        let events = events_until(&h.events, |e| {
            matches!(e, PlayerEvent::CopyProgress { progress, .. } if *progress >= 0.4)
        });
        assert!(events.iter().any(|e| matches!(e, PlayerEvent::CopyStarted { .. })));

        h.engine.stop();
        assert_eq!(h.engine.state(), EngineState::Stopped);
        assert!(!h.engine.is_played());
        drop(permits);
        drop(h.permits);

        let rest = events_until(&h.events, is_state(EngineState::Stopped));
        assert!(rest.iter().any(|e| matches!(e, PlayerEvent::CopyStopped { .. })));
        std::thread::sleep(Duration::from_millis(100));
        let later: Vec<PlayerEvent> = h.events.try_iter().collect();
        assert!(later.is_empty(), "unexpected events after cancel: {later:?}");
        assert!(h.output.opened().is_empty());
        assert_eq!(h.engine.status().acquisition_progress, None);
    }

    fn event_asset(event: &PlayerEvent) -> Option<&str> {
        match event {
            PlayerEvent::DrmBlocked { asset }
            | PlayerEvent::CopyStarted { asset }
            | PlayerEvent::CopyProgress { asset, .. }
            | PlayerEvent::CopyStopped { asset }
            | PlayerEvent::CopyFailed { asset, .. } => Some(asset.id.as_str()),
            PlayerEvent::StateChanged { .. } => None,
        }
    }

    #[test]
    fn next_during_acquisition_switches_to_next_asset() {
        let h = harness(true);
        let permits = h.permits.clone().unwrap();
        h.engine.set_queue(assets(&["a", "b"]));
        h.engine.play();
        for _ in 0..4 {
            permits.send(()).unwrap();
        }
        events_until(&h.events, |e| {
            matches!(e, PlayerEvent::CopyProgress { progress, .. } if *progress >= 0.4)
        });

        h.engine.next();
        assert_eq!(h.engine.state(), EngineState::Acquiring);
        assert_eq!(h.engine.current_item().unwrap().id.as_str(), "b");
        drop(permits);
        drop(h.permits);

        let rest = events_until(&h.events, is_state(EngineState::Playing));
        assert!(matches!(&rest[0], PlayerEvent::CopyStopped { asset } if asset.id.as_str() == "a"));
        assert!(
            rest[1..].iter().all(|e| event_asset(e) != Some("a")),
            "events for a after next: {rest:?}"
        );
        assert!(rest.iter().any(|e| matches!(e, PlayerEvent::CopyStarted { asset } if asset.id.as_str() == "b")));
        assert_eq!(
            h.output.opened(),
            vec![Opened {
                asset: "b".into(),
                position: 0.0
            }]
        );
    }

    struct CrashingReader;

    impl AssetReader for CrashingReader {
        fn open(&self, _asset: &AssetDescriptor) -> Result<OpenedAsset, AcquireError> {
            panic!("reader crashed");
        }
    }

    #[test]
    fn crashed_copy_returns_engine_to_idle() {
        let h = harness_with(Arc::new(CrashingReader), None);
        h.engine.set_queue(assets(&["a"]));
        h.engine.play();
        let events = events_until(&h.events, is_state(EngineState::Idle));
        assert!(events.iter().any(|e| matches!(e, PlayerEvent::CopyStopped { .. })));
        assert!(!h.engine.is_played());
        assert_eq!(h.engine.status().acquisition_progress, None);
        assert!(h.output.opened().is_empty());
    }

    #[test]
    fn zero_bars_are_never_valid() {
        let h = harness(false);
        h.engine.set_queue(assets(&["a"]));
        h.engine.play();
        wait_for_state(&h.engine, EngineState::Playing);
        let bars = h.engine.compute_spectrum_bars(0);
        assert!(bars.bars.is_empty());
        assert!(!bars.valid);
        assert!(h.engine.compute_spectrum_bars(4).valid);
    }

    #[test]
    fn seek_restarts_output_at_clamped_position() {
        let h = harness(false);
        h.engine.set_queue(assets(&["a"]));
        h.engine.seek(0.5);
        assert!(h.output.opened().is_empty());

        h.engine.play();
        wait_for_state(&h.engine, EngineState::Playing);
        h.engine.seek(0.25);
        h.engine.seek(7.0);
        let positions: Vec<f32> = h.output.opened().into_iter().map(|o| o.position).collect();
        assert_eq!(positions, vec![0.0, 0.25, 1.0]);
        assert_eq!(h.engine.status().seek_position, 1.0);
        assert_eq!(h.output.stops.load(Ordering::SeqCst), 2);
        assert_eq!(h.engine.state(), EngineState::Playing);
    }

    #[test]
    fn eof_advances_to_next_asset() {
        let h = harness(false);
        h.engine.set_queue(assets(&["a", "b"]));
        h.engine.play();
        wait_for_state(&h.engine, EngineState::Playing);
        h.output.end_latest(PlaybackEndReason::Eof);
        let deadline = Instant::now() + WAIT;
        while h.output.opened().len() < 2 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        wait_for_state(&h.engine, EngineState::Playing);
        assert_eq!(h.engine.current_item().unwrap().id.as_str(), "b");
    }

    #[test]
    fn output_error_stops_playback() {
        let h = harness(false);
        h.engine.set_queue(assets(&["a", "b"]));
        h.engine.play();
        wait_for_state(&h.engine, EngineState::Playing);
        h.output.end_latest(PlaybackEndReason::Error);
        wait_for_state(&h.engine, EngineState::Stopped);
        assert!(!h.engine.is_played());
        assert_eq!(h.engine.status().end_reason, Some(PlaybackEndReason::Error));
        assert_eq!(h.engine.current_item().unwrap().id.as_str(), "a");
    }

    #[test]
    fn stale_session_end_is_ignored() {
        let h = harness(false);
        h.engine.set_queue(assets(&["a", "b"]));
        h.engine.play();
        wait_for_state(&h.engine, EngineState::Playing);
        let first = h.output.notifiers.lock().unwrap()[0].clone();
        h.engine.seek(0.5);
        first.notify(PlaybackEndReason::Eof);
        // A later command is processed after the stale notification.
        std::thread::sleep(Duration::from_millis(50));
        h.engine.set_circle(false);
        assert_eq!(h.engine.current_item().unwrap().id.as_str(), "a");
        assert_eq!(h.output.opened().len(), 2);
    }

    #[test]
    fn failed_output_open_leaves_engine_stopped() {
        let h = harness(false);
        h.output.fail_open.store(true, Ordering::SeqCst);
        h.engine.set_queue(assets(&["a"]));
        h.engine.play();
        wait_for_state(&h.engine, EngineState::Stopped);
        assert!(!h.engine.is_played());
        assert_eq!(h.engine.status().end_reason, Some(PlaybackEndReason::Error));
    }

    #[test]
    fn spectrum_is_valid_only_while_playing() {
        let h = harness(false);
        h.engine.set_queue(assets(&["a"]));
        h.engine.play();
        wait_for_state(&h.engine, EngineState::Playing);
        let bars = h.engine.compute_spectrum_bars(16);
        assert!(bars.valid);
        assert_eq!(bars.bars.len(), 16);
        assert!(bars.bars.iter().any(|b| *b > 0.0));

        h.engine.stop();
        let bars = h.engine.compute_spectrum_bars(16);
        assert!(!bars.valid);
        assert_eq!(bars.bars, vec![0.0; 16]);
    }

    #[test]
    fn replacing_queue_stops_session_for_removed_asset() {
        let h = harness(false);
        h.engine.set_queue(assets(&["a", "b"]));
        h.engine.play();
        wait_for_state(&h.engine, EngineState::Playing);

        h.engine.set_queue(assets(&["a", "c"]));
        assert_eq!(h.engine.state(), EngineState::Playing);

        h.engine.set_queue(assets(&["c"]));
        assert_eq!(h.engine.state(), EngineState::Stopped);
        assert!(!h.engine.is_played());
        assert_eq!(h.engine.current_item().unwrap().id.as_str(), "c");
        assert_eq!(h.engine.status().queue_len, 1);
    }

    #[test]
    fn replacing_queue_cancels_acquisition_for_removed_asset() {
        let h = harness(true);
        h.engine.set_queue(assets(&["a"]));
        h.engine.play();
        assert_eq!(h.engine.state(), EngineState::Acquiring);
        h.engine.set_queue(assets(&["b"]));
        assert_eq!(h.engine.state(), EngineState::Idle);
        let events = events_until(&h.events, is_state(EngineState::Idle));
        assert!(events.iter().any(|e| matches!(e, PlayerEvent::CopyStopped { asset } if asset.id.as_str() == "a")));
    }

    #[test]
    fn policy_flags_are_reported() {
        let h = harness(false);
        h.engine.set_random(true);
        h.engine.set_circle(true);
        assert!(h.engine.is_random());
        assert!(h.engine.is_circle());
        h.engine.set_random(false);
        assert!(!h.engine.is_random());
    }

    #[test]
    fn circle_mode_keeps_playing_past_the_end() {
        let h = harness(false);
        h.engine.set_queue(assets(&["a", "b"]));
        h.engine.set_circle(true);
        h.engine.play();
        wait_for_state(&h.engine, EngineState::Playing);
        h.engine.next();
        wait_for_state(&h.engine, EngineState::Playing);
        h.engine.next();
        wait_for_state(&h.engine, EngineState::Playing);
        assert_eq!(h.engine.current_item().unwrap().id.as_str(), "a");
    }

    #[test]
    fn operations_after_shutdown_are_noops() {
        let h = harness(false);
        h.engine.set_queue(assets(&["a"]));
        h.engine.shutdown();
        h.engine.play();
        h.engine.next();
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert!(h.output.opened().is_empty());
    }
}
