//! Asset acquisition: making a playable local copy of an asset.
//!
//! Each copy runs on its own thread and reports through per-subscriber
//! channels. Concurrent requests for the same asset share one copy; the copy
//! is cancelled only when its last subscriber goes away. A cancelled copy
//! never leaves a partial file behind and never reports success.

mod cache;
mod reader;

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender};

use fft_player_types::{AssetDescriptor, AssetId};

use crate::config::AcquireConfig;

pub use cache::LocalSource;
pub use reader::{AcquireError, AssetReader, FileAssetReader, OpenedAsset};

/// Progress and outcome of one acquisition, as seen by one subscriber.
///
/// A subscriber sees `Started` first, then any number of non-decreasing
/// `Progress` values, then at most one terminal event.
#[derive(Clone, Debug, PartialEq)]
pub enum AcquisitionEvent {
    Started,
    Progress(f32),
    Succeeded(LocalSource),
    FailedDrm,
    Failed(String),
}

impl AcquisitionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AcquisitionEvent::Succeeded(_) | AcquisitionEvent::FailedDrm | AcquisitionEvent::Failed(_)
        )
    }
}

/// Produces local copies of assets.
#[derive(Clone)]
pub struct AssetAcquirer {
    inner: Arc<Inner>,
}

struct Inner {
    reader: Arc<dyn AssetReader>,
    config: AcquireConfig,
    tasks: Mutex<HashMap<AssetId, Arc<CopyTask>>>,
    index: Mutex<cache::CopyIndex>,
    next_subscriber: AtomicU64,
}

struct CopyTask {
    asset: AssetDescriptor,
    cancel: AtomicBool,
    state: Mutex<TaskState>,
}

#[derive(Default)]
struct TaskState {
    subscribers: Vec<(u64, Sender<AcquisitionEvent>)>,
    progress: Option<f32>,
    finished: bool,
}

impl CopyTask {
    /// Subscriber state, still usable after a copy thread panicked holding it.
    fn lock_state(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Record and fan out a progress value. Returns false once cancelled.
    fn report_progress(&self, fraction: f32) -> bool {
        let mut state = self.lock_state();
        if self.is_cancelled() {
            return false;
        }
        state.progress = Some(fraction);
        for (_, tx) in &state.subscribers {
            let _ = tx.send(AcquisitionEvent::Progress(fraction));
        }
        true
    }

    /// Deliver a failure unless the copy was cancelled first.
    fn fail(&self, event: AcquisitionEvent) {
        let mut state = self.lock_state();
        if self.is_cancelled() || state.finished {
            return;
        }
        state.finished = true;
        for (_, tx) in state.subscribers.drain(..) {
            let _ = tx.send(event.clone());
        }
    }
}

/// Closes every remaining subscriber channel when the copy thread exits,
/// including by panic, so no subscriber waits on a copy that is gone.
struct DisconnectOnExit<'a>(&'a CopyTask);

impl Drop for DisconnectOnExit<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock_state();
        state.finished = true;
        if !state.subscribers.is_empty() {
            tracing::warn!(asset = %self.0.asset.id, "copy ended without an outcome");
            state.subscribers.clear();
        }
    }
}

/// One subscriber's view of an acquisition. Dropping it unsubscribes.
pub struct AcquisitionHandle {
    asset: AssetDescriptor,
    subscriber: u64,
    task: Option<Arc<CopyTask>>,
    acquirer: Arc<Inner>,
    events: Receiver<AcquisitionEvent>,
}

impl AcquisitionHandle {
    pub fn asset(&self) -> &AssetDescriptor {
        &self.asset
    }

    pub fn events(&self) -> &Receiver<AcquisitionEvent> {
        &self.events
    }

    /// Stop listening. The copy itself is cancelled when no subscriber is left.
    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let mut state = task.lock_state();
        state.subscribers.retain(|(id, _)| *id != self.subscriber);
        if state.subscribers.is_empty() && !state.finished {
            task.cancel.store(true, Ordering::Relaxed);
            drop(state);
            self.acquirer.forget(&task);
            tracing::info!(asset = %task.asset.id, "copy cancelled");
        }
    }
}

impl Drop for AcquisitionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl AssetAcquirer {
    /// Build an acquirer writing copies under `config.cache_dir`.
    ///
    /// Partial copies left by an earlier run are removed.
    pub fn new(reader: Arc<dyn AssetReader>, config: AcquireConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.cache_dir)
            .with_context(|| format!("create cache dir {:?}", config.cache_dir))?;
        match cache::cleanup_partials(&config.cache_dir) {
            Ok(removed) if removed > 0 => {
                tracing::info!(removed, dir = ?config.cache_dir, "removed stale partial copies");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "partial copy cleanup failed"),
        }
        let mut index = cache::CopyIndex::new(config.retain_copies);
        match cache::existing_copies(&config.cache_dir) {
            Ok(copies) => {
                let evicted: Vec<PathBuf> =
                    copies.into_iter().flat_map(|path| index.insert(path)).collect();
                if !evicted.is_empty() {
                    tracing::info!(evicted = evicted.len(), "trimmed local copies to retain limit");
                    cache::remove_copies(&evicted);
                }
            }
            Err(e) => tracing::warn!(error = %e, "scanning local copies failed"),
        }
        Ok(Self {
            inner: Arc::new(Inner {
                reader,
                config,
                tasks: Mutex::new(HashMap::new()),
                index: Mutex::new(index),
                next_subscriber: AtomicU64::new(1),
            }),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.inner.config.cache_dir
    }

    /// Completed local copy of `asset`, if one exists on disk.
    pub fn local_copy(&self, asset: &AssetDescriptor) -> Option<LocalSource> {
        let path = cache::copy_path(&self.inner.config.cache_dir, asset);
        let byte_len = std::fs::metadata(&path).ok()?.len();
        let evicted = self.inner.index.lock().unwrap().insert(path.clone());
        cache::remove_copies(&evicted);
        Some(LocalSource {
            asset_id: asset.id.clone(),
            path,
            byte_len,
            extension: cache::locator_extension(asset),
        })
    }

    /// Start (or join) the copy of `asset`.
    ///
    /// An asset that already has a local copy completes immediately.
    pub fn acquire(&self, asset: &AssetDescriptor) -> AcquisitionHandle {
        let subscriber = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = crossbeam_channel::unbounded();
        let _ = tx.send(AcquisitionEvent::Started);

        if let Some(local) = self.local_copy(asset) {
            tracing::debug!(asset = %asset.id, path = ?local.path, "local copy already present");
            let _ = tx.send(AcquisitionEvent::Succeeded(local));
            return self.handle(asset, subscriber, None, rx);
        }

        let mut tasks = self.inner.tasks.lock().unwrap();
        if let Some(task) = tasks.get(&asset.id) {
            let mut state = task.lock_state();
            if !state.finished && !task.is_cancelled() {
                if let Some(progress) = state.progress {
                    let _ = tx.send(AcquisitionEvent::Progress(progress));
                }
                state.subscribers.push((subscriber, tx));
                tracing::debug!(asset = %asset.id, "joined in-flight copy");
                let task = task.clone();
                drop(state);
                return self.handle(asset, subscriber, Some(task), rx);
            }
        }

        let task = Arc::new(CopyTask {
            asset: asset.clone(),
            cancel: AtomicBool::new(false),
            state: Mutex::new(TaskState {
                subscribers: vec![(subscriber, tx)],
                ..TaskState::default()
            }),
        });
        tasks.insert(asset.id.clone(), task.clone());
        drop(tasks);

        tracing::info!(asset = %asset.id, locator = %asset.locator, "copy started");
        let inner = self.inner.clone();
        let worker_task = task.clone();
        std::thread::spawn(move || inner.run_copy(worker_task));
        self.handle(asset, subscriber, Some(task), rx)
    }

    fn handle(
        &self,
        asset: &AssetDescriptor,
        subscriber: u64,
        task: Option<Arc<CopyTask>>,
        events: Receiver<AcquisitionEvent>,
    ) -> AcquisitionHandle {
        AcquisitionHandle {
            asset: asset.clone(),
            subscriber,
            task,
            acquirer: self.inner.clone(),
            events,
        }
    }
}

impl Inner {
    /// Drop `task` from the in-flight map if it is still the registered copy.
    fn forget(&self, task: &Arc<CopyTask>) {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks
            .get(&task.asset.id)
            .is_some_and(|current| Arc::ptr_eq(current, task))
        {
            tasks.remove(&task.asset.id);
        }
    }

    fn run_copy(&self, task: Arc<CopyTask>) {
        let _disconnect = DisconnectOnExit(&task);
        let asset = &task.asset;
        let opened = match self.reader.open(asset) {
            Ok(opened) => opened,
            Err(AcquireError::DrmBlocked(_)) => {
                tracing::warn!(asset = %asset.id, "asset is copy-protected");
                task.fail(AcquisitionEvent::FailedDrm);
                self.forget(&task);
                return;
            }
            Err(e) => {
                tracing::warn!(asset = %asset.id, error = %e, "copy failed to open asset");
                task.fail(AcquisitionEvent::Failed(e.to_string()));
                self.forget(&task);
                return;
            }
        };

        let final_path = cache::copy_path(&self.config.cache_dir, asset);
        let partial = cache::partial_path(&final_path);
        match self.copy_bytes(&task, opened, &partial) {
            Ok(Some(byte_len)) => self.commit(&task, &partial, final_path, byte_len),
            Ok(None) => {
                let _ = std::fs::remove_file(&partial);
                tracing::debug!(asset = %asset.id, "partial copy removed after cancel");
            }
            Err(e) => {
                let _ = std::fs::remove_file(&partial);
                tracing::warn!(asset = %asset.id, error = %e, "copy failed");
                task.fail(AcquisitionEvent::Failed(e.to_string()));
            }
        }
        self.forget(&task);
    }

    /// Copy into `partial`. `Ok(None)` means the copy was cancelled.
    fn copy_bytes(
        &self,
        task: &CopyTask,
        opened: OpenedAsset,
        partial: &Path,
    ) -> std::io::Result<Option<u64>> {
        let OpenedAsset { mut reader, byte_len } = opened;
        let mut out = File::create(partial)?;
        let mut buf = vec![0u8; self.config.copy_chunk_bytes.max(1)];
        let mut copied = 0u64;
        let mut last_reported = 0.0f32;

        loop {
            if task.is_cancelled() {
                return Ok(None);
            }
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            copied += n as u64;

            let Some(total) = byte_len.filter(|total| *total > 0) else {
                continue;
            };
            let fraction = (copied as f64 / total as f64).min(1.0) as f32;
            if fraction - last_reported >= self.config.progress_step && fraction < 1.0 {
                if !task.report_progress(fraction) {
                    return Ok(None);
                }
                last_reported = fraction;
            }
        }
        out.sync_all()?;
        if !task.report_progress(1.0) {
            return Ok(None);
        }
        Ok(Some(copied))
    }

    /// Publish a finished partial copy and notify subscribers.
    fn commit(&self, task: &CopyTask, partial: &Path, final_path: PathBuf, byte_len: u64) {
        let mut state = task.lock_state();
        if task.is_cancelled() {
            drop(state);
            let _ = std::fs::remove_file(partial);
            return;
        }
        if let Err(e) = std::fs::rename(partial, &final_path) {
            drop(state);
            let _ = std::fs::remove_file(partial);
            tracing::warn!(asset = %task.asset.id, error = %e, "copy rename failed");
            task.fail(AcquisitionEvent::Failed(format!("rename copy: {e}")));
            return;
        }

        let source = LocalSource {
            asset_id: task.asset.id.clone(),
            path: final_path,
            byte_len,
            extension: cache::locator_extension(&task.asset),
        };
        let evicted = self.index.lock().unwrap().insert(source.path.clone());
        cache::remove_copies(&evicted);

        tracing::info!(asset = %task.asset.id, bytes = byte_len, path = ?source.path, "copy complete");
        state.finished = true;
        for (_, tx) in state.subscribers.drain(..) {
            let _ = tx.send(AcquisitionEvent::Succeeded(source.clone()));
        }
    }
}
