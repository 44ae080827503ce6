//! In-process event bus for engine notifications.
//!
//! Every subscriber gets its own unbounded channel, so a slow reader never
//! blocks the engine. Disconnected subscribers are pruned on the next publish.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};

use fft_player_types::{AssetDescriptor, EngineState, PlayerEvent};

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<PlayerEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn publish(&self, event: PlayerEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn drm_blocked(&self, asset: &AssetDescriptor) {
        self.publish(PlayerEvent::DrmBlocked {
            asset: asset.clone(),
        });
    }

    pub fn copy_started(&self, asset: &AssetDescriptor) {
        self.publish(PlayerEvent::CopyStarted {
            asset: asset.clone(),
        });
    }

    pub fn copy_progress(&self, asset: &AssetDescriptor, progress: f32) {
        self.publish(PlayerEvent::CopyProgress {
            asset: asset.clone(),
            progress,
        });
    }

    pub fn copy_stopped(&self, asset: &AssetDescriptor) {
        self.publish(PlayerEvent::CopyStopped {
            asset: asset.clone(),
        });
    }

    pub fn copy_failed(&self, asset: &AssetDescriptor, error: String) {
        self.publish(PlayerEvent::CopyFailed {
            asset: asset.clone(),
            error,
        });
    }

    pub fn state_changed(&self, state: EngineState) {
        self.publish(PlayerEvent::StateChanged { state });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_receives_events_in_order() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        let asset = AssetDescriptor::new("1", "Song", "/a.flac");
        bus.copy_started(&asset);
        bus.copy_progress(&asset, 0.5);
        for rx in [a, b] {
            assert!(matches!(rx.try_recv(), Ok(PlayerEvent::CopyStarted { .. })));
            assert!(matches!(
                rx.try_recv(),
                Ok(PlayerEvent::CopyProgress { progress, .. }) if progress == 0.5
            ));
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        bus.state_changed(EngineState::Idle);
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }

    #[test]
    fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        bus.state_changed(EngineState::Playing);
        let rx = bus.subscribe();
        assert!(rx.try_recv().is_err());
    }
}
