//! Ordered asset queue with a cursor and random/circle traversal.
//!
//! The cursor is `None` when the queue is empty or forward traversal ran past
//! the last asset without `circle`. Random traversal never exhausts a
//! non-empty queue.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fft_player_types::AssetDescriptor;

pub struct PlaybackQueue {
    assets: Vec<AssetDescriptor>,
    cursor: Option<usize>,
    random: bool,
    circle: bool,
    rng: StdRng,
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Queue whose random traversal is reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            assets: Vec::new(),
            cursor: None,
            random: false,
            circle: false,
            rng,
        }
    }

    /// Replace the sequence; the cursor moves to the first asset.
    pub fn set_assets(&mut self, assets: Vec<AssetDescriptor>) {
        self.cursor = if assets.is_empty() { None } else { Some(0) };
        self.assets = assets;
    }

    pub fn set_random(&mut self, random: bool) {
        self.random = random;
    }

    pub fn set_circle(&mut self, circle: bool) {
        self.circle = circle;
    }

    pub fn is_random(&self) -> bool {
        self.random
    }

    pub fn is_circle(&self) -> bool {
        self.circle
    }

    pub fn assets(&self) -> &[AssetDescriptor] {
        &self.assets
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn current(&self) -> Option<&AssetDescriptor> {
        self.cursor.and_then(|idx| self.assets.get(idx))
    }

    /// Step forward (or jump randomly) and return the new current asset.
    pub fn advance(&mut self) -> Option<&AssetDescriptor> {
        if self.assets.is_empty() {
            return None;
        }
        self.cursor = if self.random {
            Some(self.random_index())
        } else {
            match self.cursor {
                Some(idx) if idx + 1 < self.assets.len() => Some(idx + 1),
                Some(_) if self.circle => Some(0),
                _ => None,
            }
        };
        self.current()
    }

    /// Step backward (or jump randomly) and return the new current asset.
    ///
    /// Without `circle` the first asset is a floor; an exhausted cursor steps
    /// back onto the last asset.
    pub fn retreat(&mut self) -> Option<&AssetDescriptor> {
        if self.assets.is_empty() {
            return None;
        }
        let last = self.assets.len() - 1;
        self.cursor = if self.random {
            Some(self.random_index())
        } else {
            match self.cursor {
                Some(0) if self.circle => Some(last),
                Some(0) => Some(0),
                Some(idx) => Some(idx - 1),
                None => Some(last),
            }
        };
        self.current()
    }

    /// Uniform index different from the cursor when there is a choice.
    fn random_index(&mut self) -> usize {
        let len = self.assets.len();
        match self.cursor {
            _ if len == 1 => 0,
            Some(current) => {
                let pick = self.rng.gen_range(0..len - 1);
                if pick >= current { pick + 1 } else { pick }
            }
            None => self.rng.gen_range(0..len),
        }
    }
}
