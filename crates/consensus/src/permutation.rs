//! Deterministic permutation of peer indices
//!
//! All honest peers reseed with the same bytes (the previous anchoring
//! transaction id) and therefore walk the same candidate order without
//! talking to each other.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sc_state::hash_data;

/// A permutation of `0..size` with a cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPermutation {
    order: Vec<u16>,
    cursor: usize,
}

impl PeerPermutation {
    /// Identity permutation
    pub fn new(size: u16) -> Self {
        assert!(size > 0, "peer permutation over an empty committee");
        Self {
            order: (0..size).collect(),
            cursor: 0,
        }
    }

    /// Reshuffle from the seed and move the cursor to the first slot
    pub fn shuffle(&mut self, seed: &[u8]) {
        let mut rng = ChaCha8Rng::from_seed(hash_data(&[seed]).0);
        self.order.sort_unstable();
        self.order.shuffle(&mut rng);
        self.cursor = 0;
    }

    pub fn current(&self) -> u16 {
        self.order[self.cursor]
    }

    /// Advance the cursor one slot, wrapping around
    pub fn next(&mut self) -> u16 {
        self.cursor = (self.cursor + 1) % self.order.len();
        self.current()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn order(&self) -> &[u16] {
        &self.order
    }
}
