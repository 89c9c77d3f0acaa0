//! "Choose one of N" strategies used to pick destination nodes and entities.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Picks an index in `0..n`.
pub trait Chooser: Send {
    /// `n` is never zero.
    fn choose(&mut self, n: usize) -> usize;
}

/// Uniform random choice, optionally from a fixed seed.
#[derive(Debug, Clone)]
pub struct RngChooser {
    rng: SmallRng,
}

impl RngChooser {
    pub fn from_entropy() -> Self {
        Self {
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }
}

impl Chooser for RngChooser {
    fn choose(&mut self, n: usize) -> usize {
        self.rng.gen_range(0..n)
    }
}

/// Cycles through indices in order. Fully deterministic.
#[derive(Debug, Clone, Default)]
pub struct RoundRobin {
    next: usize,
}

impl Chooser for RoundRobin {
    fn choose(&mut self, n: usize) -> usize {
        let picked = self.next % n;
        self.next = self.next.wrapping_add(1);
        picked
    }
}

/// Mix a base seed with a worker id so each worker gets its own stream.
pub fn worker_seed(base: u64, worker: usize) -> u64 {
    base ^ (worker as u64).wrapping_mul(0x9e3779b97f4a7c15)
}

/// Chooser for one worker: seeded when a run seed is configured, otherwise
/// from entropy.
pub fn for_worker(seed: Option<u64>, worker: usize) -> RngChooser {
    match seed {
        Some(seed) => RngChooser::seeded(worker_seed(seed, worker)),
        None => RngChooser::from_entropy(),
    }
}
