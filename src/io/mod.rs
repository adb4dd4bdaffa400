//! Randomness abstraction for deterministic simulation.
//!
//! Fault injection and backoff jitter draw from an `Rng` so a test seed can
//! replay the exact same sequence of decisions.

pub mod simulation;

/// Source of random decisions.
pub trait Rng: Send + 'static {
    fn next_u64(&mut self) -> u64;

    fn gen_bool(&mut self, probability: f64) -> bool;

    /// Uniform value in `[min, max)`; returns `min` when the range is empty.
    fn gen_range(&mut self, min: u64, max: u64) -> u64;

    fn shuffle<T>(&mut self, slice: &mut [T])
    where
        Self: Sized;
}

/// OS-seeded generator for production code paths.
pub struct ProductionRng {
    inner: rand::rngs::StdRng,
}

impl ProductionRng {
    pub fn new() -> Self {
        use rand::SeedableRng;
        ProductionRng {
            inner: rand::rngs::StdRng::from_entropy(),
        }
    }
}

impl Default for ProductionRng {
    fn default() -> Self {
        Self::new()
    }
}

impl Rng for ProductionRng {
    fn next_u64(&mut self) -> u64 {
        use rand::RngCore;
        self.inner.next_u64()
    }

    fn gen_bool(&mut self, probability: f64) -> bool {
        use rand::Rng as _;
        self.inner.gen_bool(probability.clamp(0.0, 1.0))
    }

    fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        use rand::Rng as _;
        if min >= max {
            return min;
        }
        self.inner.gen_range(min..max)
    }

    fn shuffle<T>(&mut self, slice: &mut [T]) {
        use rand::seq::SliceRandom;
        slice.shuffle(&mut self.inner);
    }
}
