//! BUGGIFY-style fault injection.
//!
//! Every decision point in a simulated component can become a fault site.
//! Decisions draw from a caller-supplied [`Rng`](crate::io::Rng), so a seed
//! replays the exact fault sequence.
//!
//! ```ignore
//! if buggify!(&mut rng, faults::object_store::PUT_FAIL) {
//!     return Err(IoError::new(ErrorKind::Other, "injected"));
//! }
//! if buggify!(&mut rng, faults::object_store::TIMEOUT, 0.05) {
//!     return Err(IoError::new(ErrorKind::TimedOut, "injected"));
//! }
//! ```

pub mod config;
pub mod faults;

pub use config::FaultConfig;
pub use faults::ALL_FAULTS;

use crate::io::Rng;
use std::cell::RefCell;
use std::collections::HashMap;

/// Checks and triggers per fault id.
#[derive(Debug, Clone, Default)]
pub struct BuggifyStats {
    pub checks: HashMap<String, u64>,
    pub triggers: HashMap<String, u64>,
}

impl BuggifyStats {
    pub fn triggered(&self, fault_id: &str) -> u64 {
        self.triggers.get(fault_id).copied().unwrap_or(0)
    }

    pub fn summary(&self) -> String {
        let mut ids: Vec<_> = self.checks.keys().collect();
        ids.sort();
        let mut lines = vec!["BUGGIFY Statistics:".to_string()];
        for id in ids {
            let checks = self.checks.get(id).copied().unwrap_or(0);
            lines.push(format!("  {}: {}/{}", id, self.triggered(id), checks));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Default)]
struct BuggifyContext {
    config: FaultConfig,
    stats: BuggifyStats,
    suppressed: bool,
}

thread_local! {
    static CONTEXT: RefCell<BuggifyContext> = RefCell::new(BuggifyContext::default());
}

/// Replace the fault configuration for the current thread.
pub fn set_config(config: FaultConfig) {
    CONTEXT.with(|ctx| ctx.borrow_mut().config = config);
}

pub fn stats() -> BuggifyStats {
    CONTEXT.with(|ctx| ctx.borrow().stats.clone())
}

pub fn reset_stats() {
    CONTEXT.with(|ctx| ctx.borrow_mut().stats = BuggifyStats::default());
}

/// Disables fault injection on this thread until dropped.
pub struct Suppressor {
    previous: bool,
}

impl Suppressor {
    pub fn new() -> Self {
        let previous = CONTEXT.with(|ctx| std::mem::replace(&mut ctx.borrow_mut().suppressed, true));
        Suppressor { previous }
    }
}

impl Default for Suppressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Suppressor {
    fn drop(&mut self) {
        let previous = self.previous;
        CONTEXT.with(|ctx| ctx.borrow_mut().suppressed = previous);
    }
}

fn decide<R: Rng>(rng: &mut R, fault_id: &str, probability: Option<f64>) -> bool {
    CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        *ctx.stats.checks.entry(fault_id.to_string()).or_insert(0) += 1;
        if ctx.suppressed || !ctx.config.enabled {
            return false;
        }
        let p = probability.unwrap_or_else(|| ctx.config.get(fault_id));
        if p <= 0.0 {
            return false;
        }
        let triggered = rng.gen_range(0, 1_000_000) as f64 / 1_000_000.0 < p.min(1.0);
        if triggered {
            *ctx.stats.triggers.entry(fault_id.to_string()).or_insert(0) += 1;
        }
        triggered
    })
}

/// Uses the probability configured for `fault_id`.
#[inline]
pub fn should_buggify<R: Rng>(rng: &mut R, fault_id: &str) -> bool {
    decide(rng, fault_id, None)
}

/// Overrides the configured probability.
#[inline]
pub fn should_buggify_with_prob<R: Rng>(rng: &mut R, fault_id: &str, probability: f64) -> bool {
    decide(rng, fault_id, Some(probability))
}

#[macro_export]
macro_rules! buggify {
    ($rng:expr, $fault_id:expr) => {
        $crate::buggify::should_buggify($rng, $fault_id)
    };
    ($rng:expr, $fault_id:expr, $prob:expr) => {
        $crate::buggify::should_buggify_with_prob($rng, $fault_id, $prob)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::simulation::SimulatedRng;

    #[test]
    fn test_disabled_never_triggers() {
        set_config(FaultConfig::disabled());
        let mut rng = SimulatedRng::new(1);
        for _ in 0..1000 {
            assert!(!buggify!(&mut rng, faults::object_store::PUT_FAIL, 1.0));
        }
        set_config(FaultConfig::new());
    }

    #[test]
    fn test_explicit_probability() {
        set_config(FaultConfig::new());
        let mut rng = SimulatedRng::new(2);
        assert!((0..100).all(|_| buggify!(&mut rng, "test.always", 1.0)));
        assert!((0..100).all(|_| !buggify!(&mut rng, "test.never", 0.0)));
    }

    #[test]
    fn test_configured_probability_and_stats() {
        let mut config = FaultConfig::new();
        config.set(faults::object_store::GET_FAIL, 0.5);
        set_config(config);
        reset_stats();

        let mut rng = SimulatedRng::new(3);
        for _ in 0..1000 {
            let _ = buggify!(&mut rng, faults::object_store::GET_FAIL);
        }
        let stats = stats();
        assert_eq!(
            stats.checks.get(faults::object_store::GET_FAIL),
            Some(&1000)
        );
        let hits = stats.triggered(faults::object_store::GET_FAIL);
        assert!(hits > 350 && hits < 650, "hits: {}", hits);
        set_config(FaultConfig::new());
    }

    #[test]
    fn test_suppression_restores() {
        set_config(FaultConfig::new());
        let mut rng = SimulatedRng::new(4);
        {
            let _guard = Suppressor::new();
            assert!(!buggify!(&mut rng, "test.suppressed", 1.0));
        }
        assert!(buggify!(&mut rng, "test.after", 1.0));
    }
}
