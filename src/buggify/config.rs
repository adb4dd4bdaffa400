//! Per-fault probabilities.

use super::faults;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct FaultConfig {
    /// Master switch; when false no fault ever triggers
    pub enabled: bool,
    probabilities: HashMap<String, f64>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultConfig {
    /// Enabled, with every named fault at probability zero.
    pub fn new() -> Self {
        FaultConfig {
            enabled: true,
            probabilities: HashMap::new(),
        }
    }

    pub fn disabled() -> Self {
        FaultConfig {
            enabled: false,
            probabilities: HashMap::new(),
        }
    }

    /// Roughly 1% failure on every named fault.
    pub fn moderate() -> Self {
        let mut config = Self::new();
        for fault in faults::ALL_FAULTS {
            config.set(fault, 0.01);
        }
        config
    }

    pub fn chaos() -> Self {
        let mut config = Self::new();
        for fault in faults::ALL_FAULTS {
            config.set(fault, 0.10);
        }
        config
    }

    pub fn set(&mut self, fault_id: &str, probability: f64) -> &mut Self {
        self.probabilities
            .insert(fault_id.to_string(), probability.clamp(0.0, 1.0));
        self
    }

    pub fn get(&self, fault_id: &str) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        self.probabilities.get(fault_id).copied().unwrap_or(0.0)
    }
}
