//! Simulated hardware failures for dispense commands.
//!
//! Each accepted dispense rolls once against the configured error rate before
//! its session task starts; a triggered fault publishes a critical error and
//! the session never runs. Flush and calibration commands are not subject to
//! injection.

use serde::{Deserialize, Serialize};

use crate::protocol::ErrorCode;
use crate::rng::SimRng;

/// Failure codes a dispense can draw when the injection roll fires.
const SIMULATED_FAULTS: [ErrorCode; 3] = [
    ErrorCode::PumpStuck,
    ErrorCode::FlowSensorError,
    ErrorCode::Timeout,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultInjectionConfig {
    /// Probability in `[0.0, 1.0]` that a dispense fails before starting.
    pub error_rate: f64,
}

impl Default for FaultInjectionConfig {
    fn default() -> Self {
        Self { error_rate: 0.0 }
    }
}

impl FaultInjectionConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if (0.0..=1.0).contains(&self.error_rate) {
            Ok(())
        } else {
            Err("error rate must be between 0.0 and 1.0")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FaultInjectionStats {
    pub total_rolls: u32,
    pub faults_injected: u32,
}

/// Probabilistic pre-session fault injector.
#[derive(Debug)]
pub struct FaultInjector {
    config: FaultInjectionConfig,
    stats: FaultInjectionStats,
}

impl FaultInjector {
    pub fn new(config: FaultInjectionConfig) -> Self {
        Self {
            config,
            stats: FaultInjectionStats::default(),
        }
    }

    /// Roll once. `Some(code)` means the dispense must fail with that code
    /// instead of running.
    pub fn try_inject(&mut self, rng: &mut SimRng) -> Option<ErrorCode> {
        self.stats.total_rolls += 1;
        if rng.next_f64() < self.config.error_rate {
            self.stats.faults_injected += 1;
            Some(*rng.choose(&SIMULATED_FAULTS))
        } else {
            None
        }
    }

    pub fn stats(&self) -> &FaultInjectionStats {
        &self.stats
    }

    pub fn config(&self) -> &FaultInjectionConfig {
        &self.config
    }
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new(FaultInjectionConfig::default())
    }
}
