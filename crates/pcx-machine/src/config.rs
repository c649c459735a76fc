use std::time::Duration;

use pcx_cpu_core::{ConfigError, CpuConfig, CpuModel, CycleCosts};

/// Static configuration for a [`crate::Machine`].
#[derive(Debug, Clone, PartialEq)]
pub struct MachineConfig {
    pub cpu_model: CpuModel,
    /// Guest RAM size in bytes; must be a non-zero multiple of 4 KiB.
    pub ram_size_bytes: usize,
    /// CPU clock in Hz. Timed devices derive their periods from it.
    pub base_frequency_hz: f64,
    pub costs: CycleCosts,
    /// Iterations a REP string instruction may run per step; at least 1.
    pub rep_budget: u32,
    /// Code blocks idle for longer than this are dropped by the periodic sweep.
    pub cache_unused_window: Duration,
    /// Guest cycles between code-cache sweeps; at least 1.
    pub sweep_interval_cycles: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            cpu_model: CpuModel::I486,
            ram_size_bytes: 16 * 1024 * 1024,
            base_frequency_hz: 33_000_000.0,
            costs: CycleCosts::default(),
            rep_budget: 4096,
            cache_unused_window: Duration::from_secs(10),
            sweep_interval_cycles: 100_000_000,
        }
    }
}

impl MachineConfig {
    /// Reject settings no machine can run with. RAM geometry is checked when memory is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.base_frequency_hz.is_finite() || self.base_frequency_hz <= 0.0 {
            return Err(ConfigError::InvalidFrequency(self.base_frequency_hz));
        }
        if self.sweep_interval_cycles == 0 {
            return Err(ConfigError::InvalidSweepInterval);
        }
        self.cpu_config().validate()
    }

    pub(crate) fn cpu_config(&self) -> CpuConfig {
        CpuConfig {
            model: self.cpu_model,
            costs: self.costs,
            rep_budget: self.rep_budget,
            cache_unused_window: self.cache_unused_window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(MachineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn frequency_must_be_positive() {
        for hz in [0.0, -1.0, f64::INFINITY] {
            let cfg = MachineConfig {
                base_frequency_hz: hz,
                ..MachineConfig::default()
            };
            assert!(matches!(cfg.validate(), Err(ConfigError::InvalidFrequency(_))));
        }
        let nan = MachineConfig {
            base_frequency_hz: f64::NAN,
            ..MachineConfig::default()
        };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn zero_rep_budget_is_rejected() {
        let cfg = MachineConfig {
            rep_budget: 0,
            ..MachineConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidRepBudget));
    }

    #[test]
    fn zero_sweep_interval_is_rejected() {
        let cfg = MachineConfig {
            sweep_interval_cycles: 0,
            ..MachineConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidSweepInterval));
    }
}
