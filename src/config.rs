//! Runner configuration.
//!
//! Explicit values win; [`RunnerConfig::from_env`] fills the rest from the
//! environment (a `.env` file is honored via `dotenvy`).

use std::str::FromStr;

use crate::types::Device;

/// Execution knobs for a [`WorkflowRunner`](crate::runner::WorkflowRunner).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Device handed to node behaviors through the context; apply with
    /// [`ProcessingContext::with_config`](crate::context::ProcessingContext::with_config).
    pub device: Device,
    /// When false, cacheable nodes are re-invoked even on input-identical
    /// calls. Useful when diagnosing a suspected stale-result issue.
    pub result_cache_enabled: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            device: Device::default(),
            result_cache_enabled: true,
        }
    }
}

impl RunnerConfig {
    /// Build from environment variables.
    ///
    /// - `LOOMFLOW_DEVICE`: `cpu` (default), `mps`, `cuda`, `cuda:N`
    /// - `LOOMFLOW_DISABLE_RESULT_CACHE`: set to `1`/`true` to disable reuse
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let device = std::env::var("LOOMFLOW_DEVICE")
            .ok()
            .and_then(|raw| Device::from_str(&raw).ok())
            .unwrap_or_default();
        let disabled = std::env::var("LOOMFLOW_DISABLE_RESULT_CACHE")
            .map(|raw| raw == "1" || raw.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self {
            device,
            result_cache_enabled: !disabled,
        }
    }

    #[must_use]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    #[must_use]
    pub fn without_result_cache(mut self) -> Self {
        self.result_cache_enabled = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_cpu_with_caching() {
        let config = RunnerConfig::default();
        assert_eq!(config.device, Device::Cpu);
        assert!(config.result_cache_enabled);
        assert!(!config.without_result_cache().result_cache_enabled);
    }
}
