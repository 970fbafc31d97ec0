use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Top-level configuration for the monitoring subsystem.
///
/// Every field has a working default, so `MonitorConfig::default()` is a
/// complete configuration and files/environment only need to override
/// what they care about.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MonitorConfig {
    pub metrics: MetricsConfig,
    pub health: HealthConfig,
    pub sampler: SamplerConfig,
    pub alerts: AlertsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Maximum samples retained per metric name before eviction.
    pub max_per_name: usize,

    /// Interval between throughput-rate recomputations, in milliseconds.
    pub tick_interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_per_name: 1000,
            tick_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Timeout applied to checks registered without an explicit one.
    pub default_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Interval between periodic CPU/memory/lag samples, in milliseconds.
    pub sample_interval_ms: u64,

    /// Default lookback window for performance reports, in milliseconds.
    pub report_window_ms: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 15_000,
            report_window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Resolved alerts older than this are eligible for purging, in
    /// milliseconds.
    pub purge_max_age_ms: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            purge_max_age_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl MonitorConfig {
    /// Load configuration from an optional TOML file layered under
    /// `VIGIL_*` environment variables (e.g. `VIGIL_METRICS__MAX_PER_NAME`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("VIGIL")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build()?;
        Ok(settings.try_deserialize()?)
    }
}

impl MetricsConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl HealthConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl SamplerConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn report_window(&self) -> Duration {
        Duration::from_millis(self.report_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.metrics.max_per_name, 1000);
        assert_eq!(cfg.health.default_timeout_ms, 5000);
        assert_eq!(cfg.sampler.sample_interval_ms, 15_000);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let cfg = MonitorConfig::load(None).unwrap();
        assert_eq!(cfg.metrics.max_per_name, 1000);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        let overrides = toml::toml! {
            [metrics]
            max_per_name = 50

            [health]
            default_timeout_ms = 250
        };
        write!(file, "{overrides}").unwrap();

        let cfg = MonitorConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.metrics.max_per_name, 50);
        assert_eq!(cfg.health.default_timeout_ms, 250);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.sampler.report_window_ms, 60_000);
    }
}
