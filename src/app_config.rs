//! Application configuration using figment.
//!
//! Loaded from a TOML file, then overridden by `QDAQ_`-prefixed environment
//! variables with `__` between nesting levels
//! (`QDAQ_APPLICATION__LOG_LEVEL=debug`).
//!
//! ```toml
//! [application]
//! name = "dilution fridge 2"
//! log_level = "info"
//!
//! [sweep]
//! min_demod_latency = 0.002
//! inter_loop_margin = 0.05
//!
//! [ramp_speeds]
//! dac_ch1 = 0.5
//!
//! [[instruments]]
//! id = "dac"
//! type = "mock_voltage_source"
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use qdaq_core::config::{AcquisitionLimits, SweepTiming};
use qdaq_core::{QdaqError, QdaqResult};
use qdaq_experiment::SweepDriver;
use qdaq_hardware::{create_registry_from_config, HardwareConfig, InstrumentConfig, InstrumentRegistry};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/qdaq.toml";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Sweep timing margins
    #[serde(default)]
    pub sweep: SweepTiming,
    /// Platform limits
    #[serde(default)]
    pub limits: AcquisitionLimits,
    /// Default ramp slope per instrument id (V/s)
    #[serde(default)]
    pub ramp_speeds: BTreeMap<String, f64>,
    /// Instruments to register
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load [`DEFAULT_CONFIG_PATH`] plus environment overrides.
    pub fn load() -> QdaqResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load `path` plus environment overrides, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> QdaqResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(QdaqError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("config file not found: {}", path.display()),
            )));
        }
        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("QDAQ_").split("__"))
            .extract()?;
        config.validate()?;
        info!(
            path = %path.display(),
            name = %config.application.name,
            instruments = config.instruments.len(),
            "Loaded application config"
        );
        Ok(config)
    }

    /// Parse a TOML string without environment overrides.
    pub fn from_toml_str(contents: &str) -> QdaqResult<Self> {
        let config: Self = Figment::new().merge(Toml::string(contents)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check levels, timing margins, ramp speeds and instrument ids.
    pub fn validate(&self) -> QdaqResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(QdaqError::Configuration(format!(
                "invalid log_level '{}', must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        for (name, value) in [
            ("min_demod_latency", self.sweep.min_demod_latency),
            ("inter_loop_margin", self.sweep.inter_loop_margin),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(QdaqError::validation(
                    format!("sweep.{}", name),
                    format!("must be a non-negative number of seconds, got {}", value),
                ));
            }
        }

        for (id, slope) in &self.ramp_speeds {
            if !(slope.is_finite() && *slope > 0.0) {
                return Err(QdaqError::validation(
                    format!("ramp_speeds.{}", id),
                    format!("slope must be positive, got {}", slope),
                ));
            }
        }

        self.hardware()
            .validate()
            .map_err(|e| QdaqError::Configuration(e.to_string()))
    }

    /// The `[[instruments]]` entries as a hardware configuration.
    pub fn hardware(&self) -> HardwareConfig {
        HardwareConfig {
            instruments: self.instruments.clone(),
        }
    }

    /// Build a registry from the configured instruments.
    pub async fn build_registry(&self) -> anyhow::Result<InstrumentRegistry> {
        create_registry_from_config(&self.hardware()).await
    }

    /// Sweep driver carrying the configured timing and ramp speeds.
    pub fn sweep_driver<'r>(&self, registry: &'r InstrumentRegistry) -> SweepDriver<'r> {
        self.ramp_speeds.iter().fold(
            SweepDriver::new(registry).with_timing(self.sweep),
            |driver, (id, slope)| driver.with_ramp_speed(id.clone(), *slope),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[application]
name = "Test"
log_level = "info"

[sweep]
min_demod_latency = 0.004

[ramp_speeds]
dac_ch1 = 0.5

[[instruments]]
id = "dac"
type = "mock_voltage_source"
[instruments.config]
channels = 2
"#;

    #[test]
    fn test_parse_sample() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.application.name, "Test");
        assert_eq!(config.sweep.min_demod_latency, 0.004);
        // unset fields keep their defaults
        assert_eq!(
            config.sweep.inter_loop_margin,
            SweepTiming::default().inter_loop_margin
        );
        assert_eq!(config.limits, AcquisitionLimits::default());
        assert_eq!(config.ramp_speeds.get("dac_ch1"), Some(&0.5));
        assert_eq!(config.instruments[0].driver_type, "mock_voltage_source");
    }

    #[test]
    fn test_log_level_defaults_to_info() {
        let config = AppConfig::from_toml_str("[application]\nname = \"x\"\n").unwrap();
        assert_eq!(config.application.log_level, "info");
        assert!(config.instruments.is_empty());
    }

    #[test]
    fn test_invalid_log_level() {
        let err = AppConfig::from_toml_str(
            "[application]\nname = \"x\"\nlog_level = \"loud\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, QdaqError::Configuration(msg) if msg.contains("loud")));
    }

    #[test]
    fn test_non_positive_ramp_speed() {
        let err = AppConfig::from_toml_str(
            "[application]\nname = \"x\"\n[ramp_speeds]\ndac_ch1 = 0.0\n",
        )
        .unwrap_err();
        assert!(matches!(err, QdaqError::Validation { .. }));
    }

    #[test]
    fn test_duplicate_instrument_ids() {
        let err = AppConfig::from_toml_str(
            r#"
[application]
name = "x"

[[instruments]]
id = "lockin"
type = "mock_lockin"

[[instruments]]
id = "lockin"
type = "mock_counter"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, QdaqError::Configuration(msg) if msg.contains("lockin")));
    }

    #[test]
    fn test_missing_application_section() {
        let err = AppConfig::from_toml_str("[sweep]\nmin_demod_latency = 0.1\n").unwrap_err();
        assert!(matches!(err, QdaqError::Config(_)));
    }
}
