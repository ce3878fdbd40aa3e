//! Hardware configuration files.
//!
//! ```toml
//! [[instruments]]
//! id = "dac"
//! name = "DC source"
//! type = "mock_voltage_source"
//! [instruments.config]
//! channels = 8
//!
//! [[instruments]]
//! id = "lockin"
//! type = "mock_lockin"
//! ```
//!
//! `type` selects a registered [`qdaq_core::driver::DriverFactory`]; `config`
//! is handed to it unchanged.

use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigLoadError {
    /// File not found
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Parse error (invalid TOML or wrong shape)
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// Validation error
    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

/// One instrument entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Registry id (channel instruments get a suffix appended)
    pub id: String,
    /// Human-readable name, defaults to the id
    #[serde(default)]
    pub name: Option<String>,
    /// Driver type
    #[serde(rename = "type")]
    pub driver_type: String,
    /// Driver-specific settings
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

impl InstrumentConfig {
    /// Entry with an empty driver configuration.
    pub fn new(id: impl Into<String>, driver_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            driver_type: driver_type.into(),
            config: empty_table(),
        }
    }

    /// Attach driver settings.
    pub fn with_config(mut self, config: toml::Value) -> Self {
        self.config = config;
        self
    }

    /// Attach a display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Hardware configuration loaded from a TOML file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Instruments to register
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

impl HardwareConfig {
    /// Load hardware configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigLoadError> {
        if !path.exists() {
            return Err(ConfigLoadError::NotFound(path.display().to_string()));
        }
        debug!("Loading hardware config from: {}", path.display());
        let config: HardwareConfig = Figment::new()
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| ConfigLoadError::ParseError(e.to_string()))?;
        config.validate()?;
        info!(
            path = %path.display(),
            instruments = config.instruments.len(),
            "Loaded hardware config"
        );
        Ok(config)
    }

    /// Parse from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigLoadError> {
        let config: HardwareConfig = Figment::new()
            .merge(Toml::string(contents))
            .extract()
            .map_err(|e| ConfigLoadError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Ids must be non-empty and unique.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        let mut seen = HashSet::new();
        let mut errors = Vec::new();
        for instrument in &self.instruments {
            if instrument.id.trim().is_empty() {
                errors.push(format!("instrument of type '{}' has an empty id", instrument.driver_type));
            } else if !seen.insert(instrument.id.as_str()) {
                errors.push(format!("duplicate instrument id '{}'", instrument.id));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigLoadError::ValidationError(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[instruments]]
id = "dac"
name = "DC source"
type = "mock_voltage_source"
[instruments.config]
channels = 4
max_voltage = 2.5

[[instruments]]
id = "lockin"
type = "mock_lockin"
"#;

    #[test]
    fn test_parse_instruments() {
        let config = HardwareConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.instruments.len(), 2);
        let dac = &config.instruments[0];
        assert_eq!(dac.driver_type, "mock_voltage_source");
        assert_eq!(dac.display_name(), "DC source");
        assert_eq!(dac.config.get("channels").and_then(|v| v.as_integer()), Some(4));
        let lockin = &config.instruments[1];
        assert_eq!(lockin.display_name(), "lockin");
        assert!(lockin.config.as_table().is_some_and(|t| t.is_empty()));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let text = r#"
[[instruments]]
id = "a"
type = "mock_counter"
[[instruments]]
id = "a"
type = "mock_counter"
"#;
        assert!(matches!(
            HardwareConfig::from_toml_str(text),
            Err(ConfigLoadError::ValidationError(_))
        ));
    }

    #[test]
    fn test_missing_type_is_parse_error() {
        let text = "[[instruments]]\nid = \"a\"\n";
        assert!(matches!(
            HardwareConfig::from_toml_str(text),
            Err(ConfigLoadError::ParseError(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = HardwareConfig::from_file(Path::new("/nonexistent/hardware.toml")).unwrap_err();
        assert!(matches!(err, ConfigLoadError::NotFound(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hardware.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = HardwareConfig::from_file(&path).unwrap();
        assert_eq!(config.instruments[0].id, "dac");
    }
}
