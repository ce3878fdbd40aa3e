//! Configuration Store
//!
//! Key/value sections on disk (gain factors, channel labels, channel ranges,
//! ramp slopes) consumed while setting up an experiment. Loaded with figment from
//! a TOML file, then overridden by `QDAQ_`-prefixed environment variables
//! (`QDAQ_RAMP_SPEEDS__QDAC=0.2` sets `[ramp_speeds] qdac`).
//!
//! ```toml
//! [gain_settings]
//! iv_gain = 1e8
//! ac_factor = 1e5
//!
//! [ramp_speeds]
//! qdac = 0.5
//!
//! [channel_labels]
//! "1" = "topo gate"
//!
//! [sweep]
//! min_demod_latency = 0.002
//! ```
//!
//! Procedures only need `get(section, field) -> String`; typed helpers sit on top.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{QdaqError, QdaqResult};
use crate::limits::{INTER_LOOP_MARGIN, MIN_DEMOD_LATENCY, MIN_SCOPE_BUFFER_LENGTH, WAVEFORM_MEMORY_SAMPLES};

/// Environment prefix for overrides.
pub const ENV_PREFIX: &str = "QDAQ_";

/// Scalar stored in a configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer value.
    Integer(i64),
    /// Floating point value.
    Float(f64),
    /// Free text.
    Text(String),
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(v) => write!(f, "{}", v),
            ConfigValue::Integer(v) => write!(f, "{}", v),
            ConfigValue::Float(v) => write!(f, "{}", v),
            ConfigValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Float(v)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Integer(v)
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::Text(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        ConfigValue::Text(v)
    }
}

type Sections = BTreeMap<String, BTreeMap<String, ConfigValue>>;

/// Sectioned key/value store backed by a TOML file.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    sections: Sections,
}

impl ConfigStore {
    /// Empty, in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a TOML file plus environment overrides.
    ///
    /// A missing file yields an empty store (environment overrides still apply);
    /// `set()` will create it.
    pub fn load(path: impl AsRef<Path>) -> QdaqResult<Self> {
        let path = path.as_ref();
        let sections: Sections = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        info!(path = %path.display(), sections = sections.len(), "Loaded configuration store");
        Ok(Self {
            path: Some(path.to_path_buf()),
            sections,
        })
    }

    /// Parse from a TOML string, without environment overrides.
    pub fn from_toml_str(contents: &str) -> QdaqResult<Self> {
        let sections: Sections = Figment::new().merge(Toml::string(contents)).extract()?;
        Ok(Self {
            path: None,
            sections,
        })
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Raw lookup as a string.
    pub fn get(&self, section: &str, field: &str) -> QdaqResult<String> {
        self.value(section, field).map(|v| v.to_string())
    }

    /// Lookup parsed as a float.
    pub fn get_f64(&self, section: &str, field: &str) -> QdaqResult<f64> {
        match self.value(section, field)? {
            ConfigValue::Float(v) => Ok(*v),
            ConfigValue::Integer(v) => Ok(*v as f64),
            other => other.to_string().trim().parse::<f64>().map_err(|_| {
                QdaqError::Configuration(format!(
                    "[{}] {} = '{}' is not a number",
                    section, field, other
                ))
            }),
        }
    }

    /// Lookup with a fallback when the field is absent.
    pub fn get_f64_or(&self, section: &str, field: &str, default: f64) -> QdaqResult<f64> {
        if self.contains(section, field) {
            self.get_f64(section, field)
        } else {
            Ok(default)
        }
    }

    /// True if the field exists.
    pub fn contains(&self, section: &str, field: &str) -> bool {
        self.sections
            .get(section)
            .is_some_and(|s| s.contains_key(field))
    }

    /// A whole section.
    pub fn section(&self, section: &str) -> Option<&BTreeMap<String, ConfigValue>> {
        self.sections.get(section)
    }

    /// Section names.
    pub fn section_names(&self) -> Vec<&str> {
        self.sections.keys().map(String::as_str).collect()
    }

    /// Deserialize a section into a typed struct, `T::default()` when absent.
    pub fn typed_section<T>(&self, section: &str) -> QdaqResult<T>
    where
        T: DeserializeOwned + Default,
    {
        match self.sections.get(section) {
            Some(values) => {
                let json = serde_json::to_value(values)?;
                Ok(serde_json::from_value(json)?)
            }
            None => Ok(T::default()),
        }
    }

    /// Update a field and write the store back to its file, if it has one.
    pub fn set(
        &mut self,
        section: &str,
        field: &str,
        value: impl Into<ConfigValue>,
    ) -> QdaqResult<()> {
        let value = value.into();
        debug!(section, field, value = %value, "Updating configuration value");
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(field.to_string(), value);
        if let Some(path) = &self.path {
            self.save_to(path)?;
        }
        Ok(())
    }

    /// Serialize all sections to a TOML file.
    pub fn save_to(&self, path: &Path) -> QdaqResult<()> {
        let text = toml::to_string(&self.sections)
            .map_err(|e| QdaqError::Serialization(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    fn value(&self, section: &str, field: &str) -> QdaqResult<&ConfigValue> {
        self.sections
            .get(section)
            .ok_or_else(|| QdaqError::Configuration(format!("missing config section [{}]", section)))?
            .get(field)
            .ok_or_else(|| {
                QdaqError::Configuration(format!("missing config field [{}] {}", section, field))
            })
    }
}

// =============================================================================
// Typed sections
// =============================================================================

fn default_min_demod_latency() -> f64 {
    MIN_DEMOD_LATENCY.as_secs_f64()
}

fn default_inter_loop_margin() -> f64 {
    INTER_LOOP_MARGIN.as_secs_f64()
}

/// Empirical timing margins of the synchronized sweep (`[sweep]` section).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepTiming {
    /// Added to the demodulator time constant before every trigger, seconds.
    #[serde(default = "default_min_demod_latency")]
    pub min_demod_latency: f64,
    /// Added to the inner-axis return ramp of a 2-D sweep, seconds.
    #[serde(default = "default_inter_loop_margin")]
    pub inter_loop_margin: f64,
}

impl Default for SweepTiming {
    fn default() -> Self {
        Self {
            min_demod_latency: default_min_demod_latency(),
            inter_loop_margin: default_inter_loop_margin(),
        }
    }
}

impl SweepTiming {
    /// Wait before each trigger for a given time constant.
    pub fn trigger_wait(&self, time_constant: f64) -> Duration {
        Duration::from_secs_f64((time_constant + self.min_demod_latency).max(0.0))
    }

    /// Load from the `[sweep]` section.
    pub fn from_store(store: &ConfigStore) -> QdaqResult<Self> {
        store.typed_section("sweep")
    }
}

fn default_memory_samples() -> usize {
    WAVEFORM_MEMORY_SAMPLES
}

fn default_min_buffer() -> usize {
    MIN_SCOPE_BUFFER_LENGTH
}

/// Platform limits (`[limits]` section).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionLimits {
    /// Waveform memory of the generator in samples.
    #[serde(default = "default_memory_samples")]
    pub waveform_memory_samples: usize,
    /// Minimum digitizer buffer length in samples.
    #[serde(default = "default_min_buffer")]
    pub min_buffer_length: usize,
}

impl Default for AcquisitionLimits {
    fn default() -> Self {
        Self {
            waveform_memory_samples: default_memory_samples(),
            min_buffer_length: default_min_buffer(),
        }
    }
}

impl AcquisitionLimits {
    /// Load from the `[limits]` section.
    pub fn from_store(store: &ConfigStore) -> QdaqResult<Self> {
        store.typed_section("limits")
    }
}
