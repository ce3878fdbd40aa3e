//! Instrument registry.
//!
//! The registry owns every instrument of a setup, keyed by a string id, and
//! hands out capability trait objects. Sweeps resolve their instruments here,
//! check that handles they were given still belong to the registered entry,
//! and take exclusive sessions over the instruments they drive.
//!
//! Drivers enter through [`DriverFactory`] objects registered with
//! [`InstrumentRegistry::register_factory`]; configured instruments are then
//! built from [`InstrumentConfig`] entries.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use qdaq_core::capabilities::{
    BufferedAcquisition, FunctionGenerator, Parameterized, Readable, SegmentedDigitizer,
    SupportsRampedSweep, Sweepable, WaveformUploader,
};
use qdaq_core::driver::{Capability, DriverFactory, InstrumentComponents};
use qdaq_core::parameter::ParameterSet;
use qdaq_core::{QdaqError, QdaqResult};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{HardwareConfig, InstrumentConfig};
use crate::resource::ExclusiveSession;

// =============================================================================
// Handle Identity
// =============================================================================

/// Identity of the object behind a capability handle.
///
/// Two handles compare equal when they point at the same instrument object,
/// whichever capability trait they were cast to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(usize);

impl HandleId {
    /// Identity of `handle`.
    pub fn of<T: ?Sized>(handle: &Arc<T>) -> Self {
        Self(Arc::as_ptr(handle).cast::<()>() as usize)
    }
}

fn component_handles(components: &InstrumentComponents) -> Vec<HandleId> {
    let mut ids = Vec::new();
    if let Some(h) = &components.readable {
        ids.push(HandleId::of(h));
    }
    if let Some(h) = &components.sweepable {
        ids.push(HandleId::of(h));
    }
    if let Some(h) = &components.ramped {
        ids.push(HandleId::of(h));
    }
    if let Some(h) = &components.buffered {
        ids.push(HandleId::of(h));
    }
    if let Some(h) = &components.digitizer {
        ids.push(HandleId::of(h));
    }
    if let Some(h) = &components.uploader {
        ids.push(HandleId::of(h));
    }
    if let Some(h) = &components.function_generator {
        ids.push(HandleId::of(h));
    }
    if let Some(h) = &components.parameterized {
        ids.push(HandleId::of(h));
    }
    ids
}

// =============================================================================
// Registry Entries
// =============================================================================

/// Summary of a registered instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentInfo {
    /// Registry id
    pub id: String,
    /// Display name
    pub name: String,
    /// Driver type that built it (`"manual"` for direct registration)
    pub driver_type: String,
    /// Capabilities it exposes
    pub capabilities: Vec<Capability>,
}

struct RegisteredInstrument {
    name: String,
    driver_type: String,
    components: InstrumentComponents,
    lock: Arc<Mutex<()>>,
}

impl RegisteredInstrument {
    fn info(&self, id: &str) -> InstrumentInfo {
        InstrumentInfo {
            id: id.to_string(),
            name: self.name.clone(),
            driver_type: self.driver_type.clone(),
            capabilities: self.components.capabilities(),
        }
    }
}

// =============================================================================
// InstrumentRegistry
// =============================================================================

/// Central registry of instruments and the factories that build them.
#[derive(Default)]
pub struct InstrumentRegistry {
    factories: HashMap<&'static str, Box<dyn DriverFactory>>,
    instruments: HashMap<String, RegisteredInstrument>,
}

impl InstrumentRegistry {
    /// Empty registry without factories.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the given factories registered.
    pub fn with_factories(factories: Vec<Box<dyn DriverFactory>>) -> Self {
        let mut registry = Self::new();
        for factory in factories {
            registry.register_factory(factory);
        }
        registry
    }

    // -------------------------------------------------------------------------
    // Factories
    // -------------------------------------------------------------------------

    /// Register a driver factory. A factory with the same type replaces the old one.
    pub fn register_factory(&mut self, factory: Box<dyn DriverFactory>) {
        let driver_type = factory.driver_type();
        if self.factories.insert(driver_type, factory).is_some() {
            warn!(driver_type, "Replaced driver factory");
        } else {
            debug!(driver_type, "Registered driver factory");
        }
    }

    /// Registered driver types, sorted.
    pub fn factory_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.factories.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Check an entry against its factory without building anything.
    pub fn validate_config(&self, config: &InstrumentConfig) -> Result<()> {
        let factory = self.factories.get(config.driver_type.as_str()).ok_or_else(|| {
            anyhow!(
                "Instrument '{}': unknown driver type '{}' (known: {})",
                config.id,
                config.driver_type,
                self.factory_types().join(", ")
            )
        })?;
        factory
            .validate(&config.config)
            .map_err(|e| anyhow!("Instrument '{}': {}", config.id, e))
    }

    /// Build an entry through its factory and register every instrument it yields.
    ///
    /// Returns the registered ids (`<id><suffix>`). Nothing is registered if any
    /// resulting id is taken.
    pub async fn register_from_config(&mut self, config: &InstrumentConfig) -> Result<Vec<String>> {
        self.validate_config(config)?;
        let factory = self
            .factories
            .get(config.driver_type.as_str())
            .ok_or_else(|| anyhow!("unknown driver type '{}'", config.driver_type))?;
        let built = factory.build(config.config.clone()).await?;

        let ids: Vec<String> = built
            .iter()
            .map(|(suffix, _)| format!("{}{}", config.id, suffix))
            .collect();
        if let Some(taken) = ids.iter().find(|id| self.instruments.contains_key(id.as_str())) {
            return Err(anyhow!("Instrument '{}' is already registered", taken));
        }

        let driver_type = config.driver_type.clone();
        for ((suffix, components), id) in built.into_iter().zip(&ids) {
            let name = if suffix.is_empty() {
                config.display_name().to_string()
            } else {
                format!("{} {}", config.display_name(), suffix.trim_start_matches('_'))
            };
            self.insert(id.clone(), name, driver_type.clone(), components);
        }
        info!(
            id = %config.id,
            driver_type = %config.driver_type,
            instruments = ids.len(),
            "Registered instruments from config"
        );
        Ok(ids)
    }

    // -------------------------------------------------------------------------
    // Instruments
    // -------------------------------------------------------------------------

    /// Register an instrument built by hand.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        components: InstrumentComponents,
    ) -> QdaqResult<()> {
        let id = id.into();
        if self.instruments.contains_key(&id) {
            return Err(QdaqError::Configuration(format!(
                "Instrument '{}' is already registered",
                id
            )));
        }
        self.insert(id, name.into(), "manual".to_string(), components);
        Ok(())
    }

    fn insert(&mut self, id: String, name: String, driver_type: String, components: InstrumentComponents) {
        debug!(%id, capabilities = ?components.capabilities(), "Registered instrument");
        self.instruments.insert(
            id,
            RegisteredInstrument {
                name,
                driver_type,
                components,
                lock: Arc::new(Mutex::new(())),
            },
        );
    }

    /// Remove an instrument. Returns false if it was not registered.
    pub fn unregister(&mut self, id: &str) -> bool {
        let removed = self.instruments.remove(id).is_some();
        if removed {
            debug!(%id, "Unregistered instrument");
        }
        removed
    }

    /// True if `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.instruments.contains_key(id)
    }

    /// Number of registered instruments.
    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    /// All instruments, sorted by id.
    pub fn list_instruments(&self) -> Vec<InstrumentInfo> {
        let mut list: Vec<_> = self
            .instruments
            .iter()
            .map(|(id, entry)| entry.info(id))
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Summary of one instrument.
    pub fn info(&self, id: &str) -> Option<InstrumentInfo> {
        self.instruments.get(id).map(|entry| entry.info(id))
    }

    /// Ids of instruments with `capability`, sorted.
    pub fn instruments_with_capability(&self, capability: Capability) -> Vec<String> {
        let mut ids: Vec<_> = self
            .instruments
            .iter()
            .filter(|(_, entry)| entry.components.capabilities().contains(&capability))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Full capability bag of an instrument.
    pub fn components(&self, id: &str) -> Option<&InstrumentComponents> {
        self.instruments.get(id).map(|entry| &entry.components)
    }

    // -------------------------------------------------------------------------
    // Capability lookups
    // -------------------------------------------------------------------------

    /// Readable handle of `id`.
    pub fn get_readable(&self, id: &str) -> Option<Arc<dyn Readable>> {
        self.components(id)?.readable.clone()
    }

    /// Sweepable handle of `id`.
    pub fn get_sweepable(&self, id: &str) -> Option<Arc<dyn Sweepable>> {
        self.components(id)?.sweepable.clone()
    }

    /// Ramp control of `id`.
    pub fn get_ramped(&self, id: &str) -> Option<Arc<dyn SupportsRampedSweep>> {
        self.components(id)?.ramped.clone()
    }

    /// Sample buffer of `id`.
    pub fn get_buffered(&self, id: &str) -> Option<Arc<dyn BufferedAcquisition>> {
        self.components(id)?.buffered.clone()
    }

    /// Digitizer of `id`.
    pub fn get_digitizer(&self, id: &str) -> Option<Arc<dyn SegmentedDigitizer>> {
        self.components(id)?.digitizer.clone()
    }

    /// Waveform uploader of `id`.
    pub fn get_uploader(&self, id: &str) -> Option<Arc<dyn WaveformUploader>> {
        self.components(id)?.uploader.clone()
    }

    /// Function generator of `id`.
    pub fn get_function_generator(&self, id: &str) -> Option<Arc<dyn FunctionGenerator>> {
        self.components(id)?.function_generator.clone()
    }

    /// Parameter owner of `id`.
    pub fn get_parameterized(&self, id: &str) -> Option<Arc<dyn Parameterized>> {
        self.components(id)?.parameterized.clone()
    }

    /// Parameters of `id`.
    pub fn get_parameters(&self, id: &str) -> Option<&ParameterSet> {
        self.components(id)?
            .parameterized
            .as_ref()
            .map(|p| p.parameters())
    }

    fn require<T: ?Sized>(
        &self,
        id: &str,
        capability: Capability,
        pick: impl FnOnce(&InstrumentComponents) -> Option<Arc<T>>,
    ) -> QdaqResult<Arc<T>> {
        let components = self.components(id).ok_or_else(|| {
            QdaqError::Referential(format!("instrument '{}' is not registered", id))
        })?;
        pick(components).ok_or_else(|| {
            QdaqError::Configuration(format!(
                "instrument '{}' does not provide {}",
                id,
                capability.name()
            ))
        })
    }

    /// Readable handle of `id`, or the error explaining why there is none.
    pub fn require_readable(&self, id: &str) -> QdaqResult<Arc<dyn Readable>> {
        self.require(id, Capability::Readable, |c| c.readable.clone())
    }

    /// Sweepable handle of `id`, or the error explaining why there is none.
    pub fn require_sweepable(&self, id: &str) -> QdaqResult<Arc<dyn Sweepable>> {
        self.require(id, Capability::Sweepable, |c| c.sweepable.clone())
    }

    /// Ramp control of `id`, or the error explaining why there is none.
    pub fn require_ramped(&self, id: &str) -> QdaqResult<Arc<dyn SupportsRampedSweep>> {
        self.require(id, Capability::RampedSweep, |c| c.ramped.clone())
    }

    /// Sample buffer of `id`, or the error explaining why there is none.
    pub fn require_buffered(&self, id: &str) -> QdaqResult<Arc<dyn BufferedAcquisition>> {
        self.require(id, Capability::BufferedAcquisition, |c| c.buffered.clone())
    }

    /// Digitizer of `id`, or the error explaining why there is none.
    pub fn require_digitizer(&self, id: &str) -> QdaqResult<Arc<dyn SegmentedDigitizer>> {
        self.require(id, Capability::SegmentedDigitizer, |c| c.digitizer.clone())
    }

    /// Waveform uploader of `id`, or the error explaining why there is none.
    pub fn require_uploader(&self, id: &str) -> QdaqResult<Arc<dyn WaveformUploader>> {
        self.require(id, Capability::WaveformUploader, |c| c.uploader.clone())
    }

    /// Function generator of `id`, or the error explaining why there is none.
    pub fn require_function_generator(&self, id: &str) -> QdaqResult<Arc<dyn FunctionGenerator>> {
        self.require(id, Capability::FunctionGenerator, |c| {
            c.function_generator.clone()
        })
    }

    /// Check that `handle` belongs to the instrument registered as `id`.
    ///
    /// Fails with [`QdaqError::Referential`] when `id` is unknown or was
    /// re-registered with a different object.
    pub fn verify(&self, id: &str, handle: HandleId) -> QdaqResult<()> {
        let components = self.components(id).ok_or_else(|| {
            QdaqError::Referential(format!("instrument '{}' is not registered", id))
        })?;
        if component_handles(components).contains(&handle) {
            Ok(())
        } else {
            Err(QdaqError::Referential(format!(
                "handle does not belong to the instrument registered as '{}'",
                id
            )))
        }
    }

    // -------------------------------------------------------------------------
    // Parameters
    // -------------------------------------------------------------------------

    /// Parameter values of every parameterized instrument, keyed by id.
    pub fn snapshot_all_parameters(
        &self,
    ) -> BTreeMap<String, serde_json::Map<String, serde_json::Value>> {
        self.instruments
            .iter()
            .filter_map(|(id, entry)| {
                entry
                    .components
                    .parameterized
                    .as_ref()
                    .map(|p| (id.clone(), p.parameters().snapshot()))
            })
            .collect()
    }

    /// Snapshot restricted to `ids`. Unknown or unparameterized ids are skipped.
    pub fn snapshot_parameters(
        &self,
        ids: &[&str],
    ) -> BTreeMap<String, serde_json::Map<String, serde_json::Value>> {
        ids.iter()
            .filter_map(|id| {
                self.get_parameters(id)
                    .map(|params| (id.to_string(), params.snapshot()))
            })
            .collect()
    }

    fn parameters_of(&self, id: &str) -> QdaqResult<&ParameterSet> {
        if !self.contains(id) {
            return Err(QdaqError::Referential(format!(
                "instrument '{}' is not registered",
                id
            )));
        }
        self.get_parameters(id).ok_or_else(|| {
            QdaqError::Configuration(format!("instrument '{}' has no parameters", id))
        })
    }

    /// Set a named parameter from JSON.
    pub fn set_parameter(&self, id: &str, name: &str, value: serde_json::Value) -> QdaqResult<()> {
        self.parameters_of(id)?.set_json(name, value)
    }

    /// Read a named parameter as JSON.
    pub fn get_parameter(&self, id: &str, name: &str) -> QdaqResult<serde_json::Value> {
        self.parameters_of(id)?
            .get(name)
            .ok_or_else(|| QdaqError::validation(name, "no such parameter"))?
            .get_json()
    }

    // -------------------------------------------------------------------------
    // Exclusive access
    // -------------------------------------------------------------------------

    /// Take every instrument in `ids` for exclusive use.
    ///
    /// Duplicates are ignored. Fails without waiting if any instrument is held
    /// by another session; nothing stays locked on failure.
    pub fn acquire_exclusive(&self, ids: &[&str]) -> QdaqResult<ExclusiveSession> {
        let mut wanted: Vec<&str> = ids.to_vec();
        wanted.sort_unstable();
        wanted.dedup();

        let mut guards = Vec::with_capacity(wanted.len());
        for id in wanted {
            let entry = self.instruments.get(id).ok_or_else(|| {
                QdaqError::Referential(format!("instrument '{}' is not registered", id))
            })?;
            let guard = entry.lock.clone().try_lock_owned().map_err(|_| {
                QdaqError::ResourceBusy(format!("instrument '{}' is in use by another sweep", id))
            })?;
            guards.push((id.to_string(), guard));
        }
        Ok(ExclusiveSession::new(guards))
    }
}

// =============================================================================
// Construction from configuration
// =============================================================================

/// Build a registry from a hardware configuration using `factories`.
///
/// Every entry is validated first and all validation errors are reported
/// together. Entries that pass validation but fail to build are logged and
/// skipped.
pub async fn create_registry_with_factories(
    config: &HardwareConfig,
    factories: Vec<Box<dyn DriverFactory>>,
) -> Result<InstrumentRegistry> {
    let mut registry = InstrumentRegistry::with_factories(factories);

    let errors: Vec<String> = config
        .instruments
        .iter()
        .filter_map(|entry| registry.validate_config(entry).err())
        .map(|e| e.to_string())
        .collect();
    if !errors.is_empty() {
        return Err(anyhow!(
            "Hardware configuration has {} invalid instrument(s):\n  {}",
            errors.len(),
            errors.join("\n  ")
        ));
    }

    for entry in &config.instruments {
        if let Err(e) = registry.register_from_config(entry).await {
            warn!(
                id = %entry.id,
                driver_type = %entry.driver_type,
                error = %e,
                "Failed to register instrument, continuing"
            );
        }
    }

    info!(instruments = registry.len(), "Instrument registry ready");
    Ok(registry)
}

/// Build a registry from a hardware configuration with the built-in drivers.
pub async fn create_registry_from_config(config: &HardwareConfig) -> Result<InstrumentRegistry> {
    create_registry_with_factories(config, qdaq_driver_mock::mock_factories()).await
}

/// Registry with one of every simulated instrument.
///
/// | id | driver |
/// |----|--------|
/// | `dac_ch1` .. `dac_ch8` | voltage source channels |
/// | `lockin` | lock-in amplifier |
/// | `counter` | counter |
/// | `scope` | segmented digitizer |
/// | `awg` | waveform generator |
/// | `fgen` | two-channel function generator |
pub async fn create_mock_registry() -> Result<InstrumentRegistry> {
    let config = HardwareConfig {
        instruments: vec![
            InstrumentConfig::new("dac", "mock_voltage_source").with_name("Mock DAC"),
            InstrumentConfig::new("lockin", "mock_lockin").with_name("Mock lock-in"),
            InstrumentConfig::new("counter", "mock_counter").with_name("Mock counter"),
            InstrumentConfig::new("scope", "mock_scope").with_name("Mock scope"),
            InstrumentConfig::new("awg", "mock_awg").with_name("Mock AWG"),
            InstrumentConfig::new("fgen", "mock_function_generator")
                .with_name("Mock function generator"),
        ],
    };
    create_registry_from_config(&config).await
}
