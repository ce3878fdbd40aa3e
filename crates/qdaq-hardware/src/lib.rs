//! Instrument registry and hardware configuration.
//!
//! ```rust,ignore
//! let config = HardwareConfig::from_file(Path::new("config/hardware.toml"))?;
//! let registry = create_registry_from_config(&config).await?;
//!
//! let gate = registry.require_sweepable("dac_ch1")?;
//! let session = registry.acquire_exclusive(&["dac_ch1", "lockin"])?;
//! ```

pub mod config;
pub mod registry;
pub mod resource;

pub use config::{ConfigLoadError, HardwareConfig, InstrumentConfig};
pub use registry::{
    create_mock_registry, create_registry_from_config, create_registry_with_factories, HandleId,
    InstrumentInfo, InstrumentRegistry,
};
pub use resource::ExclusiveSession;
