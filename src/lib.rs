//! # rust-qdaq
//!
//! Pulse-sequence synthesis and synchronized acquisition for quantum-device
//! transport experiments. This facade re-exports the workspace crates and adds
//! the application edges: tracing initialization and the application config.
//!
//! ## Crate Structure
//!
//! - **`qdaq_core`**: errors, capability traits, parameters, limits,
//!   configuration store, cancellation, dataset model.
//! - **`qdaq_sequence`**: segments, blueprints, elements and
//!   sequences, rendering and the upload package, pulse builders.
//! - **`qdaq_hardware`**: the instrument registry and hardware
//!   configuration files.
//! - **`qdaq_driver_mock`**: simulated instruments.
//! - **`qdaq_experiment`**: rate matching, the sweep driver and
//!   the measurement procedures built on it.
//! - **`app_config`**: figment-based application configuration.
//! - **`tracing_setup`**: subscriber installation.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use rust_qdaq::prelude::*;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = AppConfig::load_from("config/qdaq.toml")?;
//! rust_qdaq::tracing_setup::init_from_config(&config)?;
//!
//! let registry = config.build_registry().await?;
//! let axis = SweepAxis::from_registry(&registry, "dac_ch1", 0.0, 0.5, 51)?;
//! let lockin: Arc<dyn Detector> = Arc::new(BufferedDetector::from_registry(&registry, "lockin")?);
//! let outcome = config.sweep_driver(&registry).do1d(&axis, &[lockin]).await?;
//! tracing::info!(rows = outcome.dataset.len(), "Done");
//! # Ok(())
//! # }
//! ```

pub mod app_config;
pub mod tracing_setup;

pub use qdaq_core;
pub use qdaq_driver_mock;
pub use qdaq_experiment;
pub use qdaq_hardware;
pub use qdaq_sequence;

pub use app_config::AppConfig;
pub use qdaq_core::{CancelToken, QdaqError, QdaqResult};

/// Types most programs need.
pub mod prelude {
    pub use crate::app_config::AppConfig;
    pub use qdaq_core::data::{Dataset, Reading};
    pub use qdaq_core::{CancelToken, QdaqError, QdaqResult};
    pub use qdaq_experiment::{
        correct_meas_time, BufferedDetector, Detector, SampleRateLadder, ScalarDetector,
        ScopeAverager, SweepAxis, SweepDriver, SweepOutcome,
    };
    pub use qdaq_hardware::InstrumentRegistry;
    pub use qdaq_sequence::{Blueprint, Element, Segment, Sequence};
}
