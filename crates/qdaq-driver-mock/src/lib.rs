//! Mock Instrument Drivers for rust-qdaq
//!
//! Simulated instruments for running sequences and sweeps without hardware.
//! All waits use `tokio::time::sleep`, so tests can run on a paused clock.
//!
//! # Available Mock Drivers
//!
//! - [`MockVoltageSource`] - Multi-channel DC source with ramp-limited channels
//! - [`MockLockin`] - Lock-in amplifier with a triggered, counter-valued buffer
//! - [`MockCounter`] - Readable returning 1, 2, 3, ...
//! - [`MockScope`] - Segmented scope module
//! - [`MockAwg`] - Arbitrary waveform generator decoding its uploads
//! - [`MockFunctionGenerator`] - Ramp/burst function generator
//!
//! # Driver Factory Pattern
//!
//! Each mock driver provides a `DriverFactory` implementation for use with
//! the qdaq-hardware registry:
//!
//! ```rust,ignore
//! use qdaq_driver_mock::mock_factories;
//! use qdaq_hardware::InstrumentRegistry;
//!
//! let mut registry = InstrumentRegistry::new();
//! for factory in mock_factories() {
//!     registry.register_factory(factory);
//! }
//! ```

pub mod common;
mod mock_awg;
mod mock_function_generator;
mod mock_lockin;
mod mock_scope;
mod mock_voltage_source;

use qdaq_core::driver::DriverFactory;

// Re-export common types
pub use common::{ErrorConfig, ErrorScenario, MockMode, MockRng, TimingConfig};

// Re-export driver types
pub use mock_awg::{MockAwg, MockAwgConfig, MockAwgFactory, ReceivedUpload};
pub use mock_function_generator::{
    ChannelWaveformSetup, MockFunctionGenerator, MockFunctionGeneratorConfig,
    MockFunctionGeneratorFactory,
};
pub use mock_lockin::{
    MockCounter, MockCounterConfig, MockCounterFactory, MockLockin, MockLockinConfig,
    MockLockinFactory, DISPLAY_CHOICES,
};
pub use mock_scope::{MockScope, MockScopeConfig, MockScopeFactory, SignalFn};
pub use mock_voltage_source::{
    MockSourceChannel, MockVoltageSource, MockVoltageSourceBuilder, MockVoltageSourceConfig,
    MockVoltageSourceFactory,
};

/// Every mock factory, for registering with an instrument registry.
pub fn mock_factories() -> Vec<Box<dyn DriverFactory>> {
    vec![
        Box::new(MockVoltageSourceFactory),
        Box::new(MockLockinFactory),
        Box::new(MockCounterFactory),
        Box::new(MockScopeFactory),
        Box::new(MockAwgFactory),
        Box::new(MockFunctionGeneratorFactory),
    ]
}
