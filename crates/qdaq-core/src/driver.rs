//! Driver Factory and Component Types
//!
//! Drivers implement [`DriverFactory`] and are registered with the
//! `InstrumentRegistry` at startup via explicit `registry.register_factory(...)`
//! calls. Building a driver yields [`InstrumentComponents`], a bag of capability
//! trait objects the registry indexes for capability-based lookups.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                 Composition Root (setup)                  │
//! │  registry.register_factory(MockLockinFactory);            │
//! │  registry.register_factory(MockVoltageSourceFactory);     │
//! └───────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │                   InstrumentRegistry                      │
//! │  factories:   HashMap<driver_type, Box<dyn DriverFactory>>│
//! │  instruments: HashMap<id, InstrumentComponents>           │
//! └───────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │                  DriverFactory::build()                   │
//! │  Parses TOML config, instantiates driver, returns parts   │
//! └───────────────────────────────────────────────────────────┘
//! ```

use crate::capabilities::{
    BufferedAcquisition, FunctionGenerator, Parameterized, Readable, SegmentedDigitizer,
    SupportsRampedSweep, Sweepable, WaveformUploader,
};
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Capability Enum (Runtime Introspection)
// =============================================================================

/// Runtime capability flags for instrument introspection.
///
/// Mirrors the capability traits as an enum for listing and matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Corresponds to [`crate::capabilities::Readable`]
    Readable,
    /// Corresponds to [`crate::capabilities::Sweepable`]
    Sweepable,
    /// Corresponds to [`crate::capabilities::SupportsRampedSweep`]
    RampedSweep,
    /// Corresponds to [`crate::capabilities::BufferedAcquisition`]
    BufferedAcquisition,
    /// Corresponds to [`crate::capabilities::SegmentedDigitizer`]
    SegmentedDigitizer,
    /// Corresponds to [`crate::capabilities::WaveformUploader`]
    WaveformUploader,
    /// Corresponds to [`crate::capabilities::FunctionGenerator`]
    FunctionGenerator,
    /// Corresponds to [`crate::capabilities::Parameterized`]
    Parameterized,
}

impl Capability {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Readable => "Readable",
            Self::Sweepable => "Sweepable",
            Self::RampedSweep => "Ramped Sweep",
            Self::BufferedAcquisition => "Buffered Acquisition",
            Self::SegmentedDigitizer => "Segmented Digitizer",
            Self::WaveformUploader => "Waveform Uploader",
            Self::FunctionGenerator => "Function Generator",
            Self::Parameterized => "Parameterized",
        }
    }
}

// =============================================================================
// Instrument Components (Capability Bag)
// =============================================================================

/// Container for capability trait objects returned by drivers.
///
/// ```rust,ignore
/// let channel = Arc::new(source.channel(1)?);
///
/// let components = InstrumentComponents::new()
///     .with_sweepable(channel.clone())
///     .with_ramped(channel.clone())
///     .with_parameterized(channel);
/// ```
#[derive(Default, Clone)]
pub struct InstrumentComponents {
    /// Scalar readout
    pub readable: Option<Arc<dyn Readable>>,
    /// Swept parameter
    pub sweepable: Option<Arc<dyn Sweepable>>,
    /// Ramp slope control
    pub ramped: Option<Arc<dyn SupportsRampedSweep>>,
    /// Triggered sample buffer
    pub buffered: Option<Arc<dyn BufferedAcquisition>>,
    /// Segmented digitizer
    pub digitizer: Option<Arc<dyn SegmentedDigitizer>>,
    /// Waveform generator
    pub uploader: Option<Arc<dyn WaveformUploader>>,
    /// Function generator
    pub function_generator: Option<Arc<dyn FunctionGenerator>>,
    /// Named parameters
    pub parameterized: Option<Arc<dyn Parameterized>>,
}

impl InstrumentComponents {
    /// Create an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Capabilities present in this bag.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        if self.readable.is_some() {
            caps.push(Capability::Readable);
        }
        if self.sweepable.is_some() {
            caps.push(Capability::Sweepable);
        }
        if self.ramped.is_some() {
            caps.push(Capability::RampedSweep);
        }
        if self.buffered.is_some() {
            caps.push(Capability::BufferedAcquisition);
        }
        if self.digitizer.is_some() {
            caps.push(Capability::SegmentedDigitizer);
        }
        if self.uploader.is_some() {
            caps.push(Capability::WaveformUploader);
        }
        if self.function_generator.is_some() {
            caps.push(Capability::FunctionGenerator);
        }
        if self.parameterized.is_some() {
            caps.push(Capability::Parameterized);
        }
        caps
    }

    // Builder methods

    /// Set Readable implementation
    pub fn with_readable(mut self, r: Arc<dyn Readable>) -> Self {
        self.readable = Some(r);
        self
    }

    /// Set Sweepable implementation
    pub fn with_sweepable(mut self, s: Arc<dyn Sweepable>) -> Self {
        self.sweepable = Some(s);
        self
    }

    /// Set SupportsRampedSweep implementation
    pub fn with_ramped(mut self, r: Arc<dyn SupportsRampedSweep>) -> Self {
        self.ramped = Some(r);
        self
    }

    /// Set BufferedAcquisition implementation
    pub fn with_buffered(mut self, b: Arc<dyn BufferedAcquisition>) -> Self {
        self.buffered = Some(b);
        self
    }

    /// Set SegmentedDigitizer implementation
    pub fn with_digitizer(mut self, d: Arc<dyn SegmentedDigitizer>) -> Self {
        self.digitizer = Some(d);
        self
    }

    /// Set WaveformUploader implementation
    pub fn with_uploader(mut self, u: Arc<dyn WaveformUploader>) -> Self {
        self.uploader = Some(u);
        self
    }

    /// Set FunctionGenerator implementation
    pub fn with_function_generator(mut self, f: Arc<dyn FunctionGenerator>) -> Self {
        self.function_generator = Some(f);
        self
    }

    /// Set Parameterized implementation
    pub fn with_parameterized(mut self, p: Arc<dyn Parameterized>) -> Self {
        self.parameterized = Some(p);
        self
    }
}

// =============================================================================
// Driver Factory Trait
// =============================================================================

/// Trait for driver factories that create instrument instances.
///
/// Factories are registered once at startup and live for the program's lifetime.
/// `build()` may return several instruments (a multi-channel source registers one
/// entry per channel), each under `<id><suffix>`.
pub trait DriverFactory: Send + Sync + 'static {
    /// Driver type name used in the TOML `type` field.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for documentation and error messages.
    fn name(&self) -> &'static str;

    /// Capabilities this driver type provides.
    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Validate configuration without instantiating.
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Instantiate the driver.
    ///
    /// Returns `(suffix, components)` pairs. Single-instrument drivers return one
    /// pair with an empty suffix.
    fn build(
        &self,
        config: toml::Value,
    ) -> BoxFuture<'static, Result<Vec<(String, InstrumentComponents)>>>;
}
