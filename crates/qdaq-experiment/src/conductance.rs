//! Fast two-dimensional conductance maps.
//!
//! The outer axis is stepped by the sweep driver. The inner axis is swept
//! inside a [`BufferedDetector`]: one lock-in trigger per inner point, read
//! back as a buffer and converted to conductance in units of e²/h.

use std::sync::Arc;

use qdaq_core::config::SweepTiming;
use qdaq_core::limits::conductance_quanta;
use qdaq_core::{CancelToken, QdaqError, QdaqResult};
use qdaq_hardware::InstrumentRegistry;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::detector::{BufferedDetector, Detector};
use crate::sweep::{SweepAxis, SweepDriver, SweepOutcome};

/// Unit of converted conductance.
pub const CONDUCTANCE_UNIT: &str = "e^2/h";

/// Amplifier chain of a conductance measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConductanceSettings {
    /// Current-to-voltage gain (V/A).
    pub iv_gain: f64,
    /// AC excitation at the sample (V).
    pub excitation: f64,
    /// Trigger timing margins.
    #[serde(default)]
    pub timing: SweepTiming,
}

impl ConductanceSettings {
    /// Settings with default timing.
    pub fn new(iv_gain: f64, excitation: f64) -> Self {
        Self {
            iv_gain,
            excitation,
            timing: SweepTiming::default(),
        }
    }

    fn validate(&self) -> QdaqResult<()> {
        for (name, value) in [("iv_gain", self.iv_gain), ("excitation", self.excitation)] {
            if !(value.is_finite() && value != 0.0) {
                return Err(QdaqError::Configuration(format!(
                    "{} must be finite and non-zero, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Map conductance over `outer` × `inner` with the lock-in registered as `lockin`.
///
/// The lock-in must display `X`; other outputs do not convert linearly.
pub async fn fast_conductance_2d(
    registry: &InstrumentRegistry,
    outer: &SweepAxis,
    inner: SweepAxis,
    lockin: &str,
    settings: ConductanceSettings,
    cancel: CancelToken,
) -> QdaqResult<SweepOutcome> {
    settings.validate()?;
    let display = registry.get_parameter(lockin, "display")?;
    if display.as_str() != Some("X") {
        return Err(QdaqError::Configuration(format!(
            "lock-in '{}' must display X for conductance, shows {}",
            lockin, display
        )));
    }

    let ConductanceSettings {
        iv_gain,
        excitation,
        timing,
    } = settings;
    info!(
        outer = %outer.id(),
        inner = %inner.id(),
        inner_npts = inner.npts,
        iv_gain,
        excitation,
        "Starting fast conductance map"
    );

    let detector = BufferedDetector::from_registry(registry, lockin)?
        .with_fast_axis(inner)
        .with_timing(timing)
        .with_conversion(CONDUCTANCE_UNIT, move |x| {
            conductance_quanta(x, iv_gain, excitation)
        });
    let detectors: Vec<Arc<dyn Detector>> = vec![Arc::new(detector)];

    SweepDriver::new(registry)
        .with_timing(timing)
        .with_cancel(cancel)
        .do1d(outer, &detectors)
        .await
}
