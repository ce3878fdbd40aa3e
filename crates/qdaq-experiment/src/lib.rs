//! Experiment procedures for rust-qdaq.
//!
//! - [`rate_match`]: matching measurement times to digitizer sample rates
//! - [`sweep`]: the synchronized 1-D/2-D sweep driver
//! - [`detector`]: what a sweep records at each step
//! - [`conductance`]: fast two-dimensional conductance maps
//! - [`pulsed`]: pulse-width sweeps with a triggered ramp
//! - [`fast_charge`]: sawtooth-driven charge diagrams
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use qdaq_experiment::{BufferedDetector, Detector, SweepAxis, SweepDriver};
//!
//! # async fn run() -> qdaq_core::QdaqResult<()> {
//! let registry = qdaq_hardware::create_mock_registry()
//!     .await
//!     .map_err(|e| qdaq_core::QdaqError::Configuration(e.to_string()))?;
//! let axis = SweepAxis::from_registry(&registry, "dac_ch1", 0.0, 1.0, 11)?
//!     .with_slope(0.5)
//!     .with_delay(0.1);
//! let lockin: Arc<dyn Detector> = Arc::new(BufferedDetector::from_registry(&registry, "lockin")?);
//!
//! let outcome = SweepDriver::new(&registry).do1d(&axis, &[lockin]).await?;
//! assert_eq!(outcome.steps, 11);
//! # Ok(())
//! # }
//! ```

pub mod conductance;
pub mod detector;
pub mod fast_charge;
pub mod progress;
pub mod pulsed;
pub mod rate_match;
pub mod sweep;

pub use conductance::{fast_conductance_2d, ConductanceSettings};
pub use detector::{Acquisition, BufferedDetector, Detector, ScalarDetector, ScopeAverager};
pub use fast_charge::{fast_charge_diagram, FastChargeSettings, SawtoothPlan};
pub use progress::spawn_progress_monitor;
pub use pulsed::{
    prepare_burst_generator, run_pulsed_experiment, send_sequence_to_awg, AverageRampResponse,
    PulseTime, PulsedExperimentSettings, PulsedInstruments,
};
pub use rate_match::{correct_meas_time, MeasurementScopeSettings, RateChoice, SampleRateLadder};
pub use sweep::{linspace, SweepAxis, SweepDriver, SweepOutcome};
