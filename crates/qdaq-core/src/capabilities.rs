//! Atomic Instrument Capabilities
//!
//! This module defines fine-grained capability traits that instruments implement.
//! Instead of one trait per vendor instrument, drivers implement the capabilities
//! they actually support:
//!
//! - A DC voltage source channel implements `Sweepable + SupportsRampedSweep`
//! - A lock-in amplifier implements `Readable + BufferedAcquisition`
//! - A scope module implements `SegmentedDigitizer`
//! - An arbitrary waveform generator implements `WaveformUploader`
//!
//! Procedures ask for capabilities, never for instrument classes. A sweep that
//! needs to know whether its slow axis ramps asks the registry for a
//! `SupportsRampedSweep` handle instead of inspecting a driver name.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses [`QdaqResult`] for errors
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn step_and_read<S, R>(source: &S, meter: &R, value: f64) -> QdaqResult<f64>
//! where
//!     S: Sweepable + ?Sized,
//!     R: Readable + ?Sized,
//! {
//!     source.set(value).await?;
//!     meter.read().await
//! }
//! ```

use crate::error::QdaqResult;
use crate::parameter::ParameterSet;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

// =============================================================================
// Scalar access
// =============================================================================

/// Capability: Scalar Readout
///
/// Instruments that produce a single value per call (DMM, lock-in X output).
#[async_trait]
pub trait Readable: Send + Sync {
    /// Perform one measurement.
    async fn read(&self) -> QdaqResult<f64>;
}

/// Capability: Swept Parameter
///
/// Anything a sweep can step: a voltage source channel, a divided gate voltage,
/// a pulse duration inside an uploaded sequence.
#[async_trait]
pub trait Sweepable: Send + Sync {
    /// Axis label used in dataset metadata.
    fn label(&self) -> &str;

    /// Physical unit of the swept value.
    fn unit(&self) -> &str {
        ""
    }

    /// Set the value. Returns once the instrument accepted the command, which for a
    /// ramped source is before the output has arrived.
    async fn set(&self, value: f64) -> QdaqResult<()>;

    /// Current value.
    async fn get(&self) -> QdaqResult<f64>;
}

/// Capability: Ramp-Limited Output
///
/// Sources that can bound how fast their output changes. While a slope is
/// assigned every `set()` ramps at that rate (V/s); unassigning returns the
/// channel to instantaneous response.
///
/// # Contract
/// - `unassign_slope()` on a channel without a slope fails with
///   [`crate::error::QdaqError::SlopeAlreadyUnassigned`]
/// - `slope()` returns `None` when unbounded
#[async_trait]
pub trait SupportsRampedSweep: Send + Sync {
    /// Bind a finite slope in units per second.
    async fn assign_slope(&self, slope: f64) -> QdaqResult<()>;

    /// Return the channel to unbounded slope.
    async fn unassign_slope(&self) -> QdaqResult<()>;

    /// Currently assigned slope, `None` when unbounded.
    async fn slope(&self) -> QdaqResult<Option<f64>>;
}

// =============================================================================
// Buffered demodulator
// =============================================================================

/// Capability: Triggered Sample Buffer
///
/// Lock-in style instruments that append one sample per trigger to an internal
/// buffer. The driver-side protocol per sweep step is
/// `reset_buffer → start_buffer → (send_trigger)* → read_buffer`.
#[async_trait]
pub trait BufferedAcquisition: Send + Sync {
    /// Discard buffered samples.
    async fn reset_buffer(&self) -> QdaqResult<()>;

    /// Start accepting triggers.
    async fn start_buffer(&self) -> QdaqResult<()>;

    /// Stop accepting triggers without discarding.
    async fn pause_buffer(&self) -> QdaqResult<()>;

    /// Issue a software trigger.
    async fn send_trigger(&self) -> QdaqResult<()>;

    /// Read back the buffered samples in trigger order.
    async fn read_buffer(&self) -> QdaqResult<Vec<f64>>;

    /// Demodulator filter time constant in seconds.
    async fn time_constant(&self) -> QdaqResult<f64>;
}

// =============================================================================
// Segmented digitizer
// =============================================================================

/// Trigger configuration of a segmented digitizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSettings {
    /// Trigger input name (e.g. "Trig Input 1").
    pub source: String,
    /// Trigger level in volts.
    pub level: f64,
    /// Delay between trigger and first recorded sample in seconds.
    pub delay: f64,
    /// Dead time after a segment before the next trigger is accepted.
    pub holdoff: f64,
    /// Trigger hysteresis in volts.
    pub hysteresis: f64,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            source: "Trig Input 1".to_string(),
            level: 0.5,
            delay: 1e-6,
            holdoff: 60e-6,
            hysteresis: 0.0,
        }
    }
}

/// Acquisition window of a segmented digitizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeSettings {
    /// Sample rate label as the instrument enumerates it (e.g. "113 MHz").
    pub sample_rate_label: String,
    /// Sample rate in Hz.
    pub sample_rate: f64,
    /// Samples per segment.
    pub length: usize,
    /// Segments recorded per acquisition.
    pub segments: usize,
    /// Channels to record (1-based).
    pub channels: Vec<u32>,
    /// Trigger setup.
    pub trigger: TriggerSettings,
}

/// One acquisition of a segmented digitizer: `channels[c][segment][sample]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeRecord {
    /// Per-channel segment data.
    pub channels: Vec<Vec<Vec<f64>>>,
}

impl ScopeRecord {
    /// Average all segments of one channel into a single trace.
    pub fn segment_average(&self, channel: usize) -> Option<Vec<f64>> {
        let segments = self.channels.get(channel)?;
        let first = segments.first()?;
        let mut acc = vec![0.0; first.len()];
        for segment in segments {
            for (a, s) in acc.iter_mut().zip(segment) {
                *a += s;
            }
        }
        let n = segments.len() as f64;
        acc.iter_mut().for_each(|a| *a /= n);
        Some(acc)
    }
}

/// Capability: Segmented Digitizer
///
/// Scope modules that record a number of equally long, individually triggered
/// segments per acquisition.
#[async_trait]
pub trait SegmentedDigitizer: Send + Sync {
    /// Apply sample rate, length, segment count and trigger setup.
    async fn configure(&self, settings: &ScopeSettings) -> QdaqResult<()>;

    /// Realized sample rate in Hz.
    async fn sample_rate(&self) -> QdaqResult<f64>;

    /// Arm or disarm the acquisition.
    async fn set_enabled(&self, enabled: bool) -> QdaqResult<()>;

    /// Record one acquisition (blocks until all segments arrived).
    async fn acquire(&self) -> QdaqResult<ScopeRecord>;
}

// =============================================================================
// Waveform generation
// =============================================================================

/// Capability: Sequenced Waveform Playback
///
/// Arbitrary waveform generators that accept an encoded sequence file.
#[async_trait]
pub trait WaveformUploader: Send + Sync {
    /// Sample clock in Hz.
    async fn clock_frequency(&self) -> QdaqResult<f64>;

    /// Output `(amplitude, offset)` of a channel in volts.
    async fn channel_range(&self, channel: u32) -> QdaqResult<(f64, f64)>;

    /// Transfer and load an encoded sequence file onto the given channels.
    async fn upload(&self, file_name: &str, payload: Bytes, channels: &[u32]) -> QdaqResult<()>;

    /// Switch a channel output.
    async fn set_channel_output(&self, channel: u32, on: bool) -> QdaqResult<()>;

    /// Start sequence playback.
    async fn run(&self) -> QdaqResult<()>;

    /// Stop sequence playback.
    async fn stop(&self) -> QdaqResult<()>;
}

/// Sawtooth/ramp output of a function generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RampWaveform {
    /// Peak-to-peak amplitude in volts.
    pub amplitude: f64,
    /// DC offset in volts.
    pub offset: f64,
    /// Repetition frequency in Hz.
    pub frequency: f64,
    /// Rising portion of the period in percent.
    pub symmetry: f64,
    /// Phase in degrees.
    pub phase: f64,
    /// Output polarity inverted.
    pub inverted: bool,
}

/// Finite burst of a periodic waveform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BurstSettings {
    /// Waveform frequency in Hz.
    pub frequency: f64,
    /// Peak-to-peak amplitude in volts.
    pub amplitude: f64,
    /// DC offset in volts.
    pub offset: f64,
    /// Cycles per burst.
    pub cycles: u32,
    /// Trigger source name.
    pub trigger_source: String,
}

/// Capability: Function Generator
#[async_trait]
pub trait FunctionGenerator: Send + Sync {
    /// Configure a continuous ramp.
    async fn configure_ramp(&self, channel: u32, waveform: &RampWaveform) -> QdaqResult<()>;

    /// Configure a triggered burst.
    async fn configure_burst(&self, channel: u32, burst: &BurstSettings) -> QdaqResult<()>;

    /// Switch a channel output.
    async fn set_output(&self, channel: u32, on: bool) -> QdaqResult<()>;

    /// Align the phases of all channels.
    async fn sync_phases(&self) -> QdaqResult<()>;
}

// =============================================================================
// Parameter registry access
// =============================================================================

/// Capability: Named Parameters
///
/// Exposes the instrument's [`ParameterSet`] for generic get/set access by name
/// and for metadata snapshots.
pub trait Parameterized: Send + Sync {
    /// The instrument's parameters.
    fn parameters(&self) -> &ParameterSet;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_average() {
        let record = ScopeRecord {
            channels: vec![vec![vec![1.0, 2.0], vec![3.0, 6.0]]],
        };
        assert_eq!(record.segment_average(0), Some(vec![2.0, 4.0]));
        assert_eq!(record.segment_average(1), None);
    }

    #[test]
    fn test_trigger_defaults() {
        let trigger = TriggerSettings::default();
        assert_eq!(trigger.holdoff, 60e-6);
        assert_eq!(trigger.delay, 1e-6);
    }
}
