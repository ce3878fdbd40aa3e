//! Physical and platform limits shared by sequence building and sweeps.
//!
//! Several of these are empirical hardware margins. They are kept as named
//! constants (and, where a procedure needs to tune them, as fields of
//! [`crate::config::SweepTiming`]) instead of being re-derived.

use std::time::Duration;

// =============================================================================
// Waveform generation
// =============================================================================

/// Waveform memory of the target arbitrary waveform generator, in samples.
pub const WAVEFORM_MEMORY_SAMPLES: usize = 16_000_000;

/// Sample clock used by the pulsed experiments (1 GS/s).
pub const PULSED_SAMPLE_RATE: f64 = 1e9;

/// Minimum samples a wait segment must span to be realizable.
pub const MIN_WAIT_SAMPLES: f64 = 10.0;

/// Resolution of the 14-bit DAC of the reference waveform file format.
pub const DAC_BITS: u32 = 14;

// =============================================================================
// Acquisition
// =============================================================================

/// Shortest segment a scope module accepts, in samples.
pub const MIN_SCOPE_BUFFER_LENGTH: usize = 4096;

/// Settling margin added to the demodulator time constant before each trigger.
pub const MIN_DEMOD_LATENCY: Duration = Duration::from_millis(2);

/// Extra wait after an inner axis ramped back to its start value.
pub const INTER_LOOP_MARGIN: Duration = Duration::from_millis(50);

/// Shortest pulse cycle the pulsed procedures accept.
pub const MIN_CYCLE_TIME: f64 = 200e-6;

/// Shortest data transfer window the pulsed procedures accept.
pub const MIN_TRANSFER_TIME: f64 = 150e-3;

/// Duration of the trigger marker emitted before each pulse train.
pub const TRIGGER_DURATION: f64 = 5e-6;

/// Time the digitizer needs to re-arm between trigger bursts.
pub const TRIGGER_ARM_TIME: f64 = 100e-6;

/// Repetitions used to stretch short wait elements.
pub const WAIT_REPETITIONS: u32 = 100;

// =============================================================================
// Physical constants
// =============================================================================

/// Resistance quantum h/e² in ohms, as used for conductance in units of e²/h.
pub const RESISTANCE_QUANTUM: f64 = 25_818.0;

/// Convert a demodulated current signal to conductance in units of e²/h.
///
/// `current = signal / iv_gain`, `G = current / excitation * R_Q`.
pub fn conductance_quanta(signal: f64, iv_gain: f64, excitation: f64) -> f64 {
    signal / iv_gain / excitation * RESISTANCE_QUANTUM
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conductance_of_one_quantum() {
        // 1 nA through 1e8 V/A gives 0.1 V; at 25.818 µV excitation that is 1/R_Q
        let g = conductance_quanta(0.1, 1e8, 25.818e-6);
        assert!((g - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_latency_is_two_ms() {
        assert_eq!(MIN_DEMOD_LATENCY.as_secs_f64(), 0.002);
    }
}
