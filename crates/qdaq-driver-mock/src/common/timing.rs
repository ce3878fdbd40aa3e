//! Timing configuration for realistic mode.
//!
//! Response delays of the simulated instruments. All waits go through
//! `tokio::time::sleep`, so tests with a paused clock stay instantaneous.

use super::mode::MockMode;
use std::time::Duration;

/// Timing configuration for realistic mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimingConfig {
    /// Round trip of one command in milliseconds
    pub communication_delay_ms: u64,
    /// Extra time of an acquisition in milliseconds (scope segments, buffer readout)
    pub acquisition_ms: u64,
    /// Time to load an uploaded waveform file in milliseconds
    pub load_ms: u64,
}

impl TimingConfig {
    /// DC voltage source (serial link)
    pub fn voltage_source() -> Self {
        Self {
            communication_delay_ms: 5,
            acquisition_ms: 0,
            load_ms: 0,
        }
    }

    /// Lock-in amplifier
    pub fn lockin() -> Self {
        Self {
            communication_delay_ms: 2,
            acquisition_ms: 10,
            load_ms: 0,
        }
    }

    /// Segmented scope module
    pub fn scope() -> Self {
        Self {
            communication_delay_ms: 2,
            acquisition_ms: 50,
            load_ms: 0,
        }
    }

    /// Arbitrary waveform generator
    pub fn awg() -> Self {
        Self {
            communication_delay_ms: 5,
            acquisition_ms: 0,
            load_ms: 500,
        }
    }

    /// Function generator
    pub fn function_generator() -> Self {
        Self {
            communication_delay_ms: 3,
            acquisition_ms: 0,
            load_ms: 0,
        }
    }

    /// Wait one command round trip if the mode simulates timing.
    pub async fn communicate(&self, mode: MockMode) {
        Self::pause(mode, self.communication_delay_ms).await;
    }

    /// Wait for an acquisition if the mode simulates timing.
    pub async fn acquire(&self, mode: MockMode) {
        Self::pause(mode, self.acquisition_ms).await;
    }

    /// Wait for a file load if the mode simulates timing.
    pub async fn load(&self, mode: MockMode) {
        Self::pause(mode, self.load_ms).await;
    }

    async fn pause(mode: MockMode, ms: u64) {
        if mode.simulates_timing() && ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timing() {
        let config = TimingConfig::default();
        assert_eq!(config.communication_delay_ms, 0);
        assert_eq!(config.acquisition_ms, 0);
        assert_eq!(config.load_ms, 0);
    }

    #[test]
    fn test_presets() {
        assert_eq!(TimingConfig::voltage_source().communication_delay_ms, 5);
        assert_eq!(TimingConfig::scope().acquisition_ms, 50);
        assert_eq!(TimingConfig::awg().load_ms, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instant_mode_does_not_wait() {
        let start = tokio::time::Instant::now();
        TimingConfig::awg().load(MockMode::Instant).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_realistic_mode_waits() {
        let start = tokio::time::Instant::now();
        TimingConfig::awg().load(MockMode::Realistic).await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }
}
