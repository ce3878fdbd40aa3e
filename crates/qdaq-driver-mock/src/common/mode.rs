//! Operational modes for mock instruments.
//!
//! - **Instant**: No delays, deterministic behavior for unit tests
//! - **Realistic**: Instrument-like response times for integration tests
//! - **Chaos**: Random faults on top of realistic timing

use serde::Deserialize;

/// Operational modes for mock instruments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockMode {
    /// No delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Instrument-like timing - for integration tests
    Realistic,
    /// Random faults - for resilience testing
    Chaos,
}

impl MockMode {
    /// True when response delays should be simulated.
    pub fn simulates_timing(self) -> bool {
        !matches!(self, MockMode::Instant)
    }

    /// Failure rate applied to every operation.
    pub fn failure_rate(self) -> f64 {
        match self {
            MockMode::Chaos => 0.05,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode() {
        assert_eq!(MockMode::default(), MockMode::Instant);
        assert!(!MockMode::Instant.simulates_timing());
        assert!(MockMode::Chaos.simulates_timing());
    }

    #[test]
    fn test_mode_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: MockMode,
        }
        let w: Wrapper = toml::from_str("mode = \"realistic\"").unwrap();
        assert_eq!(w.mode, MockMode::Realistic);
    }

    #[test]
    fn test_only_chaos_fails() {
        assert_eq!(MockMode::Realistic.failure_rate(), 0.0);
        assert!(MockMode::Chaos.failure_rate() > 0.0);
    }
}
