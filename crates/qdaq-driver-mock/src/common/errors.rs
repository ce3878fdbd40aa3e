//! Fault injection framework for mock instruments.
//!
//! Injected faults surface as the same [`QdaqError`] variants a real driver
//! would produce: timeouts become [`QdaqError::HardwareTimeout`] carrying the
//! instrument's last known state, everything else becomes
//! [`QdaqError::Instrument`].

use super::rng::MockRng;
use parking_lot::Mutex;
use qdaq_core::error::{QdaqError, QdaqResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Fault injection configuration for mock instruments
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation failure rate (0.0 to 1.0), `"*"` matches every operation
    failure_rates: Arc<HashMap<&'static str, f64>>,
    /// Specific failure scenarios
    scenarios: Arc<Vec<ErrorScenario>>,
    /// RNG for failure decisions
    rng: Arc<MockRng>,
    /// State tracking for scenarios
    state: Arc<Mutex<ErrorState>>,
}

/// A scripted fault.
#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Fail after N successful operations
    FailAfterN {
        /// Operation name
        operation: &'static str,
        /// Successful calls before the first failure
        count: u32,
    },
    /// Time out on every call of an operation
    Timeout {
        /// Operation name
        operation: &'static str,
    },
    /// Time out on the N-th call of an operation (1-based), succeed otherwise
    TimeoutOnCall {
        /// Operation name
        operation: &'static str,
        /// Call number that times out
        call: u32,
    },
    /// Simulate communication loss
    CommunicationLoss,
    /// Hardware fault with specific code
    HardwareFault {
        /// Fault code
        code: u32,
    },
}

#[derive(Default, Debug)]
struct ErrorState {
    /// Calls per operation
    operation_counts: HashMap<&'static str, u32>,
    /// Whether communication is lost
    communication_lost: bool,
    /// Hardware fault code (0 = no fault)
    hardware_fault_code: u32,
}

impl ErrorConfig {
    /// Create error config with no errors (default)
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Create error config with uniform random failures
    pub fn random_failures(rate: f64) -> Self {
        Self::random_failures_seeded(rate, None)
    }

    /// Create error config with uniform random failures and specific seed
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
        Self::build(rates, Vec::new(), seed)
    }

    /// Create error config with a single scenario
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Create error config with multiple scenarios
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    /// Create error config with custom failure rates per operation
    pub fn with_rates(rates: HashMap<&'static str, f64>) -> Self {
        Self::build(rates, Vec::new(), None)
    }

    fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Check whether an operation should fail.
    ///
    /// `last_state` is only evaluated when a timeout is injected.
    pub fn check_operation<F>(
        &self,
        instrument: &str,
        operation: &'static str,
        last_state: F,
    ) -> QdaqResult<()>
    where
        F: FnOnce() -> serde_json::Value,
    {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(QdaqError::Instrument(format!(
                "{}: communication lost",
                instrument
            )));
        }
        if state.hardware_fault_code != 0 {
            return Err(QdaqError::Instrument(format!(
                "{}: hardware fault {}",
                instrument, state.hardware_fault_code
            )));
        }

        let calls = {
            let count = state.operation_counts.entry(operation).or_insert(0);
            *count += 1;
            *count
        };

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN {
                    operation: op,
                    count,
                } if *op == operation && calls > *count => {
                    return Err(QdaqError::Instrument(format!(
                        "{}: injected failure after {} operations",
                        instrument, count
                    )));
                }
                ErrorScenario::Timeout { operation: op } if *op == operation => {
                    return Err(timeout(instrument, operation, last_state()));
                }
                ErrorScenario::TimeoutOnCall {
                    operation: op,
                    call,
                } if *op == operation && calls == *call => {
                    return Err(timeout(instrument, operation, last_state()));
                }
                ErrorScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    return Err(QdaqError::Instrument(format!(
                        "{}: communication lost",
                        instrument
                    )));
                }
                ErrorScenario::HardwareFault { code } => {
                    state.hardware_fault_code = *code;
                    return Err(QdaqError::Instrument(format!(
                        "{}: hardware fault {}",
                        instrument, code
                    )));
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);
        if self.rng.should_fail(rate) {
            return Err(QdaqError::Instrument(format!(
                "{}: random failure on '{}'",
                instrument, operation
            )));
        }

        Ok(())
    }

    /// Reset error state (clear counters, faults)
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

fn timeout(instrument: &str, operation: &str, last_state: serde_json::Value) -> QdaqError {
    QdaqError::HardwareTimeout {
        instrument: instrument.to_string(),
        operation: operation.to_string(),
        last_state,
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(config: &ErrorConfig, operation: &'static str) -> QdaqResult<()> {
        config.check_operation("test_instrument", operation, || json!({"armed": true}))
    }

    #[test]
    fn test_no_errors() {
        let config = ErrorConfig::none();
        for _ in 0..100 {
            assert!(check(&config, "read").is_ok());
        }
    }

    #[test]
    fn test_random_failures() {
        let config = ErrorConfig::random_failures_seeded(0.5, Some(42));
        let failures = (0..1000).filter(|_| check(&config, "read").is_err()).count();
        assert!(failures > 400 && failures < 600, "Got {} failures", failures);
    }

    #[test]
    fn test_fail_after_n() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "read",
            count: 5,
        });
        for _ in 0..5 {
            assert!(check(&config, "read").is_ok());
        }
        for _ in 5..10 {
            assert!(check(&config, "read").is_err());
        }
        assert!(check(&config, "write").is_ok());
    }

    #[test]
    fn test_timeout_carries_last_state() {
        let config = ErrorConfig::scenario(ErrorScenario::Timeout {
            operation: "acquire",
        });
        match check(&config, "acquire") {
            Err(QdaqError::HardwareTimeout {
                instrument,
                operation,
                last_state,
            }) => {
                assert_eq!(instrument, "test_instrument");
                assert_eq!(operation, "acquire");
                assert_eq!(last_state["armed"], true);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_timeout_on_call() {
        let config = ErrorConfig::scenario(ErrorScenario::TimeoutOnCall {
            operation: "read_buffer",
            call: 3,
        });
        assert!(check(&config, "read_buffer").is_ok());
        assert!(check(&config, "read_buffer").is_ok());
        assert!(matches!(
            check(&config, "read_buffer"),
            Err(QdaqError::HardwareTimeout { .. })
        ));
        assert!(check(&config, "read_buffer").is_ok());
    }

    #[test]
    fn test_communication_loss_is_sticky() {
        let config = ErrorConfig::scenario(ErrorScenario::CommunicationLoss);
        assert!(matches!(
            check(&config, "read"),
            Err(QdaqError::Instrument(_))
        ));
        assert!(check(&config, "write").is_err());
    }

    #[test]
    fn test_hardware_fault() {
        let config = ErrorConfig::scenario(ErrorScenario::HardwareFault { code: 0x42 });
        let err = check(&config, "read").unwrap_err();
        assert!(err.to_string().contains("66"));
    }

    #[test]
    fn test_reset() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "read",
            count: 2,
        });
        assert!(check(&config, "read").is_ok());
        assert!(check(&config, "read").is_ok());
        assert!(check(&config, "read").is_err());

        config.reset();

        assert!(check(&config, "read").is_ok());
        assert!(check(&config, "read").is_ok());
        assert!(check(&config, "read").is_err());
    }

    #[test]
    fn test_custom_rates() {
        let mut rates = HashMap::new();
        rates.insert("read", 1.0);
        rates.insert("write", 0.0);
        let config = ErrorConfig::with_rates(rates);
        for _ in 0..10 {
            assert!(check(&config, "read").is_err());
            assert!(check(&config, "write").is_ok());
        }
    }
}
