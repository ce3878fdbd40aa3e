//! Mock multi-channel DC voltage source with ramp-limited outputs.
//!
//! Each channel is registered as its own instrument (`<id>_ch<n>`) exposing
//! `Sweepable + SupportsRampedSweep + Readable + Parameterized`. While a slope is
//! assigned, a new setpoint is approached linearly on the tokio clock, so a
//! `get()` during the ramp returns the intermediate output.
//!
//! ```rust,ignore
//! let source = MockVoltageSource::builder().channels(4).build();
//! let ch1 = source.channel(1).unwrap();
//! ch1.assign_slope(0.5).await?;
//! ch1.set(1.0).await?;             // returns immediately
//! sleep(Duration::from_secs(2)).await;
//! assert_eq!(ch1.get().await?, 1.0);
//! ```

use crate::common::{ErrorConfig, MockMode, TimingConfig};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use qdaq_core::capabilities::{Parameterized, Readable, SupportsRampedSweep, Sweepable};
use qdaq_core::driver::{Capability, DriverFactory, InstrumentComponents};
use qdaq_core::error::{QdaqError, QdaqResult};
use qdaq_core::parameter::{Parameter, ParameterSet};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

// =============================================================================
// MockVoltageSourceFactory - DriverFactory implementation
// =============================================================================

/// Configuration for MockVoltageSource driver
#[derive(Debug, Clone, Deserialize)]
pub struct MockVoltageSourceConfig {
    /// Number of output channels (default: 8)
    #[serde(default = "default_channels")]
    pub channels: u32,
    /// Symmetric output limit in volts (default: 10.0)
    #[serde(default = "default_max_voltage")]
    pub max_voltage: f64,
    /// Operational mode (default: instant)
    #[serde(default)]
    pub mode: MockMode,
}

fn default_channels() -> u32 {
    8
}

fn default_max_voltage() -> f64 {
    10.0
}

impl Default for MockVoltageSourceConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            max_voltage: default_max_voltage(),
            mode: MockMode::default(),
        }
    }
}

/// Factory for creating MockVoltageSource instances.
pub struct MockVoltageSourceFactory;

static MOCK_VOLTAGE_SOURCE_CAPABILITIES: &[Capability] = &[
    Capability::Sweepable,
    Capability::RampedSweep,
    Capability::Readable,
    Capability::Parameterized,
];

impl DriverFactory for MockVoltageSourceFactory {
    fn driver_type(&self) -> &'static str {
        "mock_voltage_source"
    }

    fn name(&self) -> &'static str {
        "Mock DC Voltage Source"
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_VOLTAGE_SOURCE_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: MockVoltageSourceConfig = config.clone().try_into()?;
        if cfg.channels == 0 {
            return Err(anyhow!("voltage source needs at least one channel"));
        }
        if !(cfg.max_voltage.is_finite() && cfg.max_voltage > 0.0) {
            return Err(anyhow!("max_voltage must be positive, got {}", cfg.max_voltage));
        }
        Ok(())
    }

    fn build(
        &self,
        config: toml::Value,
    ) -> BoxFuture<'static, Result<Vec<(String, InstrumentComponents)>>> {
        Box::pin(async move {
            let cfg: MockVoltageSourceConfig = config.try_into()?;
            let source = MockVoltageSource::builder()
                .channels(cfg.channels)
                .max_voltage(cfg.max_voltage)
                .mode(cfg.mode)
                .build();

            Ok(source
                .channels()
                .iter()
                .map(|ch| (format!("_ch{}", ch.index()), ch.components()))
                .collect())
        })
    }
}

// =============================================================================
// MockSourceChannel
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct RampState {
    from: f64,
    to: f64,
    started: Instant,
    slope: Option<f64>,
}

impl RampState {
    fn output_at(&self, now: Instant) -> f64 {
        match self.slope {
            Some(slope) if slope > 0.0 => {
                let distance = (self.to - self.from).abs();
                let travelled = slope * now.saturating_duration_since(self.started).as_secs_f64();
                if travelled >= distance {
                    self.to
                } else {
                    self.from + (self.to - self.from).signum() * travelled
                }
            }
            _ => self.to,
        }
    }
}

/// One output channel of [`MockVoltageSource`].
pub struct MockSourceChannel {
    index: u32,
    label: String,
    max_voltage: f64,
    state: Mutex<RampState>,
    voltage: Parameter<f64>,
    slope: Parameter<Option<f64>>,
    params: ParameterSet,
    unassign_count: AtomicUsize,
    set_count: AtomicUsize,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
}

impl MockSourceChannel {
    fn new(
        index: u32,
        max_voltage: f64,
        mode: MockMode,
        error_config: ErrorConfig,
    ) -> Self {
        let voltage = Parameter::new("voltage", 0.0)
            .with_unit("V")
            .with_description("Output setpoint")
            .read_only();
        let slope = Parameter::new("slope", None::<f64>)
            .with_unit("V/s")
            .with_description("Ramp slope, null when unbounded")
            .with_validator(|s: &Option<f64>| match s {
                Some(v) if !(v.is_finite() && *v > 0.0) => {
                    Err(format!("slope must be positive and finite, got {}", v))
                }
                _ => Ok(()),
            });
        let mut params = ParameterSet::new();
        params.register(voltage.clone());
        params.register(slope.clone());

        Self {
            index,
            label: format!("ch{}", index),
            max_voltage,
            state: Mutex::new(RampState {
                from: 0.0,
                to: 0.0,
                started: Instant::now(),
                slope: None,
            }),
            voltage,
            slope,
            params,
            unassign_count: AtomicUsize::new(0),
            set_count: AtomicUsize::new(0),
            mode,
            timing: TimingConfig::voltage_source(),
            error_config,
        }
    }

    /// 1-based channel number.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Output right now, following an active ramp.
    pub fn output(&self) -> f64 {
        self.state.lock().output_at(Instant::now())
    }

    /// True while a ramp is still under way.
    pub fn is_ramping(&self) -> bool {
        let state = *self.state.lock();
        (state.output_at(Instant::now()) - state.to).abs() > f64::EPSILON
    }

    /// How often `unassign_slope()` succeeded.
    pub fn unassign_count(&self) -> usize {
        self.unassign_count.load(Ordering::SeqCst)
    }

    /// How often `set()` was accepted.
    pub fn set_count(&self) -> usize {
        self.set_count.load(Ordering::SeqCst)
    }

    /// Currently bound slope without going through the async trait.
    pub fn current_slope(&self) -> Option<f64> {
        self.slope.get()
    }

    fn last_state(&self) -> serde_json::Value {
        let state = *self.state.lock();
        json!({
            "channel": self.index,
            "output": state.output_at(Instant::now()),
            "target": state.to,
            "slope": state.slope,
        })
    }

    fn check(&self, operation: &'static str) -> QdaqResult<()> {
        self.error_config
            .check_operation(&self.label, operation, || self.last_state())
    }

    /// Capability bag of this channel.
    pub fn components(self: &Arc<Self>) -> InstrumentComponents {
        InstrumentComponents::new()
            .with_sweepable(self.clone())
            .with_ramped(self.clone())
            .with_readable(self.clone())
            .with_parameterized(self.clone())
    }
}

impl Parameterized for MockSourceChannel {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }
}

#[async_trait]
impl Sweepable for MockSourceChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn unit(&self) -> &str {
        "V"
    }

    async fn set(&self, value: f64) -> QdaqResult<()> {
        if !(value.is_finite() && value.abs() <= self.max_voltage) {
            return Err(QdaqError::validation(
                format!("{}.voltage", self.label),
                format!("{} V outside ±{} V", value, self.max_voltage),
            ));
        }
        self.check("set")?;
        self.timing.communicate(self.mode).await;

        let now = Instant::now();
        {
            let mut state = self.state.lock();
            let from = state.output_at(now);
            *state = RampState {
                from,
                to: value,
                started: now,
                slope: self.slope.get(),
            };
        }
        self.voltage.set_unchecked(value);
        self.set_count.fetch_add(1, Ordering::SeqCst);
        debug!(channel = self.index, value, "Mock source setpoint");
        Ok(())
    }

    async fn get(&self) -> QdaqResult<f64> {
        self.check("get")?;
        self.timing.communicate(self.mode).await;
        Ok(self.output())
    }
}

#[async_trait]
impl Readable for MockSourceChannel {
    async fn read(&self) -> QdaqResult<f64> {
        Sweepable::get(self).await
    }
}

#[async_trait]
impl SupportsRampedSweep for MockSourceChannel {
    async fn assign_slope(&self, slope: f64) -> QdaqResult<()> {
        self.check("assign_slope")?;
        self.slope.set(Some(slope))?;
        debug!(channel = self.index, slope, "Mock source slope assigned");
        Ok(())
    }

    async fn unassign_slope(&self) -> QdaqResult<()> {
        self.check("unassign_slope")?;
        if self.slope.get().is_none() {
            return Err(QdaqError::SlopeAlreadyUnassigned(self.label.clone()));
        }
        self.slope.set(None)?;
        self.unassign_count.fetch_add(1, Ordering::SeqCst);
        debug!(channel = self.index, "Mock source slope unassigned");
        Ok(())
    }

    async fn slope(&self) -> QdaqResult<Option<f64>> {
        Ok(self.slope.get())
    }
}

// =============================================================================
// MockVoltageSource
// =============================================================================

/// Simulated DC source with independently ramped channels.
pub struct MockVoltageSource {
    channels: Vec<Arc<MockSourceChannel>>,
}

impl MockVoltageSource {
    /// Source with `channels` outputs and default settings.
    pub fn new(channels: u32) -> Self {
        Self::builder().channels(channels).build()
    }

    /// Create a builder.
    pub fn builder() -> MockVoltageSourceBuilder {
        MockVoltageSourceBuilder::new()
    }

    /// Channel by 1-based number.
    pub fn channel(&self, index: u32) -> Option<Arc<MockSourceChannel>> {
        self.channels.iter().find(|c| c.index == index).cloned()
    }

    /// All channels in order.
    pub fn channels(&self) -> &[Arc<MockSourceChannel>] {
        &self.channels
    }
}

/// Builder for [`MockVoltageSource`].
pub struct MockVoltageSourceBuilder {
    channels: u32,
    max_voltage: f64,
    mode: MockMode,
    error_config: ErrorConfig,
}

impl MockVoltageSourceBuilder {
    /// Defaults: 8 channels, ±10 V, instant mode, no faults.
    pub fn new() -> Self {
        Self {
            channels: default_channels(),
            max_voltage: default_max_voltage(),
            mode: MockMode::Instant,
            error_config: ErrorConfig::none(),
        }
    }

    /// Number of channels.
    pub fn channels(mut self, channels: u32) -> Self {
        self.channels = channels;
        self
    }

    /// Symmetric output limit.
    pub fn max_voltage(mut self, max_voltage: f64) -> Self {
        self.max_voltage = max_voltage;
        self
    }

    /// Set operational mode
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Fault injection shared by all channels.
    pub fn error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    /// Build the source.
    pub fn build(self) -> MockVoltageSource {
        let error_config = if self.mode.failure_rate() > 0.0 {
            ErrorConfig::random_failures(self.mode.failure_rate())
        } else {
            self.error_config
        };
        MockVoltageSource {
            channels: (1..=self.channels)
                .map(|i| {
                    Arc::new(MockSourceChannel::new(
                        i,
                        self.max_voltage,
                        self.mode,
                        error_config.clone(),
                    ))
                })
                .collect(),
        }
    }
}

impl Default for MockVoltageSourceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorScenario;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_unramped_set_is_instant() {
        let source = MockVoltageSource::new(2);
        let ch = source.channel(2).unwrap();
        ch.set(1.5).await.unwrap();
        assert_eq!(ch.get().await.unwrap(), 1.5);
        assert_eq!(ch.set_count(), 1);
        assert_eq!(ch.parameters().snapshot()["voltage"], 1.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramped_set_moves_linearly() {
        let source = MockVoltageSource::new(1);
        let ch = source.channel(1).unwrap();
        ch.assign_slope(0.5).await.unwrap();
        ch.set(1.0).await.unwrap();
        assert!(ch.is_ramping());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!((ch.output() - 0.5).abs() < 1e-9);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ch.output(), 1.0);
        assert!(!ch.is_ramping());
    }

    #[tokio::test]
    async fn test_unassign_twice_fails() {
        let source = MockVoltageSource::new(1);
        let ch = source.channel(1).unwrap();
        ch.assign_slope(0.1).await.unwrap();
        ch.unassign_slope().await.unwrap();
        assert_eq!(ch.slope().await.unwrap(), None);
        assert!(matches!(
            ch.unassign_slope().await,
            Err(QdaqError::SlopeAlreadyUnassigned(_))
        ));
        assert_eq!(ch.unassign_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_slope_and_range() {
        let source = MockVoltageSource::builder().max_voltage(2.0).channels(1).build();
        let ch = source.channel(1).unwrap();
        assert!(matches!(
            ch.assign_slope(-1.0).await,
            Err(QdaqError::Validation { .. })
        ));
        assert!(matches!(
            ch.set(2.5).await,
            Err(QdaqError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_injected_timeout_reports_state() {
        let source = MockVoltageSource::builder()
            .channels(1)
            .error_config(ErrorConfig::scenario(ErrorScenario::Timeout {
                operation: "get",
            }))
            .build();
        let ch = source.channel(1).unwrap();
        ch.set(0.25).await.unwrap();
        match ch.get().await {
            Err(QdaqError::HardwareTimeout { last_state, .. }) => {
                assert_eq!(last_state["target"], 0.25);
            }
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_factory_builds_one_instrument_per_channel() {
        let factory = MockVoltageSourceFactory;
        let config: toml::Value = toml::from_str("channels = 3").unwrap();
        factory.validate(&config).unwrap();
        let parts = factory.build(config).await.unwrap();
        let suffixes: Vec<&str> = parts.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(suffixes, vec!["_ch1", "_ch2", "_ch3"]);
        assert!(parts[0].1.capabilities().contains(&Capability::RampedSweep));

        let bad: toml::Value = toml::from_str("channels = 0").unwrap();
        assert!(factory.validate(&bad).is_err());
    }
}
