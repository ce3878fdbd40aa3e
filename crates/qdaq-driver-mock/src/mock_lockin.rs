//! Mock lock-in amplifier with a triggered sample buffer.
//!
//! The demodulated X output is a deterministic counter: every `read()` and
//! every accepted trigger takes the next value `scale * n + offset` (plus
//! optional seeded noise), so averaged readings increase monotonically with
//! call order. Buffer resets, starts and triggers are counted for assertions.

use crate::common::{ErrorConfig, MockMode, MockRng, TimingConfig};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use qdaq_core::capabilities::{BufferedAcquisition, Parameterized, Readable};
use qdaq_core::driver::{Capability, DriverFactory, InstrumentComponents};
use qdaq_core::error::QdaqResult;
use qdaq_core::parameter::{Parameter, ParameterSet};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Demodulator outputs the display can show.
pub const DISPLAY_CHOICES: [&str; 4] = ["X", "Y", "R", "Theta"];

// =============================================================================
// MockLockinFactory - DriverFactory implementation
// =============================================================================

/// Configuration for MockLockin driver
#[derive(Debug, Clone, Deserialize)]
pub struct MockLockinConfig {
    /// Demodulator time constant in seconds (default: 0.01)
    #[serde(default = "default_time_constant")]
    pub time_constant: f64,
    /// Output increment per sample (default: 1.0)
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Output of sample zero (default: 0.0)
    #[serde(default)]
    pub offset: f64,
    /// Uniform noise amplitude (default: 0.0)
    #[serde(default)]
    pub noise: f64,
    /// Noise seed
    #[serde(default)]
    pub seed: Option<u64>,
    /// Operational mode (default: instant)
    #[serde(default)]
    pub mode: MockMode,
}

fn default_time_constant() -> f64 {
    0.01
}

fn default_scale() -> f64 {
    1.0
}

impl Default for MockLockinConfig {
    fn default() -> Self {
        Self {
            time_constant: default_time_constant(),
            scale: default_scale(),
            offset: 0.0,
            noise: 0.0,
            seed: None,
            mode: MockMode::default(),
        }
    }
}

/// Factory for creating MockLockin instances.
pub struct MockLockinFactory;

static MOCK_LOCKIN_CAPABILITIES: &[Capability] = &[
    Capability::Readable,
    Capability::BufferedAcquisition,
    Capability::Parameterized,
];

impl DriverFactory for MockLockinFactory {
    fn driver_type(&self) -> &'static str {
        "mock_lockin"
    }

    fn name(&self) -> &'static str {
        "Mock Lock-in Amplifier"
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_LOCKIN_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: MockLockinConfig = config.clone().try_into()?;
        if !(cfg.time_constant.is_finite() && cfg.time_constant > 0.0) {
            return Err(anyhow!(
                "time_constant must be positive, got {}",
                cfg.time_constant
            ));
        }
        Ok(())
    }

    fn build(
        &self,
        config: toml::Value,
    ) -> BoxFuture<'static, Result<Vec<(String, InstrumentComponents)>>> {
        Box::pin(async move {
            let cfg: MockLockinConfig = config.try_into()?;
            let lockin = Arc::new(MockLockin::with_config(cfg)?);
            Ok(vec![(String::new(), lockin.components())])
        })
    }
}

// =============================================================================
// MockLockin
// =============================================================================

#[derive(Debug, Default)]
struct BufferState {
    running: bool,
    samples: Vec<f64>,
}

/// Simulated lock-in amplifier.
pub struct MockLockin {
    time_constant: Parameter<f64>,
    display: Parameter<String>,
    amplitude: Parameter<f64>,
    buffer_points: Parameter<u64>,
    params: ParameterSet,
    buffer: Mutex<BufferState>,
    sample_index: AtomicUsize,
    scale: f64,
    offset: f64,
    noise: f64,
    rng: MockRng,
    reset_count: AtomicUsize,
    start_count: AtomicUsize,
    trigger_count: AtomicUsize,
    read_buffer_count: AtomicUsize,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
}

impl MockLockin {
    /// Lock-in with default settings.
    pub fn new() -> Self {
        Self::build_with(MockLockinConfig::default(), ErrorConfig::none())
    }

    /// Lock-in from a factory configuration.
    pub fn with_config(config: MockLockinConfig) -> QdaqResult<Self> {
        let lockin = Self::build_with(
            MockLockinConfig {
                time_constant: default_time_constant(),
                ..config.clone()
            },
            ErrorConfig::none(),
        );
        lockin.time_constant.set(config.time_constant)?;
        Ok(lockin)
    }

    /// Replace the fault injection configuration.
    pub fn with_error_config(mut self, error_config: ErrorConfig) -> Self {
        self.error_config = error_config;
        self
    }

    fn build_with(config: MockLockinConfig, error_config: ErrorConfig) -> Self {
        let time_constant = Parameter::new("time_constant", config.time_constant)
            .with_unit("s")
            .with_description("Demodulator filter time constant")
            .with_range(1e-6, 30.0);
        let display = Parameter::new("display", "X".to_string())
            .with_description("Demodulator output shown and buffered")
            .with_choices(DISPLAY_CHOICES.iter().map(|s| s.to_string()).collect());
        let amplitude = Parameter::new("amplitude", 1.0)
            .with_unit("V")
            .with_description("Reference output amplitude")
            .with_range(0.0, 5.0);
        let buffer_points = Parameter::new("buffer_points", 0u64)
            .with_description("Samples in the buffer")
            .read_only();

        let mut params = ParameterSet::new();
        params.register(time_constant.clone());
        params.register(display.clone());
        params.register(amplitude.clone());
        params.register(buffer_points.clone());

        let error_config = if config.mode.failure_rate() > 0.0 {
            ErrorConfig::random_failures_seeded(config.mode.failure_rate(), config.seed)
        } else {
            error_config
        };

        Self {
            time_constant,
            display,
            amplitude,
            buffer_points,
            params,
            buffer: Mutex::new(BufferState::default()),
            sample_index: AtomicUsize::new(0),
            scale: config.scale,
            offset: config.offset,
            noise: config.noise,
            rng: MockRng::new(config.seed),
            reset_count: AtomicUsize::new(0),
            start_count: AtomicUsize::new(0),
            trigger_count: AtomicUsize::new(0),
            read_buffer_count: AtomicUsize::new(0),
            mode: config.mode,
            timing: TimingConfig::lockin(),
            error_config,
        }
    }

    /// Capability bag of this lock-in.
    pub fn components(self: &Arc<Self>) -> InstrumentComponents {
        InstrumentComponents::new()
            .with_readable(self.clone())
            .with_buffered(self.clone())
            .with_parameterized(self.clone())
    }

    /// Calls to `reset_buffer()`.
    pub fn reset_count(&self) -> usize {
        self.reset_count.load(Ordering::SeqCst)
    }

    /// Calls to `start_buffer()`.
    pub fn start_count(&self) -> usize {
        self.start_count.load(Ordering::SeqCst)
    }

    /// Calls to `send_trigger()`, accepted or not.
    pub fn trigger_count(&self) -> usize {
        self.trigger_count.load(Ordering::SeqCst)
    }

    /// Calls to `read_buffer()`.
    pub fn read_buffer_count(&self) -> usize {
        self.read_buffer_count.load(Ordering::SeqCst)
    }

    /// True while triggers are accepted.
    pub fn is_buffering(&self) -> bool {
        self.buffer.lock().running
    }

    /// Display setting.
    pub fn display(&self) -> String {
        self.display.get()
    }

    /// Reference amplitude.
    pub fn amplitude(&self) -> f64 {
        self.amplitude.get()
    }

    fn next_sample(&self) -> f64 {
        let n = self.sample_index.fetch_add(1, Ordering::SeqCst) + 1;
        self.offset + self.scale * n as f64 + self.rng.noise(self.noise)
    }

    fn last_state(&self) -> serde_json::Value {
        let buffer = self.buffer.lock();
        json!({
            "running": buffer.running,
            "buffered_points": buffer.samples.len(),
            "time_constant": self.time_constant.get(),
        })
    }

    fn check(&self, operation: &'static str) -> QdaqResult<()> {
        self.error_config
            .check_operation("mock_lockin", operation, || self.last_state())
    }

    fn publish_points(&self, points: usize) {
        self.buffer_points.set_unchecked(points as u64);
    }
}

impl Default for MockLockin {
    fn default() -> Self {
        Self::new()
    }
}

impl Parameterized for MockLockin {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }
}

#[async_trait]
impl Readable for MockLockin {
    async fn read(&self) -> QdaqResult<f64> {
        self.check("read")?;
        self.timing.communicate(self.mode).await;
        Ok(self.next_sample())
    }
}

#[async_trait]
impl BufferedAcquisition for MockLockin {
    async fn reset_buffer(&self) -> QdaqResult<()> {
        self.check("reset_buffer")?;
        self.timing.communicate(self.mode).await;
        self.buffer.lock().samples.clear();
        self.publish_points(0);
        self.reset_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_buffer(&self) -> QdaqResult<()> {
        self.check("start_buffer")?;
        self.timing.communicate(self.mode).await;
        self.buffer.lock().running = true;
        self.start_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn pause_buffer(&self) -> QdaqResult<()> {
        self.check("pause_buffer")?;
        self.timing.communicate(self.mode).await;
        self.buffer.lock().running = false;
        Ok(())
    }

    async fn send_trigger(&self) -> QdaqResult<()> {
        self.check("send_trigger")?;
        self.trigger_count.fetch_add(1, Ordering::SeqCst);
        let points = {
            let mut buffer = self.buffer.lock();
            if !buffer.running {
                debug!("Trigger ignored, buffer not running");
                return Ok(());
            }
            let sample = self.next_sample();
            buffer.samples.push(sample);
            buffer.samples.len()
        };
        self.publish_points(points);
        Ok(())
    }

    async fn read_buffer(&self) -> QdaqResult<Vec<f64>> {
        self.check("read_buffer")?;
        self.timing.acquire(self.mode).await;
        self.read_buffer_count.fetch_add(1, Ordering::SeqCst);
        Ok(self.buffer.lock().samples.clone())
    }

    async fn time_constant(&self) -> QdaqResult<f64> {
        Ok(self.time_constant.get())
    }
}

// =============================================================================
// MockCounter
// =============================================================================

/// Configuration for MockCounter driver
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MockCounterConfig {
    /// Value returned by the first read minus one (default: 0)
    #[serde(default)]
    pub start: u64,
}

/// Factory for creating MockCounter instances.
pub struct MockCounterFactory;

static MOCK_COUNTER_CAPABILITIES: &[Capability] =
    &[Capability::Readable, Capability::Parameterized];

impl DriverFactory for MockCounterFactory {
    fn driver_type(&self) -> &'static str {
        "mock_counter"
    }

    fn name(&self) -> &'static str {
        "Mock Counter"
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_COUNTER_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let _: MockCounterConfig = config.clone().try_into()?;
        Ok(())
    }

    fn build(
        &self,
        config: toml::Value,
    ) -> BoxFuture<'static, Result<Vec<(String, InstrumentComponents)>>> {
        Box::pin(async move {
            let cfg: MockCounterConfig = config.try_into()?;
            let counter = Arc::new(MockCounter::starting_at(cfg.start));
            Ok(vec![(
                String::new(),
                InstrumentComponents::new()
                    .with_readable(counter.clone())
                    .with_parameterized(counter),
            )])
        })
    }
}

/// Readable that returns 1, 2, 3, ... on successive reads.
pub struct MockCounter {
    count: Parameter<u64>,
    params: ParameterSet,
}

impl MockCounter {
    /// Counter whose first read returns 1.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Counter whose first read returns `start + 1`.
    pub fn starting_at(start: u64) -> Self {
        let count = Parameter::new("count", start)
            .with_description("Reads so far")
            .read_only();
        let mut params = ParameterSet::new();
        params.register(count.clone());
        Self { count, params }
    }

    /// Current count.
    pub fn count(&self) -> u64 {
        self.count.get()
    }
}

impl Default for MockCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Parameterized for MockCounter {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }
}

#[async_trait]
impl Readable for MockCounter {
    async fn read(&self) -> QdaqResult<f64> {
        let next = self.count.get() + 1;
        self.count.set_unchecked(next);
        Ok(next as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorScenario;
    use qdaq_core::error::QdaqError;

    #[tokio::test]
    async fn test_triggers_only_while_running() {
        let lockin = MockLockin::new();
        lockin.send_trigger().await.unwrap();
        assert!(lockin.read_buffer().await.unwrap().is_empty());

        lockin.reset_buffer().await.unwrap();
        lockin.start_buffer().await.unwrap();
        for _ in 0..3 {
            lockin.send_trigger().await.unwrap();
        }
        assert_eq!(lockin.read_buffer().await.unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(lockin.parameters().snapshot()["buffer_points"], 3);

        lockin.pause_buffer().await.unwrap();
        lockin.send_trigger().await.unwrap();
        assert_eq!(lockin.read_buffer().await.unwrap().len(), 3);
        assert_eq!(lockin.trigger_count(), 5);
    }

    #[tokio::test]
    async fn test_reset_clears_but_counter_continues() {
        let lockin = MockLockin::new();
        lockin.start_buffer().await.unwrap();
        lockin.send_trigger().await.unwrap();
        lockin.reset_buffer().await.unwrap();
        lockin.send_trigger().await.unwrap();
        assert_eq!(lockin.read_buffer().await.unwrap(), vec![2.0]);
        assert_eq!(lockin.reset_count(), 1);
        assert_eq!(lockin.read().await.unwrap(), 3.0);
    }

    #[test]
    fn test_display_choices() {
        let lockin = MockLockin::new();
        let params = lockin.parameters();
        assert!(params.set_json("display", json!("R")).is_ok());
        assert_eq!(lockin.display(), "R");
        assert!(params.set_json("display", json!("Z")).is_err());
        assert!(params.set_json("buffer_points", json!(4)).is_err());
    }

    #[tokio::test]
    async fn test_time_constant_from_config() {
        let lockin = MockLockin::with_config(MockLockinConfig {
            time_constant: 0.1,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(lockin.time_constant().await.unwrap(), 0.1);

        let bad = MockLockin::with_config(MockLockinConfig {
            time_constant: 100.0,
            ..Default::default()
        });
        assert!(matches!(bad, Err(QdaqError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_read_buffer_timeout_carries_state() {
        let lockin = MockLockin::new().with_error_config(ErrorConfig::scenario(
            ErrorScenario::Timeout {
                operation: "read_buffer",
            },
        ));
        lockin.start_buffer().await.unwrap();
        lockin.send_trigger().await.unwrap();
        match lockin.read_buffer().await {
            Err(QdaqError::HardwareTimeout { last_state, .. }) => {
                assert_eq!(last_state["buffered_points"], 1);
                assert_eq!(last_state["running"], true);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_counter_increments() {
        let counter = MockCounter::starting_at(10);
        assert_eq!(counter.read().await.unwrap(), 11.0);
        assert_eq!(counter.read().await.unwrap(), 12.0);
        assert_eq!(counter.count(), 12);
    }

    #[tokio::test]
    async fn test_factory_rejects_bad_time_constant() {
        let factory = MockLockinFactory;
        let good: toml::Value = toml::from_str("time_constant = 0.03").unwrap();
        assert!(factory.validate(&good).is_ok());
        let parts = factory.build(good).await.unwrap();
        assert_eq!(parts.len(), 1);
        assert!(parts[0].0.is_empty());

        let bad: toml::Value = toml::from_str("time_constant = -1.0").unwrap();
        assert!(factory.validate(&bad).is_err());
    }
}
