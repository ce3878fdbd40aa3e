//! Mock segmented scope module.
//!
//! Records `segments` triggered windows of `length` samples per enabled
//! channel. The recorded signal is a function of channel and time since the
//! trigger (a normalized ramp by default) plus optional seeded noise, so
//! segment averages converge on a known trace.

use crate::common::{ErrorConfig, MockMode, MockRng, TimingConfig};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use qdaq_core::capabilities::{Parameterized, ScopeRecord, ScopeSettings, SegmentedDigitizer};
use qdaq_core::driver::{Capability, DriverFactory, InstrumentComponents};
use qdaq_core::error::{QdaqError, QdaqResult};
use qdaq_core::limits::MIN_SCOPE_BUFFER_LENGTH;
use qdaq_core::parameter::{Parameter, ParameterSet};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Recorded value for `(channel, seconds since trigger, window length in seconds)`.
pub type SignalFn = Arc<dyn Fn(u32, f64, f64) -> f64 + Send + Sync>;

// =============================================================================
// MockScopeFactory - DriverFactory implementation
// =============================================================================

/// Configuration for MockScope driver
#[derive(Debug, Clone, Deserialize)]
pub struct MockScopeConfig {
    /// Peak of the default ramp signal in volts (default: 1.0)
    #[serde(default = "default_amplitude")]
    pub amplitude: f64,
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

fn default_amplitude() -> f64 {
    1.0
}

impl Default for MockScopeConfig {
    fn default() -> Self {
        Self {
            amplitude: default_amplitude(),
            noise: 0.0,
            seed: None,
            mode: MockMode::default(),
        }
    }
}

/// Factory for creating MockScope instances.
pub struct MockScopeFactory;

static MOCK_SCOPE_CAPABILITIES: &[Capability] =
    &[Capability::SegmentedDigitizer, Capability::Parameterized];

impl DriverFactory for MockScopeFactory {
    fn driver_type(&self) -> &'static str {
        "mock_scope"
    }

    fn name(&self) -> &'static str {
        "Mock Scope Module"
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_SCOPE_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: MockScopeConfig = config.clone().try_into()?;
        if cfg.noise < 0.0 {
            return Err(anyhow!("noise must be non-negative, got {}", cfg.noise));
        }
        Ok(())
    }

    fn build(
        &self,
        config: toml::Value,
    ) -> BoxFuture<'static, Result<Vec<(String, InstrumentComponents)>>> {
        Box::pin(async move {
            let cfg: MockScopeConfig = config.try_into()?;
            let scope = Arc::new(MockScope::with_config(cfg));
            Ok(vec![(
                String::new(),
                InstrumentComponents::new()
                    .with_digitizer(scope.clone())
                    .with_parameterized(scope),
            )])
        })
    }
}

// =============================================================================
// MockScope
// =============================================================================

/// Simulated segmented digitizer.
pub struct MockScope {
    settings: Mutex<Option<ScopeSettings>>,
    enabled: Parameter<bool>,
    length: Parameter<u64>,
    segments: Parameter<u64>,
    sample_rate: Parameter<f64>,
    demod_time_constant: Parameter<f64>,
    params: ParameterSet,
    signal: SignalFn,
    noise: f64,
    rng: MockRng,
    configure_count: AtomicUsize,
    acquire_count: AtomicUsize,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
}

impl MockScope {
    /// Scope recording a 1 V ramp per segment.
    pub fn new() -> Self {
        Self::with_config(MockScopeConfig::default())
    }

    /// Scope from a factory configuration.
    pub fn with_config(config: MockScopeConfig) -> Self {
        let amplitude = config.amplitude;
        let signal: SignalFn = Arc::new(move |_channel, t, window| {
            if window > 0.0 {
                amplitude * t / window
            } else {
                0.0
            }
        });

        let enabled = Parameter::new("enable", false)
            .with_description("Acquisition armed")
            .read_only();
        let length = Parameter::new("length", 0u64).read_only();
        let segments = Parameter::new("segments", 0u64).read_only();
        let sample_rate = Parameter::new("sample_rate", 0.0).with_unit("Hz").read_only();
        let demod_time_constant = Parameter::new("demod_time_constant", 1e-6)
            .with_unit("s")
            .with_description("Time constant of the demodulator feeding channel 1")
            .with_range(1e-8, 10.0);
        let mut params = ParameterSet::new();
        params.register(enabled.clone());
        params.register(length.clone());
        params.register(segments.clone());
        params.register(sample_rate.clone());
        params.register(demod_time_constant.clone());

        let error_config = if config.mode.failure_rate() > 0.0 {
            ErrorConfig::random_failures_seeded(config.mode.failure_rate(), config.seed)
        } else {
            ErrorConfig::none()
        };

        Self {
            settings: Mutex::new(None),
            enabled,
            length,
            segments,
            sample_rate,
            demod_time_constant,
            params,
            signal,
            noise: config.noise,
            rng: MockRng::new(config.seed),
            configure_count: AtomicUsize::new(0),
            acquire_count: AtomicUsize::new(0),
            mode: config.mode,
            timing: TimingConfig::scope(),
            error_config,
        }
    }

    /// Replace the recorded signal.
    pub fn with_signal<F>(mut self, signal: F) -> Self
    where
        F: Fn(u32, f64, f64) -> f64 + Send + Sync + 'static,
    {
        self.signal = Arc::new(signal);
        self
    }

    /// Replace the fault injection configuration.
    pub fn with_error_config(mut self, error_config: ErrorConfig) -> Self {
        self.error_config = error_config;
        self
    }

    /// Last applied settings.
    pub fn settings(&self) -> Option<ScopeSettings> {
        self.settings.lock().clone()
    }

    /// True while armed.
    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    /// Demodulator time constant in seconds.
    pub fn demod_time_constant(&self) -> f64 {
        self.demod_time_constant.get()
    }

    /// Calls to `configure()`.
    pub fn configure_count(&self) -> usize {
        self.configure_count.load(Ordering::SeqCst)
    }

    /// Completed acquisitions.
    pub fn acquire_count(&self) -> usize {
        self.acquire_count.load(Ordering::SeqCst)
    }

    fn last_state(&self) -> serde_json::Value {
        let settings = self.settings.lock();
        json!({
            "enabled": self.enabled.get(),
            "configured": settings.is_some(),
            "sample_rate": settings.as_ref().map(|s| s.sample_rate),
            "acquisitions": self.acquire_count(),
        })
    }

    fn check(&self, operation: &'static str) -> QdaqResult<()> {
        self.error_config
            .check_operation("mock_scope", operation, || self.last_state())
    }
}

impl Default for MockScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Parameterized for MockScope {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }
}

#[async_trait]
impl SegmentedDigitizer for MockScope {
    async fn configure(&self, settings: &ScopeSettings) -> QdaqResult<()> {
        self.check("configure")?;
        if settings.length < MIN_SCOPE_BUFFER_LENGTH {
            return Err(QdaqError::validation(
                "length",
                format!(
                    "{} samples is below the minimum of {}",
                    settings.length, MIN_SCOPE_BUFFER_LENGTH
                ),
            ));
        }
        if settings.segments == 0 || settings.channels.is_empty() {
            return Err(QdaqError::validation(
                "segments",
                "at least one segment and one channel are required",
            ));
        }
        if !(settings.sample_rate.is_finite() && settings.sample_rate > 0.0) {
            return Err(QdaqError::validation(
                "sample_rate",
                format!("{} Hz is not a valid rate", settings.sample_rate),
            ));
        }
        self.timing.communicate(self.mode).await;

        self.length.set_unchecked(settings.length as u64);
        self.segments.set_unchecked(settings.segments as u64);
        self.sample_rate.set_unchecked(settings.sample_rate);
        *self.settings.lock() = Some(settings.clone());
        self.configure_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn sample_rate(&self) -> QdaqResult<f64> {
        self.settings
            .lock()
            .as_ref()
            .map(|s| s.sample_rate)
            .ok_or_else(|| QdaqError::Instrument("mock_scope: not configured".to_string()))
    }

    async fn set_enabled(&self, enabled: bool) -> QdaqResult<()> {
        self.check("set_enabled")?;
        self.timing.communicate(self.mode).await;
        self.enabled.set_unchecked(enabled);
        Ok(())
    }

    async fn acquire(&self) -> QdaqResult<ScopeRecord> {
        self.check("acquire")?;
        // A disarmed scope never sees its triggers.
        if !self.enabled.get() {
            return Err(QdaqError::HardwareTimeout {
                instrument: "mock_scope".to_string(),
                operation: "acquire".to_string(),
                last_state: self.last_state(),
            });
        }
        let settings = self
            .settings()
            .ok_or_else(|| QdaqError::Instrument("mock_scope: not configured".to_string()))?;
        self.timing.acquire(self.mode).await;

        let window = settings.length as f64 / settings.sample_rate;
        let channels: Vec<Vec<Vec<f64>>> = settings
            .channels
            .iter()
            .map(|&channel| {
                (0..settings.segments)
                    .map(|_| {
                        (0..settings.length)
                            .map(|i| {
                                let t = i as f64 / settings.sample_rate;
                                (self.signal)(channel, t, window) + self.rng.noise(self.noise)
                            })
                            .collect::<Vec<f64>>()
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        self.acquire_count.fetch_add(1, Ordering::SeqCst);
        Ok(ScopeRecord { channels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qdaq_core::capabilities::TriggerSettings;

    fn settings(segments: usize) -> ScopeSettings {
        ScopeSettings {
            sample_rate_label: "113 MHz".to_string(),
            sample_rate: 1.8e9 / 16.0,
            length: 4096,
            segments,
            channels: vec![1],
            trigger: TriggerSettings::default(),
        }
    }

    #[tokio::test]
    async fn test_acquire_shapes_record() {
        let scope = MockScope::new();
        scope.configure(&settings(3)).await.unwrap();
        scope.set_enabled(true).await.unwrap();
        let record = scope.acquire().await.unwrap();
        assert_eq!(record.channels.len(), 1);
        assert_eq!(record.channels[0].len(), 3);
        assert_eq!(record.channels[0][0].len(), 4096);
        assert_eq!(record.channels[0][0][0], 0.0);
        assert!(record.channels[0][0][4095] < 1.0);
        assert_eq!(scope.acquire_count(), 1);
    }

    #[tokio::test]
    async fn test_disarmed_acquire_times_out() {
        let scope = MockScope::new();
        scope.configure(&settings(1)).await.unwrap();
        match scope.acquire().await {
            Err(QdaqError::HardwareTimeout { last_state, .. }) => {
                assert_eq!(last_state["enabled"], false);
                assert_eq!(last_state["configured"], true);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_short_buffer_rejected() {
        let scope = MockScope::new();
        let mut s = settings(1);
        s.length = 1024;
        assert!(matches!(
            scope.configure(&s).await,
            Err(QdaqError::Validation { .. })
        ));
        assert!(scope.sample_rate().await.is_err());
    }

    #[tokio::test]
    async fn test_custom_signal_average() {
        let scope = MockScope::with_config(MockScopeConfig {
            noise: 0.01,
            seed: Some(3),
            ..Default::default()
        })
        .with_signal(|channel, _, _| channel as f64);
        let mut s = settings(50);
        s.channels = vec![2];
        scope.configure(&s).await.unwrap();
        scope.set_enabled(true).await.unwrap();
        let record = scope.acquire().await.unwrap();
        let avg = record.segment_average(0).unwrap();
        assert!(avg.iter().all(|v| (v - 2.0).abs() < 0.01));
    }
}
