//! Mock two-channel function generator.

use crate::common::{ErrorConfig, MockMode, TimingConfig};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use qdaq_core::capabilities::{BurstSettings, FunctionGenerator, Parameterized, RampWaveform};
use qdaq_core::driver::{Capability, DriverFactory, InstrumentComponents};
use qdaq_core::error::{QdaqError, QdaqResult};
use qdaq_core::parameter::{Parameter, ParameterSet};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// =============================================================================
// MockFunctionGeneratorFactory - DriverFactory implementation
// =============================================================================

/// Configuration for MockFunctionGenerator driver
#[derive(Debug, Clone, Deserialize)]
pub struct MockFunctionGeneratorConfig {
    /// Number of channels (default: 2)
    #[serde(default = "default_channels")]
    pub channels: u32,
    /// Largest peak-to-peak amplitude in volts (default: 10.0)
    #[serde(default = "default_max_amplitude")]
    pub max_amplitude: f64,
    /// Operational mode (default: instant)
    #[serde(default)]
    pub mode: MockMode,
}

fn default_channels() -> u32 {
    2
}

fn default_max_amplitude() -> f64 {
    10.0
}

impl Default for MockFunctionGeneratorConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            max_amplitude: default_max_amplitude(),
            mode: MockMode::default(),
        }
    }
}

/// Factory for creating MockFunctionGenerator instances.
pub struct MockFunctionGeneratorFactory;

static MOCK_FUNCTION_GENERATOR_CAPABILITIES: &[Capability] =
    &[Capability::FunctionGenerator, Capability::Parameterized];

impl DriverFactory for MockFunctionGeneratorFactory {
    fn driver_type(&self) -> &'static str {
        "mock_function_generator"
    }

    fn name(&self) -> &'static str {
        "Mock Function Generator"
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_FUNCTION_GENERATOR_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: MockFunctionGeneratorConfig = config.clone().try_into()?;
        if cfg.channels == 0 {
            return Err(anyhow!("function generator needs at least one channel"));
        }
        Ok(())
    }

    fn build(
        &self,
        config: toml::Value,
    ) -> BoxFuture<'static, Result<Vec<(String, InstrumentComponents)>>> {
        Box::pin(async move {
            let cfg: MockFunctionGeneratorConfig = config.try_into()?;
            let generator = Arc::new(MockFunctionGenerator::with_config(cfg));
            Ok(vec![(
                String::new(),
                InstrumentComponents::new()
                    .with_function_generator(generator.clone())
                    .with_parameterized(generator),
            )])
        })
    }
}

// =============================================================================
// MockFunctionGenerator
// =============================================================================

/// Waveform a channel is configured for.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelWaveformSetup {
    /// Continuous ramp.
    Ramp(RampWaveform),
    /// Triggered burst.
    Burst(BurstSettings),
}

struct GeneratorChannel {
    setup: Mutex<Option<ChannelWaveformSetup>>,
    output: Parameter<bool>,
}

/// Simulated function generator.
pub struct MockFunctionGenerator {
    channels: Vec<GeneratorChannel>,
    params: ParameterSet,
    max_amplitude: f64,
    sync_count: AtomicUsize,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
}

impl MockFunctionGenerator {
    /// Two channels, 10 Vpp.
    pub fn new() -> Self {
        Self::with_config(MockFunctionGeneratorConfig::default())
    }

    /// Generator from a factory configuration.
    pub fn with_config(config: MockFunctionGeneratorConfig) -> Self {
        let mut params = ParameterSet::new();
        let channels = (1..=config.channels)
            .map(|ch| {
                let output = Parameter::new(format!("ch{}_output", ch), false).read_only();
                params.register(output.clone());
                GeneratorChannel {
                    setup: Mutex::new(None),
                    output,
                }
            })
            .collect();
        Self {
            channels,
            params,
            max_amplitude: config.max_amplitude,
            sync_count: AtomicUsize::new(0),
            mode: config.mode,
            timing: TimingConfig::function_generator(),
            error_config: ErrorConfig::none(),
        }
    }

    /// Replace the fault injection configuration.
    pub fn with_error_config(mut self, error_config: ErrorConfig) -> Self {
        self.error_config = error_config;
        self
    }

    /// Current setup of a channel.
    pub fn setup(&self, channel: u32) -> Option<ChannelWaveformSetup> {
        self.channel(channel).ok()?.setup.lock().clone()
    }

    /// Output switch of a channel.
    pub fn is_output_on(&self, channel: u32) -> bool {
        self.channel(channel).map(|c| c.output.get()).unwrap_or(false)
    }

    /// Calls to `sync_phases()`.
    pub fn sync_count(&self) -> usize {
        self.sync_count.load(Ordering::SeqCst)
    }

    fn channel(&self, channel: u32) -> QdaqResult<&GeneratorChannel> {
        channel
            .checked_sub(1)
            .and_then(|i| self.channels.get(i as usize))
            .ok_or_else(|| {
                QdaqError::Instrument(format!(
                    "mock_function_generator has no channel {}",
                    channel
                ))
            })
    }

    fn check_amplitude(&self, amplitude: f64) -> QdaqResult<()> {
        if amplitude.is_finite() && (0.0..=self.max_amplitude).contains(&amplitude) {
            Ok(())
        } else {
            Err(QdaqError::validation(
                "amplitude",
                format!("{} Vpp outside 0..={} Vpp", amplitude, self.max_amplitude),
            ))
        }
    }

    fn last_state(&self) -> serde_json::Value {
        let outputs: Vec<bool> = self.channels.iter().map(|c| c.output.get()).collect();
        json!({ "outputs": outputs })
    }

    fn check(&self, operation: &'static str) -> QdaqResult<()> {
        self.error_config
            .check_operation("mock_function_generator", operation, || self.last_state())
    }
}

impl Default for MockFunctionGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl Parameterized for MockFunctionGenerator {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }
}

#[async_trait]
impl FunctionGenerator for MockFunctionGenerator {
    async fn configure_ramp(&self, channel: u32, waveform: &RampWaveform) -> QdaqResult<()> {
        self.check("configure_ramp")?;
        self.check_amplitude(waveform.amplitude)?;
        if !(0.0..=100.0).contains(&waveform.symmetry) {
            return Err(QdaqError::validation(
                "symmetry",
                format!("{} % outside 0..=100 %", waveform.symmetry),
            ));
        }
        if !(waveform.frequency.is_finite() && waveform.frequency > 0.0) {
            return Err(QdaqError::validation(
                "frequency",
                format!("{} Hz is not a valid frequency", waveform.frequency),
            ));
        }
        self.timing.communicate(self.mode).await;
        *self.channel(channel)?.setup.lock() = Some(ChannelWaveformSetup::Ramp(waveform.clone()));
        Ok(())
    }

    async fn configure_burst(&self, channel: u32, burst: &BurstSettings) -> QdaqResult<()> {
        self.check("configure_burst")?;
        self.check_amplitude(burst.amplitude)?;
        if burst.cycles == 0 {
            return Err(QdaqError::validation("cycles", "burst needs at least one cycle"));
        }
        self.timing.communicate(self.mode).await;
        *self.channel(channel)?.setup.lock() = Some(ChannelWaveformSetup::Burst(burst.clone()));
        Ok(())
    }

    async fn set_output(&self, channel: u32, on: bool) -> QdaqResult<()> {
        self.check("set_output")?;
        self.timing.communicate(self.mode).await;
        self.channel(channel)?.output.set_unchecked(on);
        Ok(())
    }

    async fn sync_phases(&self) -> QdaqResult<()> {
        self.check("sync_phases")?;
        self.sync_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(amplitude: f64) -> RampWaveform {
        RampWaveform {
            amplitude,
            offset: 0.0,
            frequency: 100.0,
            symmetry: 90.0,
            phase: 198.0,
            inverted: false,
        }
    }

    #[tokio::test]
    async fn test_ramp_is_stored() {
        let fg = MockFunctionGenerator::new();
        fg.configure_ramp(1, &ramp(0.5)).await.unwrap();
        assert_eq!(fg.setup(1), Some(ChannelWaveformSetup::Ramp(ramp(0.5))));
        assert_eq!(fg.setup(2), None);
        assert!(fg.configure_ramp(3, &ramp(0.5)).await.is_err());
        assert!(matches!(
            fg.configure_ramp(1, &ramp(20.0)).await,
            Err(QdaqError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_outputs_and_sync() {
        let fg = MockFunctionGenerator::new();
        fg.set_output(2, true).await.unwrap();
        assert!(fg.is_output_on(2));
        assert!(!fg.is_output_on(1));
        assert_eq!(fg.parameters().snapshot()["ch2_output"], true);
        fg.sync_phases().await.unwrap();
        assert_eq!(fg.sync_count(), 1);
    }

    #[tokio::test]
    async fn test_burst_requires_cycles() {
        let fg = MockFunctionGenerator::new();
        let burst = BurstSettings {
            frequency: 1e3,
            amplitude: 1.0,
            offset: 0.5,
            cycles: 0,
            trigger_source: "BUS".to_string(),
        };
        assert!(fg.configure_burst(1, &burst).await.is_err());
        let burst = BurstSettings { cycles: 1, ..burst };
        fg.configure_burst(1, &burst).await.unwrap();
        assert_eq!(fg.setup(1), Some(ChannelWaveformSetup::Burst(burst)));
    }
}
