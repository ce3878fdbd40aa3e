//! Mock arbitrary waveform generator.
//!
//! Accepts uploads in the [`AwgFileCodec`] format and decodes them, so tests
//! can inspect exactly what would have been played. Channel amplitude and
//! offset are named parameters with the output limits of a 14-bit AWG.

use crate::common::{ErrorConfig, MockMode, TimingConfig};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use qdaq_core::capabilities::{Parameterized, WaveformUploader};
use qdaq_core::driver::{Capability, DriverFactory, InstrumentComponents};
use qdaq_core::error::{QdaqError, QdaqResult};
use qdaq_core::parameter::{Parameter, ParameterSet};
use qdaq_sequence::{AwgFileCodec, UploadPackage, WaveformEncoder};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

// =============================================================================
// MockAwgFactory - DriverFactory implementation
// =============================================================================

/// Configuration for MockAwg driver
#[derive(Debug, Clone, Deserialize)]
pub struct MockAwgConfig {
    /// Sample clock in Hz (default: 1e9)
    #[serde(default = "default_clock")]
    pub clock: f64,
    /// Number of analog channels (default: 4)
    #[serde(default = "default_channels")]
    pub channels: u32,
    /// Initial peak-to-peak amplitude of every channel (default: 1.0)
    #[serde(default = "default_amplitude")]
    pub amplitude: f64,
    /// Operational mode (default: instant)
    #[serde(default)]
    pub mode: MockMode,
}

fn default_clock() -> f64 {
    1e9
}

fn default_channels() -> u32 {
    4
}

fn default_amplitude() -> f64 {
    1.0
}

impl Default for MockAwgConfig {
    fn default() -> Self {
        Self {
            clock: default_clock(),
            channels: default_channels(),
            amplitude: default_amplitude(),
            mode: MockMode::default(),
        }
    }
}

/// Factory for creating MockAwg instances.
pub struct MockAwgFactory;

static MOCK_AWG_CAPABILITIES: &[Capability] =
    &[Capability::WaveformUploader, Capability::Parameterized];

impl DriverFactory for MockAwgFactory {
    fn driver_type(&self) -> &'static str {
        "mock_awg"
    }

    fn name(&self) -> &'static str {
        "Mock Arbitrary Waveform Generator"
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_AWG_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: MockAwgConfig = config.clone().try_into()?;
        if cfg.channels == 0 {
            return Err(anyhow!("AWG needs at least one channel"));
        }
        if !(CLOCK_RANGE.0..=CLOCK_RANGE.1).contains(&cfg.clock) {
            return Err(anyhow!(
                "clock {} Hz outside {:e}..{:e} Hz",
                cfg.clock,
                CLOCK_RANGE.0,
                CLOCK_RANGE.1
            ));
        }
        if !(AMPLITUDE_RANGE.0..=AMPLITUDE_RANGE.1).contains(&cfg.amplitude) {
            return Err(anyhow!("amplitude {} Vpp out of range", cfg.amplitude));
        }
        Ok(())
    }

    fn build(
        &self,
        config: toml::Value,
    ) -> BoxFuture<'static, Result<Vec<(String, InstrumentComponents)>>> {
        Box::pin(async move {
            let cfg: MockAwgConfig = config.try_into()?;
            let awg = Arc::new(MockAwg::with_config(cfg)?);
            Ok(vec![(String::new(), awg.components())])
        })
    }
}

// =============================================================================
// MockAwg
// =============================================================================

const CLOCK_RANGE: (f64, f64) = (1e7, 1.2e9);
const AMPLITUDE_RANGE: (f64, f64) = (0.02, 4.5);
const OFFSET_RANGE: (f64, f64) = (-2.25, 2.25);

struct AwgChannel {
    amplitude: Parameter<f64>,
    offset: Parameter<f64>,
    output: Parameter<bool>,
}

/// Upload received by [`MockAwg`].
#[derive(Debug, Clone)]
pub struct ReceivedUpload {
    /// File name given by the caller.
    pub file_name: String,
    /// Channels the file was loaded onto.
    pub channels: Vec<u32>,
    /// Decoded file contents.
    pub package: UploadPackage,
}

/// Simulated AWG.
pub struct MockAwg {
    clock: Parameter<f64>,
    running: Parameter<bool>,
    channels: Vec<AwgChannel>,
    params: ParameterSet,
    last_upload: Mutex<Option<ReceivedUpload>>,
    upload_count: AtomicUsize,
    run_count: AtomicUsize,
    stop_count: AtomicUsize,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
}

impl MockAwg {
    /// AWG with default settings.
    pub fn new() -> Self {
        Self::build_with(&MockAwgConfig::default())
    }

    /// AWG from a factory configuration.
    pub fn with_config(config: MockAwgConfig) -> QdaqResult<Self> {
        let awg = Self::build_with(&MockAwgConfig {
            clock: default_clock(),
            amplitude: default_amplitude(),
            ..config.clone()
        });
        awg.clock.set(config.clock)?;
        for channel in &awg.channels {
            channel.amplitude.set(config.amplitude)?;
        }
        Ok(awg)
    }

    fn build_with(config: &MockAwgConfig) -> Self {
        let clock = Parameter::new("clock_freq", config.clock)
            .with_unit("Hz")
            .with_description("Sample clock")
            .with_range(CLOCK_RANGE.0, CLOCK_RANGE.1);
        let running = Parameter::new("run_state", false)
            .with_description("Sequence playback running")
            .read_only();

        let mut params = ParameterSet::new();
        params.register(clock.clone());
        params.register(running.clone());

        let channels = (1..=config.channels)
            .map(|ch| {
                let channel = AwgChannel {
                    amplitude: Parameter::new(format!("ch{}_amp", ch), config.amplitude)
                        .with_unit("V")
                        .with_range(AMPLITUDE_RANGE.0, AMPLITUDE_RANGE.1),
                    offset: Parameter::new(format!("ch{}_offset", ch), 0.0)
                        .with_unit("V")
                        .with_range(OFFSET_RANGE.0, OFFSET_RANGE.1),
                    output: Parameter::new(format!("ch{}_state", ch), false).read_only(),
                };
                params.register(channel.amplitude.clone());
                params.register(channel.offset.clone());
                params.register(channel.output.clone());
                channel
            })
            .collect();

        Self {
            clock,
            running,
            channels,
            params,
            last_upload: Mutex::new(None),
            upload_count: AtomicUsize::new(0),
            run_count: AtomicUsize::new(0),
            stop_count: AtomicUsize::new(0),
            mode: config.mode,
            timing: TimingConfig::awg(),
            error_config: ErrorConfig::none(),
        }
    }

    /// Replace the fault injection configuration.
    pub fn with_error_config(mut self, error_config: ErrorConfig) -> Self {
        self.error_config = error_config;
        self
    }

    /// Capability bag of this AWG.
    pub fn components(self: &Arc<Self>) -> InstrumentComponents {
        InstrumentComponents::new()
            .with_uploader(self.clone())
            .with_parameterized(self.clone())
    }

    /// Set the output range of a channel.
    pub fn set_channel_range(&self, channel: u32, amplitude: f64, offset: f64) -> QdaqResult<()> {
        let ch = self.channel(channel)?;
        ch.amplitude.set(amplitude)?;
        ch.offset.set(offset)
    }

    /// Most recent upload.
    pub fn last_upload(&self) -> Option<ReceivedUpload> {
        self.last_upload.lock().clone()
    }

    /// Number of uploads.
    pub fn upload_count(&self) -> usize {
        self.upload_count.load(Ordering::SeqCst)
    }

    /// Number of `run()` calls.
    pub fn run_count(&self) -> usize {
        self.run_count.load(Ordering::SeqCst)
    }

    /// Number of `stop()` calls.
    pub fn stop_count(&self) -> usize {
        self.stop_count.load(Ordering::SeqCst)
    }

    /// True while playing.
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Output switch of a channel.
    pub fn is_output_on(&self, channel: u32) -> bool {
        self.channel(channel).map(|c| c.output.get()).unwrap_or(false)
    }

    fn channel(&self, channel: u32) -> QdaqResult<&AwgChannel> {
        channel
            .checked_sub(1)
            .and_then(|i| self.channels.get(i as usize))
            .ok_or_else(|| {
                QdaqError::Instrument(format!(
                    "mock_awg has no channel {} (1..={})",
                    channel,
                    self.channels.len()
                ))
            })
    }

    fn last_state(&self) -> serde_json::Value {
        json!({
            "running": self.running.get(),
            "clock": self.clock.get(),
            "uploads": self.upload_count(),
        })
    }

    fn check(&self, operation: &'static str) -> QdaqResult<()> {
        self.error_config
            .check_operation("mock_awg", operation, || self.last_state())
    }
}

impl Default for MockAwg {
    fn default() -> Self {
        Self::new()
    }
}

impl Parameterized for MockAwg {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }
}

#[async_trait]
impl WaveformUploader for MockAwg {
    async fn clock_frequency(&self) -> QdaqResult<f64> {
        self.check("clock_frequency")?;
        Ok(self.clock.get())
    }

    async fn channel_range(&self, channel: u32) -> QdaqResult<(f64, f64)> {
        let ch = self.channel(channel)?;
        Ok((ch.amplitude.get(), ch.offset.get()))
    }

    async fn upload(&self, file_name: &str, payload: Bytes, channels: &[u32]) -> QdaqResult<()> {
        self.check("upload")?;
        for &channel in channels {
            self.channel(channel)?;
        }
        let package = AwgFileCodec.decode(&payload)?;
        if package.sample_rate != self.clock.get() {
            return Err(QdaqError::Instrument(format!(
                "file sample rate {} Hz does not match clock {} Hz",
                package.sample_rate,
                self.clock.get()
            )));
        }
        self.timing.load(self.mode).await;

        info!(
            file = file_name,
            bytes = payload.len(),
            elements = package.table.len(),
            "Mock AWG loaded sequence"
        );
        *self.last_upload.lock() = Some(ReceivedUpload {
            file_name: file_name.to_string(),
            channels: channels.to_vec(),
            package,
        });
        self.upload_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_channel_output(&self, channel: u32, on: bool) -> QdaqResult<()> {
        self.check("set_channel_output")?;
        self.channel(channel)?.output.set_unchecked(on);
        Ok(())
    }

    async fn run(&self) -> QdaqResult<()> {
        self.check("run")?;
        if self.last_upload.lock().is_none() {
            return Err(QdaqError::Instrument(
                "mock_awg: nothing loaded to run".to_string(),
            ));
        }
        self.timing.communicate(self.mode).await;
        self.running.set_unchecked(true);
        self.run_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> QdaqResult<()> {
        self.check("stop")?;
        self.timing.communicate(self.mode).await;
        self.running.set_unchecked(false);
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qdaq_sequence::{Blueprint, Element, Segment, Sequence};

    fn small_sequence() -> Sequence {
        let mut bp = Blueprint::with_sample_rate(1e9);
        bp.push_segment(Segment::constant(0.2, 1e-7)).unwrap();
        bp.set_absolute_marker(1, (0.0, 2e-8)).unwrap();
        let mut seq = Sequence::new();
        seq.add_element(1, &Element::new().with_blueprint(1, &bp))
            .unwrap();
        seq.set_sample_rate(1e9);
        seq.set_channel_voltage_range(1, 1.0, 0.0);
        seq
    }

    #[tokio::test]
    async fn test_upload_decodes_package() {
        let awg = MockAwg::new();
        let package = small_sequence().output_for_upload().unwrap();
        let bytes = AwgFileCodec.encode(&package).unwrap();
        awg.upload("pulse.qawg", bytes, &[1]).await.unwrap();

        let received = awg.last_upload().unwrap();
        assert_eq!(received.file_name, "pulse.qawg");
        assert_eq!(received.package.table, package.table);
        assert_eq!(received.package.waveforms[0][0].marker1[..20], [true; 20]);
        assert_eq!(awg.upload_count(), 1);
    }

    #[tokio::test]
    async fn test_upload_rejects_clock_mismatch() {
        let awg = MockAwg::with_config(MockAwgConfig {
            clock: 1.2e9,
            ..Default::default()
        })
        .unwrap();
        let bytes = AwgFileCodec
            .encode(&small_sequence().output_for_upload().unwrap())
            .unwrap();
        assert!(awg.upload("pulse.qawg", bytes, &[1]).await.is_err());
        assert!(awg.upload("x", Bytes::from_static(b"junk"), &[1]).await.is_err());
    }

    #[tokio::test]
    async fn test_run_requires_upload() {
        let awg = MockAwg::new();
        assert!(awg.run().await.is_err());
        let bytes = AwgFileCodec
            .encode(&small_sequence().output_for_upload().unwrap())
            .unwrap();
        awg.upload("pulse.qawg", bytes, &[1]).await.unwrap();
        awg.run().await.unwrap();
        assert!(awg.is_running());
        awg.stop().await.unwrap();
        assert!(!awg.is_running());
        assert_eq!((awg.run_count(), awg.stop_count()), (1, 1));
    }

    #[tokio::test]
    async fn test_channel_ranges_are_parameters() {
        let awg = MockAwg::new();
        awg.set_channel_range(2, 0.5, 0.1).unwrap();
        assert_eq!(awg.channel_range(2).await.unwrap(), (0.5, 0.1));
        assert!(awg.set_channel_range(2, 10.0, 0.0).is_err());
        assert!(awg.channel_range(5).await.is_err());
        assert!(awg
            .parameters()
            .set_json("ch1_offset", json!(3.0))
            .is_err());
        awg.set_channel_output(1, true).await.unwrap();
        assert!(awg.is_output_on(1));
    }
}
