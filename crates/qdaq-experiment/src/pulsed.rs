//! Pulsed experiments: a square pulse riding on a triggered ramp.
//!
//! ```text
//!   function generator ──ramp (one burst per train)──┐
//!                                                    ▼
//!   AWG ── reset ── trigger ── N × [high │ measure │ wait] ──► sample
//!                      │                  │
//!                      └─ marker 2        └─ marker 1 ──► scope trigger
//! ```
//!
//! The slow axis is the pulse width: every step edits the `high` segment of
//! the main element and re-uploads the sequence. The fast axis is the ramp
//! voltage, one scope segment per pulse.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use qdaq_core::capabilities::{
    BurstSettings, FunctionGenerator, RampWaveform, ScopeSettings, SegmentedDigitizer,
    Sweepable, WaveformUploader,
};
use qdaq_core::data::AxisMetadata;
use qdaq_core::limits::{MIN_CYCLE_TIME, MIN_TRANSFER_TIME, PULSED_SAMPLE_RATE};
use qdaq_core::{CancelToken, QdaqError, QdaqResult};
use qdaq_hardware::{HandleId, InstrumentRegistry};
use qdaq_sequence::builders::{pulse_train_sequence, PulseShape, HIGH_SEGMENT, PULSE_CHANNEL};
use qdaq_sequence::{AwgFileCodec, Sequence, SequenceDescription, WaveformEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::detector::{Acquisition, Detector};
use crate::rate_match::{
    correct_meas_time, demod_time_constant, MeasurementScopeSettings, SampleRateLadder,
};
use crate::sweep::{linspace, SweepAxis, SweepDriver, SweepOutcome};

/// Position of the pulse element in a pulse train.
pub const PULSE_ELEMENT_POSITION: usize = 3;

// =============================================================================
// Settings
// =============================================================================

/// Quantity swept within each pulse train.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FastAxisKind {
    /// Function generator ramp voltage.
    Ramp,
}

/// Quantity stepped between pulse trains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlowAxisKind {
    /// Pulse width.
    #[serde(rename = "dt")]
    PulseWidth,
}

/// Complete parameter set of a pulsed experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulsedExperimentSettings {
    /// Fast axis kind.
    pub fast_axis: FastAxisKind,
    /// Slow axis kind.
    pub slow_axis: SlowAxisKind,
    /// First pulse width (s).
    pub slow_start: f64,
    /// Last pulse width (s).
    pub slow_stop: f64,
    /// Pulse widths.
    pub slow_npts: usize,
    /// Ramp start voltage.
    pub fast_start: f64,
    /// Ramp stop voltage.
    pub fast_stop: f64,
    /// Pulses per ramp, one scope segment each.
    pub fast_npts: usize,
    /// Pulse trains averaged per pulse width.
    pub n_avgs: usize,
    /// Scope points per segment.
    pub pts_per_shot: usize,
    /// Pulse width before the sweep sets it (s).
    pub high_time: f64,
    /// Requested measurement window (s), rate-matched before use.
    pub meas_time: f64,
    /// Pulse period (s).
    pub cycle_time: f64,
    /// Wait before each train (s).
    pub transfer_time: f64,
    /// Pulse level (V).
    pub pulse_high: f64,
    /// Pulse end to scope trigger (s).
    pub trigger_delay: f64,
    /// AWG output channel.
    pub awg_channel: u32,
}

impl PulsedExperimentSettings {
    /// Start building settings.
    pub fn builder() -> PulsedExperimentSettingsBuilder {
        PulsedExperimentSettingsBuilder::default()
    }

    /// Check timing limits and counts.
    pub fn validate(&self) -> QdaqResult<()> {
        if self.cycle_time < MIN_CYCLE_TIME {
            return Err(QdaqError::Configuration(format!(
                "cycle time {} s is below the minimum of {} s",
                self.cycle_time, MIN_CYCLE_TIME
            )));
        }
        if self.transfer_time < MIN_TRANSFER_TIME {
            return Err(QdaqError::Configuration(format!(
                "transfer time {} s is below the minimum of {} s",
                self.transfer_time, MIN_TRANSFER_TIME
            )));
        }
        for (name, value) in [
            ("slow_npts", self.slow_npts),
            ("fast_npts", self.fast_npts),
            ("n_avgs", self.n_avgs),
        ] {
            if value == 0 {
                return Err(QdaqError::Configuration(format!(
                    "{} must be at least 1",
                    name
                )));
            }
        }
        if self.fast_npts > u32::MAX as usize {
            return Err(QdaqError::Configuration(format!(
                "{} pulses do not fit a sequence repetition count",
                self.fast_npts
            )));
        }
        Ok(())
    }

    /// Pulse sample rate (Hz).
    pub fn sample_rate(&self) -> f64 {
        PULSED_SAMPLE_RATE
    }

    fn shape(&self, meas_time: f64) -> PulseShape {
        PulseShape {
            high_time: self.high_time,
            meas_time,
            cycle_time: self.cycle_time,
            pulse_high: self.pulse_high,
            trigger_delay: self.trigger_delay,
            compensation_ratio: 0.0,
        }
    }
}

/// Builder for [`PulsedExperimentSettings`]. Every field is required.
#[derive(Debug, Clone, Default)]
pub struct PulsedExperimentSettingsBuilder {
    fast_axis: Option<FastAxisKind>,
    slow_axis: Option<SlowAxisKind>,
    slow_start: Option<f64>,
    slow_stop: Option<f64>,
    slow_npts: Option<usize>,
    fast_start: Option<f64>,
    fast_stop: Option<f64>,
    fast_npts: Option<usize>,
    n_avgs: Option<usize>,
    pts_per_shot: Option<usize>,
    high_time: Option<f64>,
    meas_time: Option<f64>,
    cycle_time: Option<f64>,
    transfer_time: Option<f64>,
    pulse_high: Option<f64>,
    trigger_delay: Option<f64>,
    awg_channel: Option<u32>,
}

macro_rules! setter {
    ($(#[$doc:meta] $name:ident: $ty:ty),* $(,)?) => {
        $(
            #[$doc]
            pub fn $name(mut self, value: $ty) -> Self {
                self.$name = Some(value);
                self
            }
        )*
    };
}

impl PulsedExperimentSettingsBuilder {
    setter! {
        /// Fast axis kind.
        fast_axis: FastAxisKind,
        /// Slow axis kind.
        slow_axis: SlowAxisKind,
        /// First pulse width (s).
        slow_start: f64,
        /// Last pulse width (s).
        slow_stop: f64,
        /// Pulse widths.
        slow_npts: usize,
        /// Ramp start voltage.
        fast_start: f64,
        /// Ramp stop voltage.
        fast_stop: f64,
        /// Pulses per ramp.
        fast_npts: usize,
        /// Trains averaged per width.
        n_avgs: usize,
        /// Scope points per segment.
        pts_per_shot: usize,
        /// Initial pulse width (s).
        high_time: f64,
        /// Requested measurement window (s).
        meas_time: f64,
        /// Pulse period (s).
        cycle_time: f64,
        /// Wait before each train (s).
        transfer_time: f64,
        /// Pulse level (V).
        pulse_high: f64,
        /// Pulse end to scope trigger (s).
        trigger_delay: f64,
        /// AWG output channel.
        awg_channel: u32,
    }

    /// Finish, reporting every missing field at once.
    pub fn build(self) -> QdaqResult<PulsedExperimentSettings> {
        let mut missing = Vec::new();
        macro_rules! take {
            ($($name:ident),*) => {
                ($(
                    if self.$name.is_none() {
                        missing.push(stringify!($name));
                        None
                    } else {
                        self.$name
                    }
                ),*)
            };
        }
        let (
            Some(fast_axis),
            Some(slow_axis),
            Some(slow_start),
            Some(slow_stop),
            Some(slow_npts),
            Some(fast_start),
            Some(fast_stop),
            Some(fast_npts),
            Some(n_avgs),
            Some(pts_per_shot),
            Some(high_time),
            Some(meas_time),
            Some(cycle_time),
            Some(transfer_time),
            Some(pulse_high),
            Some(trigger_delay),
            Some(awg_channel),
        ) = take!(
            fast_axis,
            slow_axis,
            slow_start,
            slow_stop,
            slow_npts,
            fast_start,
            fast_stop,
            fast_npts,
            n_avgs,
            pts_per_shot,
            high_time,
            meas_time,
            cycle_time,
            transfer_time,
            pulse_high,
            trigger_delay,
            awg_channel
        )
        else {
            return Err(QdaqError::Configuration(format!(
                "missing required settings: {}",
                missing.join(", ")
            )));
        };

        let settings = PulsedExperimentSettings {
            fast_axis,
            slow_axis,
            slow_start,
            slow_stop,
            slow_npts,
            fast_start,
            fast_stop,
            fast_npts,
            n_avgs,
            pts_per_shot,
            high_time,
            meas_time,
            cycle_time,
            transfer_time,
            pulse_high,
            trigger_delay,
            awg_channel,
        };
        settings.validate()?;
        Ok(settings)
    }
}

// =============================================================================
// AWG upload
// =============================================================================

/// Render `sequence` with the generator's channel ranges and upload it.
///
/// The generator clock must equal the sequence sample rate.
pub async fn send_sequence_to_awg(
    awg: &dyn WaveformUploader,
    sequence: &Sequence,
    encoder: &dyn WaveformEncoder,
    file_name: &str,
    channels: &[u32],
) -> QdaqResult<()> {
    let rate = sequence.resolved_sample_rate()?;
    let clock = awg.clock_frequency().await?;
    if clock != rate {
        return Err(QdaqError::Configuration(format!(
            "AWG clock is {} Hz but the sequence is sampled at {} Hz",
            clock, rate
        )));
    }

    let mut sequence = sequence.clone();
    for channel in sequence.channels() {
        let (amplitude, offset) = awg.channel_range(channel).await?;
        sequence.set_channel_voltage_range(channel, amplitude, offset);
    }
    let package = sequence.output_for_upload()?;
    let payload = encoder.encode(&package)?;

    let extension = encoder.file_extension();
    let file_name = if file_name.ends_with(extension) {
        file_name.to_string()
    } else {
        format!("{}.{}", file_name, extension)
    };
    debug!(file = %file_name, bytes = payload.len(), ?channels, "Uploading sequence");
    awg.upload(&file_name, payload, channels).await
}

// =============================================================================
// Pulse width axis
// =============================================================================

/// Pulse width as a sweepable quantity.
///
/// Setting a width edits one segment duration of the sequence, re-uploads it
/// and switches the outputs back on (a load switches them off).
pub struct PulseTime {
    sequence: Mutex<Sequence>,
    position: usize,
    channel: u32,
    segment: String,
    awg: Arc<dyn WaveformUploader>,
    awg_channels: Vec<u32>,
    encoder: Arc<dyn WaveformEncoder>,
    file_name: String,
}

impl PulseTime {
    /// Width of the `high` segment of the pulse element of a pulse train.
    pub fn for_pulse_train(
        sequence: Sequence,
        awg: Arc<dyn WaveformUploader>,
        awg_channels: Vec<u32>,
    ) -> Self {
        Self::new(
            sequence,
            PULSE_ELEMENT_POSITION,
            PULSE_CHANNEL,
            HIGH_SEGMENT,
            awg,
            awg_channels,
        )
    }

    /// Width of segment `segment` at `position`/`channel`.
    pub fn new(
        sequence: Sequence,
        position: usize,
        channel: u32,
        segment: impl Into<String>,
        awg: Arc<dyn WaveformUploader>,
        awg_channels: Vec<u32>,
    ) -> Self {
        Self {
            sequence: Mutex::new(sequence),
            position,
            channel,
            segment: segment.into(),
            awg,
            awg_channels,
            encoder: Arc::new(AwgFileCodec),
            file_name: "pulse_time".to_string(),
        }
    }

    /// Use another waveform file format.
    pub fn with_encoder(mut self, encoder: Arc<dyn WaveformEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Handle of the generator this axis uploads to.
    pub fn host(&self) -> HandleId {
        HandleId::of(&self.awg)
    }

    /// Description of the sequence as currently set.
    pub fn sequence_description(&self) -> SequenceDescription {
        self.sequence.lock().description()
    }

    fn current_width(&self) -> QdaqResult<f64> {
        let sequence = self.sequence.lock();
        let width = sequence
            .element(self.position)?
            .blueprint(self.channel)?
            .duration_of(&self.segment)?;
        Ok(width)
    }
}

#[async_trait]
impl Sweepable for PulseTime {
    fn label(&self) -> &str {
        "Pulse width"
    }

    fn unit(&self) -> &str {
        "s"
    }

    async fn set(&self, width: f64) -> QdaqResult<()> {
        // the stored sequence only changes once the generator plays it
        let mut sequence = self.sequence.lock().clone();
        sequence.change_duration(self.position, self.channel, &self.segment, width)?;
        send_sequence_to_awg(
            self.awg.as_ref(),
            &sequence,
            self.encoder.as_ref(),
            &self.file_name,
            &self.awg_channels,
        )
        .await?;
        for &channel in &self.awg_channels {
            self.awg.set_channel_output(channel, true).await?;
        }
        *self.sequence.lock() = sequence;
        debug!(width, "Pulse width uploaded");
        Ok(())
    }

    async fn get(&self) -> QdaqResult<f64> {
        self.current_width()
    }
}

// =============================================================================
// Ramp response detector
// =============================================================================

/// Demodulated response along the ramp, averaged over several pulse trains.
///
/// Each average runs the AWG, acquires one scope record (one segment per
/// pulse) and stops the AWG. The mean of every segment is one point of the
/// trace.
pub struct AverageRampResponse {
    awg_id: String,
    awg: Arc<dyn WaveformUploader>,
    scope_id: String,
    scope: Arc<dyn SegmentedDigitizer>,
    awg_channel: u32,
    n_avgs: usize,
    demod_channel: usize,
    voltages: Vec<f64>,
}

impl AverageRampResponse {
    /// Response over the ramp `voltages`, averaged `n_avgs` times.
    pub fn new(
        awg_id: impl Into<String>,
        awg: Arc<dyn WaveformUploader>,
        scope_id: impl Into<String>,
        scope: Arc<dyn SegmentedDigitizer>,
        awg_channel: u32,
        n_avgs: usize,
        voltages: Vec<f64>,
    ) -> Self {
        Self {
            awg_id: awg_id.into(),
            awg,
            scope_id: scope_id.into(),
            scope,
            awg_channel,
            n_avgs: n_avgs.max(1),
            demod_channel: 0,
            voltages,
        }
    }

    /// Record index of the demodulator channel (default 0).
    pub fn with_demod_channel(mut self, index: usize) -> Self {
        self.demod_channel = index;
        self
    }

    async fn one_train(&self) -> QdaqResult<Vec<f64>> {
        self.awg.run().await?;
        let record = self.scope.acquire().await;
        let stopped = self.awg.stop().await;
        let record = record?;
        stopped?;

        let segments = record.channels.get(self.demod_channel).ok_or_else(|| {
            QdaqError::Instrument(format!(
                "{} recorded no channel index {}",
                self.scope_id, self.demod_channel
            ))
        })?;
        if segments.len() != self.voltages.len() {
            return Err(QdaqError::Instrument(format!(
                "{} recorded {} segments for {} ramp points",
                self.scope_id,
                segments.len(),
                self.voltages.len()
            )));
        }
        Ok(segments
            .iter()
            .map(|s| {
                if s.is_empty() {
                    0.0
                } else {
                    s.iter().sum::<f64>() / s.len() as f64
                }
            })
            .collect())
    }
}

#[async_trait]
impl Detector for AverageRampResponse {
    fn name(&self) -> &str {
        "ramp_response"
    }

    fn fast_axis(&self) -> Option<AxisMetadata> {
        Some(AxisMetadata {
            instrument: self.scope_id.clone(),
            label: "Ramp voltage".to_string(),
            unit: "V".to_string(),
            setpoints: self.voltages.clone(),
            delay: 0.0,
        })
    }

    fn instruments(&self) -> Vec<(String, HandleId)> {
        vec![
            (self.awg_id.clone(), HandleId::of(&self.awg)),
            (self.scope_id.clone(), HandleId::of(&self.scope)),
        ]
    }

    async fn arm(&self) -> QdaqResult<()> {
        self.scope.set_enabled(true).await
    }

    async fn acquire(&self, cancel: &CancelToken) -> QdaqResult<Acquisition> {
        self.awg.set_channel_output(self.awg_channel, true).await?;
        let mut sum = vec![0.0; self.voltages.len()];
        for _ in 0..self.n_avgs {
            if cancel.is_cancelled() {
                return Err(QdaqError::Interrupted { completed_steps: 0 });
            }
            for (acc, v) in sum.iter_mut().zip(self.one_train().await?) {
                *acc += v;
            }
        }
        let n = self.n_avgs as f64;
        Ok(Acquisition::trace(sum.into_iter().map(|s| s / n).collect()))
    }

    async fn disarm(&self) -> QdaqResult<()> {
        let stopped = self.awg.stop().await;
        self.scope.set_enabled(false).await?;
        stopped
    }
}

// =============================================================================
// Instrument preparation
// =============================================================================

/// Configure one externally triggered ramp burst per pulse train.
///
/// The ramp spans `ramp_low..ramp_high` over `no_of_pulses × cycle_time`.
pub async fn prepare_burst_generator(
    generator: &dyn FunctionGenerator,
    channel: u32,
    no_of_pulses: usize,
    cycle_time: f64,
    ramp_low: f64,
    ramp_high: f64,
) -> QdaqResult<()> {
    if no_of_pulses == 0 || !(cycle_time.is_finite() && cycle_time > 0.0) {
        return Err(QdaqError::Configuration(
            "burst generator needs pulses and a positive cycle time".to_string(),
        ));
    }
    let period = no_of_pulses as f64 * cycle_time;
    let amplitude = ramp_high - ramp_low;
    let ramp = RampWaveform {
        amplitude,
        offset: ramp_low,
        frequency: 1.0 / period,
        symmetry: 100.0,
        phase: 180.0,
        inverted: false,
    };
    generator.configure_ramp(channel, &ramp).await?;
    generator
        .configure_burst(
            channel,
            &BurstSettings {
                frequency: ramp.frequency,
                amplitude,
                offset: ramp_low,
                cycles: 1,
                trigger_source: "EXT".to_string(),
            },
        )
        .await?;
    generator.set_output(channel, true).await?;
    info!(channel, period, amplitude, offset = ramp_low, "Burst generator prepared");
    Ok(())
}

/// Registry ids of the instruments taking part in a pulsed experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulsedInstruments {
    /// Waveform generator playing the pulses.
    pub awg: String,
    /// Scope module digitizing the demodulated response.
    pub scope: String,
    /// Function generator producing the ramp.
    pub function_generator: String,
}

impl Default for PulsedInstruments {
    fn default() -> Self {
        Self {
            awg: "awg".to_string(),
            scope: "scope".to_string(),
            function_generator: "fgen".to_string(),
        }
    }
}

/// Prepare every instrument and sweep the pulse width.
pub async fn run_pulsed_experiment(
    registry: &InstrumentRegistry,
    settings: &PulsedExperimentSettings,
    instruments: &PulsedInstruments,
    ladder: &SampleRateLadder,
    cancel: CancelToken,
) -> QdaqResult<SweepOutcome> {
    settings.validate()?;
    let awg = registry.require_uploader(&instruments.awg)?;
    let scope = registry.require_digitizer(&instruments.scope)?;
    let generator = registry.require_function_generator(&instruments.function_generator)?;

    let choice = correct_meas_time(settings.meas_time, settings.pts_per_shot, ladder)?;
    info!(
        requested = settings.meas_time,
        meas_time = choice.time,
        rate = %choice.label,
        "Measurement time matched"
    );

    prepare_burst_generator(
        generator.as_ref(),
        1,
        settings.fast_npts,
        settings.cycle_time,
        settings.fast_start,
        settings.fast_stop,
    )
    .await?;

    let ch = settings.awg_channel;
    registry.set_parameter(&instruments.awg, "clock_freq", json!(settings.sample_rate()))?;
    registry.set_parameter(
        &instruments.awg,
        &format!("ch{}_amp", ch),
        json!(2.0 * settings.pulse_high.abs()),
    )?;
    registry.set_parameter(&instruments.awg, &format!("ch{}_offset", ch), json!(0.0))?;

    let (scope_settings, _) = ScopeSettings::for_measurement(
        choice.time,
        settings.pts_per_shot,
        settings.fast_npts,
        ladder,
    )?;
    scope.configure(&scope_settings).await?;
    registry.set_parameter(
        &instruments.scope,
        "demod_time_constant",
        json!(demod_time_constant(choice.time)),
    )?;

    let sequence = pulse_train_sequence(
        &settings.shape(choice.time),
        settings.sample_rate(),
        settings.transfer_time,
        settings.fast_npts as u32,
    )?;
    let pulse_time = Arc::new(PulseTime::for_pulse_train(sequence, awg.clone(), vec![ch]));
    let host = pulse_time.host();
    let axis = SweepAxis::new(
        instruments.awg.clone(),
        pulse_time,
        settings.slow_start,
        settings.slow_stop,
        settings.slow_npts,
    )
    .hosted_by(host);

    let detector: Arc<dyn Detector> = Arc::new(AverageRampResponse::new(
        instruments.awg.clone(),
        awg,
        instruments.scope.clone(),
        scope,
        ch,
        settings.n_avgs,
        linspace(settings.fast_start, settings.fast_stop, settings.fast_npts),
    ));

    SweepDriver::new(registry)
        .with_cancel(cancel)
        .do1d(&axis, &[detector])
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use qdaq_core::capabilities::Parameterized;
    use qdaq_driver_mock::{ChannelWaveformSetup, MockAwg, MockFunctionGenerator};

    fn complete() -> PulsedExperimentSettingsBuilder {
        PulsedExperimentSettings::builder()
            .fast_axis(FastAxisKind::Ramp)
            .slow_axis(SlowAxisKind::PulseWidth)
            .slow_start(1e-6)
            .slow_stop(3e-6)
            .slow_npts(3)
            .fast_start(-0.1)
            .fast_stop(0.1)
            .fast_npts(5)
            .n_avgs(2)
            .pts_per_shot(4096)
            .high_time(1e-6)
            .meas_time(36e-6)
            .cycle_time(200e-6)
            .transfer_time(150e-3)
            .pulse_high(0.15)
            .trigger_delay(1e-6)
            .awg_channel(1)
    }

    #[test]
    fn test_builder_reports_all_missing_fields() {
        let err = PulsedExperimentSettings::builder()
            .fast_axis(FastAxisKind::Ramp)
            .slow_npts(3)
            .build()
            .unwrap_err();
        match err {
            QdaqError::Configuration(msg) => {
                assert!(msg.starts_with("missing required settings"));
                assert!(msg.contains("slow_axis"));
                assert!(msg.contains("cycle_time"));
                assert!(msg.contains("awg_channel"));
                assert!(!msg.contains("slow_npts"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_timing_minimums() {
        assert!(complete().build().is_ok());
        assert!(matches!(
            complete().cycle_time(199e-6).build(),
            Err(QdaqError::Configuration(msg)) if msg.contains("cycle time")
        ));
        assert!(matches!(
            complete().transfer_time(0.1).build(),
            Err(QdaqError::Configuration(msg)) if msg.contains("transfer time")
        ));
    }

    #[test]
    fn test_axis_kinds_from_names() {
        let fast: FastAxisKind = serde_json::from_str("\"ramp\"").unwrap();
        let slow: SlowAxisKind = serde_json::from_str("\"dt\"").unwrap();
        assert_eq!(fast, FastAxisKind::Ramp);
        assert_eq!(slow, SlowAxisKind::PulseWidth);
        assert!(serde_json::from_str::<SlowAxisKind>("\"amp\"").is_err());
    }

    #[tokio::test]
    async fn test_clock_mismatch_is_configuration() {
        let awg = Arc::new(MockAwg::new());
        awg.parameters().set_json("clock_freq", json!(1.2e9)).unwrap();
        let shape = complete().build().unwrap().shape(36e-6);
        let sequence = pulse_train_sequence(&shape, 1e9, 150e-3, 5).unwrap();

        let err = send_sequence_to_awg(awg.as_ref(), &sequence, &AwgFileCodec, "seq", &[1])
            .await
            .unwrap_err();
        assert!(matches!(err, QdaqError::Configuration(_)));
        assert_eq!(awg.upload_count(), 0);
    }

    #[tokio::test]
    async fn test_pulse_time_reuploads_and_enables_output() {
        let awg = Arc::new(MockAwg::new());
        awg.set_channel_range(1, 0.3, 0.0).unwrap();
        let shape = complete().build().unwrap().shape(36e-6);
        let sequence = pulse_train_sequence(&shape, 1e9, 150e-3, 5).unwrap();
        let pulse_time = PulseTime::for_pulse_train(sequence, awg.clone(), vec![1]);

        pulse_time.set(2.5e-6).await.unwrap();
        assert_eq!(pulse_time.get().await.unwrap(), 2.5e-6);
        assert_eq!(awg.upload_count(), 1);
        assert!(awg.is_output_on(1));
        let upload = awg.last_upload().unwrap();
        assert!(upload.file_name.ends_with(AwgFileCodec.file_extension()));
        assert_eq!(upload.package.amplitudes, vec![0.3]);
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_previous_width() {
        let awg = Arc::new(MockAwg::new());
        awg.set_channel_range(1, 0.3, 0.0).unwrap();
        let shape = complete().build().unwrap().shape(36e-6);
        let sequence = pulse_train_sequence(&shape, 1e9, 150e-3, 5).unwrap();
        let pulse_time = PulseTime::for_pulse_train(sequence, awg.clone(), vec![1]);
        let before = pulse_time.get().await.unwrap();

        awg.parameters().set_json("clock_freq", json!(1.2e9)).unwrap();
        let err = pulse_time.set(2.5e-6).await.unwrap_err();
        assert!(matches!(err, QdaqError::Configuration(_)));
        assert_eq!(pulse_time.get().await.unwrap(), before);
        assert_eq!(awg.upload_count(), 0);

        // a later successful set still applies
        awg.parameters().set_json("clock_freq", json!(1e9)).unwrap();
        pulse_time.set(2.5e-6).await.unwrap();
        assert_eq!(pulse_time.get().await.unwrap(), 2.5e-6);
    }

    #[tokio::test]
    async fn test_burst_generator_setup() {
        let generator = MockFunctionGenerator::new();
        prepare_burst_generator(&generator, 1, 10, 200e-6, -0.1, 0.3)
            .await
            .unwrap();
        match generator.setup(1) {
            Some(ChannelWaveformSetup::Burst(burst)) => {
                assert!((burst.frequency - 500.0).abs() < 1e-9);
                assert!((burst.amplitude - 0.4).abs() < 1e-12);
                assert_eq!(burst.offset, -0.1);
                assert_eq!(burst.cycles, 1);
                assert_eq!(burst.trigger_source, "EXT");
            }
            other => panic!("unexpected setup {other:?}"),
        }
        assert!(generator.is_output_on(1));
    }
}
