//! Fast charge diagrams: a sawtooth on a function generator, digitized and
//! segment-averaged by the scope for every step of a slow gate sweep.
//!
//! The scope ignores triggers for `holdoff` after each segment, so the
//! sawtooth period is stretched to `holdoff + duration + trigger_delay` and
//! its symmetry and phase shifted so that the rising flank lines up with the
//! recorded window.

use std::sync::Arc;

use qdaq_core::capabilities::{FunctionGenerator, RampWaveform, ScopeSettings, TriggerSettings};
use qdaq_core::limits::MIN_SCOPE_BUFFER_LENGTH;
use qdaq_core::{CancelToken, QdaqError, QdaqResult};
use qdaq_hardware::InstrumentRegistry;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::detector::{Detector, ScopeAverager};
use crate::rate_match::SampleRateLadder;
use crate::sweep::{SweepAxis, SweepDriver, SweepOutcome};

/// Sawtooth timing derived from the scope window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SawtoothPlan {
    /// Recorded window, `length / sample_rate` (s).
    pub duration: f64,
    /// `holdoff + duration + trigger_delay` (s).
    pub compensated_duration: f64,
    /// Sawtooth frequency (Hz).
    pub frequency: f64,
    /// Dead fraction of the period, `holdoff / compensated_duration`.
    pub asymmetry: f64,
    /// Rising portion of the period (%).
    pub symmetry: f64,
    /// Phase without any per-channel offset (degrees).
    pub phase: f64,
    /// Peak-to-peak amplitude (V).
    pub amplitude: f64,
    /// Centre of the ramp (V).
    pub offset: f64,
}

impl SawtoothPlan {
    /// Plan a ramp from `start` to `stop` filling one scope window.
    pub fn new(
        start: f64,
        stop: f64,
        scope_length: usize,
        sample_rate: f64,
        trigger_holdoff: f64,
        trigger_delay: f64,
    ) -> QdaqResult<Self> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(QdaqError::Configuration(format!(
                "scope sample rate must be positive, got {}",
                sample_rate
            )));
        }
        if !(trigger_holdoff >= 0.0 && trigger_delay >= 0.0) {
            return Err(QdaqError::Configuration(
                "trigger holdoff and delay must not be negative".to_string(),
            ));
        }
        let duration = scope_length as f64 / sample_rate;
        let compensated_duration = trigger_holdoff + duration + trigger_delay;
        let asymmetry = trigger_holdoff / compensated_duration;
        let amplitude = (stop - start).abs();
        Ok(Self {
            duration,
            compensated_duration,
            frequency: 1.0 / compensated_duration,
            asymmetry,
            symmetry: 100.0 * (1.0 - asymmetry),
            phase: 180.0 * (1.0 + asymmetry),
            amplitude,
            offset: start + amplitude / 2.0,
        })
    }

    /// Waveform scaled by `multiplier`; a negative multiplier inverts the output.
    pub fn waveform(&self, multiplier: f64, phase_offset: f64) -> RampWaveform {
        RampWaveform {
            amplitude: self.amplitude * multiplier.abs(),
            offset: self.offset,
            frequency: self.frequency,
            symmetry: self.symmetry,
            phase: self.phase + phase_offset,
            inverted: multiplier < 0.0,
        }
    }
}

/// A generator channel playing a scaled copy of the sawtooth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompensationChannel {
    /// Generator channel.
    pub channel: u32,
    /// Amplitude multiplier, negative for inverted polarity.
    #[serde(default = "default_compensation_scale")]
    pub scale: f64,
    /// Phase relative to the main sawtooth (degrees).
    #[serde(default)]
    pub phase_offset: f64,
}

fn default_compensation_scale() -> f64 {
    -1.0
}

/// Acquisition and waveform settings of a fast charge diagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FastChargeSettings {
    /// Sawtooth start voltage.
    pub fast_start: f64,
    /// Sawtooth stop voltage.
    pub fast_stop: f64,
    /// Segments averaged per slow step.
    pub n_averages: usize,
    /// Generator channel playing the sawtooth.
    #[serde(default = "default_generator_channel")]
    pub generator_channel: u32,
    /// Scope rate label.
    #[serde(default = "default_rate_label")]
    pub sample_rate_label: String,
    /// Requested points per segment; raised to the platform minimum.
    #[serde(default = "default_scope_length")]
    pub scope_length: usize,
    /// Record index of the averaged scope channel.
    #[serde(default)]
    pub scope_channel: usize,
    /// Scope trigger setup.
    #[serde(default = "default_trigger")]
    pub trigger: TriggerSettings,
    /// Channels compensating the sawtooth on other gates.
    #[serde(default)]
    pub compensation: Vec<CompensationChannel>,
}

fn default_generator_channel() -> u32 {
    1
}

fn default_rate_label() -> String {
    "14.0 MHz".to_string()
}

fn default_scope_length() -> usize {
    MIN_SCOPE_BUFFER_LENGTH
}

fn default_trigger() -> TriggerSettings {
    TriggerSettings {
        delay: 0.0,
        ..TriggerSettings::default()
    }
}

impl FastChargeSettings {
    /// Settings for a sawtooth from `fast_start` to `fast_stop` with defaults
    /// for everything else.
    pub fn new(fast_start: f64, fast_stop: f64, n_averages: usize) -> Self {
        Self {
            fast_start,
            fast_stop,
            n_averages,
            generator_channel: default_generator_channel(),
            sample_rate_label: default_rate_label(),
            scope_length: default_scope_length(),
            scope_channel: 0,
            trigger: default_trigger(),
            compensation: Vec::new(),
        }
    }

    /// Add a compensation channel.
    pub fn with_compensation(mut self, channel: u32, scale: f64, phase_offset: f64) -> Self {
        self.compensation.push(CompensationChannel {
            channel,
            scale,
            phase_offset,
        });
        self
    }

    /// Points per segment actually recorded.
    pub fn effective_length(&self) -> usize {
        self.scope_length.max(MIN_SCOPE_BUFFER_LENGTH)
    }

    /// Scope settings and sawtooth plan for `ladder`.
    pub fn plan(&self, ladder: &SampleRateLadder) -> QdaqResult<(ScopeSettings, SawtoothPlan)> {
        if self.n_averages == 0 {
            return Err(QdaqError::Configuration(
                "fast charge diagram needs at least one average".to_string(),
            ));
        }
        let rate = ladder.rate_for_label(&self.sample_rate_label).ok_or_else(|| {
            QdaqError::Configuration(format!(
                "'{}' is not a sample rate of the scope",
                self.sample_rate_label
            ))
        })?;
        let length = self.effective_length();
        let plan = SawtoothPlan::new(
            self.fast_start,
            self.fast_stop,
            length,
            rate,
            self.trigger.holdoff,
            self.trigger.delay,
        )?;
        let scope = ScopeSettings {
            sample_rate_label: self.sample_rate_label.clone(),
            sample_rate: rate,
            length,
            segments: self.n_averages,
            channels: vec![1, 2],
            trigger: self.trigger.clone(),
        };
        Ok((scope, plan))
    }

    fn output_channels(&self) -> Vec<u32> {
        let mut channels = vec![self.generator_channel];
        channels.extend(self.compensation.iter().map(|c| c.channel));
        channels
    }
}

async fn switch_outputs(
    generator: &dyn FunctionGenerator,
    channels: &[u32],
    on: bool,
) -> QdaqResult<()> {
    let mut first_error = None;
    for &channel in channels {
        if let Err(e) = generator.set_output(channel, on).await {
            warn!(channel, on, error = %e, "Failed to switch generator output");
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Record a charge diagram: `slow` is stepped, the sawtooth sweeps the fast
/// gate within every scope segment.
///
/// Generator outputs are switched off afterwards, also when the sweep fails
/// or is interrupted.
pub async fn fast_charge_diagram(
    registry: &InstrumentRegistry,
    slow: &SweepAxis,
    generator_id: &str,
    scope_id: &str,
    settings: &FastChargeSettings,
    ladder: &SampleRateLadder,
    cancel: CancelToken,
) -> QdaqResult<SweepOutcome> {
    let generator = registry.require_function_generator(generator_id)?;
    let (scope_settings, plan) = settings.plan(ladder)?;
    info!(
        frequency = plan.frequency,
        amplitude = plan.amplitude,
        offset = plan.offset,
        symmetry = plan.symmetry,
        rate = %scope_settings.sample_rate_label,
        length = scope_settings.length,
        "Sawtooth planned"
    );

    let detector = ScopeAverager::from_registry(registry, scope_id, settings.scope_channel)?
        .with_settings(scope_settings.clone())
        .with_unit("V")
        .with_fast_axis(
            generator_id,
            "Fast sawtooth",
            "V",
            (settings.fast_start, settings.fast_stop, scope_settings.length),
        );
    let detectors: Vec<Arc<dyn Detector>> = vec![Arc::new(detector)];

    generator
        .configure_ramp(settings.generator_channel, &plan.waveform(1.0, 0.0))
        .await?;
    generator.sync_phases().await?;
    for compensation in &settings.compensation {
        generator
            .configure_ramp(
                compensation.channel,
                &plan.waveform(compensation.scale, compensation.phase_offset),
            )
            .await?;
    }
    if !settings.compensation.is_empty() {
        generator.sync_phases().await?;
    }

    let channels = settings.output_channels();
    let outcome = match switch_outputs(generator.as_ref(), &channels, true).await {
        Ok(()) => {
            SweepDriver::new(registry)
                .with_cancel(cancel)
                .do1d(slow, &detectors)
                .await
        }
        Err(e) => Err(e),
    };
    let switched_off = switch_outputs(generator.as_ref(), &channels, false).await;
    info!(channels = ?channels, "Generator outputs off");

    let outcome = outcome?;
    switched_off?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_stretches_period_by_holdoff() {
        let plan = SawtoothPlan::new(-0.2, 0.2, 4096, 14.0625e6, 60e-6, 0.0).unwrap();
        assert!((plan.duration - 4096.0 / 14.0625e6).abs() < 1e-15);
        assert!((plan.compensated_duration - (60e-6 + plan.duration)).abs() < 1e-15);
        assert!((plan.frequency * plan.compensated_duration - 1.0).abs() < 1e-12);
        assert!((plan.asymmetry - 60e-6 / plan.compensated_duration).abs() < 1e-15);
        assert!((plan.symmetry + 100.0 * plan.asymmetry - 100.0).abs() < 1e-9);
        assert!((plan.phase - 180.0 * (1.0 + plan.asymmetry)).abs() < 1e-9);
        assert!((plan.amplitude - 0.4).abs() < 1e-12);
        assert!(plan.offset.abs() < 1e-12);
    }

    #[test]
    fn test_plan_for_reversed_ramp() {
        let plan = SawtoothPlan::new(0.5, 0.1, 4096, 1e6, 0.0, 0.0).unwrap();
        assert!((plan.amplitude - 0.4).abs() < 1e-12);
        assert!((plan.offset - 0.7).abs() < 1e-12);
        assert_eq!(plan.symmetry, 100.0);
        assert_eq!(plan.phase, 180.0);
    }

    #[test]
    fn test_compensation_waveform_is_inverted() {
        let plan = SawtoothPlan::new(0.0, 1.0, 4096, 1e6, 60e-6, 0.0).unwrap();
        let main = plan.waveform(1.0, 0.0);
        let comp = plan.waveform(-0.5, 10.0);
        assert!(!main.inverted);
        assert!(comp.inverted);
        assert_eq!(comp.amplitude, 0.5);
        assert_eq!(comp.phase, main.phase + 10.0);
        assert_eq!(comp.frequency, main.frequency);
    }

    #[test]
    fn test_short_scope_length_is_raised() {
        let mut settings = FastChargeSettings::new(-0.1, 0.1, 10);
        settings.scope_length = 1000;
        let (scope, _) = settings.plan(&SampleRateLadder::uhfli()).unwrap();
        assert_eq!(scope.length, 4096);
        assert_eq!(scope.segments, 10);
        assert_eq!(scope.sample_rate, 1.8e9 / 128.0);

        settings.sample_rate_label = "13 MHz".to_string();
        assert!(matches!(
            settings.plan(&SampleRateLadder::uhfli()),
            Err(QdaqError::Configuration(_))
        ));
    }
}
