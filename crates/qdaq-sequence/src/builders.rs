//! Ready-made pulse sequences for pulsed transport experiments.
//!
//! All builders play on channel 1 and name the pulse segment `"high"`, so a
//! slow axis can address it by name afterwards.

use qdaq_core::limits::{MIN_WAIT_SAMPLES, TRIGGER_ARM_TIME, TRIGGER_DURATION, WAIT_REPETITIONS};
use qdaq_core::{QdaqError, QdaqResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::blueprint::Blueprint;
use crate::element::Element;
use crate::segment::{Segment, SegmentArg};
use crate::sequence::Sequence;
use crate::variation::{repeat_and_vary, Variation};

/// Output channel used by the builders.
pub const PULSE_CHANNEL: u32 = 1;

/// Name of the pulse segment.
pub const HIGH_SEGMENT: &str = "high";

/// Name of the measurement segment following the pulse.
pub const MEASURE_SEGMENT: &str = "measure";

/// Length of the digitizer trigger marker in pulse trains (s).
const TRAIN_MARKER_WIDTH: f64 = 10e-6;

/// Timing and level of one pulse-and-measure cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseShape {
    /// Pulse width (s).
    pub high_time: f64,
    /// Measurement window after the pulse (s).
    pub meas_time: f64,
    /// Period of one cycle, pulse start to next pulse start (s).
    pub cycle_time: f64,
    /// Pulse level (V).
    pub pulse_high: f64,
    /// Delay from the end of the pulse to the digitizer trigger (s).
    pub trigger_delay: f64,
    /// Length of a zero-area pre-pulse relative to `high_time + meas_time`; 0 disables it.
    pub compensation_ratio: f64,
}

impl PulseShape {
    fn pulse_blueprint(&self, sample_rate: f64, high_time: f64) -> QdaqResult<Blueprint> {
        let mut bp = Blueprint::with_sample_rate(sample_rate);
        bp.push_segment(
            Segment::ramp(self.pulse_high, self.pulse_high, high_time).named(HIGH_SEGMENT),
        )?;
        bp.push_segment(Segment::ramp(0.0, 0.0, self.meas_time).named(MEASURE_SEGMENT))?;
        Ok(bp)
    }
}

/// Pre-trigger arming element followed by `n_averages` pulse cycles.
///
/// Voltage ranges are left unset; they come from the generator at upload time.
pub fn simple_pulse_sequence(
    shape: &PulseShape,
    sample_rate: f64,
    n_averages: u32,
) -> QdaqResult<Sequence> {
    if shape.compensation_ratio < 0.0 {
        return Err(QdaqError::Configuration(format!(
            "compensation ratio must be non-negative, got {}",
            shape.compensation_ratio
        )));
    }

    let mut main = shape.pulse_blueprint(sample_rate, shape.high_time)?;
    let mut cycle_end = shape.cycle_time;
    if shape.compensation_ratio != 0.0 {
        let area = shape.pulse_high * shape.high_time;
        let duration = shape.compensation_ratio * (shape.high_time + shape.meas_time);
        let level = -area / duration;
        main.insert_segment(0, Segment::ramp(level, level, duration).named("compensation"))?;
        cycle_end += duration;
        debug!(duration, level, "added compensation pre-pulse");
    }
    main.push_segment(Segment::wait_until(cycle_end))?;
    main.set_marker(HIGH_SEGMENT, (shape.high_time + shape.trigger_delay, shape.meas_time), 1)?;

    let mut arm = Blueprint::with_sample_rate(sample_rate);
    arm.push_segment(Segment::ramp(
        0.0,
        0.0,
        TRIGGER_ARM_TIME / f64::from(WAIT_REPETITIONS),
    ))?;

    let mut seq = Sequence::new();
    seq.add_element(1, &Element::new().with_blueprint(PULSE_CHANNEL, &arm))?;
    seq.add_element(2, &Element::new().with_blueprint(PULSE_CHANNEL, &main))?;
    seq.set_sample_rate(sample_rate);
    seq.set_sequence_settings(1, false, WAIT_REPETITIONS, 0, 0)?;
    seq.set_sequence_settings(2, false, n_averages, 0, 0)?;
    Ok(seq)
}

struct TrainParts {
    reset: Element,
    trigger: Element,
    main: Element,
}

fn train_parts(
    shape: &PulseShape,
    sample_rate: f64,
    pre_wait_time: f64,
    high_time: f64,
) -> QdaqResult<TrainParts> {
    let wait_bit = pre_wait_time / f64::from(WAIT_REPETITIONS);
    if wait_bit < MIN_WAIT_SAMPLES / sample_rate {
        return Err(QdaqError::Configuration(format!(
            "pre-wait time {} s too short: each of the {} repetitions must span {} samples",
            pre_wait_time, WAIT_REPETITIONS, MIN_WAIT_SAMPLES
        )));
    }

    let mut main = shape.pulse_blueprint(sample_rate, high_time)?;
    // dead time for the digitizer to re-arm
    main.push_segment(Segment::wait_until(shape.cycle_time))?;
    main.set_marker(MEASURE_SEGMENT, (shape.trigger_delay, TRAIN_MARKER_WIDTH), 1)?;

    let mut reset = Blueprint::with_sample_rate(sample_rate);
    reset.push_segment(Segment::wait_until(wait_bit))?;

    let mut trigger = Blueprint::with_sample_rate(sample_rate);
    trigger.push_segment(Segment::wait_until(TRIGGER_DURATION))?;
    trigger.set_absolute_marker(2, (0.0, TRIGGER_DURATION))?;

    Ok(TrainParts {
        reset: Element::new().with_blueprint(PULSE_CHANNEL, &reset),
        trigger: Element::new().with_blueprint(PULSE_CHANNEL, &trigger),
        main: Element::new().with_blueprint(PULSE_CHANNEL, &main),
    })
}

/// Reset wait, ramp trigger, then `no_of_pulses` pulse cycles.
///
/// Marker 2 on the trigger element starts an external ramp; marker 1 triggers
/// the digitizer once per pulse.
pub fn pulse_train_sequence(
    shape: &PulseShape,
    sample_rate: f64,
    pre_wait_time: f64,
    no_of_pulses: u32,
) -> QdaqResult<Sequence> {
    let parts = train_parts(shape, sample_rate, pre_wait_time, shape.high_time)?;

    let mut seq = Sequence::new();
    seq.add_element(1, &parts.reset)?;
    seq.add_element(2, &parts.trigger)?;
    seq.add_element(3, &parts.main)?;
    seq.set_sample_rate(sample_rate);
    seq.set_channel_voltage_range(PULSE_CHANNEL, 2.0 * shape.pulse_high.abs(), 0.0);

    seq.set_sequence_settings(1, false, WAIT_REPETITIONS, 0, 2)?;
    seq.set_sequence_settings(2, false, 1, 0, 3)?;
    seq.set_sequence_settings(3, false, no_of_pulses, 0, 0)?;
    Ok(seq)
}

/// Positions per family member of [`varied_pulse_train_sequence`].
pub const FAMILY_STRIDE: usize = 4;

/// A router element followed by one pulse train per entry of `high_times`.
///
/// Each train ends in a return element whose event jump leads back to the
/// router; the router's goto picks the train (see [`select_family_member`]).
pub fn varied_pulse_train_sequence(
    shape: &PulseShape,
    sample_rate: f64,
    pre_wait_time: f64,
    no_of_pulses: u32,
    high_times: &[f64],
) -> QdaqResult<Sequence> {
    let first = *high_times.first().ok_or_else(|| {
        QdaqError::Configuration("at least one pulse width is required".to_string())
    })?;
    let parts = train_parts(shape, sample_rate, pre_wait_time, first)?;
    let range = 2.0 * shape.pulse_high.abs();

    let mut minimal = Blueprint::with_sample_rate(sample_rate);
    minimal.push_segment(Segment::wait_until(MIN_WAIT_SAMPLES / sample_rate))?;
    let minimal = Element::new().with_blueprint(PULSE_CHANNEL, &minimal);

    let mut router = Sequence::new();
    router.add_element(1, &minimal)?;
    router.set_sample_rate(sample_rate);
    router.set_channel_voltage_range(PULSE_CHANNEL, range, 0.0);

    let mut base = Sequence::new();
    base.add_element(1, &parts.reset)?;
    base.set_sequence_settings(1, false, WAIT_REPETITIONS, 0, 0)?;
    base.add_element(2, &parts.trigger)?;
    base.set_sequence_settings(2, false, 1, 0, 0)?;
    base.add_element(3, &parts.main)?;
    base.set_sequence_settings(3, false, no_of_pulses, 0, 0)?;
    base.add_element(4, &minimal)?;
    base.set_sequence_settings(4, false, 0, 1, 0)?;
    base.set_sample_rate(sample_rate);
    base.set_channel_voltage_range(PULSE_CHANNEL, range, 0.0);
    base.check_consistency()?;

    let variation = Variation::new(
        3,
        PULSE_CHANNEL,
        HIGH_SEGMENT,
        SegmentArg::Duration,
        high_times.to_vec(),
    );
    let family = repeat_and_vary(&base, &[variation])?;
    let mut full = router.concat(&family)?;

    // concatenation shifted the return jumps; point them back at the router
    for k in 0..high_times.len() {
        full.set_sequence_settings(1 + (k + 1) * FAMILY_STRIDE, false, 0, 1, 0)?;
    }
    full.set_sequence_settings(1, true, 1, 0, 2)?;
    Ok(full)
}

/// Route the router of a [`varied_pulse_train_sequence`] to family member `member`.
pub fn select_family_member(sequence: &mut Sequence, member: usize) -> QdaqResult<()> {
    let members = sequence.len().saturating_sub(1) / FAMILY_STRIDE;
    if member >= members {
        return Err(QdaqError::Configuration(format!(
            "family member {} out of range (sequence holds {})",
            member, members
        )));
    }
    let router = sequence.settings(1)?;
    sequence.set_sequence_settings(
        1,
        router.trigger_wait,
        router.play_count,
        router.event_jump,
        2 + FAMILY_STRIDE * member,
    )?;
    Ok(())
}
