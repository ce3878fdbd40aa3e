//! Waveform segments: the atoms a [`crate::Blueprint`] is built from.

use qdaq_core::SequenceError;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

/// Relative slack below which a wait-until target counts as already reached.
const WAIT_TOLERANCE: f64 = 1e-12;

/// Shape of a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SegmentKind {
    /// Linear ramp from `start` to `stop` over the segment duration.
    Ramp {
        /// Level at the segment start (V).
        start: f64,
        /// Level approached at the segment end (V).
        stop: f64,
    },
    /// Flat level.
    Constant {
        /// Output level (V).
        level: f64,
    },
    /// `amplitude * sin(2π f t + phase) + offset`, `t` relative to the segment start.
    Sine {
        /// Frequency (Hz).
        frequency: f64,
        /// Amplitude (V).
        amplitude: f64,
        /// DC offset (V).
        offset: f64,
        /// Phase (rad).
        phase: f64,
    },
    /// Zero output until an absolute time measured from the blueprint start.
    WaitUntil {
        /// Absolute end time (s).
        until: f64,
    },
}

impl SegmentKind {
    /// Base name used when naming segments automatically.
    pub fn base_name(&self) -> &'static str {
        match self {
            SegmentKind::Ramp { .. } => "ramp",
            SegmentKind::Constant { .. } => "constant",
            SegmentKind::Sine { .. } => "sine",
            SegmentKind::WaitUntil { .. } => "waituntil",
        }
    }
}

/// Attribute of a segment that can be edited or varied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentArg {
    /// Segment duration (not applicable to wait-until segments).
    Duration,
    /// Ramp start level.
    Start,
    /// Ramp stop level.
    Stop,
    /// Constant level.
    Level,
    /// Sine frequency.
    Frequency,
    /// Sine amplitude.
    Amplitude,
    /// Sine offset.
    Offset,
    /// Sine phase.
    Phase,
    /// Wait-until absolute end time.
    Until,
}

impl SegmentArg {
    fn as_str(&self) -> &'static str {
        match self {
            SegmentArg::Duration => "duration",
            SegmentArg::Start => "start",
            SegmentArg::Stop => "stop",
            SegmentArg::Level => "level",
            SegmentArg::Frequency => "frequency",
            SegmentArg::Amplitude => "amplitude",
            SegmentArg::Offset => "offset",
            SegmentArg::Phase => "phase",
            SegmentArg::Until => "until",
        }
    }
}

impl fmt::Display for SegmentArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SegmentArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "duration" => Ok(SegmentArg::Duration),
            "start" => Ok(SegmentArg::Start),
            "stop" => Ok(SegmentArg::Stop),
            "level" => Ok(SegmentArg::Level),
            "frequency" | "freq" => Ok(SegmentArg::Frequency),
            "amplitude" | "amp" => Ok(SegmentArg::Amplitude),
            "offset" => Ok(SegmentArg::Offset),
            "phase" => Ok(SegmentArg::Phase),
            "until" => Ok(SegmentArg::Until),
            other => Err(format!("unknown segment attribute '{}'", other)),
        }
    }
}

/// A waveform segment.
///
/// Fixed segments carry an explicit duration; wait-until segments derive theirs
/// from their position inside the blueprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    kind: SegmentKind,
    duration: Option<f64>,
    name: Option<String>,
}

impl Segment {
    /// Linear ramp.
    pub fn ramp(start: f64, stop: f64, duration: f64) -> Self {
        Self::fixed(SegmentKind::Ramp { start, stop }, duration)
    }

    /// Flat level.
    pub fn constant(level: f64, duration: f64) -> Self {
        Self::fixed(SegmentKind::Constant { level }, duration)
    }

    /// Sine wave.
    pub fn sine(frequency: f64, amplitude: f64, offset: f64, phase: f64, duration: f64) -> Self {
        Self::fixed(
            SegmentKind::Sine {
                frequency,
                amplitude,
                offset,
                phase,
            },
            duration,
        )
    }

    /// Zeros until the absolute time `until`.
    pub fn wait_until(until: f64) -> Self {
        Self {
            kind: SegmentKind::WaitUntil { until },
            duration: None,
            name: None,
        }
    }

    fn fixed(kind: SegmentKind, duration: f64) -> Self {
        Self {
            kind,
            duration: Some(duration),
            name: None,
        }
    }

    /// Give the segment an explicit name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Segment name, once named explicitly or by its blueprint.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = Some(name);
    }

    /// Segment shape.
    pub fn kind(&self) -> &SegmentKind {
        &self.kind
    }

    /// Explicit duration, `None` for wait-until segments.
    pub fn fixed_duration(&self) -> Option<f64> {
        self.duration
    }

    /// True for wait-until segments.
    pub fn is_wait(&self) -> bool {
        matches!(self.kind, SegmentKind::WaitUntil { .. })
    }

    fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.kind.base_name().to_string())
    }

    /// Check that a fixed duration is finite and positive.
    pub fn check_duration(&self) -> Result<(), SequenceError> {
        match self.duration {
            Some(d) if !(d.is_finite() && d > 0.0) => Err(SequenceError::InvalidDuration {
                segment: self.label(),
                duration: d,
            }),
            _ => Ok(()),
        }
    }

    /// Duration this segment plays for when it starts at `start` (s).
    pub fn resolve_duration(&self, start: f64) -> Result<f64, SequenceError> {
        match (&self.kind, self.duration) {
            (SegmentKind::WaitUntil { until }, _) => {
                let duration = until - start;
                // sums of segment durations drift by a few ulps
                if duration < 0.0 && -duration <= WAIT_TOLERANCE * until.abs().max(start.abs()) {
                    return Ok(0.0);
                }
                if duration < 0.0 {
                    return Err(SequenceError::NegativeDuration {
                        segment: self.label(),
                        duration,
                    });
                }
                Ok(duration)
            }
            (_, Some(d)) => {
                self.check_duration()?;
                Ok(d)
            }
            (_, None) => Err(SequenceError::InvalidDuration {
                segment: self.label(),
                duration: f64::NAN,
            }),
        }
    }

    /// Current value of an attribute.
    pub fn argument(&self, arg: SegmentArg) -> Result<f64, SequenceError> {
        let value = match (&self.kind, arg) {
            (SegmentKind::WaitUntil { .. }, SegmentArg::Duration) => None,
            (_, SegmentArg::Duration) => self.duration,
            (SegmentKind::Ramp { start, .. }, SegmentArg::Start) => Some(*start),
            (SegmentKind::Ramp { stop, .. }, SegmentArg::Stop) => Some(*stop),
            (SegmentKind::Constant { level }, SegmentArg::Level) => Some(*level),
            (SegmentKind::Sine { frequency, .. }, SegmentArg::Frequency) => Some(*frequency),
            (SegmentKind::Sine { amplitude, .. }, SegmentArg::Amplitude) => Some(*amplitude),
            (SegmentKind::Sine { offset, .. }, SegmentArg::Offset) => Some(*offset),
            (SegmentKind::Sine { phase, .. }, SegmentArg::Phase) => Some(*phase),
            (SegmentKind::WaitUntil { until }, SegmentArg::Until) => Some(*until),
            _ => None,
        };
        value.ok_or_else(|| self.unknown_attribute(arg))
    }

    /// Set an attribute. Durations are checked for positivity.
    pub fn set_argument(&mut self, arg: SegmentArg, value: f64) -> Result<(), SequenceError> {
        if arg == SegmentArg::Duration && !self.is_wait() {
            if !(value.is_finite() && value > 0.0) {
                return Err(SequenceError::InvalidDuration {
                    segment: self.label(),
                    duration: value,
                });
            }
            self.duration = Some(value);
            return Ok(());
        }
        let slot = match (&mut self.kind, arg) {
            (SegmentKind::Ramp { start, .. }, SegmentArg::Start) => Some(start),
            (SegmentKind::Ramp { stop, .. }, SegmentArg::Stop) => Some(stop),
            (SegmentKind::Constant { level }, SegmentArg::Level) => Some(level),
            (SegmentKind::Sine { frequency, .. }, SegmentArg::Frequency) => Some(frequency),
            (SegmentKind::Sine { amplitude, .. }, SegmentArg::Amplitude) => Some(amplitude),
            (SegmentKind::Sine { offset, .. }, SegmentArg::Offset) => Some(offset),
            (SegmentKind::Sine { phase, .. }, SegmentArg::Phase) => Some(phase),
            (SegmentKind::WaitUntil { until }, SegmentArg::Until) => Some(until),
            _ => None,
        };
        match slot {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(self.unknown_attribute(arg)),
        }
    }

    fn unknown_attribute(&self, arg: SegmentArg) -> SequenceError {
        SequenceError::UnknownAttribute {
            segment: self.label(),
            attribute: arg.to_string(),
        }
    }

    /// Value at time `t` after the segment start, for a segment lasting `duration`.
    pub fn value_at(&self, t: f64, duration: f64) -> f64 {
        match self.kind {
            SegmentKind::Ramp { start, stop } => {
                if duration > 0.0 {
                    start + (stop - start) * t / duration
                } else {
                    start
                }
            }
            SegmentKind::Constant { level } => level,
            SegmentKind::Sine {
                frequency,
                amplitude,
                offset,
                phase,
            } => amplitude * (2.0 * PI * frequency * t + phase).sin() + offset,
            SegmentKind::WaitUntil { .. } => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ramp_values() {
        let seg = Segment::ramp(0.0, 1.0, 1e-6);
        assert_eq!(seg.value_at(0.0, 1e-6), 0.0);
        assert!((seg.value_at(0.5e-6, 1e-6) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_wait_until_resolves_against_start() {
        let seg = Segment::wait_until(5e-6);
        assert!((seg.resolve_duration(2e-6).unwrap() - 3e-6).abs() < 1e-18);
        assert!(matches!(
            seg.resolve_duration(6e-6),
            Err(SequenceError::NegativeDuration { .. })
        ));
    }

    #[test]
    fn test_wait_until_absorbs_rounding() {
        let seg = Segment::wait_until(0.3);
        // 0.1 + 0.2 lands one ulp past 0.3
        assert_eq!(seg.resolve_duration(0.1 + 0.2), Ok(0.0));
        assert!(matches!(
            seg.resolve_duration(0.3 + 1e-9),
            Err(SequenceError::NegativeDuration { .. })
        ));

        let mut blueprint = crate::Blueprint::new();
        blueprint.push_segment(Segment::constant(0.0, 0.1)).unwrap();
        blueprint.push_segment(Segment::constant(0.0, 0.2)).unwrap();
        blueprint.push_segment(Segment::wait_until(0.3)).unwrap();
        assert_eq!(blueprint.segment_durations().unwrap()[2], 0.0);
    }

    #[test]
    fn test_invalid_duration() {
        let seg = Segment::constant(0.1, 0.0).named("flat");
        assert_eq!(
            seg.check_duration(),
            Err(SequenceError::InvalidDuration {
                segment: "flat".into(),
                duration: 0.0
            })
        );
    }

    #[test]
    fn test_arguments() {
        let mut seg = Segment::sine(1e6, 0.2, 0.0, 0.0, 1e-6);
        seg.set_argument(SegmentArg::Amplitude, 0.3).unwrap();
        assert_eq!(seg.argument(SegmentArg::Amplitude).unwrap(), 0.3);
        assert!(matches!(
            seg.set_argument(SegmentArg::Level, 1.0),
            Err(SequenceError::UnknownAttribute { .. })
        ));

        let mut wait = Segment::wait_until(1e-6);
        assert!(wait.set_argument(SegmentArg::Duration, 1e-6).is_err());
        wait.set_argument(SegmentArg::Until, 2e-6).unwrap();
        assert_eq!(wait.argument(SegmentArg::Until).unwrap(), 2e-6);
    }

    #[test]
    fn test_arg_parsing() {
        assert_eq!("Duration".parse::<SegmentArg>(), Ok(SegmentArg::Duration));
        assert_eq!("amp".parse::<SegmentArg>(), Ok(SegmentArg::Amplitude));
        assert!("width".parse::<SegmentArg>().is_err());
    }
}
