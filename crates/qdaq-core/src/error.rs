//! Custom error types for the acquisition core.
//!
//! This module defines the primary error type, `QdaqError`, shared by every crate in
//! the workspace. Using the `thiserror` crate, it provides a centralized and consistent
//! way to handle the failures that can occur while building pulse sequences, matching
//! digitizer rates and running synchronized sweeps.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: malformed or underspecified experiment parameters. Raised
//!   before any hardware is touched.
//! - **`Validation`**: a named instrument parameter was given a value outside its
//!   declared range or choice list.
//! - **`Sequence`**: a waveform sequence failed its consistency check. Raised before
//!   upload. Wraps [`SequenceError`].
//! - **`RateMatch`**: the requested digitizer buffer is shorter than the platform
//!   minimum.
//! - **`Referential`**: an instrument handed to a sweep is not registered.
//! - **`Interrupted`**: user cancellation. Always raised *after* teardown has
//!   returned the hardware to a safe state.
//! - **`HardwareTimeout`**: an instrument stopped answering. Carries the last known
//!   instrument state for diagnostics and is never retried automatically.
//!
//! By using `#[from]`, `QdaqError` can be created from underlying error types with
//! the `?` operator.

use thiserror::Error;

// =============================================================================
// Sequence Errors
// =============================================================================

/// Consistency failures of the waveform sequence model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SequenceError {
    /// A wait-until segment ends before the preceding segments.
    #[error("segment '{segment}' resolves to a negative duration ({duration:e} s)")]
    NegativeDuration { segment: String, duration: f64 },

    /// A fixed-duration segment was given a non-positive or non-finite duration.
    #[error("segment '{segment}' has invalid duration {duration:e} s")]
    InvalidDuration { segment: String, duration: f64 },

    /// Segment names must be unique within a blueprint.
    #[error("segment name '{0}' is already used in this blueprint")]
    DuplicateSegment(String),

    /// No segment with the given name exists.
    #[error("no segment named '{0}'")]
    UnknownSegment(String),

    /// The attribute does not apply to the segment kind.
    #[error("segment '{segment}' has no attribute '{attribute}'")]
    UnknownAttribute { segment: String, attribute: String },

    /// A marker interval lies outside its blueprint.
    #[error(
        "marker {marker} interval ({offset:e} s, {duration:e} s) exceeds blueprint duration {total:e} s"
    )]
    MarkerOutOfBounds {
        marker: u8,
        offset: f64,
        duration: f64,
        total: f64,
    },

    /// Only markers 1 and 2 exist.
    #[error("invalid marker id {0} (expected 1 or 2)")]
    InvalidMarker(u8),

    /// Two blueprints (or a blueprint and its sequence) disagree on sample rate.
    #[error("sample rate mismatch: {expected} Hz vs {found} Hz")]
    SampleRateMismatch { expected: f64, found: f64 },

    /// Rendering requires a sample rate.
    #[error("no sample rate set")]
    MissingSampleRate,

    /// Channels of one element must play for the same time.
    #[error("element channels disagree on duration: {first:e} s vs {second:e} s")]
    ChannelDurationMismatch { first: f64, second: f64 },

    /// A goto or event-jump target does not reference an element.
    #[error("position {position}: {kind} target {target} is out of range 0..={len}")]
    InvalidJumpTarget {
        position: usize,
        kind: &'static str,
        target: usize,
        len: usize,
    },

    /// Element positions must run 1..=N without gaps.
    #[error("element positions are not contiguous from 1: {0:?}")]
    NonContiguousPositions(Vec<usize>),

    /// No element at the given position.
    #[error("no element at position {0}")]
    UnknownPosition(usize),

    /// No channel with the given index in an element.
    #[error("element has no channel {0}")]
    UnknownChannel(u32),

    /// The sequence exceeds the waveform memory of the generator.
    #[error("sequence needs {samples} samples, waveform memory holds {limit}")]
    SampleBudgetExceeded { samples: usize, limit: usize },

    /// Every played channel needs an amplitude and offset before upload.
    #[error("no voltage range set for channel {0}")]
    MissingVoltageRange(u32),

    /// A sample falls outside the channel's output range.
    #[error("channel {channel}: sample {value} V outside range {min} V..{max} V")]
    AmplitudeOutOfRange {
        channel: u32,
        value: f64,
        min: f64,
        max: f64,
    },

    /// Variation value lists must have equal lengths and match the targets.
    #[error("variation mismatch: {0}")]
    VariationMismatch(String),

    /// The operation needs at least one element.
    #[error("sequence has no elements")]
    EmptySequence,

    /// Waveform file encoding or decoding failed.
    #[error("waveform file: {0}")]
    Encoding(String),
}

/// Convenience alias for results using the core error type.
pub type QdaqResult<T> = std::result::Result<T, QdaqError>;

/// Primary error type for the acquisition core.
///
/// # Error Categories
///
/// 1. **Setup errors** - `Configuration`, `Validation`, `Sequence`, `RateMatch`,
///    `Referential`, `Config`
///    - Raised before hardware is driven
///    - Recovery: fix the experiment parameters
///
/// 2. **Hardware errors** - `HardwareTimeout`, `Instrument`, `ResourceBusy`
///    - Raised while instruments are in use
///    - Recovery: inspect the instrument, no automatic retry
///
/// 3. **Control flow** - `Interrupted`, `SlopeAlreadyUnassigned`
///    - `Interrupted` reaches the caller after teardown
///    - `SlopeAlreadyUnassigned` is only ever swallowed during teardown
#[derive(Error, Debug)]
pub enum QdaqError {
    /// Malformed or underspecified experiment parameters.
    ///
    /// Examples: missing required setting, cycle time below 200 µs, an axis kind
    /// the procedure does not support.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Parameter value outside its declared range or choices.
    #[error("Invalid value for parameter '{parameter}': {reason}")]
    Validation { parameter: String, reason: String },

    /// Sequence consistency check failed.
    #[error("Sequence error: {0}")]
    Sequence(#[from] SequenceError),

    /// Requested point count is shorter than the digitizer's minimum buffer.
    #[error("Rate match error: {npts} points is below the minimum buffer length of {minimum}")]
    RateMatch { npts: usize, minimum: usize },

    /// Instrument is not registered on the active registry.
    #[error("Referential error: {0}")]
    Referential(String),

    /// The sweep was cancelled. Hardware has already been returned to a safe state.
    #[error("Interrupted after {completed_steps} completed steps")]
    Interrupted { completed_steps: usize },

    /// Instrument did not answer in time.
    ///
    /// `last_state` is the most recent state the driver observed, as JSON.
    #[error("Hardware timeout on '{instrument}' during {operation} (last state: {last_state})")]
    HardwareTimeout {
        instrument: String,
        operation: String,
        last_state: serde_json::Value,
    },

    /// Slope un-assignment requested on a channel that has no slope.
    ///
    /// Expected during teardown and never surfaced from it.
    #[error("Ramp slope already unassigned on '{0}'")]
    SlopeAlreadyUnassigned(String),

    /// Another sweep holds the instrument.
    #[error("Instrument '{0}' is in use by another sweep")]
    ResourceBusy(String),

    /// Generic driver failure.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Configuration file could not be loaded or parsed.
    #[error("Config error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// File I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON or TOML (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl QdaqError {
    /// Shorthand for a [`QdaqError::Validation`].
    pub fn validation(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// True for errors that are raised before any hardware is driven.
    pub fn is_fatal_before_hardware(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::Validation { .. }
                | Self::Sequence(_)
                | Self::RateMatch { .. }
                | Self::Referential(_)
                | Self::Config(_)
        )
    }

    /// True if this is a user cancellation.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

impl From<figment::Error> for QdaqError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl From<serde_json::Error> for QdaqError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_error_converts() {
        let err: QdaqError = SequenceError::UnknownPosition(3).into();
        assert!(matches!(
            err,
            QdaqError::Sequence(SequenceError::UnknownPosition(3))
        ));
        assert_eq!(
            err.to_string(),
            "Sequence error: no element at position 3"
        );
    }

    #[test]
    fn test_setup_errors_are_fatal_before_hardware() {
        assert!(QdaqError::Configuration("x".into()).is_fatal_before_hardware());
        assert!(QdaqError::RateMatch {
            npts: 100,
            minimum: 4096
        }
        .is_fatal_before_hardware());
        assert!(!QdaqError::Interrupted { completed_steps: 2 }.is_fatal_before_hardware());
        assert!(!QdaqError::Instrument("x".into()).is_fatal_before_hardware());
    }

    #[test]
    fn test_timeout_carries_last_state() {
        let err = QdaqError::HardwareTimeout {
            instrument: "lockin".into(),
            operation: "read_buffer".into(),
            last_state: serde_json::json!({"buffered_points": 4}),
        };
        let msg = err.to_string();
        assert!(msg.contains("lockin"));
        assert!(msg.contains("buffered_points"));
    }
}
