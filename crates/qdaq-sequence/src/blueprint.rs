//! Single-channel waveform description.
//!
//! A [`Blueprint`] is an ordered list of named [`Segment`]s plus up to two marker
//! tracks. Markers may be attached to a segment, in which case their offset is
//! relative to that segment's start and is resolved only when intervals are
//! requested: editing an earlier segment's duration moves the marker along.

use qdaq_core::SequenceError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::segment::{Segment, SegmentArg};

/// Tolerance when comparing marker intervals against the blueprint length (s).
const TIME_EPSILON: f64 = 1e-12;

/// Placement of one marker interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "anchor", rename_all = "snake_case")]
pub enum MarkerSpec {
    /// Offset measured from the start of a named segment.
    Relative {
        /// Anchor segment.
        segment: String,
        /// Offset from the segment start (s).
        offset: f64,
        /// Interval length (s).
        duration: f64,
    },
    /// Offset measured from the blueprint start.
    Absolute {
        /// Offset (s).
        offset: f64,
        /// Interval length (s).
        duration: f64,
    },
}

/// Samples and marker bits of one rendered channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderedChannel {
    /// Output voltages.
    pub samples: Vec<f64>,
    /// Marker 1 state per sample.
    pub marker1: Vec<bool>,
    /// Marker 2 state per sample.
    pub marker2: Vec<bool>,
}

impl RenderedChannel {
    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when nothing was rendered.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

fn check_marker_id(marker: u8) -> Result<(), SequenceError> {
    match marker {
        1 | 2 => Ok(()),
        other => Err(SequenceError::InvalidMarker(other)),
    }
}

/// Ordered segments and markers for one output channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    sample_rate: Option<f64>,
    segments: Vec<Segment>,
    markers: BTreeMap<u8, Vec<MarkerSpec>>,
}

impl Blueprint {
    /// Empty blueprint without a sample rate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty blueprint at the given sample rate.
    pub fn with_sample_rate(sample_rate: f64) -> Self {
        Self {
            sample_rate: Some(sample_rate),
            ..Self::default()
        }
    }

    /// Set the sample rate (Hz).
    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = Some(sample_rate);
    }

    /// Sample rate, if set.
    pub fn sample_rate(&self) -> Option<f64> {
        self.sample_rate
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True without segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segments in playback order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Segment names in playback order.
    pub fn segment_names(&self) -> Vec<&str> {
        self.segments.iter().filter_map(Segment::name).collect()
    }

    fn index_of(&self, name: &str) -> Result<usize, SequenceError> {
        self.segments
            .iter()
            .position(|s| s.name() == Some(name))
            .ok_or_else(|| SequenceError::UnknownSegment(name.to_string()))
    }

    fn contains_name(&self, name: &str) -> bool {
        self.segments.iter().any(|s| s.name() == Some(name))
    }

    fn auto_name(&self, base: &str) -> String {
        if !self.contains_name(base) {
            return base.to_string();
        }
        (2..)
            .map(|n| format!("{}{}", base, n))
            .find(|candidate| !self.contains_name(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    /// Insert a segment before position `pos` (`pos == len` appends).
    pub fn insert_segment(&mut self, pos: usize, mut segment: Segment) -> Result<(), SequenceError> {
        if pos > self.segments.len() {
            return Err(SequenceError::UnknownPosition(pos));
        }
        segment.check_duration()?;
        match segment.name() {
            Some(name) if self.contains_name(name) => {
                return Err(SequenceError::DuplicateSegment(name.to_string()));
            }
            Some(_) => {}
            None => {
                let name = self.auto_name(segment.kind().base_name());
                segment.set_name(name);
            }
        }
        self.segments.insert(pos, segment);
        Ok(())
    }

    /// Append a segment.
    pub fn push_segment(&mut self, segment: Segment) -> Result<(), SequenceError> {
        self.insert_segment(self.segments.len(), segment)
    }

    /// Remove a segment and the markers anchored to it.
    pub fn remove_segment(&mut self, name: &str) -> Result<Segment, SequenceError> {
        let index = self.index_of(name)?;
        for specs in self.markers.values_mut() {
            specs.retain(|spec| {
                !matches!(spec, MarkerSpec::Relative { segment, .. } if segment == name)
            });
        }
        Ok(self.segments.remove(index))
    }

    /// Attach a marker interval to the start of a named segment.
    pub fn set_marker(
        &mut self,
        segment: &str,
        (offset, duration): (f64, f64),
        marker: u8,
    ) -> Result<(), SequenceError> {
        check_marker_id(marker)?;
        self.index_of(segment)?;
        self.markers
            .entry(marker)
            .or_default()
            .push(MarkerSpec::Relative {
                segment: segment.to_string(),
                offset,
                duration,
            });
        Ok(())
    }

    /// Add a marker interval measured from the blueprint start.
    pub fn set_absolute_marker(
        &mut self,
        marker: u8,
        (offset, duration): (f64, f64),
    ) -> Result<(), SequenceError> {
        check_marker_id(marker)?;
        self.markers
            .entry(marker)
            .or_default()
            .push(MarkerSpec::Absolute { offset, duration });
        Ok(())
    }

    /// Marker specifications as stored.
    pub fn marker_specs(&self, marker: u8) -> &[MarkerSpec] {
        self.markers.get(&marker).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Change the duration of a fixed segment.
    pub fn change_duration(&mut self, name: &str, duration: f64) -> Result<(), SequenceError> {
        self.change_argument(name, SegmentArg::Duration, duration)
    }

    /// Change one attribute of a segment.
    pub fn change_argument(
        &mut self,
        name: &str,
        arg: SegmentArg,
        value: f64,
    ) -> Result<(), SequenceError> {
        let index = self.index_of(name)?;
        self.segments[index].set_argument(arg, value)
    }

    /// Current value of one attribute of a segment.
    pub fn argument(&self, name: &str, arg: SegmentArg) -> Result<f64, SequenceError> {
        self.segments[self.index_of(name)?].argument(arg)
    }

    /// Resolved durations of all segments in order.
    pub fn segment_durations(&self) -> Result<Vec<f64>, SequenceError> {
        let mut elapsed = 0.0;
        self.segments
            .iter()
            .map(|segment| {
                let duration = segment.resolve_duration(elapsed)?;
                elapsed += duration;
                Ok(duration)
            })
            .collect()
    }

    /// Total duration (s).
    pub fn duration(&self) -> Result<f64, SequenceError> {
        Ok(self.segment_durations()?.iter().sum())
    }

    /// Start time of a segment relative to the blueprint start.
    pub fn segment_start(&self, name: &str) -> Result<f64, SequenceError> {
        let index = self.index_of(name)?;
        Ok(self.segment_durations()?[..index].iter().sum())
    }

    /// Resolved duration of a segment.
    pub fn duration_of(&self, name: &str) -> Result<f64, SequenceError> {
        let index = self.index_of(name)?;
        Ok(self.segment_durations()?[index])
    }

    /// Absolute `(offset, duration)` intervals of a marker.
    pub fn marker_intervals(&self, marker: u8) -> Result<Vec<(f64, f64)>, SequenceError> {
        check_marker_id(marker)?;
        self.marker_specs(marker)
            .iter()
            .map(|spec| match spec {
                MarkerSpec::Relative {
                    segment,
                    offset,
                    duration,
                } => Ok((self.segment_start(segment)? + offset, *duration)),
                MarkerSpec::Absolute { offset, duration } => Ok((*offset, *duration)),
            })
            .collect()
    }

    /// Check durations and marker placement.
    pub fn validate(&self) -> Result<(), SequenceError> {
        let total = self.duration()?;
        for marker in [1u8, 2] {
            for (offset, duration) in self.marker_intervals(marker)? {
                let inside = offset >= -TIME_EPSILON
                    && duration >= 0.0
                    && offset + duration <= total + TIME_EPSILON;
                if !inside {
                    return Err(SequenceError::MarkerOutOfBounds {
                        marker,
                        offset,
                        duration,
                        total,
                    });
                }
            }
        }
        Ok(())
    }

    /// Number of samples at `sample_rate`.
    pub fn num_samples(&self, sample_rate: f64) -> Result<usize, SequenceError> {
        Ok(to_sample(self.duration()?, sample_rate))
    }

    /// Render samples and marker bits at `sample_rate`.
    ///
    /// Segment boundaries are rounded to the sample grid independently, so the
    /// total length is always `round(duration * sample_rate)`.
    pub fn render(&self, sample_rate: f64) -> Result<RenderedChannel, SequenceError> {
        self.validate()?;
        let durations = self.segment_durations()?;
        let total = to_sample(durations.iter().sum(), sample_rate);
        let mut samples = Vec::with_capacity(total);

        let mut start = 0.0;
        for (segment, duration) in self.segments.iter().zip(&durations) {
            let end = start + duration;
            let n = to_sample(end, sample_rate).saturating_sub(to_sample(start, sample_rate));
            samples.extend((0..n).map(|k| segment.value_at(k as f64 / sample_rate, *duration)));
            start = end;
        }

        let marker1 = self.render_marker(1, total, sample_rate)?;
        let marker2 = self.render_marker(2, total, sample_rate)?;
        Ok(RenderedChannel {
            samples,
            marker1,
            marker2,
        })
    }

    fn render_marker(
        &self,
        marker: u8,
        total: usize,
        sample_rate: f64,
    ) -> Result<Vec<bool>, SequenceError> {
        let mut bits = vec![false; total];
        for (offset, duration) in self.marker_intervals(marker)? {
            let from = to_sample(offset, sample_rate).min(total);
            let to = to_sample(offset + duration, sample_rate).min(total);
            bits[from..to.max(from)].iter_mut().for_each(|b| *b = true);
        }
        Ok(bits)
    }
}

fn to_sample(time: f64, sample_rate: f64) -> usize {
    (time * sample_rate).round().max(0.0) as usize
}
