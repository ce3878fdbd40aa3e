//! Ordered, branching playback of elements.
//!
//! Positions are 1-based. Per position, [`ElementSettings`] decide whether
//! playback waits for a trigger, how often the element repeats, where an event
//! jumps to and where playback continues afterwards. Jump targets use 0 as "none"
//! (event jump) or "next" (goto).

use qdaq_core::limits::WAVEFORM_MEMORY_SAMPLES;
use qdaq_core::SequenceError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Add;

use crate::blueprint::Blueprint;
use crate::element::Element;
use crate::segment::SegmentArg;
use crate::upload::UploadPackage;

/// Playback settings of one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementSettings {
    /// Wait for a trigger before playing.
    pub trigger_wait: bool,
    /// Repetitions, 0 for infinite.
    pub play_count: u32,
    /// Target position on an event, 0 for none.
    pub event_jump: usize,
    /// Position played next, 0 for the following one.
    pub goto: usize,
}

impl Default for ElementSettings {
    fn default() -> Self {
        Self {
            trigger_wait: false,
            play_count: 1,
            event_jump: 0,
            goto: 0,
        }
    }
}

/// Structural snapshot of one position for metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementDescription {
    /// 1-based position.
    pub position: usize,
    /// Playback settings.
    pub settings: ElementSettings,
    /// Element duration, when resolvable.
    pub duration: Option<f64>,
    /// Blueprints by channel.
    pub channels: BTreeMap<u32, Blueprint>,
}

/// Structural snapshot of a sequence for metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceDescription {
    /// Sequence sample rate, if set.
    pub sample_rate: Option<f64>,
    /// `(amplitude, offset)` per channel.
    pub voltage_ranges: BTreeMap<u32, (f64, f64)>,
    /// Positions in order.
    pub elements: Vec<ElementDescription>,
}

/// A playable sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    elements: BTreeMap<usize, Element>,
    settings: BTreeMap<usize, ElementSettings>,
    sample_rate: Option<f64>,
    voltage_ranges: BTreeMap<u32, (f64, f64)>,
    memory_limit: usize,
}

impl Default for Sequence {
    fn default() -> Self {
        Self {
            elements: BTreeMap::new(),
            settings: BTreeMap::new(),
            sample_rate: None,
            voltage_ranges: BTreeMap::new(),
            memory_limit: WAVEFORM_MEMORY_SAMPLES,
        }
    }
}

impl Sequence {
    /// Empty sequence with the default waveform memory limit.
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Elements
    // =========================================================================

    /// Copy an element into position `pos` (1-based), replacing any previous one.
    pub fn add_element(&mut self, pos: usize, element: &Element) -> Result<(), SequenceError> {
        if pos == 0 {
            return Err(SequenceError::UnknownPosition(0));
        }
        self.elements.insert(pos, element.clone());
        self.settings.entry(pos).or_default();
        Ok(())
    }

    /// Element at `pos`.
    pub fn element(&self, pos: usize) -> Result<&Element, SequenceError> {
        self.elements
            .get(&pos)
            .ok_or(SequenceError::UnknownPosition(pos))
    }

    /// Mutable element at `pos`.
    pub fn element_mut(&mut self, pos: usize) -> Result<&mut Element, SequenceError> {
        self.elements
            .get_mut(&pos)
            .ok_or(SequenceError::UnknownPosition(pos))
    }

    /// Number of positions.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// True without elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Occupied positions in order.
    pub fn positions(&self) -> Vec<usize> {
        self.elements.keys().copied().collect()
    }

    /// Channels used by any element.
    pub fn channels(&self) -> Vec<u32> {
        self.elements
            .values()
            .flat_map(Element::channels)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Change a segment duration of one element.
    pub fn change_duration(
        &mut self,
        pos: usize,
        channel: u32,
        segment: &str,
        duration: f64,
    ) -> Result<(), SequenceError> {
        self.element_mut(pos)?
            .change_duration(channel, segment, duration)
    }

    /// Change a segment attribute of one element.
    pub fn change_argument(
        &mut self,
        pos: usize,
        channel: u32,
        segment: &str,
        arg: SegmentArg,
        value: f64,
    ) -> Result<(), SequenceError> {
        self.element_mut(pos)?
            .change_argument(channel, segment, arg, value)
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Set all playback settings of a position.
    pub fn set_sequence_settings(
        &mut self,
        pos: usize,
        trigger_wait: bool,
        play_count: u32,
        event_jump: usize,
        goto: usize,
    ) -> Result<(), SequenceError> {
        let settings = self
            .settings
            .get_mut(&pos)
            .ok_or(SequenceError::UnknownPosition(pos))?;
        *settings = ElementSettings {
            trigger_wait,
            play_count,
            event_jump,
            goto,
        };
        Ok(())
    }

    /// Set only the event-jump target of a position.
    pub fn set_event_jump(&mut self, pos: usize, target: usize) -> Result<(), SequenceError> {
        self.settings
            .get_mut(&pos)
            .ok_or(SequenceError::UnknownPosition(pos))?
            .event_jump = target;
        Ok(())
    }

    /// Playback settings of a position.
    pub fn settings(&self, pos: usize) -> Result<ElementSettings, SequenceError> {
        self.settings
            .get(&pos)
            .copied()
            .ok_or(SequenceError::UnknownPosition(pos))
    }

    /// Set the sequence sample rate (Hz).
    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = Some(sample_rate);
    }

    /// Sequence sample rate, if set.
    pub fn sample_rate(&self) -> Option<f64> {
        self.sample_rate
    }

    /// Output range of a channel: peak-to-peak `amplitude` around `offset` (V).
    pub fn set_channel_voltage_range(&mut self, channel: u32, amplitude: f64, offset: f64) {
        self.voltage_ranges.insert(channel, (amplitude, offset));
    }

    /// `(amplitude, offset)` of a channel.
    pub fn voltage_range(&self, channel: u32) -> Option<(f64, f64)> {
        self.voltage_ranges.get(&channel).copied()
    }

    /// Waveform memory of the target generator, in samples.
    pub fn set_memory_limit(&mut self, samples: usize) {
        self.memory_limit = samples;
    }

    /// Waveform memory limit in samples.
    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    // =========================================================================
    // Consistency
    // =========================================================================

    /// Sample rate shared by the sequence and all elements.
    pub fn resolved_sample_rate(&self) -> Result<f64, SequenceError> {
        let mut rate = self.sample_rate;
        for element in self.elements.values() {
            match (rate, element.sample_rate()?) {
                (Some(expected), Some(found)) if expected != found => {
                    return Err(SequenceError::SampleRateMismatch { expected, found });
                }
                (None, Some(found)) => rate = Some(found),
                _ => {}
            }
        }
        rate.ok_or(SequenceError::MissingSampleRate)
    }

    /// Samples needed to store every element once.
    pub fn total_samples(&self) -> Result<usize, SequenceError> {
        let sample_rate = self.resolved_sample_rate()?;
        self.elements.values().try_fold(0usize, |acc, element| {
            let duration = element.duration()?;
            Ok(acc + (duration * sample_rate).round() as usize)
        })
    }

    /// Check everything that must hold before upload.
    ///
    /// Positions run 1..=N, the sample rate is uniform, every blueprint validates,
    /// jump targets reference existing positions and the waveforms fit in memory.
    pub fn check_consistency(&self) -> Result<(), SequenceError> {
        if self.elements.is_empty() {
            return Err(SequenceError::EmptySequence);
        }
        let positions = self.positions();
        if positions.iter().enumerate().any(|(i, pos)| *pos != i + 1) {
            return Err(SequenceError::NonContiguousPositions(positions));
        }

        self.resolved_sample_rate()?;
        for element in self.elements.values() {
            element.validate()?;
        }

        let len = self.len();
        for (pos, settings) in &self.settings {
            for (kind, target) in [("goto", settings.goto), ("event jump", settings.event_jump)] {
                if target > len {
                    return Err(SequenceError::InvalidJumpTarget {
                        position: *pos,
                        kind,
                        target,
                        len,
                    });
                }
            }
        }

        let samples = self.total_samples()?;
        if samples > self.memory_limit {
            return Err(SequenceError::SampleBudgetExceeded {
                samples,
                limit: self.memory_limit,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Composition
    // =========================================================================

    /// Append `other` after this sequence.
    ///
    /// Positions of `other` and its non-zero jump targets shift by `self.len()`.
    pub fn concat(&self, other: &Sequence) -> Result<Sequence, SequenceError> {
        let left_rate = self.rate_hint()?;
        let right_rate = other.rate_hint()?;
        if let (Some(expected), Some(found)) = (left_rate, right_rate) {
            if expected != found {
                return Err(SequenceError::SampleRateMismatch { expected, found });
            }
        }

        let shift = self.len();
        let mut result = self.clone();
        result.sample_rate = self.sample_rate.or(other.sample_rate);
        for (pos, element) in &other.elements {
            result.elements.insert(pos + shift, element.clone());
        }
        for (pos, settings) in &other.settings {
            let shifted = |target: usize| if target == 0 { 0 } else { target + shift };
            result.settings.insert(
                pos + shift,
                ElementSettings {
                    event_jump: shifted(settings.event_jump),
                    goto: shifted(settings.goto),
                    ..*settings
                },
            );
        }
        for (channel, range) in &other.voltage_ranges {
            result.voltage_ranges.entry(*channel).or_insert(*range);
        }
        Ok(result)
    }

    fn rate_hint(&self) -> Result<Option<f64>, SequenceError> {
        match self.resolved_sample_rate() {
            Ok(rate) => Ok(Some(rate)),
            Err(SequenceError::MissingSampleRate) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Structural snapshot for dataset metadata.
    pub fn description(&self) -> SequenceDescription {
        SequenceDescription {
            sample_rate: self.sample_rate,
            voltage_ranges: self.voltage_ranges.clone(),
            elements: self
                .elements
                .iter()
                .map(|(pos, element)| ElementDescription {
                    position: *pos,
                    settings: self.settings.get(pos).copied().unwrap_or_default(),
                    duration: element.duration().ok(),
                    channels: element.iter().map(|(ch, bp)| (ch, bp.clone())).collect(),
                })
                .collect(),
        }
    }

    /// Render into an upload package after a full consistency check.
    pub fn output_for_upload(&self) -> Result<UploadPackage, SequenceError> {
        UploadPackage::from_sequence(self)
    }

    pub(crate) fn iter_positions(
        &self,
    ) -> impl Iterator<Item = (usize, &Element, ElementSettings)> {
        self.elements.iter().map(|(pos, element)| {
            (
                *pos,
                element,
                self.settings.get(pos).copied().unwrap_or_default(),
            )
        })
    }
}

impl Add for Sequence {
    type Output = Result<Sequence, SequenceError>;

    fn add(self, rhs: Sequence) -> Self::Output {
        self.concat(&rhs)
    }
}

impl Add<&Sequence> for &Sequence {
    type Output = Result<Sequence, SequenceError>;

    fn add(self, rhs: &Sequence) -> Self::Output {
        self.concat(rhs)
    }
}
