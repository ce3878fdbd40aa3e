//! Rendered, validated sequences ready for a waveform generator.

use qdaq_core::SequenceError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::blueprint::RenderedChannel;
use crate::sequence::{ElementSettings, Sequence};

/// Rendered samples and marker bits of one channel of one element.
pub type ChannelWaveform = RenderedChannel;

/// One row of the generator's sequence table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceTableEntry {
    /// Wait for a trigger before playing.
    pub trigger_wait: bool,
    /// Repetitions, 0 for infinite.
    pub play_count: u32,
    /// Event-jump target, 0 for none.
    pub event_jump: usize,
    /// Next position, 0 for the following one.
    pub goto: usize,
}

impl From<ElementSettings> for SequenceTableEntry {
    fn from(s: ElementSettings) -> Self {
        Self {
            trigger_wait: s.trigger_wait,
            play_count: s.play_count,
            event_jump: s.event_jump,
            goto: s.goto,
        }
    }
}

/// Everything a generator needs to play a sequence.
///
/// `waveforms[e][c]` is element `e` (0-based) on `channels[c]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadPackage {
    /// Sample rate (Hz).
    pub sample_rate: f64,
    /// Output channels in ascending order.
    pub channels: Vec<u32>,
    /// Rendered waveforms per element and channel.
    pub waveforms: Vec<Vec<ChannelWaveform>>,
    /// Sequence table, one entry per element.
    pub table: Vec<SequenceTableEntry>,
    /// Peak-to-peak amplitude per channel (V).
    pub amplitudes: Vec<f64>,
    /// Offset per channel (V).
    pub offsets: Vec<f64>,
}

/// Slack when checking samples against a channel's output range (V).
const RANGE_EPSILON: f64 = 1e-9;

impl UploadPackage {
    /// Check, render and range-check a sequence.
    ///
    /// Channels an element does not use are filled with zeros.
    pub fn from_sequence(sequence: &Sequence) -> Result<Self, SequenceError> {
        sequence.check_consistency()?;
        let sample_rate = sequence.resolved_sample_rate()?;
        let channels = sequence.channels();

        let (amplitudes, offsets): (Vec<f64>, Vec<f64>) = channels
            .iter()
            .map(|ch| {
                sequence
                    .voltage_range(*ch)
                    .ok_or(SequenceError::MissingVoltageRange(*ch))
            })
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .unzip();

        let mut waveforms = Vec::with_capacity(sequence.len());
        let mut table = Vec::with_capacity(sequence.len());
        for (pos, element, settings) in sequence.iter_positions() {
            let mut rendered = element.render(Some(sample_rate))?;
            let length = rendered.values().map(RenderedChannel::len).max().unwrap_or(0);

            let mut row = Vec::with_capacity(channels.len());
            for (index, channel) in channels.iter().enumerate() {
                let waveform = rendered.remove(channel).unwrap_or_else(|| RenderedChannel {
                    samples: vec![0.0; length],
                    marker1: vec![false; length],
                    marker2: vec![false; length],
                });
                check_range(*channel, &waveform, amplitudes[index], offsets[index])?;
                row.push(waveform);
            }
            debug!(position = pos, samples = length, "rendered element");
            waveforms.push(row);
            table.push(SequenceTableEntry::from(settings));
        }

        Ok(Self {
            sample_rate,
            channels,
            waveforms,
            table,
            amplitudes,
            offsets,
        })
    }

    /// Total samples per channel.
    pub fn samples_per_channel(&self) -> usize {
        self.waveforms
            .iter()
            .filter_map(|row| row.first())
            .map(RenderedChannel::len)
            .sum()
    }

    /// Index of `channel` in [`UploadPackage::channels`].
    pub fn channel_index(&self, channel: u32) -> Option<usize> {
        self.channels.iter().position(|c| *c == channel)
    }
}

fn check_range(
    channel: u32,
    waveform: &RenderedChannel,
    amplitude: f64,
    offset: f64,
) -> Result<(), SequenceError> {
    let min = offset - amplitude / 2.0;
    let max = offset + amplitude / 2.0;
    match waveform
        .samples
        .iter()
        .find(|v| **v < min - RANGE_EPSILON || **v > max + RANGE_EPSILON)
    {
        Some(value) => Err(SequenceError::AmplitudeOutOfRange {
            channel,
            value: *value,
            min,
            max,
        }),
        None => Ok(()),
    }
}
