//! Multi-channel unit of playback.

use qdaq_core::SequenceError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::blueprint::{Blueprint, RenderedChannel};
use crate::segment::SegmentArg;

/// Blueprints keyed by output channel, played simultaneously.
///
/// Blueprints are copied in on [`Element::add_blueprint`]; later edits to the
/// caller's blueprint do not reach the element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Element {
    channels: BTreeMap<u32, Blueprint>,
}

impl Element {
    /// Empty element.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy a blueprint onto a channel, replacing any previous one.
    pub fn add_blueprint(&mut self, channel: u32, blueprint: &Blueprint) {
        self.channels.insert(channel, blueprint.clone());
    }

    /// Builder form of [`Element::add_blueprint`].
    pub fn with_blueprint(mut self, channel: u32, blueprint: &Blueprint) -> Self {
        self.add_blueprint(channel, blueprint);
        self
    }

    /// Blueprint of a channel.
    pub fn blueprint(&self, channel: u32) -> Result<&Blueprint, SequenceError> {
        self.channels
            .get(&channel)
            .ok_or(SequenceError::UnknownChannel(channel))
    }

    /// Mutable blueprint of a channel.
    pub fn blueprint_mut(&mut self, channel: u32) -> Result<&mut Blueprint, SequenceError> {
        self.channels
            .get_mut(&channel)
            .ok_or(SequenceError::UnknownChannel(channel))
    }

    /// Channels in ascending order.
    pub fn channels(&self) -> Vec<u32> {
        self.channels.keys().copied().collect()
    }

    /// Iterate over `(channel, blueprint)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &Blueprint)> {
        self.channels.iter().map(|(ch, bp)| (*ch, bp))
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True without channels.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Common sample rate of all channels.
    ///
    /// `Ok(None)` when no channel declares a rate.
    pub fn sample_rate(&self) -> Result<Option<f64>, SequenceError> {
        let mut rate: Option<f64> = None;
        for bp in self.channels.values() {
            match (rate, bp.sample_rate()) {
                (Some(expected), Some(found)) if expected != found => {
                    return Err(SequenceError::SampleRateMismatch { expected, found });
                }
                (None, Some(found)) => rate = Some(found),
                _ => {}
            }
        }
        Ok(rate)
    }

    /// Common duration of all channels.
    ///
    /// Channel durations may differ by at most one sample period.
    pub fn duration(&self) -> Result<f64, SequenceError> {
        let tolerance = match self.sample_rate()? {
            Some(sr) => 1.0 / sr,
            None => 1e-12,
        };
        let mut first: Option<f64> = None;
        for bp in self.channels.values() {
            let duration = bp.duration()?;
            match first {
                Some(f) if (f - duration).abs() > tolerance => {
                    return Err(SequenceError::ChannelDurationMismatch {
                        first: f,
                        second: duration,
                    });
                }
                None => first = Some(duration),
                _ => {}
            }
        }
        first.ok_or(SequenceError::EmptySequence)
    }

    /// Change a segment duration on one channel.
    pub fn change_duration(
        &mut self,
        channel: u32,
        segment: &str,
        duration: f64,
    ) -> Result<(), SequenceError> {
        self.blueprint_mut(channel)?.change_duration(segment, duration)
    }

    /// Change a segment attribute on one channel.
    pub fn change_argument(
        &mut self,
        channel: u32,
        segment: &str,
        arg: SegmentArg,
        value: f64,
    ) -> Result<(), SequenceError> {
        self.blueprint_mut(channel)?.change_argument(segment, arg, value)
    }

    /// Validate every channel and the common duration.
    pub fn validate(&self) -> Result<(), SequenceError> {
        for bp in self.channels.values() {
            bp.validate()?;
        }
        self.duration().map(|_| ())
    }

    /// Render every channel at the element's sample rate (or `fallback`).
    ///
    /// Channels within one sample of each other are padded to equal length.
    pub fn render(
        &self,
        fallback: Option<f64>,
    ) -> Result<BTreeMap<u32, RenderedChannel>, SequenceError> {
        let sample_rate = self
            .sample_rate()?
            .or(fallback)
            .ok_or(SequenceError::MissingSampleRate)?;
        self.validate()?;

        let mut rendered = self
            .channels
            .iter()
            .map(|(ch, bp)| Ok((*ch, bp.render(sample_rate)?)))
            .collect::<Result<BTreeMap<_, _>, SequenceError>>()?;

        let longest = rendered.values().map(RenderedChannel::len).max().unwrap_or(0);
        for channel in rendered.values_mut() {
            let pad = longest - channel.len();
            if pad > 0 {
                let last = channel.samples.last().copied().unwrap_or(0.0);
                channel.samples.extend(std::iter::repeat(last).take(pad));
                channel.marker1.extend(std::iter::repeat(false).take(pad));
                channel.marker2.extend(std::iter::repeat(false).take(pad));
            }
        }
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;

    fn flat(sr: f64, duration: f64) -> Blueprint {
        let mut bp = Blueprint::with_sample_rate(sr);
        bp.push_segment(Segment::constant(0.0, duration).named("flat"))
            .unwrap();
        bp
    }

    #[test]
    fn test_copy_on_add() {
        let mut bp = flat(1e9, 1e-6);
        let element = Element::new().with_blueprint(1, &bp);
        bp.change_duration("flat", 2e-6).unwrap();
        assert!((element.duration().unwrap() - 1e-6).abs() < 1e-15);
    }

    #[test]
    fn test_sample_rate_mismatch() {
        let element = Element::new()
            .with_blueprint(1, &flat(1e9, 1e-6))
            .with_blueprint(2, &flat(1.2e9, 1e-6));
        assert!(matches!(
            element.sample_rate(),
            Err(SequenceError::SampleRateMismatch { .. })
        ));
    }

    #[test]
    fn test_duration_mismatch() {
        let element = Element::new()
            .with_blueprint(1, &flat(1e9, 1e-6))
            .with_blueprint(2, &flat(1e9, 2e-6));
        assert!(matches!(
            element.duration(),
            Err(SequenceError::ChannelDurationMismatch { .. })
        ));
    }

    #[test]
    fn test_render_uses_fallback_rate() {
        let mut bp = Blueprint::new();
        bp.push_segment(Segment::constant(0.5, 1e-7)).unwrap();
        let element = Element::new().with_blueprint(1, &bp);
        assert_eq!(element.render(None), Err(SequenceError::MissingSampleRate));
        let rendered = element.render(Some(1e9)).unwrap();
        assert_eq!(rendered[&1].len(), 100);
    }
}
