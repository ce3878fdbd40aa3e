//! Families of sequences that differ in one or more segment attributes.

use qdaq_core::SequenceError;
use serde::{Deserialize, Serialize};

use crate::segment::SegmentArg;
use crate::sequence::Sequence;

/// One varied attribute and the values it takes across the family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    /// Element position.
    pub position: usize,
    /// Channel within the element.
    pub channel: u32,
    /// Segment name.
    pub segment: String,
    /// Attribute to vary.
    pub attribute: SegmentArg,
    /// Value for each family member.
    pub values: Vec<f64>,
}

impl Variation {
    /// Vary one attribute.
    pub fn new(
        position: usize,
        channel: u32,
        segment: impl Into<String>,
        attribute: SegmentArg,
        values: Vec<f64>,
    ) -> Self {
        Self {
            position,
            channel,
            segment: segment.into(),
            attribute,
            values,
        }
    }

    /// Build variations from parallel target lists.
    pub fn zip(
        positions: &[usize],
        channels: &[u32],
        segments: &[&str],
        attributes: &[SegmentArg],
        values: &[Vec<f64>],
    ) -> Result<Vec<Variation>, SequenceError> {
        let n = positions.len();
        if [channels.len(), segments.len(), attributes.len(), values.len()]
            .iter()
            .any(|len| *len != n)
        {
            return Err(SequenceError::VariationMismatch(format!(
                "target lists differ in length: {} positions, {} channels, {} segments, {} attributes, {} value lists",
                n,
                channels.len(),
                segments.len(),
                attributes.len(),
                values.len()
            )));
        }
        Ok((0..n)
            .map(|i| {
                Variation::new(
                    positions[i],
                    channels[i],
                    segments[i],
                    attributes[i],
                    values[i].clone(),
                )
            })
            .collect())
    }
}

fn family_size(variations: &[Variation]) -> Result<usize, SequenceError> {
    let first = variations
        .first()
        .ok_or_else(|| SequenceError::VariationMismatch("no variations given".to_string()))?;
    let n = first.values.len();
    if n == 0 {
        return Err(SequenceError::VariationMismatch(
            "value lists are empty".to_string(),
        ));
    }
    if let Some(bad) = variations.iter().find(|v| v.values.len() != n) {
        return Err(SequenceError::VariationMismatch(format!(
            "'{}' has {} values, expected {}",
            bad.segment,
            bad.values.len(),
            n
        )));
    }
    Ok(n)
}

/// Independent copies of `base`, the n-th with the n-th value of every variation.
pub fn vary_sequence(
    base: &Sequence,
    variations: &[Variation],
) -> Result<Vec<Sequence>, SequenceError> {
    let n = family_size(variations)?;
    (0..n)
        .map(|i| {
            let mut copy = base.clone();
            for variation in variations {
                copy.change_argument(
                    variation.position,
                    variation.channel,
                    &variation.segment,
                    variation.attribute,
                    variation.values[i],
                )?;
            }
            Ok(copy)
        })
        .collect()
}

/// The family of [`vary_sequence`] concatenated in order.
pub fn repeat_and_vary(
    base: &Sequence,
    variations: &[Variation],
) -> Result<Sequence, SequenceError> {
    let family = vary_sequence(base, variations)?;
    let mut members = family.into_iter();
    let first = members.next().ok_or(SequenceError::EmptySequence)?;
    members.try_fold(first, |acc, member| acc.concat(&member))
}
