//! File round trip and family independence of generated sequences.

use proptest::prelude::*;
use qdaq_sequence::builders::{pulse_train_sequence, PulseShape, HIGH_SEGMENT};
use qdaq_sequence::{
    vary_sequence, AwgFileCodec, Blueprint, Element, Segment, SegmentArg, Sequence, Variation,
    WaveformEncoder,
};

fn shape() -> PulseShape {
    PulseShape {
        high_time: 2e-6,
        meas_time: 5e-6,
        cycle_time: 20e-6,
        pulse_high: 0.15,
        trigger_delay: 0.5e-6,
        compensation_ratio: 0.0,
    }
}

#[test]
fn pulse_train_survives_file_round_trip() {
    let seq = pulse_train_sequence(&shape(), 1e9, 1e-3, 8).unwrap();
    let package = seq.output_for_upload().unwrap();

    let codec = AwgFileCodec;
    let bytes = codec.encode(&package).unwrap();
    let decoded = codec.decode(&bytes).unwrap();

    assert_eq!(decoded.sample_rate, package.sample_rate);
    assert_eq!(decoded.channels, package.channels);
    assert_eq!(decoded.table, package.table);
    assert_eq!(decoded.amplitudes, package.amplitudes);
    assert_eq!(decoded.offsets, package.offsets);

    let lsb = AwgFileCodec::lsb(package.amplitudes[0]);
    for (row, decoded_row) in package.waveforms.iter().zip(&decoded.waveforms) {
        for (original, restored) in row.iter().zip(decoded_row) {
            assert_eq!(original.len(), restored.len());
            assert_eq!(original.marker1, restored.marker1);
            assert_eq!(original.marker2, restored.marker2);
            for (a, b) in original.samples.iter().zip(&restored.samples) {
                assert!((a - b).abs() <= lsb, "{} vs {}", a, b);
            }
        }
    }
}

#[test]
fn family_members_are_independent() {
    let seq = pulse_train_sequence(&shape(), 1e9, 1e-3, 8).unwrap();
    let variation = Variation::new(
        3,
        1,
        HIGH_SEGMENT,
        SegmentArg::Duration,
        vec![1e-6, 2e-6, 3e-6],
    );
    let mut family = vary_sequence(&seq, &[variation]).unwrap();

    family[1].change_duration(3, 1, HIGH_SEGMENT, 7e-6).unwrap();

    let width = |s: &Sequence| {
        s.element(3)
            .unwrap()
            .blueprint(1)
            .unwrap()
            .duration_of(HIGH_SEGMENT)
            .unwrap()
    };
    assert_eq!(width(&family[0]), 1e-6);
    assert_eq!(width(&family[1]), 7e-6);
    assert_eq!(width(&family[2]), 3e-6);
    assert_eq!(width(&seq), 2e-6);
}

fn block(n: usize, goto: usize) -> Sequence {
    let mut bp = Blueprint::with_sample_rate(1e9);
    bp.push_segment(Segment::constant(0.0, 1e-7)).unwrap();
    let element = Element::new().with_blueprint(1, &bp);
    let mut seq = Sequence::new();
    for pos in 1..=n {
        seq.add_element(pos, &element).unwrap();
        seq.set_sequence_settings(pos, false, 1, 0, goto.min(n)).unwrap();
    }
    seq
}

proptest! {
    #[test]
    fn concatenation_shifts_positions_and_targets(
        left_len in 1usize..6,
        right_len in 1usize..6,
        goto in 0usize..6,
    ) {
        let left = block(left_len, 0);
        let right = block(right_len, goto);
        let joined = (&left + &right).unwrap();

        prop_assert_eq!(joined.len(), left_len + right_len);
        prop_assert_eq!(joined.positions(), (1..=left_len + right_len).collect::<Vec<_>>());
        for pos in 1..=right_len {
            let original = right.settings(pos).unwrap().goto;
            let shifted = joined.settings(pos + left_len).unwrap().goto;
            if original == 0 {
                prop_assert_eq!(shifted, 0);
            } else {
                prop_assert_eq!(shifted, original + left_len);
            }
        }
        prop_assert!(joined.check_consistency().is_ok());
    }
}
