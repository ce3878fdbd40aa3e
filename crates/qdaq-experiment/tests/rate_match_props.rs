//! Property tests for measurement-time matching.

use proptest::prelude::*;
use qdaq_core::QdaqError;
use qdaq_experiment::rate_match::correct_meas_time;
use qdaq_experiment::SampleRateLadder;

/// Desired times spread over six decades.
fn desired_time() -> impl Strategy<Value = f64> {
    (-7.0_f64..-1.0).prop_map(|exponent| 10f64.powf(exponent))
}

proptest! {
    /// No rate on the ladder gets closer to the requested time.
    #[test]
    fn test_choice_is_closest_on_ladder(desired in desired_time(), npts in 4096_usize..65536) {
        let ladder = SampleRateLadder::uhfli();
        let choice = correct_meas_time(desired, npts, &ladder).unwrap();

        let error = (desired - choice.realized_time).abs();
        for rate in ladder.rates() {
            let other = (desired - npts as f64 / rate).abs();
            prop_assert!(error <= other, "{} s beats {} s", npts as f64 / rate, choice.realized_time);
        }
    }

    /// The reported time is the realized window, up to display rounding.
    #[test]
    fn test_realized_time_is_exact(desired in desired_time(), npts in 4096_usize..65536) {
        let ladder = SampleRateLadder::uhfli();
        let choice = correct_meas_time(desired, npts, &ladder).unwrap();

        prop_assert_eq!(choice.realized_time, npts as f64 / choice.rate);
        prop_assert_eq!(ladder.rate_for_label(&choice.label), Some(choice.rate));
        prop_assert!((choice.time - choice.realized_time).abs() <= choice.realized_time * 1e-4);
    }

    /// Segments shorter than the scope minimum are refused whatever the time.
    #[test]
    fn test_short_segments_rejected(desired in desired_time(), npts in 0_usize..4096) {
        let err = correct_meas_time(desired, npts, &SampleRateLadder::uhfli()).unwrap_err();
        let is_rate_match = matches!(err, QdaqError::RateMatch { minimum: 4096, .. });
        prop_assert!(is_rate_match);
    }
}
