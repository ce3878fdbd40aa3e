//! Matching a desired measurement time to a realizable digitizer sample rate.
//!
//! A scope records a fixed number of points per segment, so the measurement
//! window is `npts / rate` for one of a discrete set of rates. The matcher
//! picks the rate whose window is closest to the requested time.

use qdaq_core::capabilities::{ScopeSettings, TriggerSettings};
use qdaq_core::limits::MIN_SCOPE_BUFFER_LENGTH;
use qdaq_core::{QdaqError, QdaqResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Base clock of the lock-in's scope module (Hz).
const UHFLI_BASE_RATE: f64 = 1.8e9;

/// Rate labels the lock-in uses for `1.8 GHz / 2ⁿ`, n = 0..=16.
const UHFLI_LABELS: [&str; 17] = [
    "1.80 GHz", "900 MHz", "450 MHz", "225 MHz", "113 MHz", "56.2 MHz", "28.1 MHz", "14.0 MHz",
    "7.03 MHz", "3.50 MHz", "1.75 MHz", "880 kHz", "440 kHz", "220 kHz", "110 kHz", "54.9 kHz",
    "27.5 kHz",
];

/// Descending list of sample rates with the labels the instrument expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRateLadder {
    rates: Vec<(f64, String)>,
}

impl SampleRateLadder {
    /// The dyadic ladder of the UHF lock-in scope.
    pub fn uhfli() -> Self {
        let rates = UHFLI_LABELS
            .iter()
            .enumerate()
            .map(|(n, label)| (UHFLI_BASE_RATE / 2f64.powi(n as i32), (*label).to_string()))
            .collect();
        Self { rates }
    }

    /// Ladder from bare rates, labelled with three significant digits.
    ///
    /// Rates are kept in the given order; that order decides ties.
    pub fn from_rates(rates: impl IntoIterator<Item = f64>) -> QdaqResult<Self> {
        let rates: Vec<(f64, String)> = rates
            .into_iter()
            .map(|rate| {
                if rate.is_finite() && rate > 0.0 {
                    Ok((rate, format_rate(rate)))
                } else {
                    Err(QdaqError::Configuration(format!(
                        "sample rate {} is not positive",
                        rate
                    )))
                }
            })
            .collect::<QdaqResult<_>>()?;
        Ok(Self { rates })
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.rates.len()
    }

    /// True for a ladder without candidates.
    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// Candidate rates in ladder order.
    pub fn rates(&self) -> impl Iterator<Item = f64> + '_ {
        self.rates.iter().map(|(rate, _)| *rate)
    }

    /// `(rate, label)` pairs in ladder order.
    pub fn entries(&self) -> &[(f64, String)] {
        &self.rates
    }

    /// Rate for an instrument label such as `"113 MHz"`.
    pub fn rate_for_label(&self, label: &str) -> Option<f64> {
        self.rates
            .iter()
            .find(|(_, l)| l == label)
            .map(|(rate, _)| *rate)
    }
}

impl Default for SampleRateLadder {
    fn default() -> Self {
        Self::uhfli()
    }
}

/// Human-readable rate with three significant digits, e.g. `"56.2 MHz"`.
pub fn format_rate(rate: f64) -> String {
    let (value, unit) = if rate >= 1e9 {
        (rate / 1e9, "GHz")
    } else if rate >= 1e6 {
        (rate / 1e6, "MHz")
    } else if rate >= 1e3 {
        (rate / 1e3, "kHz")
    } else {
        (rate, "Hz")
    };
    if value >= 100.0 {
        format!("{:.0} {}", value, unit)
    } else if value >= 10.0 {
        format!("{:.1} {}", value, unit)
    } else {
        format!("{:.2} {}", value, unit)
    }
}

/// The rate chosen for a measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateChoice {
    /// `realized_time` rounded to four decimals in scientific notation.
    pub time: f64,
    /// Exactly `npts / rate`.
    pub realized_time: f64,
    /// Chosen sample rate (Hz).
    pub rate: f64,
    /// Instrument label of the rate.
    pub label: String,
}

fn round_scientific(value: f64) -> f64 {
    format!("{:.4e}", value).parse().unwrap_or(value)
}

/// Closest realizable measurement time for `npts` points per segment.
///
/// Uses the platform minimum buffer length of 4096 points.
pub fn correct_meas_time(
    desired_time: f64,
    npts: usize,
    ladder: &SampleRateLadder,
) -> QdaqResult<RateChoice> {
    correct_meas_time_with_minimum(desired_time, npts, ladder, MIN_SCOPE_BUFFER_LENGTH)
}

/// [`correct_meas_time`] with an explicit minimum buffer length.
pub fn correct_meas_time_with_minimum(
    desired_time: f64,
    npts: usize,
    ladder: &SampleRateLadder,
    min_buffer_length: usize,
) -> QdaqResult<RateChoice> {
    if npts < min_buffer_length {
        return Err(QdaqError::RateMatch {
            npts,
            minimum: min_buffer_length,
        });
    }
    if !(desired_time.is_finite() && desired_time > 0.0) {
        return Err(QdaqError::Configuration(format!(
            "measurement time must be positive, got {}",
            desired_time
        )));
    }

    let points = npts as f64;
    let mut best: Option<(f64, f64, &str)> = None;
    for (rate, label) in &ladder.rates {
        let realized = points / rate;
        let error = (desired_time - realized).abs();
        // strict comparison keeps the first candidate on ties
        if best.map_or(true, |(best_error, _, _)| error < best_error) {
            best = Some((error, *rate, label.as_str()));
        }
    }
    let (_, rate, label) = best.ok_or_else(|| {
        QdaqError::Configuration("sample rate ladder is empty".to_string())
    })?;

    let realized_time = points / rate;
    let choice = RateChoice {
        time: round_scientific(realized_time),
        realized_time,
        rate,
        label: label.to_string(),
    };
    debug!(
        desired_time,
        npts,
        time = choice.time,
        rate = %choice.label,
        "Matched measurement time"
    );
    Ok(choice)
}

// =============================================================================
// Scope preparation
// =============================================================================

/// Demodulator time constant used with a measurement window.
pub fn demod_time_constant(meas_time: f64) -> f64 {
    0.1 * meas_time
}

/// Scope settings derived from a rate-matched measurement window.
pub trait MeasurementScopeSettings: Sized {
    /// Settings recording `segments` triggered windows of `npts` points, each
    /// as close to `meas_time` as the ladder allows.
    fn for_measurement(
        meas_time: f64,
        npts: usize,
        segments: usize,
        ladder: &SampleRateLadder,
    ) -> QdaqResult<(Self, RateChoice)>;
}

impl MeasurementScopeSettings for ScopeSettings {
    fn for_measurement(
        meas_time: f64,
        npts: usize,
        segments: usize,
        ladder: &SampleRateLadder,
    ) -> QdaqResult<(Self, RateChoice)> {
        if segments == 0 {
            return Err(QdaqError::Configuration(
                "scope needs at least one segment".to_string(),
            ));
        }
        let choice = correct_meas_time(meas_time, npts, ladder)?;
        let settings = ScopeSettings {
            sample_rate_label: choice.label.clone(),
            sample_rate: choice.rate,
            length: npts,
            segments,
            channels: vec![1, 2],
            trigger: TriggerSettings {
                delay: 1e-6,
                holdoff: 60e-6,
                hysteresis: 0.0,
                ..TriggerSettings::default()
            },
        };
        Ok((settings, choice))
    }
}
