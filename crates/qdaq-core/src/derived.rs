//! Derived parameters built by composition.
//!
//! A derived parameter wraps the capabilities it depends on and is itself a
//! capability, so procedures cannot tell it apart from a physical channel:
//!
//! - [`VoltageDivider`]: a source channel behind a resistive divider
//! - [`CurrentAmplifier`]: a voltage reading behind an I/V converter
//! - [`Conductance`]: current over excitation in units of e²/h

use async_trait::async_trait;
use std::sync::Arc;

use crate::capabilities::{Readable, SupportsRampedSweep, Sweepable};
use crate::error::{QdaqError, QdaqResult};
use crate::limits::conductance_quanta;

// =============================================================================
// VoltageDivider
// =============================================================================

/// A sweepable channel seen through a divider of ratio `division`.
///
/// Setting `v` on the divider sets `v * division` on the wrapped channel. When the
/// wrapped channel ramps, the divider ramps too, with the slope scaled the same way.
pub struct VoltageDivider {
    inner: Arc<dyn Sweepable>,
    ramp: Option<Arc<dyn SupportsRampedSweep>>,
    division: f64,
    label: String,
}

impl VoltageDivider {
    /// Wrap `inner` behind a divider. `division` must be finite and non-zero.
    pub fn new(
        inner: Arc<dyn Sweepable>,
        division: f64,
        label: impl Into<String>,
    ) -> QdaqResult<Self> {
        if !division.is_finite() || division == 0.0 {
            return Err(QdaqError::Configuration(format!(
                "divider ratio must be finite and non-zero, got {}",
                division
            )));
        }
        Ok(Self {
            inner,
            ramp: None,
            division,
            label: label.into(),
        })
    }

    /// Forward slope control to the wrapped channel.
    pub fn with_ramp(mut self, ramp: Arc<dyn SupportsRampedSweep>) -> Self {
        self.ramp = Some(ramp);
        self
    }

    /// Divider ratio.
    pub fn division(&self) -> f64 {
        self.division
    }

    fn ramp(&self) -> QdaqResult<&Arc<dyn SupportsRampedSweep>> {
        self.ramp.as_ref().ok_or_else(|| {
            QdaqError::Instrument(format!("'{}' has no ramp control", self.label))
        })
    }
}

#[async_trait]
impl Sweepable for VoltageDivider {
    fn label(&self) -> &str {
        &self.label
    }

    fn unit(&self) -> &str {
        self.inner.unit()
    }

    async fn set(&self, value: f64) -> QdaqResult<()> {
        self.inner.set(value * self.division).await
    }

    async fn get(&self) -> QdaqResult<f64> {
        Ok(self.inner.get().await? / self.division)
    }
}

#[async_trait]
impl Readable for VoltageDivider {
    async fn read(&self) -> QdaqResult<f64> {
        Sweepable::get(self).await
    }
}

#[async_trait]
impl SupportsRampedSweep for VoltageDivider {
    async fn assign_slope(&self, slope: f64) -> QdaqResult<()> {
        self.ramp()?.assign_slope(slope * self.division.abs()).await
    }

    async fn unassign_slope(&self) -> QdaqResult<()> {
        self.ramp()?.unassign_slope().await
    }

    async fn slope(&self) -> QdaqResult<Option<f64>> {
        Ok(self
            .ramp()?
            .slope()
            .await?
            .map(|s| s / self.division.abs()))
    }
}

/// A readable excitation behind a fixed attenuation (`value / factor`).
pub struct Attenuated {
    source: Arc<dyn Readable>,
    factor: f64,
}

impl Attenuated {
    /// Divide every reading of `source` by `factor`.
    pub fn new(source: Arc<dyn Readable>, factor: f64) -> QdaqResult<Self> {
        if !factor.is_finite() || factor == 0.0 {
            return Err(QdaqError::Configuration(format!(
                "attenuation factor must be finite and non-zero, got {}",
                factor
            )));
        }
        Ok(Self { source, factor })
    }
}

#[async_trait]
impl Readable for Attenuated {
    async fn read(&self) -> QdaqResult<f64> {
        Ok(self.source.read().await? / self.factor)
    }
}

// =============================================================================
// CurrentAmplifier
// =============================================================================

/// Current through an I/V converter: `reading / iv_gain * scale`.
pub struct CurrentAmplifier {
    voltage: Arc<dyn Readable>,
    iv_gain: f64,
    scale: f64,
}

impl CurrentAmplifier {
    /// Current in amperes.
    pub fn new(voltage: Arc<dyn Readable>, iv_gain: f64) -> QdaqResult<Self> {
        if !iv_gain.is_finite() || iv_gain <= 0.0 {
            return Err(QdaqError::Configuration(format!(
                "I/V gain must be positive, got {}",
                iv_gain
            )));
        }
        Ok(Self {
            voltage,
            iv_gain,
            scale: 1.0,
        })
    }

    /// Report in picoamperes.
    pub fn in_picoamps(mut self) -> Self {
        self.scale = 1e12;
        self
    }
}

#[async_trait]
impl Readable for CurrentAmplifier {
    async fn read(&self) -> QdaqResult<f64> {
        Ok(self.voltage.read().await? / self.iv_gain * self.scale)
    }
}

// =============================================================================
// Conductance
// =============================================================================

/// Differential conductance in units of e²/h.
///
/// `G = signal / iv_gain / excitation * 25818 Ω`, with the signal and the
/// excitation taken from two explicit capabilities.
pub struct Conductance {
    signal: Arc<dyn Readable>,
    excitation: Arc<dyn Readable>,
    iv_gain: f64,
}

impl Conductance {
    /// Compose from a demodulated signal, an excitation amplitude and the I/V gain.
    pub fn new(
        signal: Arc<dyn Readable>,
        excitation: Arc<dyn Readable>,
        iv_gain: f64,
    ) -> QdaqResult<Self> {
        if !iv_gain.is_finite() || iv_gain <= 0.0 {
            return Err(QdaqError::Configuration(format!(
                "I/V gain must be positive, got {}",
                iv_gain
            )));
        }
        Ok(Self {
            signal,
            excitation,
            iv_gain,
        })
    }
}

#[async_trait]
impl Readable for Conductance {
    async fn read(&self) -> QdaqResult<f64> {
        let excitation = self.excitation.read().await?;
        if excitation == 0.0 {
            return Err(QdaqError::Instrument(
                "excitation amplitude is zero, conductance undefined".to_string(),
            ));
        }
        let signal = self.signal.read().await?;
        Ok(conductance_quanta(signal, self.iv_gain, excitation))
    }
}
