//! Detectors: what a sweep records at every step.
//!
//! A detector is armed before the slow axis moves, acquired once the axis has
//! settled and disarmed at teardown. Buffered detectors may step a fast axis
//! of their own between triggers and return a whole trace per step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use qdaq_core::capabilities::{
    BufferedAcquisition, Readable, ScopeSettings, SegmentedDigitizer,
};
use qdaq_core::config::SweepTiming;
use qdaq_core::data::{AxisMetadata, Reading};
use qdaq_core::{CancelToken, QdaqError, QdaqResult};
use qdaq_hardware::{HandleId, InstrumentRegistry};
use tokio::time::sleep;
use tracing::debug;

use crate::sweep::{linspace, SweepAxis};

/// What one detector returned for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
    /// Averaged value, or the trace over a fast axis.
    pub average: Reading,
    /// Buffer contents before conversion, when there was a buffer.
    pub raw: Option<Vec<f64>>,
}

impl Acquisition {
    /// A single value.
    pub fn scalar(value: f64) -> Self {
        Self {
            average: Reading::Scalar(value),
            raw: None,
        }
    }

    /// A trace over a fast axis.
    pub fn trace(values: Vec<f64>) -> Self {
        Self {
            average: Reading::Trace(values),
            raw: None,
        }
    }

    /// Attach the unconverted buffer.
    pub fn with_raw(mut self, raw: Vec<f64>) -> Self {
        self.raw = Some(raw);
        self
    }
}

/// Something read at every step of a sweep.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Column name in the dataset. Unique within a sweep.
    fn name(&self) -> &str;

    /// Unit of the recorded values.
    fn unit(&self) -> &str {
        ""
    }

    /// Fast axis when the detector returns a trace per step.
    fn fast_axis(&self) -> Option<AxisMetadata> {
        None
    }

    /// Registered instruments this detector acts through, as `(id, handle)`.
    fn instruments(&self) -> Vec<(String, HandleId)>;

    /// Fast axis the detector steps itself, if any.
    ///
    /// The sweep driver assigns and releases its ramp slope with the others.
    fn inner_axis(&self) -> Option<&SweepAxis> {
        None
    }

    /// Prepare for the next step.
    async fn arm(&self) -> QdaqResult<()> {
        Ok(())
    }

    /// Measure the current step.
    ///
    /// A detector stepping its own fast axis checks `cancel` between triggers
    /// and returns [`QdaqError::Interrupted`].
    async fn acquire(&self, cancel: &CancelToken) -> QdaqResult<Acquisition>;

    /// Leave the instrument idle. Called once at teardown.
    async fn disarm(&self) -> QdaqResult<()> {
        Ok(())
    }
}

// =============================================================================
// Scalar
// =============================================================================

/// One read of a [`Readable`] per step.
pub struct ScalarDetector {
    name: String,
    id: String,
    unit: String,
    source: Arc<dyn Readable>,
}

impl ScalarDetector {
    /// Detector named `name` reading `source`, registered as `id`.
    pub fn new(name: impl Into<String>, id: impl Into<String>, source: Arc<dyn Readable>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            unit: String::new(),
            source,
        }
    }

    /// Detector over a registered readable, named after its id.
    pub fn from_registry(registry: &InstrumentRegistry, id: &str) -> QdaqResult<Self> {
        Ok(Self::new(id, id, registry.require_readable(id)?))
    }

    /// Set the recorded unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }
}

#[async_trait]
impl Detector for ScalarDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    fn instruments(&self) -> Vec<(String, HandleId)> {
        vec![(self.id.clone(), HandleId::of(&self.source))]
    }

    async fn acquire(&self, _cancel: &CancelToken) -> QdaqResult<Acquisition> {
        Ok(Acquisition::scalar(self.source.read().await?))
    }
}

// =============================================================================
// Buffered
// =============================================================================

type Conversion = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Triggered buffer readout of a lock-in style instrument.
///
/// Per step: reset and start the buffer, send one trigger per fast-axis point
/// (or `triggers` times without a fast axis), each after waiting
/// `time_constant + min_demod_latency`, then pause and read the buffer.
pub struct BufferedDetector {
    name: String,
    id: String,
    unit: String,
    buffer: Arc<dyn BufferedAcquisition>,
    inner: Option<SweepAxis>,
    triggers: usize,
    timing: SweepTiming,
    conversion: Option<Conversion>,
}

impl BufferedDetector {
    /// Detector over `buffer`, registered as `id`.
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        buffer: Arc<dyn BufferedAcquisition>,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            unit: String::new(),
            buffer,
            inner: None,
            triggers: 1,
            timing: SweepTiming::default(),
            conversion: None,
        }
    }

    /// Detector over a registered buffered instrument, named after its id.
    pub fn from_registry(registry: &InstrumentRegistry, id: &str) -> QdaqResult<Self> {
        Ok(Self::new(id, id, registry.require_buffered(id)?))
    }

    /// Step `axis` between triggers and record a trace per step.
    pub fn with_fast_axis(mut self, axis: SweepAxis) -> Self {
        self.inner = Some(axis);
        self
    }

    /// Number of triggers averaged per step without a fast axis.
    pub fn with_triggers(mut self, triggers: usize) -> Self {
        self.triggers = triggers.max(1);
        self
    }

    /// Replace the trigger timing margins.
    pub fn with_timing(mut self, timing: SweepTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Convert every buffered sample before it is recorded.
    pub fn with_conversion<F>(mut self, unit: impl Into<String>, conversion: F) -> Self
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        self.unit = unit.into();
        self.conversion = Some(Arc::new(conversion));
        self
    }

    fn expected_points(&self) -> usize {
        self.inner.as_ref().map_or(self.triggers, |axis| axis.npts)
    }
}

#[async_trait]
impl Detector for BufferedDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    fn fast_axis(&self) -> Option<AxisMetadata> {
        self.inner.as_ref().map(SweepAxis::metadata)
    }

    fn instruments(&self) -> Vec<(String, HandleId)> {
        vec![(self.id.clone(), HandleId::of(&self.buffer))]
    }

    fn inner_axis(&self) -> Option<&SweepAxis> {
        self.inner.as_ref()
    }

    async fn arm(&self) -> QdaqResult<()> {
        self.buffer.reset_buffer().await?;
        self.buffer.start_buffer().await
    }

    async fn acquire(&self, cancel: &CancelToken) -> QdaqResult<Acquisition> {
        let wait = self.timing.trigger_wait(self.buffer.time_constant().await?);
        let points = self.expected_points();
        let fast = self.inner.as_ref().map(SweepAxis::setpoints);

        for k in 0..points {
            if cancel.is_cancelled() {
                self.buffer.pause_buffer().await?;
                return Err(QdaqError::Interrupted { completed_steps: 0 });
            }
            if let (Some(axis), Some(setpoints)) = (&self.inner, &fast) {
                axis.set_and_settle(setpoints[k], axis.delay).await?;
            }
            sleep(wait).await;
            self.buffer.send_trigger().await?;
        }
        self.buffer.pause_buffer().await?;

        let raw = self.buffer.read_buffer().await?;
        if raw.len() != points {
            return Err(QdaqError::Instrument(format!(
                "{} buffered {} points, expected {}",
                self.id,
                raw.len(),
                points
            )));
        }
        let values: Vec<f64> = match &self.conversion {
            Some(convert) => raw.iter().map(|v| convert(*v)).collect(),
            None => raw.clone(),
        };
        debug!(detector = %self.name, points, "Read buffer");

        let acquisition = if self.inner.is_some() {
            Acquisition::trace(values)
        } else {
            Acquisition::scalar(Reading::Trace(values).mean())
        };
        Ok(acquisition.with_raw(raw))
    }

    async fn disarm(&self) -> QdaqResult<()> {
        self.buffer.pause_buffer().await
    }
}

// =============================================================================
// Scope averager
// =============================================================================

/// Segment-averaged trace of one digitizer channel.
///
/// The digitizer's record is treated as a fast axis from `start` to `stop`
/// (for example the sawtooth a function generator applies during each
/// segment).
pub struct ScopeAverager {
    name: String,
    id: String,
    unit: String,
    digitizer: Arc<dyn SegmentedDigitizer>,
    channel: usize,
    settings: Option<ScopeSettings>,
    configured: AtomicBool,
    fast_axis: Option<AxisMetadata>,
}

impl ScopeAverager {
    /// Averager of `channel` (0-based index into the record).
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        digitizer: Arc<dyn SegmentedDigitizer>,
        channel: usize,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            unit: String::new(),
            digitizer,
            channel,
            settings: None,
            configured: AtomicBool::new(false),
            fast_axis: None,
        }
    }

    /// Averager over a registered digitizer, named after its id.
    pub fn from_registry(
        registry: &InstrumentRegistry,
        id: &str,
        channel: usize,
    ) -> QdaqResult<Self> {
        Ok(Self::new(id, id, registry.require_digitizer(id)?, channel))
    }

    /// Apply `settings` on first arm.
    pub fn with_settings(mut self, settings: ScopeSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Set the recorded unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Describe the record as a fast axis over `npts` points.
    pub fn with_fast_axis(
        mut self,
        instrument: impl Into<String>,
        label: impl Into<String>,
        unit: impl Into<String>,
        (start, stop, npts): (f64, f64, usize),
    ) -> Self {
        self.fast_axis = Some(AxisMetadata {
            instrument: instrument.into(),
            label: label.into(),
            unit: unit.into(),
            setpoints: linspace(start, stop, npts),
            delay: 0.0,
        });
        self
    }
}

#[async_trait]
impl Detector for ScopeAverager {
    fn name(&self) -> &str {
        &self.name
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    fn fast_axis(&self) -> Option<AxisMetadata> {
        self.fast_axis.clone()
    }

    fn instruments(&self) -> Vec<(String, HandleId)> {
        vec![(self.id.clone(), HandleId::of(&self.digitizer))]
    }

    async fn arm(&self) -> QdaqResult<()> {
        if let Some(settings) = &self.settings {
            if !self.configured.swap(true, Ordering::SeqCst) {
                if let Err(e) = self.digitizer.configure(settings).await {
                    self.configured.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
        self.digitizer.set_enabled(true).await
    }

    async fn acquire(&self, _cancel: &CancelToken) -> QdaqResult<Acquisition> {
        let record = self.digitizer.acquire().await?;
        let trace = record.segment_average(self.channel).ok_or_else(|| {
            QdaqError::Instrument(format!(
                "{} returned no segments for channel index {}",
                self.id, self.channel
            ))
        })?;
        Ok(Acquisition::trace(trace))
    }

    async fn disarm(&self) -> QdaqResult<()> {
        self.digitizer.set_enabled(false).await
    }
}
