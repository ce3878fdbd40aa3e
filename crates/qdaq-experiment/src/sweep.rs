//! Synchronized sweep driver.
//!
//! Steps one slow axis (or two, for a 2-D map) against a set of detectors and
//! collects one [`DatasetRow`] per step.
//!
//! # Step state machine
//!
//! ```text
//!            ┌─────────────────────────────────────────────────┐
//!            ▼                                                 │
//! ┌──────┐  arm  ┌─────┐  set  ┌──────────┐  ┌────────────┐  ┌─┴───────┐
//! │ Idle │──────▶│ Arm │──────▶│ Settling │─▶│ Triggering │─▶│ Readout │
//! └──────┘       └─────┘       └──────────┘  └────────────┘  └─────────┘
//!    │ cancelled / exhausted / error
//!    ▼
//! ┌──────────┐
//! │ Teardown │  unassign every ramp slope, disarm detectors (runs once)
//! └──────────┘
//! ```
//!
//! Before the first step every instrument is checked against the registry
//! and taken for exclusive use. Teardown runs on success, error and
//! cancellation; if the sweep future itself is dropped, the release is
//! spawned onto the runtime.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use qdaq_core::capabilities::{SupportsRampedSweep, Sweepable};
use qdaq_core::config::{ConfigStore, SweepTiming};
use qdaq_core::data::{
    AxisMetadata, Dataset, DatasetRow, DatasetWriter, DetectorMetadata, SweepMetadata,
    SweepStepResult,
};
use qdaq_core::{CancelToken, QdaqError, QdaqResult};
use qdaq_hardware::{HandleId, InstrumentRegistry};
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::detector::Detector;

// =============================================================================
// Sweep Axis
// =============================================================================

/// Evenly spaced points from `start` to `stop`, both included.
pub fn linspace(start: f64, stop: f64, npts: usize) -> Vec<f64> {
    match npts {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (npts - 1) as f64;
            (0..npts)
                .map(|i| if i + 1 == npts { stop } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// One swept parameter and its range.
#[derive(Clone)]
pub struct SweepAxis {
    id: String,
    target: Arc<dyn Sweepable>,
    ramp: Option<Arc<dyn SupportsRampedSweep>>,
    handle: HandleId,
    /// First setpoint.
    pub start: f64,
    /// Last setpoint.
    pub stop: f64,
    /// Number of setpoints.
    pub npts: usize,
    /// Minimum settle time after each set (s).
    pub delay: f64,
    /// Ramp slope to assign for the sweep (V/s). Falls back to `[ramp_speeds]`.
    pub slope: Option<f64>,
}

impl std::fmt::Debug for SweepAxis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepAxis")
            .field("id", &self.id)
            .field("label", &self.target.label())
            .field("ramped", &self.ramp.is_some())
            .field("start", &self.start)
            .field("stop", &self.stop)
            .field("npts", &self.npts)
            .field("delay", &self.delay)
            .field("slope", &self.slope)
            .finish()
    }
}

impl SweepAxis {
    /// Axis driving `target`, registered as `id`.
    pub fn new(
        id: impl Into<String>,
        target: Arc<dyn Sweepable>,
        start: f64,
        stop: f64,
        npts: usize,
    ) -> Self {
        let handle = HandleId::of(&target);
        Self {
            id: id.into(),
            target,
            ramp: None,
            handle,
            start,
            stop,
            npts,
            delay: 0.0,
            slope: None,
        }
    }

    /// Axis over a registered instrument. Ramp control is picked up when the
    /// instrument supports it.
    pub fn from_registry(
        registry: &InstrumentRegistry,
        id: &str,
        start: f64,
        stop: f64,
        npts: usize,
    ) -> QdaqResult<Self> {
        let target = registry.require_sweepable(id)?;
        let mut axis = Self::new(id, target, start, stop, npts);
        axis.ramp = registry.get_ramped(id);
        Ok(axis)
    }

    /// Attach ramp control.
    pub fn with_ramp(mut self, ramp: Arc<dyn SupportsRampedSweep>) -> Self {
        self.ramp = Some(ramp);
        self
    }

    /// Settle at least `delay` seconds after each set.
    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = delay;
        self
    }

    /// Assign `slope` for the duration of the sweep.
    pub fn with_slope(mut self, slope: f64) -> Self {
        self.slope = Some(slope);
        self
    }

    /// Check the axis against another registered component than its target.
    ///
    /// Used for derived parameters (dividers, pulse widths) that act through a
    /// registered instrument.
    pub fn hosted_by(mut self, host: HandleId) -> Self {
        self.handle = host;
        self
    }

    /// Registry id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The swept parameter.
    pub fn target(&self) -> &Arc<dyn Sweepable> {
        &self.target
    }

    /// Ramp control, if the instrument has it.
    pub fn ramp(&self) -> Option<&Arc<dyn SupportsRampedSweep>> {
        self.ramp.as_ref()
    }

    /// Handle checked against the registry.
    pub fn handle(&self) -> HandleId {
        self.handle
    }

    /// All setpoints in order.
    pub fn setpoints(&self) -> Vec<f64> {
        linspace(self.start, self.stop, self.npts)
    }

    /// Description for dataset metadata.
    pub fn metadata(&self) -> AxisMetadata {
        AxisMetadata {
            instrument: self.id.clone(),
            label: self.target.label().to_string(),
            unit: self.target.unit().to_string(),
            setpoints: self.setpoints(),
            delay: self.delay,
        }
    }

    /// Reject ranges the driver cannot run.
    pub fn validate(&self) -> QdaqResult<()> {
        if self.npts == 0 {
            return Err(QdaqError::Configuration(format!(
                "axis '{}' needs at least one point",
                self.id
            )));
        }
        if !(self.start.is_finite() && self.stop.is_finite()) {
            return Err(QdaqError::Configuration(format!(
                "axis '{}' has a non-finite range {}..{}",
                self.id, self.start, self.stop
            )));
        }
        if !(self.delay.is_finite() && self.delay >= 0.0) {
            return Err(QdaqError::Configuration(format!(
                "axis '{}' has invalid delay {}",
                self.id, self.delay
            )));
        }
        if let Some(slope) = self.slope {
            if !(slope.is_finite() && slope > 0.0) {
                return Err(QdaqError::Configuration(format!(
                    "axis '{}' has invalid ramp slope {}",
                    self.id, slope
                )));
            }
        }
        Ok(())
    }

    /// Set `value` and wait until the output has settled.
    ///
    /// Waits `max(minimum, |value - current| / slope)` when a slope is bound,
    /// `minimum` otherwise. Returns the time waited.
    pub async fn set_and_settle(&self, value: f64, minimum: f64) -> QdaqResult<Duration> {
        let current = self.target.get().await?;
        self.target.set(value).await?;
        let slope = match &self.ramp {
            Some(ramp) => ramp.slope().await?,
            None => None,
        };
        let ramp_time = match slope {
            Some(s) if s > 0.0 => (value - current).abs() / s,
            _ => 0.0,
        };
        let seconds = minimum.max(ramp_time).max(0.0);
        let wait = Duration::try_from_secs_f64(seconds).map_err(|_| {
            QdaqError::Configuration(format!(
                "settle time for {} is not representable ({} s, slope {:?})",
                self.id, seconds, slope
            ))
        })?;
        if !wait.is_zero() {
            sleep(wait).await;
        }
        Ok(wait)
    }
}

// =============================================================================
// Teardown
// =============================================================================

async fn release(
    ramps: &[(String, Arc<dyn SupportsRampedSweep>)],
    detectors: &[Arc<dyn Detector>],
) -> QdaqResult<()> {
    let mut first_error = None;
    for (id, ramp) in ramps {
        match ramp.unassign_slope().await {
            Ok(()) => info!(instrument = %id, "Unassigned ramp slope"),
            Err(QdaqError::SlopeAlreadyUnassigned(_)) => {
                debug!(instrument = %id, "Ramp slope already unassigned")
            }
            Err(e) => {
                warn!(instrument = %id, error = %e, "Failed to unassign ramp slope");
                first_error.get_or_insert(e);
            }
        }
    }
    for detector in detectors {
        if let Err(e) = detector.disarm().await {
            warn!(detector = %detector.name(), error = %e, "Failed to disarm detector");
            first_error.get_or_insert(e);
        }
    }
    info!("Teardown complete");
    first_error.map_or(Ok(()), Err)
}

/// Returns swept instruments to a safe state exactly once.
struct TeardownGuard {
    ramps: Vec<(String, Arc<dyn SupportsRampedSweep>)>,
    detectors: Vec<Arc<dyn Detector>>,
    done: bool,
}

impl TeardownGuard {
    async fn run(mut self) -> QdaqResult<()> {
        let result = release(&self.ramps, &self.detectors).await;
        self.done = true;
        result
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let ramps = std::mem::take(&mut self.ramps);
        let detectors = std::mem::take(&mut self.detectors);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Sweep dropped before teardown, releasing in the background");
                handle.spawn(async move {
                    if let Err(e) = release(&ramps, &detectors).await {
                        error!(error = %e, "Background teardown failed");
                    }
                });
            }
            Err(_) => {
                error!(
                    ramps = ramps.len(),
                    "Sweep dropped outside a runtime, ramp slopes may remain assigned"
                );
            }
        }
    }
}

// =============================================================================
// Sweep Driver
// =============================================================================

/// Result of a completed sweep.
#[derive(Debug, Clone)]
pub struct SweepOutcome {
    /// Collected rows and metadata.
    pub dataset: Arc<Dataset>,
    /// Completed steps.
    pub steps: usize,
}

struct Plan<'p> {
    kind: &'static str,
    outer: &'p SweepAxis,
    inner: Option<&'p SweepAxis>,
    detectors: &'p [Arc<dyn Detector>],
}

impl Plan<'_> {
    /// Stepped axes, then detector fast axes.
    fn all_axes(&self) -> Vec<&SweepAxis> {
        let mut axes = vec![self.outer];
        axes.extend(self.inner);
        axes.extend(self.detectors.iter().filter_map(|d| d.inner_axis()));
        axes
    }
}

fn interrupted_after(error: QdaqError, completed_steps: usize) -> QdaqError {
    match error {
        QdaqError::Interrupted { .. } => QdaqError::Interrupted { completed_steps },
        other => other,
    }
}

/// Runs 1-D and 2-D sweeps against instruments of one registry.
pub struct SweepDriver<'r> {
    registry: &'r InstrumentRegistry,
    timing: SweepTiming,
    ramp_speeds: HashMap<String, f64>,
    cancel: CancelToken,
    last_dataset: Mutex<Option<Arc<Dataset>>>,
}

impl<'r> SweepDriver<'r> {
    /// Driver with default timing and no configured ramp speeds.
    pub fn new(registry: &'r InstrumentRegistry) -> Self {
        Self {
            registry,
            timing: SweepTiming::default(),
            ramp_speeds: HashMap::new(),
            cancel: CancelToken::new(),
            last_dataset: Mutex::new(None),
        }
    }

    /// Replace the timing margins.
    pub fn with_timing(mut self, timing: SweepTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Default slope for an instrument without an explicit axis slope.
    pub fn with_ramp_speed(mut self, id: impl Into<String>, slope: f64) -> Self {
        self.ramp_speeds.insert(id.into(), slope);
        self
    }

    /// Use `token` for cancellation.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Read `[sweep]` timing and `[ramp_speeds]` from a configuration store.
    pub fn with_config(mut self, store: &ConfigStore) -> QdaqResult<Self> {
        if store.section("sweep").is_some() {
            self.timing = SweepTiming::from_store(store)?;
        }
        if let Some(section) = store.section("ramp_speeds") {
            let ids: Vec<String> = section.keys().cloned().collect();
            for id in ids {
                let slope = store.get_f64("ramp_speeds", &id)?;
                self.ramp_speeds.insert(id, slope);
            }
        }
        Ok(self)
    }

    /// Token that interrupts this driver's sweeps.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Timing margins in use.
    pub fn timing(&self) -> SweepTiming {
        self.timing
    }

    /// Dataset of the most recent sweep, including partial ones.
    pub fn last_dataset(&self) -> Option<Arc<Dataset>> {
        self.last_dataset.lock().clone()
    }

    /// Step `axis` and acquire every detector at each point.
    pub async fn do1d(
        &self,
        axis: &SweepAxis,
        detectors: &[Arc<dyn Detector>],
    ) -> QdaqResult<SweepOutcome> {
        self.run(Plan {
            kind: "do1d",
            outer: axis,
            inner: None,
            detectors,
        })
        .await
    }

    /// Step `inner` for every point of `outer`.
    ///
    /// Detectors must be scalar: a detector with its own fast axis would make
    /// the output three-dimensional.
    pub async fn do2d(
        &self,
        outer: &SweepAxis,
        inner: &SweepAxis,
        detectors: &[Arc<dyn Detector>],
    ) -> QdaqResult<SweepOutcome> {
        if let Some(d) = detectors.iter().find(|d| d.fast_axis().is_some()) {
            return Err(QdaqError::Configuration(format!(
                "detector '{}' has a fast axis; 3-D output is not supported",
                d.name()
            )));
        }
        self.run(Plan {
            kind: "do2d",
            outer,
            inner: Some(inner),
            detectors,
        })
        .await
    }

    fn validate(&self, plan: &Plan<'_>) -> QdaqResult<Vec<String>> {
        if plan.detectors.is_empty() {
            return Err(QdaqError::Configuration(
                "a sweep needs at least one detector".to_string(),
            ));
        }
        let mut names: Vec<&str> = plan.detectors.iter().map(|d| d.name()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(QdaqError::Configuration(format!(
                "detector name '{}' is used twice",
                pair[0]
            )));
        }

        let mut ids = Vec::new();
        for axis in plan.all_axes() {
            axis.validate()?;
            self.registry.verify(axis.id(), axis.handle())?;
            if let Some(ramp) = axis.ramp() {
                self.registry.verify(axis.id(), HandleId::of(ramp))?;
            }
            ids.push(axis.id().to_string());
        }
        for detector in plan.detectors {
            for (id, handle) in detector.instruments() {
                self.registry.verify(&id, handle)?;
                ids.push(id);
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    fn metadata(&self, plan: &Plan<'_>, ids: &[String]) -> QdaqResult<SweepMetadata> {
        let mut metadata = SweepMetadata::new(plan.kind);
        metadata.axes.push(plan.outer.metadata());
        if let Some(inner) = plan.inner {
            metadata.axes.push(inner.metadata());
        }
        metadata.detectors = plan
            .detectors
            .iter()
            .map(|d| DetectorMetadata {
                name: d.name().to_string(),
                unit: d.unit().to_string(),
                fast_axis: d.fast_axis(),
            })
            .collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        metadata.snapshot = serde_json::to_value(self.registry.snapshot_parameters(&id_refs))
            .map_err(|e| QdaqError::Serialization(e.to_string()))?;
        Ok(metadata)
    }

    async fn run(&self, plan: Plan<'_>) -> QdaqResult<SweepOutcome> {
        let ids = self.validate(&plan)?;
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let session = self.registry.acquire_exclusive(&id_refs)?;

        let metadata = self.metadata(&plan, &ids)?;
        let span = info_span!("sweep", kind = plan.kind, run_id = %metadata.run_id);
        let (dataset, mut writer) = Dataset::create(metadata);
        *self.last_dataset.lock() = Some(Arc::clone(&dataset));

        async {
            let guard = TeardownGuard {
                ramps: plan
                    .all_axes()
                    .into_iter()
                    .filter_map(|a| a.ramp().map(|r| (a.id().to_string(), Arc::clone(r))))
                    .collect(),
                detectors: plan.detectors.to_vec(),
                done: false,
            };
            info!(
                instruments = ?ids,
                steps = dataset.metadata().total_steps(),
                "Sweep started"
            );

            let body = self.execute(&plan, &mut writer).await;
            let teardown = guard.run().await;
            writer.finish();
            drop(session);

            match (body, teardown) {
                (Ok(steps), Ok(())) => {
                    info!(steps, "Sweep complete");
                    Ok(SweepOutcome {
                        dataset: Arc::clone(&dataset),
                        steps,
                    })
                }
                (Ok(_), Err(e)) => {
                    error!(error = %e, "Sweep finished but teardown failed");
                    Err(e)
                }
                (Err(e), _) if e.is_interrupted() => {
                    warn!(rows = dataset.len(), "Sweep interrupted");
                    Err(e)
                }
                (Err(e), _) => {
                    error!(error = %e, rows = dataset.len(), "Sweep failed");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn prepare_ramps(&self, plan: &Plan<'_>) -> QdaqResult<()> {
        for axis in plan.all_axes() {
            let Some(ramp) = axis.ramp() else {
                continue;
            };
            let slope = axis
                .slope
                .or_else(|| self.ramp_speeds.get(axis.id()).copied());
            if let Some(slope) = slope {
                ramp.assign_slope(slope).await?;
                info!(instrument = %axis.id(), slope, "Assigned ramp slope");
            }
            let waited = axis.set_and_settle(axis.start, 0.0).await?;
            debug!(instrument = %axis.id(), waited = ?waited, "Moved to start");
        }
        Ok(())
    }

    async fn step(
        &self,
        plan: &Plan<'_>,
        index: usize,
        setpoints: Vec<f64>,
        axis: &SweepAxis,
        minimum: f64,
    ) -> QdaqResult<DatasetRow> {
        for detector in plan.detectors {
            detector.arm().await?;
        }
        let value = setpoints.last().copied().unwrap_or(axis.start);
        let settled = axis.set_and_settle(value, minimum).await?;

        let mut results = BTreeMap::new();
        for detector in plan.detectors {
            let acquisition = detector.acquire(&self.cancel).await?;
            results.insert(
                detector.name().to_string(),
                SweepStepResult {
                    setpoint: value,
                    average: acquisition.average,
                    raw_buffer: acquisition.raw,
                },
            );
        }
        debug!(index, setpoint = value, settled = ?settled, "Step complete");
        Ok(DatasetRow {
            index,
            setpoints,
            results,
        })
    }

    async fn execute(&self, plan: &Plan<'_>, writer: &mut DatasetWriter) -> QdaqResult<usize> {
        self.prepare_ramps(plan).await?;

        let outer = plan.outer;
        let Some(inner) = plan.inner else {
            for (index, value) in outer.setpoints().into_iter().enumerate() {
                if self.cancel.is_cancelled() {
                    return Err(QdaqError::Interrupted {
                        completed_steps: index,
                    });
                }
                let row = self
                    .step(plan, index, vec![value], outer, outer.delay)
                    .await
                    .map_err(|e| interrupted_after(e, index))?;
                writer.finalize_row(row);
            }
            return Ok(outer.npts);
        };

        // inner ramps back to its start before every new line
        let dead_time = match inner.ramp() {
            Some(ramp) => match ramp.slope().await? {
                Some(slope) if slope > 0.0 => {
                    (inner.stop - inner.start).abs() / slope + self.timing.inter_loop_margin
                }
                _ => 0.0,
            },
            None => 0.0,
        };
        let inner_points = inner.setpoints();
        let mut completed = 0;
        for outer_value in outer.setpoints() {
            if self.cancel.is_cancelled() {
                return Err(QdaqError::Interrupted {
                    completed_steps: completed,
                });
            }
            outer
                .set_and_settle(outer_value, outer.delay.max(dead_time))
                .await?;
            for &inner_value in &inner_points {
                if self.cancel.is_cancelled() {
                    return Err(QdaqError::Interrupted {
                        completed_steps: completed,
                    });
                }
                let row = self
                    .step(
                        plan,
                        completed,
                        vec![outer_value, inner_value],
                        inner,
                        inner.delay,
                    )
                    .await
                    .map_err(|e| interrupted_after(e, completed))?;
                writer.finalize_row(row);
                completed += 1;
            }
        }
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{Acquisition, ScalarDetector};
    use async_trait::async_trait;
    use qdaq_core::capabilities::Readable;
    use qdaq_core::driver::InstrumentComponents;
    use qdaq_driver_mock::{MockCounter, MockSourceChannel, MockVoltageSource};
    use tracing_test::traced_test;

    fn setup() -> (InstrumentRegistry, Arc<MockSourceChannel>, Arc<MockCounter>) {
        let source = MockVoltageSource::new(2);
        let channel = source.channel(1).unwrap();
        let counter = Arc::new(MockCounter::new());
        let mut registry = InstrumentRegistry::new();
        registry
            .register("dac_ch1", "gate", channel.components())
            .unwrap();
        registry
            .register(
                "counter",
                "counter",
                InstrumentComponents::new().with_readable(counter.clone()),
            )
            .unwrap();
        (registry, channel, counter)
    }

    #[test]
    fn test_linspace_endpoints() {
        assert_eq!(linspace(0.0, 1.0, 11).len(), 11);
        assert_eq!(linspace(0.0, 1.0, 11)[10], 1.0);
        assert_eq!(linspace(-0.3, 0.7, 3)[2], 0.7);
        assert_eq!(linspace(2.0, 5.0, 1), vec![2.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }

    struct Failing;

    #[async_trait]
    impl Readable for Failing {
        async fn read(&self) -> QdaqResult<f64> {
            Err(QdaqError::Instrument("probe disconnected".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_teardown_runs_once_on_failure() {
        let (mut registry, channel, _) = setup();
        let failing: Arc<dyn Readable> = Arc::new(Failing);
        registry
            .register(
                "probe",
                "probe",
                InstrumentComponents::new().with_readable(failing.clone()),
            )
            .unwrap();
        let driver = SweepDriver::new(&registry);
        let axis = SweepAxis::from_registry(&registry, "dac_ch1", 0.0, 1.0, 5)
            .unwrap()
            .with_slope(2.0);
        let detector: Arc<dyn Detector> = Arc::new(ScalarDetector::new("probe", "probe", failing));

        let err = driver.do1d(&axis, &[detector]).await.unwrap_err();
        assert!(matches!(err, QdaqError::Instrument(_)));
        assert_eq!(channel.current_slope(), None);
        assert_eq!(channel.unassign_count(), 1);
        assert!(logs_contain("Unassigned ramp slope"));
        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|l| l.contains("Teardown complete")).count() {
                1 => Ok(()),
                n => Err(format!("expected one teardown, saw {}", n)),
            }
        });
    }

    /// Gate whose driver reports a vanishing slope.
    struct Sluggish {
        value: Mutex<f64>,
    }

    #[async_trait]
    impl Sweepable for Sluggish {
        fn label(&self) -> &str {
            "sluggish"
        }

        async fn set(&self, value: f64) -> QdaqResult<()> {
            *self.value.lock() = value;
            Ok(())
        }

        async fn get(&self) -> QdaqResult<f64> {
            Ok(*self.value.lock())
        }
    }

    #[async_trait]
    impl SupportsRampedSweep for Sluggish {
        async fn assign_slope(&self, _slope: f64) -> QdaqResult<()> {
            Ok(())
        }

        async fn unassign_slope(&self) -> QdaqResult<()> {
            Ok(())
        }

        async fn slope(&self) -> QdaqResult<Option<f64>> {
            Ok(Some(f64::from_bits(1)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_settle_time_is_configuration() {
        let gate = Arc::new(Sluggish {
            value: Mutex::new(0.0),
        });
        let axis = SweepAxis::new("gate", gate.clone(), 0.0, 1.0, 2).with_ramp(gate.clone());

        let err = axis.set_and_settle(1.0, 0.0).await.unwrap_err();
        assert!(matches!(err, QdaqError::Configuration(msg) if msg.contains("gate")));

        // no ramp to wait for
        let wait = axis.set_and_settle(1.0, 0.1).await.unwrap();
        assert_eq!(wait, Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_unassigned_slope_is_swallowed() {
        let (registry, channel, counter) = setup();
        let driver = SweepDriver::new(&registry);
        // ramp-capable axis without any slope: teardown finds nothing to unassign
        let axis = SweepAxis::from_registry(&registry, "dac_ch1", 0.0, 0.5, 3).unwrap();
        let detector: Arc<dyn Detector> =
            Arc::new(ScalarDetector::new("counts", "counter", counter));

        let outcome = driver.do1d(&axis, &[detector]).await.unwrap();
        assert_eq!(outcome.steps, 3);
        assert_eq!(channel.unassign_count(), 0);
        assert!(logs_contain("Ramp slope already unassigned"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_ramp_speed_used() {
        let (registry, channel, counter) = setup();
        let store = ConfigStore::from_toml_str("[ramp_speeds]\ndac_ch1 = 0.25\n").unwrap();
        let driver = SweepDriver::new(&registry).with_config(&store).unwrap();
        let axis = SweepAxis::from_registry(&registry, "dac_ch1", 0.0, 0.5, 2).unwrap();
        let detector: Arc<dyn Detector> =
            Arc::new(ScalarDetector::new("counts", "counter", counter));

        let started = tokio::time::Instant::now();
        driver.do1d(&axis, &[detector]).await.unwrap();
        // 0.5 V at 0.25 V/s
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(channel.unassign_count(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_axis_is_referential() {
        let (registry, _, counter) = setup();
        let stray = MockVoltageSource::new(1).channel(1).unwrap();
        let axis = SweepAxis::new("dac_ch1", stray, 0.0, 1.0, 3);
        let detector: Arc<dyn Detector> =
            Arc::new(ScalarDetector::new("counts", "counter", counter.clone()));

        let driver = SweepDriver::new(&registry);
        assert!(matches!(
            driver.do1d(&axis, &[detector]).await,
            Err(QdaqError::Referential(_))
        ));
        assert_eq!(counter.count(), 0);
    }

    struct FastAxisDetector;

    #[async_trait]
    impl Detector for FastAxisDetector {
        fn name(&self) -> &str {
            "trace"
        }

        fn fast_axis(&self) -> Option<AxisMetadata> {
            Some(AxisMetadata {
                instrument: "virtual".to_string(),
                label: "fast".to_string(),
                unit: "V".to_string(),
                setpoints: vec![0.0, 1.0],
                delay: 0.0,
            })
        }

        fn instruments(&self) -> Vec<(String, HandleId)> {
            Vec::new()
        }

        async fn acquire(&self, _cancel: &CancelToken) -> QdaqResult<Acquisition> {
            Ok(Acquisition::trace(vec![0.0, 0.0]))
        }
    }

    #[tokio::test]
    async fn test_2d_rejects_fast_axis_detectors() {
        let mut registry = InstrumentRegistry::new();
        let source = MockVoltageSource::new(2);
        for i in 1..=2 {
            let ch = source.channel(i).unwrap();
            registry
                .register(format!("dac_ch{}", i), "gate", ch.components())
                .unwrap();
        }
        let outer = SweepAxis::from_registry(&registry, "dac_ch1", 0.0, 1.0, 2).unwrap();
        let inner = SweepAxis::from_registry(&registry, "dac_ch2", 0.0, 1.0, 2).unwrap();
        let detector: Arc<dyn Detector> = Arc::new(FastAxisDetector);

        let err = SweepDriver::new(&registry)
            .do2d(&outer, &inner, &[detector])
            .await
            .unwrap_err();
        match err {
            QdaqError::Configuration(msg) => assert!(msg.contains("3-D")),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
