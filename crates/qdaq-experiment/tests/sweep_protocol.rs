//! Synchronized sweep protocol against mock instruments.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use qdaq_core::capabilities::Readable;
use qdaq_core::driver::InstrumentComponents;
use qdaq_core::limits::conductance_quanta;
use qdaq_core::{CancelToken, QdaqError, QdaqResult};
use qdaq_driver_mock::{MockCounter, MockLockin, MockSourceChannel, MockVoltageSource};
use qdaq_experiment::{
    fast_conductance_2d, linspace, BufferedDetector, ConductanceSettings, Detector,
    ScalarDetector, SweepAxis, SweepDriver,
};
use qdaq_hardware::InstrumentRegistry;
use serde_json::json;
use tokio::time::Instant;

struct Bench {
    registry: InstrumentRegistry,
    gates: Vec<Arc<MockSourceChannel>>,
    lockin: Arc<MockLockin>,
    counter: Arc<MockCounter>,
}

fn bench() -> Bench {
    let source = MockVoltageSource::new(2);
    let lockin = Arc::new(MockLockin::new());
    let counter = Arc::new(MockCounter::new());
    let mut registry = InstrumentRegistry::new();
    let mut gates = Vec::new();
    for ch in source.channels() {
        registry
            .register(format!("dac_ch{}", ch.index()), "gate", ch.components())
            .unwrap();
        gates.push(ch.clone());
    }
    registry
        .register("lockin", "lock-in", lockin.components())
        .unwrap();
    registry
        .register(
            "counter",
            "counter",
            InstrumentComponents::new().with_readable(counter.clone()),
        )
        .unwrap();
    Bench {
        registry,
        gates,
        lockin,
        counter,
    }
}

#[tokio::test(start_paused = true)]
async fn eleven_point_sweep_resets_buffer_every_step() {
    let b = bench();
    let axis = SweepAxis::from_registry(&b.registry, "dac_ch1", 0.0, 1.0, 11)
        .unwrap()
        .with_slope(0.5)
        .with_delay(0.1);
    let detector: Arc<dyn Detector> = Arc::new(
        BufferedDetector::from_registry(&b.registry, "lockin")
            .unwrap()
            .with_triggers(4),
    );

    let started = Instant::now();
    let outcome = SweepDriver::new(&b.registry)
        .do1d(&axis, &[detector])
        .await
        .unwrap();

    assert_eq!(outcome.steps, 11);
    assert_eq!(outcome.dataset.len(), 11);
    assert!(outcome.dataset.progress().finished);
    assert_eq!(outcome.dataset.setpoints(), linspace(0.0, 1.0, 11));
    assert_eq!(b.lockin.reset_count(), 11);

    let means: Vec<f64> = outcome
        .dataset
        .readings("lockin")
        .iter()
        .map(|r| r.as_scalar().unwrap())
        .collect();
    assert_eq!(means.len(), 11);
    assert!(means.windows(2).all(|w| w[0] < w[1]), "{:?}", means);

    // ten 0.1 V steps at 0.5 V/s outlast the 0.1 s delay
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(b.gates[0].current_slope(), None);
    assert_eq!(b.gates[0].unassign_count(), 1);
    assert!(!b.lockin.is_buffering());
}

/// Readable that requests cancellation on its n-th read.
struct CancellingProbe {
    token: CancelToken,
    reads: AtomicUsize,
    cancel_on: usize,
}

#[async_trait]
impl Readable for CancellingProbe {
    async fn read(&self) -> QdaqResult<f64> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.cancel_on {
            self.token.cancel();
        }
        Ok(n as f64)
    }
}

#[tokio::test(start_paused = true)]
async fn cancellation_at_step_five_tears_down_once() {
    let mut b = bench();
    let token = CancelToken::new();
    let probe: Arc<dyn Readable> = Arc::new(CancellingProbe {
        token: token.clone(),
        reads: AtomicUsize::new(0),
        cancel_on: 5,
    });
    b.registry
        .register(
            "probe",
            "probe",
            InstrumentComponents::new().with_readable(probe.clone()),
        )
        .unwrap();

    let axis = SweepAxis::from_registry(&b.registry, "dac_ch1", 0.0, 1.0, 11)
        .unwrap()
        .with_slope(1.0);
    let detector: Arc<dyn Detector> = Arc::new(ScalarDetector::new("probe", "probe", probe));
    let driver = SweepDriver::new(&b.registry).with_cancel(token);

    let err = driver.do1d(&axis, &[detector]).await.unwrap_err();
    assert!(matches!(err, QdaqError::Interrupted { completed_steps: 5 }));

    let dataset = driver.last_dataset().unwrap();
    assert_eq!(dataset.len(), 5);
    assert!(dataset.progress().finished);
    assert_eq!(b.gates[0].unassign_count(), 1);
    assert_eq!(b.gates[0].current_slope(), None);

    // instruments are free again
    assert!(b.registry.acquire_exclusive(&["dac_ch1", "probe"]).is_ok());
}

#[tokio::test(start_paused = true)]
async fn dropped_sweep_releases_ramp_in_background() {
    let b = bench();
    let axis = SweepAxis::from_registry(&b.registry, "dac_ch1", 0.0, 1.0, 11)
        .unwrap()
        .with_slope(0.1);
    let detector: Arc<dyn Detector> =
        Arc::new(ScalarDetector::from_registry(&b.registry, "counter").unwrap());
    let driver = SweepDriver::new(&b.registry);

    // every 0.1 V step settles for 1 s, so the sweep is mid-settle at 3 s
    let result = tokio::time::timeout(Duration::from_secs(3), driver.do1d(&axis, &[detector])).await;
    assert!(result.is_err());

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(b.gates[0].current_slope(), None);
    assert_eq!(b.gates[0].unassign_count(), 1);
    assert!(b.registry.acquire_exclusive(&["dac_ch1", "counter"]).is_ok());
}

#[tokio::test]
async fn busy_instrument_fails_before_any_hardware_call() {
    let b = bench();
    let axis = SweepAxis::from_registry(&b.registry, "dac_ch1", 0.0, 1.0, 3).unwrap();
    let detector: Arc<dyn Detector> =
        Arc::new(BufferedDetector::from_registry(&b.registry, "lockin").unwrap());
    let driver = SweepDriver::new(&b.registry);

    let held = b.registry.acquire_exclusive(&["lockin"]).unwrap();
    let err = driver
        .do1d(&axis, std::slice::from_ref(&detector))
        .await
        .unwrap_err();
    assert!(matches!(err, QdaqError::ResourceBusy(_)));
    assert_eq!(b.lockin.reset_count(), 0);
    assert_eq!(b.gates[0].set_count(), 0);

    drop(held);
    let outcome = driver.do1d(&axis, &[detector]).await.unwrap();
    assert_eq!(outcome.steps, 3);
}

#[tokio::test]
async fn unregistered_detector_is_referential() {
    let b = bench();
    let axis = SweepAxis::from_registry(&b.registry, "dac_ch1", 0.0, 1.0, 3).unwrap();
    let detector: Arc<dyn Detector> =
        Arc::new(ScalarDetector::new("ghost", "ghost", b.counter.clone()));

    let err = SweepDriver::new(&b.registry)
        .do1d(&axis, &[detector])
        .await
        .unwrap_err();
    assert!(matches!(err, QdaqError::Referential(_)));
    assert!(err.is_fatal_before_hardware());
    assert_eq!(b.gates[0].set_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn two_d_sweep_waits_for_inner_return_ramp() {
    let b = bench();
    let outer = SweepAxis::from_registry(&b.registry, "dac_ch1", 0.0, 0.2, 3).unwrap();
    let inner = SweepAxis::from_registry(&b.registry, "dac_ch2", 0.0, 1.0, 5)
        .unwrap()
        .with_slope(1.0);
    let detector: Arc<dyn Detector> =
        Arc::new(ScalarDetector::from_registry(&b.registry, "counter").unwrap());

    let started = Instant::now();
    let outcome = SweepDriver::new(&b.registry)
        .do2d(&outer, &inner, &[detector])
        .await
        .unwrap();

    assert_eq!(outcome.steps, 15);
    let rows = outcome.dataset.finalized_rows();
    assert_eq!(rows[0].setpoints, vec![0.0, 0.0]);
    assert_eq!(rows[6].setpoints, vec![0.1, 0.25]);
    assert_eq!(rows[14].setpoints, vec![0.2, 1.0]);
    assert_eq!(b.counter.count(), 15);

    // three outer settles of 1 V / (1 V/s) + 50 ms
    assert!(started.elapsed() >= Duration::from_millis(3150));
    assert_eq!(b.gates[1].unassign_count(), 1);
    assert_eq!(b.gates[0].unassign_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn fast_conductance_converts_buffer_to_quanta() {
    let b = bench();
    let outer = SweepAxis::from_registry(&b.registry, "dac_ch1", 0.0, 0.1, 3).unwrap();
    let inner = SweepAxis::from_registry(&b.registry, "dac_ch2", -0.5, 0.5, 4)
        .unwrap()
        .with_slope(10.0);
    let settings = ConductanceSettings::new(1e8, 10e-6);

    let outcome = fast_conductance_2d(
        &b.registry,
        &outer,
        inner,
        "lockin",
        settings,
        CancelToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.steps, 3);
    let detector = &outcome.dataset.metadata().detectors[0];
    assert_eq!(detector.fast_axis.as_ref().unwrap().setpoints.len(), 4);

    let readings = outcome.dataset.readings("lockin");
    let expected: Vec<f64> = (1..=4)
        .map(|n| conductance_quanta(n as f64, 1e8, 10e-6))
        .collect();
    assert_eq!(readings[0].as_trace().unwrap(), expected.as_slice());
    assert_eq!(b.lockin.trigger_count(), 12);
    assert_eq!(b.gates[1].unassign_count(), 1);
}

#[tokio::test]
async fn fast_conductance_requires_x_display() {
    let b = bench();
    b.registry
        .set_parameter("lockin", "display", json!("R"))
        .unwrap();
    let outer = SweepAxis::from_registry(&b.registry, "dac_ch1", 0.0, 0.1, 3).unwrap();
    let inner = SweepAxis::from_registry(&b.registry, "dac_ch2", -0.5, 0.5, 4).unwrap();

    let err = fast_conductance_2d(
        &b.registry,
        &outer,
        inner,
        "lockin",
        ConductanceSettings::new(1e8, 10e-6),
        CancelToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, QdaqError::Configuration(_)));
    assert_eq!(b.lockin.reset_count(), 0);
}
