//! Pulsed and fast charge procedures on a simulated bench.

use std::sync::Arc;

use qdaq_core::driver::InstrumentComponents;
use qdaq_core::{CancelToken, QdaqError};
use qdaq_driver_mock::{
    ChannelWaveformSetup, MockAwg, MockFunctionGenerator, MockScope, MockVoltageSource,
};
use qdaq_experiment::pulsed::{FastAxisKind, SlowAxisKind};
use qdaq_experiment::{
    fast_charge_diagram, run_pulsed_experiment, FastChargeSettings, PulsedExperimentSettings,
    PulsedInstruments, SampleRateLadder, SweepAxis,
};
use qdaq_hardware::InstrumentRegistry;

struct Bench {
    registry: InstrumentRegistry,
    awg: Arc<MockAwg>,
    scope: Arc<MockScope>,
    fgen: Arc<MockFunctionGenerator>,
}

fn bench() -> Bench {
    let source = MockVoltageSource::new(1);
    let awg = Arc::new(MockAwg::new());
    let scope = Arc::new(MockScope::new());
    let fgen = Arc::new(MockFunctionGenerator::new());

    let mut registry = InstrumentRegistry::new();
    for ch in source.channels() {
        registry
            .register(format!("dac_ch{}", ch.index()), "gate", ch.components())
            .unwrap();
    }
    registry.register("awg", "awg", awg.components()).unwrap();
    registry
        .register(
            "scope",
            "scope",
            InstrumentComponents::new()
                .with_digitizer(scope.clone())
                .with_parameterized(scope.clone()),
        )
        .unwrap();
    registry
        .register(
            "fgen",
            "function generator",
            InstrumentComponents::new()
                .with_function_generator(fgen.clone())
                .with_parameterized(fgen.clone()),
        )
        .unwrap();
    Bench {
        registry,
        awg,
        scope,
        fgen,
    }
}

fn pulsed_settings() -> PulsedExperimentSettings {
    PulsedExperimentSettings::builder()
        .fast_axis(FastAxisKind::Ramp)
        .slow_axis(SlowAxisKind::PulseWidth)
        .slow_start(1e-6)
        .slow_stop(3e-6)
        .slow_npts(3)
        .fast_start(-0.1)
        .fast_stop(0.1)
        .fast_npts(5)
        .n_avgs(2)
        .pts_per_shot(4096)
        .high_time(1e-6)
        .meas_time(36e-6)
        .cycle_time(200e-6)
        .transfer_time(150e-3)
        .pulse_high(0.15)
        .trigger_delay(1e-6)
        .awg_channel(1)
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn pulsed_experiment_uploads_once_per_pulse_width() {
    let b = bench();
    let settings = pulsed_settings();

    let outcome = run_pulsed_experiment(
        &b.registry,
        &settings,
        &PulsedInstruments::default(),
        &SampleRateLadder::uhfli(),
        CancelToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.steps, 3);
    assert_eq!(b.awg.upload_count(), 3);
    // two averaged trains per width
    assert_eq!(b.awg.run_count(), 6);
    assert_eq!(b.scope.acquire_count(), 6);
    assert!(!b.awg.is_running());
    assert!(!b.scope.is_enabled());

    let expected_tc = 0.1 * 4096.0 / (1.8e9 / 16.0);
    assert!((b.scope.demod_time_constant() - expected_tc).abs() < 1e-9);
    assert_eq!(b.scope.settings().unwrap().segments, 5);

    match b.fgen.setup(1) {
        Some(ChannelWaveformSetup::Burst(burst)) => {
            assert_eq!(burst.cycles, 1);
            assert_eq!(burst.trigger_source, "EXT");
        }
        other => panic!("expected a burst setup, got {other:?}"),
    }
    assert!(b.fgen.is_output_on(1));

    let traces = outcome.dataset.readings("ramp_response");
    assert_eq!(traces.len(), 3);
    for trace in &traces {
        let trace = trace.as_trace().unwrap();
        assert_eq!(trace.len(), 5);
        assert!(trace.iter().all(|v| v.is_finite()));
    }
    let fast = outcome.dataset.metadata().detectors[0]
        .fast_axis
        .clone()
        .unwrap();
    assert_eq!(fast.setpoints.first(), Some(&-0.1));
    assert_eq!(fast.setpoints.last(), Some(&0.1));

    let axis = &outcome.dataset.metadata().axes[0];
    assert_eq!(axis.instrument, "awg");
    assert_eq!(axis.unit, "s");
}

#[tokio::test]
async fn pulsed_experiment_rejects_foreign_instrument_ids() {
    let b = bench();
    let instruments = PulsedInstruments {
        awg: "missing".to_string(),
        ..PulsedInstruments::default()
    };
    let err = run_pulsed_experiment(
        &b.registry,
        &pulsed_settings(),
        &instruments,
        &SampleRateLadder::uhfli(),
        CancelToken::new(),
    )
    .await
    .unwrap_err();
    assert!(err.is_fatal_before_hardware(), "{err}");
    assert_eq!(b.awg.upload_count(), 0);
    assert!(b.fgen.setup(1).is_none());
}

#[tokio::test(start_paused = true)]
async fn fast_charge_diagram_records_one_trace_per_slow_point() {
    let b = bench();
    let slow = SweepAxis::from_registry(&b.registry, "dac_ch1", 0.0, 0.3, 4).unwrap();
    let settings = FastChargeSettings::new(-0.1, 0.1, 8).with_compensation(2, -0.5, 0.0);

    let outcome = fast_charge_diagram(
        &b.registry,
        &slow,
        "fgen",
        "scope",
        &settings,
        &SampleRateLadder::uhfli(),
        CancelToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.steps, 4);
    let traces = outcome.dataset.readings("scope");
    assert_eq!(traces.len(), 4);
    assert!(traces
        .iter()
        .all(|t| t.as_trace().map(<[f64]>::len) == Some(4096)));

    assert_eq!(b.scope.configure_count(), 1);
    assert_eq!(b.fgen.sync_count(), 2);
    assert!(!b.fgen.is_output_on(1));
    assert!(!b.fgen.is_output_on(2));

    match (b.fgen.setup(1), b.fgen.setup(2)) {
        (Some(ChannelWaveformSetup::Ramp(main)), Some(ChannelWaveformSetup::Ramp(comp))) => {
            assert!((main.amplitude - 0.2).abs() < 1e-12);
            assert!(!main.inverted);
            assert!((comp.amplitude - 0.1).abs() < 1e-12);
            assert!(comp.inverted);
            assert!(main.symmetry < 100.0);
        }
        other => panic!("expected ramp setups, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn fast_charge_outputs_off_after_cancellation() {
    let b = bench();
    let slow = SweepAxis::from_registry(&b.registry, "dac_ch1", 0.0, 0.3, 4).unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = fast_charge_diagram(
        &b.registry,
        &slow,
        "fgen",
        "scope",
        &FastChargeSettings::new(-0.1, 0.1, 8),
        &SampleRateLadder::uhfli(),
        cancel,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, QdaqError::Interrupted { completed_steps: 0 }));
    assert!(!b.fgen.is_output_on(1));
    assert_eq!(b.scope.acquire_count(), 0);
}
