//! Criterion benchmarks for sequence rendering and upload encoding.
//!
//! Every pulse-width step of a pulsed experiment re-renders and re-encodes the
//! whole train, so these paths bound how fast the slow axis can step.
//!
//! Run with: cargo bench --bench sequence_render

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use qdaq_core::limits::PULSED_SAMPLE_RATE;
use qdaq_sequence::builders::{pulse_train_sequence, PulseShape, HIGH_SEGMENT, PULSE_CHANNEL};
use qdaq_sequence::{AwgFileCodec, Sequence, WaveformEncoder};

fn shape() -> PulseShape {
    PulseShape {
        high_time: 1e-6,
        meas_time: 36e-6,
        cycle_time: 200e-6,
        pulse_high: 0.15,
        trigger_delay: 1e-6,
        compensation_ratio: 0.0,
    }
}

fn train(pulses: u32) -> Sequence {
    pulse_train_sequence(&shape(), PULSED_SAMPLE_RATE, 150e-3, pulses).unwrap()
}

/// Rendering the sequence into per-channel sample arrays.
fn render_for_upload(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequence_output_for_upload");
    for pulses in [10_u32, 100, 1000] {
        let seq = train(pulses);
        let samples = seq.total_samples().unwrap();
        group.throughput(Throughput::Elements(samples as u64));
        group.bench_with_input(BenchmarkId::from_parameter(pulses), &seq, |b, seq| {
            b.iter(|| black_box(seq.output_for_upload().unwrap()));
        });
    }
    group.finish();
}

/// Encoding a rendered package into the generator file format.
fn encode_package(c: &mut Criterion) {
    let package = train(100).output_for_upload().unwrap();
    let codec = AwgFileCodec;
    c.bench_function("awg_file_encode", |b| {
        b.iter(|| black_box(codec.encode(black_box(&package)).unwrap()));
    });
}

/// Changing one pulse width and re-rendering, as a pulse-width sweep step does.
fn pulse_width_step(c: &mut Criterion) {
    let base = train(100);
    c.bench_function("pulse_width_rerender", |b| {
        let mut width = 1e-6;
        b.iter(|| {
            let mut seq = base.clone();
            width = if width > 5e-6 { 1e-6 } else { width + 1e-7 };
            seq.change_duration(3, PULSE_CHANNEL, HIGH_SEGMENT, width).unwrap();
            black_box(seq.output_for_upload().unwrap())
        });
    });
}

criterion_group!(benches, render_for_upload, encode_package, pulse_width_step);
criterion_main!(benches);
