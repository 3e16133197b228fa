//! Throughput benchmarks

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use printer_hil::core::printer::{render_text, PrintMode};
use printer_hil::core::printout::{CompareMode, Comparator, Tolerance};
use printer_hil::core::scenario::SAMPLE_TEXT;
use printer_hil::core::transport::uart;
use printer_hil::{BaudRate, FrameFormat, LineConfig};
use std::hint::black_box;

fn uart_benchmark(c: &mut Criterion) {
    let data: Vec<u8> = SAMPLE_TEXT.bytes().cycle().take(1024).collect();
    let host = LineConfig::DEFAULT;
    let device = LineConfig::with_frame(BaudRate::B19200, FrameFormat::EIGHT_EVEN);

    let mut group = c.benchmark_group("uart");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("transmit_matched", |b| {
        b.iter(|| black_box(uart::transmit(black_box(&data), &host, &host)))
    });

    group.bench_function("transmit_mismatched", |b| {
        b.iter(|| black_box(uart::transmit(black_box(&data), &host, &device)))
    });

    group.finish();
}

fn compare_benchmark(c: &mut Criterion) {
    let mode = PrintMode {
        font: 2,
        ..PrintMode::default()
    };
    let text = format!("{SAMPLE_TEXT}\n{SAMPLE_TEXT}\n");
    let sample = render_text("sample", mode, text.as_bytes());
    let printout = render_text("printout", mode, text.as_bytes());
    let comparator = Comparator::new(Tolerance::default());

    let mut group = c.benchmark_group("printout");

    group.bench_function("render", |b| {
        b.iter(|| black_box(render_text("bench", mode, black_box(text.as_bytes()))))
    });

    group.bench_function("compare_exact", |b| {
        b.iter(|| black_box(comparator.compare(black_box(&printout), &sample, CompareMode::Exact)))
    });

    group.bench_function("compare_tolerant", |b| {
        b.iter(|| black_box(comparator.compare(black_box(&printout), &sample, CompareMode::Tolerant)))
    });

    group.finish();
}

criterion_group!(benches, uart_benchmark, compare_benchmark);
criterion_main!(benches);
