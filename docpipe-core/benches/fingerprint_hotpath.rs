use criterion::{criterion_group, criterion_main, Criterion};
use docpipe_core::{Fingerprint, ProcessingParams};
use std::hint::black_box;

fn bench_params() -> ProcessingParams {
    ProcessingParams::new("summarizer-large")
        .with_max_input_chars(200_000)
        .with_temperature(0.2)
        .with_output_format("markdown")
        .with_extra("language", "en")
        .with_extra("tone", "neutral")
}

fn bench_fingerprint(c: &mut Criterion) {
    let params = bench_params();
    let small = include_str!("../src/fingerprint.rs").as_bytes();
    let large: Vec<u8> = small.iter().copied().cycle().take(4 * 1024 * 1024).collect();

    c.bench_function("fingerprint/compute_source_file", |b| {
        b.iter(|| {
            let fp = Fingerprint::compute(black_box(small), black_box(&params));
            black_box(fp);
        });
    });

    c.bench_function("fingerprint/compute_4mib", |b| {
        b.iter(|| {
            let fp = Fingerprint::compute(black_box(&large), black_box(&params));
            black_box(fp);
        });
    });

    let rendered = Fingerprint::compute(small, &params).to_string();
    c.bench_function("fingerprint/parse", |b| {
        b.iter(|| {
            let fp = Fingerprint::parse(black_box(&rendered)).expect("valid fingerprint");
            black_box(fp);
        });
    });
}

criterion_group!(benches, bench_fingerprint);
criterion_main!(benches);
