//! STFT benchmarks

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use loco_dsp::{Stft, TransformConfig};

fn signal(len: usize) -> Vec<f32> {
    (0..len).map(|i| (i as f32 * 0.013).sin() * 0.5).collect()
}

fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("stft_forward");
    for &n_fft in &[512usize, 2048] {
        let stft = Stft::new(TransformConfig::new(n_fft, n_fft / 4)).unwrap();
        let input = signal(44100);
        group.bench_with_input(BenchmarkId::from_parameter(n_fft), &n_fft, |b, _| {
            b.iter(|| stft.forward(black_box(&input)).unwrap())
        });
    }
    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let stft = Stft::new(TransformConfig::default()).unwrap();
    let input = signal(44100);

    c.bench_function("stft_round_trip_1s", |b| {
        b.iter(|| {
            let spec = stft.forward(black_box(&input)).unwrap();
            stft.inverse(&spec, input.len()).unwrap()
        })
    });
}

criterion_group!(benches, bench_forward, bench_round_trip);
criterion_main!(benches);
