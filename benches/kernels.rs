//! Benchmark suite for the compute kernels
//!
//! Measures matrix products, the fused attention softmax, block
//! dequantization and token sampling at decode-like shapes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use inferir::generate::{Sampler, SamplingConfig};
use inferir::kernels::{
    fused_scale_mask_softmax, matmul_transpose_b_into_with, MatView, MatViewMut,
    DEFAULT_PARALLEL_THRESHOLD,
};
use inferir::quantize::{dequantize, quantize, QuantKind};

fn ramp(n: usize, seed: u32) -> Vec<f32> {
    (0..n)
        .map(|i| ((i as u32).wrapping_mul(2_654_435_761).wrapping_add(seed) % 2000) as f32 / 1000.0 - 1.0)
        .collect()
}

fn benchmark_matmul_transpose_b(c: &mut Criterion) {
    let mut group = c.benchmark_group("matmul_transpose_b");

    // One decode row against a projection, then a short prefill
    for (m, k, n) in [(1, 512, 512), (1, 512, 2048), (16, 512, 512)] {
        let a = ramp(m * k, 1);
        let b = ramp(n * k, 2);
        let mut out = vec![0.0; m * n];
        group.throughput(Throughput::Elements((m * k * n) as u64));
        for (label, threshold) in [("serial", usize::MAX), ("parallel", DEFAULT_PARALLEL_THRESHOLD)] {
            group.bench_with_input(BenchmarkId::new(label, format!("{m}x{k}x{n}")), &threshold, |bench, &t| {
                bench.iter(|| {
                    let av = MatView::new(&a, m, k).unwrap();
                    let bv = MatView::new(&b, n, k).unwrap();
                    let mut cv = MatViewMut::new(&mut out, m, n).unwrap();
                    matmul_transpose_b_into_with(black_box(av), black_box(bv), &mut cv, t).unwrap();
                });
            });
        }
    }

    group.finish();
}

fn benchmark_attention_softmax(c: &mut Criterion) {
    let mut group = c.benchmark_group("fused_scale_mask_softmax");

    for seq_len in [64usize, 256, 1024] {
        let scores = ramp(seq_len, 3);
        let mut work = scores.clone();
        group.bench_with_input(BenchmarkId::from_parameter(seq_len), &seq_len, |b, &len| {
            b.iter(|| {
                work.copy_from_slice(&scores);
                let mut view = MatViewMut::new(&mut work, 1, len).unwrap();
                fused_scale_mask_softmax(&mut view, black_box(0.125), len - 1).unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_dequantize(c: &mut Criterion) {
    let mut group = c.benchmark_group("dequantize");
    let n = 256 * 256;
    let values = ramp(n, 4);
    group.throughput(Throughput::Elements(n as u64));

    for kind in [QuantKind::F16, QuantKind::Q8_0, QuantKind::Q4_0, QuantKind::Q4_K, QuantKind::Q6_K] {
        let bytes = match kind {
            QuantKind::Q4_K | QuantKind::Q6_K => (0..n / 256 * kind.block_bytes())
                .map(|i| (i as u8).wrapping_mul(37))
                .collect(),
            _ => quantize(kind, &values).unwrap(),
        };
        group.bench_with_input(BenchmarkId::from_parameter(kind), &bytes, |b, bytes| {
            b.iter(|| black_box(dequantize(kind, black_box(bytes), n).unwrap()));
        });
    }

    group.finish();
}

fn benchmark_sampling(c: &mut Criterion) {
    let mut group = c.benchmark_group("sampling");
    let vocab = 32_000;
    let logits: Vec<f32> = ramp(vocab, 5).into_iter().map(|x| x * 8.0).collect();

    let strategies = [
        ("greedy", SamplingConfig::greedy()),
        ("top_k_40", SamplingConfig { temperature: 0.8, top_k: 40, top_p: 1.0 }),
        ("top_p_0.9", SamplingConfig { temperature: 0.8, top_k: 0, top_p: 0.9 }),
        ("full", SamplingConfig::default()),
    ];
    for (name, config) in strategies {
        let mut sampler = Sampler::new(config, Some(42)).with_capacity(vocab);
        group.bench_function(name, |b| {
            b.iter(|| black_box(sampler.sample(black_box(&logits)).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_matmul_transpose_b,
    benchmark_attention_softmax,
    benchmark_dequantize,
    benchmark_sampling,
);
criterion_main!(benches);
