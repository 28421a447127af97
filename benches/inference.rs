//! Benchmark suite for inference
//!
//! Measures full forward passes, cached decode steps and end-to-end
//! generation over the fixture models.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use inferir::model::Transformer;
use inferir::pool::BufferPool;
use inferir::session::{InferenceOptions, Session};
use inferir::testing::{bench_config, random_weights, tiny_config};
use inferir::tokenizer::ByteTokenizer;

fn transformer() -> Transformer {
    let weights = Arc::new(random_weights(&bench_config(), 42));
    Transformer::new(weights, Arc::new(BufferPool::default())).unwrap()
}

fn benchmark_model_forward(c: &mut Criterion) {
    let model = transformer();
    let mut group = c.benchmark_group("model_forward");

    for seq_len in [1usize, 8, 32] {
        let tokens: Vec<u32> = (0..seq_len as u32).map(|i| i % 256).collect();
        group.bench_with_input(BenchmarkId::from_parameter(seq_len), &tokens, |b, tokens| {
            b.iter(|| black_box(model.forward(black_box(tokens)).unwrap()));
        });
    }

    group.finish();
}

fn benchmark_decode_step(c: &mut Criterion) {
    let model = transformer();
    let mut group = c.benchmark_group("decode_step");

    // Cost of one cached step grows with the number of cached positions
    for cached in [8usize, 64, 192] {
        let prefix: Vec<u32> = (0..cached as u32).map(|i| (i * 7) % 256).collect();
        group.bench_with_input(BenchmarkId::from_parameter(cached), &prefix, |b, prefix| {
            let mut cache = model.new_cache(prefix.len() + 1).unwrap();
            b.iter(|| {
                cache.reset();
                model.forward_cached(&prefix[..prefix.len() - 1], &mut cache).unwrap();
                let logits = model.forward_cached(black_box(&prefix[prefix.len() - 1..]), &mut cache).unwrap();
                black_box(logits[0])
            });
        });
    }

    group.finish();
}

fn benchmark_generation(c: &mut Criterion) {
    let weights = Arc::new(random_weights(&tiny_config(), 7));
    let pool = Arc::new(BufferPool::default());
    let tokenizer = Arc::new(ByteTokenizer::with_specials(Some(256), Some(257)).unwrap());
    let mut group = c.benchmark_group("generation");

    let strategies = [
        ("greedy", InferenceOptions::default().greedy()),
        ("top_k_5", InferenceOptions::default().with_top_k(5).with_seed(42)),
        ("top_p_0.9", InferenceOptions::default().with_top_p(0.9).with_seed(42)),
    ];
    for (name, options) in strategies {
        let options = options
            .with_stop_on_eos(false)
            .with_max_new_tokens(16)
            .without_time_limit();
        group.bench_with_input(BenchmarkId::from_parameter(name), &options, |b, options| {
            b.iter(|| {
                let model = Transformer::new(Arc::clone(&weights), Arc::clone(&pool)).unwrap();
                let session = Session::new(model, tokenizer.clone(), options.clone()).unwrap();
                black_box(session.generate(black_box("benchmark prompt")).unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_model_forward,
    benchmark_decode_step,
    benchmark_generation,
);
criterion_main!(benches);
