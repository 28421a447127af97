//! Cached incremental decoding agrees with the full-block forward pass
//!
//! The last-token logits of a full pass over `tokens` must match feeding the
//! same tokens through the KV cache, one at a time or in chunks.

use std::sync::Arc;

use inferir::model::{ModelConfig, Transformer};
use inferir::pool::BufferPool;
use inferir::testing::{random_weights, tiny_config, tiny_gpt2_config};

const TOLERANCE: f32 = 1e-4;

fn transformer(config: &ModelConfig, seed: u64) -> Transformer {
    Transformer::new(Arc::new(random_weights(config, seed)), Arc::new(BufferPool::default()))
        .expect("test")
}

fn prompt(len: usize, vocab: usize) -> Vec<u32> {
    (0..len).map(|i| ((i * 37 + 11) % vocab) as u32).collect()
}

fn assert_close(full: &[f32], cached: &[f32], what: &str) {
    assert_eq!(full.len(), cached.len());
    for (i, (a, b)) in full.iter().zip(cached).enumerate() {
        let scale = a.abs().max(1.0);
        assert!(
            (a - b).abs() <= TOLERANCE * scale,
            "{what}: logit {i} full {a} cached {b}"
        );
    }
}

fn last_row(logits: &inferir::Tensor) -> Vec<f32> {
    logits.row(logits.rows() - 1).expect("test").to_vec()
}

#[test]
fn test_token_by_token_matches_full_pass() {
    for config in [tiny_config(), tiny_gpt2_config()] {
        let model = transformer(&config, 17);
        for len in [1, 2, 5, 16, 33, config.context_length] {
            let tokens = prompt(len, config.vocab_size);
            let full = last_row(&model.forward(&tokens).expect("test"));

            let mut cache = model.new_cache(len).expect("test");
            let mut cached = Vec::new();
            for t in &tokens {
                cached = model.forward_cached(&[*t], &mut cache).expect("test").to_vec();
            }
            assert_eq!(cache.len(), len);
            assert_close(&full, &cached, &format!("{} len {len}", config.architecture));
        }
    }
}

#[test]
fn test_chunked_prefill_matches_full_pass() {
    let config = tiny_config();
    let model = transformer(&config, 18);
    let tokens = prompt(24, config.vocab_size);
    let full = last_row(&model.forward(&tokens).expect("test"));

    let mut cache = model.new_cache(tokens.len()).expect("test");
    let mut cached = Vec::new();
    for chunk in [&tokens[..7], &tokens[7..8], &tokens[8..20], &tokens[20..]] {
        cached = model.forward_cached(chunk, &mut cache).expect("test").to_vec();
    }
    assert_close(&full, &cached, "chunked");
}

#[test]
fn test_every_position_matches() {
    // Prefix property: row i of the full pass equals the cached logits after i+1 tokens
    let config = tiny_config();
    let model = transformer(&config, 19);
    let tokens = prompt(12, config.vocab_size);
    let full = model.forward(&tokens).expect("test");

    let mut cache = model.new_cache(tokens.len()).expect("test");
    for (i, t) in tokens.iter().enumerate() {
        let cached = model.forward_cached(&[*t], &mut cache).expect("test");
        assert_close(full.row(i).expect("test"), &cached, &format!("position {i}"));
    }
}

#[test]
fn test_future_tokens_do_not_affect_past() {
    let config = tiny_gpt2_config();
    let model = transformer(&config, 20);
    let mut a = prompt(10, config.vocab_size);
    let mut b = a.clone();
    a.push(3);
    b.push(200);
    let la = model.forward(&a).expect("test");
    let lb = model.forward(&b).expect("test");
    for i in 0..10 {
        assert_close(la.row(i).expect("test"), lb.row(i).expect("test"), &format!("row {i}"));
    }
}

#[test]
fn test_training_mode_rejects_cached_forward() {
    let mut model = transformer(&tiny_config(), 21);
    let mut cache = model.new_cache(4).expect("test");
    model.train();
    assert!(model.forward_cached(&[1], &mut cache).is_err());
    assert_eq!(cache.len(), 0);
    model.eval();
    assert!(model.forward_cached(&[1], &mut cache).is_ok());
}
