//! Non-finite logits end the session instead of being sampled

use std::sync::Arc;

use inferir::config::EngineConfig;
use inferir::engine::InferenceEngine;
use inferir::model::{ModelWeights, Transformer, Weight};
use inferir::pool::BufferPool;
use inferir::session::{FinishReason, GenerationOutput, InferenceOptions, Session, SessionState};
use inferir::testing::{random_weights, tiny_config};
use inferir::tokenizer::ByteTokenizer;
use inferir::InferirError;

fn tokenizer() -> ByteTokenizer {
    ByteTokenizer::with_specials(Some(256), Some(257)).expect("test")
}

fn options() -> InferenceOptions {
    InferenceOptions::default()
        .greedy()
        .with_stop_on_eos(false)
        .with_max_new_tokens(8)
        .without_time_limit()
}

fn generate(weights: ModelWeights, prompt: &str) -> GenerationOutput {
    let transformer = Transformer::new(Arc::new(weights), Arc::new(BufferPool::default())).expect("test");
    Session::new(transformer, Arc::new(tokenizer()), options())
        .expect("test")
        .generate(prompt)
        .expect("test")
}

#[test]
fn test_nan_on_first_step_emits_nothing() {
    let mut weights = random_weights(&tiny_config(), 40);
    weights.output_norm.data_mut().fill(f32::NAN);
    let out = generate(weights, "hello");

    assert!(out.tokens.is_empty());
    assert!(out.text.is_empty());
    assert_eq!(out.state, SessionState::Failed);
    assert_eq!(out.finish_reason, FinishReason::Error);
    assert!(matches!(out.error, Some(InferirError::NumericAnomaly { step: 0, .. })));
}

#[test]
fn test_nan_mid_generation_keeps_earlier_tokens() {
    let clean = generate(random_weights(&tiny_config(), 41), "hello");
    assert_eq!(clean.tokens.len(), 8);

    // Poison the embedding of a generated token that has not been fed
    // before: the step that feeds it back sees non-finite logits
    let prompt = [256, u32::from(b'h'), u32::from(b'e'), u32::from(b'l'), u32::from(b'o')];
    let k = (0..clean.tokens.len() - 1)
        .find(|&k| !prompt.contains(&clean.tokens[k]) && !clean.tokens[..k].contains(&clean.tokens[k]))
        .expect("test");
    let poisoned_id = clean.tokens[k] as usize;
    let mut weights = random_weights(&tiny_config(), 41);
    let Weight::Dense(embd) = &mut weights.token_embd else {
        panic!("fixture weights are dense");
    };
    let h = embd.cols();
    embd.data_mut()[poisoned_id * h..(poisoned_id + 1) * h].fill(f32::INFINITY);

    let out = generate(weights, "hello");
    assert_eq!(out.tokens, clean.tokens[..=k].to_vec());
    assert_eq!(out.state, SessionState::Failed);
    match out.error {
        Some(InferirError::NumericAnomaly { step, .. }) => assert_eq!(step, k + 1),
        other => panic!("expected numeric anomaly, got {other:?}"),
    }
}

#[tokio::test]
async fn test_engine_stream_surfaces_anomaly() {
    use futures::StreamExt;

    let mut weights = random_weights(&tiny_config(), 42);
    weights.output_norm.data_mut().fill(f32::NAN);
    let engine = InferenceEngine::new(Arc::new(weights), Arc::new(tokenizer()), EngineConfig::default())
        .expect("test");
    let items: Vec<_> = engine.stream("x", options()).await.expect("test").collect().await;

    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(InferirError::NumericAnomaly { .. })));
    assert_eq!(engine.stats().sessions_failed, 1);
}
