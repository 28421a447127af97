//! Bounded concurrency, streaming and statistics of the async engine

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use inferir::config::EngineConfig;
use inferir::engine::InferenceEngine;
use inferir::error::ResourceKind;
use inferir::session::{InferenceOptions, SessionState};
use inferir::testing::{random_weights, tiny_config};
use inferir::tokenizer::ByteTokenizer;
use inferir::InferirError;

fn engine(max_sessions: usize) -> Arc<InferenceEngine> {
    let weights = Arc::new(random_weights(&tiny_config(), 90));
    let tokenizer = ByteTokenizer::with_specials(Some(256), Some(257)).expect("test");
    let config = EngineConfig {
        max_concurrent_sessions: max_sessions,
        ..EngineConfig::default()
    };
    Arc::new(InferenceEngine::new(weights, Arc::new(tokenizer), config).expect("test"))
}

fn options(seed: u64) -> InferenceOptions {
    InferenceOptions::default()
        .with_seed(seed)
        .with_stop_on_eos(false)
        .with_max_new_tokens(12)
        .without_time_limit()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions_match_sequential() {
    let engine = engine(3);
    let mut expected = Vec::new();
    for seed in 0..8 {
        expected.push(engine.generate("shared", options(seed)).await.expect("test").tokens);
    }

    let handles: Vec<_> = (0..8)
        .map(|seed| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.generate("shared", options(seed)).await })
        })
        .collect();
    for (seed, handle) in handles.into_iter().enumerate() {
        let out = handle.await.expect("test").expect("test");
        assert_eq!(out.tokens, expected[seed], "seed {seed}");
    }

    let stats = engine.stats();
    assert_eq!(stats.sessions_started, 16);
    assert_eq!(stats.sessions_completed, 16);
    assert_eq!(stats.tokens_generated, 16 * 12);
    assert_eq!(stats.active_sessions, 0);
    assert_eq!(stats.available_slots, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_waiting_session_admitted_when_slot_frees() {
    let engine = engine(1);
    let held = engine.try_session(options(1)).expect("test");
    assert!(matches!(
        engine.try_session(options(2)),
        Err(InferirError::ResourceLimit {
            resource: ResourceKind::ConcurrentSessions,
            limit: 1,
            ..
        })
    ));

    let waiter = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.generate("later", options(3)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    drop(held);
    let out = tokio::time::timeout(Duration::from_secs(10), waiter)
        .await
        .expect("test")
        .expect("test")
        .expect("test");
    assert_eq!(out.state, SessionState::Completed);
}

#[tokio::test]
async fn test_stream_yields_same_tokens_as_generate() {
    let engine = engine(2);
    let expected = engine.generate("stream me", options(5)).await.expect("test");
    let streamed: Vec<_> = engine
        .stream("stream me", options(5))
        .await
        .expect("test")
        .map(|item| item.expect("test").id)
        .collect()
        .await;
    assert_eq!(streamed, expected.tokens);
}

#[tokio::test]
async fn test_dropped_stream_cancels_and_frees_slot() {
    let engine = engine(1);
    let mut stream = engine
        .stream("abandon", options(6).with_max_new_tokens(60))
        .await
        .expect("test");
    assert!(stream.next().await.is_some());
    drop(stream);

    // The producer notices cancellation at its next step boundary
    let next = tokio::time::timeout(Duration::from_secs(10), engine.session(options(7)))
        .await
        .expect("test")
        .expect("test");
    let stats = engine.stats();
    assert_eq!(stats.sessions_failed, 1);
    assert_eq!(stats.active_sessions, 1);
    assert!(stats.tokens_generated < 60);
    drop(next);
}

#[tokio::test]
async fn test_stream_rejects_oversized_prompt_up_front() {
    let engine = engine(1);
    let err = engine
        .stream("far too long", options(1).with_max_input_tokens(3))
        .await
        .expect_err("test");
    assert!(err.is_retryable());
    assert_eq!(engine.stats().available_slots, 1);
}
