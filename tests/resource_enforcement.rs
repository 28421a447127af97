//! Input, context and output budgets on a session
//!
//! Budgets checked before the first forward pass reject the request;
//! budgets hit mid-generation stop it and keep what was produced.

use std::sync::Arc;

use inferir::error::ResourceKind;
use inferir::model::{ModelWeights, Transformer};
use inferir::pool::BufferPool;
use inferir::session::{FinishReason, InferenceOptions, Session, SessionState};
use inferir::testing::{random_weights, tiny_config};
use inferir::tokenizer::ByteTokenizer;
use inferir::InferirError;

fn session_on(weights: Arc<ModelWeights>, pool: Arc<BufferPool>, options: InferenceOptions) -> Session {
    let transformer = Transformer::new(weights, pool).expect("test");
    let tokenizer = ByteTokenizer::with_specials(Some(256), Some(257)).expect("test");
    Session::new(transformer, Arc::new(tokenizer), options).expect("test")
}

fn session(options: InferenceOptions) -> Session {
    session_on(
        Arc::new(random_weights(&tiny_config(), 8)),
        Arc::new(BufferPool::default()),
        options,
    )
}

fn options() -> InferenceOptions {
    InferenceOptions::default()
        .greedy()
        .with_stop_on_eos(false)
        .without_time_limit()
}

#[test]
fn test_oversized_input_rejected_before_any_work() {
    // BOS + 11 bytes
    let err = session(options().with_max_input_tokens(4))
        .start("hello world")
        .expect_err("test");
    assert!(matches!(
        err,
        InferirError::ResourceLimit {
            resource: ResourceKind::InputTokens,
            limit: 4,
            actual: 12
        }
    ));
    assert!(err.is_retryable());
}

#[test]
fn test_oversized_input_truncated_on_request() {
    let stream = session(options().with_max_input_tokens(4).with_truncate_input(true).with_max_new_tokens(2))
        .start("hello world")
        .expect("test");
    assert_eq!(stream.prompt_tokens(), &[256, u32::from(b'h'), u32::from(b'e'), u32::from(b'l')]);
    let out = stream.finish();
    assert_eq!(out.metrics.prompt_tokens, 4);
    assert_eq!(out.metrics.truncated_tokens, 8);
    assert_eq!(out.tokens.len(), 2);
    assert!(out.is_complete());
}

#[test]
fn test_max_new_tokens_is_normal_completion() {
    for n in [1, 3, 10] {
        let out = session(options().with_max_new_tokens(n)).generate("q").expect("test");
        assert_eq!(out.tokens.len(), n);
        assert_eq!(out.state, SessionState::Completed);
        assert_eq!(out.finish_reason, FinishReason::Length);
        assert!(out.error.is_none());
        assert_eq!(out.metrics.tokens_generated, n);
    }
}

#[test]
fn test_prompt_over_context_budget_rejected() {
    let err = session(options().with_max_context_tokens(3)).start("abcd").expect_err("test");
    assert!(matches!(
        err,
        InferirError::ResourceLimit {
            resource: ResourceKind::ContextTokens,
            limit: 3,
            actual: 5
        }
    ));
}

#[test]
fn test_context_budget_capped_by_model_context() {
    let config = tiny_config();
    let prompt = "x".repeat(config.context_length + 6);
    let err = session(options().with_max_input_tokens(1000).with_max_context_tokens(1000))
        .start(&prompt)
        .expect_err("test");
    match err {
        InferirError::ResourceLimit {
            resource: ResourceKind::ContextTokens,
            limit,
            actual,
        } => {
            assert_eq!(limit, config.context_length);
            assert_eq!(actual, config.context_length + 7);
        },
        other => panic!("unexpected {other}"),
    }
}

#[test]
fn test_context_filled_mid_generation_keeps_partial_output() {
    let config = tiny_config();
    // Prompt of BOS + 60 leaves room to feed back 3 sampled tokens
    let prompt = "y".repeat(60);
    let out = session(options().with_max_new_tokens(100)).generate(&prompt).expect("test");
    assert_eq!(out.tokens.len(), config.context_length - 61 + 1);
    assert_eq!(out.state, SessionState::ResourceExceeded);
    assert_eq!(out.finish_reason, FinishReason::ContextLimit);
}

#[test]
fn test_huge_new_token_budget_is_bounded_by_context() {
    let config = tiny_config();
    for max_new in [usize::MAX, 1usize << 62, 1usize << 34] {
        let out = session(options().with_max_new_tokens(max_new)).generate("hi").expect("test");
        // BOS + 2 bytes, then every remaining slot is fed back once
        assert_eq!(out.tokens.len(), config.context_length - 3 + 1, "budget {max_new}");
        assert_eq!(out.state, SessionState::ResourceExceeded);
        assert_eq!(out.finish_reason, FinishReason::ContextLimit);
    }
}

#[test]
fn test_out_of_vocabulary_prompt_rejected() {
    let err = session(options()).start_tokens(vec![1, 2, 9999]).expect_err("test");
    assert!(matches!(err, InferirError::Validation { .. }));
}

#[test]
fn test_empty_prompt_without_bos_rejected() {
    let mut config = tiny_config();
    config.add_bos = false;
    let s = session_on(
        Arc::new(random_weights(&config, 1)),
        Arc::new(BufferPool::default()),
        options(),
    );
    assert!(matches!(s.start(""), Err(InferirError::Validation { .. })));
}

#[test]
fn test_cancel_mid_stream_keeps_tokens() {
    let mut stream = session(options().with_max_new_tokens(50)).start("go").expect("test");
    let first: Vec<_> = stream.by_ref().take(3).collect();
    assert_eq!(first.len(), 3);
    stream.cancellation_token().cancel();
    let out = stream.finish();
    assert_eq!(out.state, SessionState::Cancelled);
    assert_eq!(out.finish_reason, FinishReason::Cancelled);
    assert_eq!(out.tokens, first.iter().map(|t| t.id).collect::<Vec<_>>());
    assert!(matches!(out.error, Some(InferirError::Cancelled { tokens_generated: 3 })));
}

#[test]
fn test_dropping_stream_early_returns_cache_to_pool() {
    let pool = Arc::new(BufferPool::default());
    let weights = Arc::new(random_weights(&tiny_config(), 8));
    let mut stream = session_on(weights, Arc::clone(&pool), options().with_max_new_tokens(50))
        .start("stop early")
        .expect("test");
    assert!(stream.next().is_some());
    let released = || {
        let s = pool.stats();
        s.returns + s.discarded
    };
    let before = released();
    drop(stream);
    // One key and one value arena per layer
    assert!(released() >= before + 2 * tiny_config().num_layers as u64);
}

#[test]
fn test_stream_ends_after_terminal_state() {
    let mut stream = session(options().with_max_new_tokens(2)).start("z").expect("test");
    assert_eq!(stream.by_ref().count(), 2);
    assert!(stream.next().is_none());
    assert_eq!(stream.state(), SessionState::Completed);
}
