//! KV cache capacity: appends past `max_seq_len` fail and never wrap

use std::sync::Arc;

use inferir::attention::{CacheState, KvCache};
use inferir::model::Transformer;
use inferir::pool::BufferPool;
use inferir::testing::{random_weights, tiny_config};
use inferir::InferirError;

#[test]
fn test_append_past_capacity_fails_without_writing() {
    let mut cache = KvCache::new(2, 4, 3).expect("test");
    let row = |v: f32| vec![v; 4];
    for layer in 0..2 {
        assert_eq!(cache.state(layer), CacheState::Empty);
    }
    for (i, v) in [1.0, 2.0, 3.0].into_iter().enumerate() {
        for layer in 0..2 {
            cache.append(layer, &row(v), &row(-v)).expect("test");
        }
        assert_eq!(cache.len(), i + 1);
    }
    assert_eq!(cache.state(0), CacheState::Full);
    assert_eq!(cache.remaining(), 0);

    let err = cache.append(0, &row(9.0), &row(-9.0)).expect_err("test");
    assert!(matches!(
        err,
        InferirError::Capacity {
            layer: 0,
            capacity: 3,
            requested: 4
        }
    ));
    // Position 0 still holds the first write
    assert_eq!(&cache.keys(0)[..4], &[1.0; 4]);
    assert_eq!(cache.keys(0).len(), 12);
    assert!(cache.is_consistent());
}

#[test]
fn test_multi_row_append_is_all_or_nothing() {
    let mut cache = KvCache::new(1, 2, 4).expect("test");
    cache.append(0, &[1.0; 6], &[1.0; 6]).expect("test");
    assert!(cache.append(0, &[2.0; 4], &[2.0; 4]).is_err());
    assert_eq!(cache.len(), 3);
    cache.append(0, &[2.0; 2], &[2.0; 2]).expect("test");
    assert_eq!(cache.state(0), CacheState::Full);
}

#[test]
fn test_forward_cached_past_capacity_is_capacity_error() {
    let model = Transformer::new(
        Arc::new(random_weights(&tiny_config(), 4)),
        Arc::new(BufferPool::default()),
    )
    .expect("test");
    let mut cache = model.new_cache(5).expect("test");
    model.forward_cached(&[1, 2, 3, 4], &mut cache).expect("test");

    let err = model.forward_cached(&[5, 6], &mut cache).expect_err("test");
    assert!(matches!(err, InferirError::Capacity { capacity: 5, requested: 6, .. }));
    // Failed step leaves the cache where it was
    assert_eq!(cache.len(), 4);
    assert!(cache.is_consistent());

    model.forward_cached(&[5], &mut cache).expect("test");
    assert!(model.forward_cached(&[6], &mut cache).is_err());
    assert_eq!(cache.len(), 5);
}

#[test]
fn test_cache_capped_at_context_length() {
    let config = tiny_config();
    let model =
        Transformer::new(Arc::new(random_weights(&config, 4)), Arc::new(BufferPool::default()))
            .expect("test");
    let cache = model.new_cache(10_000).expect("test");
    assert_eq!(cache.max_seq_len(), config.context_length);
    assert_eq!(cache.num_layers(), config.num_layers);
    assert_eq!(cache.kv_dim(), config.kv_dim());
}

#[test]
fn test_reset_reuses_arena() {
    let mut cache = KvCache::new(1, 2, 2).expect("test");
    cache.append(0, &[1.0; 4], &[1.0; 4]).expect("test");
    cache.reset();
    assert!(cache.is_empty());
    cache.append(0, &[3.0; 4], &[3.0; 4]).expect("test");
    assert_eq!(cache.keys(0), &[3.0; 4]);
}
