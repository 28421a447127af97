//! Steady-state decoding does not touch the heap
//!
//! A counting global allocator records allocations made on the test's own
//! thread while a warmed-up decode loop runs.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::Arc;

use inferir::generate::{Sampler, SamplingConfig};
use inferir::model::Transformer;
use inferir::pool::BufferPool;
use inferir::session::{InferenceOptions, Session};
use inferir::testing::{random_weights, tiny_config, tiny_gpt2_config};
use inferir::tokenizer::{ByteTokenizer, Tokenizer};

struct CountingAlloc;

thread_local! {
    static ALLOCATIONS: Cell<u64> = const { Cell::new(0) };
}

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let _ = ALLOCATIONS.try_with(|c| c.set(c.get() + 1));
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let _ = ALLOCATIONS.try_with(|c| c.set(c.get() + 1));
        System.realloc(ptr, layout, new_size)
    }
}

#[global_allocator]
static GLOBAL: CountingAlloc = CountingAlloc;

fn allocations() -> u64 {
    ALLOCATIONS.with(Cell::get)
}

#[test]
fn test_decode_loop_is_allocation_free_after_warmup() {
    for (config, sampling) in [
        (tiny_config(), SamplingConfig::greedy()),
        (
            tiny_gpt2_config(),
            SamplingConfig {
                temperature: 0.7,
                top_k: 20,
                top_p: 0.9,
            },
        ),
    ] {
        let model = Transformer::new(Arc::new(random_weights(&config, 12)), Arc::new(BufferPool::default()))
            .expect("test")
            .with_parallel_threshold(usize::MAX);
        let mut sampler = Sampler::new(sampling, Some(5)).with_capacity(config.vocab_size);
        let mut cache = model.new_cache(config.context_length).expect("test");
        let mut generated = Vec::with_capacity(config.context_length);

        let mut next = {
            let logits = model.forward_cached(&[1, 2, 3, 4], &mut cache).expect("test");
            sampler.sample(&logits).expect("test")
        };
        // Walk every scratch size class the remaining steps will need
        for _ in 0..8 {
            let logits = model.forward_cached(&[next], &mut cache).expect("test");
            next = sampler.sample(&logits).expect("test");
            generated.push(next);
        }

        let before = allocations();
        for _ in 0..40 {
            let logits = model.forward_cached(&[next], &mut cache).expect("test");
            next = sampler.sample(&logits).expect("test");
            generated.push(next);
        }
        let during = allocations() - before;
        assert_eq!(during, 0, "{} allocated {during} times while decoding", config.architecture);
        assert_eq!(cache.len(), 4 + 8 + 40);
    }
}

#[test]
fn test_pool_stops_allocating_across_sessions() {
    let pool = Arc::new(BufferPool::default());
    let model = Transformer::new(Arc::new(random_weights(&tiny_config(), 13)), Arc::clone(&pool))
        .expect("test");
    let tokenizer: Arc<dyn Tokenizer> =
        Arc::new(ByteTokenizer::with_specials(Some(256), Some(257)).expect("test"));
    let options = InferenceOptions::default()
        .with_seed(3)
        .with_max_new_tokens(16)
        .with_stop_on_eos(false)
        .without_time_limit();

    let run = || {
        Session::new(model.clone(), Arc::clone(&tokenizer), options.clone())
            .expect("test")
            .generate("same prompt")
            .expect("test")
    };
    run();
    run();
    let warm = pool.stats();
    for _ in 0..5 {
        run();
    }
    let after = pool.stats();
    assert_eq!(after.fresh_allocations, warm.fresh_allocations);
    assert!(after.hits > warm.hits);
}
