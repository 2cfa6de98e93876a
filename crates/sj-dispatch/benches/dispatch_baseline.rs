use criterion::{Criterion, black_box, criterion_group, criterion_main};
use sj_cache::{InMemoryCache, NoopCache};
use sj_core::{Transform, Value, linear_chain_program};
use sj_dispatch::{DispatchRequest, dispatch};

fn bench_dispatch(c: &mut Criterion) {
    let program = linear_chain_program(1_000);

    c.bench_function("eval_chain_1k", |b| {
        let request = DispatchRequest::new(program.clone(), vec![Value::scalar_i64(0)]);
        b.iter(|| dispatch(&NoopCache, black_box(&request)).expect("dispatch should succeed"));
    });

    c.bench_function("jit_chain_1k_cache_hit", |b| {
        let cache = InMemoryCache::new();
        let request = DispatchRequest::new(program.clone(), vec![Value::scalar_i64(0)])
            .with_transforms(vec![Transform::Jit]);
        dispatch(&cache, &request).expect("warm-up dispatch should succeed");
        b.iter(|| dispatch(&cache, black_box(&request)).expect("dispatch should succeed"));
    });

    c.bench_function("jit_chain_1k_cache_miss", |b| {
        let request = DispatchRequest::new(program.clone(), vec![Value::scalar_i64(0)])
            .with_transforms(vec![Transform::Jit]);
        b.iter(|| dispatch(&NoopCache, black_box(&request)).expect("dispatch should succeed"));
    });
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
