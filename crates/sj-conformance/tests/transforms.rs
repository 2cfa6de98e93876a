#![forbid(unsafe_code)]

//! End-to-end transform scenarios driven through the public dispatch path.

use sj_cache::{InMemoryCache, NoopCache};
use sj_conformance::assert_scalar_close;
use sj_core::{Primitive, Transform, Value, neg_mul_program, square_program, unary_program};
use sj_dispatch::{DispatchError, DispatchRequest, TransformError, dispatch};

#[test]
fn jit_with_static_argument_folds_the_whole_program() {
    let request = DispatchRequest::new(unary_program(Primitive::Neg), vec![Value::scalar_i64(5)])
        .with_transforms(vec![Transform::Jit])
        .with_compile_option("static_argnums", "0");

    let response = dispatch(&NoopCache, &request).expect("dispatch should succeed");
    assert_eq!(response.outputs, vec![Value::scalar_i64(-5)]);
    assert_eq!(response.folded_equations, 1);
    assert_eq!(response.residual_equations, 0);
}

#[test]
fn jit_with_mixed_arguments_splits_fold_and_residual() {
    let cache = InMemoryCache::new();
    let request = DispatchRequest::new(
        neg_mul_program(),
        vec![Value::scalar_i64(5), Value::scalar_i64(3)],
    )
    .with_transforms(vec![Transform::Jit])
    .with_compile_option("static_argnums", "0");

    let first = dispatch(&cache, &request).expect("dispatch should succeed");
    assert_eq!(first.outputs, vec![Value::scalar_i64(-15)]);
    assert_eq!(first.folded_equations, 1);
    assert_eq!(first.residual_equations, 1);
    assert!(!first.cache_hit);

    // The second identical request replays from the cache with the same
    // diagnostics.
    let second = dispatch(&cache, &request).expect("dispatch should succeed");
    assert!(second.cache_hit);
    assert_eq!(second.outputs, first.outputs);
    assert_eq!(second.folded_equations, 1);
    assert_eq!(second.residual_equations, 1);
}

#[test]
fn vmap_batches_three_squares() {
    let batched = sj_api::vmap(square_program());
    let outputs = batched
        .call(&[Value::vector_f64(&[1.0, 2.0, 3.0]).expect("vector should build")])
        .expect("vmap should succeed");
    assert_eq!(
        outputs,
        vec![Value::vector_f64(&[1.0, 4.0, 9.0]).expect("vector should build")]
    );
}

#[test]
fn vmap_rejects_an_empty_batch() {
    let request = DispatchRequest::new(
        square_program(),
        vec![Value::vector_f64(&[]).expect("vector should build")],
    )
    .with_transforms(vec![Transform::Vmap]);

    let err = dispatch(&NoopCache, &request).expect_err("empty batch must fail");
    assert_eq!(err, DispatchError::Transform(TransformError::EmptyBatch));
}

#[test]
fn gradient_of_square_at_three() {
    let df = sj_api::grad(square_program());
    let gradient = df
        .call(&[Value::scalar_f64(3.0)])
        .expect("grad should succeed");
    assert_eq!(gradient, Value::scalar_f64(6.0));
}

#[test]
fn second_order_gradient_of_square_is_constant_two() {
    let df = sj_api::grad(square_program());
    for x in [-2.0, 0.5, 3.0] {
        let second = df
            .second_order(&[Value::scalar_f64(x)])
            .expect("second order should succeed");
        assert_scalar_close(&second, 2.0, 1e-5);
    }
}

#[test]
fn stacked_grad_markers_are_refused() {
    let composed = sj_api::compose(square_program()).grad(0).grad(0);
    composed
        .check()
        .expect_err("duplicate grad kind must be rejected");
}

#[test]
fn jit_grad_vmap_compose_end_to_end() {
    let f = sj_api::compose(square_program()).jit().vmap().grad(0);
    let outputs = f
        .call(&[Value::vector_f64(&[1.0, 2.0, 3.0]).expect("vector should build")])
        .expect("composed call should succeed");
    assert_eq!(
        outputs,
        vec![Value::vector_f64(&[2.0, 4.0, 6.0]).expect("vector should build")]
    );
}
