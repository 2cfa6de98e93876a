#![forbid(unsafe_code)]

//! Callable wrappers over the dispatch engine.
//!
//! `jit`, `grad`, and `vmap` wrap one program with one transform each and
//! give it a plain call interface. `compose` builds deeper stacks, outermost
//! transform first, and validates the composition up front.

use sj_cache::{InMemoryCache, ResponseCache};
use sj_core::{Mode, Program, Transform, Value};
use sj_dispatch::{DispatchError, DispatchRequest, dispatch, nested_gradient, validate_stack};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    Dispatch(DispatchError),
    /// The wrapped program produced an output arity the wrapper cannot
    /// represent, e.g. grad over a multi-output program.
    UnexpectedOutputArity { expected: usize, actual: usize },
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dispatch(err) => write!(f, "{err}"),
            Self::UnexpectedOutputArity { expected, actual } => {
                write!(f, "expected {} outputs, got {}", expected, actual)
            }
        }
    }
}

impl std::error::Error for ApiError {}

impl From<DispatchError> for ApiError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

/// A program staged and cached under `jit`. The cache persists across calls
/// and is shared by every clone of the wrapper.
#[derive(Clone)]
pub struct Jitted {
    program: Program,
    cache: Arc<dyn ResponseCache>,
    mode: Mode,
    backend: String,
    static_argnums: Vec<usize>,
}

impl Jitted {
    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    /// Pin the listed argument positions as compile-time constants.
    #[must_use]
    pub fn with_static_args(mut self, argnums: &[usize]) -> Self {
        self.static_argnums = argnums.to_vec();
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>, ApiError> {
        let mut request = DispatchRequest::new(self.program.clone(), args.to_vec())
            .with_transforms(vec![Transform::Jit])
            .with_mode(self.mode)
            .with_backend(self.backend.clone());
        if !self.static_argnums.is_empty() {
            let joined = self
                .static_argnums
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            request = request.with_compile_option("static_argnums", joined);
        }
        Ok(dispatch(self.cache.as_ref(), &request)?.outputs)
    }
}

#[must_use]
pub fn jit(program: Program) -> Jitted {
    Jitted {
        program,
        cache: Arc::new(InMemoryCache::new()),
        mode: Mode::Strict,
        backend: "cpu".to_owned(),
        static_argnums: Vec::new(),
    }
}

/// A program differentiated with respect to one argument position.
#[derive(Debug, Clone)]
pub struct GradFn {
    program: Program,
    arg: usize,
}

impl GradFn {
    pub fn call(&self, args: &[Value]) -> Result<Value, ApiError> {
        let request = DispatchRequest::new(self.program.clone(), args.to_vec())
            .with_transforms(vec![Transform::Grad { arg: self.arg }]);
        single_output(dispatch(&sj_cache::NoopCache, &request)?.outputs)
    }

    /// Second-order derivative with respect to the same argument. The
    /// composition validator refuses stacked grad markers, so this goes
    /// through the dedicated nested-gradient path.
    pub fn second_order(&self, args: &[Value]) -> Result<Value, ApiError> {
        let second = nested_gradient(&self.program, args, self.arg)?;
        Ok(Value::scalar_f64(second))
    }
}

#[must_use]
pub fn grad(program: Program) -> GradFn {
    grad_wrt(program, 0)
}

#[must_use]
pub fn grad_wrt(program: Program, arg: usize) -> GradFn {
    GradFn { program, arg }
}

/// A program mapped over the leading axis of every argument.
#[derive(Debug, Clone)]
pub struct Vmapped {
    program: Program,
}

impl Vmapped {
    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>, ApiError> {
        let request = DispatchRequest::new(self.program.clone(), args.to_vec())
            .with_transforms(vec![Transform::Vmap]);
        Ok(dispatch(&sj_cache::NoopCache, &request)?.outputs)
    }
}

#[must_use]
pub fn vmap(program: Program) -> Vmapped {
    Vmapped { program }
}

/// Evaluate a single-output program and its gradient in one call.
pub fn value_and_grad(
    program: &Program,
    args: &[Value],
    arg: usize,
) -> Result<(Value, Value), ApiError> {
    let value_request = DispatchRequest::new(program.clone(), args.to_vec());
    let value = single_output(dispatch(&sj_cache::NoopCache, &value_request)?.outputs)?;

    let grad_request = DispatchRequest::new(program.clone(), args.to_vec())
        .with_transforms(vec![Transform::Grad { arg }]);
    let gradient = single_output(dispatch(&sj_cache::NoopCache, &grad_request)?.outputs)?;

    Ok((value, gradient))
}

fn single_output(mut outputs: Vec<Value>) -> Result<Value, ApiError> {
    if outputs.len() != 1 {
        return Err(ApiError::UnexpectedOutputArity {
            expected: 1,
            actual: outputs.len(),
        });
    }
    Ok(outputs.remove(0))
}

/// Builder for multi-transform stacks, outermost transform first.
#[derive(Clone)]
pub struct Composed {
    program: Program,
    stack: Vec<Transform>,
    cache: Arc<dyn ResponseCache>,
    mode: Mode,
}

impl Composed {
    #[must_use]
    pub fn jit(mut self) -> Self {
        self.stack.push(Transform::Jit);
        self
    }

    #[must_use]
    pub fn grad(mut self, arg: usize) -> Self {
        self.stack.push(Transform::Grad { arg });
        self
    }

    #[must_use]
    pub fn vmap(mut self) -> Self {
        self.stack.push(Transform::Vmap);
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Validate the assembled stack without running anything.
    pub fn check(&self) -> Result<(), ApiError> {
        validate_stack(&self.stack).map_err(DispatchError::from)?;
        Ok(())
    }

    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>, ApiError> {
        let request = DispatchRequest::new(self.program.clone(), args.to_vec())
            .with_transforms(self.stack.clone())
            .with_mode(self.mode);
        Ok(dispatch(self.cache.as_ref(), &request)?.outputs)
    }
}

#[must_use]
pub fn compose(program: Program) -> Composed {
    Composed {
        program,
        stack: Vec::new(),
        cache: Arc::new(InMemoryCache::new()),
        mode: Mode::Strict,
    }
}

#[cfg(test)]
mod tests {
    use super::{compose, grad, grad_wrt, jit, value_and_grad, vmap};
    use sj_core::{Primitive, Value, binary_program, neg_mul_program, square_program};

    #[test]
    fn jitted_program_returns_consistent_outputs_across_calls() {
        let f = jit(neg_mul_program());
        let args = [Value::scalar_i64(5), Value::scalar_i64(3)];
        let first = f.call(&args).expect("call should succeed");
        let second = f.call(&args).expect("call should succeed");
        assert_eq!(first, vec![Value::scalar_i64(-15)]);
        assert_eq!(first, second);
    }

    #[test]
    fn jitted_static_args_still_compute_the_same_result() {
        let f = jit(neg_mul_program()).with_static_args(&[0]);
        let outputs = f
            .call(&[Value::scalar_i64(5), Value::scalar_i64(3)])
            .expect("call should succeed");
        assert_eq!(outputs, vec![Value::scalar_i64(-15)]);
    }

    #[test]
    fn grad_wrapper_differentiates_square() {
        let df = grad(square_program());
        let gradient = df.call(&[Value::scalar_f64(3.0)]).expect("grad should succeed");
        assert_eq!(gradient, Value::scalar_f64(6.0));
    }

    #[test]
    fn grad_wrt_selects_the_argument_position() {
        let df = grad_wrt(binary_program(Primitive::Mul), 1);
        let gradient = df
            .call(&[Value::scalar_f64(3.0), Value::scalar_f64(5.0)])
            .expect("grad should succeed");
        assert_eq!(gradient, Value::scalar_f64(3.0));
    }

    #[test]
    fn second_order_of_square_is_two() {
        let df = grad(square_program());
        let second = df
            .second_order(&[Value::scalar_f64(3.0)])
            .expect("second order should succeed");
        let second = second.as_f64_scalar().expect("scalar result");
        assert!((second - 2.0).abs() < 1e-6);
    }

    #[test]
    fn value_and_grad_agree_with_separate_calls() {
        let program = square_program();
        let (value, gradient) = value_and_grad(&program, &[Value::scalar_f64(3.0)], 0)
            .expect("value_and_grad should succeed");
        assert_eq!(value, Value::scalar_f64(9.0));
        assert_eq!(gradient, Value::scalar_f64(6.0));
    }

    #[test]
    fn vmap_wrapper_batches_square() {
        let batched = vmap(square_program());
        let outputs = batched
            .call(&[Value::vector_f64(&[1.0, 2.0, 3.0]).expect("vector should build")])
            .expect("vmap should succeed");
        assert_eq!(
            outputs,
            vec![Value::vector_f64(&[1.0, 4.0, 9.0]).expect("vector should build")]
        );
    }

    #[test]
    fn compose_validates_before_running() {
        let bad = compose(square_program()).grad(0).grad(0);
        bad.check().expect_err("stacked grad must be rejected");

        let good = compose(square_program()).jit().grad(0);
        good.check().expect("jit over grad is fine");
        let outputs = good
            .call(&[Value::scalar_f64(3.0)])
            .expect("call should succeed");
        assert_eq!(outputs, vec![Value::scalar_f64(6.0)]);
    }

    #[test]
    fn compose_vmap_of_grad() {
        let f = compose(square_program()).vmap().grad(0);
        let outputs = f
            .call(&[Value::vector_f64(&[1.0, 2.0]).expect("vector should build")])
            .expect("call should succeed");
        assert_eq!(
            outputs,
            vec![Value::vector_f64(&[2.0, 4.0]).expect("vector should build")]
        );
    }
}
