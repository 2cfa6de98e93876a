#![forbid(unsafe_code)]

//! Request dispatch: validate the transform stack, derive the cache key,
//! peel transforms outermost-first, and execute the base program through
//! the interpreter.
//!
//! Peeling order is `stack[0]` outermost. `jit` stages and caches, `grad`
//! differentiates a scalar output, `vmap` maps over the leading axis of
//! its batched arguments and broadcasts the rest. The response cache is
//! consulted only when the stack contains `jit`, and failed requests are
//! never stored.

pub mod autodiff;

pub use autodiff::nested_gradient;

use sj_cache::{CacheEntry, CacheKey, CacheKeyError, CacheKeyInput, ResponseCache, build_cache_key};
use sj_core::{Mode, Primitive, Program, Transform, TensorValue, Value, ValueError, VarId};
use sj_interp::dce::prune_unreachable;
use sj_interp::partial_eval::AbstractStatus;
use sj_interp::staging::{StagingError, execute_staged, stage};
use sj_interp::{InterpreterError, eval_program};
use std::collections::BTreeMap;

/// Transform stacks deeper than this are rejected before any work happens.
pub const MAX_STACK_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompositionError {
    /// A non-idempotent transform kind appears twice in the same stack.
    DuplicateTransform {
        transform: Transform,
        position: usize,
    },
    StackTooDeep {
        depth: usize,
        max: usize,
    },
}

impl std::fmt::Display for CompositionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateTransform {
                transform,
                position,
            } => write!(
                f,
                "duplicate {} transform at stack position {}",
                transform.as_str(),
                position
            ),
            Self::StackTooDeep { depth, max } => {
                write!(f, "transform stack depth {} exceeds maximum {}", depth, max)
            }
        }
    }
}

impl std::error::Error for CompositionError {}

/// Reject ill-formed transform stacks.
///
/// `jit` repetition is idempotent and allowed; a repeated `grad` or `vmap`
/// kind is rejected regardless of parameters.
pub fn validate_stack(stack: &[Transform]) -> Result<(), CompositionError> {
    if stack.len() > MAX_STACK_DEPTH {
        return Err(CompositionError::StackTooDeep {
            depth: stack.len(),
            max: MAX_STACK_DEPTH,
        });
    }

    for (position, transform) in stack.iter().enumerate() {
        if matches!(transform, Transform::Jit) {
            continue;
        }
        if stack[..position]
            .iter()
            .any(|earlier| earlier.same_kind(*transform))
        {
            return Err(CompositionError::DuplicateTransform {
                transform: *transform,
                position,
            });
        }
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransformError {
    EmptyArguments,
    GradArgOutOfRange {
        arg: usize,
        arity: usize,
    },
    NonScalarGradInput {
        arg: usize,
    },
    NonScalarGradOutput {
        outputs: usize,
    },
    MissingDerivativeRule(Primitive),
    /// A non-scalar value flowed through the reverse-mode tape.
    NonScalarTapeValue {
        var: VarId,
    },
    LeadingDimensionMismatch {
        expected: u32,
        actual: u32,
        arg: usize,
    },
    EmptyBatch,
    OutputArityMismatch {
        expected: usize,
        actual: usize,
        iteration: usize,
    },
    TensorBuild(ValueError),
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyArguments => write!(f, "transform requires at least one argument"),
            Self::GradArgOutOfRange { arg, arity } => {
                write!(f, "grad argument {} out of range for arity {}", arg, arity)
            }
            Self::NonScalarGradInput { arg } => {
                write!(f, "grad argument {} is not a float scalar", arg)
            }
            Self::NonScalarGradOutput { outputs } => {
                write!(
                    f,
                    "grad requires a single float scalar output, got {} outputs",
                    outputs
                )
            }
            Self::MissingDerivativeRule(primitive) => {
                write!(f, "no derivative rule for primitive {}", primitive.as_str())
            }
            Self::NonScalarTapeValue { var } => {
                write!(f, "non-scalar value at v{} on the gradient tape", var.0)
            }
            Self::LeadingDimensionMismatch {
                expected,
                actual,
                arg,
            } => write!(
                f,
                "vmap argument {} has leading dimension {}, expected {}",
                arg, actual, expected
            ),
            Self::EmptyBatch => write!(f, "vmap over an empty batch"),
            Self::OutputArityMismatch {
                expected,
                actual,
                iteration,
            } => write!(
                f,
                "vmap iteration {} produced {} outputs, expected {}",
                iteration, actual, expected
            ),
            Self::TensorBuild(err) => write!(f, "vmap result assembly failed: {err}"),
        }
    }
}

impl std::error::Error for TransformError {}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    Composition(CompositionError),
    Key(CacheKeyError),
    Transform(TransformError),
    Interpreter(InterpreterError),
    Staging(StagingError),
    InvalidCompileOption { key: &'static str, value: String },
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Composition(err) => write!(f, "composition rejected: {err}"),
            Self::Key(err) => write!(f, "cache key rejected: {err}"),
            Self::Transform(err) => write!(f, "transform failed: {err}"),
            Self::Interpreter(err) => write!(f, "evaluation failed: {err}"),
            Self::Staging(err) => write!(f, "staging failed: {err}"),
            Self::InvalidCompileOption { key, value } => {
                write!(f, "invalid compile option {}={}", key, value)
            }
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<CompositionError> for DispatchError {
    fn from(value: CompositionError) -> Self {
        Self::Composition(value)
    }
}

impl From<CacheKeyError> for DispatchError {
    fn from(value: CacheKeyError) -> Self {
        Self::Key(value)
    }
}

impl From<TransformError> for DispatchError {
    fn from(value: TransformError) -> Self {
        Self::Transform(value)
    }
}

impl From<InterpreterError> for DispatchError {
    fn from(value: InterpreterError) -> Self {
        Self::Interpreter(value)
    }
}

impl From<StagingError> for DispatchError {
    fn from(value: StagingError) -> Self {
        Self::Staging(value)
    }
}

/// One fully-specified execution request.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub mode: Mode,
    pub program: Program,
    pub transform_stack: Vec<Transform>,
    pub args: Vec<Value>,
    pub backend: String,
    pub compile_options: BTreeMap<String, String>,
    pub custom_hook: Option<String>,
    pub unknown_features: Vec<String>,
}

impl DispatchRequest {
    #[must_use]
    pub fn new(program: Program, args: Vec<Value>) -> Self {
        Self {
            mode: Mode::Strict,
            program,
            transform_stack: Vec::new(),
            args,
            backend: "cpu".to_owned(),
            compile_options: BTreeMap::new(),
            custom_hook: None,
            unknown_features: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_transforms(mut self, stack: Vec<Transform>) -> Self {
        self.transform_stack = stack;
        self
    }

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

    #[must_use]
    pub fn with_compile_option(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.compile_options.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_custom_hook(mut self, hook: impl Into<String>) -> Self {
        self.custom_hook = Some(hook.into());
        self
    }

    #[must_use]
    pub fn with_unknown_features(mut self, features: Vec<String>) -> Self {
        self.unknown_features = features;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResponse {
    pub outputs: Vec<Value>,
    pub cache_key: CacheKey,
    pub cache_hit: bool,
    pub folded_equations: usize,
    pub residual_equations: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct ExecutionStats {
    folded_equations: usize,
    residual_equations: usize,
}

/// Run one request end to end.
///
/// Order is fixed: composition validation, key derivation (with the strict
/// unknown-feature check), cache lookup when the stack contains `jit`,
/// execution, then a cache store. Errors short-circuit and are never cached.
pub fn dispatch(
    cache: &dyn ResponseCache,
    request: &DispatchRequest,
) -> Result<DispatchResponse, DispatchError> {
    validate_stack(&request.transform_stack)?;

    let cache_key = build_cache_key(&CacheKeyInput {
        mode: request.mode,
        backend: &request.backend,
        program: &request.program,
        transform_stack: &request.transform_stack,
        compile_options: &request.compile_options,
        custom_hook: request.custom_hook.as_deref(),
        unknown_features: &request.unknown_features,
        args: &request.args,
    })?;

    let cacheable = request
        .transform_stack
        .iter()
        .any(|transform| matches!(transform, Transform::Jit));

    if cacheable && let Some(entry) = cache.get(&cache_key) {
        return Ok(DispatchResponse {
            outputs: entry.outputs,
            cache_key,
            cache_hit: true,
            folded_equations: entry.folded_equations,
            residual_equations: entry.residual_equations,
        });
    }

    let mut stats = ExecutionStats::default();
    let outputs = execute_stack(
        &request.program,
        &request.transform_stack,
        &request.args,
        &request.compile_options,
        false,
        &mut stats,
    )?;

    if cacheable {
        cache.put(
            &cache_key,
            CacheEntry {
                outputs: outputs.clone(),
                folded_equations: stats.folded_equations,
                residual_equations: stats.residual_equations,
            },
        );
    }

    Ok(DispatchResponse {
        outputs,
        cache_key,
        cache_hit: false,
        folded_equations: stats.folded_equations,
        residual_equations: stats.residual_equations,
    })
}

fn execute_stack(
    program: &Program,
    stack: &[Transform],
    args: &[Value],
    compile_options: &BTreeMap<String, String>,
    staged: bool,
    stats: &mut ExecutionStats,
) -> Result<Vec<Value>, DispatchError> {
    let Some((outermost, tail)) = stack.split_first() else {
        return Ok(eval_program(program, args)?);
    };

    match *outermost {
        Transform::Jit => {
            if staged {
                // A jit further out already staged this program.
                return execute_stack(program, tail, args, compile_options, true, stats);
            }
            if !tail.is_empty() {
                // With transforms still inside, arguments are not yet the
                // program's arguments, so nothing can be pinned. Prune and
                // run the remaining stack.
                let pruned = prune_unreachable(program);
                return execute_stack(&pruned, tail, args, compile_options, true, stats);
            }

            let static_argnums = parse_static_argnums(compile_options, program.invars.len())?;
            let mut inputs: Vec<AbstractStatus> =
                args.iter().map(AbstractStatus::unknown_like).collect();
            for index in static_argnums {
                if let Some(value) = args.get(index) {
                    inputs[index] = AbstractStatus::known(value.clone());
                }
            }

            let mut split = stage(program, &inputs)?;
            split.residual = prune_unreachable(&split.residual);
            stats.folded_equations += split.known.equations.len();
            stats.residual_equations += split.residual.equations.len();

            let dynamic_args: Vec<Value> = args
                .iter()
                .zip(inputs.iter())
                .filter(|(_, status)| !status.is_known())
                .map(|(value, _)| value.clone())
                .collect();
            Ok(execute_staged(&split, &dynamic_args)?)
        }

        Transform::Grad { arg } => {
            if args.is_empty() {
                return Err(TransformError::EmptyArguments.into());
            }
            if arg >= args.len() {
                return Err(TransformError::GradArgOutOfRange {
                    arg,
                    arity: args.len(),
                }
                .into());
            }
            if args[arg].as_f64_scalar().is_none() {
                return Err(TransformError::NonScalarGradInput { arg }.into());
            }

            let gradient = if tail.is_empty() {
                autodiff::tape_gradient(program, args, arg)?
            } else {
                autodiff::finite_diff_gradient(
                    |shifted| execute_stack(program, tail, shifted, compile_options, staged, stats),
                    args,
                    arg,
                )?
            };
            Ok(vec![Value::scalar_f64(gradient)])
        }

        Transform::Vmap => {
            apply_vmap(program, tail, args, compile_options, staged, stats)
        }
    }
}

fn apply_vmap(
    program: &Program,
    tail: &[Transform],
    args: &[Value],
    compile_options: &BTreeMap<String, String>,
    staged: bool,
    stats: &mut ExecutionStats,
) -> Result<Vec<Value>, DispatchError> {
    if args.is_empty() {
        return Err(TransformError::EmptyArguments.into());
    }

    // Arguments with a leading axis are mapped; scalars (and axis-less
    // tensors) broadcast unchanged into every iteration.
    let mut batch_size: Option<u32> = None;
    for (arg, value) in args.iter().enumerate() {
        let Some(leading) = value.as_tensor().and_then(TensorValue::leading_dim) else {
            continue;
        };
        match batch_size {
            None => batch_size = Some(leading),
            Some(expected) if expected != leading => {
                return Err(TransformError::LeadingDimensionMismatch {
                    expected,
                    actual: leading,
                    arg,
                }
                .into());
            }
            Some(_) => {}
        }
    }
    let batch_size = batch_size.unwrap_or(0);
    if batch_size == 0 {
        return Err(TransformError::EmptyBatch.into());
    }

    let mut columns: Vec<Vec<Value>> = Vec::new();
    for iteration in 0..batch_size as usize {
        let slices: Vec<Value> = args
            .iter()
            .map(|value| match value.as_tensor().filter(|t| t.leading_dim().is_some()) {
                Some(tensor) => tensor
                    .slice_axis0(iteration)
                    .map_err(TransformError::TensorBuild),
                None => Ok(value.clone()),
            })
            .collect::<Result<_, _>>()?;

        let outputs = execute_stack(program, tail, &slices, compile_options, staged, stats)?;

        if iteration == 0 {
            columns = outputs
                .into_iter()
                .map(|value| {
                    let mut column = Vec::with_capacity(batch_size as usize);
                    column.push(value);
                    column
                })
                .collect();
        } else {
            if outputs.len() != columns.len() {
                return Err(TransformError::OutputArityMismatch {
                    expected: columns.len(),
                    actual: outputs.len(),
                    iteration,
                }
                .into());
            }
            for (column, value) in columns.iter_mut().zip(outputs) {
                column.push(value);
            }
        }
    }

    columns
        .into_iter()
        .map(|column| {
            TensorValue::stack_axis0(&column)
                .map(Value::Tensor)
                .map_err(|err| TransformError::TensorBuild(err).into())
        })
        .collect()
}

fn parse_static_argnums(
    compile_options: &BTreeMap<String, String>,
    arity: usize,
) -> Result<Vec<usize>, DispatchError> {
    let Some(raw) = compile_options.get("static_argnums") else {
        return Ok(Vec::new());
    };

    let mut indices = Vec::new();
    for piece in raw.split(',').map(str::trim).filter(|piece| !piece.is_empty()) {
        let index: usize = piece.parse().map_err(|_| DispatchError::InvalidCompileOption {
            key: "static_argnums",
            value: raw.clone(),
        })?;
        if index >= arity {
            return Err(DispatchError::InvalidCompileOption {
                key: "static_argnums",
                value: raw.clone(),
            });
        }
        indices.push(index);
    }
    Ok(indices)
}
