#![forbid(unsafe_code)]

//! Traced-program representation: typed variables, literals, equations, and
//! the immutable [`Program`] consumed read-only by the staging and dispatch
//! layers.

use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

/// Cache-key policy for unrecognized request features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Unknown features are a fail-closed error before any key is hashed.
    Strict,
    /// Unknown features are folded into the cache key and execution proceeds.
    Hardened,
}

impl Mode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Hardened => "hardened",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    F64,
    I64,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<u32>,
}

impl Shape {
    #[must_use]
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    #[must_use]
    pub fn vector(len: u32) -> Self {
        Self { dims: vec![len] }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn element_count(&self) -> Option<u64> {
        self.dims
            .iter()
            .try_fold(1_u64, |acc, dim| acc.checked_mul(u64::from(*dim)))
    }
}

/// Dtype plus shape, without element data. Used for variables whose value is
/// not yet available during staging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbstractValue {
    pub dtype: DType,
    pub shape: Shape,
}

impl AbstractValue {
    #[must_use]
    pub fn scalar_f64() -> Self {
        Self {
            dtype: DType::F64,
            shape: Shape::scalar(),
        }
    }
}

/// The primitive operations the engine traces. Execution semantics live in
/// `sj-interp`; this crate only names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Primitive {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Abs,
    Sign,
    Max,
    Min,
    Pow,
    Exp,
    Log,
    Sqrt,
    Sin,
    Cos,
    Tanh,
    Dot,
    ReduceSum,
}

impl Primitive {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Neg => "neg",
            Self::Abs => "abs",
            Self::Sign => "sign",
            Self::Max => "max",
            Self::Min => "min",
            Self::Pow => "pow",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sqrt => "sqrt",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tanh => "tanh",
            Self::Dot => "dot",
            Self::ReduceSum => "reduce_sum",
        }
    }
}

/// A transform marker in a request's transform stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Transform {
    /// Staging + response caching. Repetition is idempotent.
    Jit,
    /// Reverse-mode differentiation with respect to argument `arg`.
    Grad { arg: usize },
    /// Batched mapping over the leading axis of every tensor argument.
    Vmap,
}

impl Transform {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jit => "jit",
            Self::Grad { .. } => "grad",
            Self::Vmap => "vmap",
        }
    }

    /// Two markers are the same kind if they differ only in parameters.
    #[must_use]
    pub fn same_kind(self, other: Self) -> bool {
        std::mem::discriminant(&self) == std::mem::discriminant(&other)
    }
}

/// Densely-allocated variable identifier, unique within one program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarId(pub u32);

/// Scalar literal. Floats are stored as bit patterns so literals hash and
/// compare exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    I64(i64),
    Bool(bool),
    F64Bits(u64),
}

impl Literal {
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self::F64Bits(value.to_bits())
    }

    #[must_use]
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::F64Bits(bits) => Some(f64::from_bits(bits)),
            Self::I64(value) => Some(value as f64),
            Self::Bool(_) => None,
        }
    }

    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::I64(value) => Some(value),
            Self::Bool(_) | Self::F64Bits(_) => None,
        }
    }

    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::I64(_) => DType::I64,
            Self::Bool(_) => DType::Bool,
            Self::F64Bits(_) => DType::F64,
        }
    }
}

/// A host-resident numeric value: either a rank-0 scalar or a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Scalar(Literal),
    Tensor(TensorValue),
}

impl Value {
    #[must_use]
    pub fn scalar_i64(value: i64) -> Self {
        Self::Scalar(Literal::I64(value))
    }

    #[must_use]
    pub fn scalar_f64(value: f64) -> Self {
        Self::Scalar(Literal::from_f64(value))
    }

    pub fn vector_i64(values: &[i64]) -> Result<Self, ValueError> {
        let elements = values.iter().copied().map(Literal::I64).collect::<Vec<_>>();
        Ok(Self::Tensor(TensorValue::new(
            DType::I64,
            Shape::vector(values.len() as u32),
            elements,
        )?))
    }

    pub fn vector_f64(values: &[f64]) -> Result<Self, ValueError> {
        let elements = values
            .iter()
            .copied()
            .map(Literal::from_f64)
            .collect::<Vec<_>>();
        Ok(Self::Tensor(TensorValue::new(
            DType::F64,
            Shape::vector(values.len() as u32),
            elements,
        )?))
    }

    #[must_use]
    pub fn as_scalar_literal(&self) -> Option<Literal> {
        match self {
            Self::Scalar(lit) => Some(*lit),
            Self::Tensor(_) => None,
        }
    }

    #[must_use]
    pub fn as_f64_scalar(&self) -> Option<f64> {
        self.as_scalar_literal().and_then(Literal::as_f64)
    }

    #[must_use]
    pub fn as_i64_scalar(&self) -> Option<i64> {
        self.as_scalar_literal().and_then(Literal::as_i64)
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            Self::Scalar(_) => None,
            Self::Tensor(tensor) => Some(tensor),
        }
    }

    #[must_use]
    pub fn is_scalar(&self) -> bool {
        matches!(self, Self::Scalar(_))
    }

    #[must_use]
    pub fn abstract_value(&self) -> AbstractValue {
        match self {
            Self::Scalar(lit) => AbstractValue {
                dtype: lit.dtype(),
                shape: Shape::scalar(),
            },
            Self::Tensor(tensor) => AbstractValue {
                dtype: tensor.dtype,
                shape: tensor.shape.clone(),
            },
        }
    }
}

/// Shape + dtype + flat element buffer. Element count is checked at
/// construction, never at use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorValue {
    pub dtype: DType,
    pub shape: Shape,
    pub elements: Vec<Literal>,
}

impl TensorValue {
    pub fn new(dtype: DType, shape: Shape, elements: Vec<Literal>) -> Result<Self, ValueError> {
        let expected_count = shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;

        if expected_count != elements.len() as u64 {
            return Err(ValueError::ElementCountMismatch {
                shape,
                expected_count,
                actual_count: elements.len(),
            });
        }

        Ok(Self {
            dtype,
            shape,
            elements,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    #[must_use]
    pub fn leading_dim(&self) -> Option<u32> {
        self.shape.dims.first().copied()
    }

    /// Extract the `index`-th slice along axis 0, lowering rank by one.
    pub fn slice_axis0(&self, index: usize) -> Result<Value, ValueError> {
        let axis_size = self
            .leading_dim()
            .ok_or(ValueError::RankZeroAxisSliceUnsupported)?;
        if index >= axis_size as usize {
            return Err(ValueError::SliceIndexOutOfBounds {
                index,
                axis_size: axis_size as usize,
            });
        }

        if self.rank() == 1 {
            return Ok(Value::Scalar(self.elements[index]));
        }

        let slice_len = self
            .shape
            .dims
            .iter()
            .skip(1)
            .try_fold(1_usize, |acc, dim| acc.checked_mul(*dim as usize))
            .ok_or(ValueError::ShapeOverflow {
                shape: self.shape.clone(),
            })?;

        let start = index * slice_len;
        let elements = self.elements[start..start + slice_len].to_vec();
        let subshape = Shape {
            dims: self.shape.dims[1..].to_vec(),
        };
        Ok(Value::Tensor(TensorValue::new(
            self.dtype, subshape, elements,
        )?))
    }

    /// Stack per-iteration outputs along a new leading axis, preserving order.
    pub fn stack_axis0(slices: &[Value]) -> Result<Self, ValueError> {
        if slices.is_empty() {
            return Err(ValueError::EmptyAxisStack);
        }

        match &slices[0] {
            Value::Scalar(first) => {
                let dtype = first.dtype();
                let mut elements = Vec::with_capacity(slices.len());
                elements.push(*first);
                for value in &slices[1..] {
                    let Value::Scalar(lit) = value else {
                        return Err(ValueError::MixedAxisStackKinds);
                    };
                    if lit.dtype() != dtype {
                        return Err(ValueError::AxisStackDTypeMismatch {
                            expected: dtype,
                            actual: lit.dtype(),
                        });
                    }
                    elements.push(*lit);
                }
                TensorValue::new(dtype, Shape::vector(slices.len() as u32), elements)
            }
            Value::Tensor(first) => {
                let mut elements = Vec::with_capacity(first.elements.len() * slices.len());
                elements.extend_from_slice(&first.elements);
                for value in &slices[1..] {
                    let Value::Tensor(tensor) = value else {
                        return Err(ValueError::MixedAxisStackKinds);
                    };
                    if tensor.shape != first.shape {
                        return Err(ValueError::AxisStackShapeMismatch {
                            expected: first.shape.clone(),
                            actual: tensor.shape.clone(),
                        });
                    }
                    if tensor.dtype != first.dtype {
                        return Err(ValueError::AxisStackDTypeMismatch {
                            expected: first.dtype,
                            actual: tensor.dtype,
                        });
                    }
                    elements.extend_from_slice(&tensor.elements);
                }

                let mut dims = Vec::with_capacity(first.shape.rank() + 1);
                dims.push(slices.len() as u32);
                dims.extend_from_slice(&first.shape.dims);
                TensorValue::new(first.dtype, Shape { dims }, elements)
            }
        }
    }

    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        self.elements.iter().copied().map(Literal::as_f64).collect()
    }

    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        self.elements.iter().copied().map(Literal::as_i64).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    ShapeOverflow {
        shape: Shape,
    },
    ElementCountMismatch {
        shape: Shape,
        expected_count: u64,
        actual_count: usize,
    },
    RankZeroAxisSliceUnsupported,
    SliceIndexOutOfBounds {
        index: usize,
        axis_size: usize,
    },
    EmptyAxisStack,
    MixedAxisStackKinds,
    AxisStackShapeMismatch {
        expected: Shape,
        actual: Shape,
    },
    AxisStackDTypeMismatch {
        expected: DType,
        actual: DType,
    },
}

impl std::fmt::Display for ValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeOverflow { shape } => {
                write!(f, "shape element count overflowed: {:?}", shape.dims)
            }
            Self::ElementCountMismatch {
                shape,
                expected_count,
                actual_count,
            } => {
                write!(
                    f,
                    "tensor element count mismatch for shape {:?}: expected {}, got {}",
                    shape.dims, expected_count, actual_count
                )
            }
            Self::RankZeroAxisSliceUnsupported => {
                write!(f, "cannot axis-slice rank-0 scalar tensor")
            }
            Self::SliceIndexOutOfBounds { index, axis_size } => {
                write!(
                    f,
                    "axis-slice index {} out of bounds for axis size {}",
                    index, axis_size
                )
            }
            Self::EmptyAxisStack => write!(f, "cannot stack empty slice list"),
            Self::MixedAxisStackKinds => write!(f, "cannot stack mixed scalar/tensor slice kinds"),
            Self::AxisStackShapeMismatch { expected, actual } => {
                write!(
                    f,
                    "stack shape mismatch: expected {:?}, got {:?}",
                    expected.dims, actual.dims
                )
            }
            Self::AxisStackDTypeMismatch { expected, actual } => {
                write!(
                    f,
                    "stack dtype mismatch: expected {:?}, got {:?}",
                    expected, actual
                )
            }
        }
    }
}

impl std::error::Error for ValueError {}

/// One equation operand: a variable reference or an inline scalar literal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Atom {
    Var(VarId),
    Lit(Literal),
}

/// One primitive application binding input operands to output variables.
/// Immutable; no effects beyond producing its declared outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equation {
    pub primitive: Primitive,
    pub inputs: SmallVec<[Atom; 4]>,
    pub outputs: SmallVec<[VarId; 2]>,
    pub params: BTreeMap<String, String>,
}

/// A traced program: ordered equations, declared inputs, a constant pool
/// (`constvars` bound to `consts`), and declared outputs.
///
/// Invariant: every variable referenced as an equation input is either a
/// declared input, a constant, or the output of an earlier equation. Checked
/// by [`Program::validate_well_formed`].
#[derive(Debug, Serialize, Deserialize)]
pub struct Program {
    pub invars: Vec<VarId>,
    pub constvars: Vec<VarId>,
    pub consts: Vec<Value>,
    pub outvars: Vec<VarId>,
    pub equations: Vec<Equation>,
    #[serde(skip)]
    fingerprint_cache: std::sync::OnceLock<String>,
}

impl Clone for Program {
    fn clone(&self) -> Self {
        Self {
            invars: self.invars.clone(),
            constvars: self.constvars.clone(),
            consts: self.consts.clone(),
            outvars: self.outvars.clone(),
            equations: self.equations.clone(),
            fingerprint_cache: std::sync::OnceLock::new(),
        }
    }
}

impl PartialEq for Program {
    fn eq(&self, other: &Self) -> bool {
        self.invars == other.invars
            && self.constvars == other.constvars
            && self.consts == other.consts
            && self.outvars == other.outvars
            && self.equations == other.equations
    }
}

impl Eq for Program {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramValidationError {
    DuplicateBinding { section: &'static str, var: VarId },
    ConstPoolArity { constvars: usize, consts: usize },
    UnboundInputVar { equation_index: usize, var: VarId },
    OutputShadowsBinding { equation_index: usize, var: VarId },
    UnknownOutvar { var: VarId },
}

impl std::fmt::Display for ProgramValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateBinding { section, var } => {
                write!(f, "duplicate binding in {} for var v{}", section, var.0)
            }
            Self::ConstPoolArity { constvars, consts } => {
                write!(
                    f,
                    "constant pool arity mismatch: {} constvars, {} consts",
                    constvars, consts
                )
            }
            Self::UnboundInputVar {
                equation_index,
                var,
            } => {
                write!(
                    f,
                    "equation {} references unbound input var v{}",
                    equation_index, var.0
                )
            }
            Self::OutputShadowsBinding {
                equation_index,
                var,
            } => {
                write!(
                    f,
                    "equation {} output var v{} shadows an existing binding",
                    equation_index, var.0
                )
            }
            Self::UnknownOutvar { var } => {
                write!(f, "outvar v{} does not have a defining binding", var.0)
            }
        }
    }
}

impl std::error::Error for ProgramValidationError {}

impl Program {
    #[must_use]
    pub fn new(
        invars: Vec<VarId>,
        outvars: Vec<VarId>,
        equations: Vec<Equation>,
    ) -> Self {
        Self::with_consts(invars, vec![], vec![], outvars, equations)
    }

    #[must_use]
    pub fn with_consts(
        invars: Vec<VarId>,
        constvars: Vec<VarId>,
        consts: Vec<Value>,
        outvars: Vec<VarId>,
        equations: Vec<Equation>,
    ) -> Self {
        Self {
            invars,
            constvars,
            consts,
            outvars,
            equations,
            fingerprint_cache: std::sync::OnceLock::new(),
        }
    }

    /// Largest variable identifier referenced anywhere in the program.
    /// Fresh identifiers allocated during staging start above this.
    #[must_use]
    pub fn max_var_id(&self) -> u32 {
        self.invars
            .iter()
            .chain(self.constvars.iter())
            .chain(self.outvars.iter())
            .chain(self.equations.iter().flat_map(|eqn| eqn.outputs.iter()))
            .chain(self.equations.iter().flat_map(|eqn| {
                eqn.inputs.iter().filter_map(|atom| match atom {
                    Atom::Var(var) => Some(var),
                    Atom::Lit(_) => None,
                })
            }))
            .map(|var| var.0)
            .max()
            .unwrap_or(0)
    }

    /// Canonical textual form of the program, computed once and cached.
    /// The cache-key builder hashes this string.
    #[must_use]
    pub fn canonical_fingerprint(&self) -> &str {
        self.fingerprint_cache.get_or_init(|| {
            let mut out = String::new();
            write_var_list(&mut out, "in", &self.invars);
            write_var_list(&mut out, "const", &self.constvars);
            for value in &self.consts {
                write_value(&mut out, value);
                out.push(';');
            }
            write_var_list(&mut out, "out", &self.outvars);

            for eqn in &self.equations {
                let _ = write!(&mut out, "eqn:{}(", eqn.primitive.as_str());
                for atom in &eqn.inputs {
                    write_atom(&mut out, atom);
                    out.push(',');
                }
                out.push_str(")->");
                for outvar in &eqn.outputs {
                    let _ = write!(&mut out, "v{},", outvar.0);
                }
                out.push('{');
                for (key, value) in &eqn.params {
                    let _ = write!(&mut out, "{key}={value};");
                }
                out.push('}');
                out.push('|');
            }

            out
        })
    }

    /// Check the no-forward-reference / single-assignment invariant.
    pub fn validate_well_formed(&self) -> Result<(), ProgramValidationError> {
        if self.constvars.len() != self.consts.len() {
            return Err(ProgramValidationError::ConstPoolArity {
                constvars: self.constvars.len(),
                consts: self.consts.len(),
            });
        }

        let mut bindings = BTreeSet::new();

        for var in &self.invars {
            if !bindings.insert(*var) {
                return Err(ProgramValidationError::DuplicateBinding {
                    section: "invars",
                    var: *var,
                });
            }
        }
        for var in &self.constvars {
            if !bindings.insert(*var) {
                return Err(ProgramValidationError::DuplicateBinding {
                    section: "constvars",
                    var: *var,
                });
            }
        }

        for (equation_index, eqn) in self.equations.iter().enumerate() {
            for atom in &eqn.inputs {
                if let Atom::Var(var) = atom
                    && !bindings.contains(var)
                {
                    return Err(ProgramValidationError::UnboundInputVar {
                        equation_index,
                        var: *var,
                    });
                }
            }
            for out_var in &eqn.outputs {
                if !bindings.insert(*out_var) {
                    return Err(ProgramValidationError::OutputShadowsBinding {
                        equation_index,
                        var: *out_var,
                    });
                }
            }
        }

        let mut seen_outvars = BTreeSet::new();
        for outvar in &self.outvars {
            if !seen_outvars.insert(*outvar) {
                return Err(ProgramValidationError::DuplicateBinding {
                    section: "outvars",
                    var: *outvar,
                });
            }
            if !bindings.contains(outvar) {
                return Err(ProgramValidationError::UnknownOutvar { var: *outvar });
            }
        }

        Ok(())
    }
}

fn write_var_list(out: &mut String, label: &str, vars: &[VarId]) {
    let _ = write!(out, "{label}=[");
    for var in vars {
        let _ = write!(out, "v{},", var.0);
    }
    out.push(']');
}

fn write_atom(out: &mut String, atom: &Atom) {
    match atom {
        Atom::Var(var) => {
            let _ = write!(out, "v{}", var.0);
        }
        Atom::Lit(lit) => write_literal(out, *lit),
    }
}

fn write_literal(out: &mut String, lit: Literal) {
    match lit {
        Literal::I64(value) => {
            let _ = write!(out, "i64:{value}");
        }
        Literal::Bool(value) => {
            let _ = write!(out, "bool:{value}");
        }
        Literal::F64Bits(value) => {
            let _ = write!(out, "f64bits:{value}");
        }
    }
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Scalar(lit) => write_literal(out, *lit),
        Value::Tensor(tensor) => {
            let _ = write!(out, "t:{:?}:{:?}:[", tensor.dtype, tensor.shape.dims);
            for element in &tensor.elements {
                write_literal(out, *element);
                out.push(',');
            }
            out.push(']');
        }
    }
}

/// Build a single-equation program `out = primitive(in)`.
#[must_use]
pub fn unary_program(primitive: Primitive) -> Program {
    Program::new(
        vec![VarId(1)],
        vec![VarId(2)],
        vec![Equation {
            primitive,
            inputs: smallvec![Atom::Var(VarId(1))],
            outputs: smallvec![VarId(2)],
            params: BTreeMap::new(),
        }],
    )
}

/// Build a single-equation program `out = primitive(a, b)`.
#[must_use]
pub fn binary_program(primitive: Primitive) -> Program {
    Program::new(
        vec![VarId(1), VarId(2)],
        vec![VarId(3)],
        vec![Equation {
            primitive,
            inputs: smallvec![Atom::Var(VarId(1)), Atom::Var(VarId(2))],
            outputs: smallvec![VarId(3)],
            params: BTreeMap::new(),
        }],
    )
}

/// `f(x) = x * x`.
#[must_use]
pub fn square_program() -> Program {
    Program::new(
        vec![VarId(1)],
        vec![VarId(2)],
        vec![Equation {
            primitive: Primitive::Mul,
            inputs: smallvec![Atom::Var(VarId(1)), Atom::Var(VarId(1))],
            outputs: smallvec![VarId(2)],
            params: BTreeMap::new(),
        }],
    )
}

/// `f(x) = x + 1`.
#[must_use]
pub fn add_one_program() -> Program {
    Program::new(
        vec![VarId(1)],
        vec![VarId(2)],
        vec![Equation {
            primitive: Primitive::Add,
            inputs: smallvec![Atom::Var(VarId(1)), Atom::Lit(Literal::I64(1))],
            outputs: smallvec![VarId(2)],
            params: BTreeMap::new(),
        }],
    )
}

/// `f(x, y) = neg(x) * y`.
#[must_use]
pub fn neg_mul_program() -> Program {
    Program::new(
        vec![VarId(1), VarId(2)],
        vec![VarId(4)],
        vec![
            Equation {
                primitive: Primitive::Neg,
                inputs: smallvec![Atom::Var(VarId(1))],
                outputs: smallvec![VarId(3)],
                params: BTreeMap::new(),
            },
            Equation {
                primitive: Primitive::Mul,
                inputs: smallvec![Atom::Var(VarId(2)), Atom::Var(VarId(3))],
                outputs: smallvec![VarId(4)],
                params: BTreeMap::new(),
            },
        ],
    )
}

/// A linear chain of `length` add-one equations with the final variable as
/// the single declared output. Used to exercise dead-code elimination and
/// staging at scale.
#[must_use]
pub fn linear_chain_program(length: u32) -> Program {
    let mut equations = Vec::with_capacity(length as usize);
    for step in 0..length {
        equations.push(Equation {
            primitive: Primitive::Add,
            inputs: smallvec![Atom::Var(VarId(step + 1)), Atom::Lit(Literal::I64(1))],
            outputs: smallvec![VarId(step + 2)],
            params: BTreeMap::new(),
        });
    }
    Program::new(vec![VarId(1)], vec![VarId(length + 1)], equations)
}

#[cfg(test)]
mod tests {
    use super::{
        Atom, DType, Equation, Literal, Primitive, Program, ProgramValidationError, Shape,
        TensorValue, Transform, Value, ValueError, VarId, add_one_program, binary_program,
        linear_chain_program, neg_mul_program, square_program, unary_program,
    };
    use smallvec::smallvec;
    use std::collections::BTreeMap;

    #[test]
    fn tensor_rejects_element_count_mismatch_at_construction() {
        let err = TensorValue::new(
            DType::I64,
            Shape { dims: vec![2, 2] },
            vec![Literal::I64(1), Literal::I64(2), Literal::I64(3)],
        )
        .expect_err("3 elements cannot fill a 2x2 shape");

        assert!(matches!(err, ValueError::ElementCountMismatch { .. }));
    }

    #[test]
    fn tensor_slice_axis0_lowers_rank() {
        let tensor = TensorValue::new(
            DType::I64,
            Shape { dims: vec![2, 2] },
            vec![
                Literal::I64(1),
                Literal::I64(2),
                Literal::I64(3),
                Literal::I64(4),
            ],
        )
        .expect("tensor should build");

        let row = tensor.slice_axis0(1).expect("slice should succeed");
        let row = row.as_tensor().expect("rank-2 slice yields rank-1 tensor");
        assert_eq!(row.shape, Shape::vector(2));
        assert_eq!(row.to_i64_vec(), Some(vec![3, 4]));
    }

    #[test]
    fn tensor_stack_axis0_restores_sliced_tensor() {
        let tensor = TensorValue::new(
            DType::I64,
            Shape { dims: vec![3] },
            vec![Literal::I64(7), Literal::I64(8), Literal::I64(9)],
        )
        .expect("tensor should build");

        let slices = (0..3)
            .map(|i| tensor.slice_axis0(i).expect("slice should succeed"))
            .collect::<Vec<_>>();
        let restacked = TensorValue::stack_axis0(&slices).expect("stack should succeed");
        assert_eq!(restacked, tensor);
    }

    #[test]
    fn stack_axis0_rejects_shape_mismatch() {
        let a = Value::vector_i64(&[1, 2]).expect("vector should build");
        let b = Value::vector_i64(&[1, 2, 3]).expect("vector should build");
        let err = TensorValue::stack_axis0(&[a, b]).expect_err("mismatched shapes must fail");
        assert!(matches!(err, ValueError::AxisStackShapeMismatch { .. }));
    }

    #[test]
    fn stack_axis0_rejects_mixed_dtypes() {
        let err = TensorValue::stack_axis0(&[Value::scalar_i64(1), Value::scalar_f64(2.0)])
            .expect_err("mixed scalar dtypes must fail");
        assert_eq!(
            err,
            ValueError::AxisStackDTypeMismatch {
                expected: DType::I64,
                actual: DType::F64,
            }
        );

        let a = Value::vector_i64(&[1, 2]).expect("vector should build");
        let b = Value::vector_f64(&[1.0, 2.0]).expect("vector should build");
        let err = TensorValue::stack_axis0(&[a, b]).expect_err("mixed tensor dtypes must fail");
        assert!(matches!(err, ValueError::AxisStackDTypeMismatch { .. }));
    }

    #[test]
    fn builders_produce_well_formed_programs() {
        for program in [
            unary_program(Primitive::Neg),
            binary_program(Primitive::Mul),
            square_program(),
            add_one_program(),
            neg_mul_program(),
            linear_chain_program(100),
        ] {
            program
                .validate_well_formed()
                .expect("builder output should be well-formed");
        }
    }

    #[test]
    fn validation_catches_forward_reference() {
        let program = Program::new(
            vec![VarId(1)],
            vec![VarId(3)],
            vec![
                Equation {
                    primitive: Primitive::Neg,
                    inputs: smallvec![Atom::Var(VarId(2))],
                    outputs: smallvec![VarId(3)],
                    params: BTreeMap::new(),
                },
                Equation {
                    primitive: Primitive::Neg,
                    inputs: smallvec![Atom::Var(VarId(1))],
                    outputs: smallvec![VarId(2)],
                    params: BTreeMap::new(),
                },
            ],
        );

        let err = program
            .validate_well_formed()
            .expect_err("forward reference must be rejected");
        assert_eq!(
            err,
            ProgramValidationError::UnboundInputVar {
                equation_index: 0,
                var: VarId(2),
            }
        );
    }

    #[test]
    fn validation_catches_const_pool_arity_mismatch() {
        let program = Program::with_consts(
            vec![VarId(1)],
            vec![VarId(2)],
            vec![],
            vec![VarId(1)],
            vec![],
        );
        let err = program
            .validate_well_formed()
            .expect_err("constvars without consts must be rejected");
        assert!(matches!(err, ProgramValidationError::ConstPoolArity { .. }));
    }

    #[test]
    fn fingerprint_is_stable_and_distinguishes_programs() {
        let square = square_program();
        let square_again = square_program();
        assert_eq!(
            square.canonical_fingerprint(),
            square_again.canonical_fingerprint()
        );

        let neg = unary_program(Primitive::Neg);
        assert_ne!(square.canonical_fingerprint(), neg.canonical_fingerprint());
    }

    #[test]
    fn fingerprint_covers_constant_pool() {
        let with_five = Program::with_consts(
            vec![VarId(1)],
            vec![VarId(2)],
            vec![Value::scalar_i64(5)],
            vec![VarId(2)],
            vec![],
        );
        let with_six = Program::with_consts(
            vec![VarId(1)],
            vec![VarId(2)],
            vec![Value::scalar_i64(6)],
            vec![VarId(2)],
            vec![],
        );
        assert_ne!(
            with_five.canonical_fingerprint(),
            with_six.canonical_fingerprint()
        );
    }

    #[test]
    fn transform_kinds_compare_by_discriminant() {
        assert!(Transform::Grad { arg: 0 }.same_kind(Transform::Grad { arg: 3 }));
        assert!(!Transform::Grad { arg: 0 }.same_kind(Transform::Vmap));
        assert_eq!(Transform::Grad { arg: 1 }.as_str(), "grad");
    }

    #[test]
    fn max_var_id_spans_all_sections() {
        let program = neg_mul_program();
        assert_eq!(program.max_var_id(), 4);
        assert_eq!(linear_chain_program(10).max_var_id(), 11);
    }

    #[test]
    fn literal_float_round_trips_bit_exact() {
        let lit = Literal::from_f64(0.1 + 0.2);
        assert_eq!(lit.as_f64(), Some(0.1 + 0.2));
        assert_eq!(lit, Literal::from_f64(0.1 + 0.2));
    }
}
