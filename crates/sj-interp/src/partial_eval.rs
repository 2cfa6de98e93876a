//! Partial evaluation: split a program into a foldable-now part and a
//! deferred residual part, given a Known/Unknown split of its inputs.
//!
//! Equations whose operands are all Known are folded immediately through the
//! interpreter and their outputs recorded as Known. Any equation touching an
//! Unknown operand is deferred whole into the residual program, with its
//! variables renumbered into a range disjoint from the original program's
//! identifiers. Folded values the residual still needs travel in the
//! residual's constant pool.
//!
//! Roundtrip invariant, for every program P and every input vector x:
//! `eval(P, x) == stitch(folded_outputs, eval(residual, unknown_subset(x)))`.

use crate::primitives::{EvalError, eval_primitive};
use rustc_hash::FxHashMap;
use sj_core::{
    AbstractValue, Atom, DType, Equation, Primitive, Program, ProgramValidationError, Shape,
    Value, VarId,
};

/// Per-variable classification during partial evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum AbstractStatus {
    /// Concrete value available at staging time.
    Known(Value),
    /// Only a type signature is available; the value arrives later.
    Unknown(AbstractValue),
}

impl AbstractStatus {
    #[must_use]
    pub fn known(value: Value) -> Self {
        Self::Known(value)
    }

    /// Unknown status carrying the dtype and shape of `value` without the
    /// value itself.
    #[must_use]
    pub fn unknown_like(value: &Value) -> Self {
        Self::Unknown(value.abstract_value())
    }

    #[must_use]
    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }
}

/// Dense identifier-indexed status table, sized to the program's variable
/// count rather than its equation count.
#[derive(Debug)]
pub struct AbstractTracker {
    slots: Vec<Option<AbstractStatus>>,
}

impl AbstractTracker {
    #[must_use]
    pub fn for_max_id(max_var_id: u32) -> Self {
        Self {
            slots: vec![None; max_var_id as usize + 1],
        }
    }

    pub fn set_known(&mut self, var: VarId, value: Value) {
        self.slots[var.0 as usize] = Some(AbstractStatus::Known(value));
    }

    pub fn set_unknown(&mut self, var: VarId, aval: AbstractValue) {
        self.slots[var.0 as usize] = Some(AbstractStatus::Unknown(aval));
    }

    #[must_use]
    pub fn get(&self, var: VarId) -> Option<&AbstractStatus> {
        self.slots.get(var.0 as usize).and_then(Option::as_ref)
    }

    #[must_use]
    pub fn is_known(&self, var: VarId) -> bool {
        matches!(self.get(var), Some(AbstractStatus::Known(_)))
    }

    #[must_use]
    pub fn known_value(&self, var: VarId) -> Option<&Value> {
        match self.get(var) {
            Some(AbstractStatus::Known(value)) => Some(value),
            _ => None,
        }
    }
}

/// Result of splitting a program.
#[derive(Debug, Clone)]
pub struct StagedSplit {
    /// The folded evaluation trace: every equation that executed at staging
    /// time, as a program over the Known inputs.
    pub known: Program,

    /// Per original declared output: the folded value if it was Known, or
    /// `None` if the residual program produces it.
    pub folded_outputs: Vec<Option<Value>>,

    /// The deferred sub-program, renumbered into a disjoint identifier range
    /// and carrying folded values it consumes in its constant pool.
    pub residual: Program,

    /// Original unknown-input identifier → residual-program identifier, in
    /// declared input order. Callers feed concrete values for exactly these
    /// positions later.
    pub residual_inputs: Vec<(VarId, VarId)>,
}

impl StagedSplit {
    /// True when everything folded and no deferred work remains.
    #[must_use]
    pub fn is_fully_folded(&self) -> bool {
        self.residual.equations.is_empty() && self.residual.outvars.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartialEvalError {
    InputMaskMismatch {
        expected: usize,
        actual: usize,
    },
    Malformed(ProgramValidationError),
    FoldFailed {
        equation_index: usize,
        error: EvalError,
    },
    /// A residual equation referenced a variable that is neither a residual
    /// input nor an earlier residual output. Internal post-condition.
    DanglingResidualReference(VarId),
    ResidualMalformed(ProgramValidationError),
}

impl std::fmt::Display for PartialEvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputMaskMismatch { expected, actual } => write!(
                f,
                "known-input mask length mismatch: program has {} inputs, mask has {} entries",
                expected, actual
            ),
            Self::Malformed(err) => write!(f, "program not well-formed: {err}"),
            Self::FoldFailed {
                equation_index,
                error,
            } => write!(f, "folding equation {} failed: {}", equation_index, error),
            Self::DanglingResidualReference(var) => {
                write!(f, "residual equation references unmapped var v{}", var.0)
            }
            Self::ResidualMalformed(err) => {
                write!(f, "residual program failed validation: {err}")
            }
        }
    }
}

impl std::error::Error for PartialEvalError {}

/// Split `program` into a folded part and a residual part.
///
/// `inputs` aligns with the program's declared inputs: `Known(value)` marks
/// the input foldable with that concrete value, `Unknown(aval)` defers it
/// while carrying its dtype and shape through the split.
pub fn partial_eval(
    program: &Program,
    inputs: &[AbstractStatus],
) -> Result<StagedSplit, PartialEvalError> {
    if inputs.len() != program.invars.len() {
        return Err(PartialEvalError::InputMaskMismatch {
            expected: program.invars.len(),
            actual: inputs.len(),
        });
    }
    program
        .validate_well_formed()
        .map_err(PartialEvalError::Malformed)?;

    // Identity fast path: nothing to fold, residual is the program itself.
    if program.constvars.is_empty() && inputs.iter().all(|status| !status.is_known()) {
        return Ok(StagedSplit {
            known: Program::new(vec![], vec![], vec![]),
            folded_outputs: vec![None; program.outvars.len()],
            residual: program.clone(),
            residual_inputs: program.invars.iter().map(|var| (*var, *var)).collect(),
        });
    }

    let max_id = program.max_var_id();
    let mut tracker = AbstractTracker::for_max_id(max_id);

    for (var, value) in program.constvars.iter().zip(program.consts.iter()) {
        tracker.set_known(*var, value.clone());
    }
    for (var, status) in program.invars.iter().zip(inputs.iter()) {
        match status {
            AbstractStatus::Known(value) => tracker.set_known(*var, value.clone()),
            AbstractStatus::Unknown(aval) => tracker.set_unknown(*var, aval.clone()),
        }
    }

    let mut known_eqns: Vec<Equation> = Vec::new();
    let mut residual_indices: Vec<usize> = Vec::new();

    for (index, eqn) in program.equations.iter().enumerate() {
        let all_known = eqn.inputs.iter().all(|atom| match atom {
            Atom::Var(var) => tracker.is_known(*var),
            Atom::Lit(_) => true,
        });

        if all_known {
            let resolved = eqn
                .inputs
                .iter()
                .map(|atom| match atom {
                    Atom::Var(var) => tracker
                        .known_value(*var)
                        .cloned()
                        .expect("operand checked Known above"),
                    Atom::Lit(lit) => Value::Scalar(*lit),
                })
                .collect::<Vec<_>>();

            let folded = eval_primitive(eqn.primitive, &resolved).map_err(|error| {
                PartialEvalError::FoldFailed {
                    equation_index: index,
                    error,
                }
            })?;
            // Single-output folding; a mixed-output equation is never split.
            for out_var in &eqn.outputs {
                tracker.set_known(*out_var, folded.clone());
            }
            known_eqns.push(eqn.clone());
        } else {
            let operand_avals: Vec<AbstractValue> = eqn
                .inputs
                .iter()
                .map(|atom| operand_abstract_value(&tracker, atom))
                .collect();
            let out_aval = output_abstract_value(eqn.primitive, &operand_avals);
            for out_var in &eqn.outputs {
                tracker.set_unknown(*out_var, out_aval.clone());
            }
            residual_indices.push(index);
        }
    }

    // Known program: the folded evaluation trace.
    let known_invars: Vec<VarId> = program
        .invars
        .iter()
        .zip(inputs.iter())
        .filter(|(_, status)| status.is_known())
        .map(|(var, _)| *var)
        .collect();
    let known_outvars: Vec<VarId> = program
        .outvars
        .iter()
        .filter(|var| tracker.is_known(**var))
        .copied()
        .collect();
    let known = Program::with_consts(
        known_invars,
        program.constvars.clone(),
        program.consts.clone(),
        known_outvars,
        known_eqns,
    );

    let folded_outputs: Vec<Option<Value>> = program
        .outvars
        .iter()
        .map(|var| tracker.known_value(*var).cloned())
        .collect();

    // Residual renumbering: fresh identifiers start above every identifier
    // the original program uses, so the two address spaces never collide.
    let mut next_id = max_id + 1;
    let mut fresh = || {
        let id = VarId(next_id);
        next_id += 1;
        id
    };
    let mut remap: FxHashMap<VarId, VarId> = FxHashMap::default();

    let mut residual_invars: Vec<VarId> = Vec::new();
    let mut residual_inputs: Vec<(VarId, VarId)> = Vec::new();
    for (var, status) in program.invars.iter().zip(inputs.iter()) {
        if !status.is_known() {
            let new_var = fresh();
            remap.insert(*var, new_var);
            residual_invars.push(new_var);
            residual_inputs.push((*var, new_var));
        }
    }

    let mut residual_constvars: Vec<VarId> = Vec::new();
    let mut residual_consts: Vec<Value> = Vec::new();
    let mut residual_eqns: Vec<Equation> = Vec::with_capacity(residual_indices.len());

    for &index in &residual_indices {
        let eqn = &program.equations[index];
        let mut inputs = eqn.inputs.clone();
        for atom in inputs.iter_mut() {
            if let Atom::Var(var) = atom {
                if let Some(new_var) = remap.get(var) {
                    *var = *new_var;
                } else if let Some(value) = tracker.known_value(*var) {
                    // Folded value crossing into the residual: pin it in the
                    // residual's constant pool under a fresh identifier.
                    let new_var = fresh();
                    remap.insert(*var, new_var);
                    residual_constvars.push(new_var);
                    residual_consts.push(value.clone());
                    *var = new_var;
                } else {
                    return Err(PartialEvalError::DanglingResidualReference(*var));
                }
            }
        }

        let mut outputs = eqn.outputs.clone();
        for out_var in outputs.iter_mut() {
            let new_var = fresh();
            remap.insert(*out_var, new_var);
            *out_var = new_var;
        }

        residual_eqns.push(Equation {
            primitive: eqn.primitive,
            inputs,
            outputs,
            params: eqn.params.clone(),
        });
    }

    let mut residual_outvars: Vec<VarId> = Vec::new();
    for var in &program.outvars {
        if !tracker.is_known(*var) {
            let mapped = remap
                .get(var)
                .copied()
                .ok_or(PartialEvalError::DanglingResidualReference(*var))?;
            residual_outvars.push(mapped);
        }
    }

    let residual = Program::with_consts(
        residual_invars,
        residual_constvars,
        residual_consts,
        residual_outvars,
        residual_eqns,
    );

    // Post-condition: every residual reference resolves to a declared
    // residual input, a pool constant, or an earlier residual output.
    residual
        .validate_well_formed()
        .map_err(PartialEvalError::ResidualMalformed)?;

    Ok(StagedSplit {
        known,
        folded_outputs,
        residual,
        residual_inputs,
    })
}

fn operand_abstract_value(tracker: &AbstractTracker, atom: &Atom) -> AbstractValue {
    match atom {
        Atom::Var(var) => match tracker.get(*var) {
            Some(AbstractStatus::Known(value)) => value.abstract_value(),
            Some(AbstractStatus::Unknown(aval)) => aval.clone(),
            // Unreachable after validate_well_formed.
            None => AbstractValue::scalar_f64(),
        },
        Atom::Lit(lit) => AbstractValue {
            dtype: lit.dtype(),
            shape: Shape::scalar(),
        },
    }
}

/// Signature of a deferred equation's output: contractions collapse to a
/// scalar, elementwise primitives broadcast to the first tensor operand's
/// shape, and float-valued primitives (or any float operand) promote to F64.
fn output_abstract_value(primitive: Primitive, operands: &[AbstractValue]) -> AbstractValue {
    let promotes = matches!(
        primitive,
        Primitive::Div
            | Primitive::Pow
            | Primitive::Exp
            | Primitive::Log
            | Primitive::Sqrt
            | Primitive::Sin
            | Primitive::Cos
            | Primitive::Tanh
    );
    let dtype = if promotes || operands.iter().any(|aval| aval.dtype == DType::F64) {
        DType::F64
    } else {
        DType::I64
    };

    let shape = if matches!(primitive, Primitive::Dot | Primitive::ReduceSum) {
        Shape::scalar()
    } else {
        operands
            .iter()
            .map(|aval| &aval.shape)
            .find(|shape| shape.rank() > 0)
            .cloned()
            .unwrap_or_else(Shape::scalar)
    };

    AbstractValue { dtype, shape }
}

#[cfg(test)]
mod tests {
    use super::{AbstractStatus, PartialEvalError, output_abstract_value, partial_eval};
    use sj_core::{
        AbstractValue, DType, Primitive, Shape, Value, binary_program, linear_chain_program,
        neg_mul_program, unary_program,
    };

    fn unknown_scalar() -> AbstractStatus {
        AbstractStatus::Unknown(AbstractValue::scalar_f64())
    }

    #[test]
    fn all_known_folds_everything() {
        let program = neg_mul_program();
        let split = partial_eval(
            &program,
            &[
                AbstractStatus::known(Value::scalar_i64(5)),
                AbstractStatus::known(Value::scalar_i64(3)),
            ],
        )
        .expect("partial eval should succeed");

        assert!(split.is_fully_folded());
        assert_eq!(split.known.equations.len(), 2);
        assert_eq!(split.folded_outputs, vec![Some(Value::scalar_i64(-15))]);
    }

    #[test]
    fn all_unknown_is_identity() {
        let program = neg_mul_program();
        let split = partial_eval(&program, &[unknown_scalar(), unknown_scalar()])
            .expect("partial eval should succeed");

        assert!(split.known.equations.is_empty());
        assert_eq!(split.residual, program);
        assert_eq!(split.folded_outputs, vec![None]);
        // Identity fast path maps inputs to themselves.
        for (old, new) in &split.residual_inputs {
            assert_eq!(old, new);
        }
    }

    #[test]
    fn mixed_split_pins_folded_value_in_residual_pool() {
        // neg(x) folds with x known = 5; mul(y, neg_x) defers with y unknown.
        let program = neg_mul_program();
        let split = partial_eval(
            &program,
            &[AbstractStatus::known(Value::scalar_i64(5)), unknown_scalar()],
        )
        .expect("partial eval should succeed");

        assert_eq!(split.known.equations.len(), 1);
        assert_eq!(split.known.equations[0].primitive, Primitive::Neg);
        assert_eq!(split.residual.equations.len(), 1);
        assert_eq!(split.residual.equations[0].primitive, Primitive::Mul);
        assert_eq!(split.residual.consts, vec![Value::scalar_i64(-5)]);
        assert_eq!(split.residual_inputs.len(), 1);
    }

    #[test]
    fn residual_identifiers_are_disjoint_from_original() {
        let program = neg_mul_program();
        let original_max = program.max_var_id();
        let split = partial_eval(
            &program,
            &[AbstractStatus::known(Value::scalar_i64(5)), unknown_scalar()],
        )
        .expect("partial eval should succeed");

        let min_residual = split
            .residual
            .invars
            .iter()
            .chain(split.residual.constvars.iter())
            .chain(split.residual.outvars.iter())
            .map(|var| var.0)
            .min()
            .expect("residual has variables");
        assert!(min_residual > original_max);
        split
            .residual
            .validate_well_formed()
            .expect("residual must validate");
    }

    #[test]
    fn mask_length_is_checked() {
        let program = binary_program(Primitive::Add);
        let err = partial_eval(&program, &[unknown_scalar()]).expect_err("mask too short");
        assert_eq!(
            err,
            PartialEvalError::InputMaskMismatch {
                expected: 2,
                actual: 1,
            }
        );
    }

    #[test]
    fn unknown_chain_defers_every_equation() {
        let program = linear_chain_program(50);
        let split =
            partial_eval(&program, &[unknown_scalar()]).expect("partial eval should succeed");
        assert_eq!(split.residual.equations.len(), 50);
        assert!(split.known.equations.is_empty());
    }

    #[test]
    fn known_chain_folds_to_constant() {
        let program = linear_chain_program(50);
        let split = partial_eval(&program, &[AbstractStatus::known(Value::scalar_i64(0))])
            .expect("partial eval should succeed");
        assert!(split.is_fully_folded());
        assert_eq!(split.folded_outputs, vec![Some(Value::scalar_i64(50))]);
    }

    #[test]
    fn literal_operands_are_trivially_known() {
        let program = unary_program(Primitive::Neg);
        let split = partial_eval(&program, &[AbstractStatus::known(Value::scalar_i64(5))])
            .expect("partial eval should succeed");
        assert_eq!(split.folded_outputs, vec![Some(Value::scalar_i64(-5))]);
        assert!(split.residual.equations.is_empty());
    }

    #[test]
    fn unknown_like_preserves_shape_and_dtype() {
        let batch = Value::vector_i64(&[1, 2, 3]).expect("vector should build");
        let status = AbstractStatus::unknown_like(&batch);
        assert_eq!(
            status,
            AbstractStatus::Unknown(AbstractValue {
                dtype: DType::I64,
                shape: Shape { dims: vec![3] },
            })
        );
        assert!(!status.is_known());
    }

    #[test]
    fn deferred_outputs_inherit_operand_signatures() {
        let vector_f64 = AbstractValue {
            dtype: DType::F64,
            shape: Shape { dims: vec![4] },
        };
        let scalar_i64 = AbstractValue {
            dtype: DType::I64,
            shape: Shape::scalar(),
        };

        // Elementwise: tensor shape wins, any float operand promotes.
        let broadcast =
            output_abstract_value(Primitive::Add, &[vector_f64.clone(), scalar_i64.clone()]);
        assert_eq!(broadcast, vector_f64);

        // Integer-preserving primitive over integer scalars stays integer.
        let integral =
            output_abstract_value(Primitive::Add, &[scalar_i64.clone(), scalar_i64.clone()]);
        assert_eq!(integral.dtype, DType::I64);

        // Division promotes even over integer operands.
        let promoted = output_abstract_value(Primitive::Div, &[scalar_i64.clone(), scalar_i64]);
        assert_eq!(promoted.dtype, DType::F64);

        // Contractions collapse to a scalar signature.
        let contracted = output_abstract_value(Primitive::Dot, &[vector_f64.clone(), vector_f64]);
        assert_eq!(contracted.shape, Shape::scalar());
    }
}
