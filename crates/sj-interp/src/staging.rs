//! Staging pipeline: partial-evaluate once, execute the residual many times.
//!
//! `stage` splits a program against a Known/Unknown input mask; the folded
//! half runs immediately, the residual half runs per call via
//! `execute_staged` against the still-unknown arguments. Output stitching
//! restores the original declared output order.

use crate::partial_eval::{AbstractStatus, PartialEvalError, StagedSplit, partial_eval};
use crate::{InterpreterError, eval_program};
use sj_core::{Program, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagingError {
    PartialEval(PartialEvalError),
    ResidualEval(InterpreterError),
    DynamicArity { expected: usize, actual: usize },
    StitchArity { expected: usize, actual: usize },
}

impl std::fmt::Display for StagingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PartialEval(err) => write!(f, "staging: partial eval failed: {err}"),
            Self::ResidualEval(err) => write!(f, "staging: residual eval failed: {err}"),
            Self::DynamicArity { expected, actual } => write!(
                f,
                "staging: expected {} dynamic arguments, got {}",
                expected, actual
            ),
            Self::StitchArity { expected, actual } => write!(
                f,
                "staging: residual produced {} outputs, needed {}",
                actual, expected
            ),
        }
    }
}

impl std::error::Error for StagingError {}

impl From<PartialEvalError> for StagingError {
    fn from(value: PartialEvalError) -> Self {
        Self::PartialEval(value)
    }
}

/// Split a program for staged execution.
pub fn stage(
    program: &Program,
    inputs: &[AbstractStatus],
) -> Result<StagedSplit, StagingError> {
    Ok(partial_eval(program, inputs)?)
}

/// Execute the residual half of a staged split.
///
/// `dynamic_args` supplies values for the originally-unknown inputs, in
/// declared input order. Returns the full output list in the original
/// program's declared output order, folded values included.
pub fn execute_staged(
    split: &StagedSplit,
    dynamic_args: &[Value],
) -> Result<Vec<Value>, StagingError> {
    if dynamic_args.len() != split.residual.invars.len() {
        return Err(StagingError::DynamicArity {
            expected: split.residual.invars.len(),
            actual: dynamic_args.len(),
        });
    }

    let residual_outputs = if split.residual.outvars.is_empty() {
        Vec::new()
    } else {
        eval_program(&split.residual, dynamic_args).map_err(StagingError::ResidualEval)?
    };

    stitch_outputs(&split.folded_outputs, residual_outputs)
}

/// Interleave folded values with residual outputs in declared output order.
fn stitch_outputs(
    folded_outputs: &[Option<Value>],
    residual_outputs: Vec<Value>,
) -> Result<Vec<Value>, StagingError> {
    let deferred = folded_outputs.iter().filter(|slot| slot.is_none()).count();
    if residual_outputs.len() != deferred {
        return Err(StagingError::StitchArity {
            expected: deferred,
            actual: residual_outputs.len(),
        });
    }

    let mut residual_iter = residual_outputs.into_iter();
    Ok(folded_outputs
        .iter()
        .map(|slot| match slot {
            Some(value) => value.clone(),
            None => residual_iter
                .next()
                .expect("deferred-output count checked above"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::{AbstractStatus, execute_staged, stage};
    use crate::eval_program;
    use sj_core::{AbstractValue, Value, linear_chain_program, neg_mul_program, square_program};

    fn unknown_scalar() -> AbstractStatus {
        AbstractStatus::Unknown(AbstractValue::scalar_f64())
    }

    #[test]
    fn staged_neg_mul_matches_direct_evaluation() {
        let program = neg_mul_program();
        let split = stage(
            &program,
            &[AbstractStatus::known(Value::scalar_i64(5)), unknown_scalar()],
        )
        .expect("staging should succeed");

        let staged_out = execute_staged(&split, &[Value::scalar_i64(3)])
            .expect("staged execution should succeed");
        let direct_out = eval_program(&program, &[Value::scalar_i64(5), Value::scalar_i64(3)])
            .expect("direct evaluation should succeed");

        assert_eq!(staged_out, direct_out);
        assert_eq!(staged_out, vec![Value::scalar_i64(-15)]);
    }

    #[test]
    fn fully_folded_split_needs_no_dynamic_arguments() {
        let program = square_program();
        let split = stage(&program, &[AbstractStatus::known(Value::scalar_i64(4))])
            .expect("staging should succeed");
        assert!(split.is_fully_folded());

        let outputs = execute_staged(&split, &[]).expect("no dynamic args needed");
        assert_eq!(outputs, vec![Value::scalar_i64(16)]);
    }

    #[test]
    fn identity_split_replays_the_whole_program() {
        let program = linear_chain_program(10);
        let split = stage(&program, &[unknown_scalar()]).expect("staging should succeed");

        let outputs = execute_staged(&split, &[Value::scalar_i64(7)])
            .expect("staged execution should succeed");
        assert_eq!(outputs, vec![Value::scalar_i64(17)]);
    }

    #[test]
    fn dynamic_arity_is_checked() {
        let program = neg_mul_program();
        let split = stage(
            &program,
            &[AbstractStatus::known(Value::scalar_i64(5)), unknown_scalar()],
        )
        .expect("staging should succeed");
        let err = execute_staged(&split, &[]).expect_err("missing dynamic arg");
        assert!(matches!(
            err,
            super::StagingError::DynamicArity {
                expected: 1,
                actual: 0,
            }
        ));
    }
}
