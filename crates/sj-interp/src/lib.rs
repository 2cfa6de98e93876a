#![forbid(unsafe_code)]

//! Reference interpreter for traced programs.
//!
//! `eval_program` walks a program's equations in order against concrete
//! argument values. It is deterministic and side-effect-free; the dispatch
//! layer treats it as the base case once every transform has been peeled.

pub mod dce;
pub mod partial_eval;
pub mod rules;
pub mod staging;

mod primitives;

pub use primitives::{EvalError, eval_primitive};

use sj_core::{Atom, Program, Value, VarId};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpreterError {
    InputArity {
        expected: usize,
        actual: usize,
    },
    MissingVariable(VarId),
    UnexpectedOutputArity {
        primitive: sj_core::Primitive,
        actual: usize,
    },
    Primitive(EvalError),
}

impl std::fmt::Display for InterpreterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputArity { expected, actual } => {
                write!(
                    f,
                    "input arity mismatch: expected {}, got {}",
                    expected, actual
                )
            }
            Self::MissingVariable(var) => write!(f, "missing variable v{}", var.0),
            Self::UnexpectedOutputArity { primitive, actual } => write!(
                f,
                "expected single-output primitive {}, got {} outputs",
                primitive.as_str(),
                actual
            ),
            Self::Primitive(err) => write!(f, "primitive eval failed: {err}"),
        }
    }
}

impl std::error::Error for InterpreterError {}

impl From<EvalError> for InterpreterError {
    fn from(value: EvalError) -> Self {
        Self::Primitive(value)
    }
}

/// Evaluate a program on concrete arguments. The constant pool is seeded
/// into the environment before the first equation runs.
pub fn eval_program(program: &Program, args: &[Value]) -> Result<Vec<Value>, InterpreterError> {
    if args.len() != program.invars.len() {
        return Err(InterpreterError::InputArity {
            expected: program.invars.len(),
            actual: args.len(),
        });
    }

    let mut env: BTreeMap<VarId, Value> = BTreeMap::new();
    for (var, value) in program.constvars.iter().zip(program.consts.iter()) {
        env.insert(*var, value.clone());
    }
    for (var, value) in program.invars.iter().zip(args.iter()) {
        env.insert(*var, value.clone());
    }

    for eqn in &program.equations {
        if eqn.outputs.len() != 1 {
            return Err(InterpreterError::UnexpectedOutputArity {
                primitive: eqn.primitive,
                actual: eqn.outputs.len(),
            });
        }

        let mut resolved = Vec::with_capacity(eqn.inputs.len());
        for atom in &eqn.inputs {
            match atom {
                Atom::Var(var) => {
                    let value = env
                        .get(var)
                        .cloned()
                        .ok_or(InterpreterError::MissingVariable(*var))?;
                    resolved.push(value);
                }
                Atom::Lit(lit) => resolved.push(Value::Scalar(*lit)),
            }
        }

        let output = eval_primitive(eqn.primitive, &resolved)?;
        env.insert(eqn.outputs[0], output);
    }

    program
        .outvars
        .iter()
        .map(|var| {
            env.get(var)
                .cloned()
                .ok_or(InterpreterError::MissingVariable(*var))
        })
        .collect()
}
