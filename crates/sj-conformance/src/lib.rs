#![forbid(unsafe_code)]

//! Shared scaffolding for the conformance suites: tolerance assertions and
//! proptest strategies that generate well-formed two-input programs.

use proptest::prelude::*;
use sj_core::{Atom, Equation, Primitive, Program, Value, VarId};
use smallvec::smallvec;
use std::collections::BTreeMap;

pub fn assert_scalar_close(value: &Value, expected: f64, tolerance: f64) {
    let actual = value
        .as_f64_scalar()
        .unwrap_or_else(|| panic!("expected float scalar, got {value:?}"));
    assert!(
        (actual - expected).abs() <= tolerance,
        "expected {expected} within {tolerance}, got {actual}"
    );
}

/// Primitives safe over arbitrary integer operands. Division and the
/// transcendental family are excluded so generated programs never hit
/// domain errors during folding.
const CHAIN_PRIMITIVES: [Primitive; 7] = [
    Primitive::Add,
    Primitive::Sub,
    Primitive::Mul,
    Primitive::Neg,
    Primitive::Abs,
    Primitive::Max,
    Primitive::Min,
];

fn is_unary(primitive: Primitive) -> bool {
    matches!(primitive, Primitive::Neg | Primitive::Abs)
}

/// A random well-formed program over two declared inputs. Each step applies
/// one primitive to operands drawn from the variables bound so far, and the
/// final variable is the single declared output.
pub fn arb_two_input_program(max_len: usize) -> impl Strategy<Value = Program> {
    prop::collection::vec(
        (
            0..CHAIN_PRIMITIVES.len(),
            any::<prop::sample::Index>(),
            any::<prop::sample::Index>(),
        ),
        1..=max_len,
    )
    .prop_map(|steps| {
        let invars = vec![VarId(1), VarId(2)];
        let mut bound: Vec<VarId> = invars.clone();
        let mut next_id = 3_u32;
        let mut equations = Vec::with_capacity(steps.len());

        for (choice, left, right) in steps {
            let primitive = CHAIN_PRIMITIVES[choice];
            let mut inputs = smallvec![Atom::Var(*left.get(&bound))];
            if !is_unary(primitive) {
                inputs.push(Atom::Var(*right.get(&bound)));
            }

            let output = VarId(next_id);
            next_id += 1;
            equations.push(Equation {
                primitive,
                inputs,
                outputs: smallvec![output],
                params: BTreeMap::new(),
            });
            bound.push(output);
        }

        let outvar = *bound.last().expect("at least one equation");
        Program::new(invars, vec![outvar], equations)
    })
}

/// Scalar integer arguments kept small so folded chains stay readable in
/// failure output; the interpreter wraps on overflow either way.
pub fn arb_scalar_args() -> impl Strategy<Value = (Value, Value)> {
    (-50_i64..=50, -50_i64..=50)
        .prop_map(|(x, y)| (Value::scalar_i64(x), Value::scalar_i64(y)))
}
