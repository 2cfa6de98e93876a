//! Local derivative rules, one entry per primitive kind.
//!
//! `local_derivatives` returns the partial derivative of a primitive's scalar
//! output with respect to each scalar input, evaluated at the recorded
//! forward values. Primitives without an entry (tensor-shaped reductions and
//! contractions) return `None`; using them under Grad is a configuration
//! error surfaced by the dispatcher.

use sj_core::Primitive;
use smallvec::{SmallVec, smallvec};

pub type Partials = SmallVec<[f64; 2]>;

/// Whether a primitive has a scalar derivative rule at all.
#[must_use]
pub fn has_scalar_rule(primitive: Primitive) -> bool {
    !matches!(primitive, Primitive::Dot | Primitive::ReduceSum)
}

#[must_use]
pub fn local_derivatives(primitive: Primitive, inputs: &[f64], output: f64) -> Option<Partials> {
    let partials = match primitive {
        Primitive::Add => smallvec![1.0, 1.0],
        Primitive::Sub => smallvec![1.0, -1.0],
        Primitive::Mul => smallvec![inputs[1], inputs[0]],
        Primitive::Div => {
            let (a, b) = (inputs[0], inputs[1]);
            smallvec![1.0 / b, -a / (b * b)]
        }
        Primitive::Neg => smallvec![-1.0],
        Primitive::Abs => smallvec![if inputs[0] < 0.0 { -1.0 } else { 1.0 }],
        Primitive::Sign => smallvec![0.0],
        Primitive::Max => {
            if inputs[0] >= inputs[1] {
                smallvec![1.0, 0.0]
            } else {
                smallvec![0.0, 1.0]
            }
        }
        Primitive::Min => {
            if inputs[0] <= inputs[1] {
                smallvec![1.0, 0.0]
            } else {
                smallvec![0.0, 1.0]
            }
        }
        Primitive::Pow => {
            let (a, b) = (inputs[0], inputs[1]);
            // d/da a^b = b * a^(b-1); d/db a^b = a^b * ln(a)
            smallvec![b * a.powf(b - 1.0), output * a.ln()]
        }
        Primitive::Exp => smallvec![output],
        Primitive::Log => smallvec![1.0 / inputs[0]],
        Primitive::Sqrt => smallvec![0.5 / output],
        Primitive::Sin => smallvec![inputs[0].cos()],
        Primitive::Cos => smallvec![-inputs[0].sin()],
        Primitive::Tanh => smallvec![1.0 - output * output],
        Primitive::Dot | Primitive::ReduceSum => return None,
    };
    Some(partials)
}
