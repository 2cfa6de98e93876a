//! Concrete evaluation of individual primitives.
//!
//! Scalar arithmetic stays integral while both operands are integral and the
//! operation is closed over the integers; everything else promotes to f64.
//! Elementwise primitives broadcast a scalar operand against a tensor operand
//! and require identical shapes for tensor/tensor application.

use sj_core::{Literal, Primitive, Shape, TensorValue, Value, ValueError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    Arity {
        primitive: Primitive,
        expected: usize,
        actual: usize,
    },
    NonNumericOperand {
        primitive: Primitive,
    },
    ShapeMismatch {
        primitive: Primitive,
        left: Shape,
        right: Shape,
    },
    RankUnsupported {
        primitive: Primitive,
        rank: usize,
    },
    Value(ValueError),
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Arity {
                primitive,
                expected,
                actual,
            } => write!(
                f,
                "{} expects {} operands, got {}",
                primitive.as_str(),
                expected,
                actual
            ),
            Self::NonNumericOperand { primitive } => {
                write!(f, "{} requires numeric operands", primitive.as_str())
            }
            Self::ShapeMismatch {
                primitive,
                left,
                right,
            } => write!(
                f,
                "{} shape mismatch: {:?} vs {:?}",
                primitive.as_str(),
                left.dims,
                right.dims
            ),
            Self::RankUnsupported { primitive, rank } => {
                write!(f, "{} does not support rank {}", primitive.as_str(), rank)
            }
            Self::Value(err) => write!(f, "value error: {err}"),
        }
    }
}

impl std::error::Error for EvalError {}

impl From<ValueError> for EvalError {
    fn from(value: ValueError) -> Self {
        Self::Value(value)
    }
}

/// Evaluate one primitive application over concrete operands.
pub fn eval_primitive(primitive: Primitive, inputs: &[Value]) -> Result<Value, EvalError> {
    match primitive {
        Primitive::Neg
        | Primitive::Abs
        | Primitive::Sign
        | Primitive::Exp
        | Primitive::Log
        | Primitive::Sqrt
        | Primitive::Sin
        | Primitive::Cos
        | Primitive::Tanh => {
            let [input] = expect_operands::<1>(primitive, inputs)?;
            map_unary(primitive, input)
        }
        Primitive::Add
        | Primitive::Sub
        | Primitive::Mul
        | Primitive::Div
        | Primitive::Max
        | Primitive::Min
        | Primitive::Pow => {
            let [left, right] = expect_operands::<2>(primitive, inputs)?;
            map_binary(primitive, left, right)
        }
        Primitive::Dot => {
            let [left, right] = expect_operands::<2>(primitive, inputs)?;
            eval_dot(left, right)
        }
        Primitive::ReduceSum => {
            let [input] = expect_operands::<1>(primitive, inputs)?;
            eval_reduce_sum(input)
        }
    }
}

fn expect_operands<const N: usize>(
    primitive: Primitive,
    inputs: &[Value],
) -> Result<[&Value; N], EvalError> {
    if inputs.len() != N {
        return Err(EvalError::Arity {
            primitive,
            expected: N,
            actual: inputs.len(),
        });
    }
    let mut out = [&inputs[0]; N];
    for (slot, value) in out.iter_mut().zip(inputs.iter()) {
        *slot = value;
    }
    Ok(out)
}

fn map_unary(primitive: Primitive, input: &Value) -> Result<Value, EvalError> {
    match input {
        Value::Scalar(lit) => Ok(Value::Scalar(unary_literal(primitive, *lit)?)),
        Value::Tensor(tensor) => {
            let elements = tensor
                .elements
                .iter()
                .map(|lit| unary_literal(primitive, *lit))
                .collect::<Result<Vec<_>, _>>()?;
            let dtype = elements.first().map_or(tensor.dtype, |lit| lit.dtype());
            Ok(Value::Tensor(TensorValue::new(
                dtype,
                tensor.shape.clone(),
                elements,
            )?))
        }
    }
}

fn map_binary(primitive: Primitive, left: &Value, right: &Value) -> Result<Value, EvalError> {
    match (left, right) {
        (Value::Scalar(a), Value::Scalar(b)) => {
            Ok(Value::Scalar(binary_literal(primitive, *a, *b)?))
        }
        (Value::Tensor(tensor), Value::Scalar(scalar)) => {
            let elements = tensor
                .elements
                .iter()
                .map(|lit| binary_literal(primitive, *lit, *scalar))
                .collect::<Result<Vec<_>, _>>()?;
            rebuild(tensor, elements)
        }
        (Value::Scalar(scalar), Value::Tensor(tensor)) => {
            let elements = tensor
                .elements
                .iter()
                .map(|lit| binary_literal(primitive, *scalar, *lit))
                .collect::<Result<Vec<_>, _>>()?;
            rebuild(tensor, elements)
        }
        (Value::Tensor(a), Value::Tensor(b)) => {
            if a.shape != b.shape {
                return Err(EvalError::ShapeMismatch {
                    primitive,
                    left: a.shape.clone(),
                    right: b.shape.clone(),
                });
            }
            let elements = a
                .elements
                .iter()
                .zip(b.elements.iter())
                .map(|(x, y)| binary_literal(primitive, *x, *y))
                .collect::<Result<Vec<_>, _>>()?;
            rebuild(a, elements)
        }
    }
}

fn rebuild(template: &TensorValue, elements: Vec<Literal>) -> Result<Value, EvalError> {
    let dtype = elements.first().map_or(template.dtype, |lit| lit.dtype());
    Ok(Value::Tensor(TensorValue::new(
        dtype,
        template.shape.clone(),
        elements,
    )?))
}

fn unary_literal(primitive: Primitive, lit: Literal) -> Result<Literal, EvalError> {
    if let Some(value) = lit.as_i64() {
        match primitive {
            Primitive::Neg => return Ok(Literal::I64(value.wrapping_neg())),
            Primitive::Abs => return Ok(Literal::I64(value.wrapping_abs())),
            Primitive::Sign => return Ok(Literal::I64(value.signum())),
            _ => {}
        }
    }

    let value = lit
        .as_f64()
        .ok_or(EvalError::NonNumericOperand { primitive })?;
    let result = match primitive {
        Primitive::Neg => -value,
        Primitive::Abs => value.abs(),
        Primitive::Sign => {
            if value == 0.0 {
                0.0
            } else {
                value.signum()
            }
        }
        Primitive::Exp => value.exp(),
        Primitive::Log => value.ln(),
        Primitive::Sqrt => value.sqrt(),
        Primitive::Sin => value.sin(),
        Primitive::Cos => value.cos(),
        Primitive::Tanh => value.tanh(),
        _ => unreachable!("non-unary primitive routed to unary_literal"),
    };
    Ok(Literal::from_f64(result))
}

fn binary_literal(primitive: Primitive, a: Literal, b: Literal) -> Result<Literal, EvalError> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        match primitive {
            Primitive::Add => return Ok(Literal::I64(x.wrapping_add(y))),
            Primitive::Sub => return Ok(Literal::I64(x.wrapping_sub(y))),
            Primitive::Mul => return Ok(Literal::I64(x.wrapping_mul(y))),
            Primitive::Max => return Ok(Literal::I64(x.max(y))),
            Primitive::Min => return Ok(Literal::I64(x.min(y))),
            // Div and Pow promote to float.
            _ => {}
        }
    }

    let x = a
        .as_f64()
        .ok_or(EvalError::NonNumericOperand { primitive })?;
    let y = b
        .as_f64()
        .ok_or(EvalError::NonNumericOperand { primitive })?;
    let result = match primitive {
        Primitive::Add => x + y,
        Primitive::Sub => x - y,
        Primitive::Mul => x * y,
        Primitive::Div => x / y,
        Primitive::Max => x.max(y),
        Primitive::Min => x.min(y),
        Primitive::Pow => x.powf(y),
        _ => unreachable!("non-binary primitive routed to binary_literal"),
    };
    Ok(Literal::from_f64(result))
}

fn eval_dot(left: &Value, right: &Value) -> Result<Value, EvalError> {
    let (Some(a), Some(b)) = (left.as_tensor(), right.as_tensor()) else {
        return Err(EvalError::NonNumericOperand {
            primitive: Primitive::Dot,
        });
    };
    if a.rank() != 1 {
        return Err(EvalError::RankUnsupported {
            primitive: Primitive::Dot,
            rank: a.rank(),
        });
    }
    if a.shape != b.shape {
        return Err(EvalError::ShapeMismatch {
            primitive: Primitive::Dot,
            left: a.shape.clone(),
            right: b.shape.clone(),
        });
    }

    if let (Some(xs), Some(ys)) = (a.to_i64_vec(), b.to_i64_vec()) {
        let sum = xs
            .iter()
            .zip(ys.iter())
            .fold(0_i64, |acc, (x, y)| acc.wrapping_add(x.wrapping_mul(*y)));
        return Ok(Value::scalar_i64(sum));
    }

    let xs = a.to_f64_vec().ok_or(EvalError::NonNumericOperand {
        primitive: Primitive::Dot,
    })?;
    let ys = b.to_f64_vec().ok_or(EvalError::NonNumericOperand {
        primitive: Primitive::Dot,
    })?;
    let sum = xs.iter().zip(ys.iter()).map(|(x, y)| x * y).sum::<f64>();
    Ok(Value::scalar_f64(sum))
}

fn eval_reduce_sum(input: &Value) -> Result<Value, EvalError> {
    let Some(tensor) = input.as_tensor() else {
        // Reducing a scalar is the identity.
        return Ok(input.clone());
    };

    if let Some(values) = tensor.to_i64_vec() {
        return Ok(Value::scalar_i64(
            values.iter().fold(0_i64, |acc, v| acc.wrapping_add(*v)),
        ));
    }

    let values = tensor.to_f64_vec().ok_or(EvalError::NonNumericOperand {
        primitive: Primitive::ReduceSum,
    })?;
    Ok(Value::scalar_f64(values.iter().sum()))
}
