//! Operator catalog
//!
//! Every operator is a builder function returning a `Builder`, plus three
//! rules used by the compiler:
//! - shape inference (output shape and how each operand is indexed),
//! - forward emission (IR statements computing the value at `index`),
//! - a backward rule (gradient contributions for each operand).
pub mod binary;
pub mod loss;
pub mod matmul;
pub mod movement;
pub mod norm;
pub mod reduce;
pub mod unary;

pub use binary::{BinaryOp, add, div, mult, sub};
pub use loss::{LossOp, binary_cross_entropy, cross_entropy, mean_squared_error};
pub use matmul::{dot, matmul};
pub use movement::{MovementOp, dropout, reshape, transpose};
pub use norm::{Norm, batch_norm, layer_norm};
pub use reduce::{Axis, ReduceOp, mean, mean_axis0, softmax, sum, sum_axis0};
pub use unary::{UnaryOp, exp, leaky_relu, log, relu, sigmoid, sqrt, tanh};

use crate::error::{GraphError, Result};
use crate::ir::{Expr, Stmt};
use crate::node::{Access, OpClass};

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Unary(UnaryOp),
    Binary(BinaryOp),
    Loss(LossOp),
    MatMul,
    Reduce(ReduceOp, Axis),
    Softmax,
    Movement(MovementOp),
    /// Element-wise product with a host-generated keep mask
    Dropout(f32),
    /// `x * gamma + beta` closing a normalization layer
    Affine(Norm),
}

impl Op {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Op::Unary(op) => op.name(),
            Op::Binary(op) => op.name(),
            Op::Loss(op) => op.name(),
            Op::MatMul => "matmul",
            Op::Reduce(op, _) => op.name(),
            Op::Softmax => "softmax",
            Op::Movement(op) => op.name(),
            Op::Dropout(_) => "dropout",
            Op::Affine(norm) => norm.name(),
        }
    }

    #[must_use]
    pub fn class(&self) -> OpClass {
        match self {
            Op::MatMul | Op::Reduce(..) | Op::Softmax => OpClass::Reduction,
            _ => OpClass::Regular,
        }
    }

    /// Output shape and per-operand access for the given operand shapes
    pub(crate) fn infer(&self, shapes: &[Vec<usize>]) -> Result<(Vec<usize>, Vec<Access>)> {
        match self {
            Op::Unary(_) | Op::Softmax => Ok((operand(shapes, 0).to_vec(), vec![Access::Aligned])),
            Op::Binary(_) | Op::Loss(_) => {
                broadcast(self.name(), operand(shapes, 0), operand(shapes, 1))
            }
            Op::MatMul => matmul::infer(operand(shapes, 0), operand(shapes, 1)),
            Op::Reduce(_, axis) => Ok((reduce::infer(operand(shapes, 0), *axis), vec![Access::Aligned])),
            Op::Movement(op) => op.infer(operand(shapes, 0)),
            Op::Dropout(_) => Ok((
                operand(shapes, 0).to_vec(),
                vec![Access::Aligned, Access::Aligned],
            )),
            Op::Affine(norm) => norm.infer(shapes),
        }
    }

    /// Statements computing the node's value into `out`
    pub(crate) fn forward(&self, out: &str, operands: &[Operand]) -> Vec<Stmt> {
        let x = |i: usize| operands[i].value();
        match self {
            Op::Unary(op) => vec![Stmt::let_(out, op.forward(x(0)))],
            Op::Binary(op) => vec![Stmt::let_(out, op.forward(x(0), x(1)))],
            Op::Loss(op) => vec![Stmt::let_(out, op.forward(x(0), x(1)))],
            Op::MatMul => matmul::forward(out, &operands[0], &operands[1]),
            Op::Reduce(op, axis) => reduce::forward(*op, *axis, out, &operands[0]),
            Op::Softmax => reduce::softmax_forward(out, &operands[0]),
            Op::Movement(_) => vec![Stmt::let_(out, x(0))],
            Op::Dropout(_) => vec![Stmt::let_(out, x(0) * x(1))],
            Op::Affine(_) => vec![Stmt::let_(out, x(0) * x(1) + x(2))],
        }
    }

    /// Gradient contribution of a Regular node to each operand, given the
    /// upstream gradient `g` at the current index. `None` means no gradient
    /// flows into that operand.
    pub(crate) fn gradients(&self, g: Expr, values: &mut dyn Values) -> Vec<Option<Expr>> {
        match self {
            Op::Unary(op) => vec![Some(op.gradient(g, values))],
            Op::Binary(op) => op.gradients(g, values),
            Op::Loss(op) => op.gradients(g, values),
            Op::Movement(_) => vec![Some(g)],
            Op::Dropout(_) => vec![Some(g * values.operand(1)), None],
            Op::Affine(_) => vec![
                Some(g.clone() * values.operand(1)),
                Some(g.clone() * values.operand(0)),
                Some(g),
            ],
            Op::MatMul | Op::Reduce(..) | Op::Softmax => Vec::new(),
        }
    }

    /// Gradient of a Reduction node with respect to operand `i`, evaluated at
    /// operand element `index`: statements plus the resulting value.
    pub(crate) fn reduction_gradient(&self, i: usize, grad: &ReductionGrad<'_>) -> (Vec<Stmt>, Expr) {
        match self {
            Op::MatMul => matmul::gradient(i, grad),
            Op::Reduce(op, axis) => reduce::gradient(*op, *axis, grad),
            Op::Softmax => reduce::softmax_gradient(grad),
            _ => (Vec::new(), Expr::f(0.0)),
        }
    }
}

fn operand(shapes: &[Vec<usize>], i: usize) -> &[usize] {
    shapes.get(i).map_or(&[1], Vec::as_slice)
}

/// Where an operand's value comes from inside one kernel
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Source {
    Const(f32),
    /// Computed earlier in the same kernel
    Var(String),
    /// Bound storage buffer
    Buffer(String),
}

#[derive(Debug, Clone)]
pub(crate) struct Operand {
    pub source: Source,
    pub access: Access,
    pub shape: Vec<usize>,
}

impl Operand {
    /// Value read by the current invocation
    pub fn value(&self) -> Expr {
        self.at(self.access.index())
    }

    /// Value at an arbitrary flat index (buffers only; locals and
    /// constants ignore the index)
    pub fn at(&self, index: Expr) -> Expr {
        match &self.source {
            Source::Const(v) => Expr::f(*v),
            Source::Var(name) => Expr::var(name.as_str()),
            Source::Buffer(name) => Expr::load(name.as_str(), index),
        }
    }
}

/// Lazy access to forward values from inside a backward kernel; asking for
/// a value may register a binding or ask the forward kernel to save it.
pub(crate) trait Values {
    /// Forward value of operand `i` at the current index
    fn operand(&mut self, i: usize) -> Expr;
    /// Forward value of the node itself at the current index
    fn output(&mut self) -> Expr;
}

/// Everything a Reduction backward rule can read
pub(crate) struct ReductionGrad<'a> {
    /// Prefix for local names, unique per gradient target
    pub prefix: String,
    pub operands: &'a [Operand],
    /// The node's own forward output
    pub output: Operand,
    pub shape: &'a [usize],
    /// Emits statements declaring `var` = upstream gradient at flat
    /// output index `at`, using `loop_var` for any fold it needs
    pub seed: &'a dyn Fn(&str, Expr, &str) -> Vec<Stmt>,
}

impl ReductionGrad<'_> {
    pub fn name(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.prefix)
    }
}

/// `(rows, cols)` of a 1-D or 2-D shape; vectors are single rows
pub(crate) fn as_matrix(shape: &[usize]) -> (usize, usize) {
    match shape {
        [] => (1, 1),
        [n] => (1, *n),
        [rows, cols] => (*rows, *cols),
        [rows, rest @ ..] => (*rows, rest.iter().product()),
    }
}

/// Drop leading unit dimensions, so `[1, C]` and `[C]` compare equal
fn without_leading_ones(shape: &[usize]) -> &[usize] {
    let start = shape.iter().take_while(|&&d| d == 1).count();
    &shape[start..]
}

/// Element-wise broadcasting between two operands.
///
/// Supports equal shapes (up to leading unit dimensions), a single-element scalar,
/// a `[C]`/`[1, C]` row against `[R, C]`, and a `[R, 1]` column against `[R, C]`.
pub(crate) fn broadcast(op: &'static str, a: &[usize], b: &[usize]) -> Result<(Vec<usize>, Vec<Access>)> {
    let size_a: usize = a.iter().product();
    let size_b: usize = b.iter().product();

    if a == b || without_leading_ones(a) == without_leading_ones(b) {
        return Ok((a.to_vec(), vec![Access::Aligned, Access::Aligned]));
    }
    if size_b == 1 {
        return Ok((a.to_vec(), vec![Access::Aligned, Access::Scalar { count: size_a }]));
    }
    if size_a == 1 {
        return Ok((b.to_vec(), vec![Access::Scalar { count: size_b }, Access::Aligned]));
    }
    if let Some(access) = row_or_col(a, b) {
        return Ok((a.to_vec(), vec![Access::Aligned, access]));
    }
    if let Some(access) = row_or_col(b, a) {
        return Ok((b.to_vec(), vec![access, Access::Aligned]));
    }
    Err(GraphError::ShapeMismatch {
        op,
        lhs: a.to_vec(),
        rhs: b.to_vec(),
    })
}

/// How `small` is repeated to cover the 2-D `full`
fn row_or_col(full: &[usize], small: &[usize]) -> Option<Access> {
    let [rows, cols] = *full else {
        return None;
    };
    match *small {
        [c] | [1, c] if c == cols => Some(Access::Row { rows, cols }),
        [r, 1] if r == rows => Some(Access::Col { cols }),
        _ => None,
    }
}
