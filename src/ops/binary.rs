use super::{Op, Values};
use crate::ir::Expr;
use crate::node::{Arg, Builder};

/// Element-wise arithmetic with broadcasting
///
/// Gradients for `z = op(a, b)`:
/// - Add: (g, g)
/// - Sub: (g, -g)
/// - Mul: (g·b, g·a)
/// - Div: (g/b, -g·a/b²)
///
/// Broadcast operands receive the sum of their contributions over the
/// repeated axis; the backward compiler folds them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub(crate) fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mult",
            BinaryOp::Div => "div",
        }
    }

    pub(crate) fn forward(self, a: Expr, b: Expr) -> Expr {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }

    pub(crate) fn gradients(self, g: Expr, values: &mut dyn Values) -> Vec<Option<Expr>> {
        match self {
            BinaryOp::Add => vec![Some(g.clone()), Some(g)],
            BinaryOp::Sub => vec![Some(g.clone()), Some(-g)],
            BinaryOp::Mul => {
                let a = values.operand(0);
                let b = values.operand(1);
                vec![Some(g.clone() * b), Some(g * a)]
            }
            BinaryOp::Div => {
                let a = values.operand(0);
                let b = values.operand(1);
                vec![
                    Some(g.clone() / b.clone()),
                    Some(-(g * a) / (b.clone() * b)),
                ]
            }
        }
    }
}

fn binary(op: BinaryOp, a: impl Into<Arg>, b: impl Into<Arg>) -> Builder {
    Builder::new(Op::Binary(op), vec![a.into(), b.into()])
}

pub fn add(a: impl Into<Arg>, b: impl Into<Arg>) -> Builder {
    binary(BinaryOp::Add, a, b)
}

pub fn sub(a: impl Into<Arg>, b: impl Into<Arg>) -> Builder {
    binary(BinaryOp::Sub, a, b)
}

/// Element-wise product
pub fn mult(a: impl Into<Arg>, b: impl Into<Arg>) -> Builder {
    binary(BinaryOp::Mul, a, b)
}

pub fn div(a: impl Into<Arg>, b: impl Into<Arg>) -> Builder {
    binary(BinaryOp::Div, a, b)
}
