//! Per-element losses. Each returns one loss value per prediction element;
//! average with `mean` when a scalar is wanted.

use super::{Op, Values};
use crate::ir::Expr;
use crate::node::{Arg, Builder};

/// Probabilities are clamped to `[EPSILON, 1 - EPSILON]` before `log`/division
pub const EPSILON: f32 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossOp {
    /// `(p - t)²`
    MeanSquaredError,
    /// `-(y·log p + (1-y)·log(1-p))`
    BinaryCrossEntropy,
    /// `-y·log p`, for softmax outputs against one-hot targets
    CrossEntropy,
}

fn clamped(p: Expr) -> Expr {
    p.clamp(EPSILON, 1.0 - EPSILON)
}

impl LossOp {
    pub(crate) fn name(self) -> &'static str {
        match self {
            LossOp::MeanSquaredError => "mean_squared_error",
            LossOp::BinaryCrossEntropy => "binary_cross_entropy",
            LossOp::CrossEntropy => "cross_entropy",
        }
    }

    pub(crate) fn forward(self, p: Expr, y: Expr) -> Expr {
        match self {
            LossOp::MeanSquaredError => {
                let d = p - y;
                d.clone() * d
            }
            LossOp::BinaryCrossEntropy => {
                let p = clamped(p);
                -(y.clone() * p.clone().log() + (Expr::f(1.0) - y) * (Expr::f(1.0) - p).log())
            }
            LossOp::CrossEntropy => -(y * clamped(p).log()),
        }
    }

    pub(crate) fn gradients(self, g: Expr, values: &mut dyn Values) -> Vec<Option<Expr>> {
        let p = values.operand(0);
        let y = values.operand(1);
        match self {
            LossOp::MeanSquaredError => {
                let d = Expr::f(2.0) * (p - y) * g;
                vec![Some(d.clone()), Some(-d)]
            }
            LossOp::BinaryCrossEntropy => {
                let p = clamped(p);
                vec![
                    Some(g.clone() * (p.clone() - y) / (p.clone() * (Expr::f(1.0) - p.clone()))),
                    Some(g * ((Expr::f(1.0) - p.clone()).log() - p.log())),
                ]
            }
            LossOp::CrossEntropy => {
                let p = clamped(p);
                vec![
                    Some(-(g.clone() * y / p.clone())),
                    Some(-(g * p.log())),
                ]
            }
        }
    }
}

fn loss(op: LossOp, predicted: impl Into<Arg>, target: impl Into<Arg>) -> Builder {
    Builder::new(Op::Loss(op), vec![predicted.into(), target.into()])
}

pub fn mean_squared_error(predicted: impl Into<Arg>, target: impl Into<Arg>) -> Builder {
    loss(LossOp::MeanSquaredError, predicted, target)
}

pub fn binary_cross_entropy(predicted: impl Into<Arg>, target: impl Into<Arg>) -> Builder {
    loss(LossOp::BinaryCrossEntropy, predicted, target)
}

pub fn cross_entropy(predicted: impl Into<Arg>, target: impl Into<Arg>) -> Builder {
    loss(LossOp::CrossEntropy, predicted, target)
}
