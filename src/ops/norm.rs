//! Normalization layers, composed from primitives so the backward pass
//! follows the mean and variance as separate intermediate nodes.

use super::{Op, add, div, mean, mean_axis0, mult, sqrt, sub};
use crate::error::{GraphError, Result};
use crate::node::{Access, Arg, Builder};

/// Added to the variance before the square root
pub const NORM_EPSILON: f32 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Norm {
    /// Statistics over the batch (first) axis, one pair per feature column
    Batch,
    /// Statistics over the feature (last) axis, one pair per row
    Layer,
}

impl Norm {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Norm::Batch => "batch_norm",
            Norm::Layer => "layer_norm",
        }
    }

    /// `[x, gamma, beta]`: gamma and beta hold one value per feature column
    pub(crate) fn infer(self, shapes: &[Vec<usize>]) -> Result<(Vec<usize>, Vec<Access>)> {
        let x = shapes.first().cloned().unwrap_or_default();
        let (rows, cols) = super::as_matrix(&x);
        let mut access = vec![Access::Aligned];
        for shape in shapes.iter().skip(1) {
            if shape.iter().product::<usize>() != cols {
                return Err(GraphError::ShapeMismatch {
                    op: self.name(),
                    lhs: x.clone(),
                    rhs: shape.clone(),
                });
            }
            access.push(if rows == 1 {
                Access::Aligned
            } else {
                Access::Row { rows, cols }
            });
        }
        Ok((x, access))
    }
}

fn affine(norm: Norm, x: Builder, gamma: impl Into<Arg>, beta: impl Into<Arg>) -> Builder {
    Builder::new(Op::Affine(norm), vec![x.into(), gamma.into(), beta.into()])
}

/// Normalize each row of `[R, C]` over its `C` features, then scale and shift
pub fn layer_norm(x: impl Into<Arg>, gamma: impl Into<Arg>, beta: impl Into<Arg>) -> Builder {
    let x = x.into();
    let centered = sub(x.clone(), mean(x));
    let variance = mean(mult(&centered, &centered));
    let normalized = div(&centered, sqrt(add(variance, NORM_EPSILON)));
    affine(Norm::Layer, normalized, gamma, beta)
}

/// Normalize each feature column of `[R, C]` over the batch, then scale and shift
pub fn batch_norm(x: impl Into<Arg>, gamma: impl Into<Arg>, beta: impl Into<Arg>) -> Builder {
    let x = x.into();
    let centered = sub(x.clone(), mean_axis0(x));
    let variance = mean_axis0(mult(&centered, &centered));
    let normalized = div(&centered, sqrt(add(variance, NORM_EPSILON)));
    affine(Norm::Batch, normalized, gamma, beta)
}
