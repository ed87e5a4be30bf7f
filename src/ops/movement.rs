use super::Op;
use crate::error::{GraphError, Result};
use crate::node::{Access, Arg, Builder};

/// Movement operations rearrange elements without arithmetic
///
/// - Reshape: reinterprets the flat buffer; the gradient passes through
/// - Transpose: reads the operand through a permuted index; the gradient is
///   scattered back through the same permutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MovementOp {
    Reshape(Vec<usize>),
    Transpose,
}

impl MovementOp {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            MovementOp::Reshape(_) => "reshape",
            MovementOp::Transpose => "transpose",
        }
    }

    pub(crate) fn infer(&self, shape: &[usize]) -> Result<(Vec<usize>, Vec<Access>)> {
        match self {
            MovementOp::Reshape(new_shape) => {
                let old: usize = shape.iter().product();
                let new: usize = new_shape.iter().product();
                if old != new {
                    return Err(GraphError::ShapeMismatch {
                        op: "reshape",
                        lhs: shape.to_vec(),
                        rhs: new_shape.clone(),
                    });
                }
                Ok((new_shape.clone(), vec![Access::Aligned]))
            }
            MovementOp::Transpose => match *shape {
                [n] => Ok((vec![n, 1], vec![Access::Aligned])),
                [rows, cols] if rows == 1 || cols == 1 => {
                    Ok((vec![cols, rows], vec![Access::Aligned]))
                }
                [rows, cols] => Ok((vec![cols, rows], vec![Access::Permuted { rows, cols }])),
                _ => Err(GraphError::ShapeMismatch {
                    op: "transpose",
                    lhs: shape.to_vec(),
                    rhs: Vec::new(),
                }),
            },
        }
    }
}

/// Reinterpret `x` with a new shape of the same element count
pub fn reshape(x: impl Into<Arg>, shape: &[usize]) -> Builder {
    Builder::new(Op::Movement(MovementOp::Reshape(shape.to_vec())), vec![x.into()])
}

/// Swap the two axes of a 2-D operand
pub fn transpose(x: impl Into<Arg>) -> Builder {
    Builder::new(Op::Movement(MovementOp::Transpose), vec![x.into()])
}

/// Inverted dropout with drop probability `rate`.
///
/// Training runs draw a fresh keep mask on the host; `Graph::infer` runs
/// with an all-ones mask.
pub fn dropout(x: impl Into<Arg>, rate: f32) -> Builder {
    Builder::new(Op::Dropout(rate), vec![x.into()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reshape_checks_element_count() {
        let op = MovementOp::Reshape(vec![3, 2]);
        assert_eq!(op.infer(&[2, 3]).unwrap().0, vec![3, 2]);
        assert!(MovementOp::Reshape(vec![4]).infer(&[2, 3]).is_err());
    }

    #[test]
    fn test_transpose_access() {
        let (shape, access) = MovementOp::Transpose.infer(&[2, 3]).unwrap();
        assert_eq!(shape, vec![3, 2]);
        assert_eq!(access[0], Access::Permuted { rows: 2, cols: 3 });
    }
}
