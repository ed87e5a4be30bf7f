//! Node model
//!
//! User code composes `Builder`s; `compile` lowers them into an arena of
//! `Node`s. A builder is a reference-counted call site: lowering the same
//! `Builder` (or any clone of it) twice yields the same `NodeId`, which is
//! what lets a shared subexpression be computed once and referenced twice.

use crate::ir::{Expr, Stmt};
use crate::ops::Op;
use crate::tensor::TensorId;
use std::rc::Rc;

/// An operand of an operator builder
#[derive(Debug, Clone)]
pub enum Arg {
    Constant(f32),
    Tensor(TensorId),
    Op(Builder),
}

impl From<f32> for Arg {
    fn from(value: f32) -> Self {
        Arg::Constant(value)
    }
}

impl From<TensorId> for Arg {
    fn from(id: TensorId) -> Self {
        Arg::Tensor(id)
    }
}

impl From<Builder> for Arg {
    fn from(builder: Builder) -> Self {
        Arg::Op(builder)
    }
}

impl From<&Builder> for Arg {
    fn from(builder: &Builder) -> Self {
        Arg::Op(builder.clone())
    }
}

#[derive(Debug)]
pub(crate) struct BuilderSite {
    pub op: Op,
    pub args: Vec<Arg>,
}

/// An operator applied to its arguments, not yet compiled.
///
/// Cloning a `Builder` keeps its identity.
#[derive(Debug, Clone)]
pub struct Builder(Rc<BuilderSite>);

impl Builder {
    pub(crate) fn new(op: Op, args: Vec<Arg>) -> Self {
        Builder(Rc::new(BuilderSite { op, args }))
    }

    #[must_use]
    pub fn op(&self) -> &Op {
        &self.0.op
    }

    pub(crate) fn args(&self) -> &[Arg] {
        &self.0.args
    }

    /// Identity of the call site
    pub(crate) fn key(&self) -> *const BuilderSite {
        Rc::as_ptr(&self.0)
    }

    /// Whether both handles refer to the same call site
    #[must_use]
    pub fn ptr_eq(&self, other: &Builder) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Partition label of an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    /// One invocation per output element, operands read at the same index
    Regular,
    /// One invocation folds over a whole axis of its operands
    Reduction,
}

/// How a consumer indexes an operand while computing element `index`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// Same element count, same flat index
    Aligned,
    /// Single element broadcast to every index
    Scalar { count: usize },
    /// `[C]` or `[1, C]` repeated over `rows` rows
    Row { rows: usize, cols: usize },
    /// `[R, 1]` repeated over `cols` columns
    Col { cols: usize },
    /// Transposed read of a `[rows, cols]` operand
    Permuted { rows: usize, cols: usize },
}

impl Access {
    /// Flat operand index read by invocation `index`
    pub fn index(&self) -> Expr {
        match *self {
            Access::Aligned => Expr::Index,
            Access::Scalar { .. } => Expr::u(0),
            Access::Row { cols, .. } => Expr::Index % Expr::u(cols),
            Access::Col { cols } => Expr::Index / Expr::u(cols),
            Access::Permuted { rows, cols } => {
                (Expr::Index % Expr::u(rows)) * Expr::u(cols) + Expr::Index / Expr::u(rows)
            }
        }
    }

    #[must_use]
    pub fn is_aligned(&self) -> bool {
        matches!(self, Access::Aligned)
    }

    /// Where a gradient partial for this operand is stored.
    ///
    /// A permutation is a bijection, so its partial is scattered back to the
    /// operand's own layout; every other access keeps the consumer's layout
    /// and is folded by the reader.
    pub fn partial_index(&self) -> Expr {
        match self {
            Access::Permuted { .. } => self.index(),
            _ => Expr::Index,
        }
    }

    /// Sum a partial gradient buffer (in the layout `partial_index` wrote)
    /// back down to operand element `at`.
    ///
    /// `acc` must already be declared; `loop_var` names the fold loop.
    pub fn fold_into(&self, acc: &str, partial: &str, at: Expr, loop_var: &str) -> Vec<Stmt> {
        let k = || Expr::var(loop_var);
        let read = |index: Expr| Stmt::accumulate(acc, Expr::load(partial, index));
        match *self {
            Access::Aligned | Access::Permuted { .. } => vec![read(at)],
            Access::Scalar { count } => vec![Stmt::For {
                var: loop_var.to_string(),
                count,
                body: vec![read(k())],
            }],
            Access::Row { rows, cols } => vec![Stmt::For {
                var: loop_var.to_string(),
                count: rows,
                body: vec![read(k() * Expr::u(cols) + at)],
            }],
            Access::Col { cols } => vec![Stmt::For {
                var: loop_var.to_string(),
                count: cols,
                body: vec![read(at * Expr::u(cols) + k())],
            }],
        }
    }

    /// Host-side counterpart of `fold_into`, adding `partial` into `grad`
    pub fn fold_host(&self, partial: &[f32], grad: &mut [f32]) {
        match *self {
            Access::Aligned | Access::Permuted { .. } => {
                for (g, p) in grad.iter_mut().zip(partial) {
                    *g += p;
                }
            }
            Access::Scalar { .. } => {
                if let Some(g) = grad.first_mut() {
                    *g += partial.iter().sum::<f32>();
                }
            }
            Access::Row { cols, .. } => {
                for (i, p) in partial.iter().enumerate() {
                    grad[i % cols] += p;
                }
            }
            Access::Col { cols } => {
                for (i, p) in partial.iter().enumerate() {
                    grad[i / cols] += p;
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NodeKind {
    Op(Op),
    Tensor(TensorId),
    Mask(usize),
    Constant(f32),
}

/// Arena entry produced by lowering a builder or a leaf
#[derive(Debug, Clone)]
pub(crate) struct Node {
    /// `v<N>`, unique within one compilation
    pub var: String,
    pub kind: NodeKind,
    pub operands: Vec<(NodeId, Access)>,
    pub class: OpClass,
    pub shape: Vec<usize>,
    /// Topological depth counted in materialized edges
    pub stage: usize,
    pub context: Option<usize>,
    /// Every node that reads this one, in lowering order
    pub consumers: Vec<NodeId>,
    /// Forward statements, filled during codegen
    pub code: Vec<Stmt>,
    /// Gradient accumulator name, reserved by the backward compiler
    pub grad_var: Option<String>,
}

impl Node {
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_computed(&self) -> bool {
        matches!(self.kind, NodeKind::Op(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::UnaryOp;

    #[test]
    fn test_clones_share_identity() {
        let a = Builder::new(Op::Unary(UnaryOp::Relu), vec![Arg::Constant(1.0)]);
        let b = a.clone();
        let c = Builder::new(Op::Unary(UnaryOp::Relu), vec![Arg::Constant(1.0)]);
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
    }

    #[test]
    fn test_host_folds() {
        // [2, 3] partial folded onto a [3] row operand
        let partial = [1.0, 2.0, 3.0, 10.0, 20.0, 30.0];
        let mut grad = vec![0.0; 3];
        Access::Row { rows: 2, cols: 3 }.fold_host(&partial, &mut grad);
        assert_eq!(grad, vec![11.0, 22.0, 33.0]);

        let mut grad = vec![0.0; 2];
        Access::Col { cols: 3 }.fold_host(&partial, &mut grad);
        assert_eq!(grad, vec![6.0, 60.0]);

        let mut grad = vec![0.0; 1];
        Access::Scalar { count: 6 }.fold_host(&partial, &mut grad);
        assert_eq!(grad, vec![66.0]);
    }

    #[test]
    fn test_permuted_index() {
        let access = Access::Permuted { rows: 2, cols: 3 };
        assert_eq!(
            access.index().to_string(),
            "(((index % 2u) * 3u) + (index / 2u))"
        );
    }
}
