use super::{Op, Operand, ReduceOp, ReductionGrad, as_matrix};
use crate::error::{GraphError, Result};
use crate::ir::{Expr, Stmt};
use crate::node::{Access, Arg, Builder};

/// Matrix multiplication: C = A @ B
///
/// A is `[m, k]`, B is `[k, n]`; 1-D operands are single rows. One
/// invocation computes one element of C.
pub fn matmul(a: impl Into<Arg>, b: impl Into<Arg>) -> Builder {
    Builder::new(Op::MatMul, vec![a.into(), b.into()])
}

/// Inner product: `sum(a * b)` over the last axis
pub fn dot(a: impl Into<Arg>, b: impl Into<Arg>) -> Builder {
    super::reduce::reduce(ReduceOp::Sum, super::Axis::Last, super::mult(a, b))
}

pub(crate) fn infer(a: &[usize], b: &[usize]) -> Result<(Vec<usize>, Vec<Access>)> {
    let (m, k) = as_matrix(a);
    let (k2, n) = as_matrix(b);
    if k != k2 {
        return Err(GraphError::ShapeMismatch {
            op: "matmul",
            lhs: a.to_vec(),
            rhs: b.to_vec(),
        });
    }
    Ok((vec![m, n], vec![Access::Aligned, Access::Aligned]))
}

pub(crate) fn forward(out: &str, a: &Operand, b: &Operand) -> Vec<Stmt> {
    let (_, k) = as_matrix(&a.shape);
    let (_, n) = as_matrix(&b.shape);
    let row = format!("{out}_row");
    let col = format!("{out}_col");
    let acc = format!("{out}_acc");
    let i = format!("{out}_k");
    let iv = || Expr::var(i.as_str());
    vec![
        Stmt::let_(row.as_str(), Expr::Index / Expr::u(n)),
        Stmt::let_(col.as_str(), Expr::Index % Expr::u(n)),
        Stmt::var(acc.as_str(), Expr::f(0.0)),
        Stmt::For {
            var: i.clone(),
            count: k,
            body: vec![Stmt::accumulate(
                acc.as_str(),
                a.at(Expr::var(row.as_str()) * Expr::u(k) + iv())
                    * b.at(iv() * Expr::u(n) + Expr::var(col.as_str())),
            )],
        },
        Stmt::let_(out, Expr::var(acc.as_str())),
    ]
}

/// dA = G·Bᵗ, dB = Aᵗ·G
///
/// - dA[m, k] = Σ_n G[m, n]·B[k, n]
/// - dB[k, n] = Σ_m A[m, k]·G[m, n]
pub(crate) fn gradient(i: usize, grad: &ReductionGrad<'_>) -> (Vec<Stmt>, Expr) {
    let a = &grad.operands[0];
    let b = &grad.operands[1];
    let (m, k) = as_matrix(&a.shape);
    let (_, n) = as_matrix(&b.shape);

    let outer = grad.name("outer");
    let inner = grad.name("inner");
    let acc = grad.name("acc");
    let g = grad.name("g");
    let fold = grad.name("f");
    let step = || Expr::var(grad.name("j"));
    let outer_v = || Expr::var(outer.as_str());
    let inner_v = || Expr::var(inner.as_str());

    // dA walks its own [m, k] layout, dB its [k, n] layout
    let (cols, count) = if i == 0 { (k, n) } else { (n, m) };
    let (g_at, other) = if i == 0 {
        (outer_v() * Expr::u(n) + step(), b.at(inner_v() * Expr::u(n) + step()))
    } else {
        (step() * Expr::u(n) + inner_v(), a.at(step() * Expr::u(k) + outer_v()))
    };

    let mut body = (grad.seed)(&g, g_at, &fold);
    body.push(Stmt::accumulate(acc.as_str(), Expr::var(g.as_str()) * other));

    let stmts = vec![
        Stmt::let_(outer.as_str(), Expr::Index / Expr::u(cols)),
        Stmt::let_(inner.as_str(), Expr::Index % Expr::u(cols)),
        Stmt::var(acc.as_str(), Expr::f(0.0)),
        Stmt::For {
            var: grad.name("j"),
            count,
            body,
        },
    ];
    (stmts, Expr::var(acc))
}
