use super::{Op, Operand, ReductionGrad, as_matrix};
use crate::ir::{Expr, Stmt};
use crate::node::{Arg, Builder};

/// Starting value of the running row maximum in softmax
const NEG_LARGE: f32 = -3.4e38;

/// Reductions fold one axis of a 1-D or 2-D operand to length 1
///
/// Gradients broadcast the upstream gradient back over the folded axis:
/// - Sum: dx[i] = g[fold(i)]
/// - Mean: dx[i] = g[fold(i)] / n
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// Trailing axis: `[R, C] -> [R, 1]`
    Last,
    /// Leading axis: `[R, C] -> [1, C]`
    First,
}

impl ReduceOp {
    pub(crate) fn name(self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Mean => "mean",
        }
    }
}

/// `(rows, cols)` as seen by the fold; a 1-D operand is folded entirely
fn fold_dims(shape: &[usize], axis: Axis) -> (usize, usize) {
    match (shape, axis) {
        ([n], Axis::First) => (*n, 1),
        _ => as_matrix(shape),
    }
}

pub(crate) fn infer(shape: &[usize], axis: Axis) -> Vec<usize> {
    match (shape.len(), axis) {
        (0 | 1, _) => vec![1],
        (_, Axis::Last) => vec![as_matrix(shape).0, 1],
        (_, Axis::First) => vec![1, as_matrix(shape).1],
    }
}

pub(crate) fn reduce(op: ReduceOp, axis: Axis, x: impl Into<Arg>) -> Builder {
    Builder::new(Op::Reduce(op, axis), vec![x.into()])
}

/// Sum over the last axis
pub fn sum(x: impl Into<Arg>) -> Builder {
    reduce(ReduceOp::Sum, Axis::Last, x)
}

/// Mean over the last axis
pub fn mean(x: impl Into<Arg>) -> Builder {
    reduce(ReduceOp::Mean, Axis::Last, x)
}

/// Sum over the first (batch) axis
pub fn sum_axis0(x: impl Into<Arg>) -> Builder {
    reduce(ReduceOp::Sum, Axis::First, x)
}

/// Mean over the first (batch) axis
pub fn mean_axis0(x: impl Into<Arg>) -> Builder {
    reduce(ReduceOp::Mean, Axis::First, x)
}

/// Softmax over the last axis
pub fn softmax(x: impl Into<Arg>) -> Builder {
    Builder::new(Op::Softmax, vec![x.into()])
}

pub(crate) fn forward(op: ReduceOp, axis: Axis, out: &str, x: &Operand) -> Vec<Stmt> {
    let (rows, cols) = fold_dims(&x.shape, axis);
    let acc = format!("{out}_acc");
    let k = format!("{out}_k");
    let kv = || Expr::var(k.as_str());
    let (count, at) = match axis {
        Axis::Last => (cols, Expr::Index * Expr::u(cols) + kv()),
        Axis::First => (rows, kv() * Expr::u(cols) + Expr::Index),
    };
    let result = match op {
        ReduceOp::Sum => Expr::var(acc.as_str()),
        ReduceOp::Mean => Expr::var(acc.as_str()) / Expr::f(count as f32),
    };
    vec![
        Stmt::var(acc.as_str(), Expr::f(0.0)),
        Stmt::For {
            var: k.clone(),
            count,
            body: vec![Stmt::accumulate(acc.as_str(), x.at(at))],
        },
        Stmt::let_(out, result),
    ]
}

pub(crate) fn gradient(op: ReduceOp, axis: Axis, grad: &ReductionGrad<'_>) -> (Vec<Stmt>, Expr) {
    let x = &grad.operands[0];
    let (rows, cols) = fold_dims(&x.shape, axis);
    let (at, count) = match axis {
        Axis::Last => (Expr::Index / Expr::u(cols), cols),
        Axis::First => (Expr::Index % Expr::u(cols), rows),
    };
    let g = grad.name("g");
    let stmts = (grad.seed)(&g, at, &grad.name("f"));
    let value = match op {
        ReduceOp::Sum => Expr::var(g),
        ReduceOp::Mean => Expr::var(g) / Expr::f(count as f32),
    };
    (stmts, value)
}

/// Row-max-shifted softmax; one invocation per element, each recomputing
/// its row's max and normalizer.
pub(crate) fn softmax_forward(out: &str, x: &Operand) -> Vec<Stmt> {
    let (_, cols) = as_matrix(&x.shape);
    let row = format!("{out}_row");
    let max = format!("{out}_max");
    let total = format!("{out}_sum");
    let k = format!("{out}_k");
    let at = || Expr::var(row.as_str()) + Expr::var(k.as_str());
    vec![
        Stmt::let_(row.as_str(), Expr::Index / Expr::u(cols) * Expr::u(cols)),
        Stmt::var(max.as_str(), Expr::f(NEG_LARGE)),
        Stmt::For {
            var: k.clone(),
            count: cols,
            body: vec![Stmt::Assign {
                name: max.clone(),
                value: Expr::var(max.as_str()).max(x.at(at())),
            }],
        },
        Stmt::var(total.as_str(), Expr::f(0.0)),
        Stmt::For {
            var: k.clone(),
            count: cols,
            body: vec![Stmt::accumulate(
                total.as_str(),
                (x.at(at()) - Expr::var(max.as_str())).exp(),
            )],
        },
        Stmt::let_(
            out,
            (x.at(Expr::Index) - Expr::var(max.as_str())).exp() / Expr::var(total.as_str()),
        ),
    ]
}

/// dx_i = s_i·(g_i - Σ_k g_k·s_k) over the row of `i`
pub(crate) fn softmax_gradient(grad: &ReductionGrad<'_>) -> (Vec<Stmt>, Expr) {
    let (_, cols) = as_matrix(grad.shape);
    let s = &grad.output;
    let row = grad.name("row");
    let gi = grad.name("gi");
    let gk = grad.name("gk");
    let acc = grad.name("acc");
    let k = grad.name("k");
    let at = || Expr::var(row.as_str()) + Expr::var(k.as_str());

    let mut stmts = vec![Stmt::let_(
        row.as_str(),
        Expr::Index / Expr::u(cols) * Expr::u(cols),
    )];
    stmts.extend((grad.seed)(&gi, Expr::Index, &grad.name("fi")));
    stmts.push(Stmt::var(acc.as_str(), Expr::f(0.0)));
    let mut body = (grad.seed)(&gk, at(), &grad.name("fk"));
    body.push(Stmt::accumulate(acc.as_str(), Expr::var(gk.as_str()) * s.at(at())));
    stmts.push(Stmt::For {
        var: k.clone(),
        count: cols,
        body,
    });
    let value = s.at(Expr::Index) * (Expr::var(gi) - Expr::var(acc));
    (stmts, value)
}
