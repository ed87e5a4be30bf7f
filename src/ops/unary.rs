use super::{Op, Values};
use crate::ir::Expr;
use crate::node::{Arg, Builder};

/// Unary operations: single input, single output
///
/// Each operation has a corresponding derivative:
/// - `ReLU`: d(max(0,x))/dx = x > 0 ? 1 : 0
/// - Sigmoid: d(σ(x))/dx = σ(x)·(1-σ(x))
/// - `LeakyReLU(α)`: x > 0 ? 1 : α
/// - Tanh: d(tanh(x))/dx = 1 - tanh²(x)
/// - Exp: d(eˣ)/dx = eˣ
/// - Log: d(ln(x))/dx = 1/x
/// - Sqrt: d(√x)/dx = 1/(2√x)
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Relu,
    Sigmoid,
    LeakyRelu(f32),
    Tanh,
    Exp,
    Log,
    Sqrt,
}

impl UnaryOp {
    pub(crate) fn name(self) -> &'static str {
        match self {
            UnaryOp::Relu => "relu",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::LeakyRelu(_) => "leaky_relu",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sqrt => "sqrt",
        }
    }

    pub(crate) fn forward(self, x: Expr) -> Expr {
        match self {
            UnaryOp::Relu => x.max(Expr::f(0.0)),
            UnaryOp::Sigmoid => Expr::f(1.0) / (Expr::f(1.0) + (-x).exp()),
            UnaryOp::LeakyRelu(alpha) => {
                Expr::select(x.clone().gt(Expr::f(0.0)), x.clone(), Expr::f(alpha) * x)
            }
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.log(),
            UnaryOp::Sqrt => x.sqrt(),
        }
    }

    /// Rules that depend on the output (sigmoid, tanh, exp, sqrt) read the
    /// saved forward value instead of recomputing it.
    pub(crate) fn gradient(self, g: Expr, values: &mut dyn Values) -> Expr {
        match self {
            UnaryOp::Relu => {
                let x = values.operand(0);
                Expr::select(x.gt(Expr::f(0.0)), g, Expr::f(0.0))
            }
            UnaryOp::Sigmoid => {
                let s = values.output();
                g * s.clone() * (Expr::f(1.0) - s)
            }
            UnaryOp::LeakyRelu(alpha) => {
                let x = values.operand(0);
                g * Expr::select(x.gt(Expr::f(0.0)), Expr::f(1.0), Expr::f(alpha))
            }
            UnaryOp::Tanh => {
                let t = values.output();
                g * (Expr::f(1.0) - t.clone() * t)
            }
            UnaryOp::Exp => g * values.output(),
            UnaryOp::Log => g / values.operand(0),
            UnaryOp::Sqrt => g / (Expr::f(2.0) * values.output()),
        }
    }
}

fn unary(op: UnaryOp, x: impl Into<Arg>) -> Builder {
    Builder::new(Op::Unary(op), vec![x.into()])
}

pub fn relu(x: impl Into<Arg>) -> Builder {
    unary(UnaryOp::Relu, x)
}

pub fn sigmoid(x: impl Into<Arg>) -> Builder {
    unary(UnaryOp::Sigmoid, x)
}

/// `x > 0 ? x : alpha * x`
pub fn leaky_relu(x: impl Into<Arg>, alpha: f32) -> Builder {
    unary(UnaryOp::LeakyRelu(alpha), x)
}

pub fn tanh(x: impl Into<Arg>) -> Builder {
    unary(UnaryOp::Tanh, x)
}

pub fn exp(x: impl Into<Arg>) -> Builder {
    unary(UnaryOp::Exp, x)
}

pub fn log(x: impl Into<Arg>) -> Builder {
    unary(UnaryOp::Log, x)
}

pub fn sqrt(x: impl Into<Arg>) -> Builder {
    unary(UnaryOp::Sqrt, x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_rendering() {
        let x = Expr::var("v0");
        assert_eq!(UnaryOp::Relu.forward(x.clone()).to_string(), "max(v0, 0.0)");
        assert_eq!(
            UnaryOp::Sigmoid.forward(x.clone()).to_string(),
            "(1.0 / (1.0 + exp((-v0))))"
        );
        assert_eq!(
            UnaryOp::LeakyRelu(0.1).forward(x).to_string(),
            "select((0.1 * v0), v0, (v0 > 0.0))"
        );
    }
}
