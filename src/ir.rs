//! Kernel IR
//!
//! Operators do not paste shader text together directly. They emit a small
//! statement IR (`Stmt`/`Expr`) that renders to WGSL for the GPU runtime and
//! is interpreted as-is by the CPU reference runtime, so both devices execute
//! exactly the same program.
//!
//! Every kernel has the same shape: one invocation per `index`, inputs bound
//! `read` first, outputs bound `read_write` after them.

use crate::config::WORKGROUP_SIZE;
use crate::error::{GraphError, Result};
use crate::tensor::TensorId;
use std::collections::BTreeSet;
use std::fmt::{self, Write};

/// Suffix appended to a buffer's base name when a kernel writes it
pub const OUTPUT_SUFFIX: &str = "_output";

/// `v3` -> `v3_output`
pub fn output_name(base: &str) -> String {
    format!("{base}{OUTPUT_SUFFIX}")
}

// ===== EXPRESSIONS =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryFn {
    Neg,
    Exp,
    Log,
    Sqrt,
    Tanh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFn {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Max,
    Lt,
    Gt,
    Ge,
}

/// An expression evaluated per invocation.
///
/// Values are either `f32` (tensor data) or `u32` (indices); comparisons
/// produce booleans that are only consumed by `Select`.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    F32(f32),
    U32(u32),
    /// The invocation index (`global_invocation_id.x`)
    Index,
    Var(String),
    Load {
        buffer: String,
        index: Box<Expr>,
    },
    Unary(UnaryFn, Box<Expr>),
    Binary(BinaryFn, Box<Expr>, Box<Expr>),
    Select {
        cond: Box<Expr>,
        on_true: Box<Expr>,
        on_false: Box<Expr>,
    },
    Clamp {
        value: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
    },
}

impl Expr {
    pub fn f(value: f32) -> Self {
        Expr::F32(value)
    }

    /// Index constant; shapes are static so sizes are baked in
    pub fn u(value: usize) -> Self {
        Expr::U32(value as u32)
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    pub fn load(buffer: impl Into<String>, index: Expr) -> Self {
        Expr::Load {
            buffer: buffer.into(),
            index: Box::new(index),
        }
    }

    fn unary(self, op: UnaryFn) -> Self {
        Expr::Unary(op, Box::new(self))
    }

    fn binary(self, op: BinaryFn, rhs: Expr) -> Self {
        Expr::Binary(op, Box::new(self), Box::new(rhs))
    }

    pub fn exp(self) -> Self {
        self.unary(UnaryFn::Exp)
    }

    pub fn log(self) -> Self {
        self.unary(UnaryFn::Log)
    }

    pub fn sqrt(self) -> Self {
        self.unary(UnaryFn::Sqrt)
    }

    pub fn tanh(self) -> Self {
        self.unary(UnaryFn::Tanh)
    }

    pub fn max(self, rhs: Expr) -> Self {
        self.binary(BinaryFn::Max, rhs)
    }

    pub fn gt(self, rhs: Expr) -> Self {
        self.binary(BinaryFn::Gt, rhs)
    }

    pub fn lt(self, rhs: Expr) -> Self {
        self.binary(BinaryFn::Lt, rhs)
    }

    pub fn ge(self, rhs: Expr) -> Self {
        self.binary(BinaryFn::Ge, rhs)
    }

    pub fn clamp(self, low: f32, high: f32) -> Self {
        Expr::Clamp {
            value: Box::new(self),
            low: Box::new(Expr::F32(low)),
            high: Box::new(Expr::F32(high)),
        }
    }

    /// `cond ? on_true : on_false`
    pub fn select(cond: Expr, on_true: Expr, on_false: Expr) -> Self {
        Expr::Select {
            cond: Box::new(cond),
            on_true: Box::new(on_true),
            on_false: Box::new(on_false),
        }
    }

    fn visit_loads<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Expr::F32(_) | Expr::U32(_) | Expr::Index | Expr::Var(_) => {}
            Expr::Load { buffer, index } => {
                out.insert(buffer);
                index.visit_loads(out);
            }
            Expr::Unary(_, x) => x.visit_loads(out),
            Expr::Binary(_, a, b) => {
                a.visit_loads(out);
                b.visit_loads(out);
            }
            Expr::Select {
                cond,
                on_true,
                on_false,
            } => {
                cond.visit_loads(out);
                on_true.visit_loads(out);
                on_false.visit_loads(out);
            }
            Expr::Clamp { value, low, high } => {
                value.visit_loads(out);
                low.visit_loads(out);
                high.visit_loads(out);
            }
        }
    }
}

impl std::ops::Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        self.binary(BinaryFn::Add, rhs)
    }
}

impl std::ops::Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        self.binary(BinaryFn::Sub, rhs)
    }
}

impl std::ops::Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        self.binary(BinaryFn::Mul, rhs)
    }
}

impl std::ops::Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        self.binary(BinaryFn::Div, rhs)
    }
}

impl std::ops::Rem for Expr {
    type Output = Expr;
    fn rem(self, rhs: Expr) -> Expr {
        self.binary(BinaryFn::Rem, rhs)
    }
}

impl std::ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        self.unary(UnaryFn::Neg)
    }
}

fn float_literal(value: f32) -> String {
    // Debug keeps a decimal point or exponent, which WGSL needs for floats
    let text = format!("{value:?}");
    if value.is_sign_negative() {
        format!("({text})")
    } else {
        text
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::F32(v) => write!(f, "{}", float_literal(*v)),
            Expr::U32(v) => write!(f, "{v}u"),
            Expr::Index => write!(f, "index"),
            Expr::Var(name) => write!(f, "{name}"),
            Expr::Load { buffer, index } => write!(f, "{buffer}[{index}]"),
            Expr::Unary(op, x) => match op {
                UnaryFn::Neg => write!(f, "(-{x})"),
                UnaryFn::Exp => write!(f, "exp({x})"),
                UnaryFn::Log => write!(f, "log({x})"),
                UnaryFn::Sqrt => write!(f, "sqrt({x})"),
                UnaryFn::Tanh => write!(f, "tanh({x})"),
            },
            Expr::Binary(op, a, b) => match op {
                BinaryFn::Add => write!(f, "({a} + {b})"),
                BinaryFn::Sub => write!(f, "({a} - {b})"),
                BinaryFn::Mul => write!(f, "({a} * {b})"),
                BinaryFn::Div => write!(f, "({a} / {b})"),
                BinaryFn::Rem => write!(f, "({a} % {b})"),
                BinaryFn::Max => write!(f, "max({a}, {b})"),
                BinaryFn::Lt => write!(f, "({a} < {b})"),
                BinaryFn::Gt => write!(f, "({a} > {b})"),
                BinaryFn::Ge => write!(f, "({a} >= {b})"),
            },
            Expr::Select {
                cond,
                on_true,
                on_false,
            } => write!(f, "select({on_false}, {on_true}, {cond})"),
            Expr::Clamp { value, low, high } => write!(f, "clamp({value}, {low}, {high})"),
        }
    }
}

// ===== STATEMENTS =====

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let { name: String, value: Expr },
    Var { name: String, value: Expr },
    Assign { name: String, value: Expr },
    Store {
        buffer: String,
        index: Expr,
        value: Expr,
    },
    /// `for (var var = 0u; var < count; var = var + 1u)`
    For {
        var: String,
        count: usize,
        body: Vec<Stmt>,
    },
    If { cond: Expr, body: Vec<Stmt> },
    Return,
}

impl Stmt {
    pub fn let_(name: impl Into<String>, value: Expr) -> Self {
        Stmt::Let {
            name: name.into(),
            value,
        }
    }

    pub fn var(name: impl Into<String>, value: Expr) -> Self {
        Stmt::Var {
            name: name.into(),
            value,
        }
    }

    /// `name = name + value`
    pub fn accumulate(name: impl Into<String>, value: Expr) -> Self {
        let name = name.into();
        Stmt::Assign {
            value: Expr::Var(name.clone()) + value,
            name,
        }
    }

    pub fn store(buffer: impl Into<String>, index: Expr, value: Expr) -> Self {
        Stmt::Store {
            buffer: buffer.into(),
            index,
            value,
        }
    }

    fn visit_buffers<'a>(&'a self, loads: &mut BTreeSet<&'a str>, stores: &mut BTreeSet<&'a str>) {
        match self {
            Stmt::Let { value, .. } | Stmt::Var { value, .. } | Stmt::Assign { value, .. } => {
                value.visit_loads(loads);
            }
            Stmt::Store {
                buffer,
                index,
                value,
            } => {
                stores.insert(buffer);
                index.visit_loads(loads);
                value.visit_loads(loads);
            }
            Stmt::For { body, .. } => {
                for stmt in body {
                    stmt.visit_buffers(loads, stores);
                }
            }
            Stmt::If { cond, body } => {
                cond.visit_loads(loads);
                for stmt in body {
                    stmt.visit_buffers(loads, stores);
                }
            }
            Stmt::Return => {}
        }
    }
}

fn render_block(stmts: &[Stmt], depth: usize, out: &mut String) {
    let pad = "    ".repeat(depth);
    for stmt in stmts {
        // Writing into a String cannot fail
        let _ = match stmt {
            Stmt::Let { name, value } => writeln!(out, "{pad}let {name} = {value};"),
            Stmt::Var { name, value } => writeln!(out, "{pad}var {name} = {value};"),
            Stmt::Assign { name, value } => writeln!(out, "{pad}{name} = {value};"),
            Stmt::Store {
                buffer,
                index,
                value,
            } => writeln!(out, "{pad}{buffer}[{index}] = {value};"),
            Stmt::For { var, count, body } => {
                let _ = writeln!(
                    out,
                    "{pad}for (var {var} = 0u; {var} < {count}u; {var} = {var} + 1u) {{"
                );
                render_block(body, depth + 1, out);
                writeln!(out, "{pad}}}")
            }
            Stmt::If { cond, body } => {
                let _ = writeln!(out, "{pad}if {cond} {{");
                render_block(body, depth + 1, out);
                writeln!(out, "{pad}}}")
            }
            Stmt::Return => writeln!(out, "{pad}return;"),
        };
    }
}

// ===== BINDINGS =====

/// Where the buffer behind a binding comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSource {
    /// Graph-owned parameter or input buffer, shared by every kernel
    Tensor(TensorId),
    /// Graph-owned dropout mask
    Mask(usize),
    /// Owned by the kernel; outputs, or inputs filled by copies
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub name: String,
    /// Element count
    pub len: usize,
    pub source: BufferSource,
}

/// Ordered name -> slot registry; slots are assigned on first use
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    entries: Vec<Binding>,
}

impl Bindings {
    /// Register `name` if it is new and return its slot
    pub fn register(&mut self, name: &str, len: usize, source: BufferSource) -> usize {
        if let Some(slot) = self.slot(name) {
            return slot;
        }
        self.entries.push(Binding {
            name: name.to_string(),
            len,
            source,
        });
        self.entries.len() - 1
    }

    pub fn slot(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|b| b.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.entries.iter().find(|b| b.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slot(name).is_some()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Binding> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|b| b.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn retain(&mut self, keep: impl Fn(&Binding) -> bool) {
        self.entries.retain(keep);
    }
}

// ===== KERNEL SPEC =====

/// A complete, device-independent kernel: bindings plus a body that runs
/// once per index in `0..size`.
#[derive(Debug, Clone)]
pub struct KernelSpec {
    pub label: String,
    pub size: usize,
    pub inputs: Bindings,
    pub outputs: Bindings,
    pub body: Vec<Stmt>,
}

impl KernelSpec {
    /// Assemble a kernel, checking that every buffer the body touches is bound.
    ///
    /// Registered buffers the body never touches are dropped, since the
    /// pipeline layout is inferred from the shader and would not contain them.
    /// # Errors
    /// `BindingResolution` if the body reads an unregistered input or writes
    /// an unregistered output
    pub fn new(
        label: impl Into<String>,
        size: usize,
        mut inputs: Bindings,
        mut outputs: Bindings,
        body: Vec<Stmt>,
    ) -> Result<Self> {
        let label = label.into();
        let mut loads = BTreeSet::new();
        let mut stores = BTreeSet::new();
        for stmt in &body {
            stmt.visit_buffers(&mut loads, &mut stores);
        }

        if let Some(name) = loads.iter().find(|n| !inputs.contains(n)) {
            return Err(GraphError::BindingResolution {
                kernel: label,
                name: name.to_string(),
            });
        }
        if let Some(name) = stores.iter().find(|n| !outputs.contains(n)) {
            return Err(GraphError::BindingResolution {
                kernel: label,
                name: name.to_string(),
            });
        }

        for b in inputs.iter().filter(|b| !loads.contains(b.name.as_str())) {
            log::debug!("{label}: dropping unused input `{}`", b.name);
        }
        inputs.retain(|b| loads.contains(b.name.as_str()));
        outputs.retain(|b| stores.contains(b.name.as_str()));

        Ok(Self {
            label,
            size,
            inputs,
            outputs,
            body,
        })
    }

    /// Number of workgroups needed to cover `size` invocations
    #[must_use]
    pub fn workgroups(&self) -> u32 {
        self.size.div_ceil(WORKGROUP_SIZE) as u32
    }

    /// Render the kernel as a WGSL compute shader
    #[must_use]
    pub fn wgsl(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "// {}", self.label);
        for (slot, b) in self.inputs.iter().enumerate() {
            let _ = writeln!(
                out,
                "@group(0) @binding({slot}) var<storage, read> {}: array<f32>;",
                b.name
            );
        }
        let offset = self.inputs.len();
        for (slot, b) in self.outputs.iter().enumerate() {
            let _ = writeln!(
                out,
                "@group(0) @binding({}) var<storage, read_write> {}: array<f32>;",
                offset + slot,
                b.name
            );
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "@compute @workgroup_size({WORKGROUP_SIZE})");
        let _ = writeln!(
            out,
            "fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{"
        );
        let _ = writeln!(out, "    let index = gid.x;");
        render_block(&self.body, 1, &mut out);
        let _ = writeln!(out, "}}");
        out
    }
}

/// Guard clause every kernel starts with
pub fn bounds_guard(size: usize) -> Stmt {
    Stmt::If {
        cond: Expr::Index.ge(Expr::u(size)),
        body: vec![Stmt::Return],
    }
}
