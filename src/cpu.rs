//! Reference runtime: interprets the kernel IR on the host.
//!
//! Every kernel is run for `workgroups * 64` invocations, one after the
//! other, so the results match what a device produces for race-free
//! kernels. Like robust buffer access on a device, out-of-range loads read
//! 0.0 and out-of-range stores are dropped.

use crate::config::WORKGROUP_SIZE;
use crate::error::{GraphError, Result};
use crate::ir::{BinaryFn, BufferSource, Expr, KernelSpec, Stmt, UnaryFn};
use crate::runtime::{Executor, Plan, Readback};
use crate::tensor::{TensorId, TensorStore};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    F(f32),
    U(u32),
    B(bool),
}

impl Value {
    fn f32(self) -> Result<f32> {
        match self {
            Value::F(v) => Ok(v),
            other => Err(GraphError::Interpreter(format!("expected f32, got {other:?}"))),
        }
    }

    fn u32(self) -> Result<u32> {
        match self {
            Value::U(v) => Ok(v),
            other => Err(GraphError::Interpreter(format!("expected u32, got {other:?}"))),
        }
    }

    fn bool(self) -> Result<bool> {
        match self {
            Value::B(v) => Ok(v),
            other => Err(GraphError::Interpreter(format!("expected bool, got {other:?}"))),
        }
    }
}

enum Flow {
    Next,
    Return,
}

/// State of one invocation
struct Invocation<'k> {
    index: u32,
    env: HashMap<&'k str, Value>,
    inputs: &'k HashMap<&'k str, &'k [f32]>,
    outputs: &'k mut HashMap<String, Vec<f32>>,
}

impl<'k> Invocation<'k> {
    fn eval(&self, expr: &Expr) -> Result<Value> {
        Ok(match expr {
            Expr::F32(v) => Value::F(*v),
            Expr::U32(v) => Value::U(*v),
            Expr::Index => Value::U(self.index),
            Expr::Var(name) => *self
                .env
                .get(name.as_str())
                .ok_or_else(|| GraphError::Interpreter(format!("unknown variable `{name}`")))?,
            Expr::Load { buffer, index } => {
                let i = self.eval(index)?.u32()? as usize;
                let data = match self.inputs.get(buffer.as_str()) {
                    Some(data) => *data,
                    None => self
                        .outputs
                        .get(buffer)
                        .map(Vec::as_slice)
                        .ok_or_else(|| GraphError::Interpreter(format!("unbound buffer `{buffer}`")))?,
                };
                Value::F(data.get(i).copied().unwrap_or(0.0))
            }
            Expr::Unary(f, x) => {
                let x = self.eval(x)?.f32()?;
                Value::F(match f {
                    UnaryFn::Neg => -x,
                    UnaryFn::Exp => x.exp(),
                    UnaryFn::Log => x.ln(),
                    UnaryFn::Sqrt => x.sqrt(),
                    UnaryFn::Tanh => x.tanh(),
                })
            }
            Expr::Binary(f, a, b) => binary(*f, self.eval(a)?, self.eval(b)?)?,
            Expr::Select {
                cond,
                on_true,
                on_false,
            } => {
                if self.eval(cond)?.bool()? {
                    self.eval(on_true)?
                } else {
                    self.eval(on_false)?
                }
            }
            Expr::Clamp { value, low, high } => {
                let v = self.eval(value)?.f32()?;
                let (low, high) = (self.eval(low)?.f32()?, self.eval(high)?.f32()?);
                Value::F(v.max(low).min(high))
            }
        })
    }

    fn exec(&mut self, stmts: &'k [Stmt]) -> Result<Flow> {
        for stmt in stmts {
            match stmt {
                Stmt::Let { name, value } | Stmt::Var { name, value } => {
                    let v = self.eval(value)?;
                    self.env.insert(name, v);
                }
                Stmt::Assign { name, value } => {
                    let v = self.eval(value)?;
                    let slot = self.env.get_mut(name.as_str()).ok_or_else(|| {
                        GraphError::Interpreter(format!("assignment to undeclared `{name}`"))
                    })?;
                    *slot = v;
                }
                Stmt::Store {
                    buffer,
                    index,
                    value,
                } => {
                    let i = self.eval(index)?.u32()? as usize;
                    let v = self.eval(value)?.f32()?;
                    let data = self.outputs.get_mut(buffer).ok_or_else(|| {
                        GraphError::Interpreter(format!("store to unbound `{buffer}`"))
                    })?;
                    if let Some(slot) = data.get_mut(i) {
                        *slot = v;
                    }
                }
                Stmt::For { var, count, body } => {
                    for k in 0..*count {
                        self.env.insert(var, Value::U(k as u32));
                        if let Flow::Return = self.exec(body)? {
                            return Ok(Flow::Return);
                        }
                    }
                }
                Stmt::If { cond, body } => {
                    if self.eval(cond)?.bool()?
                        && let Flow::Return = self.exec(body)?
                    {
                        return Ok(Flow::Return);
                    }
                }
                Stmt::Return => return Ok(Flow::Return),
            }
        }
        Ok(Flow::Next)
    }
}

fn binary(f: BinaryFn, a: Value, b: Value) -> Result<Value> {
    Ok(match (a, b) {
        (Value::F(a), Value::F(b)) => match f {
            BinaryFn::Add => Value::F(a + b),
            BinaryFn::Sub => Value::F(a - b),
            BinaryFn::Mul => Value::F(a * b),
            BinaryFn::Div => Value::F(a / b),
            BinaryFn::Rem => Value::F(a % b),
            BinaryFn::Max => Value::F(a.max(b)),
            BinaryFn::Lt => Value::B(a < b),
            BinaryFn::Gt => Value::B(a > b),
            BinaryFn::Ge => Value::B(a >= b),
        },
        (Value::U(a), Value::U(b)) => match f {
            BinaryFn::Add => Value::U(a.wrapping_add(b)),
            BinaryFn::Sub => Value::U(a.wrapping_sub(b)),
            BinaryFn::Mul => Value::U(a.wrapping_mul(b)),
            // Integer division by zero yields the dividend on the device
            BinaryFn::Div => Value::U(a.checked_div(b).unwrap_or(a)),
            BinaryFn::Rem => Value::U(a.checked_rem(b).unwrap_or(0)),
            BinaryFn::Max => Value::U(a.max(b)),
            BinaryFn::Lt => Value::B(a < b),
            BinaryFn::Gt => Value::B(a > b),
            BinaryFn::Ge => Value::B(a >= b),
        },
        (a, b) => {
            return Err(GraphError::Interpreter(format!(
                "mismatched operands for {f:?}: {a:?} and {b:?}"
            )));
        }
    })
}

/// Run every invocation of `kernel`
fn dispatch(
    kernel: &KernelSpec,
    inputs: &HashMap<&str, &[f32]>,
    outputs: &mut HashMap<String, Vec<f32>>,
) -> Result<()> {
    let invocations = kernel.workgroups() as usize * WORKGROUP_SIZE;
    for index in 0..invocations {
        let mut invocation = Invocation {
            index: index as u32,
            env: HashMap::new(),
            inputs,
            outputs: &mut *outputs,
        };
        invocation.exec(&kernel.body)?;
    }
    Ok(())
}

/// Host-side executor for a compiled plan
pub struct CpuRuntime {
    plan: Plan,
    tensors: HashMap<TensorId, Vec<f32>>,
    masks: HashMap<usize, Vec<f32>>,
    /// Kernel-owned buffers, one map per kernel
    locals: Vec<HashMap<String, Vec<f32>>>,
}

impl CpuRuntime {
    pub(crate) fn new(plan: Plan, store: &TensorStore) -> Self {
        let locals = plan
            .kernels
            .iter()
            .map(|k| {
                k.inputs
                    .iter()
                    .chain(k.outputs.iter())
                    .filter(|b| b.source == BufferSource::Local)
                    .map(|b| (b.name.clone(), vec![0.0; b.len]))
                    .collect()
            })
            .collect();
        let tensors = store.iter().map(|(id, t)| (id, t.value.clone())).collect();
        let masks = store
            .masks()
            .iter()
            .enumerate()
            .map(|(i, m)| (i, m.value.clone()))
            .collect();
        Self {
            plan,
            tensors,
            masks,
            locals,
        }
    }

    fn run_kernel(&mut self, i: usize) -> Result<()> {
        for copy in &self.plan.copies[i] {
            let data = self.locals[copy.from_kernel]
                .get(&copy.from)
                .map(|d| d[..copy.len.min(d.len())].to_vec())
                .ok_or_else(|| GraphError::BindingResolution {
                    kernel: self.plan.kernels[copy.from_kernel].label.clone(),
                    name: copy.from.clone(),
                })?;
            if let Some(dst) = self.locals[i].get_mut(&copy.to) {
                dst[..data.len()].copy_from_slice(&data);
            }
        }

        let kernel = &self.plan.kernels[i];
        let mut outputs: HashMap<String, Vec<f32>> = kernel
            .outputs
            .iter()
            .map(|b| {
                let data = self.locals[i].remove(&b.name).unwrap_or_else(|| vec![0.0; b.len]);
                (b.name.clone(), data)
            })
            .collect();

        let result = {
            let mut inputs: HashMap<&str, &[f32]> = HashMap::new();
            for b in kernel.inputs.iter() {
                let data = match b.source {
                    BufferSource::Tensor(id) => self.tensors.get(&id),
                    BufferSource::Mask(m) => self.masks.get(&m),
                    BufferSource::Local => self.locals[i].get(&b.name),
                };
                let data = data.ok_or_else(|| GraphError::BindingResolution {
                    kernel: kernel.label.clone(),
                    name: b.name.clone(),
                })?;
                inputs.insert(b.name.as_str(), data.as_slice());
            }
            dispatch(kernel, &inputs, &mut outputs)
        };
        self.locals[i].extend(outputs);
        result
    }

    fn read(&self, kernel: usize, name: &str) -> Result<Vec<f32>> {
        self.locals[kernel]
            .get(name)
            .cloned()
            .ok_or_else(|| GraphError::BindingResolution {
                kernel: self.plan.kernels[kernel].label.clone(),
                name: name.to_string(),
            })
    }
}

impl Executor for CpuRuntime {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn write_tensor(&mut self, id: TensorId, data: &[f32]) -> Result<()> {
        self.tensors.insert(id, data.to_vec());
        Ok(())
    }

    fn write_mask(&mut self, index: usize, data: &[f32]) -> Result<()> {
        self.masks.insert(index, data.to_vec());
        Ok(())
    }

    fn run(&mut self, backward: bool) -> Result<Readback> {
        for i in 0..self.plan.kernel_count(backward) {
            self.run_kernel(i)?;
        }
        let output = self.read(self.plan.output.kernel, &self.plan.output.name)?;
        let partials = if backward {
            self.plan
                .partials
                .iter()
                .map(|p| self.read(p.buffer.kernel, &p.buffer.name))
                .collect::<Result<_>>()?
        } else {
            Vec::new()
        };
        Ok(Readback { output, partials })
    }
}
