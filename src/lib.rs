//! shadergrad: a graph compiler and autodiff engine for WGSL compute kernels.
//!
//! Operator builders (`add`, `matmul`, `softmax`, ...) compose a symbolic
//! DAG. `Graph::compile` partitions it into compute kernels, generates WGSL
//! for every kernel plus a mirrored set of backward kernels, and builds a
//! runtime for them: `wgpu` pipelines when an adapter is available, or the
//! host interpreter otherwise.
//!
//! ```ignore
//! use shadergrad::*;
//!
//! let mut g = Graph::new(GraphConfig::default());
//! let x = g.input(&[4, 2], "x")?;
//! let w = g.tensor(&[2, 1], "w")?;
//! g.xavier_init(w)?;
//! g.compile(sigmoid(matmul(x, w)), &[4, 1])?;
//! for _ in 0..100 {
//!     let out = g.run()?;
//!     g.learn_all(0.1);
//! }
//! ```

mod backward;
mod compiler;
pub mod config;
mod context;
mod cpu;
pub mod error;
pub mod gpu;
mod graph;
pub mod ir;
mod node;
pub mod ops;
pub mod runtime;
mod tensor;

pub use config::{Device, GraphConfig, WORKGROUP_SIZE};
pub use cpu::CpuRuntime;
pub use error::{GraphError, Result};
pub use gpu::{get_gpu_context, is_gpu_available};
pub use graph::{Graph, KernelSource, RunOutput};
pub use ir::KernelSpec;
pub use node::{Access, Arg, Builder, NodeId, OpClass};
pub use tensor::{Init, Tensor, TensorId, TensorKind};

pub use ops::{
    Op, add, batch_norm, binary_cross_entropy, cross_entropy, div, dot, dropout, exp, layer_norm,
    leaky_relu, log, matmul, mean, mean_axis0, mean_squared_error, mult, relu, reshape, sigmoid,
    softmax, sqrt, sub, sum, sum_axis0, tanh, transpose,
};
