//! Execution plan shared by the CPU and GPU runtimes
//!
//! A plan is the ordered kernel list (forward kernels, then backward kernels
//! in reverse context order) plus the buffer copies that wire them together.

use crate::error::{GraphError, Result};
use crate::ir::{BufferSource, KernelSpec, output_name};
use crate::node::Access;
use crate::tensor::TensorId;

/// Buffer-to-buffer copy performed right before a kernel is dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOp {
    /// Index of the earlier kernel owning the source
    pub from_kernel: usize,
    /// Output binding of `from_kernel` (`<name>_output`)
    pub from: String,
    /// Local input binding of the receiving kernel
    pub to: String,
    pub len: usize,
}

/// An output binding of one kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferRef {
    pub kernel: usize,
    pub name: String,
}

/// One partial gradient of a parameter, summed into its gradient on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialGrad {
    pub tensor: TensorId,
    pub buffer: BufferRef,
    /// How the partial's layout folds back onto the parameter
    pub access: Access,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub kernels: Vec<KernelSpec>,
    /// `copies[i]` run before kernel `i`
    pub copies: Vec<Vec<CopyOp>>,
    /// Kernels `[0, forward_count)` are the forward pass
    pub forward_count: usize,
    pub output: BufferRef,
    pub partials: Vec<PartialGrad>,
}

impl Plan {
    /// Wire the kernels together.
    ///
    /// # Errors
    /// `BindingResolution` if a local input has no earlier producer, or the
    /// output or a gradient partial is not written by its kernel
    pub fn new(
        kernels: Vec<KernelSpec>,
        forward_count: usize,
        output: BufferRef,
        partials: Vec<PartialGrad>,
    ) -> Result<Self> {
        let mut copies = Vec::with_capacity(kernels.len());
        for (i, kernel) in kernels.iter().enumerate() {
            let mut before = Vec::new();
            for input in kernel.inputs.iter() {
                if input.source != BufferSource::Local {
                    continue;
                }
                let from = output_name(&input.name);
                let producer = kernels[..i]
                    .iter()
                    .rposition(|k| k.outputs.contains(&from))
                    .ok_or_else(|| GraphError::BindingResolution {
                        kernel: kernel.label.clone(),
                        name: input.name.clone(),
                    })?;
                before.push(CopyOp {
                    from_kernel: producer,
                    from,
                    to: input.name.clone(),
                    len: input.len,
                });
            }
            copies.push(before);
        }

        let written = |r: &BufferRef| {
            kernels
                .get(r.kernel)
                .is_some_and(|k| k.outputs.contains(&r.name))
        };
        for r in std::iter::once(&output).chain(partials.iter().map(|p| &p.buffer)) {
            if !written(r) {
                return Err(GraphError::BindingResolution {
                    kernel: kernels
                        .get(r.kernel)
                        .map_or_else(String::new, |k| k.label.clone()),
                    name: r.name.clone(),
                });
            }
        }

        Ok(Self {
            kernels,
            copies,
            forward_count,
            output,
            partials,
        })
    }

    /// Number of kernels a run executes
    #[must_use]
    pub fn kernel_count(&self, backward: bool) -> usize {
        if backward {
            self.kernels.len()
        } else {
            self.forward_count
        }
    }
}

/// Results read back after a run
#[derive(Debug, Clone, Default)]
pub struct Readback {
    pub output: Vec<f32>,
    /// One buffer per `Plan::partials` entry; empty for forward-only runs
    pub partials: Vec<Vec<f32>>,
}

/// A device able to execute a plan
pub trait Executor {
    fn name(&self) -> &'static str;

    /// Upload the host value of a parameter or input
    fn write_tensor(&mut self, id: TensorId, data: &[f32]) -> Result<()>;

    /// Upload a dropout mask
    fn write_mask(&mut self, index: usize, data: &[f32]) -> Result<()>;

    /// Execute the forward kernels, and the backward kernels when `backward`
    /// is set, then read the results back.
    fn run(&mut self, backward: bool) -> Result<Readback>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Bindings, Expr, Stmt};

    fn kernel(label: &str, input: Option<&str>, output: &str) -> KernelSpec {
        let mut inputs = Bindings::default();
        let mut outputs = Bindings::default();
        let value = match input {
            Some(name) => {
                inputs.register(name, 4, BufferSource::Local);
                Expr::load(name, Expr::Index)
            }
            None => Expr::f(1.0),
        };
        outputs.register(output, 4, BufferSource::Local);
        KernelSpec::new(label, 4, inputs, outputs, vec![Stmt::store(output, Expr::Index, value)])
            .unwrap()
    }

    #[test]
    fn test_copies_follow_naming_convention() {
        let kernels = vec![kernel("a", None, "v0_output"), kernel("b", Some("v0"), "v1_output")];
        let output = BufferRef {
            kernel: 1,
            name: "v1_output".into(),
        };
        let plan = Plan::new(kernels, 2, output, Vec::new()).unwrap();
        assert!(plan.copies[0].is_empty());
        assert_eq!(plan.copies[1][0].from_kernel, 0);
        assert_eq!(plan.copies[1][0].from, "v0_output");
    }

    #[test]
    fn test_missing_producer_is_reported() {
        let kernels = vec![kernel("b", Some("v7"), "v1_output")];
        let output = BufferRef {
            kernel: 0,
            name: "v1_output".into(),
        };
        let err = Plan::new(kernels, 1, output, Vec::new()).unwrap_err();
        assert!(matches!(err, GraphError::BindingResolution { name, .. } if name == "v7"));
    }
}
