use crate::compiler::Compiler;
use crate::config::{Device, GraphConfig, dump_shaders};
use crate::cpu::CpuRuntime;
use crate::error::{GraphError, Result};
use crate::gpu::{self, GpuRuntime};
use crate::node::Arg;
use crate::runtime::{Executor, PartialGrad, Plan};
use crate::tensor::{Init, Tensor, TensorId, TensorKind, TensorStore};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashMap;

// ===== RESULTS =====

/// Result of one training `run`
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Forward output, flattened in row-major order
    pub output: Vec<f32>,
    /// Gradient of the summed output for every parameter, keyed by name
    pub gradients: HashMap<String, Vec<f32>>,
}

/// Generated source of one kernel, for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    pub label: String,
    pub backward: bool,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub wgsl: String,
}

struct Compiled {
    runtime: Box<dyn Executor>,
    output_shape: Vec<usize>,
    output_len: usize,
    sources: Vec<KernelSource>,
    partials: Vec<PartialGrad>,
}

// ===== GRAPH =====

/// Owner of tensors, compiled kernels and the runtime executing them.
///
/// ```ignore
/// let mut g = Graph::new(GraphConfig::cpu());
/// let x = g.input(&[4, 2], "x")?;
/// let w = g.tensor(&[2, 1], "w")?;
/// g.compile(sigmoid(matmul(x, w)), &[4, 1])?;
/// let out = g.run()?;
/// g.learn_all(0.1);
/// ```
pub struct Graph {
    config: GraphConfig,
    tensors: TensorStore,
    rng: StdRng,
    compiled: Option<Compiled>,
}

impl Graph {
    pub fn new(config: GraphConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            config,
            tensors: TensorStore::default(),
            rng,
            compiled: None,
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Declare a trainable parameter, initialized to zeros
    ///
    /// # Errors
    /// `InvalidName` or `DuplicateName`
    pub fn tensor(&mut self, shape: &[usize], name: &str) -> Result<TensorId> {
        self.tensors.insert(name, shape, TensorKind::Parameter)
    }

    /// Declare an external input (batch data, targets); inputs get no gradient
    ///
    /// # Errors
    /// `InvalidName` or `DuplicateName`
    pub fn input(&mut self, shape: &[usize], name: &str) -> Result<TensorId> {
        self.tensors.insert(name, shape, TensorKind::Input)
    }

    pub fn find(&self, name: &str) -> Option<TensorId> {
        self.tensors.find(name)
    }

    pub fn get(&self, id: TensorId) -> Result<&Tensor> {
        self.tensors.get(id)
    }

    /// Replace a tensor's value; uploaded before the next run
    ///
    /// # Errors
    /// `InputSizeMismatch` if `data` has the wrong length
    pub fn set(&mut self, id: TensorId, data: &[f32]) -> Result<()> {
        self.tensors.get_mut(id)?.set(data)
    }

    /// Feed a new batch into an input
    pub fn update_input(&mut self, id: TensorId, data: &[f32]) -> Result<()> {
        self.set(id, data)
    }

    pub fn fill(&mut self, id: TensorId, value: f32) -> Result<()> {
        self.init(id, Init::Fill(value))
    }

    /// Initialize a tensor with values drawn from the graph's RNG
    pub fn init(&mut self, id: TensorId, init: Init) -> Result<()> {
        let tensor = self.tensors.get(id)?;
        let values = init.sample(&tensor.name, &tensor.shape, &mut self.rng)?;
        self.tensors.get_mut(id)?.set(&values)
    }

    pub fn xavier_init(&mut self, id: TensorId) -> Result<()> {
        self.init(id, Init::Xavier)
    }

    pub fn he_init(&mut self, id: TensorId) -> Result<()> {
        self.init(id, Init::He)
    }

    pub fn tensor_value(&self, id: TensorId) -> Result<&[f32]> {
        Ok(&self.tensors.get(id)?.value)
    }

    /// Gradient from the last `run`
    pub fn gradient(&self, id: TensorId) -> Result<&[f32]> {
        Ok(&self.tensors.get(id)?.grad)
    }

    // ===== COMPILATION =====

    /// Compile `root` into forward and backward kernels and build the runtime.
    ///
    /// Replaces any previous compilation. `output_shape` must have as many
    /// elements as the root's inferred shape.
    ///
    /// # Errors
    /// `ShapeMismatch` for invalid operand shapes, `BindingResolution` or
    /// `CyclicKernels` for internal partition failures, `Device` if the GPU
    /// rejects a kernel
    pub fn compile(&mut self, root: impl Into<Arg>, output_shape: &[usize]) -> Result<()> {
        self.compiled = None;
        self.tensors.clear_masks();
        let root = root.into();
        let plan = Compiler::new(&mut self.tensors).compile(&root, output_shape)?;

        let sources: Vec<KernelSource> = plan
            .kernels
            .iter()
            .enumerate()
            .map(|(i, k)| KernelSource {
                label: k.label.clone(),
                backward: i >= plan.forward_count,
                inputs: k.inputs.names().map(str::to_string).collect(),
                outputs: k.outputs.names().map(str::to_string).collect(),
                wgsl: k.wgsl(),
            })
            .collect();
        if dump_shaders() {
            for source in &sources {
                log::debug!("{}:\n{}", source.label, source.wgsl);
            }
        }

        let partials = plan.partials.clone();
        let output_len = output_shape.iter().product();
        let runtime = self.build_runtime(plan)?;
        for (_, tensor) in self.tensors.iter_mut() {
            tensor.dirty = false;
        }
        log::info!("graph compiled for the {} runtime", runtime.name());

        self.compiled = Some(Compiled {
            runtime,
            output_shape: output_shape.to_vec(),
            output_len,
            sources,
            partials,
        });
        Ok(())
    }

    /// Compile `root` with its inferred shape, returning that shape
    pub fn output(&mut self, root: impl Into<Arg>) -> Result<Vec<usize>> {
        let root = root.into();
        self.tensors.clear_masks();
        let shape = {
            let mut compiler = Compiler::new(&mut self.tensors);
            let id = compiler.lower(&root)?;
            compiler.node(id).shape.clone()
        };
        self.compile(root, &shape)?;
        Ok(shape)
    }

    fn build_runtime(&self, plan: Plan) -> Result<Box<dyn Executor>> {
        if self.config.device == Device::Gpu {
            match gpu::get_gpu_context() {
                Some(ctx) => {
                    let runtime = GpuRuntime::new(ctx, plan, &self.tensors, self.config.sync_timeout)?;
                    return Ok(Box::new(runtime));
                }
                None => log::warn!("no GPU adapter available, falling back to the CPU runtime"),
            }
        }
        Ok(Box::new(CpuRuntime::new(plan, &self.tensors)))
    }

    fn compiled(&self) -> Result<&Compiled> {
        self.compiled.as_ref().ok_or(GraphError::NotCompiled)
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    pub fn output_shape(&self) -> Result<&[usize]> {
        Ok(&self.compiled()?.output_shape)
    }

    /// Forward and backward WGSL of every kernel, in execution order
    pub fn kernel_sources(&self) -> Result<&[KernelSource]> {
        Ok(&self.compiled()?.sources)
    }

    /// Name of the runtime executing the graph (`"gpu"` or `"cpu"`)
    pub fn runtime_name(&self) -> Result<&'static str> {
        Ok(self.compiled()?.runtime.name())
    }

    // ===== EXECUTION =====

    /// Upload changed tensors and dropout masks
    fn upload(&mut self, training: bool) -> Result<()> {
        let compiled = self.compiled.as_mut().ok_or(GraphError::NotCompiled)?;
        for (id, tensor) in self.tensors.iter_mut() {
            if tensor.dirty {
                compiled.runtime.write_tensor(id, &tensor.value)?;
                tensor.dirty = false;
            }
        }
        for (i, mask) in self.tensors.masks_mut().iter_mut().enumerate() {
            if training {
                mask.refresh(&mut self.rng);
            } else {
                mask.disable();
            }
            compiled.runtime.write_mask(i, &mask.value)?;
        }
        Ok(())
    }

    /// Run the forward and backward kernels.
    ///
    /// Every parameter's gradient is replaced by the gradient of the summed
    /// output (each output element is seeded with 1.0).
    ///
    /// # Errors
    /// `NotCompiled`, or `Device` if the device fails or times out
    pub fn run(&mut self) -> Result<RunOutput> {
        self.upload(true)?;
        let compiled = self.compiled.as_mut().ok_or(GraphError::NotCompiled)?;
        let readback = compiled.runtime.run(true)?;

        for (_, tensor) in self.tensors.iter_mut() {
            tensor.grad.fill(0.0);
        }
        for (partial, data) in compiled.partials.iter().zip(&readback.partials) {
            let tensor = self.tensors.get_mut(partial.tensor)?;
            partial.access.fold_host(data, &mut tensor.grad);
        }

        let gradients = self
            .tensors
            .iter()
            .filter(|(_, t)| t.kind == TensorKind::Parameter)
            .map(|(_, t)| (t.name.clone(), t.grad.clone()))
            .collect();
        let mut output = readback.output;
        output.truncate(compiled.output_len);
        Ok(RunOutput { output, gradients })
    }

    /// Run only the forward kernels, with dropout disabled
    pub fn infer(&mut self) -> Result<Vec<f32>> {
        self.upload(false)?;
        let compiled = self.compiled.as_mut().ok_or(GraphError::NotCompiled)?;
        let mut output = compiled.runtime.run(false)?.output;
        output.truncate(compiled.output_len);
        Ok(output)
    }

    /// Gradient-descent step on one parameter with the gradient of the last run
    pub fn learn(&mut self, id: TensorId, learning_rate: f32) -> Result<()> {
        self.tensors.get_mut(id)?.learn(learning_rate);
        Ok(())
    }

    /// Gradient-descent step on every parameter
    pub fn learn_all(&mut self, learning_rate: f32) {
        for (_, tensor) in self.tensors.iter_mut() {
            tensor.learn(learning_rate);
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new(GraphConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{add, matmul};

    #[test]
    fn test_run_before_compile() {
        let mut g = Graph::new(GraphConfig::cpu());
        assert!(matches!(g.run(), Err(GraphError::NotCompiled)));
        assert!(matches!(g.kernel_sources(), Err(GraphError::NotCompiled)));
    }

    #[test]
    fn test_output_infers_the_shape() {
        let mut g = Graph::new(GraphConfig::cpu());
        let x = g.input(&[3, 2], "x").unwrap();
        let w = g.tensor(&[2, 4], "w").unwrap();
        let shape = g.output(add(matmul(x, w), 1.0)).unwrap();
        assert_eq!(shape, vec![3, 4]);
        assert_eq!(g.output_shape().unwrap(), &[3, 4]);
    }

    #[test]
    fn test_wrong_output_shape() {
        let mut g = Graph::new(GraphConfig::cpu());
        let x = g.input(&[3, 2], "x").unwrap();
        let err = g.compile(add(x, 1.0), &[5]).unwrap_err();
        assert!(matches!(err, GraphError::ShapeMismatch { op: "output", .. }));
        assert!(!g.is_compiled());
    }
}
