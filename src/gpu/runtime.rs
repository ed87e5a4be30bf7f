//! Executes a compiled plan with wgpu compute pipelines.
//!
//! Parameter, input and mask buffers are shared by every kernel that binds
//! them; kernel-owned (local) buffers are private to one kernel and filled
//! by buffer copies recorded before its dispatch. A run records every copy
//! and dispatch, plus the readback copies, into one command encoder.

use super::GpuContext;
use crate::error::{GraphError, Result};
use crate::ir::{Binding, BufferSource, KernelSpec};
use crate::runtime::{BufferRef, Executor, Plan, Readback};
use crate::tensor::{TensorId, TensorStore};
use std::collections::HashMap;
use std::sync::{Arc, mpsc};
use std::time::Duration;

const F32_BYTES: u64 = std::mem::size_of::<f32>() as u64;

/// One compiled kernel
struct Kernel {
    label: String,
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    locals: HashMap<String, Arc<wgpu::Buffer>>,
    workgroups: u32,
}

pub struct GpuRuntime {
    ctx: &'static GpuContext,
    plan: Plan,
    kernels: Vec<Kernel>,
    tensors: HashMap<TensorId, Arc<wgpu::Buffer>>,
    masks: HashMap<usize, Arc<wgpu::Buffer>>,
    timeout: Duration,
}

fn storage_buffer(ctx: &GpuContext, label: &str, len: usize) -> Arc<wgpu::Buffer> {
    // Zero-length bindings are invalid; keep at least one element
    let size = len.max(1) as u64 * F32_BYTES;
    Arc::new(ctx.device().create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    }))
}

impl GpuRuntime {
    /// Upload the graph's buffers and build one pipeline per kernel.
    ///
    /// # Errors
    /// `Device` if a shader or pipeline fails validation or a kernel binds
    /// more buffers than the adapter allows
    pub(crate) fn new(
        ctx: &'static GpuContext,
        plan: Plan,
        store: &TensorStore,
        timeout: Duration,
    ) -> Result<Self> {
        let mut tensors = HashMap::new();
        for (id, tensor) in store.iter() {
            let buffer = storage_buffer(ctx, &tensor.binding_name(), tensor.size());
            ctx.queue()
                .write_buffer(&buffer, 0, bytemuck::cast_slice(&tensor.value));
            tensors.insert(id, buffer);
        }
        let mut masks = HashMap::new();
        for (i, mask) in store.masks().iter().enumerate() {
            let buffer = storage_buffer(ctx, &format!("mask_{i}"), mask.value.len());
            ctx.queue()
                .write_buffer(&buffer, 0, bytemuck::cast_slice(&mask.value));
            masks.insert(i, buffer);
        }

        let mut runtime = Self {
            ctx,
            plan,
            kernels: Vec::new(),
            tensors,
            masks,
            timeout,
        };
        let kernels = runtime
            .plan
            .kernels
            .iter()
            .map(|spec| runtime.build(spec))
            .collect::<Result<Vec<_>>>()?;
        runtime.kernels = kernels;
        log::info!(
            "built {} GPU pipelines on {}",
            runtime.kernels.len(),
            ctx.device_name()
        );
        Ok(runtime)
    }

    fn build(&self, spec: &KernelSpec) -> Result<Kernel> {
        let bound = (spec.inputs.len() + spec.outputs.len()) as u32;
        if bound > self.ctx.max_storage_buffers() {
            return Err(GraphError::Device(format!(
                "{} binds {bound} storage buffers, the adapter allows {}",
                spec.label,
                self.ctx.max_storage_buffers()
            )));
        }

        let mut locals = HashMap::new();
        let mut resolve = |b: &Binding| -> Result<Arc<wgpu::Buffer>> {
            let buffer = match b.source {
                BufferSource::Tensor(id) => self.tensors.get(&id).cloned(),
                BufferSource::Mask(m) => self.masks.get(&m).cloned(),
                BufferSource::Local => Some(
                    locals
                        .entry(b.name.clone())
                        .or_insert_with(|| {
                            storage_buffer(self.ctx, &format!("{}:{}", spec.label, b.name), b.len)
                        })
                        .clone(),
                ),
            };
            buffer.ok_or_else(|| GraphError::BindingResolution {
                kernel: spec.label.clone(),
                name: b.name.clone(),
            })
        };
        let buffers = spec
            .inputs
            .iter()
            .chain(spec.outputs.iter())
            .map(&mut resolve)
            .collect::<Result<Vec<_>>>()?;

        let source = spec.wgsl();
        let (pipeline, bind_group) = self.ctx.validated(&spec.label, |device| {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(spec.label.as_str()),
                source: wgpu::ShaderSource::Wgsl(source.as_str().into()),
            });
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(spec.label.as_str()),
                layout: None, // Auto-generate layout from shader
                module: &module,
                entry_point: Some("main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
            let entries: Vec<wgpu::BindGroupEntry> = buffers
                .iter()
                .enumerate()
                .map(|(slot, buffer)| wgpu::BindGroupEntry {
                    binding: slot as u32,
                    resource: buffer.as_entire_binding(),
                })
                .collect();
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(spec.label.as_str()),
                layout: &pipeline.get_bind_group_layout(0),
                entries: &entries,
            });
            (pipeline, bind_group)
        })?;

        Ok(Kernel {
            label: spec.label.clone(),
            pipeline,
            bind_group,
            locals,
            workgroups: spec.workgroups(),
        })
    }

    fn local(&self, r: &BufferRef) -> Result<&Arc<wgpu::Buffer>> {
        self.kernels
            .get(r.kernel)
            .and_then(|k| k.locals.get(&r.name))
            .ok_or_else(|| GraphError::BindingResolution {
                kernel: self
                    .kernels
                    .get(r.kernel)
                    .map_or_else(String::new, |k| k.label.clone()),
                name: r.name.clone(),
            })
    }

    fn read_back(&self, encoder: &mut wgpu::CommandEncoder, r: &BufferRef) -> Result<(wgpu::Buffer, u64)> {
        let source = self.local(r)?;
        let size = source.size();
        let staging = self.ctx.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
        Ok((staging, size))
    }

    fn map(&self, staging: &[(wgpu::Buffer, u64)], lens: &[usize]) -> Result<Vec<Vec<f32>>> {
        let (sender, receiver) = mpsc::channel();
        for (i, (buffer, _)) in staging.iter().enumerate() {
            let sender = sender.clone();
            buffer.slice(..).map_async(wgpu::MapMode::Read, move |result| {
                // The receiver outlives every callback; a failed send only
                // means the run was already abandoned
                let _ = sender.send((i, result));
            });
        }
        drop(sender);
        self.ctx.sync(self.timeout)?;

        for _ in staging {
            let (i, result) = receiver
                .recv()
                .map_err(|_| GraphError::Device("map_async result channel closed".into()))?;
            result.map_err(|e| GraphError::Device(format!("Failed to map buffer {i}: {e}")))?;
        }
        let mut out = Vec::with_capacity(staging.len());
        for ((buffer, _), &len) in staging.iter().zip(lens) {
            let data = buffer.slice(..).get_mapped_range();
            let values: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
            drop(data);
            buffer.unmap();
            out.push(values.into_iter().take(len).collect());
        }
        Ok(out)
    }
}

impl Executor for GpuRuntime {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn write_tensor(&mut self, id: TensorId, data: &[f32]) -> Result<()> {
        let buffer = self.tensors.get(&id).ok_or(GraphError::UnknownTensor(id.index()))?;
        self.ctx
            .queue()
            .write_buffer(buffer, 0, bytemuck::cast_slice(data));
        Ok(())
    }

    fn write_mask(&mut self, index: usize, data: &[f32]) -> Result<()> {
        let buffer = self.masks.get(&index).ok_or_else(|| GraphError::BindingResolution {
            kernel: String::new(),
            name: format!("mask_{index}"),
        })?;
        self.ctx
            .queue()
            .write_buffer(buffer, 0, bytemuck::cast_slice(data));
        Ok(())
    }

    fn run(&mut self, backward: bool) -> Result<Readback> {
        let count = self.plan.kernel_count(backward);
        let mut encoder = self
            .ctx
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(if backward { "train" } else { "infer" }),
            });

        for i in 0..count {
            for copy in &self.plan.copies[i] {
                let from = self.local(&BufferRef {
                    kernel: copy.from_kernel,
                    name: copy.from.clone(),
                })?;
                let to = self.local(&BufferRef {
                    kernel: i,
                    name: copy.to.clone(),
                })?;
                let bytes = (copy.len as u64 * F32_BYTES).min(from.size()).min(to.size());
                encoder.copy_buffer_to_buffer(from, 0, to, 0, bytes);
            }
            let kernel = &self.kernels[i];
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.label.as_str()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, &kernel.bind_group, &[]);
            pass.dispatch_workgroups(kernel.workgroups, 1, 1);
        }

        let mut targets = vec![self.plan.output.clone()];
        if backward {
            targets.extend(self.plan.partials.iter().map(|p| p.buffer.clone()));
        }
        let lens: Vec<usize> = targets
            .iter()
            .map(|r| {
                self.plan.kernels[r.kernel]
                    .outputs
                    .get(&r.name)
                    .map_or(0, |b| b.len)
            })
            .collect();
        let staging = targets
            .iter()
            .map(|r| self.read_back(&mut encoder, r))
            .collect::<Result<Vec<_>>>()?;

        self.ctx.queue().submit(Some(encoder.finish()));
        let mut values = self.map(&staging, &lens)?.into_iter();
        let output = values.next().unwrap_or_default();
        Ok(Readback {
            output,
            partials: values.collect(),
        })
    }
}
