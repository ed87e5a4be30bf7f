//! GPU context management
//!
//! The `GpuContext` holds the wgpu device and queue shared by every
//! compiled graph. Pipelines are per-graph and live in `GpuRuntime`.

use crate::error::{GraphError, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Maximum consecutive timeouts before the device is treated as lost
const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    /// Consecutive timeout counter for the 3-strike rule
    consecutive_timeouts: AtomicU32,
}

impl GpuContext {
    /// Create a new GPU context
    ///
    /// # Errors
    /// `Device` if no adapter is found or the device request fails
    pub fn new() -> Result<Self> {
        // wgpu is async; pollster::block_on runs it synchronously
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| GraphError::Device(format!("No suitable GPU adapter found: {e}")))?;

        let adapter_info = adapter.get_info();

        // Generated kernels bind one storage buffer per operand, so ask for
        // everything the adapter offers rather than the portable defaults
        let device_descriptor = wgpu::DeviceDescriptor {
            label: Some("shadergrad device"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        };

        let (device, queue) = adapter
            .request_device(&device_descriptor)
            .await
            .map_err(|e| GraphError::Device(format!("Failed to create device: {e}")))?;

        Ok(Self {
            device,
            queue,
            adapter_info,
            consecutive_timeouts: AtomicU32::new(0),
        })
    }

    /// Get the GPU device name for display
    pub fn device_name(&self) -> &str {
        &self.adapter_info.name
    }

    pub const fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub const fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Largest number of storage buffers one kernel may bind
    pub fn max_storage_buffers(&self) -> u32 {
        self.device.limits().max_storage_buffers_per_shader_stage
    }

    /// Wait for all submitted work to complete.
    ///
    /// # Errors
    /// `Device` on timeout; after three consecutive timeouts the device is
    /// reported as lost
    pub fn sync(&self, timeout: Duration) -> Result<()> {
        let result = self.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: Some(timeout),
        });
        match result {
            Ok(_) => {
                self.consecutive_timeouts.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                let strikes = self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!("GPU sync timed out ({strikes}/{MAX_CONSECUTIVE_TIMEOUTS}): {e:?}");
                if strikes >= MAX_CONSECUTIVE_TIMEOUTS {
                    Err(GraphError::Device(format!(
                        "GPU lost after {strikes} consecutive timeouts"
                    )))
                } else {
                    Err(GraphError::Device(format!("GPU sync timeout: {e:?}")))
                }
            }
        }
    }

    /// Run `f` inside a validation error scope.
    ///
    /// # Errors
    /// `Device` with the first validation error raised by `f`
    pub fn validated<T>(&self, what: &str, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(GraphError::Device(format!("{what}: {err}"))),
            None => Ok(value),
        }
    }
}
