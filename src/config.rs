//! Graph configuration
//!
//! Defaults can be overridden from the environment, which is handy when
//! running the test suite or benchmarks on machines without a GPU:
//! ```bash
//! SHADERGRAD_DEVICE=cpu cargo test
//! SHADERGRAD_SEED=7 SHADERGRAD_GPU_SYNC_TIMEOUT=10 cargo run --example and_gate
//! ```

use std::time::Duration;

/// Threads per workgroup for every generated kernel
pub const WORKGROUP_SIZE: usize = 64;

/// Default seconds to wait for the device when reading results back
const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 5;

/// Where compiled kernels are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    /// Reference interpreter running the kernel IR on the host
    Cpu,
    /// `wgpu` compute pipelines
    #[default]
    Gpu,
}

impl Device {
    fn from_env() -> Option<Self> {
        match std::env::var("SHADERGRAD_DEVICE").ok()?.to_ascii_lowercase().as_str() {
            "cpu" => Some(Device::Cpu),
            "gpu" => Some(Device::Gpu),
            other => {
                log::warn!("ignoring unknown SHADERGRAD_DEVICE value `{other}`");
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Execution device; falls back to the CPU if no adapter is found
    pub device: Device,
    /// Seed for initializers and dropout masks (random when `None`)
    pub seed: Option<u64>,
    /// How long a readback may wait on the device
    pub sync_timeout: Duration,
}

impl GraphConfig {
    /// Config pinned to the CPU reference runtime
    #[must_use]
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        let seed = std::env::var("SHADERGRAD_SEED")
            .ok()
            .and_then(|s| s.parse::<u64>().ok());
        let timeout = std::env::var("SHADERGRAD_GPU_SYNC_TIMEOUT")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_SYNC_TIMEOUT_SECS);
        Self {
            device: Device::from_env().unwrap_or_default(),
            seed,
            sync_timeout: Duration::from_secs(timeout),
        }
    }
}

/// Whether generated WGSL should be logged at debug level
pub(crate) fn dump_shaders() -> bool {
    std::env::var("SHADERGRAD_DUMP_SHADERS").is_ok()
}
