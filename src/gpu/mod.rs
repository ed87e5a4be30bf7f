//! GPU backend using wgpu
//!
//! - `GpuContext`: the device and queue, created once per process
//! - `GpuRuntime`: one compute pipeline per compiled kernel, executed with a
//!   single submission per run

mod context;
mod runtime;

pub use context::GpuContext;
pub use runtime::GpuRuntime;

use std::sync::OnceLock;

// Global GPU context - initialized lazily on first use
static GPU_CONTEXT: OnceLock<Option<GpuContext>> = OnceLock::new();

/// Get the global GPU context, initializing it if necessary
/// Returns None if GPU is not available
pub fn get_gpu_context() -> Option<&'static GpuContext> {
    GPU_CONTEXT
        .get_or_init(|| match GpuContext::new() {
            Ok(ctx) => {
                log::info!("GPU initialized: {}", ctx.device_name());
                Some(ctx)
            }
            Err(e) => {
                log::warn!("GPU initialization failed: {e}");
                None
            }
        })
        .as_ref()
}

/// Check if GPU is available
pub fn is_gpu_available() -> bool {
    get_gpu_context().is_some()
}
