// Typed failure kinds for the GPU core
//
// Everything here is fatal for the frame loop. They travel inside
// anyhow::Error like every other backend failure; callers that care about
// the kind use `err.downcast_ref::<GpuError>()`.
//
// Recoverable conditions (out-of-date surface, zero-area window, descriptor
// pool exhaustion) are NOT errors and never show up in this enum.

use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no physical device supports presenting, graphics+compute queues, the required extensions and anisotropic sampling")]
    NoSuitableAdapter,

    #[error("required device extension `{0}` is not available")]
    MissingExtension(String),

    #[error("validation layer `{0}` was requested but is not installed")]
    MissingLayer(String),

    #[error("no memory type matches type mask {type_mask:#b} with properties {properties:?}")]
    NoCompatibleMemoryType {
        type_mask: u32,
        properties: vk::MemoryPropertyFlags,
    },

    #[error("none of the candidate formats {candidates:?} supports {features:?} with {tiling:?} tiling")]
    NoSupportedFormat {
        candidates: Vec<vk::Format>,
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    },

    #[error("out of device memory")]
    OutOfDeviceMemory,

    #[error("no memory type can back a buffer with usage {usage:?} and properties {properties:?}")]
    UnsupportedUsage {
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    },

    #[error("flushing mapped memory failed: {0}")]
    FlushFailed(vk::Result),

    #[error("invalidating mapped memory failed: {0}")]
    InvalidateFailed(vk::Result),

    #[error("no barrier masks for image layout transition {from:?} -> {to:?}")]
    UnsupportedLayoutTransition {
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    },

    #[error("presentation chain failed its structural check: {0}")]
    MalformedChain(String),
}

impl GpuError {
    /// Allocation-class driver results, reported as `OutOfDeviceMemory`.
    pub(crate) fn is_out_of_memory(result: vk::Result) -> bool {
        matches!(
            result,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY
        )
    }
}
