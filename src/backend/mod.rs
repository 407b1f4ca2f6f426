// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Ownership: one GraphicsDevice behind an Arc, everything else holds a clone

pub mod buffer;
pub mod descriptors;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use buffer::TransferBuffer;
pub use descriptors::{DescriptorPool, DescriptorPoolBuilder, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter};
pub use device::GraphicsDevice;
pub use swapchain::{AcquireOutcome, ChainShape, PresentOutcome, PresentationChain};
pub use sync::MAX_FRAMES_IN_FLIGHT;
