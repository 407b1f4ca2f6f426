//! Frame orchestration core for Vulkan renderers.
//!
//! [`backend`] wraps the device, presentation chain, host-visible buffers and
//! descriptor management. [`renderer`] drives the per-frame protocol on top
//! of them and hands command buffers to registered [`systems`].

pub mod backend;
pub mod config;
pub mod error;
pub mod renderer;
pub mod systems;

pub use backend::{GraphicsDevice, PresentationChain, TransferBuffer, MAX_FRAMES_IN_FLIGHT};
pub use config::Config;
pub use error::GpuError;
pub use renderer::{Renderer, VulkanRenderer};
