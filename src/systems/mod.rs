// Render systems - the clients that issue draw calls
//
// Each system owns its pipeline layout and pipeline. The renderer builds
// them once on registration and again whenever a chain recreation changes
// the attachment formats; a plain resize keeps them (dynamic viewport).

pub mod triangle;

pub use triangle::{TriangleSystem, Vertex};

use anyhow::Result;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

/// Uniform block shared by every system at set 0, binding 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GlobalUbo {
    pub projection: Mat4,
    pub tint: Vec4,
}

impl GlobalUbo {
    /// Aspect-corrected projection covering [-1, 1] vertically.
    pub fn for_aspect(aspect: f32, tint: Vec4) -> Self {
        Self {
            projection: Mat4::orthographic_rh(-aspect, aspect, -1.0, 1.0, -1.0, 1.0),
            tint,
        }
    }
}

/// Per-frame data handed to every system while the render pass is open.
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    /// Frame slot; selects the system's per-slot buffers and descriptor sets.
    pub frame_index: usize,
    pub frame_time: f32,
    pub command_buffer: vk::CommandBuffer,
    pub global_descriptor_set: vk::DescriptorSet,
    pub extent: vk::Extent2D,
}

pub trait RenderSystem {
    fn name(&self) -> &str;

    /// Create the pipeline layout; `global_set_layout` is bound at set 0.
    fn build_pipeline_layout(&mut self, global_set_layout: vk::DescriptorSetLayout) -> Result<()>;

    /// (Re)build the pipeline against `render_pass`, replacing any previous one.
    fn build_pipeline(&mut self, render_pass: vk::RenderPass) -> Result<()>;

    fn submit_draws(&mut self, frame: &FrameInfo);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_ubo_matches_the_std140_block() {
        // mat4 + vec4, no padding
        assert_eq!(std::mem::size_of::<GlobalUbo>(), 80);
    }

    #[test]
    fn projection_keeps_the_unit_height_visible() {
        let ubo = GlobalUbo::for_aspect(2.0, Vec4::ONE);
        let top = ubo.projection * Vec4::new(0.0, 1.0, 0.0, 1.0);
        let right = ubo.projection * Vec4::new(2.0, 0.0, 0.0, 1.0);
        assert!((top.y.abs() - 1.0).abs() < 1e-6);
        assert!((right.x - 1.0).abs() < 1e-6);
    }
}
