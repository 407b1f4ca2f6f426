// Demo render system: one spinning, vertex-colored triangle
//
// Vertices are uploaded once into device-local memory through a staging
// buffer. The model matrix goes in a push constant; projection and tint come
// from the global uniform block.

use anyhow::Result;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use std::sync::Arc;

use super::{FrameInfo, RenderSystem};
use crate::backend::pipeline::{create_pipeline_layout, GraphicsPipeline, PipelineConfig};
use crate::backend::{GraphicsDevice, TransferBuffer};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
    pub color: [f32; 3],
}

impl Vertex {
    pub fn binding_descriptions() -> Vec<vk::VertexInputBindingDescription> {
        vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }

    pub fn attribute_descriptions() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::size_of::<[f32; 2]>() as u32,
            },
        ]
    }
}

const TRIANGLE: [Vertex; 3] = [
    Vertex {
        position: [0.0, -0.5],
        color: [1.0, 0.0, 0.0],
    },
    Vertex {
        position: [0.5, 0.5],
        color: [0.0, 1.0, 0.0],
    },
    Vertex {
        position: [-0.5, 0.5],
        color: [0.0, 0.0, 1.0],
    },
];

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PushConstants {
    model: Mat4,
}

pub struct TriangleSystem {
    device: Arc<GraphicsDevice>,
    vertex_buffer: TransferBuffer,
    vert_spv: Vec<u8>,
    frag_spv: Vec<u8>,
    pipeline_layout: vk::PipelineLayout,
    pipeline: Option<GraphicsPipeline>,
    angle: f32,
}

impl TriangleSystem {
    pub fn new(device: Arc<GraphicsDevice>, vert_spv: Vec<u8>, frag_spv: Vec<u8>) -> Result<Self> {
        let vertex_buffer = TransferBuffer::device_local_with_data(
            device.clone(),
            &TRIANGLE,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;

        Ok(Self {
            device,
            vertex_buffer,
            vert_spv,
            frag_spv,
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: None,
            angle: 0.0,
        })
    }
}

impl RenderSystem for TriangleSystem {
    fn name(&self) -> &str {
        "triangle"
    }

    fn build_pipeline_layout(&mut self, global_set_layout: vk::DescriptorSetLayout) -> Result<()> {
        let push_constant_range = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: std::mem::size_of::<PushConstants>() as u32,
        };
        self.pipeline_layout =
            create_pipeline_layout(&self.device, &[global_set_layout], &[push_constant_range])?;
        Ok(())
    }

    fn build_pipeline(&mut self, render_pass: vk::RenderPass) -> Result<()> {
        assert!(
            self.pipeline_layout != vk::PipelineLayout::null(),
            "pipeline layout must be built before the pipeline"
        );
        let config = PipelineConfig {
            vertex_bindings: Vertex::binding_descriptions(),
            vertex_attributes: Vertex::attribute_descriptions(),
            cull_mode: vk::CullModeFlags::NONE,
            ..Default::default()
        };

        // Old pipeline goes first; the device is idle during rebuilds
        self.pipeline = None;
        self.pipeline = Some(GraphicsPipeline::new(
            &self.device,
            &self.vert_spv,
            &self.frag_spv,
            &config,
            self.pipeline_layout,
            render_pass,
        )?);
        Ok(())
    }

    fn submit_draws(&mut self, frame: &FrameInfo) {
        let Some(pipeline) = &self.pipeline else {
            return;
        };
        self.angle = (self.angle + frame.frame_time) % std::f32::consts::TAU;
        let push = PushConstants {
            model: Mat4::from_rotation_z(self.angle),
        };

        let device = &self.device.device;
        let cmd = frame.command_buffer;
        pipeline.bind(cmd);
        unsafe {
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline_layout,
                0,
                &[frame.global_descriptor_set],
                &[],
            );
            device.cmd_push_constants(
                cmd,
                self.pipeline_layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(&push),
            );
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer()], &[0]);
            device.cmd_draw(cmd, self.vertex_buffer.instance_count(), 1, 0, 0);
        }
    }
}

impl Drop for TriangleSystem {
    fn drop(&mut self) {
        self.pipeline = None;
        unsafe {
            self.device
                .device
                .destroy_pipeline_layout(self.pipeline_layout, None)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_attributes() {
        assert_eq!(std::mem::size_of::<Vertex>(), 20);
        let attributes = Vertex::attribute_descriptions();
        assert_eq!(attributes[1].offset, 8);
        assert_eq!(
            Vertex::binding_descriptions()[0].stride as usize,
            std::mem::size_of::<Vertex>()
        );
    }

    #[test]
    fn push_constants_fit_the_guaranteed_minimum() {
        // 128 bytes is the smallest maxPushConstantsSize a device may report
        assert!(std::mem::size_of::<PushConstants>() <= 128);
    }
}
