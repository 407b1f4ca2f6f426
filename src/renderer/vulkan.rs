// Vulkan frame backend
//
// Owns the presentation chain and one primary command buffer per frame
// slot. Command buffers come from the device's pool (created with
// RESET_COMMAND_BUFFER), so beginning one implicitly resets it.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::{ClearValues, FrameBackend, Renderer};
use crate::backend::{
    AcquireOutcome, ChainShape, GraphicsDevice, PresentOutcome, PresentationChain,
    MAX_FRAMES_IN_FLIGHT,
};

pub type VulkanRenderer = Renderer<VulkanFrameBackend>;

pub struct VulkanFrameBackend {
    device: Arc<GraphicsDevice>,
    chain: PresentationChain,
    command_buffers: Vec<vk::CommandBuffer>,
    present_mode: vk::PresentModeKHR,
}

impl VulkanFrameBackend {
    pub fn new(
        device: Arc<GraphicsDevice>,
        extent: vk::Extent2D,
        present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let chain = PresentationChain::new(device.clone(), extent, present_mode, None)?;
        chain.shape().validate()?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(device.command_pool())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(MAX_FRAMES_IN_FLIGHT as u32);
        let command_buffers = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate frame command buffers")?;

        Ok(Self {
            device,
            chain,
            command_buffers,
            present_mode,
        })
    }

    pub fn device(&self) -> &Arc<GraphicsDevice> {
        &self.device
    }

    pub fn chain(&self) -> &PresentationChain {
        &self.chain
    }
}

impl FrameBackend for VulkanFrameBackend {
    fn frame_slot(&self) -> usize {
        self.chain.current_slot()
    }

    fn extent(&self) -> vk::Extent2D {
        self.chain.extent()
    }

    fn render_pass(&self) -> vk::RenderPass {
        self.chain.render_pass()
    }

    fn shape(&self) -> ChainShape {
        self.chain.shape()
    }

    fn acquire_next_image(&mut self) -> Result<AcquireOutcome> {
        self.chain.acquire_next_image()
    }

    fn begin_commands(&mut self, slot: usize) -> Result<vk::CommandBuffer> {
        let command_buffer = self.command_buffers[slot];
        let begin_info = vk::CommandBufferBeginInfo::builder();
        unsafe {
            self.device
                .device
                .begin_command_buffer(command_buffer, &begin_info)
        }
        .context("Failed to begin recording command buffer")?;
        Ok(command_buffer)
    }

    fn end_commands(&mut self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.device.end_command_buffer(command_buffer) }
            .context("Failed to record command buffer")
    }

    fn submit_and_present(
        &mut self,
        command_buffer: vk::CommandBuffer,
        image_index: u32,
    ) -> Result<PresentOutcome> {
        self.chain.submit_and_present(command_buffer, image_index)
    }

    fn recreate(&mut self, extent: vk::Extent2D) -> Result<()> {
        // Nothing may still reference the old chain when it is dropped
        self.device.wait_idle()?;
        let chain = PresentationChain::new(
            self.device.clone(),
            extent,
            self.present_mode,
            Some(&self.chain),
        )?;
        self.chain = chain;
        Ok(())
    }

    fn begin_render_pass(
        &mut self,
        command_buffer: vk::CommandBuffer,
        image_index: u32,
        clear: &ClearValues,
    ) {
        let extent = self.chain.extent();
        let clear_values = clear.to_vk();
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.chain.render_pass())
            .framebuffer(self.chain.framebuffer(image_index))
            .render_area(render_area)
            .clear_values(&clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        let device = &self.device.device;
        unsafe {
            device.cmd_begin_render_pass(
                command_buffer,
                &render_pass_info,
                vk::SubpassContents::INLINE,
            );
            device.cmd_set_viewport(command_buffer, 0, &[viewport]);
            device.cmd_set_scissor(command_buffer, 0, &[render_area]);
        }
    }

    fn end_render_pass(&mut self, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.device.cmd_end_render_pass(command_buffer) };
    }

    fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

impl Drop for VulkanFrameBackend {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        unsafe {
            self.device
                .device
                .free_command_buffers(self.device.command_pool(), &self.command_buffers)
        };
    }
}
