// Frame orchestration
//
// Drives acquire -> record -> submit -> present for one frame at a time and
// replaces the presentation chain when the surface changes. The GPU side is
// reached through `FrameBackend`, so the protocol below is independent of
// the Vulkan objects behind it.
//
// A frame moves Idle -> Recording -> InRenderPass -> Recording -> Idle.
// Calling anything out of that order is a programming error and panics.

mod vulkan;

#[cfg(test)]
mod tests;

pub use vulkan::{VulkanFrameBackend, VulkanRenderer};

use anyhow::Result;
use ash::vk;

use crate::backend::{AcquireOutcome, ChainShape, PresentOutcome};
use crate::systems::{FrameInfo, RenderSystem};

/// What the orchestrator needs from the window.
pub trait SurfaceProvider {
    /// Current drawable size in pixels. Zero in either dimension while minimized.
    fn drawable_extent(&self) -> vk::Extent2D;

    /// Whether the window was resized since the last call. Clears the flag.
    fn take_resized(&mut self) -> bool;
}

/// GPU-facing half of the frame loop.
pub trait FrameBackend {
    /// Frame slot the next frame records into, in `[0, MAX_FRAMES_IN_FLIGHT)`.
    fn frame_slot(&self) -> usize;
    fn extent(&self) -> vk::Extent2D;
    fn render_pass(&self) -> vk::RenderPass;
    fn shape(&self) -> ChainShape;

    /// Wait for the current slot to retire and acquire an image.
    fn acquire_next_image(&mut self) -> Result<AcquireOutcome>;
    fn begin_commands(&mut self, slot: usize) -> Result<vk::CommandBuffer>;
    fn end_commands(&mut self, command_buffer: vk::CommandBuffer) -> Result<()>;
    fn submit_and_present(
        &mut self,
        command_buffer: vk::CommandBuffer,
        image_index: u32,
    ) -> Result<PresentOutcome>;

    /// Replace the chain with one sized for `extent`. Must not return while
    /// any GPU work still references the old chain.
    fn recreate(&mut self, extent: vk::Extent2D) -> Result<()>;

    /// Begin the render pass on `image_index`'s framebuffer and set the
    /// viewport and scissor to the full extent.
    fn begin_render_pass(
        &mut self,
        command_buffer: vk::CommandBuffer,
        image_index: u32,
        clear: &ClearValues,
    );
    fn end_render_pass(&mut self, command_buffer: vk::CommandBuffer);

    fn wait_idle(&self) -> Result<()>;
}

/// Clear policy for every render pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearValues {
    pub color: [f32; 4],
    pub depth: f32,
    pub stencil: u32,
}

impl Default for ClearValues {
    fn default() -> Self {
        Self {
            color: [0.01, 0.01, 0.01, 1.0],
            depth: 1.0,
            stencil: 0,
        }
    }
}

impl ClearValues {
    /// Color then depth/stencil, matching the attachment order.
    pub fn to_vk(&self) -> [vk::ClearValue; 2] {
        [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: self.depth,
                    stencil: self.stencil,
                },
            },
        ]
    }
}

/// Counters kept across the renderer's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub frames_submitted: u64,
    pub frames_skipped: u64,
    pub chain_recreations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Idle,
    Recording {
        image_index: u32,
        command_buffer: vk::CommandBuffer,
    },
    InRenderPass {
        image_index: u32,
        command_buffer: vk::CommandBuffer,
    },
}

pub struct Renderer<B: FrameBackend> {
    backend: B,
    state: FrameState,
    pending_recreate: bool,
    clear: ClearValues,
    stats: FrameStats,
    systems: Vec<Box<dyn RenderSystem>>,
}

impl<B: FrameBackend> Renderer<B> {
    pub fn new(backend: B, clear: ClearValues) -> Self {
        Self {
            backend,
            state: FrameState::Idle,
            pending_recreate: false,
            clear,
            stats: FrameStats::default(),
            systems: Vec::new(),
        }
    }

    // =========================================================================
    // FRAME CYCLE
    // =========================================================================

    /// Start a frame and return its command buffer.
    ///
    /// `Ok(None)` means no frame this time: the surface has no area, or the
    /// chain went out of date and will be rebuilt on the next call. May block
    /// until the GPU retires the frame that last used this slot.
    pub fn begin_frame(
        &mut self,
        surface: &mut dyn SurfaceProvider,
    ) -> Result<Option<vk::CommandBuffer>> {
        assert!(
            self.state == FrameState::Idle,
            "begin_frame called while a frame is already in progress"
        );

        // Polled before the area check so a resize while minimized is kept
        if surface.take_resized() {
            self.pending_recreate = true;
        }

        let extent = surface.drawable_extent();
        if extent.width == 0 || extent.height == 0 {
            self.stats.frames_skipped += 1;
            return Ok(None);
        }

        if self.pending_recreate {
            self.recreate_chain(extent)?;
        }

        let image_index = match self.backend.acquire_next_image()? {
            AcquireOutcome::Ready { image_index, .. } => image_index,
            AcquireOutcome::OutOfDate => {
                log::debug!("Surface out of date on acquire, skipping frame");
                self.pending_recreate = true;
                self.stats.frames_skipped += 1;
                return Ok(None);
            }
        };

        let command_buffer = self.backend.begin_commands(self.backend.frame_slot())?;
        self.state = FrameState::Recording {
            image_index,
            command_buffer,
        };
        Ok(Some(command_buffer))
    }

    /// Finish recording, submit and present.
    ///
    /// An out-of-date or suboptimal present schedules a rebuild for the next
    /// `begin_frame`; it is never handled mid-frame.
    pub fn end_frame(&mut self) -> Result<()> {
        let FrameState::Recording {
            image_index,
            command_buffer,
        } = self.state
        else {
            panic!("end_frame called without begin_frame, or inside a render pass");
        };
        self.state = FrameState::Idle;

        self.backend.end_commands(command_buffer)?;
        match self.backend.submit_and_present(command_buffer, image_index)? {
            PresentOutcome::Presented => {}
            PresentOutcome::NeedsRecreate => {
                log::debug!("Surface out of date on present, recreating next frame");
                self.pending_recreate = true;
            }
        }

        self.stats.frames_submitted += 1;
        Ok(())
    }

    pub fn begin_render_pass(&mut self, command_buffer: vk::CommandBuffer) {
        let FrameState::Recording {
            image_index,
            command_buffer: current,
        } = self.state
        else {
            panic!("begin_render_pass called outside a frame or inside another render pass");
        };
        assert_eq!(
            command_buffer, current,
            "begin_render_pass on a command buffer from a different frame"
        );

        self.backend
            .begin_render_pass(command_buffer, image_index, &self.clear);
        self.state = FrameState::InRenderPass {
            image_index,
            command_buffer,
        };
    }

    pub fn end_render_pass(&mut self, command_buffer: vk::CommandBuffer) {
        let FrameState::InRenderPass {
            image_index,
            command_buffer: current,
        } = self.state
        else {
            panic!("end_render_pass called without begin_render_pass");
        };
        assert_eq!(
            command_buffer, current,
            "end_render_pass on a command buffer from a different frame"
        );

        self.backend.end_render_pass(command_buffer);
        self.state = FrameState::Recording {
            image_index,
            command_buffer,
        };
    }

    /// Let every registered system record its draws into the open render pass.
    pub fn draw_systems(&mut self, frame_time: f32, global_descriptor_set: vk::DescriptorSet) {
        let FrameState::InRenderPass { command_buffer, .. } = self.state else {
            panic!("draw_systems called outside a render pass");
        };

        let frame = FrameInfo {
            frame_index: self.backend.frame_slot(),
            frame_time,
            command_buffer,
            global_descriptor_set,
            extent: self.backend.extent(),
        };
        for system in &mut self.systems {
            system.submit_draws(&frame);
        }
    }

    fn recreate_chain(&mut self, extent: vk::Extent2D) -> Result<()> {
        let previous = self.backend.shape();

        self.backend.recreate(extent)?;

        let shape = self.backend.shape();
        shape.validate()?;
        self.pending_recreate = false;
        self.stats.chain_recreations += 1;

        log::info!(
            "Presentation chain recreated: {}x{} -> {}x{}",
            previous.extent.width,
            previous.extent.height,
            shape.extent.width,
            shape.extent.height
        );

        if !shape.formats_match(&previous) {
            log::info!(
                "Attachment formats changed ({:?}/{:?} -> {:?}/{:?}), rebuilding {} pipelines",
                previous.color_format,
                previous.depth_format,
                shape.color_format,
                shape.depth_format,
                self.systems.len()
            );
            let render_pass = self.backend.render_pass();
            for system in &mut self.systems {
                system.build_pipeline(render_pass)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // SYSTEMS
    // =========================================================================

    /// Register a render system and build its pipeline for the current chain.
    pub fn add_system(
        &mut self,
        mut system: Box<dyn RenderSystem>,
        global_set_layout: vk::DescriptorSetLayout,
    ) -> Result<()> {
        system.build_pipeline_layout(global_set_layout)?;
        system.build_pipeline(self.backend.render_pass())?;
        log::info!("Registered render system: {}", system.name());
        self.systems.push(system);
        Ok(())
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn is_frame_in_progress(&self) -> bool {
        self.state != FrameState::Idle
    }

    pub fn current_command_buffer(&self) -> vk::CommandBuffer {
        match self.state {
            FrameState::Recording { command_buffer, .. }
            | FrameState::InRenderPass { command_buffer, .. } => command_buffer,
            FrameState::Idle => panic!("no frame in progress"),
        }
    }

    /// Frame slot of the frame being recorded (or the next one).
    pub fn frame_index(&self) -> usize {
        self.backend.frame_slot()
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.backend.render_pass()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.backend.extent()
    }

    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.backend.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear.color = color;
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: FrameBackend> Drop for Renderer<B> {
    fn drop(&mut self) {
        // Command buffers, semaphores and framebuffers go away with us
        if let Err(e) = self.backend.wait_idle() {
            log::error!("Failed waiting for device idle on shutdown: {:#}", e);
        }
    }
}
