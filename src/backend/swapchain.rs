// Presentation chain - Window presentation
//
// One generation of everything that depends on the surface size: the
// swapchain images and views, per-image depth attachments, the render pass
// they are compatible with, one framebuffer per image, and the per-slot
// sync objects. A resize never patches a generation in place; a new one is
// built (handing the old swapchain over as a hint) and the old one dropped.
//
// Construction order: swapchain -> views -> render pass -> depth ->
// framebuffers -> sync. Fields start out null and are filled step by step,
// so dropping a half-built chain releases exactly what was created.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use std::sync::Arc;

use super::sync::{FrameSync, InFlightFrames, MAX_FRAMES_IN_FLIGHT};
use super::GraphicsDevice;
use crate::error::GpuError;

/// Result of asking the chain for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready { image_index: u32, suboptimal: bool },
    /// The surface changed under us; rebuild before rendering again.
    OutOfDate,
}

/// Result of submitting and presenting one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Presented (or dropped) but the surface is out of date or suboptimal.
    NeedsRecreate,
}

/// Structural summary of a chain generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainShape {
    pub image_count: usize,
    pub view_count: usize,
    pub depth_count: usize,
    pub framebuffer_count: usize,
    pub extent: vk::Extent2D,
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
}

impl ChainShape {
    /// Check the invariants every generation must satisfy.
    pub fn validate(&self) -> Result<(), GpuError> {
        if self.image_count < 2 {
            return Err(GpuError::MalformedChain(format!(
                "expected at least 2 images, got {}",
                self.image_count
            )));
        }
        let counts = [self.view_count, self.depth_count, self.framebuffer_count];
        if counts.iter().any(|&count| count != self.image_count) {
            return Err(GpuError::MalformedChain(format!(
                "{} images but {} views, {} depth attachments, {} framebuffers",
                self.image_count, self.view_count, self.depth_count, self.framebuffer_count
            )));
        }
        if self.extent.width == 0 || self.extent.height == 0 {
            return Err(GpuError::MalformedChain(format!(
                "zero-area extent {}x{}",
                self.extent.width, self.extent.height
            )));
        }
        if self.color_format == vk::Format::UNDEFINED || self.depth_format == vk::Format::UNDEFINED {
            return Err(GpuError::MalformedChain("undefined attachment format".into()));
        }
        Ok(())
    }

    /// Whether pipelines built for `other` remain compatible with `self`.
    pub fn formats_match(&self, other: &ChainShape) -> bool {
        self.color_format == other.color_format && self.depth_format == other.depth_format
    }
}

/// Prefer B8G8R8A8_SRGB / SRGB_NONLINEAR, fall back to the first format.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// Preferred mode if available, then MAILBOX, then FIFO (always supported).
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    [preferred, vk::PresentModeKHR::MAILBOX]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// The surface's current extent, or the window extent clamped to the
/// supported range when the surface leaves it undefined.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: window
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: window
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, bounded by the maximum (0 means unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

struct DepthAttachment {
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
}

pub struct PresentationChain {
    device: Arc<GraphicsDevice>,
    loader: khr::Swapchain,
    swapchain: vk::SwapchainKHR,

    image_format: vk::Format,
    depth_format: vk::Format,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,

    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    depth: Vec<DepthAttachment>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,

    sync: Vec<FrameSync>,
    frames: InFlightFrames<vk::Fence>,
}

impl PresentationChain {
    /// Build a generation for `window_extent`.
    ///
    /// With `previous` set, its swapchain is handed to the driver for reuse
    /// and the frame-slot rotation continues where it left off. The caller
    /// must make sure the device is idle before dropping `previous`.
    pub fn new(
        device: Arc<GraphicsDevice>,
        window_extent: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
        previous: Option<&PresentationChain>,
    ) -> Result<Self> {
        log::info!(
            "Creating presentation chain: {}x{}",
            window_extent.width,
            window_extent.height
        );

        let loader = khr::Swapchain::new(&device.instance, &device.device);
        let mut chain = Self {
            device,
            loader,
            swapchain: vk::SwapchainKHR::null(),
            image_format: vk::Format::UNDEFINED,
            depth_format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            images: Vec::new(),
            image_views: Vec::new(),
            depth: Vec::new(),
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            sync: Vec::new(),
            // Replaced once the fences exist
            frames: InFlightFrames::new(vec![vk::Fence::null()], 0, 0),
        };

        let old_swapchain = previous.map_or(vk::SwapchainKHR::null(), |p| p.swapchain);
        let start_slot = previous.map_or(0, |p| p.current_slot());

        chain.create_swapchain(window_extent, preferred_present_mode, old_swapchain)?;
        chain.create_image_views()?;
        chain.create_render_pass()?;
        chain.create_depth_resources()?;
        chain.create_framebuffers()?;
        chain.create_sync_objects(start_slot)?;

        log::info!(
            "Presentation chain ready: {} images, {:?}, {:?}, depth {:?}",
            chain.images.len(),
            chain.image_format,
            chain.present_mode,
            chain.depth_format
        );

        Ok(chain)
    }

    fn create_swapchain(
        &mut self,
        window_extent: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<()> {
        let support = self.device.surface_support()?;
        let caps = support.capabilities;

        let surface_format =
            choose_surface_format(&support.formats).context("Surface reports no formats")?;
        let present_mode = choose_present_mode(&support.present_modes, preferred_present_mode);
        let extent = choose_extent(&caps, window_extent);
        let image_count = choose_image_count(&caps);

        let families = self.device.queue_families;
        let family_indices = [families.graphics, families.present];

        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.device.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        create_info = if families.is_shared() {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        };

        self.swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;
        self.images = unsafe { self.loader.get_swapchain_images(self.swapchain) }
            .context("Failed to get swapchain images")?;

        self.image_format = surface_format.format;
        self.present_mode = present_mode;
        self.extent = extent;
        Ok(())
    }

    fn create_image_views(&mut self) -> Result<()> {
        for &image in &self.images {
            let view = create_view(
                &self.device.device,
                image,
                self.image_format,
                vk::ImageAspectFlags::COLOR,
            )
            .context("Failed to create swapchain image view")?;
            self.image_views.push(view);
        }
        Ok(())
    }

    fn create_render_pass(&mut self) -> Result<()> {
        self.depth_format = self.device.find_depth_format()?;

        // Color attachment (the swapchain image)
        let color_attachment = vk::AttachmentDescription::builder()
            .format(self.image_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build();

        // Depth is discarded after the pass
        let depth_attachment = vk::AttachmentDescription::builder()
            .format(self.depth_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build();

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .depth_stencil_attachment(&depth_ref)
            .build();

        // Previous frame's attachment writes must finish before ours start
        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(stages)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .build();

        let attachments = [color_attachment, depth_attachment];
        let subpasses = [subpass];
        let dependencies = [dependency];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        self.render_pass = unsafe { self.device.device.create_render_pass(&render_pass_info, None) }
            .context("Failed to create render pass")?;
        Ok(())
    }

    fn create_depth_resources(&mut self) -> Result<()> {
        for _ in 0..self.images.len() {
            let image_info = vk::ImageCreateInfo::builder()
                .image_type(vk::ImageType::TYPE_2D)
                .extent(vk::Extent3D {
                    width: self.extent.width,
                    height: self.extent.height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .format(self.depth_format)
                .tiling(vk::ImageTiling::OPTIMAL)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
                .samples(vk::SampleCountFlags::TYPE_1)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);

            let (image, memory) = self
                .device
                .create_image_with_info(&image_info, vk::MemoryPropertyFlags::DEVICE_LOCAL)
                .context("Failed to create depth image")?;

            let view = match create_view(
                &self.device.device,
                image,
                self.depth_format,
                vk::ImageAspectFlags::DEPTH,
            ) {
                Ok(view) => view,
                Err(e) => {
                    unsafe {
                        self.device.device.destroy_image(image, None);
                        self.device.device.free_memory(memory, None);
                    }
                    return Err(e).context("Failed to create depth image view");
                }
            };

            self.depth.push(DepthAttachment { image, memory, view });
        }
        Ok(())
    }

    fn create_framebuffers(&mut self) -> Result<()> {
        for (&color, depth) in self.image_views.iter().zip(&self.depth) {
            let attachments = [color, depth.view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);

            let framebuffer = unsafe {
                self.device
                    .device
                    .create_framebuffer(&framebuffer_info, None)
            }
            .context("Failed to create framebuffer")?;
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    fn create_sync_objects(&mut self, start_slot: usize) -> Result<()> {
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            self.sync.push(FrameSync::new(&self.device)?);
        }
        let fences = self.sync.iter().map(|s| s.in_flight_fence).collect();
        self.frames = InFlightFrames::new(fences, self.images.len(), start_slot);
        Ok(())
    }

    // =========================================================================
    // FRAME CYCLE
    // =========================================================================

    /// Wait for the current slot to retire, then acquire the next image.
    ///
    /// This is the throttling point: at most `MAX_FRAMES_IN_FLIGHT` frames
    /// are ever submitted but unretired.
    pub fn acquire_next_image(&mut self) -> Result<AcquireOutcome> {
        let device = &self.device.device;
        self.frames.wait_current(|fence| {
            unsafe { device.wait_for_fences(&[fence], true, u64::MAX) }
                .context("Failed waiting for frame fence")
        })?;

        let semaphore = self.sync[self.frames.current_slot()].image_available;
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Ready {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Submit `command_buffer` for `image_index` and queue it for presentation.
    pub fn submit_and_present(
        &mut self,
        command_buffer: vk::CommandBuffer,
        image_index: u32,
    ) -> Result<PresentOutcome> {
        let device = &self.device.device;

        // Another slot may still be rendering into this image
        let fence = self.frames.prepare_submit(image_index as usize, |guard| {
            unsafe { device.wait_for_fences(&[guard], true, u64::MAX) }
                .context("Failed waiting for image fence")
        })?;

        let sync = &self.sync[self.frames.current_slot()];
        let wait_semaphores = [sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [command_buffer];
        let signal_semaphores = [sync.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            device
                .reset_fences(&[fence])
                .context("Failed to reset frame fence")?;
            device
                .queue_submit(self.device.graphics_queue, &[submit_info], fence)
                .context("Failed to submit draw command buffer")?;
        }

        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.loader
                .queue_present(self.device.present_queue, &present_info)
        };

        let outcome = match result {
            Ok(false) => PresentOutcome::Presented,
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => PresentOutcome::NeedsRecreate,
            Err(e) => return Err(e).context("Failed to present swapchain image"),
        };

        self.frames.advance();
        Ok(outcome)
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.framebuffers[image_index as usize]
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_format(&self) -> vk::Format {
        self.image_format
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn current_slot(&self) -> usize {
        self.frames.current_slot()
    }

    pub fn extent_aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height as f32
    }

    pub fn shape(&self) -> ChainShape {
        ChainShape {
            image_count: self.images.len(),
            view_count: self.image_views.len(),
            depth_count: self.depth.len(),
            framebuffer_count: self.framebuffers.len(),
            extent: self.extent,
            color_format: self.image_format,
            depth_format: self.depth_format,
        }
    }
}

impl Drop for PresentationChain {
    fn drop(&mut self) {
        log::debug!(
            "Destroying presentation chain ({}x{})",
            self.extent.width,
            self.extent.height
        );

        let device = &self.device.device;
        unsafe {
            for sync in &self.sync {
                sync.destroy(device);
            }
            for &framebuffer in &self.framebuffers {
                device.destroy_framebuffer(framebuffer, None);
            }
            for depth in &self.depth {
                device.destroy_image_view(depth.view, None);
                device.destroy_image(depth.image, None);
                device.free_memory(depth.memory, None);
            }
            device.destroy_render_pass(self.render_pass, None);
            for &view in &self.image_views {
                device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

fn create_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect_mask: vk::ImageAspectFlags,
) -> Result<vk::ImageView, vk::Result> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    unsafe { device.create_image_view(&create_info, None) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: current.0, height: current.1 },
            min_image_extent: vk::Extent2D { width: min.0, height: min.1 },
            max_image_extent: vk::Extent2D { width: max.0, height: max.1 },
            ..Default::default()
        }
    }

    fn shape() -> ChainShape {
        ChainShape {
            image_count: 3,
            view_count: 3,
            depth_count: 3,
            framebuffer_count: 3,
            extent: vk::Extent2D { width: 800, height: 600 },
            color_format: vk::Format::B8G8R8A8_SRGB,
            depth_format: vk::Format::D32_SFLOAT,
        }
    }

    #[test]
    fn prefers_srgb_surface_format() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::B8G8R8A8_SRGB
        );
    }

    #[test]
    fn falls_back_to_first_surface_format() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::R8G8B8A8_UNORM
        );
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn present_mode_fallback_order() {
        use vk::PresentModeKHR as P;
        assert_eq!(choose_present_mode(&[P::FIFO, P::IMMEDIATE], P::IMMEDIATE), P::IMMEDIATE);
        assert_eq!(choose_present_mode(&[P::FIFO, P::MAILBOX], P::IMMEDIATE), P::MAILBOX);
        assert_eq!(choose_present_mode(&[P::FIFO], P::MAILBOX), P::FIFO);
    }

    #[test]
    fn defined_current_extent_wins() {
        let caps = caps((800, 600), (1, 1), (4096, 4096));
        let extent = choose_extent(&caps, vk::Extent2D { width: 1024, height: 768 });
        assert_eq!(extent, vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn undefined_current_extent_is_clamped() {
        let caps = caps((u32::MAX, u32::MAX), (100, 100), (1920, 1080));
        let extent = choose_extent(&caps, vk::Extent2D { width: 4000, height: 50 });
        assert_eq!(extent, vk::Extent2D { width: 1920, height: 100 });
    }

    #[test]
    fn image_count_is_min_plus_one_within_bounds() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);
    }

    #[test]
    fn well_formed_shape_validates() {
        assert!(shape().validate().is_ok());
    }

    #[test]
    fn malformed_shapes_are_rejected() {
        let single = ChainShape { image_count: 1, view_count: 1, depth_count: 1, framebuffer_count: 1, ..shape() };
        assert!(matches!(single.validate(), Err(GpuError::MalformedChain(_))));

        let missing_fb = ChainShape { framebuffer_count: 2, ..shape() };
        assert!(matches!(missing_fb.validate(), Err(GpuError::MalformedChain(_))));

        let empty = ChainShape { extent: vk::Extent2D { width: 0, height: 600 }, ..shape() };
        assert!(matches!(empty.validate(), Err(GpuError::MalformedChain(_))));
    }

    #[test]
    fn formats_match_ignores_extent() {
        let resized = ChainShape { extent: vk::Extent2D { width: 640, height: 480 }, ..shape() };
        assert!(shape().formats_match(&resized));

        let hdr = ChainShape { color_format: vk::Format::A2B10G10R10_UNORM_PACK32, ..shape() };
        assert!(!shape().formats_match(&hdr));
    }
}
