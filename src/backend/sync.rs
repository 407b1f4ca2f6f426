// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync
// Critical for correct and efficient multi-frame rendering
//
// Two frames are recorded ahead at most. Each frame slot owns a fence; each
// presentable image remembers which slot's fence last claimed it so the CPU
// never re-records into an image the GPU is still reading.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::GraphicsDevice;

/// Frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &Arc<GraphicsDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Signaled so the very first wait on each slot returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let device = &device.device;
        unsafe {
            let image_available = device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create image-available semaphore")?;
            let render_finished = match device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.destroy_semaphore(image_available, None);
                    return Err(e).context("Failed to create render-finished semaphore");
                }
            };
            let in_flight_fence = match device.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(e) => {
                    device.destroy_semaphore(image_available, None);
                    device.destroy_semaphore(render_finished, None);
                    return Err(e).context("Failed to create in-flight fence");
                }
            };

            Ok(Self {
                image_available,
                render_finished,
                in_flight_fence,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Slot rotation plus the per-image guard table.
///
/// Generic over the fence handle so the bookkeeping can be driven without
/// a GPU. `F` is `vk::Fence` in the real chain.
#[derive(Debug, Clone)]
pub struct InFlightFrames<F> {
    fences: Vec<F>,
    images_in_flight: Vec<Option<F>>,
    current: usize,
}

impl<F: Copy + PartialEq> InFlightFrames<F> {
    /// `fences` holds one fence per slot. `start_slot` carries the rotation
    /// over from a replaced chain.
    pub fn new(fences: Vec<F>, image_count: usize, start_slot: usize) -> Self {
        assert!(!fences.is_empty(), "at least one frame slot is required");
        let current = start_slot % fences.len();
        Self {
            fences,
            images_in_flight: vec![None; image_count],
            current,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.fences.len()
    }

    pub fn image_count(&self) -> usize {
        self.images_in_flight.len()
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn current_fence(&self) -> F {
        self.fences[self.current]
    }

    /// Block on the current slot's fence.
    pub fn wait_current<W>(&self, mut wait: W) -> Result<()>
    where
        W: FnMut(F) -> Result<()>,
    {
        wait(self.current_fence())
    }

    /// Fence still guarding `image` from a different slot, if any.
    pub fn guard_for_image(&self, image: usize) -> Option<F> {
        self.images_in_flight[image].filter(|&fence| fence != self.current_fence())
    }

    /// Wait out any other slot still using `image`, then claim it for the
    /// current slot. Returns the fence the submission must signal.
    pub fn prepare_submit<W>(&mut self, image: usize, mut wait: W) -> Result<F>
    where
        W: FnMut(F) -> Result<()>,
    {
        if let Some(guard) = self.guard_for_image(image) {
            wait(guard)?;
        }
        let fence = self.current_fence();
        self.images_in_flight[image] = Some(fence);
        Ok(fence)
    }

    /// Rotate to the next slot. Called once per submitted frame.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.fences.len();
    }
}
