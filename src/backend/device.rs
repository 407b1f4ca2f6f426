// Graphics Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with optional validation layers
// - Presentable surface from the window provider's raw handles
// - Physical device selection (present support, graphics+compute queue,
//   swapchain extension, anisotropic sampling; prefer discrete GPU)
// - Logical device + graphics/present queues + command pool
// - Memory-type resolution, buffer/image allocation, one-shot commands
//
// Exactly one of these exists per process. Everything else holds an
// Arc<GraphicsDevice>, so the device is always the last thing destroyed.

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::{CStr, CString};
use std::sync::Arc;

use crate::error::GpuError;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Depth formats tried in order when building depth attachments.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Queue family search result. Either slot may be missing on a given adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

/// Resolved queue family indices for the selected adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Find a graphics+compute family and a family that can present.
    ///
    /// A single family doing both is preferred; otherwise the first match of
    /// each kind wins.
    pub fn find(
        families: &[vk::QueueFamilyProperties],
        mut supports_present: impl FnMut(u32) -> bool,
    ) -> Self {
        let required = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
        let mut found = Self::default();

        for (index, family) in families.iter().enumerate() {
            if family.queue_count == 0 {
                continue;
            }
            let index = index as u32;
            let graphics = family.queue_flags.contains(required);
            let present = supports_present(index);

            if graphics && present {
                return Self {
                    graphics: Some(index),
                    present: Some(index),
                };
            }
            if graphics && found.graphics.is_none() {
                found.graphics = Some(index);
            }
            if present && found.present.is_none() {
                found.present = Some(index);
            }
        }

        found
    }

    pub fn resolve(self) -> Option<QueueFamilyIndices> {
        Some(QueueFamilyIndices {
            graphics: self.graphics?,
            present: self.present?,
        })
    }
}

impl QueueFamilyIndices {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, one queue is created per entry.
    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Surface capabilities, formats and present modes for one adapter.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// First memory type allowed by `type_mask` that has every requested property.
pub fn memory_type_index(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_mask: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32, GpuError> {
    let count = memory_properties.memory_type_count as usize;
    memory_properties.memory_types[..count]
        .iter()
        .enumerate()
        .find(|(i, memory_type)| {
            type_mask & (1 << i) != 0 && memory_type.property_flags.contains(properties)
        })
        .map(|(i, _)| i as u32)
        .ok_or(GpuError::NoCompatibleMemoryType {
            type_mask,
            properties,
        })
}

/// First candidate whose tiling-specific feature set covers `features`.
pub fn select_supported_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    mut properties_of: impl FnMut(vk::Format) -> vk::FormatProperties,
) -> Result<vk::Format, GpuError> {
    candidates
        .iter()
        .copied()
        .find(|&format| {
            let props = properties_of(format);
            match tiling {
                vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
                vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
                _ => false,
            }
        })
        .ok_or_else(|| GpuError::NoSupportedFormat {
            candidates: candidates.to_vec(),
            tiling,
            features,
        })
}

/// Names from `required` that do not appear in `available`.
pub fn missing_extensions(required: &[&CStr], available: &[vk::ExtensionProperties]) -> Vec<String> {
    required
        .iter()
        .filter(|name| {
            !available.iter().any(|ext| {
                // SAFETY: the driver fills extension_name with a NUL-terminated string
                let ext_name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
                ext_name == **name
            })
        })
        .map(|name| name.to_string_lossy().into_owned())
        .collect()
}

/// Device extensions every adapter must expose.
fn required_device_extensions() -> [&'static CStr; 1] {
    [khr::Swapchain::name()]
}

/// Logical device, queues and command pool, plus the surface they present to.
pub struct GraphicsDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    pub surface: vk::SurfaceKHR,
    pub surface_loader: khr::Surface,

    pub queue_families: QueueFamilyIndices,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,

    command_pool: vk::CommandPool,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,

    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl GraphicsDevice {
    /// Create the device for the given window.
    ///
    /// Every failure here is fatal: no frame can be produced without a device.
    pub fn new<W>(app_name: &str, enable_validation: bool, window: &W) -> Result<Arc<Self>>
    where
        W: HasRawDisplayHandle + HasRawWindowHandle,
    {
        log::info!("Creating graphics device: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let display_handle = window.raw_display_handle();
        let window_handle = window.raw_window_handle();

        let instance = Self::create_instance(&entry, app_name, display_handle, enable_validation)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        }
        .context("Failed to create window surface")?;
        let surface_loader = khr::Surface::new(&entry, &instance);

        let (physical_device, queue_families) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        let (device, graphics_queue, present_queue) =
            Self::create_logical_device(&instance, physical_device, queue_families)?;

        let command_pool = Self::create_command_pool(&device, queue_families.graphics)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "Queue families: graphics={} present={}",
            queue_families.graphics,
            queue_families.present
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            _entry: entry,
            surface,
            surface_loader,
            queue_families,
            graphics_queue,
            present_queue,
            command_pool,
            debug_utils,
            properties,
            memory_properties,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        display_handle: raw_window_handle::RawDisplayHandle,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        if enable_validation {
            let layers = entry
                .enumerate_instance_layer_properties()
                .context("Failed to enumerate instance layers")?;
            let present = layers.iter().any(|layer| {
                // SAFETY: layer_name is NUL-terminated by the loader
                let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
                name == VALIDATION_LAYER
            });
            if !present {
                return Err(GpuError::MissingLayer(VALIDATION_LAYER.to_string_lossy().into_owned()).into());
            }
        }

        let app_name_cstr = CString::new(app_name)?;
        let engine_name = c"vkframe";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("Failed to query surface extensions")?
            .to_vec();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let available = entry
            .enumerate_instance_extension_properties(None)
            .context("Failed to enumerate instance extensions")?;
        let wanted: Vec<&CStr> = extensions
            .iter()
            // SAFETY: every pointer comes from a 'static CStr
            .map(|&ptr| unsafe { CStr::from_ptr(ptr) })
            .collect();
        if let Some(name) = missing_extensions(&wanted, &available).into_iter().next() {
            return Err(GpuError::MissingExtension(name).into());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        // Also hooks instance creation/destruction messages
        let mut debug_info = debug_messenger_info();
        let mut create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);
        if enable_validation {
            create_info = create_info.push_next(&mut debug_info);
        }

        unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);
        let messenger = unsafe {
            debug_utils.create_debug_utils_messenger(&debug_messenger_info(), None)
        }
        .context("Failed to create debug messenger")?;
        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;
        log::info!("Device count: {}", devices.len());

        let mut best: Option<(u32, vk::PhysicalDevice, QueueFamilyIndices)> = None;

        for physical_device in devices {
            let props = unsafe { instance.get_physical_device_properties(physical_device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();

            let features = unsafe { instance.get_physical_device_features(physical_device) };
            if features.sampler_anisotropy != vk::TRUE {
                log::debug!("Skipping {}: no anisotropic sampling", name);
                continue;
            }

            let families =
                unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
            let Some(indices) = QueueFamilies::find(&families, |index| unsafe {
                surface_loader
                    .get_physical_device_surface_support(physical_device, index, surface)
                    .unwrap_or(false)
            })
            .resolve() else {
                log::debug!("Skipping {}: missing graphics or present queue", name);
                continue;
            };

            let available =
                unsafe { instance.enumerate_device_extension_properties(physical_device) }
                    .unwrap_or_default();
            let missing = missing_extensions(&required_device_extensions(), &available);
            if !missing.is_empty() {
                log::debug!("Skipping {}: missing extensions {:?}", name, missing);
                continue;
            }

            let support = query_surface_support(surface_loader, physical_device, surface)?;
            if !support.is_adequate() {
                log::debug!("Skipping {}: no surface formats or present modes", name);
                continue;
            }

            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };
            if best.map_or(true, |(best_score, ..)| score > best_score) {
                best = Some((score, physical_device, indices));
            }
        }

        best.map(|(_, device, indices)| (device, indices))
            .ok_or_else(|| GpuError::NoSuitableAdapter.into())
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: QueueFamilyIndices,
    ) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
        let priorities = [1.0];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let features = vk::PhysicalDeviceFeatures::builder().sampler_anisotropy(true);
        let extensions: Vec<*const std::ffi::c_char> = required_device_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(families.present, 0) };

        Ok((device, graphics_queue, present_queue))
    }

    fn create_command_pool(device: &ash::Device, graphics_family: u32) -> Result<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(graphics_family)
            // TRANSIENT: one-shot buffers; RESET: per-slot buffers re-record every frame
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );
        unsafe { device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    pub fn surface_support(&self) -> Result<SurfaceSupport> {
        query_surface_support(&self.surface_loader, self.physical_device, self.surface)
    }

    pub fn find_memory_type(
        &self,
        type_mask: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        Ok(memory_type_index(&self.memory_properties, type_mask, properties)?)
    }

    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> Result<vk::Format> {
        let format = select_supported_format(candidates, tiling, features, |format| unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        })?;
        Ok(format)
    }

    pub fn find_depth_format(&self) -> Result<vk::Format> {
        self.find_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )
    }

    pub fn min_uniform_buffer_offset_alignment(&self) -> vk::DeviceSize {
        self.properties.limits.min_uniform_buffer_offset_alignment
    }

    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.properties.limits.non_coherent_atom_size
    }

    // =========================================================================
    // ALLOCATION
    // =========================================================================

    /// Create a buffer and bind it to freshly allocated memory.
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(driver_error)
            .context("Failed to create buffer")?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let memory_type = match memory_type_index(
            &self.memory_properties,
            requirements.memory_type_bits,
            properties,
        ) {
            Ok(index) => index,
            Err(_) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(GpuError::UnsupportedUsage { usage, properties }.into());
            }
        };

        let memory = match self.allocate(requirements.size, memory_type) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e.context("Failed to allocate buffer memory"));
            }
        };

        if let Err(e) = unsafe { self.device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                self.device.destroy_buffer(buffer, None);
                self.device.free_memory(memory, None);
            }
            return Err(driver_error(e).context("Failed to bind buffer memory"));
        }

        Ok((buffer, memory))
    }

    /// Create an image from `info` and bind it to memory with `properties`.
    pub fn create_image_with_info(
        &self,
        info: &vk::ImageCreateInfo,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<(vk::Image, vk::DeviceMemory)> {
        let image = unsafe { self.device.create_image(info, None) }
            .map_err(driver_error)
            .context("Failed to create image")?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let memory = memory_type_index(&self.memory_properties, requirements.memory_type_bits, properties)
            .map_err(anyhow::Error::from)
            .and_then(|memory_type| self.allocate(requirements.size, memory_type));

        let memory = match memory {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e.context("Failed to allocate image memory"));
            }
        };

        if let Err(e) = unsafe { self.device.bind_image_memory(image, memory, 0) } {
            unsafe {
                self.device.destroy_image(image, None);
                self.device.free_memory(memory, None);
            }
            return Err(driver_error(e).context("Failed to bind image memory"));
        }

        Ok((image, memory))
    }

    fn allocate(&self, size: vk::DeviceSize, memory_type: u32) -> Result<vk::DeviceMemory> {
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type);
        unsafe { self.device.allocate_memory(&alloc_info, None) }.map_err(driver_error)
    }

    // =========================================================================
    // ONE-SHOT COMMANDS
    // =========================================================================

    /// Record `record` into a transient command buffer, submit it and wait
    /// for the graphics queue to go idle.
    ///
    /// Stalls the queue: upload and setup paths only, never per frame.
    pub fn run_one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffer = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate one-shot command buffer")?[0];

        let result = self.submit_one_shot(command_buffer, record);

        unsafe {
            self.device
                .free_command_buffers(self.command_pool, &[command_buffer])
        };

        result
    }

    fn submit_one_shot<F>(&self, command_buffer: vk::CommandBuffer, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .begin_command_buffer(command_buffer, &begin_info)
                .context("Failed to begin one-shot command buffer")?;

            record(&self.device, command_buffer);

            self.device
                .end_command_buffer(command_buffer)
                .context("Failed to end one-shot command buffer")?;

            let command_buffers = [command_buffer];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            self.device
                .queue_submit(self.graphics_queue, &[submit_info.build()], vk::Fence::null())
                .context("Failed to submit one-shot command buffer")?;
            self.device
                .queue_wait_idle(self.graphics_queue)
                .context("Failed waiting for one-shot command buffer")?;
        }

        Ok(())
    }

    /// Copy `region` from `src` to `dst` and wait for completion.
    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, region: vk::BufferCopy) -> Result<()> {
        self.run_one_shot(|device, cmd| unsafe {
            device.cmd_copy_buffer(cmd, src, dst, &[region]);
        })
    }

    /// Copy tightly packed texels from `buffer` into mip 0 of `image`, which
    /// must already be in TRANSFER_DST_OPTIMAL.
    pub fn copy_buffer_to_image(
        &self,
        buffer: vk::Buffer,
        image: vk::Image,
        width: u32,
        height: u32,
        layer_count: u32,
    ) -> Result<()> {
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
        };
        self.run_one_shot(|device, cmd| unsafe {
            device.cmd_copy_buffer_to_image(
                cmd,
                buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        })
    }

    /// Move every mip and layer of `image` from `old_layout` to `new_layout`
    /// with a single pipeline barrier.
    pub fn transition_image_layout(
        &self,
        image: vk::Image,
        format: vk::Format,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        mip_levels: u32,
        layer_count: u32,
    ) -> Result<()> {
        let masks = LayoutTransition::between(old_layout, new_layout)?;
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_mask_for(format, new_layout),
                base_mip_level: 0,
                level_count: mip_levels,
                base_array_layer: 0,
                layer_count,
            })
            .src_access_mask(masks.src_access)
            .dst_access_mask(masks.dst_access)
            .build();

        self.run_one_shot(|device, cmd| unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                masks.src_stage,
                masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        })
    }

    /// Wait for device to be idle (e.g., before cleanup or chain replacement)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed waiting for device idle")
    }
}

impl Drop for GraphicsDevice {
    fn drop(&mut self) {
        log::info!("Destroying graphics device...");

        let _ = self.wait_idle();

        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

fn query_surface_support(
    surface_loader: &khr::Surface,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> Result<SurfaceSupport> {
    unsafe {
        Ok(SurfaceSupport {
            capabilities: surface_loader
                .get_physical_device_surface_capabilities(physical_device, surface)
                .context("Failed to query surface capabilities")?,
            formats: surface_loader
                .get_physical_device_surface_formats(physical_device, surface)
                .context("Failed to query surface formats")?,
            present_modes: surface_loader
                .get_physical_device_surface_present_modes(physical_device, surface)
                .context("Failed to query present modes")?,
        })
    }
}

/// Access and stage masks for one supported layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl LayoutTransition {
    /// Masks for the upload paths: fresh image to transfer destination,
    /// transfer destination to sampled, fresh image to depth attachment.
    pub fn between(
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Result<Self, GpuError> {
        use vk::ImageLayout as L;
        match (old_layout, new_layout) {
            (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => Ok(Self {
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::TRANSFER_WRITE,
                src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                dst_stage: vk::PipelineStageFlags::TRANSFER,
            }),
            (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => Ok(Self {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            }),
            (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => Ok(Self {
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            }),
            _ => Err(GpuError::UnsupportedLayoutTransition {
                from: old_layout,
                to: new_layout,
            }),
        }
    }
}

/// Depth (plus stencil when the format has it) for depth attachments, color otherwise.
pub fn aspect_mask_for(format: vk::Format, layout: vk::ImageLayout) -> vk::ImageAspectFlags {
    if layout != vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL {
        return vk::ImageAspectFlags::COLOR;
    }
    match format {
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

fn driver_error(result: vk::Result) -> anyhow::Error {
    if GpuError::is_out_of_memory(result) {
        GpuError::OutOfDeviceMemory.into()
    } else {
        result.into()
    }
}

fn debug_messenger_info() -> vk::DebugUtilsMessengerCreateInfoEXT {
    vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
        .build()
}

// Validation layer output goes through the log facade
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[Vulkan {:?}] {}", message_type, message);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[Vulkan {:?}] {}", message_type, message);
    } else {
        log::debug!("[Vulkan {:?}] {}", message_type, message);
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        props
    }

    fn extension(name: &CStr) -> vk::ExtensionProperties {
        let mut ext = vk::ExtensionProperties::default();
        for (dst, &src) in ext.extension_name.iter_mut().zip(name.to_bytes()) {
            *dst = src as std::ffi::c_char;
        }
        ext
    }

    #[test]
    fn queue_search_prefers_a_family_that_does_both() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        let found = QueueFamilies::find(&families, |index| index == 1);
        assert_eq!(found.resolve(), Some(QueueFamilyIndices { graphics: 1, present: 1 }));
    }

    #[test]
    fn queue_search_accepts_split_families() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::TRANSFER),
        ];
        let indices = QueueFamilies::find(&families, |index| index == 1)
            .resolve()
            .unwrap();
        assert_eq!(indices, QueueFamilyIndices { graphics: 0, present: 1 });
        assert!(!indices.is_shared());
        assert_eq!(indices.unique(), vec![0, 1]);
    }

    #[test]
    fn queue_search_requires_compute_alongside_graphics() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let found = QueueFamilies::find(&families, |_| true);
        assert_eq!(found.graphics, None);
        assert_eq!(found.resolve(), None);
    }

    #[test]
    fn memory_type_respects_mask_and_properties() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE;
        assert_eq!(memory_type_index(&props, 0b111, host).unwrap(), 1);
        // Type 1 masked out by the resource's requirements
        assert_eq!(memory_type_index(&props, 0b101, host).unwrap(), 2);
        assert_eq!(
            memory_type_index(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn memory_type_lookup_failure_is_typed() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let err = memory_type_index(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap_err();
        assert!(matches!(
            err,
            GpuError::NoCompatibleMemoryType { type_mask: 0b1, .. }
        ));
    }

    #[test]
    fn supported_format_checks_the_right_tiling() {
        let depth = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        let props_of = |format: vk::Format| match format {
            vk::Format::D32_SFLOAT => vk::FormatProperties {
                linear_tiling_features: depth,
                ..Default::default()
            },
            vk::Format::D24_UNORM_S8_UINT => vk::FormatProperties {
                optimal_tiling_features: depth,
                ..Default::default()
            },
            _ => vk::FormatProperties::default(),
        };

        let optimal = select_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            depth,
            props_of,
        )
        .unwrap();
        assert_eq!(optimal, vk::Format::D24_UNORM_S8_UINT);

        let linear = select_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::LINEAR,
            depth,
            props_of,
        )
        .unwrap();
        assert_eq!(linear, vk::Format::D32_SFLOAT);
    }

    #[test]
    fn no_supported_format_is_reported() {
        let err = select_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |_| vk::FormatProperties::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GpuError::NoSupportedFormat { ref candidates, .. } if candidates.len() == 3));
    }

    #[test]
    fn upload_transitions_chain_their_stages() {
        use vk::ImageLayout as L;
        let to_dst = LayoutTransition::between(L::UNDEFINED, L::TRANSFER_DST_OPTIMAL).unwrap();
        let to_sampled =
            LayoutTransition::between(L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL).unwrap();

        // The copy's writes must be visible to the sampling barrier
        assert_eq!(to_dst.dst_stage, to_sampled.src_stage);
        assert_eq!(to_dst.dst_access, to_sampled.src_access);
        assert_eq!(to_sampled.dst_access, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn unsupported_transition_is_typed() {
        let err = LayoutTransition::between(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            GpuError::UnsupportedLayoutTransition {
                from: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                ..
            }
        ));
    }

    #[test]
    fn depth_aspect_includes_stencil_only_when_present() {
        let depth = vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
        assert_eq!(aspect_mask_for(vk::Format::D32_SFLOAT, depth), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_mask_for(vk::Format::D24_UNORM_S8_UINT, depth),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_mask_for(vk::Format::R8G8B8A8_SRGB, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn missing_extensions_lists_only_absent_names() {
        let available = [extension(c"VK_KHR_swapchain"), extension(c"VK_KHR_maintenance1")];
        assert!(missing_extensions(&[c"VK_KHR_swapchain"], &available).is_empty());
        assert_eq!(
            missing_extensions(&[c"VK_KHR_swapchain", c"VK_EXT_missing"], &available),
            vec!["VK_EXT_missing".to_string()]
        );
    }
}
