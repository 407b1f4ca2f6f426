// =============================================================================
// VKFRAME DEMO - winit window driving the frame orchestration core
// =============================================================================
//
// FRAME FLOW:
// 1. begin_frame: poll resize, skip if minimized, rebuild chain if pending,
//    wait for this slot's fence, acquire an image
// 2. Write this slot's uniform block and flush it
// 3. Render pass: every registered system records its draws
// 4. end_frame: submit + present; an out-of-date surface is rebuilt next frame
//
// Any fatal error stops the event loop and is returned from main, so the
// process exits non-zero with the full error chain.
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use glam::Vec4;
use std::sync::Arc;
use std::time::Instant;
use vkframe::backend::{
    DescriptorPool, DescriptorPoolBuilder, DescriptorSetLayout, DescriptorSetLayoutBuilder,
    DescriptorWriter, GraphicsDevice, TransferBuffer, MAX_FRAMES_IN_FLIGHT,
};
use vkframe::backend::shader::load_spirv;
use vkframe::config::Config;
use vkframe::renderer::{Renderer, SurfaceProvider, VulkanFrameBackend, VulkanRenderer};
use vkframe::systems::{GlobalUbo, TriangleSystem};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();
    init_logging(&config);

    log::info!("Starting vkframe");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Level from config, RUST_LOG wins when set
fn init_logging(config: &Config) {
    env_logger::Builder::new()
        .parse_filters(&config.debug.log_level)
        .parse_default_env()
        .init();
}

// =============================================================================
// SURFACE PROVIDER
// =============================================================================

struct WindowSurface {
    window: Arc<Window>,
    resized: bool,
}

impl SurfaceProvider for WindowSurface {
    fn drawable_extent(&self) -> vk::Extent2D {
        let size = self.window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.resized)
    }
}

// =============================================================================
// GPU STATE
// =============================================================================

/// Field order is drop order: the renderer waits for the device to go idle
/// before anything it might still reference is destroyed.
struct GpuState {
    renderer: VulkanRenderer,
    global_sets: Vec<vk::DescriptorSet>,
    _global_pool: DescriptorPool,
    _global_layout: DescriptorSetLayout,
    /// One uniform block per frame slot, in a single buffer
    ubo: TransferBuffer,
    _device: Arc<GraphicsDevice>,
}

impl GpuState {
    fn new(config: &Config, window: &Window) -> Result<Self> {
        let device = GraphicsDevice::new(
            &config.window.title,
            config.debug.validation_layers,
            window,
        )?;

        let size = window.inner_size();
        let extent = vk::Extent2D {
            width: size.width.max(1),
            height: size.height.max(1),
        };
        let backend = VulkanFrameBackend::new(device.clone(), extent, config.present_mode())?;
        let mut renderer = Renderer::new(backend, config.clear_values());

        let mut ubo = TransferBuffer::new(
            device.clone(),
            std::mem::size_of::<GlobalUbo>() as vk::DeviceSize,
            MAX_FRAMES_IN_FLIGHT as u32,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            device.min_uniform_buffer_offset_alignment(),
        )?;
        ubo.map(vk::WHOLE_SIZE, 0)?;

        let global_layout = DescriptorSetLayoutBuilder::new()
            .add_binding(
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::ALL_GRAPHICS,
            )
            .build(&device)?;

        let mut global_pool = DescriptorPoolBuilder::new()
            .set_max_sets(MAX_FRAMES_IN_FLIGHT as u32)
            .add_pool_size(
                vk::DescriptorType::UNIFORM_BUFFER,
                MAX_FRAMES_IN_FLIGHT as u32,
            )
            .build(&device)?;

        let global_sets = (0..MAX_FRAMES_IN_FLIGHT as u32)
            .map(|slot| {
                DescriptorWriter::new(&global_layout, &mut global_pool)
                    .write_buffer(0, ubo.descriptor_info_for_index(slot))
                    .build()?
                    .context("Global descriptor pool exhausted")
            })
            .collect::<Result<Vec<_>>>()?;

        match load_triangle_shaders() {
            Ok((vert, frag)) => {
                let triangle = TriangleSystem::new(device.clone(), vert, frag)?;
                renderer.add_system(Box::new(triangle), global_layout.handle())?;
            }
            Err(e) => log::warn!("Shaders unavailable, rendering clear color only: {:#}", e),
        }

        Ok(Self {
            renderer,
            global_sets,
            _global_pool: global_pool,
            _global_layout: global_layout,
            ubo,
            _device: device,
        })
    }
}

fn load_triangle_shaders() -> Result<(Vec<u8>, Vec<u8>)> {
    let dir = concat!(env!("CARGO_MANIFEST_DIR"), "/shaders");
    let vert = load_spirv(format!("{dir}/triangle.vert.spv"))?;
    let frag = load_spirv(format!("{dir}/triangle.frag.spv"))?;
    Ok((vert, frag))
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,
    // Dropped before the window it renders into
    gpu: Option<GpuState>,
    surface: Option<WindowSurface>,
    is_fullscreen: bool,
    fatal: Option<anyhow::Error>,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            gpu: None,
            surface: None,
            is_fullscreen,
            fatal: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("Fatal: {:#}", error);
        self.fatal = Some(error);
        self.gpu = None;
        event_loop.exit();
    }

    /// Render one frame. Returns false when the frame was skipped.
    fn render_frame(&mut self) -> Result<bool> {
        let (Some(gpu), Some(surface)) = (self.gpu.as_mut(), self.surface.as_mut()) else {
            return Ok(false);
        };

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;

        let Some(cmd) = gpu.renderer.begin_frame(surface)? else {
            return Ok(false);
        };

        // begin_frame waited on this slot's fence, so its block is free
        let slot = gpu.renderer.frame_index() as u32;
        let ubo = GlobalUbo::for_aspect(gpu.renderer.aspect_ratio(), Vec4::ONE);
        gpu.ubo.write_to_index(&ubo, slot);
        gpu.ubo.flush_index(slot)?;

        gpu.renderer.begin_render_pass(cmd);
        gpu.renderer
            .draw_systems(frame_time, gpu.global_sets[slot as usize]);
        gpu.renderer.end_render_pass(cmd);
        gpu.renderer.end_frame()?;

        Ok(true)
    }

    fn toggle_fullscreen(&mut self) {
        let Some(surface) = self.surface.as_mut() else {
            return;
        };
        self.is_fullscreen = !self.is_fullscreen;

        if self.is_fullscreen {
            surface
                .window
                .set_fullscreen(Some(Fullscreen::Borderless(None)));
            log::info!("Entered fullscreen mode");
        } else {
            surface.window.set_fullscreen(None);
            log::info!("Exited fullscreen mode");
        }
        surface.resized = true;
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }
        self.frame_count += 1;

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed < 1.0 {
            return;
        }

        if let (Some(surface), Some(gpu)) = (&self.surface, &self.gpu) {
            let fps = self.frame_count as f32 / elapsed;
            let stats = gpu.renderer.stats();
            surface.window.set_title(&format!(
                "{} - {:.0} FPS [{} frames, {} recreations]",
                self.config.window.title, fps, stats.frames_submitted, stats.chain_recreations
            ));
        }

        self.frame_count = 0;
        self.last_fps_update = now;
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.surface.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));
        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match GpuState::new(&self.config, &window) {
            Ok(gpu) => self.gpu = Some(gpu),
            Err(e) => {
                self.fail(event_loop, e.context("Failed to initialize Vulkan"));
                return;
            }
        }

        self.surface = Some(WindowSurface {
            window,
            resized: false,
        });
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.gpu = None;
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(surface) = self.surface.as_mut() {
                    surface.resized = true;
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => self.fail(event_loop, e),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if !event.state.is_pressed() {
                    return;
                }
                match event.physical_key {
                    PhysicalKey::Code(KeyCode::Escape) => {
                        log::info!("ESC pressed, exiting...");
                        self.gpu = None;
                        event_loop.exit();
                    }
                    PhysicalKey::Code(KeyCode::F11) => self.toggle_fullscreen(),
                    _ => {}
                }
            }

            _ => {}
        }
    }

    /// Request the next frame, honouring the configured frame-rate cap.
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let Some(surface) = &self.surface else {
            return;
        };

        match self.config.frame_interval() {
            Some(interval) => {
                let next = self.last_frame_time + interval;
                if Instant::now() >= next {
                    surface.window.request_redraw();
                } else {
                    event_loop.set_control_flow(ControlFlow::WaitUntil(next));
                }
            }
            None => surface.window.request_redraw(),
        }
    }
}
