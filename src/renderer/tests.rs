// Frame protocol tests against a simulated GPU.
//
// The fake backend models fences the way the driver does: a fence is
// unsignaled from submission until the CPU waits on it, at which point the
// GPU is assumed to finish that frame. Blocking waits are recorded with the
// number of the frame that performed them.

use super::*;
use crate::backend::sync::{InFlightFrames, MAX_FRAMES_IN_FLIGHT};
use crate::error::GpuError;
use ash::vk::Handle;
use std::cell::RefCell;
use std::rc::Rc;

const DEFAULT_EXTENT: vk::Extent2D = vk::Extent2D {
    width: 800,
    height: 600,
};

struct FakeSurface {
    extent: vk::Extent2D,
    resized: bool,
}

impl FakeSurface {
    fn new(width: u32, height: u32) -> Self {
        Self {
            extent: vk::Extent2D { width, height },
            resized: false,
        }
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.extent = vk::Extent2D { width, height };
        self.resized = true;
    }
}

impl SurfaceProvider for FakeSurface {
    fn drawable_extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.resized)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainEvent {
    Idle,
    Built(u32),
    Released(u32),
}

type ChainLog = Rc<RefCell<Vec<ChainEvent>>>;

/// Stands in for the GPU objects of one chain generation.
struct FakeGeneration {
    id: u32,
    log: ChainLog,
}

impl FakeGeneration {
    fn build(id: u32, log: ChainLog) -> Self {
        log.borrow_mut().push(ChainEvent::Built(id));
        Self { id, log }
    }
}

impl Drop for FakeGeneration {
    fn drop(&mut self) {
        self.log.borrow_mut().push(ChainEvent::Released(self.id));
    }
}

struct FakeBackend {
    extent: vk::Extent2D,
    image_count: usize,
    color_format: vk::Format,
    depth_format: vk::Format,

    frames: InFlightFrames<u64>,
    signaled: Vec<bool>,
    targets: Vec<Option<usize>>,
    image_order: Vec<u32>,
    cursor: usize,
    generation: FakeGeneration,
    chain_log: ChainLog,

    // Script
    out_of_date_on_acquire: Vec<u64>,
    recreate_on_present: Vec<u64>,
    recreated_image_count: usize,
    recreated_color_format: vk::Format,

    // Observations
    acquires: u64,
    submissions: u64,
    blocking_waits: Vec<u64>,
    max_in_flight: usize,
    violations: u64,
    recreations: Vec<vk::Extent2D>,
    render_pass_extents: Vec<vk::Extent2D>,
}

impl FakeBackend {
    fn new() -> Self {
        let chain_log = ChainLog::default();
        let mut backend = Self {
            extent: DEFAULT_EXTENT,
            image_count: 3,
            color_format: vk::Format::B8G8R8A8_SRGB,
            depth_format: vk::Format::D32_SFLOAT,
            frames: InFlightFrames::new(vec![0], 0, 0),
            signaled: Vec::new(),
            targets: Vec::new(),
            image_order: vec![0, 1, 2],
            cursor: 0,
            generation: FakeGeneration::build(0, chain_log.clone()),
            chain_log,
            out_of_date_on_acquire: Vec::new(),
            recreate_on_present: Vec::new(),
            recreated_image_count: 3,
            recreated_color_format: vk::Format::B8G8R8A8_SRGB,
            acquires: 0,
            submissions: 0,
            blocking_waits: Vec::new(),
            max_in_flight: 0,
            violations: 0,
            recreations: Vec::new(),
            render_pass_extents: Vec::new(),
        };
        backend.new_generation(0);
        backend
    }

    /// Fresh, pre-signaled fences for a new chain generation.
    fn new_generation(&mut self, start_slot: usize) {
        let first = self.signaled.len() as u64;
        let fences: Vec<u64> = (first..first + MAX_FRAMES_IN_FLIGHT as u64).collect();
        self.signaled.extend(fences.iter().map(|_| true));
        self.targets.extend(fences.iter().map(|_| None));
        self.frames = InFlightFrames::new(fences, self.image_count, start_slot);
    }
}

fn retire(
    signaled: &mut [bool],
    targets: &mut [Option<usize>],
    waits: &mut Vec<u64>,
    frame: u64,
    fence: u64,
) {
    let fence = fence as usize;
    if !signaled[fence] {
        waits.push(frame);
        signaled[fence] = true;
        targets[fence] = None;
    }
}

impl FrameBackend for FakeBackend {
    fn frame_slot(&self) -> usize {
        self.frames.current_slot()
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn render_pass(&self) -> vk::RenderPass {
        vk::RenderPass::from_raw(self.recreations.len() as u64 + 1)
    }

    fn shape(&self) -> ChainShape {
        ChainShape {
            image_count: self.image_count,
            view_count: self.image_count,
            depth_count: self.image_count,
            framebuffer_count: self.image_count,
            extent: self.extent,
            color_format: self.color_format,
            depth_format: self.depth_format,
        }
    }

    fn acquire_next_image(&mut self) -> Result<AcquireOutcome> {
        self.acquires += 1;
        let frame = self.submissions + 1;
        let (signaled, targets, waits) =
            (&mut self.signaled, &mut self.targets, &mut self.blocking_waits);
        self.frames.wait_current(|fence| {
            retire(signaled, targets, waits, frame, fence);
            Ok(())
        })?;

        if self.out_of_date_on_acquire.contains(&self.acquires) {
            return Ok(AcquireOutcome::OutOfDate);
        }

        let image_index = self.image_order[self.cursor % self.image_order.len()] % self.image_count as u32;
        self.cursor += 1;
        Ok(AcquireOutcome::Ready {
            image_index,
            suboptimal: false,
        })
    }

    fn begin_commands(&mut self, slot: usize) -> Result<vk::CommandBuffer> {
        Ok(vk::CommandBuffer::from_raw(slot as u64 + 1))
    }

    fn end_commands(&mut self, _command_buffer: vk::CommandBuffer) -> Result<()> {
        Ok(())
    }

    fn submit_and_present(
        &mut self,
        _command_buffer: vk::CommandBuffer,
        image_index: u32,
    ) -> Result<PresentOutcome> {
        let frame = self.submissions + 1;
        let image = image_index as usize;

        let (signaled, targets, waits) =
            (&mut self.signaled, &mut self.targets, &mut self.blocking_waits);
        let fence = self.frames.prepare_submit(image, |guard| {
            retire(signaled, targets, waits, frame, guard);
            Ok(())
        })?;

        // Unretired work still rendering into the image we are about to use
        let busy = self
            .targets
            .iter()
            .zip(&self.signaled)
            .any(|(target, &done)| *target == Some(image) && !done);
        if busy || !self.signaled[fence as usize] {
            self.violations += 1;
        }

        self.signaled[fence as usize] = false;
        self.targets[fence as usize] = Some(image);
        let in_flight = self.signaled.iter().filter(|&&done| !done).count();
        self.max_in_flight = self.max_in_flight.max(in_flight);

        self.submissions += 1;
        self.frames.advance();

        if self.recreate_on_present.contains(&self.submissions) {
            Ok(PresentOutcome::NeedsRecreate)
        } else {
            Ok(PresentOutcome::Presented)
        }
    }

    fn recreate(&mut self, extent: vk::Extent2D) -> Result<()> {
        // Device idle: every outstanding frame retires
        self.signaled.iter_mut().for_each(|done| *done = true);
        self.targets.iter_mut().for_each(|target| *target = None);
        self.chain_log.borrow_mut().push(ChainEvent::Idle);

        // The old generation goes only once its replacement exists
        let next = FakeGeneration::build(self.generation.id + 1, self.chain_log.clone());
        self.generation = next;

        self.recreations.push(extent);
        self.extent = extent;
        self.image_count = self.recreated_image_count;
        self.color_format = self.recreated_color_format;
        self.new_generation(self.frames.current_slot());
        Ok(())
    }

    fn begin_render_pass(
        &mut self,
        _command_buffer: vk::CommandBuffer,
        _image_index: u32,
        _clear: &ClearValues,
    ) {
        self.render_pass_extents.push(self.extent);
    }

    fn end_render_pass(&mut self, _command_buffer: vk::CommandBuffer) {}

    fn wait_idle(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SystemLog {
    layouts: usize,
    pipelines: Vec<vk::RenderPass>,
    draws: Vec<usize>,
}

struct CountingSystem(Rc<RefCell<SystemLog>>);

impl RenderSystem for CountingSystem {
    fn name(&self) -> &str {
        "counting"
    }

    fn build_pipeline_layout(&mut self, _global_set_layout: vk::DescriptorSetLayout) -> Result<()> {
        self.0.borrow_mut().layouts += 1;
        Ok(())
    }

    fn build_pipeline(&mut self, render_pass: vk::RenderPass) -> Result<()> {
        self.0.borrow_mut().pipelines.push(render_pass);
        Ok(())
    }

    fn submit_draws(&mut self, frame: &FrameInfo) {
        self.0.borrow_mut().draws.push(frame.frame_index);
    }
}

fn renderer(backend: FakeBackend) -> Renderer<FakeBackend> {
    Renderer::new(backend, ClearValues::default())
}

/// Run one full frame. Returns false if the renderer skipped it.
fn run_frame(renderer: &mut Renderer<FakeBackend>, surface: &mut FakeSurface) -> bool {
    let Some(cmd) = renderer.begin_frame(surface).unwrap() else {
        return false;
    };
    renderer.begin_render_pass(cmd);
    renderer.draw_systems(1.0 / 60.0, vk::DescriptorSet::null());
    renderer.end_render_pass(cmd);
    renderer.end_frame().unwrap();
    true
}

#[test]
fn first_frames_in_flight_never_block() {
    let mut renderer = renderer(FakeBackend::new());
    let mut surface = FakeSurface::new(800, 600);

    for _ in 0..5 {
        assert!(run_frame(&mut renderer, &mut surface));
    }

    let waits = &renderer.backend().blocking_waits;
    assert_eq!(waits.first(), Some(&3));
    assert!(waits.iter().all(|&frame| frame >= 3));
    assert_eq!(renderer.backend().submissions, 5);
}

#[test]
fn run_ahead_is_bounded_and_images_are_never_reused_early() {
    let mut backend = FakeBackend::new();
    backend.image_order = vec![0, 2, 1, 1, 0, 2, 2, 0, 1];
    let mut renderer = renderer(backend);
    let mut surface = FakeSurface::new(800, 600);

    for _ in 0..60 {
        assert!(run_frame(&mut renderer, &mut surface));
    }

    let backend = renderer.backend();
    assert!(backend.max_in_flight <= MAX_FRAMES_IN_FLIGHT);
    assert_eq!(backend.violations, 0);
    assert_eq!(backend.submissions, 60);
}

#[test]
fn out_of_date_acquire_skips_the_frame_and_recreates_once() {
    let mut backend = FakeBackend::new();
    backend.out_of_date_on_acquire = vec![6];
    let mut renderer = renderer(backend);
    let mut surface = FakeSurface::new(800, 600);

    for _ in 0..5 {
        assert!(run_frame(&mut renderer, &mut surface));
    }

    // The window shrinks; the driver reports it on the next acquire
    surface.extent = vk::Extent2D { width: 640, height: 480 };
    assert!(renderer.begin_frame(&mut surface).unwrap().is_none());
    assert!(renderer.backend().recreations.is_empty());
    assert!(!renderer.is_frame_in_progress());

    assert!(run_frame(&mut renderer, &mut surface));

    let backend = renderer.backend();
    let resized = vk::Extent2D { width: 640, height: 480 };
    assert_eq!(backend.recreations, vec![resized]);
    assert_eq!(renderer.extent(), resized);
    assert_eq!(backend.render_pass_extents.last(), Some(&resized));
    assert_eq!(backend.submissions, 6);
    assert_eq!(backend.violations, 0);

    let stats = renderer.stats();
    assert_eq!(stats.frames_submitted, 6);
    assert_eq!(stats.frames_skipped, 1);
    assert_eq!(stats.chain_recreations, 1);
}

#[test]
fn minimized_window_produces_no_frames() {
    let mut renderer = renderer(FakeBackend::new());
    let mut surface = FakeSurface::new(0, 0);

    for _ in 0..10 {
        assert!(renderer.begin_frame(&mut surface).unwrap().is_none());
    }
    assert_eq!(renderer.backend().acquires, 0);
    assert_eq!(renderer.backend().submissions, 0);
    assert_eq!(renderer.stats().frames_skipped, 10);

    surface.extent = DEFAULT_EXTENT;
    assert!(run_frame(&mut renderer, &mut surface));
    assert_eq!(renderer.backend().submissions, 1);
}

#[test]
fn resize_reported_while_minimized_is_not_lost() {
    let mut renderer = renderer(FakeBackend::new());
    let mut surface = FakeSurface::new(800, 600);
    assert!(run_frame(&mut renderer, &mut surface));

    surface.resize(0, 0);
    assert!(renderer.begin_frame(&mut surface).unwrap().is_none());
    assert!(renderer.backend().recreations.is_empty());

    surface.extent = vk::Extent2D { width: 1024, height: 768 };
    assert!(run_frame(&mut renderer, &mut surface));
    assert_eq!(
        renderer.backend().recreations,
        vec![vk::Extent2D { width: 1024, height: 768 }]
    );
}

#[test]
fn resize_notification_recreates_before_acquire() {
    let mut renderer = renderer(FakeBackend::new());
    let mut surface = FakeSurface::new(800, 600);
    assert!(run_frame(&mut renderer, &mut surface));

    surface.resize(1280, 720);
    assert!(run_frame(&mut renderer, &mut surface));

    let backend = renderer.backend();
    assert_eq!(backend.recreations.len(), 1);
    assert_eq!(
        backend.render_pass_extents.last(),
        Some(&vk::Extent2D { width: 1280, height: 720 })
    );
    assert_eq!(renderer.stats().frames_skipped, 0);
}

#[test]
fn out_of_date_present_recreates_on_the_next_frame() {
    let mut backend = FakeBackend::new();
    backend.recreate_on_present = vec![2];
    let mut renderer = renderer(backend);
    let mut surface = FakeSurface::new(800, 600);

    assert!(run_frame(&mut renderer, &mut surface));
    assert!(run_frame(&mut renderer, &mut surface));
    assert!(renderer.backend().recreations.is_empty());

    assert!(run_frame(&mut renderer, &mut surface));
    assert_eq!(renderer.backend().recreations.len(), 1);

    assert!(run_frame(&mut renderer, &mut surface));
    assert_eq!(renderer.backend().recreations.len(), 1);
}

#[test]
fn replaced_generations_are_released_once_after_the_device_idles() {
    use ChainEvent::*;

    let backend = FakeBackend::new();
    let log = backend.chain_log.clone();
    let mut renderer = renderer(backend);
    let mut surface = FakeSurface::new(800, 600);

    for _ in 0..3 {
        assert!(run_frame(&mut renderer, &mut surface));
    }
    surface.resize(640, 480);
    for _ in 0..3 {
        assert!(run_frame(&mut renderer, &mut surface));
    }
    surface.resize(1024, 768);
    for _ in 0..3 {
        assert!(run_frame(&mut renderer, &mut surface));
    }

    assert_eq!(
        *log.borrow(),
        vec![Built(0), Idle, Built(1), Released(0), Idle, Built(2), Released(1)]
    );

    drop(renderer);
    let log = log.borrow();
    for id in 0..3 {
        assert_eq!(log.iter().filter(|&&event| event == Released(id)).count(), 1);
    }
    assert_eq!(log.last(), Some(&Released(2)));
}

#[test]
fn frame_slot_continues_across_recreation() {
    let mut renderer = renderer(FakeBackend::new());
    let mut surface = FakeSurface::new(800, 600);

    assert!(run_frame(&mut renderer, &mut surface));
    assert_eq!(renderer.frame_index(), 1);

    surface.resize(640, 480);
    assert!(run_frame(&mut renderer, &mut surface));
    assert_eq!(renderer.frame_index(), 0);
}

#[test]
fn systems_draw_with_the_current_frame_slot() {
    let log = Rc::new(RefCell::new(SystemLog::default()));
    let mut renderer = renderer(FakeBackend::new());
    renderer
        .add_system(Box::new(CountingSystem(log.clone())), vk::DescriptorSetLayout::null())
        .unwrap();
    let mut surface = FakeSurface::new(800, 600);

    for _ in 0..3 {
        assert!(run_frame(&mut renderer, &mut surface));
    }

    let log = log.borrow();
    assert_eq!(log.layouts, 1);
    assert_eq!(log.pipelines.len(), 1);
    assert_eq!(log.draws, vec![0, 1, 0]);
}

#[test]
fn plain_resize_keeps_pipelines() {
    let log = Rc::new(RefCell::new(SystemLog::default()));
    let mut renderer = renderer(FakeBackend::new());
    renderer
        .add_system(Box::new(CountingSystem(log.clone())), vk::DescriptorSetLayout::null())
        .unwrap();
    let mut surface = FakeSurface::new(800, 600);

    surface.resize(640, 480);
    assert!(run_frame(&mut renderer, &mut surface));
    assert_eq!(renderer.stats().chain_recreations, 1);
    assert_eq!(log.borrow().pipelines.len(), 1);
}

#[test]
fn format_change_rebuilds_pipelines_against_the_new_render_pass() {
    let log = Rc::new(RefCell::new(SystemLog::default()));
    let mut backend = FakeBackend::new();
    backend.recreated_color_format = vk::Format::R8G8B8A8_UNORM;
    let mut renderer = renderer(backend);
    renderer
        .add_system(Box::new(CountingSystem(log.clone())), vk::DescriptorSetLayout::null())
        .unwrap();
    let mut surface = FakeSurface::new(800, 600);

    surface.resize(640, 480);
    assert!(run_frame(&mut renderer, &mut surface));

    let log = log.borrow();
    assert_eq!(log.pipelines.len(), 2);
    assert_eq!(log.pipelines[1], renderer.render_pass());
    assert_ne!(log.pipelines[0], log.pipelines[1]);
}

#[test]
fn malformed_replacement_chain_is_fatal() {
    let mut backend = FakeBackend::new();
    backend.recreated_image_count = 1;
    let mut renderer = renderer(backend);
    let mut surface = FakeSurface::new(800, 600);

    surface.resize(640, 480);
    let err = renderer.begin_frame(&mut surface).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GpuError>(),
        Some(GpuError::MalformedChain(_))
    ));
}

#[test]
fn aspect_ratio_follows_the_chain() {
    let renderer = renderer(FakeBackend::new());
    assert!((renderer.aspect_ratio() - 800.0 / 600.0).abs() < f32::EPSILON);
}

#[test]
#[should_panic(expected = "end_frame called without begin_frame")]
fn end_frame_without_begin_panics() {
    let mut renderer = renderer(FakeBackend::new());
    let _ = renderer.end_frame();
}

#[test]
#[should_panic(expected = "already in progress")]
fn nested_begin_frame_panics() {
    let mut renderer = renderer(FakeBackend::new());
    let mut surface = FakeSurface::new(800, 600);
    renderer.begin_frame(&mut surface).unwrap();
    let _ = renderer.begin_frame(&mut surface);
}

#[test]
#[should_panic(expected = "inside another render pass")]
fn nested_render_pass_panics() {
    let mut renderer = renderer(FakeBackend::new());
    let mut surface = FakeSurface::new(800, 600);
    let cmd = renderer.begin_frame(&mut surface).unwrap().unwrap();
    renderer.begin_render_pass(cmd);
    renderer.begin_render_pass(cmd);
}

#[test]
#[should_panic(expected = "end_frame called without begin_frame, or inside a render pass")]
fn end_frame_inside_render_pass_panics() {
    let mut renderer = renderer(FakeBackend::new());
    let mut surface = FakeSurface::new(800, 600);
    let cmd = renderer.begin_frame(&mut surface).unwrap().unwrap();
    renderer.begin_render_pass(cmd);
    let _ = renderer.end_frame();
}
