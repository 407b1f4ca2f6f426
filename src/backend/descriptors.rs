// Descriptor sets - layouts, pools and batched writes
//
// Layouts are assembled with a builder keyed by binding slot. Pools have a
// fixed capacity set at creation; running out is an expected outcome and
// comes back as `Ok(None)`, never as an error. The writer stages buffer and
// image writes, checks them against the layout, and pushes them to the
// device in one update call.

use anyhow::{Context, Result};
use ash::vk;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::GraphicsDevice;

/// Default set capacity for pools built without `set_max_sets`.
pub const DEFAULT_MAX_SETS: u32 = 1000;

/// Type and array length declared for one binding slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingInfo {
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
}

/// What a pending write carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Buffer,
    Image,
}

impl WriteKind {
    fn accepts(self, descriptor_type: vk::DescriptorType) -> bool {
        use vk::DescriptorType as T;
        match self {
            WriteKind::Buffer => matches!(
                descriptor_type,
                T::UNIFORM_BUFFER
                    | T::STORAGE_BUFFER
                    | T::UNIFORM_BUFFER_DYNAMIC
                    | T::STORAGE_BUFFER_DYNAMIC
            ),
            WriteKind::Image => matches!(
                descriptor_type,
                T::SAMPLER
                    | T::COMBINED_IMAGE_SAMPLER
                    | T::SAMPLED_IMAGE
                    | T::STORAGE_IMAGE
                    | T::INPUT_ATTACHMENT
            ),
        }
    }
}

/// Validate a staged write against the layout and return the binding's type.
///
/// Misuse is a programming error, so this panics instead of returning.
pub fn check_binding(
    bindings: &BTreeMap<u32, BindingInfo>,
    binding: u32,
    kind: WriteKind,
    count: u32,
) -> vk::DescriptorType {
    let Some(info) = bindings.get(&binding) else {
        panic!("layout does not contain binding {}", binding);
    };
    assert!(
        kind.accepts(info.descriptor_type),
        "binding {} is {:?}, cannot take a {:?} write",
        binding,
        info.descriptor_type,
        kind
    );
    assert_eq!(
        info.count, count,
        "binding {} expects {} descriptors, got {}",
        binding, info.count, count
    );
    info.descriptor_type
}

// ---------------------------------------------------------------------------
// DescriptorSetLayout
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: BTreeMap<u32, vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_binding(
        self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.add_binding_array(binding, descriptor_type, stage_flags, 1)
    }

    pub fn add_binding_array(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
        count: u32,
    ) -> Self {
        assert!(
            !self.bindings.contains_key(&binding),
            "binding {} already in use",
            binding
        );
        let layout_binding = vk::DescriptorSetLayoutBinding::builder()
            .binding(binding)
            .descriptor_type(descriptor_type)
            .descriptor_count(count)
            .stage_flags(stage_flags)
            .build();
        self.bindings.insert(binding, layout_binding);
        self
    }

    fn binding_infos(&self) -> BTreeMap<u32, BindingInfo> {
        self.bindings
            .iter()
            .map(|(&slot, b)| {
                let info = BindingInfo {
                    descriptor_type: b.descriptor_type,
                    count: b.descriptor_count,
                };
                (slot, info)
            })
            .collect()
    }

    pub fn build(self, device: &Arc<GraphicsDevice>) -> Result<DescriptorSetLayout> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> =
            self.bindings.values().copied().collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&vk_bindings);

        let layout = unsafe {
            device
                .device
                .create_descriptor_set_layout(&create_info, None)
        }
        .context("Failed to create descriptor set layout")?;

        Ok(DescriptorSetLayout {
            device: Arc::clone(device),
            layout,
            bindings: self.binding_infos(),
        })
    }
}

pub struct DescriptorSetLayout {
    device: Arc<GraphicsDevice>,
    layout: vk::DescriptorSetLayout,
    bindings: BTreeMap<u32, BindingInfo>,
}

impl std::fmt::Debug for DescriptorSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetLayout")
            .field("layout", &self.layout)
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}

impl DescriptorSetLayout {
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn bindings(&self) -> &BTreeMap<u32, BindingInfo> {
        &self.bindings
    }

    /// Descriptors of each type one set of this layout consumes.
    pub fn demand(&self) -> Vec<(vk::DescriptorType, u32)> {
        layout_demand(&self.bindings)
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        // SAFETY: no pipeline layout or pool still in use references this
        // layout once its owner lets go of it
        unsafe {
            self.device
                .device
                .destroy_descriptor_set_layout(self.layout, None)
        };
    }
}

fn layout_demand(bindings: &BTreeMap<u32, BindingInfo>) -> Vec<(vk::DescriptorType, u32)> {
    let mut demand: Vec<(vk::DescriptorType, u32)> = Vec::new();
    for info in bindings.values() {
        match demand.iter_mut().find(|(ty, _)| *ty == info.descriptor_type) {
            Some((_, count)) => *count += info.count,
            None => demand.push((info.descriptor_type, info.count)),
        }
    }
    demand
}

// ---------------------------------------------------------------------------
// PoolBudget
// ---------------------------------------------------------------------------

/// CPU-side mirror of a pool's capacity.
///
/// Lets exhaustion be detected up front instead of relying on the driver,
/// which is allowed to over-allocate.
#[derive(Debug, Clone)]
pub struct PoolBudget {
    max_sets: u32,
    live_sets: u32,
    capacity: HashMap<vk::DescriptorType, u32>,
    used: HashMap<vk::DescriptorType, u32>,
}

impl PoolBudget {
    pub fn new(max_sets: u32, pool_sizes: &[vk::DescriptorPoolSize]) -> Self {
        let mut capacity = HashMap::new();
        for size in pool_sizes {
            *capacity.entry(size.ty).or_insert(0) += size.descriptor_count;
        }
        Self {
            max_sets,
            live_sets: 0,
            capacity,
            used: HashMap::new(),
        }
    }

    /// Reserve room for one set. Returns false, changing nothing, if the
    /// pool cannot hold it.
    pub fn try_reserve(&mut self, demand: &[(vk::DescriptorType, u32)]) -> bool {
        if self.live_sets >= self.max_sets {
            return false;
        }
        let fits = demand.iter().all(|(ty, count)| {
            let capacity = self.capacity.get(ty).copied().unwrap_or(0);
            let used = self.used.get(ty).copied().unwrap_or(0);
            used + count <= capacity
        });
        if !fits {
            return false;
        }

        self.live_sets += 1;
        for &(ty, count) in demand {
            *self.used.entry(ty).or_insert(0) += count;
        }
        true
    }

    pub fn release(&mut self, demand: &[(vk::DescriptorType, u32)]) {
        self.live_sets = self.live_sets.saturating_sub(1);
        for (ty, count) in demand {
            if let Some(used) = self.used.get_mut(ty) {
                *used = used.saturating_sub(*count);
            }
        }
    }

    pub fn reset(&mut self) {
        self.live_sets = 0;
        self.used.clear();
    }

    pub fn live_sets(&self) -> u32 {
        self.live_sets
    }

    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }
}

// ---------------------------------------------------------------------------
// DescriptorPool
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct DescriptorPoolBuilder {
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    max_sets: u32,
    flags: vk::DescriptorPoolCreateFlags,
}

impl Default for DescriptorPoolBuilder {
    fn default() -> Self {
        Self {
            pool_sizes: Vec::new(),
            max_sets: DEFAULT_MAX_SETS,
            flags: vk::DescriptorPoolCreateFlags::empty(),
        }
    }
}

impl DescriptorPoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pool_size(mut self, ty: vk::DescriptorType, descriptor_count: u32) -> Self {
        self.pool_sizes.push(vk::DescriptorPoolSize {
            ty,
            descriptor_count,
        });
        self
    }

    pub fn set_max_sets(mut self, max_sets: u32) -> Self {
        self.max_sets = max_sets;
        self
    }

    pub fn set_pool_flags(mut self, flags: vk::DescriptorPoolCreateFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn build(self, device: &Arc<GraphicsDevice>) -> Result<DescriptorPool> {
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&self.pool_sizes)
            .max_sets(self.max_sets)
            .flags(self.flags);

        let pool = unsafe { device.device.create_descriptor_pool(&create_info, None) }
            .context("Failed to create descriptor pool")?;

        log::debug!(
            "Created descriptor pool: {} sets, {:?}",
            self.max_sets,
            self.pool_sizes
        );

        Ok(DescriptorPool {
            device: Arc::clone(device),
            pool,
            flags: self.flags,
            budget: PoolBudget::new(self.max_sets, &self.pool_sizes),
        })
    }
}

pub struct DescriptorPool {
    device: Arc<GraphicsDevice>,
    pool: vk::DescriptorPool,
    flags: vk::DescriptorPoolCreateFlags,
    budget: PoolBudget,
}

impl std::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("pool", &self.pool)
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

impl DescriptorPool {
    /// Allocate one set for `layout`, or `Ok(None)` if the pool is full.
    pub fn allocate(&mut self, layout: &DescriptorSetLayout) -> Result<Option<vk::DescriptorSet>> {
        let demand = layout.demand();
        if !self.budget.try_reserve(&demand) {
            log::debug!(
                "Descriptor pool exhausted ({}/{} sets)",
                self.budget.live_sets(),
                self.budget.max_sets()
            );
            return Ok(None);
        }

        let layouts = [layout.handle()];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        match unsafe { self.device.device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => Ok(sets.first().copied()),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                self.budget.release(&demand);
                Ok(None)
            }
            Err(e) => {
                self.budget.release(&demand);
                Err(e).context("Failed to allocate descriptor set")
            }
        }
    }

    /// Return `sets` (all allocated with `layout`) to the pool.
    ///
    /// Only valid for pools built with FREE_DESCRIPTOR_SET.
    pub fn free_descriptors(
        &mut self,
        sets: &[vk::DescriptorSet],
        layout: &DescriptorSetLayout,
    ) -> Result<()> {
        assert!(
            self.flags
                .contains(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET),
            "pool was not created with FREE_DESCRIPTOR_SET"
        );
        unsafe { self.device.device.free_descriptor_sets(self.pool, sets) }
            .context("Failed to free descriptor sets")?;

        let demand = layout.demand();
        for _ in sets {
            self.budget.release(&demand);
        }
        Ok(())
    }

    /// Return every set to the pool. Previously allocated handles become invalid.
    pub fn reset_pool(&mut self) -> Result<()> {
        unsafe {
            self.device
                .device
                .reset_descriptor_pool(self.pool, vk::DescriptorPoolResetFlags::empty())
        }
        .context("Failed to reset descriptor pool")?;
        self.budget.reset();
        Ok(())
    }

    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    pub fn budget(&self) -> &PoolBudget {
        &self.budget
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        log::debug!("Dropping descriptor pool {:?}", self.pool);
        // SAFETY: sets from this pool are freed with it; owners drop the
        // pool only after the device has gone idle
        unsafe { self.device.device.destroy_descriptor_pool(self.pool, None) };
    }
}

// ---------------------------------------------------------------------------
// DescriptorWriter
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum PendingInfo {
    Buffer(Vec<vk::DescriptorBufferInfo>),
    Image(Vec<vk::DescriptorImageInfo>),
}

#[derive(Debug)]
struct PendingWrite {
    binding: u32,
    descriptor_type: vk::DescriptorType,
    info: PendingInfo,
}

/// Stages writes for one set and applies them in a single update.
pub struct DescriptorWriter<'a> {
    layout: &'a DescriptorSetLayout,
    pool: &'a mut DescriptorPool,
    writes: Vec<PendingWrite>,
}

impl<'a> DescriptorWriter<'a> {
    pub fn new(layout: &'a DescriptorSetLayout, pool: &'a mut DescriptorPool) -> Self {
        Self {
            layout,
            pool,
            writes: Vec::new(),
        }
    }

    pub fn write_buffer(mut self, binding: u32, info: vk::DescriptorBufferInfo) -> Self {
        let descriptor_type = check_binding(&self.layout.bindings, binding, WriteKind::Buffer, 1);
        self.writes.push(PendingWrite {
            binding,
            descriptor_type,
            info: PendingInfo::Buffer(vec![info]),
        });
        self
    }

    pub fn write_image(self, binding: u32, info: vk::DescriptorImageInfo) -> Self {
        self.write_image_array(binding, &[info])
    }

    pub fn write_image_array(mut self, binding: u32, infos: &[vk::DescriptorImageInfo]) -> Self {
        let descriptor_type = check_binding(
            &self.layout.bindings,
            binding,
            WriteKind::Image,
            infos.len() as u32,
        );
        self.writes.push(PendingWrite {
            binding,
            descriptor_type,
            info: PendingInfo::Image(infos.to_vec()),
        });
        self
    }

    /// Allocate a set and apply the staged writes to it.
    ///
    /// `Ok(None)` when the pool is exhausted; nothing is written then.
    pub fn build(self) -> Result<Option<vk::DescriptorSet>> {
        let Some(set) = self.pool.allocate(self.layout)? else {
            return Ok(None);
        };
        self.overwrite(set);
        Ok(Some(set))
    }

    /// Apply the staged writes to an existing set.
    pub fn overwrite(&self, set: vk::DescriptorSet) {
        let writes: Vec<vk::WriteDescriptorSet> = self
            .writes
            .iter()
            .map(|pending| {
                let write = vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(pending.binding)
                    .dst_array_element(0)
                    .descriptor_type(pending.descriptor_type);
                match &pending.info {
                    PendingInfo::Buffer(infos) => write.buffer_info(infos).build(),
                    PendingInfo::Image(infos) => write.image_info(infos).build(),
                }
            })
            .collect();

        unsafe { self.pool.device.device.update_descriptor_sets(&writes, &[]) };
    }
}
