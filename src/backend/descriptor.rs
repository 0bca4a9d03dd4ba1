// Descriptor set layouts, fixed-capacity pools and set writes

use anyhow::{bail, Context, Result};
use ash::vk;
use std::sync::Arc;

use super::GraphicsContext;

/// Declares binding slots in order; `build` creates the layout.
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn binding(
        mut self,
        binding: u32,
        ty: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        debug_assert!(
            self.bindings.iter().all(|b| b.binding != binding),
            "binding {} declared twice",
            binding
        );
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(ty)
                .descriptor_count(1)
                .stage_flags(stages),
        );
        self
    }

    pub fn uniform_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, stages)
    }

    pub fn combined_image_sampler(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stages)
    }

    /// Pool sizes needed to allocate `sets` sets of this layout.
    pub fn pool_sizes(&self, sets: u32) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for binding in &self.bindings {
            match sizes.iter_mut().find(|s| s.ty == binding.descriptor_type) {
                Some(size) => size.descriptor_count += binding.descriptor_count * sets,
                None => sizes.push(vk::DescriptorPoolSize {
                    ty: binding.descriptor_type,
                    descriptor_count: binding.descriptor_count * sets,
                }),
            }
        }
        sizes
    }

    pub fn build(&self, ctx: &Arc<GraphicsContext>) -> Result<DescriptorSetLayout> {
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);
        let layout = unsafe { ctx.device.create_descriptor_set_layout(&info, None) }
            .context("Failed to create descriptor set layout")?;
        Ok(DescriptorSetLayout {
            layout,
            ctx: ctx.clone(),
        })
    }
}

pub struct DescriptorSetLayout {
    pub layout: vk::DescriptorSetLayout,
    ctx: Arc<GraphicsContext>,
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.ctx
                .device
                .destroy_descriptor_set_layout(self.layout, None)
        };
    }
}

/// Counts sets handed out from a pool that never frees individual sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBudget<const CAPACITY: u32> {
    used: u32,
}

impl<const CAPACITY: u32> DescriptorBudget<CAPACITY> {
    const NONZERO: () = assert!(CAPACITY > 0, "descriptor pool capacity must be nonzero");

    pub fn new() -> Self {
        let () = Self::NONZERO;
        Self { used: 0 }
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn remaining(&self) -> u32 {
        CAPACITY - self.used
    }

    /// Reserve one set; `None` once the capacity is spent.
    pub fn claim(&mut self) -> Option<u32> {
        if self.used == CAPACITY {
            return None;
        }
        let slot = self.used;
        self.used += 1;
        Some(slot)
    }
}

/// Descriptor pool holding at most `CAPACITY` sets, all released with the pool.
pub struct DescriptorPool<const CAPACITY: u32> {
    pub pool: vk::DescriptorPool,
    budget: DescriptorBudget<CAPACITY>,
    ctx: Arc<GraphicsContext>,
}

impl<const CAPACITY: u32> DescriptorPool<CAPACITY> {
    pub fn new(ctx: &Arc<GraphicsContext>, pool_sizes: &[vk::DescriptorPoolSize]) -> Result<Self> {
        let budget = DescriptorBudget::new();
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(CAPACITY)
            .pool_sizes(pool_sizes);
        let pool = unsafe { ctx.device.create_descriptor_pool(&info, None) }
            .context("Failed to create descriptor pool")?;

        Ok(Self {
            pool,
            budget,
            ctx: ctx.clone(),
        })
    }

    pub fn used(&self) -> u32 {
        self.budget.used()
    }

    pub fn allocate(&mut self, layout: &DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        if self.budget.claim().is_none() {
            bail!("Descriptor pool exhausted ({} sets)", CAPACITY);
        }

        let layouts = [layout.layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.ctx.device.allocate_descriptor_sets(&info) }
            .context("Failed to allocate descriptor set")?;
        Ok(sets[0])
    }
}

impl<const CAPACITY: u32> Drop for DescriptorPool<CAPACITY> {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_descriptor_pool(self.pool, None) };
    }
}

enum WriteInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

/// Batches descriptor writes against one set.
pub struct DescriptorWrites {
    set: vk::DescriptorSet,
    writes: Vec<(u32, vk::DescriptorType, WriteInfo)>,
}

impl DescriptorWrites {
    pub fn new(set: vk::DescriptorSet) -> Self {
        Self {
            set,
            writes: Vec::new(),
        }
    }

    pub fn uniform_buffer(mut self, binding: u32, buffer: vk::Buffer, range: vk::DeviceSize) -> Self {
        self.writes.push((
            binding,
            vk::DescriptorType::UNIFORM_BUFFER,
            WriteInfo::Buffer(vk::DescriptorBufferInfo {
                buffer,
                offset: 0,
                range,
            }),
        ));
        self
    }

    pub fn combined_image_sampler(mut self, binding: u32, image: vk::DescriptorImageInfo) -> Self {
        self.writes.push((
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            WriteInfo::Image(image),
        ));
        self
    }

    pub fn apply(self, device: &ash::Device) {
        let writes: Vec<vk::WriteDescriptorSet> = self
            .writes
            .iter()
            .map(|(binding, ty, info)| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(self.set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty);
                match info {
                    WriteInfo::Buffer(buffer) => write.buffer_info(std::slice::from_ref(buffer)),
                    WriteInfo::Image(image) => write.image_info(std::slice::from_ref(image)),
                }
            })
            .collect();

        unsafe { device.update_descriptor_sets(&writes, &[]) };
    }
}
