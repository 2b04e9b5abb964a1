//! Descriptor pool management and write helpers.

use crate::error::Result;
use ash::vk;

/// Pool recipe used for every chunk the allocator grows by.
const POOL_MAX_SETS: u32 = 128;

fn chunk_sizes() -> [vk::DescriptorPoolSize; 5] {
    [
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(64),
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(64),
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(64),
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
            .descriptor_count(32),
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::STORAGE_IMAGE)
            .descriptor_count(32),
    ]
}

unsafe fn create_chunk(device: &ash::Device) -> Result<vk::DescriptorPool> {
    let sizes = chunk_sizes();
    let info = vk::DescriptorPoolCreateInfo::default()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .max_sets(POOL_MAX_SETS)
        .pool_sizes(&sizes);
    let pool = unsafe { device.create_descriptor_pool(&info, None)? };
    Ok(pool)
}

/// Descriptor allocator that grows by whole pools.
///
/// Allocation goes to the newest pool; when the driver reports the pool as
/// full or fragmented, a fresh pool is appended and the allocation retried
/// once. Pools are only released in `reset` / `destroy`.
pub struct DescriptorAllocator {
    pools: Vec<vk::DescriptorPool>,
}

impl DescriptorAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self { pools: Vec::new() }
    }

    /// Number of pools created so far.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Allocate one descriptor set with the given layout.
    ///
    /// # Safety
    /// The device and layout must be valid.
    pub unsafe fn allocate(
        &mut self,
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let current = match self.pools.last() {
            Some(&pool) => pool,
            None => {
                let pool = unsafe { create_chunk(device)? };
                self.pools.push(pool);
                pool
            }
        };

        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(current)
            .set_layouts(&layouts);

        match unsafe { device.allocate_descriptor_sets(&info) } {
            Ok(sets) => Ok(sets[0]),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                let pool = unsafe { create_chunk(device)? };
                self.pools.push(pool);
                tracing::debug!(pools = self.pools.len(), "grew descriptor allocator");

                let info = vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(pool)
                    .set_layouts(&layouts);
                let sets = unsafe { device.allocate_descriptor_sets(&info)? };
                Ok(sets[0])
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reset every pool, freeing all sets allocated from them.
    ///
    /// # Safety
    /// The device must be valid and no allocated set may be in use.
    pub unsafe fn reset(&mut self, device: &ash::Device) -> Result<()> {
        for &pool in &self.pools {
            unsafe { device.reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())? };
        }
        Ok(())
    }

    /// Destroy every pool.
    ///
    /// # Safety
    /// The device must be valid and no allocated set may be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for pool in self.pools.drain(..) {
            unsafe { device.destroy_descriptor_pool(pool, None) };
        }
    }
}

impl Default for DescriptorAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Write a uniform buffer descriptor.
///
/// # Safety
/// Device, set and buffer must be valid.
pub unsafe fn write_uniform_buffer(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    buffer: vk::Buffer,
    offset: vk::DeviceSize,
    range: vk::DeviceSize,
) {
    let buffer_info = vk::DescriptorBufferInfo::default()
        .buffer(buffer)
        .offset(offset)
        .range(range);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .buffer_info(std::slice::from_ref(&buffer_info));

    unsafe { device.update_descriptor_sets(&[write], &[]) };
}

/// Write a storage buffer descriptor.
///
/// # Safety
/// Device, set and buffer must be valid.
pub unsafe fn write_storage_buffer(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    buffer: vk::Buffer,
    offset: vk::DeviceSize,
    range: vk::DeviceSize,
) {
    let buffer_info = vk::DescriptorBufferInfo::default()
        .buffer(buffer)
        .offset(offset)
        .range(range);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
        .buffer_info(std::slice::from_ref(&buffer_info));

    unsafe { device.update_descriptor_sets(&[write], &[]) };
}

/// Write a storage image descriptor.
///
/// # Safety
/// Device, set and image view must be valid.
pub unsafe fn write_storage_image(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    image_view: vk::ImageView,
    layout: vk::ImageLayout,
) {
    let image_info = vk::DescriptorImageInfo::default()
        .image_view(image_view)
        .image_layout(layout);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
        .image_info(std::slice::from_ref(&image_info));

    unsafe { device.update_descriptor_sets(&[write], &[]) };
}
