//! Bindless resource table.
//!
//! All shader-visible resources live permanently in four large descriptor
//! arrays inside a single persistent set (set 0); shaders select resources
//! by integer index instead of per-draw descriptor binds. The set is
//! created with PARTIALLY_BOUND and UPDATE_AFTER_BIND semantics, so
//! unwritten or abandoned array elements are legal as long as shaders never
//! index them.
//!
//! Slot indices are monotonic and never reused: unregistering a resource
//! leaves a hole. Reclaiming slots would need a free list with generation
//! counters, which this layer deliberately does not implement.

use crate::error::Result;
use crate::frame::PushConstants;
use crate::layout_cache::{PipelineLayoutCache, PushRange};
use ash::vk;

/// Capacity of the sampled-image array (binding 0).
pub const MAX_BINDLESS_TEXTURES: u32 = 4096;
/// Capacity of the storage-image array (binding 1).
pub const MAX_BINDLESS_STORAGE_IMAGES: u32 = 1024;
/// Capacity of the sampler array (binding 2).
pub const MAX_BINDLESS_SAMPLERS: u32 = 32;
/// Capacity of the storage-buffer array (binding 3).
pub const MAX_BINDLESS_BUFFERS: u32 = 256;

/// Sentinel returned when a resource class is out of slots.
pub const INVALID_INDEX: u32 = u32::MAX;

const TEXTURE_BINDING: u32 = 0;
const STORAGE_IMAGE_BINDING: u32 = 1;
const SAMPLER_BINDING: u32 = 2;
const BUFFER_BINDING: u32 = 3;

/// Monotonic slot counter bounded by a fixed capacity. Indices start at 0
/// and are never handed out twice.
#[derive(Debug, Clone, Copy)]
pub struct SlotRegistry {
    next: u32,
    capacity: u32,
}

impl SlotRegistry {
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self { next: 0, capacity }
    }

    /// Allocate the next slot, or `None` when the capacity is exhausted.
    pub fn allocate(&mut self) -> Option<u32> {
        if self.next >= self.capacity {
            return None;
        }
        let idx = self.next;
        self.next += 1;
        Some(idx)
    }

    /// Number of slots handed out so far.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.next
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.next == 0
    }

    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.capacity - self.next
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// Handle to a registered sampled or storage image.
#[derive(Debug, Clone, Copy)]
pub struct TextureHandle {
    /// Index into the bindless array, or [`INVALID_INDEX`].
    pub index: u32,
    pub view: vk::ImageView,
}

impl TextureHandle {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.index != INVALID_INDEX
    }
}

/// Handle to a registered sampler.
#[derive(Debug, Clone, Copy)]
pub struct SamplerHandle {
    pub index: u32,
    pub sampler: vk::Sampler,
}

impl SamplerHandle {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.index != INVALID_INDEX
    }
}

/// Handle to a registered storage buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferHandle {
    pub index: u32,
    pub buffer: vk::Buffer,
}

impl BufferHandle {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.index != INVALID_INDEX
    }
}

/// Check whether caller-queried feature structs cover the bindless path.
///
/// Device selection happens outside this crate; the caller queries
/// `vkGetPhysicalDeviceFeatures2` and hands the chained structs in.
#[must_use]
pub fn supports_bindless(
    indexing: &vk::PhysicalDeviceDescriptorIndexingFeatures,
    bda: &vk::PhysicalDeviceBufferDeviceAddressFeatures,
) -> bool {
    indexing.descriptor_binding_partially_bound == vk::TRUE
        && indexing.descriptor_binding_sampled_image_update_after_bind == vk::TRUE
        && indexing.descriptor_binding_storage_buffer_update_after_bind == vk::TRUE
        && indexing.runtime_descriptor_array == vk::TRUE
        && indexing.shader_sampled_image_array_non_uniform_indexing == vk::TRUE
        && bda.buffer_device_address == vk::TRUE
}

/// The persistent bindless descriptor set and its slot registries.
pub struct BindlessTable {
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,

    textures: SlotRegistry,
    storage_images: SlotRegistry,
    samplers: SlotRegistry,
    buffers: SlotRegistry,
}

impl BindlessTable {
    /// Create the pool, the set-0 layout and the one persistent set.
    ///
    /// # Safety
    /// The device must be valid and support descriptor indexing.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(MAX_BINDLESS_TEXTURES),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(MAX_BINDLESS_STORAGE_IMAGES),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::SAMPLER)
                .descriptor_count(MAX_BINDLESS_SAMPLERS),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(MAX_BINDLESS_BUFFERS),
        ];

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { device.create_descriptor_pool(&pool_info, None)? };

        // All four array bindings tolerate holes and late writes.
        let array_flags =
            vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND;
        let binding_flags = [array_flags; 4];
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default()
            .binding_flags(&binding_flags);

        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(TEXTURE_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(MAX_BINDLESS_TEXTURES)
                .stage_flags(vk::ShaderStageFlags::ALL),
            vk::DescriptorSetLayoutBinding::default()
                .binding(STORAGE_IMAGE_BINDING)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(MAX_BINDLESS_STORAGE_IMAGES)
                .stage_flags(vk::ShaderStageFlags::ALL),
            vk::DescriptorSetLayoutBinding::default()
                .binding(SAMPLER_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(MAX_BINDLESS_SAMPLERS)
                .stage_flags(vk::ShaderStageFlags::ALL),
            vk::DescriptorSetLayoutBinding::default()
                .binding(BUFFER_BINDING)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(MAX_BINDLESS_BUFFERS)
                .stage_flags(vk::ShaderStageFlags::ALL),
        ];

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);
        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None)? };

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let set = unsafe { device.allocate_descriptor_sets(&alloc_info)?[0] };

        Ok(Self {
            pool,
            layout,
            set,
            textures: SlotRegistry::new(MAX_BINDLESS_TEXTURES),
            storage_images: SlotRegistry::new(MAX_BINDLESS_STORAGE_IMAGES),
            samplers: SlotRegistry::new(MAX_BINDLESS_SAMPLERS),
            buffers: SlotRegistry::new(MAX_BINDLESS_BUFFERS),
        })
    }

    /// The persistent set-0 descriptor set.
    #[must_use]
    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    /// The set-0 layout, for pipeline-layout construction.
    #[must_use]
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    #[must_use]
    pub fn texture_count(&self) -> u32 {
        self.textures.len()
    }

    /// Register a sampled image and return its slot.
    ///
    /// Returns a handle with [`INVALID_INDEX`] when the texture array is
    /// full.
    ///
    /// # Safety
    /// The device and image view must be valid; the view must outlive its
    /// use by any submitted frame.
    pub unsafe fn register_texture(
        &mut self,
        device: &ash::Device,
        view: vk::ImageView,
        image_layout: vk::ImageLayout,
    ) -> TextureHandle {
        let Some(index) = self.textures.allocate() else {
            tracing::warn!(capacity = MAX_BINDLESS_TEXTURES, "texture slots exhausted");
            return TextureHandle {
                index: INVALID_INDEX,
                view,
            };
        };

        let image_info = vk::DescriptorImageInfo::default()
            .image_view(view)
            .image_layout(image_layout);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(TEXTURE_BINDING)
            .dst_array_element(index)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .image_info(std::slice::from_ref(&image_info));
        unsafe { device.update_descriptor_sets(&[write], &[]) };

        TextureHandle { index, view }
    }

    /// Unregistering is a no-op: the slot becomes a hole, which the
    /// PARTIALLY_BOUND layout tolerates. Shaders must stop indexing it.
    pub fn unregister_texture(&mut self, _handle: TextureHandle) {}

    /// Register a storage image (always `GENERAL` layout).
    ///
    /// # Safety
    /// The device and image view must be valid.
    pub unsafe fn register_storage_image(
        &mut self,
        device: &ash::Device,
        view: vk::ImageView,
    ) -> TextureHandle {
        let Some(index) = self.storage_images.allocate() else {
            tracing::warn!(
                capacity = MAX_BINDLESS_STORAGE_IMAGES,
                "storage image slots exhausted"
            );
            return TextureHandle {
                index: INVALID_INDEX,
                view,
            };
        };

        let image_info = vk::DescriptorImageInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::GENERAL);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(STORAGE_IMAGE_BINDING)
            .dst_array_element(index)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(std::slice::from_ref(&image_info));
        unsafe { device.update_descriptor_sets(&[write], &[]) };

        TextureHandle { index, view }
    }

    /// Register a sampler.
    ///
    /// # Safety
    /// The device and sampler must be valid.
    pub unsafe fn register_sampler(
        &mut self,
        device: &ash::Device,
        sampler: vk::Sampler,
    ) -> SamplerHandle {
        let Some(index) = self.samplers.allocate() else {
            tracing::warn!(capacity = MAX_BINDLESS_SAMPLERS, "sampler slots exhausted");
            return SamplerHandle {
                index: INVALID_INDEX,
                sampler,
            };
        };

        let sampler_info = vk::DescriptorImageInfo::default().sampler(sampler);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(SAMPLER_BINDING)
            .dst_array_element(index)
            .descriptor_type(vk::DescriptorType::SAMPLER)
            .image_info(std::slice::from_ref(&sampler_info));
        unsafe { device.update_descriptor_sets(&[write], &[]) };

        SamplerHandle { index, sampler }
    }

    /// Register a storage buffer. A `range` of 0 binds the whole buffer.
    ///
    /// # Safety
    /// The device and buffer must be valid.
    pub unsafe fn register_buffer(
        &mut self,
        device: &ash::Device,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> BufferHandle {
        let Some(index) = self.buffers.allocate() else {
            tracing::warn!(capacity = MAX_BINDLESS_BUFFERS, "buffer slots exhausted");
            return BufferHandle {
                index: INVALID_INDEX,
                buffer,
            };
        };

        let buffer_info = vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(offset)
            .range(if range == 0 { vk::WHOLE_SIZE } else { range });
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(BUFFER_BINDING)
            .dst_array_element(index)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(std::slice::from_ref(&buffer_info));
        unsafe { device.update_descriptor_sets(&[write], &[]) };

        BufferHandle { index, buffer }
    }

    /// Bind the persistent set at set index 0.
    ///
    /// # Safety
    /// The command buffer must be in the recording state and the pipeline
    /// layout must start with the bindless set layout.
    pub unsafe fn bind(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline_layout: vk::PipelineLayout,
    ) {
        unsafe {
            device.cmd_bind_descriptor_sets(cmd, bind_point, pipeline_layout, 0, &[self.set], &[]);
        }
    }

    /// The canonical bindless pipeline layout: set 0 (this table), set 1
    /// (the frame ring) and the buffer-address push constants. Built
    /// through the cache, so repeated calls return the same handle.
    ///
    /// # Safety
    /// The device and frame-set layout must be valid.
    pub unsafe fn pipeline_layout(
        &self,
        device: &ash::Device,
        frame_set_layout: vk::DescriptorSetLayout,
        cache: &mut PipelineLayoutCache,
    ) -> Result<vk::PipelineLayout> {
        let push = PushRange::new(
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            0,
            std::mem::size_of::<PushConstants>() as u32,
        );
        unsafe { cache.get_or_create(device, &[self.layout, frame_set_layout], &[push]) }
    }

    /// Destroy the pool and layout. The set is freed with the pool.
    ///
    /// # Safety
    /// The device must be valid and the set must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_descriptor_set_layout(self.layout, None);
            device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_fill_in_increasing_order_from_zero() {
        let mut reg = SlotRegistry::new(8);
        for expected in 0..8 {
            assert_eq!(reg.allocate(), Some(expected));
        }
        assert_eq!(reg.len(), 8);
    }

    #[test]
    fn exhausted_registry_returns_none() {
        let mut reg = SlotRegistry::new(3);
        assert_eq!(reg.allocate(), Some(0));
        assert_eq!(reg.allocate(), Some(1));
        assert_eq!(reg.allocate(), Some(2));
        assert_eq!(reg.allocate(), None);
        // Still exhausted on repeat calls, no wraparound.
        assert_eq!(reg.allocate(), None);
        assert_eq!(reg.remaining(), 0);
    }

    #[test]
    fn zero_capacity_never_allocates() {
        let mut reg = SlotRegistry::new(0);
        assert_eq!(reg.allocate(), None);
        assert!(reg.is_empty());
    }

    #[test]
    fn remaining_tracks_allocations() {
        let mut reg = SlotRegistry::new(4);
        assert_eq!(reg.remaining(), 4);
        reg.allocate();
        reg.allocate();
        assert_eq!(reg.remaining(), 2);
        assert_eq!(reg.capacity(), 4);
    }

    #[test]
    fn invalid_index_is_reserved_sentinel() {
        let handle = TextureHandle {
            index: INVALID_INDEX,
            view: vk::ImageView::null(),
        };
        assert!(!handle.is_valid());
        let handle = TextureHandle {
            index: 0,
            view: vk::ImageView::null(),
        };
        assert!(handle.is_valid());
    }
}
