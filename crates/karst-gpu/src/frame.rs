//! Triple-buffered per-frame ring resources.
//!
//! Each ring slot owns a global uniform region and a draw-data storage
//! region, plus a descriptor set (set 1) pointing at them. The producer
//! writes only the current slot; the GPU reads a slot after submission.
//! The ring itself never blocks: callers gate slot reuse on the fence
//! waits in [`crate::sync::RingFences`], so data for frame `i` is not
//! overwritten before the GPU has finished frame `i - N`.

use crate::descriptors::{write_storage_buffer, write_uniform_buffer};
use crate::error::{GpuError, Result};
use crate::layout_cache::{BindingDesc, DescriptorLayoutCache};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

/// Number of ring slots (frames in flight).
pub const FRAMES_IN_FLIGHT: usize = 3;
/// Default per-frame draw budget.
pub const MAX_DRAWS_PER_FRAME: u32 = 65536;

const GLOBAL_BINDING: u32 = 0;
const DRAW_DATA_BINDING: u32 = 1;

/// Per-frame global data (set 1, binding 0).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GlobalData {
    pub view: Mat4,
    pub projection: Mat4,
    pub viewproj: Mat4,
    pub inv_view: Mat4,
    pub inv_projection: Mat4,
    pub inv_viewproj: Mat4,
    /// xyz = position, w = vertical fov.
    pub camera_pos: Vec4,
    /// xyz = direction, w = aspect ratio.
    pub camera_dir: Vec4,
    pub time: f32,
    pub delta_time: f32,
    pub frame_count: u32,
    pub _pad: u32,
}

/// Per-draw data, indexed by draw id on the GPU (set 1, binding 1).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DrawData {
    pub material_index: u32,
    pub transform_index: u32,
    pub vertex_offset: u32,
    pub index_offset: u32,
    pub first_index: u32,
    pub index_count: u32,
    pub instance_count: u32,
    pub vertex_bias: i32,
    /// xyz = center, w = radius, for GPU culling.
    pub bounding_sphere: Vec4,
    pub flags: u32,
    pub lod_level: u32,
    pub _pad: [u32; 2],
}

/// Push constants carrying buffer device addresses for vertex pulling.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PushConstants {
    pub vertex_buffer: vk::DeviceAddress,
    pub index_buffer: vk::DeviceAddress,
    pub draw_offset: u32,
    pub flags: u32,
}

/// A persistently mapped, GPU-visible buffer region supplied by the
/// caller's allocator. This crate never allocates device memory itself.
#[derive(Debug, Clone, Copy)]
pub struct MappedBuffer {
    pub buffer: vk::Buffer,
    pub mapping: *mut u8,
    pub size: vk::DeviceSize,
}

impl MappedBuffer {
    /// Copy `bytes` into the mapped region at `offset`.
    ///
    /// # Safety
    /// The mapping must be valid for `offset + bytes.len()` bytes and the
    /// GPU must not be reading the region.
    pub unsafe fn write_at(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.size as usize);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.mapping.add(offset), bytes.len());
        }
    }
}

/// The caller-created buffers backing one ring slot.
#[derive(Debug, Clone, Copy)]
pub struct FrameBuffers {
    /// Uniform region holding one [`GlobalData`].
    pub global: MappedBuffer,
    /// Storage region holding `draw_capacity` [`DrawData`] entries.
    pub draws: MappedBuffer,
}

/// Draw-slot counter for one ring slot.
///
/// When the budget is exceeded the cursor clamps to the last valid slot,
/// overwriting its data instead of growing or erroring. A warning is logged
/// on the first overflow per frame so the condition is observable.
#[derive(Debug, Clone, Copy)]
struct DrawCursor {
    count: u32,
    capacity: u32,
    overflowed: bool,
}

impl DrawCursor {
    fn new(capacity: u32) -> Self {
        Self {
            count: 0,
            capacity,
            overflowed: false,
        }
    }

    fn alloc(&mut self) -> u32 {
        if self.count >= self.capacity {
            if !self.overflowed {
                self.overflowed = true;
                tracing::warn!(
                    capacity = self.capacity,
                    "per-frame draw budget exceeded, clamping to last slot"
                );
            }
            return self.capacity - 1;
        }
        let idx = self.count;
        self.count += 1;
        idx
    }

    fn reset(&mut self) {
        self.count = 0;
        self.overflowed = false;
    }
}

/// Ring index plus the per-slot draw cursors, kept apart from the Vulkan
/// resources so the advance and reset rules need no device.
struct RingState {
    cursors: Vec<DrawCursor>,
    current: usize,
}

impl RingState {
    fn new(slots: usize, draw_capacity: u32) -> Self {
        Self {
            cursors: vec![DrawCursor::new(draw_capacity); slots],
            current: 0,
        }
    }

    /// Advance by one slot, wrapping, and reset the incoming slot's cursor.
    fn begin_frame(&mut self) -> usize {
        self.current = (self.current + 1) % self.cursors.len();
        self.cursors[self.current].reset();
        self.current
    }

    fn cursor(&self) -> &DrawCursor {
        &self.cursors[self.current]
    }

    fn cursor_mut(&mut self) -> &mut DrawCursor {
        &mut self.cursors[self.current]
    }
}

struct FrameSlot {
    buffers: FrameBuffers,
    set: vk::DescriptorSet,
}

/// N-buffered per-frame resources with a `frame_index mod N` ring.
pub struct FrameRing {
    pool: vk::DescriptorPool,
    // Owned by the layout cache, kept for pipeline-layout construction.
    set_layout: vk::DescriptorSetLayout,
    slots: Vec<FrameSlot>,
    state: RingState,
}

impl FrameRing {
    /// Binding description of the frame set (set 1), shared with shader
    /// reflection consumers.
    #[must_use]
    pub fn set_bindings() -> [BindingDesc; 2] {
        [
            BindingDesc::new(
                GLOBAL_BINDING,
                vk::DescriptorType::UNIFORM_BUFFER,
                1,
                vk::ShaderStageFlags::ALL,
            ),
            BindingDesc::new(
                DRAW_DATA_BINDING,
                vk::DescriptorType::STORAGE_BUFFER,
                1,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            ),
        ]
    }

    /// Build the ring over caller-supplied buffers, one descriptor set per
    /// slot. The set layout comes from `layout_cache` and stays owned by
    /// it.
    ///
    /// # Safety
    /// The device must be valid and every buffer mapped and at least as
    /// large as its region.
    pub unsafe fn new(
        device: &ash::Device,
        layout_cache: &mut DescriptorLayoutCache,
        buffers: [FrameBuffers; FRAMES_IN_FLIGHT],
        draw_capacity: u32,
    ) -> Result<Self> {
        if draw_capacity == 0 {
            return Err(GpuError::InvalidState(
                "frame ring needs a non-zero draw budget".into(),
            ));
        }
        let global_size = std::mem::size_of::<GlobalData>() as vk::DeviceSize;
        let draws_size =
            vk::DeviceSize::from(draw_capacity) * std::mem::size_of::<DrawData>() as vk::DeviceSize;
        for fb in &buffers {
            if fb.global.size < global_size || fb.draws.size < draws_size {
                return Err(GpuError::InvalidState(
                    "frame buffers smaller than their regions".into(),
                ));
            }
        }

        let frames = FRAMES_IN_FLIGHT as u32;
        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(frames),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(frames),
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(frames)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { device.create_descriptor_pool(&pool_info, None)? };

        let set_layout = unsafe { layout_cache.get_or_create(device, &Self::set_bindings())? };

        let layouts = [set_layout; FRAMES_IN_FLIGHT];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { device.allocate_descriptor_sets(&alloc_info)? };

        let mut slots = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for (fb, set) in buffers.into_iter().zip(sets) {
            unsafe {
                write_uniform_buffer(device, set, GLOBAL_BINDING, fb.global.buffer, 0, global_size);
                write_storage_buffer(
                    device,
                    set,
                    DRAW_DATA_BINDING,
                    fb.draws.buffer,
                    0,
                    vk::WHOLE_SIZE,
                );
            }
            slots.push(FrameSlot { buffers: fb, set });
        }

        Ok(Self {
            pool,
            set_layout,
            slots,
            state: RingState::new(FRAMES_IN_FLIGHT, draw_capacity),
        })
    }

    /// Advance to the next ring slot and reset its draw cursor. Returns
    /// the new slot index. After exactly N calls the active slot is back
    /// where it started.
    pub fn begin_frame(&mut self) -> usize {
        self.state.begin_frame()
    }

    /// Index of the active ring slot.
    #[must_use]
    pub fn current_index(&self) -> usize {
        self.state.current
    }

    /// Draws allocated in the active slot so far.
    #[must_use]
    pub fn draw_count(&self) -> u32 {
        self.state.cursor().count
    }

    /// The frame set layout (set 1), owned by the layout cache.
    #[must_use]
    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    /// The active slot's descriptor set.
    #[must_use]
    pub fn current_set(&self) -> vk::DescriptorSet {
        self.slots[self.state.current].set
    }

    /// Write the global data for the active slot.
    ///
    /// # Safety
    /// The GPU must not be consuming the active slot (gate on the ring
    /// fence first).
    pub unsafe fn write_global(&self, global: &GlobalData) {
        unsafe {
            self.slots[self.state.current]
                .buffers
                .global
                .write_at(0, bytemuck::bytes_of(global));
        }
    }

    /// Store `draw` in the next draw slot and return its index. Past the
    /// budget, clamps to the last slot (overwriting it).
    ///
    /// # Safety
    /// The GPU must not be consuming the active slot.
    pub unsafe fn alloc_draw(&mut self, draw: &DrawData) -> u32 {
        let idx = self.state.cursor_mut().alloc();
        let offset = idx as usize * std::mem::size_of::<DrawData>();
        let slot = &self.slots[self.state.current];
        unsafe { slot.buffers.draws.write_at(offset, bytemuck::bytes_of(draw)) };
        idx
    }

    /// Bind the active slot's set at set index 1.
    ///
    /// # Safety
    /// The command buffer must be recording and the pipeline layout must
    /// contain the frame set layout at index 1.
    pub unsafe fn bind(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline_layout: vk::PipelineLayout,
    ) {
        unsafe {
            device.cmd_bind_descriptor_sets(
                cmd,
                bind_point,
                pipeline_layout,
                1,
                &[self.current_set()],
                &[],
            );
        }
    }

    /// Destroy the descriptor pool. Buffers belong to the caller; the set
    /// layout belongs to the cache.
    ///
    /// # Safety
    /// The device must be valid and no slot may be in use by the GPU.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_descriptor_pool(self.pool, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_advances_one_slot_per_frame_and_wraps() {
        let mut state = RingState::new(FRAMES_IN_FLIGHT, 4);
        let start = state.current;
        for i in 1..=FRAMES_IN_FLIGHT {
            assert_eq!(state.begin_frame(), (start + i) % FRAMES_IN_FLIGHT);
        }
        // After exactly N frames the active slot is back where it started.
        assert_eq!(state.current, start);
    }

    #[test]
    fn begin_frame_resets_the_incoming_slot_cursor() {
        let mut state = RingState::new(FRAMES_IN_FLIGHT, 2);
        state.begin_frame();
        state.cursor_mut().alloc();
        state.cursor_mut().alloc();
        state.cursor_mut().alloc();
        assert!(state.cursor().overflowed);

        // Cycle the ring until the same slot comes around again.
        for _ in 0..FRAMES_IN_FLIGHT {
            state.begin_frame();
        }
        assert_eq!(state.cursor().count, 0);
        assert!(!state.cursor().overflowed);
    }

    #[test]
    fn cursor_hands_out_sequential_slots() {
        let mut cursor = DrawCursor::new(4);
        assert_eq!(cursor.alloc(), 0);
        assert_eq!(cursor.alloc(), 1);
        assert_eq!(cursor.alloc(), 2);
        assert_eq!(cursor.alloc(), 3);
        assert_eq!(cursor.count, 4);
    }

    #[test]
    fn cursor_clamps_to_last_slot_when_exhausted() {
        let mut cursor = DrawCursor::new(2);
        cursor.alloc();
        cursor.alloc();
        // Budget exceeded: keeps returning the final slot, count frozen.
        assert_eq!(cursor.alloc(), 1);
        assert_eq!(cursor.alloc(), 1);
        assert_eq!(cursor.count, 2);
        assert!(cursor.overflowed);
    }

    #[test]
    fn cursor_reset_clears_overflow() {
        let mut cursor = DrawCursor::new(1);
        cursor.alloc();
        cursor.alloc();
        assert!(cursor.overflowed);
        cursor.reset();
        assert!(!cursor.overflowed);
        assert_eq!(cursor.alloc(), 0);
    }

    #[test]
    fn gpu_structs_have_expected_sizes() {
        // Shader-side std430 layouts depend on these.
        assert_eq!(std::mem::size_of::<DrawData>(), 64);
        assert_eq!(std::mem::size_of::<PushConstants>(), 24);
        assert_eq!(std::mem::size_of::<GlobalData>() % 16, 0);
    }
}
