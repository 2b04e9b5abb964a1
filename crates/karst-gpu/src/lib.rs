//! Thin Vulkan helper layer for the Karst renderer.
//!
//! This crate provides:
//! - Content-addressed descriptor-set-layout and pipeline-layout caches
//! - A bindless resource table with monotonic slot indices
//! - Triple-buffered per-frame ring resources
//! - Pipeline-cache persistence to disk
//! - SPIR-V shader reflection via spirq
//! - Synchronization helpers
//!
//! Instance/device creation, swapchain presentation and memory allocation
//! live outside this crate; callers hand in `&ash::Device`, physical-device
//! properties and pre-created mapped buffers.

pub mod bindless;
pub mod descriptors;
pub mod error;
pub mod frame;
pub mod hash;
pub mod layout_cache;
pub mod pipeline;
pub mod pipeline_cache;
pub mod reflect;
pub mod sync;

pub use bindless::{
    supports_bindless, BindlessTable, BufferHandle, SamplerHandle, SlotRegistry, TextureHandle,
    INVALID_INDEX, MAX_BINDLESS_BUFFERS, MAX_BINDLESS_SAMPLERS, MAX_BINDLESS_STORAGE_IMAGES,
    MAX_BINDLESS_TEXTURES,
};
pub use descriptors::{
    write_storage_buffer, write_storage_image, write_uniform_buffer, DescriptorAllocator,
};
pub use error::{GpuError, Result};
pub use frame::{
    DrawData, FrameBuffers, FrameRing, GlobalData, MappedBuffer, PushConstants, FRAMES_IN_FLIGHT,
    MAX_DRAWS_PER_FRAME,
};
pub use layout_cache::{
    BindingDesc, DescriptorLayoutCache, PipelineLayoutCache, PushRange, SetLayoutKey,
};
pub use pipeline::{ComputePipeline, GraphicsPipeline, GraphicsPipelineConfig};
pub use pipeline_cache::{load_or_create, save, DeviceIdent};
pub use reflect::{MergedReflection, ReflectedShader};
pub use sync::{
    create_fence, create_semaphore, fence_is_signaled, reset_fence, wait_for_fence, RingFences,
};
