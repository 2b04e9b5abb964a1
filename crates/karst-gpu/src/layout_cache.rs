//! Content-addressed caches for descriptor-set and pipeline layouts.
//!
//! Structurally identical layout descriptions must map to the same native
//! handle without a second creation call. Keys carry a precomputed FNV-1a
//! hash as a fast pre-filter; equality is always resolved by a full field
//! comparison, so hash collisions are harmless. Lookup is a linear scan
//! over a growable list, since a renderer holds tens of distinct layouts,
//! not thousands.
//!
//! There is no eviction. A cache lives as long as its owning device context
//! and tears down every contained layout in `destroy`.

use crate::error::Result;
use crate::hash::{Fnv32, Fnv64};
use ash::vk;
use ash::vk::Handle;
use smallvec::SmallVec;

/// Inline capacity for bindings in a set-layout key.
pub const MAX_BINDINGS_PER_SET: usize = 16;
/// Inline capacity for set layouts in a pipeline-layout key.
pub const MAX_SET_LAYOUTS: usize = 8;
/// Inline capacity for push-constant ranges in a pipeline-layout key.
pub const MAX_PUSH_RANGES: usize = 4;

/// One descriptor binding, reduced to the fields that define layout
/// identity. Immutable-sampler layouts are not cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingDesc {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

impl BindingDesc {
    #[must_use]
    pub fn new(
        binding: u32,
        descriptor_type: vk::DescriptorType,
        descriptor_count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        Self {
            binding,
            descriptor_type,
            descriptor_count,
            stage_flags,
        }
    }

    fn feed(&self, h: &mut Fnv32) {
        h.write_u32(self.binding);
        h.write_u32(self.descriptor_type.as_raw() as u32);
        h.write_u32(self.descriptor_count);
        h.write_u32(self.stage_flags.as_raw());
    }
}

/// Cache key for a descriptor-set layout: the ordered binding list plus a
/// precomputed hash. Immutable once built.
#[derive(Debug, Clone)]
pub struct SetLayoutKey {
    bindings: SmallVec<[BindingDesc; MAX_BINDINGS_PER_SET]>,
    hash: u32,
}

impl SetLayoutKey {
    #[must_use]
    pub fn new(bindings: &[BindingDesc]) -> Self {
        let mut h = Fnv32::new();
        for b in bindings {
            b.feed(&mut h);
        }
        let hash = h.finish() ^ bindings.len() as u32;
        Self {
            bindings: SmallVec::from_slice(bindings),
            hash,
        }
    }

    #[must_use]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    #[must_use]
    pub fn bindings(&self) -> &[BindingDesc] {
        &self.bindings
    }
}

impl PartialEq for SetLayoutKey {
    fn eq(&self, other: &Self) -> bool {
        // Hash first: cheap rejection for the common miss case.
        self.hash == other.hash
            && self.bindings.len() == other.bindings.len()
            && self.bindings == other.bindings
    }
}

impl Eq for SetLayoutKey {}

struct SetLayoutEntry {
    key: SetLayoutKey,
    layout: vk::DescriptorSetLayout,
}

/// Deduplicating cache for `vk::DescriptorSetLayout`.
pub struct DescriptorLayoutCache {
    entries: Vec<SetLayoutEntry>,
}

impl DescriptorLayoutCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Number of distinct layouts created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find(&self, key: &SetLayoutKey) -> Option<vk::DescriptorSetLayout> {
        self.entries
            .iter()
            .find(|e| e.key == *key)
            .map(|e| e.layout)
    }

    /// Return the layout for `bindings`, creating it on first use.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn get_or_create(
        &mut self,
        device: &ash::Device,
        bindings: &[BindingDesc],
    ) -> Result<vk::DescriptorSetLayout> {
        let key = SetLayoutKey::new(bindings);
        if let Some(layout) = self.find(&key) {
            return Ok(layout);
        }

        let vk_bindings: SmallVec<[vk::DescriptorSetLayoutBinding; MAX_BINDINGS_PER_SET]> =
            bindings
                .iter()
                .map(|b| {
                    vk::DescriptorSetLayoutBinding::default()
                        .binding(b.binding)
                        .descriptor_type(b.descriptor_type)
                        .descriptor_count(b.descriptor_count)
                        .stage_flags(b.stage_flags)
                })
                .collect();

        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        let layout = unsafe { device.create_descriptor_set_layout(&info, None)? };

        tracing::debug!(
            bindings = bindings.len(),
            cached = self.entries.len() + 1,
            "created descriptor set layout"
        );
        self.entries.push(SetLayoutEntry { key, layout });
        Ok(layout)
    }

    /// Destroy all cached layouts.
    ///
    /// # Safety
    /// The device must be valid and no cached layout may be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for entry in self.entries.drain(..) {
            unsafe { device.destroy_descriptor_set_layout(entry.layout, None) };
        }
    }
}

impl Default for DescriptorLayoutCache {
    fn default() -> Self {
        Self::new()
    }
}

/// One push-constant range, reduced to the fields that define layout
/// identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushRange {
    pub stage_flags: vk::ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

impl PushRange {
    #[must_use]
    pub fn new(stage_flags: vk::ShaderStageFlags, offset: u32, size: u32) -> Self {
        Self {
            stage_flags,
            offset,
            size,
        }
    }

    fn feed(&self, h: &mut Fnv64) {
        h.write_u32(self.stage_flags.as_raw());
        h.write_u32(self.offset);
        h.write_u32(self.size);
    }
}

impl From<PushRange> for vk::PushConstantRange {
    fn from(r: PushRange) -> Self {
        vk::PushConstantRange::default()
            .stage_flags(r.stage_flags)
            .offset(r.offset)
            .size(r.size)
    }
}

/// Cache key for a pipeline layout: the set-layout handles plus the
/// push-constant ranges.
#[derive(Debug, Clone)]
pub struct PipelineLayoutKey {
    set_layouts: SmallVec<[vk::DescriptorSetLayout; MAX_SET_LAYOUTS]>,
    push_ranges: SmallVec<[PushRange; MAX_PUSH_RANGES]>,
    hash: u64,
}

impl PipelineLayoutKey {
    #[must_use]
    pub fn new(set_layouts: &[vk::DescriptorSetLayout], push_ranges: &[PushRange]) -> Self {
        let mut h = Fnv64::new();
        for l in set_layouts {
            h.write_u64(l.as_raw());
        }
        for r in push_ranges {
            r.feed(&mut h);
        }
        let hash = h.finish() ^ set_layouts.len() as u64 ^ ((push_ranges.len() as u64) << 16);
        Self {
            set_layouts: SmallVec::from_slice(set_layouts),
            push_ranges: SmallVec::from_slice(push_ranges),
            hash,
        }
    }

    #[must_use]
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for PipelineLayoutKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.set_layouts == other.set_layouts
            && self.push_ranges == other.push_ranges
    }
}

impl Eq for PipelineLayoutKey {}

struct PipelineLayoutEntry {
    key: PipelineLayoutKey,
    layout: vk::PipelineLayout,
}

/// Deduplicating cache for `vk::PipelineLayout`.
pub struct PipelineLayoutCache {
    entries: Vec<PipelineLayoutEntry>,
}

impl PipelineLayoutCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Number of distinct layouts created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find(&self, key: &PipelineLayoutKey) -> Option<vk::PipelineLayout> {
        self.entries
            .iter()
            .find(|e| e.key == *key)
            .map(|e| e.layout)
    }

    /// Return the pipeline layout for the given set layouts and push
    /// ranges, creating it on first use.
    ///
    /// # Safety
    /// The device and all set-layout handles must be valid.
    pub unsafe fn get_or_create(
        &mut self,
        device: &ash::Device,
        set_layouts: &[vk::DescriptorSetLayout],
        push_ranges: &[PushRange],
    ) -> Result<vk::PipelineLayout> {
        let key = PipelineLayoutKey::new(set_layouts, push_ranges);
        if let Some(layout) = self.find(&key) {
            return Ok(layout);
        }

        let vk_ranges: SmallVec<[vk::PushConstantRange; MAX_PUSH_RANGES]> =
            push_ranges.iter().map(|r| (*r).into()).collect();

        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(&vk_ranges);

        let layout = unsafe { device.create_pipeline_layout(&info, None)? };

        tracing::debug!(
            sets = set_layouts.len(),
            push_ranges = push_ranges.len(),
            cached = self.entries.len() + 1,
            "created pipeline layout"
        );
        self.entries.push(PipelineLayoutEntry { key, layout });
        Ok(layout)
    }

    /// Destroy all cached layouts.
    ///
    /// # Safety
    /// The device must be valid and no cached layout may be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for entry in self.entries.drain(..) {
            unsafe { device.destroy_pipeline_layout(entry.layout, None) };
        }
    }
}

impl Default for PipelineLayoutCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ubo(binding: u32) -> BindingDesc {
        BindingDesc::new(
            binding,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            vk::ShaderStageFlags::VERTEX,
        )
    }

    fn ssbo(binding: u32) -> BindingDesc {
        BindingDesc::new(
            binding,
            vk::DescriptorType::STORAGE_BUFFER,
            1,
            vk::ShaderStageFlags::FRAGMENT,
        )
    }

    #[test]
    fn identical_descriptions_make_equal_keys() {
        let a = SetLayoutKey::new(&[ubo(0), ssbo(1)]);
        let b = SetLayoutKey::new(&[ubo(0), ssbo(1)]);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a, b);
    }

    #[test]
    fn any_field_change_makes_keys_differ() {
        let base = SetLayoutKey::new(&[ubo(0)]);
        assert_ne!(base, SetLayoutKey::new(&[ubo(1)]));
        assert_ne!(base, SetLayoutKey::new(&[ssbo(0)]));
        assert_ne!(
            base,
            SetLayoutKey::new(&[BindingDesc::new(
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                2,
                vk::ShaderStageFlags::VERTEX,
            )])
        );
        assert_ne!(
            base,
            SetLayoutKey::new(&[BindingDesc::new(
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                1,
                vk::ShaderStageFlags::FRAGMENT,
            )])
        );
    }

    #[test]
    fn binding_order_is_significant() {
        let a = SetLayoutKey::new(&[ubo(0), ssbo(1)]);
        let b = SetLayoutKey::new(&[ssbo(1), ubo(0)]);
        assert_ne!(a, b);
    }

    #[test]
    fn empty_and_nonempty_differ() {
        assert_ne!(SetLayoutKey::new(&[]), SetLayoutKey::new(&[ubo(0)]));
    }

    #[test]
    fn set_cache_find_hits_identical_key_only() {
        let mut cache = DescriptorLayoutCache::new();
        let key = SetLayoutKey::new(&[ubo(0), ssbo(1)]);
        let layout = vk::DescriptorSetLayout::from_raw(0x1000);
        cache.entries.push(SetLayoutEntry {
            key: key.clone(),
            layout,
        });

        assert_eq!(cache.find(&SetLayoutKey::new(&[ubo(0), ssbo(1)])), Some(layout));
        assert_eq!(cache.find(&SetLayoutKey::new(&[ubo(0)])), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn pipeline_key_identity() {
        let sets = [
            vk::DescriptorSetLayout::from_raw(1),
            vk::DescriptorSetLayout::from_raw(2),
        ];
        let push = [PushRange::new(vk::ShaderStageFlags::VERTEX, 0, 16)];

        let a = PipelineLayoutKey::new(&sets, &push);
        let b = PipelineLayoutKey::new(&sets, &push);
        assert_eq!(a, b);

        let other_sets = [
            vk::DescriptorSetLayout::from_raw(1),
            vk::DescriptorSetLayout::from_raw(3),
        ];
        assert_ne!(a, PipelineLayoutKey::new(&other_sets, &push));

        let other_push = [PushRange::new(vk::ShaderStageFlags::VERTEX, 0, 32)];
        assert_ne!(a, PipelineLayoutKey::new(&sets, &other_push));

        assert_ne!(a, PipelineLayoutKey::new(&sets, &[]));
    }

    #[test]
    fn pipeline_cache_find_dedups() {
        let mut cache = PipelineLayoutCache::new();
        let sets = [vk::DescriptorSetLayout::from_raw(7)];
        let key = PipelineLayoutKey::new(&sets, &[]);
        let layout = vk::PipelineLayout::from_raw(0x2000);
        cache.entries.push(PipelineLayoutEntry { key, layout });

        assert_eq!(cache.find(&PipelineLayoutKey::new(&sets, &[])), Some(layout));
        let push = [PushRange::new(vk::ShaderStageFlags::COMPUTE, 0, 8)];
        assert_eq!(cache.find(&PipelineLayoutKey::new(&sets, &push)), None);
    }
}
