//! SPIR-V shader reflection.
//!
//! Reflection (via spirq) turns shader binaries into the binding and
//! push-constant descriptions the layout caches consume, so pipeline
//! layouts come straight from the shaders instead of being written out by
//! hand. Stage merging follows the usual vertex+fragment pattern: the same
//! (set, binding) seen from two stages must agree on descriptor type and
//! ends up with the union of stage flags.

use crate::error::{GpuError, Result};
use crate::layout_cache::{BindingDesc, DescriptorLayoutCache, PipelineLayoutCache, PushRange};
use ash::vk;
use std::collections::BTreeMap;

fn descriptor_type(ty: &spirq::ty::DescriptorType) -> Result<vk::DescriptorType> {
    use spirq::ty::DescriptorType;
    match ty {
        DescriptorType::UniformBuffer() => Ok(vk::DescriptorType::UNIFORM_BUFFER),
        DescriptorType::StorageBuffer(..) => Ok(vk::DescriptorType::STORAGE_BUFFER),
        DescriptorType::CombinedImageSampler() => Ok(vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
        DescriptorType::SampledImage() => Ok(vk::DescriptorType::SAMPLED_IMAGE),
        DescriptorType::StorageImage(..) => Ok(vk::DescriptorType::STORAGE_IMAGE),
        DescriptorType::Sampler() => Ok(vk::DescriptorType::SAMPLER),
        DescriptorType::UniformTexelBuffer() => Ok(vk::DescriptorType::UNIFORM_TEXEL_BUFFER),
        DescriptorType::StorageTexelBuffer(..) => Ok(vk::DescriptorType::STORAGE_TEXEL_BUFFER),
        DescriptorType::InputAttachment(..) => Ok(vk::DescriptorType::INPUT_ATTACHMENT),
        DescriptorType::AccelStruct() => Ok(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR),
        other => Err(GpuError::Reflection(format!(
            "unsupported descriptor type: {other:?}"
        ))),
    }
}

/// Fold `desc` into `bindings`, which stays sorted by binding number.
fn merge_binding(bindings: &mut Vec<BindingDesc>, desc: BindingDesc) -> Result<()> {
    if let Some(existing) = bindings.iter_mut().find(|b| b.binding == desc.binding) {
        if existing.descriptor_type != desc.descriptor_type {
            return Err(GpuError::Reflection(format!(
                "binding {} reflected with conflicting types {:?} and {:?}",
                desc.binding, existing.descriptor_type, desc.descriptor_type
            )));
        }
        existing.stage_flags |= desc.stage_flags;
        existing.descriptor_count = existing.descriptor_count.max(desc.descriptor_count);
        return Ok(());
    }
    let pos = bindings.partition_point(|b| b.binding < desc.binding);
    bindings.insert(pos, desc);
    Ok(())
}

fn merge_push_range(ranges: &mut Vec<PushRange>, range: PushRange) {
    if let Some(existing) = ranges
        .iter_mut()
        .find(|r| r.offset == range.offset && r.size == range.size)
    {
        existing.stage_flags |= range.stage_flags;
        return;
    }
    ranges.push(range);
}

/// Bindings and push constants reflected from one shader stage.
#[derive(Debug, Clone)]
pub struct ReflectedShader {
    pub stage: vk::ShaderStageFlags,
    /// Bindings per set index, sorted by binding number.
    pub sets: BTreeMap<u32, Vec<BindingDesc>>,
    pub push_constant: Option<PushRange>,
}

impl ReflectedShader {
    /// Reflect a SPIR-V binary. `stage` tags every reflected binding; the
    /// binary is expected to hold a single entry point of that stage.
    pub fn from_spirv(code: &[u32], stage: vk::ShaderStageFlags) -> Result<Self> {
        let entry_points = spirq::ReflectConfig::new()
            .spv(code)
            .ref_all_rscs(true)
            .reflect()
            .map_err(|e| GpuError::Reflection(format!("{e:?}")))?;

        let mut sets: BTreeMap<u32, Vec<BindingDesc>> = BTreeMap::new();
        let mut push_constant = None;

        for entry_point in &entry_points {
            for var in &entry_point.vars {
                match var {
                    spirq::var::Variable::Descriptor {
                        desc_bind,
                        desc_ty,
                        nbind,
                        ..
                    } => {
                        let desc = BindingDesc::new(
                            desc_bind.bind(),
                            descriptor_type(desc_ty)?,
                            (*nbind).max(1),
                            stage,
                        );
                        merge_binding(sets.entry(desc_bind.set()).or_default(), desc)?;
                    }
                    spirq::var::Variable::PushConstant { ty, .. } => {
                        let size = ty.nbyte().ok_or_else(|| {
                            GpuError::Reflection("push constant block has no size".into())
                        })? as u32;
                        push_constant = Some(PushRange::new(stage, 0, size));
                    }
                    _ => {}
                }
            }
        }

        Ok(Self {
            stage,
            sets,
            push_constant,
        })
    }
}

/// The union of several shader stages, ready for layout creation.
#[derive(Debug, Clone, Default)]
pub struct MergedReflection {
    pub sets: BTreeMap<u32, Vec<BindingDesc>>,
    pub push_ranges: Vec<PushRange>,
}

impl MergedReflection {
    /// Merge reflections of the stages of one pipeline.
    pub fn merge(shaders: &[ReflectedShader]) -> Result<Self> {
        let mut merged = Self::default();
        for shader in shaders {
            for (&set, bindings) in &shader.sets {
                let target = merged.sets.entry(set).or_default();
                for &desc in bindings {
                    merge_binding(target, desc)?;
                }
            }
            if let Some(range) = shader.push_constant {
                merge_push_range(&mut merged.push_ranges, range);
            }
        }
        Ok(merged)
    }

    /// Create one set layout per set index `0..=max`, through the cache.
    /// A set index the shaders skip becomes an empty layout, keeping set
    /// numbers aligned with the shader source.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn create_set_layouts(
        &self,
        device: &ash::Device,
        cache: &mut DescriptorLayoutCache,
    ) -> Result<Vec<vk::DescriptorSetLayout>> {
        let Some(&max_set) = self.sets.keys().max() else {
            return Ok(Vec::new());
        };

        let mut layouts = Vec::with_capacity(max_set as usize + 1);
        for set in 0..=max_set {
            let bindings = self.sets.get(&set).map_or(&[][..], Vec::as_slice);
            layouts.push(unsafe { cache.get_or_create(device, bindings)? });
        }
        Ok(layouts)
    }

    /// Create the pipeline layout for the merged stages, funnelled through
    /// both caches.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn create_pipeline_layout(
        &self,
        device: &ash::Device,
        desc_cache: &mut DescriptorLayoutCache,
        pipe_cache: &mut PipelineLayoutCache,
    ) -> Result<vk::PipelineLayout> {
        let set_layouts = unsafe { self.create_set_layouts(device, desc_cache)? };
        unsafe { pipe_cache.get_or_create(device, &set_layouts, &self.push_ranges) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shader(
        stage: vk::ShaderStageFlags,
        sets: &[(u32, Vec<BindingDesc>)],
        push: Option<PushRange>,
    ) -> ReflectedShader {
        ReflectedShader {
            stage,
            sets: sets.iter().cloned().collect(),
            push_constant: push,
        }
    }

    fn ubo(binding: u32, stage: vk::ShaderStageFlags) -> BindingDesc {
        BindingDesc::new(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage)
    }

    #[test]
    fn shared_binding_unions_stage_flags() {
        let vert = shader(
            vk::ShaderStageFlags::VERTEX,
            &[(0, vec![ubo(0, vk::ShaderStageFlags::VERTEX)])],
            None,
        );
        let frag = shader(
            vk::ShaderStageFlags::FRAGMENT,
            &[(0, vec![ubo(0, vk::ShaderStageFlags::FRAGMENT)])],
            None,
        );

        let merged = MergedReflection::merge(&[vert, frag]).unwrap();
        let bindings = &merged.sets[&0];
        assert_eq!(bindings.len(), 1);
        assert_eq!(
            bindings[0].stage_flags,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn disjoint_sets_are_unioned() {
        let vert = shader(
            vk::ShaderStageFlags::VERTEX,
            &[(0, vec![ubo(0, vk::ShaderStageFlags::VERTEX)])],
            None,
        );
        let frag = shader(
            vk::ShaderStageFlags::FRAGMENT,
            &[(2, vec![ubo(1, vk::ShaderStageFlags::FRAGMENT)])],
            None,
        );

        let merged = MergedReflection::merge(&[vert, frag]).unwrap();
        assert_eq!(merged.sets.len(), 2);
        assert!(merged.sets.contains_key(&0));
        assert!(merged.sets.contains_key(&2));
    }

    #[test]
    fn conflicting_types_are_an_error() {
        let vert = shader(
            vk::ShaderStageFlags::VERTEX,
            &[(0, vec![ubo(0, vk::ShaderStageFlags::VERTEX)])],
            None,
        );
        let frag = shader(
            vk::ShaderStageFlags::FRAGMENT,
            &[(
                0,
                vec![BindingDesc::new(
                    0,
                    vk::DescriptorType::STORAGE_BUFFER,
                    1,
                    vk::ShaderStageFlags::FRAGMENT,
                )],
            )],
            None,
        );

        assert!(MergedReflection::merge(&[vert, frag]).is_err());
    }

    #[test]
    fn descriptor_count_takes_the_max() {
        let a = shader(
            vk::ShaderStageFlags::VERTEX,
            &[(
                0,
                vec![BindingDesc::new(
                    0,
                    vk::DescriptorType::SAMPLED_IMAGE,
                    4,
                    vk::ShaderStageFlags::VERTEX,
                )],
            )],
            None,
        );
        let b = shader(
            vk::ShaderStageFlags::FRAGMENT,
            &[(
                0,
                vec![BindingDesc::new(
                    0,
                    vk::DescriptorType::SAMPLED_IMAGE,
                    16,
                    vk::ShaderStageFlags::FRAGMENT,
                )],
            )],
            None,
        );

        let merged = MergedReflection::merge(&[a, b]).unwrap();
        assert_eq!(merged.sets[&0][0].descriptor_count, 16);
    }

    #[test]
    fn equal_push_ranges_merge_stages() {
        let vert = shader(
            vk::ShaderStageFlags::VERTEX,
            &[],
            Some(PushRange::new(vk::ShaderStageFlags::VERTEX, 0, 32)),
        );
        let frag = shader(
            vk::ShaderStageFlags::FRAGMENT,
            &[],
            Some(PushRange::new(vk::ShaderStageFlags::FRAGMENT, 0, 32)),
        );

        let merged = MergedReflection::merge(&[vert, frag]).unwrap();
        assert_eq!(merged.push_ranges.len(), 1);
        assert_eq!(
            merged.push_ranges[0].stage_flags,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn differing_push_ranges_stay_separate() {
        let vert = shader(
            vk::ShaderStageFlags::VERTEX,
            &[],
            Some(PushRange::new(vk::ShaderStageFlags::VERTEX, 0, 16)),
        );
        let frag = shader(
            vk::ShaderStageFlags::FRAGMENT,
            &[],
            Some(PushRange::new(vk::ShaderStageFlags::FRAGMENT, 0, 64)),
        );

        let merged = MergedReflection::merge(&[vert, frag]).unwrap();
        assert_eq!(merged.push_ranges.len(), 2);
    }

    #[test]
    fn bindings_stay_sorted_by_binding_number() {
        let mut bindings = Vec::new();
        merge_binding(&mut bindings, ubo(3, vk::ShaderStageFlags::VERTEX)).unwrap();
        merge_binding(&mut bindings, ubo(0, vk::ShaderStageFlags::VERTEX)).unwrap();
        merge_binding(&mut bindings, ubo(2, vk::ShaderStageFlags::VERTEX)).unwrap();
        let order: Vec<u32> = bindings.iter().map(|b| b.binding).collect();
        assert_eq!(order, [0, 2, 3]);
    }
}
