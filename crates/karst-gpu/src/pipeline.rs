//! Pipeline creation and management.
//!
//! Pipelines derive their layouts from shader reflection: the SPIR-V is
//! reflected, stages are merged, and the set and pipeline layouts come out
//! of the shared caches. The caches own the layout handles, so destroying
//! a pipeline never destroys its layout.

use crate::error::{GpuError, Result};
use crate::layout_cache::{DescriptorLayoutCache, PipelineLayoutCache};
use crate::reflect::{MergedReflection, ReflectedShader};
use ash::vk;

/// Compute pipeline wrapper.
pub struct ComputePipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl ComputePipeline {
    /// Create a compute pipeline from shader code. The layout is reflected
    /// from the shader and deduplicated through the caches.
    ///
    /// # Safety
    /// The device must be valid and the shader code must be valid SPIR-V.
    pub unsafe fn from_spirv(
        device: &ash::Device,
        shader_code: &[u32],
        pipeline_cache: vk::PipelineCache,
        desc_cache: &mut DescriptorLayoutCache,
        layout_cache: &mut PipelineLayoutCache,
    ) -> Result<Self> {
        let reflection = ReflectedShader::from_spirv(shader_code, vk::ShaderStageFlags::COMPUTE)?;
        let merged = MergedReflection::merge(std::slice::from_ref(&reflection))?;
        let layout = unsafe { merged.create_pipeline_layout(device, desc_cache, layout_cache)? };

        let shader_info = vk::ShaderModuleCreateInfo::default().code(shader_code);
        let shader_module = unsafe { device.create_shader_module(&shader_info, None) }
            .map_err(|e| GpuError::ShaderCompilation(e.to_string()))?;

        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module)
            .name(c"main");

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout);

        let pipelines =
            unsafe { device.create_compute_pipelines(pipeline_cache, &[pipeline_info], None) };

        unsafe { device.destroy_shader_module(shader_module, None) };

        let pipelines =
            pipelines.map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()))?;

        Ok(Self {
            pipeline: pipelines[0],
            layout,
        })
    }

    /// Destroy the pipeline. The layout stays alive in its cache.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_pipeline(self.pipeline, None) };
    }
}

/// Graphics pipeline configuration.
///
/// The default is a vertex-pulling setup: no vertex input bindings, with
/// geometry fetched from storage buffers addressed through push constants.
#[derive(Clone)]
pub struct GraphicsPipelineConfig {
    pub vertex_shader: Vec<u32>,
    pub fragment_shader: Vec<u32>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
}

impl Default for GraphicsPipelineConfig {
    fn default() -> Self {
        Self {
            vertex_shader: Vec::new(),
            fragment_shader: Vec::new(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            color_formats: vec![vk::Format::B8G8R8A8_SRGB],
            depth_format: Some(vk::Format::D32_SFLOAT),
        }
    }
}

/// Graphics pipeline wrapper.
pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    /// Create a graphics pipeline using dynamic rendering (Vulkan 1.3).
    /// The layout is reflected from both stages and deduplicated through
    /// the caches.
    ///
    /// # Safety
    /// The device must be valid and shader code must be valid SPIR-V.
    pub unsafe fn from_spirv(
        device: &ash::Device,
        config: &GraphicsPipelineConfig,
        pipeline_cache: vk::PipelineCache,
        desc_cache: &mut DescriptorLayoutCache,
        layout_cache: &mut PipelineLayoutCache,
    ) -> Result<Self> {
        let vert_reflection =
            ReflectedShader::from_spirv(&config.vertex_shader, vk::ShaderStageFlags::VERTEX)?;
        let frag_reflection =
            ReflectedShader::from_spirv(&config.fragment_shader, vk::ShaderStageFlags::FRAGMENT)?;
        let merged = MergedReflection::merge(&[vert_reflection, frag_reflection])?;
        let layout = unsafe { merged.create_pipeline_layout(device, desc_cache, layout_cache)? };

        let vert_shader_info = vk::ShaderModuleCreateInfo::default().code(&config.vertex_shader);
        let vert_module = unsafe { device.create_shader_module(&vert_shader_info, None) }
            .map_err(|e| GpuError::ShaderCompilation(format!("Vertex: {e}")))?;

        let frag_shader_info = vk::ShaderModuleCreateInfo::default().code(&config.fragment_shader);
        let frag_module = match unsafe { device.create_shader_module(&frag_shader_info, None) } {
            Ok(module) => module,
            Err(e) => {
                unsafe { device.destroy_shader_module(vert_module, None) };
                return Err(GpuError::ShaderCompilation(format!("Fragment: {e}")));
            }
        };

        // Shader stages
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module)
                .name(c"main"),
        ];

        // Vertex input (empty under vertex pulling)
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&config.vertex_bindings)
            .vertex_attribute_descriptions(&config.vertex_attributes);

        // Input assembly
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(config.topology)
            .primitive_restart_enable(false);

        // Viewport (dynamic)
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        // Rasterization
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(config.polygon_mode)
            .cull_mode(config.cull_mode)
            .front_face(config.front_face)
            .depth_bias_enable(false)
            .line_width(1.0);

        // Multisampling
        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false);

        // Depth stencil
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(config.depth_test)
            .depth_write_enable(config.depth_write)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        // Color blending
        let color_blend_attachments: Vec<_> = config
            .color_formats
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(false)
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
            })
            .collect();

        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        // Dynamic state
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        // Dynamic rendering info (Vulkan 1.3)
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&config.color_formats);

        if let Some(depth_format) = config.depth_format {
            rendering_info = rendering_info.depth_attachment_format(depth_format);
        }

        // Create pipeline
        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let pipelines =
            unsafe { device.create_graphics_pipelines(pipeline_cache, &[pipeline_info], None) };

        unsafe { device.destroy_shader_module(vert_module, None) };
        unsafe { device.destroy_shader_module(frag_module, None) };

        let pipelines =
            pipelines.map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()))?;

        Ok(Self {
            pipeline: pipelines[0],
            layout,
        })
    }

    /// Destroy the pipeline. The layout stays alive in its cache.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_pipeline(self.pipeline, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_vertex_pulling() {
        let config = GraphicsPipelineConfig::default();
        assert!(config.vertex_bindings.is_empty());
        assert!(config.vertex_attributes.is_empty());
        assert_eq!(config.topology, vk::PrimitiveTopology::TRIANGLE_LIST);
    }

    #[test]
    fn default_config_enables_depth() {
        let config = GraphicsPipelineConfig::default();
        assert!(config.depth_test);
        assert!(config.depth_write);
        assert_eq!(config.depth_format, Some(vk::Format::D32_SFLOAT));
    }
}
