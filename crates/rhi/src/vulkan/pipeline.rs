//! Graphics pipeline creation for dynamic rendering.

use ash::vk;
use tracing::{debug, error};

use crate::backend::{PipelineDesc, PipelineObjects};
use crate::error::{RhiError, RhiResult};
use crate::shader::{ENTRY_POINT, ShaderStage, spirv_words};

fn create_module(
    device: &ash::Device,
    bytes: &[u8],
    stage: ShaderStage,
) -> RhiResult<vk::ShaderModule> {
    let words = spirv_words(bytes, stage)?;
    let create_info = vk::ShaderModuleCreateInfo::default().code(&words);
    unsafe { device.create_shader_module(&create_info, None) }
        .map_err(|err| RhiError::ShaderError(format!("{stage} module creation failed: {err}")))
}

/// Builds the pipeline layout and pipeline described by `desc`.
///
/// Viewport and scissor are dynamic. Shader modules are destroyed before
/// returning.
pub fn create_pipeline(device: &ash::Device, desc: &PipelineDesc<'_>) -> RhiResult<PipelineObjects> {
    if !desc.vertex_layout.is_valid() {
        return Err(RhiError::PipelineError(
            "vertex attribute lies outside the vertex stride".to_string(),
        ));
    }

    let vertex = create_module(device, desc.vertex_spirv, ShaderStage::Vertex)?;
    let fragment = match create_module(device, desc.fragment_spirv, ShaderStage::Fragment) {
        Ok(module) => module,
        Err(err) => {
            unsafe { device.destroy_shader_module(vertex, None) };
            return Err(err);
        }
    };

    let result = build(device, desc, vertex, fragment);
    unsafe {
        device.destroy_shader_module(vertex, None);
        device.destroy_shader_module(fragment, None);
    }
    result
}

fn build(
    device: &ash::Device,
    desc: &PipelineDesc<'_>,
    vertex: vk::ShaderModule,
    fragment: vk::ShaderModule,
) -> RhiResult<PipelineObjects> {
    let set_layouts = [desc.set_layout];
    let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
    let layout = unsafe { device.create_pipeline_layout(&layout_info, None)? };

    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(ShaderStage::Vertex.to_vk_stage())
            .module(vertex)
            .name(ENTRY_POINT),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(ShaderStage::Fragment.to_vk_stage())
            .module(fragment)
            .name(ENTRY_POINT),
    ];

    let config = desc.config;
    let bindings = [desc.vertex_layout.binding_description()];
    let attributes = desc.vertex_layout.attribute_descriptions();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);
    let input_assembly =
        vk::PipelineInputAssemblyStateCreateInfo::default().topology(config.topology.to_vk());
    let viewport = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(config.polygon_mode.to_vk())
        .cull_mode(config.cull_mode.to_vk())
        .front_face(config.front_face.to_vk())
        .line_width(1.0);
    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    // The attachment format follows the pass; depth state follows the config.
    let depth_format = desc.depth_format;
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(depth_format.is_some() && config.depth_test)
        .depth_write_enable(depth_format.is_some() && config.depth_write)
        .depth_compare_op(config.depth_compare.to_vk());

    let blend_attachments = [config.blend.to_vk()];
    let color_blend =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_formats = [desc.color_format];
    let mut rendering =
        vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);
    if let Some(format) = depth_format {
        rendering = rendering.depth_attachment_format(format);
    }

    let create_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic)
        .layout(layout)
        .push_next(&mut rendering);

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
    };
    match pipelines {
        Ok(pipelines) => {
            let pipeline = pipelines.into_iter().next().ok_or_else(|| {
                RhiError::PipelineError("driver returned no pipeline".to_string())
            })?;
            debug!("Created graphics pipeline {:?}", pipeline);
            Ok(PipelineObjects { pipeline, layout })
        }
        Err((_, err)) => {
            error!("Graphics pipeline creation failed: {:?}", err);
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(RhiError::PipelineError(format!(
                "graphics pipeline creation failed: {err}"
            )))
        }
    }
}
