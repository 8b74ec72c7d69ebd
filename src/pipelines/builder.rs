// Graphics pipeline construction
//
// Turns an EffectSpec into a vkPipeline against its target pass.
// Shader modules are created from the effect's SPIR-V files and
// destroyed as soon as vkCreateGraphicsPipelines returns.
use ash::vk;

use std::ffi::CString;

use crate::device::Device;
use crate::passes::RenderPassGraph;
use crate::shaders;
use crate::{DerechoError, Result, MSAA_SAMPLE_COUNT, SHADOWMAP_IMAGE_DIM};

use super::table::{EffectFlags, PassKind, Specialization, StageSet};
use super::RenderEffect;

pub(super) fn build_pipeline(
    dev: &Device,
    effect: RenderEffect,
    layout: vk::PipelineLayout,
    passes: &RenderPassGraph,
    extent: vk::Extent2D,
) -> Result<vk::Pipeline> {
    let spec = effect.spec();

    // -- programmable stages
    let vert_module = shaders::load_stage(dev, spec.es_shader_base, "vert")?;
    let frag_module = shaders::load_stage(dev, spec.es_shader_base, "frag")?;
    let (tesc_module, tese_module) = match spec.es_stages {
        StageSet::VertTescTeseFrag => (
            Some(shaders::load_stage(dev, spec.es_shader_base, "tesc")?),
            Some(shaders::load_stage(dev, spec.es_shader_base, "tese")?),
        ),
        StageSet::VertFrag => (None, None),
    };

    // The CString must outlive pipeline creation; the create infos
    // only hold a pointer to it.
    let entrypoint = CString::new("main").unwrap();

    // -- specialization constants
    let mut spec_data: Vec<u8> = Vec::new();
    let mut spec_entries: Vec<vk::SpecializationMapEntry> = Vec::new();
    match spec.es_specialization {
        Specialization::None => {}
        Specialization::FragmentBool { constant_id, value } => {
            spec_entries.push(
                vk::SpecializationMapEntry::builder()
                    .constant_id(constant_id)
                    .offset(0)
                    .size(4)
                    .build(),
            );
            let raw: u32 = if value { vk::TRUE } else { vk::FALSE };
            spec_data.extend_from_slice(&raw.to_ne_bytes());
        }
        Specialization::TessGround { y_scale, y_offset } => {
            spec_entries.push(
                vk::SpecializationMapEntry::builder()
                    .constant_id(0)
                    .offset(0)
                    .size(4)
                    .build(),
            );
            spec_entries.push(
                vk::SpecializationMapEntry::builder()
                    .constant_id(1)
                    .offset(4)
                    .size(4)
                    .build(),
            );
            spec_data.extend_from_slice(&y_scale.to_ne_bytes());
            spec_data.extend_from_slice(&y_offset.to_ne_bytes());
        }
    }
    let spec_info = vk::SpecializationInfo::builder()
        .map_entries(&spec_entries)
        .data(&spec_data)
        .build();

    let mut stages = Vec::new();
    {
        let mut stage = |flags: vk::ShaderStageFlags, module: vk::ShaderModule, special: bool| {
            let mut info = vk::PipelineShaderStageCreateInfo::builder()
                .stage(flags)
                .module(module)
                .name(&entrypoint)
                .build();
            if special {
                info.p_specialization_info = &spec_info;
            }
            stages.push(info);
        };

        stage(vk::ShaderStageFlags::VERTEX, vert_module, false);
        if let (Some(tesc), Some(tese)) = (tesc_module, tese_module) {
            // the terrain constants feed both tessellation stages
            let tess_special =
                matches!(spec.es_specialization, Specialization::TessGround { .. });
            stage(vk::ShaderStageFlags::TESSELLATION_CONTROL, tesc, tess_special);
            stage(
                vk::ShaderStageFlags::TESSELLATION_EVALUATION,
                tese,
                tess_special,
            );
        }
        let frag_special = matches!(
            spec.es_specialization,
            Specialization::FragmentBool { .. }
        );
        stage(vk::ShaderStageFlags::FRAGMENT, frag_module, frag_special);
    }

    // -- fixed function state
    let vertex_bindings = spec.es_vertex.bindings();
    let vertex_attributes = spec.es_vertex.attributes();
    let vertex_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&vertex_bindings)
        .vertex_attribute_descriptions(&vertex_attributes);

    let assembly = vk::PipelineInputAssemblyStateCreateInfo {
        topology: spec.es_topology,
        ..Default::default()
    };

    // the shadow pass renders at the fixed map dimension, everything
    // else at the surface extent
    let target_extent = match spec.es_target {
        PassKind::Shadowmap => vk::Extent2D {
            width: SHADOWMAP_IMAGE_DIM,
            height: SHADOWMAP_IMAGE_DIM,
        },
        _ => extent,
    };
    let viewport = [vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: target_extent.width as f32,
        height: target_extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }];
    let scissor = [vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: target_extent,
    }];
    let viewport_info = vk::PipelineViewportStateCreateInfo::builder()
        .scissors(&scissor)
        .viewports(&viewport);

    let raster_info = vk::PipelineRasterizationStateCreateInfo {
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        line_width: 1.0,
        polygon_mode: if spec.es_flags.contains(EffectFlags::WIREFRAME) {
            vk::PolygonMode::LINE
        } else {
            vk::PolygonMode::FILL
        },
        cull_mode: if spec.es_flags.contains(EffectFlags::CULL_BACK) {
            vk::CullModeFlags::BACK
        } else {
            vk::CullModeFlags::NONE
        },
        ..Default::default()
    };

    let multisample_info = vk::PipelineMultisampleStateCreateInfo {
        rasterization_samples: match spec.es_target {
            PassKind::Shadowmap => vk::SampleCountFlags::TYPE_1,
            _ => MSAA_SAMPLE_COUNT,
        },
        ..Default::default()
    };

    let stencil_state = vk::StencilOpState {
        fail_op: vk::StencilOp::KEEP,
        pass_op: vk::StencilOp::KEEP,
        depth_fail_op: vk::StencilOp::KEEP,
        compare_op: vk::CompareOp::ALWAYS,
        ..Default::default()
    };
    let depth_info = vk::PipelineDepthStencilStateCreateInfo {
        depth_test_enable: spec.es_flags.contains(EffectFlags::DEPTH_TEST) as u32,
        depth_write_enable: spec.es_flags.contains(EffectFlags::DEPTH_WRITE) as u32,
        depth_compare_op: vk::CompareOp::LESS_OR_EQUAL,
        front: stencil_state,
        back: stencil_state,
        ..Default::default()
    };

    let blend_attachment_states = [if spec.es_flags.contains(EffectFlags::BLEND) {
        vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::TRUE,
            src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ZERO,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        }
    } else {
        vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::FALSE,
            color_write_mask: vk::ColorComponentFlags::RGBA,
            ..Default::default()
        }
    }];
    let blend_info =
        vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachment_states);

    let dynamic_states = [vk::DynamicState::SCISSOR];
    let dynamic_info = vk::PipelineDynamicStateCreateInfo::builder()
        .dynamic_states(&dynamic_states)
        .build();

    let tess_info = vk::PipelineTessellationStateCreateInfo::builder()
        .patch_control_points(spec.es_patch_control_points)
        .build();

    let pass = match spec.es_target {
        PassKind::Shadowmap => passes.rp_shadowmap,
        PassKind::Skybox => passes.rp_skybox,
        PassKind::ColorDepth => passes.rp_color_depth,
        PassKind::Gui => passes.rp_gui,
    };

    let mut pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_info)
        .input_assembly_state(&assembly)
        .viewport_state(&viewport_info)
        .rasterization_state(&raster_info)
        .multisample_state(&multisample_info)
        .depth_stencil_state(&depth_info)
        .color_blend_state(&blend_info)
        .layout(layout)
        .render_pass(pass)
        .subpass(0);

    if spec.es_flags.contains(EffectFlags::DYNAMIC_SCISSOR) {
        pipeline_info = pipeline_info.dynamic_state(&dynamic_info);
    }
    if spec.es_patch_control_points > 0 {
        pipeline_info = pipeline_info.tessellation_state(&tess_info);
    }

    let result = unsafe {
        dev.dev.create_graphics_pipelines(
            vk::PipelineCache::null(),
            &[pipeline_info.build()],
            None,
        )
    };

    // modules are only needed for creation
    unsafe {
        dev.dev.destroy_shader_module(vert_module, None);
        dev.dev.destroy_shader_module(frag_module, None);
        if let Some(tesc) = tesc_module {
            dev.dev.destroy_shader_module(tesc, None);
        }
        if let Some(tese) = tese_module {
            dev.dev.destroy_shader_module(tese, None);
        }
    }

    match result {
        Ok(pipelines) => Ok(pipelines[0]),
        Err((_, e)) => {
            log::error!("Could not create pipeline for {:?}: {:?}", effect, e);
            Err(DerechoError::VK_CALL_FAILED)
        }
    }
}
