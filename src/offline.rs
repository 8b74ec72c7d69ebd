// Offline cubemap and IBL bakes
//
// One-shot render-to-cubemap work that runs during startup and shares
// nothing with the frame loop: it has its own render pass, pipelines,
// command pool and fence, and only reuses the pool allocator, the
// texture store and the shader loader. Each face (and mip, for the
// prefiltered map) is a fullscreen draw that derives its sample
// direction from the face index pushed as a constant.
use ash::vk;

use std::ffi::CString;

use crate::descriptors::{DescriptorLayoutRegistry, LayoutTag};
use crate::device::Device;
use crate::memory::MemoryBlocks;
use crate::texture::{Texture, TextureStore};
use crate::{DerechoError, Result};

pub const ENVIRONMENT_CUBEMAP_DIM: u32 = 512;
pub const IRRADIANCE_CUBEMAP_DIM: u32 = 32;
pub const PREFILTERED_CUBEMAP_DIM: u32 = 128;
pub const PREFILTERED_MIP_LEVELS: u32 = 5;
pub const BRDF_LUT_DIM: u32 = 512;

const BAKE_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

/// The textures the scene pass samples for image based lighting.
pub struct BakedEnvironment {
    pub be_environment: Texture,
    pub be_irradiance: Texture,
    pub be_prefiltered: Texture,
    pub be_brdf_lut: Texture,
}

/// Per-draw constants of the bake pipelines.
#[repr(C)]
#[derive(Copy, Clone)]
struct BakePush {
    bp_face: u32,
    bp_roughness: f32,
}

/// Run all four bakes. `equirect` is the host-loaded HDR environment
/// (or the fallback texture when the asset is missing).
pub fn bake_environment(
    dev: &Device,
    pool: &mut MemoryBlocks,
    store: &mut TextureStore,
    registry: &DescriptorLayoutRegistry,
    equirect: Texture,
) -> Result<BakedEnvironment> {
    let mut baker = Baker::new(dev, registry)?;

    let environment = store.allocate_cubemap(dev, pool, ENVIRONMENT_CUBEMAP_DIM, BAKE_FORMAT, 1)?;
    baker.render_cubemap(
        dev,
        pool,
        registry,
        store,
        "cubemap_from_equirect",
        equirect,
        environment,
        ENVIRONMENT_CUBEMAP_DIM,
        1,
    )?;

    let irradiance = store.allocate_cubemap(dev, pool, IRRADIANCE_CUBEMAP_DIM, BAKE_FORMAT, 1)?;
    baker.render_cubemap(
        dev,
        pool,
        registry,
        store,
        "cubemap_irradiance",
        environment,
        irradiance,
        IRRADIANCE_CUBEMAP_DIM,
        1,
    )?;

    let prefiltered = store.allocate_cubemap(
        dev,
        pool,
        PREFILTERED_CUBEMAP_DIM,
        BAKE_FORMAT,
        PREFILTERED_MIP_LEVELS,
    )?;
    baker.render_cubemap(
        dev,
        pool,
        registry,
        store,
        "cubemap_prefilter",
        environment,
        prefiltered,
        PREFILTERED_CUBEMAP_DIM,
        PREFILTERED_MIP_LEVELS,
    )?;

    let brdf_lut = store.allocate_render_target_2d(dev, pool, BRDF_LUT_DIM, BAKE_FORMAT)?;
    baker.render_brdf_lut(dev, brdf_lut)?;

    unsafe {
        baker.destroy(dev);
    }

    Ok(BakedEnvironment {
        be_environment: environment,
        be_irradiance: irradiance,
        be_prefiltered: prefiltered,
        be_brdf_lut: brdf_lut,
    })
}

struct Baker {
    bk_pass: vk::RenderPass,
    bk_layout: vk::PipelineLayout,
    bk_lut_layout: vk::PipelineLayout,
    bk_cmd_pool: vk::CommandPool,
    bk_fence: vk::Fence,
}

impl Baker {
    fn new(dev: &Device, registry: &DescriptorLayoutRegistry) -> Result<Self> {
        // single color subpass; the attachment leaves the pass already
        // sampleable so no extra barrier is needed per face
        let attachments = [vk::AttachmentDescription {
            format: BAKE_FORMAT,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ..Default::default()
        }];
        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let subpasses = [vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .build()];
        let dependencies = [vk::SubpassDependency {
            src_subpass: 0,
            dst_subpass: vk::SUBPASS_EXTERNAL,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
            src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::SHADER_READ,
            ..Default::default()
        }];
        let pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        let pass = unsafe {
            dev.dev
                .create_render_pass(&pass_info, None)
                .or(Err(DerechoError::VK_CALL_FAILED))?
        };

        let push = [vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(std::mem::size_of::<BakePush>() as u32)
            .build()];
        let set_layouts = [registry.get(LayoutTag::SingleTextureFrag)];
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push)
            .build();
        let layout = unsafe {
            dev.dev
                .create_pipeline_layout(&layout_info, None)
                .or(Err(DerechoError::VK_CALL_FAILED))?
        };

        let lut_layout_info = vk::PipelineLayoutCreateInfo::builder().build();
        let lut_layout = unsafe {
            dev.dev
                .create_pipeline_layout(&lut_layout_info, None)
                .or(Err(DerechoError::VK_CALL_FAILED))?
        };

        Ok(Self {
            bk_pass: pass,
            bk_layout: layout,
            bk_lut_layout: lut_layout,
            bk_cmd_pool: dev.create_command_pool(dev.graphics_family),
            bk_fence: unsafe {
                dev.dev
                    .create_fence(&vk::FenceCreateInfo::builder(), None)
                    .or(Err(DerechoError::VK_CALL_FAILED))?
            },
        })
    }

    /// A bake pipeline is a fullscreen triangle (three synthetic
    /// vertices, no vertex buffer) with the face direction math in the
    /// shaders.
    fn build_pipeline(
        &self,
        dev: &Device,
        shader_base: &str,
        layout: vk::PipelineLayout,
        dim: u32,
    ) -> Result<vk::Pipeline> {
        let vert = crate::shaders::load_stage(dev, shader_base, "vert")?;
        let frag = crate::shaders::load_stage(dev, shader_base, "frag")?;
        let entrypoint = CString::new("main").unwrap();

        let stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert)
                .name(&entrypoint)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag)
                .name(&entrypoint)
                .build(),
        ];

        let vertex_info = vk::PipelineVertexInputStateCreateInfo::builder().build();
        let assembly = vk::PipelineInputAssemblyStateCreateInfo {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            ..Default::default()
        };

        let viewport = [vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: dim as f32,
            height: dim as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }];
        let scissor = [vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: dim,
                height: dim,
            },
        }];
        let viewport_info = vk::PipelineViewportStateCreateInfo::builder()
            .scissors(&scissor)
            .viewports(&viewport);

        let raster_info = vk::PipelineRasterizationStateCreateInfo {
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            polygon_mode: vk::PolygonMode::FILL,
            ..Default::default()
        };
        let multisample_info = vk::PipelineMultisampleStateCreateInfo {
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            ..Default::default()
        };
        let depth_info = vk::PipelineDepthStencilStateCreateInfo::default();
        let blend_attachments = [vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::FALSE,
            color_write_mask: vk::ColorComponentFlags::RGBA,
            ..Default::default()
        }];
        let blend_info =
            vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

        // the viewport shrinks per prefilter mip
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_info =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_info)
            .input_assembly_state(&assembly)
            .viewport_state(&viewport_info)
            .rasterization_state(&raster_info)
            .multisample_state(&multisample_info)
            .depth_stencil_state(&depth_info)
            .color_blend_state(&blend_info)
            .dynamic_state(&dynamic_info)
            .layout(layout)
            .render_pass(self.bk_pass)
            .subpass(0)
            .build();

        let result = unsafe {
            dev.dev
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        };

        unsafe {
            dev.dev.destroy_shader_module(vert, None);
            dev.dev.destroy_shader_module(frag, None);
        }

        match result {
            Ok(pipelines) => Ok(pipelines[0]),
            Err((_, e)) => {
                log::error!("Could not create bake pipeline {}: {:?}", shader_base, e);
                Err(DerechoError::VK_CALL_FAILED)
            }
        }
    }

    /// Render every (face, mip) of `target` by sampling `source`.
    fn render_cubemap(
        &mut self,
        dev: &Device,
        _pool: &mut MemoryBlocks,
        registry: &DescriptorLayoutRegistry,
        store: &TextureStore,
        shader_base: &str,
        source: Texture,
        target: Texture,
        dim: u32,
        mip_levels: u32,
    ) -> Result<()> {
        let pipeline = self.build_pipeline(dev, shader_base, self.bk_layout, dim)?;

        let source_set = registry.allocate_set(dev, LayoutTag::SingleTextureFrag)?;
        registry.write_images(dev, source_set, 0, store.ts_sampler, &[source.t_image_view]);

        // per-(face, mip) views and framebuffers
        let mut views = Vec::new();
        let mut framebuffers = Vec::new();
        for mip in 0..mip_levels {
            for face in 0..6u32 {
                let view_info = vk::ImageViewCreateInfo::builder()
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(BAKE_FORMAT)
                    .subresource_range(
                        vk::ImageSubresourceRange::builder()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .base_mip_level(mip)
                            .level_count(1)
                            .base_array_layer(face)
                            .layer_count(1)
                            .build(),
                    )
                    .image(target.t_image);
                let view = unsafe {
                    dev.dev
                        .create_image_view(&view_info, None)
                        .or(Err(DerechoError::VK_CALL_FAILED))?
                };
                views.push(view);

                let mip_dim = (dim >> mip).max(1);
                let attachments = [view];
                let fb_info = vk::FramebufferCreateInfo::builder()
                    .render_pass(self.bk_pass)
                    .attachments(&attachments)
                    .width(mip_dim)
                    .height(mip_dim)
                    .layers(1);
                framebuffers.push(unsafe {
                    dev.dev
                        .create_framebuffer(&fb_info, None)
                        .or(Err(DerechoError::VK_CALL_FAILED))?
                });
            }
        }

        let cbuf = dev.create_command_buffers(self.bk_cmd_pool, 1)[0];
        unsafe {
            let begin = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            dev.dev
                .begin_command_buffer(cbuf, &begin)
                .or(Err(DerechoError::VK_CALL_FAILED))?;

            for mip in 0..mip_levels {
                let mip_dim = (dim >> mip).max(1);
                let roughness = if mip_levels > 1 {
                    mip as f32 / (mip_levels - 1) as f32
                } else {
                    0.0
                };

                for face in 0..6u32 {
                    let fb = framebuffers[(mip * 6 + face) as usize];
                    let begin = vk::RenderPassBeginInfo::builder()
                        .render_pass(self.bk_pass)
                        .framebuffer(fb)
                        .render_area(vk::Rect2D {
                            offset: vk::Offset2D { x: 0, y: 0 },
                            extent: vk::Extent2D {
                                width: mip_dim,
                                height: mip_dim,
                            },
                        });
                    dev.dev
                        .cmd_begin_render_pass(cbuf, &begin, vk::SubpassContents::INLINE);

                    dev.dev
                        .cmd_bind_pipeline(cbuf, vk::PipelineBindPoint::GRAPHICS, pipeline);
                    dev.dev.cmd_set_viewport(
                        cbuf,
                        0,
                        &[vk::Viewport {
                            x: 0.0,
                            y: 0.0,
                            width: mip_dim as f32,
                            height: mip_dim as f32,
                            min_depth: 0.0,
                            max_depth: 1.0,
                        }],
                    );
                    dev.dev.cmd_set_scissor(
                        cbuf,
                        0,
                        &[vk::Rect2D {
                            offset: vk::Offset2D { x: 0, y: 0 },
                            extent: vk::Extent2D {
                                width: mip_dim,
                                height: mip_dim,
                            },
                        }],
                    );
                    dev.dev.cmd_bind_descriptor_sets(
                        cbuf,
                        vk::PipelineBindPoint::GRAPHICS,
                        self.bk_layout,
                        0,
                        &[source_set],
                        &[],
                    );

                    let push = BakePush {
                        bp_face: face,
                        bp_roughness: roughness,
                    };
                    dev.dev.cmd_push_constants(
                        cbuf,
                        self.bk_layout,
                        vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                        0,
                        std::slice::from_raw_parts(
                            &push as *const _ as *const u8,
                            std::mem::size_of::<BakePush>(),
                        ),
                    );

                    dev.dev.cmd_draw(cbuf, 3, 1, 0, 0);
                    dev.dev.cmd_end_render_pass(cbuf);
                }
            }

            dev.dev
                .end_command_buffer(cbuf)
                .or(Err(DerechoError::VK_CALL_FAILED))?;
        }

        self.submit_and_wait(dev, cbuf)?;

        unsafe {
            for fb in framebuffers.drain(..) {
                dev.dev.destroy_framebuffer(fb, None);
            }
            for view in views.drain(..) {
                dev.dev.destroy_image_view(view, None);
            }
            dev.dev.destroy_pipeline(pipeline, None);
        }

        Ok(())
    }

    /// The BRDF integration lookup table, a single 2D fullscreen draw.
    fn render_brdf_lut(&mut self, dev: &Device, target: Texture) -> Result<()> {
        let pipeline = self.build_pipeline(dev, "brdf_lut", self.bk_lut_layout, BRDF_LUT_DIM)?;

        let attachments = [target.t_image_view];
        let fb_info = vk::FramebufferCreateInfo::builder()
            .render_pass(self.bk_pass)
            .attachments(&attachments)
            .width(BRDF_LUT_DIM)
            .height(BRDF_LUT_DIM)
            .layers(1);
        let framebuffer = unsafe {
            dev.dev
                .create_framebuffer(&fb_info, None)
                .or(Err(DerechoError::VK_CALL_FAILED))?
        };

        let cbuf = dev.create_command_buffers(self.bk_cmd_pool, 1)[0];
        unsafe {
            let begin = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            dev.dev
                .begin_command_buffer(cbuf, &begin)
                .or(Err(DerechoError::VK_CALL_FAILED))?;

            let pass_begin = vk::RenderPassBeginInfo::builder()
                .render_pass(self.bk_pass)
                .framebuffer(framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: vk::Extent2D {
                        width: BRDF_LUT_DIM,
                        height: BRDF_LUT_DIM,
                    },
                });
            dev.dev
                .cmd_begin_render_pass(cbuf, &pass_begin, vk::SubpassContents::INLINE);
            dev.dev
                .cmd_bind_pipeline(cbuf, vk::PipelineBindPoint::GRAPHICS, pipeline);
            dev.dev.cmd_set_viewport(
                cbuf,
                0,
                &[vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: BRDF_LUT_DIM as f32,
                    height: BRDF_LUT_DIM as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
            dev.dev.cmd_set_scissor(
                cbuf,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: vk::Extent2D {
                        width: BRDF_LUT_DIM,
                        height: BRDF_LUT_DIM,
                    },
                }],
            );
            dev.dev.cmd_draw(cbuf, 3, 1, 0, 0);
            dev.dev.cmd_end_render_pass(cbuf);

            dev.dev
                .end_command_buffer(cbuf)
                .or(Err(DerechoError::VK_CALL_FAILED))?;
        }

        self.submit_and_wait(dev, cbuf)?;

        unsafe {
            dev.dev.destroy_framebuffer(framebuffer, None);
            dev.dev.destroy_pipeline(pipeline, None);
        }

        Ok(())
    }

    fn submit_and_wait(&self, dev: &Device, cbuf: vk::CommandBuffer) -> Result<()> {
        unsafe {
            let cbufs = [cbuf];
            let submit = [vk::SubmitInfo::builder().command_buffers(&cbufs).build()];
            dev.dev
                .queue_submit(dev.graphics_queue, &submit, self.bk_fence)
                .or(Err(DerechoError::VK_CALL_FAILED))?;
            match dev.dev.wait_for_fences(&[self.bk_fence], true, u64::MAX) {
                Ok(()) => {}
                Err(vk::Result::ERROR_DEVICE_LOST) => return Err(DerechoError::DEVICE_LOST),
                Err(_) => return Err(DerechoError::VK_CALL_FAILED),
            }
            dev.dev
                .reset_fences(&[self.bk_fence])
                .or(Err(DerechoError::VK_CALL_FAILED))?;
        }
        Ok(())
    }

    unsafe fn destroy(&mut self, dev: &Device) {
        dev.dev.destroy_fence(self.bk_fence, None);
        dev.dev.destroy_command_pool(self.bk_cmd_pool, None);
        dev.dev.destroy_pipeline_layout(self.bk_layout, None);
        dev.dev.destroy_pipeline_layout(self.bk_lut_layout, None);
        dev.dev.destroy_render_pass(self.bk_pass, None);
    }
}
