// The engine aggregate
//
// One Engine value owns every subsystem and is passed by reference to
// everything above it. Workers see an immutable FrameContext snapshot
// plus their own recorder; nothing else escapes.
use ash::extensions::khr;
use ash::vk;
use ash::vk::Handle;

use std::sync::Arc;

use crate::cascades;
use crate::deletion::{DeletionQueue, RetiredResource};
use crate::descriptors::{DescriptorLayoutRegistry, LayoutTag};
use crate::device::Device;
use crate::display::Display;
use crate::font::{self, SdfFont};
use crate::frame::{CascadeUbo, FrameContext, FrameInputs, FrameResources, MAX_GUI_LINES, MAX_SKINNING_JOINTS};
use crate::framebuffers::{FramebufferSet, RenderTargets};
use crate::instance::{CreateInfo, Instance};
use crate::jobs::{Job, JobSystem, PassTarget};
use crate::lights::convert_light_sources;
use crate::memory::{BlockRef, MemoryBlocks, RegionKind};
use crate::offline::{self, BakedEnvironment};
use crate::passes::{self, RenderPassGraph};
use crate::pipelines::{PipelinePair, Pipelines, RenderEffect, EFFECT_COUNT};
use crate::texture::TextureStore;
use crate::{DerechoError, Result, SHADOWMAP_CASCADE_COUNT};

/// Unit cube for the skybox, 12 triangles, inward facing.
static SKYBOX_CUBE: [[f32; 3]; 36] = [
    // -X
    [-1.0, -1.0, -1.0], [-1.0, -1.0, 1.0], [-1.0, 1.0, 1.0],
    [-1.0, 1.0, 1.0], [-1.0, 1.0, -1.0], [-1.0, -1.0, -1.0],
    // +X
    [1.0, -1.0, -1.0], [1.0, 1.0, -1.0], [1.0, 1.0, 1.0],
    [1.0, 1.0, 1.0], [1.0, -1.0, 1.0], [1.0, -1.0, -1.0],
    // -Y
    [-1.0, -1.0, -1.0], [1.0, -1.0, -1.0], [1.0, -1.0, 1.0],
    [1.0, -1.0, 1.0], [-1.0, -1.0, 1.0], [-1.0, -1.0, -1.0],
    // +Y
    [-1.0, 1.0, -1.0], [-1.0, 1.0, 1.0], [1.0, 1.0, 1.0],
    [1.0, 1.0, 1.0], [1.0, 1.0, -1.0], [-1.0, 1.0, -1.0],
    // -Z
    [-1.0, -1.0, -1.0], [-1.0, 1.0, -1.0], [1.0, 1.0, -1.0],
    [1.0, 1.0, -1.0], [1.0, -1.0, -1.0], [-1.0, -1.0, -1.0],
    // +Z
    [-1.0, -1.0, 1.0], [1.0, -1.0, 1.0], [1.0, 1.0, 1.0],
    [1.0, 1.0, 1.0], [-1.0, 1.0, 1.0], [-1.0, -1.0, 1.0],
];

pub struct Engine {
    e_dev: Arc<Device>,
    e_display: Display,
    e_memory: MemoryBlocks,
    e_registry: DescriptorLayoutRegistry,
    e_passes: RenderPassGraph,
    e_targets: RenderTargets,
    e_framebuffers: FramebufferSet,
    e_pipelines: Pipelines,
    e_textures: TextureStore,
    e_baked: BakedEnvironment,
    e_frames: FrameResources,
    e_jobs: JobSystem,
    e_deletion: DeletionQueue,
    e_font: Option<SdfFont>,

    /// shadow map array bound as a sampled texture for the scene pass
    e_shadowmap_set: vk::DescriptorSet,
    /// environment cubemap for the skybox pass
    e_skybox_set: vk::DescriptorSet,
    /// irradiance + prefiltered + brdf lut for the pbr shaders
    e_ibl_set: vk::DescriptorSet,

    e_skybox_verts: BlockRef,
    e_skybox_vert_count: u32,

    e_frame_counter: u64,
    e_torn_down: bool,
}

impl Engine {
    /// Bring the whole engine up against an SDL window.
    ///
    /// Startup order matters: regions before anything that allocates,
    /// passes before framebuffers and pipelines, the offline bakes
    /// before the descriptor sets that sample their output.
    pub fn new(window: &sdl2::video::Window, info: &CreateInfo) -> Result<Self> {
        let extensions = window
            .vulkan_instance_extensions()
            .map_err(|e| {
                log::error!("SDL could not list vulkan extensions: {}", e);
                DerechoError::SURFACE_CREATION_FAILED
            })?;
        let instance = Arc::new(Instance::new(info, &extensions)?);

        let surface_loader = khr::Surface::new(&instance.loader, &instance.inst);
        let raw_surface = window
            .vulkan_create_surface(instance.inst.handle().as_raw() as usize)
            .map_err(|e| {
                log::error!("SDL could not create a vulkan surface: {}", e);
                DerechoError::SURFACE_CREATION_FAILED
            })?;
        let surface = vk::SurfaceKHR::from_raw(raw_surface);

        let dev = Arc::new(Device::new(instance.clone(), &surface_loader, surface)?);
        let extent = vk::Extent2D {
            width: info.width,
            height: info.height,
        };
        let display = Display::new(&instance, dev.clone(), surface_loader, surface, extent)?;
        let surface_format = display.d_surface_format.format;

        let mut memory = MemoryBlocks::new(&dev)?;
        let registry = DescriptorLayoutRegistry::new(&dev)?;
        let passes = RenderPassGraph::new(&dev, surface_format)?;
        let targets = RenderTargets::new(&dev, &mut memory, extent, surface_format)?;
        let framebuffers =
            FramebufferSet::new(&dev, &passes, &targets, display.views(), extent)?;
        let pipelines = Pipelines::new(&dev, &registry, &passes, extent)?;

        let mut textures = TextureStore::new(&dev);

        // Environment map. A missing HDR gets the magenta fallback so
        // development machines without the asset pack still boot.
        let equirect = match textures.load_hdr(&dev, &mut memory, "../assets/environment.hdr") {
            Ok(tex) => tex,
            Err(_) => textures.load_image_or_fallback(
                &dev,
                &mut memory,
                "../assets/environment.hdr",
            ),
        };
        let baked = offline::bake_environment(&dev, &mut memory, &mut textures, &registry, equirect)?;

        let frames = FrameResources::new(&dev, &mut memory, &registry)?;
        let jobs = JobSystem::new(dev.clone(), dev.graphics_family);

        let font = match font::load("../assets/lucida_sans_sdf.fnt") {
            Ok(f) => Some(f),
            Err(e) => {
                log::error!("GUI font unavailable: {:?}", e);
                None
            }
        };

        // static geometry: the skybox cube lives in device local memory
        let cube_bytes = unsafe {
            std::slice::from_raw_parts(
                SKYBOX_CUBE.as_ptr() as *const u8,
                std::mem::size_of_val(&SKYBOX_CUBE),
            )
        };
        let skybox_verts = upload_device_local(&dev, &mut memory, cube_bytes)?;

        // engine wide descriptor sets
        let shadowmap_set = registry.allocate_set(&dev, LayoutTag::SingleTextureFrag)?;
        registry.write_images(
            &dev,
            shadowmap_set,
            0,
            targets.rt_shadow_sampler,
            &[targets.rt_shadow_array_view],
        );

        let skybox_set = registry.allocate_set(&dev, LayoutTag::SingleTextureFrag)?;
        registry.write_images(
            &dev,
            skybox_set,
            0,
            textures.ts_sampler,
            &[baked.be_environment.t_image_view],
        );

        let ibl_set = registry.allocate_set(&dev, LayoutTag::IblCubemapsAndBrdfLut)?;
        registry.write_images(
            &dev,
            ibl_set,
            0,
            textures.ts_sampler,
            &[
                baked.be_irradiance.t_image_view,
                baked.be_prefiltered.t_image_view,
            ],
        );
        registry.write_images(
            &dev,
            ibl_set,
            1,
            textures.ts_sampler,
            &[baked.be_brdf_lut.t_image_view],
        );

        log::info!(
            "Engine up: {}x{}, {} textures resident",
            extent.width,
            extent.height,
            textures.active_texture_count()
        );

        Ok(Self {
            e_dev: dev,
            e_display: display,
            e_memory: memory,
            e_registry: registry,
            e_passes: passes,
            e_targets: targets,
            e_framebuffers: framebuffers,
            e_pipelines: pipelines,
            e_textures: textures,
            e_baked: baked,
            e_frames: frames,
            e_jobs: jobs,
            e_deletion: DeletionQueue::new(),
            e_font: font,
            e_shadowmap_set: shadowmap_set,
            e_skybox_set: skybox_set,
            e_ibl_set: ibl_set,
            e_skybox_verts: skybox_verts,
            e_skybox_vert_count: SKYBOX_CUBE.len() as u32,
            e_frame_counter: 0,
            e_torn_down: false,
        })
    }

    pub fn resolution(&self) -> (u32, u32) {
        (
            self.e_display.d_resolution.width,
            self.e_display.d_resolution.height,
        )
    }

    pub fn frame_counter(&self) -> u64 {
        self.e_frame_counter
    }

    pub fn font(&self) -> Option<&SdfFont> {
        self.e_font.as_ref()
    }

    /// The image based lighting textures produced by the startup bakes.
    pub fn baked_environment(&self) -> &BakedEnvironment {
        &self.e_baked
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.e_dev
    }

    pub fn textures(&mut self) -> (&mut TextureStore, &mut MemoryBlocks, &Arc<Device>) {
        (&mut self.e_textures, &mut self.e_memory, &self.e_dev)
    }

    /// Copy static geometry into device local memory through staging.
    /// Returns the permanent range; device local data is never freed
    /// before teardown.
    pub fn upload_geometry(&mut self, data: &[u8]) -> Result<BlockRef> {
        upload_device_local(&self.e_dev, &mut self.e_memory, data)
    }

    /// Render one frame.
    ///
    /// The game layer has already run its update logic; `inputs` are
    /// the results, and `jobs` the render-phase recording jobs. An
    /// out-of-date swapchain is absorbed here by rebuilding the
    /// size-dependent state and skipping the frame.
    pub fn render_frame(&mut self, inputs: &FrameInputs, jobs: Vec<Job>) -> Result<()> {
        // 1. acquire
        let image_index = match self
            .e_display
            .acquire_next_image(self.e_frames.fr_image_available)
        {
            Ok(index) => index,
            Err(DerechoError::OUT_OF_DATE) => {
                let extent = self.e_display.d_resolution;
                self.rebuild_size_dependent(extent)?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // 2. backpressure: this slot's previous submission must retire
        self.e_frames.wait_and_reset_fence(&self.e_dev, image_index)?;

        // 3. worker pools for this slot become reusable
        self.e_jobs.reset_command_buffers(image_index as usize);

        // 4-5. serial host work: cascade math and the UBO slices
        let cascade_set = cascades::compute(
            &inputs.fi_projection,
            &inputs.fi_view,
            inputs.fi_light_direction,
        );

        let slot = &self.e_frames.fr_slots[image_index as usize];
        let ubo = slot.fs_ubo;

        let cascade_ubo = CascadeUbo::from_set(&cascade_set);
        self.e_memory
            .upload_slice(&self.e_dev, ubo.us_cascades, &[cascade_ubo]);

        let lights_ubo = convert_light_sources(&inputs.fi_lights);
        self.e_memory
            .upload_slice(&self.e_dev, ubo.us_lights, &[lights_ubo]);

        if !inputs.fi_skinning.is_empty() {
            let count = inputs.fi_skinning.len().min(MAX_SKINNING_JOINTS);
            self.e_memory
                .upload_slice(&self.e_dev, ubo.us_skinning, &inputs.fi_skinning[..count]);
        }

        let planes = cascades::frustum_planes(&(inputs.fi_projection * inputs.fi_view));
        self.e_memory
            .upload_slice(&self.e_dev, ubo.us_frustum, &planes);

        let line_count = inputs.fi_gui_lines.len().min(MAX_GUI_LINES * 2) as u32;
        if line_count > 0 {
            self.e_memory.upload_slice(
                &self.e_dev,
                ubo.us_gui_lines,
                &inputs.fi_gui_lines[..line_count as usize],
            );
        }

        // 6. render-phase jobs
        let ctx = Arc::new(self.build_frame_context(image_index, inputs, cascade_set, line_count));
        self.e_jobs.start(jobs, ctx.clone());
        self.e_jobs.wait_for_finish();
        let commands = self.e_jobs.sorted_results();

        // 7. primary command buffer assembly
        self.record_primary(image_index, &commands)?;

        // 8. submit, fenced on this slot
        self.submit(image_index)?;

        // 9. present
        match self
            .e_display
            .present(image_index, self.e_frames.fr_render_finished)
        {
            Ok(()) => {}
            Err(DerechoError::OUT_OF_DATE) => {
                let extent = self.e_display.d_resolution;
                self.rebuild_size_dependent(extent)?;
            }
            Err(e) => return Err(e),
        }

        // frame epilogue: advance the deferred destruction countdown
        self.e_frame_counter += 1;
        let due = self.e_deletion.tick();
        self.destroy_retired(due);

        Ok(())
    }

    fn build_frame_context(
        &self,
        image_index: u32,
        inputs: &FrameInputs,
        cascade_set: cascades::CascadeSet,
        line_count: u32,
    ) -> FrameContext {
        let slot = &self.e_frames.fr_slots[image_index as usize];
        let i = image_index as usize;

        let mut pipelines = [PipelinePair {
            p_pipeline: vk::Pipeline::null(),
            p_layout: vk::PipelineLayout::null(),
        }; EFFECT_COUNT];
        for effect in RenderEffect::ALL.iter() {
            pipelines[effect.index()] = self.e_pipelines.get(*effect);
        }

        FrameContext {
            fc_image_index: image_index,
            fc_extent: self.e_display.d_resolution,
            fc_time: inputs.fi_time,
            fc_projection: inputs.fi_projection,
            fc_view: inputs.fi_view,
            fc_camera_position: inputs.fi_camera_position,
            fc_cascades: cascade_set,
            fc_pass_shadowmap: self.e_passes.rp_shadowmap,
            fc_pass_skybox: self.e_passes.rp_skybox,
            fc_pass_color_depth: self.e_passes.rp_color_depth,
            fc_pass_gui: self.e_passes.rp_gui,
            fc_fb_shadowmap: self.e_framebuffers.fb_shadowmap,
            fc_fb_skybox: self.e_framebuffers.fb_skybox[i],
            fc_fb_color_depth: self.e_framebuffers.fb_color_depth[i],
            fc_fb_gui: self.e_framebuffers.fb_gui[i],
            fc_pipelines: pipelines,
            fc_shadow_set: slot.fs_shadow_set,
            fc_lights_set: slot.fs_lights_set,
            fc_skinning_set: slot.fs_skinning_set,
            fc_cascade_set: slot.fs_cascade_set,
            fc_frustum_set: slot.fs_frustum_set,
            fc_shadowmap_texture_set: self.e_shadowmap_set,
            fc_skybox_texture_set: self.e_skybox_set,
            fc_ibl_set: self.e_ibl_set,
            fc_lights_dynamic_offset: slot.fs_ubo.us_lights.offset as u32,
            fc_skinning_dynamic_offset: slot.fs_ubo.us_skinning.offset as u32,
            fc_device_local_buffer: self.e_memory.region(RegionKind::DeviceLocal).mr_buffer,
            fc_host_coherent_buffer: self.e_memory.region(RegionKind::HostCoherentMisc).mr_buffer,
            fc_gui_lines: slot.fs_ubo.us_gui_lines,
            fc_gui_line_count: line_count,
            fc_skybox_vertices: self.e_skybox_verts,
            fc_skybox_vertex_count: self.e_skybox_vert_count,
        }
    }

    /// Concatenate the sorted secondary command buffers into this
    /// slot's primary, pass by pass.
    fn record_primary(
        &mut self,
        image_index: u32,
        commands: &[crate::jobs::TaggedCbuf],
    ) -> Result<()> {
        let dev = &self.e_dev.dev;
        let i = image_index as usize;
        let cmd = self.e_frames.fr_slots[i].fs_primary_cbuf;
        let extent = self.e_display.d_resolution;

        let execute_rank = |cmd: vk::CommandBuffer, rank: u32| {
            let cbufs: Vec<vk::CommandBuffer> = commands
                .iter()
                .filter(|c| c.tc_rank == rank)
                .map(|c| c.tc_cbuf)
                .collect();
            if !cbufs.is_empty() {
                unsafe {
                    dev.cmd_execute_commands(cmd, &cbufs);
                }
            }
        };

        unsafe {
            dev.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .or(Err(DerechoError::VK_CALL_FAILED))?;
            let begin = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            dev.begin_command_buffer(cmd, &begin)
                .or(Err(DerechoError::VK_CALL_FAILED))?;

            // shadow mapping, once per cascade
            for cascade_idx in 0..SHADOWMAP_CASCADE_COUNT {
                let clear_values = passes::shadow_clear_values();
                let begin = vk::RenderPassBeginInfo::builder()
                    .render_pass(self.e_passes.rp_shadowmap)
                    .framebuffer(self.e_framebuffers.fb_shadowmap[cascade_idx])
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent: vk::Extent2D {
                            width: crate::SHADOWMAP_IMAGE_DIM,
                            height: crate::SHADOWMAP_IMAGE_DIM,
                        },
                    })
                    .clear_values(&clear_values);
                dev.cmd_begin_render_pass(
                    cmd,
                    &begin,
                    vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
                );
                execute_rank(cmd, PassTarget::Shadowmap(cascade_idx as u32).rank());
                dev.cmd_end_render_pass(cmd);
            }

            // skybox
            {
                let clear_values = passes::skybox_clear_values();
                let begin = vk::RenderPassBeginInfo::builder()
                    .render_pass(self.e_passes.rp_skybox)
                    .framebuffer(self.e_framebuffers.fb_skybox[i])
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent,
                    })
                    .clear_values(&clear_values);
                dev.cmd_begin_render_pass(
                    cmd,
                    &begin,
                    vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
                );
                execute_rank(cmd, PassTarget::Skybox.rank());
                dev.cmd_end_render_pass(cmd);
            }

            // color + depth
            {
                let clear_values = passes::scene_clear_values();
                let begin = vk::RenderPassBeginInfo::builder()
                    .render_pass(self.e_passes.rp_color_depth)
                    .framebuffer(self.e_framebuffers.fb_color_depth[i])
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent,
                    })
                    .clear_values(&clear_values);
                dev.cmd_begin_render_pass(
                    cmd,
                    &begin,
                    vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
                );
                execute_rank(cmd, PassTarget::ColorDepth.rank());
                dev.cmd_end_render_pass(cmd);
            }

            // gui
            {
                let clear_values = passes::gui_clear_values();
                let begin = vk::RenderPassBeginInfo::builder()
                    .render_pass(self.e_passes.rp_gui)
                    .framebuffer(self.e_framebuffers.fb_gui[i])
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent,
                    })
                    .clear_values(&clear_values);
                dev.cmd_begin_render_pass(
                    cmd,
                    &begin,
                    vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
                );
                execute_rank(cmd, PassTarget::Gui.rank());
                dev.cmd_end_render_pass(cmd);
            }

            // Flip the shadow image back for the next frame's shadow
            // pass. Unconditional: even a frame with no shadow casters
            // leaves the image in the layout the pass declares.
            let barrier = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::empty())
                .old_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .new_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(self.e_targets.rt_shadow_image)
                .subresource_range(
                    vk::ImageSubresourceRange::builder()
                        .aspect_mask(vk::ImageAspectFlags::DEPTH)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(SHADOWMAP_CASCADE_COUNT as u32)
                        .build(),
                )
                .build();
            dev.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );

            dev.end_command_buffer(cmd)
                .or(Err(DerechoError::VK_CALL_FAILED))?;
        }

        Ok(())
    }

    fn submit(&self, image_index: u32) -> Result<()> {
        let slot = &self.e_frames.fr_slots[image_index as usize];

        let wait_semas = [self.e_frames.fr_image_available];
        let wait_stages = [vk::PipelineStageFlags::BOTTOM_OF_PIPE];
        let cbufs = [slot.fs_primary_cbuf];
        let signal_semas = [self.e_frames.fr_render_finished];
        let submit = [vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semas)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&cbufs)
            .signal_semaphores(&signal_semas)
            .build()];

        unsafe {
            match self.e_dev.dev.queue_submit(
                self.e_dev.graphics_queue,
                &submit,
                slot.fs_fence,
            ) {
                Ok(()) => Ok(()),
                Err(vk::Result::ERROR_DEVICE_LOST) => Err(DerechoError::DEVICE_LOST),
                Err(_) => Err(DerechoError::VK_CALL_FAILED),
            }
        }
    }

    /// Switch to a new resolution from the supported list.
    ///
    /// Resizing to the current extent is a no-op. Otherwise the GPU is
    /// drained, the size-dependent resources torn down and rebuilt,
    /// and the affected pipelines scheduled for deferred rebuild.
    pub fn change_resolution(&mut self, width: u32, height: u32) -> Result<()> {
        if !crate::display::resolution_supported(width, height) {
            return Err(DerechoError::UNSUPPORTED_RESOLUTION);
        }

        let current = self.e_display.d_resolution;
        if current.width == width && current.height == height {
            return Ok(());
        }

        self.rebuild_size_dependent(vk::Extent2D { width, height })
    }

    fn rebuild_size_dependent(&mut self, extent: vk::Extent2D) -> Result<()> {
        log::info!(
            "Rebuilding size dependent resources at {}x{}",
            extent.width,
            extent.height
        );
        self.e_dev.wait_idle();

        unsafe {
            self.e_framebuffers.destroy(&self.e_dev);
        }
        self.e_display.recreate(extent)?;
        let surface_format = self.e_display.d_surface_format.format;
        self.e_targets
            .resize(&self.e_dev, &mut self.e_memory, extent, surface_format)?;
        self.e_framebuffers = FramebufferSet::new(
            &self.e_dev,
            &self.e_passes,
            &self.e_targets,
            self.e_display.views(),
            extent,
        )?;

        // pipelines with baked viewport state chase the new extent;
        // the old handles ride the deletion countdown out
        self.e_pipelines.rebuild_sized(
            &self.e_dev,
            &self.e_passes,
            extent,
            &mut self.e_deletion,
        )?;

        Ok(())
    }

    fn destroy_retired(&mut self, retired: Vec<RetiredResource>) {
        let dev = &self.e_dev.dev;
        for resource in retired {
            unsafe {
                match resource {
                    RetiredResource::Pipeline(p) => dev.destroy_pipeline(p, None),
                    RetiredResource::PipelineLayout(l) => dev.destroy_pipeline_layout(l, None),
                    RetiredResource::Buffer(b) => dev.destroy_buffer(b, None),
                    RetiredResource::Image(i) => dev.destroy_image(i, None),
                    RetiredResource::ImageView(v) => dev.destroy_image_view(v, None),
                    RetiredResource::MemoryBlock(block) => {
                        self.e_memory.release_ref(block);
                    }
                }
            }
        }
    }

    /// Tear everything down in reverse construction order. Also runs
    /// from Drop, but callable explicitly for a clean exit path.
    pub fn teardown(&mut self) {
        if self.e_torn_down {
            return;
        }
        self.e_torn_down = true;

        self.e_dev.wait_idle();

        unsafe {
            self.e_jobs.destroy();
        }

        let pending = self.e_deletion.drain_all();
        self.destroy_retired(pending);

        unsafe {
            self.e_frames.destroy(&self.e_dev);
            self.e_pipelines.destroy(&self.e_dev);
            self.e_framebuffers.destroy(&self.e_dev);
            self.e_targets.destroy(&self.e_dev, &mut self.e_memory);
            self.e_passes.destroy(&self.e_dev);
            self.e_textures.destroy(&self.e_dev);
            self.e_registry.destroy(&self.e_dev);
            self.e_memory.destroy(&self.e_dev);
            self.e_display.destroy();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Stage-and-copy into the append-only device local region.
fn upload_device_local(
    dev: &Device,
    memory: &mut MemoryBlocks,
    data: &[u8],
) -> Result<BlockRef> {
    let dst = memory.allocate(RegionKind::DeviceLocal, data.len() as u64);
    let staging = memory.allocate(RegionKind::HostVisibleStaging, data.len() as u64);
    memory.upload_slice(dev, staging.share(), data);

    let src_buffer = memory.region(RegionKind::HostVisibleStaging).mr_buffer;
    let dst_buffer = memory.region(RegionKind::DeviceLocal).mr_buffer;
    let copy = vk::BufferCopy {
        src_offset: staging.offset(),
        dst_offset: dst.offset(),
        size: data.len() as u64,
    };
    dev.execute_one_shot(|cbuf| unsafe {
        dev.dev.cmd_copy_buffer(cbuf, src_buffer, dst_buffer, &[copy]);
    })?;

    memory.release(staging);

    let r = dst.share();
    std::mem::forget(dst);
    Ok(r)
}
