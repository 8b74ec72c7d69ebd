// Per-frame resources and the data contract between the engine, the
// job system and the game layer
//
// Each swapchain image owns a frame slot: a primary command buffer, a
// submission fence, and disjoint UBO/vertex slices for everything the
// host rewrites per frame. Workers recording frame F never touch the
// slices of frame F±1; the fence wait at the top of the frame loop is
// what makes the reuse safe.
use ash::vk;
use cgmath::{Matrix4, Vector3};

use crate::cascades::CascadeSet;
use crate::descriptors::{DescriptorLayoutRegistry, LayoutTag};
use crate::device::Device;
use crate::jobs::PassTarget;
use crate::lights::{LightSource, LightSourcesUbo};
use crate::memory::{slot_ranges, BlockRef, MemoryBlocks, RegionKind};
use crate::pipelines::{PipelinePair, RenderEffect, EFFECT_COUNT};
use crate::{
    DerechoError, Result, SHADOWMAP_CASCADE_COUNT, SWAPCHAIN_IMAGES_COUNT,
};

/// Longest skinning matrix array one animated model may upload.
pub const MAX_SKINNING_JOINTS: usize = 64;

/// GUI line budget per frame (endpoint pairs).
pub const MAX_GUI_LINES: usize = 400;

pub const IMGUI_VERTEX_BUFFER_CAPACITY_BYTES: u64 = 200 * 1024;
pub const IMGUI_INDEX_BUFFER_CAPACITY_BYTES: u64 = 160 * 1024;

/// The cascade uniform block: view-proj per cascade followed by the
/// split depths, padded out to vec4 stride for std140.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct CascadeUbo {
    pub cu_view_proj: [Matrix4<f32>; SHADOWMAP_CASCADE_COUNT],
    pub cu_split_depths: [[f32; 4]; SHADOWMAP_CASCADE_COUNT],
}

impl CascadeUbo {
    pub fn from_set(set: &CascadeSet) -> Self {
        let mut splits = [[0.0; 4]; SHADOWMAP_CASCADE_COUNT];
        for (i, d) in set.cs_split_depths.iter().enumerate() {
            splits[i][0] = *d;
        }
        Self {
            cu_view_proj: set.cs_view_proj,
            cu_split_depths: splits,
        }
    }
}

/// The per-slot host visible slices.
#[derive(Debug, Copy, Clone)]
pub struct UboSlices {
    /// HostCoherentUbo
    pub us_cascades: BlockRef,
    pub us_lights: BlockRef,
    pub us_skinning: BlockRef,
    pub us_frustum: BlockRef,
    /// HostCoherentMisc (dynamic vertex data)
    pub us_gui_lines: BlockRef,
    pub us_imgui_vertices: BlockRef,
    pub us_imgui_indices: BlockRef,
}

/// One frame slot, indexed by swapchain image index.
pub struct FrameSlot {
    pub fs_primary_cbuf: vk::CommandBuffer,
    /// signaled when this slot's last submission fully retired
    pub fs_fence: vk::Fence,
    pub fs_ubo: UboSlices,

    // descriptor sets pointing into this slot's slices
    pub fs_shadow_set: vk::DescriptorSet,
    pub fs_lights_set: vk::DescriptorSet,
    pub fs_skinning_set: vk::DescriptorSet,
    pub fs_cascade_set: vk::DescriptorSet,
    pub fs_frustum_set: vk::DescriptorSet,
}

/// All frame slots plus the frame-pacing synchronization objects.
pub struct FrameResources {
    pub fr_slots: Vec<FrameSlot>,
    fr_cmd_pool: vk::CommandPool,
    /// signaled by acquire, consumed by the submit
    pub fr_image_available: vk::Semaphore,
    /// signaled by the submit, consumed by present
    pub fr_render_finished: vk::Semaphore,
}

impl FrameResources {
    pub fn new(
        dev: &Device,
        pool: &mut MemoryBlocks,
        registry: &DescriptorLayoutRegistry,
    ) -> Result<Self> {
        let cmd_pool = dev.create_command_pool(dev.graphics_family);
        let cbufs = dev.create_command_buffers(cmd_pool, SWAPCHAIN_IMAGES_COUNT as u32);

        // one ranged allocation per concern keeps every slot's slice
        // disjoint and identically sized
        let cascades = slot_ranges(pool, std::mem::size_of::<CascadeUbo>() as u64);
        let lights = slot_ranges(pool, std::mem::size_of::<LightSourcesUbo>() as u64);
        let skinning = slot_ranges(
            pool,
            (MAX_SKINNING_JOINTS * std::mem::size_of::<Matrix4<f32>>()) as u64,
        );
        let frustum = slot_ranges(pool, (6 * 4 * std::mem::size_of::<f32>()) as u64);

        let line_bytes = (MAX_GUI_LINES * 2 * 2 * std::mem::size_of::<f32>()) as u64;
        let gui_lines: Vec<BlockRef> = (0..SWAPCHAIN_IMAGES_COUNT)
            .map(|_| {
                let b = pool.allocate(RegionKind::HostCoherentMisc, line_bytes);
                let r = b.share();
                std::mem::forget(b);
                r
            })
            .collect();
        let imgui_vtx: Vec<BlockRef> = (0..SWAPCHAIN_IMAGES_COUNT)
            .map(|_| {
                let b = pool.allocate(
                    RegionKind::HostCoherentMisc,
                    IMGUI_VERTEX_BUFFER_CAPACITY_BYTES,
                );
                let r = b.share();
                std::mem::forget(b);
                r
            })
            .collect();
        let imgui_idx: Vec<BlockRef> = (0..SWAPCHAIN_IMAGES_COUNT)
            .map(|_| {
                let b = pool.allocate(
                    RegionKind::HostCoherentMisc,
                    IMGUI_INDEX_BUFFER_CAPACITY_BYTES,
                );
                let r = b.share();
                std::mem::forget(b);
                r
            })
            .collect();

        let ubo_buffer = pool.region(RegionKind::HostCoherentUbo).mr_buffer;

        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        let sema_info = vk::SemaphoreCreateInfo::default();

        let mut slots = Vec::with_capacity(SWAPCHAIN_IMAGES_COUNT);
        for i in 0..SWAPCHAIN_IMAGES_COUNT {
            let ubo = UboSlices {
                us_cascades: cascades[i],
                us_lights: lights[i],
                us_skinning: skinning[i],
                us_frustum: frustum[i],
                us_gui_lines: gui_lines[i],
                us_imgui_vertices: imgui_vtx[i],
                us_imgui_indices: imgui_idx[i],
            };

            // static UBO sets bind their slice directly; the dynamic
            // ones bind the buffer at offset zero and take the slice
            // offset at bind time
            let shadow_set = registry.allocate_set(dev, LayoutTag::ShadowPass)?;
            registry.write_buffer(
                dev,
                shadow_set,
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                ubo_buffer,
                ubo.us_cascades.offset,
                ubo.us_cascades.size,
            );

            let cascade_set = registry.allocate_set(dev, LayoutTag::CascadeMatricesFrag)?;
            registry.write_buffer(
                dev,
                cascade_set,
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                ubo_buffer,
                ubo.us_cascades.offset,
                ubo.us_cascades.size,
            );

            let frustum_set = registry.allocate_set(dev, LayoutTag::FrustumPlanes)?;
            registry.write_buffer(
                dev,
                frustum_set,
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                ubo_buffer,
                ubo.us_frustum.offset,
                ubo.us_frustum.size,
            );

            let lights_set = registry.allocate_set(dev, LayoutTag::DynamicLights)?;
            registry.write_buffer(
                dev,
                lights_set,
                0,
                vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                ubo_buffer,
                0,
                ubo.us_lights.size,
            );

            let skinning_set = registry.allocate_set(dev, LayoutTag::SkinningMatrices)?;
            registry.write_buffer(
                dev,
                skinning_set,
                0,
                vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                ubo_buffer,
                0,
                ubo.us_skinning.size,
            );

            slots.push(FrameSlot {
                fs_primary_cbuf: cbufs[i],
                fs_fence: unsafe {
                    dev.dev
                        .create_fence(&fence_info, None)
                        .or(Err(DerechoError::VK_CALL_FAILED))?
                },
                fs_ubo: ubo,
                fs_shadow_set: shadow_set,
                fs_lights_set: lights_set,
                fs_skinning_set: skinning_set,
                fs_cascade_set: cascade_set,
                fs_frustum_set: frustum_set,
            });
        }

        Ok(Self {
            fr_slots: slots,
            fr_cmd_pool: cmd_pool,
            fr_image_available: unsafe {
                dev.dev
                    .create_semaphore(&sema_info, None)
                    .or(Err(DerechoError::VK_CALL_FAILED))?
            },
            fr_render_finished: unsafe {
                dev.dev
                    .create_semaphore(&sema_info, None)
                    .or(Err(DerechoError::VK_CALL_FAILED))?
            },
        })
    }

    /// Block until `image_index`'s previous submission retired, then
    /// make the fence reusable. This is the frame loop's backpressure:
    /// it stalls when the GPU is SWAPCHAIN_IMAGES_COUNT frames behind.
    pub fn wait_and_reset_fence(&self, dev: &Device, image_index: u32) -> Result<()> {
        let fence = self.fr_slots[image_index as usize].fs_fence;
        unsafe {
            match dev.dev.wait_for_fences(&[fence], true, u64::MAX) {
                Ok(()) => {}
                Err(vk::Result::ERROR_DEVICE_LOST) => return Err(DerechoError::DEVICE_LOST),
                Err(_) => return Err(DerechoError::VK_CALL_FAILED),
            }
            dev.dev
                .reset_fences(&[fence])
                .or(Err(DerechoError::VK_CALL_FAILED))?;
        }
        Ok(())
    }

    pub unsafe fn destroy(&mut self, dev: &Device) {
        for slot in self.fr_slots.drain(..) {
            dev.dev.destroy_fence(slot.fs_fence, None);
        }
        dev.dev.destroy_semaphore(self.fr_image_available, None);
        dev.dev.destroy_semaphore(self.fr_render_finished, None);
        dev.dev.destroy_command_pool(self.fr_cmd_pool, None);
    }
}

/// Everything the game layer feeds the engine for one frame.
pub struct FrameInputs {
    pub fi_projection: Matrix4<f32>,
    pub fi_view: Matrix4<f32>,
    pub fi_camera_position: [f32; 3],
    /// unit vector from the light toward the scene
    pub fi_light_direction: Vector3<f32>,
    pub fi_lights: Vec<LightSource>,
    /// joint matrices for the animated models, at most
    /// MAX_SKINNING_JOINTS
    pub fi_skinning: Vec<Matrix4<f32>>,
    /// GUI line endpoints, pairs of 2D points
    pub fi_gui_lines: Vec<[f32; 2]>,
    pub fi_time: f32,
}

/// The read-only snapshot handed to every render job.
///
/// Only plain handles and matrices live in here, so the whole thing is
/// assembled fresh each frame after the serial upload step and shared
/// behind an Arc. No job mutates it.
pub struct FrameContext {
    pub fc_image_index: u32,
    pub fc_extent: vk::Extent2D,
    pub fc_time: f32,

    pub fc_projection: Matrix4<f32>,
    pub fc_view: Matrix4<f32>,
    pub fc_camera_position: [f32; 3],
    pub fc_cascades: CascadeSet,

    pub fc_pass_shadowmap: vk::RenderPass,
    pub fc_pass_skybox: vk::RenderPass,
    pub fc_pass_color_depth: vk::RenderPass,
    pub fc_pass_gui: vk::RenderPass,

    pub fc_fb_shadowmap: [vk::Framebuffer; SHADOWMAP_CASCADE_COUNT],
    pub fc_fb_skybox: vk::Framebuffer,
    pub fc_fb_color_depth: vk::Framebuffer,
    pub fc_fb_gui: vk::Framebuffer,

    pub fc_pipelines: [PipelinePair; EFFECT_COUNT],

    pub fc_shadow_set: vk::DescriptorSet,
    pub fc_lights_set: vk::DescriptorSet,
    pub fc_skinning_set: vk::DescriptorSet,
    pub fc_cascade_set: vk::DescriptorSet,
    pub fc_frustum_set: vk::DescriptorSet,
    /// shadow map array view for the scene pass
    pub fc_shadowmap_texture_set: vk::DescriptorSet,
    /// environment cubemap for the skybox pass
    pub fc_skybox_texture_set: vk::DescriptorSet,
    /// irradiance/prefiltered/brdf-lut bundle for the pbr shaders
    pub fc_ibl_set: vk::DescriptorSet,
    pub fc_lights_dynamic_offset: u32,
    pub fc_skinning_dynamic_offset: u32,

    pub fc_device_local_buffer: vk::Buffer,
    pub fc_host_coherent_buffer: vk::Buffer,
    pub fc_gui_lines: BlockRef,
    pub fc_gui_line_count: u32,
    pub fc_skybox_vertices: BlockRef,
    pub fc_skybox_vertex_count: u32,
}

impl FrameContext {
    /// Resolve a job target to the pass and framebuffer its secondary
    /// command buffer inherits.
    pub fn pass_binding(&self, target: PassTarget) -> (vk::RenderPass, vk::Framebuffer) {
        match target {
            PassTarget::Shadowmap(cascade) => (
                self.fc_pass_shadowmap,
                self.fc_fb_shadowmap[cascade as usize],
            ),
            PassTarget::Skybox => (self.fc_pass_skybox, self.fc_fb_skybox),
            PassTarget::ColorDepth => (self.fc_pass_color_depth, self.fc_fb_color_depth),
            PassTarget::Gui => (self.fc_pass_gui, self.fc_fb_gui),
        }
    }

    pub fn pipeline(&self, effect: RenderEffect) -> PipelinePair {
        self.fc_pipelines[effect.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{round_up_to, BumpAllocator};

    fn overlap(a: (u64, u64), b: (u64, u64)) -> bool {
        a.0 < b.0 + b.1 && b.0 < a.0 + a.1
    }

    #[test]
    fn slot_slices_never_overlap_between_frames() {
        // model the ranged allocation the UBO slices use: equal sizes,
        // aligned, carved sequentially from one region
        let align = 256u64;
        let mut bump = BumpAllocator::new(1 << 20);

        let concerns = [
            std::mem::size_of::<CascadeUbo>() as u64,
            std::mem::size_of::<LightSourcesUbo>() as u64,
            (MAX_SKINNING_JOINTS * 64) as u64,
            6 * 16u64,
        ];

        let mut all_ranges: Vec<(u64, u64)> = Vec::new();
        for size in concerns.iter() {
            let rounded = round_up_to(*size, align);
            for _slot in 0..SWAPCHAIN_IMAGES_COUNT {
                let off = bump.allocate(rounded).unwrap();
                all_ranges.push((off, rounded));
            }
        }

        for (i, a) in all_ranges.iter().enumerate() {
            assert_eq!(a.0 % align, 0);
            for b in all_ranges[i + 1..].iter() {
                assert!(!overlap(*a, *b), "slices {:?} and {:?} overlap", a, b);
            }
        }
    }

    #[test]
    fn cascade_ubo_places_splits_after_matrices() {
        assert_eq!(
            std::mem::size_of::<CascadeUbo>(),
            SHADOWMAP_CASCADE_COUNT * 64 + SHADOWMAP_CASCADE_COUNT * 16
        );

        let mut set = CascadeSet::identity();
        set.cs_split_depths = [1.0, 2.0, 3.0, 4.0];
        let ubo = CascadeUbo::from_set(&set);
        assert_eq!(ubo.cu_split_depths[2][0], 3.0);
        assert_eq!(ubo.cu_split_depths[2][1], 0.0);
    }
}
