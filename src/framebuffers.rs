// Render targets and framebuffers
//
// The size-dependent attachment images (scene depth, the MSAA color
// target when enabled) live here together with the fixed-size shadow
// map array. FramebufferSet pairs them with the swapchain image views
// into one framebuffer per (render pass x swapchain image), plus one
// shadow framebuffer per cascade layer.
use ash::vk;

use crate::device::Device;
use crate::memory::{MemoryBlocks, OwnedBlock};
use crate::passes::{RenderPassGraph, DEPTH_FORMAT, SHADOWMAP_FORMAT};
use crate::{
    DerechoError, Result, MSAA_SAMPLE_COUNT, SHADOWMAP_CASCADE_COUNT, SHADOWMAP_IMAGE_DIM,
    SWAPCHAIN_IMAGES_COUNT,
};

fn create_target_image(
    dev: &Device,
    pool: &mut MemoryBlocks,
    extent: vk::Extent2D,
    format: vk::Format,
    samples: vk::SampleCountFlags,
    usage: vk::ImageUsageFlags,
    layers: u32,
) -> Result<(vk::Image, OwnedBlock)> {
    let info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(layers)
        .samples(samples)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let image = unsafe {
        dev.dev
            .create_image(&info, None)
            .or(Err(DerechoError::VK_CALL_FAILED))?
    };

    let block = pool.bind_image(dev, image)?;
    Ok((image, block))
}

fn create_view(
    dev: &Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    view_type: vk::ImageViewType,
    base_layer: u32,
    layer_count: u32,
) -> Result<vk::ImageView> {
    let info = vk::ImageViewCreateInfo::builder()
        .view_type(view_type)
        .format(format)
        .subresource_range(
            vk::ImageSubresourceRange::builder()
                .aspect_mask(aspect)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(base_layer)
                .layer_count(layer_count)
                .build(),
        )
        .image(image);

    unsafe {
        dev.dev
            .create_image_view(&info, None)
            .or(Err(DerechoError::VK_CALL_FAILED))
    }
}

/// The non-swapchain attachment images.
pub struct RenderTargets {
    /// scene depth, at the MSAA sample count
    pub rt_depth_image: vk::Image,
    pub rt_depth_view: vk::ImageView,
    rt_depth_block: Option<OwnedBlock>,

    /// multisampled color target; only lives when the msaa feature is on
    pub rt_msaa_image: vk::Image,
    pub rt_msaa_view: vk::ImageView,
    rt_msaa_block: Option<OwnedBlock>,

    /// the cascade array shadow map, fixed SHADOWMAP_IMAGE_DIM square
    pub rt_shadow_image: vk::Image,
    /// array view used for sampling in the scene pass
    pub rt_shadow_array_view: vk::ImageView,
    /// one single-layer view per cascade for the shadow framebuffers
    pub rt_shadow_cascade_views: [vk::ImageView; SHADOWMAP_CASCADE_COUNT],
    rt_shadow_block: Option<OwnedBlock>,
    pub rt_shadow_sampler: vk::Sampler,
}

impl RenderTargets {
    pub fn new(
        dev: &Device,
        pool: &mut MemoryBlocks,
        extent: vk::Extent2D,
        surface_format: vk::Format,
    ) -> Result<Self> {
        let shadow_extent = vk::Extent2D {
            width: SHADOWMAP_IMAGE_DIM,
            height: SHADOWMAP_IMAGE_DIM,
        };
        let (shadow_image, shadow_block) = create_target_image(
            dev,
            pool,
            shadow_extent,
            SHADOWMAP_FORMAT,
            vk::SampleCountFlags::TYPE_1,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            SHADOWMAP_CASCADE_COUNT as u32,
        )?;
        let shadow_array_view = create_view(
            dev,
            shadow_image,
            SHADOWMAP_FORMAT,
            vk::ImageAspectFlags::DEPTH,
            vk::ImageViewType::TYPE_2D_ARRAY,
            0,
            SHADOWMAP_CASCADE_COUNT as u32,
        )?;
        let mut cascade_views = [vk::ImageView::null(); SHADOWMAP_CASCADE_COUNT];
        for (i, view) in cascade_views.iter_mut().enumerate() {
            *view = create_view(
                dev,
                shadow_image,
                SHADOWMAP_FORMAT,
                vk::ImageAspectFlags::DEPTH,
                vk::ImageViewType::TYPE_2D,
                i as u32,
                1,
            )?;
        }

        let mut ret = Self {
            rt_depth_image: vk::Image::null(),
            rt_depth_view: vk::ImageView::null(),
            rt_depth_block: None,
            rt_msaa_image: vk::Image::null(),
            rt_msaa_view: vk::ImageView::null(),
            rt_msaa_block: None,
            rt_shadow_image: shadow_image,
            rt_shadow_array_view: shadow_array_view,
            rt_shadow_cascade_views: cascade_views,
            rt_shadow_block: Some(shadow_block),
            rt_shadow_sampler: dev.create_shadowmap_sampler(),
        };
        ret.create_sized_targets(dev, pool, extent, surface_format)?;

        // The shadow map begins life in the layout the first shadow
        // pass expects; the depth target likewise. The MSAA color
        // image's first pass loads DONT_CARE from UNDEFINED, which
        // needs no priming.
        dev.execute_one_shot(|cbuf| unsafe {
            dev.transition_image_layout(
                cbuf,
                ret.rt_shadow_image,
                vk::ImageAspectFlags::DEPTH,
                SHADOWMAP_CASCADE_COUNT as u32,
                1,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            );
            dev.transition_image_layout(
                cbuf,
                ret.rt_depth_image,
                vk::ImageAspectFlags::DEPTH,
                1,
                1,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            );
        })?;

        Ok(ret)
    }

    /// (Re)create the images whose size tracks the surface extent.
    fn create_sized_targets(
        &mut self,
        dev: &Device,
        pool: &mut MemoryBlocks,
        extent: vk::Extent2D,
        surface_format: vk::Format,
    ) -> Result<()> {
        let (depth_image, depth_block) = create_target_image(
            dev,
            pool,
            extent,
            DEPTH_FORMAT,
            MSAA_SAMPLE_COUNT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            1,
        )?;
        self.rt_depth_image = depth_image;
        self.rt_depth_view = create_view(
            dev,
            depth_image,
            DEPTH_FORMAT,
            vk::ImageAspectFlags::DEPTH,
            vk::ImageViewType::TYPE_2D,
            0,
            1,
        )?;
        self.rt_depth_block = Some(depth_block);

        if cfg!(feature = "msaa") {
            let (msaa_image, msaa_block) = create_target_image(
                dev,
                pool,
                extent,
                surface_format,
                MSAA_SAMPLE_COUNT,
                vk::ImageUsageFlags::COLOR_ATTACHMENT,
                1,
            )?;
            self.rt_msaa_image = msaa_image;
            self.rt_msaa_view = create_view(
                dev,
                msaa_image,
                surface_format,
                vk::ImageAspectFlags::COLOR,
                vk::ImageViewType::TYPE_2D,
                0,
                1,
            )?;
            self.rt_msaa_block = Some(msaa_block);
        }

        Ok(())
    }

    /// Tear down the size-dependent images. Shadow map stays.
    pub unsafe fn destroy_sized_targets(&mut self, dev: &Device, pool: &mut MemoryBlocks) {
        if self.rt_depth_image != vk::Image::null() {
            dev.dev.destroy_image_view(self.rt_depth_view, None);
            dev.dev.destroy_image(self.rt_depth_image, None);
            self.rt_depth_image = vk::Image::null();
        }
        if let Some(block) = self.rt_depth_block.take() {
            pool.release(block);
        }

        if self.rt_msaa_image != vk::Image::null() {
            dev.dev.destroy_image_view(self.rt_msaa_view, None);
            dev.dev.destroy_image(self.rt_msaa_image, None);
            self.rt_msaa_image = vk::Image::null();
        }
        if let Some(block) = self.rt_msaa_block.take() {
            pool.release(block);
        }
    }

    /// Rebuild for a new extent. Called by the resize path with an
    /// idle device.
    pub fn resize(
        &mut self,
        dev: &Device,
        pool: &mut MemoryBlocks,
        extent: vk::Extent2D,
        surface_format: vk::Format,
    ) -> Result<()> {
        unsafe {
            self.destroy_sized_targets(dev, pool);
        }
        self.create_sized_targets(dev, pool, extent, surface_format)?;

        dev.execute_one_shot(|cbuf| unsafe {
            dev.transition_image_layout(
                cbuf,
                self.rt_depth_image,
                vk::ImageAspectFlags::DEPTH,
                1,
                1,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            );
        })
    }

    pub unsafe fn destroy(&mut self, dev: &Device, pool: &mut MemoryBlocks) {
        self.destroy_sized_targets(dev, pool);

        for view in self.rt_shadow_cascade_views.iter() {
            dev.dev.destroy_image_view(*view, None);
        }
        dev.dev.destroy_image_view(self.rt_shadow_array_view, None);
        dev.dev.destroy_image(self.rt_shadow_image, None);
        if let Some(block) = self.rt_shadow_block.take() {
            pool.release(block);
        }
        dev.dev.destroy_sampler(self.rt_shadow_sampler, None);
    }
}

/// One framebuffer per (render pass x swapchain image), plus the
/// per-cascade shadow framebuffers.
pub struct FramebufferSet {
    pub fb_shadowmap: [vk::Framebuffer; SHADOWMAP_CASCADE_COUNT],
    pub fb_skybox: [vk::Framebuffer; SWAPCHAIN_IMAGES_COUNT],
    pub fb_color_depth: [vk::Framebuffer; SWAPCHAIN_IMAGES_COUNT],
    pub fb_gui: [vk::Framebuffer; SWAPCHAIN_IMAGES_COUNT],
    pub fb_extent: vk::Extent2D,
}

impl FramebufferSet {
    pub fn new(
        dev: &Device,
        passes: &RenderPassGraph,
        targets: &RenderTargets,
        swapchain_views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Self> {
        assert_eq!(swapchain_views.len(), SWAPCHAIN_IMAGES_COUNT);

        let mut shadow = [vk::Framebuffer::null(); SHADOWMAP_CASCADE_COUNT];
        for (i, fb) in shadow.iter_mut().enumerate() {
            *fb = Self::create_framebuffer(
                dev,
                passes.rp_shadowmap,
                &[targets.rt_shadow_cascade_views[i]],
                vk::Extent2D {
                    width: SHADOWMAP_IMAGE_DIM,
                    height: SHADOWMAP_IMAGE_DIM,
                },
            )?;
        }

        let mut skybox = [vk::Framebuffer::null(); SWAPCHAIN_IMAGES_COUNT];
        let mut color_depth = [vk::Framebuffer::null(); SWAPCHAIN_IMAGES_COUNT];
        let mut gui = [vk::Framebuffer::null(); SWAPCHAIN_IMAGES_COUNT];
        for i in 0..SWAPCHAIN_IMAGES_COUNT {
            let view = swapchain_views[i];
            skybox[i] = Self::create_framebuffer(
                dev,
                passes.rp_skybox,
                &Self::skybox_attachments(view, targets),
                extent,
            )?;
            color_depth[i] = Self::create_framebuffer(
                dev,
                passes.rp_color_depth,
                &Self::color_depth_attachments(view, targets),
                extent,
            )?;
            gui[i] = Self::create_framebuffer(
                dev,
                passes.rp_gui,
                &Self::gui_attachments(view, targets),
                extent,
            )?;
        }

        Ok(Self {
            fb_shadowmap: shadow,
            fb_skybox: skybox,
            fb_color_depth: color_depth,
            fb_gui: gui,
            fb_extent: extent,
        })
    }

    // Attachment lists mirror the pass descriptions in passes.rs: the
    // resolve destination is attachment 0, MSAA targets come after.

    #[cfg(feature = "msaa")]
    fn skybox_attachments(view: vk::ImageView, targets: &RenderTargets) -> Vec<vk::ImageView> {
        vec![view, targets.rt_msaa_view]
    }

    #[cfg(not(feature = "msaa"))]
    fn skybox_attachments(view: vk::ImageView, _targets: &RenderTargets) -> Vec<vk::ImageView> {
        vec![view]
    }

    #[cfg(feature = "msaa")]
    fn color_depth_attachments(view: vk::ImageView, targets: &RenderTargets) -> Vec<vk::ImageView> {
        vec![view, targets.rt_depth_view, targets.rt_msaa_view]
    }

    #[cfg(not(feature = "msaa"))]
    fn color_depth_attachments(view: vk::ImageView, targets: &RenderTargets) -> Vec<vk::ImageView> {
        vec![view, targets.rt_depth_view]
    }

    #[cfg(feature = "msaa")]
    fn gui_attachments(view: vk::ImageView, targets: &RenderTargets) -> Vec<vk::ImageView> {
        vec![view, targets.rt_msaa_view]
    }

    #[cfg(not(feature = "msaa"))]
    fn gui_attachments(view: vk::ImageView, _targets: &RenderTargets) -> Vec<vk::ImageView> {
        vec![view]
    }

    fn create_framebuffer(
        dev: &Device,
        pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        unsafe {
            dev.dev
                .create_framebuffer(&info, None)
                .or(Err(DerechoError::VK_CALL_FAILED))
        }
    }

    pub unsafe fn destroy(&mut self, dev: &Device) {
        for fb in self
            .fb_shadowmap
            .iter()
            .chain(self.fb_skybox.iter())
            .chain(self.fb_color_depth.iter())
            .chain(self.fb_gui.iter())
        {
            dev.dev.destroy_framebuffer(*fb, None);
        }
    }
}
