// The Display: surface, swapchain and resize plumbing
//
// The swapchain is generated (and regenerated) from the surface the
// window system handed us. Resize requests outside the supported
// resolution list are refused before any GPU work happens.
use ash::extensions::khr;
use ash::vk;

use std::sync::Arc;

use crate::device::Device;
use crate::instance::Instance;
use crate::{DerechoError, Result, SUPPORTED_RESOLUTIONS, SWAPCHAIN_IMAGES_COUNT};

pub struct Display {
    d_dev: Arc<Device>,
    /// the actual surface (KHR extension)
    pub d_surface: vk::SurfaceKHR,
    /// function pointer loaders
    pub d_surface_loader: khr::Surface,
    pub(crate) d_swapchain_loader: khr::Swapchain,
    pub(crate) d_swapchain: vk::SwapchainKHR,

    /// a set of images belonging to swapchain
    pub(crate) d_images: Vec<vk::Image>,
    /// views describing how to access the images
    pub(crate) d_views: Vec<vk::ImageView>,

    /// Current resolution of this output
    pub d_resolution: vk::Extent2D,
    pub d_surface_format: vk::SurfaceFormatKHR,
    pub d_present_mode: vk::PresentModeKHR,
}

impl Display {
    pub fn new(
        instance: &Instance,
        dev: Arc<Device>,
        surface_loader: khr::Surface,
        surface: vk::SurfaceKHR,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        if !resolution_supported(extent.width, extent.height) {
            return Err(DerechoError::UNSUPPORTED_RESOLUTION);
        }

        let surface_format = Self::select_surface_format(&surface_loader, dev.pdev, surface)?;
        let present_mode = Self::select_present_mode(&surface_loader, dev.pdev, surface)?;
        let swapchain_loader = khr::Swapchain::new(&instance.inst, &dev.dev);

        let mut ret = Self {
            d_dev: dev,
            d_surface: surface,
            d_surface_loader: surface_loader,
            d_swapchain_loader: swapchain_loader,
            d_swapchain: vk::SwapchainKHR::null(),
            d_images: Vec::new(),
            d_views: Vec::new(),
            d_resolution: extent,
            d_surface_format: surface_format,
            d_present_mode: present_mode,
        };
        ret.create_swapchain(extent)?;

        Ok(ret)
    }

    fn select_surface_format(
        surface_loader: &khr::Surface,
        pdev: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceFormatKHR> {
        let formats = unsafe {
            surface_loader
                .get_physical_device_surface_formats(pdev, surface)
                .or(Err(DerechoError::SURFACE_CREATION_FAILED))?
        };

        formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_UNORM
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .copied()
            .ok_or(DerechoError::SURFACE_CREATION_FAILED)
    }

    fn select_present_mode(
        surface_loader: &khr::Surface,
        pdev: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::PresentModeKHR> {
        let modes = unsafe {
            surface_loader
                .get_physical_device_surface_present_modes(pdev, surface)
                .or(Err(DerechoError::SURFACE_CREATION_FAILED))?
        };

        // FIFO is always available; prefer MAILBOX when the driver has it
        Ok(modes
            .iter()
            .find(|&&m| m == vk::PresentModeKHR::MAILBOX)
            .copied()
            .unwrap_or(vk::PresentModeKHR::FIFO))
    }

    /// create a new vkSwapchain for `extent`
    ///
    /// Swapchains contain images that can be used for WSI presentation.
    /// We ask for exactly SWAPCHAIN_IMAGES_COUNT images since every
    /// per-frame resource in the engine is sized by that constant; a
    /// driver refusing that count is unsupported.
    fn create_swapchain(&mut self, extent: vk::Extent2D) -> Result<()> {
        let caps = unsafe {
            self.d_surface_loader
                .get_physical_device_surface_capabilities(self.d_dev.pdev, self.d_surface)
                .or(Err(DerechoError::COULD_NOT_CREATE_SWAPCHAIN))?
        };

        let count = (SWAPCHAIN_IMAGES_COUNT as u32).max(caps.min_image_count);
        if caps.max_image_count > 0 && count > caps.max_image_count {
            return Err(DerechoError::COULD_NOT_CREATE_SWAPCHAIN);
        }

        let transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let old_swapchain = self.d_swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.d_surface)
            .min_image_count(count)
            .image_color_space(self.d_surface_format.color_space)
            .image_format(self.d_surface_format.format)
            .image_extent(extent)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.d_present_mode)
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe {
            self.d_swapchain_loader
                .create_swapchain(&create_info, None)
                .or(Err(DerechoError::COULD_NOT_CREATE_SWAPCHAIN))?
        };

        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe {
                self.d_swapchain_loader.destroy_swapchain(old_swapchain, None);
            }
        }

        self.d_swapchain = swapchain;
        self.d_resolution = extent;
        self.select_images_and_views()?;

        // The engine's frame slots, framebuffers and deletion countdown
        // are all sized by this constant.
        if self.d_images.len() != SWAPCHAIN_IMAGES_COUNT {
            return Err(DerechoError::COULD_NOT_CREATE_SWAPCHAIN);
        }

        Ok(())
    }

    /// Get the vkImages for the swapchain, and create vkImageViews for
    /// them.
    fn select_images_and_views(&mut self) -> Result<()> {
        let images = unsafe {
            self.d_swapchain_loader
                .get_swapchain_images(self.d_swapchain)
                .or(Err(DerechoError::COULD_NOT_CREATE_SWAPCHAIN))?
        };

        let mut views = Vec::with_capacity(images.len());
        for image in images.iter() {
            let create_info = vk::ImageViewCreateInfo::builder()
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.d_surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::R,
                    g: vk::ComponentSwizzle::G,
                    b: vk::ComponentSwizzle::B,
                    a: vk::ComponentSwizzle::A,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image(*image);

            views.push(unsafe {
                self.d_dev
                    .dev
                    .create_image_view(&create_info, None)
                    .or(Err(DerechoError::COULD_NOT_CREATE_SWAPCHAIN))?
            });
        }

        self.d_images = images;
        self.d_views = views;
        Ok(())
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.d_views
    }

    /// Acquire the next swapchain image, signaling `sema` when it is
    /// ready to be rendered to.
    pub fn acquire_next_image(&self, sema: vk::Semaphore) -> Result<u32> {
        unsafe {
            match self.d_swapchain_loader.acquire_next_image(
                self.d_swapchain,
                u64::MAX,
                sema,
                vk::Fence::null(),
            ) {
                Ok((index, _suboptimal)) => Ok(index),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(DerechoError::OUT_OF_DATE),
                Err(vk::Result::SUBOPTIMAL_KHR) => Err(DerechoError::OUT_OF_DATE),
                Err(_) => Err(DerechoError::COULD_NOT_ACQUIRE_NEXT_IMAGE),
            }
        }
    }

    /// Present `image_index`, waiting on `wait_sema` (render_finished).
    pub fn present(&self, image_index: u32, wait_sema: vk::Semaphore) -> Result<()> {
        let wait_semas = [wait_sema];
        let swapchains = [self.d_swapchain];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semas)
            .swapchains(&swapchains)
            .image_indices(&indices);

        unsafe {
            match self
                .d_swapchain_loader
                .queue_present(self.d_dev.graphics_queue, &info)
            {
                Ok(_) => Ok(()),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(DerechoError::OUT_OF_DATE),
                Err(vk::Result::SUBOPTIMAL_KHR) => Err(DerechoError::OUT_OF_DATE),
                Err(vk::Result::ERROR_DEVICE_LOST) => Err(DerechoError::DEVICE_LOST),
                Err(_) => Err(DerechoError::PRESENT_FAILED),
            }
        }
    }

    /// Tear down the swapchain-dependent objects and rebuild them at
    /// `extent`. The caller has already drained the GPU; this only
    /// handles the swapchain itself, size-dependent images and
    /// framebuffers are the engine's problem.
    pub fn recreate(&mut self, extent: vk::Extent2D) -> Result<()> {
        if !resolution_supported(extent.width, extent.height) {
            return Err(DerechoError::UNSUPPORTED_RESOLUTION);
        }

        self.destroy_views();
        self.create_swapchain(extent)
    }

    fn destroy_views(&mut self) {
        unsafe {
            for view in self.d_views.drain(..) {
                self.d_dev.dev.destroy_image_view(view, None);
            }
        }
        self.d_images.clear();
    }

    /// Explicit destructor, called with an idle device.
    pub unsafe fn destroy(&mut self) {
        self.destroy_views();
        self.d_swapchain_loader
            .destroy_swapchain(self.d_swapchain, None);
        self.d_swapchain = vk::SwapchainKHR::null();
        self.d_surface_loader.destroy_surface(self.d_surface, None);
    }
}

pub fn resolution_supported(width: u32, height: u32) -> bool {
    SUPPORTED_RESOLUTIONS
        .iter()
        .any(|&(w, h)| w == width && h == height)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_listed_resolutions_are_accepted() {
        assert!(resolution_supported(1280, 720));
        assert!(resolution_supported(1920, 1080));
        assert!(!resolution_supported(1280, 721));
        assert!(!resolution_supported(0, 0));
        assert!(!resolution_supported(720, 1280));
    }
}
