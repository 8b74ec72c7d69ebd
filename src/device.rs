// Vulkan device representation
//
// This stores per-GPU state: the logical device, the selected physical
// device, the graphics queue, and small helpers for command pools,
// samplers, memory types and one-shot submissions. Queue submission
// only ever happens from the main thread.
use ash::extensions::khr;
use ash::vk;

use std::sync::Arc;

use crate::instance::Instance;
use crate::{DerechoError, Result};

pub struct Device {
    /// Keeps the instance alive as long as any device user
    pub(crate) inst: Arc<Instance>,
    /// the logical device we are using
    pub dev: ash::Device,
    /// the physical device selected to display to
    pub pdev: vk::PhysicalDevice,
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,
    pub(crate) pdev_props: vk::PhysicalDeviceProperties,
    /// Graphics queue family that also supports presenting our surface
    pub graphics_family: u32,
    /// The one graphics queue. Owned by the main thread.
    pub graphics_queue: vk::Queue,
    /// pool for one-shot transfer/setup command buffers
    oneshot_pool: vk::CommandPool,
}

impl Device {
    /// Choose a vkPhysicalDevice.
    ///
    /// Discrete GPUs win, then anything that exists. Not finding any
    /// device at all is an unrecoverable init failure.
    fn select_pdev(inst: &ash::Instance) -> Result<vk::PhysicalDevice> {
        let pdevices = unsafe {
            inst.enumerate_physical_devices()
                .or(Err(DerechoError::NO_SUITABLE_DEVICE))?
        };

        let discrete = pdevices.iter().find(|&&p| {
            let props = unsafe { inst.get_physical_device_properties(p) };
            props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
        });

        discrete
            .or_else(|| pdevices.first())
            .copied()
            .ok_or(DerechoError::NO_SUITABLE_DEVICE)
    }

    /// Choose a queue family
    ///
    /// returns an index into the array of queue types. We require one
    /// family that does graphics and can present the given surface.
    fn select_queue_family(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<u32> {
        unsafe { inst.get_physical_device_queue_family_properties(pdev) }
            .iter()
            .enumerate()
            .filter_map(|(index, info)| {
                let supports_graphics = info.queue_flags.contains(vk::QueueFlags::GRAPHICS);
                let supports_present = unsafe {
                    surface_loader
                        .get_physical_device_surface_support(pdev, index as u32, surface)
                        .unwrap_or(false)
                };
                match supports_graphics && supports_present {
                    true => Some(index as u32),
                    false => None,
                }
            })
            .nth(0)
            .ok_or(DerechoError::NO_SUITABLE_DEVICE)
    }

    /// Create a vkDevice from a vkPhysicalDevice
    ///
    /// Once again we specify any device extensions we need, the
    /// swapchain being the most important one. Tessellation is on for
    /// the ground pipeline and fillModeNonSolid for the wireframe one.
    fn create_device(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<ash::Device> {
        let dev_extension_names = [khr::Swapchain::name().as_ptr()];

        let features = vk::PhysicalDeviceFeatures::builder()
            .tessellation_shader(true)
            .fill_mode_non_solid(true)
            .sampler_anisotropy(true)
            .build();

        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)
            .build()];

        let dev_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&dev_extension_names)
            .enabled_features(&features)
            .build();

        unsafe {
            inst.create_device(pdev, &dev_create_info, None)
                .or(Err(DerechoError::VK_CALL_FAILED))
        }
    }

    /// Create a new Device against a surface.
    ///
    /// The surface is needed up front so the queue family choice can
    /// guarantee presentability.
    pub fn new(
        instance: Arc<Instance>,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        let pdev = Self::select_pdev(&instance.inst)?;
        let graphics_family =
            Self::select_queue_family(&instance.inst, pdev, surface_loader, surface)?;

        let mem_props =
            unsafe { instance.inst.get_physical_device_memory_properties(pdev) };
        let pdev_props = unsafe { instance.inst.get_physical_device_properties(pdev) };

        let dev = Self::create_device(&instance.inst, pdev, graphics_family)?;
        let graphics_queue = unsafe { dev.get_device_queue(graphics_family, 0) };

        let mut ret = Self {
            inst: instance,
            dev: dev,
            pdev: pdev,
            mem_props: mem_props,
            pdev_props: pdev_props,
            graphics_family: graphics_family,
            graphics_queue: graphics_queue,
            oneshot_pool: vk::CommandPool::null(),
        };
        ret.oneshot_pool = ret.create_command_pool(graphics_family);

        Ok(ret)
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.pdev_props.limits
    }

    /// returns a new vkCommandPool for `queue_family`
    ///
    /// Command buffers are allocated from command pools. That's about
    /// all they do. They just manage memory.
    pub(crate) fn create_command_pool(&self, queue_family: u32) -> vk::CommandPool {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);

        unsafe {
            self.dev
                .create_command_pool(&pool_create_info, None)
                .unwrap()
        }
    }

    /// Allocate a vec of primary command buffers. Command buffer is
    /// shortened to `cbuf` in many areas of the code.
    pub(crate) fn create_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Vec<vk::CommandBuffer> {
        let cbuf_allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(count)
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY);

        unsafe {
            self.dev
                .allocate_command_buffers(&cbuf_allocate_info)
                .unwrap()
        }
    }

    /// Allocate secondary command buffers for the job system workers.
    pub(crate) fn create_secondary_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Vec<vk::CommandBuffer> {
        let cbuf_allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(count)
            .command_pool(pool)
            .level(vk::CommandBufferLevel::SECONDARY);

        unsafe {
            self.dev
                .allocate_command_buffers(&cbuf_allocate_info)
                .unwrap()
        }
    }

    /// Create the sampler used for all sampled textures.
    pub(crate) fn create_texture_sampler(&self) -> vk::Sampler {
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(true)
            .max_anisotropy(self.limits().max_sampler_anisotropy)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .max_lod(vk::LOD_CLAMP_NONE);

        unsafe { self.dev.create_sampler(&info, None).unwrap() }
    }

    /// Create the sampler the scene pass uses to read the shadow map.
    /// Clamp to a white border so geometry outside a cascade samples
    /// "fully lit" instead of wrapping.
    pub(crate) fn create_shadowmap_sampler(&self) -> vk::Sampler {
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .anisotropy_enable(false)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST);

        unsafe { self.dev.create_sampler(&info, None).unwrap() }
    }

    /// Returns an index into the array of memory types for the memory
    /// properties
    ///
    /// Memory types specify the location and accessability of memory.
    /// Device local memory is resident on the GPU, while host visible
    /// memory can be read from the system side.
    fn find_memory_type_index(
        props: &vk::PhysicalDeviceMemoryProperties,
        reqs: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        for (i, ref mem_type) in props.memory_types.iter().enumerate() {
            // Bit i of memory_type_bits is set if the resource supports
            // the ith memory type in props.
            if (reqs.memory_type_bits >> i) & 1 == 1 && mem_type.property_flags.contains(flags) {
                return Some(i as u32);
            }
        }
        None
    }

    /// One vkAllocateMemory call. The memory pool calls this exactly
    /// five times at startup and never again.
    pub(crate) fn allocate_memory(
        &self,
        reqs: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<vk::DeviceMemory> {
        let index = Self::find_memory_type_index(&self.mem_props, reqs, flags)
            .ok_or(DerechoError::NO_SUITABLE_DEVICE)?;

        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(reqs.size)
            .memory_type_index(index);

        unsafe {
            self.dev
                .allocate_memory(&info, None)
                .or(Err(DerechoError::VK_CALL_FAILED))
        }
    }

    /// Record and synchronously execute a one-shot command buffer on
    /// the graphics queue. Used for staging copies, layout transitions
    /// and the startup cubemap bakes. Main thread only.
    pub fn execute_one_shot<F: FnOnce(vk::CommandBuffer)>(&self, record: F) -> Result<()> {
        unsafe {
            let cbuf = self.create_command_buffers(self.oneshot_pool, 1)[0];

            let begin = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.dev
                .begin_command_buffer(cbuf, &begin)
                .or(Err(DerechoError::VK_CALL_FAILED))?;

            record(cbuf);

            self.dev
                .end_command_buffer(cbuf)
                .or(Err(DerechoError::VK_CALL_FAILED))?;

            let fence = self
                .dev
                .create_fence(&vk::FenceCreateInfo::builder(), None)
                .or(Err(DerechoError::VK_CALL_FAILED))?;

            let cbufs = [cbuf];
            let submit = [vk::SubmitInfo::builder().command_buffers(&cbufs).build()];
            let res = self.dev.queue_submit(self.graphics_queue, &submit, fence);

            let ret = match res {
                Ok(()) => match self.dev.wait_for_fences(&[fence], true, u64::MAX) {
                    Ok(()) => Ok(()),
                    Err(vk::Result::ERROR_DEVICE_LOST) => Err(DerechoError::DEVICE_LOST),
                    Err(_) => Err(DerechoError::VK_CALL_FAILED),
                },
                Err(vk::Result::ERROR_DEVICE_LOST) => Err(DerechoError::DEVICE_LOST),
                Err(_) => Err(DerechoError::VK_CALL_FAILED),
            };

            self.dev.destroy_fence(fence, None);
            self.dev.free_command_buffers(self.oneshot_pool, &cbufs);

            ret
        }
    }

    /// Record a layout transition barrier for `image` into `cbuf`.
    ///
    /// Stage and access masks are derived from the (old, new) pair;
    /// the cases here are exactly the transitions this engine performs.
    pub unsafe fn transition_image_layout(
        &self,
        cbuf: vk::CommandBuffer,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        layer_count: u32,
        level_count: u32,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) {
        let (src_access, dst_access, src_stage, dst_stage) = match (old, new) {
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            | (vk::ImageLayout::PREINITIALIZED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
            ),
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => (
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
            ),
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
                vk::AccessFlags::empty(),
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            ),
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL) => (
                vk::AccessFlags::empty(),
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            ),
            (vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => (
                vk::AccessFlags::TRANSFER_READ,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
            ),
            (vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL) => (
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::AccessFlags::TRANSFER_READ,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::TRANSFER,
            ),
            _ => panic!("unhandled layout transition {:?} -> {:?}", old, new),
        };

        let barrier = vk::ImageMemoryBarrier::builder()
            .image(image)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old)
            .new_layout(new)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(aspect)
                    .layer_count(layer_count)
                    .level_count(level_count)
                    .build(),
            )
            .build();

        self.dev.cmd_pipeline_barrier(
            cbuf,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }

    pub fn wait_idle(&self) {
        unsafe {
            self.dev.device_wait_idle().unwrap();
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            self.dev.device_wait_idle().unwrap();
            self.dev.destroy_command_pool(self.oneshot_pool, None);
            self.dev.destroy_device(None);
        }
    }
}
