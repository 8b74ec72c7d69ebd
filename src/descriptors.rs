// Descriptor set layout registry
//
// The engine uses a closed set of descriptor set layouts; every
// pipeline layout is built by naming tags from this enum. The layouts
// and the single descriptor pool behind them are created once at
// startup and live for the process.
use ash::vk;

use crate::device::Device;
use crate::{DerechoError, Result, SWAPCHAIN_IMAGES_COUNT};

/// Every descriptor set layout the engine will ever create.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LayoutTag {
    /// (0: UBO) vertex. Cascade view-proj matrices for the shadow pass.
    ShadowPass,
    /// (0: CIS x5) fragment. Albedo, metallic-roughness, emissive,
    /// ambient occlusion, normal.
    PbrMaterial,
    /// (0: CIS x2), (1: CIS) fragment. Irradiance + prefiltered
    /// cubemaps and the BRDF lookup table.
    IblCubemapsAndBrdfLut,
    /// (0: dynamic UBO) fragment.
    DynamicLights,
    /// (0: CIS) fragment.
    SingleTextureFrag,
    /// (0: CIS), (1: CIS) fragment.
    TwoTexturesFrag,
    /// (0: dynamic UBO) vertex.
    SkinningMatrices,
    /// (0: UBO) fragment. Cascade split depths + matrices for sampling.
    CascadeMatricesFrag,
    /// (0: UBO) tessellation control.
    FrustumPlanes,
}

pub const LAYOUT_COUNT: usize = 9;

pub const ALL_LAYOUTS: [LayoutTag; LAYOUT_COUNT] = [
    LayoutTag::ShadowPass,
    LayoutTag::PbrMaterial,
    LayoutTag::IblCubemapsAndBrdfLut,
    LayoutTag::DynamicLights,
    LayoutTag::SingleTextureFrag,
    LayoutTag::TwoTexturesFrag,
    LayoutTag::SkinningMatrices,
    LayoutTag::CascadeMatricesFrag,
    LayoutTag::FrustumPlanes,
];

/// The binding shape of one layout: (binding, type, count, stages).
pub type BindingDesc = (u32, vk::DescriptorType, u32, vk::ShaderStageFlags);

impl LayoutTag {
    pub fn index(&self) -> usize {
        ALL_LAYOUTS.iter().position(|t| t == self).unwrap()
    }

    pub fn bindings(&self) -> Vec<BindingDesc> {
        use vk::DescriptorType as Dt;
        use vk::ShaderStageFlags as St;

        match self {
            LayoutTag::ShadowPass => vec![(0, Dt::UNIFORM_BUFFER, 1, St::VERTEX)],
            LayoutTag::PbrMaterial => vec![(0, Dt::COMBINED_IMAGE_SAMPLER, 5, St::FRAGMENT)],
            LayoutTag::IblCubemapsAndBrdfLut => vec![
                (0, Dt::COMBINED_IMAGE_SAMPLER, 2, St::FRAGMENT),
                (1, Dt::COMBINED_IMAGE_SAMPLER, 1, St::FRAGMENT),
            ],
            LayoutTag::DynamicLights => {
                vec![(0, Dt::UNIFORM_BUFFER_DYNAMIC, 1, St::FRAGMENT)]
            }
            LayoutTag::SingleTextureFrag => {
                vec![(0, Dt::COMBINED_IMAGE_SAMPLER, 1, St::FRAGMENT)]
            }
            LayoutTag::TwoTexturesFrag => vec![
                (0, Dt::COMBINED_IMAGE_SAMPLER, 1, St::FRAGMENT),
                (1, Dt::COMBINED_IMAGE_SAMPLER, 1, St::FRAGMENT),
            ],
            LayoutTag::SkinningMatrices => {
                vec![(0, Dt::UNIFORM_BUFFER_DYNAMIC, 1, St::VERTEX)]
            }
            LayoutTag::CascadeMatricesFrag => vec![(0, Dt::UNIFORM_BUFFER, 1, St::FRAGMENT)],
            LayoutTag::FrustumPlanes => {
                vec![(0, Dt::UNIFORM_BUFFER, 1, St::TESSELLATION_CONTROL)]
            }
        }
    }
}

/// How many sets of each tag the pool must be able to hand out.
///
/// Derived from the render effect inventory instead of hand-tuned
/// numbers: each effect referencing a tag gets one set per frame slot,
/// plus asset-driven headroom for the material and single-texture tags
/// which are instantiated per loaded texture/material rather than per
/// pipeline.
pub fn pool_demand() -> [usize; LAYOUT_COUNT] {
    let mut demand = [0usize; LAYOUT_COUNT];

    for effect in crate::pipelines::RenderEffect::ALL.iter() {
        for tag in effect.spec().es_layouts.iter() {
            demand[tag.index()] += SWAPCHAIN_IMAGES_COUNT;
        }
    }

    // per-material and per-texture sets allocated at asset load time
    demand[LayoutTag::PbrMaterial.index()] += 32;
    demand[LayoutTag::SingleTextureFrag.index()] += 16;
    demand[LayoutTag::TwoTexturesFrag.index()] += 4;

    demand
}

/// Creates and owns the closed set of layouts plus the pool all
/// startup-time descriptor sets come from.
pub struct DescriptorLayoutRegistry {
    dl_layouts: [vk::DescriptorSetLayout; LAYOUT_COUNT],
    dl_pool: vk::DescriptorPool,
}

impl DescriptorLayoutRegistry {
    pub fn new(dev: &Device) -> Result<Self> {
        let mut layouts = [vk::DescriptorSetLayout::null(); LAYOUT_COUNT];
        for tag in ALL_LAYOUTS.iter() {
            let bindings: Vec<vk::DescriptorSetLayoutBinding> = tag
                .bindings()
                .iter()
                .map(|&(binding, ty, count, stages)| {
                    vk::DescriptorSetLayoutBinding::builder()
                        .binding(binding)
                        .descriptor_type(ty)
                        .descriptor_count(count)
                        .stage_flags(stages)
                        .build()
                })
                .collect();

            let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
            layouts[tag.index()] = unsafe {
                dev.dev
                    .create_descriptor_set_layout(&info, None)
                    .or(Err(DerechoError::VK_CALL_FAILED))?
            };
        }

        let pool = Self::create_pool(dev)?;

        Ok(Self {
            dl_layouts: layouts,
            dl_pool: pool,
        })
    }

    /// Size the pool by summing the per-type descriptor counts of
    /// every set the demand table says we will allocate.
    fn create_pool(dev: &Device) -> Result<vk::DescriptorPool> {
        let demand = pool_demand();

        let mut ubo = 0;
        let mut ubo_dynamic = 0;
        let mut cis = 0;
        let mut max_sets = 0;
        for tag in ALL_LAYOUTS.iter() {
            let sets = demand[tag.index()];
            max_sets += sets;
            for (_, ty, count, _) in tag.bindings() {
                let total = count as usize * sets;
                match ty {
                    vk::DescriptorType::UNIFORM_BUFFER => ubo += total,
                    vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC => ubo_dynamic += total,
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER => cis += total,
                    _ => unreachable!(),
                }
            }
        }

        let sizes = [
            vk::DescriptorPoolSize::builder()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(ubo as u32)
                .build(),
            vk::DescriptorPoolSize::builder()
                .ty(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .descriptor_count(ubo_dynamic as u32)
                .build(),
            vk::DescriptorPoolSize::builder()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(cis as u32)
                .build(),
        ];

        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .max_sets(max_sets as u32);

        unsafe {
            dev.dev
                .create_descriptor_pool(&info, None)
                .or(Err(DerechoError::VK_CALL_FAILED))
        }
    }

    pub fn get(&self, tag: LayoutTag) -> vk::DescriptorSetLayout {
        self.dl_layouts[tag.index()]
    }

    /// Allocate one set with the layout of `tag`.
    pub fn allocate_set(&self, dev: &Device, tag: LayoutTag) -> Result<vk::DescriptorSet> {
        let layouts = [self.get(tag)];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.dl_pool)
            .set_layouts(&layouts)
            .build();

        unsafe {
            Ok(dev
                .dev
                .allocate_descriptor_sets(&info)
                .or(Err(DerechoError::VK_CALL_FAILED))?[0])
        }
    }

    /// Point a UBO binding of `set` at a range of the region buffer.
    pub fn write_buffer(
        &self,
        dev: &Device,
        set: vk::DescriptorSet,
        binding: u32,
        ty: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) {
        // Dynamic UBOs bind at offset zero; the real offset arrives at
        // bind time through the dynamic offset array.
        let info = [vk::DescriptorBufferInfo::builder()
            .buffer(buffer)
            .offset(offset)
            .range(range)
            .build()];
        let writes = [vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding)
            .dst_array_element(0)
            .descriptor_type(ty)
            .buffer_info(&info)
            .build()];

        unsafe {
            dev.dev.update_descriptor_sets(&writes, &[]);
        }
    }

    /// Point sampler bindings of `set` at image views.
    pub fn write_images(
        &self,
        dev: &Device,
        set: vk::DescriptorSet,
        binding: u32,
        sampler: vk::Sampler,
        views: &[vk::ImageView],
    ) {
        let infos: Vec<vk::DescriptorImageInfo> = views
            .iter()
            .map(|&view| {
                vk::DescriptorImageInfo::builder()
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .image_view(view)
                    .sampler(sampler)
                    .build()
            })
            .collect();
        let writes = [vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&infos)
            .build()];

        unsafe {
            dev.dev.update_descriptor_sets(&writes, &[]);
        }
    }

    /// Explicit destructor, device must be idle.
    pub unsafe fn destroy(&mut self, dev: &Device) {
        dev.dev.destroy_descriptor_pool(self.dl_pool, None);
        for layout in self.dl_layouts.iter() {
            dev.dev.destroy_descriptor_set_layout(*layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tag_has_a_unique_index() {
        let mut seen = [false; LAYOUT_COUNT];
        for tag in ALL_LAYOUTS.iter() {
            assert!(!seen[tag.index()]);
            seen[tag.index()] = true;
        }
    }

    #[test]
    fn binding_shapes_match_the_declared_table() {
        assert_eq!(LayoutTag::PbrMaterial.bindings()[0].2, 5);
        assert_eq!(LayoutTag::IblCubemapsAndBrdfLut.bindings().len(), 2);
        assert_eq!(
            LayoutTag::SkinningMatrices.bindings()[0].1,
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        );
        assert_eq!(
            LayoutTag::FrustumPlanes.bindings()[0].3,
            vk::ShaderStageFlags::TESSELLATION_CONTROL
        );
        // bindings are densely numbered from zero
        for tag in ALL_LAYOUTS.iter() {
            for (i, b) in tag.bindings().iter().enumerate() {
                assert_eq!(b.0 as usize, i);
            }
        }
    }

    #[test]
    fn pool_demand_covers_every_referenced_tag() {
        let demand = pool_demand();
        for effect in crate::pipelines::RenderEffect::ALL.iter() {
            for tag in effect.spec().es_layouts.iter() {
                assert!(demand[tag.index()] > 0, "no pool room for {:?}", tag);
            }
        }
    }
}
