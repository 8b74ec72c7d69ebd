// Graphics pipelines, one per render effect
//
// The set of effects is closed and enumerated; everything the builder
// needs to construct a pipeline (shaders, layouts, push constants,
// vertex format, fixed function state, target pass) lives in the
// effect table. Pipeline layouts are deduplicated: effects whose
// descriptor set list and push constant ranges match share one layout.
mod builder;
mod table;

pub use table::{
    CascadeIndexPush, ColorPush, EffectFlags, EffectSpec, GuiTimePush, GuiTrianglePush, GuiVertex,
    ImGuiPush, ImGuiVertex, MvpPush, PassKind, PushRange, Scene3dPush, SceneVertex,
    SdfFontFragPush, SdfFontVertPush, ShadowmapPush, SkinnedVertex, SkyboxPush, Specialization,
    StageSet, TerrainFragPush, TerrainPush, TerrainVertex, Vec4Push, VertexLayout, WaterPush,
};

use ash::vk;

use crate::deletion::{DeletionQueue, RetiredResource};
use crate::descriptors::DescriptorLayoutRegistry;
use crate::device::Device;
use crate::passes::RenderPassGraph;
use crate::{DerechoError, Result};

/// Every draw call family the engine can execute.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RenderEffect {
    Shadowmap,
    Skybox,
    Scene3D,
    PbrWater,
    ColoredGeometry,
    ColoredGeometryTriStrip,
    ColoredGeometrySkinned,
    GreenGui,
    GreenGuiWeaponSelectorLeft,
    GreenGuiWeaponSelectorRight,
    GreenGuiLines,
    GreenGuiSdfFont,
    GreenGuiTriangle,
    GreenGuiRadarDots,
    ImGui,
    DebugBillboard,
    ColoredModelWireframe,
    TesselatedGround,
}

pub const EFFECT_COUNT: usize = 18;

impl RenderEffect {
    pub const ALL: [RenderEffect; EFFECT_COUNT] = [
        RenderEffect::Shadowmap,
        RenderEffect::Skybox,
        RenderEffect::Scene3D,
        RenderEffect::PbrWater,
        RenderEffect::ColoredGeometry,
        RenderEffect::ColoredGeometryTriStrip,
        RenderEffect::ColoredGeometrySkinned,
        RenderEffect::GreenGui,
        RenderEffect::GreenGuiWeaponSelectorLeft,
        RenderEffect::GreenGuiWeaponSelectorRight,
        RenderEffect::GreenGuiLines,
        RenderEffect::GreenGuiSdfFont,
        RenderEffect::GreenGuiTriangle,
        RenderEffect::GreenGuiRadarDots,
        RenderEffect::ImGui,
        RenderEffect::DebugBillboard,
        RenderEffect::ColoredModelWireframe,
        RenderEffect::TesselatedGround,
    ];

    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|e| e == self).unwrap()
    }

    /// The full static description of this effect.
    pub fn spec(&self) -> &'static EffectSpec {
        table::spec(*self)
    }
}

/// {pipeline, pipeline layout}. Layouts may be shared across effects,
/// pipelines never are.
#[derive(Debug, Copy, Clone)]
pub struct PipelinePair {
    pub p_pipeline: vk::Pipeline,
    pub p_layout: vk::PipelineLayout,
}

/// Owns all pipelines and the deduplicated layout list.
pub struct Pipelines {
    p_pairs: [PipelinePair; EFFECT_COUNT],
    /// unique layouts, keyed by the (descriptor tags, push ranges)
    /// shape that produced them
    p_layouts: Vec<(String, vk::PipelineLayout)>,
}

impl Pipelines {
    /// Build every pipeline against the current pass graph and extent.
    pub fn new(
        dev: &Device,
        registry: &DescriptorLayoutRegistry,
        passes: &RenderPassGraph,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let mut ret = Self {
            p_pairs: [PipelinePair {
                p_pipeline: vk::Pipeline::null(),
                p_layout: vk::PipelineLayout::null(),
            }; EFFECT_COUNT],
            p_layouts: Vec::new(),
        };

        for effect in RenderEffect::ALL.iter() {
            let layout = ret.layout_for(dev, registry, effect.spec())?;
            let pipeline = builder::build_pipeline(dev, *effect, layout, passes, extent)?;
            ret.p_pairs[effect.index()] = PipelinePair {
                p_pipeline: pipeline,
                p_layout: layout,
            };
        }

        log::info!(
            "Built {} pipelines over {} unique layouts",
            EFFECT_COUNT,
            ret.p_layouts.len()
        );

        Ok(ret)
    }

    pub fn get(&self, effect: RenderEffect) -> PipelinePair {
        self.p_pairs[effect.index()]
    }

    /// Find or create the pipeline layout for a spec.
    fn layout_for(
        &mut self,
        dev: &Device,
        registry: &DescriptorLayoutRegistry,
        spec: &EffectSpec,
    ) -> Result<vk::PipelineLayout> {
        let key = spec.layout_key();
        if let Some((_, layout)) = self.p_layouts.iter().find(|(k, _)| *k == key) {
            return Ok(*layout);
        }

        let set_layouts: Vec<vk::DescriptorSetLayout> = spec
            .es_layouts
            .iter()
            .map(|tag| registry.get(*tag))
            .collect();
        let ranges: Vec<vk::PushConstantRange> = spec
            .es_push_constants
            .iter()
            .map(|r| {
                vk::PushConstantRange::builder()
                    .stage_flags(r.pr_stages)
                    .offset(r.pr_offset)
                    .size(r.pr_size)
                    .build()
            })
            .collect();

        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&ranges)
            .build();
        let layout = unsafe {
            dev.dev
                .create_pipeline_layout(&info, None)
                .or(Err(DerechoError::VK_CALL_FAILED))?
        };

        self.p_layouts.push((key, layout));
        Ok(layout)
    }

    /// Rebuild every pipeline with hard-coded viewport/scissor state
    /// after a resize. Old pipelines go onto the deletion queue so
    /// in-flight frames keep rendering with them until drained.
    ///
    /// The shadow pipeline's viewport is the fixed shadow map
    /// dimension, so it survives resizes untouched.
    pub fn rebuild_sized(
        &mut self,
        dev: &Device,
        passes: &RenderPassGraph,
        extent: vk::Extent2D,
        deletion: &mut DeletionQueue,
    ) -> Result<()> {
        for effect in RenderEffect::ALL.iter() {
            if *effect == RenderEffect::Shadowmap {
                continue;
            }

            let pair = self.p_pairs[effect.index()];
            deletion.schedule(RetiredResource::Pipeline(pair.p_pipeline));

            let pipeline = builder::build_pipeline(dev, *effect, pair.p_layout, passes, extent)?;
            self.p_pairs[effect.index()].p_pipeline = pipeline;
        }

        Ok(())
    }

    /// Explicit destructor with an idle device.
    pub unsafe fn destroy(&mut self, dev: &Device) {
        for pair in self.p_pairs.iter() {
            dev.dev.destroy_pipeline(pair.p_pipeline, None);
        }
        for (_, layout) in self.p_layouts.drain(..) {
            dev.dev.destroy_pipeline_layout(layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effect_indices_are_dense_and_unique() {
        let mut seen = [false; EFFECT_COUNT];
        for effect in RenderEffect::ALL.iter() {
            assert!(!seen[effect.index()]);
            seen[effect.index()] = true;
        }
    }

    #[test]
    fn weapon_selector_variants_share_a_layout_key() {
        // they differ only by a fragment specialization constant
        let left = RenderEffect::GreenGuiWeaponSelectorLeft.spec();
        let right = RenderEffect::GreenGuiWeaponSelectorRight.spec();
        assert_eq!(left.layout_key(), right.layout_key());
        assert_ne!(left.es_specialization, right.es_specialization);
    }

    #[test]
    fn colored_geometry_family_shares_a_layout_key() {
        let base = RenderEffect::ColoredGeometry.spec();
        let strip = RenderEffect::ColoredGeometryTriStrip.spec();
        let wire = RenderEffect::ColoredModelWireframe.spec();
        assert_eq!(base.layout_key(), strip.layout_key());
        assert_eq!(base.layout_key(), wire.layout_key());

        // the skinned variant binds the skinning matrices set
        let skinned = RenderEffect::ColoredGeometrySkinned.spec();
        assert_ne!(base.layout_key(), skinned.layout_key());
    }

    #[test]
    fn every_effect_targets_a_declared_pass() {
        for effect in RenderEffect::ALL.iter() {
            let spec = effect.spec();
            match effect {
                RenderEffect::Shadowmap => assert_eq!(spec.es_target, PassKind::Shadowmap),
                RenderEffect::Skybox => assert_eq!(spec.es_target, PassKind::Skybox),
                RenderEffect::ImGui => assert_eq!(spec.es_target, PassKind::Gui),
                _ => {}
            }
        }
    }
}
