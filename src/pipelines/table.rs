// The render effect table
//
// Single source of truth for everything static about an effect: shader
// base names, descriptor set layout tags, the exact byte layout of its
// push constant ranges, vertex format, topology, fixed function flags
// and the pass it targets. The host-side push constant structs live
// next to the table so the ranges are derived from the very types the
// frame code writes.
use ash::vk;
use cgmath::Matrix4;

use crate::descriptors::LayoutTag;

use super::RenderEffect;

/// Which of the four passes a pipeline is created against.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PassKind {
    Shadowmap,
    Skybox,
    ColorDepth,
    Gui,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StageSet {
    VertFrag,
    VertTescTeseFrag,
}

/// Compile-time constants injected at pipeline creation.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Specialization {
    None,
    /// A boolean constant in the fragment stage. How the weapon
    /// selector box variants differ while sharing one layout.
    FragmentBool { constant_id: u32, value: bool },
    /// Terrain displacement parameters for the tessellation stages.
    TessGround { y_scale: f32, y_offset: f32 },
}

/// One push constant range of a pipeline layout.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PushRange {
    pub pr_stages: vk::ShaderStageFlags,
    pub pr_offset: u32,
    pub pr_size: u32,
}

bitflags! {
    /// Fixed function state toggles consumed by the pipeline builder.
    pub struct EffectFlags: u32 {
        const DEPTH_TEST      = 1 << 0;
        const DEPTH_WRITE     = 1 << 1;
        const BLEND           = 1 << 2;
        const CULL_BACK       = 1 << 3;
        const WIREFRAME       = 1 << 4;
        /// scissor is set at draw time (the debug UI clips widgets)
        const DYNAMIC_SCISSOR = 1 << 5;
    }
}

// ---------------------------------------------------------------------
// Vertex formats
// ---------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct SceneVertex {
    pub v_position: [f32; 3],
    pub v_normal: [f32; 3],
    pub v_texcoord: [f32; 2],
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct SkinnedVertex {
    pub v_position: [f32; 3],
    pub v_normal: [f32; 3],
    pub v_texcoord: [f32; 2],
    pub v_joints: [u16; 4],
    pub v_weights: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct GuiVertex {
    pub v_position: [f32; 2],
    pub v_texcoord: [f32; 2],
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct ImGuiVertex {
    pub v_position: [f32; 2],
    pub v_texcoord: [f32; 2],
    pub v_color: [u8; 4],
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct TerrainVertex {
    pub v_position: [f32; 3],
    pub v_texcoord: [f32; 2],
}

/// The vertex input shapes the effects draw with.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VertexLayout {
    /// positions only, three floats per vertex
    Position3,
    /// two floats per vertex (lines, dots, plain triangles)
    Position2,
    /// full scene vertex: position, normal, texcoord
    Scene,
    /// scene vertex stride but only the position attribute; the depth
    /// only shadow pass reads nothing else
    ScenePositionOnly,
    /// skinned scene vertex with joint indices and weights
    Skinned,
    /// 2D position + texcoord
    Gui2D,
    /// the debug UI's packed vertex
    ImGuiVert,
    /// terrain patch corners: position + texcoord
    Terrain,
}

impl VertexLayout {
    pub fn stride(&self) -> u32 {
        match self {
            VertexLayout::Position3 => (std::mem::size_of::<f32>() * 3) as u32,
            VertexLayout::Position2 => (std::mem::size_of::<f32>() * 2) as u32,
            VertexLayout::Scene | VertexLayout::ScenePositionOnly => {
                std::mem::size_of::<SceneVertex>() as u32
            }
            VertexLayout::Skinned => std::mem::size_of::<SkinnedVertex>() as u32,
            VertexLayout::Gui2D => std::mem::size_of::<GuiVertex>() as u32,
            VertexLayout::ImGuiVert => std::mem::size_of::<ImGuiVertex>() as u32,
            VertexLayout::Terrain => std::mem::size_of::<TerrainVertex>() as u32,
        }
    }

    pub fn bindings(&self) -> Vec<vk::VertexInputBindingDescription> {
        vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: self.stride(),
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }

    pub fn attributes(&self) -> Vec<vk::VertexInputAttributeDescription> {
        let attr = |location: u32, format: vk::Format, offset: u32| {
            vk::VertexInputAttributeDescription {
                binding: 0,
                location,
                format,
                offset,
            }
        };

        match self {
            VertexLayout::Position3 => vec![attr(0, vk::Format::R32G32B32_SFLOAT, 0)],
            VertexLayout::Position2 => vec![attr(0, vk::Format::R32G32_SFLOAT, 0)],
            VertexLayout::ScenePositionOnly => vec![attr(
                0,
                vk::Format::R32G32B32_SFLOAT,
                offset_of!(SceneVertex, v_position) as u32,
            )],
            VertexLayout::Scene => vec![
                attr(
                    0,
                    vk::Format::R32G32B32_SFLOAT,
                    offset_of!(SceneVertex, v_position) as u32,
                ),
                attr(
                    1,
                    vk::Format::R32G32B32_SFLOAT,
                    offset_of!(SceneVertex, v_normal) as u32,
                ),
                attr(
                    2,
                    vk::Format::R32G32_SFLOAT,
                    offset_of!(SceneVertex, v_texcoord) as u32,
                ),
            ],
            VertexLayout::Skinned => vec![
                attr(
                    0,
                    vk::Format::R32G32B32_SFLOAT,
                    offset_of!(SkinnedVertex, v_position) as u32,
                ),
                attr(
                    1,
                    vk::Format::R32G32B32_SFLOAT,
                    offset_of!(SkinnedVertex, v_normal) as u32,
                ),
                attr(
                    2,
                    vk::Format::R32G32_SFLOAT,
                    offset_of!(SkinnedVertex, v_texcoord) as u32,
                ),
                attr(
                    3,
                    vk::Format::R16G16B16A16_UINT,
                    offset_of!(SkinnedVertex, v_joints) as u32,
                ),
                attr(
                    4,
                    vk::Format::R32G32B32A32_SFLOAT,
                    offset_of!(SkinnedVertex, v_weights) as u32,
                ),
            ],
            VertexLayout::Gui2D => vec![
                attr(
                    0,
                    vk::Format::R32G32_SFLOAT,
                    offset_of!(GuiVertex, v_position) as u32,
                ),
                attr(
                    1,
                    vk::Format::R32G32_SFLOAT,
                    offset_of!(GuiVertex, v_texcoord) as u32,
                ),
            ],
            VertexLayout::ImGuiVert => vec![
                attr(
                    0,
                    vk::Format::R32G32_SFLOAT,
                    offset_of!(ImGuiVertex, v_position) as u32,
                ),
                attr(
                    1,
                    vk::Format::R32G32_SFLOAT,
                    offset_of!(ImGuiVertex, v_texcoord) as u32,
                ),
                attr(
                    2,
                    vk::Format::R8G8B8A8_UNORM,
                    offset_of!(ImGuiVertex, v_color) as u32,
                ),
            ],
            VertexLayout::Terrain => vec![
                attr(
                    0,
                    vk::Format::R32G32B32_SFLOAT,
                    offset_of!(TerrainVertex, v_position) as u32,
                ),
                attr(
                    1,
                    vk::Format::R32G32_SFLOAT,
                    offset_of!(TerrainVertex, v_texcoord) as u32,
                ),
            ],
        }
    }
}

// ---------------------------------------------------------------------
// Push constant blocks, one struct per range
// ---------------------------------------------------------------------

#[repr(C)]
#[derive(Copy, Clone)]
pub struct ShadowmapPush {
    pub mvp: Matrix4<f32>,
    pub cascade_idx: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct SkyboxPush {
    pub projection: Matrix4<f32>,
    pub view: Matrix4<f32>,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct Scene3dPush {
    pub projection: Matrix4<f32>,
    pub view: Matrix4<f32>,
    pub model: Matrix4<f32>,
    pub camera_position: [f32; 3],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct WaterPush {
    pub projection: Matrix4<f32>,
    pub view: Matrix4<f32>,
    pub model: Matrix4<f32>,
    pub camera_position: [f32; 3],
    pub time: f32,
}

/// Vertex-stage mvp shared by the colored geometry family and most of
/// the gui quads.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct MvpPush {
    pub mvp: Matrix4<f32>,
}

/// Fragment-stage solid color following an MvpPush.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct ColorPush {
    pub color: [f32; 3],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct GuiTimePush {
    pub time: f32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct SdfFontVertPush {
    pub mvp: Matrix4<f32>,
    pub character_coordinate: [f32; 2],
    pub character_size: [f32; 2],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct SdfFontFragPush {
    pub color: [f32; 3],
    pub time: f32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct GuiTrianglePush {
    pub offset: [f32; 4],
    pub scale: [f32; 4],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct Vec4Push {
    pub value: [f32; 4],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct ImGuiPush {
    pub projection: Matrix4<f32>,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct CascadeIndexPush {
    pub cascade_idx: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct TerrainPush {
    pub projection: Matrix4<f32>,
    pub view: Matrix4<f32>,
    pub model: Matrix4<f32>,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct TerrainFragPush {
    pub camera_position: [f32; 3],
    pub time: f32,
}

// ---------------------------------------------------------------------
// The table
// ---------------------------------------------------------------------

/// The full static description of one render effect.
#[derive(Debug)]
pub struct EffectSpec {
    /// resolves <base>.vert.spv / <base>.frag.spv etc next to the
    /// executable
    pub es_shader_base: &'static str,
    pub es_stages: StageSet,
    pub es_layouts: Vec<LayoutTag>,
    pub es_push_constants: Vec<PushRange>,
    pub es_vertex: VertexLayout,
    pub es_topology: vk::PrimitiveTopology,
    pub es_flags: EffectFlags,
    pub es_target: PassKind,
    pub es_specialization: Specialization,
    /// nonzero only for tessellated effects
    pub es_patch_control_points: u32,
}

impl EffectSpec {
    /// Effects with identical keys share one vkPipelineLayout.
    pub fn layout_key(&self) -> String {
        format!("{:?}|{:?}", self.es_layouts, self.es_push_constants)
    }
}

fn size_of<T>() -> u32 {
    std::mem::size_of::<T>() as u32
}

fn vert_range<T>(offset: u32) -> PushRange {
    PushRange {
        pr_stages: vk::ShaderStageFlags::VERTEX,
        pr_offset: offset,
        pr_size: size_of::<T>(),
    }
}

fn frag_range<T>(offset: u32) -> PushRange {
    PushRange {
        pr_stages: vk::ShaderStageFlags::FRAGMENT,
        pr_offset: offset,
        pr_size: size_of::<T>(),
    }
}

fn spec_for(effect: RenderEffect) -> EffectSpec {
    use RenderEffect::*;

    match effect {
        Shadowmap => EffectSpec {
            es_shader_base: "shadowmap",
            es_stages: StageSet::VertFrag,
            es_layouts: vec![LayoutTag::ShadowPass],
            es_push_constants: vec![vert_range::<ShadowmapPush>(0)],
            es_vertex: VertexLayout::ScenePositionOnly,
            es_topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            es_flags: EffectFlags::DEPTH_TEST | EffectFlags::DEPTH_WRITE,
            es_target: PassKind::Shadowmap,
            es_specialization: Specialization::None,
            es_patch_control_points: 0,
        },
        Skybox => EffectSpec {
            es_shader_base: "skybox",
            es_stages: StageSet::VertFrag,
            es_layouts: vec![LayoutTag::SingleTextureFrag],
            es_push_constants: vec![vert_range::<SkyboxPush>(0)],
            es_vertex: VertexLayout::Position3,
            es_topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            es_flags: EffectFlags::empty(),
            es_target: PassKind::Skybox,
            es_specialization: Specialization::None,
            es_patch_control_points: 0,
        },
        Scene3D => EffectSpec {
            es_shader_base: "scene3d",
            es_stages: StageSet::VertFrag,
            es_layouts: vec![
                LayoutTag::PbrMaterial,
                LayoutTag::IblCubemapsAndBrdfLut,
                LayoutTag::SingleTextureFrag,
                LayoutTag::DynamicLights,
                LayoutTag::CascadeMatricesFrag,
            ],
            es_push_constants: vec![PushRange {
                pr_stages: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                pr_offset: 0,
                pr_size: size_of::<Scene3dPush>(),
            }],
            es_vertex: VertexLayout::Scene,
            es_topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            es_flags: EffectFlags::DEPTH_TEST | EffectFlags::DEPTH_WRITE | EffectFlags::CULL_BACK,
            es_target: PassKind::ColorDepth,
            es_specialization: Specialization::None,
            es_patch_control_points: 0,
        },
        PbrWater => EffectSpec {
            es_shader_base: "pbr_water",
            es_stages: StageSet::VertFrag,
            es_layouts: vec![
                LayoutTag::IblCubemapsAndBrdfLut,
                LayoutTag::DynamicLights,
                LayoutTag::SingleTextureFrag,
            ],
            es_push_constants: vec![PushRange {
                pr_stages: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                pr_offset: 0,
                pr_size: size_of::<WaterPush>(),
            }],
            es_vertex: VertexLayout::Terrain,
            es_topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            es_flags: EffectFlags::DEPTH_TEST | EffectFlags::BLEND,
            es_target: PassKind::ColorDepth,
            es_specialization: Specialization::None,
            es_patch_control_points: 0,
        },
        ColoredGeometry => EffectSpec {
            es_shader_base: "colored_geometry",
            es_stages: StageSet::VertFrag,
            es_layouts: vec![],
            es_push_constants: vec![
                vert_range::<MvpPush>(0),
                frag_range::<ColorPush>(size_of::<MvpPush>()),
            ],
            es_vertex: VertexLayout::Position3,
            es_topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            es_flags: EffectFlags::DEPTH_TEST | EffectFlags::DEPTH_WRITE,
            es_target: PassKind::ColorDepth,
            es_specialization: Specialization::None,
            es_patch_control_points: 0,
        },
        ColoredGeometryTriStrip => EffectSpec {
            es_shader_base: "colored_geometry",
            es_stages: StageSet::VertFrag,
            es_layouts: vec![],
            es_push_constants: vec![
                vert_range::<MvpPush>(0),
                frag_range::<ColorPush>(size_of::<MvpPush>()),
            ],
            es_vertex: VertexLayout::Position3,
            es_topology: vk::PrimitiveTopology::TRIANGLE_STRIP,
            es_flags: EffectFlags::DEPTH_TEST | EffectFlags::DEPTH_WRITE,
            es_target: PassKind::ColorDepth,
            es_specialization: Specialization::None,
            es_patch_control_points: 0,
        },
        ColoredGeometrySkinned => EffectSpec {
            es_shader_base: "colored_geometry_skinned",
            es_stages: StageSet::VertFrag,
            es_layouts: vec![LayoutTag::SkinningMatrices],
            es_push_constants: vec![
                vert_range::<MvpPush>(0),
                frag_range::<ColorPush>(size_of::<MvpPush>()),
            ],
            es_vertex: VertexLayout::Skinned,
            es_topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            es_flags: EffectFlags::DEPTH_TEST | EffectFlags::DEPTH_WRITE,
            es_target: PassKind::ColorDepth,
            es_specialization: Specialization::None,
            es_patch_control_points: 0,
        },
        GreenGui => EffectSpec {
            es_shader_base: "green_gui",
            es_stages: StageSet::VertFrag,
            es_layouts: vec![LayoutTag::SingleTextureFrag],
            es_push_constants: vec![
                vert_range::<MvpPush>(0),
                frag_range::<GuiTimePush>(size_of::<MvpPush>()),
            ],
            es_vertex: VertexLayout::Gui2D,
            es_topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            es_flags: EffectFlags::BLEND,
            es_target: PassKind::Gui,
            es_specialization: Specialization::None,
            es_patch_control_points: 0,
        },
        GreenGuiWeaponSelectorLeft => EffectSpec {
            es_shader_base: "green_gui_weapon_selector_box",
            es_stages: StageSet::VertFrag,
            es_layouts: vec![LayoutTag::SingleTextureFrag],
            es_push_constants: vec![
                vert_range::<MvpPush>(0),
                frag_range::<ColorPush>(size_of::<MvpPush>()),
            ],
            es_vertex: VertexLayout::Gui2D,
            es_topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            es_flags: EffectFlags::BLEND,
            es_target: PassKind::Gui,
            es_specialization: Specialization::FragmentBool {
                constant_id: 0,
                value: false,
            },
            es_patch_control_points: 0,
        },
        GreenGuiWeaponSelectorRight => EffectSpec {
            es_shader_base: "green_gui_weapon_selector_box",
            es_stages: StageSet::VertFrag,
            es_layouts: vec![LayoutTag::SingleTextureFrag],
            es_push_constants: vec![
                vert_range::<MvpPush>(0),
                frag_range::<ColorPush>(size_of::<MvpPush>()),
            ],
            es_vertex: VertexLayout::Gui2D,
            es_topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            es_flags: EffectFlags::BLEND,
            es_target: PassKind::Gui,
            es_specialization: Specialization::FragmentBool {
                constant_id: 0,
                value: true,
            },
            es_patch_control_points: 0,
        },
        GreenGuiLines => EffectSpec {
            es_shader_base: "green_gui_lines",
            es_stages: StageSet::VertFrag,
            es_layouts: vec![LayoutTag::SingleTextureFrag],
            es_push_constants: vec![frag_range::<Vec4Push>(0)],
            es_vertex: VertexLayout::Position2,
            es_topology: vk::PrimitiveTopology::LINE_LIST,
            es_flags: EffectFlags::BLEND,
            es_target: PassKind::Gui,
            es_specialization: Specialization::None,
            es_patch_control_points: 0,
        },
        GreenGuiSdfFont => EffectSpec {
            es_shader_base: "green_gui_sdf_font",
            es_stages: StageSet::VertFrag,
            es_layouts: vec![LayoutTag::SingleTextureFrag],
            es_push_constants: vec![
                vert_range::<SdfFontVertPush>(0),
                frag_range::<SdfFontFragPush>(size_of::<SdfFontVertPush>()),
            ],
            es_vertex: VertexLayout::Gui2D,
            es_topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            es_flags: EffectFlags::BLEND,
            es_target: PassKind::Gui,
            es_specialization: Specialization::None,
            es_patch_control_points: 0,
        },
        GreenGuiTriangle => EffectSpec {
            es_shader_base: "green_gui_triangle",
            es_stages: StageSet::VertFrag,
            es_layouts: vec![],
            es_push_constants: vec![
                vert_range::<GuiTrianglePush>(0),
                frag_range::<Vec4Push>(size_of::<GuiTrianglePush>()),
            ],
            es_vertex: VertexLayout::Position2,
            es_topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            es_flags: EffectFlags::BLEND,
            es_target: PassKind::Gui,
            es_specialization: Specialization::None,
            es_patch_control_points: 0,
        },
        GreenGuiRadarDots => EffectSpec {
            es_shader_base: "green_gui_radar_dots",
            es_stages: StageSet::VertFrag,
            es_layouts: vec![],
            es_push_constants: vec![
                vert_range::<Vec4Push>(0),
                frag_range::<Vec4Push>(size_of::<Vec4Push>()),
            ],
            es_vertex: VertexLayout::Position2,
            es_topology: vk::PrimitiveTopology::POINT_LIST,
            es_flags: EffectFlags::BLEND,
            es_target: PassKind::Gui,
            es_specialization: Specialization::None,
            es_patch_control_points: 0,
        },
        ImGui => EffectSpec {
            es_shader_base: "imgui",
            es_stages: StageSet::VertFrag,
            es_layouts: vec![LayoutTag::SingleTextureFrag],
            es_push_constants: vec![vert_range::<ImGuiPush>(0)],
            es_vertex: VertexLayout::ImGuiVert,
            es_topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            es_flags: EffectFlags::BLEND | EffectFlags::DYNAMIC_SCISSOR,
            es_target: PassKind::Gui,
            es_specialization: Specialization::None,
            es_patch_control_points: 0,
        },
        DebugBillboard => EffectSpec {
            es_shader_base: "debug_billboard",
            es_stages: StageSet::VertFrag,
            es_layouts: vec![LayoutTag::SingleTextureFrag],
            es_push_constants: vec![
                vert_range::<MvpPush>(0),
                frag_range::<CascadeIndexPush>(size_of::<MvpPush>()),
            ],
            es_vertex: VertexLayout::Gui2D,
            es_topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            es_flags: EffectFlags::empty(),
            es_target: PassKind::Gui,
            es_specialization: Specialization::None,
            es_patch_control_points: 0,
        },
        ColoredModelWireframe => EffectSpec {
            es_shader_base: "colored_model_wireframe",
            es_stages: StageSet::VertFrag,
            es_layouts: vec![],
            es_push_constants: vec![
                vert_range::<MvpPush>(0),
                frag_range::<ColorPush>(size_of::<MvpPush>()),
            ],
            es_vertex: VertexLayout::Position3,
            es_topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            es_flags: EffectFlags::DEPTH_TEST | EffectFlags::WIREFRAME,
            es_target: PassKind::ColorDepth,
            es_specialization: Specialization::None,
            es_patch_control_points: 0,
        },
        TesselatedGround => EffectSpec {
            es_shader_base: "tesselated_ground",
            es_stages: StageSet::VertTescTeseFrag,
            es_layouts: vec![LayoutTag::TwoTexturesFrag, LayoutTag::FrustumPlanes],
            es_push_constants: vec![
                PushRange {
                    pr_stages: vk::ShaderStageFlags::VERTEX
                        | vk::ShaderStageFlags::TESSELLATION_EVALUATION,
                    pr_offset: 0,
                    pr_size: size_of::<TerrainPush>(),
                },
                frag_range::<TerrainFragPush>(size_of::<TerrainPush>()),
            ],
            es_vertex: VertexLayout::Terrain,
            es_topology: vk::PrimitiveTopology::PATCH_LIST,
            es_flags: EffectFlags::DEPTH_TEST | EffectFlags::DEPTH_WRITE,
            es_target: PassKind::ColorDepth,
            es_specialization: Specialization::TessGround {
                y_scale: 2.0,
                y_offset: -12.0,
            },
            es_patch_control_points: 4,
        },
    }
}

lazy_static! {
    static ref EFFECT_SPECS: Vec<EffectSpec> = RenderEffect::ALL
        .iter()
        .map(|effect| spec_for(*effect))
        .collect();
}

pub(super) fn spec(effect: RenderEffect) -> &'static EffectSpec {
    &EFFECT_SPECS[effect.index()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_ranges_are_ascending_and_disjoint() {
        for effect in RenderEffect::ALL.iter() {
            let spec = effect.spec();
            let mut end = 0;
            for range in spec.es_push_constants.iter() {
                assert!(
                    range.pr_offset >= end,
                    "{:?} push ranges overlap",
                    effect
                );
                assert!(range.pr_size > 0);
                // push constant offsets and sizes must be 4 byte
                // aligned per the api
                assert_eq!(range.pr_offset % 4, 0);
                assert_eq!(range.pr_size % 4, 0);
                end = range.pr_offset + range.pr_size;
            }
            // 128 bytes is the minimum guaranteed push constant budget
            assert!(end <= 256, "{:?} exceeds a sane push budget", effect);
        }
    }

    #[test]
    fn push_structs_have_the_expected_wire_sizes() {
        assert_eq!(std::mem::size_of::<ShadowmapPush>(), 64 + 4);
        assert_eq!(std::mem::size_of::<SkyboxPush>(), 128);
        assert_eq!(std::mem::size_of::<Scene3dPush>(), 3 * 64 + 12);
        assert_eq!(std::mem::size_of::<WaterPush>(), 3 * 64 + 12 + 4);
        assert_eq!(std::mem::size_of::<SdfFontVertPush>(), 64 + 16);
        assert_eq!(std::mem::size_of::<ImGuiPush>(), 64);
    }

    #[test]
    fn vertex_attributes_fit_inside_their_stride() {
        for effect in RenderEffect::ALL.iter() {
            let layout = effect.spec().es_vertex;
            let stride = layout.stride();
            for attr in layout.attributes().iter() {
                assert!(
                    attr.offset < stride,
                    "{:?} attribute offset {} outside stride {}",
                    effect,
                    attr.offset,
                    stride
                );
            }
        }
    }

    #[test]
    fn tessellated_effects_declare_patch_sizes() {
        for effect in RenderEffect::ALL.iter() {
            let spec = effect.spec();
            match spec.es_stages {
                StageSet::VertTescTeseFrag => {
                    assert!(spec.es_patch_control_points > 0);
                    assert_eq!(spec.es_topology, vk::PrimitiveTopology::PATCH_LIST);
                }
                StageSet::VertFrag => assert_eq!(spec.es_patch_control_points, 0),
            }
        }
    }

    #[test]
    fn shadow_pipeline_is_the_only_shadow_pass_user() {
        for effect in RenderEffect::ALL.iter() {
            let is_shadow_target = effect.spec().es_target == PassKind::Shadowmap;
            assert_eq!(is_shadow_target, *effect == RenderEffect::Shadowmap);
        }
    }
}
