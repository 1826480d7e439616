//! Baked pipeline catalog.
//!
//! Every pipeline is described by [`PipelineDesc`], plain data derived from its
//! [`PipelineId`]: shader name, vertex input, fixed-function state, descriptor
//! sets and push constants. Render systems bake the descriptions they need.

use std::mem::size_of;

use ash::vk;
use lucre_core::constants::{SHADOW_DEPTH_BIAS_CONSTANT, SHADOW_DEPTH_BIAS_SLOPE};
use lucre_gpu::pipeline::DepthBias;
use lucre_gpu::{BlendMode, GraphicsPipeline, GraphicsPipelineConfig, ShaderCache};

use crate::error::{RenderError, Result};
use crate::layouts::DescriptorLayouts;
use crate::model::Vertex;
use crate::render_pass::{
    bloom_pass_desc, gui_pass_desc, post_process_pass_desc, scene_pass_desc, subpass,
    RenderPassGraph,
};
use crate::systems::gui::GuiVertex;

/// Where in the frame a pipeline (and the system owning it) runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Shadow,
    Geometry,
    Lighting,
    Transparency,
    /// Emission down/up-sampling; records its own render passes.
    Bloom,
    PostProcess,
    Gui,
}

impl Stage {
    /// Recording order within a frame.
    pub const ORDER: [Self; 7] = [
        Self::Shadow,
        Self::Geometry,
        Self::Lighting,
        Self::Transparency,
        Self::Bloom,
        Self::PostProcess,
        Self::Gui,
    ];

    /// Whether the scheduler begins a render pass around this stage.
    pub fn in_scene_pass(self) -> bool {
        matches!(self, Self::Geometry | Self::Lighting | Self::Transparency)
    }

    /// Color attachments the stage's subpass writes.
    pub fn color_attachments(self) -> u32 {
        match self {
            Self::Shadow => 0,
            Self::Geometry => {
                scene_pass_desc(&placeholder_formats()).color_count(subpass::GEOMETRY)
            }
            Self::Lighting | Self::Transparency => {
                scene_pass_desc(&placeholder_formats()).color_count(subpass::LIGHTING)
            }
            Self::Bloom => {
                bloom_pass_desc(vk::AttachmentLoadOp::CLEAR).color_count(subpass::BLOOM)
            }
            Self::PostProcess => post_process_pass_desc(&placeholder_formats()).color_count(0),
            Self::Gui => gui_pass_desc(&placeholder_formats()).color_count(0),
        }
    }

    /// Whether the stage's subpass has a depth attachment.
    pub fn has_depth(self) -> bool {
        matches!(
            self,
            Self::Shadow | Self::Geometry | Self::Lighting | Self::Transparency
        )
    }
}

fn placeholder_formats() -> crate::render_pass::PassFormats {
    crate::render_pass::PassFormats {
        output: vk::Format::B8G8R8A8_SRGB,
        depth: vk::Format::D32_SFLOAT,
        output_layout: vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

/// The baked pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineId {
    Pbr,
    PbrInstanced,
    PbrBindless,
    Grass,
    Shadow,
    ShadowAnimated,
    ShadowInstanced,
    DeferredLighting,
    PointLight,
    Cubemap,
    SkyboxHdri,
    Water,
    Sprite,
    Debug,
    BloomDown,
    BloomUp,
    PostProcessingBloom,
    Sprite2D,
    Gui,
}

impl PipelineId {
    pub const ALL: [Self; 19] = [
        Self::Pbr,
        Self::PbrInstanced,
        Self::PbrBindless,
        Self::Grass,
        Self::Shadow,
        Self::ShadowAnimated,
        Self::ShadowInstanced,
        Self::DeferredLighting,
        Self::PointLight,
        Self::Cubemap,
        Self::SkyboxHdri,
        Self::Water,
        Self::Sprite,
        Self::Debug,
        Self::BloomDown,
        Self::BloomUp,
        Self::PostProcessingBloom,
        Self::Sprite2D,
        Self::Gui,
    ];

    /// Base name of the SPIR-V files (`<name>.vert.spv`, `<name>.frag.spv`).
    pub fn shader(self) -> &'static str {
        match self {
            Self::Pbr => "pbr",
            Self::PbrInstanced => "pbr_instanced",
            Self::PbrBindless => "pbr_bindless",
            Self::Grass => "grass",
            Self::Shadow => "shadow",
            Self::ShadowAnimated => "shadow_animated",
            Self::ShadowInstanced => "shadow_instanced",
            Self::DeferredLighting => "deferred_lighting",
            Self::PointLight => "point_light",
            Self::Cubemap => "cubemap",
            Self::SkyboxHdri => "skybox_hdri",
            Self::Water => "water",
            Self::Sprite => "sprite",
            Self::Debug => "debug",
            Self::BloomDown => "bloom_down",
            Self::BloomUp => "bloom_up",
            Self::PostProcessingBloom => "post_processing_bloom",
            Self::Sprite2D => "sprite_2d",
            Self::Gui => "gui",
        }
    }

    /// Render pass and subpass the pipeline is baked against.
    pub fn target(self, passes: &RenderPassGraph) -> (vk::RenderPass, u32) {
        match self.stage() {
            Stage::Shadow => (passes.shadow, subpass::SHADOW),
            Stage::Geometry => (passes.scene, subpass::GEOMETRY),
            Stage::Lighting => (passes.scene, subpass::LIGHTING),
            Stage::Transparency => (passes.scene, subpass::TRANSPARENCY),
            Stage::Bloom if self == Self::BloomUp => (passes.bloom_up, subpass::BLOOM),
            Stage::Bloom => (passes.bloom_down, subpass::BLOOM),
            Stage::PostProcess => (passes.post_process, subpass::BLOOM),
            Stage::Gui => (passes.gui, subpass::GUI),
        }
    }

    pub fn stage(self) -> Stage {
        match self {
            Self::Pbr | Self::PbrInstanced | Self::PbrBindless | Self::Grass => Stage::Geometry,
            Self::Shadow | Self::ShadowAnimated | Self::ShadowInstanced => Stage::Shadow,
            Self::DeferredLighting | Self::PointLight => Stage::Lighting,
            Self::Cubemap | Self::SkyboxHdri | Self::Water | Self::Sprite | Self::Debug => {
                Stage::Transparency
            }
            Self::BloomDown | Self::BloomUp => Stage::Bloom,
            Self::PostProcessingBloom => Stage::PostProcess,
            Self::Sprite2D | Self::Gui => Stage::Gui,
        }
    }
}

/// Vertex streams a pipeline consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexInput {
    /// No vertex buffers: full-screen passes and bindless geometry.
    None,
    /// The model [`Vertex`] stream.
    Mesh,
    /// [`Vertex`] plus the per-instance matrices.
    Instanced,
    /// [`GuiVertex`].
    Gui,
}

impl VertexInput {
    pub fn bindings(self) -> Vec<vk::VertexInputBindingDescription> {
        match self {
            Self::None => Vec::new(),
            Self::Mesh => Vertex::bindings(),
            Self::Instanced => Vertex::instanced_bindings(),
            Self::Gui => GuiVertex::bindings(),
        }
    }

    pub fn attributes(self) -> Vec<vk::VertexInputAttributeDescription> {
        match self {
            Self::None => Vec::new(),
            Self::Mesh => Vertex::attributes(),
            Self::Instanced => Vertex::instanced_attributes(),
            Self::Gui => GuiVertex::attributes(),
        }
    }
}

/// Descriptor set kinds, resolved to layouts at bake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetKind {
    Global,
    Material,
    Storage,
    Lighting,
    SingleTexture,
    Post,
    Water,
    Ibl,
    BindlessTextures,
}

impl SetKind {
    fn layout(
        self,
        layouts: &DescriptorLayouts,
        bindless: Option<vk::DescriptorSetLayout>,
    ) -> Result<vk::DescriptorSetLayout> {
        Ok(match self {
            Self::Global => layouts.global,
            Self::Material => layouts.material,
            Self::Storage => layouts.storage,
            Self::Lighting => layouts.lighting,
            Self::SingleTexture => layouts.single_texture,
            Self::Post => layouts.post,
            Self::Water => layouts.water,
            Self::Ibl => layouts.ibl,
            Self::BindlessTextures => bindless.ok_or_else(|| {
                RenderError::Gpu(lucre_gpu::GpuError::CapabilityMissing(
                    "bindless descriptor indexing".to_string(),
                ))
            })?,
        })
    }
}

/// `{model, normal}` for classical geometry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MeshPushConstants {
    pub model: [[f32; 4]; 4],
    pub normal: [[f32; 4]; 4],
}

/// Bindless geometry: the vertex buffer is read through its device address.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BindlessPushConstants {
    pub model: [[f32; 4]; 4],
    pub vertex_address: u64,
    pub material_index: u32,
    /// Vertex fetch flags; bit 0 selects skinning.
    pub vertex_ctrl: u32,
}

/// Light-space matrix and model matrix for depth-only draws.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ShadowPushConstants {
    pub light_view_projection: [[f32; 4]; 4],
    pub model: [[f32; 4]; 4],
}

/// One point light volume.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PointLightPushConstants {
    /// xyz position, w radius.
    pub position_radius: [f32; 4],
    /// rgb color, a intensity.
    pub color_intensity: [f32; 4],
}

/// Model matrix plus a color, for sprites and debug geometry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TintedPushConstants {
    pub model: [[f32; 4]; 4],
    pub tint: [f32; 4],
}

/// Small scalar payload shared by full-screen passes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ScalarPushConstants {
    pub values: [f32; 4],
}

/// Which pipeline state a [`PipelineId`] is baked with.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDesc {
    pub id: PipelineId,
    pub vertex_input: VertexInput,
    pub has_fragment: bool,
    pub blend: BlendMode,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub cull_mode: vk::CullModeFlags,
    pub depth_bias: Option<DepthBias>,
    pub sets: Vec<SetKind>,
    pub push_constant_size: u32,
    pub push_constant_stages: vk::ShaderStageFlags,
}

fn push_size<T>() -> u32 {
    size_of::<T>() as u32
}

impl PipelineDesc {
    /// Description of a pipeline.
    pub fn of(id: PipelineId) -> Self {
        use SetKind::{
            BindlessTextures, Global, Ibl, Lighting, Material, Post, SingleTexture, Storage, Water,
        };

        let vertex = vk::ShaderStageFlags::VERTEX;
        let both = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
        let fragment = vk::ShaderStageFlags::FRAGMENT;

        let base = Self {
            id,
            vertex_input: VertexInput::Mesh,
            has_fragment: true,
            blend: BlendMode::Opaque,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS,
            cull_mode: vk::CullModeFlags::BACK,
            depth_bias: None,
            sets: vec![Global, Material],
            push_constant_size: push_size::<MeshPushConstants>(),
            push_constant_stages: vertex,
        };
        let shadow_bias = Some(DepthBias {
            constant: SHADOW_DEPTH_BIAS_CONSTANT,
            slope: SHADOW_DEPTH_BIAS_SLOPE,
        });
        let fullscreen = Self {
            vertex_input: VertexInput::None,
            depth_test: false,
            depth_write: false,
            cull_mode: vk::CullModeFlags::NONE,
            ..base.clone()
        };
        let transparent = Self {
            blend: BlendMode::AlphaBlend,
            depth_write: false,
            ..base.clone()
        };
        let sky = Self {
            depth_write: false,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            cull_mode: vk::CullModeFlags::NONE,
            push_constant_size: 0,
            ..base.clone()
        };

        match id {
            PipelineId::Pbr => base,
            PipelineId::PbrInstanced => Self {
                vertex_input: VertexInput::Instanced,
                push_constant_size: 0,
                ..base
            },
            PipelineId::PbrBindless => Self {
                vertex_input: VertexInput::None,
                sets: vec![Global, BindlessTextures, Storage],
                push_constant_size: push_size::<BindlessPushConstants>(),
                push_constant_stages: both,
                ..base
            },
            PipelineId::Grass => Self {
                vertex_input: VertexInput::Instanced,
                cull_mode: vk::CullModeFlags::NONE,
                push_constant_size: push_size::<ScalarPushConstants>(),
                ..base
            },
            PipelineId::Shadow => Self {
                has_fragment: false,
                depth_bias: shadow_bias,
                sets: vec![Global],
                push_constant_size: push_size::<ShadowPushConstants>(),
                ..base
            },
            PipelineId::ShadowAnimated => Self {
                has_fragment: false,
                depth_bias: shadow_bias,
                sets: vec![Global, Storage],
                push_constant_size: push_size::<ShadowPushConstants>(),
                ..base
            },
            PipelineId::ShadowInstanced => Self {
                vertex_input: VertexInput::Instanced,
                has_fragment: false,
                depth_bias: shadow_bias,
                sets: vec![Global],
                push_constant_size: push_size::<ShadowPushConstants>(),
                ..base
            },
            PipelineId::DeferredLighting => Self {
                sets: vec![Global, Lighting, Ibl],
                push_constant_size: push_size::<ScalarPushConstants>(),
                push_constant_stages: fragment,
                ..fullscreen
            },
            PipelineId::PointLight => Self {
                blend: BlendMode::Additive,
                sets: vec![Global, Lighting],
                push_constant_size: push_size::<PointLightPushConstants>(),
                push_constant_stages: both,
                ..fullscreen
            },
            PipelineId::Cubemap => Self {
                sets: vec![Global, SingleTexture],
                ..sky
            },
            PipelineId::SkyboxHdri => Self {
                sets: vec![Global, Ibl],
                ..sky
            },
            PipelineId::Water => Self {
                sets: vec![Global, Water],
                push_constant_stages: both,
                ..transparent
            },
            PipelineId::Sprite => Self {
                cull_mode: vk::CullModeFlags::NONE,
                push_constant_size: push_size::<TintedPushConstants>(),
                push_constant_stages: both,
                ..transparent
            },
            PipelineId::Debug => Self {
                depth_test: false,
                cull_mode: vk::CullModeFlags::NONE,
                sets: vec![Global],
                push_constant_size: push_size::<TintedPushConstants>(),
                push_constant_stages: both,
                ..transparent
            },
            PipelineId::BloomDown => Self {
                sets: vec![SingleTexture],
                push_constant_size: push_size::<ScalarPushConstants>(),
                push_constant_stages: fragment,
                ..fullscreen
            },
            PipelineId::BloomUp => Self {
                blend: BlendMode::Additive,
                sets: vec![SingleTexture],
                push_constant_size: push_size::<ScalarPushConstants>(),
                push_constant_stages: fragment,
                ..fullscreen
            },
            PipelineId::PostProcessingBloom => Self {
                sets: vec![Post],
                push_constant_size: push_size::<ScalarPushConstants>(),
                push_constant_stages: fragment,
                ..fullscreen
            },
            PipelineId::Sprite2D => Self {
                vertex_input: VertexInput::Mesh,
                blend: BlendMode::AlphaBlend,
                sets: vec![Material],
                push_constant_size: push_size::<TintedPushConstants>(),
                push_constant_stages: both,
                ..fullscreen
            },
            PipelineId::Gui => Self {
                vertex_input: VertexInput::Gui,
                blend: BlendMode::AlphaBlend,
                sets: vec![SingleTexture],
                push_constant_size: push_size::<ScalarPushConstants>(),
                push_constant_stages: vertex,
                ..fullscreen
            },
        }
    }

    /// Push-constant ranges (empty when the pipeline has none).
    pub fn push_constant_ranges(&self) -> Vec<vk::PushConstantRange> {
        if self.push_constant_size == 0 {
            return Vec::new();
        }
        vec![vk::PushConstantRange::default()
            .stage_flags(self.push_constant_stages)
            .offset(0)
            .size(self.push_constant_size)]
    }

    /// Fixed-function configuration for `passes`, without shader modules.
    pub fn config(&self, passes: &RenderPassGraph) -> GraphicsPipelineConfig {
        let stage = self.id.stage();
        let (render_pass, subpass) = self.id.target(passes);
        let mut config = GraphicsPipelineConfig::default()
            .target(render_pass, subpass)
            .vertex_input(self.vertex_input.bindings(), self.vertex_input.attributes())
            .depth(
                self.depth_test && stage.has_depth(),
                self.depth_write && stage.has_depth(),
            )
            .blend(self.blend, stage.color_attachments())
            .cull(self.cull_mode);
        config.depth_compare = self.depth_compare;
        config.depth_bias = self.depth_bias;
        config
    }

    /// Bake the pipeline.
    ///
    /// # Safety
    /// The device, passes, and layouts must be valid.
    pub unsafe fn bake(
        &self,
        device: &ash::Device,
        shaders: &mut ShaderCache,
        passes: &RenderPassGraph,
        layouts: &DescriptorLayouts,
        bindless: Option<vk::DescriptorSetLayout>,
    ) -> Result<GraphicsPipeline> {
        let set_layouts = self
            .sets
            .iter()
            .map(|set| set.layout(layouts, bindless))
            .collect::<Result<Vec<_>>>()?;

        let (vertex, fragment) = if self.has_fragment {
            let (v, f) = shaders.load_pair(device, self.id.shader())?;
            (v, Some(f))
        } else {
            (
                shaders.load(device, self.id.shader(), lucre_gpu::ShaderStage::Vertex)?,
                None,
            )
        };

        let config = self.config(passes).shaders(vertex, fragment);
        let pipeline =
            GraphicsPipeline::new(device, &config, &set_layouts, &self.push_constant_ranges())?;
        tracing::debug!("Baked pipeline {:?}", self.id);
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lucre_gpu::pipeline::push_constant_bytes;
    use lucre_core::constants::MAX_PUSH_CONSTANT_BYTES;

    #[test]
    fn every_pipeline_fits_the_push_constant_budget() {
        for id in PipelineId::ALL {
            let desc = PipelineDesc::of(id);
            assert!(
                push_constant_bytes(&desc.push_constant_ranges()) <= MAX_PUSH_CONSTANT_BYTES,
                "{id:?}"
            );
        }
    }

    #[test]
    fn bindless_pipeline_has_no_vertex_bindings() {
        let desc = PipelineDesc::of(PipelineId::PbrBindless);
        assert_eq!(desc.vertex_input, VertexInput::None);
        assert!(desc.vertex_input.bindings().is_empty());
        assert!(desc.sets.contains(&SetKind::BindlessTextures));
    }

    #[test]
    fn mesh_pipelines_use_the_model_vertex_layout() {
        let mesh_attributes = Vertex::attributes();
        for id in PipelineId::ALL {
            let desc = PipelineDesc::of(id);
            if matches!(desc.vertex_input, VertexInput::Mesh | VertexInput::Instanced) {
                let attributes = desc.vertex_input.attributes();
                assert_eq!(&attributes[..mesh_attributes.len()], &mesh_attributes[..], "{id:?}");
            }
        }
    }

    #[test]
    fn shadow_pipelines_are_depth_only_with_bias() {
        for id in [
            PipelineId::Shadow,
            PipelineId::ShadowAnimated,
            PipelineId::ShadowInstanced,
        ] {
            let desc = PipelineDesc::of(id);
            assert!(!desc.has_fragment);
            let bias = desc.depth_bias.unwrap();
            assert_eq!((bias.constant, bias.slope), (8.0, 3.0));
            assert_eq!(id.stage().color_attachments(), 0);
        }
    }

    #[test]
    fn transparency_pipelines_never_write_depth() {
        for id in PipelineId::ALL {
            if id.stage() == Stage::Transparency {
                assert!(!PipelineDesc::of(id).depth_write, "{id:?}");
            }
        }
        assert_eq!(PipelineDesc::of(PipelineId::Water).blend, BlendMode::AlphaBlend);
    }

    #[test]
    fn geometry_pipelines_write_the_whole_gbuffer() {
        assert_eq!(Stage::Geometry.color_attachments(), 5);
        assert_eq!(Stage::Lighting.color_attachments(), 1);
        assert_eq!(Stage::Gui.color_attachments(), 1);
    }

    #[test]
    fn bloom_up_adds_onto_the_finer_mip() {
        assert_eq!(PipelineDesc::of(PipelineId::BloomUp).blend, BlendMode::Additive);
        assert_eq!(PipelineDesc::of(PipelineId::BloomDown).blend, BlendMode::Opaque);
    }

    #[test]
    fn stages_are_recorded_in_pass_order() {
        let mut sorted = Stage::ORDER;
        sorted.sort();
        assert_eq!(sorted, Stage::ORDER);
    }

    #[test]
    fn default_state_matches_the_deferred_pbr_pipeline() {
        let desc = PipelineDesc::of(PipelineId::Pbr);
        assert_eq!(desc.cull_mode, vk::CullModeFlags::BACK);
        assert_eq!(desc.depth_compare, vk::CompareOp::LESS);
        assert!(desc.depth_test && desc.depth_write);
        assert_eq!(desc.push_constant_size, 128);
    }
}
