//! Render systems: one per family of draws, each owning its pipelines.
//!
//! A system records into the stage it declares. The scheduler begins the
//! render pass (and subpass) for every stage except [`Stage::Bloom`], whose
//! system walks the emission mip chain with its own passes.

pub mod bloom;
pub mod geometry;
pub mod gui;
pub mod lighting;
pub mod shadow;
pub mod transparency;

use ash::vk;
use glam::Mat4;
use lucre_entity::World;
use lucre_gpu::{DescriptorPool, GpuDevice, GraphicsPipeline, SamplerRegistry, ShaderCache};

use crate::camera::Camera;
use crate::error::Result;
use crate::layouts::DescriptorLayouts;
use crate::pipelines::{PipelineDesc, PipelineId, Stage};
use crate::render_pass::RenderPassGraph;
use crate::resources::SceneResources;
use crate::targets::RenderTargets;

/// The shadow map currently being rendered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowView {
    pub index: usize,
    pub light_view_projection: Mat4,
    pub extent: vk::Extent2D,
}

/// Per-frame state handed to every system.
#[derive(Clone, Copy)]
pub struct FrameContext<'a> {
    pub gpu: &'a GpuDevice,
    pub cmd: vk::CommandBuffer,
    /// In-flight slot, in `[0, MAX_FRAMES_IN_FLIGHT)`.
    pub frame_index: usize,
    pub image_index: u32,
    pub global_set: vk::DescriptorSet,
    pub camera: &'a Camera,
    /// Seconds since the previous frame.
    pub timestep: f32,
    /// Seconds since the renderer started.
    pub time: f32,
    pub extent: vk::Extent2D,
    /// Reset when this slot comes around again.
    pub descriptors: &'a DescriptorPool,
    pub samplers: &'a SamplerRegistry,
    pub layouts: &'a DescriptorLayouts,
    pub passes: &'a RenderPassGraph,
    pub targets: &'a RenderTargets,
    /// Set during the shadow stage only.
    pub shadow: Option<ShadowView>,
    pub bindless_set: Option<vk::DescriptorSet>,
}

impl FrameContext<'_> {
    pub fn device(&self) -> &ash::Device {
        self.gpu.device()
    }

    /// Allocate a set that lives until this frame slot is recorded again.
    ///
    /// # Safety
    /// The layout must be valid.
    pub unsafe fn allocate_set(&self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        Ok(self.descriptors.allocate_one(self.gpu, layout)?)
    }
}

/// The world and the resources its entities reference.
pub struct SceneView<'a> {
    pub world: &'a World,
    pub resources: &'a mut SceneResources,
}

/// Everything needed to bake pipelines.
pub struct SystemContext<'a> {
    pub device: &'a ash::Device,
    pub shaders: &'a mut ShaderCache,
    pub passes: &'a RenderPassGraph,
    pub layouts: &'a DescriptorLayouts,
    /// Layout of the bindless texture table, when supported.
    pub bindless: Option<vk::DescriptorSetLayout>,
}

impl SystemContext<'_> {
    /// Bake one pipeline.
    ///
    /// # Safety
    /// The device, passes, and layouts must be valid.
    pub unsafe fn bake(&mut self, id: PipelineId) -> Result<GraphicsPipeline> {
        PipelineDesc::of(id).bake(
            self.device,
            self.shaders,
            self.passes,
            self.layouts,
            self.bindless,
        )
    }
}

/// A family of draws recorded into one stage.
pub trait RenderSystem: Send {
    fn name(&self) -> &'static str;

    fn stage(&self) -> Stage;

    /// Record this frame's draws. Draw order follows entity query order.
    ///
    /// # Safety
    /// The command buffer must be recording inside the stage's subpass (or
    /// outside any render pass for [`Stage::Bloom`]).
    unsafe fn record(&mut self, frame: &FrameContext<'_>, scene: &mut SceneView<'_>) -> Result<()>;

    /// Destroy owned pipelines.
    ///
    /// # Safety
    /// The device must be idle.
    unsafe fn destroy(&mut self, device: &ash::Device);
}

/// Bind `pipeline` with dynamic viewport and scissor covering `extent`.
///
/// # Safety
/// The command buffer must be recording.
pub unsafe fn bind_pipeline(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    pipeline: &GraphicsPipeline,
    extent: vk::Extent2D,
) {
    pipeline.bind(device, cmd);
    lucre_gpu::pipeline::set_viewport_and_scissor(device, cmd, extent);
}

/// Bind descriptor sets starting at set 0.
///
/// # Safety
/// The command buffer must be recording with a compatible pipeline bound.
pub unsafe fn bind_sets(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    pipeline: &GraphicsPipeline,
    first_set: u32,
    sets: &[vk::DescriptorSet],
) {
    device.cmd_bind_descriptor_sets(
        cmd,
        vk::PipelineBindPoint::GRAPHICS,
        pipeline.layout,
        first_set,
        sets,
        &[],
    );
}

/// Push a Pod payload at offset 0.
///
/// # Safety
/// The command buffer must be recording with a compatible pipeline bound.
pub unsafe fn push<T: bytemuck::Pod>(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    pipeline: &GraphicsPipeline,
    stages: vk::ShaderStageFlags,
    data: &T,
) {
    device.cmd_push_constants(cmd, pipeline.layout, stages, 0, bytemuck::bytes_of(data));
}

/// Draw a full-screen triangle (vertices generated in the shader).
///
/// # Safety
/// The command buffer must be recording inside a render pass.
pub unsafe fn draw_fullscreen(device: &ash::Device, cmd: vk::CommandBuffer) {
    device.cmd_draw(cmd, 3, 1, 0, 0);
}

/// Build the standard set of systems, in declaration order per stage.
///
/// # Safety
/// The device, passes, and layouts must be valid.
pub unsafe fn default_systems(ctx: &mut SystemContext<'_>) -> Result<Vec<Box<dyn RenderSystem>>> {
    let mut systems: Vec<Box<dyn RenderSystem>> = vec![
        Box::new(shadow::ShadowSystem::new(ctx)?),
        Box::new(geometry::PbrSystem::new(ctx)?),
        Box::new(geometry::InstancedSystem::pbr(ctx)?),
    ];
    if ctx.bindless.is_some() {
        systems.push(Box::new(geometry::BindlessSystem::new(ctx)?));
    } else {
        tracing::info!("Bindless unavailable, skipping the bindless PBR system");
    }
    systems.extend([
        Box::new(geometry::InstancedSystem::grass(ctx)?) as Box<dyn RenderSystem>,
        Box::new(lighting::DeferredLightingSystem::new(ctx)?),
        Box::new(lighting::PointLightSystem::new(ctx)?),
        Box::new(transparency::SkySystem::new(ctx)?),
        Box::new(transparency::WaterSystem::new(ctx)?),
        Box::new(transparency::SpriteSystem::new(ctx)?),
        Box::new(transparency::DebugSystem::new(ctx)?),
        Box::new(bloom::BloomSystem::new(ctx)?),
        Box::new(bloom::CompositeSystem::new(ctx)?),
        Box::new(gui::Sprite2DSystem::new(ctx)?),
        Box::new(gui::GuiSystem::new(ctx)?),
    ]);
    Ok(systems)
}
