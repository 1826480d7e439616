//! Lighting subpass: resolves the G-buffer into scene color.

use ash::vk;
use lucre_core::constants::MAX_LIGHTS;
use lucre_entity::{gather_directional_lights, gather_point_lights, GatheredPointLight};
use lucre_gpu::{DescriptorWriter, GraphicsPipeline};

use super::{
    bind_pipeline, bind_sets, draw_fullscreen, push, FrameContext, RenderSystem, SceneView,
    SystemContext,
};
use crate::error::Result;
use crate::pipelines::{PipelineId, PointLightPushConstants, ScalarPushConstants, Stage};

/// Allocate this frame's G-buffer input attachment set.
///
/// # Safety
/// The frame's descriptor pool and targets must be valid.
unsafe fn gbuffer_set(frame: &FrameContext<'_>) -> Result<vk::DescriptorSet> {
    let set = frame.allocate_set(frame.layouts.lighting)?;
    let mut writer = DescriptorWriter::new();
    for (binding, view) in frame.targets.scene.gbuffer_views().into_iter().enumerate() {
        writer.input_attachment(
            set,
            binding as u32,
            view,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
    }
    writer.flush(frame.gpu);
    Ok(set)
}

/// Ambient, directional, and image-based lighting in one full-screen pass.
pub struct DeferredLightingSystem {
    pipeline: GraphicsPipeline,
}

impl DeferredLightingSystem {
    /// # Safety
    /// See [`SystemContext::bake`].
    pub unsafe fn new(ctx: &mut SystemContext<'_>) -> Result<Self> {
        Ok(Self {
            pipeline: ctx.bake(PipelineId::DeferredLighting)?,
        })
    }
}

impl RenderSystem for DeferredLightingSystem {
    fn name(&self) -> &'static str {
        "deferred_lighting"
    }

    fn stage(&self) -> Stage {
        Stage::Lighting
    }

    unsafe fn record(&mut self, frame: &FrameContext<'_>, scene: &mut SceneView<'_>) -> Result<()> {
        let device = frame.device();
        let lighting = gbuffer_set(frame)?;
        let shadowed = gather_directional_lights(scene.world)
            .iter()
            .filter(|light| light.shadow_map.is_some())
            .count();

        bind_pipeline(device, frame.cmd, &self.pipeline, frame.extent);
        bind_sets(
            device,
            frame.cmd,
            &self.pipeline,
            0,
            &[frame.global_set, lighting, scene.resources.ibl_set()],
        );
        let constants = ScalarPushConstants {
            values: [
                if scene.resources.ibl.is_some() { 1.0 } else { 0.0 },
                shadowed as f32,
                0.0,
                0.0,
            ],
        };
        push(
            device,
            frame.cmd,
            &self.pipeline,
            vk::ShaderStageFlags::FRAGMENT,
            &constants,
        );
        draw_fullscreen(device, frame.cmd);
        Ok(())
    }

    unsafe fn destroy(&mut self, device: &ash::Device) {
        self.pipeline.destroy(device);
    }
}

/// Point light contributions, additively blended one light at a time.
pub struct PointLightSystem {
    pipeline: GraphicsPipeline,
}

impl PointLightSystem {
    /// # Safety
    /// See [`SystemContext::bake`].
    pub unsafe fn new(ctx: &mut SystemContext<'_>) -> Result<Self> {
        Ok(Self {
            pipeline: ctx.bake(PipelineId::PointLight)?,
        })
    }
}

/// Push payload for one light.
pub fn point_light_constants(light: &GatheredPointLight) -> PointLightPushConstants {
    PointLightPushConstants {
        position_radius: light.position.extend(light.radius).to_array(),
        color_intensity: light.color.extend(light.intensity).to_array(),
    }
}

impl RenderSystem for PointLightSystem {
    fn name(&self) -> &'static str {
        "point_lights"
    }

    fn stage(&self) -> Stage {
        Stage::Lighting
    }

    unsafe fn record(&mut self, frame: &FrameContext<'_>, scene: &mut SceneView<'_>) -> Result<()> {
        let lights = gather_point_lights(scene.world);
        if lights.is_empty() {
            return Ok(());
        }
        let device = frame.device();
        let lighting = gbuffer_set(frame)?;

        bind_pipeline(device, frame.cmd, &self.pipeline, frame.extent);
        bind_sets(device, frame.cmd, &self.pipeline, 0, &[frame.global_set, lighting]);
        let stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
        for light in lights.iter().take(MAX_LIGHTS) {
            push(device, frame.cmd, &self.pipeline, stages, &point_light_constants(light));
            draw_fullscreen(device, frame.cmd);
        }
        Ok(())
    }

    unsafe fn destroy(&mut self, device: &ash::Device) {
        self.pipeline.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn point_light_payload_packs_radius_and_intensity() {
        let light = GatheredPointLight {
            position: Vec3::new(1.0, 2.0, 3.0),
            color: Vec3::new(0.5, 0.25, 1.0),
            intensity: 4.0,
            radius: 10.0,
        };
        let constants = point_light_constants(&light);
        assert_eq!(constants.position_radius, [1.0, 2.0, 3.0, 10.0]);
        assert_eq!(constants.color_intensity, [0.5, 0.25, 1.0, 4.0]);
    }
}
