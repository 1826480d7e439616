//! Transparency subpass: sky, water, sprites, and debug geometry.
//!
//! Everything here reads depth but never writes it.

use ash::vk;
use glam::{Mat4, Vec3};
use lucre_entity::{draw_items, gather_point_lights, MaterialTag};
use lucre_gpu::{DescriptorWriter, GraphicsPipeline, MemoryUsage};

use super::{bind_pipeline, bind_sets, push, FrameContext, RenderSystem, SceneView, SystemContext};
use crate::camera::Camera;
use crate::error::Result;
use crate::model::{MaterialRef, Model};
use crate::pipelines::{MeshPushConstants, PipelineId, Stage, TintedPushConstants};
use crate::resources::{SceneResources, WaterParams};

const BOTH: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::VERTEX.as_raw() | vk::ShaderStageFlags::FRAGMENT.as_raw(),
);

unsafe fn draw_all_submeshes(frame: &FrameContext<'_>, model: &Model) {
    let device = frame.device();
    model.bind(device, frame.cmd);
    for submesh in &model.submeshes {
        model.draw_submesh(device, frame.cmd, submesh, 1);
    }
}

/// Which sky a frame draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkyKind {
    Cubemap,
    Hdri,
}

/// Pick the sky: an explicit tag wins, then a loaded environment, then a cubemap.
pub fn choose_sky(
    tagged_cubemap: bool,
    tagged_hdri: bool,
    has_ibl: bool,
    has_cubemap: bool,
) -> Option<SkyKind> {
    if tagged_hdri && has_ibl {
        Some(SkyKind::Hdri)
    } else if tagged_cubemap && has_cubemap {
        Some(SkyKind::Cubemap)
    } else if has_ibl {
        Some(SkyKind::Hdri)
    } else if has_cubemap {
        Some(SkyKind::Cubemap)
    } else {
        None
    }
}

/// Sky box behind everything already in the depth buffer.
pub struct SkySystem {
    cubemap: GraphicsPipeline,
    hdri: GraphicsPipeline,
}

impl SkySystem {
    /// # Safety
    /// See [`SystemContext::bake`].
    pub unsafe fn new(ctx: &mut SystemContext<'_>) -> Result<Self> {
        Ok(Self {
            cubemap: ctx.bake(PipelineId::Cubemap)?,
            hdri: ctx.bake(PipelineId::SkyboxHdri)?,
        })
    }
}

impl RenderSystem for SkySystem {
    fn name(&self) -> &'static str {
        "sky"
    }

    fn stage(&self) -> Stage {
        Stage::Transparency
    }

    unsafe fn record(&mut self, frame: &FrameContext<'_>, scene: &mut SceneView<'_>) -> Result<()> {
        let resources = &*scene.resources;
        let cubemap_items = draw_items(scene.world, MaterialTag::Cubemap);
        let hdri_items = draw_items(scene.world, MaterialTag::SkyboxHdri);
        let kind = choose_sky(
            !cubemap_items.is_empty(),
            !hdri_items.is_empty(),
            resources.ibl.is_some(),
            resources.cubemap.is_some(),
        );

        let (pipeline, set, items) = match (kind, resources.cubemap) {
            (Some(SkyKind::Hdri), _) => (&self.hdri, resources.ibl_set(), hdri_items),
            (Some(SkyKind::Cubemap), Some(sky)) => (&self.cubemap, sky.set, cubemap_items),
            _ => return Ok(()),
        };

        let model = match items.first() {
            Some(item) => resources.model(item.model)?,
            None => match resources.skybox {
                Some(handle) => resources.model(handle.index())?,
                None => return Ok(()),
            },
        };

        let device = frame.device();
        bind_pipeline(device, frame.cmd, pipeline, frame.extent);
        bind_sets(device, frame.cmd, pipeline, 0, &[frame.global_set, set]);
        draw_all_submeshes(frame, model);
        Ok(())
    }

    unsafe fn destroy(&mut self, device: &ash::Device) {
        self.cubemap.destroy(device);
        self.hdri.destroy(device);
    }
}

/// Alpha-blended water surfaces.
pub struct WaterSystem {
    pipeline: GraphicsPipeline,
}

impl WaterSystem {
    /// # Safety
    /// See [`SystemContext::bake`].
    pub unsafe fn new(ctx: &mut SystemContext<'_>) -> Result<Self> {
        Ok(Self {
            pipeline: ctx.bake(PipelineId::Water)?,
        })
    }

    /// Allocate this frame's water set. The uniform buffer is retired
    /// immediately; it lives until this frame slot comes around again.
    unsafe fn frame_set(
        frame: &FrameContext<'_>,
        resources: &SceneResources,
    ) -> Result<vk::DescriptorSet> {
        let mut params: WaterParams = resources.water;
        params.wave[3] = frame.time;

        let set = frame.allocate_set(frame.layouts.water)?;
        let view = resources.texture_view_or_white(resources.water_texture)?;
        let buffer = frame.gpu.create_buffer(
            std::mem::size_of::<WaterParams>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryUsage::HostVisible,
            "water_params",
        )?;
        let written = buffer.write(&[params]);
        if written.is_ok() {
            DescriptorWriter::new()
                .uniform_buffer(set, 0, buffer.descriptor_info())
                .sampled_image(
                    set,
                    1,
                    view,
                    resources.sampler(),
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )
                .flush(frame.gpu);
        }
        frame.gpu.free_buffer(buffer);
        written?;
        Ok(set)
    }
}

impl RenderSystem for WaterSystem {
    fn name(&self) -> &'static str {
        "water"
    }

    fn stage(&self) -> Stage {
        Stage::Transparency
    }

    unsafe fn record(&mut self, frame: &FrameContext<'_>, scene: &mut SceneView<'_>) -> Result<()> {
        let items = draw_items(scene.world, MaterialTag::Water);
        if items.is_empty() {
            return Ok(());
        }
        let resources = &*scene.resources;
        let set = Self::frame_set(frame, resources)?;

        let device = frame.device();
        bind_pipeline(device, frame.cmd, &self.pipeline, frame.extent);
        bind_sets(device, frame.cmd, &self.pipeline, 0, &[frame.global_set, set]);
        for item in items {
            let model = resources.model(item.model)?;
            let constants = MeshPushConstants {
                model: item.transform.matrix().to_cols_array_2d(),
                normal: item.transform.normal_matrix().to_cols_array_2d(),
            };
            push(device, frame.cmd, &self.pipeline, BOTH, &constants);
            draw_all_submeshes(frame, model);
        }
        Ok(())
    }

    unsafe fn destroy(&mut self, device: &ash::Device) {
        self.pipeline.destroy(device);
    }
}

/// Model matrix of a quad at `position` facing the camera.
pub fn billboard_matrix(camera: &Camera, position: Vec3, size: f32) -> Mat4 {
    let (_, rotation, _) = camera.inverse_view_matrix().to_scale_rotation_translation();
    Mat4::from_scale_rotation_translation(Vec3::splat(size), rotation, position)
}

/// Textured, tinted sprites; optionally a billboard at every point light.
pub struct SpriteSystem {
    pipeline: GraphicsPipeline,
}

impl SpriteSystem {
    /// # Safety
    /// See [`SystemContext::bake`].
    pub unsafe fn new(ctx: &mut SystemContext<'_>) -> Result<Self> {
        Ok(Self {
            pipeline: ctx.bake(PipelineId::Sprite)?,
        })
    }

    unsafe fn draw(
        &self,
        frame: &FrameContext<'_>,
        resources: &SceneResources,
        model: &Model,
        matrix: Mat4,
        tint: [f32; 4],
    ) -> Result<()> {
        let device = frame.device();
        let constants = TintedPushConstants {
            model: matrix.to_cols_array_2d(),
            tint,
        };
        push(device, frame.cmd, &self.pipeline, BOTH, &constants);
        model.bind(device, frame.cmd);
        for submesh in &model.submeshes {
            let material = match submesh.material {
                Some(MaterialRef::Classical(handle)) => Some(handle),
                _ => None,
            };
            let set = resources.material_set(material)?;
            bind_sets(device, frame.cmd, &self.pipeline, 1, &[set]);
            model.draw_submesh(device, frame.cmd, submesh, 1);
        }
        Ok(())
    }
}

impl RenderSystem for SpriteSystem {
    fn name(&self) -> &'static str {
        "sprites"
    }

    fn stage(&self) -> Stage {
        Stage::Transparency
    }

    unsafe fn record(&mut self, frame: &FrameContext<'_>, scene: &mut SceneView<'_>) -> Result<()> {
        let items = draw_items(scene.world, MaterialTag::Sprite);
        let lights = if scene.resources.light_billboards {
            gather_point_lights(scene.world)
        } else {
            Vec::new()
        };
        if items.is_empty() && lights.is_empty() {
            return Ok(());
        }

        let resources = &*scene.resources;
        let device = frame.device();
        bind_pipeline(device, frame.cmd, &self.pipeline, frame.extent);
        bind_sets(device, frame.cmd, &self.pipeline, 0, &[frame.global_set]);

        for item in items {
            let model = resources.model(item.model)?;
            self.draw(frame, resources, model, item.transform.matrix(), [1.0; 4])?;
        }

        let quad = resources.model(resources.quad.index())?;
        for light in lights {
            let matrix = billboard_matrix(frame.camera, light.position, 0.25);
            self.draw(frame, resources, quad, matrix, light.color.extend(1.0).to_array())?;
        }
        Ok(())
    }

    unsafe fn destroy(&mut self, device: &ash::Device) {
        self.pipeline.destroy(device);
    }
}

/// Flat-colored overlay geometry drawn without depth testing.
pub struct DebugSystem {
    pipeline: GraphicsPipeline,
    tint: [f32; 4],
}

impl DebugSystem {
    /// # Safety
    /// See [`SystemContext::bake`].
    pub unsafe fn new(ctx: &mut SystemContext<'_>) -> Result<Self> {
        Ok(Self {
            pipeline: ctx.bake(PipelineId::Debug)?,
            tint: [0.0, 1.0, 0.0, 0.5],
        })
    }
}

impl RenderSystem for DebugSystem {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn stage(&self) -> Stage {
        Stage::Transparency
    }

    unsafe fn record(&mut self, frame: &FrameContext<'_>, scene: &mut SceneView<'_>) -> Result<()> {
        let items = draw_items(scene.world, MaterialTag::Debug);
        if items.is_empty() {
            return Ok(());
        }
        let resources = &*scene.resources;
        let device = frame.device();
        bind_pipeline(device, frame.cmd, &self.pipeline, frame.extent);
        bind_sets(device, frame.cmd, &self.pipeline, 0, &[frame.global_set]);
        for item in items {
            let model = resources.model(item.model)?;
            let constants = TintedPushConstants {
                model: item.transform.matrix().to_cols_array_2d(),
                tint: self.tint,
            };
            push(device, frame.cmd, &self.pipeline, BOTH, &constants);
            draw_all_submeshes(frame, model);
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
    use approx::assert_relative_eq;

    #[test]
    fn loaded_environment_is_the_default_sky() {
        assert_eq!(choose_sky(false, false, true, true), Some(SkyKind::Hdri));
        assert_eq!(choose_sky(false, false, false, true), Some(SkyKind::Cubemap));
        assert_eq!(choose_sky(false, false, false, false), None);
    }

    #[test]
    fn tagged_cubemap_wins_over_environment() {
        assert_eq!(choose_sky(true, false, true, true), Some(SkyKind::Cubemap));
        // A tag without the matching resource falls back.
        assert_eq!(choose_sky(false, true, false, true), Some(SkyKind::Cubemap));
    }

    #[test]
    fn billboard_faces_the_camera() {
        let camera = Camera::perspective(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, 1.0, 1.0);
        let matrix = billboard_matrix(&camera, Vec3::new(1.0, 2.0, 3.0), 0.5);
        let normal = matrix.transform_vector3(Vec3::Z).normalize();
        assert_relative_eq!(normal.dot(Vec3::Z), 1.0, epsilon = 1e-5);
        assert_relative_eq!(matrix.w_axis.truncate().x, 1.0, epsilon = 1e-6);
    }
}
