//! Depth-only shadow map rendering.

use ash::vk;
use glam::Mat4;
use lucre_entity::{shadow_casters, DrawItem};
use lucre_gpu::GraphicsPipeline;

use super::geometry::{group_items, update_instances};
use super::{bind_pipeline, bind_sets, push, FrameContext, RenderSystem, SceneView, SystemContext};
use crate::arena::Handle;
use crate::error::Result;
use crate::pipelines::{PipelineId, ShadowPushConstants, Stage};

/// Draws every shadow caster into the shadow map named by
/// [`FrameContext::shadow`], once per shadow-casting light.
pub struct ShadowSystem {
    static_pipeline: GraphicsPipeline,
    instanced_pipeline: GraphicsPipeline,
    animated_pipeline: GraphicsPipeline,
}

impl ShadowSystem {
    /// # Safety
    /// See [`SystemContext::bake`].
    pub unsafe fn new(ctx: &mut SystemContext<'_>) -> Result<Self> {
        Ok(Self {
            static_pipeline: ctx.bake(PipelineId::Shadow)?,
            instanced_pipeline: ctx.bake(PipelineId::ShadowInstanced)?,
            animated_pipeline: ctx.bake(PipelineId::ShadowAnimated)?,
        })
    }
}

/// Split casters into static and skinned draws; instanced casters are grouped separately.
fn partition(casters: &[DrawItem]) -> (Vec<DrawItem>, Vec<DrawItem>) {
    casters
        .iter()
        .filter(|item| item.instance.is_none())
        .partition(|item| !item.skinned)
}

impl RenderSystem for ShadowSystem {
    fn name(&self) -> &'static str {
        "shadow"
    }

    fn stage(&self) -> Stage {
        Stage::Shadow
    }

    unsafe fn record(&mut self, frame: &FrameContext<'_>, scene: &mut SceneView<'_>) -> Result<()> {
        let Some(view) = frame.shadow else {
            return Ok(());
        };
        let casters = shadow_casters(scene.world);
        let groups = group_items(casters.iter().copied());
        if !groups.is_empty() {
            update_instances(scene.resources, &groups, frame.frame_index)?;
        }
        let (statics, skinned) = partition(&casters);

        let device = frame.device();
        let cmd = frame.cmd;
        let resources = &*scene.resources;
        let light = view.light_view_projection.to_cols_array_2d();
        let stages = vk::ShaderStageFlags::VERTEX;

        // 1. Static meshes
        if !statics.is_empty() {
            bind_pipeline(device, cmd, &self.static_pipeline, view.extent);
            bind_sets(device, cmd, &self.static_pipeline, 0, &[frame.global_set]);
            for item in &statics {
                let model = resources.model(item.model)?;
                let constants = ShadowPushConstants {
                    light_view_projection: light,
                    model: item.transform.matrix().to_cols_array_2d(),
                };
                push(device, cmd, &self.static_pipeline, stages, &constants);
                model.bind(device, cmd);
                for submesh in &model.submeshes {
                    model.draw_submesh(device, cmd, submesh, 1);
                }
            }
        }

        // 2. Instanced meshes; the instance stream carries the model matrix
        if !groups.is_empty() {
            bind_pipeline(device, cmd, &self.instanced_pipeline, view.extent);
            bind_sets(device, cmd, &self.instanced_pipeline, 0, &[frame.global_set]);
            let constants = ShadowPushConstants {
                light_view_projection: light,
                model: Mat4::IDENTITY.to_cols_array_2d(),
            };
            push(device, cmd, &self.instanced_pipeline, stages, &constants);
            for group in &groups {
                let Some(buffer) = resources.instance_buffers.get(Handle::from_raw(group.buffer))
                else {
                    continue;
                };
                let model = resources.model(group.model)?;
                model.bind(device, cmd);
                buffer.bind(device, cmd, frame.frame_index);
                for submesh in &model.submeshes {
                    model.draw_submesh(device, cmd, submesh, buffer.len() as u32);
                }
            }
        }

        // 3. Skinned meshes read the joint palette from set 1
        if !skinned.is_empty() {
            bind_pipeline(device, cmd, &self.animated_pipeline, view.extent);
            bind_sets(
                device,
                cmd,
                &self.animated_pipeline,
                0,
                &[frame.global_set, resources.joints.set],
            );
            for item in &skinned {
                let model = resources.model(item.model)?;
                let constants = ShadowPushConstants {
                    light_view_projection: light,
                    model: item.transform.matrix().to_cols_array_2d(),
                };
                push(device, cmd, &self.animated_pipeline, stages, &constants);
                model.bind(device, cmd);
                for submesh in &model.submeshes {
                    model.draw_submesh(device, cmd, submesh, 1);
                }
            }
        }

        tracing::trace!(
            "Shadow map {}: {} static, {} instanced groups, {} skinned",
            view.index,
            statics.len(),
            groups.len(),
            skinned.len()
        );
        Ok(())
    }

    unsafe fn destroy(&mut self, device: &ash::Device) {
        self.static_pipeline.destroy(device);
        self.instanced_pipeline.destroy(device);
        self.animated_pipeline.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use lucre_entity::{InstanceTag, MaterialTag, MeshComponent, Skinned, Transform, World};

    #[test]
    fn casters_split_by_skinning_and_instancing() {
        let mut world = World::new();
        let t = Transform::from_position(Vec3::ZERO);
        world.spawn((t, MeshComponent { model: 0 }, MaterialTag::Pbr));
        world.spawn((t, MeshComponent { model: 1 }, MaterialTag::Pbr, Skinned));
        world.spawn((
            t,
            MeshComponent { model: 2 },
            MaterialTag::Grass,
            InstanceTag { buffer: 0, index: 0 },
        ));
        world.spawn((t, MeshComponent { model: 3 }, MaterialTag::Water));

        let casters = shadow_casters(&world);
        let (statics, skinned) = partition(&casters);
        assert_eq!(statics.len(), 1);
        assert_eq!(statics[0].model, 0);
        assert_eq!(skinned.len(), 1);
        assert_eq!(skinned[0].model, 1);
        assert_eq!(group_items(casters.iter().copied()).len(), 1);
    }
}
