//! Geometry subpass systems: deferred PBR (single and multi-material,
//! terrain), instanced PBR and grass, and bindless PBR.

use ash::vk;
use lucre_entity::{draw_items, DrawItem, MaterialTag, World};
use lucre_gpu::GraphicsPipeline;

use super::{bind_pipeline, bind_sets, push, FrameContext, RenderSystem, SceneView, SystemContext};
use crate::arena::Handle;
use crate::error::Result;
use crate::instance::InstanceBuffer;
use crate::model::{MaterialRef, Model, Submesh};
use crate::pipelines::{
    BindlessPushConstants, MeshPushConstants, PipelineDesc, PipelineId, ScalarPushConstants, Stage,
};
use crate::resources::SceneResources;

/// Tags drawn by the deferred PBR pipelines, in draw order.
pub const PBR_TAGS: [MaterialTag; 3] = [
    MaterialTag::Pbr,
    MaterialTag::PbrMultiMaterial,
    MaterialTag::Terrain,
];

fn material_set(resources: &SceneResources, submesh: &Submesh) -> Result<vk::DescriptorSet> {
    let material = match submesh.material {
        Some(MaterialRef::Classical(handle)) => Some(handle),
        Some(MaterialRef::Bindless(_)) | None => None,
    };
    resources.material_set(material)
}

/// Bind the model and draw every submesh with its material in set 1.
///
/// # Safety
/// A pipeline with the global set bound must be active.
unsafe fn draw_model(
    frame: &FrameContext<'_>,
    pipeline: &GraphicsPipeline,
    resources: &SceneResources,
    model: &Model,
    instance_count: u32,
) -> Result<()> {
    let device = frame.device();
    model.bind(device, frame.cmd);
    for submesh in &model.submeshes {
        let set = material_set(resources, submesh)?;
        bind_sets(device, frame.cmd, pipeline, 1, &[set]);
        model.draw_submesh(device, frame.cmd, submesh, instance_count);
    }
    Ok(())
}

/// Deferred PBR for non-instanced entities.
pub struct PbrSystem {
    pipeline: GraphicsPipeline,
    push_stages: vk::ShaderStageFlags,
}

impl PbrSystem {
    /// # Safety
    /// See [`SystemContext::bake`].
    pub unsafe fn new(ctx: &mut SystemContext<'_>) -> Result<Self> {
        Ok(Self {
            pipeline: ctx.bake(PipelineId::Pbr)?,
            push_stages: PipelineDesc::of(PipelineId::Pbr).push_constant_stages,
        })
    }
}

impl RenderSystem for PbrSystem {
    fn name(&self) -> &'static str {
        "pbr"
    }

    fn stage(&self) -> Stage {
        Stage::Geometry
    }

    unsafe fn record(&mut self, frame: &FrameContext<'_>, scene: &mut SceneView<'_>) -> Result<()> {
        let device = frame.device();
        let resources = &*scene.resources;
        bind_pipeline(device, frame.cmd, &self.pipeline, frame.extent);
        bind_sets(device, frame.cmd, &self.pipeline, 0, &[frame.global_set]);

        for tag in PBR_TAGS {
            for item in draw_items(scene.world, tag) {
                if item.instance.is_some() {
                    continue;
                }
                let model = resources.model(item.model)?;
                let constants = MeshPushConstants {
                    model: item.transform.matrix().to_cols_array_2d(),
                    normal: item.transform.normal_matrix().to_cols_array_2d(),
                };
                push(device, frame.cmd, &self.pipeline, self.push_stages, &constants);
                draw_model(frame, &self.pipeline, resources, model, 1)?;
            }
        }
        Ok(())
    }

    unsafe fn destroy(&mut self, device: &ash::Device) {
        self.pipeline.destroy(device);
    }
}

/// Entities sharing one instance buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceGroup {
    pub buffer: u32,
    /// Model of the first entity; every instance draws it.
    pub model: u32,
    pub items: Vec<DrawItem>,
}

/// Group instanced entities by buffer, in first-seen order.
pub fn group_instances(world: &World, tags: &[MaterialTag]) -> Vec<InstanceGroup> {
    group_items(tags.iter().flat_map(|&tag| draw_items(world, tag)))
}

/// Group already-gathered items by instance buffer; non-instanced items are dropped.
pub fn group_items(items: impl IntoIterator<Item = DrawItem>) -> Vec<InstanceGroup> {
    let mut groups: Vec<InstanceGroup> = Vec::new();
    for item in items {
        let Some(instance) = item.instance else {
            continue;
        };
        match groups.iter_mut().find(|g| g.buffer == instance.buffer) {
            Some(group) => group.items.push(item),
            None => groups.push(InstanceGroup {
                buffer: instance.buffer,
                model: item.model,
                items: vec![item],
            }),
        }
    }
    groups
}

/// Write each group's transforms into its instance buffer and flush the copy
/// owned by `slot`.
pub(crate) fn update_instances(
    resources: &mut SceneResources,
    groups: &[InstanceGroup],
    slot: usize,
) -> Result<()> {
    for group in groups {
        let handle: Handle<InstanceBuffer> = Handle::from_raw(group.buffer);
        let buffer = resources.instance_buffers.get_mut(handle).ok_or_else(|| {
            crate::error::RenderError::StaleHandle(format!("instance buffer {}", group.buffer))
        })?;
        for item in &group.items {
            if let Some(instance) = item.instance {
                buffer.set_instance(instance.index as usize, &item.transform);
            }
        }
        buffer.update(slot)?;
    }
    Ok(())
}

/// Instanced draws: PBR meshes or grass.
pub struct InstancedSystem {
    name: &'static str,
    tags: &'static [MaterialTag],
    pipeline: GraphicsPipeline,
    wind: bool,
}

impl InstancedSystem {
    /// Instanced deferred PBR.
    ///
    /// # Safety
    /// See [`SystemContext::bake`].
    pub unsafe fn pbr(ctx: &mut SystemContext<'_>) -> Result<Self> {
        Ok(Self {
            name: "pbr_instanced",
            tags: &PBR_TAGS,
            pipeline: ctx.bake(PipelineId::PbrInstanced)?,
            wind: false,
        })
    }

    /// Instanced grass blades swaying with the elapsed time.
    ///
    /// # Safety
    /// See [`SystemContext::bake`].
    pub unsafe fn grass(ctx: &mut SystemContext<'_>) -> Result<Self> {
        Ok(Self {
            name: "grass",
            tags: &[MaterialTag::Grass],
            pipeline: ctx.bake(PipelineId::Grass)?,
            wind: true,
        })
    }
}

impl RenderSystem for InstancedSystem {
    fn name(&self) -> &'static str {
        self.name
    }

    fn stage(&self) -> Stage {
        Stage::Geometry
    }

    unsafe fn record(&mut self, frame: &FrameContext<'_>, scene: &mut SceneView<'_>) -> Result<()> {
        let groups = group_instances(scene.world, self.tags);
        if groups.is_empty() {
            return Ok(());
        }
        update_instances(scene.resources, &groups, frame.frame_index)?;

        let device = frame.device();
        let resources = &*scene.resources;
        bind_pipeline(device, frame.cmd, &self.pipeline, frame.extent);
        bind_sets(device, frame.cmd, &self.pipeline, 0, &[frame.global_set]);
        if self.wind {
            let wind = ScalarPushConstants {
                values: [frame.time, 1.0, 0.0, 0.0],
            };
            push(device, frame.cmd, &self.pipeline, vk::ShaderStageFlags::VERTEX, &wind);
        }

        for group in &groups {
            let Some(buffer) = resources.instance_buffers.get(Handle::from_raw(group.buffer)) else {
                continue;
            };
            let model = resources.model(group.model)?;
            buffer.bind(device, frame.cmd, frame.frame_index);
            draw_model(frame, &self.pipeline, resources, model, buffer.len() as u32)?;
        }
        Ok(())
    }

    unsafe fn destroy(&mut self, device: &ash::Device) {
        self.pipeline.destroy(device);
    }
}

/// Deferred PBR reading vertices by device address and textures by bindless index.
pub struct BindlessSystem {
    pipeline: GraphicsPipeline,
    push_stages: vk::ShaderStageFlags,
}

impl BindlessSystem {
    /// # Safety
    /// See [`SystemContext::bake`]; the context must carry a bindless layout.
    pub unsafe fn new(ctx: &mut SystemContext<'_>) -> Result<Self> {
        Ok(Self {
            pipeline: ctx.bake(PipelineId::PbrBindless)?,
            push_stages: PipelineDesc::of(PipelineId::PbrBindless).push_constant_stages,
        })
    }
}

impl RenderSystem for BindlessSystem {
    fn name(&self) -> &'static str {
        "pbr_bindless"
    }

    fn stage(&self) -> Stage {
        Stage::Geometry
    }

    unsafe fn record(&mut self, frame: &FrameContext<'_>, scene: &mut SceneView<'_>) -> Result<()> {
        let items = draw_items(scene.world, MaterialTag::PbrBindless);
        let (Some(bindless_set), false) = (frame.bindless_set, items.is_empty()) else {
            return Ok(());
        };
        let Some(table) = scene.resources.material_table.as_mut() else {
            return Ok(());
        };
        table.update()?;
        let table_set = table.set;

        let device = frame.device();
        let resources = &*scene.resources;
        bind_pipeline(device, frame.cmd, &self.pipeline, frame.extent);
        bind_sets(
            device,
            frame.cmd,
            &self.pipeline,
            0,
            &[frame.global_set, bindless_set, table_set],
        );

        for item in items {
            let model = resources.model(item.model)?;
            let Some(vertex_address) = model.vertex_address() else {
                tracing::debug!("Model {} has no device address, skipped", item.model);
                continue;
            };
            if let Some(index) = &model.index_buffer {
                device.cmd_bind_index_buffer(frame.cmd, index.buffer, index.offset, vk::IndexType::UINT32);
            }
            for submesh in &model.submeshes {
                let material_index = match submesh.material {
                    Some(MaterialRef::Bindless(index)) => index,
                    _ => 0,
                };
                let constants = BindlessPushConstants {
                    model: item.transform.matrix().to_cols_array_2d(),
                    vertex_address,
                    material_index,
                    vertex_ctrl: u32::from(item.skinned),
                };
                push(device, frame.cmd, &self.pipeline, self.push_stages, &constants);
                model.draw_submesh(device, frame.cmd, submesh, 1);
            }
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
    use lucre_entity::{InstanceTag, MeshComponent, Transform};

    fn spawn(world: &mut World, tag: MaterialTag, model: u32, instance: Option<(u32, u32)>) {
        let transform = Transform::from_position(Vec3::new(model as f32, 0.0, 0.0));
        let entity = world.spawn((transform, MeshComponent { model }, tag));
        if let Some((buffer, index)) = instance {
            world
                .insert_one(entity, InstanceTag { buffer, index })
                .unwrap();
        }
    }

    #[test]
    fn instances_group_by_buffer_in_first_seen_order() {
        let mut world = World::new();
        spawn(&mut world, MaterialTag::Pbr, 4, Some((1, 0)));
        spawn(&mut world, MaterialTag::Pbr, 5, Some((0, 0)));
        spawn(&mut world, MaterialTag::Pbr, 4, Some((1, 1)));
        spawn(&mut world, MaterialTag::Pbr, 9, None);

        let groups = group_instances(&world, &PBR_TAGS);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].buffer, 1);
        assert_eq!(groups[0].model, 4);
        assert_eq!(groups[0].items.len(), 2);
        assert_eq!(groups[1].buffer, 0);
    }

    #[test]
    fn grass_groups_ignore_pbr_entities() {
        let mut world = World::new();
        spawn(&mut world, MaterialTag::Pbr, 1, Some((0, 0)));
        spawn(&mut world, MaterialTag::Grass, 2, Some((3, 0)));

        let groups = group_instances(&world, &[MaterialTag::Grass]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].buffer, 3);
    }
}
