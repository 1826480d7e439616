//! GPU resources referenced by the scene.
//!
//! Entities name models by raw arena index ([`lucre_entity::MeshComponent`]);
//! everything else is reached through typed [`Handle`]s. Teardown sweeps each
//! arena newest-first.

use ash::vk;
use glam::{Mat4, Vec3, Vec4};
use lucre_gpu::{
    AssetId, BindlessTable, Buffer, DescriptorWriter, GpuDevice, MemoryUsage, ResourcePools,
    SamplerKind, SamplerRegistry, UploadTicket,
};

use crate::arena::{Arena, Handle};
use crate::error::{RenderError, Result};
use crate::ibl::{skybox_builder, Ibl};
use crate::instance::InstanceBuffer;
use crate::layouts::{ibl_binding, DescriptorLayouts};
use crate::material::{DefaultTextures, Material, MaterialParams, MaterialTable, MaterialTextures};
use crate::model::{Builder, Model};
use crate::systems::gui::GuiDrawList;
use crate::texture::{upload_texture, DecodedImage, Texture};

/// Joint matrices available to skinned shadow casters.
pub const MAX_JOINTS: usize = 64;

/// Water surface parameters (set 1, binding 0 of the water pipeline).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct WaterParams {
    /// rgb tint, a opacity.
    pub color: [f32; 4],
    /// x amplitude, y frequency, z speed, w elapsed time.
    pub wave: [f32; 4],
}

impl Default for WaterParams {
    fn default() -> Self {
        Self {
            color: [0.1, 0.3, 0.5, 0.6],
            wave: [0.05, 2.0, 0.5, 0.0],
        }
    }
}

/// Sky drawn by the cubemap system.
#[derive(Debug, Clone, Copy)]
pub struct CubemapSky {
    pub texture: Handle<Texture>,
    pub set: vk::DescriptorSet,
}

/// Storage buffer of joint matrices (set 1 of the animated shadow pipeline).
#[derive(Debug)]
pub struct JointPalette {
    pub buffer: Buffer,
    pub set: vk::DescriptorSet,
}

impl JointPalette {
    /// Replace the joint matrices; missing joints stay identity.
    pub fn set_joints(&self, joints: &[Mat4]) -> Result<()> {
        let mut matrices = [Mat4::IDENTITY.to_cols_array_2d(); MAX_JOINTS];
        for (slot, joint) in matrices.iter_mut().zip(joints) {
            *slot = joint.to_cols_array_2d();
        }
        Ok(self.buffer.write(&matrices)?)
    }
}

/// Everything the render systems draw with.
#[derive(Debug)]
pub struct SceneResources {
    pub models: Arena<Model>,
    pub materials: Arena<Material>,
    pub textures: Arena<Texture>,
    pub instance_buffers: Arena<InstanceBuffer>,
    pub defaults: DefaultTextures,
    pub default_material: Handle<Material>,
    /// Unit quad facing `+Z`, used for sprites and light billboards.
    pub quad: Handle<Model>,
    pub material_table: Option<MaterialTable>,
    pub ibl: Option<Ibl>,
    /// IBL set bound when no environment is loaded.
    pub fallback_ibl: vk::DescriptorSet,
    pub skybox: Option<Handle<Model>>,
    pub cubemap: Option<CubemapSky>,
    pub water: WaterParams,
    pub water_texture: Option<Handle<Texture>>,
    pub joints: JointPalette,
    pub gui: GuiDrawList,
    /// rgb color, intensity.
    pub ambient: (Vec3, f32),
    pub bloom_strength: f32,
    pub exposure: f32,
    /// Draw a camera-facing quad at every point light.
    pub light_billboards: bool,
    pending: Vec<UploadTicket>,
    sampler: vk::Sampler,
}

impl SceneResources {
    /// Upload the default textures, the unit quad, and the default material.
    ///
    /// # Safety
    /// The calling thread must be registered in `pools`.
    pub unsafe fn new(
        gpu: &GpuDevice,
        pools: &ResourcePools,
        layouts: &DescriptorLayouts,
        samplers: &SamplerRegistry,
        bindless_capacity: Option<usize>,
    ) -> Result<Self> {
        let sampler = samplers.get(SamplerKind::LinearRepeat);
        let mut textures = Arena::new();
        let mut pending = Vec::new();

        let mut solid = |rgba: [u8; 4], srgb: bool, name: &str| -> Result<Handle<Texture>> {
            let (texture, ticket) = upload_texture(gpu, pools, &DecodedImage::solid(rgba), srgb, name)?;
            pending.push(ticket);
            Ok(textures.insert(texture))
        };
        let defaults = DefaultTextures {
            white: solid([255; 4], true, "default_white")?,
            flat_normal: solid([128, 128, 255, 255], false, "default_normal")?,
            black: solid([0, 0, 0, 255], true, "default_black")?,
        };

        let mut materials = Arena::new();
        let default_material = materials.insert(Material::new(
            gpu,
            pools,
            layouts.material,
            MaterialParams::default(),
            MaterialTextures::default(),
            &textures,
            &defaults,
            sampler,
        )?);

        let mut models = Arena::new();
        let quad_model = Model::upload(gpu, pools, &Builder::quad(1.0, 1.0, Vec4::ONE), "unit_quad")?;
        pending.push(quad_model.ticket);
        let quad = models.insert(quad_model);

        let material_table = match bindless_capacity {
            Some(capacity) => Some(MaterialTable::new(gpu, pools, layouts.storage, capacity)?),
            None => None,
        };

        let descriptor_pool = pools.descriptor_pool()?;
        let fallback_ibl = descriptor_pool.allocate_one(gpu, layouts.ibl)?;
        {
            let white = texture_view(&textures, defaults.white)?;
            let black = texture_view(&textures, defaults.black)?;
            let read_only = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
            DescriptorWriter::new()
                .sampled_image(fallback_ibl, ibl_binding::BRDF_LUT, white, sampler, read_only)
                .sampled_image(fallback_ibl, ibl_binding::ENVIRONMENT, black, sampler, read_only)
                .sampled_image(fallback_ibl, ibl_binding::DIFFUSE, black, sampler, read_only)
                .sampled_image(fallback_ibl, ibl_binding::SPECULAR, black, sampler, read_only)
                .flush(gpu);
        }

        let joint_buffer = gpu.create_buffer(
            (MAX_JOINTS * std::mem::size_of::<Mat4>()) as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryUsage::HostVisible,
            "joint_palette",
        )?;
        let joint_set = descriptor_pool.allocate_one(gpu, layouts.storage)?;
        DescriptorWriter::new()
            .storage_buffer(joint_set, 0, joint_buffer.descriptor_info())
            .flush(gpu);
        let joints = JointPalette {
            buffer: joint_buffer,
            set: joint_set,
        };
        joints.set_joints(&[])?;

        Ok(Self {
            models,
            materials,
            textures,
            instance_buffers: Arena::new(),
            defaults,
            default_material,
            quad,
            material_table,
            ibl: None,
            fallback_ibl,
            skybox: None,
            cubemap: None,
            water: WaterParams::default(),
            water_texture: None,
            joints,
            gui: GuiDrawList::default(),
            ambient: (Vec3::ONE, 0.1),
            bloom_strength: 0.04,
            exposure: 1.0,
            light_billboards: false,
            pending,
            sampler,
        })
    }

    /// Store an uploaded model. It is drawable once its ticket is waited on.
    pub fn add_model(&mut self, model: Model) -> Handle<Model> {
        self.pending.push(model.ticket);
        self.models.insert(model)
    }

    /// Upload `builder` and store the model.
    ///
    /// # Safety
    /// The calling thread must be registered in `pools`.
    pub unsafe fn upload_model(
        &mut self,
        gpu: &GpuDevice,
        pools: &ResourcePools,
        builder: &Builder,
        name: &str,
    ) -> Result<Handle<Model>> {
        let model = Model::upload(gpu, pools, builder, name)?;
        Ok(self.add_model(model))
    }

    /// Store a texture uploaded under `ticket`.
    pub fn add_texture(&mut self, texture: Texture, ticket: UploadTicket) -> Handle<Texture> {
        self.pending.push(ticket);
        self.textures.insert(texture)
    }

    /// Register a texture in the bindless table and remember its index.
    ///
    /// The index is sampleable once the table has been updated for a frame.
    pub fn register_bindless(
        &mut self,
        table: &BindlessTable,
        texture: Handle<Texture>,
    ) -> Result<u32> {
        let sampler = self.sampler;
        let entry = self
            .textures
            .get_mut(texture)
            .ok_or_else(|| stale("texture", texture.index()))?;
        let index = table.add(AssetId(u64::from(texture.index())), entry.view.view, sampler);
        entry.bindless_index = Some(index);
        Ok(index)
    }

    /// Fill the reserved bindless slot with `texture`.
    pub fn set_bindless_atlas(&mut self, table: &BindlessTable, texture: Handle<Texture>) -> Result<()> {
        let sampler = self.sampler;
        let entry = self
            .textures
            .get_mut(texture)
            .ok_or_else(|| stale("texture", texture.index()))?;
        table.registry().set_atlas(entry.view.view, sampler);
        entry.bindless_index = Some(lucre_core::constants::TEXTURE_ATLAS_INDEX);
        Ok(())
    }

    /// Create a classical material.
    ///
    /// # Safety
    /// The calling thread must be registered in `pools`.
    pub unsafe fn add_material(
        &mut self,
        gpu: &GpuDevice,
        pools: &ResourcePools,
        layouts: &DescriptorLayouts,
        params: MaterialParams,
        textures: MaterialTextures,
    ) -> Result<Handle<Material>> {
        let material = Material::new(
            gpu,
            pools,
            layouts.material,
            params,
            textures,
            &self.textures,
            &self.defaults,
            self.sampler,
        )?;
        Ok(self.materials.insert(material))
    }

    /// Append a bindless material; texture slots without a bindless index use
    /// the atlas slot.
    pub fn add_bindless_material(
        &mut self,
        params: MaterialParams,
        textures: MaterialTextures,
    ) -> Result<u32> {
        let indices = textures.slots().map(|slot| {
            slot.and_then(|h| self.textures.get(h))
                .and_then(|t| t.bindless_index)
                .unwrap_or(lucre_core::constants::TEXTURE_ATLAS_INDEX)
        });
        let table = self.material_table.as_mut().ok_or_else(|| {
            RenderError::Gpu(lucre_gpu::GpuError::CapabilityMissing(
                "bindless descriptor indexing".to_string(),
            ))
        })?;
        table.push(crate::material::BindlessMaterial {
            params: MaterialParams {
                texture_mask: textures.mask(),
                ..params
            },
            textures: indices,
        })
    }

    pub fn add_instance_buffer(&mut self, buffer: InstanceBuffer) -> Handle<InstanceBuffer> {
        self.instance_buffers.insert(buffer)
    }

    /// Install an environment; its skybox cube is uploaded as a model.
    ///
    /// # Safety
    /// The calling thread must be registered in `pools`.
    pub unsafe fn set_ibl(
        &mut self,
        gpu: &GpuDevice,
        pools: &ResourcePools,
        ibl: Ibl,
        ticket: UploadTicket,
    ) -> Result<()> {
        self.pending.push(ticket);
        let skybox = Model::upload(gpu, pools, &ibl.skybox, "skybox")?;
        self.skybox = Some(self.add_model(skybox));
        if let Some(old) = self.ibl.replace(ibl) {
            old.destroy(gpu);
        }
        Ok(())
    }

    /// Use a cube texture as the sky.
    ///
    /// # Safety
    /// The calling thread must be registered in `pools`.
    pub unsafe fn set_cubemap(
        &mut self,
        gpu: &GpuDevice,
        pools: &ResourcePools,
        layouts: &DescriptorLayouts,
        texture: Handle<Texture>,
    ) -> Result<()> {
        let view = texture_view(&self.textures, texture)?;
        let set = pools.descriptor_pool()?.allocate_one(gpu, layouts.single_texture)?;
        DescriptorWriter::new()
            .sampled_image(set, 0, view, self.sampler, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .flush(gpu);
        if self.skybox.is_none() {
            let model = Model::upload(gpu, pools, &skybox_builder(), "skybox")?;
            self.skybox = Some(self.add_model(model));
        }
        self.cubemap = Some(CubemapSky { texture, set });
        Ok(())
    }

    /// The IBL set to bind: the loaded environment or the fallback.
    pub fn ibl_set(&self) -> vk::DescriptorSet {
        self.ibl
            .as_ref()
            .map_or(self.fallback_ibl, |ibl| ibl.descriptor.set)
    }

    /// Model referenced by an entity.
    pub fn model(&self, raw: u32) -> Result<&Model> {
        self.models
            .get(Handle::from_raw(raw))
            .ok_or_else(|| stale("model", raw))
    }

    /// Material set for a classical material, or the default material.
    pub fn material_set(&self, material: Option<Handle<Material>>) -> Result<vk::DescriptorSet> {
        let handle = material.unwrap_or(self.default_material);
        self.materials
            .get(handle)
            .map(|m| m.set)
            .ok_or_else(|| stale("material", handle.index()))
    }

    /// View of a texture, or the white default.
    pub fn texture_view_or_white(&self, texture: Option<Handle<Texture>>) -> Result<vk::ImageView> {
        texture_view(&self.textures, texture.unwrap_or(self.defaults.white))
    }

    /// Sampler used for material and sprite textures.
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    /// Uploads not yet waited on.
    pub fn pending_uploads(&self) -> usize {
        self.pending.len()
    }

    /// Block until every pending upload has landed.
    ///
    /// Tickets from one thread share a semaphore, so only the highest value per
    /// semaphore is waited on.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait_for_uploads(&mut self, device: &ash::Device) -> Result<()> {
        for ticket in latest_per_semaphore(&self.pending) {
            ticket.wait(device)?;
        }
        self.pending.clear();
        Ok(())
    }

    /// Destroy everything, newest first.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(mut self, gpu: &GpuDevice) {
        if let Some(ibl) = self.ibl.take() {
            ibl.destroy(gpu);
        }
        if let Some(table) = self.material_table.take() {
            table.destroy(gpu);
        }
        gpu.free_buffer(self.joints.buffer);
        for buffer in self.instance_buffers.drain_reverse() {
            buffer.destroy(gpu);
        }
        for material in self.materials.drain_reverse() {
            material.destroy(gpu);
        }
        for model in self.models.drain_reverse() {
            model.destroy(gpu);
        }
        for texture in self.textures.drain_reverse() {
            texture.destroy(gpu);
        }
    }
}

fn stale(kind: &str, index: u32) -> RenderError {
    RenderError::StaleHandle(format!("{kind} {index}"))
}

fn texture_view(textures: &Arena<Texture>, handle: Handle<Texture>) -> Result<vk::ImageView> {
    textures
        .get(handle)
        .map(|t| t.view.view)
        .ok_or_else(|| stale("texture", handle.index()))
}

/// Keep the highest-valued ticket of each semaphore.
pub fn latest_per_semaphore(tickets: &[UploadTicket]) -> Vec<UploadTicket> {
    let mut latest: hashbrown::HashMap<vk::Semaphore, UploadTicket> = hashbrown::HashMap::new();
    for ticket in tickets {
        if ticket.is_ready_trivially() {
            continue;
        }
        latest
            .entry(ticket.semaphore.semaphore)
            .and_modify(|t| {
                if ticket.value > t.value {
                    *t = *ticket;
                }
            })
            .or_insert(*ticket);
    }
    latest.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle as _;
    use lucre_gpu::TimelineSemaphore;

    fn ticket(semaphore: u64, value: u64) -> UploadTicket {
        UploadTicket {
            semaphore: TimelineSemaphore {
                semaphore: vk::Semaphore::from_raw(semaphore),
            },
            value,
        }
    }

    #[test]
    fn only_the_latest_ticket_per_semaphore_is_waited_on() {
        let mut latest = latest_per_semaphore(&[
            ticket(1, 3),
            ticket(2, 1),
            ticket(1, 7),
            ticket(1, 5),
        ]);
        latest.sort_by_key(|t| t.semaphore.semaphore.as_raw());
        assert_eq!(latest, vec![ticket(1, 7), ticket(2, 1)]);
    }

    #[test]
    fn ready_tickets_are_skipped() {
        assert!(latest_per_semaphore(&[UploadTicket::ready()]).is_empty());
    }

    #[test]
    fn water_params_are_two_vec4s() {
        assert_eq!(std::mem::size_of::<WaterParams>(), 32);
    }
}
