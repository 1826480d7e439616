//! PBR materials: classical per-material descriptor sets and the bindless
//! material table.

use ash::vk;
use glam::{Vec3, Vec4};
use lucre_gpu::{Buffer, DescriptorWriter, GpuDevice, MemoryUsage, ResourcePools};

use crate::arena::{Arena, Handle};
use crate::error::{RenderError, Result};
use crate::layouts::material_binding;
use crate::texture::Texture;

/// Texture slot bits in [`MaterialParams::texture_mask`].
pub mod texture_bit {
    pub const BASE_COLOR: u32 = 1 << 0;
    pub const NORMAL: u32 = 1 << 1;
    pub const METALLIC_ROUGHNESS: u32 = 1 << 2;
    pub const EMISSIVE: u32 = 1 << 3;
}

/// Material factors as seen by shaders (std140).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MaterialParams {
    pub base_color_factor: [f32; 4],
    /// RGB emissive color, A = strength.
    pub emissive_factor: [f32; 4],
    pub roughness: f32,
    pub metallic: f32,
    pub normal_scale: f32,
    /// Which texture slots hold real textures.
    pub texture_mask: u32,
}

impl Default for MaterialParams {
    fn default() -> Self {
        Self {
            base_color_factor: [1.0; 4],
            emissive_factor: [0.0, 0.0, 0.0, 1.0],
            roughness: 1.0,
            metallic: 0.0,
            normal_scale: 1.0,
            texture_mask: 0,
        }
    }
}

impl MaterialParams {
    pub fn with_base_color(mut self, color: Vec4) -> Self {
        self.base_color_factor = color.to_array();
        self
    }

    pub fn with_emissive(mut self, color: Vec3, strength: f32) -> Self {
        self.emissive_factor = color.extend(strength).to_array();
        self
    }

    pub fn with_roughness_metallic(mut self, roughness: f32, metallic: f32) -> Self {
        self.roughness = roughness.clamp(0.0, 1.0);
        self.metallic = metallic.clamp(0.0, 1.0);
        self
    }

    /// Whether the material emits light (and so feeds bloom).
    pub fn is_emissive(&self) -> bool {
        let [r, g, b, strength] = self.emissive_factor;
        strength > 0.0 && (r > 0.0 || g > 0.0 || b > 0.0)
    }
}

/// Texture handles of a material. Missing slots use the default textures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterialTextures {
    pub base_color: Option<Handle<Texture>>,
    pub normal: Option<Handle<Texture>>,
    pub metallic_roughness: Option<Handle<Texture>>,
    pub emissive: Option<Handle<Texture>>,
}

impl MaterialTextures {
    /// Bitmask of populated slots.
    pub fn mask(&self) -> u32 {
        [
            (self.base_color, texture_bit::BASE_COLOR),
            (self.normal, texture_bit::NORMAL),
            (self.metallic_roughness, texture_bit::METALLIC_ROUGHNESS),
            (self.emissive, texture_bit::EMISSIVE),
        ]
        .into_iter()
        .filter(|(handle, _)| handle.is_some())
        .fold(0, |mask, (_, bit)| mask | bit)
    }

    /// Slots in binding order.
    pub fn slots(&self) -> [Option<Handle<Texture>>; 4] {
        [
            self.base_color,
            self.normal,
            self.metallic_roughness,
            self.emissive,
        ]
    }
}

/// Fallback textures bound in empty material slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultTextures {
    pub white: Handle<Texture>,
    pub flat_normal: Handle<Texture>,
    pub black: Handle<Texture>,
}

impl DefaultTextures {
    /// Fallback for each slot in binding order.
    pub fn slots(&self) -> [Handle<Texture>; 4] {
        [self.white, self.flat_normal, self.white, self.black]
    }
}

/// Resolve the four material slots to textures, substituting defaults.
pub fn resolve_textures(
    textures: &MaterialTextures,
    defaults: &DefaultTextures,
) -> [Handle<Texture>; 4] {
    let mut resolved = defaults.slots();
    for (slot, texture) in resolved.iter_mut().zip(textures.slots()) {
        if let Some(texture) = texture {
            *slot = texture;
        }
    }
    resolved
}

/// A material with its classical descriptor set (set 1 of the PBR pipelines).
#[derive(Debug)]
pub struct Material {
    pub params: MaterialParams,
    pub textures: MaterialTextures,
    pub uniform: Buffer,
    pub set: vk::DescriptorSet,
}

impl Material {
    /// Create the uniform buffer and descriptor set.
    ///
    /// The set comes from the calling thread's descriptor pool, which lives
    /// until teardown.
    ///
    /// # Safety
    /// The calling thread must be registered in `pools`; every referenced
    /// texture must be alive.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn new(
        gpu: &GpuDevice,
        pools: &ResourcePools,
        layout: vk::DescriptorSetLayout,
        params: MaterialParams,
        textures: MaterialTextures,
        texture_arena: &Arena<Texture>,
        defaults: &DefaultTextures,
        sampler: vk::Sampler,
    ) -> Result<Self> {
        let params = MaterialParams {
            texture_mask: textures.mask(),
            ..params
        };
        let uniform = gpu.create_buffer(
            std::mem::size_of::<MaterialParams>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryUsage::HostVisible,
            "material_params",
        )?;
        uniform.write(&[params])?;

        let set = pools.descriptor_pool()?.allocate_one(gpu, layout)?;
        let mut writer = DescriptorWriter::new();
        writer.uniform_buffer(set, material_binding::PARAMS, uniform.descriptor_info());
        for (binding, handle) in (material_binding::BASE_COLOR..).zip(resolve_textures(&textures, defaults)) {
            let texture = texture_arena
                .get(handle)
                .ok_or_else(|| RenderError::StaleHandle(format!("texture {}", handle.index())))?;
            writer.sampled_image(
                set,
                binding,
                texture.view.view,
                sampler,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        }
        writer.flush(gpu);

        Ok(Self {
            params,
            textures,
            uniform,
            set,
        })
    }

    /// Rewrite the factors.
    pub fn set_params(&mut self, params: MaterialParams) -> Result<()> {
        self.params = MaterialParams {
            texture_mask: self.params.texture_mask,
            ..params
        };
        Ok(self.uniform.write(&[self.params])?)
    }

    /// Retire the uniform buffer. The set is freed with its pool.
    pub fn destroy(self, gpu: &GpuDevice) {
        gpu.free_buffer(self.uniform);
    }
}

/// One entry of the bindless material table (std430).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BindlessMaterial {
    pub params: MaterialParams,
    /// Bindless texture indices; 0 is the atlas/default slot.
    pub textures: [u32; 4],
}

/// Materials addressed by index from bindless shaders.
#[derive(Debug)]
pub struct MaterialTable {
    records: Vec<BindlessMaterial>,
    capacity: usize,
    dirty: bool,
    pub buffer: Buffer,
    pub set: vk::DescriptorSet,
}

impl MaterialTable {
    /// Create a table of `capacity` materials bound through `layout`.
    ///
    /// # Safety
    /// The calling thread must be registered in `pools`.
    pub unsafe fn new(
        gpu: &GpuDevice,
        pools: &ResourcePools,
        layout: vk::DescriptorSetLayout,
        capacity: usize,
    ) -> Result<Self> {
        let buffer = gpu.create_buffer(
            (capacity.max(1) * std::mem::size_of::<BindlessMaterial>()) as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryUsage::HostVisible,
            "bindless_materials",
        )?;
        let set = pools.descriptor_pool()?.allocate_one(gpu, layout)?;
        DescriptorWriter::new()
            .storage_buffer(set, 0, buffer.descriptor_info())
            .flush(gpu);
        Ok(Self {
            records: Vec::new(),
            capacity,
            dirty: false,
            buffer,
            set,
        })
    }

    /// Append a material and return its index.
    pub fn push(&mut self, material: BindlessMaterial) -> Result<u32> {
        if self.records.len() >= self.capacity {
            return Err(RenderError::InvalidModel(format!(
                "bindless material table full ({} entries)",
                self.capacity
            )));
        }
        self.records.push(material);
        self.dirty = true;
        Ok((self.records.len() - 1) as u32)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Copy the table to the GPU if it changed.
    pub fn update(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        self.buffer.write(&self.records)?;
        self.dirty = false;
        Ok(true)
    }

    pub fn destroy(self, gpu: &GpuDevice) {
        gpu.free_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(index: u32) -> Handle<Texture> {
        Handle::from_raw(index)
    }

    #[test]
    fn params_are_std140_sized() {
        assert_eq!(std::mem::size_of::<MaterialParams>(), 48);
        assert_eq!(std::mem::size_of::<BindlessMaterial>(), 64);
    }

    #[test]
    fn mask_tracks_populated_slots() {
        let textures = MaterialTextures {
            base_color: Some(handle(4)),
            emissive: Some(handle(5)),
            ..Default::default()
        };
        assert_eq!(textures.mask(), texture_bit::BASE_COLOR | texture_bit::EMISSIVE);
        assert_eq!(MaterialTextures::default().mask(), 0);
    }

    #[test]
    fn empty_slots_fall_back_to_defaults() {
        let defaults = DefaultTextures {
            white: handle(0),
            flat_normal: handle(1),
            black: handle(2),
        };
        let textures = MaterialTextures {
            normal: Some(handle(7)),
            ..Default::default()
        };
        assert_eq!(
            resolve_textures(&textures, &defaults),
            [handle(0), handle(7), handle(0), handle(2)]
        );
    }

    #[test]
    fn emissive_needs_color_and_strength() {
        let params = MaterialParams::default();
        assert!(!params.is_emissive());
        assert!(params.with_emissive(Vec3::X, 2.0).is_emissive());
        assert!(!params.with_emissive(Vec3::X, 0.0).is_emissive());
    }

    #[test]
    fn roughness_and_metallic_are_clamped() {
        let params = MaterialParams::default().with_roughness_metallic(1.5, -0.2);
        assert_eq!((params.roughness, params.metallic), (1.0, 0.0));
    }
}
