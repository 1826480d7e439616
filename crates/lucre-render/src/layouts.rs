//! Descriptor set layouts shared across render systems.
//!
//! Set 0 is always the global set (frame uniforms plus shadow maps). Set 1
//! depends on the pipeline family; the bindless table is set 1 for the
//! bindless pipelines.

use ash::vk;
use lucre_core::constants::MAX_SHADOW_MAPS;
use lucre_gpu::{DescriptorSetLayoutBuilder, Result};

/// Binding slots of the global set.
pub mod global_binding {
    pub const UNIFORMS: u32 = 0;
    pub const SHADOW_MAPS: u32 = 1;
}

/// Binding slots of a classical material set.
pub mod material_binding {
    pub const PARAMS: u32 = 0;
    pub const BASE_COLOR: u32 = 1;
    pub const NORMAL: u32 = 2;
    pub const METALLIC_ROUGHNESS: u32 = 3;
    pub const EMISSIVE: u32 = 4;
}

/// Binding slots of the IBL set.
pub mod ibl_binding {
    pub const BRDF_LUT: u32 = 0;
    pub const ENVIRONMENT: u32 = 1;
    pub const DIFFUSE: u32 = 2;
    pub const SPECULAR: u32 = 3;
}

const VERTEX_FRAGMENT: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::VERTEX.as_raw() | vk::ShaderStageFlags::FRAGMENT.as_raw(),
);

/// Every classical set layout.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorLayouts {
    /// UBO + shadow map array.
    pub global: vk::DescriptorSetLayout,
    /// Material UBO + four textures.
    pub material: vk::DescriptorSetLayout,
    /// One storage buffer (instances, bindless materials).
    pub storage: vk::DescriptorSetLayout,
    /// Five G-buffer input attachments.
    pub lighting: vk::DescriptorSetLayout,
    /// One sampled texture.
    pub single_texture: vk::DescriptorSetLayout,
    /// Scene color and emission inputs of the composite pass.
    pub post: vk::DescriptorSetLayout,
    /// Water parameters + normal map.
    pub water: vk::DescriptorSetLayout,
    /// BRDF LUT, environment, diffuse, specular.
    pub ibl: vk::DescriptorSetLayout,
}

impl DescriptorLayouts {
    /// Create all layouts.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        let fragment = vk::ShaderStageFlags::FRAGMENT;

        let global = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(global_binding::UNIFORMS, VERTEX_FRAGMENT)
            .sampled_image_array(global_binding::SHADOW_MAPS, MAX_SHADOW_MAPS as u32, fragment)
            .build(device)?;

        let material = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(material_binding::PARAMS, VERTEX_FRAGMENT)
            .sampled_image(material_binding::BASE_COLOR, fragment)
            .sampled_image(material_binding::NORMAL, fragment)
            .sampled_image(material_binding::METALLIC_ROUGHNESS, fragment)
            .sampled_image(material_binding::EMISSIVE, fragment)
            .build(device)?;

        let storage = DescriptorSetLayoutBuilder::new()
            .storage_buffer(0, VERTEX_FRAGMENT)
            .build(device)?;

        let lighting = (0..5)
            .fold(DescriptorSetLayoutBuilder::new(), |builder, binding| {
                builder.input_attachment(binding)
            })
            .build(device)?;

        let single_texture = DescriptorSetLayoutBuilder::new()
            .sampled_image(0, fragment)
            .build(device)?;

        let post = DescriptorSetLayoutBuilder::new()
            .input_attachment(0)
            .input_attachment(1)
            .build(device)?;

        let water = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, VERTEX_FRAGMENT)
            .sampled_image(1, fragment)
            .build(device)?;

        let ibl = DescriptorSetLayoutBuilder::new()
            .sampled_image(ibl_binding::BRDF_LUT, fragment)
            .sampled_image(ibl_binding::ENVIRONMENT, fragment)
            .sampled_image(ibl_binding::DIFFUSE, fragment)
            .sampled_image(ibl_binding::SPECULAR, fragment)
            .build(device)?;

        Ok(Self {
            global,
            material,
            storage,
            lighting,
            single_texture,
            post,
            water,
            ibl,
        })
    }

    fn all(&self) -> [vk::DescriptorSetLayout; 8] {
        [
            self.global,
            self.material,
            self.storage,
            self.lighting,
            self.single_texture,
            self.post,
            self.water,
            self.ibl,
        ]
    }

    /// Destroy all layouts.
    ///
    /// # Safety
    /// No pipeline layout built from them may be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        for layout in self.all() {
            device.destroy_descriptor_set_layout(layout, None);
        }
    }
}
