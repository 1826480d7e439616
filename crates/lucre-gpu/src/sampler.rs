//! Shared immutable samplers.

use crate::error::Result;
use ash::vk;

/// The samplers every renderer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplerKind {
    /// Trilinear, repeat, anisotropic when available.
    LinearRepeat,
    /// Linear, clamp to edge; for render targets and LUTs.
    LinearClamp,
    /// Nearest, clamp to edge.
    NearestClamp,
    /// Depth compare (`LESS_OR_EQUAL`) for shadow maps.
    ShadowCompare,
}

impl SamplerKind {
    pub const ALL: [Self; 4] = [
        Self::LinearRepeat,
        Self::LinearClamp,
        Self::NearestClamp,
        Self::ShadowCompare,
    ];

    /// Create info for this sampler.
    pub fn create_info(self, max_anisotropy: Option<f32>) -> vk::SamplerCreateInfo<'static> {
        let base = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE);

        match self {
            Self::LinearRepeat => {
                let info = base
                    .address_mode_u(vk::SamplerAddressMode::REPEAT)
                    .address_mode_v(vk::SamplerAddressMode::REPEAT)
                    .address_mode_w(vk::SamplerAddressMode::REPEAT);
                match max_anisotropy {
                    Some(max) => info.anisotropy_enable(true).max_anisotropy(max),
                    None => info,
                }
            }
            Self::LinearClamp => base,
            Self::NearestClamp => base
                .mag_filter(vk::Filter::NEAREST)
                .min_filter(vk::Filter::NEAREST)
                .mipmap_mode(vk::SamplerMipmapMode::NEAREST),
            Self::ShadowCompare => base
                .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_BORDER)
                .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_BORDER)
                .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_BORDER)
                .compare_enable(true)
                .compare_op(vk::CompareOp::LESS_OR_EQUAL)
                .max_lod(1.0),
        }
    }
}

/// Samplers created once at startup and shared by every system.
pub struct SamplerRegistry {
    samplers: [vk::Sampler; 4],
}

impl SamplerRegistry {
    /// Create all samplers.
    ///
    /// # Safety
    /// The device must be valid and anisotropy must have been enabled if requested.
    pub unsafe fn new(device: &ash::Device, max_anisotropy: Option<f32>) -> Result<Self> {
        let mut samplers = [vk::Sampler::null(); 4];
        for (slot, kind) in samplers.iter_mut().zip(SamplerKind::ALL) {
            *slot = device.create_sampler(&kind.create_info(max_anisotropy), None)?;
        }
        Ok(Self { samplers })
    }

    /// Get a sampler.
    pub fn get(&self, kind: SamplerKind) -> vk::Sampler {
        self.samplers[kind as usize]
    }

    /// Destroy all samplers.
    ///
    /// # Safety
    /// No sampler may still be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        for &sampler in &self.samplers {
            device.destroy_sampler(sampler, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_index_their_slots() {
        for (i, kind) in SamplerKind::ALL.into_iter().enumerate() {
            assert_eq!(kind as usize, i);
        }
    }

    #[test]
    fn shadow_sampler_compares() {
        let info = SamplerKind::ShadowCompare.create_info(None);
        assert_eq!(info.compare_enable, vk::TRUE);
        assert_eq!(info.compare_op, vk::CompareOp::LESS_OR_EQUAL);
    }

    #[test]
    fn anisotropy_only_when_supported() {
        let on = SamplerKind::LinearRepeat.create_info(Some(16.0));
        assert_eq!(on.anisotropy_enable, vk::TRUE);
        assert_eq!(on.max_anisotropy, 16.0);
        let off = SamplerKind::LinearRepeat.create_info(None);
        assert_eq!(off.anisotropy_enable, vk::FALSE);
    }
}
