//! Per-frame global uniform data (descriptor set 0).

use glam::{Mat4, Vec3};
use lucre_core::constants::{MAX_LIGHTS, MAX_SHADOW_MAPS};
use lucre_entity::{DirectionalLight, GatheredPointLight};

use crate::camera::Camera;

/// Point light as laid out on the GPU.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuPointLight {
    /// xyz position, w radius.
    pub position: [f32; 4],
    /// rgb color, a intensity.
    pub color: [f32; 4],
}

/// Directional light as laid out on the GPU.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuDirectionalLight {
    /// xyz direction the light travels.
    pub direction: [f32; 4],
    /// rgb color, a intensity.
    pub color: [f32; 4],
}

/// Global uniform buffer. Every member is 16-byte aligned so the Rust layout
/// matches std140.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GlobalUniformBuffer {
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub inverse_view: [[f32; 4]; 4],
    pub camera_position: [f32; 4],
    /// rgb ambient color, a intensity.
    pub ambient: [f32; 4],
    pub point_lights: [GpuPointLight; MAX_LIGHTS],
    pub directional_light: GpuDirectionalLight,
    /// x: point lights, y: directional lights, z: shadow maps, w: frame index.
    pub counts: [u32; 4],
    pub shadow_matrices: [[[f32; 4]; 4]; MAX_SHADOW_MAPS],
}

impl Default for GlobalUniformBuffer {
    fn default() -> Self {
        let identity = Mat4::IDENTITY.to_cols_array_2d();
        Self {
            view: identity,
            projection: identity,
            inverse_view: identity,
            camera_position: [0.0, 0.0, 0.0, 1.0],
            ambient: [1.0, 1.0, 1.0, 0.1],
            point_lights: [GpuPointLight::default(); MAX_LIGHTS],
            directional_light: GpuDirectionalLight::default(),
            counts: [0; 4],
            shadow_matrices: [identity; MAX_SHADOW_MAPS],
        }
    }
}

impl GlobalUniformBuffer {
    /// Fill the camera members.
    pub fn set_camera(&mut self, camera: &Camera) {
        self.view = camera.view_matrix().to_cols_array_2d();
        self.projection = camera.projection_matrix().to_cols_array_2d();
        self.inverse_view = camera.inverse_view_matrix().to_cols_array_2d();
        self.camera_position = camera.position.extend(1.0).to_array();
    }

    /// Set the ambient term.
    pub fn set_ambient(&mut self, color: Vec3, intensity: f32) {
        self.ambient = color.extend(intensity).to_array();
    }

    /// Copy point lights, dropping any past `MAX_LIGHTS`.
    pub fn set_point_lights(&mut self, lights: &[GatheredPointLight]) {
        let count = lights.len().min(MAX_LIGHTS);
        for (slot, light) in self.point_lights.iter_mut().zip(&lights[..count]) {
            *slot = GpuPointLight {
                position: light.position.extend(light.radius).to_array(),
                color: light.color.extend(light.intensity).to_array(),
            };
        }
        self.counts[0] = count as u32;
    }

    /// Set the directional light. Only the first one is used.
    pub fn set_directional_lights(&mut self, lights: &[DirectionalLight]) {
        match lights.first() {
            Some(light) => {
                self.directional_light = GpuDirectionalLight {
                    direction: light.direction.normalize_or_zero().extend(0.0).to_array(),
                    color: light.color.extend(light.intensity).to_array(),
                };
                self.counts[1] = 1;
            }
            None => self.counts[1] = 0,
        }
    }

    /// Set shadow map view-projections, dropping any past `MAX_SHADOW_MAPS`.
    pub fn set_shadow_matrices(&mut self, matrices: &[Mat4]) {
        let count = matrices.len().min(MAX_SHADOW_MAPS);
        for (slot, matrix) in self.shadow_matrices.iter_mut().zip(&matrices[..count]) {
            *slot = matrix.to_cols_array_2d();
        }
        self.counts[2] = count as u32;
    }

    pub fn set_frame_index(&mut self, frame_index: usize) {
        self.counts[3] = frame_index as u32;
    }

    pub fn num_point_lights(&self) -> u32 {
        self.counts[0]
    }

    pub fn num_directional_lights(&self) -> u32 {
        self.counts[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn layout_is_std140_compatible() {
        assert_eq!(size_of::<GpuPointLight>(), 32);
        assert_eq!(size_of::<GlobalUniformBuffer>() % 16, 0);
        assert_eq!(offset_of!(GlobalUniformBuffer, point_lights) % 16, 0);
        assert_eq!(offset_of!(GlobalUniformBuffer, counts) % 16, 0);
        assert_eq!(offset_of!(GlobalUniformBuffer, shadow_matrices) % 16, 0);
        assert_eq!(
            size_of::<GlobalUniformBuffer>(),
            64 * 3 + 16 * 2 + 32 * MAX_LIGHTS + 32 + 16 + 64 * MAX_SHADOW_MAPS
        );
    }

    #[test]
    fn point_lights_are_clamped_to_capacity() {
        let light = GatheredPointLight {
            position: Vec3::ONE,
            color: Vec3::X,
            intensity: 2.0,
            radius: 5.0,
        };
        let lights = vec![light; MAX_LIGHTS + 3];
        let mut ubo = GlobalUniformBuffer::default();
        ubo.set_point_lights(&lights);
        assert_eq!(ubo.num_point_lights(), MAX_LIGHTS as u32);
        assert_eq!(ubo.point_lights[0].position, [1.0, 1.0, 1.0, 5.0]);
        assert_eq!(ubo.point_lights[0].color, [1.0, 0.0, 0.0, 2.0]);
    }

    #[test]
    fn directional_light_is_normalized() {
        let mut ubo = GlobalUniformBuffer::default();
        ubo.set_directional_lights(&[DirectionalLight {
            direction: Vec3::new(0.0, 0.0, -2.0),
            ..DirectionalLight::default()
        }]);
        assert_eq!(ubo.num_directional_lights(), 1);
        assert_eq!(ubo.directional_light.direction, [0.0, 0.0, -1.0, 0.0]);

        ubo.set_directional_lights(&[]);
        assert_eq!(ubo.num_directional_lights(), 0);
    }
}
