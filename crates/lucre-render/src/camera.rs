//! Camera and view management.

use glam::{Mat4, Quat, Vec3};
use lucre_entity::{CameraComponent, Projection, Transform};

/// Camera for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    pub projection: Projection,
    pub aspect: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            projection: Projection::Perspective {
                fov_y: std::f32::consts::FRAC_PI_4,
                near: 0.1,
                far: 1000.0,
            },
            aspect: 16.0 / 9.0,
        }
    }
}

impl Camera {
    /// Perspective camera looking at `target`.
    pub fn perspective(position: Vec3, target: Vec3, fov_y: f32, aspect: f32) -> Self {
        Self {
            position,
            direction: (target - position).normalize(),
            projection: Projection::Perspective {
                fov_y,
                near: 0.1,
                far: 1000.0,
            },
            aspect,
            ..Self::default()
        }
    }

    /// Orthographic camera covering `width` x `height` world units.
    pub fn orthographic(position: Vec3, direction: Vec3, width: f32, height: f32) -> Self {
        Self {
            position,
            direction: direction.normalize(),
            projection: Projection::Orthographic {
                width,
                height,
                near: 0.0,
                far: 100.0,
            },
            aspect: width / height,
            ..Self::default()
        }
    }

    /// Camera from an entity's transform and camera component.
    pub fn from_entity(transform: &Transform, camera: &CameraComponent, aspect: f32) -> Self {
        let rotation: Quat = transform.rotation;
        Self {
            position: transform.position,
            direction: rotation * Vec3::NEG_Z,
            up: rotation * Vec3::Y,
            projection: camera.projection,
            aspect,
        }
    }

    /// Look at a target position.
    pub fn look_at(&mut self, target: Vec3) {
        self.direction = (target - self.position).normalize();
    }

    /// Set the aspect ratio.
    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect;
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    /// Projection with Vulkan clip conventions (Y down, depth `[0, 1]`).
    pub fn projection_matrix(&self) -> Mat4 {
        let mut projection = match self.projection {
            Projection::Perspective { fov_y, near, far } => {
                Mat4::perspective_rh(fov_y, self.aspect, near, far)
            }
            Projection::Orthographic {
                width,
                height,
                near,
                far,
            } => Mat4::orthographic_rh(
                -width * 0.5,
                width * 0.5,
                -height * 0.5,
                height * 0.5,
                near,
                far,
            ),
        };
        projection.y_axis.y *= -1.0;
        projection
    }

    pub fn inverse_view_matrix(&self) -> Mat4 {
        self.view_matrix().inverse()
    }

    /// Get the view-projection matrix.
    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }
}

/// View-projection of a directional light's shadow map.
///
/// The orthographic box is centered on `center` and spans `extent` units in
/// every direction.
pub fn directional_shadow_matrix(direction: Vec3, center: Vec3, extent: f32) -> Mat4 {
    let direction = direction.normalize();
    let up = if direction.abs().dot(Vec3::Y) > 0.99 {
        Vec3::Z
    } else {
        Vec3::Y
    };
    let eye = center - direction * extent;
    let view = Mat4::look_to_rh(eye, direction, up);
    let mut projection =
        Mat4::orthographic_rh(-extent, extent, -extent, extent, 0.0, extent * 2.0);
    projection.y_axis.y *= -1.0;
    projection * view
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn orthographic_maps_box_to_clip_space() {
        let camera = Camera::orthographic(Vec3::new(0.0, 0.0, 5.0), Vec3::NEG_Z, 2.0, 2.0);
        let clip = camera.view_projection_matrix() * Vec3::new(1.0, 1.0, 0.0).extend(1.0);
        assert_relative_eq!(clip.x, 1.0, epsilon = 1e-5);
        // Y is flipped for Vulkan
        assert_relative_eq!(clip.y, -1.0, epsilon = 1e-5);
        assert!(clip.z > 0.0 && clip.z < 1.0);
    }

    #[test]
    fn entity_camera_looks_down_local_negative_z() {
        let transform = Transform::from_position(Vec3::new(1.0, 2.0, 3.0));
        let component = CameraComponent {
            projection: Projection::Perspective {
                fov_y: 1.0,
                near: 0.1,
                far: 10.0,
            },
            active: true,
        };
        let camera = Camera::from_entity(&transform, &component, 1.0);
        assert_relative_eq!(camera.direction.z, -1.0);
        assert_eq!(camera.position, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn shadow_matrix_puts_closer_points_at_smaller_depth() {
        let matrix = directional_shadow_matrix(Vec3::NEG_Y, Vec3::ZERO, 10.0);
        let top = matrix.project_point3(Vec3::new(0.0, 1.0, 0.0));
        let ground = matrix.project_point3(Vec3::ZERO);
        assert!(top.z < ground.z);
        assert!((0.0..=1.0).contains(&top.z));
    }
}
