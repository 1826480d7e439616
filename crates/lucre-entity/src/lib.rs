//! Entity components for the Lucre renderer.
//!
//! Uses hecs as the ECS backend. Render systems only read from the world:
//! each one queries the entities carrying its [`MaterialTag`] and draws them
//! in query order.

use glam::{Mat3, Mat4, Quat, Vec3};
pub use hecs::{Entity, World};
use lucre_core::constants::MAX_LIGHTS;

/// Transform component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    /// Transform at a position.
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// Set a uniform scale.
    #[must_use]
    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    /// Set the rotation.
    #[must_use]
    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    /// Object-to-world matrix.
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// Inverse-transpose of the upper 3x3, padded to a 4x4 for std140.
    pub fn normal_matrix(&self) -> Mat4 {
        Mat4::from_mat3(Mat3::from_mat4(self.matrix()).inverse().transpose())
    }
}

/// Reference to a model held by the renderer, by arena index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshComponent {
    pub model: u32,
}

/// Selects the render system that draws an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaterialTag {
    /// Deferred PBR, one material per submesh.
    Pbr,
    /// Deferred PBR with per-submesh material sets.
    PbrMultiMaterial,
    /// Deferred PBR reading geometry and textures through bindless indices.
    PbrBindless,
    /// Instanced grass blades.
    Grass,
    /// Terrain drawn in the geometry subpass.
    Terrain,
    /// Cubemap sky.
    Cubemap,
    /// HDRI sky.
    SkyboxHdri,
    /// Water surface in the transparency subpass.
    Water,
    /// Camera-facing sprite in the 3D scene.
    Sprite,
    /// Screen-space sprite in the GUI pass.
    Sprite2D,
    /// Debug overlay geometry.
    Debug,
}

impl MaterialTag {
    /// Whether entities with this tag are drawn into shadow maps.
    pub fn casts_shadow(self) -> bool {
        matches!(
            self,
            Self::Pbr | Self::PbrMultiMaterial | Self::PbrBindless | Self::Terrain | Self::Grass
        )
    }
}

/// Marks an entity as one instance of an instanced draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceTag {
    /// Instance buffer the entity writes to.
    pub buffer: u32,
    /// Slot within that buffer.
    pub index: u32,
}

/// Marks an entity as skinned; its shadow uses the animated pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Skinned;

/// Point light component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointLight {
    pub color: Vec3,
    pub intensity: f32,
    pub radius: f32,
}

impl Default for PointLight {
    fn default() -> Self {
        Self {
            color: Vec3::ONE,
            intensity: 1.0,
            radius: 10.0,
        }
    }
}

/// Directional light component. The direction is the way the light travels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
    /// Shadow map slot rendered for this light, if any.
    pub shadow_map: Option<u32>,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction: Vec3::NEG_Y,
            color: Vec3::ONE,
            intensity: 1.0,
            shadow_map: None,
        }
    }
}

/// Camera projection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    Perspective { fov_y: f32, near: f32, far: f32 },
    /// Orthographic box of `width` x `height` world units.
    Orthographic {
        width: f32,
        height: f32,
        near: f32,
        far: f32,
    },
}

/// Camera component. The view comes from the entity's [`Transform`];
/// it looks down its local `-Z`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraComponent {
    pub projection: Projection,
    /// The camera used for the main view.
    pub active: bool,
}

/// Point light as gathered for the global uniform buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatheredPointLight {
    pub position: Vec3,
    pub color: Vec3,
    pub intensity: f32,
    pub radius: f32,
}

/// Collect point lights, capped at `MAX_LIGHTS`.
pub fn gather_point_lights(world: &World) -> Vec<GatheredPointLight> {
    let mut query = world.query::<(&Transform, &PointLight)>();
    query
        .iter()
        .take(MAX_LIGHTS)
        .map(|(_, (transform, light))| GatheredPointLight {
            position: transform.position,
            color: light.color,
            intensity: light.intensity,
            radius: light.radius,
        })
        .collect()
}

/// Collect directional lights.
pub fn gather_directional_lights(world: &World) -> Vec<DirectionalLight> {
    let mut query = world.query::<&DirectionalLight>();
    query.iter().map(|(_, light)| *light).collect()
}

/// The active camera and its transform.
pub fn active_camera(world: &World) -> Option<(Transform, CameraComponent)> {
    let mut query = world.query::<(&Transform, &CameraComponent)>();
    query
        .iter()
        .find(|(_, (_, camera))| camera.active)
        .map(|(_, (transform, camera))| (*transform, *camera))
}

/// One entity to draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawItem {
    pub entity: Entity,
    pub model: u32,
    pub transform: Transform,
    pub instance: Option<InstanceTag>,
    pub skinned: bool,
}

/// Every drawable entity with `tag`, in query order.
pub fn draw_items(world: &World, tag: MaterialTag) -> Vec<DrawItem> {
    let mut query = world.query::<(
        &Transform,
        &MeshComponent,
        &MaterialTag,
        Option<&InstanceTag>,
        Option<&Skinned>,
    )>();
    query
        .iter()
        .filter(|(_, (_, _, t, _, _))| **t == tag)
        .map(|(entity, (transform, mesh, _, instance, skinned))| DrawItem {
            entity,
            model: mesh.model,
            transform: *transform,
            instance: instance.copied(),
            skinned: skinned.is_some(),
        })
        .collect()
}

/// Every entity drawn into shadow maps.
pub fn shadow_casters(world: &World) -> Vec<DrawItem> {
    let mut query = world.query::<(
        &Transform,
        &MeshComponent,
        &MaterialTag,
        Option<&InstanceTag>,
        Option<&Skinned>,
    )>();
    query
        .iter()
        .filter(|(_, (_, _, tag, _, _))| tag.casts_shadow())
        .map(|(entity, (transform, mesh, _, instance, skinned))| DrawItem {
            entity,
            model: mesh.model,
            transform: *transform,
            instance: instance.copied(),
            skinned: skinned.is_some(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn normal_matrix_undoes_non_uniform_scale() {
        let transform = Transform::default().with_scale(Vec3::new(2.0, 1.0, 1.0));
        let normal = transform.normal_matrix();
        let n = normal.transform_vector3(Vec3::X);
        assert_relative_eq!(n.x, 0.5, epsilon = 1e-6);
        assert_relative_eq!(normal.w_axis.w, 1.0);
    }

    #[test]
    fn draw_items_filter_by_tag() {
        let mut world = World::new();
        world.spawn((
            Transform::default(),
            MeshComponent { model: 0 },
            MaterialTag::Pbr,
        ));
        world.spawn((
            Transform::from_position(Vec3::Y),
            MeshComponent { model: 1 },
            MaterialTag::Water,
        ));
        world.spawn((
            Transform::default(),
            MeshComponent { model: 2 },
            MaterialTag::Pbr,
            InstanceTag {
                buffer: 0,
                index: 3,
            },
            Skinned,
        ));

        let pbr = draw_items(&world, MaterialTag::Pbr);
        assert_eq!(pbr.len(), 2);
        assert!(pbr.iter().any(|item| item.model == 2
            && item.skinned
            && item.instance.map(|i| i.index) == Some(3)));

        let water = draw_items(&world, MaterialTag::Water);
        assert_eq!(water.len(), 1);
        assert_eq!(water[0].transform.position, Vec3::Y);

        assert_eq!(shadow_casters(&world).len(), 2);
    }

    #[test]
    fn point_lights_are_capped() {
        let mut world = World::new();
        for i in 0..(MAX_LIGHTS + 5) {
            world.spawn((
                Transform::from_position(Vec3::splat(i as f32)),
                PointLight::default(),
            ));
        }
        assert_eq!(gather_point_lights(&world).len(), MAX_LIGHTS);
    }

    #[test]
    fn inactive_cameras_are_skipped() {
        let mut world = World::new();
        let projection = Projection::Perspective {
            fov_y: 1.0,
            near: 0.1,
            far: 100.0,
        };
        world.spawn((
            Transform::default(),
            CameraComponent {
                projection,
                active: false,
            },
        ));
        assert!(active_camera(&world).is_none());

        world.spawn((
            Transform::from_position(Vec3::Z),
            CameraComponent {
                projection,
                active: true,
            },
        ));
        let (transform, _) = active_camera(&world).unwrap();
        assert_eq!(transform.position, Vec3::Z);
    }
}
