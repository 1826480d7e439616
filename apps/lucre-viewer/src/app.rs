//! Viewer application: a cube on a ground plane under a sun and a point light.

use glam::{Quat, Vec3, Vec4};
use tracing::info;
use winit::event::ElementState;
use winit::keyboard::{Key, NamedKey};

use lucre_app::{AppContext, FrameInfo, LucreApp, WindowEvent};
use lucre_entity::{
    CameraComponent, DirectionalLight, Entity, MaterialTag, MeshComponent, PointLight, Projection,
    Transform,
};
use lucre_render::{Builder, Handle, MaterialParams, MaterialRef, MaterialTextures, Model};

/// Cube rotation speed in radians per second.
const SPIN_SPEED: f32 = 0.8;

/// Camera orbit speed in radians per second.
const ORBIT_SPEED: f32 = 0.15;

const ORBIT_RADIUS: f32 = 7.0;
const ORBIT_HEIGHT: f32 = 3.5;

/// Viewer application state.
pub struct Viewer {
    cube: Entity,
    camera: Entity,
    point_light: Entity,
    /// Seconds of animation so far.
    time: f32,
    paused: bool,
}

impl Viewer {
    /// Upload `builder` with a single classical material.
    ///
    /// # Safety
    /// Must be called on the thread that owns the renderer.
    unsafe fn upload(
        ctx: &mut AppContext,
        builder: Builder,
        params: MaterialParams,
        name: &str,
    ) -> anyhow::Result<Handle<Model>> {
        // SAFETY: caller runs on the renderer's thread
        let material = unsafe { ctx.renderer.add_material(params, MaterialTextures::default())? };
        let builder = builder.with_material(MaterialRef::Classical(material));
        // SAFETY: as above
        let model = unsafe { ctx.renderer.upload_model(&builder, name)? };
        Ok(model)
    }

    fn orbit_transform(angle: f32) -> Transform {
        let position = Vec3::new(angle.sin() * ORBIT_RADIUS, ORBIT_HEIGHT, angle.cos() * ORBIT_RADIUS);
        let forward = (Vec3::new(0.0, 0.5, 0.0) - position).normalize();
        Transform::from_position(position).with_rotation(Quat::from_rotation_arc(Vec3::NEG_Z, forward))
    }
}

impl LucreApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        // SAFETY: init runs on the event loop thread that owns the renderer
        let (ground, cube) = unsafe {
            let ground = Self::upload(
                ctx,
                Builder::plane(20.0, Vec4::ONE),
                MaterialParams::default()
                    .with_base_color(Vec4::new(0.55, 0.55, 0.5, 1.0))
                    .with_roughness_metallic(0.9, 0.0),
                "ground",
            )?;
            let cube = Self::upload(
                ctx,
                Builder::cube(1.0, Vec4::ONE),
                MaterialParams::default()
                    .with_base_color(Vec4::new(0.8, 0.15, 0.1, 1.0))
                    .with_roughness_metallic(0.4, 0.1),
                "cube",
            )?;
            (ground, cube)
        };

        let world = &mut ctx.world;
        world.spawn((
            Transform::default(),
            MeshComponent {
                model: ground.index(),
            },
            MaterialTag::Pbr,
        ));
        let cube = world.spawn((
            Transform::from_position(Vec3::new(0.0, 1.0, 0.0)),
            MeshComponent {
                model: cube.index(),
            },
            MaterialTag::Pbr,
        ));
        world.spawn((DirectionalLight {
            direction: Vec3::new(-0.4, -1.0, -0.3).normalize(),
            color: Vec3::new(1.0, 0.96, 0.9),
            intensity: 2.5,
            shadow_map: Some(0),
        },));
        let point_light = world.spawn((
            Transform::from_position(Vec3::new(2.0, 1.5, 1.5)),
            PointLight {
                color: Vec3::new(0.3, 0.6, 1.0),
                intensity: 4.0,
                radius: 6.0,
            },
        ));
        let camera = world.spawn((
            Self::orbit_transform(0.0),
            CameraComponent {
                projection: Projection::Perspective {
                    fov_y: 60f32.to_radians(),
                    near: 0.1,
                    far: 200.0,
                },
                active: true,
            },
        ));

        let resources = ctx.renderer.resources_mut();
        resources.ambient = (Vec3::new(0.6, 0.7, 1.0), 0.08);
        resources.light_billboards = true;

        info!("Scene ready: {} entities", ctx.world.len());

        Ok(Self {
            cube,
            camera,
            point_light,
            time: 0.0,
            paused: false,
        })
    }

    fn update(&mut self, ctx: &mut AppContext, dt: f32) {
        for (name, asset) in ctx.renderer.adopt_uploads() {
            info!("Upload finished: {name} ({asset:?})");
        }

        if self.paused {
            return;
        }
        self.time += dt;

        let world = &mut ctx.world;
        if let Ok(mut transform) = world.get::<&mut Transform>(self.cube) {
            transform.rotation = Quat::from_euler(glam::EulerRot::YXZ, self.time * SPIN_SPEED, 0.3, 0.0);
        }
        if let Ok(mut transform) = world.get::<&mut Transform>(self.point_light) {
            let angle = self.time * 1.3;
            transform.position = Vec3::new(angle.cos() * 2.0, 1.5, angle.sin() * 2.0);
        }
        if let Ok(mut transform) = world.get::<&mut Transform>(self.camera) {
            *transform = Self::orbit_transform(self.time * ORBIT_SPEED);
        }
    }

    fn render(&mut self, ctx: &mut AppContext, frame: &FrameInfo) -> anyhow::Result<()> {
        if frame.frame_number > 0 && frame.frame_number % 600 == 0 {
            let stats = ctx.renderer.memory_stats();
            info!(
                "Frame {}: {} allocations, {} KiB in use",
                frame.frame_number,
                stats.num_allocations,
                stats.bytes_in_use / 1024
            );
        }
        Ok(())
    }

    fn on_resize(&mut self, _ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        info!("Viewport now {width}x{height}");
        Ok(())
    }

    fn on_event(&mut self, event: &WindowEvent) -> bool {
        if let WindowEvent::KeyboardInput { event, .. } = event {
            if event.state == ElementState::Pressed
                && !event.repeat
                && event.logical_key == Key::Named(NamedKey::Space)
            {
                self.paused = !self.paused;
                info!("Animation {}", if self.paused { "paused" } else { "resumed" });
                return true;
            }
        }
        false
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        info!(
            "Viewer shutting down after {} frames ({:.1}s animated)",
            ctx.frame_count, self.time
        );
    }
}
