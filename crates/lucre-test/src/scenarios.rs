//! End-to-end frame graph scenarios. All of them need a Vulkan device.

use glam::{Vec3, Vec4};
use image::{Rgba, RgbaImage};
use lucre_core::constants::MAX_FRAMES_IN_FLIGHT;
use lucre_entity::{DirectionalLight, MaterialTag, MeshComponent, Transform, World};
use lucre_gpu::{AcquireStatus, GpuDeviceBuilder, MemoryUsage};
use lucre_render::{
    Builder, Camera, DecodedImage, FrameDecision, FrameOutcome, Handle, MaterialParams, MaterialRef,
    MaterialTextures, Model,
};

use crate::harness::{create_test_camera, HeadlessRenderer};

fn center(image: &RgbaImage) -> Rgba<u8> {
    *image.get_pixel(image.width() / 2, image.height() / 2)
}

fn luminance(pixel: Rgba<u8>) -> u32 {
    u32::from(pixel[0]) + u32::from(pixel[1]) + u32::from(pixel[2])
}

fn white_sun(direction: Vec3, shadow_map: Option<u32>) -> DirectionalLight {
    DirectionalLight {
        direction,
        color: Vec3::ONE,
        intensity: 1.0,
        shadow_map,
    }
}

/// Upload `builder` drawn with a flat classical material of `color`.
fn colored_model(renderer: &mut HeadlessRenderer, builder: Builder, color: Vec4, name: &str) -> Handle<Model> {
    let renderer = renderer.renderer_mut();
    unsafe {
        let material = renderer
            .add_material(
                MaterialParams::default().with_base_color(color),
                MaterialTextures::default(),
            )
            .unwrap();
        renderer
            .upload_model(&builder.with_material(MaterialRef::Classical(material)), name)
            .unwrap()
    }
}

fn spawn(world: &mut World, model: Handle<Model>, tag: MaterialTag, transform: Transform) -> lucre_entity::Entity {
    world.spawn((
        transform,
        MeshComponent {
            model: model.index(),
        },
        tag,
    ))
}

#[test]
#[ignore = "Requires GPU hardware"]
fn deferred_pbr_cube_is_lit_red() {
    let mut renderer = HeadlessRenderer::new(4, 4).unwrap();
    let cube = colored_model(
        &mut renderer,
        Builder::cube(1.0, Vec4::ONE),
        Vec4::new(1.0, 0.0, 0.0, 1.0),
        "cube",
    );

    let mut world = World::new();
    spawn(&mut world, cube, MaterialTag::Pbr, Transform::default());
    world.spawn((white_sun(Vec3::NEG_Z, None),));

    let image = renderer.render(&world, &create_test_camera(2.0)).unwrap();
    assert_eq!(image.dimensions(), (4, 4));

    let lit = center(&image);
    assert!(lit[0] >= 200, "center should be red, got {lit:?}");
    assert!(lit[1] <= 40 && lit[2] <= 40, "center should be red, got {lit:?}");
    assert_eq!(image.get_pixel(0, 0), &Rgba([0, 0, 0, 255]));
    assert_eq!(image.get_pixel(3, 3), &Rgba([0, 0, 0, 255]));
}

#[test]
#[ignore = "Requires GPU hardware"]
fn bindless_indices_follow_registration_order() {
    let mut renderer = HeadlessRenderer::new(8, 8).unwrap();
    if renderer.renderer().bindless_textures().is_none() {
        eprintln!("Device has no bindless support, skipping");
        return;
    }

    let inner = renderer.renderer_mut();
    let colors = [[255, 0, 0, 255], [0, 255, 0, 255], [0, 0, 255, 255]];
    let textures: Vec<_> = colors
        .iter()
        .enumerate()
        .map(|(i, &rgba)| unsafe {
            inner
                .upload_texture(&DecodedImage::solid(rgba), true, &format!("texture_{i}"))
                .unwrap()
        })
        .collect();
    let indices: Vec<u32> = textures
        .iter()
        .map(|&texture| inner.register_bindless(texture).unwrap())
        .collect();
    assert_eq!(indices, vec![1, 2, 3]);

    // A material sampling texture B through its bindless index
    let material = inner
        .resources_mut()
        .add_bindless_material(
            MaterialParams::default(),
            MaterialTextures {
                base_color: Some(textures[1]),
                ..MaterialTextures::default()
            },
        )
        .unwrap();
    let quad = Builder::quad(4.0, 4.0, Vec4::ONE).with_material(MaterialRef::Bindless(material));
    let quad = unsafe { inner.upload_model(&quad, "quad").unwrap() };

    let mut world = World::new();
    spawn(&mut world, quad, MaterialTag::PbrBindless, Transform::default());
    world.spawn((white_sun(Vec3::NEG_Z, None),));

    let image = renderer.render(&world, &create_test_camera(2.0)).unwrap();
    let pixel = center(&image);
    assert!(
        pixel[1] > pixel[0] && pixel[1] > pixel[2],
        "expected texture B (green), got {pixel:?}"
    );
}

#[test]
#[ignore = "Requires GPU hardware"]
fn shadowed_ground_is_darker() {
    let mut renderer = HeadlessRenderer::new(64, 64).unwrap();
    let ground = colored_model(&mut renderer, Builder::plane(10.0, Vec4::ONE), Vec4::ONE, "ground");
    let cube = colored_model(&mut renderer, Builder::cube(1.0, Vec4::ONE), Vec4::ONE, "cube");

    let mut world = World::new();
    spawn(&mut world, ground, MaterialTag::Pbr, Transform::default());
    world.spawn((white_sun(Vec3::NEG_Y, Some(0)),));

    // Low camera looking under the floating cube at the ground below it
    let camera = Camera::perspective(Vec3::new(0.0, 0.4, 4.0), Vec3::ZERO, 0.5, 1.0);
    let unshadowed = center(&renderer.render(&world, &camera).unwrap());

    spawn(
        &mut world,
        cube,
        MaterialTag::Pbr,
        Transform::from_position(Vec3::new(0.0, 1.0, 0.0)),
    );
    let shadowed = center(&renderer.render(&world, &camera).unwrap());

    assert!(
        luminance(shadowed) < luminance(unshadowed),
        "ground under the cube should be darker: {shadowed:?} vs {unshadowed:?}"
    );
}

#[test]
#[ignore = "Requires GPU hardware"]
fn buffer_churn_reuses_memory() {
    let gpu = GpuDeviceBuilder::new()
        .app_name("lucre-test")
        .headless(true)
        .build()
        .unwrap();

    for frame in 0..16usize {
        gpu.begin_frame(frame % MAX_FRAMES_IN_FLIGHT).unwrap();
        let buffers: Vec<_> = (0..400)
            .map(|i| {
                gpu.create_buffer(
                    1024,
                    ash::vk::BufferUsageFlags::UNIFORM_BUFFER,
                    MemoryUsage::HostVisible,
                    &format!("churn_{i}"),
                )
                .unwrap()
            })
            .collect();
        for buffer in buffers {
            gpu.free_buffer(buffer);
        }

        let stats = gpu.memory_stats();
        assert!(
            stats.total_bytes <= 2 * stats.peak_bytes_in_use,
            "frame {frame}: {} bytes held for a working set of {}",
            stats.total_bytes,
            stats.peak_bytes_in_use
        );
    }
    gpu.wait_idle().unwrap();
}

#[test]
#[ignore = "Requires GPU hardware"]
fn rebuilt_output_renders_next_frame() {
    // Out of date: nothing is recorded and a rebuild is requested
    let decision = FrameDecision::from_acquire(AcquireStatus::OutOfDate);
    assert_eq!(decision, FrameDecision::Skip { rebuild: true });

    let mut renderer = HeadlessRenderer::new(16, 16).unwrap();
    let world = World::new();
    let camera = create_test_camera(2.0);
    renderer.render(&world, &camera).unwrap();
    let submitted = renderer.renderer().frames_submitted();

    // A minimized output skips without submitting
    renderer.resize(0, 0);
    let outcome = unsafe { renderer.renderer_mut().render(&world, &camera, 1.0 / 60.0).unwrap() };
    assert_eq!(outcome, FrameOutcome::Skipped);
    assert_eq!(renderer.renderer().frames_submitted(), submitted);

    // The following frame uses the rebuilt output
    renderer.resize(32, 24);
    let image = renderer.render(&world, &camera).unwrap();
    assert_eq!(image.dimensions(), (32, 24));
    assert_eq!(renderer.renderer().frames_submitted(), submitted + 1);
}

#[test]
#[ignore = "Requires GPU hardware"]
fn transparent_quad_blends_over_opaque() {
    let mut renderer = HeadlessRenderer::new(8, 8).unwrap();
    let blue = colored_model(
        &mut renderer,
        Builder::quad(4.0, 4.0, Vec4::ONE),
        Vec4::new(0.0, 0.0, 1.0, 1.0),
        "blue",
    );
    let red = colored_model(
        &mut renderer,
        Builder::quad(4.0, 4.0, Vec4::ONE),
        Vec4::new(1.0, 0.0, 0.0, 0.5),
        "red",
    );
    let camera = create_test_camera(2.0);
    let behind = Transform::from_position(Vec3::new(0.0, 0.0, -0.1));

    let mut world = World::new();
    world.spawn((white_sun(Vec3::NEG_Z, None),));
    let blue_entity = spawn(&mut world, blue, MaterialTag::Pbr, behind);
    let blue_alone = center(&renderer.render(&world, &camera).unwrap());

    world.despawn(blue_entity).unwrap();
    spawn(&mut world, red, MaterialTag::Sprite, Transform::default());
    let red_alone = center(&renderer.render(&world, &camera).unwrap());

    spawn(&mut world, blue, MaterialTag::Pbr, behind);
    let blended = center(&renderer.render(&world, &camera).unwrap());

    // Over a black clear the red quad alone is already 0.5 * red
    for c in 0..3 {
        let expected = f32::from(red_alone[c]) + 0.5 * f32::from(blue_alone[c]);
        let actual = f32::from(blended[c]);
        assert!(
            (actual - expected).abs() <= 1.5,
            "channel {c}: expected {expected}, got {actual}"
        );
    }
}
