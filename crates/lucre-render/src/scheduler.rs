//! The frame scheduler.
//!
//! [`Renderer`] owns the render passes, targets, and systems and records one
//! frame at a time on the thread that created it:
//!
//! 1. acquire the output image (skip the frame when out of date or minimized)
//! 2. reset the slot's command and descriptor pools, recycle retired memory
//! 3. flush the bindless tables
//! 4. wait for uploads the frame may reference
//! 5. fill the global uniforms
//! 6. record shadow maps, the 3D pass, bloom, post-processing, and the GUI
//! 7. submit and present, remembering what must be rebuilt

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use glam::{Mat4, Vec3};
use image::RgbaImage;
use lucre_core::constants::{MAX_FRAMES_IN_FLIGHT, MAX_SHADOW_MAPS};
use lucre_core::RendererConfig;
use lucre_entity::{gather_directional_lights, gather_point_lights, DirectionalLight, World};
use lucre_gpu::command::{begin_command_buffer, end_command_buffer};
use lucre_gpu::sync::{create_fence, reset_fence, wait_for_fence};
use lucre_gpu::{
    execute_single_time_commands, BindlessKind, BindlessTable, Buffer, CommandPool, DescriptorPool,
    DescriptorWriter, GpuDevice, GpuError, Image, ImageDesc, ImageView, MemoryStats, MemoryUsage,
    SamplerKind, SamplerRegistry, ShaderCache, SurfaceContext, Swapchain,
};

use crate::arena::Handle;
use crate::assets::{AssetUploader, CompletedUpload};
use crate::camera::{directional_shadow_matrix, Camera};
use crate::error::{RenderError, Result};
use crate::layouts::{global_binding, DescriptorLayouts};
use crate::material::{Material, MaterialParams, MaterialTextures};
use crate::model::{Builder, Model};
use crate::pipelines::Stage;
use crate::plan::{is_renderable, FrameDecision, FramePlan, RebuildFlags};
use crate::render_pass::{begin_render_pass, depth_clear_value, scene_clear_values, PassFormats, RenderPassGraph};
use crate::resources::SceneResources;
use crate::systems::{default_systems, FrameContext, RenderSystem, SceneView, ShadowView, SystemContext};
use crate::targets::{RenderTargets, ShadowMaps};
use crate::texture::{upload_texture, DecodedImage, Texture};
use crate::uniforms::GlobalUniformBuffer;

/// Half-size of the box a directional shadow map covers, centered on the camera.
pub const SHADOW_DISTANCE: f32 = 40.0;

/// Format of the offscreen output; readback copies it byte for byte.
pub const OFFSCREEN_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// What happened to a requested frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Rendered,
    /// Nothing was recorded: minimized window or out-of-date swapchain.
    Skipped,
}

/// An asset handed over by a worker and stored in the scene resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdoptedAsset {
    Texture(Handle<Texture>),
    Model(Handle<Model>),
}

/// Frame timing collected over the renderer's lifetime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameStats {
    pub frames: u64,
    pub min_fps: f64,
    pub max_fps: f64,
    fps_sum: f64,
    timed_frames: u64,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self {
            frames: 0,
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
            timed_frames: 0,
        }
    }
}

impl FrameStats {
    /// Count one frame that took `dt` seconds. Zero-length frames are not timed.
    pub fn record(&mut self, dt: f32) {
        self.frames += 1;
        if dt > 0.0 {
            let fps = 1.0 / f64::from(dt);
            self.min_fps = self.min_fps.min(fps);
            self.max_fps = self.max_fps.max(fps);
            self.fps_sum += fps;
            self.timed_frames += 1;
        }
    }

    pub fn average_fps(&self) -> Option<f64> {
        (self.timed_frames > 0).then(|| self.fps_sum / self.timed_frames as f64)
    }

    pub fn log_summary(&self) {
        if let Some(avg) = self.average_fps() {
            tracing::info!("FPS Statistics:");
            tracing::info!("  Min: {:.1}", self.min_fps);
            tracing::info!("  Max: {:.1}", self.max_fps);
            tracing::info!("  Avg: {:.1}", avg);
            tracing::info!("  Total frames: {}", self.frames);
        }
    }
}

/// Shadow maps to render this frame: one per directional light that names a
/// map, first light wins when two name the same one.
pub fn shadow_views(
    lights: &[DirectionalLight],
    map_count: usize,
    map_size: u32,
    center: Vec3,
) -> Vec<ShadowView> {
    let mut views: Vec<ShadowView> = Vec::new();
    for light in lights {
        let Some(index) = light.shadow_map.map(|i| i as usize) else {
            continue;
        };
        if index >= map_count || views.iter().any(|v| v.index == index) {
            continue;
        }
        views.push(ShadowView {
            index,
            light_view_projection: directional_shadow_matrix(light.direction, center, SHADOW_DISTANCE),
            extent: vk::Extent2D {
                width: map_size,
                height: map_size,
            },
        });
    }
    views
}

/// Per-map matrices as stored in the global uniforms; unused maps get identity.
pub fn shadow_matrices(views: &[ShadowView], map_count: usize) -> Vec<Mat4> {
    let mut matrices = vec![Mat4::IDENTITY; map_count.min(MAX_SHADOW_MAPS)];
    for view in views {
        if let Some(slot) = matrices.get_mut(view.index) {
            *slot = view.light_view_projection;
        }
    }
    matrices
}

/// Command pool, descriptor pool, and uniforms of one in-flight slot.
struct FrameResources {
    command_pool: CommandPool,
    descriptors: DescriptorPool,
    uniforms: Buffer,
}

impl FrameResources {
    unsafe fn new(gpu: &GpuDevice, slot: usize) -> Result<Self> {
        let device = gpu.device();
        let command_pool = CommandPool::new(
            device,
            gpu.graphics_queue_family(),
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;
        let descriptors = DescriptorPool::per_thread(device)?;
        let uniforms = gpu.create_buffer(
            std::mem::size_of::<GlobalUniformBuffer>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryUsage::HostVisible,
            &format!("global_uniforms_{slot}"),
        )?;
        Ok(Self {
            command_pool,
            descriptors,
            uniforms,
        })
    }

    unsafe fn destroy(self, gpu: &GpuDevice) {
        self.command_pool.destroy(gpu.device());
        self.descriptors.destroy(gpu.device());
        gpu.free_buffer(self.uniforms);
    }
}

/// A color image standing in for the swapchain.
struct OffscreenOutput {
    image: Image,
    view: ImageView,
    fences: Vec<vk::Fence>,
    slot: usize,
}

impl OffscreenOutput {
    unsafe fn new(gpu: &GpuDevice, extent: vk::Extent2D) -> Result<Self> {
        let (image, view) = create_offscreen_image(gpu, extent)?;
        let mut fences = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            fences.push(create_fence(gpu.device(), true)?);
        }
        Ok(Self {
            image,
            view,
            fences,
            slot: 0,
        })
    }

    unsafe fn destroy(self, gpu: &GpuDevice) {
        for fence in self.fences {
            gpu.device().destroy_fence(fence, None);
        }
        self.view.destroy(gpu.device());
        gpu.destroy_image(self.image);
    }
}

unsafe fn create_offscreen_image(gpu: &GpuDevice, extent: vk::Extent2D) -> Result<(Image, ImageView)> {
    let image = gpu.create_image(
        &ImageDesc::new_2d(
            OFFSCREEN_FORMAT,
            extent,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
        ),
        "offscreen_output",
    )?;
    let view = match ImageView::whole(gpu.device(), &image) {
        Ok(view) => view,
        Err(e) => {
            gpu.destroy_image(image);
            return Err(e.into());
        }
    };
    Ok((image, view))
}

enum Output {
    Window {
        surface: SurfaceContext,
        swapchain: Swapchain,
    },
    Offscreen(OffscreenOutput),
}

impl Output {
    fn format(&self) -> vk::Format {
        match self {
            Self::Window { swapchain, .. } => swapchain.format.format,
            Self::Offscreen(_) => OFFSCREEN_FORMAT,
        }
    }

    fn final_layout(&self) -> vk::ImageLayout {
        match self {
            Self::Window { .. } => vk::ImageLayout::PRESENT_SRC_KHR,
            Self::Offscreen(_) => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        }
    }

    fn views(&self) -> Vec<vk::ImageView> {
        match self {
            Self::Window { swapchain, .. } => swapchain.image_views.clone(),
            Self::Offscreen(output) => vec![output.view.view],
        }
    }

    fn extent(&self) -> vk::Extent2D {
        match self {
            Self::Window { swapchain, .. } => swapchain.extent,
            Self::Offscreen(output) => output.image.extent_2d(),
        }
    }
}

/// Bindless texture and storage-image arrays.
struct BindlessTables {
    textures: BindlessTable,
    images: BindlessTable,
}

/// Records and submits frames.
pub struct Renderer {
    gpu: Arc<GpuDevice>,
    config: RendererConfig,
    uploader: AssetUploader,
    shaders: ShaderCache,
    samplers: SamplerRegistry,
    layouts: DescriptorLayouts,
    passes: RenderPassGraph,
    targets: RenderTargets,
    shadows: ShadowMaps,
    bindless: Option<BindlessTables>,
    systems: Vec<Box<dyn RenderSystem>>,
    plan: FramePlan,
    frames: Vec<FrameResources>,
    output: Output,
    resources: SceneResources,
    /// Size the output should have; differs from the output after a resize.
    requested_extent: vk::Extent2D,
    rebuild: RebuildFlags,
    stats: FrameStats,
    started: Instant,
    frames_submitted: u64,
}

impl Renderer {
    /// Render into a window surface.
    ///
    /// # Safety
    /// The surface must belong to `gpu` and outlive the renderer's use of it;
    /// the renderer destroys it in [`Renderer::destroy`].
    pub unsafe fn with_surface(
        gpu: Arc<GpuDevice>,
        surface: SurfaceContext,
        width: u32,
        height: u32,
        config: RendererConfig,
    ) -> Result<Self> {
        let swapchain = Swapchain::new(&gpu, &surface, width, height, config.vsync, None)?;
        Self::build(gpu, Output::Window { surface, swapchain }, config)
    }

    /// Render into an offscreen image that can be read back.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn offscreen(
        gpu: Arc<GpuDevice>,
        width: u32,
        height: u32,
        config: RendererConfig,
    ) -> Result<Self> {
        let output = OffscreenOutput::new(&gpu, vk::Extent2D { width, height })?;
        Self::build(gpu, Output::Offscreen(output), config)
    }

    unsafe fn build(gpu: Arc<GpuDevice>, output: Output, config: RendererConfig) -> Result<Self> {
        config.validate()?;
        let device = gpu.device();
        let caps = gpu.capabilities();

        let uploader = AssetUploader::new(
            Arc::clone(&gpu),
            config.primary_workers,
            config.secondary_workers,
        )?;
        let samplers = SamplerRegistry::new(
            device,
            caps.supports_anisotropy.then_some(caps.max_sampler_anisotropy),
        )?;
        let layouts = DescriptorLayouts::new(device)?;
        let shaders = ShaderCache::new(config.shader_dir.clone());

        let bindless = if caps.bindless.complete() {
            Some(BindlessTables {
                textures: BindlessTable::new(&gpu, BindlessKind::Textures, config.max_bindless_descriptors)?,
                images: BindlessTable::new(&gpu, BindlessKind::StorageImages, config.max_bindless_descriptors)?,
            })
        } else {
            tracing::warn!("Bindless descriptors unsupported, using classical descriptors only");
            None
        };

        let formats = PassFormats {
            output: output.format(),
            depth: gpu.depth_format(),
            output_layout: output.final_layout(),
        };
        tracing::info!("Depth format: {:?}", formats.depth);
        let passes = RenderPassGraph::new(device, formats)?;
        let extent = output.extent();
        let targets = RenderTargets::new(&gpu, &passes, &output.views(), extent, config.bloom_mip_levels)?;
        let shadows = create_shadow_maps(&gpu, &uploader, &passes, &config)?;

        let mut resources = SceneResources::new(
            &gpu,
            uploader.pools(),
            &layouts,
            &samplers,
            bindless
                .as_ref()
                .map(|_| config.max_bindless_descriptors as usize),
        )?;
        if let Some(tables) = &bindless {
            // Slot 0 is the atlas fallback every unresolved bindless lookup lands on
            let white = resources.defaults.white;
            resources.set_bindless_atlas(&tables.textures, white)?;
        }

        let mut frames = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for slot in 0..MAX_FRAMES_IN_FLIGHT {
            frames.push(FrameResources::new(&gpu, slot)?);
        }

        let mut renderer = Self {
            gpu,
            config,
            uploader,
            shaders,
            samplers,
            layouts,
            passes,
            targets,
            shadows,
            bindless,
            systems: Vec::new(),
            plan: FramePlan::default(),
            frames,
            output,
            resources,
            requested_extent: extent,
            rebuild: RebuildFlags::empty(),
            stats: FrameStats::default(),
            started: Instant::now(),
            frames_submitted: 0,
        };
        renderer.build_systems()?;

        tracing::info!(
            "Renderer ready: {}x{}, {} systems, {} shadow maps",
            extent.width,
            extent.height,
            renderer.plan.len(),
            renderer.shadows.len()
        );
        Ok(renderer)
    }

    unsafe fn build_systems(&mut self) -> Result<()> {
        let device = self.gpu.device();
        for system in &mut self.systems {
            system.destroy(device);
        }
        let mut ctx = SystemContext {
            device,
            shaders: &mut self.shaders,
            passes: &self.passes,
            layouts: &self.layouts,
            bindless: self.bindless.as_ref().map(|b| b.textures.layout()),
        };
        self.systems = default_systems(&mut ctx)?;
        self.plan = FramePlan::new(self.systems.iter().map(|s| s.stage()));
        Ok(())
    }

    pub fn gpu(&self) -> &Arc<GpuDevice> {
        &self.gpu
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn uploader(&self) -> &AssetUploader {
        &self.uploader
    }

    pub fn layouts(&self) -> &DescriptorLayouts {
        &self.layouts
    }

    pub fn samplers(&self) -> &SamplerRegistry {
        &self.samplers
    }

    pub fn resources(&self) -> &SceneResources {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut SceneResources {
        &mut self.resources
    }

    /// Bindless texture table, when the device supports it.
    pub fn bindless_textures(&self) -> Option<&BindlessTable> {
        self.bindless.as_ref().map(|b| &b.textures)
    }

    /// Bindless storage-image table, when the device supports it.
    pub fn bindless_images(&self) -> Option<&BindlessTable> {
        self.bindless.as_ref().map(|b| &b.images)
    }

    /// Current output size.
    pub fn extent(&self) -> vk::Extent2D {
        self.targets.extent()
    }

    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.requested_extent;
        extent.width as f32 / extent.height.max(1) as f32
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.gpu.memory_stats()
    }

    /// Frames submitted to the GPU so far.
    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted
    }

    /// Systems in recording order, with their stages.
    pub fn system_names(&self) -> Vec<(Stage, &'static str)> {
        self.plan
            .iter()
            .flat_map(|(stage, members)| members.iter().map(move |&i| (stage, i)))
            .map(|(stage, i)| (stage, self.systems[i].name()))
            .collect()
    }

    /// The output should now be `width`x`height`. Applied before the next frame.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.requested_extent = vk::Extent2D { width, height };
        if is_renderable(width, height) {
            self.rebuild |= RebuildFlags::SWAPCHAIN;
        }
    }

    /// Upload a model on this thread and store it.
    ///
    /// # Safety
    /// Must be called from the thread that created the renderer.
    pub unsafe fn upload_model(&mut self, builder: &Builder, name: &str) -> Result<Handle<Model>> {
        self.resources
            .upload_model(&self.gpu, self.uploader.pools(), builder, name)
    }

    /// Upload a decoded image on this thread and store it.
    ///
    /// # Safety
    /// Must be called from the thread that created the renderer.
    pub unsafe fn upload_texture(
        &mut self,
        decoded: &DecodedImage,
        srgb: bool,
        name: &str,
    ) -> Result<Handle<Texture>> {
        let (texture, ticket) = upload_texture(&self.gpu, self.uploader.pools(), decoded, srgb, name)?;
        Ok(self.resources.add_texture(texture, ticket))
    }

    /// Register a stored texture in the bindless texture table.
    pub fn register_bindless(&mut self, texture: Handle<Texture>) -> Result<u32> {
        let table = self.bindless.as_ref().map(|tables| &tables.textures).ok_or_else(|| {
            GpuError::CapabilityMissing("bindless descriptor indexing".to_string())
        })?;
        self.resources.register_bindless(table, texture)
    }

    /// Create a classical material.
    ///
    /// # Safety
    /// Must be called from the thread that created the renderer.
    pub unsafe fn add_material(
        &mut self,
        params: MaterialParams,
        textures: MaterialTextures,
    ) -> Result<Handle<Material>> {
        self.resources
            .add_material(&self.gpu, self.uploader.pools(), &self.layouts, params, textures)
    }

    /// Store every upload the workers finished since the last call.
    pub fn adopt_uploads(&mut self) -> Vec<(String, AdoptedAsset)> {
        let mut adopted = Vec::new();
        for upload in self.uploader.drain_completed() {
            match upload {
                CompletedUpload::Texture {
                    name,
                    texture,
                    ticket,
                } => {
                    let handle = self.resources.add_texture(texture, ticket);
                    adopted.push((name, AdoptedAsset::Texture(handle)));
                }
                CompletedUpload::Model { name, model } => {
                    let handle = self.resources.add_model(model);
                    adopted.push((name, AdoptedAsset::Model(handle)));
                }
                CompletedUpload::Failed { name, error } => {
                    tracing::warn!("Upload of {name} failed: {error}");
                }
            }
        }
        adopted
    }

    /// Record and submit one frame of `world` seen through `camera`.
    ///
    /// # Safety
    /// Must be called from the thread that created the renderer.
    pub unsafe fn render(&mut self, world: &World, camera: &Camera, timestep: f32) -> Result<FrameOutcome> {
        self.stats.record(timestep);

        let requested = self.requested_extent;
        if !is_renderable(requested.width, requested.height) {
            return Ok(FrameOutcome::Skipped);
        }
        if !self.rebuild.is_empty() {
            self.apply_rebuild()?;
        }

        let (slot, decision) = self.acquire()?;
        self.rebuild |= decision.rebuild_flags();
        let Some(image_index) = decision.image_index() else {
            tracing::debug!("Swapchain out of date, skipping frame");
            return Ok(FrameOutcome::Skipped);
        };

        let cmd = match self.prepare_frame(world, camera, timestep, slot, decision) {
            Ok(cmd) => cmd,
            Err(e) => {
                self.abandon_frame(decision);
                return Err(e);
            }
        };

        self.submit(slot, image_index, cmd)?;
        self.frames_submitted += 1;
        Ok(FrameOutcome::Rendered)
    }

    /// Everything between acquire and submit: reset the slot, flush pending
    /// descriptor and upload work, and record the command buffer.
    unsafe fn prepare_frame(
        &mut self,
        world: &World,
        camera: &Camera,
        timestep: f32,
        slot: usize,
        decision: FrameDecision,
    ) -> Result<vk::CommandBuffer> {
        let gpu = Arc::clone(&self.gpu);
        let frame = &self.frames[slot];
        frame.command_pool.reset(&gpu)?;
        frame.descriptors.reset(&gpu)?;
        gpu.begin_frame(slot)?;

        if let Some(tables) = &self.bindless {
            let flushed = tables.textures.update(&gpu) + tables.images.update(&gpu);
            if flushed > 0 {
                tracing::trace!("Flushed {flushed} bindless writes");
            }
        }

        self.resources.wait_for_uploads(gpu.device())?;
        self.uploader.reclaim()?;

        let directional = gather_directional_lights(world);
        let views = shadow_views(
            &directional,
            self.shadows.len(),
            self.config.shadow_map_size,
            camera.position,
        );
        let global_set = self.write_globals(slot, world, camera, &directional, &views)?;

        let cmd = self.frames[slot]
            .command_pool
            .allocate(&gpu, vk::CommandBufferLevel::PRIMARY)?;
        begin_command_buffer(gpu.device(), cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        self.record(world, camera, timestep, slot, decision, cmd, global_set, &views)?;
        end_command_buffer(gpu.device(), cmd)?;
        Ok(cmd)
    }

    /// Give back an acquired image whose frame failed before submission.
    unsafe fn abandon_frame(&mut self, decision: FrameDecision) {
        if let Output::Window { swapchain, .. } = &self.output {
            if let Err(e) = swapchain.release_acquired(&self.gpu) {
                tracing::warn!("Failed to release the acquired image: {e}");
            }
        }
        self.rebuild |= RebuildFlags::after_abandoned(decision);
    }

    /// Wait for the slot and take an image.
    unsafe fn acquire(&mut self) -> Result<(usize, FrameDecision)> {
        match &mut self.output {
            Output::Window { swapchain, .. } => {
                let decision = FrameDecision::from_acquire(swapchain.acquire_next(&self.gpu)?);
                Ok((swapchain.current_frame(), decision))
            }
            Output::Offscreen(output) => {
                wait_for_fence(self.gpu.device(), output.fences[output.slot], u64::MAX)?;
                Ok((
                    output.slot,
                    FrameDecision::Record {
                        image_index: 0,
                        rebuild: false,
                    },
                ))
            }
        }
    }

    unsafe fn write_globals(
        &self,
        slot: usize,
        world: &World,
        camera: &Camera,
        directional: &[DirectionalLight],
        views: &[ShadowView],
    ) -> Result<vk::DescriptorSet> {
        let (ambient_color, ambient_intensity) = self.resources.ambient;
        let mut uniforms = GlobalUniformBuffer::default();
        uniforms.set_camera(camera);
        uniforms.set_ambient(ambient_color, ambient_intensity);
        uniforms.set_point_lights(&gather_point_lights(world));
        uniforms.set_directional_lights(directional);
        uniforms.set_shadow_matrices(&shadow_matrices(views, self.shadows.len()));
        uniforms.set_frame_index(slot);

        let frame = &self.frames[slot];
        frame.uniforms.write(std::slice::from_ref(&uniforms))?;

        let set = frame.descriptors.allocate_one(&self.gpu, self.layouts.global)?;
        let mut writer = DescriptorWriter::new();
        writer.uniform_buffer(set, global_binding::UNIFORMS, frame.uniforms.descriptor_info());

        // Every array element must be valid; missing maps repeat the last one
        // (or the white texture when there are none)
        let shadow_sampler = self.samplers.get(SamplerKind::ShadowCompare);
        let fallback = self.resources.texture_view_or_white(None)?;
        for element in 0..MAX_SHADOW_MAPS {
            let (view, layout) = match self.shadows.maps.get(element).or(self.shadows.maps.last()) {
                Some(map) => (map.depth.view.view, vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL),
                None => (fallback, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            };
            writer.image_at(
                set,
                global_binding::SHADOW_MAPS,
                element as u32,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::DescriptorImageInfo::default()
                    .image_view(view)
                    .sampler(shadow_sampler)
                    .image_layout(layout),
            );
        }
        writer.flush(&self.gpu);
        Ok(set)
    }

    #[allow(clippy::too_many_arguments)]
    unsafe fn record(
        &mut self,
        world: &World,
        camera: &Camera,
        timestep: f32,
        slot: usize,
        decision: FrameDecision,
        cmd: vk::CommandBuffer,
        global_set: vk::DescriptorSet,
        views: &[ShadowView],
    ) -> Result<()> {
        let Self {
            gpu,
            config,
            samplers,
            layouts,
            passes,
            targets,
            shadows,
            bindless,
            systems,
            plan,
            frames,
            resources,
            started,
            ..
        } = self;
        let device = gpu.device();
        let extent = targets.extent();
        let image_index = decision.image_index().unwrap_or_default();
        let image = image_index as usize;

        let frame = FrameContext {
            gpu,
            cmd,
            frame_index: slot,
            image_index,
            global_set,
            camera,
            timestep,
            time: started.elapsed().as_secs_f32(),
            extent,
            descriptors: &frames[slot].descriptors,
            samplers,
            layouts,
            passes,
            targets,
            shadow: None,
            bindless_set: bindless.as_ref().map(|b| b.textures.set()),
        };
        let mut scene = SceneView { world, resources };

        for (stage, members) in plan.recorded(decision) {
            match stage {
                Stage::Shadow => {
                    for view in views {
                        let map = &shadows.maps[view.index];
                        begin_render_pass(
                            device,
                            cmd,
                            passes.shadow,
                            map.framebuffer,
                            map.extent(),
                            &[depth_clear_value()],
                        );
                        let shadow_frame = FrameContext {
                            shadow: Some(*view),
                            extent: view.extent,
                            ..frame
                        };
                        run_stage(systems, members, &shadow_frame, &mut scene)?;
                        device.cmd_end_render_pass(cmd);
                    }
                }
                Stage::Geometry => {
                    begin_render_pass(
                        device,
                        cmd,
                        passes.scene,
                        targets.scene_framebuffers[image],
                        extent,
                        &scene_clear_values(config.clear_color),
                    );
                    run_stage(systems, members, &frame, &mut scene)?;
                }
                Stage::Lighting => {
                    device.cmd_next_subpass(cmd, vk::SubpassContents::INLINE);
                    run_stage(systems, members, &frame, &mut scene)?;
                }
                Stage::Transparency => {
                    device.cmd_next_subpass(cmd, vk::SubpassContents::INLINE);
                    run_stage(systems, members, &frame, &mut scene)?;
                    device.cmd_end_render_pass(cmd);
                }
                Stage::Bloom => run_stage(systems, members, &frame, &mut scene)?,
                Stage::PostProcess => {
                    begin_render_pass(
                        device,
                        cmd,
                        passes.post_process,
                        targets.post_framebuffers[image],
                        extent,
                        &[],
                    );
                    run_stage(systems, members, &frame, &mut scene)?;
                    device.cmd_end_render_pass(cmd);
                }
                Stage::Gui => {
                    begin_render_pass(
                        device,
                        cmd,
                        passes.gui,
                        targets.gui_framebuffers[image],
                        extent,
                        &[],
                    );
                    run_stage(systems, members, &frame, &mut scene)?;
                    device.cmd_end_render_pass(cmd);
                }
            }
        }
        Ok(())
    }

    unsafe fn submit(&mut self, slot: usize, image_index: u32, cmd: vk::CommandBuffer) -> Result<()> {
        match &mut self.output {
            Output::Window { swapchain, .. } => {
                let status = swapchain.submit_and_present(&self.gpu, cmd, image_index)?;
                self.rebuild |= RebuildFlags::from_present(status);
            }
            Output::Offscreen(output) => {
                let fence = output.fences[slot];
                reset_fence(self.gpu.device(), fence)?;
                let command_buffers = [cmd];
                let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
                self.gpu.submit(&[submit], fence)?;
                output.image.assume_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
                output.slot = (output.slot + 1) % MAX_FRAMES_IN_FLIGHT;
            }
        }
        Ok(())
    }

    /// Recreate whatever the last frames flagged.
    unsafe fn apply_rebuild(&mut self) -> Result<()> {
        self.gpu.wait_idle()?;
        let mut flags = self.rebuild;
        let extent = self.requested_extent;

        if flags.contains(RebuildFlags::SWAPCHAIN) {
            match &mut self.output {
                Output::Window { surface, swapchain } => {
                    let fresh = Swapchain::new(
                        &self.gpu,
                        surface,
                        extent.width,
                        extent.height,
                        self.config.vsync,
                        Some(&*swapchain),
                    )?;
                    let format_changed = !fresh.compare_formats(swapchain);
                    let old = std::mem::replace(swapchain, fresh);
                    old.destroy(self.gpu.device());
                    flags = flags.expand(format_changed);
                }
                Output::Offscreen(output) => {
                    let (image, view) = create_offscreen_image(&self.gpu, extent)?;
                    let old_image = std::mem::replace(&mut output.image, image);
                    let old_view = std::mem::replace(&mut output.view, view);
                    old_view.destroy(self.gpu.device());
                    self.gpu.destroy_image(old_image);
                    flags = flags.expand(false);
                }
            }
        }

        if flags.rebuilds_passes() {
            let formats = PassFormats {
                output: self.output.format(),
                ..self.passes.formats
            };
            tracing::info!("Output format changed to {:?}, rebuilding render passes", formats.output);
            for system in &mut self.systems {
                system.destroy(self.gpu.device());
            }
            self.systems.clear();
            std::mem::take(&mut self.shadows).destroy(&self.gpu);
            self.passes.destroy(self.gpu.device());
            self.passes = RenderPassGraph::new(self.gpu.device(), formats)?;
            self.shadows = create_shadow_maps(&self.gpu, &self.uploader, &self.passes, &self.config)?;
            self.build_systems()?;
        }

        if flags.rebuilds_targets() {
            let targets = RenderTargets::new(
                &self.gpu,
                &self.passes,
                &self.output.views(),
                self.output.extent(),
                self.config.bloom_mip_levels,
            )?;
            std::mem::replace(&mut self.targets, targets).destroy(&self.gpu);
        }

        self.rebuild = RebuildFlags::empty();
        Ok(())
    }

    /// Copy the last rendered offscreen frame into an image.
    ///
    /// # Safety
    /// Must be called from the thread that created the renderer.
    pub unsafe fn read_output(&self) -> Result<RgbaImage> {
        let Output::Offscreen(output) = &self.output else {
            return Err(GpuError::InvalidState("Readback needs an offscreen output".to_string()).into());
        };
        if self.frames_submitted == 0 {
            return Err(GpuError::InvalidState("No frame rendered yet".to_string()).into());
        }
        self.gpu.wait_idle()?;

        let extent = output.image.extent_2d();
        let buffer = self.gpu.create_buffer(
            u64::from(extent.width) * u64::from(extent.height) * 4,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryUsage::Readback,
            "readback",
        )?;
        let region = vk::BufferImageCopy::default()
            .buffer_offset(buffer.offset)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .layer_count(1),
            )
            .image_extent(output.image.extent);
        let copied = self.uploader.pools().command_pool().map_err(RenderError::from).and_then(|pool| {
            execute_single_time_commands(&self.gpu, pool, |cmd| {
                // SAFETY: the image was left in TRANSFER_SRC_OPTIMAL by the last frame
                unsafe {
                    self.gpu.device().cmd_copy_image_to_buffer(
                        cmd,
                        output.image.image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        buffer.buffer,
                        &[region],
                    );
                }
            })
            .map_err(RenderError::from)
        });
        let bytes = copied.and_then(|()| Ok(buffer.read_bytes()?));
        self.gpu.free_buffer(buffer);

        RgbaImage::from_raw(extent.width, extent.height, bytes?).ok_or_else(|| {
            GpuError::InvalidState("Readback size does not match the output".to_string()).into()
        })
    }

    /// Wait for the GPU, log statistics, and destroy everything.
    ///
    /// # Safety
    /// Must be called from the thread that created the renderer.
    pub unsafe fn destroy(self) -> Result<()> {
        let Self {
            gpu,
            uploader,
            mut shaders,
            samplers,
            layouts,
            passes,
            targets,
            shadows,
            bindless,
            mut systems,
            frames,
            output,
            resources,
            stats,
            ..
        } = self;
        gpu.wait_idle()?;
        stats.log_summary();

        let device = gpu.device();
        for system in &mut systems {
            system.destroy(device);
        }
        resources.destroy(&gpu);
        if let Some(tables) = bindless {
            tables.textures.destroy(device);
            tables.images.destroy(device);
        }
        targets.destroy(&gpu);
        shadows.destroy(&gpu);
        for frame in frames {
            frame.destroy(&gpu);
        }
        match output {
            Output::Window { surface, swapchain } => {
                swapchain.destroy(device);
                surface.destroy();
            }
            Output::Offscreen(output) => output.destroy(&gpu),
        }
        passes.destroy(device);
        shaders.destroy(device);
        layouts.destroy(device);
        samplers.destroy(device);
        uploader.destroy()?;

        let memory = gpu.memory_stats();
        tracing::info!(
            "Memory: peak {} allocations, peak {} bytes, {} bytes still in use",
            memory.peak_allocations,
            memory.peak_total_bytes,
            memory.bytes_in_use
        );
        Ok(())
    }
}

/// Create the shadow maps and move them into the layout the global set samples.
unsafe fn create_shadow_maps(
    gpu: &GpuDevice,
    uploader: &AssetUploader,
    passes: &RenderPassGraph,
    config: &RendererConfig,
) -> Result<ShadowMaps> {
    let count = (config.shadow_map_count as usize).min(MAX_SHADOW_MAPS) as u32;
    let mut shadows = ShadowMaps::new(gpu, passes, count, config.shadow_map_size)?;
    if shadows.is_empty() {
        return Ok(shadows);
    }
    let pool = uploader.pools().command_pool()?;
    let device = gpu.device();
    execute_single_time_commands(gpu, pool, |cmd| {
        for map in &mut shadows.maps {
            // SAFETY: the command buffer is recording and the image is unused
            unsafe {
                map.depth
                    .image
                    .transition(device, cmd, vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL);
            }
        }
    })?;
    Ok(shadows)
}

/// Record every system of a stage. Failures that leave the device usable only
/// drop that system's draws for this frame.
unsafe fn run_stage(
    systems: &mut [Box<dyn RenderSystem>],
    members: &[usize],
    frame: &FrameContext<'_>,
    scene: &mut SceneView<'_>,
) -> Result<()> {
    for &index in members {
        let system = &mut systems[index];
        if let Err(e) = system.record(frame, scene) {
            if e.is_fatal() {
                tracing::error!("{} failed: {e}", system.name());
                return Err(e);
            }
            tracing::warn!("{} skipped this frame: {e}", system.name());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn light(shadow_map: Option<u32>) -> DirectionalLight {
        DirectionalLight {
            direction: Vec3::new(0.3, -1.0, 0.2),
            shadow_map,
            ..DirectionalLight::default()
        }
    }

    #[test]
    fn stats_track_min_max_and_average() {
        let mut stats = FrameStats::default();
        assert!(stats.average_fps().is_none());
        stats.record(0.5);
        stats.record(0.25);
        stats.record(0.0);
        assert_eq!(stats.frames, 3);
        assert_relative_eq!(stats.min_fps, 2.0);
        assert_relative_eq!(stats.max_fps, 4.0);
        assert_relative_eq!(stats.average_fps().unwrap(), 3.0);
    }

    #[test]
    fn only_lights_naming_a_map_cast_shadows() {
        let lights = [light(None), light(Some(1)), light(Some(0))];
        let views = shadow_views(&lights, 2, 1024, Vec3::ZERO);
        let indices: Vec<usize> = views.iter().map(|v| v.index).collect();
        assert_eq!(indices, vec![1, 0]);
        assert_eq!(views[0].extent.width, 1024);
    }

    #[test]
    fn out_of_range_and_duplicate_maps_are_ignored() {
        let lights = [light(Some(5)), light(Some(0)), light(Some(0))];
        let views = shadow_views(&lights, 2, 512, Vec3::ZERO);
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].index, 0);
    }

    #[test]
    fn unused_shadow_slots_hold_identity() {
        let views = shadow_views(&[light(Some(1))], 3, 512, Vec3::ZERO);
        let matrices = shadow_matrices(&views, 3);
        assert_eq!(matrices.len(), 3);
        assert_eq!(matrices[0], Mat4::IDENTITY);
        assert_eq!(matrices[1], views[0].light_view_projection);
        assert_eq!(matrices[2], Mat4::IDENTITY);
    }

    #[test]
    fn shadow_matrix_count_is_capped() {
        assert_eq!(shadow_matrices(&[], MAX_SHADOW_MAPS + 4).len(), MAX_SHADOW_MAPS);
    }
}
