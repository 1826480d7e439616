//! Application context.

use std::sync::Arc;
use std::time::Instant;

use glam::Vec3;
use lucre_core::RendererConfig;
use lucre_entity::{active_camera, World};
use lucre_gpu::{GpuDevice, SurfaceContext};
use lucre_render::{Camera, Renderer};
use winit::window::Window;

/// Application context shared across all app methods.
pub struct AppContext {
    /// The window handle.
    pub window: Arc<Window>,
    /// Renderer drawing `world` into the window.
    pub renderer: Renderer,
    /// Entities to draw.
    pub world: World,
    /// Used when the world has no active camera entity.
    pub camera: Camera,
    /// Total frames rendered.
    pub frame_count: u64,
    /// Time of last frame (for delta time calculation).
    pub(crate) last_frame_time: Instant,
}

impl AppContext {
    /// Create the surface and renderer for `window`.
    ///
    /// # Safety
    /// The window must have valid handles and outlive the context.
    pub(crate) unsafe fn new(
        window: Arc<Window>,
        gpu: Arc<GpuDevice>,
        config: RendererConfig,
    ) -> anyhow::Result<Self> {
        // SAFETY: caller guarantees the window handles stay valid
        let surface = unsafe { SurfaceContext::from_window(&gpu, window.as_ref())? };

        let size = window.inner_size();
        let width = size.width.max(1);
        let height = size.height.max(1);

        // SAFETY: the surface was created from `gpu` and is handed to the renderer
        let renderer = unsafe { Renderer::with_surface(gpu, surface, width, height, config)? };

        let camera = Camera::perspective(
            Vec3::new(0.0, 2.0, 6.0),
            Vec3::ZERO,
            60f32.to_radians(),
            width as f32 / height as f32,
        );

        Ok(Self {
            window,
            renderer,
            world: World::new(),
            camera,
            frame_count: 0,
            last_frame_time: Instant::now(),
        })
    }

    /// The device shared with the renderer and its workers.
    pub fn gpu(&self) -> &Arc<GpuDevice> {
        self.renderer.gpu()
    }

    /// Get the output width.
    pub fn width(&self) -> u32 {
        self.renderer.extent().width
    }

    /// Get the output height.
    pub fn height(&self) -> u32 {
        self.renderer.extent().height
    }

    /// Get the aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f32 {
        self.renderer.aspect_ratio()
    }

    /// The camera to render with: the world's active camera entity if any,
    /// otherwise [`AppContext::camera`].
    pub fn view_camera(&self) -> Camera {
        let aspect = self.aspect_ratio();
        match active_camera(&self.world) {
            Some((transform, component)) => Camera::from_entity(&transform, &component, aspect),
            None => {
                let mut camera = self.camera.clone();
                camera.set_aspect(aspect);
                camera
            }
        }
    }

    /// Destroy the renderer and everything it owns.
    ///
    /// # Safety
    /// Must be called on the thread that created the context.
    pub(crate) unsafe fn cleanup(self) -> anyhow::Result<()> {
        // SAFETY: this is the thread that created the renderer
        unsafe { self.renderer.destroy()? };
        Ok(())
    }
}
