//! Application runner and event loop.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lucre_core::RendererConfig;
use lucre_gpu::GpuDeviceBuilder;
use lucre_render::FrameOutcome;
use tracing::{error, info, trace, warn};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::LucreApp;
use crate::context::AppContext;
use crate::frame::FrameInfo;

/// Application configuration.
#[derive(Clone)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Renderer settings.
    pub renderer: RendererConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Lucre".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            renderer: RendererConfig::default(),
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the target FPS.
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.renderer.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.renderer.validation = validation;
        self
    }

    /// Replace the renderer settings.
    pub fn with_renderer_config(mut self, renderer: RendererConfig) -> Self {
        self.renderer = renderer;
        self
    }

    /// Load the renderer settings from a TOML file, keeping defaults if the
    /// file does not exist.
    pub fn with_renderer_config_file(mut self, path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            self.renderer = RendererConfig::load_from_file(path)?;
        }
        Ok(self)
    }
}

/// Run a `LucreApp` with the given configuration.
///
/// This function initializes logging, creates the window, device, and
/// renderer, and runs the event loop until the application exits. A fatal
/// render error stops the loop and is returned.
pub fn run_app<A: LucreApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    // Initialize logging; ignore a subscriber already installed by the caller
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    config.renderer.validate()?;
    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        failure: None,
    };

    event_loop.run_app(&mut runner)?;

    match runner.failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Internal application runner that implements winit's `ApplicationHandler`.
struct AppRunner<A: LucreApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    failure: Option<anyhow::Error>,
}

/// Internal application state.
struct AppState<A: LucreApp> {
    ctx: AppContext,
    app: A,
    target_frame_time: Option<Duration>,
}

impl<A: LucreApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.failure = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        // Let the app handle the event first
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.shutdown(event_loop);
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                match state.render_frame() {
                    Ok(()) => state.ctx.window.request_redraw(),
                    Err(e) => {
                        error!("Fatal render error: {e:#}");
                        self.failure = Some(e);
                        self.shutdown(event_loop);
                    }
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    if let Err(e) = state.handle_resize(size.width, size.height) {
                        error!("Resize error: {e:#}");
                    }
                }
            }
            _ => {}
        }
    }

    fn device_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        device_id: DeviceId,
        event: DeviceEvent,
    ) {
        if let Some(state) = &mut self.state {
            state.app.on_device_event(device_id, &event);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: LucreApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        // Create window
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);

        // Create device
        let gpu = GpuDeviceBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.renderer.validation)
            .present_to(window.as_ref())?
            .build()?;

        info!("GPU: {}", gpu.capabilities().summary());

        // SAFETY: the window is kept alive by the context that owns the surface
        let mut ctx = unsafe { AppContext::new(window, Arc::new(gpu), self.config.renderer.clone())? };

        // Initialize the application
        let app = A::init(&mut ctx)?;

        let target_frame_time = self
            .config
            .target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)));

        Ok(AppState {
            ctx,
            app,
            target_frame_time,
        })
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(state) = self.state.take() {
            state.cleanup();
        }
        event_loop.exit();
    }
}

impl<A: LucreApp> AppState<A> {
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();

        // Calculate delta time
        let dt = frame_start
            .duration_since(self.ctx.last_frame_time)
            .as_secs_f32();
        self.ctx.last_frame_time = frame_start;

        self.app.update(&mut self.ctx, dt);

        let frame = FrameInfo {
            dt,
            frame_number: self.ctx.frame_count,
            width: self.ctx.width(),
            height: self.ctx.height(),
        };
        self.app.render(&mut self.ctx, &frame)?;

        let camera = self.ctx.view_camera();
        // SAFETY: the event loop runs on the thread that created the renderer
        let outcome = unsafe { self.ctx.renderer.render(&self.ctx.world, &camera, dt) };
        match outcome {
            Ok(FrameOutcome::Rendered) => self.ctx.frame_count += 1,
            Ok(FrameOutcome::Skipped) => trace!("Frame skipped"),
            Err(e) if !e.is_fatal() => warn!("Frame dropped: {e}"),
            Err(e) => return Err(e.into()),
        }

        // Frame pacing
        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }

        Ok(())
    }

    fn handle_resize(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        self.ctx.renderer.resize(width, height);
        if width == 0 || height == 0 {
            info!("Window minimized, pausing rendering");
            return Ok(());
        }

        // Notify the application
        self.app.on_resize(&mut self.ctx, width, height)?;

        info!("Resized to {}x{}", width, height);
        Ok(())
    }

    fn cleanup(mut self) {
        info!("Starting cleanup...");
        if let Err(e) = self.ctx.gpu().wait_idle() {
            error!("Failed to wait idle: {e}");
        }

        // Let the app cleanup first
        self.app.cleanup(&mut self.ctx);

        // Then the renderer, which logs the frame statistics
        // SAFETY: cleanup runs on the event loop thread that created the context
        match unsafe { self.ctx.cleanup() } {
            Ok(()) => info!("Cleanup complete"),
            Err(e) => error!("Cleanup failed: {e:#}"),
        }
    }
}
