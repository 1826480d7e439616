//! `LucreApp` trait definition.

use winit::event::{DeviceEvent, DeviceId, WindowEvent};

use crate::context::AppContext;
use crate::frame::FrameInfo;

/// Trait for Lucre applications.
///
/// The framework owns the window, the device, and the [`lucre_render::Renderer`];
/// the application fills the world and the scene resources and the renderer
/// draws them every frame.
pub trait LucreApp: Sized {
    /// Initialize the application.
    ///
    /// Called once, after the window and renderer have been created. Upload
    /// models and spawn entities here.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every frame before rendering.
    ///
    /// # Arguments
    /// * `ctx` - Application context with the world and renderer
    /// * `dt` - Delta time in seconds since last frame
    fn update(&mut self, ctx: &mut AppContext, dt: f32);

    /// Prepare per-frame render data.
    ///
    /// Called after `update()` and right before the renderer records the
    /// frame. Fill the GUI draw list or tweak scene parameters here; the
    /// framework handles acquiring, recording, submitting, and presenting.
    #[allow(unused_variables)]
    fn render(&mut self, ctx: &mut AppContext, frame: &FrameInfo) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window resize.
    ///
    /// The renderer rebuilds its swapchain and targets on its own; override
    /// this to update size-dependent application state.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events.
    ///
    /// Return `true` if the event was handled and should not be processed further.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Handle raw device events.
    #[allow(unused_variables)]
    fn on_device_event(&mut self, device_id: DeviceId, event: &DeviceEvent) {}

    /// Cleanup before shutdown.
    ///
    /// The GPU is idle when this is called. Resources stored in the renderer's
    /// scene resources are destroyed by the framework afterwards.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
