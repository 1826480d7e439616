//! Application framework for the Lucre engine.
//!
//! This crate handles the boilerplate around the renderer:
//! - Logging setup
//! - Window creation and the winit event loop
//! - Device, surface, and renderer initialization
//! - Resize handling and frame pacing
//!
//! # Example
//!
//! ```no_run
//! use lucre_app::{run_app, AppConfig, AppContext, FrameInfo, LucreApp};
//!
//! struct MyApp;
//!
//! impl LucreApp for MyApp {
//!     fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, ctx: &mut AppContext, dt: f32) {}
//!
//!     fn render(&mut self, ctx: &mut AppContext, frame: &FrameInfo) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;

pub use app::LucreApp;
pub use context::AppContext;
pub use frame::FrameInfo;
pub use runner::{run_app, AppConfig};

pub use lucre_core::RendererConfig;
pub use lucre_gpu::GpuDevice;
pub use lucre_render::{Camera, Renderer};
pub use winit::event::{DeviceEvent, DeviceId, WindowEvent};
