//! Frame graph rendering for the Lucre engine.
//!
//! This crate provides:
//! - The render-pass graph (shadow, 3D with geometry/lighting/transparency
//!   subpasses, bloom chain, post-processing, GUI) and its targets
//! - Baked pipelines and the render systems recording into each stage
//! - Models, instance buffers, materials, textures, and image-based lighting
//! - Asset upload on rayon worker pools
//! - The frame scheduler driving it all

pub mod arena;
pub mod assets;
pub mod camera;
pub mod error;
pub mod ibl;
pub mod instance;
pub mod layouts;
pub mod material;
pub mod model;
pub mod pipelines;
pub mod plan;
pub mod render_pass;
pub mod resources;
pub mod scheduler;
pub mod systems;
pub mod targets;
pub mod texture;
pub mod uniforms;

pub use arena::{Arena, Handle};
pub use assets::{AssetUploader, CompletedUpload, TaskHandle, WorkerPool};
pub use camera::{directional_shadow_matrix, Camera};
pub use error::{RenderError, Result};
pub use ibl::{IblBuilder, IblFiles};
pub use instance::InstanceBuffer;
pub use material::{Material, MaterialParams, MaterialTextures};
pub use model::{Builder, MaterialRef, Model, Submesh, Vertex};
pub use pipelines::{PipelineId, Stage};
pub use plan::{FrameDecision, FramePlan, RebuildFlags};
pub use render_pass::RenderPassGraph;
pub use resources::SceneResources;
pub use scheduler::{AdoptedAsset, FrameOutcome, FrameStats, Renderer};
pub use systems::gui::{GuiDrawList, GuiVertex};
pub use systems::RenderSystem;
pub use texture::{DecodedImage, Texture};
pub use uniforms::GlobalUniformBuffer;
