//! Core constants, configuration, and error types for the Lucre engine.
//!
//! This crate provides the foundational pieces shared by every other crate:
//! - Engine-wide constants (frames in flight, descriptor limits, light limits)
//! - Renderer configuration loadable from TOML
//! - Common error types

pub mod config;
pub mod error;

pub use config::{ConfigError, RendererConfig};
pub use error::{Error, Result};

/// Engine-wide constants
pub mod constants {
    /// Number of frames whose GPU work may be queued at once.
    pub const MAX_FRAMES_IN_FLIGHT: usize = 2;
    /// Size of each bindless descriptor array.
    pub const MAX_DESCRIPTOR: u32 = 65_536;
    /// Bindless index reserved for the texture atlas fallback.
    pub const TEXTURE_ATLAS_INDEX: u32 = 0;
    /// Maximum point lights in the global uniform buffer.
    pub const MAX_LIGHTS: usize = 64;
    /// Maximum shadow maps referenced by the global uniform buffer.
    pub const MAX_SHADOW_MAPS: usize = 4;
    /// Default number of mip levels in the bloom chain.
    pub const DEFAULT_BLOOM_MIP_LEVELS: u32 = 6;
    /// Push constant budget per render system (vertex + fragment).
    pub const MAX_PUSH_CONSTANT_BYTES: u32 = 128;
    /// Depth bias constant factor used by shadow pipelines.
    pub const SHADOW_DEPTH_BIAS_CONSTANT: f32 = 8.0;
    /// Depth bias slope factor used by shadow pipelines.
    pub const SHADOW_DEPTH_BIAS_SLOPE: f32 = 3.0;
}
