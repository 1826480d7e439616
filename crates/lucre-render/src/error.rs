//! Render error types.

use lucre_gpu::GpuError;
use thiserror::Error;

/// Errors raised by the render layer.
#[derive(Error, Debug)]
pub enum RenderError {
    /// GPU error.
    #[error(transparent)]
    Gpu(#[from] GpuError),

    /// Image file could not be read or decoded.
    #[error("Failed to decode {path}: {reason}")]
    Decode { path: String, reason: String },

    /// Model data is inconsistent.
    #[error("Invalid model: {0}")]
    InvalidModel(String),

    /// A handle does not point at a live resource.
    #[error("Stale handle: {0}")]
    StaleHandle(String),

    /// A worker task panicked or was dropped before finishing.
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] lucre_core::ConfigError),
}

impl RenderError {
    /// Whether the renderer must stop after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Gpu(e) => e.is_fatal(),
            Self::Decode { .. } | Self::InvalidModel(_) | Self::StaleHandle(_) => false,
            Self::TaskFailed(_) | Self::Config(_) => true,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RenderError>;
