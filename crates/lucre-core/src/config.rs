//! Renderer configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{DEFAULT_BLOOM_MIP_LEVELS, MAX_DESCRIPTOR, MAX_SHADOW_MAPS};

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A value is outside the range the renderer supports
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Renderer settings shared by the scheduler, passes, and asset workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Prefer vsync-locked present modes.
    pub vsync: bool,
    /// Enable Vulkan validation layers.
    pub validation: bool,
    /// Mip levels of the emission image walked by the bloom chain.
    pub bloom_mip_levels: u32,
    /// Number of shadow maps rendered per frame.
    pub shadow_map_count: u32,
    /// Edge length of each (square) shadow map in texels.
    pub shadow_map_size: u32,
    /// Descriptor count of each bindless array.
    pub max_bindless_descriptors: u32,
    /// Directory holding compiled `*.vert.spv` / `*.frag.spv` files.
    pub shader_dir: PathBuf,
    /// Threads in the primary worker pool (decode, upload).
    pub primary_workers: usize,
    /// Threads in the secondary worker pool (mesh compile, mipmaps).
    pub secondary_workers: usize,
    /// Clear color of the presentable image.
    pub clear_color: [f32; 4],
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            validation: cfg!(debug_assertions),
            bloom_mip_levels: DEFAULT_BLOOM_MIP_LEVELS,
            shadow_map_count: 2,
            shadow_map_size: 2048,
            max_bindless_descriptors: MAX_DESCRIPTOR,
            shader_dir: PathBuf::from("bin-int"),
            primary_workers: 4,
            secondary_workers: 2,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl RendererConfig {
    /// Load configuration from a `.toml` file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            return Err(ConfigError::UnsupportedFormat(path.display().to_string()));
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text and validate it.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a `.toml` file.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            return Err(ConfigError::UnsupportedFormat(path.display().to_string()));
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=12).contains(&self.bloom_mip_levels) {
            return Err(ConfigError::Invalid {
                field: "bloom_mip_levels",
                reason: format!("{} is outside 1..=12", self.bloom_mip_levels),
            });
        }
        if self.shadow_map_count as usize > MAX_SHADOW_MAPS {
            return Err(ConfigError::Invalid {
                field: "shadow_map_count",
                reason: format!("at most {MAX_SHADOW_MAPS} shadow maps"),
            });
        }
        if !self.shadow_map_size.is_power_of_two() {
            return Err(ConfigError::Invalid {
                field: "shadow_map_size",
                reason: format!("{} is not a power of two", self.shadow_map_size),
            });
        }
        // Index 0 is the atlas fallback, so at least one real slot is needed.
        if self.max_bindless_descriptors < 2 {
            return Err(ConfigError::Invalid {
                field: "max_bindless_descriptors",
                reason: "must be at least 2".to_string(),
            });
        }
        if self.primary_workers == 0 {
            return Err(ConfigError::Invalid {
                field: "primary_workers",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Path of a compiled vertex shader.
    pub fn vertex_shader_path(&self, name: &str) -> PathBuf {
        self.shader_dir.join(format!("{name}.vert.spv"))
    }

    /// Path of a compiled fragment shader.
    pub fn fragment_shader_path(&self, name: &str) -> PathBuf {
        self.shader_dir.join(format!("{name}.frag.spv"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bloom_mip_levels, 6);
        assert_eq!(config.max_bindless_descriptors, 65_536);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config = RendererConfig::from_toml_str("bloom_mip_levels = 4\nvsync = false\n").unwrap();
        assert_eq!(config.bloom_mip_levels, 4);
        assert!(!config.vsync);
        assert_eq!(config.shadow_map_size, 2048);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = RendererConfig::from_toml_str("bloom_mip_levels = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "bloom_mip_levels", .. }));

        let err = RendererConfig::from_toml_str("shadow_map_size = 1000").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "shadow_map_size", .. }));
    }

    #[test]
    fn toml_round_trip_through_file() {
        let dir = std::env::temp_dir().join(format!("lucre-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("renderer.toml");

        let mut config = RendererConfig::default();
        config.shadow_map_count = 1;
        config.save_to_file(&path).unwrap();

        let loaded = RendererConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let err = RendererConfig::load_from_file("renderer.json").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(_)));
    }

    #[test]
    fn shader_paths_use_shader_dir() {
        let config = RendererConfig::default();
        assert_eq!(
            config.vertex_shader_path("pbr"),
            PathBuf::from("bin-int/pbr.vert.spv")
        );
        assert_eq!(
            config.fragment_shader_path("pbr"),
            PathBuf::from("bin-int/pbr.frag.spv")
        );
    }
}
