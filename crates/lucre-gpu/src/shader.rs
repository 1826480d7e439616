//! Precompiled SPIR-V shader loading.
//!
//! Shaders live in one directory as `<name>.vert.spv` / `<name>.frag.spv` and
//! are turned into modules once per path.

use std::path::{Path, PathBuf};

use ash::vk;
use hashbrown::HashMap;

use crate::error::{GpuError, Result};

/// SPIR-V magic number (little-endian first word).
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Shader stage, determines the file suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    /// File suffix, e.g. `vert.spv`.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Vertex => "vert.spv",
            Self::Fragment => "frag.spv",
        }
    }

    /// Matching Vulkan stage flag.
    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

/// Decode SPIR-V bytes into words, validating length and magic.
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(GpuError::ShaderLoad(format!(
            "SPIR-V length {} is not a positive multiple of 4",
            bytes.len()
        )));
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    if words[0] != SPIRV_MAGIC {
        return Err(GpuError::ShaderLoad(format!(
            "Bad SPIR-V magic {:#010x}",
            words[0]
        )));
    }
    Ok(words)
}

/// Create a shader module from SPIR-V words.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::default().code(code);
    device
        .create_shader_module(&info, None)
        .map_err(|e| GpuError::ShaderLoad(e.to_string()))
}

/// Loads shader modules from a directory and keeps them until destroyed.
#[derive(Debug)]
pub struct ShaderCache {
    dir: PathBuf,
    modules: HashMap<PathBuf, vk::ShaderModule>,
}

impl ShaderCache {
    /// Create an empty cache rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            modules: HashMap::new(),
        }
    }

    /// Shader directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a shader stage file.
    pub fn path_of(&self, name: &str, stage: ShaderStage) -> PathBuf {
        self.dir.join(format!("{name}.{}", stage.suffix()))
    }

    /// Load (or reuse) the module for `name` at `stage`.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn load(
        &mut self,
        device: &ash::Device,
        name: &str,
        stage: ShaderStage,
    ) -> Result<vk::ShaderModule> {
        let path = self.path_of(name, stage);
        if let Some(&module) = self.modules.get(&path) {
            return Ok(module);
        }

        let bytes = std::fs::read(&path)
            .map_err(|e| GpuError::ShaderLoad(format!("{}: {e}", path.display())))?;
        let code = parse_spirv(&bytes)
            .map_err(|e| GpuError::ShaderLoad(format!("{}: {e}", path.display())))?;
        let module = create_shader_module(device, &code)?;

        tracing::debug!("Loaded shader {}", path.display());
        self.modules.insert(path, module);
        Ok(module)
    }

    /// Load the vertex and fragment modules of a shader pair.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn load_pair(
        &mut self,
        device: &ash::Device,
        name: &str,
    ) -> Result<(vk::ShaderModule, vk::ShaderModule)> {
        let vertex = self.load(device, name, ShaderStage::Vertex)?;
        let fragment = self.load(device, name, ShaderStage::Fragment)?;
        Ok((vertex, fragment))
    }

    /// Number of cached modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Destroy every module. Pipelines built from them stay valid.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for (_, module) in self.modules.drain() {
            device.destroy_shader_module(module, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spirv_header() -> Vec<u8> {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0500u32.to_le_bytes());
        bytes
    }

    #[test]
    fn valid_spirv_is_decoded() {
        let words = parse_spirv(&spirv_header()).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0500]);
    }

    #[test]
    fn misaligned_or_empty_input_is_rejected() {
        assert!(matches!(parse_spirv(&[]), Err(GpuError::ShaderLoad(_))));
        let mut bytes = spirv_header();
        bytes.push(0);
        assert!(matches!(parse_spirv(&bytes), Err(GpuError::ShaderLoad(_))));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let bytes = [0xde, 0xad, 0xbe, 0xef];
        assert!(matches!(parse_spirv(&bytes), Err(GpuError::ShaderLoad(_))));
    }

    #[test]
    fn stage_files_follow_naming() {
        let cache = ShaderCache::new("shaders");
        assert_eq!(
            cache.path_of("pbr", ShaderStage::Vertex),
            Path::new("shaders").join("pbr.vert.spv")
        );
        assert_eq!(
            cache.path_of("pbr", ShaderStage::Fragment),
            Path::new("shaders").join("pbr.frag.spv")
        );
        assert!(cache.is_empty());
    }
}
