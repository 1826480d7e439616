//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Descriptor-indexing features the bindless registries depend on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindlessFeatures {
    pub runtime_descriptor_array: bool,
    pub partially_bound: bool,
    pub variable_descriptor_count: bool,
    pub sampled_image_update_after_bind: bool,
    pub storage_image_update_after_bind: bool,
    pub sampled_image_non_uniform_indexing: bool,
}

impl BindlessFeatures {
    /// Whether every feature needed for bindless arrays is present.
    pub fn complete(&self) -> bool {
        self.runtime_descriptor_array
            && self.partially_bound
            && self.variable_descriptor_count
            && self.sampled_image_update_after_bind
            && self.storage_image_update_after_bind
            && self.sampled_image_non_uniform_indexing
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Timeline semaphore support (VK 1.2 core feature)
    pub supports_timeline_semaphores: bool,
    /// Buffer device address support
    pub supports_buffer_device_address: bool,
    /// Anisotropic filtering support
    pub supports_anisotropy: bool,
    /// 64-bit integers in shaders, used for device addresses
    pub supports_shader_int64: bool,
    /// Descriptor indexing features for bindless arrays
    pub bindless: BindlessFeatures,

    // Memory info
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Maximum memory allocation count
    pub max_memory_allocation_count: u32,

    // Limits
    /// Maximum sampler anisotropy
    pub max_sampler_anisotropy: f32,
    /// Minimum alignment of uniform buffer offsets
    pub min_uniform_buffer_offset_alignment: u64,
    /// Minimum alignment of storage buffer offsets
    pub min_storage_buffer_offset_alignment: u64,
    /// Maximum push constant size in bytes
    pub max_push_constants_size: u32,
    /// Maximum sampled images per stage when update-after-bind is used
    pub max_update_after_bind_sampled_images: u32,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let mut indexing_properties = vk::PhysicalDeviceDescriptorIndexingProperties::default();
        let mut properties2 =
            vk::PhysicalDeviceProperties2::default().push_next(&mut indexing_properties);
        instance.get_physical_device_properties2(physical_device, &mut properties2);
        let max_update_after_bind_sampled_images =
            indexing_properties.max_per_stage_descriptor_update_after_bind_sampled_images;

        let mut vulkan_1_2 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_2);
        instance.get_physical_device_features2(physical_device, &mut features2);
        let base_features = features2.features;

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let bindless = BindlessFeatures {
            runtime_descriptor_array: vulkan_1_2.runtime_descriptor_array == vk::TRUE,
            partially_bound: vulkan_1_2.descriptor_binding_partially_bound == vk::TRUE,
            variable_descriptor_count: vulkan_1_2.descriptor_binding_variable_descriptor_count
                == vk::TRUE,
            sampled_image_update_after_bind: vulkan_1_2
                .descriptor_binding_sampled_image_update_after_bind
                == vk::TRUE,
            storage_image_update_after_bind: vulkan_1_2
                .descriptor_binding_storage_image_update_after_bind
                == vk::TRUE,
            sampled_image_non_uniform_indexing: vulkan_1_2
                .shader_sampled_image_array_non_uniform_indexing
                == vk::TRUE,
        };

        Self {
            vendor,
            device_name,
            api_version: properties.api_version,
            driver_version: properties.driver_version,

            supports_timeline_semaphores: vulkan_1_2.timeline_semaphore == vk::TRUE,
            supports_buffer_device_address: vulkan_1_2.buffer_device_address == vk::TRUE,
            supports_anisotropy: base_features.sampler_anisotropy == vk::TRUE,
            supports_shader_int64: base_features.shader_int64 == vk::TRUE,
            bindless,

            device_local_memory_mb,
            max_memory_allocation_count: properties.limits.max_memory_allocation_count,

            max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,
            min_uniform_buffer_offset_alignment: properties
                .limits
                .min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: properties
                .limits
                .min_storage_buffer_offset_alignment,
            max_push_constants_size: properties.limits.max_push_constants_size,
            max_update_after_bind_sampled_images,

            available_extensions,
        }
    }

    /// List the capabilities the renderer needs but this device lacks.
    pub fn missing_requirements(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();

        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);
        if api_major < 1 || (api_major == 1 && api_minor < 2) {
            missing.push("Vulkan 1.2");
        }
        if !self.supports_timeline_semaphores {
            missing.push("timeline semaphores");
        }
        if !self.supports_buffer_device_address {
            missing.push("buffer device address");
        }
        if !self.supports_shader_int64 {
            missing.push("shader int64");
        }
        if !self.bindless.complete() {
            missing.push("bindless descriptor indexing");
        }
        if !self.available_extensions.contains("VK_KHR_swapchain") {
            missing.push("VK_KHR_swapchain");
        }

        missing
    }

    /// Check if the GPU meets minimum requirements for the engine.
    pub fn meets_requirements(&self) -> bool {
        self.missing_requirements().is_empty()
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capable_device() -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Amd,
            device_name: "test".to_string(),
            api_version: vk::make_api_version(0, 1, 3, 0),
            driver_version: 0,
            supports_timeline_semaphores: true,
            supports_buffer_device_address: true,
            supports_anisotropy: true,
            supports_shader_int64: true,
            bindless: BindlessFeatures {
                runtime_descriptor_array: true,
                partially_bound: true,
                variable_descriptor_count: true,
                sampled_image_update_after_bind: true,
                storage_image_update_after_bind: true,
                sampled_image_non_uniform_indexing: true,
            },
            device_local_memory_mb: 8192,
            max_memory_allocation_count: 4096,
            max_sampler_anisotropy: 16.0,
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 64,
            max_push_constants_size: 256,
            max_update_after_bind_sampled_images: 1 << 20,
            available_extensions: ["VK_KHR_swapchain".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
    }

    #[test]
    fn complete_device_meets_requirements() {
        assert!(capable_device().meets_requirements());
    }

    #[test]
    fn missing_bindless_is_reported() {
        let mut caps = capable_device();
        caps.bindless.partially_bound = false;
        assert_eq!(caps.missing_requirements(), vec!["bindless descriptor indexing"]);
    }

    #[test]
    fn missing_shader_int64_is_reported() {
        let mut caps = capable_device();
        caps.supports_shader_int64 = false;
        assert_eq!(caps.missing_requirements(), vec!["shader int64"]);
        assert!(!caps.meets_requirements());
    }

    #[test]
    fn old_api_version_is_reported() {
        let mut caps = capable_device();
        caps.api_version = vk::make_api_version(0, 1, 1, 0);
        caps.supports_timeline_semaphores = false;
        let missing = caps.missing_requirements();
        assert!(missing.contains(&"Vulkan 1.2"));
        assert!(missing.contains(&"timeline semaphores"));
    }
}
