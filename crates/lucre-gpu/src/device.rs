//! GPU device management.
//!
//! [`GpuDevice`] owns the logical device, its queues, and the memory allocator.
//! A single mutex serializes every call that mutates GPU-visible state: memory
//! allocation, descriptor writes, pool operations, and queue submission. Callers
//! that also hold a bindless registry lock must take it first.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::{
    Buffer, GpuMemoryBackend, Image, ImageDesc, MemoryAllocator, MemoryStats, MemoryUsage,
};
use ash::vk;
use lucre_core::constants::MAX_FRAMES_IN_FLIGHT;
use parking_lot::{Mutex, MutexGuard};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;
use std::sync::Arc;

/// Depth formats in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// State guarded by the device mutex.
pub struct DeviceState {
    pub allocator: MemoryAllocator<GpuMemoryBackend>,
}

/// The logical GPU, its queues, and the device-wide lock.
pub struct GpuDevice {
    // Entry must be kept alive for the lifetime of the device
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) depth_format: vk::Format,
    pub(crate) graphics_queue_family: u32,
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) headless: bool,
    state: Mutex<DeviceState>,
}

impl GpuDevice {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the Vulkan entry point.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Depth format chosen at startup.
    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    /// Get the graphics queue. It also presents.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the graphics queue family index.
    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Whether the device was created without surface support.
    pub fn is_headless(&self) -> bool {
        self.headless
    }

    /// Take the device-wide lock.
    pub fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock()
    }

    /// Allocate a buffer range.
    pub fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory: MemoryUsage,
        name: &str,
    ) -> Result<Buffer> {
        self.lock().allocator.create_buffer(size, usage, memory, name)
    }

    /// Retire a buffer; it is destroyed once its frame slot comes around again.
    pub fn free_buffer(&self, buffer: Buffer) {
        self.lock().allocator.free_buffer(buffer);
    }

    /// Create an image.
    pub fn create_image(&self, desc: &ImageDesc, name: &str) -> Result<Image> {
        self.lock().allocator.create_image(desc, name)
    }

    /// Retire an image.
    pub fn destroy_image(&self, image: Image) {
        self.lock().allocator.destroy_image(image);
    }

    /// Recycle everything retired the last time `frame_index` was recorded.
    pub fn begin_frame(&self, frame_index: usize) -> Result<()> {
        self.lock().allocator.begin_frame(frame_index)
    }

    /// Allocator telemetry.
    pub fn memory_stats(&self) -> MemoryStats {
        self.lock().allocator.stats()
    }

    /// Submit work to the graphics queue.
    ///
    /// # Safety
    /// Every handle referenced by `submits` must be valid.
    pub unsafe fn submit(&self, submits: &[vk::SubmitInfo<'_>], fence: vk::Fence) -> Result<()> {
        let _guard = self.lock();
        self.device
            .queue_submit(self.graphics_queue, submits, fence)
            .map_err(|e| {
                let err = GpuError::from(e);
                if matches!(err, GpuError::DeviceLost) {
                    tracing::error!("Queue submit failed: device lost");
                }
                err
            })
    }

    /// Present on the graphics queue.
    ///
    /// Returns whether the swapchain is suboptimal; out-of-date comes back as an error.
    ///
    /// # Safety
    /// Every handle referenced by `present_info` must be valid.
    pub unsafe fn present(
        &self,
        loader: &ash::khr::swapchain::Device,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> std::result::Result<bool, vk::Result> {
        let _guard = self.lock();
        loader.queue_present(self.graphics_queue, present_info)
    }

    /// Write descriptors in one batched call.
    ///
    /// # Safety
    /// The destination sets and referenced resources must be valid.
    pub unsafe fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        if writes.is_empty() {
            return;
        }
        let _guard = self.lock();
        self.device.update_descriptor_sets(writes, &[]);
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Allocator must release its memory before the device goes away
            let state = self.state.get_mut();
            if let Err(e) = state.allocator.shutdown() {
                tracing::error!("Allocator shutdown failed: {e}");
            }
            let stats = state.allocator.stats();
            if stats.num_allocations > 0 {
                tracing::warn!(
                    "{} allocations ({} bytes) still live at device teardown",
                    stats.num_allocations,
                    stats.total_bytes
                );
            }
            state.allocator.backend_mut().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a [`GpuDevice`].
pub struct GpuDeviceBuilder {
    app_name: String,
    enable_validation: bool,
    headless: bool,
    present_target: Option<(RawDisplayHandle, RawWindowHandle)>,
}

impl Default for GpuDeviceBuilder {
    fn default() -> Self {
        Self {
            app_name: "Lucre".to_string(),
            enable_validation: cfg!(debug_assertions),
            headless: false,
            present_target: None,
        }
    }
}

impl GpuDeviceBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Skip surface and swapchain extensions (offscreen rendering only).
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// Only accept a graphics queue that can present to `window`.
    ///
    /// The window must stay alive until [`Self::build`] returns.
    pub fn present_to<W>(mut self, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;
        self.present_target = Some((display.as_raw(), window.as_raw()));
        Ok(self)
    }

    /// Build the device.
    pub fn build(self) -> Result<GpuDevice> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe {
            create_instance(&entry, &self.app_name, self.enable_validation, self.headless)
        }?;

        let physical_device = unsafe { select_physical_device(&instance) }?;
        let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };

        let mut missing = capabilities.missing_requirements();
        if self.headless {
            missing.retain(|m| *m != "VK_KHR_swapchain");
        }
        if !missing.is_empty() {
            return Err(GpuError::CapabilityMissing(missing.join(", ")));
        }

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let depth_format = pick_depth_format(&DEPTH_FORMAT_CANDIDATES, |format| unsafe {
            instance
                .get_physical_device_format_properties(physical_device, format)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .ok_or_else(|| GpuError::CapabilityMissing("depth attachment format".to_string()))?;
        tracing::info!("Depth format: {:?}", depth_format);

        let present_target = if self.headless { None } else { self.present_target };
        let graphics_queue_family = unsafe {
            find_graphics_queue_family(&entry, &instance, physical_device, present_target)
        }?;

        let (device, graphics_queue) = unsafe {
            create_device(
                &instance,
                physical_device,
                graphics_queue_family,
                &capabilities,
                self.headless,
            )?
        };
        let device = Arc::new(device);

        let backend = unsafe { GpuMemoryBackend::new(&instance, device.clone(), physical_device) }?;
        let allocator = MemoryAllocator::new(backend, MAX_FRAMES_IN_FLIGHT);

        Ok(GpuDevice {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            depth_format,
            graphics_queue_family,
            graphics_queue,
            headless: self.headless,
            state: Mutex::new(DeviceState { allocator }),
        })
    }
}

/// First candidate the device supports as a depth attachment.
pub fn pick_depth_format(
    candidates: &[vk::Format],
    supports: impl Fn(vk::Format) -> bool,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| supports(format))
}

/// Whether a depth format also carries stencil.
pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D16_UNORM_S8_UINT
    )
}

/// First graphics family for which `can_present` holds.
pub fn pick_queue_family(
    families: &[vk::QueueFamilyProperties],
    can_present: impl Fn(u32) -> bool,
) -> Option<u32> {
    families
        .iter()
        .enumerate()
        .filter(|(_, family)| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|(i, _)| i as u32)
        .find(|&i| can_present(i))
}

/// Find the graphics queue family, one that presents to the window when given.
///
/// # Safety
/// The instance and physical device must be valid, and so must the window
/// handles if any.
unsafe fn find_graphics_queue_family(
    entry: &ash::Entry,
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    present_target: Option<(RawDisplayHandle, RawWindowHandle)>,
) -> Result<u32> {
    let families = instance.get_physical_device_queue_family_properties(physical_device);

    let Some((display, window)) = present_target else {
        return pick_queue_family(&families, |_| true)
            .ok_or_else(|| GpuError::CapabilityMissing("graphics queue".to_string()));
    };

    // A throwaway surface answers the present-support query before the real one exists
    let surface = ash_window::create_surface(entry, instance, display, window, None)
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
    let loader = ash::khr::surface::Instance::new(entry, instance);
    let picked = pick_queue_family(&families, |family| {
        // SAFETY: the surface is destroyed only after the search
        unsafe { loader.get_physical_device_surface_support(physical_device, family, surface) }
            .unwrap_or(false)
    });
    loader.destroy_surface(surface, None);

    picked.ok_or_else(|| {
        GpuError::CapabilityMissing("graphics queue with present support".to_string())
    })
}

/// Required device extensions.
fn required_device_extensions(headless: bool) -> Vec<&'static CStr> {
    let mut extensions = Vec::new();
    if !headless {
        extensions.push(ash::khr::swapchain::NAME);
    }
    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_subset::NAME);
    extensions
}

/// Create the logical device and retrieve the graphics queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    graphics_queue_family: u32,
    capabilities: &GpuCapabilities,
    headless: bool,
) -> Result<(ash::Device, vk::Queue)> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(graphics_queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let extensions = required_device_extensions(headless);
    let extension_names: Vec<*const std::ffi::c_char> =
        extensions.iter().map(|ext| ext.as_ptr()).collect();

    // Timeline semaphores, device addresses, and the bindless descriptor-indexing set
    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .timeline_semaphore(true)
        .buffer_device_address(true)
        .descriptor_indexing(true)
        .runtime_descriptor_array(true)
        .descriptor_binding_partially_bound(true)
        .descriptor_binding_variable_descriptor_count(true)
        .descriptor_binding_sampled_image_update_after_bind(true)
        .descriptor_binding_storage_image_update_after_bind(true)
        .shader_sampled_image_array_non_uniform_indexing(true);

    let features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(capabilities.supports_anisotropy)
        .shader_int64(capabilities.supports_shader_int64);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(GpuError::from)?;

    let graphics_queue = device.get_device_queue(graphics_queue_family, 0);

    Ok((device, graphics_queue))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_format_prefers_d32() {
        let picked = pick_depth_format(&DEPTH_FORMAT_CANDIDATES, |_| true);
        assert_eq!(picked, Some(vk::Format::D32_SFLOAT));
    }

    #[test]
    fn depth_format_falls_back_in_order() {
        let picked = pick_depth_format(&DEPTH_FORMAT_CANDIDATES, |f| {
            f == vk::Format::D24_UNORM_S8_UINT || f == vk::Format::D32_SFLOAT_S8_UINT
        });
        assert_eq!(picked, Some(vk::Format::D32_SFLOAT_S8_UINT));
    }

    #[test]
    fn no_depth_format_is_none() {
        assert_eq!(pick_depth_format(&DEPTH_FORMAT_CANDIDATES, |_| false), None);
    }

    #[test]
    fn stencil_formats() {
        assert!(!has_stencil(vk::Format::D32_SFLOAT));
        assert!(has_stencil(vk::Format::D24_UNORM_S8_UINT));
    }

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn queue_family_skips_graphics_families_that_cannot_present() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS),
        ];
        assert_eq!(pick_queue_family(&families, |_| true), Some(1));
        assert_eq!(pick_queue_family(&families, |i| i == 3), Some(3));
        // Presenting compute-only families do not count
        assert_eq!(pick_queue_family(&families, |i| i == 2), None);
    }

    #[test]
    fn headless_devices_skip_swapchain_extension() {
        assert!(!required_device_extensions(true).contains(&ash::khr::swapchain::NAME));
        assert!(required_device_extensions(false).contains(&ash::khr::swapchain::NAME));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn headless_device_creation() {
        let device = GpuDeviceBuilder::new()
            .validation(false)
            .headless(true)
            .build()
            .expect("Failed to create device");
        assert!(device.is_headless());
        assert!(DEPTH_FORMAT_CANDIDATES.contains(&device.depth_format()));
        device.wait_idle().unwrap();
    }
}
