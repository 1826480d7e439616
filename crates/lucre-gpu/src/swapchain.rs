//! Swapchain management.
//!
//! The swapchain owns the per-frame synchronization: an image-available and a
//! render-finished semaphore plus an in-flight fence for each of the
//! `MAX_FRAMES_IN_FLIGHT` slots, and a record of which fence last used each image.

use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use crate::image::{create_raw_view, subresource_range};
use crate::surface::SurfaceContext;
use crate::sync::{wait_for_fence, FrameSync};
use ash::vk;
use lucre_core::constants::MAX_FRAMES_IN_FLIGHT;

/// Outcome of acquiring an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStatus {
    /// An image was acquired; `suboptimal` asks for a rebuild after presenting.
    Acquired { image_index: u32, suboptimal: bool },
    /// No image was acquired; the swapchain must be rebuilt before rendering.
    OutOfDate,
}

/// Outcome of presenting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    Suboptimal,
    OutOfDate,
}

impl PresentStatus {
    /// Whether the swapchain should be rebuilt.
    pub fn needs_rebuild(self) -> bool {
        !matches!(self, Self::Presented)
    }
}

/// Swapchain wrapper.
pub struct Swapchain {
    loader: ash::khr::swapchain::Device,
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    frames: Vec<FrameSync>,
    images_in_flight: Vec<vk::Fence>,
    current_frame: usize,
}

impl Swapchain {
    /// Create a swapchain for `surface`.
    ///
    /// When `old` is given its handle is passed on so the driver can reuse
    /// resources; the caller destroys `old` afterwards.
    ///
    /// # Safety
    /// The surface must belong to `gpu`; `old` must not be in use.
    pub unsafe fn new(
        gpu: &GpuDevice,
        surface: &SurfaceContext,
        width: u32,
        height: u32,
        vsync: bool,
        old: Option<&Swapchain>,
    ) -> Result<Self> {
        let device = gpu.device();
        let caps = surface.capabilities(gpu)?;
        if caps.formats.is_empty() {
            return Err(GpuError::SwapchainCreation(
                "Surface reports no formats".to_string(),
            ));
        }

        let format = select_surface_format(&caps.formats);
        let present_mode = select_present_mode(&caps.present_modes, vsync);
        let extent = calculate_extent(&caps.capabilities, width, height);
        let image_count = select_image_count(&caps.capabilities);

        let loader = surface.swapchain_loader.clone();
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |s| s.swapchain));

        let swapchain = loader
            .create_swapchain(&create_info, None)
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let images = loader.get_swapchain_images(swapchain)?;

        let image_views = images
            .iter()
            .map(|&image| {
                create_raw_view(
                    device,
                    image,
                    format.format,
                    vk::ImageViewType::TYPE_2D,
                    subresource_range(format.format, 0, 1, 0, 1),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let mut frames = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            frames.push(FrameSync::new(device)?);
        }

        tracing::info!(
            "Swapchain created: {}x{} {:?} {:?} ({} images)",
            extent.width,
            extent.height,
            format.format,
            present_mode,
            images.len()
        );

        Ok(Self {
            loader,
            swapchain,
            images_in_flight: vec![vk::Fence::null(); images.len()],
            images,
            image_views,
            format,
            present_mode,
            extent,
            frames,
            current_frame: 0,
        })
    }

    /// Index of the frame slot being recorded, in `[0, MAX_FRAMES_IN_FLIGHT)`.
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Number of swapchain images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Width over height.
    pub fn aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height.max(1) as f32
    }

    /// Wait for the current slot's fence, then acquire the next image.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn acquire_next(&self, gpu: &GpuDevice) -> Result<AcquireStatus> {
        let frame = &self.frames[self.current_frame];
        frame.wait(gpu.device())?;

        let result = self.loader.acquire_next_image(
            self.swapchain,
            u64::MAX,
            frame.image_available,
            vk::Fence::null(),
        );

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireStatus::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireStatus::OutOfDate),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Submit `cmd` for the current slot and present `image_index`.
    ///
    /// Waits on image-available at color-attachment output, signals render-finished,
    /// fences the slot, then advances to the next slot.
    ///
    /// # Safety
    /// `cmd` must be fully recorded and `image_index` must come from [`Self::acquire_next`].
    pub unsafe fn submit_and_present(
        &mut self,
        gpu: &GpuDevice,
        cmd: vk::CommandBuffer,
        image_index: u32,
    ) -> Result<PresentStatus> {
        let device = gpu.device();
        let frame = &self.frames[self.current_frame];

        // A previous slot may still be rendering into this image
        let image_fence = self.images_in_flight[image_index as usize];
        if image_fence != vk::Fence::null() && image_fence != frame.in_flight {
            wait_for_fence(device, image_fence, u64::MAX)?;
        }
        self.images_in_flight[image_index as usize] = frame.in_flight;

        frame.reset(device)?;

        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [frame.render_finished];
        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        gpu.submit(&[submit_info], frame.in_flight)?;

        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let status = match gpu.present(&self.loader, &present_info) {
            Ok(false) => PresentStatus::Presented,
            Ok(true) => PresentStatus::Suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => PresentStatus::OutOfDate,
            Err(e) => return Err(GpuError::from(e)),
        };

        self.current_frame = (self.current_frame + 1) % MAX_FRAMES_IN_FLIGHT;
        Ok(status)
    }

    /// Drop the current slot's frame after a successful acquire.
    ///
    /// An empty batch waits on image-available so the semaphore has no pending
    /// signal and the slot's fence is signaled again. The image itself stays
    /// acquired until the swapchain is recreated.
    ///
    /// # Safety
    /// [`Self::acquire_next`] must have returned an image for the current slot
    /// and nothing may have been submitted for it since.
    pub unsafe fn release_acquired(&self, gpu: &GpuDevice) -> Result<()> {
        let frame = &self.frames[self.current_frame];
        frame.reset(gpu.device())?;

        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages);
        gpu.submit(&[submit_info], frame.in_flight)
    }

    /// Whether render passes built against `other` still fit this swapchain.
    pub fn compare_formats(&self, other: &Swapchain) -> bool {
        formats_match(self.format, other.format)
    }

    /// Wait for every slot's fence.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait_all_frames(&self, device: &ash::Device) -> Result<()> {
        for frame in &self.frames {
            frame.wait(device)?;
        }
        Ok(())
    }

    /// Destroy the swapchain and its synchronization objects.
    ///
    /// # Safety
    /// Nothing may still be using the swapchain.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        for frame in &self.frames {
            frame.destroy(device);
        }
        for &view in &self.image_views {
            device.destroy_image_view(view, None);
        }
        self.loader.destroy_swapchain(self.swapchain, None);
    }
}

/// Whether two surface formats produce render-pass compatible images.
pub fn formats_match(a: vk::SurfaceFormatKHR, b: vk::SurfaceFormatKHR) -> bool {
    a.format == b.format && a.color_space == b.color_space
}

/// Select the best surface format.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    available
        .iter()
        .copied()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first().copied())
        .unwrap_or(vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        })
}

/// Select the present mode.
///
/// With vsync, FIFO_RELAXED is preferred over FIFO. Without it, MAILBOX then
/// IMMEDIATE are tried before falling back to the vsync order.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    let preference: &[vk::PresentModeKHR] = if vsync {
        &[vk::PresentModeKHR::FIFO_RELAXED]
    } else {
        &[
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::FIFO_RELAXED,
        ]
    };

    preference
        .iter()
        .copied()
        .find(|mode| available.contains(mode))
        // FIFO is always supported
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One more image than the minimum, capped by the maximum (0 means unbounded).
pub fn select_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        wanted.min(capabilities.max_image_count)
    } else {
        wanted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn prefers_bgra_srgb() {
        let available = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(select_surface_format(&available), available[1]);
    }

    #[test]
    fn falls_back_to_first_format() {
        let available = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(select_surface_format(&available), available[0]);
    }

    #[test]
    fn vsync_prefers_fifo_relaxed_then_fifo() {
        let with_relaxed = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::FIFO_RELAXED];
        assert_eq!(
            select_present_mode(&with_relaxed, true),
            vk::PresentModeKHR::FIFO_RELAXED
        );
        let fifo_only = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(select_present_mode(&fifo_only, true), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn no_vsync_prefers_mailbox() {
        let modes = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(select_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_is_clamped_when_surface_leaves_it_open() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 16,
                height: 16,
            },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 768,
            },
            ..Default::default()
        };
        let extent = calculate_extent(&caps, 4000, 8);
        assert_eq!((extent.width, extent.height), (1024, 16));
    }

    #[test]
    fn fixed_surface_extent_wins() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        let extent = calculate_extent(&caps, 1920, 1080);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn image_count_respects_maximum() {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 2,
            ..Default::default()
        };
        assert_eq!(select_image_count(&caps), 2);
        let unbounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(select_image_count(&unbounded), 3);
    }

    #[test]
    fn format_comparison_after_resize() {
        let srgb = format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        let unorm = format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        assert!(formats_match(srgb, srgb));
        assert!(!formats_match(srgb, unorm));
    }

    #[test]
    fn only_presented_frames_skip_rebuild() {
        assert!(!PresentStatus::Presented.needs_rebuild());
        assert!(PresentStatus::Suboptimal.needs_rebuild());
        assert!(PresentStatus::OutOfDate.needs_rebuild());
    }
}
